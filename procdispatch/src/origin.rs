// Copyright (c) 2024-2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Submission provenance — see the "`caller()` provenance" design note: rather
//! than reconstruct the submission site by walking the stack at failure time,
//! every public entry point is `#[track_caller]` and captures an [`Origin`]
//! immediately, at the moment of submission.

use std::fmt;

/// The source location a work item was submitted from, used to compose the
/// `ChildFailure` message: `"Child (created at <file> line <line>) died with
/// error: ..."`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Origin {
    pub file: &'static str,
    pub line: u32,
}

impl Origin {
    /// Captures the caller's location. Call sites that want the *submission*
    /// site (not their own) should be `#[track_caller]` themselves and call
    /// this from inside their body.
    #[track_caller]
    #[must_use]
    pub fn here() -> Self {
        let loc = std::panic::Location::caller();
        Self { file: loc.file(), line: loc.line() }
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} line {}", self.file, self.line)
    }
}
