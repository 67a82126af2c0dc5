// Copyright (c) 2024-2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! The error taxonomy for the dispatcher: [`DispatchError`] and the
//! [`DispatchResult`] alias used throughout the crate.

use crate::origin::Origin;

/// Convenience alias — every fallible public operation returns this.
pub type DispatchResult<T> = miette::Result<T, DispatchError>;

/// Everything that can go wrong between a host submitting work and collecting
/// its result.
///
/// `DispatcherStateWarning` is deliberately not a variant here: it is never
/// returned, only emitted via `tracing::warn!` at teardown, since destructors
/// cannot propagate errors.
#[derive(thiserror::Error, Debug, miette::Diagnostic)]
pub enum DispatchError {
    #[error("invalid argument: {reason}")]
    InvalidArgument { reason: String },

    #[error("child (created at {origin}) died with error: {detail}")]
    ChildFailure { origin: Origin, detail: String },

    #[error("child (created at {origin}) returned a value the codec could not encode: {detail}")]
    UnserializableResult { origin: Origin, detail: String },

    #[error("could not read child data: {detail}")]
    TransportError { detail: String },

    #[error("fork() failed: {0}")]
    Fork(#[source] nix::Error),

    #[error("pipe() failed: {0}")]
    Pipe(#[source] nix::Error),
}

impl DispatchError {
    pub(crate) fn invalid_argument(reason: impl Into<String>) -> Self {
        Self::InvalidArgument { reason: reason.into() }
    }
}
