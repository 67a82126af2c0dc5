// Copyright (c) 2024-2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! §4.2 Child Runner: the body a forked child executes. Runs the submitted
//! closure, catches panics the same way a thrown exception would be caught
//! in the source this crate generalizes, encodes the outcome, writes exactly
//! one frame, and exits successfully regardless of whether the work
//! succeeded — the exit code is not the channel for the work's outcome, the
//! frame is.

use std::os::fd::OwnedFd;
use std::panic::{self, AssertUnwindSafe};

use crate::codec::Codec;
use crate::frame::{self, FrameType};

/// Runs `work` inside a forked child and never returns: it always calls
/// `std::process::exit`, so a caller cannot accidentally run parent-side
/// cleanup on the child path by falling through.
pub fn run_and_exit<T, C, F>(write_end: OwnedFd, work: F) -> !
where
    F: FnOnce() -> T,
    C: Codec<T>,
{
    let mut pipe_file = std::fs::File::from(write_end);

    let (kind, payload) = match panic::catch_unwind(AssertUnwindSafe(work)) {
        Ok(value) => match C::encode(&value) {
            Ok(bytes) => (FrameType::Result, bytes),
            Err(e) => (FrameType::Error, e.to_string().into_bytes()),
        },
        Err(panic_payload) => (FrameType::Error, panic_message(&panic_payload).into_bytes()),
    };

    // Best effort: if the pipe write itself fails, there is no remaining
    // channel for the child to report that failure through.
    let _ = frame::write_frame(&mut pipe_file, kind, &payload);
    std::process::exit(0);
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "child panicked with a non-string payload".to_string()
    }
}
