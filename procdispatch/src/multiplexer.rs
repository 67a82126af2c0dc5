// Copyright (c) 2024-2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! §4.4 blocking readiness multiplexer, used by `wait_one`/`wait_all`/
//! `wait_pid` whenever no [`crate::event_loop::EventLoopAdapter`] is
//! attached. Built on `mio::Poll`, the same readiness-polling primitive the
//! teacher's PTY subsystem uses to multiplex its own child reads.

use std::collections::HashMap;
use std::io::BufReader;
use std::os::fd::{AsRawFd, OwnedFd};

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use nix::unistd::Pid;

use crate::error::{DispatchError, DispatchResult};
use crate::fork;
use crate::frame::{self, Frame};

/// One child the multiplexer may currently wait on: its pid (for reaping)
/// and its result pipe's read end.
pub struct PendingChild {
    pub pid: Pid,
    pub read_end: OwnedFd,
}

/// Blocks until at least one of `children` is readable, consumes exactly one
/// frame from exactly one of them, reaps that child, and returns its pid and
/// frame.
///
/// Resolves the second Open Question of §9: even if `mio::Poll::poll`
/// reports several children ready in the same batch, only the first one
/// encountered is read and reaped here — the rest remain registered and
/// ready for the next call.
///
/// # Errors
/// Returns [`DispatchError::TransportError`] if polling or reading fails,
/// or [`DispatchError::Fork`] if reaping the selected child fails.
pub fn wait_for_one(children: &[PendingChild]) -> DispatchResult<(Pid, Frame)> {
    debug_assert!(!children.is_empty(), "wait_for_one called with no pending children");

    let mut poll = Poll::new().map_err(|e| DispatchError::TransportError { detail: e.to_string() })?;
    let mut tokens = HashMap::with_capacity(children.len());
    for (i, child) in children.iter().enumerate() {
        let token = Token(i);
        let raw = child.read_end.as_raw_fd();
        poll.registry()
            .register(&mut SourceFd(&raw), token, Interest::READABLE)
            .map_err(|e| DispatchError::TransportError { detail: e.to_string() })?;
        tokens.insert(token, child);
    }

    let mut events = Events::with_capacity(children.len());
    loop {
        poll.poll(&mut events, None)
            .map_err(|e| DispatchError::TransportError { detail: e.to_string() })?;
        if let Some(event) = events.iter().next() {
            let child = tokens
                .get(&event.token())
                .expect("mio reported a token we never registered");
            let cloned = child
                .read_end
                .try_clone()
                .map_err(|e| DispatchError::TransportError { detail: e.to_string() })?;
            let mut reader = BufReader::new(std::fs::File::from(cloned));
            let frame = frame::read_frame(&mut reader)?;
            fork::reap_blocking(child.pid)?;
            return Ok((child.pid, frame));
        }
    }
}
