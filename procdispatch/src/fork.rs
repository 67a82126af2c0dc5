// Copyright (c) 2024-2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Raw `fork()` / `pipe()` / `waitpid()` primitives, and the post-fork child
//! bootstrap (§5): closing inherited read ends of sibling pipes and
//! resetting any nested dispatchers before the child runner takes over.
//!
//! This module, not `std::process::Command`, is the crate's actual process
//! boundary: the work submitted to a [`crate::dispatcher::Dispatcher`] is an
//! in-process Rust closure, not an external program, so the child must be a
//! forked copy of this process rather than an exec'd one.

use std::os::fd::{OwnedFd, RawFd};

use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, pipe, ForkResult, Pid};

use crate::error::{DispatchError, DispatchResult};
use crate::registry;

/// An anonymous pipe's two owned ends. Each end closes its descriptor when
/// dropped.
pub struct PipeEnds {
    pub read: OwnedFd,
    pub write: OwnedFd,
}

/// Opens a fresh anonymous pipe for a child's result frame.
///
/// # Errors
/// Returns [`DispatchError::Pipe`] if the underlying `pipe(2)` call fails
/// (typically because the process is out of file descriptors).
pub fn open_pipe() -> DispatchResult<PipeEnds> {
    let (read, write) = pipe().map_err(DispatchError::Pipe)?;
    Ok(PipeEnds { read, write })
}

/// Which side of a fork this call returned into.
pub enum ForkOutcome {
    Parent { child_pid: Pid },
    Child,
}

/// Forks the current process.
///
/// # Safety
/// Only async-signal-safe work is sound between `fork()` returning in the
/// child and that child calling [`bootstrap_child`] and then either running
/// the submitted closure or calling `std::process::exit`. Callers must not
/// interleave arbitrary allocating or lock-taking code of their own on the
/// child path before `bootstrap_child` runs.
///
/// # Errors
/// Returns [`DispatchError::Fork`] if `fork(2)` fails.
pub fn raw_fork() -> DispatchResult<ForkOutcome> {
    // SAFETY: see module and function documentation; the child path executes
    // only `bootstrap_child` followed by the child runner.
    match unsafe { fork() }.map_err(DispatchError::Fork)? {
        ForkResult::Parent { child, .. } => Ok(ForkOutcome::Parent { child_pid: child }),
        ForkResult::Child => Ok(ForkOutcome::Child),
    }
}

/// Runs in the child, before any work executes: closes every inherited read
/// end that belongs to a sibling child (this child only needs its own write
/// end) and resets any nested dispatcher's bookkeeping via the process-wide
/// registry (§4.8), since pids and fds inherited from the parent's address
/// space describe children that belong to the parent, not to this process.
pub fn bootstrap_child(sibling_read_ends: impl IntoIterator<Item = RawFd>) {
    for fd in sibling_read_ends {
        // Best effort: a double-close or already-invalid fd is not fatal to
        // a child that is about to run work and exit.
        let _ = nix::unistd::close(fd);
    }
    registry::reset_after_fork();
}

/// Blocks until `pid` exits, reaping it. Used to avoid zombies once a
/// child's result frame has already been read.
///
/// # Errors
/// Returns [`DispatchError::Fork`] if `waitpid(2)` itself fails (the pid
/// does not exist or does not belong to this process).
pub fn reap_blocking(pid: Pid) -> DispatchResult<WaitStatus> {
    waitpid(pid, None).map_err(DispatchError::Fork)
}

/// Non-blocking reap: returns `Ok(None)` if `pid` has not exited yet.
///
/// # Errors
/// Returns [`DispatchError::Fork`] if `waitpid(2)` itself fails.
pub fn try_reap(pid: Pid) -> DispatchResult<Option<WaitStatus>> {
    match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
        Ok(WaitStatus::StillAlive) => Ok(None),
        Ok(status) => Ok(Some(status)),
        Err(e) => Err(DispatchError::Fork(e)),
    }
}
