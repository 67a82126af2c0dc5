// Copyright (c) 2024-2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! §4.7 event-loop integration: the `EventLoopAdapter` capability trait a
//! host can implement (or use one of the two bundled adapters) so that
//! waiting for a child's result does not block the dispatcher's caller.
//! Grounded on the teacher's `resilient_reactor_thread` dependency-injection
//! traits (`RRTFactory`/`RRTWorker`/`RRTWaker`): a small trait describing a
//! capability, with interchangeable concrete providers behind it.

use std::collections::HashMap;
use std::io::{Cursor, Read};
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::Mutex;

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use nix::unistd::Pid;

use crate::error::{DispatchError, DispatchResult};
use crate::fork;
use crate::frame::{self, Frame};

/// Invoked exactly once per registered child, with either its frame or the
/// transport error that prevented reading one.
pub type Completion = Box<dyn FnOnce(Pid, DispatchResult<Frame>) + Send>;

/// §4.7's capability trait: register a child's read end and be told, later,
/// when it completes. A [`crate::dispatcher::Dispatcher`] configured with an
/// adapter calls [`EventLoopAdapter::register_child`] instead of blocking on
/// [`crate::multiplexer::wait_for_one`].
pub trait EventLoopAdapter: Send + Sync {
    /// Registers `read_end` (belonging to `pid`) with the event loop. Once
    /// the child has written its frame and exited, the adapter reads it,
    /// reaps `pid`, and invokes `on_complete` exactly once.
    ///
    /// # Errors
    /// Returns [`DispatchError::TransportError`] if registration itself
    /// fails.
    fn register_child(&self, pid: Pid, read_end: OwnedFd, on_complete: Completion) -> DispatchResult<()>;
}

struct Registration {
    read_end: OwnedFd,
    pid: Pid,
    on_complete: Completion,
}

/// A standalone `mio`-backed adapter the host drives itself, by calling
/// [`MioEventLoop::turn`] from its own poll loop — the synchronous sibling
/// of [`TokioEventLoop`].
pub struct MioEventLoop {
    poll: Mutex<Poll>,
    pending: Mutex<HashMap<Token, Registration>>,
    next_token: Mutex<usize>,
}

impl MioEventLoop {
    /// # Errors
    /// Returns [`DispatchError::TransportError`] if the underlying
    /// `mio::Poll` cannot be created.
    pub fn new() -> DispatchResult<Self> {
        let poll = Poll::new().map_err(|e| DispatchError::TransportError { detail: e.to_string() })?;
        Ok(Self { poll: Mutex::new(poll), pending: Mutex::new(HashMap::new()), next_token: Mutex::new(0) })
    }

    /// Polls once, for up to `timeout` (blocking indefinitely if `None`),
    /// and fires a completion for every child that became ready.
    ///
    /// # Errors
    /// Returns [`DispatchError::TransportError`] if polling fails.
    pub fn turn(&self, timeout: Option<std::time::Duration>) -> DispatchResult<()> {
        let mut events = Events::with_capacity(16);
        self.poll
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .poll(&mut events, timeout)
            .map_err(|e| DispatchError::TransportError { detail: e.to_string() })?;

        for event in events.iter() {
            let registration = {
                let mut pending = self.pending.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
                pending.remove(&event.token())
            };
            if let Some(Registration { read_end, pid, on_complete }) = registration {
                on_complete(pid, read_frame_blocking(pid, &read_end));
            }
        }
        Ok(())
    }
}

impl EventLoopAdapter for MioEventLoop {
    fn register_child(&self, pid: Pid, read_end: OwnedFd, on_complete: Completion) -> DispatchResult<()> {
        let token = {
            let mut next = self.next_token.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            let token = Token(*next);
            *next += 1;
            token
        };

        let raw = read_end.as_raw_fd();
        self.poll
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .registry()
            .register(&mut SourceFd(&raw), token, Interest::READABLE)
            .map_err(|e| DispatchError::TransportError { detail: e.to_string() })?;

        self.pending
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(token, Registration { read_end, pid, on_complete });
        Ok(())
    }
}

fn read_frame_blocking(pid: Pid, read_end: &OwnedFd) -> DispatchResult<Frame> {
    let cloned = read_end.try_clone().map_err(|e| DispatchError::TransportError { detail: e.to_string() })?;
    let mut reader = std::io::BufReader::new(std::fs::File::from(cloned));
    let frame = frame::read_frame(&mut reader)?;
    fork::reap_blocking(pid)?;
    Ok(frame)
}

/// An adapter built on `tokio::io::unix::AsyncFd`, for hosts that already
/// run a tokio runtime: registering a child spawns a task on that runtime
/// which drains the pipe itself, so no `turn()` call is needed — the async
/// sibling of [`MioEventLoop`].
pub struct TokioEventLoop {
    handle: tokio::runtime::Handle,
}

impl TokioEventLoop {
    /// Children registered through this adapter are read on `handle`'s
    /// executor.
    #[must_use]
    pub fn new(handle: tokio::runtime::Handle) -> Self {
        Self { handle }
    }
}

impl EventLoopAdapter for TokioEventLoop {
    fn register_child(&self, pid: Pid, read_end: OwnedFd, on_complete: Completion) -> DispatchResult<()> {
        // SAFETY-equivalent precondition: `AsyncFd` requires a non-blocking fd.
        set_nonblocking(&read_end)?;
        let async_fd = tokio::io::unix::AsyncFd::with_interest(read_end, tokio::io::Interest::READABLE)
            .map_err(|e| DispatchError::TransportError { detail: e.to_string() })?;

        self.handle.spawn(async move {
            let outcome = drain_until_eof(async_fd).await.and_then(|bytes| {
                let mut cursor = Cursor::new(bytes);
                frame::read_frame(&mut cursor)
            });
            let outcome = match outcome {
                Ok(f) => fork::reap_blocking(pid).map(|_| f),
                Err(e) => Err(e),
            };
            on_complete(pid, outcome);
        });
        Ok(())
    }
}

fn set_nonblocking(fd: &OwnedFd) -> DispatchResult<()> {
    use nix::fcntl::{fcntl, FcntlArg, OFlag};
    let raw = fd.as_raw_fd();
    let current = fcntl(raw, FcntlArg::F_GETFL).map_err(|e| DispatchError::TransportError { detail: e.to_string() })?;
    let flags = OFlag::from_bits_truncate(current) | OFlag::O_NONBLOCK;
    fcntl(raw, FcntlArg::F_SETFL(flags)).map_err(|e| DispatchError::TransportError { detail: e.to_string() })?;
    Ok(())
}

/// Reads a child's pipe to completion: the child writes its one frame and
/// then exits, closing the write end, so end-of-file is the natural signal
/// that the whole frame has arrived.
async fn drain_until_eof(async_fd: tokio::io::unix::AsyncFd<OwnedFd>) -> DispatchResult<Vec<u8>> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        let mut guard = async_fd
            .readable()
            .await
            .map_err(|e| DispatchError::TransportError { detail: e.to_string() })?;
        let raw_read = |inner: &OwnedFd| -> std::io::Result<usize> {
            match nix::unistd::read(inner.as_raw_fd(), &mut chunk) {
                Ok(n) => Ok(n),
                Err(nix::Error::EAGAIN) => Err(std::io::Error::from(std::io::ErrorKind::WouldBlock)),
                Err(e) => Err(std::io::Error::from(e)),
            }
        };
        match guard.try_io(raw_read) {
            Ok(Ok(0)) => return Ok(buf),
            Ok(Ok(n)) => buf.extend_from_slice(&chunk[..n]),
            Ok(Err(e)) => return Err(DispatchError::TransportError { detail: e.to_string() }),
            Err(_would_block) => continue,
        }
    }
}
