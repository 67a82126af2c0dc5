// Copyright (c) 2024-2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! §4.3 wire frame: `TYPE\nSIZE\nPAYLOAD`, one frame per child, read and
//! written over the anonymous pipe connecting a child to its parent.

use std::io::{BufRead, Read, Write};

use crate::error::{DispatchError, DispatchResult};

/// Resolves the first Open Question of §9: an unbounded decimal `SIZE` line
/// is a denial-of-service surface, so this crate caps it outright.
pub const MAX_PAYLOAD_BYTES: usize = 64 * 1024 * 1024;

/// The `TYPE` line of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display, strum_macros::EnumString)]
pub enum FrameType {
    #[strum(serialize = "RESULT")]
    Result,
    #[strum(serialize = "ERROR")]
    Error,
}

/// A fully-read frame: its type and raw payload bytes (still codec-encoded).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameType,
    pub payload: Vec<u8>,
}

/// Writes one frame to `w`. Used by the child runner to send exactly one
/// `RESULT` or `ERROR` frame before it exits.
///
/// # Errors
/// Returns [`DispatchError::TransportError`] on any underlying I/O failure.
pub fn write_frame<W: Write>(w: &mut W, kind: FrameType, payload: &[u8]) -> DispatchResult<()> {
    write!(w, "{kind}\n{}\n", payload.len())
        .map_err(|e| DispatchError::TransportError { detail: e.to_string() })?;
    w.write_all(payload)
        .map_err(|e| DispatchError::TransportError { detail: e.to_string() })?;
    w.flush().map_err(|e| DispatchError::TransportError { detail: e.to_string() })
}

/// Reads one complete frame from `r`, blocking until it arrives or the pipe
/// is closed.
///
/// # Errors
/// Returns [`DispatchError::TransportError`] if the pipe closes before a
/// complete frame arrives, the `SIZE` line is not a valid decimal, or the
/// declared size exceeds [`MAX_PAYLOAD_BYTES`].
pub fn read_frame<R: BufRead>(r: &mut R) -> DispatchResult<Frame> {
    let kind = read_line_field(r)?
        .parse::<FrameType>()
        .map_err(|e| DispatchError::TransportError { detail: e.to_string() })?;

    let size_line = read_line_field(r)?;
    let size: usize = size_line
        .parse()
        .map_err(|_| DispatchError::TransportError { detail: format!("malformed SIZE line: {size_line:?}") })?;
    if size > MAX_PAYLOAD_BYTES {
        return Err(DispatchError::TransportError {
            detail: format!("payload of {size} bytes exceeds the {MAX_PAYLOAD_BYTES}-byte cap"),
        });
    }

    let mut payload = vec![0u8; size];
    r.read_exact(&mut payload)
        .map_err(|e| DispatchError::TransportError { detail: format!("reading payload: {e}") })?;
    Ok(Frame { kind, payload })
}

fn read_line_field<R: BufRead>(r: &mut R) -> DispatchResult<String> {
    let mut line = String::new();
    let n = r
        .read_line(&mut line)
        .map_err(|e| DispatchError::TransportError { detail: e.to_string() })?;
    if n == 0 {
        return Err(DispatchError::TransportError {
            detail: "pipe closed before a complete frame arrived".to_string(),
        });
    }
    Ok(line.trim_end_matches('\n').to_string())
}
