//! Length-prefixed JSON frames.
//!
//! Every message is a 4-byte big-endian length followed by that many bytes of
//! UTF-8 JSON. Frames above [`MAX_FRAME_LEN`] are rejected in both directions.

use std::io::{self, ErrorKind, Read, Write};
use std::time::Duration;

use pvr_domain::{ChildMessage, HostMessage};
use serde::Serialize;

use crate::error::{Result, RunnerError};

pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Message transport between the host and one child.
pub trait FrameChannel {
    /// Delivers one frame, waiting at most `timeout` for it to be written.
    /// A frame that cannot be written in time is `CallTimeout`.
    fn send(&mut self, message: &HostMessage, timeout: Duration) -> Result<()>;

    /// Waits up to `timeout` for the next message. `Ok(None)` means nothing
    /// arrived in time; a closed channel is `ProcessCrashed`.
    fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<ChildMessage>>;
}

pub fn write_frame<W: Write>(writer: &mut W, payload: &[u8]) -> io::Result<()> {
    if payload.len() > MAX_FRAME_LEN {
        return Err(io::Error::new(
            ErrorKind::InvalidInput,
            format!("frame of {} bytes exceeds {MAX_FRAME_LEN}", payload.len()),
        ));
    }
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(ErrorKind::InvalidInput, "frame too large"))?;
    writer.write_all(&len.to_be_bytes())?;
    writer.write_all(payload)?;
    writer.flush()
}

/// Reads one frame. `Ok(None)` on a clean end of stream between frames.
pub fn read_frame<R: Read>(reader: &mut R) -> io::Result<Option<Vec<u8>>> {
    let mut prefix = [0_u8; 4];
    let mut filled = 0;
    while filled < prefix.len() {
        match reader.read(&mut prefix[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => {
                return Err(io::Error::new(
                    ErrorKind::UnexpectedEof,
                    "stream ended inside a frame header",
                ))
            }
            Ok(read) => filled += read,
            Err(err) if err.kind() == ErrorKind::Interrupted => {}
            Err(err) => return Err(err),
        }
    }
    let len = u32::from_be_bytes(prefix) as usize;
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds {MAX_FRAME_LEN}"),
        ));
    }
    let mut payload = vec![0_u8; len];
    reader.read_exact(&mut payload)?;
    Ok(Some(payload))
}

pub fn encode_message<T: Serialize>(message: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(message)
        .map_err(|err| RunnerError::Protocol(format!("cannot encode message: {err}")))
}

pub fn decode_child_message(payload: &[u8]) -> Result<ChildMessage> {
    serde_json::from_slice(payload).map_err(|err| {
        let preview: String = String::from_utf8_lossy(payload).chars().take(120).collect();
        RunnerError::Protocol(format!("garbled frame ({err}): {preview}"))
    })
}
