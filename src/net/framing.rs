//! Length-prefixed TCP framing.
//!
//! Each frame is a little-endian u32 payload length followed by the payload.
//! Reads honour the stream's receive timeout so server loops stay responsive
//! to shutdown.

use std::io::{ErrorKind, Read, Write};
use std::net::TcpStream;

use crate::error::{Error, Result};

/// Upper bound on a single frame; anything larger is a protocol error.
const MAX_FRAME_BYTES: u32 = 256 * 1024 * 1024;

pub fn write_frame(stream: &mut TcpStream, payload: &[u8]) -> Result<()> {
    stream.write_all(&(payload.len() as u32).to_le_bytes())?;
    stream.write_all(payload)?;
    stream.flush()?;
    Ok(())
}

/// Read one frame.
///
/// Returns `Ok(None)` when the receive timeout expires with no data,
/// `Err(Disconnected)` on a closed stream.
pub fn read_frame(stream: &mut TcpStream) -> Result<Option<Vec<u8>>> {
    let mut len_bytes = [0u8; 4];
    match stream.read_exact(&mut len_bytes) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {
            return Ok(None);
        }
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Err(Error::Disconnected),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_le_bytes(len_bytes);
    if len > MAX_FRAME_BYTES {
        return Err(Error::Protocol(format!("oversized frame: {} bytes", len)));
    }

    let mut payload = vec![0u8; len as usize];
    match stream.read_exact(&mut payload) {
        Ok(()) => Ok(Some(payload)),
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => Err(Error::Disconnected),
        Err(e) => Err(e.into()),
    }
}
