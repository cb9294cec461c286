//! Length-prefixed frames on the control socket.
//!
//! Every frame is a 4-byte little-endian length followed by a postcard
//! body. The broker reads with the async variants; the client library is
//! synchronous and uses the blocking ones. A malformed frame is fatal for
//! the connection — callers close the socket rather than resynchronize.

use std::fmt;
use std::io::{self, Read, Write};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{Request, Response};

/// Upper bound on a control frame. Control messages are small; anything
/// bigger is a protocol violation, not a big message.
pub const MAX_FRAME: usize = 64 * 1024;

/// Framing or serialization failure on the control socket.
#[derive(Debug)]
pub enum FrameError {
    Io(io::Error),
    /// Advertised length exceeds [`MAX_FRAME`].
    Oversized(usize),
    /// Postcard body failed to encode or decode.
    Codec(String),
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "io error: {e}"),
            Self::Oversized(len) => write!(f, "frame of {len} bytes exceeds limit"),
            Self::Codec(e) => write!(f, "codec error: {e}"),
        }
    }
}

impl std::error::Error for FrameError {}

impl From<io::Error> for FrameError {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

/// Encode a request body.
pub fn encode_request(req: &Request) -> Result<Vec<u8>, FrameError> {
    facet_postcard::to_vec(req).map_err(|e| FrameError::Codec(e.to_string()))
}

/// Decode a request body.
pub fn decode_request(bytes: &[u8]) -> Result<Request, FrameError> {
    facet_postcard::from_slice(bytes).map_err(|e| FrameError::Codec(e.to_string()))
}

/// Encode a response body.
pub fn encode_response(resp: &Response) -> Result<Vec<u8>, FrameError> {
    facet_postcard::to_vec(resp).map_err(|e| FrameError::Codec(e.to_string()))
}

/// Decode a response body.
pub fn decode_response(bytes: &[u8]) -> Result<Response, FrameError> {
    facet_postcard::from_slice(bytes).map_err(|e| FrameError::Codec(e.to_string()))
}

/// Write one frame, blocking.
pub fn write_frame(stream: &mut impl Write, body: &[u8]) -> Result<(), FrameError> {
    if body.len() > MAX_FRAME {
        return Err(FrameError::Oversized(body.len()));
    }
    stream.write_all(&(body.len() as u32).to_le_bytes())?;
    stream.write_all(body)?;
    stream.flush()?;
    Ok(())
}

/// Read one frame, blocking.
pub fn read_frame(stream: &mut impl Read) -> Result<Vec<u8>, FrameError> {
    let mut len = [0u8; 4];
    stream.read_exact(&mut len)?;
    let len = u32::from_le_bytes(len) as usize;
    if len > MAX_FRAME {
        return Err(FrameError::Oversized(len));
    }
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body)?;
    Ok(body)
}

/// Write one frame on an async stream.
pub async fn write_frame_async(
    stream: &mut (impl AsyncWrite + Unpin),
    body: &[u8],
) -> Result<(), FrameError> {
    if body.len() > MAX_FRAME {
        return Err(FrameError::Oversized(body.len()));
    }
    stream.write_all(&(body.len() as u32).to_le_bytes()).await?;
    stream.write_all(body).await?;
    stream.flush().await?;
    Ok(())
}

/// Read one frame on an async stream.
pub async fn read_frame_async(
    stream: &mut (impl AsyncRead + Unpin),
) -> Result<Vec<u8>, FrameError> {
    let mut len = [0u8; 4];
    stream.read_exact(&mut len).await?;
    let len = u32::from_le_bytes(len) as usize;
    if len > MAX_FRAME {
        return Err(FrameError::Oversized(len));
    }
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await?;
    Ok(body)
}
