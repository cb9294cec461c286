//! Client-side error taxonomy.
//!
//! Refusals keep the control socket open; protocol failures close it and
//! require a fresh [`crate::Client::init`]. Backpressure and placeholder
//! conditions are not errors at all — they surface as `None`/empty
//! results on the operations themselves.

use std::fmt;
use std::io;

#[derive(Debug)]
pub enum ClientError {
    /// Operation before `init` or after the control socket was lost.
    NotConnected,
    /// The control socket produced something unparseable; the socket has
    /// been closed.
    Protocol(String),
    /// The broker refused the operation. Surfaced verbatim; the socket
    /// stays open and no broker state changed.
    Refused(String),
    /// No slot could be found for an unreliable publisher, even by
    /// overwriting the oldest unreferenced message.
    OutOfSlots(String),
    /// The API was driven out of order (publish without a buffer, wait on
    /// an unreliable publisher, payload larger than the slot).
    Usage(String),
    Io(io::Error),
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotConnected => {
                write!(f, "not connected to the broker; call init() first")
            }
            Self::Protocol(e) => write!(f, "control protocol error: {e}"),
            Self::Refused(e) => write!(f, "broker refused: {e}"),
            Self::OutOfSlots(channel) => write!(f, "out of slots for channel {channel}"),
            Self::Usage(e) => write!(f, "{e}"),
            Self::Io(e) => write!(f, "io error: {e}"),
        }
    }
}

impl std::error::Error for ClientError {}

impl From<io::Error> for ClientError {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}
