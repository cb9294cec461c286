//! The blocking control-socket connection shared by every handle a
//! `Client` creates.
//!
//! One request/response round trip at a time; descriptors arrive as a run
//! of `SCM_RIGHTS` messages right after the response frame, counted by the
//! response body. Any framing or parse failure poisons the connection:
//! the socket is dropped and everything returns `NotConnected` until the
//! application re-inits.

use std::os::fd::OwnedFd;
use std::os::unix::net::UnixStream;
use std::path::Path;

use herald_shm::scb::Scb;
use herald_wire::framing::{
    FrameError, decode_response, encode_request, read_frame, write_frame,
};
use herald_wire::{InitRequest, InitResponse, Request, Response};

use crate::error::ClientError;

#[derive(Debug)]
pub(crate) struct Conn {
    stream: Option<UnixStream>,
    scb: Scb,
    client_name: String,
}

impl Conn {
    /// Connect and run the `Init` exchange.
    pub(crate) fn connect(socket_path: &Path, client_name: &str) -> Result<Self, ClientError> {
        let stream = UnixStream::connect(socket_path)?;

        let request = Request::Init(InitRequest {
            client_name: client_name.to_string(),
        });
        let body = encode_request(&request).map_err(frame_error)?;
        write_frame(&mut &stream, &body).map_err(frame_error)?;

        let frame = read_frame(&mut &stream).map_err(frame_error)?;
        let response = decode_response(&frame).map_err(frame_error)?;
        let InitResponse { error, scb_fd_index } = match response {
            Response::Init(resp) => resp,
            _ => {
                return Err(ClientError::Protocol(
                    "mismatched response to Init".to_string(),
                ));
            }
        };
        if !error.is_empty() {
            return Err(ClientError::Refused(error));
        }

        let mut fds = herald_fdpass::recv_fds(&stream, 1)?;
        if scb_fd_index != 0 {
            return Err(ClientError::Protocol(format!(
                "unexpected scb fd index {scb_fd_index}"
            )));
        }
        let scb = Scb::from_fd(fds.remove(0))?;

        tracing::debug!(client = client_name, "connected to broker");
        Ok(Self {
            stream: Some(stream),
            scb,
            client_name: client_name.to_string(),
        })
    }

    pub(crate) fn scb(&self) -> &Scb {
        &self.scb
    }

    pub(crate) fn client_name(&self) -> &str {
        &self.client_name
    }

    /// Drop the socket; every later operation reports `NotConnected`.
    pub(crate) fn close(&mut self) {
        self.stream = None;
    }

    /// One request/response round trip, descriptors included.
    pub(crate) fn request(
        &mut self,
        request: &Request,
    ) -> Result<(Response, Vec<Option<OwnedFd>>), ClientError> {
        let stream = self.stream.as_ref().ok_or(ClientError::NotConnected)?;

        let body = encode_request(request).map_err(frame_error)?;
        if let Err(err) = write_frame(&mut &*stream, &body) {
            self.close();
            return Err(frame_error(err));
        }

        let frame = match read_frame(&mut &*stream) {
            Ok(frame) => frame,
            Err(err) => {
                self.close();
                return Err(frame_error(err));
            }
        };
        let response = match decode_response(&frame) {
            Ok(response) => response,
            Err(err) => {
                self.close();
                return Err(frame_error(err));
            }
        };

        let fds = match herald_fdpass::recv_fds(stream, response.num_fds()) {
            Ok(fds) => fds,
            Err(err) => {
                self.close();
                return Err(err.into());
            }
        };

        Ok((response, fds.into_iter().map(Some).collect()))
    }

    /// Pull the descriptor a response referenced by index. A bad index
    /// means we can no longer trust our position in the fd stream, so the
    /// connection is poisoned.
    pub(crate) fn take_fd(
        &mut self,
        fds: &mut [Option<OwnedFd>],
        index: u32,
    ) -> Result<OwnedFd, ClientError> {
        match fds.get_mut(index as usize).and_then(Option::take) {
            Some(fd) => Ok(fd),
            None => {
                self.close();
                Err(ClientError::Protocol(format!(
                    "response referenced bad fd index {index}"
                )))
            }
        }
    }
}

fn frame_error(err: FrameError) -> ClientError {
    match err {
        FrameError::Io(e) => ClientError::Io(e),
        other => ClientError::Protocol(other.to_string()),
    }
}
