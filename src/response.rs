//! The per-request response writer.
//!
//! A [`Response`] emits exactly one head, then any number of body chunks,
//! then one terminator, each handed to the [`Transport`] and awaited before
//! the call returns:
//!
//! ```text
//! NotStarted ──flush_header──▶ HeaderSent ──flush_body──▶ BodyStreaming
//!                                  │                          │  ▲  │
//!                                  │                          └──┘  │
//!                                  └────────flush_end───────▶ Ended ◀┘
//! ```
//!
//! Out-of-order calls fail with [`Error::ContractViolation`]. A failed
//! transport write also moves the writer to `Ended`: the sequence for that
//! request is abandoned, never retried. Dropping a writer after its head
//! went out but before the terminator aborts the response: the transport
//! sees the write side vanish without an `End` part.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use http::StatusCode;
use tracing::{debug, error};

use crate::dispatcher::InFlight;
use crate::error::Error;
use crate::transport::{ResponsePart, Transport};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResponseState {
    NotStarted,
    HeaderSent,
    BodyStreaming,
    Ended,
}

pub struct Response {
    status: StatusCode,
    state: ResponseState,
    transport: Arc<dyn Transport>,
    // Held until the terminator goes out, so the connection accepts the
    // next request head only after this response is finished.
    in_flight: Option<InFlight>,
}

impl Response {
    /// A writer that starts at `200 OK`.
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { status: StatusCode::OK, state: ResponseState::NotStarted, transport, in_flight: None }
    }

    pub(crate) fn with_in_flight(mut self, guard: InFlight) -> Self {
        self.in_flight = Some(guard);
        self
    }

    pub fn status(&self) -> StatusCode { self.status }
    pub fn state(&self) -> ResponseState { self.state }
    pub fn header_flushed(&self) -> bool { self.state != ResponseState::NotStarted }
    pub fn is_ended(&self) -> bool { self.state == ResponseState::Ended }

    /// Changes the status. Only legal before the head is flushed.
    pub fn set_status(&mut self, status: StatusCode) -> Result<(), Error> {
        if self.state != ResponseState::NotStarted {
            return Err(Error::ContractViolation("status changed after header flush"));
        }
        self.status = status;
        Ok(())
    }

    /// Sends the head. A second call is a successful no-op.
    pub async fn flush_header(&mut self) -> Result<(), Error> {
        match self.state {
            ResponseState::NotStarted => {}
            ResponseState::HeaderSent | ResponseState::BodyStreaming => return Ok(()),
            ResponseState::Ended => return Err(Error::ContractViolation("header flush after end")),
        }
        self.write(ResponsePart::Head(self.status)).await?;
        self.state = ResponseState::HeaderSent;
        Ok(())
    }

    pub async fn flush_body(&mut self, chunk: impl Into<Bytes>) -> Result<(), Error> {
        match self.state {
            ResponseState::NotStarted => {
                return Err(Error::ContractViolation("body flush before header"));
            }
            ResponseState::Ended => return Err(Error::ContractViolation("body flush after end")),
            ResponseState::HeaderSent | ResponseState::BodyStreaming => {}
        }
        self.write(ResponsePart::Body(chunk.into())).await?;
        self.state = ResponseState::BodyStreaming;
        Ok(())
    }

    /// Sends the terminator. Every later flush fails.
    pub async fn flush_end(&mut self) -> Result<(), Error> {
        match self.state {
            ResponseState::NotStarted => {
                return Err(Error::ContractViolation("end flush before header"));
            }
            ResponseState::Ended => return Err(Error::ContractViolation("end flush after end")),
            ResponseState::HeaderSent | ResponseState::BodyStreaming => {}
        }
        self.state = ResponseState::Ended;
        self.in_flight.take();
        self.transport
            .write(ResponsePart::End)
            .await
            .map_err(Error::Transport)
    }

    /// Renders `error` as a one-line plaintext response: head, message,
    /// terminator.
    ///
    /// If the head is still unsent the status comes from
    /// [`Error::status`]; otherwise the message is appended to the body that
    /// is already under way.
    pub async fn send_error(&mut self, error: &Error) -> Result<(), Error> {
        if self.state == ResponseState::NotStarted {
            self.status = error.status();
        }
        debug!(status = %self.status, %error, "sending error response");
        self.flush_header().await?;
        self.flush_body(error.to_string()).await?;
        self.flush_end().await
    }

    async fn write(&mut self, part: ResponsePart) -> Result<(), Error> {
        if let Err(e) = self.transport.write(part).await {
            self.state = ResponseState::Ended;
            self.in_flight.take();
            return Err(Error::Transport(e));
        }
        Ok(())
    }
}

impl Drop for Response {
    fn drop(&mut self) {
        // Free the connection slot before the transport halves go away.
        self.in_flight.take();
        if matches!(self.state, ResponseState::HeaderSent | ResponseState::BodyStreaming) {
            error!(status = %self.status, "response dropped before its terminator, aborting it");
        }
    }
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("status", &self.status)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}
