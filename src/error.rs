//! Unified error type.

use std::path::PathBuf;

use http::StatusCode;

/// The error type returned by trellis's fallible operations.
///
/// Two families live here. Registration and contract errors
/// ([`RouteConflict`](Error::RouteConflict), [`ContractViolation`](Error::ContractViolation))
/// are programming mistakes and should fail loudly. Request outcomes
/// ([`NotFound`](Error::NotFound), [`BadRequest`](Error::BadRequest), …) are
/// rendered to the client by [`Response::send_error`](crate::Response::send_error):
/// the `Display` text becomes the one-line plaintext body and
/// [`Error::status`] picks the status code.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A second subrouter or a duplicate `(method, path)` leaf was registered.
    #[error("Route conflict: {0}")]
    RouteConflict(String),

    /// A leaf path that can never match (it must start with `/`).
    #[error("Invalid route: {0}")]
    InvalidRoute(String),

    /// No route matched and there is no document root to fall back to.
    #[error("Not found: {0}")]
    NotFound(String),

    /// No route matched and the static file could not be opened.
    #[error("File not found: {}", .0.display())]
    FileNotFound(PathBuf),

    /// The file was opened but reading it failed midway.
    #[error("File response error")]
    FileResponse,

    /// No route matched a non-GET request.
    #[error("Bad request")]
    BadRequest,

    /// The request body grew past the configured cap.
    #[error("Payload too large: body exceeds {limit} bytes")]
    PayloadTooLarge { limit: usize },

    /// A flush or status change was issued out of order.
    #[error("Contract violation: {0}")]
    ContractViolation(&'static str),

    /// A new request head arrived before the previous response was terminated.
    #[error("Request already in flight on this connection")]
    RequestInFlight,

    /// The response writer was dropped before its head went out, e.g. by a
    /// panicking handler.
    #[error("Response abandoned before its header was sent")]
    ResponseAbandoned,

    /// The worker pool dropped a job without producing a result.
    #[error("Worker pool failure")]
    WorkerPool,

    /// The transport refused a write. The response cannot be continued.
    #[error("Transport write failed: {0}")]
    Transport(#[source] std::io::Error),

    /// Binding or accepting on the listener failed.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// The status code this error is reported with.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::NotFound(_) | Self::FileNotFound(_) => StatusCode::NOT_FOUND,
            Self::BadRequest => StatusCode::BAD_REQUEST,
            Self::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}
