//! The write side of a connection.
//!
//! A [`Response`](crate::Response) never touches a socket. It hands
//! [`ResponsePart`]s to a [`Transport`] and waits for each write to be
//! acknowledged before issuing the next one. The server plugs in
//! [`ChannelTransport`], which forwards parts to the hyper connection task;
//! tests plug in an in-memory recorder.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Mutex;
use std::task::{Context, Poll, ready};

use bytes::Bytes;
use http::StatusCode;
use http_body::{Body, Frame, SizeHint};
use tokio::sync::{mpsc, oneshot};

/// A future resolving once the transport has accepted a write.
pub type WriteFuture<'a> = Pin<Box<dyn Future<Output = io::Result<()>> + Send + 'a>>;

/// One unit of response output, in emission order: one `Head`, any number
/// of `Body` chunks, one `End`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ResponsePart {
    Head(StatusCode),
    Body(Bytes),
    End,
}

/// Asynchronous write/flush primitive for one response.
pub trait Transport: Send + Sync + 'static {
    fn write(&self, part: ResponsePart) -> WriteFuture<'_>;
}

// ── hyper adapter ─────────────────────────────────────────────────────────────

/// What the body channel carries: data, then an explicit end marker. A
/// channel that closes without the marker is an aborted response.
#[derive(Debug)]
enum BodyMessage {
    Data(Bytes),
    End,
}

/// Bridges a [`Response`](crate::Response) to a hyper service future.
///
/// The head travels through a oneshot (the service future is waiting on it
/// to build `http::Response`); body chunks travel through a channel of
/// capacity one, so a body write completes only once hyper has taken the
/// previous chunk. `End` sends the end marker and drops the sender.
pub struct ChannelTransport {
    head: Mutex<Option<oneshot::Sender<StatusCode>>>,
    body: Mutex<Option<mpsc::Sender<BodyMessage>>>,
}

impl ChannelTransport {
    /// Returns the transport plus the receiving halves the service future
    /// turns into an `http::Response`.
    pub fn channel() -> (Self, oneshot::Receiver<StatusCode>, ResponseBody) {
        let (head_tx, head_rx) = oneshot::channel();
        let (body_tx, body_rx) = mpsc::channel(1);
        let transport = Self {
            head: Mutex::new(Some(head_tx)),
            body: Mutex::new(Some(body_tx)),
        };
        let body = ResponseBody { kind: Kind::Streaming { rx: body_rx, ended: false } };
        (transport, head_rx, body)
    }
}

fn closed() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "response channel closed")
}

impl Transport for ChannelTransport {
    fn write(&self, part: ResponsePart) -> WriteFuture<'_> {
        Box::pin(async move {
            match part {
                ResponsePart::Head(status) => {
                    let sender = self.head.lock().map_err(|_| closed())?.take();
                    sender.ok_or_else(closed)?.send(status).map_err(|_| closed())
                }
                ResponsePart::Body(chunk) => {
                    // Clone out of the lock; the send below may wait.
                    let sender = self.body.lock().map_err(|_| closed())?.clone();
                    sender
                        .ok_or_else(closed)?
                        .send(BodyMessage::Data(chunk))
                        .await
                        .map_err(|_| closed())
                }
                ResponsePart::End => {
                    let sender = self.body.lock().map_err(|_| closed())?.take();
                    sender.ok_or_else(closed)?.send(BodyMessage::End).await.map_err(|_| closed())
                }
            }
        })
    }
}

// ── Response body ─────────────────────────────────────────────────────────────

/// The hyper-facing response body.
///
/// A streamed body fed by a [`ChannelTransport`] finishes cleanly only on
/// the end marker. If the writer goes away without one, the body yields an
/// error and hyper drops the connection instead of sending a terminator.
#[derive(Debug, Default)]
pub struct ResponseBody {
    kind: Kind,
}

#[derive(Debug, Default)]
enum Kind {
    Streaming { rx: mpsc::Receiver<BodyMessage>, ended: bool },
    Full(Option<Bytes>),
    #[default]
    Empty,
}

impl ResponseBody {
    pub fn empty() -> Self {
        Self::default()
    }

    /// A complete body sent as one frame.
    pub fn full(data: impl Into<Bytes>) -> Self {
        Self { kind: Kind::Full(Some(data.into())) }
    }
}

fn aborted() -> io::Error {
    io::Error::new(io::ErrorKind::UnexpectedEof, "response abandoned before its terminator")
}

impl Body for ResponseBody {
    type Data = Bytes;
    type Error = io::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        match &mut self.get_mut().kind {
            Kind::Streaming { ended: true, .. } => Poll::Ready(None),
            Kind::Streaming { rx, ended } => match ready!(rx.poll_recv(cx)) {
                Some(BodyMessage::Data(chunk)) => Poll::Ready(Some(Ok(Frame::data(chunk)))),
                Some(BodyMessage::End) => {
                    *ended = true;
                    Poll::Ready(None)
                }
                None => {
                    *ended = true;
                    Poll::Ready(Some(Err(aborted())))
                }
            },
            Kind::Full(data) => Poll::Ready(data.take().map(|chunk| Ok(Frame::data(chunk)))),
            Kind::Empty => Poll::Ready(None),
        }
    }

    fn is_end_stream(&self) -> bool {
        match &self.kind {
            Kind::Streaming { ended, .. } => *ended,
            Kind::Full(data) => data.is_none(),
            Kind::Empty => true,
        }
    }

    fn size_hint(&self) -> SizeHint {
        match &self.kind {
            Kind::Streaming { .. } => SizeHint::default(),
            Kind::Full(Some(data)) => SizeHint::with_exact(data.len() as u64),
            Kind::Full(None) | Kind::Empty => SizeHint::with_exact(0),
        }
    }
}
