//! # trellis
//!
//! An embeddable HTTP dispatcher. You hang handlers on a tree of path
//! segments; trellis routes each request, runs the handler off the event
//! loop, and writes the response in strict head → body → end order. GET
//! requests that match no route fall through to files under a document
//! root, streamed in 1 KiB chunks.
//!
//! ## Routing
//!
//! Every [`Router`] node owns child routers keyed by one path segment and
//! leaves keyed by `(method, path)`. A request descends through children
//! while its next segment names one, then looks up the *whole remaining
//! path* in that node's leaves. Registering the same segment or leaf twice
//! is an [`Error::RouteConflict`], never a silent overwrite.
//!
//! ## Handlers
//!
//! - **Simple** handlers return the body as a string. They run on a bounded
//!   worker pool; trellis flushes head, body and end afterwards.
//! - **Builder** handlers receive the [`Response`] writer and drive the
//!   flush sequence themselves. Flushing out of order is an
//!   [`Error::ContractViolation`].
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use trellis::{Config, Router, Server, http::{Method, StatusCode}};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), trellis::Error> {
//!     let mut app = Router::new();
//!     app.get("/", |_req, _res| "Hello world!")?
//!         .post("/api", |req, res| {
//!             if req.body().is_none() {
//!                 res.set_status(StatusCode::BAD_REQUEST).ok();
//!                 return "Bad request!".to_owned();
//!             }
//!             format!("got {} bytes", req.body().map_or(0, <[u8]>::len))
//!         })?;
//!
//!     app.new_sub_router("router2")?
//!         .get("/test", |_req, _res| "Hello router2!")?;
//!
//!     app.builder(Method::GET, "/build", |_req, mut res, begin| async move {
//!         begin.await;
//!         res.flush_header().await?;
//!         res.flush_body("Hello world!").await?;
//!         res.flush_end().await
//!     })?;
//!
//!     Server::new(Config::from_env().htdocs("./public"))
//!         .serve(app)
//!         .await
//! }
//! ```

mod config;
mod dispatcher;
mod error;
mod files;
mod handler;
mod pool;
mod request;
mod response;
mod router;
mod server;
mod transport;

#[cfg(test)]
mod testing;

pub use http;

pub use config::Config;
pub use dispatcher::{Connection, Dispatcher};
pub use error::Error;
pub use files::{BlockingFileIo, FILE_CHUNK_SIZE, FileHandle, FileIo, FileStreamer, IoFuture};
pub use handler::{Begin, Handler};
pub use pool::WorkerPool;
pub use request::Request;
pub use response::{Response, ResponseState};
pub use router::Router;
pub use server::Server;
pub use transport::{ChannelTransport, ResponseBody, ResponsePart, Transport, WriteFuture};
