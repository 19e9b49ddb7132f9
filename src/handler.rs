//! Route handlers.
//!
//! A route holds one of two kinds of callback:
//!
//! - **Simple**: `Fn(&Request, &mut Response) -> impl Into<String>`. Runs on
//!   the worker pool; the returned string becomes the whole body and the
//!   dispatcher drives head → body → end. The callback may still call
//!   [`Response::set_status`].
//! - **Builder**: `Fn(Request, Response, Begin) -> impl Future<Output = Result<(), Error>>`.
//!   Runs on the event loop and owns the full flush sequence. `Begin` is an
//!   already-resolved future, so a builder can chain off it or ignore it.
//!
//! Both are stored behind an `Arc` so a matched handler can be cloned out of
//! the router and moved into the response task for the price of one atomic
//! increment.
//!
//! ```text
//! router.get("/", |_req, _res| "hi")          router.builder(GET, "/b", |req, res, begin| async { … })
//!        ↓ Handler::simple                          ↓ Handler::builder
//! Handler::Simple(Arc<dyn Fn…>)              Handler::Builder(Arc<dyn Fn… -> BoxFuture>)
//!        ↓ matched in Dispatcher::send_response ↓
//!   pool.run(callback) → flush ×3              callback(req, res, ready(())).await
//! ```

use std::fmt;
use std::future::{Future, Ready};
use std::pin::Pin;
use std::sync::Arc;

use crate::error::Error;
use crate::request::Request;
use crate::response::Response;

/// A heap-allocated, type-erased future returned by builder handlers.
pub(crate) type BoxFuture = Pin<Box<dyn Future<Output = Result<(), Error>> + Send + 'static>>;

/// The synchronization token passed to builder handlers. Always ready.
pub type Begin = Ready<()>;

pub(crate) type SimpleFn = dyn Fn(&Request, &mut Response) -> String + Send + Sync + 'static;
type BuilderFn = dyn Fn(Request, Response, Begin) -> BoxFuture + Send + Sync + 'static;

/// A route's callback. Cloning shares the callback.
#[derive(Clone)]
pub enum Handler {
    /// Returns the whole body; the dispatcher flushes head, body and end.
    Simple(Arc<SimpleFn>),
    /// Drives the flush sequence itself.
    Builder(Arc<BuilderFn>),
}

impl Handler {
    /// Wraps a body-returning callback. It runs on the worker pool.
    pub fn simple<F, R>(callback: F) -> Self
    where
        F: Fn(&Request, &mut Response) -> R + Send + Sync + 'static,
        R: Into<String>,
    {
        Self::Simple(Arc::new(move |req: &Request, res: &mut Response| callback(req, res).into()))
    }

    /// Wraps an async callback that owns the [`Response`] and must end it
    /// with [`Response::flush_end`].
    pub fn builder<F, Fut>(callback: F) -> Self
    where
        F: Fn(Request, Response, Begin) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), Error>> + Send + 'static,
    {
        Self::Builder(Arc::new(move |req: Request, res: Response, begin: Begin| -> BoxFuture {
            Box::pin(callback(req, res, begin))
        }))
    }

    /// `"simple"` or `"builder"`, for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Simple(_) => "simple",
            Self::Builder(_) => "builder",
        }
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Handler").field(&self.kind()).finish()
    }
}
