//! Path-segment request router.
//!
//! A [`Router`] is one node of a tree. Each node owns child routers keyed
//! by a single path segment, and a table of leaves keyed by
//! `(method, path)`. Resolution is two-phase:
//!
//! 1. While the first remaining segment names a child, descend into it.
//! 2. Otherwise join *all* remaining segments back into `/a/b/c` and look
//!    that string up verbatim, with an exact method match, in the current
//!    node's leaves.
//!
//! So a route below a subrouter is keyed by its full remaining path, not by
//! its last segment:
//!
//! ```rust
//! use trellis::Router;
//!
//! let mut app = Router::new();
//! let api = app.new_sub_router("api").unwrap();
//! api.get("/users/list", |_req, _res| "[]").unwrap();   // GET /api/users/list
//! ```
//!
//! Once a child matches there is no fallback to the parent's leaves. Every
//! registration conflict is an error; nothing is silently replaced.

use std::collections::HashMap;
use std::future::Future;

use http::Method;

use crate::error::Error;
use crate::handler::{Begin, Handler};
use crate::request::Request;
use crate::response::Response;

#[derive(Debug, Default)]
pub struct Router {
    children: HashMap<String, Router>,
    leaves: HashMap<(Method, String), Handler>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty child under `segment` and returns it for further
    /// registration.
    pub fn new_sub_router(&mut self, segment: &str) -> Result<&mut Router, Error> {
        self.register_sub_router(segment, Router::new())
    }

    /// Attaches an already-built router under `segment`.
    ///
    /// Fails with [`Error::RouteConflict`] if `segment` is taken; the tree is
    /// left unchanged.
    pub fn register_sub_router(&mut self, segment: &str, router: Router) -> Result<&mut Router, Error> {
        use std::collections::hash_map::Entry;

        match self.children.entry(segment.to_owned()) {
            Entry::Occupied(_) => Err(Error::RouteConflict(format!(
                "a router is already registered for path component `{segment}`"
            ))),
            Entry::Vacant(slot) => Ok(slot.insert(router)),
        }
    }

    /// Detaches and returns the child under `segment`, if any.
    pub fn unregister_router(&mut self, segment: &str) -> Option<Router> {
        self.children.remove(segment)
    }

    /// Stores a leaf for `(method, path)`.
    ///
    /// `path` is matched verbatim against the remaining path at this node, so
    /// it must start with `/`. A second registration for the same pair fails
    /// with [`Error::RouteConflict`].
    pub fn register(&mut self, method: Method, path: &str, handler: Handler) -> Result<&mut Self, Error> {
        if !path.starts_with('/') {
            return Err(Error::InvalidRoute(format!("`{path}` must start with `/`")));
        }
        let key = (method, path.to_owned());
        if self.leaves.contains_key(&key) {
            return Err(Error::RouteConflict(format!("{} {path} is already registered", key.0)));
        }
        self.leaves.insert(key, handler);
        Ok(self)
    }

    /// Registers a simple `GET` handler.
    ///
    /// ```rust
    /// # use trellis::Router;
    /// let mut app = Router::new();
    /// app.get("/", |_req, _res| "Hello world!")
    ///     .unwrap()
    ///     .post("/echo", |req, _res| String::from_utf8_lossy(req.body().unwrap_or_default()).into_owned())
    ///     .unwrap();
    /// ```
    pub fn get<F, R>(&mut self, path: &str, callback: F) -> Result<&mut Self, Error>
    where
        F: Fn(&Request, &mut Response) -> R + Send + Sync + 'static,
        R: Into<String>,
    {
        self.send(Method::GET, path, callback)
    }

    /// Registers a simple `POST` handler.
    pub fn post<F, R>(&mut self, path: &str, callback: F) -> Result<&mut Self, Error>
    where
        F: Fn(&Request, &mut Response) -> R + Send + Sync + 'static,
        R: Into<String>,
    {
        self.send(Method::POST, path, callback)
    }

    /// Registers a simple handler for any method.
    pub fn send<F, R>(&mut self, method: Method, path: &str, callback: F) -> Result<&mut Self, Error>
    where
        F: Fn(&Request, &mut Response) -> R + Send + Sync + 'static,
        R: Into<String>,
    {
        self.register(method, path, Handler::simple(callback))
    }

    /// Registers a builder handler, which drives its own flush sequence.
    ///
    /// ```rust
    /// # use trellis::{Router, http::Method};
    /// let mut app = Router::new();
    /// app.builder(Method::GET, "/build", |_req, mut res, begin| async move {
    ///     begin.await;
    ///     res.flush_header().await?;
    ///     res.flush_body("Hello world!").await?;
    ///     res.flush_end().await
    /// })
    /// .unwrap();
    /// ```
    pub fn builder<F, Fut>(&mut self, method: Method, path: &str, callback: F) -> Result<&mut Self, Error>
    where
        F: Fn(Request, Response, Begin) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), Error>> + Send + 'static,
    {
        self.register(method, path, Handler::builder(callback))
    }

    /// Finds the handler for `segments` (the request path split on `/`,
    /// without empty segments) and `method`.
    pub fn resolve<S: AsRef<str>>(&self, segments: &[S], method: &Method) -> Option<&Handler> {
        if let Some((first, rest)) = segments.split_first() {
            if let Some(child) = self.children.get(first.as_ref()) {
                return child.resolve(rest, method);
            }
        }

        let mut path = String::from("/");
        for (i, segment) in segments.iter().enumerate() {
            if i > 0 {
                path.push('/');
            }
            path.push_str(segment.as_ref());
        }
        self.leaves.get(&(method.clone(), path))
    }
}
