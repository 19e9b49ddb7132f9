//! From transport events to responses.
//!
//! The [`Dispatcher`] is built once per server and shared by every
//! connection. Each connection gets a [`Connection`], which turns the three
//! transport events into a request/response exchange:
//!
//! 1. **head** → a fresh [`Request`] and [`Response`] go into the
//!    connection's slot. Refused while a previous response is unfinished.
//! 2. **body chunk** → appended to the request.
//! 3. **end** → the exchange leaves the slot and is answered on its own
//!    task by [`Dispatcher::send_response`].
//!
//! The slot stays busy until the response terminator goes out (or the
//! response is dropped), so at most one request per connection is ever in
//! flight.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use bytes::Bytes;
use http::{Method, Uri};
use percent_encoding::percent_decode_str;
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, info_span, warn};

use crate::config::Config;
use crate::error::Error;
use crate::files::{BlockingFileIo, FileIo, FileStreamer, resolve_path};
use crate::handler::{Handler, SimpleFn};
use crate::pool::WorkerPool;
use crate::request::Request;
use crate::response::Response;
use crate::router::Router;
use crate::transport::Transport;

static NEXT_CONNECTION: AtomicU64 = AtomicU64::new(1);

#[derive(Debug)]
pub struct Dispatcher {
    router: Router,
    files: Option<(PathBuf, FileStreamer)>,
    workers: WorkerPool,
    max_body_bytes: usize,
}

impl Dispatcher {
    /// Takes ownership of a fully populated router. File serving is enabled
    /// only if `config.htdocs` is set.
    pub fn new(router: Router, config: &Config) -> Self {
        Self::with_file_io(router, config, BlockingFileIo::new(config.file_io_threads))
    }

    /// Like [`Dispatcher::new`] with a custom blocking-I/O backend.
    pub fn with_file_io(router: Router, config: &Config, io: impl FileIo) -> Self {
        Self {
            router,
            files: config.htdocs.clone().map(|root| (root, FileStreamer::new(io))),
            workers: WorkerPool::new("handlers", config.workers),
            max_body_bytes: config.max_body_bytes,
        }
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn connection(self: &Arc<Self>) -> Connection {
        Connection {
            id: NEXT_CONNECTION.fetch_add(1, Ordering::Relaxed),
            dispatcher: Arc::clone(self),
            slot: Arc::new(Mutex::new(Slot::Idle)),
        }
    }

    /// Produces exactly one response for a finished request: a matched
    /// handler, else a static file for `GET`, else `400 Bad request`.
    ///
    /// Failures are logged here; there is no one left to report them to.
    pub async fn send_response(&self, request: Request, mut response: Response) {
        let method = request.method().clone();
        let segments = path_segments(request.path());

        let outcome = match self.router.resolve(segments.as_slice(), &method).cloned() {
            Some(Handler::Simple(callback)) => self.run_simple(callback, request, response).await,
            Some(Handler::Builder(callback)) => {
                debug!("dispatching to builder handler");
                callback(request, response, std::future::ready(())).await
            }
            None if method == Method::GET => self.send_file(request.path(), &mut response).await,
            None => response.send_error(&Error::BadRequest).await,
        };

        if let Err(e) = outcome {
            warn!(error = %e, "response not completed");
        }
    }

    async fn run_simple(&self, callback: Arc<SimpleFn>, request: Request, response: Response) -> Result<(), Error> {
        debug!(pool = self.workers.name(), "dispatching to simple handler");
        let (mut response, body) = self
            .workers
            .run(move || {
                let mut response = response;
                let body = callback(&request, &mut response);
                (response, body)
            })
            .await?;

        response.flush_header().await?;
        response.flush_body(body).await?;
        response.flush_end().await
    }

    async fn send_file(&self, uri_path: &str, response: &mut Response) -> Result<(), Error> {
        let Some((root, streamer)) = &self.files else {
            return response.send_error(&Error::NotFound(uri_path.to_owned())).await;
        };
        let decoded = percent_decode_str(uri_path).decode_utf8_lossy();
        match resolve_path(root, &decoded) {
            Some(path) => {
                debug!(path = %path.display(), "serving file");
                streamer.send_file(&path, response).await
            }
            None => {
                let shown = root.join(decoded.trim_start_matches('/'));
                response.send_error(&Error::FileNotFound(shown)).await
            }
        }
    }
}

/// `/a//b%20c/` → `["a", "b c"]`.
fn path_segments(path: &str) -> Vec<String> {
    path.split('/')
        .filter(|s| !s.is_empty())
        .map(|s| percent_decode_str(s).decode_utf8_lossy().into_owned())
        .collect()
}

// ── Connection ────────────────────────────────────────────────────────────────

enum Slot {
    Idle,
    Receiving(Exchange),
    Responding,
}

struct Exchange {
    request: Request,
    response: Response,
    too_large: bool,
}

/// Releases the connection slot when dropped. Lives inside the
/// [`Response`] and is dropped when the terminator is flushed, when a write
/// fails, or with the response itself.
pub(crate) struct InFlight(Weak<Mutex<Slot>>);

impl Drop for InFlight {
    fn drop(&mut self) {
        let Some(slot) = self.0.upgrade() else { return };
        let mut slot = slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if matches!(*slot, Slot::Responding) {
            *slot = Slot::Idle;
        }
    }
}

/// Per-connection event sink. See the [module docs](self).
pub struct Connection {
    id: u64,
    dispatcher: Arc<Dispatcher>,
    slot: Arc<Mutex<Slot>>,
}

impl Connection {
    pub fn id(&self) -> u64 {
        self.id
    }

    fn lock(&self) -> MutexGuard<'_, Slot> {
        // Every Slot value is valid, so a poisoned lock is still usable.
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// A request head arrived. `transport` carries this request's response.
    pub fn on_head(&self, method: Method, uri: Uri, transport: Arc<dyn Transport>) -> Result<(), Error> {
        let mut slot = self.lock();
        if !matches!(*slot, Slot::Idle) {
            warn!(conn = self.id, %method, %uri, "request head while previous request is in flight");
            return Err(Error::RequestInFlight);
        }
        debug!(conn = self.id, %method, %uri, "request head");
        let request = Request::new(method, uri);
        let response = Response::new(transport).with_in_flight(InFlight(Arc::downgrade(&self.slot)));
        *slot = Slot::Receiving(Exchange { request, response, too_large: false });
        Ok(())
    }

    /// A body chunk arrived. Past the body cap the request is marked for a
    /// `413` answer and further chunks are discarded.
    pub fn on_body(&self, chunk: &Bytes) -> Result<(), Error> {
        let limit = self.dispatcher.max_body_bytes;
        let mut slot = self.lock();
        let Slot::Receiving(exchange) = &mut *slot else {
            return Err(Error::ContractViolation("body chunk without a request head"));
        };
        if exchange.too_large {
            return Err(Error::PayloadTooLarge { limit });
        }
        if let Err(e) = exchange.request.append_body(chunk, limit) {
            exchange.too_large = true;
            return Err(e);
        }
        Ok(())
    }

    /// The request is complete. Answers it on a new task and returns that
    /// task's handle.
    pub fn on_end(&self) -> Result<JoinHandle<()>, Error> {
        let exchange = {
            let mut slot = self.lock();
            match std::mem::replace(&mut *slot, Slot::Responding) {
                Slot::Receiving(exchange) => exchange,
                other => {
                    *slot = other;
                    return Err(Error::ContractViolation("request end without a request head"));
                }
            }
        };

        let Exchange { mut request, mut response, too_large } = exchange;
        request.seal();
        let span = info_span!("request", conn = self.id, method = %request.method(), uri = %request.uri());
        let dispatcher = Arc::clone(&self.dispatcher);

        Ok(tokio::spawn(
            async move {
                if too_large {
                    let error = Error::PayloadTooLarge { limit: dispatcher.max_body_bytes };
                    if let Err(e) = response.send_error(&error).await {
                        warn!(error = %e, "response not completed");
                    }
                    return;
                }
                dispatcher.send_response(request, response).await;
            }
            .instrument(span),
        ))
    }

    /// Drops any half-received request, e.g. after the peer went away
    /// mid-body.
    pub fn reset(&self) {
        let abandoned = std::mem::replace(&mut *self.lock(), Slot::Idle);
        // Dropped outside the lock: the response's InFlight guard locks too.
        drop(abandoned);
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").field("id", &self.id).finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::thread::{self, ThreadId};

    use http::StatusCode;

    use super::*;
    use crate::testing::Recorder;
    use crate::transport::ResponsePart;

    fn dispatcher(router: Router, config: Config) -> Arc<Dispatcher> {
        Arc::new(Dispatcher::new(router, &config))
    }

    /// Drives one full request through `conn` and waits for the response.
    async fn exchange(conn: &Connection, method: Method, uri: &str, body: &[&[u8]]) -> Arc<Recorder> {
        let recorder = Arc::new(Recorder::default());
        conn.on_head(method, uri.parse().unwrap(), Arc::clone(&recorder) as Arc<dyn Transport>)
            .unwrap();
        for chunk in body {
            let _ = conn.on_body(&Bytes::copy_from_slice(chunk));
        }
        conn.on_end().unwrap().await.unwrap();
        recorder
    }

    #[tokio::test]
    async fn test_should_answer_simple_handler_in_order() {
        let mut router = Router::new();
        router.post("/api", |_, _| "ok").unwrap();
        let conn = dispatcher(router, Config::default()).connection();

        let recorder = exchange(&conn, Method::POST, "/api", &[]).await;

        assert_eq!(
            recorder.parts(),
            vec![
                ResponsePart::Head(StatusCode::OK),
                ResponsePart::Body(Bytes::from_static(b"ok")),
                ResponsePart::End,
            ]
        );
    }

    #[tokio::test]
    async fn test_should_run_simple_handler_off_event_thread() {
        let seen: Arc<Mutex<Option<ThreadId>>> = Arc::default();
        let mut router = Router::new();
        let record = Arc::clone(&seen);
        router
            .get("/where", move |_, _| {
                *record.lock().unwrap() = Some(thread::current().id());
                "here"
            })
            .unwrap();
        let conn = dispatcher(router, Config::default()).connection();

        exchange(&conn, Method::GET, "/where", &[]).await;

        let worker = seen.lock().unwrap().expect("handler ran");
        assert_ne!(worker, thread::current().id());
    }

    #[tokio::test]
    async fn test_should_pass_query_body_and_status_to_handler() {
        let mut router = Router::new();
        router
            .post("/echo", |req, res| {
                if req.query("strict").is_some() {
                    res.set_status(StatusCode::ACCEPTED).unwrap();
                }
                let body = String::from_utf8_lossy(req.body().unwrap_or_default()).into_owned();
                format!("{}|{body}", req.query("a").unwrap_or("-"))
            })
            .unwrap();
        let conn = dispatcher(router, Config::default()).connection();

        let recorder = exchange(&conn, Method::POST, "/echo?a=1&a=2&strict", &[b"hel", b"lo"]).await;

        assert_eq!(recorder.status(), Some(StatusCode::ACCEPTED));
        assert_eq!(&recorder.body()[..], b"1,2|hello");
    }

    #[tokio::test]
    async fn test_should_hand_flush_sequence_to_builder() {
        let mut router = Router::new();
        router
            .new_sub_router("v1")
            .unwrap()
            .builder(Method::GET, "/build", |_req, mut res, begin| async move {
                begin.await;
                res.set_status(StatusCode::CREATED)?;
                res.flush_header().await?;
                res.flush_body("Hello ").await?;
                res.flush_body("world!").await?;
                res.flush_end().await
            })
            .unwrap();
        let conn = dispatcher(router, Config::default()).connection();

        let recorder = exchange(&conn, Method::GET, "/v1/build", &[]).await;

        assert_eq!(recorder.status(), Some(StatusCode::CREATED));
        assert_eq!(recorder.body_chunks(), 2);
        assert_eq!(&recorder.body()[..], b"Hello world!");
    }

    #[tokio::test]
    async fn test_should_serve_file_for_unmatched_get() {
        let root = tempfile::tempdir().unwrap();
        let content: Vec<u8> = (0..50u8).collect();
        std::fs::write(root.path().join("index.html"), &content).unwrap();
        let conn = dispatcher(Router::new(), Config::default().htdocs(root.path())).connection();

        let recorder = exchange(&conn, Method::GET, "/index.html", &[]).await;

        assert_eq!(recorder.status(), Some(StatusCode::OK));
        assert_eq!(&recorder.body()[..], &content[..]);
        assert_eq!(recorder.parts().last(), Some(&ResponsePart::End));
    }

    #[tokio::test]
    async fn test_should_decode_file_path_like_route_segments() {
        let root = tempfile::tempdir().unwrap();
        std::fs::write(root.path().join("my file.txt"), b"spaced").unwrap();
        let conn = dispatcher(Router::new(), Config::default().htdocs(root.path())).connection();

        let recorder = exchange(&conn, Method::GET, "/my%20file.txt", &[]).await;

        assert_eq!(recorder.status(), Some(StatusCode::OK));
        assert_eq!(&recorder.body()[..], b"spaced");
    }

    #[tokio::test]
    async fn test_should_refuse_encoded_parent_dir_in_file_path() {
        let root = tempfile::tempdir().unwrap();
        let conn = dispatcher(Router::new(), Config::default().htdocs(root.path())).connection();

        let recorder = exchange(&conn, Method::GET, "/%2E%2E/secret", &[]).await;

        assert_eq!(recorder.status(), Some(StatusCode::NOT_FOUND));
    }

    #[tokio::test]
    async fn test_should_release_slot_when_builder_skips_end() {
        let mut router = Router::new();
        router
            .builder(Method::GET, "/forgot", |_req, mut res, begin| async move {
                begin.await;
                res.flush_header().await?;
                res.flush_body("no end").await
            })
            .unwrap();
        router.get("/ok", |_, _| "fine").unwrap();
        let conn = dispatcher(router, Config::default()).connection();

        let recorder = exchange(&conn, Method::GET, "/forgot", &[]).await;
        assert_eq!(
            recorder.parts(),
            vec![
                ResponsePart::Head(StatusCode::OK),
                ResponsePart::Body(Bytes::from_static(b"no end")),
            ]
        );

        let recorder = exchange(&conn, Method::GET, "/ok", &[]).await;
        assert_eq!(&recorder.body()[..], b"fine");
    }

    #[tokio::test]
    async fn test_should_report_missing_file_with_its_path() {
        let root = tempfile::tempdir().unwrap();
        let conn = dispatcher(Router::new(), Config::default().htdocs(root.path())).connection();

        let recorder = exchange(&conn, Method::GET, "/index.html", &[]).await;

        assert_eq!(recorder.status(), Some(StatusCode::NOT_FOUND));
        let expected = root.path().join("index.html");
        let body = String::from_utf8(recorder.body().to_vec()).unwrap();
        assert!(body.contains(&expected.display().to_string()), "{body}");
    }

    #[tokio::test]
    async fn test_should_not_serve_files_without_htdocs() {
        let conn = dispatcher(Router::new(), Config::default()).connection();
        let recorder = exchange(&conn, Method::GET, "/index.html", &[]).await;
        assert_eq!(recorder.status(), Some(StatusCode::NOT_FOUND));
        assert_eq!(&recorder.body()[..], b"Not found: /index.html");
    }

    #[tokio::test]
    async fn test_should_answer_unmatched_non_get_with_bad_request() {
        let conn = dispatcher(Router::new(), Config::default()).connection();
        let recorder = exchange(&conn, Method::DELETE, "/anything", &[]).await;
        assert_eq!(recorder.status(), Some(StatusCode::BAD_REQUEST));
        assert_eq!(&recorder.body()[..], b"Bad request");
    }

    #[tokio::test]
    async fn test_should_answer_oversized_body_with_413() {
        let mut router = Router::new();
        router.post("/upload", |_, _| "stored").unwrap();
        let conn = dispatcher(router, Config::default().max_body_bytes(4)).connection();

        let recorder = Arc::new(Recorder::default());
        conn.on_head(Method::POST, "/upload".parse().unwrap(), Arc::clone(&recorder) as Arc<dyn Transport>)
            .unwrap();
        conn.on_body(&Bytes::from_static(b"123")).unwrap();
        assert!(matches!(
            conn.on_body(&Bytes::from_static(b"45")),
            Err(Error::PayloadTooLarge { limit: 4 })
        ));
        conn.on_end().unwrap().await.unwrap();

        assert_eq!(recorder.status(), Some(StatusCode::PAYLOAD_TOO_LARGE));
    }

    #[tokio::test]
    async fn test_should_refuse_head_while_request_in_flight() {
        let mut router = Router::new();
        router.get("/", |_, _| "first").unwrap();
        let conn = dispatcher(router, Config::default()).connection();

        let first = Arc::new(Recorder::default());
        conn.on_head(Method::GET, "/".parse().unwrap(), Arc::clone(&first) as Arc<dyn Transport>)
            .unwrap();
        let second = Arc::new(Recorder::default()) as Arc<dyn Transport>;
        assert!(matches!(
            conn.on_head(Method::GET, "/".parse().unwrap(), Arc::clone(&second)),
            Err(Error::RequestInFlight)
        ));

        conn.on_end().unwrap().await.unwrap();
        first.ended().await;

        // The terminator released the slot.
        let recorder = exchange(&conn, Method::GET, "/", &[]).await;
        assert_eq!(&recorder.body()[..], b"first");
    }

    #[tokio::test]
    async fn test_should_release_slot_when_handler_panics() {
        let mut router = Router::new();
        router.get("/panic", |_, _| -> String { panic!("handler bug") }).unwrap();
        router.get("/ok", |_, _| "fine").unwrap();
        let conn = dispatcher(router, Config::default()).connection();

        let recorder = exchange(&conn, Method::GET, "/panic", &[]).await;
        assert!(recorder.parts().is_empty());

        let recorder = exchange(&conn, Method::GET, "/ok", &[]).await;
        assert_eq!(&recorder.body()[..], b"fine");
    }

    #[tokio::test]
    async fn test_should_reject_events_out_of_order() {
        let conn = dispatcher(Router::new(), Config::default()).connection();
        assert!(matches!(conn.on_body(&Bytes::from_static(b"x")), Err(Error::ContractViolation(_))));
        assert!(matches!(conn.on_end(), Err(Error::ContractViolation(_))));
    }

    #[tokio::test]
    async fn test_should_accept_new_head_after_reset() {
        let conn = dispatcher(Router::new(), Config::default()).connection();
        let transport = Arc::new(Recorder::default()) as Arc<dyn Transport>;
        conn.on_head(Method::POST, "/".parse().unwrap(), Arc::clone(&transport)).unwrap();
        conn.reset();
        conn.on_head(Method::POST, "/".parse().unwrap(), transport).unwrap();
    }

    #[test]
    fn test_should_split_path_into_decoded_segments() {
        assert_eq!(path_segments("/"), Vec::<String>::new());
        assert_eq!(path_segments("/a//b%20c/"), vec!["a", "b c"]);
    }
}
