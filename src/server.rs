//! HTTP server and graceful shutdown.
//!
//! hyper parses HTTP/1.1 off each TCP connection; this module feeds what
//! it parses into a [`Connection`] as head / body / end events and hands
//! hyper back a streaming body fed by the response's [`ChannelTransport`].
//! HTTP/1.1 only: one request in flight per connection.
//!
//! On SIGTERM or Ctrl-C the server:
//! 1. stops accepting new connections,
//! 2. asks every open connection to close after its current response,
//! 3. returns from [`Server::serve`] once all of them have finished.

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::dispatcher::{Connection, Dispatcher};
use crate::error::Error;
use crate::router::Router;
use crate::transport::{ChannelTransport, ResponseBody};

/// The HTTP server.
#[derive(Debug)]
pub struct Server {
    config: Config,
}

impl Server {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// A server with default configuration bound to `addr` instead of
    /// `127.0.0.1:8080`.
    ///
    /// # Panics
    ///
    /// Panics if `addr` is not a valid `host:port` string.
    ///
    /// ```rust,no_run
    /// use trellis::Server;
    /// let server = Server::bind("0.0.0.0:3000");
    /// ```
    pub fn bind(addr: &str) -> Self {
        let addr: SocketAddr = addr.parse().expect("invalid socket address");
        Self::new(Config::default().host(addr.ip()).port(addr.port()))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Binds the configured address and serves `router` until SIGTERM or
    /// Ctrl-C, then drains open connections.
    pub async fn serve(self, router: Router) -> Result<(), Error> {
        let listener = TcpListener::bind(self.config.addr()).await?;
        self.serve_with_shutdown(listener, router, shutdown_signal()).await
    }

    /// Serves `router` on an already-bound listener until `shutdown`
    /// resolves, then drains open connections.
    pub async fn serve_with_shutdown(
        self,
        listener: TcpListener,
        router: Router,
        shutdown: impl Future<Output = ()>,
    ) -> Result<(), Error> {
        let dispatcher = Arc::new(Dispatcher::new(router, &self.config));
        let local = listener.local_addr()?;
        info!(
            addr = %local,
            htdocs = ?self.config.htdocs,
            workers = self.config.workers,
            "trellis listening"
        );

        let (stop_tx, stop_rx) = watch::channel(false);
        let mut tasks = tokio::task::JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                // Check shutdown first so a signal stops accepting at once,
                // even with connections still queued.
                biased;

                () = &mut shutdown => {
                    info!(in_flight = tasks.len(), "shutdown signal received, draining connections");
                    break;
                }

                res = listener.accept() => {
                    let (stream, peer) = match res {
                        Ok(v) => v,
                        Err(e) => {
                            error!("accept error: {e}");
                            continue;
                        }
                    };
                    let dispatcher = Arc::clone(&dispatcher);
                    let stop = stop_rx.clone();
                    tasks.spawn(serve_connection(dispatcher, stream, peer, stop));
                }

                // Reap finished connection tasks so the set does not grow
                // without bound.
                Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
            }
        }

        // Receivers may all be gone already; that is fine.
        let _ = stop_tx.send(true);
        while tasks.join_next().await.is_some() {}

        info!("trellis stopped");
        Ok(())
    }
}

async fn serve_connection(
    dispatcher: Arc<Dispatcher>,
    stream: TcpStream,
    peer: SocketAddr,
    mut stop: watch::Receiver<bool>,
) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!(%peer, "cannot set TCP_NODELAY: {e}");
    }
    let connection = Arc::new(dispatcher.connection());
    debug!(%peer, conn = connection.id(), "connection opened");

    let svc = {
        let connection = Arc::clone(&connection);
        // Called once per request on the connection.
        service_fn(move |req| dispatch(Arc::clone(&connection), req))
    };
    let conn = http1::Builder::new().serve_connection(TokioIo::new(stream), svc);
    tokio::pin!(conn);

    let result = tokio::select! {
        res = conn.as_mut() => res,
        _ = stop.changed() => {
            conn.as_mut().graceful_shutdown();
            conn.await
        }
    };
    if let Err(e) = result {
        warn!(%peer, conn = connection.id(), "connection error: {e}");
    }
    debug!(%peer, conn = connection.id(), "connection closed");
}

// ── Request dispatch ──────────────────────────────────────────────────────────

/// Turns one hyper request into connection events and waits for the
/// response head.
///
/// The error type is [`Infallible`]: every failure becomes an error response
/// so hyper never sees an error.
async fn dispatch(
    connection: Arc<Connection>,
    req: hyper::Request<Incoming>,
) -> Result<http::Response<ResponseBody>, Infallible> {
    let (parts, mut body) = req.into_parts();
    let (transport, head, response_body) = ChannelTransport::channel();

    if let Err(e) = connection.on_head(parts.method, parts.uri, Arc::new(transport)) {
        return Ok(error_response(&e));
    }

    // Past a rejected chunk the rest of the body is drained and dropped.
    let mut discarding = false;
    while let Some(frame) = body.frame().await {
        match frame {
            Ok(frame) => {
                let Ok(chunk) = frame.into_data() else { continue };
                if discarding {
                    continue;
                }
                if let Err(e) = connection.on_body(&chunk) {
                    debug!(conn = connection.id(), error = %e, "discarding rest of request body");
                    discarding = true;
                }
            }
            Err(e) => {
                warn!(conn = connection.id(), "request body read failed: {e}");
                connection.reset();
                return Ok(error_response(&Error::BadRequest));
            }
        }
    }

    if let Err(e) = connection.on_end() {
        error!(conn = connection.id(), error = %e, "cannot dispatch request");
        return Ok(error_response(&e));
    }

    match head.await {
        Ok(status) => {
            let mut response = http::Response::new(response_body);
            *response.status_mut() = status;
            Ok(response)
        }
        // The response was dropped before its head went out.
        Err(_) => Ok(error_response(&Error::ResponseAbandoned)),
    }
}

/// A failure the connection answers itself, rendered like
/// [`Response::send_error`](crate::Response::send_error) does: the error's
/// status and its one-line message.
fn error_response(error: &Error) -> http::Response<ResponseBody> {
    let mut response = http::Response::new(ResponseBody::full(error.to_string()));
    *response.status_mut() = error.status();
    response
}

// ── Shutdown signal ───────────────────────────────────────────────────────────

/// Resolves on the first SIGTERM or SIGINT (Ctrl-C). A handler that cannot
/// be installed is logged and never fires.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("cannot listen for Ctrl-C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let sigterm = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("cannot listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let sigterm = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c  => {}
        () = sigterm => {}
    }
}
