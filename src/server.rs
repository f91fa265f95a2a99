//! HTTP server and graceful shutdown.
//!
//! # Graceful shutdown
//!
//! On **SIGTERM** or Ctrl-C (or when the future handed to
//! [`Server::serve_with_shutdown`] resolves) the server:
//! 1. stops `listener.accept()` so no new connections are made;
//! 2. closes idle keep-alive connections and lets busy ones finish their
//!    current request;
//! 3. aborts whatever is still open after the shutdown timeout (30 s
//!    unless configured);
//! 4. returns from [`Server::serve`].
//!
//! Each request's own deadline is independent of shutdown: a request that
//! is mid-chain when the signal arrives finishes (or times out) normally.

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::StatusCode;
use http_body_util::{BodyExt, Full};
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use hyper_util::server::graceful::GracefulShutdown;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::config::{DEFAULT_SHUTDOWN_TIMEOUT, ServerConfig};
use crate::error::{Error, HandlerError};
use crate::response::Response;
use crate::router::Router;

/// The HTTP server.
pub struct Server {
    listen: Listen,
    cors: bool,
    shutdown_timeout: Duration,
}

enum Listen {
    Addr(SocketAddr),
    Listener(TcpListener),
}

impl Server {
    /// Configures the server to bind to `addr` when [`serve`](Server::serve)
    /// is called.
    ///
    /// ```rust
    /// use gantry::Server;
    /// let server = Server::bind("0.0.0.0:3000").unwrap();
    /// ```
    pub fn bind(addr: &str) -> Result<Self, Error> {
        let addr: SocketAddr = addr.parse().map_err(|_| Error::Address(addr.to_owned()))?;
        Ok(Self { listen: Listen::Addr(addr), cors: true, shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT })
    }

    pub fn from_config(config: &ServerConfig) -> Result<Self, Error> {
        Ok(Self::bind(&config.http.bind_address)?
            .cors(config.http.cors)
            .shutdown_timeout(config.shutdown_timeout()))
    }

    /// Serves on an already bound listener.
    pub fn from_listener(listener: TcpListener) -> Self {
        Self { listen: Listen::Listener(listener), cors: true, shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT }
    }

    /// Wildcard CORS headers and preflight answers. On by default.
    pub fn cors(mut self, enabled: bool) -> Self {
        self.cors = enabled;
        self
    }

    /// Upper bound on draining connections after the shutdown signal.
    /// Whatever is still open afterwards is aborted.
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Serves until SIGTERM or Ctrl-C, then drains in-flight connections.
    pub async fn serve(self, router: Router) -> Result<(), Error> {
        self.serve_with_shutdown(router, shutdown_signal()).await
    }

    /// Serves until `signal` resolves, then drains in-flight connections.
    pub async fn serve_with_shutdown(
        self,
        router: Router,
        signal: impl Future<Output = ()>,
    ) -> Result<(), Error> {
        let listener = match self.listen {
            Listen::Addr(addr) => TcpListener::bind(addr).await?,
            Listen::Listener(listener) => listener,
        };
        let addr = listener.local_addr()?;
        let router = Arc::new(router);
        let cors = self.cors;

        info!(%addr, "gantry listening");

        let builder = ConnBuilder::new(TokioExecutor::new());
        let graceful = GracefulShutdown::new();
        let mut tasks = tokio::task::JoinSet::new();

        tokio::pin!(signal);

        loop {
            tokio::select! {
                // Shutdown first, so a signal stops accepting even with a backlog.
                biased;

                () = &mut signal => {
                    info!(in_flight = tasks.len(), "shutdown signal received, draining connections");
                    break;
                }

                res = listener.accept() => {
                    let (stream, remote_addr) = match res {
                        Ok(v) => v,
                        Err(e) => {
                            error!("accept error: {e}");
                            continue;
                        }
                    };

                    let router = Arc::clone(&router);
                    let svc = service_fn(move |req| {
                        let router = Arc::clone(&router);
                        async move { dispatch(router, req, remote_addr, cors).await }
                    });
                    let conn = builder.serve_connection_with_upgrades(TokioIo::new(stream), svc);
                    let conn = graceful.watch(conn.into_owned());

                    tasks.spawn(async move {
                        if let Err(e) = conn.await {
                            error!(peer = %remote_addr, "connection error: {e}");
                        }
                    });
                }

                // Reap finished connection tasks.
                Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
            }
        }

        // Idle keep-alive connections close now; busy ones finish their
        // current request first, within the drain timeout.
        if tokio::time::timeout(self.shutdown_timeout, graceful.shutdown()).await.is_err() {
            warn!(
                remaining = tasks.len(),
                timeout_secs = self.shutdown_timeout.as_secs(),
                "drain timeout elapsed, aborting remaining connections"
            );
            tasks.abort_all();
        }
        while tasks.join_next().await.is_some() {}

        info!("gantry stopped");
        Ok(())
    }
}

// ── Request dispatch ──────────────────────────────────────────────────────────

/// Reads the body, answers preflights, and hands everything else to the router.
async fn dispatch(
    router: Arc<Router>,
    req: hyper::Request<hyper::body::Incoming>,
    remote_addr: SocketAddr,
    cors: bool,
) -> Result<http::Response<Full<Bytes>>, Infallible> {
    if cors && is_preflight(&req) {
        return Ok(preflight(&req).into_inner());
    }

    let (parts, body) = req.into_parts();
    let mut response = match body.collect().await {
        Ok(collected) => {
            let req = http::Request::from_parts(parts, collected.to_bytes());
            router.handle(req, Some(remote_addr)).await
        }
        Err(e) => {
            warn!(peer = %remote_addr, path = parts.uri.path(), "failed to read request body: {e}");
            let err = HandlerError::validation("unreadable request body");
            Response::builder().status(StatusCode::BAD_REQUEST).json_value(&err)
        }
    };

    if cors {
        response.push_header("access-control-allow-origin", "*");
    }
    Ok(response.into_inner())
}

fn is_preflight<B>(req: &hyper::Request<B>) -> bool {
    req.method() == http::Method::OPTIONS && req.headers().contains_key("access-control-request-method")
}

fn preflight<B>(req: &hyper::Request<B>) -> Response {
    let requested = req
        .headers()
        .get("access-control-request-headers")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("*");
    Response::builder()
        .status(StatusCode::NO_CONTENT)
        .header("access-control-allow-origin", "*")
        .header("access-control-allow-methods", "GET, POST, PUT, PATCH, DELETE, OPTIONS")
        .header("access-control-allow-headers", requested)
        .header("access-control-max-age", "600")
        .no_body()
}

// ── Shutdown signal ───────────────────────────────────────────────────────────

/// Resolves on the first SIGTERM or Ctrl-C. A handler that cannot be
/// installed is logged and that signal is ignored.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("failed to install Ctrl-C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let sigterm = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let sigterm = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c   => {}
        () = sigterm  => {}
    }
}
