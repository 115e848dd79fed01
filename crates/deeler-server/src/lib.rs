//! # deeler-server
//!
//! HTTP server shell with graceful start and stop.
//!
//! The server has no routes yet: every request is answered with
//! `404 page not found`. What it does provide is the lifecycle:
//!
//! - [`Server::start`] binds and serves until [`Server::stop`] is called
//! - [`Server::stop`] stops accepting, lets in-flight requests finish, and
//!   fails if that takes longer than the shutdown timeout (30s by default)
//!
//! Connections that stall on a read or write, or sit idle between requests,
//! are closed after 5s by default.
//!
//! ## Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use deeler_server::{Server, ServerOptions};
//!
//! let server = Arc::new(Server::new(ServerOptions::default()));
//! let runner = Arc::clone(&server);
//! let serving = tokio::spawn(async move { runner.start().await });
//!
//! // ... later
//! server.stop().await?;
//! serving.await??;
//! ```

mod error;
mod timeout;

pub use error::{Result, ServerError};

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioIo, TokioTimer};
use hyper_util::server::graceful::GracefulShutdown;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::timeout::{TimedIo, Timeouts};

/// Server settings.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Host or IP to listen on.
    pub host: String,
    /// Port to listen on; 0 picks a free port.
    pub port: u16,
    /// How long a client may take to send request headers.
    pub read_header_timeout: Duration,
    /// How long a read may stall while a request is being handled.
    pub read_timeout: Duration,
    /// How long a response write may stall.
    pub write_timeout: Duration,
    /// How long a connection may wait for its next request.
    pub idle_timeout: Duration,
    /// How long [`Server::stop`] waits for in-flight connections.
    pub shutdown_timeout: Duration,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 8080,
            read_header_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(5),
            write_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Listening(SocketAddr),
    Stopped { drained: bool },
}

/// An HTTP server that can be started once and stopped gracefully.
pub struct Server {
    address: String,
    read_header_timeout: Duration,
    timeouts: Timeouts,
    shutdown_timeout: Duration,
    shutdown: CancellationToken,
    state: watch::Sender<State>,
}

impl Server {
    /// Creates a server; nothing is bound until [`Server::start`].
    #[must_use]
    pub fn new(options: ServerOptions) -> Self {
        let (state, _) = watch::channel(State::Idle);
        Self {
            address: join_host_port(&options.host, options.port),
            read_header_timeout: options.read_header_timeout,
            timeouts: Timeouts {
                read: options.read_timeout,
                write: options.write_timeout,
                idle: options.idle_timeout,
            },
            shutdown_timeout: options.shutdown_timeout,
            shutdown: CancellationToken::new(),
            state,
        }
    }

    /// Returns the configured `host:port`.
    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Waits until the server is bound and returns its address.
    ///
    /// Returns `None` if the server stopped without listening.
    pub async fn listening_addr(&self) -> Option<SocketAddr> {
        let mut state = self.state.subscribe();
        let ready = state.wait_for(|s| *s != State::Idle).await.ok()?;
        match *ready {
            State::Listening(addr) => Some(addr),
            _ => None,
        }
    }

    /// Binds and serves until [`Server::stop`] is called.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Bind`] if the address cannot be listened on.
    pub async fn start(&self) -> Result<()> {
        let (listener, local) = match self.bind().await {
            Ok(bound) => bound,
            Err(err) => {
                self.state.send_replace(State::Stopped { drained: true });
                return Err(err);
            }
        };
        self.state.send_replace(State::Listening(local));
        info!(address = %local, "Starting server");

        let graceful = GracefulShutdown::new();
        loop {
            tokio::select! {
                () = self.shutdown.cancelled() => break,
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(conn) => conn,
                        Err(err) => {
                            warn!(error = %err, "Failed to accept connection");
                            continue;
                        }
                    };

                    let io = TimedIo::new(stream, self.timeouts);
                    let busy = io.busy();
                    let service = service_fn(move |req| {
                        let busy = Arc::clone(&busy);
                        async move {
                            busy.store(true, Ordering::Release);
                            let response = handle_request(req).await;
                            busy.store(false, Ordering::Release);
                            response
                        }
                    });
                    let conn = http1::Builder::new()
                        .timer(TokioTimer::new())
                        .header_read_timeout(self.read_header_timeout)
                        .serve_connection(TokioIo::new(io), service);
                    let conn = graceful.watch(conn);
                    tokio::spawn(async move {
                        if let Err(err) = conn.await {
                            debug!(%peer, error = %err, "Error serving connection");
                        }
                    });
                }
            }
        }

        drop(listener);
        info!("Stopping server");
        let drained = tokio::time::timeout(self.shutdown_timeout, graceful.shutdown())
            .await
            .is_ok();
        self.state.send_replace(State::Stopped { drained });
        Ok(())
    }

    async fn bind(&self) -> Result<(TcpListener, SocketAddr)> {
        let bind_err = |source| ServerError::Bind {
            address: self.address.clone(),
            source,
        };
        let listener = TcpListener::bind(&self.address).await.map_err(bind_err)?;
        let local = listener.local_addr().map_err(bind_err)?;
        Ok((listener, local))
    }

    /// Stops the server gracefully within the shutdown timeout.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::ShutdownTimeout`] if in-flight connections are
    /// still open when the timeout expires.
    pub async fn stop(&self) -> Result<()> {
        let mut state = self.state.subscribe();
        self.shutdown.cancel();

        let idle = *state.borrow() == State::Idle;
        if idle {
            return Ok(());
        }

        let stopped = state.wait_for(|s| matches!(s, State::Stopped { .. }));
        let drained = match tokio::time::timeout(self.shutdown_timeout, stopped).await {
            Ok(Ok(s)) => *s == State::Stopped { drained: true },
            // The serving side is gone, nothing is left to drain
            Ok(Err(_)) => true,
            Err(_) => false,
        };

        if drained {
            info!("Server stopped");
            Ok(())
        } else {
            Err(ServerError::ShutdownTimeout(self.shutdown_timeout))
        }
    }
}

/// Answers every request; no routes are registered.
async fn handle_request(req: Request<Incoming>) -> std::result::Result<Response<Full<Bytes>>, Infallible> {
    debug!(method = %req.method(), path = %req.uri().path(), "No route matched");

    let mut response = Response::new(Full::new(Bytes::from_static(b"404 page not found\n")));
    *response.status_mut() = StatusCode::NOT_FOUND;
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    Ok(response)
}

/// Joins host and port, bracketing IPv6 literals.
fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}
