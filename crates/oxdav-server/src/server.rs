//! HTTP server lifecycle management.
//!
//! This module provides the HTTP server that feeds requests to the
//! dispatcher and handles the server lifecycle (start, stop).

use crate::body::{request_body, DavBody};
use http::header::HOST;
use http::{HeaderName, HeaderValue, StatusCode};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use oxdav_core::{CancelFlag, DavRequest, DavResponse, Dispatcher};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Configuration for the HTTP server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Port to bind to (0 = auto-assign).
    pub port: u16,

    /// Bind address.
    pub bind_address: IpAddr,

    /// How often expired locks and idle guards are purged. Zero disables the reaper.
    #[serde(with = "humantime_serde")]
    pub reaper_interval: Duration,

    /// Header carrying the authenticated principal, set by a trusted proxy.
    pub principal_header: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 0, // Auto-assign
            bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            reaper_interval: Duration::from_secs(30),
            principal_header: None,
        }
    }
}

/// A running WebDAV server instance.
pub struct WebDavServer {
    /// The actual bound address.
    pub addr: SocketAddr,
    /// Shutdown signal sender.
    shutdown_tx: Option<oneshot::Sender<()>>,
    /// Server task handle.
    server_handle: Option<tokio::task::JoinHandle<()>>,
}

impl WebDavServer {
    /// Bind the listener and start serving `dav`.
    pub async fn start(dav: Arc<Dispatcher>, config: ServerConfig) -> io::Result<Self> {
        let principal_header = config
            .principal_header
            .as_deref()
            .map(|name| {
                HeaderName::from_bytes(name.as_bytes()).map_err(|e| {
                    io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!("invalid principal header {name:?}: {e}"),
                    )
                })
            })
            .transpose()?;

        let addr = SocketAddr::new(config.bind_address, config.port);
        let listener = TcpListener::bind(addr).await?;
        let actual_addr = listener.local_addr()?;

        info!(addr = %actual_addr, "Starting WebDAV server");

        let service = Arc::new(DavService {
            dav: dav.clone(),
            principal_header,
        });
        let reaper_interval = config.reaper_interval;

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let server_handle = tokio::spawn(async move {
            tokio::select! {
                () = run_server(listener, service) => {
                    debug!("Server loop ended");
                }
                () = run_reaper(dav, reaper_interval) => {
                    debug!("Reaper ended");
                }
                _ = shutdown_rx => {
                    info!("Received shutdown signal");
                }
            }
        });

        Ok(Self {
            addr: actual_addr,
            shutdown_tx: Some(shutdown_tx),
            server_handle: Some(server_handle),
        })
    }

    /// Get the URL for this server.
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Stop the server.
    pub async fn stop(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.server_handle.take() {
            let _ = handle.await;
        }
        info!("WebDAV server stopped");
    }

    /// Stop the server synchronously (for use in Drop).
    fn stop_sync(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.server_handle.take() {
            handle.abort();
        }
    }
}

impl Drop for WebDavServer {
    fn drop(&mut self) {
        self.stop_sync();
    }
}

/// Per-server request state shared by every connection.
struct DavService {
    dav: Arc<Dispatcher>,
    principal_header: Option<HeaderName>,
}

impl DavService {
    async fn call(&self, req: Request<Incoming>) -> Response<DavBody> {
        let (parts, body) = req.into_parts();

        let uri = parts
            .uri
            .path_and_query()
            .map_or_else(|| "/".to_string(), |pq| pq.as_str().to_string());

        // HTTP/2 carries the authority in the URI instead of a Host header.
        let mut headers = parts.headers;
        if !headers.contains_key(HOST)
            && let Some(authority) = parts.uri.authority()
            && let Ok(value) = HeaderValue::from_str(authority.as_str())
        {
            headers.insert(HOST, value);
        }

        let principal = self
            .principal_header
            .as_ref()
            .and_then(|name| headers.get(name))
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);

        let cancel = CancelFlag::new();
        let mut on_drop = CancelOnDrop(Some(cancel.clone()));

        let request = DavRequest {
            method: parts.method,
            uri,
            headers,
            body: request_body(body),
            principal,
            cancel,
        };

        let dav = self.dav.clone();
        let response = match tokio::task::spawn_blocking(move || dav.handle(request)).await {
            Ok(response) => response,
            Err(e) => {
                error!(error = %e, "Dispatcher task failed");
                DavResponse::new(StatusCode::INTERNAL_SERVER_ERROR)
            }
        };
        on_drop.disarm();

        response.into_http().map(DavBody::from)
    }
}

/// Cancels the in-flight request if hyper drops its future (client went away).
struct CancelOnDrop(Option<CancelFlag>);

impl CancelOnDrop {
    fn disarm(&mut self) {
        self.0 = None;
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if let Some(flag) = self.0.take() {
            debug!("Connection dropped mid-request, cancelling");
            flag.cancel();
        }
    }
}

/// Run the server accept loop.
async fn run_server(listener: TcpListener, service: Arc<DavService>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer_addr)) => {
                let service = service.clone();
                tokio::spawn(async move {
                    let io = TokioIo::new(stream);
                    let svc = service_fn(move |req: Request<Incoming>| {
                        let service = service.clone();
                        async move { Ok::<_, Infallible>(service.call(req).await) }
                    });

                    if let Err(e) = auto::Builder::new(TokioExecutor::new())
                        .serve_connection(io, svc)
                        .await
                    {
                        // With auto protocol negotiation, aborted clients and
                        // genuine failures look the same here.
                        warn!(peer = %peer_addr, error = %e, "HTTP connection error");
                    }
                });
            }
            Err(e) => {
                error!(error = %e, "Failed to accept connection");
            }
        }
    }
}

/// Periodically purge expired locks and unused guards.
async fn run_reaper(dav: Arc<Dispatcher>, every: Duration) {
    if every.is_zero() {
        return std::future::pending().await;
    }
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let purged = dav.locks().purge_expired();
        let pruned = dav.guards().prune();
        if purged > 0 || pruned > 0 {
            debug!(purged, pruned, "Reaped expired locks and idle guards");
        }
    }
}
