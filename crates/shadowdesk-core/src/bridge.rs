//! HTTP Proxy Bridge
//!
//! Local HTTP proxy that forwards everything through the SOCKS5 listener of
//! the proxy client, for applications that only speak HTTP proxies.
//!
//! ```text
//! App → HTTP proxy (127.0.0.1:1095) → SOCKS5 (127.0.0.1:1080) → server
//! ```
//!
//! `CONNECT` requests become raw tunnels. Absolute-form requests are
//! rewritten to origin-form and replayed over a SOCKS stream.

use crate::socks::{self, TargetAddr};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderValue, HOST, PROXY_AUTHORIZATION};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// How long `stop` waits for the accept loop to exit
const STOP_TIMEOUT: Duration = Duration::from_secs(3);

/// Bridge parameters
#[derive(Debug, Clone)]
pub struct BridgeOptions {
    /// Listen host (usually 127.0.0.1)
    pub host: String,
    /// Listen port
    pub port: u16,
    /// SOCKS5 port of the proxy client on 127.0.0.1
    pub proxy_port: u16,
}

impl BridgeOptions {
    /// Bridge on 127.0.0.1
    pub fn local(port: u16, proxy_port: u16) -> Self {
        Self {
            host: Ipv4Addr::LOCALHOST.to_string(),
            port,
            proxy_port,
        }
    }
}

/// Running listener
struct BridgeHandle {
    proxy_port: u16,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Registry of running bridges, keyed by listen address
#[derive(Clone, Default)]
pub struct HttpBridge {
    servers: Arc<Mutex<HashMap<SocketAddr, BridgeHandle>>>,
}

impl HttpBridge {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind and start serving. Returns the bound address.
    pub async fn create(&self, options: BridgeOptions) -> Result<SocketAddr, BridgeError> {
        let addr = listen_addr(&options.host, options.port)?;
        let mut servers = self.servers.lock().await;

        if options.port != 0 && servers.contains_key(&addr) {
            return Err(BridgeError::AlreadyRunning(addr));
        }

        let listener = TcpListener::bind(addr).await.map_err(|e| BridgeError::Bind {
            addr,
            reason: e.to_string(),
        })?;
        let local = listener.local_addr()?;

        let socks_addr = SocketAddr::from((Ipv4Addr::LOCALHOST, options.proxy_port));
        let (shutdown, rx) = watch::channel(false);
        let task = tokio::spawn(accept_loop(listener, socks_addr, rx));

        info!("HTTP bridge listening on {} (SOCKS5 {})", local, socks_addr);
        servers.insert(
            local,
            BridgeHandle {
                proxy_port: options.proxy_port,
                shutdown,
                task,
            },
        );

        Ok(local)
    }

    /// Stop the bridge on `host:port`. Unknown addresses are a no-op.
    pub async fn stop(&self, port: u16, host: &str) -> Result<(), BridgeError> {
        let addr = listen_addr(host, port)?;
        let handle = self.servers.lock().await.remove(&addr);

        match handle {
            Some(handle) => {
                Self::shutdown(addr, handle).await;
                Ok(())
            }
            None => {
                debug!("No HTTP bridge on {}", addr);
                Ok(())
            }
        }
    }

    /// Stop every bridge
    pub async fn stop_all(&self) {
        let handles: Vec<_> = self.servers.lock().await.drain().collect();
        for (addr, handle) in handles {
            Self::shutdown(addr, handle).await;
        }
    }

    /// Is a bridge serving `host:port`?
    pub async fn is_running(&self, port: u16, host: &str) -> bool {
        match listen_addr(host, port) {
            Ok(addr) => self.servers.lock().await.contains_key(&addr),
            Err(_) => false,
        }
    }

    /// Running bridges and the SOCKS port each forwards to
    pub async fn active(&self) -> Vec<(SocketAddr, u16)> {
        self.servers
            .lock()
            .await
            .iter()
            .map(|(addr, handle)| (*addr, handle.proxy_port))
            .collect()
    }

    async fn shutdown(addr: SocketAddr, handle: BridgeHandle) {
        let _ = handle.shutdown.send(true);
        let mut task = handle.task;
        if tokio::time::timeout(STOP_TIMEOUT, &mut task).await.is_err() {
            warn!("HTTP bridge on {} did not stop in time, aborting", addr);
            task.abort();
        }
        info!("HTTP bridge on {} stopped", addr);
    }
}

fn listen_addr(host: &str, port: u16) -> Result<SocketAddr, BridgeError> {
    let host = host.trim().trim_start_matches('[').trim_end_matches(']');
    let ip = if host.is_empty() || host.eq_ignore_ascii_case("localhost") {
        IpAddr::V4(Ipv4Addr::LOCALHOST)
    } else {
        host.parse()
            .map_err(|_| BridgeError::InvalidHost(host.to_string()))?
    };
    Ok(SocketAddr::new(ip, port))
}

async fn accept_loop(listener: TcpListener, socks_addr: SocketAddr, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!("Bridge connection from {}", peer);
                    tokio::spawn(serve(stream, socks_addr, shutdown.clone()));
                }
                Err(e) => {
                    warn!("Accept error: {}", e);
                }
            }
        }
    }
}

async fn serve(stream: TcpStream, socks_addr: SocketAddr, mut shutdown: watch::Receiver<bool>) {
    let tunnel_shutdown = shutdown.clone();
    let service = service_fn(move |req| proxy(req, socks_addr, tunnel_shutdown.clone()));

    let conn = http1::Builder::new()
        .preserve_header_case(true)
        .title_case_headers(true)
        .serve_connection(TokioIo::new(stream), service)
        .with_upgrades();

    tokio::select! {
        result = conn => {
            if let Err(e) = result {
                debug!("Bridge connection error: {}", e);
            }
        }
        _ = shutdown.changed() => {}
    }
}

async fn proxy(
    req: Request<Incoming>,
    socks_addr: SocketAddr,
    shutdown: watch::Receiver<bool>,
) -> Result<Response<ProxyBody>, hyper::Error> {
    if req.method() == Method::CONNECT {
        tunnel(req, socks_addr, shutdown).await
    } else {
        forward(req, socks_addr).await
    }
}

/// CONNECT: open the SOCKS stream first so failures surface as 502
async fn tunnel(
    req: Request<Incoming>,
    socks_addr: SocketAddr,
    mut shutdown: watch::Receiver<bool>,
) -> Result<Response<ProxyBody>, hyper::Error> {
    let Some(authority) = req.uri().authority().map(|a| a.as_str().to_string()) else {
        return Ok(text_response(StatusCode::BAD_REQUEST, "CONNECT must be to a socket address"));
    };
    let target = match TargetAddr::from_authority(&authority, 443) {
        Ok(target) => target,
        Err(e) => return Ok(text_response(StatusCode::BAD_REQUEST, e.to_string())),
    };

    let mut remote = match socks::connect(socks_addr, &target).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!("CONNECT {} failed: {}", target, e);
            return Ok(text_response(StatusCode::BAD_GATEWAY, e.to_string()));
        }
    };

    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                let mut upgraded = TokioIo::new(upgraded);
                tokio::select! {
                    result = tokio::io::copy_bidirectional(&mut upgraded, &mut remote) => {
                        match result {
                            Ok((up, down)) => debug!("Tunnel {} closed ({} up, {} down)", target, up, down),
                            Err(e) => debug!("Tunnel {} error: {}", target, e),
                        }
                    }
                    _ = shutdown.changed() => {}
                }
            }
            Err(e) => debug!("Upgrade for {} failed: {}", target, e),
        }
    });

    Ok(Response::new(empty()))
}

/// Absolute-form request: replay over a SOCKS stream in origin-form
async fn forward(
    mut req: Request<Incoming>,
    socks_addr: SocketAddr,
) -> Result<Response<ProxyBody>, hyper::Error> {
    let uri = req.uri().clone();
    if uri.scheme_str() != Some("http") {
        return Ok(text_response(StatusCode::BAD_REQUEST, "Only absolute http:// URIs can be proxied"));
    }
    let Some(authority) = uri.authority().cloned() else {
        return Ok(text_response(StatusCode::BAD_REQUEST, "Missing host"));
    };
    let target = match TargetAddr::from_authority(authority.as_str(), 80) {
        Ok(target) => target,
        Err(e) => return Ok(text_response(StatusCode::BAD_REQUEST, e.to_string())),
    };

    let stream = match socks::connect(socks_addr, &target).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!("{} {} failed: {}", req.method(), uri, e);
            return Ok(text_response(StatusCode::BAD_GATEWAY, e.to_string()));
        }
    };

    let (mut sender, conn) = match hyper::client::conn::http1::Builder::new()
        .preserve_header_case(true)
        .title_case_headers(true)
        .handshake(TokioIo::new(stream))
        .await
    {
        Ok(parts) => parts,
        Err(e) => return Ok(text_response(StatusCode::BAD_GATEWAY, e.to_string())),
    };
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!("Upstream connection error: {}", e);
        }
    });

    let origin_form = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/")
        .parse::<Uri>()
        .unwrap_or_else(|_| Uri::from_static("/"));
    *req.uri_mut() = origin_form;

    let headers = req.headers_mut();
    headers.remove("proxy-connection");
    headers.remove(PROXY_AUTHORIZATION);
    if !headers.contains_key(HOST) {
        if let Ok(value) = HeaderValue::from_str(authority.as_str()) {
            headers.insert(HOST, value);
        }
    }

    debug!("Forwarding {} {} via {}", req.method(), uri, socks_addr);
    match sender.send_request(req).await {
        Ok(response) => Ok(response.map(|body| body.boxed())),
        Err(e) => Ok(text_response(StatusCode::BAD_GATEWAY, e.to_string())),
    }
}

fn empty() -> ProxyBody {
    Full::new(Bytes::new()).map_err(|never| match never {}).boxed()
}

fn text_response(status: StatusCode, message: impl Into<Bytes>) -> Response<ProxyBody> {
    let mut response = Response::new(Full::new(message.into()).map_err(|never| match never {}).boxed());
    *response.status_mut() = status;
    response
}

/// Bridge errors
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("Failed to bind {addr}: {reason}")]
    Bind { addr: SocketAddr, reason: String },

    #[error("HTTP bridge already running on {0}")]
    AlreadyRunning(SocketAddr),

    #[error("Invalid listen host: {0}")]
    InvalidHost(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
