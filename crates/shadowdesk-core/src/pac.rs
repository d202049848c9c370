//! PAC Server and GFW List
//!
//! In PAC mode the system proxy points at `http://127.0.0.1:<pacPort>/`.
//! The script served there sends domains from the GFW list through the
//! local SOCKS5 listener and everything else direct.

use crate::fetch::HttpClient;
use crate::runtime::RuntimeDir;
use crate::uri::decode_b64;
use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderValue, CACHE_CONTROL, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use std::collections::{BTreeMap, BTreeSet};
use std::convert::Infallible;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, RwLock};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Default AutoProxy list
pub const DEFAULT_GFWLIST_URL: &str =
    "https://raw.githubusercontent.com/gfwlist/gfwlist/master/gfwlist.txt";

const PAC_CONTENT_TYPE: &str = "application/x-ns-proxy-autoconfig";

/// Extract proxied domains from an AutoProxy list (plain or base64)
pub fn parse_gfwlist(text: &str) -> Vec<String> {
    let decoded;
    let text = if text.contains("||") || text.contains("[AutoProxy") {
        text
    } else {
        let compact: String = text.chars().filter(|c| !c.is_whitespace()).collect();
        decoded = decode_b64(&compact)
            .and_then(|bytes| String::from_utf8(bytes).ok())
            .unwrap_or_default();
        if decoded.is_empty() { text } else { decoded.as_str() }
    };

    let mut domains = BTreeSet::new();
    for line in text.lines().map(str::trim) {
        if let Some(domain) = rule_domain(line) {
            domains.insert(domain);
        }
    }
    domains.into_iter().collect()
}

/// Domain a single AutoProxy rule refers to
fn rule_domain(rule: &str) -> Option<String> {
    if rule.is_empty() || rule.starts_with('!') || rule.starts_with('[') || rule.starts_with("@@") {
        return None;
    }
    // Regex rules
    if rule.starts_with('/') && rule.ends_with('/') {
        return None;
    }

    let rest = if let Some(r) = rule.strip_prefix("||") {
        r
    } else if let Some(r) = rule.strip_prefix('|') {
        r.split_once("://").map(|(_, r)| r).unwrap_or(r)
    } else {
        rule.trim_start_matches('.')
    };

    let host = rest
        .split(['/', '^', ':', '?'])
        .next()
        .unwrap_or_default()
        .trim_start_matches("*.")
        .trim_start_matches('.')
        .to_ascii_lowercase();

    let valid = host.contains('.')
        && !host.ends_with('.')
        && host
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.');
    valid.then_some(host)
}

/// Render a PAC script routing `domains` via SOCKS5 on `socks_port`
///
/// An empty list proxies everything.
pub fn render_pac(domains: &[String], socks_port: u16) -> String {
    let proxy = format!(
        "SOCKS5 127.0.0.1:{port}; SOCKS 127.0.0.1:{port}; DIRECT",
        port = socks_port
    );
    let table: BTreeMap<&str, u8> = domains.iter().map(|d| (d.as_str(), 1)).collect();
    let table = serde_json::to_string(&table).unwrap_or_else(|_| "{}".to_string());

    format!(
        r#"var proxy = "{proxy}";
var direct = "DIRECT";
var proxyAll = {proxy_all};
var domains = {table};

function FindProxyForURL(url, host) {{
    if (proxyAll) {{
        return proxy;
    }}
    var suffix = host;
    for (;;) {{
        if (Object.prototype.hasOwnProperty.call(domains, suffix)) {{
            return proxy;
        }}
        var pos = suffix.indexOf(".");
        if (pos < 0) {{
            break;
        }}
        suffix = suffix.substring(pos + 1);
    }}
    return direct;
}}
"#,
        proxy = proxy,
        proxy_all = domains.is_empty(),
        table = table,
    )
}

/// Download the list, check it parses, cache it. Returns the domain count.
pub async fn update_gfwlist(
    client: &HttpClient,
    runtime: &RuntimeDir,
    url: &str,
) -> Result<usize, PacError> {
    info!("Updating GFW list from {}", url);
    let text = client
        .get_text(url)
        .await
        .map_err(|e| PacError::Download(e.to_string()))?;

    let count = parse_gfwlist(&text).len();
    if count == 0 {
        return Err(PacError::EmptyList);
    }

    runtime
        .write_gfwlist(&text)
        .await
        .map_err(|e| PacError::Io(e.to_string()))?;
    info!("GFW list updated ({} domains)", count);
    Ok(count)
}

/// Domains from the cached list (empty when none is cached)
pub async fn cached_domains(runtime: &RuntimeDir) -> Vec<String> {
    match runtime.read_gfwlist().await {
        Ok(Some(text)) => parse_gfwlist(&text),
        Ok(None) => Vec::new(),
        Err(e) => {
            warn!("Failed to read cached GFW list: {}", e);
            Vec::new()
        }
    }
}

/// Running PAC listener
pub struct PacServer {
    addr: SocketAddr,
    script: Arc<RwLock<Bytes>>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl PacServer {
    /// Bind `host:port` and serve `script` on every path
    pub async fn start(host: IpAddr, port: u16, script: String) -> Result<Self, PacError> {
        let addr = SocketAddr::new(host, port);
        let listener = TcpListener::bind(addr).await.map_err(|e| PacError::Bind {
            addr,
            reason: e.to_string(),
        })?;
        let addr = listener
            .local_addr()
            .map_err(|e| PacError::Io(e.to_string()))?;

        let script = Arc::new(RwLock::new(Bytes::from(script)));
        let (shutdown, rx) = watch::channel(false);
        let task = tokio::spawn(serve(listener, script.clone(), rx));

        info!("PAC server listening on http://{}/", addr);
        Ok(Self {
            addr,
            script,
            shutdown,
            task,
        })
    }

    /// Start on 127.0.0.1
    pub async fn start_local(port: u16, script: String) -> Result<Self, PacError> {
        Self::start(IpAddr::V4(Ipv4Addr::LOCALHOST), port, script).await
    }

    /// Bound address
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// URL to hand to the system proxy settings
    pub fn url(&self) -> String {
        format!("http://{}/proxy.pac", self.addr)
    }

    /// Replace the served script
    pub fn set_script(&self, script: String) {
        if let Ok(mut current) = self.script.write() {
            *current = Bytes::from(script);
        }
    }

    /// Stop serving and release the port
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            warn!("PAC server task failed: {}", e);
        }
        info!("PAC server on {} stopped", self.addr);
    }
}

async fn serve(listener: TcpListener, script: Arc<RwLock<Bytes>>, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!("PAC request from {}", peer);
                    let script = script.clone();
                    let service = service_fn(move |req| respond(req, script.clone()));
                    tokio::spawn(async move {
                        if let Err(e) = http1::Builder::new()
                            .serve_connection(TokioIo::new(stream), service)
                            .await
                        {
                            debug!("PAC connection error: {}", e);
                        }
                    });
                }
                Err(e) => warn!("Accept error: {}", e),
            }
        }
    }
}

async fn respond(
    _req: Request<Incoming>,
    script: Arc<RwLock<Bytes>>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let body = script.read().map(|s| s.clone()).unwrap_or_default();
    let mut response = Response::new(Full::new(body));
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(PAC_CONTENT_TYPE));
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    Ok(response)
}

/// PAC errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum PacError {
    #[error("Failed to bind PAC server on {addr}: {reason}")]
    Bind { addr: SocketAddr, reason: String },

    #[error("GFW list download failed: {0}")]
    Download(String),

    #[error("GFW list contains no usable rules")]
    EmptyList,

    #[error("IO error: {0}")]
    Io(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::test_server;
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;

    const SAMPLE: &str = "[AutoProxy 0.2.9]\n\
        ! Comment line\n\
        ||google.com\n\
        |http://example.org/path\n\
        .twitter.com\n\
        @@||allowed.cn\n\
        /^https?:\\/\\/[^\\/]+blogspot\\.(.*)/\n\
        *.wildcard.net\n\
        keyword\n";

    #[test]
    fn test_parse_plain_list() {
        let domains = parse_gfwlist(SAMPLE);
        assert_eq!(
            domains,
            vec!["example.org", "google.com", "twitter.com", "wildcard.net"]
        );
    }

    #[test]
    fn test_parse_base64_list() {
        let encoded = STANDARD.encode(SAMPLE);
        // Published list wraps lines at 64 columns
        let wrapped: String = encoded
            .as_bytes()
            .chunks(64)
            .map(|c| format!("{}\n", String::from_utf8_lossy(c)))
            .collect();
        assert_eq!(parse_gfwlist(&wrapped), parse_gfwlist(SAMPLE));
    }

    #[test]
    fn test_render_pac() {
        let script = render_pac(&["google.com".to_string()], 1080);
        assert!(script.contains("SOCKS5 127.0.0.1:1080; SOCKS 127.0.0.1:1080; DIRECT"));
        assert!(script.contains("\"google.com\":1"));
        assert!(script.contains("var proxyAll = false;"));
        assert!(script.contains("function FindProxyForURL"));

        let all = render_pac(&[], 1081);
        assert!(all.contains("var proxyAll = true;"));
    }

    #[tokio::test]
    async fn test_pac_server_serves_script() {
        let server = PacServer::start_local(0, render_pac(&[], 1080)).await.unwrap();
        let client = HttpClient::with_defaults();

        let response = client.get(&server.url()).await.unwrap();
        assert!(response.is_success());
        assert_eq!(response.content_type(), Some(PAC_CONTENT_TYPE));
        assert!(response.text().contains("FindProxyForURL"));

        server.set_script("function FindProxyForURL() { return \"DIRECT\"; }".into());
        let updated = client.get_text(&server.url()).await.unwrap();
        assert!(updated.contains("return \"DIRECT\""));

        let addr = server.addr();
        server.stop().await;
        assert!(TcpListener::bind(addr).await.is_ok());
    }

    #[tokio::test]
    async fn test_update_gfwlist_caches() {
        let body = STANDARD.encode(SAMPLE);
        let addr = test_server::spawn(move |_| test_server::ok(&body)).await;
        let tmp = tempfile::tempdir().unwrap();
        let runtime = RuntimeDir::new(tmp.path());
        let client = HttpClient::with_defaults();

        let count = update_gfwlist(&client, &runtime, &format!("http://{}/gfwlist.txt", addr))
            .await
            .unwrap();
        assert_eq!(count, 4);
        assert_eq!(cached_domains(&runtime).await.len(), 4);
    }

    #[tokio::test]
    async fn test_update_gfwlist_rejects_empty() {
        let addr = test_server::spawn(|_| test_server::ok("! nothing here")).await;
        let tmp = tempfile::tempdir().unwrap();
        let runtime = RuntimeDir::new(tmp.path());

        let result = update_gfwlist(
            &HttpClient::with_defaults(),
            &runtime,
            &format!("http://{}/", addr),
        )
        .await;
        assert!(matches!(result, Err(PacError::EmptyList)));
        assert!(cached_domains(&runtime).await.is_empty());
    }
}
