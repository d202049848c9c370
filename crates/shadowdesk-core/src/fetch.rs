//! HTTP Fetcher
//!
//! Small GET-only client for subscription and GFW list downloads.
//! HTTP/1.1 over hyper, rustls with webpki roots for https, explicit
//! connect and total timeouts, bounded redirects and a body size cap.

use http_body_util::{BodyExt, Empty, Limited};
use hyper::body::Bytes;
use hyper::header::{HeaderMap, CONTENT_TYPE, HOST, LOCATION, USER_AGENT};
use hyper::{Method, Request, StatusCode};
use rustls::ClientConfig;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};
use url::Url;

/// Fetcher configuration
#[derive(Debug, Clone)]
pub struct FetchOptions {
    /// Whole-request timeout, redirects included
    pub timeout: Duration,
    /// TCP + TLS connect timeout
    pub connect_timeout: Duration,
    /// User-Agent string
    pub user_agent: String,
    /// Maximum response body size
    pub max_body_size: usize,
    /// Redirects followed before giving up
    pub max_redirects: usize,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(15),
            connect_timeout: Duration::from_secs(10),
            user_agent: format!("shadowdesk/{}", env!("CARGO_PKG_VERSION")),
            max_body_size: 8 * 1024 * 1024, // 8 MB
            max_redirects: 5,
        }
    }
}

/// Downloaded response
#[derive(Debug)]
pub struct Response {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
    pub total_time: Duration,
    /// Final URL (after redirects)
    pub final_url: Url,
}

impl Response {
    /// Check if response was successful (2xx)
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Body as UTF-8 text (lossy)
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Get Content-Type header
    pub fn content_type(&self) -> Option<&str> {
        self.headers.get(CONTENT_TYPE)?.to_str().ok()
    }
}

/// GET client
pub struct HttpClient {
    options: FetchOptions,
    tls: TlsConnector,
}

impl HttpClient {
    /// Create a new client
    pub fn new(options: FetchOptions) -> Self {
        let mut root_store = rustls::RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        let tls_config = ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();

        debug!(
            "HTTP fetcher initialized (timeout: {:?}, redirects: {})",
            options.timeout, options.max_redirects
        );

        Self {
            options,
            tls: TlsConnector::from(Arc::new(tls_config)),
        }
    }

    /// Create with default configuration
    pub fn with_defaults() -> Self {
        Self::new(FetchOptions::default())
    }

    /// Current options
    pub fn options(&self) -> &FetchOptions {
        &self.options
    }

    /// GET `url`, following redirects. Non-2xx responses are returned as-is.
    pub async fn get(&self, url: &str) -> Result<Response, FetchError> {
        let url = Url::parse(url).map_err(|e| FetchError::InvalidUrl(format!("{}: {}", url, e)))?;

        tokio::time::timeout(self.options.timeout, self.follow(url))
            .await
            .map_err(|_| FetchError::Timeout)?
    }

    /// GET `url` and require a 2xx status
    pub async fn get_text(&self, url: &str) -> Result<String, FetchError> {
        let response = self.get(url).await?;
        if !response.is_success() {
            return Err(FetchError::Status(response.status.as_u16()));
        }
        Ok(response.text())
    }

    async fn follow(&self, mut url: Url) -> Result<Response, FetchError> {
        let start = Instant::now();
        let mut redirects = 0;

        loop {
            let (status, headers, body) = self.fetch_once(&url).await?;

            if status.is_redirection() {
                if let Some(location) = headers.get(LOCATION).and_then(|v| v.to_str().ok()) {
                    if redirects >= self.options.max_redirects {
                        return Err(FetchError::TooManyRedirects(self.options.max_redirects));
                    }
                    let next = url
                        .join(location)
                        .map_err(|e| FetchError::InvalidUrl(format!("{}: {}", location, e)))?;
                    debug!("Redirect {} -> {}", url, next);
                    url = next;
                    redirects += 1;
                    continue;
                }
            }

            let total_time = start.elapsed();
            info!("GET {} -> {} ({} bytes, {:?})", url, status, body.len(), total_time);

            return Ok(Response {
                status,
                headers,
                body,
                total_time,
                final_url: url,
            });
        }
    }

    async fn fetch_once(&self, url: &Url) -> Result<(StatusCode, HeaderMap, Vec<u8>), FetchError> {
        let is_https = match url.scheme() {
            "https" => true,
            "http" => false,
            other => return Err(FetchError::InvalidUrl(format!("unsupported scheme: {}", other))),
        };
        let host = url
            .host_str()
            .ok_or_else(|| FetchError::InvalidUrl("No host in URL".to_string()))?;
        let port = url
            .port_or_known_default()
            .ok_or_else(|| FetchError::InvalidUrl("No port in URL".to_string()))?;

        let mut path = url.path().to_string();
        if let Some(query) = url.query() {
            path.push('?');
            path.push_str(query);
        }

        let host_header = match url.port() {
            Some(p) => format!("{}:{}", host, p),
            None => host.to_string(),
        };

        let request = Request::builder()
            .method(Method::GET)
            .uri(path)
            .header(HOST, host_header)
            .header(USER_AGENT, &self.options.user_agent)
            .body(Empty::<Bytes>::new())
            .map_err(|e| FetchError::Http(e.to_string()))?;

        let connect_host = host.trim_start_matches('[').trim_end_matches(']');
        let stream = tokio::time::timeout(
            self.options.connect_timeout,
            TcpStream::connect((connect_host, port)),
        )
        .await
        .map_err(|_| FetchError::Timeout)?
        .map_err(|e| FetchError::Connect(format!("{}:{}: {}", host, port, e)))?;

        if is_https {
            let server_name = rustls::pki_types::ServerName::try_from(connect_host.to_string())
                .map_err(|_| FetchError::Tls("Invalid server name".to_string()))?;
            let tls_stream = tokio::time::timeout(
                self.options.connect_timeout,
                self.tls.connect(server_name, stream),
            )
            .await
            .map_err(|_| FetchError::Timeout)?
            .map_err(|e| FetchError::Tls(e.to_string()))?;

            self.send(tls_stream, request).await
        } else {
            self.send(stream, request).await
        }
    }

    async fn send<S>(
        &self,
        stream: S,
        request: Request<Empty<Bytes>>,
    ) -> Result<(StatusCode, HeaderMap, Vec<u8>), FetchError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| FetchError::Http(e.to_string()))?;

        tokio::spawn(async move {
            if let Err(e) = conn.await {
                warn!("Connection error: {}", e);
            }
        });

        let response = sender
            .send_request(request)
            .await
            .map_err(|e| FetchError::Http(e.to_string()))?;

        let status = response.status();
        let headers = response.headers().clone();

        let collected = Limited::new(response.into_body(), self.options.max_body_size)
            .collect()
            .await
            .map_err(|e| {
                if e.downcast_ref::<http_body_util::LengthLimitError>().is_some() {
                    FetchError::BodyTooLarge(self.options.max_body_size)
                } else {
                    FetchError::Body(e.to_string())
                }
            })?;

        Ok((status, headers, collected.to_bytes().to_vec()))
    }
}

impl Default for HttpClient {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Fetch errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum FetchError {
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Unexpected HTTP status {0}")]
    Status(u16),

    #[error("Too many redirects (max {0})")]
    TooManyRedirects(usize),

    #[error("Response body exceeds {0} bytes")]
    BodyTooLarge(usize),

    #[error("Body read error: {0}")]
    Body(String),

    #[error("Request timeout")]
    Timeout,
}

/// Canned HTTP/1.1 responder for tests
#[cfg(test)]
pub(crate) mod test_server {
    use std::net::SocketAddr;
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve `respond(path)` as raw HTTP responses, one per connection
    pub(crate) async fn spawn<F>(respond: F) -> SocketAddr
    where
        F: Fn(&str) -> String + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let respond = Arc::new(respond);

        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let respond = respond.clone();
                tokio::spawn(async move {
                    let mut buf = Vec::new();
                    let mut chunk = [0u8; 1024];
                    while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
                        match stream.read(&mut chunk).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => buf.extend_from_slice(&chunk[..n]),
                        }
                    }
                    let head = String::from_utf8_lossy(&buf);
                    let path = head.split_whitespace().nth(1).unwrap_or("/").to_string();
                    let _ = stream.write_all(respond(&path).as_bytes()).await;
                    let _ = stream.shutdown().await;
                });
            }
        });

        addr
    }

    /// 200 response with a body
    pub(crate) fn ok(body: &str) -> String {
        format!(
            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            body.len(),
            body
        )
    }

    /// 302 response pointing at `location`
    pub(crate) fn redirect(location: &str) -> String {
        format!(
            "HTTP/1.1 302 Found\r\nLocation: {}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
            location
        )
    }

    /// Bare status response
    pub(crate) fn status(code: u16) -> String {
        format!(
            "HTTP/1.1 {} Error\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
            code
        )
    }
}
