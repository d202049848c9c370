//! RPC Service
//!
//! Maps `{action, params}` requests onto the session manager, the prober and
//! the share-link codec. Every outcome is a [`ServiceResult`]; errors become
//! `code: 500` with the error text and never escape.

use crate::config::{Config, Settings};
use crate::fetch::HttpClient;
use crate::manager::{SessionError, SessionManager};
use crate::pac::{self, PacError};
use crate::probe::{self, ProbeError, ProbeReport, ProbeTarget, Prober};
use crate::runtime::RuntimeError;
use crate::subscription::{Subscription, SubscriptionFetcher};
use crate::uri;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::io::Cursor;
use std::sync::Arc;
use tracing::{debug, warn};

const CODE_OK: u16 = 200;
const CODE_ERROR: u16 = 500;

/// Incoming request
#[derive(Debug, Clone, Deserialize)]
pub struct Request {
    pub action: String,
    #[serde(default)]
    pub params: Value,
}

impl Request {
    pub fn new(action: impl Into<String>, params: Value) -> Self {
        Self {
            action: action.into(),
            params,
        }
    }
}

/// Response envelope
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceResult {
    pub code: u16,
    pub result: Value,
}

impl ServiceResult {
    pub fn ok(result: impl Serialize) -> Self {
        match serde_json::to_value(result) {
            Ok(result) => Self {
                code: CODE_OK,
                result,
            },
            Err(e) => Self::error(e),
        }
    }

    pub fn error(error: impl std::fmt::Display) -> Self {
        Self {
            code: CODE_ERROR,
            result: Value::String(error.to_string()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.code == CODE_OK
    }
}

/// System clipboard, read when `parseClipboardText` gets no text
pub trait Clipboard: Send + Sync {
    fn read_text(&self) -> Option<String>;
}

/// Clipboard that is always empty (headless use)
pub struct NoClipboard;

impl Clipboard for NoClipboard {
    fn read_text(&self) -> Option<String> {
        None
    }
}

/// Renders a share link as a scannable image
pub trait QrEncoder: Send + Sync {
    /// Image as a `data:` URL
    fn data_url(&self, text: &str) -> Result<String, String>;
}

/// PNG QR code, base64 `data:image/png` URL
pub struct PngQrEncoder {
    pub min_size: u32,
}

impl Default for PngQrEncoder {
    fn default() -> Self {
        Self { min_size: 200 }
    }
}

impl QrEncoder for PngQrEncoder {
    fn data_url(&self, text: &str) -> Result<String, String> {
        let code = qrcode::QrCode::new(text.as_bytes()).map_err(|e| e.to_string())?;
        let image = code
            .render::<image::Luma<u8>>()
            .min_dimensions(self.min_size, self.min_size)
            .build();

        let mut png = Vec::new();
        image::DynamicImage::ImageLuma8(image)
            .write_to(&mut Cursor::new(&mut png), image::ImageFormat::Png)
            .map_err(|e| e.to_string())?;

        Ok(format!("data:image/png;base64,{}", STANDARD.encode(png)))
    }
}

// ===== Params =====

#[derive(Deserialize)]
struct StartClientParams {
    config: Config,
    settings: Settings,
}

#[derive(Deserialize, Default, Clone, Copy, PartialEq)]
#[serde(rename_all = "lowercase")]
enum ClipboardKind {
    #[default]
    Url,
    Subscription,
}

#[derive(Deserialize)]
struct ParseClipboardParams {
    #[serde(default)]
    text: String,
    #[serde(default, rename = "type")]
    kind: ClipboardKind,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartBridgeParams {
    port: u16,
    proxy_port: u16,
}

#[derive(Deserialize)]
struct StopBridgeParams {
    port: u16,
}

#[derive(Deserialize)]
struct TcpPingParams {
    host: String,
    port: u16,
    #[serde(default)]
    attempts: Option<usize>,
}

#[derive(Deserialize)]
struct AclParams {
    text: String,
}

#[derive(Deserialize)]
struct ProbeServersParams {
    servers: Vec<Config>,
}

#[derive(Deserialize, Default)]
struct GfwListParams {
    #[serde(default)]
    url: Option<String>,
}

/// Shape of `generateUrlFromConfig` results
#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeneratedUrl {
    data_url: String,
    url: String,
    msg: String,
}

/// One row of `probeServers`
#[derive(Serialize)]
struct ProbedServer {
    id: String,
    #[serde(flatten)]
    report: Option<ProbeReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// Request dispatcher
pub struct MainService {
    manager: Arc<SessionManager>,
    prober: Arc<Prober>,
    http: Arc<HttpClient>,
    subscriptions: SubscriptionFetcher,
    clipboard: Arc<dyn Clipboard>,
    qr: Arc<dyn QrEncoder>,
}

impl MainService {
    /// Create a service with no clipboard and the PNG QR encoder
    pub fn new(manager: Arc<SessionManager>, prober: Arc<Prober>, http: Arc<HttpClient>) -> Self {
        Self {
            manager,
            prober,
            subscriptions: SubscriptionFetcher::new(http.clone()),
            http,
            clipboard: Arc::new(NoClipboard),
            qr: Arc::new(PngQrEncoder::default()),
        }
    }

    pub fn with_clipboard(mut self, clipboard: Arc<dyn Clipboard>) -> Self {
        self.clipboard = clipboard;
        self
    }

    pub fn with_qr_encoder(mut self, qr: Arc<dyn QrEncoder>) -> Self {
        self.qr = qr;
        self
    }

    /// Session manager behind this service
    pub fn manager(&self) -> &Arc<SessionManager> {
        &self.manager
    }

    /// Handle one request
    pub async fn handle(&self, request: Request) -> ServiceResult {
        debug!("RPC {}", request.action);
        let action = request.action.clone();
        match self.dispatch(request).await {
            Ok(result) => result,
            Err(e) => {
                warn!("RPC {} failed: {}", action, e);
                ServiceResult::error(e)
            }
        }
    }

    async fn dispatch(&self, request: Request) -> Result<ServiceResult, ServiceError> {
        let Request { action, params } = request;

        match action.as_str() {
            "isConnected" => Ok(ServiceResult::ok(self.manager.is_connected())),

            "getSessionState" => Ok(ServiceResult::ok(self.manager.info().await)),

            "startClient" => {
                let p: StartClientParams = decode(&action, params)?;
                self.manager.start(&p.config, &p.settings).await?;
                Ok(ServiceResult::ok(Value::Null))
            }

            "stopClient" => {
                self.manager.stop().await?;
                Ok(ServiceResult::ok(Value::Null))
            }

            "parseClipboardText" => {
                let p: ParseClipboardParams = decode(&action, params)?;
                Ok(self.parse_clipboard_text(p).await)
            }

            "generateUrlFromConfig" => Ok(self.generate_url(params)),

            "startHttpProxyServer" => {
                let p: StartBridgeParams = decode(&action, params)?;
                self.manager.start_bridge(p.port, p.proxy_port).await?;
                Ok(ServiceResult::ok(""))
            }

            "stopHttpProxyServer" => {
                let p: StopBridgeParams = decode(&action, params)?;
                self.manager.stop_bridge(p.port).await?;
                Ok(ServiceResult::ok(""))
            }

            "tcpPing" => {
                let p: TcpPingParams = decode(&action, params)?;
                let attempts = p.attempts.unwrap_or(self.prober.options().attempts);
                let report = self.prober.probe_with(&p.host, p.port, attempts).await?;
                Ok(ServiceResult::ok(report))
            }

            "probeServers" => {
                let p: ProbeServersParams = decode(&action, params)?;
                Ok(ServiceResult::ok(self.probe_servers(p.servers).await))
            }

            "setAclConfFile" => {
                let p: AclParams = decode(&action, params)?;
                let path = self.manager.runtime().write_acl(&p.text).await?;
                Ok(ServiceResult::ok(path.display().to_string()))
            }

            "updateGfwList" => {
                let p: GfwListParams = if params.is_null() {
                    GfwListParams::default()
                } else {
                    decode(&action, params)?
                };
                let url = p.url.unwrap_or_else(|| pac::DEFAULT_GFWLIST_URL.to_string());
                let count = pac::update_gfwlist(&self.http, self.manager.runtime(), &url).await?;
                self.manager.reload_pac().await;
                Ok(ServiceResult::ok(json!({ "domains": count })))
            }

            _ => Err(ServiceError::UnknownAction(action)),
        }
    }

    async fn parse_clipboard_text(&self, params: ParseClipboardParams) -> ServiceResult {
        let text = if params.text.trim().is_empty() {
            self.clipboard.read_text().unwrap_or_default()
        } else {
            params.text
        };

        match params.kind {
            ClipboardKind::Url => match uri::parse(&text) {
                Ok(parsed) => ServiceResult::ok(parsed.into_servers()),
                Err(e) => {
                    debug!("Clipboard text is not a share link: {}", e);
                    ServiceResult::ok(Vec::<Config>::new())
                }
            },
            ClipboardKind::Subscription => match self.subscriptions.fetch(&text).await {
                Ok(subscription) => ServiceResult::ok(subscription),
                Err(e) => {
                    warn!("Subscription {} unusable: {}", text.trim(), e);
                    ServiceResult::ok(Subscription::empty())
                }
            },
        }
    }

    fn generate_url(&self, params: Value) -> ServiceResult {
        let link = serde_json::from_value::<Config>(params.clone())
            .map(|config| uri::generate(&config))
            .unwrap_or_default();

        if link.is_empty() {
            let generated = GeneratedUrl {
                msg: format!("Invalid Conf: {}", params),
                ..GeneratedUrl::default()
            };
            return ServiceResult {
                code: CODE_ERROR,
                result: serde_json::to_value(generated).unwrap_or(Value::Null),
            };
        }

        let mut generated = GeneratedUrl {
            url: link,
            ..GeneratedUrl::default()
        };
        let mut code = CODE_OK;
        match self.qr.data_url(&generated.url) {
            Ok(data_url) => generated.data_url = data_url,
            Err(e) => {
                code = CODE_ERROR;
                generated.msg = e;
            }
        }

        ServiceResult {
            code,
            result: serde_json::to_value(generated).unwrap_or(Value::Null),
        }
    }

    async fn probe_servers(&self, servers: Vec<Config>) -> Value {
        let targets = servers
            .into_iter()
            .map(|c| ProbeTarget {
                id: c.id,
                host: c.server_host,
                port: c.server_port,
            })
            .collect();

        let results = self.prober.probe_many(targets).await;
        let summaries: Vec<_> = results
            .iter()
            .filter_map(|(id, r)| r.as_ref().ok().map(|r| (id.clone(), r.summary.clone())))
            .collect();
        let best = probe::best_candidate(&summaries).map(str::to_string);

        let rows: Vec<ProbedServer> = results
            .into_iter()
            .map(|(id, result)| match result {
                Ok(report) => ProbedServer {
                    id,
                    report: Some(report),
                    error: None,
                },
                Err(e) => ProbedServer {
                    id,
                    report: None,
                    error: Some(e.to_string()),
                },
            })
            .collect();

        json!({ "servers": rows, "best": best })
    }
}

fn decode<T: DeserializeOwned>(action: &str, params: Value) -> Result<T, ServiceError> {
    serde_json::from_value(params).map_err(|e| ServiceError::InvalidParams {
        action: action.to_string(),
        reason: e.to_string(),
    })
}

/// Service errors (reported as `code: 500`)
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("Unknown action: {0}")]
    UnknownAction(String),

    #[error("Invalid params for {action}: {reason}")]
    InvalidParams { action: String, reason: String },

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Probe(#[from] ProbeError),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error(transparent)]
    Pac(#[from] PacError),
}
