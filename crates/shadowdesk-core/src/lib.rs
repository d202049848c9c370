//! shadowdesk - Proxy Session Orchestrator
//!
//! Runs an external `ss-local` / `ssr-local` client for a selected server,
//! bridges local HTTP traffic onto its SOCKS5 port, serves a PAC script,
//! probes servers and encodes/decodes share links and subscriptions.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                      MainService                           │
//! │          {action, params}  ──▶  {code, result}             │
//! └───────┬───────────────────────────┬──────────────┬─────────┘
//!         │                           │              │
//!         ▼                           ▼              ▼
//! ┌────────────────┐          ┌─────────────┐  ┌─────────────┐
//! │ SessionManager │          │   Prober    │  │ uri / subs  │
//! └──┬──────┬───┬──┘          └─────────────┘  └─────────────┘
//!    │      │   │
//!    ▼      │   ▼
//! ┌──────┐  │ ┌───────────┐   HTTP   ┌─────────────────────┐
//! │ PAC  │  │ │ HttpBridge│ ───────▶ │ ss-local (SOCKS5)   │──▶ server
//! └──────┘  │ └───────────┘  SOCKS5  │ 127.0.0.1:localPort │
//!           └──────────────────────▶ └─────────────────────┘
//!                 ProxyClient (spawn / supervise / terminate)
//! ```
//!
//! # Guarantees
//!
//! - **One session**: start/stop serialize on one lock; at most one client process
//! - **No leaks**: ports and processes are released on every exit path
//! - **Non-blocking reads**: session state is published on a watch channel

mod app_config;
mod bridge;
mod client;
mod config;
mod fetch;
mod manager;
mod pac;
mod ports;
mod probe;
mod runtime;
mod service;
mod socks;
mod subscription;
mod uri;

pub use app_config::{AppConfig, AppConfigError, ConfigFormat};
pub use bridge::{BridgeError, BridgeOptions, HttpBridge};
pub use client::{
    BinaryLauncher, ClientError, ClientKind, ClientLauncher, ClientOptions, LaunchSpec,
    ProxyClient, SessionState,
};
pub use config::{
    Acl, Config, ConfigError, EncryptMethod, GroupConfig, HttpProxySettings, Mode, Plugin,
    ServerType, Settings, SsrObfs, SsrProtocol,
};
pub use fetch::{FetchError, FetchOptions, HttpClient, Response};
pub use manager::{SessionError, SessionInfo, SessionManager};
pub use pac::{PacError, PacServer, DEFAULT_GFWLIST_URL};
pub use ports::{PortError, PortLedger, PortOwner};
pub use probe::{
    best_candidate, ProbeError, ProbeOptions, ProbeRecord, ProbeReport, ProbeSummary,
    ProbeTarget, Prober,
};
pub use runtime::{RuntimeDir, RuntimeError};
pub use service::{
    Clipboard, MainService, NoClipboard, PngQrEncoder, QrEncoder, Request, ServiceError,
    ServiceResult,
};
pub use socks::{SocksError, TargetAddr};
pub use subscription::{Subscription, SubscriptionError, SubscriptionFetcher};

/// Share-link codec
pub mod codec {
    pub use crate::uri::{
        generate, generate_ssr_in_group, parse, parse_link, parse_links,
        parse_subscription_body, ParseError, Parsed, SubscriptionBody,
    };
    pub use crate::pac::{parse_gfwlist, render_pac};
}
