//! Session Manager
//!
//! Coordinates the proxy client, the PAC server and the HTTP bridge into one
//! session with a single start/stop lock.
//!
//! # Usage
//!
//! ```rust,ignore
//! let manager = SessionManager::new(launcher, runtime, ClientOptions::default());
//! manager.start(&config, &settings).await?;
//!
//! if manager.is_connected() {
//!     println!("SOCKS5 on 127.0.0.1:{}", settings.local_port);
//! }
//!
//! manager.stop().await?;
//! ```

use crate::bridge::{BridgeError, BridgeOptions, HttpBridge};
use crate::client::{ClientError, ClientLauncher, ClientOptions, ProxyClient, SessionState};
use crate::config::{Config, ConfigError, Mode, Settings};
use crate::pac::{self, PacError, PacServer};
use crate::ports::{PortError, PortLedger, PortOwner};
use crate::runtime::RuntimeDir;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{watch, Mutex};
use tracing::{error, info, warn};

/// Session errors
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Client(#[from] ClientError),

    #[error(transparent)]
    Bridge(#[from] BridgeError),

    #[error(transparent)]
    Pac(#[from] PacError),

    #[error(transparent)]
    Port(#[from] PortError),

    #[error("HTTP bridge on port {0} belongs to the running session; stop the session instead")]
    SessionBridge(u16),
}

/// Everything one running session owns
struct ActiveSession {
    server_id: String,
    local_port: u16,
    pac: Option<PacServer>,
    bridge_port: Option<u16>,
    started_at: Instant,
}

/// Snapshot of the session for the UI
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    #[serde(flatten)]
    pub state: SessionState,
    pub server_id: Option<String>,
    pub local_port: Option<u16>,
    pub pac_url: Option<String>,
    pub http_proxy_port: Option<u16>,
    pub uptime_secs: Option<u64>,
}

/// Session orchestrator
///
/// - Validates the request before touching the running session
/// - Starts client, then PAC server, then bridge
/// - Rolls back earlier steps when a later one fails
pub struct SessionManager {
    client: ProxyClient,
    bridge: HttpBridge,
    runtime: RuntimeDir,
    ports: PortLedger,
    state: watch::Receiver<SessionState>,
    session: Mutex<Option<ActiveSession>>,
}

impl SessionManager {
    /// Create a new session manager
    pub fn new(launcher: Arc<dyn ClientLauncher>, runtime: RuntimeDir, options: ClientOptions) -> Self {
        let (tx, state) = watch::channel(SessionState::Disconnected);
        let client = ProxyClient::with_state(launcher, runtime.clone(), options, Arc::new(tx));

        Self {
            client,
            bridge: HttpBridge::new(),
            runtime,
            ports: PortLedger::new(),
            state,
            session: Mutex::new(None),
        }
    }

    /// Current state (never blocks)
    pub fn state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    /// Watch state transitions
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    /// Is a session up?
    pub fn is_connected(&self) -> bool {
        self.state.borrow().is_connected()
    }

    /// Runtime directory used by this session
    pub fn runtime(&self) -> &RuntimeDir {
        &self.runtime
    }

    /// Ports currently owned
    pub fn ports(&self) -> &PortLedger {
        &self.ports
    }

    /// Pid of the live client, if any
    pub async fn client_pid(&self) -> Option<u32> {
        self.client.pid().await
    }

    /// Start a session for `config`, replacing any running one
    pub async fn start(&self, config: &Config, settings: &Settings) -> Result<(), SessionError> {
        let mut session = self.session.lock().await;

        settings.check_selected(config)?;
        config.validate()?;
        settings.validate()?;

        if let Some(previous) = session.take() {
            info!("Replacing session for {}", previous.server_id);
            if let Err(e) = self.teardown(previous).await {
                warn!("Previous session did not stop cleanly: {}", e);
            }
        }

        info!("Starting session for {} ({:?} mode)", config.display_name(), settings.mode);
        let result = match self.bring_up(config, settings).await {
            Ok(active) if self.client.promote_connected() => {
                info!("Session connected (SOCKS5 127.0.0.1:{})", active.local_port);
                *session = Some(active);
                return Ok(());
            }
            Ok(active) => {
                // The client died after liveness; the monitor already reported it
                let reason = self.client.failure_reason();
                if let Err(e) = self.teardown(active).await {
                    warn!("Cleanup after client exit failed: {}", e);
                }
                Err(SessionError::Client(ClientError::Exited(reason)))
            }
            Err(e) => Err(e),
        };

        if let Err(e) = &result {
            error!("Session start failed: {}", e);
            self.client.set_state(SessionState::Failed(e.to_string()));
        }
        result
    }

    /// Stop the session. Always ends `Disconnected`; reports the first error.
    pub async fn stop(&self) -> Result<(), SessionError> {
        let mut session = self.session.lock().await;
        let result = match session.take() {
            Some(active) => self.teardown(active).await,
            None => self.client.stop().await.map_err(SessionError::from),
        };
        self.client.set_state(SessionState::Disconnected);
        info!("Session stopped");
        result
    }

    /// Stop the session and every standalone bridge (app exit)
    pub async fn shutdown(&self) {
        if let Err(e) = self.stop().await {
            warn!("Session stop during shutdown failed: {}", e);
        }
        self.bridge.stop_all().await;
        self.ports.release_owner(PortOwner::Bridge);
    }

    /// Start a standalone HTTP bridge on 127.0.0.1
    pub async fn start_bridge(&self, port: u16, proxy_port: u16) -> Result<SocketAddr, SessionError> {
        self.ports.acquire(port, PortOwner::Bridge)?;
        match self.bridge.create(BridgeOptions::local(port, proxy_port)).await {
            Ok(addr) => Ok(addr),
            Err(e) => {
                self.ports.release(port);
                Err(e.into())
            }
        }
    }

    /// Stop a standalone HTTP bridge. Unknown ports are a no-op; the
    /// session's own bridge is refused.
    pub async fn stop_bridge(&self, port: u16) -> Result<(), SessionError> {
        match self.ports.owner(port) {
            Some(PortOwner::SessionBridge) => Err(SessionError::SessionBridge(port)),
            Some(PortOwner::Bridge) => {
                self.bridge.stop(port, "127.0.0.1").await?;
                self.ports.release(port);
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Re-render the running PAC script from the cached GFW list.
    /// Returns false when no PAC server is up.
    pub async fn reload_pac(&self) -> bool {
        let session = self.session.lock().await;
        let Some(active) = session.as_ref() else {
            return false;
        };
        let Some(pac) = active.pac.as_ref() else {
            return false;
        };

        let domains = pac::cached_domains(&self.runtime).await;
        pac.set_script(pac::render_pac(&domains, active.local_port));
        info!("PAC script reloaded ({} domains)", domains.len());
        true
    }

    /// Snapshot for the UI
    pub async fn info(&self) -> SessionInfo {
        let session = self.session.lock().await;
        let active = session.as_ref();
        SessionInfo {
            state: self.state(),
            server_id: active.map(|s| s.server_id.clone()),
            local_port: active.map(|s| s.local_port),
            pac_url: active.and_then(|s| s.pac.as_ref()).map(|p| p.url()),
            http_proxy_port: active.and_then(|s| s.bridge_port),
            uptime_secs: active.map(|s| s.started_at.elapsed().as_secs()),
        }
    }

    async fn bring_up(&self, config: &Config, settings: &Settings) -> Result<ActiveSession, SessionError> {
        let mut claimed = Vec::new();
        let result = self.bring_up_claimed(config, settings, &mut claimed).await;
        if result.is_err() {
            for port in claimed {
                self.ports.release(port);
            }
        }
        result
    }

    async fn bring_up_claimed(
        &self,
        config: &Config,
        settings: &Settings,
        claimed: &mut Vec<u16>,
    ) -> Result<ActiveSession, SessionError> {
        let pac_mode = settings.mode == Mode::Pac;
        let bridge_port = settings.http_proxy.enable.then_some(settings.http_proxy.port);

        // ===== Ports =====
        let mut layout = vec![(settings.local_port, PortOwner::Client)];
        if pac_mode {
            layout.push((settings.pac_port, PortOwner::Pac));
        }
        if let Some(port) = bridge_port {
            layout.push((port, PortOwner::SessionBridge));
        }
        for (port, owner) in layout {
            self.ports.acquire(port, owner)?;
            claimed.push(port);
        }

        // ===== Client =====
        self.client.launch(config, settings).await?;

        // ===== PAC =====
        let pac = if pac_mode {
            let domains = pac::cached_domains(&self.runtime).await;
            let script = pac::render_pac(&domains, settings.local_port);
            match PacServer::start_local(settings.pac_port, script).await {
                Ok(server) => Some(server),
                Err(e) => {
                    self.rollback(None).await;
                    return Err(e.into());
                }
            }
        } else {
            None
        };

        // ===== HTTP bridge =====
        if let Some(port) = bridge_port {
            if let Err(e) = self
                .bridge
                .create(BridgeOptions::local(port, settings.local_port))
                .await
            {
                self.rollback(pac).await;
                return Err(e.into());
            }
        }

        Ok(ActiveSession {
            server_id: config.id.clone(),
            local_port: settings.local_port,
            pac,
            bridge_port,
            started_at: Instant::now(),
        })
    }

    async fn rollback(&self, pac: Option<PacServer>) {
        warn!("Rolling back partially started session");
        if let Some(pac) = pac {
            pac.stop().await;
        }
        if let Err(e) = self.client.stop().await {
            warn!("Client stop during rollback failed: {}", e);
        }
    }

    /// Best-effort stop of every part; returns the first error
    async fn teardown(&self, active: ActiveSession) -> Result<(), SessionError> {
        let mut first_error: Option<SessionError> = None;

        if let Some(port) = active.bridge_port {
            if let Err(e) = self.bridge.stop(port, "127.0.0.1").await {
                warn!("Bridge stop failed: {}", e);
                first_error.get_or_insert(e.into());
            }
            self.ports.release(port);
        }

        if let Some(pac) = active.pac {
            self.ports.release(pac.addr().port());
            pac.stop().await;
        }

        if let Err(e) = self.client.stop().await {
            warn!("Client stop failed: {}", e);
            first_error.get_or_insert(e.into());
        }
        self.ports.release(active.local_port);

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
