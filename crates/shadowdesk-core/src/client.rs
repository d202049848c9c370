//! Proxy Client Supervisor
//!
//! Spawns and supervises the external `ss-local` / `ssr-local` process that
//! carries the tunneled traffic. The process is an owned resource: it is
//! either live and watched by a monitor task, or terminated and reaped.
//!
//! # Lifecycle
//!
//! ```text
//! Disconnected → Connecting → Connected → Disconnecting → Disconnected
//!                    │            │
//!                    └→ Failed ←──┘ (spawn error, liveness timeout, exit)
//! ```

use crate::config::{Config, ConfigError, Mode, ServerType, Settings};
use crate::ports;
use crate::runtime::{RuntimeDir, RuntimeError};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Interval between liveness checks of the local port
const LIVENESS_POLL: Duration = Duration::from_millis(50);

/// Session connection state
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
#[serde(tag = "state", content = "reason", rename_all = "camelCase")]
pub enum SessionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
    Failed(String),
}

impl SessionState {
    /// Check if the session is usable
    pub fn is_connected(&self) -> bool {
        matches!(self, SessionState::Connected)
    }

    /// Check if the last session ended in an error
    pub fn is_failed(&self) -> bool {
        matches!(self, SessionState::Failed(_))
    }
}

/// Which client binary a server needs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientKind {
    SsLocal,
    SsrLocal,
}

impl ClientKind {
    /// Executable name
    pub fn binary_name(&self) -> &'static str {
        match self {
            ClientKind::SsLocal => "ss-local",
            ClientKind::SsrLocal => "ssr-local",
        }
    }
}

/// Program and argv for one client run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub kind: ClientKind,
    pub args: Vec<String>,
    /// SOCKS5 port the client will listen on
    pub local_port: u16,
}

impl LaunchSpec {
    /// Render the command line for `config` under `settings`
    pub fn render(config: &Config, settings: &Settings, acl: Option<&Path>) -> Result<Self, ConfigError> {
        let kind = match config.validate()? {
            ServerType::Ss => ClientKind::SsLocal,
            ServerType::Ssr => ClientKind::SsrLocal,
            ServerType::Unknown => return Err(ConfigError::UnsupportedType("unknown".into())),
        };

        let mut args: Vec<String> = vec![
            "-s".into(),
            config.server_host.clone(),
            "-p".into(),
            config.server_port.to_string(),
            "-b".into(),
            "127.0.0.1".into(),
            "-l".into(),
            settings.local_port.to_string(),
            "-k".into(),
            config.password.clone(),
            "-m".into(),
            config.encrypt_method.to_string(),
        ];

        if let Some(timeout) = config.timeout {
            args.extend(["-t".into(), timeout.to_string()]);
        }
        if config.fast_open == Some(true) {
            args.push("--fast-open".into());
        }
        if config.no_delay == Some(true) {
            args.push("--no-delay".into());
        }
        if config.udp == Some(true) {
            args.push("-u".into());
        }
        if let Some(n) = config.max_open_file {
            args.extend(["-n".into(), n.to_string()]);
        }
        if let Some(path) = acl {
            args.extend(["--acl".into(), path.display().to_string()]);
        }

        match kind {
            ClientKind::SsLocal => {
                if let Some(plugin) = config.plugin {
                    args.extend(["--plugin".into(), plugin.to_string()]);
                    if let Some(opts) = config.plugin_opts.as_deref().filter(|o| !o.is_empty()) {
                        args.extend(["--plugin-opts".into(), opts.to_string()]);
                    }
                }
            }
            ClientKind::SsrLocal => {
                args.extend(["-O".into(), config.protocol_or_default().to_string()]);
                if let Some(param) = config.protocol_param.as_deref().filter(|p| !p.is_empty()) {
                    args.extend(["-G".into(), param.to_string()]);
                }
                args.extend(["-o".into(), config.obfs_or_default().to_string()]);
                if let Some(param) = config.obfs_param.as_deref().filter(|p| !p.is_empty()) {
                    args.extend(["-g".into(), param.to_string()]);
                }
            }
        }

        if settings.verbose {
            args.push("-v".into());
        }

        Ok(Self {
            kind,
            args,
            local_port: settings.local_port,
        })
    }
}

/// Builds the command for a launch
///
/// The supervisor owns stdio, `kill_on_drop` and spawning; implementations
/// only decide which program runs.
pub trait ClientLauncher: Send + Sync {
    fn command(&self, spec: &LaunchSpec) -> Command;
}

/// Runs the real client binaries
#[derive(Debug, Clone)]
pub struct BinaryLauncher {
    pub ss_local: PathBuf,
    pub ssr_local: PathBuf,
}

impl BinaryLauncher {
    /// Explicit binary paths
    pub fn new(ss_local: impl Into<PathBuf>, ssr_local: impl Into<PathBuf>) -> Self {
        Self {
            ss_local: ss_local.into(),
            ssr_local: ssr_local.into(),
        }
    }

    /// Prefer binaries bundled in the runtime dir, else rely on `PATH`
    pub fn from_runtime(runtime: &RuntimeDir) -> Self {
        let pick = |kind: ClientKind| {
            let bundled = runtime.bin_path(kind.binary_name());
            if bundled.is_file() {
                bundled
            } else {
                PathBuf::from(kind.binary_name())
            }
        };
        Self {
            ss_local: pick(ClientKind::SsLocal),
            ssr_local: pick(ClientKind::SsrLocal),
        }
    }
}

impl ClientLauncher for BinaryLauncher {
    fn command(&self, spec: &LaunchSpec) -> Command {
        let program = match spec.kind {
            ClientKind::SsLocal => &self.ss_local,
            ClientKind::SsrLocal => &self.ssr_local,
        };
        let mut cmd = Command::new(program);
        cmd.args(&spec.args);
        cmd
    }
}

/// Supervisor timing
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// How long the child has to show signs of life
    pub liveness_timeout: Duration,
    /// Grace period between SIGTERM and SIGKILL
    pub stop_grace: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            liveness_timeout: Duration::from_secs(5),
            stop_grace: Duration::from_secs(3),
        }
    }
}

/// Live client, owned by its monitor task
struct RunningClient {
    pid: Option<u32>,
    local_port: u16,
    stop: oneshot::Sender<()>,
    monitor: JoinHandle<()>,
}

/// Supervisor for at most one client process
pub struct ProxyClient {
    launcher: Arc<dyn ClientLauncher>,
    runtime: RuntimeDir,
    options: ClientOptions,
    state: Arc<watch::Sender<SessionState>>,
    running: Mutex<Option<RunningClient>>,
}

impl ProxyClient {
    /// Create a supervisor with its own state channel
    pub fn new(launcher: Arc<dyn ClientLauncher>, runtime: RuntimeDir, options: ClientOptions) -> Self {
        let (state, _) = watch::channel(SessionState::Disconnected);
        Self::with_state(launcher, runtime, options, Arc::new(state))
    }

    /// Create a supervisor publishing into an existing state channel
    pub fn with_state(
        launcher: Arc<dyn ClientLauncher>,
        runtime: RuntimeDir,
        options: ClientOptions,
        state: Arc<watch::Sender<SessionState>>,
    ) -> Self {
        Self {
            launcher,
            runtime,
            options,
            state,
            running: Mutex::new(None),
        }
    }

    /// Current state (never blocks)
    pub fn state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    /// Watch state transitions
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Is the client up?
    pub fn is_connected(&self) -> bool {
        self.state.borrow().is_connected()
    }

    /// Pid of the live client, if any
    pub async fn pid(&self) -> Option<u32> {
        self.running.lock().await.as_ref().and_then(|r| r.pid)
    }

    /// SOCKS5 port of the live client, if any
    pub async fn local_port(&self) -> Option<u16> {
        self.running.lock().await.as_ref().map(|r| r.local_port)
    }

    /// Start a client for `config`, replacing any running one
    pub async fn start(&self, config: &Config, settings: &Settings) -> Result<(), ClientError> {
        self.launch(config, settings).await?;
        if self.promote_connected() {
            return Ok(());
        }

        let error = ClientError::Exited(self.failure_reason());
        error!("Client for {} died during startup", config.display_name());
        self.stop().await?;
        self.state.send_replace(SessionState::Failed(error.to_string()));
        Err(error)
    }

    /// Start without publishing `Connected`; the caller finishes the session
    pub(crate) async fn launch(&self, config: &Config, settings: &Settings) -> Result<(), ClientError> {
        let mut running = self.running.lock().await;
        if let Some(previous) = running.take() {
            info!("Replacing running client");
            self.terminate(previous).await;
        }

        self.state.send_replace(SessionState::Connecting);
        match self.spawn_checked(config, settings).await {
            Ok(client) => {
                info!(
                    "Client for {} running (pid {:?}, SOCKS5 127.0.0.1:{})",
                    config.display_name(),
                    client.pid,
                    client.local_port
                );
                *running = Some(client);
                Ok(())
            }
            Err(e) => {
                error!("Failed to start client for {}: {}", config.display_name(), e);
                self.state.send_replace(SessionState::Failed(e.to_string()));
                Err(e)
            }
        }
    }

    /// Stop the client. Succeeds when nothing is running.
    pub async fn stop(&self) -> Result<(), ClientError> {
        let previous = self.running.lock().await.take();
        match previous {
            Some(client) => {
                self.state.send_replace(SessionState::Disconnecting);
                self.terminate(client).await;
                info!("Client stopped");
            }
            None => debug!("Stop requested with no client running"),
        }
        self.state.send_replace(SessionState::Disconnected);
        Ok(())
    }

    /// Publish a session-level state (used by the orchestrator)
    pub(crate) fn set_state(&self, state: SessionState) {
        self.state.send_replace(state);
    }

    /// `Connecting` → `Connected`. False when the monitor already saw the
    /// child exit, in which case the state is left alone.
    pub(crate) fn promote_connected(&self) -> bool {
        self.state.send_if_modified(|state| {
            if *state == SessionState::Connecting {
                *state = SessionState::Connected;
                true
            } else {
                false
            }
        })
    }

    /// Reason carried by the current `Failed` state, if any
    pub(crate) fn failure_reason(&self) -> String {
        match &*self.state.borrow() {
            SessionState::Failed(reason) => reason.clone(),
            other => format!("unexpected state {:?}", other),
        }
    }

    async fn spawn_checked(&self, config: &Config, settings: &Settings) -> Result<RunningClient, ClientError> {
        // ===== Validation (nothing spawned yet) =====
        config.validate()?;
        settings.validate()?;

        if !ports::is_free(settings.local_port).await {
            return Err(ClientError::Bind(settings.local_port));
        }
        if settings.mode == Mode::Pac && !ports::is_free(settings.pac_port).await {
            return Err(ClientError::Bind(settings.pac_port));
        }

        let acl_path = match settings.effective_acl(config) {
            Some(text) => Some(self.runtime.write_acl(text).await?),
            None => None,
        };
        let spec = LaunchSpec::render(config, settings, acl_path.as_deref())?;

        // ===== Spawn =====
        let mut cmd = self.launcher.command(&spec);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!("Spawning {} {:?}", spec.kind.binary_name(), redact(&spec.args));
        let mut child = cmd
            .spawn()
            .map_err(|e| ClientError::Spawn(format!("{}: {}", spec.kind.binary_name(), e)))?;
        let pid = child.id();

        let ready = Arc::new(Notify::new());
        let tag = spec.kind.binary_name();
        if let Some(stdout) = child.stdout.take() {
            forward_output(stdout, tag, false, ready.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            forward_output(stderr, tag, true, ready.clone());
        }

        // ===== Liveness =====
        if let Err(e) = self.await_liveness(&mut child, spec.local_port, &ready).await {
            terminate_child(&mut child, Duration::ZERO).await;
            return Err(e);
        }

        let (stop, stop_rx) = oneshot::channel();
        let monitor = tokio::spawn(monitor(
            child,
            stop_rx,
            self.state.clone(),
            self.options.stop_grace,
        ));

        Ok(RunningClient {
            pid,
            local_port: spec.local_port,
            stop,
            monitor,
        })
    }

    /// Port accepts connections, or the child spoke while still alive
    async fn await_liveness(&self, child: &mut Child, port: u16, ready: &Notify) -> Result<(), ClientError> {
        let deadline = Instant::now() + self.options.liveness_timeout;

        loop {
            if TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
                return Ok(());
            }

            tokio::select! {
                status = child.wait() => {
                    return Err(ClientError::Spawn(exit_reason(status)));
                }
                _ = ready.notified() => {
                    return match child.try_wait() {
                        Ok(None) => Ok(()),
                        Ok(Some(status)) => Err(ClientError::Spawn(exit_reason(Ok(status)))),
                        Err(e) => Err(ClientError::Io(e)),
                    };
                }
                _ = tokio::time::sleep(LIVENESS_POLL) => {}
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(ClientError::LivenessTimeout(self.options.liveness_timeout));
                }
            }
        }
    }

    async fn terminate(&self, client: RunningClient) {
        let _ = client.stop.send(());
        let mut monitor = client.monitor;
        let limit = self.options.stop_grace + Duration::from_secs(2);
        if tokio::time::timeout(limit, &mut monitor).await.is_err() {
            warn!("Client monitor did not finish in {:?}, aborting", limit);
            monitor.abort();
        }
    }
}

impl Drop for ProxyClient {
    fn drop(&mut self) {
        // Dropping the monitor's stop sender makes it terminate the child
        if let Ok(mut running) = self.running.try_lock() {
            running.take();
        }
    }
}

/// Owns the live child until it exits or is told to stop
async fn monitor(
    mut child: Child,
    mut stop: oneshot::Receiver<()>,
    state: Arc<watch::Sender<SessionState>>,
    grace: Duration,
) {
    tokio::select! {
        status = child.wait() => {
            let reason = format!("client exited: {}", exit_reason(status));
            warn!("{}", reason);
            state.send_replace(SessionState::Failed(reason));
        }
        _ = &mut stop => {
            terminate_child(&mut child, grace).await;
        }
    }
}

/// SIGTERM, wait `grace`, then SIGKILL and reap
async fn terminate_child(child: &mut Child, grace: Duration) {
    #[cfg(unix)]
    {
        if let (false, Some(pid)) = (grace.is_zero(), child.id()) {
            // SAFETY: plain kill(2) on a pid we spawned and have not reaped
            let _ = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
            match tokio::time::timeout(grace, child.wait()).await {
                Ok(Ok(status)) => {
                    debug!("Client exited after SIGTERM ({})", status);
                    return;
                }
                Ok(Err(e)) => warn!("Waiting for client failed: {}", e),
                Err(_) => warn!("Client ignored SIGTERM for {:?}, killing", grace),
            }
        }
    }
    #[cfg(not(unix))]
    let _ = grace;

    if let Err(e) = child.kill().await {
        debug!("Kill failed (already exited?): {}", e);
    }
}

fn exit_reason(status: std::io::Result<ExitStatus>) -> String {
    match status {
        Ok(status) => format!("exited with {}", status),
        Err(e) => format!("wait failed: {}", e),
    }
}

/// Hide the password in logged argv
fn redact(args: &[String]) -> Vec<&str> {
    let mut out = Vec::with_capacity(args.len());
    let mut hide_next = false;
    for arg in args {
        out.push(if hide_next { "***" } else { arg.as_str() });
        hide_next = arg == "-k";
    }
    out
}

/// Forward child output lines to tracing; the first line signals liveness
fn forward_output<R>(reader: R, tag: &'static str, is_stderr: bool, ready: Arc<Notify>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        let mut first = true;
        while let Ok(Some(line)) = lines.next_line().await {
            if first {
                ready.notify_one();
                first = false;
            }
            let lower = line.to_ascii_lowercase();
            if is_stderr && (lower.contains("error") || lower.contains("fatal")) {
                warn!("[{}] {}", tag, line);
            } else {
                debug!("[{}] {}", tag, line);
            }
        }
    });
}

/// Client supervisor errors
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Invalid configuration: {0}")]
    Validation(#[from] ConfigError),

    #[error("Port {0} is already in use")]
    Bind(u16),

    #[error("Failed to start client: {0}")]
    Spawn(String),

    #[error("Client did not become ready within {0:?}")]
    LivenessTimeout(Duration),

    #[error("Client exited during startup: {0}")]
    Exited(String),

    #[error("Failed to write ACL: {0}")]
    Acl(#[from] RuntimeError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}


#[cfg(all(test, unix))]
mod tests {
    use super::test_launcher::ScriptLauncher;
    use super::*;
    use crate::config::{Acl, EncryptMethod, Plugin, SsrObfs, SsrProtocol};
    use tokio::net::TcpListener;

    fn ss_config() -> Config {
        Config::ss("203.0.113.7", 8388, EncryptMethod::Aes256Gcm, "secret").with_id("a")
    }

    async fn free_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    async fn test_settings() -> Settings {
        Settings {
            selected_server: Some("a".into()),
            local_port: free_port().await,
            ..Settings::default()
        }
    }

    fn fast_options() -> ClientOptions {
        ClientOptions {
            liveness_timeout: Duration::from_millis(500),
            stop_grace: Duration::from_millis(500),
        }
    }

    fn supervisor(launcher: Arc<ScriptLauncher>, dir: &Path) -> ProxyClient {
        ProxyClient::new(launcher, RuntimeDir::new(dir), fast_options())
    }

    fn process_alive(pid: u32) -> bool {
        unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
    }

    #[test]
    fn test_render_ss() {
        let mut config = ss_config();
        config.plugin = Some(Plugin::V2rayPlugin);
        config.plugin_opts = Some("server;tls".into());
        config.fast_open = Some(true);
        config.timeout = Some(60);
        let settings = Settings {
            verbose: true,
            ..Settings::default()
        };

        let spec = LaunchSpec::render(&config, &settings, Some(Path::new("/tmp/acl.conf"))).unwrap();
        assert_eq!(spec.kind, ClientKind::SsLocal);
        assert_eq!(
            spec.args,
            vec![
                "-s", "203.0.113.7", "-p", "8388", "-b", "127.0.0.1", "-l", "1080",
                "-k", "secret", "-m", "aes-256-gcm", "-t", "60", "--fast-open",
                "--acl", "/tmp/acl.conf", "--plugin", "v2ray-plugin",
                "--plugin-opts", "server;tls", "-v",
            ]
        );
    }

    #[test]
    fn test_render_ssr() {
        let mut config = Config::ssr(
            "example.com",
            443,
            EncryptMethod::Chacha20,
            "pw",
            SsrProtocol::AuthAes128Md5,
            SsrObfs::HttpSimple,
        );
        config.obfs_param = Some("cdn.example.com".into());
        config.plugin = Some(Plugin::Kcptun);

        let spec = LaunchSpec::render(&config, &Settings::default(), None).unwrap();
        assert_eq!(spec.kind, ClientKind::SsrLocal);
        let joined = spec.args.join(" ");
        assert!(joined.contains("-O auth_aes128_md5"));
        assert!(joined.contains("-o http_simple -g cdn.example.com"));
        assert!(!joined.contains("-G"));
        assert!(!joined.contains("--plugin"));
    }

    #[test]
    fn test_render_rejects_unknown_type() {
        let mut config = ss_config();
        config.kind = None;
        assert!(LaunchSpec::render(&config, &Settings::default(), None).is_err());
    }

    #[test]
    fn test_redact() {
        let args: Vec<String> = ["-s", "h", "-k", "pw", "-m", "x"].iter().map(|s| s.to_string()).collect();
        assert_eq!(redact(&args), vec!["-s", "h", "-k", "***", "-m", "x"]);
    }

    #[tokio::test]
    async fn test_start_stop() {
        let tmp = tempfile::tempdir().unwrap();
        let client = supervisor(ScriptLauncher::healthy(), tmp.path());

        client.start(&ss_config(), &test_settings().await).await.unwrap();
        assert!(client.is_connected());
        let pid = client.pid().await.unwrap();
        assert!(process_alive(pid));

        client.stop().await.unwrap();
        assert_eq!(client.state(), SessionState::Disconnected);
        assert_eq!(client.pid().await, None);
        assert!(!process_alive(pid));
    }

    #[tokio::test]
    async fn test_double_start_keeps_one_process() {
        let tmp = tempfile::tempdir().unwrap();
        let client = supervisor(ScriptLauncher::healthy(), tmp.path());
        let settings = test_settings().await;

        client.start(&ss_config(), &settings).await.unwrap();
        let first = client.pid().await.unwrap();
        client.start(&ss_config(), &settings).await.unwrap();
        let second = client.pid().await.unwrap();

        assert_ne!(first, second);
        assert!(!process_alive(first));
        assert!(process_alive(second));
        client.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let client = supervisor(ScriptLauncher::healthy(), tmp.path());

        client.stop().await.unwrap();
        client.stop().await.unwrap();
        assert_eq!(client.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn test_early_exit_is_spawn_error() {
        let tmp = tempfile::tempdir().unwrap();
        let client = supervisor(ScriptLauncher::new("exit 3"), tmp.path());

        let result = client.start(&ss_config(), &test_settings().await).await;
        assert!(matches!(result, Err(ClientError::Spawn(_))));
        assert!(client.state().is_failed());
        assert_eq!(client.pid().await, None);
    }

    #[tokio::test]
    async fn test_liveness_timeout() {
        let tmp = tempfile::tempdir().unwrap();
        let client = supervisor(ScriptLauncher::new("exec sleep 30"), tmp.path());

        let result = client.start(&ss_config(), &test_settings().await).await;
        assert!(matches!(result, Err(ClientError::LivenessTimeout(_))));
        assert!(client.state().is_failed());
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn test_port_accept_counts_as_live() {
        let tmp = tempfile::tempdir().unwrap();
        let settings = test_settings().await;
        let port = settings.local_port;
        // Silent child; the port opening is the only sign of life
        let client = supervisor(ScriptLauncher::new("exec sleep 30"), tmp.path());

        let binder = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
            tokio::time::sleep(Duration::from_secs(2)).await;
            drop(listener);
        });

        client.start(&ss_config(), &settings).await.unwrap();
        assert!(client.is_connected());
        client.stop().await.unwrap();
        binder.abort();
    }

    #[tokio::test]
    async fn test_validation_before_spawn() {
        let tmp = tempfile::tempdir().unwrap();
        let launcher = ScriptLauncher::healthy();
        let client = supervisor(launcher.clone(), tmp.path());

        let mut config = ss_config();
        config.server_host = String::new();
        let result = client.start(&config, &test_settings().await).await;
        assert!(matches!(result, Err(ClientError::Validation(ConfigError::EmptyHost))));
        assert!(launcher.last.lock().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_busy_local_port() {
        let tmp = tempfile::tempdir().unwrap();
        let occupied = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let settings = Settings {
            local_port: occupied.local_addr().unwrap().port(),
            ..Settings::default()
        };
        let client = supervisor(ScriptLauncher::healthy(), tmp.path());

        let result = client.start(&ss_config(), &settings).await;
        assert!(matches!(result, Err(ClientError::Bind(_))));
    }

    #[tokio::test]
    async fn test_acl_written_and_passed() {
        let tmp = tempfile::tempdir().unwrap();
        let launcher = ScriptLauncher::healthy();
        let client = supervisor(launcher.clone(), tmp.path());

        let mut config = ss_config();
        config.acl = Some(Acl {
            enable: true,
            text: "[bypass_all]\n".into(),
        });
        client.start(&config, &test_settings().await).await.unwrap();

        let acl_path = tmp.path().join("acl.conf");
        assert_eq!(std::fs::read_to_string(&acl_path).unwrap(), "[bypass_all]\n");
        let spec = launcher.last.lock().unwrap().clone().unwrap();
        let idx = spec.args.iter().position(|a| a == "--acl").unwrap();
        assert_eq!(spec.args[idx + 1], acl_path.display().to_string());

        client.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_unexpected_exit_marks_failed() {
        let tmp = tempfile::tempdir().unwrap();
        let client = supervisor(ScriptLauncher::new("echo up; sleep 0.3; exit 1"), tmp.path());
        let mut states = client.subscribe();

        client.start(&ss_config(), &test_settings().await).await.unwrap();
        let failed = tokio::time::timeout(
            Duration::from_secs(5),
            states.wait_for(|s| s.is_failed()),
        )
        .await;
        assert!(failed.is_ok());
        drop(failed);

        // Stop after a crash still ends Disconnected
        client.stop().await.unwrap();
        assert_eq!(client.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn test_promote_only_from_connecting() {
        let tmp = tempfile::tempdir().unwrap();
        let client = supervisor(ScriptLauncher::healthy(), tmp.path());

        client.set_state(SessionState::Failed("client exited: exited with 1".into()));
        assert!(!client.promote_connected());
        assert!(client.state().is_failed());
        assert_eq!(client.failure_reason(), "client exited: exited with 1");

        client.set_state(SessionState::Connecting);
        assert!(client.promote_connected());
        assert!(client.is_connected());
    }

    #[tokio::test]
    async fn test_dead_client_never_connected() {
        let tmp = tempfile::tempdir().unwrap();
        let client = supervisor(ScriptLauncher::new("echo up; exit 1"), tmp.path());

        for _ in 0..10 {
            match client.start(&ss_config(), &test_settings().await).await {
                Ok(()) => {}
                Err(ClientError::Exited(_)) | Err(ClientError::Spawn(_)) => {
                    assert!(client.state().is_failed());
                    assert_eq!(client.pid().await, None);
                }
                Err(e) => panic!("unexpected error: {}", e),
            }

            tokio::time::sleep(Duration::from_millis(200)).await;
            assert!(!client.is_connected(), "dead client reported as connected");
            client.stop().await.unwrap();
        }
    }

    #[test]
    fn test_state_serialization() {
        assert_eq!(
            serde_json::to_value(SessionState::Connected).unwrap(),
            serde_json::json!({"state": "connected"})
        );
        assert_eq!(
            serde_json::to_value(SessionState::Failed("boom".into())).unwrap(),
            serde_json::json!({"state": "failed", "reason": "boom"})
        );
    }
}
