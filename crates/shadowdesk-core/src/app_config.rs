//! Application Configuration
//!
//! Optional TOML or JSON file read at startup. Every field has a default, so
//! an empty file (or none at all) is a valid configuration.
//!
//! ```toml
//! runtime_dir = "/var/lib/shadowdesk"
//! ss_local = "/usr/bin/ss-local"
//! liveness_timeout_ms = 5000
//! log_filter = "shadowdesk=debug"
//! ```

use crate::client::{BinaryLauncher, ClientKind, ClientOptions};
use crate::fetch::FetchOptions;
use crate::probe::ProbeOptions;
use crate::runtime::RuntimeDir;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Config file format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Toml,
    Json,
}

impl ConfigFormat {
    /// Pick the format from a file extension
    pub fn from_path(path: &Path) -> Result<Self, AppConfigError> {
        match path.extension().and_then(|e| e.to_str()).unwrap_or("") {
            "toml" => Ok(Self::Toml),
            "json" => Ok(Self::Json),
            other => Err(AppConfigError::UnsupportedFormat(other.to_string())),
        }
    }
}

/// Process-level settings for the orchestrator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Runtime directory (default: `<data_dir>/shadowdesk/runtime`)
    pub runtime_dir: Option<PathBuf>,
    /// Path to `ss-local` (default: bundled, else `PATH`)
    pub ss_local: Option<PathBuf>,
    /// Path to `ssr-local` (default: bundled, else `PATH`)
    pub ssr_local: Option<PathBuf>,
    pub liveness_timeout_ms: u64,
    pub stop_grace_ms: u64,
    pub probe_attempts: usize,
    pub probe_timeout_ms: u64,
    pub fetch_timeout_ms: u64,
    /// `tracing` filter directive used when `RUST_LOG` is unset
    pub log_filter: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            runtime_dir: None,
            ss_local: None,
            ssr_local: None,
            liveness_timeout_ms: 5000,
            stop_grace_ms: 3000,
            probe_attempts: 3,
            probe_timeout_ms: 3000,
            fetch_timeout_ms: 15000,
            log_filter: None,
        }
    }
}

impl AppConfig {
    /// Load from a `.toml` or `.json` file
    pub fn load(path: &Path) -> Result<Self, AppConfigError> {
        let format = ConfigFormat::from_path(path)?;
        let content = std::fs::read_to_string(path)
            .map_err(|e| AppConfigError::Io(format!("{}: {}", path.display(), e)))?;
        let config = Self::from_str_format(&content, format)?;
        info!("Loaded app config from {}", path.display());
        Ok(config)
    }

    /// Parse from a string
    pub fn from_str_format(content: &str, format: ConfigFormat) -> Result<Self, AppConfigError> {
        match format {
            ConfigFormat::Toml => {
                toml::from_str(content).map_err(|e| AppConfigError::Parse(e.to_string()))
            }
            ConfigFormat::Json => {
                serde_json::from_str(content).map_err(|e| AppConfigError::Parse(e.to_string()))
            }
        }
    }

    /// Serialize as TOML
    pub fn to_toml(&self) -> String {
        toml::to_string_pretty(self).unwrap_or_default()
    }

    /// Runtime directory handle
    pub fn runtime(&self) -> RuntimeDir {
        match &self.runtime_dir {
            Some(dir) => RuntimeDir::new(dir),
            None => RuntimeDir::default(),
        }
    }

    /// Client launcher honoring explicit binary paths
    pub fn launcher(&self, runtime: &RuntimeDir) -> BinaryLauncher {
        let found = BinaryLauncher::from_runtime(runtime);
        BinaryLauncher::new(
            self.ss_local.clone().unwrap_or(found.ss_local),
            self.ssr_local.clone().unwrap_or(found.ssr_local),
        )
    }

    /// Path the launcher will use for `kind`
    pub fn binary_for(&self, runtime: &RuntimeDir, kind: ClientKind) -> PathBuf {
        let launcher = self.launcher(runtime);
        match kind {
            ClientKind::SsLocal => launcher.ss_local,
            ClientKind::SsrLocal => launcher.ssr_local,
        }
    }

    pub fn client_options(&self) -> ClientOptions {
        ClientOptions {
            liveness_timeout: Duration::from_millis(self.liveness_timeout_ms),
            stop_grace: Duration::from_millis(self.stop_grace_ms),
        }
    }

    pub fn probe_options(&self) -> ProbeOptions {
        ProbeOptions {
            attempts: self.probe_attempts.max(1),
            timeout: Duration::from_millis(self.probe_timeout_ms),
            ..ProbeOptions::default()
        }
    }

    pub fn fetch_options(&self) -> FetchOptions {
        FetchOptions {
            timeout: Duration::from_millis(self.fetch_timeout_ms),
            ..FetchOptions::default()
        }
    }
}

/// App config errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum AppConfigError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Unsupported config format: {0:?}")]
    UnsupportedFormat(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.client_options().liveness_timeout, Duration::from_secs(5));
        assert_eq!(config.client_options().stop_grace, Duration::from_secs(3));
        assert_eq!(config.probe_options().attempts, 3);
        assert_eq!(config.fetch_options().timeout, Duration::from_secs(15));
    }

    #[test]
    fn test_partial_toml() {
        let config = AppConfig::from_str_format(
            "stop_grace_ms = 500\nss_local = \"/opt/ss-local\"\n",
            ConfigFormat::Toml,
        )
        .unwrap();
        assert_eq!(config.stop_grace_ms, 500);
        assert_eq!(config.liveness_timeout_ms, 5000);

        let runtime = RuntimeDir::new("/nonexistent");
        assert_eq!(
            config.binary_for(&runtime, ClientKind::SsLocal),
            PathBuf::from("/opt/ss-local")
        );
        assert_eq!(
            config.binary_for(&runtime, ClientKind::SsrLocal),
            PathBuf::from("ssr-local")
        );
    }

    #[test]
    fn test_json_and_roundtrip() {
        let config = AppConfig::from_str_format(r#"{"probe_attempts": 5}"#, ConfigFormat::Json).unwrap();
        assert_eq!(config.probe_attempts, 5);

        let again = AppConfig::from_str_format(&config.to_toml(), ConfigFormat::Toml).unwrap();
        assert_eq!(again, config);
    }

    #[test]
    fn test_load_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("shadowdesk.toml");
        std::fs::write(&path, "fetch_timeout_ms = 1000\n").unwrap();
        assert_eq!(AppConfig::load(&path).unwrap().fetch_timeout_ms, 1000);

        let bad = tmp.path().join("shadowdesk.yaml");
        std::fs::write(&bad, "").unwrap();
        assert!(matches!(AppConfig::load(&bad), Err(AppConfigError::UnsupportedFormat(_))));

        let broken = tmp.path().join("broken.toml");
        std::fs::write(&broken, "stop_grace_ms = \"soon\"").unwrap();
        assert!(matches!(AppConfig::load(&broken), Err(AppConfigError::Parse(_))));

        assert!(matches!(
            AppConfig::load(&tmp.path().join("missing.json")),
            Err(AppConfigError::Io(_))
        ));
    }
}
