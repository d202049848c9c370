//! Server and Session Configuration
//!
//! Boundary types shared with the UI: server definitions (`Config`),
//! server groups (`GroupConfig`) and the session intent (`Settings`).
//!
//! Field names follow the UI's camelCase JSON, so a `Config` can be passed
//! straight through from the settings store.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Declares a string-backed enum with serde names, `as_str`, `all` and `FromStr`.
macro_rules! string_enum {
    (
        $(#[$meta:meta])*
        $name:ident, $err:ident {
            $($variant:ident => $text:literal,)+
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $(
                #[serde(rename = $text)]
                $variant,
            )+
        }

        impl $name {
            /// Wire name
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text,)+
                }
            }

            /// Every supported value
            pub fn all() -> &'static [$name] {
                &[$($name::$variant,)+]
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = ConfigError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(ConfigError::$err(other.to_string())),
                }
            }
        }
    };
}

string_enum! {
    /// Ciphers understood by the external client
    EncryptMethod, UnknownCipher {
        None => "none",
        Aes128Gcm => "aes-128-gcm",
        Aes192Gcm => "aes-192-gcm",
        Aes256Gcm => "aes-256-gcm",
        Rc4Md5 => "rc4-md5",
        Aes128Cfb => "aes-128-cfb",
        Aes192Cfb => "aes-192-cfb",
        Aes256Cfb => "aes-256-cfb",
        Aes128Ctr => "aes-128-ctr",
        Aes192Ctr => "aes-192-ctr",
        Aes256Ctr => "aes-256-ctr",
        BfCfb => "bf-cfb",
        Camellia128Cfb => "camellia-128-cfb",
        Camellia192Cfb => "camellia-192-cfb",
        Camellia256Cfb => "camellia-256-cfb",
        Chacha20IetfPoly1305 => "chacha20-ietf-poly1305",
        XChacha20IetfPoly1305 => "xchacha20-ietf-poly1305",
        Salsa20 => "salsa20",
        Chacha20 => "chacha20",
        Chacha20Ietf => "chacha20-ietf",
    }
}

string_enum! {
    /// SSR protocol plugins
    SsrProtocol, UnknownProtocol {
        Origin => "origin",
        VerifyDeflate => "verify_deflate",
        AuthSha1V4 => "auth_sha1_v4",
        AuthAes128Md5 => "auth_aes128_md5",
        AuthAes128Sha1 => "auth_aes128_sha1",
        AuthChainA => "auth_chain_a",
        AuthChainB => "auth_chain_b",
        AuthChainC => "auth_chain_c",
        AuthChainD => "auth_chain_d",
    }
}

string_enum! {
    /// SSR obfuscation plugins
    SsrObfs, UnknownObfs {
        Plain => "plain",
        HttpSimple => "http_simple",
        HttpPost => "http_post",
        Tls12TicketAuth => "tls1.2_ticket_auth",
    }
}

string_enum! {
    /// SIP003 plugins shipped with the client
    Plugin, UnknownPlugin {
        V2rayPlugin => "v2ray-plugin",
        Kcptun => "kcptun",
    }
}

/// Server flavour, selects both the share-link format and the client binary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerType {
    /// Shadowsocks
    Ss,
    /// ShadowsocksR
    Ssr,
    /// Anything else the store may contain
    #[serde(other)]
    Unknown,
}

/// Access-control rules handed to the client by path
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Acl {
    #[serde(default)]
    pub enable: bool,
    #[serde(default)]
    pub text: String,
}

/// One remote server definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remark: Option<String>,
    pub server_host: String,
    pub server_port: u16,
    #[serde(default)]
    pub password: String,
    pub encrypt_method: EncryptMethod,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<SsrProtocol>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol_param: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub obfs: Option<SsrObfs>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub obfs_param: Option<String>,
    /// Socket timeout passed to the client (seconds)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acl: Option<Acl>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fast_open: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub no_delay: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub udp: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_open_file: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plugin: Option<Plugin>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plugin_opts: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<ServerType>,
}

impl Config {
    /// Create a minimal Shadowsocks server definition
    pub fn ss(host: impl Into<String>, port: u16, method: EncryptMethod, password: impl Into<String>) -> Self {
        Self {
            id: String::new(),
            remark: None,
            server_host: host.into(),
            server_port: port,
            password: password.into(),
            encrypt_method: method,
            protocol: None,
            protocol_param: None,
            obfs: None,
            obfs_param: None,
            timeout: None,
            acl: None,
            fast_open: None,
            no_delay: None,
            udp: None,
            max_open_file: None,
            plugin: None,
            plugin_opts: None,
            kind: Some(ServerType::Ss),
        }
    }

    /// Create a minimal ShadowsocksR server definition
    pub fn ssr(
        host: impl Into<String>,
        port: u16,
        method: EncryptMethod,
        password: impl Into<String>,
        protocol: SsrProtocol,
        obfs: SsrObfs,
    ) -> Self {
        Self {
            protocol: Some(protocol),
            obfs: Some(obfs),
            kind: Some(ServerType::Ssr),
            ..Self::ss(host, port, method, password)
        }
    }

    /// Builder-style remark
    pub fn with_remark(mut self, remark: impl Into<String>) -> Self {
        self.remark = Some(remark.into());
        self
    }

    /// Builder-style id
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Remark, or `host:port` when none is set
    pub fn display_name(&self) -> String {
        match self.remark.as_deref() {
            Some(r) if !r.is_empty() => r.to_string(),
            _ => format!("{}:{}", self.server_host, self.server_port),
        }
    }

    /// SSR protocol with the client's default applied
    pub fn protocol_or_default(&self) -> SsrProtocol {
        self.protocol.unwrap_or(SsrProtocol::Origin)
    }

    /// SSR obfs with the client's default applied
    pub fn obfs_or_default(&self) -> SsrObfs {
        self.obfs.unwrap_or(SsrObfs::Plain)
    }

    /// Validate the fields the client needs before anything is spawned
    pub fn validate(&self) -> Result<ServerType, ConfigError> {
        if self.server_host.trim().is_empty() {
            return Err(ConfigError::EmptyHost);
        }
        if self.server_port == 0 {
            return Err(ConfigError::InvalidPort("serverPort"));
        }

        match self.kind {
            Some(ServerType::Ss) => Ok(ServerType::Ss),
            Some(ServerType::Ssr) => Ok(ServerType::Ssr),
            Some(ServerType::Unknown) => Err(ConfigError::UnsupportedType("unknown".into())),
            None => Err(ConfigError::UnsupportedType("missing".into())),
        }
    }
}

/// A named server group, usually materialized from a subscription
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupConfig {
    pub id: String,
    pub name: String,
    pub servers: Vec<Config>,
    #[serde(rename = "type")]
    pub kind: ServerType,
}

/// Routing strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Mode {
    /// Proxy auto-config served on the PAC port
    #[serde(rename = "PAC")]
    Pac,
    /// Everything through the proxy
    Global,
    /// Local SOCKS port only
    #[default]
    Manual,
}

/// Local HTTP bridge intent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpProxySettings {
    #[serde(default)]
    pub enable: bool,
    #[serde(default = "default_http_port")]
    pub port: u16,
}

impl Default for HttpProxySettings {
    fn default() -> Self {
        Self {
            enable: false,
            port: default_http_port(),
        }
    }
}

/// Process-wide session intent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    /// Id of the server to connect to (non-owning reference)
    #[serde(default)]
    pub selected_server: Option<String>,
    #[serde(default)]
    pub mode: Mode,
    #[serde(default)]
    pub verbose: bool,
    #[serde(default = "default_local_port")]
    pub local_port: u16,
    #[serde(default = "default_pac_port")]
    pub pac_port: u16,
    #[serde(default)]
    pub http_proxy: HttpProxySettings,
    #[serde(default)]
    pub acl: Acl,
    #[serde(default = "default_gfw_list_url")]
    pub gfw_list_url: String,
    #[serde(default)]
    pub auto_launch: bool,
    #[serde(default = "default_lang")]
    pub lang: String,
}

fn default_local_port() -> u16 {
    1080
}

fn default_pac_port() -> u16 {
    1090
}

fn default_http_port() -> u16 {
    1095
}

fn default_gfw_list_url() -> String {
    "https://raw.githubusercontent.com/gfwlist/gfwlist/master/gfwlist.txt".to_string()
}

fn default_lang() -> String {
    "zh-CN".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            selected_server: None,
            mode: Mode::default(),
            verbose: false,
            local_port: default_local_port(),
            pac_port: default_pac_port(),
            http_proxy: HttpProxySettings::default(),
            acl: Acl::default(),
            gfw_list_url: default_gfw_list_url(),
            auto_launch: false,
            lang: default_lang(),
        }
    }
}

impl Settings {
    /// Check the local port layout
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.local_port == 0 {
            return Err(ConfigError::InvalidPort("localPort"));
        }
        if self.mode == Mode::Pac {
            if self.pac_port == 0 {
                return Err(ConfigError::InvalidPort("pacPort"));
            }
            if self.pac_port == self.local_port {
                return Err(ConfigError::PortConflict(self.pac_port));
            }
        }
        if self.http_proxy.enable {
            if self.http_proxy.port == 0 {
                return Err(ConfigError::InvalidPort("httpProxy.port"));
            }
            if self.http_proxy.port == self.local_port
                || (self.mode == Mode::Pac && self.http_proxy.port == self.pac_port)
            {
                return Err(ConfigError::PortConflict(self.http_proxy.port));
            }
        }
        Ok(())
    }

    /// Check that `selectedServer` refers to `config`
    pub fn check_selected(&self, config: &Config) -> Result<(), ConfigError> {
        match self.selected_server.as_deref() {
            None | Some("") => Err(ConfigError::NoServerSelected),
            Some(id) if id == config.id => Ok(()),
            Some(id) => Err(ConfigError::ServerMismatch {
                selected: id.to_string(),
                config: config.id.clone(),
            }),
        }
    }

    /// ACL text to hand to the client: the server's own rules win over the global ones
    pub fn effective_acl<'a>(&'a self, config: &'a Config) -> Option<&'a str> {
        match config.acl.as_ref() {
            Some(acl) if acl.enable => Some(acl.text.as_str()),
            _ if self.acl.enable => Some(self.acl.text.as_str()),
            _ => None,
        }
    }
}

/// Configuration errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("Server host is empty")]
    EmptyHost,

    #[error("Invalid port: {0}")]
    InvalidPort(&'static str),

    #[error("Port {0} is used twice in the session layout")]
    PortConflict(u16),

    #[error("Unsupported server type: {0}")]
    UnsupportedType(String),

    #[error("Unsupported encrypt method: {0}")]
    UnknownCipher(String),

    #[error("Unsupported SSR protocol: {0}")]
    UnknownProtocol(String),

    #[error("Unsupported SSR obfs: {0}")]
    UnknownObfs(String),

    #[error("Unsupported plugin: {0}")]
    UnknownPlugin(String),

    #[error("No server selected")]
    NoServerSelected,

    #[error("Selected server {selected} does not match config {config}")]
    ServerMismatch { selected: String, config: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cipher_names() {
        assert_eq!(EncryptMethod::all().len(), 20);
        assert_eq!("aes-256-gcm".parse::<EncryptMethod>().unwrap(), EncryptMethod::Aes256Gcm);
        assert_eq!(EncryptMethod::Chacha20IetfPoly1305.as_str(), "chacha20-ietf-poly1305");
        assert!(matches!(
            "des-cbc".parse::<EncryptMethod>(),
            Err(ConfigError::UnknownCipher(_))
        ));
    }

    #[test]
    fn test_config_from_ui_json() {
        let json = r#"{
            "id": "a1",
            "remark": "tokyo",
            "serverHost": "1.2.3.4",
            "serverPort": 8388,
            "password": "p",
            "encryptMethod": "aes-256-gcm",
            "fastOpen": true,
            "type": "ss"
        }"#;
        let config: Config = serde_json::from_str(json).unwrap();

        assert_eq!(config.kind, Some(ServerType::Ss));
        assert_eq!(config.fast_open, Some(true));
        assert_eq!(config.validate().unwrap(), ServerType::Ss);
    }

    #[test]
    fn test_unknown_type_decodes() {
        let json = r#"{"serverHost":"h","serverPort":1,"encryptMethod":"none","type":"vmess"}"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.kind, Some(ServerType::Unknown));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_host_and_port() {
        let mut config = Config::ss("", 8388, EncryptMethod::Aes256Gcm, "p");
        assert_eq!(config.validate(), Err(ConfigError::EmptyHost));

        config.server_host = "example.com".into();
        config.server_port = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidPort("serverPort")));
    }

    #[test]
    fn test_settings_defaults() {
        let settings: Settings = serde_json::from_str("{}").unwrap();
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.mode, Mode::Manual);
        assert_eq!(settings.local_port, 1080);
        assert_eq!(settings.pac_port, 1090);
        assert_eq!(settings.http_proxy.port, 1095);
    }

    #[test]
    fn test_settings_port_layout() {
        let mut settings = Settings {
            mode: Mode::Pac,
            pac_port: 1080,
            ..Settings::default()
        };
        assert_eq!(settings.validate(), Err(ConfigError::PortConflict(1080)));

        settings.pac_port = 1090;
        settings.http_proxy = HttpProxySettings { enable: true, port: 1090 };
        assert_eq!(settings.validate(), Err(ConfigError::PortConflict(1090)));

        settings.http_proxy.port = 1095;
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_selected_server() {
        let config = Config::ss("h", 1, EncryptMethod::None, "").with_id("x");
        let mut settings = Settings::default();
        assert_eq!(settings.check_selected(&config), Err(ConfigError::NoServerSelected));

        settings.selected_server = Some("y".into());
        assert!(matches!(
            settings.check_selected(&config),
            Err(ConfigError::ServerMismatch { .. })
        ));

        settings.selected_server = Some("x".into());
        assert!(settings.check_selected(&config).is_ok());
    }

    #[test]
    fn test_effective_acl() {
        let mut config = Config::ss("h", 1, EncryptMethod::None, "");
        let mut settings = Settings::default();
        assert_eq!(settings.effective_acl(&config), None);

        settings.acl = Acl { enable: true, text: "global".into() };
        assert_eq!(settings.effective_acl(&config), Some("global"));

        config.acl = Some(Acl { enable: true, text: "server".into() });
        assert_eq!(settings.effective_acl(&config), Some("server"));
    }
}
