//! Share-link Codec
//!
//! Encodes server definitions as `ss://` / `ssr://` links and decodes links,
//! whitespace-separated link lists and base64 subscription bodies back into
//! configurations.
//!
//! # Formats
//!
//! ```text
//! ss://BASE64(method:password@host:port)#remark            (legacy)
//! ss://BASE64URL(method:password)@host:port/?plugin=..#remark  (SIP002)
//! ssr://BASE64URL(host:port:protocol:method:obfs:BASE64URL(password)/?obfsparam=..&protoparam=..&remarks=..&group=..)
//! ```
//!
//! Decoding is pure: no I/O, no panics, every malformed input maps to a
//! [`ParseError`].

use crate::config::{Config, EncryptMethod, GroupConfig, Plugin, ServerType, SsrObfs, SsrProtocol};
use base64::alphabet;
use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig, STANDARD, URL_SAFE_NO_PAD};
use base64::engine::DecodePaddingMode;
use base64::Engine as _;
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use tracing::debug;

const SS_SCHEME: &str = "ss://";
const SSR_SCHEME: &str = "ssr://";

/// Characters `encodeURIComponent` leaves alone
const COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

/// Subscriptions in the wild mix padding styles and leave trailing bits set
const LENIENT: GeneralPurposeConfig = GeneralPurposeConfig::new()
    .with_decode_padding_mode(DecodePaddingMode::Indifferent)
    .with_decode_allow_trailing_bits(true);
const LENIENT_STANDARD: GeneralPurpose = GeneralPurpose::new(&alphabet::STANDARD, LENIENT);
const LENIENT_URL_SAFE: GeneralPurpose = GeneralPurpose::new(&alphabet::URL_SAFE, LENIENT);

/// Result of [`parse`]
#[derive(Debug, Clone, PartialEq)]
pub enum Parsed {
    /// A single share link
    Single(Config),
    /// Several links or a subscription body
    Group(GroupConfig),
}

impl Parsed {
    /// Flatten into a server list
    pub fn into_servers(self) -> Vec<Config> {
        match self {
            Parsed::Single(config) => vec![config],
            Parsed::Group(group) => group.servers,
        }
    }
}

/// Decoded subscription body
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionBody {
    /// SSR `group` parameter of the first server that carries one
    pub group: Option<String>,
    pub servers: Vec<Config>,
}

/// Encode a server as a share link
///
/// Returns an empty string when the server type is missing or unknown;
/// callers must check for non-empty output.
pub fn generate(config: &Config) -> String {
    match config.kind {
        Some(ServerType::Ss) => generate_ss(config),
        Some(ServerType::Ssr) => generate_ssr(config, None),
        Some(ServerType::Unknown) | None => String::new(),
    }
}

/// Encode an SSR server carrying a group name
pub fn generate_ssr_in_group(config: &Config, group: &str) -> String {
    generate_ssr(config, Some(group))
}

fn generate_ss(config: &Config) -> String {
    let host = bracket_host(&config.server_host);
    let mut link = match config.plugin {
        Some(plugin) => {
            let userinfo = URL_SAFE_NO_PAD.encode(format!(
                "{}:{}",
                config.encrypt_method, config.password
            ));
            let mut plugin_arg = plugin.as_str().to_string();
            if let Some(opts) = config.plugin_opts.as_deref().filter(|o| !o.is_empty()) {
                plugin_arg.push(';');
                plugin_arg.push_str(opts);
            }
            format!(
                "{SS_SCHEME}{userinfo}@{host}:{}/?plugin={}",
                config.server_port,
                utf8_percent_encode(&plugin_arg, COMPONENT)
            )
        }
        None => {
            let payload = format!(
                "{}:{}@{}:{}",
                config.encrypt_method, config.password, host, config.server_port
            );
            format!("{SS_SCHEME}{}", STANDARD.encode(payload))
        }
    };

    if let Some(remark) = config.remark.as_deref().filter(|r| !r.is_empty()) {
        link.push('#');
        link.push_str(&utf8_percent_encode(remark, COMPONENT).to_string());
    }
    link
}

fn generate_ssr(config: &Config, group: Option<&str>) -> String {
    let mut main = format!(
        "{}:{}:{}:{}:{}:{}",
        config.server_host,
        config.server_port,
        config.protocol_or_default(),
        config.encrypt_method,
        config.obfs_or_default(),
        URL_SAFE_NO_PAD.encode(&config.password)
    );

    let params: Vec<String> = [
        ("obfsparam", config.obfs_param.as_deref()),
        ("protoparam", config.protocol_param.as_deref()),
        ("remarks", config.remark.as_deref()),
        ("group", group),
    ]
    .into_iter()
    .filter_map(|(key, value)| {
        value
            .filter(|v| !v.is_empty())
            .map(|v| format!("{key}={}", URL_SAFE_NO_PAD.encode(v)))
    })
    .collect();

    main.push_str("/?");
    main.push_str(&params.join("&"));

    format!("{SSR_SCHEME}{}", URL_SAFE_NO_PAD.encode(main))
}

/// Decode a single link, a whitespace-separated link list, or a base64
/// subscription body
pub fn parse(input: &str) -> Result<Parsed, ParseError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(ParseError::Empty);
    }

    let tokens: Vec<&str> = trimmed.split_whitespace().collect();
    let has_scheme = tokens.iter().any(|t| t.contains("://"));

    if !has_scheme {
        let body = parse_subscription_body(trimmed)?;
        return Ok(Parsed::Group(into_group(body.group, body.servers)));
    }

    if tokens.len() == 1 {
        return parse_link(tokens[0]).map(Parsed::Single);
    }

    let servers = parse_links(trimmed)?;
    Ok(Parsed::Group(into_group(None, servers)))
}

/// Decode every link in `text`, skipping malformed ones
///
/// Fails only when nothing at all could be decoded.
pub fn parse_links(text: &str) -> Result<Vec<Config>, ParseError> {
    let mut servers = Vec::new();
    let mut first_error = None;

    for token in text.split_whitespace() {
        match parse_link(token) {
            Ok(config) => servers.push(config),
            Err(e) => {
                debug!("Skipping share link: {}", e);
                first_error.get_or_insert(e);
            }
        }
    }

    match (servers.is_empty(), first_error) {
        (true, Some(e)) => Err(e),
        (true, None) => Err(ParseError::Empty),
        _ => Ok(servers),
    }
}

/// Decode one share link
pub fn parse_link(link: &str) -> Result<Config, ParseError> {
    parse_link_with_group(link).map(|(config, _)| config)
}

fn parse_link_with_group(link: &str) -> Result<(Config, Option<String>), ParseError> {
    let link = link.trim();
    if let Some(rest) = strip_scheme(link, SSR_SCHEME) {
        parse_ssr(rest)
    } else if let Some(rest) = strip_scheme(link, SS_SCHEME) {
        parse_ss(rest).map(|c| (c, None))
    } else {
        let scheme = link.split_once("://").map(|(s, _)| s).unwrap_or(link);
        Err(ParseError::UnsupportedScheme(scheme.to_string()))
    }
}

/// Decode a base64 subscription body into servers
///
/// Lines that are not valid links are skipped; an undecodable body is an error.
pub fn parse_subscription_body(body: &str) -> Result<SubscriptionBody, ParseError> {
    let compact: String = body.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.is_empty() {
        return Err(ParseError::Empty);
    }
    let text = decode_b64_string(&compact, "subscription")?;

    let mut group = None;
    let mut servers = Vec::new();
    for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
        match parse_link_with_group(line) {
            Ok((config, line_group)) => {
                if group.is_none() {
                    group = line_group;
                }
                servers.push(config);
            }
            Err(e) => debug!("Skipping subscription line: {}", e),
        }
    }

    Ok(SubscriptionBody { group, servers })
}

fn into_group(name: Option<String>, servers: Vec<Config>) -> GroupConfig {
    let kind = servers
        .first()
        .and_then(|c| c.kind)
        .unwrap_or(ServerType::Ss);
    GroupConfig {
        id: uuid::Uuid::new_v4().to_string(),
        name: name.unwrap_or_default(),
        servers,
        kind,
    }
}

fn parse_ss(rest: &str) -> Result<Config, ParseError> {
    let (body, fragment) = rest.split_once('#').unwrap_or((rest, ""));
    let (body, query) = body.split_once('?').unwrap_or((body, ""));

    let (method, password, host, port) = match body.rfind('@') {
        Some(at) => {
            let (method, password) = parse_ss_userinfo(&body[..at])?;
            let (host, port) = split_host_port(&body[at + 1..])?;
            (method, password, host, port)
        }
        None => {
            let decoded = decode_b64_string(body, "ss payload")?;
            let at = decoded.rfind('@').ok_or(ParseError::MissingField("host"))?;
            let (method, password) = decoded[..at]
                .split_once(':')
                .ok_or(ParseError::MissingField("password"))?;
            let (host, port) = split_host_port(&decoded[at + 1..])?;
            (method.to_string(), password.to_string(), host, port)
        }
    };

    let method: EncryptMethod = method.parse().map_err(|_| ParseError::InvalidField {
        field: "method",
        value: method.clone(),
    })?;

    let mut config = Config::ss(host, port, method, password);
    config.id = uuid::Uuid::new_v4().to_string();

    let mut remark = decode_component(fragment);
    for (key, value) in query_pairs(query) {
        match key.as_str() {
            "plugin" => {
                let mut parts = value.split(';');
                let name = parts.next().unwrap_or_default();
                if !name.is_empty() {
                    config.plugin = Some(name.parse::<Plugin>().map_err(|_| {
                        ParseError::InvalidField {
                            field: "plugin",
                            value: name.to_string(),
                        }
                    })?);
                }
                let opts: Vec<&str> = parts.filter(|p| !p.is_empty()).collect();
                if !opts.is_empty() {
                    config.plugin_opts = Some(opts.join(";"));
                }
            }
            "remarks" | "name" if remark.is_empty() => remark = value,
            _ => {}
        }
    }
    if !remark.is_empty() {
        config.remark = Some(remark);
    }

    Ok(config)
}

fn parse_ss_userinfo(userinfo: &str) -> Result<(String, String), ParseError> {
    let decoded = if userinfo.contains(':') {
        decode_component(userinfo)
    } else {
        decode_b64_string(&decode_component(userinfo), "ss userinfo")?
    };
    let (method, password) = decoded
        .split_once(':')
        .ok_or(ParseError::MissingField("password"))?;
    Ok((method.to_string(), password.to_string()))
}

fn parse_ssr(rest: &str) -> Result<(Config, Option<String>), ParseError> {
    let decoded = decode_b64_string(rest.trim_end_matches('/'), "ssr payload")?;
    let (main, query) = match decoded.split_once("/?") {
        Some(parts) => parts,
        None => decoded.split_once('?').unwrap_or((decoded.as_str(), "")),
    };
    let main = main.trim_end_matches('/');

    // host may itself contain ':' (IPv6), so peel fields from the right
    let mut fields = main.rsplitn(6, ':');
    let password_b64 = fields.next().ok_or(ParseError::MissingField("password"))?;
    let obfs = fields.next().ok_or(ParseError::MissingField("obfs"))?;
    let method = fields.next().ok_or(ParseError::MissingField("method"))?;
    let protocol = fields.next().ok_or(ParseError::MissingField("protocol"))?;
    let port = fields.next().ok_or(ParseError::MissingField("port"))?;
    let host = fields.next().ok_or(ParseError::MissingField("host"))?;

    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Err(ParseError::MissingField("host"));
    }
    let port = parse_port(port)?;
    let method: EncryptMethod = method.parse().map_err(|_| ParseError::InvalidField {
        field: "method",
        value: method.to_string(),
    })?;
    let protocol: SsrProtocol = protocol.parse().map_err(|_| ParseError::InvalidField {
        field: "protocol",
        value: protocol.to_string(),
    })?;
    let obfs: SsrObfs = obfs.parse().map_err(|_| ParseError::InvalidField {
        field: "obfs",
        value: obfs.to_string(),
    })?;
    let password = if password_b64.is_empty() {
        String::new()
    } else {
        decode_b64_string(password_b64, "ssr password")?
    };

    let mut config = Config::ssr(host, port, method, password, protocol, obfs);
    config.id = uuid::Uuid::new_v4().to_string();

    let mut group = None;
    for part in query.split('&').filter(|p| !p.is_empty()) {
        let (key, value) = part.split_once('=').unwrap_or((part, ""));
        if value.is_empty() {
            continue;
        }
        let value = decode_b64_string(value, "ssr parameter")?;
        match key {
            "obfsparam" => config.obfs_param = Some(value),
            "protoparam" => config.protocol_param = Some(value),
            "remarks" => config.remark = Some(value),
            "group" => group = Some(value),
            _ => {}
        }
    }

    Ok((config, group))
}

fn strip_scheme<'a>(link: &'a str, scheme: &str) -> Option<&'a str> {
    match link.get(..scheme.len()) {
        Some(prefix) if prefix.eq_ignore_ascii_case(scheme) => link.get(scheme.len()..),
        _ => None,
    }
}

fn bracket_host(host: &str) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]")
    } else {
        host.to_string()
    }
}

fn split_host_port(value: &str) -> Result<(String, u16), ParseError> {
    let value = value.trim().trim_end_matches('/');

    if let Some(stripped) = value.strip_prefix('[') {
        let end = stripped.find(']').ok_or(ParseError::MissingField("host"))?;
        let host = &stripped[..end];
        let port = stripped[end + 1..]
            .strip_prefix(':')
            .ok_or(ParseError::MissingField("port"))?;
        return Ok((host.to_string(), parse_port(port)?));
    }

    let (host, port) = value.rsplit_once(':').ok_or(ParseError::MissingField("port"))?;
    if host.is_empty() {
        return Err(ParseError::MissingField("host"));
    }
    Ok((host.to_string(), parse_port(port)?))
}

fn parse_port(value: &str) -> Result<u16, ParseError> {
    match value.trim().parse::<u16>() {
        Ok(port) if port != 0 => Ok(port),
        _ => Err(ParseError::InvalidPort(value.to_string())),
    }
}

fn query_pairs(query: &str) -> Vec<(String, String)> {
    query
        .split('&')
        .filter(|p| !p.is_empty())
        .map(|part| {
            let (key, value) = part.split_once('=').unwrap_or((part, ""));
            (decode_component(key).to_lowercase(), decode_component(value))
        })
        .collect()
}

fn decode_component(value: &str) -> String {
    percent_decode_str(value).decode_utf8_lossy().into_owned()
}

/// Lenient base64: either alphabet, any padding
pub(crate) fn decode_b64(input: &str) -> Option<Vec<u8>> {
    let input = input.trim();
    let (first, second) = if input.contains(['-', '_']) {
        (&LENIENT_URL_SAFE, &LENIENT_STANDARD)
    } else {
        (&LENIENT_STANDARD, &LENIENT_URL_SAFE)
    };
    first.decode(input).or_else(|_| second.decode(input)).ok()
}

fn decode_b64_string(input: &str, what: &'static str) -> Result<String, ParseError> {
    let bytes = decode_b64(input).ok_or(ParseError::InvalidBase64(what))?;
    String::from_utf8(bytes).map_err(|_| ParseError::InvalidUtf8(what))
}

/// Share-link decoding errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("Nothing to parse")]
    Empty,

    #[error("Unsupported scheme: {0}")]
    UnsupportedScheme(String),

    #[error("Invalid base64 in {0}")]
    InvalidBase64(&'static str),

    #[error("Invalid UTF-8 in {0}")]
    InvalidUtf8(&'static str),

    #[error("Missing field: {0}")]
    MissingField(&'static str),

    #[error("Invalid port: {0}")]
    InvalidPort(String),

    #[error("Invalid {field}: {value}")]
    InvalidField { field: &'static str, value: String },
}
