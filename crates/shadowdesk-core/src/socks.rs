//! SOCKS5 Client
//!
//! Minimal RFC 1928 client used by the HTTP bridge to open streams through
//! the local proxy client. Only the no-auth method and the CONNECT command
//! are spoken.
//!
//! ```text
//! greeting  -> [05 01 00]          <- [05 00]
//! request   -> [05 01 00 ATYP ADDR PORT]
//! reply     <- [05 REP 00 ATYP BND.ADDR BND.PORT]
//! ```

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

/// SOCKS5 version
const SOCKS5_VERSION: u8 = 0x05;

/// SOCKS5 authentication methods
const AUTH_NO_AUTH: u8 = 0x00;

/// SOCKS5 commands
const CMD_CONNECT: u8 = 0x01;

/// SOCKS5 address types
const ADDR_IPV4: u8 = 0x01;
const ADDR_DOMAIN: u8 = 0x03;
const ADDR_IPV6: u8 = 0x04;

/// SOCKS5 reply codes
const REPLY_SUCCESS: u8 = 0x00;

/// Handshake deadline
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Destination of a CONNECT request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetAddr {
    Ip(SocketAddr),
    Domain(String, u16),
}

impl TargetAddr {
    /// Parse `host:port`, `[v6]:port` or `v6` literal authority
    pub fn from_authority(authority: &str, default_port: u16) -> Result<Self, SocksError> {
        let authority = authority.trim();
        if authority.is_empty() {
            return Err(SocksError::InvalidTarget(authority.to_string()));
        }

        if let Ok(addr) = authority.parse::<SocketAddr>() {
            return Ok(Self::Ip(addr));
        }

        let (host, port) = if let Some(rest) = authority.strip_prefix('[') {
            let (host, tail) = rest
                .split_once(']')
                .ok_or_else(|| SocksError::InvalidTarget(authority.to_string()))?;
            let port = match tail.strip_prefix(':') {
                Some(p) => p
                    .parse()
                    .map_err(|_| SocksError::InvalidTarget(authority.to_string()))?,
                None => default_port,
            };
            (host, port)
        } else {
            match authority.rsplit_once(':') {
                Some((host, port)) if !host.contains(':') => (
                    host,
                    port.parse()
                        .map_err(|_| SocksError::InvalidTarget(authority.to_string()))?,
                ),
                _ => (authority, default_port),
            }
        };

        if host.is_empty() || port == 0 {
            return Err(SocksError::InvalidTarget(authority.to_string()));
        }

        Ok(match host.parse::<IpAddr>() {
            Ok(ip) => Self::Ip(SocketAddr::new(ip, port)),
            Err(_) => Self::Domain(host.to_string(), port),
        })
    }

    /// Port of the destination
    pub fn port(&self) -> u16 {
        match self {
            Self::Ip(addr) => addr.port(),
            Self::Domain(_, port) => *port,
        }
    }

    fn encode(&self, buf: &mut Vec<u8>) -> Result<(), SocksError> {
        match self {
            Self::Ip(SocketAddr::V4(addr)) => {
                buf.push(ADDR_IPV4);
                buf.extend_from_slice(&addr.ip().octets());
            }
            Self::Ip(SocketAddr::V6(addr)) => {
                buf.push(ADDR_IPV6);
                buf.extend_from_slice(&addr.ip().octets());
            }
            Self::Domain(host, _) => {
                let len = u8::try_from(host.len())
                    .map_err(|_| SocksError::InvalidTarget(host.clone()))?;
                buf.push(ADDR_DOMAIN);
                buf.push(len);
                buf.extend_from_slice(host.as_bytes());
            }
        }
        buf.extend_from_slice(&self.port().to_be_bytes());
        Ok(())
    }
}

impl fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ip(addr) => write!(f, "{}", addr),
            Self::Domain(host, port) => write!(f, "{}:{}", host, port),
        }
    }
}

/// Open a stream to `target` through the SOCKS5 proxy at `proxy`
pub async fn connect(proxy: SocketAddr, target: &TargetAddr) -> Result<TcpStream, SocksError> {
    let mut stream = TcpStream::connect(proxy)
        .await
        .map_err(|e| SocksError::ProxyUnreachable(format!("{}: {}", proxy, e)))?;

    tokio::time::timeout(HANDSHAKE_TIMEOUT, handshake(&mut stream, target))
        .await
        .map_err(|_| SocksError::Timeout)??;

    debug!("SOCKS5 tunnel to {} via {}", target, proxy);
    Ok(stream)
}

async fn handshake(stream: &mut TcpStream, target: &TargetAddr) -> Result<(), SocksError> {
    // ===== Method negotiation =====
    stream.write_all(&[SOCKS5_VERSION, 1, AUTH_NO_AUTH]).await?;

    let mut choice = [0u8; 2];
    stream.read_exact(&mut choice).await?;
    if choice[0] != SOCKS5_VERSION {
        return Err(SocksError::InvalidVersion(choice[0]));
    }
    if choice[1] != AUTH_NO_AUTH {
        return Err(SocksError::AuthNotSupported);
    }

    // ===== CONNECT =====
    let mut request = vec![SOCKS5_VERSION, CMD_CONNECT, 0x00];
    target.encode(&mut request)?;
    stream.write_all(&request).await?;

    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;
    if header[0] != SOCKS5_VERSION {
        return Err(SocksError::InvalidVersion(header[0]));
    }
    if header[1] != REPLY_SUCCESS {
        return Err(SocksError::Rejected(header[1]));
    }

    // Drain the bound address
    let addr_len = match header[3] {
        ADDR_IPV4 => 4,
        ADDR_IPV6 => 16,
        ADDR_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            len[0] as usize
        }
        other => return Err(SocksError::InvalidAddressType(other)),
    };
    let mut bound = vec![0u8; addr_len + 2];
    stream.read_exact(&mut bound).await?;

    Ok(())
}

/// Human readable RFC 1928 reply code
fn reply_message(code: u8) -> &'static str {
    match code {
        0x01 => "general failure",
        0x02 => "connection not allowed by ruleset",
        0x03 => "network unreachable",
        0x04 => "host unreachable",
        0x05 => "connection refused",
        0x06 => "TTL expired",
        0x07 => "command not supported",
        0x08 => "address type not supported",
        _ => "unknown error",
    }
}

/// SOCKS client errors
#[derive(Debug, thiserror::Error)]
pub enum SocksError {
    #[error("SOCKS proxy unreachable: {0}")]
    ProxyUnreachable(String),

    #[error("Invalid target address: {0}")]
    InvalidTarget(String),

    #[error("Invalid SOCKS version: {0:#04x}")]
    InvalidVersion(u8),

    #[error("No acceptable authentication method")]
    AuthNotSupported,

    #[error("SOCKS request rejected: {}", reply_message(*.0))]
    Rejected(u8),

    #[error("Invalid address type in reply: {0:#04x}")]
    InvalidAddressType(u8),

    #[error("SOCKS handshake timed out")]
    Timeout,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// In-process SOCKS5 server used by tests across the crate
#[cfg(test)]
pub(crate) mod test_server {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    /// Accepts CONNECT requests and relays them directly
    pub(crate) async fn spawn() -> (SocketAddr, JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(serve(stream));
            }
        });
        (addr, handle)
    }

    async fn serve(mut stream: TcpStream) -> std::io::Result<()> {
        let mut greeting = [0u8; 2];
        stream.read_exact(&mut greeting).await?;
        let mut methods = vec![0u8; greeting[1] as usize];
        stream.read_exact(&mut methods).await?;
        stream.write_all(&[SOCKS5_VERSION, AUTH_NO_AUTH]).await?;

        let mut header = [0u8; 4];
        stream.read_exact(&mut header).await?;
        let dest = match header[3] {
            ADDR_IPV4 => {
                let mut ip = [0u8; 4];
                stream.read_exact(&mut ip).await?;
                IpAddr::from(Ipv4Addr::from(ip)).to_string()
            }
            ADDR_IPV6 => {
                let mut ip = [0u8; 16];
                stream.read_exact(&mut ip).await?;
                format!("[{}]", Ipv6Addr::from(ip))
            }
            _ => {
                let mut len = [0u8; 1];
                stream.read_exact(&mut len).await?;
                let mut host = vec![0u8; len[0] as usize];
                stream.read_exact(&mut host).await?;
                String::from_utf8_lossy(&host).into_owned()
            }
        };
        let mut port = [0u8; 2];
        stream.read_exact(&mut port).await?;
        let dest = format!("{}:{}", dest, u16::from_be_bytes(port));

        match TcpStream::connect(&dest).await {
            Ok(mut remote) => {
                stream
                    .write_all(&[SOCKS5_VERSION, REPLY_SUCCESS, 0, ADDR_IPV4, 0, 0, 0, 0, 0, 0])
                    .await?;
                let _ = tokio::io::copy_bidirectional(&mut stream, &mut remote).await;
            }
            Err(_) => {
                stream
                    .write_all(&[SOCKS5_VERSION, 0x05, 0, ADDR_IPV4, 0, 0, 0, 0, 0, 0])
                    .await?;
            }
        }
        Ok(())
    }
}
