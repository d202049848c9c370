//! Port Ledger
//!
//! Tracks which local ports the session currently owns so a port is never
//! claimed twice and every claim is released on the way out.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, RwLock};
use tokio::net::TcpListener;
use tracing::debug;

/// Who holds a port
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortOwner {
    Client,
    Pac,
    /// HTTP bridge started with the session (`httpProxy.enable`)
    SessionBridge,
    /// HTTP bridge started on its own
    Bridge,
}

impl std::fmt::Display for PortOwner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Client => "proxy client",
            Self::Pac => "PAC server",
            Self::SessionBridge => "session HTTP bridge",
            Self::Bridge => "HTTP bridge",
        };
        f.write_str(name)
    }
}

/// Shared record of owned ports
#[derive(Debug, Clone, Default)]
pub struct PortLedger {
    owners: Arc<RwLock<HashMap<u16, PortOwner>>>,
}

impl PortLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `port` for `owner`
    pub fn acquire(&self, port: u16, owner: PortOwner) -> Result<(), PortError> {
        if port == 0 {
            return Err(PortError::Invalid);
        }
        let mut owners = self.owners.write().map_err(|_| PortError::Poisoned)?;
        if let Some(current) = owners.get(&port) {
            return Err(PortError::Owned {
                port,
                owner: *current,
            });
        }
        owners.insert(port, owner);
        debug!("Port {} acquired by {}", port, owner);
        Ok(())
    }

    /// Release `port`. Releasing an unowned port is a no-op.
    pub fn release(&self, port: u16) {
        if let Ok(mut owners) = self.owners.write() {
            if let Some(owner) = owners.remove(&port) {
                debug!("Port {} released by {}", port, owner);
            }
        }
    }

    /// Release every port held by `owner`
    pub fn release_owner(&self, owner: PortOwner) {
        if let Ok(mut owners) = self.owners.write() {
            owners.retain(|_, o| *o != owner);
        }
    }

    /// Current owner of `port`
    pub fn owner(&self, port: u16) -> Option<PortOwner> {
        self.owners.read().ok()?.get(&port).copied()
    }

    /// Number of owned ports
    pub fn len(&self) -> usize {
        self.owners.read().map(|o| o.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// True when nothing listens on `127.0.0.1:port`
pub async fn is_free(port: u16) -> bool {
    TcpListener::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, port)))
        .await
        .is_ok()
}

/// Port ledger errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum PortError {
    #[error("Port 0 cannot be owned")]
    Invalid,

    #[error("Port {port} is already used by the {owner}")]
    Owned { port: u16, owner: PortOwner },

    #[error("Port ledger poisoned")]
    Poisoned,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_release() {
        let ledger = PortLedger::new();

        ledger.acquire(1080, PortOwner::Client).unwrap();
        ledger.acquire(1090, PortOwner::Pac).unwrap();
        assert_eq!(ledger.len(), 2);
        assert_eq!(ledger.owner(1080), Some(PortOwner::Client));

        ledger.release(1080);
        assert_eq!(ledger.owner(1080), None);
        ledger.release(1080);
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn test_conflict_names_owner() {
        let ledger = PortLedger::new();
        ledger.acquire(1080, PortOwner::Client).unwrap();

        let err = ledger.acquire(1080, PortOwner::Bridge).unwrap_err();
        assert!(matches!(err, PortError::Owned { port: 1080, owner: PortOwner::Client }));
        assert_eq!(err.to_string(), "Port 1080 is already used by the proxy client");
    }

    #[test]
    fn test_release_owner() {
        let ledger = PortLedger::new();
        ledger.acquire(1, PortOwner::Bridge).unwrap();
        ledger.acquire(2, PortOwner::Bridge).unwrap();
        ledger.acquire(3, PortOwner::Pac).unwrap();

        ledger.release_owner(PortOwner::Bridge);
        assert_eq!(ledger.len(), 1);
        assert!(ledger.acquire(0, PortOwner::Pac).is_err());
    }

    #[tokio::test]
    async fn test_is_free() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(!is_free(port).await);
        drop(listener);
        assert!(is_free(port).await);
    }
}
