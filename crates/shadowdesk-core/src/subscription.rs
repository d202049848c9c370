//! Subscription Fetcher
//!
//! Downloads a subscription URL and expands the base64 body into servers.
//! Concurrent requests for the same URL share one download.

use crate::config::Config;
use crate::fetch::{FetchError, HttpClient};
use crate::uri::{self, ParseError};
use futures_util::future::{BoxFuture, FutureExt, Shared};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

/// Expanded subscription
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Subscription {
    /// Group name: SSR `group` parameter, else the URL host
    pub name: String,
    pub result: Vec<Config>,
}

impl Subscription {
    /// What the UI receives when a subscription cannot be used
    pub fn empty() -> Self {
        Self::default()
    }
}

type InFlight = Shared<BoxFuture<'static, Result<Subscription, SubscriptionError>>>;

/// Fetches subscriptions, deduplicating concurrent requests per URL
#[derive(Clone)]
pub struct SubscriptionFetcher {
    client: Arc<HttpClient>,
    in_flight: Arc<Mutex<HashMap<String, InFlight>>>,
}

impl SubscriptionFetcher {
    pub fn new(client: Arc<HttpClient>) -> Self {
        Self {
            client,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Download and decode `url`
    pub async fn fetch(&self, url: &str) -> Result<Subscription, SubscriptionError> {
        let url = url.trim().to_string();
        let pending = {
            let mut in_flight = self.in_flight.lock().map_err(|_| SubscriptionError::Poisoned)?;
            match in_flight.get(&url) {
                Some(pending) => {
                    debug!("Joining in-flight fetch of {}", url);
                    pending.clone()
                }
                None => {
                    let pending = self.start(url.clone());
                    in_flight.insert(url, pending.clone());
                    pending
                }
            }
        };
        pending.await
    }

    /// Number of downloads currently running
    pub fn in_flight(&self) -> usize {
        self.in_flight.lock().map(|m| m.len()).unwrap_or(0)
    }

    fn start(&self, url: String) -> InFlight {
        let client = self.client.clone();
        let in_flight = self.in_flight.clone();

        async move {
            let result = download(&client, &url).await;
            if let Ok(mut map) = in_flight.lock() {
                map.remove(&url);
            }
            result
        }
        .boxed()
        .shared()
    }
}

async fn download(client: &HttpClient, url: &str) -> Result<Subscription, SubscriptionError> {
    info!("Fetching subscription {}", url);
    let body = client.get_text(url).await?;
    let decoded = uri::parse_subscription_body(&body)?;

    let name = decoded
        .group
        .filter(|g| !g.is_empty())
        .or_else(|| url::Url::parse(url).ok()?.host_str().map(str::to_string))
        .unwrap_or_default();

    info!("Subscription {} -> {} servers ({})", url, decoded.servers.len(), name);
    Ok(Subscription {
        name,
        result: decoded.servers,
    })
}

/// Subscription errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum SubscriptionError {
    #[error("Subscription download failed: {0}")]
    Network(#[from] FetchError),

    #[error("Subscription could not be decoded: {0}")]
    Parse(#[from] ParseError),

    #[error("Subscription registry poisoned")]
    Poisoned,
}
