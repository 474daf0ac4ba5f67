//! Source fetching and the periodic blocklist refresh task.

use super::BlocklistManager;
use crate::error::{GjallarError, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Fetches blocklist source content. Implemented over HTTP in production
/// and stubbed in tests.
#[async_trait]
pub trait BlocklistFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<String>;
}

/// HTTP fetcher; plain paths (no scheme) are read from disk so local list
/// files work without a server.
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .user_agent(concat!("gjallar/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self { client }
    }
}

impl Default for HttpFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BlocklistFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<String> {
        if url.starts_with("http://") || url.starts_with("https://") {
            let response = self
                .client
                .get(url)
                .send()
                .await
                .map_err(|e| GjallarError::BlocklistFetch(e.to_string()))?;
            if !response.status().is_success() {
                return Err(GjallarError::BlocklistFetch(format!(
                    "{}: HTTP {}",
                    url,
                    response.status()
                )));
            }
            response
                .text()
                .await
                .map_err(|e| GjallarError::BlocklistFetch(e.to_string()))
        } else {
            tokio::fs::read_to_string(url)
                .await
                .map_err(|e| GjallarError::BlocklistFetch(format!("{}: {}", url, e)))
        }
    }
}

/// Re-fetch sources on a fixed cadence. A failed reload keeps the running
/// snapshot.
pub async fn run_refresh(manager: Arc<BlocklistManager>, interval: Duration) {
    if interval.is_zero() {
        return;
    }
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick fires immediately; the initial load already happened.
    ticker.tick().await;

    loop {
        ticker.tick().await;
        debug!("refreshing blocklist sources");
        if let Err(e) = manager.reload().await {
            warn!("blocklist refresh failed, keeping current snapshot: {}", e);
        }
    }
}
