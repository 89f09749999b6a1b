//! Short-lived TURN credentials

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::peer::PeerError;

/// Never refresh more often than this, whatever the TTL says
const MIN_REFRESH_DELAY: Duration = Duration::from_secs(10);

/// Credentials returned by a TURN REST endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnCredentials {
    pub username: String,
    pub password: String,
    /// Lifetime in seconds
    pub ttl: u64,
}

/// Source of TURN credentials
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn fetch(&self) -> Result<TurnCredentials, PeerError>;
}

/// Fetches credentials with an HTTPS GET
pub struct RestCredentialProvider {
    client: Client,
    url: String,
}

impl RestCredentialProvider {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            url: url.into(),
        }
    }
}

#[async_trait]
impl CredentialProvider for RestCredentialProvider {
    async fn fetch(&self) -> Result<TurnCredentials, PeerError> {
        debug!("Fetching TURN credentials from {}", self.url);
        let credentials = self
            .client
            .get(&self.url)
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|e| PeerError::Credentials(e.to_string()))?
            .json::<TurnCredentials>()
            .await
            .map_err(|e| PeerError::Credentials(e.to_string()))?;
        Ok(credentials)
    }
}

/// Delay until credentials with `ttl` seconds of life should be replaced
pub fn refresh_delay(ttl: u64, margin: Duration) -> Duration {
    Duration::from_secs(ttl)
        .saturating_sub(margin)
        .max(MIN_REFRESH_DELAY)
}
