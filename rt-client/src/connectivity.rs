//! Network reachability probe.
//!
//! Before moving to a fallback host the manager checks that the network
//! itself is up; if it is not, trying other hosts is pointless.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::ClientError;

/// Answers whether the network is reachable.
#[async_trait]
pub trait ConnectivityCheck: Send + Sync {
    /// Whether the network is reachable.
    async fn is_online(&self) -> bool;
}

/// Probe fetching a URL that answers `yes`.
#[derive(Debug, Clone)]
pub struct HttpConnectivityCheck {
    client: reqwest::Client,
    url: String,
}

impl HttpConnectivityCheck {
    /// Create a probe for `url`, giving up after `timeout`.
    pub fn new(url: &str, timeout: Duration) -> Result<Self, ClientError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.to_string(),
        })
    }
}

#[async_trait]
impl ConnectivityCheck for HttpConnectivityCheck {
    async fn is_online(&self) -> bool {
        let response = match self.client.get(&self.url).send().await {
            Ok(response) if response.status().is_success() => response,
            Ok(response) => {
                tracing::debug!(status = %response.status(), "connectivity check failed");
                return false;
            }
            Err(e) => {
                tracing::debug!(error = %e, "connectivity check failed");
                return false;
            }
        };

        match response.text().await {
            Ok(body) => body.trim() == "yes",
            Err(e) => {
                tracing::debug!(error = %e, "connectivity check body unreadable");
                false
            }
        }
    }
}

/// Probe with a fixed answer.
#[derive(Debug, Clone, Copy)]
pub struct AssumeOnline(pub bool);

impl Default for AssumeOnline {
    fn default() -> Self {
        Self(true)
    }
}

#[async_trait]
impl ConnectivityCheck for AssumeOnline {
    async fn is_online(&self) -> bool {
        self.0
    }
}
