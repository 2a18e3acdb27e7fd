//! Remote fetch capability and its HTTP implementation.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::{Result, UpdateError};

/// Asynchronous byte fetcher the orchestrator downloads through.
///
/// Kept narrow so tests can substitute an in-memory source.
#[async_trait]
pub trait RemoteSource: Send + Sync {
    /// Fetch the full body at `url`.
    async fn fetch(&self, url: &str) -> Result<Vec<u8>>;
}

/// [`RemoteSource`] backed by a shared [`reqwest::Client`] with a
/// per-request timeout. A timed-out fetch surfaces as a plain network
/// error, which the orchestrator treats exactly like a failed transfer.
#[derive(Debug, Clone)]
pub struct HttpSource {
    client: reqwest::Client,
}

impl HttpSource {
    /// Build a source whose requests time out after `timeout`.
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("hotpatch/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl RemoteSource for HttpSource {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|err| UpdateError::Network {
                url: url.to_string(),
                reason: err.to_string(),
            })?;

        if !response.status().is_success() {
            return Err(UpdateError::Network {
                url: url.to_string(),
                reason: format!("server returned {}", response.status()),
            });
        }

        let bytes = response.bytes().await.map_err(|err| UpdateError::Network {
            url: url.to_string(),
            reason: err.to_string(),
        })?;
        Ok(bytes.to_vec())
    }
}
