use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::{redirect, Client, Url};
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use super::traits::{FetchError, UpstreamClient, UpstreamResponse};
use crate::config::USER_AGENT;

impl From<reqwest::Error> for FetchError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            FetchError::Timeout
        } else {
            FetchError::Unreachable(e.to_string())
        }
    }
}

#[derive(Debug, Clone)]
pub struct PoolSettings {
    /// Maximum concurrent upstream streams.
    pub max_connections: usize,
    pub connect_timeout: Duration,
    /// Bound on waiting for response headers.
    pub response_timeout: Duration,
    /// Bound on waiting for a free slot when the pool is saturated.
    pub acquire_timeout: Duration,
}

/// Shared outbound HTTP client with a bounded number of concurrent streams.
///
/// Cloning is cheap; all clones share the same connection pool and slots.
#[derive(Clone)]
pub struct HttpClientPool {
    client: Client,
    slots: Arc<Semaphore>,
    settings: PoolSettings,
}

impl HttpClientPool {
    pub fn new(settings: PoolSettings) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(settings.connect_timeout)
            .pool_max_idle_per_host(settings.max_connections)
            .redirect(redirect::Policy::limited(10))
            .build()
            .context("failed to build upstream http client")?;
        Ok(Self {
            client,
            slots: Arc::new(Semaphore::new(settings.max_connections)),
            settings,
        })
    }

    /// Number of slots not currently held by an upstream stream.
    pub fn available(&self) -> usize {
        self.slots.available_permits()
    }
}

#[async_trait]
impl UpstreamClient for HttpClientPool {
    async fn get(&self, url: &Url) -> Result<UpstreamResponse, FetchError> {
        let acquire = Arc::clone(&self.slots).acquire_owned();
        let permit = match tokio::time::timeout(self.settings.acquire_timeout, acquire).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(FetchError::Unreachable("connection pool closed".into())),
            Err(_) => {
                warn!("no upstream slot free within {:?} for {}", self.settings.acquire_timeout, url);
                return Err(FetchError::PoolExhausted(self.settings.acquire_timeout));
            }
        };

        let send = self.client.get(url.clone()).send();
        let resp = tokio::time::timeout(self.settings.response_timeout, send)
            .await
            .map_err(|_| FetchError::Timeout)??;

        let status = resp.status();
        debug!("upstream GET {} status={}", url, status.as_u16());
        if !status.is_success() {
            return Err(FetchError::BadStatus(status.as_u16()));
        }

        let content_length = resp.content_length();
        let body = resp
            .bytes_stream()
            .map(|chunk| chunk.map_err(FetchError::from))
            .boxed();
        Ok(UpstreamResponse::new(content_length, body).holding(permit))
    }
}
