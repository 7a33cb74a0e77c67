use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use reqwest::Url;
use thiserror::Error;
use tokio::sync::OwnedSemaphorePermit;

/// Why a single mirror attempt failed. Never shown to clients.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("mirror unreachable: {0}")]
    Unreachable(String),
    #[error("mirror timed out")]
    Timeout,
    #[error("no upstream connection available within {0:?}")]
    PoolExhausted(Duration),
    #[error("mirror answered HTTP {0}")]
    BadStatus(u16),
    #[error("stream truncated after {received} of {expected} bytes")]
    Truncated { received: u64, expected: u64 },
}

impl FetchError {
    /// Short label used in logs and stats.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Unreachable(_) => "unreachable",
            Self::Timeout => "timeout",
            Self::PoolExhausted(_) => "pool_exhausted",
            Self::BadStatus(_) => "bad_status",
            Self::Truncated { .. } => "truncated",
        }
    }

    /// Whether repeating the same request on the same mirror could help.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::BadStatus(status) => *status >= 500,
            _ => true,
        }
    }
}

pub type BodyStream = BoxStream<'static, Result<Bytes, FetchError>>;

/// A successful (2xx) upstream response whose body has not been read yet.
pub struct UpstreamResponse {
    /// Declared `Content-Length`, if the mirror sent one.
    pub content_length: Option<u64>,
    pub body: BodyStream,
    permit: Option<OwnedSemaphorePermit>,
}

impl UpstreamResponse {
    pub fn new(content_length: Option<u64>, body: BodyStream) -> Self {
        Self {
            content_length,
            body,
            permit: None,
        }
    }

    /// Keep an outbound connection slot occupied until this response is dropped.
    pub fn holding(mut self, permit: OwnedSemaphorePermit) -> Self {
        self.permit = Some(permit);
        self
    }
}

#[async_trait]
pub trait UpstreamClient: Send + Sync {
    /// Issue a GET for `url`. Anything other than a 2xx is an error.
    async fn get(&self, url: &Url) -> Result<UpstreamResponse, FetchError>;
}
