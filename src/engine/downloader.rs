// Mirror fallback download orchestrator. Streams the winning mirror to the client and the cache in lock-step.

use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use reqwest::Url;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::cache::{CacheStore, WriteHandle};
use super::inflight::{FetchOutcome, LeaderHandle};
use super::stats::StatsCollector;
use crate::path::NormalizedPath;
use crate::source::mirror::MirrorList;
use crate::source::traits::{FetchError, UpstreamClient, UpstreamResponse};

/// Chunks buffered between the orchestrator and a client before the
/// orchestrator waits. Keeps client delivery and cache writes in step.
pub const CLIENT_CHANNEL_DEPTH: usize = 2;

#[derive(Debug, Clone)]
pub struct FetchSettings {
    /// Largest chunk forwarded to the client and the cache file at once.
    pub chunk_size: usize,
    /// Longest wait for the next body chunk from a mirror.
    pub read_timeout: Duration,
    /// Extra attempts on the same mirror after a transient failure.
    pub mirror_retries: u32,
}

/// Response metadata handed to the client once a mirror answers 2xx.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    pub content_length: Option<u64>,
}

/// Orchestrator side of one client's delivery channel.
pub struct ClientSink {
    head: Option<oneshot::Sender<ResponseHead>>,
    body: Option<mpsc::Sender<io::Result<Bytes>>>,
}

/// Request-handler side of one client's delivery channel.
pub struct ClientStream {
    pub head: oneshot::Receiver<ResponseHead>,
    pub body: mpsc::Receiver<io::Result<Bytes>>,
}

pub fn client_channel() -> (ClientSink, ClientStream) {
    let (head_tx, head_rx) = oneshot::channel();
    let (body_tx, body_rx) = mpsc::channel(CLIENT_CHANNEL_DEPTH);
    (
        ClientSink {
            head: Some(head_tx),
            body: Some(body_tx),
        },
        ClientStream {
            head: head_rx,
            body: body_rx,
        },
    )
}

impl ClientSink {
    /// A sink with nobody behind it; the fetch only fills the cache.
    pub fn detached() -> Self {
        Self {
            head: None,
            body: None,
        }
    }

    fn begin(&mut self, content_length: Option<u64>) {
        if let Some(head) = self.head.take() {
            if head.send(ResponseHead { content_length }).is_err() {
                self.body = None;
            }
        }
    }

    async fn deliver(&mut self, chunk: Bytes) {
        if let Some(body) = &self.body {
            if body.send(Ok(chunk)).await.is_err() {
                debug!("client disconnected, download continues for the cache");
                self.body = None;
            }
        }
    }

    /// The current mirror failed. A client that already has its response head
    /// cannot be switched to another mirror's bytes, so its body is cut.
    async fn abort_if_started(&mut self) {
        if self.head.is_none() {
            if let Some(body) = self.body.take() {
                let _ = body
                    .send(Err(io::Error::other("upstream mirror failed mid-stream")))
                    .await;
            }
        }
    }
}

/// One mirror try. Kept for logging and tests, never persisted.
#[derive(Debug)]
pub struct FetchAttempt {
    pub rank: usize,
    pub url: Url,
    pub bytes: u64,
    pub elapsed: Duration,
    pub error: Option<FetchError>,
}

impl FetchAttempt {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug)]
pub struct FetchReport {
    pub outcome: FetchOutcome,
    pub attempts: Vec<FetchAttempt>,
}

pub struct Downloader {
    mirrors: MirrorList,
    client: Arc<dyn UpstreamClient>,
    cache: Arc<CacheStore>,
    stats: Arc<StatsCollector>,
    settings: FetchSettings,
}

impl Downloader {
    pub fn new(
        mirrors: MirrorList,
        client: Arc<dyn UpstreamClient>,
        cache: Arc<CacheStore>,
        stats: Arc<StatsCollector>,
        settings: FetchSettings,
    ) -> Self {
        Self {
            mirrors,
            client,
            cache,
            stats,
            settings,
        }
    }

    /// Run the fetch for `leader` on its own task and publish the outcome.
    ///
    /// The task does not belong to any request, so a client hanging up never
    /// cancels the upstream transfer or the cache write.
    pub fn spawn(self: &Arc<Self>, leader: LeaderHandle, sink: ClientSink) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.stats.increment_downloads();
            let report = this.fetch(leader.path(), sink).await;
            this.stats.decrement_downloads();
            leader.publish(report.outcome);
        })
    }

    /// Try each mirror in rank order until one delivers the artifact.
    pub async fn fetch(&self, path: &NormalizedPath, mut sink: ClientSink) -> FetchReport {
        let mut attempts = Vec::new();

        for mirror in self.mirrors.iter() {
            let url = mirror.artifact_url(path);
            let mut retries_left = self.settings.mirror_retries;

            loop {
                self.stats.record_attempt();
                let started = Instant::now();
                let result = self.try_mirror(path, &url, &mut sink).await;
                let elapsed = started.elapsed();

                match result {
                    Ok((outcome, bytes)) => {
                        info!(
                            "fetched {} from mirror {} ({} bytes in {:?}) -> {}",
                            path,
                            mirror.rank(),
                            bytes,
                            elapsed,
                            outcome.kind()
                        );
                        attempts.push(FetchAttempt {
                            rank: mirror.rank(),
                            url,
                            bytes,
                            elapsed,
                            error: None,
                        });
                        return FetchReport { outcome, attempts };
                    }
                    Err((err, bytes)) => {
                        self.stats.record_failure();
                        if matches!(err, FetchError::BadStatus(404)) {
                            debug!("{} not on mirror {} ({})", path, mirror.rank(), url);
                        } else {
                            warn!(
                                "mirror {} failed for {} after {} bytes [{}]: {}",
                                mirror.rank(),
                                url,
                                bytes,
                                err.kind(),
                                err
                            );
                        }
                        sink.abort_if_started().await;

                        let retry = retries_left > 0 && err.is_transient();
                        attempts.push(FetchAttempt {
                            rank: mirror.rank(),
                            url: url.clone(),
                            bytes,
                            elapsed,
                            error: Some(err),
                        });
                        if !retry {
                            break;
                        }
                        retries_left -= 1;
                    }
                }
            }
        }

        warn!("{} not found on any of {} mirrors", path, self.mirrors.len());
        FetchReport {
            outcome: FetchOutcome::NotFound,
            attempts,
        }
    }

    async fn try_mirror(
        &self,
        path: &NormalizedPath,
        url: &Url,
        sink: &mut ClientSink,
    ) -> Result<(FetchOutcome, u64), (FetchError, u64)> {
        let mut response = self.client.get(url).await.map_err(|e| (e, 0))?;
        let expected = response.content_length;
        sink.begin(expected);

        let mut writer = match self.cache.begin_write(path).await {
            Ok(writer) => Some(writer),
            Err(e) => {
                error!("cannot start cache write for {}: {}", path, e);
                self.stats.record_cache_write_failure();
                None
            }
        };

        // Held until the entry is promoted, so waiters can be served if it never is.
        let mut retained = Vec::new();
        let received = match self
            .stream_body(path, &mut response, expected, &mut writer, &mut retained, sink)
            .await
        {
            Ok(received) => received,
            Err(failure) => {
                if let Some(writer) = writer.take() {
                    self.cache.discard(writer).await;
                }
                return Err(failure);
            }
        };

        let outcome = match writer {
            Some(writer) => match self.cache.promote(writer).await {
                Ok(length) => {
                    self.stats.record_promotion();
                    FetchOutcome::Cached { length }
                }
                Err(e) => {
                    error!("failed to promote {} into the cache: {}", path, e);
                    self.stats.record_cache_write_failure();
                    FetchOutcome::Uncached(concat(retained, received))
                }
            },
            None => FetchOutcome::Uncached(concat(retained, received)),
        };
        Ok((outcome, received))
    }

    /// Copy the body to the cache file and the client, one chunk at a time:
    /// each chunk is written before it is forwarded.
    async fn stream_body(
        &self,
        path: &NormalizedPath,
        response: &mut UpstreamResponse,
        expected: Option<u64>,
        writer: &mut Option<WriteHandle>,
        retained: &mut Vec<Bytes>,
        sink: &mut ClientSink,
    ) -> Result<u64, (FetchError, u64)> {
        let mut received = 0u64;

        loop {
            let next = tokio::time::timeout(self.settings.read_timeout, response.body.next())
                .await
                .map_err(|_| (FetchError::Timeout, received))?;
            let mut data = match next {
                Some(Ok(data)) => data,
                Some(Err(e)) => return Err((e, received)),
                None => break,
            };
            self.stats.record_downloaded(data.len() as u64);

            while !data.is_empty() {
                let chunk = data.split_to(data.len().min(self.settings.chunk_size));
                received += chunk.len() as u64;

                let write_error = match writer.as_mut() {
                    Some(w) => w.write_chunk(&chunk).await.err(),
                    None => None,
                };
                if let Some(e) = write_error {
                    error!("cache write failed for {}, serving without caching: {}", path, e);
                    self.stats.record_cache_write_failure();
                    if let Some(w) = writer.take() {
                        self.cache.discard(w).await;
                    }
                }

                retained.push(chunk.clone());
                sink.deliver(chunk).await;
            }
        }

        match expected {
            Some(expected) if received < expected => {
                Err((FetchError::Truncated { received, expected }, received))
            }
            _ => Ok(received),
        }
    }
}

fn concat(chunks: Vec<Bytes>, length: u64) -> Bytes {
    let mut body = BytesMut::with_capacity(length as usize);
    for chunk in chunks {
        body.extend_from_slice(&chunk);
    }
    body.freeze()
}
