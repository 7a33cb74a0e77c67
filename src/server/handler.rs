// Axum request handler. Turns client requests into cache lookups and coalesced mirror fetches.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, HeaderMap, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::any,
    Router,
};
use tokio::net::TcpListener;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::io::ReaderStream;
use tracing::{debug, error, info};

use super::routes::{self, Dispatch, RouteAction};
use crate::config::ProxyConfig;
use crate::engine::cache::{CacheStore, CachedArtifact, Lookup};
use crate::engine::downloader::{client_channel, Downloader, FetchSettings, ResponseHead};
use crate::engine::inflight::{FetchOutcome, InFlightRegistry, Join, LeaderHandle};
use crate::engine::stats::StatsCollector;
use crate::path::NormalizedPath;
use crate::source::http_source::HttpClientPool;
use crate::source::mirror::MirrorList;
use crate::source::traits::UpstreamClient;

/// Everything a request needs, built once at startup.
pub struct ProxyState {
    cache: Arc<CacheStore>,
    registry: InFlightRegistry,
    downloader: Arc<Downloader>,
    stats: Arc<StatsCollector>,
}

pub type SharedState = Arc<ProxyState>;

impl ProxyState {
    /// Build the state with the shared outbound HTTP pool.
    pub fn from_config(config: &ProxyConfig) -> Result<SharedState> {
        let pool = HttpClientPool::new(config.pool_settings())?;
        Self::with_client(config, Arc::new(pool))
    }

    /// Build the state around any upstream client.
    pub fn with_client(config: &ProxyConfig, client: Arc<dyn UpstreamClient>) -> Result<SharedState> {
        let cache = Arc::new(
            CacheStore::open(&config.cache_dir)
                .with_context(|| format!("failed to open cache at {}", config.cache_dir.display()))?,
        );
        Ok(Arc::new(Self::new(
            config.mirrors.clone(),
            client,
            cache,
            config.fetch_settings(),
        )))
    }

    fn new(
        mirrors: MirrorList,
        client: Arc<dyn UpstreamClient>,
        cache: Arc<CacheStore>,
        settings: FetchSettings,
    ) -> Self {
        let stats = Arc::new(StatsCollector::new());
        let downloader = Arc::new(Downloader::new(
            mirrors,
            client,
            cache.clone(),
            stats.clone(),
            settings,
        ));
        Self {
            cache,
            registry: InFlightRegistry::new(),
            downloader,
            stats,
        }
    }

    pub fn cache(&self) -> &CacheStore {
        &self.cache
    }

    pub fn stats(&self) -> &StatsCollector {
        &self.stats
    }

    pub fn registry(&self) -> &InFlightRegistry {
        &self.registry
    }
}

pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/", any(root_handler))
        .route("/{*path}", any(proxy_handler))
        .fallback(|| async { StatusCode::NOT_FOUND })
        .with_state(state)
}

/// Serve until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, state: SharedState, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .context("http server error")
}

/// In-process server handle, used by tests and embedders.
pub struct ProxyServer {
    addr: SocketAddr,
    state: SharedState,
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
}

impl ProxyServer {
    /// Start serving `state` on a random local port.
    pub async fn start(state: SharedState) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
        let serve_state = state.clone();
        tokio::spawn(async move {
            let shutdown = async move {
                let _ = shutdown_rx.await;
            };
            if let Err(e) = serve(listener, serve_state, shutdown).await {
                error!("proxy server stopped: {:#}", e);
            }
        });

        info!("proxy listening on {}", addr);
        Ok(Self {
            addr,
            state,
            shutdown_tx: Some(shutdown_tx),
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Build a URL for an artifact path on this proxy.
    pub fn url_for(&self, path: &str) -> String {
        format!("http://{}/{}", self.addr, path.trim_start_matches('/'))
    }

    pub fn state(&self) -> &SharedState {
        &self.state
    }

    /// Shutdown the server gracefully.
    pub fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

async fn root_handler(State(state): State<SharedState>, method: Method) -> Response {
    handle(&state, method, "").await
}

async fn proxy_handler(
    State(state): State<SharedState>,
    method: Method,
    Path(raw): Path<String>,
) -> Response {
    handle(&state, method, &raw).await
}

async fn handle(state: &ProxyState, method: Method, raw: &str) -> Response {
    match routes::dispatch(&method, raw) {
        Dispatch::Matched(route) => match route.action {
            RouteAction::NotFound => {
                debug!("{} /{} rejected by route {}", method, raw, route.name);
                StatusCode::NOT_FOUND.into_response()
            }
            RouteAction::Artifact => serve_artifact(state, &method, raw).await,
        },
        Dispatch::MethodNotAllowed => (
            StatusCode::METHOD_NOT_ALLOWED,
            [(header::ALLOW, "GET, HEAD")],
        )
            .into_response(),
        Dispatch::Unrouted => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn serve_artifact(state: &ProxyState, method: &Method, raw: &str) -> Response {
    let path = match NormalizedPath::parse(raw) {
        Ok(path) => path,
        Err(e) => {
            debug!("rejecting /{}: {}", raw, e);
            return StatusCode::NOT_FOUND.into_response();
        }
    };
    if routes::is_reserved(&path.to_string()) {
        debug!("/{} normalizes to reserved path {}", raw, path);
        return StatusCode::NOT_FOUND.into_response();
    }

    match state.cache.lookup(&path).await {
        Ok(Lookup::Hit(artifact)) => {
            state.stats.record_hit();
            debug!("cache hit {} ({} bytes)", path, artifact.length);
            return hit_response(&path, artifact, method);
        }
        Ok(Lookup::Miss) => {}
        Err(e) => {
            error!("cache lookup failed for {}: {}", path, e);
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    }

    state.stats.record_miss();
    match state.registry.join(&path) {
        Join::Follower(outcome) => {
            state.stats.record_coalesced();
            debug!("waiting on in-flight fetch of {}", path);
            let outcome = outcome.await;
            outcome_response(state, &path, outcome, method).await
        }
        Join::Leader(leader) => lead_fetch(state, path, leader, method).await,
    }
}

async fn lead_fetch(
    state: &ProxyState,
    path: NormalizedPath,
    leader: LeaderHandle,
    method: &Method,
) -> Response {
    // A fetch that finished between our lookup and join has already promoted.
    match state.cache.lookup(&path).await {
        Ok(Lookup::Hit(artifact)) => {
            leader.publish(FetchOutcome::Cached {
                length: artifact.length,
            });
            return hit_response(&path, artifact, method);
        }
        Ok(Lookup::Miss) => {}
        Err(e) => {
            error!("cache lookup failed for {}: {}", path, e);
            leader.publish(FetchOutcome::Aborted);
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    }

    let outcome = leader.outcome();
    let (sink, stream) = client_channel();
    state.downloader.spawn(leader, sink);

    match stream.head.await {
        Ok(head) => streaming_response(&path, head, stream.body, method),
        // No mirror produced a response for this client; report the result.
        Err(_) => {
            let outcome = outcome.await;
            outcome_response(state, &path, outcome, method).await
        }
    }
}

async fn outcome_response(
    state: &ProxyState,
    path: &NormalizedPath,
    outcome: FetchOutcome,
    method: &Method,
) -> Response {
    match outcome {
        FetchOutcome::Cached { .. } => match state.cache.lookup(path).await {
            Ok(Lookup::Hit(artifact)) => hit_response(path, artifact, method),
            Ok(Lookup::Miss) => {
                error!("{} reported cached but is missing", path);
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            }
            Err(e) => {
                error!("cache lookup failed for {}: {}", path, e);
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            }
        },
        FetchOutcome::NotFound => StatusCode::NOT_FOUND.into_response(),
        FetchOutcome::Uncached(body) => {
            let headers = artifact_headers(path, Some(body.len() as u64));
            if method == Method::HEAD {
                return (StatusCode::OK, headers).into_response();
            }
            (StatusCode::OK, headers, Body::from(body)).into_response()
        }
        FetchOutcome::Aborted => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

fn hit_response(path: &NormalizedPath, artifact: CachedArtifact, method: &Method) -> Response {
    let headers = artifact_headers(path, Some(artifact.length));
    if method == Method::HEAD {
        return (StatusCode::OK, headers).into_response();
    }
    let body = Body::from_stream(ReaderStream::new(artifact.file));
    (StatusCode::OK, headers, body).into_response()
}

fn streaming_response(
    path: &NormalizedPath,
    head: ResponseHead,
    body: tokio::sync::mpsc::Receiver<std::io::Result<bytes::Bytes>>,
    method: &Method,
) -> Response {
    let headers = artifact_headers(path, head.content_length);
    if method == Method::HEAD {
        // Dropping the receiver detaches this client; the fetch carries on.
        return (StatusCode::OK, headers).into_response();
    }
    let body = Body::from_stream(ReceiverStream::new(body));
    (StatusCode::OK, headers, body).into_response()
}

fn artifact_headers(path: &NormalizedPath, length: Option<u64>) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(content_type_for(path)),
    );
    if let Some(length) = length {
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(length));
    }
    headers
}

/// Content type by artifact extension.
fn content_type_for(path: &NormalizedPath) -> &'static str {
    match path.extension() {
        Some("jar") | Some("war") | Some("ear") | Some("aar") => "application/java-archive",
        Some("pom") | Some("xml") => "application/xml",
        Some("sha1") | Some("sha256") | Some("sha512") | Some("md5") | Some("asc") | Some("txt") => {
            "text/plain"
        }
        Some("json") | Some("module") => "application/json",
        Some("zip") => "application/zip",
        Some("gz") | Some("tgz") => "application/gzip",
        _ => "application/octet-stream",
    }
}
