// End-to-end tests: a real proxy server in front of fake axum mirrors.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use bytes::Bytes;
use futures_util::{stream, StreamExt};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use maven_cache_proxy::config::ProxySettings;
use maven_cache_proxy::engine::cache::Lookup;
use maven_cache_proxy::path::NormalizedPath;
use maven_cache_proxy::server::handler::{ProxyServer, ProxyState};

const JAR: &str = "org/example/lib/1.0/lib-1.0.jar";

#[derive(Clone)]
enum Artifact {
    Bytes(&'static [u8]),
    /// Answer after a delay.
    Slow(Duration, &'static [u8]),
    /// `chunks` chunks of `size` bytes, one every `delay`.
    Trickle {
        chunks: usize,
        size: usize,
        delay: Duration,
    },
    Status(StatusCode),
}

#[derive(Clone)]
struct MirrorState {
    artifacts: Arc<HashMap<String, Artifact>>,
    hits: Arc<AtomicUsize>,
}

struct FakeMirror {
    addr: SocketAddr,
    hits: Arc<AtomicUsize>,
}

impl FakeMirror {
    fn base(&self) -> String {
        format!("http://{}/maven2/", self.addr)
    }

    fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

fn trickle_byte(i: usize) -> u8 {
    (i % 251) as u8
}

async fn mirror_handler(State(state): State<MirrorState>, Path(path): Path<String>) -> Response {
    state.hits.fetch_add(1, Ordering::SeqCst);
    match state.artifacts.get(&path).cloned() {
        None => StatusCode::NOT_FOUND.into_response(),
        Some(Artifact::Status(status)) => status.into_response(),
        Some(Artifact::Bytes(data)) => data.into_response(),
        Some(Artifact::Slow(delay, data)) => {
            tokio::time::sleep(delay).await;
            data.into_response()
        }
        Some(Artifact::Trickle {
            chunks,
            size,
            delay,
        }) => {
            let body = stream::iter(0..chunks).then(move |i| async move {
                tokio::time::sleep(delay).await;
                Ok::<_, std::io::Error>(Bytes::from(vec![trickle_byte(i); size]))
            });
            (
                [(header::CONTENT_LENGTH, (chunks * size).to_string())],
                Body::from_stream(body),
            )
                .into_response()
        }
    }
}

async fn start_mirror(artifacts: Vec<(&str, Artifact)>) -> FakeMirror {
    let hits = Arc::new(AtomicUsize::new(0));
    let state = MirrorState {
        artifacts: Arc::new(
            artifacts
                .into_iter()
                .map(|(path, artifact)| (path.to_string(), artifact))
                .collect(),
        ),
        hits: hits.clone(),
    };
    let app = Router::new()
        .route("/maven2/{*path}", get(mirror_handler))
        .with_state(state);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });
    FakeMirror { addr, hits }
}

async fn start_proxy(mirrors: &[&FakeMirror]) -> (ProxyServer, TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let settings = ProxySettings {
        mirrors: mirrors.iter().map(|m| m.base()).collect(),
        cache_dir: Some(dir.path().join("cache")),
        read_timeout_secs: 5,
        ..ProxySettings::default()
    };
    let config = settings.resolve().unwrap();
    let state = ProxyState::from_config(&config).unwrap();
    let server = ProxyServer::start(state).await.unwrap();
    (server, dir)
}

/// Send a request line verbatim; HTTP clients strip dot segments before sending.
async fn raw_request(addr: SocketAddr, request_line: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let request = format!("{request_line} HTTP/1.1\r\nHost: {addr}\r\nConnection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut response = Vec::new();
    stream.read_to_end(&mut response).await.unwrap();
    String::from_utf8_lossy(&response).into_owned()
}

#[tokio::test]
async fn test_falls_back_to_next_mirror_and_caches() {
    let a = start_mirror(vec![]).await;
    let b = start_mirror(vec![(JAR, Artifact::Bytes(b"JARDATA"))]).await;
    let (server, dir) = start_proxy(&[&a, &b]).await;
    let client = reqwest::Client::new();

    let resp = client.get(server.url_for(JAR)).send().await.unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(
        resp.headers().get(header::CONTENT_TYPE).unwrap(),
        "application/java-archive"
    );
    assert_eq!(resp.bytes().await.unwrap(), "JARDATA");
    assert_eq!((a.hits(), b.hits()), (1, 1));

    let on_disk = std::fs::read(dir.path().join("cache").join(JAR)).unwrap();
    assert_eq!(on_disk, b"JARDATA");

    // Served from the cache: no new outbound requests.
    let resp = client.get(server.url_for(JAR)).send().await.unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.headers().get(header::CONTENT_LENGTH).unwrap(), "7");
    assert_eq!(resp.bytes().await.unwrap(), "JARDATA");
    assert_eq!((a.hits(), b.hits()), (1, 1));

    let stats = server.state().stats().snapshot();
    assert_eq!(stats.cache_hits, 1);
    assert_eq!(stats.promotions, 1);

    server.shutdown();
}

#[tokio::test]
async fn test_server_error_falls_through() {
    let a = start_mirror(vec![(JAR, Artifact::Status(StatusCode::SERVICE_UNAVAILABLE))]).await;
    let b = start_mirror(vec![(JAR, Artifact::Bytes(b"FROM-B"))]).await;
    let (server, _dir) = start_proxy(&[&a, &b]).await;

    let resp = reqwest::get(server.url_for(JAR)).await.unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.bytes().await.unwrap(), "FROM-B");
    assert_eq!((a.hits(), b.hits()), (1, 1));

    server.shutdown();
}

#[tokio::test]
async fn test_concurrent_requests_share_one_fetch() {
    let a = start_mirror(vec![(
        JAR,
        Artifact::Slow(Duration::from_millis(300), b"SLOWJAR"),
    )])
    .await;
    let (server, _dir) = start_proxy(&[&a]).await;
    let client = reqwest::Client::new();

    let get = |client: reqwest::Client, url: String| async move {
        let resp = client.get(url).send().await.unwrap();
        (resp.status(), resp.bytes().await.unwrap())
    };
    let (first, second) = tokio::join!(
        get(client.clone(), server.url_for(JAR)),
        get(client.clone(), server.url_for(JAR)),
    );

    assert_eq!(first.0, 200);
    assert_eq!(second.0, 200);
    assert_eq!(first.1, "SLOWJAR");
    assert_eq!(second.1, "SLOWJAR");
    assert_eq!(a.hits(), 1);
    assert_eq!(server.state().registry().in_flight(), 0);

    server.shutdown();
}

#[tokio::test]
async fn test_missing_everywhere_is_not_cached() {
    let a = start_mirror(vec![]).await;
    let b = start_mirror(vec![]).await;
    let (server, dir) = start_proxy(&[&a, &b]).await;
    let url = server.url_for("org/example/nothing/1.0/nothing-1.0.pom");

    let resp = reqwest::get(&url).await.unwrap();
    assert_eq!(resp.status(), 404);
    assert_eq!((a.hits(), b.hits()), (1, 1));
    assert_eq!(server.state().registry().in_flight(), 0);
    assert!(!dir.path().join("cache/org/example/nothing").exists());

    // Negative results are not remembered.
    let resp = reqwest::get(&url).await.unwrap();
    assert_eq!(resp.status(), 404);
    assert_eq!((a.hits(), b.hits()), (2, 2));

    server.shutdown();
}

#[tokio::test]
async fn test_noise_paths_never_reach_mirrors() {
    let a = start_mirror(vec![]).await;
    let (server, _dir) = start_proxy(&[&a]).await;

    for path in ["favicon.ico", ".index/nexus-maven-repository-index.gz", "index.html"] {
        let resp = reqwest::get(server.url_for(path)).await.unwrap();
        assert_eq!(resp.status(), 404, "{path}");
    }
    assert_eq!(a.hits(), 0);

    server.shutdown();
}

#[tokio::test]
async fn test_only_get_and_head_are_allowed() {
    let a = start_mirror(vec![(JAR, Artifact::Bytes(b"JARDATA"))]).await;
    let (server, _dir) = start_proxy(&[&a]).await;

    let resp = reqwest::Client::new()
        .post(server.url_for(JAR))
        .body("upload")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 405);
    assert_eq!(resp.headers().get(header::ALLOW).unwrap(), "GET, HEAD");
    assert_eq!(a.hits(), 0);

    server.shutdown();
}

#[tokio::test]
async fn test_head_fills_cache_for_later_get() {
    let a = start_mirror(vec![(JAR, Artifact::Bytes(b"JARDATA"))]).await;
    let (server, _dir) = start_proxy(&[&a]).await;
    let client = reqwest::Client::new();

    let resp = client.head(server.url_for(JAR)).send().await.unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(
        resp.headers().get(header::CONTENT_TYPE).unwrap(),
        "application/java-archive"
    );

    let resp = client.get(server.url_for(JAR)).send().await.unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.bytes().await.unwrap(), "JARDATA");
    assert_eq!(a.hits(), 1);

    let resp = client
        .head(server.url_for("org/example/lib/2.0/lib-2.0.jar"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);

    server.shutdown();
}

#[tokio::test]
async fn test_client_disconnect_still_caches() {
    let (chunks, size) = (20, 1000);
    let a = start_mirror(vec![(
        JAR,
        Artifact::Trickle {
            chunks,
            size,
            delay: Duration::from_millis(50),
        },
    )])
    .await;
    let (server, _dir) = start_proxy(&[&a]).await;
    let client = reqwest::Client::new();

    let mut resp = client.get(server.url_for(JAR)).send().await.unwrap();
    assert_eq!(resp.status(), 200);
    let first = resp.chunk().await.unwrap().unwrap();
    assert!(!first.is_empty());
    drop(resp);

    let path = NormalizedPath::parse(JAR).unwrap();
    let mut cached = false;
    for _ in 0..100 {
        if let Lookup::Hit(artifact) = server.state().cache().lookup(&path).await.unwrap() {
            assert_eq!(artifact.length, (chunks * size) as u64);
            cached = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(cached, "artifact was not cached after the client hung up");

    let body = client
        .get(server.url_for(JAR))
        .send()
        .await
        .unwrap()
        .bytes()
        .await
        .unwrap();
    let expected: Vec<u8> = (0..chunks)
        .flat_map(|i| std::iter::repeat(trickle_byte(i)).take(size))
        .collect();
    assert_eq!(&body[..], &expected[..]);
    assert_eq!(a.hits(), 1);

    server.shutdown();
}

#[tokio::test]
async fn test_equivalent_spellings_share_an_entry() {
    let a = start_mirror(vec![(JAR, Artifact::Bytes(b"JARDATA"))]).await;
    let (server, _dir) = start_proxy(&[&a]).await;

    let resp = reqwest::get(server.url_for(JAR)).await.unwrap();
    assert_eq!(resp.bytes().await.unwrap(), "JARDATA");

    let resp = reqwest::get(server.url_for("org//example/lib/1.0/lib-1.0.jar"))
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.bytes().await.unwrap(), "JARDATA");
    assert_eq!(a.hits(), 1);

    server.shutdown();
}

#[tokio::test]
async fn test_noise_paths_spelled_with_dot_segments_are_rejected() {
    let a = start_mirror(vec![
        ("favicon.ico", Artifact::Bytes(b"ICON")),
        ("index.html", Artifact::Bytes(b"<html>")),
    ])
    .await;
    let (server, dir) = start_proxy(&[&a]).await;

    for target in ["/./favicon.ico", "/x/../favicon.ico", "/./index.html", "/g/../index.html"] {
        let response = raw_request(server.addr(), &format!("GET {target}")).await;
        assert!(response.starts_with("HTTP/1.1 404"), "{target}: {response}");
    }
    assert_eq!(a.hits(), 0);
    assert!(!dir.path().join("cache/favicon.ico").exists());
    assert!(!dir.path().join("cache/index.html").exists());

    server.shutdown();
}

#[tokio::test]
async fn test_root_path_follows_method_rules() {
    let a = start_mirror(vec![]).await;
    let (server, _dir) = start_proxy(&[&a]).await;
    let client = reqwest::Client::new();

    let resp = client.get(server.url_for("")).send().await.unwrap();
    assert_eq!(resp.status(), 404);

    let resp = client.delete(server.url_for("")).send().await.unwrap();
    assert_eq!(resp.status(), 405);
    assert_eq!(resp.headers().get(header::ALLOW).unwrap(), "GET, HEAD");
    assert_eq!(a.hits(), 0);

    server.shutdown();
}

#[tokio::test]
async fn test_unwritable_cache_serves_every_joined_request() {
    let a = start_mirror(vec![(
        JAR,
        Artifact::Slow(Duration::from_millis(300), b"JARDATA"),
    )])
    .await;
    let (server, dir) = start_proxy(&[&a]).await;
    // A regular file where the artifact's directory tree has to go.
    std::fs::write(dir.path().join("cache/org"), b"not a directory").unwrap();
    let client = reqwest::Client::new();

    let get = |client: reqwest::Client, url: String| async move {
        let resp = client.get(url).send().await.unwrap();
        (resp.status(), resp.bytes().await.unwrap())
    };
    let (first, second) = tokio::join!(
        get(client.clone(), server.url_for(JAR)),
        get(client.clone(), server.url_for(JAR)),
    );

    assert_eq!(first.0, 200);
    assert_eq!(second.0, 200);
    assert_eq!(first.1, "JARDATA");
    assert_eq!(second.1, "JARDATA");
    assert_eq!(a.hits(), 1);
    assert!(server.state().stats().snapshot().cache_write_failures >= 1);

    // Nothing was cached, so the next request goes upstream again.
    let (status, body) = get(client.clone(), server.url_for(JAR)).await;
    assert_eq!(status, 200);
    assert_eq!(body, "JARDATA");
    assert_eq!(a.hits(), 2);

    server.shutdown();
}
