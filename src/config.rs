use std::env;
use std::fs;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::engine::downloader::FetchSettings;
use crate::source::http_source::PoolSettings;
use crate::source::mirror::{InvalidMirror, MirrorList};

/// User agent sent to every mirror.
pub const USER_AGENT: &str = concat!("maven-cache-proxy/", env!("CARGO_PKG_VERSION"));

/// Mirrors used when none are configured, in priority order.
pub const DEFAULT_MIRRORS: &[&str] = &[
    "https://repo.maven.apache.org/maven2/",
    "http://bits.netbeans.org/maven2/",
    "http://bits.netbeans.org/nexus/content/repositories/snapshots/",
    "https://timboudreau.com/builds/plugin/repository/everything/",
    "https://maven.java.net/content/groups/public/",
    "https://oss.sonatype.org/",
];

pub const DEFAULT_PORT: u16 = 5956;

/// Concurrent upstream streams.
pub const DEFAULT_DOWNLOAD_THREADS: usize = 24;

/// Bytes per chunk forwarded to clients and the cache (one Ethernet payload).
pub const DEFAULT_DOWNLOAD_CHUNK_SIZE: usize = 1480;

/// Inbound request worker threads.
pub const DEFAULT_WORKER_THREADS: usize = 4;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    InvalidMirror(#[from] InvalidMirror),
    #[error("no mirrors configured")]
    NoMirrors,
    #[error("cache path {} exists and is not a directory", .0.display())]
    NotADirectory(PathBuf),
    #[error("could not create cache directory {}: {source}", path.display())]
    CreateCacheDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("failed to read config file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse config file {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

/// Raw settings as read from a YAML file and the command line.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProxySettings {
    /// Upstream repository bases, highest priority first.
    pub mirrors: Vec<String>,
    /// Cache root; `<tmp>/maven` when unset.
    pub cache_dir: Option<PathBuf>,
    pub download_threads: usize,
    pub download_chunk_size: usize,
    pub bind: IpAddr,
    pub port: u16,
    pub worker_threads: usize,
    pub connect_timeout_secs: u64,
    pub read_timeout_secs: u64,
    pub pool_acquire_timeout_secs: u64,
    /// Extra attempts on the same mirror after a transient failure.
    pub mirror_retries: u32,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            mirrors: DEFAULT_MIRRORS.iter().map(|m| m.to_string()).collect(),
            cache_dir: None,
            download_threads: DEFAULT_DOWNLOAD_THREADS,
            download_chunk_size: DEFAULT_DOWNLOAD_CHUNK_SIZE,
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            worker_threads: DEFAULT_WORKER_THREADS,
            connect_timeout_secs: 10,
            read_timeout_secs: 30,
            pool_acquire_timeout_secs: 30,
            mirror_retries: 0,
        }
    }
}

impl ProxySettings {
    pub fn from_yaml_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_yaml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Validate everything and prepare the cache directory.
    ///
    /// Any error here is fatal: the proxy must not start listening.
    pub fn resolve(self) -> Result<ProxyConfig, ConfigError> {
        let mirrors = MirrorList::parse(&self.mirrors)?;
        if mirrors.is_empty() {
            return Err(ConfigError::NoMirrors);
        }
        for (name, value) in [
            ("download_threads", self.download_threads),
            ("download_chunk_size", self.download_chunk_size),
            ("worker_threads", self.worker_threads),
        ] {
            if value == 0 {
                return Err(ConfigError::Zero(name));
            }
        }

        let cache_dir = self
            .cache_dir
            .unwrap_or_else(|| env::temp_dir().join("maven"));
        ensure_cache_dir(&cache_dir)?;

        Ok(ProxyConfig {
            mirrors,
            cache_dir,
            listen: SocketAddr::new(self.bind, self.port),
            download_threads: self.download_threads,
            download_chunk_size: self.download_chunk_size,
            worker_threads: self.worker_threads,
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            read_timeout: Duration::from_secs(self.read_timeout_secs),
            pool_acquire_timeout: Duration::from_secs(self.pool_acquire_timeout_secs),
            mirror_retries: self.mirror_retries,
        })
    }
}

fn ensure_cache_dir(dir: &Path) -> Result<(), ConfigError> {
    if dir.exists() {
        if !dir.is_dir() {
            return Err(ConfigError::NotADirectory(dir.to_path_buf()));
        }
        return Ok(());
    }
    fs::create_dir_all(dir).map_err(|source| ConfigError::CreateCacheDir {
        path: dir.to_path_buf(),
        source,
    })
}

/// Validated, immutable configuration shared by the whole process.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub mirrors: MirrorList,
    pub cache_dir: PathBuf,
    pub listen: SocketAddr,
    pub download_threads: usize,
    pub download_chunk_size: usize,
    pub worker_threads: usize,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub pool_acquire_timeout: Duration,
    pub mirror_retries: u32,
}

impl ProxyConfig {
    pub fn pool_settings(&self) -> PoolSettings {
        PoolSettings {
            max_connections: self.download_threads,
            connect_timeout: self.connect_timeout,
            response_timeout: self.read_timeout,
            acquire_timeout: self.pool_acquire_timeout,
        }
    }

    pub fn fetch_settings(&self) -> FetchSettings {
        FetchSettings {
            chunk_size: self.download_chunk_size,
            read_timeout: self.read_timeout,
            mirror_retries: self.mirror_retries,
        }
    }
}
