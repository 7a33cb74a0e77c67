use std::net::IpAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use maven_cache_proxy::config::ProxySettings;
use maven_cache_proxy::server::handler::{serve, ProxyState};

#[derive(Parser, Debug)]
#[command(name = "maven-cache-proxy", about = "Caching Maven repository proxy")]
struct Cli {
    /// YAML configuration file; command line flags override its values.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Upstream repository base URL, highest priority first.
    #[arg(short, long = "mirror", value_delimiter = ',')]
    mirrors: Vec<String>,

    /// Directory holding cached artifacts.
    #[arg(long)]
    cache_dir: Option<PathBuf>,

    #[arg(short, long)]
    port: Option<u16>,

    #[arg(long)]
    bind: Option<IpAddr>,

    /// Maximum concurrent upstream downloads.
    #[arg(long)]
    download_threads: Option<usize>,

    /// Bytes per chunk relayed to clients.
    #[arg(long)]
    download_chunk_size: Option<usize>,

    #[arg(long)]
    worker_threads: Option<usize>,
}

impl Cli {
    fn apply(self, settings: &mut ProxySettings) {
        if !self.mirrors.is_empty() {
            settings.mirrors = self.mirrors;
        }
        if self.cache_dir.is_some() {
            settings.cache_dir = self.cache_dir;
        }
        if let Some(port) = self.port {
            settings.port = port;
        }
        if let Some(bind) = self.bind {
            settings.bind = bind;
        }
        if let Some(threads) = self.download_threads {
            settings.download_threads = threads;
        }
        if let Some(size) = self.download_chunk_size {
            settings.download_chunk_size = size;
        }
        if let Some(threads) = self.worker_threads {
            settings.worker_threads = threads;
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,hyper=warn,reqwest=warn"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let mut settings = match &cli.config {
        Some(path) => ProxySettings::from_yaml_file(path)?,
        None => ProxySettings::default(),
    };
    cli.apply(&mut settings);
    let config = settings.resolve().context("invalid configuration")?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.worker_threads)
        .thread_name("maven-proxy-worker")
        .enable_all()
        .build()
        .context("failed to build runtime")?;

    runtime.block_on(async move {
        let state = ProxyState::from_config(&config)?;
        let listener = TcpListener::bind(config.listen)
            .await
            .with_context(|| format!("failed to bind {}", config.listen))?;

        info!(
            listen = %config.listen,
            cache_dir = %config.cache_dir.display(),
            mirrors = config.mirrors.len(),
            "maven proxy listening"
        );
        for mirror in config.mirrors.iter() {
            info!(rank = mirror.rank(), base = %mirror.base(), "mirror");
        }

        serve(listener, state.clone(), shutdown_signal()).await?;

        let stats = state.stats().snapshot();
        info!(
            hits = stats.cache_hits,
            misses = stats.cache_misses,
            hit_rate = stats.cache_hit_rate(),
            coalesced = stats.coalesced,
            upstream_attempts = stats.upstream_attempts,
            upstream_failures = stats.upstream_failures,
            downloaded_bytes = stats.downloaded_bytes,
            promotions = stats.promotions,
            cache_write_failures = stats.cache_write_failures,
            "proxy shut down"
        );
        Ok::<(), anyhow::Error>(())
    })
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("received SIGINT"),
        () = terminate => info!("received SIGTERM"),
    }
}
