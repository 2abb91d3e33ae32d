// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Drum — cost-ordered reverse-proxy router over a pool of
//  upstream API accounts.
//
//  One tokio process: axum front door, per-account workers,
//  shared response/bind caches (in-memory or Redis).
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

use clap::Parser;
use drum_api::AppState;
use drum_core::config::StoreBackend;
use drum_core::RouterConfig;
use drum_proxy::client::{ApiTransport, UpstreamClient};
use drum_proxy::{Manager, TransportFactory};
use drum_store::{BindCache, KvStore, MemoryStore, ResponseCache};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "drum", version, about = "Drum API router")]
struct Cli {
    /// Bind socket to this host
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Bind socket to this port
    #[arg(long, default_value_t = 8000)]
    port: u16,

    /// Logging level
    #[arg(
        long,
        default_value = "info",
        value_parser = ["critical", "error", "warning", "info", "debug"],
    )]
    log_level: String,

    /// Debug mode
    #[arg(short = 'd', long)]
    debug: bool,

    /// Path to a configuration file
    #[arg(long)]
    config: Option<String>,
}

fn tracing_level(cli: &Cli) -> &'static str {
    if cli.debug {
        return "debug";
    }
    match cli.log_level.as_str() {
        "critical" | "error" => "error",
        "warning" => "warn",
        "debug" => "debug",
        _ => "info",
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // ── Tracing ──
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(tracing_level(&cli))),
        )
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "running router");
    if cli.debug {
        info!("debug mode is on");
    }

    // ── Config ──
    let mut config = RouterConfig::load(cli.config.as_deref())?;
    config.server.host = cli.host.clone();
    config.server.port = cli.port;
    config.server.debug = cli.debug;
    if config.donor.api_domain.is_empty() {
        warn!("donor.api_domain is not set; account registration will be rejected");
    }
    let config = Arc::new(config);

    // ── Shared store ──
    let store: Arc<dyn KvStore> = match config.store.backend {
        StoreBackend::Memory => {
            info!("using in-memory store");
            Arc::new(MemoryStore::new())
        }
        #[cfg(feature = "redis")]
        StoreBackend::Redis => {
            let store = drum_store::redis::RedisStore::connect(
                &config.store.host,
                config.store.port,
                config.store.db,
            )
            .await?;
            Arc::new(store)
        }
        #[cfg(not(feature = "redis"))]
        StoreBackend::Redis => {
            anyhow::bail!("store.backend = redis requires the `redis` build feature")
        }
    };

    // ── Caches ──
    let http_cache = Arc::new(ResponseCache::new(
        Arc::clone(&store),
        Some(config.donor.http_cache_capacity),
        Some(config.donor.http_cache_default_ttl),
    ));
    let bind_cache = Arc::new(BindCache::new(
        Arc::clone(&store),
        config.donor.bind_requests_cache_ttl,
    ));

    // ── Manager ──
    let transport_factory: TransportFactory = {
        let donor = config.donor.clone();
        Box::new(move |account| {
            Ok(Arc::new(UpstreamClient::new(
                &account.api_token,
                account.proxy.clone(),
                &donor,
            )?) as Arc<dyn ApiTransport>)
        })
    };
    let manager = Arc::new(Manager::new(
        Arc::clone(&config),
        bind_cache,
        transport_factory,
    ));

    // ── Serve ──
    let state = AppState::new(Arc::clone(&config), manager, http_cache);
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    drum_api::serve(state, addr).await
}
