use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use turnstile::config::TurnstileConfig;
use turnstile::http::HttpServer;
use turnstile::ratelimit::{RateLimiter, SystemClock};
use turnstile::store::{KeyValueStore, MemoryStore, RedisStore};

/// HTTP admission control gateway
#[derive(Debug, Parser)]
#[command(name = "turnstile", version, about)]
struct Args {
    /// Configuration file, overlaid by environment variables
    #[arg(short, long)]
    config: Option<String>,

    /// Address to listen on
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Redis URL for the shared record store
    #[arg(long)]
    redis_url: Option<String>,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = dotenvy::dotenv() {
        if !e.not_found() {
            eprintln!("Failed to read .env file: {}", e);
        }
    }

    let args = Args::parse();
    init_tracing(args.log_json);

    info!("Starting Turnstile");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = TurnstileConfig::load(args.config.as_deref())?;
    if let Some(listen) = args.listen {
        config.listen_addr = Some(listen.to_string());
    }
    if args.redis_url.is_some() {
        config.redis_url = args.redis_url;
    }

    let listen_addr = config.listen_addr();
    let policy = config.tier_policy();
    let options = config.limiter_options();
    info!(listen_addr = %listen_addr, "Configuration loaded");

    let mut sweeper = None;
    let store: Arc<dyn KeyValueStore> = match config.redis_url.as_deref() {
        Some(url) => {
            let store = RedisStore::connect(url).await?;
            info!("Using Redis record store");
            Arc::new(store)
        }
        None => {
            warn!("REDIS_URL not set, records are kept in process and not shared");
            let store = Arc::new(MemoryStore::new());
            sweeper = Some(store.spawn_sweeper(config.sweep_interval()));
            store
        }
    };

    let rate_limiter = Arc::new(RateLimiter::with_config(
        store,
        Arc::new(SystemClock),
        policy,
        options,
    ));
    let options = rate_limiter.options();
    info!(
        consistency = ?options.consistency,
        record_ttl = ?options.record_ttl,
        store_timeout = ?options.store_timeout,
        max_retries = options.max_retries,
        "Rate limiter initialized"
    );

    let server = HttpServer::new(listen_addr, rate_limiter, config.identity_policy());
    server.serve_with_shutdown(shutdown_signal()).await?;

    if let Some(sweeper) = sweeper {
        sweeper.abort();
    }

    info!("Turnstile stopped");
    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
