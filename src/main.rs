use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use loan_sim_telemetry::config::{AppConfig, StorageBackend};
use loan_sim_telemetry::server;
use loan_sim_telemetry::store::{RedisStore, SqliteStore, TelemetryStore};
use loan_sim_telemetry::telemetry::TelemetryCollector;
use loan_sim_telemetry::AppState;

#[derive(Parser, Debug)]
#[command(name = "loan-sim-telemetry")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Config file, with or without the .toml extension
    #[arg(long, short = 'c', default_value = "telemetry")]
    config: String,

    /// Log level (trace, debug, info, warn, error); RUST_LOG wins when set
    #[arg(long, short = 'l', default_value = "info")]
    log_level: String,

    /// Override server.bind_addr
    #[arg(long, short = 'b')]
    bind: Option<String>,

    /// Override storage.backend
    #[arg(long, value_enum)]
    storage: Option<StorageBackend>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // ── 1. Logging ───────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .init();

    // ── 2. Config ────────────────────────────────────────────────
    let mut config = AppConfig::load(&args.config)
        .with_context(|| format!("loading config '{}'", args.config))?;
    if let Some(bind) = args.bind {
        config.server.bind_addr = bind;
    }
    if let Some(backend) = args.storage {
        config.storage.backend = backend;
    }

    // ── 3. Storage ───────────────────────────────────────────────
    let store = open_store(&config).await?;

    // ── 4. Telemetry pipeline + shared state ─────────────────────
    let collector = Arc::new(TelemetryCollector::start(store, &config.telemetry));
    let state = Arc::new(AppState {
        telemetry: collector.clone(),
        config: Arc::new(config.clone()),
    });

    // ── 5. Bind & serve ──────────────────────────────────────────
    let app = server::create_router(state);
    let listener = tokio::net::TcpListener::bind(&config.server.bind_addr)
        .await
        .with_context(|| format!("binding {}", config.server.bind_addr))?;

    info!(addr = %config.server.bind_addr, backend = collector.backend(), "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server exited with error")?;

    // ── 6. Final flush ───────────────────────────────────────────
    info!("draining telemetry");
    collector.shutdown().await;
    Ok(())
}

async fn open_store(config: &AppConfig) -> Result<Arc<dyn TelemetryStore>> {
    let storage = &config.storage;
    let store: Arc<dyn TelemetryStore> = match storage.backend {
        StorageBackend::Sqlite => Arc::new(
            SqliteStore::open(
                &storage.sqlite_path,
                std::time::Duration::from_millis(storage.busy_timeout_ms),
            )
            .with_context(|| format!("opening sqlite store at {}", storage.sqlite_path))?,
        ),
        StorageBackend::Redis => Arc::new(
            RedisStore::connect(&storage.redis_url)
                .await
                .context("connecting to redis")?,
        ),
    };
    Ok(store)
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}
