//! Tollbooth daemon
//!
//! Serves the certification authority over HTTP and sweeps expired replay
//! entries in the background.

use clap::{Parser, ValueEnum};
use std::time::Duration;
use tollbooth_service::config::StorageConfig;
use tollbooth_service::{build_router, ServiceConfig, ServiceState};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum StorageMode {
    /// Keep whatever the configuration file says
    Config,
    /// Postgres when a database url is known, memory otherwise
    Auto,
    Memory,
    Postgres,
}

#[derive(Debug, Parser)]
#[command(name = "tollboothd", version, about = "Tollbooth certification authority daemon")]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "TOLLBOOTH_CONFIG")]
    config: Option<String>,

    /// Listen address, overrides the configuration file
    #[arg(short, long, env = "TOLLBOOTH_LISTEN_ADDR")]
    listen: Option<String>,

    /// Log level
    #[arg(long, env = "TOLLBOOTH_LOG_LEVEL")]
    log_level: Option<String>,

    /// Enable JSON logging
    #[arg(long, env = "TOLLBOOTH_LOG_JSON")]
    json: bool,

    #[arg(long, value_enum, default_value_t = StorageMode::Config)]
    storage: StorageMode,

    #[arg(long)]
    database_url: Option<String>,

    #[arg(long, default_value_t = 5)]
    pg_max_connections: u32,
}

fn resolve_storage(cli: &Cli, configured: StorageConfig) -> anyhow::Result<StorageConfig> {
    let resolved_url = cli
        .database_url
        .clone()
        .or_else(|| std::env::var("DATABASE_URL").ok());

    let storage = match cli.storage {
        StorageMode::Config => configured,
        StorageMode::Memory => StorageConfig::Memory,
        StorageMode::Postgres => {
            let database_url = resolved_url.ok_or_else(|| {
                anyhow::anyhow!("--storage postgres requires --database-url or DATABASE_URL")
            })?;
            StorageConfig::Postgres {
                database_url,
                max_connections: cli.pg_max_connections,
            }
        }
        StorageMode::Auto => match resolved_url {
            Some(database_url) => StorageConfig::Postgres {
                database_url,
                max_connections: cli.pg_max_connections,
            },
            None => StorageConfig::Memory,
        },
    };

    Ok(storage)
}

fn init_tracing(level: &str, json: bool) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.to_string().into());

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = ServiceConfig::load(cli.config.as_deref())?;
    let level = cli
        .log_level
        .clone()
        .unwrap_or_else(|| config.logging.level.clone());
    init_tracing(&level, cli.json || config.logging.json);

    if let Some(listen) = &cli.listen {
        config.server.listen_addr = listen
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid listen address '{listen}': {e}"))?;
    }
    config.storage = resolve_storage(&cli, config.storage.clone())?;

    let state = ServiceState::bootstrap(&config).await?;

    if config.prune_interval_secs > 0 {
        let engine = state.engine.clone();
        let period = Duration::from_secs(config.prune_interval_secs);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                match engine.prune_replay() {
                    Ok(0) => {}
                    Ok(pruned) => info!(pruned, "expired replay entries removed"),
                    Err(err) => error!(error = %err, "replay prune failed"),
                }
            }
        });
    }

    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(config.server.listen_addr).await?;
    info!(addr = %config.server.listen_addr, "tollboothd listening");
    axum::serve(listener, app).await?;
    Ok(())
}
