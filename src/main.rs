//! Quai Mining Client - Main Application
//!
//! Mines one slice of the Quai hierarchy, taking work either from the slice's
//! nodes or from a mining proxy.

use quai_mining_client::{
    client::connect_to_slice,
    config::{Config, LogFormat, MiningMode},
    engine::{CpuEngine, SealEngine},
    feed::{DirectSource, PendingHeaderSource, ProxySource},
    miner::Miner,
    proxy::ProxySession,
    Error, Result, APP_NAME, APP_VERSION,
};

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Install the global subscriber; `RUST_LOG` wins over the configured level
fn init_tracing(config: &Config) {
    let level: tracing::Level = config.log_level.into();
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.to_string().to_lowercase()));

    let registry = tracing_subscriber::registry().with(filter);
    match config.log_format {
        LogFormat::Json => registry.with(fmt::layer().json()).init(),
        LogFormat::Text => registry.with(fmt::layer().with_target(false)).init(),
    }
}

/// Build the header source for the configured mode
async fn build_source(
    config: &Config,
    shutdown: &CancellationToken,
) -> Result<Arc<dyn PendingHeaderSource>> {
    let max_retry_delay = config.max_retry_delay_duration()?;

    match config.mode()? {
        MiningMode::Direct { endpoints } => {
            let settings = config.client_settings()?;
            let clients = connect_to_slice(&endpoints, &settings, shutdown).await?;
            info!("Connected to slice: {:?}", clients);
            Ok(Arc::new(DirectSource::new(clients, max_retry_delay)))
        }
        MiningMode::Proxy {
            endpoint,
            reward_address,
            password,
        } => {
            let session = Arc::new(ProxySession::new(endpoint));
            Ok(Arc::new(ProxySource::new(
                session,
                reward_address,
                password,
                config.refresh_interval_duration()?,
                max_retry_delay,
            )))
        }
    }
}

/// Print current configuration
fn print_configuration(config: &Config) -> Result<()> {
    let config_yaml = serde_yaml::to_string(config)?;
    println!("{}", config_yaml);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load and validate configuration
    let config = Config::load().await?;

    if config.print_config {
        print_configuration(&config)?;
        return Ok(());
    }

    init_tracing(&config);

    let mode = config.mode()?;
    info!("Starting {} v{}", APP_NAME, APP_VERSION);
    info!("Mining location {} in {} mode", config.location(), mode);

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown requested"),
            Err(e) => warn!("Unable to listen for shutdown signal: {}", e),
        }
        signal_token.cancel();
    });

    let source = match build_source(&config, &shutdown).await {
        Ok(source) => source,
        Err(Error::Cancelled { .. }) => return Ok(()),
        Err(e) => {
            error!("Startup failed: {}", e);
            return Err(e);
        }
    };

    let engine: Arc<dyn SealEngine> = Arc::new(CpuEngine::new(config.threads));
    let miner = Miner::new(source, engine, config.hashrate_interval_duration()?);

    miner.run(shutdown).await
}
