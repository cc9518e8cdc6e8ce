use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use parley_config::{ConfigManager, LogLevel};
use parley_observability::{Config as ObservabilityConfig, Observability};
use parley_server::AppState;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Parser, Debug, Clone)]
#[command(name = "parley-server")]
#[command(about = "Parley chat backend: WebSocket gateway and generation workers")]
#[command(version)]
struct Cli {
    /// Enable debug logging
    #[arg(long, env = "DEBUG", default_value = "false")]
    debug: bool,

    /// Gateway bind address (overrides config)
    #[arg(long, env = "PARLEY_BIND")]
    bind: Option<String>,

    /// Log level (overrides config)
    #[arg(long, env = "PARLEY_LOG_LEVEL")]
    log_level: Option<String>,

    /// Number of generation workers (overrides config)
    #[arg(long, env = "PARLEY_WORKERS")]
    workers: Option<usize>,

    /// Config file path
    #[arg(long, env = "PARLEY_CONFIG", default_value = "~/.parley/config.json")]
    config: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = parley_config::expand_tilde(&cli.config).unwrap_or_else(|| PathBuf::from(&cli.config));

    if let Err(e) = parley_config::init_parley_dirs().await {
        eprintln!("Warning: Failed to init parley directories: {}", e);
    }

    let config_manager = ConfigManager::load(&config_path)
        .await
        .with_context(|| format!("failed to load config from {:?}", config_path))?;
    let mut config = config_manager.snapshot().await;

    // CLI flags override the config file
    if let Some(bind) = cli.bind {
        config.gateway.bind = bind;
    }
    if let Some(workers) = cli.workers {
        config.worker.concurrency = workers;
    }
    if let Some(ref level) = cli.log_level {
        config.logging.level = level.parse::<LogLevel>()?;
    } else if cli.debug {
        config.logging.level = LogLevel::Debug;
    }
    ConfigManager::validate(&config)?;

    let _observability = Observability::init(&ObservabilityConfig::from(&config))?;

    info!("Starting Parley server");
    info!("  Config: {:?}", config_path);
    info!("  Gateway bind: {}", config.gateway.bind);
    info!("  Workers: {}", config.worker.concurrency);
    info!("  LLM: {} ({})", config.llm.model, config.llm.base_url);
    debug!("  Storage: {:?}", config.storage);
    debug!("  Memory: {:?}", config.memory);
    debug!("  Queue: {:?}", config.queue);

    let state = AppState::build(config).await?;
    let shutdown = CancellationToken::new();

    let pool = state.worker_pool().start();

    let gateway = state.gateway();
    let gateway_token = shutdown.clone();
    let mut gateway_task = tokio::spawn(async move { gateway.run(gateway_token).await });

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                warn!("Failed to listen for ctrl-c: {}", e);
            }
            info!("Shutdown signal received");
        }
        joined = &mut gateway_task => {
            match joined {
                Ok(Ok(())) => info!("Gateway exited"),
                Ok(Err(e)) => error!("Gateway error: {}", e),
                Err(e) => error!("Gateway task failed: {}", e),
            }
        }
    }

    shutdown.cancel();
    pool.shutdown().await;
    state.shutdown().await;
    info!("Parley server stopped");
    Ok(())
}
