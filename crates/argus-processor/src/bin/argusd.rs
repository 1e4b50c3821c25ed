//! Argus daemon executable

use argus_alerts::HttpSinkRouter;
use argus_common::Config;
use argus_processor::start_postgres_processor;
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Argus observability core daemon
#[derive(Parser)]
#[command(name = "argusd")]
#[command(about = "Argus observability core - ingest, aggregate, detect, alert", long_about = None)]
#[command(version)]
struct Cli {
    /// Optional TOML configuration file; environment variables fill the
    /// rest
    #[arg(short, long, env = "ARGUS_CONFIG")]
    config: Option<String>,

    /// Log filter (overridden by RUST_LOG)
    #[arg(long, env = "ARGUS_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Emit JSON logs
    #[arg(long, env = "ARGUS_LOG_JSON")]
    json: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(&cli);

    let config = match load_config(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("configuration error: {}", e);
            std::process::exit(1);
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        window_secs = config.windowing.window_secs,
        "starting argusd"
    );

    let router = match HttpSinkRouter::new(
        config.sinks.clone(),
        Duration::from_millis(config.dispatcher.sink_timeout_ms),
    ) {
        Ok(router) => Arc::new(router),
        Err(e) => {
            error!("failed to build sink router: {}", e);
            std::process::exit(1);
        }
    };

    let processor = match start_postgres_processor(config, router).await {
        Ok(processor) => processor,
        Err(e) => {
            error!("failed to start processor: {}", e);
            std::process::exit(1);
        }
    };

    info!("argusd running; press Ctrl+C to stop");
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("failed to listen for shutdown signal: {}", e);
    }

    info!("shutdown signal received");
    processor.shutdown().await;
}

fn init_tracing(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    if cli.json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

fn load_config(path: Option<&str>) -> argus_common::Result<Config> {
    match path {
        Some(path) => {
            info!("loading configuration from {}", path);
            let raw = std::fs::read_to_string(path).map_err(|e| {
                argus_common::Error::Config(format!("cannot read {}: {}", path, e))
            })?;
            toml::from_str(&raw)
                .map_err(|e| argus_common::Error::Config(format!("invalid config file: {}", e)))
        }
        None => Config::from_env(),
    }
}
