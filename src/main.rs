//! spotmatch service entrypoint
//!
//! Loads the YAML config, starts the venue (symbol workers + event
//! publisher + optional Postgres mirror) and drains gracefully on
//! SIGTERM. A symbol halted by an invariant violation makes the process
//! exit non-zero so supervisors notice.

use std::process::ExitCode;
use std::sync::Arc;

use tracing::{error, info};

use spotmatch::config::AppConfig;
use spotmatch::pipeline::Venue;
use spotmatch::{logging, persistence};

#[tokio::main]
async fn main() -> ExitCode {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.yaml".to_string());
    let config = match AppConfig::from_yaml_file(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("failed to load config {config_path}: {e:#}");
            return ExitCode::FAILURE;
        }
    };

    let _guard = logging::init_logging(&config.log);

    match run(config).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => {
            error!("venue halted on invariant violation");
            ExitCode::FAILURE
        }
        Err(e) => {
            error!("venue failed: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: AppConfig) -> anyhow::Result<bool> {
    let registry = Arc::new(config.build_registry()?);
    info!(symbols = registry.symbol_count(), "symbol registry loaded");

    let pool = match &config.database_url {
        Some(url) => {
            let pool = persistence::connect(url).await?;
            persistence::init_schema(&pool).await?;
            Some(pool)
        }
        None => None,
    };

    let venue = Venue::start(&config, Arc::clone(&registry), pool.clone())?;
    if let Some(pool) = pool {
        persistence::spawn_mirror(pool, Arc::clone(venue.publisher()), &registry);
    }

    info!("venue ready");
    shutdown_signal().await;
    Ok(venue.shutdown().await)
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = term.recv() => info!("SIGTERM received, draining"),
                _ = tokio::signal::ctrl_c() => info!("interrupt received, draining"),
            }
        }
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
