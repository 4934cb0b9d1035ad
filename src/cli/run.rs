use crate::backfill::{BackFiller, BackfillError, BackfillOptions};
use crate::config::parse::{load_config, ConfigError};
use crate::config::types::{Config, WebConfig};
use crate::derive::{CommandDeriver, DeriveError};
use crate::stream::StreamHub;
use crate::time::SystemClock;
use crate::web::{run_server, AppState};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::signal;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

#[derive(Debug, Error)]
pub enum RunError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("backfill error: {0}")]
    Backfill(#[from] BackfillError),

    #[error("derivation error: {0}")]
    Derive(#[from] DeriveError),

    #[error("task join error: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("web server error: {0}")]
    WebServer(String),

    #[error("{0}")]
    Other(String),
}

/// Error returned when no config file was given or found.
pub fn require_config_path(config_path: Option<PathBuf>) -> Result<PathBuf, RunError> {
    config_path.ok_or_else(|| {
        RunError::Other(
            "config not found\n\
             Searched locations:\n  \
             ~/.config/parchive/config.yml\n  \
             /etc/parchive/config.yml\n\n\
             Use --config <path> to specify a config file, or run 'parchive config init' to generate one."
                .to_string(),
        )
    })
}

pub async fn run(config_path: Option<PathBuf>) -> Result<(), Box<dyn std::error::Error>> {
    let config_path = require_config_path(config_path)?;
    run_backfiller(&config_path).await.map_err(|e| e.into())
}

/// Builds the stream hub and a backfiller wired to it from `config`.
pub fn build_backfiller(
    config: &Config,
    options: BackfillOptions,
) -> Result<(Arc<BackFiller>, Arc<StreamHub>), RunError> {
    let streams = Arc::new(StreamHub::with_streams(config.declared_streams().cloned()));
    let deriver = Arc::new(CommandDeriver::from_config(&config.derivation)?);
    let backfiller = BackFiller::new(
        options,
        Arc::new(SystemClock),
        Arc::clone(&streams) as Arc<dyn crate::stream::StreamRegistry>,
        deriver,
    )?;
    Ok((Arc::new(backfiller), streams))
}

async fn run_backfiller(config_path: &Path) -> Result<(), RunError> {
    info!(config_path = %config_path.display(), "Loading configuration");
    let config = load_config(config_path)?;

    let options = BackfillOptions::from_config(&config)?;
    info!(
        bucket_ms = options.buckets.duration(),
        schema = %options.partitioner.schema(),
        "Archive time addressing configured"
    );
    let (backfiller, streams) = build_backfiller(&config, options)?;
    backfiller.start()?;

    // Create shutdown signal
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let web_handle = if config.web.enabled {
        info!("Starting web server on {}", config.web.listen);
        let state = AppState {
            backfiller: Arc::clone(&backfiller),
            streams: Arc::clone(&streams),
        };
        Some(spawn_web_server(state, config.web.clone(), shutdown_rx))
    } else {
        None
    };

    info!("Backfiller running, press Ctrl+C to shutdown");

    let shutdown = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Cannot listen for shutdown signal");
            std::future::pending::<()>().await;
        }
    };
    supervise(&backfiller, web_handle, shutdown, shutdown_tx).await
}

type WebHandle = JoinHandle<Result<(), RunError>>;

fn spawn_web_server(
    state: AppState,
    web_config: WebConfig,
    shutdown_rx: watch::Receiver<bool>,
) -> WebHandle {
    tokio::spawn(async move {
        run_server(state, web_config, shutdown_rx)
            .await
            .map_err(|e| RunError::WebServer(e.to_string()))
    })
}

async fn wait_web_server(handle: &mut Option<WebHandle>) -> Result<(), RunError> {
    match handle {
        Some(handle) => handle.await?,
        None => std::future::pending().await,
    }
}

/// Runs until `shutdown` resolves or the web server ends on its own, then
/// stops the backfiller. A web server that ends first fails the run.
async fn supervise<F>(
    backfiller: &BackFiller,
    mut web_handle: Option<WebHandle>,
    shutdown: F,
    shutdown_tx: watch::Sender<bool>,
) -> Result<(), RunError>
where
    F: Future<Output = ()>,
{
    let web_exit = tokio::select! {
        _ = shutdown => {
            info!("Shutdown signal received");
            None
        }
        result = wait_web_server(&mut web_handle) => Some(result),
    };
    let _ = shutdown_tx.send(true);

    if let Some(result) = web_exit {
        let err = match result {
            Ok(()) => RunError::WebServer("web server exited unexpectedly".to_string()),
            Err(e) => e,
        };
        error!(error = %err, "Web server stopped, shutting down");
        backfiller.stop().await;
        return Err(err);
    }

    backfiller.stop().await;

    if let Some(handle) = web_handle {
        match handle.await {
            Ok(Ok(())) => info!("Web server stopped"),
            Ok(Err(e)) => error!(error = %e, "Web server error"),
            Err(e) => error!(error = %e, "Web server task join error"),
        }
    }

    info!("Shutdown complete");
    Ok(())
}
