use crate::config::{load_config, Config, SourceType};
use crate::pipeline::Pipeline;
use crate::source::{FileConnector, SourceConnector};
use crate::storage::{DuckDbStore, OffsetStore, TargetStore};
use crate::web::{run_server, AppState};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Debug, Error)]
pub enum RunError {
    #[error("config error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("storage error: {0}")]
    Storage(#[from] crate::storage::StoreError),

    #[error("pipeline error: {0}")]
    Pipeline(#[from] crate::pipeline::PipelineError),

    #[error("web server error: {0}")]
    WebServer(String),
}

pub async fn run(config_path: Option<PathBuf>) -> Result<(), Box<dyn std::error::Error>> {
    let Some(config_path) = config_path else {
        eprintln!("Error: config not found");
        eprintln!("Searched locations:");
        eprintln!("  ~/.config/cdcsink/config.yml");
        eprintln!("  /etc/cdcsink/config.yml");
        eprintln!("\nUse --config <path> to specify a config file, or run 'cdcsink config init' to generate one.");
        std::process::exit(1);
    };

    run_pipeline(&config_path).await.map_err(|e| e.into())
}

fn connector_for(config: &Config) -> Arc<dyn SourceConnector> {
    match config.source.source_type {
        SourceType::File => Arc::new(FileConnector::new(
            config.source.path.clone(),
            config.source.follow,
            config.source.poll_interval,
        )),
    }
}

async fn run_pipeline(config_path: &PathBuf) -> Result<(), RunError> {
    info!(config_path = %config_path.display(), "Loading configuration");
    let config = load_config(config_path)?;

    info!(path = %config.target.path.display(), "Opening target database");
    if let Some(parent) = config.target.path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .map_err(|e| crate::storage::StoreError::Database(e.to_string()))?;
        }
    }
    let store = Arc::new(DuckDbStore::new(&config.target.path)?);
    store.init_schema().await?;

    let web_config = config.web.clone();
    let connector = connector_for(&config);
    let target: Arc<dyn TargetStore> = store.clone();
    let offsets: Arc<dyn OffsetStore> = store.clone();
    let handle = Pipeline::new(config, connector, target, offsets).spawn();
    info!(instance = %handle.instance_id(), "Pipeline started, press Ctrl+C to shutdown");

    let web_shutdown = CancellationToken::new();
    let web_handle = web_config.map(|web_config| {
        let state = AppState {
            board: handle.board(),
            store: store.clone(),
        };
        let shutdown = web_shutdown.clone();
        tokio::spawn(async move {
            run_server(web_config, state, shutdown)
                .await
                .map_err(|e| RunError::WebServer(e.to_string()))
        })
    });

    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Shutdown signal received, draining");
            handle.shutdown();
        }
        state = handle.stopped() => {
            info!(%state, "Pipeline finished on its own");
        }
    }

    let result = handle.join().await;

    web_shutdown.cancel();
    if let Some(web_handle) = web_handle {
        match web_handle.await {
            Ok(Ok(())) => info!("Admin API stopped"),
            Ok(Err(e)) => error!(error = %e, "Admin API error"),
            Err(e) => error!(error = %e, "Admin API join error"),
        }
    }

    result?;
    info!("Pipeline shutdown complete");
    Ok(())
}
