//! `operator` subcommand: long-running mode consuming declarative sync
//! specs from the file system.

use anyhow::Result;
use tracing::info;

use crate::config::LogConfig;
use crate::observability;
use crate::sync::file_backend::FileBackend;
use crate::sync::SyncRegistry;

pub async fn run(
    config_dir: &str,
    watch: bool,
    trigger_initial: bool,
    workers: usize,
) -> Result<()> {
    observability::init_logging(&LogConfig {
        level: "info".to_string(),
        format: "text".to_string(),
    })?;

    info!(config_dir, watch, workers, "starting operator");

    let registry = SyncRegistry::new();
    registry.start(workers).await;

    let backend = FileBackend::new(config_dir, watch);
    backend.start(&registry, trigger_initial).await?;

    tokio::signal::ctrl_c().await?;
    info!("stopping operator");
    Ok(())
}
