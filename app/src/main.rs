//! camcast server: streams the camera to UDP subscribers.
//!
//! Usage: `camcast-server [config.json]`

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use camcast::{init_logging, AppConfig};
use camcast_transport::BroadcastLoop;
use tracing::{error, info};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    init_logging();

    let config_path = std::env::args_os().nth(1).map(PathBuf::from);
    let config = AppConfig::load(config_path.as_deref())?;

    std::fs::create_dir_all(&config.capture.artifact_dir).with_context(|| {
        format!(
            "Failed to create artifact directory {}",
            config.capture.artifact_dir.display()
        )
    })?;

    info!(
        bind = %config.broadcast.bind_addr,
        device = config.device.kind(),
        "camcast server starting"
    );

    let capture = Arc::new(config.capture_manager());
    let mut broadcast = BroadcastLoop::bind(config.broadcast.clone(), Arc::clone(&capture))
        .await
        .context("Failed to start broadcast loop")?;

    let result = broadcast.run_until(shutdown_signal()).await;
    capture.shutdown();

    result.context("Broadcast loop failed")?;
    info!("camcast server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
}
