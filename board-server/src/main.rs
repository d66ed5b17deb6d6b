//! Board sync server binary.
//!
//! Configured through `BOARD_SYNC_*` environment variables; log level
//! through `RUST_LOG`.

use std::sync::Arc;

use board_sync::{AllowAll, ServerConfig, SyncServer};
use log::{error, info};

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = match ServerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {e}");
            std::process::exit(2);
        }
    };
    info!(
        "Starting board sync server (redo policy {:?}, storage {})",
        config.redo_policy,
        config
            .storage_path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "in-memory".to_string())
    );

    let server = match SyncServer::new(config, Arc::new(AllowAll)) {
        Ok(server) => server,
        Err(e) => {
            error!("Failed to start: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = server.run().await {
        error!("Server stopped: {e}");
        std::process::exit(1);
    }
}
