use std::sync::Arc;

use quill_collab::{CollabServer, RocksCheckpointStore, ServerConfig, StoreConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = ServerConfig::from_env()?;
    let store = RocksCheckpointStore::open(StoreConfig {
        path: config.storage_path.clone(),
        ..StoreConfig::default()
    })?;
    log::info!(
        "Opened checkpoint store at {} ({} documents)",
        store.path().display(),
        store.list_documents()?.len()
    );

    let server = CollabServer::new(config, Arc::new(store));

    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            log::info!("Interrupt received, flushing documents");
        }
    }

    server.hub().shutdown().await;
    Ok(())
}
