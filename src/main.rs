mod broadcast;
mod config;
mod db;
mod inference;
mod metadata;
mod models;
mod mqtt_service;
mod normalizer;
mod notifications;
mod pipeline;
mod rest_server;
mod service_utils;
mod storage;

use crate::broadcast::Hub;
use crate::config::Config;
use crate::metadata::{Enricher, MetadataCache};
use crate::mqtt_service::ConnectionManager;
use crate::pipeline::IngestionPipeline;
use crate::rest_server::{run_rest_server, AppState};
use crate::service_utils::{
    build_inference_provider, build_storage, connection_options, handle_shutdown,
    periodic_status_update, seed_admin, start_connection_manager,
};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // Load configuration
    let config = match Config::from_env() {
        Ok(cfg) => Arc::new(cfg),
        Err(e) => {
            error!("Error loading configuration: {:?}", e);
            return;
        }
    };

    let storage = match build_storage(&config) {
        Ok(storage) => storage,
        Err(e) => {
            error!("Failed to open storage: {:?}", e);
            return;
        }
    };

    if let Err(e) = seed_admin(storage.as_ref(), config.admin_api_token.as_deref()).await {
        error!("Failed to seed admin user: {:?}", e);
        return;
    }

    let metadata = Arc::new(MetadataCache::load(&config.metadata_path));
    let enricher = Enricher::new(metadata.clone(), build_inference_provider(&config));
    let hub = Arc::new(Hub::new(config.subscriber_buffer));
    let pipeline = Arc::new(IngestionPipeline::new(storage.clone(), enricher, hub.clone()));
    let manager = ConnectionManager::new(storage.clone(), pipeline, connection_options(&config));

    start_connection_manager(manager.clone());
    periodic_status_update(manager.clone(), hub.clone());

    let state = AppState {
        storage,
        manager: manager.clone(),
        metadata,
        hub,
    };
    if let Err(e) = run_rest_server(state, &config.http_bind, handle_shutdown()).await {
        error!("REST server failed: {:?}", e);
    }

    manager.shutdown().await;
    info!("All services shut down successfully.");
}
