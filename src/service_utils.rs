use crate::broadcast::Hub;
use crate::config::{Config, StorageBackend};
use crate::db::DatabaseService;
use crate::inference::{GeminiInference, HeuristicInference, InferenceProvider};
use crate::models::{Role, User};
use crate::mqtt_service::{ConnectionManager, ConnectionOptions};
use crate::storage::{MemoryStorage, Storage, StorageError};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use uuid::Uuid;

const ADMIN_USERNAME: &str = "admin";

/// Open the configured storage backend, creating the schema when it is SQLite.
pub fn build_storage(config: &Config) -> Result<Arc<dyn Storage>, StorageError> {
    match config.storage_backend {
        StorageBackend::Memory => {
            info!("Using in-memory storage (history limit {})", config.reading_history_limit);
            Ok(Arc::new(MemoryStorage::new(config.reading_history_limit)))
        }
        StorageBackend::Sqlite => {
            let db = DatabaseService::new(
                &config.database_path,
                config.db_pool_size,
                config.max_readings_per_device,
            )?;
            db.initialize_db()?;
            info!("Database initialized successfully at {}", config.database_path);
            Ok(Arc::new(db))
        }
    }
}

/// Gemini when an API key is configured, otherwise the local label heuristic.
pub fn build_inference_provider(config: &Config) -> Arc<dyn InferenceProvider> {
    let Some(api_key) = config.gemini_api_key.as_deref() else {
        info!("GEMINI_API_KEY not set, reading types use heuristic labels");
        return Arc::new(HeuristicInference);
    };

    match GeminiInference::new(
        api_key,
        &config.gemini_model,
        Duration::from_millis(config.inference_timeout_ms),
    ) {
        Ok(provider) => {
            info!("Reading type inference via {}", config.gemini_model);
            Arc::new(provider)
        }
        Err(e) => {
            warn!("Falling back to heuristic inference: {}", e);
            Arc::new(HeuristicInference)
        }
    }
}

pub fn connection_options(config: &Config) -> ConnectionOptions {
    ConnectionOptions {
        reconnect_interval: Duration::from_millis(config.mqtt_reconnect_interval_ms),
        connect_timeout: Duration::from_millis(config.mqtt_connect_timeout_ms),
        keep_alive: Duration::from_secs(config.mqtt_keep_alive_secs),
    }
}

/// Ensure the admin account bound to `ADMIN_API_TOKEN` exists.
pub async fn seed_admin(storage: &dyn Storage, token: Option<&str>) -> Result<(), StorageError> {
    let Some(token) = token.filter(|t| !t.is_empty()) else {
        return Ok(());
    };
    storage
        .ensure_user(User {
            id: Uuid::new_v4().to_string(),
            username: ADMIN_USERNAME.to_string(),
            role: Role::Admin,
            api_token: token.to_string(),
        })
        .await?;
    info!("Admin user '{}' is available", ADMIN_USERNAME);
    Ok(())
}

/// Run the initial roster sync without holding up server startup.
pub fn start_connection_manager(manager: Arc<ConnectionManager>) {
    tokio::spawn(async move {
        match manager.sync().await {
            Ok(()) => info!(
                "Device connections synced: {} live",
                manager.live_connections().len()
            ),
            Err(e) => error!("Initial device sync failed: {}", e),
        }
    });
}

/// Log the number of live device connections and subscribers every 30 seconds.
pub fn periodic_status_update(manager: Arc<ConnectionManager>, hub: Arc<Hub>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(30));
        interval.tick().await;
        loop {
            interval.tick().await;
            info!(
                connections = manager.live_connections().len(),
                subscribers = hub.len(),
                "status"
            );
        }
    });
}

/// Resolves on Ctrl-C.
pub async fn handle_shutdown() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to handle termination signal: {:?}", e);
    }
    info!("Shutdown requested, stopping services...");
}
