use dotenvy::dotenv;
use std::env;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    Sqlite,
    Memory,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub http_bind: String,

    pub storage_backend: StorageBackend,
    pub database_path: String,
    pub db_pool_size: u32,
    pub reading_history_limit: usize,
    pub max_readings_per_device: Option<usize>,

    pub metadata_path: String,
    pub gemini_api_key: Option<String>,
    pub gemini_model: String,
    pub inference_timeout_ms: u64,

    pub mqtt_reconnect_interval_ms: u64,
    pub mqtt_connect_timeout_ms: u64,
    pub mqtt_keep_alive_secs: u64,

    pub subscriber_buffer: usize,
    pub admin_api_token: Option<String>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Environment variable {0} is missing or invalid.")]
    MissingOrInvalid(String),
    #[error("Parsing error: {0}")]
    ParsingError(String),
}

impl Config {
    /// Validate timeout values and other critical configurations.
    fn validate_timeouts(&self) -> Result<(), ConfigError> {
        const MIN_TIMEOUT: u64 = 100;
        const MAX_TIMEOUT: u64 = 1_000_000;

        let timeouts = [
            ("MQTT_RECONNECT_INTERVAL_MS", self.mqtt_reconnect_interval_ms),
            ("MQTT_CONNECT_TIMEOUT_MS", self.mqtt_connect_timeout_ms),
            ("INFERENCE_TIMEOUT_MS", self.inference_timeout_ms),
        ];
        for (name, value) in timeouts {
            if !(MIN_TIMEOUT..=MAX_TIMEOUT).contains(&value) {
                return Err(ConfigError::ParsingError(format!(
                    "{} must be between {} and {} ms",
                    name, MIN_TIMEOUT, MAX_TIMEOUT
                )));
            }
        }

        if self.mqtt_keep_alive_secs == 0 {
            return Err(ConfigError::ParsingError(
                "MQTT_KEEP_ALIVE_SECS must be at least 1".to_string(),
            ));
        }
        if self.subscriber_buffer == 0 || self.db_pool_size == 0 {
            return Err(ConfigError::ParsingError(
                "SUBSCRIBER_BUFFER and DB_POOL_SIZE must be positive".to_string(),
            ));
        }

        Ok(())
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv().ok(); // Load environment variables from .env file
        Self::from_source(|key| env::var(key).ok())
    }

    /// Builds the configuration from any key lookup.
    pub fn from_source<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let text = |key: &str, default: &str| {
            lookup(key)
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| default.to_string())
        };
        let optional = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let storage_backend = match text("STORAGE_BACKEND", "sqlite").to_lowercase().as_str() {
            "sqlite" => StorageBackend::Sqlite,
            "memory" => StorageBackend::Memory,
            _ => return Err(ConfigError::MissingOrInvalid("STORAGE_BACKEND".to_string())),
        };

        let max_readings_per_device = match optional("MAX_READINGS_PER_DEVICE") {
            Some(raw) => Some(parse_number::<usize>("MAX_READINGS_PER_DEVICE", &raw)?),
            None => None,
        };

        let config = Self {
            http_bind: text("HTTP_BIND", "0.0.0.0:5000"),

            storage_backend,
            database_path: text("DATABASE_PATH", "telemetry.db"),
            db_pool_size: parse_number("DB_POOL_SIZE", &text("DB_POOL_SIZE", "4"))?,
            reading_history_limit: parse_number(
                "READING_HISTORY_LIMIT",
                &text("READING_HISTORY_LIMIT", "1000"),
            )?,
            max_readings_per_device,

            metadata_path: text("METADATA_PATH", "metadata.json"),
            gemini_api_key: optional("GEMINI_API_KEY"),
            gemini_model: text("GEMINI_MODEL", "gemini-1.5-flash"),
            inference_timeout_ms: parse_number(
                "INFERENCE_TIMEOUT_MS",
                &text("INFERENCE_TIMEOUT_MS", "15000"),
            )?,

            mqtt_reconnect_interval_ms: parse_number(
                "MQTT_RECONNECT_INTERVAL_MS",
                &text("MQTT_RECONNECT_INTERVAL_MS", "10000"),
            )?,
            mqtt_connect_timeout_ms: parse_number(
                "MQTT_CONNECT_TIMEOUT_MS",
                &text("MQTT_CONNECT_TIMEOUT_MS", "5000"),
            )?,
            mqtt_keep_alive_secs: parse_number(
                "MQTT_KEEP_ALIVE_SECS",
                &text("MQTT_KEEP_ALIVE_SECS", "30"),
            )?,

            subscriber_buffer: parse_number(
                "SUBSCRIBER_BUFFER",
                &text("SUBSCRIBER_BUFFER", "256"),
            )?,
            admin_api_token: optional("ADMIN_API_TOKEN"),
        };

        // Validate timeouts after constructing the configuration
        config.validate_timeouts()?;

        Ok(config)
    }
}

fn parse_number<T: FromStr>(key: &str, raw: &str) -> Result<T, ConfigError> {
    raw.trim()
        .parse::<T>()
        .map_err(|_| ConfigError::ParsingError(format!("{} must be a valid number", key)))
}
