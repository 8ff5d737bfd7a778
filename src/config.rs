//! Centralized application configuration.
//!
//! Single source of truth for runtime configuration, loaded from
//! environment variables with sensible defaults and validated up front.

use std::path::PathBuf;
use std::time::Duration;

use crate::constants::{
    DEFAULT_HTTP_BIND_ADDR, DEFAULT_HTTP_PORT, DEFAULT_MAX_RETRIES, DEFAULT_PENDING_SLOT_TTL_MS,
    DEFAULT_RETRY_BACKOFF_MS, DEFAULT_ROOM_CLEANUP_INTERVAL_MS, DEFAULT_STALE_SESSION_MINUTES,
};

/// HTTP server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Port serving the collaboration API and the WebSocket upgrade.
    pub http_port: u16,
    /// Bind address.
    pub http_bind_addr: String,
}

impl ServerConfig {
    /// Load from environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        let http_port = match std::env::var("HTTP_PORT") {
            Err(_) => DEFAULT_HTTP_PORT,
            Ok(raw) => raw.parse::<u16>().map_err(|e| ConfigError::InvalidValue {
                key: "HTTP_PORT".to_string(),
                value: raw.clone(),
                reason: format!("must be a valid port number: {e}"),
            })?,
        };

        Ok(Self {
            http_port,
            http_bind_addr: std::env::var("HTTP_BIND_ADDR").unwrap_or_else(|_| DEFAULT_HTTP_BIND_ADDR.to_string()),
        })
    }

    /// Default configuration (useful for testing).
    pub fn default() -> Self {
        Self {
            http_port: DEFAULT_HTTP_PORT,
            http_bind_addr: DEFAULT_HTTP_BIND_ADDR.to_string(),
        }
    }

    /// Socket address string for the listener.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.http_bind_addr, self.http_port)
    }
}

/// Coordination-store selection.
///
/// `memory` runs the in-process deterministic store. A clustered backend
/// implements the same store traits and registers its own variant here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreBackend {
    Memory,
}

/// Coordination-store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub backend: StoreBackend,
}

impl StoreConfig {
    /// Load from environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        let raw = std::env::var("STORE_BACKEND").unwrap_or_else(|_| "memory".to_string());
        let backend = match raw.as_str() {
            "memory" => StoreBackend::Memory,
            _ => {
                return Err(ConfigError::InvalidValue {
                    key: "STORE_BACKEND".to_string(),
                    value: raw,
                    reason: "supported backends: memory".to_string(),
                });
            }
        };
        Ok(Self { backend })
    }

    /// Default configuration (useful for testing).
    pub fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
        }
    }
}

/// Binary document storage configuration.
#[derive(Debug, Clone)]
pub struct DocumentStorageConfig {
    /// `fs` stores one file per document under `root`; `memory` keeps
    /// documents in process (tests, ephemeral deployments).
    pub backend: DocumentStorageBackend,
    /// Root directory for the `fs` backend.
    pub root: PathBuf,
}

/// Document storage backend selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocumentStorageBackend {
    Memory,
    Fs,
}

impl DocumentStorageConfig {
    /// Load from environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        let raw = std::env::var("DOC_STORE_BACKEND").unwrap_or_else(|_| "fs".to_string());
        let backend = match raw.as_str() {
            "memory" => DocumentStorageBackend::Memory,
            "fs" => DocumentStorageBackend::Fs,
            _ => {
                return Err(ConfigError::InvalidValue {
                    key: "DOC_STORE_BACKEND".to_string(),
                    value: raw,
                    reason: "supported backends: memory, fs".to_string(),
                });
            }
        };
        let root = std::env::var("DOC_STORE_ROOT")
            .unwrap_or_else(|_| "./data/documents".to_string())
            .into();
        Ok(Self { backend, root })
    }

    /// Default configuration (useful for testing).
    pub fn default() -> Self {
        Self {
            backend: DocumentStorageBackend::Fs,
            root: "./data/documents".into(),
        }
    }
}

/// Submit-path tunables.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Maximum commit attempts before a submission is abandoned.
    pub max_retries: u32,
    /// Base delay between commit attempts, milliseconds.
    pub retry_backoff_ms: u64,
    /// Deadline attached to each reservation, milliseconds.
    pub pending_slot_ttl_ms: u64,
}

impl EngineConfig {
    /// Load from environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        Ok(Self {
            max_retries: parse_env("MAX_RETRIES", DEFAULT_MAX_RETRIES)?,
            retry_backoff_ms: parse_env("RETRY_BACKOFF_MS", DEFAULT_RETRY_BACKOFF_MS)?,
            pending_slot_ttl_ms: parse_env("PENDING_SLOT_TTL_MS", DEFAULT_PENDING_SLOT_TTL_MS)?,
        })
    }

    /// Default configuration (useful for testing).
    pub fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            retry_backoff_ms: DEFAULT_RETRY_BACKOFF_MS,
            pending_slot_ttl_ms: DEFAULT_PENDING_SLOT_TTL_MS,
        }
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn pending_slot_ttl(&self) -> Duration {
        Duration::from_millis(self.pending_slot_ttl_ms)
    }
}

/// Background task timing.
#[derive(Debug, Clone)]
pub struct TimingConfig {
    /// Reaper sweep interval, milliseconds.
    pub room_cleanup_interval_ms: u64,
    /// Heartbeat age in minutes beyond which a session is stale.
    pub stale_session_minutes: u64,
}

impl TimingConfig {
    /// Load from environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        Ok(Self {
            room_cleanup_interval_ms: parse_env("ROOM_CLEANUP_INTERVAL_MS", DEFAULT_ROOM_CLEANUP_INTERVAL_MS)?,
            stale_session_minutes: parse_env("STALE_SESSION_MINUTES", DEFAULT_STALE_SESSION_MINUTES)?,
        })
    }

    /// Default configuration (useful for testing).
    pub fn default() -> Self {
        Self {
            room_cleanup_interval_ms: DEFAULT_ROOM_CLEANUP_INTERVAL_MS,
            stale_session_minutes: DEFAULT_STALE_SESSION_MINUTES,
        }
    }

    pub fn room_cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.room_cleanup_interval_ms)
    }

    pub fn stale_session_after(&self) -> Duration {
        Duration::from_secs(self.stale_session_minutes * 60)
    }
}

/// Top-level application configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub store: StoreConfig,
    pub documents: DocumentStorageConfig,
    pub engine: EngineConfig,
    pub timing: TimingConfig,
}

impl AppConfig {
    /// Load and validate the complete configuration from the environment.
    pub fn load() -> Result<Self, ConfigError> {
        Ok(Self {
            server: ServerConfig::load()?,
            store: StoreConfig::load()?,
            documents: DocumentStorageConfig::load()?,
            engine: EngineConfig::load()?,
            timing: TimingConfig::load()?,
        })
    }

    /// Default configuration (useful for testing).
    pub fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            store: StoreConfig::default(),
            documents: DocumentStorageConfig::default(),
            engine: EngineConfig::default(),
            timing: TimingConfig::default(),
        }
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Err(_) => Ok(default),
        Ok(raw) => raw.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            value: raw.clone(),
            reason: e.to_string(),
        }),
    }
}

/// Configuration error types.
#[derive(Debug)]
pub enum ConfigError {
    /// A configuration value is invalid.
    InvalidValue { key: String, value: String, reason: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::InvalidValue { key, value, reason } => {
                write!(f, "Invalid configuration for {}: '{}' ({})", key, value, reason)
            }
        }
    }
}

impl std::error::Error for ConfigError {}
