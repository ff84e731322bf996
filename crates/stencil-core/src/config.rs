//! Configuration types for the stencil explorer.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::types::STENCIL_EXTENSIONS;

/// Main configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExplorerConfig {
    /// Cache database configuration.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Scanner configuration.
    #[serde(default)]
    pub scanner: ScannerConfig,

    /// Search configuration.
    #[serde(default)]
    pub search: SearchConfig,

    /// Local bridge configuration.
    #[serde(default)]
    pub api: ApiConfig,
}

/// Database configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the SQLite cache file.
    #[serde(default = "default_database_path")]
    pub path: PathBuf,

    /// Enable WAL mode (recommended).
    #[serde(default = "default_true")]
    pub wal_mode: bool,

    /// Busy timeout in milliseconds.
    #[serde(default = "default_busy_timeout")]
    pub busy_timeout_ms: u32,

    /// Attempts at creating the full-text index before giving up on it.
    #[serde(default = "default_fts_attempts")]
    pub fts_attempts: u32,

    /// Base backoff between full-text index attempts, multiplied by the attempt number.
    #[serde(default = "default_fts_backoff")]
    pub fts_backoff_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
            wal_mode: true,
            busy_timeout_ms: 30000,
            fts_attempts: 3,
            fts_backoff_ms: 100,
        }
    }
}

impl DatabaseConfig {
    /// Default settings for a specific database file.
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }
}

/// Scanner configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScannerConfig {
    /// File extensions treated as stencils.
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            extensions: default_extensions(),
        }
    }
}

/// Search configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    /// Default number of results.
    #[serde(default = "default_limit")]
    pub default_limit: u32,

    /// Use the full-text index when available.
    #[serde(default = "default_true")]
    pub use_full_text: bool,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            default_limit: 1000,
            use_full_text: true,
        }
    }
}

/// Local bridge configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Shared secret expected in the `X-API-Key` header; `None` disables the check.
    #[serde(default)]
    pub api_key: Option<String>,
}

// Default value functions

fn default_true() -> bool {
    true
}

fn default_busy_timeout() -> u32 {
    30000
}

fn default_fts_attempts() -> u32 {
    3
}

fn default_fts_backoff() -> u64 {
    100
}

fn default_limit() -> u32 {
    1000
}

fn default_extensions() -> Vec<String> {
    STENCIL_EXTENSIONS.iter().map(|e| e.to_string()).collect()
}

fn default_database_path() -> PathBuf {
    PathBuf::from("data").join("stencil_cache.db")
}

impl ExplorerConfig {
    /// Load configuration from file.
    pub fn load(path: &std::path::Path) -> crate::error::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content).map_err(|e| {
            crate::error::StencilError::Config {
                message: format!("Failed to parse config: {}", e),
            }
        })?;
        Ok(config)
    }

    /// Load configuration from default paths.
    pub fn load_default() -> crate::error::Result<Self> {
        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("stencil-explorer").join("config.toml");
            if user_config.exists() {
                return Self::load(&user_config);
            }
        }

        let local_config = PathBuf::from("stencil-explorer.toml");
        if local_config.exists() {
            return Self::load(&local_config);
        }

        Ok(Self::default())
    }
}
