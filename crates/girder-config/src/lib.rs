//! Girder Configuration System
//!
//! Provides configuration for the girder bridge runtime:
//! - Project configuration (girder.toml)
//! - Global user configuration (~/.girder/config.toml)
//! - Environment overrides (GIRDER_*)
//!
//! # Configuration Hierarchy
//!
//! Configuration is loaded and merged in the following order (later overrides earlier):
//! 1. Global config (~/.girder/config.toml)
//! 2. Project config (./girder.toml)
//! 3. Environment variables (GIRDER_*)
//! 4. Explicit overrides from the embedding application
//!
//! # Example
//!
//! ```no_run
//! use girder_config::ConfigLoader;
//! use std::path::Path;
//!
//! let mut loader = ConfigLoader::new();
//! let config = loader.load_from_directory(Path::new(".")).unwrap();
//! println!("log level: {}", config.log_level());
//! ```

pub mod bridge;
pub mod loader;

use std::path::PathBuf;
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {0}")]
    NotFound(PathBuf),

    #[error("Failed to read configuration file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Invalid TOML syntax in {file}: {error}")]
    TomlParseError {
        file: PathBuf,
        error: toml::de::Error,
    },

    #[error("Invalid value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("Home directory not found")]
    HomeNotFound,
}

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;

pub use bridge::{
    BridgeConfig, InvokeConfig, LibraryConfig, LifetimeConfig, LoggingConfig, ViolationPolicy,
};
pub use loader::{Config, ConfigLoader};
