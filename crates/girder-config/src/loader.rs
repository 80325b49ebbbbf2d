//! Configuration Loader
//!
//! Handles loading and merging configuration from multiple sources with proper precedence.

use crate::bridge::{BridgeConfig, ViolationPolicy};
use crate::{ConfigError, ConfigResult};
use std::env;
use std::path::{Path, PathBuf};

/// Name of the project configuration file
pub const PROJECT_CONFIG_FILE: &str = "girder.toml";

/// Configuration loader
///
/// Loads configuration from multiple sources and merges them with proper precedence:
/// 1. Global config (~/.girder/config.toml) - lowest priority
/// 2. Project config (./girder.toml) - overrides global
/// 3. Environment variables (GIRDER_*) - overrides project
/// 4. Explicit overrides - highest priority (handled by caller via `BridgeConfig::merge`)
pub struct ConfigLoader {
    /// Cached global config path
    global_config_path: Option<PathBuf>,
}

/// Merged configuration result
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Effective configuration after merging every source
    pub bridge: BridgeConfig,

    /// Directory where girder.toml was found
    pub project_root: Option<PathBuf>,
}

impl ConfigLoader {
    /// Create a new configuration loader
    pub fn new() -> Self {
        Self {
            global_config_path: None,
        }
    }

    /// Create a loader that reads the global config from a custom location
    pub fn with_global_config_path(path: PathBuf) -> Self {
        Self {
            global_config_path: Some(path),
        }
    }

    /// Load configuration starting from the given directory
    ///
    /// Walks up the directory tree to find girder.toml, then merges it over
    /// the global config and applies environment overrides.
    pub fn load_from_directory(&mut self, start_dir: &Path) -> ConfigResult<Config> {
        let (project_root, project_config) = self.find_project_config(start_dir)?;
        self.assemble(project_config, project_root)
    }

    /// Load configuration from a specific project config file
    pub fn load_from_file(&mut self, config_path: &Path) -> ConfigResult<Config> {
        let project_config = BridgeConfig::load_from_file(config_path)?;
        let project_root = config_path.parent().map(|p| p.to_path_buf());
        self.assemble(project_config, project_root)
    }

    fn assemble(
        &mut self,
        project_config: BridgeConfig,
        project_root: Option<PathBuf>,
    ) -> ConfigResult<Config> {
        // Global config is optional; a broken one is still an error
        let mut bridge = match self.load_global_config() {
            Ok(config) => config,
            Err(ConfigError::HomeNotFound) => BridgeConfig::default(),
            Err(e) => return Err(e),
        };
        bridge.merge(&project_config);
        let bridge = self.apply_env_overrides(bridge)?;

        Ok(Config {
            bridge,
            project_root,
        })
    }

    /// Find project configuration by walking up directory tree
    fn find_project_config(
        &self,
        start_dir: &Path,
    ) -> ConfigResult<(Option<PathBuf>, BridgeConfig)> {
        let mut current = start_dir.to_path_buf();

        loop {
            let config_path = current.join(PROJECT_CONFIG_FILE);

            if config_path.exists() {
                let project_config = BridgeConfig::load_from_file(&config_path)?;
                return Ok((Some(current), project_config));
            }

            match current.parent() {
                Some(parent) => current = parent.to_path_buf(),
                None => return Ok((None, BridgeConfig::default())),
            }
        }
    }

    /// Load global configuration from ~/.girder/config.toml
    fn load_global_config(&mut self) -> ConfigResult<BridgeConfig> {
        let path = match &self.global_config_path {
            Some(path) => path.clone(),
            None => {
                let path = BridgeConfig::global_config_path()?;
                self.global_config_path = Some(path.clone());
                path
            }
        };

        if !path.exists() {
            return Ok(BridgeConfig::default());
        }

        BridgeConfig::load_from_file(&path)
    }

    /// Apply environment variable overrides
    ///
    /// Recognised variables:
    /// - GIRDER_LOG_LEVEL=<level>
    /// - GIRDER_LOG_JSON=true|1|yes
    /// - GIRDER_PROTOCOL_VIOLATION=abort|report
    /// - GIRDER_LIBRARY_PATH=<dir>[:<dir>...]
    fn apply_env_overrides(&self, mut config: BridgeConfig) -> ConfigResult<BridgeConfig> {
        let mut overrides = BridgeConfig::default();

        if let Ok(level) = env::var("GIRDER_LOG_LEVEL") {
            overrides.logging.get_or_insert_with(Default::default).level = Some(level);
        }

        if let Ok(json) = env::var("GIRDER_LOG_JSON") {
            let json = matches!(json.to_lowercase().as_str(), "true" | "1" | "yes");
            overrides.logging.get_or_insert_with(Default::default).json = Some(json);
        }

        if let Ok(policy) = env::var("GIRDER_PROTOCOL_VIOLATION") {
            let policy: ViolationPolicy = policy.parse()?;
            overrides = overrides.with_protocol_violation(policy);
        }

        if let Ok(paths) = env::var("GIRDER_LIBRARY_PATH") {
            let search_paths: Vec<PathBuf> = env::split_paths(&paths)
                .filter(|p| !p.as_os_str().is_empty())
                .collect();
            overrides
                .libraries
                .get_or_insert_with(Default::default)
                .search_paths = search_paths;
        }

        overrides.validate()?;
        config.merge(&overrides);
        Ok(config)
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl Config {
    /// Get the project root directory
    pub fn project_root(&self) -> Option<&Path> {
        self.project_root.as_deref()
    }

    /// Check if a girder.toml was found
    pub fn is_project(&self) -> bool {
        self.project_root.is_some()
    }

    /// Effective log level
    pub fn log_level(&self) -> &str {
        self.bridge.log_level()
    }
}
