//! Bridge Configuration (girder.toml / ~/.girder/config.toml)
//!
//! The project file and the global file share one schema. Every key is
//! optional; the accessors on [`BridgeConfig`] supply the defaults.

use crate::{ConfigError, ConfigResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Bridge configuration as read from a TOML file
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct BridgeConfig {
    /// Logging settings
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,

    /// Object lifetime bridge settings
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lifetime: Option<LifetimeConfig>,

    /// Call invocation settings
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invoke: Option<InvokeConfig>,

    /// Native library lookup
    #[serde(skip_serializing_if = "Option::is_none")]
    pub libraries: Option<LibraryConfig>,
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// Level filter ("trace", "debug", "info", "warn", "error")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,

    /// Emit JSON lines instead of human-readable output
    #[serde(skip_serializing_if = "Option::is_none")]
    pub json: Option<bool>,
}

/// Object lifetime bridge settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct LifetimeConfig {
    /// What to do on a broken refcount protocol ("abort" or "report")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol_violation: Option<String>,
}

/// Call invocation settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct InvokeConfig {
    /// Warn when a script passes more arguments than a callable accepts
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warn_extra_arguments: Option<bool>,
}

/// Native library lookup
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct LibraryConfig {
    /// Extra directories searched before the platform defaults
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub search_paths: Vec<PathBuf>,
}

/// Policy applied when the refcount/trampoline protocol is violated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ViolationPolicy {
    /// Log the violation and abort the process
    #[default]
    Abort,
    /// Log the violation, drop the offending operation and return an error
    Report,
}

impl ViolationPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ViolationPolicy::Abort => "abort",
            ViolationPolicy::Report => "report",
        }
    }
}

impl fmt::Display for ViolationPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ViolationPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "abort" => Ok(ViolationPolicy::Abort),
            "report" => Ok(ViolationPolicy::Report),
            other => Err(ConfigError::InvalidValue {
                field: "lifetime.protocol_violation".to_string(),
                reason: format!("must be 'abort' or 'report', got '{}'", other),
            }),
        }
    }
}

impl BridgeConfig {
    /// Load configuration from a file
    pub fn load_from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::NotFound(path.to_path_buf())
            } else {
                ConfigError::IoError(e)
            }
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::TomlParseError {
            file: path.to_path_buf(),
            error: e,
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Validate values that serde cannot check on its own
    pub fn validate(&self) -> ConfigResult<()> {
        if let Some(level) = self.logging.as_ref().and_then(|l| l.level.as_deref()) {
            validate_log_level(level)?;
        }

        if let Some(policy) = self
            .lifetime
            .as_ref()
            .and_then(|l| l.protocol_violation.as_deref())
        {
            policy.parse::<ViolationPolicy>()?;
        }

        Ok(())
    }

    /// Get the global config file path (~/.girder/config.toml)
    pub fn global_config_path() -> ConfigResult<PathBuf> {
        let home = dirs::home_dir().ok_or(ConfigError::HomeNotFound)?;
        Ok(home.join(".girder").join("config.toml"))
    }

    /// Effective log level (default: "info")
    pub fn log_level(&self) -> &str {
        self.logging
            .as_ref()
            .and_then(|l| l.level.as_deref())
            .unwrap_or("info")
    }

    /// Whether logs are emitted as JSON (default: false)
    pub fn log_json(&self) -> bool {
        self.logging.as_ref().and_then(|l| l.json).unwrap_or(false)
    }

    /// Effective protocol violation policy (default: abort)
    ///
    /// Values are validated on load, so an unparsable value can only come from
    /// a config built in code; it falls back to the default.
    pub fn protocol_violation(&self) -> ViolationPolicy {
        self.lifetime
            .as_ref()
            .and_then(|l| l.protocol_violation.as_deref())
            .and_then(|p| p.parse().ok())
            .unwrap_or_default()
    }

    /// Whether extra scripting arguments produce a warning (default: true)
    pub fn warn_extra_arguments(&self) -> bool {
        self.invoke
            .as_ref()
            .and_then(|i| i.warn_extra_arguments)
            .unwrap_or(true)
    }

    /// Library search paths in priority order
    pub fn library_search_paths(&self) -> &[PathBuf] {
        self.libraries
            .as_ref()
            .map(|l| l.search_paths.as_slice())
            .unwrap_or(&[])
    }

    /// Set the protocol violation policy
    pub fn with_protocol_violation(mut self, policy: ViolationPolicy) -> Self {
        self.lifetime
            .get_or_insert_with(Default::default)
            .protocol_violation = Some(policy.as_str().to_string());
        self
    }

    /// Merge another config into this one
    ///
    /// Keys set in `other` take precedence; search paths from `other` are
    /// placed in front of the existing ones.
    pub fn merge(&mut self, other: &BridgeConfig) {
        if let Some(logging) = &other.logging {
            let target = self.logging.get_or_insert_with(Default::default);
            if logging.level.is_some() {
                target.level = logging.level.clone();
            }
            if logging.json.is_some() {
                target.json = logging.json;
            }
        }
        if let Some(lifetime) = &other.lifetime {
            if lifetime.protocol_violation.is_some() {
                self.lifetime
                    .get_or_insert_with(Default::default)
                    .protocol_violation = lifetime.protocol_violation.clone();
            }
        }
        if let Some(invoke) = &other.invoke {
            if invoke.warn_extra_arguments.is_some() {
                self.invoke
                    .get_or_insert_with(Default::default)
                    .warn_extra_arguments = invoke.warn_extra_arguments;
            }
        }
        if let Some(libraries) = &other.libraries {
            let target = self.libraries.get_or_insert_with(Default::default);
            let mut paths = libraries.search_paths.clone();
            paths.extend(target.search_paths.drain(..));
            target.search_paths = paths;
        }
    }
}

/// Validate a log level string
fn validate_log_level(level: &str) -> ConfigResult<()> {
    if !matches!(
        level.to_lowercase().as_str(),
        "trace" | "debug" | "info" | "warn" | "error"
    ) {
        return Err(ConfigError::InvalidValue {
            field: "logging.level".to_string(),
            reason: format!(
                "must be one of trace, debug, info, warn, error; got '{}'",
                level
            ),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_config() {
        let toml = r#"
[logging]
level = "debug"
"#;

        let config: BridgeConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.log_level(), "debug");
        assert!(!config.log_json());
    }

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
[logging]
level = "warn"
json = true

[lifetime]
protocol_violation = "report"

[invoke]
warn_extra_arguments = false

[libraries]
search_paths = ["/opt/girder/lib"]
"#;

        let config: BridgeConfig = toml::from_str(toml).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.protocol_violation(), ViolationPolicy::Report);
        assert!(!config.warn_extra_arguments());
        assert_eq!(
            config.library_search_paths(),
            &[PathBuf::from("/opt/girder/lib")]
        );
    }

    #[test]
    fn test_defaults() {
        let config = BridgeConfig::default();
        assert_eq!(config.log_level(), "info");
        assert_eq!(config.protocol_violation(), ViolationPolicy::Abort);
        assert!(config.warn_extra_arguments());
        assert!(config.library_search_paths().is_empty());
    }

    #[test]
    fn test_invalid_policy_value() {
        let config = BridgeConfig {
            lifetime: Some(LifetimeConfig {
                protocol_violation: Some("ignore".to_string()),
            }),
            ..Default::default()
        };

        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_invalid_log_level() {
        let config = BridgeConfig {
            logging: Some(LoggingConfig {
                level: Some("loud".to_string()),
                json: None,
            }),
            ..Default::default()
        };

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_field_rejected() {
        let toml = r#"
[logging]
colour = true
"#;
        assert!(toml::from_str::<BridgeConfig>(toml).is_err());
    }

    #[test]
    fn test_merge_configs() {
        let mut base = BridgeConfig {
            logging: Some(LoggingConfig {
                level: Some("info".to_string()),
                json: Some(true),
            }),
            libraries: Some(LibraryConfig {
                search_paths: vec![PathBuf::from("/usr/lib/girder")],
            }),
            ..Default::default()
        };
        let overrides = BridgeConfig {
            logging: Some(LoggingConfig {
                level: Some("trace".to_string()),
                json: None,
            }),
            libraries: Some(LibraryConfig {
                search_paths: vec![PathBuf::from("/home/me/lib")],
            }),
            ..Default::default()
        }
        .with_protocol_violation(ViolationPolicy::Report);

        base.merge(&overrides);
        assert_eq!(base.log_level(), "trace");
        assert!(base.log_json());
        assert_eq!(base.protocol_violation(), ViolationPolicy::Report);
        assert_eq!(
            base.library_search_paths(),
            &[
                PathBuf::from("/home/me/lib"),
                PathBuf::from("/usr/lib/girder")
            ]
        );
    }
}
