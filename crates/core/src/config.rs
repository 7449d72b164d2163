//! Configuration for a launch-drop run
//!
//! Configuration can be loaded from a TOML file and/or environment variables.
//! Command line flags are applied on top by the binary.

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Main configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Tap placement and admission policy
    #[serde(default)]
    pub tap: TapConfig,

    /// Operator output
    #[serde(default)]
    pub output: OutputConfig,
}

/// Tap configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TapConfig {
    /// Stage whose output edge gets tapped; no tap when unset
    #[serde(default)]
    pub target: Option<String>,

    /// Buffers passed through before the discard window
    #[serde(default = "default_allow_count")]
    pub allow_count: u64,

    /// Buffers discarded after the allow window
    #[serde(default = "default_drop_count")]
    pub drop_count: u64,

    /// Ask upstream for a key unit when the discard window closes
    #[serde(default)]
    pub request_sync_point: bool,
}

fn default_allow_count() -> u64 {
    0
}

fn default_drop_count() -> u64 {
    20
}

impl Default for TapConfig {
    fn default() -> Self {
        Self {
            target: None,
            allow_count: default_allow_count(),
            drop_count: default_drop_count(),
            request_sync_point: false,
        }
    }
}

impl TapConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(target) = &self.target {
            if target.trim().is_empty() {
                return Err(ConfigError::Invalid("tap target must not be empty".to_string()));
            }
        }
        Ok(())
    }
}

/// Output configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Print property change notifications
    #[serde(default)]
    pub verbose: bool,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::Io(e.to_string()))?;
        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.tap.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_vars(|key| std::env::var(key).ok())
    }

    fn apply_vars<F>(&mut self, var: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(target) = var("LAUNCH_DROP_TARGET") {
            self.tap.target = Some(target);
        }
        if let Some(allow) = var("LAUNCH_DROP_ALLOW") {
            self.tap.allow_count = parse_var("LAUNCH_DROP_ALLOW", &allow)?;
        }
        if let Some(drop) = var("LAUNCH_DROP_DROP") {
            self.tap.drop_count = parse_var("LAUNCH_DROP_DROP", &drop)?;
        }
        if let Some(sync) = var("LAUNCH_DROP_REQUEST_SYNC_POINT") {
            self.tap.request_sync_point = parse_flag("LAUNCH_DROP_REQUEST_SYNC_POINT", &sync)?;
        }
        if let Some(verbose) = var("LAUNCH_DROP_VERBOSE") {
            self.output.verbose = parse_flag("LAUNCH_DROP_VERBOSE", &verbose)?;
        }
        self.tap.validate()
    }

    /// Load configuration from file if it exists, then apply the environment
    pub fn load<P: AsRef<Path>>(path: Option<P>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) if p.as_ref().exists() => Self::from_file(p)?,
            Some(p) => {
                tracing::warn!(path = %p.as_ref().display(), "Config file not found, using defaults");
                Self::default()
            }
            None => Self::default(),
        };
        config.apply_env()?;
        Ok(config)
    }
}

fn parse_var(key: &str, value: &str) -> Result<u64, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::Invalid(format!("{key}: expected a non-negative integer, got '{value}'")))
}

fn parse_flag(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(ConfigError::Invalid(format!("{key}: expected a boolean, got '{value}'"))),
    }
}

/// Configuration error types
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.tap.target, None);
        assert_eq!(config.tap.allow_count, 0);
        assert_eq!(config.tap.drop_count, 20);
        assert!(!config.tap.request_sync_point);
        assert!(!config.output.verbose);
    }

    #[test]
    fn test_config_from_toml() {
        let toml = r#"
[tap]
target = "encoder"
allow_count = 5
request_sync_point = true

[output]
verbose = true
"#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.tap.target.as_deref(), Some("encoder"));
        assert_eq!(config.tap.allow_count, 5);
        assert_eq!(config.tap.drop_count, 20);
        assert!(config.tap.request_sync_point);
        assert!(config.output.verbose);
    }

    #[test]
    fn test_config_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[tap]\ntarget = \"enc\"\ndrop_count = 3").unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.tap.target.as_deref(), Some("enc"));
        assert_eq!(config.tap.drop_count, 3);
    }

    #[test]
    fn test_config_rejects_empty_target() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[tap]\ntarget = \"  \"").unwrap();

        let err = Config::from_file(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_config_parse_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[tap]\ndrop_count = \"many\"").unwrap();

        let err = Config::from_file(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("LAUNCH_DROP_TARGET", "encoder"),
            ("LAUNCH_DROP_DROP", "7"),
            ("LAUNCH_DROP_REQUEST_SYNC_POINT", "yes"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config
            .apply_vars(|key| vars.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.tap.target.as_deref(), Some("encoder"));
        assert_eq!(config.tap.allow_count, 0);
        assert_eq!(config.tap.drop_count, 7);
        assert!(config.tap.request_sync_point);
    }

    #[test]
    fn test_env_rejects_bad_values() {
        let mut config = Config::default();
        let err = config
            .apply_vars(|key| (key == "LAUNCH_DROP_ALLOW").then(|| "-1".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }
}
