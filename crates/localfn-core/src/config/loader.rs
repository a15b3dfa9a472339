//! Configuration loader for YAML files and environment overrides
//!
//! Loading happens in three steps: parse the YAML, apply `LOCALFN_*`
//! environment overrides, validate. Relative function code paths are resolved
//! against the directory holding the configuration file.

use crate::config::types::EngineConfig;
use crate::errors::EngineError;
use std::env;
use std::path::{Path, PathBuf};
use tokio::fs;

pub const ENV_NAMESPACE: &str = "LOCALFN_NAMESPACE";
pub const ENV_STAGING_DIR: &str = "LOCALFN_STAGING_DIR";
pub const ENV_DEFAULT_CONCURRENCY: &str = "LOCALFN_DEFAULT_CONCURRENCY";
pub const ENV_IDLE_TIMEOUT_SECS: &str = "LOCALFN_IDLE_TIMEOUT_SECS";
pub const ENV_WATCH: &str = "LOCALFN_WATCH";

/// Configuration loader with environment resolution
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from a YAML file
    pub async fn from_file<P: AsRef<Path>>(path: P) -> Result<EngineConfig, EngineError> {
        let path = path.as_ref();

        let content = fs::read_to_string(path).await.map_err(|e| {
            EngineError::ConfigError(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;

        Self::from_str(&content, path.parent())
    }

    /// Load configuration from a file if it exists, otherwise start from defaults.
    pub async fn from_file_or_default<P: AsRef<Path>>(
        path: P,
    ) -> Result<EngineConfig, EngineError> {
        let path = path.as_ref();
        if fs::metadata(path).await.is_ok() {
            return Self::from_file(path).await;
        }
        log::debug!(
            "No config file at {}, using defaults",
            path.display()
        );
        let mut config = EngineConfig::default();
        Self::apply_env_overrides(&mut config)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML string
    pub fn from_str(content: &str, base_dir: Option<&Path>) -> Result<EngineConfig, EngineError> {
        let mut config: EngineConfig = if content.trim().is_empty() {
            EngineConfig::default()
        } else {
            serde_yaml::from_str(content).map_err(|e| {
                EngineError::ConfigError(format!("Failed to parse YAML config: {}", e))
            })?
        };

        if let Some(base_dir) = base_dir {
            Self::resolve_paths(&mut config, base_dir);
        }

        Self::apply_env_overrides(&mut config)?;

        config.validate()?;

        Ok(config)
    }

    fn resolve_paths(config: &mut EngineConfig, base_dir: &Path) {
        let absolute = |path: &PathBuf| -> PathBuf {
            if path.is_absolute() {
                path.clone()
            } else {
                base_dir.join(path)
            }
        };

        for function in &mut config.functions {
            function.code_path = absolute(&function.code_path);
            function.layers = function.layers.iter().map(absolute).collect();
        }
        if let Some(file) = &config.operation_log_file {
            config.operation_log_file = Some(absolute(file));
        }
    }

    /// Apply `LOCALFN_*` overrides on top of the parsed configuration
    pub fn apply_env_overrides(config: &mut EngineConfig) -> Result<(), EngineError> {
        if let Ok(namespace) = env::var(ENV_NAMESPACE) {
            config.namespace = namespace;
        }
        if let Ok(dir) = env::var(ENV_STAGING_DIR) {
            config.staging_dir = PathBuf::from(dir);
        }
        if let Ok(value) = env::var(ENV_DEFAULT_CONCURRENCY) {
            config.default_concurrency = parse_env(ENV_DEFAULT_CONCURRENCY, &value)?;
        }
        if let Ok(value) = env::var(ENV_IDLE_TIMEOUT_SECS) {
            config.idle_timeout_secs = parse_env(ENV_IDLE_TIMEOUT_SECS, &value)?;
        }
        if let Ok(value) = env::var(ENV_WATCH) {
            config.watch.enabled = !matches!(
                value.trim().to_lowercase().as_str(),
                "0" | "false" | "no" | "off"
            );
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, EngineError> {
    value.trim().parse().map_err(|_| {
        EngineError::ConfigError(format!(
            "Invalid value '{}' for environment variable {}",
            value, name
        ))
    })
}
