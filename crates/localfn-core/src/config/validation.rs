//! Validation rules for engine configuration

use crate::config::types::EngineConfig;
use crate::errors::EngineError;
use std::collections::HashSet;

impl EngineConfig {
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.namespace.trim().is_empty() {
            return Err(EngineError::ConfigError(
                "Namespace cannot be empty".to_string(),
            ));
        }

        if self
            .namespace
            .chars()
            .any(|c| !(c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.'))
        {
            return Err(EngineError::ConfigError(format!(
                "Namespace '{}' may only contain ASCII letters, digits, '-', '_' and '.'",
                self.namespace
            )));
        }

        if self.default_concurrency == 0 {
            return Err(EngineError::ConfigError(
                "default_concurrency must be greater than 0".to_string(),
            ));
        }

        if self.reap_interval_secs == 0 {
            return Err(EngineError::ConfigError(
                "reap_interval_secs must be greater than 0".to_string(),
            ));
        }

        if self.watch.poll_interval_millis == 0 {
            return Err(EngineError::ConfigError(
                "watch.poll_interval_millis must be greater than 0".to_string(),
            ));
        }

        if self.log_buffer_capacity == 0 {
            return Err(EngineError::ConfigError(
                "log_buffer_capacity must be greater than 0".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for function in &self.functions {
            function.validate()?;
            if !seen.insert(function.key()) {
                return Err(EngineError::ConfigError(format!(
                    "Duplicate function definition '{}'",
                    function.key()
                )));
            }
        }

        Ok(())
    }
}
