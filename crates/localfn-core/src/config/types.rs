//! Configuration type definitions for the compute engine
//!
//! Every field carries a serde default so a minimal YAML file (or none at all)
//! yields a working engine. Durations are stored as plain integers in the unit
//! named by the field and exposed as `Duration` through accessor methods.

use crate::function::FunctionDefinition;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Label namespace marking containers owned by this engine.
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default = "default_staging_dir")]
    pub staging_dir: PathBuf,
    #[serde(default = "default_concurrency")]
    pub default_concurrency: usize,
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_reap_interval_secs")]
    pub reap_interval_secs: u64,
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,
    #[serde(default = "default_drain_grace_millis")]
    pub drain_grace_millis: u64,
    #[serde(default = "default_stop_timeout_secs")]
    pub stop_timeout_secs: u64,
    #[serde(default = "default_log_buffer_capacity")]
    pub log_buffer_capacity: usize,
    #[serde(default)]
    pub operation_log_file: Option<PathBuf>,
    #[serde(default)]
    pub watch: WatchConfig,
    /// Runtime identifier to image overrides, merged over the built-in map.
    #[serde(default)]
    pub images: BTreeMap<String, String>,
    #[serde(default = "default_true")]
    pub pull_images: bool,
    /// Service name to local endpoint URL, used for SDK redirection.
    #[serde(default)]
    pub service_endpoints: BTreeMap<String, String>,
    #[serde(default)]
    pub functions: Vec<FunctionDefinition>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_poll_interval_millis")]
    pub poll_interval_millis: u64,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_millis: default_poll_interval_millis(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            staging_dir: default_staging_dir(),
            default_concurrency: default_concurrency(),
            idle_timeout_secs: default_idle_timeout_secs(),
            reap_interval_secs: default_reap_interval_secs(),
            probe_timeout_secs: default_probe_timeout_secs(),
            drain_grace_millis: default_drain_grace_millis(),
            stop_timeout_secs: default_stop_timeout_secs(),
            log_buffer_capacity: default_log_buffer_capacity(),
            operation_log_file: None,
            watch: WatchConfig::default(),
            images: BTreeMap::new(),
            pull_images: true,
            service_endpoints: BTreeMap::new(),
            functions: Vec::new(),
        }
    }
}

impl EngineConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn drain_grace(&self) -> Duration {
        Duration::from_millis(self.drain_grace_millis)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.watch.poll_interval_millis)
    }
}

fn default_namespace() -> String {
    "localfn".to_string()
}

fn default_staging_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("localfn")
}

fn default_concurrency() -> usize {
    1
}

fn default_idle_timeout_secs() -> u64 {
    300
}

fn default_reap_interval_secs() -> u64 {
    30
}

fn default_probe_timeout_secs() -> u64 {
    5
}

fn default_drain_grace_millis() -> u64 {
    250
}

fn default_stop_timeout_secs() -> u64 {
    2
}

fn default_log_buffer_capacity() -> usize {
    1024
}

fn default_poll_interval_millis() -> u64 {
    500
}

fn default_true() -> bool {
    true
}
