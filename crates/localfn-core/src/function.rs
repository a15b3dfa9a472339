//! Function definitions and the collaborators that supply them
//!
//! The deployment-descriptor parser lives outside this crate; the engine only
//! consumes resolved [`FunctionDefinition`]s through [`FunctionProvider`] and
//! asks an [`EnvironmentBuilder`] for the variables that redirect SDK calls to
//! the locally emulated services.

use crate::errors::EngineError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

pub const LATEST_VERSION: &str = "$LATEST";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FunctionDefinition {
    pub name: String,
    #[serde(default = "default_version")]
    pub version: String,
    pub runtime: String,
    pub code_path: PathBuf,
    pub handler: String,
    #[serde(default = "default_memory_mb")]
    pub memory_mb: u64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    /// Per-function override of the pool's default concurrency limit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<usize>,
    /// Layer directories merged into `/opt`, later entries win.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub layers: Vec<PathBuf>,
}

fn default_version() -> String {
    LATEST_VERSION.to_string()
}

fn default_memory_mb() -> u64 {
    128
}

fn default_timeout_secs() -> u64 {
    3
}

impl FunctionDefinition {
    pub fn new(
        name: impl Into<String>,
        runtime: impl Into<String>,
        code_path: impl Into<PathBuf>,
        handler: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            version: default_version(),
            runtime: runtime.into(),
            code_path: code_path.into(),
            handler: handler.into(),
            memory_mb: default_memory_mb(),
            timeout_secs: default_timeout_secs(),
            environment: BTreeMap::new(),
            concurrency: None,
            layers: Vec::new(),
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn with_timeout_secs(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }

    pub fn with_memory_mb(mut self, memory_mb: u64) -> Self {
        self.memory_mb = memory_mb;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = Some(concurrency);
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }

    pub fn with_layer(mut self, layer: impl Into<PathBuf>) -> Self {
        self.layers.push(layer.into());
        self
    }

    pub fn key(&self) -> FunctionKey {
        FunctionKey::new(&self.name, &self.version)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.name.trim().is_empty() {
            return Err(EngineError::ConfigError(
                "Function name cannot be empty".to_string(),
            ));
        }
        if self.handler.trim().is_empty() {
            return Err(EngineError::ConfigError(format!(
                "Function '{}' has an empty handler",
                self.name
            )));
        }
        if self.timeout_secs == 0 {
            return Err(EngineError::ConfigError(format!(
                "Function '{}' timeout must be greater than 0",
                self.name
            )));
        }
        if self.memory_mb == 0 {
            return Err(EngineError::ConfigError(format!(
                "Function '{}' memory must be greater than 0",
                self.name
            )));
        }
        if self.concurrency == Some(0) {
            return Err(EngineError::ConfigError(format!(
                "Function '{}' concurrency must be greater than 0",
                self.name
            )));
        }
        Ok(())
    }
}

/// Identity of a function version inside the engine.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FunctionKey {
    pub name: String,
    pub version: String,
}

impl FunctionKey {
    pub fn new(name: &str, version: &str) -> Self {
        Self {
            name: name.to_string(),
            version: version.to_string(),
        }
    }
}

impl fmt::Display for FunctionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.version)
    }
}

/// Source of function definitions, normally backed by a deployment descriptor.
#[async_trait]
pub trait FunctionProvider: Send + Sync {
    /// Resolve a function by logical name. `None` means the latest version.
    async fn resolve(
        &self,
        name: &str,
        version: Option<&str>,
    ) -> Result<Arc<FunctionDefinition>, EngineError>;

    /// All known definitions, used to decide which source trees to watch.
    fn list(&self) -> Vec<Arc<FunctionDefinition>>;
}

/// Provider over a fixed set of definitions, e.g. the `functions` list of the
/// engine configuration file.
#[derive(Debug, Default)]
pub struct StaticFunctionProvider {
    functions: HashMap<FunctionKey, Arc<FunctionDefinition>>,
}

impl StaticFunctionProvider {
    pub fn new(definitions: Vec<FunctionDefinition>) -> Self {
        let functions = definitions
            .into_iter()
            .map(|def| (def.key(), Arc::new(def)))
            .collect();
        Self { functions }
    }
}

#[async_trait]
impl FunctionProvider for StaticFunctionProvider {
    async fn resolve(
        &self,
        name: &str,
        version: Option<&str>,
    ) -> Result<Arc<FunctionDefinition>, EngineError> {
        let version = version.unwrap_or(LATEST_VERSION);
        self.functions
            .get(&FunctionKey::new(name, version))
            .cloned()
            .ok_or_else(|| EngineError::FunctionNotFound {
                name: name.to_string(),
                version: version.to_string(),
            })
    }

    fn list(&self) -> Vec<Arc<FunctionDefinition>> {
        let mut all: Vec<_> = self.functions.values().cloned().collect();
        all.sort_by(|a, b| a.key().cmp(&b.key()));
        all
    }
}

/// Builds the service-redirection variables merged into every sandbox.
pub trait EnvironmentBuilder: Send + Sync {
    fn build_env(&self, definition: &FunctionDefinition) -> BTreeMap<String, String>;
}

/// Redirects SDK endpoints to locally emulated services.
///
/// Each configured service becomes `AWS_ENDPOINT_URL_<SERVICE>`; a service
/// named `default` becomes the global `AWS_ENDPOINT_URL`. Loopback hosts are
/// rewritten to `host.docker.internal` because `localhost` inside a container
/// is the container itself.
#[derive(Debug, Clone)]
pub struct EndpointEnvironment {
    endpoints: BTreeMap<String, String>,
    region: String,
    rewrite_loopback: bool,
}

pub const CONTAINER_HOST_ALIAS: &str = "host.docker.internal";

impl EndpointEnvironment {
    pub fn new(endpoints: BTreeMap<String, String>) -> Self {
        Self {
            endpoints,
            region: "us-east-1".to_string(),
            rewrite_loopback: true,
        }
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = region.into();
        self
    }

    pub fn with_loopback_rewrite(mut self, enabled: bool) -> Self {
        self.rewrite_loopback = enabled;
        self
    }

    fn container_url(&self, url: &str) -> String {
        if !self.rewrite_loopback {
            return url.to_string();
        }
        ["localhost", "127.0.0.1", "[::1]"]
            .iter()
            .find_map(|host| {
                let (scheme, rest) = url.split_once("://")?;
                let tail = rest.strip_prefix(host)?;
                if tail.is_empty() || tail.starts_with(':') || tail.starts_with('/') {
                    Some(format!("{}://{}{}", scheme, CONTAINER_HOST_ALIAS, tail))
                } else {
                    None
                }
            })
            .unwrap_or_else(|| url.to_string())
    }
}

impl EnvironmentBuilder for EndpointEnvironment {
    fn build_env(&self, _definition: &FunctionDefinition) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        if self.endpoints.is_empty() {
            return env;
        }
        for (service, url) in &self.endpoints {
            let key = if service == "default" {
                "AWS_ENDPOINT_URL".to_string()
            } else {
                format!(
                    "AWS_ENDPOINT_URL_{}",
                    service.to_uppercase().replace(['-', ' '], "_")
                )
            };
            env.insert(key, self.container_url(url));
        }
        env.insert("AWS_REGION".to_string(), self.region.clone());
        env.insert("AWS_DEFAULT_REGION".to_string(), self.region.clone());
        // Dummy credentials keep SDKs from looking for real ones.
        env.insert("AWS_ACCESS_KEY_ID".to_string(), "test".to_string());
        env.insert("AWS_SECRET_ACCESS_KEY".to_string(), "test".to_string());
        env
    }
}
