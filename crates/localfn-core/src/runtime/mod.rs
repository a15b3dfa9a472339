//! Container runtime abstraction.
//!
//! The engine never talks to Docker directly; everything goes through
//! [`ContainerRuntime`] so the pool and protocol handler can be exercised
//! against an in-memory runtime and so a missing daemon surfaces as a
//! [`RuntimeError::Unavailable`] rather than a panic.

use crate::errors::RuntimeError;
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::time::Duration;

pub mod docker;

#[derive(Debug, Clone, PartialEq)]
pub struct Mount {
    pub host_path: PathBuf,
    pub container_path: String,
    pub read_only: bool,
}

impl Mount {
    pub fn read_only(host_path: PathBuf, container_path: &str) -> Self {
        Self {
            host_path,
            container_path: container_path.to_string(),
            read_only: true,
        }
    }

    /// Docker `binds` representation.
    pub fn to_bind(&self) -> String {
        let mut bind = format!("{}:{}", self.host_path.display(), self.container_path);
        if self.read_only {
            bind.push_str(":ro");
        }
        bind
    }
}

/// Everything needed to create one sandbox container.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    pub working_dir: Option<String>,
    pub env: BTreeMap<String, String>,
    pub labels: HashMap<String, String>,
    pub mounts: Vec<Mount>,
    pub memory_mb: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct ContainerInfo {
    pub id: String,
    pub name: Option<String>,
    pub labels: HashMap<String, String>,
    pub running: bool,
}

/// A process started inside a running container.
#[derive(Debug, Clone, Default)]
pub struct ExecRequest {
    pub command: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub working_dir: Option<String>,
    /// Bytes written to the process's stdin right after it starts.
    pub stdin: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecChunk {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
}

/// Output of an exec'd process. The stream ends when the process exits and
/// all of its output has been delivered.
pub struct ExecSession {
    pub id: String,
    pub output: BoxStream<'static, Result<ExecChunk, RuntimeError>>,
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Trivial round trip used as the availability probe.
    async fn ping(&self) -> Result<(), RuntimeError>;

    /// Make sure the image is present locally, pulling it if needed.
    async fn ensure_image(&self, image: &str) -> Result<(), RuntimeError>;

    /// Create a container and return its identifier.
    async fn create(&self, spec: &ContainerSpec) -> Result<String, RuntimeError>;

    async fn start(&self, container_id: &str) -> Result<(), RuntimeError>;

    async fn stop(&self, container_id: &str, timeout: Duration) -> Result<(), RuntimeError>;

    /// Force-remove a container. Returns `NotFound` if it is already gone.
    async fn remove(&self, container_id: &str) -> Result<(), RuntimeError>;

    async fn exec(
        &self,
        container_id: &str,
        request: ExecRequest,
    ) -> Result<ExecSession, RuntimeError>;

    /// Exit code of a finished exec, `None` while it is still running.
    async fn exec_exit_code(&self, exec_id: &str) -> Result<Option<i64>, RuntimeError>;

    /// Containers (running or not) carrying all of the given labels.
    async fn list(&self, labels: &[(String, String)]) -> Result<Vec<ContainerInfo>, RuntimeError>;
}
