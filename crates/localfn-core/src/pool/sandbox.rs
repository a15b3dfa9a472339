//! Sandbox records and the opaque lease handed to callers of `acquire`

use super::SandboxPool;
use crate::function::{FunctionDefinition, FunctionKey};
use crate::image::layout::StagedLayout;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::OwnedSemaphorePermit;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Occupancy {
    Idle,
    Busy,
    /// Finishing its current invocation; destroyed on release.
    Draining,
    Dead,
}

/// Registry entry for one live container. Owned by the pool.
#[derive(Debug)]
pub(crate) struct Sandbox {
    pub container_id: String,
    pub created_at: DateTime<Utc>,
    pub last_used: Instant,
    pub occupancy: Occupancy,
    pub epoch: u64,
    pub invocations: u64,
    pub memory_mb: u64,
    pub invoke_command: Vec<String>,
    // Keeps the staged code snapshot on disk for as long as the container
    // may read it.
    pub layout: Arc<StagedLayout>,
}

/// Point-in-time view of a sandbox for status output.
#[derive(Debug, Clone, Serialize)]
pub struct SandboxInfo {
    pub function: String,
    pub version: String,
    pub container_id: String,
    pub occupancy: Occupancy,
    pub created_at: DateTime<Utc>,
    pub idle_for: Duration,
    pub invocations: u64,
    pub memory_mb: u64,
    pub generation: u64,
}

impl SandboxInfo {
    pub(crate) fn from_sandbox(key: &FunctionKey, sandbox: &Sandbox) -> Self {
        Self {
            function: key.name.clone(),
            version: key.version.clone(),
            container_id: sandbox.container_id.clone(),
            occupancy: sandbox.occupancy,
            created_at: sandbox.created_at,
            idle_for: sandbox.last_used.elapsed(),
            invocations: sandbox.invocations,
            memory_mb: sandbox.memory_mb,
            generation: sandbox.layout.generation(),
        }
    }
}

/// Exclusive use of one busy sandbox for one invocation.
///
/// Hand it back with [`SandboxPool::release`]. A lease dropped without being
/// released counts as unhealthy and its sandbox is destroyed.
pub struct SandboxLease {
    pub(crate) pool: SandboxPool,
    pub(crate) key: FunctionKey,
    pub(crate) container_id: String,
    pub(crate) invoke_command: Vec<String>,
    pub(crate) definition: Arc<FunctionDefinition>,
    pub(crate) cold_start: bool,
    pub(crate) permit: Option<OwnedSemaphorePermit>,
    pub(crate) released: bool,
}

impl SandboxLease {
    pub fn container_id(&self) -> &str {
        &self.container_id
    }

    pub fn invoke_command(&self) -> &[String] {
        &self.invoke_command
    }

    pub fn definition(&self) -> &Arc<FunctionDefinition> {
        &self.definition
    }

    pub fn key(&self) -> &FunctionKey {
        &self.key
    }

    /// True when this acquire had to create the container.
    pub fn cold_start(&self) -> bool {
        self.cold_start
    }
}

impl std::fmt::Debug for SandboxLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxLease")
            .field("key", &self.key)
            .field("container_id", &self.container_id)
            .field("cold_start", &self.cold_start)
            .finish()
    }
}

impl Drop for SandboxLease {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        log::warn!(
            "Lease on sandbox {} for {} dropped without release; destroying it",
            self.container_id,
            self.key
        );
        let orphan = SandboxLease {
            pool: self.pool.clone(),
            key: self.key.clone(),
            container_id: std::mem::take(&mut self.container_id),
            invoke_command: Vec::new(),
            definition: self.definition.clone(),
            cold_start: self.cold_start,
            permit: self.permit.take(),
            released: false,
        };
        self.released = true;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    let pool = orphan.pool.clone();
                    pool.release(orphan, false).await;
                });
            }
            Err(_) => {
                // No runtime to clean up on; the stale reap catches it later.
                let mut orphan = orphan;
                orphan.released = true;
            }
        }
    }
}

/// A container that exists in the runtime but is not in the registry yet.
/// Dropped while still armed (the acquiring caller went away mid-start), it
/// stops shielding the container from the stale reap and removes it in the
/// background.
pub(crate) struct StartingContainer {
    pool: SandboxPool,
    container_id: String,
    armed: bool,
}

impl StartingContainer {
    pub(crate) fn new(pool: SandboxPool, container_id: String) -> Self {
        Self {
            pool,
            container_id,
            armed: true,
        }
    }

    pub(crate) fn id(&self) -> &str {
        &self.container_id
    }

    /// Take ownership of the container id; nothing is cleaned up on drop.
    pub(crate) fn disarm(mut self) -> String {
        self.armed = false;
        std::mem::take(&mut self.container_id)
    }
}

impl Drop for StartingContainer {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let container_id = std::mem::take(&mut self.container_id);
        log::warn!(
            "Sandbox {} abandoned while starting; removing it",
            container_id
        );
        self.pool.forget_starting(&container_id);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let pool = self.pool.clone();
                handle.spawn(async move { pool.remove_abandoned(&container_id).await });
            }
            Err(_) => {
                log::debug!(
                    "No runtime to remove {}; the stale reap will pick it up",
                    container_id
                );
            }
        }
    }
}
