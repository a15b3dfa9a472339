//! Sandbox pool.
//!
//! The registry of live sandbox containers is the only shared mutable state in
//! the engine. It sits behind one mutex, keyed by function version and then by
//! container id, and every mutation happens inside `acquire`, `release`,
//! `retire` and `reap_stale`. Container runtime calls and operation log
//! emission always happen with the lock released.
//!
//! Concurrency per function version is bounded by a semaphore: callers beyond
//! the limit wait in `acquire` instead of being rejected, and the permit is
//! only returned once the released sandbox is either idle again or fully
//! destroyed, so a replacement never races its predecessor.

mod sandbox;


pub use sandbox::{Occupancy, SandboxInfo, SandboxLease};

use sandbox::StartingContainer;

use crate::config::EngineConfig;
use crate::errors::{EngineError, InvocationError, RuntimeError};
use crate::function::{FunctionDefinition, FunctionKey};
use crate::image::catalog::TASK_ROOT;
use crate::image::layout::sanitize_component;
use crate::image::{ImageResolver, PreparedSandbox};
use crate::oplog::{OperationCategory, OperationLog};
use crate::runtime::{ContainerRuntime, ContainerSpec};
use chrono::Utc;
use sandbox::Sandbox;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;

#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub namespace: String,
    pub default_concurrency: usize,
    pub idle_timeout: Duration,
    pub stop_timeout: Duration,
    pub probe_timeout: Duration,
    pub pull_images: bool,
}

impl PoolSettings {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            namespace: config.namespace.clone(),
            default_concurrency: config.default_concurrency,
            idle_timeout: config.idle_timeout(),
            stop_timeout: config.stop_timeout(),
            probe_timeout: config.probe_timeout(),
            pull_images: config.pull_images,
        }
    }

    fn label(&self, suffix: &str) -> String {
        format!("{}.{}", self.namespace, suffix)
    }
}

struct Slot {
    limiter: Arc<Semaphore>,
    concurrency: usize,
    /// Bumped by `retire`; sandboxes from an older epoch are never reused.
    epoch: u64,
    sandboxes: HashMap<String, Sandbox>,
}

impl Slot {
    fn new(concurrency: usize) -> Self {
        Self {
            limiter: Arc::new(Semaphore::new(concurrency)),
            concurrency,
            epoch: 0,
            sandboxes: HashMap::new(),
        }
    }
}

#[derive(Default)]
struct Registry {
    slots: HashMap<FunctionKey, Slot>,
    /// Containers created but not yet registered, so `reap_stale` spares them.
    starting: HashSet<String>,
    closed: bool,
}

struct PoolInner {
    runtime: Arc<dyn ContainerRuntime>,
    resolver: Arc<ImageResolver>,
    oplog: OperationLog,
    settings: PoolSettings,
    registry: Mutex<Registry>,
    available: AtomicBool,
    unavailable_reason: Mutex<Option<String>>,
}

#[derive(Clone)]
pub struct SandboxPool {
    inner: Arc<PoolInner>,
}

impl SandboxPool {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        resolver: Arc<ImageResolver>,
        oplog: OperationLog,
        settings: PoolSettings,
    ) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                runtime,
                resolver,
                oplog,
                settings,
                registry: Mutex::new(Registry::default()),
                available: AtomicBool::new(true),
                unavailable_reason: Mutex::new(None),
            }),
        }
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.inner.settings
    }

    pub fn resolver(&self) -> &Arc<ImageResolver> {
        &self.inner.resolver
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        match self.inner.registry.lock() {
            Ok(registry) => registry,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn is_available(&self) -> bool {
        self.inner.available.load(Ordering::SeqCst)
    }

    pub fn unavailable_reason(&self) -> Option<String> {
        match self.inner.unavailable_reason.lock() {
            Ok(reason) => reason.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn set_available(&self, available: bool, reason: Option<String>) {
        let was = self.inner.available.swap(available, Ordering::SeqCst);
        match self.inner.unavailable_reason.lock() {
            Ok(mut slot) => *slot = reason.clone(),
            Err(poisoned) => *poisoned.into_inner() = reason.clone(),
        }
        if was && !available {
            log::warn!(
                "Container runtime unavailable, sandboxes disabled: {}",
                reason.as_deref().unwrap_or("unknown reason")
            );
        } else if !was && available {
            log::info!("Container runtime is reachable again");
        }
    }

    fn unavailable_error(&self) -> InvocationError {
        InvocationError::RuntimeUnavailable {
            reason: self
                .unavailable_reason()
                .unwrap_or_else(|| "container runtime unavailable".to_string()),
        }
    }

    /// Hand out a busy sandbox for `definition`, reusing an idle one when
    /// possible. Waits while the function is at its concurrency limit.
    pub async fn acquire(
        &self,
        definition: Arc<FunctionDefinition>,
    ) -> Result<SandboxLease, InvocationError> {
        if !self.is_available() {
            return Err(self.unavailable_error());
        }
        let key = definition.key();
        let limiter = {
            let mut registry = self.registry();
            if registry.closed {
                return Err(InvocationError::RuntimeUnavailable {
                    reason: "sandbox pool is shut down".to_string(),
                });
            }
            let concurrency = definition
                .concurrency
                .unwrap_or(self.inner.settings.default_concurrency)
                .max(1);
            registry
                .slots
                .entry(key.clone())
                .or_insert_with(|| Slot::new(concurrency))
                .limiter
                .clone()
        };

        let permit = limiter
            .acquire_owned()
            .await
            .map_err(|_| InvocationError::RuntimeUnavailable {
                reason: "sandbox pool is shut down".to_string(),
            })?;
        if !self.is_available() {
            return Err(self.unavailable_error());
        }

        let epoch = {
            let mut registry = self.registry();
            let slot = registry
                .slots
                .entry(key.clone())
                .or_insert_with(|| Slot::new(1));
            let epoch = slot.epoch;
            let reusable = slot
                .sandboxes
                .values_mut()
                .filter(|s| s.occupancy == Occupancy::Idle && s.epoch == epoch)
                .max_by_key(|s| s.last_used);
            if let Some(sandbox) = reusable {
                sandbox.occupancy = Occupancy::Busy;
                sandbox.invocations += 1;
                sandbox.last_used = Instant::now();
                log::debug!("Reusing sandbox {} for {}", sandbox.container_id, key);
                return Ok(SandboxLease {
                    pool: self.clone(),
                    key,
                    container_id: sandbox.container_id.clone(),
                    invoke_command: sandbox.invoke_command.clone(),
                    definition,
                    cold_start: false,
                    permit: Some(permit),
                    released: false,
                });
            }
            epoch
        };

        let prepared = self
            .inner
            .resolver
            .prepare(&definition)
            .await
            .map_err(|e| InvocationError::from_start_failure(&definition.name, e))?;
        let starting = self.start_container(&definition, &prepared).await?;
        let container_id = starting.disarm();

        let occupancy = {
            let mut registry = self.registry();
            registry.starting.remove(&container_id);
            let slot = registry
                .slots
                .entry(key.clone())
                .or_insert_with(|| Slot::new(1));
            // A reload that landed while this container was starting still
            // lets the caller finish, but the container is not kept.
            let occupancy = if slot.epoch == epoch {
                Occupancy::Busy
            } else {
                Occupancy::Draining
            };
            slot.sandboxes.insert(
                container_id.clone(),
                Sandbox {
                    container_id: container_id.clone(),
                    created_at: Utc::now(),
                    last_used: Instant::now(),
                    occupancy,
                    epoch,
                    invocations: 1,
                    memory_mb: definition.memory_mb,
                    invoke_command: prepared.invoke_command.clone(),
                    layout: prepared.layout.clone(),
                },
            );
            occupancy
        };
        log::debug!(
            "Sandbox {} for {} started ({:?})",
            container_id,
            key,
            occupancy
        );

        Ok(SandboxLease {
            pool: self.clone(),
            key,
            container_id,
            invoke_command: prepared.invoke_command,
            definition,
            cold_start: true,
            permit: Some(permit),
            released: false,
        })
    }

    async fn start_container(
        &self,
        definition: &FunctionDefinition,
        prepared: &PreparedSandbox,
    ) -> Result<StartingContainer, InvocationError> {
        let settings = &self.inner.settings;
        let runtime = &self.inner.runtime;

        if settings.pull_images {
            runtime
                .ensure_image(&prepared.image)
                .await
                .map_err(|e| self.start_failure(&definition.name, e))?;
        }

        let sandbox_id = uuid::Uuid::new_v4().simple().to_string();
        let labels = HashMap::from([
            (settings.label("engine"), settings.namespace.clone()),
            (settings.label("function"), definition.name.clone()),
            (settings.label("version"), definition.version.clone()),
            (settings.label("sandbox"), sandbox_id.clone()),
        ]);
        let spec = ContainerSpec {
            name: format!(
                "{}-{}-{}",
                sanitize_component(&settings.namespace),
                sanitize_component(&definition.name),
                &sandbox_id[..12]
            ),
            image: prepared.image.clone(),
            command: prepared.keepalive.clone(),
            working_dir: Some(TASK_ROOT.to_string()),
            env: prepared.environment.clone(),
            labels,
            mounts: prepared.mounts.clone(),
            memory_mb: Some(definition.memory_mb),
        };

        self.inner.oplog.emit(
            OperationCategory::Run,
            format!("run {} ({})", definition.key(), prepared.image),
            Some(json!({
                "image": prepared.image,
                "memory_mb": definition.memory_mb,
                "code_path": definition.code_path.display().to_string(),
                "generation": prepared.layout.generation(),
                "environment_keys": prepared.environment.keys().collect::<Vec<_>>(),
            })),
        );

        let container_id = runtime
            .create(&spec)
            .await
            .map_err(|e| self.start_failure(&definition.name, e))?;
        self.registry().starting.insert(container_id.clone());
        let starting = StartingContainer::new(self.clone(), container_id);

        if let Err(e) = runtime.start(starting.id()).await {
            if let Err(remove_err) = runtime.remove(starting.id()).await {
                log::warn!(
                    "Failed to remove sandbox {} after start failure: {}",
                    starting.id(),
                    remove_err
                );
            }
            self.forget_starting(&starting.disarm());
            return Err(self.start_failure(&definition.name, e));
        }
        Ok(starting)
    }

    fn forget_starting(&self, container_id: &str) {
        self.registry().starting.remove(container_id);
    }

    async fn remove_abandoned(&self, container_id: &str) {
        match self.inner.runtime.remove(container_id).await {
            Ok(()) => {
                self.inner.oplog.emit(
                    OperationCategory::Remove,
                    format!("remove {} (abandoned start)", container_id),
                    Some(json!({ "container": container_id, "reason": "abandoned" })),
                );
            }
            Err(RuntimeError::NotFound(_)) => {}
            Err(e) => log::warn!("Failed to remove abandoned sandbox {}: {}", container_id, e),
        }
    }

    fn start_failure(&self, function: &str, err: RuntimeError) -> InvocationError {
        match err {
            RuntimeError::Unavailable(reason) => {
                self.set_available(false, Some(reason.clone()));
                InvocationError::RuntimeUnavailable { reason }
            }
            other => InvocationError::from_start_failure(function, EngineError::Runtime(other)),
        }
    }

    /// Return a sandbox after an invocation. Healthy busy sandboxes go back to
    /// idle; unhealthy or draining ones are destroyed before the concurrency
    /// permit is given back.
    pub async fn release(&self, mut lease: SandboxLease, healthy: bool) {
        lease.released = true;
        let permit = lease.permit.take();

        let doomed = {
            let mut registry = self.registry();
            registry.slots.get_mut(&lease.key).and_then(|slot| {
                let current_epoch = slot.epoch;
                let sandbox = slot.sandboxes.get_mut(&lease.container_id)?;
                sandbox.last_used = Instant::now();
                // A sandbox from before a reload never goes back to idle.
                if healthy
                    && sandbox.occupancy == Occupancy::Busy
                    && sandbox.epoch == current_epoch
                {
                    sandbox.occupancy = Occupancy::Idle;
                    None
                } else {
                    let reason = if healthy { "drained" } else { "unhealthy" };
                    sandbox.occupancy = Occupancy::Dead;
                    slot.sandboxes
                        .remove(&lease.container_id)
                        .map(|sandbox| (sandbox, reason))
                }
            })
        };

        if let Some((sandbox, reason)) = doomed {
            self.destroy(&lease.key, sandbox, reason).await;
        }
        drop(permit);
    }

    /// Make every current sandbox of `name` ineligible for reuse and drop its
    /// staged code, without touching any container. Acquires that start after
    /// this returns get a fresh sandbox; the containers themselves are left
    /// for `retire` or `release` to destroy.
    pub fn mark_stale(&self, name: &str) {
        self.inner.resolver.invalidate(name);
        let mut registry = self.registry();
        for (key, slot) in registry.slots.iter_mut() {
            if key.name == name {
                slot.epoch += 1;
            }
        }
    }

    /// Stop reusing every sandbox of `name` (one version or all). Idle ones are
    /// destroyed now, busy ones once their current invocation is released.
    /// Returns how many sandboxes were affected.
    pub async fn retire(&self, name: &str, version: Option<&str>) -> usize {
        self.inner.resolver.invalidate(name);

        let (idle, draining) = {
            let mut registry = self.registry();
            let mut idle = Vec::new();
            let mut draining = 0;
            for (key, slot) in registry.slots.iter_mut() {
                if key.name != name || version.map(|v| v != key.version).unwrap_or(false) {
                    continue;
                }
                slot.epoch += 1;
                let idle_ids: Vec<String> = slot
                    .sandboxes
                    .values_mut()
                    .filter_map(|sandbox| match sandbox.occupancy {
                        Occupancy::Idle => Some(sandbox.container_id.clone()),
                        Occupancy::Busy => {
                            sandbox.occupancy = Occupancy::Draining;
                            draining += 1;
                            None
                        }
                        Occupancy::Draining | Occupancy::Dead => None,
                    })
                    .collect();
                for id in idle_ids {
                    if let Some(sandbox) = slot.sandboxes.remove(&id) {
                        idle.push((key.clone(), sandbox));
                    }
                }
            }
            (idle, draining)
        };

        let affected = idle.len() + draining;
        if affected > 0 {
            log::info!(
                "Retiring {} sandbox(es) for '{}' ({} draining)",
                affected,
                name,
                draining
            );
        }
        for (key, sandbox) in idle {
            self.destroy(&key, sandbox, "retired").await;
        }
        affected
    }

    /// Retire every sandbox of every function.
    pub async fn retire_all(&self) -> usize {
        let names: HashSet<String> = self
            .registry()
            .slots
            .keys()
            .map(|key| key.name.clone())
            .collect();
        let mut affected = 0;
        for name in names {
            affected += self.retire(&name, None).await;
        }
        affected
    }

    /// Refuse new acquires and wake any caller waiting on a limit.
    pub fn close(&self) {
        let mut registry = self.registry();
        registry.closed = true;
        for slot in registry.slots.values() {
            slot.limiter.close();
        }
        registry.slots.retain(|_, slot| !slot.sandboxes.is_empty());
    }

    /// Accept acquires again after `close`.
    pub fn reopen(&self) {
        let mut registry = self.registry();
        registry.closed = false;
        registry.slots.retain(|_, slot| !slot.sandboxes.is_empty());
        for slot in registry.slots.values_mut() {
            if slot.limiter.is_closed() {
                // Draining leftovers keep their permits on the old limiter.
                slot.limiter = Arc::new(Semaphore::new(slot.concurrency));
            }
        }
    }

    async fn destroy(&self, key: &FunctionKey, sandbox: Sandbox, reason: &str) {
        let runtime = &self.inner.runtime;
        let id = &sandbox.container_id;

        match runtime.stop(id, self.inner.settings.stop_timeout).await {
            Ok(()) => {
                self.inner.oplog.emit(
                    OperationCategory::Stop,
                    format!("stop {} ({})", key, reason),
                    Some(json!({ "container": id, "reason": reason })),
                );
            }
            Err(RuntimeError::NotFound(_)) => {}
            Err(e) => log::warn!("Failed to stop sandbox {} for {}: {}", id, key, e),
        }

        match runtime.remove(id).await {
            Ok(()) => {
                self.inner.oplog.emit(
                    OperationCategory::Remove,
                    format!("remove {}", key),
                    Some(json!({
                        "container": id,
                        "reason": reason,
                        "invocations": sandbox.invocations,
                    })),
                );
            }
            Err(RuntimeError::NotFound(_)) => {}
            // The stale reap on the next start picks up anything left here.
            Err(e) => log::warn!("Failed to remove sandbox {} for {}: {}", id, key, e),
        }
    }

    /// Remove containers carrying this engine's label that the registry does
    /// not know about, typically left behind by a crashed earlier run.
    pub async fn reap_stale(&self) -> Result<usize, RuntimeError> {
        let settings = &self.inner.settings;
        let filter = [(settings.label("engine"), settings.namespace.clone())];
        let containers = self.inner.runtime.list(&filter).await?;

        let known = {
            let registry = self.registry();
            let mut known: HashSet<String> = registry.starting.clone();
            for slot in registry.slots.values() {
                known.extend(slot.sandboxes.keys().cloned());
            }
            known
        };

        let mut reaped = Vec::new();
        for container in containers {
            if known.contains(&container.id) {
                continue;
            }
            match self.inner.runtime.remove(&container.id).await {
                Ok(()) => reaped.push(container.id),
                Err(RuntimeError::NotFound(_)) => {}
                Err(e) => log::warn!("Failed to reap stale container {}: {}", container.id, e),
            }
        }

        if !reaped.is_empty() {
            self.inner.oplog.emit(
                OperationCategory::Reap,
                format!("reaped {} stale container(s)", reaped.len()),
                Some(json!({ "containers": reaped })),
            );
        }
        Ok(reaped.len())
    }

    /// Ping the runtime within the probe timeout and record the result.
    pub async fn availability_probe(&self) -> bool {
        let timeout = self.inner.settings.probe_timeout;
        let result = tokio::select! {
            result = self.inner.runtime.ping() => result.map_err(|e| e.to_string()),
            _ = tokio::time::sleep(timeout) => {
                Err(format!("no response from container runtime within {:?}", timeout))
            }
        };
        match result {
            Ok(()) => {
                self.set_available(true, None);
                true
            }
            Err(reason) => {
                self.set_available(false, Some(reason));
                false
            }
        }
    }

    /// Destroy idle sandboxes unused for longer than the idle timeout.
    pub async fn sweep_idle(&self) -> usize {
        let idle_timeout = self.inner.settings.idle_timeout;
        let expired = {
            let mut registry = self.registry();
            let mut expired = Vec::new();
            for (key, slot) in registry.slots.iter_mut() {
                let ids: Vec<String> = slot
                    .sandboxes
                    .values()
                    .filter(|s| s.occupancy == Occupancy::Idle && s.last_used.elapsed() >= idle_timeout)
                    .map(|s| s.container_id.clone())
                    .collect();
                for id in ids {
                    if let Some(sandbox) = slot.sandboxes.remove(&id) {
                        expired.push((key.clone(), sandbox));
                    }
                }
            }
            expired
        };

        let count = expired.len();
        for (key, sandbox) in expired {
            self.destroy(&key, sandbox, "idle").await;
        }
        count
    }

    /// Periodic idle sweep. While the runtime is marked unavailable the tick
    /// re-probes it instead.
    pub fn spawn_idle_sweeper(
        &self,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let pool = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if pool.is_available() {
                            let swept = pool.sweep_idle().await;
                            if swept > 0 {
                                log::debug!("Idle sweep destroyed {} sandbox(es)", swept);
                            }
                        } else {
                            pool.availability_probe().await;
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            log::debug!("Idle sweeper stopped");
        })
    }

    pub fn sandboxes(&self) -> Vec<SandboxInfo> {
        let registry = self.registry();
        let mut infos: Vec<SandboxInfo> = registry
            .slots
            .iter()
            .flat_map(|(key, slot)| {
                slot.sandboxes
                    .values()
                    .map(move |sandbox| SandboxInfo::from_sandbox(key, sandbox))
            })
            .collect();
        infos.sort_by(|a, b| {
            (&a.function, &a.version, a.created_at).cmp(&(&b.function, &b.version, b.created_at))
        });
        infos
    }
}
