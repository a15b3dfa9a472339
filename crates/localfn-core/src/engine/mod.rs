//! Engine facade: lifecycle contract and the single `invoke` entry point.
//!
//! `start` probes the container runtime and reports [`LifecycleState::Degraded`]
//! instead of failing when it is missing, so the rest of a local environment
//! can keep running with fallbacks. Every invocation failure leaves `invoke`
//! as a structured [`InvocationError`].


use crate::config::EngineConfig;
use crate::errors::{EngineError, InvocationError};
use crate::function::{EndpointEnvironment, EnvironmentBuilder, FunctionDefinition, FunctionProvider};
use crate::image::catalog::ImageCatalog;
use crate::image::ImageResolver;
use crate::oplog::{spawn_file_sink, OperationCategory, OperationLog};
use crate::pool::{PoolSettings, SandboxPool};
use crate::protocol::{InvocationRequest, ProtocolHandler};
use crate::reload::{
    PollingSourceWatch, ReloadCoordinator, ReloadReceiver, ReloadRequest, ReloadRequestStatus,
};
use crate::runtime::docker::DockerRuntime;
use crate::runtime::ContainerRuntime;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

const FUNCTION_LOG_TARGET: &str = "localfn::function";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum LifecycleState {
    Stopped,
    Ready,
    Degraded { reason: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct InvocationResult {
    pub request_id: String,
    pub payload: Value,
    pub duration: Duration,
    /// Everything the function wrote to stderr, plus stdout text outside the
    /// response frame.
    pub logs: String,
    pub cold_start: bool,
}

#[derive(Default)]
struct Background {
    shutdown: Option<watch::Sender<bool>>,
    tasks: Vec<JoinHandle<()>>,
    reload_worker: Option<JoinHandle<ReloadReceiver>>,
    reload_receiver: Option<ReloadReceiver>,
}

pub struct LocalComputeEngine {
    config: EngineConfig,
    provider: Arc<dyn FunctionProvider>,
    pool: SandboxPool,
    protocol: ProtocolHandler,
    oplog: OperationLog,
    reload: ReloadCoordinator,
    state: RwLock<LifecycleState>,
    background: Mutex<Background>,
}

impl LocalComputeEngine {
    pub fn new(
        config: EngineConfig,
        provider: Arc<dyn FunctionProvider>,
        runtime: Arc<dyn ContainerRuntime>,
        env_builder: Arc<dyn EnvironmentBuilder>,
    ) -> Self {
        let oplog = OperationLog::new(config.log_buffer_capacity);
        let resolver = Arc::new(ImageResolver::new(
            ImageCatalog::new(config.images.clone()),
            config.staging_dir.clone(),
            env_builder,
        ));
        let pool = SandboxPool::new(
            runtime.clone(),
            resolver,
            oplog.clone(),
            PoolSettings::from_config(&config),
        );
        let protocol = ProtocolHandler::new(runtime, config.drain_grace());
        let (reload, receiver) = ReloadCoordinator::new(pool.clone());

        Self {
            config,
            provider,
            pool,
            protocol,
            oplog,
            reload,
            state: RwLock::new(LifecycleState::Stopped),
            background: Mutex::new(Background {
                reload_receiver: Some(receiver),
                ..Background::default()
            }),
        }
    }

    /// Engine on the local Docker daemon, redirecting SDK calls to the
    /// configured service endpoints.
    pub fn with_docker(
        config: EngineConfig,
        provider: Arc<dyn FunctionProvider>,
    ) -> Result<Self, EngineError> {
        let runtime = DockerRuntime::connect()?;
        let env_builder = EndpointEnvironment::new(config.service_endpoints.clone());
        Ok(Self::new(
            config,
            provider,
            Arc::new(runtime),
            Arc::new(env_builder),
        ))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn pool(&self) -> &SandboxPool {
        &self.pool
    }

    pub fn operations(&self) -> &OperationLog {
        &self.oplog
    }

    fn stored_state(&self) -> LifecycleState {
        match self.state.read() {
            Ok(state) => state.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn set_state(&self, next: LifecycleState) {
        match self.state.write() {
            Ok(mut state) => *state = next,
            Err(poisoned) => *poisoned.into_inner() = next,
        }
    }

    /// Current state. A running engine whose runtime has since become
    /// unreachable reports `Degraded`.
    pub fn state(&self) -> LifecycleState {
        match self.stored_state() {
            LifecycleState::Ready if !self.pool.is_available() => LifecycleState::Degraded {
                reason: self
                    .pool
                    .unavailable_reason()
                    .unwrap_or_else(|| "container runtime unavailable".to_string()),
            },
            state => state,
        }
    }

    pub fn healthy(&self) -> bool {
        self.state() == LifecycleState::Ready
    }

    /// Probe the runtime and, if it answers, clean up after earlier runs and
    /// start the background tasks. Calling it again on a degraded engine
    /// retries the probe; on a ready engine it does nothing.
    pub async fn start(&self) -> LifecycleState {
        let mut background = self.background.lock().await;
        if self.stored_state() == LifecycleState::Ready {
            return self.state();
        }

        self.pool.reopen();
        if !self.pool.availability_probe().await {
            let reason = self
                .pool
                .unavailable_reason()
                .unwrap_or_else(|| "container runtime unavailable".to_string());
            log::warn!(
                "Local compute engine starting degraded, functions will not run: {}",
                reason
            );
            let state = LifecycleState::Degraded { reason };
            self.set_state(state.clone());
            return state;
        }

        match self.pool.reap_stale().await {
            Ok(0) => {}
            Ok(reaped) => log::info!("Removed {} container(s) left by a previous run", reaped),
            Err(e) => log::warn!("Stale container sweep failed: {}", e),
        }

        let (shutdown, signal) = watch::channel(false);
        background.tasks.push(
            self.pool
                .spawn_idle_sweeper(self.config.reap_interval(), signal.clone()),
        );

        match background.reload_receiver.take() {
            Some(receiver) => {
                background.reload_worker = Some(self.reload.spawn_worker(
                    receiver,
                    self.oplog.clone(),
                    signal.clone(),
                ));
            }
            None => log::error!("Reload worker unavailable; reload requests will not be applied"),
        }

        if self.config.watch.enabled {
            let definitions = self.provider.list();
            let source = PollingSourceWatch::for_functions(
                definitions.iter().map(|d| d.as_ref()),
                self.config.poll_interval(),
            )
            .skip(self.config.staging_dir.clone());
            if source.target_count() > 0 {
                log::debug!("Watching {} source location(s)", source.target_count());
                background
                    .tasks
                    .push(self.reload.spawn_watcher(Box::new(source), signal.clone()));
            }
        }

        if let Some(path) = &self.config.operation_log_file {
            background
                .tasks
                .push(spawn_file_sink(&self.oplog, path.clone(), signal.clone()));
        }

        background.shutdown = Some(shutdown);
        self.set_state(LifecycleState::Ready);
        log::info!(
            "Local compute engine ready (namespace '{}')",
            self.config.namespace
        );
        LifecycleState::Ready
    }

    /// Stop background tasks and retire every sandbox. In-flight invocations
    /// finish; their sandboxes are destroyed on release.
    pub async fn stop(&self) {
        let mut background = self.background.lock().await;
        if let Some(shutdown) = background.shutdown.take() {
            let _ = shutdown.send(true);
        }
        for task in background.tasks.drain(..) {
            if let Err(e) = task.await {
                log::warn!("Background task ended abnormally: {}", e);
            }
        }
        if let Some(worker) = background.reload_worker.take() {
            match worker.await {
                Ok(receiver) => background.reload_receiver = Some(receiver),
                Err(e) => log::error!("Reload worker ended abnormally: {}", e),
            }
        }

        self.pool.close();
        let retired = self.pool.retire_all().await;
        if retired > 0 {
            log::info!("Retired {} sandbox(es) on shutdown", retired);
        }
        self.set_state(LifecycleState::Stopped);
    }

    /// Run one invocation. `deadline` overrides the function's own timeout.
    pub async fn invoke(
        &self,
        name: &str,
        version: Option<&str>,
        payload: Value,
        deadline: Option<Duration>,
    ) -> Result<InvocationResult, InvocationError> {
        let request_id = uuid::Uuid::new_v4().to_string();
        if self.stored_state() == LifecycleState::Stopped {
            return Err(InvocationError::RuntimeUnavailable {
                reason: "local compute engine is not started".to_string(),
            });
        }
        let definition = self.resolve(name, version).await?;
        let timeout = deadline.unwrap_or_else(|| definition.timeout());
        let key = definition.key();

        self.oplog.emit(
            OperationCategory::InvokeStart,
            format!("invoke {} [{}]", key, request_id),
            Some(json!({
                "request_id": request_id,
                "function": definition.name,
                "version": definition.version,
                "timeout_ms": timeout.as_millis() as u64,
            })),
        );

        let started = Instant::now();
        let result = self
            .run(definition.clone(), &request_id, payload, timeout)
            .await;
        let duration = started.elapsed();

        let (outcome, cold_start) = match &result {
            Ok(result) => ("success", Some(result.cold_start)),
            Err(e) => (e.kind().as_str(), None),
        };
        self.oplog.emit(
            OperationCategory::InvokeEnd,
            format!("invoke {} {} in {} ms", key, outcome, duration.as_millis()),
            Some(json!({
                "request_id": request_id,
                "outcome": outcome,
                "duration_ms": duration.as_millis() as u64,
                "cold_start": cold_start,
            })),
        );
        result.map(|mut result| {
            result.duration = duration;
            result
        })
    }

    async fn resolve(
        &self,
        name: &str,
        version: Option<&str>,
    ) -> Result<Arc<FunctionDefinition>, InvocationError> {
        self.provider
            .resolve(name, version)
            .await
            .map_err(|e| match e {
                EngineError::FunctionNotFound { name, version } => {
                    InvocationError::FunctionNotFound { name, version }
                }
                other => InvocationError::from_start_failure(name, other),
            })
    }

    async fn run(
        &self,
        definition: Arc<FunctionDefinition>,
        request_id: &str,
        payload: Value,
        timeout: Duration,
    ) -> Result<InvocationResult, InvocationError> {
        let lease = self.pool.acquire(definition.clone()).await?;
        let cold_start = lease.cold_start();

        self.oplog.emit(
            OperationCategory::Exec,
            format!("exec {} in {}", lease.key(), short_id(lease.container_id())),
            Some(json!({
                "request_id": request_id,
                "container": lease.container_id(),
                "command": lease.invoke_command(),
                "cold_start": cold_start,
            })),
        );

        let request = InvocationRequest {
            request_id: request_id.to_string(),
            payload,
            timeout,
        };
        let exchange = self
            .protocol
            .exchange(lease.container_id(), lease.invoke_command(), &request)
            .await;

        if exchange.healthy {
            self.pool.release(lease, true).await;
        } else {
            // Destroying can take the runtime's stop timeout; the caller does
            // not wait for it, the next acquire does.
            let pool = self.pool.clone();
            tokio::spawn(async move { pool.release(lease, false).await });
        }

        match exchange.outcome {
            Ok(payload) => Ok(InvocationResult {
                request_id: request_id.to_string(),
                payload,
                duration: Duration::ZERO,
                logs: exchange.logs,
                cold_start,
            }),
            Err(e) => {
                for line in exchange.logs.lines() {
                    log::info!(target: FUNCTION_LOG_TARGET, "[{}] {}", definition.name, line);
                }
                Err(e)
            }
        }
    }

    /// Start a sandbox ahead of the first invocation.
    pub async fn warm(&self, name: &str, version: Option<&str>) -> Result<(), InvocationError> {
        let definition = self.resolve(name, version).await?;
        let lease = self.pool.acquire(definition).await?;
        self.pool.release(lease, true).await;
        Ok(())
    }

    /// Force a reload of `name`. Invocations that acquire after this returns
    /// run the current code; the old sandboxes are retired in the background.
    pub fn request_reload(&self, name: &str) -> ReloadRequestStatus {
        self.reload.request(ReloadRequest::forced(name))
    }
}

fn short_id(id: &str) -> &str {
    id.get(..12).unwrap_or(id)
}
