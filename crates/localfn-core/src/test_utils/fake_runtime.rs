//! In-memory `ContainerRuntime` that imitates a sandbox and its shim.
//!
//! Each exec reads `handler.json` from the host directory mounted at
//! `/var/task`, decodes the framed event from stdin and answers the way the
//! script says: echo the payload, return a fixed value, report a handler
//! error, crash, or write a truncated frame. Reading the script from the
//! staged snapshot gives the same old-code/new-code behaviour as a real
//! container across reloads.

use crate::errors::RuntimeError;
use crate::image::catalog::TASK_ROOT;
use crate::protocol::frame::{decode_event, encode_response, ResponseKind};
use crate::protocol::REQUEST_ID_ENV;
use crate::runtime::{
    ContainerInfo, ContainerRuntime, ContainerSpec, ExecChunk, ExecRequest, ExecSession,
};
use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

pub const SCRIPT_FILE: &str = "handler.json";

#[derive(Debug, Default, Deserialize)]
struct Script {
    #[serde(default)]
    mode: Option<String>,
    #[serde(default)]
    value: Option<Value>,
    #[serde(default)]
    error_type: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    exit_code: Option<i64>,
    #[serde(default)]
    sleep_ms: u64,
    #[serde(default)]
    log: Option<String>,
    /// Deliver the response frame one byte per chunk.
    #[serde(default)]
    chunked: bool,
}

#[derive(Debug)]
struct FakeContainer {
    spec: ContainerSpec,
    running: bool,
    active_execs: usize,
    peak_execs: usize,
}

#[derive(Debug, Default)]
struct FakeState {
    available: bool,
    ping_delay: Option<Duration>,
    start_delay: Option<Duration>,
    fail_creates: bool,
    containers: HashMap<String, FakeContainer>,
    create_calls: usize,
    exec_calls: usize,
    removed: Vec<String>,
    pulled: Vec<String>,
    exit_codes: HashMap<String, i64>,
    peak_execs: usize,
}

#[derive(Clone)]
pub struct FakeRuntime {
    state: Arc<Mutex<FakeState>>,
    next_id: Arc<AtomicU64>,
}

impl Default for FakeRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(FakeState {
                available: true,
                ..FakeState::default()
            })),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    pub fn set_available(&self, available: bool) {
        self.lock().available = available;
    }

    pub fn set_ping_delay(&self, delay: Duration) {
        self.lock().ping_delay = Some(delay);
    }

    pub fn set_start_delay(&self, delay: Duration) {
        self.lock().start_delay = Some(delay);
    }

    pub fn set_fail_creates(&self, fail: bool) {
        self.lock().fail_creates = fail;
    }

    pub fn create_calls(&self) -> usize {
        self.lock().create_calls
    }

    pub fn exec_calls(&self) -> usize {
        self.lock().exec_calls
    }

    pub fn removed(&self) -> Vec<String> {
        self.lock().removed.clone()
    }

    pub fn pulled(&self) -> Vec<String> {
        self.lock().pulled.clone()
    }

    pub fn live_containers(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock().containers.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn container_spec(&self, id: &str) -> Option<ContainerSpec> {
        self.lock().containers.get(id).map(|c| c.spec.clone())
    }

    /// Highest number of execs ever running at once, across all containers.
    pub fn peak_concurrent_execs(&self) -> usize {
        self.lock().peak_execs
    }

    pub fn peak_execs_in(&self, id: &str) -> usize {
        self.lock()
            .containers
            .get(id)
            .map(|c| c.peak_execs)
            .unwrap_or(0)
    }

    /// Pretend a container was left behind by an earlier process.
    pub fn seed_container(&self, labels: &[(&str, &str)]) -> String {
        let id = self.allocate_id("seeded");
        let spec = ContainerSpec {
            name: id.clone(),
            image: "busybox".to_string(),
            command: Vec::new(),
            working_dir: None,
            env: Default::default(),
            labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            mounts: Vec::new(),
            memory_mb: None,
        };
        self.lock().containers.insert(
            id.clone(),
            FakeContainer {
                spec,
                running: true,
                active_execs: 0,
                peak_execs: 0,
            },
        );
        id
    }

    fn allocate_id(&self, prefix: &str) -> String {
        format!("{}-{}", prefix, self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    fn script_dir(spec: &ContainerSpec) -> Option<PathBuf> {
        spec.mounts
            .iter()
            .find(|m| m.container_path == TASK_ROOT)
            .map(|m| m.host_path.clone())
    }

    fn finish_exec(&self, container_id: &str, exec_id: &str, exit_code: i64) {
        let mut state = self.lock();
        if let Some(container) = state.containers.get_mut(container_id) {
            container.active_execs = container.active_execs.saturating_sub(1);
        }
        state.exit_codes.insert(exec_id.to_string(), exit_code);
    }

    fn container_alive(&self, container_id: &str) -> bool {
        self.lock()
            .containers
            .get(container_id)
            .map(|c| c.running)
            .unwrap_or(false)
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn ping(&self) -> Result<(), RuntimeError> {
        let (available, delay) = {
            let state = self.lock();
            (state.available, state.ping_delay)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if available {
            Ok(())
        } else {
            Err(RuntimeError::Unavailable("fake daemon is down".to_string()))
        }
    }

    async fn ensure_image(&self, image: &str) -> Result<(), RuntimeError> {
        let mut state = self.lock();
        if !state.available {
            return Err(RuntimeError::Unavailable("fake daemon is down".to_string()));
        }
        if !state.pulled.iter().any(|p| p == image) {
            state.pulled.push(image.to_string());
        }
        Ok(())
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        let id = self.allocate_id("fake");
        let mut state = self.lock();
        if !state.available {
            return Err(RuntimeError::Unavailable("fake daemon is down".to_string()));
        }
        state.create_calls += 1;
        if state.fail_creates {
            return Err(RuntimeError::operation("create_container", "no space left on device"));
        }
        state.containers.insert(
            id.clone(),
            FakeContainer {
                spec: spec.clone(),
                running: false,
                active_execs: 0,
                peak_execs: 0,
            },
        );
        Ok(id)
    }

    async fn start(&self, container_id: &str) -> Result<(), RuntimeError> {
        let delay = self.lock().start_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.lock();
        match state.containers.get_mut(container_id) {
            Some(container) => {
                container.running = true;
                Ok(())
            }
            None => Err(RuntimeError::NotFound(container_id.to_string())),
        }
    }

    async fn stop(&self, container_id: &str, _timeout: Duration) -> Result<(), RuntimeError> {
        let mut state = self.lock();
        match state.containers.get_mut(container_id) {
            Some(container) => {
                container.running = false;
                Ok(())
            }
            None => Err(RuntimeError::NotFound(container_id.to_string())),
        }
    }

    async fn remove(&self, container_id: &str) -> Result<(), RuntimeError> {
        let mut state = self.lock();
        match state.containers.remove(container_id) {
            Some(_) => {
                state.removed.push(container_id.to_string());
                Ok(())
            }
            None => Err(RuntimeError::NotFound(container_id.to_string())),
        }
    }

    async fn exec(
        &self,
        container_id: &str,
        request: ExecRequest,
    ) -> Result<ExecSession, RuntimeError> {
        let exec_id = self.allocate_id("exec");
        let script_dir = {
            let mut state = self.lock();
            state.exec_calls += 1;
            let container = state
                .containers
                .get_mut(container_id)
                .ok_or_else(|| RuntimeError::NotFound(container_id.to_string()))?;
            if !container.running {
                return Err(RuntimeError::operation("exec", "container is not running"));
            }
            container.active_execs += 1;
            container.peak_execs = container.peak_execs.max(container.active_execs);
            let dir = Self::script_dir(&container.spec);
            let active: usize = state.containers.values().map(|c| c.active_execs).sum();
            state.peak_execs = state.peak_execs.max(active);
            dir
        };

        // The "code" is loaded when the process starts, like a real handler.
        let script: Script = script_dir
            .and_then(|dir| std::fs::read(dir.join(SCRIPT_FILE)).ok())
            .and_then(|bytes| serde_json::from_slice(&bytes).ok())
            .unwrap_or_default();
        let event = decode_event(&request.stdin);
        let request_id = request.env.get(REQUEST_ID_ENV).cloned().unwrap_or_default();

        let (tx, rx) = mpsc::unbounded_channel::<Result<ExecChunk, RuntimeError>>();
        let runtime = self.clone();
        let container = container_id.to_string();
        let exec = exec_id.clone();
        tokio::spawn(async move {
            if script.sleep_ms > 0 {
                tokio::time::sleep(Duration::from_millis(script.sleep_ms)).await;
            }
            if !runtime.container_alive(&container) {
                runtime.finish_exec(&container, &exec, 137);
                return;
            }
            if let Some(line) = &script.log {
                let _ = tx.send(Ok(ExecChunk::Stderr(format!("{}\n", line).into_bytes())));
            }

            let event = match event {
                Ok(event) => event,
                Err(e) => {
                    let _ = tx.send(Ok(ExecChunk::Stderr(e.to_string().into_bytes())));
                    runtime.finish_exec(&container, &exec, 2);
                    return;
                }
            };

            let (frame, exit_code) = match script.mode.as_deref().unwrap_or("echo") {
                "respond" => (
                    encode_response(ResponseKind::Ok, &script.value.clone().unwrap_or(Value::Null)),
                    0,
                ),
                "error" => (
                    encode_response(
                        ResponseKind::Error,
                        &json!({
                            "errorType": script.error_type.clone().unwrap_or_else(|| "Exception".to_string()),
                            "errorMessage": script.message.clone().unwrap_or_default(),
                            "stackTrace": ["  File \"/var/task/app.py\", line 2, in handler\n"],
                        }),
                    ),
                    0,
                ),
                "crash" => {
                    let _ = tx.send(Ok(ExecChunk::Stderr(b"Traceback: fatal\n".to_vec())));
                    runtime.finish_exec(&container, &exec, script.exit_code.unwrap_or(1));
                    return;
                }
                "partial" => {
                    let _ = tx.send(Ok(ExecChunk::Stdout(
                        b"LOCALFN-RESPONSE ok 64\n{\"cut\":".to_vec(),
                    )));
                    runtime.finish_exec(&container, &exec, 0);
                    return;
                }
                "request-id" => (encode_response(ResponseKind::Ok, &json!(request_id)), 0),
                _ => (encode_response(ResponseKind::Ok, &event), 0),
            };

            let frame = match frame {
                Ok(frame) => frame,
                Err(_) => {
                    runtime.finish_exec(&container, &exec, 1);
                    return;
                }
            };
            if script.chunked {
                for byte in frame {
                    let _ = tx.send(Ok(ExecChunk::Stdout(vec![byte])));
                }
            } else {
                let _ = tx.send(Ok(ExecChunk::Stdout(frame)));
            }
            runtime.finish_exec(&container, &exec, exit_code);
        });

        let output = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed();
        Ok(ExecSession {
            id: exec_id,
            output,
        })
    }

    async fn exec_exit_code(&self, exec_id: &str) -> Result<Option<i64>, RuntimeError> {
        Ok(self.lock().exit_codes.get(exec_id).copied())
    }

    async fn list(&self, labels: &[(String, String)]) -> Result<Vec<ContainerInfo>, RuntimeError> {
        let state = self.lock();
        if !state.available {
            return Err(RuntimeError::Unavailable("fake daemon is down".to_string()));
        }
        let mut found: Vec<ContainerInfo> = state
            .containers
            .iter()
            .filter(|(_, c)| {
                labels
                    .iter()
                    .all(|(k, v)| c.spec.labels.get(k).map(|x| x == v).unwrap_or(false))
            })
            .map(|(id, c)| ContainerInfo {
                id: id.clone(),
                name: Some(c.spec.name.clone()),
                labels: c.spec.labels.clone(),
                running: c.running,
            })
            .collect();
        found.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(found)
    }
}
