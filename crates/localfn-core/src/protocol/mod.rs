//! Invocation protocol handler.
//!
//! Runs exactly one request/response cycle inside a held sandbox: the runtime's
//! invoke command is exec'd with the framed event on stdin, and its output is
//! read until a complete response frame arrives, the deadline passes, or the
//! process exits. Exit means "no more data", never "stop reading": the decoder
//! is always drained before a missing frame is treated as a crash.
//!
//! The handler does not release the sandbox itself. It reports whether the
//! sandbox is still fit for reuse and the caller hands that to the pool.

pub mod frame;

use crate::errors::{InvocationError, RuntimeError};
use crate::runtime::{ContainerRuntime, ExecChunk, ExecRequest};
use chrono::{DateTime, Utc};
use frame::{encode_event, FrameError, ResponseDecoder, ResponseFrame, ResponseKind};
use futures_util::StreamExt;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const REQUEST_ID_ENV: &str = "LOCALFN_REQUEST_ID";
pub const DEADLINE_ENV: &str = "LOCALFN_DEADLINE_MS";

#[derive(Debug, Clone)]
pub struct InvocationRequest {
    pub request_id: String,
    pub payload: Value,
    pub timeout: Duration,
}

/// Result of one exchange plus the verdict on the sandbox that served it.
#[derive(Debug)]
pub struct Exchange {
    pub outcome: Result<Value, InvocationError>,
    pub logs: String,
    /// False after a timeout or crash; such a sandbox must not be reused.
    pub healthy: bool,
}

pub struct ProtocolHandler {
    runtime: Arc<dyn ContainerRuntime>,
    drain_grace: Duration,
}

enum ReadEnd {
    Frame(ResponseFrame),
    Exited,
    TimedOut,
    Broken(String),
}

impl ProtocolHandler {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, drain_grace: Duration) -> Self {
        Self {
            runtime,
            drain_grace,
        }
    }

    pub async fn exchange(
        &self,
        container_id: &str,
        command: &[String],
        request: &InvocationRequest,
    ) -> Exchange {
        let started = Instant::now();
        let deadline_at = Utc::now()
            + chrono::Duration::from_std(request.timeout).unwrap_or(chrono::Duration::zero());

        let stdin = match encode_event(&request.payload) {
            Ok(stdin) => stdin,
            Err(e) => {
                // Nothing reached the sandbox, so it is still fit for reuse.
                return Exchange {
                    outcome: Err(InvocationError::HandlerError {
                        request_id: request.request_id.clone(),
                        error_type: "Runtime.InvalidPayload".to_string(),
                        message: e.to_string(),
                        stack_trace: Vec::new(),
                    }),
                    logs: String::new(),
                    healthy: true,
                };
            }
        };

        let exec = ExecRequest {
            command: command.to_vec(),
            env: exec_env(&request.request_id, deadline_at),
            working_dir: Some(crate::image::catalog::TASK_ROOT.to_string()),
            stdin,
        };

        let deadline = tokio::time::sleep(request.timeout);
        tokio::pin!(deadline);

        let session = tokio::select! {
            biased;
            _ = &mut deadline => {
                return self.timed_out(request, String::new());
            }
            session = self.runtime.exec(container_id, exec) => session,
        };
        let mut session = match session {
            Ok(session) => session,
            Err(e) => {
                return Exchange {
                    outcome: Err(crash(request, None, format!("exec failed: {}", e))),
                    logs: String::new(),
                    healthy: false,
                };
            }
        };
        log::debug!(
            "Invocation {} running as exec {} in {}",
            request.request_id,
            session.id,
            container_id
        );

        let mut decoder = ResponseDecoder::new();
        let mut stderr = Vec::new();

        let end = loop {
            tokio::select! {
                biased;
                chunk = session.output.next() => match chunk {
                    Some(Ok(ExecChunk::Stdout(bytes))) => {
                        decoder.push(&bytes);
                        match decoder.next_frame() {
                            Ok(Some(frame)) => break ReadEnd::Frame(frame),
                            Ok(None) => {}
                            Err(e) => break ReadEnd::Broken(e.to_string()),
                        }
                    }
                    Some(Ok(ExecChunk::Stderr(bytes))) => stderr.extend_from_slice(&bytes),
                    Some(Err(e)) => break ReadEnd::Broken(format!("output stream failed: {}", e)),
                    None => break ReadEnd::Exited,
                },
                _ = &mut deadline => break ReadEnd::TimedOut,
            }
        };

        let end = match end {
            ReadEnd::Exited => match decoder.finish() {
                Ok(Some(frame)) => ReadEnd::Frame(frame),
                Ok(None) => ReadEnd::Exited,
                Err(e) => ReadEnd::Broken(e.to_string()),
            },
            other => other,
        };

        if matches!(end, ReadEnd::Frame(_)) {
            // Pick up log output that trails the frame before handing back.
            let grace = tokio::time::sleep(self.drain_grace);
            tokio::pin!(grace);
            loop {
                tokio::select! {
                    chunk = session.output.next() => match chunk {
                        Some(Ok(ExecChunk::Stdout(bytes))) => decoder.push(&bytes),
                        Some(Ok(ExecChunk::Stderr(bytes))) => stderr.extend_from_slice(&bytes),
                        Some(Err(_)) | None => break,
                    },
                    _ = &mut grace => break,
                }
            }
        }

        let mut log_bytes = decoder.take_passthrough();
        log_bytes.extend_from_slice(&stderr);
        let logs = String::from_utf8_lossy(&log_bytes).into_owned();

        log::debug!(
            "Invocation {} finished reading after {:?}",
            request.request_id,
            started.elapsed()
        );

        match end {
            ReadEnd::Frame(frame) => Exchange {
                outcome: interpret_frame(request, &frame),
                logs,
                healthy: true,
            }
            .demote_on_protocol_error(),
            ReadEnd::TimedOut => self.timed_out(request, logs),
            ReadEnd::Exited => {
                let exit_code = self.exit_code(&session.id).await;
                Exchange {
                    outcome: Err(crash(
                        request,
                        exit_code,
                        "process exited without a response".to_string(),
                    )),
                    logs,
                    healthy: false,
                }
            }
            ReadEnd::Broken(detail) => {
                let exit_code = self.exit_code(&session.id).await;
                Exchange {
                    outcome: Err(crash(request, exit_code, detail)),
                    logs,
                    healthy: false,
                }
            }
        }
    }

    fn timed_out(&self, request: &InvocationRequest, logs: String) -> Exchange {
        log::warn!(
            "Invocation {} exceeded its {:?} deadline",
            request.request_id,
            request.timeout
        );
        Exchange {
            outcome: Err(InvocationError::InvocationTimeout {
                request_id: request.request_id.clone(),
                timeout_ms: request.timeout.as_millis() as u64,
            }),
            logs,
            healthy: false,
        }
    }

    async fn exit_code(&self, exec_id: &str) -> Option<i64> {
        match self.runtime.exec_exit_code(exec_id).await {
            Ok(code) => code,
            Err(RuntimeError::NotFound(_)) => None,
            Err(e) => {
                log::debug!("Could not read exit code of exec {}: {}", exec_id, e);
                None
            }
        }
    }
}

impl Exchange {
    /// A frame whose body cannot be parsed means the shim broke the contract,
    /// which is a crash rather than a handler error.
    fn demote_on_protocol_error(mut self) -> Self {
        if let Err(InvocationError::SandboxCrash { .. }) = self.outcome {
            self.healthy = false;
        }
        self
    }
}

fn exec_env(request_id: &str, deadline_at: DateTime<Utc>) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    env.insert(REQUEST_ID_ENV.to_string(), request_id.to_string());
    env.insert(
        DEADLINE_ENV.to_string(),
        deadline_at.timestamp_millis().to_string(),
    );
    env
}

fn crash(request: &InvocationRequest, exit_code: Option<i64>, detail: String) -> InvocationError {
    InvocationError::SandboxCrash {
        request_id: request.request_id.clone(),
        exit_code,
        detail,
    }
}

fn interpret_frame(
    request: &InvocationRequest,
    frame: &ResponseFrame,
) -> Result<Value, InvocationError> {
    let body = frame.json().map_err(|e: FrameError| {
        crash(request, None, format!("unreadable {} response: {}", frame.kind, e))
    })?;
    match frame.kind {
        ResponseKind::Ok => Ok(body),
        ResponseKind::Error => Err(handler_error(request, &body)),
    }
}

fn handler_error(request: &InvocationRequest, body: &Value) -> InvocationError {
    let field = |name: &str| body.get(name).and_then(Value::as_str).map(str::to_string);
    let stack_trace = match body.get("stackTrace") {
        Some(Value::Array(lines)) => lines
            .iter()
            .map(|line| match line {
                Value::String(s) => s.trim_end_matches('\n').to_string(),
                other => other.to_string(),
            })
            .collect(),
        Some(Value::String(s)) => s.lines().map(str::to_string).collect(),
        _ => Vec::new(),
    };
    InvocationError::HandlerError {
        request_id: request.request_id.clone(),
        error_type: field("errorType").unwrap_or_else(|| "Error".to_string()),
        message: field("errorMessage").unwrap_or_else(|| body.to_string()),
        stack_trace,
    }
}

#[cfg(test)]
mod tests;
