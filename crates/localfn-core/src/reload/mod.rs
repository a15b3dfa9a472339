//! Reload watching and request coalescing.
//!
//! Source changes and explicit requests both become a [`ReloadRequest`].
//! Submitting one immediately stops the pool from reusing the function's
//! current sandboxes, so any acquire after the request stages and starts the
//! new code. While a request for a function is queued, further requests for
//! it collapse into that one. A single worker then retires the old sandboxes,
//! letting in-flight invocations finish on the old code.

pub mod fingerprint;
pub mod watch;

pub use watch::{PollingSourceWatch, SourceChange, SourceWatch};

use crate::oplog::{OperationCategory, OperationLog};
use crate::pool::SandboxPool;
use serde_json::json;
use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, watch as signal};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReloadReason {
    SourceChanged(PathBuf),
    Forced,
}

impl fmt::Display for ReloadReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReloadReason::SourceChanged(path) => write!(f, "source changed at {}", path.display()),
            ReloadReason::Forced => f.write_str("forced"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReloadRequest {
    pub function: String,
    pub reason: ReloadReason,
}

impl ReloadRequest {
    pub fn forced(function: impl Into<String>) -> Self {
        Self {
            function: function.into(),
            reason: ReloadReason::Forced,
        }
    }
}

/// Outcome of submitting a reload. Neither is an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadRequestStatus {
    Queued,
    /// A reload for the same function is already waiting to run.
    AlreadyPending,
}

pub type ReloadReceiver = mpsc::UnboundedReceiver<ReloadRequest>;

#[derive(Clone)]
pub struct ReloadCoordinator {
    pool: SandboxPool,
    pending: Arc<Mutex<HashSet<String>>>,
    sender: mpsc::UnboundedSender<ReloadRequest>,
}

impl ReloadCoordinator {
    pub fn new(pool: SandboxPool) -> (Self, ReloadReceiver) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (
            Self {
                pool,
                pending: Arc::new(Mutex::new(HashSet::new())),
                sender,
            },
            receiver,
        )
    }

    fn pending(&self) -> MutexGuard<'_, HashSet<String>> {
        match self.pending.lock() {
            Ok(pending) => pending,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Queue a reload without waiting for it. Sandboxes of the function stop
    /// being reused before this returns, even when the request coalesces.
    pub fn request(&self, request: ReloadRequest) -> ReloadRequestStatus {
        self.pool.mark_stale(&request.function);
        {
            let mut pending = self.pending();
            if !pending.insert(request.function.clone()) {
                log::debug!(
                    "Reload of '{}' already pending ({})",
                    request.function,
                    request.reason
                );
                return ReloadRequestStatus::AlreadyPending;
            }
        }
        let function = request.function.clone();
        if self.sender.send(request).is_err() {
            // Worker gone; forget the entry so a later worker is not blocked.
            self.pending().remove(&function);
            log::warn!("Reload of '{}' dropped: reload worker not running", function);
        }
        ReloadRequestStatus::Queued
    }

    pub fn is_pending(&self, function: &str) -> bool {
        self.pending().contains(function)
    }

    /// Apply queued reloads until shutdown. Hands the receiver back so a
    /// restarted engine can spawn a new worker.
    pub fn spawn_worker(
        &self,
        mut receiver: ReloadReceiver,
        oplog: OperationLog,
        mut shutdown: signal::Receiver<bool>,
    ) -> JoinHandle<ReloadReceiver> {
        let coordinator = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    request = receiver.recv() => {
                        let Some(request) = request else { break };
                        coordinator.apply(&oplog, request).await;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            log::debug!("Reload worker stopped");
            receiver
        })
    }

    async fn apply(&self, oplog: &OperationLog, request: ReloadRequest) {
        // Cleared first: a change landing during the retire queues another pass.
        self.pending().remove(&request.function);
        let affected = self.pool.retire(&request.function, None).await;
        oplog.emit(
            OperationCategory::Reload,
            format!("reload {} ({})", request.function, request.reason),
            Some(json!({
                "function": request.function,
                "reason": request.reason.to_string(),
                "sandboxes": affected,
            })),
        );
    }

    /// Forward changes from `source` as reload requests until shutdown.
    pub fn spawn_watcher(
        &self,
        mut source: Box<dyn SourceWatch>,
        mut shutdown: signal::Receiver<bool>,
    ) -> JoinHandle<()> {
        let coordinator = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    change = source.next_change() => {
                        let Some(change) = change else { break };
                        log::info!(
                            "Source of '{}' changed, scheduling reload",
                            change.function
                        );
                        coordinator.request(ReloadRequest {
                            function: change.function,
                            reason: ReloadReason::SourceChanged(change.path),
                        });
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            log::debug!("Reload watcher stopped");
        })
    }
}
