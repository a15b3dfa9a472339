//! Operation log for sandbox lifecycle and invocation events
//!
//! Every container run/exec/stop/remove and every invocation start/end is
//! recorded as an [`OperationRecord`]: a category tag, a one-line summary and
//! an optional structured detail object. Records go to three places: a
//! console line through the `log` facade, a bounded in-memory ring for late
//! readers, and a broadcast channel for live subscribers. None of these can
//! block the caller; when the ring is full the oldest record is dropped, and
//! a subscriber that falls behind simply skips ahead.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

mod file_sink;

pub use file_sink::spawn_file_sink;

pub const LOG_TARGET: &str = "localfn::ops";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum OperationCategory {
    Run,
    Exec,
    Stop,
    Remove,
    InvokeStart,
    InvokeEnd,
    Reap,
    Reload,
}

impl OperationCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationCategory::Run => "run",
            OperationCategory::Exec => "exec",
            OperationCategory::Stop => "stop",
            OperationCategory::Remove => "remove",
            OperationCategory::InvokeStart => "invoke-start",
            OperationCategory::InvokeEnd => "invoke-end",
            OperationCategory::Reap => "reap",
            OperationCategory::Reload => "reload",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OperationRecord {
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub category: OperationCategory,
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<Value>,
}

struct Ring {
    entries: VecDeque<OperationRecord>,
    dropped: u64,
}

struct LogInner {
    capacity: usize,
    ring: Mutex<Ring>,
    sender: broadcast::Sender<OperationRecord>,
    next_seq: AtomicU64,
}

/// Cheaply cloneable handle to the operation log.
#[derive(Clone)]
pub struct OperationLog {
    inner: Arc<LogInner>,
}

impl OperationLog {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity);
        Self {
            inner: Arc::new(LogInner {
                capacity,
                ring: Mutex::new(Ring {
                    entries: VecDeque::with_capacity(capacity.min(4096)),
                    dropped: 0,
                }),
                sender,
                next_seq: AtomicU64::new(0),
            }),
        }
    }

    pub fn emit(
        &self,
        category: OperationCategory,
        summary: impl Into<String>,
        detail: Option<Value>,
    ) -> OperationRecord {
        let record = OperationRecord {
            seq: self.inner.next_seq.fetch_add(1, Ordering::SeqCst),
            timestamp: Utc::now(),
            category,
            summary: summary.into(),
            detail,
        };

        log::info!(target: LOG_TARGET, "[{}] {}", category.as_str(), record.summary);

        {
            let mut ring = match self.inner.ring.lock() {
                Ok(ring) => ring,
                Err(poisoned) => poisoned.into_inner(),
            };
            if ring.entries.len() >= self.inner.capacity {
                ring.entries.pop_front();
                ring.dropped += 1;
            }
            ring.entries.push_back(record.clone());
        }

        // No receivers is fine; the ring still has the record.
        let _ = self.inner.sender.send(record.clone());
        record
    }

    /// Snapshot of the buffered records, oldest first.
    pub fn recent(&self) -> Vec<OperationRecord> {
        match self.inner.ring.lock() {
            Ok(ring) => ring.entries.iter().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().entries.iter().cloned().collect(),
        }
    }

    /// Number of records evicted from the ring because it was full.
    pub fn dropped(&self) -> u64 {
        match self.inner.ring.lock() {
            Ok(ring) => ring.dropped,
            Err(poisoned) => poisoned.into_inner().dropped,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OperationRecord> {
        self.inner.sender.subscribe()
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }
}
