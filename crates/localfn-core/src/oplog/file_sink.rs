//! JSON-lines file sink for operation records

use super::{OperationLog, OperationRecord};
use std::path::PathBuf;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

/// Append every record to `path` as one JSON object per line until
/// `shutdown` flips to true. Runs as a subscriber, so a slow disk makes the
/// sink skip records instead of slowing the emitter.
pub fn spawn_file_sink(
    log: &OperationLog,
    path: PathBuf,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let mut rx = log.subscribe();
    tokio::spawn(async move {
        if let Some(parent) = path.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                log::error!("Failed to create operation log directory {}: {}", parent.display(), e);
                return;
            }
        }
        let mut file = match OpenOptions::new().create(true).append(true).open(&path).await {
            Ok(file) => file,
            Err(e) => {
                log::error!("Failed to open operation log {}: {}", path.display(), e);
                return;
            }
        };

        loop {
            tokio::select! {
                received = rx.recv() => match received {
                    Ok(record) => write_record(&mut file, &record).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        log::warn!("Operation log file sink skipped {} records", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        let _ = file.flush().await;
    })
}

async fn write_record(file: &mut tokio::fs::File, record: &OperationRecord) {
    match serde_json::to_string(record) {
        Ok(mut line) => {
            line.push('\n');
            if file.write_all(line.as_bytes()).await.is_err() {
                log::error!("Failed to write operation record to file");
            }
        }
        Err(e) => log::error!("Failed to serialize operation record: {}", e),
    }
}
