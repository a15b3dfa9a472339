//! Source change detection

use super::fingerprint::fingerprint;
use crate::function::FunctionDefinition;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceChange {
    pub function: String,
    pub path: PathBuf,
}

/// Lazy sequence of change events. A fresh instance starts from the current
/// state of the watched trees, so a watch can be rebuilt at any time.
#[async_trait]
pub trait SourceWatch: Send {
    /// Wait for the next change. `None` means nothing is being watched.
    async fn next_change(&mut self) -> Option<SourceChange>;
}

#[derive(Debug)]
struct Target {
    function: String,
    path: PathBuf,
    fingerprint: Option<String>,
}

/// Polls fingerprints of each watched tree at a fixed interval.
pub struct PollingSourceWatch {
    targets: Vec<Target>,
    interval: Duration,
    skip: Vec<PathBuf>,
    primed: bool,
    pending: VecDeque<SourceChange>,
}

impl PollingSourceWatch {
    pub fn new(interval: Duration) -> Self {
        Self {
            targets: Vec::new(),
            interval,
            skip: Vec::new(),
            primed: false,
            pending: VecDeque::new(),
        }
    }

    pub fn watch(mut self, function: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        self.targets.push(Target {
            function: function.into(),
            path: path.into(),
            fingerprint: None,
        });
        self
    }

    /// Never report changes under `path` (the staging directory may live
    /// inside a watched tree).
    pub fn skip(mut self, path: impl Into<PathBuf>) -> Self {
        self.skip.push(path.into());
        self
    }

    /// Watch the code location and every layer of each definition.
    pub fn for_functions<'a>(
        definitions: impl IntoIterator<Item = &'a FunctionDefinition>,
        interval: Duration,
    ) -> Self {
        let mut watch = Self::new(interval);
        for definition in definitions {
            let mut paths = vec![definition.code_path.clone()];
            paths.extend(definition.layers.iter().cloned());
            for path in paths {
                let seen = watch
                    .targets
                    .iter()
                    .any(|t| t.function == definition.name && t.path == path);
                if !seen {
                    watch = watch.watch(definition.name.clone(), path);
                }
            }
        }
        watch
    }

    pub fn target_count(&self) -> usize {
        self.targets.len()
    }

    async fn scan(&mut self) {
        for index in 0..self.targets.len() {
            let path = self.targets[index].path.clone();
            let skip = self.skip.clone();
            let result = tokio::task::spawn_blocking(move || fingerprint(&path, &skip)).await;
            let current = match result {
                Ok(Ok(current)) => current,
                Ok(Err(e)) => {
                    log::debug!(
                        "Could not fingerprint {}: {}",
                        self.targets[index].path.display(),
                        e
                    );
                    continue;
                }
                Err(e) => {
                    log::debug!("Fingerprint task failed: {}", e);
                    continue;
                }
            };
            let target = &mut self.targets[index];
            if self.primed && target.fingerprint != current {
                log::debug!(
                    "Source of '{}' changed at {}",
                    target.function,
                    target.path.display()
                );
                self.pending.push_back(SourceChange {
                    function: target.function.clone(),
                    path: target.path.clone(),
                });
            }
            target.fingerprint = current;
        }
        self.primed = true;
    }
}

#[async_trait]
impl SourceWatch for PollingSourceWatch {
    async fn next_change(&mut self) -> Option<SourceChange> {
        if self.targets.is_empty() {
            return None;
        }
        if !self.primed {
            self.scan().await;
        }
        loop {
            if let Some(change) = self.pending.pop_front() {
                return Some(change);
            }
            tokio::time::sleep(self.interval).await;
            self.scan().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_polling_watch_reports_changed_function() {
        let a = tempdir().unwrap();
        let b = tempdir().unwrap();
        fs::write(a.path().join("app.py"), "v1").unwrap();
        fs::write(b.path().join("app.py"), "v1").unwrap();

        let mut watch = PollingSourceWatch::new(Duration::from_millis(20))
            .watch("a", a.path())
            .watch("b", b.path());
        watch.scan().await;

        fs::write(b.path().join("app.py"), "v2").unwrap();
        let change = tokio::time::timeout(Duration::from_secs(2), watch.next_change())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(change.function, "b");
        assert_eq!(change.path, b.path().to_path_buf());
    }

    #[tokio::test]
    async fn test_deleting_and_recreating_source_is_a_change() {
        let dir = tempdir().unwrap();
        let code = dir.path().join("code");
        fs::create_dir_all(&code).unwrap();
        fs::write(code.join("app.py"), "old").unwrap();

        let mut watch = PollingSourceWatch::new(Duration::from_millis(20)).watch("echo", &code);
        watch.scan().await;

        fs::remove_dir_all(&code).unwrap();
        let change = tokio::time::timeout(Duration::from_secs(2), watch.next_change())
            .await
            .unwrap();
        assert_eq!(change.map(|c| c.function), Some("echo".to_string()));
    }

    #[tokio::test]
    async fn test_empty_watch_ends_immediately() {
        let mut watch = PollingSourceWatch::new(Duration::from_millis(10));
        assert_eq!(watch.next_change().await, None);
    }

    #[test]
    fn test_for_functions_watches_code_and_layers_once() {
        let defs = vec![
            FunctionDefinition::new("a", "python3.12", "/src/a", "app.handler")
                .with_layer("/layers/common"),
            FunctionDefinition::new("a", "python3.12", "/src/a", "app.handler").with_version("2"),
            FunctionDefinition::new("b", "nodejs20.x", "/src/b", "index.handler"),
        ];
        let watch = PollingSourceWatch::for_functions(&defs, Duration::from_millis(100));
        assert_eq!(watch.target_count(), 3);
    }
}
