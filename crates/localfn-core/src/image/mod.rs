//! Sandbox image resolution.
//!
//! Maps a function's runtime identifier to an image, stages a snapshot of its
//! code (plus merged layers) and the runtime's bootstrap shim on disk, and
//! merges the sandbox environment. Staged layouts are cached per function
//! version until [`ImageResolver::invalidate`] is called by a reload.

pub mod catalog;
pub mod layout;

use crate::errors::EngineError;
use crate::function::{EnvironmentBuilder, FunctionDefinition, FunctionKey};
use crate::runtime::Mount;
use catalog::{ImageCatalog, RuntimeFamily, OPT_DIR, RUNTIME_DIR, TASK_ROOT};
use layout::{sanitize_component, StagedLayout};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Command that keeps a sandbox container alive between invocations.
pub const KEEPALIVE_COMMAND: [&str; 3] = ["tail", "-f", "/dev/null"];

/// Everything the pool needs to create a sandbox for one function version.
#[derive(Debug, Clone)]
pub struct PreparedSandbox {
    pub image: String,
    pub family: RuntimeFamily,
    pub mounts: Vec<Mount>,
    pub environment: BTreeMap<String, String>,
    pub keepalive: Vec<String>,
    pub invoke_command: Vec<String>,
    pub layout: Arc<StagedLayout>,
}

#[derive(Default)]
struct ResolverCache {
    layouts: HashMap<FunctionKey, Arc<StagedLayout>>,
    /// Bumped by `invalidate`, so a layout staged concurrently with a reload
    /// is used once but never cached.
    epochs: HashMap<String, u64>,
}

pub struct ImageResolver {
    catalog: ImageCatalog,
    staging_dir: PathBuf,
    env_builder: Arc<dyn EnvironmentBuilder>,
    cache: Mutex<ResolverCache>,
    next_generation: AtomicU64,
}

impl ImageResolver {
    pub fn new(
        catalog: ImageCatalog,
        staging_dir: PathBuf,
        env_builder: Arc<dyn EnvironmentBuilder>,
    ) -> Self {
        Self {
            catalog,
            staging_dir,
            env_builder,
            cache: Mutex::new(ResolverCache::default()),
            next_generation: AtomicU64::new(0),
        }
    }

    pub fn staging_dir(&self) -> &Path {
        &self.staging_dir
    }

    pub async fn prepare(
        &self,
        definition: &FunctionDefinition,
    ) -> Result<PreparedSandbox, EngineError> {
        let runtime_image = self.catalog.lookup(&definition.runtime).ok_or_else(|| {
            EngineError::UnsupportedRuntime {
                function: definition.name.clone(),
                runtime: definition.runtime.clone(),
            }
        })?;

        let runtime_dir = self
            .ensure_shim(&definition.runtime, runtime_image.family)
            .await?;
        let layout = self.layout_for(definition).await?;

        let mounts = vec![
            Mount::read_only(layout.task_dir(), TASK_ROOT),
            Mount::read_only(layout.opt_dir(), OPT_DIR),
            Mount::read_only(runtime_dir, RUNTIME_DIR),
        ];

        Ok(PreparedSandbox {
            image: runtime_image.image,
            family: runtime_image.family,
            mounts,
            environment: self.merged_environment(definition, runtime_image.family),
            keepalive: KEEPALIVE_COMMAND.iter().map(|s| s.to_string()).collect(),
            invoke_command: runtime_image.family.invoke_command(),
            layout,
        })
    }

    /// Drop cached layouts for every version of `function`; the next
    /// `prepare` stages fresh code.
    pub fn invalidate(&self, function: &str) {
        let mut cache = self.lock_cache();
        cache.layouts.retain(|key, _| key.name != function);
        *cache.epochs.entry(function.to_string()).or_insert(0) += 1;
        log::debug!("Invalidated staged layouts for '{}'", function);
    }

    fn lock_cache(&self) -> std::sync::MutexGuard<'_, ResolverCache> {
        match self.cache.lock() {
            Ok(cache) => cache,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    async fn layout_for(
        &self,
        definition: &FunctionDefinition,
    ) -> Result<Arc<StagedLayout>, EngineError> {
        let key = definition.key();
        let epoch = {
            let cache = self.lock_cache();
            if let Some(layout) = cache.layouts.get(&key) {
                return Ok(layout.clone());
            }
            cache.epochs.get(&definition.name).copied().unwrap_or(0)
        };

        let code_path = definition.code_path.clone();
        if let Err(e) = tokio::fs::metadata(&code_path).await {
            return Err(EngineError::AssetUnavailable {
                function: definition.name.clone(),
                path: code_path.display().to_string(),
                reason: e.to_string(),
            });
        }

        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        let root = self
            .staging_dir
            .join("functions")
            .join(sanitize_component(&definition.name))
            .join(sanitize_component(&definition.version))
            .join(generation.to_string());
        let layers = definition.layers.clone();
        let function = definition.name.clone();
        let staging_dir = self.staging_dir.clone();
        let staged = tokio::task::spawn_blocking(move || {
            layout::stage(root, generation, &code_path, &layers, &staging_dir).map_err(|e| {
                EngineError::AssetUnavailable {
                    function,
                    path: code_path.display().to_string(),
                    reason: e.to_string(),
                }
            })
        })
        .await
        .map_err(|e| EngineError::IoError(format!("Staging task failed: {}", e)))??;

        let staged = Arc::new(staged);
        log::debug!(
            "Staged '{}' generation {} at {}",
            key,
            generation,
            staged.root().display()
        );

        let mut cache = self.lock_cache();
        let current_epoch = cache.epochs.get(&definition.name).copied().unwrap_or(0);
        if current_epoch != epoch {
            return Ok(staged);
        }
        let cached = cache.layouts.entry(key).or_insert_with(|| staged.clone());
        Ok(cached.clone())
    }

    /// Write the runtime's bootstrap shim into a directory shared by every
    /// function using that runtime.
    async fn ensure_shim(
        &self,
        runtime: &str,
        family: RuntimeFamily,
    ) -> Result<PathBuf, EngineError> {
        let dir = self
            .staging_dir
            .join("runtimes")
            .join(sanitize_component(runtime));
        tokio::fs::create_dir_all(&dir).await?;
        if let Some((file_name, contents)) = family.shim() {
            let path = dir.join(file_name);
            tokio::task::spawn_blocking(move || layout::write_if_changed(&path, contents))
                .await
                .map_err(|e| EngineError::IoError(format!("Shim write task failed: {}", e)))??;
        }
        Ok(dir)
    }

    /// Standard variables, then service redirection, then the function's own
    /// variables; later sources win.
    fn merged_environment(
        &self,
        definition: &FunctionDefinition,
        family: RuntimeFamily,
    ) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        let standard = [
            ("AWS_LAMBDA_FUNCTION_NAME", definition.name.clone()),
            ("AWS_LAMBDA_FUNCTION_VERSION", definition.version.clone()),
            (
                "AWS_LAMBDA_FUNCTION_MEMORY_SIZE",
                definition.memory_mb.to_string(),
            ),
            (
                "AWS_LAMBDA_FUNCTION_TIMEOUT",
                definition.timeout_secs.to_string(),
            ),
            ("AWS_EXECUTION_ENV", format!("AWS_Lambda_{}", definition.runtime)),
            ("_HANDLER", definition.handler.clone()),
            ("LAMBDA_TASK_ROOT", TASK_ROOT.to_string()),
            ("LAMBDA_RUNTIME_DIR", RUNTIME_DIR.to_string()),
            ("TZ", "UTC".to_string()),
        ];
        for (key, value) in standard {
            env.insert(key.to_string(), value);
        }
        for (key, value) in family.extra_env() {
            env.insert(key.to_string(), value);
        }
        env.extend(self.env_builder.build_env(definition));
        env.extend(definition.environment.clone());
        env
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::function::EndpointEnvironment;
    use std::fs;
    use tempfile::tempdir;

    fn resolver(staging: &Path) -> ImageResolver {
        let mut endpoints = BTreeMap::new();
        endpoints.insert("sqs".to_string(), "http://localhost:9324".to_string());
        ImageResolver::new(
            ImageCatalog::default(),
            staging.to_path_buf(),
            Arc::new(EndpointEnvironment::new(endpoints)),
        )
    }

    #[tokio::test]
    async fn test_prepare_python_function() {
        let code = tempdir().unwrap();
        fs::write(code.path().join("app.py"), "def handler(e, c): return e").unwrap();
        let staging = tempdir().unwrap();
        let resolver = resolver(staging.path());

        let def = FunctionDefinition::new("echo", "python3.12", code.path(), "app.handler")
            .with_env("AWS_REGION", "eu-west-1");
        let prepared = resolver.prepare(&def).await.unwrap();

        assert_eq!(prepared.image, "python:3.12-slim");
        assert_eq!(
            prepared.invoke_command,
            vec!["python3".to_string(), "/var/runtime/bootstrap.py".to_string()]
        );
        assert!(prepared.layout.task_dir().join("app.py").is_file());
        assert!(staging
            .path()
            .join("runtimes")
            .join("python3.12")
            .join("bootstrap.py")
            .is_file());
        assert_eq!(prepared.mounts.len(), 3);
        assert!(prepared.mounts.iter().all(|m| m.read_only));

        // function-declared variables win over redirection
        assert_eq!(
            prepared.environment.get("AWS_REGION").map(String::as_str),
            Some("eu-west-1")
        );
        assert_eq!(
            prepared
                .environment
                .get("AWS_ENDPOINT_URL_SQS")
                .map(String::as_str),
            Some("http://host.docker.internal:9324")
        );
        assert_eq!(
            prepared.environment.get("_HANDLER").map(String::as_str),
            Some("app.handler")
        );
    }

    #[tokio::test]
    async fn test_layout_is_cached_until_invalidated() {
        let code = tempdir().unwrap();
        fs::write(code.path().join("index.js"), "v1").unwrap();
        let staging = tempdir().unwrap();
        let resolver = resolver(staging.path());
        let def = FunctionDefinition::new("fn", "nodejs20.x", code.path(), "index.handler");

        let first = resolver.prepare(&def).await.unwrap();
        fs::write(code.path().join("index.js"), "v2").unwrap();
        let second = resolver.prepare(&def).await.unwrap();
        assert!(Arc::ptr_eq(&first.layout, &second.layout));
        assert_eq!(
            fs::read_to_string(second.layout.task_dir().join("index.js")).unwrap(),
            "v1"
        );

        resolver.invalidate("fn");
        let third = resolver.prepare(&def).await.unwrap();
        assert_ne!(third.layout.generation(), first.layout.generation());
        assert_eq!(
            fs::read_to_string(third.layout.task_dir().join("index.js")).unwrap(),
            "v2"
        );
        // the old snapshot is still intact for sandboxes that hold it
        assert_eq!(
            fs::read_to_string(first.layout.task_dir().join("index.js")).unwrap(),
            "v1"
        );
    }

    #[tokio::test]
    async fn test_snapshots_never_contain_staging_nested_in_code() {
        let code = tempdir().unwrap();
        fs::write(code.path().join("app.py"), "def handler(e, c): return e").unwrap();
        let staging = code.path().join(".localfn");
        let resolver = resolver(&staging);
        let def = FunctionDefinition::new("echo", "python3.12", code.path(), "app.handler");

        let first = resolver.prepare(&def).await.unwrap();
        resolver.invalidate("echo");
        let second = resolver.prepare(&def).await.unwrap();

        for prepared in [&first, &second] {
            let task = prepared.layout.task_dir();
            assert!(task.join("app.py").is_file());
            let entries: Vec<_> = fs::read_dir(&task)
                .unwrap()
                .map(|e| e.unwrap().file_name())
                .collect();
            assert_eq!(entries, vec![std::ffi::OsString::from("app.py")]);
        }
    }

    #[tokio::test]
    async fn test_unsupported_runtime_and_missing_code() {
        let staging = tempdir().unwrap();
        let resolver = resolver(staging.path());

        let def = FunctionDefinition::new("f", "cobol85", "/tmp", "main");
        assert!(matches!(
            resolver.prepare(&def).await,
            Err(EngineError::UnsupportedRuntime { .. })
        ));

        let def = FunctionDefinition::new("f", "python3.12", "/no/such/dir", "app.handler");
        assert!(matches!(
            resolver.prepare(&def).await,
            Err(EngineError::AssetUnavailable { .. })
        ));
    }
}
