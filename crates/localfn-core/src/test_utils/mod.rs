//! Test helpers shared by the pool, protocol and engine tests.

pub mod fake_runtime;

pub use fake_runtime::FakeRuntime;

use crate::function::{EndpointEnvironment, FunctionDefinition};
use crate::image::catalog::ImageCatalog;
use crate::image::ImageResolver;
use crate::oplog::OperationLog;
use crate::pool::{PoolSettings, SandboxPool};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Write the behaviour script the fake runtime's "shim" follows.
pub fn write_script(code_dir: &Path, script: Value) {
    std::fs::create_dir_all(code_dir).unwrap();
    std::fs::write(
        code_dir.join(fake_runtime::SCRIPT_FILE),
        serde_json::to_vec_pretty(&script).unwrap(),
    )
    .unwrap();
}

pub fn python_function(name: &str, code_dir: &Path) -> FunctionDefinition {
    FunctionDefinition::new(name, "python3.12", code_dir, "app.handler")
}

pub fn test_resolver(staging_dir: &Path) -> Arc<ImageResolver> {
    Arc::new(ImageResolver::new(
        ImageCatalog::default(),
        staging_dir.to_path_buf(),
        Arc::new(EndpointEnvironment::new(BTreeMap::new())),
    ))
}

/// A pool over a fresh [`FakeRuntime`] with concurrency 1.
pub fn test_pool(staging_dir: &Path) -> (FakeRuntime, SandboxPool) {
    let runtime = FakeRuntime::new();
    let pool = SandboxPool::new(
        Arc::new(runtime.clone()),
        test_resolver(staging_dir),
        OperationLog::new(64),
        PoolSettings {
            namespace: "localfn-test".to_string(),
            default_concurrency: 1,
            idle_timeout: Duration::from_secs(300),
            stop_timeout: Duration::from_secs(1),
            probe_timeout: Duration::from_millis(200),
            pull_images: false,
        },
    );
    (runtime, pool)
}
