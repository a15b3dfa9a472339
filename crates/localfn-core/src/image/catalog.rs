//! Runtime identifier to container image mapping

use std::collections::BTreeMap;

pub const TASK_ROOT: &str = "/var/task";
pub const RUNTIME_DIR: &str = "/var/runtime";
pub const OPT_DIR: &str = "/opt";

const PYTHON_SHIM: &str = include_str!("shims/bootstrap.py");
const NODE_SHIM: &str = include_str!("shims/bootstrap.js");

const PYTHON_VERSIONS: &[&str] = &["3.8", "3.9", "3.10", "3.11", "3.12", "3.13"];
const NODE_MAJORS: &[&str] = &["16", "18", "20", "22"];
const PROVIDED_RUNTIMES: &[&str] = &["provided", "provided.al2", "provided.al2023"];
const PROVIDED_IMAGE: &str = "debian:bookworm-slim";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeFamily {
    Python,
    Node,
    /// Custom runtime: the code ships its own `bootstrap` executable.
    Provided,
}

impl RuntimeFamily {
    fn detect(runtime: &str) -> Self {
        if runtime.starts_with("python") {
            RuntimeFamily::Python
        } else if runtime.starts_with("nodejs") || runtime.starts_with("node") {
            RuntimeFamily::Node
        } else {
            RuntimeFamily::Provided
        }
    }

    /// Shim file name and contents written into the runtime directory.
    pub fn shim(&self) -> Option<(&'static str, &'static str)> {
        match self {
            RuntimeFamily::Python => Some(("bootstrap.py", PYTHON_SHIM)),
            RuntimeFamily::Node => Some(("bootstrap.js", NODE_SHIM)),
            RuntimeFamily::Provided => None,
        }
    }

    /// Command exec'd inside the sandbox for each invocation.
    pub fn invoke_command(&self) -> Vec<String> {
        match self {
            RuntimeFamily::Python => vec![
                "python3".to_string(),
                format!("{}/bootstrap.py", RUNTIME_DIR),
            ],
            RuntimeFamily::Node => vec!["node".to_string(), format!("{}/bootstrap.js", RUNTIME_DIR)],
            RuntimeFamily::Provided => vec![format!("{}/bootstrap", TASK_ROOT)],
        }
    }

    pub fn extra_env(&self) -> Vec<(&'static str, String)> {
        match self {
            RuntimeFamily::Python => vec![
                ("PYTHONDONTWRITEBYTECODE", "1".to_string()),
                ("PYTHONPATH", format!("{}:{}/python", TASK_ROOT, OPT_DIR)),
            ],
            RuntimeFamily::Node => vec![(
                "NODE_PATH",
                format!(
                    "{}/nodejs/node_modules:{}/node_modules:{}",
                    OPT_DIR, TASK_ROOT, TASK_ROOT
                ),
            )],
            RuntimeFamily::Provided => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeImage {
    pub image: String,
    pub family: RuntimeFamily,
}

#[derive(Debug, Clone, Default)]
pub struct ImageCatalog {
    overrides: BTreeMap<String, String>,
}

impl ImageCatalog {
    pub fn new(overrides: BTreeMap<String, String>) -> Self {
        Self { overrides }
    }

    pub fn lookup(&self, runtime: &str) -> Option<RuntimeImage> {
        if let Some(image) = self.overrides.get(runtime) {
            return Some(RuntimeImage {
                image: image.clone(),
                family: RuntimeFamily::detect(runtime),
            });
        }
        builtin_image(runtime).map(|image| RuntimeImage {
            image,
            family: RuntimeFamily::detect(runtime),
        })
    }
}

fn builtin_image(runtime: &str) -> Option<String> {
    if let Some(version) = runtime.strip_prefix("python") {
        return PYTHON_VERSIONS
            .contains(&version)
            .then(|| format!("python:{}-slim", version));
    }
    if let Some(major) = runtime
        .strip_prefix("nodejs")
        .and_then(|rest| rest.strip_suffix(".x"))
    {
        return NODE_MAJORS
            .contains(&major)
            .then(|| format!("node:{}-slim", major));
    }
    PROVIDED_RUNTIMES
        .contains(&runtime)
        .then(|| PROVIDED_IMAGE.to_string())
}
