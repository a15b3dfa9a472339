//! Local compute execution engine for serverless functions.
//!
//! This crate turns a packaged function artifact into a running, invokable
//! container sandbox and keeps those sandboxes healthy, reloadable and
//! observable on a developer machine. The container runtime is treated as an
//! unreliable external dependency: when it is missing the engine reports a
//! degraded lifecycle state instead of failing every call.
//!
//! # Architecture Overview
//!
//! - **Image resolution**: runtime identifier to image, staged code layout and merged environment
//! - **Sandbox pool**: registry of live containers with concurrency limits, draining and idle reaping
//! - **Invocation protocol**: framed request/response exchange with a bootstrap shim inside the sandbox
//! - **Reload watching**: source fingerprinting that retires sandboxes once in-flight work drains
//! - **Operation log**: bounded, non-blocking record of every lifecycle and invocation event
//! - **Engine facade**: lifecycle contract (`start`/`stop`/`healthy`) and the single `invoke` entry point

pub mod config;
pub mod engine;
pub mod errors;
pub mod function;
pub mod image;
pub mod oplog;
pub mod pool;
pub mod protocol;
pub mod reload;
pub mod runtime;

pub use config::{ConfigLoader, EngineConfig};
pub use engine::{InvocationResult, LifecycleState, LocalComputeEngine};
pub use errors::{EngineError, InvocationError, InvocationErrorKind, RuntimeError};
pub use function::{
    EndpointEnvironment, EnvironmentBuilder, FunctionDefinition, FunctionKey, FunctionProvider,
    StaticFunctionProvider,
};
pub use oplog::{OperationCategory, OperationLog, OperationRecord};
pub use runtime::{docker::DockerRuntime, ContainerRuntime};

#[cfg(test)]
pub mod test_utils;
