//! Error types for the compute engine
//!
//! Three layers of failure are kept apart. `RuntimeError` describes what went
//! wrong talking to the container runtime, `EngineError` covers everything the
//! library can fail at outside an invocation (configuration, staging, lookup),
//! and `InvocationError` is the only error shape that crosses the `invoke`
//! boundary. Every engine-internal failure is folded into one of its variants
//! before it reaches a caller.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RuntimeError {
    #[error("Container runtime unavailable: {0}")]
    Unavailable(String),
    #[error("Container '{0}' not found")]
    NotFound(String),
    #[error("Container runtime operation '{operation}' failed: {message}")]
    Operation { operation: String, message: String },
}

impl RuntimeError {
    pub fn operation(operation: &str, message: impl ToString) -> Self {
        RuntimeError::Operation {
            operation: operation.to_string(),
            message: message.to_string(),
        }
    }
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    ConfigError(String),
    #[error("I/O error: {0}")]
    IoError(String),
    #[error("Function '{name}' (version {version}) not found")]
    FunctionNotFound { name: String, version: String },
    #[error("Unsupported runtime '{runtime}' for function '{function}'")]
    UnsupportedRuntime { function: String, runtime: String },
    #[error("Code for function '{function}' unavailable at {path}: {reason}")]
    AssetUnavailable {
        function: String,
        path: String,
        reason: String,
    },
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        EngineError::IoError(err.to_string())
    }
}

/// Coarse classification of an [`InvocationError`], convenient for matching
/// and for the operation log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InvocationErrorKind {
    FunctionNotFound,
    UnsupportedRuntime,
    AssetUnavailable,
    SandboxStartFailed,
    RuntimeUnavailable,
    InvocationTimeout,
    HandlerError,
    SandboxCrash,
}

impl InvocationErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvocationErrorKind::FunctionNotFound => "function-not-found",
            InvocationErrorKind::UnsupportedRuntime => "unsupported-runtime",
            InvocationErrorKind::AssetUnavailable => "asset-unavailable",
            InvocationErrorKind::SandboxStartFailed => "sandbox-start-failed",
            InvocationErrorKind::RuntimeUnavailable => "runtime-unavailable",
            InvocationErrorKind::InvocationTimeout => "timeout",
            InvocationErrorKind::HandlerError => "handler-error",
            InvocationErrorKind::SandboxCrash => "sandbox-crash",
        }
    }
}

/// Structured failure of one `invoke` call.
///
/// `HandlerError` is the function's own reported failure, not an engine fault.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum InvocationError {
    #[error("Function '{name}' (version {version}) not found")]
    FunctionNotFound { name: String, version: String },
    #[error("Unsupported runtime '{runtime}' for function '{function}'")]
    UnsupportedRuntime { function: String, runtime: String },
    #[error("Code for function '{function}' unavailable: {reason}")]
    AssetUnavailable { function: String, reason: String },
    #[error("Sandbox for function '{function}' failed to start: {reason}")]
    SandboxStartFailed { function: String, reason: String },
    #[error("Container runtime unavailable: {reason}")]
    RuntimeUnavailable { reason: String },
    #[error("Invocation {request_id} timed out after {timeout_ms} ms")]
    InvocationTimeout { request_id: String, timeout_ms: u64 },
    #[error("Invocation {request_id} failed in handler: {error_type}: {message}")]
    HandlerError {
        request_id: String,
        error_type: String,
        message: String,
        stack_trace: Vec<String>,
    },
    #[error("Sandbox crashed during invocation {request_id}: {detail}")]
    SandboxCrash {
        request_id: String,
        exit_code: Option<i64>,
        detail: String,
    },
}

impl InvocationError {
    pub fn kind(&self) -> InvocationErrorKind {
        match self {
            InvocationError::FunctionNotFound { .. } => InvocationErrorKind::FunctionNotFound,
            InvocationError::UnsupportedRuntime { .. } => InvocationErrorKind::UnsupportedRuntime,
            InvocationError::AssetUnavailable { .. } => InvocationErrorKind::AssetUnavailable,
            InvocationError::SandboxStartFailed { .. } => InvocationErrorKind::SandboxStartFailed,
            InvocationError::RuntimeUnavailable { .. } => InvocationErrorKind::RuntimeUnavailable,
            InvocationError::InvocationTimeout { .. } => InvocationErrorKind::InvocationTimeout,
            InvocationError::HandlerError { .. } => InvocationErrorKind::HandlerError,
            InvocationError::SandboxCrash { .. } => InvocationErrorKind::SandboxCrash,
        }
    }

    /// Fold a failure raised while preparing or starting a sandbox into the
    /// invocation taxonomy.
    pub fn from_start_failure(function: &str, err: EngineError) -> Self {
        match err {
            EngineError::UnsupportedRuntime { function, runtime } => {
                InvocationError::UnsupportedRuntime { function, runtime }
            }
            EngineError::AssetUnavailable {
                function,
                path,
                reason,
            } => InvocationError::AssetUnavailable {
                function,
                reason: format!("{}: {}", path, reason),
            },
            EngineError::FunctionNotFound { name, version } => {
                InvocationError::FunctionNotFound { name, version }
            }
            other => InvocationError::SandboxStartFailed {
                function: function.to_string(),
                reason: other.to_string(),
            },
        }
    }
}
