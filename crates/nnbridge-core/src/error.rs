//! Error types for the reference runtime

use std::path::PathBuf;

use thiserror::Error;

/// Result type for runtime operations
pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Errors that can occur inside the runtime.
///
/// Variants line up with the failure classes the C boundary reports, so the
/// boundary can map them without inspecting messages.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// Model file does not exist
    #[error("model file not found: {0}")]
    FileNotExist(PathBuf),

    /// Model file exists but could not be read
    #[error("failed to open {path}: {source}")]
    FileOpenFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Cache file could not be written
    #[error("failed to write {path}: {source}")]
    FileCreateFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Model bytes are not a valid model description
    #[error("invalid model: {0}")]
    InvalidModel(String),

    /// Model buffer was released; no new sessions can be created
    #[error("model buffer has been released")]
    ModelReleased,

    /// Shape inference failed for an operator
    #[error("shape mismatch in op '{op}': {detail}")]
    ComputeSize { op: String, detail: String },

    /// Session has no prepared execution for its current input shapes
    #[error("session must be resized before running")]
    ResizeRequired,

    /// Requested execution path selects no operators
    #[error("no execution: {0}")]
    NoExecution(String),

    /// A post-operator observer asked the run to stop
    #[error("run stopped by observer after op '{0}'")]
    CallbackStop(String),

    /// Feature or format not supported by the reference runtime
    #[error("not supported: {0}")]
    NotSupport(String),

    /// Data type not supported for the requested tensor operation
    #[error("tensor type not supported: {0}")]
    TensorNotSupport(String),

    /// Payload size overflowed or the allocator refused it
    #[error("out of memory: cannot allocate {bytes} bytes")]
    OutOfMemory { bytes: usize },

    /// Input data does not match the declared tensor size
    #[error("input data error: expected {expected} bytes, got {actual}")]
    InputData { expected: usize, actual: usize },

    /// Argument out of range or otherwise invalid
    #[error("invalid value: {0}")]
    InvalidValue(String),

    /// Named tensor not present in the session
    #[error("tensor '{0}' not found")]
    TensorNotFound(String),

    /// JSON (de)serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl RuntimeError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        RuntimeError::InvalidValue(msg.into())
    }

    pub fn not_supported(msg: impl Into<String>) -> Self {
        RuntimeError::NotSupport(msg.into())
    }
}
