//! Error codes reported across the C boundary, and the internal error type
//! that maps onto them.

use nnbridge_core::RuntimeError;
use nnbridge_ffi_common::{guard, MarshalError};
use thiserror::Error;

use crate::handle::{Handle, HandleKind};

/// Result type for boundary operations
pub type Result<T> = std::result::Result<T, BoundaryError>;

/// Status codes returned by `nn_*` functions. Values are stable.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    NoError = 0,
    OutOfMemory = 1,
    NotSupport = 2,
    ComputeSizeError = 3,
    NoExecution = 4,
    InvalidValue = 5,

    InputDataError = 10,
    CallbackStop = 11,

    TensorNotSupport = 20,
    TensorNeedDivide = 21,

    FileCreateFailed = 30,
    FileRemoveFailed = 31,
    FileOpenFailed = 32,
    FileCloseFailed = 33,
    FileResizeFailed = 34,
    FileSeekFailed = 35,
    FileNotExist = 36,
    FileUnmapFailed = 37,

    UnknownError = 99,
}

impl ErrorCode {
    pub fn is_ok(&self) -> bool {
        *self == ErrorCode::NoError
    }
}

impl From<&RuntimeError> for ErrorCode {
    fn from(err: &RuntimeError) -> Self {
        match err {
            RuntimeError::FileNotExist(_) => ErrorCode::FileNotExist,
            RuntimeError::FileOpenFailed { .. } => ErrorCode::FileOpenFailed,
            RuntimeError::FileCreateFailed { .. } => ErrorCode::FileCreateFailed,
            RuntimeError::ComputeSize { .. } => ErrorCode::ComputeSizeError,
            RuntimeError::ResizeRequired | RuntimeError::NoExecution(_) => ErrorCode::NoExecution,
            RuntimeError::CallbackStop(_) => ErrorCode::CallbackStop,
            RuntimeError::NotSupport(_) => ErrorCode::NotSupport,
            RuntimeError::TensorNotSupport(_) => ErrorCode::TensorNotSupport,
            RuntimeError::InputData { .. } => ErrorCode::InputDataError,
            RuntimeError::OutOfMemory { .. } => ErrorCode::OutOfMemory,
            RuntimeError::InvalidModel(_)
            | RuntimeError::ModelReleased
            | RuntimeError::InvalidValue(_)
            | RuntimeError::TensorNotFound(_)
            | RuntimeError::Json(_) => ErrorCode::InvalidValue,
        }
    }
}

/// Errors raised at the boundary before or while calling into the runtime.
#[derive(Debug, Error)]
pub enum BoundaryError {
    #[error("null pointer for {0}")]
    NullPointer(&'static str),

    #[error("invalid handle {handle:?} (expected {expected:?})")]
    InvalidHandle { handle: Handle, expected: HandleKind },

    #[error("tensor {0:?} is borrowed from a session and cannot be freed")]
    BorrowedTensor(Handle),

    #[error("session {0:?} is busy")]
    SessionBusy(Handle),

    #[error("invalid config: {0}")]
    Config(String),

    #[error("argument too large: {0}")]
    TooLarge(&'static str),

    #[error(transparent)]
    Marshal(#[from] MarshalError),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

impl BoundaryError {
    pub fn code(&self) -> ErrorCode {
        match self {
            BoundaryError::Runtime(err) => ErrorCode::from(err),
            _ => ErrorCode::InvalidValue,
        }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        BoundaryError::Config(msg.into())
    }
}

pub(crate) fn reject(func: &'static str, err: &BoundaryError) {
    tracing::warn!(func, code = ?err.code(), error = %err, "call rejected");
}

/// Run an exported body whose result is a plain value.
///
/// Errors are logged with the function name and replaced by `fallback()`;
/// panics are caught and also produce `fallback()`.
pub(crate) fn boundary<T>(func: &'static str, fallback: impl Fn() -> T, body: impl FnOnce() -> Result<T>) -> T {
    guard(func, fallback(), || match body() {
        Ok(value) => value,
        Err(err) => {
            reject(func, &err);
            fallback()
        }
    })
}

/// Run an exported body whose result is an [`ErrorCode`].
pub(crate) fn boundary_status(func: &'static str, body: impl FnOnce() -> Result<()>) -> ErrorCode {
    guard(func, ErrorCode::UnknownError, || match body() {
        Ok(()) => ErrorCode::NoError,
        Err(err) => {
            reject(func, &err);
            err.code()
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_runtime_error_mapping() {
        let cases = [
            (RuntimeError::FileNotExist(PathBuf::from("x")), ErrorCode::FileNotExist),
            (RuntimeError::ModelReleased, ErrorCode::InvalidValue),
            (RuntimeError::ResizeRequired, ErrorCode::NoExecution),
            (RuntimeError::OutOfMemory { bytes: 64 }, ErrorCode::OutOfMemory),
            (RuntimeError::CallbackStop("op".into()), ErrorCode::CallbackStop),
            (RuntimeError::InputData { expected: 4, actual: 2 }, ErrorCode::InputDataError),
            (RuntimeError::TensorNotSupport("i8".into()), ErrorCode::TensorNotSupport),
            (
                RuntimeError::ComputeSize {
                    op: "add".into(),
                    detail: "shape".into(),
                },
                ErrorCode::ComputeSizeError,
            ),
        ];
        for (err, code) in cases {
            assert_eq!(BoundaryError::from(err).code(), code);
        }
    }

    #[test]
    fn test_boundary_errors_are_invalid_value() {
        assert_eq!(BoundaryError::NullPointer("path").code(), ErrorCode::InvalidValue);
        assert_eq!(BoundaryError::config("bad path").code(), ErrorCode::InvalidValue);
        assert_eq!(
            BoundaryError::from(MarshalError::InvalidUtf8(2)).code(),
            ErrorCode::InvalidValue
        );
    }

    #[test]
    fn test_stable_values() {
        assert_eq!(ErrorCode::NoError as i32, 0);
        assert_eq!(ErrorCode::InputDataError as i32, 10);
        assert_eq!(ErrorCode::FileNotExist as i32, 36);
        assert_eq!(ErrorCode::UnknownError as i32, 99);
    }

    #[test]
    fn test_boundary_helpers() {
        assert_eq!(boundary("f", || -1, || Ok(3)), 3);
        assert_eq!(boundary("f", || -1, || Err(BoundaryError::NullPointer("x"))), -1);
        assert_eq!(boundary("f", || -1, || -> Result<i32> { panic!("boom") }), -1);
        assert_eq!(boundary_status("f", || Ok(())), ErrorCode::NoError);
        assert_eq!(
            boundary_status("f", || Err(RuntimeError::ResizeRequired.into())),
            ErrorCode::NoExecution
        );
        assert_eq!(boundary_status("f", || panic!("boom")), ErrorCode::UnknownError);
    }
}
