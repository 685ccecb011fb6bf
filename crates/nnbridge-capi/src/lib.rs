//! nnbridge C API
//!
//! C-linkage surface over the nnbridge inference runtime: interpreters,
//! sessions, tensors, runtime managers, the expression layer, image
//! preprocessing and the generation engine.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   Handle / repr(C)   ┌──────────────┐  Arc<Mutex<_>>  ┌───────────────┐
//! │  C caller  │─────────────────────▶│   Registry   │────────────────▶│ nnbridge-core │
//! │ (nn_* API) │◀─────────────────────│ HandleTables │◀────────────────│    runtime    │
//! └────────────┘ ErrorCode / owned    └──────────────┘ RunObserver via └───────────────┘
//!                arrays                                Trampoline
//! ```
//!
//! ## Memory Ownership
//!
//! - Objects are reached through opaque 64-bit [`Handle`]s. A handle carries
//!   its kind and a generation, so stale or mistyped handles are rejected
//!   instead of dereferenced
//! - Every `*_create` / `*_from_*` has exactly one matching `*_free`
//! - Tensors returned by session lookups are borrowed: they belong to the
//!   session and `nn_tensor_free()` refuses them
//! - Collections and strings returned by value carry their own release
//!   function (`nn_named_tensor_list_free()`, `nn_int_array_free()`,
//!   `nn_string_array_free()`, `nn_string_free()` and so on)
//!
//! ## Thread Safety
//!
//! All entry points may be called from any thread. A session runs on one
//! thread at a time; a second concurrent call on the same session fails with
//! `InvalidValue` instead of blocking. Tensor callbacks run on the calling
//! thread, in operator order.
//!
//! ## Logging
//!
//! Diagnostics are `tracing` events. Call `nn_init_logger()` to install a
//! subscriber controlled by `RUST_LOG`.

mod arrays;
mod config;
mod error;
pub mod ffi;
mod handle;
mod logging;
mod registry;
mod trampoline;

pub use arrays::{IntArrayC, NamedTensorListC, VarArrayC};
pub use config::{ImageProcessConfigC, ModuleConfigC, ScheduleConfigC, SchedulePathC};
pub use error::{BoundaryError, ErrorCode};
pub use handle::{Handle, HandleKind};
pub use trampoline::{OperatorInfoC, TensorCallback, TensorCallbackInfo};

pub use nnbridge_core::{BackendConfig, DimensionType, ForwardType, TypeTag};
pub use nnbridge_ffi_common::{NamedEntryC, StringArrayC};

// Flat C namespace
pub use arrays::{
    nn_int_array_free, nn_llm_tokens_free, nn_named_tensor_list_free, nn_string_array_free, nn_tensor_shape_free,
    nn_var_array_free,
};
pub use ffi::cv::*;
pub use ffi::express::*;
pub use ffi::interpreter::*;
pub use ffi::llm::*;
pub use ffi::runtime::*;
pub use ffi::session::*;
pub use ffi::tensor::*;
pub use logging::nn_init_logger;

nnbridge_ffi_common::define_version_fn!(nn_version);
nnbridge_ffi_common::define_string_free!(nn_string_free);

/// Number of live objects of `kind` (a [`HandleKind`] value), or -1 for an
/// unknown kind. Diagnostic only.
#[no_mangle]
pub extern "C" fn nn_live_handles(kind: i32) -> i32 {
    let Some(kind) = u8::try_from(kind).ok().and_then(HandleKind::from_u8) else {
        tracing::warn!(kind, "unknown handle kind");
        return -1;
    };
    registry::registry().live(kind) as i32
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CStr;

    #[test]
    fn test_version_matches_package() {
        let version = unsafe { CStr::from_ptr(nn_version()) }.to_str().unwrap();
        assert_eq!(version, env!("CARGO_PKG_VERSION"));
    }

    #[test]
    fn test_live_handles_unknown_kind() {
        assert_eq!(nn_live_handles(0), -1);
        assert_eq!(nn_live_handles(42), -1);
        assert_eq!(nn_live_handles(-7), -1);
        assert!(nn_live_handles(HandleKind::Matrix as i32) >= 0);
    }

    #[test]
    fn test_string_free_accepts_null() {
        nn_string_free(std::ptr::null_mut());
    }
}
