//! Interpreter lifecycle, settings and model metadata.
//!
//! # Memory Ownership Rules
//!
//! - `nn_interpreter_from_file()` / `nn_interpreter_from_buffer()` return an
//!   owned handle; release it with `nn_interpreter_free()`
//! - Freeing an interpreter also releases any sessions still attached to it
//! - `nn_interpreter_model_buffer()` and the version/biz code/uuid accessors
//!   return borrowed pointers, valid until `nn_interpreter_release_model()`
//!   (buffer only) or `nn_interpreter_free()`

use std::os::raw::c_char;
use std::ptr;
use std::sync::Arc;

use nnbridge_core::{Interpreter, RuntimeError};
use nnbridge_ffi_common::slice_or_empty;

use super::{path_arg, shape_arg, MAX_MODEL_BYTES};
use crate::error::{boundary, boundary_status, BoundaryError, ErrorCode, Result};
use crate::handle::Handle;
use crate::registry::registry;

fn interpreter(handle: Handle) -> Result<Arc<parking_lot::Mutex<Interpreter>>> {
    registry().interpreter(handle)
}

/// Load a model file. Returns the null handle on failure.
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn nn_interpreter_from_file(path: *const c_char) -> Handle {
    boundary("nn_interpreter_from_file", || Handle::NULL, || {
        let path = unsafe { path_arg(path, "path") }?;
        let interp = Interpreter::from_file(path)?;
        let handle = registry().insert_interpreter(interp);
        tracing::debug!(?handle, path, "interpreter created");
        Ok(handle)
    })
}

/// Load a model from memory. The bytes are copied.
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn nn_interpreter_from_buffer(data: *const u8, len: usize) -> Handle {
    boundary("nn_interpreter_from_buffer", || Handle::NULL, || {
        if data.is_null() || len == 0 {
            return Err(BoundaryError::NullPointer("buffer"));
        }
        if len > MAX_MODEL_BYTES {
            return Err(BoundaryError::TooLarge("buffer"));
        }
        let bytes = unsafe { slice_or_empty(data, len) };
        let interp = Interpreter::from_buffer(bytes)?;
        let handle = registry().insert_interpreter(interp);
        tracing::debug!(?handle, len, "interpreter created from buffer");
        Ok(handle)
    })
}

/// Destroy an interpreter and every session still attached to it.
#[no_mangle]
pub extern "C" fn nn_interpreter_free(interpreter: Handle) -> bool {
    boundary("nn_interpreter_free", || false, || {
        registry().remove_interpreter(interpreter)?;
        Ok(true)
    })
}

/// Number of sessions attached to the interpreter, or -1.
#[no_mangle]
pub extern "C" fn nn_interpreter_session_count(interpreter: Handle) -> i32 {
    boundary("nn_interpreter_session_count", || -1, || {
        let interp = self::interpreter(interpreter)?;
        let count = interp.lock().session_count();
        Ok(count as i32)
    })
}

#[no_mangle]
pub extern "C" fn nn_interpreter_set_session_mode(interpreter: Handle, mode: i32) -> ErrorCode {
    boundary_status("nn_interpreter_set_session_mode", || {
        self::interpreter(interpreter)?.lock().set_session_mode(mode);
        Ok(())
    })
}

/// Configure the file written by `nn_interpreter_update_cache_file()`.
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn nn_interpreter_set_cache_file(interpreter: Handle, path: *const c_char, key_size: usize) -> ErrorCode {
    boundary_status("nn_interpreter_set_cache_file", || {
        let path = unsafe { path_arg(path, "cache path") }?;
        self::interpreter(interpreter)?.lock().set_cache_file(path, key_size);
        Ok(())
    })
}

#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn nn_interpreter_set_external_file(interpreter: Handle, path: *const c_char, flag: usize) -> ErrorCode {
    boundary_status("nn_interpreter_set_external_file", || {
        let path = unsafe { path_arg(path, "external path") }?;
        tracing::debug!(path, flag, "external file set");
        self::interpreter(interpreter)?.lock().set_external_file(path);
        Ok(())
    })
}

/// Write the cache record for `session`. No-op without a cache file.
#[no_mangle]
pub extern "C" fn nn_interpreter_update_cache_file(interpreter: Handle, session: Handle, flag: i32) -> ErrorCode {
    boundary_status("nn_interpreter_update_cache_file", || {
        let (interp, shared) = {
            let reg = registry();
            let entry = reg.session_entry(session)?;
            if entry.interpreter != interpreter {
                return Err(BoundaryError::config("session belongs to another interpreter"));
            }
            (reg.interpreter(interpreter)?, Arc::clone(&entry.session))
        };
        let guard = shared.try_lock().ok_or(BoundaryError::SessionBusy(session))?;
        tracing::trace!(flag, "updating cache file");
        interp.lock().update_cache_file(&guard)?;
        Ok(())
    })
}

#[no_mangle]
pub extern "C" fn nn_interpreter_set_session_hint(interpreter: Handle, mode: i32, value: i32) -> ErrorCode {
    boundary_status("nn_interpreter_set_session_hint", || {
        self::interpreter(interpreter)?.lock().set_session_hint(mode, value);
        Ok(())
    })
}

#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn nn_interpreter_set_session_hint_array(
    interpreter: Handle,
    mode: i32,
    values: *const i32,
    len: usize,
) -> ErrorCode {
    boundary_status("nn_interpreter_set_session_hint_array", || {
        if values.is_null() && len > 0 {
            return Err(BoundaryError::NullPointer("hint values"));
        }
        let values = unsafe { slice_or_empty(values, len) };
        self::interpreter(interpreter)?.lock().set_session_hint_array(mode, values);
        Ok(())
    })
}

/// Drop the model bytes. Existing sessions keep working; creating new ones
/// fails afterwards.
#[no_mangle]
pub extern "C" fn nn_interpreter_release_model(interpreter: Handle) -> ErrorCode {
    boundary_status("nn_interpreter_release_model", || {
        self::interpreter(interpreter)?.lock().release_model();
        Ok(())
    })
}

/// Borrowed view of the model bytes; the length is written to `out_len`.
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn nn_interpreter_model_buffer(interpreter: Handle, out_len: *mut usize) -> *const u8 {
    boundary("nn_interpreter_model_buffer", ptr::null, || {
        if out_len.is_null() {
            return Err(BoundaryError::NullPointer("out_len"));
        }
        let interp = self::interpreter(interpreter)?;
        let guard = interp.lock();
        let buffer = guard.model_buffer().ok_or(RuntimeError::ModelReleased)?;
        unsafe { *out_len = buffer.len() };
        Ok(buffer.as_ptr())
    })
}

fn metadata(func: &'static str, interpreter: Handle, pick: fn(&crate::registry::InterpreterEntry) -> *const c_char) -> *const c_char {
    boundary(func, ptr::null, || Ok(pick(registry().interpreter_entry(interpreter)?)))
}

/// Model version string, borrowed.
#[no_mangle]
pub extern "C" fn nn_interpreter_model_version(interpreter: Handle) -> *const c_char {
    metadata("nn_interpreter_model_version", interpreter, |e| e.version.as_ptr())
}

/// Model business code, borrowed.
#[no_mangle]
pub extern "C" fn nn_interpreter_biz_code(interpreter: Handle) -> *const c_char {
    metadata("nn_interpreter_biz_code", interpreter, |e| e.biz_code.as_ptr())
}

/// Model UUID, borrowed.
#[no_mangle]
pub extern "C" fn nn_interpreter_uuid(interpreter: Handle) -> *const c_char {
    metadata("nn_interpreter_uuid", interpreter, |e| e.uuid.as_ptr())
}

/// Reshape a tensor. Sessions reading it must be resized before the next run.
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn nn_interpreter_resize_tensor(
    interpreter: Handle,
    tensor: Handle,
    dims: *const i32,
    dim_count: usize,
) -> ErrorCode {
    boundary_status("nn_interpreter_resize_tensor", || {
        let dims = unsafe { shape_arg(dims, dim_count) }?;
        let (interp, tensor) = {
            let reg = registry();
            (reg.interpreter(interpreter)?, reg.tensor(tensor)?)
        };
        interp.lock().resize_tensor(&tensor, dims)?;
        Ok(())
    })
}

#[no_mangle]
pub extern "C" fn nn_interpreter_resize_tensor_4d(
    interpreter: Handle,
    tensor: Handle,
    batch: i32,
    channel: i32,
    height: i32,
    width: i32,
) -> ErrorCode {
    boundary_status("nn_interpreter_resize_tensor_4d", || {
        let (interp, tensor) = {
            let reg = registry();
            (reg.interpreter(interpreter)?, reg.tensor(tensor)?)
        };
        interp.lock().resize_tensor_4d(&tensor, batch, channel, height, width)?;
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::{CStr, CString};

    const MODEL: &str = r#"{
        "version": "1.2", "biz_code": "demo", "uuid": "u-1",
        "inputs": [{"name": "x", "shape": [1, 4]}],
        "ops": [{"name": "act", "type": "Tanh", "inputs": ["x"], "outputs": ["y"]}],
        "outputs": ["y"]
    }"#;

    fn load() -> Handle {
        nn_interpreter_from_buffer(MODEL.as_ptr(), MODEL.len())
    }

    #[test]
    fn test_missing_file_gives_null() {
        let path = CString::new("/definitely/not/here.json").unwrap();
        assert!(nn_interpreter_from_file(path.as_ptr()).is_null());
        assert!(nn_interpreter_from_file(ptr::null()).is_null());
    }

    #[test]
    fn test_metadata_strings() {
        let h = load();
        let version = unsafe { CStr::from_ptr(nn_interpreter_model_version(h)) };
        let biz = unsafe { CStr::from_ptr(nn_interpreter_biz_code(h)) };
        let uuid = unsafe { CStr::from_ptr(nn_interpreter_uuid(h)) };
        assert_eq!(version.to_str().unwrap(), "1.2");
        assert_eq!(biz.to_str().unwrap(), "demo");
        assert_eq!(uuid.to_str().unwrap(), "u-1");
        assert!(nn_interpreter_free(h));
        assert!(nn_interpreter_uuid(h).is_null());
        assert!(!nn_interpreter_free(h));
    }

    #[test]
    fn test_model_buffer_and_release() {
        let h = load();
        let mut len = 0usize;
        let data = nn_interpreter_model_buffer(h, &mut len);
        assert!(!data.is_null());
        assert_eq!(len, MODEL.len());
        assert_eq!(nn_interpreter_release_model(h), ErrorCode::NoError);
        assert!(nn_interpreter_model_buffer(h, &mut len).is_null());
        assert!(nn_interpreter_model_buffer(h, ptr::null_mut()).is_null());
        nn_interpreter_free(h);
    }

    #[test]
    fn test_settings_validate_handles() {
        let h = load();
        assert_eq!(nn_interpreter_set_session_mode(h, 3), ErrorCode::NoError);
        assert_eq!(nn_interpreter_set_session_hint(h, 0, 8), ErrorCode::NoError);
        let hints = [1, 2, 3];
        assert_eq!(
            nn_interpreter_set_session_hint_array(h, 1, hints.as_ptr(), hints.len()),
            ErrorCode::NoError
        );
        assert_eq!(
            nn_interpreter_set_session_hint_array(h, 1, ptr::null(), 2),
            ErrorCode::InvalidValue
        );
        assert_eq!(nn_interpreter_set_cache_file(h, ptr::null(), 8), ErrorCode::InvalidValue);
        nn_interpreter_free(h);
        assert_eq!(nn_interpreter_set_session_mode(h, 3), ErrorCode::InvalidValue);
        assert_eq!(nn_interpreter_set_session_mode(Handle::NULL, 3), ErrorCode::InvalidValue);
    }

    #[test]
    fn test_bad_buffer() {
        assert!(nn_interpreter_from_buffer(ptr::null(), 10).is_null());
        let junk = b"not a model";
        assert!(nn_interpreter_from_buffer(junk.as_ptr(), junk.len()).is_null());
    }
}
