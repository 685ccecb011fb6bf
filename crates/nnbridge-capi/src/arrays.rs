//! Collections handed to C callers, each with exactly one release function.
//!
//! # Memory Ownership Rules
//!
//! - `NamedTensorListC` owns its name copies; the tensor handles stay owned by
//!   their session. Release with `nn_named_tensor_list_free()`
//! - `IntArrayC` owns its data and error message. Release with
//!   `nn_int_array_free()` (or its aliases `nn_tensor_shape_free()` and
//!   `nn_llm_tokens_free()`)
//! - `VarArrayC` owns both the container and every variable handle in it.
//!   `nn_var_array_free()` destroys the handles too
//! - `StringArrayC` results own every string. Release with
//!   `nn_string_array_free()`

use std::os::raw::c_char;
use std::ptr;

use nnbridge_ffi_common::{free_boxed_slice, free_cstring, guard, vec_into_raw, FfiResult, NamedListC, StringArrayC};

use crate::error::{reject, Result};
use crate::handle::Handle;
use crate::registry::registry;

/// Exported `{count, entries}` list of named tensor handles.
pub type NamedTensorListC = NamedListC<Handle>;

/// C-compatible integer array result
#[repr(C)]
pub struct IntArrayC {
    /// True if operation succeeded
    pub success: bool,
    /// Error message if success is false (owned, must be freed)
    pub error_msg: *mut c_char,
    /// Values (owned)
    pub data: *mut i32,
    pub len: usize,
}

impl FfiResult for IntArrayC {
    const ERROR_FALLBACK: &'static str = "int array error";

    fn error_fields(error_msg: *mut c_char) -> Self {
        Self {
            success: false,
            error_msg,
            data: ptr::null_mut(),
            len: 0,
        }
    }
}

impl IntArrayC {
    pub fn from_vec(values: Vec<i32>) -> Self {
        let (data, len) = vec_into_raw(values);
        Self {
            success: true,
            error_msg: ptr::null_mut(),
            data,
            len,
        }
    }
}

/// Run an exported body producing integers. Errors are logged and carried in
/// `error_msg`; a panic yields `success == false` with no message.
pub(crate) fn int_array_result(func: &'static str, body: impl FnOnce() -> Result<Vec<i32>>) -> IntArrayC {
    guard(func, IntArrayC::error_fields(ptr::null_mut()), || match body() {
        Ok(values) => IntArrayC::from_vec(values),
        Err(err) => {
            reject(func, &err);
            IntArrayC::error(&err.to_string())
        }
    })
}

/// Owned array of variable handles.
#[repr(C)]
pub struct VarArrayC {
    pub vars: *mut Handle,
    pub len: usize,
}

impl VarArrayC {
    pub fn empty() -> Self {
        Self {
            vars: ptr::null_mut(),
            len: 0,
        }
    }

    pub fn from_vec(handles: Vec<Handle>) -> Self {
        let (vars, len) = vec_into_raw(handles);
        Self { vars, len }
    }
}

/// Free a named tensor list. The tensor handles in it remain valid.
#[no_mangle]
pub extern "C" fn nn_named_tensor_list_free(list: NamedTensorListC) {
    unsafe { list.release() };
}

/// Free an integer array result.
#[no_mangle]
pub extern "C" fn nn_int_array_free(array: IntArrayC) {
    unsafe {
        free_cstring(array.error_msg);
        free_boxed_slice(array.data, array.len);
    }
}

/// Free a shape returned by `nn_tensor_shape()` or `nn_var_shape()`.
#[no_mangle]
pub extern "C" fn nn_tensor_shape_free(shape: IntArrayC) {
    nn_int_array_free(shape);
}

/// Free tokens returned by `nn_llm_tokenize()`.
#[no_mangle]
pub extern "C" fn nn_llm_tokens_free(tokens: IntArrayC) {
    nn_int_array_free(tokens);
}

/// Free a variable array and destroy every variable handle in it.
#[no_mangle]
pub extern "C" fn nn_var_array_free(array: VarArrayC) {
    if array.vars.is_null() || array.len == 0 {
        return;
    }
    {
        let handles = unsafe { std::slice::from_raw_parts(array.vars, array.len) };
        let mut reg = registry();
        for &handle in handles {
            if reg.vars.remove(handle).is_none() && !handle.is_null() {
                tracing::warn!(var = ?handle, "variable in array already freed");
            }
        }
    }
    unsafe { free_boxed_slice(array.vars, array.len) };
}

/// Free a string array returned by the library.
#[no_mangle]
pub extern "C" fn nn_string_array_free(array: StringArrayC) {
    unsafe { array.free_owned() };
}
