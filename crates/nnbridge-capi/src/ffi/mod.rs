//! Exported `nn_*` functions, grouped by the object they operate on.
//!
//! Every function validates its pointer and handle arguments before touching
//! the runtime. Failures return the function's failure value (null handle,
//! `false`, `-1`, an empty collection or an [`ErrorCode`](crate::ErrorCode))
//! and are logged at `warn` with the function name. Panics never cross the
//! boundary.

use std::os::raw::c_char;

use crate::config::required_str;
use crate::error::{BoundaryError, Result};

pub mod cv;
pub mod express;
pub mod interpreter;
pub mod llm;
pub mod runtime;
pub mod session;
pub mod tensor;

// Safety limits on caller-supplied sizes
const MAX_PATH_LEN: usize = 4096;
const MAX_DIMS: usize = 8;
const MAX_MODEL_BYTES: usize = 1 << 30;

/// Read a file path argument.
///
/// # Safety
/// `ptr` must be null or a valid null-terminated string.
unsafe fn path_arg<'a>(ptr: *const c_char, what: &'static str) -> Result<&'a str> {
    let path = unsafe { required_str(ptr, what) }?;
    if path.len() > MAX_PATH_LEN {
        return Err(BoundaryError::TooLarge(what));
    }
    Ok(path)
}

/// Read a shape argument of `count` extents.
///
/// # Safety
/// `shape` must point to `count` values when `count` is non-zero.
unsafe fn shape_arg(shape: *const i32, count: usize) -> Result<Vec<i32>> {
    if count > MAX_DIMS {
        return Err(BoundaryError::TooLarge("shape"));
    }
    if count > 0 && shape.is_null() {
        return Err(BoundaryError::NullPointer("shape"));
    }
    let dims = unsafe { nnbridge_ffi_common::slice_or_empty(shape, count) }.to_vec();
    if let Some(d) = dims.iter().find(|&&d| d < 0) {
        return Err(BoundaryError::config(format!("negative extent {} in shape", d)));
    }
    Ok(dims)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CString;
    use std::ptr;

    #[test]
    fn test_path_arg_limits() {
        assert!(matches!(unsafe { path_arg(ptr::null(), "path") }, Err(BoundaryError::NullPointer("path"))));
        let long = CString::new("a".repeat(MAX_PATH_LEN + 1)).unwrap();
        assert!(matches!(unsafe { path_arg(long.as_ptr(), "path") }, Err(BoundaryError::TooLarge(_))));
        let ok = CString::new("/tmp/model.json").unwrap();
        assert_eq!(unsafe { path_arg(ok.as_ptr(), "path") }.unwrap(), "/tmp/model.json");
    }

    #[test]
    fn test_shape_arg() {
        let dims = [1, 3, 4];
        assert_eq!(unsafe { shape_arg(dims.as_ptr(), 3) }.unwrap(), vec![1, 3, 4]);
        assert_eq!(unsafe { shape_arg(ptr::null(), 0) }.unwrap(), Vec::<i32>::new());
        assert!(unsafe { shape_arg(ptr::null(), 2) }.is_err());
        assert!(unsafe { shape_arg([1, -2].as_ptr(), 2) }.is_err());
        assert!(unsafe { shape_arg(dims.as_ptr(), MAX_DIMS + 1) }.is_err());
    }
}
