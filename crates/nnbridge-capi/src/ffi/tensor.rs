//! Tensor creation, data movement and shape queries.
//!
//! # Memory Ownership Rules
//!
//! - Tensors created here are owned by the caller; release with `nn_tensor_free()`
//! - Tensors obtained from a session are borrowed and `nn_tensor_free()`
//!   refuses them
//! - `nn_tensor_host()` returns a borrowed pointer, valid until the tensor is
//!   freed or reshaped
//! - `nn_tensor_shape()` returns an owned array; release with `nn_tensor_shape_free()`

use std::ffi::c_void;
use std::ptr;

use nnbridge_core::{DimensionType, SharedTensor, Tensor, TypeTag};
use nnbridge_ffi_common::slice_or_empty;

use super::{shape_arg, MAX_DIMS};
use crate::arrays::{int_array_result, IntArrayC};
use crate::error::{boundary, BoundaryError, Result};
use crate::handle::Handle;
use crate::registry::registry;

fn shared(handle: Handle) -> Result<SharedTensor> {
    registry().tensor(handle)
}

fn read<T>(handle: Handle, f: impl FnOnce(&Tensor) -> T) -> Result<T> {
    let tensor = shared(handle)?;
    let guard = tensor.read();
    Ok(f(&guard))
}

fn dim_type_arg(value: i32) -> Result<DimensionType> {
    DimensionType::from_i32(value).ok_or_else(|| BoundaryError::config(format!("unknown dimension type {}", value)))
}

fn type_arg(dtype: TypeTag) -> Result<TypeTag> {
    if dtype.type_code().is_none() || dtype.bits == 0 {
        return Err(BoundaryError::config(format!("invalid type tag {:?}", dtype)));
    }
    Ok(dtype)
}

fn insert(tensor: Tensor) -> Handle {
    registry().insert_tensor(tensor.into_shared())
}

/// Create a host tensor with `dim_count` empty dimensions.
#[no_mangle]
pub extern "C" fn nn_tensor_create(dim_count: i32, dim_type: i32) -> Handle {
    boundary("nn_tensor_create", || Handle::NULL, || {
        let dims = nnbridge_ffi_common::count_to_len(dim_count)?;
        if dims > MAX_DIMS {
            return Err(BoundaryError::TooLarge("dim_count"));
        }
        Ok(insert(Tensor::with_dims(dims, dim_type_arg(dim_type)?)))
    })
}

/// Create a host tensor with the shape and type of `tensor`.
#[no_mangle]
pub extern "C" fn nn_tensor_create_from_existing(tensor: Handle, dim_type: i32, alloc: bool) -> Handle {
    boundary("nn_tensor_create_from_existing", || Handle::NULL, || {
        let dim_type = dim_type_arg(dim_type)?;
        let created = read(tensor, |src| Tensor::from_existing(src, dim_type, alloc))??;
        Ok(insert(created))
    })
}

/// Create a zero-filled device tensor. Returns the null handle when the
/// payload size overflows or cannot be allocated.
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn nn_tensor_create_device(shape: *const i32, dim_count: usize, dtype: TypeTag, dim_type: i32) -> Handle {
    boundary("nn_tensor_create_device", || Handle::NULL, || {
        let shape = unsafe { shape_arg(shape, dim_count) }?;
        Ok(insert(Tensor::new_device(shape, type_arg(dtype)?, dim_type_arg(dim_type)?)?))
    })
}

/// Create a host tensor. `data` (`data_len` bytes) is copied; a null `data`
/// gives a zero-filled tensor.
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn nn_tensor_create_host(
    shape: *const i32,
    dim_count: usize,
    dtype: TypeTag,
    data: *const c_void,
    data_len: usize,
    dim_type: i32,
) -> Handle {
    boundary("nn_tensor_create_host", || Handle::NULL, || {
        let shape = unsafe { shape_arg(shape, dim_count) }?;
        let dtype = type_arg(dtype)?;
        let dim_type = dim_type_arg(dim_type)?;
        let tensor = if data.is_null() {
            Tensor::new(shape, dtype, dim_type)?
        } else {
            let bytes = unsafe { slice_or_empty(data as *const u8, data_len) };
            Tensor::from_host_bytes(shape, dtype, bytes, dim_type)?
        };
        Ok(insert(tensor))
    })
}

/// Copy a tensor into a new owned handle. A shallow clone keeps shape and
/// type only.
#[no_mangle]
pub extern "C" fn nn_tensor_clone(tensor: Handle, deep: bool) -> Handle {
    boundary("nn_tensor_clone", || Handle::NULL, || {
        let copy = read(tensor, |src| src.duplicate(deep))??;
        Ok(insert(copy))
    })
}

/// Free an owned tensor. Returns false for borrowed or invalid handles.
#[no_mangle]
pub extern "C" fn nn_tensor_free(tensor: Handle) -> bool {
    boundary("nn_tensor_free", || false, || {
        registry().remove_tensor(tensor)?;
        Ok(true)
    })
}

/// Host copy of a tensor in a new owned handle.
#[no_mangle]
pub extern "C" fn nn_tensor_create_host_from_device(tensor: Handle, copy: bool) -> Handle {
    boundary("nn_tensor_create_host_from_device", || Handle::NULL, || {
        let host = read(tensor, |src| src.host_from_device(copy))??;
        Ok(insert(host))
    })
}

/// Copy `from` into `to`. Both must have the same byte size.
fn copy_between(from: Handle, to: Handle) -> Result<()> {
    let (src, dst) = {
        let reg = registry();
        (reg.tensor(from)?, reg.tensor(to)?)
    };
    if std::sync::Arc::ptr_eq(&src, &dst) {
        return Ok(());
    }
    let snapshot = src.read().duplicate(true)?;
    dst.write().copy_from_host(&snapshot)?;
    Ok(())
}

/// Copy data from `host` into `tensor`.
#[no_mangle]
pub extern "C" fn nn_tensor_copy_from_host(tensor: Handle, host: Handle) -> bool {
    boundary("nn_tensor_copy_from_host", || false, || copy_between(host, tensor).map(|_| true))
}

/// Copy data from `tensor` into `host`.
#[no_mangle]
pub extern "C" fn nn_tensor_copy_to_host(tensor: Handle, host: Handle) -> bool {
    boundary("nn_tensor_copy_to_host", || false, || copy_between(tensor, host).map(|_| true))
}

/// Borrowed pointer to host data, or null for device tensors and empty
/// payloads.
#[no_mangle]
pub extern "C" fn nn_tensor_host(tensor: Handle) -> *mut c_void {
    boundary("nn_tensor_host", ptr::null_mut, || {
        let tensor = shared(tensor)?;
        let raw = tensor.write().host_ptr();
        Ok(raw.map_or(ptr::null_mut(), |p| p as *mut c_void))
    })
}

#[no_mangle]
pub extern "C" fn nn_tensor_device_id(tensor: Handle) -> u64 {
    boundary("nn_tensor_device_id", || 0, || read(tensor, Tensor::device_id))
}

#[no_mangle]
pub extern "C" fn nn_tensor_dimension_type(tensor: Handle) -> i32 {
    boundary("nn_tensor_dimension_type", || -1, || read(tensor, |t| t.dim_type() as i32))
}

#[no_mangle]
pub extern "C" fn nn_tensor_handle_data_type(tensor: Handle) -> i32 {
    boundary("nn_tensor_handle_data_type", || -1, || read(tensor, |t| t.handle_type() as i32))
}

/// Change the element type, reallocating when the element size changes.
/// Fails, leaving the tensor unchanged, when the new payload cannot be
/// allocated.
#[no_mangle]
pub extern "C" fn nn_tensor_set_type(tensor: Handle, dtype: TypeTag) -> bool {
    boundary("nn_tensor_set_type", || false, || {
        let dtype = type_arg(dtype)?;
        shared(tensor)?.write().set_type(dtype)?;
        Ok(true)
    })
}

/// Element type; all-zero on failure.
#[no_mangle]
pub extern "C" fn nn_tensor_halide_type(tensor: Handle) -> TypeTag {
    let invalid = || TypeTag {
        code: 0,
        bits: 0,
        lanes: 0,
    };
    boundary("nn_tensor_halide_type", invalid, || read(tensor, Tensor::dtype))
}

#[no_mangle]
pub extern "C" fn nn_tensor_dimensions(tensor: Handle) -> i32 {
    boundary("nn_tensor_dimensions", || -1, || read(tensor, |t| t.dimensions() as i32))
}

/// Owned copy of the shape; release with `nn_tensor_shape_free()`.
#[no_mangle]
pub extern "C" fn nn_tensor_shape(tensor: Handle) -> IntArrayC {
    int_array_result("nn_tensor_shape", || read(tensor, |t| t.shape().to_vec()))
}

fn fits_i32(what: &str, value: usize) -> Result<i32> {
    i32::try_from(value).map_err(|_| BoundaryError::config(format!("{} {} does not fit in i32", what, value)))
}

/// Payload size in bytes, or -1 (also when it exceeds `i32::MAX`; use
/// `nn_tensor_usize()` for large tensors).
#[no_mangle]
pub extern "C" fn nn_tensor_size(tensor: Handle) -> i32 {
    boundary("nn_tensor_size", || -1, || fits_i32("size", read(tensor, Tensor::size_bytes)?))
}

/// Payload size in bytes, or 0.
#[no_mangle]
pub extern "C" fn nn_tensor_usize(tensor: Handle) -> usize {
    boundary("nn_tensor_usize", || 0, || read(tensor, Tensor::size_bytes))
}

#[no_mangle]
pub extern "C" fn nn_tensor_element_size(tensor: Handle) -> i32 {
    boundary("nn_tensor_element_size", || -1, || {
        fits_i32("element count", read(tensor, Tensor::element_count)?)
    })
}

#[no_mangle]
pub extern "C" fn nn_tensor_width(tensor: Handle) -> i32 {
    boundary("nn_tensor_width", || -1, || read(tensor, Tensor::width))
}

#[no_mangle]
pub extern "C" fn nn_tensor_height(tensor: Handle) -> i32 {
    boundary("nn_tensor_height", || -1, || read(tensor, Tensor::height))
}

#[no_mangle]
pub extern "C" fn nn_tensor_channel(tensor: Handle) -> i32 {
    boundary("nn_tensor_channel", || -1, || read(tensor, Tensor::channel))
}

#[no_mangle]
pub extern "C" fn nn_tensor_batch(tensor: Handle) -> i32 {
    boundary("nn_tensor_batch", || -1, || read(tensor, Tensor::batch))
}

fn index_arg(index: i32) -> Result<usize> {
    usize::try_from(index).map_err(|_| BoundaryError::config(format!("negative dimension index {}", index)))
}

#[no_mangle]
pub extern "C" fn nn_tensor_stride(tensor: Handle, index: i32) -> i32 {
    boundary("nn_tensor_stride", || -1, || {
        let index = index_arg(index)?;
        read(tensor, |t| t.stride(index))?
            .ok_or_else(|| BoundaryError::config(format!("no dimension {} or stride exceeds i32", index)))
    })
}

#[no_mangle]
pub extern "C" fn nn_tensor_length(tensor: Handle, index: i32) -> i32 {
    boundary("nn_tensor_length", || -1, || {
        let index = index_arg(index)?;
        read(tensor, |t| t.length(index))?.ok_or_else(|| BoundaryError::config(format!("no dimension {}", index)))
    })
}

#[no_mangle]
pub extern "C" fn nn_tensor_set_length(tensor: Handle, index: i32, length: i32) -> bool {
    boundary("nn_tensor_set_length", || false, || {
        let index = index_arg(index)?;
        if length < 0 {
            return Err(BoundaryError::config(format!("negative length {}", length)));
        }
        shared(tensor)?.write().set_length(index, length)?;
        Ok(true)
    })
}

/// Log the tensor shape at `info`.
#[no_mangle]
pub extern "C" fn nn_tensor_print_shape(tensor: Handle) {
    boundary("nn_tensor_print_shape", || (), || read(tensor, Tensor::print_shape))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arrays::nn_tensor_shape_free;

    fn host(values: &[f32], shape: &[i32]) -> Handle {
        nn_tensor_create_host(
            shape.as_ptr(),
            shape.len(),
            TypeTag::F32,
            values.as_ptr() as *const c_void,
            std::mem::size_of_val(values),
            DimensionType::Caffe as i32,
        )
    }

    fn host_values(tensor: Handle) -> Vec<f32> {
        let ptr = nn_tensor_host(tensor) as *const f32;
        let len = nn_tensor_element_size(tensor) as usize;
        unsafe { std::slice::from_raw_parts(ptr, len) }.to_vec()
    }

    #[test]
    fn test_host_tensor_copies_data() {
        let mut values = [1.0f32, 2.0, 3.0, 4.0];
        let t = host(&values, &[1, 4]);
        values[0] = 9.0;
        assert_eq!(host_values(t), vec![1.0, 2.0, 3.0, 4.0]);
        assert_eq!(nn_tensor_size(t), 16);
        assert_eq!(nn_tensor_dimensions(t), 2);
        assert!(nn_tensor_free(t));
        assert!(!nn_tensor_free(t));
        assert_eq!(nn_tensor_size(t), -1);
    }

    #[test]
    fn test_short_data_rejected() {
        let values = [1.0f32];
        let shape = [4];
        let t = nn_tensor_create_host(
            shape.as_ptr(),
            1,
            TypeTag::F32,
            values.as_ptr() as *const c_void,
            4,
            DimensionType::Caffe as i32,
        );
        assert!(t.is_null());
    }

    #[test]
    fn test_device_round_trip() {
        let shape = [2, 2];
        let device = nn_tensor_create_device(shape.as_ptr(), 2, TypeTag::F32, DimensionType::Caffe as i32);
        assert!(nn_tensor_host(device).is_null());
        assert_ne!(nn_tensor_device_id(device), 0);

        let src = host(&[1.0, 2.0, 3.0, 4.0], &shape);
        assert!(nn_tensor_copy_from_host(device, src));
        let back = nn_tensor_create_host_from_device(device, true);
        assert_eq!(host_values(back), vec![1.0, 2.0, 3.0, 4.0]);
        assert_eq!(nn_tensor_device_id(back), 0);

        let small = host(&[0.0], &[1]);
        assert!(!nn_tensor_copy_to_host(device, small));
        for t in [device, src, back, small] {
            assert!(nn_tensor_free(t));
        }
    }

    #[test]
    fn test_shape_queries() {
        let shape = [1, 3, 8, 6];
        let t = nn_tensor_create_device(shape.as_ptr(), 4, TypeTag::U8, DimensionType::Tensorflow as i32);
        assert_eq!(nn_tensor_batch(t), 1);
        assert_eq!(nn_tensor_height(t), 3);
        assert_eq!(nn_tensor_width(t), 8);
        assert_eq!(nn_tensor_channel(t), 6);
        assert_eq!(nn_tensor_stride(t, 1), 48);
        assert_eq!(nn_tensor_length(t, 3), 6);
        assert_eq!(nn_tensor_length(t, 4), -1);
        assert_eq!(nn_tensor_stride(t, -1), -1);
        assert_eq!(nn_tensor_halide_type(t), TypeTag::U8);
        assert_eq!(nn_tensor_dimension_type(t), DimensionType::Tensorflow as i32);

        let dims = nn_tensor_shape(t);
        assert!(dims.success);
        assert_eq!(unsafe { std::slice::from_raw_parts(dims.data, dims.len) }, &shape);
        nn_tensor_shape_free(dims);

        assert!(nn_tensor_set_length(t, 0, 2));
        assert_eq!(nn_tensor_usize(t), 2 * 3 * 8 * 6);
        assert!(nn_tensor_set_type(t, TypeTag::F32));
        assert_eq!(nn_tensor_usize(t), 2 * 3 * 8 * 6 * 4);
        nn_tensor_print_shape(t);
        nn_tensor_free(t);
    }

    #[test]
    fn test_clone_and_existing() {
        let src = host(&[5.0, 6.0], &[2]);
        let deep = nn_tensor_clone(src, true);
        assert_ne!(deep, src);
        assert_eq!(host_values(deep), vec![5.0, 6.0]);
        let shallow = nn_tensor_clone(src, false);
        assert_eq!(host_values(shallow), vec![0.0, 0.0]);
        let layout = nn_tensor_create_from_existing(src, DimensionType::Tensorflow as i32, true);
        assert_eq!(nn_tensor_dimension_type(layout), 0);
        assert!(nn_tensor_create_from_existing(src, 9, true).is_null());
        for t in [src, deep, shallow, layout] {
            nn_tensor_free(t);
        }
    }

    #[test]
    fn test_create_empty() {
        let t = nn_tensor_create(3, DimensionType::Caffe as i32);
        assert_eq!(nn_tensor_dimensions(t), 3);
        assert!(nn_tensor_host(t).is_null());
        assert!(nn_tensor_create(-1, 0).is_null());
        assert!(nn_tensor_create(2, 7).is_null());
        nn_tensor_free(t);
    }

    #[test]
    fn test_invalid_type_tag() {
        let shape = [1];
        let bad = TypeTag {
            code: 42,
            bits: 8,
            lanes: 1,
        };
        assert!(nn_tensor_create_device(shape.as_ptr(), 1, bad, 1).is_null());
    }

    #[test]
    fn test_oversized_shape_gives_null_handle() {
        let shape = [1 << 20, 1 << 20, 16];
        assert!(nn_tensor_create_device(shape.as_ptr(), 3, TypeTag::F32, DimensionType::Caffe as i32).is_null());
        let data = [0u8; 4];
        let t = nn_tensor_create_host(shape.as_ptr(), 3, TypeTag::F32, data.as_ptr().cast(), 4, 1);
        assert!(t.is_null());
        let widest = [i32::MAX; MAX_DIMS];
        assert!(nn_tensor_create_device(widest.as_ptr(), MAX_DIMS, TypeTag::U8, 1).is_null());
    }

    #[test]
    fn test_sizes_beyond_i32_are_rejected() {
        assert_eq!(fits_i32("size", 1 << 20).unwrap(), 1 << 20);
        assert_eq!(fits_i32("size", i32::MAX as usize).unwrap(), i32::MAX);
        assert!(fits_i32("size", 1 << 31).is_err());
    }
}
