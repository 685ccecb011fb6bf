//! Matrices and image preprocessing.
//!
//! # Memory Ownership Rules
//!
//! - Matrix and image processor handles are owned by the caller; release
//!   with `nn_matrix_free()` / `nn_image_process_free()`
//! - `nn_image_process_set_matrix()` copies the matrix; later edits to the
//!   matrix handle do not affect the processor
//! - Source pixels passed to `nn_image_process_convert()` are borrowed for
//!   the duration of the call
//! - `nn_create_image_tensor()` copies `data` into a new owned tensor

use std::os::raw::c_void;
use std::sync::Arc;

use nnbridge_core::cv::{create_image_tensor, ImageFormat, ImageProcess, Matrix};
use nnbridge_core::{RuntimeError, TypeTag};
use nnbridge_ffi_common::slice_or_empty;
use parking_lot::Mutex;

use crate::config::ImageProcessConfigC;
use crate::error::{boundary, boundary_status, BoundaryError, ErrorCode, Result};
use crate::handle::{Handle, HandleKind};
use crate::registry::registry;

fn insert_matrix(matrix: Matrix) -> Handle {
    registry().matrices.insert(matrix)
}

fn update(func: &'static str, matrix: Handle, f: impl FnOnce(&mut Matrix)) -> bool {
    boundary(func, || false, || {
        let mut reg = registry();
        f(reg.matrix_mut(matrix)?);
        Ok(true)
    })
}

// Matrix construction

/// New identity matrix.
#[no_mangle]
pub extern "C" fn nn_matrix_create() -> Handle {
    boundary("nn_matrix_create", || Handle::NULL, || Ok(insert_matrix(Matrix::identity())))
}

#[no_mangle]
pub extern "C" fn nn_matrix_make_scale(sx: f32, sy: f32) -> Handle {
    boundary("nn_matrix_make_scale", || Handle::NULL, || Ok(insert_matrix(Matrix::make_scale(sx, sy))))
}

#[no_mangle]
pub extern "C" fn nn_matrix_make_translate(dx: f32, dy: f32) -> Handle {
    boundary("nn_matrix_make_translate", || Handle::NULL, || {
        Ok(insert_matrix(Matrix::make_translate(dx, dy)))
    })
}

/// Matrix from nine row-major values.
#[no_mangle]
#[allow(clippy::too_many_arguments)]
pub extern "C" fn nn_matrix_make_all(
    scale_x: f32,
    skew_x: f32,
    trans_x: f32,
    skew_y: f32,
    scale_y: f32,
    trans_y: f32,
    persp_0: f32,
    persp_1: f32,
    persp_2: f32,
) -> Handle {
    let values = [scale_x, skew_x, trans_x, skew_y, scale_y, trans_y, persp_0, persp_1, persp_2];
    boundary("nn_matrix_make_all", || Handle::NULL, || Ok(insert_matrix(Matrix::from_values(values))))
}

#[no_mangle]
pub extern "C" fn nn_matrix_free(matrix: Handle) -> bool {
    boundary("nn_matrix_free", || false, || {
        registry().matrices.remove(matrix).map(|_| true).ok_or(BoundaryError::InvalidHandle {
            handle: matrix,
            expected: HandleKind::Matrix,
        })
    })
}

// Element access

/// Value at `index` (0..9); NaN for bad handles or indices.
#[no_mangle]
pub extern "C" fn nn_matrix_get(matrix: Handle, index: i32) -> f32 {
    boundary("nn_matrix_get", || f32::NAN, || {
        let m = registry().matrix(matrix)?;
        usize::try_from(index)
            .ok()
            .and_then(|i| m.get(i))
            .ok_or_else(|| BoundaryError::config(format!("matrix index {} out of range", index)))
    })
}

#[no_mangle]
pub extern "C" fn nn_matrix_set(matrix: Handle, index: i32, value: f32) -> bool {
    boundary("nn_matrix_set", || false, || {
        let index = usize::try_from(index).map_err(|_| BoundaryError::config(format!("matrix index {}", index)))?;
        if !registry().matrix_mut(matrix)?.set(index, value) {
            return Err(BoundaryError::config(format!("matrix index {} out of range", index)));
        }
        Ok(true)
    })
}

/// Copy all nine values into `out`.
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn nn_matrix_get9(matrix: Handle, out: *mut f32) -> bool {
    boundary("nn_matrix_get9", || false, || {
        if out.is_null() {
            return Err(BoundaryError::NullPointer("out"));
        }
        let values = registry().matrix(matrix)?.values();
        unsafe { std::ptr::copy_nonoverlapping(values.as_ptr(), out, values.len()) };
        Ok(true)
    })
}

/// Replace all nine values from `values`.
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn nn_matrix_set9(matrix: Handle, values: *const f32) -> bool {
    boundary("nn_matrix_set9", || false, || {
        if values.is_null() {
            return Err(BoundaryError::NullPointer("values"));
        }
        let mut m = [0.0f32; 9];
        m.copy_from_slice(unsafe { std::slice::from_raw_parts(values, 9) });
        registry().matrix_mut(matrix)?.set_values(m);
        Ok(true)
    })
}

// Setters

#[no_mangle]
pub extern "C" fn nn_matrix_set_identity(matrix: Handle) -> bool {
    update("nn_matrix_set_identity", matrix, Matrix::reset)
}

#[no_mangle]
pub extern "C" fn nn_matrix_set_translate(matrix: Handle, dx: f32, dy: f32) -> bool {
    update("nn_matrix_set_translate", matrix, |m| m.set_translate(dx, dy))
}

#[no_mangle]
pub extern "C" fn nn_matrix_set_scale(matrix: Handle, sx: f32, sy: f32, px: f32, py: f32) -> bool {
    update("nn_matrix_set_scale", matrix, |m| m.set_scale(sx, sy, px, py))
}

#[no_mangle]
pub extern "C" fn nn_matrix_set_rotate(matrix: Handle, degrees: f32, px: f32, py: f32) -> bool {
    update("nn_matrix_set_rotate", matrix, |m| m.set_rotate(degrees, px, py))
}

#[no_mangle]
pub extern "C" fn nn_matrix_set_skew(matrix: Handle, kx: f32, ky: f32, px: f32, py: f32) -> bool {
    update("nn_matrix_set_skew", matrix, |m| m.set_skew(kx, ky, px, py))
}

// Composition

#[no_mangle]
pub extern "C" fn nn_matrix_pre_translate(matrix: Handle, dx: f32, dy: f32) -> bool {
    update("nn_matrix_pre_translate", matrix, |m| m.pre_translate(dx, dy))
}

#[no_mangle]
pub extern "C" fn nn_matrix_post_translate(matrix: Handle, dx: f32, dy: f32) -> bool {
    update("nn_matrix_post_translate", matrix, |m| m.post_translate(dx, dy))
}

#[no_mangle]
pub extern "C" fn nn_matrix_pre_scale(matrix: Handle, sx: f32, sy: f32, px: f32, py: f32) -> bool {
    update("nn_matrix_pre_scale", matrix, |m| m.pre_scale(sx, sy, px, py))
}

#[no_mangle]
pub extern "C" fn nn_matrix_post_scale(matrix: Handle, sx: f32, sy: f32, px: f32, py: f32) -> bool {
    update("nn_matrix_post_scale", matrix, |m| m.post_scale(sx, sy, px, py))
}

#[no_mangle]
pub extern "C" fn nn_matrix_pre_rotate(matrix: Handle, degrees: f32, px: f32, py: f32) -> bool {
    update("nn_matrix_pre_rotate", matrix, |m| m.pre_rotate(degrees, px, py))
}

#[no_mangle]
pub extern "C" fn nn_matrix_post_rotate(matrix: Handle, degrees: f32, px: f32, py: f32) -> bool {
    update("nn_matrix_post_rotate", matrix, |m| m.post_rotate(degrees, px, py))
}

#[no_mangle]
pub extern "C" fn nn_matrix_pre_skew(matrix: Handle, kx: f32, ky: f32, px: f32, py: f32) -> bool {
    update("nn_matrix_pre_skew", matrix, |m| m.pre_skew(kx, ky, px, py))
}

#[no_mangle]
pub extern "C" fn nn_matrix_post_skew(matrix: Handle, kx: f32, ky: f32, px: f32, py: f32) -> bool {
    update("nn_matrix_post_skew", matrix, |m| m.post_skew(kx, ky, px, py))
}

/// `matrix = a * b`. Any of the three handles may alias.
#[no_mangle]
pub extern "C" fn nn_matrix_set_concat(matrix: Handle, a: Handle, b: Handle) -> bool {
    boundary("nn_matrix_set_concat", || false, || {
        let mut reg = registry();
        let (a, b) = (reg.matrix(a)?, reg.matrix(b)?);
        reg.matrix_mut(matrix)?.set_concat(&a, &b);
        Ok(true)
    })
}

#[no_mangle]
pub extern "C" fn nn_matrix_pre_concat(matrix: Handle, other: Handle) -> bool {
    boundary("nn_matrix_pre_concat", || false, || {
        let mut reg = registry();
        let other = reg.matrix(other)?;
        reg.matrix_mut(matrix)?.pre_concat(&other);
        Ok(true)
    })
}

#[no_mangle]
pub extern "C" fn nn_matrix_post_concat(matrix: Handle, other: Handle) -> bool {
    boundary("nn_matrix_post_concat", || false, || {
        let mut reg = registry();
        let other = reg.matrix(other)?;
        reg.matrix_mut(matrix)?.post_concat(&other);
        Ok(true)
    })
}

// Queries

/// Write the inverse into the `inverse` handle. False (and `inverse`
/// untouched) when `matrix` is singular.
#[no_mangle]
pub extern "C" fn nn_matrix_invert(matrix: Handle, inverse: Handle) -> bool {
    boundary("nn_matrix_invert", || false, || {
        let mut reg = registry();
        let inverted = reg
            .matrix(matrix)?
            .invert()
            .ok_or_else(|| BoundaryError::config("matrix is singular"))?;
        *reg.matrix_mut(inverse)? = inverted;
        Ok(true)
    })
}

#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn nn_matrix_map_point(matrix: Handle, x: f32, y: f32, out_x: *mut f32, out_y: *mut f32) -> bool {
    boundary("nn_matrix_map_point", || false, || {
        if out_x.is_null() || out_y.is_null() {
            return Err(BoundaryError::NullPointer("out point"));
        }
        let (mx, my) = registry().matrix(matrix)?.map_point(x, y);
        unsafe {
            *out_x = mx;
            *out_y = my;
        }
        Ok(true)
    })
}

#[no_mangle]
pub extern "C" fn nn_matrix_is_identity(matrix: Handle) -> bool {
    boundary("nn_matrix_is_identity", || false, || Ok(registry().matrix(matrix)?.is_identity()))
}

/// Exact element-wise equality. False when either handle is invalid.
#[no_mangle]
pub extern "C" fn nn_matrix_equals(a: Handle, b: Handle) -> bool {
    boundary("nn_matrix_equals", || false, || {
        let reg = registry();
        Ok(reg.matrix(a)? == reg.matrix(b)?)
    })
}

// Image processing

/// Channels the destination tensor must have for `format`.
fn check_destination(dest: Handle, format: ImageFormat) -> Result<()> {
    if dest.is_null() {
        return Ok(());
    }
    let tensor = registry().tensor(dest)?;
    let channels = tensor.read().channel();
    match format.channels() {
        Some(expected) if expected as i32 == channels => Ok(()),
        _ => Err(BoundaryError::config(format!(
            "destination has {} channels, {:?} needs {:?}",
            channels,
            format,
            format.channels()
        ))),
    }
}

fn insert_processor(process: ImageProcess) -> Handle {
    registry().image_processors.insert(Arc::new(Mutex::new(process)))
}

/// Create an image processor. `dest` may be [`Handle::NULL`]; when given, its
/// channel count is checked against the destination format.
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn nn_image_process_create(config: *const ImageProcessConfigC, dest: Handle) -> Handle {
    boundary("nn_image_process_create", || Handle::NULL, || {
        let config = unsafe { config.as_ref() }.ok_or(BoundaryError::NullPointer("config"))?;
        let config = config.to_process_config()?;
        check_destination(dest, config.dest_format)?;
        Ok(insert_processor(ImageProcess::new(config)?))
    })
}

/// Create an image processor from formats plus up to four means and normals.
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn nn_image_process_create_v2(
    source_format: i32,
    dest_format: i32,
    means: *const f32,
    mean_count: usize,
    normals: *const f32,
    normal_count: usize,
    dest: Handle,
) -> Handle {
    boundary("nn_image_process_create_v2", || Handle::NULL, || {
        if mean_count > 4 || normal_count > 4 {
            return Err(BoundaryError::TooLarge("means/normals"));
        }
        if (mean_count > 0 && means.is_null()) || (normal_count > 0 && normals.is_null()) {
            return Err(BoundaryError::NullPointer("means/normals"));
        }
        let mut config = ImageProcessConfigC {
            source_format,
            dest_format,
            ..Default::default()
        };
        config.mean[..mean_count].copy_from_slice(unsafe { slice_or_empty(means, mean_count) });
        config.normal[..normal_count].copy_from_slice(unsafe { slice_or_empty(normals, normal_count) });
        let config = config.to_process_config()?;
        check_destination(dest, config.dest_format)?;
        Ok(insert_processor(ImageProcess::new(config)?))
    })
}

#[no_mangle]
pub extern "C" fn nn_image_process_free(process: Handle) -> bool {
    boundary("nn_image_process_free", || false, || {
        registry().image_processors.remove(process).map(|_| true).ok_or(BoundaryError::InvalidHandle {
            handle: process,
            expected: HandleKind::ImageProcessor,
        })
    })
}

/// Copy `matrix` into the processor. The matrix maps destination coordinates
/// to source coordinates.
#[no_mangle]
pub extern "C" fn nn_image_process_set_matrix(process: Handle, matrix: Handle) -> bool {
    boundary("nn_image_process_set_matrix", || false, || {
        let (process, matrix) = {
            let reg = registry();
            (reg.image_processor(process)?, reg.matrix(matrix)?)
        };
        process.lock().set_matrix(matrix);
        Ok(true)
    })
}

#[no_mangle]
pub extern "C" fn nn_image_process_set_padding(process: Handle, value: u8) -> bool {
    boundary("nn_image_process_set_padding", || false, || {
        let process = registry().image_processor(process)?;
        process.lock().set_padding(value);
        Ok(true)
    })
}

/// Convert `source` (`iw` x `ih` pixels, `stride` bytes per row, zero meaning
/// tightly packed) into `dest`.
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn nn_image_process_convert(
    process: Handle,
    source: *const u8,
    iw: i32,
    ih: i32,
    stride: i32,
    dest: Handle,
) -> ErrorCode {
    boundary_status("nn_image_process_convert", || {
        if source.is_null() {
            return Err(BoundaryError::NullPointer("source"));
        }
        let to_usize = |v: i32, what: &str| {
            usize::try_from(v).map_err(|_| BoundaryError::config(format!("negative {} {}", what, v)))
        };
        let (iw, ih, stride) = (to_usize(iw, "width")?, to_usize(ih, "height")?, to_usize(stride, "stride")?);

        let (process, tensor) = {
            let reg = registry();
            (reg.image_processor(process)?, reg.tensor(dest)?)
        };
        let process = process.lock();
        let channels = process.config().source_format.channels().unwrap_or(1);
        let row = if stride == 0 { iw * channels } else { stride };
        let len = match ih {
            0 => 0,
            _ => row * (ih - 1) + iw * channels,
        };
        let pixels = unsafe { std::slice::from_raw_parts(source, len) };
        process.convert(pixels, iw, ih, stride, &mut tensor.write())?;
        Ok(())
    })
}

fn image_bytes(dtype: TypeTag, width: i32, height: i32, bpp: i32) -> Result<usize> {
    let dims = [width, height, bpp];
    if dims.iter().any(|&d| d <= 0) {
        return Err(BoundaryError::config(format!("image {}x{}x{}", width, height, bpp)));
    }
    dims.iter()
        .try_fold(dtype.bytes(), |acc, &d| acc.checked_mul(d as usize))
        .ok_or(BoundaryError::Runtime(RuntimeError::OutOfMemory { bytes: usize::MAX }))
}

/// Owned NHWC tensor `[1, h, w, bpp]` for holding an image; `data` may be null.
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn nn_create_image_tensor(dtype: TypeTag, width: i32, height: i32, bpp: i32, data: *const c_void) -> Handle {
    boundary("nn_create_image_tensor", || Handle::NULL, || {
        let tensor = if data.is_null() {
            create_image_tensor(dtype, width, height, bpp, None)?
        } else {
            let len = image_bytes(dtype, width, height, bpp)?;
            let bytes = unsafe { std::slice::from_raw_parts(data as *const u8, len) };
            create_image_tensor(dtype, width, height, bpp, Some(bytes))?
        };
        Ok(registry().insert_tensor(tensor.into_shared()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ffi::tensor::{nn_tensor_free, nn_tensor_host};
    use pretty_assertions::assert_eq;

    fn values(matrix: Handle) -> [f32; 9] {
        let mut out = [0.0f32; 9];
        assert!(nn_matrix_get9(matrix, out.as_mut_ptr()));
        out
    }

    #[test]
    fn test_matrix_elements() {
        let m = nn_matrix_create();
        assert!(nn_matrix_is_identity(m));
        assert!(nn_matrix_set(m, 2, 5.0));
        assert_eq!(nn_matrix_get(m, 2), 5.0);
        assert!(!nn_matrix_set(m, 9, 1.0));
        assert!(nn_matrix_get(m, -1).is_nan());
        assert!(!nn_matrix_is_identity(m));

        let all = nn_matrix_make_all(1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0);
        assert_eq!(values(all), [1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0]);
        assert!(nn_matrix_set9(m, values(all).as_ptr()));
        assert!(nn_matrix_equals(m, all));
        assert!(nn_matrix_set_identity(m));
        assert!(!nn_matrix_equals(m, all));

        assert!(nn_matrix_free(m));
        assert!(!nn_matrix_free(m));
        assert!(!nn_matrix_set_identity(m));
        assert!(!nn_matrix_get9(all, std::ptr::null_mut()));
        nn_matrix_free(all);
    }

    #[test]
    fn test_matrix_composition() {
        let m = nn_matrix_make_translate(2.0, 3.0);
        assert!(nn_matrix_post_scale(m, 2.0, 2.0, 0.0, 0.0));
        let (mut x, mut y) = (0.0f32, 0.0f32);
        assert!(nn_matrix_map_point(m, 1.0, 1.0, &mut x, &mut y));
        assert_eq!((x, y), (6.0, 8.0));

        let inverse = nn_matrix_create();
        assert!(nn_matrix_invert(m, inverse));
        let product = nn_matrix_create();
        assert!(nn_matrix_set_concat(product, m, inverse));
        let p = values(product);
        let identity = [1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0];
        assert!(p.iter().zip(identity).all(|(a, b)| (a - b).abs() < 1e-5));

        let singular = nn_matrix_make_scale(0.0, 1.0);
        assert!(!nn_matrix_invert(singular, inverse));

        let t = nn_matrix_make_translate(1.0, 0.0);
        assert!(nn_matrix_pre_concat(t, t));
        assert_eq!(nn_matrix_get(t, 2), 2.0);
        for h in [m, inverse, product, singular, t] {
            nn_matrix_free(h);
        }
    }

    #[test]
    fn test_image_convert_gray() {
        let config = ImageProcessConfigC {
            source_format: ImageFormat::Rgb as i32,
            dest_format: ImageFormat::Gray as i32,
            ..Default::default()
        };
        let dest = nn_create_image_tensor(TypeTag::U8, 2, 2, 1, std::ptr::null());
        let process = nn_image_process_create(&config, dest);
        assert!(!process.is_null());

        let source = [100u8; 12];
        let code = nn_image_process_convert(process, source.as_ptr(), 2, 2, 0, dest);
        assert_eq!(code, ErrorCode::NoError);
        let out = unsafe { std::slice::from_raw_parts(nn_tensor_host(dest) as *const u8, 4) };
        assert_eq!(out, &[100, 100, 100, 100]);

        assert_eq!(
            nn_image_process_convert(process, std::ptr::null(), 2, 2, 0, dest),
            ErrorCode::InvalidValue
        );
        assert!(nn_image_process_free(process));
        assert!(nn_tensor_free(dest));
    }

    #[test]
    fn test_image_padding_and_matrix() {
        let means = [0.0f32];
        let normals = [1.0f32];
        let process = nn_image_process_create_v2(
            ImageFormat::Gray as i32,
            ImageFormat::Gray as i32,
            means.as_ptr(),
            1,
            normals.as_ptr(),
            1,
            Handle::NULL,
        );
        assert!(!process.is_null());
        let shift = nn_matrix_make_translate(1.0, 0.0);
        assert!(nn_image_process_set_matrix(process, shift));
        assert!(nn_image_process_set_padding(process, 7));

        let dest = nn_create_image_tensor(TypeTag::F32, 2, 1, 1, std::ptr::null());
        let source = [1u8, 2];
        assert_eq!(nn_image_process_convert(process, source.as_ptr(), 2, 1, 0, dest), ErrorCode::NoError);
        let out = unsafe { std::slice::from_raw_parts(nn_tensor_host(dest) as *const f32, 2) };
        // clamp-to-edge repeats the last column
        assert_eq!(out, &[2.0, 2.0]);

        nn_image_process_free(process);
        nn_matrix_free(shift);
        nn_tensor_free(dest);
    }

    #[test]
    fn test_image_process_rejections() {
        let bicubic = ImageProcessConfigC {
            filter: 2,
            ..Default::default()
        };
        assert!(nn_image_process_create(&bicubic, Handle::NULL).is_null());
        assert!(nn_image_process_create(std::ptr::null(), Handle::NULL).is_null());

        let rgba_dest = nn_create_image_tensor(TypeTag::U8, 2, 2, 3, std::ptr::null());
        assert!(nn_image_process_create(&ImageProcessConfigC::default(), rgba_dest).is_null());
        let too_many = [0.0f32; 5];
        assert!(nn_image_process_create_v2(0, 0, too_many.as_ptr(), 5, std::ptr::null(), 0, Handle::NULL).is_null());
        nn_tensor_free(rgba_dest);
    }

    #[test]
    fn test_image_tensor_with_data() {
        let data = [1u8, 2, 3, 4, 5, 6];
        let t = nn_create_image_tensor(TypeTag::U8, 2, 1, 3, data.as_ptr() as *const c_void);
        let out = unsafe { std::slice::from_raw_parts(nn_tensor_host(t) as *const u8, 6) };
        assert_eq!(out, &data);
        nn_tensor_free(t);
        assert!(nn_create_image_tensor(TypeTag::U8, 0, 1, 3, std::ptr::null()).is_null());
    }

    #[test]
    fn test_oversized_image_tensor_is_rejected() {
        let huge = nn_create_image_tensor(TypeTag::F32, i32::MAX, i32::MAX, i32::MAX, std::ptr::null());
        assert!(huge.is_null());
        let pixel = [0u8; 4];
        let huge = nn_create_image_tensor(TypeTag::F32, i32::MAX, i32::MAX, i32::MAX, pixel.as_ptr().cast());
        assert!(huge.is_null());
        assert!(matches!(
            image_bytes(TypeTag::F32, i32::MAX, i32::MAX, i32::MAX),
            Err(BoundaryError::Runtime(RuntimeError::OutOfMemory { .. }))
        ));
        assert_eq!(image_bytes(TypeTag::U8, 4, 2, 3).unwrap(), 24);
        assert!(image_bytes(TypeTag::U8, 0, 2, 3).is_err());
    }
}
