//! Flat C configuration structs and their conversion into runtime configs.
//!
//! Name lists are copied on conversion; the backend config is the one
//! exception and stays borrowed for the lifetime of the incoming struct.

use std::os::raw::c_char;

use nnbridge_core::config::{BackendConfig, PathMode, ScheduleConfig, SubPath};
use nnbridge_core::cv::{Filter, ImageFormat, ImageProcessConfig, Wrap};
use nnbridge_core::express::ModuleConfig;
use nnbridge_core::ForwardType;
use nnbridge_ffi_common::StringArrayC;

use crate::error::{BoundaryError, Result};
use crate::handle::Handle;

/// Sub-path restriction `{inputs, outputs, mode}`.
///
/// `mode` 0 selects operators by name, 1 selects tensors by name.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct SchedulePathC {
    pub inputs: StringArrayC,
    pub outputs: StringArrayC,
    pub mode: i32,
}

/// C layout of a schedule config.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ScheduleConfigC {
    /// Tensors to keep readable after a run
    pub save_tensors: StringArrayC,
    pub forward: i32,
    /// Thread count; values below 1 are raised to 1
    pub num_thread: i32,
    pub path: SchedulePathC,
    pub backup: i32,
    /// Optional, borrowed for the duration of the consuming call
    pub backend_config: *const BackendConfig,
}

impl Default for ScheduleConfigC {
    fn default() -> Self {
        Self {
            save_tensors: StringArrayC::empty(),
            forward: ForwardType::Cpu as i32,
            num_thread: 4,
            path: SchedulePathC::default(),
            backup: ForwardType::Cpu as i32,
            backend_config: std::ptr::null(),
        }
    }
}

fn forward_type(value: i32, field: &str) -> Result<ForwardType> {
    ForwardType::from_i32(value).ok_or_else(|| BoundaryError::config(format!("unknown {} type {}", field, value)))
}

/// Convert a C schedule config.
///
/// # Safety
/// Every list in `config` must satisfy [`StringArrayC::to_vec`], and
/// `backend_config` must be null or point to a valid `BackendConfig` that
/// outlives the returned value.
pub unsafe fn to_runtime_config(config: &ScheduleConfigC) -> Result<ScheduleConfig<'_>> {
    let mode = PathMode::from_i32(config.path.mode)
        .ok_or_else(|| BoundaryError::config(format!("unknown path mode {}", config.path.mode)))?;
    let path = SubPath {
        inputs: unsafe { config.path.inputs.to_vec() }?,
        outputs: unsafe { config.path.outputs.to_vec() }?,
        mode,
    };
    // A list is "not given" only when NULL or empty; a list of NULL entries
    // still constrains the path and fails the checks below.
    let constrained = !config.path.inputs.is_unconstrained() || !config.path.outputs.is_unconstrained();
    if constrained {
        match mode {
            PathMode::Op if path.inputs.is_empty() => {
                return Err(BoundaryError::config("op path requires at least one input op"));
            }
            PathMode::Tensor if path.inputs.is_empty() || path.outputs.is_empty() => {
                return Err(BoundaryError::config("tensor path requires inputs and outputs"));
            }
            _ => {}
        }
    }
    Ok(ScheduleConfig {
        save_tensors: unsafe { config.save_tensors.to_vec() }?,
        forward: forward_type(config.forward, "forward")?,
        num_thread: config.num_thread.max(1),
        path,
        backup: forward_type(config.backup, "backup")?,
        backend: unsafe { config.backend_config.as_ref() },
    })
}

/// Convert `count` consecutive C schedule configs.
///
/// # Safety
/// `configs` must point to `count` values, each valid per
/// [`to_runtime_config`].
pub unsafe fn to_runtime_configs<'a>(configs: *const ScheduleConfigC, count: usize) -> Result<Vec<ScheduleConfig<'a>>> {
    if configs.is_null() || count == 0 {
        return Err(BoundaryError::NullPointer("configs"));
    }
    let configs: &'a [ScheduleConfigC] = unsafe { std::slice::from_raw_parts(configs, count) };
    configs.iter().map(|c| unsafe { to_runtime_config(c) }).collect()
}

/// C layout of module loading options. `base` may be the null handle.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct ModuleConfigC {
    pub dynamic: bool,
    pub shape_mutable: bool,
    pub rearrange: bool,
    /// Module whose model is shared; borrowed, not consumed
    pub base: Handle,
}

impl ModuleConfigC {
    pub fn to_module_config(&self) -> ModuleConfig {
        ModuleConfig {
            dynamic: self.dynamic,
            shape_mutable: self.shape_mutable,
            rearrange: self.rearrange,
        }
    }
}

/// C layout of image preprocessing options.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ImageProcessConfigC {
    pub filter: i32,
    pub source_format: i32,
    pub dest_format: i32,
    pub mean: [f32; 4],
    pub normal: [f32; 4],
    pub wrap: i32,
}

impl Default for ImageProcessConfigC {
    fn default() -> Self {
        Self {
            filter: Filter::Nearest as i32,
            source_format: ImageFormat::Rgba as i32,
            dest_format: ImageFormat::Rgba as i32,
            mean: [0.0; 4],
            normal: [1.0; 4],
            wrap: Wrap::ClampToEdge as i32,
        }
    }
}

impl ImageProcessConfigC {
    pub fn to_process_config(&self) -> Result<ImageProcessConfig> {
        let format = |value: i32| {
            ImageFormat::from_i32(value).ok_or_else(|| BoundaryError::config(format!("unknown image format {}", value)))
        };
        Ok(ImageProcessConfig {
            filter: Filter::from_i32(self.filter)
                .ok_or_else(|| BoundaryError::config(format!("unknown filter {}", self.filter)))?,
            source_format: format(self.source_format)?,
            dest_format: format(self.dest_format)?,
            mean: self.mean,
            normal: self.normal,
            wrap: Wrap::from_i32(self.wrap).ok_or_else(|| BoundaryError::config(format!("unknown wrap {}", self.wrap)))?,
        })
    }
}

/// Read a required C string argument.
///
/// # Safety
/// `ptr` must be null or a valid null-terminated string.
pub(crate) unsafe fn required_str<'a>(ptr: *const c_char, what: &'static str) -> Result<&'a str> {
    if ptr.is_null() {
        return Err(BoundaryError::NullPointer(what));
    }
    Ok(unsafe { nnbridge_ffi_common::cstr_to_str(ptr) }?)
}
