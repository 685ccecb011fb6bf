//! Expression variables, operators and modules.
//!
//! # Memory Ownership Rules
//!
//! - Every variable handle returned here is owned by the caller; release with
//!   `nn_var_free()`
//! - Operator inputs are borrowed; operators never consume their operands
//! - `nn_var_float_data()` / `nn_var_int_data()` return pointers borrowed from
//!   the variable, valid until it is freed
//! - `nn_module_forward()` returns an owned `VarArrayC`; `nn_var_array_free()`
//!   releases the array and every variable in it
//!
//! # Operator codes
//!
//! `nn_var_binary`, `nn_var_unary` and `nn_var_reduce` take the operator as
//! an index into [`BINARY_OPS`], [`UNARY_OPS`] and [`REDUCE_OPS`]. Each
//! operator also has a named entry point such as `nn_var_add`.

use std::path::Path;
use std::ptr;
use std::sync::Arc;

use nnbridge_core::express::{self, BinaryOp, CastTarget, Module, ReduceOp, UnaryOp, Var};
use nnbridge_ffi_common::{slice_or_empty, StringArrayC};

use super::{path_arg, shape_arg};
use crate::arrays::{int_array_result, VarArrayC};
use crate::config::ModuleConfigC;
use crate::error::{boundary, BoundaryError, Result};
use crate::handle::Handle;
use crate::registry::registry;

/// Binary operator codes, in code order.
pub const BINARY_OPS: [BinaryOp; 17] = [
    BinaryOp::Add,
    BinaryOp::Subtract,
    BinaryOp::Multiply,
    BinaryOp::Divide,
    BinaryOp::Pow,
    BinaryOp::Minimum,
    BinaryOp::Maximum,
    BinaryOp::Greater,
    BinaryOp::GreaterEqual,
    BinaryOp::Less,
    BinaryOp::LessEqual,
    BinaryOp::Equal,
    BinaryOp::SquaredDifference,
    BinaryOp::FloorDiv,
    BinaryOp::FloorMod,
    BinaryOp::Atan2,
    BinaryOp::BiasAdd,
];

/// Unary operator codes, in code order.
pub const UNARY_OPS: [UnaryOp; 20] = [
    UnaryOp::Sign,
    UnaryOp::Abs,
    UnaryOp::Negative,
    UnaryOp::Floor,
    UnaryOp::Round,
    UnaryOp::Ceil,
    UnaryOp::Square,
    UnaryOp::Sqrt,
    UnaryOp::Rsqrt,
    UnaryOp::Exp,
    UnaryOp::Log,
    UnaryOp::Sin,
    UnaryOp::Cos,
    UnaryOp::Tan,
    UnaryOp::Asin,
    UnaryOp::Acos,
    UnaryOp::Atan,
    UnaryOp::Reciprocal,
    UnaryOp::Tanh,
    UnaryOp::Sigmoid,
];

/// Reduction codes, in code order.
pub const REDUCE_OPS: [ReduceOp; 5] = [ReduceOp::Sum, ReduceOp::Mean, ReduceOp::Max, ReduceOp::Min, ReduceOp::Prod];

fn lookup_op<T: Copy>(table: &[T], code: i32, what: &str) -> Result<T> {
    usize::try_from(code)
        .ok()
        .and_then(|i| table.get(i).copied())
        .ok_or_else(|| BoundaryError::config(format!("unknown {} operator {}", what, code)))
}

fn var(handle: Handle) -> Result<Arc<Var>> {
    registry().var(handle)
}

fn insert_var(var: Var) -> Handle {
    registry().vars.insert(Arc::new(var))
}

fn apply_binary(func: &'static str, op: BinaryOp, a: Handle, b: Handle) -> Handle {
    boundary(func, || Handle::NULL, || {
        let a = var(a)?;
        let b = var(b)?;
        Ok(insert_var(express::binary(op, &a, &b)?))
    })
}

fn apply_unary(func: &'static str, op: UnaryOp, x: Handle) -> Handle {
    boundary(func, || Handle::NULL, || {
        let x = var(x)?;
        Ok(insert_var(express::unary(op, &x)?))
    })
}

fn apply_reduce(func: &'static str, op: ReduceOp, x: Handle, axes: *const i32, axis_count: usize, keep_dims: bool) -> Handle {
    boundary(func, || Handle::NULL, || {
        if axis_count > 0 && axes.is_null() {
            return Err(BoundaryError::NullPointer("axes"));
        }
        let axes = unsafe { slice_or_empty(axes, axis_count) };
        let x = var(x)?;
        Ok(insert_var(express::reduce(op, &x, axes, keep_dims)?))
    })
}

// Variables

/// Float constant of the given shape; `data` is copied.
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn nn_var_const_float(data: *const f32, len: usize, shape: *const i32, dim_count: usize) -> Handle {
    boundary("nn_var_const_float", || Handle::NULL, || {
        if len > 0 && data.is_null() {
            return Err(BoundaryError::NullPointer("data"));
        }
        let shape = unsafe { shape_arg(shape, dim_count) }?;
        let values = unsafe { slice_or_empty(data, len) };
        Ok(insert_var(Var::const_float(values, shape)?))
    })
}

/// Integer constant of the given shape; `data` is copied.
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn nn_var_const_int(data: *const i32, len: usize, shape: *const i32, dim_count: usize) -> Handle {
    boundary("nn_var_const_int", || Handle::NULL, || {
        if len > 0 && data.is_null() {
            return Err(BoundaryError::NullPointer("data"));
        }
        let shape = unsafe { shape_arg(shape, dim_count) }?;
        let values = unsafe { slice_or_empty(data, len) };
        Ok(insert_var(Var::const_int(values, shape)?))
    })
}

#[no_mangle]
pub extern "C" fn nn_var_free(var: Handle) -> bool {
    boundary("nn_var_free", || false, || {
        registry().vars.remove(var).map(|_| true).ok_or(BoundaryError::InvalidHandle {
            handle: var,
            expected: crate::HandleKind::Variable,
        })
    })
}

/// Borrowed float payload. Null for integer variables and invalid handles.
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn nn_var_float_data(var: Handle, out_len: *mut usize) -> *const f32 {
    boundary("nn_var_float_data", ptr::null, || {
        let v = self::var(var)?;
        let data = v
            .float_data()
            .ok_or_else(|| BoundaryError::config("variable does not hold floats"))?;
        if !out_len.is_null() {
            unsafe { *out_len = data.len() };
        }
        // The payload lives inside the registry's Arc until nn_var_free.
        Ok(data.as_ptr())
    })
}

/// Borrowed integer payload. Null for float variables and invalid handles.
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn nn_var_int_data(var: Handle, out_len: *mut usize) -> *const i32 {
    boundary("nn_var_int_data", ptr::null, || {
        let v = self::var(var)?;
        let data = v
            .int_data()
            .ok_or_else(|| BoundaryError::config("variable does not hold integers"))?;
        if !out_len.is_null() {
            unsafe { *out_len = data.len() };
        }
        Ok(data.as_ptr())
    })
}

#[no_mangle]
pub extern "C" fn nn_var_element_size(var: Handle) -> i32 {
    boundary("nn_var_element_size", || -1, || Ok(self::var(var)?.element_size() as i32))
}

/// Owned copy of the shape; release with `nn_tensor_shape_free()`.
#[no_mangle]
pub extern "C" fn nn_var_shape(var: Handle) -> crate::arrays::IntArrayC {
    int_array_result("nn_var_shape", || Ok(self::var(var)?.shape().to_vec()))
}

// Operators

/// Binary operator by code; see [`BINARY_OPS`].
#[no_mangle]
pub extern "C" fn nn_var_binary(op: i32, a: Handle, b: Handle) -> Handle {
    match lookup_op(&BINARY_OPS, op, "binary") {
        Ok(op) => apply_binary("nn_var_binary", op, a, b),
        Err(err) => {
            crate::error::reject("nn_var_binary", &err);
            Handle::NULL
        }
    }
}

/// Unary operator by code; see [`UNARY_OPS`].
#[no_mangle]
pub extern "C" fn nn_var_unary(op: i32, x: Handle) -> Handle {
    match lookup_op(&UNARY_OPS, op, "unary") {
        Ok(op) => apply_unary("nn_var_unary", op, x),
        Err(err) => {
            crate::error::reject("nn_var_unary", &err);
            Handle::NULL
        }
    }
}

/// Reduction by code over `axes` (all axes when empty); see [`REDUCE_OPS`].
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn nn_var_reduce(op: i32, x: Handle, axes: *const i32, axis_count: usize, keep_dims: bool) -> Handle {
    match lookup_op(&REDUCE_OPS, op, "reduce") {
        Ok(op) => apply_reduce("nn_var_reduce", op, x, axes, axis_count, keep_dims),
        Err(err) => {
            crate::error::reject("nn_var_reduce", &err);
            Handle::NULL
        }
    }
}

macro_rules! binary_fns {
    ($($name:ident => $op:ident),* $(,)?) => {
        $(
            #[no_mangle]
            pub extern "C" fn $name(a: Handle, b: Handle) -> Handle {
                apply_binary(stringify!($name), BinaryOp::$op, a, b)
            }
        )*
    };
}

macro_rules! unary_fns {
    ($($name:ident => $op:ident),* $(,)?) => {
        $(
            #[no_mangle]
            pub extern "C" fn $name(x: Handle) -> Handle {
                apply_unary(stringify!($name), UnaryOp::$op, x)
            }
        )*
    };
}

macro_rules! reduce_fns {
    ($($name:ident => $op:ident),* $(,)?) => {
        $(
            #[no_mangle]
            #[allow(clippy::not_unsafe_ptr_arg_deref)]
            pub extern "C" fn $name(x: Handle, axes: *const i32, axis_count: usize, keep_dims: bool) -> Handle {
                apply_reduce(stringify!($name), ReduceOp::$op, x, axes, axis_count, keep_dims)
            }
        )*
    };
}

binary_fns! {
    nn_var_add => Add,
    nn_var_subtract => Subtract,
    nn_var_multiply => Multiply,
    nn_var_divide => Divide,
    nn_var_pow => Pow,
    nn_var_minimum => Minimum,
    nn_var_maximum => Maximum,
    nn_var_greater => Greater,
    nn_var_greater_equal => GreaterEqual,
    nn_var_less => Less,
    nn_var_less_equal => LessEqual,
    nn_var_equal => Equal,
    nn_var_squared_difference => SquaredDifference,
    nn_var_floor_div => FloorDiv,
    nn_var_floor_mod => FloorMod,
    nn_var_atan2 => Atan2,
    nn_var_bias_add => BiasAdd,
}

unary_fns! {
    nn_var_sign => Sign,
    nn_var_abs => Abs,
    nn_var_negative => Negative,
    nn_var_floor => Floor,
    nn_var_round => Round,
    nn_var_ceil => Ceil,
    nn_var_square => Square,
    nn_var_sqrt => Sqrt,
    nn_var_rsqrt => Rsqrt,
    nn_var_exp => Exp,
    nn_var_log => Log,
    nn_var_sin => Sin,
    nn_var_cos => Cos,
    nn_var_tan => Tan,
    nn_var_asin => Asin,
    nn_var_acos => Acos,
    nn_var_atan => Atan,
    nn_var_reciprocal => Reciprocal,
    nn_var_tanh => Tanh,
    nn_var_sigmoid => Sigmoid,
}

reduce_fns! {
    nn_var_reduce_sum => Sum,
    nn_var_reduce_mean => Mean,
    nn_var_reduce_max => Max,
    nn_var_reduce_min => Min,
    nn_var_reduce_prod => Prod,
}

/// Cast to float (`to_int == false`) or to int.
#[no_mangle]
pub extern "C" fn nn_var_cast(x: Handle, to_int: bool) -> Handle {
    boundary("nn_var_cast", || Handle::NULL, || {
        let target = if to_int { CastTarget::Int } else { CastTarget::Float };
        let x = var(x)?;
        Ok(insert_var(express::cast(&x, target)?))
    })
}

#[no_mangle]
pub extern "C" fn nn_var_mat_mul(a: Handle, b: Handle, transpose_a: bool, transpose_b: bool) -> Handle {
    boundary("nn_var_mat_mul", || Handle::NULL, || {
        let a = var(a)?;
        let b = var(b)?;
        Ok(insert_var(express::mat_mul(&a, &b, transpose_a, transpose_b)?))
    })
}

#[no_mangle]
pub extern "C" fn nn_var_batch_mat_mul(a: Handle, b: Handle, adj_x: bool, adj_y: bool) -> Handle {
    boundary("nn_var_batch_mat_mul", || Handle::NULL, || {
        let a = var(a)?;
        let b = var(b)?;
        Ok(insert_var(express::batch_mat_mul(&a, &b, adj_x, adj_y)?))
    })
}

#[no_mangle]
pub extern "C" fn nn_var_arg_max(x: Handle, axis: i32) -> Handle {
    boundary("nn_var_arg_max", || Handle::NULL, || {
        let x = var(x)?;
        Ok(insert_var(express::arg_max(&x, axis)?))
    })
}

#[no_mangle]
pub extern "C" fn nn_var_arg_min(x: Handle, axis: i32) -> Handle {
    boundary("nn_var_arg_min", || Handle::NULL, || {
        let x = var(x)?;
        Ok(insert_var(express::arg_min(&x, axis)?))
    })
}

// Modules

/// Load a module bound to `inputs`/`outputs` (empty arrays mean the model's
/// own). `file` may be null when `config.base` names a module to share a
/// model with; `runtime` may be [`Handle::NULL`]; `config` may be null.
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn nn_module_load(
    inputs: StringArrayC,
    outputs: StringArrayC,
    file: *const std::os::raw::c_char,
    runtime: Handle,
    config: *const ModuleConfigC,
) -> Handle {
    boundary("nn_module_load", || Handle::NULL, || {
        let inputs = unsafe { inputs.to_vec() }?;
        let outputs = unsafe { outputs.to_vec() }?;
        let config = unsafe { config.as_ref() }.copied().unwrap_or_default();
        let path = if file.is_null() {
            None
        } else {
            Some(unsafe { path_arg(file, "file") }?)
        };

        let base = if config.base.is_null() {
            None
        } else {
            Some(registry().module(config.base)?)
        };
        let runtime = if runtime.is_null() {
            None
        } else {
            let manager = registry().runtime(runtime)?;
            let snapshot = manager.lock().clone();
            Some(snapshot)
        };

        let module = Module::load(
            inputs,
            outputs,
            path.map(Path::new),
            base.as_deref(),
            runtime.as_ref(),
            config.to_module_config(),
        )?;
        Ok(registry().modules.insert(Arc::new(module)))
    })
}

#[no_mangle]
pub extern "C" fn nn_module_free(module: Handle) -> bool {
    boundary("nn_module_free", || false, || {
        registry().modules.remove(module).map(|_| true).ok_or(BoundaryError::InvalidHandle {
            handle: module,
            expected: crate::HandleKind::Module,
        })
    })
}

/// Run a module over `count` input variables. Returns owned outputs; an
/// empty array on failure.
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn nn_module_forward(module: Handle, vars: *const Handle, count: usize) -> VarArrayC {
    boundary("nn_module_forward", VarArrayC::empty, || {
        if count > 0 && vars.is_null() {
            return Err(BoundaryError::NullPointer("vars"));
        }
        let handles = unsafe { slice_or_empty(vars, count) };
        let (module, inputs) = {
            let reg = registry();
            let module = reg.module(module)?;
            let inputs = handles
                .iter()
                .map(|&h| reg.var(h).map(|v| Var::clone(&v)))
                .collect::<Result<Vec<_>>>()?;
            (module, inputs)
        };
        let outputs = module.forward(&inputs)?;
        let mut reg = registry();
        let handles = outputs.into_iter().map(|v| reg.vars.insert(Arc::new(v))).collect();
        Ok(VarArrayC::from_vec(handles))
    })
}
