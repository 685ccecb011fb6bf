//! Session creation, execution and tensor lookup.
//!
//! # Memory Ownership Rules
//!
//! - Sessions are owned by their interpreter; `nn_session_release()` detaches
//!   and destroys one early
//! - Tensor handles returned by the lookups are borrowed from the session:
//!   repeated lookups return the same handle, `nn_tensor_free()` rejects them,
//!   and they become invalid when the session is released
//! - Named lists and name arrays are owned by the caller and released with
//!   `nn_named_tensor_list_free()` / `nn_string_array_free()`
//!
//! # Thread Safety
//!
//! A session runs one call at a time. A call that finds the session busy
//! (another thread, or a callback re-entering during a run) fails with
//! `InvalidValue` instead of blocking.

use std::ffi::c_void;
use std::os::raw::c_char;

use nnbridge_core::{RunObserver, Session};
use nnbridge_ffi_common::{opt_cstr_to_str, NamedListC, StringArrayC};

use crate::arrays::NamedTensorListC;
use crate::config::{to_runtime_configs, ScheduleConfigC};
use crate::error::{boundary, boundary_status, BoundaryError, ErrorCode, Result};
use crate::handle::Handle;
use crate::registry::registry;
use crate::trampoline::{TensorCallback, TensorCallbackInfo, Trampoline};

/// `nn_session_get_info` codes.
pub const SESSION_INFO_MEMORY: i32 = 0;
pub const SESSION_INFO_FLOPS: i32 = 1;
pub const SESSION_INFO_BACKENDS: i32 = 2;
pub const SESSION_INFO_RESIZE_STATUS: i32 = 3;
pub const SESSION_INFO_THREAD_NUMBER: i32 = 4;

/// Run `f` on the session behind `handle`, failing if it is busy.
fn with_session<T>(handle: Handle, f: impl FnOnce(&mut Session) -> Result<T>) -> Result<T> {
    let shared = registry().session(handle)?;
    let mut session = shared.try_lock().ok_or(BoundaryError::SessionBusy(handle))?;
    f(&mut session)
}

fn create(interpreter: Handle, configs: *const ScheduleConfigC, count: usize, runtime: Option<Handle>) -> Result<Handle> {
    let configs = unsafe { to_runtime_configs(configs, count) }?;
    let (interp, runtime) = {
        let reg = registry();
        let runtime = match runtime {
            Some(h) => Some(reg.runtime(h)?),
            None => None,
        };
        (reg.interpreter(interpreter)?, runtime)
    };
    let runtime = match runtime {
        Some(shared) => {
            let manager = shared.lock();
            Some(manager.clone())
        }
        None => None,
    };
    let (id, session) = interp.lock().create_multi_path_session(&configs, runtime.as_ref())?;

    let mut reg = registry();
    if reg.interpreter_entry(interpreter).is_err() {
        interp.lock().release_session(id);
        return Err(BoundaryError::InvalidHandle {
            handle: interpreter,
            expected: crate::HandleKind::Interpreter,
        });
    }
    let handle = reg.attach_session(interpreter, id, session);
    tracing::debug!(?handle, ?interpreter, paths = configs.len(), "session created");
    Ok(handle)
}

/// Create a session. Returns the null handle if the config is rejected.
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn nn_session_create(interpreter: Handle, config: *const ScheduleConfigC) -> Handle {
    boundary("nn_session_create", || Handle::NULL, || create(interpreter, config, 1, None))
}

/// Create a session whose forward type and thread count come from `runtime`.
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn nn_session_create_with_runtime(
    interpreter: Handle,
    config: *const ScheduleConfigC,
    runtime: Handle,
) -> Handle {
    boundary("nn_session_create_with_runtime", || Handle::NULL, || {
        create(interpreter, config, 1, Some(runtime))
    })
}

/// Create one session covering the union of `count` paths.
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn nn_session_create_multi_path(
    interpreter: Handle,
    configs: *const ScheduleConfigC,
    count: usize,
) -> Handle {
    boundary("nn_session_create_multi_path", || Handle::NULL, || {
        create(interpreter, configs, count, None)
    })
}

#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn nn_session_create_multi_path_with_runtime(
    interpreter: Handle,
    configs: *const ScheduleConfigC,
    count: usize,
    runtime: Handle,
) -> Handle {
    boundary("nn_session_create_multi_path_with_runtime", || Handle::NULL, || {
        create(interpreter, configs, count, Some(runtime))
    })
}

/// Release a session. Returns whether it was released; a running session is
/// not.
#[no_mangle]
pub extern "C" fn nn_session_release(session: Handle) -> bool {
    boundary("nn_session_release", || false, || {
        registry().remove_session(session)?;
        tracing::debug!(?session, "session released");
        Ok(true)
    })
}

/// Prepare the session for its current input shapes.
#[no_mangle]
pub extern "C" fn nn_session_resize(session: Handle) -> ErrorCode {
    boundary_status("nn_session_resize", || with_session(session, |s| Ok(s.resize()?)))
}

#[no_mangle]
pub extern "C" fn nn_session_resize_ex(session: Handle, need_realloc: bool) -> ErrorCode {
    boundary_status("nn_session_resize_ex", || {
        with_session(session, |s| Ok(s.resize_ex(need_realloc)?))
    })
}

/// Run a resized session. Fails with `NoExecution` if it needs a resize.
#[no_mangle]
pub extern "C" fn nn_session_run(session: Handle) -> ErrorCode {
    boundary_status("nn_session_run", || with_session(session, |s| Ok(s.run()?)))
}

fn run_with(session: Handle, sync: bool, mut trampoline: Trampoline) -> Result<()> {
    with_session(session, |s| {
        let result = s.run_observed(Some(&mut trampoline as &mut dyn RunObserver));
        tracing::debug!(?session, sync, calls = trampoline.calls(), ok = result.is_ok(), "callback run finished");
        Ok(result?)
    })
}

/// Run with per-operator callbacks receiving the operator name.
///
/// `before` returning 0 skips the operator; `after` returning 0 stops the run
/// with `CallbackStop`. Null callbacks always continue. Both run on the
/// calling thread; the tensor handles they receive are borrowed from the
/// session.
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn nn_session_run_with_callback(
    session: Handle,
    before: TensorCallback,
    after: TensorCallback,
    sync: bool,
    user_data: *mut c_void,
) -> ErrorCode {
    boundary_status("nn_session_run_with_callback", || {
        run_with(session, sync, Trampoline::named(session, before, after, user_data))
    })
}

/// Like `nn_session_run_with_callback()`, with operator info instead of the
/// bare name.
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn nn_session_run_with_callback_info(
    session: Handle,
    before: TensorCallbackInfo,
    after: TensorCallbackInfo,
    sync: bool,
    user_data: *mut c_void,
) -> ErrorCode {
    boundary_status("nn_session_run_with_callback_info", || {
        run_with(session, sync, Trampoline::with_info(session, before, after, user_data))
    })
}

fn lookup(session: Handle, name: *const c_char, output: bool) -> Result<Handle> {
    let name = unsafe { opt_cstr_to_str(name) }?;
    let tensor = with_session(session, |s| {
        let tensor = if output { s.output(name) } else { s.input(name) };
        Ok(tensor?)
    })?;
    registry().borrow_tensor(session, &tensor)
}

/// Borrowed handle of an input tensor; a null name selects the first input.
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn nn_session_get_input(session: Handle, name: *const c_char) -> Handle {
    boundary("nn_session_get_input", || Handle::NULL, || lookup(session, name, false))
}

/// Borrowed handle of an output tensor; a null name selects the first output.
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn nn_session_get_output(session: Handle, name: *const c_char) -> Handle {
    boundary("nn_session_get_output", || Handle::NULL, || lookup(session, name, true))
}

fn lookup_all(session: Handle, output: bool) -> Result<NamedTensorListC> {
    let tensors = with_session(session, |s| Ok(if output { s.outputs_all() } else { s.inputs_all() }))?;
    let mut reg = registry();
    let pairs = tensors
        .into_iter()
        .map(|(name, tensor)| Ok((name, reg.borrow_tensor(session, &tensor)?)))
        .collect::<Result<Vec<_>>>()?;
    Ok(NamedListC::from_pairs(pairs))
}

/// Every input as `(name, borrowed handle)`.
#[no_mangle]
pub extern "C" fn nn_session_get_input_all(session: Handle) -> NamedTensorListC {
    boundary("nn_session_get_input_all", NamedTensorListC::empty, || lookup_all(session, false))
}

/// Every output as `(name, borrowed handle)`.
#[no_mangle]
pub extern "C" fn nn_session_get_output_all(session: Handle) -> NamedTensorListC {
    boundary("nn_session_get_output_all", NamedTensorListC::empty, || lookup_all(session, true))
}

#[no_mangle]
pub extern "C" fn nn_session_input_names(session: Handle) -> StringArrayC {
    boundary("nn_session_input_names", StringArrayC::empty, || {
        with_session(session, |s| Ok(StringArrayC::from_strings(s.input_names().to_vec())))
    })
}

#[no_mangle]
pub extern "C" fn nn_session_output_names(session: Handle) -> StringArrayC {
    boundary("nn_session_output_names", StringArrayC::empty, || {
        with_session(session, |s| Ok(StringArrayC::from_strings(s.output_names().to_vec())))
    })
}

/// Write one session statistic to `out`.
///
/// `SESSION_INFO_MEMORY` and `SESSION_INFO_FLOPS` write an `f32`; the other
/// codes write an `i32`.
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn nn_session_get_info(session: Handle, code: i32, out: *mut c_void) -> bool {
    boundary("nn_session_get_info", || false, || {
        if out.is_null() {
            return Err(BoundaryError::NullPointer("out"));
        }
        let info = with_session(session, |s| Ok(s.info()))?;
        unsafe {
            match code {
                SESSION_INFO_MEMORY => *(out as *mut f32) = info.memory_mb,
                SESSION_INFO_FLOPS => *(out as *mut f32) = info.flops_m,
                SESSION_INFO_BACKENDS => *(out as *mut i32) = info.backends,
                SESSION_INFO_RESIZE_STATUS => *(out as *mut i32) = info.resize_status,
                SESSION_INFO_THREAD_NUMBER => *(out as *mut i32) = info.threads,
                _ => return Err(BoundaryError::config(format!("unknown session info code {}", code))),
            }
        }
        Ok(true)
    })
}

/// Accepted for compatibility; the reference runtime keeps no trained
/// weights to write back.
#[no_mangle]
pub extern "C" fn nn_session_update_to_model(session: Handle) -> ErrorCode {
    boundary_status("nn_session_update_to_model", || with_session(session, |_| Ok(())))
}
