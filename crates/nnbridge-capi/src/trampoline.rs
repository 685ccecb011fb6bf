//! Forwarding of runtime operator callbacks to native function pointers.
//!
//! A [`Trampoline`] lives for exactly one run. For every operator it builds a
//! transient array of borrowed tensor handles, calls the native function on
//! the running thread and drops the array once the call returns. The registry
//! lock is released before native code runs.

use std::ffi::{c_void, CString};
use std::os::raw::c_char;

use nnbridge_core::{OpInfo, RunObserver, SharedTensor};
use nnbridge_ffi_common::guard;

use crate::handle::Handle;
use crate::registry::registry;

/// Operator details passed to info callbacks. Valid only during the call.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct OperatorInfoC {
    pub name: *const c_char,
    pub op_type: *const c_char,
    /// Millions of operations for the current shapes
    pub flops: f32,
}

/// `fn(tensors, count, op_name, user_data) -> continue`
pub type TensorCallback =
    Option<unsafe extern "C" fn(tensors: *const Handle, count: usize, op_name: *const c_char, user_data: *mut c_void) -> i32>;

/// `fn(tensors, count, op_info, user_data) -> continue`
pub type TensorCallbackInfo = Option<
    unsafe extern "C" fn(tensors: *const Handle, count: usize, info: *const OperatorInfoC, user_data: *mut c_void) -> i32,
>;

#[derive(Clone, Copy)]
enum Callbacks {
    Named { before: TensorCallback, after: TensorCallback },
    Info { before: TensorCallbackInfo, after: TensorCallbackInfo },
}

#[derive(Clone, Copy, Debug)]
enum Stage {
    Before,
    After,
}

/// Per-run bridge between a session run and native callbacks.
pub struct Trampoline {
    session: Handle,
    callbacks: Callbacks,
    user_data: *mut c_void,
    calls: usize,
}

impl Trampoline {
    pub fn named(session: Handle, before: TensorCallback, after: TensorCallback, user_data: *mut c_void) -> Self {
        Self {
            session,
            callbacks: Callbacks::Named { before, after },
            user_data,
            calls: 0,
        }
    }

    pub fn with_info(
        session: Handle,
        before: TensorCallbackInfo,
        after: TensorCallbackInfo,
        user_data: *mut c_void,
    ) -> Self {
        Self {
            session,
            callbacks: Callbacks::Info { before, after },
            user_data,
            calls: 0,
        }
    }

    /// Number of native calls made so far.
    pub fn calls(&self) -> usize {
        self.calls
    }

    /// Borrowed handles for `tensors`. A tensor whose session has gone away
    /// shows up as the null handle.
    fn handles(&self, tensors: &[SharedTensor]) -> Vec<Handle> {
        let mut reg = registry();
        tensors
            .iter()
            .map(|tensor| reg.borrow_tensor(self.session, tensor).unwrap_or(Handle::NULL))
            .collect()
    }

    fn invoke(&mut self, stage: Stage, op: &OpInfo<'_>, tensors: &[SharedTensor]) -> bool {
        let has_callback = match (self.callbacks, stage) {
            (Callbacks::Named { before, .. }, Stage::Before) => before.is_some(),
            (Callbacks::Named { after, .. }, Stage::After) => after.is_some(),
            (Callbacks::Info { before, .. }, Stage::Before) => before.is_some(),
            (Callbacks::Info { after, .. }, Stage::After) => after.is_some(),
        };
        if !has_callback {
            return true;
        }

        let handles = self.handles(tensors);
        let name = CString::new(op.name).unwrap_or_default();
        let user_data = self.user_data;
        self.calls += 1;

        let keep_going = guard("tensor callback", false, || {
            let status = match (self.callbacks, stage) {
                (Callbacks::Named { before: Some(f), .. }, Stage::Before)
                | (Callbacks::Named { after: Some(f), .. }, Stage::After) => unsafe {
                    f(handles.as_ptr(), handles.len(), name.as_ptr(), user_data)
                },
                (Callbacks::Info { before: Some(f), .. }, Stage::Before)
                | (Callbacks::Info { after: Some(f), .. }, Stage::After) => {
                    let op_type = CString::new(op.kind).unwrap_or_default();
                    let info = OperatorInfoC {
                        name: name.as_ptr(),
                        op_type: op_type.as_ptr(),
                        flops: op.flops,
                    };
                    unsafe { f(handles.as_ptr(), handles.len(), &info, user_data) }
                }
                _ => 1,
            };
            status != 0
        });
        tracing::trace!(op = op.name, ?stage, tensors = handles.len(), keep_going, "callback returned");
        keep_going
    }
}

impl RunObserver for Trampoline {
    fn before(&mut self, op: &OpInfo<'_>, inputs: &[SharedTensor]) -> bool {
        self.invoke(Stage::Before, op, inputs)
    }

    fn after(&mut self, op: &OpInfo<'_>, outputs: &[SharedTensor]) -> bool {
        self.invoke(Stage::After, op, outputs)
    }
}
