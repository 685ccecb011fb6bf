//! Runtime managers: execution settings shared by sessions and modules.

use std::sync::Arc;

use nnbridge_core::{ForwardType, RuntimeManager};
use nnbridge_ffi_common::count_to_len;
use parking_lot::Mutex;

use crate::config::{to_runtime_configs, ScheduleConfigC};
use crate::error::{boundary, BoundaryError};
use crate::handle::Handle;
use crate::registry::registry;

/// Create a runtime manager from `count` schedule configs. The first config
/// decides forward type and thread count.
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn nn_runtime_create(configs: *const ScheduleConfigC, count: i32) -> Handle {
    boundary("nn_runtime_create", || Handle::NULL, || {
        let count = count_to_len(count)?;
        let configs = unsafe { to_runtime_configs(configs, count) }?;
        let manager = RuntimeManager::from_configs(&configs)?;
        let handle = registry().runtimes.insert(Arc::new(Mutex::new(manager)));
        Ok(handle)
    })
}

/// Create a runtime manager from a forward type and thread count.
#[no_mangle]
pub extern "C" fn nn_runtime_manager_create(forward: i32, num_thread: i32) -> Handle {
    boundary("nn_runtime_manager_create", || Handle::NULL, || {
        let forward = ForwardType::from_i32(forward)
            .ok_or_else(|| BoundaryError::config(format!("unknown forward type {}", forward)))?;
        let manager = RuntimeManager::new(forward, num_thread);
        Ok(registry().runtimes.insert(Arc::new(Mutex::new(manager))))
    })
}

#[no_mangle]
pub extern "C" fn nn_runtime_set_hint(runtime: Handle, mode: i32, value: i32) -> bool {
    boundary("nn_runtime_set_hint", || false, || {
        let manager = registry().runtime(runtime)?;
        manager.lock().set_hint(mode, value);
        Ok(true)
    })
}

/// Destroy a runtime manager. Sessions and modules created with it keep
/// their settings.
#[no_mangle]
pub extern "C" fn nn_runtime_free(runtime: Handle) -> bool {
    boundary("nn_runtime_free", || false, || {
        registry()
            .runtimes
            .remove(runtime)
            .map(|_| true)
            .ok_or(BoundaryError::InvalidHandle {
                handle: runtime,
                expected: crate::HandleKind::RuntimeManager,
            })
    })
}
