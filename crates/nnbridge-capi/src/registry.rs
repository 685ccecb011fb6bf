//! Process-wide handle registry.
//!
//! Every object reachable from C lives in one of the tables below. The
//! registry lock is only held for lookups, insertions and removals: callers
//! clone the `Arc` they need and drop the guard before running anything.
//!
//! Lock order is registry, then interpreter. Session locks are only ever
//! taken with `try_lock` while the registry is held.

use std::collections::HashMap;
use std::ffi::CString;
use std::sync::Arc;

use lazy_static::lazy_static;
use parking_lot::{Mutex, MutexGuard};

use nnbridge_core::cv::{ImageProcess, Matrix};
use nnbridge_core::express::{Module, Var};
use nnbridge_core::{GenerationEngine, Interpreter, RuntimeManager, SessionId, SharedSession, SharedTensor};

use crate::error::{BoundaryError, Result};
use crate::handle::{Handle, HandleKind, HandleTable};

lazy_static! {
    static ref REGISTRY: Mutex<Registry> = Mutex::new(Registry::new());
}

/// Lock the global registry. Keep the guard short-lived.
pub(crate) fn registry() -> MutexGuard<'static, Registry> {
    REGISTRY.lock()
}

pub(crate) struct InterpreterEntry {
    pub interpreter: Arc<Mutex<Interpreter>>,
    pub version: CString,
    pub biz_code: CString,
    pub uuid: CString,
}

pub(crate) struct SessionEntry {
    pub interpreter: Handle,
    pub id: SessionId,
    pub session: SharedSession,
    /// Borrowed tensor handles, keyed by tensor allocation.
    borrowed: HashMap<usize, Handle>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Ownership {
    Owned,
    Borrowed { session: Handle },
}

pub(crate) struct TensorEntry {
    pub tensor: SharedTensor,
    pub ownership: Ownership,
}

pub(crate) struct EngineEntry {
    pub engine: Arc<Mutex<GenerationEngine>>,
    /// Backing store for the `generate_str` pointer handed out by the
    /// context accessor.
    pub generate_str: CString,
}

pub(crate) struct Registry {
    pub interpreters: HandleTable<InterpreterEntry>,
    pub sessions: HandleTable<SessionEntry>,
    pub tensors: HandleTable<TensorEntry>,
    pub modules: HandleTable<Arc<Module>>,
    pub vars: HandleTable<Arc<Var>>,
    pub runtimes: HandleTable<Arc<Mutex<RuntimeManager>>>,
    pub matrices: HandleTable<Matrix>,
    pub image_processors: HandleTable<Arc<Mutex<ImageProcess>>>,
    pub engines: HandleTable<EngineEntry>,
}

fn lookup<T>(table: &HandleTable<T>, handle: Handle) -> Result<&T> {
    table.get(handle).ok_or(BoundaryError::InvalidHandle {
        handle,
        expected: table.kind(),
    })
}

fn lookup_mut<T>(table: &mut HandleTable<T>, handle: Handle) -> Result<&mut T> {
    let expected = table.kind();
    table
        .get_mut(handle)
        .ok_or(BoundaryError::InvalidHandle { handle, expected })
}

fn c_string(s: &str) -> CString {
    CString::new(s).unwrap_or_default()
}

impl Registry {
    pub fn new() -> Self {
        Self {
            interpreters: HandleTable::new(HandleKind::Interpreter),
            sessions: HandleTable::new(HandleKind::Session),
            tensors: HandleTable::new(HandleKind::Tensor),
            modules: HandleTable::new(HandleKind::Module),
            vars: HandleTable::new(HandleKind::Variable),
            runtimes: HandleTable::new(HandleKind::RuntimeManager),
            matrices: HandleTable::new(HandleKind::Matrix),
            image_processors: HandleTable::new(HandleKind::ImageProcessor),
            engines: HandleTable::new(HandleKind::GenerationEngine),
        }
    }

    /// Number of live handles of `kind`.
    pub fn live(&self, kind: HandleKind) -> usize {
        match kind {
            HandleKind::Interpreter => self.interpreters.len(),
            HandleKind::Session => self.sessions.len(),
            HandleKind::Tensor => self.tensors.len(),
            HandleKind::Module => self.modules.len(),
            HandleKind::Variable => self.vars.len(),
            HandleKind::RuntimeManager => self.runtimes.len(),
            HandleKind::Matrix => self.matrices.len(),
            HandleKind::ImageProcessor => self.image_processors.len(),
            HandleKind::GenerationEngine => self.engines.len(),
        }
    }

    // ---- interpreters ----

    pub fn insert_interpreter(&mut self, interpreter: Interpreter) -> Handle {
        let entry = InterpreterEntry {
            version: c_string(interpreter.version()),
            biz_code: c_string(interpreter.biz_code()),
            uuid: c_string(interpreter.uuid()),
            interpreter: Arc::new(Mutex::new(interpreter)),
        };
        self.interpreters.insert(entry)
    }

    pub fn interpreter_entry(&self, handle: Handle) -> Result<&InterpreterEntry> {
        lookup(&self.interpreters, handle)
    }

    pub fn interpreter(&self, handle: Handle) -> Result<Arc<Mutex<Interpreter>>> {
        Ok(Arc::clone(&self.interpreter_entry(handle)?.interpreter))
    }

    /// Destroy an interpreter together with any sessions still attached to
    /// it. Returns how many sessions were cascaded.
    pub fn remove_interpreter(&mut self, handle: Handle) -> Result<usize> {
        lookup(&self.interpreters, handle)?;
        let attached: Vec<Handle> = self
            .sessions
            .iter()
            .filter(|(_, entry)| entry.interpreter == handle)
            .map(|(h, _)| h)
            .collect();
        if !attached.is_empty() {
            tracing::warn!(
                interpreter = ?handle,
                sessions = attached.len(),
                "interpreter destroyed with live sessions; releasing them"
            );
        }
        for session in &attached {
            self.drop_session_entry(*session);
        }
        self.interpreters.remove(handle);
        tracing::debug!(interpreter = ?handle, "interpreter released");
        Ok(attached.len())
    }

    // ---- sessions ----

    pub fn attach_session(&mut self, interpreter: Handle, id: SessionId, session: SharedSession) -> Handle {
        self.sessions.insert(SessionEntry {
            interpreter,
            id,
            session,
            borrowed: HashMap::new(),
        })
    }

    pub fn session_entry(&self, handle: Handle) -> Result<&SessionEntry> {
        lookup(&self.sessions, handle)
    }

    pub fn session(&self, handle: Handle) -> Result<SharedSession> {
        Ok(Arc::clone(&self.session_entry(handle)?.session))
    }

    /// Release a session handle, its borrowed tensor handles and its slot in
    /// the owning interpreter. A session that is currently running is left
    /// alone.
    pub fn remove_session(&mut self, handle: Handle) -> Result<()> {
        let entry = self.session_entry(handle)?;
        if entry.session.try_lock().is_none() {
            return Err(BoundaryError::SessionBusy(handle));
        }
        let (interpreter, id) = (entry.interpreter, entry.id);
        self.drop_session_entry(handle);
        if let Ok(parent) = self.interpreter_entry(interpreter) {
            parent.interpreter.lock().release_session(id);
        }
        Ok(())
    }

    fn drop_session_entry(&mut self, handle: Handle) {
        if let Some(entry) = self.sessions.remove(handle) {
            for tensor in entry.borrowed.into_values() {
                self.tensors.remove(tensor);
            }
        }
    }

    // ---- tensors ----

    pub fn insert_tensor(&mut self, tensor: SharedTensor) -> Handle {
        self.tensors.insert(TensorEntry {
            tensor,
            ownership: Ownership::Owned,
        })
    }

    /// Handle for a tensor owned by `session`. Repeated calls for the same
    /// tensor return the same handle.
    pub fn borrow_tensor(&mut self, session: Handle, tensor: &SharedTensor) -> Result<Handle> {
        let key = Arc::as_ptr(tensor) as usize;
        let existing = lookup(&self.sessions, session)?.borrowed.get(&key).copied();
        if let Some(handle) = existing {
            if self.tensors.contains(handle) {
                return Ok(handle);
            }
        }
        let handle = self.tensors.insert(TensorEntry {
            tensor: Arc::clone(tensor),
            ownership: Ownership::Borrowed { session },
        });
        lookup_mut(&mut self.sessions, session)?.borrowed.insert(key, handle);
        Ok(handle)
    }

    pub fn tensor_entry(&self, handle: Handle) -> Result<&TensorEntry> {
        lookup(&self.tensors, handle)
    }

    pub fn tensor(&self, handle: Handle) -> Result<SharedTensor> {
        Ok(Arc::clone(&self.tensor_entry(handle)?.tensor))
    }

    /// Free an owned tensor. Borrowed tensors belong to their session.
    pub fn remove_tensor(&mut self, handle: Handle) -> Result<()> {
        if let Ownership::Borrowed { .. } = self.tensor_entry(handle)?.ownership {
            return Err(BoundaryError::BorrowedTensor(handle));
        }
        self.tensors.remove(handle);
        Ok(())
    }

    // ---- expression layer ----

    pub fn module(&self, handle: Handle) -> Result<Arc<Module>> {
        lookup(&self.modules, handle).map(Arc::clone)
    }

    pub fn var(&self, handle: Handle) -> Result<Arc<Var>> {
        lookup(&self.vars, handle).map(Arc::clone)
    }

    pub fn runtime(&self, handle: Handle) -> Result<Arc<Mutex<RuntimeManager>>> {
        lookup(&self.runtimes, handle).map(Arc::clone)
    }

    // ---- cv ----

    pub fn matrix(&self, handle: Handle) -> Result<Matrix> {
        lookup(&self.matrices, handle).copied()
    }

    pub fn matrix_mut(&mut self, handle: Handle) -> Result<&mut Matrix> {
        lookup_mut(&mut self.matrices, handle)
    }

    pub fn image_processor(&self, handle: Handle) -> Result<Arc<Mutex<ImageProcess>>> {
        lookup(&self.image_processors, handle).map(Arc::clone)
    }

    // ---- generation ----

    pub fn insert_engine(&mut self, engine: GenerationEngine) -> Handle {
        self.engines.insert(EngineEntry {
            engine: Arc::new(Mutex::new(engine)),
            generate_str: CString::default(),
        })
    }

    pub fn engine(&self, handle: Handle) -> Result<Arc<Mutex<GenerationEngine>>> {
        lookup(&self.engines, handle).map(|entry| Arc::clone(&entry.engine))
    }

    pub fn engine_entry_mut(&mut self, handle: Handle) -> Result<&mut EngineEntry> {
        lookup_mut(&mut self.engines, handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nnbridge_core::ScheduleConfig;

    const MODEL: &str = r#"{
        "inputs": [{"name": "x", "shape": [1, 2]}],
        "ops": [{"name": "neg", "type": "Neg", "inputs": ["x"], "outputs": ["y"]}],
        "outputs": ["y"]
    }"#;

    fn with_session(reg: &mut Registry) -> (Handle, Handle) {
        let interp = reg.insert_interpreter(Interpreter::from_buffer(MODEL.as_bytes()).unwrap());
        let (id, session) = reg
            .interpreter(interp)
            .unwrap()
            .lock()
            .create_session(&ScheduleConfig::default())
            .unwrap();
        let session = reg.attach_session(interp, id, session);
        (interp, session)
    }

    #[test]
    fn test_borrowed_tensor_is_stable_and_protected() {
        let mut reg = Registry::new();
        let (_, session) = with_session(&mut reg);
        let tensor = reg.session(session).unwrap().lock().output(None).unwrap();
        let a = reg.borrow_tensor(session, &tensor).unwrap();
        let b = reg.borrow_tensor(session, &tensor).unwrap();
        assert_eq!(a, b);
        assert!(matches!(reg.remove_tensor(a), Err(BoundaryError::BorrowedTensor(_))));
        assert!(reg.tensors.contains(a));
    }

    #[test]
    fn test_session_release_drops_borrowed_handles() {
        let mut reg = Registry::new();
        let (interp, session) = with_session(&mut reg);
        let tensor = reg.session(session).unwrap().lock().input(None).unwrap();
        let borrowed = reg.borrow_tensor(session, &tensor).unwrap();

        reg.remove_session(session).unwrap();
        assert!(!reg.tensors.contains(borrowed));
        assert!(reg.session_entry(session).is_err());
        assert_eq!(reg.interpreter(interp).unwrap().lock().session_count(), 0);
    }

    #[test]
    fn test_busy_session_is_not_released() {
        let mut reg = Registry::new();
        let (_, session) = with_session(&mut reg);
        let shared = reg.session(session).unwrap();
        let _running = shared.lock();
        assert!(matches!(reg.remove_session(session), Err(BoundaryError::SessionBusy(_))));
        assert!(reg.session_entry(session).is_ok());
    }

    #[test]
    fn test_interpreter_release_cascades() {
        let mut reg = Registry::new();
        let (interp, session) = with_session(&mut reg);
        assert_eq!(reg.remove_interpreter(interp).unwrap(), 1);
        assert!(reg.session_entry(session).is_err());
        assert_eq!(reg.live(HandleKind::Session), 0);
        assert_eq!(reg.live(HandleKind::Interpreter), 0);
        assert!(reg.remove_interpreter(interp).is_err());
    }

    #[test]
    fn test_owned_tensor_free() {
        let mut reg = Registry::new();
        let t = reg.insert_tensor(nnbridge_core::Tensor::from_f32(vec![1], &[1.0]).unwrap().into_shared());
        assert_eq!(reg.live(HandleKind::Tensor), 1);
        reg.remove_tensor(t).unwrap();
        assert!(reg.remove_tensor(t).is_err());
        assert_eq!(reg.live(HandleKind::Tensor), 0);
    }
}
