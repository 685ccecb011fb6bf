//! Interpreters: a loaded model plus the sessions created from it.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;

use crate::config::ScheduleConfig;
use crate::error::{Result, RuntimeError};
use crate::model::Model;
use crate::runtime::RuntimeManager;
use crate::session::Session;
use crate::tensor::SharedTensor;

/// Session shared between the interpreter and its callers.
pub type SharedSession = Arc<Mutex<Session>>;

/// Identity of a session within its interpreter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// Record written by [`Interpreter::update_cache_file`].
#[derive(Debug, Serialize)]
struct CacheRecord<'a> {
    biz_code: &'a str,
    uuid: &'a str,
    session_mode: i32,
    key_size: usize,
    plan: Vec<&'a str>,
}

#[derive(Debug)]
pub struct Interpreter {
    model: Option<Arc<Model>>,
    version: String,
    biz_code: String,
    uuid: String,
    session_mode: i32,
    hints: HashMap<i32, Vec<i32>>,
    cache_file: Option<(PathBuf, usize)>,
    external_file: Option<PathBuf>,
    sessions: HashMap<SessionId, SharedSession>,
    next_session: u64,
}

impl Interpreter {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::with_model(Model::from_file(path)?))
    }

    pub fn from_buffer(bytes: &[u8]) -> Result<Self> {
        Ok(Self::with_model(Model::from_bytes(bytes)?))
    }

    fn with_model(model: Model) -> Self {
        let desc = model.desc();
        Self {
            version: desc.version.clone(),
            biz_code: desc.biz_code.clone(),
            uuid: desc.uuid.clone(),
            model: Some(Arc::new(model)),
            session_mode: 0,
            hints: HashMap::new(),
            cache_file: None,
            external_file: None,
            sessions: HashMap::new(),
            next_session: 1,
        }
    }

    /// The loaded model, or [`RuntimeError::ModelReleased`].
    pub fn model(&self) -> Result<&Arc<Model>> {
        self.model.as_ref().ok_or(RuntimeError::ModelReleased)
    }

    pub fn create_session(&mut self, config: &ScheduleConfig<'_>) -> Result<(SessionId, SharedSession)> {
        self.create_multi_path_session(std::slice::from_ref(config), None)
    }

    pub fn create_session_with_runtime(
        &mut self,
        config: &ScheduleConfig<'_>,
        runtime: &RuntimeManager,
    ) -> Result<(SessionId, SharedSession)> {
        self.create_multi_path_session(std::slice::from_ref(config), Some(runtime))
    }

    pub fn create_multi_path_session(
        &mut self,
        configs: &[ScheduleConfig<'_>],
        runtime: Option<&RuntimeManager>,
    ) -> Result<(SessionId, SharedSession)> {
        let model = Arc::clone(self.model()?);
        let session = Session::new(model, configs, runtime.map(RuntimeManager::as_override))?;
        let id = SessionId(self.next_session);
        self.next_session += 1;
        let shared = Arc::new(Mutex::new(session));
        self.sessions.insert(id, Arc::clone(&shared));
        tracing::debug!(session = id.raw(), live = self.sessions.len(), "session attached");
        Ok((id, shared))
    }

    /// Detach a session. Returns whether it was attached.
    pub fn release_session(&mut self, id: SessionId) -> bool {
        let released = self.sessions.remove(&id).is_some();
        tracing::debug!(session = id.raw(), released, live = self.sessions.len(), "session released");
        released
    }

    pub fn session(&self, id: SessionId) -> Option<SharedSession> {
        self.sessions.get(&id).cloned()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn session_ids(&self) -> Vec<SessionId> {
        let mut ids: Vec<_> = self.sessions.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn set_session_mode(&mut self, mode: i32) {
        self.session_mode = mode;
    }

    pub fn session_mode(&self) -> i32 {
        self.session_mode
    }

    pub fn set_session_hint(&mut self, mode: i32, value: i32) {
        self.hints.insert(mode, vec![value]);
    }

    pub fn set_session_hint_array(&mut self, mode: i32, values: &[i32]) {
        self.hints.insert(mode, values.to_vec());
    }

    pub fn session_hint(&self, mode: i32) -> Option<&[i32]> {
        self.hints.get(&mode).map(Vec::as_slice)
    }

    pub fn set_cache_file(&mut self, path: impl Into<PathBuf>, key_size: usize) {
        self.cache_file = Some((path.into(), key_size));
    }

    pub fn set_external_file(&mut self, path: impl Into<PathBuf>) {
        self.external_file = Some(path.into());
    }

    pub fn external_file(&self) -> Option<&Path> {
        self.external_file.as_deref()
    }

    /// Write the cache record for `session` to the configured cache file.
    /// Without a cache file this is a no-op.
    pub fn update_cache_file(&self, session: &Session) -> Result<()> {
        let Some((path, key_size)) = &self.cache_file else {
            tracing::debug!("no cache file configured");
            return Ok(());
        };
        let record = CacheRecord {
            biz_code: &self.biz_code,
            uuid: &self.uuid,
            session_mode: self.session_mode,
            key_size: *key_size,
            plan: session.plan().map(|op| op.name.as_str()).collect(),
        };
        let json = serde_json::to_vec_pretty(&record)?;
        fs::write(path, json).map_err(|source| RuntimeError::FileCreateFailed {
            path: path.clone(),
            source,
        })?;
        tracing::debug!(path = %path.display(), "cache file updated");
        Ok(())
    }

    /// Drop the model bytes. Existing sessions keep running; new sessions
    /// can no longer be created.
    pub fn release_model(&mut self) {
        if self.model.take().is_some() {
            tracing::debug!("model buffer released");
        }
    }

    pub fn model_buffer(&self) -> Option<&[u8]> {
        self.model.as_ref().map(|m| m.buffer())
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn biz_code(&self) -> &str {
        &self.biz_code
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    /// Reshape a session tensor. Sessions reading it need a new resize.
    pub fn resize_tensor(&self, tensor: &SharedTensor, dims: Vec<i32>) -> Result<()> {
        if dims.iter().any(|&d| d < 0) {
            return Err(RuntimeError::invalid(format!("negative dimension in {:?}", dims)));
        }
        tensor.write().reshape(dims)
    }

    pub fn resize_tensor_4d(&self, tensor: &SharedTensor, batch: i32, channel: i32, height: i32, width: i32) -> Result<()> {
        self.resize_tensor(tensor, vec![batch, channel, height, width])
    }
}
