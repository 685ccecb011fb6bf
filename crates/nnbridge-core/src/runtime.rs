//! Runtime managers: shared execution settings for sessions and modules.

use std::collections::HashMap;

use crate::config::ScheduleConfig;
use crate::error::{Result, RuntimeError};
use crate::session::RuntimeOverride;
use crate::types::ForwardType;

#[derive(Debug, Clone)]
pub struct RuntimeManager {
    forward: ForwardType,
    num_thread: i32,
    hints: HashMap<i32, i32>,
}

impl RuntimeManager {
    pub fn new(forward: ForwardType, num_thread: i32) -> Self {
        Self {
            forward,
            num_thread: num_thread.max(1),
            hints: HashMap::new(),
        }
    }

    /// Build from schedule configs; the first config decides forward type
    /// and thread count.
    pub fn from_configs(configs: &[ScheduleConfig<'_>]) -> Result<Self> {
        let first = configs
            .first()
            .ok_or_else(|| RuntimeError::invalid("runtime needs at least one config"))?;
        tracing::debug!(configs = configs.len(), forward = ?first.forward, "runtime manager created");
        Ok(Self::new(first.forward, first.num_thread))
    }

    pub fn set_hint(&mut self, mode: i32, value: i32) {
        self.hints.insert(mode, value);
    }

    pub fn hint(&self, mode: i32) -> Option<i32> {
        self.hints.get(&mode).copied()
    }

    pub fn forward(&self) -> ForwardType {
        self.forward
    }

    pub fn num_thread(&self) -> i32 {
        self.num_thread
    }

    pub fn as_override(&self) -> RuntimeOverride {
        RuntimeOverride {
            forward: self.forward,
            num_thread: self.num_thread,
        }
    }
}
