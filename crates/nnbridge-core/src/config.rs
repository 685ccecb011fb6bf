//! Session scheduling configuration.

use crate::types::ForwardType;

/// How a sub-path selects the operators to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PathMode {
    /// `inputs`/`outputs` name operators: run from the first input op up to,
    /// but not including, the first output op.
    #[default]
    Op,
    /// `inputs`/`outputs` name tensors: run every op needed to compute the
    /// outputs from the inputs.
    Tensor,
}

impl PathMode {
    pub fn from_i32(value: i32) -> Option<Self> {
        match value {
            0 => Some(PathMode::Op),
            1 => Some(PathMode::Tensor),
            _ => None,
        }
    }
}

/// Restricts a session to part of the model graph. Empty lists mean
/// "whole graph".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubPath {
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    pub mode: PathMode,
}

impl SubPath {
    pub fn is_unconstrained(&self) -> bool {
        self.inputs.is_empty() && self.outputs.is_empty()
    }
}

/// Backend tuning knobs. Shared with C callers, so the layout is fixed:
/// three `int` modes followed by a `size_t` of flags.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BackendConfig {
    pub memory: i32,
    pub power: i32,
    pub precision: i32,
    pub flags: usize,
}

/// Everything a session needs to know about how to run.
///
/// The backend config is borrowed: it is read while the session is created
/// and never retained past that call.
#[derive(Debug, Clone)]
pub struct ScheduleConfig<'a> {
    pub save_tensors: Vec<String>,
    pub forward: ForwardType,
    pub num_thread: i32,
    pub path: SubPath,
    pub backup: ForwardType,
    pub backend: Option<&'a BackendConfig>,
}

impl Default for ScheduleConfig<'_> {
    fn default() -> Self {
        Self {
            save_tensors: Vec::new(),
            forward: ForwardType::Cpu,
            num_thread: 4,
            path: SubPath::default(),
            backup: ForwardType::Cpu,
            backend: None,
        }
    }
}
