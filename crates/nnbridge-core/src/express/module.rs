use std::path::Path;
use std::sync::Arc;

use crate::config::{PathMode, ScheduleConfig, SubPath};
use crate::error::{Result, RuntimeError};
use crate::model::Model;
use crate::runtime::RuntimeManager;
use crate::session::{RuntimeOverride, Session};

use super::var::{Var, VarData};

/// Module loading options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ModuleConfig {
    pub dynamic: bool,
    pub shape_mutable: bool,
    pub rearrange: bool,
}

/// A model bound to named inputs and outputs, run over [`Var`]s.
#[derive(Debug)]
pub struct Module {
    model: Arc<Model>,
    inputs: Vec<String>,
    outputs: Vec<String>,
    runtime: Option<RuntimeOverride>,
    config: ModuleConfig,
}

impl Module {
    /// Load a module. When `base` is given its model is shared and `path`
    /// is not read.
    pub fn load(
        inputs: Vec<String>,
        outputs: Vec<String>,
        path: Option<&Path>,
        base: Option<&Module>,
        runtime: Option<&RuntimeManager>,
        config: ModuleConfig,
    ) -> Result<Self> {
        let model = match (base, path) {
            (Some(base), _) => Arc::clone(&base.model),
            (None, Some(path)) => Arc::new(Model::from_file(path)?),
            (None, None) => return Err(RuntimeError::invalid("module needs a file or a base module")),
        };
        for name in inputs.iter().chain(&outputs) {
            if model.input(name).is_none() && model.producer(name).is_none() {
                return Err(RuntimeError::TensorNotFound(name.clone()));
            }
        }
        tracing::debug!(
            inputs = inputs.len(),
            outputs = outputs.len(),
            shared = base.is_some(),
            dynamic = config.dynamic,
            "module loaded"
        );
        Ok(Self {
            model,
            inputs,
            outputs,
            runtime: runtime.map(RuntimeManager::as_override),
            config,
        })
    }

    pub fn config(&self) -> ModuleConfig {
        self.config
    }

    pub fn shares_model_with(&self, other: &Module) -> bool {
        Arc::ptr_eq(&self.model, &other.model)
    }

    /// Run the model with `vars` bound to the module inputs, in order.
    pub fn forward(&self, vars: &[Var]) -> Result<Vec<Var>> {
        let path = if self.inputs.is_empty() && self.outputs.is_empty() {
            SubPath::default()
        } else {
            let outputs = if self.outputs.is_empty() {
                self.model.desc().outputs.clone()
            } else {
                self.outputs.clone()
            };
            SubPath {
                inputs: self.inputs.clone(),
                outputs,
                mode: PathMode::Tensor,
            }
        };
        let config = ScheduleConfig {
            path,
            ..Default::default()
        };
        let mut session = Session::new(Arc::clone(&self.model), std::slice::from_ref(&config), self.runtime)?;

        let input_names = if self.inputs.is_empty() {
            session.input_names().to_vec()
        } else {
            self.inputs.clone()
        };
        if vars.len() != input_names.len() {
            return Err(RuntimeError::invalid(format!(
                "module takes {} inputs, got {}",
                input_names.len(),
                vars.len()
            )));
        }
        for (name, var) in input_names.iter().zip(vars) {
            let tensor = session.input(Some(name))?;
            let mut tensor = tensor.write();
            tensor.reshape(var.shape().to_vec())?;
            tensor.as_f32_mut()?.copy_from_slice(&var.data().to_f32());
        }

        session.resize()?;
        session.run()?;

        let output_names = if self.outputs.is_empty() {
            session.output_names().to_vec()
        } else {
            self.outputs.clone()
        };
        output_names
            .iter()
            .map(|name| {
                let tensor = session.output(Some(name))?;
                let guard = tensor.read();
                let data = guard.as_f32()?.to_vec();
                Var::new(guard.shape().to_vec(), VarData::Float(data))
            })
            .collect()
    }
}
