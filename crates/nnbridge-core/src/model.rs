//! Model description and loading.
//!
//! The reference runtime reads models as JSON:
//!
//! ```json
//! {
//!   "version": "1.0",
//!   "biz_code": "demo",
//!   "uuid": "0000-0001",
//!   "inputs": [{"name": "input", "shape": [1, 4], "dtype": "float"}],
//!   "ops": [{"name": "relu", "type": "ReLU", "inputs": ["input"], "outputs": ["output"]}],
//!   "outputs": ["output"]
//! }
//! ```

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, RuntimeError};
use crate::types::{DimensionType, TypeTag};

/// Operators understood by the reference runtime. All of them are
/// elementwise over `f32`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpKind {
    Identity,
    #[serde(rename = "ReLU")]
    Relu,
    Sigmoid,
    Tanh,
    Neg,
    Add,
    Sub,
    Mul,
    /// `x * scale + bias`
    Scale,
}

impl OpKind {
    pub fn arity(&self) -> usize {
        match self {
            OpKind::Add | OpKind::Sub | OpKind::Mul => 2,
            _ => 1,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            OpKind::Identity => "Identity",
            OpKind::Relu => "ReLU",
            OpKind::Sigmoid => "Sigmoid",
            OpKind::Tanh => "Tanh",
            OpKind::Neg => "Neg",
            OpKind::Add => "Add",
            OpKind::Sub => "Sub",
            OpKind::Mul => "Mul",
            OpKind::Scale => "Scale",
        }
    }
}

fn default_dtype() -> String {
    "float".to_string()
}

fn default_scale() -> f32 {
    1.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputDesc {
    pub name: String,
    pub shape: Vec<i32>,
    #[serde(default = "default_dtype")]
    pub dtype: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpDesc {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: OpKind,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    #[serde(default = "default_scale")]
    pub scale: f32,
    #[serde(default)]
    pub bias: f32,
}

impl OpDesc {
    /// Evaluate the operator over already shape-checked operands.
    pub fn apply(&self, operands: &[&[f32]], out: &mut [f32]) {
        match self.kind {
            OpKind::Add | OpKind::Sub | OpKind::Mul => {
                let (a, b) = (operands[0], operands[1]);
                for ((o, &x), &y) in out.iter_mut().zip(a).zip(b) {
                    *o = match self.kind {
                        OpKind::Add => x + y,
                        OpKind::Sub => x - y,
                        _ => x * y,
                    };
                }
            }
            kind => {
                for (o, &x) in out.iter_mut().zip(operands[0]) {
                    *o = match kind {
                        OpKind::Relu => x.max(0.0),
                        OpKind::Sigmoid => 1.0 / (1.0 + (-x).exp()),
                        OpKind::Tanh => x.tanh(),
                        OpKind::Neg => -x,
                        OpKind::Scale => x * self.scale + self.bias,
                        _ => x,
                    };
                }
            }
        }
    }

    /// Output shape for the given operand shapes.
    pub fn infer_shape(&self, operands: &[&[i32]]) -> Result<Vec<i32>> {
        if operands.len() != self.kind.arity() {
            return Err(RuntimeError::ComputeSize {
                op: self.name.clone(),
                detail: format!("expected {} operands, got {}", self.kind.arity(), operands.len()),
            });
        }
        if operands.len() == 2 && operands[0] != operands[1] {
            return Err(RuntimeError::ComputeSize {
                op: self.name.clone(),
                detail: format!("operand shapes {:?} and {:?} differ", operands[0], operands[1]),
            });
        }
        if operands[0].iter().any(|&d| d < 0) {
            return Err(RuntimeError::ComputeSize {
                op: self.name.clone(),
                detail: format!("negative extent in {:?}", operands[0]),
            });
        }
        Ok(operands[0].to_vec())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDesc {
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub biz_code: String,
    #[serde(default)]
    pub uuid: String,
    pub inputs: Vec<InputDesc>,
    pub ops: Vec<OpDesc>,
    pub outputs: Vec<String>,
}

/// A parsed, validated model together with the bytes it was loaded from.
#[derive(Debug)]
pub struct Model {
    desc: ModelDesc,
    buffer: Vec<u8>,
}

impl Model {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(RuntimeError::FileNotExist(path.to_path_buf()));
        }
        let bytes = fs::read(path).map_err(|source| RuntimeError::FileOpenFailed {
            path: path.to_path_buf(),
            source,
        })?;
        let model = Self::from_bytes(&bytes)?;
        tracing::info!(path = %path.display(), ops = model.desc.ops.len(), "loaded model");
        Ok(model)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let desc: ModelDesc =
            serde_json::from_slice(bytes).map_err(|e| RuntimeError::InvalidModel(e.to_string()))?;
        validate(&desc)?;
        Ok(Self {
            desc,
            buffer: bytes.to_vec(),
        })
    }

    pub fn desc(&self) -> &ModelDesc {
        &self.desc
    }

    pub fn ops(&self) -> &[OpDesc] {
        &self.desc.ops
    }

    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }

    pub fn input(&self, name: &str) -> Option<&InputDesc> {
        self.desc.inputs.iter().find(|i| i.name == name)
    }

    /// Type and layout used for model input tensors.
    pub fn input_type(&self, input: &InputDesc) -> Result<(TypeTag, DimensionType)> {
        Ok((TypeTag::from_name(&input.dtype)?, DimensionType::Caffe))
    }

    pub fn op_index(&self, name: &str) -> Option<usize> {
        self.desc.ops.iter().position(|op| op.name == name)
    }

    /// Index of the operator producing `tensor`, if any.
    pub fn producer(&self, tensor: &str) -> Option<usize> {
        self.desc
            .ops
            .iter()
            .position(|op| op.outputs.iter().any(|o| o == tensor))
    }
}

fn validate(desc: &ModelDesc) -> Result<()> {
    let mut known: HashSet<&str> = HashSet::new();
    for input in &desc.inputs {
        TypeTag::from_name(&input.dtype)?;
        if !known.insert(&input.name) {
            return Err(RuntimeError::InvalidModel(format!("duplicate tensor '{}'", input.name)));
        }
    }
    let mut op_names = HashSet::new();
    for op in &desc.ops {
        if !op_names.insert(&op.name) {
            return Err(RuntimeError::InvalidModel(format!("duplicate op '{}'", op.name)));
        }
        if op.inputs.len() != op.kind.arity() {
            return Err(RuntimeError::InvalidModel(format!(
                "op '{}' ({}) takes {} inputs, has {}",
                op.name,
                op.kind.name(),
                op.kind.arity(),
                op.inputs.len()
            )));
        }
        if op.outputs.len() != 1 {
            return Err(RuntimeError::InvalidModel(format!("op '{}' must have one output", op.name)));
        }
        for input in &op.inputs {
            if !known.contains(input.as_str()) {
                return Err(RuntimeError::InvalidModel(format!(
                    "op '{}' reads '{}' before it is produced",
                    op.name, input
                )));
            }
        }
        for output in &op.outputs {
            if !known.insert(output) {
                return Err(RuntimeError::InvalidModel(format!("duplicate tensor '{}'", output)));
            }
        }
    }
    for output in &desc.outputs {
        if !known.contains(output.as_str()) {
            return Err(RuntimeError::InvalidModel(format!("unknown output '{}'", output)));
        }
    }
    Ok(())
}
