use crate::error::{Result, RuntimeError};

/// Variable payload.
#[derive(Debug, Clone, PartialEq)]
pub enum VarData {
    Float(Vec<f32>),
    Int(Vec<i32>),
}

impl VarData {
    pub fn len(&self) -> usize {
        match self {
            VarData::Float(v) => v.len(),
            VarData::Int(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get_f64(&self, index: usize) -> f64 {
        match self {
            VarData::Float(v) => v[index] as f64,
            VarData::Int(v) => v[index] as f64,
        }
    }

    pub fn to_f32(&self) -> Vec<f32> {
        match self {
            VarData::Float(v) => v.clone(),
            VarData::Int(v) => v.iter().map(|&x| x as f32).collect(),
        }
    }
}

/// An evaluated variable: shape plus data.
#[derive(Debug, Clone, PartialEq)]
pub struct Var {
    shape: Vec<i32>,
    data: VarData,
}

pub(crate) fn element_count(shape: &[i32]) -> Result<usize> {
    shape.iter().try_fold(1usize, |acc, &d| {
        if d < 0 {
            Err(RuntimeError::invalid(format!("negative extent in {:?}", shape)))
        } else {
            Ok(acc * d as usize)
        }
    })
}

impl Var {
    pub fn new(shape: Vec<i32>, data: VarData) -> Result<Self> {
        let count = element_count(&shape)?;
        if count != data.len() {
            return Err(RuntimeError::InputData {
                expected: count,
                actual: data.len(),
            });
        }
        Ok(Self { shape, data })
    }

    pub fn const_float(values: &[f32], shape: Vec<i32>) -> Result<Self> {
        Self::new(shape, VarData::Float(values.to_vec()))
    }

    pub fn const_int(values: &[i32], shape: Vec<i32>) -> Result<Self> {
        Self::new(shape, VarData::Int(values.to_vec()))
    }

    pub fn scalar(value: f32) -> Self {
        Self {
            shape: Vec::new(),
            data: VarData::Float(vec![value]),
        }
    }

    pub fn shape(&self) -> &[i32] {
        &self.shape
    }

    pub fn data(&self) -> &VarData {
        &self.data
    }

    pub fn element_size(&self) -> usize {
        self.data.len()
    }

    pub fn is_float(&self) -> bool {
        matches!(self.data, VarData::Float(_))
    }

    pub fn float_data(&self) -> Option<&[f32]> {
        match &self.data {
            VarData::Float(v) => Some(v),
            VarData::Int(_) => None,
        }
    }

    pub fn int_data(&self) -> Option<&[i32]> {
        match &self.data {
            VarData::Int(v) => Some(v),
            VarData::Float(_) => None,
        }
    }
}
