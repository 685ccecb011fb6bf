//! Scalar type tags, forward selectors and layout enums shared across the runtime.

use serde::{Deserialize, Serialize};

use crate::error::{Result, RuntimeError};

/// Element type category.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TypeCode {
    Int = 0,
    UInt = 1,
    Float = 2,
    Handle = 3,
    BFloat = 4,
}

impl TypeCode {
    pub fn from_u8(code: u8) -> Option<Self> {
        match code {
            0 => Some(TypeCode::Int),
            1 => Some(TypeCode::UInt),
            2 => Some(TypeCode::Float),
            3 => Some(TypeCode::Handle),
            4 => Some(TypeCode::BFloat),
            _ => None,
        }
    }
}

/// Element type descriptor `{code, bits, lanes}`.
///
/// Laid out for C callers: four bytes, two-byte aligned.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TypeTag {
    pub code: u8,
    pub bits: u8,
    pub lanes: u16,
}

impl TypeTag {
    pub const F32: TypeTag = TypeTag::new(TypeCode::Float, 32);
    pub const I32: TypeTag = TypeTag::new(TypeCode::Int, 32);
    pub const U8: TypeTag = TypeTag::new(TypeCode::UInt, 8);
    pub const I8: TypeTag = TypeTag::new(TypeCode::Int, 8);

    pub const fn new(code: TypeCode, bits: u8) -> Self {
        Self {
            code: code as u8,
            bits,
            lanes: 1,
        }
    }

    pub fn type_code(&self) -> Option<TypeCode> {
        TypeCode::from_u8(self.code)
    }

    /// Bytes per element, rounding partial bytes up.
    pub fn bytes(&self) -> usize {
        (self.bits as usize).div_ceil(8) * self.lanes.max(1) as usize
    }

    pub fn is_f32(&self) -> bool {
        *self == Self::F32
    }

    /// Parse the dtype names used in model files.
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "float" | "float32" | "f32" => Ok(Self::F32),
            "int" | "int32" | "i32" => Ok(Self::I32),
            "uint8" | "u8" => Ok(Self::U8),
            "int8" | "i8" => Ok(Self::I8),
            other => Err(RuntimeError::TensorNotSupport(other.to_string())),
        }
    }
}

impl Default for TypeTag {
    fn default() -> Self {
        Self::F32
    }
}

/// Backend selector. Only `Cpu` executes; every other value is accepted and
/// recorded, and sessions fall back to the CPU path.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ForwardType {
    #[default]
    Cpu = 0,
    Metal = 1,
    Cuda = 2,
    OpenCl = 3,
    Auto = 4,
    Nn = 5,
    OpenGl = 6,
    Vulkan = 7,
    User0 = 8,
    User1 = 9,
    User2 = 10,
    User3 = 11,
    All = 12,
    CpuExtension = 13,
}

impl ForwardType {
    pub fn from_i32(value: i32) -> Option<Self> {
        use ForwardType::*;
        Some(match value {
            0 => Cpu,
            1 => Metal,
            2 => Cuda,
            3 => OpenCl,
            4 => Auto,
            5 => Nn,
            6 => OpenGl,
            7 => Vulkan,
            8 => User0,
            9 => User1,
            10 => User2,
            11 => User3,
            12 => All,
            13 => CpuExtension,
            _ => return None,
        })
    }
}

/// Memory layout of a tensor.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DimensionType {
    /// NHWC
    Tensorflow = 0,
    /// NCHW
    #[default]
    Caffe = 1,
    /// NC4HW4
    CaffeC4 = 2,
}

impl DimensionType {
    pub fn from_i32(value: i32) -> Option<Self> {
        match value {
            0 => Some(DimensionType::Tensorflow),
            1 => Some(DimensionType::Caffe),
            2 => Some(DimensionType::CaffeC4),
            _ => None,
        }
    }
}

/// Whether a tensor stores plain values or opaque handles.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HandleDataType {
    #[default]
    None = 0,
    String = 1,
}

impl HandleDataType {
    pub fn from_i32(value: i32) -> Option<Self> {
        match value {
            0 => Some(HandleDataType::None),
            1 => Some(HandleDataType::String),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_tag_layout() {
        assert_eq!(std::mem::size_of::<TypeTag>(), 4);
        assert_eq!(std::mem::align_of::<TypeTag>(), 2);
    }

    #[test]
    fn test_type_tag_bytes() {
        assert_eq!(TypeTag::F32.bytes(), 4);
        assert_eq!(TypeTag::U8.bytes(), 1);
        let packed = TypeTag {
            code: TypeCode::Int as u8,
            bits: 4,
            lanes: 2,
        };
        assert_eq!(packed.bytes(), 2);
    }

    #[test]
    fn test_forward_type_range() {
        assert_eq!(ForwardType::from_i32(13), Some(ForwardType::CpuExtension));
        assert_eq!(ForwardType::from_i32(14), None);
        assert_eq!(ForwardType::from_i32(-1), None);
    }

    #[test]
    fn test_dtype_names() {
        assert_eq!(TypeTag::from_name("float").unwrap(), TypeTag::F32);
        assert!(TypeTag::from_name("complex64").is_err());
    }
}
