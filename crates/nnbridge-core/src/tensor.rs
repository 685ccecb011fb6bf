//! Tensors: shape, element type, layout and a word-aligned payload.
//!
//! Payloads are stored as `u64` words so that any element type up to eight
//! bytes can be viewed in place through `zerocopy` without copying.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use zerocopy::{FromBytes, IntoBytes};

use crate::error::{Result, RuntimeError};
use crate::types::{DimensionType, HandleDataType, TypeTag};

/// Tensor shared between a session and the handles that reference it.
pub type SharedTensor = Arc<RwLock<Tensor>>;

static NEXT_TENSOR_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique tensor identity. Survives reshapes and data copies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TensorId(u64);

impl TensorId {
    fn next() -> Self {
        TensorId(NEXT_TENSOR_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TensorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

/// Where the payload lives. The reference runtime keeps both in host memory
/// but only exposes a host pointer for `Host` tensors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    Host,
    Device,
}

#[derive(Debug, Clone, Default)]
struct Storage {
    words: Vec<u64>,
    byte_len: usize,
}

impl Storage {
    /// Zero-filled payload. Allocation failure is reported, not aborted on.
    fn zeroed(byte_len: usize) -> Result<Self> {
        let mut words = Vec::new();
        reserve(&mut words, byte_len)?;
        words.resize(byte_len.div_ceil(8), 0);
        Ok(Self { words, byte_len })
    }

    fn try_clone(&self) -> Result<Self> {
        let mut words = Vec::new();
        reserve(&mut words, self.byte_len)?;
        words.extend_from_slice(&self.words);
        Ok(Self {
            words,
            byte_len: self.byte_len,
        })
    }

    fn bytes(&self) -> &[u8] {
        &self.words.as_bytes()[..self.byte_len]
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        let len = self.byte_len;
        &mut self.words.as_mut_bytes()[..len]
    }
}

#[derive(Debug)]
pub struct Tensor {
    id: TensorId,
    shape: Vec<i32>,
    dtype: TypeTag,
    dim_type: DimensionType,
    placement: Placement,
    handle_type: HandleDataType,
    storage: Storage,
}

fn reserve(words: &mut Vec<u64>, byte_len: usize) -> Result<()> {
    words
        .try_reserve_exact(byte_len.div_ceil(8))
        .map_err(|_| RuntimeError::OutOfMemory { bytes: byte_len })
}

/// Element count of `shape`, or `None` when it does not fit in `usize`.
/// Non-positive extents make the tensor empty.
fn element_count_of(shape: &[i32]) -> Option<usize> {
    if shape.iter().any(|&d| d <= 0) {
        return Some(0);
    }
    shape.iter().try_fold(1usize, |acc, &d| acc.checked_mul(d as usize))
}

fn stride_of(inner: &[i32]) -> Option<i32> {
    inner.iter().try_fold(1i32, |acc, &d| acc.checked_mul(d))
}

fn byte_len_of(shape: &[i32], dtype: TypeTag) -> Result<usize> {
    element_count_of(shape)
        .and_then(|count| count.checked_mul(dtype.bytes()))
        .ok_or(RuntimeError::OutOfMemory { bytes: usize::MAX })
}

impl Tensor {
    /// Allocate a zero-filled host tensor.
    pub fn new(shape: Vec<i32>, dtype: TypeTag, dim_type: DimensionType) -> Result<Self> {
        Self::allocate(shape, dtype, dim_type, Placement::Host)
    }

    /// Allocate a zero-filled device tensor.
    pub fn new_device(shape: Vec<i32>, dtype: TypeTag, dim_type: DimensionType) -> Result<Self> {
        Self::allocate(shape, dtype, dim_type, Placement::Device)
    }

    fn allocate(shape: Vec<i32>, dtype: TypeTag, dim_type: DimensionType, placement: Placement) -> Result<Self> {
        let storage = Storage::zeroed(byte_len_of(&shape, dtype)?)?;
        Ok(Self::with_storage(shape, dtype, dim_type, placement, storage))
    }

    fn with_storage(
        shape: Vec<i32>,
        dtype: TypeTag,
        dim_type: DimensionType,
        placement: Placement,
        storage: Storage,
    ) -> Self {
        Self {
            id: TensorId::next(),
            shape,
            dtype,
            dim_type,
            placement,
            handle_type: HandleDataType::None,
            storage,
        }
    }

    /// Tensor with `dim_count` dimensions of extent zero and no payload.
    pub fn with_dims(dim_count: usize, dim_type: DimensionType) -> Self {
        Self::with_storage(
            vec![0; dim_count],
            TypeTag::F32,
            dim_type,
            Placement::Host,
            Storage::default(),
        )
    }

    /// Host tensor whose payload is copied from `data`.
    ///
    /// `data` must hold at least as many bytes as the shape requires; extra
    /// bytes are ignored.
    pub fn from_host_bytes(shape: Vec<i32>, dtype: TypeTag, data: &[u8], dim_type: DimensionType) -> Result<Self> {
        let need = byte_len_of(&shape, dtype)?;
        if data.len() < need {
            return Err(RuntimeError::InputData {
                expected: need,
                actual: data.len(),
            });
        }
        let mut tensor = Self::new(shape, dtype, dim_type)?;
        tensor.storage.bytes_mut().copy_from_slice(&data[..need]);
        Ok(tensor)
    }

    pub fn from_f32(shape: Vec<i32>, values: &[f32]) -> Result<Self> {
        Self::from_host_bytes(shape, TypeTag::F32, values.as_bytes(), DimensionType::Caffe)
    }

    /// Same shape and type as `src` with a new layout; payload allocated on request.
    pub fn from_existing(src: &Tensor, dim_type: DimensionType, alloc: bool) -> Result<Self> {
        if alloc {
            return Self::allocate(src.shape.clone(), src.dtype, dim_type, Placement::Host);
        }
        Ok(Self::with_storage(
            src.shape.clone(),
            src.dtype,
            dim_type,
            Placement::Host,
            Storage::default(),
        ))
    }

    /// Copy of this tensor with a fresh identity. A shallow clone keeps the
    /// shape and type but not the data.
    pub fn duplicate(&self, deep: bool) -> Result<Self> {
        let storage = if deep {
            self.storage.try_clone()?
        } else {
            Storage::zeroed(self.storage.byte_len)?
        };
        let mut tensor = Self::with_storage(self.shape.clone(), self.dtype, self.dim_type, self.placement, storage);
        tensor.handle_type = self.handle_type;
        Ok(tensor)
    }

    /// Host copy of a (device or host) tensor. Without `copy` only the shape is taken.
    pub fn host_from_device(&self, copy: bool) -> Result<Self> {
        let mut tensor = self.duplicate(copy)?;
        tensor.placement = Placement::Host;
        Ok(tensor)
    }

    /// Move data in from a host tensor of the same byte size.
    pub fn copy_from_host(&mut self, host: &Tensor) -> Result<()> {
        if host.size_bytes() != self.size_bytes() {
            return Err(RuntimeError::InputData {
                expected: self.size_bytes(),
                actual: host.size_bytes(),
            });
        }
        self.storage.bytes_mut().copy_from_slice(host.storage.bytes());
        Ok(())
    }

    /// Move data out into a host tensor of the same byte size.
    pub fn copy_to_host(&self, host: &mut Tensor) -> Result<()> {
        host.copy_from_host(self)
    }

    /// Change the shape, reallocating a zero-filled payload when the byte
    /// size changes. On failure the tensor is left as it was.
    pub fn reshape(&mut self, shape: Vec<i32>) -> Result<()> {
        let byte_len = byte_len_of(&shape, self.dtype)?;
        if byte_len != self.storage.byte_len {
            self.storage = Storage::zeroed(byte_len)?;
        }
        self.shape = shape;
        Ok(())
    }

    pub fn set_type(&mut self, dtype: TypeTag) -> Result<()> {
        if dtype.bytes() != self.dtype.bytes() {
            self.storage = Storage::zeroed(byte_len_of(&self.shape, dtype)?)?;
        }
        self.dtype = dtype;
        Ok(())
    }

    pub fn set_length(&mut self, index: usize, length: i32) -> Result<()> {
        if index >= self.shape.len() {
            return Err(RuntimeError::invalid(format!(
                "dimension {} out of range for rank {}",
                index,
                self.shape.len()
            )));
        }
        let mut shape = self.shape.clone();
        shape[index] = length;
        self.reshape(shape)
    }

    pub fn id(&self) -> TensorId {
        self.id
    }

    pub fn shape(&self) -> &[i32] {
        &self.shape
    }

    pub fn dimensions(&self) -> usize {
        self.shape.len()
    }

    pub fn dtype(&self) -> TypeTag {
        self.dtype
    }

    pub fn dim_type(&self) -> DimensionType {
        self.dim_type
    }

    pub fn placement(&self) -> Placement {
        self.placement
    }

    pub fn handle_type(&self) -> HandleDataType {
        self.handle_type
    }

    pub fn element_count(&self) -> usize {
        // the payload exists, so the count fit when it was allocated
        element_count_of(&self.shape).unwrap_or(usize::MAX)
    }

    pub fn size_bytes(&self) -> usize {
        self.storage.byte_len
    }

    pub fn length(&self, index: usize) -> Option<i32> {
        self.shape.get(index).copied()
    }

    /// Elements skipped when advancing one step along `index`; `None` when
    /// out of range or too large for `i32`.
    pub fn stride(&self, index: usize) -> Option<i32> {
        if index >= self.shape.len() {
            return None;
        }
        stride_of(&self.shape[index + 1..])
    }

    fn axis(&self, nhwc: usize, nchw: usize) -> i32 {
        let index = match self.dim_type {
            DimensionType::Tensorflow => nhwc,
            DimensionType::Caffe | DimensionType::CaffeC4 => nchw,
        };
        self.shape.get(index).copied().unwrap_or(1)
    }

    pub fn batch(&self) -> i32 {
        self.axis(0, 0)
    }

    pub fn channel(&self) -> i32 {
        self.axis(3, 1)
    }

    pub fn height(&self) -> i32 {
        self.axis(1, 2)
    }

    pub fn width(&self) -> i32 {
        self.axis(2, 3)
    }

    /// Device identity; zero for host tensors.
    pub fn device_id(&self) -> u64 {
        match self.placement {
            Placement::Host => 0,
            Placement::Device => self.id.raw(),
        }
    }

    pub fn bytes(&self) -> &[u8] {
        self.storage.bytes()
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        self.storage.bytes_mut()
    }

    /// Raw host pointer, or `None` for device tensors and empty payloads.
    pub fn host_ptr(&mut self) -> Option<*mut u8> {
        if self.placement == Placement::Device || self.storage.byte_len == 0 {
            return None;
        }
        Some(self.storage.words.as_mut_ptr() as *mut u8)
    }

    pub fn as_f32(&self) -> Result<&[f32]> {
        if !self.dtype.is_f32() {
            return Err(RuntimeError::TensorNotSupport(format!("{:?} viewed as f32", self.dtype)));
        }
        <[f32]>::ref_from_bytes(self.storage.bytes())
            .map_err(|_| RuntimeError::TensorNotSupport("misaligned f32 payload".into()))
    }

    pub fn as_f32_mut(&mut self) -> Result<&mut [f32]> {
        if !self.dtype.is_f32() {
            return Err(RuntimeError::TensorNotSupport(format!("{:?} viewed as f32", self.dtype)));
        }
        <[f32]>::mut_from_bytes(self.storage.bytes_mut())
            .map_err(|_| RuntimeError::TensorNotSupport("misaligned f32 payload".into()))
    }

    pub fn as_i32(&self) -> Result<&[i32]> {
        if self.dtype != TypeTag::I32 {
            return Err(RuntimeError::TensorNotSupport(format!("{:?} viewed as i32", self.dtype)));
        }
        <[i32]>::ref_from_bytes(self.storage.bytes())
            .map_err(|_| RuntimeError::TensorNotSupport("misaligned i32 payload".into()))
    }

    pub fn print_shape(&self) {
        tracing::info!(tensor = %self.id, shape = ?self.shape, dim_type = ?self.dim_type, "tensor shape");
    }

    pub fn into_shared(self) -> SharedTensor {
        Arc::new(RwLock::new(self))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_host_data_is_copied() {
        let mut data = vec![1.0f32, 2.0, 3.0, 4.0];
        let tensor = Tensor::from_f32(vec![2, 2], &data).unwrap();
        data[0] = 99.0;
        assert_eq!(tensor.as_f32().unwrap(), &[1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_short_host_data_rejected() {
        let err = Tensor::from_host_bytes(vec![4], TypeTag::F32, &[0u8; 8], DimensionType::Caffe).unwrap_err();
        assert!(matches!(err, RuntimeError::InputData { expected: 16, actual: 8 }));
    }

    #[test]
    fn test_duplicate_gets_new_identity() {
        let tensor = Tensor::from_f32(vec![2], &[5.0, 6.0]).unwrap();
        let deep = tensor.duplicate(true).unwrap();
        let shallow = tensor.duplicate(false).unwrap();
        assert_ne!(deep.id(), tensor.id());
        assert_eq!(deep.as_f32().unwrap(), &[5.0, 6.0]);
        assert_eq!(shallow.shape(), &[2]);
        assert_eq!(shallow.as_f32().unwrap(), &[0.0, 0.0]);
    }

    #[test]
    fn test_device_has_no_host_pointer() {
        let mut device = Tensor::new_device(vec![1, 3], TypeTag::F32, DimensionType::Caffe).unwrap();
        assert!(device.host_ptr().is_none());
        assert_ne!(device.device_id(), 0);

        let mut host = device.host_from_device(true).unwrap();
        assert!(host.host_ptr().is_some());
        assert_eq!(host.device_id(), 0);
    }

    #[test]
    fn test_copy_round_trip_through_device() {
        let src = Tensor::from_f32(vec![3], &[1.0, 2.0, 3.0]).unwrap();
        let mut device = Tensor::new_device(vec![3], TypeTag::F32, DimensionType::Caffe).unwrap();
        device.copy_from_host(&src).unwrap();

        let mut out = Tensor::new(vec![3], TypeTag::F32, DimensionType::Caffe).unwrap();
        device.copy_to_host(&mut out).unwrap();
        assert_eq!(out.as_f32().unwrap(), &[1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_copy_size_mismatch() {
        let src = Tensor::from_f32(vec![2], &[1.0, 2.0]).unwrap();
        let mut dst = Tensor::new(vec![3], TypeTag::F32, DimensionType::Caffe).unwrap();
        assert!(dst.copy_from_host(&src).is_err());
    }

    #[test]
    fn test_layout_accessors() {
        let nchw = Tensor::new(vec![1, 3, 4, 5], TypeTag::F32, DimensionType::Caffe).unwrap();
        assert_eq!((nchw.batch(), nchw.channel(), nchw.height(), nchw.width()), (1, 3, 4, 5));
        let nhwc = Tensor::new(vec![1, 4, 5, 3], TypeTag::F32, DimensionType::Tensorflow).unwrap();
        assert_eq!((nhwc.batch(), nhwc.channel(), nhwc.height(), nhwc.width()), (1, 3, 4, 5));
        assert_eq!(nchw.stride(1), Some(20));
        assert_eq!(nchw.stride(4), None);
    }

    #[test]
    fn test_set_length_reallocates() {
        let mut tensor = Tensor::new(vec![1, 2], TypeTag::F32, DimensionType::Caffe).unwrap();
        tensor.set_length(1, 4).unwrap();
        assert_eq!(tensor.shape(), &[1, 4]);
        assert_eq!(tensor.size_bytes(), 16);
        assert!(tensor.set_length(2, 1).is_err());
    }

    #[test]
    fn test_oversized_shape_is_reported_not_aborted() {
        let err = Tensor::new_device(vec![1 << 20, 1 << 20, 16], TypeTag::F32, DimensionType::Caffe).unwrap_err();
        assert!(matches!(err, RuntimeError::OutOfMemory { .. }));

        let err = Tensor::new(vec![i32::MAX; 8], TypeTag::F32, DimensionType::Caffe).unwrap_err();
        assert!(matches!(err, RuntimeError::OutOfMemory { bytes: usize::MAX }));
    }

    #[test]
    fn test_failed_reshape_keeps_tensor() {
        let mut tensor = Tensor::from_f32(vec![2], &[1.0, 2.0]).unwrap();
        assert!(tensor.reshape(vec![i32::MAX; 8]).is_err());
        assert_eq!(tensor.shape(), &[2]);
        assert_eq!(tensor.as_f32().unwrap(), &[1.0, 2.0]);
    }

    #[test]
    fn test_zero_extent_wins_over_overflow() {
        let tensor = Tensor::new(vec![i32::MAX, i32::MAX, i32::MAX, 0], TypeTag::F32, DimensionType::Caffe).unwrap();
        assert_eq!(tensor.size_bytes(), 0);
        assert_eq!(tensor.element_count(), 0);
    }

    #[test]
    fn test_stride_overflow_is_none() {
        assert_eq!(stride_of(&[3, 4, 5]), Some(60));
        assert_eq!(stride_of(&[]), Some(1));
        assert_eq!(stride_of(&[65536, 32768]), None);
    }
}
