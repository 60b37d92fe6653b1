//! Device tensor descriptors.
//!
//! The process group coordinates collectives; it does not own a tensor
//! library. `DeviceTensor` is the minimal descriptor the dispatch layer
//! needs: a device address, an element type, a shape, and enough storage
//! identity to reason about aliasing for the zero-copy scatter/gather path.

use std::any::Any;
use std::sync::Arc;

use crate::device::DeviceRuntime;
use crate::error::{CommError, Result};
use crate::types::{DataType, DeviceIndex};

/// A region of device memory.
///
/// Aliasing is identity-based: two tensors share storage iff they hold the
/// same `Arc<Storage>`. The optional owner keeps the underlying allocation
/// alive for runtimes that hand out owned buffers.
pub struct Storage {
    ptr: u64,
    len: usize,
    device: DeviceIndex,
    _owner: Option<Arc<dyn Any + Send + Sync>>,
}

impl Storage {
    pub fn new(
        ptr: u64,
        len: usize,
        device: DeviceIndex,
        owner: Option<Arc<dyn Any + Send + Sync>>,
    ) -> Self {
        Self {
            ptr,
            len,
            device,
            _owner: owner,
        }
    }

    /// Base device address of the region.
    pub fn ptr(&self) -> u64 {
        self.ptr
    }

    /// Length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn device(&self) -> DeviceIndex {
        self.device
    }
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage")
            .field("ptr", &format_args!("{:#x}", self.ptr))
            .field("len", &self.len)
            .field("device", &self.device)
            .finish()
    }
}

/// A typed, shaped view into a [`Storage`].
#[derive(Debug, Clone)]
pub struct DeviceTensor {
    storage: Arc<Storage>,
    storage_offset: usize,
    shape: Vec<usize>,
    dtype: DataType,
    contiguous: bool,
    dense: bool,
}

impl DeviceTensor {
    /// Create a contiguous dense view at `storage_offset` (in elements).
    pub fn new(
        storage: Arc<Storage>,
        storage_offset: usize,
        shape: Vec<usize>,
        dtype: DataType,
    ) -> Result<Self> {
        Self::from_parts(storage, storage_offset, shape, dtype, true, true)
    }

    /// Create a view with explicit contiguity/density flags (the flags are
    /// descriptor facts reported by the producing tensor library).
    pub fn from_parts(
        storage: Arc<Storage>,
        storage_offset: usize,
        shape: Vec<usize>,
        dtype: DataType,
        contiguous: bool,
        dense: bool,
    ) -> Result<Self> {
        let numel: usize = shape.iter().product();
        let end = (storage_offset + numel) * dtype.size_in_bytes();
        if end > storage.len() {
            return Err(CommError::invalid_argument(format!(
                "tensor view of {numel} {dtype} elements at offset {storage_offset} \
                 exceeds storage of {} bytes",
                storage.len()
            )));
        }
        Ok(Self {
            storage,
            storage_offset,
            shape,
            dtype,
            contiguous,
            dense,
        })
    }

    /// Allocate a fresh contiguous tensor on `device`.
    pub fn alloc(
        runtime: &dyn DeviceRuntime,
        device: DeviceIndex,
        shape: &[usize],
        dtype: DataType,
    ) -> Result<Self> {
        let numel: usize = shape.iter().product();
        let storage = runtime.allocate(device, numel * dtype.size_in_bytes())?;
        Self::new(storage, 0, shape.to_vec(), dtype)
    }

    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    /// Size of the first dimension (1 for zero-dimensional tensors).
    pub fn size0(&self) -> usize {
        self.shape.first().copied().unwrap_or(1)
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn dtype(&self) -> DataType {
        self.dtype
    }

    pub fn device(&self) -> DeviceIndex {
        self.storage.device()
    }

    pub fn is_contiguous(&self) -> bool {
        self.contiguous
    }

    pub fn is_dense(&self) -> bool {
        self.dense
    }

    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    /// Offset into the storage, in elements.
    pub fn storage_offset(&self) -> usize {
        self.storage_offset
    }

    /// Device address of the first element.
    pub fn data_ptr(&self) -> u64 {
        self.storage.ptr() + (self.storage_offset * self.dtype.size_in_bytes()) as u64
    }

    /// Total bytes covered by this view.
    pub fn nbytes(&self) -> usize {
        self.numel() * self.dtype.size_in_bytes()
    }

    /// Whether `self` and `other` are views into the same storage.
    pub fn same_storage(&self, other: &DeviceTensor) -> bool {
        Arc::ptr_eq(&self.storage, &other.storage)
    }

    /// Zero-copy 1-D view of `len` elements starting at element `start`
    /// of this view. Requires a contiguous source.
    pub fn element_slice(&self, start: usize, len: usize) -> Result<DeviceTensor> {
        if !self.contiguous {
            return Err(CommError::invalid_argument(
                "cannot slice a non-contiguous tensor",
            ));
        }
        if start + len > self.numel() {
            return Err(CommError::invalid_argument(format!(
                "slice [{start}, {}) out of bounds for tensor of {} elements",
                start + len,
                self.numel()
            )));
        }
        DeviceTensor::new(
            Arc::clone(&self.storage),
            self.storage_offset + start,
            vec![len],
            self.dtype,
        )
    }
}
