//! Device runtime seam.
//!
//! Collective kernels run on dedicated streams while producers run on the
//! caller's current streams; the group layer orders the two with events and
//! pins storage via the caching allocator's `record_stream` hook. All of
//! that driver surface is behind [`DeviceRuntime`] so the coordination
//! logic is independent of the GPU stack: `HostRuntime` models the same
//! semantics on host memory, `CudaRuntime` (feature `cuda`) adapts cudarc.

#[cfg(feature = "cuda")]
mod cuda;
mod host;

#[cfg(feature = "cuda")]
pub use cuda::CudaRuntime;
pub use host::HostRuntime;

use std::sync::{Arc, Mutex};

use crate::error::Result;
use crate::tensor::{DeviceTensor, Storage};
use crate::types::DeviceIndex;

/// Opaque handle to an execution stream owned by a [`DeviceRuntime`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Stream(pub(crate) u64);

/// Opaque handle to a synchronization event owned by a [`DeviceRuntime`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Event(pub(crate) u64);

/// Driver and allocator operations the process group depends on.
pub trait DeviceRuntime: Send + Sync {
    /// Number of devices visible to this runtime.
    fn device_count(&self) -> usize;

    /// Make `device` the active device for subsequent driver calls.
    fn set_device(&self, device: DeviceIndex) -> Result<()>;

    /// The caller-facing stream of `device` (where producers enqueue work).
    fn current_stream(&self, device: DeviceIndex) -> Result<Stream>;

    /// Draw a fresh dedicated stream for collective kernels.
    fn stream_from_pool(&self, device: DeviceIndex) -> Result<Stream>;

    fn create_event(&self, device: DeviceIndex) -> Result<Event>;

    /// Release an event created by [`DeviceRuntime::create_event`].
    fn destroy_event(&self, event: Event);

    /// Record `event` at the current tail of `stream`.
    fn record_event(&self, event: Event, stream: Stream) -> Result<()>;

    /// Make `stream` wait (device-side, without blocking the host) until
    /// `event` completes.
    fn stream_wait_event(&self, stream: Stream, event: Event) -> Result<()>;

    /// Non-blocking completion probe: `Ok(true)` complete, `Ok(false)` not
    /// ready, `Err` for any other outcome (fatal).
    fn query_event(&self, event: Event) -> Result<bool>;

    /// Block until all streams of `device` have drained.
    fn synchronize_device(&self, device: DeviceIndex) -> Result<()>;

    /// Allocate `bytes` of zeroed device memory.
    fn allocate(&self, device: DeviceIndex, bytes: usize) -> Result<Arc<Storage>>;

    /// Enqueue an element-wise copy of `src` into `dst` on `stream`.
    /// Both tensors must be contiguous, with equal element counts and types.
    fn copy_tensor(&self, dst: &DeviceTensor, src: &DeviceTensor, stream: Stream) -> Result<()>;

    /// Tell the caching allocator that `storage` is in use on `stream`, so
    /// a free from another stream is deferred until `stream` catches up.
    fn record_stream(&self, storage: &Storage, stream: Stream);

    /// The caching allocator's free mutex. Held for the span of a backend
    /// group submission window so no storage is recycled mid-submission.
    fn free_mutex(&self) -> &Mutex<()>;
}
