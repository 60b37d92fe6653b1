//! GPU collective communication process group.
//!
//! `commgroup` layers standard collective primitives (all-reduce,
//! broadcast, reduce, all-gather, reduce-scatter, all-to-all, barrier)
//! over a group of device-equipped processes. The heavy lifting (moving
//! bytes, reduction kernels, topology) belongs to the collective backend;
//! this crate owns the coordination around it:
//!
//! - keyed communicator bundles created once per device set through a
//!   store-based unique-id rendezvous and reused for the life of the group;
//! - the stream/event protocol that orders collective kernels after their
//!   producers and pins storage against a caching allocator;
//! - [`WorkHandle`]s tracking asynchronous completion per device, with
//!   blocking and non-blocking waits and timeout-triggered abort;
//! - a watchdog thread that polls cached communicators for asynchronous
//!   errors and propagates aborts across ranks through the store.
//!
//! The backend, device runtime, tensor storage, and store are trait seams.
//! [`LoopbackBackend`] + [`HostRuntime`] + [`HashStore`] run the whole
//! protocol on host memory (tests, CI); the `cuda` feature provides the
//! NCCL/cudarc pair.

pub mod backend;
pub mod config;
pub mod device;
pub mod error;
pub mod group;
mod reduce;
pub mod store;
pub mod tensor;
pub mod types;

#[cfg(feature = "cuda")]
pub use backend::NcclBackend;
pub use backend::{
    BackendComm, CollectiveBackend, LoopbackBackend, LoopbackFabric, UNIQUE_ID_BYTES, UniqueId,
};
pub use config::{GroupConfig, NCCL_BLOCKING_WAIT_ENV};
#[cfg(feature = "cuda")]
pub use device::CudaRuntime;
pub use device::{DeviceRuntime, Event, HostRuntime, Stream};
pub use error::{CommError, Result};
pub use group::{
    AllToAllOptions, AllgatherOptions, AllreduceOptions, BarrierOptions, BroadcastOptions,
    ProcessGroup, ReduceOptions, ReduceScatterOptions, WorkHandle,
};
pub use store::{HashStore, Store};
pub use tensor::{DeviceTensor, Storage};
pub use types::{DataType, DeviceIndex, Rank, ReduceOp};
