//! Collective backend seam.
//!
//! The process group drives an underlying GPU collective library through
//! these traits: unique-id generation, per-rank communicator creation,
//! group-batched submission windows, dense collectives and point-to-point
//! transfers on caller-provided streams, plus the asynchronous error flag
//! and abort used for fault propagation. `LoopbackBackend` implements the
//! contract on host memory; `NcclBackend` (feature `cuda`) adapts NCCL
//! through cudarc.

mod loopback;
#[cfg(feature = "cuda")]
mod nccl;

pub use loopback::{LoopbackBackend, LoopbackFabric};
#[cfg(feature = "cuda")]
pub use nccl::NcclBackend;

use std::sync::Arc;

use crate::device::Stream;
use crate::error::{CommError, Result};
use crate::types::{DataType, DeviceIndex, ReduceOp};

/// Size of a backend unique id in bytes. Every id payload moved through
/// the rendezvous store is exactly this long.
pub const UNIQUE_ID_BYTES: usize = 128;

/// Rendezvous token shared by all communicators of one bundle. Rank 0
/// generates it; the other ranks receive the bytes through the store.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct UniqueId([u8; UNIQUE_ID_BYTES]);

impl UniqueId {
    pub fn from_raw(bytes: [u8; UNIQUE_ID_BYTES]) -> Self {
        Self(bytes)
    }

    /// Reconstruct an id from a store payload, checking the exact length.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let raw: [u8; UNIQUE_ID_BYTES] = bytes.try_into().map_err(|_| {
            CommError::invalid_state(format!(
                "unique id payload of {} bytes, expected {UNIQUE_ID_BYTES}",
                bytes.len()
            ))
        })?;
        Ok(Self(raw))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Render the id as unpadded lowercase hex, byte by byte. This is the
    /// canonical string form used in store keys and cache maps.
    pub fn hex(&self) -> String {
        use std::fmt::Write;
        let mut out = String::with_capacity(UNIQUE_ID_BYTES * 2);
        for b in &self.0 {
            let _ = write!(out, "{b:x}");
        }
        out
    }
}

impl std::fmt::Debug for UniqueId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let hex = self.hex();
        write!(f, "UniqueId({}..)", &hex[..hex.len().min(16)])
    }
}

/// Factory side of the backend: id generation, communicator construction,
/// and the group-batched submission window.
pub trait CollectiveBackend: Send + Sync {
    fn generate_unique_id(&self) -> Result<UniqueId>;

    /// Create one communicator for `device`, joining the group identified
    /// by `id` as `world_rank` of `world_size`. Must be called by every
    /// rank of the group (collectively).
    fn create_comm(
        &self,
        device: DeviceIndex,
        world_size: usize,
        world_rank: usize,
        id: &UniqueId,
    ) -> Result<Arc<dyn BackendComm>>;

    /// Open a submission window: operations submitted until `group_end`
    /// are fused into one launch.
    fn group_start(&self) -> Result<()>;

    fn group_end(&self) -> Result<()>;

    /// Backend version string, embedded in `Backend` errors.
    fn version(&self) -> String;
}

/// One rank's membership in one collective group. Buffers are raw device
/// addresses; every launch lands on the caller-provided stream.
pub trait BackendComm: Send + Sync {
    fn all_reduce(
        &self,
        send: u64,
        recv: u64,
        count: usize,
        dtype: DataType,
        op: ReduceOp,
        stream: Stream,
    ) -> Result<()>;

    /// In-place broadcast from the communicator with world rank `root`.
    fn broadcast(
        &self,
        ptr: u64,
        count: usize,
        dtype: DataType,
        root: usize,
        stream: Stream,
    ) -> Result<()>;

    /// Reduce into `recv` on `root`; `recv` is unspecified elsewhere.
    fn reduce(
        &self,
        send: u64,
        recv: u64,
        count: usize,
        dtype: DataType,
        op: ReduceOp,
        root: usize,
        stream: Stream,
    ) -> Result<()>;

    /// Gather `send_count` elements from every rank into `recv`, ordered
    /// by world rank.
    fn all_gather(
        &self,
        send: u64,
        recv: u64,
        send_count: usize,
        dtype: DataType,
        stream: Stream,
    ) -> Result<()>;

    /// Reduce `world_size * recv_count` elements and scatter chunk `r` to
    /// rank `r`.
    fn reduce_scatter(
        &self,
        send: u64,
        recv: u64,
        recv_count: usize,
        dtype: DataType,
        op: ReduceOp,
        stream: Stream,
    ) -> Result<()>;

    fn send(
        &self,
        ptr: u64,
        count: usize,
        dtype: DataType,
        peer: usize,
        stream: Stream,
    ) -> Result<()>;

    fn recv(
        &self,
        ptr: u64,
        count: usize,
        dtype: DataType,
        peer: usize,
        stream: Stream,
    ) -> Result<()>;

    /// Probe the asynchronous error flag without blocking. `None` means
    /// healthy; `Some` carries the captured failure.
    fn check_async_error(&self) -> Option<CommError>;

    /// Abort in-flight operations and poison the communicator. Idempotent.
    fn abort(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unique_id_roundtrip() {
        let mut raw = [0u8; UNIQUE_ID_BYTES];
        raw[0] = 0xab;
        raw[127] = 0x01;
        let id = UniqueId::from_raw(raw);
        let restored = UniqueId::from_bytes(id.as_bytes()).unwrap();
        assert_eq!(id, restored);
    }

    #[test]
    fn test_unique_id_length_checked() {
        assert!(matches!(
            UniqueId::from_bytes(&[0u8; 16]),
            Err(CommError::InvalidState(_))
        ));
        assert!(matches!(
            UniqueId::from_bytes(&[0u8; UNIQUE_ID_BYTES + 1]),
            Err(CommError::InvalidState(_))
        ));
    }

    #[test]
    fn test_unique_id_hex_is_unpadded() {
        let mut raw = [0u8; UNIQUE_ID_BYTES];
        raw[0] = 0x0f;
        raw[1] = 0xab;
        let hex = UniqueId::from_raw(raw).hex();
        // 0x0f renders as "f", not "0f"; zero bytes render as "0".
        assert!(hex.starts_with("fab"));
        assert_eq!(hex.len(), 2 + 1 + (UNIQUE_ID_BYTES - 2));
    }
}
