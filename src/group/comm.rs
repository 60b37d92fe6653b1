//! Communicator handles and device-set keys.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::backend::{BackendComm, UniqueId};
use crate::error::CommError;
use crate::tensor::DeviceTensor;
use crate::types::DeviceIndex;

/// Store key prefix announcing an aborted communicator to peer ranks.
pub(crate) const ABORTED_COMM_STORE_KEY: &str = "NCCLABORTEDCOMM";

pub(crate) fn aborted_comm_key(id_hex: &str) -> String {
    format!("{ABORTED_COMM_STORE_KEY}:{id_hex}")
}

/// One backend communicator plus the bookkeeping this layer needs: the
/// unique id it was created from and an idempotent abort latch.
pub(crate) struct CommHandle {
    comm: Arc<dyn BackendComm>,
    id: UniqueId,
    aborted: AtomicBool,
}

impl CommHandle {
    pub(crate) fn new(comm: Arc<dyn BackendComm>, id: UniqueId) -> Self {
        Self {
            comm,
            id,
            aborted: AtomicBool::new(false),
        }
    }

    pub(crate) fn id_hex(&self) -> String {
        self.id.hex()
    }

    pub(crate) fn raw(&self) -> &dyn BackendComm {
        self.comm.as_ref()
    }

    pub(crate) fn check_async_error(&self) -> Option<CommError> {
        self.comm.check_async_error()
    }

    /// Abort the backend communicator. Safe to call repeatedly; only the
    /// first call reaches the backend.
    pub(crate) fn abort(&self) {
        if !self.aborted.swap(true, Ordering::SeqCst) {
            tracing::info!(id = %self.id_hex(), "aborting communicator");
            self.comm.abort();
        }
    }
}

/// Ordered communicators of one device set, one per device.
pub(crate) type CommBundle = Vec<Arc<CommHandle>>;

/// First asynchronous error reported by any communicator of the bundle.
pub(crate) fn check_bundle_errors(bundle: &[Arc<CommHandle>]) -> Option<CommError> {
    bundle.iter().find_map(|comm| comm.check_async_error())
}

/// Canonical cache key of a device set: sorted indices joined by commas.
pub(crate) fn device_key(devices: &[DeviceIndex]) -> String {
    let mut sorted = devices.to_vec();
    sorted.sort_unstable();
    sorted
        .iter()
        .map(|d| d.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

/// The device of each tensor, in tensor order.
pub(crate) fn device_list(tensors: &[DeviceTensor]) -> Vec<DeviceIndex> {
    tensors.iter().map(DeviceTensor::device).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    use crate::device::Stream;
    use crate::error::Result;
    use crate::types::{DataType, ReduceOp};

    struct MockComm {
        aborts: AtomicUsize,
    }

    impl BackendComm for MockComm {
        fn all_reduce(
            &self,
            _: u64,
            _: u64,
            _: usize,
            _: DataType,
            _: ReduceOp,
            _: Stream,
        ) -> Result<()> {
            Ok(())
        }
        fn broadcast(&self, _: u64, _: usize, _: DataType, _: usize, _: Stream) -> Result<()> {
            Ok(())
        }
        fn reduce(
            &self,
            _: u64,
            _: u64,
            _: usize,
            _: DataType,
            _: ReduceOp,
            _: usize,
            _: Stream,
        ) -> Result<()> {
            Ok(())
        }
        fn all_gather(&self, _: u64, _: u64, _: usize, _: DataType, _: Stream) -> Result<()> {
            Ok(())
        }
        fn reduce_scatter(
            &self,
            _: u64,
            _: u64,
            _: usize,
            _: DataType,
            _: ReduceOp,
            _: Stream,
        ) -> Result<()> {
            Ok(())
        }
        fn send(&self, _: u64, _: usize, _: DataType, _: usize, _: Stream) -> Result<()> {
            Ok(())
        }
        fn recv(&self, _: u64, _: usize, _: DataType, _: usize, _: Stream) -> Result<()> {
            Ok(())
        }
        fn check_async_error(&self) -> Option<CommError> {
            None
        }
        fn abort(&self) {
            self.aborts.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_abort_is_idempotent() {
        let mock = Arc::new(MockComm {
            aborts: AtomicUsize::new(0),
        });
        let handle = CommHandle::new(
            Arc::clone(&mock) as Arc<dyn BackendComm>,
            UniqueId::from_raw([7u8; crate::backend::UNIQUE_ID_BYTES]),
        );
        handle.abort();
        handle.abort();
        handle.abort();
        assert_eq!(mock.aborts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_device_key_is_sorted_and_stable() {
        assert_eq!(device_key(&[1, 0, 3]), "0,1,3");
        assert_eq!(device_key(&[0, 1, 3]), "0,1,3");
        assert_eq!(device_key(&[2]), "2");
        assert_eq!(device_key(&[]), "");
    }

    #[test]
    fn test_aborted_comm_key_format() {
        assert_eq!(aborted_comm_key("ab3"), "NCCLABORTEDCOMM:ab3");
    }
}
