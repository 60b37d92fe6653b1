//! NCCL backend through cudarc.
//!
//! Uses cudarc's `result` layer with raw device pointers, matching the
//! u64 pointer model of the rest of the crate. Communicators are created
//! collectively from a shared unique id; the asynchronous error flag maps
//! straight onto `ncclCommGetAsyncError`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use cudarc::nccl::{result as nccl, safe::Id, sys};

use crate::backend::{BackendComm, CollectiveBackend, UNIQUE_ID_BYTES, UniqueId};
use crate::device::{CudaRuntime, Stream};
use crate::error::{CommError, Result};
use crate::types::{DataType, DeviceIndex, ReduceOp};

fn to_nccl_dtype(dtype: DataType) -> Result<sys::ncclDataType_t> {
    match dtype {
        DataType::I8 => Ok(sys::ncclDataType_t::ncclInt8),
        DataType::U8 => Ok(sys::ncclDataType_t::ncclUint8),
        DataType::F32 => Ok(sys::ncclDataType_t::ncclFloat32),
        DataType::F64 => Ok(sys::ncclDataType_t::ncclFloat64),
        DataType::I32 => Ok(sys::ncclDataType_t::ncclInt32),
        DataType::I64 => Ok(sys::ncclDataType_t::ncclInt64),
        DataType::F16 => Ok(sys::ncclDataType_t::ncclFloat16),
        other => Err(CommError::unsupported(format!(
            "data type {other} is not supported for collectives"
        ))),
    }
}

fn to_nccl_op(op: ReduceOp) -> sys::ncclRedOp_t {
    match op {
        ReduceOp::Sum => sys::ncclRedOp_t::ncclSum,
        ReduceOp::Prod => sys::ncclRedOp_t::ncclProd,
        ReduceOp::Min => sys::ncclRedOp_t::ncclMin,
        ReduceOp::Max => sys::ncclRedOp_t::ncclMax,
    }
}

fn nccl_version() -> String {
    let mut version: std::os::raw::c_int = 0;
    let status = unsafe { sys::ncclGetVersion(&mut version) };
    if status != sys::ncclResult_t::ncclSuccess {
        return "unknown".to_string();
    }
    // 2.9+ encodes MMmmpp as major*10000 + minor*100 + patch.
    let (major, minor, patch) = if version >= 20900 {
        (version / 10000, (version % 10000) / 100, version % 100)
    } else {
        (version / 1000, (version % 1000) / 100, version % 100)
    };
    format!("{major}.{minor}.{patch}")
}

fn nccl_err(context: &str, err: nccl::NcclError) -> CommError {
    CommError::backend(format!("{context}: {err:?}"), nccl_version())
}

/// Build the sys-level unique id from our byte representation.
///
/// `ncclUniqueId` is `#[repr(C)]` with a single `internal: [c_char; 128]`
/// field, so the byte-by-byte copy reproduces the id exactly.
fn to_nccl_id(id: &UniqueId) -> sys::ncclUniqueId {
    let mut internal = [0 as std::ffi::c_char; UNIQUE_ID_BYTES];
    for (dst, src) in internal.iter_mut().zip(id.as_bytes()) {
        *dst = *src as std::ffi::c_char;
    }
    sys::ncclUniqueId { internal }
}

/// [`CollectiveBackend`] over NCCL.
pub struct NcclBackend {
    runtime: Arc<CudaRuntime>,
}

impl NcclBackend {
    pub fn new(runtime: Arc<CudaRuntime>) -> Self {
        Self { runtime }
    }
}

impl CollectiveBackend for NcclBackend {
    fn generate_unique_id(&self) -> Result<UniqueId> {
        let id = Id::new().map_err(|e| nccl_err("ncclGetUniqueId", e))?;
        let mut raw = [0u8; UNIQUE_ID_BYTES];
        for (dst, src) in raw.iter_mut().zip(id.internal()) {
            *dst = *src as u8;
        }
        Ok(UniqueId::from_raw(raw))
    }

    fn create_comm(
        &self,
        device: DeviceIndex,
        world_size: usize,
        world_rank: usize,
        id: &UniqueId,
    ) -> Result<Arc<dyn BackendComm>> {
        use crate::device::DeviceRuntime;
        self.runtime.set_device(device)?;
        let mut comm = std::mem::MaybeUninit::uninit();
        unsafe {
            nccl::comm_init_rank(
                comm.as_mut_ptr(),
                world_size as i32,
                to_nccl_id(id),
                world_rank as i32,
            )
            .map_err(|e| nccl_err("ncclCommInitRank", e))?;
        }
        Ok(Arc::new(NcclComm {
            comm: unsafe { comm.assume_init() },
            runtime: Arc::clone(&self.runtime),
            aborted: AtomicBool::new(false),
        }))
    }

    fn group_start(&self) -> Result<()> {
        nccl::group_start().map_err(|e| nccl_err("ncclGroupStart", e))
    }

    fn group_end(&self) -> Result<()> {
        nccl::group_end().map_err(|e| nccl_err("ncclGroupEnd", e))
    }

    fn version(&self) -> String {
        nccl_version()
    }
}

struct NcclComm {
    comm: sys::ncclComm_t,
    runtime: Arc<CudaRuntime>,
    aborted: AtomicBool,
}

// SAFETY: ncclComm_t is thread-safe per NCCL documentation when used with
// proper stream synchronization, which the group layer guarantees.
unsafe impl Send for NcclComm {}
unsafe impl Sync for NcclComm {}

impl NcclComm {
    fn cuda_stream(&self, stream: Stream) -> Result<sys::cudaStream_t> {
        Ok(self.runtime.raw_stream(stream)? as sys::cudaStream_t)
    }
}

impl BackendComm for NcclComm {
    fn all_reduce(
        &self,
        send: u64,
        recv: u64,
        count: usize,
        dtype: DataType,
        op: ReduceOp,
        stream: Stream,
    ) -> Result<()> {
        let stream = self.cuda_stream(stream)?;
        unsafe {
            nccl::all_reduce(
                send as *const std::ffi::c_void,
                recv as *mut std::ffi::c_void,
                count,
                to_nccl_dtype(dtype)?,
                to_nccl_op(op),
                self.comm,
                stream,
            )
        }
        .map_err(|e| nccl_err("ncclAllReduce", e))
    }

    fn broadcast(
        &self,
        ptr: u64,
        count: usize,
        dtype: DataType,
        root: usize,
        stream: Stream,
    ) -> Result<()> {
        let stream = self.cuda_stream(stream)?;
        unsafe {
            nccl::broadcast(
                ptr as *const std::ffi::c_void,
                ptr as *mut std::ffi::c_void,
                count,
                to_nccl_dtype(dtype)?,
                root as i32,
                self.comm,
                stream,
            )
        }
        .map_err(|e| nccl_err("ncclBroadcast", e))
    }

    fn reduce(
        &self,
        send: u64,
        recv: u64,
        count: usize,
        dtype: DataType,
        op: ReduceOp,
        root: usize,
        stream: Stream,
    ) -> Result<()> {
        let stream = self.cuda_stream(stream)?;
        unsafe {
            nccl::reduce(
                send as *const std::ffi::c_void,
                recv as *mut std::ffi::c_void,
                count,
                to_nccl_dtype(dtype)?,
                to_nccl_op(op),
                root as i32,
                self.comm,
                stream,
            )
        }
        .map_err(|e| nccl_err("ncclReduce", e))
    }

    fn all_gather(
        &self,
        send: u64,
        recv: u64,
        send_count: usize,
        dtype: DataType,
        stream: Stream,
    ) -> Result<()> {
        let stream = self.cuda_stream(stream)?;
        unsafe {
            nccl::all_gather(
                send as *const std::ffi::c_void,
                recv as *mut std::ffi::c_void,
                send_count,
                to_nccl_dtype(dtype)?,
                self.comm,
                stream,
            )
        }
        .map_err(|e| nccl_err("ncclAllGather", e))
    }

    fn reduce_scatter(
        &self,
        send: u64,
        recv: u64,
        recv_count: usize,
        dtype: DataType,
        op: ReduceOp,
        stream: Stream,
    ) -> Result<()> {
        let stream = self.cuda_stream(stream)?;
        unsafe {
            nccl::reduce_scatter(
                send as *const std::ffi::c_void,
                recv as *mut std::ffi::c_void,
                recv_count,
                to_nccl_dtype(dtype)?,
                to_nccl_op(op),
                self.comm,
                stream,
            )
        }
        .map_err(|e| nccl_err("ncclReduceScatter", e))
    }

    fn send(
        &self,
        ptr: u64,
        count: usize,
        dtype: DataType,
        peer: usize,
        stream: Stream,
    ) -> Result<()> {
        let stream = self.cuda_stream(stream)?;
        unsafe {
            nccl::send(
                ptr as *const std::ffi::c_void,
                count,
                to_nccl_dtype(dtype)?,
                peer as i32,
                self.comm,
                stream,
            )
        }
        .map_err(|e| nccl_err("ncclSend", e))
    }

    fn recv(
        &self,
        ptr: u64,
        count: usize,
        dtype: DataType,
        peer: usize,
        stream: Stream,
    ) -> Result<()> {
        let stream = self.cuda_stream(stream)?;
        unsafe {
            nccl::recv(
                ptr as *mut std::ffi::c_void,
                count,
                to_nccl_dtype(dtype)?,
                peer as i32,
                self.comm,
                stream,
            )
        }
        .map_err(|e| nccl_err("ncclRecv", e))
    }

    fn check_async_error(&self) -> Option<CommError> {
        let mut status = sys::ncclResult_t::ncclSuccess;
        let probe = unsafe { sys::ncclCommGetAsyncError(self.comm, &mut status) };
        if probe != sys::ncclResult_t::ncclSuccess {
            return Some(CommError::backend(
                format!("ncclCommGetAsyncError failed: {probe:?}"),
                nccl_version(),
            ));
        }
        if status != sys::ncclResult_t::ncclSuccess {
            return Some(CommError::backend(
                format!("asynchronous NCCL error: {status:?}"),
                nccl_version(),
            ));
        }
        None
    }

    fn abort(&self) {
        if !self.aborted.swap(true, Ordering::SeqCst) {
            unsafe {
                let _ = nccl::comm_abort(self.comm);
            }
        }
    }
}

impl Drop for NcclComm {
    fn drop(&mut self) {
        // comm_abort is the safe teardown path: it does not require the
        // communicator's streams to be drained first.
        self.abort();
    }
}
