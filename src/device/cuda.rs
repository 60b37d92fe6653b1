//! cudarc-backed device runtime.
//!
//! Streams and events are table-mapped to driver objects so the group
//! layer can stay on opaque handles. `record_stream` is a bookkeeping
//! no-op here: cudarc frees device memory by ownership, so there is no
//! caching-allocator recycling to defer; the hook point exists for
//! runtimes that pair this crate with one.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use cudarc::driver::{CudaContext, CudaStream, result as driver, sys};

use crate::device::{DeviceRuntime, Event, Stream};
use crate::error::{CommError, Result};
use crate::tensor::{DeviceTensor, Storage};
use crate::types::DeviceIndex;

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn driver_err(context: &str, err: driver::DriverError) -> CommError {
    CommError::backend(format!("{context}: {err:?}"), "cuda")
}

struct StreamEntry {
    device: DeviceIndex,
    stream: Arc<CudaStream>,
}

struct EventEntry {
    raw: sys::CUevent,
}

/// Device allocation released when the owning [`Storage`] drops.
struct CudaAllocation {
    ptr: sys::CUdeviceptr,
}

impl Drop for CudaAllocation {
    fn drop(&mut self) {
        unsafe {
            let _ = driver::free_sync(self.ptr);
        }
    }
}

// SAFETY: CUdeviceptr is an address, CUevent handles are only touched
// through driver calls that are thread-safe per the CUDA driver contract.
unsafe impl Send for CudaAllocation {}
unsafe impl Sync for CudaAllocation {}

/// [`DeviceRuntime`] over every CUDA device visible to the process.
pub struct CudaRuntime {
    contexts: Vec<Arc<CudaContext>>,
    default_streams: Vec<Stream>,
    streams: Mutex<HashMap<u64, StreamEntry>>,
    events: Mutex<HashMap<u64, EventEntry>>,
    next_stream: AtomicU64,
    next_event: AtomicU64,
    free_mutex: Mutex<()>,
}

// SAFETY: raw event handles in the table are only used through driver
// calls; everything else is Arc/atomic state.
unsafe impl Send for CudaRuntime {}
unsafe impl Sync for CudaRuntime {}

impl CudaRuntime {
    /// Initialize contexts for all visible devices.
    pub fn new() -> Result<Self> {
        let device_count = CudaContext::device_count()
            .map_err(|e| driver_err("device_count", e))? as usize;
        let mut runtime = Self {
            contexts: Vec::with_capacity(device_count),
            default_streams: Vec::with_capacity(device_count),
            streams: Mutex::new(HashMap::new()),
            events: Mutex::new(HashMap::new()),
            next_stream: AtomicU64::new(1),
            next_event: AtomicU64::new(1),
            free_mutex: Mutex::new(()),
        };
        for device in 0..device_count {
            let context = CudaContext::new(device)
                .map_err(|e| driver_err("CudaContext::new", e))?;
            let default = runtime.register_stream(device, context.default_stream());
            runtime.contexts.push(context);
            runtime.default_streams.push(default);
        }
        Ok(runtime)
    }

    fn register_stream(&self, device: DeviceIndex, stream: Arc<CudaStream>) -> Stream {
        let id = self.next_stream.fetch_add(1, Ordering::Relaxed);
        locked(&self.streams).insert(id, StreamEntry { device, stream });
        Stream(id)
    }

    fn context(&self, device: DeviceIndex) -> Result<&Arc<CudaContext>> {
        self.contexts.get(device).ok_or_else(|| {
            CommError::invalid_argument(format!(
                "device index {device} out of range ({} devices)",
                self.contexts.len()
            ))
        })
    }

    /// Raw driver stream for backend launches.
    pub(crate) fn raw_stream(&self, stream: Stream) -> Result<sys::CUstream> {
        let streams = locked(&self.streams);
        streams
            .get(&stream.0)
            .map(|entry| entry.stream.cu_stream())
            .ok_or_else(|| CommError::invalid_state(format!("unknown stream {stream:?}")))
    }

    fn raw_event(&self, event: Event) -> Result<sys::CUevent> {
        let events = locked(&self.events);
        events
            .get(&event.0)
            .map(|entry| entry.raw)
            .ok_or_else(|| CommError::invalid_state(format!("unknown event {event:?}")))
    }
}

impl DeviceRuntime for CudaRuntime {
    fn device_count(&self) -> usize {
        self.contexts.len()
    }

    fn set_device(&self, device: DeviceIndex) -> Result<()> {
        self.context(device)?
            .bind_to_thread()
            .map_err(|e| driver_err("bind_to_thread", e))
    }

    fn current_stream(&self, device: DeviceIndex) -> Result<Stream> {
        self.default_streams.get(device).copied().ok_or_else(|| {
            CommError::invalid_argument(format!("device index {device} out of range"))
        })
    }

    fn stream_from_pool(&self, device: DeviceIndex) -> Result<Stream> {
        let stream = self
            .context(device)?
            .new_stream()
            .map_err(|e| driver_err("new_stream", e))?;
        Ok(self.register_stream(device, stream))
    }

    fn create_event(&self, device: DeviceIndex) -> Result<Event> {
        self.set_device(device)?;
        // Timing disabled: these events only order streams and feed
        // completion queries.
        let raw = driver::event::create(sys::CUevent_flags::CU_EVENT_DISABLE_TIMING)
            .map_err(|e| driver_err("event create", e))?;
        let id = self.next_event.fetch_add(1, Ordering::Relaxed);
        locked(&self.events).insert(id, EventEntry { raw });
        Ok(Event(id))
    }

    fn destroy_event(&self, event: Event) {
        if let Some(entry) = locked(&self.events).remove(&event.0) {
            unsafe {
                let _ = driver::event::destroy(entry.raw);
            }
        }
    }

    fn record_event(&self, event: Event, stream: Stream) -> Result<()> {
        let raw = self.raw_event(event)?;
        let stream = self.raw_stream(stream)?;
        unsafe { driver::event::record(raw, stream) }.map_err(|e| driver_err("event record", e))
    }

    fn stream_wait_event(&self, stream: Stream, event: Event) -> Result<()> {
        let raw = self.raw_event(event)?;
        let stream = self.raw_stream(stream)?;
        unsafe {
            driver::stream::wait_event(
                stream,
                raw,
                sys::CUevent_wait_flags::CU_EVENT_WAIT_DEFAULT,
            )
        }
        .map_err(|e| driver_err("stream wait_event", e))
    }

    fn query_event(&self, event: Event) -> Result<bool> {
        let raw = self.raw_event(event)?;
        let status = unsafe { sys::cuEventQuery(raw) };
        match status {
            sys::CUresult::CUDA_SUCCESS => Ok(true),
            sys::CUresult::CUDA_ERROR_NOT_READY => Ok(false),
            other => Err(CommError::backend(
                format!("cuEventQuery failed: {other:?}"),
                "cuda",
            )),
        }
    }

    fn synchronize_device(&self, device: DeviceIndex) -> Result<()> {
        self.set_device(device)?;
        let status = unsafe { sys::cuCtxSynchronize() };
        if status != sys::CUresult::CUDA_SUCCESS {
            return Err(CommError::backend(
                format!("cuCtxSynchronize failed: {status:?}"),
                "cuda",
            ));
        }
        Ok(())
    }

    fn allocate(&self, device: DeviceIndex, bytes: usize) -> Result<Arc<Storage>> {
        self.set_device(device)?;
        let ptr =
            unsafe { driver::malloc_sync(bytes.max(1)) }.map_err(|e| driver_err("malloc", e))?;
        unsafe { driver::memset_d8_sync(ptr, 0, bytes.max(1)) }
            .map_err(|e| driver_err("memset", e))?;
        Ok(Arc::new(Storage::new(
            ptr as u64,
            bytes,
            device,
            Some(Arc::new(CudaAllocation { ptr })),
        )))
    }

    fn copy_tensor(&self, dst: &DeviceTensor, src: &DeviceTensor, stream: Stream) -> Result<()> {
        if dst.dtype() != src.dtype() || dst.numel() != src.numel() {
            return Err(CommError::invalid_argument(
                "copy requires matching element counts and types",
            ));
        }
        if !dst.is_contiguous() || !src.is_contiguous() {
            return Err(CommError::invalid_argument(
                "copy requires contiguous tensors",
            ));
        }
        let raw = self.raw_stream(stream)?;
        unsafe { driver::memcpy_dtod_async(dst.data_ptr(), src.data_ptr(), src.nbytes(), raw) }
            .map_err(|e| driver_err("memcpy_dtod_async", e))
    }

    fn record_stream(&self, storage: &Storage, stream: Stream) {
        tracing::trace!(ptr = storage.ptr(), stream = stream.0, "record_stream");
    }

    fn free_mutex(&self) -> &Mutex<()> {
        &self.free_mutex
    }
}
