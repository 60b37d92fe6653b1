//! Host-memory runtime.
//!
//! Models the device execution semantics the group layer is written
//! against: every stream is a FIFO executor thread, events are completion
//! markers flipped in stream order, and cross-stream waits park the waiting
//! stream without blocking the submitting host thread. This is what makes
//! the synchronization protocol exercisable in ordinary tests.

use std::alloc::{self, Layout};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;

use crossbeam_channel::{Sender, unbounded};

use crate::device::{DeviceRuntime, Event, Stream};
use crate::error::{CommError, Result};
use crate::tensor::{DeviceTensor, Storage};
use crate::types::{DataType, DeviceIndex};

pub(crate) type StreamOp = Box<dyn FnOnce() + Send>;

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Submitted/completed counters for one stream, so `synchronize_device`
/// can wait for everything enqueued before the call.
struct Progress {
    counts: Mutex<(u64, u64)>,
    cv: Condvar,
}

impl Progress {
    fn new() -> Self {
        Self {
            counts: Mutex::new((0, 0)),
            cv: Condvar::new(),
        }
    }

    fn submit(&self) -> u64 {
        let mut counts = locked(&self.counts);
        counts.0 += 1;
        counts.0
    }

    fn complete(&self) {
        let mut counts = locked(&self.counts);
        counts.1 += 1;
        self.cv.notify_all();
    }

    fn wait_until_completed(&self, target: u64) {
        let mut counts = locked(&self.counts);
        while counts.1 < target {
            counts = self
                .cv
                .wait(counts)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn submitted(&self) -> u64 {
        locked(&self.counts).0
    }
}

struct StreamEntry {
    device: DeviceIndex,
    sender: Sender<StreamOp>,
    progress: Arc<Progress>,
}

/// `recorded` is bumped on every `record_event`; the executor bumps `done`
/// when the recording's position in the stream is reached. A never-recorded
/// event counts as complete, matching event query semantics.
struct EventSlot {
    seqs: Mutex<(u64, u64)>,
    cv: Condvar,
}

impl EventSlot {
    fn new() -> Self {
        Self {
            seqs: Mutex::new((0, 0)),
            cv: Condvar::new(),
        }
    }

    fn begin_record(&self) -> u64 {
        let mut seqs = locked(&self.seqs);
        seqs.0 += 1;
        seqs.0
    }

    fn mark_done(&self, seq: u64) {
        let mut seqs = locked(&self.seqs);
        seqs.1 = seqs.1.max(seq);
        self.cv.notify_all();
    }

    fn is_complete(&self) -> bool {
        let seqs = locked(&self.seqs);
        seqs.1 >= seqs.0
    }

    fn recorded_seq(&self) -> u64 {
        locked(&self.seqs).0
    }

    fn block_until(&self, target: u64) {
        let mut seqs = locked(&self.seqs);
        while seqs.1 < target {
            seqs = self.cv.wait(seqs).unwrap_or_else(PoisonError::into_inner);
        }
    }
}

/// Raw zeroed host allocation, freed when the owning [`Storage`] drops.
struct HostAllocation {
    ptr: *mut u8,
    layout: Layout,
}

// SAFETY: the allocation is a plain byte region; all access goes through
// raw pointers synchronized by the stream executors.
unsafe impl Send for HostAllocation {}
unsafe impl Sync for HostAllocation {}

impl HostAllocation {
    fn zeroed(bytes: usize) -> Result<Self> {
        let layout = Layout::from_size_align(bytes.max(1), 64)
            .map_err(|e| CommError::invalid_state(format!("bad allocation layout: {e}")))?;
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        if ptr.is_null() {
            return Err(CommError::invalid_state(format!(
                "host allocation of {bytes} bytes failed"
            )));
        }
        Ok(Self { ptr, layout })
    }
}

impl Drop for HostAllocation {
    fn drop(&mut self) {
        unsafe { alloc::dealloc(self.ptr, self.layout) };
    }
}

/// Host implementation of [`DeviceRuntime`] with a configurable device
/// count. One default ("current") stream per device is created up front;
/// `stream_from_pool` spawns additional executors on demand.
pub struct HostRuntime {
    device_count: usize,
    default_streams: Vec<Stream>,
    streams: Mutex<HashMap<u64, StreamEntry>>,
    events: Mutex<HashMap<u64, Arc<EventSlot>>>,
    next_stream: AtomicU64,
    next_event: AtomicU64,
    free_mutex: Mutex<()>,
}

impl HostRuntime {
    pub fn new(device_count: usize) -> Result<Self> {
        let mut runtime = Self {
            device_count,
            default_streams: Vec::with_capacity(device_count),
            streams: Mutex::new(HashMap::new()),
            events: Mutex::new(HashMap::new()),
            next_stream: AtomicU64::new(1),
            next_event: AtomicU64::new(1),
            free_mutex: Mutex::new(()),
        };
        for device in 0..device_count {
            let stream = runtime.spawn_stream(device)?;
            runtime.default_streams.push(stream);
        }
        Ok(runtime)
    }

    fn spawn_stream(&self, device: DeviceIndex) -> Result<Stream> {
        let id = self.next_stream.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = unbounded::<StreamOp>();
        let progress = Arc::new(Progress::new());
        let worker_progress = Arc::clone(&progress);
        thread::Builder::new()
            .name(format!("host-stream-{id}"))
            .spawn(move || {
                for op in receiver {
                    op();
                    worker_progress.complete();
                }
            })
            .map_err(|e| CommError::invalid_state(format!("failed to spawn stream: {e}")))?;
        locked(&self.streams).insert(
            id,
            StreamEntry {
                device,
                sender,
                progress,
            },
        );
        Ok(Stream(id))
    }

    /// Enqueue an arbitrary operation at the tail of `stream`.
    pub(crate) fn enqueue(&self, stream: Stream, op: StreamOp) -> Result<()> {
        let streams = locked(&self.streams);
        let entry = streams
            .get(&stream.0)
            .ok_or_else(|| CommError::invalid_state(format!("unknown stream {:?}", stream)))?;
        entry.progress.submit();
        entry
            .sender
            .send(op)
            .map_err(|_| CommError::invalid_state("stream executor terminated"))
    }

    fn event_slot(&self, event: Event) -> Result<Arc<EventSlot>> {
        locked(&self.events)
            .get(&event.0)
            .cloned()
            .ok_or_else(|| CommError::invalid_state(format!("unknown event {:?}", event)))
    }

    fn check_device(&self, device: DeviceIndex) -> Result<()> {
        if device >= self.device_count {
            return Err(CommError::invalid_argument(format!(
                "device index {device} out of range ({} devices)",
                self.device_count
            )));
        }
        Ok(())
    }

    fn check_host_access(&self, tensor: &DeviceTensor, dtype: DataType, len: usize) -> Result<()> {
        if tensor.dtype() != dtype {
            return Err(CommError::invalid_argument(format!(
                "host access expects {dtype}, tensor is {}",
                tensor.dtype()
            )));
        }
        if !tensor.is_contiguous() {
            return Err(CommError::invalid_argument(
                "host access requires a contiguous tensor",
            ));
        }
        if tensor.numel() != len {
            return Err(CommError::invalid_argument(format!(
                "host access length {len} does not match tensor of {} elements",
                tensor.numel()
            )));
        }
        Ok(())
    }

    /// Fill a contiguous f32 tensor from host data (immediate, not
    /// stream-ordered; callers populate inputs before submission).
    pub fn write_f32(&self, tensor: &DeviceTensor, data: &[f32]) -> Result<()> {
        self.check_host_access(tensor, DataType::F32, data.len())?;
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), tensor.data_ptr() as *mut f32, data.len())
        };
        Ok(())
    }

    /// Read a contiguous f32 tensor back to host data.
    pub fn read_f32(&self, tensor: &DeviceTensor) -> Result<Vec<f32>> {
        if tensor.dtype() != DataType::F32 || !tensor.is_contiguous() {
            return Err(CommError::invalid_argument(
                "host read requires a contiguous f32 tensor",
            ));
        }
        let mut out = vec![0f32; tensor.numel()];
        unsafe {
            std::ptr::copy_nonoverlapping(tensor.data_ptr() as *const f32, out.as_mut_ptr(), out.len())
        };
        Ok(out)
    }

    /// Fill a contiguous tensor from raw little-endian bytes.
    pub fn write_bytes(&self, tensor: &DeviceTensor, bytes: &[u8]) -> Result<()> {
        if !tensor.is_contiguous() || bytes.len() != tensor.nbytes() {
            return Err(CommError::invalid_argument(
                "host write requires a contiguous tensor and exact byte length",
            ));
        }
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), tensor.data_ptr() as *mut u8, bytes.len())
        };
        Ok(())
    }

    /// Read a contiguous tensor's bytes back to the host.
    pub fn read_bytes(&self, tensor: &DeviceTensor) -> Result<Vec<u8>> {
        if !tensor.is_contiguous() {
            return Err(CommError::invalid_argument(
                "host read requires a contiguous tensor",
            ));
        }
        let mut out = vec![0u8; tensor.nbytes()];
        unsafe {
            std::ptr::copy_nonoverlapping(tensor.data_ptr() as *const u8, out.as_mut_ptr(), out.len())
        };
        Ok(out)
    }
}

impl DeviceRuntime for HostRuntime {
    fn device_count(&self) -> usize {
        self.device_count
    }

    fn set_device(&self, device: DeviceIndex) -> Result<()> {
        // Host memory is uniformly addressable; only validate the index.
        self.check_device(device)
    }

    fn current_stream(&self, device: DeviceIndex) -> Result<Stream> {
        self.default_streams
            .get(device)
            .copied()
            .ok_or_else(|| {
                CommError::invalid_argument(format!("device index {device} out of range"))
            })
    }

    fn stream_from_pool(&self, device: DeviceIndex) -> Result<Stream> {
        self.check_device(device)?;
        self.spawn_stream(device)
    }

    fn create_event(&self, device: DeviceIndex) -> Result<Event> {
        self.check_device(device)?;
        let id = self.next_event.fetch_add(1, Ordering::Relaxed);
        locked(&self.events).insert(id, Arc::new(EventSlot::new()));
        Ok(Event(id))
    }

    fn destroy_event(&self, event: Event) {
        locked(&self.events).remove(&event.0);
    }

    fn record_event(&self, event: Event, stream: Stream) -> Result<()> {
        let slot = self.event_slot(event)?;
        let seq = slot.begin_record();
        self.enqueue(stream, Box::new(move || slot.mark_done(seq)))
    }

    fn stream_wait_event(&self, stream: Stream, event: Event) -> Result<()> {
        let slot = self.event_slot(event)?;
        let target = slot.recorded_seq();
        if target == 0 {
            return Ok(());
        }
        self.enqueue(stream, Box::new(move || slot.block_until(target)))
    }

    fn query_event(&self, event: Event) -> Result<bool> {
        Ok(self.event_slot(event)?.is_complete())
    }

    fn synchronize_device(&self, device: DeviceIndex) -> Result<()> {
        self.check_device(device)?;
        let targets: Vec<(Arc<Progress>, u64)> = {
            let streams = locked(&self.streams);
            streams
                .values()
                .filter(|entry| entry.device == device)
                .map(|entry| (Arc::clone(&entry.progress), entry.progress.submitted()))
                .collect()
        };
        for (progress, target) in targets {
            progress.wait_until_completed(target);
        }
        Ok(())
    }

    fn allocate(&self, device: DeviceIndex, bytes: usize) -> Result<Arc<Storage>> {
        self.check_device(device)?;
        let allocation = HostAllocation::zeroed(bytes)?;
        let ptr = allocation.ptr as u64;
        Ok(Arc::new(Storage::new(
            ptr,
            bytes,
            device,
            Some(Arc::new(allocation)),
        )))
    }

    fn copy_tensor(&self, dst: &DeviceTensor, src: &DeviceTensor, stream: Stream) -> Result<()> {
        if dst.dtype() != src.dtype() {
            return Err(CommError::invalid_argument(format!(
                "copy between {} and {} tensors",
                src.dtype(),
                dst.dtype()
            )));
        }
        if dst.numel() != src.numel() {
            return Err(CommError::invalid_argument(format!(
                "copy between tensors of {} and {} elements",
                src.numel(),
                dst.numel()
            )));
        }
        if !dst.is_contiguous() || !src.is_contiguous() {
            return Err(CommError::invalid_argument(
                "copy requires contiguous tensors",
            ));
        }
        let src_ptr = src.data_ptr();
        let dst_ptr = dst.data_ptr();
        let nbytes = src.nbytes();
        self.enqueue(
            stream,
            Box::new(move || {
                if src_ptr != dst_ptr {
                    // memmove semantics: partial overlap of distinct views is legal.
                    unsafe {
                        std::ptr::copy(src_ptr as *const u8, dst_ptr as *mut u8, nbytes);
                    }
                }
            }),
        )
    }

    fn record_stream(&self, storage: &Storage, stream: Stream) {
        // Host allocations are freed by ownership, not recycled by stream;
        // the hook only needs to exist so the protocol exercises it.
        tracing::trace!(ptr = storage.ptr(), stream = stream.0, "record_stream");
    }

    fn free_mutex(&self) -> &Mutex<()> {
        &self.free_mutex
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    fn tensor_f32(rt: &HostRuntime, device: DeviceIndex, data: &[f32]) -> DeviceTensor {
        let t = DeviceTensor::alloc(rt, device, &[data.len()], DataType::F32).unwrap();
        rt.write_f32(&t, data).unwrap();
        t
    }

    #[test]
    fn test_stream_fifo_ordering() {
        let rt = HostRuntime::new(1).unwrap();
        let a = tensor_f32(&rt, 0, &[1.0, 2.0]);
        let b = tensor_f32(&rt, 0, &[3.0, 4.0]);
        let dst = tensor_f32(&rt, 0, &[0.0, 0.0]);
        let stream = rt.current_stream(0).unwrap();
        rt.copy_tensor(&dst, &a, stream).unwrap();
        rt.copy_tensor(&dst, &b, stream).unwrap();
        rt.synchronize_device(0).unwrap();
        assert_eq!(rt.read_f32(&dst).unwrap(), vec![3.0, 4.0]);
    }

    #[test]
    fn test_event_query_and_record() {
        let rt = HostRuntime::new(1).unwrap();
        let stream = rt.current_stream(0).unwrap();
        let event = rt.create_event(0).unwrap();

        // Never-recorded events are complete.
        assert!(rt.query_event(event).unwrap());

        rt.enqueue(
            stream,
            Box::new(|| thread::sleep(Duration::from_millis(100))),
        )
        .unwrap();
        rt.record_event(event, stream).unwrap();
        assert!(!rt.query_event(event).unwrap());

        rt.synchronize_device(0).unwrap();
        assert!(rt.query_event(event).unwrap());
    }

    #[test]
    fn test_stream_wait_event_orders_across_streams() {
        let rt = HostRuntime::new(1).unwrap();
        let producer = rt.current_stream(0).unwrap();
        let consumer = rt.stream_from_pool(0).unwrap();

        let src = tensor_f32(&rt, 0, &[7.0]);
        let mid = tensor_f32(&rt, 0, &[0.0]);
        let dst = tensor_f32(&rt, 0, &[0.0]);

        rt.enqueue(
            producer,
            Box::new(|| thread::sleep(Duration::from_millis(50))),
        )
        .unwrap();
        rt.copy_tensor(&mid, &src, producer).unwrap();
        let event = rt.create_event(0).unwrap();
        rt.record_event(event, producer).unwrap();

        rt.stream_wait_event(consumer, event).unwrap();
        rt.copy_tensor(&dst, &mid, consumer).unwrap();

        rt.synchronize_device(0).unwrap();
        assert_eq!(rt.read_f32(&dst).unwrap(), vec![7.0]);
    }

    #[test]
    fn test_synchronize_waits_for_pending_work() {
        let rt = HostRuntime::new(1).unwrap();
        let stream = rt.current_stream(0).unwrap();
        let start = Instant::now();
        rt.enqueue(
            stream,
            Box::new(|| thread::sleep(Duration::from_millis(80))),
        )
        .unwrap();
        rt.synchronize_device(0).unwrap();
        assert!(start.elapsed() >= Duration::from_millis(80));
    }

    #[test]
    fn test_allocate_is_zeroed() {
        let rt = HostRuntime::new(2).unwrap();
        let t = DeviceTensor::alloc(&rt, 1, &[16], DataType::U8).unwrap();
        assert_eq!(t.device(), 1);
        assert_eq!(rt.read_bytes(&t).unwrap(), vec![0u8; 16]);
    }

    #[test]
    fn test_device_bounds_checked() {
        let rt = HostRuntime::new(1).unwrap();
        assert!(rt.set_device(1).is_err());
        assert!(rt.current_stream(3).is_err());
        assert!(rt.allocate(2, 8).is_err());
    }
}
