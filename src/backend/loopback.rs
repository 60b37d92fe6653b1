//! In-process backend over host memory.
//!
//! Every rank of a test (or single-machine) cluster shares one
//! [`LoopbackFabric`]; communicators created from the same unique id meet
//! in a rendezvous group. A collective submission enqueues a closure on
//! its stream; the closure deposits this rank's buffers into the current
//! round and parks until all ranks arrive, with the last arrival
//! performing the exchange. That preserves the execution shape the group
//! layer is built around: submission never blocks the caller, completion
//! is observed through stream events, and an abort wakes parked rounds
//! and trips the asynchronous error flag.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::backend::{BackendComm, CollectiveBackend, UNIQUE_ID_BYTES, UniqueId};
use crate::device::{HostRuntime, Stream};
use crate::error::{CommError, Result};
use crate::reduce::reduce_ptr;
use crate::types::{DataType, DeviceIndex, ReduceOp};

const LOOPBACK_VERSION: &str = "loopback";

/// How often a parked participant re-checks the abort flag.
const PARK_POLL: Duration = Duration::from_millis(50);

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpKind {
    AllReduce,
    Broadcast,
    Reduce,
    AllGather,
    ReduceScatter,
}

/// One rank's contribution to a collective round.
#[derive(Debug, Clone, Copy)]
struct Part {
    send: u64,
    recv: u64,
    count: usize,
    dtype: DataType,
    op: ReduceOp,
    root: usize,
}

enum RoundState {
    Pending,
    Done,
    Failed(String),
}

/// Completion cell shared by all participants of one round or transfer.
struct Completion {
    state: Mutex<RoundState>,
    cv: Condvar,
}

impl Completion {
    fn new() -> Self {
        Self {
            state: Mutex::new(RoundState::Pending),
            cv: Condvar::new(),
        }
    }

    fn finish(&self, result: &std::result::Result<(), String>) {
        let mut state = locked(&self.state);
        *state = match result {
            Ok(()) => RoundState::Done,
            Err(msg) => RoundState::Failed(msg.clone()),
        };
        self.cv.notify_all();
    }

    /// Park until the round resolves or the group aborts.
    fn wait(&self, group: &GroupCore) -> std::result::Result<(), String> {
        let mut state = locked(&self.state);
        loop {
            match &*state {
                RoundState::Done => return Ok(()),
                RoundState::Failed(msg) => return Err(msg.clone()),
                RoundState::Pending => {
                    if group.aborted.load(Ordering::SeqCst) {
                        return Err("communicator aborted while a collective was in flight".into());
                    }
                    let (guard, _) = self
                        .cv
                        .wait_timeout(state, PARK_POLL)
                        .unwrap_or_else(PoisonError::into_inner);
                    state = guard;
                }
            }
        }
    }
}

struct Round {
    kind: OpKind,
    parts: Vec<Option<Part>>,
    arrived: usize,
    completion: Arc<Completion>,
}

struct Transfer {
    dtype: DataType,
    src: Option<(u64, usize)>,
    dst: Option<(u64, usize)>,
    completion: Arc<Completion>,
}

#[derive(Default)]
struct GroupOps {
    rounds: HashMap<u64, Round>,
    transfers: HashMap<(usize, usize, u64), Transfer>,
    send_seqs: HashMap<(usize, usize), u64>,
    recv_seqs: HashMap<(usize, usize), u64>,
}

/// Shared rendezvous state for one unique id.
struct GroupCore {
    world_size: usize,
    aborted: AtomicBool,
    fail_msg: Mutex<Option<String>>,
    ops: Mutex<GroupOps>,
}

impl GroupCore {
    fn new(world_size: usize) -> Self {
        Self {
            world_size,
            aborted: AtomicBool::new(false),
            fail_msg: Mutex::new(None),
            ops: Mutex::new(GroupOps::default()),
        }
    }

    fn fail(&self, msg: &str) {
        let mut slot = locked(&self.fail_msg);
        if slot.is_none() {
            *slot = Some(msg.to_string());
        }
        self.aborted.store(true, Ordering::SeqCst);
    }

    fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
    }

    fn error(&self) -> Option<CommError> {
        if let Some(msg) = locked(&self.fail_msg).clone() {
            return Some(CommError::backend(msg, LOOPBACK_VERSION));
        }
        if self.aborted.load(Ordering::SeqCst) {
            return Some(CommError::backend(
                "communicator was aborted",
                LOOPBACK_VERSION,
            ));
        }
        None
    }
}

/// Process-wide registry mapping unique ids to rendezvous groups. Shared
/// by every rank's backend instance, the way all ranks of a machine share
/// one interconnect.
pub struct LoopbackFabric {
    groups: Mutex<HashMap<String, Arc<GroupCore>>>,
    next_id: AtomicU64,
}

impl LoopbackFabric {
    pub fn new() -> Self {
        Self {
            groups: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn group(&self, id: &UniqueId, world_size: usize) -> Result<Arc<GroupCore>> {
        let mut groups = locked(&self.groups);
        let group = groups
            .entry(id.hex())
            .or_insert_with(|| Arc::new(GroupCore::new(world_size)));
        if group.world_size != world_size {
            return Err(CommError::invalid_state(format!(
                "communicator group {:?} created with world size {}, joined with {}",
                id, group.world_size, world_size
            )));
        }
        Ok(Arc::clone(group))
    }
}

impl Default for LoopbackFabric {
    fn default() -> Self {
        Self::new()
    }
}

/// Host-memory implementation of [`CollectiveBackend`].
pub struct LoopbackBackend {
    fabric: Arc<LoopbackFabric>,
    runtime: Arc<HostRuntime>,
}

impl LoopbackBackend {
    pub fn new(fabric: Arc<LoopbackFabric>, runtime: Arc<HostRuntime>) -> Self {
        Self { fabric, runtime }
    }
}

impl CollectiveBackend for LoopbackBackend {
    fn generate_unique_id(&self) -> Result<UniqueId> {
        let n = self.fabric.next_id.fetch_add(1, Ordering::Relaxed);
        let mut raw = [0u8; UNIQUE_ID_BYTES];
        raw[..8].copy_from_slice(&n.to_le_bytes());
        raw[8..16].copy_from_slice(b"loopback");
        Ok(UniqueId::from_raw(raw))
    }

    fn create_comm(
        &self,
        _device: DeviceIndex,
        world_size: usize,
        world_rank: usize,
        id: &UniqueId,
    ) -> Result<Arc<dyn BackendComm>> {
        if world_rank >= world_size {
            return Err(CommError::invalid_argument(format!(
                "world rank {world_rank} out of range for world size {world_size}"
            )));
        }
        let group = self.fabric.group(id, world_size)?;
        Ok(Arc::new(LoopbackComm {
            group,
            rank: world_rank,
            runtime: Arc::clone(&self.runtime),
            seq: AtomicU64::new(0),
            failed: Arc::new(Mutex::new(None)),
        }))
    }

    fn group_start(&self) -> Result<()> {
        // Submissions are already per-operation closures; there is nothing
        // to fuse on the host fabric.
        Ok(())
    }

    fn group_end(&self) -> Result<()> {
        Ok(())
    }

    fn version(&self) -> String {
        LOOPBACK_VERSION.to_string()
    }
}

struct LoopbackComm {
    group: Arc<GroupCore>,
    rank: usize,
    runtime: Arc<HostRuntime>,
    seq: AtomicU64,
    failed: Arc<Mutex<Option<String>>>,
}

fn record_failure(slot: &Mutex<Option<String>>, msg: &str) {
    let mut slot = locked(slot);
    if slot.is_none() {
        *slot = Some(msg.to_string());
    }
}

impl LoopbackComm {
    fn submit_round(&self, kind: OpKind, part: Part, stream: Stream) -> Result<()> {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        let group = Arc::clone(&self.group);
        let failed = Arc::clone(&self.failed);
        let rank = self.rank;
        self.runtime.enqueue(
            stream,
            Box::new(move || {
                if let Err(msg) = run_round(&group, kind, seq, rank, part) {
                    record_failure(&failed, &msg);
                }
            }),
        )
    }

    fn submit_send(
        &self,
        ptr: u64,
        count: usize,
        dtype: DataType,
        peer: usize,
        stream: Stream,
    ) -> Result<()> {
        let group = Arc::clone(&self.group);
        let failed = Arc::clone(&self.failed);
        let rank = self.rank;
        self.runtime.enqueue(
            stream,
            Box::new(move || {
                if let Err(msg) = run_send(&group, rank, peer, ptr, count, dtype) {
                    record_failure(&failed, &msg);
                }
            }),
        )
    }

    fn submit_recv(
        &self,
        ptr: u64,
        count: usize,
        dtype: DataType,
        peer: usize,
        stream: Stream,
    ) -> Result<()> {
        let group = Arc::clone(&self.group);
        let failed = Arc::clone(&self.failed);
        let rank = self.rank;
        self.runtime.enqueue(
            stream,
            Box::new(move || {
                if let Err(msg) = run_recv(&group, peer, rank, ptr, count, dtype) {
                    record_failure(&failed, &msg);
                }
            }),
        )
    }
}

impl BackendComm for LoopbackComm {
    fn all_reduce(
        &self,
        send: u64,
        recv: u64,
        count: usize,
        dtype: DataType,
        op: ReduceOp,
        stream: Stream,
    ) -> Result<()> {
        self.submit_round(
            OpKind::AllReduce,
            Part {
                send,
                recv,
                count,
                dtype,
                op,
                root: 0,
            },
            stream,
        )
    }

    fn broadcast(
        &self,
        ptr: u64,
        count: usize,
        dtype: DataType,
        root: usize,
        stream: Stream,
    ) -> Result<()> {
        self.submit_round(
            OpKind::Broadcast,
            Part {
                send: ptr,
                recv: ptr,
                count,
                dtype,
                op: ReduceOp::Sum,
                root,
            },
            stream,
        )
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
        self.submit_round(
            OpKind::Reduce,
            Part {
                send,
                recv,
                count,
                dtype,
                op,
                root,
            },
            stream,
        )
    }

    fn all_gather(
        &self,
        send: u64,
        recv: u64,
        send_count: usize,
        dtype: DataType,
        stream: Stream,
    ) -> Result<()> {
        self.submit_round(
            OpKind::AllGather,
            Part {
                send,
                recv,
                count: send_count,
                dtype,
                op: ReduceOp::Sum,
                root: 0,
            },
            stream,
        )
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
        self.submit_round(
            OpKind::ReduceScatter,
            Part {
                send,
                recv,
                count: recv_count,
                dtype,
                op,
                root: 0,
            },
            stream,
        )
    }

    fn send(
        &self,
        ptr: u64,
        count: usize,
        dtype: DataType,
        peer: usize,
        stream: Stream,
    ) -> Result<()> {
        self.submit_send(ptr, count, dtype, peer, stream)
    }

    fn recv(
        &self,
        ptr: u64,
        count: usize,
        dtype: DataType,
        peer: usize,
        stream: Stream,
    ) -> Result<()> {
        self.submit_recv(ptr, count, dtype, peer, stream)
    }

    fn check_async_error(&self) -> Option<CommError> {
        if let Some(msg) = locked(&self.failed).clone() {
            return Some(CommError::backend(msg, LOOPBACK_VERSION));
        }
        self.group.error()
    }

    fn abort(&self) {
        self.group.abort();
    }
}

fn run_round(
    group: &GroupCore,
    kind: OpKind,
    seq: u64,
    rank: usize,
    part: Part,
) -> std::result::Result<(), String> {
    if group.aborted.load(Ordering::SeqCst) {
        return Err("communicator was aborted".into());
    }
    let (completion, ready_parts) = {
        let mut ops = locked(&group.ops);
        let round = ops.rounds.entry(seq).or_insert_with(|| Round {
            kind,
            parts: vec![None; group.world_size],
            arrived: 0,
            completion: Arc::new(Completion::new()),
        });
        if round.kind != kind {
            let msg = format!(
                "mismatched collective at sequence {seq}: {:?} joined a {:?} round",
                kind, round.kind
            );
            group.fail(&msg);
            round.completion.finish(&Err(msg.clone()));
            return Err(msg);
        }
        if round.parts[rank].is_some() {
            let msg = format!("rank {rank} arrived twice at sequence {seq}");
            group.fail(&msg);
            round.completion.finish(&Err(msg.clone()));
            return Err(msg);
        }
        round.parts[rank] = Some(part);
        round.arrived += 1;
        let completion = Arc::clone(&round.completion);
        if round.arrived == group.world_size {
            let parts = ops.rounds.remove(&seq).map(|r| r.parts);
            (completion, parts)
        } else {
            (completion, None)
        }
    };
    match ready_parts {
        Some(parts) => {
            let result = execute_round(kind, parts, group.world_size);
            if let Err(msg) = &result {
                group.fail(msg);
            }
            completion.finish(&result);
            result
        }
        None => completion.wait(group),
    }
}

/// memmove between device addresses; a self-copy is a no-op.
unsafe fn copy_device(dst: u64, src: u64, bytes: usize) {
    if dst != src {
        unsafe { std::ptr::copy(src as *const u8, dst as *mut u8, bytes) };
    }
}

fn execute_round(
    kind: OpKind,
    parts: Vec<Option<Part>>,
    world_size: usize,
) -> std::result::Result<(), String> {
    let parts: Vec<Part> = parts.into_iter().flatten().collect();
    if parts.len() != world_size {
        return Err("incomplete rendezvous round".into());
    }
    let first = parts[0];
    for p in &parts {
        if p.count != first.count || p.dtype != first.dtype {
            return Err(format!(
                "mismatched operands: {} x {} vs {} x {}",
                p.count, p.dtype, first.count, first.dtype
            ));
        }
        if p.op != first.op || p.root != first.root {
            return Err("mismatched reduction op or root across ranks".into());
        }
    }
    let count = first.count;
    let dtype = first.dtype;
    let elem = dtype.size_in_bytes();
    let bytes = count * elem;

    let reduce_into = |tmp: &mut Vec<u8>,
                       chunk_offset: usize|
     -> std::result::Result<(), String> {
        unsafe {
            copy_device(
                tmp.as_mut_ptr() as u64,
                parts[0].send + (chunk_offset * elem) as u64,
                tmp.len(),
            );
        }
        for p in &parts[1..] {
            unsafe {
                reduce_ptr(
                    tmp.as_mut_ptr() as u64,
                    p.send + (chunk_offset * elem) as u64,
                    tmp.len() / elem,
                    dtype,
                    first.op,
                )
            }
            .map_err(|e| e.to_string())?;
        }
        Ok(())
    };

    match kind {
        OpKind::AllReduce => {
            let mut tmp = vec![0u8; bytes];
            reduce_into(&mut tmp, 0)?;
            for p in &parts {
                unsafe { copy_device(p.recv, tmp.as_ptr() as u64, bytes) };
            }
        }
        OpKind::Broadcast => {
            if first.root >= world_size {
                return Err(format!("broadcast root {} out of range", first.root));
            }
            let root_ptr = parts[first.root].send;
            for p in &parts {
                unsafe { copy_device(p.recv, root_ptr, bytes) };
            }
        }
        OpKind::Reduce => {
            if first.root >= world_size {
                return Err(format!("reduce root {} out of range", first.root));
            }
            let mut tmp = vec![0u8; bytes];
            reduce_into(&mut tmp, 0)?;
            unsafe { copy_device(parts[first.root].recv, tmp.as_ptr() as u64, bytes) };
        }
        OpKind::AllGather => {
            for (r, src) in parts.iter().enumerate() {
                for p in &parts {
                    unsafe { copy_device(p.recv + (r * bytes) as u64, src.send, bytes) };
                }
            }
        }
        OpKind::ReduceScatter => {
            let mut tmp = vec![0u8; bytes];
            for (r, p) in parts.iter().enumerate() {
                reduce_into(&mut tmp, r * count)?;
                unsafe { copy_device(p.recv, tmp.as_ptr() as u64, bytes) };
            }
        }
    }
    Ok(())
}

fn run_send(
    group: &GroupCore,
    src_rank: usize,
    dst_rank: usize,
    ptr: u64,
    count: usize,
    dtype: DataType,
) -> std::result::Result<(), String> {
    if group.aborted.load(Ordering::SeqCst) {
        return Err("communicator was aborted".into());
    }
    let ready = {
        let mut ops = locked(&group.ops);
        let seq = ops.send_seqs.entry((src_rank, dst_rank)).or_insert(0);
        let k = *seq;
        *seq += 1;
        let transfer = ops
            .transfers
            .entry((src_rank, dst_rank, k))
            .or_insert_with(|| Transfer {
                dtype,
                src: None,
                dst: None,
                completion: Arc::new(Completion::new()),
            });
        transfer.src = Some((ptr, count));
        if transfer.dst.is_some() {
            ops.transfers.remove(&(src_rank, dst_rank, k))
        } else {
            None
        }
    };
    match ready {
        // The sender completes the pair only when the receiver was already
        // parked; otherwise it returns immediately (the receiver copies).
        Some(transfer) => finish_transfer(transfer),
        None => Ok(()),
    }
}

fn run_recv(
    group: &GroupCore,
    src_rank: usize,
    dst_rank: usize,
    ptr: u64,
    count: usize,
    dtype: DataType,
) -> std::result::Result<(), String> {
    if group.aborted.load(Ordering::SeqCst) {
        return Err("communicator was aborted".into());
    }
    let (ready, completion) = {
        let mut ops = locked(&group.ops);
        let seq = ops.recv_seqs.entry((src_rank, dst_rank)).or_insert(0);
        let k = *seq;
        *seq += 1;
        let transfer = ops
            .transfers
            .entry((src_rank, dst_rank, k))
            .or_insert_with(|| Transfer {
                dtype,
                src: None,
                dst: None,
                completion: Arc::new(Completion::new()),
            });
        transfer.dst = Some((ptr, count));
        let completion = Arc::clone(&transfer.completion);
        if transfer.src.is_some() {
            (ops.transfers.remove(&(src_rank, dst_rank, k)), completion)
        } else {
            (None, completion)
        }
    };
    match ready {
        Some(transfer) => finish_transfer(transfer),
        None => completion.wait(group),
    }
}

fn finish_transfer(transfer: Transfer) -> std::result::Result<(), String> {
    let result = (|| {
        let (src, src_count) = transfer.src.ok_or("transfer missing sender")?;
        let (dst, dst_count) = transfer.dst.ok_or("transfer missing receiver")?;
        if src_count != dst_count {
            return Err(format!(
                "send of {src_count} elements paired with recv of {dst_count}"
            ));
        }
        unsafe { copy_device(dst, src, src_count * transfer.dtype.size_in_bytes()) };
        Ok(())
    })();
    transfer.completion.finish(&result);
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceRuntime;
    use crate::tensor::DeviceTensor;

    fn setup(devices: usize) -> (Arc<HostRuntime>, LoopbackBackend) {
        let runtime = Arc::new(HostRuntime::new(devices).unwrap());
        let fabric = Arc::new(LoopbackFabric::new());
        let backend = LoopbackBackend::new(fabric, Arc::clone(&runtime));
        (runtime, backend)
    }

    #[test]
    fn test_single_rank_allreduce_runs_inline() {
        let (runtime, backend) = setup(1);
        let id = backend.generate_unique_id().unwrap();
        let comm = backend.create_comm(0, 1, 0, &id).unwrap();

        let t = DeviceTensor::alloc(runtime.as_ref(), 0, &[4], DataType::F32).unwrap();
        runtime.write_f32(&t, &[1.0, 2.0, 3.0, 4.0]).unwrap();
        let stream = runtime.current_stream(0).unwrap();
        comm.all_reduce(
            t.data_ptr(),
            t.data_ptr(),
            4,
            DataType::F32,
            ReduceOp::Sum,
            stream,
        )
        .unwrap();
        runtime.synchronize_device(0).unwrap();
        assert_eq!(runtime.read_f32(&t).unwrap(), vec![1.0, 2.0, 3.0, 4.0]);
        assert!(comm.check_async_error().is_none());
    }

    #[test]
    fn test_abort_trips_async_error() {
        let (_runtime, backend) = setup(1);
        let id = backend.generate_unique_id().unwrap();
        let comm = backend.create_comm(0, 2, 0, &id).unwrap();
        assert!(comm.check_async_error().is_none());
        comm.abort();
        assert!(comm.check_async_error().is_some());
    }

    #[test]
    fn test_mismatched_world_size_rejected() {
        let (_runtime, backend) = setup(1);
        let id = backend.generate_unique_id().unwrap();
        backend.create_comm(0, 2, 0, &id).unwrap();
        assert!(matches!(
            backend.create_comm(0, 3, 1, &id),
            Err(CommError::InvalidState(_))
        ));
    }

    #[test]
    fn test_mismatched_collective_kind_fails_group() {
        let (runtime, backend) = setup(2);
        let id = backend.generate_unique_id().unwrap();
        let c0 = backend.create_comm(0, 2, 0, &id).unwrap();
        let c1 = backend.create_comm(1, 2, 1, &id).unwrap();

        let t0 = DeviceTensor::alloc(runtime.as_ref(), 0, &[2], DataType::F32).unwrap();
        let t1 = DeviceTensor::alloc(runtime.as_ref(), 1, &[2], DataType::F32).unwrap();
        let s0 = runtime.current_stream(0).unwrap();
        let s1 = runtime.current_stream(1).unwrap();

        c0.all_reduce(
            t0.data_ptr(),
            t0.data_ptr(),
            2,
            DataType::F32,
            ReduceOp::Sum,
            s0,
        )
        .unwrap();
        c1.broadcast(t1.data_ptr(), 2, DataType::F32, 0, s1).unwrap();

        runtime.synchronize_device(0).unwrap();
        runtime.synchronize_device(1).unwrap();
        assert!(c0.check_async_error().is_some() || c1.check_async_error().is_some());
    }

    #[test]
    fn test_unique_ids_are_distinct() {
        let (_runtime, backend) = setup(1);
        let a = backend.generate_unique_id().unwrap();
        let b = backend.generate_unique_id().unwrap();
        assert_ne!(a.hex(), b.hex());
    }
}
