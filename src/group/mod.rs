//! The process group: keyed communicator caching with store rendezvous,
//! the stream/event synchronization protocol, collective dispatch, and
//! the abort watchdog.

pub(crate) mod comm;
mod flatten;
mod options;
mod validate;
pub(crate) mod watchdog;
mod work;

pub use options::{
    AllToAllOptions, AllgatherOptions, AllreduceOptions, BarrierOptions, BroadcastOptions,
    ReduceOptions, ReduceScatterOptions,
};
pub use work::WorkHandle;

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;

use crate::backend::{BackendComm, CollectiveBackend, UNIQUE_ID_BYTES, UniqueId};
use crate::config::GroupConfig;
use crate::device::{DeviceRuntime, Event, Stream};
use crate::error::{CommError, Result};
use crate::store::Store;
use crate::tensor::DeviceTensor;
use crate::types::{DataType, DeviceIndex, Rank};

use comm::{CommBundle, CommHandle, device_key, device_list};
use flatten::flatten_for_scatter_gather;
use validate::{check_device_tensors, check_device_tensors_multi, check_split_sizes};
use watchdog::WatchdogControl;

/// Mutable caches of a process group, all behind one mutex.
///
/// Every device-set key present in `dev_comms` is also present in
/// `streams` and `events` with vectors of the same length and device
/// order, and every cached communicator is reachable through `id_comms`
/// by its id string. Entries are never evicted, even after abort.
pub(crate) struct GroupState {
    pub(crate) dev_comms: HashMap<String, CommBundle>,
    pub(crate) id_comms: HashMap<String, CommBundle>,
    pub(crate) streams: HashMap<String, Vec<Stream>>,
    pub(crate) events: HashMap<String, Vec<Event>>,
    pub(crate) used_devices: BTreeSet<DeviceIndex>,
    pub(crate) aborted_comms: HashSet<String>,
    pub(crate) comm_counter: u64,
}

impl GroupState {
    fn new() -> Self {
        Self {
            dev_comms: HashMap::new(),
            id_comms: HashMap::new(),
            streams: HashMap::new(),
            events: HashMap::new(),
            used_devices: BTreeSet::new(),
            aborted_comms: HashSet::new(),
            comm_counter: 0,
        }
    }
}

/// State shared between the caller-facing group and its watchdog thread.
pub(crate) struct GroupShared {
    pub(crate) rank: Rank,
    pub(crate) size: usize,
    pub(crate) backend: Arc<dyn CollectiveBackend>,
    pub(crate) runtime: Arc<dyn DeviceRuntime>,
    pub(crate) store: Arc<dyn Store>,
    pub(crate) config: GroupConfig,
    pub(crate) state: Mutex<GroupState>,
    pub(crate) watchdog: WatchdogControl,
}

impl GroupShared {
    fn lock_state(&self) -> MutexGuard<'_, GroupState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Scoped pairing of the caching allocator's free mutex with a backend
/// group window. Teardown closes the window first, then releases the
/// mutex: the window close synchronizes with launch bookkeeping that the
/// allocator must not race.
struct GroupGuard<'a> {
    backend: &'a dyn CollectiveBackend,
    _free: MutexGuard<'a, ()>,
}

impl<'a> GroupGuard<'a> {
    fn new(backend: &'a dyn CollectiveBackend, runtime: &'a dyn DeviceRuntime) -> Result<Self> {
        let free = runtime
            .free_mutex()
            .lock()
            .map_err(|_| CommError::invalid_state("allocator free mutex poisoned"))?;
        backend.group_start()?;
        Ok(Self {
            backend,
            _free: free,
        })
    }
}

impl Drop for GroupGuard<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.backend.group_end() {
            tracing::error!(error = %err, "failed to close backend group window");
        }
        // `_free` unlocks after this body, i.e. after the window closed.
    }
}

/// A GPU collective process group.
///
/// One instance per participating process; all instances share a
/// rendezvous [`Store`]. Collectives return a [`WorkHandle`] tracking
/// asynchronous completion per device.
pub struct ProcessGroup {
    shared: Arc<GroupShared>,
    watchdog_thread: Option<thread::JoinHandle<()>>,
}

impl ProcessGroup {
    /// Create a process group, reading blocking-wait mode from the
    /// environment (`NCCL_BLOCKING_WAIT`).
    pub fn new(
        store: Arc<dyn Store>,
        rank: Rank,
        size: usize,
        backend: Arc<dyn CollectiveBackend>,
        runtime: Arc<dyn DeviceRuntime>,
    ) -> Result<Self> {
        Self::with_config(store, rank, size, backend, runtime, GroupConfig::from_env()?)
    }

    /// Create a process group with an explicit configuration.
    pub fn with_config(
        store: Arc<dyn Store>,
        rank: Rank,
        size: usize,
        backend: Arc<dyn CollectiveBackend>,
        runtime: Arc<dyn DeviceRuntime>,
        config: GroupConfig,
    ) -> Result<Self> {
        if size == 0 {
            return Err(CommError::invalid_argument("group size must be positive"));
        }
        if rank >= size {
            return Err(CommError::invalid_argument(format!(
                "rank {rank} out of range for group of size {size}"
            )));
        }
        let shared = Arc::new(GroupShared {
            rank,
            size,
            backend,
            runtime,
            store,
            config,
            state: Mutex::new(GroupState::new()),
            watchdog: WatchdogControl::new(),
        });
        let watchdog_shared = Arc::clone(&shared);
        let watchdog_thread = thread::Builder::new()
            .name("commgroup-watchdog".to_string())
            .spawn(move || watchdog::run(&watchdog_shared))
            .map_err(|e| CommError::invalid_state(format!("failed to spawn watchdog: {e}")))?;
        Ok(Self {
            shared,
            watchdog_thread: Some(watchdog_thread),
        })
    }

    pub fn rank(&self) -> Rank {
        self.shared.rank
    }

    pub fn size(&self) -> usize {
        self.shared.size
    }

    /// Publish the unique id for `store_key`: rank 0 writes the bytes,
    /// everyone else block-reads them.
    fn broadcast_unique_id(&self, store_key: &str, id: Option<UniqueId>) -> Result<UniqueId> {
        match id {
            Some(id) => {
                self.shared.store.set(store_key, id.as_bytes())?;
                Ok(id)
            }
            None => {
                let bytes = self.shared.store.get(store_key)?;
                if bytes.len() != UNIQUE_ID_BYTES {
                    return Err(CommError::invalid_state(format!(
                        "store returned a unique id of {} bytes, expected {UNIQUE_ID_BYTES}",
                        bytes.len()
                    )));
                }
                UniqueId::from_bytes(&bytes)
            }
        }
    }

    /// Look up or create the communicator bundle for a device-set key.
    ///
    /// Creation rendezvouses through the store under a monotonically
    /// increasing counter key, so independent bundles of the same group
    /// land on distinct store slots. Each device joins the backend group
    /// as world rank `rank * num_devices + i` of `size * num_devices`.
    fn get_comm(&self, key: &str, devices: &[DeviceIndex]) -> Result<CommBundle> {
        if key.is_empty() {
            return Err(CommError::invalid_argument(
                "cannot create communicators: the device set is unknown",
            ));
        }

        {
            let mut state = self.shared.lock_state();
            for device in devices {
                state.used_devices.insert(*device);
            }
            if let Some(bundle) = state.dev_comms.get(key) {
                return Ok(bundle.clone());
            }
        }

        let store_key = {
            let mut state = self.shared.lock_state();
            let counter = state.comm_counter;
            state.comm_counter += 1;
            counter.to_string()
        };

        let generated = if self.shared.rank == 0 {
            Some(self.shared.backend.generate_unique_id()?)
        } else {
            None
        };
        let id = self.broadcast_unique_id(&store_key, generated)?;

        let num_devices = devices.len();
        let backend = self.shared.backend.as_ref();
        let runtime = self.shared.runtime.as_ref();

        backend.group_start()?;
        let created = (|| -> Result<(CommBundle, Vec<Stream>)> {
            let mut bundle = Vec::with_capacity(num_devices);
            let mut streams = Vec::with_capacity(num_devices);
            for (i, device) in devices.iter().enumerate() {
                runtime.set_device(*device)?;
                let world_size = self.shared.size * num_devices;
                let world_rank = self.shared.rank * num_devices + i;
                let raw = backend.create_comm(*device, world_size, world_rank, &id)?;
                bundle.push(Arc::new(CommHandle::new(raw, id.clone())));
                streams.push(runtime.stream_from_pool(*device)?);
            }
            Ok((bundle, streams))
        })();
        let window_closed = backend.group_end();
        let (bundle, streams) = created?;
        window_closed?;

        let events = devices
            .iter()
            .map(|device| runtime.create_event(*device))
            .collect::<Result<Vec<_>>>()?;

        let mut state = self.shared.lock_state();
        state.id_comms.insert(id.hex(), bundle.clone());
        state.streams.insert(key.to_string(), streams);
        state.events.insert(key.to_string(), events);
        state.dev_comms.insert(key.to_string(), bundle.clone());
        tracing::debug!(
            rank = self.shared.rank,
            device_set = %key,
            id = %id.hex(),
            "created communicator bundle"
        );
        Ok(bundle)
    }

    fn cached_streams_events(&self, key: &str) -> Result<(Vec<Stream>, Vec<Event>)> {
        let state = self.shared.lock_state();
        let streams = state
            .streams
            .get(key)
            .cloned()
            .ok_or_else(|| CommError::invalid_state(format!("no streams cached for {key}")))?;
        let events = state
            .events
            .get(key)
            .cloned()
            .ok_or_else(|| CommError::invalid_state(format!("no events cached for {key}")))?;
        Ok((streams, events))
    }

    /// Make every collective stream wait for the producer (current) stream
    /// of its device, so backend kernels cannot overtake pending writes to
    /// their operands.
    fn sync_streams(
        &self,
        devices: &[DeviceIndex],
        events: &[Event],
        streams: &[Stream],
    ) -> Result<()> {
        let runtime = self.shared.runtime.as_ref();
        for i in 0..devices.len() {
            let current = runtime.current_stream(devices[i])?;
            runtime.record_event(events[i], current)?;
            runtime.stream_wait_event(streams[i], events[i])?;
        }
        Ok(())
    }

    fn make_work(
        &self,
        devices: Vec<DeviceIndex>,
        streams: &[Stream],
        bundle: CommBundle,
    ) -> Result<WorkHandle> {
        let runtime = self.shared.runtime.as_ref();
        let mut events = Vec::with_capacity(devices.len());
        for (i, device) in devices.iter().enumerate() {
            let event = runtime.create_event(*device)?;
            runtime.record_event(event, streams[i])?;
            events.push(event);
        }
        Ok(WorkHandle::new(
            devices,
            events,
            bundle,
            Arc::clone(&self.shared.runtime),
            Arc::clone(&self.shared.store),
            self.shared.config.blocking_wait,
            self.shared.config.op_timeout,
            self.shared.config.busy_poll,
        ))
    }

    /// Dispatch skeleton shared by every dense collective: communicator
    /// lookup, stream synchronization, storage pinning, group-windowed
    /// submission, and completion-event recording. `pre`/`post` run on the
    /// collective streams so scatter/gather copies interleave with the
    /// kernel without extra synchronization.
    fn collective<F, Pre, Post>(
        &self,
        inputs: &[DeviceTensor],
        outputs: &[DeviceTensor],
        mut submit: F,
        pre: Pre,
        post: Post,
    ) -> Result<WorkHandle>
    where
        F: FnMut(&DeviceTensor, &DeviceTensor, &dyn BackendComm, Stream) -> Result<()>,
        Pre: FnOnce(&[Stream]) -> Result<()>,
        Post: FnOnce(&[Stream]) -> Result<()>,
    {
        let devices = device_list(inputs);
        let key = device_key(&devices);
        let bundle = self.get_comm(&key, &devices)?;
        let (streams, sync_events) = self.cached_streams_events(&key)?;
        self.sync_streams(&devices, &sync_events, &streams)?;

        let runtime = self.shared.runtime.as_ref();

        pre(&streams)?;

        // Inputs are recorded here; operations whose outputs differ record
        // them inside `submit`.
        for (i, input) in inputs.iter().enumerate() {
            runtime.set_device(devices[i])?;
            runtime.record_stream(input.storage(), streams[i]);
        }

        {
            let _guard = GroupGuard::new(self.shared.backend.as_ref(), runtime)?;
            for i in 0..inputs.len() {
                runtime.set_device(devices[i])?;
                submit(&inputs[i], &outputs[i], bundle[i].raw(), streams[i])?;
            }
        }

        post(&streams)?;

        self.make_work(devices, &streams, bundle)
    }

    /// Batched point-to-point skeleton used by the all-to-all family:
    /// per-peer send/recv pairs fused in a single group window on the
    /// first device's collective stream and communicator.
    #[allow(clippy::too_many_arguments)]
    fn batched_p2p(
        &self,
        send_ptrs: &[u64],
        send_counts: &[usize],
        recv_ptrs: &[u64],
        recv_counts: &[usize],
        dtype: DataType,
        inputs: &[DeviceTensor],
        outputs: &[DeviceTensor],
    ) -> Result<WorkHandle> {
        let devices = device_list(inputs);
        let key = device_key(&devices);
        let bundle = self.get_comm(&key, &devices)?;
        let (streams, sync_events) = self.cached_streams_events(&key)?;
        self.sync_streams(&devices, &sync_events, &streams)?;

        let runtime = self.shared.runtime.as_ref();
        for (i, input) in inputs.iter().enumerate() {
            runtime.set_device(devices[i])?;
            runtime.record_stream(input.storage(), streams[i]);
        }
        for (i, output) in outputs.iter().enumerate() {
            runtime.set_device(devices[i])?;
            runtime.record_stream(output.storage(), streams[i]);
        }

        {
            let _guard = GroupGuard::new(self.shared.backend.as_ref(), runtime)?;
            let comm = bundle[0].raw();
            let stream = streams[0];
            runtime.set_device(devices[0])?;
            for peer in 0..self.shared.size {
                comm.send(send_ptrs[peer], send_counts[peer], dtype, peer, stream)?;
                comm.recv(recv_ptrs[peer], recv_counts[peer], dtype, peer, stream)?;
            }
        }

        self.make_work(devices, &streams, bundle)
    }

    /// In-place all-reduce over one tensor per local device.
    pub fn allreduce(
        &self,
        tensors: &[DeviceTensor],
        opts: &AllreduceOptions,
    ) -> Result<WorkHandle> {
        check_device_tensors(tensors, self.shared.runtime.device_count())?;
        let op = opts.reduce_op;
        self.collective(
            tensors,
            tensors,
            |input, output, comm, stream| {
                comm.all_reduce(
                    input.data_ptr(),
                    output.data_ptr(),
                    input.numel(),
                    input.dtype(),
                    op,
                    stream,
                )
            },
            |_| Ok(()),
            |_| Ok(()),
        )
    }

    /// In-place broadcast from `root_rank`'s `root_tensor`.
    pub fn broadcast(
        &self,
        tensors: &[DeviceTensor],
        opts: &BroadcastOptions,
    ) -> Result<WorkHandle> {
        check_device_tensors(tensors, self.shared.runtime.device_count())?;
        let root = opts.root_rank * tensors.len() + opts.root_tensor;
        self.collective(
            tensors,
            tensors,
            |input, _output, comm, stream| {
                comm.broadcast(input.data_ptr(), input.numel(), input.dtype(), root, stream)
            },
            |_| Ok(()),
            |_| Ok(()),
        )
    }

    /// In-place reduce onto `root_rank`'s `root_tensor`.
    pub fn reduce(&self, tensors: &[DeviceTensor], opts: &ReduceOptions) -> Result<WorkHandle> {
        check_device_tensors(tensors, self.shared.runtime.device_count())?;
        let root = opts.root_rank * tensors.len() + opts.root_tensor;
        let op = opts.reduce_op;
        self.collective(
            tensors,
            tensors,
            |input, output, comm, stream| {
                comm.reduce(
                    input.data_ptr(),
                    output.data_ptr(),
                    input.numel(),
                    input.dtype(),
                    op,
                    root,
                    stream,
                )
            },
            |_| Ok(()),
            |_| Ok(()),
        )
    }

    /// Gather every rank's input into `output_lists` (one list per local
    /// device, one entry per participant, ordered by backend world rank).
    pub fn allgather(
        &self,
        output_lists: &[Vec<DeviceTensor>],
        inputs: &[DeviceTensor],
        opts: &AllgatherOptions,
    ) -> Result<WorkHandle> {
        check_device_tensors(inputs, self.shared.runtime.device_count())?;
        let flattened = flatten_for_scatter_gather(
            self.shared.runtime.as_ref(),
            output_lists,
            inputs,
            self.shared.size,
            self.shared.rank,
            opts.no_copy,
        )?;
        check_device_tensors(&flattened, self.shared.runtime.device_count())?;

        let runtime = self.shared.runtime.as_ref();
        self.collective(
            inputs,
            &flattened,
            |input, output, comm, stream| {
                runtime.record_stream(output.storage(), stream);
                comm.all_gather(
                    input.data_ptr(),
                    output.data_ptr(),
                    input.numel(),
                    input.dtype(),
                    stream,
                )
            },
            |_| Ok(()),
            |streams| {
                // Unflatten on the collective streams. Entries that already
                // alias their slot of the flat buffer need no copy.
                for (i, list) in output_lists.iter().enumerate() {
                    for (j, output) in list.iter().enumerate() {
                        let numel = output.numel();
                        let chunk = flattened[i].element_slice(j * numel, numel)?;
                        if chunk.same_storage(output)
                            && output.storage_offset()
                                == list[0].storage_offset() + j * numel
                        {
                            continue;
                        }
                        runtime.record_stream(output.storage(), streams[i]);
                        runtime.copy_tensor(output, &chunk, streams[i])?;
                    }
                }
                Ok(())
            },
        )
    }

    /// Reduce `input_lists` across all participants and scatter chunk `r`
    /// of the result to world rank `r`'s output tensor.
    pub fn reduce_scatter(
        &self,
        outputs: &[DeviceTensor],
        input_lists: &[Vec<DeviceTensor>],
        opts: &ReduceScatterOptions,
    ) -> Result<WorkHandle> {
        check_device_tensors(outputs, self.shared.runtime.device_count())?;
        let flattened = flatten_for_scatter_gather(
            self.shared.runtime.as_ref(),
            input_lists,
            outputs,
            self.shared.size,
            self.shared.rank,
            opts.no_copy,
        )?;
        check_device_tensors(&flattened, self.shared.runtime.device_count())?;

        let runtime = self.shared.runtime.as_ref();
        let op = opts.reduce_op;
        self.collective(
            &flattened,
            outputs,
            |input, output, comm, stream| {
                runtime.record_stream(output.storage(), stream);
                comm.reduce_scatter(
                    input.data_ptr(),
                    output.data_ptr(),
                    output.numel(),
                    input.dtype(),
                    op,
                    stream,
                )
            },
            |streams| {
                // Flatten on the collective streams; aliased entries are
                // already in place.
                for (i, list) in input_lists.iter().enumerate() {
                    for (j, input) in list.iter().enumerate() {
                        let numel = input.numel();
                        let chunk = flattened[i].element_slice(j * numel, numel)?;
                        if chunk.same_storage(input)
                            && input.storage_offset()
                                == list[0].storage_offset() + j * numel
                        {
                            continue;
                        }
                        runtime.record_stream(input.storage(), streams[i]);
                        runtime.copy_tensor(&chunk, input, streams[i])?;
                    }
                }
                Ok(())
            },
            |_| Ok(()),
        )
    }

    /// All-to-all over a single flat tensor per rank, with optional
    /// per-peer split sizes counting rows of the first dimension. Empty
    /// splits divide the tensor evenly across the group.
    pub fn alltoall_base(
        &self,
        output: &DeviceTensor,
        input: &DeviceTensor,
        output_split_sizes: &[usize],
        input_split_sizes: &[usize],
        _opts: &AllToAllOptions,
    ) -> Result<WorkHandle> {
        let inputs = std::slice::from_ref(input);
        let outputs = std::slice::from_ref(output);
        check_device_tensors(inputs, self.shared.runtime.device_count())?;
        check_device_tensors(outputs, self.shared.runtime.device_count())?;

        let size = self.shared.size;
        let elem = input.dtype().size_in_bytes();
        let mut send_counts = vec![0usize; size];
        let mut recv_counts = vec![0usize; size];
        let mut send_ptrs = vec![0u64; size];
        let mut recv_ptrs = vec![0u64; size];

        if output_split_sizes.is_empty() && input_split_sizes.is_empty() {
            if output.numel() != input.numel() || output.dtype() != input.dtype() {
                return Err(CommError::invalid_argument(
                    "input and output tensors are not equal in size or data type",
                ));
            }
            if output.size0() % size != 0 {
                return Err(CommError::invalid_argument(format!(
                    "tensor's first dimension ({}) does not divide evenly across \
                     group size {size}",
                    output.size0()
                )));
            }
            let len = input.numel() / size;
            for peer in 0..size {
                send_counts[peer] = len;
                recv_counts[peer] = len;
                send_ptrs[peer] = input.data_ptr() + (elem * len * peer) as u64;
                recv_ptrs[peer] = output.data_ptr() + (elem * len * peer) as u64;
            }
        } else {
            check_split_sizes(input_split_sizes, input, size)?;
            check_split_sizes(output_split_sizes, output, size)?;

            let row_size = if input.size0() == 0 {
                0
            } else {
                input.numel() / input.size0()
            };
            let mut input_offset = 0usize;
            let mut output_offset = 0usize;
            for peer in 0..size {
                send_counts[peer] = row_size * input_split_sizes[peer];
                recv_counts[peer] = row_size * output_split_sizes[peer];
                send_ptrs[peer] = input.data_ptr() + (input_offset * elem) as u64;
                recv_ptrs[peer] = output.data_ptr() + (output_offset * elem) as u64;
                input_offset += send_counts[peer];
                output_offset += recv_counts[peer];
            }
        }

        self.batched_p2p(
            &send_ptrs,
            &send_counts,
            &recv_ptrs,
            &recv_counts,
            input.dtype(),
            inputs,
            outputs,
        )
    }

    /// All-to-all over one tensor per peer. Tensor `i` of `inputs` goes to
    /// rank `i`; tensor `i` of `outputs` receives from rank `i`.
    pub fn alltoall(
        &self,
        outputs: &[DeviceTensor],
        inputs: &[DeviceTensor],
        _opts: &AllToAllOptions,
    ) -> Result<WorkHandle> {
        let size = self.shared.size;
        if inputs.len() != size || outputs.len() != size {
            return Err(CommError::invalid_argument(format!(
                "all-to-all takes one tensor per rank ({} given, group size {size})",
                inputs.len()
            )));
        }
        let device_count = self.shared.runtime.device_count();
        check_device_tensors_multi(inputs, device_count, true)?;
        check_device_tensors_multi(outputs, device_count, true)?;

        let send_counts: Vec<usize> = inputs.iter().map(DeviceTensor::numel).collect();
        let recv_counts: Vec<usize> = outputs.iter().map(DeviceTensor::numel).collect();
        let send_ptrs: Vec<u64> = inputs.iter().map(DeviceTensor::data_ptr).collect();
        let recv_ptrs: Vec<u64> = outputs.iter().map(DeviceTensor::data_ptr).collect();

        self.batched_p2p(
            &send_ptrs,
            &send_counts,
            &recv_ptrs,
            &recv_counts,
            inputs[0].dtype(),
            &inputs[..1],
            &outputs[..1],
        )
    }

    /// Synthesize a barrier from a one-byte all-reduce across every device
    /// this group has touched (or `rank % device_count` before the first
    /// collective). The returned handle owns the scratch tensors, so its
    /// `synchronize` drains the devices rather than just the streams.
    pub fn barrier(&self, _opts: &BarrierOptions) -> Result<WorkHandle> {
        let devices: Vec<DeviceIndex> = {
            let state = self.shared.lock_state();
            if state.used_devices.is_empty() {
                let device_count = self.shared.runtime.device_count();
                if device_count == 0 {
                    return Err(CommError::invalid_state(
                        "cannot run a barrier without any devices",
                    ));
                }
                vec![self.shared.rank % device_count]
            } else {
                state.used_devices.iter().copied().collect()
            }
        };

        let runtime = self.shared.runtime.as_ref();
        let mut barrier_tensors = Vec::with_capacity(devices.len());
        for device in &devices {
            runtime.set_device(*device)?;
            barrier_tensors.push(DeviceTensor::alloc(runtime, *device, &[1], DataType::U8)?);
        }

        let mut work = self.allreduce(&barrier_tensors, &AllreduceOptions::default())?;
        work.barrier_tensors = barrier_tensors;
        Ok(work)
    }

    pub fn allreduce_coalesced(
        &self,
        _tensors: &[DeviceTensor],
        _opts: &AllreduceOptions,
    ) -> Result<WorkHandle> {
        Err(CommError::unsupported(
            "allreduce_coalesced is not supported by this process group",
        ))
    }

    pub fn allgather_coalesced(
        &self,
        _output_lists: &[Vec<DeviceTensor>],
        _inputs: &[DeviceTensor],
        _opts: &AllgatherOptions,
    ) -> Result<WorkHandle> {
        Err(CommError::unsupported(
            "allgather_coalesced is not supported by this process group",
        ))
    }

    pub fn allgather_base(
        &self,
        _output: &DeviceTensor,
        _input: &DeviceTensor,
        _opts: &AllgatherOptions,
    ) -> Result<WorkHandle> {
        Err(CommError::unsupported(
            "allgather_base is not supported by this process group",
        ))
    }

    pub fn gather(
        &self,
        _output_lists: &[Vec<DeviceTensor>],
        _inputs: &[DeviceTensor],
        _root_rank: Rank,
    ) -> Result<WorkHandle> {
        Err(CommError::unsupported(
            "gather is not supported by this process group",
        ))
    }

    pub fn scatter(
        &self,
        _outputs: &[DeviceTensor],
        _input_lists: &[Vec<DeviceTensor>],
        _root_rank: Rank,
    ) -> Result<WorkHandle> {
        Err(CommError::unsupported(
            "scatter is not supported by this process group",
        ))
    }

    pub fn send(&self, _tensors: &[DeviceTensor], _dst: Rank, _tag: usize) -> Result<WorkHandle> {
        Err(CommError::unsupported(
            "send is not supported by this process group",
        ))
    }

    pub fn recv(&self, _tensors: &[DeviceTensor], _src: Rank, _tag: usize) -> Result<WorkHandle> {
        Err(CommError::unsupported(
            "recv is not supported by this process group",
        ))
    }

    pub fn recv_anysource(&self, _tensors: &[DeviceTensor], _tag: usize) -> Result<WorkHandle> {
        Err(CommError::unsupported(
            "recv_anysource is not supported by this process group",
        ))
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        self.shared.watchdog.request_stop();
        if let Some(handle) = self.watchdog_thread.take()
            && handle.join().is_err()
        {
            tracing::error!("watchdog thread panicked during shutdown");
        }
    }
}
