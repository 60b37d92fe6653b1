//! Multi-rank end-to-end scenarios over the loopback stack: every rank is
//! an OS thread with its own process group, sharing a store, a fabric,
//! and a host runtime (one device per rank).

use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

use commgroup::{
    AllToAllOptions, AllgatherOptions, AllreduceOptions, BarrierOptions, BroadcastOptions,
    CollectiveBackend, CommError, DataType, DeviceRuntime, DeviceTensor, GroupConfig, HashStore,
    HostRuntime, LoopbackBackend, LoopbackFabric, ProcessGroup, ReduceOp, ReduceOptions,
    ReduceScatterOptions, Store,
};

struct Cluster {
    runtime: Arc<HostRuntime>,
    backend: Arc<LoopbackBackend>,
    store: Arc<HashStore>,
    world: usize,
}

impl Cluster {
    fn new(world: usize) -> Self {
        let runtime = Arc::new(HostRuntime::new(world).unwrap());
        let fabric = Arc::new(LoopbackFabric::new());
        let backend = Arc::new(LoopbackBackend::new(fabric, Arc::clone(&runtime)));
        let store = Arc::new(HashStore::new());
        Self {
            runtime,
            backend,
            store,
            world,
        }
    }

    fn group(&self, rank: usize, config: GroupConfig) -> ProcessGroup {
        let store: Arc<dyn Store> = Arc::clone(&self.store) as Arc<dyn Store>;
        let backend: Arc<dyn CollectiveBackend> =
            Arc::clone(&self.backend) as Arc<dyn CollectiveBackend>;
        let runtime: Arc<dyn DeviceRuntime> = Arc::clone(&self.runtime) as Arc<dyn DeviceRuntime>;
        ProcessGroup::with_config(store, rank, self.world, backend, runtime, config).unwrap()
    }
}

fn blocking_config() -> GroupConfig {
    GroupConfig {
        blocking_wait: true,
        op_timeout: Duration::from_secs(10),
        watchdog_interval: Duration::from_millis(200),
        store_wait: Duration::from_millis(50),
        ..GroupConfig::default()
    }
}

/// Run `f` once per rank, each on its own thread.
fn run_group<F>(world: usize, config: GroupConfig, f: F)
where
    F: Fn(&ProcessGroup, &HostRuntime, usize) + Send + Sync,
{
    let cluster = Cluster::new(world);
    thread::scope(|scope| {
        for rank in 0..world {
            let cluster = &cluster;
            let config = config.clone();
            let f = &f;
            scope.spawn(move || {
                let group = cluster.group(rank, config);
                f(&group, &cluster.runtime, rank);
            });
        }
    });
}

fn tensor_f32(rt: &HostRuntime, device: usize, data: &[f32]) -> DeviceTensor {
    let t = DeviceTensor::alloc(rt, device, &[data.len()], DataType::F32).unwrap();
    rt.write_f32(&t, data).unwrap();
    t
}

#[test]
fn test_allreduce_sum_two_ranks() {
    run_group(2, blocking_config(), |group, rt, rank| {
        let data: Vec<f32> = if rank == 0 {
            vec![1.0, 2.0, 3.0, 4.0]
        } else {
            vec![10.0, 20.0, 30.0, 40.0]
        };
        let t = tensor_f32(rt, rank, &data);
        let work = group
            .allreduce(std::slice::from_ref(&t), &AllreduceOptions::default())
            .unwrap();
        assert!(work.wait().unwrap());
        assert!(work.is_success());
        assert_eq!(
            rt.read_f32(&t).unwrap(),
            vec![11.0, 22.0, 33.0, 44.0],
            "rank {rank} allreduce mismatch"
        );
    });
}

#[test]
fn test_allreduce_product_and_max() {
    run_group(2, blocking_config(), |group, rt, rank| {
        let t = tensor_f32(rt, rank, &[(rank + 2) as f32, 2.0]);
        group
            .allreduce(
                std::slice::from_ref(&t),
                &AllreduceOptions {
                    reduce_op: ReduceOp::Prod,
                },
            )
            .unwrap()
            .wait()
            .unwrap();
        // 2 * 3 and 2 * 2.
        assert_eq!(rt.read_f32(&t).unwrap(), vec![6.0, 4.0]);

        let m = tensor_f32(rt, rank, &[rank as f32, -(rank as f32)]);
        group
            .allreduce(
                std::slice::from_ref(&m),
                &AllreduceOptions {
                    reduce_op: ReduceOp::Max,
                },
            )
            .unwrap()
            .wait()
            .unwrap();
        assert_eq!(rt.read_f32(&m).unwrap(), vec![1.0, 0.0]);
    });
}

#[test]
fn test_broadcast_from_root_one() {
    run_group(2, blocking_config(), |group, rt, rank| {
        let data: Vec<f32> = if rank == 1 {
            vec![7.0, 8.0, 9.0]
        } else {
            vec![0.0, 0.0, 0.0]
        };
        let t = tensor_f32(rt, rank, &data);
        group
            .broadcast(
                std::slice::from_ref(&t),
                &BroadcastOptions {
                    root_rank: 1,
                    root_tensor: 0,
                },
            )
            .unwrap()
            .wait()
            .unwrap();
        assert_eq!(
            rt.read_f32(&t).unwrap(),
            vec![7.0, 8.0, 9.0],
            "rank {rank} broadcast mismatch"
        );
    });
}

#[test]
fn test_reduce_sum_to_root() {
    run_group(2, blocking_config(), |group, rt, rank| {
        let t = tensor_f32(rt, rank, &[(rank + 1) as f32; 3]);
        group
            .reduce(
                std::slice::from_ref(&t),
                &ReduceOptions {
                    reduce_op: ReduceOp::Sum,
                    root_rank: 1,
                    root_tensor: 0,
                },
            )
            .unwrap()
            .wait()
            .unwrap();
        let expected = if rank == 1 {
            vec![3.0, 3.0, 3.0]
        } else {
            // Only the root's buffer receives the reduction.
            vec![1.0, 1.0, 1.0]
        };
        assert_eq!(rt.read_f32(&t).unwrap(), expected);
    });
}

#[test]
fn test_allgather_four_ranks() {
    run_group(4, blocking_config(), |group, rt, rank| {
        let input = tensor_f32(rt, rank, &[rank as f32]);
        let outputs: Vec<DeviceTensor> = (0..4).map(|_| tensor_f32(rt, rank, &[-1.0])).collect();
        group
            .allgather(
                &[outputs.clone()],
                std::slice::from_ref(&input),
                &AllgatherOptions::default(),
            )
            .unwrap()
            .wait()
            .unwrap();
        for (peer, out) in outputs.iter().enumerate() {
            assert_eq!(
                rt.read_f32(out).unwrap(),
                vec![peer as f32],
                "rank {rank} gathered wrong value from {peer}"
            );
        }
    });
}

#[test]
fn test_allgather_no_copy_aliased_outputs() {
    run_group(2, blocking_config(), |group, rt, rank| {
        let input = tensor_f32(rt, rank, &[rank as f32 + 0.5, rank as f32 - 0.5]);
        // Output list = back-to-back views of one flat buffer.
        let flat = DeviceTensor::alloc(rt, rank, &[4], DataType::F32).unwrap();
        let outputs: Vec<DeviceTensor> = (0..2)
            .map(|j| flat.element_slice(j * 2, 2).unwrap())
            .collect();
        group
            .allgather(
                &[outputs],
                std::slice::from_ref(&input),
                &AllgatherOptions { no_copy: true },
            )
            .unwrap()
            .wait()
            .unwrap();
        assert_eq!(rt.read_f32(&flat).unwrap(), vec![0.5, -0.5, 1.5, 0.5]);
    });
}

#[test]
fn test_reduce_scatter_max() {
    run_group(2, blocking_config(), |group, rt, rank| {
        let inputs: Vec<DeviceTensor> = if rank == 0 {
            vec![
                tensor_f32(rt, 0, &[1.0, 2.0]),
                tensor_f32(rt, 0, &[3.0, 4.0]),
            ]
        } else {
            vec![
                tensor_f32(rt, 1, &[5.0, 6.0]),
                tensor_f32(rt, 1, &[7.0, 8.0]),
            ]
        };
        let output = tensor_f32(rt, rank, &[0.0, 0.0]);
        group
            .reduce_scatter(
                std::slice::from_ref(&output),
                &[inputs],
                &ReduceScatterOptions {
                    reduce_op: ReduceOp::Max,
                    no_copy: false,
                },
            )
            .unwrap()
            .wait()
            .unwrap();
        let expected = if rank == 0 {
            vec![5.0, 6.0]
        } else {
            vec![7.0, 8.0]
        };
        assert_eq!(rt.read_f32(&output).unwrap(), expected);
    });
}

#[test]
fn test_alltoall_base_even_split() {
    run_group(2, blocking_config(), |group, rt, rank| {
        let base = (rank * 10) as f32;
        let input = tensor_f32(rt, rank, &[base, base + 1.0, base + 2.0, base + 3.0]);
        let output = tensor_f32(rt, rank, &[0.0; 4]);
        group
            .alltoall_base(&output, &input, &[], &[], &AllToAllOptions::default())
            .unwrap()
            .wait()
            .unwrap();
        let expected = if rank == 0 {
            vec![0.0, 1.0, 10.0, 11.0]
        } else {
            vec![2.0, 3.0, 12.0, 13.0]
        };
        assert_eq!(rt.read_f32(&output).unwrap(), expected);
    });
}

#[test]
fn test_alltoall_base_variable_splits() {
    run_group(2, blocking_config(), |group, rt, rank| {
        let (input, in_splits, out_len, out_splits) = if rank == 0 {
            (
                tensor_f32(rt, 0, &[1.0, 2.0, 3.0, 4.0]),
                vec![1usize, 3],
                3usize,
                vec![1usize, 2],
            )
        } else {
            (
                tensor_f32(rt, 1, &[5.0, 6.0, 7.0]),
                vec![2usize, 1],
                4usize,
                vec![3usize, 1],
            )
        };
        let output = tensor_f32(rt, rank, &vec![0.0; out_len]);
        group
            .alltoall_base(
                &output,
                &input,
                &out_splits,
                &in_splits,
                &AllToAllOptions::default(),
            )
            .unwrap()
            .wait()
            .unwrap();
        let expected = if rank == 0 {
            vec![1.0, 5.0, 6.0]
        } else {
            vec![2.0, 3.0, 4.0, 7.0]
        };
        assert_eq!(rt.read_f32(&output).unwrap(), expected);
    });
}

#[test]
fn test_alltoall_tensor_lists() {
    run_group(2, blocking_config(), |group, rt, rank| {
        let inputs: Vec<DeviceTensor> = (0..2)
            .map(|peer| tensor_f32(rt, rank, &[(100 * rank + peer) as f32]))
            .collect();
        let outputs: Vec<DeviceTensor> = (0..2).map(|_| tensor_f32(rt, rank, &[-1.0])).collect();
        group
            .alltoall(&outputs, &inputs, &AllToAllOptions::default())
            .unwrap()
            .wait()
            .unwrap();
        for (peer, out) in outputs.iter().enumerate() {
            assert_eq!(
                rt.read_f32(out).unwrap(),
                vec![(100 * peer + rank) as f32],
                "rank {rank} got wrong slice from {peer}"
            );
        }
    });
}

#[test]
fn test_barrier_cold() {
    run_group(2, blocking_config(), |group, _rt, _rank| {
        let work = group.barrier(&BarrierOptions::default()).unwrap();
        assert!(work.wait().unwrap());
    });
}

#[test]
fn test_barrier_after_collectives() {
    run_group(2, blocking_config(), |group, rt, rank| {
        let t = tensor_f32(rt, rank, &[rank as f32]);
        group
            .allreduce(std::slice::from_ref(&t), &AllreduceOptions::default())
            .unwrap()
            .wait()
            .unwrap();
        group
            .barrier(&BarrierOptions::default())
            .unwrap()
            .wait()
            .unwrap();
        assert_eq!(rt.read_f32(&t).unwrap(), vec![1.0]);
    });
}

#[test]
fn test_nonblocking_wait_orders_current_stream() {
    let config = GroupConfig {
        blocking_wait: false,
        ..blocking_config()
    };
    run_group(2, config, |group, rt, rank| {
        let t = tensor_f32(rt, rank, &[(rank + 1) as f32; 2]);
        let work = group
            .allreduce(std::slice::from_ref(&t), &AllreduceOptions::default())
            .unwrap();
        // Non-blocking wait only orders the current stream after the
        // collective; draining the device then guarantees visibility.
        assert!(work.wait().unwrap());
        rt.synchronize_device(rank).unwrap();
        assert_eq!(rt.read_f32(&t).unwrap(), vec![3.0, 3.0]);
        assert!(work.is_completed().unwrap());
    });
}

#[test]
fn test_blocking_timeout_publishes_abort_and_fans_out() {
    let world = 2;
    let cluster = Cluster::new(world);
    let config = GroupConfig {
        blocking_wait: true,
        op_timeout: Duration::from_millis(300),
        watchdog_interval: Duration::from_millis(150),
        store_wait: Duration::from_millis(50),
        ..GroupConfig::default()
    };
    let phase = Barrier::new(world);

    thread::scope(|scope| {
        for rank in 0..world {
            let cluster = &cluster;
            let config = config.clone();
            let phase = &phase;
            scope.spawn(move || {
                let group = cluster.group(rank, config);
                let rt = &cluster.runtime;

                // Healthy collective so both ranks hold a communicator.
                let t = tensor_f32(rt, rank, &[rank as f32]);
                group
                    .allreduce(std::slice::from_ref(&t), &AllreduceOptions::default())
                    .unwrap()
                    .wait()
                    .unwrap();
                phase.wait();

                if rank == 0 {
                    // The peer never joins this collective: blocking wait
                    // must time out, abort, and publish to the store.
                    let started = Instant::now();
                    let work = group
                        .allreduce(std::slice::from_ref(&t), &AllreduceOptions::default())
                        .unwrap();
                    let err = work.wait().unwrap_err();
                    assert!(matches!(err, CommError::TimedOut { .. }), "got {err}");
                    assert!(started.elapsed() < Duration::from_secs(5));
                    assert!(
                        cluster
                            .store
                            .keys()
                            .iter()
                            .any(|k| k.starts_with("NCCLABORTEDCOMM:")),
                        "timeout did not publish the aborted communicator"
                    );
                    phase.wait();
                } else {
                    phase.wait(); // wait for rank 0's timeout + publication
                    // Give the watchdog a cycle to pick the abort key up.
                    thread::sleep(Duration::from_millis(600));
                    // The fanned-out abort poisons this rank's communicator:
                    // the next collective on it must surface an error.
                    let err = group
                        .allreduce(std::slice::from_ref(&t), &AllreduceOptions::default())
                        .unwrap()
                        .wait()
                        .unwrap_err();
                    assert!(matches!(err, CommError::Backend { .. }), "got {err}");
                }
            });
        }
    });
}
