//! Per-operation option structs.
//!
//! The root of a rooted collective is addressed as a (rank, tensor) pair:
//! the backend world rank is `root_rank * tensors_per_rank + root_tensor`.

use crate::types::ReduceOp;

#[derive(Debug, Clone, Default)]
pub struct AllreduceOptions {
    pub reduce_op: ReduceOp,
}

#[derive(Debug, Clone, Default)]
pub struct BroadcastOptions {
    pub root_rank: usize,
    pub root_tensor: usize,
}

#[derive(Debug, Clone, Default)]
pub struct ReduceOptions {
    pub reduce_op: ReduceOp,
    pub root_rank: usize,
    pub root_tensor: usize,
}

#[derive(Debug, Clone, Default)]
pub struct AllgatherOptions {
    /// Treat the output list as contiguous views of one flat buffer and
    /// skip the unflatten copies when the layout allows it.
    pub no_copy: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ReduceScatterOptions {
    pub reduce_op: ReduceOp,
    /// See [`AllgatherOptions::no_copy`], applied to the input list.
    pub no_copy: bool,
}

#[derive(Debug, Clone, Default)]
pub struct AllToAllOptions {}

#[derive(Debug, Clone, Default)]
pub struct BarrierOptions {}
