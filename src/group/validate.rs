//! Tensor-list and split-size preconditions for collective dispatch.

use std::collections::HashSet;

use crate::error::{CommError, Result};
use crate::tensor::DeviceTensor;

/// Standard validation: non-empty, at most one tensor per local device,
/// dense contiguous device tensors of identical type and shape, each on a
/// distinct device.
pub(crate) fn check_device_tensors(tensors: &[DeviceTensor], device_count: usize) -> Result<()> {
    check_device_tensors_multi(tensors, device_count, false)
}

/// As [`check_device_tensors`], with `alltoallv` waiving the identical-shape
/// and distinct-device requirements (the caller controls per-peer lengths).
pub(crate) fn check_device_tensors_multi(
    tensors: &[DeviceTensor],
    device_count: usize,
    alltoallv: bool,
) -> Result<()> {
    if tensors.is_empty() {
        return Err(CommError::invalid_argument("tensor list must be nonempty"));
    }
    if !alltoallv && tensors.len() > device_count {
        return Err(CommError::invalid_argument(format!(
            "tensor list of {} entries exceeds the {} available devices",
            tensors.len(),
            device_count
        )));
    }

    let first = &tensors[0];
    if !first.dtype().supported_for_collectives() {
        return Err(CommError::unsupported(format!(
            "data type {} is not supported for collectives",
            first.dtype()
        )));
    }

    let mut used_devices = HashSet::with_capacity(tensors.len());
    for t in tensors {
        if !t.is_dense() {
            return Err(CommError::invalid_argument(
                "tensors must be dense device tensors",
            ));
        }
        if t.dtype() != first.dtype() {
            return Err(CommError::invalid_argument(format!(
                "tensors must have identical type ({} vs {})",
                t.dtype(),
                first.dtype()
            )));
        }
        if !alltoallv && t.shape() != first.shape() {
            return Err(CommError::invalid_argument(
                "tensors must have identical shape",
            ));
        }
        if !t.is_contiguous() {
            return Err(CommError::invalid_argument("tensors must be contiguous"));
        }
        if !alltoallv && !used_devices.insert(t.device()) {
            return Err(CommError::invalid_argument(
                "tensors must be on distinct devices",
            ));
        }
    }
    Ok(())
}

/// Validate all-to-all split sizes against `tensor`'s first dimension:
/// an empty split list requires even divisibility by `group_size`,
/// otherwise one entry per rank summing to the first-dimension size.
pub(crate) fn check_split_sizes(
    split_sizes: &[usize],
    tensor: &DeviceTensor,
    group_size: usize,
) -> Result<()> {
    if split_sizes.is_empty() {
        if tensor.size0() % group_size != 0 {
            return Err(CommError::invalid_argument(format!(
                "tensor's first dimension ({}) does not divide evenly across group size {}",
                tensor.size0(),
                group_size
            )));
        }
    } else {
        if split_sizes.len() != group_size {
            return Err(CommError::invalid_argument(format!(
                "{} split sizes for a group of {}",
                split_sizes.len(),
                group_size
            )));
        }
        let sum: usize = split_sizes.iter().sum();
        if sum != tensor.size0() {
            return Err(CommError::invalid_argument(format!(
                "split sizes sum to {sum} but the tensor's first dimension is {}",
                tensor.size0()
            )));
        }
    }
    Ok(())
}
