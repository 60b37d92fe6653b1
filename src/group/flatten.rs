//! Flattening per-rank tensor lists into one flat buffer per device for
//! the scatter/gather collective family.

use std::sync::Arc;

use crate::device::DeviceRuntime;
use crate::error::{CommError, Result};
use crate::tensor::DeviceTensor;

/// Flatten each list in `tensor_lists` for a gather or scatter, checking
/// compatibility with the corresponding tensor in `other` (the inputs of
/// an all-gather, the outputs of a reduce-scatter).
///
/// With `no_copy`, a list whose tensors are contiguous views laid out
/// back-to-back in one storage (and whose `other` tensor, if it shares
/// that storage, sits at this rank's slot) flattens to a zero-copy view.
/// Any layout violation quietly falls back to a freshly allocated flat
/// buffer filled/drained by the dispatcher's copy hooks.
pub(crate) fn flatten_for_scatter_gather(
    runtime: &dyn DeviceRuntime,
    tensor_lists: &[Vec<DeviceTensor>],
    other: &[DeviceTensor],
    world_size: usize,
    rank: usize,
    no_copy: bool,
) -> Result<Vec<DeviceTensor>> {
    if tensor_lists.len() != other.len() {
        return Err(CommError::invalid_argument(
            "tensor list operands to scatter/gather must have the same length",
        ));
    }
    let num_devices = tensor_lists.len();
    let mut no_copy = no_copy;

    let mut flattened = Vec::with_capacity(num_devices);
    for (list, other_tensor) in tensor_lists.iter().zip(other) {
        if list.len() != world_size * num_devices {
            return Err(CommError::invalid_argument(format!(
                "tensor list input to scatter/gather has {} entries for {} participants",
                list.len(),
                world_size * num_devices
            )));
        }
        for t in list {
            if t.device() != other_tensor.device() {
                return Err(CommError::invalid_argument(
                    "corresponding input/output tensors to scatter/gather must all \
                     reside on the same device",
                ));
            }
            if t.numel() != other_tensor.numel() {
                return Err(CommError::invalid_argument(
                    "all tensor operands to scatter/gather must have the same number \
                     of elements",
                ));
            }
        }

        let base = &list[0];
        if no_copy {
            for (j, t) in list.iter().enumerate() {
                if !t.is_contiguous()
                    || !t.same_storage(base)
                    || t.storage_offset() != base.storage_offset() + j * base.numel()
                {
                    no_copy = false;
                    break;
                }
            }
            // The peer tensor may share the storage only if it sits exactly
            // at this rank's slot.
            if no_copy
                && other_tensor.same_storage(base)
                && other_tensor.storage_offset() != base.storage_offset() + rank * base.numel()
            {
                no_copy = false;
            }
        }

        if no_copy {
            flattened.push(DeviceTensor::new(
                Arc::clone(base.storage()),
                base.storage_offset(),
                vec![world_size * other_tensor.numel()],
                base.dtype(),
            )?);
        } else {
            let mut shape = vec![list.len()];
            shape.extend_from_slice(base.shape());
            flattened.push(DeviceTensor::alloc(
                runtime,
                other_tensor.device(),
                &shape,
                base.dtype(),
            )?);
        }
    }
    Ok(flattened)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::HostRuntime;
    use crate::types::DataType;

    const WORLD: usize = 4;
    const NUMEL: usize = 3;

    /// One storage holding WORLD back-to-back chunks, viewed per chunk.
    fn aliased_list(rt: &HostRuntime) -> (Vec<DeviceTensor>, DeviceTensor) {
        let flat = DeviceTensor::alloc(rt, 0, &[WORLD * NUMEL], DataType::F32).unwrap();
        let views: Vec<DeviceTensor> = (0..WORLD)
            .map(|j| flat.element_slice(j * NUMEL, NUMEL).unwrap())
            .collect();
        (views, flat)
    }

    #[test]
    fn test_no_copy_returns_zero_copy_view() {
        let rt = HostRuntime::new(1).unwrap();
        let (views, flat) = aliased_list(&rt);
        let other = views[1].clone(); // rank 1's slot
        let out =
            flatten_for_scatter_gather(&rt, &[views.clone()], &[other], WORLD, 1, true).unwrap();
        assert_eq!(out.len(), 1);
        assert!(out[0].same_storage(&flat));
        assert_eq!(out[0].storage_offset(), views[0].storage_offset());
        assert_eq!(out[0].numel(), WORLD * NUMEL);
    }

    #[test]
    fn test_no_copy_falls_back_on_misordered_views() {
        let rt = HostRuntime::new(1).unwrap();
        let (mut views, flat) = aliased_list(&rt);
        views.swap(1, 2);
        let other = DeviceTensor::alloc(&rt, 0, &[NUMEL], DataType::F32).unwrap();
        let out = flatten_for_scatter_gather(&rt, &[views], &[other], WORLD, 0, true).unwrap();
        assert!(!out[0].same_storage(&flat));
        assert_eq!(out[0].numel(), WORLD * NUMEL);
    }

    #[test]
    fn test_no_copy_falls_back_on_misplaced_peer() {
        let rt = HostRuntime::new(1).unwrap();
        let (views, flat) = aliased_list(&rt);
        // Peer aliases the storage but sits at rank 0's slot while we are rank 2.
        let other = views[0].clone();
        let out = flatten_for_scatter_gather(&rt, &[views], &[other], WORLD, 2, true).unwrap();
        assert!(!out[0].same_storage(&flat));
    }

    #[test]
    fn test_copy_path_allocates_row_per_participant() {
        let rt = HostRuntime::new(1).unwrap();
        let list: Vec<DeviceTensor> = (0..WORLD)
            .map(|_| DeviceTensor::alloc(&rt, 0, &[NUMEL], DataType::F32).unwrap())
            .collect();
        let other = DeviceTensor::alloc(&rt, 0, &[NUMEL], DataType::F32).unwrap();
        let out = flatten_for_scatter_gather(&rt, &[list], &[other], WORLD, 0, false).unwrap();
        assert_eq!(out[0].shape(), &[WORLD, NUMEL]);
        assert_eq!(out[0].numel(), WORLD * NUMEL);
    }

    #[test]
    fn test_participant_count_enforced() {
        let rt = HostRuntime::new(1).unwrap();
        let list: Vec<DeviceTensor> = (0..WORLD - 1)
            .map(|_| DeviceTensor::alloc(&rt, 0, &[NUMEL], DataType::F32).unwrap())
            .collect();
        let other = DeviceTensor::alloc(&rt, 0, &[NUMEL], DataType::F32).unwrap();
        assert!(flatten_for_scatter_gather(&rt, &[list], &[other], WORLD, 0, false).is_err());
    }

    #[test]
    fn test_numel_mismatch_rejected() {
        let rt = HostRuntime::new(1).unwrap();
        let list: Vec<DeviceTensor> = (0..WORLD)
            .map(|_| DeviceTensor::alloc(&rt, 0, &[NUMEL], DataType::F32).unwrap())
            .collect();
        let other = DeviceTensor::alloc(&rt, 0, &[NUMEL + 1], DataType::F32).unwrap();
        assert!(flatten_for_scatter_gather(&rt, &[list], &[other], WORLD, 0, false).is_err());
    }

    #[test]
    fn test_device_mismatch_rejected() {
        let rt = HostRuntime::new(2).unwrap();
        let list: Vec<DeviceTensor> = (0..WORLD)
            .map(|_| DeviceTensor::alloc(&rt, 0, &[NUMEL], DataType::F32).unwrap())
            .collect();
        let other = DeviceTensor::alloc(&rt, 1, &[NUMEL], DataType::F32).unwrap();
        assert!(flatten_for_scatter_gather(&rt, &[list], &[other], WORLD, 0, false).is_err());
    }

    #[test]
    fn test_list_length_mismatch_rejected() {
        let rt = HostRuntime::new(1).unwrap();
        let other = DeviceTensor::alloc(&rt, 0, &[NUMEL], DataType::F32).unwrap();
        assert!(flatten_for_scatter_gather(&rt, &[], &[other], WORLD, 0, false).is_err());
    }
}
