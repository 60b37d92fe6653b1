//! Element-wise reduction over raw host buffers, used by the loopback
//! backend's in-process collectives.

use crate::error::{CommError, Result};
use crate::types::{DataType, ReduceOp};

/// Trait for types that support the four reduction operations.
trait Reducible: Copy + 'static {
    fn reduce(self, other: Self, op: ReduceOp) -> Self;
}

macro_rules! impl_reducible_int {
    ($($ty:ty),*) => {
        $(
            impl Reducible for $ty {
                #[inline]
                fn reduce(self, other: Self, op: ReduceOp) -> Self {
                    match op {
                        ReduceOp::Sum => self.wrapping_add(other),
                        ReduceOp::Prod => self.wrapping_mul(other),
                        ReduceOp::Min => self.min(other),
                        ReduceOp::Max => self.max(other),
                    }
                }
            }
        )*
    };
}

macro_rules! impl_reducible_float {
    ($($ty:ty),*) => {
        $(
            impl Reducible for $ty {
                #[inline]
                fn reduce(self, other: Self, op: ReduceOp) -> Self {
                    match op {
                        ReduceOp::Sum => self + other,
                        ReduceOp::Prod => self * other,
                        ReduceOp::Min => self.min(other),
                        ReduceOp::Max => self.max(other),
                    }
                }
            }
        )*
    };
}

impl_reducible_int!(i8, i32, i64, u8, u32, u64);
impl_reducible_float!(f32, f64);

/// Apply `dst[i] = op(dst[i], src[i])` over `count` elements of `dtype`.
///
/// # Safety
/// `dst` and `src` must each point to at least `count` valid elements of
/// the type described by `dtype`, and must not overlap.
pub(crate) unsafe fn reduce_ptr(
    dst: u64,
    src: u64,
    count: usize,
    dtype: DataType,
    op: ReduceOp,
) -> Result<()> {
    unsafe {
        match dtype {
            DataType::F32 => reduce_ptr_typed::<f32>(dst, src, count, op),
            DataType::F64 => reduce_ptr_typed::<f64>(dst, src, count, op),
            DataType::I32 => reduce_ptr_typed::<i32>(dst, src, count, op),
            DataType::I64 => reduce_ptr_typed::<i64>(dst, src, count, op),
            DataType::U32 => reduce_ptr_typed::<u32>(dst, src, count, op),
            DataType::U64 => reduce_ptr_typed::<u64>(dst, src, count, op),
            DataType::I8 => reduce_ptr_typed::<i8>(dst, src, count, op),
            DataType::U8 => reduce_ptr_typed::<u8>(dst, src, count, op),
            DataType::F16 | DataType::BF16 => {
                return Err(CommError::unsupported(format!(
                    "{dtype} reduction is not available on the host backend"
                )));
            }
        }
    }
    Ok(())
}

/// # Safety
/// See [`reduce_ptr`].
unsafe fn reduce_ptr_typed<T: Reducible>(dst: u64, src: u64, count: usize, op: ReduceOp) {
    let dst = dst as *mut T;
    let src = src as *const T;
    for i in 0..count {
        let d = unsafe { *dst.add(i) };
        let s = unsafe { *src.add(i) };
        unsafe { *dst.add(i) = d.reduce(s, op) };
    }
}
