/// Rank of a participant in a process group (0-indexed).
pub type Rank = usize;

/// Index of a GPU within the local machine.
pub type DeviceIndex = usize;

/// Element types carried by device tensors.
///
/// The process group dispatches collectives for the subset reported by
/// [`DataType::supported_for_collectives`]; the remaining lane types exist so
/// tensors can describe themselves and fail with a clear error instead of a
/// missing enum variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DataType {
    F32 = 0,
    F64 = 1,
    F16 = 2,
    BF16 = 3,
    I8 = 4,
    I32 = 5,
    I64 = 6,
    U8 = 7,
    U32 = 8,
    U64 = 9,
}

impl DataType {
    /// Size of one element in bytes.
    pub const fn size_in_bytes(self) -> usize {
        match self {
            DataType::F32 | DataType::I32 | DataType::U32 => 4,
            DataType::F64 | DataType::I64 | DataType::U64 => 8,
            DataType::F16 | DataType::BF16 => 2,
            DataType::I8 | DataType::U8 => 1,
        }
    }

    /// Human-readable name.
    pub const fn name(self) -> &'static str {
        match self {
            DataType::F32 => "f32",
            DataType::F64 => "f64",
            DataType::F16 => "f16",
            DataType::BF16 => "bf16",
            DataType::I8 => "i8",
            DataType::I32 => "i32",
            DataType::I64 => "i64",
            DataType::U8 => "u8",
            DataType::U32 => "u32",
            DataType::U64 => "u64",
        }
    }

    /// Whether the process group accepts tensors of this type.
    pub const fn supported_for_collectives(self) -> bool {
        matches!(
            self,
            DataType::I8
                | DataType::U8
                | DataType::F32
                | DataType::F64
                | DataType::I32
                | DataType::I64
                | DataType::F16
        )
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Reduction operations for collective communication.
///
/// All four variants map 1:1 onto the collective backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ReduceOp {
    /// Element-wise sum across ranks.
    #[default]
    Sum,
    /// Element-wise product across ranks.
    Prod,
    /// Element-wise minimum across ranks.
    Min,
    /// Element-wise maximum across ranks.
    Max,
}

impl std::fmt::Display for ReduceOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReduceOp::Sum => f.write_str("sum"),
            ReduceOp::Prod => f.write_str("prod"),
            ReduceOp::Min => f.write_str("min"),
            ReduceOp::Max => f.write_str("max"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_datatype_sizes() {
        assert_eq!(DataType::F32.size_in_bytes(), 4);
        assert_eq!(DataType::F64.size_in_bytes(), 8);
        assert_eq!(DataType::F16.size_in_bytes(), 2);
        assert_eq!(DataType::BF16.size_in_bytes(), 2);
        assert_eq!(DataType::I8.size_in_bytes(), 1);
        assert_eq!(DataType::I64.size_in_bytes(), 8);
        assert_eq!(DataType::U8.size_in_bytes(), 1);
    }

    #[test]
    fn test_datatype_display() {
        assert_eq!(DataType::F32.to_string(), "f32");
        assert_eq!(DataType::F16.to_string(), "f16");
        assert_eq!(DataType::U8.to_string(), "u8");
    }

    #[test]
    fn test_collective_support_set() {
        let supported = [
            DataType::I8,
            DataType::U8,
            DataType::F32,
            DataType::F64,
            DataType::I32,
            DataType::I64,
            DataType::F16,
        ];
        for dt in supported {
            assert!(dt.supported_for_collectives(), "{dt} should be supported");
        }
        for dt in [DataType::BF16, DataType::U32, DataType::U64] {
            assert!(!dt.supported_for_collectives(), "{dt} should be rejected");
        }
    }

    #[test]
    fn test_reduce_op_display() {
        assert_eq!(ReduceOp::Sum.to_string(), "sum");
        assert_eq!(ReduceOp::Prod.to_string(), "prod");
        assert_eq!(ReduceOp::Min.to_string(), "min");
        assert_eq!(ReduceOp::Max.to_string(), "max");
    }

    #[test]
    fn test_reduce_op_default() {
        assert_eq!(ReduceOp::default(), ReduceOp::Sum);
    }
}
