//! Scalar element types understood by the runtime.

use serde::{Deserialize, Serialize};

/// Logical element type carried by tensors and graph value descriptors.
///
/// The kernel set is floating-point only; the other kinds exist so that a
/// request for them fails with a typed error instead of failing to compile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    /// 32-bit IEEE-754 floating point.
    F32,
    /// 64-bit IEEE-754 floating point.
    F64,
    /// 16-bit floating point. Recognized, never executable.
    F16,
    /// 32-bit signed integer. Recognized, never executable.
    I32,
}

impl DType {
    /// Bytes per scalar element.
    pub fn size_in_bytes(self) -> usize {
        match self {
            DType::F32 | DType::I32 => 4,
            DType::F64 => 8,
            DType::F16 => 2,
        }
    }

    /// Whether tensors of this element type may be constructed.
    pub fn is_supported(self) -> bool {
        matches!(self, DType::F32 | DType::F64)
    }
}
