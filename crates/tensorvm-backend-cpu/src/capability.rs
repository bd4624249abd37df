//! One-time, process-wide probe of the host's vector width.

use std::sync::OnceLock;

/// Vector tier used for kernel dispatch.
///
/// The tier fixes the lane count every kernel iterates by: a 512-bit unit
/// processes 16 f32 (8 f64) lanes per step, a 256-bit unit half that, and
/// the scalar tier runs the tail loops over the whole buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimdLevel {
    /// 512-bit vectors (AVX-512F).
    Avx512,
    /// 256-bit vectors (AVX2 + FMA).
    Avx2,
    /// No usable vector unit.
    Scalar,
}

static PROBE: OnceLock<SimdLevel> = OnceLock::new();

impl SimdLevel {
    /// The widest tier the host supports. Probed once per process and
    /// cached; never re-probed per call.
    pub fn detect() -> SimdLevel {
        *PROBE.get_or_init(|| {
            #[cfg(target_arch = "x86_64")]
            {
                if is_x86_feature_detected!("avx512f") {
                    SimdLevel::Avx512
                } else if is_x86_feature_detected!("avx2") && is_x86_feature_detected!("fma") {
                    SimdLevel::Avx2
                } else {
                    SimdLevel::Scalar
                }
            }
            #[cfg(not(target_arch = "x86_64"))]
            {
                SimdLevel::Scalar
            }
        })
    }

    /// f32 lanes processed per vector step.
    pub fn lanes_f32(self) -> usize {
        match self {
            SimdLevel::Avx512 => 16,
            SimdLevel::Avx2 => 8,
            SimdLevel::Scalar => 1,
        }
    }

    /// f64 lanes processed per vector step.
    pub fn lanes_f64(self) -> usize {
        match self {
            SimdLevel::Avx512 => 8,
            SimdLevel::Avx2 => 4,
            SimdLevel::Scalar => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_is_stable() {
        assert_eq!(SimdLevel::detect(), SimdLevel::detect());
    }

    #[test]
    fn lane_widths() {
        assert_eq!(SimdLevel::Avx512.lanes_f32(), 16);
        assert_eq!(SimdLevel::Avx2.lanes_f32(), 8);
        assert_eq!(SimdLevel::Scalar.lanes_f32(), 1);
        assert_eq!(SimdLevel::Avx512.lanes_f64(), 8);
        assert_eq!(SimdLevel::Avx2.lanes_f64(), 4);
    }
}
