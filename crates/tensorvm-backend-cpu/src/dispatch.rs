//! The two [`KernelBackend`] implementations: the capability-dispatched
//! vector backend and the pure scalar reference.

use tensorvm::error::{EngineError, Result};
use tensorvm::graph::OpKind;
use tensorvm::kernel::KernelBackend;
use tensorvm::tensor::{DType, Tensor};

use crate::capability::SimdLevel;
use crate::{elementwise as ew, matmul, nn};

/// Vector backend. The lane width is fixed at construction from the
/// one-time process capability probe, or pinned to the scalar tier by
/// `TENSORVM_FORCE_SCALAR`.
pub struct SimdBackend {
    level: SimdLevel,
}

impl SimdBackend {
    pub fn new() -> Self {
        let level = if tensorvm::force_scalar() {
            SimdLevel::Scalar
        } else {
            SimdLevel::detect()
        };
        SimdBackend { level }
    }

    /// Pins the backend to a specific tier. A tier wider than the host
    /// supports is clamped down to the probed one.
    pub fn with_level(level: SimdLevel) -> Self {
        let probed = SimdLevel::detect();
        let level = if level.lanes_f32() > probed.lanes_f32() {
            probed
        } else {
            level
        };
        SimdBackend { level }
    }

    pub fn level(&self) -> SimdLevel {
        self.level
    }
}

impl Default for SimdBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl KernelBackend for SimdBackend {
    fn name(&self) -> &'static str {
        match self.level {
            SimdLevel::Avx512 => "cpu-avx512",
            SimdLevel::Avx2 => "cpu-avx2",
            SimdLevel::Scalar => "cpu-scalar",
        }
    }

    fn execute(&self, op: &OpKind, inputs: &[&Tensor], out: &mut Tensor) -> Result<()> {
        execute_with(self.level, op, inputs, out)
    }

    fn execute_inplace(&self, op: &OpKind, out: &mut Tensor, rest: &[&Tensor]) -> Result<()> {
        execute_inplace_with(self.level, op, out, rest)
    }
}

/// Scalar reference backend: the same kernels pinned to their tail loops.
/// Every vector kernel is checked against this numerically.
#[derive(Default)]
pub struct ScalarBackend;

impl ScalarBackend {
    pub fn new() -> Self {
        ScalarBackend
    }
}

impl KernelBackend for ScalarBackend {
    fn name(&self) -> &'static str {
        "cpu-reference"
    }

    fn execute(&self, op: &OpKind, inputs: &[&Tensor], out: &mut Tensor) -> Result<()> {
        execute_with(SimdLevel::Scalar, op, inputs, out)
    }

    fn execute_inplace(&self, op: &OpKind, out: &mut Tensor, rest: &[&Tensor]) -> Result<()> {
        execute_inplace_with(SimdLevel::Scalar, op, out, rest)
    }
}

type Bin32 = fn(&[f32], &[f32], &mut [f32], SimdLevel);
type Bin64 = fn(&[f64], &[f64], &mut [f64], SimdLevel);
type Un32 = fn(&[f32], &mut [f32], SimdLevel);
type Un64 = fn(&[f64], &mut [f64], SimdLevel);

fn binary(level: SimdLevel, inputs: &[&Tensor], out: &mut Tensor, k32: Bin32, k64: Bin64) -> Result<()> {
    match out.dtype() {
        DType::F32 => k32(inputs[0].f32()?, inputs[1].f32()?, out.f32_mut()?, level),
        DType::F64 => k64(inputs[0].f64()?, inputs[1].f64()?, out.f64_mut()?, level),
        other => return Err(EngineError::unsupported_type(other)),
    }
    Ok(())
}

fn unary(level: SimdLevel, input: &Tensor, out: &mut Tensor, k32: Un32, k64: Un64) -> Result<()> {
    match out.dtype() {
        DType::F32 => k32(input.f32()?, out.f32_mut()?, level),
        DType::F64 => k64(input.f64()?, out.f64_mut()?, level),
        other => return Err(EngineError::unsupported_type(other)),
    }
    Ok(())
}

fn dims4(t: &Tensor) -> [usize; 4] {
    let d = t.shape().dims();
    [d[0], d[1], d[2], d[3]]
}

fn execute_with(level: SimdLevel, op: &OpKind, inputs: &[&Tensor], out: &mut Tensor) -> Result<()> {
    match op {
        OpKind::Input { .. } | OpKind::Constant(_) => Err(EngineError::runtime(format!(
            "{} values are materialized by the engine, not computed by a kernel",
            op.name()
        ))),
        OpKind::Add => binary(level, inputs, out, ew::add_f32, ew::add_f64),
        OpKind::Mul => binary(level, inputs, out, ew::mul_f32, ew::mul_f64),
        OpKind::Fma => {
            match out.dtype() {
                DType::F32 => ew::fma_f32(inputs[0].f32()?, inputs[1].f32()?, inputs[2].f32()?, out.f32_mut()?, level),
                DType::F64 => ew::fma_f64(inputs[0].f64()?, inputs[1].f64()?, inputs[2].f64()?, out.f64_mut()?, level),
                other => return Err(EngineError::unsupported_type(other)),
            }
            Ok(())
        }
        OpKind::Scale(spec) => {
            match out.dtype() {
                DType::F32 => ew::scale_f32(inputs[0].f32()?, out.f32_mut()?, spec.factor as f32, level),
                DType::F64 => ew::scale_f64(inputs[0].f64()?, out.f64_mut()?, spec.factor, level),
                other => return Err(EngineError::unsupported_type(other)),
            }
            Ok(())
        }
        OpKind::Neg => unary(level, inputs[0], out, ew::neg_f32, ew::neg_f64),
        OpKind::Relu => unary(level, inputs[0], out, ew::relu_f32, ew::relu_f64),
        OpKind::MatMul => {
            let (m, k) = {
                let d = inputs[0].shape().dims();
                (d[0], d[1])
            };
            let n = inputs[1].shape().dims()[1];
            match out.dtype() {
                DType::F32 => matmul::matmul_f32(inputs[0].f32()?, inputs[1].f32()?, out.f32_mut()?, m, n, k, level),
                DType::F64 => matmul::matmul_f64(inputs[0].f64()?, inputs[1].f64()?, out.f64_mut()?, m, n, k, level),
                other => return Err(EngineError::unsupported_type(other)),
            }
            Ok(())
        }
        OpKind::BiasAdd => {
            let (rows, cols) = {
                let d = inputs[0].shape().dims();
                (d[0], d[1])
            };
            match out.dtype() {
                DType::F32 => nn::bias_add_f32(inputs[0].f32()?, inputs[1].f32()?, out.f32_mut()?, rows, cols, level),
                DType::F64 => nn::bias_add_f64(inputs[0].f64()?, inputs[1].f64()?, out.f64_mut()?, rows, cols, level),
                other => return Err(EngineError::unsupported_type(other)),
            }
            Ok(())
        }
        OpKind::Conv2d(spec) => {
            let (xd, wd) = (dims4(inputs[0]), dims4(inputs[1]));
            match out.dtype() {
                DType::F32 => nn::conv2d_f32(inputs[0].f32()?, inputs[1].f32()?, out.f32_mut()?, xd, wd, spec.stride, spec.padding),
                DType::F64 => nn::conv2d_f64(inputs[0].f64()?, inputs[1].f64()?, out.f64_mut()?, xd, wd, spec.stride, spec.padding),
                other => return Err(EngineError::unsupported_type(other)),
            }
            Ok(())
        }
        OpKind::BatchNorm(spec) => {
            let (n, c, plane) = {
                let d = inputs[0].shape().dims();
                (d[0], d[1], d[2] * d[3])
            };
            match out.dtype() {
                DType::F32 => nn::batch_norm_f32(
                    inputs[0].f32()?, inputs[1].f32()?, inputs[2].f32()?, inputs[3].f32()?, inputs[4].f32()?,
                    spec.epsilon, out.f32_mut()?, n, c, plane, level,
                ),
                DType::F64 => nn::batch_norm_f64(
                    inputs[0].f64()?, inputs[1].f64()?, inputs[2].f64()?, inputs[3].f64()?, inputs[4].f64()?,
                    spec.epsilon, out.f64_mut()?, n, c, plane, level,
                ),
                other => return Err(EngineError::unsupported_type(other)),
            }
            Ok(())
        }
        OpKind::MatMulBias => {
            let (m, k) = {
                let d = inputs[0].shape().dims();
                (d[0], d[1])
            };
            let n = inputs[1].shape().dims()[1];
            match out.dtype() {
                DType::F32 => nn::matmul_bias_f32(
                    inputs[0].f32()?, inputs[1].f32()?, inputs[2].f32()?, out.f32_mut()?, m, n, k, level,
                ),
                DType::F64 => nn::matmul_bias_f64(
                    inputs[0].f64()?, inputs[1].f64()?, inputs[2].f64()?, out.f64_mut()?, m, n, k, level,
                ),
                other => return Err(EngineError::unsupported_type(other)),
            }
            Ok(())
        }
        OpKind::ConvBnRelu(spec) => {
            let (xd, wd) = (dims4(inputs[0]), dims4(inputs[1]));
            match out.dtype() {
                DType::F32 => nn::conv_bn_relu_f32(
                    inputs[0].f32()?, inputs[1].f32()?, inputs[2].f32()?, inputs[3].f32()?, inputs[4].f32()?,
                    inputs[5].f32()?, spec.epsilon, out.f32_mut()?, xd, wd, spec.conv.stride, spec.conv.padding, level,
                ),
                DType::F64 => nn::conv_bn_relu_f64(
                    inputs[0].f64()?, inputs[1].f64()?, inputs[2].f64()?, inputs[3].f64()?, inputs[4].f64()?,
                    inputs[5].f64()?, spec.epsilon, out.f64_mut()?, xd, wd, spec.conv.stride, spec.conv.padding, level,
                ),
                other => return Err(EngineError::unsupported_type(other)),
            }
            Ok(())
        }
    }
}

fn execute_inplace_with(level: SimdLevel, op: &OpKind, out: &mut Tensor, rest: &[&Tensor]) -> Result<()> {
    match op {
        OpKind::Add => {
            match out.dtype() {
                DType::F32 => ew::add_assign_f32(out.f32_mut()?, rest[0].f32()?, level),
                DType::F64 => ew::add_assign_f64(out.f64_mut()?, rest[0].f64()?, level),
                other => return Err(EngineError::unsupported_type(other)),
            }
            Ok(())
        }
        OpKind::Mul => {
            match out.dtype() {
                DType::F32 => ew::mul_assign_f32(out.f32_mut()?, rest[0].f32()?, level),
                DType::F64 => ew::mul_assign_f64(out.f64_mut()?, rest[0].f64()?, level),
                other => return Err(EngineError::unsupported_type(other)),
            }
            Ok(())
        }
        OpKind::Fma => {
            match out.dtype() {
                DType::F32 => ew::fma_assign_f32(out.f32_mut()?, rest[0].f32()?, rest[1].f32()?, level),
                DType::F64 => ew::fma_assign_f64(out.f64_mut()?, rest[0].f64()?, rest[1].f64()?, level),
                other => return Err(EngineError::unsupported_type(other)),
            }
            Ok(())
        }
        OpKind::Scale(spec) => {
            match out.dtype() {
                DType::F32 => ew::scale_assign_f32(out.f32_mut()?, spec.factor as f32, level),
                DType::F64 => ew::scale_assign_f64(out.f64_mut()?, spec.factor, level),
                other => return Err(EngineError::unsupported_type(other)),
            }
            Ok(())
        }
        OpKind::Neg => {
            match out.dtype() {
                DType::F32 => ew::neg_assign_f32(out.f32_mut()?, level),
                DType::F64 => ew::neg_assign_f64(out.f64_mut()?, level),
                other => return Err(EngineError::unsupported_type(other)),
            }
            Ok(())
        }
        OpKind::Relu => {
            match out.dtype() {
                DType::F32 => ew::relu_assign_f32(out.f32_mut()?, level),
                DType::F64 => ew::relu_assign_f64(out.f64_mut()?, level),
                other => return Err(EngineError::unsupported_type(other)),
            }
            Ok(())
        }
        OpKind::BiasAdd => {
            let (rows, cols) = {
                let d = out.shape().dims();
                (d[0], d[1])
            };
            match out.dtype() {
                DType::F32 => nn::bias_add_assign_f32(out.f32_mut()?, rest[0].f32()?, rows, cols, level),
                DType::F64 => nn::bias_add_assign_f64(out.f64_mut()?, rest[0].f64()?, rows, cols, level),
                other => return Err(EngineError::unsupported_type(other)),
            }
            Ok(())
        }
        OpKind::BatchNorm(spec) => {
            let (n, c, plane) = {
                let d = out.shape().dims();
                (d[0], d[1], d[2] * d[3])
            };
            match out.dtype() {
                DType::F32 => nn::batch_norm_assign_f32(
                    out.f32_mut()?, rest[0].f32()?, rest[1].f32()?, rest[2].f32()?, rest[3].f32()?,
                    spec.epsilon, n, c, plane, level,
                ),
                DType::F64 => nn::batch_norm_assign_f64(
                    out.f64_mut()?, rest[0].f64()?, rest[1].f64()?, rest[2].f64()?, rest[3].f64()?,
                    spec.epsilon, n, c, plane, level,
                ),
                other => return Err(EngineError::unsupported_type(other)),
            }
            Ok(())
        }
        other => Err(EngineError::runtime(format!(
            "{} cannot run in place",
            other.name()
        ))),
    }
}
