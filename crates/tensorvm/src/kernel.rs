//! Kernel-dispatch contract between the engine and its executors.
//!
//! The engine holds one backend, chosen at startup; an accelerator offload
//! implements the same trait with a different engine beneath. Backends
//! receive validated, contiguous tensors and write into a caller-provided
//! output.

use crate::error::{EngineError, Result};
use crate::graph::{self, OpKind};
use crate::tensor::Tensor;

/// Executor for individual node kernels.
///
/// `execute` computes `op` over `inputs` into `out`. `execute_inplace` is
/// the buffer-reuse variant: `out` arrives holding the first operand's
/// payload and is overwritten elementwise; it is only invoked for operators
/// whose [`OpKind::supports_inplace_first_input`] is true.
pub trait KernelBackend: Send + Sync {
    fn name(&self) -> &'static str;

    fn execute(&self, op: &OpKind, inputs: &[&Tensor], out: &mut Tensor) -> Result<()>;

    fn execute_inplace(&self, op: &OpKind, out: &mut Tensor, rest: &[&Tensor]) -> Result<()>;
}

/// Re-checks the operator contract at execution time. Construction-time
/// validation already ran, but plans can be replayed against arbitrary
/// caller inputs, so a mismatch here is a `RuntimeError` rather than an
/// `InvalidInput`.
pub fn validate_execution(op: &OpKind, inputs: &[&Tensor], out: &Tensor) -> Result<()> {
    if inputs.len() != op.arity() {
        return Err(EngineError::runtime(format!(
            "{} expects {} inputs, got {}",
            op.name(),
            op.arity(),
            inputs.len()
        )));
    }
    let specs: Vec<_> = inputs.iter().map(|t| t.spec()).collect();
    let inferred = graph::infer_spec(op, &specs).map_err(|err| match err {
        EngineError::InvalidInput { message } => EngineError::runtime(message),
        other => other,
    })?;
    if &inferred != out.spec() {
        return Err(EngineError::runtime(format!(
            "{} produces {:?}, output tensor is {:?}",
            op.name(),
            inferred,
            out.spec()
        )));
    }
    Ok(())
}

/// Validation for the in-place variant: the output doubles as the first
/// operand, so the full operand list is reconstructed around it.
pub fn validate_inplace(op: &OpKind, out: &Tensor, rest: &[&Tensor]) -> Result<()> {
    if !op.supports_inplace_first_input() {
        return Err(EngineError::runtime(format!(
            "{} cannot run in place",
            op.name()
        )));
    }
    let mut specs = Vec::with_capacity(rest.len() + 1);
    specs.push(out.spec());
    specs.extend(rest.iter().map(|t| t.spec()));
    let inferred = graph::infer_spec(op, &specs).map_err(|err| match err {
        EngineError::InvalidInput { message } => EngineError::runtime(message),
        other => other,
    })?;
    if &inferred != out.spec() {
        return Err(EngineError::runtime(format!(
            "{} in-place output {:?} does not match inferred {:?}",
            op.name(),
            out.spec(),
            inferred
        )));
    }
    Ok(())
}
