//! Relative-error accuracy check between a reference output and an engine
//! output. The comparison algorithm lives here; formatting and reporting
//! belong to the consumer.

use crate::error::{EngineError, Result};
use crate::tensor::{DType, Tensor};

/// Per-call accuracy summary.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ErrorStats {
    pub max_relative: f64,
    pub mean_relative: f64,
}

impl ErrorStats {
    /// Whether every element stayed inside the runtime's 0.1% budget.
    pub fn within_budget(&self) -> bool {
        self.max_relative <= 1e-3
    }
}

/// Computes per-element relative error and its max/mean. Exact zeros in the
/// reference compare by absolute error against the same threshold scale.
pub fn relative_error(reference: &Tensor, actual: &Tensor) -> Result<ErrorStats> {
    if reference.spec() != actual.spec() {
        return Err(EngineError::runtime(format!(
            "cannot compare {:?} against {:?}",
            reference.spec(),
            actual.spec()
        )));
    }
    let (mut max, mut sum) = (0.0f64, 0.0f64);
    let count = reference.num_elements().max(1);
    match reference.dtype() {
        DType::F32 => {
            for (&r, &a) in reference.f32()?.iter().zip(actual.f32()?) {
                let err = element_error(r as f64, a as f64);
                max = max.max(err);
                sum += err;
            }
        }
        DType::F64 => {
            for (&r, &a) in reference.f64()?.iter().zip(actual.f64()?) {
                let err = element_error(r, a);
                max = max.max(err);
                sum += err;
            }
        }
        other => return Err(EngineError::unsupported_type(other)),
    }
    Ok(ErrorStats {
        max_relative: max,
        mean_relative: sum / count as f64,
    })
}

fn element_error(reference: f64, actual: f64) -> f64 {
    let diff = (reference - actual).abs();
    if reference == 0.0 {
        diff
    } else {
        diff / reference.abs()
    }
}
