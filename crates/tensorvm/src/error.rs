//! Error taxonomy shared by every stage of the runtime.

use thiserror::Error;

use crate::tensor::DType;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Top-level error taxonomy.
///
/// Construction-time and optimization-time errors surface synchronously to
/// the caller of the respective stage; execution-time errors abort only the
/// in-flight inference call, leaving the engine and plan reusable.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Pool and backing allocator are both exhausted. Fatal to the call,
    /// never to the process.
    #[error("out of memory: failed to allocate {requested} bytes")]
    OutOfMemory { requested: usize },

    /// A non-floating-point element type was requested at construction.
    #[error("unsupported element type {dtype:?}: tensors are restricted to f32 and f64")]
    UnsupportedType { dtype: DType },

    /// Shape, rank, or dependency-order violation while building the graph.
    /// The graph remains in its last valid state.
    #[error("invalid input: {message}")]
    InvalidInput { message: String },

    /// An optimizer pass detected an internal inconsistency. The pipeline
    /// aborts and the caller falls back to the unoptimized plan.
    #[error(transparent)]
    Optimization(#[from] OptimizationError),

    /// Shape or type mismatch discovered during execution. Fatal to that
    /// inference call only.
    #[error("runtime error: {message}")]
    Runtime { message: String },
}

impl EngineError {
    pub fn out_of_memory(requested: usize) -> Self {
        EngineError::OutOfMemory { requested }
    }

    pub fn unsupported_type(dtype: DType) -> Self {
        EngineError::UnsupportedType { dtype }
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        EngineError::InvalidInput {
            message: message.into(),
        }
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        EngineError::Runtime {
            message: message.into(),
        }
    }
}

/// Failure raised by an optimizer pass that found its own invariants broken,
/// e.g. a buffer-reuse candidate whose byte size does not match.
#[derive(Debug, Clone, Error)]
#[error("optimization aborted in pass '{pass}': {message}")]
pub struct OptimizationError {
    pub pass: &'static str,
    pub message: String,
}

impl OptimizationError {
    pub fn new(pass: &'static str, message: impl Into<String>) -> Self {
        OptimizationError {
            pass,
            message: message.into(),
        }
    }
}
