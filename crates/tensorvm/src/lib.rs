//! CPU-resident tensor execution runtime for pre-trained inference graphs.
//!
//! A graph is built once ([`graph::Graph`]), optimized once into an
//! immutable [`plan::ExecutionPlan`] ([`optimizer::Planner`]), and replayed
//! per inference call by the [`engine::Engine`], which is the only per-call
//! hot path. Kernels are dispatched through the [`kernel::KernelBackend`]
//! seam so a vectorized CPU backend and an accelerator offload are
//! interchangeable.

pub mod engine;
mod env;
pub mod error;
pub mod graph;
pub mod kernel;
pub mod optimizer;
pub mod plan;
pub mod pool;
pub mod profiling;
pub mod sync;
pub mod tensor;
pub mod validate;

pub use engine::{CancellationToken, Engine};
pub use error::{EngineError, OptimizationError, Result};
pub use graph::{Graph, NodeId, OpKind};
pub use kernel::KernelBackend;
pub use optimizer::Planner;
pub use plan::ExecutionPlan;
pub use tensor::{DType, Shape, Tensor, TensorSpec};

pub use env::force_scalar;
