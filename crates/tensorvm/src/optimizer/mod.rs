//! Optimizer pipeline: a fixed, ordered sequence of passes over the graph
//! IR, each total and each leaving a valid DAG behind.
//!
//! A pass that detects an internal inconsistency aborts the whole
//! optimization; the planner then falls back to the unoptimized plan and
//! reports the error to the caller instead of hiding it.

mod dce;
mod fold;
mod fusion;
mod memory_plan;
mod schedule;

use std::collections::HashMap;
use std::sync::Arc;

use crate::env;
use crate::error::{OptimizationError, Result};
use crate::graph::{Graph, NodeId};
use crate::kernel::KernelBackend;
use crate::plan::{self, ExecutionPlan};
use crate::profiling;

pub use dce::DeadCodeEliminationPass;
pub use fold::ConstantFoldingPass;
pub use fusion::OperatorFusionPass;
pub use memory_plan::MemoryPlanningPass;
pub use schedule::TopologicalSchedulePass;

/// Statistics returned by a pass after it runs.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PassResult {
    /// Whether the pass changed the IR or produced a planning artifact.
    pub changed: bool,
    /// Nodes rewritten (folded or fused).
    pub rewrites: usize,
    /// Nodes removed.
    pub erased: usize,
}

impl PassResult {
    /// Merges two run results, accumulating statistics.
    pub fn merge(self, other: PassResult) -> PassResult {
        PassResult {
            changed: self.changed || other.changed,
            rewrites: self.rewrites + other.rewrites,
            erased: self.erased + other.erased,
        }
    }
}

/// Mutable state threaded through the pipeline: the evaluating backend plus
/// the artifacts later frozen into the [`ExecutionPlan`].
pub struct OptimizeContext<'a> {
    pub backend: &'a dyn KernelBackend,
    /// Node -> operand position whose dead buffer the node may alias.
    pub reuse: HashMap<NodeId, usize>,
    /// Final topological order, produced by the scheduling pass.
    pub schedule: Option<Vec<NodeId>>,
}

impl<'a> OptimizeContext<'a> {
    pub fn new(backend: &'a dyn KernelBackend) -> Self {
        OptimizeContext {
            backend,
            reuse: HashMap::new(),
            schedule: None,
        }
    }
}

/// Canonical interface implemented by optimization passes.
pub trait GraphPass: Send + Sync {
    fn name(&self) -> &'static str;
    fn run(
        &self,
        graph: &mut Graph,
        cx: &mut OptimizeContext<'_>,
    ) -> std::result::Result<PassResult, OptimizationError>;
}

/// Outcome of planning: the plan to replay, plus the error that forced a
/// fallback to the unoptimized plan, when one did.
pub struct PlanOutcome {
    pub plan: Arc<ExecutionPlan>,
    pub fallback: Option<OptimizationError>,
    pub cache_hit: bool,
}

/// Owns the fixed pass pipeline and the plan-cache lookup.
pub struct Planner {
    passes: Vec<Box<dyn GraphPass>>,
}

impl Planner {
    /// The default pipeline in specification order: fold, eliminate, fuse,
    /// plan memory, schedule.
    pub fn new() -> Self {
        Planner {
            passes: vec![
                Box::new(ConstantFoldingPass::default()),
                Box::new(DeadCodeEliminationPass::default()),
                Box::new(OperatorFusionPass::default()),
                Box::new(MemoryPlanningPass::default()),
                Box::new(TopologicalSchedulePass::default()),
            ],
        }
    }

    /// Optimizes `graph` into an execution plan, consulting the process-wide
    /// plan cache first. The input graph is left untouched; passes run on a
    /// working copy. On an optimization failure the unoptimized plan is
    /// returned together with the reported error.
    pub fn plan(&self, graph: &Graph, backend: &dyn KernelBackend) -> Result<PlanOutcome> {
        let key = plan::signature(graph)?;
        if let Some(plan) = plan::cached_plan(key) {
            return Ok(PlanOutcome {
                plan,
                fallback: None,
                cache_hit: true,
            });
        }

        let mut working = graph.clone();
        let mut cx = OptimizeContext::new(backend);
        match self.run_passes(&mut working, &mut cx) {
            Ok(_stats) => {
                let order = match cx.schedule.take() {
                    Some(order) => order,
                    None => {
                        return self.fallback(
                            graph,
                            OptimizationError::new("pipeline", "scheduling produced no order"),
                        )
                    }
                };
                match ExecutionPlan::compile(&working, &order, &cx.reuse, true) {
                    Ok(plan) => {
                        plan::insert_cached_plan(key, Arc::clone(&plan));
                        Ok(PlanOutcome {
                            plan,
                            fallback: None,
                            cache_hit: false,
                        })
                    }
                    Err(err) => self.fallback(
                        graph,
                        OptimizationError::new("compile", err.to_string()),
                    ),
                }
            }
            Err(err) => self.fallback(graph, err),
        }
    }

    /// Runs every pass once, in order, accumulating statistics. Exposed so
    /// idempotence can be asserted by running the pipeline twice.
    pub fn run_passes(
        &self,
        graph: &mut Graph,
        cx: &mut OptimizeContext<'_>,
    ) -> std::result::Result<PassResult, OptimizationError> {
        let mut totals = PassResult::default();
        for pass in &self.passes {
            let _scope = profiling::scope(profiling::ScopeKind::Pass, pass.name());
            let stats = pass.run(graph, cx)?;
            if env::pass_stats_enabled() {
                profiling::cache_event(pass.name());
            }
            totals = totals.merge(stats);
        }
        Ok(totals)
    }

    /// Builds the unoptimized plan: insertion order (a valid topological
    /// order by construction), no buffer reuse.
    pub fn plan_unoptimized(&self, graph: &Graph) -> Result<Arc<ExecutionPlan>> {
        let order: Vec<NodeId> = graph.iter().map(|node| node.id).collect();
        ExecutionPlan::compile(graph, &order, &HashMap::new(), false)
    }

    fn fallback(&self, graph: &Graph, err: OptimizationError) -> Result<PlanOutcome> {
        profiling::cache_event("optimizer_fallback");
        let plan = self.plan_unoptimized(graph)?;
        Ok(PlanOutcome {
            plan,
            fallback: Some(err),
            cache_hit: false,
        })
    }
}

impl Default for Planner {
    fn default() -> Self {
        Self::new()
    }
}
