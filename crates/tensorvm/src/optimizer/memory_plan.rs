use std::collections::HashMap;

use crate::error::OptimizationError;
use crate::graph::{Graph, NodeId, OpKind};

use super::{GraphPass, OptimizeContext, PassResult};

/// Builds the buffer-reuse table: a node may write its output over its
/// first operand's buffer when that operand dies at this node and the byte
/// layout matches exactly. The table is consumed by the execution engine,
/// which still falls back to a fresh allocation when the buffer turns out
/// to be shared at run time.
#[derive(Default)]
pub struct MemoryPlanningPass;

impl MemoryPlanningPass {
    const NAME: &'static str = "memory_plan";
}

impl GraphPass for MemoryPlanningPass {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn run(
        &self,
        graph: &mut Graph,
        cx: &mut OptimizeContext<'_>,
    ) -> Result<PassResult, OptimizationError> {
        // Iteration is in id order, which is topological, so the final
        // writer into `last_consumer` is the true last use.
        let mut last_consumer: HashMap<NodeId, NodeId> = HashMap::with_capacity(graph.len());
        for node in graph.iter() {
            for &input in &node.inputs {
                last_consumer.insert(input, node.id);
            }
        }

        let mut entries = 0;
        for node in graph.iter() {
            if !node.kind.supports_inplace_first_input() {
                continue;
            }
            let candidate = node.inputs[0];
            // The producing buffer must die here, feed this node exactly
            // once, and not be observable elsewhere.
            if last_consumer.get(&candidate) != Some(&node.id) {
                continue;
            }
            if node.inputs.iter().filter(|&&input| input == candidate).count() != 1 {
                continue;
            }
            if graph.outputs().contains(&candidate) {
                continue;
            }
            let producer = graph.node(candidate).ok_or_else(|| {
                OptimizationError::new(
                    Self::NAME,
                    format!("reuse candidate {:?} is not in the graph", candidate),
                )
            })?;
            // Constants are shared across calls and inputs belong to the
            // caller; neither buffer is ours to overwrite.
            if matches!(producer.kind, OpKind::Constant(_) | OpKind::Input { .. }) {
                continue;
            }
            if producer.spec.dtype != node.spec.dtype
                || producer.spec.byte_len() != node.spec.byte_len()
            {
                return Err(OptimizationError::new(
                    Self::NAME,
                    format!(
                        "reuse candidate {:?} ({:?}) does not match output of {:?} ({:?})",
                        candidate, producer.spec, node.id, node.spec
                    ),
                ));
            }
            cx.reuse.insert(node.id, 0);
            entries += 1;
        }

        Ok(PassResult {
            changed: entries > 0,
            rewrites: entries,
            erased: 0,
        })
    }
}
