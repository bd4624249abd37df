use crate::env;
use crate::error::OptimizationError;
use crate::graph::{Graph, NodeId, OpKind};
use crate::tensor::Tensor;

use super::{GraphPass, OptimizeContext, PassResult};

/// Replaces every node whose inputs are all compile-time constants with a
/// single constant node holding the precomputed result. Runs to a bounded
/// fixed point so chains of constant operators collapse fully.
#[derive(Default)]
pub struct ConstantFoldingPass;

impl ConstantFoldingPass {
    const NAME: &'static str = "constant_fold";
}

impl GraphPass for ConstantFoldingPass {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn run(
        &self,
        graph: &mut Graph,
        cx: &mut OptimizeContext<'_>,
    ) -> Result<PassResult, OptimizationError> {
        let mut totals = PassResult::default();
        for _ in 0..env::fold_iters() {
            let foldable = collect_foldable(graph);
            if foldable.is_empty() {
                break;
            }
            for id in foldable {
                let value = evaluate(graph, id, cx)?;
                graph.replace_with_constant(id, value);
                totals.changed = true;
                totals.rewrites += 1;
            }
        }
        Ok(totals)
    }
}

fn collect_foldable(graph: &Graph) -> Vec<NodeId> {
    graph
        .iter()
        .filter(|node| {
            !matches!(node.kind, OpKind::Constant(_) | OpKind::Input { .. })
                && !node.inputs.is_empty()
                && node.inputs.iter().all(|input| {
                    matches!(
                        graph.node(*input).map(|n| &n.kind),
                        Some(OpKind::Constant(_))
                    )
                })
        })
        .map(|node| node.id)
        .collect()
}

fn evaluate(
    graph: &Graph,
    id: NodeId,
    cx: &mut OptimizeContext<'_>,
) -> Result<Tensor, OptimizationError> {
    let node = graph
        .node(id)
        .ok_or_else(|| OptimizationError::new(ConstantFoldingPass::NAME, "folded node vanished"))?;
    let mut operands = Vec::with_capacity(node.inputs.len());
    for input in &node.inputs {
        match graph.node(*input).map(|n| &n.kind) {
            Some(OpKind::Constant(value)) => operands.push(value.as_ref().clone()),
            _ => {
                return Err(OptimizationError::new(
                    ConstantFoldingPass::NAME,
                    format!("operand {:?} of {:?} is not constant", input, id),
                ))
            }
        }
    }
    let operand_refs: Vec<&Tensor> = operands.iter().collect();
    let mut out = Tensor::zeros(node.spec.clone()).map_err(|err| {
        OptimizationError::new(ConstantFoldingPass::NAME, err.to_string())
    })?;
    cx.backend
        .execute(&node.kind, &operand_refs, &mut out)
        .map_err(|err| OptimizationError::new(ConstantFoldingPass::NAME, err.to_string()))?;
    Ok(out)
}
