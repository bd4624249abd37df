use crate::error::OptimizationError;
use crate::graph::{ConvBnReluSpec, Graph, NodeId, OpKind};

use super::{GraphPass, OptimizeContext, PassResult};

/// Collapses adjacent single-consumer chains into one fused node:
/// Conv2d→BatchNorm→ReLU and MatMul→BiasAdd. Fusion is skipped whenever an
/// intermediate value has another consumer or is itself a marked output,
/// since its value is observably needed elsewhere.
#[derive(Default)]
pub struct OperatorFusionPass;

impl OperatorFusionPass {
    const NAME: &'static str = "operator_fusion";
}

impl GraphPass for OperatorFusionPass {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn run(
        &self,
        graph: &mut Graph,
        _cx: &mut OptimizeContext<'_>,
    ) -> Result<PassResult, OptimizationError> {
        let mut totals = PassResult::default();
        // Each rewrite invalidates the scan, so restart until a full sweep
        // finds nothing; the node count bounds the number of sweeps.
        loop {
            let Some(rewrite) = find_match(graph) else {
                break;
            };
            apply(graph, rewrite)?;
            totals.changed = true;
            totals.rewrites += 1;
        }
        Ok(totals)
    }
}

enum Rewrite {
    MatMulBias {
        matmul: NodeId,
        bias_add: NodeId,
    },
    ConvBnRelu {
        conv: NodeId,
        batch_norm: NodeId,
        relu: NodeId,
    },
}

/// A value may be fused through only when the next pattern node is its sole
/// observer: exactly one consumer edge and no output marking.
fn sole_consumer(graph: &Graph, id: NodeId) -> Option<NodeId> {
    if graph.outputs().contains(&id) {
        return None;
    }
    let consumers = graph.consumers(id);
    match consumers.as_slice() {
        [single] => Some(*single),
        _ => None,
    }
}

fn find_match(graph: &Graph) -> Option<Rewrite> {
    for node in graph.iter() {
        match node.kind {
            OpKind::MatMul => {
                let consumer = match sole_consumer(graph, node.id) {
                    Some(c) => c,
                    None => continue,
                };
                let next = graph.node(consumer)?;
                if matches!(next.kind, OpKind::BiasAdd) && next.inputs[0] == node.id {
                    return Some(Rewrite::MatMulBias {
                        matmul: node.id,
                        bias_add: next.id,
                    });
                }
            }
            OpKind::Conv2d(_) => {
                let bn_id = match sole_consumer(graph, node.id) {
                    Some(c) => c,
                    None => continue,
                };
                let bn = graph.node(bn_id)?;
                if !matches!(bn.kind, OpKind::BatchNorm(_)) || bn.inputs[0] != node.id {
                    continue;
                }
                let relu_id = match sole_consumer(graph, bn_id) {
                    Some(c) => c,
                    None => continue,
                };
                let relu = graph.node(relu_id)?;
                if matches!(relu.kind, OpKind::Relu) {
                    return Some(Rewrite::ConvBnRelu {
                        conv: node.id,
                        batch_norm: bn_id,
                        relu: relu_id,
                    });
                }
            }
            _ => {}
        }
    }
    None
}

fn apply(graph: &mut Graph, rewrite: Rewrite) -> Result<(), OptimizationError> {
    match rewrite {
        Rewrite::MatMulBias { matmul, bias_add } => {
            let (a, b) = {
                let node = expect(graph, matmul)?;
                (node.inputs[0], node.inputs[1])
            };
            let (bias, spec) = {
                let node = expect(graph, bias_add)?;
                (node.inputs[1], node.spec.clone())
            };
            graph.replace_chain(&[matmul, bias_add], OpKind::MatMulBias, &[a, b, bias], spec);
        }
        Rewrite::ConvBnRelu {
            conv,
            batch_norm,
            relu,
        } => {
            let (x, w, conv_spec) = {
                let node = expect(graph, conv)?;
                let conv_spec = match node.kind {
                    OpKind::Conv2d(spec) => spec,
                    _ => {
                        return Err(OptimizationError::new(
                            OperatorFusionPass::NAME,
                            "conv candidate changed kind mid-rewrite",
                        ))
                    }
                };
                (node.inputs[0], node.inputs[1], conv_spec)
            };
            let (params, epsilon) = {
                let node = expect(graph, batch_norm)?;
                let epsilon = match node.kind {
                    OpKind::BatchNorm(spec) => spec.epsilon,
                    _ => {
                        return Err(OptimizationError::new(
                            OperatorFusionPass::NAME,
                            "batch-norm candidate changed kind mid-rewrite",
                        ))
                    }
                };
                (
                    [node.inputs[1], node.inputs[2], node.inputs[3], node.inputs[4]],
                    epsilon,
                )
            };
            let spec = expect(graph, relu)?.spec.clone();
            graph.replace_chain(
                &[conv, batch_norm, relu],
                OpKind::ConvBnRelu(ConvBnReluSpec {
                    conv: conv_spec,
                    epsilon,
                }),
                &[x, w, params[0], params[1], params[2], params[3]],
                spec,
            );
        }
    }
    Ok(())
}

fn expect<'g>(
    graph: &'g Graph,
    id: NodeId,
) -> Result<&'g crate::graph::Node, OptimizationError> {
    graph.node(id).ok_or_else(|| {
        OptimizationError::new(
            OperatorFusionPass::NAME,
            format!("pattern node {:?} vanished mid-rewrite", id),
        )
    })
}
