//! Immutable execution plans and the process-wide plan cache.
//!
//! A plan is a read-only recipe: a topologically ordered step list plus the
//! buffer-reuse assignment resolved by the optimizer. One plan may be
//! replayed concurrently by any number of inference calls, each with its
//! own per-call buffer set. Plans for structurally identical graphs are
//! reused through an LRU cache keyed by a canonicalized graph signature.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use lru::LruCache;
use once_cell::sync::Lazy;
use serde::Serialize;

use crate::env;
use crate::error::{EngineError, Result};
use crate::graph::{Graph, NodeId, OpKind};
use crate::profiling;
use crate::tensor::TensorSpec;

const DEFAULT_PLAN_CACHE_CAPACITY: usize = 64;

static PLAN_CACHE: Lazy<Mutex<LruCache<u64, Arc<ExecutionPlan>>>> = Lazy::new(|| {
    let capacity = env::plan_cache_capacity().unwrap_or(DEFAULT_PLAN_CACHE_CAPACITY);
    Mutex::new(LruCache::new(
        NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::new(1).unwrap()),
    ))
});

pub(crate) fn cached_plan(key: u64) -> Option<Arc<ExecutionPlan>> {
    let mut cache = PLAN_CACHE.lock().expect("plan cache poisoned");
    let hit = cache.get(&key).cloned();
    if hit.is_some() {
        profiling::cache_event("plan_cache_hit");
    }
    hit
}

pub(crate) fn insert_cached_plan(key: u64, plan: Arc<ExecutionPlan>) {
    let mut cache = PLAN_CACHE.lock().expect("plan cache poisoned");
    if cache.put(key, plan).is_some() {
        profiling::cache_event("plan_cache_replace");
    }
}

/// One scheduled node invocation.
#[derive(Debug, Clone)]
pub struct PlanStep {
    /// Originating graph node, for diagnostics.
    pub node: NodeId,
    pub kind: OpKind,
    /// Operand positions resolved to producing step indices.
    pub inputs: Vec<usize>,
    pub spec: TensorSpec,
    /// Operand position whose (dying) buffer this step's output may alias.
    pub reuse_input: Option<usize>,
    /// Total consuming operand references; drives per-call buffer release.
    pub uses: usize,
    /// Distinct consumer steps to notify on completion.
    pub dependents: Vec<usize>,
    /// Distinct producer steps this step waits for.
    pub indegree: usize,
    /// Positions in the plan's output list produced by this step.
    pub output_positions: Vec<usize>,
}

/// Ordered, buffer-reuse-annotated recipe for running a graph.
#[derive(Debug)]
pub struct ExecutionPlan {
    steps: Vec<PlanStep>,
    outputs: Vec<usize>,
    /// Caller input index -> step index, for inputs surviving optimization.
    input_bindings: Vec<(usize, usize)>,
    input_count: usize,
    optimized: bool,
}

impl ExecutionPlan {
    /// Freezes a scheduled graph into a plan. `order` must be a topological
    /// order over exactly the graph's nodes; `reuse` maps node ids to the
    /// operand position whose buffer the node may alias.
    pub(crate) fn compile(
        graph: &Graph,
        order: &[NodeId],
        reuse: &HashMap<NodeId, usize>,
        optimized: bool,
    ) -> Result<Arc<ExecutionPlan>> {
        if order.len() != graph.len() {
            return Err(EngineError::runtime(format!(
                "schedule covers {} of {} nodes",
                order.len(),
                graph.len()
            )));
        }
        let mut step_of: HashMap<NodeId, usize> = HashMap::with_capacity(order.len());
        let mut steps: Vec<PlanStep> = Vec::with_capacity(order.len());
        for (index, &id) in order.iter().enumerate() {
            let node = graph
                .node(id)
                .ok_or_else(|| EngineError::runtime(format!("scheduled node {:?} missing", id)))?;
            let mut inputs = Vec::with_capacity(node.inputs.len());
            for &input in &node.inputs {
                let producer = *step_of.get(&input).ok_or_else(|| {
                    EngineError::runtime(format!(
                        "node {:?} scheduled before its producer {:?}",
                        id, input
                    ))
                })?;
                inputs.push(producer);
            }
            step_of.insert(id, index);
            steps.push(PlanStep {
                node: id,
                kind: node.kind.clone(),
                inputs,
                spec: node.spec.clone(),
                reuse_input: reuse.get(&id).copied(),
                uses: 0,
                dependents: Vec::new(),
                indegree: 0,
                output_positions: Vec::new(),
            });
        }

        // Edge bookkeeping: operand references drive buffer lifetimes,
        // distinct producer/consumer pairs drive scheduling.
        for index in 0..steps.len() {
            let inputs = steps[index].inputs.clone();
            let mut distinct = inputs.clone();
            distinct.sort_unstable();
            distinct.dedup();
            steps[index].indegree = distinct.len();
            for producer in inputs {
                steps[producer].uses += 1;
            }
            for producer in distinct {
                steps[producer].dependents.push(index);
            }
        }

        let mut outputs = Vec::with_capacity(graph.outputs().len());
        for (position, id) in graph.outputs().iter().enumerate() {
            let step = *step_of
                .get(id)
                .ok_or_else(|| EngineError::runtime(format!("output {:?} not scheduled", id)))?;
            outputs.push(step);
            steps[step].output_positions.push(position);
        }

        let mut input_bindings = Vec::new();
        for (index, step) in steps.iter().enumerate() {
            if let OpKind::Input { index: input_index } = step.kind {
                input_bindings.push((input_index, index));
            }
        }

        Ok(Arc::new(ExecutionPlan {
            steps,
            outputs,
            input_bindings,
            input_count: graph.input_count(),
            optimized,
        }))
    }

    pub fn steps(&self) -> &[PlanStep] {
        &self.steps
    }

    pub fn outputs(&self) -> &[usize] {
        &self.outputs
    }

    pub fn input_bindings(&self) -> &[(usize, usize)] {
        &self.input_bindings
    }

    /// Number of inputs a call must supply (declared on the source graph,
    /// even when some were eliminated as dead).
    pub fn input_count(&self) -> usize {
        self.input_count
    }

    /// False when this plan is the unoptimized fallback.
    pub fn is_optimized(&self) -> bool {
        self.optimized
    }

    /// Steps whose output buffer aliases a dead input, for tests and
    /// diagnostics.
    pub fn reuse_count(&self) -> usize {
        self.steps.iter().filter(|s| s.reuse_input.is_some()).count()
    }
}

// --- graph signatures -------------------------------------------------------

#[derive(Serialize)]
enum SigOp {
    Input { index: usize },
    Constant { byte_len: usize, byte_hash: u64 },
    Add,
    Mul,
    Fma,
    Scale { factor_bits: u64 },
    Neg,
    Relu,
    MatMul,
    BiasAdd,
    Conv2d { stride: (usize, usize), padding: (usize, usize) },
    BatchNorm { epsilon_bits: u64 },
    MatMulBias,
    ConvBnRelu { stride: (usize, usize), padding: (usize, usize), epsilon_bits: u64 },
}

#[derive(Serialize)]
struct SigNode {
    op: SigOp,
    inputs: Vec<u32>,
    spec: TensorSpec,
}

#[derive(Serialize)]
struct SigGraph {
    nodes: Vec<SigNode>,
    outputs: Vec<u32>,
    input_count: usize,
}

/// Deterministic structural signature: node ids are renumbered densely in
/// id order, constant payloads are folded in as a byte hash.
pub fn signature(graph: &Graph) -> Result<u64> {
    let mut dense: HashMap<NodeId, u32> = HashMap::with_capacity(graph.len());
    let mut nodes = Vec::with_capacity(graph.len());
    for node in graph.iter() {
        let canon = dense.len() as u32;
        dense.insert(node.id, canon);
        let op = match &node.kind {
            OpKind::Input { index } => SigOp::Input { index: *index },
            OpKind::Constant(value) => SigOp::Constant {
                byte_len: value.byte_len(),
                byte_hash: fnv1a_hash(value.bytes()),
            },
            OpKind::Add => SigOp::Add,
            OpKind::Mul => SigOp::Mul,
            OpKind::Fma => SigOp::Fma,
            OpKind::Scale(spec) => SigOp::Scale {
                factor_bits: spec.factor.to_bits(),
            },
            OpKind::Neg => SigOp::Neg,
            OpKind::Relu => SigOp::Relu,
            OpKind::MatMul => SigOp::MatMul,
            OpKind::BiasAdd => SigOp::BiasAdd,
            OpKind::Conv2d(spec) => SigOp::Conv2d {
                stride: spec.stride,
                padding: spec.padding,
            },
            OpKind::BatchNorm(spec) => SigOp::BatchNorm {
                epsilon_bits: spec.epsilon.to_bits(),
            },
            OpKind::MatMulBias => SigOp::MatMulBias,
            OpKind::ConvBnRelu(spec) => SigOp::ConvBnRelu {
                stride: spec.conv.stride,
                padding: spec.conv.padding,
                epsilon_bits: spec.epsilon.to_bits(),
            },
        };
        let inputs = node
            .inputs
            .iter()
            .map(|input| {
                dense.get(input).copied().ok_or_else(|| {
                    EngineError::invalid_input(format!(
                        "node {:?} consumes {:?} which precedes no definition",
                        node.id, input
                    ))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        nodes.push(SigNode {
            op,
            inputs,
            spec: node.spec.clone(),
        });
    }
    let outputs = graph
        .outputs()
        .iter()
        .map(|id| {
            dense.get(id).copied().ok_or_else(|| {
                EngineError::invalid_input(format!("marked output {:?} is not in the graph", id))
            })
        })
        .collect::<Result<Vec<_>>>()?;
    let sig = SigGraph {
        nodes,
        outputs,
        input_count: graph.input_count(),
    };
    let bytes = bincode::serialize(&sig)
        .map_err(|err| EngineError::runtime(format!("signature serialization failed: {err}")))?;
    Ok(fnv1a_hash(&bytes))
}

/// FNV-1a over a byte slice.
pub fn fnv1a_hash(bytes: &[u8]) -> u64 {
    let mut hash = 0xcbf2_9ce4_8422_2325u64;
    for &byte in bytes {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::{DType, Shape, Tensor};

    #[test]
    fn signature_is_structural() {
        let build = || {
            let mut graph = Graph::new();
            let a = graph.add_input(DType::F32, Shape::from([2, 2])).unwrap();
            let b = graph.add_constant(Tensor::from_f32([2, 2], &[1.0; 4]).unwrap());
            let sum = graph.add_node(OpKind::Add, &[a, b]).unwrap();
            graph.mark_output(sum).unwrap();
            graph
        };
        assert_eq!(signature(&build()).unwrap(), signature(&build()).unwrap());

        let mut other = build();
        let two = other.add_constant(Tensor::from_f32([2, 2], &[2.0; 4]).unwrap());
        let out = other.outputs()[0];
        let prod = other.add_node(OpKind::Mul, &[out, two]).unwrap();
        other.mark_output(prod).unwrap();
        assert_ne!(signature(&build()).unwrap(), signature(&other).unwrap());
    }
}
