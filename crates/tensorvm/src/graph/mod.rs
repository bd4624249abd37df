//! Computation graph IR: a DAG of operator nodes and tensor-producing edges.
//!
//! Construction enforces DAG order — a node may only consume outputs that
//! already exist, so forward references (and therefore cycles) are rejected
//! at `add_node` time. Node identity is stable across optimization passes:
//! replacement allocates a fresh id and retires the old one, which is never
//! reused.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use smallvec::SmallVec;

use crate::error::{EngineError, Result};
use crate::tensor::{DType, Shape, Tensor, TensorSpec};

/// Stable handle to a graph node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct NodeId(pub u32);

/// Input edge list; fan-in is small and fixed per operator.
pub type NodeInputs = SmallVec<[NodeId; 4]>;

/// Spatial attributes for direct 2-D convolution over NCHW data.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Conv2dSpec {
    pub stride: (usize, usize),
    pub padding: (usize, usize),
}

/// Inference-form batch normalization attributes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BatchNormSpec {
    pub epsilon: f64,
}

/// Uniform scaling attribute.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ScaleSpec {
    pub factor: f64,
}

/// Combined attributes of a fused Conv→BatchNorm→ReLU node.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ConvBnReluSpec {
    pub conv: Conv2dSpec,
    pub epsilon: f64,
}

/// Operator kind plus operator-specific attributes.
#[derive(Debug, Clone)]
pub enum OpKind {
    /// Caller-supplied tensor, bound positionally at `run` time.
    Input { index: usize },
    /// Compile-time-known value.
    Constant(Arc<Tensor>),
    /// Elementwise sum of two identically shaped tensors.
    Add,
    /// Elementwise product of two identically shaped tensors.
    Mul,
    /// Elementwise `a * b + c` over three identically shaped tensors.
    Fma,
    /// Elementwise multiplication by a constant factor.
    Scale(ScaleSpec),
    /// Elementwise negation.
    Neg,
    /// Elementwise `max(x, 0)`.
    Relu,
    /// Rank-2 matrix product `[m,k] x [k,n]`.
    MatMul,
    /// Adds a `[n]` bias row to every row of a `[m,n]` operand.
    BiasAdd,
    /// Direct convolution over `[n,c,h,w]` with `[o,c,kh,kw]` filters.
    Conv2d(Conv2dSpec),
    /// Inference batch normalization; expects gamma/beta/mean/var vectors.
    BatchNorm(BatchNormSpec),
    /// Fused MatMul→BiasAdd.
    MatMulBias,
    /// Fused Conv→BatchNorm→ReLU.
    ConvBnRelu(ConvBnReluSpec),
}

impl OpKind {
    pub fn name(&self) -> &'static str {
        match self {
            OpKind::Input { .. } => "input",
            OpKind::Constant(_) => "constant",
            OpKind::Add => "add",
            OpKind::Mul => "mul",
            OpKind::Fma => "fma",
            OpKind::Scale(_) => "scale",
            OpKind::Neg => "neg",
            OpKind::Relu => "relu",
            OpKind::MatMul => "matmul",
            OpKind::BiasAdd => "bias_add",
            OpKind::Conv2d(_) => "conv2d",
            OpKind::BatchNorm(_) => "batch_norm",
            OpKind::MatMulBias => "matmul_bias",
            OpKind::ConvBnRelu(_) => "conv_bn_relu",
        }
    }

    /// Number of input edges the operator requires.
    pub fn arity(&self) -> usize {
        match self {
            OpKind::Input { .. } | OpKind::Constant(_) => 0,
            OpKind::Scale(_) | OpKind::Neg | OpKind::Relu => 1,
            OpKind::Add | OpKind::Mul | OpKind::MatMul | OpKind::BiasAdd => 2,
            OpKind::Fma | OpKind::MatMulBias => 3,
            OpKind::Conv2d(_) => 2,
            OpKind::BatchNorm(_) => 5,
            OpKind::ConvBnRelu(_) => 6,
        }
    }

    /// Whether the kernel may write its output over its first input's
    /// buffer. True exactly for the operators whose output element `i`
    /// depends only on input element `i` of the first operand.
    pub fn supports_inplace_first_input(&self) -> bool {
        matches!(
            self,
            OpKind::Add
                | OpKind::Mul
                | OpKind::Fma
                | OpKind::Scale(_)
                | OpKind::Neg
                | OpKind::Relu
                | OpKind::BiasAdd
                | OpKind::BatchNorm(_)
        )
    }
}

/// One operation node: kind, input edges, and the produced value descriptor.
#[derive(Debug, Clone)]
pub struct Node {
    pub id: NodeId,
    pub kind: OpKind,
    pub inputs: NodeInputs,
    pub spec: TensorSpec,
}

/// The dataflow DAG. Iteration order is id order, which coincides with
/// insertion order and is itself a valid topological order.
#[derive(Debug, Default, Clone)]
pub struct Graph {
    nodes: BTreeMap<NodeId, Node>,
    outputs: Vec<NodeId>,
    input_count: usize,
    next_id: u32,
}

impl Graph {
    pub fn new() -> Self {
        Graph::default()
    }

    /// Declares a caller-bound input value.
    pub fn add_input(&mut self, dtype: DType, shape: Shape) -> Result<NodeId> {
        if !dtype.is_supported() {
            return Err(EngineError::unsupported_type(dtype));
        }
        let index = self.input_count;
        self.input_count += 1;
        let spec = TensorSpec::new(dtype, shape);
        Ok(self.insert(OpKind::Input { index }, NodeInputs::new(), spec))
    }

    /// Embeds a compile-time-known tensor.
    pub fn add_constant(&mut self, value: Tensor) -> NodeId {
        let spec = value.spec().clone();
        self.insert(OpKind::Constant(Arc::new(value)), NodeInputs::new(), spec)
    }

    /// Appends an operation node consuming previously created outputs.
    ///
    /// Fails with `InvalidInput` when an input id does not name an existing
    /// node (forward references included) or when the operand shapes do not
    /// satisfy the operator contract. The graph is unchanged on failure.
    pub fn add_node(&mut self, kind: OpKind, inputs: &[NodeId]) -> Result<NodeId> {
        if matches!(kind, OpKind::Input { .. } | OpKind::Constant(_)) {
            return Err(EngineError::invalid_input(format!(
                "{} nodes are created through their dedicated constructors",
                kind.name()
            )));
        }
        if inputs.len() != kind.arity() {
            return Err(EngineError::invalid_input(format!(
                "{} expects {} inputs, got {}",
                kind.name(),
                kind.arity(),
                inputs.len()
            )));
        }
        let mut input_specs = Vec::with_capacity(inputs.len());
        for &input in inputs {
            let node = self.nodes.get(&input).ok_or_else(|| {
                EngineError::invalid_input(format!(
                    "input {:?} does not name an existing node output",
                    input
                ))
            })?;
            input_specs.push(&node.spec);
        }
        let spec = infer_spec(&kind, &input_specs)?;
        Ok(self.insert(kind, inputs.iter().copied().collect(), spec))
    }

    /// Designates a node whose value must survive dead-code elimination.
    pub fn mark_output(&mut self, id: NodeId) -> Result<()> {
        if !self.nodes.contains_key(&id) {
            return Err(EngineError::invalid_input(format!(
                "cannot mark unknown node {:?} as output",
                id
            )));
        }
        if !self.outputs.contains(&id) {
            self.outputs.push(id);
        }
        Ok(())
    }

    pub fn outputs(&self) -> &[NodeId] {
        &self.outputs
    }

    /// Number of declared inputs, including any later eliminated as dead.
    pub fn input_count(&self) -> usize {
        self.input_count
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(&id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Nodes in id order (a valid topological order by construction).
    pub fn iter(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    /// Producer ids feeding `id`.
    pub fn producers(&self, id: NodeId) -> &[NodeId] {
        self.nodes
            .get(&id)
            .map(|node| node.inputs.as_slice())
            .unwrap_or(&[])
    }

    /// Ids of every node consuming `id`, in id order. Repeated edges are
    /// reported once per occurrence.
    pub fn consumers(&self, id: NodeId) -> Vec<NodeId> {
        let mut consumers = Vec::new();
        for node in self.nodes.values() {
            for &input in &node.inputs {
                if input == id {
                    consumers.push(node.id);
                }
            }
        }
        consumers
    }

    fn insert(&mut self, kind: OpKind, inputs: NodeInputs, spec: TensorSpec) -> NodeId {
        let id = NodeId(self.next_id);
        self.next_id += 1;
        self.nodes.insert(
            id,
            Node {
                id,
                kind,
                inputs,
                spec,
            },
        );
        id
    }

    /// Replaces `old` with a fresh constant node: consumers are re-pointed,
    /// output markings transferred, and the original id retired.
    pub(crate) fn replace_with_constant(&mut self, old: NodeId, value: Tensor) -> NodeId {
        let replacement = self.add_constant(value);
        self.rewire(old, replacement);
        self.nodes.remove(&old);
        replacement
    }

    /// Collapses a producer chain into one fused node. The fused node takes
    /// the given inputs, inherits the tail's output spec and markings, and
    /// the whole chain is retired.
    pub(crate) fn replace_chain(
        &mut self,
        chain: &[NodeId],
        kind: OpKind,
        inputs: &[NodeId],
        spec: TensorSpec,
    ) -> NodeId {
        let tail = *chain.last().expect("fusion chain cannot be empty");
        let replacement = self.insert(kind, inputs.iter().copied().collect(), spec);
        self.rewire(tail, replacement);
        for &retired in chain {
            self.nodes.remove(&retired);
        }
        replacement
    }

    /// Drops every node not contained in `live`.
    pub(crate) fn retain(&mut self, live: &std::collections::HashSet<NodeId>) {
        self.nodes.retain(|id, _| live.contains(id));
        self.outputs.retain(|id| live.contains(id));
    }

    fn rewire(&mut self, from: NodeId, to: NodeId) {
        for node in self.nodes.values_mut() {
            for input in node.inputs.iter_mut() {
                if *input == from {
                    *input = to;
                }
            }
        }
        for output in self.outputs.iter_mut() {
            if *output == from {
                *output = to;
            }
        }
    }
}

fn same_specs(kind: &OpKind, specs: &[&TensorSpec]) -> Result<TensorSpec> {
    let first = specs[0];
    for other in &specs[1..] {
        if *other != first {
            return Err(EngineError::invalid_input(format!(
                "{} requires identical operand shapes and dtypes: {:?} vs {:?}",
                kind.name(),
                first,
                other
            )));
        }
    }
    Ok(first.clone())
}

fn expect_rank(kind: &OpKind, spec: &TensorSpec, rank: usize) -> Result<()> {
    if spec.shape.rank() != rank {
        return Err(EngineError::invalid_input(format!(
            "{} expects a rank-{} operand, got shape {:?}",
            kind.name(),
            rank,
            spec.shape.dims()
        )));
    }
    Ok(())
}

fn expect_same_dtype(kind: &OpKind, specs: &[&TensorSpec]) -> Result<DType> {
    let dtype = specs[0].dtype;
    for spec in specs {
        if spec.dtype != dtype {
            return Err(EngineError::invalid_input(format!(
                "{} requires one dtype across operands, got {:?} and {:?}",
                kind.name(),
                dtype,
                spec.dtype
            )));
        }
    }
    Ok(dtype)
}

fn matmul_out(kind: &OpKind, a: &TensorSpec, b: &TensorSpec) -> Result<TensorSpec> {
    expect_rank(kind, a, 2)?;
    expect_rank(kind, b, 2)?;
    let dtype = expect_same_dtype(kind, &[a, b])?;
    let (m, k) = (a.shape.dims()[0], a.shape.dims()[1]);
    let (k2, n) = (b.shape.dims()[0], b.shape.dims()[1]);
    if k != k2 {
        return Err(EngineError::invalid_input(format!(
            "{} contraction mismatch: [{}x{}] x [{}x{}]",
            kind.name(),
            m,
            k,
            k2,
            n
        )));
    }
    Ok(TensorSpec::new(dtype, Shape::from([m, n])))
}

fn conv_out(kind: &OpKind, x: &TensorSpec, w: &TensorSpec, conv: &Conv2dSpec) -> Result<TensorSpec> {
    expect_rank(kind, x, 4)?;
    expect_rank(kind, w, 4)?;
    let dtype = expect_same_dtype(kind, &[x, w])?;
    let [n, c, h, width] = [
        x.shape.dims()[0],
        x.shape.dims()[1],
        x.shape.dims()[2],
        x.shape.dims()[3],
    ];
    let [o, c2, kh, kw] = [
        w.shape.dims()[0],
        w.shape.dims()[1],
        w.shape.dims()[2],
        w.shape.dims()[3],
    ];
    if c != c2 {
        return Err(EngineError::invalid_input(format!(
            "{} channel mismatch: input has {}, filter expects {}",
            kind.name(),
            c,
            c2
        )));
    }
    let (sh, sw) = conv.stride;
    let (ph, pw) = conv.padding;
    if sh == 0 || sw == 0 {
        return Err(EngineError::invalid_input(format!(
            "{} stride must be positive",
            kind.name()
        )));
    }
    if h + 2 * ph < kh || width + 2 * pw < kw {
        return Err(EngineError::invalid_input(format!(
            "{} kernel {}x{} exceeds padded input {}x{}",
            kind.name(),
            kh,
            kw,
            h + 2 * ph,
            width + 2 * pw
        )));
    }
    let oh = (h + 2 * ph - kh) / sh + 1;
    let ow = (width + 2 * pw - kw) / sw + 1;
    Ok(TensorSpec::new(dtype, Shape::from([n, o, oh, ow])))
}

fn expect_channel_vector(kind: &OpKind, spec: &TensorSpec, channels: usize, dtype: DType) -> Result<()> {
    expect_rank(kind, spec, 1)?;
    if spec.shape.dims()[0] != channels || spec.dtype != dtype {
        return Err(EngineError::invalid_input(format!(
            "{} expects a [{}] {:?} parameter vector, got {:?} {:?}",
            kind.name(),
            channels,
            dtype,
            spec.shape.dims(),
            spec.dtype
        )));
    }
    Ok(())
}

/// Validates operand shapes and computes the output descriptor.
pub(crate) fn infer_spec(kind: &OpKind, specs: &[&TensorSpec]) -> Result<TensorSpec> {
    match kind {
        OpKind::Input { .. } | OpKind::Constant(_) => unreachable!("leaf nodes carry their spec"),
        OpKind::Add | OpKind::Mul | OpKind::Fma => same_specs(kind, specs),
        OpKind::Scale(_) | OpKind::Neg | OpKind::Relu => Ok(specs[0].clone()),
        OpKind::MatMul => matmul_out(kind, specs[0], specs[1]),
        OpKind::BiasAdd => {
            let x = specs[0];
            expect_rank(kind, x, 2)?;
            expect_channel_vector(kind, specs[1], x.shape.dims()[1], x.dtype)?;
            Ok(x.clone())
        }
        OpKind::Conv2d(conv) => conv_out(kind, specs[0], specs[1], conv),
        OpKind::BatchNorm(_) => {
            let x = specs[0];
            expect_rank(kind, x, 4)?;
            let channels = x.shape.dims()[1];
            for param in &specs[1..] {
                expect_channel_vector(kind, param, channels, x.dtype)?;
            }
            Ok(x.clone())
        }
        OpKind::MatMulBias => {
            let out = matmul_out(kind, specs[0], specs[1])?;
            expect_channel_vector(kind, specs[2], out.shape.dims()[1], out.dtype)?;
            Ok(out)
        }
        OpKind::ConvBnRelu(spec) => {
            let out = conv_out(kind, specs[0], specs[1], &spec.conv)?;
            let channels = out.shape.dims()[1];
            for param in &specs[2..] {
                expect_channel_vector(kind, param, channels, out.dtype)?;
            }
            Ok(out)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_references_are_rejected() {
        let mut graph = Graph::new();
        let a = graph.add_input(DType::F32, Shape::from([2, 2])).unwrap();
        let missing = NodeId(17);
        let err = graph.add_node(OpKind::Add, &[a, missing]).unwrap_err();
        assert!(matches!(err, EngineError::InvalidInput { .. }));
        // The graph is unchanged by the failed call.
        assert_eq!(graph.len(), 1);
    }

    #[test]
    fn shape_inference_validates_operands() {
        let mut graph = Graph::new();
        let a = graph.add_input(DType::F32, Shape::from([2, 3])).unwrap();
        let b = graph.add_input(DType::F32, Shape::from([4, 5])).unwrap();
        assert!(graph.add_node(OpKind::Add, &[a, b]).is_err());
        assert!(graph.add_node(OpKind::MatMul, &[a, b]).is_err());

        let c = graph.add_input(DType::F32, Shape::from([3, 5])).unwrap();
        let mm = graph.add_node(OpKind::MatMul, &[a, c]).unwrap();
        assert_eq!(graph.node(mm).unwrap().spec.shape.dims(), &[2, 5]);
    }

    #[test]
    fn replacement_retires_ids() {
        let mut graph = Graph::new();
        let a = graph.add_constant(Tensor::from_f32([2], &[1.0, 2.0]).unwrap());
        let b = graph.add_constant(Tensor::from_f32([2], &[3.0, 4.0]).unwrap());
        let sum = graph.add_node(OpKind::Add, &[a, b]).unwrap();
        graph.mark_output(sum).unwrap();

        let folded = graph.replace_with_constant(sum, Tensor::from_f32([2], &[4.0, 6.0]).unwrap());
        assert!(graph.node(sum).is_none());
        assert!(folded > sum, "replacement ids are fresh, retired ids never return");
        assert_eq!(graph.outputs(), &[folded]);
    }
}
