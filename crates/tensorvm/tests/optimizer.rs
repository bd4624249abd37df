//! Optimizer pipeline soundness: output equivalence, idempotence, DCE
//! precision, fusion legality and the planning artifacts.

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use tensorvm::graph::{BatchNormSpec, Conv2dSpec, Graph, OpKind, ScaleSpec};
use tensorvm::optimizer::{DeadCodeEliminationPass, GraphPass, OptimizeContext};
use tensorvm::tensor::{DType, Shape, Tensor};
use tensorvm::{plan, validate, Engine, Planner};
use tensorvm_backend_cpu::{ScalarBackend, SimdBackend};

fn randn(rng: &mut StdRng, shape: impl Into<Shape>) -> Tensor {
    let shape = shape.into();
    let data: Vec<f32> = (0..shape.num_elements())
        .map(|_| rng.gen_range(-1.0..1.0))
        .collect();
    Tensor::from_f32(shape, &data).unwrap()
}

/// Input -> MatMul -> BiasAdd -> Relu with a folded constant branch mixed
/// into the result; exercises folding, DCE, fusion and memory planning at
/// once.
fn mlp_graph(rng: &mut StdRng) -> Graph {
    let mut graph = Graph::new();
    let x = graph.add_input(DType::F32, Shape::from([4, 8])).unwrap();
    let w = graph.add_constant(randn(rng, [8, 6]));
    let bias = graph.add_constant(randn(rng, [6]));
    let mm = graph.add_node(OpKind::MatMul, &[x, w]).unwrap();
    let biased = graph.add_node(OpKind::BiasAdd, &[mm, bias]).unwrap();
    let act = graph.add_node(OpKind::Relu, &[biased]).unwrap();

    // Constant-only branch that folds to a single node.
    let c1 = graph.add_constant(randn(rng, [4, 6]));
    let c2 = graph.add_constant(randn(rng, [4, 6]));
    let folded = graph.add_node(OpKind::Add, &[c1, c2]).unwrap();

    // Dead branch that must disappear.
    let dead = graph.add_node(OpKind::Mul, &[c1, c2]).unwrap();
    let _dead_tail = graph.add_node(OpKind::Relu, &[dead]).unwrap();

    let out = graph.add_node(OpKind::Add, &[act, folded]).unwrap();
    graph.mark_output(out).unwrap();
    graph
}

#[test]
fn pipeline_preserves_outputs_within_budget() {
    let mut rng = StdRng::seed_from_u64(11);
    let graph = mlp_graph(&mut rng);
    let backend = Arc::new(SimdBackend::new());
    let planner = Planner::new();

    let outcome = planner.plan(&graph, backend.as_ref()).unwrap();
    assert!(outcome.fallback.is_none());
    assert!(outcome.plan.is_optimized());
    assert!(outcome.plan.steps().len() < graph.len());

    let baseline = planner.plan_unoptimized(&graph).unwrap();
    let engine = Engine::with_workers(backend, 2);
    let input = randn(&mut rng, [4, 8]);

    let optimized = engine.run(&outcome.plan, vec![input.clone()]).unwrap();
    let reference = engine.run(&baseline, vec![input]).unwrap();

    let stats = validate::relative_error(&reference[0], &optimized[0]).unwrap();
    assert!(stats.within_budget(), "relative error {stats:?}");
}

#[test]
fn pipeline_is_idempotent() {
    let mut rng = StdRng::seed_from_u64(23);
    let graph = mlp_graph(&mut rng);
    let backend = ScalarBackend::new();
    let planner = Planner::new();

    let mut working = graph.clone();
    let mut first = OptimizeContext::new(&backend);
    planner.run_passes(&mut working, &mut first).unwrap();
    let settled = plan::signature(&working).unwrap();

    let mut second = OptimizeContext::new(&backend);
    let stats = planner.run_passes(&mut working, &mut second).unwrap();
    assert_eq!(plan::signature(&working).unwrap(), settled);
    assert_eq!(stats.erased, 0);
    // The only reported rewrites on a settled graph are the (re)computed
    // reuse-table entries; the IR itself no longer changes.
    assert_eq!(stats.rewrites, second.reuse.len());
    assert_eq!(first.reuse, second.reuse);
    assert_eq!(first.schedule, second.schedule);
}

#[test]
fn dce_retains_exactly_the_output_cone() {
    let mut graph = Graph::new();
    let a = graph.add_input(DType::F32, Shape::from([2, 2])).unwrap();
    let b = graph.add_constant(Tensor::from_f32([2, 2], &[1.0; 4]).unwrap());
    let live = graph.add_node(OpKind::Add, &[a, b]).unwrap();
    let dead = graph.add_node(OpKind::Mul, &[a, b]).unwrap();
    let dead_tail = graph.add_node(OpKind::Relu, &[dead]).unwrap();
    graph.mark_output(live).unwrap();

    let backend = ScalarBackend::new();
    let mut cx = OptimizeContext::new(&backend);
    let stats = DeadCodeEliminationPass::default()
        .run(&mut graph, &mut cx)
        .unwrap();

    assert_eq!(stats.erased, 2);
    assert!(graph.node(dead).is_none());
    assert!(graph.node(dead_tail).is_none());
    assert!(graph.node(a).is_some());
    assert!(graph.node(b).is_some());
    assert!(graph.node(live).is_some());
    assert_eq!(graph.len(), 3);
}

#[test]
fn constant_conv_bn_relu_folds_to_a_single_constant() {
    let mut rng = StdRng::seed_from_u64(37);
    let mut graph = Graph::new();
    let x = graph.add_constant(randn(&mut rng, [1, 2, 5, 5]));
    let w = graph.add_constant(randn(&mut rng, [3, 2, 3, 3]));
    let gamma = graph.add_constant(randn(&mut rng, [3]));
    let beta = graph.add_constant(randn(&mut rng, [3]));
    let mean = graph.add_constant(randn(&mut rng, [3]));
    let var = graph.add_constant(Tensor::from_f32([3], &[0.9, 1.1, 0.7]).unwrap());

    let conv_spec = Conv2dSpec {
        stride: (1, 1),
        padding: (1, 1),
    };
    let conv = graph.add_node(OpKind::Conv2d(conv_spec), &[x, w]).unwrap();
    let bn = graph
        .add_node(
            OpKind::BatchNorm(BatchNormSpec { epsilon: 1e-5 }),
            &[conv, gamma, beta, mean, var],
        )
        .unwrap();
    let act = graph.add_node(OpKind::Relu, &[bn]).unwrap();
    graph.mark_output(act).unwrap();

    let backend = Arc::new(ScalarBackend::new());
    let planner = Planner::new();
    let outcome = planner.plan(&graph, backend.as_ref()).unwrap();
    assert!(outcome.fallback.is_none());
    assert_eq!(outcome.plan.steps().len(), 1);
    assert!(matches!(outcome.plan.steps()[0].kind, OpKind::Constant(_)));

    // The folded value equals direct evaluation of the three operators.
    let engine = Engine::with_workers(backend, 2);
    let folded = engine.run(&outcome.plan, vec![]).unwrap();
    let baseline = planner.plan_unoptimized(&graph).unwrap();
    let reference = engine.run(&baseline, vec![]).unwrap();
    let stats = validate::relative_error(&reference[0], &folded[0]).unwrap();
    assert!(stats.within_budget(), "relative error {stats:?}");
}

#[test]
fn matmul_bias_chain_fuses_and_matches_the_composition() {
    let mut rng = StdRng::seed_from_u64(41);
    let mut graph = Graph::new();
    let x = graph.add_input(DType::F32, Shape::from([5, 7])).unwrap();
    let w = graph.add_constant(randn(&mut rng, [7, 3]));
    let bias = graph.add_constant(randn(&mut rng, [3]));
    let mm = graph.add_node(OpKind::MatMul, &[x, w]).unwrap();
    let out = graph.add_node(OpKind::BiasAdd, &[mm, bias]).unwrap();
    graph.mark_output(out).unwrap();

    let backend = Arc::new(SimdBackend::new());
    let planner = Planner::new();
    let outcome = planner.plan(&graph, backend.as_ref()).unwrap();
    assert!(outcome
        .plan
        .steps()
        .iter()
        .any(|s| matches!(s.kind, OpKind::MatMulBias)));
    assert!(!outcome
        .plan
        .steps()
        .iter()
        .any(|s| matches!(s.kind, OpKind::MatMul | OpKind::BiasAdd)));

    let baseline = planner.plan_unoptimized(&graph).unwrap();
    let engine = Engine::with_workers(backend, 2);
    for seed in 0..5 {
        let input = randn(&mut StdRng::seed_from_u64(100 + seed), [5, 7]);
        let fused = engine.run(&outcome.plan, vec![input.clone()]).unwrap();
        let staged = engine.run(&baseline, vec![input]).unwrap();
        let stats = validate::relative_error(&staged[0], &fused[0]).unwrap();
        assert!(stats.within_budget(), "seed {seed}: {stats:?}");
    }
}

#[test]
fn fusion_is_skipped_when_the_intermediate_is_observed() {
    let mut rng = StdRng::seed_from_u64(43);
    let mut graph = Graph::new();
    let x = graph.add_input(DType::F32, Shape::from([5, 7])).unwrap();
    let w = graph.add_constant(randn(&mut rng, [7, 3]));
    let bias = graph.add_constant(randn(&mut rng, [3]));
    let mm = graph.add_node(OpKind::MatMul, &[x, w]).unwrap();
    let out = graph.add_node(OpKind::BiasAdd, &[mm, bias]).unwrap();
    graph.mark_output(out).unwrap();
    // The intermediate product is observably needed.
    graph.mark_output(mm).unwrap();

    let backend = SimdBackend::new();
    let outcome = Planner::new().plan(&graph, &backend).unwrap();
    assert!(!outcome
        .plan
        .steps()
        .iter()
        .any(|s| matches!(s.kind, OpKind::MatMulBias)));
}

#[test]
fn memory_planning_marks_dying_elementwise_outputs() {
    let mut graph = Graph::new();
    let x = graph.add_input(DType::F32, Shape::from([64])).unwrap();
    let relu = graph.add_node(OpKind::Relu, &[x]).unwrap();
    let scaled = graph
        .add_node(OpKind::Scale(ScaleSpec { factor: 1.5 }), &[relu])
        .unwrap();
    let neg = graph.add_node(OpKind::Neg, &[scaled]).unwrap();
    graph.mark_output(neg).unwrap();

    let backend = SimdBackend::new();
    let outcome = Planner::new().plan(&graph, &backend).unwrap();
    // Relu cannot claim the caller's input buffer; the two later links of
    // the chain each alias their dying producer.
    assert_eq!(outcome.plan.reuse_count(), 2);
}

#[test]
fn planning_the_same_structure_twice_hits_the_cache() {
    let build = || {
        let mut graph = Graph::new();
        let a = graph.add_input(DType::F32, Shape::from([3, 3])).unwrap();
        let b = graph
            .add_constant(Tensor::from_f32([3, 3], &[0.25; 9]).unwrap());
        let sum = graph.add_node(OpKind::Add, &[a, b]).unwrap();
        let act = graph.add_node(OpKind::Relu, &[sum]).unwrap();
        graph.mark_output(act).unwrap();
        graph
    };

    let backend = SimdBackend::new();
    let planner = Planner::new();
    let first = planner.plan(&build(), &backend).unwrap();
    let second = planner.plan(&build(), &backend).unwrap();
    assert!(second.cache_hit);
    assert!(Arc::ptr_eq(&first.plan, &second.plan));
}
