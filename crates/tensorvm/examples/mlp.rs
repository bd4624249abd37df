//! Builds a two-layer perceptron graph, optimizes it once, and replays the
//! plan. Run with `cargo run --example mlp`.

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use tensorvm::graph::{Graph, OpKind};
use tensorvm::tensor::{DType, Shape, Tensor};
use tensorvm::{pool, Engine, KernelBackend, Planner};
use tensorvm_backend_cpu::SimdBackend;

fn randn(rng: &mut StdRng, shape: impl Into<Shape>) -> anyhow::Result<Tensor> {
    let shape = shape.into();
    let data: Vec<f32> = (0..shape.num_elements())
        .map(|_| rng.gen_range(-0.5..0.5))
        .collect();
    Ok(Tensor::from_f32(shape, &data)?)
}

fn main() -> anyhow::Result<()> {
    let mut rng = StdRng::seed_from_u64(1234);

    let mut graph = Graph::new();
    let x = graph.add_input(DType::F32, Shape::from([1, 16]))?;
    let w1 = graph.add_constant(randn(&mut rng, [16, 32])?);
    let b1 = graph.add_constant(randn(&mut rng, [32])?);
    let w2 = graph.add_constant(randn(&mut rng, [32, 4])?);
    let b2 = graph.add_constant(randn(&mut rng, [4])?);

    let hidden = graph.add_node(OpKind::MatMul, &[x, w1])?;
    let hidden = graph.add_node(OpKind::BiasAdd, &[hidden, b1])?;
    let hidden = graph.add_node(OpKind::Relu, &[hidden])?;
    let logits = graph.add_node(OpKind::MatMul, &[hidden, w2])?;
    let logits = graph.add_node(OpKind::BiasAdd, &[logits, b2])?;
    graph.mark_output(logits)?;

    let backend = Arc::new(SimdBackend::new());
    let planner = Planner::new();
    let outcome = planner.plan(&graph, backend.as_ref())?;
    if let Some(err) = &outcome.fallback {
        eprintln!("optimizer fell back to the unoptimized plan: {err}");
    }
    println!(
        "backend {} | {} graph nodes -> {} plan steps, {} reusing a dead buffer",
        backend.name(),
        graph.len(),
        outcome.plan.steps().len(),
        outcome.plan.reuse_count()
    );

    let engine = Engine::new(backend);
    let input = randn(&mut rng, [1, 16])?;
    let outputs = engine.run(&outcome.plan, vec![input])?;
    println!("logits: {:?}", outputs[0].f32()?);

    let stats = pool::current().stats();
    println!(
        "pool: {} allocations, {} served from the free list, {} slab(s)",
        stats.allocations, stats.pool_hits, stats.slab_allocations
    );
    Ok(())
}
