//! Execution engine: replays immutable plans over a fixed worker pool.
//!
//! Independent plan steps run on separate workers; a dependent step starts
//! only once its last producer publishes. Publication goes through per-call
//! atomic result slots with release ordering, and consumers read them with
//! acquire ordering, so a consumer always observes its producer's completed
//! write. Buffer assignment follows the plan's reuse table, falling back to
//! a fresh pool allocation when the dead buffer turns out to be shared.

use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use crate::error::{EngineError, Result};
use crate::graph::OpKind;
use crate::kernel::{self, KernelBackend};
use crate::plan::{ExecutionPlan, PlanStep};
use crate::profiling;
use crate::sync::Queue;
use crate::tensor::Tensor;
use crate::{env, pool};

/// Cooperative cancellation flag checked at node boundaries; once a node
/// has started it runs to completion.
#[derive(Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        CancellationToken::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

struct Task {
    call: Arc<CallState>,
    step: usize,
}

struct EngineShared {
    injector: Queue<Task>,
    gate: Mutex<()>,
    signal: Condvar,
    shutdown: AtomicBool,
}

struct CallStatus {
    outputs: Vec<Option<Tensor>>,
    remaining: usize,
    error: Option<EngineError>,
}

/// Per-call mutable state; the plan itself stays read-only.
struct CallState {
    plan: Arc<ExecutionPlan>,
    inputs: Vec<Tensor>,
    /// Published step results; null until the producer finishes.
    slots: Vec<AtomicPtr<Tensor>>,
    /// Remaining consuming references per step, for buffer release/reuse.
    uses: Vec<AtomicUsize>,
    /// Remaining unfinished producers per step.
    pending: Vec<AtomicUsize>,
    cancel: CancellationToken,
    aborted: AtomicBool,
    status: Mutex<CallStatus>,
    done: Condvar,
}

impl CallState {
    fn new(plan: Arc<ExecutionPlan>, inputs: Vec<Tensor>, cancel: CancellationToken) -> Self {
        let steps = plan.steps();
        CallState {
            slots: steps.iter().map(|_| AtomicPtr::new(ptr::null_mut())).collect(),
            uses: steps.iter().map(|s| AtomicUsize::new(s.uses)).collect(),
            pending: steps.iter().map(|s| AtomicUsize::new(s.indegree)).collect(),
            status: Mutex::new(CallStatus {
                outputs: vec![None; plan.outputs().len()],
                remaining: plan.outputs().len(),
                error: None,
            }),
            plan,
            inputs,
            cancel,
            aborted: AtomicBool::new(false),
            done: Condvar::new(),
        }
    }

    fn abort(&self, err: EngineError) {
        if !self.aborted.swap(true, Ordering::AcqRel) {
            let mut status = self.status.lock().expect("call status poisoned");
            status.error = Some(err);
            self.done.notify_all();
        }
    }
}

impl Drop for CallState {
    fn drop(&mut self) {
        for slot in &self.slots {
            let ptr = slot.swap(ptr::null_mut(), Ordering::AcqRel);
            if !ptr.is_null() {
                drop(unsafe { Box::from_raw(ptr) });
            }
        }
    }
}

/// Fixed worker-thread pool executing [`ExecutionPlan`]s.
///
/// Each worker owns a private memory pool created at spawn and torn down at
/// join. The work queue is the lock-free FIFO from [`crate::sync`]; workers
/// park on a condvar only when it runs dry.
pub struct Engine {
    backend: Arc<dyn KernelBackend>,
    shared: Arc<EngineShared>,
    workers: Vec<JoinHandle<()>>,
}

impl Engine {
    /// Spawns the worker pool sized from `TENSORVM_WORKERS`, defaulting to
    /// the host parallelism.
    pub fn new(backend: Arc<dyn KernelBackend>) -> Self {
        let workers = env::worker_override().unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        });
        Self::with_workers(backend, workers)
    }

    pub fn with_workers(backend: Arc<dyn KernelBackend>, workers: usize) -> Self {
        let shared = Arc::new(EngineShared {
            injector: Queue::new(),
            gate: Mutex::new(()),
            signal: Condvar::new(),
            shutdown: AtomicBool::new(false),
        });
        let handles = (0..workers.max(1))
            .map(|index| {
                let shared = Arc::clone(&shared);
                let backend = Arc::clone(&backend);
                std::thread::Builder::new()
                    .name(format!("tensorvm-worker-{index}"))
                    .spawn(move || worker_loop(shared, backend))
                    .expect("failed to spawn worker thread")
            })
            .collect();
        Engine {
            backend,
            shared,
            workers: handles,
        }
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Executes `plan` against `inputs`, returning the marked outputs in
    /// marking order.
    pub fn run(&self, plan: &Arc<ExecutionPlan>, inputs: Vec<Tensor>) -> Result<Vec<Tensor>> {
        self.run_cancellable(plan, inputs, CancellationToken::new())
    }

    /// As [`Engine::run`], with a caller-held cancellation token.
    pub fn run_cancellable(
        &self,
        plan: &Arc<ExecutionPlan>,
        inputs: Vec<Tensor>,
        cancel: CancellationToken,
    ) -> Result<Vec<Tensor>> {
        if inputs.len() != plan.input_count() {
            return Err(EngineError::runtime(format!(
                "plan expects {} inputs, call provided {}",
                plan.input_count(),
                inputs.len()
            )));
        }
        for &(input_index, step) in plan.input_bindings() {
            let expected = &plan.steps()[step].spec;
            let provided = inputs[input_index].spec();
            if provided != expected {
                return Err(EngineError::runtime(format!(
                    "input {} is {:?}, plan expects {:?}",
                    input_index, provided, expected
                )));
            }
        }
        if plan.outputs().is_empty() {
            return Ok(Vec::new());
        }

        let call = Arc::new(CallState::new(Arc::clone(plan), inputs, cancel));
        for (index, step) in plan.steps().iter().enumerate() {
            if step.indegree == 0 {
                self.submit(Task {
                    call: Arc::clone(&call),
                    step: index,
                });
            }
        }

        let mut status = call.status.lock().expect("call status poisoned");
        while status.error.is_none() && status.remaining > 0 {
            status = call.done.wait(status).expect("call status poisoned");
        }
        if let Some(err) = status.error.take() {
            // Partial results are discarded with the call state.
            return Err(err);
        }
        status
            .outputs
            .iter_mut()
            .map(|slot| {
                slot.take()
                    .ok_or_else(|| EngineError::runtime("output missing after completion"))
            })
            .collect()
    }

    fn submit(&self, task: Task) {
        submit(&self.shared, task);
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        {
            let _gate = self.shared.gate.lock().expect("engine gate poisoned");
            self.shared.signal.notify_all();
        }
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

fn submit(shared: &Arc<EngineShared>, task: Task) {
    shared.injector.enqueue(task);
    let _gate = shared.gate.lock().expect("engine gate poisoned");
    shared.signal.notify_one();
}

fn worker_loop(shared: Arc<EngineShared>, backend: Arc<dyn KernelBackend>) {
    // Materialize this worker's pool at spawn; it is torn down at join.
    let _pool = pool::current();
    loop {
        if shared.shutdown.load(Ordering::Acquire) {
            return;
        }
        if let Some(task) = shared.injector.dequeue() {
            run_task(&shared, &backend, task);
            continue;
        }
        let mut gate = shared.gate.lock().expect("engine gate poisoned");
        loop {
            if shared.shutdown.load(Ordering::Acquire) {
                return;
            }
            if !shared.injector.is_empty() {
                break;
            }
            gate = shared.signal.wait(gate).expect("engine gate poisoned");
        }
    }
}

fn run_task(shared: &Arc<EngineShared>, backend: &Arc<dyn KernelBackend>, task: Task) {
    let Task { call, step } = task;
    if call.aborted.load(Ordering::Acquire) {
        return;
    }
    if call.cancel.is_cancelled() {
        call.abort(EngineError::runtime("inference call cancelled"));
        return;
    }
    match execute_step(backend.as_ref(), &call, step) {
        Ok(()) => {
            let dependents = &call.plan.steps()[step].dependents;
            for &dependent in dependents {
                if call.pending[dependent].fetch_sub(1, Ordering::AcqRel) == 1 {
                    submit(
                        shared,
                        Task {
                            call: Arc::clone(&call),
                            step: dependent,
                        },
                    );
                }
            }
        }
        Err(err) => call.abort(err),
    }
}

fn execute_step(backend: &dyn KernelBackend, call: &CallState, index: usize) -> Result<()> {
    let step = &call.plan.steps()[index];
    let _scope = profiling::scope(profiling::ScopeKind::Node, step.kind.name());

    let mut stolen_operand: Option<usize> = None;
    let result = match &step.kind {
        OpKind::Input { index: input_index } => call.inputs[*input_index].clone(),
        OpKind::Constant(value) => value.as_ref().clone(),
        kind => {
            let reuse = step
                .reuse_input
                .and_then(|position| try_steal(call, step, position));
            match reuse {
                Some((position, tensor)) => {
                    stolen_operand = Some(position);
                    execute_with_reuse(backend, call, step, kind, position, tensor)?
                }
                None => {
                    let operands = gather(call, &step.inputs)?;
                    execute_fresh(backend, step, kind, &operands)?
                }
            }
        }
    };

    if !step.output_positions.is_empty() {
        let mut status = call.status.lock().expect("call status poisoned");
        for &position in &step.output_positions {
            status.outputs[position] = Some(result.clone());
        }
        status.remaining -= step.output_positions.len();
        if status.remaining == 0 {
            call.done.notify_all();
        }
    }

    // Publish the result before releasing operand references, so every
    // dependent that becomes ready observes it.
    call.slots[index].store(Box::into_raw(Box::new(result)), Ordering::Release);

    for (position, &producer) in step.inputs.iter().enumerate() {
        if stolen_operand == Some(position) {
            continue;
        }
        if call.uses[producer].fetch_sub(1, Ordering::AcqRel) == 1 {
            let dead = call.slots[producer].swap(ptr::null_mut(), Ordering::AcqRel);
            if !dead.is_null() {
                drop(unsafe { Box::from_raw(dead) });
            }
        }
    }
    Ok(())
}

/// Claims the dying operand's buffer when this step holds its final
/// reference. Losing the race (an independent consumer still running) just
/// means a fresh allocation instead.
fn try_steal(call: &CallState, step: &PlanStep, position: usize) -> Option<(usize, Tensor)> {
    let producer = step.inputs[position];
    if call.uses[producer]
        .compare_exchange(1, 0, Ordering::AcqRel, Ordering::Relaxed)
        .is_err()
    {
        return None;
    }
    let ptr = call.slots[producer].swap(ptr::null_mut(), Ordering::AcqRel);
    if ptr.is_null() {
        return None;
    }
    Some((position, *unsafe { Box::from_raw(ptr) }))
}

fn execute_with_reuse(
    backend: &dyn KernelBackend,
    call: &CallState,
    step: &PlanStep,
    kind: &OpKind,
    position: usize,
    operand: Tensor,
) -> Result<Tensor> {
    let rest: Vec<Tensor> = step
        .inputs
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != position)
        .map(|(_, &producer)| read_slot(call, producer))
        .collect::<Result<_>>()?;
    match operand.try_into_buffer() {
        Ok(buffer) => {
            let mut out = Tensor::from_buffer(buffer, step.spec.clone())?;
            let rest_refs: Vec<&Tensor> = rest.iter().collect();
            kernel::validate_inplace(kind, &out, &rest_refs)?;
            backend.execute_inplace(kind, &mut out, &rest_refs)?;
            Ok(out)
        }
        Err(tensor) => {
            // The buffer is shared after all; run the allocating path with
            // the reclaimed tensor back in operand position.
            let mut operands = Vec::with_capacity(step.inputs.len());
            for (i, &producer) in step.inputs.iter().enumerate() {
                if i == position {
                    operands.push(tensor.clone());
                } else {
                    operands.push(read_slot(call, producer)?);
                }
            }
            execute_fresh(backend, step, kind, &operands)
        }
    }
}

fn execute_fresh(
    backend: &dyn KernelBackend,
    step: &PlanStep,
    kind: &OpKind,
    operands: &[Tensor],
) -> Result<Tensor> {
    let refs: Vec<&Tensor> = operands.iter().collect();
    let mut out = Tensor::zeros(step.spec.clone())?;
    kernel::validate_execution(kind, &refs, &out)?;
    backend.execute(kind, &refs, &mut out)?;
    Ok(out)
}

fn gather(call: &CallState, inputs: &[usize]) -> Result<Vec<Tensor>> {
    inputs.iter().map(|&producer| read_slot(call, producer)).collect()
}

fn read_slot(call: &CallState, producer: usize) -> Result<Tensor> {
    let ptr = call.slots[producer].load(Ordering::Acquire);
    if ptr.is_null() {
        return Err(EngineError::runtime(
            "producer result missing; schedule violated a dependency",
        ));
    }
    Ok(unsafe { (*ptr).clone() })
}
