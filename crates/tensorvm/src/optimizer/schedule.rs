use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

use crate::error::OptimizationError;
use crate::graph::{Graph, NodeId};

use super::{GraphPass, OptimizeContext, PassResult};

/// Orders the graph with Kahn's algorithm, breaking ties by original
/// insertion order (node id) so the resulting plan is deterministic.
#[derive(Default)]
pub struct TopologicalSchedulePass;

impl TopologicalSchedulePass {
    const NAME: &'static str = "topo_schedule";
}

impl GraphPass for TopologicalSchedulePass {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn run(
        &self,
        graph: &mut Graph,
        cx: &mut OptimizeContext<'_>,
    ) -> Result<PassResult, OptimizationError> {
        let mut indegree: HashMap<NodeId, usize> = HashMap::with_capacity(graph.len());
        let mut consumers: HashMap<NodeId, Vec<NodeId>> = HashMap::with_capacity(graph.len());
        for node in graph.iter() {
            let mut distinct = node.inputs.to_vec();
            distinct.sort_unstable();
            distinct.dedup();
            indegree.insert(node.id, distinct.len());
            for producer in distinct {
                consumers.entry(producer).or_default().push(node.id);
            }
        }

        let mut ready: BinaryHeap<Reverse<NodeId>> = graph
            .iter()
            .filter(|node| indegree[&node.id] == 0)
            .map(|node| Reverse(node.id))
            .collect();

        let mut order = Vec::with_capacity(graph.len());
        while let Some(Reverse(id)) = ready.pop() {
            order.push(id);
            for consumer in consumers.get(&id).map(Vec::as_slice).unwrap_or(&[]) {
                let remaining = indegree.get_mut(consumer).ok_or_else(|| {
                    OptimizationError::new(Self::NAME, format!("unknown consumer {:?}", consumer))
                })?;
                *remaining -= 1;
                if *remaining == 0 {
                    ready.push(Reverse(*consumer));
                }
            }
        }

        if order.len() != graph.len() {
            return Err(OptimizationError::new(
                Self::NAME,
                format!(
                    "schedule covered {} of {} nodes; the graph is not acyclic",
                    order.len(),
                    graph.len()
                ),
            ));
        }

        cx.schedule = Some(order);
        Ok(PassResult {
            changed: true,
            rewrites: 0,
            erased: 0,
        })
    }
}
