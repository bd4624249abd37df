use std::collections::HashSet;

use crate::error::OptimizationError;
use crate::graph::{Graph, NodeId};

use super::{GraphPass, OptimizeContext, PassResult};

/// Drops every node without a path to a marked output. Postcondition:
/// exactly the transitive producers of the marked outputs survive.
#[derive(Default)]
pub struct DeadCodeEliminationPass;

impl DeadCodeEliminationPass {
    const NAME: &'static str = "dce";
}

impl GraphPass for DeadCodeEliminationPass {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn run(
        &self,
        graph: &mut Graph,
        _cx: &mut OptimizeContext<'_>,
    ) -> Result<PassResult, OptimizationError> {
        let mut worklist: Vec<NodeId> = graph.outputs().to_vec();
        let mut live: HashSet<NodeId> = HashSet::with_capacity(graph.len());
        while let Some(id) = worklist.pop() {
            if !live.insert(id) {
                continue;
            }
            worklist.extend_from_slice(graph.producers(id));
        }

        let before = graph.len();
        graph.retain(&live);
        let erased = before - graph.len();
        Ok(PassResult {
            changed: erased > 0,
            rewrites: 0,
            erased,
        })
    }
}
