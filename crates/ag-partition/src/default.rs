//! Two-coloring partitioner.
//!
//! A node is backward if it is a tangent placeholder or consumes a backward
//! node. Every non-backward argument of a backward node that some gradient
//! depends on is saved. Nothing is
//! recomputed; the backward graph starts exactly where the tangents start.

use ag_core::{JointGraph, NodeId};
use tracing::info;

use crate::{Partition, PartitionError, Partitioner, build_partition};

#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultPartitioner;

impl DefaultPartitioner {
    /// Saved values in joint-graph order.
    #[must_use]
    pub fn saved_values(joint: &JointGraph) -> Vec<NodeId> {
        let graph = &joint.graph;
        let live = backward_live(joint);
        let mut backward = vec![false; graph.id_bound()];
        let mut saved = vec![false; graph.id_bound()];

        let mark_saved = |id: NodeId, saved: &mut Vec<bool>| {
            // Constants are copied into both graphs by extraction.
            if graph.node(id).is_some_and(|node| !node.is_constant()) {
                saved[id.index()] = true;
            }
        };

        for node in graph.nodes() {
            if node.is_output() {
                continue;
            }
            let args = node.node_args();
            if !node.is_tangent() && !args.iter().any(|arg| backward[arg.index()]) {
                continue;
            }
            backward[node.id.index()] = true;
            if !live[node.id.index()] {
                continue;
            }
            for arg in args {
                if !backward[arg.index()] {
                    mark_saved(arg, &mut saved);
                }
            }
        }

        // A gradient that does not depend on any tangent is computed by the
        // forward graph and handed over like any other saved value.
        for &result in joint.backward_outputs() {
            if !backward[result.index()] {
                mark_saved(result, &mut saved);
            }
        }

        saved
            .iter()
            .enumerate()
            .filter(|(_, is_saved)| **is_saved)
            .map(|(idx, _)| NodeId(idx as u32))
            .collect()
    }
}

/// Nodes some gradient depends on.
fn backward_live(joint: &JointGraph) -> Vec<bool> {
    let graph = &joint.graph;
    let mut live = vec![false; graph.id_bound()];
    for &result in joint.backward_outputs() {
        live[result.index()] = true;
    }
    let ids: Vec<NodeId> = graph.nodes().map(|node| node.id).collect();
    for &id in ids.iter().rev() {
        if !live[id.index()] {
            continue;
        }
        if let Some(node) = graph.node(id) {
            for arg in node.node_args() {
                live[arg.index()] = true;
            }
        }
    }
    live
}

impl Partitioner for DefaultPartitioner {
    fn name(&self) -> &'static str {
        "default"
    }

    fn partition(&self, joint: &JointGraph) -> Result<Partition, PartitionError> {
        let saved = Self::saved_values(joint);
        let partition = build_partition(joint, &saved, None)?;
        info!(
            partitioner = self.name(),
            num_saved = partition.num_saved(),
            saved_bytes = partition.saved_bytes(),
            "partitioned joint graph"
        );
        Ok(partition)
    }
}
