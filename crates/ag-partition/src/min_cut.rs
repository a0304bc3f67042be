//! Min-cut rematerialization.
//!
//! Each joint-graph node `n` becomes two vertices `n.in -> n.out` joined by
//! an edge weighted with the bytes it would cost to save `n`. Data edges
//! `n.out -> user.in` are infinite, so a finite cut can only ever separate a
//! node's own two halves; the cut edges decode directly to saved nodes.
//!
//! * Source edges (infinite) pin primals and non-recomputable operators to
//!   the forward side.
//! * Sink edges (infinite) pin the tangent closure, plus any backward result
//!   produced outside it, to the backward side.
//! * Non-tensor values and constants have infinite weight and are never
//!   saved.
//!
//! After extraction, saved values the backward graph never reads are pruned
//! and both graphs are extracted once more.

use ag_core::{JointGraph, Node, NodeId};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::flow::{Capacity, Dinic, EdgeId, FlowNetwork, MinCutSolver, VertexId};
use crate::{Partition, PartitionError, Partitioner, build_partition};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MinCutConfig {
    /// Weight factor for non-placeholder values. A factor above 1 biases the
    /// cut towards saving inputs rather than intermediates.
    pub intermediate_cost_multiplier: u64,
    /// Drop saved values that the backward graph never reads and
    /// re-extract.
    pub prune_unused_saved: bool,
}

impl Default for MinCutConfig {
    fn default() -> Self {
        Self {
            intermediate_cost_multiplier: 1,
            prune_unused_saved: true,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MinCutPartitioner<S = Dinic> {
    config: MinCutConfig,
    solver: S,
}

impl MinCutPartitioner<Dinic> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_config(config: MinCutConfig) -> Self {
        Self {
            config,
            solver: Dinic,
        }
    }
}

impl<S: MinCutSolver> MinCutPartitioner<S> {
    #[must_use]
    pub fn with_solver(config: MinCutConfig, solver: S) -> Self {
        Self { config, solver }
    }

    #[must_use]
    pub fn config(&self) -> &MinCutConfig {
        &self.config
    }

    fn weight(&self, node: &Node) -> Result<Capacity, PartitionError> {
        let meta = node.meta.as_ref().ok_or_else(|| PartitionError::MissingMeta {
            node: node.id,
            name: node.name.clone(),
        })?;
        if !meta.is_tensor() || node.is_constant() {
            return Ok(Capacity::Infinite);
        }
        if node.is_placeholder() {
            Ok(Capacity::Finite(meta.nbytes))
        } else {
            Ok(Capacity::Finite(
                meta.nbytes
                    .saturating_mul(self.config.intermediate_cost_multiplier),
            ))
        }
    }

    fn cut_weight(&self, joint: &JointGraph, saved: &[NodeId]) -> Result<u64, PartitionError> {
        saved.iter().try_fold(0_u64, |acc, &id| {
            let node = joint
                .graph
                .node(id)
                .ok_or(PartitionError::UnknownNode { node: id })?;
            Ok(match self.weight(node)? {
                Capacity::Finite(weight) => acc.saturating_add(weight),
                Capacity::Infinite => u64::MAX,
            })
        })
    }

    /// Solves the cut and returns the saved nodes in joint-graph order with
    /// the cut value.
    pub fn choose_saved(&self, joint: &JointGraph) -> Result<(Vec<NodeId>, u64), PartitionError> {
        let graph = &joint.graph;
        let closure = tangent_closure(joint);

        let mut network = FlowNetwork::new();
        let source = network.add_vertex();
        let sink = network.add_vertex();

        let mut halves: Vec<Option<(VertexId, VertexId)>> = vec![None; graph.id_bound()];
        for node in graph.nodes().filter(|node| !node.is_output()) {
            halves[node.id.index()] = Some((network.add_vertex(), network.add_vertex()));
        }
        let half = |id: NodeId| {
            halves
                .get(id.index())
                .copied()
                .flatten()
                .ok_or(PartitionError::UnknownNode { node: id })
        };

        let mut split_edges: FxHashMap<EdgeId, NodeId> = FxHashMap::default();
        for node in graph.nodes().filter(|node| !node.is_output()) {
            let weight = self.weight(node)?;
            let (node_in, node_out) = half(node.id)?;

            if closure[node.id.index()] {
                network.add_edge(node_in, sink, Capacity::Infinite);
                continue;
            }
            if node.is_primal() {
                network.add_edge(source, node_in, Capacity::Infinite);
            }
            if node.op().is_some_and(|op| !op.is_recomputable()) {
                network.add_edge(source, node_in, Capacity::Infinite);
            }

            let edge = network.add_edge(node_in, node_out, weight);
            split_edges.insert(edge, node.id);

            for &user in graph.users_of(node.id) {
                if graph.node(user).is_some_and(Node::is_output) {
                    continue;
                }
                let (user_in, _) = half(user)?;
                network.add_edge(node_out, user_in, Capacity::Infinite);
            }
        }

        for &result in joint.backward_outputs() {
            if !closure[result.index()] {
                let (_, result_out) = half(result)?;
                network.add_edge(result_out, sink, Capacity::Infinite);
            }
        }

        let cut = self.solver.min_cut(&network, source, sink)?;
        let mut saved = cut
            .cut_edges
            .iter()
            .map(|edge| {
                split_edges
                    .get(edge)
                    .copied()
                    .ok_or(PartitionError::CutDecode { edge: *edge })
            })
            .collect::<Result<Vec<_>, _>>()?;
        saved.sort_unstable();
        saved.dedup();

        debug!(
            vertices = network.num_vertices(),
            edges = network.edges().len(),
            cut_value = cut.value,
            num_saved = saved.len(),
            "solved min-cut"
        );
        Ok((saved, cut.value))
    }
}

impl<S: MinCutSolver + Send + Sync> Partitioner for MinCutPartitioner<S> {
    fn name(&self) -> &'static str {
        "min_cut"
    }

    fn requires_metadata(&self) -> bool {
        true
    }

    fn partition(&self, joint: &JointGraph) -> Result<Partition, PartitionError> {
        let (saved, mut cut_value) = self.choose_saved(joint)?;
        let mut partition = build_partition(joint, &saved, Some(cut_value))?;

        if self.config.prune_unused_saved {
            let kept = used_saved(&partition);
            if kept.len() < saved.len() {
                debug!(
                    before = saved.len(),
                    after = kept.len(),
                    "pruning unused saved values"
                );
                // The cut now costs only what is still saved.
                cut_value = self.cut_weight(joint, &kept)?;
                partition = build_partition(joint, &kept, Some(cut_value))?;
                let still_unused = partition.num_saved() - used_saved(&partition).len();
                if still_unused > 0 {
                    warn!(
                        still_unused,
                        "saved values remain unused after one pruning pass"
                    );
                }
            }
        }

        info!(
            partitioner = self.name(),
            cut_value,
            num_saved = partition.num_saved(),
            saved_bytes = partition.saved_bytes(),
            "partitioned joint graph"
        );
        Ok(partition)
    }
}

/// Nodes reachable from a tangent placeholder, the output node excluded.
fn tangent_closure(joint: &JointGraph) -> Vec<bool> {
    let graph = &joint.graph;
    let mut closure = vec![false; graph.id_bound()];
    for node in graph.nodes() {
        if node.is_output() {
            continue;
        }
        if node.is_tangent() || node.node_args().iter().any(|arg| closure[arg.index()]) {
            closure[node.id.index()] = true;
        }
    }
    closure
}

/// Saved values whose backward placeholder has at least one user. Backward
/// placeholders are the saved values followed by the tangents, so the first
/// `num_saved` placeholders line up with `partition.saved`.
pub(crate) fn used_saved(partition: &Partition) -> Vec<NodeId> {
    partition
        .backward
        .placeholders()
        .into_iter()
        .zip(&partition.saved)
        .filter(|(placeholder, _)| !partition.backward.users_of(*placeholder).is_empty())
        .map(|(_, saved)| saved.node)
        .collect()
}
