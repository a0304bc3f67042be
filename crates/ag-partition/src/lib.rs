#![forbid(unsafe_code)]

//! Splitting a joint forward+backward graph into two executable graphs.
//!
//! Every partition satisfies the recomposition contract:
//!
//! ```text
//! fwd_outs ++ saved = eval(forward, primals)
//! grads             = eval(backward, saved ++ tangents)
//! eval(joint, primals ++ tangents) == fwd_outs ++ grads
//! ```
//!
//! Saved values are always ordered by their position in the joint graph, so
//! the forward graph's trailing outputs line up with the backward graph's
//! leading inputs.

pub mod default;
pub mod extract;
pub mod flow;
pub mod min_cut;

pub use default::DefaultPartitioner;
pub use extract::{Extracted, extract_subgraph};
pub use flow::{Capacity, Dinic, EdgeId, FlowError, FlowNetwork, MinCut, MinCutSolver, VertexId};
pub use min_cut::{MinCutConfig, MinCutPartitioner};

use ag_core::{Graph, GraphError, JointGraph, NodeId, ValueMeta};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PartitionError {
    #[error("output {name} ({node}) is not computable from the requested inputs")]
    Unsatisfiable { node: NodeId, name: String },
    #[error("node {node} is not present in the source graph")]
    UnknownNode { node: NodeId },
    #[error("node {node} is listed as an extraction input more than once")]
    DuplicateInput { node: NodeId },
    #[error("node {name} ({node}) has no size metadata; run a size oracle first")]
    MissingMeta { node: NodeId, name: String },
    #[error("min-cut is unbounded: a non-recomputable chain must cross into the backward graph")]
    UnboundedCut,
    #[error("cut edge {edge:?} does not correspond to a graph node")]
    CutDecode { edge: EdgeId },
    #[error("flow network: {0}")]
    Flow(FlowError),
    #[error(transparent)]
    Graph(#[from] GraphError),
}

impl From<FlowError> for PartitionError {
    fn from(value: FlowError) -> Self {
        match value {
            FlowError::Unbounded => Self::UnboundedCut,
            other => Self::Flow(other),
        }
    }
}

/// A value computed by the forward graph and handed to the backward graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedValue {
    /// Node in the joint graph.
    pub node: NodeId,
    pub name: String,
    pub meta: Option<ValueMeta>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Partition {
    /// Inputs: primals. Outputs: forward results followed by saved values.
    pub forward: Graph,
    /// Inputs: saved values followed by tangents. Outputs: gradients.
    pub backward: Graph,
    pub saved: Vec<SavedValue>,
    pub num_forward_outputs: usize,
    pub num_tangents: usize,
    /// Value of the minimum cut, for partitioners that compute one.
    pub cut_value: Option<u64>,
}

impl Partition {
    #[must_use]
    pub fn num_saved(&self) -> usize {
        self.saved.len()
    }

    #[must_use]
    pub fn saved_nodes(&self) -> Vec<NodeId> {
        self.saved.iter().map(|saved| saved.node).collect()
    }

    /// Total bytes held by saved values; `None` unless every saved value
    /// carries metadata.
    #[must_use]
    pub fn saved_bytes(&self) -> Option<u64> {
        self.saved.iter().try_fold(0_u64, |acc, saved| {
            saved
                .meta
                .as_ref()
                .map(|meta| acc.saturating_add(meta.nbytes))
        })
    }
}

/// Strategy for choosing which values cross from forward to backward.
pub trait Partitioner: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether `partition` needs every node annotated with [`ValueMeta`].
    fn requires_metadata(&self) -> bool {
        false
    }

    fn partition(&self, joint: &JointGraph) -> Result<Partition, PartitionError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionerKind {
    #[default]
    Default,
    MinCut,
}

impl PartitionerKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::MinCut => "min_cut",
        }
    }

    #[must_use]
    pub fn parse(text: &str) -> Option<Self> {
        match text.trim().to_ascii_lowercase().as_str() {
            "default" | "simple" => Some(Self::Default),
            "min_cut" | "mincut" | "min-cut" | "recompute" => Some(Self::MinCut),
            _ => None,
        }
    }

    #[must_use]
    pub fn build(self, config: MinCutConfig) -> Box<dyn Partitioner> {
        match self {
            Self::Default => Box::new(DefaultPartitioner),
            Self::MinCut => Box::new(MinCutPartitioner::with_config(config)),
        }
    }
}

impl fmt::Display for PartitionerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Extracts both sides for a given saved set. `saved` must already be in
/// joint-graph order.
pub(crate) fn build_partition(
    joint: &JointGraph,
    saved: &[NodeId],
    cut_value: Option<u64>,
) -> Result<Partition, PartitionError> {
    let primals = joint.primals();
    let tangents = joint.tangents();

    let mut forward_outputs = joint.forward_outputs().to_vec();
    forward_outputs.extend_from_slice(saved);
    let forward = extract_subgraph(&joint.graph, &primals, &forward_outputs)?;

    let mut backward_inputs = saved.to_vec();
    backward_inputs.extend_from_slice(&tangents);
    let backward = extract_subgraph(&joint.graph, &backward_inputs, joint.backward_outputs())?;

    let saved = saved
        .iter()
        .map(|id| {
            let node = joint
                .graph
                .node(*id)
                .ok_or(PartitionError::UnknownNode { node: *id })?;
            Ok(SavedValue {
                node: *id,
                name: node.name.clone(),
                meta: node.meta.clone(),
            })
        })
        .collect::<Result<Vec<_>, PartitionError>>()?;

    Ok(Partition {
        forward: forward.graph,
        backward: backward.graph,
        saved,
        num_forward_outputs: joint.num_forward_outputs,
        num_tangents: tangents.len(),
        cut_value,
    })
}
