//! Arena-backed dataflow graph.
//!
//! Nodes live in insertion order, which is always a valid topological order:
//! an operation may only reference nodes that already exist. Ids are stable
//! indices into the arena; dead-code elimination leaves tombstones and never
//! renumbers. The reverse (user) index is derived on demand and cached until
//! the next mutation.

use crate::{AbstractValue, Literal, Op, Value, ValueMeta};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{self, Write};
use std::sync::OnceLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub u32);

impl NodeId {
    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.0)
    }
}

/// Which side of the joint computation a placeholder feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InputRole {
    /// A true input of the forward computation.
    Primal,
    /// An upstream gradient supplied when the backward pass runs.
    Tangent,
}

impl InputRole {
    /// Naming convention used by joint-graph tracers: placeholders whose name
    /// contains `tangents` are gradient inputs, everything else is primal.
    #[must_use]
    pub fn from_name(name: &str) -> Self {
        if name.contains("tangents") {
            Self::Tangent
        } else {
            Self::Primal
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Arg {
    Node(NodeId),
    Lit(Literal),
}

impl Arg {
    #[must_use]
    pub fn as_node(&self) -> Option<NodeId> {
        match self {
            Self::Node(id) => Some(*id),
            Self::Lit(_) => None,
        }
    }
}

impl From<NodeId> for Arg {
    fn from(value: NodeId) -> Self {
        Self::Node(value)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NodeKind {
    Placeholder {
        role: InputRole,
        aval: Option<AbstractValue>,
    },
    /// Reference to a value baked into the graph (a parameter or constant
    /// tensor). Always reproducible, so extraction copies it unconditionally.
    Constant { value: Value },
    Call {
        op: Op,
        args: SmallVec<[Arg; 4]>,
        params: BTreeMap<String, String>,
    },
    Output { results: Vec<NodeId> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub name: String,
    pub kind: NodeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<ValueMeta>,
}

impl Node {
    /// Node references in argument order. Repeated arguments appear once per
    /// occurrence.
    #[must_use]
    pub fn node_args(&self) -> SmallVec<[NodeId; 4]> {
        match &self.kind {
            NodeKind::Call { args, .. } => args.iter().filter_map(Arg::as_node).collect(),
            NodeKind::Output { results } => results.iter().copied().collect(),
            NodeKind::Placeholder { .. } | NodeKind::Constant { .. } => SmallVec::new(),
        }
    }

    #[must_use]
    pub fn op(&self) -> Option<Op> {
        match &self.kind {
            NodeKind::Call { op, .. } => Some(*op),
            _ => None,
        }
    }

    #[must_use]
    pub fn role(&self) -> Option<InputRole> {
        match &self.kind {
            NodeKind::Placeholder { role, .. } => Some(*role),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_placeholder(&self) -> bool {
        matches!(self.kind, NodeKind::Placeholder { .. })
    }

    #[must_use]
    pub fn is_constant(&self) -> bool {
        matches!(self.kind, NodeKind::Constant { .. })
    }

    #[must_use]
    pub fn is_output(&self) -> bool {
        matches!(self.kind, NodeKind::Output { .. })
    }

    #[must_use]
    pub fn is_tangent(&self) -> bool {
        self.role() == Some(InputRole::Tangent)
    }

    #[must_use]
    pub fn is_primal(&self) -> bool {
        self.role() == Some(InputRole::Primal)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
    #[error("node {node} is not present in this graph")]
    UnknownNode { node: NodeId },
    #[error("node {node} is the output node and cannot be used as a value")]
    OutputReference { node: NodeId },
    #[error("{op} does not accept {actual} arguments")]
    ArityMismatch { op: Op, actual: usize },
    #[error("graph output is already set; no further nodes may be appended")]
    Sealed,
    #[error("graph output is already set")]
    OutputAlreadySet,
    #[error("graph has no output node")]
    MissingOutput,
    #[error("output node {node} is not the last node")]
    OutputNotLast { node: NodeId },
    #[error("node {node} references {arg}, which is not defined before it")]
    UnboundArgument { node: NodeId, arg: NodeId },
    #[error("duplicate node name {name:?}")]
    DuplicateName { name: String },
    #[error("joint graph declares {declared} forward outputs but only has {available} results")]
    ForwardOutputCount { declared: usize, available: usize },
}

/// Reverse adjacency: for every node, the distinct nodes that use it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserIndex {
    users: Vec<SmallVec<[NodeId; 4]>>,
}

impl UserIndex {
    fn build(graph: &Graph) -> Self {
        let mut users: Vec<SmallVec<[NodeId; 4]>> = vec![SmallVec::new(); graph.slots.len()];
        for node in graph.nodes() {
            for arg in node.node_args() {
                let entry = &mut users[arg.index()];
                if !entry.contains(&node.id) {
                    entry.push(node.id);
                }
            }
        }
        Self { users }
    }

    #[must_use]
    pub fn get(&self, id: NodeId) -> &[NodeId] {
        self.users.get(id.index()).map_or(&[], |users| users.as_slice())
    }

    #[must_use]
    pub fn count(&self, id: NodeId) -> usize {
        self.get(id).len()
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Graph {
    slots: Vec<Option<Node>>,
    output: Option<NodeId>,
    names: BTreeSet<String>,
    #[serde(skip)]
    users_cache: OnceLock<UserIndex>,
    #[serde(skip)]
    fingerprint_cache: OnceLock<String>,
}

impl Clone for Graph {
    fn clone(&self) -> Self {
        Self {
            slots: self.slots.clone(),
            output: self.output,
            names: self.names.clone(),
            users_cache: OnceLock::new(),
            fingerprint_cache: OnceLock::new(),
        }
    }
}

impl PartialEq for Graph {
    fn eq(&self, other: &Self) -> bool {
        self.slots == other.slots && self.output == other.output
    }
}

impl Graph {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a placeholder whose role follows the `tangents` naming
    /// convention.
    pub fn add_input(&mut self, name: &str) -> Result<NodeId, GraphError> {
        self.add_placeholder(name, InputRole::from_name(name), None)
    }

    pub fn add_placeholder(
        &mut self,
        name: &str,
        role: InputRole,
        aval: Option<AbstractValue>,
    ) -> Result<NodeId, GraphError> {
        self.push(name, NodeKind::Placeholder { role, aval })
    }

    pub fn add_constant(&mut self, name: &str, value: Value) -> Result<NodeId, GraphError> {
        self.push(name, NodeKind::Constant { value })
    }

    pub fn add_operation(
        &mut self,
        op: Op,
        args: impl IntoIterator<Item = Arg>,
    ) -> Result<NodeId, GraphError> {
        self.add_operation_with_params(op, args, BTreeMap::new())
    }

    /// Appends a call node. Fails if an argument refers to a node that is not
    /// already in this graph, which is what keeps the graph acyclic.
    pub fn add_operation_with_params(
        &mut self,
        op: Op,
        args: impl IntoIterator<Item = Arg>,
        params: BTreeMap<String, String>,
    ) -> Result<NodeId, GraphError> {
        self.add_named_operation(op.as_str(), op, args, params)
    }

    /// Like `add_operation_with_params` but names the node after `name`
    /// (suffixed if taken) instead of the operator.
    pub fn add_named_operation(
        &mut self,
        name: &str,
        op: Op,
        args: impl IntoIterator<Item = Arg>,
        params: BTreeMap<String, String>,
    ) -> Result<NodeId, GraphError> {
        let args: SmallVec<[Arg; 4]> = args.into_iter().collect();
        if !op.accepts_arity(args.len()) {
            return Err(GraphError::ArityMismatch {
                op,
                actual: args.len(),
            });
        }
        for arg in args.iter().filter_map(Arg::as_node) {
            self.check_value_ref(arg)?;
        }
        self.push(name, NodeKind::Call { op, args, params })
    }

    /// Appends the single output node. Afterwards the graph is sealed.
    pub fn set_output(&mut self, results: Vec<NodeId>) -> Result<NodeId, GraphError> {
        if self.output.is_some() {
            return Err(GraphError::OutputAlreadySet);
        }
        for result in &results {
            self.check_value_ref(*result)?;
        }
        let id = self.push("output", NodeKind::Output { results })?;
        self.output = Some(id);
        Ok(id)
    }

    pub fn set_meta(&mut self, id: NodeId, meta: ValueMeta) -> Result<(), GraphError> {
        let node = self
            .slots
            .get_mut(id.index())
            .and_then(Option::as_mut)
            .ok_or(GraphError::UnknownNode { node: id })?;
        node.meta = Some(meta);
        Ok(())
    }

    #[must_use]
    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.slots.get(id.index()).and_then(Option::as_ref)
    }

    #[must_use]
    pub fn contains(&self, id: NodeId) -> bool {
        self.node(id).is_some()
    }

    #[must_use]
    pub fn meta(&self, id: NodeId) -> Option<&ValueMeta> {
        self.node(id).and_then(|node| node.meta.as_ref())
    }

    /// Live nodes in topological order.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.slots.iter().flatten()
    }

    /// Number of live nodes, the output node included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes().count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// One past the largest id ever handed out; sizes dense side tables.
    #[must_use]
    pub fn id_bound(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub fn output_node(&self) -> Option<&Node> {
        self.output.and_then(|id| self.node(id))
    }

    /// Result nodes of the output, in order. Empty until `set_output`.
    #[must_use]
    pub fn outputs(&self) -> &[NodeId] {
        match self.output_node().map(|node| &node.kind) {
            Some(NodeKind::Output { results }) => results,
            _ => &[],
        }
    }

    #[must_use]
    pub fn placeholders(&self) -> Vec<NodeId> {
        self.nodes()
            .filter(|node| node.is_placeholder())
            .map(|node| node.id)
            .collect()
    }

    #[must_use]
    pub fn placeholders_with_role(&self, role: InputRole) -> Vec<NodeId> {
        self.nodes()
            .filter(|node| node.role() == Some(role))
            .map(|node| node.id)
            .collect()
    }

    #[must_use]
    pub fn find(&self, name: &str) -> Option<NodeId> {
        self.nodes()
            .find(|node| node.name == name)
            .map(|node| node.id)
    }

    /// Reverse adjacency, built on first use after a mutation.
    #[must_use]
    pub fn users(&self) -> &UserIndex {
        self.users_cache.get_or_init(|| UserIndex::build(self))
    }

    #[must_use]
    pub fn users_of(&self, id: NodeId) -> &[NodeId] {
        self.users().get(id)
    }

    /// Removes every call or constant node that has no users, repeating until
    /// nothing changes. Placeholders and the output node are kept; the input
    /// arity of a graph is part of its calling contract. Returns the number of
    /// removed nodes.
    pub fn eliminate_dead_code(&mut self) -> usize {
        let mut removed_total = 0;
        loop {
            let mut live_users = vec![0_usize; self.slots.len()];
            for node in self.nodes() {
                for arg in distinct(node.node_args()) {
                    live_users[arg.index()] += 1;
                }
            }

            let mut removed = 0;
            for idx in (0..self.slots.len()).rev() {
                let Some(node) = self.slots[idx].as_ref() else {
                    continue;
                };
                let removable = matches!(
                    node.kind,
                    NodeKind::Call { .. } | NodeKind::Constant { .. }
                ) && live_users[idx] == 0;
                if !removable {
                    continue;
                }
                for arg in distinct(node.node_args()) {
                    live_users[arg.index()] -= 1;
                }
                if let Some(dead) = self.slots[idx].take() {
                    self.names.remove(&dead.name);
                }
                removed += 1;
            }

            if removed == 0 {
                break;
            }
            removed_total += removed;
        }

        if removed_total > 0 {
            self.invalidate();
        }
        removed_total
    }

    /// Structural lint: ids match slots, every argument is defined earlier,
    /// names are unique and exactly one output node closes the graph.
    pub fn validate_well_formed(&self) -> Result<(), GraphError> {
        let mut defined = vec![false; self.slots.len()];
        let mut names = BTreeSet::new();
        let mut last = None;

        for (idx, node) in self.slots.iter().enumerate() {
            let Some(node) = node else {
                continue;
            };
            if node.id.index() != idx {
                return Err(GraphError::UnknownNode { node: node.id });
            }
            if !names.insert(node.name.as_str()) {
                return Err(GraphError::DuplicateName {
                    name: node.name.clone(),
                });
            }
            for arg in node.node_args() {
                if !defined.get(arg.index()).copied().unwrap_or(false) {
                    return Err(GraphError::UnboundArgument { node: node.id, arg });
                }
                if Some(arg) == self.output {
                    return Err(GraphError::OutputReference { node: arg });
                }
            }
            if node.is_output() && Some(node.id) != self.output {
                return Err(GraphError::OutputAlreadySet);
            }
            defined[idx] = true;
            last = Some(node.id);
        }

        match self.output {
            None => Err(GraphError::MissingOutput),
            Some(output) if last != Some(output) => {
                Err(GraphError::OutputNotLast { node: output })
            }
            Some(_) => Ok(()),
        }
    }

    /// Deterministic rendering of the graph structure that ignores node ids
    /// and names. Two graphs with equal fingerprints compute the same thing
    /// with the same wiring.
    #[must_use]
    pub fn canonical_fingerprint(&self) -> &str {
        self.fingerprint_cache.get_or_init(|| {
            let mut ordinal = vec![u32::MAX; self.slots.len()];
            for (position, node) in self.nodes().enumerate() {
                ordinal[node.id.index()] = position as u32;
            }

            let mut out = String::new();
            for node in self.nodes() {
                match &node.kind {
                    NodeKind::Placeholder { role, .. } => {
                        let _ = write!(&mut out, "in:{role:?}");
                    }
                    NodeKind::Constant { value } => {
                        let _ = write!(&mut out, "const:{value:?}");
                    }
                    NodeKind::Call { op, args, params } => {
                        let _ = write!(&mut out, "{}(", op.as_str());
                        for arg in args {
                            match arg {
                                Arg::Node(id) => {
                                    let _ = write!(&mut out, "#{},", ordinal[id.index()]);
                                }
                                Arg::Lit(lit) => {
                                    let _ = write!(&mut out, "{lit:?},");
                                }
                            }
                        }
                        out.push(')');
                        out.push('{');
                        for (key, value) in params {
                            let _ = write!(&mut out, "{key}={value};");
                        }
                        out.push('}');
                    }
                    NodeKind::Output { results } => {
                        out.push_str("out(");
                        for id in results {
                            let _ = write!(&mut out, "#{},", ordinal[id.index()]);
                        }
                        out.push(')');
                    }
                }
                out.push('|');
            }
            out
        })
    }

    #[must_use]
    pub fn is_isomorphic(&self, other: &Graph) -> bool {
        self.canonical_fingerprint() == other.canonical_fingerprint()
    }

    fn check_value_ref(&self, id: NodeId) -> Result<(), GraphError> {
        match self.node(id) {
            None => Err(GraphError::UnknownNode { node: id }),
            Some(node) if node.is_output() => Err(GraphError::OutputReference { node: id }),
            Some(_) => Ok(()),
        }
    }

    fn push(&mut self, name_hint: &str, kind: NodeKind) -> Result<NodeId, GraphError> {
        if self.output.is_some() {
            return Err(GraphError::Sealed);
        }
        let id = NodeId(self.slots.len() as u32);
        let name = self.unique_name(name_hint);
        self.slots.push(Some(Node {
            id,
            name,
            kind,
            meta: None,
        }));
        self.invalidate();
        Ok(id)
    }

    fn unique_name(&mut self, base: &str) -> String {
        let mut candidate = base.to_owned();
        let mut suffix = 1_u32;
        while self.names.contains(&candidate) {
            candidate = format!("{base}_{suffix}");
            suffix += 1;
        }
        self.names.insert(candidate.clone());
        candidate
    }

    fn invalidate(&mut self) {
        self.users_cache = OnceLock::new();
        self.fingerprint_cache = OnceLock::new();
    }
}

fn distinct(ids: SmallVec<[NodeId; 4]>) -> SmallVec<[NodeId; 4]> {
    let mut out: SmallVec<[NodeId; 4]> = SmallVec::new();
    for id in ids {
        if !out.contains(&id) {
            out.push(id);
        }
    }
    out
}

/// A combined forward+backward graph. The output's results are the
/// `num_forward_outputs` forward results followed by the gradients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JointGraph {
    pub graph: Graph,
    pub num_forward_outputs: usize,
}

impl JointGraph {
    pub fn new(graph: Graph, num_forward_outputs: usize) -> Result<Self, GraphError> {
        if graph.output_node().is_none() {
            return Err(GraphError::MissingOutput);
        }
        let available = graph.outputs().len();
        if num_forward_outputs > available {
            return Err(GraphError::ForwardOutputCount {
                declared: num_forward_outputs,
                available,
            });
        }
        Ok(Self {
            graph,
            num_forward_outputs,
        })
    }

    #[must_use]
    pub fn primals(&self) -> Vec<NodeId> {
        self.graph.placeholders_with_role(InputRole::Primal)
    }

    #[must_use]
    pub fn tangents(&self) -> Vec<NodeId> {
        self.graph.placeholders_with_role(InputRole::Tangent)
    }

    #[must_use]
    pub fn forward_outputs(&self) -> &[NodeId] {
        let outputs = self.graph.outputs();
        outputs.get(..self.num_forward_outputs).unwrap_or(outputs)
    }

    /// Empty when `num_forward_outputs` has been set past the result count.
    #[must_use]
    pub fn backward_outputs(&self) -> &[NodeId] {
        self.graph
            .outputs()
            .get(self.num_forward_outputs..)
            .unwrap_or_default()
    }
}
