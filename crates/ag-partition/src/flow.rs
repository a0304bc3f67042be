//! Flow networks and minimum source/sink cuts.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VertexId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EdgeId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Capacity {
    Finite(u64),
    Infinite,
}

impl Capacity {
    #[must_use]
    pub fn is_infinite(self) -> bool {
        matches!(self, Self::Infinite)
    }

    fn residual(self) -> u64 {
        match self {
            Self::Finite(value) => value,
            Self::Infinite => u64::MAX,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowEdge {
    pub from: VertexId,
    pub to: VertexId,
    pub capacity: Capacity,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlowNetwork {
    num_vertices: u32,
    edges: Vec<FlowEdge>,
}

impl FlowNetwork {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_vertex(&mut self) -> VertexId {
        let id = VertexId(self.num_vertices);
        self.num_vertices += 1;
        id
    }

    pub fn add_edge(&mut self, from: VertexId, to: VertexId, capacity: Capacity) -> EdgeId {
        let id = EdgeId(self.edges.len() as u32);
        self.edges.push(FlowEdge { from, to, capacity });
        id
    }

    #[must_use]
    pub fn num_vertices(&self) -> usize {
        self.num_vertices as usize
    }

    #[must_use]
    pub fn edges(&self) -> &[FlowEdge] {
        &self.edges
    }

    #[must_use]
    pub fn edge(&self, id: EdgeId) -> Option<&FlowEdge> {
        self.edges.get(id.0 as usize)
    }

    fn check_vertex(&self, vertex: VertexId) -> Result<(), FlowError> {
        if vertex.0 < self.num_vertices {
            Ok(())
        } else {
            Err(FlowError::UnknownVertex { vertex })
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FlowError {
    #[error("an infinite-capacity path connects source and sink")]
    Unbounded,
    #[error("vertex {vertex:?} is not part of the network")]
    UnknownVertex { vertex: VertexId },
    #[error("source and sink are the same vertex")]
    SourceIsSink,
}

/// A minimum cut: `source_side[v]` holds for vertices still reachable from
/// the source in the final residual network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MinCut {
    pub value: u64,
    pub source_side: Vec<bool>,
    /// Edges leaving the source side, in edge-id order. Zero-capacity edges
    /// whose head has no path to the sink are omitted.
    pub cut_edges: Vec<EdgeId>,
}

/// Pluggable max-flow/min-cut algorithm.
pub trait MinCutSolver {
    fn min_cut(
        &self,
        network: &FlowNetwork,
        source: VertexId,
        sink: VertexId,
    ) -> Result<MinCut, FlowError>;
}

/// Dinic's algorithm: BFS level graph plus blocking flows.
#[derive(Debug, Clone, Copy, Default)]
pub struct Dinic;

#[derive(Debug, Clone, Copy)]
struct Arc {
    to: usize,
    residual: u64,
}

struct Residual {
    arcs: Vec<Arc>,
    adjacency: Vec<Vec<usize>>,
    level: Vec<u32>,
    cursor: Vec<usize>,
}

impl Residual {
    // Arc 2i is edge i, arc 2i + 1 its reverse.
    fn build(network: &FlowNetwork) -> Self {
        let n = network.num_vertices();
        let mut arcs = Vec::with_capacity(network.edges.len() * 2);
        let mut adjacency = vec![Vec::new(); n];
        for edge in &network.edges {
            let (from, to) = (edge.from.0 as usize, edge.to.0 as usize);
            adjacency[from].push(arcs.len());
            arcs.push(Arc {
                to,
                residual: edge.capacity.residual(),
            });
            adjacency[to].push(arcs.len());
            arcs.push(Arc {
                to: from,
                residual: 0,
            });
        }
        Self {
            arcs,
            adjacency,
            level: vec![u32::MAX; n],
            cursor: vec![0; n],
        }
    }

    fn bfs_levels(&mut self, source: usize, sink: usize) -> bool {
        self.level.fill(u32::MAX);
        self.level[source] = 0;
        let mut queue = VecDeque::from([source]);
        while let Some(v) = queue.pop_front() {
            for &a in &self.adjacency[v] {
                let arc = self.arcs[a];
                if arc.residual > 0 && self.level[arc.to] == u32::MAX {
                    self.level[arc.to] = self.level[v] + 1;
                    queue.push_back(arc.to);
                }
            }
        }
        self.level[sink] != u32::MAX
    }

    /// Finds one augmenting path in the level graph and pushes its
    /// bottleneck. Iterative: a path may be as long as the graph.
    fn push(&mut self, source: usize, sink: usize) -> u64 {
        let mut path: Vec<usize> = Vec::new();
        let mut v = source;
        loop {
            if v == sink {
                let pushed = path
                    .iter()
                    .map(|&a| self.arcs[a].residual)
                    .min()
                    .unwrap_or(0);
                for &a in &path {
                    self.arcs[a].residual -= pushed;
                    self.arcs[a ^ 1].residual = self.arcs[a ^ 1].residual.saturating_add(pushed);
                }
                return pushed;
            }
            let mut next = None;
            while self.cursor[v] < self.adjacency[v].len() {
                let a = self.adjacency[v][self.cursor[v]];
                let Arc { to, residual } = self.arcs[a];
                if residual > 0 && self.level[to] == self.level[v] + 1 {
                    next = Some((a, to));
                    break;
                }
                self.cursor[v] += 1;
            }
            match next {
                Some((a, to)) => {
                    path.push(a);
                    v = to;
                }
                None => {
                    // Dead end: retreat and skip the arc that led here.
                    let Some(a) = path.pop() else {
                        return 0;
                    };
                    v = self.arcs[a ^ 1].to;
                    self.cursor[v] += 1;
                }
            }
        }
    }

    fn reachable_from(&self, source: usize) -> Vec<bool> {
        let mut seen = vec![false; self.adjacency.len()];
        seen[source] = true;
        let mut queue = VecDeque::from([source]);
        while let Some(v) = queue.pop_front() {
            for &a in &self.adjacency[v] {
                let arc = self.arcs[a];
                if arc.residual > 0 && !seen[arc.to] {
                    seen[arc.to] = true;
                    queue.push_back(arc.to);
                }
            }
        }
        seen
    }
}

/// Whether `sink` is reachable from `source` over infinite edges alone.
fn has_infinite_path(network: &FlowNetwork, source: usize, sink: usize) -> bool {
    let mut adjacency = vec![Vec::new(); network.num_vertices()];
    for edge in network.edges.iter().filter(|edge| edge.capacity.is_infinite()) {
        adjacency[edge.from.0 as usize].push(edge.to.0 as usize);
    }
    let mut seen = vec![false; network.num_vertices()];
    seen[source] = true;
    let mut stack = vec![source];
    while let Some(v) = stack.pop() {
        if v == sink {
            return true;
        }
        for &next in &adjacency[v] {
            if !seen[next] {
                seen[next] = true;
                stack.push(next);
            }
        }
    }
    false
}

/// Vertices with a path to `sink` in the network, regardless of capacity.
fn reaches(network: &FlowNetwork, sink: usize) -> Vec<bool> {
    let mut reverse = vec![Vec::new(); network.num_vertices()];
    for edge in &network.edges {
        reverse[edge.to.0 as usize].push(edge.from.0 as usize);
    }
    let mut seen = vec![false; network.num_vertices()];
    seen[sink] = true;
    let mut stack = vec![sink];
    while let Some(v) = stack.pop() {
        for &prev in &reverse[v] {
            if !seen[prev] {
                seen[prev] = true;
                stack.push(prev);
            }
        }
    }
    seen
}

impl MinCutSolver for Dinic {
    fn min_cut(
        &self,
        network: &FlowNetwork,
        source: VertexId,
        sink: VertexId,
    ) -> Result<MinCut, FlowError> {
        network.check_vertex(source)?;
        network.check_vertex(sink)?;
        for edge in &network.edges {
            network.check_vertex(edge.from)?;
            network.check_vertex(edge.to)?;
        }
        if source == sink {
            return Err(FlowError::SourceIsSink);
        }
        let (s, t) = (source.0 as usize, sink.0 as usize);
        // Every augmenting path then crosses a finite edge, so flow stays
        // bounded by the sum of finite capacities.
        if has_infinite_path(network, s, t) {
            return Err(FlowError::Unbounded);
        }

        let mut residual = Residual::build(network);
        let mut flow = 0_u64;
        while residual.bfs_levels(s, t) {
            residual.cursor.fill(0);
            loop {
                let pushed = residual.push(s, t);
                if pushed == 0 {
                    break;
                }
                flow = flow.saturating_add(pushed);
            }
        }

        let source_side = residual.reachable_from(s);
        let to_sink = reaches(network, t);
        // A zero-capacity edge into a vertex that cannot reach the sink
        // separates nothing and is left out of the cut.
        let cut_edges: Vec<EdgeId> = network
            .edges
            .iter()
            .enumerate()
            .filter(|(_, edge)| {
                source_side[edge.from.0 as usize] && !source_side[edge.to.0 as usize]
            })
            .filter(|(_, edge)| {
                edge.capacity != Capacity::Finite(0) || to_sink[edge.to.0 as usize]
            })
            .map(|(idx, _)| EdgeId(idx as u32))
            .collect();

        Ok(MinCut {
            value: flow,
            source_side,
            cut_edges,
        })
    }
}
