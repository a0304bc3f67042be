//! Closed sub-graph extraction.
//!
//! Walks the source graph in order, mapping each node either to a proxy in
//! the new graph or to `Invalid`. Declared inputs become fresh placeholders
//! (in declaration order); undeclared placeholders are invalid; a call is
//! replayed only when all of its node arguments have proxies, otherwise the
//! invalidity propagates. Constants are always copied. The result is closed
//! by dead-code elimination, so only what the outputs need survives.

use ag_core::{Arg, Graph, GraphError, InputRole, NodeId, NodeKind};
use smallvec::SmallVec;
use tracing::debug;

use crate::PartitionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mapped {
    Proxy(NodeId),
    Invalid,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Extracted {
    pub graph: Graph,
    /// Placeholder ids in the new graph, one per requested input, in order.
    pub inputs: Vec<NodeId>,
}

pub fn extract_subgraph(
    source: &Graph,
    inputs: &[NodeId],
    outputs: &[NodeId],
) -> Result<Extracted, PartitionError> {
    let mut env: Vec<Option<Mapped>> = vec![None; source.id_bound()];
    let mut graph = Graph::new();
    let mut new_inputs = Vec::with_capacity(inputs.len());

    for &input in inputs {
        let node = source
            .node(input)
            .ok_or(PartitionError::UnknownNode { node: input })?;
        if node.is_output() {
            return Err(GraphError::OutputReference { node: input }.into());
        }
        if env[input.index()].is_some() {
            return Err(PartitionError::DuplicateInput { node: input });
        }
        // An intermediate cut into an input keeps its traced metadata but
        // declares no shape, so the extracted graph accepts any shape the
        // producer would have computed.
        let (role, aval) = match &node.kind {
            NodeKind::Placeholder { role, aval } => (*role, aval.clone()),
            _ => (InputRole::Primal, None),
        };
        let id = graph.add_placeholder(&node.name, role, aval)?;
        if let Some(meta) = &node.meta {
            graph.set_meta(id, meta.clone())?;
        }
        env[input.index()] = Some(Mapped::Proxy(id));
        new_inputs.push(id);
    }

    for node in source.nodes() {
        if env[node.id.index()].is_some() {
            continue;
        }
        let mapped = match &node.kind {
            NodeKind::Placeholder { .. } => Mapped::Invalid,
            NodeKind::Constant { value } => {
                Mapped::Proxy(graph.add_constant(&node.name, value.clone())?)
            }
            NodeKind::Call { op, args, params } => {
                let mut new_args: SmallVec<[Arg; 4]> = SmallVec::with_capacity(args.len());
                let mut reproducible = true;
                for arg in args {
                    match arg {
                        Arg::Lit(lit) => new_args.push(Arg::Lit(*lit)),
                        Arg::Node(id) => match env.get(id.index()).copied().flatten() {
                            Some(Mapped::Proxy(proxy)) => new_args.push(Arg::Node(proxy)),
                            Some(Mapped::Invalid) | None => {
                                reproducible = false;
                                break;
                            }
                        },
                    }
                }
                if reproducible {
                    Mapped::Proxy(graph.add_named_operation(
                        &node.name,
                        *op,
                        new_args,
                        params.clone(),
                    )?)
                } else {
                    Mapped::Invalid
                }
            }
            NodeKind::Output { .. } => continue,
        };
        if let (Mapped::Proxy(id), Some(meta)) = (mapped, &node.meta) {
            graph.set_meta(id, meta.clone())?;
        }
        env[node.id.index()] = Some(mapped);
    }

    let results = outputs
        .iter()
        .map(|&id| match env.get(id.index()).copied().flatten() {
            Some(Mapped::Proxy(proxy)) => Ok(proxy),
            Some(Mapped::Invalid) | None => Err(PartitionError::Unsatisfiable {
                node: id,
                name: source
                    .node(id)
                    .map_or_else(|| id.to_string(), |node| node.name.clone()),
            }),
        })
        .collect::<Result<Vec<_>, _>>()?;
    graph.set_output(results)?;

    let removed = graph.eliminate_dead_code();
    debug!(
        inputs = inputs.len(),
        outputs = outputs.len(),
        nodes = graph.len(),
        removed,
        "extracted sub-graph"
    );

    Ok(Extracted {
        graph,
        inputs: new_inputs,
    })
}
