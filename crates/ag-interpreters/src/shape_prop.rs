//! Size oracle: annotates every node with its value kind and byte size.

use ag_core::{Graph, GraphError, NodeId, Value};
use tracing::debug;

use crate::{InterpreterError, eval_graph_traced};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OracleError {
    #[error("size propagation failed: {0}")]
    Interpreter(#[from] InterpreterError),
    #[error("no value was recorded for node {node}")]
    MissingNode { node: NodeId },
    #[error(transparent)]
    Graph(#[from] GraphError),
}

/// Fills in `Node::meta` for every value-producing node of a graph.
///
/// Partitioners that weigh values by size require this to have run first.
pub trait SizeOracle: Send + Sync {
    fn annotate(&self, graph: &mut Graph, example_args: &[Value]) -> Result<(), OracleError>;
}

/// Derives metadata by evaluating the graph once on example inputs.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShapePropagation;

impl SizeOracle for ShapePropagation {
    fn annotate(&self, graph: &mut Graph, example_args: &[Value]) -> Result<(), OracleError> {
        let trace = eval_graph_traced(graph, example_args)?;
        let ids: Vec<NodeId> = graph
            .nodes()
            .filter(|node| !node.is_output())
            .map(|node| node.id)
            .collect();

        let mut total_bytes = 0_u64;
        for id in ids {
            let meta = trace
                .values
                .get(&id)
                .ok_or(OracleError::MissingNode { node: id })?
                .meta();
            total_bytes = total_bytes.saturating_add(meta.nbytes);
            graph.set_meta(id, meta)?;
        }
        debug!(nodes = trace.values.len(), total_bytes, "shape propagation annotated graph");
        Ok(())
    }
}
