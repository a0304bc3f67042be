//! Interpreter-backed compiler and executable.

use ag_core::{Graph, Value};
use ag_interpreters::eval_graph;
use ag_runtime::{BackendCompiler, BackendError, Executable};
use std::sync::Arc;
use tracing::debug;

const BACKEND_NAME: &str = "cpu";

#[derive(Debug, Clone, Copy, Default)]
pub struct InterpreterCompiler;

impl InterpreterCompiler {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    fn compile_failed(detail: impl Into<String>) -> BackendError {
        BackendError::CompileFailed {
            backend: BACKEND_NAME.to_owned(),
            detail: detail.into(),
        }
    }
}

impl BackendCompiler for InterpreterCompiler {
    fn name(&self) -> &str {
        BACKEND_NAME
    }

    fn compile(
        &self,
        graph: &Graph,
        example_inputs: &[Value],
    ) -> Result<Arc<dyn Executable>, BackendError> {
        graph
            .validate_well_formed()
            .map_err(|err| Self::compile_failed(err.to_string()))?;
        let num_inputs = graph.placeholders().len();
        if example_inputs.len() != num_inputs {
            return Err(Self::compile_failed(format!(
                "graph takes {num_inputs} inputs, {} examples given",
                example_inputs.len()
            )));
        }
        debug!(
            nodes = graph.len(),
            inputs = num_inputs,
            outputs = graph.outputs().len(),
            "compiled sub-graph for interpretation"
        );
        Ok(Arc::new(InterpretedGraph {
            num_outputs: graph.outputs().len(),
            graph: graph.clone(),
        }))
    }
}

/// A validated graph run by `eval_graph` on every call.
#[derive(Debug, Clone)]
pub struct InterpretedGraph {
    graph: Graph,
    num_outputs: usize,
}

impl InterpretedGraph {
    #[must_use]
    pub fn graph(&self) -> &Graph {
        &self.graph
    }
}

impl Executable for InterpretedGraph {
    fn execute(&self, args: &[Value]) -> Result<Vec<Value>, BackendError> {
        eval_graph(&self.graph, args).map_err(|err| BackendError::ExecutionFailed {
            detail: err.to_string(),
        })
    }

    fn num_outputs(&self) -> usize {
        self.num_outputs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ag_core::fixtures::{JointSpec, build_joint};
    use ag_core::{Arg, Op};
    use ag_partition::{DefaultPartitioner, Partitioner};
    use ag_runtime::execute_checked;

    #[test]
    fn cpu_backend_name() {
        assert_eq!(InterpreterCompiler.name(), "cpu");
    }

    #[test]
    fn compiled_joint_matches_interpreter() {
        let spec = JointSpec::Chain;
        let joint = build_joint(spec).expect("fixture");
        let args = spec.example_joint_args().expect("args");
        let executable = InterpreterCompiler
            .compile(&joint.graph, &args)
            .expect("compile");
        assert_eq!(executable.num_outputs(), 2);
        let outputs = execute_checked(executable.as_ref(), &args).expect("run");
        assert_eq!(outputs, eval_graph(&joint.graph, &args).expect("eval"));
    }

    #[test]
    fn forward_half_of_a_partition_runs() {
        let spec = JointSpec::MulSum;
        let joint = build_joint(spec).expect("fixture");
        let partition = DefaultPartitioner.partition(&joint).expect("partition");
        let primals = spec.example_primals().expect("primals");
        let forward = InterpreterCompiler
            .compile(&partition.forward, &primals)
            .expect("compile forward");
        let outputs = forward.execute(&primals).expect("run");
        assert_eq!(outputs.len(), 1 + partition.num_saved());
        assert_eq!(outputs[1], primals[1]);
    }

    #[test]
    fn example_arity_is_checked_at_compile_time() {
        let joint = build_joint(JointSpec::Chain).expect("fixture");
        let err = InterpreterCompiler
            .compile(&joint.graph, &[Value::scalar_f64(1.0)])
            .err()
            .expect("arity mismatch");
        assert!(matches!(err, BackendError::CompileFailed { .. }));
        assert!(err.to_string().contains("2 inputs"));
    }

    #[test]
    fn unsealed_graph_is_rejected() {
        let mut graph = Graph::new();
        let x = graph.add_input("x").expect("x");
        graph.add_operation(Op::Neg, [Arg::Node(x)]).expect("neg");
        let err = InterpreterCompiler
            .compile(&graph, &[Value::scalar_f64(1.0)])
            .err()
            .expect("no output");
        assert!(matches!(err, BackendError::CompileFailed { .. }));
    }

    #[test]
    fn execution_errors_are_reported() {
        let joint = build_joint(JointSpec::Chain).expect("fixture");
        let args = JointSpec::Chain.example_joint_args().expect("args");
        let executable = InterpreterCompiler
            .compile(&joint.graph, &args)
            .expect("compile");
        let err = executable
            .execute(&args[..1])
            .expect_err("missing tangent");
        assert!(matches!(err, BackendError::ExecutionFailed { .. }));
    }
}
