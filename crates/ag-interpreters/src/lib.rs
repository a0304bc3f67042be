#![forbid(unsafe_code)]

pub mod shape_prop;

pub use shape_prop::{OracleError, ShapePropagation, SizeOracle};

use ag_core::{AbstractValue, Arg, Graph, NodeId, NodeKind, Value};
use ag_kernels::{EvalError, eval_op};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InterpreterError {
    #[error("input arity mismatch: expected {expected}, got {actual}")]
    InputArity { expected: usize, actual: usize },
    #[error("input {node} expects {expected:?}, got {actual:?}")]
    InputMismatch {
        node: NodeId,
        expected: AbstractValue,
        actual: Option<AbstractValue>,
    },
    #[error("missing value for node {0}")]
    MissingValue(NodeId),
    #[error("graph has no output node")]
    MissingOutput,
    #[error("node {node} failed: {source}")]
    Kernel {
        node: NodeId,
        #[source]
        source: EvalError,
    },
}

/// Every intermediate value of one evaluation, keyed by node.
#[derive(Debug, Clone, PartialEq)]
pub struct Trace {
    pub values: BTreeMap<NodeId, Value>,
    pub outputs: Vec<Value>,
}

/// Runs `graph` on `args`, which bind to placeholders in graph order.
pub fn eval_graph(graph: &Graph, args: &[Value]) -> Result<Vec<Value>, InterpreterError> {
    eval_graph_traced(graph, args).map(|trace| trace.outputs)
}

pub fn eval_graph_traced(graph: &Graph, args: &[Value]) -> Result<Trace, InterpreterError> {
    let placeholders = graph.placeholders();
    if args.len() != placeholders.len() {
        return Err(InterpreterError::InputArity {
            expected: placeholders.len(),
            actual: args.len(),
        });
    }

    let mut env: BTreeMap<NodeId, Value> = BTreeMap::new();
    let mut next_arg = args.iter();
    let mut outputs = None;

    for node in graph.nodes() {
        match &node.kind {
            NodeKind::Placeholder { aval, .. } => {
                let value = next_arg
                    .next()
                    .ok_or(InterpreterError::MissingValue(node.id))?;
                if let Some(expected) = aval {
                    let actual = value.as_tensor().map(|t| t.abstract_value());
                    if actual.as_ref() != Some(expected) {
                        return Err(InterpreterError::InputMismatch {
                            node: node.id,
                            expected: expected.clone(),
                            actual,
                        });
                    }
                }
                env.insert(node.id, value.clone());
            }
            NodeKind::Constant { value } => {
                env.insert(node.id, value.clone());
            }
            NodeKind::Call { op, args, params } => {
                let resolved = args
                    .iter()
                    .map(|arg| match arg {
                        Arg::Node(id) => env
                            .get(id)
                            .cloned()
                            .ok_or(InterpreterError::MissingValue(*id)),
                        Arg::Lit(lit) => Ok(Value::Scalar(*lit)),
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                let value = eval_op(*op, &resolved, params).map_err(|source| {
                    InterpreterError::Kernel {
                        node: node.id,
                        source,
                    }
                })?;
                env.insert(node.id, value);
            }
            NodeKind::Output { results } => {
                outputs = Some(
                    results
                        .iter()
                        .map(|id| {
                            env.get(id)
                                .cloned()
                                .ok_or(InterpreterError::MissingValue(*id))
                        })
                        .collect::<Result<Vec<_>, _>>()?,
                );
            }
        }
    }

    let outputs = outputs.ok_or(InterpreterError::MissingOutput)?;
    Ok(Trace {
        values: env,
        outputs,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ag_core::fixtures::{JointSpec, build_joint};
    use ag_core::{DType, InputRole, Op};

    #[test]
    fn mul_sum_fixture_evaluates() {
        let joint = build_joint(JointSpec::MulSum).expect("fixture");
        let args = JointSpec::MulSum.example_joint_args().expect("args");
        let outputs = eval_graph(&joint.graph, &args).expect("eval");
        assert_eq!(outputs.len(), 2);

        let a = args[0].as_tensor().expect("a");
        let b = args[1].as_tensor().expect("b");
        // d/da sum(a * b) with a [4,1,3], b [1,4,3] sums b over its rows.
        let grad = outputs[1].as_tensor().expect("grad");
        assert_eq!(grad.shape, a.shape);
        for col in 0..3 {
            let expected: f64 = (0..4).map(|row| b.data[row * 3 + col]).sum();
            for i in 0..4 {
                assert!((grad.data[i * 3 + col] - expected).abs() < 1e-12);
            }
        }
    }

    #[test]
    fn chain_gradient_matches_closed_form() {
        let joint = build_joint(JointSpec::Chain).expect("fixture");
        let args = JointSpec::Chain.example_joint_args().expect("args");
        let outputs = eval_graph(&joint.graph, &args).expect("eval");
        let x = &args[0].as_tensor().expect("x").data;
        let grad = &outputs[1].as_tensor().expect("grad").data;
        for (g, x) in grad.iter().zip(x) {
            let expected = -x.sin().sin() * x.cos();
            assert!((g - expected).abs() < 1e-12);
        }
    }

    #[test]
    fn input_arity_mismatch_is_reported() {
        let joint = build_joint(JointSpec::MulSum).expect("fixture");
        let err = eval_graph(&joint.graph, &[]).expect_err("no args");
        assert_eq!(
            err,
            InterpreterError::InputArity {
                expected: 3,
                actual: 0
            }
        );
    }

    #[test]
    fn declared_input_shape_is_enforced() {
        let mut graph = Graph::new();
        let x = graph
            .add_placeholder(
                "primals_1",
                InputRole::Primal,
                Some(AbstractValue::new(DType::F64, &[2])),
            )
            .expect("input");
        let y = graph.add_operation(Op::Neg, [Arg::Node(x)]).expect("neg");
        graph.set_output(vec![y]).expect("output");

        let wrong = Value::tensor_f64(&[3], vec![0.0; 3]).expect("tensor");
        assert!(matches!(
            eval_graph(&graph, &[wrong]),
            Err(InterpreterError::InputMismatch { .. })
        ));
    }

    #[test]
    fn kernel_failures_name_the_node() {
        let mut graph = Graph::new();
        let x = graph.add_input("x").expect("input");
        let y = graph.add_input("y").expect("input");
        let z = graph
            .add_operation(Op::MatMul, [Arg::Node(x), Arg::Node(y)])
            .expect("matmul");
        graph.set_output(vec![z]).expect("output");

        let v = Value::tensor_f64(&[3], vec![0.0; 3]).expect("tensor");
        let err = eval_graph(&graph, &[v.clone(), v]).expect_err("rank-1 matmul");
        assert!(matches!(err, InterpreterError::Kernel { node, .. } if node == z));
    }
}
