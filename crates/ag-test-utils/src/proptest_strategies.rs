//! Random joint graphs for property tests.
//!
//! Every value is an `f64[3]` vector, so any unary or binary elementwise op
//! can consume any earlier value. Backward steps always start from a tangent
//! and may pull in forward values, which is what gives partitioners something
//! to decide.

use ag_core::{AbstractValue, Arg, DType, Graph, GraphError, InputRole, JointGraph, NodeId, Op, Value};
use proptest::prelude::*;
use std::collections::BTreeMap;

pub const VECTOR_LEN: u32 = 3;

const FORWARD_OPS: [Op; 10] = [
    Op::Sin,
    Op::Cos,
    Op::Tanh,
    Op::Neg,
    Op::Relu,
    Op::Clone,
    Op::Add,
    Op::Sub,
    Op::Mul,
    Op::RandLike,
];

const BACKWARD_OPS: [Op; 6] = [Op::Neg, Op::Sin, Op::Clone, Op::Add, Op::Sub, Op::Mul];

/// One operator application. Operand indices are reduced modulo the number
/// of values available when the step is replayed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Step {
    pub op: Op,
    pub lhs: usize,
    pub rhs: usize,
}

/// A recipe for a joint graph, kept separate from the graph itself so that
/// proptest can shrink it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JointRecipe {
    pub num_primals: usize,
    pub forward: Vec<Step>,
    pub backward: Vec<Step>,
    pub extra_forward_output: bool,
}

fn vector_aval() -> AbstractValue {
    AbstractValue::new(DType::F64, &[VECTOR_LEN])
}

fn is_binary(op: Op) -> bool {
    matches!(op, Op::Add | Op::Sub | Op::Mul)
}

impl JointRecipe {
    #[must_use]
    pub fn num_forward_outputs(&self) -> usize {
        if self.extra_forward_output { 2 } else { 1 }
    }

    /// Builds the joint graph: `primals_*`, then one `tangents_*` per forward
    /// output, then forward and backward steps. Each primal gets one gradient.
    pub fn build(&self) -> Result<JointGraph, GraphError> {
        let mut graph = Graph::new();
        let mut forward = Vec::with_capacity(self.num_primals + self.forward.len());
        for position in 0..self.num_primals {
            forward.push(graph.add_placeholder(
                &format!("primals_{}", position + 1),
                InputRole::Primal,
                Some(vector_aval()),
            )?);
        }
        let mut backward = Vec::new();
        for position in 0..self.num_forward_outputs() {
            backward.push(graph.add_placeholder(
                &format!("tangents_{}", position + 1),
                InputRole::Tangent,
                Some(vector_aval()),
            )?);
        }

        for (position, step) in self.forward.iter().enumerate() {
            let lhs = forward[step.lhs % forward.len()];
            let node = if step.op == Op::RandLike {
                let params = BTreeMap::from([("seed".to_owned(), position.to_string())]);
                graph.add_operation_with_params(step.op, [Arg::Node(lhs)], params)?
            } else if is_binary(step.op) {
                let rhs = forward[step.rhs % forward.len()];
                graph.add_operation(step.op, [Arg::Node(lhs), Arg::Node(rhs)])?
            } else {
                graph.add_operation(step.op, [Arg::Node(lhs)])?
            };
            forward.push(node);
        }

        for step in &self.backward {
            let lhs = backward[step.lhs % backward.len()];
            let node = if is_binary(step.op) {
                // The right operand comes from the forward values, so the
                // backward graph depends on what the forward graph computed.
                let rhs = forward[step.rhs % forward.len()];
                graph.add_operation(step.op, [Arg::Node(lhs), Arg::Node(rhs)])?
            } else {
                graph.add_operation(step.op, [Arg::Node(lhs)])?
            };
            backward.push(node);
        }

        let mut results: Vec<NodeId> = Vec::new();
        results.push(*forward.last().ok_or(GraphError::MissingOutput)?);
        if self.extra_forward_output {
            results.push(forward[forward.len() / 2]);
        }
        for position in 0..self.num_primals {
            results.push(backward[backward.len() - 1 - position % backward.len()]);
        }
        graph.set_output(results)?;
        JointGraph::new(graph, self.num_forward_outputs())
    }

    /// Deterministic primals then unit tangents.
    pub fn example_args(&self) -> Result<Vec<Value>, ag_core::ValueError> {
        let mut args = Vec::with_capacity(self.num_primals + self.num_forward_outputs());
        for position in 0..self.num_primals {
            let base = 0.3 + position as f64 * 0.4;
            let data = (0..VECTOR_LEN).map(|i| base + f64::from(i) * 0.2).collect();
            args.push(Value::tensor_f64(&[VECTOR_LEN], data)?);
        }
        for _ in 0..self.num_forward_outputs() {
            args.push(Value::tensor_f64(
                &[VECTOR_LEN],
                vec![1.0; VECTOR_LEN as usize],
            )?);
        }
        Ok(args)
    }
}

pub fn arb_step(ops: &'static [Op]) -> impl Strategy<Value = Step> {
    (prop::sample::select(ops), any::<usize>(), any::<usize>())
        .prop_map(|(op, lhs, rhs)| Step { op, lhs, rhs })
}

pub fn arb_joint_recipe() -> impl Strategy<Value = JointRecipe> {
    (
        1_usize..=3,
        prop::collection::vec(arb_step(&FORWARD_OPS), 1..8),
        prop::collection::vec(arb_step(&BACKWARD_OPS), 0..8),
        any::<bool>(),
    )
        .prop_map(|(num_primals, forward, backward, extra_forward_output)| JointRecipe {
            num_primals,
            forward,
            backward,
            extra_forward_output,
        })
}
