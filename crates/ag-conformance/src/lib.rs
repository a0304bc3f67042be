#![forbid(unsafe_code)]

//! Recomposition checks: running a partition's forward graph, threading its
//! saved values into the backward graph and comparing against the joint
//! graph run in one piece.

use ag_core::fixtures::{JointSpec, build_joint};
use ag_core::{GraphError, JointGraph, Value, ValueError};
use ag_interpreters::{InterpreterError, OracleError, ShapePropagation, SizeOracle, eval_graph};
use ag_partition::{Partition, PartitionError, PartitionerKind};
use serde::{Deserialize, Serialize};
use tracing::debug;

pub const DEFAULT_TOLERANCE: f64 = 1e-12;

#[derive(Debug, thiserror::Error)]
pub enum ConformanceError {
    #[error(transparent)]
    Interpreter(#[from] InterpreterError),
    #[error(transparent)]
    Oracle(#[from] OracleError),
    #[error(transparent)]
    Partition(#[from] PartitionError),
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error(transparent)]
    Value(#[from] ValueError),
    #[error("forward graph returned {actual} values, expected at least {expected}")]
    ForwardArity { expected: usize, actual: usize },
}

/// Forward outputs followed by gradients, as the joint graph returns them.
pub fn run_joint(joint: &JointGraph, args: &[Value]) -> Result<Vec<Value>, ConformanceError> {
    Ok(eval_graph(&joint.graph, args)?)
}

/// Runs `partition` in two steps. `joint_args` are primals then tangents,
/// the joint graph's calling convention.
pub fn run_partitioned(
    partition: &Partition,
    joint_args: &[Value],
) -> Result<Vec<Value>, ConformanceError> {
    let num_primals = partition.forward.placeholders().len();
    let (primals, tangents) = joint_args.split_at(num_primals.min(joint_args.len()));

    let mut outputs = eval_graph(&partition.forward, primals)?;
    if outputs.len() < partition.num_forward_outputs {
        return Err(ConformanceError::ForwardArity {
            expected: partition.num_forward_outputs,
            actual: outputs.len(),
        });
    }
    let saved = outputs.split_off(partition.num_forward_outputs);

    let mut backward_args = saved;
    backward_args.extend(tangents.iter().cloned());
    outputs.extend(eval_graph(&partition.backward, &backward_args)?);
    Ok(outputs)
}

/// Element-wise comparison with an absolute tolerance. Non-tensors must be
/// equal.
#[must_use]
pub fn values_close(a: &Value, b: &Value, tolerance: f64) -> bool {
    match (a.as_tensor(), b.as_tensor()) {
        (Some(x), Some(y)) => {
            x.shape == y.shape
                && x.data.len() == y.data.len()
                && x.data
                    .iter()
                    .zip(&y.data)
                    .all(|(p, q)| (p - q).abs() <= tolerance)
        }
        _ => a == b,
    }
}

#[must_use]
pub fn all_close(a: &[Value], b: &[Value], tolerance: f64) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| values_close(x, y, tolerance))
}

/// Annotates `joint` with sizes taken from one run on `args`.
pub fn annotate(joint: &mut JointGraph, args: &[Value]) -> Result<(), ConformanceError> {
    ShapePropagation.annotate(&mut joint.graph, args)?;
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaseReport {
    pub fixture: String,
    pub partitioner: String,
    pub saved: Vec<String>,
    pub saved_bytes: Option<u64>,
    pub recomposes: bool,
}

/// Partitions one fixture and checks that the halves recompose.
pub fn check_fixture(
    spec: JointSpec,
    kind: PartitionerKind,
) -> Result<CaseReport, ConformanceError> {
    let mut joint = build_joint(spec)?;
    let args = spec.example_joint_args()?;
    annotate(&mut joint, &args)?;

    let partition = kind.build(Default::default()).partition(&joint)?;
    let expected = run_joint(&joint, &args)?;
    let actual = run_partitioned(&partition, &args)?;
    let report = CaseReport {
        fixture: spec.as_str().to_owned(),
        partitioner: kind.as_str().to_owned(),
        saved: partition.saved.iter().map(|saved| saved.name.clone()).collect(),
        saved_bytes: partition.saved_bytes(),
        recomposes: all_close(&expected, &actual, DEFAULT_TOLERANCE),
    };
    debug!(
        fixture = %report.fixture,
        partitioner = %report.partitioner,
        recomposes = report.recomposes,
        "checked fixture"
    );
    Ok(report)
}

/// Every fixture under every partitioner.
pub fn run_fixture_suite() -> Result<Vec<CaseReport>, ConformanceError> {
    let mut reports = Vec::new();
    for spec in JointSpec::ALL {
        for kind in [PartitionerKind::Default, PartitionerKind::MinCut] {
            reports.push(check_fixture(spec, kind)?);
        }
    }
    Ok(reports)
}
