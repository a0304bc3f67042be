use ag_core::{GraphError, ValueError};
use ag_interpreters::OracleError;
use ag_partition::PartitionError;
use ag_runtime::BackendError;

/// Failure while turning a function into its joint forward/backward graph.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TraceError {
    #[error("traced function takes {expected} primals, got {actual}")]
    Arity { expected: usize, actual: usize },
    #[error("primal {index} has the wrong shape: {detail}")]
    Signature { index: usize, detail: String },
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error("tracing failed: {0}")]
    Other(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Trace(#[from] TraceError),
    #[error(transparent)]
    Oracle(#[from] OracleError),
    #[error(transparent)]
    Partition(#[from] PartitionError),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Value(#[from] ValueError),
    #[error("tangent `{name}` has no declared shape")]
    TangentShape { name: String },
    #[error("expected {expected} gradients, got {actual}")]
    GradientArity { expected: usize, actual: usize },
    #[error("invalid value `{value}` for {var}")]
    Config { var: String, value: String },
}
