//! Interfaces every compile backend implements.
//!
//! A backend turns one extracted sub-graph plus example inputs into an
//! executable. The orchestrator treats both sides as opaque; it only relies
//! on the executable producing the same number of outputs on every call.

use ag_core::{Graph, Value};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    #[error("backend unavailable: {backend}")]
    Unavailable { backend: String },
    #[error("compile failed in {backend}: {detail}")]
    CompileFailed { backend: String, detail: String },
    #[error("execution failed: {detail}")]
    ExecutionFailed { detail: String },
    #[error("executable returned {actual} outputs, expected {expected}")]
    OutputArity { expected: usize, actual: usize },
}

/// A compiled sub-graph.
pub trait Executable: Send + Sync {
    fn execute(&self, args: &[Value]) -> Result<Vec<Value>, BackendError>;

    /// Fixed output arity of every successful `execute`.
    fn num_outputs(&self) -> usize;
}

pub trait BackendCompiler: Send + Sync {
    fn name(&self) -> &str;

    /// Compiles `graph`. `example_inputs` follow the graph's placeholder
    /// order and may be used for specialization.
    fn compile(
        &self,
        graph: &Graph,
        example_inputs: &[Value],
    ) -> Result<Arc<dyn Executable>, BackendError>;
}

/// Runs `executable` and rejects results whose arity differs from the
/// declared one.
pub fn execute_checked(
    executable: &dyn Executable,
    args: &[Value],
) -> Result<Vec<Value>, BackendError> {
    let outputs = executable.execute(args)?;
    let expected = executable.num_outputs();
    if outputs.len() != expected {
        return Err(BackendError::OutputArity {
            expected,
            actual: outputs.len(),
        });
    }
    Ok(outputs)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Lying;

    impl Executable for Lying {
        fn execute(&self, args: &[Value]) -> Result<Vec<Value>, BackendError> {
            Ok(args.to_vec())
        }

        fn num_outputs(&self) -> usize {
            1
        }
    }

    #[test]
    fn backend_error_display() {
        let err = BackendError::Unavailable {
            backend: "tpu".to_owned(),
        };
        assert_eq!(err.to_string(), "backend unavailable: tpu");

        let err = BackendError::CompileFailed {
            backend: "cpu".to_owned(),
            detail: "unsupported op".to_owned(),
        };
        assert!(err.to_string().contains("unsupported op"));
    }

    #[test]
    fn arity_is_checked() {
        let one = Value::scalar_i64(1);
        assert_eq!(
            execute_checked(&Lying, &[one.clone()]).expect("one output"),
            vec![one.clone()]
        );
        assert_eq!(
            execute_checked(&Lying, &[one.clone(), one]),
            Err(BackendError::OutputArity {
                expected: 1,
                actual: 2
            })
        );
    }
}
