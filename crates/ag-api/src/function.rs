//! Functions that can be traced into a joint forward/backward graph.

use ag_cache::FunctionId;
use ag_core::fixtures::{JointSpec, build_joint};
use ag_core::{JointGraph, Value};

use crate::errors::TraceError;

/// The autodiff side of the contract: given example primals, produce the
/// joint graph `(primals, tangents) -> (forward outputs, gradients)`.
pub trait JointFunction: Send + Sync {
    /// Stable identity used in cache keys.
    fn id(&self) -> FunctionId;

    fn trace_joint(&self, example_primals: &[Value]) -> Result<JointGraph, TraceError>;
}

/// Adapts a closure that builds the joint graph.
pub struct FnJoint<F> {
    id: FunctionId,
    trace: F,
}

impl<F> FnJoint<F>
where
    F: Fn(&[Value]) -> Result<JointGraph, TraceError> + Send + Sync,
{
    pub fn new(name: &str, trace: F) -> Self {
        Self {
            id: FunctionId::from_name(name),
            trace,
        }
    }
}

impl<F> std::fmt::Debug for FnJoint<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnJoint").field("id", &self.id).finish()
    }
}

impl<F> JointFunction for FnJoint<F>
where
    F: Fn(&[Value]) -> Result<JointGraph, TraceError> + Send + Sync,
{
    fn id(&self) -> FunctionId {
        self.id
    }

    fn trace_joint(&self, example_primals: &[Value]) -> Result<JointGraph, TraceError> {
        (self.trace)(example_primals)
    }
}

/// Built-in programs trace to their fixed joint graph once the primals match
/// the declared signature.
impl JointFunction for JointSpec {
    fn id(&self) -> FunctionId {
        FunctionId::from_name(self.as_str())
    }

    fn trace_joint(&self, example_primals: &[Value]) -> Result<JointGraph, TraceError> {
        let avals = self.primal_avals();
        if example_primals.len() != avals.len() {
            return Err(TraceError::Arity {
                expected: avals.len(),
                actual: example_primals.len(),
            });
        }
        for (index, (value, aval)) in example_primals.iter().zip(&avals).enumerate() {
            let actual = value.as_tensor().map(|tensor| tensor.abstract_value());
            if actual.as_ref() != Some(aval) {
                return Err(TraceError::Signature {
                    index,
                    detail: format!("expected {aval:?}, got {actual:?}"),
                });
            }
        }
        Ok(build_joint(*self)?)
    }
}
