#![forbid(unsafe_code)]

pub mod compiled;
pub mod config;
pub mod errors;
pub mod function;

pub use compiled::{
    AotFunction, CompiledVariant, ForwardResult, PendingBackward, aot_function, aot_function_on,
    default_registry,
};
pub use config::AotConfig;
pub use errors::{ApiError, TraceError};
pub use function::{FnJoint, JointFunction};
