//! Reference backend: "compiling" a sub-graph means validating it once and
//! keeping it for the interpreter. Always available, no external toolchain.

#![forbid(unsafe_code)]

mod executor;

pub use executor::{InterpretedGraph, InterpreterCompiler};
