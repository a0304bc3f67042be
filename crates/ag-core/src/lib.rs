#![forbid(unsafe_code)]

pub mod fixtures;
pub mod graph;

pub use graph::{
    Arg, Graph, GraphError, InputRole, JointGraph, Node, NodeId, NodeKind, UserIndex,
};

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    F32,
    F64,
    I64,
    Bool,
}

impl DType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::F32 => "f32",
            Self::F64 => "f64",
            Self::I64 => "i64",
            Self::Bool => "bool",
        }
    }

    /// Width of one element in bytes.
    #[must_use]
    pub fn byte_width(self) -> u64 {
        match self {
            Self::F32 => 4,
            Self::F64 | Self::I64 => 8,
            Self::Bool => 1,
        }
    }

    /// Stable small integer used when hashing argument signatures.
    #[must_use]
    pub fn code(self) -> i64 {
        match self {
            Self::F32 => 1,
            Self::F64 => 2,
            Self::I64 => 3,
            Self::Bool => 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Shape {
    pub dims: Vec<u32>,
}

impl Shape {
    #[must_use]
    pub fn scalar() -> Self {
        Self { dims: Vec::new() }
    }

    #[must_use]
    pub fn vector(len: u32) -> Self {
        Self { dims: vec![len] }
    }

    #[must_use]
    pub fn new(dims: &[u32]) -> Self {
        Self {
            dims: dims.to_vec(),
        }
    }

    #[must_use]
    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    #[must_use]
    pub fn element_count(&self) -> Option<u64> {
        self.dims
            .iter()
            .try_fold(1_u64, |acc, dim| acc.checked_mul(u64::from(*dim)))
    }

    /// Row-major strides in elements.
    #[must_use]
    pub fn contiguous_strides(&self) -> Vec<u64> {
        let mut strides = vec![1_u64; self.dims.len()];
        for axis in (0..self.dims.len().saturating_sub(1)).rev() {
            strides[axis] = strides[axis + 1] * u64::from(self.dims[axis + 1]);
        }
        strides
    }

    /// Parses the `2,3,4` form used in operator params. The empty string is
    /// the rank-0 shape.
    pub fn parse(text: &str) -> Result<Self, ValueError> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Ok(Self::scalar());
        }
        let dims = trimmed
            .split(',')
            .map(|part| {
                part.trim().parse::<u32>().map_err(|_| ValueError::MalformedShape {
                    text: text.to_owned(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { dims })
    }

    #[must_use]
    pub fn to_param(&self) -> String {
        self.dims
            .iter()
            .map(u32::to_string)
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.to_param())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AbstractValue {
    pub dtype: DType,
    pub shape: Shape,
}

impl AbstractValue {
    #[must_use]
    pub fn new(dtype: DType, dims: &[u32]) -> Self {
        Self {
            dtype,
            shape: Shape::new(dims),
        }
    }

    #[must_use]
    pub fn nbytes(&self) -> Option<u64> {
        self.shape
            .element_count()
            .and_then(|count| count.checked_mul(self.dtype.byte_width()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Literal {
    I64(i64),
    Bool(bool),
    F64Bits(u64),
}

impl Literal {
    #[must_use]
    pub fn from_f64(value: f64) -> Self {
        Self::F64Bits(value.to_bits())
    }

    #[must_use]
    pub fn as_f64(self) -> Option<f64> {
        match self {
            Self::F64Bits(bits) => Some(f64::from_bits(bits)),
            Self::I64(value) => Some(value as f64),
            Self::Bool(_) => None,
        }
    }

    #[must_use]
    pub fn as_i64(self) -> Option<i64> {
        match self {
            Self::I64(value) => Some(value),
            Self::Bool(_) | Self::F64Bits(_) => None,
        }
    }

    #[must_use]
    pub fn dtype(self) -> DType {
        match self {
            Self::I64(_) => DType::I64,
            Self::Bool(_) => DType::Bool,
            Self::F64Bits(_) => DType::F64,
        }
    }
}

/// A runtime value flowing through a graph.
///
/// Only `Tensor` values are materialized buffers; scalars and `Dims`
/// (shape values produced by `sym_size`) are metadata and are never worth
/// saving for the backward pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Scalar(Literal),
    Tensor(TensorValue),
    Dims(Shape),
}

impl Value {
    #[must_use]
    pub fn scalar_i64(value: i64) -> Self {
        Self::Scalar(Literal::I64(value))
    }

    #[must_use]
    pub fn scalar_f64(value: f64) -> Self {
        Self::Scalar(Literal::from_f64(value))
    }

    pub fn tensor_f64(dims: &[u32], data: Vec<f64>) -> Result<Self, ValueError> {
        Ok(Self::Tensor(TensorValue::new(
            DType::F64,
            Shape::new(dims),
            data,
        )?))
    }

    #[must_use]
    pub fn as_tensor(&self) -> Option<&TensorValue> {
        match self {
            Self::Tensor(tensor) => Some(tensor),
            Self::Scalar(_) | Self::Dims(_) => None,
        }
    }

    #[must_use]
    pub fn as_f64_scalar(&self) -> Option<f64> {
        match self {
            Self::Scalar(lit) => lit.as_f64(),
            Self::Tensor(tensor) if tensor.shape.rank() == 0 => tensor.data.first().copied(),
            Self::Tensor(_) | Self::Dims(_) => None,
        }
    }

    #[must_use]
    pub fn is_tensor(&self) -> bool {
        matches!(self, Self::Tensor(_))
    }

    /// Metadata record for this value as the size oracle reports it.
    #[must_use]
    pub fn meta(&self) -> ValueMeta {
        match self {
            Self::Tensor(tensor) => ValueMeta::tensor(tensor.abstract_value()),
            Self::Scalar(_) | Self::Dims(_) => ValueMeta::non_tensor(),
        }
    }

    /// Bytes held by the value; zero for non-tensors.
    #[must_use]
    pub fn nbytes(&self) -> u64 {
        self.meta().nbytes
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorValue {
    pub dtype: DType,
    pub shape: Shape,
    pub data: Vec<f64>,
}

impl TensorValue {
    pub fn new(dtype: DType, shape: Shape, data: Vec<f64>) -> Result<Self, ValueError> {
        let expected_count = shape.element_count().ok_or(ValueError::ShapeOverflow {
            shape: shape.clone(),
        })?;

        if expected_count != data.len() as u64 {
            return Err(ValueError::ElementCountMismatch {
                shape,
                expected_count,
                actual_count: data.len(),
            });
        }

        Ok(Self { dtype, shape, data })
    }

    pub fn full(aval: &AbstractValue, fill: f64) -> Result<Self, ValueError> {
        let count = aval.shape.element_count().ok_or(ValueError::ShapeOverflow {
            shape: aval.shape.clone(),
        })?;
        Self::new(aval.dtype, aval.shape.clone(), vec![fill; count as usize])
    }

    #[must_use]
    pub fn abstract_value(&self) -> AbstractValue {
        AbstractValue {
            dtype: self.dtype,
            shape: self.shape.clone(),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[must_use]
    pub fn rank(&self) -> usize {
        self.shape.rank()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValueError {
    #[error("shape element count overflowed: {shape}")]
    ShapeOverflow { shape: Shape },
    #[error("tensor element count mismatch for shape {shape}: expected {expected_count}, got {actual_count}")]
    ElementCountMismatch {
        shape: Shape,
        expected_count: u64,
        actual_count: usize,
    },
    #[error("malformed shape literal {text:?}")]
    MalformedShape { text: String },
}

/// Logical type of a node's value as reported by the size oracle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValueKind {
    Tensor(AbstractValue),
    NonTensor,
}

/// Per-node metadata: logical type and materialized byte size.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValueMeta {
    pub kind: ValueKind,
    pub nbytes: u64,
}

impl ValueMeta {
    #[must_use]
    pub fn tensor(aval: AbstractValue) -> Self {
        let nbytes = aval.nbytes().unwrap_or(u64::MAX);
        Self {
            kind: ValueKind::Tensor(aval),
            nbytes,
        }
    }

    #[must_use]
    pub fn non_tensor() -> Self {
        Self {
            kind: ValueKind::NonTensor,
            nbytes: 0,
        }
    }

    #[must_use]
    pub fn is_tensor(&self) -> bool {
        matches!(self.kind, ValueKind::Tensor(_))
    }

    #[must_use]
    pub fn abstract_value(&self) -> Option<&AbstractValue> {
        match &self.kind {
            ValueKind::Tensor(aval) => Some(aval),
            ValueKind::NonTensor => None,
        }
    }
}

/// How the min-cut partitioner treats an operator's output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecomputePolicy {
    Recomputable,
    /// Expensive to recompute (matmul and friends).
    ComputeIntensive,
    /// Pure view or layout change.
    View,
    /// Allocation/concatenation style ops that fuse badly when recomputed.
    Misc,
    /// Recomputing would draw different random numbers.
    Random,
    /// Known to misbehave under recomputation.
    Buggy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Op {
    // Elementwise
    Add,
    Sub,
    Mul,
    Div,
    Neg,
    Exp,
    Log,
    Sin,
    Cos,
    Tanh,
    Relu,
    ThresholdBackward,
    // Reduction
    Sum,
    SumToSize,
    // Shape and layout
    Expand,
    Reshape,
    Transpose,
    Clone,
    SymSize,
    // Compute intensive
    MatMul,
    // Misc
    Cat,
    OnesLike,
    ZerosLike,
    RandLike,
    LayerNorm,
}

impl Op {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Sub => "sub",
            Self::Mul => "mul",
            Self::Div => "div",
            Self::Neg => "neg",
            Self::Exp => "exp",
            Self::Log => "log",
            Self::Sin => "sin",
            Self::Cos => "cos",
            Self::Tanh => "tanh",
            Self::Relu => "relu",
            Self::ThresholdBackward => "threshold_backward",
            Self::Sum => "sum",
            Self::SumToSize => "sum_to_size",
            Self::Expand => "expand",
            Self::Reshape => "reshape",
            Self::Transpose => "transpose",
            Self::Clone => "clone",
            Self::SymSize => "sym_size",
            Self::MatMul => "matmul",
            Self::Cat => "cat",
            Self::OnesLike => "ones_like",
            Self::ZerosLike => "zeros_like",
            Self::RandLike => "rand_like",
            Self::LayerNorm => "layer_norm",
        }
    }

    #[must_use]
    pub fn policy(self) -> RecomputePolicy {
        match self {
            Self::MatMul => RecomputePolicy::ComputeIntensive,
            Self::Expand | Self::Reshape | Self::Transpose | Self::Clone => RecomputePolicy::View,
            Self::Cat | Self::ZerosLike => RecomputePolicy::Misc,
            Self::RandLike => RecomputePolicy::Random,
            Self::LayerNorm => RecomputePolicy::Buggy,
            _ => RecomputePolicy::Recomputable,
        }
    }

    #[must_use]
    pub fn is_recomputable(self) -> bool {
        self.policy() == RecomputePolicy::Recomputable
    }

    /// Whether `count` arguments (literals included) are valid for this op.
    #[must_use]
    pub fn accepts_arity(self, count: usize) -> bool {
        match self {
            Self::Add
            | Self::Sub
            | Self::Mul
            | Self::Div
            | Self::ThresholdBackward
            | Self::MatMul => count == 2,
            // Target shape comes either from a `shape` param or a Dims argument.
            Self::Expand | Self::Reshape | Self::SumToSize => count == 1 || count == 2,
            Self::Cat => count >= 1,
            _ => count == 1,
        }
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
