//! Canonical joint graphs shared by tests, benches and conformance suites.
//!
//! Each fixture is a hand-traced forward+backward graph as a joint tracer
//! would emit it: primal placeholders first, then `tangents_*`, then the
//! forward computation interleaved with its gradient.

use crate::{
    AbstractValue, Arg, DType, Graph, GraphError, InputRole, JointGraph, Op, Shape, TensorValue,
    Value,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JointSpec {
    /// `y = (a * b).sum()` with gradient w.r.t. `a` only.
    MulSum,
    /// `y = cos(sin(x)).sum()`; recomputing from `x` is cheaper than saving.
    Chain,
    /// `y = relu(x @ w).sum()` with gradients for both operands.
    MatMulRelu,
    /// The backward expand takes its target shape from a `sym_size` value.
    ShapeDriven,
    /// `y = (x * c).sum()` where `c` is a baked-in constant.
    ConstantScale,
    /// `y = (x * rand_like(x)).sum()`; the mask must not be redrawn.
    RandomMask,
}

impl JointSpec {
    pub const ALL: [Self; 6] = [
        Self::MulSum,
        Self::Chain,
        Self::MatMulRelu,
        Self::ShapeDriven,
        Self::ConstantScale,
        Self::RandomMask,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MulSum => "mul_sum",
            Self::Chain => "chain",
            Self::MatMulRelu => "matmul_relu",
            Self::ShapeDriven => "shape_driven",
            Self::ConstantScale => "constant_scale",
            Self::RandomMask => "random_mask",
        }
    }

    /// Declared shapes of the primal inputs, in placeholder order.
    #[must_use]
    pub fn primal_avals(self) -> Vec<AbstractValue> {
        match self {
            Self::MulSum => vec![f64_aval(&[4, 1, 3]), f64_aval(&[1, 4, 3])],
            Self::Chain | Self::ShapeDriven | Self::ConstantScale => vec![f64_aval(&[3])],
            Self::MatMulRelu => vec![f64_aval(&[2, 3]), f64_aval(&[3, 4])],
            Self::RandomMask => vec![f64_aval(&[2, 3])],
        }
    }

    /// Every fixture has one scalar forward output and therefore one scalar
    /// tangent.
    #[must_use]
    pub fn tangent_avals(self) -> Vec<AbstractValue> {
        vec![f64_aval(&[])]
    }

    /// Deterministic example primals matching `primal_avals`.
    pub fn example_primals(self) -> Result<Vec<Value>, crate::ValueError> {
        self.primal_avals()
            .iter()
            .enumerate()
            .map(|(position, aval)| ramp(aval, 0.25 + position as f64 * 0.5))
            .collect()
    }

    pub fn example_tangents(self) -> Result<Vec<Value>, crate::ValueError> {
        self.tangent_avals()
            .iter()
            .map(|aval| Value::tensor_f64(&aval.shape.dims, vec![1.0]))
            .collect()
    }

    /// Primals followed by tangents, the calling convention of a joint graph.
    pub fn example_joint_args(self) -> Result<Vec<Value>, crate::ValueError> {
        let mut args = self.example_primals()?;
        args.extend(self.example_tangents()?);
        Ok(args)
    }
}

pub fn build_joint(spec: JointSpec) -> Result<JointGraph, GraphError> {
    let mut g = Graph::new();
    let mut primals = Vec::new();
    for (position, aval) in spec.primal_avals().into_iter().enumerate() {
        primals.push(g.add_placeholder(
            &format!("primals_{}", position + 1),
            InputRole::Primal,
            Some(aval),
        )?);
    }
    let t = g.add_placeholder(
        "tangents_1",
        InputRole::Tangent,
        Some(f64_aval(&[])),
    )?;
    let n = Arg::Node;

    let outputs = match spec {
        JointSpec::MulSum => {
            let (a, b) = (primals[0], primals[1]);
            let mul = g.add_operation(Op::Mul, [n(a), n(b)])?;
            let sum = g.add_operation(Op::Sum, [n(mul)])?;
            let expand = g.add_operation_with_params(Op::Expand, [n(t)], shape_param(&[4, 4, 3]))?;
            let mul_1 = g.add_operation(Op::Mul, [n(expand), n(b)])?;
            let grad_a =
                g.add_operation_with_params(Op::SumToSize, [n(mul_1)], shape_param(&[4, 1, 3]))?;
            vec![sum, grad_a]
        }
        JointSpec::Chain => {
            let x = primals[0];
            let sin = g.add_operation(Op::Sin, [n(x)])?;
            let cos = g.add_operation(Op::Cos, [n(sin)])?;
            let sum = g.add_operation(Op::Sum, [n(cos)])?;
            let expand = g.add_operation_with_params(Op::Expand, [n(t)], shape_param(&[3]))?;
            let sin_1 = g.add_operation(Op::Sin, [n(sin)])?;
            let neg = g.add_operation(Op::Neg, [n(sin_1)])?;
            let mul = g.add_operation(Op::Mul, [n(expand), n(neg)])?;
            let cos_1 = g.add_operation(Op::Cos, [n(x)])?;
            let grad_x = g.add_operation(Op::Mul, [n(mul), n(cos_1)])?;
            vec![sum, grad_x]
        }
        JointSpec::MatMulRelu => {
            let (x, w) = (primals[0], primals[1]);
            let mm = g.add_operation(Op::MatMul, [n(x), n(w)])?;
            let relu = g.add_operation(Op::Relu, [n(mm)])?;
            let sum = g.add_operation(Op::Sum, [n(relu)])?;
            let expand = g.add_operation_with_params(Op::Expand, [n(t)], shape_param(&[2, 4]))?;
            let grad_mm = g.add_operation(Op::ThresholdBackward, [n(expand), n(relu)])?;
            let x_t = g.add_operation(Op::Transpose, [n(x)])?;
            let grad_w = g.add_operation(Op::MatMul, [n(x_t), n(grad_mm)])?;
            let w_t = g.add_operation(Op::Transpose, [n(w)])?;
            let grad_x = g.add_operation(Op::MatMul, [n(grad_mm), n(w_t)])?;
            vec![sum, grad_x, grad_w]
        }
        JointSpec::ShapeDriven => {
            let x = primals[0];
            let exp = g.add_operation(Op::Exp, [n(x)])?;
            let sum = g.add_operation(Op::Sum, [n(exp)])?;
            let size = g.add_operation(Op::SymSize, [n(exp)])?;
            let expand = g.add_operation(Op::Expand, [n(t), n(size)])?;
            let grad_x = g.add_operation(Op::Mul, [n(expand), n(exp)])?;
            vec![sum, grad_x]
        }
        JointSpec::ConstantScale => {
            let x = primals[0];
            let scale = g.add_constant(
                "_tensor_constant0",
                Value::Tensor(TensorValue {
                    dtype: DType::F64,
                    shape: Shape::vector(3),
                    data: vec![0.5, -1.0, 2.0],
                }),
            )?;
            let mul = g.add_operation(Op::Mul, [n(x), n(scale)])?;
            let sum = g.add_operation(Op::Sum, [n(mul)])?;
            let expand = g.add_operation_with_params(Op::Expand, [n(t)], shape_param(&[3]))?;
            let grad_x = g.add_operation(Op::Mul, [n(expand), n(scale)])?;
            vec![sum, grad_x]
        }
        JointSpec::RandomMask => {
            let x = primals[0];
            let mask = g.add_operation(Op::RandLike, [n(x)])?;
            let mul = g.add_operation(Op::Mul, [n(x), n(mask)])?;
            let sum = g.add_operation(Op::Sum, [n(mul)])?;
            let expand = g.add_operation_with_params(Op::Expand, [n(t)], shape_param(&[2, 3]))?;
            let grad_x = g.add_operation(Op::Mul, [n(expand), n(mask)])?;
            vec![sum, grad_x]
        }
    };

    g.set_output(outputs)?;
    JointGraph::new(g, 1)
}

/// `{"shape": "d0,d1,..."}`, the param form of a static target shape.
#[must_use]
pub fn shape_param(dims: &[u32]) -> BTreeMap<String, String> {
    BTreeMap::from([(
        "shape".to_owned(),
        Shape::new(dims).to_param(),
    )])
}

fn f64_aval(dims: &[u32]) -> AbstractValue {
    AbstractValue::new(DType::F64, dims)
}

fn ramp(aval: &AbstractValue, offset: f64) -> Result<Value, crate::ValueError> {
    let count = aval.shape.element_count().unwrap_or(0) as usize;
    let data = (0..count)
        .map(|i| offset + ((i % 7) as f64 - 3.0) * 0.3)
        .collect();
    Value::tensor_f64(&aval.shape.dims, data)
}
