#![forbid(unsafe_code)]

//! Reference kernels for every [`Op`]. Values are dense row-major `f64`
//! buffers; nothing here aims for speed, only for a deterministic ground
//! truth that partitioned graphs can be compared against.

mod elementwise;
mod layout;
mod linalg;
pub mod random;
mod reduction;

use ag_core::{Op, Shape, TensorValue, Value, ValueError};
use std::borrow::Cow;
use std::collections::BTreeMap;

pub use elementwise::broadcast_shapes;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EvalError {
    #[error("{op} does not accept {actual} inputs")]
    ArityMismatch { op: Op, actual: usize },
    #[error("type mismatch for {op}: {detail}")]
    TypeMismatch { op: Op, detail: &'static str },
    #[error("shape mismatch for {op}: left={left} right={right}")]
    ShapeMismatch { op: Op, left: Shape, right: Shape },
    #[error("{op}: missing or malformed param {param:?}")]
    BadParam { op: Op, param: &'static str },
    #[error("invalid tensor: {0}")]
    InvalidTensor(#[from] ValueError),
}

/// Evaluates one operator application.
#[inline]
pub fn eval_op(
    op: Op,
    inputs: &[Value],
    params: &BTreeMap<String, String>,
) -> Result<Value, EvalError> {
    if !op.accepts_arity(inputs.len()) {
        return Err(EvalError::ArityMismatch {
            op,
            actual: inputs.len(),
        });
    }

    match op {
        Op::Add => elementwise::binary(op, inputs, |a, b| a + b),
        Op::Sub => elementwise::binary(op, inputs, |a, b| a - b),
        Op::Mul => elementwise::binary(op, inputs, |a, b| a * b),
        Op::Div => elementwise::binary(op, inputs, |a, b| a / b),
        Op::ThresholdBackward => {
            let threshold = float_param(op, params, "threshold", 0.0)?;
            elementwise::binary(op, inputs, move |grad, x| {
                if x > threshold { grad } else { 0.0 }
            })
        }
        Op::Neg => elementwise::unary(op, inputs, |x| -x),
        Op::Exp => elementwise::unary(op, inputs, f64::exp),
        Op::Log => elementwise::unary(op, inputs, f64::ln),
        Op::Sin => elementwise::unary(op, inputs, f64::sin),
        Op::Cos => elementwise::unary(op, inputs, f64::cos),
        Op::Tanh => elementwise::unary(op, inputs, f64::tanh),
        Op::Relu => elementwise::unary(op, inputs, |x| x.max(0.0)),
        Op::Clone => Ok(inputs[0].clone()),
        Op::Sum => reduction::sum(op, inputs),
        Op::SumToSize => {
            let target = target_shape(op, inputs, params)?;
            reduction::sum_to_size(op, &inputs[0], &target)
        }
        Op::Expand => {
            let target = target_shape(op, inputs, params)?;
            layout::expand(op, &inputs[0], &target)
        }
        Op::Reshape => {
            let target = target_shape(op, inputs, params)?;
            layout::reshape(op, &inputs[0], target)
        }
        Op::Transpose => layout::transpose(op, &inputs[0], params),
        Op::SymSize => layout::sym_size(op, &inputs[0]),
        Op::Cat => {
            let dim = usize_param(op, params, "dim", 0)?;
            layout::cat(op, inputs, dim)
        }
        Op::MatMul => linalg::matmul(op, &inputs[0], &inputs[1]),
        Op::LayerNorm => {
            let eps = float_param(op, params, "eps", 1e-5)?;
            linalg::layer_norm(op, &inputs[0], eps)
        }
        Op::OnesLike => filled_like(op, &inputs[0], 1.0),
        Op::ZerosLike => filled_like(op, &inputs[0], 0.0),
        Op::RandLike => {
            let seed = usize_param(op, params, "seed", 0)? as u64;
            let tensor = tensor_operand(op, &inputs[0])?;
            Ok(Value::Tensor(random::uniform_like(&tensor, seed)?))
        }
    }
}

/// Views a value as a tensor. Numeric scalars are promoted to rank-0
/// tensors; shape values are rejected.
pub(crate) fn tensor_operand(op: Op, value: &Value) -> Result<Cow<'_, TensorValue>, EvalError> {
    match value {
        Value::Tensor(tensor) => Ok(Cow::Borrowed(tensor)),
        Value::Scalar(lit) => {
            let x = lit.as_f64().ok_or(EvalError::TypeMismatch {
                op,
                detail: "expected numeric scalar",
            })?;
            Ok(Cow::Owned(TensorValue::new(
                lit.dtype(),
                Shape::scalar(),
                vec![x],
            )?))
        }
        Value::Dims(_) => Err(EvalError::TypeMismatch {
            op,
            detail: "shape value used as tensor operand",
        }),
    }
}

/// Target shape of expand/reshape/sum_to_size: the second input when it is
/// a shape value, otherwise the `shape` param.
fn target_shape(
    op: Op,
    inputs: &[Value],
    params: &BTreeMap<String, String>,
) -> Result<Shape, EvalError> {
    if let Some(second) = inputs.get(1) {
        return match second {
            Value::Dims(shape) => Ok(shape.clone()),
            Value::Scalar(_) | Value::Tensor(_) => Err(EvalError::TypeMismatch {
                op,
                detail: "target shape argument must be a shape value",
            }),
        };
    }
    let text = params
        .get("shape")
        .ok_or(EvalError::BadParam { op, param: "shape" })?;
    Shape::parse(text).map_err(|_| EvalError::BadParam { op, param: "shape" })
}

fn float_param(
    op: Op,
    params: &BTreeMap<String, String>,
    param: &'static str,
    default: f64,
) -> Result<f64, EvalError> {
    params.get(param).map_or(Ok(default), |text| {
        text.trim()
            .parse::<f64>()
            .map_err(|_| EvalError::BadParam { op, param })
    })
}

fn usize_param(
    op: Op,
    params: &BTreeMap<String, String>,
    param: &'static str,
    default: usize,
) -> Result<usize, EvalError> {
    params.get(param).map_or(Ok(default), |text| {
        text.trim()
            .parse::<usize>()
            .map_err(|_| EvalError::BadParam { op, param })
    })
}

fn filled_like(op: Op, value: &Value, fill: f64) -> Result<Value, EvalError> {
    let tensor = tensor_operand(op, value)?;
    Ok(Value::Tensor(TensorValue::full(
        &tensor.abstract_value(),
        fill,
    )?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ag_core::DType;

    fn t(dims: &[u32], data: &[f64]) -> Value {
        Value::tensor_f64(dims, data.to_vec()).expect("tensor")
    }

    fn data(value: &Value) -> &[f64] {
        &value.as_tensor().expect("tensor result").data
    }

    fn shape_params(dims: &str) -> BTreeMap<String, String> {
        BTreeMap::from([("shape".to_owned(), dims.to_owned())])
    }

    #[test]
    fn binary_ops_broadcast_numpy_style() {
        let a = t(&[2, 1], &[1.0, 2.0]);
        let b = t(&[3], &[10.0, 20.0, 30.0]);
        let out = eval_op(Op::Add, &[a, b], &BTreeMap::new()).expect("add");
        assert_eq!(out.as_tensor().expect("tensor").shape, Shape::new(&[2, 3]));
        assert_eq!(data(&out), &[11.0, 21.0, 31.0, 12.0, 22.0, 32.0]);
    }

    #[test]
    fn incompatible_broadcast_is_rejected() {
        let a = t(&[2], &[1.0, 2.0]);
        let b = t(&[3], &[1.0, 2.0, 3.0]);
        let err = eval_op(Op::Mul, &[a, b], &BTreeMap::new()).expect_err("2 vs 3");
        assert!(matches!(err, EvalError::ShapeMismatch { op: Op::Mul, .. }));
    }

    #[test]
    fn scalar_operands_promote() {
        let out = eval_op(
            Op::Mul,
            &[Value::scalar_f64(2.0), t(&[2], &[1.5, -1.0])],
            &BTreeMap::new(),
        )
        .expect("mul");
        assert_eq!(data(&out), &[3.0, -2.0]);
    }

    #[test]
    fn sum_reduces_to_rank_zero() {
        let out = eval_op(Op::Sum, &[t(&[2, 2], &[1.0, 2.0, 3.0, 4.0])], &BTreeMap::new())
            .expect("sum");
        let tensor = out.as_tensor().expect("tensor");
        assert_eq!(tensor.rank(), 0);
        assert_eq!(tensor.data, vec![10.0]);
    }

    #[test]
    fn expand_then_sum_to_size_round_trips_shape() {
        let x = t(&[2, 1], &[1.0, 2.0]);
        let expanded = eval_op(Op::Expand, &[x], &shape_params("2,3")).expect("expand");
        assert_eq!(data(&expanded), &[1.0, 1.0, 1.0, 2.0, 2.0, 2.0]);
        let reduced =
            eval_op(Op::SumToSize, &[expanded], &shape_params("2,1")).expect("sum_to_size");
        assert_eq!(reduced.as_tensor().expect("tensor").shape, Shape::new(&[2, 1]));
        assert_eq!(data(&reduced), &[3.0, 6.0]);
    }

    #[test]
    fn expand_accepts_shape_value_argument() {
        let target = eval_op(Op::SymSize, &[t(&[3], &[0.0; 3])], &BTreeMap::new())
            .expect("sym_size");
        assert_eq!(target, Value::Dims(Shape::vector(3)));
        let out = eval_op(Op::Expand, &[t(&[], &[4.0]), target], &BTreeMap::new())
            .expect("expand");
        assert_eq!(data(&out), &[4.0, 4.0, 4.0]);
    }

    #[test]
    fn shape_values_are_not_tensors() {
        let err = eval_op(Op::Exp, &[Value::Dims(Shape::vector(2))], &BTreeMap::new())
            .expect_err("exp of a shape");
        assert!(matches!(err, EvalError::TypeMismatch { .. }));
    }

    #[test]
    fn missing_shape_param_is_reported() {
        let err = eval_op(Op::Reshape, &[t(&[2], &[1.0, 2.0])], &BTreeMap::new())
            .expect_err("no shape");
        assert_eq!(
            err,
            EvalError::BadParam {
                op: Op::Reshape,
                param: "shape"
            }
        );
    }

    #[test]
    fn transpose_and_matmul_agree() {
        let x = t(&[2, 3], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let xt = eval_op(Op::Transpose, &[x.clone()], &BTreeMap::new()).expect("transpose");
        assert_eq!(xt.as_tensor().expect("tensor").shape, Shape::new(&[3, 2]));
        assert_eq!(data(&xt), &[1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
        let gram = eval_op(Op::MatMul, &[x, xt], &BTreeMap::new()).expect("matmul");
        assert_eq!(data(&gram), &[14.0, 32.0, 32.0, 77.0]);
    }

    #[test]
    fn matmul_checks_inner_dimension() {
        let a = t(&[2, 3], &[0.0; 6]);
        let b = t(&[2, 3], &[0.0; 6]);
        assert!(matches!(
            eval_op(Op::MatMul, &[a, b], &BTreeMap::new()),
            Err(EvalError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn threshold_backward_masks_gradient() {
        let grad = t(&[3], &[1.0, 1.0, 1.0]);
        let x = t(&[3], &[-1.0, 0.0, 2.0]);
        let out = eval_op(Op::ThresholdBackward, &[grad, x], &BTreeMap::new()).expect("tb");
        assert_eq!(data(&out), &[0.0, 0.0, 1.0]);
    }

    #[test]
    fn cat_joins_along_dim() {
        let a = t(&[2, 1], &[1.0, 2.0]);
        let b = t(&[2, 2], &[3.0, 4.0, 5.0, 6.0]);
        let params = BTreeMap::from([("dim".to_owned(), "1".to_owned())]);
        let out = eval_op(Op::Cat, &[a, b], &params).expect("cat");
        assert_eq!(out.as_tensor().expect("tensor").shape, Shape::new(&[2, 3]));
        assert_eq!(data(&out), &[1.0, 3.0, 4.0, 2.0, 5.0, 6.0]);
    }

    #[test]
    fn layer_norm_centers_rows() {
        let x = t(&[2, 2], &[1.0, 3.0, -2.0, 2.0]);
        let out = eval_op(Op::LayerNorm, &[x], &BTreeMap::new()).expect("layer_norm");
        for row in data(&out).chunks(2) {
            assert!((row[0] + row[1]).abs() < 1e-9);
            assert!((row[0] + 1.0).abs() < 1e-4);
        }
    }

    #[test]
    fn rand_like_is_deterministic_per_seed() {
        let x = t(&[4], &[0.0; 4]);
        let a = eval_op(Op::RandLike, &[x.clone()], &BTreeMap::new()).expect("rand");
        let b = eval_op(Op::RandLike, &[x.clone()], &BTreeMap::new()).expect("rand");
        assert_eq!(a, b);
        assert!(data(&a).iter().all(|v| (0.0..1.0).contains(v)));
        let seeded = BTreeMap::from([("seed".to_owned(), "7".to_owned())]);
        let c = eval_op(Op::RandLike, &[x], &seeded).expect("rand");
        assert_ne!(a, c);
    }

    #[test]
    fn ones_like_keeps_dtype() {
        let x = Value::Tensor(
            TensorValue::new(DType::F32, Shape::vector(2), vec![5.0, 6.0]).expect("tensor"),
        );
        let out = eval_op(Op::OnesLike, &[x], &BTreeMap::new()).expect("ones_like");
        let tensor = out.as_tensor().expect("tensor");
        assert_eq!(tensor.dtype, DType::F32);
        assert_eq!(tensor.data, vec![1.0, 1.0]);
    }

    #[test]
    fn arity_is_checked_before_dispatch() {
        assert_eq!(
            eval_op(Op::Neg, &[], &BTreeMap::new()),
            Err(EvalError::ArityMismatch {
                op: Op::Neg,
                actual: 0
            })
        );
    }
}
