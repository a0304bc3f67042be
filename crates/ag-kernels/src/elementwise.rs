#![forbid(unsafe_code)]

use ag_core::{DType, Op, Shape, TensorValue, Value};

use crate::{EvalError, tensor_operand};

/// Numpy broadcasting: align trailing axes, each pair must match or one
/// side must be 1.
pub fn broadcast_shapes(op: Op, left: &Shape, right: &Shape) -> Result<Shape, EvalError> {
    let rank = left.rank().max(right.rank());
    let mut dims = vec![0_u32; rank];
    for axis in 0..rank {
        let l = dim_from_right(left, rank - 1 - axis);
        let r = dim_from_right(right, rank - 1 - axis);
        dims[axis] = match (l, r) {
            (a, b) if a == b => a,
            (1, b) => b,
            (a, 1) => a,
            _ => {
                return Err(EvalError::ShapeMismatch {
                    op,
                    left: left.clone(),
                    right: right.clone(),
                });
            }
        };
    }
    Ok(Shape { dims })
}

fn dim_from_right(shape: &Shape, offset: usize) -> u32 {
    if offset < shape.rank() {
        shape.dims[shape.rank() - 1 - offset]
    } else {
        1
    }
}

/// Strides of `input` laid over an `out_rank` index space, zero on
/// broadcast axes.
pub(crate) fn aligned_strides(input: &Shape, out_rank: usize) -> Vec<u64> {
    let strides = input.contiguous_strides();
    let pad = out_rank - input.rank();
    (0..out_rank)
        .map(|axis| {
            if axis < pad || input.dims[axis - pad] == 1 {
                0
            } else {
                strides[axis - pad]
            }
        })
        .collect()
}

/// Maps a linear index of the output space to a linear index of an input
/// described by `in_strides`.
pub(crate) fn source_index(linear: u64, out_strides: &[u64], in_strides: &[u64]) -> usize {
    let mut rem = linear;
    let mut idx = 0_u64;
    for (out_stride, in_stride) in out_strides.iter().zip(in_strides) {
        let coord = rem / out_stride;
        rem %= out_stride;
        idx += coord * in_stride;
    }
    idx as usize
}

#[inline]
pub(crate) fn unary(
    op: Op,
    inputs: &[Value],
    f: impl Fn(f64) -> f64,
) -> Result<Value, EvalError> {
    match &inputs[0] {
        Value::Scalar(lit) => {
            let x = lit.as_f64().ok_or(EvalError::TypeMismatch {
                op,
                detail: "expected numeric scalar",
            })?;
            Ok(Value::scalar_f64(f(x)))
        }
        other => {
            let tensor = tensor_operand(op, other)?;
            let data = tensor.data.iter().copied().map(&f).collect();
            Ok(Value::Tensor(TensorValue::new(
                float_dtype(tensor.dtype),
                tensor.shape.clone(),
                data,
            )?))
        }
    }
}

#[inline]
pub(crate) fn binary(
    op: Op,
    inputs: &[Value],
    f: impl Fn(f64, f64) -> f64,
) -> Result<Value, EvalError> {
    if let (Value::Scalar(lhs), Value::Scalar(rhs)) = (&inputs[0], &inputs[1]) {
        let (Some(a), Some(b)) = (lhs.as_f64(), rhs.as_f64()) else {
            return Err(EvalError::TypeMismatch {
                op,
                detail: "expected numeric scalars",
            });
        };
        return Ok(Value::scalar_f64(f(a, b)));
    }

    let lhs = tensor_operand(op, &inputs[0])?;
    let rhs = tensor_operand(op, &inputs[1])?;

    if lhs.shape == rhs.shape {
        let data = lhs
            .data
            .iter()
            .zip(&rhs.data)
            .map(|(a, b)| f(*a, *b))
            .collect();
        return Ok(Value::Tensor(TensorValue::new(
            promote(lhs.dtype, rhs.dtype),
            lhs.shape.clone(),
            data,
        )?));
    }

    let shape = broadcast_shapes(op, &lhs.shape, &rhs.shape)?;
    let out_strides = shape.contiguous_strides();
    let lhs_strides = aligned_strides(&lhs.shape, shape.rank());
    let rhs_strides = aligned_strides(&rhs.shape, shape.rank());
    let count = shape.element_count().ok_or(EvalError::ShapeMismatch {
        op,
        left: lhs.shape.clone(),
        right: rhs.shape.clone(),
    })?;

    let data = (0..count)
        .map(|linear| {
            let a = lhs.data[source_index(linear, &out_strides, &lhs_strides)];
            let b = rhs.data[source_index(linear, &out_strides, &rhs_strides)];
            f(a, b)
        })
        .collect();

    Ok(Value::Tensor(TensorValue::new(
        promote(lhs.dtype, rhs.dtype),
        shape,
        data,
    )?))
}

fn promote(left: DType, right: DType) -> DType {
    if left == right { left } else { DType::F64 }
}

fn float_dtype(dtype: DType) -> DType {
    match dtype {
        DType::F32 => DType::F32,
        DType::F64 | DType::I64 | DType::Bool => DType::F64,
    }
}
