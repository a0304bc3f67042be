#![forbid(unsafe_code)]

use ag_core::{Op, Shape, TensorValue, Value};

use crate::{EvalError, tensor_operand};

/// Rank-2 matrix product `[m, k] @ [k, n] -> [m, n]`.
pub(crate) fn matmul(op: Op, lhs: &Value, rhs: &Value) -> Result<Value, EvalError> {
    let a = tensor_operand(op, lhs)?;
    let b = tensor_operand(op, rhs)?;
    if a.rank() != 2 || b.rank() != 2 {
        return Err(EvalError::TypeMismatch {
            op,
            detail: "matmul expects rank-2 operands",
        });
    }
    let (m, k) = (a.shape.dims[0] as usize, a.shape.dims[1] as usize);
    let (k2, n) = (b.shape.dims[0] as usize, b.shape.dims[1] as usize);
    if k != k2 {
        return Err(EvalError::ShapeMismatch {
            op,
            left: a.shape.clone(),
            right: b.shape.clone(),
        });
    }

    let mut out = vec![0.0; m * n];
    for i in 0..m {
        for p in 0..k {
            let a_ip = a.data[i * k + p];
            for j in 0..n {
                out[i * n + j] += a_ip * b.data[p * n + j];
            }
        }
    }

    Ok(Value::Tensor(TensorValue::new(
        a.dtype,
        Shape::new(&[m as u32, n as u32]),
        out,
    )?))
}

/// Normalizes over the last axis with biased variance; no affine terms.
pub(crate) fn layer_norm(op: Op, value: &Value, eps: f64) -> Result<Value, EvalError> {
    let tensor = tensor_operand(op, value)?;
    let Some(&width) = tensor.shape.dims.last() else {
        return Err(EvalError::TypeMismatch {
            op,
            detail: "layer_norm expects rank >= 1",
        });
    };
    let width = width as usize;
    if width == 0 {
        return Ok(Value::Tensor(tensor.into_owned()));
    }

    let mut data = Vec::with_capacity(tensor.len());
    for row in tensor.data.chunks(width) {
        let mean = row.iter().sum::<f64>() / width as f64;
        let var = row.iter().map(|x| (x - mean) * (x - mean)).sum::<f64>() / width as f64;
        let inv_std = 1.0 / (var + eps).sqrt();
        data.extend(row.iter().map(|x| (x - mean) * inv_std));
    }

    Ok(Value::Tensor(TensorValue::new(
        tensor.dtype,
        tensor.shape.clone(),
        data,
    )?))
}
