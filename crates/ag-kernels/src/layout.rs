#![forbid(unsafe_code)]

use ag_core::{Op, Shape, TensorValue, Value};
use std::collections::BTreeMap;

use crate::elementwise::{aligned_strides, broadcast_shapes, source_index};
use crate::{EvalError, tensor_operand};

pub(crate) fn expand(op: Op, value: &Value, target: &Shape) -> Result<Value, EvalError> {
    let tensor = tensor_operand(op, value)?;
    let widened = broadcast_shapes(op, &tensor.shape, target)?;
    if &widened != target {
        return Err(EvalError::ShapeMismatch {
            op,
            left: tensor.shape.clone(),
            right: target.clone(),
        });
    }

    let count = target.element_count().ok_or(EvalError::ShapeMismatch {
        op,
        left: tensor.shape.clone(),
        right: target.clone(),
    })?;
    let out_strides = target.contiguous_strides();
    let in_strides = aligned_strides(&tensor.shape, target.rank());
    let data = (0..count)
        .map(|linear| tensor.data[source_index(linear, &out_strides, &in_strides)])
        .collect();

    Ok(Value::Tensor(TensorValue::new(
        tensor.dtype,
        target.clone(),
        data,
    )?))
}

pub(crate) fn reshape(op: Op, value: &Value, target: Shape) -> Result<Value, EvalError> {
    let tensor = tensor_operand(op, value)?;
    if target.element_count() != Some(tensor.len() as u64) {
        return Err(EvalError::ShapeMismatch {
            op,
            left: tensor.shape.clone(),
            right: target,
        });
    }
    Ok(Value::Tensor(TensorValue::new(
        tensor.dtype,
        target,
        tensor.data.clone(),
    )?))
}

/// Swaps two axes, the last two by default (`dim0`/`dim1` params override).
/// Rank 0 and 1 values pass through unchanged.
pub(crate) fn transpose(
    op: Op,
    value: &Value,
    params: &BTreeMap<String, String>,
) -> Result<Value, EvalError> {
    let tensor = tensor_operand(op, value)?;
    let rank = tensor.rank();
    if rank < 2 {
        return Ok(Value::Tensor(tensor.into_owned()));
    }

    let axis = |name: &'static str, default: usize| -> Result<usize, EvalError> {
        match params.get(name) {
            None => Ok(default),
            Some(text) => text
                .trim()
                .parse::<usize>()
                .ok()
                .filter(|axis| *axis < rank)
                .ok_or(EvalError::BadParam { op, param: name }),
        }
    };
    let dim0 = axis("dim0", rank - 2)?;
    let dim1 = axis("dim1", rank - 1)?;

    let mut out_dims = tensor.shape.dims.clone();
    out_dims.swap(dim0, dim1);
    let out_shape = Shape { dims: out_dims };

    // Reading the input through swapped strides yields the transposed layout.
    let mut in_strides = tensor.shape.contiguous_strides();
    in_strides.swap(dim0, dim1);
    let out_strides = out_shape.contiguous_strides();
    let data = (0..tensor.len() as u64)
        .map(|linear| tensor.data[source_index(linear, &out_strides, &in_strides)])
        .collect();

    Ok(Value::Tensor(TensorValue::new(
        tensor.dtype,
        out_shape,
        data,
    )?))
}

pub(crate) fn sym_size(op: Op, value: &Value) -> Result<Value, EvalError> {
    let tensor = tensor_operand(op, value)?;
    Ok(Value::Dims(tensor.shape.clone()))
}

pub(crate) fn cat(op: Op, inputs: &[Value], dim: usize) -> Result<Value, EvalError> {
    let tensors = inputs
        .iter()
        .map(|value| tensor_operand(op, value))
        .collect::<Result<Vec<_>, _>>()?;
    let first = &tensors[0];
    if dim >= first.rank() {
        return Err(EvalError::BadParam { op, param: "dim" });
    }

    let mut out_dims = first.shape.dims.clone();
    out_dims[dim] = 0;
    for tensor in &tensors {
        let compatible = tensor.rank() == first.rank()
            && tensor
                .shape
                .dims
                .iter()
                .zip(&first.shape.dims)
                .enumerate()
                .all(|(axis, (a, b))| axis == dim || a == b);
        if !compatible {
            return Err(EvalError::ShapeMismatch {
                op,
                left: first.shape.clone(),
                right: tensor.shape.clone(),
            });
        }
        out_dims[dim] += tensor.shape.dims[dim];
    }

    let outer: usize = first.shape.dims[..dim].iter().map(|d| *d as usize).product();
    let inner: usize = first.shape.dims[dim + 1..]
        .iter()
        .map(|d| *d as usize)
        .product();
    let mut data = Vec::with_capacity(tensors.iter().map(|t| t.len()).sum());
    for block in 0..outer {
        for tensor in &tensors {
            let chunk = tensor.shape.dims[dim] as usize * inner;
            data.extend_from_slice(&tensor.data[block * chunk..(block + 1) * chunk]);
        }
    }

    Ok(Value::Tensor(TensorValue::new(
        first.dtype,
        Shape { dims: out_dims },
        data,
    )?))
}
