#![forbid(unsafe_code)]

use ag_core::{Op, Shape, TensorValue, Value};

use crate::elementwise::{aligned_strides, broadcast_shapes, source_index};
use crate::{EvalError, tensor_operand};

/// Full reduction to a rank-0 tensor.
pub(crate) fn sum(op: Op, inputs: &[Value]) -> Result<Value, EvalError> {
    let tensor = tensor_operand(op, &inputs[0])?;
    let total = tensor.data.iter().sum::<f64>();
    Ok(Value::Tensor(TensorValue::new(
        tensor.dtype,
        Shape::scalar(),
        vec![total],
    )?))
}

/// Reduces `value` to `target`, the inverse of broadcasting `target` up to
/// the value's shape. Broadcast axes are summed.
pub(crate) fn sum_to_size(op: Op, value: &Value, target: &Shape) -> Result<Value, EvalError> {
    let tensor = tensor_operand(op, value)?;
    let widened = broadcast_shapes(op, target, &tensor.shape)?;
    if widened != tensor.shape {
        return Err(EvalError::ShapeMismatch {
            op,
            left: tensor.shape.clone(),
            right: target.clone(),
        });
    }

    let out_count = target.element_count().ok_or(EvalError::ShapeMismatch {
        op,
        left: tensor.shape.clone(),
        right: target.clone(),
    })?;
    let mut out = vec![0.0; out_count as usize];
    let in_strides = tensor.shape.contiguous_strides();
    let target_strides = aligned_strides(target, tensor.shape.rank());
    for (linear, x) in tensor.data.iter().enumerate() {
        out[source_index(linear as u64, &in_strides, &target_strides)] += x;
    }

    Ok(Value::Tensor(TensorValue::new(
        tensor.dtype,
        target.clone(),
        out,
    )?))
}
