//! Explicit symmetric per-tensor INT quantization.
//!
//! Unlike the fake kernels this keeps the integer codes around, which is what a
//! real INT8 GEMM would consume.

use candle_core::{DType, Device, Tensor};
use serde::{Deserialize, Serialize};

use super::fake::MIN_QUANT_SCALE;
use crate::error::{Result, SmoothQuantError};

/// A tensor quantized to a symmetric integer grid with one scale.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuantizedTensor {
    /// Integer codes in row-major order.
    pub data: Vec<i8>,

    /// Step size of the grid.
    pub scale: f32,

    /// Original shape.
    pub shape: Vec<usize>,
}

impl QuantizedTensor {
    /// Get the total number of elements.
    #[must_use]
    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }
}

/// Quantize a tensor with `scale = max(|T|) / q_max` and
/// `q = clamp(round(T / scale), -q_max - 1, q_max)`.
///
/// # Errors
///
/// Returns error if `n_bits` is outside 2..=8 or the tensor cannot be read.
pub fn quantize_per_tensor(t: &Tensor, n_bits: u8) -> Result<QuantizedTensor> {
    if !(2..=8).contains(&n_bits) {
        return Err(SmoothQuantError::InvalidConfig(format!(
            "integer codes are stored as i8, n_bits must be 2-8, got {n_bits}"
        )));
    }
    let q_max = ((1i32 << (n_bits - 1)) - 1) as f32;
    let q_min = -q_max - 1.0;

    let shape = t.dims().to_vec();
    let values = t.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;

    let abs_max = values.iter().map(|x| x.abs()).fold(0.0f32, f32::max);
    let scale = abs_max.max(MIN_QUANT_SCALE as f32) / q_max;

    let data = values
        .iter()
        .map(|&v| (v / scale).round().clamp(q_min, q_max) as i8)
        .collect();

    Ok(QuantizedTensor { data, scale, shape })
}

/// Dequantize integer codes back to an F32 tensor.
///
/// # Errors
///
/// Returns error if the code count does not match the shape.
pub fn dequantize(quantized: &QuantizedTensor, device: &Device) -> Result<Tensor> {
    if quantized.data.len() != quantized.numel() {
        return Err(SmoothQuantError::ShapeMismatch {
            expected: quantized.shape.clone(),
            actual: vec![quantized.data.len()],
        });
    }
    let values: Vec<f32> = quantized
        .data
        .iter()
        .map(|&q| f32::from(q) * quantized.scale)
        .collect();
    Ok(Tensor::from_vec(values, quantized.shape.clone(), device)?)
}
