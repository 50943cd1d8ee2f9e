//! Quantization kernels for SmoothQuant.
//!
//! This module provides:
//! - **Fake quantization**: round to a symmetric INT grid and immediately
//!   dequantize (per-tensor, per-channel, per-token)
//! - **Explicit INT8**: `QuantizedTensor` holding the integer codes and scale

mod fake;
mod int8;

pub use fake::{
    fake_quant_per_channel, fake_quant_per_tensor, fake_quant_per_token, fake_quantize_activation,
    fake_quantize_weight, MIN_QUANT_SCALE,
};
pub use int8::{dequantize, quantize_per_tensor, QuantizedTensor};
