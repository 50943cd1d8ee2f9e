//! Fake quantization kernels.
//!
//! All kernels use symmetric AbsMax scaling:
//! ```text
//! scale = max(|T|) / q_max
//! T_fq  = clamp(round(T / scale), -q_max - 1, q_max) * scale
//! ```
//! The result stays in the input dtype; only the set of representable values
//! shrinks to the integer grid.

use candle_core::{Tensor, D};

use crate::config::{ActQuant, WeightQuant};
use crate::error::{Result, SmoothQuantError};

/// Floor on `max(|T|)` before it becomes a scale, so all-zero inputs stay finite.
pub const MIN_QUANT_SCALE: f64 = 1e-5;

fn q_max(n_bits: u8) -> Result<f64> {
    if !(2..=16).contains(&n_bits) {
        return Err(SmoothQuantError::InvalidConfig(format!(
            "n_bits must be 2-16, got {n_bits}"
        )));
    }
    Ok(f64::from((1u32 << (n_bits - 1)) - 1))
}

fn round_to_grid(t: &Tensor, scale: &Tensor, q_max: f64) -> Result<Tensor> {
    let q = t.broadcast_div(scale)?.round()?.clamp(-q_max - 1.0, q_max)?;
    Ok(q.broadcast_mul(scale)?)
}

/// Fake-quantize with a single scale for the whole tensor.
///
/// # Errors
///
/// Returns error if `n_bits` is out of range or a tensor op fails.
pub fn fake_quant_per_tensor(t: &Tensor, n_bits: u8) -> Result<Tensor> {
    let q_max = q_max(n_bits)?;
    let scale = (t.abs()?.flatten_all()?.max(0)?.maximum(MIN_QUANT_SCALE)? / q_max)?;
    round_to_grid(t, &scale, q_max)
}

/// Fake-quantize with one scale per row of the last dimension.
fn fake_quant_rows(t: &Tensor, n_bits: u8) -> Result<Tensor> {
    let q_max = q_max(n_bits)?;
    let scale = (t.abs()?.max_keepdim(D::Minus1)?.maximum(MIN_QUANT_SCALE)? / q_max)?;
    round_to_grid(t, &scale, q_max)
}

/// Fake-quantize a weight `[out_features, in_features]` with one scale per
/// output channel.
///
/// # Errors
///
/// Returns error if the weight is not 2D or a tensor op fails.
pub fn fake_quant_per_channel(weight: &Tensor, n_bits: u8) -> Result<Tensor> {
    if weight.rank() != 2 {
        return Err(SmoothQuantError::InvalidConfig(
            "weight must be 2D [out_features, in_features]".to_string(),
        ));
    }
    fake_quant_rows(weight, n_bits)
}

/// Fake-quantize activations `[..., hidden]` with one scale per token.
///
/// # Errors
///
/// Returns error if the input is a scalar or a tensor op fails.
pub fn fake_quant_per_token(x: &Tensor, n_bits: u8) -> Result<Tensor> {
    if x.rank() == 0 {
        return Err(SmoothQuantError::InvalidConfig(
            "activations must have at least one dimension".to_string(),
        ));
    }
    fake_quant_rows(x, n_bits)
}

/// Apply a weight quantization policy.
///
/// # Errors
///
/// Returns error if quantization fails.
pub fn fake_quantize_weight(weight: &Tensor, mode: WeightQuant, n_bits: u8) -> Result<Tensor> {
    match mode {
        WeightQuant::PerTensor => fake_quant_per_tensor(weight, n_bits),
        WeightQuant::PerChannel => fake_quant_per_channel(weight, n_bits),
        WeightQuant::None => Ok(weight.clone()),
    }
}

/// Apply an activation quantization policy.
///
/// # Errors
///
/// Returns error if quantization fails.
pub fn fake_quantize_activation(x: &Tensor, mode: ActQuant, n_bits: u8) -> Result<Tensor> {
    match mode {
        ActQuant::PerTensor => fake_quant_per_tensor(x, n_bits),
        ActQuant::PerToken => fake_quant_per_token(x, n_bits),
        ActQuant::None => Ok(x.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
        a.sub(b)
            .unwrap()
            .abs()
            .unwrap()
            .flatten_all()
            .unwrap()
            .max(0)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap()
    }

    #[test]
    fn test_per_tensor_error_bounded_by_half_step() {
        let device = Device::Cpu;
        let values: Vec<f32> = (0..256).map(|i| ((i as f32) * 0.37).sin() * 3.0).collect();
        let t = Tensor::from_vec(values.clone(), (16, 16), &device).unwrap();

        let fq = fake_quant_per_tensor(&t, 8).unwrap();
        let abs_max = values.iter().map(|v| v.abs()).fold(0.0f32, f32::max);
        let step = abs_max / 127.0;

        assert!(max_abs_diff(&t, &fq) <= step / 2.0 + 1e-6);
    }

    #[test]
    fn test_per_tensor_outlier_dominates_scale() {
        let device = Device::Cpu;
        let t = Tensor::new(&[[100.0f32, 0.3, -0.2, 0.1]], &device).unwrap();
        let fq: Vec<f32> = fake_quant_per_tensor(&t, 8)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();

        // step is 100/127 ~ 0.79, so the small values collapse to zero
        assert!((fq[0] - 100.0).abs() < 1e-4);
        assert_eq!(&fq[1..], &[0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_per_token_rows_independent() {
        let device = Device::Cpu;
        let t = Tensor::new(&[[100.0f32, 0.5], [0.3, -0.2]], &device).unwrap();
        let fq: Vec<Vec<f32>> = fake_quant_per_token(&t, 8).unwrap().to_vec2().unwrap();

        // second row has its own scale, so it survives almost exactly
        assert!((fq[1][0] - 0.3).abs() < 0.3 / 127.0);
        assert!((fq[1][1] + 0.2).abs() < 0.3 / 127.0);
    }

    #[test]
    fn test_per_channel_uses_row_scales() {
        let device = Device::Cpu;
        let w = Tensor::new(&[[1.0f32, -0.5], [0.01, 0.02]], &device).unwrap();
        let fq = fake_quant_per_channel(&w, 8).unwrap();
        assert!(max_abs_diff(&w, &fq) <= 1.0 / 127.0 / 2.0 + 1e-6);

        let w3 = Tensor::zeros((2, 2, 2), DType::F32, &device).unwrap();
        assert!(fake_quant_per_channel(&w3, 8).is_err());
    }

    #[test]
    fn test_zero_tensor_stays_zero() {
        let device = Device::Cpu;
        let t = Tensor::zeros((4, 8), DType::F32, &device).unwrap();
        for fq in [
            fake_quant_per_tensor(&t, 8).unwrap(),
            fake_quant_per_token(&t, 8).unwrap(),
        ] {
            let vals: Vec<f32> = fq.flatten_all().unwrap().to_vec1().unwrap();
            assert!(vals.iter().all(|v| *v == 0.0));
        }
    }

    #[test]
    fn test_grid_values_are_exact() {
        let device = Device::Cpu;
        // max is 127 so the step is exactly 1.0
        let values: Vec<f32> = vec![127.0, -128.0, 3.0, -42.0, 0.0, 64.0];
        let t = Tensor::from_vec(values.clone(), (2, 3), &device).unwrap();
        let fq: Vec<f32> = fake_quant_per_tensor(&t.clamp(-127.0, 127.0).unwrap(), 8)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        assert_eq!(fq, vec![127.0, -127.0, 3.0, -42.0, 0.0, 64.0]);
    }

    #[test]
    fn test_none_modes_passthrough() {
        let device = Device::Cpu;
        let t = Tensor::new(&[[0.123f32, 4.56]], &device).unwrap();
        let w = fake_quantize_weight(&t, WeightQuant::None, 8).unwrap();
        let a = fake_quantize_activation(&t, ActQuant::None, 8).unwrap();
        assert_eq!(max_abs_diff(&t, &w), 0.0);
        assert_eq!(max_abs_diff(&t, &a), 0.0);
    }

    #[test]
    fn test_invalid_bits() {
        let device = Device::Cpu;
        let t = Tensor::ones((2, 2), DType::F32, &device).unwrap();
        assert!(fake_quant_per_tensor(&t, 0).is_err());
        assert!(fake_quant_per_tensor(&t, 1).is_err());
    }
}
