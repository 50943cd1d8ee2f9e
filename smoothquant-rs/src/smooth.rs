//! SmoothQuant smoothing transform.
//!
//! For a producer (layer norm or projection) feeding a set of consumer
//! projections, each input channel `c` gets a factor
//!
//! ```text
//! s[c] = max(act[c]^alpha / max(w[c], floor)^(1 - alpha), floor)
//! ```
//!
//! where `act[c]` is the calibrated max |activation| and `w[c]` the max |weight|
//! over the consumers' column `c`. The producer's output channel is divided by
//! `s[c]` and the consumers' input column multiplied by it, so the composed map
//! is unchanged while activation outliers migrate into the weights.
//!
//! Every new tensor of the model is computed and checked before the first one
//! is written, so a mismatched scale file leaves the model untouched.

use candle_core::{DType, Device, Tensor};

use crate::calibration::ActScales;
use crate::config::SmoothConfig;
use crate::error::{Result, SmoothQuantError};
use crate::layer::Projection;
use crate::model::{BlockHandles, LayerNorm, OptModel};

/// Per-channel smoothing factors.
///
/// `alpha = 1` gives `s = act` (all difficulty moves to weights); `alpha = 0`
/// gives `s = 1 / w`, independent of the activations.
///
/// # Errors
///
/// Returns error if the vectors differ in length or a factor is not finite.
pub fn smoothing_factors(
    layer: &str,
    act_scales: &[f32],
    weight_scales: &[f32],
    alpha: f32,
    min_scale: f32,
) -> Result<Vec<f32>> {
    if act_scales.len() != weight_scales.len() {
        return Err(SmoothQuantError::DimensionMismatch {
            layer: layer.to_string(),
            expected: weight_scales.len(),
            actual: act_scales.len(),
        });
    }

    act_scales
        .iter()
        .zip(weight_scales)
        .enumerate()
        .map(|(channel, (&act, &weight))| {
            let s = (act.powf(alpha) / weight.max(min_scale).powf(1.0 - alpha)).max(min_scale);
            if s.is_finite() {
                Ok(s)
            } else {
                Err(SmoothQuantError::NonFiniteScale {
                    layer: layer.to_string(),
                    channel,
                })
            }
        })
        .collect()
}

/// Max |weight| per input channel across one or more `[out, in]` weights.
///
/// # Errors
///
/// Returns error if the weights have different input widths.
pub fn weight_input_scales(weights: &[&Tensor]) -> Result<Vec<f32>> {
    let per_weight = weights
        .iter()
        .map(|w| w.abs()?.to_dtype(DType::F32)?.max(0))
        .collect::<candle_core::Result<Vec<_>>>()?;
    let stacked = Tensor::stack(&per_weight, 0)?;
    Ok(stacked.max(0)?.to_vec1::<f32>()?)
}

struct NormUpdate {
    weight: Tensor,
    bias: Tensor,
}

struct LinearUpdate {
    weight: Tensor,
    bias: Option<Tensor>,
}

fn factor_tensor(factors: &[f32], device: &Device) -> Result<Tensor> {
    Ok(Tensor::new(factors, device)?)
}

/// `w[:, c] * s[c]` in the dtype of `w`.
fn scale_columns(weight: &Tensor, s: &Tensor) -> Result<Tensor> {
    let dtype = weight.dtype();
    Ok(weight.to_dtype(DType::F32)?.broadcast_mul(s)?.to_dtype(dtype)?)
}

/// `w[r, :] / s[r]` in the dtype of `w`.
fn divide_rows(weight: &Tensor, s: &Tensor) -> Result<Tensor> {
    let dtype = weight.dtype();
    let s = s.unsqueeze(1)?;
    Ok(weight.to_dtype(DType::F32)?.broadcast_div(&s)?.to_dtype(dtype)?)
}

/// `v / s` in the dtype of `v`.
fn divide_vector(v: &Tensor, s: &Tensor) -> Result<Tensor> {
    let dtype = v.dtype();
    Ok(v.to_dtype(DType::F32)?.broadcast_div(s)?.to_dtype(dtype)?)
}

fn check_channels(layer: &str, expected: usize, act: &[f32]) -> Result<()> {
    if expected == act.len() {
        Ok(())
    } else {
        Err(SmoothQuantError::DimensionMismatch {
            layer: layer.to_string(),
            expected,
            actual: act.len(),
        })
    }
}

fn plan_ln_linears(
    norm: &LayerNorm,
    linears: &[&Projection],
    act: &[f32],
    config: &SmoothConfig,
) -> Result<(NormUpdate, Vec<LinearUpdate>)> {
    let first = linears.first().ok_or_else(|| {
        SmoothQuantError::InvalidConfig(format!("{} feeds no projections", norm.name()))
    })?;
    check_channels(norm.name(), norm.normalized_shape(), act)?;
    for linear in linears {
        linear.ensure_float()?;
        check_channels(linear.name(), linear.in_features(), act)?;
    }

    let weights: Vec<&Tensor> = linears.iter().map(|l| l.weight()).collect();
    let weight_scales = weight_input_scales(&weights)?;
    let factors = smoothing_factors(first.name(), act, &weight_scales, config.alpha, config.min_scale)?;
    let s = factor_tensor(&factors, norm.weight().device())?;

    let norm_update = NormUpdate {
        weight: divide_vector(norm.weight(), &s)?,
        bias: divide_vector(norm.bias(), &s)?,
    };
    let linear_updates = linears
        .iter()
        .map(|l| {
            Ok(LinearUpdate {
                weight: scale_columns(l.weight(), &s)?,
                bias: l.bias().cloned(),
            })
        })
        .collect::<Result<Vec<_>>>()?;
    Ok((norm_update, linear_updates))
}

/// `prev` is given as raw parameters so the update can stack on top of a
/// pending norm update of the same projection.
fn plan_linear_linear(
    prev_name: &str,
    prev: &LinearUpdate,
    next: &Projection,
    act: &[f32],
    config: &SmoothConfig,
) -> Result<(LinearUpdate, LinearUpdate)> {
    next.ensure_float()?;
    let (prev_out, _) = prev.weight.dims2()?;
    check_channels(prev_name, prev_out, act)?;
    check_channels(next.name(), next.in_features(), act)?;

    let weight_scales = weight_input_scales(&[next.weight()])?;
    let factors = smoothing_factors(next.name(), act, &weight_scales, config.alpha, config.min_scale)?;
    let s = factor_tensor(&factors, next.weight().device())?;

    let prev_update = LinearUpdate {
        weight: divide_rows(&prev.weight, &s)?,
        bias: prev.bias.as_ref().map(|b| divide_vector(b, &s)).transpose()?,
    };
    let next_update = LinearUpdate {
        weight: scale_columns(next.weight(), &s)?,
        bias: next.bias().cloned(),
    };
    Ok((prev_update, next_update))
}

/// Smooth a layer norm and the projections that read its output.
///
/// All projections share one factor vector, computed from `act` and the
/// column-wise max over all of their weights.
///
/// # Errors
///
/// Returns error on a channel mismatch, a quantized projection or a
/// non-finite factor; nothing is modified in that case.
pub fn smooth_ln_linears(
    norm: &mut LayerNorm,
    linears: &mut [&mut Projection],
    act: &[f32],
    config: &SmoothConfig,
) -> Result<()> {
    config.validate()?;
    let (norm_update, updates) = {
        let views: Vec<&Projection> = linears.iter().map(|l| &**l).collect();
        plan_ln_linears(norm, &views, act, config)?
    };

    norm.set_parameters(norm_update.weight, norm_update.bias)?;
    for (linear, update) in linears.iter_mut().zip(updates) {
        linear.set_parameters(update.weight, update.bias)?;
    }
    Ok(())
}

/// Smooth a projection whose output feeds another projection directly.
///
/// `prev`'s output rows (and bias) are divided by the factors and `next`'s input
/// columns multiplied by them. `act` is the activation scale of `next`'s input.
///
/// # Errors
///
/// Returns error on a channel mismatch, a quantized projection or a
/// non-finite factor; nothing is modified in that case.
pub fn smooth_linear_linear(
    prev: &mut Projection,
    next: &mut Projection,
    act: &[f32],
    config: &SmoothConfig,
) -> Result<()> {
    config.validate()?;
    prev.ensure_float()?;
    let current = LinearUpdate {
        weight: prev.weight().clone(),
        bias: prev.bias().cloned(),
    };
    let (prev_update, next_update) = plan_linear_linear(prev.name(), &current, next, act, config)?;

    prev.set_parameters(prev_update.weight, prev_update.bias)?;
    next.set_parameters(next_update.weight, next_update.bias)?;
    Ok(())
}

struct BlockUpdate {
    attn_norm: NormUpdate,
    q: LinearUpdate,
    k: LinearUpdate,
    v: LinearUpdate,
    out: Option<LinearUpdate>,
    ffn_norm: NormUpdate,
    fc1: LinearUpdate,
}

/// Elementwise max of the Q/K/V input scales. The three read the same norm
/// output, so calibrated scales agree; the max guards against hand-edited files.
fn qkv_act_scale(scales: &ActScales, block: &BlockHandles<'_>) -> Result<Vec<f32>> {
    let q = scales.require(block.q_proj.name())?;
    let k = scales.require(block.k_proj.name())?;
    let v = scales.require(block.v_proj.name())?;
    check_channels(block.k_proj.name(), q.len(), k)?;
    check_channels(block.v_proj.name(), q.len(), v)?;
    Ok(q.iter()
        .zip(k)
        .zip(v)
        .map(|((&q, &k), &v)| q.max(k).max(v))
        .collect())
}

fn plan_block(block: &BlockHandles<'_>, scales: &ActScales, config: &SmoothConfig) -> Result<BlockUpdate> {
    let qkv_act = qkv_act_scale(scales, block)?;
    let (attn_norm, mut qkv) = plan_ln_linears(
        &*block.attn_norm,
        &[&*block.q_proj, &*block.k_proj, &*block.v_proj],
        &qkv_act,
        config,
    )?;
    let v = qkv.pop();
    let k = qkv.pop();
    let q = qkv.pop();
    let (Some(q), Some(k), Some(mut v)) = (q, k, v) else {
        return Err(SmoothQuantError::Model(format!("block {} lost a Q/K/V update", block.index)));
    };

    let mut out = None;
    if config.smooth_out_proj {
        let out_act = scales.require(block.out_proj.name())?;
        let (v_update, out_update) = plan_linear_linear(block.v_proj.name(), &v, &*block.out_proj, out_act, config)?;
        v = v_update;
        out = Some(out_update);
    }

    let fc1_act = scales.require(block.fc1.name())?;
    let (ffn_norm, mut fc1) = plan_ln_linears(&*block.ffn_norm, &[&*block.fc1], fc1_act, config)?;
    let fc1 = fc1
        .pop()
        .ok_or_else(|| SmoothQuantError::Model(format!("block {} lost the fc1 update", block.index)))?;

    Ok(BlockUpdate {
        attn_norm,
        q,
        k,
        v,
        out,
        ffn_norm,
        fc1,
    })
}

fn commit_block(block: BlockHandles<'_>, update: BlockUpdate) -> Result<()> {
    block.attn_norm.set_parameters(update.attn_norm.weight, update.attn_norm.bias)?;
    block.q_proj.set_parameters(update.q.weight, update.q.bias)?;
    block.k_proj.set_parameters(update.k.weight, update.k.bias)?;
    block.v_proj.set_parameters(update.v.weight, update.v.bias)?;
    if let Some(out) = update.out {
        block.out_proj.set_parameters(out.weight, out.bias)?;
    }
    block.ffn_norm.set_parameters(update.ffn_norm.weight, update.ffn_norm.bias)?;
    block.fc1.set_parameters(update.fc1.weight, update.fc1.bias)?;
    Ok(())
}

/// Smooth every decoder block of the model in place.
///
/// Q/K/V are smoothed jointly against the attention norm and `fc1` against the
/// feed-forward norm; `v_proj -> out_proj` is added when
/// [`SmoothConfig::smooth_out_proj`] is set. Scales must come from the
/// unsmoothed model, so a second call fails with `AlreadySmoothed`.
///
/// # Errors
///
/// Returns error if the model is already smoothed, a scale is missing or
/// mismatched, or a factor is not finite. The model is unchanged on error.
pub fn smooth_model(model: &mut OptModel, scales: &ActScales, config: &SmoothConfig) -> Result<()> {
    config.validate()?;
    if model.is_smoothed() {
        return Err(SmoothQuantError::AlreadySmoothed);
    }

    let updates = model
        .blocks_mut()
        .iter()
        .map(|block| plan_block(block, scales, config))
        .collect::<Result<Vec<_>>>()?;

    for (block, update) in model.blocks_mut().into_iter().zip(updates) {
        tracing::debug!("Smoothing block {}", block.index);
        commit_block(block, update)?;
    }
    model.mark_smoothed();

    tracing::info!(
        "Smoothed {} blocks (alpha={}, out_proj={})",
        model.num_layers(),
        config.alpha,
        config.smooth_out_proj
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::collect_act_scales;
    use crate::config::QuantConfig;
    use crate::model::OptConfig;
    use candle_core::Module;

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
        (a - b).unwrap().abs().unwrap().max_all().unwrap().to_scalar::<f32>().unwrap()
    }

    fn random_norm(size: usize, device: &Device) -> LayerNorm {
        let weight = Tensor::randn(1f32, 0.2, size, device).unwrap();
        let bias = Tensor::randn(0f32, 0.1, size, device).unwrap();
        LayerNorm::new("ln", weight, bias, 1e-5)
    }

    fn random_projection(name: &str, in_features: usize, out_features: usize, device: &Device) -> Projection {
        let weight = Tensor::randn(0f32, 0.3, (out_features, in_features), device).unwrap();
        let bias = Tensor::randn(0f32, 0.1, out_features, device).unwrap();
        Projection::new(name, weight, Some(bias)).unwrap()
    }

    fn outlier_input(device: &Device) -> Tensor {
        let x = Tensor::randn(0f32, 1.0, (2, 5, 8), device).unwrap();
        let mask = Tensor::new(&[1f32, 1.0, 30.0, 1.0, 1.0, 1.0, 1.0, 1.0], device).unwrap();
        x.broadcast_mul(&mask).unwrap()
    }

    #[test]
    fn test_smoothing_factors_formula() {
        let factors = smoothing_factors("l", &[4.0, 1.0, 9.0], &[1.0, 4.0, 0.25], 0.5, 1e-5).unwrap();
        assert!((factors[0] - 2.0).abs() < 1e-6);
        assert!((factors[1] - 0.5).abs() < 1e-6);
        assert!((factors[2] - 6.0).abs() < 1e-6);
    }

    #[test]
    fn test_alpha_boundaries() {
        let act = [3.0, 0.5, 10.0];
        let weight = [0.5, 2.0, 0.1];

        let all_to_weights = smoothing_factors("l", &act, &weight, 1.0, 1e-5).unwrap();
        for (s, a) in all_to_weights.iter().zip(act) {
            assert!((s - a).abs() < 1e-6);
        }

        let weight_only = smoothing_factors("l", &act, &weight, 0.0, 1e-5).unwrap();
        for (s, w) in weight_only.iter().zip(weight) {
            assert!((s - 1.0 / w).abs() < 1e-4);
        }
    }

    #[test]
    fn test_zero_channels_stay_finite() {
        let factors = smoothing_factors("l", &[0.0, 0.0, 2.0], &[0.0, 1.0, 0.0], 0.5, 1e-5).unwrap();
        assert!(factors.iter().all(|s| s.is_finite() && *s >= 1e-5));
    }

    #[test]
    fn test_non_finite_factor_is_rejected() {
        let err = smoothing_factors("fc1", &[1.0, f32::INFINITY], &[1.0, 1.0], 0.5, 1e-5).unwrap_err();
        assert!(matches!(err, SmoothQuantError::NonFiniteScale { channel: 1, .. }));
    }

    #[test]
    fn test_weight_input_scales_across_weights() {
        let device = Device::Cpu;
        let a = Tensor::new(&[[1f32, -4.0], [0.5, 2.0]], &device).unwrap();
        let b = Tensor::new(&[[-3f32, 1.0]], &device).unwrap();
        assert_eq!(weight_input_scales(&[&a, &b]).unwrap(), vec![3.0, 4.0]);
    }

    #[test]
    fn test_ln_linears_preserve_function() {
        let device = Device::Cpu;
        let mut norm = random_norm(8, &device);
        let mut q = random_projection("q", 8, 6, &device);
        let mut k = random_projection("k", 8, 6, &device);
        let x = outlier_input(&device);

        let before_q = q.forward(&norm.forward(&x).unwrap()).unwrap();
        let before_k = k.forward(&norm.forward(&x).unwrap()).unwrap();

        let act = vec![1.5, 0.8, 30.0, 2.0, 0.3, 1.0, 4.0, 0.9];
        smooth_ln_linears(&mut norm, &mut [&mut q, &mut k], &act, &SmoothConfig::default()).unwrap();

        let after_q = q.forward(&norm.forward(&x).unwrap()).unwrap();
        let after_k = k.forward(&norm.forward(&x).unwrap()).unwrap();
        assert!(max_abs_diff(&before_q, &after_q) < 1e-4);
        assert!(max_abs_diff(&before_k, &after_k) < 1e-4);
    }

    #[test]
    fn test_shared_factor_across_consumers() {
        let device = Device::Cpu;
        let mut norm = random_norm(8, &device);
        let mut q = random_projection("q", 8, 4, &device);
        let mut k = random_projection("k", 8, 4, &device);
        let mut v = random_projection("v", 8, 4, &device);
        let originals = [q.weight().clone(), k.weight().clone(), v.weight().clone()];
        let gain = norm.weight().clone();

        let act = vec![2.0, 0.5, 40.0, 1.0, 1.0, 3.0, 0.1, 7.0];
        smooth_ln_linears(&mut norm, &mut [&mut q, &mut k, &mut v], &act, &SmoothConfig::default()).unwrap();

        // s = gain_before / gain_after must be identical for every consumer column ratio.
        let s = (gain / norm.weight()).unwrap();
        for (before, after) in originals.iter().zip([q.weight(), k.weight(), v.weight()]) {
            let expected = before.broadcast_mul(&s).unwrap();
            assert!(max_abs_diff(&expected, after) < 1e-4);
        }
    }

    #[test]
    fn test_linear_linear_preserves_function() {
        let device = Device::Cpu;
        let mut v = random_projection("v", 8, 6, &device);
        let mut out = random_projection("out", 6, 8, &device);
        let x = outlier_input(&device);

        let before = out.forward(&v.forward(&x).unwrap()).unwrap();
        let act = vec![0.5, 9.0, 1.0, 2.0, 0.05, 3.0];
        smooth_linear_linear(&mut v, &mut out, &act, &SmoothConfig::with_alpha(0.8)).unwrap();
        let after = out.forward(&v.forward(&x).unwrap()).unwrap();

        assert!(max_abs_diff(&before, &after) < 1e-4);
    }

    #[test]
    fn test_mismatched_scale_leaves_layers_untouched() {
        let device = Device::Cpu;
        let mut norm = random_norm(8, &device);
        let mut fc1 = random_projection("fc1", 8, 16, &device);
        let gain = norm.weight().clone();
        let weight = fc1.weight().clone();

        let err = smooth_ln_linears(&mut norm, &mut [&mut fc1], &[1.0; 7], &SmoothConfig::default()).unwrap_err();
        assert!(matches!(err, SmoothQuantError::DimensionMismatch { expected: 8, actual: 7, .. }));
        assert_eq!(max_abs_diff(&gain, norm.weight()), 0.0);
        assert_eq!(max_abs_diff(&weight, fc1.weight()), 0.0);
    }

    #[test]
    fn test_smooth_model_preserves_logits() {
        let device = Device::Cpu;
        let mut model = OptModel::new(&OptConfig::tiny(), &device).unwrap();
        let sequences = vec![vec![2u32, 8, 15, 3, 40], vec![2, 11, 12, 13]];
        let scales = collect_act_scales(&model, &sequences).unwrap();

        let ids = Tensor::new(&[[2u32, 8, 15, 3, 40, 9]], &device).unwrap();
        let before = model.forward(&ids).unwrap();

        smooth_model(&mut model, &scales, &SmoothConfig::default().with_out_proj(true)).unwrap();
        assert!(model.is_smoothed());

        let after = model.forward(&ids).unwrap();
        let scale = before.abs().unwrap().max_all().unwrap().to_scalar::<f32>().unwrap();
        assert!(max_abs_diff(&before, &after) < 1e-3 * scale.max(1.0));
    }

    #[test]
    fn test_smooth_model_twice_fails() {
        let device = Device::Cpu;
        let mut model = OptModel::new(&OptConfig::tiny(), &device).unwrap();
        let scales = collect_act_scales(&model, &[vec![2u32, 5, 6]]).unwrap();

        smooth_model(&mut model, &scales, &SmoothConfig::default()).unwrap();
        let err = smooth_model(&mut model, &scales, &SmoothConfig::default()).unwrap_err();
        assert!(matches!(err, SmoothQuantError::AlreadySmoothed));
    }

    #[test]
    fn test_smooth_model_is_atomic() {
        let device = Device::Cpu;
        let mut model = OptModel::new(&OptConfig::tiny(), &device).unwrap();
        let mut scales = collect_act_scales(&model, &[vec![2u32, 5, 6]]).unwrap();
        // corrupt only the last block so earlier blocks would be smoothed first
        scales.insert("model.decoder.layers.1.fc1", vec![1.0; 3]);

        let ids = Tensor::new(&[[2u32, 5, 6, 7]], &device).unwrap();
        let before = model.forward(&ids).unwrap();

        let err = smooth_model(&mut model, &scales, &SmoothConfig::default()).unwrap_err();
        assert!(matches!(err, SmoothQuantError::DimensionMismatch { .. }));
        assert!(!model.is_smoothed());
        assert_eq!(max_abs_diff(&before, &model.forward(&ids).unwrap()), 0.0);
    }

    #[test]
    fn test_missing_scale() {
        let device = Device::Cpu;
        let mut model = OptModel::new(&OptConfig::tiny(), &device).unwrap();
        let err = smooth_model(&mut model, &ActScales::new(), &SmoothConfig::default()).unwrap_err();
        assert!(matches!(err, SmoothQuantError::MissingActScale(_)));
    }

    #[test]
    fn test_quantized_projection_cannot_be_smoothed() {
        let device = Device::Cpu;
        let mut norm = random_norm(8, &device);
        let mut fc1 = random_projection("fc1", 8, 16, &device);
        fc1.quantize(&QuantConfig::default(), false).unwrap();

        let err = smooth_ln_linears(&mut norm, &mut [&mut fc1], &[1.0; 8], &SmoothConfig::default()).unwrap_err();
        assert!(matches!(err, SmoothQuantError::AlreadyQuantized(_)));
    }
}
