//! Naive W8A8 versus SmoothQuant W8A8 on a model with activation outliers.
//!
//! Run with: `cargo run --example outlier_demo`

use candle_core::{Device, Tensor};
use smoothquant_rs::prelude::*;
use smoothquant_rs::OptConfig;

fn mean_abs_error(a: &Tensor, b: &Tensor) -> Result<f32> {
    Ok((a - b)?.abs()?.mean_all()?.to_scalar::<f32>()?)
}

/// Give two hidden channels 60x larger norm outputs while keeping the float
/// function unchanged, the pattern observed in large OPT models.
fn inject_outliers(model: &mut OptModel) -> Result<()> {
    let hidden = model.config().hidden_size;
    let mask: Vec<f32> = (0..hidden).map(|c| if c == 3 || c == 17 { 60.0 } else { 1.0 }).collect();
    let mask = Tensor::new(mask.as_slice(), model.device())?;

    for block in model.blocks_mut() {
        for norm in [block.attn_norm, block.ffn_norm] {
            let weight = norm.weight().broadcast_mul(&mask)?;
            let bias = norm.bias().broadcast_mul(&mask)?;
            norm.set_parameters(weight, bias)?;
        }
        for proj in [block.q_proj, block.k_proj, block.v_proj, block.fc1] {
            let weight = proj.weight().broadcast_div(&mask)?;
            let bias = proj.bias().cloned();
            proj.set_parameters(weight, bias)?;
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    println!("=== SmoothQuant outlier demo ===\n");

    let device = Device::Cpu;
    let mut model = OptModel::new(&OptConfig::tiny(), &device)?;
    inject_outliers(&mut model)?;

    println!("1. Calibration");
    let sequences: Vec<Vec<u32>> = (0..32u32)
        .map(|i| (0..16u32).map(|j| 2 + (i * 13 + j * 7) % 60).collect())
        .collect();
    let scales = collect_act_scales(&model, &sequences)?;
    let q_scale = scales.require("model.decoder.layers.0.self_attn.q_proj")?;
    let max = q_scale.iter().copied().fold(0f32, f32::max);
    let mean = q_scale.iter().sum::<f32>() / q_scale.len() as f32;
    println!("   layer 0 q_proj input: max {max:.1}, mean {mean:.1}");

    let ids = Tensor::new(&[[2u32, 14, 27, 33, 8, 51, 19, 40]], &device)?;
    let reference = model.forward(&ids)?;

    println!("\n2. Naive W8A8");
    let mut naive = model.clone();
    quantize_model(&mut naive, &QuantConfig::default())?;
    println!("   mean |logit error|: {:.4}", mean_abs_error(&reference, &naive.forward(&ids)?)?);

    println!("\n3. SmoothQuant W8A8");
    for alpha in [0.25f32, 0.5, 0.75] {
        let mut smoothed = model.clone();
        smooth_model(&mut smoothed, &scales, &SmoothConfig::with_alpha(alpha))?;
        quantize_model(&mut smoothed, &QuantConfig::default())?;
        println!(
            "   alpha={alpha}: mean |logit error|: {:.4}",
            mean_abs_error(&reference, &smoothed.forward(&ids)?)?
        );
    }

    println!("\n=== Done ===");
    Ok(())
}
