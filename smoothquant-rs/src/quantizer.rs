//! Structural W8A8 replacement of every decoder projection.
//!
//! Q/K/V outputs feed the attention batched matmuls, which an INT8 kernel
//! would run on integer inputs, so they are rounded as well when
//! [`QuantConfig::quantize_bmm_input`] is set. `out_proj`, `fc1` and `fc2`
//! feed residual additions or the ReLU and keep a float output.

use crate::config::QuantConfig;
use crate::error::{Result, SmoothQuantError};
use crate::model::OptModel;

/// Replace every projection with its `W8A8Linear` variant.
///
/// Returns the number of projections replaced.
///
/// # Errors
///
/// Returns error if the configuration is invalid, a projection is already
/// quantized, or weight quantization fails.
pub fn quantize_model(model: &mut OptModel, config: &QuantConfig) -> Result<usize> {
    config.validate()?;
    if let Some(p) = model.projections().find(|p| p.is_quantized()) {
        return Err(SmoothQuantError::AlreadyQuantized(p.name().to_string()));
    }

    let mut replaced = 0;
    for block in model.blocks_mut() {
        let bmm = config.quantize_bmm_input;
        block.q_proj.quantize(config, bmm)?;
        block.k_proj.quantize(config, bmm)?;
        block.v_proj.quantize(config, bmm)?;
        block.out_proj.quantize(config, false)?;
        block.fc1.quantize(config, false)?;
        block.fc2.quantize(config, false)?;
        replaced += 6;
    }

    tracing::info!(
        "Quantized {} projections (weight={:?}, act={:?}, bmm_input={}, bits={})",
        replaced,
        config.weight_quant,
        config.act_quant,
        config.quantize_bmm_input,
        config.n_bits
    );
    Ok(replaced)
}
