//! Layer normalization built from basic tensor operations.
//!
//! Gain and bias are plain tensors so the smoother can rescale them in place.

use candle_core::{DType, Result, Tensor, D};
use candle_nn::{Init, Module, VarBuilder};

/// LayerNorm with an elementwise affine gain and bias.
#[derive(Debug, Clone)]
pub struct LayerNorm {
    name: String,
    weight: Tensor,
    bias: Tensor,
    eps: f64,
}

impl LayerNorm {
    /// Create a new LayerNorm.
    pub fn new(name: impl Into<String>, weight: Tensor, bias: Tensor, eps: f64) -> Self {
        Self {
            name: name.into(),
            weight,
            bias,
            eps,
        }
    }

    /// Fully-qualified layer name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Gain vector.
    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    /// Bias vector.
    pub fn bias(&self) -> &Tensor {
        &self.bias
    }

    /// Normalized size.
    pub fn normalized_shape(&self) -> usize {
        self.weight.dims().first().copied().unwrap_or(0)
    }

    /// Replace gain and bias.
    pub fn set_parameters(&mut self, weight: Tensor, bias: Tensor) -> Result<()> {
        if weight.dims() != self.weight.dims() || bias.dims() != self.bias.dims() {
            return Err(candle_core::Error::Msg(format!(
                "{}: expected parameters of shape {:?}, got {:?}",
                self.name,
                self.weight.dims(),
                weight.dims()
            )));
        }
        self.weight = weight;
        self.bias = bias;
        Ok(())
    }

    /// y = (x - mean(x)) / sqrt(var(x) + eps) * weight + bias
    fn forward_impl(&self, x: &Tensor) -> Result<Tensor> {
        let dtype = x.dtype();
        // statistics in f32 so half-precision models stay stable
        let x = x.to_dtype(DType::F32)?;

        let mean = x.mean_keepdim(D::Minus1)?;
        let x_centered = x.broadcast_sub(&mean)?;
        let var = x_centered.sqr()?.mean_keepdim(D::Minus1)?;
        let normalized = x_centered.broadcast_div(&(var + self.eps)?.sqrt()?)?;

        normalized
            .to_dtype(dtype)?
            .broadcast_mul(&self.weight)?
            .broadcast_add(&self.bias)
    }
}

impl Module for LayerNorm {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        self.forward_impl(x)
    }
}

/// Create a layer norm, initialized to the identity when weights are absent.
pub fn layer_norm(size: usize, eps: f64, vb: VarBuilder) -> Result<LayerNorm> {
    let weight = vb.get_with_hints(size, "weight", Init::Const(1.0))?;
    let bias = vb.get_with_hints(size, "bias", Init::Const(0.0))?;
    Ok(LayerNorm::new(vb.prefix(), weight, bias, eps))
}
