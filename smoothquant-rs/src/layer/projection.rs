//! Named projection layers with a float / fake-quantized switch.
//!
//! Every linear layer of the decoder is a `Projection`. Its name is the
//! fully-qualified checkpoint path (e.g. `model.decoder.layers.0.fc1`), which
//! is also the key of its activation scale.

use candle_core::Tensor;
use candle_nn::{Linear, Module};

use super::w8a8::W8A8Linear;
use crate::config::QuantConfig;
use crate::error::{Result, SmoothQuantError};

/// Receives the input of every projection during an instrumented forward pass.
pub trait LinearObserver {
    /// Called with the projection name and its input before the projection runs.
    ///
    /// # Errors
    ///
    /// Implementations may fail when reading the tensor.
    fn observe(&mut self, layer: &str, input: &Tensor) -> Result<()>;
}

/// Observer that records nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl LinearObserver for NoopObserver {
    fn observe(&mut self, _layer: &str, _input: &Tensor) -> Result<()> {
        Ok(())
    }
}

fn check_bias(bias: Option<&Tensor>, out_features: usize) -> Result<()> {
    match bias {
        Some(b) if b.dims() != [out_features] => Err(SmoothQuantError::ShapeMismatch {
            expected: vec![out_features],
            actual: b.dims().to_vec(),
        }),
        _ => Ok(()),
    }
}

#[derive(Debug, Clone)]
enum Kind {
    Float(Linear),
    Quantized(W8A8Linear),
}

/// A named linear layer that is either full precision or W8A8.
#[derive(Debug, Clone)]
pub struct Projection {
    name: String,
    kind: Kind,
}

impl Projection {
    /// Create a full-precision projection.
    ///
    /// # Errors
    ///
    /// Returns error if the weight is not 2D or the bias length does not match.
    pub fn new(name: impl Into<String>, weight: Tensor, bias: Option<Tensor>) -> Result<Self> {
        let (out_features, _) = weight.dims2()?;
        check_bias(bias.as_ref(), out_features)?;
        Ok(Self {
            name: name.into(),
            kind: Kind::Float(Linear::new(weight, bias)),
        })
    }

    /// Fully-qualified layer name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get input features dimension.
    #[must_use]
    pub fn in_features(&self) -> usize {
        self.weight().dims().get(1).copied().unwrap_or(0)
    }

    /// Get output features dimension.
    #[must_use]
    pub fn out_features(&self) -> usize {
        self.weight().dims().first().copied().unwrap_or(0)
    }

    /// Current weight `[out_features, in_features]`.
    #[must_use]
    pub fn weight(&self) -> &Tensor {
        match &self.kind {
            Kind::Float(l) => l.weight(),
            Kind::Quantized(l) => l.weight(),
        }
    }

    /// Current bias.
    #[must_use]
    pub fn bias(&self) -> Option<&Tensor> {
        match &self.kind {
            Kind::Float(l) => l.bias(),
            Kind::Quantized(l) => l.bias(),
        }
    }

    /// Check if this layer has been replaced by its W8A8 variant.
    #[must_use]
    pub const fn is_quantized(&self) -> bool {
        matches!(self.kind, Kind::Quantized(_))
    }

    /// Borrow the W8A8 layer, if quantized.
    #[must_use]
    pub fn as_quantized(&self) -> Option<&W8A8Linear> {
        match &self.kind {
            Kind::Quantized(l) => Some(l),
            Kind::Float(_) => None,
        }
    }

    /// Fail unless the layer is still full precision.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyQuantized` for W8A8 layers.
    pub fn ensure_float(&self) -> Result<()> {
        if self.is_quantized() {
            return Err(SmoothQuantError::AlreadyQuantized(self.name.clone()));
        }
        Ok(())
    }

    /// Replace weight and bias of a full-precision layer.
    ///
    /// # Errors
    ///
    /// Returns error if the layer is quantized or the new shapes differ.
    pub fn set_parameters(&mut self, weight: Tensor, bias: Option<Tensor>) -> Result<()> {
        self.ensure_float()?;
        if weight.dims() != self.weight().dims() {
            return Err(SmoothQuantError::ShapeMismatch {
                expected: self.weight().dims().to_vec(),
                actual: weight.dims().to_vec(),
            });
        }
        check_bias(bias.as_ref(), self.out_features())?;
        self.kind = Kind::Float(Linear::new(weight, bias));
        Ok(())
    }

    /// Swap the float layer for a `W8A8Linear`. Already quantized layers are left alone.
    ///
    /// # Errors
    ///
    /// Returns error if weight quantization fails.
    pub fn quantize(&mut self, config: &QuantConfig, quantize_output: bool) -> Result<()> {
        if let Kind::Float(linear) = &self.kind {
            let quantized = W8A8Linear::from_linear(linear, config, quantize_output)?;
            tracing::trace!("{} -> {}", self.name, quantized);
            self.kind = Kind::Quantized(quantized);
        }
        Ok(())
    }

    /// Forward pass that reports the input to `observer` first.
    ///
    /// # Errors
    ///
    /// Returns error if observation or the forward pass fails.
    pub fn forward_observed(&self, input: &Tensor, observer: &mut dyn LinearObserver) -> Result<Tensor> {
        observer.observe(&self.name, input)?;
        match &self.kind {
            Kind::Float(l) => Ok(l.forward(input)?),
            Kind::Quantized(l) => l.forward_quantized(input),
        }
    }

    /// Number of parameters (weight plus bias).
    #[must_use]
    pub fn num_parameters(&self) -> usize {
        self.weight().elem_count() + self.bias().map_or(0, Tensor::elem_count)
    }
}

impl Module for Projection {
    fn forward(&self, input: &Tensor) -> candle_core::Result<Tensor> {
        self.forward_observed(input, &mut NoopObserver)
            .map_err(|e| candle_core::Error::Msg(e.to_string()))
    }
}
