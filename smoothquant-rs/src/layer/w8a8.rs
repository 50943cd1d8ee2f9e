//! W8A8Linear layer - drop-in replacement for nn::Linear with fake INT8 math.

use candle_core::Tensor;
use candle_nn::{Linear, Module};

use crate::config::{ActQuant, QuantConfig, WeightQuant};
use crate::error::Result;
use crate::quantization::{fake_quant_per_tensor, fake_quantize_activation, fake_quantize_weight};

/// Linear layer simulating W8A8 inference.
///
/// Weights are rounded to the integer grid once at construction. Input
/// activations are rounded on every call with a freshly computed scale, and
/// the output is optionally rounded with a per-tensor scale. All arithmetic
/// stays in the model dtype.
///
/// # Example
///
/// ```ignore
/// use smoothquant_rs::{QuantConfig, W8A8Linear};
/// use candle_core::{Device, Tensor};
/// use candle_nn::{Linear, Module};
///
/// let device = Device::Cpu;
/// let weight = Tensor::randn(0.0f32, 1.0, (512, 256), &device)?;
/// let linear = Linear::new(weight, None);
/// let layer = W8A8Linear::from_linear(&linear, &QuantConfig::default(), false)?;
///
/// let input = Tensor::randn(0.0f32, 1.0, (4, 256), &device)?;
/// let output = layer.forward(&input)?;
/// ```
#[derive(Debug, Clone)]
pub struct W8A8Linear {
    /// Linear with the fake-quantized weight and the original bias.
    inner: Linear,

    weight_quant: WeightQuant,
    act_quant: ActQuant,
    quantize_output: bool,
    n_bits: u8,
}

impl W8A8Linear {
    /// Wrap a float linear layer.
    ///
    /// # Arguments
    ///
    /// * `linear` - Layer whose weight `[out_features, in_features]` and bias are taken
    /// * `config` - Quantization policy
    /// * `quantize_output` - Also round the layer output
    ///
    /// # Errors
    ///
    /// Returns error if the configuration is invalid or weight quantization fails.
    pub fn from_linear(linear: &Linear, config: &QuantConfig, quantize_output: bool) -> Result<Self> {
        config.validate()?;

        let weight = fake_quantize_weight(linear.weight(), config.weight_quant, config.n_bits)?;

        Ok(Self {
            inner: Linear::new(weight, linear.bias().cloned()),
            weight_quant: config.weight_quant,
            act_quant: config.act_quant,
            quantize_output,
            n_bits: config.n_bits,
        })
    }

    /// Get the input features dimension.
    #[must_use]
    pub fn in_features(&self) -> usize {
        self.inner.weight().dims().get(1).copied().unwrap_or(0)
    }

    /// Get the output features dimension.
    #[must_use]
    pub fn out_features(&self) -> usize {
        self.inner.weight().dims().first().copied().unwrap_or(0)
    }

    /// Get the (already fake-quantized) weight.
    #[must_use]
    pub fn weight(&self) -> &Tensor {
        self.inner.weight()
    }

    /// Get the bias.
    #[must_use]
    pub fn bias(&self) -> Option<&Tensor> {
        self.inner.bias()
    }

    /// Weight quantization granularity.
    #[must_use]
    pub const fn weight_quant(&self) -> WeightQuant {
        self.weight_quant
    }

    /// Activation quantization granularity.
    #[must_use]
    pub const fn act_quant(&self) -> ActQuant {
        self.act_quant
    }

    /// Whether the output is rounded as well.
    #[must_use]
    pub const fn quantize_output(&self) -> bool {
        self.quantize_output
    }

    /// Forward pass returning the crate error type.
    ///
    /// # Errors
    ///
    /// Returns error if quantization or the matmul fails.
    pub fn forward_quantized(&self, input: &Tensor) -> Result<Tensor> {
        let q_input = fake_quantize_activation(input, self.act_quant, self.n_bits)?;
        let output = self.inner.forward(&q_input)?;

        if self.quantize_output {
            fake_quant_per_tensor(&output, self.n_bits)
        } else {
            Ok(output)
        }
    }
}

impl Module for W8A8Linear {
    fn forward(&self, input: &Tensor) -> candle_core::Result<Tensor> {
        self.forward_quantized(input)
            .map_err(|e| candle_core::Error::Msg(e.to_string()))
    }
}

impl std::fmt::Display for W8A8Linear {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "W8A8Linear({}, {}, bias={}, weight_quant={:?}, act_quant={:?}, output_quant={})",
            self.in_features(),
            self.out_features(),
            self.bias().is_some(),
            self.weight_quant,
            self.act_quant,
            if self.quantize_output { "PerTensor" } else { "None" },
        )
    }
}
