//! Configuration for smoothing, fake quantization and pipeline runs.

use std::path::Path;

use candle_core::{DType, Device};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SmoothQuantError};

/// Weight quantization granularity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WeightQuant {
    /// One scale for the whole weight matrix.
    #[default]
    PerTensor,
    /// One scale per output channel (row).
    PerChannel,
    /// Keep weights in floating point.
    None,
}

/// Activation quantization granularity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActQuant {
    /// One scale for the whole activation tensor, recomputed per call.
    #[default]
    PerTensor,
    /// One scale per token (row of the flattened activation).
    PerToken,
    /// Keep activations in floating point.
    None,
}

/// Fake W8A8 quantization policy.
///
/// `quantize_bmm_input` controls whether Q/K/V projections also quantize their
/// outputs, since those feed the attention matmuls directly. Output
/// projections and feed-forward layers never quantize their outputs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuantConfig {
    /// Weight quantization granularity.
    #[serde(default)]
    pub weight_quant: WeightQuant,

    /// Input activation quantization granularity.
    #[serde(default)]
    pub act_quant: ActQuant,

    /// Quantize Q/K/V outputs.
    #[serde(default = "default_true")]
    pub quantize_bmm_input: bool,

    /// Bit width of the symmetric grid.
    #[serde(default = "default_bits")]
    pub n_bits: u8,
}

fn default_true() -> bool {
    true
}

fn default_bits() -> u8 {
    8
}

impl Default for QuantConfig {
    fn default() -> Self {
        Self {
            weight_quant: WeightQuant::PerTensor,
            act_quant: ActQuant::PerTensor,
            quantize_bmm_input: true,
            n_bits: 8,
        }
    }
}

impl QuantConfig {
    /// Create a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Per-channel weights with per-token activations.
    #[must_use]
    pub fn fine_grained() -> Self {
        Self {
            weight_quant: WeightQuant::PerChannel,
            act_quant: ActQuant::PerToken,
            ..Default::default()
        }
    }

    /// Set the weight quantization granularity.
    #[must_use]
    pub const fn with_weight_quant(mut self, weight_quant: WeightQuant) -> Self {
        self.weight_quant = weight_quant;
        self
    }

    /// Set the activation quantization granularity.
    #[must_use]
    pub const fn with_act_quant(mut self, act_quant: ActQuant) -> Self {
        self.act_quant = act_quant;
        self
    }

    /// Enable or disable Q/K/V output quantization.
    #[must_use]
    pub const fn with_quantize_bmm_input(mut self, enabled: bool) -> Self {
        self.quantize_bmm_input = enabled;
        self
    }

    /// Set the bit width.
    #[must_use]
    pub const fn with_bits(mut self, n_bits: u8) -> Self {
        self.n_bits = n_bits;
        self
    }

    /// Largest positive grid value, `2^(bits-1) - 1`.
    #[must_use]
    pub fn q_max(&self) -> f64 {
        f64::from((1u32 << self.n_bits.saturating_sub(1)) - 1)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns error if the bit width is outside 2..=16.
    pub fn validate(&self) -> Result<()> {
        if !(2..=16).contains(&self.n_bits) {
            return Err(SmoothQuantError::InvalidConfig(
                "n_bits must be 2-16".to_string(),
            ));
        }
        Ok(())
    }
}

/// Smoothing parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SmoothConfig {
    /// Migration strength: how much quantization difficulty moves from
    /// activations to weights.
    #[serde(default = "default_alpha")]
    pub alpha: f32,

    /// Floor applied to weight scales and smoothing factors.
    #[serde(default = "default_min_scale")]
    pub min_scale: f32,

    /// Also smooth `v_proj -> out_proj` (needs `out_proj` activation scales).
    #[serde(default)]
    pub smooth_out_proj: bool,
}

fn default_alpha() -> f32 {
    0.5
}

fn default_min_scale() -> f32 {
    1e-5
}

impl Default for SmoothConfig {
    fn default() -> Self {
        Self {
            alpha: default_alpha(),
            min_scale: default_min_scale(),
            smooth_out_proj: false,
        }
    }
}

impl SmoothConfig {
    /// Create a configuration with the given migration strength.
    #[must_use]
    pub fn with_alpha(alpha: f32) -> Self {
        Self {
            alpha,
            ..Default::default()
        }
    }

    /// Set the scale floor.
    #[must_use]
    pub const fn with_min_scale(mut self, min_scale: f32) -> Self {
        self.min_scale = min_scale;
        self
    }

    /// Enable or disable `v_proj -> out_proj` smoothing.
    #[must_use]
    pub const fn with_out_proj(mut self, enabled: bool) -> Self {
        self.smooth_out_proj = enabled;
        self
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns error if alpha is outside [0, 1] or the floor is not positive.
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.alpha) {
            return Err(SmoothQuantError::InvalidConfig(format!(
                "alpha must be in [0, 1], got {}",
                self.alpha
            )));
        }
        if !(self.min_scale.is_finite() && self.min_scale > 0.0) {
            return Err(SmoothQuantError::InvalidConfig(
                "min_scale must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Floating-point precision the model is loaded in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    /// 32-bit float.
    #[default]
    F32,
    /// 16-bit IEEE half.
    F16,
    /// bfloat16.
    Bf16,
}

impl Precision {
    /// The candle dtype for this precision.
    #[must_use]
    pub const fn dtype(self) -> DType {
        match self {
            Self::F32 => DType::F32,
            Self::F16 => DType::F16,
            Self::Bf16 => DType::BF16,
        }
    }
}

/// Device placement.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    /// Host CPU.
    #[default]
    Cpu,
    /// First CUDA device, falling back to CPU when unavailable.
    Cuda,
}

impl DeviceKind {
    /// Resolve to a candle device.
    ///
    /// # Errors
    ///
    /// Returns error if the CUDA runtime fails to initialize.
    pub fn device(self) -> Result<Device> {
        match self {
            Self::Cpu => Ok(Device::Cpu),
            Self::Cuda => Ok(Device::cuda_if_available(0)?),
        }
    }
}

/// Dataset settings for calibration and evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetSettings {
    /// Path to a JSONL file with a `text` field per line.
    pub path: String,

    /// Number of examples to use.
    #[serde(default = "default_num_samples")]
    pub num_samples: usize,

    /// Right-pad every evaluation sequence to this length.
    #[serde(default)]
    pub pad_to: Option<usize>,
}

fn default_num_samples() -> usize {
    1000
}


/// A full baseline / naive W8A8 / SmoothQuant W8A8 run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Model directory or Hugging Face model id.
    pub model: String,

    /// Evaluation dataset.
    pub dataset: DatasetSettings,

    /// Activation scales file produced by `generate-act-scales`.
    pub act_scales: String,

    /// Smoothing parameters.
    #[serde(default)]
    pub smooth: SmoothConfig,

    /// Fake quantization policy.
    #[serde(default)]
    pub quant: QuantConfig,

    /// Model precision.
    #[serde(default)]
    pub dtype: Precision,

    /// Device placement.
    #[serde(default)]
    pub device: DeviceKind,
}

impl PipelineConfig {
    /// Load configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or parsed.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Write configuration to a YAML file.
    ///
    /// # Errors
    ///
    /// Returns error if serialization or the write fails.
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Create a configuration from a named OPT preset.
    ///
    /// # Errors
    ///
    /// Returns error if the preset is unknown.
    pub fn from_preset(preset: &str) -> Result<Self> {
        let model = match preset {
            "opt-125m" => "facebook/opt-125m",
            "opt-1.3b" => "facebook/opt-1.3b",
            "opt-6.7b" => "facebook/opt-6.7b",
            "opt-13b" => "facebook/opt-13b",
            _ => {
                return Err(SmoothQuantError::InvalidConfig(format!(
                    "unknown preset: {preset}"
                )))
            }
        };
        let (dtype, device) = if preset == "opt-125m" {
            (Precision::F32, DeviceKind::Cpu)
        } else {
            (Precision::F16, DeviceKind::Cuda)
        };

        Ok(Self {
            model: model.to_string(),
            dataset: DatasetSettings {
                path: "data/lambada_validation.jsonl".to_string(),
                num_samples: default_num_samples(),
                pad_to: None,
            },
            act_scales: format!("act_scales/{preset}.safetensors"),
            smooth: SmoothConfig::default(),
            quant: QuantConfig::default(),
            dtype,
            device,
        })
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns error if any section is invalid.
    pub fn validate(&self) -> Result<()> {
        if self.model.is_empty() {
            return Err(SmoothQuantError::InvalidConfig(
                "model must not be empty".to_string(),
            ));
        }
        if self.dataset.path.is_empty() {
            return Err(SmoothQuantError::InvalidConfig(
                "dataset.path must not be empty".to_string(),
            ));
        }
        if self.dataset.num_samples == 0 {
            return Err(SmoothQuantError::InvalidConfig(
                "dataset.num_samples must be > 0".to_string(),
            ));
        }
        if self.dataset.pad_to.is_some_and(|len| len < 2) {
            return Err(SmoothQuantError::InvalidConfig(
                "dataset.pad_to must be >= 2".to_string(),
            ));
        }
        self.smooth.validate()?;
        self.quant.validate()
    }
}
