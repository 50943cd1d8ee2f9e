//! SmoothQuant W8A8 post-training quantization for OPT-style transformers.
//!
//! Naive per-tensor INT8 quantization of both weights and activations
//! collapses the accuracy of large language models: a handful of activation
//! channels carry outliers two orders of magnitude above the rest, and a
//! single per-tensor scale wastes almost the whole grid on them. SmoothQuant
//! migrates that difficulty into the weights with an exactly compensating
//! per-channel rescale before quantizing.
//!
//! # Features
//!
//! - OPT decoder built on candle, loadable from a local directory or the
//!   Hugging Face cache
//! - Activation scale calibration with a running per-channel max
//! - Smoothing of norm -> Q/K/V, norm -> fc1 and optionally v_proj -> out_proj
//! - `W8A8Linear` fake quantization (per-tensor, per-channel, per-token)
//! - Last-token prediction accuracy evaluation
//!
//! # Quick Start
//!
//! ```ignore
//! use smoothquant_rs::prelude::*;
//! use candle_core::{DType, Device};
//!
//! let device = Device::Cpu;
//! let (mut model, tokenizer) = load_pretrained("facebook/opt-125m", DType::F32, &device)?;
//!
//! let scales = ActScales::load("act_scales/opt-125m.safetensors")?;
//! smooth_model(&mut model, &scales, &SmoothConfig::with_alpha(0.5))?;
//! quantize_model(&mut model, &QuantConfig::default())?;
//! ```
//!
//! # Smoothing
//!
//! For a producer feeding consumer projections with input channel `c`:
//! ```text
//! s[c] = act[c]^alpha / w[c]^(1 - alpha)
//! producer output[c] /= s[c]
//! consumer W[:, c]  *= s[c]
//! ```
//!
//! # Fake Quantization
//!
//! ```text
//! scale = max(|T|) / 127
//! T_fq  = clamp(round(T / scale), -128, 127) * scale
//! ```
//!
//! # Feature Flags
//!
//! - `default`: CPU-only
//! - `cuda`: Enable CUDA through candle
//!
//! # References
//!
//! - "SmoothQuant: Accurate and Efficient Post-Training Quantization for
//!   Large Language Models" <https://arxiv.org/abs/2211.10438>

#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_lossless)]
#![allow(clippy::doc_markdown)] // Many technical terms don't need backticks

pub mod calibration;
mod config;
pub mod dataset;
mod error;
pub mod eval;
pub mod layer;
pub mod model;
pub mod pipeline;
mod progress;
pub mod quantization;
pub mod quantizer;
pub mod smooth;

pub use calibration::{collect_act_scales, ActScaleCollector, ActScales};
pub use config::{
    ActQuant, DatasetSettings, DeviceKind, PipelineConfig, Precision, QuantConfig, SmoothConfig,
    WeightQuant,
};
pub use error::{Result, SmoothQuantError};
pub use eval::{EvalResult, Evaluator};
pub use layer::{LinearObserver, Projection, W8A8Linear};
pub use model::{load_pretrained, OptConfig, OptModel};
pub use pipeline::{run_pipeline, PipelineReport, Variant};
pub use quantizer::quantize_model;
pub use smooth::smooth_model;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::calibration::{collect_act_scales, ActScales};
    pub use crate::config::{QuantConfig, SmoothConfig};
    pub use crate::error::{Result, SmoothQuantError};
    pub use crate::eval::Evaluator;
    pub use crate::model::{load_pretrained, OptModel};
    pub use crate::quantizer::quantize_model;
    pub use crate::smooth::smooth_model;
}
