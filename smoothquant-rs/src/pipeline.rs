//! End-to-end runs: calibration, and the baseline / naive W8A8 / SmoothQuant
//! W8A8 comparison.

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::calibration::{collect_act_scales, ActScales};
use crate::config::{PipelineConfig, QuantConfig, SmoothConfig};
use crate::dataset::{load_texts, sample_texts, TokenizedDataset};
use crate::error::{Result, SmoothQuantError};
use crate::eval::{EvalResult, Evaluator};
use crate::model::{load_pretrained, OptModel, TextTokenizer};
use crate::quantizer::quantize_model;
use crate::smooth::smooth_model;

/// Which transform is applied before evaluation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Variant {
    /// Unmodified model.
    #[default]
    Baseline,
    /// W8A8 without smoothing.
    Naive,
    /// Smoothing followed by W8A8.
    Smooth,
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Baseline => write!(f, "baseline"),
            Self::Naive => write!(f, "naive W8A8"),
            Self::Smooth => write!(f, "SmoothQuant W8A8"),
        }
    }
}

/// Apply `variant` to a model. `scales` is only read for [`Variant::Smooth`].
///
/// # Errors
///
/// Returns error if scales are required but absent, or a transform fails.
pub fn prepare_variant(
    mut model: OptModel,
    variant: Variant,
    scales: Option<&ActScales>,
    smooth: &SmoothConfig,
    quant: &QuantConfig,
) -> Result<OptModel> {
    match variant {
        Variant::Baseline => {}
        Variant::Naive => {
            quantize_model(&mut model, quant)?;
        }
        Variant::Smooth => {
            let scales = scales.ok_or_else(|| {
                SmoothQuantError::InvalidConfig("smoothing requires activation scales".to_string())
            })?;
            smooth_model(&mut model, scales, smooth)?;
            quantize_model(&mut model, quant)?;
        }
    }
    Ok(model)
}

/// Parameters of an activation-scale calibration run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalibrationSettings {
    /// JSONL file with a `text` field per line.
    pub dataset_path: String,
    /// Number of sampled texts.
    pub num_samples: usize,
    /// Tokens kept per text.
    pub seq_len: usize,
    /// Sampling seed.
    pub seed: u64,
}

impl CalibrationSettings {
    /// Settings with 512 samples of 512 tokens and seed 42.
    #[must_use]
    pub fn new(dataset_path: impl Into<String>) -> Self {
        Self {
            dataset_path: dataset_path.into(),
            num_samples: 512,
            seq_len: 512,
            seed: 42,
        }
    }
}

/// Sample calibration texts and collect activation scales on `model`.
///
/// # Errors
///
/// Returns error if the dataset cannot be read or tokenized, or collection fails.
pub fn generate_act_scales(
    model: &OptModel,
    tokenizer: &TextTokenizer,
    settings: &CalibrationSettings,
) -> Result<ActScales> {
    if settings.num_samples == 0 || settings.seq_len == 0 {
        return Err(SmoothQuantError::InvalidConfig(
            "num_samples and seq_len must be > 0".to_string(),
        ));
    }
    let texts = sample_texts(load_texts(&settings.dataset_path)?, settings.num_samples, settings.seed);
    let seq_len = settings.seq_len.min(model.config().max_position_embeddings);
    let sequences = texts
        .iter()
        .map(|text| {
            let mut ids = tokenizer.encode(text)?;
            ids.truncate(seq_len);
            Ok(ids)
        })
        .collect::<Result<Vec<_>>>()?;
    tracing::info!("Calibrating on {} texts (seq_len={})", sequences.len(), seq_len);
    collect_act_scales(model, &sequences)
}

/// Accuracies of the three variants on one model.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineReport {
    /// Model evaluated.
    pub model: String,
    /// Parameter count.
    pub num_parameters: usize,
    /// Parameter storage at the load dtype.
    pub size_bytes: usize,
    /// Migration strength used for smoothing.
    pub alpha: f32,
    /// Unmodified model.
    pub baseline: EvalResult,
    /// W8A8 without smoothing.
    pub naive: EvalResult,
    /// Smoothing followed by W8A8.
    pub smoothed: EvalResult,
}

impl fmt::Display for PipelineReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        #[allow(clippy::cast_precision_loss)]
        let mib = self.size_bytes as f64 / (1024.0 * 1024.0);
        writeln!(f, "Model: {} ({} parameters, {:.2} MiB)", self.model, self.num_parameters, mib)?;
        writeln!(f, "  {:<18} {}", format!("{}:", Variant::Baseline), self.baseline)?;
        writeln!(f, "  {:<18} {}", format!("{}:", Variant::Naive), self.naive)?;
        write!(
            f,
            "  {:<18} {} (alpha={})",
            format!("{}:", Variant::Smooth),
            self.smoothed,
            self.alpha
        )
    }
}

/// Run the three variants on an already loaded model.
///
/// # Errors
///
/// Returns error if a transform or an evaluation fails.
pub fn compare_variants(
    model: OptModel,
    model_name: &str,
    evaluator: &Evaluator,
    scales: &ActScales,
    smooth: &SmoothConfig,
    quant: &QuantConfig,
) -> Result<PipelineReport> {
    let num_parameters = model.num_parameters();
    let size_bytes = model.size_bytes();

    tracing::info!("Evaluating {}", Variant::Baseline);
    let baseline = evaluator.evaluate(&model)?;

    tracing::info!("Evaluating {}", Variant::Naive);
    let naive_model = prepare_variant(model.clone(), Variant::Naive, None, smooth, quant)?;
    let naive = evaluator.evaluate(&naive_model)?;
    drop(naive_model);

    tracing::info!("Evaluating {}", Variant::Smooth);
    let smoothed_model = prepare_variant(model, Variant::Smooth, Some(scales), smooth, quant)?;
    let smoothed = evaluator.evaluate(&smoothed_model)?;

    Ok(PipelineReport {
        model: model_name.to_string(),
        num_parameters,
        size_bytes,
        alpha: smooth.alpha,
        baseline,
        naive,
        smoothed,
    })
}

/// Build the evaluator described by a pipeline configuration.
///
/// # Errors
///
/// Returns error if the dataset cannot be loaded.
pub fn build_evaluator(config: &PipelineConfig, model: &OptModel, tokenizer: &TextTokenizer) -> Result<Evaluator> {
    let max_len = model.config().max_position_embeddings;
    let dataset = TokenizedDataset::load(&config.dataset, tokenizer, Some(max_len))?;
    let evaluator = Evaluator::new(dataset);
    Ok(match config.dataset.pad_to {
        Some(pad_to) => evaluator.with_padding(pad_to.min(max_len), model.config().pad_token_id),
        None => evaluator,
    })
}

/// Load the model and scales named by `config` and compare the variants.
///
/// # Errors
///
/// Returns error if the configuration is invalid, the scales file is missing,
/// or any step fails.
pub fn run_pipeline(config: &PipelineConfig) -> Result<PipelineReport> {
    config.validate()?;
    if !Path::new(&config.act_scales).exists() {
        return Err(SmoothQuantError::InvalidConfig(format!(
            "activation scales not found at {}; run `smoothquant generate-act-scales` first",
            config.act_scales
        )));
    }

    let device = config.device.device()?;
    let (model, tokenizer) = load_pretrained(&config.model, config.dtype.dtype(), &device)?;
    let scales = ActScales::load(&config.act_scales)?;
    let evaluator = build_evaluator(config, &model, &tokenizer)?;

    let report = compare_variants(model, &config.model, &evaluator, &scales, &config.smooth, &config.quant)?;
    tracing::info!("Pipeline finished for {}", config.model);
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::OptConfig;
    use candle_core::Device;

    fn tiny_model() -> OptModel {
        OptModel::new(&OptConfig::tiny(), &Device::Cpu).unwrap()
    }

    #[test]
    fn test_prepare_baseline_is_identity() {
        let model = prepare_variant(
            tiny_model(),
            Variant::Baseline,
            None,
            &SmoothConfig::default(),
            &QuantConfig::default(),
        )
        .unwrap();
        assert!(!model.is_quantized());
        assert!(!model.is_smoothed());
    }

    #[test]
    fn test_prepare_smooth_requires_scales() {
        let err = prepare_variant(
            tiny_model(),
            Variant::Smooth,
            None,
            &SmoothConfig::default(),
            &QuantConfig::default(),
        )
        .unwrap_err();
        assert!(matches!(err, SmoothQuantError::InvalidConfig(_)));
    }

    #[test]
    fn test_compare_variants() {
        let model = tiny_model();
        let sequences = vec![vec![2u32, 3, 4, 5], vec![2, 9, 8], vec![2, 40, 41, 42, 43]];
        let scales = collect_act_scales(&model, &sequences).unwrap();
        let evaluator = Evaluator::new(TokenizedDataset::from_sequences(sequences));

        let report = compare_variants(
            model,
            "opt-tiny",
            &evaluator,
            &scales,
            &SmoothConfig::default(),
            &QuantConfig::default(),
        )
        .unwrap();

        assert_eq!(report.baseline.total, 3);
        assert_eq!(report.naive.total, 3);
        assert_eq!(report.smoothed.total, 3);
        assert!(report.size_bytes > 0);
        let text = report.to_string();
        assert!(text.contains("naive W8A8:"));
        assert!(text.contains("alpha=0.5"));
    }

    #[test]
    fn test_run_pipeline_missing_scales() {
        let mut config = PipelineConfig::from_preset("opt-125m").unwrap();
        config.act_scales = "/nonexistent/scales.safetensors".to_string();
        let err = run_pipeline(&config).unwrap_err();
        assert!(err.to_string().contains("generate-act-scales"));
    }

    #[test]
    fn test_variant_serde_names() {
        let v: Variant = serde_yaml::from_str("smooth").unwrap();
        assert_eq!(v, Variant::Smooth);
        assert_eq!(serde_yaml::to_string(&Variant::Naive).unwrap().trim(), "naive");
    }
}
