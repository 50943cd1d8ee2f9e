//! CLI entry point for smoothquant-rs.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use smoothquant_rs::dataset::TokenizedDataset;
use smoothquant_rs::pipeline::{generate_act_scales, prepare_variant, CalibrationSettings};
use smoothquant_rs::{
    load_pretrained, run_pipeline, ActScales, DatasetSettings, DeviceKind, Evaluator,
    PipelineConfig, Precision, QuantConfig, Result, SmoothConfig, Variant,
};

#[derive(Parser)]
#[command(name = "smoothquant")]
#[command(about = "SmoothQuant W8A8 calibration, smoothing and evaluation for OPT models")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum DtypeArg {
    F32,
    F16,
    Bf16,
}

impl From<DtypeArg> for Precision {
    fn from(arg: DtypeArg) -> Self {
        match arg {
            DtypeArg::F32 => Self::F32,
            DtypeArg::F16 => Self::F16,
            DtypeArg::Bf16 => Self::Bf16,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum DeviceArg {
    Cpu,
    Cuda,
}

impl From<DeviceArg> for DeviceKind {
    fn from(arg: DeviceArg) -> Self {
        match arg {
            DeviceArg::Cpu => Self::Cpu,
            DeviceArg::Cuda => Self::Cuda,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum ModeArg {
    /// Unmodified model at the load precision
    Baseline,
    /// W8A8 without smoothing
    Naive,
    /// Smoothing followed by W8A8
    Smooth,
}

impl From<ModeArg> for Variant {
    fn from(arg: ModeArg) -> Self {
        match arg {
            ModeArg::Baseline => Self::Baseline,
            ModeArg::Naive => Self::Naive,
            ModeArg::Smooth => Self::Smooth,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Collect per-channel activation scales on a calibration set
    GenerateActScales {
        /// Model directory or Hugging Face model id
        #[arg(long)]
        model_name: String,
        /// Output file (default: act_scales/<model>.safetensors)
        #[arg(long)]
        output_path: Option<PathBuf>,
        /// JSONL calibration texts
        #[arg(long)]
        dataset_path: String,
        /// Number of calibration samples
        #[arg(long, default_value_t = 512)]
        num_samples: usize,
        /// Tokens per sample
        #[arg(long, default_value_t = 512)]
        seq_len: usize,
        /// Calibration sampling seed
        #[arg(long, default_value_t = 42)]
        seed: u64,
        /// Model precision
        #[arg(long, value_enum, default_value_t = DtypeArg::F32)]
        dtype: DtypeArg,
        /// Device
        #[arg(long, value_enum, default_value_t = DeviceArg::Cpu)]
        device: DeviceArg,
    },
    /// Evaluate last-token accuracy of one variant
    Evaluate {
        /// Model directory or Hugging Face model id
        #[arg(long)]
        model_name: String,
        /// JSONL evaluation texts
        #[arg(long)]
        dataset_path: String,
        /// Number of evaluation samples
        #[arg(long, default_value_t = 1000)]
        num_samples: usize,
        /// Variant to evaluate
        #[arg(long, value_enum, default_value_t = ModeArg::Smooth)]
        mode: ModeArg,
        /// Activation scales (default: act_scales/<model>.safetensors)
        #[arg(long)]
        act_scales: Option<PathBuf>,
        /// Migration strength
        #[arg(long, default_value_t = 0.5)]
        alpha: f32,
        /// Right-pad sequences to this length
        #[arg(long)]
        pad_to: Option<usize>,
        /// Model precision
        #[arg(long, value_enum, default_value_t = DtypeArg::F32)]
        dtype: DtypeArg,
        /// Device
        #[arg(long, value_enum, default_value_t = DeviceArg::Cpu)]
        device: DeviceArg,
    },
    /// Run baseline, naive W8A8 and SmoothQuant W8A8 from a configuration file
    Run {
        /// Path to configuration file
        config: String,
    },
    /// Generate a sample configuration file
    Init {
        /// Output path for config file
        #[arg(default_value = "smoothquant.yaml")]
        output: String,
        /// Model preset (opt-125m, opt-1.3b, opt-6.7b, opt-13b)
        #[arg(long, default_value = "opt-125m")]
        preset: String,
    },
    /// Validate a configuration file
    Validate {
        /// Path to configuration file
        config: String,
    },
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::GenerateActScales {
            model_name,
            output_path,
            dataset_path,
            num_samples,
            seq_len,
            seed,
            dtype,
            device,
        } => {
            let output = output_path.unwrap_or_else(|| ActScales::default_path(&model_name));
            let device = DeviceKind::from(device).device()?;
            let (model, tokenizer) = load_pretrained(&model_name, Precision::from(dtype).dtype(), &device)?;

            let settings = CalibrationSettings {
                num_samples,
                seq_len,
                seed,
                ..CalibrationSettings::new(dataset_path)
            };
            let scales = generate_act_scales(&model, &tokenizer, &settings)?;
            scales.save(&output)?;
            println!("✓ Activation scales for {} layers written to: {}", scales.len(), output.display());
        }
        Commands::Evaluate {
            model_name,
            dataset_path,
            num_samples,
            mode,
            act_scales,
            alpha,
            pad_to,
            dtype,
            device,
        } => {
            let smooth = SmoothConfig::with_alpha(alpha);
            smooth.validate()?;
            let variant = Variant::from(mode);
            let scales = match variant {
                Variant::Smooth => {
                    let path = act_scales.unwrap_or_else(|| ActScales::default_path(&model_name));
                    Some(ActScales::load(&path)?)
                }
                Variant::Baseline | Variant::Naive => None,
            };

            let device = DeviceKind::from(device).device()?;
            let (model, tokenizer) = load_pretrained(&model_name, Precision::from(dtype).dtype(), &device)?;
            let settings = DatasetSettings {
                path: dataset_path,
                num_samples,
                pad_to,
            };
            let max_len = model.config().max_position_embeddings;
            let pad_token_id = model.config().pad_token_id;
            let dataset = TokenizedDataset::load(&settings, &tokenizer, Some(max_len))?;
            let evaluator = match pad_to {
                Some(len) => Evaluator::new(dataset).with_padding(len.min(max_len), pad_token_id),
                None => Evaluator::new(dataset),
            };

            let model = prepare_variant(model, variant, scales.as_ref(), &smooth, &QuantConfig::default())?;
            let result = evaluator.evaluate(&model)?;
            println!("{variant}: {result}");
        }
        Commands::Run { config } => {
            tracing::info!("Running pipeline with config: {}", config);
            let config = PipelineConfig::from_file(&config)?;
            let report = run_pipeline(&config)?;
            println!("{report}");
        }
        Commands::Init { output, preset } => {
            tracing::info!("Generating config for preset: {}", preset);
            let config = PipelineConfig::from_preset(&preset)?;
            config.to_file(&output)?;
            println!("✓ Configuration written to: {output}");
        }
        Commands::Validate { config } => {
            tracing::info!("Validating configuration: {}", config);
            let config = PipelineConfig::from_file(&config)?;
            config.validate()?;
            println!("✓ Configuration is valid");
            println!("  Model: {}", config.model);
            println!("  Dataset: {}", config.dataset.path);
            println!("  Alpha: {}", config.smooth.alpha);
        }
    }

    Ok(())
}
