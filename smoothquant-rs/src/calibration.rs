//! Activation scale calibration.
//!
//! A calibration sweep runs sequences through the unmodified model and records,
//! for every projection, the maximum absolute value seen on each input channel.
//! The reduction is a running element-wise maximum, so the result does not
//! depend on the order of the sequences, and partial results from independent
//! sweeps can be combined with [`ActScales::merge`].

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Tensor, D};

use crate::error::{Result, SmoothQuantError};
use crate::layer::LinearObserver;
use crate::model::OptModel;
use crate::progress::sweep_bar;

/// Per-input-channel max |activation| for each projection, keyed by layer name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ActScales {
    scales: BTreeMap<String, Vec<f32>>,
}

impl ActScales {
    /// Empty record.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Default file for a model, keyed by the last path component of its name
    /// (`facebook/opt-125m` -> `act_scales/opt-125m.safetensors`).
    #[must_use]
    pub fn default_path(model_name: &str) -> PathBuf {
        let base = model_name
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or(model_name);
        PathBuf::from("act_scales").join(format!("{base}.safetensors"))
    }

    /// Scale vector of a layer.
    #[must_use]
    pub fn get(&self, layer: &str) -> Option<&[f32]> {
        self.scales.get(layer).map(Vec::as_slice)
    }

    /// Scale vector of a layer, or `MissingActScale`.
    ///
    /// # Errors
    ///
    /// Returns error if no scale was recorded for `layer`.
    pub fn require(&self, layer: &str) -> Result<&[f32]> {
        self.get(layer)
            .ok_or_else(|| SmoothQuantError::MissingActScale(layer.to_string()))
    }

    /// Replace the scale vector of a layer.
    pub fn insert(&mut self, layer: impl Into<String>, scale: Vec<f32>) {
        self.scales.insert(layer.into(), scale);
    }

    /// Number of layers recorded.
    #[must_use]
    pub fn len(&self) -> usize {
        self.scales.len()
    }

    /// Whether no layer was recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.scales.is_empty()
    }

    /// Fold another record into this one by element-wise maximum.
    ///
    /// # Errors
    ///
    /// Returns error if a layer appears in both with different channel counts.
    pub fn merge(&mut self, other: &Self) -> Result<()> {
        for (layer, theirs) in &other.scales {
            match self.scales.get_mut(layer) {
                Some(ours) => {
                    if ours.len() != theirs.len() {
                        return Err(SmoothQuantError::DimensionMismatch {
                            layer: layer.clone(),
                            expected: ours.len(),
                            actual: theirs.len(),
                        });
                    }
                    for (a, &b) in ours.iter_mut().zip(theirs) {
                        *a = a.max(b);
                    }
                }
                None => {
                    self.scales.insert(layer.clone(), theirs.clone());
                }
            }
        }
        Ok(())
    }

    /// Write one 1-D F32 tensor per layer to a safetensors file.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be written.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let tensors = self
            .scales
            .iter()
            .map(|(layer, scale)| Ok((layer.clone(), Tensor::new(scale.as_slice(), &Device::Cpu)?)))
            .collect::<Result<HashMap<_, _>>>()?;
        candle_core::safetensors::save(&tensors, path)?;
        tracing::info!("Saved activation scales for {} layers to {}", self.len(), path.display());
        Ok(())
    }

    /// Read a record written by [`ActScales::save`].
    ///
    /// # Errors
    ///
    /// Returns error if the file is missing or holds a tensor that is not 1-D.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let mut scales = BTreeMap::new();
        for (layer, tensor) in candle_core::safetensors::load(path, &Device::Cpu)? {
            if tensor.rank() != 1 {
                return Err(SmoothQuantError::ShapeMismatch {
                    expected: vec![tensor.elem_count()],
                    actual: tensor.dims().to_vec(),
                });
            }
            scales.insert(layer, tensor.to_dtype(DType::F32)?.to_vec1::<f32>()?);
        }
        tracing::debug!("Loaded activation scales for {} layers from {}", scales.len(), path.display());
        Ok(Self { scales })
    }
}

/// Observer that folds every projection input into a running per-channel max.
///
/// Maxima stay on the model device until [`ActScaleCollector::finish`].
#[derive(Debug, Default)]
pub struct ActScaleCollector {
    running: BTreeMap<String, Tensor>,
}

impl ActScaleCollector {
    /// Empty collector.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy the collected maxima to the host.
    ///
    /// # Errors
    ///
    /// Returns error if a device transfer fails.
    pub fn finish(self) -> Result<ActScales> {
        let mut scales = ActScales::new();
        for (layer, running) in self.running {
            scales.insert(layer, running.to_vec1::<f32>()?);
        }
        Ok(scales)
    }
}

impl LinearObserver for ActScaleCollector {
    fn observe(&mut self, layer: &str, input: &Tensor) -> Result<()> {
        let channels = input.dim(D::Minus1)?;
        let batch_max = input
            .reshape(((), channels))?
            .abs()?
            .to_dtype(DType::F32)?
            .max(0)?;

        let updated = match self.running.get(layer) {
            Some(running) => running.maximum(&batch_max)?,
            None => batch_max,
        };
        self.running.insert(layer.to_string(), updated);
        Ok(())
    }
}

/// Run every sequence through the model and collect activation scales.
///
/// Sequences are fed one at a time, truncated to the model's context length.
///
/// # Errors
///
/// Returns error if the model is already smoothed or quantized, or a forward
/// pass fails.
pub fn collect_act_scales(model: &OptModel, sequences: &[Vec<u32>]) -> Result<ActScales> {
    if model.is_smoothed() {
        return Err(SmoothQuantError::AlreadySmoothed);
    }
    if let Some(p) = model.projections().find(|p| p.is_quantized()) {
        return Err(SmoothQuantError::AlreadyQuantized(p.name().to_string()));
    }

    let max_len = model.config().max_position_embeddings;
    let mut collector = ActScaleCollector::new();
    let pb = sweep_bar(sequences.len(), "calibrate")?;

    for sequence in sequences {
        let len = sequence.len().min(max_len);
        if len == 0 {
            pb.inc(1);
            continue;
        }
        let input_ids = Tensor::new(&sequence[..len], model.device())?.unsqueeze(0)?;
        model.forward_observed(&input_ids, &mut collector)?;
        pb.inc(1);
    }
    pb.finish_with_message("done");

    let scales = collector.finish()?;
    tracing::info!(
        "Collected activation scales for {} layers from {} sequences",
        scales.len(),
        sequences.len()
    );
    Ok(scales)
}
