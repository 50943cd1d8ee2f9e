//! OPT decoder-only transformer.
//!
//! Implements:
//! - Token and learned position embeddings
//! - Pre-norm decoder layers (attention + ReLU feed-forward)
//! - Tied LM head for next-token prediction
//!
//! The model is an owned structure. Transforms reach its parameters through
//! [`OptModel::blocks_mut`], and calibration observes projection inputs through
//! [`OptModel::forward_observed`].

mod attention;
mod config;
mod decoder;
mod loader;
mod norm;

pub use attention::{create_causal_mask, OptAttention};
pub use config::OptConfig;
pub use decoder::{BlockHandles, DecoderLayer};
pub use loader::{load_pretrained, load_tokenizer, resolve_model_path, TextTokenizer};
pub use norm::{layer_norm, LayerNorm};

use candle_core::{DType, Device, Tensor};
use candle_nn::{embedding, Embedding, Linear, Module, VarBuilder, VarMap};

use crate::error::{Result, SmoothQuantError};
use crate::layer::{LinearObserver, NoopObserver, Projection};
use config::{LAYER_NORM_EPS, POSITION_OFFSET};

/// OPT causal language model.
#[derive(Debug, Clone)]
pub struct OptModel {
    embed_tokens: Embedding,
    embed_positions: Embedding,
    layers: Vec<DecoderLayer>,
    final_layer_norm: LayerNorm,
    lm_head: Linear,
    tied_lm_head: bool,
    config: OptConfig,
    device: Device,
    dtype: DType,
    smoothed: bool,
}

impl OptModel {
    /// Create a new model with random initialization.
    ///
    /// # Errors
    ///
    /// Returns error if the configuration is invalid.
    pub fn new(config: &OptConfig, device: &Device) -> Result<Self> {
        let var_map = VarMap::new();
        let vb = VarBuilder::from_varmap(&var_map, DType::F32, device);
        Self::from_varbuilder(config, vb)
    }

    /// Create model from a VarBuilder rooted at the checkpoint top level
    /// (tensors named `model.decoder.*` and optionally `lm_head.weight`).
    ///
    /// # Errors
    ///
    /// Returns error if the configuration is invalid or tensors are missing.
    pub fn from_varbuilder(config: &OptConfig, vb: VarBuilder) -> Result<Self> {
        config.validate()?;

        let device = vb.device().clone();
        let dtype = vb.dtype();
        let decoder = vb.pp("model").pp("decoder");

        let embed_tokens = embedding(config.vocab_size, config.hidden_size, decoder.pp("embed_tokens"))?;
        let embed_positions = embedding(
            config.max_position_embeddings + POSITION_OFFSET,
            config.hidden_size,
            decoder.pp("embed_positions"),
        )?;

        let layers = (0..config.num_hidden_layers)
            .map(|i| DecoderLayer::new(config, decoder.pp(format!("layers.{i}"))))
            .collect::<Result<Vec<_>>>()?;

        let final_layer_norm = layer_norm(config.hidden_size, LAYER_NORM_EPS, decoder.pp("final_layer_norm"))?;

        let tied_lm_head = !vb.contains_tensor("lm_head.weight");
        let lm_head = if tied_lm_head {
            Linear::new(embed_tokens.embeddings().clone(), None)
        } else {
            Linear::new(vb.get((config.vocab_size, config.hidden_size), "lm_head.weight")?, None)
        };

        tracing::debug!(
            "Built OPT decoder: layers={}, hidden={}, heads={}, ffn={}, dtype={:?}",
            config.num_hidden_layers,
            config.hidden_size,
            config.num_attention_heads,
            config.ffn_dim,
            dtype
        );

        Ok(Self {
            embed_tokens,
            embed_positions,
            layers,
            final_layer_norm,
            lm_head,
            tied_lm_head,
            config: config.clone(),
            device,
            dtype,
            smoothed: false,
        })
    }

    /// Architecture hyperparameters.
    #[must_use]
    pub const fn config(&self) -> &OptConfig {
        &self.config
    }

    /// Device holding the weights.
    #[must_use]
    pub const fn device(&self) -> &Device {
        &self.device
    }

    /// Parameter dtype.
    #[must_use]
    pub const fn dtype(&self) -> DType {
        self.dtype
    }

    /// Output vocabulary size.
    #[must_use]
    pub const fn vocab_size(&self) -> usize {
        self.config.vocab_size
    }

    /// Number of decoder layers.
    #[must_use]
    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    /// Whether smoothing has been applied.
    #[must_use]
    pub const fn is_smoothed(&self) -> bool {
        self.smoothed
    }

    pub(crate) fn mark_smoothed(&mut self) {
        self.smoothed = true;
    }

    /// Whether any projection has been replaced by its W8A8 variant.
    #[must_use]
    pub fn is_quantized(&self) -> bool {
        self.projections().any(Projection::is_quantized)
    }

    /// All projections in forward order.
    pub fn projections(&self) -> impl Iterator<Item = &Projection> {
        self.layers.iter().flat_map(DecoderLayer::projections)
    }

    /// Fully-qualified names of all projections.
    #[must_use]
    pub fn linear_names(&self) -> Vec<String> {
        self.projections().map(|p| p.name().to_string()).collect()
    }

    /// Mutable parameter handles for every decoder block.
    pub fn blocks_mut(&mut self) -> Vec<BlockHandles<'_>> {
        self.layers
            .iter_mut()
            .enumerate()
            .map(|(i, layer)| layer.handles(i))
            .collect()
    }

    /// Total parameter count (a tied LM head is counted once).
    #[must_use]
    pub fn num_parameters(&self) -> usize {
        let embeddings = self.embed_tokens.embeddings().elem_count()
            + self.embed_positions.embeddings().elem_count();
        let layers: usize = self.layers.iter().map(DecoderLayer::num_parameters).sum();
        let final_norm = 2 * self.final_layer_norm.normalized_shape();
        let head = if self.tied_lm_head {
            0
        } else {
            self.lm_head.weight().elem_count()
        };
        embeddings + layers + final_norm + head
    }

    /// Parameter storage in bytes at the model dtype.
    #[must_use]
    pub fn size_bytes(&self) -> usize {
        self.num_parameters() * self.dtype.size_in_bytes()
    }

    /// Forward pass returning logits (batch, seq_len, vocab_size).
    ///
    /// # Errors
    ///
    /// Returns error if the sequence is too long or a tensor op fails.
    pub fn forward(&self, input_ids: &Tensor) -> Result<Tensor> {
        self.forward_observed(input_ids, &mut NoopObserver)
    }

    /// Forward pass that reports every projection input to `observer`.
    ///
    /// # Errors
    ///
    /// Returns error if the sequence is too long, the observer fails, or a
    /// tensor op fails.
    pub fn forward_observed(&self, input_ids: &Tensor, observer: &mut dyn LinearObserver) -> Result<Tensor> {
        let (_, seq_len) = input_ids.dims2()?;
        if seq_len == 0 || seq_len > self.config.max_position_embeddings {
            return Err(SmoothQuantError::Model(format!(
                "sequence length {seq_len} outside 1..={}",
                self.config.max_position_embeddings
            )));
        }

        let tokens = self.embed_tokens.forward(input_ids)?;
        let positions = Tensor::arange(
            POSITION_OFFSET as u32,
            (seq_len + POSITION_OFFSET) as u32,
            &self.device,
        )?;
        let positions = self.embed_positions.forward(&positions)?;
        let mut hidden = tokens.broadcast_add(&positions)?;

        let mask = create_causal_mask(seq_len, &self.device)?;
        for layer in &self.layers {
            hidden = layer.forward(&hidden, &mask, observer)?;
        }

        let hidden = self.final_layer_norm.forward(&hidden)?;
        Ok(self.lm_head.forward(&hidden)?)
    }
}
