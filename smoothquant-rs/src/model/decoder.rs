//! OPT decoder layer: pre-norm attention and a ReLU feed-forward block,
//! each wrapped in a residual connection.

use candle_core::Tensor;
use candle_nn::{Module, VarBuilder};

use super::attention::{projection, OptAttention};
use super::config::{OptConfig, LAYER_NORM_EPS};
use super::norm::{layer_norm, LayerNorm};
use crate::error::Result;
use crate::layer::{LinearObserver, Projection};

/// Mutable handles to the parameters of one decoder block.
///
/// This is the only way the smoother and quantizer reach into the model.
pub struct BlockHandles<'a> {
    /// Block index.
    pub index: usize,
    /// Norm feeding Q/K/V.
    pub attn_norm: &'a mut LayerNorm,
    /// Query projection.
    pub q_proj: &'a mut Projection,
    /// Key projection.
    pub k_proj: &'a mut Projection,
    /// Value projection.
    pub v_proj: &'a mut Projection,
    /// Attention output projection.
    pub out_proj: &'a mut Projection,
    /// Norm feeding `fc1`.
    pub ffn_norm: &'a mut LayerNorm,
    /// First feed-forward projection.
    pub fc1: &'a mut Projection,
    /// Second feed-forward projection.
    pub fc2: &'a mut Projection,
}

impl BlockHandles<'_> {
    /// All six projections of the block in forward order.
    pub fn projections(&self) -> [&Projection; 6] {
        [
            &*self.q_proj,
            &*self.k_proj,
            &*self.v_proj,
            &*self.out_proj,
            &*self.fc1,
            &*self.fc2,
        ]
    }
}

/// Single decoder layer
#[derive(Debug, Clone)]
pub struct DecoderLayer {
    self_attn: OptAttention,
    self_attn_layer_norm: LayerNorm,
    fc1: Projection,
    fc2: Projection,
    final_layer_norm: LayerNorm,
}

impl DecoderLayer {
    /// Create decoder layer
    pub fn new(config: &OptConfig, vb: VarBuilder) -> Result<Self> {
        let hidden = config.hidden_size;

        Ok(Self {
            self_attn: OptAttention::new(config, vb.pp("self_attn"))?,
            self_attn_layer_norm: layer_norm(hidden, LAYER_NORM_EPS, vb.pp("self_attn_layer_norm"))?,
            fc1: projection(hidden, config.ffn_dim, vb.pp("fc1"))?,
            fc2: projection(config.ffn_dim, hidden, vb.pp("fc2"))?,
            final_layer_norm: layer_norm(hidden, LAYER_NORM_EPS, vb.pp("final_layer_norm"))?,
        })
    }

    /// Borrow every parameter group mutably.
    pub fn handles(&mut self, index: usize) -> BlockHandles<'_> {
        BlockHandles {
            index,
            attn_norm: &mut self.self_attn_layer_norm,
            q_proj: &mut self.self_attn.q_proj,
            k_proj: &mut self.self_attn.k_proj,
            v_proj: &mut self.self_attn.v_proj,
            out_proj: &mut self.self_attn.out_proj,
            ffn_norm: &mut self.final_layer_norm,
            fc1: &mut self.fc1,
            fc2: &mut self.fc2,
        }
    }

    /// Projections in forward order.
    pub fn projections(&self) -> [&Projection; 6] {
        [
            &self.self_attn.q_proj,
            &self.self_attn.k_proj,
            &self.self_attn.v_proj,
            &self.self_attn.out_proj,
            &self.fc1,
            &self.fc2,
        ]
    }

    /// Parameter count of the layer.
    pub fn num_parameters(&self) -> usize {
        let norms = 2 * (self.self_attn_layer_norm.normalized_shape() + self.final_layer_norm.normalized_shape());
        norms + self.projections().iter().map(|p| p.num_parameters()).sum::<usize>()
    }

    /// Forward pass
    /// Input: (batch, seq_len, hidden_size)
    /// Output: (batch, seq_len, hidden_size)
    pub fn forward(&self, x: &Tensor, mask: &Tensor, observer: &mut dyn LinearObserver) -> Result<Tensor> {
        let normed = self.self_attn_layer_norm.forward(x)?;
        let attn_out = self.self_attn.forward(&normed, mask, observer)?;
        let x = (x + attn_out)?;

        let normed = self.final_layer_norm.forward(&x)?;
        let hidden = self.fc1.forward_observed(&normed, observer)?.relu()?;
        let mlp_out = self.fc2.forward_observed(&hidden, observer)?;
        Ok((x + mlp_out)?)
    }
}
