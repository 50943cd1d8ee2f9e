//! OPT multi-head self-attention.

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;

use super::config::OptConfig;
use crate::error::Result;
use crate::layer::{LinearObserver, Projection};

/// Load or initialize a biased projection under `vb`.
pub(crate) fn projection(in_features: usize, out_features: usize, vb: VarBuilder) -> Result<Projection> {
    let weight = vb.get_with_hints(
        (out_features, in_features),
        "weight",
        candle_nn::init::DEFAULT_KAIMING_NORMAL,
    )?;
    let bound = 1.0 / (in_features as f64).sqrt();
    let bias = vb.get_with_hints(
        out_features,
        "bias",
        candle_nn::Init::Uniform {
            lo: -bound,
            up: bound,
        },
    )?;
    Projection::new(vb.prefix(), weight, Some(bias))
}

/// Causal self-attention with separate Q/K/V projections.
#[derive(Debug, Clone)]
pub struct OptAttention {
    pub(crate) q_proj: Projection,
    pub(crate) k_proj: Projection,
    pub(crate) v_proj: Projection,
    pub(crate) out_proj: Projection,
    num_heads: usize,
    head_dim: usize,
    scaling: f64,
}

impl OptAttention {
    /// Create attention module
    pub fn new(config: &OptConfig, vb: VarBuilder) -> Result<Self> {
        let hidden = config.hidden_size;
        let head_dim = config.head_dim();

        Ok(Self {
            q_proj: projection(hidden, hidden, vb.pp("q_proj"))?,
            k_proj: projection(hidden, hidden, vb.pp("k_proj"))?,
            v_proj: projection(hidden, hidden, vb.pp("v_proj"))?,
            out_proj: projection(hidden, hidden, vb.pp("out_proj"))?,
            num_heads: config.num_attention_heads,
            head_dim,
            scaling: (head_dim as f64).powf(-0.5),
        })
    }

    /// Forward pass
    /// Input: (batch, seq_len, hidden_size)
    /// Output: (batch, seq_len, hidden_size)
    pub fn forward(&self, x: &Tensor, mask: &Tensor, observer: &mut dyn LinearObserver) -> Result<Tensor> {
        let (batch, seq_len, hidden) = x.dims3()?;

        let q = (self.q_proj.forward_observed(x, observer)? * self.scaling)?;
        let k = self.k_proj.forward_observed(x, observer)?;
        let v = self.v_proj.forward_observed(x, observer)?;

        // (batch, num_heads, seq, head_dim)
        let shape = (batch, seq_len, self.num_heads, self.head_dim);
        let q = q.reshape(shape)?.transpose(1, 2)?.contiguous()?;
        let k = k.reshape(shape)?.transpose(1, 2)?.contiguous()?;
        let v = v.reshape(shape)?.transpose(1, 2)?.contiguous()?;

        let scores = q.matmul(&k.t()?.contiguous()?)?;
        let scores = scores.to_dtype(DType::F32)?.broadcast_add(mask)?;
        let probs = candle_nn::ops::softmax_last_dim(&scores)?.to_dtype(v.dtype())?;

        let out = probs.matmul(&v)?;
        let out = out.transpose(1, 2)?.reshape((batch, seq_len, hidden))?;

        self.out_proj.forward_observed(&out, observer)
    }
}

/// Create causal attention mask of shape (1, 1, seq_len, seq_len).
pub fn create_causal_mask(seq_len: usize, device: &Device) -> Result<Tensor> {
    let mask: Vec<f32> = (0..seq_len)
        .flat_map(|i| (0..seq_len).map(move |j| if j <= i { 0.0 } else { f32::NEG_INFINITY }))
        .collect();
    Ok(Tensor::from_vec(mask, (1, 1, seq_len, seq_len), device)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer::NoopObserver;
    use candle_nn::VarMap;

    #[test]
    fn test_causal_mask() {
        let device = Device::Cpu;
        let mask = create_causal_mask(4, &device).unwrap();
        let mask_vec: Vec<f32> = mask.flatten_all().unwrap().to_vec1().unwrap();

        assert_eq!(mask_vec[0], 0.0); // (0,0)
        assert!(mask_vec[1].is_infinite()); // (0,1)
        assert_eq!(mask_vec[5], 0.0); // (1,1)
        assert_eq!(mask_vec[12], 0.0); // (3,0)
    }

    #[test]
    fn test_attention_shape_and_names() {
        let config = OptConfig::tiny();
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

        let attn = OptAttention::new(&config, vb.pp("self_attn")).unwrap();
        assert_eq!(attn.q_proj.name(), "self_attn.q_proj");
        assert_eq!(attn.out_proj.name(), "self_attn.out_proj");

        let x = Tensor::randn(0.0f32, 1.0, (2, 8, config.hidden_size), &device).unwrap();
        let mask = create_causal_mask(8, &device).unwrap();
        let out = attn.forward(&x, &mask, &mut NoopObserver).unwrap();

        assert_eq!(out.dims(), &[2, 8, config.hidden_size]);
    }

    #[test]
    fn test_attention_is_causal() {
        let config = OptConfig::tiny();
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let attn = OptAttention::new(&config, vb).unwrap();

        let x = Tensor::randn(0.0f32, 1.0, (1, 6, config.hidden_size), &device).unwrap();
        let full = attn
            .forward(&x, &create_causal_mask(6, &device).unwrap(), &mut NoopObserver)
            .unwrap();
        let prefix = attn
            .forward(
                &x.narrow(1, 0, 4).unwrap(),
                &create_causal_mask(4, &device).unwrap(),
                &mut NoopObserver,
            )
            .unwrap();

        let a: Vec<f32> = full.narrow(1, 0, 4).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        let b: Vec<f32> = prefix.flatten_all().unwrap().to_vec1().unwrap();
        for (x, y) in a.iter().zip(&b) {
            assert!((x - y).abs() < 1e-4);
        }
    }
}
