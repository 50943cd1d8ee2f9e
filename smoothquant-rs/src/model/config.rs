//! OPT architecture hyperparameters, read from a checkpoint's `config.json`.

use serde::{Deserialize, Serialize};

use crate::error::{Result, SmoothQuantError};

/// Architecture of an OPT decoder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptConfig {
    /// Vocabulary size.
    pub vocab_size: usize,
    /// Hidden (model) dimension.
    pub hidden_size: usize,
    /// Number of decoder layers.
    pub num_hidden_layers: usize,
    /// Number of attention heads.
    pub num_attention_heads: usize,
    /// Feed-forward inner dimension.
    pub ffn_dim: usize,
    /// Maximum sequence length.
    pub max_position_embeddings: usize,
    /// Pre-norm (`true`) or post-norm decoder layers.
    #[serde(default = "default_true")]
    pub do_layer_norm_before: bool,
    /// Embedding projection size; only `hidden_size` is supported.
    #[serde(default)]
    pub word_embed_proj_dim: Option<usize>,
    /// Padding token id.
    #[serde(default = "default_pad_token_id")]
    pub pad_token_id: u32,
    /// Beginning-of-sequence token id.
    #[serde(default = "default_bos_token_id")]
    pub bos_token_id: u32,
    /// Feed-forward activation.
    #[serde(default = "default_activation")]
    pub activation_function: String,
}

fn default_true() -> bool {
    true
}

fn default_pad_token_id() -> u32 {
    1
}

fn default_bos_token_id() -> u32 {
    2
}

fn default_activation() -> String {
    "relu".to_string()
}

/// Learned position embeddings are shifted by two slots.
pub(crate) const POSITION_OFFSET: usize = 2;

/// OPT uses a fixed layer norm epsilon.
pub(crate) const LAYER_NORM_EPS: f64 = 1e-5;

impl OptConfig {
    /// facebook/opt-125m.
    #[must_use]
    pub fn opt_125m() -> Self {
        Self {
            vocab_size: 50272,
            hidden_size: 768,
            num_hidden_layers: 12,
            num_attention_heads: 12,
            ffn_dim: 3072,
            max_position_embeddings: 2048,
            do_layer_norm_before: true,
            word_embed_proj_dim: Some(768),
            pad_token_id: 1,
            bos_token_id: 2,
            activation_function: "relu".to_string(),
        }
    }

    /// A very small configuration for tests and benchmarks.
    #[must_use]
    pub fn tiny() -> Self {
        Self {
            vocab_size: 64,
            hidden_size: 32,
            num_hidden_layers: 2,
            num_attention_heads: 4,
            ffn_dim: 64,
            max_position_embeddings: 64,
            do_layer_norm_before: true,
            word_embed_proj_dim: None,
            pad_token_id: 1,
            bos_token_id: 2,
            activation_function: "relu".to_string(),
        }
    }

    /// Per-head dimension.
    #[must_use]
    pub const fn head_dim(&self) -> usize {
        self.hidden_size / self.num_attention_heads
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns error for layouts this decoder does not implement.
    pub fn validate(&self) -> Result<()> {
        if self.num_attention_heads == 0 || self.hidden_size % self.num_attention_heads != 0 {
            return Err(SmoothQuantError::InvalidConfig(format!(
                "hidden_size ({}) must be divisible by num_attention_heads ({})",
                self.hidden_size, self.num_attention_heads
            )));
        }
        if !self.do_layer_norm_before {
            return Err(SmoothQuantError::InvalidConfig(
                "post-norm OPT layouts are not supported".to_string(),
            ));
        }
        if self
            .word_embed_proj_dim
            .is_some_and(|dim| dim != self.hidden_size)
        {
            return Err(SmoothQuantError::InvalidConfig(
                "word_embed_proj_dim must equal hidden_size".to_string(),
            ));
        }
        if self.activation_function != "relu" {
            return Err(SmoothQuantError::InvalidConfig(format!(
                "unsupported activation: {}",
                self.activation_function
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hf_config() {
        let json = r#"{
            "_name_or_path": "facebook/opt-125m",
            "activation_function": "relu",
            "architectures": ["OPTForCausalLM"],
            "bos_token_id": 2,
            "do_layer_norm_before": true,
            "eos_token_id": 2,
            "ffn_dim": 3072,
            "hidden_size": 768,
            "max_position_embeddings": 2048,
            "model_type": "opt",
            "num_attention_heads": 12,
            "num_hidden_layers": 12,
            "pad_token_id": 1,
            "torch_dtype": "float16",
            "vocab_size": 50272,
            "word_embed_proj_dim": 768
        }"#;
        let config: OptConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config, OptConfig::opt_125m());
        assert_eq!(config.head_dim(), 64);
        config.validate().unwrap();
    }

    #[test]
    fn test_reject_post_norm() {
        let config = OptConfig {
            do_layer_norm_before: false,
            ..OptConfig::tiny()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_reject_projected_embeddings() {
        let config = OptConfig {
            word_embed_proj_dim: Some(16),
            ..OptConfig::tiny()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_reject_bad_heads() {
        let config = OptConfig {
            num_attention_heads: 5,
            ..OptConfig::tiny()
        };
        assert!(config.validate().is_err());
    }
}
