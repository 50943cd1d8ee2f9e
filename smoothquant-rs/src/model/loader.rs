//! Loading OPT checkpoints and tokenizers from a local directory or the
//! Hugging Face cache.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use tokenizers::decoders::byte_level::ByteLevel as ByteLevelDecoder;
use tokenizers::models::bpe::BPE;
use tokenizers::pre_tokenizers::byte_level::ByteLevel;
use tokenizers::Tokenizer;

use super::{OptConfig, OptModel};
use crate::error::{Result, SmoothQuantError};

/// Resolve a model ID to a directory holding `config.json`.
///
/// Accepts a local path, or an ID like `facebook/opt-125m` found in the
/// Hugging Face cache (`$HF_HOME/hub/models--org--name/snapshots/<rev>`).
///
/// # Errors
///
/// Returns error if the model cannot be found.
pub fn resolve_model_path(model_id: &str) -> Result<PathBuf> {
    let path = PathBuf::from(model_id);
    if path.exists() {
        return Ok(path);
    }

    let cache_dir = std::env::var("HF_HOME")
        .or_else(|_| std::env::var("HOME").map(|h| format!("{h}/.cache/huggingface")))
        .unwrap_or_else(|_| "/tmp/huggingface".to_string());

    let snapshots = PathBuf::from(format!(
        "{}/hub/models--{}/snapshots",
        cache_dir,
        model_id.replace('/', "--")
    ));

    if snapshots.is_dir() {
        for entry in std::fs::read_dir(&snapshots)? {
            let candidate = entry?.path();
            if candidate.join("config.json").exists() {
                return Ok(candidate);
            }
        }
    }

    Err(SmoothQuantError::Model(format!(
        "Model not found at '{model_id}' or in HF cache at '{}'. Use `huggingface-cli download {model_id}` to download.",
        snapshots.display()
    )))
}

fn load_config(model_path: &Path) -> Result<OptConfig> {
    let config_path = model_path.join("config.json");
    let config_str = std::fs::read_to_string(&config_path)
        .map_err(|e| SmoothQuantError::Model(format!("Failed to read {}: {e}", config_path.display())))?;
    serde_json::from_str(&config_str)
        .map_err(|e| SmoothQuantError::Model(format!("Failed to parse config.json: {e}")))
}

/// Checkpoints saved from the bare decoder omit the `model.` prefix.
fn canonical_name(name: String) -> String {
    if name.starts_with("model.") || name.starts_with("lm_head.") {
        name
    } else {
        format!("model.{name}")
    }
}

fn load_weights(model_path: &Path, device: &Device) -> Result<HashMap<String, Tensor>> {
    let mut shards: Vec<PathBuf> = std::fs::read_dir(model_path)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.extension().is_some_and(|ext| ext == "safetensors"))
        .collect();
    shards.sort();

    let mut tensors = HashMap::new();
    if shards.is_empty() {
        let pth = model_path.join("pytorch_model.bin");
        if !pth.exists() {
            return Err(SmoothQuantError::Model(format!(
                "No model weights found in {}. Expected *.safetensors or pytorch_model.bin",
                model_path.display()
            )));
        }
        for (name, tensor) in candle_core::pickle::read_all(&pth)? {
            tensors.insert(canonical_name(name), tensor.to_device(device)?);
        }
    } else {
        for shard in &shards {
            tracing::debug!("Loading weights from {}", shard.display());
            for (name, tensor) in candle_core::safetensors::load(shard, device)? {
                tensors.insert(canonical_name(name), tensor);
            }
        }
    }
    Ok(tensors)
}

/// Byte-level BPE tokenizer that prepends the BOS token to every encoding.
#[derive(Debug, Clone)]
pub struct TextTokenizer {
    inner: Tokenizer,
    bos_token_id: u32,
}

impl TextTokenizer {
    /// Wrap an existing tokenizer.
    #[must_use]
    pub const fn new(inner: Tokenizer, bos_token_id: u32) -> Self {
        Self { inner, bos_token_id }
    }

    /// Encode text into token IDs, BOS first.
    ///
    /// # Errors
    ///
    /// Returns error if tokenization fails.
    pub fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self.inner.encode(text, false)?;
        let mut ids = Vec::with_capacity(encoding.len() + 1);
        ids.push(self.bos_token_id);
        ids.extend_from_slice(encoding.get_ids());
        Ok(ids)
    }

    /// Decode token IDs back into text.
    ///
    /// # Errors
    ///
    /// Returns error if decoding fails.
    pub fn decode(&self, ids: &[u32]) -> Result<String> {
        Ok(self.inner.decode(ids, true)?)
    }

    /// Vocabulary size including added tokens.
    #[must_use]
    pub fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(true)
    }
}

/// Load the tokenizer from `tokenizer.json`, falling back to
/// `vocab.json` + `merges.txt`.
///
/// # Errors
///
/// Returns error if neither form is present or loading fails.
pub fn load_tokenizer(model_path: &Path, bos_token_id: u32) -> Result<TextTokenizer> {
    let tokenizer_file = model_path.join("tokenizer.json");
    if tokenizer_file.exists() {
        let inner = Tokenizer::from_file(&tokenizer_file)
            .map_err(|e| SmoothQuantError::Tokenizer(format!("Failed to load tokenizer: {e}")))?;
        return Ok(TextTokenizer::new(inner, bos_token_id));
    }

    let vocab = model_path.join("vocab.json");
    let merges = model_path.join("merges.txt");
    if !vocab.exists() || !merges.exists() {
        return Err(SmoothQuantError::Tokenizer(format!(
            "tokenizer.json not found in {} and no vocab.json/merges.txt fallback",
            model_path.display()
        )));
    }

    let path_str = |p: &Path| {
        p.to_str()
            .map(str::to_string)
            .ok_or_else(|| SmoothQuantError::Tokenizer(format!("non UTF-8 path {}", p.display())))
    };
    let bpe = BPE::from_file(&path_str(&vocab)?, &path_str(&merges)?).build()?;

    let mut inner = Tokenizer::new(bpe);
    inner.with_pre_tokenizer(Some(ByteLevel::default().add_prefix_space(false)));
    inner.with_decoder(Some(ByteLevelDecoder::default()));
    Ok(TextTokenizer::new(inner, bos_token_id))
}

/// Load a pretrained OPT model and its tokenizer.
///
/// # Errors
///
/// Returns error if the model cannot be resolved, parsed or built.
pub fn load_pretrained(model_id: &str, dtype: DType, device: &Device) -> Result<(OptModel, TextTokenizer)> {
    let model_path = resolve_model_path(model_id)?;
    tracing::info!("Loading {} from {}", model_id, model_path.display());

    let config = load_config(&model_path)?;
    let tensors = load_weights(&model_path, device)?;
    let vb = VarBuilder::from_tensors(tensors, dtype, device);
    let model = OptModel::from_varbuilder(&config, vb)?;
    let tokenizer = load_tokenizer(&model_path, config.bos_token_id)?;
    if tokenizer.vocab_size() > model.vocab_size() {
        return Err(SmoothQuantError::Model(format!(
            "tokenizer has {} tokens but the model embeds only {}",
            tokenizer.vocab_size(),
            model.vocab_size()
        )));
    }

    tracing::info!(
        "Loaded {}: {} parameters, {:.1} MiB",
        model_id,
        model.num_parameters(),
        model.size_bytes() as f64 / (1024.0 * 1024.0)
    );
    Ok((model, tokenizer))
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_nn::VarMap;
    use tempfile::TempDir;

    #[test]
    fn test_resolve_model_path_invalid() {
        let err = resolve_model_path("nonexistent-org/nonexistent-model").unwrap_err();
        match err {
            SmoothQuantError::Model(msg) => assert!(msg.contains("Model not found")),
            other => panic!("Expected Model error, got {other:?}"),
        }
    }

    #[test]
    fn test_canonical_name() {
        assert_eq!(
            canonical_name("decoder.layers.0.fc1.weight".to_string()),
            "model.decoder.layers.0.fc1.weight"
        );
        assert_eq!(canonical_name("lm_head.weight".to_string()), "lm_head.weight");
        assert_eq!(
            canonical_name("model.decoder.final_layer_norm.bias".to_string()),
            "model.decoder.final_layer_norm.bias"
        );
    }

    #[test]
    fn test_load_tokenizer_missing_file() {
        let temp_dir = TempDir::new().unwrap();
        let err = load_tokenizer(temp_dir.path(), 2).unwrap_err();
        match err {
            SmoothQuantError::Tokenizer(msg) => assert!(msg.contains("tokenizer.json not found")),
            other => panic!("Expected Tokenizer error, got {other:?}"),
        }
    }

    #[test]
    fn test_bpe_fallback_prepends_bos() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(
            temp_dir.path().join("vocab.json"),
            r#"{"<pad>": 0, "</s>": 2, "a": 3, "b": 4, "ab": 5}"#,
        )
        .unwrap();
        std::fs::write(temp_dir.path().join("merges.txt"), "#version: 0.2\na b\n").unwrap();

        let tokenizer = load_tokenizer(temp_dir.path(), 2).unwrap();
        let ids = tokenizer.encode("ab").unwrap();
        assert_eq!(ids, vec![2, 5]);
    }

    /// Save a random tiny model under bare-decoder names to exercise the remap.
    fn write_checkpoint(dir: &Path, vocab: &str) -> OptModel {
        let device = Device::Cpu;
        let config = OptConfig::tiny();
        let var_map = VarMap::new();
        let vb = VarBuilder::from_varmap(&var_map, DType::F32, &device);
        let reference = OptModel::from_varbuilder(&config, vb).unwrap();
        let tensors: HashMap<String, Tensor> = var_map
            .data()
            .lock()
            .unwrap()
            .iter()
            .map(|(k, v)| (k.trim_start_matches("model.").to_string(), v.as_tensor().clone()))
            .collect();
        candle_core::safetensors::save(&tensors, dir.join("model.safetensors")).unwrap();
        std::fs::write(dir.join("config.json"), serde_json::to_string(&config).unwrap()).unwrap();
        std::fs::write(dir.join("vocab.json"), vocab).unwrap();
        std::fs::write(dir.join("merges.txt"), "#version: 0.2\n").unwrap();
        reference
    }

    #[test]
    fn test_load_pretrained_from_local_dir() {
        let temp_dir = TempDir::new().unwrap();
        let device = Device::Cpu;
        let reference = write_checkpoint(temp_dir.path(), r#"{"</s>": 2, "a": 3}"#);

        let path = temp_dir.path().to_str().unwrap();
        let (model, tokenizer) = load_pretrained(path, DType::F32, &device).unwrap();
        assert_eq!(model.num_parameters(), reference.num_parameters());
        assert_eq!(tokenizer.encode("a").unwrap(), vec![2, 3]);
        assert_eq!(tokenizer.vocab_size(), 2);

        let ids = Tensor::new(&[[2u32, 3, 4]], &device).unwrap();
        let expected = reference.forward(&ids).unwrap();
        let actual = model.forward(&ids).unwrap();
        let diff = (expected - actual).unwrap().abs().unwrap().max_all().unwrap();
        assert!(diff.to_scalar::<f32>().unwrap() < 1e-5);
    }

    #[test]
    fn test_load_pretrained_rejects_larger_vocab() {
        let temp_dir = TempDir::new().unwrap();
        let entries: Vec<String> = (0..100).map(|i| format!(r#""t{i}": {i}"#)).collect();
        let vocab = format!("{{{}}}", entries.join(", "));
        let model = write_checkpoint(temp_dir.path(), &vocab);
        assert!(model.vocab_size() < 100);

        let err = load_pretrained(temp_dir.path().to_str().unwrap(), DType::F32, &Device::Cpu).unwrap_err();
        match err {
            SmoothQuantError::Model(msg) => assert!(msg.contains("100 tokens")),
            other => panic!("Expected Model error, got {other:?}"),
        }
    }
}
