//! Text dataset loading and tokenization.
//!
//! Records are JSON lines with a `text` field (LAMBADA and Pile exports both
//! use this layout). Evaluation takes the first `num_samples` records in file
//! order; calibration draws them after a seeded ChaCha shuffle, so runs are
//! reproducible either way.

use std::path::Path;

use rand::seq::SliceRandom;
use rand_chacha::rand_core::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::Deserialize;

use crate::config::DatasetSettings;
use crate::error::{Result, SmoothQuantError};
use crate::model::TextTokenizer;

#[derive(Deserialize)]
struct TextRecord {
    text: String,
}

/// Read every `text` record of a JSONL file.
///
/// # Errors
///
/// Returns error if the file is missing or a line is not a text record.
pub fn load_texts<P: AsRef<Path>>(path: P) -> Result<Vec<String>> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(SmoothQuantError::Dataset(format!(
            "Dataset not found: {}",
            path.display()
        )));
    }

    let content = std::fs::read_to_string(path)?;
    let mut texts = Vec::new();
    for (line_no, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let record: TextRecord = serde_json::from_str(line).map_err(|e| {
            SmoothQuantError::Dataset(format!("Failed to parse line {}: {e}", line_no + 1))
        })?;
        texts.push(record.text);
    }
    Ok(texts)
}

/// Shuffle with `seed` and keep at most `num_samples` texts.
#[must_use]
pub fn sample_texts(mut texts: Vec<String>, num_samples: usize, seed: u64) -> Vec<String> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    texts.shuffle(&mut rng);
    texts.truncate(num_samples);
    texts
}

/// Token ID sequences ready for evaluation or calibration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TokenizedDataset {
    sequences: Vec<Vec<u32>>,
}

impl TokenizedDataset {
    /// Build from raw sequences, dropping those shorter than two tokens
    /// (they have no prediction target).
    #[must_use]
    pub fn from_sequences(sequences: Vec<Vec<u32>>) -> Self {
        let total = sequences.len();
        let sequences: Vec<_> = sequences.into_iter().filter(|s| s.len() >= 2).collect();
        if sequences.len() < total {
            tracing::warn!(
                "Dropped {} sequences shorter than 2 tokens",
                total - sequences.len()
            );
        }
        Self { sequences }
    }

    /// Tokenize texts. Sequences longer than `max_len` keep their last
    /// `max_len` tokens so the final token stays the prediction target.
    ///
    /// # Errors
    ///
    /// Returns error if tokenization fails.
    pub fn tokenize(texts: &[String], tokenizer: &TextTokenizer, max_len: Option<usize>) -> Result<Self> {
        let sequences = texts
            .iter()
            .map(|text| {
                let mut ids = tokenizer.encode(text)?;
                if let Some(max_len) = max_len {
                    if ids.len() > max_len {
                        ids.drain(..ids.len() - max_len);
                    }
                }
                Ok(ids)
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::from_sequences(sequences))
    }

    /// Load and tokenize the first `settings.num_samples` records.
    ///
    /// # Errors
    ///
    /// Returns error if loading or tokenization fails, or nothing usable remains.
    pub fn load(settings: &DatasetSettings, tokenizer: &TextTokenizer, max_len: Option<usize>) -> Result<Self> {
        let mut texts = load_texts(&settings.path)?;
        texts.truncate(settings.num_samples);
        let dataset = Self::tokenize(&texts, tokenizer, max_len)?;
        if dataset.is_empty() {
            return Err(SmoothQuantError::Dataset(format!(
                "No sequences of at least 2 tokens in {}",
                settings.path
            )));
        }
        tracing::info!("Loaded {} sequences from {}", dataset.len(), settings.path);
        Ok(dataset)
    }

    /// Number of sequences.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sequences.len()
    }

    /// Check if dataset is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sequences.is_empty()
    }

    /// Sequence at `index`.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&[u32]> {
        self.sequences.get(index).map(Vec::as_slice)
    }

    /// All sequences.
    #[must_use]
    pub fn sequences(&self) -> &[Vec<u32>] {
        &self.sequences
    }

    /// Length of the longest sequence.
    #[must_use]
    pub fn max_len(&self) -> usize {
        self.sequences.iter().map(Vec::len).max().unwrap_or(0)
    }
}
