//! Last-token prediction accuracy.
//!
//! For each sequence the model predicts the final token from everything before
//! it: the arg-max of the logits at position `len - 2` is compared against the
//! token at `len - 1`.

use std::fmt;
use std::time::Instant;

use candle_core::{IndexOp, Tensor};
use serde::Serialize;

use crate::dataset::TokenizedDataset;
use crate::error::Result;
use crate::model::OptModel;
use crate::progress::sweep_bar;

/// Outcome of an evaluation sweep.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct EvalResult {
    /// hits / total
    pub accuracy: f64,
    /// Correct predictions.
    pub hits: usize,
    /// Sequences evaluated.
    pub total: usize,
    /// Mean forward latency per sequence in milliseconds.
    pub mean_latency_ms: f64,
}

impl fmt::Display for EvalResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "accuracy {:.4} ({}/{}), {:.2} ms/sample",
            self.accuracy, self.hits, self.total, self.mean_latency_ms
        )
    }
}

/// Evaluates last-token prediction accuracy over a fixed dataset.
#[derive(Debug, Clone)]
pub struct Evaluator {
    dataset: TokenizedDataset,
    pad_to: Option<usize>,
    pad_token_id: u32,
}

impl Evaluator {
    /// Evaluate sequences at their natural length.
    #[must_use]
    pub fn new(dataset: TokenizedDataset) -> Self {
        Self {
            dataset,
            pad_to: None,
            pad_token_id: 1,
        }
    }

    /// Right-pad every sequence to `pad_to` tokens with `pad_token_id`.
    /// Sequences already longer are left as is.
    #[must_use]
    pub fn with_padding(mut self, pad_to: usize, pad_token_id: u32) -> Self {
        self.pad_to = Some(pad_to);
        self.pad_token_id = pad_token_id;
        self
    }

    fn input_ids(&self, sequence: &[u32], model: &OptModel) -> Result<Tensor> {
        let target_len = self.pad_to.map_or(sequence.len(), |p| p.max(sequence.len()));
        let mut ids = Vec::with_capacity(target_len);
        ids.extend_from_slice(sequence);
        ids.resize(target_len, self.pad_token_id);
        Ok(Tensor::new(ids.as_slice(), model.device())?.unsqueeze(0)?)
    }

    /// Predicted final token of one sequence (at least two tokens long).
    fn predict_last(&self, sequence: &[u32], model: &OptModel) -> Result<u32> {
        let input_ids = self.input_ids(sequence, model)?;
        let logits = model.forward(&input_ids)?;
        let last = logits.i((0, sequence.len() - 2))?;
        Ok(last.argmax(0)?.to_scalar::<u32>()?)
    }

    /// Run the model over every sequence. The model is not modified.
    ///
    /// # Errors
    ///
    /// Returns error if a forward pass fails.
    pub fn evaluate(&self, model: &OptModel) -> Result<EvalResult> {
        let mut hits = 0;
        let mut elapsed_ms = 0.0;
        let pb = sweep_bar(self.dataset.len(), "evaluate")?;

        for sequence in self.dataset.sequences() {
            let start = Instant::now();
            let predicted = self.predict_last(sequence, model)?;
            elapsed_ms += start.elapsed().as_secs_f64() * 1000.0;

            if sequence.last() == Some(&predicted) {
                hits += 1;
            }
            pb.inc(1);
        }

        let total = self.dataset.len();
        #[allow(clippy::cast_precision_loss)]
        let result = EvalResult {
            accuracy: if total == 0 { 0.0 } else { hits as f64 / total as f64 },
            hits,
            total,
            mean_latency_ms: if total == 0 { 0.0 } else { elapsed_ms / total as f64 },
        };
        pb.finish_with_message(format!("{:.4}", result.accuracy));
        tracing::info!("Evaluation: {}", result);
        Ok(result)
    }
}
