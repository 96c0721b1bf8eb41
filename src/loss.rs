//! Cross-entropy over flattened token predictions, ignoring pad positions.

use candle_core::{DType, Result as CandleResult, Tensor, D};
use candle_nn::ops;

/// Loss value plus the number of target tokens that actually contributed.
#[derive(Debug)]
pub struct LossOutput {
    /// Scalar tensor, still attached to the autodiff graph.
    pub loss: Tensor,
    pub valid_tokens: usize,
}

/// Token-level cross-entropy that excludes an ignore-index (the pad id) from
/// both the per-token terms and the averaging denominator.
#[derive(Debug, Clone)]
pub struct CrossEntropyLoss {
    ignore_index: u32,
}

impl CrossEntropyLoss {
    pub fn new(ignore_index: u32) -> Self {
        Self { ignore_index }
    }

    /// `logits` is `[tokens, vocab]`, `targets` is `[tokens]` of `u32` ids.
    /// A slice consisting entirely of ignored positions yields a zero loss
    /// (still graph-attached) rather than an error, so an all-pad tail batch
    /// cannot poison the running average with NaN.
    pub fn compute(&self, logits: &Tensor, targets: &Tensor) -> CandleResult<LossOutput> {
        let (token_count, vocab_size) = logits.dims2()?;
        let target_count = targets.dims1()?;
        if token_count != target_count {
            return Err(candle_core::Error::Msg(format!(
                "logits cover {} tokens but targets cover {}",
                token_count, target_count
            )));
        }
        if vocab_size == 0 {
            return Err(candle_core::Error::Msg(
                "logits vocabulary dimension must be greater than zero".to_string(),
            ));
        }

        let log_probs = ops::log_softmax(logits, D::Minus1)?;
        let indices = targets.unsqueeze(1)?;
        let nll = log_probs.gather(&indices, 1)?.neg()?.squeeze(1)?;

        let valid_mask = targets.ne(self.ignore_index)?.to_dtype(DType::F32)?;
        let valid_tokens = valid_mask.sum_all()?.to_vec0::<f32>()?.round() as usize;

        let masked_sum = nll.mul(&valid_mask)?.sum_all()?;
        let denom = valid_tokens.max(1) as f64;
        let loss = masked_sum.affine(1.0 / denom, 0.0)?;

        Ok(LossOutput { loss, valid_tokens })
    }
}
