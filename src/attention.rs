//! Scaled dot-product attention and its multi-head wrapper.

use candle_core::{Result as CandleResult, Tensor, D};
use candle_nn::{Dropout, Linear, Module, VarBuilder};

/// Scaled dot-product attention primitive.
///
/// `query` is `[..., q_len, d]`, `key`/`value` are `[..., k_len, d]`. The
/// optional additive `mask` must broadcast against the score shape
/// `[..., q_len, k_len]`; blocked positions carry a large negative value (see
/// [`crate::mask::BLOCKED_SCORE`]) so their softmax weight underflows to zero.
///
/// Returns the attended context together with the attention probabilities.
/// The probabilities are pre-dropout; when a dropout layer is supplied the
/// context is computed from the dropped weights, as the residual sublayers
/// expect during training.
pub fn scaled_dot_product_attention(
    query: &Tensor,
    key: &Tensor,
    value: &Tensor,
    mask: Option<&Tensor>,
    dropout: Option<&Dropout>,
    train: bool,
) -> CandleResult<(Tensor, Tensor)> {
    let head_dim = query.dim(D::Minus1)?;
    let scale = 1.0 / (head_dim as f64).sqrt();

    let key_t = key.transpose(D::Minus2, D::Minus1)?.contiguous()?;
    let scores = query.contiguous()?.matmul(&key_t)?.affine(scale, 0.0)?;

    let scores = match mask {
        Some(mask) => scores.broadcast_add(mask)?,
        None => scores,
    };

    let weights = candle_nn::ops::softmax_last_dim(&scores)?;

    let applied = match dropout {
        Some(dropout) if train => dropout.forward(&weights, train)?,
        _ => weights.clone(),
    };
    let context = applied.contiguous()?.matmul(&value.contiguous()?)?;

    Ok((context, weights))
}

/// Multi-head attention: Q/K/V projections, per-head scaled dot-product
/// attention, concatenation, and an output projection.
#[derive(Debug)]
pub struct MultiHeadAttention {
    fc_q: Linear,
    fc_k: Linear,
    fc_v: Linear,
    fc_o: Linear,
    attn_dropout: Dropout,
    out_dropout: Dropout,
    n_heads: usize,
    head_dim: usize,
}

impl MultiHeadAttention {
    pub fn new(
        hidden_dim: usize,
        n_heads: usize,
        dropout_rate: f32,
        vb: VarBuilder,
    ) -> CandleResult<Self> {
        if n_heads == 0 || hidden_dim % n_heads != 0 {
            return Err(candle_core::Error::Msg(format!(
                "hidden_dim {} is not divisible by n_heads {}",
                hidden_dim, n_heads
            )));
        }

        let fc_q = candle_nn::linear(hidden_dim, hidden_dim, vb.pp("fc_q"))?;
        let fc_k = candle_nn::linear(hidden_dim, hidden_dim, vb.pp("fc_k"))?;
        let fc_v = candle_nn::linear(hidden_dim, hidden_dim, vb.pp("fc_v"))?;
        let fc_o = candle_nn::linear(hidden_dim, hidden_dim, vb.pp("fc_o"))?;

        Ok(MultiHeadAttention {
            fc_q,
            fc_k,
            fc_v,
            fc_o,
            attn_dropout: Dropout::new(dropout_rate),
            out_dropout: Dropout::new(dropout_rate),
            n_heads,
            head_dim: hidden_dim / n_heads,
        })
    }

    /// Split a projected `[batch, len, hidden]` tensor into
    /// `[batch, heads, len, head_dim]`.
    fn split_heads(&self, x: &Tensor) -> CandleResult<Tensor> {
        let (batch, len, _hidden) = x.dims3()?;
        x.reshape((batch, len, self.n_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()
    }

    /// Forward pass. Output shape equals the query shape; the returned
    /// attention probabilities are `[batch, heads, q_len, k_len]`.
    pub fn forward(
        &self,
        query: &Tensor,
        key: &Tensor,
        value: &Tensor,
        mask: Option<&Tensor>,
        train: bool,
    ) -> CandleResult<(Tensor, Tensor)> {
        let (batch, q_len, hidden) = query.dims3()?;

        let q = self.split_heads(&self.fc_q.forward(query)?)?;
        let k = self.split_heads(&self.fc_k.forward(key)?)?;
        let v = self.split_heads(&self.fc_v.forward(value)?)?;

        let (context, weights) =
            scaled_dot_product_attention(&q, &k, &v, mask, Some(&self.attn_dropout), train)?;

        // [batch, heads, q_len, head_dim] -> [batch, q_len, hidden]
        let context = context
            .transpose(1, 2)?
            .contiguous()?
            .reshape((batch, q_len, hidden))?;

        let output = self.fc_o.forward(&context)?;
        let output = if train {
            self.out_dropout.forward(&output, train)?
        } else {
            output
        };

        Ok((output, weights))
    }
}
