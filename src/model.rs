//! Transformer encoder-decoder for sequence-to-sequence translation.
//!
//! Post-norm residual composition throughout: every sublayer output is
//! dropped out, added to its input, then layer-normalized, so each layer
//! preserves the `[batch, len, hidden]` shape and stacks to arbitrary depth.

use candle_core::{Result as CandleResult, Tensor};
use candle_nn::{Dropout, Embedding, LayerNorm, Linear, Module, VarBuilder};

use crate::attention::MultiHeadAttention;
use crate::config::{ModelConfig, NmtError};
use crate::mask;

const LAYER_NORM_EPS: f64 = 1e-5;

/// Two-layer position-wise transform with a ReLU in between, applied
/// independently at every sequence position.
#[derive(Debug)]
pub struct PositionwiseFeedForward {
    fc_1: Linear,
    fc_2: Linear,
    dropout: Dropout,
}

impl PositionwiseFeedForward {
    pub fn new(
        hidden_dim: usize,
        pf_dim: usize,
        dropout_rate: f32,
        vb: VarBuilder,
    ) -> CandleResult<Self> {
        let fc_1 = candle_nn::linear(hidden_dim, pf_dim, vb.pp("fc_1"))?;
        let fc_2 = candle_nn::linear(pf_dim, hidden_dim, vb.pp("fc_2"))?;
        Ok(PositionwiseFeedForward {
            fc_1,
            fc_2,
            dropout: Dropout::new(dropout_rate),
        })
    }

    pub fn forward(&self, x: &Tensor, train: bool) -> CandleResult<Tensor> {
        let x = self.fc_1.forward(x)?.relu()?;
        let x = if train {
            self.dropout.forward(&x, train)?
        } else {
            x
        };
        self.fc_2.forward(&x)
    }
}

/// Self-attention sublayer followed by a feed-forward sublayer.
#[derive(Debug)]
pub struct EncoderLayer {
    self_attention: MultiHeadAttention,
    feed_forward: PositionwiseFeedForward,
    self_attn_norm: LayerNorm,
    ff_norm: LayerNorm,
    dropout: Dropout,
}

impl EncoderLayer {
    pub fn new(
        hidden_dim: usize,
        n_heads: usize,
        pf_dim: usize,
        dropout_rate: f32,
        vb: VarBuilder,
    ) -> CandleResult<Self> {
        Ok(EncoderLayer {
            self_attention: MultiHeadAttention::new(
                hidden_dim,
                n_heads,
                dropout_rate,
                vb.pp("self_attention"),
            )?,
            feed_forward: PositionwiseFeedForward::new(
                hidden_dim,
                pf_dim,
                dropout_rate,
                vb.pp("feed_forward"),
            )?,
            self_attn_norm: candle_nn::layer_norm(
                hidden_dim,
                LAYER_NORM_EPS,
                vb.pp("self_attn_norm"),
            )?,
            ff_norm: candle_nn::layer_norm(hidden_dim, LAYER_NORM_EPS, vb.pp("ff_norm"))?,
            dropout: Dropout::new(dropout_rate),
        })
    }

    pub fn forward(&self, x: &Tensor, src_mask: &Tensor, train: bool) -> CandleResult<Tensor> {
        let (attn_out, _) = self
            .self_attention
            .forward(x, x, x, Some(src_mask), train)?;
        let attn_out = if train {
            self.dropout.forward(&attn_out, train)?
        } else {
            attn_out
        };
        let x = self.self_attn_norm.forward(&x.add(&attn_out)?)?;

        let ff_out = self.feed_forward.forward(&x, train)?;
        let ff_out = if train {
            self.dropout.forward(&ff_out, train)?
        } else {
            ff_out
        };
        self.ff_norm.forward(&x.add(&ff_out)?)
    }
}

/// Masked self-attention, cross-attention over the encoder output, then the
/// feed-forward sublayer.
#[derive(Debug)]
pub struct DecoderLayer {
    self_attention: MultiHeadAttention,
    cross_attention: MultiHeadAttention,
    feed_forward: PositionwiseFeedForward,
    self_attn_norm: LayerNorm,
    cross_attn_norm: LayerNorm,
    ff_norm: LayerNorm,
    dropout: Dropout,
}

impl DecoderLayer {
    pub fn new(
        hidden_dim: usize,
        n_heads: usize,
        pf_dim: usize,
        dropout_rate: f32,
        vb: VarBuilder,
    ) -> CandleResult<Self> {
        Ok(DecoderLayer {
            self_attention: MultiHeadAttention::new(
                hidden_dim,
                n_heads,
                dropout_rate,
                vb.pp("self_attention"),
            )?,
            cross_attention: MultiHeadAttention::new(
                hidden_dim,
                n_heads,
                dropout_rate,
                vb.pp("cross_attention"),
            )?,
            feed_forward: PositionwiseFeedForward::new(
                hidden_dim,
                pf_dim,
                dropout_rate,
                vb.pp("feed_forward"),
            )?,
            self_attn_norm: candle_nn::layer_norm(
                hidden_dim,
                LAYER_NORM_EPS,
                vb.pp("self_attn_norm"),
            )?,
            cross_attn_norm: candle_nn::layer_norm(
                hidden_dim,
                LAYER_NORM_EPS,
                vb.pp("cross_attn_norm"),
            )?,
            ff_norm: candle_nn::layer_norm(hidden_dim, LAYER_NORM_EPS, vb.pp("ff_norm"))?,
            dropout: Dropout::new(dropout_rate),
        })
    }

    /// Returns the layer output together with this layer's cross-attention
    /// probabilities `[batch, heads, tgt_len, src_len]`.
    pub fn forward(
        &self,
        x: &Tensor,
        enc_out: &Tensor,
        tgt_mask: &Tensor,
        src_mask: &Tensor,
        train: bool,
    ) -> CandleResult<(Tensor, Tensor)> {
        let (self_out, _) = self
            .self_attention
            .forward(x, x, x, Some(tgt_mask), train)?;
        let self_out = if train {
            self.dropout.forward(&self_out, train)?
        } else {
            self_out
        };
        let x = self.self_attn_norm.forward(&x.add(&self_out)?)?;

        let (cross_out, cross_weights) =
            self.cross_attention
                .forward(&x, enc_out, enc_out, Some(src_mask), train)?;
        let cross_out = if train {
            self.dropout.forward(&cross_out, train)?
        } else {
            cross_out
        };
        let x = self.cross_attn_norm.forward(&x.add(&cross_out)?)?;

        let ff_out = self.feed_forward.forward(&x, train)?;
        let ff_out = if train {
            self.dropout.forward(&ff_out, train)?
        } else {
            ff_out
        };
        let x = self.ff_norm.forward(&x.add(&ff_out)?)?;

        Ok((x, cross_weights))
    }
}

/// Embedding front-end shared by both stacks: scaled token embedding plus a
/// learned positional embedding, then dropout.
#[derive(Debug)]
struct EmbeddingFrontend {
    tok_embedding: Embedding,
    pos_embedding: Embedding,
    dropout: Dropout,
    scale: f64,
    max_len: usize,
}

impl EmbeddingFrontend {
    fn new(
        vocab_size: usize,
        hidden_dim: usize,
        max_len: usize,
        dropout_rate: f32,
        vb: VarBuilder,
    ) -> CandleResult<Self> {
        Ok(EmbeddingFrontend {
            tok_embedding: candle_nn::embedding(vocab_size, hidden_dim, vb.pp("tok_embedding"))?,
            pos_embedding: candle_nn::embedding(max_len, hidden_dim, vb.pp("pos_embedding"))?,
            dropout: Dropout::new(dropout_rate),
            scale: (hidden_dim as f64).sqrt(),
            max_len,
        })
    }

    fn forward(&self, ids: &Tensor, train: bool) -> CandleResult<Tensor> {
        let (_batch, seq_len) = ids.dims2()?;
        if seq_len > self.max_len {
            return Err(candle_core::Error::Msg(format!(
                "sequence length {} exceeds maximum configured position {}",
                seq_len, self.max_len
            )));
        }

        let tok = self.tok_embedding.forward(ids)?.affine(self.scale, 0.0)?;
        let positions = Tensor::arange(0u32, seq_len as u32, ids.device())?.unsqueeze(0)?;
        let pos = self.pos_embedding.forward(&positions)?;
        let x = tok.broadcast_add(&pos)?;

        if train {
            self.dropout.forward(&x, train)
        } else {
            Ok(x)
        }
    }
}

/// Encoder stack: embedding front-end plus N encoder layers.
#[derive(Debug)]
pub struct Encoder {
    embedding: EmbeddingFrontend,
    layers: Vec<EncoderLayer>,
}

impl Encoder {
    pub fn new(config: &ModelConfig, vb: VarBuilder) -> CandleResult<Self> {
        let embedding = EmbeddingFrontend::new(
            config.vocab_size,
            config.hidden_dim,
            config.max_len,
            config.dropout,
            vb.pp("embedding"),
        )?;
        let layers = (0..config.enc_layers)
            .map(|i| {
                EncoderLayer::new(
                    config.hidden_dim,
                    config.enc_heads,
                    config.pf_dim,
                    config.dropout,
                    vb.pp(format!("layers.{}", i)),
                )
            })
            .collect::<CandleResult<Vec<_>>>()?;
        Ok(Encoder { embedding, layers })
    }

    pub fn forward(&self, source: &Tensor, src_mask: &Tensor, train: bool) -> CandleResult<Tensor> {
        let mut x = self.embedding.forward(source, train)?;
        for layer in &self.layers {
            x = layer.forward(&x, src_mask, train)?;
        }
        Ok(x)
    }
}

/// Decoder stack: embedding front-end, N decoder layers, vocabulary head.
#[derive(Debug)]
pub struct Decoder {
    embedding: EmbeddingFrontend,
    layers: Vec<DecoderLayer>,
    fc_out: Linear,
}

impl Decoder {
    pub fn new(config: &ModelConfig, vb: VarBuilder) -> CandleResult<Self> {
        let embedding = EmbeddingFrontend::new(
            config.vocab_size,
            config.hidden_dim,
            config.max_len,
            config.dropout,
            vb.pp("embedding"),
        )?;
        let layers = (0..config.dec_layers)
            .map(|i| {
                DecoderLayer::new(
                    config.hidden_dim,
                    config.dec_heads,
                    config.pf_dim,
                    config.dropout,
                    vb.pp(format!("layers.{}", i)),
                )
            })
            .collect::<CandleResult<Vec<_>>>()?;
        let fc_out = candle_nn::linear(config.hidden_dim, config.vocab_size, vb.pp("fc_out"))?;
        Ok(Decoder {
            embedding,
            layers,
            fc_out,
        })
    }

    /// Returns vocabulary logits `[batch, tgt_len, vocab]` and the last
    /// layer's cross-attention probabilities.
    pub fn forward(
        &self,
        target: &Tensor,
        enc_out: &Tensor,
        tgt_mask: &Tensor,
        src_mask: &Tensor,
        train: bool,
    ) -> CandleResult<(Tensor, Tensor)> {
        let mut x = self.embedding.forward(target, train)?;
        let mut cross_weights = None;
        for layer in &self.layers {
            let (y, weights) = layer.forward(&x, enc_out, tgt_mask, src_mask, train)?;
            x = y;
            cross_weights = Some(weights);
        }
        let cross_weights = cross_weights
            .ok_or_else(|| candle_core::Error::Msg("decoder has no layers".to_string()))?;
        let logits = self.fc_out.forward(&x)?;
        Ok((logits, cross_weights))
    }
}

/// Full encoder-decoder model. Builds its own padding and causal masks from
/// the raw id tensors; getting either mask wrong silently breaks training, so
/// both builders live in [`crate::mask`] under direct test.
#[derive(Debug)]
pub struct Transformer {
    encoder: Encoder,
    decoder: Decoder,
    pad_id: u32,
}

impl Transformer {
    pub fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self, NmtError> {
        config.validate()?;
        let encoder = Encoder::new(config, vb.pp("encoder"))?;
        let decoder = Decoder::new(config, vb.pp("decoder"))?;
        Ok(Transformer {
            encoder,
            decoder,
            pad_id: config.pad_id,
        })
    }

    /// Forward pass over `[batch, src_len]` source ids and `[batch, tgt_len]`
    /// target ids, both `u32`. Returns logits `[batch, tgt_len, vocab]` plus
    /// the decoder's final cross-attention probabilities.
    pub fn forward(
        &self,
        source: &Tensor,
        target: &Tensor,
        train: bool,
    ) -> CandleResult<(Tensor, Tensor)> {
        let src_mask = mask::source_padding_mask(source, self.pad_id)?;
        let tgt_mask = mask::target_mask(target, self.pad_id)?;

        let enc_out = self.encoder.forward(source, &src_mask, train)?;
        self.decoder
            .forward(target, &enc_out, &tgt_mask, &src_mask, train)
    }

    pub fn pad_id(&self) -> u32 {
        self.pad_id
    }
}
