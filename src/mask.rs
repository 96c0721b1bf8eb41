//! Builders for the additive attention masks consumed by the transformer.
//!
//! Masks are `f32` tensors holding `0.0` where attention is permitted and
//! [`BLOCKED_SCORE`] otherwise; they are added to the raw scores before
//! softmax. A finite blocking value keeps rows that are fully blocked (pad
//! query positions in the target mask) at a uniform finite distribution
//! instead of NaN, while still underflowing to an exact zero weight for
//! blocked keys after softmax.

use candle_core::{Result, Tensor};

/// Added to scores at blocked positions. Large enough that `exp` underflows
/// to 0.0 against any realistic unmasked score.
pub const BLOCKED_SCORE: f32 = -1e9;

/// Padding mask over source ids, shaped `[batch, 1, 1, src_len]` so it
/// broadcasts across heads and query positions.
pub fn source_padding_mask(source: &Tensor, pad_id: u32) -> Result<Tensor> {
    let (batch, src_len) = source.dims2()?;
    let ids = source.to_vec2::<u32>()?;
    let mut data = vec![0f32; batch * src_len];

    for (b, row) in ids.iter().enumerate() {
        for (s, &id) in row.iter().enumerate() {
            if id == pad_id {
                data[b * src_len + s] = BLOCKED_SCORE;
            }
        }
    }

    Tensor::from_vec(data, (batch, 1, 1, src_len), source.device())
}

/// Combined causal + padding mask over target ids, shaped
/// `[batch, 1, tgt_len, tgt_len]`. A query position may attend to itself and
/// earlier non-pad positions, never to later positions or pad keys.
pub fn target_mask(target: &Tensor, pad_id: u32) -> Result<Tensor> {
    let (batch, tgt_len) = target.dims2()?;
    let ids = target.to_vec2::<u32>()?;
    let mut data = vec![0f32; batch * tgt_len * tgt_len];

    for (b, row) in ids.iter().enumerate() {
        for q in 0..tgt_len {
            let row_start = (b * tgt_len + q) * tgt_len;
            for (k, &id) in row.iter().enumerate() {
                if k > q || id == pad_id {
                    data[row_start + k] = BLOCKED_SCORE;
                }
            }
        }
    }

    Tensor::from_vec(data, (batch, 1, tgt_len, tgt_len), target.device())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn ids(data: &[u32], shape: (usize, usize)) -> Tensor {
        Tensor::from_vec(data.to_vec(), shape, &Device::Cpu).unwrap()
    }

    #[test]
    fn source_mask_blocks_exactly_the_pad_positions() {
        let src = ids(&[5, 12, 7, 0, 0], (1, 5));
        let mask = source_padding_mask(&src, 0).unwrap();
        assert_eq!(mask.dims(), &[1, 1, 1, 5]);

        let values = mask.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(&values[..3], &[0.0, 0.0, 0.0]);
        assert_eq!(&values[3..], &[BLOCKED_SCORE, BLOCKED_SCORE]);
    }

    #[test]
    fn target_mask_is_lower_triangular_over_valid_tokens() {
        let tgt = ids(&[1, 3, 9], (1, 3));
        let mask = target_mask(&tgt, 0).unwrap();
        assert_eq!(mask.dims(), &[1, 1, 3, 3]);

        let values = mask.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        // Row-major [q][k]: future keys blocked, everything else open.
        let expected = [
            0.0,
            BLOCKED_SCORE,
            BLOCKED_SCORE,
            0.0,
            0.0,
            BLOCKED_SCORE,
            0.0,
            0.0,
            0.0,
        ];
        assert_eq!(values, expected);
    }

    #[test]
    fn target_mask_blocks_pad_keys_in_every_row() {
        let tgt = ids(&[1, 3, 0, 0], (1, 4));
        let mask = target_mask(&tgt, 0).unwrap();
        let values = mask.flatten_all().unwrap().to_vec1::<f32>().unwrap();

        for q in 0..4 {
            for k in 2..4 {
                assert_eq!(
                    values[q * 4 + k],
                    BLOCKED_SCORE,
                    "pad key {} must be blocked for query {}",
                    k,
                    q
                );
            }
        }
        // Valid prefix stays causal.
        assert_eq!(values[0], 0.0);
        assert_eq!(values[1], BLOCKED_SCORE);
        assert_eq!(values[4], 0.0);
        assert_eq!(values[5], 0.0);
    }
}
