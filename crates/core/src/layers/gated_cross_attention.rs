//! Tanh-gated masked cross-attention from text hidden states to visual features.
//!
//! Each fused decoder layer runs this block before its wrapped decoder layer.
//! A text position attends only to the latents of the media block that most
//! recently preceded it in the token sequence; positions with no preceding
//! media attend to nothing. Both residual branches are gated by `tanh` of a
//! zero-initialized scalar, so an untrained block is an exact identity over
//! the text stream.
//!
//! The block caches projected visual K/V and per-row media counts on every
//! mediated forward. During incremental generation the inputs no longer
//! contain media tokens; `use_cached_media` replays attention to the most
//! recent cached media block for every new position.

use candle_core::{Module, Tensor, D};
use candle_nn::{layer_norm, linear_no_bias, LayerNorm, Linear, VarBuilder};

use crate::error::FlamingoError;
use crate::layers::mask::{media_cumulative_time, media_time_mask, media_token_counts};

struct MediaCache {
    /// Projected keys, [batch, heads, num_media * latents, head_dim].
    k: Tensor,
    /// Projected values, same shape as `k`.
    v: Tensor,
    /// Media tokens seen per batch row at the time of projection.
    media_counts: Vec<u32>,
    num_media: usize,
    latents_per_media: usize,
}

pub struct GatedCrossAttention {
    norm: LayerNorm,
    to_q: Linear,
    to_kv: Linear,
    to_out: Linear,
    attn_gate: Tensor,
    ff_norm: LayerNorm,
    ff_up: Linear,
    ff_down: Linear,
    ff_gate: Tensor,
    num_heads: usize,
    head_dim: usize,
    scale: f64,
    media_cache: Option<MediaCache>,
}

impl GatedCrossAttention {
    /// Create a gated cross-attention block.
    ///
    /// # Arguments
    /// * `hidden_size` - Text hidden dimension (must be divisible by `num_heads`)
    /// * `vis_hidden_size` - Visual feature dimension projected into K/V
    /// * `num_heads` - Number of attention heads
    /// * `ff_mult` - Width multiplier of the gated feed-forward
    pub fn new(
        hidden_size: usize,
        vis_hidden_size: usize,
        num_heads: usize,
        ff_mult: usize,
        vb: VarBuilder,
    ) -> candle_core::Result<Self> {
        let head_dim = hidden_size / num_heads;
        let inner_dim = num_heads * head_dim;
        let scale = 1.0 / (head_dim as f64).sqrt();

        let norm = layer_norm(hidden_size, 1e-5, vb.pp("norm"))?;
        let to_q = linear_no_bias(hidden_size, inner_dim, vb.pp("to_q"))?;
        let to_kv = linear_no_bias(vis_hidden_size, 2 * inner_dim, vb.pp("to_kv"))?;
        let to_out = linear_no_bias(inner_dim, hidden_size, vb.pp("to_out"))?;
        let attn_gate = vb.get_with_hints((1,), "attn_gate", candle_nn::Init::Const(0.0))?;

        let vb_ff = vb.pp("ff");
        let ff_norm = layer_norm(hidden_size, 1e-5, vb_ff.pp("norm"))?;
        let ff_up = linear_no_bias(hidden_size, ff_mult * hidden_size, vb_ff.pp("up_proj"))?;
        let ff_down = linear_no_bias(ff_mult * hidden_size, hidden_size, vb_ff.pp("down_proj"))?;
        let ff_gate = vb.get_with_hints((1,), "ff_gate", candle_nn::Init::Const(0.0))?;

        Ok(Self {
            norm,
            to_q,
            to_kv,
            to_out,
            attn_gate,
            ff_norm,
            ff_up,
            ff_down,
            ff_gate,
            num_heads,
            head_dim,
            scale,
            media_cache: None,
        })
    }

    /// Fuse visual features into the text hidden states.
    ///
    /// # Arguments
    /// * `xs` - Text hidden states `[batch, text_len, hidden_size]`
    /// * `vis_x` - Visual features `[batch, num_media, latents, vis_hidden_size]`
    /// * `media_locations` - Boolean mask over text positions; required unless
    ///   `use_cached_media` is set
    /// * `use_cached_media` - Attend to the most recently cached media instead
    ///   of recomputing locations from the current input
    pub fn forward(
        &mut self,
        xs: &Tensor,
        vis_x: &Tensor,
        media_locations: Option<&Tensor>,
        use_cached_media: bool,
    ) -> Result<Tensor, FlamingoError> {
        let (b_sz, text_len, _) = xs.dims3()?;

        let q = self
            .to_q
            .forward(&self.norm.forward(xs)?)?
            .reshape((b_sz, text_len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?;

        let (k, v, bias, keep) = if use_cached_media {
            let cache = self
                .media_cache
                .as_ref()
                .ok_or(FlamingoError::NoCachedMedia)?;
            // Every current position attends to the latest cached media block.
            let text_time: Vec<Vec<u32>> = cache
                .media_counts
                .iter()
                .map(|&count| vec![count; text_len])
                .collect();
            let (bias, keep) = media_time_mask(
                &text_time,
                cache.num_media,
                cache.latents_per_media,
                xs.dtype(),
                xs.device(),
            )?;
            (cache.k.clone(), cache.v.clone(), bias, keep)
        } else {
            let locations = media_locations.ok_or(FlamingoError::MissingMediaLocations)?;
            let loc_len = locations.dim(1)?;
            if loc_len != text_len {
                return Err(candle_core::Error::Msg(format!(
                    "media locations cover {loc_len} positions but text has {text_len}"
                ))
                .into());
            }

            let (vis_b, num_media, latents_per_media, _) = vis_x.dims4()?;
            let media = vis_x.reshape((vis_b, num_media * latents_per_media, ()))?;
            let inner_dim = self.num_heads * self.head_dim;
            let kv = self.to_kv.forward(&media)?;
            let k = kv
                .narrow(D::Minus1, 0, inner_dim)?
                .reshape((vis_b, num_media * latents_per_media, self.num_heads, self.head_dim))?
                .transpose(1, 2)?
                .contiguous()?;
            let v = kv
                .narrow(D::Minus1, inner_dim, inner_dim)?
                .reshape((vis_b, num_media * latents_per_media, self.num_heads, self.head_dim))?
                .transpose(1, 2)?
                .contiguous()?;

            let text_time = media_cumulative_time(locations)?;
            let (bias, keep) = media_time_mask(
                &text_time,
                num_media,
                latents_per_media,
                xs.dtype(),
                xs.device(),
            )?;

            self.media_cache = Some(MediaCache {
                k: k.clone(),
                v: v.clone(),
                media_counts: media_token_counts(locations)?,
                num_media,
                latents_per_media,
            });
            (k, v, bias, keep)
        };

        let attn_weights = (q.contiguous()?.matmul(&k.transpose(2, 3)?)? * self.scale)?;
        let attn_weights = attn_weights.broadcast_add(&bias)?;
        let attn_weights = candle_nn::ops::softmax_last_dim(&attn_weights)?;
        // Zero the rows of positions with no media to attend to.
        let attn_weights = attn_weights.broadcast_mul(&keep)?;
        let attn_output = attn_weights
            .matmul(&v)?
            .transpose(1, 2)?
            .contiguous()?
            .reshape((b_sz, text_len, self.num_heads * self.head_dim))?;
        let attn_output = self.to_out.forward(&attn_output)?;

        let xs = (xs + attn_output.broadcast_mul(&self.attn_gate.tanh()?)?)?;

        let ff_output = self
            .ff_norm
            .forward(&xs)?
            .apply(&self.ff_up)?
            .apply(&candle_nn::Activation::Gelu)?
            .apply(&self.ff_down)?;
        let xs = (&xs + ff_output.broadcast_mul(&self.ff_gate.tanh()?)?)?;

        Ok(xs)
    }

    /// Drop the cached media K/V and counts.
    pub fn reset_media_cache(&mut self) {
        self.media_cache = None;
    }

    pub fn has_cached_media(&self) -> bool {
        self.media_cache.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    fn block(hidden: usize, vis: usize, heads: usize) -> GatedCrossAttention {
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        GatedCrossAttention::new(hidden, vis, heads, 2, vb).expect("failed to build block")
    }

    fn locations(rows: Vec<Vec<u8>>) -> Tensor {
        let b = rows.len();
        let s = rows[0].len();
        let flat: Vec<u8> = rows.into_iter().flatten().collect();
        Tensor::from_vec(flat, (b, s), &Device::Cpu).unwrap()
    }

    #[test]
    fn zero_gates_make_block_identity() {
        let mut block = block(32, 16, 4);
        let xs = Tensor::randn(0.0f32, 1.0, (1, 5, 32), &Device::Cpu).unwrap();
        let vis_x = Tensor::randn(0.0f32, 1.0, (1, 2, 3, 16), &Device::Cpu).unwrap();
        let locs = locations(vec![vec![0, 0, 1, 1, 0]]);

        let out = block
            .forward(&xs, &vis_x, Some(&locs), false)
            .expect("forward failed");

        let xs: Vec<f32> = xs.flatten_all().unwrap().to_vec1().unwrap();
        let out: Vec<f32> = out.flatten_all().unwrap().to_vec1().unwrap();
        for (a, b) in xs.iter().zip(out.iter()) {
            assert!((a - b).abs() < 1e-6, "gated block should be identity at init");
        }
    }

    #[test]
    fn forward_caches_media_projections() {
        let mut block = block(32, 16, 4);
        let xs = Tensor::randn(0.0f32, 1.0, (1, 3, 32), &Device::Cpu).unwrap();
        let vis_x = Tensor::randn(0.0f32, 1.0, (1, 1, 4, 16), &Device::Cpu).unwrap();
        let locs = locations(vec![vec![1, 0, 0]]);

        assert!(!block.has_cached_media());
        block
            .forward(&xs, &vis_x, Some(&locs), false)
            .expect("forward failed");
        assert!(block.has_cached_media());

        let cache = block.media_cache.as_ref().unwrap();
        assert_eq!(cache.k.dims(), &[1, 4, 4, 8]);
        assert_eq!(cache.media_counts, vec![1]);
    }

    #[test]
    fn cached_media_path_runs_on_single_token() {
        let mut block = block(32, 16, 4);
        let xs = Tensor::randn(0.0f32, 1.0, (1, 3, 32), &Device::Cpu).unwrap();
        let vis_x = Tensor::randn(0.0f32, 1.0, (1, 2, 4, 16), &Device::Cpu).unwrap();
        let locs = locations(vec![vec![1, 1, 0]]);
        block
            .forward(&xs, &vis_x, Some(&locs), false)
            .expect("prefill forward failed");

        // Decode step: one token, no locations pushed, cached media replayed.
        let step = Tensor::randn(0.0f32, 1.0, (1, 1, 32), &Device::Cpu).unwrap();
        let out = block
            .forward(&step, &vis_x, None, true)
            .expect("cached forward failed");
        assert_eq!(out.dims(), &[1, 1, 32]);
    }

    #[test]
    fn cached_media_without_prior_forward_is_an_error() {
        let mut block = block(32, 16, 4);
        let xs = Tensor::randn(0.0f32, 1.0, (1, 1, 32), &Device::Cpu).unwrap();
        let vis_x = Tensor::randn(0.0f32, 1.0, (1, 1, 4, 16), &Device::Cpu).unwrap();

        let err = block.forward(&xs, &vis_x, None, true).unwrap_err();
        assert!(matches!(err, FlamingoError::NoCachedMedia));
    }

    #[test]
    fn fresh_forward_without_locations_is_an_error() {
        let mut block = block(32, 16, 4);
        let xs = Tensor::randn(0.0f32, 1.0, (1, 2, 32), &Device::Cpu).unwrap();
        let vis_x = Tensor::randn(0.0f32, 1.0, (1, 1, 4, 16), &Device::Cpu).unwrap();

        let err = block.forward(&xs, &vis_x, None, false).unwrap_err();
        assert!(matches!(err, FlamingoError::MissingMediaLocations));
    }

    #[test]
    fn mismatched_locations_length_is_an_error() {
        let mut block = block(32, 16, 4);
        let xs = Tensor::randn(0.0f32, 1.0, (1, 2, 32), &Device::Cpu).unwrap();
        let vis_x = Tensor::randn(0.0f32, 1.0, (1, 1, 4, 16), &Device::Cpu).unwrap();
        let locs = locations(vec![vec![1, 0, 0, 0, 0]]);

        assert!(block.forward(&xs, &vis_x, Some(&locs), false).is_err());
    }

    #[test]
    fn reset_drops_cached_media() {
        let mut block = block(32, 16, 4);
        let xs = Tensor::randn(0.0f32, 1.0, (1, 2, 32), &Device::Cpu).unwrap();
        let vis_x = Tensor::randn(0.0f32, 1.0, (1, 1, 2, 16), &Device::Cpu).unwrap();
        let locs = locations(vec![vec![1, 0]]);
        block
            .forward(&xs, &vis_x, Some(&locs), false)
            .expect("forward failed");

        block.reset_media_cache();
        assert!(!block.has_cached_media());
        let err = block.forward(&xs, &vis_x, None, true).unwrap_err();
        assert!(matches!(err, FlamingoError::NoCachedMedia));
    }
}
