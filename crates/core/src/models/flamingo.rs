//! Orchestration of gated cross-attention fusion over a wrapped text decoder.
//!
//! [`FlamingoLm`] owns the decoder stack with every layer wrapped in a
//! [`FusedDecoderLayer`]. On each forward call it computes the media-location
//! mask from the input token ids, decides whether attention should fall back
//! to cached media (incremental generation steps carry no media tokens), and
//! pushes that state to every layer before delegating to the stack's own
//! forward logic. Conditioning persists across calls within one generation
//! episode; only an explicit [`FlamingoLm::clear_conditioned_layers`] resets it.

use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{Embedding, Linear, RmsNorm, VarBuilder};
use tracing::{debug, trace};

use crate::config::{FusionConfig, ModelConfig};
use crate::error::FlamingoError;
use crate::layers::mask::{causal_mask, has_media, media_locations};
use crate::layers::{FusedDecoderLayer, GatedCrossAttention};

use super::decoder::{TextDecoder, TextDecoderLayer};

pub struct FlamingoLm {
    embed_tokens: Embedding,
    layers: Vec<FusedDecoderLayer<TextDecoderLayer>>,
    norm: RmsNorm,
    lm_head: Linear,
    config: ModelConfig,
    media_token_id: u32,
    initialized: bool,
    generating: bool,
    device: Device,
    dtype: DType,
}

impl FlamingoLm {
    /// Wrap a text decoder. Every layer starts unfused; call
    /// [`FlamingoLm::init_fusion`] to attach the cross-attention sublayers.
    pub fn new(decoder: TextDecoder) -> Self {
        let (embed_tokens, layers, norm, lm_head, config, device, dtype) = decoder.into_parts();
        let layers = layers
            .into_iter()
            .map(|layer| FusedDecoderLayer::new(layer, None))
            .collect();
        Self {
            embed_tokens,
            layers,
            norm,
            lm_head,
            config,
            media_token_id: 0,
            initialized: false,
            generating: false,
            device,
            dtype,
        }
    }

    /// One-time fusion setup: attach a freshly constructed gated
    /// cross-attention sublayer to every Nth layer (1-based) and record the
    /// media token id. Must run before the first forward call.
    pub fn init_fusion(
        &mut self,
        fusion: &FusionConfig,
        vb: VarBuilder,
    ) -> Result<(), FlamingoError> {
        if self.initialized {
            return Err(FlamingoError::AlreadyInitialized);
        }
        fusion.validate()?;

        let vb_x = vb.pp("gated_cross_attn_layers");
        let mut num_fused = 0;
        for (layer_idx, layer) in self.layers.iter_mut().enumerate() {
            if (layer_idx + 1) % fusion.cross_attn_every_n_layers != 0 {
                continue;
            }
            let cross_attn = GatedCrossAttention::new(
                self.config.hidden_size,
                fusion.vis_hidden_size,
                self.config.num_attention_heads,
                fusion.cross_attn_ff_mult,
                vb_x.pp(layer_idx),
            )?;
            layer.attach_cross_attention(cross_attn);
            num_fused += 1;
        }

        self.media_token_id = fusion.media_token_id;
        self.initialized = true;
        debug!(
            num_fused,
            num_layers = self.layers.len(),
            media_token_id = fusion.media_token_id,
            "initialized gated cross-attention fusion"
        );
        Ok(())
    }

    /// Condition the fusion layers on the media locations, then run the
    /// decoder stack.
    ///
    /// Visual features must already have been pushed through
    /// [`FlamingoLm::condition_visual_features`]; this call only derives and
    /// distributes the location mask and the cached-media flag.
    pub fn forward(
        &mut self,
        input_ids: &Tensor,
        seqlen_offset: usize,
    ) -> Result<Tensor, FlamingoError> {
        if !self.initialized {
            return Err(FlamingoError::NotInitialized);
        }

        let locations = media_locations(input_ids, self.media_token_id)?;

        // Incremental generation steps carry no media tokens. Overwriting the
        // live mask with an all-false one would sever attention to the image,
        // so keep the previous mask and replay the cached media instead.
        let use_cached_media =
            self.generating && self.is_conditioned() && !has_media(&locations)?;
        if use_cached_media {
            trace!("no media tokens in input, attending to cached media");
        }

        // State is fully pushed to every layer before the stack runs.
        for layer in self.layers.iter_mut() {
            if !use_cached_media {
                layer.condition_media_locations(Some(locations.clone()));
            }
            layer.condition_use_cached_media(use_cached_media);
        }

        self.forward_inner(input_ids, seqlen_offset)
    }

    /// The wrapped stack's own forward logic, unchanged: embedding, layer
    /// loop, final norm, lm head. Mirrors [`TextDecoder::forward`].
    fn forward_inner(
        &mut self,
        input_ids: &Tensor,
        seqlen_offset: usize,
    ) -> Result<Tensor, FlamingoError> {
        let (_b_sz, seq_len) = input_ids.dims2()?;
        let attention_mask = if seq_len <= 1 {
            None
        } else {
            Some(causal_mask(seq_len, seqlen_offset, self.dtype, &self.device)?)
        };

        let mut xs = self.embed_tokens.forward(input_ids)?;
        for layer in self.layers.iter_mut() {
            xs = layer.forward(&xs, attention_mask.as_ref(), seqlen_offset)?;
        }
        let xs = self.norm.forward(&xs)?;
        Ok(xs.apply(&self.lm_head)?)
    }

    /// Broadcast the visual features to every layer. The tensor handle is
    /// shared, not copied; callers must not mutate it while a forward call is
    /// in flight.
    pub fn condition_visual_features(&mut self, vis_x: &Tensor) {
        for layer in self.layers.iter_mut() {
            layer.condition_visual_features(Some(vis_x.clone()));
        }
    }

    /// Whether every layer has both visual features and media locations set.
    pub fn is_conditioned(&self) -> bool {
        self.layers.iter().all(|layer| layer.is_conditioned())
    }

    /// Clear conditioning state and cached media on every layer. Call between
    /// independent generations; conditioning never expires on its own.
    pub fn clear_conditioned_layers(&mut self) {
        debug!("clearing conditioned layers");
        for layer in self.layers.iter_mut() {
            layer.clear_conditioning();
        }
    }

    /// Toggle incremental-generation mode. While set, forward calls whose
    /// input contains no media tokens keep attending to the cached media.
    pub fn set_generating(&mut self, generating: bool) {
        self.generating = generating;
    }

    pub fn generating(&self) -> bool {
        self.generating
    }

    /// Reset the text decoder's self-attention caches between sequences.
    pub fn clear_kv_cache(&mut self) {
        for layer in self.layers.iter_mut() {
            layer.clear_kv_cache();
        }
    }

    pub fn layers(&self) -> &[FusedDecoderLayer<TextDecoderLayer>] {
        &self.layers
    }

    pub fn media_token_id(&self) -> u32 {
        self.media_token_id
    }

    pub fn device(&self) -> &Device {
        &self.device
    }
}
