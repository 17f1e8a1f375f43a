//! Decoder-layer wrapper that conditionally runs gated cross-attention.
//!
//! Wraps one decoder layer together with an optional [`GatedCrossAttention`]
//! sublayer. Layers without a sublayer pass through untouched; fused layers
//! must be conditioned with visual features and media locations before every
//! forward pass. The orchestrator pushes that state; the wrapper only reads it.

use candle_core::Tensor;

use crate::error::FlamingoError;
use crate::layers::gated_cross_attention::GatedCrossAttention;

/// Forward contract of a wrapped decoder layer.
///
/// The layer attends over text only and knows nothing about fusion; the
/// wrapper calls it with the (possibly fused) hidden states and the unchanged
/// attention mask and position offset.
pub trait DecoderLayerForward {
    fn forward(
        &mut self,
        xs: &Tensor,
        attention_mask: Option<&Tensor>,
        seqlen_offset: usize,
    ) -> candle_core::Result<Tensor>;

    fn clear_kv_cache(&mut self) {}
}

pub struct FusedDecoderLayer<L> {
    cross_attn: Option<GatedCrossAttention>,
    decoder_layer: L,
    vis_x: Option<Tensor>,
    media_locations: Option<Tensor>,
    use_cached_media: bool,
}

impl<L: DecoderLayerForward> FusedDecoderLayer<L> {
    pub fn new(decoder_layer: L, cross_attn: Option<GatedCrossAttention>) -> Self {
        Self {
            cross_attn,
            decoder_layer,
            vis_x: None,
            media_locations: None,
            use_cached_media: false,
        }
    }

    /// Whether a cross-attention sublayer is paired with this layer.
    pub fn has_cross_attention(&self) -> bool {
        self.cross_attn.is_some()
    }

    /// Attach a cross-attention sublayer. Structural, done once at fusion
    /// initialization; unrelated to the per-call conditioning state.
    pub(crate) fn attach_cross_attention(&mut self, cross_attn: GatedCrossAttention) {
        self.cross_attn = Some(cross_attn);
    }

    /// Set or clear the visual features for the current forward pass. The
    /// tensor handle shares storage with every other layer it is pushed to.
    pub fn condition_visual_features(&mut self, vis_x: Option<Tensor>) {
        self.vis_x = vis_x;
    }

    /// Set or clear the media-location mask for the current forward pass.
    pub fn condition_media_locations(&mut self, media_locations: Option<Tensor>) {
        self.media_locations = media_locations;
    }

    pub fn condition_use_cached_media(&mut self, use_cached_media: bool) {
        self.use_cached_media = use_cached_media;
    }

    /// The currently conditioned media-location mask, if any.
    pub fn media_locations(&self) -> Option<&Tensor> {
        self.media_locations.as_ref()
    }

    pub fn use_cached_media(&self) -> bool {
        self.use_cached_media
    }

    /// True iff both visual features and media locations are currently set.
    pub fn is_conditioned(&self) -> bool {
        self.vis_x.is_some() && self.media_locations.is_some()
    }

    /// Clear all conditioning state and the sublayer's media cache.
    pub fn clear_conditioning(&mut self) {
        self.vis_x = None;
        self.media_locations = None;
        self.use_cached_media = false;
        if let Some(cross_attn) = self.cross_attn.as_mut() {
            cross_attn.reset_media_cache();
        }
    }

    pub fn clear_kv_cache(&mut self) {
        self.decoder_layer.clear_kv_cache();
    }

    /// Run the fusion step (if paired and conditioned) followed by the
    /// wrapped decoder layer.
    ///
    /// Fails rather than silently skipping fusion: a paired sublayer with
    /// missing conditioning is a protocol violation on the caller's side.
    /// The media-location mask may be absent only when `use_cached_media`
    /// is set, in which case the sublayer replays its cached media state.
    pub fn forward(
        &mut self,
        xs: &Tensor,
        attention_mask: Option<&Tensor>,
        seqlen_offset: usize,
    ) -> Result<Tensor, FlamingoError> {
        let Some(cross_attn) = self.cross_attn.as_mut() else {
            return Ok(self.decoder_layer.forward(xs, attention_mask, seqlen_offset)?);
        };

        let vis_x = self
            .vis_x
            .as_ref()
            .ok_or(FlamingoError::MissingVisualFeatures)?;
        if self.media_locations.is_none() && !self.use_cached_media {
            return Err(FlamingoError::MissingMediaLocations);
        }

        let fused = cross_attn.forward(
            xs,
            vis_x,
            self.media_locations.as_ref(),
            self.use_cached_media,
        )?;
        Ok(self
            .decoder_layer
            .forward(&fused, attention_mask, seqlen_offset)?)
    }
}
