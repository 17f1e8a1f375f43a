pub mod attention;
pub mod fused_layer;
pub mod gated_cross_attention;
pub mod mask;
pub mod mlp;
pub mod rotary;

pub use attention::{cached_self_attention, repeat_kv};
pub use fused_layer::{DecoderLayerForward, FusedDecoderLayer};
pub use gated_cross_attention::GatedCrossAttention;
pub use mask::causal_mask;
pub use mlp::SwiGluMlp;
pub use rotary::RotaryEmbedding;
