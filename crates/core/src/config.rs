use serde::Deserialize;

use crate::error::FlamingoError;

/// Geometry of the wrapped text decoder.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    pub hidden_size: usize,
    pub num_attention_heads: usize,
    pub num_key_value_heads: usize,
    pub num_hidden_layers: usize,
    pub intermediate_size: usize,
    pub vocab_size: usize,
    pub max_position_embeddings: usize,
    pub head_dim: usize,
    pub rms_norm_eps: f64,
    pub rope_theta: f64,
    #[serde(default)]
    pub tie_word_embeddings: bool,

    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            hidden_size: 4096,
            num_attention_heads: 32,
            num_key_value_heads: 8,
            num_hidden_layers: 32,
            intermediate_size: 11008,
            vocab_size: 32000,
            max_position_embeddings: 4096,
            head_dim: 128,
            rms_norm_eps: 1e-6,
            rope_theta: 10000.0,
            tie_word_embeddings: false,
            extra: serde_json::Map::new(),
        }
    }
}

/// Configuration for the gated cross-attention fusion.
#[derive(Debug, Clone, Deserialize)]
pub struct FusionConfig {
    /// Token id marking media placeholder positions in the text sequence.
    pub media_token_id: u32,
    /// Hidden size of the visual features attended to by the fused layers.
    pub vis_hidden_size: usize,
    /// Every Nth decoder layer (1-based) receives a cross-attention sublayer.
    /// Larger values trade fusion frequency for compute and memory.
    #[serde(default = "default_cross_attn_every_n_layers")]
    pub cross_attn_every_n_layers: usize,
    /// Width multiplier of the gated feed-forward inside each fused block.
    #[serde(default = "default_cross_attn_ff_mult")]
    pub cross_attn_ff_mult: usize,
}

fn default_cross_attn_every_n_layers() -> usize {
    1
}

fn default_cross_attn_ff_mult() -> usize {
    4
}

impl FusionConfig {
    pub fn new(media_token_id: u32, vis_hidden_size: usize) -> Self {
        Self {
            media_token_id,
            vis_hidden_size,
            cross_attn_every_n_layers: default_cross_attn_every_n_layers(),
            cross_attn_ff_mult: default_cross_attn_ff_mult(),
        }
    }

    pub fn with_cross_attn_every_n_layers(mut self, n: usize) -> Self {
        self.cross_attn_every_n_layers = n;
        self
    }

    pub fn validate(&self) -> Result<(), FlamingoError> {
        if self.cross_attn_every_n_layers == 0 {
            return Err(FlamingoError::InvalidConfig(
                "cross_attn_every_n_layers must be at least 1".to_string(),
            ));
        }
        if self.vis_hidden_size == 0 {
            return Err(FlamingoError::InvalidConfig(
                "vis_hidden_size must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TINY_LLAMA_CONFIG: &str = r#"{
        "hidden_size": 64,
        "num_attention_heads": 4,
        "num_key_value_heads": 2,
        "num_hidden_layers": 4,
        "intermediate_size": 128,
        "vocab_size": 256,
        "max_position_embeddings": 512,
        "head_dim": 16,
        "rms_norm_eps": 1e-05,
        "rope_theta": 10000.0,
        "tie_word_embeddings": true,
        "model_type": "llama"
    }"#;

    #[test]
    fn parse_model_config() {
        let config: ModelConfig =
            serde_json::from_str(TINY_LLAMA_CONFIG).expect("failed to parse config");

        assert_eq!(config.hidden_size, 64);
        assert_eq!(config.num_attention_heads, 4);
        assert_eq!(config.num_key_value_heads, 2);
        assert_eq!(config.num_hidden_layers, 4);
        assert_eq!(config.vocab_size, 256);
        assert_eq!(config.head_dim, 16);
        assert!(config.tie_word_embeddings);
        assert_eq!(
            config.extra.get("model_type").and_then(|v| v.as_str()),
            Some("llama")
        );
    }

    #[test]
    fn parse_fusion_config_with_defaults() {
        let config: FusionConfig = serde_json::from_str(
            r#"{"media_token_id": 50000, "vis_hidden_size": 1024}"#,
        )
        .expect("failed to parse fusion config");

        assert_eq!(config.media_token_id, 50000);
        assert_eq!(config.vis_hidden_size, 1024);
        assert_eq!(config.cross_attn_every_n_layers, 1);
        assert_eq!(config.cross_attn_ff_mult, 4);
    }

    #[test]
    fn fusion_config_rejects_zero_stride() {
        let config = FusionConfig::new(50000, 64).with_cross_attn_every_n_layers(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn fusion_config_accepts_stride_one() {
        let config = FusionConfig::new(50000, 64);
        assert!(config.validate().is_ok());
    }
}
