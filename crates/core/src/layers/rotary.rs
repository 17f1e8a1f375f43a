use candle_core::{DType, Device, Result, Tensor};

pub struct RotaryEmbedding {
    sin: Tensor,
    cos: Tensor,
}

impl RotaryEmbedding {
    pub fn new(
        head_dim: usize,
        max_seq_len: usize,
        rope_theta: f64,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        let inv_freq: Vec<f32> = (0..head_dim)
            .step_by(2)
            .map(|i| 1.0 / (rope_theta as f32).powf(i as f32 / head_dim as f32))
            .collect();
        let inv_freq_len = inv_freq.len();
        let inv_freq =
            Tensor::from_vec(inv_freq, (1, inv_freq_len), device)?.to_dtype(DType::F32)?;
        let t = Tensor::arange(0u32, max_seq_len as u32, device)?
            .to_dtype(DType::F32)?
            .reshape((max_seq_len, 1))?;
        let freqs = t.matmul(&inv_freq)?;
        Ok(Self {
            sin: freqs.sin()?.to_dtype(dtype)?,
            cos: freqs.cos()?.to_dtype(dtype)?,
        })
    }

    pub fn apply(&self, q: &Tensor, k: &Tensor, seqlen_offset: usize) -> Result<(Tensor, Tensor)> {
        let (_b, _h, seq_len, _d) = q.dims4()?;
        let cos = self.cos.narrow(0, seqlen_offset, seq_len)?;
        let sin = self.sin.narrow(0, seqlen_offset, seq_len)?;
        let q = candle_nn::rotary_emb::rope(&q.contiguous()?, &cos, &sin)?;
        let k = candle_nn::rotary_emb::rope(&k.contiguous()?, &cos, &sin)?;
        Ok((q, k))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sin_cos_shapes() {
        let rope = RotaryEmbedding::new(64, 128, 10000.0, DType::F32, &Device::Cpu)
            .expect("failed to create rotary embedding");
        assert_eq!(rope.sin.dims(), &[128, 32]);
        assert_eq!(rope.cos.dims(), &[128, 32]);
    }

    #[test]
    fn position_zero_is_identity_angle() {
        let rope = RotaryEmbedding::new(64, 16, 10000.0, DType::F32, &Device::Cpu)
            .expect("failed to create rotary embedding");

        let cos0: Vec<f32> = rope
            .cos
            .narrow(0, 0, 1)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        let sin0: Vec<f32> = rope
            .sin
            .narrow(0, 0, 1)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();

        assert!(cos0.iter().all(|&c| (c - 1.0).abs() < 1e-5));
        assert!(sin0.iter().all(|&s| s.abs() < 1e-5));
    }

    #[test]
    fn apply_preserves_shapes_with_offset() {
        let rope = RotaryEmbedding::new(32, 128, 10000.0, DType::F32, &Device::Cpu)
            .expect("failed to create rotary embedding");

        let q = Tensor::randn(0.0f32, 1.0, (1, 4, 8, 32), &Device::Cpu).unwrap();
        let k = Tensor::randn(0.0f32, 1.0, (1, 4, 8, 32), &Device::Cpu).unwrap();

        let (q_rot, k_rot) = rope.apply(&q, &k, 10).expect("rope apply failed");
        assert_eq!(q_rot.dims(), &[1, 4, 8, 32]);
        assert_eq!(k_rot.dims(), &[1, 4, 8, 32]);
    }
}
