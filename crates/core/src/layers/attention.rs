use candle_core::{Result, Tensor};

/// Eager cached self-attention: append the new K/V to the running cache, then
/// compute GQA attention over the full history.
///
/// Expects Q, K, V already projected and reshaped to `[b, heads, seq, head_dim]`.
/// K and V carry `num_kv_heads` heads; Q carries `num_heads` heads. The cache
/// accumulates K/V along the sequence dimension across calls.
#[allow(clippy::too_many_arguments)]
pub fn cached_self_attention(
    q: &Tensor,
    k: Tensor,
    v: Tensor,
    attention_mask: Option<&Tensor>,
    kv_cache: &mut Option<(Tensor, Tensor)>,
    num_heads: usize,
    num_kv_heads: usize,
    head_dim: usize,
) -> Result<Tensor> {
    let (b_sz, _num_heads, q_len, _head_dim) = q.dims4()?;

    let (k, v) = match kv_cache {
        None => (k, v),
        Some((prev_k, prev_v)) => {
            let k = Tensor::cat(&[&*prev_k, &k], 2)?;
            let v = Tensor::cat(&[&*prev_v, &v], 2)?;
            (k, v)
        }
    };
    *kv_cache = Some((k.clone(), v.clone()));

    // GQA: repeat KV heads to match Q heads
    let num_kv_groups = num_heads / num_kv_heads;
    let k = repeat_kv(k, num_kv_groups)?.contiguous()?;
    let v = repeat_kv(v, num_kv_groups)?.contiguous()?;

    let scale = 1.0 / (head_dim as f64).sqrt();
    let attn_weights = (q.contiguous()?.matmul(&k.transpose(2, 3)?)? * scale)?;
    let attn_weights = match attention_mask {
        Some(mask) => attn_weights.broadcast_add(mask)?,
        None => attn_weights,
    };
    let attn_weights = candle_nn::ops::softmax_last_dim(&attn_weights)?;
    let attn_output = attn_weights.matmul(&v)?;

    attn_output
        .transpose(1, 2)?
        .contiguous()?
        .reshape((b_sz, q_len, num_heads * head_dim))
}

/// Repeat KV heads for Grouped Query Attention.
pub fn repeat_kv(x: Tensor, num_kv_groups: usize) -> Result<Tensor> {
    if num_kv_groups == 1 {
        return Ok(x);
    }
    let (b, num_kv_heads, s, d) = x.dims4()?;
    let num_heads = num_kv_heads * num_kv_groups;
    x.unsqueeze(2)?
        .expand((b, num_kv_heads, num_kv_groups, s, d))?
        .reshape((b, num_heads, s, d))
}
