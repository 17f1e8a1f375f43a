use candle_core::{DType, Device, Result, Tensor};

/// Finite fill value for masked attention logits. Keeps softmax well-defined
/// on rows where every key is masked; those rows are zeroed after softmax.
pub const MASKED_LOGIT: f32 = -1e30;

/// Generate a causal attention mask for decoder-only models.
/// Returns shape [1, 1, seq_len, seq_len + seqlen_offset].
pub fn causal_mask(
    seq_len: usize,
    seqlen_offset: usize,
    dtype: DType,
    device: &Device,
) -> Result<Tensor> {
    let total_len = seq_len + seqlen_offset;
    let mask: Vec<f32> = (0..seq_len)
        .flat_map(|i| {
            (0..total_len).map(move |j| {
                if j > i + seqlen_offset {
                    f32::NEG_INFINITY
                } else {
                    0.0
                }
            })
        })
        .collect();
    let mask = Tensor::from_vec(mask, (1, 1, seq_len, total_len), device)?;
    mask.to_dtype(dtype)
}

/// Boolean (u8) mask over token positions, true where the position holds the
/// media placeholder token. Shape matches `input_ids`: [batch, seq_len].
pub fn media_locations(input_ids: &Tensor, media_token_id: u32) -> Result<Tensor> {
    let (b_sz, seq_len) = input_ids.dims2()?;
    let ids = input_ids.to_vec2::<u32>()?;
    let mask: Vec<u8> = ids
        .iter()
        .flat_map(|row| row.iter().map(|&id| u8::from(id == media_token_id)))
        .collect();
    Tensor::from_vec(mask, (b_sz, seq_len), input_ids.device())
}

/// Whether any position in the mask is a media location.
pub fn has_media(media_locations: &Tensor) -> Result<bool> {
    let total = media_locations
        .to_dtype(DType::F32)?
        .sum_all()?
        .to_scalar::<f32>()?;
    Ok(total > 0.0)
}

/// Per-row running count of media tokens seen at or before each position.
/// A text position with count k belongs to media block k (1-based); k == 0
/// means no media precedes it.
pub fn media_cumulative_time(media_locations: &Tensor) -> Result<Vec<Vec<u32>>> {
    let rows = media_locations.to_vec2::<u8>()?;
    Ok(rows
        .iter()
        .map(|row| {
            let mut time = 0u32;
            row.iter()
                .map(|&m| {
                    if m != 0 {
                        time += 1;
                    }
                    time
                })
                .collect()
        })
        .collect())
}

/// Total number of media tokens per batch row.
pub fn media_token_counts(media_locations: &Tensor) -> Result<Vec<u32>> {
    let rows = media_locations.to_vec2::<u8>()?;
    Ok(rows
        .iter()
        .map(|row| row.iter().filter(|&&m| m != 0).count() as u32)
        .collect())
}

/// Build the text-to-media attention bias for gated cross-attention.
///
/// `text_time[b][i]` is the media-time of text position i (see
/// [`media_cumulative_time`]). A text position attends exactly to the latents
/// of its own media block; positions with media-time 0 attend to nothing.
///
/// Returns `(bias, keep)`:
/// - `bias`: [batch, 1, text_len, num_media * latents_per_media], 0 where
///   attention is allowed and [`MASKED_LOGIT`] elsewhere;
/// - `keep`: [batch, 1, text_len, 1], 1 for rows with a media block to attend
///   to and 0 for rows whose post-softmax attention must be zeroed.
pub fn media_time_mask(
    text_time: &[Vec<u32>],
    num_media: usize,
    latents_per_media: usize,
    dtype: DType,
    device: &Device,
) -> Result<(Tensor, Tensor)> {
    let b_sz = text_time.len();
    let text_len = text_time.first().map_or(0, Vec::len);
    let media_len = num_media * latents_per_media;

    let mut bias = Vec::with_capacity(b_sz * text_len * media_len);
    let mut keep = Vec::with_capacity(b_sz * text_len);
    for row in text_time {
        for &time in row {
            keep.push(if time == 0 { 0.0f32 } else { 1.0 });
            for key in 0..media_len {
                let media_time = (key / latents_per_media) as u32 + 1;
                bias.push(if time == media_time { 0.0 } else { MASKED_LOGIT });
            }
        }
    }

    let bias = Tensor::from_vec(bias, (b_sz, 1, text_len, media_len), device)?.to_dtype(dtype)?;
    let keep = Tensor::from_vec(keep, (b_sz, 1, text_len, 1), device)?.to_dtype(dtype)?;
    Ok((bias, keep))
}
