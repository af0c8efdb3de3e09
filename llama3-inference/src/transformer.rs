#[cfg(test)]
#[path = "../tests/unit/transformer_test.rs"]
mod transformer_test;

use anyhow::Result;
use rayon::prelude::*;

use crate::Llama;
use crate::configuration::Configuration;
use crate::ops::{add_in_place, map_in_place, multiply_in_place, rmsnorm, rmsnorm_in_place, saxpy_in_place, silu, softmax_in_place};
use crate::state::InferenceState;
use crate::weights::{LayerWeights, RopeTables, Weights};

/// Runs one transformer step for `token` at `position` and returns the logits.
///
/// **Process Flow:**
/// 1. **Token Embedding**: copy the token's embedding row into the activation
/// 2. **Decoder Layers**: attention and SwiGLU feed-forward, each with a residual connection
/// 3. **Final Normalization**: RMSNorm of the activation
/// 4. **Classification Head**: project to vocabulary logits
///
/// The key/value row for `position` is written to the cache, so `position` may not skip
/// ahead of the cache; running an earlier position again discards everything after it.
pub fn forward<'s>(llama: &Llama, state: &'s mut InferenceState, token: usize, position: usize) -> Result<&'s [f32]> {
    let config = llama.configuration();

    if token >= config.vocabulary_size {
        anyhow::bail!("Token {} is out of vocabulary range 0..{}", token, config.vocabulary_size);
    }
    if position >= config.context_length {
        anyhow::bail!("Position {} exceeds context length {}", position, config.context_length);
    }
    if !state.fits(config) {
        anyhow::bail!("Inference state was not created for this model configuration");
    }
    if position > state.position() {
        anyhow::bail!("Position {} would leave a gap: the cache holds {} positions", position, state.position());
    }

    let weights = llama.weights();
    llama.executor().install(|| run_layers(config, weights, state, token, position));
    state.commit(position);

    Ok(&state.logits)
}

fn run_layers(config: &Configuration, weights: &Weights, state: &mut InferenceState, token: usize, position: usize) {
    let dim = config.dim;

    weights.token_embedding_table.copy_to(token * dim, &mut state.x);

    for (layer_idx, layer) in weights.layers.iter().enumerate() {
        attention_block(config, layer, &weights.rope, layer_idx, position, state);
        feed_forward_block(config, layer, state);
    }

    rmsnorm_in_place(&mut state.x, &weights.rms_final_weight, config.rms_norm_eps);
    weights.classifier().matmul(&state.x, &mut state.logits, config.vocabulary_size, dim);
}

/// `x = x + Wo · Attention(RMSNorm(x))`
fn attention_block(
    config: &Configuration,
    layer: &LayerWeights,
    rope: &RopeTables,
    layer_idx: usize,
    position: usize,
    state: &mut InferenceState,
) {
    let dim = config.dim;
    let kv_dim = config.kv_dim();

    rmsnorm(&mut state.xb, &state.x, &layer.rms_att_weight, config.rms_norm_eps);

    layer.wq.matmul(&state.xb, &mut state.q, dim, dim);
    layer.wk.matmul(&state.xb, &mut state.k, kv_dim, dim);
    layer.wv.matmul(&state.xb, &mut state.v, kv_dim, dim);

    apply_rope(rope, &mut state.q, &mut state.k, position, config.head_size());

    let row = position * kv_dim..(position + 1) * kv_dim;
    state.key_cache[layer_idx][row.clone()].copy_from_slice(&state.k);
    state.value_cache[layer_idx][row].copy_from_slice(&state.v);

    compute_attention(config, layer_idx, position, state);

    layer.wo.matmul(&state.xb, &mut state.xb2, dim, dim);
    add_in_place(&mut state.x, &state.xb2);
}

/// Rotates adjacent dimension pairs of every query head, and of keys within `k.len()`.
fn apply_rope(rope: &RopeTables, q: &mut [f32], k: &mut [f32], position: usize, head_size: usize) {
    let kv_dim = k.len();

    for i in (0..q.len()).step_by(2) {
        let (fcr, fci) = rope.get(position, (i % head_size) / 2);

        rotate_pair(&mut q[i..i + 2], fcr, fci);
        if i < kv_dim {
            rotate_pair(&mut k[i..i + 2], fcr, fci);
        }
    }
}

#[inline]
fn rotate_pair(pair: &mut [f32], fcr: f32, fci: f32) {
    let (v0, v1) = (pair[0], pair[1]);
    pair[0] = v0 * fcr - v1 * fci;
    pair[1] = v0 * fci + v1 * fcr;
}

/// Scaled dot-product attention over cached positions `0..=position`, one task per head.
///
/// Query head `h` reads key/value head `h / kv_mul`; each task owns its score row and its
/// output slice of `xb`.
fn compute_attention(config: &Configuration, layer_idx: usize, position: usize, state: &mut InferenceState) {
    let head_size = config.head_size();
    let kv_dim = config.kv_dim();
    let kv_mul = config.kv_mul();
    let context_length = state.context_length();
    let attention_scale = (head_size as f32).sqrt().recip();

    let InferenceState { q, xb, att, key_cache, value_cache, .. } = state;
    let q = &q[..];
    let key_cache = &key_cache[layer_idx][..];
    let value_cache = &value_cache[layer_idx][..];

    att.par_chunks_mut(context_length)
        .zip(xb.par_chunks_mut(head_size))
        .enumerate()
        .for_each(|(head_idx, (att_row, xb_slice))| {
            let q_head = &q[head_idx * head_size..(head_idx + 1) * head_size];
            let kv_offset = (head_idx / kv_mul) * head_size;
            let scores = &mut att_row[..=position];

            scores.iter_mut().enumerate().for_each(|(time_step, score)| {
                let k_start = time_step * kv_dim + kv_offset;
                *score = q_head
                    .iter()
                    .zip(&key_cache[k_start..k_start + head_size])
                    .map(|(&q_val, &k_val)| q_val * k_val)
                    .sum::<f32>()
                    * attention_scale;
            });

            softmax_in_place(scores);

            xb_slice.fill(0.0);
            for (time_step, &weight) in scores.iter().enumerate() {
                let v_start = time_step * kv_dim + kv_offset;
                saxpy_in_place(xb_slice, &value_cache[v_start..v_start + head_size], weight);
            }
        });
}

/// `x = x + W2 · (SiLU(W1 · RMSNorm(x)) ⊙ (W3 · RMSNorm(x)))`
fn feed_forward_block(config: &Configuration, layer: &LayerWeights, state: &mut InferenceState) {
    let Configuration { dim, hidden_dim, .. } = *config;

    rmsnorm(&mut state.xb, &state.x, &layer.rms_ffn_weight, config.rms_norm_eps);

    layer.w1.matmul(&state.xb, &mut state.hb, hidden_dim, dim);
    layer.w3.matmul(&state.xb, &mut state.hb2, hidden_dim, dim);

    map_in_place(&mut state.hb, silu);
    multiply_in_place(&mut state.hb, &state.hb2);

    layer.w2.matmul(&state.hb, &mut state.xb, dim, hidden_dim);
    add_in_place(&mut state.x, &state.xb);
}
