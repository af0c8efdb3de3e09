#[cfg(test)]
#[path = "../tests/unit/state_test.rs"]
mod state_test;

use crate::configuration::Configuration;

/// Per-session runtime state: scratch buffers and the key/value cache.
///
/// Buffers are pre-allocated from the configuration and never resized. The cache holds
/// exactly the positions `[0, position())`; the forward pass writes a cache row and moves
/// the position counter in the same step.
#[derive(Debug)]
pub struct InferenceState {
    /// Activation at the current position
    /// Shape: [dim]
    pub x: Vec<f32>,
    /// Activation inside a residual branch
    /// Shape: [dim]
    pub xb: Vec<f32>,
    /// Shape: [dim]
    pub xb2: Vec<f32>,
    /// Feed-forward gate buffer
    /// Shape: [hidden_dim]
    pub hb: Vec<f32>,
    /// Feed-forward up buffer
    /// Shape: [hidden_dim]
    pub hb2: Vec<f32>,
    /// Shape: [dim]
    pub q: Vec<f32>,
    /// Shape: [kv_dim]
    pub k: Vec<f32>,
    /// Shape: [kv_dim]
    pub v: Vec<f32>,
    /// Attention scores
    /// Shape: [n_heads, context_length]
    pub att: Vec<f32>,
    /// Shape: [vocab_size]
    pub logits: Vec<f32>,
    /// Per layer, shape: [context_length, kv_dim]
    pub key_cache: Vec<Vec<f32>>,
    /// Per layer, shape: [context_length, kv_dim]
    pub value_cache: Vec<Vec<f32>>,
    /// Token to feed at the next position.
    pub latest_token: usize,
    position: usize,
    context_length: usize,
}

impl InferenceState {
    pub fn new(config: &Configuration, start_token: usize) -> Self {
        let Configuration { dim, hidden_dim, number_of_layers, number_of_heads, vocabulary_size, context_length, .. } =
            *config;
        let kv_dim = config.kv_dim();

        Self {
            x: vec![0.0; dim],
            xb: vec![0.0; dim],
            xb2: vec![0.0; dim],
            hb: vec![0.0; hidden_dim],
            hb2: vec![0.0; hidden_dim],
            q: vec![0.0; dim],
            k: vec![0.0; kv_dim],
            v: vec![0.0; kv_dim],
            att: vec![0.0; number_of_heads * context_length],
            logits: vec![0.0; vocabulary_size],
            key_cache: (0..number_of_layers).map(|_| vec![0.0; context_length * kv_dim]).collect(),
            value_cache: (0..number_of_layers).map(|_| vec![0.0; context_length * kv_dim]).collect(),
            latest_token: start_token,
            position: 0,
            context_length,
        }
    }

    /// Number of positions held in the key/value cache; the next position to run.
    pub fn position(&self) -> usize {
        self.position
    }

    pub fn context_length(&self) -> usize {
        self.context_length
    }

    pub fn logits(&self) -> &[f32] {
        &self.logits
    }

    /// Returns true when every buffer has the shape `config` needs, with room for at least
    /// `config.context_length` positions.
    pub fn fits(&self, config: &Configuration) -> bool {
        let Configuration { dim, hidden_dim, number_of_layers, number_of_heads, vocabulary_size, .. } = *config;
        let kv_dim = config.kv_dim();
        let cache_len = self.context_length * kv_dim;

        let activations_fit = [&self.x, &self.xb, &self.xb2, &self.q].iter().all(|buffer| buffer.len() == dim)
            && [&self.hb, &self.hb2].iter().all(|buffer| buffer.len() == hidden_dim)
            && [&self.k, &self.v].iter().all(|buffer| buffer.len() == kv_dim)
            && self.logits.len() == vocabulary_size
            && self.att.len() == number_of_heads * self.context_length;

        let caches_fit = self.key_cache.len() == number_of_layers
            && self.value_cache.len() == number_of_layers
            && self.key_cache.iter().chain(&self.value_cache).all(|layer| layer.len() == cache_len);

        activations_fit && caches_fit && self.context_length >= config.context_length
    }

    /// Starts a fresh conversation; stale cache rows are overwritten before they are read.
    pub fn reset(&mut self, start_token: usize) {
        self.position = 0;
        self.latest_token = start_token;
    }

    /// Records that the cache row for `position` was written; later rows become stale.
    pub(crate) fn commit(&mut self, position: usize) {
        self.position = position + 1;
    }
}
