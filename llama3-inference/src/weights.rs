#[cfg(test)]
#[path = "../tests/unit/weights_test.rs"]
mod weights_test;

use anyhow::{Context, Result};

use crate::configuration::Configuration;
use crate::tensor::QuantizedTensor;

/// Learned parameters of one decoder layer.
#[derive(Debug, Clone)]
pub struct LayerWeights {
    /// Attention RMSNorm weights, shape: [dim]
    pub rms_att_weight: Vec<f32>,
    /// Query projection, shape: [dim, dim]
    pub wq: QuantizedTensor,
    /// Key projection, shape: [kv_dim, dim]
    pub wk: QuantizedTensor,
    /// Value projection, shape: [kv_dim, dim]
    pub wv: QuantizedTensor,
    /// Attention output projection, shape: [dim, dim]
    pub wo: QuantizedTensor,
    /// Feed-forward RMSNorm weights, shape: [dim]
    pub rms_ffn_weight: Vec<f32>,
    /// Gate projection, shape: [hidden_dim, dim]
    pub w1: QuantizedTensor,
    /// Down projection, shape: [dim, hidden_dim]
    pub w2: QuantizedTensor,
    /// Up projection, shape: [hidden_dim, dim]
    pub w3: QuantizedTensor,
}

impl LayerWeights {
    fn validate(&self, config: &Configuration) -> Result<()> {
        let Configuration { dim, hidden_dim, .. } = *config;
        let kv_dim = config.kv_dim();

        check_len("rms_att_weight", self.rms_att_weight.len(), dim)?;
        check_len("rms_ffn_weight", self.rms_ffn_weight.len(), dim)?;

        let projections = [
            ("wq", &self.wq, dim * dim),
            ("wk", &self.wk, kv_dim * dim),
            ("wv", &self.wv, kv_dim * dim),
            ("wo", &self.wo, dim * dim),
            ("w1", &self.w1, hidden_dim * dim),
            ("w2", &self.w2, dim * hidden_dim),
            ("w3", &self.w3, hidden_dim * dim),
        ];

        for (name, tensor, expected) in projections {
            check_len(name, tensor.size(), expected)?;
        }

        Ok(())
    }
}

/// Precomputed rotary embedding factors, indexed by position and dimension pair.
#[derive(Clone)]
pub struct RopeTables {
    /// Shape: [context_length, head_size / 2]
    freq_cis_real: Vec<f32>,
    /// Shape: [context_length, head_size / 2]
    freq_cis_imag: Vec<f32>,
    half_head_size: usize,
}

impl RopeTables {
    /// For pair `i` at position `p` the rotation angle is `p * theta^(-2i / head_size)`.
    pub fn new(context_length: usize, head_size: usize, theta: f32) -> Self {
        let half_head_size = head_size / 2;
        let mut freq_cis_real = Vec::with_capacity(context_length * half_head_size);
        let mut freq_cis_imag = Vec::with_capacity(context_length * half_head_size);

        for pos in 0..context_length {
            for pair in 0..half_head_size {
                let freq = theta.powf(-((2 * pair) as f32) / head_size as f32);
                let angle = pos as f32 * freq;
                freq_cis_real.push(angle.cos());
                freq_cis_imag.push(angle.sin());
            }
        }

        Self { freq_cis_real, freq_cis_imag, half_head_size }
    }

    /// Returns `(cos, sin)` for `pair` at `position`.
    #[inline]
    pub fn get(&self, position: usize, pair: usize) -> (f32, f32) {
        let index = position * self.half_head_size + pair;
        (self.freq_cis_real[index], self.freq_cis_imag[index])
    }

    pub fn context_length(&self) -> usize {
        if self.half_head_size == 0 { 0 } else { self.freq_cis_real.len() / self.half_head_size }
    }

    pub fn head_size(&self) -> usize {
        self.half_head_size * 2
    }
}

impl std::fmt::Debug for RopeTables {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RopeTables")
            .field("context_length", &self.context_length())
            .field("head_size", &self.head_size())
            .finish()
    }
}

/// All learned parameters of the model, immutable after construction.
pub struct Weights {
    /// Shape: [vocab_size, dim]
    pub token_embedding_table: QuantizedTensor,
    /// Exactly `number_of_layers` entries.
    pub layers: Vec<LayerWeights>,
    /// Shape: [dim]
    pub rms_final_weight: Vec<f32>,
    pub rope: RopeTables,
    /// Classifier, shape: [vocab_size, dim]. `None` means tied to the token embeddings.
    wcls: Option<QuantizedTensor>,
}

impl Weights {
    /// Assembles and validates the weights against `config`.
    ///
    /// Passing `None` as the classifier ties it to the token embedding table.
    pub fn new(
        config: &Configuration,
        token_embedding_table: QuantizedTensor,
        layers: Vec<LayerWeights>,
        rms_final_weight: Vec<f32>,
        wcls: Option<QuantizedTensor>,
    ) -> Result<Self> {
        config.validate()?;

        let weights = Self {
            token_embedding_table,
            layers,
            rms_final_weight,
            rope: RopeTables::new(config.context_length, config.head_size(), config.rope_theta),
            wcls,
        };

        weights.validate(config).with_context(|| "Model weights do not match configuration")?;

        Ok(weights)
    }

    /// Output projection into vocabulary logits.
    pub fn classifier(&self) -> &QuantizedTensor {
        self.wcls.as_ref().unwrap_or(&self.token_embedding_table)
    }

    pub fn has_tied_embeddings(&self) -> bool {
        self.wcls.is_none()
    }

    /// Checks every tensor shape, the layer count and the RoPE table extent.
    pub fn validate(&self, config: &Configuration) -> Result<()> {
        let Configuration { dim, vocabulary_size, number_of_layers, .. } = *config;

        check_len("token_embedding_table", self.token_embedding_table.size(), vocabulary_size * dim)?;
        check_len("classifier", self.classifier().size(), vocabulary_size * dim)?;
        check_len("rms_final_weight", self.rms_final_weight.len(), dim)?;

        if self.layers.len() != number_of_layers {
            anyhow::bail!("Expected {} layers, got {}", number_of_layers, self.layers.len());
        }

        for (layer_idx, layer) in self.layers.iter().enumerate() {
            layer.validate(config).with_context(|| format!("Invalid weights for layer {layer_idx}"))?;
        }

        if self.rope.head_size() != config.head_size() {
            anyhow::bail!("RoPE tables built for head size {}, expected {}", self.rope.head_size(), config.head_size());
        }

        if self.rope.context_length() < config.context_length {
            anyhow::bail!(
                "RoPE tables cover {} positions, context length is {}",
                self.rope.context_length(),
                config.context_length
            );
        }

        Ok(())
    }
}

impl std::fmt::Debug for Weights {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        struct LayersSummary<'a, T>(&'a [T]);

        impl<'a, T: std::fmt::Debug> std::fmt::Debug for LayersSummary<'a, T> {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.debug_list()
                    .entries(self.0.iter().take(1))
                    .entry(&format_args!("... and {} more", self.0.len().saturating_sub(1)))
                    .finish()
            }
        }

        f.debug_struct("Weights")
            .field("token_embedding_table", &self.token_embedding_table)
            .field("layers", &LayersSummary(&self.layers))
            .field("rope", &self.rope)
            .field("tied_embeddings", &self.has_tied_embeddings())
            .finish()
    }
}

fn check_len(name: &str, actual: usize, expected: usize) -> Result<()> {
    if actual != expected {
        anyhow::bail!("Tensor {name} has {actual} elements, expected {expected}");
    }
    Ok(())
}
