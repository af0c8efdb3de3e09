//! Seeded, randomly initialised weights for benchmarking and tests.

use anyhow::{Context, Result};

use crate::configuration::Configuration;
use crate::sampler::XorShiftRng;
use crate::tensor::{GgmlType, QuantizedTensor};
use crate::weights::{LayerWeights, Weights};

/// Generates weights for `config` with every projection encoded as `ggml_type`.
///
/// Projection values are uniform in `±1/sqrt(fan_in)`; norm weights are ones. The same
/// seed always produces the same weights.
pub fn random_weights(config: &Configuration, ggml_type: GgmlType, tied_embeddings: bool, seed: u64) -> Result<Weights> {
    config.validate()?;

    let Configuration { dim, hidden_dim, vocabulary_size, number_of_layers, .. } = *config;
    let kv_dim = config.kv_dim();
    let mut rng = XorShiftRng::new(seed);

    let mut tensor = |name: &str, rows: usize, cols: usize| -> Result<QuantizedTensor> {
        let bound = (cols as f32).sqrt().recip();
        let values: Vec<f32> = (0..rows * cols).map(|_| (rng.next_f32() * 2.0 - 1.0) * bound).collect();
        QuantizedTensor::quantize(ggml_type, &values).with_context(|| format!("Failed to encode {name}"))
    };

    let token_embedding_table = tensor("token_embedding_table", vocabulary_size, dim)?;

    let layers = (0..number_of_layers)
        .map(|_| {
            Ok(LayerWeights {
                rms_att_weight: vec![1.0; dim],
                wq: tensor("wq", dim, dim)?,
                wk: tensor("wk", kv_dim, dim)?,
                wv: tensor("wv", kv_dim, dim)?,
                wo: tensor("wo", dim, dim)?,
                rms_ffn_weight: vec![1.0; dim],
                w1: tensor("w1", hidden_dim, dim)?,
                w2: tensor("w2", dim, hidden_dim)?,
                w3: tensor("w3", hidden_dim, dim)?,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let wcls = if tied_embeddings { None } else { Some(tensor("wcls", vocabulary_size, dim)?) };

    Weights::new(config, token_embedding_table, layers, vec![1.0; dim], wcls)
}
