#[cfg(test)]
#[path = "../tests/unit/configuration_test.rs"]
mod configuration_test;

use anyhow::{Context, Result};
use log::info;
use serde::Deserialize;
use std::{fs::File, io::Read, path::Path};

/// Default RMSNorm epsilon used by Llama 3 checkpoints.
pub const DEFAULT_RMS_NORM_EPS: f32 = 1e-5;

/// Default RoPE base frequency used by Llama 3 checkpoints.
pub const DEFAULT_ROPE_THETA: f32 = 500_000.0;

/// Validated transformer hyperparameters.
///
/// Built through [`ConfigurationBuilder`] (or [`Configuration::from_hf_json`]), which checks the
/// head and grouped-query invariants. `Weights::new` and `Llama::new` check them again.
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub struct Configuration {
    /// Transformer embedding dimension
    pub dim: usize,
    /// Feed-forward intermediate dimension
    pub hidden_dim: usize,
    pub number_of_layers: usize,
    /// Number of query heads
    pub number_of_heads: usize,
    /// Number of key/value heads (fewer than query heads with grouped-query attention)
    pub number_of_key_value_heads: usize,
    pub vocabulary_size: usize,
    /// Maximum sequence length
    pub context_length: usize,
    pub rms_norm_eps: f32,
    pub rope_theta: f32,
}

impl Configuration {
    pub fn builder() -> ConfigurationBuilder {
        ConfigurationBuilder::default()
    }

    /// Size of one attention head.
    pub fn head_size(&self) -> usize {
        self.dim / self.number_of_heads
    }

    /// Width of one key/value cache row.
    pub fn kv_dim(&self) -> usize {
        self.dim * self.number_of_key_value_heads / self.number_of_heads
    }

    /// Number of query heads sharing one key/value head.
    pub fn kv_mul(&self) -> usize {
        self.number_of_heads / self.number_of_key_value_heads
    }

    /// Checks the shape invariants; a built configuration may have been edited since.
    pub fn validate(&self) -> Result<()> {
        validate_config(self).with_context(|| "Invalid model configuration")
    }

    /// Shrinks the context length. `None` leaves the configuration unchanged and larger
    /// values are clamped to the current length.
    pub fn with_context_length(&self, context_length: Option<usize>) -> Result<Self> {
        match context_length {
            None => Ok(self.clone()),
            Some(0) => anyhow::bail!("Invalid context_length: must be positive, got 0"),
            Some(context_length) => Ok(Self { context_length: context_length.min(self.context_length), ..self.clone() }),
        }
    }

    /// Parses a Hugging Face style `config.json` document.
    pub fn from_hf_json(contents: &str) -> Result<Self> {
        #[derive(Debug, Deserialize)]
        struct HFConfig {
            hidden_size: usize,
            intermediate_size: usize,
            num_hidden_layers: usize,
            num_attention_heads: usize,
            #[serde(default)]
            num_key_value_heads: Option<usize>,
            vocab_size: usize,
            max_position_embeddings: usize,
            #[serde(default)]
            rms_norm_eps: Option<f32>,
            #[serde(default)]
            rope_theta: Option<f32>,
        }

        let hf_config: HFConfig =
            serde_json::from_str(contents).map_err(|err| anyhow::anyhow!("Failed to parse config.json: {}", err))?;

        Configuration::builder()
            .dim(hf_config.hidden_size)
            .hidden_dim(hf_config.intermediate_size)
            .number_of_layers(hf_config.num_hidden_layers)
            .number_of_heads(hf_config.num_attention_heads)
            .number_of_key_value_heads(hf_config.num_key_value_heads.unwrap_or(hf_config.num_attention_heads))
            .vocabulary_size(hf_config.vocab_size)
            .context_length(hf_config.max_position_embeddings)
            .rms_norm_eps(hf_config.rms_norm_eps.unwrap_or(DEFAULT_RMS_NORM_EPS))
            .rope_theta(hf_config.rope_theta.unwrap_or(DEFAULT_ROPE_THETA))
            .build()
    }

    /// Loads a Hugging Face style `config.json` file.
    pub fn from_hf_file(config_path: impl AsRef<Path>) -> Result<Self> {
        let config_path = config_path.as_ref();
        let mut file = File::open(config_path).with_context(|| format!("Failed to open config.json at {config_path:?}"))?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)?;

        let config = Self::from_hf_json(&contents)?;

        info!("Model configuration loaded:");
        info!("   • Dimensions: {}", config.dim);
        info!("   • Layers: {}", config.number_of_layers);
        info!("   • Attention heads: {}", config.number_of_heads);
        info!("   • KV heads: {}", config.number_of_key_value_heads);
        info!("   • Vocabulary size: {}", config.vocabulary_size);
        info!("   • Context length: {}", config.context_length);
        info!("   • Head size: {}", config.head_size());

        Ok(config)
    }
}

#[derive(Debug, Default)]
pub struct ConfigurationBuilder {
    dim: Option<usize>,
    hidden_dim: Option<usize>,
    number_of_layers: Option<usize>,
    number_of_heads: Option<usize>,
    number_of_key_value_heads: Option<usize>,
    vocabulary_size: Option<usize>,
    context_length: Option<usize>,
    rms_norm_eps: Option<f32>,
    rope_theta: Option<f32>,
}

impl ConfigurationBuilder {
    pub fn dim(mut self, dim: usize) -> Self {
        self.dim = Some(dim);
        self
    }
    pub fn hidden_dim(mut self, hidden_dim: usize) -> Self {
        self.hidden_dim = Some(hidden_dim);
        self
    }
    pub fn number_of_layers(mut self, number_of_layers: usize) -> Self {
        self.number_of_layers = Some(number_of_layers);
        self
    }
    pub fn number_of_heads(mut self, number_of_heads: usize) -> Self {
        self.number_of_heads = Some(number_of_heads);
        self
    }
    /// Defaults to the number of query heads (plain multi-head attention).
    pub fn number_of_key_value_heads(mut self, number_of_key_value_heads: usize) -> Self {
        self.number_of_key_value_heads = Some(number_of_key_value_heads);
        self
    }
    pub fn vocabulary_size(mut self, vocabulary_size: usize) -> Self {
        self.vocabulary_size = Some(vocabulary_size);
        self
    }
    pub fn context_length(mut self, context_length: usize) -> Self {
        self.context_length = Some(context_length);
        self
    }
    pub fn rms_norm_eps(mut self, rms_norm_eps: f32) -> Self {
        self.rms_norm_eps = Some(rms_norm_eps);
        self
    }
    pub fn rope_theta(mut self, rope_theta: f32) -> Self {
        self.rope_theta = Some(rope_theta);
        self
    }

    pub fn build(self) -> Result<Configuration> {
        let number_of_heads = self.number_of_heads.context("number_of_heads is required")?;

        let config = Configuration {
            dim: self.dim.context("dim is required")?,
            hidden_dim: self.hidden_dim.context("hidden_dim is required")?,
            number_of_layers: self.number_of_layers.context("number_of_layers is required")?,
            number_of_heads,
            number_of_key_value_heads: self.number_of_key_value_heads.unwrap_or(number_of_heads),
            vocabulary_size: self.vocabulary_size.context("vocabulary_size is required")?,
            context_length: self.context_length.context("context_length is required")?,
            rms_norm_eps: self.rms_norm_eps.unwrap_or(DEFAULT_RMS_NORM_EPS),
            rope_theta: self.rope_theta.unwrap_or(DEFAULT_ROPE_THETA),
        };

        config.validate()?;

        Ok(config)
    }
}

/// Validates the model configuration to ensure it's supported.
fn validate_config(config: &Configuration) -> Result<()> {
    let dimensions = [
        ("dim", config.dim),
        ("hidden_dim", config.hidden_dim),
        ("number_of_layers", config.number_of_layers),
        ("number_of_heads", config.number_of_heads),
        ("number_of_key_value_heads", config.number_of_key_value_heads),
        ("vocabulary_size", config.vocabulary_size),
        ("context_length", config.context_length),
    ];

    for (name, value) in dimensions {
        if value == 0 {
            anyhow::bail!("Invalid {}: must be positive, got {}", name, value);
        }
    }

    if config.dim % config.number_of_heads != 0 {
        anyhow::bail!("dim {} is not divisible by number_of_heads {}", config.dim, config.number_of_heads);
    }

    if config.number_of_heads % config.number_of_key_value_heads != 0 {
        anyhow::bail!(
            "number_of_heads {} is not a multiple of number_of_key_value_heads {}",
            config.number_of_heads,
            config.number_of_key_value_heads
        );
    }

    if config.head_size() % 2 != 0 {
        anyhow::bail!("head size {} must be even for rotary embeddings", config.head_size());
    }

    let floats = [("rms_norm_eps", config.rms_norm_eps), ("rope_theta", config.rope_theta)];
    for (name, value) in floats {
        if !value.is_finite() || value <= 0.0 {
            anyhow::bail!("Invalid {}: must be positive and finite, got {}", name, value);
        }
    }

    Ok(())
}
