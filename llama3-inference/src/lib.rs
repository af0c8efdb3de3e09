//! CPU inference engine for quantized Llama 3 models.
//!
//! The crate covers everything between loaded weights and generated token ids: block-quantized
//! tensor kernels, the transformer forward pass with grouped-query attention and rotary
//! embeddings, the per-session key/value cache, and a generation loop with pluggable sampling.
//! Parsing model files and tokenizing text are left to the caller, who hands over a
//! [`Configuration`] and [`Weights`] (typically sliced out of a [`TensorSource`]).

mod configuration;
mod generation;
mod ops;
mod parallel;
mod sampler;
mod state;
pub mod synthetic;
mod tensor;
mod transformer;
mod utils;
mod weights;

use anyhow::Result;
use log::{debug, info};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

pub use crate::configuration::{Configuration, ConfigurationBuilder, DEFAULT_RMS_NORM_EPS, DEFAULT_ROPE_THETA};
pub use crate::generation::GenerationOptions;
pub use crate::ops::{
    add_in_place, divide_in_place, map_in_place, max, multiply_in_place, rmsnorm, rmsnorm_in_place, saxpy_in_place,
    silu, softmax_in_place, sum,
};
pub use crate::parallel::ParallelExecutor;
pub use crate::sampler::{ArgmaxSampler, CategoricalSampler, Sampler, SamplerConfig, TemperatureSampler, ToppSampler};
pub use crate::state::InferenceState;
pub use crate::tensor::{GgmlType, QK, QuantizedTensor};
pub use crate::utils::{ByteView, TensorSource};
pub use crate::weights::{LayerWeights, RopeTables, Weights};

/// Token id of `<|begin_of_text|>` in the Llama 3 vocabulary.
pub const LLAMA3_BEGIN_OF_TEXT: usize = 128_000;

/// A loaded model: validated configuration, immutable weights and the worker pool.
///
/// `Llama` is read-only after construction and can be shared across threads (e.g. in an
/// `Arc`); every concurrent generation needs its own [`InferenceState`].
pub struct Llama {
    configuration: Configuration,
    weights: Weights,
    executor: ParallelExecutor,
    begin_of_text: usize,
}

impl Llama {
    pub fn new(configuration: Configuration, weights: Weights) -> Result<Self> {
        configuration.validate()?;
        weights.validate(&configuration)?;
        Ok(Self { configuration, weights, executor: ParallelExecutor::new(), begin_of_text: 0 })
    }

    pub fn with_executor(mut self, executor: ParallelExecutor) -> Self {
        self.executor = executor;
        self
    }

    /// Sets the token every new session starts from.
    pub fn with_begin_of_text(mut self, token: usize) -> Result<Self> {
        if token >= self.configuration.vocabulary_size {
            anyhow::bail!("Start token {} is out of vocabulary range 0..{}", token, self.configuration.vocabulary_size);
        }
        self.begin_of_text = token;
        Ok(self)
    }

    /// Shrinks the context window; sessions created afterwards use the smaller buffers.
    pub fn with_context_length(mut self, context_length: Option<usize>) -> Result<Self> {
        self.configuration = self.configuration.with_context_length(context_length)?;
        Ok(self)
    }

    pub fn configuration(&self) -> &Configuration {
        &self.configuration
    }

    pub fn weights(&self) -> &Weights {
        &self.weights
    }

    pub fn executor(&self) -> &ParallelExecutor {
        &self.executor
    }

    pub fn begin_of_text(&self) -> usize {
        self.begin_of_text
    }

    /// Allocates a fresh session positioned at 0 with the start token pending.
    pub fn create_session(&self) -> InferenceState {
        InferenceState::new(&self.configuration, self.begin_of_text)
    }

    /// Runs a single transformer step and returns the logits for the next token.
    pub fn forward<'s>(&self, state: &'s mut InferenceState, token: usize, position: usize) -> Result<&'s [f32]> {
        transformer::forward(self, state, token, position)
    }

    /// Ingests `prompt_tokens` from `start_position`, then samples until a stop token or the
    /// budget in `options`. Returns only the generated tokens.
    pub fn generate(
        &self,
        state: &mut InferenceState,
        start_position: usize,
        prompt_tokens: &[usize],
        options: &GenerationOptions,
        sampler: &mut dyn Sampler,
        on_token_generated: Option<&mut dyn FnMut(usize)>,
    ) -> Result<Vec<usize>> {
        generation::generate_tokens(self, state, start_position, prompt_tokens, options, sampler, on_token_generated)
    }
}

impl std::fmt::Debug for Llama {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Llama")
            .field("configuration", &self.configuration)
            .field("weights", &self.weights)
            .field("executor", &self.executor)
            .finish()
    }
}

/// Options for an end-to-end run on a synthetic model.
#[derive(Debug, Clone)]
pub struct BenchConfig {
    pub configuration: Configuration,
    pub ggml_type: GgmlType,
    pub tied_embeddings: bool,
    pub threads: Option<usize>,
    pub ctx_length: Option<usize>,
    pub prompt_length: usize,
    pub max_tokens: Option<usize>,
    pub temperature: f32,
    pub topp: f32,
    pub seed: u64,
}

impl BenchConfig {
    pub fn builder() -> BenchConfigBuilder {
        BenchConfigBuilder::default()
    }
}

#[derive(Debug, Default)]
pub struct BenchConfigBuilder {
    configuration: Option<Configuration>,
    ggml_type: Option<GgmlType>,
    tied_embeddings: Option<bool>,
    threads: Option<usize>,
    ctx_length: Option<usize>,
    prompt_length: Option<usize>,
    max_tokens: Option<usize>,
    temperature: Option<f32>,
    topp: Option<f32>,
    seed: Option<u64>,
}

impl BenchConfigBuilder {
    pub fn configuration(mut self, configuration: Configuration) -> Self {
        self.configuration = Some(configuration);
        self
    }
    pub fn ggml_type(mut self, ggml_type: Option<GgmlType>) -> Self {
        self.ggml_type = ggml_type;
        self
    }
    pub fn tied_embeddings(mut self, tied: Option<bool>) -> Self {
        self.tied_embeddings = tied;
        self
    }
    pub fn threads(mut self, threads: Option<usize>) -> Self {
        self.threads = threads;
        self
    }
    pub fn ctx_length(mut self, ctx_length: Option<usize>) -> Self {
        self.ctx_length = ctx_length;
        self
    }
    pub fn prompt_length(mut self, prompt_length: Option<usize>) -> Self {
        self.prompt_length = prompt_length;
        self
    }
    pub fn max_tokens(mut self, max_tokens: Option<usize>) -> Self {
        self.max_tokens = max_tokens;
        self
    }
    pub fn temperature(mut self, temperature: Option<f32>) -> Self {
        self.temperature = temperature;
        self
    }
    pub fn topp(mut self, topp: Option<f32>) -> Self {
        self.topp = topp;
        self
    }
    pub fn seed(mut self, seed: Option<u64>) -> Self {
        self.seed = seed;
        self
    }
    pub fn build(self) -> Result<BenchConfig, String> {
        Ok(BenchConfig {
            configuration: self.configuration.ok_or("configuration is required")?,
            ggml_type: self.ggml_type.unwrap_or(GgmlType::Q8_0),
            tied_embeddings: self.tied_embeddings.unwrap_or(true),
            threads: self.threads,
            ctx_length: self.ctx_length,
            prompt_length: self.prompt_length.unwrap_or(16),
            max_tokens: self.max_tokens,
            temperature: self.temperature.unwrap_or(1.0),
            topp: self.topp.unwrap_or(0.95),
            seed: self.seed.unwrap_or_else(|| {
                SystemTime::now().duration_since(UNIX_EPOCH).map(|elapsed| elapsed.as_secs()).unwrap_or(42)
            }),
        })
    }
}

/// Outcome of [`run_benchmark`].
#[derive(Debug, Clone)]
pub struct BenchReport {
    /// Positions run, prompt ingestion included.
    pub positions: usize,
    pub generated_tokens: Vec<usize>,
    pub load_seconds: f64,
    pub generation_seconds: f64,
}

impl BenchReport {
    pub fn prompt_tokens(&self) -> usize {
        self.positions - self.generated_tokens.len()
    }

    /// Positions processed per second, prompt ingestion included.
    pub fn tokens_per_second(&self) -> f64 {
        if self.generation_seconds > 0.0 { self.positions as f64 / self.generation_seconds } else { 0.0 }
    }
}

/// Builds a synthetic model from `bench_config` and times one generation on it.
pub fn run_benchmark(bench_config: BenchConfig) -> Result<BenchReport> {
    debug!("{bench_config:#?}");

    let load_start = Instant::now();
    let configuration = bench_config.configuration.with_context_length(bench_config.ctx_length)?;
    let weights =
        synthetic::random_weights(&configuration, bench_config.ggml_type, bench_config.tied_embeddings, bench_config.seed)?;

    let executor = match bench_config.threads {
        Some(threads) => ParallelExecutor::with_threads(threads)?,
        None => ParallelExecutor::new(),
    };
    let llama = Llama::new(configuration, weights)?.with_executor(executor);
    let load_seconds = load_start.elapsed().as_secs_f64();

    debug!("{llama:#?}");
    info!("Synthetic model ready in {load_seconds:.2}s ({} worker threads)", llama.executor().threads());

    let vocabulary_size = llama.configuration().vocabulary_size;
    let prompt_tokens: Vec<usize> = (0..bench_config.prompt_length).map(|i| (i * 7919 + 1) % vocabulary_size).collect();

    let mut sampler = SamplerConfig { temperature: bench_config.temperature, topp: bench_config.topp, seed: bench_config.seed }
        .build(vocabulary_size)?;
    let options = GenerationOptions::default().with_max_tokens(bench_config.max_tokens);

    let mut state = llama.create_session();
    let generation_start = Instant::now();
    let generated_tokens = llama.generate(&mut state, 0, &prompt_tokens, &options, &mut sampler, None)?;
    let generation_seconds = generation_start.elapsed().as_secs_f64();

    Ok(BenchReport { positions: state.position(), generated_tokens, load_seconds, generation_seconds })
}
