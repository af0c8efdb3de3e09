#[cfg(test)]
#[path = "../tests/unit/generation_test.rs"]
mod generation_test;

use anyhow::Result;
use log::debug;
use std::collections::HashSet;
use std::time::Instant;

use crate::Llama;
use crate::sampler::Sampler;
use crate::state::InferenceState;
use crate::transformer::forward;

/// Per-request generation limits.
#[derive(Debug, Clone, Default)]
pub struct GenerationOptions {
    /// Tokens that end generation; they do not affect prompt ingestion.
    pub stop_tokens: HashSet<usize>,
    /// Budget of positions to run from the start position, prompt included. `None` runs
    /// until the context is full; larger budgets are clamped to the remaining context.
    pub max_tokens: Option<usize>,
    /// Logs every ingested and generated token id.
    pub echo: bool,
}

impl GenerationOptions {
    pub fn with_stop_tokens(mut self, stop_tokens: impl IntoIterator<Item = usize>) -> Self {
        self.stop_tokens = stop_tokens.into_iter().collect();
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: Option<usize>) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_echo(mut self, echo: bool) -> Self {
        self.echo = echo;
        self
    }
}

/// Ingests `prompt_tokens` and then generates until a stop token or the budget is reached.
///
/// The first token fed is `state.latest_token`. Prompt tokens are forced one per position
/// and are never passed to the sampler or the callback. Returns the generated tokens only,
/// including the stop token when one ended generation. On return `state.latest_token` is the
/// token to feed at `state.position()`, so a later call can continue from there.
pub fn generate_tokens(
    llama: &Llama,
    state: &mut InferenceState,
    start_position: usize,
    prompt_tokens: &[usize],
    options: &GenerationOptions,
    sampler: &mut dyn Sampler,
    mut on_token_generated: Option<&mut dyn FnMut(usize)>,
) -> Result<Vec<usize>> {
    let config = llama.configuration();
    debug!("Generating tokens from position {start_position}");

    if let Some(&token) = prompt_tokens.iter().find(|&&token| token >= config.vocabulary_size) {
        anyhow::bail!("Prompt token {} is out of vocabulary range 0..{}", token, config.vocabulary_size);
    }

    let end_position = clamp_end_position(start_position, options.max_tokens, config.context_length);
    let mut metrics = TokenMetrics::new();
    let mut generated = Vec::with_capacity(end_position.saturating_sub(start_position));
    let mut prompt_iter = prompt_tokens.iter().copied();
    let mut token = state.latest_token;

    for position in start_position..end_position {
        forward(llama, state, token, position)?;

        let next_token = match prompt_iter.next() {
            // Force-pick token from prompt
            Some(prompt_token) => {
                metrics.ingest();
                if options.echo {
                    debug!("prompt token {prompt_token} at position {position}");
                }
                prompt_token
            }
            None => {
                let sampled = sampler.sample_token(&mut state.logits);
                metrics.generate();
                if options.echo {
                    debug!("generated token {sampled} at position {position}");
                }

                generated.push(sampled);
                if let Some(callback) = on_token_generated.as_mut() {
                    callback(sampled);
                }
                if options.stop_tokens.contains(&sampled) {
                    state.latest_token = sampled;
                    break;
                }
                sampled
            }
        };

        state.latest_token = next_token;
        token = next_token;
    }

    metrics.report();

    Ok(generated)
}

/// Exclusive end position for a run starting at `start_position`.
fn clamp_end_position(start_position: usize, max_tokens: Option<usize>, context_length: usize) -> usize {
    match max_tokens {
        Some(max_tokens) if start_position.saturating_add(max_tokens) <= context_length => start_position + max_tokens,
        Some(max_tokens) => {
            debug!(
                "Requested {max_tokens} tokens from position {start_position}, clamping to context length {context_length}"
            );
            context_length
        }
        None => context_length,
    }
}

/// Tracks token throughput for a single generation call.
struct TokenMetrics {
    start_time: Instant,
    ingested_count: usize,
    generated_count: usize,
}

impl TokenMetrics {
    fn new() -> Self {
        Self { start_time: Instant::now(), ingested_count: 0, generated_count: 0 }
    }

    fn ingest(&mut self) {
        self.ingested_count += 1;
    }

    fn generate(&mut self) {
        self.generated_count += 1;
    }

    fn report(&self) {
        let duration = self.start_time.elapsed().as_secs_f64();
        let total = self.ingested_count + self.generated_count;
        if total > 0 && duration > 0.0 {
            debug!(
                "{:.2} tokens/s ({} prompt, {} generated in {:.2}s)",
                total as f64 / duration,
                self.ingested_count,
                self.generated_count,
                duration
            );
        }
    }
}
