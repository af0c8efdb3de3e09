#[cfg(test)]
#[path = "../tests/unit/sampler_test.rs"]
mod sampler_test;

use anyhow::Result;

use crate::ops::{divide_in_place, softmax_in_place};

/// Selects the next token id from a logits vector.
///
/// Implementations may use the logits buffer as scratch space.
pub trait Sampler {
    fn sample_token(&mut self, logits: &mut [f32]) -> usize;
}

impl<S: Sampler + ?Sized> Sampler for Box<S> {
    fn sample_token(&mut self, logits: &mut [f32]) -> usize {
        (**self).sample_token(logits)
    }
}

impl<S: Sampler + ?Sized> Sampler for &mut S {
    fn sample_token(&mut self, logits: &mut [f32]) -> usize {
        (**self).sample_token(logits)
    }
}

/// Greedy decoding: always the index of the maximum logit.
#[derive(Debug, Clone, Copy, Default)]
pub struct ArgmaxSampler;

impl Sampler for ArgmaxSampler {
    fn sample_token(&mut self, logits: &mut [f32]) -> usize {
        logits.iter().enumerate().max_by(|(_, a), (_, b)| a.total_cmp(b)).map(|(i, _)| i).unwrap_or_default()
    }
}

/// Multinomial sampling from a probability distribution.
#[derive(Debug, Clone)]
pub struct CategoricalSampler {
    rng: XorShiftRng,
}

impl CategoricalSampler {
    pub fn new(seed: u64) -> Self {
        Self { rng: XorShiftRng::new(seed) }
    }
}

impl Sampler for CategoricalSampler {
    /// Expects probabilities (non-negative, summing to one).
    fn sample_token(&mut self, probabilities: &mut [f32]) -> usize {
        let coin = self.rng.next_f32();
        let mut cdf = 0.0;
        for (i, &prob) in probabilities.iter().enumerate() {
            cdf += prob;
            if coin < cdf {
                return i;
            }
        }
        probabilities.len().saturating_sub(1)
    }
}

/// Stores a probability and its associated index (token id).
#[derive(Clone, Debug)]
struct ProbIndex {
    prob: f32,
    index: usize,
}

/// Top-p (nucleus) sampling: sample from the smallest set of tokens whose cumulative
/// probability exceeds `topp`.
#[derive(Debug, Clone)]
pub struct ToppSampler {
    probindex: Vec<ProbIndex>,
    topp: f32,
    rng: XorShiftRng,
}

impl ToppSampler {
    pub fn new(vocab_size: usize, topp: f32, seed: u64) -> Self {
        Self { probindex: vec![ProbIndex { prob: 0.0, index: 0 }; vocab_size], topp, rng: XorShiftRng::new(seed) }
    }
}

impl Sampler for ToppSampler {
    /// Expects probabilities (non-negative, summing to one).
    fn sample_token(&mut self, probabilities: &mut [f32]) -> usize {
        let coin = self.rng.next_f32();

        // Tokens below the cutoff can never be part of the nucleus
        let cutoff = (1.0 - self.topp) / (probabilities.len().saturating_sub(1).max(1)) as f32;
        self.probindex.clear();
        self.probindex.extend(
            probabilities.iter().enumerate().filter(|&(_, &prob)| prob >= cutoff).map(|(index, &prob)| ProbIndex {
                prob,
                index,
            }),
        );

        if self.probindex.is_empty() {
            return ArgmaxSampler.sample_token(probabilities);
        }

        self.probindex.sort_unstable_by(|a, b| b.prob.total_cmp(&a.prob));

        // Find truncation point
        let mut cumulative_prob = 0.0;
        let mut last_idx = self.probindex.len() - 1;
        for (i, entry) in self.probindex.iter().enumerate() {
            cumulative_prob += entry.prob;
            if cumulative_prob > self.topp {
                last_idx = i;
                break;
            }
        }

        // Sample from truncated list
        let r = coin * cumulative_prob;
        let mut cdf = 0.0;
        for entry in &self.probindex[..=last_idx] {
            cdf += entry.prob;
            if r < cdf {
                return entry.index;
            }
        }
        self.probindex[last_idx].index
    }
}

/// Turns logits into probabilities (temperature scaling, then softmax) before delegating.
#[derive(Debug, Clone)]
pub struct TemperatureSampler<S> {
    temperature: f32,
    inner: S,
}

impl<S: Sampler> TemperatureSampler<S> {
    pub fn new(temperature: f32, inner: S) -> Self {
        Self { temperature, inner }
    }
}

impl<S: Sampler> Sampler for TemperatureSampler<S> {
    fn sample_token(&mut self, logits: &mut [f32]) -> usize {
        divide_in_place(logits, self.temperature);
        softmax_in_place(logits);
        self.inner.sample_token(logits)
    }
}

/// Sampling parameters chosen per request.
#[derive(Debug, Clone, Copy)]
pub struct SamplerConfig {
    /// 0.0 selects greedy decoding
    pub temperature: f32,
    /// Nucleus threshold; values outside (0, 1) disable top-p
    pub topp: f32,
    pub seed: u64,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self { temperature: 1.0, topp: 0.95, seed: 42 }
    }
}

impl SamplerConfig {
    /// Builds the sampler for these parameters.
    ///
    /// - temperature 0: [`ArgmaxSampler`]
    /// - top-p outside (0, 1): [`CategoricalSampler`] over temperature-scaled softmax
    /// - otherwise: [`ToppSampler`] over temperature-scaled softmax
    pub fn build(&self, vocab_size: usize) -> Result<Box<dyn Sampler + Send>> {
        if !self.temperature.is_finite() || self.temperature < 0.0 {
            anyhow::bail!("Temperature must be non-negative, got {}", self.temperature);
        }
        if vocab_size == 0 {
            anyhow::bail!("Vocab size must be positive");
        }

        if self.temperature == 0.0 {
            return Ok(Box::new(ArgmaxSampler));
        }

        if self.topp <= 0.0 || self.topp >= 1.0 {
            Ok(Box::new(TemperatureSampler::new(self.temperature, CategoricalSampler::new(self.seed))))
        } else {
            Ok(Box::new(TemperatureSampler::new(self.temperature, ToppSampler::new(vocab_size, self.topp, self.seed))))
        }
    }
}

/// Xorshift64* generator; a given seed always yields the same sequence.
#[derive(Debug, Clone)]
pub(crate) struct XorShiftRng {
    state: u64,
}

impl XorShiftRng {
    pub(crate) fn new(seed: u64) -> Self {
        // an all-zero state would never change
        Self { state: if seed == 0 { 0x9E37_79B9_7F4A_7C15 } else { seed } }
    }

    pub(crate) fn next_u32(&mut self) -> u32 {
        self.state ^= self.state >> 12;
        self.state ^= self.state << 25;
        self.state ^= self.state >> 27;
        ((self.state.wrapping_mul(0x2545F4914F6CDD1D)) >> 32) as u32
    }

    /// Returns a random float in [0, 1).
    pub(crate) fn next_f32(&mut self) -> f32 {
        (self.next_u32() >> 8) as f32 / 16777216.0
    }
}
