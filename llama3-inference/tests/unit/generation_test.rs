use super::*;
use crate::configuration::Configuration;
use crate::sampler::ArgmaxSampler;
use crate::synthetic::random_weights;
use crate::tensor::GgmlType;
use anyhow::Result;

const CONTEXT_LENGTH: usize = 16;

fn small_llama() -> Result<Llama> {
    let config = Configuration::builder()
        .dim(64)
        .hidden_dim(96)
        .number_of_layers(2)
        .number_of_heads(4)
        .number_of_key_value_heads(2)
        .vocabulary_size(40)
        .context_length(CONTEXT_LENGTH)
        .build()?;
    let weights = random_weights(&config, GgmlType::Q8_0, true, 11)?;
    Llama::new(config, weights)
}

/// Counts sampler invocations and always answers the same token.
struct FixedSampler {
    token: usize,
    calls: usize,
}

impl Sampler for FixedSampler {
    fn sample_token(&mut self, _logits: &mut [f32]) -> usize {
        self.calls += 1;
        self.token
    }
}

#[test]
fn test_prompt_longer_than_budget_generates_nothing() -> Result<()> {
    let llama = small_llama()?;
    let mut state = llama.create_session();
    let mut sampler = FixedSampler { token: 5, calls: 0 };
    let options = GenerationOptions::default().with_max_tokens(Some(2));

    let generated = generate_tokens(&llama, &mut state, 0, &[7, 8, 9], &options, &mut sampler, None)?;

    assert!(generated.is_empty());
    assert_eq!(sampler.calls, 0);
    assert_eq!(state.position(), 2);
    // the prompt token following the last ingested position is pending
    assert_eq!(state.latest_token, 8);
    Ok(())
}

#[test]
fn test_generated_count_is_budget_minus_prompt() -> Result<()> {
    let llama = small_llama()?;

    for (prompt, max_tokens, expected) in [(vec![1, 2, 3], 7, 4), (vec![], 3, 3), (vec![4; 5], 5, 0), (vec![4; 5], 6, 1)] {
        let mut state = llama.create_session();
        let mut sampler = FixedSampler { token: 5, calls: 0 };
        let options = GenerationOptions::default().with_max_tokens(Some(max_tokens));

        let generated = generate_tokens(&llama, &mut state, 0, &prompt, &options, &mut sampler, None)?;

        assert_eq!(generated, vec![5; expected], "prompt {prompt:?}, max {max_tokens}");
        assert_eq!(state.position(), max_tokens);
    }
    Ok(())
}

#[test]
fn test_budget_is_clamped_to_context() -> Result<()> {
    let llama = small_llama()?;

    for max_tokens in [None, Some(CONTEXT_LENGTH), Some(1000)] {
        let mut state = llama.create_session();
        let options = GenerationOptions::default().with_max_tokens(max_tokens);

        let generated = generate_tokens(&llama, &mut state, 0, &[1, 2], &options, &mut ArgmaxSampler, None)?;

        assert_eq!(generated.len(), CONTEXT_LENGTH - 2);
        assert_eq!(state.position(), CONTEXT_LENGTH);
    }
    Ok(())
}

#[test]
fn test_stop_token_ends_generation() -> Result<()> {
    let llama = small_llama()?;
    let prompt = [3, 1, 4];

    let mut state = llama.create_session();
    let free_run = generate_tokens(&llama, &mut state, 0, &prompt, &GenerationOptions::default(), &mut ArgmaxSampler, None)?;
    assert_eq!(free_run.len(), CONTEXT_LENGTH - prompt.len());

    let stop_token = free_run[2];
    let stop_index = free_run.iter().position(|&token| token == stop_token).unwrap_or(2);

    let mut state = llama.create_session();
    let options = GenerationOptions::default().with_stop_tokens([stop_token]);
    let stopped = generate_tokens(&llama, &mut state, 0, &prompt, &options, &mut ArgmaxSampler, None)?;

    assert_eq!(stopped, free_run[..=stop_index].to_vec());
    assert_eq!(stopped.last(), Some(&stop_token));
    assert_eq!(state.latest_token, stop_token);
    assert_eq!(state.position(), prompt.len() + stop_index + 1);
    Ok(())
}

#[test]
fn test_stop_tokens_do_not_affect_prompt() -> Result<()> {
    let llama = small_llama()?;
    let mut state = llama.create_session();
    let mut sampler = FixedSampler { token: 6, calls: 0 };
    let options = GenerationOptions::default().with_stop_tokens([2, 6]).with_max_tokens(Some(8));

    let generated = generate_tokens(&llama, &mut state, 0, &[2, 2, 2], &options, &mut sampler, None)?;

    assert_eq!(generated, vec![6]);
    assert_eq!(state.position(), 4);
    Ok(())
}

#[test]
fn test_callback_sees_only_generated_tokens() -> Result<()> {
    let llama = small_llama()?;
    let mut state = llama.create_session();
    let mut seen = Vec::new();
    let mut on_token = |token: usize| seen.push(token);
    let options = GenerationOptions::default().with_max_tokens(Some(6)).with_echo(true);

    let generated = generate_tokens(&llama, &mut state, 0, &[9, 9], &options, &mut ArgmaxSampler, Some(&mut on_token))?;

    assert_eq!(generated.len(), 4);
    assert_eq!(seen, generated);
    Ok(())
}

#[test]
fn test_invalid_prompt_token() -> Result<()> {
    let llama = small_llama()?;
    let mut state = llama.create_session();

    let err = generate_tokens(&llama, &mut state, 0, &[1, 40], &GenerationOptions::default(), &mut ArgmaxSampler, None)
        .unwrap_err();

    assert!(err.to_string().contains("Prompt token 40"), "{err}");
    assert_eq!(state.position(), 0);
    Ok(())
}

#[test]
fn test_start_beyond_cache_is_an_error() -> Result<()> {
    let llama = small_llama()?;
    let mut state = llama.create_session();

    assert!(generate_tokens(&llama, &mut state, 3, &[], &GenerationOptions::default(), &mut ArgmaxSampler, None).is_err());
    Ok(())
}

#[test]
fn test_clamp_end_position() {
    assert_eq!(clamp_end_position(0, Some(4), 10), 4);
    assert_eq!(clamp_end_position(3, Some(4), 10), 7);
    assert_eq!(clamp_end_position(8, Some(4), 10), 10);
    assert_eq!(clamp_end_position(2, None, 10), 10);
    assert_eq!(clamp_end_position(2, Some(usize::MAX), 10), 10);
}
