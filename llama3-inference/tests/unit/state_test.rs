use super::*;
use anyhow::Result;

fn config() -> Result<Configuration> {
    Configuration::builder()
        .dim(32)
        .hidden_dim(48)
        .number_of_layers(3)
        .number_of_heads(4)
        .number_of_key_value_heads(1)
        .vocabulary_size(20)
        .context_length(10)
        .build()
}

#[test]
fn test_buffer_shapes() -> Result<()> {
    let config = config()?;
    let state = InferenceState::new(&config, 5);

    assert_eq!(state.x.len(), 32);
    assert_eq!(state.hb.len(), 48);
    assert_eq!(state.k.len(), 8);
    assert_eq!(state.v.len(), 8);
    assert_eq!(state.att.len(), 4 * 10);
    assert_eq!(state.logits().len(), 20);
    assert_eq!(state.key_cache.len(), 3);
    assert!(state.key_cache.iter().chain(&state.value_cache).all(|layer| layer.len() == 10 * 8));
    assert_eq!(state.context_length(), 10);
    Ok(())
}

#[test]
fn test_starts_empty_with_start_token() -> Result<()> {
    let state = InferenceState::new(&config()?, 5);

    assert_eq!(state.position(), 0);
    assert_eq!(state.latest_token, 5);
    Ok(())
}

#[test]
fn test_commit_and_reset() -> Result<()> {
    let mut state = InferenceState::new(&config()?, 5);

    state.commit(0);
    state.commit(1);
    state.latest_token = 9;
    assert_eq!(state.position(), 2);

    // rewinding truncates everything after the rewritten position
    state.commit(0);
    assert_eq!(state.position(), 1);

    state.reset(3);
    assert_eq!(state.position(), 0);
    assert_eq!(state.latest_token, 3);
    Ok(())
}

#[test]
fn test_fits_only_matching_shapes() -> Result<()> {
    let config = config()?;
    let mut state = InferenceState::new(&config, 0);
    assert!(state.fits(&config));
    assert!(state.fits(&config.with_context_length(Some(4))?));

    let wider = Configuration { dim: 64, ..config.clone() };
    assert!(!InferenceState::new(&wider, 0).fits(&config));
    assert!(!state.fits(&wider));

    state.logits.truncate(10);
    assert!(!state.fits(&config));
    Ok(())
}
