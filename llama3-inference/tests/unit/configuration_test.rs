use super::*;
use anyhow::Result;
use std::fs;
use tempfile::TempDir;

fn small_builder() -> ConfigurationBuilder {
    Configuration::builder()
        .dim(64)
        .hidden_dim(128)
        .number_of_layers(2)
        .number_of_heads(8)
        .number_of_key_value_heads(2)
        .vocabulary_size(100)
        .context_length(32)
}

#[test]
fn test_builder_derived_sizes() -> Result<()> {
    let config = small_builder().build()?;

    assert_eq!(config.head_size(), 8);
    assert_eq!(config.kv_dim(), 16);
    assert_eq!(config.kv_mul(), 4);
    assert_eq!(config.rms_norm_eps, DEFAULT_RMS_NORM_EPS);
    assert_eq!(config.rope_theta, DEFAULT_ROPE_THETA);
    Ok(())
}

#[test]
fn test_builder_defaults_kv_heads_to_heads() -> Result<()> {
    let config = Configuration::builder()
        .dim(32)
        .hidden_dim(64)
        .number_of_layers(1)
        .number_of_heads(4)
        .vocabulary_size(10)
        .context_length(8)
        .build()?;

    assert_eq!(config.number_of_key_value_heads, 4);
    assert_eq!(config.kv_mul(), 1);
    assert_eq!(config.kv_dim(), 32);
    Ok(())
}

#[test]
fn test_builder_missing_field() {
    let err = Configuration::builder().number_of_heads(4).build().unwrap_err();
    assert_eq!(err.to_string(), "dim is required");
}

#[test]
fn test_builder_rejects_invalid_shapes() {
    let cases = [
        (small_builder().vocabulary_size(0), "Invalid vocabulary_size: must be positive"),
        (small_builder().dim(60), "dim 60 is not divisible by number_of_heads 8"),
        (small_builder().number_of_key_value_heads(3), "is not a multiple of number_of_key_value_heads 3"),
        (small_builder().dim(24), "head size 3 must be even"),
        (small_builder().rms_norm_eps(0.0), "Invalid rms_norm_eps"),
        (small_builder().rope_theta(f32::NAN), "Invalid rope_theta"),
    ];

    for (builder, expected) in cases {
        let err = builder.build().unwrap_err();
        let message = format!("{err:#}");
        assert!(message.starts_with("Invalid model configuration"), "{message}");
        assert!(message.contains(expected), "{message} does not mention {expected}");
    }
}

#[test]
fn test_with_context_length_only_shrinks() -> Result<()> {
    let config = small_builder().build()?;

    assert_eq!(config.with_context_length(None)?.context_length, 32);
    assert_eq!(config.with_context_length(Some(16))?.context_length, 16);
    assert_eq!(config.with_context_length(Some(1000))?.context_length, 32);
    assert!(config.with_context_length(Some(0)).is_err());

    let shrunk = config.with_context_length(Some(16))?;
    assert_eq!(shrunk.dim, config.dim);
    assert_eq!(shrunk.number_of_key_value_heads, config.number_of_key_value_heads);
    Ok(())
}

#[test]
fn test_from_hf_json() -> Result<()> {
    let config = Configuration::from_hf_json(
        r#"{
            "architectures": ["LlamaForCausalLM"],
            "hidden_size": 2048,
            "intermediate_size": 8192,
            "num_hidden_layers": 16,
            "num_attention_heads": 32,
            "num_key_value_heads": 8,
            "vocab_size": 128256,
            "max_position_embeddings": 131072,
            "rms_norm_eps": 1e-5,
            "rope_theta": 500000.0,
            "bos_token_id": 128000
        }"#,
    )?;

    assert_eq!(config.dim, 2048);
    assert_eq!(config.hidden_dim, 8192);
    assert_eq!(config.number_of_layers, 16);
    assert_eq!(config.number_of_heads, 32);
    assert_eq!(config.number_of_key_value_heads, 8);
    assert_eq!(config.vocabulary_size, 128256);
    assert_eq!(config.context_length, 131072);
    assert_eq!(config.head_size(), 64);
    assert_eq!(config.rope_theta, 500000.0);
    Ok(())
}

#[test]
fn test_from_hf_json_defaults() -> Result<()> {
    let config = Configuration::from_hf_json(
        r#"{
            "hidden_size": 64,
            "intermediate_size": 128,
            "num_hidden_layers": 1,
            "num_attention_heads": 4,
            "vocab_size": 50,
            "max_position_embeddings": 16
        }"#,
    )?;

    assert_eq!(config.number_of_key_value_heads, 4);
    assert_eq!(config.rms_norm_eps, DEFAULT_RMS_NORM_EPS);
    assert_eq!(config.rope_theta, DEFAULT_ROPE_THETA);
    Ok(())
}

#[test]
fn test_from_hf_json_invalid() {
    let err = Configuration::from_hf_json("invalid json").unwrap_err();
    assert!(err.to_string().starts_with("Failed to parse config.json"));

    let err = Configuration::from_hf_json(r#"{"hidden_size": 64}"#).unwrap_err();
    assert!(err.to_string().contains("intermediate_size"));
}

#[test]
fn test_from_hf_file() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let path = temp_dir.path().join("config.json");
    fs::write(
        &path,
        r#"{
            "hidden_size": 64,
            "intermediate_size": 128,
            "num_hidden_layers": 2,
            "num_attention_heads": 4,
            "num_key_value_heads": 2,
            "vocab_size": 50,
            "max_position_embeddings": 16
        }"#,
    )?;

    let config = Configuration::from_hf_file(&path)?;
    assert_eq!(config.kv_dim(), 32);

    assert!(Configuration::from_hf_file(temp_dir.path().join("missing.json")).is_err());
    Ok(())
}
