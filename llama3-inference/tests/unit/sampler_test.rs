use super::*;
use anyhow::Result;

fn draw(sampler: &mut dyn Sampler, logits: &[f32], count: usize) -> Vec<usize> {
    (0..count).map(|_| sampler.sample_token(&mut logits.to_vec())).collect()
}

#[test]
fn test_argmax() {
    let mut sampler = ArgmaxSampler;

    assert_eq!(sampler.sample_token(&mut [0.1, 3.0, -2.0, 2.9]), 1);
    assert_eq!(sampler.sample_token(&mut [-5.0]), 0);
}

#[test]
fn test_categorical_follows_distribution() {
    let mut sampler = CategoricalSampler::new(1234);

    assert!(draw(&mut sampler, &[0.0, 1.0, 0.0], 50).iter().all(|&token| token == 1));

    let tokens = draw(&mut sampler, &[0.5, 0.5], 400);
    let ones = tokens.iter().filter(|&&token| token == 1).count();
    assert!((120..280).contains(&ones), "{ones} of 400 draws picked token 1");
}

#[test]
fn test_topp_restricts_to_nucleus() {
    let mut sampler = ToppSampler::new(4, 0.5, 99);

    // token 2 alone exceeds the threshold
    let tokens = draw(&mut sampler, &[0.1, 0.1, 0.7, 0.1], 100);
    assert!(tokens.iter().all(|&token| token == 2));

    let mut sampler = ToppSampler::new(4, 0.9, 99);
    let tokens = draw(&mut sampler, &[0.02, 0.48, 0.48, 0.02], 200);
    assert!(tokens.iter().all(|&token| token == 1 || token == 2));
}

#[test]
fn test_seeded_samplers_are_reproducible() -> Result<()> {
    let logits = [0.3, 1.2, -0.4, 0.9, 0.0, 1.1];
    let config = SamplerConfig { temperature: 0.8, topp: 0.9, seed: 7 };

    let first = draw(&mut config.build(logits.len())?, &logits, 50);
    let second = draw(&mut config.build(logits.len())?, &logits, 50);
    assert_eq!(first, second);

    let other_seed = SamplerConfig { seed: 8, ..config };
    assert_ne!(first, draw(&mut other_seed.build(logits.len())?, &logits, 50));
    Ok(())
}

#[test]
fn test_zero_temperature_is_greedy() -> Result<()> {
    let logits = [0.3, 1.2, -0.4, 1.1];
    let mut sampler = SamplerConfig { temperature: 0.0, topp: 0.9, seed: 1 }.build(logits.len())?;

    assert!(draw(&mut sampler, &logits, 20).iter().all(|&token| token == 1));
    Ok(())
}

#[test]
fn test_temperature_turns_logits_into_probabilities() {
    struct Capture(Vec<f32>);

    impl Sampler for Capture {
        fn sample_token(&mut self, probabilities: &mut [f32]) -> usize {
            self.0 = probabilities.to_vec();
            0
        }
    }

    let mut sampler = TemperatureSampler::new(0.5, Capture(Vec::new()));
    sampler.sample_token(&mut [1.0, 2.0, 3.0]);

    let probabilities = &sampler.inner.0;
    assert!((probabilities.iter().sum::<f32>() - 1.0).abs() < 1e-6);
    // halving the temperature doubles the logit gaps
    assert!((probabilities[2] / probabilities[1] - 2.0f32.exp()).abs() < 1e-3);
}

#[test]
fn test_build_rejects_invalid_parameters() {
    assert!(SamplerConfig { temperature: -1.0, ..SamplerConfig::default() }.build(10).is_err());
    assert!(SamplerConfig { temperature: f32::NAN, ..SamplerConfig::default() }.build(10).is_err());
    assert!(SamplerConfig::default().build(0).is_err());
}

#[test]
fn test_rng_is_deterministic_and_in_range() {
    let mut a = XorShiftRng::new(0);
    let mut b = XorShiftRng::new(0);

    for _ in 0..1000 {
        let value = a.next_f32();
        assert!((0.0..1.0).contains(&value));
        assert_eq!(value, b.next_f32());
    }
}
