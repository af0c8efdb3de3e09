//! In-place kernels over activation vectors.

#[cfg(test)]
#[path = "../tests/unit/ops_test.rs"]
mod ops_test;

/// `y += x`
pub fn add_in_place(y: &mut [f32], x: &[f32]) {
    debug_assert_eq!(y.len(), x.len());
    y.iter_mut().zip(x).for_each(|(y_val, &x_val)| *y_val += x_val);
}

/// `y *= x`, elementwise.
pub fn multiply_in_place(y: &mut [f32], x: &[f32]) {
    debug_assert_eq!(y.len(), x.len());
    y.iter_mut().zip(x).for_each(|(y_val, &x_val)| *y_val *= x_val);
}

/// `y += a * x`
pub fn saxpy_in_place(y: &mut [f32], x: &[f32], a: f32) {
    debug_assert_eq!(y.len(), x.len());
    y.iter_mut().zip(x).for_each(|(y_val, &x_val)| *y_val += a * x_val);
}

pub fn divide_in_place(y: &mut [f32], value: f32) {
    let inv = value.recip();
    y.iter_mut().for_each(|val| *val *= inv);
}

pub fn map_in_place(y: &mut [f32], f: impl Fn(f32) -> f32) {
    y.iter_mut().for_each(|val| *val = f(*val));
}

pub fn sum(x: &[f32]) -> f32 {
    x.iter().sum()
}

/// Largest element, or negative infinity for an empty slice.
pub fn max(x: &[f32]) -> f32 {
    x.iter().fold(f32::NEG_INFINITY, |acc, &val| acc.max(val))
}

/// Applies softmax normalization to a slice in-place.
pub fn softmax_in_place(x: &mut [f32]) {
    let max_val = max(x);
    let sum = x
        .iter_mut()
        .map(|val| {
            *val = (*val - max_val).exp();
            *val
        })
        .sum::<f32>();
    let inv_sum = sum.recip();
    x.iter_mut().for_each(|val| *val *= inv_sum);
}

/// SiLU activation: `x * sigmoid(x)`.
#[inline]
pub fn silu(x: f32) -> f32 {
    x * (1.0f32 + (-x).exp()).recip()
}

/// RMS normalization:
///
/// ```text
/// RMSNorm(x) = x / sqrt(mean(x²) + ε) * γ
/// ```
pub fn rmsnorm(output: &mut [f32], input: &[f32], weight: &[f32], eps: f32) {
    debug_assert_eq!(output.len(), input.len());
    debug_assert_eq!(input.len(), weight.len());

    let scale = rms_scale(input, eps);
    output.iter_mut().zip(input).zip(weight).for_each(|((out, &inp), &w)| {
        *out = w * (scale * inp);
    });
}

pub fn rmsnorm_in_place(x: &mut [f32], weight: &[f32], eps: f32) {
    debug_assert_eq!(x.len(), weight.len());

    let scale = rms_scale(x, eps);
    x.iter_mut().zip(weight).for_each(|(val, &w)| {
        *val = w * (scale * *val);
    });
}

fn rms_scale(x: &[f32], eps: f32) -> f32 {
    let sum_of_squares = x.iter().map(|&val| val * val).sum::<f32>();
    1.0f32 / ((sum_of_squares / x.len() as f32) + eps).sqrt()
}
