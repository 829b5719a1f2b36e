//! Log-density helpers shared by priors, likelihoods and latent nodes.

use statrs::function::gamma::ln_gamma;

/// Logistic transform through `tanh`, which saturates instead of
/// overflowing for large logits.
#[must_use]
pub fn logistic(value: f64) -> f64 {
    0.5f64.mul_add((0.5 * value).tanh(), 0.5)
}

/// Log-density for `Normal(mean, sd)`.
#[must_use]
pub fn log_normal_density(value: f64, mean: f64, sd: f64) -> f64 {
    if !(sd > 0.0 && sd.is_finite()) {
        return f64::NEG_INFINITY;
    }
    let z = (value - mean) / sd;
    -0.5 * z.mul_add(z, std::f64::consts::TAU.ln()) - sd.ln()
}

/// Log-density for `Uniform(low, high)`.
#[must_use]
pub fn log_uniform_density(value: f64, low: f64, high: f64) -> f64 {
    if low.partial_cmp(&high) != Some(std::cmp::Ordering::Less) {
        return f64::NAN;
    }
    if (low..=high).contains(&value) {
        -(high - low).ln()
    } else {
        f64::NEG_INFINITY
    }
}

/// Log-density for `Gamma(shape, rate)`.
#[must_use]
pub fn log_gamma_density(value: f64, shape: f64, rate: f64) -> f64 {
    if !(value > 0.0 && shape > 0.0 && rate > 0.0) {
        return f64::NEG_INFINITY;
    }
    shape.mul_add(rate.ln(), -ln_gamma(shape)) + (shape - 1.0).mul_add(value.ln(), -rate * value)
}

/// Log-density for a half-normal with scale `sd` on `[0, inf)`.
#[must_use]
pub fn log_half_normal_density(value: f64, sd: f64) -> f64 {
    if value < 0.0 {
        return f64::NEG_INFINITY;
    }
    std::f64::consts::LN_2 + log_normal_density(value, 0.0, sd)
}

/// Log-mass of a 0/1 outcome under a Bernoulli with logit `eta`.
#[must_use]
pub fn bernoulli_logit_log_mass(outcome: f64, eta: f64) -> f64 {
    // log(1 + exp(eta)) without overflow
    let softplus = if eta > 0.0 {
        eta + (-eta).exp().ln_1p()
    } else {
        eta.exp().ln_1p()
    };
    if outcome >= 0.5 {
        eta - softplus
    } else {
        -softplus
    }
}
