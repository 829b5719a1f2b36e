/////////////////////////////////////////////////////////////////////////////////////////////\
//
// Numeric helpers shared across the crate.
//
// Created on: 15 Oct 2026
//
/////////////////////////////////////////////////////////////////////////////////////////////

//! # Utilities
//!
//! Shared numeric helpers: index conversions, order-statistic percentiles,
//! standard-normal draws and column reads from faer matrices.

use faer::Mat;
use num_traits::ToPrimitive;
use rand::RngExt;
use rand::rngs::StdRng;

#[must_use]
pub fn usize_to_f64(value: usize) -> f64 {
    f64::from(u32::try_from(value).unwrap_or(u32::MAX))
}

/// Percentile of an ascending-sorted slice using linear interpolation between
/// order statistics. Returns `NaN` for an empty slice.
#[must_use]
pub fn percentile(sorted_values: &[f64], probability: f64) -> f64 {
    if sorted_values.is_empty() {
        return f64::NAN;
    }

    let clamped = probability.clamp(0.0, 1.0);
    let last = sorted_values.len() - 1;
    let position = clamped * usize_to_f64(last);
    let lower = position.floor().to_usize().unwrap_or(0).min(last);
    let upper = position.ceil().to_usize().unwrap_or(last).min(last);

    if lower == upper {
        sorted_values[lower]
    } else {
        let weight = position - usize_to_f64(lower);
        (1.0 - weight).mul_add(sorted_values[lower], weight * sorted_values[upper])
    }
}

/// Sort a copy of `values` ascending with a total order on floats.
#[must_use]
pub fn sorted_copy(values: &[f64]) -> Vec<f64> {
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    sorted
}

/// Box-Muller standard normal draw.
pub fn sample_standard_normal(rng: &mut StdRng) -> f64 {
    let u1 = (1.0_f64 - rng.random::<f64>()).max(f64::MIN_POSITIVE);
    let u2 = rng.random::<f64>();
    (-2.0_f64 * u1.ln()).sqrt() * (std::f64::consts::TAU * u2).cos()
}

#[must_use]
pub fn column_to_vec(matrix: &Mat<f64>, column: usize) -> Vec<f64> {
    (0..matrix.nrows()).map(|i| matrix[(i, column)]).collect()
}
