//! Posterior summaries: mean, standard deviation, median and equal-tailed
//! credible interval per component.

use thiserror::Error;

use super::{ParameterKind, PosteriorStore, StoreError};
use crate::utils::{percentile, sorted_copy, usize_to_f64};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum SummaryError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("`{name}` has {draws} draws; at least 2 are needed")]
    InsufficientSamples { name: String, draws: usize },
    #[error("credible level {level} must lie strictly between 0 and 1")]
    InvalidCredibleLevel { level: f64 },
}

/// Summary of one scalar component.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterSummary {
    pub label: String,
    pub mean: f64,
    pub std_dev: f64,
    pub median: f64,
    pub lower: f64,
    pub upper: f64,
    pub draws: usize,
}

impl ParameterSummary {
    #[must_use]
    pub fn contains(&self, value: f64) -> bool {
        (self.lower..=self.upper).contains(&value)
    }

    #[must_use]
    pub fn width(&self) -> f64 {
        self.upper - self.lower
    }
}

/// Summarize every component of `name` over the pooled draws of all chains.
///
/// The interval is equal-tailed: its bounds are the `(1 - level) / 2` and
/// `(1 + level) / 2` percentiles, interpolated linearly between order
/// statistics.
///
/// # Errors
///
/// Returns `SummaryError::Store` for an unknown name,
/// `InsufficientSamples` for fewer than two draws and
/// `InvalidCredibleLevel` for `level` outside `(0, 1)`.
pub fn summarize(
    store: &PosteriorStore,
    name: &str,
    level: f64,
) -> Result<Vec<ParameterSummary>, SummaryError> {
    check_level(level)?;
    let layout = store.layout(name)?;
    (0..layout.len)
        .map(|index| {
            let values = store.extract_component(name, index)?;
            summarize_values(&layout.component_label(index), &values, level)
        })
        .collect()
}

/// Summaries for every parameter and derived scalar in the store.
///
/// # Errors
///
/// Returns `SummaryError` as for [`summarize`].
pub fn summarize_all(
    store: &PosteriorStore,
    level: f64,
) -> Result<Vec<ParameterSummary>, SummaryError> {
    summarize_kinds(store, &[ParameterKind::Parameter, ParameterKind::Derived], level)
}

/// Summaries for every stored name of the given kinds, in layout order.
///
/// # Errors
///
/// Returns `SummaryError` as for [`summarize`].
pub fn summarize_kinds(
    store: &PosteriorStore,
    kinds: &[ParameterKind],
    level: f64,
) -> Result<Vec<ParameterSummary>, SummaryError> {
    check_level(level)?;
    let mut summaries = Vec::new();
    for layout in store.layouts() {
        if kinds.contains(&layout.kind) {
            summaries.extend(summarize(store, &layout.name, level)?);
        }
    }
    Ok(summaries)
}

/// Summary of a plain sample.
///
/// # Errors
///
/// Returns `InsufficientSamples` for fewer than two values and
/// `InvalidCredibleLevel` for `level` outside `(0, 1)`.
pub fn summarize_values(
    label: &str,
    values: &[f64],
    level: f64,
) -> Result<ParameterSummary, SummaryError> {
    check_level(level)?;
    if values.len() < 2 {
        return Err(SummaryError::InsufficientSamples {
            name: label.to_string(),
            draws: values.len(),
        });
    }

    let n = usize_to_f64(values.len());
    let mean = values.iter().sum::<f64>() / n;
    let variance = values
        .iter()
        .map(|value| {
            let centered = value - mean;
            centered * centered
        })
        .sum::<f64>()
        / (n - 1.0);
    let sorted = sorted_copy(values);
    let tail = 0.5 * (1.0 - level);

    Ok(ParameterSummary {
        label: label.to_string(),
        mean,
        std_dev: variance.sqrt(),
        median: percentile(&sorted, 0.5),
        lower: percentile(&sorted, tail),
        upper: percentile(&sorted, 1.0 - tail),
        draws: values.len(),
    })
}

fn check_level(level: f64) -> Result<(), SummaryError> {
    if level > 0.0 && level < 1.0 {
        Ok(())
    } else {
        Err(SummaryError::InvalidCredibleLevel { level })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::posterior::{ParameterLayout, contiguous_layout};
    use crate::utils::sample_standard_normal;
    use approx::assert_relative_eq;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn store_with(values: &[f64]) -> PosteriorStore {
        let layout = vec![ParameterLayout::new("theta", ParameterKind::Parameter, 0, 1)];
        let draws = values.iter().map(|value| vec![*value]).collect();
        PosteriorStore::new(layout, vec![(0, draws)]).expect("store")
    }

    #[test]
    fn interval_brackets_standard_normal_sample() {
        let mut rng = StdRng::seed_from_u64(20);
        let values: Vec<f64> = (0..1_000).map(|_| sample_standard_normal(&mut rng)).collect();
        let summary = summarize(&store_with(&values), "theta", 0.95).expect("summary");
        let theta = &summary[0];
        assert!(theta.mean.abs() < 0.1);
        assert!(theta.lower < 0.0 && theta.upper > 0.0);
        assert!(theta.lower > -2.3 && theta.lower < -1.6);
        assert!(theta.upper > 1.6 && theta.upper < 2.3);
    }

    #[test]
    fn summaries_are_idempotent() {
        let store = store_with(&[0.3, -1.2, 2.5, 0.0, 0.7]);
        let first = summarize(&store, "theta", 0.9).expect("first");
        let second = summarize(&store, "theta", 0.9).expect("second");
        assert_eq!(first, second);
    }

    #[test]
    fn interval_uses_linear_interpolation() {
        let summary = summarize_values("x", &[4.0, 1.0, 3.0, 2.0, 5.0], 0.5).expect("summary");
        assert_relative_eq!(summary.median, 3.0);
        assert_relative_eq!(summary.lower, 2.0);
        assert_relative_eq!(summary.upper, 4.0);
        assert_relative_eq!(summary.mean, 3.0);
        assert_relative_eq!(summary.std_dev, 2.5_f64.sqrt());
    }

    #[test]
    fn single_draw_is_insufficient() {
        let err = summarize(&store_with(&[1.0]), "theta", 0.95).expect_err("one draw");
        assert_eq!(
            err,
            SummaryError::InsufficientSamples {
                name: "theta".to_string(),
                draws: 1
            }
        );
    }

    #[test]
    fn credible_level_must_be_a_probability() {
        let store = store_with(&[1.0, 2.0, 3.0]);
        for level in [0.0, 1.0, 1.5, f64::NAN] {
            assert!(matches!(
                summarize(&store, "theta", level),
                Err(SummaryError::InvalidCredibleLevel { .. })
            ));
        }
    }

    #[test]
    fn summarize_all_skips_latent_and_generated_entries() {
        let layout = contiguous_layout([
            ("alpha", ParameterKind::Parameter, 1),
            ("x", ParameterKind::Latent, 2),
            ("epsilon", ParameterKind::Derived, 1),
            ("ypred", ParameterKind::Generated, 3),
        ]);
        let draws = vec![vec![0.0; 7], vec![1.0; 7]];
        let store = PosteriorStore::new(layout, vec![(0, draws)]).expect("store");
        let labels: Vec<String> = summarize_all(&store, 0.95)
            .expect("summaries")
            .into_iter()
            .map(|summary| summary.label)
            .collect();
        assert_eq!(labels, ["alpha", "epsilon"]);
    }
}
