//! Convergence diagnostics over stored chains.

use super::{ParameterKind, PosteriorStore, StoreError};
use crate::utils::usize_to_f64;

/// Running mean and sum of squared deviations (Welford).
#[derive(Debug, Clone, Copy, Default)]
struct Moments {
    count: usize,
    mean: f64,
    squares: f64,
}

impl Moments {
    fn of(values: &[f64]) -> Self {
        values.iter().fold(Self::default(), |mut moments, value| {
            moments.count += 1;
            let delta = value - moments.mean;
            moments.mean += delta / usize_to_f64(moments.count);
            moments.squares += delta * (value - moments.mean);
            moments
        })
    }

    /// Unbiased variance; zero below two values.
    fn variance(self) -> f64 {
        if self.count < 2 {
            0.0
        } else {
            self.squares / usize_to_f64(self.count - 1)
        }
    }
}

/// One chain with its mean removed.
struct Centered(Vec<f64>);

impl Centered {
    fn new(series: &[f64]) -> Self {
        let mean = Moments::of(series).mean;
        Self(series.iter().map(|value| value - mean).collect())
    }

    /// Autocovariance at `lag`, normalised by the chain length.
    fn autocovariance(&self, lag: usize) -> f64 {
        let n = self.0.len();
        if lag >= n {
            return 0.0;
        }
        self.0[..n - lag]
            .iter()
            .zip(&self.0[lag..])
            .map(|(a, b)| a * b)
            .sum::<f64>()
            / usize_to_f64(n)
    }
}

/// Lag-`k` autocorrelation of one chain; zero for an empty or constant
/// chain and for `lag` at or past its length.
#[must_use]
pub fn autocorrelation(series: &[f64], lag: usize) -> f64 {
    let centered = Centered::new(series);
    let variance = centered.autocovariance(0);
    if variance <= 0.0 {
        return 0.0;
    }
    centered.autocovariance(lag) / variance
}

/// Effective sample size of one chain by Geyer's initial positive
/// sequence: autocorrelations are summed in adjacent pairs until a pair
/// turns non-positive. Never exceeds the chain length.
#[must_use]
pub fn effective_sample_size(series: &[f64]) -> f64 {
    let n = series.len();
    let centered = Centered::new(series);
    let variance = centered.autocovariance(0);
    if n < 4 || variance <= 0.0 {
        return usize_to_f64(n);
    }
    let rho = |lag: usize| centered.autocovariance(lag) / variance;

    let mut pair_sum = 0.0;
    for pair in (0..n / 2).map(|k| rho(2 * k) + rho(2 * k + 1)) {
        if pair <= 0.0 {
            break;
        }
        pair_sum += pair;
    }
    let tau = 2.0f64.mul_add(pair_sum, -1.0).max(1.0);
    usize_to_f64(n) / tau
}

/// Split-R-hat of equally long chains. Each chain is halved, so at least
/// two draws per half are needed; otherwise `None`.
#[must_use]
pub fn split_rhat(chains: &[Vec<f64>]) -> Option<f64> {
    let draws = chains.iter().map(Vec::len).min()?;
    let half = draws / 2;
    if half < 2 {
        return None;
    }
    let halves: Vec<Moments> = chains
        .iter()
        .flat_map(|chain| [Moments::of(&chain[..half]), Moments::of(&chain[half..2 * half])])
        .collect();
    Some(potential_scale_reduction(&halves, half))
}

/// Gelman-Rubin ratio from per-sequence moments of `len` draws each.
/// Degenerate inputs (zero within-sequence variance) give `1`.
fn potential_scale_reduction(sequences: &[Moments], len: usize) -> f64 {
    let n = usize_to_f64(len);
    let means: Vec<f64> = sequences.iter().map(|moments| moments.mean).collect();
    let between = n * Moments::of(&means).variance();
    let within = sequences.iter().map(|moments| moments.variance()).sum::<f64>()
        / usize_to_f64(sequences.len());
    if !(within > 0.0 && within.is_finite() && between.is_finite()) {
        return 1.0;
    }
    let pooled = ((n - 1.0) / n).mul_add(within, between / n);
    (pooled / within).sqrt().max(1.0)
}

/// Convergence diagnostics of one scalar component.
#[derive(Debug, Clone, PartialEq)]
pub struct ComponentConvergence {
    pub label: String,
    /// `None` when there are too few draws to split the chains.
    pub split_rhat: Option<f64>,
    /// Sum of the per-chain effective sample sizes.
    pub effective_sample_size: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConvergenceSummary {
    pub chain_count: usize,
    pub draws_per_chain: usize,
    pub components: Vec<ComponentConvergence>,
}

impl ConvergenceSummary {
    #[must_use]
    pub fn max_split_rhat(&self) -> Option<f64> {
        self.components
            .iter()
            .filter_map(|component| component.split_rhat)
            .max_by(f64::total_cmp)
    }
}

/// Split-R-hat and effective sample size of every parameter and derived
/// scalar in the store.
///
/// # Errors
///
/// Returns `StoreError` if the store layout is inconsistent.
pub fn convergence(store: &PosteriorStore) -> Result<ConvergenceSummary, StoreError> {
    let mut components = Vec::new();
    for layout in store.layouts() {
        if !matches!(layout.kind, ParameterKind::Parameter | ParameterKind::Derived) {
            continue;
        }
        for index in 0..layout.len {
            let chains = store.chain_series(&layout.name, index)?;
            components.push(ComponentConvergence {
                label: layout.component_label(index),
                split_rhat: split_rhat(&chains),
                effective_sample_size: chains
                    .iter()
                    .map(|chain| effective_sample_size(chain))
                    .sum(),
            });
        }
    }
    Ok(ConvergenceSummary {
        chain_count: store.chain_count(),
        draws_per_chain: store.draws_per_chain(),
        components,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::posterior::ParameterLayout;
    use crate::utils::sample_standard_normal;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn lag_past_the_chain_has_no_correlation() {
        assert!(autocorrelation(&[1.0, 2.0], 2).abs() < f64::EPSILON);
        assert!(autocorrelation(&[], 0).abs() < f64::EPSILON);
        assert!(autocorrelation(&[3.0; 5], 1).abs() < f64::EPSILON);
    }

    #[test]
    fn alternating_chain_is_negatively_correlated() {
        let series: Vec<f64> = (0..20).map(|i| if i % 2 == 0 { 1.0 } else { -1.0 }).collect();
        assert!(autocorrelation(&series, 1) < -0.9);
        assert!(autocorrelation(&series, 2) > 0.8);
    }

    #[test]
    fn sticky_chain_has_fewer_effective_draws() {
        let mut rng = StdRng::seed_from_u64(12);
        let independent: Vec<f64> = (0..400).map(|_| sample_standard_normal(&mut rng)).collect();
        let mut sticky = vec![0.0];
        for _ in 1..400 {
            let previous = sticky[sticky.len() - 1];
            sticky.push(0.95f64.mul_add(previous, 0.3 * sample_standard_normal(&mut rng)));
        }
        let fresh = effective_sample_size(&independent);
        let slow = effective_sample_size(&sticky);
        assert!(fresh <= 400.0 && fresh > 200.0, "independent ess {fresh}");
        assert!(slow < 60.0, "sticky ess {slow}");
    }

    #[test]
    fn moments_match_two_pass_variance() {
        let moments = Moments::of(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]);
        assert!((moments.mean - 5.0).abs() < 1e-12);
        assert!((moments.variance() - 32.0 / 7.0).abs() < 1e-12);
    }

    #[test]
    fn split_rhat_needs_four_draws() {
        assert!(split_rhat(&[vec![0.0, 1.0, 2.0], vec![0.0, 1.0, 2.0]]).is_none());
    }

    #[test]
    fn well_mixed_chains_have_rhat_near_one() {
        let mut rng = StdRng::seed_from_u64(5);
        let chains: Vec<Vec<f64>> = (0..3)
            .map(|_| (0..500).map(|_| sample_standard_normal(&mut rng)).collect())
            .collect();
        let rhat = split_rhat(&chains).expect("enough draws");
        assert!(rhat < 1.05, "rhat = {rhat}");
    }

    #[test]
    fn separated_chains_are_flagged() {
        let chains = vec![vec![0.0, 0.1, 0.0, 0.1], vec![5.0, 5.1, 5.0, 5.1]];
        let rhat = split_rhat(&chains).expect("enough draws");
        assert!(rhat > 2.0);
    }

    #[test]
    fn convergence_covers_parameters_only() {
        let layout = vec![
            ParameterLayout::new("mu", ParameterKind::Parameter, 0, 1),
            ParameterLayout::new("x", ParameterKind::Latent, 1, 1),
        ];
        let chain = |offset: f64| -> Vec<Vec<f64>> {
            (0..8)
                .map(|i| vec![offset + f64::from(i % 2), 0.0])
                .collect()
        };
        let store =
            PosteriorStore::new(layout, vec![(0, chain(0.0)), (1, chain(0.1))]).expect("store");
        let summary = convergence(&store).expect("diagnostics");
        assert_eq!(summary.components.len(), 1);
        assert_eq!(summary.chain_count, 2);
        assert!(summary.max_split_rhat().is_some());
    }
}
