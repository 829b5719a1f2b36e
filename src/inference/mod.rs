//! # Inference
//!
//! Runs a model through a sampling engine chosen by name, one thread per
//! chain, and collects the healthy chains into a [`PosteriorStore`].
//!
//! Chain `c` is seeded with `seed + c * seed_stride` (wrapping), so a run is
//! reproducible for a fixed configuration. A chain that diverges or returns
//! a non-finite draw is dropped and reported in
//! [`InferenceRun::dropped_chains`]; the run fails only if every chain is
//! dropped. With a timeout set, outstanding chains are cancelled when it
//! expires and the run fails with [`InferenceError::BackendTimeout`], which
//! still carries the chains that finished in time.

use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::input::Dataset;
use crate::model::ModelSpec;
use crate::posterior::{ParameterLayout, PosteriorStore, StoreError};
use crate::utils::usize_to_f64;

pub mod engine;
pub mod jags;
pub mod metropolis;

pub use engine::{
    BackendRegistry, CancelToken, ChainRequest, CompiledModel, EngineError, RawChain, SamplerEngine,
    monitored_layout,
};
pub use jags::{JagsEngine, render_jags};
pub use metropolis::{MetropolisEngine, ProposalTuning};

/// Errors returned by [`run`].
#[derive(Debug, Error, Clone, PartialEq)]
pub enum InferenceError {
    #[error("iterations must be positive")]
    InvalidIterations,
    #[error("warmup ({warmup}) must be smaller than iterations ({iterations})")]
    InvalidWarmup { warmup: usize, iterations: usize },
    #[error("thinning interval must be positive")]
    InvalidThinning,
    #[error("at least one chain is required")]
    InvalidChainCount,
    #[error("backend `{backend}` is unavailable: {reason}")]
    BackendUnavailable { backend: String, reason: String },
    #[error("backend `{backend}` rejected the model: {reason}")]
    ModelRejected { backend: String, reason: String },
    #[error("every chain diverged ({chains:?}): {reason}")]
    NumericalDivergence { chains: Vec<usize>, reason: String },
    #[error("backend `{backend}` timed out after {timeout:?}; chains {incomplete:?} did not finish")]
    BackendTimeout {
        backend: String,
        timeout: Duration,
        incomplete: Vec<usize>,
        /// Healthy chains that reported before the timeout, if any.
        partial: Option<Box<InferenceRun>>,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Sampling schedule and backend selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct McmcConfig {
    pub chains: usize,
    /// Iterations per chain, warmup included.
    pub iterations: usize,
    pub warmup: usize,
    pub thin: usize,
    pub seed: u64,
    pub seed_stride: u64,
    pub timeout: Option<Duration>,
    pub backend: String,
}

impl Default for McmcConfig {
    fn default() -> Self {
        Self {
            chains: 4,
            iterations: 4_000,
            warmup: 1_000,
            thin: 1,
            seed: 42,
            seed_stride: 1,
            timeout: None,
            backend: "metropolis".to_string(),
        }
    }
}

impl McmcConfig {
    /// # Errors
    ///
    /// Returns `InferenceError` if schedule values are invalid.
    pub const fn validate(&self) -> Result<(), InferenceError> {
        if self.chains == 0 {
            return Err(InferenceError::InvalidChainCount);
        }
        if self.iterations == 0 {
            return Err(InferenceError::InvalidIterations);
        }
        if self.warmup >= self.iterations {
            return Err(InferenceError::InvalidWarmup {
                warmup: self.warmup,
                iterations: self.iterations,
            });
        }
        if self.thin == 0 {
            return Err(InferenceError::InvalidThinning);
        }
        Ok(())
    }

    /// Number of retained draws per chain implied by this configuration.
    #[must_use]
    pub const fn retained_draws(&self) -> usize {
        (self.iterations - self.warmup).div_ceil(self.thin)
    }

    #[must_use]
    pub fn chain_seed(&self, chain: usize) -> u64 {
        let index = u64::try_from(chain).unwrap_or(u64::MAX);
        self.seed.wrapping_add(index.wrapping_mul(self.seed_stride))
    }

    #[must_use]
    pub fn chain_request(&self, chain: usize) -> ChainRequest {
        ChainRequest {
            chain,
            seed: self.chain_seed(chain),
            iterations: self.iterations,
            warmup: self.warmup,
            thin: self.thin,
        }
    }
}

/// Proposal counters for a single Metropolis-Hastings block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProposalStats {
    pub proposed: usize,
    pub accepted: usize,
}

impl ProposalStats {
    /// Record one proposal and whether it was accepted.
    pub const fn record(&mut self, accepted: bool) {
        self.proposed += 1;
        if accepted {
            self.accepted += 1;
        }
    }

    pub const fn merge(&mut self, other: Self) {
        self.proposed += other.proposed;
        self.accepted += other.accepted;
    }

    /// Acceptance rate in `[0, 1]`, or `0` if no proposals were made.
    #[must_use]
    pub fn acceptance_rate(self) -> f64 {
        if self.proposed == 0 {
            0.0
        } else {
            usize_to_f64(self.accepted) / usize_to_f64(self.proposed)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DroppedChain {
    pub chain: usize,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChainDiagnostics {
    pub chain: usize,
    pub seed: u64,
    pub retained_draws: usize,
    pub acceptance_rate: f64,
}

/// Outcome of a successful run.
#[derive(Debug, Clone, PartialEq)]
pub struct InferenceRun {
    pub backend: String,
    pub store: PosteriorStore,
    pub dropped_chains: Vec<DroppedChain>,
    pub diagnostics: Vec<ChainDiagnostics>,
}

impl InferenceRun {
    #[must_use]
    pub fn dropped_chain_ids(&self) -> Vec<usize> {
        self.dropped_chains.iter().map(|dropped| dropped.chain).collect()
    }
}

/// Compile `model` with the configured backend, sample every chain and
/// bulk-write the healthy chains into a posterior store.
///
/// # Errors
///
/// Returns `InferenceError` for an invalid schedule, an unknown or failing
/// backend, a rejected model, a timeout, or when every chain diverges.
pub fn run(
    registry: &BackendRegistry,
    model: &ModelSpec,
    dataset: &Dataset,
    config: &McmcConfig,
) -> Result<InferenceRun, InferenceError> {
    config.validate()?;
    let backend = config.backend.clone();
    let engine = registry
        .get(&backend)
        .ok_or_else(|| InferenceError::BackendUnavailable {
            backend: backend.clone(),
            reason: format!("not registered (known: {:?})", registry.names()),
        })?;

    log::debug!("compiling model for backend `{backend}`");
    let compiled: Arc<dyn CompiledModel> = Arc::from(
        engine
            .compile(model, dataset)
            .map_err(|err| engine_failure(&backend, err))?,
    );
    log::info!(
        "sampling {} chains x {} iterations ({} warmup, thin {}) with `{backend}`",
        config.chains,
        config.iterations,
        config.warmup,
        config.thin
    );

    let Collected {
        outcomes,
        timed_out,
    } = sample_chains(&compiled, config)?;

    let width = compiled
        .layout()
        .iter()
        .map(|entry| entry.offset + entry.len)
        .max()
        .unwrap_or(0);
    let mut healthy = Vec::with_capacity(config.chains);
    let mut dropped = Vec::new();
    let mut diagnostics = Vec::with_capacity(config.chains);

    for (chain, outcome) in outcomes {
        let raw = match outcome {
            Ok(raw) => raw,
            Err(EngineError::Diverged { iteration, reason }) => {
                log::warn!("dropping chain {chain}: diverged at iteration {iteration}: {reason}");
                dropped.push(DroppedChain {
                    chain,
                    reason: format!("diverged at iteration {iteration}: {reason}"),
                });
                continue;
            }
            Err(err @ (EngineError::Unavailable { .. } | EngineError::Rejected { .. })) => {
                return Err(engine_failure(&backend, err));
            }
            Err(EngineError::Cancelled) => {
                dropped.push(DroppedChain {
                    chain,
                    reason: "cancelled".to_string(),
                });
                continue;
            }
        };

        if let Some(reason) = unhealthy_draws(&raw, width, config.retained_draws()) {
            log::warn!("dropping chain {chain}: {reason}");
            dropped.push(DroppedChain { chain, reason });
            continue;
        }
        diagnostics.push(ChainDiagnostics {
            chain,
            seed: config.chain_seed(chain),
            retained_draws: raw.draws.len(),
            acceptance_rate: raw.stats.acceptance_rate(),
        });
        healthy.push((chain, raw.draws));
    }

    if !timed_out.is_empty() {
        let partial = if healthy.is_empty() {
            None
        } else {
            let run = InferenceRun {
                backend: backend.clone(),
                store: build_store(compiled.layout(), healthy, dataset)?,
                dropped_chains: dropped,
                diagnostics,
            };
            Some(Box::new(run))
        };
        return Err(InferenceError::BackendTimeout {
            backend,
            timeout: config.timeout.unwrap_or_default(),
            incomplete: timed_out,
            partial,
        });
    }

    if healthy.is_empty() {
        let reason = dropped
            .first()
            .map_or_else(|| "no chain reported".to_string(), |first| first.reason.clone());
        return Err(InferenceError::NumericalDivergence {
            chains: dropped.iter().map(|entry| entry.chain).collect(),
            reason,
        });
    }

    let store = build_store(compiled.layout(), healthy, dataset)?;
    log::info!(
        "stored {} chains x {} draws; dropped {}",
        store.chain_count(),
        store.draws_per_chain(),
        dropped.len()
    );
    Ok(InferenceRun {
        backend,
        store,
        dropped_chains: dropped,
        diagnostics,
    })
}

fn build_store(
    layout: &[ParameterLayout],
    healthy: Vec<(usize, Vec<Vec<f64>>)>,
    dataset: &Dataset,
) -> Result<PosteriorStore, InferenceError> {
    let store = PosteriorStore::new(layout.to_vec(), healthy)?;
    Ok(match dataset.prediction_grid() {
        Some(grid) => store.with_prediction_grid(grid.clone()),
        None => store,
    })
}

type ChainOutcome = Result<RawChain, EngineError>;

struct Collected {
    outcomes: BTreeMap<usize, ChainOutcome>,
    /// Chains still running when the timeout expired.
    timed_out: Vec<usize>,
}

/// Run every chain on its own thread and collect outcomes by chain index.
/// Threads are detached so a timeout returns without waiting for them.
fn sample_chains(
    compiled: &Arc<dyn CompiledModel>,
    config: &McmcConfig,
) -> Result<Collected, InferenceError> {
    let cancel = CancelToken::default();
    let (sender, receiver) = mpsc::channel::<(usize, ChainOutcome)>();

    for chain in 0..config.chains {
        let request = config.chain_request(chain);
        let compiled = Arc::clone(compiled);
        let cancel = cancel.clone();
        let sender = sender.clone();
        std::thread::Builder::new()
            .name(format!("chain-{chain}"))
            .spawn(move || {
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                    compiled.sample_chain(&request, &cancel)
                }))
                .unwrap_or_else(|_| {
                    Err(EngineError::Diverged {
                        iteration: 0,
                        reason: "sampler panicked".to_string(),
                    })
                });
                // the receiver is gone once the run has timed out
                let _ = sender.send((chain, outcome));
            })
            .map_err(|err| InferenceError::BackendUnavailable {
                backend: config.backend.clone(),
                reason: format!("cannot spawn chain thread: {err}"),
            })?;
    }
    drop(sender);

    let deadline = config.timeout.map(|timeout| Instant::now() + timeout);
    let mut outcomes = BTreeMap::new();
    while outcomes.len() < config.chains {
        let received = match deadline {
            Some(deadline) => {
                receiver.recv_timeout(deadline.saturating_duration_since(Instant::now()))
            }
            None => receiver.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };
        match received {
            Ok((chain, outcome)) => {
                outcomes.insert(chain, outcome);
            }
            Err(RecvTimeoutError::Timeout) => {
                cancel.cancel();
                let incomplete: Vec<usize> = (0..config.chains)
                    .filter(|chain| !outcomes.contains_key(chain))
                    .collect();
                log::warn!(
                    "backend `{}` timed out; cancelling chains {incomplete:?}",
                    config.backend
                );
                return Ok(Collected {
                    outcomes,
                    timed_out: incomplete,
                });
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    for chain in 0..config.chains {
        outcomes.entry(chain).or_insert_with(|| {
            Err(EngineError::Diverged {
                iteration: 0,
                reason: "chain exited without reporting".to_string(),
            })
        });
    }
    Ok(Collected {
        outcomes,
        timed_out: Vec::new(),
    })
}

fn unhealthy_draws(raw: &RawChain, width: usize, expected: usize) -> Option<String> {
    if raw.draws.len() != expected {
        return Some(format!(
            "returned {} draws; expected {expected}",
            raw.draws.len()
        ));
    }
    for (index, draw) in raw.draws.iter().enumerate() {
        if draw.len() != width {
            return Some(format!(
                "draw {index} has width {}; expected {width}",
                draw.len()
            ));
        }
        if draw.iter().any(|value| !value.is_finite()) {
            return Some(format!("non-finite value in draw {index}"));
        }
    }
    None
}

fn engine_failure(backend: &str, err: EngineError) -> InferenceError {
    match err {
        EngineError::Rejected { reason } => InferenceError::ModelRejected {
            backend: backend.to_string(),
            reason,
        },
        EngineError::Unavailable { reason } => InferenceError::BackendUnavailable {
            backend: backend.to_string(),
            reason,
        },
        EngineError::Diverged { iteration, reason } => InferenceError::NumericalDivergence {
            chains: Vec::new(),
            reason: format!("iteration {iteration}: {reason}"),
        },
        EngineError::Cancelled => InferenceError::BackendUnavailable {
            backend: backend.to_string(),
            reason: "cancelled".to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_validation_rejects_zero_iterations() {
        let config = McmcConfig {
            iterations: 0,
            ..McmcConfig::default()
        };
        assert_eq!(config.validate(), Err(InferenceError::InvalidIterations));
    }

    #[test]
    fn config_validation_rejects_warmup_past_iterations() {
        let config = McmcConfig {
            iterations: 100,
            warmup: 100,
            ..McmcConfig::default()
        };
        assert_eq!(
            config.validate(),
            Err(InferenceError::InvalidWarmup {
                warmup: 100,
                iterations: 100
            })
        );
        let no_chains = McmcConfig {
            chains: 0,
            ..McmcConfig::default()
        };
        assert_eq!(no_chains.validate(), Err(InferenceError::InvalidChainCount));
    }

    #[test]
    fn chain_seeds_follow_stride() {
        let config = McmcConfig {
            seed: 10,
            seed_stride: 1_000,
            ..McmcConfig::default()
        };
        assert_eq!(config.chain_seed(0), 10);
        assert_eq!(config.chain_seed(3), 3_010);
    }

    #[test]
    fn retained_draws_counts_first_post_warmup_draw() {
        let config = McmcConfig {
            iterations: 11,
            warmup: 1,
            thin: 4,
            ..McmcConfig::default()
        };
        assert_eq!(config.retained_draws(), 3);
    }

    #[test]
    fn proposal_stats_tracks_acceptance() {
        let mut stats = ProposalStats::default();
        stats.record(true);
        stats.record(false);
        assert!((stats.acceptance_rate() - 0.5).abs() < 1.0e-12);
        stats.merge(ProposalStats {
            proposed: 2,
            accepted: 2,
        });
        assert!((stats.acceptance_rate() - 0.75).abs() < 1.0e-12);
    }

    #[test]
    fn non_finite_draws_mark_chain_unhealthy() {
        let raw = RawChain {
            draws: vec![vec![1.0, 2.0], vec![f64::NAN, 2.0]],
            stats: ProposalStats::default(),
        };
        assert!(unhealthy_draws(&raw, 2, 2).is_some());
        let raw = RawChain {
            draws: vec![vec![1.0, 2.0]],
            stats: ProposalStats::default(),
        };
        assert!(unhealthy_draws(&raw, 2, 1).is_none());
    }
}
