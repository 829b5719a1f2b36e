//! Seam between the run adapter and sampling engines.
//!
//! An engine compiles a [`ModelSpec`] against a [`Dataset`] once and then
//! samples chains from the compiled model. Chains are requested one at a
//! time so the adapter owns parallelism, seeding and timeouts. Dropping the
//! compiled model releases whatever the engine holds.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;

use super::ProposalStats;
use super::metropolis::MetropolisEngine;
use crate::input::Dataset;
use crate::model::ModelSpec;
use crate::posterior::{ParameterKind, ParameterLayout, contiguous_layout};

/// Failures reported by an engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("engine unavailable: {reason}")]
    Unavailable { reason: String },
    #[error("model rejected: {reason}")]
    Rejected { reason: String },
    #[error("chain diverged at iteration {iteration}: {reason}")]
    Diverged { iteration: usize, reason: String },
    #[error("chain cancelled")]
    Cancelled,
}

/// Sampling schedule for one chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainRequest {
    pub chain: usize,
    pub seed: u64,
    /// Total iterations, warmup included.
    pub iterations: usize,
    pub warmup: usize,
    pub thin: usize,
}

impl ChainRequest {
    #[must_use]
    pub const fn retained_draws(&self) -> usize {
        (self.iterations - self.warmup).div_ceil(self.thin)
    }

    /// Whether the draw at `iteration` is kept.
    #[must_use]
    pub const fn retains(&self, iteration: usize) -> bool {
        iteration >= self.warmup && (iteration - self.warmup).is_multiple_of(self.thin)
    }
}

/// Retained draws of one chain, each laid out per
/// [`CompiledModel::layout`].
#[derive(Debug, Clone, Default)]
pub struct RawChain {
    pub draws: Vec<Vec<f64>>,
    pub stats: ProposalStats,
}

/// Cooperative cancellation flag shared between the adapter and chains.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Monitored columns of a compiled model: parameters, then one latent
/// value per data row, then derived scalars, then generated quantities when
/// the run has a grid of `grid_rows` points.
#[must_use]
pub fn monitored_layout(
    model: &ModelSpec,
    rows: usize,
    grid_rows: Option<usize>,
) -> Vec<ParameterLayout> {
    let parameters = model
        .parameters()
        .iter()
        .map(|parameter| (parameter.name.as_str(), ParameterKind::Parameter, parameter.width()));
    let latents = model
        .latents()
        .iter()
        .map(|latent| (latent.name.as_str(), ParameterKind::Latent, rows));
    let derived = model
        .derived_scalars()
        .map(|(_, decl)| (decl.name.as_str(), ParameterKind::Derived, 1));
    let generated = grid_rows.into_iter().flat_map(|points| {
        model
            .generated()
            .iter()
            .map(move |decl| (decl.name.as_str(), ParameterKind::Generated, points))
    });
    contiguous_layout(parameters.chain(latents).chain(derived).chain(generated))
}

pub trait SamplerEngine: Send + Sync {
    fn name(&self) -> &str;

    /// Translate the model into the engine's own representation.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Rejected` for models the engine cannot run and
    /// `EngineError::Unavailable` if the engine cannot be reached.
    fn compile(
        &self,
        model: &ModelSpec,
        dataset: &Dataset,
    ) -> Result<Box<dyn CompiledModel>, EngineError>;
}

pub trait CompiledModel: Send + Sync {
    /// Layout of every retained draw.
    fn layout(&self) -> &[ParameterLayout];

    /// Run one chain. Implementations check `cancel` at least once per
    /// iteration and return `EngineError::Cancelled` when it is set.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Diverged` if the chain leaves the region of
    /// finite density.
    fn sample_chain(
        &self,
        request: &ChainRequest,
        cancel: &CancelToken,
    ) -> Result<RawChain, EngineError>;
}

/// Engines selectable by name.
#[derive(Clone, Default)]
pub struct BackendRegistry {
    engines: BTreeMap<String, Arc<dyn SamplerEngine>>,
}

impl BackendRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the built-in `"metropolis"` engine.
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(MetropolisEngine::default());
        registry
    }

    /// Add `engine` under its own name, replacing any engine of that name.
    pub fn register(&mut self, engine: impl SamplerEngine + 'static) -> &mut Self {
        self.engines
            .insert(engine.name().to_string(), Arc::new(engine));
        self
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn SamplerEngine>> {
        self.engines.get(name).cloned()
    }

    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.engines.keys().map(String::as_str).collect()
    }
}

impl fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("engines", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retention_matches_thinning_schedule() {
        let request = ChainRequest {
            chain: 0,
            seed: 1,
            iterations: 10,
            warmup: 3,
            thin: 3,
        };
        let kept = (0..request.iterations)
            .filter(|iteration| request.retains(*iteration))
            .count();
        assert_eq!(kept, request.retained_draws());
        assert_eq!(kept, 3);
    }

    #[test]
    fn default_registry_knows_metropolis() {
        let registry = BackendRegistry::with_defaults();
        assert_eq!(registry.names(), ["metropolis"]);
        assert!(registry.get("metropolis").is_some());
        assert!(registry.get("stan").is_none());
    }

    #[test]
    fn layout_places_generated_quantities_last() {
        use crate::input::{Dataset, DesignOptions, RawColumns};
        use crate::model::{Density, Expr, ModelBuilder, Prior};

        let raw = RawColumns::new("y", vec![1.0, 2.0, 2.5]).with_predictor("x", vec![0.0, 1.0, 2.0]);
        let dataset = Dataset::build(&raw, &DesignOptions::default()).expect("dataset");
        let mut builder = ModelBuilder::for_dataset(&dataset);
        builder
            .add_vector_parameter("beta", 2, Prior::normal(0.0, 10.0))
            .expect("beta")
            .add_parameter("tau", Prior::gamma(1.0, 1.0))
            .expect("tau")
            .add_deterministic("sigma", Expr::sym("tau").sqrt().recip())
            .expect("sigma")
            .set_likelihood("y", Density::normal(Expr::linear_predictor("beta"), "sigma"))
            .expect("likelihood")
            .add_generated_quantity("mu", Expr::linear_predictor("beta"))
            .expect("mu");
        let model = builder.build().expect("model");

        let without_grid = monitored_layout(&model, 3, None);
        let names: Vec<&str> = without_grid.iter().map(|entry| entry.name.as_str()).collect();
        assert_eq!(names, ["beta", "tau", "sigma"]);

        let with_grid = monitored_layout(&model, 3, Some(7));
        let mu = with_grid.last().expect("mu monitored");
        assert_eq!((mu.name.as_str(), mu.kind, mu.offset, mu.len), ("mu", ParameterKind::Generated, 4, 7));
    }

    #[test]
    fn cancel_token_is_shared_between_clones() {
        let token = CancelToken::default();
        let observer = token.clone();
        assert!(!observer.is_cancelled());
        token.cancel();
        assert!(observer.is_cancelled());
    }
}
