#![forbid(unsafe_code)]

//! # `bayes_regression`
//!
//! Bayesian linear, polynomial, errors-in-variables, autoregressive and
//! logistic regression: declare a model against a dataset, sample it with
//! several independent chains, and summarize or predict from the pooled
//! posterior draws.
//!
//! Sampling goes through a named engine in a [`BackendRegistry`]. The
//! built-in `"metropolis"` engine is an adaptive random-walk sampler, so the
//! whole pipeline runs without external software. [`JagsEngine`] hands the
//! model to an installed JAGS instead, and other engines plug in through
//! [`SamplerEngine`].
//!
//! ```
//! use bayes_regression::{
//!     BackendRegistry, Dataset, DesignOptions, Density, Expr, McmcConfig, ModelBuilder, Prior,
//!     RawColumns, run, summarize,
//! };
//!
//! let x: Vec<f64> = (0..40u8).map(|i| f64::from(i) / 10.0).collect();
//! let y: Vec<f64> = x
//!     .iter()
//!     .zip(0u8..)
//!     .map(|(x, i)| 1.0 + 2.0 * x + 0.3 * (1.7 * f64::from(i)).sin())
//!     .collect();
//! let raw = RawColumns::new("y", y).with_predictor("x", x);
//! let dataset = Dataset::build(&raw, &DesignOptions::default()).expect("valid data");
//!
//! let mut builder = ModelBuilder::for_dataset(&dataset);
//! builder
//!     .add_vector_parameter("beta", 2, Prior::normal(0.0, 100.0))
//!     .expect("beta")
//!     .add_parameter("sigma", Prior::uniform(0.0, 10.0))
//!     .expect("sigma")
//!     .set_likelihood("y", Density::normal(Expr::linear_predictor("beta"), "sigma"))
//!     .expect("likelihood");
//! let model = builder.build().expect("valid model");
//!
//! let config = McmcConfig {
//!     chains: 2,
//!     iterations: 600,
//!     warmup: 300,
//!     ..McmcConfig::default()
//! };
//! let fit = run(&BackendRegistry::with_defaults(), &model, &dataset, &config)
//!     .expect("sampling succeeds");
//! let beta = summarize(&fit.store, "beta", 0.95).expect("summary");
//! assert_eq!(beta.len(), 2);
//! ```

pub mod inference;
pub mod input;
pub mod model;
pub mod posterior;
pub mod predict;
pub mod report;
pub mod utils;

pub use inference::{
    BackendRegistry, CancelToken, ChainDiagnostics, ChainRequest, CompiledModel, DroppedChain,
    EngineError, InferenceError, InferenceRun, JagsEngine, McmcConfig, MetropolisEngine,
    ProposalStats, ProposalTuning, RawChain, SamplerEngine, monitored_layout, render_jags, run,
};
pub use input::{
    DataSchema, Dataset, DatasetError, DesignOptions, FieldTable, PredictionGrid, RawColumns,
    build_grid,
};
pub use model::{
    DependencyGraph, Density, Expr, Generated, ModelBuilder, ModelError, ModelSpec, Prior,
};
pub use posterior::diagnostics::ComponentConvergence;
pub use posterior::{
    ConvergenceSummary, ParameterKind, ParameterLayout, ParameterSummary, PosteriorStore,
    StoreError, SummaryError, autocorrelation, convergence, effective_sample_size, split_rhat,
    summarize, summarize_all, summarize_kinds, summarize_values,
};
pub use predict::{PredictError, PredictionBand, Predictor, QuantityDraws};
pub use report::{render_convergence_table, render_prediction_table, render_summary_table};
