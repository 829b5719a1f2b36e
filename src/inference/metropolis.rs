/////////////////////////////////////////////////////////////////////////////////////////////\
//
// Adaptive component-wise Metropolis engine.
//
// Created on: 15 Oct 2026
//
/////////////////////////////////////////////////////////////////////////////////////////////

//! Built-in sampling engine: adaptive component-wise random-walk Metropolis.
//!
//! Each iteration updates every parameter component in turn (the whole
//! likelihood is recomputed) and then every latent value (only its own row
//! is recomputed, using a cache of row log densities). During warmup the
//! proposal scales are multiplied up or down every `adaptation_interval`
//! iterations depending on the acceptance rate in that window.

use rand::rngs::StdRng;
use rand::{RngExt, SeedableRng};

use super::ProposalStats;
use super::engine::{
    CancelToken, ChainRequest, CompiledModel, EngineError, RawChain, SamplerEngine,
    monitored_layout,
};
use crate::input::{Dataset, FieldTable};
use crate::model::eval::{GeneratedProgram, RowProgram};
use crate::model::{ModelSpec, Prior};
use crate::posterior::ParameterLayout;
use crate::utils::sample_standard_normal;

/// Adaptive proposal settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProposalTuning {
    /// Minimum allowed proposal scale.
    pub min_draw_scale: f64,
    /// Initial scale as a fraction of the prior spread (capped at one).
    pub initial_scale_fraction: f64,
    /// Adapt every `adaptation_interval` iterations during warmup.
    pub adaptation_interval: usize,
    /// Lower acceptance-rate target for adaptation.
    pub acceptance_target_low: f64,
    /// Upper acceptance-rate target for adaptation.
    pub acceptance_target_high: f64,
    /// Multiplicative scale decrease when acceptance is below target.
    pub scale_decrease_factor: f64,
    /// Multiplicative scale increase when acceptance is above target.
    pub scale_increase_factor: f64,
}

impl Default for ProposalTuning {
    fn default() -> Self {
        Self {
            min_draw_scale: 1.0e-6,
            initial_scale_fraction: 0.1,
            adaptation_interval: 25,
            acceptance_target_low: 0.25,
            acceptance_target_high: 0.5,
            scale_decrease_factor: 0.8,
            scale_increase_factor: 1.25,
        }
    }
}

impl ProposalTuning {
    /// Whether proposal tuning settings are numerically valid.
    #[must_use]
    pub fn is_valid(self) -> bool {
        self.min_draw_scale > 0.0
            && self.initial_scale_fraction > 0.0
            && self.adaptation_interval > 0
            && self.acceptance_target_low >= 0.0
            && self.acceptance_target_high <= 1.0
            && self.acceptance_target_low < self.acceptance_target_high
            && self.scale_decrease_factor > 0.0
            && self.scale_increase_factor > 0.0
    }

    fn adaptation_factor(self, acceptance: f64) -> f64 {
        if acceptance < self.acceptance_target_low {
            self.scale_decrease_factor
        } else if acceptance > self.acceptance_target_high {
            self.scale_increase_factor
        } else {
            1.0
        }
    }
}

/// Engine registered as `"metropolis"`.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetropolisEngine {
    pub tuning: ProposalTuning,
}

impl MetropolisEngine {
    #[must_use]
    pub const fn new(tuning: ProposalTuning) -> Self {
        Self { tuning }
    }
}

impl SamplerEngine for MetropolisEngine {
    fn name(&self) -> &str {
        "metropolis"
    }

    fn compile(
        &self,
        model: &ModelSpec,
        dataset: &Dataset,
    ) -> Result<Box<dyn CompiledModel>, EngineError> {
        Ok(Box::new(CompiledMetropolis::new(model, dataset, self.tuning)?))
    }
}

#[derive(Debug)]
struct GridProgram {
    program: GeneratedProgram,
    fields: FieldTable,
}

#[derive(Debug)]
struct CompiledMetropolis {
    program: RowProgram,
    generated: Option<GridProgram>,
    fields: FieldTable,
    priors: Vec<Prior>,
    latent_starts: Vec<f64>,
    latent_scales: Vec<f64>,
    latent_count: usize,
    layout: Vec<ParameterLayout>,
    tuning: ProposalTuning,
}

#[derive(Debug, Clone)]
struct ChainState {
    params: Vec<f64>,
    /// Latent-major, `latents[l * rows + i]`.
    latents: Vec<f64>,
    /// Cached log density of each row.
    rows: Vec<f64>,
    log_density: f64,
}

#[derive(Debug, Default)]
struct Buffers {
    rows: Vec<f64>,
    derived: Vec<f64>,
    scalars: Vec<f64>,
    generated: Vec<f64>,
}

#[derive(Debug, Clone)]
struct Scales {
    params: Vec<f64>,
    /// One multiplier per latent node, applied to its measurement errors.
    latent_factors: Vec<f64>,
}

fn rejected(reason: impl Into<String>) -> EngineError {
    EngineError::Rejected {
        reason: reason.into(),
    }
}

impl CompiledMetropolis {
    fn new(
        model: &ModelSpec,
        dataset: &Dataset,
        tuning: ProposalTuning,
    ) -> Result<Self, EngineError> {
        if !tuning.is_valid() {
            return Err(rejected("invalid proposal tuning"));
        }
        let mut priors = Vec::with_capacity(model.parameter_count());
        for parameter in model.parameters() {
            if let Some(defect) = parameter.prior.defect() {
                return Err(rejected(format!("prior of `{}`: {defect}", parameter.name)));
            }
            priors.extend(std::iter::repeat_n(parameter.prior, parameter.width()));
        }

        let fields = dataset.fields().clone();
        let rows = fields.nrows();
        for likelihood in model.likelihoods() {
            if likelihood.density.is_discrete() {
                check_binary(&fields, &likelihood.field)?;
            }
        }

        let mut latent_starts = Vec::with_capacity(model.latents().len() * rows);
        let mut latent_scales = Vec::with_capacity(model.latents().len() * rows);
        for latent in model.latents() {
            let (Some(observed), Some(error)) = (
                fields.index_of(&latent.paired_field),
                fields.index_of(&latent.error_field),
            ) else {
                return Err(rejected(format!(
                    "latent `{}` is paired with unknown field `{}`",
                    latent.name, latent.paired_field
                )));
            };
            for row in 0..rows {
                let sd = fields.value(row, error);
                if sd <= 0.0 {
                    return Err(rejected(format!(
                        "measurement error of `{}` is zero at row {row}",
                        latent.paired_field
                    )));
                }
                latent_starts.push(fields.value(row, observed));
                latent_scales.push(sd);
            }
        }

        let program =
            RowProgram::compile(model, &fields).map_err(|err| rejected(err.to_string()))?;
        let generated = match dataset.prediction_grid() {
            Some(grid) if !model.generated().is_empty() => Some(GridProgram {
                program: GeneratedProgram::compile(model, grid.fields(), rows)
                    .map_err(|err| rejected(format!("prediction grid: {err}")))?,
                fields: grid.fields().clone(),
            }),
            _ => None,
        };

        let layout = monitored_layout(
            model,
            rows,
            generated.as_ref().map(|grid| grid.fields.nrows()),
        );
        log::debug!(
            "compiled model: {} parameter components, {} latent nodes over {rows} rows, {} monitored columns",
            priors.len(),
            model.latents().len(),
            layout.iter().map(ParameterLayout::end).max().unwrap_or(0)
        );

        Ok(Self {
            program,
            generated,
            fields,
            priors,
            latent_starts,
            latent_scales,
            latent_count: model.latents().len(),
            layout,
            tuning,
        })
    }

    fn initial_state(&self, rng: &mut StdRng) -> Result<ChainState, EngineError> {
        let params: Vec<f64> = self
            .priors
            .iter()
            .map(|prior| {
                let center = prior.center();
                let jittered = self
                    .initial_scale(*prior)
                    .mul_add(sample_standard_normal(rng), center);
                if prior.log_density(jittered).is_finite() {
                    jittered
                } else {
                    center
                }
            })
            .collect();
        let latents = self.latent_starts.clone();
        let mut rows = Vec::with_capacity(self.fields.nrows());
        let log_density = self.fill_rows(&params, &latents, &mut rows, &mut Vec::new());
        if !log_density.is_finite() {
            return Err(EngineError::Diverged {
                iteration: 0,
                reason: "initial state has zero density".to_string(),
            });
        }
        Ok(ChainState {
            params,
            latents,
            rows,
            log_density,
        })
    }

    fn initial_scale(&self, prior: Prior) -> f64 {
        (self.tuning.initial_scale_fraction * prior.spread().min(1.0)).max(self.tuning.min_draw_scale)
    }

    fn fill_rows(
        &self,
        params: &[f64],
        latents: &[f64],
        rows: &mut Vec<f64>,
        derived: &mut Vec<f64>,
    ) -> f64 {
        rows.clear();
        for row in 0..self.fields.nrows() {
            rows.push(
                self.program
                    .row_log_density(params, latents, &self.fields, row, derived),
            );
        }
        rows.iter().sum()
    }

    fn update_parameter(
        &self,
        component: usize,
        scale: f64,
        state: &mut ChainState,
        rng: &mut StdRng,
        buffers: &mut Buffers,
    ) -> bool {
        let prior = self.priors[component];
        let current = state.params[component];
        let proposal = scale.mul_add(sample_standard_normal(rng), current);
        let candidate_prior = prior.log_density(proposal);
        if !candidate_prior.is_finite() {
            return false;
        }

        state.params[component] = proposal;
        let candidate = self.fill_rows(
            &state.params,
            &state.latents,
            &mut buffers.rows,
            &mut buffers.derived,
        );
        let log_acceptance =
            candidate + candidate_prior - state.log_density - prior.log_density(current);
        let accepted = should_accept(log_acceptance, rng);
        if accepted {
            std::mem::swap(&mut state.rows, &mut buffers.rows);
            state.log_density = candidate;
        } else {
            state.params[component] = current;
        }
        accepted
    }

    fn update_latent(
        &self,
        index: usize,
        row: usize,
        scale: f64,
        state: &mut ChainState,
        rng: &mut StdRng,
        buffers: &mut Buffers,
    ) -> bool {
        let current = state.latents[index];
        state.latents[index] = scale.mul_add(sample_standard_normal(rng), current);
        let candidate = self.program.row_log_density(
            &state.params,
            &state.latents,
            &self.fields,
            row,
            &mut buffers.derived,
        );
        let accepted = should_accept(candidate - state.rows[row], rng);
        if accepted {
            state.rows[row] = candidate;
        } else {
            state.latents[index] = current;
        }
        accepted
    }

    fn record_draw(
        &self,
        state: &ChainState,
        iteration: usize,
        rng: &mut StdRng,
        buffers: &mut Buffers,
    ) -> Result<Vec<f64>, EngineError> {
        let mut draw = Vec::with_capacity(self.width());
        draw.extend_from_slice(&state.params);
        draw.extend_from_slice(&state.latents);
        self.program.scalar_derived(
            &state.params,
            &state.latents,
            &self.fields,
            &mut buffers.derived,
            &mut buffers.scalars,
        );
        draw.extend_from_slice(&buffers.scalars);
        if let Some(grid) = &self.generated {
            grid.program
                .evaluate(
                    &state.params,
                    &state.latents,
                    &grid.fields,
                    Some(rng),
                    &mut buffers.generated,
                )
                .map_err(|err| EngineError::Diverged {
                    iteration,
                    reason: err.to_string(),
                })?;
            draw.extend_from_slice(&buffers.generated);
        }
        Ok(draw)
    }

    fn width(&self) -> usize {
        self.layout.iter().map(ParameterLayout::end).max().unwrap_or(0)
    }

    fn adapt(&self, scales: &mut Scales, window: &mut [ProposalStats]) {
        let (params, latents) = window.split_at_mut(scales.params.len());
        for (scale, stats) in scales.params.iter_mut().zip(params.iter_mut()) {
            *scale = (*scale * self.tuning.adaptation_factor(stats.acceptance_rate()))
                .max(self.tuning.min_draw_scale);
            *stats = ProposalStats::default();
        }
        for (factor, stats) in scales.latent_factors.iter_mut().zip(latents.iter_mut()) {
            *factor *= self.tuning.adaptation_factor(stats.acceptance_rate());
            *stats = ProposalStats::default();
        }
    }
}

impl CompiledModel for CompiledMetropolis {
    fn layout(&self) -> &[ParameterLayout] {
        &self.layout
    }

    fn sample_chain(
        &self,
        request: &ChainRequest,
        cancel: &CancelToken,
    ) -> Result<RawChain, EngineError> {
        let mut rng = StdRng::seed_from_u64(request.seed);
        let mut state = self.initial_state(&mut rng)?;
        let rows = self.fields.nrows();
        let mut scales = Scales {
            params: self
                .priors
                .iter()
                .map(|prior| self.initial_scale(*prior))
                .collect(),
            latent_factors: vec![1.0; self.latent_count],
        };
        let parameter_count = self.priors.len();
        let mut window = vec![ProposalStats::default(); parameter_count + self.latent_count];
        let mut stats = ProposalStats::default();
        let mut buffers = Buffers::default();
        let mut draws = Vec::with_capacity(request.retained_draws());

        for iteration in 0..request.iterations {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }

            for component in 0..parameter_count {
                let accepted = self.update_parameter(
                    component,
                    scales.params[component],
                    &mut state,
                    &mut rng,
                    &mut buffers,
                );
                window[component].record(accepted);
                stats.record(accepted);
            }
            for latent in 0..self.latent_count {
                for row in 0..rows {
                    let index = latent * rows + row;
                    let scale = (self.latent_scales[index] * scales.latent_factors[latent])
                        .max(self.tuning.min_draw_scale);
                    let accepted =
                        self.update_latent(index, row, scale, &mut state, &mut rng, &mut buffers);
                    window[parameter_count + latent].record(accepted);
                    stats.record(accepted);
                }
            }
            state.log_density = state.rows.iter().sum();

            if !state.log_density.is_finite()
                || state.params.iter().chain(&state.latents).any(|value| !value.is_finite())
            {
                return Err(EngineError::Diverged {
                    iteration,
                    reason: "log density is no longer finite".to_string(),
                });
            }

            if iteration < request.warmup
                && (iteration + 1).is_multiple_of(self.tuning.adaptation_interval)
            {
                self.adapt(&mut scales, &mut window);
            }

            if request.retains(iteration) {
                draws.push(self.record_draw(&state, iteration, &mut rng, &mut buffers)?);
            }
        }

        log::debug!(
            "chain {} finished: acceptance {:.3}",
            request.chain,
            stats.acceptance_rate()
        );
        Ok(RawChain { draws, stats })
    }
}

fn should_accept(log_acceptance: f64, rng: &mut StdRng) -> bool {
    log_acceptance >= 0.0 || rng.random::<f64>().ln() < log_acceptance
}

#[allow(clippy::float_cmp)]
fn check_binary(fields: &FieldTable, field: &str) -> Result<(), EngineError> {
    let column = fields
        .index_of(field)
        .ok_or_else(|| rejected(format!("unknown field `{field}`")))?;
    for row in 0..fields.nrows() {
        let value = fields.value(row, column);
        if value != 0.0 && value != 1.0 {
            return Err(rejected(format!(
                "Bernoulli outcome `{field}` has value {value} at row {row}"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::{DesignOptions, RawColumns};
    use crate::model::{Density, Expr, ModelBuilder};
    use crate::posterior::ParameterKind;

    fn normal_mean_model(values: Vec<f64>) -> (ModelSpec, Dataset) {
        let raw = RawColumns::new("y", values);
        let options = DesignOptions {
            add_intercept: true,
            ..DesignOptions::default()
        };
        let dataset = Dataset::build(&raw, &options).expect("dataset");
        let mut builder = ModelBuilder::for_dataset(&dataset);
        builder
            .add_parameter("mu", Prior::normal(0.0, 10.0))
            .expect("mu")
            .set_likelihood("y", Density::normal("mu", 1.0))
            .expect("likelihood");
        (builder.build().expect("model"), dataset)
    }

    fn request(seed: u64) -> ChainRequest {
        ChainRequest {
            chain: 0,
            seed,
            iterations: 3_000,
            warmup: 500,
            thin: 1,
        }
    }

    #[test]
    fn normal_mean_posterior_is_recovered() {
        let values: Vec<f64> = (0..50).map(|i| 1.0 + f64::from(i % 5) * 0.5 - 1.0).collect();
        let sample_mean = values.iter().sum::<f64>() / 50.0;
        let (model, dataset) = normal_mean_model(values);
        let compiled = MetropolisEngine::default()
            .compile(&model, &dataset)
            .expect("compiles");
        let chain = compiled
            .sample_chain(&request(7), &CancelToken::default())
            .expect("chain runs");
        assert_eq!(chain.draws.len(), 2_500);
        let mean = chain.draws.iter().map(|draw| draw[0]).sum::<f64>() / 2_500.0;
        // posterior sd is about 1 / sqrt(50)
        assert!((mean - sample_mean).abs() < 0.1, "mean = {mean}");
        assert!(chain.stats.acceptance_rate() > 0.1);
    }

    #[test]
    fn chains_are_reproducible_for_a_seed() {
        let (model, dataset) = normal_mean_model(vec![0.1, -0.3, 0.4, 1.2]);
        let compiled = MetropolisEngine::default()
            .compile(&model, &dataset)
            .expect("compiles");
        let short = ChainRequest {
            iterations: 200,
            warmup: 50,
            ..request(11)
        };
        let first = compiled.sample_chain(&short, &CancelToken::default()).expect("first");
        let second = compiled.sample_chain(&short, &CancelToken::default()).expect("second");
        assert_eq!(first.draws, second.draws);
    }

    #[test]
    fn cancelled_chain_stops() {
        let (model, dataset) = normal_mean_model(vec![0.0, 1.0]);
        let compiled = MetropolisEngine::default()
            .compile(&model, &dataset)
            .expect("compiles");
        let cancel = CancelToken::default();
        cancel.cancel();
        assert_eq!(
            compiled.sample_chain(&request(1), &cancel).err(),
            Some(EngineError::Cancelled)
        );
    }

    #[test]
    fn malformed_prior_is_rejected() {
        let raw = RawColumns::new("y", vec![0.0, 1.0]);
        let dataset = Dataset::build(&raw, &DesignOptions::default()).expect("dataset");
        let mut builder = ModelBuilder::for_dataset(&dataset);
        builder
            .add_parameter("sigma", Prior::uniform(5.0, 1.0))
            .expect("sigma")
            .set_likelihood("y", Density::normal(0.0, "sigma"))
            .expect("likelihood");
        let model = builder.build().expect("structurally valid");
        assert!(matches!(
            MetropolisEngine::default().compile(&model, &dataset),
            Err(EngineError::Rejected { .. })
        ));
    }

    #[test]
    fn non_binary_bernoulli_outcome_is_rejected() {
        let raw = RawColumns::new("y", vec![0.0, 1.0, 2.0]).with_predictor("x", vec![0.0, 1.0, 2.0]);
        let dataset = Dataset::build(&raw, &DesignOptions::default()).expect("dataset");
        let mut builder = ModelBuilder::for_dataset(&dataset);
        builder
            .add_vector_parameter("beta", 2, Prior::normal(0.0, 10.0))
            .expect("beta")
            .set_likelihood("y", Density::bernoulli_logit(Expr::linear_predictor("beta")))
            .expect("likelihood");
        let model = builder.build().expect("valid");
        let err = MetropolisEngine::default()
            .compile(&model, &dataset)
            .err()
            .expect("outcome 2 is not binary");
        assert!(err.to_string().contains("row 2"));
    }

    #[test]
    fn zero_measurement_error_is_rejected() {
        let raw = RawColumns::new("y", vec![0.0, 1.0])
            .with_predictor("x", vec![0.0, 1.0])
            .with_measurement_error("x", vec![0.1, 0.0]);
        let dataset = Dataset::build(&raw, &DesignOptions::default()).expect("dataset");
        let mut builder = ModelBuilder::for_dataset(&dataset);
        builder
            .add_parameter("beta", Prior::normal(0.0, 10.0))
            .expect("beta")
            .add_latent("xtrue", Density::normal(0.0, 10.0), "x")
            .expect("latent")
            .set_likelihood("y", Density::normal(Expr::sym("beta") * "xtrue", 1.0))
            .expect("likelihood");
        let model = builder.build().expect("valid");
        assert!(matches!(
            MetropolisEngine::default().compile(&model, &dataset),
            Err(EngineError::Rejected { .. })
        ));
    }

    #[test]
    fn layout_orders_parameters_latents_derived_and_generated() {
        let raw = RawColumns::new("y", vec![0.5, 1.4, 2.6])
            .with_predictor("x", vec![0.0, 1.0, 2.0])
            .with_measurement_error("x", vec![0.1, 0.1, 0.1]);
        let dataset = Dataset::build(&raw, &DesignOptions::default()).expect("dataset");
        let grid = dataset.grid_over("x", 5).expect("grid");
        let dataset = dataset.with_prediction_grid(grid);
        let mut builder = ModelBuilder::for_dataset(&dataset);
        builder
            .add_parameter("beta", Prior::normal(0.0, 10.0))
            .expect("beta")
            .add_parameter("tau", Prior::gamma(1.0, 1.0))
            .expect("tau")
            .add_deterministic("sd", Expr::sym("tau").sqrt().recip())
            .expect("sd")
            .add_latent("xtrue", Density::normal(0.0, 10.0), "x")
            .expect("latent")
            .set_likelihood("y", Density::normal(Expr::sym("beta") * "xtrue", "sd"))
            .expect("likelihood")
            .add_generated_quantity("line", Expr::sym("beta") * "x")
            .expect("line");
        let model = builder.build().expect("valid");
        let compiled = MetropolisEngine::default()
            .compile(&model, &dataset)
            .expect("compiles");
        let summary: Vec<(&str, ParameterKind, usize, usize)> = compiled
            .layout()
            .iter()
            .map(|entry| (entry.name.as_str(), entry.kind, entry.offset, entry.len))
            .collect();
        assert_eq!(
            summary,
            vec![
                ("beta", ParameterKind::Parameter, 0, 1),
                ("tau", ParameterKind::Parameter, 1, 1),
                ("xtrue", ParameterKind::Latent, 2, 3),
                ("sd", ParameterKind::Derived, 5, 1),
                ("line", ParameterKind::Generated, 6, 5),
            ]
        );
        let chain = compiled
            .sample_chain(
                &ChainRequest {
                    iterations: 20,
                    warmup: 10,
                    ..request(3)
                },
                &CancelToken::default(),
            )
            .expect("runs");
        assert_eq!(chain.draws.len(), 10);
        assert!(chain.draws.iter().all(|draw| draw.len() == 11));
    }
}
