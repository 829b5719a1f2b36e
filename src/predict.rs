//! # Prediction
//!
//! Generated quantities at the points of a [`PredictionGrid`], one value per
//! posterior draw and grid point.
//!
//! Quantities are either read back from the store (when the run was given
//! the grid and the engine produced them) or evaluated here from the stored
//! parameter draws. Deterministic quantities evaluate to the same bits on
//! every call. Posterior-predictive quantities draw fresh noise and need a
//! caller-supplied seeded [`StdRng`].

use faer::Mat;
use rand::rngs::StdRng;
use thiserror::Error;

use crate::input::PredictionGrid;
use crate::model::ModelSpec;
use crate::model::eval::{EvalError, GeneratedProgram};
use crate::posterior::{PosteriorStore, StoreError, SummaryError, summarize_values};
use crate::utils::column_to_vec;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum PredictError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Summary(#[from] SummaryError),
    #[error("prediction grid has no field `{name}`")]
    MissingGridField { name: String },
    #[error("grid has {found} rows; expected {expected}")]
    GridShape { expected: usize, found: usize },
    #[error("predictive quantities need a random source")]
    MissingRandomSource,
    #[error("unknown generated quantity `{name}`")]
    UnknownQuantity { name: String },
}

impl From<EvalError> for PredictError {
    fn from(err: EvalError) -> Self {
        match err {
            EvalError::MissingField { name } | EvalError::Unresolved { name } => {
                Self::MissingGridField { name }
            }
            EvalError::DesignWidth {
                expected, found, ..
            }
            | EvalError::LatentRows { expected, found } => Self::GridShape { expected, found },
            EvalError::MissingRandomSource => Self::MissingRandomSource,
        }
    }
}

/// Draws of one generated quantity: rows are posterior draws, columns are
/// grid points.
#[derive(Debug, Clone)]
pub struct QuantityDraws {
    pub name: String,
    pub draws: Mat<f64>,
}

/// Pointwise posterior band of a quantity.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PredictionBand {
    pub mean: f64,
    pub median: f64,
    pub lower: f64,
    pub upper: f64,
}

impl QuantityDraws {
    #[must_use]
    pub fn grid_len(&self) -> usize {
        self.draws.ncols()
    }

    #[must_use]
    pub fn draw_count(&self) -> usize {
        self.draws.nrows()
    }

    /// Draws at grid point `point`.
    #[must_use]
    pub fn at(&self, point: usize) -> Vec<f64> {
        column_to_vec(&self.draws, point)
    }

    /// Mean and equal-tailed `level` interval at every grid point.
    ///
    /// # Errors
    ///
    /// Returns `PredictError::Summary` for fewer than two draws or a level
    /// outside `(0, 1)`.
    pub fn bands(&self, level: f64) -> Result<Vec<PredictionBand>, PredictError> {
        (0..self.grid_len())
            .map(|point| {
                let summary = summarize_values(&self.name, &self.at(point), level)?;
                Ok(PredictionBand {
                    mean: summary.mean,
                    median: summary.median,
                    lower: summary.lower,
                    upper: summary.upper,
                })
            })
            .collect()
    }
}

/// Evaluates generated quantities of `model` over the draws in `store`.
#[derive(Debug, Clone, Copy)]
pub struct Predictor<'a> {
    store: &'a PosteriorStore,
    model: &'a ModelSpec,
}

impl<'a> Predictor<'a> {
    #[must_use]
    pub const fn new(store: &'a PosteriorStore, model: &'a ModelSpec) -> Self {
        Self { store, model }
    }

    /// Draws of `name` as stored by the run.
    ///
    /// # Errors
    ///
    /// Returns `PredictError::Store` if the run did not store `name`.
    pub fn from_store(&self, name: &str) -> Result<QuantityDraws, PredictError> {
        Ok(QuantityDraws {
            name: name.to_string(),
            draws: self.store.extract(name)?,
        })
    }

    /// Evaluate every generated quantity at every pooled draw and grid
    /// point, in declaration order.
    ///
    /// # Errors
    ///
    /// Returns `MissingGridField` if the grid lacks a field a quantity
    /// needs, `GridShape` if a quantity reads latent nodes and the grid size
    /// differs from the number of observations, and `MissingRandomSource`
    /// for predictive quantities without `rng`.
    pub fn evaluate(
        &self,
        grid: &PredictionGrid,
        mut rng: Option<&mut StdRng>,
    ) -> Result<Vec<QuantityDraws>, PredictError> {
        let latent_rows = match self.model.latents().first() {
            Some(latent) => self.store.layout(&latent.name)?.len,
            None => 0,
        };
        let program = GeneratedProgram::compile(self.model, grid.fields(), latent_rows)?;
        if program.is_stochastic() && rng.is_none() {
            return Err(PredictError::MissingRandomSource);
        }

        let params = self.stacked(self.model.parameters().iter().map(|decl| decl.name.as_str()))?;
        let latents = self.stacked(self.model.latents().iter().map(|decl| decl.name.as_str()))?;
        let draws = self.store.total_draws();
        let points = grid.len();
        let mut values: Vec<Mat<f64>> = (0..program.quantity_count())
            .map(|_| Mat::zeros(draws, points))
            .collect();
        let mut out = Vec::with_capacity(program.quantity_count() * points);

        for draw in 0..draws {
            program.evaluate(
                &params[draw],
                &latents[draw],
                grid.fields(),
                rng.as_deref_mut(),
                &mut out,
            )?;
            for (quantity, matrix) in values.iter_mut().enumerate() {
                for point in 0..points {
                    matrix[(draw, point)] = out[quantity * points + point];
                }
            }
        }

        Ok(self
            .model
            .generated()
            .iter()
            .zip(values)
            .map(|(decl, draws)| QuantityDraws {
                name: decl.name.clone(),
                draws,
            })
            .collect())
    }

    /// Like [`evaluate`](Self::evaluate) for a single quantity.
    ///
    /// # Errors
    ///
    /// Returns `UnknownQuantity` if `name` is not a generated quantity, or
    /// the errors of [`evaluate`](Self::evaluate).
    pub fn evaluate_quantity(
        &self,
        name: &str,
        grid: &PredictionGrid,
        rng: Option<&mut StdRng>,
    ) -> Result<QuantityDraws, PredictError> {
        self.evaluate(grid, rng)?
            .into_iter()
            .find(|quantity| quantity.name == name)
            .ok_or_else(|| PredictError::UnknownQuantity {
                name: name.to_string(),
            })
    }

    /// Every generated quantity on `grid`. A quantity the run stored on
    /// this same grid is read back; the rest are evaluated.
    ///
    /// # Errors
    ///
    /// Returns the errors of [`evaluate`](Self::evaluate).
    pub fn predict(
        &self,
        grid: &PredictionGrid,
        rng: Option<&mut StdRng>,
    ) -> Result<Vec<QuantityDraws>, PredictError> {
        let stored = |name: &str| self.store.holds_on_grid(name, grid);
        let mut evaluated = if self.model.generated().iter().all(|decl| stored(&decl.name)) {
            Vec::new()
        } else {
            self.evaluate(grid, rng)?
        }
        .into_iter();

        self.model
            .generated()
            .iter()
            .map(|decl| {
                let fresh = evaluated.next();
                if stored(&decl.name) {
                    self.from_store(&decl.name)
                } else {
                    fresh.ok_or_else(|| PredictError::UnknownQuantity {
                        name: decl.name.clone(),
                    })
                }
            })
            .collect()
    }

    /// Per-draw concatenation of the named entries.
    fn stacked<'n>(
        &self,
        names: impl Iterator<Item = &'n str>,
    ) -> Result<Vec<Vec<f64>>, PredictError> {
        let mut rows = vec![Vec::new(); self.store.total_draws()];
        for name in names {
            let draws = self.store.extract(name)?;
            for (draw, row) in rows.iter_mut().enumerate() {
                row.extend((0..draws.ncols()).map(|j| draws[(draw, j)]));
            }
        }
        Ok(rows)
    }
}
