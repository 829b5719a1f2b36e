/////////////////////////////////////////////////////////////////////////////////////////////\
//
// Posterior draw storage with named parameter layout.
//
// Created on: 15 Oct 2026
//
/////////////////////////////////////////////////////////////////////////////////////////////

//! # Posterior store
//!
//! Draws retained by an inference run, per chain, behind a named layout.
//! Each draw is one flat row; a [`ParameterLayout`] entry maps a monitored
//! name to its columns. The store is written once, in bulk, and is
//! read-only afterwards, so it can be shared across threads freely.

use faer::Mat;
use thiserror::Error;

use crate::input::PredictionGrid;

pub mod diagnostics;
pub mod summary;

pub use diagnostics::{ConvergenceSummary, autocorrelation, convergence, effective_sample_size, split_rhat};
pub use summary::{ParameterSummary, SummaryError, summarize, summarize_all, summarize_kinds, summarize_values};

/// Errors returned when building or reading a posterior store.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("unknown parameter `{name}`")]
    UnknownParameter { name: String },
    #[error("chain {chain} is not in the store (available: {available:?})")]
    ChainOutOfRange { chain: usize, available: Vec<usize> },
    #[error("component {index} is out of range for `{name}` of length {len}")]
    ComponentOutOfRange {
        name: String,
        index: usize,
        len: usize,
    },
    #[error("chain {chain} has {found} draws; expected {expected}")]
    UnequalChainLengths {
        chain: usize,
        expected: usize,
        found: usize,
    },
    #[error("chain {chain} has draws of width {found}; the layout needs {expected}")]
    DrawWidth {
        chain: usize,
        expected: usize,
        found: usize,
    },
    #[error("chain {chain} appears more than once")]
    DuplicateChain { chain: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParameterKind {
    Parameter,
    /// Per-observation latent true value.
    Latent,
    /// Row-independent deterministic node.
    Derived,
    /// Generated quantity on the run's prediction grid.
    Generated,
}

/// Columns of one monitored name inside a flat draw.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterLayout {
    pub name: String,
    pub kind: ParameterKind,
    pub offset: usize,
    pub len: usize,
}

impl ParameterLayout {
    #[must_use]
    pub fn new(name: impl Into<String>, kind: ParameterKind, offset: usize, len: usize) -> Self {
        Self {
            name: name.into(),
            kind,
            offset,
            len,
        }
    }

    /// `name` for a single component, `name[index]` otherwise.
    #[must_use]
    pub fn component_label(&self, index: usize) -> String {
        if self.len == 1 {
            self.name.clone()
        } else {
            format!("{}[{index}]", self.name)
        }
    }

    #[must_use]
    pub const fn end(&self) -> usize {
        self.offset + self.len
    }
}

/// Lay out `(name, kind, len)` entries back to back.
#[must_use]
pub fn contiguous_layout<'a>(
    entries: impl IntoIterator<Item = (&'a str, ParameterKind, usize)>,
) -> Vec<ParameterLayout> {
    let mut offset = 0;
    entries
        .into_iter()
        .map(|(name, kind, len)| {
            let entry = ParameterLayout::new(name, kind, offset, len);
            offset += len;
            entry
        })
        .collect()
}

#[derive(Debug, Clone)]
struct ChainDraws {
    id: usize,
    draws: Mat<f64>,
}

/// Immutable collection of posterior draws keyed by name and chain.
#[derive(Debug, Clone)]
pub struct PosteriorStore {
    layout: Vec<ParameterLayout>,
    chains: Vec<ChainDraws>,
    draws_per_chain: usize,
    /// Grid the `Generated` entries were evaluated on.
    grid: Option<PredictionGrid>,
}

impl PosteriorStore {
    /// Bulk-build a store from `(chain id, draws)` pairs.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if chains differ in length, a draw does not match
    /// the layout width, or a chain id repeats.
    pub fn new(
        layout: Vec<ParameterLayout>,
        chains: Vec<(usize, Vec<Vec<f64>>)>,
    ) -> Result<Self, StoreError> {
        let width = layout.iter().map(ParameterLayout::end).max().unwrap_or(0);
        let draws_per_chain = chains.first().map_or(0, |(_, draws)| draws.len());
        let mut stored: Vec<ChainDraws> = Vec::with_capacity(chains.len());

        for (id, draws) in chains {
            if stored.iter().any(|chain| chain.id == id) {
                return Err(StoreError::DuplicateChain { chain: id });
            }
            if draws.len() != draws_per_chain {
                return Err(StoreError::UnequalChainLengths {
                    chain: id,
                    expected: draws_per_chain,
                    found: draws.len(),
                });
            }
            if let Some(draw) = draws.iter().find(|draw| draw.len() != width) {
                return Err(StoreError::DrawWidth {
                    chain: id,
                    expected: width,
                    found: draw.len(),
                });
            }
            stored.push(ChainDraws {
                id,
                draws: Mat::from_fn(draws.len(), width, |i, j| draws[i][j]),
            });
        }

        Ok(Self {
            layout,
            chains: stored,
            draws_per_chain,
            grid: None,
        })
    }

    /// Record the grid that `Generated` entries were evaluated on.
    #[must_use]
    pub fn with_prediction_grid(mut self, grid: PredictionGrid) -> Self {
        self.grid = Some(grid);
        self
    }

    #[must_use]
    pub const fn prediction_grid(&self) -> Option<&PredictionGrid> {
        self.grid.as_ref()
    }

    /// Whether `name` was stored as a generated quantity on exactly `grid`.
    #[must_use]
    pub fn holds_on_grid(&self, name: &str, grid: &PredictionGrid) -> bool {
        let Some(stored) = &self.grid else {
            return false;
        };
        self.layout(name).is_ok_and(|entry| {
            entry.kind == ParameterKind::Generated && entry.len == grid.len()
        }) && stored.same_points(grid)
    }

    /// Pooled draws of `name`, chain-major: rows are draws, columns are
    /// components.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::UnknownParameter` if `name` is not stored.
    pub fn extract(&self, name: &str) -> Result<Mat<f64>, StoreError> {
        let entry = self.layout(name)?;
        let per_chain = self.draws_per_chain;
        Ok(Mat::from_fn(self.total_draws(), entry.len, |i, j| {
            self.chains[i / per_chain].draws[(i % per_chain, entry.offset + j)]
        }))
    }

    /// Pooled draws of one component of `name`.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if `name` is unknown or `index` is out of range.
    pub fn extract_component(&self, name: &str, index: usize) -> Result<Vec<f64>, StoreError> {
        Ok(self
            .chain_series(name, index)?
            .into_iter()
            .flatten()
            .collect())
    }

    /// Draws of `name` from a single chain.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::ChainOutOfRange` if the chain was not stored
    /// (for example because it diverged) and `UnknownParameter` for an
    /// unknown name.
    pub fn extract_chain(&self, name: &str, chain: usize) -> Result<Mat<f64>, StoreError> {
        let entry = self.layout(name)?;
        let stored = self.chain(chain)?;
        Ok(Mat::from_fn(stored.draws.nrows(), entry.len, |i, j| {
            stored.draws[(i, entry.offset + j)]
        }))
    }

    /// One component of `name`, split by chain.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if `name` is unknown or `index` is out of range.
    pub fn chain_series(&self, name: &str, index: usize) -> Result<Vec<Vec<f64>>, StoreError> {
        let entry = self.layout(name)?;
        if index >= entry.len {
            return Err(StoreError::ComponentOutOfRange {
                name: name.to_string(),
                index,
                len: entry.len,
            });
        }
        let column = entry.offset + index;
        Ok(self
            .chains
            .iter()
            .map(|chain| (0..chain.draws.nrows()).map(|i| chain.draws[(i, column)]).collect())
            .collect())
    }

    /// Layout entry for `name`.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::UnknownParameter` if `name` is not stored.
    pub fn layout(&self, name: &str) -> Result<&ParameterLayout, StoreError> {
        self.layout
            .iter()
            .find(|entry| entry.name == name)
            .ok_or_else(|| StoreError::UnknownParameter {
                name: name.to_string(),
            })
    }

    #[must_use]
    pub fn layouts(&self) -> &[ParameterLayout] {
        &self.layout
    }

    #[must_use]
    pub fn parameter_names(&self) -> Vec<&str> {
        self.layout.iter().map(|entry| entry.name.as_str()).collect()
    }

    #[must_use]
    pub fn names_of_kind(&self, kind: ParameterKind) -> Vec<&str> {
        self.layout
            .iter()
            .filter(|entry| entry.kind == kind)
            .map(|entry| entry.name.as_str())
            .collect()
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.layout.iter().any(|entry| entry.name == name)
    }

    #[must_use]
    pub fn chain_ids(&self) -> Vec<usize> {
        self.chains.iter().map(|chain| chain.id).collect()
    }

    #[must_use]
    pub fn chain_count(&self) -> usize {
        self.chains.len()
    }

    #[must_use]
    pub const fn draws_per_chain(&self) -> usize {
        self.draws_per_chain
    }

    #[must_use]
    pub fn total_draws(&self) -> usize {
        self.draws_per_chain * self.chains.len()
    }

    /// Flat draw `draw` (pooled, chain-major index).
    #[must_use]
    pub fn draw(&self, draw: usize) -> Option<Vec<f64>> {
        if draw >= self.total_draws() {
            return None;
        }
        let chain = &self.chains[draw / self.draws_per_chain].draws;
        let row = draw % self.draws_per_chain;
        Some((0..chain.ncols()).map(|j| chain[(row, j)]).collect())
    }

    fn chain(&self, chain: usize) -> Result<&ChainDraws, StoreError> {
        self.chains
            .iter()
            .find(|stored| stored.id == chain)
            .ok_or_else(|| StoreError::ChainOutOfRange {
                chain,
                available: self.chain_ids(),
            })
    }
}

impl PartialEq for PosteriorStore {
    /// Same layout, chain ids and grid, with every draw equal bit for bit.
    fn eq(&self, other: &Self) -> bool {
        let same_grid = match (&self.grid, &other.grid) {
            (Some(left), Some(right)) => left.same_points(right),
            (None, None) => true,
            _ => false,
        };
        same_grid
            && self.layout == other.layout
            && self.draws_per_chain == other.draws_per_chain
            && self.chain_ids() == other.chain_ids()
            && self.chains.iter().zip(&other.chains).all(|(left, right)| {
                let (rows, cols) = (left.draws.nrows(), left.draws.ncols());
                cols == right.draws.ncols()
                    && (0..rows).all(|i| {
                        (0..cols).all(|j| {
                            left.draws[(i, j)].to_bits() == right.draws[(i, j)].to_bits()
                        })
                    })
            })
    }
}
