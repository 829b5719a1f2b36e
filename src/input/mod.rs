/////////////////////////////////////////////////////////////////////////////////////////////\
//
// Dataset construction, design matrices and measurement errors.
//
// Created on: 15 Oct 2026
//
/////////////////////////////////////////////////////////////////////////////////////////////

//! # Model inputs
//!
//! Builds the immutable [`Dataset`] a model is fitted against: the observed
//! response, the design matrix expanded from raw predictor columns
//! (optional intercept, polynomial powers) and optional per-observation
//! measurement errors.
//!
//! Every column of the dataset is a named *field* that model expressions can
//! refer to: the response, each design column (`intercept`, `x`, `x^2`, ...),
//! raw predictors that were not expanded into the design, and one
//! `err_<field>` column per measurement-error vector.
//!
//! # Examples
//!
//! ```
//! use bayes_regression::{Dataset, DesignOptions, RawColumns};
//!
//! let raw = RawColumns::new("y", vec![1.0, 2.9, 5.2])
//!     .with_predictor("x", vec![0.0, 1.0, 2.0]);
//! let options = DesignOptions {
//!     polynomial_degree: 2,
//!     ..DesignOptions::default()
//! };
//! let dataset = Dataset::build(&raw, &options).expect("valid columns");
//!
//! assert_eq!(dataset.design_names(), ["intercept", "x", "x^2"]);
//! assert_eq!(dataset.design_matrix().ncols(), 3);
//! ```
//!
//! ```
//! use bayes_regression::{Dataset, DesignOptions, RawColumns};
//!
//! let raw = RawColumns::new("y", vec![1.0, 2.0, 3.0])
//!     .with_predictor("x", vec![0.0, 1.0]);
//!
//! assert!(Dataset::build(&raw, &DesignOptions::default()).is_err());
//! ```

use std::collections::BTreeMap;

use faer::Mat;
use thiserror::Error;

pub mod grid;

pub use grid::{PredictionGrid, build_grid};

pub const INTERCEPT: &str = "intercept";

/// Errors returned when building datasets and prediction grids.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum DatasetError {
    #[error("column `{field}` has {found} values; expected {expected}")]
    Shape {
        field: String,
        expected: usize,
        found: usize,
    },
    #[error("`{field}` value {value} at index {index:?} is out of range: {reason}")]
    Domain {
        field: String,
        index: Option<usize>,
        value: f64,
        reason: &'static str,
    },
    #[error("design matrix must have at least one column")]
    EmptyDesign,
    #[error("unknown field `{0}`")]
    UnknownField(String),
    #[error("field `{0}` is declared more than once")]
    DuplicateField(String),
}

/// Raw, column-aligned observations as handed over by a loader.
#[derive(Debug, Clone, Default)]
pub struct RawColumns {
    pub response: (String, Vec<f64>),
    pub predictors: Vec<(String, Vec<f64>)>,
    pub measurement_errors: Vec<(String, Vec<f64>)>,
}

impl RawColumns {
    #[must_use]
    pub fn new(response_name: impl Into<String>, response: Vec<f64>) -> Self {
        Self {
            response: (response_name.into(), response),
            predictors: Vec::new(),
            measurement_errors: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_predictor(mut self, name: impl Into<String>, values: Vec<f64>) -> Self {
        self.predictors.push((name.into(), values));
        self
    }

    /// Attach a known per-observation measurement error (standard deviation)
    /// to the response or to one of the predictors.
    #[must_use]
    pub fn with_measurement_error(mut self, field: impl Into<String>, values: Vec<f64>) -> Self {
        self.measurement_errors.push((field.into(), values));
        self
    }
}

/// Design-matrix expansion options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesignOptions {
    /// Prepend a column of ones named `intercept`.
    pub add_intercept: bool,
    /// Expand each predictor into its powers `1..=polynomial_degree`.
    pub polynomial_degree: usize,
    /// Predictors entering the design, in order. `None` uses every raw
    /// predictor in declaration order.
    pub predictor_names: Option<Vec<String>>,
}

impl Default for DesignOptions {
    fn default() -> Self {
        Self {
            add_intercept: true,
            polynomial_degree: 1,
            predictor_names: None,
        }
    }
}

impl DesignOptions {
    /// Design options without an intercept or polynomial terms.
    #[must_use]
    pub const fn raw() -> Self {
        Self {
            add_intercept: false,
            polynomial_degree: 1,
            predictor_names: None,
        }
    }

    /// # Errors
    ///
    /// Returns `DatasetError::Domain` if the polynomial degree is zero.
    pub fn validate(&self) -> Result<(), DatasetError> {
        if self.polynomial_degree == 0 {
            return Err(DatasetError::Domain {
                field: "polynomial_degree".to_string(),
                index: None,
                value: 0.0,
                reason: "polynomial degree must be at least 1",
            });
        }
        Ok(())
    }
}

/// Named columns backed by one `rows × fields` matrix.
#[derive(Debug, Clone)]
pub struct FieldTable {
    names: Vec<String>,
    values: Mat<f64>,
    design: Vec<usize>,
}

impl FieldTable {
    #[must_use]
    pub fn nrows(&self) -> usize {
        self.values.nrows()
    }

    #[must_use]
    pub fn names(&self) -> &[String] {
        &self.names
    }

    #[must_use]
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|candidate| candidate == name)
    }

    #[must_use]
    pub fn value(&self, row: usize, field: usize) -> f64 {
        self.values[(row, field)]
    }

    /// Field indices of the design columns, in design order.
    #[must_use]
    pub fn design_fields(&self) -> &[usize] {
        &self.design
    }

    #[must_use]
    pub fn column(&self, name: &str) -> Option<Vec<f64>> {
        self.index_of(name)
            .map(|field| (0..self.nrows()).map(|row| self.values[(row, field)]).collect())
    }

    /// Same names, design columns and values, compared bit for bit.
    fn same_values(&self, other: &Self) -> bool {
        self.names == other.names
            && self.design == other.design
            && self.nrows() == other.nrows()
            && (0..self.nrows()).all(|i| {
                (0..self.names.len())
                    .all(|j| self.values[(i, j)].to_bits() == other.values[(i, j)].to_bits())
            })
    }

    fn design_matrix(&self) -> Mat<f64> {
        Mat::from_fn(self.nrows(), self.design.len(), |i, j| {
            self.values[(i, self.design[j])]
        })
    }

    fn from_columns(columns: Vec<(String, Vec<f64>)>, design: Vec<usize>, rows: usize) -> Self {
        let values = Mat::from_fn(rows, columns.len(), |i, j| columns[j].1[i]);
        Self {
            names: columns.into_iter().map(|(name, _)| name).collect(),
            values,
            design,
        }
    }
}

/// Observed data for one experiment. Immutable once built.
#[derive(Debug, Clone)]
pub struct Dataset {
    table: FieldTable,
    response: usize,
    predictor_names: Vec<String>,
    measurement_errors: BTreeMap<String, usize>,
    options: DesignOptions,
    prediction_grid: Option<PredictionGrid>,
}

impl Dataset {
    /// Build a dataset from raw columns.
    ///
    /// # Errors
    ///
    /// Returns `DatasetError::Shape` for ragged or empty columns,
    /// `DatasetError::Domain` for non-finite values or negative measurement
    /// errors, and `DatasetError::UnknownField` / `DuplicateField` for naming
    /// problems.
    pub fn build(raw: &RawColumns, options: &DesignOptions) -> Result<Self, DatasetError> {
        options.validate()?;
        let (response_name, response) = &raw.response;
        let rows = response.len();
        if rows == 0 {
            return Err(DatasetError::Shape {
                field: response_name.clone(),
                expected: 1,
                found: 0,
            });
        }
        check_finite(response_name, response)?;
        for (name, values) in &raw.predictors {
            check_length(name, values, rows)?;
            check_finite(name, values)?;
        }

        let selected = select_predictors(raw, options)?;
        let mut columns: Vec<(String, Vec<f64>)> = vec![(response_name.clone(), response.clone())];
        let mut design = Vec::new();
        if options.add_intercept {
            design.push(columns.len());
            columns.push((INTERCEPT.to_string(), vec![1.0; rows]));
        }
        for (name, values) in &selected {
            for (power, column) in expand_powers(name, values, options.polynomial_degree) {
                design.push(columns.len());
                columns.push((power, column));
            }
        }
        if design.is_empty() {
            return Err(DatasetError::EmptyDesign);
        }
        for (name, values) in &raw.predictors {
            if !selected.iter().any(|(chosen, _)| chosen == name) {
                columns.push((name.clone(), values.clone()));
            }
        }

        let mut measurement_errors = BTreeMap::new();
        for (field, values) in &raw.measurement_errors {
            if field != response_name && !raw.predictors.iter().any(|(name, _)| name == field) {
                return Err(DatasetError::UnknownField(field.clone()));
            }
            let error_name = error_field_name(field);
            check_length(&error_name, values, rows)?;
            check_finite(&error_name, values)?;
            if let Some(index) = values.iter().position(|value| *value < 0.0) {
                return Err(DatasetError::Domain {
                    field: error_name,
                    index: Some(index),
                    value: values[index],
                    reason: "measurement errors must be non-negative",
                });
            }
            if measurement_errors.insert(field.clone(), columns.len()).is_some() {
                return Err(DatasetError::DuplicateField(error_name));
            }
            columns.push((error_name, values.clone()));
        }

        check_unique(&columns)?;
        let predictor_names = selected.into_iter().map(|(name, _)| name).collect();
        Ok(Self {
            table: FieldTable::from_columns(columns, design, rows),
            response: 0,
            predictor_names,
            measurement_errors,
            options: options.clone(),
            prediction_grid: None,
        })
    }

    /// Return a new dataset carrying `grid` as its prediction grid.
    #[must_use]
    pub fn with_prediction_grid(self, grid: PredictionGrid) -> Self {
        Self {
            prediction_grid: Some(grid),
            ..self
        }
    }

    #[must_use]
    pub fn n_obs(&self) -> usize {
        self.table.nrows()
    }

    #[must_use]
    pub fn response_name(&self) -> &str {
        &self.table.names[self.response]
    }

    /// Observed response as an `N × 1` matrix.
    #[must_use]
    pub fn response(&self) -> Mat<f64> {
        Mat::from_fn(self.n_obs(), 1, |i, _| self.table.value(i, self.response))
    }

    /// Design matrix (`N × K`).
    #[must_use]
    pub fn design_matrix(&self) -> Mat<f64> {
        self.table.design_matrix()
    }

    #[must_use]
    pub fn design_names(&self) -> Vec<&str> {
        self.table
            .design
            .iter()
            .map(|field| self.table.names[*field].as_str())
            .collect()
    }

    #[must_use]
    pub fn design_width(&self) -> usize {
        self.table.design.len()
    }

    /// Raw predictors that were expanded into the design, in design order.
    #[must_use]
    pub fn predictor_names(&self) -> &[String] {
        &self.predictor_names
    }

    #[must_use]
    pub const fn design_options(&self) -> &DesignOptions {
        &self.options
    }

    /// Measurement-error column for `field`, if one was supplied.
    #[must_use]
    pub fn measurement_error(&self, field: &str) -> Option<Vec<f64>> {
        self.measurement_errors
            .get(field)
            .map(|index| (0..self.n_obs()).map(|row| self.table.value(row, *index)).collect())
    }

    #[must_use]
    pub fn field_names(&self) -> &[String] {
        self.table.names()
    }

    #[must_use]
    pub fn has_field(&self, name: &str) -> bool {
        self.table.index_of(name).is_some()
    }

    #[must_use]
    pub fn column(&self, name: &str) -> Option<Vec<f64>> {
        self.table.column(name)
    }

    #[must_use]
    pub const fn fields(&self) -> &FieldTable {
        &self.table
    }

    #[must_use]
    pub const fn prediction_grid(&self) -> Option<&PredictionGrid> {
        self.prediction_grid.as_ref()
    }

    /// Name-level view of the dataset used to validate model expressions.
    #[must_use]
    pub fn schema(&self) -> DataSchema {
        DataSchema {
            fields: self.table.names.clone(),
            design_width: self.design_width(),
            measurement_errors: self
                .measurement_errors
                .iter()
                .map(|(field, index)| (field.clone(), self.table.names[*index].clone()))
                .collect(),
        }
    }
}

/// Field names, design width and measurement-error columns of a dataset.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DataSchema {
    pub fields: Vec<String>,
    pub design_width: usize,
    /// Observed field → name of its measurement-error column.
    pub measurement_errors: BTreeMap<String, String>,
}

impl DataSchema {
    #[must_use]
    pub fn has_field(&self, name: &str) -> bool {
        self.fields.iter().any(|field| field == name)
    }
}

#[must_use]
pub fn error_field_name(field: &str) -> String {
    format!("err_{field}")
}

fn select_predictors(
    raw: &RawColumns,
    options: &DesignOptions,
) -> Result<Vec<(String, Vec<f64>)>, DatasetError> {
    let Some(names) = &options.predictor_names else {
        return Ok(raw.predictors.clone());
    };
    names
        .iter()
        .map(|name| {
            raw.predictors
                .iter()
                .find(|(candidate, _)| candidate == name)
                .cloned()
                .ok_or_else(|| DatasetError::UnknownField(name.clone()))
        })
        .collect()
}

pub(crate) fn expand_powers(
    name: &str,
    values: &[f64],
    degree: usize,
) -> Vec<(String, Vec<f64>)> {
    (1..=degree)
        .map(|power| {
            let label = if power == 1 {
                name.to_string()
            } else {
                format!("{name}^{power}")
            };
            let exponent = i32::try_from(power).unwrap_or(i32::MAX);
            (label, values.iter().map(|value| value.powi(exponent)).collect())
        })
        .collect()
}

fn check_length(field: &str, values: &[f64], expected: usize) -> Result<(), DatasetError> {
    if values.len() == expected {
        Ok(())
    } else {
        Err(DatasetError::Shape {
            field: field.to_string(),
            expected,
            found: values.len(),
        })
    }
}

fn check_finite(field: &str, values: &[f64]) -> Result<(), DatasetError> {
    match values.iter().position(|value| !value.is_finite()) {
        Some(index) => Err(DatasetError::Domain {
            field: field.to_string(),
            index: Some(index),
            value: values[index],
            reason: "values must be finite",
        }),
        None => Ok(()),
    }
}

fn check_unique(columns: &[(String, Vec<f64>)]) -> Result<(), DatasetError> {
    for (position, (name, _)) in columns.iter().enumerate() {
        if columns[..position].iter().any(|(earlier, _)| earlier == name) {
            return Err(DatasetError::DuplicateField(name.clone()));
        }
    }
    Ok(())
}
