//! Prediction grids.

use faer::Mat;

use super::{
    DatasetError, Dataset, FieldTable, INTERCEPT, check_finite, check_length, expand_powers,
};
use crate::utils::usize_to_f64;

/// Evenly spaced sequence of `count` points from `min` to `max` inclusive.
///
/// # Errors
///
/// Returns `DatasetError::Domain` if `count < 2`, the bounds are not finite or
/// `min >= max`.
pub fn build_grid(min: f64, max: f64, count: usize) -> Result<Vec<f64>, DatasetError> {
    if count < 2 {
        return Err(DatasetError::Domain {
            field: "count".to_string(),
            index: None,
            value: usize_to_f64(count),
            reason: "a grid needs at least two points",
        });
    }
    if !(min.is_finite() && max.is_finite()) || min >= max {
        return Err(DatasetError::Domain {
            field: "max".to_string(),
            index: None,
            value: max,
            reason: "grid bounds must be finite with min < max",
        });
    }
    let step = (max - min) / usize_to_f64(count - 1);
    let mut grid: Vec<f64> = (0..count)
        .map(|i| usize_to_f64(i).mul_add(step, min))
        .collect();
    grid[count - 1] = max;
    Ok(grid)
}

/// Points at which generated quantities are evaluated.
///
/// A grid shares the field names of the dataset it was derived from, so the
/// same model expressions resolve against it.
#[derive(Debug, Clone)]
pub struct PredictionGrid {
    table: FieldTable,
}

impl PredictionGrid {
    /// Predict at the observed rows of `dataset` (all of its fields).
    #[must_use]
    pub fn observed(dataset: &Dataset) -> Self {
        Self {
            table: dataset.fields().clone(),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.table.nrows()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.table.nrows() == 0
    }

    #[must_use]
    pub const fn fields(&self) -> &FieldTable {
        &self.table
    }

    #[must_use]
    pub fn column(&self, name: &str) -> Option<Vec<f64>> {
        self.table.column(name)
    }

    /// Whether `other` has the same fields at the same points.
    #[must_use]
    pub fn same_points(&self, other: &Self) -> bool {
        self.table.same_values(&other.table)
    }

    /// Design matrix of the grid (`M × K`).
    #[must_use]
    pub fn design_matrix(&self) -> Mat<f64> {
        self.table.design_matrix()
    }
}

impl Dataset {
    /// Build a prediction grid with the same design expansion as this
    /// dataset. `predictors` must provide one column per design predictor;
    /// extra named columns are carried along as plain fields.
    ///
    /// # Errors
    ///
    /// Returns `DatasetError::UnknownField` if a design predictor is missing,
    /// `Shape` for ragged columns and `Domain` for non-finite values.
    pub fn grid(&self, predictors: &[(&str, Vec<f64>)]) -> Result<PredictionGrid, DatasetError> {
        let rows = predictors.first().map_or(0, |(_, values)| values.len());
        for (name, values) in predictors {
            check_length(name, values, rows)?;
            check_finite(name, values)?;
        }

        let mut columns: Vec<(String, Vec<f64>)> = Vec::new();
        let mut design = Vec::new();
        if self.options.add_intercept {
            design.push(columns.len());
            columns.push((INTERCEPT.to_string(), vec![1.0; rows]));
        }
        for name in &self.predictor_names {
            let (_, values) = predictors
                .iter()
                .find(|(candidate, _)| candidate == name)
                .ok_or_else(|| DatasetError::UnknownField(name.clone()))?;
            for (power, column) in expand_powers(name, values, self.options.polynomial_degree) {
                design.push(columns.len());
                columns.push((power, column));
            }
        }
        for (name, values) in predictors {
            if !columns.iter().any(|(existing, _)| existing == name) {
                columns.push(((*name).to_string(), values.clone()));
            }
        }

        Ok(PredictionGrid {
            table: FieldTable::from_columns(columns, design, rows),
        })
    }

    /// Grid of `count` evenly spaced values spanning the observed range of a
    /// single design predictor.
    ///
    /// # Errors
    ///
    /// Returns `DatasetError::UnknownField` if `predictor` is not a design
    /// predictor, or the errors of [`build_grid`].
    pub fn grid_over(&self, predictor: &str, count: usize) -> Result<PredictionGrid, DatasetError> {
        if self.predictor_names.len() != 1 || self.predictor_names[0] != predictor {
            return Err(DatasetError::UnknownField(predictor.to_string()));
        }
        let values = self
            .column(predictor)
            .ok_or_else(|| DatasetError::UnknownField(predictor.to_string()))?;
        let min = values.iter().copied().fold(f64::INFINITY, f64::min);
        let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        self.grid(&[(predictor, build_grid(min, max, count)?)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::{DesignOptions, RawColumns};
    use approx::assert_relative_eq;

    #[test]
    fn grid_is_strictly_increasing_and_spans_bounds() {
        for count in [2, 3, 10, 500] {
            let grid = build_grid(-1.5, 4.0, count).expect("valid grid");
            assert_eq!(grid.len(), count);
            assert_relative_eq!(grid[0], -1.5);
            assert!(grid[count - 1] <= 4.0);
            assert!(grid.windows(2).all(|pair| pair[0] < pair[1]));
        }
    }

    #[test]
    fn grid_with_fewer_than_two_points_is_a_domain_error() {
        for count in [0, 1] {
            assert!(matches!(
                build_grid(0.0, 1.0, count),
                Err(DatasetError::Domain { .. })
            ));
        }
    }

    #[test]
    fn grid_with_inverted_bounds_is_rejected() {
        assert!(build_grid(1.0, 1.0, 5).is_err());
        assert!(build_grid(2.0, 1.0, 5).is_err());
    }

    #[test]
    fn dataset_grid_reuses_design_expansion() {
        let raw = RawColumns::new("y", vec![0.0, 1.0, 4.0]).with_predictor("x", vec![0.0, 1.0, 2.0]);
        let options = DesignOptions {
            polynomial_degree: 2,
            ..DesignOptions::default()
        };
        let dataset = Dataset::build(&raw, &options).expect("valid");
        let grid = dataset.grid_over("x", 5).expect("grid");
        let design = grid.design_matrix();
        assert_eq!(grid.len(), 5);
        assert_eq!(design.ncols(), 3);
        assert_relative_eq!(design[(4, 2)], 4.0);
        assert_relative_eq!(design[(2, 1)], 1.0);
    }

    #[test]
    fn dataset_grid_requires_every_design_predictor() {
        let raw = RawColumns::new("y", vec![0.0, 1.0])
            .with_predictor("x1", vec![0.0, 1.0])
            .with_predictor("x2", vec![1.0, 0.0]);
        let dataset = Dataset::build(&raw, &DesignOptions::default()).expect("valid");
        let err = dataset.grid(&[("x1", vec![0.5])]).expect_err("x2 missing");
        assert_eq!(err, DatasetError::UnknownField("x2".to_string()));
    }

    #[test]
    fn observed_grid_matches_dataset_rows() {
        let raw = RawColumns::new("y", vec![3.0, 1.0, 2.0]).with_predictor("x", vec![0.0, 1.0, 2.0]);
        let dataset = Dataset::build(&raw, &DesignOptions::default()).expect("valid");
        let grid = PredictionGrid::observed(&dataset);
        assert_eq!(grid.len(), 3);
        assert_eq!(grid.column("y"), Some(vec![3.0, 1.0, 2.0]));
    }

    #[test]
    fn grids_of_equal_size_are_told_apart_by_their_points() {
        let raw = RawColumns::new("y", vec![3.0, 1.0, 2.0]).with_predictor("x", vec![0.0, 1.0, 2.0]);
        let dataset = Dataset::build(&raw, &DesignOptions::default()).expect("valid");
        let grid = dataset.grid_over("x", 4).expect("grid");
        assert!(grid.same_points(&grid.clone()));
        let shifted = dataset
            .grid(&[("x", vec![10.0, 11.0, 12.0, 13.0])])
            .expect("shifted grid");
        assert_eq!(shifted.len(), grid.len());
        assert!(!grid.same_points(&shifted));
    }
}
