/////////////////////////////////////////////////////////////////////////////////////////////\
//
// Summary, prediction and convergence tables.
//
// Created on: 15 Oct 2026
//
/////////////////////////////////////////////////////////////////////////////////////////////

//! Text tables for posterior summaries, prediction bands and convergence
//! diagnostics, rendered with `comfy_table`.

use comfy_table::{
    Attribute, Cell, Color, ContentArrangement, Table, presets::UTF8_FULL_CONDENSED,
};

use crate::posterior::{ConvergenceSummary, ParameterSummary};
use crate::predict::PredictionBand;

/// Split-R-hat above which a component is highlighted.
pub const RHAT_WARNING: f64 = 1.1;

/// One row per summarized component: mean, standard deviation, median and
/// the equal-tailed `level` interval.
#[must_use]
pub fn render_summary_table(summaries: &[ParameterSummary], level: f64) -> String {
    let (lower, upper) = interval_headers(level);
    let mut table = titled_table(&[
        "parameter",
        "mean",
        "sd",
        "median",
        lower.as_str(),
        upper.as_str(),
    ]);
    for summary in summaries {
        table.add_row(vec![
            Cell::new(&summary.label),
            number_cell(summary.mean),
            number_cell(summary.std_dev),
            number_cell(summary.median),
            number_cell(summary.lower),
            number_cell(summary.upper),
        ]);
    }
    table.to_string()
}

/// Bands of one quantity against the grid coordinate `axis`.
///
/// Rows beyond the shorter of `points` and `bands` are not rendered.
#[must_use]
pub fn render_prediction_table(
    axis: &str,
    points: &[f64],
    bands: &[PredictionBand],
    level: f64,
) -> String {
    let (lower, upper) = interval_headers(level);
    let mut table = titled_table(&[axis, "mean", "median", lower.as_str(), upper.as_str()]);
    for (point, band) in points.iter().zip(bands) {
        table.add_row(vec![
            number_cell(*point),
            number_cell(band.mean),
            number_cell(band.median),
            number_cell(band.lower),
            number_cell(band.upper),
        ]);
    }
    table.to_string()
}

/// Split-R-hat and effective sample size per component; components with a
/// split-R-hat above [`RHAT_WARNING`] are highlighted.
#[must_use]
pub fn render_convergence_table(summary: &ConvergenceSummary) -> String {
    let mut table = titled_table(&["parameter", "split R-hat", "ess"]);
    for component in &summary.components {
        let rhat = match component.split_rhat {
            Some(value) if value > RHAT_WARNING => Cell::new(format!("{value:.3}"))
                .fg(Color::Red)
                .add_attribute(Attribute::Bold),
            Some(value) => Cell::new(format!("{value:.3}")),
            None => Cell::new("-"),
        };
        table.add_row(vec![
            Cell::new(&component.label),
            rhat,
            Cell::new(format!("{:.0}", component.effective_sample_size)),
        ]);
    }
    table.to_string()
}

fn interval_headers(level: f64) -> (String, String) {
    let tail = (1.0 - level) * 50.0;
    (format!("{tail:.1}%"), format!("{:.1}%", 100.0 - tail))
}

fn number_cell(value: f64) -> Cell {
    Cell::new(format!("{value:.4}"))
}

/// Condensed UTF-8 table with a bold header row.
fn titled_table(columns: &[&str]) -> Table {
    let header: Vec<Cell> = columns
        .iter()
        .map(|column| Cell::new(column).add_attribute(Attribute::Bold))
        .collect();
    let mut table = Table::new();
    table.load_preset(UTF8_FULL_CONDENSED);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(header);
    table
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::posterior::diagnostics::ComponentConvergence;

    fn summary(label: &str, mean: f64) -> ParameterSummary {
        ParameterSummary {
            label: label.to_string(),
            mean,
            std_dev: 0.5,
            median: mean,
            lower: mean - 1.0,
            upper: mean + 1.0,
            draws: 100,
        }
    }

    #[test]
    fn summary_table_lists_every_component() {
        let table = render_summary_table(&[summary("beta[0]", 2.0), summary("sigma", 0.7)], 0.95);
        assert!(table.contains("beta[0]"));
        assert!(table.contains("sigma"));
        assert!(table.contains("2.5%"));
        assert!(table.contains("97.5%"));
        assert!(table.contains("2.0000"));
    }

    #[test]
    fn empty_tables_still_render_headers() {
        assert!(render_summary_table(&[], 0.9).contains("95.0%"));
        assert!(render_prediction_table("x", &[], &[], 0.5).contains("25.0%"));
    }

    #[test]
    fn prediction_table_pairs_points_with_bands() {
        let band = PredictionBand {
            mean: 1.0,
            median: 1.0,
            lower: 0.5,
            upper: 1.5,
        };
        let table = render_prediction_table("x", &[0.25, 0.75], &[band, band], 0.95);
        assert!(table.contains("0.2500"));
        assert!(table.contains("0.7500"));
        assert!(table.contains("1.5000"));
    }

    #[test]
    fn convergence_table_marks_missing_rhat() {
        let summary = ConvergenceSummary {
            chain_count: 2,
            draws_per_chain: 3,
            components: vec![
                ComponentConvergence {
                    label: "mu".to_string(),
                    split_rhat: None,
                    effective_sample_size: 6.0,
                },
                ComponentConvergence {
                    label: "tau".to_string(),
                    split_rhat: Some(1.5),
                    effective_sample_size: 2.0,
                },
            ],
        };
        let table = render_convergence_table(&summary);
        assert!(table.contains("mu"));
        assert!(table.contains('-'));
        assert!(table.contains("1.500"));
    }
}
