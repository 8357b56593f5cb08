//! Console reporting: accuracy lines, confusion matrix heatmap and the sweep table.

use colored::Colorize;
use ndarray::{Array2, Axis};

use crate::{data::Polarity, sweep::SweepResults, training::ExperimentResult};

pub const LABELS: [&str; 2] = ["negative", "positive"];

pub fn accuracy_lines(result: &ExperimentResult) -> String {
    format!(
        "Training set accuracy: {:.4}\nTest set accuracy: {:.4}",
        result.training_accuracy, result.test_accuracy
    )
}

/// 2x2 label counts; rows are true classes, columns predicted classes.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfusionMatrix {
    counts: Array2<u64>,
}

impl ConfusionMatrix {
    /// Pairs `targets[i]` with `predictions[i]`; extra entries on either side are ignored.
    pub fn from_labels(targets: &[Polarity], predictions: &[Polarity]) -> Self {
        let mut counts = Array2::zeros((Polarity::ALL.len(), Polarity::ALL.len()));
        for (target, prediction) in targets.iter().zip(predictions) {
            counts[[target.class_id(), prediction.class_id()]] += 1;
        }

        Self { counts }
    }

    pub fn rows(&self) -> Vec<Vec<u64>> {
        self.counts.outer_iter().map(|row| row.to_vec()).collect()
    }

    /// Each row divided by its sum. A class with no true examples yields a NaN row.
    pub fn normalized(&self) -> Array2<f64> {
        let counts = self.counts.mapv(|count| count as f64);
        let sums = counts.sum_axis(Axis(1)).insert_axis(Axis(1));
        &counts / &sums
    }
}

fn shade(value: f64, text: &str) -> String {
    if value.is_nan() {
        return text.to_string();
    }

    let value = value.clamp(0.0, 1.0);
    let channel = |low: f64, high: f64| (low + (high - low) * value).round() as u8;
    let cell = text.on_truecolor(channel(235.0, 8.0), channel(242.0, 48.0), channel(250.0, 107.0));

    if value > 0.5 {
        cell.white().to_string()
    } else {
        cell.black().to_string()
    }
}

/// Annotated heatmap of `matrix`; columns are labelled "Predicted", rows "True".
pub fn render_heatmap(matrix: &Array2<f64>, labels: &[&str]) -> String {
    const CELL: usize = 10;
    let label_width = labels.iter().map(|label| label.len()).max().unwrap_or(0);
    let gutter = "True".len() + 1 + label_width + 1;

    let mut lines = Vec::with_capacity(matrix.nrows() + 2);
    lines.push(format!(
        "{:gutter$}{:^width$}",
        "",
        "Predicted".bold(),
        width = CELL * labels.len()
    ));

    let ticks: String = labels.iter().map(|label| format!("{label:^CELL$}")).collect();
    lines.push(format!("{:gutter$}{ticks}", ""));

    for (row_index, row) in matrix.outer_iter().enumerate() {
        let axis = if row_index == 0 { "True" } else { "" };
        let label = labels.get(row_index).copied().unwrap_or_default();

        let mut line = format!("{:<4} {label:>label_width$} ", axis.bold());
        for &value in row.iter() {
            line.push_str(&shade(value, &format!("{value:^CELL$.2}")));
        }
        lines.push(line);
    }

    lines.iter().map(|line| format!("{line}\n")).collect()
}

/// One row per sweep entry with both accuracies.
pub fn comparison_table(results: &SweepResults) -> String {
    const TRAINING: &str = "Training accuracy";
    const TEST: &str = "Test accuracy";

    let label_width = results
        .labels()
        .map(str::len)
        .max()
        .unwrap_or(0)
        .max("experiment".len());

    let header = format!("{:<label_width$}  {TRAINING:>18}  {TEST:>14}\n", "experiment");
    let rows = results.records.iter().map(|record| {
        format!(
            "{:<label_width$}  {:>18.4}  {:>14.4}\n",
            record.label, record.result.training_accuracy, record.result.test_accuracy
        )
    });

    std::iter::once(header).chain(rows).collect()
}
