//! Pre-training data checks and matrix sanity checks.

use serde::{Deserialize, Serialize};

use crate::{
    dataset::RawDataset,
    error::{PipelineError, PipelineResult},
    features::FeatureMatrix,
    schema,
};

const MAX_TARGET_MISSING: f64 = 0.10;
const MAX_DUPLICATE_ROWS: f64 = 0.05;
const TARGET_UPPER_BOUND: f64 = 1e6;

/// Outcome of one data-quality check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityCheck {
    /// Check name.
    pub name: String,
    /// Whether the check passed.
    pub passed: bool,
    /// Measured value.
    pub observed: f64,
    /// Human-readable detail.
    pub detail: String,
}

/// Data-quality checks over a raw dataset and its target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataQualityReport {
    /// Individual checks.
    pub checks: Vec<QualityCheck>,
    /// Fraction of checks that passed.
    pub quality_score: f64,
}

impl DataQualityReport {
    /// True when every check passed.
    #[must_use]
    pub fn passed(&self) -> bool {
        self.checks.iter().all(|check| check.passed)
    }

    /// Fails with `DataQuality` when the score is below `required`.
    pub fn require(&self, required: f64) -> PipelineResult<()> {
        if self.quality_score < required {
            return Err(PipelineError::DataQuality {
                score: self.quality_score,
                required,
            });
        }
        Ok(())
    }
}

/// Checks target completeness, duplicate rows and the target range.
#[allow(clippy::cast_precision_loss)]
pub fn validate_data_quality(dataset: &RawDataset, target: &str) -> PipelineResult<DataQualityReport> {
    let values = dataset.numeric_column(target)?;
    let rows = values.len().max(1) as f64;
    let missing = values.iter().filter(|value| value.is_none()).count() as f64 / rows;
    let duplicates = schema::duplicate_row_ratio(dataset);
    let out_of_range = values
        .iter()
        .flatten()
        .filter(|value| !(0.0..TARGET_UPPER_BOUND).contains(*value))
        .count();

    let checks = vec![
        QualityCheck {
            name: "target_missing".into(),
            passed: missing < MAX_TARGET_MISSING,
            observed: missing,
            detail: format!("{:.1}% of {target} missing", missing * 100.0),
        },
        QualityCheck {
            name: "duplicate_rows".into(),
            passed: duplicates < MAX_DUPLICATE_ROWS,
            observed: duplicates,
            detail: format!("{:.1}% duplicate rows", duplicates * 100.0),
        },
        QualityCheck {
            name: "target_range".into(),
            passed: out_of_range == 0,
            observed: out_of_range as f64,
            detail: format!("{out_of_range} values outside [0, 1e6)"),
        },
    ];
    let passed = checks.iter().filter(|check| check.passed).count();
    Ok(DataQualityReport {
        quality_score: passed as f64 / checks.len() as f64,
        checks,
    })
}

/// Structural problems found in a feature matrix.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputValidation {
    /// Problems that make the matrix unusable.
    pub issues: Vec<String>,
    /// Problems worth reporting.
    pub warnings: Vec<String>,
}

impl InputValidation {
    /// True when there are no issues.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.issues.is_empty()
    }
}

/// Flags empty matrices, length mismatches, all-zero columns and non-finite values.
#[must_use]
pub fn validate_feature_matrix(matrix: &FeatureMatrix) -> InputValidation {
    let mut report = InputValidation::default();
    if matrix.is_empty() {
        report.issues.push("feature matrix has no rows".into());
        return report;
    }
    if matrix.features().nrows() != matrix.target().len() {
        report.issues.push(format!(
            "{} feature rows but {} target values",
            matrix.features().nrows(),
            matrix.target().len()
        ));
    }
    for (name, column) in matrix.columns().iter().zip(matrix.features().columns()) {
        if column.iter().all(|value| *value == 0.0) {
            report.warnings.push(format!("column {name} is all zeros"));
        }
        if column.iter().any(|value| !value.is_finite()) {
            report.warnings.push(format!("column {name} has non-finite values"));
        }
    }
    if matrix.target().iter().any(|value| !value.is_finite()) {
        report.warnings.push("target has non-finite values".into());
    }
    report
}

/// Accepts horizons in `1..=max`.
pub const fn validate_horizon(horizon: usize, max: usize) -> PipelineResult<()> {
    if horizon == 0 || horizon > max {
        return Err(PipelineError::InvalidHorizon {
            requested: horizon,
            max,
        });
    }
    Ok(())
}
