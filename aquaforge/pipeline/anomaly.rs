//! Stateless anomaly scoring over one numeric column.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::{
    dataset::RawDataset,
    error::{PipelineError, PipelineResult},
    features::FeatureMatrix,
};

/// Scoring method.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnomalyMethod {
    /// Standardized deviation from the mean; flagged when `|z| > threshold`.
    #[default]
    ZScore,
    /// Distance outside the quartiles in IQR units; flagged outside `[Q1 - k*IQR, Q3 + k*IQR]`.
    Iqr,
}

impl AnomalyMethod {
    /// Stable name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ZScore => "zscore",
            Self::Iqr => "iqr",
        }
    }
}

impl fmt::Display for AnomalyMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AnomalyMethod {
    type Err = PipelineError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "zscore" | "z-score" | "z" => Ok(Self::ZScore),
            "iqr" => Ok(Self::Iqr),
            other => Err(PipelineError::Config(format!("unknown anomaly method {other}"))),
        }
    }
}

/// Severity of a score relative to the threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// At or below the threshold.
    Low,
    /// Above the threshold, up to 1.5 times it.
    Medium,
    /// Above 1.5 times the threshold.
    High,
}

impl Severity {
    fn classify(score: f64, threshold: f64) -> Self {
        if score <= threshold {
            Self::Low
        } else if score <= threshold * 1.5 {
            Self::Medium
        } else {
            Self::High
        }
    }
}

/// Score of one row.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AnomalyScore {
    /// Row position in the scored column.
    pub row: usize,
    /// Non-negative score; 0 for missing values.
    pub score: f64,
    /// Whether the row is flagged.
    pub is_anomaly: bool,
    /// Severity bin of the score.
    pub severity: Severity,
}

/// Scores `values`. Non-finite values score 0 and are excluded from the statistics.
/// Empty input yields an empty result; a constant column flags nothing.
#[must_use]
pub fn score(values: &[f64], method: AnomalyMethod, threshold: f64) -> Vec<AnomalyScore> {
    let finite: Vec<f64> = values.iter().copied().filter(|value| value.is_finite()).collect();
    let scored: Vec<(f64, bool)> = match method {
        AnomalyMethod::ZScore => zscores(values, &finite)
            .into_iter()
            .map(|score| (score, score > threshold))
            .collect(),
        AnomalyMethod::Iqr => iqr_scores(values, &finite, threshold),
    };
    scored
        .into_iter()
        .enumerate()
        .map(|(row, (score, is_anomaly))| AnomalyScore {
            row,
            score,
            is_anomaly,
            // a zero-width fence has no scale; anything outside it is maximal
            severity: if is_anomaly && score <= 0.0 {
                Severity::High
            } else {
                Severity::classify(score, threshold)
            },
        })
        .collect()
}

/// Scores one feature column of a matrix.
pub fn score_column(
    matrix: &FeatureMatrix,
    column: &str,
    method: AnomalyMethod,
    threshold: f64,
) -> PipelineResult<Vec<AnomalyScore>> {
    let values = matrix
        .column(column)
        .ok_or_else(|| PipelineError::UnknownColumn(column.to_string()))?;
    Ok(score(&values.to_vec(), method, threshold))
}

/// Scores one numeric column of a raw dataset; missing cells score 0.
pub fn score_dataset_column(
    dataset: &RawDataset,
    column: &str,
    method: AnomalyMethod,
    threshold: f64,
) -> PipelineResult<Vec<AnomalyScore>> {
    let values: Vec<f64> = dataset
        .numeric_column(column)?
        .into_iter()
        .map(|value| value.unwrap_or(f64::NAN))
        .collect();
    Ok(score(&values, method, threshold))
}

#[allow(clippy::cast_precision_loss)]
fn zscores(values: &[f64], finite: &[f64]) -> Vec<f64> {
    if finite.is_empty() {
        return vec![0.0; values.len()];
    }
    let n = finite.len() as f64;
    let mean = finite.iter().sum::<f64>() / n;
    let std = (finite.iter().map(|value| (value - mean).powi(2)).sum::<f64>() / n).sqrt();
    values
        .iter()
        .map(|value| {
            if !value.is_finite() || std <= f64::EPSILON * mean.abs().max(1.0) {
                0.0
            } else {
                ((value - mean) / std).abs()
            }
        })
        .collect()
}

/// Score is the distance beyond the nearest quartile in IQR units (0 when IQR is 0).
/// Flags come from the fence `[Q1 - k*IQR, Q3 + k*IQR]` itself.
fn iqr_scores(values: &[f64], finite: &[f64], multiplier: f64) -> Vec<(f64, bool)> {
    let mut sorted = finite.to_vec();
    sorted.sort_by(f64::total_cmp);
    let (Some(q1), Some(q3)) = (quantile(&sorted, 0.25), quantile(&sorted, 0.75)) else {
        return vec![(0.0, false); values.len()];
    };
    let iqr = q3 - q1;
    let (lower, upper) = (q1 - multiplier * iqr, q3 + multiplier * iqr);
    values
        .iter()
        .map(|value| {
            if !value.is_finite() {
                return (0.0, false);
            }
            let outside = if *value < q1 {
                q1 - value
            } else if *value > q3 {
                value - q3
            } else {
                0.0
            };
            let score = if iqr > 0.0 { outside / iqr } else { 0.0 };
            (score, *value < lower || *value > upper)
        })
        .collect()
}

/// Linear-interpolated quantile of sorted values.
#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn quantile(sorted: &[f64], q: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    let position = q * (sorted.len() - 1) as f64;
    let lower = position.floor() as usize;
    let upper = position.ceil() as usize;
    let weight = position - lower as f64;
    Some(sorted[lower] + (sorted[upper] - sorted[lower]) * weight)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_column_has_no_anomalies() {
        let values = vec![42.0; 50];
        for method in [AnomalyMethod::ZScore, AnomalyMethod::Iqr] {
            let scores = score(&values, method, 3.0);
            assert_eq!(scores.len(), 50);
            assert!(scores.iter().all(|s| !s.is_anomaly && s.score == 0.0));
        }
    }

    #[test]
    fn empty_column_scores_nothing() {
        assert!(score(&[], AnomalyMethod::ZScore, 3.0).is_empty());
        assert!(score(&[], AnomalyMethod::Iqr, 1.5).is_empty());
    }

    #[test]
    fn zscore_flags_the_spike() {
        let mut values: Vec<f64> = (0..40).map(|idx| 10.0 + f64::from(idx % 3)).collect();
        values[17] = 60.0;
        let scores = score(&values, AnomalyMethod::ZScore, 3.0);
        let flagged: Vec<usize> = scores.iter().filter(|s| s.is_anomaly).map(|s| s.row).collect();
        assert_eq!(flagged, vec![17]);
        assert_eq!(scores[17].severity, Severity::High);
        assert_eq!(scores[0].severity, Severity::Low);
    }

    #[test]
    fn iqr_uses_the_fences() {
        let values = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0, 30.0, -20.0];
        let scores = score(&values, AnomalyMethod::Iqr, 1.5);
        let flagged: Vec<usize> = scores.iter().filter(|s| s.is_anomaly).map(|s| s.row).collect();
        assert_eq!(flagged, vec![9, 10]);
        assert!(scores[4].score.abs() < f64::EPSILON);
    }

    #[test]
    fn zero_iqr_flags_anything_off_the_quartiles() {
        let mut values = vec![10.0; 20];
        values.push(10.5);
        let scores = score(&values, AnomalyMethod::Iqr, 1.5);
        assert!(scores[20].is_anomaly);
        assert_eq!(scores[20].score, 0.0);
        assert_eq!(scores[20].severity, Severity::High);
        assert!(scores[..20].iter().all(|s| !s.is_anomaly && s.severity == Severity::Low));
    }

    #[test]
    fn missing_values_are_ignored() {
        let values = [1.0, f64::NAN, 1.0, 1.0];
        let scores = score(&values, AnomalyMethod::ZScore, 3.0);
        assert_eq!(scores[1].score, 0.0);
        assert!(!scores[1].is_anomaly);
    }

    #[test]
    fn severity_bins() {
        assert_eq!(Severity::classify(3.0, 3.0), Severity::Low);
        assert_eq!(Severity::classify(4.5, 3.0), Severity::Medium);
        assert_eq!(Severity::classify(4.6, 3.0), Severity::High);
        assert_eq!("IQR".parse::<AnomalyMethod>().unwrap(), AnomalyMethod::Iqr);
    }
}
