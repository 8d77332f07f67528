use std::collections::HashSet;

use indexmap::IndexSet;
use serde::{Deserialize, Serialize};

use crate::{
    config::SchemaConfig,
    dataset::{RawDataset, Value},
    error::{PipelineError, PipelineResult},
};

/// Shape of a column as seen by inference.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ColumnKind {
    /// Every present value is a number.
    Numeric,
    /// Every present value is a date cell.
    Date,
    /// Anything else with at least one present value.
    Text,
    /// No present values.
    Empty,
}

/// Per-column statistics gathered during inference.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ColumnProfile {
    /// Column name.
    pub name: String,
    /// Observed shape.
    pub kind: ColumnKind,
    /// Share of missing cells.
    pub missing_ratio: f64,
    /// Share of present cells that parse as dates.
    pub date_parse_ratio: f64,
}

/// Snapshot of the usable structure of one dataset.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Schema {
    date_column: Option<String>,
    group_column: Option<String>,
    candidate_targets: IndexSet<String>,
    candidate_features: IndexSet<String>,
    quality: f64,
    profiles: Vec<ColumnProfile>,
}

impl Schema {
    /// Inferred date column.
    #[must_use]
    pub fn date_column(&self) -> Option<&str> {
        self.date_column.as_deref()
    }

    /// Inferred grouping column.
    #[must_use]
    pub fn group_column(&self) -> Option<&str> {
        self.group_column.as_deref()
    }

    /// Numeric columns usable as targets, in dataset order.
    #[must_use]
    pub fn candidate_targets(&self) -> &IndexSet<String> {
        &self.candidate_targets
    }

    /// Numeric columns usable as features, in dataset order.
    #[must_use]
    pub fn candidate_features(&self) -> &IndexSet<String> {
        &self.candidate_features
    }

    /// Reporting-only quality score in `[0, 1]`.
    #[must_use]
    pub fn quality(&self) -> f64 {
        self.quality
    }

    /// Column statistics, in dataset order.
    #[must_use]
    pub fn profiles(&self) -> &[ColumnProfile] {
        &self.profiles
    }

    /// True when no target candidates exist; training cannot proceed.
    #[must_use]
    pub fn is_unusable(&self) -> bool {
        self.candidate_targets.is_empty()
    }

    /// New snapshot with an operator-chosen date column.
    pub fn with_date_column(self, column: &str) -> PipelineResult<Self> {
        let group = self.group_column.clone();
        self.with_override(Some(column), group.as_deref())
    }

    /// New snapshot with an operator-chosen group column.
    pub fn with_group_column(self, column: &str) -> PipelineResult<Self> {
        let date = self.date_column.clone();
        self.with_override(date.as_deref(), Some(column))
    }

    fn with_override(self, date: Option<&str>, group: Option<&str>) -> PipelineResult<Self> {
        for column in date.iter().chain(group.iter()) {
            if !self.profiles.iter().any(|profile| profile.name == *column) {
                return Err(PipelineError::UnknownColumn((*column).to_string()));
            }
        }
        let reserved = |name: &str| Some(name) == date || Some(name) == group;
        let candidate_targets = self
            .candidate_targets
            .iter()
            .filter(|name| !reserved(name))
            .cloned()
            .collect();
        let candidate_features = self
            .candidate_features
            .iter()
            .filter(|name| !reserved(name))
            .cloned()
            .collect();
        Ok(Self {
            date_column: date.map(str::to_string),
            group_column: group.map(str::to_string),
            candidate_targets,
            candidate_features,
            ..self
        })
    }
}

/// Proposes date, group and candidate columns for a raw dataset.
#[derive(Debug, Clone, Default)]
pub struct SchemaInference {
    config: SchemaConfig,
}

impl SchemaInference {
    /// Creates an inference pass with the given heuristics.
    #[must_use]
    pub fn new(config: SchemaConfig) -> Self {
        Self { config }
    }

    /// Infers a schema. Never fails: a dataset without numeric columns yields empty candidate sets.
    #[must_use]
    pub fn infer(&self, dataset: &RawDataset) -> Schema {
        let profiles: Vec<ColumnProfile> = dataset
            .columns()
            .map(|name| profile_column(dataset, name))
            .collect();

        let date_column = self.detect_date(&profiles);
        let group_column = match_alias(&profiles, &self.config.group_aliases)
            .filter(|name| Some(name) != date_column.as_ref());

        let candidates: IndexSet<String> = profiles
            .iter()
            .filter(|profile| profile.kind == ColumnKind::Numeric)
            .filter(|profile| profile.missing_ratio <= self.config.max_missing_ratio)
            .filter(|profile| Some(&profile.name) != date_column.as_ref())
            .filter(|profile| Some(&profile.name) != group_column.as_ref())
            .map(|profile| profile.name.clone())
            .collect();

        let quality = self.quality_score(dataset, date_column.is_some());
        Schema {
            date_column,
            group_column,
            candidate_targets: candidates.clone(),
            candidate_features: candidates,
            quality,
            profiles,
        }
    }

    fn detect_date(&self, profiles: &[ColumnProfile]) -> Option<String> {
        if let Some(name) = match_alias(profiles, &self.config.date_aliases) {
            return Some(name);
        }
        let mut best: Option<&ColumnProfile> = None;
        for profile in profiles
            .iter()
            .filter(|profile| profile.kind != ColumnKind::Numeric)
            .filter(|profile| profile.date_parse_ratio > self.config.date_parse_threshold)
        {
            // strict comparison keeps the first column on ties
            if best.map_or(true, |current| profile.date_parse_ratio > current.date_parse_ratio) {
                best = Some(profile);
            }
        }
        best.map(|profile| profile.name.clone())
    }

    fn quality_score(&self, dataset: &RawDataset, has_date: bool) -> f64 {
        if dataset.is_empty() || dataset.width() == 0 {
            return 0.0;
        }
        let cells = (dataset.len() * dataset.width()) as f64;
        let missing = dataset
            .rows()
            .iter()
            .flatten()
            .filter(|cell| cell.is_missing())
            .count() as f64;
        let completeness = 1.0 - missing / cells;
        let uniqueness = 1.0 - duplicate_row_ratio(dataset);
        let date_bonus = if has_date { 1.0 } else { 0.0 };

        let weights = &self.config.quality_weights;
        let total = weights.completeness + weights.uniqueness + weights.date_bonus;
        if total <= 0.0 {
            return 0.0;
        }
        let score = (weights.completeness * completeness
            + weights.uniqueness * uniqueness
            + weights.date_bonus * date_bonus)
            / total;
        score.clamp(0.0, 1.0)
    }
}

fn match_alias(profiles: &[ColumnProfile], aliases: &[String]) -> Option<String> {
    aliases.iter().find_map(|alias| {
        profiles
            .iter()
            .find(|profile| profile.name.eq_ignore_ascii_case(alias))
            .map(|profile| profile.name.clone())
    })
}

fn profile_column(dataset: &RawDataset, name: &str) -> ColumnProfile {
    let cells = dataset.column(name).unwrap_or_default();
    let total = cells.len();
    let present: Vec<&Value> = cells.into_iter().filter(|cell| !cell.is_missing()).collect();
    let kind = if present.is_empty() {
        ColumnKind::Empty
    } else if present.iter().all(|cell| matches!(cell, Value::Number(_))) {
        ColumnKind::Numeric
    } else if present.iter().all(|cell| matches!(cell, Value::Date(_))) {
        ColumnKind::Date
    } else {
        ColumnKind::Text
    };
    let parsed = present
        .iter()
        .filter(|cell| cell.as_datetime().is_some())
        .count();
    ColumnProfile {
        name: name.to_string(),
        kind,
        missing_ratio: ratio(total - present.len(), total),
        date_parse_ratio: ratio(parsed, present.len()),
    }
}

/// Share of rows identical to an earlier row.
pub(crate) fn duplicate_row_ratio(dataset: &RawDataset) -> f64 {
    let mut seen = HashSet::with_capacity(dataset.len());
    let duplicates = dataset
        .rows()
        .iter()
        .filter(|row| {
            let key = serde_json::to_string(row).unwrap_or_default();
            !seen.insert(key)
        })
        .count();
    ratio(duplicates, dataset.len())
}

fn ratio(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dataset(columns: &[&str], rows: Vec<Vec<Value>>) -> RawDataset {
        RawDataset::from_rows(columns.iter().copied(), rows).unwrap()
    }

    #[test]
    fn detects_aliases_and_candidates() {
        let data = dataset(
            &["Date", "site_id", "influent_bod", "flow_m3d", "notes"],
            vec![
                vec!["2024-01-01".into(), "A".into(), 200.0.into(), 1500.0.into(), "ok".into()],
                vec!["2024-01-02".into(), "A".into(), 210.0.into(), 1600.0.into(), "ok".into()],
            ],
        );
        let schema = SchemaInference::default().infer(&data);
        assert_eq!(schema.date_column(), Some("Date"));
        assert_eq!(schema.group_column(), Some("site_id"));
        let targets: Vec<&str> = schema.candidate_targets().iter().map(String::as_str).collect();
        assert_eq!(targets, vec!["influent_bod", "flow_m3d"]);
        assert_eq!(schema.candidate_features(), schema.candidate_targets());
        assert!(schema.quality() > 0.9);
    }

    #[test]
    fn falls_back_to_parse_ratio() {
        let data = dataset(
            &["recorded", "reading"],
            vec![
                vec!["2024-01-01".into(), 1.0.into()],
                vec!["2024-01-02".into(), 2.0.into()],
                vec!["2024-01-03".into(), 3.0.into()],
            ],
        );
        let schema = SchemaInference::default().infer(&data);
        assert_eq!(schema.date_column(), Some("recorded"));
    }

    #[test]
    fn parse_ratio_must_clear_threshold() {
        let data = dataset(
            &["recorded", "reading"],
            vec![
                vec!["2024-01-01".into(), 1.0.into()],
                vec!["garbage".into(), 2.0.into()],
            ],
        );
        let schema = SchemaInference::default().infer(&data);
        assert_eq!(schema.date_column(), None);
    }

    #[test]
    fn group_column_is_never_guessed_from_values() {
        let data = dataset(
            &["plant_name", "reading"],
            vec![vec!["North".into(), 1.0.into()], vec!["South".into(), 2.0.into()]],
        );
        let schema = SchemaInference::default().infer(&data);
        assert_eq!(schema.group_column(), None);
    }

    #[test]
    fn sparse_columns_are_excluded() {
        let data = dataset(
            &["a", "b"],
            vec![
                vec![1.0.into(), Value::Missing],
                vec![2.0.into(), Value::Missing],
                vec![3.0.into(), 5.0.into()],
            ],
        );
        let schema = SchemaInference::default().infer(&data);
        assert!(schema.candidate_targets().contains("a"));
        assert!(!schema.candidate_targets().contains("b"));
    }

    #[test]
    fn no_numeric_columns_is_a_valid_empty_schema() {
        let data = dataset(&["name"], vec![vec!["x".into()], vec!["y".into()]]);
        let schema = SchemaInference::default().infer(&data);
        assert!(schema.is_unusable());
        assert!(schema.candidate_features().is_empty());
        assert!((0.0..=1.0).contains(&schema.quality()));
    }

    #[test]
    fn duplicates_lower_quality() {
        let unique = dataset(&["a"], vec![vec![1.0.into()], vec![2.0.into()]]);
        let repeated = dataset(&["a"], vec![vec![1.0.into()], vec![1.0.into()]]);
        let inference = SchemaInference::default();
        assert!(inference.infer(&repeated).quality() < inference.infer(&unique).quality());
        assert!((duplicate_row_ratio(&repeated) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn override_reserves_columns() {
        let data = dataset(
            &["when", "station_code", "value"],
            vec![vec![1.0.into(), 7.0.into(), 3.0.into()]],
        );
        let schema = SchemaInference::default()
            .infer(&data)
            .with_group_column("station_code")
            .unwrap();
        assert_eq!(schema.group_column(), Some("station_code"));
        assert!(!schema.candidate_features().contains("station_code"));
        assert!(schema.clone().with_date_column("missing").is_err());
    }
}
