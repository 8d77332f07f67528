//! Feature manifest builder: raw rows in, (matrix, manifest) out.

/// Row-level derivation engine.
pub mod derive;
/// Manifest record.
pub mod manifest;
/// Feature matrix container.
pub mod matrix;
/// Derivation configuration.
pub mod spec;

use std::sync::Arc;

pub use manifest::FeatureManifest;
pub use matrix::{FeatureMatrix, RowKey};
pub use spec::{CalendarFeature, FeatureColumn, FeatureRecipe, FeatureSpec, FillPolicy, RollingAggregate};

use indexmap::IndexSet;

use crate::{
    config::FeatureConfig,
    dataset::RawDataset,
    error::{PipelineError, PipelineResult},
    schema::Schema,
};
use derive::Layout;
use manifest::ManifestParts;

/// Deterministic transformer from raw rows to a feature matrix.
#[derive(Debug, Clone)]
pub struct FeatureBuilder {
    min_rows: usize,
}

impl Default for FeatureBuilder {
    fn default() -> Self {
        Self::new(&FeatureConfig::default())
    }
}

impl FeatureBuilder {
    /// Creates a builder from the feature section of the config.
    #[must_use]
    pub fn new(config: &FeatureConfig) -> Self {
        Self {
            min_rows: config.min_rows,
        }
    }

    /// Overrides the minimum matrix size.
    #[must_use]
    pub const fn with_min_rows(mut self, min_rows: usize) -> Self {
        self.min_rows = min_rows;
        self
    }

    /// Builds the training matrix and its manifest. Pure: equal inputs give equal outputs.
    pub fn build(
        &self,
        dataset: &RawDataset,
        schema: &Schema,
        spec: &FeatureSpec,
        target: &str,
    ) -> PipelineResult<(FeatureMatrix, Arc<FeatureManifest>)> {
        spec.validate()?;
        if !dataset.has_column(target) {
            return Err(PipelineError::UnknownColumn(target.to_string()));
        }
        if !schema.candidate_targets().contains(target) {
            return Err(PipelineError::SchemaAmbiguous(format!(
                "{target} is not a numeric target candidate"
            )));
        }

        let base = base_columns(schema, spec, target)?;
        let resolved = spec.resolve(target, &base);
        for source in &resolved.sources {
            if !dataset.has_column(source) {
                return Err(PipelineError::UnknownColumn(source.clone()));
            }
        }

        let date_column = schema.date_column();
        let plan = resolved.plan(target, date_column.is_some());
        check_plan(&plan, target)?;

        let layout = Layout {
            target,
            date_column,
            group_column: schema.group_column(),
        };
        let inputs: Vec<&str> = plan
            .iter()
            .filter_map(|column| column.recipe.source())
            .collect();
        let groups = derive::partition(dataset, layout, &inputs, false)?;
        let warmup = derive::warmup(&plan);
        let absent = vec![false; plan.len()];
        let fill = resolved.fill.value();

        let mut rows = Vec::new();
        let mut imputed = 0;
        for group in &groups {
            let (group_rows, filled) = group.history_rows(&plan, &absent, warmup, fill);
            imputed += filled;
            rows.extend(group_rows);
        }
        if rows.len() < self.min_rows.max(1) {
            return Err(PipelineError::InsufficientData {
                required: self.min_rows.max(1),
                actual: rows.len(),
            });
        }
        derive::order_rows(&mut rows);

        let columns = plan.into_iter().map(|column| column.name).collect();
        let matrix = FeatureMatrix::from_rows(columns, rows);
        let manifest = FeatureManifest::new(ManifestParts {
            spec: resolved,
            target: target.to_string(),
            date_column: date_column.map(str::to_string),
            group_column: schema.group_column().map(str::to_string),
            imputed_cells: imputed,
            warmup_rows: warmup,
            date_step_seconds: derive::median_step(&groups),
            training_data_fingerprint: dataset.fingerprint(),
            training_rows: matrix.rows(),
        });
        Ok((matrix, Arc::new(manifest)))
    }
}

fn check_plan(plan: &[FeatureColumn], target: &str) -> PipelineResult<()> {
    let mut names = IndexSet::with_capacity(plan.len());
    for column in plan {
        if column.name == target {
            return Err(PipelineError::TargetLeakage(target.to_string()));
        }
        if !names.insert(column.name.as_str()) {
            return Err(PipelineError::InvalidSpec(format!(
                "derived column {} collides with another column",
                column.name
            )));
        }
    }
    Ok(())
}

fn base_columns(schema: &Schema, spec: &FeatureSpec, target: &str) -> PipelineResult<Vec<String>> {
    match &spec.base_columns {
        Some(explicit) => {
            if explicit.iter().any(|column| column == target) {
                return Err(PipelineError::TargetLeakage(target.to_string()));
            }
            for column in explicit {
                if !schema.candidate_features().contains(column) {
                    return Err(PipelineError::UnknownColumn(column.clone()));
                }
            }
            Ok(schema
                .candidate_features()
                .iter()
                .filter(|column| explicit.contains(column))
                .cloned()
                .collect())
        }
        None => Ok(schema
            .candidate_features()
            .iter()
            .filter(|column| *column != target)
            .cloned()
            .collect()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{dataset::Value, schema::SchemaInference};
    use chrono::{Duration, NaiveDate};

    fn daily(rows: usize) -> RawDataset {
        let start = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let data = (0..rows)
            .map(|idx| {
                let day = start + Duration::days(idx as i64);
                vec![
                    Value::from(day),
                    Value::from(10.0 + idx as f64),
                    Value::from(2.0 * idx as f64),
                ]
            })
            .collect();
        RawDataset::from_rows(["date", "bod", "flow"], data).unwrap()
    }

    #[test]
    fn builds_lags_and_drops_warmup() {
        let data = daily(20);
        let schema = SchemaInference::default().infer(&data);
        let spec = FeatureSpec::empty().with_lags([1, 3]);
        let (matrix, manifest) = FeatureBuilder::default()
            .with_min_rows(5)
            .build(&data, &schema, &spec, "bod")
            .unwrap();
        assert_eq!(manifest.feature_columns(), ["flow", "bod_lag_1", "bod_lag_3"]);
        assert_eq!(matrix.rows(), 17);
        assert_eq!(matrix.target()[0], 13.0);
        assert_eq!(matrix.column("bod_lag_3").unwrap()[0], 10.0);
        assert_eq!(manifest.warmup_rows(), 3);
        assert_eq!(manifest.date_step_seconds(), Some(86_400));
    }

    #[test]
    fn explicit_target_feature_is_rejected() {
        let data = daily(20);
        let schema = SchemaInference::default().infer(&data);
        let spec = FeatureSpec::empty().with_base_columns(["bod"]);
        let err = FeatureBuilder::default()
            .build(&data, &schema, &spec, "bod")
            .unwrap_err();
        assert!(matches!(err, PipelineError::TargetLeakage(_)));
    }

    #[test]
    fn explicit_base_columns_follow_schema_order() {
        let data = crate::synthetic::wastewater_sample(1, 40, NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(), 3);
        let schema = SchemaInference::default().infer(&data);
        let spec = FeatureSpec::empty()
            .with_lags([1])
            .with_base_columns(["temperature_c", "flow_m3d", "influent_bod", "flow_m3d"]);
        let (matrix, manifest) = FeatureBuilder::default()
            .build(&data, &schema, &spec, "effluent_bod")
            .unwrap();
        assert_eq!(manifest.base_columns(), ["influent_bod", "flow_m3d", "temperature_c"]);
        assert_eq!(
            &matrix.columns()[..3],
            ["influent_bod", "flow_m3d", "temperature_c"]
        );
    }

    #[test]
    fn too_few_rows_is_an_error() {
        let data = daily(10);
        let schema = SchemaInference::default().infer(&data);
        let err = FeatureBuilder::default()
            .build(&data, &schema, &FeatureSpec::empty().with_lags([7]), "bod")
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::InsufficientData {
                required: 30,
                actual: 3
            }
        ));
    }

    #[test]
    fn unknown_source_is_rejected() {
        let data = daily(40);
        let schema = SchemaInference::default().infer(&data);
        let spec = FeatureSpec::empty().with_sources(["nitrate"]).with_lags([1]);
        assert!(matches!(
            FeatureBuilder::default().build(&data, &schema, &spec, "bod"),
            Err(PipelineError::UnknownColumn(name)) if name == "nitrate"
        ));
    }
}
