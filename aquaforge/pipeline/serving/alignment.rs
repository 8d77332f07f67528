use serde::{Deserialize, Serialize};

use crate::{
    dataset::RawDataset,
    error::{PipelineError, PipelineResult},
    features::{FeatureManifest, FeatureRecipe},
};

/// How the columns of a new dataset lined up with a manifest. Always returned with a reconstruction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlignmentReport {
    /// Number of manifest feature columns.
    pub expected: usize,
    /// Manifest columns that could not be derived and were filled with the residual value.
    pub missing_columns: Vec<String>,
    /// Target, date or group columns of the manifest absent from the new data (`role:column`).
    /// Any entry fails the alignment regardless of tolerance.
    #[serde(default)]
    pub missing_roles: Vec<String>,
    /// Numeric input columns the manifest does not use. Never passed to a model.
    pub extra_columns: Vec<String>,
    /// `missing_columns.len() / expected`.
    pub mismatch_ratio: f64,
    /// Cells of present columns imputed because their history was missing.
    pub imputed_cells: usize,
}

impl AlignmentReport {
    /// True when every manifest column and role was found in the new data.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.missing_columns.is_empty() && self.missing_roles.is_empty()
    }

    /// Fails closed with `FeatureMismatch` when a role is missing or the ratio exceeds `tolerance`.
    pub fn check(&self, tolerance: f64) -> PipelineResult<()> {
        if !self.missing_roles.is_empty() || self.mismatch_ratio > tolerance {
            return Err(PipelineError::FeatureMismatch {
                missing: self.missing_columns.clone(),
                roles: self.missing_roles.clone(),
                expected: self.expected,
                ratio: self.mismatch_ratio,
                tolerance,
            });
        }
        Ok(())
    }
}

/// Manifest roles whose column the dataset lacks. Without the group column the
/// groups would merge into one series; without the target nothing can be extended.
pub(crate) fn missing_roles(manifest: &FeatureManifest, dataset: &RawDataset) -> Vec<String> {
    [
        ("target", Some(manifest.target())),
        ("date", manifest.date_column()),
        ("group", manifest.group_column()),
    ]
    .into_iter()
    .filter_map(|(role, column)| column.map(|column| (role, column)))
    .filter(|(_, column)| !dataset.has_column(column))
    .map(|(role, column)| format!("{role}:{column}"))
    .collect()
}

/// Compares the dataset's columns with the manifest plan.
/// Returns the report and, per plan column, whether it is absent.
pub(crate) fn assess(manifest: &FeatureManifest, dataset: &RawDataset) -> (AlignmentReport, Vec<bool>) {
    let has_date = manifest
        .date_column()
        .map_or(false, |column| dataset.has_column(column));
    let target = manifest.target();
    let plan = manifest.plan();

    let absent: Vec<bool> = plan
        .iter()
        .map(|column| match &column.recipe {
            FeatureRecipe::Calendar { .. } => !has_date,
            recipe => recipe
                .source()
                .map_or(true, |source| !dataset.has_column(source)),
        })
        .collect();
    let missing_columns: Vec<String> = plan
        .iter()
        .zip(&absent)
        .filter(|(_, absent)| **absent)
        .map(|(column, _)| column.name.clone())
        .collect();

    let used = manifest.input_columns();
    let extra_columns = dataset
        .columns()
        .filter(|column| {
            *column != target
                && Some(*column) != manifest.date_column()
                && Some(*column) != manifest.group_column()
                && !used.iter().any(|known| known == column)
                && dataset.is_numeric_column(column)
        })
        .map(str::to_string)
        .collect();

    let expected = plan.len();
    #[allow(clippy::cast_precision_loss)]
    let mismatch_ratio = if expected == 0 {
        0.0
    } else {
        missing_columns.len() as f64 / expected as f64
    };
    (
        AlignmentReport {
            expected,
            missing_columns,
            missing_roles: missing_roles(manifest, dataset),
            extra_columns,
            mismatch_ratio,
            imputed_cells: 0,
        },
        absent,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        features::{FeatureBuilder, FeatureSpec, RollingAggregate},
        schema::SchemaInference,
        synthetic,
    };
    use chrono::NaiveDate;

    fn manifest() -> std::sync::Arc<FeatureManifest> {
        let start = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        let data = synthetic::wastewater_sample(1, 60, start, 11);
        let schema = SchemaInference::default().infer(&data);
        let spec = FeatureSpec::empty()
            .with_sources(["effluent_bod", "temperature_c"])
            .with_lags([1])
            .with_rolling([7], [RollingAggregate::Mean])
            .with_base_columns(["flow_m3d"]);
        FeatureBuilder::default()
            .build(&data, &schema, &spec, "effluent_bod")
            .unwrap()
            .1
    }

    #[test]
    fn missing_source_marks_its_derived_columns() {
        let manifest = manifest();
        let start = NaiveDate::from_ymd_opt(2024, 6, 1).unwrap();
        let data = synthetic::wastewater_sample(1, 20, start, 5).without_columns(&["temperature_c"]);
        let (report, absent) = assess(&manifest, &data);
        assert_eq!(report.expected, manifest.feature_columns().len());
        assert_eq!(
            report.missing_columns,
            vec!["temperature_c_lag_1", "temperature_c_rolling_mean_7"]
        );
        assert_eq!(absent.iter().filter(|flag| **flag).count(), 2);
        assert!(report.extra_columns.contains(&"influent_bod".to_string()));
        assert!(!report.extra_columns.contains(&"flow_m3d".to_string()));
        assert!(report.check(0.5).is_ok());
        assert!(matches!(
            report.check(0.1),
            Err(PipelineError::FeatureMismatch { expected, .. }) if expected == report.expected
        ));
    }

    #[test]
    fn missing_target_fails_regardless_of_tolerance() {
        let manifest = manifest();
        let start = NaiveDate::from_ymd_opt(2024, 6, 1).unwrap();
        let data = synthetic::wastewater_sample(1, 20, start, 5).without_columns(&["effluent_bod"]);
        let (report, _) = assess(&manifest, &data);
        assert_eq!(report.missing_roles, vec!["target:effluent_bod"]);
        assert_eq!(
            report.missing_columns,
            vec!["effluent_bod_lag_1", "effluent_bod_rolling_mean_7"]
        );
        let err = report.check(1.0).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::FeatureMismatch { ref roles, .. } if roles == &vec!["target:effluent_bod".to_string()]
        ));
    }

    #[test]
    fn missing_group_column_is_a_missing_role() {
        let start = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        let data = synthetic::wastewater_sample(2, 60, start, 11);
        let schema = SchemaInference::default().infer(&data);
        let spec = FeatureSpec::empty().with_lags([1]).with_base_columns(["flow_m3d"]);
        let (_, manifest) = FeatureBuilder::default()
            .build(&data, &schema, &spec, "effluent_bod")
            .unwrap();
        let (report, absent) = assess(&manifest, &data.without_columns(&["site_id"]));
        assert!(report.missing_columns.is_empty());
        assert!(absent.iter().all(|flag| !flag));
        assert_eq!(report.missing_roles, vec!["group:site_id"]);
        assert!(!report.is_complete());
        assert!(report.check(1.0).is_err());
    }

    #[test]
    fn identical_columns_align_completely() {
        let manifest = manifest();
        let start = NaiveDate::from_ymd_opt(2024, 6, 1).unwrap();
        let data = synthetic::wastewater_sample(1, 20, start, 5);
        let (report, absent) = assess(&manifest, &data);
        assert!(report.is_complete());
        assert!(absent.iter().all(|flag| !flag));
        assert!(report.mismatch_ratio.abs() < f64::EPSILON);
    }
}
