use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::spec::{FeatureColumn, FeatureSpec};

/// Format version of serialized manifests.
pub const MANIFEST_VERSION: u32 = 1;

/// Immutable record of how a training matrix was produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureManifest {
    version: u32,
    feature_columns: Vec<String>,
    spec: FeatureSpec,
    target: String,
    date_column: Option<String>,
    group_column: Option<String>,
    residual_fill: f64,
    imputed_cells: usize,
    warmup_rows: usize,
    date_step_seconds: Option<i64>,
    training_data_fingerprint: String,
    training_rows: usize,
}

/// Fields describing one build, in the order the builder knows them.
#[derive(Debug, Clone)]
pub(crate) struct ManifestParts {
    pub spec: FeatureSpec,
    pub target: String,
    pub date_column: Option<String>,
    pub group_column: Option<String>,
    pub imputed_cells: usize,
    pub warmup_rows: usize,
    pub date_step_seconds: Option<i64>,
    pub training_data_fingerprint: String,
    pub training_rows: usize,
}

impl FeatureManifest {
    pub(crate) fn new(parts: ManifestParts) -> Self {
        let feature_columns = parts
            .spec
            .plan(&parts.target, parts.date_column.is_some())
            .into_iter()
            .map(|column| column.name)
            .collect();
        Self {
            version: MANIFEST_VERSION,
            feature_columns,
            spec: parts.spec,
            target: parts.target,
            date_column: parts.date_column,
            group_column: parts.group_column,
            residual_fill: 0.0,
            imputed_cells: parts.imputed_cells,
            warmup_rows: parts.warmup_rows,
            date_step_seconds: parts.date_step_seconds,
            training_data_fingerprint: parts.training_data_fingerprint,
            training_rows: parts.training_rows,
        }
    }

    /// Format version.
    #[must_use]
    pub const fn version(&self) -> u32 {
        self.version
    }

    /// Ordered feature column names.
    #[must_use]
    pub fn feature_columns(&self) -> &[String] {
        &self.feature_columns
    }

    /// Resolved spec used for derivation.
    #[must_use]
    pub const fn spec(&self) -> &FeatureSpec {
        &self.spec
    }

    /// Target column.
    #[must_use]
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Date column used during training.
    #[must_use]
    pub fn date_column(&self) -> Option<&str> {
        self.date_column.as_deref()
    }

    /// Group column used during training.
    #[must_use]
    pub fn group_column(&self) -> Option<&str> {
        self.group_column.as_deref()
    }

    /// Base columns copied from the current row.
    #[must_use]
    pub fn base_columns(&self) -> &[String] {
        self.spec.base_columns.as_deref().unwrap_or_default()
    }

    /// Value written into cells still missing after derivation.
    #[must_use]
    pub const fn residual_fill(&self) -> f64 {
        self.residual_fill
    }

    /// Cells imputed with the residual fill while building the training matrix.
    #[must_use]
    pub const fn imputed_cells(&self) -> usize {
        self.imputed_cells
    }

    /// Leading rows dropped per group.
    #[must_use]
    pub const fn warmup_rows(&self) -> usize {
        self.warmup_rows
    }

    /// Median spacing of training dates, in seconds.
    #[must_use]
    pub const fn date_step_seconds(&self) -> Option<i64> {
        self.date_step_seconds
    }

    /// Fingerprint of the raw training data.
    #[must_use]
    pub fn training_data_fingerprint(&self) -> &str {
        &self.training_data_fingerprint
    }

    /// Rows of the training matrix.
    #[must_use]
    pub const fn training_rows(&self) -> usize {
        self.training_rows
    }

    /// Output columns with their recipes, recomputed from the stored spec.
    #[must_use]
    pub fn plan(&self) -> Vec<FeatureColumn> {
        self.spec.plan(&self.target, self.date_column.is_some())
    }

    /// Raw columns any recipe reads (sources and base columns), target excluded.
    #[must_use]
    pub fn input_columns(&self) -> Vec<String> {
        let mut inputs: Vec<String> = Vec::new();
        for column in self.plan() {
            if let Some(source) = column.recipe.source() {
                if source != self.target && !inputs.iter().any(|known| known == source) {
                    inputs.push(source.to_string());
                }
            }
        }
        inputs
    }

    /// Checks that the stored column list is exactly what the stored spec yields
    /// and that the target is not among the features.
    pub fn verify(&self) -> Result<(), String> {
        if self.version != MANIFEST_VERSION {
            return Err(format!("unsupported manifest version {}", self.version));
        }
        let planned: Vec<String> = self.plan().into_iter().map(|column| column.name).collect();
        if planned != self.feature_columns {
            return Err("feature columns do not match the stored feature spec".into());
        }
        if self.feature_columns.iter().any(|name| name == &self.target) {
            return Err(format!("target {} listed as a feature", self.target));
        }
        Ok(())
    }

    /// Content digest (`sha256:<hex>`) over the canonical JSON form.
    #[must_use]
    pub fn digest(&self) -> String {
        let encoded = serde_json::to_vec(self).unwrap_or_default();
        format!("sha256:{:x}", Sha256::digest(&encoded))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::spec::RollingAggregate;

    fn manifest() -> FeatureManifest {
        let spec = FeatureSpec::empty()
            .with_sources(["temperature_c", "bod"])
            .with_lags([1])
            .with_rolling([3], [RollingAggregate::Mean])
            .resolve("bod", &["flow".to_string()]);
        FeatureManifest::new(ManifestParts {
            spec,
            target: "bod".into(),
            date_column: Some("date".into()),
            group_column: None,
            imputed_cells: 0,
            warmup_rows: 3,
            date_step_seconds: Some(86_400),
            training_data_fingerprint: "sha256:00".into(),
            training_rows: 40,
        })
    }

    #[test]
    fn columns_follow_the_stored_spec() {
        let manifest = manifest();
        assert_eq!(
            manifest.feature_columns(),
            [
                "flow",
                "temperature_c_lag_1",
                "bod_lag_1",
                "temperature_c_rolling_mean_3",
                "bod_rolling_mean_3"
            ]
        );
        assert_eq!(manifest.input_columns(), vec!["flow", "temperature_c"]);
        manifest.verify().unwrap();
    }

    #[test]
    fn tampering_is_detected() {
        let manifest = manifest();
        let mut tampered = manifest.clone();
        tampered.feature_columns.swap(0, 1);
        assert!(tampered.verify().is_err());
        assert_ne!(tampered.digest(), manifest.digest());
        assert_eq!(manifest.digest(), manifest.clone().digest());
    }
}
