//! Model registry: the only writer of trained models and their manifests.

/// Storage backends.
pub mod store;

use std::{fmt, path::PathBuf, sync::Arc};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

pub use store::{FsStore, MemoryStore, RegistryStore};

use crate::{
    error::{PipelineError, PipelineResult},
    models::ModelKind,
    training::{Metrics, ModelId, TrainedModel},
};

/// Stored document: model, manifest and metrics travel together.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryEntry {
    /// Entry id (equals the model id).
    pub id: ModelId,
    /// Kind header, checked against the embedded model on load.
    pub kind: ModelKind,
    /// Save time.
    pub saved_at: DateTime<Utc>,
    /// Digest of the embedded manifest at save time.
    pub manifest_digest: String,
    /// The model with its manifest and metrics.
    pub model: TrainedModel,
}

/// Caller-facing listing row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSummary {
    /// Model id.
    pub id: ModelId,
    /// Model kind.
    pub kind: ModelKind,
    /// Target column.
    pub target: String,
    /// Number of manifest feature columns.
    pub feature_count: usize,
    /// Holdout metrics.
    pub metrics: Metrics,
    /// Training time.
    pub trained_at: DateTime<Utc>,
    /// Save time.
    pub saved_at: DateTime<Utc>,
}

/// Registry over a storage backend. Reads run concurrently; writes are exclusive.
#[derive(Clone)]
pub struct ModelRegistry {
    store: Arc<dyn RegistryStore>,
    lock: Arc<RwLock<()>>,
}

impl fmt::Debug for ModelRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelRegistry").finish_non_exhaustive()
    }
}

impl ModelRegistry {
    /// Wraps a storage backend.
    #[must_use]
    pub fn new(store: Arc<dyn RegistryStore>) -> Self {
        Self {
            store,
            lock: Arc::new(RwLock::new(())),
        }
    }

    /// Registry kept in process memory.
    #[must_use]
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()))
    }

    /// Registry persisted under a directory.
    pub fn open(root: impl Into<PathBuf>) -> PipelineResult<Self> {
        Ok(Self::new(Arc::new(FsStore::open(root)?)))
    }

    /// Saves a model, replacing any entry with the same id as a whole.
    pub fn save(&self, model: &TrainedModel) -> PipelineResult<ModelId> {
        let id = model.id().clone();
        model
            .manifest()
            .verify()
            .map_err(|reason| PipelineError::RegistryCorrupt {
                id: id.to_string(),
                reason,
            })?;
        let entry = RegistryEntry {
            id: id.clone(),
            kind: model.kind(),
            saved_at: Utc::now(),
            manifest_digest: model.manifest().digest(),
            model: model.clone(),
        };
        let document = serde_json::to_vec_pretty(&entry)?;
        let _guard = self.lock.write();
        self.store.put(id.as_str(), &document)?;
        Ok(id)
    }

    /// Loads and verifies an entry.
    pub fn load(&self, id: &str) -> PipelineResult<TrainedModel> {
        Ok(self.load_entry(id, None)?.model)
    }

    /// Loads an entry only if it holds the requested kind.
    pub fn load_kind(&self, id: &str, kind: ModelKind) -> PipelineResult<TrainedModel> {
        Ok(self.load_entry(id, Some(kind))?.model)
    }

    /// Summaries of every entry, newest save first.
    pub fn list(&self) -> PipelineResult<Vec<ModelSummary>> {
        let ids = {
            let _guard = self.lock.read();
            self.store.ids()?
        };
        let mut summaries = Vec::with_capacity(ids.len());
        for id in ids {
            match self.load_entry(&id, None) {
                Ok(entry) => summaries.push(summarize(&entry)),
                // deleted between listing and reading
                Err(PipelineError::RegistryNotFound { .. }) => {}
                Err(err) => return Err(err),
            }
        }
        summaries.sort_by(|a, b| b.saved_at.cmp(&a.saved_at).then(a.id.cmp(&b.id)));
        Ok(summaries)
    }

    /// Deletes an entry.
    pub fn delete(&self, id: &str) -> PipelineResult<()> {
        let _guard = self.lock.write();
        if self.store.remove(id)? {
            Ok(())
        } else {
            Err(PipelineError::RegistryNotFound {
                id: id.to_string(),
                kind: None,
            })
        }
    }

    fn load_entry(&self, id: &str, kind: Option<ModelKind>) -> PipelineResult<RegistryEntry> {
        let document = {
            let _guard = self.lock.read();
            self.store.get(id)?
        };
        let document = document.ok_or_else(|| PipelineError::RegistryNotFound {
            id: id.to_string(),
            kind,
        })?;
        let entry: RegistryEntry =
            serde_json::from_slice(&document).map_err(|err| PipelineError::RegistryCorrupt {
                id: id.to_string(),
                reason: format!("undecodable entry: {err}"),
            })?;
        verify_entry(id, &entry)?;
        if let Some(requested) = kind {
            if entry.kind != requested {
                return Err(PipelineError::RegistryNotFound {
                    id: id.to_string(),
                    kind: Some(requested),
                });
            }
        }
        Ok(entry)
    }
}

fn verify_entry(id: &str, entry: &RegistryEntry) -> PipelineResult<()> {
    let corrupt = |reason: String| PipelineError::RegistryCorrupt {
        id: id.to_string(),
        reason,
    };
    if entry.id.as_str() != id || entry.model.id() != &entry.id {
        return Err(corrupt("entry id does not match its model".into()));
    }
    if entry.kind != entry.model.kind() {
        return Err(corrupt(format!(
            "kind header {} does not match model kind {}",
            entry.kind,
            entry.model.kind()
        )));
    }
    if entry.model.manifest().digest() != entry.manifest_digest {
        return Err(corrupt("manifest digest mismatch".into()));
    }
    entry.model.manifest().verify().map_err(corrupt)
}

fn summarize(entry: &RegistryEntry) -> ModelSummary {
    let manifest = entry.model.manifest();
    ModelSummary {
        id: entry.id.clone(),
        kind: entry.kind,
        target: manifest.target().to_string(),
        feature_count: manifest.feature_columns().len(),
        metrics: entry.model.metrics().clone(),
        trained_at: entry.model.trained_at(),
        saved_at: entry.saved_at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{ModelConfig, TrainingConfig},
        features::{FeatureBuilder, FeatureSpec},
        models::ProviderSet,
        schema::SchemaInference,
        synthetic,
        training::Trainer,
    };
    use chrono::NaiveDate;
    use tempfile::tempdir;

    fn trained() -> Vec<TrainedModel> {
        let start = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let data = synthetic::wastewater_sample(1, 90, start, 3);
        let schema = SchemaInference::default().infer(&data);
        let spec = FeatureSpec::empty().with_lags([1]);
        let (matrix, manifest) = FeatureBuilder::default()
            .build(&data, &schema, &spec, "effluent_cod")
            .unwrap();
        Trainer::new(
            TrainingConfig::default(),
            ProviderSet::builtin(&ModelConfig::default()),
        )
        .train(&matrix, &manifest, &[ModelKind::Ridge, ModelKind::SeasonalNaive])
        .models
    }

    #[test]
    fn save_load_list_delete() {
        let dir = tempdir().unwrap();
        let registry = ModelRegistry::open(dir.path()).unwrap();
        let models = trained();
        for model in &models {
            registry.save(model).unwrap();
        }
        let loaded = registry.load(models[0].id().as_str()).unwrap();
        assert_eq!(&loaded, &models[0]);
        assert_eq!(loaded.manifest().feature_columns(), models[0].manifest().feature_columns());

        let summaries = registry.list().unwrap();
        assert_eq!(summaries.len(), 2);
        assert!(summaries[0].saved_at >= summaries[1].saved_at);
        assert_eq!(summaries[0].target, "effluent_cod");

        registry.delete(models[1].id().as_str()).unwrap();
        assert!(matches!(
            registry.load(models[1].id().as_str()),
            Err(PipelineError::RegistryNotFound { .. })
        ));
        assert!(registry.delete(models[1].id().as_str()).is_err());
    }

    #[test]
    fn kind_mismatch_is_not_found() {
        let registry = ModelRegistry::in_memory();
        let models = trained();
        let id = registry.save(&models[0]).unwrap();
        let err = registry
            .load_kind(id.as_str(), ModelKind::GradientBoosting)
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::RegistryNotFound {
                kind: Some(ModelKind::GradientBoosting),
                ..
            }
        ));
        assert!(registry.load_kind(id.as_str(), ModelKind::Ridge).is_ok());
    }

    #[test]
    fn tampered_manifest_is_corrupt() {
        let store = Arc::new(MemoryStore::new());
        let registry = ModelRegistry::new(store.clone());
        let models = trained();
        let id = registry.save(&models[0]).unwrap();

        let raw = store.get(id.as_str()).unwrap().unwrap();
        let mut value: serde_json::Value = serde_json::from_slice(&raw).unwrap();
        value["model"]["manifest"]["feature_columns"][0] = serde_json::json!("renamed");
        store
            .put(id.as_str(), &serde_json::to_vec(&value).unwrap())
            .unwrap();
        assert!(matches!(
            registry.load(id.as_str()),
            Err(PipelineError::RegistryCorrupt { .. })
        ));

        store.put(id.as_str(), b"not json").unwrap();
        assert!(matches!(
            registry.load(id.as_str()),
            Err(PipelineError::RegistryCorrupt { .. })
        ));
    }
}
