use std::{sync::Arc, thread};

use aquaforge_pipeline::{
    anomaly::{self, AnomalyMethod},
    config::{ModelConfig, TrainingConfig},
    features::{FeatureRecipe, RollingAggregate},
    models::FittedState,
    synthetic, FeatureBuilder, FeatureSpec, ModelKind, ModelProvider, ModelRegistry, PipelineConfig,
    PipelineError, ProviderError, ProviderSet, RawDataset, Reconciler, SchemaInference, Trainer, Value,
};
use chrono::NaiveDate;
use ndarray::{ArrayView1, ArrayView2};
use tempfile::tempdir;

fn start() -> NaiveDate {
    NaiveDate::from_ymd_opt(2023, 1, 1).unwrap()
}

fn exogenous_spec() -> FeatureSpec {
    FeatureSpec::default()
        .with_sources(["effluent_bod", "temperature_c"])
        .with_lags([1, 7])
        .with_rolling([7], [RollingAggregate::Mean, RollingAggregate::Std])
        .with_base_columns(["flow_m3d", "influent_bod"])
}

#[test]
fn builder_is_deterministic() {
    let data = synthetic::wastewater_sample(3, 120, start(), 42);
    let schema = SchemaInference::default().infer(&data);
    let builder = FeatureBuilder::default();
    let (first, first_manifest) = builder.build(&data, &schema, &exogenous_spec(), "effluent_bod").unwrap();
    let (second, second_manifest) = builder.build(&data, &schema, &exogenous_spec(), "effluent_bod").unwrap();
    assert_eq!(first.columns(), second.columns());
    assert_eq!(first, second);
    assert_eq!(first_manifest, second_manifest);
    assert_eq!(first_manifest.digest(), second_manifest.digest());
    assert_eq!(
        serde_json::to_vec(&first).unwrap(),
        serde_json::to_vec(&second).unwrap()
    );
}

#[test]
fn saved_model_reproduces_its_training_matrix() {
    let data = synthetic::wastewater_sample(2, 150, start(), 9);
    let schema = SchemaInference::default().infer(&data);
    let (matrix, manifest) = FeatureBuilder::default()
        .build(&data, &schema, &exogenous_spec(), "effluent_bod")
        .unwrap();
    let batch = Trainer::new(TrainingConfig::default(), ProviderSet::builtin(&ModelConfig::default()))
        .train(&matrix, &manifest, &ModelKind::ALL);
    assert!(batch.failures.is_empty(), "{:?}", batch.failures);

    let dir = tempdir().unwrap();
    let registry = ModelRegistry::open(dir.path()).unwrap();
    let reconciler = Reconciler::new(Default::default(), ProviderSet::builtin(&ModelConfig::default()));
    for model in &batch.models {
        let id = registry.save(model).unwrap();
        let loaded = ModelRegistry::open(dir.path()).unwrap().load(id.as_str()).unwrap();
        assert_eq!(loaded.manifest().as_ref(), manifest.as_ref());
        let aligned = reconciler.reconstruct(loaded.manifest(), &data).unwrap();
        assert!(aligned.report.is_complete());
        assert_eq!(aligned.matrix, matrix);
    }
}

#[test]
fn target_never_becomes_a_feature() {
    let data = synthetic::wastewater_sample(1, 90, start(), 1);
    let schema = SchemaInference::default().infer(&data);
    let builder = FeatureBuilder::default();
    let specs = [
        FeatureSpec::default(),
        FeatureSpec::empty(),
        FeatureSpec::empty().with_lags([1, 2, 3]),
        exogenous_spec(),
    ];
    for target in schema.candidate_targets() {
        for spec in &specs {
            let spec = if spec.base_columns.as_ref().map_or(false, |base| base.contains(target)) {
                spec.clone().with_base_columns(Vec::<String>::new())
            } else {
                spec.clone()
            };
            match builder.build(&data, &schema, &spec, target) {
                Ok((matrix, manifest)) => {
                    assert!(!manifest.feature_columns().contains(target));
                    assert!(!matrix.columns().contains(target));
                }
                Err(err) => assert!(
                    matches!(err, PipelineError::UnknownColumn(_) | PipelineError::InsufficientData { .. }),
                    "{target}: {err}"
                ),
            }
        }
    }
    let leaking = FeatureSpec::empty().with_base_columns(["effluent_bod"]);
    assert!(matches!(
        builder.build(&data, &schema, &leaking, "effluent_bod"),
        Err(PipelineError::TargetLeakage(_))
    ));
}

struct Failing(ModelKind);

impl ModelProvider for Failing {
    fn kind(&self) -> ModelKind {
        self.0
    }

    fn fit(&self, _features: ArrayView2<'_, f64>, _target: ArrayView1<'_, f64>) -> Result<FittedState, ProviderError> {
        Err(ProviderError::Numerical("engineered failure".into()))
    }

    fn fit_series(&self, _series: &[f64]) -> Result<FittedState, ProviderError> {
        Err(ProviderError::Numerical("engineered failure".into()))
    }
}

#[test]
fn failing_kinds_do_not_sink_the_batch() {
    let data = synthetic::wastewater_sample(1, 100, start(), 2);
    let schema = SchemaInference::default().infer(&data);
    let (matrix, manifest) = FeatureBuilder::default()
        .build(&data, &schema, &FeatureSpec::empty().with_lags([1, 7]), "effluent_cod")
        .unwrap();
    let mut providers = ProviderSet::builtin(&ModelConfig::default());
    providers.register(Arc::new(Failing(ModelKind::SeasonalNaive)));
    providers.register(Arc::new(Failing(ModelKind::GradientBoosting)));
    let batch = Trainer::new(TrainingConfig::default(), providers).train(&matrix, &manifest, &ModelKind::ALL);
    assert_eq!(batch.models.len(), 1);
    assert_eq!(batch.failures.len(), 2);
    assert_eq!(batch.models[0].kind(), ModelKind::Ridge);
    assert!(batch
        .failures
        .iter()
        .all(|failure| failure.reason.contains("engineered failure")));
}

#[test]
fn aligned_matrix_follows_manifest_order() {
    let data = synthetic::wastewater_sample(1, 120, start(), 3);
    let schema = SchemaInference::default().infer(&data);
    let (_, manifest) = FeatureBuilder::default()
        .build(&data, &schema, &exogenous_spec(), "effluent_bod")
        .unwrap();

    // reversed column order, an extra column and no flow column
    let fresh = synthetic::wastewater_sample(1, 40, NaiveDate::from_ymd_opt(2023, 6, 1).unwrap(), 4);
    let mut columns: Vec<String> = fresh.columns().map(str::to_string).collect();
    columns.reverse();
    columns.retain(|column| column != "flow_m3d");
    columns.push("turbidity".into());
    let rows = (0..fresh.len())
        .map(|idx| {
            let record = fresh.record(idx).unwrap();
            columns
                .iter()
                .map(|column| {
                    record
                        .get(column.as_str())
                        .map_or(Value::Number(1.0), |value| (*value).clone())
                })
                .collect()
        })
        .collect();
    let shuffled = RawDataset::from_rows(columns, rows).unwrap();

    let aligned = Reconciler::new(Default::default(), ProviderSet::builtin(&ModelConfig::default()))
        .reconstruct(&manifest, &shuffled)
        .unwrap();
    assert_eq!(aligned.matrix.columns(), manifest.feature_columns());
    assert_eq!(aligned.matrix.width(), manifest.feature_columns().len());
    assert_eq!(aligned.report.missing_columns, vec!["flow_m3d"]);
    assert!(aligned.report.extra_columns.contains(&"turbidity".to_string()));
    let flow = aligned.matrix.column("flow_m3d").unwrap();
    assert!(flow.iter().all(|value| *value == 0.0));
}

#[test]
fn four_hundred_days_lose_seven_warmup_rows() {
    let data = synthetic::wastewater_sample(1, 400, start(), 77);
    let schema = SchemaInference::default().infer(&data);
    let spec = FeatureSpec::default()
        .with_sources(["influent_bod"])
        .with_lags([1, 7])
        .with_rolling([7], [RollingAggregate::Mean])
        .with_base_columns(Vec::<String>::new());
    let (matrix, manifest) = FeatureBuilder::default()
        .build(&data, &schema, &spec, "effluent_bod")
        .unwrap();

    let plan = manifest.plan();
    let derived = plan
        .iter()
        .filter(|column| matches!(column.recipe, FeatureRecipe::Lag { .. } | FeatureRecipe::Rolling { .. }))
        .count();
    let calendar = plan
        .iter()
        .filter(|column| matches!(column.recipe, FeatureRecipe::Calendar { .. }))
        .count();
    assert_eq!(derived, 3);
    assert_eq!(calendar, 4);
    assert_eq!(manifest.feature_columns().len(), derived + calendar);
    assert_eq!(matrix.rows(), 400 - 7);
    assert_eq!(manifest.warmup_rows(), 7);
}

#[test]
fn missing_rolling_source_is_zero_filled_and_reported() {
    let data = synthetic::wastewater_sample(1, 200, start(), 31);
    let schema = SchemaInference::default().infer(&data);
    let spec = FeatureSpec::default()
        .with_sources(["effluent_bod", "temperature_c"])
        .with_lags([1])
        .with_rolling([7], [RollingAggregate::Mean])
        .with_base_columns(["flow_m3d"]);
    let (matrix, manifest) = FeatureBuilder::default()
        .build(&data, &schema, &spec, "effluent_bod")
        .unwrap();
    let batch = Trainer::new(TrainingConfig::default(), ProviderSet::builtin(&ModelConfig::default()))
        .train(&matrix, &manifest, &[ModelKind::Ridge]);
    let model = &batch.models[0];

    let recent = synthetic::wastewater_sample(1, 60, NaiveDate::from_ymd_opt(2023, 7, 20).unwrap(), 32)
        .without_columns(&["temperature_c"]);
    let series = Reconciler::new(Default::default(), ProviderSet::builtin(&ModelConfig::default()))
        .forecast(model, &recent, 10)
        .unwrap();
    let report = series.alignment.as_ref().unwrap();
    assert_eq!(
        report.missing_columns,
        vec!["temperature_c_lag_1", "temperature_c_rolling_mean_7"]
    );
    assert!(report.mismatch_ratio > 0.0);
    assert!((report.mismatch_ratio - 2.0 / manifest.feature_columns().len() as f64).abs() < 1e-12);
    assert_eq!(series.points.len(), 10);
    assert!(series.points.iter().all(|point| point.value.is_finite()));
}

#[test]
fn constant_column_has_no_zscore_anomalies() {
    let rows = (0..50).map(|_| vec![Value::Number(7.5)]).collect();
    let data = RawDataset::from_rows(["level"], rows).unwrap();
    let scores = anomaly::score_dataset_column(&data, "level", AnomalyMethod::ZScore, 3.0).unwrap();
    assert_eq!(scores.len(), 50);
    assert!(scores.iter().all(|score| !score.is_anomaly && score.score == 0.0));
}

#[test]
fn concurrent_readers_see_whole_entries() {
    let data = synthetic::wastewater_sample(1, 90, start(), 12);
    let schema = SchemaInference::default().infer(&data);
    let (matrix, manifest) = FeatureBuilder::default()
        .build(&data, &schema, &FeatureSpec::empty().with_lags([1]), "effluent_tss")
        .unwrap();
    let batch = Trainer::new(TrainingConfig::default(), ProviderSet::builtin(&ModelConfig::default()))
        .train(&matrix, &manifest, &[ModelKind::Ridge]);
    let model = batch.models[0].clone();

    let dir = tempdir().unwrap();
    let registry = ModelRegistry::open(dir.path()).unwrap();
    registry.save(&model).unwrap();
    thread::scope(|scope| {
        let writer = scope.spawn(|| {
            for _ in 0..20 {
                registry.save(&model).unwrap();
            }
        });
        for _ in 0..4 {
            scope.spawn(|| {
                for _ in 0..20 {
                    let loaded = registry.load(model.id().as_str()).unwrap();
                    assert_eq!(loaded.manifest().digest(), model.manifest().digest());
                }
            });
        }
        writer.join().unwrap();
    });
}

#[test]
fn config_file_drives_the_runtime() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("aquaforge.toml");
    std::fs::write(&path, "[serving]\nmax_horizon = 14\n\n[anomaly]\nmethod = \"iqr\"\n").unwrap();
    let config = PipelineConfig::load(&path).unwrap();
    assert_eq!(config.serving.max_horizon, 14);
    assert_eq!(config.anomaly.method, AnomalyMethod::Iqr);
}
