use chrono::Duration;

use super::{ForecastMode, ForecastPoint, ForecastSeries};
use crate::{
    config::ServingConfig,
    dataset::RawDataset,
    error::PipelineResult,
    features::{derive, FeatureManifest},
};

/// Trend extrapolation from the last observed target values of each group.
///
/// Reads only the manifest's target, date and group columns; absent ones are
/// skipped, and without the target every step is zero. The result is tagged
/// [`ForecastMode::Fallback`] with `cause`.
pub fn naive_extrapolation(
    dataset: &RawDataset,
    manifest: &FeatureManifest,
    horizon: usize,
    config: &ServingConfig,
    cause: impl Into<String>,
) -> PipelineResult<ForecastSeries> {
    let groups = if dataset.has_column(manifest.target()) {
        derive::partition(dataset, super::layout(manifest, dataset), &[], false)?
    } else {
        Vec::new()
    };
    let step = Duration::seconds(manifest.date_step_seconds().unwrap_or(86_400));

    let mut points = Vec::new();
    for group in groups.iter().filter(|group| group.observed() > 0) {
        let start = group.observed().saturating_sub(config.fallback_lookback.max(1));
        let recent = &group.target[start..];
        let last_date = group.last_date();
        for (offset, (value, spread)) in extrapolate(recent, horizon, config.confidence_z)
            .into_iter()
            .enumerate()
        {
            let step_no = offset + 1;
            points.push(ForecastPoint {
                step: step_no,
                date: last_date.and_then(|date| date.checked_add_signed(step * step_count(step_no))),
                group: group.key.clone(),
                value,
                lower: value - spread,
                upper: value + spread,
            });
        }
    }
    if points.is_empty() {
        points = (1..=horizon)
            .map(|step_no| ForecastPoint {
                step: step_no,
                date: None,
                group: None,
                value: 0.0,
                lower: 0.0,
                upper: 0.0,
            })
            .collect();
    }

    Ok(ForecastSeries {
        model_id: None,
        kind: None,
        target: manifest.target().to_string(),
        mode: ForecastMode::Fallback {
            cause: cause.into(),
        },
        alignment: None,
        points,
    })
}

#[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
const fn step_count(step: usize) -> i32 {
    step as i32
}

/// `(value, half-width)` for each future step.
#[allow(clippy::cast_precision_loss)]
fn extrapolate(recent: &[f64], horizon: usize, z: f64) -> Vec<(f64, f64)> {
    let Some(&last) = recent.last() else {
        return vec![(0.0, 0.0); horizon];
    };
    if recent.len() == 1 {
        return vec![(last, (last * 0.1).abs()); horizon];
    }
    let diffs = recent.len() - 1;
    let trend = (last - recent[0]) / diffs as f64;
    let mean = recent.iter().sum::<f64>() / recent.len() as f64;
    let std = (recent.iter().map(|value| (value - mean).powi(2)).sum::<f64>() / recent.len() as f64).sqrt();
    (1..=horizon)
        .map(|step| (last + trend * step as f64, z * std))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linear_history_continues_its_trend() {
        let points = extrapolate(&[1.0, 2.0, 3.0, 4.0], 3, 1.96);
        let values: Vec<f64> = points.iter().map(|(value, _)| *value).collect();
        assert_eq!(values, vec![5.0, 6.0, 7.0]);
        assert!(points.iter().all(|(_, spread)| *spread > 0.0));
    }

    #[test]
    fn single_observation_is_flat_with_ten_percent_band() {
        let points = extrapolate(&[50.0], 2, 1.96);
        assert_eq!(points, vec![(50.0, 5.0), (50.0, 5.0)]);
    }

    #[test]
    fn no_observations_yield_zeros() {
        assert_eq!(extrapolate(&[], 2, 1.96), vec![(0.0, 0.0); 2]);
    }
}
