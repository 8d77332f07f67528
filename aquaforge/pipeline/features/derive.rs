//! Row-level derivation shared by the manifest builder and the forecast reconciler.

use chrono::{Duration, NaiveDateTime};
use indexmap::{IndexMap, IndexSet};

use super::spec::{FeatureColumn, FeatureRecipe};
use crate::{
    dataset::RawDataset,
    error::{PipelineError, PipelineResult},
};

/// Column roles of one derivation run.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Layout<'a> {
    pub target: &'a str,
    pub date_column: Option<&'a str>,
    pub group_column: Option<&'a str>,
}

/// One group's series in date order. Indices below `target.len()` are observed;
/// the rest are future rows whose target is produced by the model.
#[derive(Debug, Clone)]
pub(crate) struct GroupSeries {
    pub key: Option<String>,
    pub dates: Vec<Option<NaiveDateTime>>,
    pub inputs: IndexMap<String, Vec<Option<f64>>>,
    pub target: Vec<f64>,
    target_name: String,
}

/// Derived row before it is placed into a matrix.
#[derive(Debug, Clone)]
pub(crate) struct DerivedRow {
    pub date: Option<NaiveDateTime>,
    pub group: Option<String>,
    pub values: Vec<f64>,
    pub target: f64,
}

/// Splits a dataset into per-group series.
///
/// Rows lacking a date (when a date column is used) are dropped. Rows lacking
/// the target are dropped, except trailing ones when `keep_future` is set.
pub(crate) fn partition(
    dataset: &RawDataset,
    layout: Layout<'_>,
    inputs: &[&str],
    keep_future: bool,
) -> PipelineResult<Vec<GroupSeries>> {
    let target_idx = dataset
        .column_index(layout.target)
        .ok_or_else(|| PipelineError::UnknownColumn(layout.target.to_string()))?;
    let date_idx = layout.date_column.and_then(|name| dataset.column_index(name));
    let group_idx = layout.group_column.and_then(|name| dataset.column_index(name));
    let input_idx: Vec<(&str, usize)> = inputs
        .iter()
        .copied()
        .filter(|name| *name != layout.target)
        .collect::<IndexSet<&str>>()
        .into_iter()
        .filter_map(|name| dataset.column_index(name).map(|idx| (name, idx)))
        .collect();

    let rows = dataset.rows();
    let mut groups: IndexMap<Option<String>, Vec<usize>> = IndexMap::new();
    for (idx, row) in rows.iter().enumerate() {
        let key = group_idx.and_then(|g| row[g].group_key());
        groups.entry(key).or_default().push(idx);
    }

    let mut series = Vec::with_capacity(groups.len());
    for (key, mut members) in groups {
        let mut dated: Vec<(usize, Option<NaiveDateTime>)> = members
            .drain(..)
            .map(|idx| (idx, date_idx.and_then(|d| rows[idx][d].as_datetime())))
            .filter(|(_, date)| date_idx.is_none() || date.is_some())
            .collect();
        dated.sort_by_key(|(_, date)| *date);

        let last_observed = dated
            .iter()
            .rposition(|(idx, _)| rows[*idx][target_idx].as_f64().is_some());
        let mut group = GroupSeries {
            key,
            dates: Vec::new(),
            inputs: input_idx
                .iter()
                .map(|(name, _)| ((*name).to_string(), Vec::new()))
                .collect(),
            target: Vec::new(),
            target_name: layout.target.to_string(),
        };
        let mut future = Vec::new();
        for (position, (idx, date)) in dated.into_iter().enumerate() {
            let row = &rows[idx];
            match row[target_idx].as_f64() {
                Some(value) => {
                    group.target.push(value);
                    group.push_inputs(row, &input_idx, date);
                }
                None if keep_future && last_observed.map_or(true, |last| position > last) => {
                    future.push((idx, date));
                }
                None => {}
            }
        }
        for (idx, date) in future {
            group.push_inputs(&rows[idx], &input_idx, date);
        }
        series.push(group);
    }
    Ok(series)
}

impl GroupSeries {
    fn push_inputs(
        &mut self,
        row: &[crate::dataset::Value],
        inputs: &[(&str, usize)],
        date: Option<NaiveDateTime>,
    ) {
        self.dates.push(date);
        for (name, idx) in inputs {
            if let Some(column) = self.inputs.get_mut(*name) {
                column.push(row[*idx].as_f64());
            }
        }
    }

    /// Number of observed rows.
    pub fn observed(&self) -> usize {
        self.target.len()
    }

    /// Last observed date.
    pub fn last_date(&self) -> Option<NaiveDateTime> {
        self.dates[..self.observed()].iter().rev().find_map(|date| *date)
    }

    fn value_at(&self, source: &str, idx: usize) -> Option<f64> {
        if source == self.target_name {
            self.target.get(idx).copied()
        } else {
            self.inputs.get(source)?.get(idx).copied().flatten()
        }
    }

    /// Value of one recipe at row `idx`. Only `target[..idx]` is read for target sources.
    pub fn evaluate(&self, recipe: &FeatureRecipe, idx: usize, fill: Option<f64>) -> Option<f64> {
        match recipe {
            FeatureRecipe::Base { source } => self.value_at(source, idx),
            FeatureRecipe::Lag { source, offset } => {
                if idx < *offset {
                    fill
                } else {
                    self.value_at(source, idx - offset)
                }
            }
            FeatureRecipe::Rolling {
                source,
                aggregate,
                window,
                anchored,
            } => {
                let end = if *anchored { idx } else { idx + 1 };
                if end < *window {
                    return fill;
                }
                let present: Vec<f64> = (end - window..end)
                    .filter_map(|pos| self.value_at(source, pos))
                    .collect();
                aggregate.apply(&present)
            }
            FeatureRecipe::Calendar { feature } => self
                .dates
                .get(idx)
                .copied()
                .flatten()
                .map(|date| feature.extract(date)),
        }
    }

    /// Feature values of row `idx`; columns flagged in `absent` are 0.
    /// Returns the values and how many present-column cells were imputed.
    pub fn row(
        &self,
        plan: &[FeatureColumn],
        absent: &[bool],
        idx: usize,
        fill: Option<f64>,
    ) -> (Vec<f64>, usize) {
        let mut imputed = 0;
        let values = plan
            .iter()
            .zip(absent)
            .map(|(column, absent)| {
                if *absent {
                    return 0.0;
                }
                self.evaluate(&column.recipe, idx, fill).unwrap_or_else(|| {
                    imputed += 1;
                    0.0
                })
            })
            .collect();
        (values, imputed)
    }

    /// Observed rows from `warmup` on, as derived rows.
    pub fn history_rows(
        &self,
        plan: &[FeatureColumn],
        absent: &[bool],
        warmup: usize,
        fill: Option<f64>,
    ) -> (Vec<DerivedRow>, usize) {
        let mut imputed = 0;
        let rows = (warmup..self.observed())
            .map(|idx| {
                let (values, filled) = self.row(plan, absent, idx, fill);
                imputed += filled;
                DerivedRow {
                    date: self.dates[idx],
                    group: self.key.clone(),
                    values,
                    target: self.target[idx],
                }
            })
            .collect();
        (rows, imputed)
    }

    /// Pads dates and inputs to `len` rows. Future dates advance by `step`;
    /// missing future inputs carry the last known value forward.
    pub fn extend_to(&mut self, len: usize, step: Option<Duration>) {
        let observed = self.observed();
        self.dates.truncate(len.max(observed));
        let mut last_date = self.last_date();
        for idx in observed..len {
            if idx < self.dates.len() {
                if self.dates[idx].is_some() {
                    last_date = self.dates[idx];
                    continue;
                }
                self.dates[idx] = next_date(last_date, step);
            } else {
                self.dates.push(next_date(last_date, step));
            }
            last_date = self.dates[idx];
        }
        for column in self.inputs.values_mut() {
            column.truncate(len.max(observed));
            column.resize(len.max(column.len()), None);
            let mut carried = column[..observed.min(column.len())]
                .iter()
                .rev()
                .find_map(|value| *value);
            for value in column.iter_mut().skip(observed) {
                match value {
                    Some(known) => carried = Some(*known),
                    None => *value = carried,
                }
            }
        }
    }

    /// Appends a produced target value.
    pub fn push_target(&mut self, value: f64) {
        self.target.push(value);
    }
}

fn next_date(last: Option<NaiveDateTime>, step: Option<Duration>) -> Option<NaiveDateTime> {
    last.and_then(|date| date.checked_add_signed(step.unwrap_or_else(|| Duration::days(1))))
}

/// Leading rows per group dropped before rows enter a matrix.
pub(crate) fn warmup(plan: &[FeatureColumn]) -> usize {
    plan.iter()
        .map(|column| column.recipe.warmup())
        .max()
        .unwrap_or(0)
}

/// Median positive spacing between consecutive observed dates, in seconds.
pub(crate) fn median_step(groups: &[GroupSeries]) -> Option<i64> {
    let mut steps: Vec<i64> = groups
        .iter()
        .flat_map(|group| {
            let observed: Vec<NaiveDateTime> =
                group.dates[..group.observed()].iter().flatten().copied().collect();
            observed
                .windows(2)
                .map(|pair| (pair[1] - pair[0]).num_seconds())
                .filter(|seconds| *seconds > 0)
                .collect::<Vec<_>>()
        })
        .collect();
    if steps.is_empty() {
        return None;
    }
    steps.sort_unstable();
    Some(steps[steps.len() / 2])
}

/// Puts rows from every group into one stable date order.
pub(crate) fn order_rows(rows: &mut [DerivedRow]) {
    rows.sort_by(|a, b| a.date.cmp(&b.date));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        dataset::Value,
        features::spec::{FeatureSpec, RollingAggregate},
    };

    fn layout() -> Layout<'static> {
        Layout {
            target: "y",
            date_column: Some("date"),
            group_column: Some("site"),
        }
    }

    fn dataset() -> RawDataset {
        RawDataset::from_rows(
            ["date", "site", "y", "x"],
            vec![
                vec!["2024-01-03".into(), "B".into(), 30.0.into(), 3.0.into()],
                vec!["2024-01-02".into(), "A".into(), 2.0.into(), 2.0.into()],
                vec!["2024-01-01".into(), "A".into(), 1.0.into(), 1.0.into()],
                vec!["2024-01-03".into(), "A".into(), 3.0.into(), Value::Missing],
                vec!["2024-01-04".into(), "A".into(), Value::Missing, 4.0.into()],
                vec![Value::Missing, "A".into(), 9.0.into(), 9.0.into()],
            ],
        )
        .unwrap()
    }

    #[test]
    fn partitions_by_group_in_date_order() {
        let groups = partition(&dataset(), layout(), &["x"], false).unwrap();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].key.as_deref(), Some("B"));
        assert_eq!(groups[1].target, vec![1.0, 2.0, 3.0]);
        assert_eq!(groups[1].inputs["x"], vec![Some(1.0), Some(2.0), None]);
        assert_eq!(groups[1].dates.len(), 3);
    }

    #[test]
    fn keeps_trailing_rows_as_future() {
        let groups = partition(&dataset(), layout(), &["x"], true).unwrap();
        let site_a = &groups[1];
        assert_eq!(site_a.observed(), 3);
        assert_eq!(site_a.dates.len(), 4);
        assert_eq!(site_a.inputs["x"][3], Some(4.0));
    }

    #[test]
    fn target_rolling_never_reads_current_row() {
        let groups = partition(&dataset(), layout(), &["x"], false).unwrap();
        let spec = FeatureSpec::empty()
            .with_rolling([2], [RollingAggregate::Mean])
            .resolve("y", &[]);
        let plan = spec.plan("y", true);
        assert_eq!(groups[1].evaluate(&plan[0].recipe, 2, None), Some(1.5));
        assert_eq!(groups[1].evaluate(&plan[0].recipe, 1, None), None);
    }

    #[test]
    fn extension_carries_inputs_and_dates() {
        let mut groups = partition(&dataset(), layout(), &["x"], true).unwrap();
        let site_a = &mut groups[1];
        site_a.extend_to(6, Some(Duration::days(1)));
        assert_eq!(site_a.dates.len(), 6);
        assert_eq!(site_a.inputs["x"][5], Some(4.0));
        assert_eq!(
            site_a.dates[5].map(|d| d.date().to_string()),
            Some("2024-01-06".to_string())
        );
    }

    #[test]
    fn median_spacing_in_seconds() {
        let groups = partition(&dataset(), layout(), &[], false).unwrap();
        assert_eq!(median_step(&groups), Some(86_400));
    }
}
