use std::fmt;

use chrono::{Datelike, NaiveDateTime, Timelike, Weekday};
use indexmap::IndexSet;
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, PipelineResult};

/// Aggregate computed over a rolling window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RollingAggregate {
    /// Arithmetic mean.
    Mean,
    /// Sample standard deviation.
    Std,
    /// Minimum.
    Min,
    /// Maximum.
    Max,
}

impl RollingAggregate {
    /// Name used in derived column names.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Mean => "mean",
            Self::Std => "std",
            Self::Min => "min",
            Self::Max => "max",
        }
    }

    /// Applies the aggregate to the present values of a window.
    #[must_use]
    pub fn apply(self, values: &[f64]) -> Option<f64> {
        if values.is_empty() {
            return None;
        }
        let n = values.len() as f64;
        match self {
            Self::Mean => Some(values.iter().sum::<f64>() / n),
            Self::Std => {
                if values.len() < 2 {
                    return None;
                }
                let mean = values.iter().sum::<f64>() / n;
                let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0);
                Some(var.sqrt())
            }
            Self::Min => values.iter().copied().reduce(f64::min),
            Self::Max => values.iter().copied().reduce(f64::max),
        }
    }
}

impl fmt::Display for RollingAggregate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Feature derived from the date column alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CalendarFeature {
    /// Hour of day, 0-23.
    Hour,
    /// Day of week, Monday = 0.
    DayOfWeek,
    /// Day of month, 1-31.
    DayOfMonth,
    /// Month, 1-12.
    Month,
    /// Quarter, 1-4.
    Quarter,
    /// Ordinal day, 1-366.
    DayOfYear,
    /// 1 on Saturday/Sunday, else 0.
    IsWeekend,
}

impl CalendarFeature {
    /// Column name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Hour => "hour",
            Self::DayOfWeek => "day_of_week",
            Self::DayOfMonth => "day_of_month",
            Self::Month => "month",
            Self::Quarter => "quarter",
            Self::DayOfYear => "day_of_year",
            Self::IsWeekend => "is_weekend",
        }
    }

    /// Extracts the feature from a timestamp.
    #[must_use]
    pub fn extract(self, at: NaiveDateTime) -> f64 {
        let value = match self {
            Self::Hour => at.hour(),
            Self::DayOfWeek => at.weekday().num_days_from_monday(),
            Self::DayOfMonth => at.day(),
            Self::Month => at.month(),
            Self::Quarter => (at.month() - 1) / 3 + 1,
            Self::DayOfYear => at.ordinal(),
            Self::IsWeekend => u32::from(matches!(at.weekday(), Weekday::Sat | Weekday::Sun)),
        };
        f64::from(value)
    }
}

/// What to put in lag/rolling cells that lack history.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FillPolicy {
    /// Leave the cell missing; finalization imputes 0.
    #[default]
    Propagate,
    /// Use a constant.
    Constant(f64),
}

impl FillPolicy {
    pub(crate) const fn value(self) -> Option<f64> {
        match self {
            Self::Propagate => None,
            Self::Constant(value) => Some(value),
        }
    }
}

/// Caller-supplied derivation configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureSpec {
    /// Columns receiving lag/rolling features. Empty means the target only.
    pub sources: Vec<String>,
    /// Lag offsets in rows.
    pub lag_offsets: Vec<usize>,
    /// Rolling window sizes in rows.
    pub rolling_windows: Vec<usize>,
    /// Aggregates computed for every rolling window.
    pub rolling_aggregates: Vec<RollingAggregate>,
    /// Calendar features, emitted when a date column exists.
    pub calendar: Vec<CalendarFeature>,
    /// Fill for cells without enough history.
    pub fill: FillPolicy,
    /// Explicit base feature columns. Unset means every schema candidate except the target.
    pub base_columns: Option<Vec<String>>,
}

impl Default for FeatureSpec {
    fn default() -> Self {
        Self {
            sources: Vec::new(),
            lag_offsets: (1..=7).collect(),
            rolling_windows: vec![3, 7, 14, 30],
            rolling_aggregates: vec![RollingAggregate::Mean, RollingAggregate::Std],
            calendar: vec![
                CalendarFeature::DayOfWeek,
                CalendarFeature::Month,
                CalendarFeature::DayOfYear,
                CalendarFeature::IsWeekend,
            ],
            fill: FillPolicy::Propagate,
            base_columns: None,
        }
    }
}

impl FeatureSpec {
    /// Spec with no derived features; useful as a starting point for builders.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            lag_offsets: Vec::new(),
            rolling_windows: Vec::new(),
            rolling_aggregates: Vec::new(),
            calendar: Vec::new(),
            ..Self::default()
        }
    }

    /// Sets the lag/rolling source columns.
    #[must_use]
    pub fn with_sources<I, S>(mut self, sources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.sources = sources.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the lag offsets.
    #[must_use]
    pub fn with_lags(mut self, offsets: impl IntoIterator<Item = usize>) -> Self {
        self.lag_offsets = offsets.into_iter().collect();
        self
    }

    /// Sets rolling windows and aggregates.
    #[must_use]
    pub fn with_rolling(
        mut self,
        windows: impl IntoIterator<Item = usize>,
        aggregates: impl IntoIterator<Item = RollingAggregate>,
    ) -> Self {
        self.rolling_windows = windows.into_iter().collect();
        self.rolling_aggregates = aggregates.into_iter().collect();
        self
    }

    /// Sets calendar features.
    #[must_use]
    pub fn with_calendar(mut self, features: impl IntoIterator<Item = CalendarFeature>) -> Self {
        self.calendar = features.into_iter().collect();
        self
    }

    /// Sets an explicit base column list.
    #[must_use]
    pub fn with_base_columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.base_columns = Some(columns.into_iter().map(Into::into).collect());
        self
    }

    /// Rejects offsets or windows of zero rows.
    pub fn validate(&self) -> PipelineResult<()> {
        if self.lag_offsets.contains(&0) {
            return Err(PipelineError::InvalidSpec("lag offsets must be >= 1".into()));
        }
        if self.rolling_windows.contains(&0) {
            return Err(PipelineError::InvalidSpec("rolling windows must be >= 1".into()));
        }
        if !self.rolling_windows.is_empty() && self.rolling_aggregates.is_empty() {
            return Err(PipelineError::InvalidSpec(
                "rolling windows given without aggregates".into(),
            ));
        }
        if let FillPolicy::Constant(value) = self.fill {
            if !value.is_finite() {
                return Err(PipelineError::InvalidSpec("fill constant must be finite".into()));
            }
        }
        Ok(())
    }

    /// Canonical form stored in manifests: sources resolved against the target,
    /// offsets/windows sorted and deduplicated, enums in declaration order.
    pub(crate) fn resolve(&self, target: &str, base: &[String]) -> Self {
        let mut sources: IndexSet<String> = self.sources.iter().cloned().collect();
        if sources.is_empty() {
            sources.insert(target.to_string());
        }
        Self {
            sources: sources.into_iter().collect(),
            lag_offsets: sorted_unique(&self.lag_offsets),
            rolling_windows: sorted_unique(&self.rolling_windows),
            rolling_aggregates: sorted_unique(&self.rolling_aggregates),
            calendar: sorted_unique(&self.calendar),
            fill: self.fill,
            base_columns: Some(base.to_vec()),
        }
    }

    /// Ordered output columns: base, lags, rolling, calendar.
    #[must_use]
    pub fn plan(&self, target: &str, has_date: bool) -> Vec<FeatureColumn> {
        let mut columns = Vec::new();
        for base in self.base_columns.iter().flatten() {
            columns.push(FeatureColumn::new(
                base.clone(),
                FeatureRecipe::Base {
                    source: base.clone(),
                },
            ));
        }
        let sources = &self.sources;
        for source in sources {
            for offset in &self.lag_offsets {
                columns.push(FeatureColumn::new(
                    format!("{source}_lag_{offset}"),
                    FeatureRecipe::Lag {
                        source: source.clone(),
                        offset: *offset,
                    },
                ));
            }
        }
        for source in sources {
            for aggregate in &self.rolling_aggregates {
                for window in &self.rolling_windows {
                    columns.push(FeatureColumn::new(
                        format!("{source}_rolling_{aggregate}_{window}"),
                        FeatureRecipe::Rolling {
                            source: source.clone(),
                            aggregate: *aggregate,
                            window: *window,
                            anchored: source == target,
                        },
                    ));
                }
            }
        }
        if has_date {
            for feature in &self.calendar {
                columns.push(FeatureColumn::new(
                    feature.as_str().to_string(),
                    FeatureRecipe::Calendar { feature: *feature },
                ));
            }
        }
        columns
    }
}

fn sorted_unique<T: Ord + Copy>(values: &[T]) -> Vec<T> {
    let mut values = values.to_vec();
    values.sort_unstable();
    values.dedup();
    values
}

/// How one output column is computed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "recipe", rename_all = "snake_case")]
pub enum FeatureRecipe {
    /// Current-row value of a raw column.
    Base {
        /// Raw column.
        source: String,
    },
    /// Value `offset` rows earlier within the group.
    Lag {
        /// Raw column.
        source: String,
        /// Offset in rows.
        offset: usize,
    },
    /// Aggregate over the trailing window within the group.
    Rolling {
        /// Raw column.
        source: String,
        /// Aggregate.
        aggregate: RollingAggregate,
        /// Window length in rows.
        window: usize,
        /// Window ends one row before the current row (target sources).
        anchored: bool,
    },
    /// Calendar value of the row date.
    Calendar {
        /// Feature.
        feature: CalendarFeature,
    },
}

impl FeatureRecipe {
    /// Raw column the recipe reads, if any.
    #[must_use]
    pub fn source(&self) -> Option<&str> {
        match self {
            Self::Base { source } | Self::Lag { source, .. } | Self::Rolling { source, .. } => {
                Some(source)
            }
            Self::Calendar { .. } => None,
        }
    }

    /// Leading rows per group that cannot carry a complete value.
    #[must_use]
    pub const fn warmup(&self) -> usize {
        match self {
            Self::Base { .. } | Self::Calendar { .. } => 0,
            Self::Lag { offset, .. } => *offset,
            Self::Rolling {
                window, anchored, ..
            } => {
                if *anchored {
                    *window
                } else {
                    *window - 1
                }
            }
        }
    }
}

/// Named output column and its recipe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureColumn {
    /// Column name.
    pub name: String,
    /// Recipe.
    pub recipe: FeatureRecipe,
}

impl FeatureColumn {
    fn new(name: String, recipe: FeatureRecipe) -> Self {
        Self { name, recipe }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn default_spec_is_valid() {
        FeatureSpec::default().validate().unwrap();
        assert_eq!(FeatureSpec::default().lag_offsets, vec![1, 2, 3, 4, 5, 6, 7]);
    }

    #[test]
    fn rejects_zero_offsets_and_windows() {
        assert!(FeatureSpec::empty().with_lags([0]).validate().is_err());
        assert!(FeatureSpec::empty()
            .with_rolling([0], [RollingAggregate::Mean])
            .validate()
            .is_err());
        assert!(FeatureSpec::empty().with_rolling([3], Vec::<RollingAggregate>::new()).validate().is_err());
    }

    #[test]
    fn plan_follows_fixed_order() {
        let spec = FeatureSpec::empty()
            .with_sources(["flow", "bod"])
            .with_lags([7, 1, 7])
            .with_rolling([7, 3], [RollingAggregate::Std, RollingAggregate::Mean])
            .with_calendar([CalendarFeature::Month, CalendarFeature::DayOfWeek])
            .resolve("bod", &["flow".to_string(), "cod".to_string()]);
        let names: Vec<String> = spec.plan("bod", true).into_iter().map(|c| c.name).collect();
        assert_eq!(
            names,
            vec![
                "flow",
                "cod",
                "flow_lag_1",
                "flow_lag_7",
                "bod_lag_1",
                "bod_lag_7",
                "flow_rolling_mean_3",
                "flow_rolling_mean_7",
                "flow_rolling_std_3",
                "flow_rolling_std_7",
                "bod_rolling_mean_3",
                "bod_rolling_mean_7",
                "bod_rolling_std_3",
                "bod_rolling_std_7",
                "day_of_week",
                "month",
            ]
        );
    }

    #[test]
    fn empty_sources_resolve_to_target() {
        let spec = FeatureSpec::empty().with_lags([1]).resolve("bod", &[]);
        assert_eq!(spec.sources, vec!["bod"]);
        let plan = spec.plan("bod", false);
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].recipe.warmup(), 1);
    }

    #[test]
    fn target_windows_are_anchored() {
        let spec = FeatureSpec::empty()
            .with_sources(["bod", "flow"])
            .with_rolling([7], [RollingAggregate::Mean])
            .resolve("bod", &[]);
        let plan = spec.plan("bod", false);
        assert_eq!(plan[0].recipe.warmup(), 7);
        assert_eq!(plan[1].recipe.warmup(), 6);
    }

    #[test]
    fn aggregates_and_calendar_values() {
        assert_eq!(RollingAggregate::Mean.apply(&[1.0, 2.0, 3.0]), Some(2.0));
        assert_eq!(RollingAggregate::Std.apply(&[1.0]), None);
        assert!((RollingAggregate::Std.apply(&[1.0, 3.0]).unwrap() - 2f64.sqrt()).abs() < 1e-12);
        assert_eq!(RollingAggregate::Max.apply(&[1.0, 5.0, 3.0]), Some(5.0));
        assert_eq!(RollingAggregate::Min.apply(&[]), None);

        let saturday = NaiveDate::from_ymd_opt(2024, 8, 17)
            .unwrap()
            .and_hms_opt(13, 0, 0)
            .unwrap();
        assert_eq!(CalendarFeature::IsWeekend.extract(saturday), 1.0);
        assert_eq!(CalendarFeature::DayOfWeek.extract(saturday), 5.0);
        assert_eq!(CalendarFeature::Quarter.extract(saturday), 3.0);
        assert_eq!(CalendarFeature::Hour.extract(saturday), 13.0);
    }

    #[test]
    fn spec_round_trips_through_toml() {
        let spec = FeatureSpec::empty()
            .with_lags([1, 7])
            .with_rolling([7], [RollingAggregate::Mean]);
        let raw = toml::to_string(&spec).unwrap();
        let decoded: FeatureSpec = toml::from_str(&raw).unwrap();
        assert_eq!(decoded, spec);
    }
}
