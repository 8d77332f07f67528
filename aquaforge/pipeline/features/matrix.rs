use std::ops::Range;

use chrono::NaiveDateTime;
use indexmap::IndexMap;
use ndarray::{s, Array1, Array2, ArrayView1, ArrayView2, Axis};
use serde::{Deserialize, Serialize};

use super::derive::DerivedRow;

/// Identity of a matrix row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowKey {
    /// Row date, when the data has one.
    pub date: Option<NaiveDateTime>,
    /// Group key, when the data is grouped.
    pub group: Option<String>,
}

/// Numeric feature matrix plus target, columns in manifest order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureMatrix {
    columns: Vec<String>,
    features: Array2<f64>,
    target: Array1<f64>,
    keys: Vec<RowKey>,
}

impl FeatureMatrix {
    pub(crate) fn from_rows(columns: Vec<String>, rows: Vec<DerivedRow>) -> Self {
        let width = columns.len();
        let mut features = Array2::zeros((rows.len(), width));
        let mut target = Array1::zeros(rows.len());
        let mut keys = Vec::with_capacity(rows.len());
        for (idx, row) in rows.into_iter().enumerate() {
            for (col, value) in row.values.into_iter().enumerate().take(width) {
                features[[idx, col]] = value;
            }
            target[idx] = row.target;
            keys.push(RowKey {
                date: row.date,
                group: row.group,
            });
        }
        Self {
            columns,
            features,
            target,
            keys,
        }
    }

    /// Column names.
    #[must_use]
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Feature values, rows by columns.
    #[must_use]
    pub fn features(&self) -> ArrayView2<'_, f64> {
        self.features.view()
    }

    /// Target values.
    #[must_use]
    pub fn target(&self) -> ArrayView1<'_, f64> {
        self.target.view()
    }

    /// Row identities.
    #[must_use]
    pub fn keys(&self) -> &[RowKey] {
        &self.keys
    }

    /// Number of rows.
    #[must_use]
    pub fn rows(&self) -> usize {
        self.features.nrows()
    }

    /// Number of feature columns.
    #[must_use]
    pub fn width(&self) -> usize {
        self.columns.len()
    }

    /// True when the matrix has no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows() == 0
    }

    /// One feature column by name.
    #[must_use]
    pub fn column(&self, name: &str) -> Option<ArrayView1<'_, f64>> {
        let idx = self.columns.iter().position(|column| column == name)?;
        Some(self.features.column(idx))
    }

    /// Contiguous row slice.
    #[must_use]
    pub fn slice_rows(&self, range: Range<usize>) -> Self {
        let end = range.end.min(self.rows());
        let range = range.start.min(end)..end;
        Self {
            columns: self.columns.clone(),
            features: self.features.slice(s![range.clone(), ..]).to_owned(),
            target: self.target.slice(s![range.clone()]).to_owned(),
            keys: self.keys[range].to_vec(),
        }
    }

    /// Row positions per group, in row order. Ungrouped rows share the `None` key.
    #[must_use]
    pub fn group_positions(&self) -> Vec<(Option<String>, Vec<usize>)> {
        let mut groups: IndexMap<Option<String>, Vec<usize>> = IndexMap::new();
        for (idx, key) in self.keys.iter().enumerate() {
            groups.entry(key.group.clone()).or_default().push(idx);
        }
        groups.into_iter().collect()
    }

    /// Target values at the given positions.
    #[must_use]
    pub fn target_at(&self, positions: &[usize]) -> Vec<f64> {
        self.target.select(Axis(0), positions).to_vec()
    }
}
