use chrono::{DateTime, NaiveDate, NaiveDateTime};
use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{PipelineError, PipelineResult};

const DATE_LAYOUTS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d", "%d.%m.%Y"];
const DATETIME_LAYOUTS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M",
    "%Y/%m/%d %H:%M:%S",
];

/// Single cell of a raw dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum Value {
    /// Numeric reading.
    Number(f64),
    /// Free text (site names, codes, unparsed dates).
    Text(String),
    /// Date or timestamp.
    Date(NaiveDateTime),
    /// Missing marker.
    Missing,
}

impl Value {
    /// True for the missing marker and for NaN readings.
    #[must_use]
    pub fn is_missing(&self) -> bool {
        match self {
            Self::Missing => true,
            Self::Number(value) => value.is_nan(),
            Self::Text(_) | Self::Date(_) => false,
        }
    }

    /// Finite numeric value, if any.
    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(value) if value.is_finite() => Some(*value),
            _ => None,
        }
    }

    /// Timestamp carried by the cell, parsing text when needed.
    #[must_use]
    pub fn as_datetime(&self) -> Option<NaiveDateTime> {
        match self {
            Self::Date(value) => Some(*value),
            Self::Text(raw) => parse_datetime(raw),
            Self::Number(_) | Self::Missing => None,
        }
    }

    /// Text key used for grouping. Numbers are rendered, missing cells have no key.
    #[must_use]
    pub fn group_key(&self) -> Option<String> {
        match self {
            Self::Text(raw) => Some(raw.clone()),
            Self::Number(value) if value.is_finite() => Some(value.to_string()),
            Self::Date(value) => Some(value.to_string()),
            _ => None,
        }
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Self::Number(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<NaiveDateTime> for Value {
    fn from(value: NaiveDateTime) -> Self {
        Self::Date(value)
    }
}

impl From<NaiveDate> for Value {
    fn from(value: NaiveDate) -> Self {
        Self::Date(value.and_time(chrono::NaiveTime::MIN))
    }
}

impl<T: Into<Self>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Missing, Into::into)
    }
}

/// Parses the date layouts accepted by ingestion (ISO dates, ISO timestamps, RFC3339).
#[must_use]
pub fn parse_datetime(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.naive_utc());
    }
    DATETIME_LAYOUTS
        .iter()
        .find_map(|layout| NaiveDateTime::parse_from_str(raw, layout).ok())
        .or_else(|| {
            DATE_LAYOUTS
                .iter()
                .find_map(|layout| NaiveDate::parse_from_str(raw, layout).ok())
                .map(|date| date.and_time(chrono::NaiveTime::MIN))
        })
}

/// Ordered rows of named cells, as handed over by ingestion.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawDataset {
    columns: IndexSet<String>,
    rows: Vec<Vec<Value>>,
}

impl RawDataset {
    /// Creates an empty dataset with the given column names.
    pub fn new<I, S>(columns: I) -> PipelineResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut names = IndexSet::new();
        for column in columns {
            let column = column.into();
            if !names.insert(column.clone()) {
                return Err(PipelineError::DuplicateColumn(column));
            }
        }
        Ok(Self {
            columns: names,
            rows: Vec::new(),
        })
    }

    /// Builds a dataset from positional rows.
    pub fn from_rows<I, S>(columns: I, rows: Vec<Vec<Value>>) -> PipelineResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut dataset = Self::new(columns)?;
        for row in rows {
            dataset.push_row(row)?;
        }
        Ok(dataset)
    }

    /// Dataset assembled inside the crate with distinct names and full-width rows.
    pub(crate) fn from_trusted(columns: &[&str], rows: Vec<Vec<Value>>) -> Self {
        Self {
            columns: columns.iter().map(|column| (*column).to_string()).collect(),
            rows,
        }
    }

    /// Appends a positional row; its width must match the column count.
    pub fn push_row(&mut self, row: Vec<Value>) -> PipelineResult<()> {
        if row.len() != self.columns.len() {
            return Err(PipelineError::InvalidSpec(format!(
                "row has {} cells, dataset has {} columns",
                row.len(),
                self.columns.len()
            )));
        }
        self.rows.push(row);
        Ok(())
    }

    /// Appends a row given as a name/value mapping. Unnamed columns become missing.
    pub fn push_record(&mut self, record: &IndexMap<String, Value>) -> PipelineResult<()> {
        if let Some(unknown) = record.keys().find(|key| !self.columns.contains(*key)) {
            return Err(PipelineError::UnknownColumn(unknown.clone()));
        }
        let row = self
            .columns
            .iter()
            .map(|column| record.get(column).cloned().unwrap_or(Value::Missing))
            .collect();
        self.rows.push(row);
        Ok(())
    }

    /// Column names in dataset order.
    pub fn columns(&self) -> impl Iterator<Item = &str> + '_ {
        self.columns.iter().map(String::as_str)
    }

    /// Number of columns.
    #[must_use]
    pub fn width(&self) -> usize {
        self.columns.len()
    }

    /// Number of rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// True when the dataset has no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Position of a column.
    #[must_use]
    pub fn column_index(&self, column: &str) -> Option<usize> {
        self.columns.get_index_of(column)
    }

    /// True when the column exists.
    #[must_use]
    pub fn has_column(&self, column: &str) -> bool {
        self.columns.contains(column)
    }

    /// Positional rows.
    #[must_use]
    pub fn rows(&self) -> &[Vec<Value>] {
        &self.rows
    }

    /// Row as a name/value mapping.
    #[must_use]
    pub fn record(&self, row: usize) -> Option<IndexMap<&str, &Value>> {
        self.rows.get(row).map(|cells| {
            self.columns
                .iter()
                .map(String::as_str)
                .zip(cells.iter())
                .collect()
        })
    }

    /// Cells of one column, top to bottom.
    pub fn column(&self, column: &str) -> PipelineResult<Vec<&Value>> {
        let idx = self
            .column_index(column)
            .ok_or_else(|| PipelineError::UnknownColumn(column.to_string()))?;
        Ok(self.rows.iter().map(|row| &row[idx]).collect())
    }

    /// Numeric view of one column; non-numeric and missing cells are `None`.
    pub fn numeric_column(&self, column: &str) -> PipelineResult<Vec<Option<f64>>> {
        Ok(self
            .column(column)?
            .into_iter()
            .map(Value::as_f64)
            .collect())
    }

    /// True when the column has at least one present cell and every present cell is a number.
    #[must_use]
    pub fn is_numeric_column(&self, column: &str) -> bool {
        let Some(idx) = self.column_index(column) else {
            return false;
        };
        let mut any = false;
        for cell in self.rows.iter().map(|row| &row[idx]).filter(|cell| !cell.is_missing()) {
            if !matches!(cell, Value::Number(_)) {
                return false;
            }
            any = true;
        }
        any
    }

    /// Copy without the named columns (missing names are ignored).
    #[must_use]
    pub fn without_columns(&self, drop: &[&str]) -> Self {
        let keep: Vec<usize> = self
            .columns
            .iter()
            .enumerate()
            .filter(|(_, name)| !drop.contains(&name.as_str()))
            .map(|(idx, _)| idx)
            .collect();
        Self {
            columns: keep
                .iter()
                .map(|idx| self.columns[*idx].clone())
                .collect(),
            rows: self
                .rows
                .iter()
                .map(|row| keep.iter().map(|idx| row[*idx].clone()).collect())
                .collect(),
        }
    }

    /// Content fingerprint (sha256 over column names and cell values).
    #[must_use]
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        for column in &self.columns {
            hasher.update(column.as_bytes());
            hasher.update([0x1f]);
        }
        for row in &self.rows {
            for cell in row {
                match cell {
                    Value::Number(value) => {
                        hasher.update([1]);
                        hasher.update(value.to_bits().to_le_bytes());
                    }
                    Value::Text(raw) => {
                        hasher.update([2]);
                        hasher.update(raw.as_bytes());
                        hasher.update([0x1f]);
                    }
                    Value::Date(date) => {
                        hasher.update([3]);
                        hasher.update(date.and_utc().timestamp().to_le_bytes());
                    }
                    Value::Missing => hasher.update([0]),
                }
            }
            hasher.update([0x1e]);
        }
        format!("sha256:{:x}", hasher.finalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> RawDataset {
        RawDataset::from_rows(
            ["date", "site_id", "flow"],
            vec![
                vec!["2024-01-01".into(), "A".into(), 10.0.into()],
                vec!["2024-01-02".into(), "A".into(), Value::Missing],
            ],
        )
        .unwrap()
    }

    #[test]
    fn rejects_duplicate_columns() {
        let err = RawDataset::new(["a", "b", "a"]).unwrap_err();
        assert!(matches!(err, PipelineError::DuplicateColumn(name) if name == "a"));
    }

    #[test]
    fn rejects_ragged_rows() {
        let mut dataset = RawDataset::new(["a", "b"]).unwrap();
        assert!(dataset.push_row(vec![1.0.into()]).is_err());
    }

    #[test]
    fn records_fill_missing_cells() {
        let mut dataset = RawDataset::new(["a", "b"]).unwrap();
        let mut record = IndexMap::new();
        record.insert("b".to_string(), Value::Number(2.0));
        dataset.push_record(&record).unwrap();
        let row = dataset.record(0).unwrap();
        assert!(row["a"].is_missing());
        assert_eq!(row["b"].as_f64(), Some(2.0));
    }

    #[test]
    fn parses_supported_layouts() {
        assert!(parse_datetime("2024-03-05").is_some());
        assert!(parse_datetime("2024-03-05 10:30:00").is_some());
        assert!(parse_datetime("2024-03-05T10:30:00Z").is_some());
        assert!(parse_datetime("05.03.2024").is_some());
        assert!(parse_datetime("WWTP_01").is_none());
        assert!(parse_datetime("").is_none());
    }

    #[test]
    fn fingerprint_tracks_content() {
        let a = sample();
        let mut b = sample();
        assert_eq!(a.fingerprint(), b.fingerprint());
        b.push_row(vec!["2024-01-03".into(), "A".into(), 11.0.into()])
            .unwrap();
        assert_ne!(a.fingerprint(), b.fingerprint());
        assert!(a.fingerprint().starts_with("sha256:"));
    }

    #[test]
    fn numeric_view_and_projection() {
        let dataset = sample();
        assert_eq!(dataset.numeric_column("flow").unwrap(), vec![Some(10.0), None]);
        assert!(dataset.is_numeric_column("flow"));
        assert!(!dataset.is_numeric_column("site_id"));
        let narrowed = dataset.without_columns(&["flow"]);
        assert_eq!(narrowed.width(), 2);
        assert!(!narrowed.has_column("flow"));
        assert!(dataset.numeric_column("nope").is_err());
    }
}
