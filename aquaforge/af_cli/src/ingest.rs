//! CSV ingestion: turns delimited text into a `RawDataset` and back.

use std::path::Path;

use anyhow::{Context, Result};
use aquaforge_pipeline::{dataset::parse_datetime, RawDataset, Value};
use chrono::Timelike;

const MISSING_TOKENS: [&str; 7] = ["", "na", "n/a", "nan", "null", "none", "-"];

/// Reads a CSV file with a header row.
pub fn read_csv(path: &Path) -> Result<RawDataset> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_path(path)
        .with_context(|| format!("opening {}", path.display()))?;
    let headers: Vec<String> = reader
        .headers()
        .with_context(|| format!("reading header of {}", path.display()))?
        .iter()
        .map(str::to_string)
        .collect();
    let width = headers.len();
    let mut rows = Vec::new();
    for (line, record) in reader.records().enumerate() {
        let record = record.with_context(|| format!("reading row {} of {}", line + 1, path.display()))?;
        let mut row: Vec<Value> = record.iter().take(width).map(parse_cell).collect();
        row.resize(width, Value::Missing);
        rows.push(row);
    }
    RawDataset::from_rows(headers, rows).with_context(|| format!("building dataset from {}", path.display()))
}

/// Writes a dataset as CSV; missing cells become empty fields.
pub fn write_csv(dataset: &RawDataset, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut writer = csv::Writer::from_path(path).with_context(|| format!("creating {}", path.display()))?;
    writer.write_record(dataset.columns())?;
    for row in dataset.rows() {
        writer.write_record(row.iter().map(render_cell))?;
    }
    writer.flush()?;
    Ok(())
}

fn parse_cell(raw: &str) -> Value {
    if MISSING_TOKENS.iter().any(|token| raw.eq_ignore_ascii_case(token)) {
        return Value::Missing;
    }
    if let Ok(number) = raw.parse::<f64>() {
        if number.is_finite() {
            return Value::Number(number);
        }
    }
    parse_datetime(raw).map_or_else(|| Value::Text(raw.to_string()), Value::Date)
}

fn render_cell(value: &Value) -> String {
    match value {
        Value::Number(number) => number.to_string(),
        Value::Text(text) => text.clone(),
        Value::Date(date) if date.time().num_seconds_from_midnight() == 0 => date.format("%Y-%m-%d").to_string(),
        Value::Date(date) => date.format("%Y-%m-%dT%H:%M:%S").to_string(),
        Value::Missing => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn cells_are_typed() {
        assert_eq!(parse_cell("12.5"), Value::Number(12.5));
        assert_eq!(parse_cell("NA"), Value::Missing);
        assert_eq!(parse_cell(""), Value::Missing);
        assert!(matches!(parse_cell("2024-02-01"), Value::Date(_)));
        assert_eq!(parse_cell("WWTP_01"), Value::Text("WWTP_01".into()));
        assert_eq!(parse_cell("inf"), Value::Text("inf".into()));
    }

    #[test]
    fn csv_round_trip_keeps_cells() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("plant.csv");
        std::fs::write(
            &path,
            "date,site_id,effluent_bod\n2024-01-01,WWTP_01,4.2\n2024-01-02,WWTP_01,n/a\n2024-01-03,WWTP_01\n",
        )
        .unwrap();
        let dataset = read_csv(&path).unwrap();
        assert_eq!(dataset.len(), 3);
        assert_eq!(dataset.numeric_column("effluent_bod").unwrap(), vec![Some(4.2), None, None]);

        let copy = dir.path().join("copy.csv");
        write_csv(&dataset, &copy).unwrap();
        assert_eq!(read_csv(&copy).unwrap(), dataset);
    }
}
