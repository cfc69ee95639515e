//! CSV and JSON downloads of tabular results.

use crate::table::{stringify, Grid};
use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    #[default]
    Csv,
    Json,
}

impl ExportFormat {
    pub fn content_type(self) -> &'static str {
        match self {
            ExportFormat::Csv => "text/csv",
            ExportFormat::Json => "application/json",
        }
    }

    pub fn file_name(self, stem: &str) -> String {
        match self {
            ExportFormat::Csv => format!("{}.csv", stem),
            ExportFormat::Json => format!("{}.json", stem),
        }
    }
}

/// Render a grid in the requested format.
pub fn render(grid: &Grid, format: ExportFormat) -> Result<String> {
    match format {
        ExportFormat::Csv => to_csv(grid),
        ExportFormat::Json => to_json(grid),
    }
}

/// Header row followed by stringified cells.
pub fn to_csv(grid: &Grid) -> Result<String> {
    let mut writer = csv::WriterBuilder::new()
        .flexible(true)
        .from_writer(Vec::new());

    writer
        .write_record(&grid.columns)
        .context("Failed to write CSV header")?;
    for row in grid.to_display() {
        writer.write_record(&row).context("Failed to write CSV row")?;
    }

    let bytes = writer
        .into_inner()
        .map_err(|e| anyhow::anyhow!("Failed to flush CSV: {}", e))?;
    String::from_utf8(bytes).context("CSV output was not UTF-8")
}

/// Array of records with every cell stringified.
pub fn to_json(grid: &Grid) -> Result<String> {
    let records: Vec<Value> = grid
        .to_records()
        .into_iter()
        .map(|record| {
            Value::Object(
                record
                    .into_iter()
                    .map(|(k, v)| (k, Value::String(stringify(&v))))
                    .collect(),
            )
        })
        .collect();
    serde_json::to_string_pretty(&records).context("Failed to serialize JSON export")
}
