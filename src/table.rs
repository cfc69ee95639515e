//! Wide result table with columns discovered at runtime.
//!
//! Rows are keyed by file reference and created up front in input order.
//! Columns are added the first time any row reports a field with that name,
//! so the column set only ever grows during a run.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};

/// Extracted answers for one document: field name → value.
pub type FieldAnswer = serde_json::Map<String, Value>;

/// Name of the leading key column in rendered tables.
pub const KEY_COLUMN: &str = "file";

/// Incrementally built table of per-document answers.
#[derive(Debug, Clone, Default)]
pub struct ResultTable {
    keys: Vec<String>,
    index: HashMap<String, usize>,
    columns: Vec<String>,
    known: HashSet<String>,
    cells: Vec<HashMap<String, Value>>,
}

/// Column ordering used when materialising a table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnOrder {
    /// Order in which columns were first seen.
    #[default]
    Discovery,
    /// Alphabetical, for deterministic output.
    Sorted,
}

impl ResultTable {
    /// Create one empty row per key. Duplicate keys collapse onto the first occurrence.
    pub fn new<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut table = Self::default();
        for key in keys {
            table.ensure_row(key.into());
        }
        table
    }

    fn ensure_row(&mut self, key: String) -> usize {
        if let Some(&idx) = self.index.get(&key) {
            return idx;
        }
        let idx = self.keys.len();
        self.index.insert(key.clone(), idx);
        self.keys.push(key);
        self.cells.push(HashMap::new());
        idx
    }

    /// Merge one document's answers into its row.
    ///
    /// New field names become columns (sorted among themselves, appended after
    /// existing columns). Fields absent from `answer` keep their current value.
    /// Returns the columns added by this merge.
    pub fn merge(&mut self, key: &str, answer: &FieldAnswer) -> Vec<String> {
        let mut added: Vec<String> = answer
            .keys()
            .filter(|name| !self.known.contains(name.as_str()))
            .cloned()
            .collect();
        added.sort();

        for name in &added {
            self.known.insert(name.clone());
            self.columns.push(name.clone());
        }

        let idx = self.ensure_row(key.to_string());
        let row = &mut self.cells[idx];
        for (name, value) in answer {
            row.insert(name.clone(), value.clone());
        }

        added
    }

    /// Row keys in creation order.
    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    /// Dynamic columns in discovery order (the key column is not included).
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Values recorded for a row, if the row exists.
    #[cfg(test)]
    pub fn row(&self, key: &str) -> Option<&HashMap<String, Value>> {
        self.index.get(key).map(|&idx| &self.cells[idx])
    }

    #[cfg(test)]
    pub fn cell(&self, key: &str, column: &str) -> Option<&Value> {
        self.row(key).and_then(|row| row.get(column))
    }

    /// Materialise the table as a grid with the key column first.
    /// Cells a row never reported are `Null`.
    pub fn to_grid(&self, order: ColumnOrder) -> Grid {
        let mut columns = self.columns.clone();
        if order == ColumnOrder::Sorted {
            columns.sort();
        }

        let rows = self
            .keys
            .iter()
            .zip(&self.cells)
            .map(|(key, cells)| {
                let mut row = Vec::with_capacity(columns.len() + 1);
                row.push(Value::String(key.clone()));
                row.extend(
                    columns
                        .iter()
                        .map(|c| cells.get(c).cloned().unwrap_or(Value::Null)),
                );
                row
            })
            .collect();

        let mut header = Vec::with_capacity(columns.len() + 1);
        header.push(KEY_COLUMN.to_string());
        for column in &columns {
            let name = header_name(column, &header, &columns);
            header.push(name);
        }

        Grid {
            columns: header,
            rows,
        }
    }
}

/// Header for an answer column. A field that shadows the key column gets the
/// first free `<name>_<n>` so row identity survives export.
fn header_name(column: &str, header: &[String], columns: &[String]) -> String {
    if !column.eq_ignore_ascii_case(KEY_COLUMN) {
        return column.to_string();
    }
    let taken = |name: &str| {
        header
            .iter()
            .chain(columns)
            .any(|c| c.eq_ignore_ascii_case(name))
    };
    let mut n = 1;
    loop {
        let name = format!("{}_{}", column, n);
        if !taken(&name) {
            return name;
        }
        n += 1;
    }
}

/// Plain tabular data: a header plus rows of JSON values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Grid {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl Grid {
    #[cfg(test)]
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Index of a column by case-insensitive name.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(name))
    }

    /// Rows as `column → value` objects, preserving column order.
    pub fn to_records(&self) -> Vec<serde_json::Map<String, Value>> {
        self.rows
            .iter()
            .map(|row| {
                self.columns
                    .iter()
                    .cloned()
                    .zip(row.iter().cloned().chain(std::iter::repeat(Value::Null)))
                    .collect()
            })
            .collect()
    }

    /// Every cell rendered as display text.
    pub fn to_display(&self) -> Vec<Vec<String>> {
        self.rows
            .iter()
            .map(|row| row.iter().map(stringify).collect())
            .collect()
    }
}

/// Render a heterogeneous value as a table cell.
///
/// Null is empty, strings are verbatim, lists and maps become compact JSON.
pub fn stringify(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Array(_) | Value::Object(_) => value.to_string(),
    }
}

/// Placeholder shown instead of binary payloads.
pub fn bytes_placeholder(len: usize) -> String {
    format!("<{} bytes>", len)
}
