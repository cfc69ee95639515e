//! Queries behind the history view: past runs across documents and classes.

use crate::warehouse::{escape, literal};
use serde::{Deserialize, Serialize};

/// Filters shared by every history section.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryFilter {
    #[serde(default)]
    pub classes: Vec<String>,
    /// Substring of the stage name (case-insensitive).
    #[serde(default)]
    pub stage: Option<String>,
    /// Substring of the file reference (case-insensitive).
    #[serde(default)]
    pub file: Option<String>,
}

impl HistoryFilter {
    /// Build from the comma-separated query-string form.
    pub fn from_parts(classes: Option<&str>, stage: Option<&str>, file: Option<&str>) -> Self {
        let clean = |s: Option<&str>| s.map(str::trim).filter(|s| !s.is_empty()).map(str::to_string);
        Self {
            classes: classes
                .unwrap_or_default()
                .split(',')
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .map(str::to_string)
                .collect(),
            stage: clean(stage),
            file: clean(file),
        }
    }

    /// `WHERE` body over the `def` alias of the extracted-fields table.
    pub fn where_clause(&self) -> String {
        let mut parts = Vec::new();

        if !self.classes.is_empty() {
            let in_list = self
                .classes
                .iter()
                .map(|c| literal(c))
                .collect::<Vec<_>>()
                .join(",");
            parts.push(format!("def.CLASS_NAME IN ({})", in_list));
        }
        if let Some(stage) = &self.stage {
            parts.push(format!(
                "{} ILIKE '%{}%'",
                stage_expr("def.FILE_URL"),
                escape(stage)
            ));
        }
        if let Some(file) = &self.file {
            parts.push(format!(
                "LOWER(def.FILE_REF) LIKE '%{}%'",
                escape(&file.to_lowercase())
            ));
        }

        if parts.is_empty() {
            "1=1".to_string()
        } else {
            parts.join(" AND ")
        }
    }

    /// Same predicate evaluated on a single extracted-field row.
    #[cfg(test)]
    pub fn matches(&self, class_name: &str, file_url: &str, file_ref: &str) -> bool {
        let class_ok = self.classes.is_empty() || self.classes.iter().any(|c| c == class_name);
        let stage_ok = self.stage.as_ref().map_or(true, |s| {
            stage_of(file_url)
                .to_lowercase()
                .contains(&s.to_lowercase())
        });
        let file_ok = self
            .file
            .as_ref()
            .map_or(true, |f| file_ref.to_lowercase().contains(&f.to_lowercase()));
        class_ok && stage_ok && file_ok
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistorySection {
    /// Distinct documents per class.
    Classes,
    /// One row per file and class.
    Documents,
    /// One row per extracted field.
    Fields,
}

impl HistorySection {
    pub const ALL: [HistorySection; 3] = [
        HistorySection::Classes,
        HistorySection::Documents,
        HistorySection::Fields,
    ];

    pub fn export_stem(self) -> &'static str {
        match self {
            HistorySection::Classes => "history_class_summary",
            HistorySection::Documents => "history_documents",
            HistorySection::Fields => "history_fields",
        }
    }

    pub fn sql(self, filter: &HistoryFilter) -> String {
        match self {
            HistorySection::Classes => class_summary_sql(filter),
            HistorySection::Documents => documents_sql(filter),
            HistorySection::Fields => fields_sql(filter),
        }
    }
}

/// Stage part of an `@STAGE/path` URL, without the leading `@`.
#[cfg(test)]
pub fn stage_of(file_url: &str) -> &str {
    let head = file_url.split('/').next().unwrap_or_default();
    head.strip_prefix('@').unwrap_or(head)
}

fn stage_expr(column: &str) -> String {
    format!(
        "REGEXP_REPLACE(SPLIT_PART(COALESCE({}, ''), '/', 1), '^@', '')",
        column
    )
}

fn class_summary_sql(filter: &HistoryFilter) -> String {
    format!(
        "WITH def AS (
  SELECT FILE_URL, FILE_REF, CLASS_NAME
  FROM DOCUMENTS_EXTRACTED_FIELDS
)
SELECT CLASS_NAME, COUNT(DISTINCT FILE_REF) AS DOCS
FROM def
WHERE {}
GROUP BY CLASS_NAME
ORDER BY DOCS DESC, CLASS_NAME",
        filter.where_clause()
    )
}

fn documents_sql(filter: &HistoryFilter) -> String {
    format!(
        "WITH def AS (
  SELECT FILE_URL, FILE_REF, CLASS_NAME
  FROM DOCUMENTS_EXTRACTED_FIELDS
)
SELECT
  def.FILE_REF,
  def.CLASS_NAME,
  {stage} AS STAGE,
  (SELECT COUNT(*) FROM DOCUMENTS_EXTRACTED_FIELDS d2
    WHERE d2.FILE_REF = def.FILE_REF AND d2.CLASS_NAME = def.CLASS_NAME) AS FIELDS_EXTRACTED,
  IFF(EXISTS(SELECT 1 FROM DOCUMENT_OCR x WHERE x.FILE_REF = def.FILE_URL OR x.FILE_NAME = def.FILE_REF), TRUE, FALSE) AS HAS_OCR
FROM def
WHERE {filter}
QUALIFY ROW_NUMBER() OVER (PARTITION BY def.FILE_REF, def.CLASS_NAME ORDER BY def.FILE_REF) = 1
ORDER BY def.FILE_REF, def.CLASS_NAME",
        stage = stage_expr("def.FILE_URL"),
        filter = filter.where_clause()
    )
}

fn fields_sql(filter: &HistoryFilter) -> String {
    format!(
        "SELECT
  FILE_REF,
  {} AS STAGE,
  CLASS_NAME,
  FIELD_NAME,
  TO_JSON(FIELD_VALUE) AS FIELD_VALUE
FROM DOCUMENTS_EXTRACTED_FIELDS def
WHERE {}
ORDER BY FILE_REF, CLASS_NAME, FIELD_NAME",
        stage_expr("FILE_URL"),
        filter.where_clause()
    )
}
