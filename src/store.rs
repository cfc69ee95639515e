//! Relational store for prompts, extraction results, OCR text and upload
//! tracking.

use crate::ai::DocRef;
use crate::history::{HistoryFilter, HistorySection};
use crate::prompts::{canonicalize, parse_stored, PromptSchema};
use crate::table::{stringify, FieldAnswer, Grid};
use crate::warehouse::{column_values, literal, scalar, stage_name, WarehouseClient};
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use tracing::{debug, info};

/// Latest upload first. `NEW_UPLOADS` tables created without `UPLOADED_AT`
/// only support the alphabetical fallback.
const RECENT_STAGE_QUERIES: [&str; 2] = [
    "SELECT STAGE_NAME FROM NEW_UPLOADS WHERE STAGE_NAME IS NOT NULL ORDER BY UPLOADED_AT DESC LIMIT 1",
    "SELECT MAX(STAGE_NAME) AS STAGE_NAME FROM NEW_UPLOADS WHERE STAGE_NAME IS NOT NULL",
];

const SCHEMA_DDL: [&str; 5] = [
    "CREATE TABLE IF NOT EXISTS CLASS_PROMPTS (
  CLASS_NAME STRING PRIMARY KEY,
  PROMPTS VARIANT,
  UPDATED_AT TIMESTAMP_NTZ DEFAULT CURRENT_TIMESTAMP()
)",
    "CREATE TABLE IF NOT EXISTS DOCUMENTS_PROCESSED (
  FILE_URL STRING,
  FILE_REF STRING,
  CLASS_NAME STRING,
  EXTRACTION_RESULT VARIANT,
  PROCESSED_AT TIMESTAMP_NTZ DEFAULT CURRENT_TIMESTAMP()
)",
    "CREATE TABLE IF NOT EXISTS DOCUMENTS_EXTRACTED_FIELDS (
  FILE_URL STRING,
  FILE_REF STRING,
  CLASS_NAME STRING,
  FIELD_NAME STRING,
  FIELD_VALUE VARIANT,
  CONFIDENCE FLOAT
)",
    "CREATE TABLE IF NOT EXISTS NEW_UPLOADS (
  FILE_NAME STRING,
  FILE_REF STRING,
  STAGE_NAME STRING,
  UPLOADED_AT TIMESTAMP_NTZ DEFAULT CURRENT_TIMESTAMP(),
  PROCESSED BOOLEAN DEFAULT FALSE
)",
    "CREATE TABLE IF NOT EXISTS DOCUMENT_OCR (
  FILE_NAME STRING PRIMARY KEY,
  FILE_REF STRING,
  OCR VARIANT,
  SUMMARY STRING,
  CREATED_AT TIMESTAMP_NTZ DEFAULT CURRENT_TIMESTAMP()
)",
];

/// Role, database and schema of the current session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionContext {
    pub role: Option<String>,
    pub database: Option<String>,
    pub schema: Option<String>,
}

/// A file listed in a stage directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageFile {
    pub relative_path: String,
    pub file_url: Option<String>,
}

/// A class with its stored extraction schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassEntry {
    pub class_name: String,
    pub prompts: PromptSchema,
}

/// One row of `DOCUMENTS_PROCESSED`: the raw outcome of an extraction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessedRecord {
    pub file_url: String,
    pub file_ref: String,
    pub class_name: String,
    pub extraction_result: Value,
}

impl ProcessedRecord {
    pub fn new(doc: &DocRef, class_name: &str, extraction_result: Value) -> Self {
        Self {
            file_url: doc.file_url(),
            file_ref: doc.path.clone(),
            class_name: class_name.to_string(),
            extraction_result,
        }
    }
}

/// One row of `DOCUMENTS_EXTRACTED_FIELDS`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldRecord {
    pub file_url: String,
    pub file_ref: String,
    pub class_name: String,
    pub field_name: String,
    pub field_value: Value,
    pub confidence: Option<f64>,
}

impl FieldRecord {
    /// One record per answered field.
    pub fn from_answers(doc: &DocRef, class_name: &str, answers: &FieldAnswer) -> Vec<Self> {
        answers
            .iter()
            .map(|(field_name, value)| Self {
                file_url: doc.file_url(),
                file_ref: doc.path.clone(),
                class_name: class_name.to_string(),
                field_name: field_name.clone(),
                field_value: value.clone(),
                confidence: None,
            })
            .collect()
    }
}

/// One row of `DOCUMENT_OCR`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OcrRecord {
    pub file_name: String,
    pub file_ref: String,
    pub ocr: String,
    pub summary: Option<String>,
}

/// One row of `NEW_UPLOADS`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadRecord {
    pub file_name: String,
    pub file_ref: String,
    pub stage_name: String,
    pub processed: bool,
}

#[async_trait::async_trait]
pub trait DocumentStore: Send + Sync {
    /// Create the tables if they do not exist yet.
    async fn ensure_schema(&self) -> Result<()>;

    async fn session_context(&self) -> Result<SessionContext>;

    /// Stages visible to the session, fully qualified and de-duplicated.
    async fn list_stages(&self) -> Result<Vec<String>>;

    async fn list_stage_files(&self, stage: &str) -> Result<Vec<StageFile>>;

    /// Upload a file into a stage, overwriting a file of the same name.
    async fn put_file(&self, stage: &str, file_name: &str, data: Vec<u8>) -> Result<()>;

    async fn list_classes(&self) -> Result<Vec<ClassEntry>>;

    /// Stored schema of a class, canonicalised. `None` when the class is unknown.
    async fn load_prompts(&self, class_name: &str) -> Result<Option<PromptSchema>>;

    /// Insert or replace the schema of a class.
    async fn save_prompts(&self, class_name: &str, prompts: &PromptSchema) -> Result<()>;

    /// Store `prompts` only if the class has none yet. Returns whether it was inserted.
    async fn seed_prompts_if_missing(&self, class_name: &str, prompts: &PromptSchema)
        -> Result<bool>;

    async fn delete_class(&self, class_name: &str) -> Result<()>;

    async fn record_processed(&self, record: &ProcessedRecord) -> Result<()>;

    /// Append extracted fields. An empty slice is a no-op.
    async fn append_fields(&self, records: &[FieldRecord]) -> Result<()>;

    async fn record_ocr(&self, record: &OcrRecord) -> Result<()>;

    /// Insert or update the upload tracking row keyed by `(file_ref, stage_name)`.
    async fn upsert_upload(&self, record: &UploadRecord) -> Result<()>;

    /// Stage of the most recent upload, without the leading `@`.
    async fn recent_stage(&self) -> Result<Option<String>>;

    /// Rows of one history section.
    async fn query_grid(&self, section: HistorySection, filter: &HistoryFilter) -> Result<Grid>;
}

/// Store backed by warehouse tables.
#[derive(Clone)]
pub struct WarehouseStore {
    warehouse: WarehouseClient,
}

impl WarehouseStore {
    pub fn new(warehouse: WarehouseClient) -> Self {
        Self { warehouse }
    }

    fn merge_prompts_sql(class_name: &str, prompts: &PromptSchema, overwrite: bool) -> String {
        let update = if overwrite {
            "WHEN MATCHED THEN UPDATE SET PROMPTS = s.PROMPTS, UPDATED_AT = CURRENT_TIMESTAMP()\n"
        } else {
            ""
        };
        format!(
            "MERGE INTO CLASS_PROMPTS t
USING (SELECT {} AS CLASS_NAME, PARSE_JSON({}) AS PROMPTS) s
ON t.CLASS_NAME = s.CLASS_NAME
{}WHEN NOT MATCHED THEN INSERT (CLASS_NAME, PROMPTS) VALUES (s.CLASS_NAME, s.PROMPTS)",
            literal(class_name),
            literal(&prompts.to_compact_json()),
            update
        )
    }

    fn insert_fields_sql(records: &[FieldRecord]) -> String {
        let rows = records
            .iter()
            .map(|r| {
                format!(
                    "({}, {}, {}, {}, {}, {})",
                    literal(&r.file_url),
                    literal(&r.file_ref),
                    literal(&r.class_name),
                    literal(&r.field_name),
                    literal(&r.field_value.to_string()),
                    r.confidence
                        .filter(|c| c.is_finite())
                        .map(|c| c.to_string())
                        .unwrap_or_else(|| "NULL".to_string())
                )
            })
            .collect::<Vec<_>>()
            .join(",\n  ");
        format!(
            "INSERT INTO DOCUMENTS_EXTRACTED_FIELDS (FILE_URL, FILE_REF, CLASS_NAME, FIELD_NAME, FIELD_VALUE, CONFIDENCE)
SELECT column1, column2, column3, column4, PARSE_JSON(column5), column6
FROM VALUES
  {}",
            rows
        )
    }

    fn upsert_upload_sql(record: &UploadRecord) -> String {
        format!(
            "MERGE INTO NEW_UPLOADS t
USING (SELECT {name} AS FILE_NAME, {file_ref} AS FILE_REF, {stage} AS STAGE_NAME, {processed} AS PROCESSED) s
ON t.FILE_REF = s.FILE_REF AND t.STAGE_NAME = s.STAGE_NAME
WHEN MATCHED THEN UPDATE SET PROCESSED = s.PROCESSED, FILE_NAME = s.FILE_NAME
WHEN NOT MATCHED THEN INSERT (FILE_NAME, FILE_REF, STAGE_NAME, PROCESSED)
  VALUES (s.FILE_NAME, s.FILE_REF, s.STAGE_NAME, s.PROCESSED)",
            name = literal(&record.file_name),
            file_ref = literal(&record.file_ref),
            stage = literal(&record.stage_name),
            processed = if record.processed { "TRUE" } else { "FALSE" }
        )
    }

    /// `SHOW STAGES` in one scope; failures read as an empty list.
    async fn show_stages(&self, scope: &str) -> Vec<String> {
        let sql = format!("SHOW STAGES {}", scope);
        match self.warehouse.query(&sql).await {
            Ok(grid) => qualified_stage_names(&grid),
            Err(e) => {
                debug!("{} failed: {:#}", sql, e);
                Vec::new()
            }
        }
    }
}

#[async_trait::async_trait]
impl DocumentStore for WarehouseStore {
    async fn ensure_schema(&self) -> Result<()> {
        for ddl in SCHEMA_DDL {
            self.warehouse
                .execute(ddl)
                .await
                .context("Failed to create tables")?;
        }
        info!("Warehouse tables ready");
        Ok(())
    }

    async fn session_context(&self) -> Result<SessionContext> {
        let grid = self
            .warehouse
            .query("SELECT CURRENT_ROLE() AS ROLE, CURRENT_DATABASE() AS DB, CURRENT_SCHEMA() AS SC")
            .await?;
        let text = |col: &str| {
            scalar(&grid, col)
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };
        Ok(SessionContext {
            role: text("ROLE"),
            database: text("DB"),
            schema: text("SC"),
        })
    }

    async fn list_stages(&self) -> Result<Vec<String>> {
        let ctx = self.session_context().await.unwrap_or_default();

        let mut stages = Vec::new();
        if let (Some(db), Some(sc)) = (&ctx.database, &ctx.schema) {
            stages.extend(self.show_stages(&format!("IN SCHEMA {}.{}", db, sc)).await);
        }
        if let Some(db) = &ctx.database {
            stages.extend(self.show_stages(&format!("IN DATABASE {}", db)).await);
        }
        stages.extend(self.show_stages("IN ACCOUNT").await);

        // Stages that received uploads may not be visible to SHOW.
        match self
            .warehouse
            .query("SELECT DISTINCT STAGE_NAME FROM NEW_UPLOADS WHERE STAGE_NAME IS NOT NULL")
            .await
        {
            Ok(grid) => stages.extend(
                column_values(&grid, "STAGE_NAME")
                    .into_iter()
                    .filter_map(Value::as_str)
                    .map(|s| s.trim_start_matches('@').to_string()),
            ),
            Err(e) => debug!("Upload stage lookup failed: {:#}", e),
        }

        Ok(dedupe_sorted(stages))
    }

    async fn list_stage_files(&self, stage: &str) -> Result<Vec<StageFile>> {
        let stage = stage_name(stage)?;
        let sql = format!(
            "SELECT RELATIVE_PATH, FILE_URL FROM DIRECTORY(@{}) ORDER BY RELATIVE_PATH",
            stage
        );
        let grid = self
            .warehouse
            .query(&sql)
            .await
            .with_context(|| format!("Failed to list files of @{}", stage))?;
        let path_idx = grid.column_index("RELATIVE_PATH");
        let url_idx = grid.column_index("FILE_URL");
        Ok(grid
            .rows
            .iter()
            .filter_map(|row| {
                let relative_path = path_idx
                    .and_then(|i| row.get(i))
                    .and_then(Value::as_str)?
                    .to_string();
                let file_url = url_idx
                    .and_then(|i| row.get(i))
                    .and_then(Value::as_str)
                    .map(str::to_string);
                Some(StageFile {
                    relative_path,
                    file_url,
                })
            })
            .collect())
    }

    async fn put_file(&self, stage: &str, file_name: &str, data: Vec<u8>) -> Result<()> {
        self.warehouse.upload(stage, file_name, data).await
    }

    async fn list_classes(&self) -> Result<Vec<ClassEntry>> {
        let grid = self
            .warehouse
            .query("SELECT CLASS_NAME, PROMPTS FROM CLASS_PROMPTS ORDER BY CLASS_NAME")
            .await?;
        Ok(grid
            .rows
            .iter()
            .filter_map(|row| {
                let class_name = row.first().and_then(Value::as_str)?.to_string();
                let prompts = stored_prompts(row.get(1).unwrap_or(&Value::Null), &class_name);
                Some(ClassEntry {
                    class_name,
                    prompts,
                })
            })
            .collect())
    }

    async fn load_prompts(&self, class_name: &str) -> Result<Option<PromptSchema>> {
        let sql = format!(
            "SELECT PROMPTS FROM CLASS_PROMPTS WHERE CLASS_NAME = {}",
            literal(class_name)
        );
        let grid = self.warehouse.query(&sql).await?;
        Ok(grid
            .rows
            .first()
            .map(|row| stored_prompts(row.first().unwrap_or(&Value::Null), class_name)))
    }

    async fn save_prompts(&self, class_name: &str, prompts: &PromptSchema) -> Result<()> {
        self.warehouse
            .execute(&Self::merge_prompts_sql(class_name, prompts, true))
            .await
            .with_context(|| format!("Failed to save prompts for {}", class_name))?;
        info!("Saved prompts for class {}", class_name);
        Ok(())
    }

    async fn seed_prompts_if_missing(
        &self,
        class_name: &str,
        prompts: &PromptSchema,
    ) -> Result<bool> {
        if self.load_prompts(class_name).await?.is_some() {
            return Ok(false);
        }
        self.warehouse
            .execute(&Self::merge_prompts_sql(class_name, prompts, false))
            .await?;
        info!("Seeded prompts for new class {}", class_name);
        Ok(true)
    }

    async fn delete_class(&self, class_name: &str) -> Result<()> {
        let sql = format!(
            "DELETE FROM CLASS_PROMPTS WHERE CLASS_NAME = {}",
            literal(class_name)
        );
        self.warehouse.execute(&sql).await
    }

    async fn record_processed(&self, record: &ProcessedRecord) -> Result<()> {
        let sql = format!(
            "INSERT INTO DOCUMENTS_PROCESSED (FILE_URL, FILE_REF, CLASS_NAME, EXTRACTION_RESULT)
SELECT {}, {}, {}, PARSE_JSON({})",
            literal(&record.file_url),
            literal(&record.file_ref),
            literal(&record.class_name),
            literal(&record.extraction_result.to_string())
        );
        self.warehouse.execute(&sql).await
    }

    async fn append_fields(&self, records: &[FieldRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        self.warehouse
            .execute(&Self::insert_fields_sql(records))
            .await
    }

    async fn record_ocr(&self, record: &OcrRecord) -> Result<()> {
        let summary = record
            .summary
            .as_deref()
            .map(literal)
            .unwrap_or_else(|| "NULL".to_string());
        let sql = format!(
            "INSERT INTO DOCUMENT_OCR (FILE_NAME, FILE_REF, OCR, SUMMARY)
SELECT {}, {}, TO_VARIANT({}), {}",
            literal(&record.file_name),
            literal(&record.file_ref),
            literal(&record.ocr),
            summary
        );
        self.warehouse.execute(&sql).await
    }

    async fn upsert_upload(&self, record: &UploadRecord) -> Result<()> {
        self.warehouse
            .execute(&Self::upsert_upload_sql(record))
            .await
    }

    async fn recent_stage(&self) -> Result<Option<String>> {
        let grid = first_answer(&RECENT_STAGE_QUERIES, |sql| {
            let warehouse = self.warehouse.clone();
            async move { warehouse.query(&sql).await }
        })
        .await?;
        Ok(stage_cell(&grid))
    }

    async fn query_grid(&self, section: HistorySection, filter: &HistoryFilter) -> Result<Grid> {
        self.warehouse.query(&section.sql(filter)).await
    }
}

/// Run `queries` in order and return the first that succeeds.
async fn first_answer<F, Fut>(queries: &[&str], mut run: F) -> Result<Grid>
where
    F: FnMut(String) -> Fut,
    Fut: Future<Output = Result<Grid>>,
{
    let mut last_error = None;
    for sql in queries {
        match run(sql.to_string()).await {
            Ok(grid) => return Ok(grid),
            Err(e) => {
                debug!("Query failed, trying next form: {:#}", e);
                last_error = Some(e);
            }
        }
    }
    Err(last_error.unwrap_or_else(|| anyhow!("No query to run")))
}

fn stage_cell(grid: &Grid) -> Option<String> {
    scalar(grid, "STAGE_NAME")
        .and_then(Value::as_str)
        .map(|s| s.trim_start_matches('@').to_string())
        .filter(|s| !s.is_empty())
}

/// Decode a stored `PROMPTS` cell. Text is parsed as JSON; anything unusable
/// falls back to the generic question.
fn stored_prompts(cell: &Value, class_name: &str) -> PromptSchema {
    match cell {
        Value::String(text) => parse_stored(text, Some(class_name)),
        other => canonicalize(other, Some(class_name)),
    }
}

/// `DB.SCHEMA.NAME` for each row of a `SHOW STAGES` result.
fn qualified_stage_names(grid: &Grid) -> Vec<String> {
    let (Some(name), Some(db), Some(sc)) = (
        grid.column_index("name"),
        grid.column_index("database_name"),
        grid.column_index("schema_name"),
    ) else {
        return Vec::new();
    };
    grid.rows
        .iter()
        .filter_map(|row| {
            let part = |i: usize| row.get(i).map(stringify).filter(|s| !s.is_empty());
            Some(format!("{}.{}.{}", part(db)?, part(sc)?, part(name)?))
        })
        .collect()
}

fn dedupe_sorted(mut stages: Vec<String>) -> Vec<String> {
    stages.retain(|s| !s.is_empty());
    stages.sort();
    stages.dedup();
    stages
}
