//! AI service collaborator: classification, field extraction, layout OCR and
//! summaries.
//!
//! The trait is the seam the batch coordinator and the interactive pipeline
//! depend on. [`WarehouseAi`] implements it with SQL function calls executed
//! by the warehouse.

use crate::prompts::{canonicalize, PromptSchema};
use crate::table::FieldAnswer;
use crate::warehouse::{literal, scalar, stage_name, WarehouseClient};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

/// Longest text passed to the summariser.
const SUMMARY_INPUT_CHARS: usize = 6000;

/// Question used to classify an unknown document.
const CLASSIFY_QUESTION: &str = "How would you classify this document?";

/// A file inside a named stage.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DocRef {
    pub stage: String,
    pub path: String,
}

impl DocRef {
    pub fn new(stage: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            path: path.into(),
        }
    }

    /// `@STAGE/path` form stored alongside results.
    pub fn file_url(&self) -> String {
        format!("@{}/{}", self.stage, self.path)
    }
}

/// Result of one extraction call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractOutput {
    /// Full payload as returned by the service.
    pub raw: Value,
    /// Field answers found under the payload's `response` key.
    pub answers: FieldAnswer,
}

impl ExtractOutput {
    /// Split a raw payload into answers. JSON text is parsed first; anything
    /// unusable yields no answers.
    pub fn from_raw(raw: Value) -> Self {
        let raw = match raw {
            Value::String(text) => serde_json::from_str(&text).unwrap_or(Value::String(text)),
            other => other,
        };
        let answers = raw
            .get("response")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        Self { raw, answers }
    }
}

#[async_trait::async_trait]
pub trait AiService: Send + Sync {
    /// Name of the document's class.
    async fn classify(&self, doc: &DocRef) -> Result<String>;

    /// Answer each question of `prompts` for the document.
    async fn extract(&self, doc: &DocRef, prompts: &PromptSchema) -> Result<ExtractOutput>;

    /// Layout-mode OCR text of the document.
    async fn parse_layout(&self, doc: &DocRef) -> Result<String>;

    /// Short summary of a text.
    async fn summarize(&self, text: &str) -> Result<String>;

    /// Seed an extraction schema for a newly seen class.
    async fn generate_prompts(&self, class_name: &str) -> Result<PromptSchema>;

    /// Extract every file of a stage in one call: `(relative path, output)`.
    async fn extract_stage(
        &self,
        stage: &str,
        prompts: &PromptSchema,
    ) -> Result<Vec<(String, ExtractOutput)>>;

    /// Query text behind [`AiService::classify`], shown when classification fails.
    fn classify_query(&self, _doc: &DocRef) -> Option<String> {
        None
    }
}

/// AI service backed by warehouse SQL functions.
#[derive(Clone)]
pub struct WarehouseAi {
    warehouse: WarehouseClient,
    model: String,
}

impl WarehouseAi {
    pub fn new(warehouse: WarehouseClient, model: impl Into<String>) -> Self {
        Self {
            warehouse,
            model: model.into(),
        }
    }

    fn to_file(doc: &DocRef) -> String {
        format!(
            "TO_FILE({}, {})",
            literal(&format!("@{}", doc.stage)),
            literal(&doc.path)
        )
    }

    fn classify_sql(doc: &DocRef) -> String {
        format!(
            "SELECT AI_EXTRACT(\n  file => {},\n  responseFormat => {{'document_class': '{}'}}\n):response:document_class::STRING AS CLASS_NAME",
            Self::to_file(doc),
            CLASSIFY_QUESTION
        )
    }

    fn extract_sql(doc: &DocRef, prompts: &PromptSchema) -> String {
        format!(
            "SELECT AI_EXTRACT(\n  file => {},\n  responseFormat => PARSE_JSON({})\n) AS R",
            Self::to_file(doc),
            literal(&prompts.to_compact_json())
        )
    }

    fn complete_sql(&self, prompt: &str) -> String {
        format!(
            "SELECT AI_COMPLETE(model => {}, prompt => {}) AS S",
            literal(&self.model),
            literal(prompt)
        )
    }

    async fn complete(&self, prompt: &str) -> Result<String> {
        let grid = self.warehouse.query(&self.complete_sql(prompt)).await?;
        Ok(match scalar(&grid, "S") {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => String::new(),
        })
    }
}

#[async_trait::async_trait]
impl AiService for WarehouseAi {
    async fn classify(&self, doc: &DocRef) -> Result<String> {
        let grid = self.warehouse.query(&Self::classify_sql(doc)).await?;
        let class_name = scalar(&grid, "CLASS_NAME")
            .and_then(Value::as_str)
            .map(str::trim)
            .unwrap_or_default();
        if class_name.is_empty() {
            anyhow::bail!("No class returned for {}", doc.file_url());
        }
        Ok(class_name.to_string())
    }

    async fn extract(&self, doc: &DocRef, prompts: &PromptSchema) -> Result<ExtractOutput> {
        let grid = self
            .warehouse
            .query(&Self::extract_sql(doc, prompts))
            .await
            .with_context(|| format!("Extraction failed for {}", doc.file_url()))?;
        let raw = scalar(&grid, "R").cloned().unwrap_or(Value::Null);
        let output = ExtractOutput::from_raw(raw);
        debug!(
            "Extracted {} fields from {}",
            output.answers.len(),
            doc.file_url()
        );
        Ok(output)
    }

    async fn parse_layout(&self, doc: &DocRef) -> Result<String> {
        let sql = format!(
            "SELECT TO_VARCHAR(SNOWFLAKE.CORTEX.PARSE_DOCUMENT({}, {}, {{'mode':'layout'}})) AS OCR",
            literal(&format!("@{}", doc.stage)),
            literal(&doc.path)
        );
        let grid = self.warehouse.query(&sql).await?;
        let payload = match scalar(&grid, "OCR") {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Null) | None => String::new(),
            Some(other) => other.to_string(),
        };
        Ok(layout_content(&payload))
    }

    async fn summarize(&self, text: &str) -> Result<String> {
        let head: String = text.chars().take(SUMMARY_INPUT_CHARS).collect();
        let prompt = format!(
            "Summarize what this document is and the key facts in 2–3 sentences.\n\n---\n{}",
            head
        );
        self.complete(&prompt).await
    }

    async fn generate_prompts(&self, class_name: &str) -> Result<PromptSchema> {
        let prompt = format!(
            "Return a flat JSON object where each key is a field name and each value is a question relevant to extracting fields for the given document class. Document class = '{}'. FORMAT example (do not deviate) = {{\"name\": \"What is the last name of the employee?\", \"address\": \"What is the address of the employee?\"}}",
            class_name
        );
        let response = self.complete(&prompt).await?;
        let raw = parse_model_json(&response).unwrap_or(Value::Null);
        Ok(canonicalize(&raw, Some(class_name)))
    }

    async fn extract_stage(
        &self,
        stage: &str,
        prompts: &PromptSchema,
    ) -> Result<Vec<(String, ExtractOutput)>> {
        let stage = stage_name(stage)?;
        let sql = format!(
            "SELECT RELATIVE_PATH,\n       AI_EXTRACT(file => TO_FILE('@{stage}', RELATIVE_PATH),\n                  responseFormat => PARSE_JSON({prompts})) AS AI_EXTRACT_RESULT\nFROM DIRECTORY(@{stage})",
            stage = stage,
            prompts = literal(&prompts.to_compact_json())
        );
        let grid = self.warehouse.query(&sql).await?;

        let path_idx = grid
            .column_index("RELATIVE_PATH")
            .context("Stage sweep returned no RELATIVE_PATH column")?;
        let result_idx = grid.column_index("AI_EXTRACT_RESULT");
        Ok(grid
            .rows
            .iter()
            .filter_map(|row| {
                let path = row.get(path_idx).and_then(Value::as_str)?.to_string();
                let raw = result_idx
                    .and_then(|i| row.get(i))
                    .cloned()
                    .unwrap_or(Value::Null);
                Some((path, ExtractOutput::from_raw(raw)))
            })
            .collect())
    }

    fn classify_query(&self, doc: &DocRef) -> Option<String> {
        Some(Self::classify_sql(doc))
    }
}

/// OCR payloads are JSON with a `content` key; fall back to the raw text.
pub fn layout_content(payload: &str) -> String {
    serde_json::from_str::<Value>(payload)
        .ok()
        .and_then(|v| v.get("content").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| payload.to_string())
}

/// Pull a JSON value out of a model response, tolerating markdown fences.
fn parse_model_json(response: &str) -> Result<Value> {
    let json_str = if response.contains("```json") {
        response
            .split("```json")
            .nth(1)
            .and_then(|s| s.split("```").next())
            .unwrap_or(response)
            .trim()
    } else if response.contains("```") {
        response.split("```").nth(1).unwrap_or(response).trim()
    } else {
        response.trim()
    };

    serde_json::from_str(json_str).context(format!(
        "Invalid JSON from model: {}",
        &json_str.chars().take(200).collect::<String>()
    ))
}
