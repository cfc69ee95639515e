//! Interactive run for one uploaded document.
//!
//! Upload, classify, make sure the class has prompts, extract, and collect
//! the OCR text and summary that were computed in the background. Any error
//! here ends the run and is reported to the caller.

use crate::ai::{AiService, DocRef};
use crate::preview::{inspect, is_supported, Preview};
use crate::prompts::PromptSchema;
use crate::retry::{run_with_policy, RetryError, RetryPolicies};
use crate::store::{DocumentStore, FieldRecord, OcrRecord, ProcessedRecord, UploadRecord};
use crate::table::FieldAnswer;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Unsupported file type: {0}")]
    UnsupportedFile(String),

    #[error("No file uploaded")]
    EmptyUpload,

    #[error("Upload to @{stage} failed: {message}")]
    Upload { stage: String, message: String },

    #[error("Classification failed after {} attempts. Last error: {}", .source.attempts, .source.last_error)]
    Classification {
        #[source]
        source: RetryError,
        /// Query that was being retried, when the service exposes it.
        query: Option<String>,
    },

    #[error("Failed to generate/load prompts: {0}")]
    Prompts(String),

    #[error("Failed to persist results: {0}")]
    Persist(String),
}

/// Everything produced by one interactive run.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineRun {
    pub id: String,
    pub stage: String,
    pub file_name: String,
    pub file_url: String,
    pub preview: Preview,
    pub class_name: String,
    pub prompts: PromptSchema,
    /// True when this run seeded the class prompts.
    pub prompts_seeded: bool,
    pub answers: FieldAnswer,
    /// `{"answers": ...}` or `{"error": ...}`, as persisted.
    pub extraction: Value,
    pub ocr_text: String,
    /// OCR text with runs of spaces turned into line breaks.
    pub ocr_display: String,
    pub summary: Option<String>,
    pub steps: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct Pipeline {
    ai: Arc<dyn AiService>,
    store: Arc<dyn DocumentStore>,
    retry: RetryPolicies,
    ocr_timeout: Duration,
}

/// Aborts the background task if the run ends early.
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

impl Pipeline {
    pub fn new(
        ai: Arc<dyn AiService>,
        store: Arc<dyn DocumentStore>,
        retry: RetryPolicies,
        ocr_timeout: Duration,
    ) -> Self {
        Self {
            ai,
            store,
            retry,
            ocr_timeout,
        }
    }

    pub async fn run(
        &self,
        stage: &str,
        file_name: &str,
        data: Vec<u8>,
    ) -> Result<PipelineRun, PipelineError> {
        let started_at = Utc::now();
        let file_name = base_name(file_name).to_string();
        if data.is_empty() {
            return Err(PipelineError::EmptyUpload);
        }
        if !is_supported(&file_name) {
            return Err(PipelineError::UnsupportedFile(file_name));
        }

        let mut steps = Vec::new();
        let preview = inspect(&file_name, &data);
        let doc = DocRef::new(stage, &file_name);
        let file_url = doc.file_url();

        self.store
            .put_file(stage, &file_name, data)
            .await
            .map_err(|e| PipelineError::Upload {
                stage: stage.to_string(),
                message: format!("{:#}", e),
            })?;
        self.store
            .upsert_upload(&self.upload_record(&doc, false))
            .await
            .map_err(|e| PipelineError::Upload {
                stage: stage.to_string(),
                message: format!("{:#}", e),
            })?;
        steps.push(format!("Uploaded {} to @{}", file_name, stage));

        let ocr_task = AbortOnDrop(self.spawn_ocr(doc.clone()));
        steps.push("OCR + summary started in parallel".to_string());

        // Classify. The stage directory may lag behind the upload.
        let class_name = match run_with_policy("classify", &self.retry.classify, |_| {
            self.ai.classify(&doc)
        })
        .await
        {
            Ok(class_name) => class_name,
            Err(source) => {
                for (i, failure) in source.failures.iter().enumerate() {
                    steps.push(format!("Classify attempt {} failed: {}", i + 1, failure));
                }
                return Err(PipelineError::Classification {
                    query: self.ai.classify_query(&doc),
                    source,
                });
            }
        };
        steps.push(format!("Classified as {}", class_name));

        let (prompts, prompts_seeded) = self.ensure_prompts(&class_name).await?;
        steps.push(if prompts_seeded {
            format!("Seeded prompts for new class {}", class_name)
        } else {
            "Prompts ready".to_string()
        });

        let (answers, extraction) = match run_with_policy("extract", &self.retry.extract, |_| {
            self.ai.extract(&doc, &prompts)
        })
        .await
        {
            Ok(output) => {
                steps.push(format!("Extracted {} fields", output.answers.len()));
                let answers = output.answers;
                let extraction = json!({ "answers": answers });
                (answers, extraction)
            }
            Err(e) => {
                warn!("Extraction failed for {}: {}", file_url, e);
                steps.push(format!("Extraction failed: {}", e.last_error));
                (FieldAnswer::new(), json!({ "error": e.last_error }))
            }
        };

        let (ocr_text, summary) = self.await_ocr(ocr_task).await;
        steps.push("OCR & summary complete".to_string());

        self.persist(&doc, &class_name, &answers, &extraction, &ocr_text, &summary)
            .await
            .map_err(|e| PipelineError::Persist(format!("{:#}", e)))?;
        steps.push("Results saved".to_string());

        info!(
            "Pipeline complete for {}: class {}, {} fields",
            file_url,
            class_name,
            answers.len()
        );

        Ok(PipelineRun {
            id: uuid::Uuid::new_v4().to_string(),
            stage: stage.to_string(),
            file_name,
            file_url,
            preview,
            class_name,
            prompts,
            prompts_seeded,
            answers,
            extraction,
            ocr_display: ocr_display(&ocr_text),
            ocr_text,
            summary,
            steps,
            started_at,
            finished_at: Utc::now(),
        })
    }

    fn upload_record(&self, doc: &DocRef, processed: bool) -> UploadRecord {
        UploadRecord {
            file_name: doc.path.clone(),
            file_ref: doc.file_url(),
            stage_name: doc.stage.clone(),
            processed,
        }
    }

    /// Stored prompts for the class, generating and seeding them the first
    /// time the class is seen.
    async fn ensure_prompts(&self, class_name: &str) -> Result<(PromptSchema, bool), PipelineError> {
        let prompts_err = |e: anyhow::Error| PipelineError::Prompts(format!("{:#}", e));

        if let Some(prompts) = self.store.load_prompts(class_name).await.map_err(prompts_err)? {
            return Ok((prompts, false));
        }

        let generated = run_with_policy("generate prompts", &self.retry.generate, |_| {
            self.ai.generate_prompts(class_name)
        })
        .await
        .map_err(|e| PipelineError::Prompts(e.to_string()))?;

        let seeded = self
            .store
            .seed_prompts_if_missing(class_name, &generated)
            .await
            .map_err(prompts_err)?;
        let stored = self
            .store
            .load_prompts(class_name)
            .await
            .map_err(prompts_err)?;
        Ok((stored.unwrap_or(generated), seeded))
    }

    fn spawn_ocr(&self, doc: DocRef) -> JoinHandle<(String, Option<String>)> {
        let ai = Arc::clone(&self.ai);
        let retry = self.retry;
        tokio::spawn(async move {
            let text = match run_with_policy("parse layout", &retry.parse, |_| ai.parse_layout(&doc)).await {
                Ok(text) => text,
                Err(e) => return (format!("(OCR failed: {})", e.last_error), None),
            };
            let summary = run_with_policy("summarize", &retry.summarize, |_| ai.summarize(&text))
                .await
                .ok();
            (text, summary)
        })
    }

    async fn await_ocr(&self, mut task: AbortOnDrop<(String, Option<String>)>) -> (String, Option<String>) {
        match tokio::time::timeout(self.ocr_timeout, &mut task.0).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => (format!("(OCR failed: {})", e), None),
            Err(_) => (
                format!("(OCR failed: timed out after {:?})", self.ocr_timeout),
                None,
            ),
        }
    }

    async fn persist(
        &self,
        doc: &DocRef,
        class_name: &str,
        answers: &FieldAnswer,
        extraction: &Value,
        ocr_text: &str,
        summary: &Option<String>,
    ) -> anyhow::Result<()> {
        self.store
            .record_processed(&ProcessedRecord::new(doc, class_name, extraction.clone()))
            .await?;
        self.store
            .append_fields(&FieldRecord::from_answers(doc, class_name, answers))
            .await?;
        self.store
            .record_ocr(&OcrRecord {
                file_name: doc.path.clone(),
                file_ref: doc.file_url(),
                ocr: ocr_text.to_string(),
                summary: summary.clone(),
            })
            .await?;
        self.store
            .upsert_upload(&self.upload_record(doc, true))
            .await
    }
}

/// Final path component of an uploaded name.
fn base_name(file_name: &str) -> &str {
    file_name
        .rsplit(|c| c == '/' || c == '\\')
        .next()
        .unwrap_or(file_name)
}

/// Layout OCR separates columns with runs of spaces; show them as line breaks.
pub fn ocr_display(text: &str) -> String {
    static SPACE_RUNS: OnceLock<Option<Regex>> = OnceLock::new();
    match SPACE_RUNS.get_or_init(|| Regex::new(r" {2,}").ok()) {
        Some(re) => re.replace_all(text, "\n").into_owned(),
        None => text.to_string(),
    }
}
