//! In-memory AI service and store used by unit tests.

use crate::ai::{AiService, DocRef, ExtractOutput};
use crate::history::{stage_of, HistoryFilter, HistorySection};
use crate::prompts::PromptSchema;
use crate::store::{
    ClassEntry, DocumentStore, FieldRecord, OcrRecord, ProcessedRecord, SessionContext,
    StageFile, UploadRecord,
};
use crate::table::{FieldAnswer, Grid};
use anyhow::{anyhow, bail, Result};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Scripted AI service. Unknown documents extract to an empty answer.
#[derive(Default)]
pub struct FakeAi {
    answers: Mutex<HashMap<String, FieldAnswer>>,
    failures: Mutex<HashMap<String, String>>,
    delays: Mutex<HashMap<String, Duration>>,
    latency: Duration,
    jitter: Duration,
    calls: AtomicUsize,
    class_name: Mutex<Option<String>>,
    classify_failures: AtomicUsize,
    ocr_text: Mutex<Option<String>>,
    ocr_delay: Mutex<Duration>,
    generated: Mutex<Option<PromptSchema>>,
}

impl FakeAi {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fixed delay before every extraction.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Extra per-document delay in `[0, jitter)`, derived from the key so
    /// completion order differs from submission order.
    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn answer(&self, key: &str, answer: FieldAnswer) {
        self.answers.lock().unwrap().insert(key.to_string(), answer);
    }

    pub fn fail(&self, key: &str, message: &str) {
        self.failures
            .lock()
            .unwrap()
            .insert(key.to_string(), message.to_string());
    }

    pub fn delay(&self, key: &str, delay: Duration) {
        self.delays.lock().unwrap().insert(key.to_string(), delay);
    }

    pub fn classify_as(&self, class_name: &str) {
        *self.class_name.lock().unwrap() = Some(class_name.to_string());
    }

    /// Fail the next `n` classification calls.
    pub fn fail_classify(&self, n: usize) {
        self.classify_failures.store(n, Ordering::SeqCst);
    }

    pub fn ocr(&self, text: &str, delay: Duration) {
        *self.ocr_text.lock().unwrap() = Some(text.to_string());
        *self.ocr_delay.lock().unwrap() = delay;
    }

    pub fn generate(&self, prompts: PromptSchema) {
        *self.generated.lock().unwrap() = Some(prompts);
    }

    /// Extraction calls made so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn jitter_for(&self, key: &str) -> Duration {
        let millis = self.jitter.as_millis() as u64;
        if millis == 0 {
            return Duration::ZERO;
        }
        let digest = Sha256::digest(key.as_bytes());
        let mut head = [0u8; 8];
        head.copy_from_slice(&digest[..8]);
        Duration::from_millis(u64::from_le_bytes(head) % millis)
    }

    fn output_for(&self, key: &str) -> ExtractOutput {
        let answers = self
            .answers
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .unwrap_or_default();
        ExtractOutput::from_raw(json!({ "response": answers }))
    }
}

#[async_trait::async_trait]
impl AiService for FakeAi {
    async fn classify(&self, _doc: &DocRef) -> Result<String> {
        let remaining = self.classify_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.classify_failures.store(remaining - 1, Ordering::SeqCst);
            bail!("warehouse busy");
        }
        Ok(self
            .class_name
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_else(|| "invoice".to_string()))
    }

    async fn extract(&self, doc: &DocRef, _prompts: &PromptSchema) -> Result<ExtractOutput> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let extra = self
            .delays
            .lock()
            .unwrap()
            .get(&doc.path)
            .copied()
            .unwrap_or_default();
        let wait = self.latency + self.jitter_for(&doc.path) + extra;
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }

        let failure = self.failures.lock().unwrap().get(&doc.path).cloned();
        if let Some(message) = failure {
            return Err(anyhow!(message));
        }
        Ok(self.output_for(&doc.path))
    }

    async fn parse_layout(&self, _doc: &DocRef) -> Result<String> {
        let delay = *self.ocr_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(self
            .ocr_text
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_else(|| "Invoice  No 7".to_string()))
    }

    async fn summarize(&self, text: &str) -> Result<String> {
        Ok(format!("Summary of {} chars", text.chars().count()))
    }

    async fn generate_prompts(&self, class_name: &str) -> Result<PromptSchema> {
        Ok(self
            .generated
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_else(|| PromptSchema::fallback(Some(class_name))))
    }

    async fn extract_stage(
        &self,
        _stage: &str,
        _prompts: &PromptSchema,
    ) -> Result<Vec<(String, ExtractOutput)>> {
        let keys: BTreeSet<String> = self.answers.lock().unwrap().keys().cloned().collect();
        Ok(keys
            .into_iter()
            .map(|key| {
                let output = self.output_for(&key);
                (key, output)
            })
            .collect())
    }
}

#[derive(Default)]
struct MemoryState {
    prompts: BTreeMap<String, PromptSchema>,
    processed: Vec<ProcessedRecord>,
    fields: Vec<FieldRecord>,
    ocr: Vec<OcrRecord>,
    uploads: Vec<UploadRecord>,
    files: BTreeMap<String, BTreeMap<String, Vec<u8>>>,
}

/// Store kept in process memory. `fail_writes` makes result writes fail.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn processed(&self) -> Vec<ProcessedRecord> {
        self.state.lock().unwrap().processed.clone()
    }

    pub fn fields(&self) -> Vec<FieldRecord> {
        self.state.lock().unwrap().fields.clone()
    }

    pub fn ocr_rows(&self) -> Vec<OcrRecord> {
        self.state.lock().unwrap().ocr.clone()
    }

    pub fn uploads(&self) -> Vec<UploadRecord> {
        self.state.lock().unwrap().uploads.clone()
    }

    fn check_write(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            bail!("write rejected");
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl DocumentStore for MemoryStore {
    async fn ensure_schema(&self) -> Result<()> {
        Ok(())
    }

    async fn session_context(&self) -> Result<SessionContext> {
        Ok(SessionContext {
            role: Some("TESTER".into()),
            database: Some("DB".into()),
            schema: Some("SC".into()),
        })
    }

    async fn list_stages(&self) -> Result<Vec<String>> {
        let state = self.state.lock().unwrap();
        let mut stages: BTreeSet<String> = state.files.keys().cloned().collect();
        stages.extend(state.uploads.iter().map(|u| u.stage_name.clone()));
        Ok(stages.into_iter().collect())
    }

    async fn list_stage_files(&self, stage: &str) -> Result<Vec<StageFile>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .files
            .get(stage)
            .map(|files| {
                files
                    .keys()
                    .map(|path| StageFile {
                        relative_path: path.clone(),
                        file_url: Some(format!("@{}/{}", stage, path)),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn put_file(&self, stage: &str, file_name: &str, data: Vec<u8>) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .files
            .entry(stage.to_string())
            .or_default()
            .insert(file_name.to_string(), data);
        Ok(())
    }

    async fn list_classes(&self) -> Result<Vec<ClassEntry>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .prompts
            .iter()
            .map(|(class_name, prompts)| ClassEntry {
                class_name: class_name.clone(),
                prompts: prompts.clone(),
            })
            .collect())
    }

    async fn load_prompts(&self, class_name: &str) -> Result<Option<PromptSchema>> {
        Ok(self.state.lock().unwrap().prompts.get(class_name).cloned())
    }

    async fn save_prompts(&self, class_name: &str, prompts: &PromptSchema) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .prompts
            .insert(class_name.to_string(), prompts.clone());
        Ok(())
    }

    async fn seed_prompts_if_missing(
        &self,
        class_name: &str,
        prompts: &PromptSchema,
    ) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        if state.prompts.contains_key(class_name) {
            return Ok(false);
        }
        state.prompts.insert(class_name.to_string(), prompts.clone());
        Ok(true)
    }

    async fn delete_class(&self, class_name: &str) -> Result<()> {
        self.state.lock().unwrap().prompts.remove(class_name);
        Ok(())
    }

    async fn record_processed(&self, record: &ProcessedRecord) -> Result<()> {
        self.check_write()?;
        self.state.lock().unwrap().processed.push(record.clone());
        Ok(())
    }

    async fn append_fields(&self, records: &[FieldRecord]) -> Result<()> {
        self.check_write()?;
        self.state
            .lock()
            .unwrap()
            .fields
            .extend_from_slice(records);
        Ok(())
    }

    async fn record_ocr(&self, record: &OcrRecord) -> Result<()> {
        self.check_write()?;
        self.state.lock().unwrap().ocr.push(record.clone());
        Ok(())
    }

    async fn upsert_upload(&self, record: &UploadRecord) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        match state
            .uploads
            .iter_mut()
            .find(|u| u.file_ref == record.file_ref && u.stage_name == record.stage_name)
        {
            Some(existing) => *existing = record.clone(),
            None => state.uploads.push(record.clone()),
        }
        Ok(())
    }

    async fn recent_stage(&self) -> Result<Option<String>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .uploads
            .last()
            .map(|u| u.stage_name.trim_start_matches('@').to_string()))
    }

    async fn query_grid(&self, section: HistorySection, filter: &HistoryFilter) -> Result<Grid> {
        let state = self.state.lock().unwrap();
        let rows: Vec<&FieldRecord> = state
            .fields
            .iter()
            .filter(|f| filter.matches(&f.class_name, &f.file_url, &f.file_ref))
            .collect();
        let ocr_refs: HashSet<&str> = state
            .ocr
            .iter()
            .flat_map(|o| [o.file_ref.as_str(), o.file_name.as_str()])
            .collect();

        let columns = |names: &[&str]| names.iter().map(|n| n.to_string()).collect::<Vec<_>>();
        Ok(match section {
            HistorySection::Classes => {
                let mut docs: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
                for f in &rows {
                    docs.entry(f.class_name.as_str())
                        .or_default()
                        .insert(f.file_ref.as_str());
                }
                let mut summary: Vec<(&str, usize)> =
                    docs.into_iter().map(|(c, files)| (c, files.len())).collect();
                summary.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(b.0)));
                Grid {
                    columns: columns(&["CLASS_NAME", "DOCS"]),
                    rows: summary
                        .into_iter()
                        .map(|(c, n)| vec![json!(c), json!(n)])
                        .collect(),
                }
            }
            HistorySection::Documents => {
                let mut docs: BTreeMap<(&str, &str), (&str, usize)> = BTreeMap::new();
                for f in &rows {
                    let entry = docs
                        .entry((f.file_ref.as_str(), f.class_name.as_str()))
                        .or_insert((f.file_url.as_str(), 0));
                    entry.1 += 1;
                }
                Grid {
                    columns: columns(&[
                        "FILE_REF",
                        "CLASS_NAME",
                        "STAGE",
                        "FIELDS_EXTRACTED",
                        "HAS_OCR",
                    ]),
                    rows: docs
                        .into_iter()
                        .map(|((file_ref, class), (url, n))| {
                            let has_ocr = ocr_refs.contains(url) || ocr_refs.contains(file_ref);
                            vec![
                                json!(file_ref),
                                json!(class),
                                json!(stage_of(url)),
                                json!(n),
                                json!(has_ocr),
                            ]
                        })
                        .collect(),
                }
            }
            HistorySection::Fields => {
                let mut sorted = rows;
                sorted.sort_by(|a, b| {
                    (&a.file_ref, &a.class_name, &a.field_name)
                        .cmp(&(&b.file_ref, &b.class_name, &b.field_name))
                });
                Grid {
                    columns: columns(&["FILE_REF", "STAGE", "CLASS_NAME", "FIELD_NAME", "FIELD_VALUE"]),
                    rows: sorted
                        .into_iter()
                        .map(|f| {
                            vec![
                                json!(f.file_ref),
                                json!(stage_of(&f.file_url)),
                                json!(f.class_name),
                                json!(f.field_name),
                                Value::String(f.field_value.to_string()),
                            ]
                        })
                        .collect(),
                }
            }
        })
    }
}
