//! Batch extraction over many files of one stage.
//!
//! A fixed pool of workers pulls file keys from a shared queue and calls the
//! AI service. Each answer is sent to a single merge loop that owns the
//! [`ResultTable`], so column discovery never races. Persistence runs on a
//! separate best-effort channel.

use crate::ai::{AiService, DocRef, ExtractOutput};
use crate::persist::{PersistHandle, PersistReport, Persister};
use crate::prompts::PromptSchema;
use crate::retry::{run_with_policy, RetryPolicy, DEFAULT_CALL_TIMEOUT};
use crate::store::{DocumentStore, FieldRecord, ProcessedRecord};
use crate::table::ResultTable;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Minimum gap between two partial renders.
pub const DEFAULT_RENDER_INTERVAL: Duration = Duration::from_millis(150);

#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Worker slots. Zero is rejected when a batch starts.
    pub concurrency: usize,
    pub render_interval: Duration,
    /// Writer tasks draining the persistence queue.
    pub persist_writers: usize,
    pub extract: RetryPolicy,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            render_interval: DEFAULT_RENDER_INTERVAL,
            persist_writers: 2,
            extract: RetryPolicy::once(DEFAULT_CALL_TIMEOUT),
        }
    }
}

impl BatchConfig {
    pub fn validate(&self) -> Result<(), BatchError> {
        if self.concurrency == 0 {
            return Err(BatchError::InvalidConcurrency);
        }
        Ok(())
    }
}

/// Host parallelism, kept between 2 and 8 to spare the AI service.
/// Ceiling for a per-request worker count.
pub const MAX_CONCURRENCY: usize = 8;

pub fn default_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(2)
        .clamp(2, MAX_CONCURRENCY)
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BatchError {
    #[error("Concurrency must be at least 1")]
    InvalidConcurrency,
}

/// Files of one stage to extract with one class schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchRequest {
    pub stage: String,
    pub class_name: String,
    pub prompts: PromptSchema,
    pub items: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Progress {
    pub completed: usize,
    pub total: usize,
}

/// Receives live updates while a batch runs. Called from the merge loop only.
pub trait BatchObserver: Send {
    fn on_progress(&mut self, progress: Progress);

    fn on_render(&mut self, table: &ResultTable);
}

/// Observer that ignores every update.
#[cfg(test)]
pub struct NoopObserver;

#[cfg(test)]
impl BatchObserver for NoopObserver {
    fn on_progress(&mut self, _progress: Progress) {}

    fn on_render(&mut self, _table: &ResultTable) {}
}

/// Rate limit for partial renders.
#[derive(Debug, Clone)]
pub struct RenderThrottle {
    interval: Duration,
    last: Option<Instant>,
}

impl RenderThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
        }
    }

    /// True when a render is due at `now`; records it as the last render.
    pub fn should_render(&mut self, now: Instant) -> bool {
        let due = match self.last {
            None => true,
            Some(last) => now.saturating_duration_since(last) >= self.interval,
        };
        if due {
            self.last = Some(now);
        }
        due
    }
}

/// Stops workers from picking up further items.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Final state of a batch.
#[derive(Debug, Clone)]
pub struct BatchOutcome {
    pub table: ResultTable,
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Items never dispatched because the batch was cancelled.
    pub skipped: usize,
    pub persist: PersistReport,
    /// Set when there were no items to process.
    pub nothing_to_do: bool,
}

type ItemResult = (String, Result<ExtractOutput, String>);

/// Fans a batch out to the AI service and assembles the result table.
#[derive(Clone)]
pub struct Coordinator {
    ai: Arc<dyn AiService>,
    store: Option<Arc<dyn DocumentStore>>,
    config: BatchConfig,
}

impl Coordinator {
    pub fn new(ai: Arc<dyn AiService>, config: BatchConfig) -> Self {
        Self {
            ai,
            store: None,
            config,
        }
    }

    /// Persist raw results and extracted fields to `store`.
    pub fn with_store(mut self, store: Arc<dyn DocumentStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub async fn run(
        &self,
        request: BatchRequest,
        observer: &mut dyn BatchObserver,
        cancel: &CancelHandle,
    ) -> Result<BatchOutcome, BatchError> {
        self.config.validate()?;

        let mut table = ResultTable::new(&request.items);
        let total = table.len();
        if total == 0 {
            info!("Batch for class {} has nothing to do", request.class_name);
            return Ok(BatchOutcome {
                table,
                total: 0,
                succeeded: 0,
                failed: 0,
                skipped: 0,
                persist: PersistReport::default(),
                nothing_to_do: true,
            });
        }

        let worker_count = self.config.concurrency.min(total);
        info!(
            "Starting batch: {} items from @{} as {} with {} workers",
            total, request.stage, request.class_name, worker_count
        );

        let (job_tx, job_rx) = mpsc::channel::<String>(total);
        for key in table.keys() {
            // Capacity equals the item count, so this never waits.
            if job_tx.send(key.clone()).await.is_err() {
                break;
            }
        }
        drop(job_tx);

        let persister = self
            .store
            .as_ref()
            .map(|store| Persister::spawn(Arc::clone(store), self.config.persist_writers));

        let (result_tx, mut result_rx) = mpsc::unbounded_channel::<ItemResult>();
        let context = Arc::new(WorkerContext {
            ai: Arc::clone(&self.ai),
            stage: request.stage.clone(),
            class_name: request.class_name.clone(),
            prompts: request.prompts.clone(),
            policy: self.config.extract,
            persist: persister.as_ref().map(Persister::handle),
            cancel: cancel.clone(),
        });
        let mut workers = spawn_workers(context, job_rx, result_tx, worker_count);

        let mut throttle = RenderThrottle::new(self.config.render_interval);
        let mut completed = 0;
        let mut succeeded = 0;
        let mut failed = 0;

        while let Some((key, result)) = result_rx.recv().await {
            completed += 1;
            match result {
                Ok(output) => {
                    let added = table.merge(&key, &output.answers);
                    if !added.is_empty() {
                        debug!("{} introduced columns {:?}", key, added);
                    }
                    succeeded += 1;
                }
                Err(e) => {
                    warn!("Extraction failed for {}: {}", key, e);
                    failed += 1;
                }
            }

            observer.on_progress(Progress { completed, total });
            if throttle.should_render(Instant::now()) {
                observer.on_render(&table);
            }
        }

        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                warn!("Batch worker panicked: {}", e);
            }
        }
        observer.on_render(&table);

        let persist = match persister {
            Some(p) => p.finish().await,
            None => PersistReport::default(),
        };

        let skipped = total - completed;
        info!(
            "Batch finished: {} succeeded, {} failed, {} skipped, {}/{} persistence writes failed",
            succeeded, failed, skipped, persist.failed, persist.attempted
        );

        Ok(BatchOutcome {
            table,
            total,
            succeeded,
            failed,
            skipped,
            persist,
            nothing_to_do: false,
        })
    }
}

struct WorkerContext {
    ai: Arc<dyn AiService>,
    stage: String,
    class_name: String,
    prompts: PromptSchema,
    policy: RetryPolicy,
    persist: Option<PersistHandle>,
    cancel: CancelHandle,
}

impl WorkerContext {
    async fn process(&self, key: &str) -> Result<ExtractOutput, String> {
        let doc = DocRef::new(&self.stage, key);
        let result = run_with_policy("extract", &self.policy, |_| {
            self.ai.extract(&doc, &self.prompts)
        })
        .await
        .map_err(|e| e.last_error);

        if let Some(persist) = &self.persist {
            match &result {
                Ok(output) => {
                    persist.processed(ProcessedRecord::new(
                        &doc,
                        &self.class_name,
                        output.raw.clone(),
                    ));
                    persist.fields(FieldRecord::from_answers(
                        &doc,
                        &self.class_name,
                        &output.answers,
                    ));
                }
                Err(e) => persist.processed(ProcessedRecord::new(
                    &doc,
                    &self.class_name,
                    json!({ "error": e }),
                )),
            }
        }

        result
    }
}

fn spawn_workers(
    context: Arc<WorkerContext>,
    receiver: mpsc::Receiver<String>,
    results: mpsc::UnboundedSender<ItemResult>,
    worker_count: usize,
) -> JoinSet<()> {
    let shared_receiver = Arc::new(Mutex::new(receiver));

    let mut join_set = JoinSet::new();
    for worker_idx in 0..worker_count {
        let rx = Arc::clone(&shared_receiver);
        let context = Arc::clone(&context);
        let results = results.clone();
        join_set.spawn(async move { run_worker(worker_idx, rx, context, results).await });
    }

    join_set
}

async fn run_worker(
    worker_idx: usize,
    receiver: Arc<Mutex<mpsc::Receiver<String>>>,
    context: Arc<WorkerContext>,
    results: mpsc::UnboundedSender<ItemResult>,
) {
    loop {
        if context.cancel.is_cancelled() {
            debug!("Worker {} stopping (cancelled)", worker_idx);
            break;
        }
        let Some(key) = receive_item(&receiver).await else {
            break;
        };
        if context.cancel.is_cancelled() {
            break;
        }

        let result = context.process(&key).await;
        if results.send((key, result)).is_err() {
            break;
        }
    }
}

async fn receive_item(receiver: &Arc<Mutex<mpsc::Receiver<String>>>) -> Option<String> {
    let mut guard = receiver.lock().await;
    guard.recv().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::{FakeAi, MemoryStore};
    use crate::table::FieldAnswer;
    use serde_json::{json, Value};
    use std::collections::{BTreeSet, HashMap};

    fn prompts() -> PromptSchema {
        PromptSchema::Question("What is this?".into())
    }

    fn request(items: &[String]) -> BatchRequest {
        BatchRequest {
            stage: "DB.SC.DOCS".into(),
            class_name: "invoice".into(),
            prompts: prompts(),
            items: items.to_vec(),
        }
    }

    fn items(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("doc-{:02}.pdf", i)).collect()
    }

    fn config(concurrency: usize) -> BatchConfig {
        BatchConfig {
            concurrency,
            ..BatchConfig::default()
        }
    }

    fn answer(pairs: &[(&str, Value)]) -> FieldAnswer {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[derive(Default)]
    struct Recorder {
        progress: Vec<Progress>,
        renders: usize,
        last_rows: usize,
    }

    impl BatchObserver for Recorder {
        fn on_progress(&mut self, progress: Progress) {
            self.progress.push(progress);
        }

        fn on_render(&mut self, table: &ResultTable) {
            self.renders += 1;
            self.last_rows = table.len();
        }
    }

    async fn run(coordinator: &Coordinator, items: &[String]) -> BatchOutcome {
        coordinator
            .run(request(items), &mut NoopObserver, &CancelHandle::new())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_one_row_per_item_in_input_order() {
        let keys = items(20);
        let ai = FakeAi::new().with_jitter(Duration::from_millis(15));
        for key in &keys {
            ai.answer(key, answer(&[("total", json!(key.len()))]));
        }
        let coordinator = Coordinator::new(Arc::new(ai), config(4));

        let outcome = run(&coordinator, &keys).await;
        assert_eq!(outcome.table.keys(), keys.as_slice());
        assert_eq!(outcome.total, 20);
        assert_eq!(outcome.succeeded, 20);
        assert!(!outcome.nothing_to_do);
        for key in &keys {
            assert_eq!(outcome.table.cell(key, "total"), Some(&json!(key.len())));
        }
    }

    #[tokio::test]
    async fn test_columns_are_union_of_answers() {
        let keys = items(4);
        let ai = FakeAi::new().with_jitter(Duration::from_millis(10));
        ai.answer(&keys[0], answer(&[("a", json!(1)), ("b", json!(2))]));
        ai.answer(&keys[1], answer(&[("b", json!(3)), ("c", json!(null))]));
        ai.answer(&keys[2], answer(&[]));
        ai.fail(&keys[3], "boom");
        let coordinator = Coordinator::new(Arc::new(ai), config(3));

        let outcome = run(&coordinator, &keys).await;
        let columns: BTreeSet<_> = outcome.table.columns().iter().cloned().collect();
        assert_eq!(columns, BTreeSet::from(["a".into(), "b".into(), "c".into()]));
        assert_eq!(outcome.table.columns().len(), 3);
        assert_eq!(outcome.table.cell(&keys[1], "a"), None);
    }

    #[tokio::test]
    async fn test_rerun_is_idempotent() {
        let keys = items(12);
        let ai = FakeAi::new().with_jitter(Duration::from_millis(10));
        for (i, key) in keys.iter().enumerate() {
            ai.answer(key, answer(&[(&format!("f{}", i % 4), json!(i))]));
        }
        let coordinator = Coordinator::new(Arc::new(ai), config(5));

        let first = run(&coordinator, &keys).await;
        let second = run(&coordinator, &keys).await;

        let as_map = |o: &BatchOutcome| {
            o.table
                .keys()
                .iter()
                .map(|k| (k.clone(), o.table.row(k).cloned().unwrap_or_default()))
                .collect::<HashMap<_, _>>()
        };
        assert_eq!(as_map(&first), as_map(&second));
        let cols = |o: &BatchOutcome| o.table.columns().iter().cloned().collect::<BTreeSet<_>>();
        assert_eq!(cols(&first), cols(&second));
    }

    #[tokio::test]
    async fn test_failed_item_keeps_empty_row() {
        let keys = items(5);
        let ai = FakeAi::new();
        for key in &keys {
            ai.answer(key, answer(&[("x", json!("y"))]));
        }
        ai.fail(&keys[2], "service unavailable");
        let store = Arc::new(MemoryStore::default());
        let coordinator = Coordinator::new(Arc::new(ai), config(2)).with_store(store.clone());

        let outcome = run(&coordinator, &keys).await;
        assert_eq!(outcome.table.len(), 5);
        assert_eq!(outcome.failed, 1);
        assert_eq!(outcome.succeeded, 4);
        assert!(outcome.table.row(&keys[2]).map_or(true, |r| r.is_empty()));

        let processed = store.processed();
        assert_eq!(processed.len(), 5);
        let failure = processed
            .iter()
            .find(|r| r.file_ref == keys[2])
            .unwrap();
        assert!(failure.extraction_result["error"]
            .as_str()
            .unwrap()
            .contains("service unavailable"));
        assert_eq!(store.fields().len(), 4);
    }

    #[tokio::test]
    async fn test_stress_unique_columns_under_random_order() {
        let keys = items(50);
        let ai = FakeAi::new().with_jitter(Duration::from_millis(20));
        for (i, key) in keys.iter().enumerate() {
            let mut fields = answer(&[("shared", json!(i))]);
            if i % 5 == 0 {
                fields.insert(format!("unique_{}", i), json!(true));
            }
            ai.answer(key, fields);
        }
        let coordinator = Coordinator::new(Arc::new(ai), config(8));

        let outcome = run(&coordinator, &keys).await;
        let columns = outcome.table.columns();
        let distinct: BTreeSet<_> = columns.iter().collect();
        assert_eq!(columns.len(), 11);
        assert_eq!(distinct.len(), 11);
        assert_eq!(outcome.table.len(), 50);
        for (i, key) in keys.iter().enumerate() {
            assert_eq!(outcome.table.cell(key, "shared"), Some(&json!(i)));
        }
    }

    #[tokio::test]
    async fn test_zero_concurrency_rejected_before_dispatch() {
        let ai = Arc::new(FakeAi::new());
        let coordinator = Coordinator::new(ai.clone(), config(0));
        let err = coordinator
            .run(request(&items(3)), &mut NoopObserver, &CancelHandle::new())
            .await
            .unwrap_err();
        assert_eq!(err, BatchError::InvalidConcurrency);
        assert_eq!(ai.calls(), 0);
    }

    #[tokio::test]
    async fn test_single_item_matches_direct_call() {
        let key = "only.pdf".to_string();
        let ai = Arc::new(FakeAi::new());
        ai.answer(&key, answer(&[("name", json!("Ada")), ("tags", json!(["a"]))]));
        let coordinator = Coordinator::new(ai.clone(), config(1));

        let outcome = run(&coordinator, &[key.clone()]).await;
        let direct = ai
            .extract(&DocRef::new("DB.SC.DOCS", &key), &prompts())
            .await
            .unwrap();

        let row = outcome.table.row(&key).unwrap();
        assert_eq!(row.len(), direct.answers.len());
        for (field, value) in &direct.answers {
            assert_eq!(row.get(field), Some(value));
        }
    }

    #[tokio::test]
    async fn test_empty_batch_is_nothing_to_do() {
        let ai = Arc::new(FakeAi::new());
        let coordinator = Coordinator::new(ai.clone(), config(2));
        let outcome = run(&coordinator, &[]).await;
        assert!(outcome.nothing_to_do);
        assert!(outcome.table.is_empty());
        assert_eq!(ai.calls(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_items_processed_once() {
        let ai = Arc::new(FakeAi::new());
        let coordinator = Coordinator::new(ai.clone(), config(2));
        let keys = vec!["a.pdf".to_string(), "b.pdf".into(), "a.pdf".into()];
        let outcome = run(&coordinator, &keys).await;
        assert_eq!(outcome.total, 2);
        assert_eq!(outcome.table.keys(), ["a.pdf".to_string(), "b.pdf".into()]);
        assert_eq!(ai.calls(), 2);
    }

    #[tokio::test]
    async fn test_timeout_counts_as_failure() {
        let keys = items(3);
        let ai = FakeAi::new();
        for key in &keys {
            ai.answer(key, answer(&[("x", json!(1))]));
        }
        ai.delay(&keys[1], Duration::from_millis(500));
        let mut cfg = config(3);
        cfg.extract = RetryPolicy::once(Duration::from_millis(50));
        let coordinator = Coordinator::new(Arc::new(ai), cfg);

        let outcome = run(&coordinator, &keys).await;
        assert_eq!(outcome.failed, 1);
        assert_eq!(outcome.succeeded, 2);
        assert_eq!(outcome.table.cell(&keys[1], "x"), None);
    }

    #[tokio::test]
    async fn test_progress_and_final_render() {
        let keys = items(6);
        let ai = Arc::new(FakeAi::new());
        let mut cfg = config(2);
        cfg.render_interval = Duration::from_secs(3600);
        let coordinator = Coordinator::new(ai, cfg);

        let mut recorder = Recorder::default();
        coordinator
            .run(request(&keys), &mut recorder, &CancelHandle::new())
            .await
            .unwrap();

        let completed: Vec<_> = recorder.progress.iter().map(|p| p.completed).collect();
        assert_eq!(completed, vec![1, 2, 3, 4, 5, 6]);
        assert!(recorder.progress.iter().all(|p| p.total == 6));
        // First completion plus the final render.
        assert_eq!(recorder.renders, 2);
        assert_eq!(recorder.last_rows, 6);
    }

    #[test]
    fn test_render_throttle() {
        let mut throttle = RenderThrottle::new(Duration::from_millis(150));
        let start = Instant::now();
        assert!(throttle.should_render(start));
        assert!(!throttle.should_render(start + Duration::from_millis(100)));
        assert!(throttle.should_render(start + Duration::from_millis(150)));
        assert!(!throttle.should_render(start + Duration::from_millis(200)));
    }

    #[tokio::test]
    async fn test_cancel_skips_undispatched_items() {
        let keys = items(10);
        let ai = Arc::new(FakeAi::new().with_latency(Duration::from_millis(30)));
        let coordinator = Coordinator::new(ai, config(1));

        struct CancelAfterFirst(CancelHandle);
        impl BatchObserver for CancelAfterFirst {
            fn on_progress(&mut self, _progress: Progress) {
                self.0.cancel();
            }
            fn on_render(&mut self, _table: &ResultTable) {}
        }

        let cancel = CancelHandle::new();
        let mut observer = CancelAfterFirst(cancel.clone());
        let outcome = coordinator
            .run(request(&keys), &mut observer, &cancel)
            .await
            .unwrap();

        assert_eq!(outcome.table.len(), 10);
        assert!(outcome.skipped >= 8, "skipped {}", outcome.skipped);
        assert_eq!(outcome.succeeded + outcome.failed + outcome.skipped, 10);
    }

    #[tokio::test]
    async fn test_persist_failures_do_not_fail_batch() {
        let keys = items(4);
        let ai = FakeAi::new();
        for key in &keys {
            ai.answer(key, answer(&[("x", json!(1))]));
        }
        let store = Arc::new(MemoryStore::default());
        store.fail_writes(true);
        let coordinator = Coordinator::new(Arc::new(ai), config(2)).with_store(store);

        let outcome = run(&coordinator, &keys).await;
        assert_eq!(outcome.succeeded, 4);
        assert_eq!(outcome.persist.attempted, 8);
        assert_eq!(outcome.persist.failed, 8);
    }
}
