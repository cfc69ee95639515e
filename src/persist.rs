//! Best-effort persistence of batch results.
//!
//! Workers hand records to a [`PersistHandle`] and move on. A few writer
//! tasks drain the queue into the store; failures are logged and counted,
//! never returned to the submitter.

use crate::store::{DocumentStore, FieldRecord, ProcessedRecord};
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, warn};

#[derive(Debug)]
enum PersistJob {
    Processed(ProcessedRecord),
    Fields(Vec<FieldRecord>),
}

impl PersistJob {
    fn describe(&self) -> String {
        match self {
            PersistJob::Processed(r) => format!("processed row for {}", r.file_url),
            PersistJob::Fields(rows) => format!(
                "{} field rows for {}",
                rows.len(),
                rows.first().map(|r| r.file_url.as_str()).unwrap_or("?")
            ),
        }
    }
}

/// Write counters for one batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PersistReport {
    pub attempted: usize,
    pub failed: usize,
}

#[derive(Debug, Default)]
struct Counters {
    attempted: AtomicUsize,
    failed: AtomicUsize,
}

/// Submit side of the queue. Cheap to clone into workers.
#[derive(Clone)]
pub struct PersistHandle {
    tx: mpsc::UnboundedSender<PersistJob>,
}

impl PersistHandle {
    pub fn processed(&self, record: ProcessedRecord) {
        self.submit(PersistJob::Processed(record));
    }

    /// Queue field rows; an empty list is ignored.
    pub fn fields(&self, records: Vec<FieldRecord>) {
        if !records.is_empty() {
            self.submit(PersistJob::Fields(records));
        }
    }

    fn submit(&self, job: PersistJob) {
        if let Err(e) = self.tx.send(job) {
            warn!("Persistence queue closed, dropping {}", e.0.describe());
        }
    }
}

/// Owns the writer tasks.
pub struct Persister {
    tx: mpsc::UnboundedSender<PersistJob>,
    writers: JoinSet<()>,
    counters: Arc<Counters>,
}

impl Persister {
    pub fn spawn(store: Arc<dyn DocumentStore>, writers: usize) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared_rx = Arc::new(Mutex::new(rx));
        let counters = Arc::new(Counters::default());

        let mut join_set = JoinSet::new();
        for writer_idx in 0..writers.max(1) {
            let rx = Arc::clone(&shared_rx);
            let store = Arc::clone(&store);
            let counters = Arc::clone(&counters);
            join_set.spawn(async move { run_writer(writer_idx, rx, store, counters).await });
        }

        Self {
            tx,
            writers: join_set,
            counters,
        }
    }

    pub fn handle(&self) -> PersistHandle {
        PersistHandle {
            tx: self.tx.clone(),
        }
    }

    /// Close the queue and wait for pending writes. Every outstanding
    /// [`PersistHandle`] must be dropped first.
    pub async fn finish(mut self) -> PersistReport {
        drop(self.tx);
        while let Some(result) = self.writers.join_next().await {
            if let Err(e) = result {
                warn!("Persistence writer panicked: {}", e);
            }
        }
        PersistReport {
            attempted: self.counters.attempted.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }
}

async fn run_writer(
    writer_idx: usize,
    receiver: Arc<Mutex<mpsc::UnboundedReceiver<PersistJob>>>,
    store: Arc<dyn DocumentStore>,
    counters: Arc<Counters>,
) {
    loop {
        let job = {
            let mut guard = receiver.lock().await;
            guard.recv().await
        };
        let Some(job) = job else {
            debug!("Persistence writer {} done", writer_idx);
            break;
        };

        counters.attempted.fetch_add(1, Ordering::Relaxed);
        let result = match &job {
            PersistJob::Processed(record) => store.record_processed(record).await,
            PersistJob::Fields(records) => store.append_fields(records).await,
        };
        if let Err(e) = result {
            counters.failed.fetch_add(1, Ordering::Relaxed);
            warn!("Failed to persist {}: {:#}", job.describe(), e);
        }
    }
}
