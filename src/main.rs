//! Document Intake - classify, extract and batch-process staged documents.

mod ai;
mod auth;
mod batch;
mod cache;
mod config;
mod export;
#[cfg(test)]
mod fakes;
mod history;
mod persist;
mod pipeline;
mod preview;
mod prompts;
mod retry;
mod store;
mod sweep;
mod table;
mod warehouse;

use ai::{AiService, WarehouseAi};
use axum::{
    extract::{DefaultBodyLimit, FromRequest, Multipart, Path, Query, Request, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use batch::{
    BatchConfig, BatchObserver, BatchOutcome, BatchRequest, CancelHandle, Coordinator, Progress,
};
use cache::ReadCache;
use chrono::{DateTime, Utc};
use config::AppConfig;
use export::ExportFormat;
use history::{HistoryFilter, HistorySection};
use pipeline::{Pipeline, PipelineError, PipelineRun};
use prompts::{canonicalize, PromptSchema};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use store::{ClassEntry, DocumentStore, SessionContext, StageFile, UploadRecord, WarehouseStore};
use table::{ColumnOrder, Grid, ResultTable};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use warehouse::WarehouseClient;

type ApiError = (StatusCode, String);

/// Finished runs and batches stay available for polling and export this long.
const RESULT_RETENTION_MINUTES: i64 = 60;

/// Application state shared across handlers.
#[derive(Clone)]
struct AppState {
    config: Arc<AppConfig>,
    ai: Arc<dyn AiService>,
    store: Arc<dyn DocumentStore>,
    cache: ReadCache,
    pipeline: Pipeline,
    runs: Arc<RwLock<HashMap<String, PipelineRun>>>,
    batches: Arc<RwLock<HashMap<String, Arc<BatchRun>>>>,
}

impl AppState {
    fn new(config: AppConfig, ai: Arc<dyn AiService>, store: Arc<dyn DocumentStore>) -> Self {
        let pipeline = Pipeline::new(
            Arc::clone(&ai),
            Arc::clone(&store),
            config.retry,
            config.ocr_timeout,
        );
        Self {
            config: Arc::new(config),
            cache: ReadCache::new(Arc::clone(&store)),
            ai,
            store,
            pipeline,
            runs: Arc::new(RwLock::new(HashMap::new())),
            batches: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "doc_intake=debug,tower_http=debug".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = AppConfig::from_env()?;
    info!(
        "Warehouse {} as {} ({} batch workers)",
        config.warehouse.base_url, config.warehouse.user, config.batch.concurrency
    );

    let warehouse = WarehouseClient::new(config.warehouse.clone());
    let store = WarehouseStore::new(warehouse.clone());
    store.ensure_schema().await?;
    let ai = WarehouseAi::new(warehouse, config.completion_model.clone());

    let bind_addr = config.bind_addr.clone();
    let max_upload = config.max_upload_bytes;
    let state = AppState::new(config, Arc::new(ai), Arc::new(store));

    let app = router(state)
        .layer(DefaultBodyLimit::max(max_upload))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("Server listening on http://{}", bind_addr);
    axum::serve(listener, app).await?;

    Ok(())
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/context", get(get_context))
        .route("/stages", get(list_stages))
        .route("/stages/:stage/files", get(list_stage_files))
        .route("/classes", get(list_classes).post(create_class))
        .route("/classes/preview", post(preview_class))
        .route(
            "/classes/:name",
            get(get_class).put(update_class).delete(delete_class),
        )
        .route("/documents", post(process_document))
        .route("/runs/:id", get(get_run))
        .route("/runs/:id/export", get(export_run))
        .route("/batches", post(start_batch))
        .route("/batches/:id", get(get_batch))
        .route("/batches/:id/cancel", post(cancel_batch))
        .route("/batches/:id/export", get(export_batch))
        .route("/sweeps", post(run_sweep))
        .route("/history", get(get_history))
        .route("/history/:section/export", get(export_history))
        .with_state(state)
}

// ============================================================================
// Handlers
// ============================================================================

/// Health check endpoint.
async fn health() -> &'static str {
    "ok"
}

fn internal(context: &str, e: anyhow::Error) -> ApiError {
    error!("{}: {:#}", context, e);
    (StatusCode::INTERNAL_SERVER_ERROR, format!("{}: {:#}", context, e))
}

#[derive(Serialize)]
struct ContextResponse {
    #[serde(flatten)]
    session: SessionContext,
    /// Stage of the latest upload, used as the default target.
    recent_stage: Option<String>,
}

async fn get_context(State(state): State<AppState>) -> Result<Json<ContextResponse>, ApiError> {
    let session = state
        .cache
        .session_context()
        .await
        .map_err(|e| internal("Failed to read session context", e))?;
    let recent_stage = state.store.recent_stage().await.unwrap_or_else(|e| {
        warn!("Recent stage lookup failed: {:#}", e);
        None
    });
    Ok(Json(ContextResponse {
        session,
        recent_stage,
    }))
}

async fn list_stages(State(state): State<AppState>) -> Result<Json<Vec<String>>, ApiError> {
    state
        .cache
        .stages()
        .await
        .map(Json)
        .map_err(|e| internal("Failed to list stages", e))
}

async fn list_stage_files(
    State(state): State<AppState>,
    Path(stage): Path<String>,
) -> Result<Json<Vec<StageFile>>, ApiError> {
    let stage = checked_stage(&stage)?;
    state
        .cache
        .stage_files(&stage)
        .await
        .map(Json)
        .map_err(|e| internal("Failed to list stage files", e))
}

// ---------------------------------------------------------------------------
// Classes
// ---------------------------------------------------------------------------

async fn list_classes(State(state): State<AppState>) -> Result<Json<Vec<ClassEntry>>, ApiError> {
    state
        .cache
        .classes()
        .await
        .map(Json)
        .map_err(|e| internal("Failed to load classes", e))
}

async fn get_class(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<ClassEntry>, ApiError> {
    let prompts = state
        .store
        .load_prompts(&name)
        .await
        .map_err(|e| internal("Failed to load prompts", e))?
        .ok_or_else(|| (StatusCode::NOT_FOUND, format!("Unknown class: {}", name)))?;
    Ok(Json(ClassEntry {
        class_name: name,
        prompts,
    }))
}

#[derive(Deserialize)]
struct ClassBody {
    class_name: String,
    /// Raw schema; generated by the AI service when omitted on create.
    #[serde(default)]
    prompts: Option<Value>,
}

fn require_class_name(name: &str) -> Result<String, ApiError> {
    let name = name.trim();
    if name.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "Class name is required".to_string()));
    }
    Ok(name.to_string())
}

async fn create_class(
    State(state): State<AppState>,
    Json(body): Json<ClassBody>,
) -> Result<(StatusCode, Json<ClassEntry>), ApiError> {
    let class_name = require_class_name(&body.class_name)?;
    let prompts = match &body.prompts {
        Some(raw) => canonicalize(raw, Some(&class_name)),
        None => retry::run_with_policy("generate prompts", &state.config.retry.generate, |_| {
            state.ai.generate_prompts(&class_name)
        })
        .await
        .map_err(|e| (StatusCode::BAD_GATEWAY, e.to_string()))?,
    };

    save_class(&state, &class_name, &prompts).await?;
    Ok((
        StatusCode::CREATED,
        Json(ClassEntry {
            class_name,
            prompts,
        }),
    ))
}

#[derive(Deserialize)]
struct PromptsBody {
    prompts: Value,
}

async fn update_class(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(body): Json<PromptsBody>,
) -> Result<Json<ClassEntry>, ApiError> {
    let class_name = require_class_name(&name)?;
    let prompts = canonicalize(&body.prompts, Some(&class_name));
    save_class(&state, &class_name, &prompts).await?;
    Ok(Json(ClassEntry {
        class_name,
        prompts,
    }))
}

async fn save_class(state: &AppState, class_name: &str, prompts: &PromptSchema) -> Result<(), ApiError> {
    state
        .store
        .save_prompts(class_name, prompts)
        .await
        .map_err(|e| internal("Save failed", e))?;
    state.cache.invalidate_classes();
    info!(
        "Saved prompts for {} ({} fields)",
        class_name,
        prompts.field_names().len()
    );
    Ok(())
}

async fn delete_class(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<StatusCode, ApiError> {
    state
        .store
        .delete_class(&name)
        .await
        .map_err(|e| internal("Delete failed", e))?;
    state.cache.invalidate_classes();
    info!("Deleted class {}", name);
    Ok(StatusCode::NO_CONTENT)
}

/// Show how a schema will be stored, without saving it.
async fn preview_class(Json(body): Json<ClassBody>) -> Result<Json<Value>, ApiError> {
    let raw = body
        .prompts
        .ok_or_else(|| (StatusCode::BAD_REQUEST, "prompts is required".to_string()))?;
    let class_name = body.class_name.trim();
    let class_name = (!class_name.is_empty()).then_some(class_name);
    Ok(Json(canonicalize(&raw, class_name).to_value()))
}

// ---------------------------------------------------------------------------
// Single document
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct StageQuery {
    stage: Option<String>,
}

fn checked_stage(raw: &str) -> Result<String, ApiError> {
    warehouse::stage_name(raw).map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))
}

/// Explicit stage, else the stage of the latest upload.
async fn resolve_stage(state: &AppState, stage: Option<String>) -> Result<String, ApiError> {
    if let Some(stage) = stage.filter(|s| !s.trim().is_empty()) {
        return checked_stage(&stage);
    }
    let recent = state
        .store
        .recent_stage()
        .await
        .map_err(|e| internal("Failed to read recent stage", e))?
        .ok_or_else(|| {
            (
                StatusCode::BAD_REQUEST,
                "Provide a stage (DB.SCHEMA.STAGE)".to_string(),
            )
        })?;
    checked_stage(&recent)
}

/// Drop runs and batches that finished before the retention window.
fn prune_finished(state: &AppState, now: DateTime<Utc>) {
    let cutoff = now - chrono::Duration::minutes(RESULT_RETENTION_MINUTES);
    state
        .runs
        .write()
        .unwrap_or_else(PoisonError::into_inner)
        .retain(|_, run| run.finished_at > cutoff);
    state
        .batches
        .write()
        .unwrap_or_else(PoisonError::into_inner)
        .retain(|_, batch| batch.snapshot().finished_at.map_or(true, |t| t > cutoff));
}

struct UploadedFile {
    name: String,
    data: Vec<u8>,
}

/// Read every `file` part plus the plain text fields of a multipart body.
async fn read_multipart(
    mut multipart: Multipart,
) -> Result<(Vec<UploadedFile>, HashMap<String, String>), ApiError> {
    let mut files = Vec::new();
    let mut fields = HashMap::new();

    while let Some(field) = multipart.next_field().await.map_err(|e| {
        (StatusCode::BAD_REQUEST, format!("Multipart error: {}", e))
    })? {
        let field_name = field.name().unwrap_or_default().to_string();
        if field_name == "file" {
            let name = field.file_name().unwrap_or("document").to_string();
            let data = field.bytes().await.map_err(|e| {
                (StatusCode::BAD_REQUEST, format!("Failed to read file: {}", e))
            })?;
            files.push(UploadedFile {
                name,
                data: data.to_vec(),
            });
        } else {
            let text = field.text().await.map_err(|e| {
                (StatusCode::BAD_REQUEST, format!("Failed to read field {}: {}", field_name, e))
            })?;
            fields.insert(field_name, text);
        }
    }

    Ok((files, fields))
}

/// Upload a document and run the full pipeline on it.
async fn process_document(
    State(state): State<AppState>,
    Query(query): Query<StageQuery>,
    multipart: Multipart,
) -> Result<Json<PipelineRun>, ApiError> {
    let stage = resolve_stage(&state, query.stage).await?;
    let (files, _) = read_multipart(multipart).await?;
    let file = files
        .into_iter()
        .next()
        .ok_or_else(|| (StatusCode::BAD_REQUEST, "No file uploaded".to_string()))?;

    info!("Received file: {} ({} bytes) for @{}", file.name, file.data.len(), stage);

    let result = state.pipeline.run(&stage, &file.name, file.data).await;
    state.cache.invalidate_stage(&stage);

    let run = result.map_err(|e| {
        error!("Pipeline failed: {}", e);
        pipeline_error(e)
    })?;
    if run.prompts_seeded {
        state.cache.invalidate_classes();
    }

    prune_finished(&state, Utc::now());
    state
        .runs
        .write()
        .unwrap_or_else(PoisonError::into_inner)
        .insert(run.id.clone(), run.clone());
    Ok(Json(run))
}

fn pipeline_error(e: PipelineError) -> ApiError {
    match &e {
        PipelineError::UnsupportedFile(_) | PipelineError::EmptyUpload => {
            (StatusCode::BAD_REQUEST, e.to_string())
        }
        PipelineError::Classification { query, .. } => {
            let mut message = e.to_string();
            if let Some(query) = query {
                message.push_str("\n\n");
                message.push_str(query.trim());
            }
            (StatusCode::BAD_GATEWAY, message)
        }
        PipelineError::Upload { .. } | PipelineError::Prompts(_) | PipelineError::Persist(_) => {
            (StatusCode::BAD_GATEWAY, e.to_string())
        }
    }
}

fn find_run(state: &AppState, id: &str) -> Result<PipelineRun, ApiError> {
    state
        .runs
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .get(id)
        .cloned()
        .ok_or_else(|| (StatusCode::NOT_FOUND, format!("Unknown run: {}", id)))
}

async fn get_run(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<PipelineRun>, ApiError> {
    find_run(&state, &id).map(Json)
}

#[derive(Deserialize)]
struct ExportQuery {
    #[serde(default)]
    format: ExportFormat,
}

fn attachment(format: ExportFormat, stem: &str, body: String) -> Response {
    (
        [
            (header::CONTENT_TYPE, format.content_type().to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", format.file_name(stem)),
            ),
        ],
        body,
    )
        .into_response()
}

/// CSV is one row of answers; JSON is the extraction payload as stored.
async fn export_run(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<ExportQuery>,
) -> Result<Response, ApiError> {
    let run = find_run(&state, &id)?;
    let body = match query.format {
        ExportFormat::Csv => {
            let mut table = ResultTable::new([run.file_name.as_str()]);
            table.merge(&run.file_name, &run.answers);
            export::to_csv(&table.to_grid(ColumnOrder::Discovery))
        }
        ExportFormat::Json => serde_json::to_string_pretty(&run.extraction).map_err(Into::into),
    }
    .map_err(|e| internal("Export failed", e))?;
    Ok(attachment(query.format, "single_result", body))
}

// ---------------------------------------------------------------------------
// Batches
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
enum BatchStatus {
    Running,
    Completed,
    Cancelled,
    Failed,
}

/// Live view of a batch, updated by the coordinator's merge loop.
#[derive(Debug, Clone, Serialize)]
struct BatchSnapshot {
    id: String,
    stage: String,
    class_name: String,
    status: BatchStatus,
    progress: Progress,
    table: Grid,
    succeeded: usize,
    failed: usize,
    skipped: usize,
    persist_attempted: usize,
    persist_failed: usize,
    nothing_to_do: bool,
    error: Option<String>,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
}

struct BatchRun {
    cancel: CancelHandle,
    snapshot: Mutex<BatchSnapshot>,
}

impl BatchRun {
    fn snapshot(&self) -> BatchSnapshot {
        self.snapshot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn update(&self, f: impl FnOnce(&mut BatchSnapshot)) {
        f(&mut self.snapshot.lock().unwrap_or_else(PoisonError::into_inner));
    }

    fn finish(&self, outcome: Result<BatchOutcome, String>) {
        let cancelled = self.cancel.is_cancelled();
        self.update(|s| {
            s.finished_at = Some(Utc::now());
            match outcome {
                Ok(outcome) => {
                    s.table = outcome.table.to_grid(ColumnOrder::Discovery);
                    s.progress = Progress {
                        completed: outcome.succeeded + outcome.failed,
                        total: outcome.total,
                    };
                    s.succeeded = outcome.succeeded;
                    s.failed = outcome.failed;
                    s.skipped = outcome.skipped;
                    s.persist_attempted = outcome.persist.attempted;
                    s.persist_failed = outcome.persist.failed;
                    s.nothing_to_do = outcome.nothing_to_do;
                    s.status = if cancelled && outcome.skipped > 0 {
                        BatchStatus::Cancelled
                    } else {
                        BatchStatus::Completed
                    };
                }
                Err(e) => {
                    s.status = BatchStatus::Failed;
                    s.error = Some(e);
                }
            }
        });
    }
}

struct SnapshotObserver(Arc<BatchRun>);

impl BatchObserver for SnapshotObserver {
    fn on_progress(&mut self, progress: Progress) {
        self.0.update(|s| s.progress = progress);
    }

    fn on_render(&mut self, table: &ResultTable) {
        let grid = table.to_grid(ColumnOrder::Discovery);
        self.0.update(|s| s.table = grid);
    }
}

#[derive(Debug, Default, Deserialize)]
struct BatchBody {
    stage: String,
    class_name: String,
    /// Files to process; the whole stage when empty.
    #[serde(default)]
    items: Vec<String>,
    #[serde(default)]
    concurrency: Option<usize>,
}

/// Start a batch. Accepts a JSON body, or a multipart body whose files are
/// uploaded to the stage first and become the batch items.
async fn start_batch(
    State(state): State<AppState>,
    request: Request,
) -> Result<(StatusCode, Json<BatchSnapshot>), ApiError> {
    let is_multipart = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map_or(false, |ct| ct.starts_with("multipart/form-data"));

    let body = if is_multipart {
        let multipart = Multipart::from_request(request, &state)
            .await
            .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;
        batch_from_upload(&state, multipart).await?
    } else {
        let Json(body) = Json::<BatchBody>::from_request(request, &state)
            .await
            .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;
        body
    };

    let snapshot = launch_batch(&state, body).await?;
    Ok((StatusCode::ACCEPTED, Json(snapshot)))
}

async fn batch_from_upload(state: &AppState, multipart: Multipart) -> Result<BatchBody, ApiError> {
    let (files, fields) = read_multipart(multipart).await?;
    let stage = resolve_stage(state, fields.get("stage").cloned()).await?;
    let class_name = fields.get("class_name").cloned().unwrap_or_default();
    let concurrency = fields
        .get("concurrency")
        .map(|raw| {
            raw.trim()
                .parse::<usize>()
                .map_err(|e| (StatusCode::BAD_REQUEST, format!("Invalid concurrency: {}", e)))
        })
        .transpose()?;

    let mut items = Vec::with_capacity(files.len());
    for file in files {
        if !preview::is_supported(&file.name) {
            return Err((
                StatusCode::BAD_REQUEST,
                format!("Unsupported file type: {}", file.name),
            ));
        }
        state
            .store
            .put_file(&stage, &file.name, file.data)
            .await
            .map_err(|e| internal("Staging upload failed", e))?;
        state
            .store
            .upsert_upload(&UploadRecord {
                file_name: file.name.clone(),
                file_ref: format!("@{}/{}", stage, file.name),
                stage_name: stage.clone(),
                processed: false,
            })
            .await
            .map_err(|e| internal("Staging upload failed", e))?;
        items.push(file.name);
    }
    state.cache.invalidate_stage(&stage);

    Ok(BatchBody {
        stage,
        class_name,
        items,
        concurrency,
    })
}

/// Server batch settings with the request's worker count, capped at the
/// larger of the configured count and `MAX_CONCURRENCY`.
fn batch_config(state: &AppState, concurrency: Option<usize>) -> Result<BatchConfig, ApiError> {
    let mut config = state.config.batch.clone();
    if let Some(n) = concurrency {
        config.concurrency = n.min(config.concurrency.max(batch::MAX_CONCURRENCY));
    }
    config
        .validate()
        .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;
    Ok(config)
}

async fn launch_batch(state: &AppState, body: BatchBody) -> Result<BatchSnapshot, ApiError> {
    let class_name = require_class_name(&body.class_name)?;
    let stage = resolve_stage(state, Some(body.stage)).await?;

    let config = batch_config(state, body.concurrency)?;

    let prompts = state
        .store
        .load_prompts(&class_name)
        .await
        .map_err(|e| internal("Failed to load prompts", e))?
        .ok_or_else(|| (StatusCode::NOT_FOUND, format!("Unknown class: {}", class_name)))?;

    let items = if body.items.is_empty() {
        state
            .store
            .list_stage_files(&stage)
            .await
            .map_err(|e| internal("Failed to list stage files", e))?
            .into_iter()
            .map(|f| f.relative_path)
            .collect()
    } else {
        body.items
    };

    let id = uuid::Uuid::new_v4().to_string();
    let initial = ResultTable::new(&items);
    let run = Arc::new(BatchRun {
        cancel: CancelHandle::new(),
        snapshot: Mutex::new(BatchSnapshot {
            id: id.clone(),
            stage: stage.clone(),
            class_name: class_name.clone(),
            status: BatchStatus::Running,
            progress: Progress {
                completed: 0,
                total: initial.len(),
            },
            table: initial.to_grid(ColumnOrder::Discovery),
            succeeded: 0,
            failed: 0,
            skipped: 0,
            persist_attempted: 0,
            persist_failed: 0,
            nothing_to_do: false,
            error: None,
            started_at: Utc::now(),
            finished_at: None,
        }),
    });
    prune_finished(state, Utc::now());
    state
        .batches
        .write()
        .unwrap_or_else(PoisonError::into_inner)
        .insert(id.clone(), Arc::clone(&run));

    let coordinator =
        Coordinator::new(Arc::clone(&state.ai), config).with_store(Arc::clone(&state.store));
    let request = BatchRequest {
        stage,
        class_name,
        prompts,
        items,
    };
    let task_run = Arc::clone(&run);
    tokio::spawn(async move {
        let mut observer = SnapshotObserver(Arc::clone(&task_run));
        let outcome = coordinator
            .run(request, &mut observer, &task_run.cancel)
            .await
            .map_err(|e| e.to_string());
        task_run.finish(outcome);
    });

    info!("Batch {} queued", id);
    Ok(run.snapshot())
}

fn find_batch(state: &AppState, id: &str) -> Result<Arc<BatchRun>, ApiError> {
    state
        .batches
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .get(id)
        .cloned()
        .ok_or_else(|| (StatusCode::NOT_FOUND, format!("Unknown batch: {}", id)))
}

async fn get_batch(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<BatchSnapshot>, ApiError> {
    find_batch(&state, &id).map(|run| Json(run.snapshot()))
}

async fn cancel_batch(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<BatchSnapshot>), ApiError> {
    let run = find_batch(&state, &id)?;
    run.cancel.cancel();
    info!("Batch {} cancellation requested", id);
    Ok((StatusCode::ACCEPTED, Json(run.snapshot())))
}

async fn export_batch(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<ExportQuery>,
) -> Result<Response, ApiError> {
    let snapshot = find_batch(&state, &id)?.snapshot();
    let body = export::render(&snapshot.table, query.format)
        .map_err(|e| internal("Export failed", e))?;
    Ok(attachment(query.format, "batch_stream_results", body))
}

// ---------------------------------------------------------------------------
// Stage sweep
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct SweepBody {
    stage: String,
    class_name: String,
    /// Return a download instead of JSON.
    #[serde(default)]
    format: Option<ExportFormat>,
}

#[derive(Serialize)]
struct SweepResponse {
    #[serde(flatten)]
    summary: sweep::SweepSummary,
    table: Grid,
}

async fn run_sweep(
    State(state): State<AppState>,
    Json(body): Json<SweepBody>,
) -> Result<Response, ApiError> {
    let class_name = require_class_name(&body.class_name)?;
    let stage = resolve_stage(&state, Some(body.stage)).await?;
    let prompts = state
        .store
        .load_prompts(&class_name)
        .await
        .map_err(|e| internal("Failed to load prompts", e))?
        .ok_or_else(|| (StatusCode::NOT_FOUND, format!("Unknown class: {}", class_name)))?;

    let outcome = sweep::sweep_stage(state.ai.as_ref(), &stage, &prompts, &state.config.retry.extract)
        .await
        .map_err(|e| (StatusCode::BAD_GATEWAY, e.to_string()))?;
    if outcome.table.is_empty() {
        return Err((
            StatusCode::NOT_FOUND,
            format!("No files in @{} or no results", stage),
        ));
    }

    let table = outcome.table.to_grid(ColumnOrder::Discovery);
    match body.format {
        Some(format) => {
            let body = export::render(&table, format).map_err(|e| internal("Export failed", e))?;
            Ok(attachment(format, "batch_sql_results", body))
        }
        None => Ok(Json(SweepResponse {
            summary: outcome.summary(),
            table,
        })
        .into_response()),
    }
}

// ---------------------------------------------------------------------------
// History
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
struct HistoryQuery {
    /// Comma-separated class names.
    classes: Option<String>,
    stage: Option<String>,
    file: Option<String>,
    #[serde(default)]
    format: ExportFormat,
}

impl HistoryQuery {
    fn filter(&self) -> HistoryFilter {
        HistoryFilter::from_parts(
            self.classes.as_deref(),
            self.stage.as_deref(),
            self.file.as_deref(),
        )
    }
}

#[derive(Serialize)]
struct HistoryResponse {
    filter: HistoryFilter,
    classes: Vec<serde_json::Map<String, Value>>,
    documents: Vec<serde_json::Map<String, Value>>,
    fields: Vec<serde_json::Map<String, Value>>,
}

async fn get_history(
    State(state): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<HistoryResponse>, ApiError> {
    let filter = query.filter();
    let mut sections = Vec::with_capacity(HistorySection::ALL.len());
    for section in HistorySection::ALL {
        let grid = state
            .store
            .query_grid(section, &filter)
            .await
            .map_err(|e| internal("History query failed", e))?;
        sections.push(grid.to_records());
    }
    let mut sections = sections.into_iter();
    Ok(Json(HistoryResponse {
        filter,
        classes: sections.next().unwrap_or_default(),
        documents: sections.next().unwrap_or_default(),
        fields: sections.next().unwrap_or_default(),
    }))
}

async fn export_history(
    State(state): State<AppState>,
    Path(section): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Result<Response, ApiError> {
    let section: HistorySection = serde_json::from_value(Value::String(section.clone()))
        .map_err(|_| (StatusCode::NOT_FOUND, format!("Unknown history section: {}", section)))?;
    let grid = state
        .store
        .query_grid(section, &query.filter())
        .await
        .map_err(|e| internal("History query failed", e))?;
    let body = export::render(&grid, query.format).map_err(|e| internal("Export failed", e))?;
    Ok(attachment(query.format, section.export_stem(), body))
}
