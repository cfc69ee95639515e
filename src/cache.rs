//! Short-lived cache for read-only store queries.

use crate::store::{ClassEntry, DocumentStore, SessionContext, StageFile};
use anyhow::Result;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

const CONTEXT_TTL: Duration = Duration::from_secs(30);
const STAGES_TTL: Duration = Duration::from_secs(60);
const STAGE_FILES_TTL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
struct Entry<V> {
    value: V,
    /// `None` lives until invalidated.
    expires_at: Option<Instant>,
}

/// In-memory map whose entries expire after a per-insert TTL.
#[derive(Debug, Clone)]
pub struct TtlCache<V> {
    inner: Arc<RwLock<HashMap<String, Entry<V>>>>,
}

impl<V> Default for TtlCache<V> {
    fn default() -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl<V: Clone> TtlCache<V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fresh value for `key`, if any.
    pub fn get(&self, key: &str) -> Option<V> {
        let store = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let entry = store.get(key)?;
        match entry.expires_at {
            Some(at) if Instant::now() >= at => None,
            _ => Some(entry.value.clone()),
        }
    }

    pub fn insert(&self, key: &str, value: V, ttl: Option<Duration>) {
        let mut store = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        store.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: ttl.map(|t| Instant::now() + t),
            },
        );
        tracing::debug!("Cache: stored '{}'", key);
    }

    pub fn invalidate(&self, key: &str) {
        let mut store = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        store.remove(key);
    }

    /// Cached value, or the result of `load` which is then cached.
    /// Errors are not cached.
    pub async fn get_or_load<F, Fut>(&self, key: &str, ttl: Option<Duration>, load: F) -> Result<V>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<V>>,
    {
        if let Some(hit) = self.get(key) {
            return Ok(hit);
        }
        let value = load().await?;
        self.insert(key, value.clone(), ttl);
        Ok(value)
    }
}

/// Read-through cache in front of a [`DocumentStore`].
#[derive(Clone)]
pub struct ReadCache {
    store: Arc<dyn DocumentStore>,
    context: TtlCache<SessionContext>,
    stages: TtlCache<Vec<String>>,
    stage_files: TtlCache<Vec<StageFile>>,
    classes: TtlCache<Vec<ClassEntry>>,
}

impl ReadCache {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self {
            store,
            context: TtlCache::new(),
            stages: TtlCache::new(),
            stage_files: TtlCache::new(),
            classes: TtlCache::new(),
        }
    }

    pub async fn session_context(&self) -> Result<SessionContext> {
        let store = self.store.clone();
        self.context
            .get_or_load("context", Some(CONTEXT_TTL), || async move {
                store.session_context().await
            })
            .await
    }

    pub async fn stages(&self) -> Result<Vec<String>> {
        let store = self.store.clone();
        self.stages
            .get_or_load("stages", Some(STAGES_TTL), || async move {
                store.list_stages().await
            })
            .await
    }

    pub async fn stage_files(&self, stage: &str) -> Result<Vec<StageFile>> {
        let store = self.store.clone();
        let owned = stage.to_string();
        self.stage_files
            .get_or_load(stage, Some(STAGE_FILES_TTL), || async move {
                store.list_stage_files(&owned).await
            })
            .await
    }

    pub async fn classes(&self) -> Result<Vec<ClassEntry>> {
        let store = self.store.clone();
        self.classes
            .get_or_load("classes", None, || async move { store.list_classes().await })
            .await
    }

    /// Drop the class list after a save or delete.
    pub fn invalidate_classes(&self) {
        self.classes.invalidate("classes");
    }

    /// Drop listings touched by an upload into `stage`.
    pub fn invalidate_stage(&self, stage: &str) {
        self.stage_files.invalidate(stage);
        self.stages.invalidate("stages");
    }
}
