//! # Synchronizer
//!
//! Rebuilds both knowledge collections from the source and swaps them in.
//!
//! A rebuild fetches and embeds every category first; only when all of them
//! built cleanly are the index slots replaced, one pointer swap per category.
//! A failure anywhere leaves the served collections exactly as they were.
//! Rebuilds never queue: a second one while the first is running is rejected
//! with [`SyncError::InProgress`].

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info};

use crate::cache::ResponseCache;
use crate::embedding::EmbeddingService;
use crate::error::SyncError;
use crate::index::{Category, Collection, KnowledgeEntry, KnowledgeIndex};
use crate::metrics::Metrics;
use crate::retry::{RetryPolicy, retry_with_backoff};
use crate::source::KnowledgeSource;

/// Where a category comes from and which model embeds it.
#[derive(Debug, Clone, PartialEq)]
pub struct CategoryBinding {
    pub category: Category,
    /// Name passed to [`KnowledgeSource::fetch_category`].
    pub source_name: String,
    pub model_id: String,
}

impl CategoryBinding {
    pub fn new(category: Category, source_name: &str, model_id: &str) -> Self {
        Self {
            category,
            source_name: source_name.to_string(),
            model_id: model_id.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub entries: BTreeMap<Category, usize>,
    pub finished_at: DateTime<Utc>,
    pub elapsed_ms: u64,
}

pub struct Synchronizer {
    source: Arc<dyn KnowledgeSource>,
    embeddings: Arc<EmbeddingService>,
    index: Arc<KnowledgeIndex>,
    cache: Arc<ResponseCache>,
    metrics: Arc<Metrics>,
    bindings: Vec<CategoryBinding>,
    retry: RetryPolicy,
    running: tokio::sync::Mutex<()>,
}

impl Synchronizer {
    pub fn new(
        source: Arc<dyn KnowledgeSource>,
        embeddings: Arc<EmbeddingService>,
        index: Arc<KnowledgeIndex>,
        cache: Arc<ResponseCache>,
        metrics: Arc<Metrics>,
        bindings: Vec<CategoryBinding>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            source,
            embeddings,
            index,
            cache,
            metrics,
            bindings,
            retry,
            running: tokio::sync::Mutex::new(()),
        }
    }

    /// Rebuild every bound category and swap the results in.
    pub async fn rebuild(&self) -> Result<SyncReport, SyncError> {
        let _running = self.running.try_lock().map_err(|_| SyncError::InProgress)?;
        let started = Instant::now();
        info!("knowledge base rebuild started");

        let result = self.build_all().await;
        self.metrics.record_sync(result.is_ok());

        let built = match result {
            Ok(built) => built,
            Err(err) => {
                error!("knowledge base rebuild failed: {err}");
                return Err(err);
            }
        };

        let mut entries = BTreeMap::new();
        for collection in built {
            entries.insert(collection.category(), collection.len());
            let previous = self.index.swap(collection);
            debug!(
                "swapped {} collection ({} entries replaced)",
                previous.category(),
                previous.len()
            );
        }
        self.cache.clear();

        let report = SyncReport {
            entries,
            finished_at: Utc::now(),
            elapsed_ms: started.elapsed().as_millis() as u64,
        };
        info!(
            "knowledge base rebuilt in {}ms: {:?}",
            report.elapsed_ms, report.entries
        );
        Ok(report)
    }

    async fn build_all(&self) -> Result<Vec<Collection>, SyncError> {
        let mut built = Vec::with_capacity(self.bindings.len());
        for binding in &self.bindings {
            built.push(self.build_one(binding).await?);
        }
        Ok(built)
    }

    async fn build_one(&self, binding: &CategoryBinding) -> Result<Collection, SyncError> {
        let category = binding.category;
        let label = format!("fetch {}", binding.source_name);

        let pairs = retry_with_backoff(
            &self.retry,
            &label,
            |e: &crate::error::SourceError| e.is_transient(),
            || self.source.fetch_category(&binding.source_name),
        )
        .await
        .map_err(|source| SyncError::Source { category, source })?;

        let dimension = self
            .embeddings
            .dimension(&binding.model_id)
            .map_err(|source| SyncError::Embedding { category, source })?;

        let keys: Vec<String> = pairs.iter().map(|(key, _)| key.clone()).collect();
        let vectors = if keys.is_empty() {
            Vec::new()
        } else {
            self.embeddings
                .embed_batch(keys, &binding.model_id)
                .await
                .map_err(|source| SyncError::Embedding { category, source })?
        };

        let entries = pairs
            .iter()
            .zip(vectors)
            .map(|((key, answer), embedding)| KnowledgeEntry::new(category, key, answer, embedding))
            .collect();

        let collection = Collection::build(category, &binding.model_id, dimension, entries)
            .map_err(|source| SyncError::Index { category, source })?;
        debug!("built {category} collection with {} entries", collection.len());
        Ok(collection)
    }

    /// Rebuild after `initial_delay`, then every `interval`, until the handle is aborted.
    /// Failures are logged and the loop keeps going.
    pub fn spawn_periodic(self: Arc<Self>, initial_delay: Duration, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            tokio::time::sleep(initial_delay).await;
            loop {
                if let Err(SyncError::InProgress) = self.rebuild().await {
                    debug!("periodic rebuild skipped: one is running");
                }
                tokio::time::sleep(interval).await;
            }
        })
    }
}
