//! The two vector indexes (`text` for prose, `code` for source).
//!
//! [`build_indexes`] embeds chunks concurrently but inserts through a single
//! writer: embedding tasks run under a semaphore and hand their results back
//! to the build loop, which is the only code that mutates the indexes and
//! the cache. The build completes before any retrieval starts, so a built
//! [`IndexSet`] is read-only and freely shared.
//!
//! Chunks whose id, content hash, and model match a cached vector are
//! indexed without an `embed` call. Chunks that still fail after retries are
//! left out and reported in [`BuildReport::unindexed`]; the run continues.

use anyhow::Result;
use sqlx::SqlitePool;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::embedding::{cosine_similarity, Embedder};
use crate::error::CapabilityError;
use crate::models::{Chunk, ChunkKind};
use crate::progress::{ProgressEvent, ProgressReporter};
use crate::retry::{with_retry, RetryPolicy};
use crate::store;

struct Entry {
    chunk: Arc<Chunk>,
    vector: Vec<f32>,
}

/// Brute-force cosine index over one collection.
pub struct VectorIndex {
    name: &'static str,
    entries: Vec<Entry>,
}

impl VectorIndex {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            entries: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn insert(&mut self, chunk: Arc<Chunk>, vector: Vec<f32>) {
        self.entries.push(Entry { chunk, vector });
    }

    /// Chunk ids in the index, sorted.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.entries.iter().map(|e| e.chunk.id.clone()).collect();
        ids.sort();
        ids
    }

    /// Top `k` chunks by cosine similarity to `query`, best first.
    pub fn search(&self, query: &[f32], k: usize) -> Vec<(Arc<Chunk>, f32)> {
        let mut scored: Vec<(Arc<Chunk>, f32)> = self
            .entries
            .iter()
            .map(|e| (e.chunk.clone(), cosine_similarity(query, &e.vector)))
            .collect();
        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.id.cmp(&b.0.id))
        });
        scored.truncate(k);
        debug!(index = self.name, k, hits = scored.len(), "vector search");
        scored
    }

    fn sort(&mut self) {
        self.entries.sort_by(|a, b| a.chunk.id.cmp(&b.chunk.id));
    }
}

/// Both indexes plus the embedding space they share.
pub struct IndexSet {
    pub text: VectorIndex,
    pub code: VectorIndex,
    pub model: String,
}

impl IndexSet {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            text: VectorIndex::new("text"),
            code: VectorIndex::new("code"),
            model: model.into(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty() && self.code.is_empty()
    }

    fn for_kind_mut(&mut self, kind: ChunkKind) -> &mut VectorIndex {
        match kind {
            ChunkKind::Prose => &mut self.text,
            ChunkKind::Code => &mut self.code,
        }
    }
}

/// A chunk left out of the index.
#[derive(Debug, Clone)]
pub struct Unindexed {
    pub chunk_id: String,
    pub tag: String,
    pub error: CapabilityError,
}

#[derive(Debug, Default)]
pub struct BuildReport {
    /// Chunks embedded by this build.
    pub embedded: usize,
    /// Chunks indexed from the cache.
    pub reused: usize,
    pub unindexed: Vec<Unindexed>,
    /// Stale cache rows removed.
    pub pruned: u64,
}

pub struct BuildOptions<'a> {
    pub retry: RetryPolicy,
    pub concurrency: usize,
    /// Persisted collections; `None` disables caching.
    pub cache: Option<&'a SqlitePool>,
    pub progress: &'a dyn ProgressReporter,
}

/// Embed `chunks` and build both indexes.
pub async fn build_indexes(
    chunks: &[Chunk],
    embedder: Arc<dyn Embedder>,
    options: BuildOptions<'_>,
) -> Result<(IndexSet, BuildReport)> {
    let model = embedder.model_name().to_string();
    let mut indexes = IndexSet::new(model.clone());
    let mut report = BuildReport::default();
    let total = chunks.len() as u64;
    let mut done = 0u64;

    let cached = match options.cache {
        Some(pool) => store::load_embeddings(pool, &model).await?,
        None => Default::default(),
    };

    let semaphore = Arc::new(Semaphore::new(options.concurrency.max(1)));
    let mut tasks: JoinSet<(Arc<Chunk>, Result<Vec<f32>, CapabilityError>)> = JoinSet::new();

    for chunk in chunks {
        let chunk = Arc::new(chunk.clone());
        if let Some(hit) = cached.get(&chunk.id) {
            if hit.content_hash == chunk.hash && hit.vector.len() == embedder.dims() {
                indexes.for_kind_mut(chunk.kind).insert(chunk, hit.vector.clone());
                report.reused += 1;
                done += 1;
                continue;
            }
        }

        let embedder = embedder.clone();
        let semaphore = semaphore.clone();
        let policy = options.retry.clone();
        tasks.spawn(async move {
            let _permit = semaphore.acquire_owned().await;
            let result = with_retry(&policy, "embed", || embedder.embed(&chunk.text)).await;
            (chunk, result)
        });
    }
    options.progress.report(ProgressEvent::Embedding { n: done, total });

    // Single writer: only this loop touches the indexes and the cache.
    while let Some(joined) = tasks.join_next().await {
        let (chunk, result) = joined?;
        match result {
            Ok(vector) => {
                if let Some(pool) = options.cache {
                    store::save_embedding(pool, &chunk, &model, &vector).await?;
                }
                indexes.for_kind_mut(chunk.kind).insert(chunk, vector);
                report.embedded += 1;
            }
            Err(error) => {
                warn!(chunk = %chunk.tag(), capability = error.capability(), %error, "chunk left unindexed");
                report.unindexed.push(Unindexed {
                    chunk_id: chunk.id.clone(),
                    tag: chunk.tag(),
                    error,
                });
            }
        }
        done += 1;
        options.progress.report(ProgressEvent::Embedding { n: done, total });
    }

    indexes.text.sort();
    indexes.code.sort();
    report.unindexed.sort_by(|a, b| a.tag.cmp(&b.tag));

    if let Some(pool) = options.cache {
        let live: HashSet<String> = chunks.iter().map(|c| c.id.clone()).collect();
        report.pruned = store::prune_embeddings(pool, &live).await?;
        if report.pruned > 0 {
            debug!(pruned = report.pruned, "removed stale cached vectors");
        }
    }

    info!(
        text = indexes.text.len(),
        code = indexes.code.len(),
        embedded = report.embedded,
        reused = report.reused,
        unindexed = report.unindexed.len(),
        "index build complete"
    );
    Ok((indexes, report))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SpanQuality;
    use crate::progress::NoProgress;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct CountingEmbedder {
        calls: AtomicUsize,
        fail_on: Option<&'static str>,
    }

    #[async_trait]
    impl Embedder for CountingEmbedder {
        fn model_name(&self) -> &str {
            "counting"
        }
        fn dims(&self) -> usize {
            2
        }
        async fn embed(&self, text: &str) -> Result<Vec<f32>, CapabilityError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_on == Some(text) {
                return Err(CapabilityError::Status {
                    capability: "embed",
                    status: 503,
                    body: String::new(),
                });
            }
            Ok(vec![text.len() as f32, 1.0])
        }
    }

    fn chunk(id: &str, kind: ChunkKind, text: &str) -> Chunk {
        Chunk {
            id: id.to_string(),
            source_path: format!("{}.src", id),
            start_line: 1,
            end_line: 1,
            kind,
            text: text.to_string(),
            hash: crate::chunk::hash_text(text),
            quality: SpanQuality::Exact,
            symbol: None,
        }
    }

    fn options<'a>(cache: Option<&'a SqlitePool>, progress: &'a NoProgress) -> BuildOptions<'a> {
        BuildOptions {
            retry: RetryPolicy {
                max_retries: 2,
                timeout: Duration::from_secs(5),
                base_delay: Duration::from_millis(1),
            },
            concurrency: 3,
            cache,
            progress,
        }
    }

    #[tokio::test]
    async fn chunks_land_in_their_kind_index() {
        let embedder = Arc::new(CountingEmbedder {
            calls: AtomicUsize::new(0),
            fail_on: None,
        });
        let chunks = vec![
            chunk("a", ChunkKind::Prose, "readme"),
            chunk("b", ChunkKind::Code, "fn main() {}"),
            chunk("c", ChunkKind::Code, "fn other() {}"),
        ];
        let (idx, report) = build_indexes(&chunks, embedder, options(None, &NoProgress))
            .await
            .unwrap();
        assert_eq!(idx.text.ids(), vec!["a"]);
        assert_eq!(idx.code.ids(), vec!["b", "c"]);
        assert_eq!(report.embedded, 3);
        assert!(report.unindexed.is_empty());
    }

    #[tokio::test]
    async fn persistent_failure_is_recorded_not_fatal() {
        let embedder = Arc::new(CountingEmbedder {
            calls: AtomicUsize::new(0),
            fail_on: Some("broken"),
        });
        let chunks = vec![
            chunk("a", ChunkKind::Code, "fine"),
            chunk("b", ChunkKind::Code, "broken"),
        ];
        let (idx, report) = build_indexes(&chunks, embedder.clone(), options(None, &NoProgress))
            .await
            .unwrap();
        assert_eq!(idx.code.ids(), vec!["a"]);
        assert_eq!(report.unindexed.len(), 1);
        assert_eq!(report.unindexed[0].chunk_id, "b");
        // one success plus three attempts for the failing chunk
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn unchanged_chunks_are_reused_from_cache() {
        let tmp = tempfile::TempDir::new().unwrap();
        let pool = crate::db::connect(&tmp.path().join("c.sqlite")).await.unwrap();
        crate::migrate::run_migrations(&pool).await.unwrap();

        let chunks = vec![
            chunk("a", ChunkKind::Prose, "alpha"),
            chunk("b", ChunkKind::Code, "beta"),
        ];
        let first = Arc::new(CountingEmbedder {
            calls: AtomicUsize::new(0),
            fail_on: None,
        });
        let (idx1, _) = build_indexes(&chunks, first.clone(), options(Some(&pool), &NoProgress))
            .await
            .unwrap();
        assert_eq!(first.calls.load(Ordering::SeqCst), 2);

        let second = Arc::new(CountingEmbedder {
            calls: AtomicUsize::new(0),
            fail_on: None,
        });
        let (idx2, report) =
            build_indexes(&chunks, second.clone(), options(Some(&pool), &NoProgress))
                .await
                .unwrap();
        assert_eq!(second.calls.load(Ordering::SeqCst), 0);
        assert_eq!(report.reused, 2);
        assert_eq!(idx1.text.ids(), idx2.text.ids());
        assert_eq!(idx1.code.ids(), idx2.code.ids());
    }

    #[test]
    fn search_orders_by_similarity() {
        let mut idx = VectorIndex::new("code");
        idx.insert(Arc::new(chunk("x", ChunkKind::Code, "x")), vec![1.0, 0.0]);
        idx.insert(Arc::new(chunk("y", ChunkKind::Code, "y")), vec![0.0, 1.0]);
        let hits = idx.search(&[0.9, 0.1], 1);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0.id, "x");
    }
}
