//! Per-run context.
//!
//! Everything a run needs (built indexes, capabilities, audit sink, policy,
//! cancellation) lives in one [`RunContext`] passed to every component.
//! Nothing is process-global, so two runs can proceed side by side and tests
//! can swap any capability for a fake.

use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::config::{Config, RetrievalConfig, ReviewConfig};
use crate::embedding::Embedder;
use crate::index::IndexSet;
use crate::llm::{Generator, JudgeModel};
use crate::progress::ProgressReporter;
use crate::retry::RetryPolicy;
use crate::store::AuditSink;

/// The three external capabilities the core consumes.
#[derive(Clone)]
pub struct Capabilities {
    pub embedder: Arc<dyn Embedder>,
    pub generator: Arc<dyn Generator>,
    pub judge: Arc<dyn JudgeModel>,
}

pub struct RunContext {
    pub run_id: String,
    pub indexes: Arc<IndexSet>,
    pub capabilities: Capabilities,
    pub audit: Arc<dyn AuditSink>,
    pub progress: Arc<dyn ProgressReporter>,
    pub retrieval: RetrievalConfig,
    pub review: ReviewConfig,
    pub embed_retry: RetryPolicy,
    pub generation_retry: RetryPolicy,
    pub section_concurrency: usize,
    pub cancel: CancellationToken,
}

impl RunContext {
    /// Build a context for one run over already-built indexes.
    pub fn new(
        config: &Config,
        indexes: Arc<IndexSet>,
        capabilities: Capabilities,
        audit: Arc<dyn AuditSink>,
        progress: Arc<dyn ProgressReporter>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            indexes,
            capabilities,
            audit,
            progress,
            retrieval: config.retrieval.clone(),
            review: config.review.clone(),
            embed_retry: RetryPolicy::new(config.embedding.max_retries, config.embedding.timeout_secs),
            generation_retry: RetryPolicy::new(
                config.generation.max_retries,
                config.generation.timeout_secs,
            ),
            section_concurrency: config.run.section_concurrency.max(1),
            cancel,
        }
    }
}
