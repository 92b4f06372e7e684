//! End-to-end run: snapshot → chunks → indexes (barrier) → sections.
//!
//! The index build finishes before the first retrieval. Run-level faults
//! ([`RunError::EmptyIndexes`], [`RunError::Cancelled`]) come back inside
//! the `anyhow::Error` so callers can tell them apart from section
//! degradations, which are carried in the report instead.

use anyhow::Result;
use sqlx::SqlitePool;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, Instrument};

use crate::chunk::{chunk_snapshot, ChunkReport};
use crate::config::Config;
use crate::context::{Capabilities, RunContext};
use crate::embedding::Embedder;
use crate::error::RunError;
use crate::index::{build_indexes, BuildOptions, BuildReport, IndexSet};
use crate::models::SectionSpec;
use crate::orchestrator::{run_sections, RunReport};
use crate::progress::{ProgressEvent, ProgressReporter};
use crate::retrieve::template_dependencies;
use crate::retry::RetryPolicy;
use crate::snapshot::read_snapshot;
use crate::store::AuditSink;

/// Read and chunk a repository checkout.
pub fn chunk_repository(repo: &Path, config: &Config) -> Result<ChunkReport> {
    let snapshot = read_snapshot(repo, &config.chunking)?;
    let files = snapshot.files.len();
    let report = chunk_snapshot(&snapshot, &config.chunking);
    info!(
        files,
        chunks = report.chunks.len(),
        approximate = report.approximate_files.len(),
        hard_splits = report.hard_splits.len(),
        oversized_lines = report.oversized_lines.len(),
        issues = report.issues.len(),
        "chunked snapshot"
    );
    Ok(report)
}

/// Chunk a repository and build both indexes.
pub async fn index_repository(
    repo: &Path,
    config: &Config,
    embedder: Arc<dyn Embedder>,
    cache: Option<&SqlitePool>,
    progress: &dyn ProgressReporter,
) -> Result<(ChunkReport, IndexSet, BuildReport)> {
    let chunks = chunk_repository(repo, config)?;
    let files: HashSet<&str> = chunks.chunks.iter().map(|c| c.source_path.as_str()).collect();
    progress.report(ProgressEvent::Chunked {
        files: files.len() as u64,
        chunks: chunks.chunks.len() as u64,
    });

    let options = BuildOptions {
        retry: RetryPolicy::new(config.embedding.max_retries, config.embedding.timeout_secs),
        concurrency: config.embedding.concurrency,
        cache,
        progress,
    };
    let (indexes, build) = build_indexes(&chunks.chunks, embedder, options).await?;
    Ok((chunks, indexes, build))
}

/// Sections to run: the requested ids plus everything their templates need.
pub fn select_sections(all: &[SectionSpec], only: &[String]) -> Result<Vec<SectionSpec>, RunError> {
    if only.is_empty() {
        return Ok(all.to_vec());
    }
    let mut wanted: HashSet<String> = HashSet::new();
    let mut stack: Vec<String> = only.to_vec();
    while let Some(id) = stack.pop() {
        let spec = all
            .iter()
            .find(|s| s.id == id)
            .ok_or_else(|| RunError::Config(format!("unknown section '{}'", id)))?;
        if wanted.insert(id) {
            stack.extend(template_dependencies(&spec.query));
        }
    }
    Ok(all.iter().filter(|s| wanted.contains(&s.id)).cloned().collect())
}

pub struct PipelineReport {
    pub run_id: String,
    pub chunks: ChunkReport,
    pub build: BuildReport,
    pub run: RunReport,
}

pub struct PipelineInputs<'a> {
    pub capabilities: Capabilities,
    pub audit: Arc<dyn AuditSink>,
    pub cache: Option<&'a SqlitePool>,
    pub progress: Arc<dyn ProgressReporter>,
    pub cancel: CancellationToken,
    /// Restrict the run to these section ids (and their dependencies).
    pub only: Vec<String>,
}

/// Run the whole pipeline over a repository checkout.
pub async fn run_pipeline(repo: &Path, config: &Config, inputs: PipelineInputs<'_>) -> Result<PipelineReport> {
    let sections = select_sections(&config.sections, &inputs.only)?;

    let (chunks, indexes, build) = index_repository(
        repo,
        config,
        inputs.capabilities.embedder.clone(),
        inputs.cache,
        inputs.progress.as_ref(),
    )
    .await?;

    if indexes.is_empty() {
        return Err(RunError::EmptyIndexes.into());
    }
    if inputs.cancel.is_cancelled() {
        return Err(RunError::Cancelled.into());
    }

    let ctx = Arc::new(RunContext::new(
        config,
        Arc::new(indexes),
        inputs.capabilities,
        inputs.audit,
        inputs.progress,
        inputs.cancel,
    ));
    let run_id = ctx.run_id.clone();
    info!(%run_id, sections = sections.len(), "starting sections");

    let run = run_sections(ctx, &sections)
        .instrument(tracing::info_span!("run", %run_id))
        .await?;
    Ok(PipelineReport {
        run_id,
        chunks,
        build,
        run,
    })
}
