//! SQLite-backed persistence.
//!
//! - **Embedding cache**: the persisted `text` / `code` collections. A chunk
//!   whose id, content hash, and model all match a stored row is indexed
//!   from the cache without calling `embed`.
//! - **Audit log**: one [`VerdictRecord`] per judged draft, keyed by
//!   `(run_id, section_id, revision)`, for external inspection such as CI
//!   quality gates.
//! - **Section outputs**: the final `(Draft, forcedAccept)` of each saved
//!   section.
//!
//! Audit writes go through the [`AuditSink`] trait so tests and dry runs can
//! use [`MemoryAudit`] instead of a database.

use async_trait::async_trait;
use serde::Serialize;
use sqlx::{Row, SqlitePool};
use std::collections::{HashMap, HashSet};
use tokio::sync::Mutex;

use crate::embedding::{blob_to_vec, vec_to_blob};
use crate::models::{Chunk, Draft, SectionOutcome, Verdict};

/// A stored vector and the content hash it was computed from.
#[derive(Debug, Clone)]
pub struct CachedEmbedding {
    pub content_hash: String,
    pub vector: Vec<f32>,
}

/// Load every cached vector produced by `model`, keyed by chunk id.
pub async fn load_embeddings(
    pool: &SqlitePool,
    model: &str,
) -> Result<HashMap<String, CachedEmbedding>, sqlx::Error> {
    let rows = sqlx::query("SELECT chunk_id, content_hash, vector FROM embeddings WHERE model = ?")
        .bind(model)
        .fetch_all(pool)
        .await?;

    Ok(rows
        .into_iter()
        .map(|row| {
            let blob: Vec<u8> = row.get("vector");
            (
                row.get::<String, _>("chunk_id"),
                CachedEmbedding {
                    content_hash: row.get("content_hash"),
                    vector: blob_to_vec(&blob),
                },
            )
        })
        .collect())
}

pub async fn save_embedding(
    pool: &SqlitePool,
    chunk: &Chunk,
    model: &str,
    vector: &[f32],
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO embeddings
            (chunk_id, collection, content_hash, model, dims, vector, source_path, start_line, end_line)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(chunk_id) DO UPDATE SET
            collection = excluded.collection,
            content_hash = excluded.content_hash,
            model = excluded.model,
            dims = excluded.dims,
            vector = excluded.vector
        "#,
    )
    .bind(&chunk.id)
    .bind(chunk.kind.collection())
    .bind(&chunk.hash)
    .bind(model)
    .bind(vector.len() as i64)
    .bind(vec_to_blob(vector))
    .bind(&chunk.source_path)
    .bind(chunk.start_line as i64)
    .bind(chunk.end_line as i64)
    .execute(pool)
    .await?;
    Ok(())
}

/// Drop cached vectors for chunks no longer in the snapshot.
pub async fn prune_embeddings(pool: &SqlitePool, live: &HashSet<String>) -> Result<u64, sqlx::Error> {
    let ids: Vec<String> = sqlx::query_scalar("SELECT chunk_id FROM embeddings")
        .fetch_all(pool)
        .await?;

    let mut removed = 0;
    for id in ids.iter().filter(|id| !live.contains(*id)) {
        removed += sqlx::query("DELETE FROM embeddings WHERE chunk_id = ?")
            .bind(id)
            .execute(pool)
            .await?
            .rows_affected();
    }
    Ok(removed)
}

/// Row counts per collection.
pub async fn collection_counts(pool: &SqlitePool) -> Result<Vec<(String, i64)>, sqlx::Error> {
    let rows = sqlx::query(
        "SELECT collection, COUNT(*) AS n FROM embeddings GROUP BY collection ORDER BY collection",
    )
    .fetch_all(pool)
    .await?;
    Ok(rows
        .into_iter()
        .map(|r| (r.get::<String, _>("collection"), r.get::<i64, _>("n")))
        .collect())
}

// ============ Audit ============

/// Persisted verdict of one draft.
#[derive(Debug, Clone, Serialize)]
pub struct VerdictRecord {
    pub run_id: String,
    pub section_id: String,
    pub revision: u32,
    pub verdict: Verdict,
    pub created_at: i64,
}

#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record_verdict(
        &self,
        run_id: &str,
        draft: &Draft,
        verdict: &Verdict,
    ) -> Result<(), sqlx::Error>;

    async fn record_outcome(&self, run_id: &str, outcome: &SectionOutcome) -> Result<(), sqlx::Error>;
}

pub struct SqliteAudit {
    pool: SqlitePool,
}

impl SqliteAudit {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AuditSink for SqliteAudit {
    async fn record_verdict(
        &self,
        run_id: &str,
        draft: &Draft,
        verdict: &Verdict,
    ) -> Result<(), sqlx::Error> {
        let missing = serde_json::to_string(&verdict.missing_but_expected).unwrap_or_default();
        let unsupported = serde_json::to_string(&verdict.unsupported_claims).unwrap_or_default();
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO verdicts
                (run_id, section_id, revision, factual, cites_ok, hallucinated,
                 missing_json, unsupported_json, score, notes, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(run_id)
        .bind(&draft.section_id)
        .bind(draft.revision as i64)
        .bind(verdict.factual)
        .bind(verdict.cites_ok)
        .bind(verdict.hallucinated)
        .bind(missing)
        .bind(unsupported)
        .bind(verdict.score)
        .bind(&verdict.notes)
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_outcome(&self, run_id: &str, outcome: &SectionOutcome) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO section_outputs
                (run_id, section_id, revision, forced_accept, text, evidence_set_id, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(run_id)
        .bind(&outcome.section_id)
        .bind(outcome.draft.revision as i64)
        .bind(outcome.forced_accept)
        .bind(&outcome.draft.text)
        .bind(&outcome.draft.evidence_set_id)
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// Audit records, newest run first, optionally for one section.
pub async fn list_verdicts(
    pool: &SqlitePool,
    section: Option<&str>,
) -> Result<Vec<VerdictRecord>, sqlx::Error> {
    let rows = sqlx::query(
        r#"
        SELECT run_id, section_id, revision, factual, cites_ok, hallucinated,
               missing_json, unsupported_json, score, notes, created_at
        FROM verdicts
        WHERE (?1 IS NULL OR section_id = ?1)
        ORDER BY created_at DESC, run_id, section_id, revision
        "#,
    )
    .bind(section)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|row| {
            let missing: String = row.get("missing_json");
            let unsupported: String = row.get("unsupported_json");
            VerdictRecord {
                run_id: row.get("run_id"),
                section_id: row.get("section_id"),
                revision: row.get::<i64, _>("revision") as u32,
                verdict: Verdict {
                    factual: row.get("factual"),
                    cites_ok: row.get("cites_ok"),
                    hallucinated: row.get("hallucinated"),
                    missing_but_expected: serde_json::from_str(&missing).unwrap_or_default(),
                    unsupported_claims: serde_json::from_str(&unsupported).unwrap_or_default(),
                    score: row.get("score"),
                    notes: row.get("notes"),
                },
                created_at: row.get("created_at"),
            }
        })
        .collect())
}

/// In-memory audit sink for tests and dry runs.
#[derive(Default)]
pub struct MemoryAudit {
    verdicts: Mutex<Vec<VerdictRecord>>,
    outcomes: Mutex<Vec<SectionOutcome>>,
}

impl MemoryAudit {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn verdicts(&self) -> Vec<VerdictRecord> {
        self.verdicts.lock().await.clone()
    }

    pub async fn verdicts_for(&self, section_id: &str) -> Vec<VerdictRecord> {
        self.verdicts
            .lock()
            .await
            .iter()
            .filter(|r| r.section_id == section_id)
            .cloned()
            .collect()
    }

    pub async fn outcomes(&self) -> Vec<SectionOutcome> {
        self.outcomes.lock().await.clone()
    }
}

#[async_trait]
impl AuditSink for MemoryAudit {
    async fn record_verdict(
        &self,
        run_id: &str,
        draft: &Draft,
        verdict: &Verdict,
    ) -> Result<(), sqlx::Error> {
        self.verdicts.lock().await.push(VerdictRecord {
            run_id: run_id.to_string(),
            section_id: draft.section_id.clone(),
            revision: draft.revision,
            verdict: verdict.clone(),
            created_at: chrono::Utc::now().timestamp(),
        });
        Ok(())
    }

    async fn record_outcome(&self, _run_id: &str, outcome: &SectionOutcome) -> Result<(), sqlx::Error> {
        self.outcomes.lock().await.push(outcome.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ChunkKind, SpanQuality};
    use tempfile::TempDir;

    async fn pool(tmp: &TempDir) -> SqlitePool {
        let pool = crate::db::connect(&tmp.path().join("t.sqlite")).await.unwrap();
        crate::migrate::run_migrations(&pool).await.unwrap();
        pool
    }

    fn chunk(id: &str) -> Chunk {
        Chunk {
            id: id.to_string(),
            source_path: "src/lib.rs".to_string(),
            start_line: 1,
            end_line: 3,
            kind: ChunkKind::Code,
            text: "fn a() {}".to_string(),
            hash: "h1".to_string(),
            quality: SpanQuality::Exact,
            symbol: None,
        }
    }

    fn verdict(score: f64) -> Verdict {
        Verdict {
            factual: true,
            cites_ok: false,
            hallucinated: false,
            missing_but_expected: vec!["ports".to_string()],
            unsupported_claims: Vec::new(),
            score,
            notes: "n".to_string(),
        }
    }

    fn draft(section: &str, revision: u32) -> Draft {
        Draft {
            section_id: section.to_string(),
            text: "t".to_string(),
            evidence_set_id: "e".to_string(),
            revision,
            citations: Vec::new(),
        }
    }

    #[tokio::test]
    async fn embedding_cache_roundtrip_and_prune() {
        let tmp = TempDir::new().unwrap();
        let pool = pool(&tmp).await;

        save_embedding(&pool, &chunk("a"), "m", &[0.5, 0.25]).await.unwrap();
        save_embedding(&pool, &chunk("b"), "m", &[1.0, 0.0]).await.unwrap();

        let cached = load_embeddings(&pool, "m").await.unwrap();
        assert_eq!(cached.len(), 2);
        assert_eq!(cached["a"].vector, vec![0.5, 0.25]);
        assert_eq!(cached["a"].content_hash, "h1");
        assert!(load_embeddings(&pool, "other").await.unwrap().is_empty());

        let live: HashSet<String> = ["a".to_string()].into_iter().collect();
        assert_eq!(prune_embeddings(&pool, &live).await.unwrap(), 1);
        assert_eq!(
            collection_counts(&pool).await.unwrap(),
            vec![("code".to_string(), 1)]
        );
    }

    #[tokio::test]
    async fn verdicts_are_keyed_by_section_and_revision() {
        let tmp = TempDir::new().unwrap();
        let pool = pool(&tmp).await;
        let audit = SqliteAudit::new(pool.clone());

        audit.record_verdict("r1", &draft("api", 0), &verdict(0.2)).await.unwrap();
        audit.record_verdict("r1", &draft("api", 1), &verdict(0.9)).await.unwrap();
        audit.record_verdict("r1", &draft("objective", 0), &verdict(0.8)).await.unwrap();

        let api = list_verdicts(&pool, Some("api")).await.unwrap();
        assert_eq!(api.len(), 2);
        let revisions: HashSet<u32> = api.iter().map(|r| r.revision).collect();
        assert_eq!(revisions, [0, 1].into_iter().collect());
        assert_eq!(api[0].verdict.missing_but_expected, vec!["ports".to_string()]);
        assert_eq!(list_verdicts(&pool, None).await.unwrap().len(), 3);
    }
}
