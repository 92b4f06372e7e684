use sqlx::SqlitePool;

/// Create every table repodoc uses. Safe to run on each start.
pub async fn run_migrations(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    // Persisted index artifacts: one row per embedded chunk.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS embeddings (
            chunk_id TEXT PRIMARY KEY,
            collection TEXT NOT NULL,
            content_hash TEXT NOT NULL,
            model TEXT NOT NULL,
            dims INTEGER NOT NULL,
            vector BLOB NOT NULL,
            source_path TEXT NOT NULL,
            start_line INTEGER NOT NULL,
            end_line INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Verdict audit log, one row per judged draft.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS verdicts (
            run_id TEXT NOT NULL,
            section_id TEXT NOT NULL,
            revision INTEGER NOT NULL,
            factual INTEGER NOT NULL,
            cites_ok INTEGER NOT NULL,
            hallucinated INTEGER NOT NULL,
            missing_json TEXT NOT NULL DEFAULT '[]',
            unsupported_json TEXT NOT NULL DEFAULT '[]',
            score REAL NOT NULL,
            notes TEXT NOT NULL DEFAULT '',
            created_at INTEGER NOT NULL,
            PRIMARY KEY (run_id, section_id, revision)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Final section outcomes only; abandoned sections never land here.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS section_outputs (
            run_id TEXT NOT NULL,
            section_id TEXT NOT NULL,
            revision INTEGER NOT NULL,
            forced_accept INTEGER NOT NULL,
            text TEXT NOT NULL,
            evidence_set_id TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            PRIMARY KEY (run_id, section_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_embeddings_collection ON embeddings(collection)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_verdicts_section ON verdicts(section_id)")
        .execute(pool)
        .await?;

    Ok(())
}
