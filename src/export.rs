//! Write section outcomes for the document assembly step.
//!
//! Produces one Markdown file per section (`NN-<id>.md`, `# <title>` then
//! the saved text) and a `manifest.json` holding every
//! `(Draft, Verdict, forcedAccept)` tuple in document order.

use anyhow::{Context, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};

use crate::models::{Citation, SectionOutcome, Verdict};

#[derive(Serialize)]
struct Manifest<'a> {
    run_id: &'a str,
    generated_at: String,
    cancelled: bool,
    sections: Vec<ManifestSection<'a>>,
}

#[derive(Serialize)]
struct ManifestSection<'a> {
    id: &'a str,
    title: &'a str,
    order: u32,
    file: String,
    revision: u32,
    attempts: u32,
    forced_accept: bool,
    evidence_set_id: &'a str,
    citations: &'a [Citation],
    verdict: &'a Verdict,
}

fn section_file_name(outcome: &SectionOutcome) -> String {
    format!("{:02}-{}.md", outcome.order, outcome.section_id)
}

/// Write section files and the manifest into `dir`; returns the manifest path.
pub fn write_outputs(
    dir: &Path,
    run_id: &str,
    outcomes: &[SectionOutcome],
    cancelled: bool,
) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create output directory: {}", dir.display()))?;

    let mut sections = Vec::with_capacity(outcomes.len());
    for outcome in outcomes {
        let file = section_file_name(outcome);
        let body = format!("# {}\n\n{}\n", outcome.title, outcome.draft.text.trim_end());
        std::fs::write(dir.join(&file), body)
            .with_context(|| format!("Failed to write section {}", outcome.section_id))?;

        sections.push(ManifestSection {
            id: &outcome.section_id,
            title: &outcome.title,
            order: outcome.order,
            file,
            revision: outcome.draft.revision,
            attempts: outcome.attempts,
            forced_accept: outcome.forced_accept,
            evidence_set_id: &outcome.draft.evidence_set_id,
            citations: &outcome.draft.citations,
            verdict: &outcome.verdict,
        });
    }

    let manifest = Manifest {
        run_id,
        generated_at: chrono::Utc::now().to_rfc3339(),
        cancelled,
        sections,
    };
    let path = dir.join("manifest.json");
    std::fs::write(&path, serde_json::to_string_pretty(&manifest)?)?;
    Ok(path)
}
