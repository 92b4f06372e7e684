//! Retriever: section query → ranked, deduplicated [`EvidenceSet`].
//!
//! # Algorithm
//!
//! 1. Render the section's query template. `{{section:<id>}}` expands to the
//!    saved text of an earlier section (e.g. the detected technologies).
//! 2. Embed the rendered query once and search the `text` index (top
//!    `k_text`) and, for [`Route::Both`], the `code` index (top `k_code`).
//! 3. Drop hits below `min_similarity`.
//! 4. Merge both lists in one total order: score descending, then shorter
//!    span, then path ascending, then start line ascending, then chunk id.
//! 5. Deduplicate by chunk id, apply the per-file cap (README-like files
//!    get one chunk), and truncate to `final_limit`.
//!
//! An empty result is valid: the drafter answers it with unsupported
//! markers instead of retrying with weaker relevance.

use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

use crate::config::RetrievalConfig;
use crate::embedding::Embedder;
use crate::error::CapabilityError;
use crate::index::IndexSet;
use crate::models::{Chunk, Evidence, EvidenceSet, Route, SectionSpec};
use crate::retry::{with_retry, RetryPolicy};

const SECTION_REF_OPEN: &str = "{{section:";
const SECTION_REF_CLOSE: &str = "}}";

/// Section ids referenced by a query template, in order of first use.
pub fn template_dependencies(template: &str) -> Vec<String> {
    let mut deps: Vec<String> = Vec::new();
    let mut rest = template;
    while let Some(open) = rest.find(SECTION_REF_OPEN) {
        let after = &rest[open + SECTION_REF_OPEN.len()..];
        let Some(close) = after.find(SECTION_REF_CLOSE) else {
            break;
        };
        let id = after[..close].trim().to_string();
        if !id.is_empty() && !deps.contains(&id) {
            deps.push(id);
        }
        rest = &after[close + SECTION_REF_CLOSE.len()..];
    }
    deps
}

/// Expand `{{section:<id>}}` references with saved section text.
///
/// References to sections without saved text expand to nothing.
pub fn render_query(template: &str, saved: &HashMap<String, String>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find(SECTION_REF_OPEN) {
        out.push_str(&rest[..open]);
        let after = &rest[open + SECTION_REF_OPEN.len()..];
        let Some(close) = after.find(SECTION_REF_CLOSE) else {
            out.push_str(&rest[open..]);
            return out;
        };
        let id = after[..close].trim();
        if let Some(text) = saved.get(id) {
            out.push_str(text.trim());
        }
        rest = &after[close + SECTION_REF_CLOSE.len()..];
    }
    out.push_str(rest);
    out.trim().to_string()
}

/// Retrieve evidence for one section.
pub async fn retrieve(
    spec: &SectionSpec,
    query: &str,
    indexes: &IndexSet,
    embedder: &dyn Embedder,
    config: &RetrievalConfig,
    retry: &RetryPolicy,
) -> Result<EvidenceSet, CapabilityError> {
    let vector = with_retry(retry, "embed", || embedder.embed(query)).await?;

    let k_text = spec.k_text.unwrap_or(config.k_text);
    let k_code = spec.k_code.unwrap_or(config.k_code);

    let mut hits = indexes.text.search(&vector, k_text);
    if spec.route == Route::Both {
        hits.extend(indexes.code.search(&vector, k_code));
    }
    debug!(section = %spec.id, candidates = hits.len(), "retrieved candidates");

    Ok(select_evidence(hits, config))
}

/// Merge, threshold, dedupe, cap. Pure so the ordering is testable.
pub fn select_evidence(hits: Vec<(Arc<Chunk>, f32)>, config: &RetrievalConfig) -> EvidenceSet {
    let mut hits: Vec<(Arc<Chunk>, f32)> = hits
        .into_iter()
        .filter(|(_, score)| *score >= config.min_similarity)
        .collect();
    hits.sort_by(|a, b| evidence_order(a, b));

    let mut seen = HashSet::new();
    let mut per_file: HashMap<String, usize> = HashMap::new();
    let mut items = Vec::new();
    for (chunk, score) in hits {
        if items.len() >= config.final_limit {
            break;
        }
        if !seen.insert(chunk.id.clone()) {
            continue;
        }
        let used = per_file.entry(chunk.source_path.clone()).or_default();
        if *used >= file_cap(&chunk.source_path, config.max_chunks_per_file) {
            continue;
        }
        *used += 1;
        items.push(Evidence { chunk, score });
    }

    EvidenceSet {
        id: evidence_set_id(&items),
        items,
    }
}

fn evidence_order(a: &(Arc<Chunk>, f32), b: &(Arc<Chunk>, f32)) -> Ordering {
    b.1.partial_cmp(&a.1)
        .unwrap_or(Ordering::Equal)
        .then_with(|| a.0.span_len().cmp(&b.0.span_len()))
        .then_with(|| a.0.source_path.cmp(&b.0.source_path))
        .then_with(|| a.0.start_line.cmp(&b.0.start_line))
        .then_with(|| a.0.id.cmp(&b.0.id))
}

/// README-like files describe everything at once; one chunk of each is enough.
fn file_cap(path: &str, default_cap: usize) -> usize {
    let name = path.rsplit('/').next().unwrap_or(path).to_lowercase();
    if name.starts_with("readme") || name == "requirements.txt" {
        1
    } else {
        default_cap.max(1)
    }
}

fn evidence_set_id(items: &[Evidence]) -> String {
    let mut hasher = Sha256::new();
    for e in items {
        hasher.update(e.chunk.id.as_bytes());
        hasher.update([0u8]);
    }
    let digest = format!("{:x}", hasher.finalize());
    digest[..32].to_string()
}

/// Render evidence as tagged snippets for a prompt.
///
/// Each snippet starts with its `[path:start-end]` tag. Snippets are cut at
/// `snippet_chars` and the whole context stops at `max_context_chars`.
pub fn render_context(evidence: &EvidenceSet, config: &RetrievalConfig) -> String {
    let mut parts: Vec<String> = Vec::new();
    let mut total = 0;
    for e in &evidence.items {
        let text = &e.chunk.text;
        let snippet = match text.char_indices().nth(config.snippet_chars) {
            Some((cut, _)) => format!("{}…", &text[..cut]),
            None => text.clone(),
        };
        let entry = format!("[{}]\n{}", e.chunk.tag(), snippet);
        if total + entry.len() > config.max_context_chars && !parts.is_empty() {
            debug!(skipped = %e.chunk.tag(), "context budget reached");
            break;
        }
        total += entry.len();
        parts.push(entry);
    }
    parts.join("\n\n")
}
