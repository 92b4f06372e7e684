//! Core data models used throughout repodoc.
//!
//! These types represent the chunks, evidence sets, drafts, and verdicts
//! that flow through the chunk → index → retrieve → draft → judge pipeline.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Which index a chunk belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkKind {
    Prose,
    Code,
}

impl ChunkKind {
    /// Name of the persisted collection holding chunks of this kind.
    pub fn collection(&self) -> &'static str {
        match self {
            ChunkKind::Prose => "text",
            ChunkKind::Code => "code",
        }
    }
}

impl fmt::Display for ChunkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChunkKind::Prose => write!(f, "prose"),
            ChunkKind::Code => write!(f, "code"),
        }
    }
}

/// How trustworthy a chunk's line span is as a semantic unit.
///
/// `Approximate` chunks come from files whose syntax tree could not be
/// built; their spans follow paragraph breaks instead of definitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpanQuality {
    Exact,
    Approximate,
}

/// A provenance-tagged unit of repository content.
///
/// `text` is exactly lines `start_line..=end_line` (1-based) of the source
/// file joined with `\n`. Chunks are immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    /// Deterministic id derived from path, span, and kind.
    pub id: String,
    /// Repository-relative path with `/` separators.
    pub source_path: String,
    pub start_line: usize,
    pub end_line: usize,
    pub kind: ChunkKind,
    pub text: String,
    /// SHA-256 of `text`, used to detect stale embeddings.
    pub hash: String,
    pub quality: SpanQuality,
    /// Definition name for code chunks cut from a syntax tree.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
}

impl Chunk {
    /// Number of lines covered by the span.
    pub fn span_len(&self) -> usize {
        self.end_line - self.start_line + 1
    }

    /// The `path:start-end` tag used in prompts and citations.
    pub fn tag(&self) -> String {
        format!("{}:{}-{}", self.source_path, self.start_line, self.end_line)
    }
}

/// Which indexes a section queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Route {
    /// Prose index only, for narrative sections.
    Text,
    /// Prose and code indexes.
    #[default]
    Both,
}

/// Static configuration of one document section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SectionSpec {
    pub id: String,
    /// Position in the assembled document; does not constrain generation order.
    pub order: u32,
    pub title: String,
    /// Retrieval query template. `{{section:<id>}}` expands to the saved
    /// text of an earlier section.
    pub query: String,
    #[serde(default)]
    pub route: Route,
    #[serde(default)]
    pub k_text: Option<usize>,
    #[serde(default)]
    pub k_code: Option<usize>,
    #[serde(default)]
    pub guidance: String,
    #[serde(default)]
    pub additional_context: String,
    /// Facts or topics the judge expects the section to cover.
    #[serde(default)]
    pub required_elements: Vec<String>,
}

/// One retrieved chunk with its similarity to the section query.
#[derive(Debug, Clone)]
pub struct Evidence {
    pub chunk: Arc<Chunk>,
    pub score: f32,
}

/// Ranked, deduplicated evidence retrieved for one section.
#[derive(Debug, Clone)]
pub struct EvidenceSet {
    /// SHA-256 over the ordered chunk ids.
    pub id: String,
    pub items: Vec<Evidence>,
}

impl EvidenceSet {
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn chunks(&self) -> impl Iterator<Item = &Chunk> {
        self.items.iter().map(|e| e.chunk.as_ref())
    }

    /// Find the chunk covering a citation: same path and
    /// `chunk.start ≤ cite.start ≤ cite.end ≤ chunk.end`.
    pub fn resolve(&self, citation: &Citation) -> Option<&Chunk> {
        self.chunks().find(|c| {
            c.source_path == citation.source_path
                && c.start_line <= citation.start_line
                && citation.start_line <= citation.end_line
                && citation.end_line <= c.end_line
        })
    }
}

/// A claim's pointer to the file/line span supporting it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Citation {
    pub source_path: String,
    pub start_line: usize,
    pub end_line: usize,
}

impl fmt::Display for Citation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}-{}", self.source_path, self.start_line, self.end_line)
    }
}

/// Section prose produced by the drafter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Draft {
    pub section_id: String,
    pub text: String,
    pub evidence_set_id: String,
    /// Starts at 0 and increases by one per revision.
    pub revision: u32,
    pub citations: Vec<Citation>,
}

/// Structured judgment of one draft.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    pub factual: bool,
    #[serde(alias = "citesOk")]
    pub cites_ok: bool,
    pub hallucinated: bool,
    #[serde(default, alias = "missingButExpected")]
    pub missing_but_expected: Vec<String>,
    #[serde(default, alias = "unsupportedClaims")]
    pub unsupported_claims: Vec<String>,
    pub score: f64,
    #[serde(default)]
    pub notes: String,
}

impl Verdict {
    /// Failing verdict recorded when a section could not be judged at all.
    pub fn synthetic_failure(notes: impl Into<String>) -> Self {
        Self {
            factual: false,
            cites_ok: false,
            hallucinated: false,
            missing_but_expected: Vec::new(),
            unsupported_claims: Vec::new(),
            score: 0.0,
            notes: notes.into(),
        }
    }
}

/// Final result for one section, consumed by document assembly.
#[derive(Debug, Clone, Serialize)]
pub struct SectionOutcome {
    pub section_id: String,
    pub title: String,
    pub order: u32,
    pub draft: Draft,
    pub verdict: Verdict,
    /// The revision budget ran out, or the section failed, before a pass.
    pub forced_accept: bool,
    /// Number of drafts judged (or attempted) for this section.
    pub attempts: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(path: &str, start: usize, end: usize) -> Arc<Chunk> {
        Arc::new(Chunk {
            id: format!("{}-{}-{}", path, start, end),
            source_path: path.to_string(),
            start_line: start,
            end_line: end,
            kind: ChunkKind::Code,
            text: String::new(),
            hash: String::new(),
            quality: SpanQuality::Exact,
            symbol: None,
        })
    }

    fn cite(path: &str, start: usize, end: usize) -> Citation {
        Citation {
            source_path: path.to_string(),
            start_line: start,
            end_line: end,
        }
    }

    #[test]
    fn resolve_requires_covering_span() {
        let set = EvidenceSet {
            id: "e".to_string(),
            items: vec![Evidence {
                chunk: chunk("utils.py", 10, 20),
                score: 0.9,
            }],
        };
        assert!(set.resolve(&cite("utils.py", 10, 20)).is_some());
        assert!(set.resolve(&cite("utils.py", 12, 18)).is_some());
        assert!(set.resolve(&cite("utils.py", 1, 5)).is_none());
        assert!(set.resolve(&cite("utils.py", 15, 25)).is_none());
        assert!(set.resolve(&cite("other.py", 10, 20)).is_none());
        assert!(set.resolve(&cite("utils.py", 18, 12)).is_none());
    }

    #[test]
    fn verdict_accepts_camel_case_keys() {
        let json = r#"{"factual":true,"citesOk":true,"hallucinated":false,
            "missingButExpected":["ports"],"score":0.8,"notes":"ok"}"#;
        let v: Verdict = serde_json::from_str(json).unwrap();
        assert!(v.cites_ok);
        assert_eq!(v.missing_but_expected, vec!["ports".to_string()]);
        assert!(v.unsupported_claims.is_empty());
    }

    #[test]
    fn collection_names() {
        assert_eq!(ChunkKind::Prose.collection(), "text");
        assert_eq!(ChunkKind::Code.collection(), "code");
        assert_eq!(chunk("a.rs", 3, 7).span_len(), 5);
        assert_eq!(chunk("a.rs", 3, 7).tag(), "a.rs:3-7");
    }
}
