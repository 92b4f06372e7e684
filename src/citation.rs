//! Inline citation grammar.
//!
//! A citation tag is a bracket holding one or more comma-separated spans:
//!
//! ```text
//! [app/imports.py:12-28]
//! [src/parser.rs:12-40, src/lexer.rs:1-30]
//! [config.py:7]
//! ```
//!
//! Adjacent tags (`[a.py:1-4] [b.py:9-12]`) are separate citations of the
//! same claim. Brackets whose contents do not all parse as spans (Markdown
//! links, array literals) are not citations. Fenced code blocks are ignored.
//!
//! Claims without evidence carry [`UNSUPPORTED_MARKER`] instead of a tag.

use crate::models::{Citation, EvidenceSet};

/// Marks a claim the evidence set cannot support.
pub const UNSUPPORTED_MARKER: &str = "(Information not available in repository)";

/// Marks a deduction drawn from cited content rather than stated by it.
pub const INFERRED_MARKER: &str = "(Inferred from repository content)";

/// Every citation in `text`, in order of appearance, duplicates kept.
pub fn parse_citations(text: &str) -> Vec<Citation> {
    let mut out = Vec::new();
    let mut in_fence = false;
    for line in text.lines() {
        let trimmed = line.trim_start();
        if trimmed.starts_with("```") || trimmed.starts_with("~~~") {
            in_fence = !in_fence;
            continue;
        }
        if in_fence {
            continue;
        }
        parse_line(line, &mut out);
    }
    out
}

fn parse_line(line: &str, out: &mut Vec<Citation>) {
    let mut rest = line;
    while let Some(open) = rest.find('[') {
        let after = &rest[open + 1..];
        let Some(close) = after.find(']') else {
            return;
        };
        let inner = &after[..close];
        let tail = &after[close + 1..];
        // `[text](url)` is a Markdown link.
        if !tail.starts_with('(') {
            if let Some(mut spans) = parse_tag(inner) {
                out.append(&mut spans);
            }
        }
        rest = tail;
    }
}

/// Parse the inside of one bracket; `None` unless every part is a span.
fn parse_tag(inner: &str) -> Option<Vec<Citation>> {
    let spans: Option<Vec<Citation>> = inner.split(',').map(parse_span).collect();
    spans.filter(|s| !s.is_empty())
}

fn parse_span(part: &str) -> Option<Citation> {
    let part = part.trim();
    let part = part.strip_prefix("the ").unwrap_or(part).trim();
    let (path, range) = part.rsplit_once(':')?;
    let path = path.trim();
    if path.is_empty() || path.contains(char::is_whitespace) {
        return None;
    }
    let (start, end) = match range.trim().split_once('-') {
        Some((s, e)) => (s.trim().parse().ok()?, e.trim().parse().ok()?),
        None => {
            let line: usize = range.trim().parse().ok()?;
            (line, line)
        }
    };
    if start == 0 {
        return None;
    }
    Some(Citation {
        source_path: path.to_string(),
        start_line: start,
        end_line: end,
    })
}

/// Citations in `citations` that do not resolve against `evidence`.
pub fn unresolved<'a>(citations: &'a [Citation], evidence: &EvidenceSet) -> Vec<&'a Citation> {
    citations
        .iter()
        .filter(|c| evidence.resolve(c).is_none())
        .collect()
}

/// Whether `text` contains at least one unsupported marker.
pub fn has_unsupported_marker(text: &str) -> bool {
    text.contains(UNSUPPORTED_MARKER)
}
