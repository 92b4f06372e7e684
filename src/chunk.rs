//! Line-span chunker for repository files.
//!
//! Every chunk is a contiguous, 1-based, inclusive line span of its source
//! file, and its `text` is exactly [`slice_lines`] of that span. Prose files
//! are split on structural boundaries (headings, paragraph breaks); source
//! files go through [`crate::syntax`] and fall back to paragraph splitting,
//! flagged [`SpanQuality::Approximate`], when no syntax tree is available.
//!
//! # Algorithm (prose and fallback)
//!
//! 1. Convert `max_tokens` to `max_chars` using a 4 chars/token ratio.
//! 2. Group consecutive non-blank lines into blocks. Markdown code fences
//!    keep their blank lines inside one block.
//! 3. A heading always starts a new chunk.
//! 4. Accumulate blocks until the next one would exceed `max_chars`.
//! 5. A block that alone exceeds `max_chars` is split at line boundaries
//!    ending a sentence; when none exists the split is a hard split and its
//!    line is logged and reported.
//! 6. Lines are never cut, so a single line above `max_chars` stays one
//!    chunk and is reported in [`ChunkReport::oversized_lines`].
//!
//! # Notebooks
//!
//! `.ipynb` files are chunked per cell: the span of a cell is the lines of
//! its `"source"` array in the notebook JSON. Markdown cells are prose and
//! code cells are code. A notebook whose cells cannot be located falls
//! back to paragraph chunks flagged approximate.
//!
//! Chunk ids are derived from path, span, and kind, so re-chunking an
//! unchanged snapshot reproduces the same id set.

use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::config::ChunkingConfig;
use crate::error::IngestionError;
use crate::models::{Chunk, ChunkKind, SpanQuality};
use crate::snapshot::{Snapshot, SourceFile};
use crate::syntax::{self, SyntaxOutcome};

/// Approximate characters-per-token ratio.
pub const CHARS_PER_TOKEN: usize = 4;

const PROSE_EXTS: &[&str] = &["md", "markdown", "rst", "txt", "adoc"];
const PROSE_NAMES: &[&str] = &["readme", "license", "licence", "changelog", "authors", "notice"];

/// Result of chunking a whole snapshot.
#[derive(Debug, Default)]
pub struct ChunkReport {
    /// All chunks, ordered by path then span.
    pub chunks: Vec<Chunk>,
    /// Files chunked by paragraphs because no syntax tree was available.
    pub approximate_files: Vec<String>,
    /// `(path, line)` of every hard split inside a sentence.
    pub hard_splits: Vec<(String, usize)>,
    /// `(path, line)` of single lines longer than the chunk budget.
    pub oversized_lines: Vec<(String, usize)>,
    /// Files skipped at read time or degraded at parse time.
    pub issues: Vec<IngestionError>,
}

/// Decide which index a file's chunks belong to.
///
/// Documentation formats and top-level project notes are prose;
/// everything else, including configuration files, is code.
pub fn classify(path: &str) -> ChunkKind {
    let file_name = path.rsplit('/').next().unwrap_or(path).to_lowercase();
    if file_name == "requirements.txt" {
        return ChunkKind::Prose;
    }
    let (stem, ext) = match file_name.rsplit_once('.') {
        Some((stem, ext)) => (stem.to_string(), ext.to_string()),
        None => (file_name.clone(), String::new()),
    };
    if PROSE_EXTS.contains(&ext.as_str()) || PROSE_NAMES.contains(&stem.as_str()) {
        ChunkKind::Prose
    } else {
        ChunkKind::Code
    }
}

/// Chunk every file of a snapshot.
pub fn chunk_snapshot(snapshot: &Snapshot, config: &ChunkingConfig) -> ChunkReport {
    let mut report = ChunkReport {
        issues: snapshot.skipped.clone(),
        ..ChunkReport::default()
    };

    for file in &snapshot.files {
        let mut out = chunk_file(file, config);
        if out.approximate {
            report.approximate_files.push(file.path.clone());
        }
        report.hard_splits.append(&mut out.hard_splits);
        report.oversized_lines.append(&mut out.oversized_lines);
        if let Some(issue) = out.issue {
            report.issues.push(issue);
        }
        report.chunks.append(&mut out.chunks);
    }

    report
}

/// Chunks of one file.
#[derive(Debug, Default)]
pub struct FileChunks {
    pub chunks: Vec<Chunk>,
    pub approximate: bool,
    pub hard_splits: Vec<(String, usize)>,
    pub oversized_lines: Vec<(String, usize)>,
    pub issue: Option<IngestionError>,
}

impl FileChunks {
    fn record(&mut self, path: &str, split: &Split) {
        self.hard_splits
            .extend(split.hard_splits.iter().map(|l| (path.to_string(), *l)));
        self.oversized_lines
            .extend(split.oversized_lines.iter().map(|l| (path.to_string(), *l)));
    }
}

/// Chunk a single file according to its kind.
pub fn chunk_file(file: &SourceFile, config: &ChunkingConfig) -> FileChunks {
    if file.path.to_lowercase().ends_with(".ipynb") {
        return chunk_notebook(file, config);
    }

    let max_chars = config.max_tokens * CHARS_PER_TOKEN;
    let lines: Vec<&str> = file.text.lines().collect();
    let kind = classify(&file.path);

    let mut out = FileChunks::default();

    let spans: Vec<(usize, usize, Option<String>)> = match kind {
        ChunkKind::Prose => {
            let split = split_blocks(&file.path, &lines, max_chars, true);
            out.record(&file.path, &split);
            split.spans.into_iter().map(|(s, e)| (s, e, None)).collect()
        }
        ChunkKind::Code => match syntax::code_units(&file.path, &file.text, max_chars) {
            SyntaxOutcome::Parsed(units) => units
                .into_iter()
                .filter(|u| {
                    let len = span_chars(&lines, u.start_line, u.end_line);
                    if len > config.max_code_chars {
                        debug!(path = %file.path, start = u.start_line, end = u.end_line, "definition above max_code_chars");
                        false
                    } else {
                        true
                    }
                })
                .map(|u| (u.start_line, u.end_line, u.symbol))
                .collect(),
            outcome => {
                if let SyntaxOutcome::Failed(message) = outcome {
                    warn!(path = %file.path, %message, "parse failed, using paragraph chunks");
                    out.issue = Some(IngestionError::Parse {
                        path: file.path.clone().into(),
                        message,
                    });
                } else {
                    debug!(path = %file.path, "no grammar, using paragraph chunks");
                }
                return paragraph_fallback(file, &lines, kind, max_chars, config, out);
            }
        },
    };

    out.chunks = collect_chunks(
        &file.path,
        &lines,
        spans.into_iter().map(|(s, e, sym)| (s, e, kind, sym)),
        SpanQuality::Exact,
        config.min_chars,
    );
    out
}

fn paragraph_fallback(
    file: &SourceFile,
    lines: &[&str],
    kind: ChunkKind,
    max_chars: usize,
    config: &ChunkingConfig,
    mut out: FileChunks,
) -> FileChunks {
    out.approximate = true;
    let split = split_blocks(&file.path, lines, max_chars, false);
    out.record(&file.path, &split);
    out.chunks = collect_chunks(
        &file.path,
        lines,
        split.spans.into_iter().map(|(s, e)| (s, e, kind, None)),
        SpanQuality::Approximate,
        config.min_chars,
    );
    out
}

/// Build chunks from spans, dropping tiny and duplicate ones, ordered by span.
fn collect_chunks(
    path: &str,
    lines: &[&str],
    spans: impl Iterator<Item = (usize, usize, ChunkKind, Option<String>)>,
    quality: SpanQuality,
    min_chars: usize,
) -> Vec<Chunk> {
    let mut seen = std::collections::HashSet::new();
    let mut chunks = Vec::new();
    for (start, end, kind, symbol) in spans {
        let text = join_lines(lines, start, end);
        if text.trim().chars().count() < min_chars {
            continue;
        }
        let chunk = make_chunk(path, start, end, kind, quality, text, symbol);
        if seen.insert(chunk.id.clone()) {
            chunks.push(chunk);
        }
    }
    chunks.sort_by(|a, b| (a.start_line, a.end_line).cmp(&(b.start_line, b.end_line)));
    chunks
}

#[derive(Deserialize)]
struct Notebook {
    cells: Vec<NotebookCell>,
}

#[derive(Deserialize)]
struct NotebookCell {
    cell_type: String,
}

/// Chunk a Jupyter notebook cell by cell.
fn chunk_notebook(file: &SourceFile, config: &ChunkingConfig) -> FileChunks {
    let max_chars = config.max_tokens * CHARS_PER_TOKEN;
    let lines: Vec<&str> = file.text.lines().collect();
    let mut out = FileChunks::default();

    let located = serde_json::from_str::<Notebook>(&file.text)
        .map_err(|e| e.to_string())
        .and_then(|nb| {
            let spans = cell_source_spans(&lines);
            if spans.len() == nb.cells.len() {
                Ok(nb.cells.into_iter().zip(spans).collect::<Vec<_>>())
            } else {
                Err(format!(
                    "{} cells but {} source arrays located",
                    nb.cells.len(),
                    spans.len()
                ))
            }
        });

    let cells = match located {
        Ok(cells) => cells,
        Err(message) => {
            warn!(path = %file.path, %message, "notebook cells not located, using paragraph chunks");
            out.issue = Some(IngestionError::Parse {
                path: file.path.clone().into(),
                message,
            });
            return paragraph_fallback(file, &lines, ChunkKind::Code, max_chars, config, out);
        }
    };

    let mut spans = Vec::new();
    for (cell, span) in cells {
        let kind = match cell.cell_type.as_str() {
            "markdown" => ChunkKind::Prose,
            "code" => ChunkKind::Code,
            _ => continue,
        };
        let Some((start, end)) = span else { continue };
        let split = window_lines(&lines, start, end, max_chars);
        out.record(&file.path, &split);
        spans.extend(split.spans.into_iter().map(|(s, e)| (s, e, kind, None)));
    }
    debug!(path = %file.path, spans = spans.len(), "notebook cells");

    out.chunks = collect_chunks(&file.path, &lines, spans.into_iter(), SpanQuality::Exact, config.min_chars);
    out
}

/// 1-based spans of every `"source"` value in notebook JSON, in file order.
///
/// An array spanning several lines covers the lines between its brackets;
/// a value written on the key's own line covers that line. Empty sources
/// are `None`.
fn cell_source_spans(lines: &[&str]) -> Vec<Option<(usize, usize)>> {
    let mut spans = Vec::new();
    let mut i = 0;
    while i < lines.len() {
        let Some(value) = lines[i].trim_start().strip_prefix("\"source\":") else {
            i += 1;
            continue;
        };
        let value = value.trim();
        if value == "[" {
            let start = i + 2;
            let mut j = i + 1;
            while j < lines.len() && !matches!(lines[j].trim(), "]" | "],") {
                j += 1;
            }
            spans.push((j >= start).then_some((start, j)));
            i = j;
        } else if matches!(value, "[]" | "[]," | "\"\"" | "\"\",") {
            spans.push(None);
        } else {
            spans.push(Some((i + 1, i + 1)));
        }
        i += 1;
    }
    spans
}

/// Split lines `start..=end` (1-based) into windows of whole lines within
/// `max_chars`.
fn window_lines(lines: &[&str], start: usize, end: usize, max_chars: usize) -> Split {
    let mut split = Split::default();
    let mut piece: Option<(usize, usize)> = None;
    for n in start..=end.min(lines.len()) {
        let len = lines[n - 1].len() + 1;
        if len > max_chars {
            split.oversized_lines.push(n);
        }
        piece = match piece {
            Some((s, chars)) if chars + len > max_chars => {
                split.spans.push((s, n - 1));
                Some((n, len))
            }
            Some((s, chars)) => Some((s, chars + len)),
            None => Some((n, len)),
        };
    }
    if let Some((s, _)) = piece {
        split.spans.push((s, end.min(lines.len())));
    }
    split
}

/// Lines `start..=end` (1-based) of `text`, joined with `\n`.
///
/// This is the slicing rule every chunk's `text` satisfies.
pub fn slice_lines(text: &str, start: usize, end: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    join_lines(&lines, start, end)
}

fn join_lines(lines: &[&str], start: usize, end: usize) -> String {
    if start == 0 || end < start || start > lines.len() {
        return String::new();
    }
    lines[start - 1..end.min(lines.len())].join("\n")
}

fn span_chars(lines: &[&str], start: usize, end: usize) -> usize {
    if start == 0 || end < start || start > lines.len() {
        return 0;
    }
    lines[start - 1..end.min(lines.len())]
        .iter()
        .map(|l| l.len() + 1)
        .sum()
}

/// Deterministic chunk id: SHA-256 over path, span, and kind.
pub fn chunk_id(path: &str, start: usize, end: usize, kind: ChunkKind) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{}\0{}\0{}\0{}", path, start, end, kind).as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    digest[..32].to_string()
}

/// SHA-256 of a chunk's text, used for embedding staleness detection.
pub fn hash_text(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn make_chunk(
    path: &str,
    start: usize,
    end: usize,
    kind: ChunkKind,
    quality: SpanQuality,
    text: String,
    symbol: Option<String>,
) -> Chunk {
    Chunk {
        id: chunk_id(path, start, end, kind),
        source_path: path.to_string(),
        start_line: start,
        end_line: end,
        kind,
        hash: hash_text(&text),
        text,
        quality,
        symbol,
    }
}

fn is_heading(line: &str) -> bool {
    let t = line.trim_start();
    t.starts_with('#') && t.trim_start_matches('#').starts_with(' ')
}

fn is_fence(line: &str) -> bool {
    let t = line.trim_start();
    t.starts_with("```") || t.starts_with("~~~")
}

fn ends_sentence(line: &str) -> bool {
    matches!(
        line.trim_end().chars().last(),
        Some('.') | Some('!') | Some('?') | Some(':') | Some(';')
    )
}

struct Block {
    start: usize,
    end: usize,
    chars: usize,
    heading: bool,
}

/// Group non-blank lines into blocks (0-based indices).
fn blocks(lines: &[&str], markdown: bool) -> Vec<Block> {
    let mut out = Vec::new();
    let mut current: Option<Block> = None;
    let mut in_fence = false;

    for (i, line) in lines.iter().enumerate() {
        let blank = line.trim().is_empty();
        let heading = markdown && !in_fence && is_heading(line);
        if markdown && is_fence(line) {
            in_fence = !in_fence;
        }

        if (blank && !in_fence) || heading {
            if let Some(b) = current.take() {
                out.push(b);
            }
            if heading {
                out.push(Block {
                    start: i,
                    end: i,
                    chars: line.len() + 1,
                    heading: true,
                });
            }
            continue;
        }

        match current.as_mut() {
            Some(b) => {
                b.end = i;
                b.chars += line.len() + 1;
            }
            None => {
                current = Some(Block {
                    start: i,
                    end: i,
                    chars: line.len() + 1,
                    heading: false,
                })
            }
        }
    }
    if let Some(b) = current {
        out.push(b);
    }
    out
}

/// Line spans produced by a splitter.
#[derive(Debug, Default)]
pub struct Split {
    /// 1-based inclusive spans.
    pub spans: Vec<(usize, usize)>,
    /// 1-based lines after which a hard split (inside a sentence) occurred.
    pub hard_splits: Vec<usize>,
    /// 1-based lines that alone exceed `max_chars`.
    pub oversized_lines: Vec<usize>,
}

/// Split lines into 1-based inclusive spans within `max_chars`.
pub fn split_blocks(path: &str, lines: &[&str], max_chars: usize, markdown: bool) -> Split {
    let mut split = Split::default();
    let mut current: Option<(usize, usize, usize)> = None;

    let flush = |current: &mut Option<(usize, usize, usize)>, spans: &mut Vec<(usize, usize)>| {
        if let Some((s, e, _)) = current.take() {
            spans.push((s + 1, e + 1));
        }
    };

    for block in blocks(lines, markdown) {
        if block.heading {
            flush(&mut current, &mut split.spans);
        }

        if let Some((_, _, chars)) = current {
            if chars + block.chars > max_chars {
                flush(&mut current, &mut split.spans);
            }
        }

        if block.chars > max_chars {
            flush(&mut current, &mut split.spans);
            split_oversized(path, lines, &block, max_chars, &mut split);
            continue;
        }

        current = match current {
            Some((s, _, chars)) => Some((s, block.end, chars + block.chars)),
            None => Some((block.start, block.end, block.chars)),
        };
    }
    flush(&mut current, &mut split.spans);

    split
}

fn split_oversized(path: &str, lines: &[&str], block: &Block, max_chars: usize, split: &mut Split) {
    let line_len = |i: usize| lines[i].len() + 1;

    let mut piece_start = block.start;
    let mut piece_chars = 0usize;
    let mut last_sentence_end: Option<usize> = None;
    let mut i = block.start;

    while i <= block.end {
        let len = line_len(i);
        if piece_chars > 0 && piece_chars + len > max_chars {
            let cut = match last_sentence_end {
                Some(j) => j,
                None => {
                    warn!(path, line = i, "hard split inside a sentence");
                    split.hard_splits.push(i);
                    i - 1
                }
            };
            split.spans.push((piece_start + 1, cut + 1));
            piece_start = cut + 1;
            piece_chars = (piece_start..i).map(line_len).sum();
            last_sentence_end = (piece_start..i).filter(|k| ends_sentence(lines[*k])).last();
            continue;
        }
        if len > max_chars {
            warn!(path, line = i + 1, "single line exceeds the chunk budget");
            split.oversized_lines.push(i + 1);
        }
        piece_chars += len;
        if ends_sentence(lines[i]) {
            last_sentence_end = Some(i);
        }
        i += 1;
    }
    if piece_start <= block.end {
        split.spans.push((piece_start + 1, block.end + 1));
    }
}
