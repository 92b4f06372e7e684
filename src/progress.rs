//! Run progress reporting.
//!
//! Reports what the pipeline is doing (chunking, embedding, per-section
//! generation) on **stderr** so stdout stays parseable for scripts.

use std::io::Write;

/// A single progress event.
#[derive(Clone, Debug)]
pub enum ProgressEvent {
    /// Snapshot read and chunked.
    Chunked { files: u64, chunks: u64 },
    /// `n` of `total` chunks embedded or reused.
    Embedding { n: u64, total: u64 },
    SectionStarted { section: String },
    SectionFinished {
        section: String,
        attempts: u32,
        forced_accept: bool,
    },
}

pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: ProgressEvent);
}

/// Human-friendly progress: "embed  1,234 / 5,000 chunks".
pub struct StderrProgress;

impl ProgressReporter for StderrProgress {
    fn report(&self, event: ProgressEvent) {
        let line = match &event {
            ProgressEvent::Chunked { files, chunks } => format!(
                "chunk  {} files → {} chunks\n",
                format_number(*files),
                format_number(*chunks)
            ),
            ProgressEvent::Embedding { n, total } => format!(
                "embed  {} / {} chunks\n",
                format_number(*n),
                format_number(*total)
            ),
            ProgressEvent::SectionStarted { section } => format!("section {}  drafting...\n", section),
            ProgressEvent::SectionFinished {
                section,
                attempts,
                forced_accept,
            } => format!(
                "section {}  {} after {} draft(s)\n",
                section,
                if *forced_accept { "forced" } else { "passed" },
                attempts
            ),
        };
        let mut err = std::io::stderr().lock();
        let _ = err.write_all(line.as_bytes());
        let _ = err.flush();
    }
}

/// Machine-readable progress: one JSON object per line.
pub struct JsonProgress;

impl ProgressReporter for JsonProgress {
    fn report(&self, event: ProgressEvent) {
        let obj = match &event {
            ProgressEvent::Chunked { files, chunks } => serde_json::json!({
                "event": "progress", "phase": "chunked", "files": files, "chunks": chunks
            }),
            ProgressEvent::Embedding { n, total } => serde_json::json!({
                "event": "progress", "phase": "embedding", "n": n, "total": total
            }),
            ProgressEvent::SectionStarted { section } => serde_json::json!({
                "event": "progress", "phase": "section_started", "section": section
            }),
            ProgressEvent::SectionFinished {
                section,
                attempts,
                forced_accept,
            } => serde_json::json!({
                "event": "progress",
                "phase": "section_finished",
                "section": section,
                "attempts": attempts,
                "forced_accept": forced_accept
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let mut err = std::io::stderr().lock();
            let _ = writeln!(err, "{}", line);
            let _ = err.flush();
        }
    }
}

pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report(&self, _event: ProgressEvent) {}
}

fn format_number(n: u64) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}

/// `--progress` value.
#[derive(Clone, Copy, Debug, Eq, PartialEq, clap::ValueEnum)]
pub enum ProgressMode {
    /// Human progress when stderr is a TTY, otherwise off.
    Auto,
    Off,
    Human,
    Json,
}

impl ProgressMode {
    pub fn reporter(&self) -> Box<dyn ProgressReporter> {
        match self {
            ProgressMode::Auto if atty::is(atty::Stream::Stderr) => Box::new(StderrProgress),
            ProgressMode::Auto | ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}
