//! Repository snapshot reader.
//!
//! Walks a local checkout and returns the files worth chunking. Cloning
//! and checkout management happen outside repodoc; this module only reads
//! what is already on disk.
//!
//! Files are filtered in three passes:
//!
//! 1. Built-in low-value paths (VCS internals, build output, lockfiles,
//!    archives, binaries, anything with `mock` in the path).
//! 2. `chunking.exclude_globs`, then `chunking.include_globs` when set.
//! 3. Content checks: oversized, binary, and non-UTF-8 files are skipped
//!    and reported, never fatal to the run.

use anyhow::{bail, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::Path;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::config::ChunkingConfig;
use crate::error::IngestionError;

/// A readable text file of the snapshot.
#[derive(Debug, Clone)]
pub struct SourceFile {
    /// Repository-relative path with `/` separators.
    pub path: String,
    pub text: String,
}

/// Files read from a snapshot plus everything that was skipped.
#[derive(Debug, Default)]
pub struct Snapshot {
    pub files: Vec<SourceFile>,
    pub skipped: Vec<IngestionError>,
}

const LOW_VALUE_EXTS: &[&str] = &[
    "css", "json", "svg", "csv", "xlsx", "xls", "log", "lock", "pyc", "pyo", "pyd", "class",
    "jar", "war", "o", "obj", "dll", "exe", "so", "a", "db", "sqlite", "sqlite3", "bak", "tmp",
    "ico", "icns", "pdf", "docx", "pptx", "7z", "zip", "tar", "gz", "rar", "iml", "png", "jpg",
    "jpeg", "gif", "woff", "woff2", "ttf", "map",
];

const LOW_VALUE_FILES: &[&str] = &[
    ".gitignore",
    ".gitattributes",
    ".gitmodules",
    ".mailmap",
    ".editorconfig",
    ".prettierrc",
    ".eslintrc",
    ".clang-format",
    ".npmrc",
    ".env",
    ".env.example",
    "pipfile.lock",
    "yarn.lock",
    "package-lock.json",
    "cargo.lock",
];

const LOW_VALUE_DIRS: &[&str] = &[
    ".git",
    ".vscode",
    ".idea",
    "__pycache__",
    "node_modules",
    "dist",
    "build",
    "target",
    ".pytest_cache",
    ".venv",
    "venv",
];

/// Heuristic noise filter over a repository-relative path.
pub fn is_low_value(rel_path: &str) -> bool {
    let lower = rel_path.to_lowercase();
    let mut parts: Vec<&str> = lower.split('/').collect();
    let file_name = parts.pop().unwrap_or_default();

    if parts.iter().any(|d| LOW_VALUE_DIRS.contains(d)) {
        return true;
    }
    if LOW_VALUE_FILES.contains(&file_name) || file_name.ends_with(".min.js") {
        return true;
    }
    if let Some((_, ext)) = file_name.rsplit_once('.') {
        if LOW_VALUE_EXTS.contains(&ext) {
            return true;
        }
    }
    lower.contains("mock")
}

/// Read every chunkable file under `root`, sorted by path.
pub fn read_snapshot(root: &Path, config: &ChunkingConfig) -> Result<Snapshot> {
    if !root.is_dir() {
        bail!("Repository root does not exist: {}", root.display());
    }

    let include_set = if config.include_globs.is_empty() {
        None
    } else {
        Some(build_globset(&config.include_globs)?)
    };
    let exclude_set = build_globset(&config.exclude_globs)?;

    let mut snapshot = Snapshot::default();

    let walker = WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| {
            e.depth() == 0
                || !e.file_type().is_dir()
                || !LOW_VALUE_DIRS.contains(&e.file_name().to_string_lossy().to_lowercase().as_str())
        });

    for entry in walker {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                let path = e.path().map(|p| p.to_path_buf()).unwrap_or_default();
                warn!(path = %path.display(), error = %e, "walk error");
                snapshot.skipped.push(IngestionError::Unreadable {
                    path,
                    message: e.to_string(),
                });
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let relative = path.strip_prefix(root).unwrap_or(path);
        let rel_str = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");

        if is_low_value(&rel_str) || exclude_set.is_match(&rel_str) {
            debug!(path = %rel_str, "excluded");
            continue;
        }
        if let Some(include) = &include_set {
            if !include.is_match(&rel_str) {
                continue;
            }
        }

        match read_text_file(path, config.max_file_bytes) {
            Ok(text) => snapshot.files.push(SourceFile {
                path: rel_str,
                text,
            }),
            Err(e) => {
                warn!(error = %e, "skipping file");
                snapshot.skipped.push(e);
            }
        }
    }

    snapshot.files.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(snapshot)
}

fn read_text_file(path: &Path, max_bytes: u64) -> Result<String, IngestionError> {
    let unreadable = |e: std::io::Error| IngestionError::Unreadable {
        path: path.to_path_buf(),
        message: e.to_string(),
    };

    let len = std::fs::metadata(path).map_err(unreadable)?.len();
    if len > max_bytes {
        return Err(IngestionError::TooLarge {
            path: path.to_path_buf(),
            bytes: len,
            limit: max_bytes,
        });
    }

    let bytes = std::fs::read(path).map_err(unreadable)?;
    if looks_binary(&bytes) {
        return Err(IngestionError::Binary {
            path: path.to_path_buf(),
        });
    }
    String::from_utf8(bytes).map_err(|e| IngestionError::Unreadable {
        path: path.to_path_buf(),
        message: format!("not valid UTF-8: {}", e),
    })
}

/// A NUL byte in the first 8 KiB marks a file as binary.
fn looks_binary(bytes: &[u8]) -> bool {
    bytes.iter().take(8192).any(|b| *b == 0)
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}
