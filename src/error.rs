//! Error taxonomy for the generation pipeline.
//!
//! Each variant family maps to one recovery strategy:
//!
//! | Error | Recovery |
//! |-------|----------|
//! | [`IngestionError`] | Reported in the chunk report; the file is skipped or degraded |
//! | [`CapabilityError`] | Retried with bounded backoff when transient, then escalated to the section |
//! | [`MalformedOutputError`] | One internal regeneration, then escalated to the section |
//! | [`SectionError`] | Converted into a forced-accept outcome with a synthetic verdict |
//! | [`RunError`] | Fatal for the whole run |
//!
//! Absence of evidence is not an error: it surfaces as an explicit
//! unsupported marker in the draft.

use std::path::PathBuf;

/// A repository file could not be turned into exact chunks.
#[derive(Debug, Clone, thiserror::Error)]
pub enum IngestionError {
    #[error("unreadable file {path}: {message}")]
    Unreadable { path: PathBuf, message: String },

    #[error("binary file skipped: {path}")]
    Binary { path: PathBuf },

    #[error("file {path} is {bytes} bytes, above the {limit} byte limit")]
    TooLarge {
        path: PathBuf,
        bytes: u64,
        limit: u64,
    },

    #[error("syntax tree for {path} could not be built: {message}")]
    Parse { path: PathBuf, message: String },
}

/// Failure of an external capability call (`embed`, `generate`, `judge`).
#[derive(Debug, Clone, thiserror::Error)]
pub enum CapabilityError {
    #[error("{capability} transport error: {message}")]
    Transport {
        capability: &'static str,
        message: String,
    },

    #[error("{capability} returned HTTP {status}: {body}")]
    Status {
        capability: &'static str,
        status: u16,
        body: String,
    },

    #[error("{capability} call timed out after {timeout_secs}s")]
    Timeout {
        capability: &'static str,
        timeout_secs: u64,
    },

    #[error("{capability} returned malformed output: {message}")]
    Malformed {
        capability: &'static str,
        message: String,
    },

    #[error("{capability} provider is disabled")]
    Disabled { capability: &'static str },
}

impl CapabilityError {
    /// Whether the failure may go away on retry.
    ///
    /// Timeouts, transport faults, rate limits (429), and server errors are
    /// transient. Malformed output is not: callers that can use another
    /// sample regenerate it themselves.
    pub fn is_transient(&self) -> bool {
        match self {
            CapabilityError::Transport { .. } | CapabilityError::Timeout { .. } => true,
            CapabilityError::Status { status, .. } => *status == 429 || *status >= 500,
            CapabilityError::Malformed { .. } | CapabilityError::Disabled { .. } => false,
        }
    }

    pub fn capability(&self) -> &'static str {
        match self {
            CapabilityError::Transport { capability, .. }
            | CapabilityError::Status { capability, .. }
            | CapabilityError::Timeout { capability, .. }
            | CapabilityError::Malformed { capability, .. }
            | CapabilityError::Disabled { capability } => capability,
        }
    }
}

/// Model output that violates the output contract.
#[derive(Debug, Clone, thiserror::Error)]
pub enum MalformedOutputError {
    #[error("draft cites spans outside its evidence set: {}", .citations.join(", "))]
    UnresolvedCitations { citations: Vec<String> },

    #[error("judge verdict could not be parsed: {message}")]
    UnparseableVerdict { message: String },
}

/// Failure of one section after its retries are exhausted.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SectionError {
    #[error(transparent)]
    Capability(#[from] CapabilityError),

    #[error(transparent)]
    Malformed(#[from] MalformedOutputError),
}

/// Run-level fatal faults, surfaced distinctly from per-section degradation.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("both the text and the code index are empty; nothing to document")]
    EmptyIndexes,

    #[error("run cancelled before completion")]
    Cancelled,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),
}
