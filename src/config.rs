use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::models::{Route, SectionSpec};
use crate::plan::SectionGraph;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub review: ReviewConfig,
    #[serde(default)]
    pub run: RunConfig,
    #[serde(default = "default_sections")]
    pub sections: Vec<SectionSpec>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    #[serde(default = "default_min_chars")]
    pub min_chars: usize,
    #[serde(default = "default_max_code_chars")]
    pub max_code_chars: usize,
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: u64,
    #[serde(default)]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            min_chars: default_min_chars(),
            max_code_chars: default_max_code_chars(),
            max_file_bytes: default_max_file_bytes(),
            include_globs: Vec::new(),
            exclude_globs: Vec::new(),
        }
    }
}

fn default_max_tokens() -> usize {
    400
}
fn default_min_chars() -> usize {
    30
}
fn default_max_code_chars() -> usize {
    10_000
}
fn default_max_file_bytes() -> u64 {
    1024 * 1024
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_k_text")]
    pub k_text: usize,
    #[serde(default = "default_k_code")]
    pub k_code: usize,
    #[serde(default = "default_min_similarity")]
    pub min_similarity: f32,
    #[serde(default = "default_final_limit")]
    pub final_limit: usize,
    #[serde(default = "default_max_chunks_per_file")]
    pub max_chunks_per_file: usize,
    #[serde(default = "default_snippet_chars")]
    pub snippet_chars: usize,
    #[serde(default = "default_max_context_chars")]
    pub max_context_chars: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            k_text: default_k_text(),
            k_code: default_k_code(),
            min_similarity: default_min_similarity(),
            final_limit: default_final_limit(),
            max_chunks_per_file: default_max_chunks_per_file(),
            snippet_chars: default_snippet_chars(),
            max_context_chars: default_max_context_chars(),
        }
    }
}

fn default_k_text() -> usize {
    5
}
fn default_k_code() -> usize {
    15
}
fn default_min_similarity() -> f32 {
    0.2
}
fn default_final_limit() -> usize {
    12
}
fn default_max_chunks_per_file() -> usize {
    3
}
fn default_snippet_chars() -> usize {
    700
}
fn default_max_context_chars() -> usize {
    6000
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_embed_concurrency")]
    pub concurrency: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            url: None,
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
            concurrency: default_embed_concurrency(),
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_max_retries() -> u32 {
    3
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_embed_concurrency() -> usize {
    4
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct GenerationConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub writer_model: Option<String>,
    /// Defaults to `writer_model` when unset.
    #[serde(default)]
    pub judge_model: Option<String>,
    #[serde(default)]
    pub temperature: f32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_generation_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            url: None,
            writer_model: None,
            judge_model: None,
            temperature: 0.0,
            max_retries: default_max_retries(),
            timeout_secs: default_generation_timeout_secs(),
        }
    }
}

fn default_generation_timeout_secs() -> u64 {
    120
}

impl GenerationConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

/// Pass policy for the judge → save / revise decision.
#[derive(Debug, Deserialize, Clone)]
pub struct ReviewConfig {
    #[serde(default = "default_min_score")]
    pub min_score: f64,
    #[serde(default = "default_true")]
    pub require_factual: bool,
    #[serde(default = "default_true")]
    pub require_cites_ok: bool,
    #[serde(default = "default_true")]
    pub forbid_hallucination: bool,
    #[serde(default = "default_max_revisions")]
    pub max_revisions: u32,
}

impl Default for ReviewConfig {
    fn default() -> Self {
        Self {
            min_score: default_min_score(),
            require_factual: true,
            require_cites_ok: true,
            forbid_hallucination: true,
            max_revisions: default_max_revisions(),
        }
    }
}

fn default_min_score() -> f64 {
    0.75
}
fn default_true() -> bool {
    true
}
fn default_max_revisions() -> u32 {
    2
}

#[derive(Debug, Deserialize, Clone)]
pub struct RunConfig {
    #[serde(default = "default_section_concurrency")]
    pub section_concurrency: usize,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            section_concurrency: default_section_concurrency(),
            output_dir: default_output_dir(),
        }
    }
}

fn default_section_concurrency() -> usize {
    2
}
fn default_output_dir() -> PathBuf {
    PathBuf::from("docs")
}

/// Built-in section set used when the config declares no `[[sections]]`.
pub fn default_sections() -> Vec<SectionSpec> {
    fn section(
        id: &str,
        order: u32,
        title: &str,
        query: &str,
        guidance: &str,
        required: &[&str],
    ) -> SectionSpec {
        SectionSpec {
            id: id.to_string(),
            order,
            title: title.to_string(),
            query: query.to_string(),
            route: Route::Both,
            k_text: None,
            k_code: None,
            guidance: guidance.to_string(),
            additional_context: String::new(),
            required_elements: required.iter().map(|s| s.to_string()).collect(),
        }
    }

    vec![
        section(
            "objective",
            1,
            "Objective & Scope",
            "Project goals, objectives, scope and limitations as described in README and docstrings.",
            "Include '### Goals' bullets and '### Out of Scope' bullets.",
            &["project purpose", "scope limitations"],
        ),
        section(
            "architecture",
            2,
            "System Architecture",
            "High-level system architecture, main components and their responsibilities.",
            "Cover the overall structure first, then each component.",
            &["main components", "data flow between components"],
        ),
        section(
            "technologies",
            3,
            "Technologies Used",
            "Languages, frameworks, packages, installation prerequisites and versions.",
            "List technologies as 'Languages:', 'Frameworks:', 'Packages:' lines.",
            &["programming languages", "frameworks and packages"],
        ),
        section(
            "installation",
            4,
            "Installation & Setup",
            "Installation steps, prerequisites, environment variables and versions for: {{section:technologies}}",
            "Write a step by step guide for installation and setup.",
            &["prerequisites", "installation steps", "environment variables"],
        ),
        section(
            "api",
            5,
            "API & Environment",
            "API endpoints, routes, request and response shapes, authentication, environment variables, configuration files.",
            "Give an endpoints table and an environment variables table. Do not invent endpoints or variables.",
            &["endpoints", "authentication", "environment variables"],
        ),
    ]
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    // Validate chunking
    if config.chunking.max_tokens == 0 {
        bail!("chunking.max_tokens must be > 0");
    }

    // Validate retrieval
    if config.retrieval.final_limit < 1 {
        bail!("retrieval.final_limit must be >= 1");
    }
    if !(0.0..=1.0).contains(&config.retrieval.min_similarity) {
        bail!("retrieval.min_similarity must be in [0.0, 1.0]");
    }

    // Validate review policy
    if !(0.0..=1.0).contains(&config.review.min_score) {
        bail!("review.min_score must be in [0.0, 1.0]");
    }
    if config.run.section_concurrency == 0 {
        bail!("run.section_concurrency must be >= 1");
    }

    // Validate embedding
    match config.embedding.provider.as_str() {
        "disabled" | "openai" | "ollama" => {}
        other => bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, or ollama.",
            other
        ),
    }
    if config.embedding.is_enabled() {
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.model.is_none() {
            bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
    }

    // Validate generation
    match config.generation.provider.as_str() {
        "disabled" | "openai" => {}
        other => bail!(
            "Unknown generation provider: '{}'. Must be disabled or openai.",
            other
        ),
    }
    if config.generation.is_enabled() && config.generation.writer_model.is_none() {
        bail!("generation.writer_model must be specified when generation is enabled");
    }

    validate_sections(&config.sections)
}

/// Reject malformed or duplicate ids, unknown `{{section:..}}` references,
/// and cycles.
///
/// Ids name output files, so they are limited to `[a-z0-9_-]`.
fn validate_sections(sections: &[SectionSpec]) -> Result<()> {
    for s in sections {
        if s.id.is_empty() {
            bail!("section id must not be empty");
        }
        if !s
            .id
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_' || b == b'-')
        {
            bail!(
                "section id '{}' may only contain lowercase letters, digits, '_' and '-'",
                s.id
            );
        }
    }

    SectionGraph::build(sections)?.check()?;
    Ok(())
}
