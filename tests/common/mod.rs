#![allow(dead_code)]

use async_trait::async_trait;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use repodoc::config::Config;
use repodoc::context::Capabilities;
use repodoc::embedding::Embedder;
use repodoc::error::CapabilityError;
use repodoc::llm::{Generator, JudgeModel, Prompt};
use repodoc::models::Verdict;

const DIMS: usize = 256;

/// Hashed bag-of-words vectors; deterministic and offline.
pub struct BagOfWords {
    pub calls: AtomicUsize,
}

impl BagOfWords {
    pub fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
        }
    }
}

fn bucket(word: &str) -> usize {
    let mut h: u64 = 0xcbf29ce484222325;
    for b in word.bytes() {
        h ^= b as u64;
        h = h.wrapping_mul(0x100000001b3);
    }
    (h % DIMS as u64) as usize
}

#[async_trait]
impl Embedder for BagOfWords {
    fn model_name(&self) -> &str {
        "bag-of-words"
    }

    fn dims(&self) -> usize {
        DIMS
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, CapabilityError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut v = vec![0.0f32; DIMS];
        for word in text
            .split(|c: char| !c.is_alphanumeric() && c != '_')
            .filter(|w| w.len() > 2)
        {
            v[bucket(&word.to_lowercase())] += 1.0;
        }
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            v.iter_mut().for_each(|x| *x /= norm);
        }
        Ok(v)
    }
}

/// Tags listed under `CONTEXT:` in a drafting prompt, in order.
pub fn context_tags(prompt: &str) -> Vec<String> {
    let Some(start) = prompt.find("CONTEXT:\n") else {
        return Vec::new();
    };
    let body = &prompt[start + "CONTEXT:\n".len()..];
    let body = body.split("\n\nADDITIONAL CONTEXT:").next().unwrap_or(body);
    body.lines()
        .filter(|l| l.starts_with('[') && l.ends_with(']') && l.contains(':'))
        .map(|l| l[1..l.len() - 1].to_string())
        .collect()
}

/// Writes one sentence citing the first context tag whose snippet mentions
/// `needle` (or the first tag when no needle is set).
pub struct CitingWriter {
    pub needle: Option<String>,
    pub prompts: Mutex<Vec<Prompt>>,
}

impl CitingWriter {
    pub fn new() -> Self {
        Self {
            needle: None,
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn looking_for(needle: &str) -> Self {
        Self {
            needle: Some(needle.to_string()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }
}

#[async_trait]
impl Generator for CitingWriter {
    async fn generate(&self, prompt: &Prompt) -> Result<String, CapabilityError> {
        self.prompts.lock().unwrap().push(prompt.clone());
        let tags = context_tags(&prompt.user);
        let chosen = match &self.needle {
            Some(needle) => {
                let mut found = None;
                let mut current: Option<&String> = None;
                for line in prompt.user.lines() {
                    if let Some(tag) = tags.iter().find(|t| line == format!("[{}]", t)) {
                        current = Some(tag);
                    } else if line.contains(needle.as_str()) && found.is_none() {
                        found = current.cloned();
                    }
                }
                found
            }
            None => tags.first().cloned(),
        };
        Ok(match chosen {
            Some(tag) => format!(
                "Environment variables are loaded from a `.env` file at startup [{}].\n",
                tag
            ),
            None => "(Information not available in repository)".to_string(),
        })
    }
}

/// Replays verdicts in order, repeating the last one.
pub struct ScriptedJudge {
    verdicts: Vec<Verdict>,
    pub calls: AtomicUsize,
}

impl ScriptedJudge {
    pub fn new(verdicts: Vec<Verdict>) -> Self {
        Self {
            verdicts,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn always(verdict: Verdict) -> Self {
        Self::new(vec![verdict])
    }
}

#[async_trait]
impl JudgeModel for ScriptedJudge {
    async fn judge(&self, _prompt: &Prompt) -> Result<Verdict, CapabilityError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.verdicts[n.min(self.verdicts.len() - 1)].clone())
    }
}

/// Replies with unparseable output for its first `garbled` calls, then
/// with `verdict`.
pub struct GarblingJudge {
    garbled: usize,
    verdict: Verdict,
    pub calls: AtomicUsize,
}

impl GarblingJudge {
    pub fn new(garbled: usize, verdict: Verdict) -> Self {
        Self {
            garbled,
            verdict,
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl JudgeModel for GarblingJudge {
    async fn judge(&self, _prompt: &Prompt) -> Result<Verdict, CapabilityError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if n < self.garbled {
            return Err(CapabilityError::Malformed {
                capability: "judge",
                message: "not json".to_string(),
            });
        }
        Ok(self.verdict.clone())
    }
}

/// A generator whose provider rejects every request.
pub struct RejectingWriter;

#[async_trait]
impl Generator for RejectingWriter {
    async fn generate(&self, _prompt: &Prompt) -> Result<String, CapabilityError> {
        Err(CapabilityError::Status {
            capability: "generate",
            status: 400,
            body: "bad request".to_string(),
        })
    }
}

/// Cancels the run on its first call and never answers.
pub struct CancellingWriter {
    pub token: CancellationToken,
}

#[async_trait]
impl Generator for CancellingWriter {
    async fn generate(&self, _prompt: &Prompt) -> Result<String, CapabilityError> {
        self.token.cancel();
        std::future::pending::<()>().await;
        unreachable!()
    }
}

/// Cancels the run while it judges, then still returns `verdict`.
pub struct CancellingJudge {
    pub token: CancellationToken,
    pub verdict: Verdict,
}

#[async_trait]
impl JudgeModel for CancellingJudge {
    async fn judge(&self, _prompt: &Prompt) -> Result<Verdict, CapabilityError> {
        self.token.cancel();
        tokio::task::yield_now().await;
        Ok(self.verdict.clone())
    }
}

pub fn verdict(score: f64, cites_ok: bool) -> Verdict {
    Verdict {
        factual: true,
        cites_ok,
        hallucinated: false,
        missing_but_expected: Vec::new(),
        unsupported_claims: Vec::new(),
        score,
        notes: if score < 0.75 {
            "too thin".to_string()
        } else {
            String::new()
        },
    }
}

pub fn capabilities(
    embedder: Arc<dyn Embedder>,
    generator: Arc<dyn Generator>,
    judge: Arc<dyn JudgeModel>,
) -> Capabilities {
    Capabilities {
        embedder,
        generator,
        judge,
    }
}

/// A small Python service with a README.
pub fn fixture_repo() -> TempDir {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path();
    write(
        root,
        "README.md",
        "# Inventory Service\n\n\
         Inventory Service tracks stock levels for warehouses and exposes them over HTTP.\n\n\
         ## Installation\n\n\
         Install the dependencies with pip and start the server with uvicorn.\n",
    );
    write(
        root,
        "requirements.txt",
        "fastapi==0.110.0\nuvicorn==0.29.0\npython-dotenv==1.0.1\n",
    );
    write(
        root,
        "app/main.py",
        "from fastapi import FastAPI\n\
         \n\
         app = FastAPI()\n\
         \n\
         \n\
         @app.get(\"/health\")\n\
         def health():\n\
         \x20   return {\"status\": \"ok\"}\n\
         \n\
         \n\
         @app.get(\"/stock/{sku}\")\n\
         def stock(sku: str):\n\
         \x20   return {\"sku\": sku, \"quantity\": 0}\n",
    );
    write(
        root,
        "app/imports.py",
        "import os\n\
         from dotenv import load_dotenv\n\
         \n\
         \n\
         def load_settings():\n\
         \x20   load_dotenv()\n\
         \x20   return {\"database_url\": os.environ.get(\"DATABASE_URL\", \"sqlite://\")}\n",
    );
    write(root, "node_modules/left-pad/index.js", "module.exports = function () {};\n");
    tmp
}

pub fn write(root: &Path, rel: &str, content: &str) {
    let path = root.join(rel);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, content).unwrap();
}

/// Config with no retry delays worth waiting for and permissive retrieval.
pub fn test_config(db_path: &Path, extra: &str) -> Config {
    let src = format!(
        r#"[db]
path = "{}"

[retrieval]
min_similarity = 0.0

[embedding]
max_retries = 0
timeout_secs = 5

[generation]
max_retries = 0
timeout_secs = 5

{}
"#,
        db_path.display(),
        extra
    );
    let config: Config = toml::from_str(&src).unwrap();
    repodoc::config::validate(&config).unwrap();
    config
}
