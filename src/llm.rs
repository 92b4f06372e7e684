//! Generation and judging capabilities.
//!
//! [`Generator`] (`generate(prompt) -> text`) writes section drafts and
//! [`JudgeModel`] (`judge(prompt) -> Verdict`) grades them. Both are opaque
//! to the pipeline; [`ChatClient`] implements them against any
//! OpenAI-compatible `/chat/completions` endpoint, and the writer and judge
//! may use different models.
//!
//! A judge reply that is not a valid verdict is a
//! [`CapabilityError::Malformed`], never a content verdict.

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use tracing::debug;

use crate::config::GenerationConfig;
use crate::error::CapabilityError;
use crate::models::Verdict;

/// A chat prompt: system instructions plus the user message.
#[derive(Debug, Clone, Default)]
pub struct Prompt {
    pub system: String,
    pub user: String,
}

#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(&self, prompt: &Prompt) -> Result<String, CapabilityError>;
}

#[async_trait]
pub trait JudgeModel: Send + Sync {
    async fn judge(&self, prompt: &Prompt) -> Result<Verdict, CapabilityError>;
}

/// Build the writer and judge capabilities from `[generation]`.
pub fn create_models(config: &GenerationConfig) -> Result<(Arc<dyn Generator>, Arc<dyn JudgeModel>)> {
    match config.provider.as_str() {
        "disabled" => Ok((Arc::new(DisabledChat), Arc::new(DisabledChat))),
        "openai" => {
            let writer_model = config
                .writer_model
                .clone()
                .ok_or_else(|| anyhow::anyhow!("generation.writer_model required"))?;
            let judge_model = config
                .judge_model
                .clone()
                .unwrap_or_else(|| writer_model.clone());
            let writer = ChatClient::new(config, writer_model, "generate")?;
            let judge = ChatClient::new(config, judge_model, "judge")?;
            Ok((Arc::new(writer), Arc::new(judge)))
        }
        other => bail!("Unknown generation provider: {}", other),
    }
}

pub struct DisabledChat;

#[async_trait]
impl Generator for DisabledChat {
    async fn generate(&self, _prompt: &Prompt) -> Result<String, CapabilityError> {
        Err(CapabilityError::Disabled {
            capability: "generate",
        })
    }
}

#[async_trait]
impl JudgeModel for DisabledChat {
    async fn judge(&self, _prompt: &Prompt) -> Result<Verdict, CapabilityError> {
        Err(CapabilityError::Disabled { capability: "judge" })
    }
}

/// OpenAI-compatible chat completions client.
pub struct ChatClient {
    client: reqwest::Client,
    url: String,
    model: String,
    api_key: String,
    temperature: f32,
    capability: &'static str,
}

impl ChatClient {
    pub fn new(config: &GenerationConfig, model: String, capability: &'static str) -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY environment variable not set"))?;
        let base = config
            .url
            .clone()
            .unwrap_or_else(|| "https://api.openai.com/v1".to_string());
        Ok(Self {
            client: reqwest::Client::new(),
            url: format!("{}/chat/completions", base.trim_end_matches('/')),
            model,
            api_key,
            temperature: config.temperature,
            capability,
        })
    }

    async fn complete(&self, prompt: &Prompt, json_mode: bool) -> Result<String, CapabilityError> {
        debug!(url = %self.url, model = %self.model, capability = self.capability, "chat request");

        let mut payload = json!({
            "model": self.model,
            "temperature": self.temperature,
            "messages": [
                {"role": "system", "content": prompt.system},
                {"role": "user", "content": prompt.user},
            ],
        });
        if json_mode {
            payload["response_format"] = json!({"type": "json_object"});
        }

        let response = self
            .client
            .post(&self.url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&payload)
            .send()
            .await
            .map_err(|e| CapabilityError::Transport {
                capability: self.capability,
                message: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CapabilityError::Status {
                capability: self.capability,
                status: status.as_u16(),
                body,
            });
        }

        let data: serde_json::Value =
            response
                .json()
                .await
                .map_err(|e| CapabilityError::Malformed {
                    capability: self.capability,
                    message: e.to_string(),
                })?;

        data.get("choices")
            .and_then(|c| c.as_array())
            .and_then(|c| c.first())
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str())
            .map(|s| s.trim().to_string())
            .ok_or_else(|| CapabilityError::Malformed {
                capability: self.capability,
                message: "no message content in response".to_string(),
            })
    }
}

#[async_trait]
impl Generator for ChatClient {
    async fn generate(&self, prompt: &Prompt) -> Result<String, CapabilityError> {
        self.complete(prompt, false).await
    }
}

#[async_trait]
impl JudgeModel for ChatClient {
    async fn judge(&self, prompt: &Prompt) -> Result<Verdict, CapabilityError> {
        let raw = self.complete(prompt, true).await?;
        parse_verdict(&raw).map_err(|message| CapabilityError::Malformed {
            capability: self.capability,
            message,
        })
    }
}

/// Parse a judge reply into a [`Verdict`].
///
/// Accepts bare JSON or JSON inside a Markdown fence. The score must lie
/// in `[0, 1]`.
pub fn parse_verdict(raw: &str) -> Result<Verdict, String> {
    let body = strip_fence(raw);
    let verdict: Verdict = serde_json::from_str(body).map_err(|e| e.to_string())?;
    if !(0.0..=1.0).contains(&verdict.score) || verdict.score.is_nan() {
        return Err(format!("score {} outside [0, 1]", verdict.score));
    }
    Ok(verdict)
}

fn strip_fence(raw: &str) -> &str {
    let t = raw.trim();
    let Some(rest) = t.strip_prefix("```") else {
        return t;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}
