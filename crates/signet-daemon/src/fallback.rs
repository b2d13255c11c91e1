// Copyright (c) 2026 Signet Protocol Contributors
// SPDX-License-Identifier: Apache-2.0

//! Model-backed JSON repair providers.
//!
//! The pipeline reaches a provider only after strict parsing and the
//! deterministic repair tier both fail. Returned text is untrusted and is
//! re-parsed, re-validated, and checked against semantic invariants by the
//! caller.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

const REPAIR_SYSTEM_PROMPT: &str = "You repair JSON ONLY.\n\
- Output ONLY a JSON object that validates against the provided JSON Schema.\n\
- Do not invent fields or values. If something is missing, set it to null or omit it.\n\
- No explanations. No prose. Output must be valid JSON.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepairOutcome {
    pub text: String,
    /// Tokens actually consumed by the provider, as reported by it.
    pub tokens: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum RepairError {
    #[error("no repair provider configured")]
    Unavailable,
    #[error("repair provider failed: {0}")]
    Provider(String),
}

#[async_trait]
pub trait RepairProvider: Send + Sync {
    async fn repair(&self, raw: &str, schema: &Value) -> Result<RepairOutcome, RepairError>;

    /// Rough pre-call estimate used for quota gating, ~4 chars per token.
    fn estimate_tokens(&self, raw: &str) -> u64 {
        std::cmp::max(1, raw.len() as u64 / 4)
    }
}

/// Stands in when no provider is configured; fallback is then effectively
/// disabled regardless of tenant configuration.
pub struct NullProvider;

#[async_trait]
impl RepairProvider for NullProvider {
    async fn repair(&self, _raw: &str, _schema: &Value) -> Result<RepairOutcome, RepairError> {
        Err(RepairError::Unavailable)
    }
}

/// OpenAI-compatible chat-completions repair client.
pub struct OpenAiRepairProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl OpenAiRepairProvider {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    #[serde(default)]
    total_tokens: u64,
}

#[async_trait]
impl RepairProvider for OpenAiRepairProvider {
    async fn repair(&self, raw: &str, schema: &Value) -> Result<RepairOutcome, RepairError> {
        let schema_text = schema.to_string();
        let body = json!({
            "model": self.model,
            "temperature": 0,
            "max_tokens": 800,
            "messages": [
                {"role": "system", "content": REPAIR_SYSTEM_PROMPT},
                {"role": "user", "content": format!("Schema:\n{schema_text}\n---\nBroken JSON:\n{raw}")}
            ]
        });
        let response = self
            .client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| RepairError::Provider(e.to_string()))?;
        if !response.status().is_success() {
            return Err(RepairError::Provider(format!(
                "provider returned {}",
                response.status()
            )));
        }
        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| RepairError::Provider(format!("decode response: {e}")))?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| RepairError::Provider("empty choices".to_string()))?;
        Ok(RepairOutcome {
            text: strip_code_fence(&content).to_string(),
            tokens: parsed.usage.map(|u| u.total_tokens).unwrap_or(0),
        })
    }
}

/// Models often wrap output in a markdown fence despite instructions.
pub fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(inner) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let inner = inner.strip_prefix("json").unwrap_or(inner);
    let inner = inner.strip_suffix("```").unwrap_or(inner);
    inner.trim()
}

/// Deterministic test double: returns a fixed repair with a fixed token
/// count, or a scripted failure.
pub struct ScriptedProvider {
    pub text: Option<String>,
    pub tokens: u64,
}

impl ScriptedProvider {
    pub fn repairs_to(text: impl Into<String>, tokens: u64) -> Self {
        Self {
            text: Some(text.into()),
            tokens,
        }
    }

    pub fn failing() -> Self {
        Self {
            text: None,
            tokens: 0,
        }
    }
}

#[async_trait]
impl RepairProvider for ScriptedProvider {
    async fn repair(&self, _raw: &str, _schema: &Value) -> Result<RepairOutcome, RepairError> {
        match &self.text {
            Some(text) => Ok(RepairOutcome {
                text: text.clone(),
                tokens: self.tokens,
            }),
            None => Err(RepairError::Provider("scripted failure".to_string())),
        }
    }
}
