//! Chat client for the local llama-server HTTP endpoint.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::trace;

/// One message in a chat exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".into(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".into(),
            content: content.into(),
        }
    }
}

/// Common interface for chat-based LLMs. Errors surface to the caller,
/// which decides whether to retry.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn query(&self, messages: &[ChatMessage], max_reply_chars: usize) -> Result<String>;
}

const TEMPERATURE: f64 = 0.5;
const TOP_P: f64 = 0.90;
const TOP_K: u32 = 40;
const MAX_TOKENS: u32 = 160;

/// [`LlmClient`] backed by llama-server's OpenAI-compatible endpoint.
pub struct LlamaHttpClient {
    http: reqwest::Client,
    base_url: String,
}

impl LlamaHttpClient {
    pub fn new(base_url: impl Into<String>, request_timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .context("building llm http client")?;
        Ok(Self {
            http,
            base_url: base_url.into(),
        })
    }
}

#[async_trait]
impl LlmClient for LlamaHttpClient {
    async fn query(&self, messages: &[ChatMessage], max_reply_chars: usize) -> Result<String> {
        let url = format!("{}/v1/chat/completions", self.base_url.trim_end_matches('/'));
        let payload = json!({
            "model": "local-llm",
            "messages": messages,
            "temperature": TEMPERATURE,
            "top_p": TOP_P,
            "top_k": TOP_K,
            "max_tokens": MAX_TOKENS,
            "repetition_penalty": 1.15,
            "stop": ["\n", "Usuario:", "Lumo:"],
        });
        trace!(%url, "llm request");
        let resp = self
            .http
            .post(&url)
            .json(&payload)
            .send()
            .await?
            .error_for_status()?;
        let body: ChatCompletion = resp.json().await?;
        let text = body
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| anyhow!("llm response had no choices"))?;
        Ok(trim_reply(&text, max_reply_chars))
    }
}

#[derive(Deserialize)]
struct ChatCompletion {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: String,
}

/// Accumulates whole sentences up to `max_chars`; falls back to a hard cut
/// at the last sentence boundary when even the first sentence is too long.
pub fn trim_reply(text: &str, max_chars: usize) -> String {
    let text = text.trim();
    if text.chars().count() <= max_chars {
        return text.to_string();
    }

    let mut out = String::new();
    for sentence in split_sentences(text) {
        let extra = sentence.chars().count() + usize::from(!out.is_empty());
        if out.chars().count() + extra > max_chars {
            break;
        }
        if !out.is_empty() {
            out.push(' ');
        }
        out.push_str(sentence);
    }
    if !out.is_empty() {
        return out;
    }

    let cut: String = text.chars().take(max_chars).collect();
    match cut.rfind(['.', '!', '?']) {
        Some(idx) => cut[..=idx].trim().to_string(),
        None => cut.trim().to_string(),
    }
}

fn split_sentences(text: &str) -> impl Iterator<Item = &str> {
    text.split_inclusive(['.', '!', '?'])
        .map(str::trim)
        .filter(|s| !s.is_empty())
}
