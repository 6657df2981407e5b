//! LLM client adapter.
//!
//! The plan builder makes exactly one kind of LLM request: a single
//! deterministic completion (temperature 0) that returns a plain-text
//! step list. The trait keeps vendors out of the core; `HttpLlmClient`
//! speaks the Anthropic messages API, `ScriptedLlm` backs tests.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use crate::error::{Error, Result};

/// Minimal completion interface consumed by the plan builder.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Complete a prompt and return the raw response text.
    async fn complete(&self, prompt: &str, temperature: f64, max_tokens: u32) -> Result<String>;
}

/// Configuration for the HTTP LLM client.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub api_key: String,
    /// Base URL override (defaults to the Anthropic API)
    pub base_url: Option<String>,
    pub model: String,
    pub timeout_secs: u64,
}

impl LlmConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: None,
            model: "claude-3-5-sonnet-20241022".to_string(),
            timeout_secs: 120,
        }
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }
}

/// HTTP client for the Anthropic messages API.
pub struct HttpLlmClient {
    config: LlmConfig,
    http: Client,
}

impl HttpLlmClient {
    const DEFAULT_BASE_URL: &'static str = "https://api.anthropic.com";
    const API_VERSION: &'static str = "2023-06-01";

    pub fn new(config: LlmConfig) -> Self {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .unwrap_or_default();
        Self { config, http }
    }

    fn base_url(&self) -> &str {
        self.config
            .base_url
            .as_deref()
            .unwrap_or(Self::DEFAULT_BASE_URL)
    }
}

#[derive(Debug, Serialize)]
struct ApiRequest {
    model: String,
    messages: Vec<ApiMessage>,
    max_tokens: u32,
    temperature: f64,
}

#[derive(Debug, Serialize)]
struct ApiMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    content: Vec<ApiContent>,
}

#[derive(Debug, Deserialize)]
struct ApiContent {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

#[async_trait]
impl LlmClient for HttpLlmClient {
    async fn complete(&self, prompt: &str, temperature: f64, max_tokens: u32) -> Result<String> {
        let request = ApiRequest {
            model: self.config.model.clone(),
            messages: vec![ApiMessage {
                role: "user".to_string(),
                content: prompt.to_string(),
            }],
            max_tokens,
            temperature,
        };

        let url = format!("{}/v1/messages", self.base_url());
        let response = self
            .http
            .post(&url)
            .header("x-api-key", &self.config.api_key)
            .header("anthropic-version", Self::API_VERSION)
            .header("content-type", "application/json")
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::Llm(format!("HTTP request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let message = response
                .json::<ApiError>()
                .await
                .map(|e| e.error.message)
                .unwrap_or_else(|_| format!("HTTP {}", status));
            return Err(Error::Llm(message));
        }

        let body: ApiResponse = response
            .json()
            .await
            .map_err(|e| Error::Llm(format!("malformed response: {}", e)))?;

        let text = body
            .content
            .into_iter()
            .filter_map(|c| c.text)
            .collect::<Vec<_>>()
            .join("");

        if text.is_empty() {
            return Err(Error::Llm("empty completion".to_string()));
        }
        Ok(text)
    }
}

/// Scripted client: pops queued responses in order. An exhausted queue
/// yields an error, which tests use to assert "no LLM call happened".
#[derive(Default)]
pub struct ScriptedLlm {
    responses: Mutex<VecDeque<String>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedLlm {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a canned response.
    pub fn push_response(&self, response: impl Into<String>) {
        self.responses
            .lock()
            .expect("scripted llm lock")
            .push_back(response.into());
    }

    /// Prompts received so far.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("scripted llm lock").clone()
    }

    /// Number of completions served.
    pub fn call_count(&self) -> usize {
        self.calls.lock().expect("scripted llm lock").len()
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn complete(&self, prompt: &str, _temperature: f64, _max_tokens: u32) -> Result<String> {
        self.calls
            .lock()
            .expect("scripted llm lock")
            .push(prompt.to_string());
        self.responses
            .lock()
            .expect("scripted llm lock")
            .pop_front()
            .ok_or_else(|| Error::Llm("no scripted response queued".to_string()))
    }
}
