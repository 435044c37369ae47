//! Chat-completions client for plain-language backtest explanations.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use thiserror::Error;

const DEFAULT_PROVIDER: &str = "openai";
const DEFAULT_MODEL: &str = "gpt-4o-mini";
const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const TEMPERATURE: f64 = 0.3;

const SYSTEM_PROMPT: &str = "You are a retirement planning assistant. Provide a concise \
explanation of the latest simulation and give structured suggestions to improve outcomes. \
Return JSON with keys: summary (string), suggestions (array of strings).";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AskRequest {
    pub question: String,
    pub inputs: Map<String, Value>,
    pub summary: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AskResponse {
    pub answer: String,
}

#[derive(Debug, Error)]
pub enum ExplainError {
    #[error("Rate limited by the LLM provider. Please try again.")]
    RateLimited,
    #[error("LLM provider rejected the API key.")]
    Unauthorized,
    #[error("LLM request failed with status {status}.")]
    Upstream { status: u16 },
    #[error("LLM request failed due to a network error.")]
    Network(#[source] reqwest::Error),
    #[error("{0} is not set.")]
    NotConfigured(&'static str),
    #[error("Unsupported LLM provider: {0}")]
    UnsupportedProvider(String),
    #[error("LLM response {0}.")]
    MalformedResponse(&'static str),
}

impl ExplainError {
    pub fn status_code(&self) -> u16 {
        match self {
            Self::RateLimited => 429,
            Self::Unauthorized => 401,
            Self::Upstream { .. } | Self::Network(_) => 502,
            Self::NotConfigured(_) | Self::UnsupportedProvider(_) | Self::MalformedResponse(_) => {
                500
            }
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited | Self::Upstream { .. } | Self::Network(_)
        )
    }
}

pub fn classify_status(status: u16) -> ExplainError {
    match status {
        429 => ExplainError::RateLimited,
        401 => ExplainError::Unauthorized,
        status => ExplainError::Upstream { status },
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExplainConfig {
    pub api_key: String,
    pub model: String,
    pub base_url: String,
}

impl ExplainConfig {
    pub fn from_env() -> Result<Self, ExplainError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ExplainError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let provider = lookup("LLM_PROVIDER")
            .unwrap_or_else(|| DEFAULT_PROVIDER.to_string())
            .to_lowercase();
        if provider != DEFAULT_PROVIDER {
            return Err(ExplainError::UnsupportedProvider(provider));
        }

        let api_key = lookup("OPENAI_API_KEY")
            .filter(|key| !key.is_empty())
            .ok_or(ExplainError::NotConfigured("OPENAI_API_KEY"))?;

        Ok(Self {
            api_key,
            model: lookup("OPENAI_MODEL").unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            base_url: lookup("OPENAI_BASE_URL")
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
        })
    }
}

pub fn build_http_client() -> Result<reqwest::Client, ExplainError> {
    reqwest::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .build()
        .map_err(ExplainError::Network)
}

pub struct Explainer {
    client: reqwest::Client,
    config: ExplainConfig,
}

impl Explainer {
    pub fn new(client: reqwest::Client, config: ExplainConfig) -> Self {
        Self { client, config }
    }

    pub async fn ask(&self, request: &AskRequest) -> Result<String, ExplainError> {
        let url = format!("{}/chat/completions", self.config.base_url);
        let response = self
            .client
            .post(url)
            .bearer_auth(&self.config.api_key)
            .json(&chat_payload(&self.config.model, request))
            .send()
            .await
            .map_err(ExplainError::Network)?;

        let status = response.status();
        if !status.is_success() {
            log::warn!("LLM provider returned status {status}");
            return Err(classify_status(status.as_u16()));
        }

        let body = response
            .json::<Value>()
            .await
            .map_err(|_| ExplainError::MalformedResponse("is not valid JSON"))?;
        extract_message_content(&body)
    }
}

fn chat_payload(model: &str, request: &AskRequest) -> Value {
    let user_content = json!({
        "question": request.question,
        "inputs": request.inputs,
        "summary": request.summary,
    });
    json!({
        "model": model,
        "messages": [
            { "role": "system", "content": SYSTEM_PROMPT },
            { "role": "user", "content": user_content.to_string() },
        ],
        "temperature": TEMPERATURE,
    })
}

pub fn extract_message_content(response: &Value) -> Result<String, ExplainError> {
    let choice = response
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|choices| choices.first())
        .ok_or(ExplainError::MalformedResponse("missing choices"))?;

    match choice.get("message").and_then(|message| message.get("content")) {
        None | Some(Value::Null) => Err(ExplainError::MalformedResponse("missing content")),
        Some(Value::String(content)) if content.is_empty() => {
            Err(ExplainError::MalformedResponse("missing content"))
        }
        Some(Value::String(content)) => Ok(content.clone()),
        Some(_) => Err(ExplainError::MalformedResponse("content is not a string")),
    }
}
