//! LLM elaboration of inbound support emails into reply drafts.
//!
//! The engine sends the email text to a chat-completions endpoint and
//! expects the model to answer with strict JSON. Elaboration never fails
//! outward: every failure degrades to a fixed fallback reply. Transport
//! failures and retryable statuses are retried with backoff first;
//! rejected requests and unusable model output fall back immediately.
//!
//! Configuration:
//! - `OPENAI_API_KEY`: bearer token for the endpoint
//! - `ENGINE_API_URL`: chat-completions base URL (default: `https://api.openai.com/v1`)
//! - `ENGINE_MODEL`: model to use (default: `gpt-5`)
//! - `ENGINE_MAX_ATTEMPTS`: attempts for retryable failures before falling back (default: 3)

use std::env;
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Default chat-completions API URL
const DEFAULT_ENGINE_URL: &str = "https://api.openai.com/v1";

/// Default model
const DEFAULT_ENGINE_MODEL: &str = "gpt-5";

/// Attempts for retryable failures before degrading to the fallback reply
const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Timeout for engine requests
const ENGINE_TIMEOUT: Duration = Duration::from_secs(30);

/// System prompt for the triage responder
const SYSTEM_PROMPT: &str = r#"You are Deflektor, a support email triage assistant.

Read the customer's email and draft a short first-response reply.

Rules:
1. Acknowledge the request. When the fix is obvious (restarts, password resets, cable checks), offer that one concrete step.
2. Never promise timelines or commitments beyond "our team will follow up".
3. Answer with ONLY a JSON object, no code fences and no prose around it:
{"subject": "<reply subject>", "text": "<reply body>"}"#;

/// Subject used when elaboration degrades to the fallback reply.
pub const FALLBACK_SUBJECT: &str = "Support Request Processing Error";

/// Body used when elaboration degrades to the fallback reply.
pub const FALLBACK_TEXT: &str = "We encountered an issue while processing your request. \
Our team has been notified and will get back to you shortly.";

/// Reply drafted for one inbound email.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ElaborationResult {
    pub subject: String,
    pub text: String,
}

/// Reply used when the engine cannot produce one.
pub fn fallback_result() -> ElaborationResult {
    ElaborationResult {
        subject: FALLBACK_SUBJECT.to_string(),
        text: FALLBACK_TEXT.to_string(),
    }
}

/// Drafts a reply for inbound email text.
pub trait ElaborationEngine: Send + Sync {
    /// Never fails; implementations degrade to a fallback reply instead.
    fn elaborate(&self, email_text: &str) -> ElaborationResult;
}

/// Configuration for the chat-completions engine
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Bearer token; elaboration degrades immediately when unset
    pub api_key: Option<String>,
    pub api_url: String,
    pub model: String,
    pub max_attempts: u32,
    pub retry_base_delay: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            api_key: env::var("OPENAI_API_KEY")
                .ok()
                .filter(|value| !value.trim().is_empty()),
            api_url: env::var("ENGINE_API_URL")
                .unwrap_or_else(|_| DEFAULT_ENGINE_URL.to_string()),
            model: env::var("ENGINE_MODEL").unwrap_or_else(|_| DEFAULT_ENGINE_MODEL.to_string()),
            max_attempts: env::var("ENGINE_MAX_ATTEMPTS")
                .ok()
                .and_then(|value| value.parse().ok())
                .filter(|value| *value > 0)
                .unwrap_or(DEFAULT_MAX_ATTEMPTS),
            retry_base_delay: Duration::from_secs(2),
        }
    }
}

/// Reasons a single engine request fails.
#[derive(Debug, thiserror::Error)]
enum EngineError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("engine returned {status}: {body}")]
    Api { status: u16, body: String },
    #[error("unusable model output: {0}")]
    Output(String),
    #[error("engine config error: {0}")]
    Config(&'static str),
}

impl EngineError {
    /// Whether a retry has a chance of succeeding.
    fn is_transient(&self) -> bool {
        match self {
            EngineError::Http(_) => true,
            EngineError::Api { status, .. } => *status == 429 || *status >= 500,
            EngineError::Output(_) | EngineError::Config(_) => false,
        }
    }
}

/// Chat-completions implementation of [`ElaborationEngine`].
#[derive(Debug, Clone)]
pub struct ChatEngine {
    config: EngineConfig,
    client: reqwest::blocking::Client,
}

impl ChatEngine {
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        let client = reqwest::blocking::Client::builder()
            .timeout(ENGINE_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::blocking::Client::new());

        info!(
            "elaboration engine initialized: url={}, model={}, max_attempts={}",
            config.api_url, config.model, config.max_attempts
        );

        Self { config, client }
    }

    fn request_reply(&self, email_text: &str) -> Result<ElaborationResult, EngineError> {
        let api_key = self
            .config
            .api_key
            .as_ref()
            .ok_or(EngineError::Config("OPENAI_API_KEY not set"))?;

        let url = format!("{}/chat/completions", self.config.api_url);
        let request = ChatRequest {
            model: self.config.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: SYSTEM_PROMPT.to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: email_text.to_string(),
                },
            ],
            max_completion_tokens: 1024,
        };

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", api_key))
            .header("Content-Type", "application/json")
            .json(&request)
            .send()?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().unwrap_or_default();
            return Err(EngineError::Api { status, body });
        }

        let chat: ChatResponse = response
            .json()
            .map_err(|err| EngineError::Output(format!("undecodable response body: {}", err)))?;
        let content = chat
            .choices
            .first()
            .map(|choice| choice.message.content.clone())
            .unwrap_or_default();
        parse_reply(&content).map_err(EngineError::Output)
    }
}

impl Default for ChatEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl ElaborationEngine for ChatEngine {
    fn elaborate(&self, email_text: &str) -> ElaborationResult {
        let mut attempt = 0;
        loop {
            match self.request_reply(email_text) {
                Ok(result) => return result,
                Err(err) if err.is_transient() && attempt + 1 < self.config.max_attempts => {
                    let delay = self
                        .config
                        .retry_base_delay
                        .saturating_mul(2u32.saturating_pow(attempt));
                    warn!(
                        "elaboration attempt {}/{} failed, retrying in {:?}: {}",
                        attempt + 1,
                        self.config.max_attempts,
                        delay,
                        err
                    );
                    thread::sleep(delay);
                    attempt += 1;
                }
                Err(err) => {
                    warn!(
                        "elaboration failed after {} attempt(s), using fallback reply: {}",
                        attempt + 1,
                        err
                    );
                    return fallback_result();
                }
            }
        }
    }
}

/// Parse model output into a reply, tolerating markdown fences.
fn parse_reply(content: &str) -> Result<ElaborationResult, String> {
    let trimmed = content.trim();
    let trimmed = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .unwrap_or(trimmed);
    let trimmed = trimmed.strip_suffix("```").unwrap_or(trimmed).trim();
    let result: ElaborationResult =
        serde_json::from_str(trimmed).map_err(|err| format!("unparseable reply: {}", err))?;
    if result.subject.trim().is_empty() || result.text.trim().is_empty() {
        return Err("reply has empty subject or text".to_string());
    }
    Ok(result)
}

/// Request body for the chat completions endpoint
#[derive(Debug, Clone, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    max_completion_tokens: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}
