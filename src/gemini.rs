use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use crate::config::Config;

/// Why a generation attempt failed, classified at the API boundary so the
/// caller can pick a recovery path without inspecting message strings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerateErrorKind {
    /// HTTP 429. The caller should rotate to the next credential.
    RateLimited,
    /// The model refused the prompt or the reply was safety-blocked.
    SafetyRejected,
    /// Network or server-side trouble that a later attempt may clear.
    Transient(String),
    /// Malformed response or a non-retryable API error.
    Fatal(String),
}

impl std::fmt::Display for GenerateErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GenerateErrorKind::RateLimited => write!(f, "rate limited"),
            GenerateErrorKind::SafetyRejected => write!(f, "safety rejected"),
            GenerateErrorKind::Transient(msg) => write!(f, "transient: {msg}"),
            GenerateErrorKind::Fatal(msg) => write!(f, "fatal: {msg}"),
        }
    }
}

/// Single-shot text generation against one credential. Retry and credential
/// rotation live in the caller.
#[async_trait]
pub trait TextBackend: Send + Sync {
    async fn generate(&self, api_key: &str, prompt: &str) -> Result<String, GenerateErrorKind>;
}

pub struct GeminiClient {
    http: reqwest::Client,
    model: String,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct GeminiResponse {
    candidates: Option<Vec<GeminiCandidate>>,
    #[serde(rename = "promptFeedback")]
    prompt_feedback: Option<GeminiPromptFeedback>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidate {
    content: Option<GeminiContent>,
    #[serde(rename = "finishReason")]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GeminiContent {
    parts: Option<Vec<GeminiPart>>,
}

#[derive(Debug, Deserialize)]
struct GeminiPart {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GeminiPromptFeedback {
    #[serde(rename = "blockReason")]
    block_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GeminiApiError {
    error: GeminiApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct GeminiApiErrorDetail {
    message: String,
    status: Option<String>,
}

impl GeminiClient {
    pub fn new(config: &Config) -> Self {
        GeminiClient {
            http: reqwest::Client::new(),
            model: config.gemini_model.clone(),
            base_url: config
                .gemini_base_url
                .clone()
                .unwrap_or_else(|| "https://generativelanguage.googleapis.com/v1beta".into()),
        }
    }
}

#[async_trait]
impl TextBackend for GeminiClient {
    async fn generate(&self, api_key: &str, prompt: &str) -> Result<String, GenerateErrorKind> {
        let url = format!(
            "{}/models/{}:generateContent?key={}",
            self.base_url, self.model, api_key
        );

        let request = json!({
            "contents": [{ "parts": [{ "text": prompt }] }],
            "safetySettings": [
                { "category": "HARM_CATEGORY_HARASSMENT", "threshold": "BLOCK_NONE" },
                { "category": "HARM_CATEGORY_HATE_SPEECH", "threshold": "BLOCK_NONE" },
                { "category": "HARM_CATEGORY_SEXUALLY_EXPLICIT", "threshold": "BLOCK_NONE" },
                { "category": "HARM_CATEGORY_DANGEROUS_CONTENT", "threshold": "BLOCK_NONE" }
            ],
        });

        let response = self
            .http
            .post(&url)
            .header("content-type", "application/json")
            .json(&request)
            .send()
            .await
            .map_err(|e| GenerateErrorKind::Transient(e.to_string()))?;

        let status = response.status();

        if status.as_u16() == 429 {
            return Err(GenerateErrorKind::RateLimited);
        }

        let body = response
            .text()
            .await
            .map_err(|e| GenerateErrorKind::Transient(e.to_string()))?;

        if !status.is_success() {
            if let Ok(api_err) = serde_json::from_str::<GeminiApiError>(&body) {
                let status_tag = api_err.error.status.unwrap_or_default();
                if status_tag == "RESOURCE_EXHAUSTED" {
                    return Err(GenerateErrorKind::RateLimited);
                }
                if status.is_server_error() || status_tag == "UNAVAILABLE" {
                    return Err(GenerateErrorKind::Transient(api_err.error.message));
                }
                return Err(GenerateErrorKind::Fatal(format!(
                    "{status_tag}: {}",
                    api_err.error.message
                )));
            }
            if status.is_server_error() {
                return Err(GenerateErrorKind::Transient(format!("HTTP {status}")));
            }
            return Err(GenerateErrorKind::Fatal(format!("HTTP {status}: {body}")));
        }

        let parsed: GeminiResponse = serde_json::from_str(&body)
            .map_err(|e| GenerateErrorKind::Fatal(format!("Failed to parse response: {e}")))?;
        classify_success_body(parsed)
    }
}

/// A 200 response can still carry a block verdict instead of text.
fn classify_success_body(parsed: GeminiResponse) -> Result<String, GenerateErrorKind> {
    if let Some(feedback) = &parsed.prompt_feedback {
        if feedback.block_reason.is_some() {
            return Err(GenerateErrorKind::SafetyRejected);
        }
    }

    let candidate = parsed
        .candidates
        .and_then(|mut c| if c.is_empty() { None } else { Some(c.remove(0)) })
        .ok_or(GenerateErrorKind::SafetyRejected)?;

    if matches!(candidate.finish_reason.as_deref(), Some("SAFETY")) {
        return Err(GenerateErrorKind::SafetyRejected);
    }

    let text: String = candidate
        .content
        .and_then(|c| c.parts)
        .map(|parts| parts.into_iter().filter_map(|p| p.text).collect())
        .unwrap_or_default();

    if text.trim().is_empty() {
        return Err(GenerateErrorKind::Fatal("empty candidate text".into()));
    }
    Ok(text)
}
