//! Model service boundary.
//!
//! The backend sends one prompt with one credential and classifies failures.
//! Everything else (retry, rotation, parsing) happens above it.

use std::time::Duration;

use serde::Deserialize;
use serde_json::json;
use tracing::{debug, instrument};

use crate::io::credentials::CredentialKey;

pub const DEFAULT_ENDPOINT: &str = "https://generativelanguage.googleapis.com";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);
/// Longest slice of an error body kept in messages.
const ERROR_BODY_LIMIT: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendErrorKind {
    RateLimited,
    Network,
    Server,
    Auth,
    Malformed,
}

impl BackendErrorKind {
    /// Rate limits, transport failures and 5xx are worth retrying.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            BackendErrorKind::RateLimited | BackendErrorKind::Network | BackendErrorKind::Server
        )
    }

    pub fn from_status(status: u16) -> Self {
        match status {
            429 => BackendErrorKind::RateLimited,
            401 | 403 => BackendErrorKind::Auth,
            408 => BackendErrorKind::Network,
            500..=599 => BackendErrorKind::Server,
            _ => BackendErrorKind::Malformed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind:?}: {message}")]
pub struct BackendError {
    pub kind: BackendErrorKind,
    pub message: String,
}

impl BackendError {
    pub fn new(kind: BackendErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Abstraction over model services. Tests use scripted backends.
pub trait ModelBackend {
    fn send(&self, prompt: &str, credential: &CredentialKey) -> Result<String, BackendError>;
}

/// Google Generative Language API (`generateContent`).
pub struct GeminiBackend {
    agent: ureq::Agent,
    endpoint: String,
    model: String,
}

impl GeminiBackend {
    pub fn new(model: &str) -> Self {
        Self::with_endpoint(DEFAULT_ENDPOINT, model)
    }

    pub fn with_endpoint(endpoint: &str, model: &str) -> Self {
        Self {
            agent: ureq::AgentBuilder::new().timeout(REQUEST_TIMEOUT).build(),
            endpoint: endpoint.trim_end_matches('/').to_string(),
            model: model.to_string(),
        }
    }

    fn url(&self) -> String {
        format!(
            "{}/v1beta/models/{}:generateContent",
            self.endpoint, self.model
        )
    }
}

impl ModelBackend for GeminiBackend {
    #[instrument(skip_all, fields(model = %self.model, key_id = %credential.id, prompt_bytes = prompt.len()))]
    fn send(&self, prompt: &str, credential: &CredentialKey) -> Result<String, BackendError> {
        let body = json!({
            "contents": [{ "parts": [{ "text": prompt }] }]
        });
        let response = self
            .agent
            .post(&self.url())
            .set("x-goog-api-key", credential.secret.expose())
            .send_json(body);

        match response {
            Ok(response) => {
                let parsed = response.into_json::<GenerateResponse>().map_err(|e| {
                    BackendError::new(BackendErrorKind::Network, format!("read response: {e}"))
                })?;
                debug!("model responded");
                extract_text(parsed)
            }
            Err(ureq::Error::Status(status, response)) => {
                let body = response.into_string().unwrap_or_default();
                Err(BackendError::new(
                    BackendErrorKind::from_status(status),
                    format!("HTTP {status}: {}", clip(body.trim(), ERROR_BODY_LIMIT)),
                ))
            }
            Err(ureq::Error::Transport(transport)) => Err(BackendError::new(
                BackendErrorKind::Network,
                transport.to_string(),
            )),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(rename = "promptFeedback", default)]
    prompt_feedback: Option<PromptFeedback>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<Content>,
}

#[derive(Debug, Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct Part {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PromptFeedback {
    #[serde(rename = "blockReason")]
    block_reason: Option<String>,
}

/// Text of the first candidate. A blocked or empty response is not retryable.
pub fn extract_text(response: GenerateResponse) -> Result<String, BackendError> {
    if let Some(reason) = response.prompt_feedback.and_then(|f| f.block_reason) {
        return Err(BackendError::new(
            BackendErrorKind::Malformed,
            format!("prompt blocked: {reason}"),
        ));
    }
    let text: String = response
        .candidates
        .into_iter()
        .next()
        .and_then(|c| c.content)
        .map(|content| {
            content
                .parts
                .into_iter()
                .filter_map(|p| p.text)
                .collect::<Vec<_>>()
                .join("")
        })
        .unwrap_or_default();
    if text.trim().is_empty() {
        return Err(BackendError::new(
            BackendErrorKind::Malformed,
            "response contained no text",
        ));
    }
    Ok(text)
}

fn clip(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(raw: &str) -> GenerateResponse {
        serde_json::from_str(raw).expect("response json")
    }

    #[test]
    fn status_codes_map_to_failure_classes() {
        assert_eq!(BackendErrorKind::from_status(429), BackendErrorKind::RateLimited);
        assert_eq!(BackendErrorKind::from_status(401), BackendErrorKind::Auth);
        assert_eq!(BackendErrorKind::from_status(403), BackendErrorKind::Auth);
        assert_eq!(BackendErrorKind::from_status(400), BackendErrorKind::Malformed);
        assert_eq!(BackendErrorKind::from_status(503), BackendErrorKind::Server);
        assert!(BackendErrorKind::from_status(503).is_transient());
        assert!(!BackendErrorKind::from_status(401).is_transient());
    }

    #[test]
    fn extracts_joined_parts_of_first_candidate() {
        let response = parse(
            r#"{"candidates":[{"content":{"parts":[{"text":"CREATE_FILE::a.py"},{"text":"\nFINISH::done"}]}}]}"#,
        );
        assert_eq!(
            extract_text(response).expect("text"),
            "CREATE_FILE::a.py\nFINISH::done"
        );
    }

    #[test]
    fn blocked_or_empty_responses_are_malformed() {
        let blocked = parse(r#"{"promptFeedback":{"blockReason":"SAFETY"}}"#);
        let err = extract_text(blocked).unwrap_err();
        assert_eq!(err.kind, BackendErrorKind::Malformed);
        assert!(err.message.contains("SAFETY"));

        let empty = parse(r#"{"candidates":[]}"#);
        assert_eq!(extract_text(empty).unwrap_err().kind, BackendErrorKind::Malformed);
    }

    #[test]
    fn url_uses_model_and_trims_endpoint() {
        let backend = GeminiBackend::with_endpoint("http://localhost:9/", "gemini-2.5-flash");
        assert_eq!(
            backend.url(),
            "http://localhost:9/v1beta/models/gemini-2.5-flash:generateContent"
        );
    }
}
