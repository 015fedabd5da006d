//! Wire-level shapes for the upstream LLM endpoint (spec §6): a chat
//! message, the parsed response shape, and the `Transport` seam that lets
//! tests substitute a fake HTTP layer without touching the network.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CallOptions {
    pub call_id: Uuid,
    pub attempt: u32,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub timeout_seconds: Option<f64>,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self {
            call_id: Uuid::new_v4(),
            attempt: 0,
            temperature: None,
            max_tokens: None,
            timeout_seconds: None,
        }
    }
}

/// Mirrors the Python `OpenRouterResult` dataclass field-for-field.
#[derive(Debug, Clone)]
pub struct UpstreamResult {
    pub ok: bool,
    pub model: String,
    pub call_id: Uuid,
    pub attempt: u32,
    pub content: Option<String>,
    pub reasoning_details: Option<serde_json::Value>,
    pub usage: Option<serde_json::Value>,
    pub latency_ms: Option<u64>,
    pub status_code: Option<u16>,
    pub error_text: Option<String>,
}

/// A raw (status, body) pair as observed over the wire, before the client
/// parses it into an [`UpstreamResult`].
pub struct TransportResponse {
    pub status: u16,
    pub body: serde_json::Value,
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("timeout")]
    Timeout,
    #[error("transport error: {0}")]
    Other(String),
}

/// `sa_domain::Error` is the shared leaf type at this crate boundary — the
/// real `HttpTransport` maps `reqwest` failures into it before narrowing
/// back down to `TransportError`, so `Http`/`Timeout` stay the single
/// place that classification happens instead of being duplicated per call
/// site.
impl From<sa_domain::Error> for TransportError {
    fn from(err: sa_domain::Error) -> Self {
        match err {
            sa_domain::Error::Timeout(_) => TransportError::Timeout,
            other => TransportError::Other(other.to_string()),
        }
    }
}

/// The seam `UpstreamClient` calls through. `HttpTransport` is the real
/// `reqwest`-backed implementation; tests substitute a fake that counts
/// calls and returns canned responses (spec §8's "fake client's call
/// counter" testable property).
#[async_trait]
pub trait Transport: Send + Sync {
    async fn post_chat(
        &self,
        url: &str,
        api_key: &str,
        body: &serde_json::Value,
        timeout_seconds: f64,
    ) -> Result<TransportResponse, TransportError>;
}
