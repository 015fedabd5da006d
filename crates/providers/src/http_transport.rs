use crate::traits::{Transport, TransportError, TransportResponse};
use async_trait::async_trait;
use std::time::Duration;

/// The real upstream transport: a single shared `reqwest::Client`
/// (connection-pooled), matching the teacher's `openai_compat.rs` pattern
/// of building one client at construction time rather than per-call.
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { client }
    }
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn post_chat(
        &self,
        url: &str,
        api_key: &str,
        body: &serde_json::Value,
        timeout_seconds: f64,
    ) -> Result<TransportResponse, TransportError> {
        let resp = self
            .client
            .post(url)
            .bearer_auth(api_key)
            .json(body)
            .timeout(Duration::from_secs_f64(timeout_seconds.max(0.0)))
            .send()
            .await
            .map_err(|e| {
                let domain_err = if e.is_timeout() { sa_domain::Error::Timeout(e.to_string()) } else { sa_domain::Error::Http(e.to_string()) };
                TransportError::from(domain_err)
            })?;
        let status = resp.status().as_u16();
        let body = resp.json::<serde_json::Value>().await.unwrap_or(serde_json::Value::Null);
        Ok(TransportResponse { status, body })
    }
}
