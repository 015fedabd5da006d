//! C1 — the upstream model client: a single authenticated LLM call with
//! retries, full-jitter backoff, an auth-cooldown short-circuit, and a
//! process-wide concurrency cap. Grounded on
//! `original_source/backend/src/engine/openrouter.py`; never throws — every
//! path returns an [`UpstreamResult`].

use crate::http_transport::HttpTransport;
use crate::traits::{CallOptions, ChatMessage, Transport, TransportError, UpstreamResult};
use rand::Rng;
use sa_domain::config::UpstreamConfig;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::Semaphore;

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn should_retry(status_code: Option<u16>) -> bool {
    match status_code {
        None => true,
        Some(429) => true,
        Some(s) if (500..=599).contains(&s) => true,
        Some(_) => false,
    }
}

pub struct UpstreamClient {
    transport: Arc<dyn Transport>,
    config: UpstreamConfig,
    semaphore: Arc<Semaphore>,
    /// Monotonic wall-clock deadline (ms since epoch) before which any new
    /// call short-circuits with a 401, set by the last auth failure.
    auth_invalid_until_ms: AtomicU64,
}

impl UpstreamClient {
    pub fn new(config: UpstreamConfig) -> Self {
        Self::with_transport(config, Arc::new(HttpTransport::new()))
    }

    pub fn with_transport(config: UpstreamConfig, transport: Arc<dyn Transport>) -> Self {
        let permits = config.max_concurrency.max(1);
        Self {
            transport,
            config,
            semaphore: Arc::new(Semaphore::new(permits)),
            auth_invalid_until_ms: AtomicU64::new(0),
        }
    }

    fn auth_cooldown_active(&self) -> bool {
        now_ms() < self.auth_invalid_until_ms.load(Ordering::Acquire)
    }

    fn set_auth_cooldown(&self) {
        let until = now_ms() + self.config.auth_cooldown_seconds.max(1) * 1000;
        self.auth_invalid_until_ms.store(until, Ordering::Release);
    }

    pub async fn call(
        &self,
        model: &str,
        messages: &[ChatMessage],
        opts: CallOptions,
    ) -> UpstreamResult {
        if self.auth_cooldown_active() {
            return UpstreamResult {
                ok: false,
                model: model.to_string(),
                call_id: opts.call_id,
                attempt: opts.attempt,
                content: None,
                reasoning_details: None,
                usage: None,
                latency_ms: Some(0),
                status_code: Some(401),
                error_text: Some("upstream credentials invalid (cooldown)".to_string()),
            };
        }

        let Some(api_key) = self.config.api_key.as_deref() else {
            return UpstreamResult {
                ok: false,
                model: model.to_string(),
                call_id: opts.call_id,
                attempt: opts.attempt,
                content: None,
                reasoning_details: None,
                usage: None,
                latency_ms: Some(0),
                status_code: None,
                error_text: Some("no upstream API key configured".to_string()),
            };
        };

        let mut body = serde_json::json!({
            "model": model,
            "messages": messages,
        });
        if let Some(t) = opts.temperature {
            body["temperature"] = serde_json::json!(t);
        }
        if let Some(m) = opts.max_tokens {
            body["max_tokens"] = serde_json::json!(m);
        }

        let timeout = opts.timeout_seconds.unwrap_or(self.config.timeout_seconds);

        let _permit = self.semaphore.acquire().await;
        let mut last_error: Option<String> = None;

        for http_attempt in 0..=self.config.max_retries {
            let start = std::time::Instant::now();
            match self.transport.post_chat(&self.config.api_url, api_key, &body, timeout).await {
                Ok(resp) => {
                    let latency_ms = start.elapsed().as_millis() as u64;
                    if resp.status == 401 || resp.status == 403 {
                        self.set_auth_cooldown();
                        return UpstreamResult {
                            ok: false,
                            model: model.to_string(),
                            call_id: opts.call_id,
                            attempt: opts.attempt,
                            content: None,
                            reasoning_details: None,
                            usage: None,
                            latency_ms: Some(latency_ms),
                            status_code: Some(resp.status),
                            error_text: Some(format!("upstream auth error ({})", resp.status)),
                        };
                    }
                    if resp.status >= 400 {
                        last_error = Some(format!("upstream HTTP {}: {}", resp.status, resp.body));
                        if http_attempt < self.config.max_retries && should_retry(Some(resp.status)) {
                            backoff_sleep(self.config.retry_base_seconds, http_attempt).await;
                            continue;
                        }
                        return UpstreamResult {
                            ok: false,
                            model: model.to_string(),
                            call_id: opts.call_id,
                            attempt: opts.attempt,
                            content: None,
                            reasoning_details: None,
                            usage: None,
                            latency_ms: Some(latency_ms),
                            status_code: Some(resp.status),
                            error_text: last_error,
                        };
                    }

                    let message = resp
                        .body
                        .get("choices")
                        .and_then(|c| c.get(0))
                        .and_then(|c| c.get("message"))
                        .cloned()
                        .unwrap_or(serde_json::Value::Null);
                    let content = message.get("content").and_then(|v| v.as_str()).map(|s| s.to_string());
                    let reasoning_details = message.get("reasoning_details").cloned();
                    let usage = resp.body.get("usage").filter(|v| v.is_object()).cloned();

                    return UpstreamResult {
                        ok: true,
                        model: model.to_string(),
                        call_id: opts.call_id,
                        attempt: opts.attempt,
                        content,
                        reasoning_details,
                        usage,
                        latency_ms: Some(latency_ms),
                        status_code: Some(resp.status),
                        error_text: None,
                    };
                }
                Err(err) => {
                    let latency_ms = start.elapsed().as_millis() as u64;
                    last_error = Some(match &err {
                        TransportError::Timeout => format!("timeout calling model {model}"),
                        TransportError::Other(e) => format!("error calling model {model}: {e}"),
                    });
                    if http_attempt < self.config.max_retries {
                        backoff_sleep(self.config.retry_base_seconds, http_attempt).await;
                        continue;
                    }
                    return UpstreamResult {
                        ok: false,
                        model: model.to_string(),
                        call_id: opts.call_id,
                        attempt: opts.attempt,
                        content: None,
                        reasoning_details: None,
                        usage: None,
                        latency_ms: Some(latency_ms),
                        status_code: None,
                        error_text: last_error,
                    };
                }
            }
        }

        UpstreamResult {
            ok: false,
            model: model.to_string(),
            call_id: opts.call_id,
            attempt: opts.attempt,
            content: None,
            reasoning_details: None,
            usage: None,
            latency_ms: None,
            status_code: None,
            error_text: last_error.or_else(|| Some("unknown upstream error".to_string())),
        }
    }
}

/// Full-jitter backoff: sleeps for `base*2^attempt + U(0, base*2^attempt)`,
/// i.e. a value in `[base*2^attempt, 2*base*2^attempt)`.
async fn backoff_sleep(base_seconds: f64, attempt: u32) {
    let base = base_seconds * 2f64.powi(attempt as i32);
    let jitter: f64 = rand::thread_rng().gen_range(0.0..base.max(f64::MIN_POSITIVE));
    tokio::time::sleep(Duration::from_secs_f64(base + jitter)).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::TransportResponse;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    struct FakeTransport {
        calls: AtomicUsize,
        responses: std::sync::Mutex<Vec<Result<TransportResponse, TransportError>>>,
    }

    impl FakeTransport {
        fn new(responses: Vec<Result<TransportResponse, TransportError>>) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                responses: std::sync::Mutex::new(responses),
            }
        }

        fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Transport for FakeTransport {
        async fn post_chat(
            &self,
            _url: &str,
            _api_key: &str,
            _body: &serde_json::Value,
            _timeout_seconds: f64,
        ) -> Result<TransportResponse, TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut guard = self.responses.lock().unwrap();
            if guard.is_empty() {
                Ok(TransportResponse {
                    status: 200,
                    body: serde_json::json!({"choices":[{"message":{"content":"ok"}}]}),
                })
            } else {
                guard.remove(0)
            }
        }
    }

    fn test_config() -> UpstreamConfig {
        UpstreamConfig {
            api_key: Some("test-key".into()),
            api_url: "https://example.invalid/chat".into(),
            max_concurrency: 6,
            max_retries: 2,
            retry_base_seconds: 0.001,
            timeout_seconds: 5.0,
            auth_cooldown_seconds: 60,
            timeout_seconds_fast: None,
            timeout_seconds_balanced: None,
            timeout_seconds_deep: None,
        }
    }

    #[tokio::test]
    async fn successful_call_parses_content_and_usage() {
        let fake = Arc::new(FakeTransport::new(vec![Ok(TransportResponse {
            status: 200,
            body: serde_json::json!({
                "choices": [{"message": {"content": "hello"}}],
                "usage": {"prompt_tokens": 1, "completion_tokens": 1, "total_tokens": 2}
            }),
        })]));
        let client = UpstreamClient::with_transport(test_config(), fake.clone());
        let result = client
            .call("m1", &[ChatMessage::user("hi")], CallOptions::default())
            .await;
        assert!(result.ok);
        assert_eq!(result.content.as_deref(), Some("hello"));
        assert!(result.usage.is_some());
        assert_eq!(fake.call_count(), 1);
    }

    #[tokio::test]
    async fn auth_error_sets_cooldown_and_short_circuits_next_call() {
        let fake = Arc::new(FakeTransport::new(vec![Ok(TransportResponse {
            status: 401,
            body: serde_json::json!({}),
        })]));
        let client = UpstreamClient::with_transport(test_config(), fake.clone());
        let first = client
            .call("m1", &[ChatMessage::user("hi")], CallOptions::default())
            .await;
        assert!(!first.ok);
        assert_eq!(first.status_code, Some(401));
        assert_eq!(fake.call_count(), 1);

        let second = client
            .call("m1", &[ChatMessage::user("hi")], CallOptions::default())
            .await;
        assert!(!second.ok);
        assert_eq!(second.status_code, Some(401));
        // the cooldown short-circuits before touching the network
        assert_eq!(fake.call_count(), 1);
    }

    #[tokio::test]
    async fn retries_on_5xx_then_succeeds() {
        let fake = Arc::new(FakeTransport::new(vec![
            Ok(TransportResponse {
                status: 502,
                body: serde_json::json!({"error": "bad gateway"}),
            }),
            Ok(TransportResponse {
                status: 200,
                body: serde_json::json!({"choices":[{"message":{"content":"recovered"}}]}),
            }),
        ]));
        let client = UpstreamClient::with_transport(test_config(), fake.clone());
        let result = client
            .call("m1", &[ChatMessage::user("hi")], CallOptions::default())
            .await;
        assert!(result.ok);
        assert_eq!(result.content.as_deref(), Some("recovered"));
        assert_eq!(fake.call_count(), 2);
    }

    #[tokio::test]
    async fn terminal_4xx_does_not_retry() {
        let fake = Arc::new(FakeTransport::new(vec![Ok(TransportResponse {
            status: 422,
            body: serde_json::json!({"error": "bad request"}),
        })]));
        let client = UpstreamClient::with_transport(test_config(), fake.clone());
        let result = client
            .call("m1", &[ChatMessage::user("hi")], CallOptions::default())
            .await;
        assert!(!result.ok);
        assert_eq!(result.status_code, Some(422));
        assert_eq!(fake.call_count(), 1);
    }

    #[test]
    fn should_retry_matches_spec_status_classes() {
        assert!(should_retry(None));
        assert!(should_retry(Some(429)));
        assert!(should_retry(Some(500)));
        assert!(should_retry(Some(599)));
        assert!(!should_retry(Some(422)));
        assert!(!should_retry(Some(404)));
    }
}
