//! C5 — the JSON-role caller: a schema-bound call with a single
//! correction-prompt retry. Grounded on
//! `original_source/backend/src/engine/pipeline/runner.py::_call_json_role`.

use crate::call_log::record_call;
use sa_domain::config::PricingConfig;
use sa_domain::pipeline_schemas::PipelineBudget;
use sa_domain::records::{truncate_to_bytes, RUN_STEP_STRING_LIMIT};
use sa_ledger::{BudgetFailure, Ledger};
use sa_providers::{CallOptions, ChatMessage, UpstreamClient, UpstreamResult};
use serde::de::DeserializeOwned;
use uuid::Uuid;

const CORRECTION_RAW_TEXT_LIMIT: usize = 8 * 1024;

pub struct JsonRoleResult<T> {
    pub parsed: Option<T>,
    pub final_raw_text: String,
    pub validation_error: Option<String>,
    pub transport_ok: bool,
    pub budget_failure: Option<BudgetFailure>,
}

impl<T> JsonRoleResult<T> {
    pub fn is_valid(&self) -> bool {
        self.parsed.is_some()
    }
}

#[allow(clippy::too_many_arguments)]
pub async fn call_json_role<T: DeserializeOwned>(
    client: &UpstreamClient,
    ledger: &Ledger,
    pricing: &PricingConfig,
    run_id: Uuid,
    owner_key_id: Option<&str>,
    stage_name: &str,
    agent_role: &str,
    model: &str,
    prompt: &str,
    schema_example: &serde_json::Value,
    budget: Option<&PipelineBudget>,
    timeout_seconds: Option<f64>,
) -> JsonRoleResult<T> {
    let call_id = Uuid::new_v4();
    let opts = CallOptions {
        call_id,
        attempt: 0,
        temperature: None,
        max_tokens: None,
        timeout_seconds,
    };
    let first = client.call(model, &[ChatMessage::user(prompt)], opts).await;
    let budget_failure = record_attempt(ledger, pricing, run_id, owner_key_id, stage_name, agent_role, &first, budget);
    if let Some(failure) = budget_failure {
        return JsonRoleResult {
            parsed: None,
            final_raw_text: first.content.clone().unwrap_or_default(),
            validation_error: None,
            transport_ok: first.ok,
            budget_failure: Some(failure),
        };
    }

    let raw_text = first.content.clone().unwrap_or_default();
    match try_parse::<T>(&raw_text) {
        Ok(parsed) => {
            return JsonRoleResult {
                parsed: Some(parsed),
                final_raw_text: raw_text,
                validation_error: None,
                transport_ok: first.ok,
                budget_failure: None,
            };
        }
        Err(validation_error) => {
            let correction_prompt = build_correction_prompt(schema_example, &raw_text, &validation_error);
            let retry_opts = CallOptions {
                call_id,
                attempt: 1,
                temperature: None,
                max_tokens: None,
                timeout_seconds,
            };
            let second = client.call(model, &[ChatMessage::user(&correction_prompt)], retry_opts).await;
            let budget_failure =
                record_attempt(ledger, pricing, run_id, owner_key_id, stage_name, agent_role, &second, budget);
            let raw_text2 = second.content.clone().unwrap_or_default();
            if let Some(failure) = budget_failure {
                return JsonRoleResult {
                    parsed: None,
                    final_raw_text: raw_text2,
                    validation_error: None,
                    transport_ok: second.ok,
                    budget_failure: Some(failure),
                };
            }
            match try_parse::<T>(&raw_text2) {
                Ok(parsed) => JsonRoleResult {
                    parsed: Some(parsed),
                    final_raw_text: raw_text2,
                    validation_error: None,
                    transport_ok: second.ok,
                    budget_failure: None,
                },
                Err(err2) => JsonRoleResult {
                    parsed: None,
                    final_raw_text: raw_text2,
                    validation_error: Some(err2),
                    transport_ok: second.ok,
                    budget_failure: None,
                },
            }
        }
    }
}

fn try_parse<T: DeserializeOwned>(raw_text: &str) -> Result<T, String> {
    serde_json::from_str::<T>(raw_text).map_err(|e| e.to_string())
}

/// Records the usage event + run step for one attempt, then checks the
/// budget, all under the ledger's single write lock (spec §8 ordering
/// invariant: usage for attempt N is persisted before the budget check for
/// attempt N).
fn record_attempt(
    ledger: &Ledger,
    pricing: &PricingConfig,
    run_id: Uuid,
    owner_key_id: Option<&str>,
    stage_name: &str,
    agent_role: &str,
    result: &UpstreamResult,
    budget: Option<&PipelineBudget>,
) -> Option<BudgetFailure> {
    let output_json = match try_parse_preview(result) {
        Some(value) => serde_json::json!({"parsed_json": value}),
        None => serde_json::json!({
            "raw_text": truncate_to_bytes(result.content.as_deref().unwrap_or_default(), RUN_STEP_STRING_LIMIT),
            "validation_error": result.error_text,
        }),
    };
    record_call(ledger, pricing, run_id, owner_key_id, stage_name, agent_role, result, output_json, budget)
}

/// A run step may record either `{parsed_json}` or `{raw_text,
/// validation_error}` — we don't know which schema `T` is at this layer,
/// so this only detects "is it syntactically valid JSON" for the preview;
/// semantic schema validation happens in `call_json_role` itself.
fn try_parse_preview(result: &UpstreamResult) -> Option<serde_json::Value> {
    let content = result.content.as_deref()?;
    serde_json::from_str::<serde_json::Value>(content).ok()
}

/// Composes the correction prompt: literally embeds the schema example,
/// the previous raw text (truncated to 8 KB), and the validation error.
pub fn build_correction_prompt(schema_example: &serde_json::Value, previous_raw_text: &str, validation_error: &str) -> String {
    let truncated = truncate_to_bytes(previous_raw_text, CORRECTION_RAW_TEXT_LIMIT);
    let schema_json = serde_json::to_string_pretty(schema_example).unwrap_or_default();
    format!(
        "Your previous response could not be parsed as valid JSON matching the required schema.\n\n\
         Required JSON schema (respond with JSON matching this shape exactly, no extra fields):\n{schema_json}\n\n\
         Your previous response was:\n{truncated}\n\n\
         Validation error: {validation_error}\n\n\
         Respond again with corrected JSON only."
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use sa_domain::config::PricingConfig;
    use sa_ledger::Ledger;
    use sa_providers::{Transport, TransportError, TransportResponse, UpstreamClient};
    use async_trait::async_trait;
    use sa_domain::config::UpstreamConfig;
    use serde::Deserialize;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Deserialize, PartialEq)]
    #[serde(deny_unknown_fields)]
    struct Sample {
        final_ranking: Vec<String>,
        evaluations: Vec<String>,
    }

    struct ScriptedTransport {
        calls: AtomicUsize,
        bodies: Mutex<Vec<&'static str>>,
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn post_chat(
            &self,
            _url: &str,
            _api_key: &str,
            _body: &serde_json::Value,
            _timeout_seconds: f64,
        ) -> Result<TransportResponse, TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let content = self.bodies.lock().unwrap().remove(0);
            Ok(TransportResponse {
                status: 200,
                body: serde_json::json!({"choices": [{"message": {"content": content}}]}),
            })
        }
    }

    fn test_client(bodies: Vec<&'static str>) -> (UpstreamClient, Arc<ScriptedTransport>) {
        let transport = Arc::new(ScriptedTransport {
            calls: AtomicUsize::new(0),
            bodies: Mutex::new(bodies),
        });
        let config = UpstreamConfig {
            api_key: Some("k".into()),
            api_url: "https://example.invalid".into(),
            max_concurrency: 4,
            max_retries: 0,
            retry_base_seconds: 0.001,
            timeout_seconds: 5.0,
            auth_cooldown_seconds: 60,
            timeout_seconds_fast: None,
            timeout_seconds_balanced: None,
            timeout_seconds_deep: None,
        };
        (UpstreamClient::with_transport(config, transport.clone()), transport)
    }

    #[tokio::test]
    async fn valid_json_on_first_attempt_needs_no_retry() {
        let (client, transport) = test_client(vec![r#"{"final_ranking":["a"],"evaluations":[]}"#]);
        let ledger = Ledger::new();
        let pricing = PricingConfig {
            table: Default::default(),
            price_book_version: "v1".into(),
        };
        let run_id = Uuid::new_v4();
        let result: JsonRoleResult<Sample> = call_json_role(
            &client,
            &ledger,
            &pricing,
            run_id,
            None,
            "stage2",
            "judge",
            "m1",
            "prompt",
            &serde_json::json!({}),
            None,
            None,
        )
        .await;
        assert!(result.is_valid());
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn invalid_then_valid_retries_once_with_same_call_id() {
        let (client, transport) =
            test_client(vec![r#"{"final_ranking":["a"]}"#, r#"{"final_ranking":["a"],"evaluations":[]}"#]);
        let ledger = Ledger::new();
        let pricing = PricingConfig {
            table: Default::default(),
            price_book_version: "v1".into(),
        };
        let run_id = Uuid::new_v4();
        let result: JsonRoleResult<Sample> = call_json_role(
            &client,
            &ledger,
            &pricing,
            run_id,
            None,
            "stage2",
            "judge",
            "m1",
            "prompt",
            &serde_json::json!({}),
            None,
            None,
        )
        .await;
        assert!(result.is_valid());
        assert_eq!(transport.calls.load(Ordering::SeqCst), 2);

        let events = ledger.usage_events_for_run(run_id);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].call_id, events[1].call_id);
        assert_eq!(events[0].attempt, 0);
        assert_eq!(events[1].attempt, 1);
    }

    #[tokio::test]
    async fn invalid_twice_returns_none() {
        let (client, _transport) = test_client(vec![r#"{"bad":1}"#, r#"{"still_bad":1}"#]);
        let ledger = Ledger::new();
        let pricing = PricingConfig {
            table: Default::default(),
            price_book_version: "v1".into(),
        };
        let result: JsonRoleResult<Sample> = call_json_role(
            &client,
            &ledger,
            &pricing,
            Uuid::new_v4(),
            None,
            "stage2",
            "judge",
            "m1",
            "prompt",
            &serde_json::json!({}),
            None,
            None,
        )
        .await;
        assert!(!result.is_valid());
        assert!(result.validation_error.is_some());
    }

    #[test]
    fn correction_prompt_embeds_schema_and_truncated_text() {
        let long_text = "x".repeat(20_000);
        let prompt = build_correction_prompt(&serde_json::json!({"a": 1}), &long_text, "missing field");
        assert!(prompt.contains("missing field"));
        assert!(prompt.contains("\"a\": 1"));
        assert!(prompt.len() < long_text.len() + 2000);
    }
}
