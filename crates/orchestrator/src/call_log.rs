//! Shared usage-recording path used by both the JSON-role caller (C5) and
//! the engines' plain (non-schema-bound) calls: stage-1 answers and the
//! chairman synthesis in C6, the leader/reviewer/security/etc. calls in C7.
//!
//! Centralizing this keeps the ordering invariant in one place: usage is
//! recorded, the run step is appended, and the budget check runs, all
//! under the ledger's single write lock (spec §5's `UsageEvent` for
//! attempt N precedes the budget check for attempt N).

use sa_domain::config::PricingConfig;
use sa_domain::pipeline_schemas::PipelineBudget;
use sa_domain::records::{RunStep, StepType, UsageEvent};
use sa_ledger::{BudgetFailure, Ledger};
use sa_providers::UpstreamResult;

pub fn parse_usage_tokens(usage: Option<&serde_json::Value>) -> (Option<u64>, Option<u64>, Option<u64>) {
    let Some(usage) = usage else { return (None, None, None) };
    let p = usage.get("prompt_tokens").and_then(|v| v.as_u64());
    let c = usage.get("completion_tokens").and_then(|v| v.as_u64());
    let t = usage.get("total_tokens").and_then(|v| v.as_u64());
    (p, c, t)
}

pub fn build_usage_event(
    pricing: &PricingConfig,
    run_id: uuid::Uuid,
    owner_key_id: Option<&str>,
    result: &UpstreamResult,
) -> UsageEvent {
    let (prompt_tokens, completion_tokens, total_tokens) = parse_usage_tokens(result.usage.as_ref());
    let usage_missing = !result.ok || result.usage.is_none();
    let cost_estimated = match (prompt_tokens, completion_tokens) {
        (Some(p), Some(c)) => pricing.estimate_cost(&result.model, p, c),
        _ => None,
    };
    let raw_usage_json = result.usage.clone().map(|mut v| {
        if let Some(obj) = v.as_object_mut() {
            obj.insert("price_book_version".to_string(), serde_json::json!(pricing.price_book_version));
        }
        v
    });

    UsageEvent {
        run_id,
        owner_key_id: owner_key_id.map(|s| s.to_string()),
        model: result.model.clone(),
        call_id: result.call_id,
        attempt: result.attempt,
        prompt_tokens,
        completion_tokens,
        total_tokens,
        cost_estimated,
        latency_ms: result.latency_ms,
        raw_usage_json,
        usage_missing,
        created_at: chrono::Utc::now(),
    }
}

/// Records the usage event, appends the run step with `output_json` as
/// given by the caller (shape differs between the JSON-role path and a
/// plain-text call), then runs the budget check — all atomically from the
/// ledger's point of view.
#[allow(clippy::too_many_arguments)]
pub fn record_call(
    ledger: &Ledger,
    pricing: &PricingConfig,
    run_id: uuid::Uuid,
    owner_key_id: Option<&str>,
    stage_name: &str,
    agent_role: &str,
    result: &UpstreamResult,
    output_json: serde_json::Value,
    budget: Option<&PipelineBudget>,
) -> Option<BudgetFailure> {
    let event = build_usage_event(pricing, run_id, owner_key_id, result);
    let step = RunStep::new(
        run_id,
        stage_name,
        StepType::LlmCall,
        agent_role,
        result.model.clone(),
        event.attempt,
        output_json,
        result.latency_ms,
        result.error_text.clone(),
    );
    ledger.add_run_step(step);
    ledger.record_usage_and_check_budget(event, budget)
}
