//! Ledger-owned records: runs, per-call steps, and usage events.
//!
//! These are plain data types; `sa-ledger` is the only crate that mutates
//! them. Keeping them here (rather than in the ledger crate) lets the
//! orchestrator and gateway crates share the same shapes without a cyclic
//! dependency.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Succeeded,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Succeeded | RunStatus::Failed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub tool_name: String,
    pub owner_key_id: Option<String>,
    pub input_snapshot: serde_json::Value,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub latency_ms: Option<u64>,
}

impl Run {
    pub fn new(
        conversation_id: Uuid,
        tool_name: impl Into<String>,
        owner_key_id: Option<String>,
        input_snapshot: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            conversation_id,
            tool_name: tool_name.into(),
            owner_key_id,
            input_snapshot,
            status: RunStatus::Running,
            created_at: Utc::now(),
            ended_at: None,
            latency_ms: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    LlmCall,
    DeterministicGate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunStep {
    pub run_id: Uuid,
    pub stage_name: String,
    pub step_type: StepType,
    pub agent_role: String,
    pub model: String,
    pub attempt: u32,
    pub is_retry: bool,
    pub output_json: serde_json::Value,
    pub latency_ms: Option<u64>,
    pub error_text: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl RunStep {
    /// Enforces `is_retry ⇔ attempt > 0` at construction time so every
    /// call site gets the invariant for free.
    pub fn new(
        run_id: Uuid,
        stage_name: impl Into<String>,
        step_type: StepType,
        agent_role: impl Into<String>,
        model: impl Into<String>,
        attempt: u32,
        output_json: serde_json::Value,
        latency_ms: Option<u64>,
        error_text: Option<String>,
    ) -> Self {
        Self {
            run_id,
            stage_name: stage_name.into(),
            step_type,
            agent_role: agent_role.into(),
            model: model.into(),
            attempt,
            is_retry: attempt > 0,
            output_json,
            latency_ms,
            error_text,
            created_at: Utc::now(),
        }
    }
}

/// Caps a string field to `limit` bytes so `RunStep.output_json` never
/// grows unbounded on pathological model output.
pub fn truncate_to_bytes(s: &str, limit: usize) -> String {
    if s.len() <= limit {
        return s.to_string();
    }
    let mut end = limit;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

pub const RUN_STEP_STRING_LIMIT: usize = 20 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageEvent {
    pub run_id: Uuid,
    pub owner_key_id: Option<String>,
    pub model: String,
    pub call_id: Uuid,
    pub attempt: u32,
    pub prompt_tokens: Option<u64>,
    pub completion_tokens: Option<u64>,
    pub total_tokens: Option<u64>,
    pub cost_estimated: Option<f64>,
    pub latency_ms: Option<u64>,
    pub raw_usage_json: Option<serde_json::Value>,
    pub usage_missing: bool,
    pub created_at: DateTime<Utc>,
}

impl UsageEvent {
    /// `coalesce(total, coalesce(prompt,0)+coalesce(completion,0))`.
    pub fn effective_total_tokens(&self) -> Option<u64> {
        self.total_tokens.or_else(|| {
            if self.prompt_tokens.is_none() && self.completion_tokens.is_none() {
                None
            } else {
                Some(self.prompt_tokens.unwrap_or(0) + self.completion_tokens.unwrap_or(0))
            }
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub value_json: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: Uuid,
    pub owner_key_id: String,
    pub account_root_id: String,
    pub title: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub role: MessageRole,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKey {
    pub id: String,
    pub account_id: Option<String>,
    pub is_active: bool,
    pub deactivated_at: Option<DateTime<Utc>>,
    pub rate_limit_per_min: u32,
    pub monthly_token_cap: Option<u64>,
}

impl ApiKey {
    /// The root of the account this key belongs to: itself if it has no
    /// parent `account_id`.
    pub fn account_root_id(&self) -> &str {
        self.account_id.as_deref().unwrap_or(&self.id)
    }
}

/// One entry in a `usage_summary.by_model` list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageByModel {
    pub model: String,
    pub attempts: u32,
    pub prompt_tokens: Option<u64>,
    pub completion_tokens: Option<u64>,
    pub total_tokens: Option<u64>,
    pub cost_estimated: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageSummary {
    pub total_prompt_tokens: Option<u64>,
    pub total_completion_tokens: Option<u64>,
    pub total_tokens: Option<u64>,
    pub total_cost_estimated: Option<f64>,
    pub by_model: Vec<UsageByModel>,
}

impl UsageSummary {
    pub fn empty() -> Self {
        Self {
            total_prompt_tokens: None,
            total_completion_tokens: None,
            total_tokens: None,
            total_cost_estimated: None,
            by_model: Vec::new(),
        }
    }

    /// Aggregates a run's `UsageEvent`s into the output shape. Sums are
    /// `None` unless at least one contributing event reports that field.
    pub fn from_events(events: &[UsageEvent]) -> Self {
        let mut by_model: HashMap<String, (u32, Option<u64>, Option<u64>, Option<u64>, Option<f64>)> =
            HashMap::new();
        for e in events {
            let entry = by_model.entry(e.model.clone()).or_insert((0, None, None, None, None));
            entry.0 += 1;
            if let Some(p) = e.prompt_tokens {
                entry.1 = Some(entry.1.unwrap_or(0) + p);
            }
            if let Some(c) = e.completion_tokens {
                entry.2 = Some(entry.2.unwrap_or(0) + c);
            }
            if let Some(t) = e.effective_total_tokens() {
                entry.3 = Some(entry.3.unwrap_or(0) + t);
            }
            if let Some(c) = e.cost_estimated {
                entry.4 = Some(entry.4.unwrap_or(0.0) + c);
            }
        }
        let mut total_prompt = None;
        let mut total_completion = None;
        let mut total_tokens = None;
        let mut total_cost = None;
        let mut models: Vec<UsageByModel> = Vec::new();
        let mut keys: Vec<&String> = by_model.keys().collect();
        keys.sort();
        for model in keys {
            let (attempts, p, c, t, cost) = by_model[model];
            if let Some(p) = p {
                total_prompt = Some(total_prompt.unwrap_or(0) + p);
            }
            if let Some(c) = c {
                total_completion = Some(total_completion.unwrap_or(0) + c);
            }
            if let Some(t) = t {
                total_tokens = Some(total_tokens.unwrap_or(0) + t);
            }
            if let Some(cost) = cost {
                total_cost = Some(total_cost.unwrap_or(0.0) + cost);
            }
            models.push(UsageByModel {
                model: model.clone(),
                attempts,
                prompt_tokens: p,
                completion_tokens: c,
                total_tokens: t,
                cost_estimated: cost,
            });
        }
        Self {
            total_prompt_tokens: total_prompt,
            total_completion_tokens: total_completion,
            total_tokens,
            total_cost_estimated: total_cost,
            by_model: models,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_step_is_retry_matches_attempt() {
        let step = RunStep::new(
            Uuid::new_v4(),
            "stage1",
            StepType::LlmCall,
            "council",
            "m1",
            0,
            serde_json::json!({}),
            Some(10),
            None,
        );
        assert!(!step.is_retry);

        let retry = RunStep::new(
            Uuid::new_v4(),
            "stage1",
            StepType::LlmCall,
            "council",
            "m1",
            1,
            serde_json::json!({}),
            Some(10),
            None,
        );
        assert!(retry.is_retry);
    }

    #[test]
    fn effective_total_tokens_falls_back_to_sum() {
        let base = UsageEvent {
            run_id: Uuid::new_v4(),
            owner_key_id: None,
            model: "m1".into(),
            call_id: Uuid::new_v4(),
            attempt: 0,
            prompt_tokens: Some(3),
            completion_tokens: Some(4),
            total_tokens: None,
            cost_estimated: None,
            latency_ms: None,
            raw_usage_json: None,
            usage_missing: false,
            created_at: Utc::now(),
        };
        assert_eq!(base.effective_total_tokens(), Some(7));

        let mut with_total = base.clone();
        with_total.total_tokens = Some(100);
        assert_eq!(with_total.effective_total_tokens(), Some(100));

        let mut missing = base.clone();
        missing.prompt_tokens = None;
        missing.completion_tokens = None;
        assert_eq!(missing.effective_total_tokens(), None);
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        let s = "héllo";
        let truncated = truncate_to_bytes(s, 2);
        assert!(&s.as_bytes()[..truncated.len()] == truncated.as_bytes());
    }

    #[test]
    fn usage_summary_aggregates_by_model() {
        let run_id = Uuid::new_v4();
        let events = vec![
            UsageEvent {
                run_id,
                owner_key_id: None,
                model: "m1".into(),
                call_id: Uuid::new_v4(),
                attempt: 0,
                prompt_tokens: Some(1),
                completion_tokens: Some(1),
                total_tokens: Some(2),
                cost_estimated: Some(0.1),
                latency_ms: Some(5),
                raw_usage_json: None,
                usage_missing: false,
                created_at: Utc::now(),
            },
            UsageEvent {
                run_id,
                owner_key_id: None,
                model: "m1".into(),
                call_id: Uuid::new_v4(),
                attempt: 0,
                prompt_tokens: Some(2),
                completion_tokens: Some(2),
                total_tokens: Some(4),
                cost_estimated: Some(0.2),
                latency_ms: Some(5),
                raw_usage_json: None,
                usage_missing: false,
                created_at: Utc::now(),
            },
        ];
        let summary = UsageSummary::from_events(&events);
        assert_eq!(summary.total_tokens, Some(6));
        assert_eq!(summary.by_model.len(), 1);
        assert_eq!(summary.by_model[0].attempts, 2);
    }
}
