//! C3 — the append-only run ledger — and C4 — the budget gate, which is
//! serialized behind the same write lock so a usage record and its budget
//! check can never interleave with a concurrent stage's write (the
//! `db_lock` spec §5 names).
//!
//! Structurally grounded on the teacher's `runtime/runs.rs` `RunStore`
//! (in-memory store + append-only JSONL mirror for durability); the
//! write-serialization and strict-`>` budget comparison follow
//! `original_source/backend/src/services/runs.py` /
//! `.../engine/pipeline/runner.py::_check_budget` rather than the
//! teacher's unrelated `runtime/quota.rs` (a different, `>=`-based, daily
//! per-agent cap — not reused here).

use chrono::{DateTime, Datelike, TimeZone, Utc};
use parking_lot::Mutex;
use sa_domain::pipeline_schemas::PipelineBudget;
use sa_domain::records::{Run, RunStatus, RunStep, UsageEvent};
use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetFailure {
    TokenUsageMissing,
    MaxTotalTokens,
    CostEstimateMissing,
    MaxTotalCostUsd,
}

impl BudgetFailure {
    pub fn as_error_code(self) -> &'static str {
        match self {
            BudgetFailure::TokenUsageMissing => "token_usage_missing",
            BudgetFailure::MaxTotalTokens => "max_total_tokens",
            BudgetFailure::CostEstimateMissing => "cost_estimate_missing",
            BudgetFailure::MaxTotalCostUsd => "max_total_cost_usd",
        }
    }
}

struct LedgerState {
    runs: HashMap<Uuid, Run>,
    steps: Vec<RunStep>,
    usage: Vec<UsageEvent>,
}

/// The run ledger. All mutation goes through `write`, which holds the lock
/// for the duration of a single logical operation — this is the
/// process-wide `db_lock` spec §5 describes.
pub struct Ledger {
    state: Mutex<LedgerState>,
    log_path: Option<PathBuf>,
}

impl Ledger {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LedgerState {
                runs: HashMap::new(),
                steps: Vec::new(),
                usage: Vec::new(),
            }),
            log_path: None,
        }
    }

    /// Mirrors every write to an append-only JSONL file, matching the
    /// teacher's `RunStore` durability story. Best-effort: a write failure
    /// is logged, never propagated (persistence is a mirror, not the
    /// source of truth for a live process).
    pub fn with_log_file(mut self, path: PathBuf) -> Self {
        self.log_path = Some(path);
        self
    }

    fn append_log(&self, line: &serde_json::Value) {
        let Some(path) = &self.log_path else { return };
        let result = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .and_then(|mut f| writeln!(f, "{}", line));
        if let Err(e) = result {
            tracing::warn!(error = %e, "failed to append to run ledger log file");
        }
    }

    pub fn create_run(
        &self,
        conversation_id: Uuid,
        tool_name: impl Into<String>,
        owner_key_id: Option<String>,
        input_snapshot: serde_json::Value,
    ) -> Run {
        let run = Run::new(conversation_id, tool_name, owner_key_id, input_snapshot);
        let mut state = self.state.lock();
        state.runs.insert(run.id, run.clone());
        self.append_log(&serde_json::json!({"event": "run.created", "run": run}));
        run
    }

    /// One-shot: once a run has a terminal status, later calls are no-ops.
    pub fn end_run(&self, run_id: Uuid, status: RunStatus, latency_ms: u64) {
        let mut state = self.state.lock();
        if let Some(run) = state.runs.get_mut(&run_id) {
            if run.status.is_terminal() {
                return;
            }
            run.status = status;
            run.ended_at = Some(Utc::now());
            run.latency_ms = Some(latency_ms);
            let snapshot = run.clone();
            drop(state);
            self.append_log(&serde_json::json!({"event": "run.ended", "run": snapshot}));
        }
    }

    pub fn get_run(&self, run_id: Uuid) -> Option<Run> {
        self.state.lock().runs.get(&run_id).cloned()
    }

    pub fn add_run_step(&self, step: RunStep) {
        let mut state = self.state.lock();
        state.steps.push(step.clone());
        drop(state);
        self.append_log(&serde_json::json!({"event": "run_step.added", "step": step}));
    }

    /// Records a usage event and immediately runs the budget check (C4)
    /// under the same lock, so the `(i+1)`th call of a fan-out can never
    /// be issued before the `i`th call's usage has been both recorded and
    /// checked (spec §8 invariant).
    pub fn record_usage_and_check_budget(
        &self,
        event: UsageEvent,
        budget: Option<&PipelineBudget>,
    ) -> Option<BudgetFailure> {
        let mut state = self.state.lock();
        let run_id = event.run_id;
        state.usage.push(event.clone());
        self.append_log(&serde_json::json!({"event": "usage.recorded", "usage": event}));

        let Some(budget) = budget else { return None };
        let events: Vec<&UsageEvent> = state.usage.iter().filter(|e| e.run_id == run_id).collect();
        check_budget_locked(&events, budget)
    }

    pub fn sum_total_tokens(&self, run_id: Uuid) -> u64 {
        let state = self.state.lock();
        state
            .usage
            .iter()
            .filter(|e| e.run_id == run_id)
            .filter_map(|e| e.effective_total_tokens())
            .sum()
    }

    pub fn sum_cost(&self, run_id: Uuid) -> f64 {
        let state = self.state.lock();
        state
            .usage
            .iter()
            .filter(|e| e.run_id == run_id)
            .filter_map(|e| e.cost_estimated)
            .sum()
    }

    pub fn any_usage_missing(&self, run_id: Uuid) -> bool {
        let state = self.state.lock();
        state.usage.iter().any(|e| e.run_id == run_id && e.total_tokens.is_none() && e.effective_total_tokens().is_none())
    }

    pub fn any_cost_missing(&self, run_id: Uuid) -> bool {
        let state = self.state.lock();
        state.usage.iter().any(|e| e.run_id == run_id && e.cost_estimated.is_none())
    }

    pub fn usage_events_for_run(&self, run_id: Uuid) -> Vec<UsageEvent> {
        let state = self.state.lock();
        state.usage.iter().filter(|e| e.run_id == run_id).cloned().collect()
    }

    /// Sum of `total_tokens` across all runs for `owner_key_id` in the
    /// current UTC calendar month (`[first-of-month 00:00,
    /// first-of-next-month 00:00)`).
    pub fn monthly_tokens_used(&self, owner_key_id: &str) -> u64 {
        let now = Utc::now();
        let (start, end) = month_window(now);
        let state = self.state.lock();
        state
            .usage
            .iter()
            .filter(|e| e.owner_key_id.as_deref() == Some(owner_key_id))
            .filter(|e| e.created_at >= start && e.created_at < end)
            .filter_map(|e| e.effective_total_tokens())
            .sum()
    }
}

impl Default for Ledger {
    fn default() -> Self {
        Self::new()
    }
}

fn month_window(now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
    let start = Utc
        .with_ymd_and_hms(now.year(), now.month(), 1, 0, 0, 0)
        .single()
        .unwrap_or(now);
    let (next_year, next_month) = if now.month() == 12 { (now.year() + 1, 1) } else { (now.year(), now.month() + 1) };
    let end = Utc.with_ymd_and_hms(next_year, next_month, 1, 0, 0, 0).single().unwrap_or(now);
    (start, end)
}

/// C4 — strict-`>` budget comparison. `events` must already include the
/// just-recorded event.
fn check_budget_locked(events: &[&UsageEvent], budget: &PipelineBudget) -> Option<BudgetFailure> {
    if let Some(max_tokens) = budget.max_total_tokens {
        if events.iter().any(|e| e.total_tokens.is_none() && e.effective_total_tokens().is_none()) {
            return Some(BudgetFailure::TokenUsageMissing);
        }
        let sum: u64 = events.iter().filter_map(|e| e.effective_total_tokens()).sum();
        if sum > max_tokens {
            return Some(BudgetFailure::MaxTotalTokens);
        }
    }
    if let Some(max_cost) = budget.max_total_cost_usd {
        if events.iter().any(|e| e.cost_estimated.is_none()) {
            return Some(BudgetFailure::CostEstimateMissing);
        }
        let sum: f64 = events.iter().filter_map(|e| e.cost_estimated).sum();
        if sum > max_cost {
            return Some(BudgetFailure::MaxTotalCostUsd);
        }
    }
    None
}
