//! Schema-bound agent outputs for the pipeline engine (C7).
//!
//! Field-for-field carried over from the council's original Python
//! `pipeline/schemas.py`; `extra=forbid` there becomes
//! `#[serde(deny_unknown_fields)]` here, and a missing-but-defaulted list
//! becomes `#[serde(default)]`.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    High,
    Med,
    Low,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct PipelineBudget {
    #[serde(default)]
    pub max_total_cost_usd: Option<f64>,
    #[serde(default)]
    pub max_total_tokens: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TestsPolicy {
    pub required: bool,
    #[serde(default)]
    pub reasons: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentToInvoke {
    Reviewer,
    Security,
    TestWriter,
    Implementer,
    Gate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScopeContract {
    pub task_summary: String,
    #[serde(default)]
    pub in_scope: Vec<String>,
    #[serde(default)]
    pub out_of_scope: Vec<String>,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    #[serde(default)]
    pub agents_to_invoke: Vec<AgentToInvoke>,
    pub tests_policy: TestsPolicy,
    #[serde(default)]
    pub constraints: Vec<String>,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    #[serde(default)]
    pub budget: Option<PipelineBudget>,
}

fn default_max_iterations() -> u32 {
    2
}

impl ScopeContract {
    pub fn invokes(&self, agent: AgentToInvoke) -> bool {
        self.agents_to_invoke.contains(&agent)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReviewIssue {
    pub severity: Severity,
    pub file: String,
    pub issue: String,
    pub why: String,
    pub suggested_fix: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Verdict {
    Pass,
    Fail,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReviewOutput {
    pub verdict: Verdict,
    #[serde(default)]
    pub issues: Vec<ReviewIssue>,
    #[serde(default)]
    pub missed_requirements: Vec<String>,
    #[serde(default)]
    pub risks: Vec<String>,
    #[serde(default)]
    pub tests_recommended: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreatArea {
    Auth,
    Db,
    Logging,
    Network,
    Deps,
    SupplyChain,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SecurityThreat {
    pub severity: Severity,
    pub area: ThreatArea,
    pub description: String,
    pub mitigation: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SecurityOutput {
    pub verdict: Verdict,
    #[serde(default)]
    pub threats: Vec<SecurityThreat>,
    #[serde(default)]
    pub required_security_controls: Vec<String>,
    #[serde(default)]
    pub tests_required: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestType {
    Unit,
    Integration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TestToAdd {
    #[serde(rename = "type")]
    pub kind: TestType,
    pub target: String,
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub cases: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TestPlanOutput {
    #[serde(default)]
    pub tests_to_add: Vec<TestToAdd>,
    #[serde(default)]
    pub commands: Vec<String>,
    #[serde(default)]
    pub notes: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CodexPromptOutput {
    pub final_codex_prompt: String,
    #[serde(default)]
    pub patch_scope: Vec<String>,
    #[serde(default)]
    pub do_not_change: Vec<String>,
    #[serde(default)]
    pub run_commands: Vec<String>,
    #[serde(default)]
    pub rollback_plan: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MustFixItem {
    pub severity: Severity,
    pub file: String,
    pub issue: String,
    pub suggested_fix: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AcceptanceCriterionMet {
    pub criterion: String,
    pub met: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GateOutput {
    pub verdict: Verdict,
    #[serde(default)]
    pub must_fix: Vec<MustFixItem>,
    #[serde(default)]
    pub acceptance_criteria_met: Vec<AcceptanceCriterionMet>,
    pub tests_required: bool,
}

impl GateOutput {
    /// Builds the synthesized `GateOutput` for a deterministic
    /// scope-violation termination (C7 step 5): no gate model is called.
    pub fn synthesized_scope_violation(must_fix: Vec<MustFixItem>) -> Self {
        Self {
            verdict: Verdict::Fail,
            must_fix,
            acceptance_criteria_met: Vec::new(),
            tests_required: false,
        }
    }
}

/// Stage-2 council judge output (C6), `extra=forbid` in the original.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Stage2JudgeOutput {
    pub evaluations: Vec<Stage2Evaluation>,
    pub final_ranking: Vec<String>,
    #[serde(default)]
    pub failure_modes_top1: Vec<String>,
    #[serde(default)]
    pub verification_steps: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Stage2Evaluation {
    pub label: String,
    #[serde(default)]
    pub pros: Vec<String>,
    #[serde(default)]
    pub cons: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_field_is_rejected() {
        let json = serde_json::json!({
            "verdict": "PASS",
            "must_fix": [],
            "acceptance_criteria_met": [],
            "tests_required": false,
            "unexpected": "nope"
        });
        let err = serde_json::from_value::<GateOutput>(json).unwrap_err();
        assert!(err.to_string().contains("unknown field"));
    }

    #[test]
    fn scope_contract_defaults_max_iterations_to_two() {
        let json = serde_json::json!({
            "task_summary": "do the thing",
            "tests_policy": {"required": false}
        });
        let contract: ScopeContract = serde_json::from_value(json).unwrap();
        assert_eq!(contract.max_iterations, 2);
        assert!(contract.in_scope.is_empty());
    }

    #[test]
    fn agent_to_invoke_round_trips_snake_case() {
        let json = serde_json::json!(["reviewer", "test_writer"]);
        let agents: Vec<AgentToInvoke> = serde_json::from_value(json).unwrap();
        assert_eq!(agents, vec![AgentToInvoke::Reviewer, AgentToInvoke::TestWriter]);
    }
}
