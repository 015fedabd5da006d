//! Input/output shapes for the two tool surfaces, `council.ask` and
//! `council.pipeline` (spec §6).

use crate::pipeline_schemas::{
    CodexPromptOutput, GateOutput, PipelineBudget, ReviewOutput, ScopeContract, SecurityOutput,
    TestPlanOutput,
};
use crate::records::UsageSummary;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Fast,
    #[default]
    Balanced,
    Deep,
}

impl Mode {
    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Fast => "fast",
            Mode::Balanced => "balanced",
            Mode::Deep => "deep",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BudgetInput {
    #[serde(default)]
    pub max_total_cost_usd: Option<f64>,
    #[serde(default)]
    pub max_total_tokens: Option<u64>,
}

impl From<BudgetInput> for PipelineBudget {
    fn from(b: BudgetInput) -> Self {
        PipelineBudget {
            max_total_cost_usd: b.max_total_cost_usd,
            max_total_tokens: b.max_total_tokens,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CouncilAskInput {
    pub prompt: String,
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub mode: Mode,
    #[serde(default)]
    pub budget: Option<BudgetInput>,
    #[serde(default)]
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregateRankingEntry {
    pub model: String,
    pub average_rank: f64,
    pub rankings_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CouncilAskMetadata {
    pub label_to_model: std::collections::HashMap<String, String>,
    pub aggregate_rankings: Vec<AggregateRankingEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CouncilAskOutput {
    pub final_answer: String,
    pub conversation_id: String,
    pub run_id: String,
    pub metadata: CouncilAskMetadata,
    pub usage_summary: UsageSummary,
    pub degraded: bool,
    pub errors: Vec<String>,
}

impl CouncilAskOutput {
    pub fn degraded_envelope(conversation_id: String, run_id: String, errors: Vec<String>) -> Self {
        Self {
            final_answer: String::new(),
            conversation_id,
            run_id,
            metadata: CouncilAskMetadata::default(),
            usage_summary: UsageSummary::empty(),
            degraded: true,
            errors,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoContextFile {
    pub path: String,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RepoContext {
    #[serde(default)]
    pub files: Vec<RepoContextFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CouncilPipelineInput {
    pub task_description: String,
    #[serde(default)]
    pub repo_context: Option<RepoContext>,
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub mode: Mode,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    #[serde(default)]
    pub budget: Option<BudgetInput>,
    #[serde(default)]
    pub api_key: Option<String>,
}

fn default_max_iterations() -> u32 {
    2
}

/// Clamps to `[1,4]` per spec §4.7 / §8 boundary (`10 -> 4`, `0 -> 1`).
pub fn clamp_max_iterations(v: i64) -> u32 {
    if v < 1 {
        1
    } else if v > 4 {
        4
    } else {
        v as u32
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CouncilPipelineAgentOutputs {
    #[serde(default)]
    pub leader: Option<ScopeContract>,
    #[serde(default)]
    pub reviewer: Option<ReviewOutput>,
    #[serde(default)]
    pub security: Option<SecurityOutput>,
    #[serde(default)]
    pub test_writer: Option<TestPlanOutput>,
    #[serde(default)]
    pub implementer: Option<CodexPromptOutput>,
    #[serde(default)]
    pub gate: Option<GateOutput>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum GateVerdict {
    Pass,
    Fail,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CouncilPipelineOutput {
    pub run_id: String,
    pub conversation_id: String,
    pub scope_contract: Option<ScopeContract>,
    pub agent_outputs: CouncilPipelineAgentOutputs,
    pub final_codex_prompt: Option<String>,
    pub gate_verdict: GateVerdict,
    pub degraded: bool,
    pub errors: Vec<String>,
    pub usage_summary: UsageSummary,
}

impl CouncilPipelineOutput {
    pub fn degraded_envelope(conversation_id: String, run_id: String, errors: Vec<String>) -> Self {
        Self {
            run_id,
            conversation_id,
            scope_contract: None,
            agent_outputs: CouncilPipelineAgentOutputs::default(),
            final_codex_prompt: None,
            gate_verdict: GateVerdict::Fail,
            degraded: true,
            errors,
            usage_summary: UsageSummary::empty(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamp_max_iterations_bounds() {
        assert_eq!(clamp_max_iterations(10), 4);
        assert_eq!(clamp_max_iterations(0), 1);
        assert_eq!(clamp_max_iterations(3), 3);
    }

    #[test]
    fn ask_input_defaults_mode_to_balanced() {
        let json = serde_json::json!({"prompt": "hi"});
        let input: CouncilAskInput = serde_json::from_value(json).unwrap();
        assert_eq!(input.mode, Mode::Balanced);
    }
}
