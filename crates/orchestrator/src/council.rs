//! C6 — the council engine: fan-out answers, peer judgement, chairman
//! synthesis, aggregate ranking, and conversation-title generation.
//! Grounded on `original_source/backend/src/engine/council.py` /
//! `council_runner.py`.

use crate::call_log::record_call;
use crate::json_role::call_json_role;
use sa_cache::{make_cache_key, CacheStore};
use sa_domain::config::PricingConfig;
use sa_domain::pipeline_schemas::{PipelineBudget, Stage2JudgeOutput};
use sa_domain::tool_io::AggregateRankingEntry;
use sa_ledger::Ledger;
use sa_providers::{CallOptions, ChatMessage, UpstreamClient};
use std::collections::HashMap;
use uuid::Uuid;

const MAX_VERIFICATION_STEPS: usize = 12;
const TITLE_TIMEOUT_SECONDS: f64 = 30.0;
const TITLE_MAX_CHARS: usize = 50;
const TITLE_TRUNCATE_AT: usize = 47;
const FALLBACK_TITLE: &str = "New Conversation";

pub struct Stage1Answer {
    pub model: String,
    pub content: String,
}

pub struct Stage2Judgement {
    pub model: String,
    pub valid: bool,
    pub parsed: Option<Stage2JudgeOutput>,
    pub raw_text: String,
}

pub struct Stage3Synthesis {
    pub model: String,
    pub response: String,
}

#[derive(Default)]
pub struct CouncilMetadata {
    pub label_to_model: HashMap<String, String>,
    pub aggregate_rankings: Vec<AggregateRankingEntry>,
}

pub struct CouncilOutcome {
    pub stage1: Vec<Stage1Answer>,
    pub stage2: Vec<Stage2Judgement>,
    pub stage3: Stage3Synthesis,
    pub metadata: CouncilMetadata,
    pub errors: Vec<String>,
    pub budget_exceeded: bool,
}

pub struct CouncilEngine<'a> {
    pub client: &'a UpstreamClient,
    pub ledger: &'a Ledger,
    pub cache: &'a CacheStore,
    pub pricing: &'a PricingConfig,
}

impl<'a> CouncilEngine<'a> {
    pub fn new(client: &'a UpstreamClient, ledger: &'a Ledger, cache: &'a CacheStore, pricing: &'a PricingConfig) -> Self {
        Self { client, ledger, cache, pricing }
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn run(
        &self,
        user_query: &str,
        run_id: Uuid,
        owner_key_id: Option<&str>,
        council_models: &[String],
        judge_models: &[String],
        chairman_model: &str,
        budget: Option<&PipelineBudget>,
        timeout_seconds: Option<f64>,
    ) -> CouncilOutcome {
        let mut errors = Vec::new();

        let (stage1, budget_exceeded) =
            self.run_stage1(user_query, run_id, owner_key_id, council_models, budget, timeout_seconds, &mut errors).await;

        if budget_exceeded {
            return CouncilOutcome {
                stage1,
                stage2: Vec::new(),
                stage3: Stage3Synthesis { model: chairman_model.to_string(), response: String::new() },
                metadata: CouncilMetadata::default(),
                errors,
                budget_exceeded: true,
            };
        }

        if stage1.is_empty() {
            return CouncilOutcome {
                stage1,
                stage2: Vec::new(),
                stage3: Stage3Synthesis {
                    model: chairman_model.to_string(),
                    response: "Error: Unable to generate final synthesis.".to_string(),
                },
                metadata: CouncilMetadata::default(),
                errors,
                budget_exceeded: false,
            };
        }

        let (stage2, budget_exceeded) =
            self.run_stage2(user_query, run_id, owner_key_id, &stage1, judge_models, budget, timeout_seconds, &mut errors).await;
        let metadata = Self::aggregate_ranking(&stage1, &stage2);

        if budget_exceeded {
            return CouncilOutcome {
                stage1,
                stage2,
                stage3: Stage3Synthesis { model: chairman_model.to_string(), response: String::new() },
                metadata,
                errors,
                budget_exceeded: true,
            };
        }

        let (stage3, budget_exceeded) = self
            .run_stage3(user_query, run_id, owner_key_id, &stage1, &stage2, chairman_model, budget, timeout_seconds, &mut errors)
            .await;

        CouncilOutcome { stage1, stage2, stage3, metadata, errors, budget_exceeded }
    }

    /// Stage 1 — fan-out answers. Concurrent by default, sequential when a
    /// budget is set so an over-budget call can abort the rest before it is
    /// issued (spec §5's fan-out-vs-budget law). Returns `true` as soon as a
    /// budget check fails, leaving any remaining models uncalled.
    async fn run_stage1(
        &self,
        user_query: &str,
        run_id: Uuid,
        owner_key_id: Option<&str>,
        council_models: &[String],
        budget: Option<&PipelineBudget>,
        timeout_seconds: Option<f64>,
        errors: &mut Vec<String>,
    ) -> (Vec<Stage1Answer>, bool) {
        let mut answers = Vec::new();
        if budget.is_some() {
            for model in council_models {
                let (outcome, budget_failure) =
                    self.stage1_one(user_query, run_id, owner_key_id, model, council_models, budget, timeout_seconds).await;
                match outcome {
                    Some(answer) => answers.push(answer),
                    None => errors.push(format!("stage1_model_failed:{model}")),
                }
                if budget_failure.is_some() {
                    errors.push("budget_exceeded".to_string());
                    return (answers, true);
                }
            }
        } else {
            let futures: Vec<_> = council_models
                .iter()
                .map(|model| self.stage1_one(user_query, run_id, owner_key_id, model, council_models, budget, timeout_seconds))
                .collect();
            let results = futures_util::future::join_all(futures).await;
            for (model, (outcome, _)) in council_models.iter().zip(results) {
                match outcome {
                    Some(answer) => answers.push(answer),
                    None => errors.push(format!("stage1_model_failed:{model}")),
                }
            }
        }
        (answers, false)
    }

    #[allow(clippy::too_many_arguments)]
    async fn stage1_one(
        &self,
        user_query: &str,
        run_id: Uuid,
        owner_key_id: Option<&str>,
        model: &str,
        council_models: &[String],
        budget: Option<&PipelineBudget>,
        timeout_seconds: Option<f64>,
    ) -> (Option<Stage1Answer>, Option<sa_ledger::BudgetFailure>) {
        let cache_key = make_cache_key(&serde_json::json!({
            "stage": "stage1",
            "model": model,
            "user_query": user_query,
            "council_models": council_models,
        }));
        if let Some(cached) = self.cache.get(&cache_key) {
            if let Some(content) = cached.as_str() {
                return (Some(Stage1Answer { model: model.to_string(), content: content.to_string() }), None);
            }
        }

        let opts = CallOptions { call_id: Uuid::new_v4(), attempt: 0, temperature: None, max_tokens: None, timeout_seconds };
        let result = self.client.call(model, &[ChatMessage::user(user_query)], opts).await;
        let output_json = serde_json::json!({"content": result.content});
        let budget_failure = record_call(self.ledger, self.pricing, run_id, owner_key_id, "stage1", "council", &result, output_json, budget);

        match result.content.as_deref() {
            Some(content) if !content.trim().is_empty() => {
                self.cache.set(cache_key, serde_json::json!(content), None);
                (Some(Stage1Answer { model: model.to_string(), content: content.to_string() }), budget_failure)
            }
            _ => (None, budget_failure),
        }
    }

    /// Stage 2 — peer judgement. Labels answers `Response A`, `Response B`,
    /// ... in input order, builds the single shared judge prompt, then runs
    /// each judge through C5.
    #[allow(clippy::too_many_arguments)]
    async fn run_stage2(
        &self,
        user_query: &str,
        run_id: Uuid,
        owner_key_id: Option<&str>,
        stage1: &[Stage1Answer],
        judge_models: &[String],
        budget: Option<&PipelineBudget>,
        timeout_seconds: Option<f64>,
        errors: &mut Vec<String>,
    ) -> (Vec<Stage2Judgement>, bool) {
        let prompt = build_stage2_prompt(stage1);
        let schema_example = stage2_schema_example();

        let mut judgements = Vec::new();
        if budget.is_some() {
            for judge in judge_models {
                let (j, budget_failure) =
                    self.stage2_one(run_id, owner_key_id, judge, user_query, &prompt, &schema_example, budget, timeout_seconds).await;
                if !j.valid {
                    errors.push(format!("stage2_invalid_json:{judge}"));
                }
                judgements.push(j);
                if budget_failure.is_some() {
                    errors.push("budget_exceeded".to_string());
                    return (judgements, true);
                }
            }
        } else {
            let futures: Vec<_> = judge_models
                .iter()
                .map(|judge| self.stage2_one(run_id, owner_key_id, judge, user_query, &prompt, &schema_example, budget, timeout_seconds))
                .collect();
            let results = futures_util::future::join_all(futures).await;
            for (judge, (j, _)) in judge_models.iter().zip(results) {
                if !j.valid {
                    errors.push(format!("stage2_invalid_json:{judge}"));
                }
                judgements.push(j);
            }
        }
        (judgements, false)
    }

    #[allow(clippy::too_many_arguments)]
    async fn stage2_one(
        &self,
        run_id: Uuid,
        owner_key_id: Option<&str>,
        judge_model: &str,
        user_query: &str,
        prompt: &str,
        schema_example: &serde_json::Value,
        budget: Option<&PipelineBudget>,
        timeout_seconds: Option<f64>,
    ) -> (Stage2Judgement, Option<sa_ledger::BudgetFailure>) {
        let cache_key = make_cache_key(&serde_json::json!({
            "stage": "stage2",
            "model": judge_model,
            "user_query": user_query,
            "prompt": prompt,
        }));
        if let Some(cached) = self.cache.get(&cache_key) {
            if let Ok(parsed) = serde_json::from_value::<Stage2JudgeOutput>(cached.clone()) {
                return (
                    Stage2Judgement {
                        model: judge_model.to_string(),
                        valid: true,
                        raw_text: cached.to_string(),
                        parsed: Some(parsed),
                    },
                    None,
                );
            }
        }

        let result = call_json_role::<Stage2JudgeOutput>(
            self.client,
            self.ledger,
            self.pricing,
            run_id,
            owner_key_id,
            "stage2",
            "judge",
            judge_model,
            prompt,
            schema_example,
            budget,
            timeout_seconds,
        )
        .await;

        if let Some(parsed) = &result.parsed {
            if let Ok(value) = serde_json::to_value(parsed) {
                self.cache.set(cache_key, value, None);
            }
        }

        let budget_failure = result.budget_failure;
        (
            Stage2Judgement {
                model: judge_model.to_string(),
                valid: result.is_valid(),
                parsed: result.parsed,
                raw_text: result.final_raw_text,
            },
            budget_failure,
        )
    }

    /// Considers only `valid==true` judgements with a non-empty
    /// `final_ranking`. For each model appearing at 1-indexed position `p`
    /// in a ranking, accumulates `p`; output sorted ascending by average
    /// rank. Labels missing from `label_to_model` are ignored.
    fn aggregate_ranking(stage1: &[Stage1Answer], stage2: &[Stage2Judgement]) -> CouncilMetadata {
        let mut label_to_model = HashMap::new();
        for (i, answer) in stage1.iter().enumerate() {
            label_to_model.insert(label_for_index(i), answer.model.clone());
        }

        let mut ranks: HashMap<String, Vec<u32>> = HashMap::new();
        for judgement in stage2 {
            if !judgement.valid {
                continue;
            }
            let Some(parsed) = &judgement.parsed else { continue };
            if parsed.final_ranking.is_empty() {
                continue;
            }
            for (i, label) in parsed.final_ranking.iter().enumerate() {
                if let Some(model) = label_to_model.get(label) {
                    ranks.entry(model.clone()).or_default().push((i + 1) as u32);
                }
            }
        }

        let mut aggregate_rankings: Vec<AggregateRankingEntry> = ranks
            .into_iter()
            .map(|(model, positions)| {
                let rankings_count = positions.len() as u32;
                let average_rank = positions.iter().sum::<u32>() as f64 / rankings_count as f64;
                AggregateRankingEntry { model, average_rank, rankings_count }
            })
            .collect();
        aggregate_rankings.sort_by(|a, b| a.average_rank.partial_cmp(&b.average_rank).unwrap());

        CouncilMetadata { label_to_model, aggregate_rankings }
    }

    /// Stage 3 — synthesis. Concatenates labeled stage-1 answers, labeled
    /// stage-2 raw rankings, and up to 12 de-duplicated verification steps
    /// in first-seen order, then calls the chairman with no schema.
    #[allow(clippy::too_many_arguments)]
    async fn run_stage3(
        &self,
        user_query: &str,
        run_id: Uuid,
        owner_key_id: Option<&str>,
        stage1: &[Stage1Answer],
        stage2: &[Stage2Judgement],
        chairman_model: &str,
        budget: Option<&PipelineBudget>,
        timeout_seconds: Option<f64>,
        errors: &mut Vec<String>,
    ) -> (Stage3Synthesis, bool) {
        let prompt = build_stage3_prompt(user_query, stage1, stage2);
        let opts = CallOptions { call_id: Uuid::new_v4(), attempt: 0, temperature: None, max_tokens: None, timeout_seconds };
        let result = self.client.call(chairman_model, &[ChatMessage::user(&prompt)], opts).await;
        let output_json = serde_json::json!({"content": result.content});
        let budget_failure = record_call(self.ledger, self.pricing, run_id, owner_key_id, "stage3", "chairman", &result, output_json, budget);

        if budget_failure.is_some() {
            errors.push("budget_exceeded".to_string());
            return (Stage3Synthesis { model: chairman_model.to_string(), response: String::new() }, true);
        }

        let synthesis = match result.content.as_deref() {
            Some(content) if !content.trim().is_empty() => {
                Stage3Synthesis { model: chairman_model.to_string(), response: content.to_string() }
            }
            _ => {
                errors.push("chairman_failed".to_string());
                Stage3Synthesis {
                    model: chairman_model.to_string(),
                    response: "Error: Unable to generate final synthesis.".to_string(),
                }
            }
        };
        (synthesis, false)
    }

    /// Conversation-title generation: only invoked by the caller when the
    /// conversation has no prior messages (decided before stage 1 starts,
    /// not raced against it — spec.md §9's open-question resolution).
    pub async fn generate_title(&self, title_model: &str, user_query: &str, run_id: Uuid, owner_key_id: Option<&str>) -> String {
        let prompt = format!(
            "Generate a concise 3-5 word title for this conversation based on the user's first message. \
             Respond with the title only, no quotes or punctuation at the end.\n\nMessage: {user_query}"
        );
        let opts = CallOptions {
            call_id: Uuid::new_v4(),
            attempt: 0,
            temperature: None,
            max_tokens: None,
            timeout_seconds: Some(TITLE_TIMEOUT_SECONDS),
        };
        let result = self.client.call(title_model, &[ChatMessage::user(&prompt)], opts).await;
        let output_json = serde_json::json!({"content": result.content});
        record_call(self.ledger, self.pricing, run_id, owner_key_id, "title", "title", &result, output_json, None);

        match result.content.as_deref() {
            Some(content) if !content.trim().is_empty() => format_title(content),
            _ => FALLBACK_TITLE.to_string(),
        }
    }
}

fn format_title(raw: &str) -> String {
    let trimmed = raw.trim().trim_matches(|c| c == '"' || c == '\'');
    if trimmed.chars().count() <= TITLE_MAX_CHARS {
        trimmed.to_string()
    } else {
        let truncated: String = trimmed.chars().take(TITLE_TRUNCATE_AT).collect();
        format!("{truncated}...")
    }
}

fn label_for_index(i: usize) -> String {
    let letter = (b'A' + (i as u8)) as char;
    format!("Response {letter}")
}

fn build_stage2_prompt(stage1: &[Stage1Answer]) -> String {
    let mut sections = Vec::new();
    for (i, answer) in stage1.iter().enumerate() {
        sections.push(format!("{}:\n{}", label_for_index(i), answer.content));
    }
    let schema = serde_json::to_string_pretty(&stage2_schema_example()).unwrap_or_default();
    format!(
        "You are judging the following candidate answers to a user's question. \
         Evaluate each response's strengths and weaknesses, then rank them from best to worst.\n\n\
         {}\n\n\
         Respond with JSON matching exactly this schema:\n{schema}",
        sections.join("\n\n")
    )
}

fn stage2_schema_example() -> serde_json::Value {
    serde_json::json!({
        "evaluations": [{"label": "Response A", "pros": ["..."], "cons": ["..."]}],
        "final_ranking": ["Response A"],
        "failure_modes_top1": ["..."],
        "verification_steps": ["..."]
    })
}

fn build_stage3_prompt(user_query: &str, stage1: &[Stage1Answer], stage2: &[Stage2Judgement]) -> String {
    let mut parts = vec![format!("User question:\n{user_query}")];

    for answer in stage1 {
        parts.push(format!("Answer from {}:\n{}", answer.model, answer.content));
    }

    for judgement in stage2 {
        if judgement.valid {
            parts.push(format!("Ranking from {}:\n{}", judgement.model, judgement.raw_text));
        }
    }

    let mut seen = std::collections::HashSet::new();
    let mut verification_steps = Vec::new();
    for judgement in stage2 {
        let Some(parsed) = &judgement.parsed else { continue };
        if !judgement.valid {
            continue;
        }
        for step in &parsed.verification_steps {
            if verification_steps.len() >= MAX_VERIFICATION_STEPS {
                break;
            }
            if seen.insert(step.clone()) {
                verification_steps.push(step.clone());
            }
        }
    }
    if !verification_steps.is_empty() {
        parts.push(format!("Verification steps to consider:\n- {}", verification_steps.join("\n- ")));
    }

    parts.push(
        "Synthesize a single best final answer to the user's question, drawing on the strongest \
         points from the candidate answers and their peer rankings."
            .to_string(),
    );
    parts.join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use sa_domain::config::UpstreamConfig;
    use sa_providers::{Transport, TransportError, TransportResponse};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex as StdMutex};

    struct ScriptedTransport {
        calls: AtomicUsize,
        bodies: StdMutex<Vec<serde_json::Value>>,
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
            let mut guard = self.bodies.lock().unwrap();
            let content = guard.remove(0);
            Ok(TransportResponse {
                status: 200,
                body: serde_json::json!({"choices": [{"message": {"content": content}}], "usage": {"prompt_tokens":1,"completion_tokens":1,"total_tokens":2}}),
            })
        }
    }

    fn engine_parts(bodies: Vec<serde_json::Value>) -> (UpstreamClient, Ledger, CacheStore, PricingConfig) {
        let transport = Arc::new(ScriptedTransport { calls: AtomicUsize::new(0), bodies: StdMutex::new(bodies) });
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
        let client = UpstreamClient::with_transport(config, transport);
        (client, Ledger::new(), CacheStore::new(true, None), PricingConfig { table: Default::default(), price_book_version: "v1".into() })
    }

    #[tokio::test]
    async fn happy_council_path_produces_final_answer_and_aggregate_ranking() {
        let (client, ledger, cache, pricing) = engine_parts(vec![
            serde_json::json!("ok"),
            serde_json::json!(r#"{"evaluations":[{"label":"Response A","pros":[],"cons":[]}],"final_ranking":["Response A"],"failure_modes_top1":[],"verification_steps":[]}"#),
            serde_json::json!("final"),
        ]);
        let engine = CouncilEngine::new(&client, &ledger, &cache, &pricing);
        let run_id = Uuid::new_v4();
        let outcome = engine
            .run("question", run_id, None, &["m1".to_string()], &["j1".to_string()], "c1", None, None)
            .await;
        assert_eq!(outcome.stage3.response, "final");
        assert!(outcome.errors.is_empty());
        assert_eq!(outcome.metadata.aggregate_rankings.len(), 1);
        assert_eq!(outcome.metadata.aggregate_rankings[0].model, "m1");
        assert!((outcome.metadata.aggregate_rankings[0].average_rank - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn title_is_stripped_of_quotes_and_truncated() {
        assert_eq!(format_title("\"Short Title\""), "Short Title");
        let long = "x".repeat(60);
        let formatted = format_title(&long);
        assert_eq!(formatted.chars().count(), TITLE_TRUNCATE_AT + 3);
        assert!(formatted.ends_with("..."));
    }

    #[test]
    fn label_for_index_matches_spec_sequence() {
        assert_eq!(label_for_index(0), "Response A");
        assert_eq!(label_for_index(1), "Response B");
    }

    #[test]
    fn aggregate_ranking_ignores_invalid_and_empty_rankings() {
        let stage1 = vec![
            Stage1Answer { model: "m1".into(), content: "a".into() },
            Stage1Answer { model: "m2".into(), content: "b".into() },
        ];
        let stage2 = vec![
            Stage2Judgement {
                model: "j1".into(),
                valid: true,
                parsed: Some(Stage2JudgeOutput {
                    evaluations: vec![],
                    final_ranking: vec!["Response B".into(), "Response A".into()],
                    failure_modes_top1: vec![],
                    verification_steps: vec![],
                }),
                raw_text: String::new(),
            },
            Stage2Judgement { model: "j2".into(), valid: false, parsed: None, raw_text: String::new() },
        ];
        let metadata = CouncilEngine::aggregate_ranking(&stage1, &stage2);
        assert_eq!(metadata.aggregate_rankings.len(), 2);
        assert_eq!(metadata.aggregate_rankings[0].model, "m2");
        assert_eq!(metadata.aggregate_rankings[0].rankings_count, 1);
    }
}
