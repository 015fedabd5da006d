//! The outermost HTTP shell. Full router/SSE wiring is out of scope (spec
//! §1); this exists only so the binary is runnable end-to-end, the way the
//! teacher's `gateway` crate is a thin shell around its domain crates.

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use sa_domain::pipeline_schemas::PipelineBudget;
use sa_domain::records::UsageSummary;
use sa_domain::tool_io::{
    clamp_max_iterations, CouncilAskInput, CouncilAskMetadata, CouncilAskOutput, CouncilPipelineInput, CouncilPipelineOutput, GateVerdict, Mode,
};
use sa_orchestrator::{
    resolve_pipeline_models, ConversationStore, CouncilEngine, PipelineEngine, RunSlot, ToolError,
    ToolSurface,
};
use uuid::Uuid;

use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/council/ask", post(council_ask))
        .route("/v1/council/pipeline", post(council_pipeline))
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

fn chair_for(models: &sa_domain::config::ModelsConfig, mode: Mode) -> String {
    match mode {
        Mode::Fast => models.chair_fast.clone(),
        Mode::Deep => models.chair_deep.clone(),
        Mode::Balanced => models.chair_balanced.clone(),
    }
    .unwrap_or_else(|| models.chairman_model.clone())
}

async fn council_ask(State(state): State<AppState>, Json(input): Json<CouncilAskInput>) -> Json<CouncilAskOutput> {
    let Some(resolved) = input.api_key.as_deref().and_then(|k| state.api_keys.resolve(k)) else {
        return Json(CouncilAskOutput::degraded_envelope(
            input.conversation_id.clone().unwrap_or_default(),
            Uuid::new_v4().to_string(),
            vec!["invalid_api_key".to_string()],
        ));
    };

    let conversation = match &input.conversation_id {
        Some(raw) => {
            let found =
                Uuid::parse_str(raw).ok().and_then(|id| state.conversations.get_conversation(&resolved.account_root_id, id).ok());
            match found {
                Some(c) => c,
                None => {
                    return Json(CouncilAskOutput::degraded_envelope(
                        raw.clone(),
                        Uuid::new_v4().to_string(),
                        vec!["conversation_not_found".to_string()],
                    ))
                }
            }
        }
        None => state.conversations.create_conversation(&resolved.owner_key_id, &resolved.account_root_id),
    };
    // Title generation only ever runs for a conversation's first message —
    // the rule is authoritative, not an optimization.
    let needs_title = state.conversations.messages(&resolved.account_root_id, conversation.id).map(|m| m.is_empty()).unwrap_or(true);
    let _ = state.conversations.add_user_message(&resolved.account_root_id, conversation.id, &input.prompt);

    let run_slot = RunSlot::new();
    let run_slot_for_handler = run_slot.clone();
    let ledger = state.ledger.clone();
    let cache = state.cache.clone();
    let upstream = state.upstream.clone();
    let config = state.config.clone();
    let owner_key_id = resolved.owner_key_id.clone();
    let prompt = input.prompt.clone();
    let mode = input.mode;
    let budget: Option<PipelineBudget> = input.budget.clone().map(Into::into);
    let conversation_id = conversation.id;

    let outcome = state
        .tool_runtime
        .invoke(ToolSurface::Mcp, state.ledger.as_ref(), &run_slot, async move {
            let run = ledger.create_run(conversation_id, "council.ask", Some(owner_key_id.clone()), serde_json::json!({"mode": mode.as_str()}));
            run_slot_for_handler.set(run.id);

            let engine = CouncilEngine::new(upstream.as_ref(), ledger.as_ref(), cache.as_ref(), &config.pricing);
            let council_models = config.models.council_models_for(mode);
            let judge_models = config.models.judge_models_for(mode);
            let chairman = chair_for(&config.models, mode);
            let timeout = config.upstream.timeout_for_mode(mode);

            let result = engine
                .run(&prompt, run.id, Some(owner_key_id.as_str()), &council_models, &judge_models, &chairman, budget.as_ref(), Some(timeout))
                .await;

            let title = if needs_title && !result.budget_exceeded {
                Some(engine.generate_title(&config.models.title_model, &prompt, run.id, Some(owner_key_id.as_str())).await)
            } else {
                None
            };
            Ok::<_, ToolError>((run.id, result, title))
        })
        .await;

    let (run_id, result, title) = match outcome {
        Ok(v) => v,
        Err(failure) => {
            return Json(CouncilAskOutput::degraded_envelope(
                conversation.id.to_string(),
                Uuid::new_v4().to_string(),
                vec![failure.as_error_code().to_string()],
            ))
        }
    };

    let degraded = result.budget_exceeded || !result.errors.is_empty();
    let status = if result.errors.is_empty() { sa_domain::records::RunStatus::Succeeded } else { sa_domain::records::RunStatus::Failed };
    state.ledger.end_run(run_id, status, 0);

    let usage_summary = UsageSummary::from_events(&state.ledger.usage_events_for_run(run_id));
    let _ = state.conversations.add_assistant_message(
        &resolved.account_root_id,
        conversation.id,
        &format!("{} answers", result.stage1.len()),
        &format!("{} judgements", result.stage2.len()),
        &result.stage3.response,
    );
    if let Some(title) = title {
        let _ = state.conversations.update_conversation_title(&resolved.account_root_id, conversation.id, &title);
    }

    Json(CouncilAskOutput {
        final_answer: result.stage3.response,
        conversation_id: conversation.id.to_string(),
        run_id: run_id.to_string(),
        metadata: CouncilAskMetadata { label_to_model: result.metadata.label_to_model, aggregate_rankings: result.metadata.aggregate_rankings },
        usage_summary,
        degraded,
        errors: result.errors,
    })
}

async fn council_pipeline(State(state): State<AppState>, Json(input): Json<CouncilPipelineInput>) -> Json<CouncilPipelineOutput> {
    let Some(resolved) = input.api_key.as_deref().and_then(|k| state.api_keys.resolve(k)) else {
        return Json(CouncilPipelineOutput::degraded_envelope(
            input.conversation_id.clone().unwrap_or_default(),
            Uuid::new_v4().to_string(),
            vec!["invalid_api_key".to_string()],
        ));
    };

    let conversation = match &input.conversation_id {
        Some(raw) => {
            let found =
                Uuid::parse_str(raw).ok().and_then(|id| state.conversations.get_conversation(&resolved.account_root_id, id).ok());
            match found {
                Some(c) => c,
                None => {
                    return Json(CouncilPipelineOutput::degraded_envelope(
                        raw.clone(),
                        Uuid::new_v4().to_string(),
                        vec!["conversation_not_found".to_string()],
                    ))
                }
            }
        }
        None => state.conversations.create_conversation(&resolved.owner_key_id, &resolved.account_root_id),
    };

    let run_slot = RunSlot::new();
    let run_slot_for_handler = run_slot.clone();
    let ledger = state.ledger.clone();
    let upstream = state.upstream.clone();
    let config = state.config.clone();
    let owner_key_id = resolved.owner_key_id.clone();
    let task_description = input.task_description.clone();
    let repo_context = input.repo_context.clone();
    let mode = input.mode;
    let max_iterations = clamp_max_iterations(input.max_iterations as i64);
    let budget: Option<PipelineBudget> = input.budget.clone().map(Into::into);
    let conversation_id = conversation.id;

    let outcome = state
        .tool_runtime
        .invoke(ToolSurface::Http, state.ledger.as_ref(), &run_slot, async move {
            let run = ledger.create_run(
                conversation_id,
                "council.pipeline",
                Some(owner_key_id.clone()),
                serde_json::json!({"mode": mode.as_str(), "max_iterations": max_iterations}),
            );
            run_slot_for_handler.set(run.id);

            let engine = PipelineEngine::new(upstream.as_ref(), ledger.as_ref(), &config.pricing);
            let roles = resolve_pipeline_models(&config.models, mode);
            let timeout = config.upstream.timeout_for_mode(mode);

            let result = engine
                .run(&task_description, repo_context.as_ref(), run.id, Some(owner_key_id.as_str()), &roles, max_iterations, budget.as_ref(), Some(timeout))
                .await;
            Ok::<_, ToolError>((run.id, result))
        })
        .await;

    let (run_id, result) = match outcome {
        Ok(v) => v,
        Err(failure) => {
            return Json(CouncilPipelineOutput::degraded_envelope(
                conversation.id.to_string(),
                Uuid::new_v4().to_string(),
                vec![failure.as_error_code().to_string()],
            ))
        }
    };

    let gate_failed = result.gate_verdict != GateVerdict::Pass;
    let degraded = result.budget_exceeded || !result.errors.is_empty() || gate_failed;
    let status = if gate_failed { sa_domain::records::RunStatus::Failed } else { sa_domain::records::RunStatus::Succeeded };
    state.ledger.end_run(run_id, status, 0);
    let usage_summary = UsageSummary::from_events(&state.ledger.usage_events_for_run(run_id));

    Json(CouncilPipelineOutput {
        run_id: run_id.to_string(),
        conversation_id: conversation.id.to_string(),
        scope_contract: result.scope_contract,
        agent_outputs: result.agent_outputs,
        final_codex_prompt: result.final_codex_prompt,
        gate_verdict: result.gate_verdict,
        degraded,
        errors: result.errors,
        usage_summary,
    })
}
