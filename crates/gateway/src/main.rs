use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::EnvFilter;

use sa_cache::CacheStore;
use sa_domain::config::Config;
use sa_gateway::api;
use sa_gateway::state::{AppState, InMemoryApiKeyResolver};
use sa_ledger::Ledger;
use sa_orchestrator::{InMemoryConversationStore, ToolRuntime};
use sa_providers::UpstreamClient;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let config = Arc::new(Config::load_or_default());
    run_server(config).await
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,sa_gateway=debug")))
        .json()
        .init();
}

async fn run_server(config: Arc<Config>) -> anyhow::Result<()> {
    tracing::info!("council gateway starting");

    if config.upstream.api_key.is_none() {
        tracing::warn!("OPENROUTER_API_KEY not set — upstream calls will fail with no_api_key");
    }

    let upstream = Arc::new(UpstreamClient::new(config.upstream.clone()));
    tracing::info!(max_concurrency = config.upstream.max_concurrency, "upstream client ready");

    let cache = Arc::new(CacheStore::new(config.cache.enabled, config.cache.ttl_seconds));
    tracing::info!(enabled = config.cache.enabled, "cache store ready");

    let ledger = Arc::new(Ledger::new());
    tracing::info!("run ledger ready");

    let conversations = Arc::new(InMemoryConversationStore::new());
    tracing::info!("conversation store ready");

    let api_keys: Arc<dyn sa_gateway::state::ApiKeyResolver> = Arc::new(load_api_key_resolver());
    tracing::info!("api key resolver ready");

    let tool_runtime = Arc::new(ToolRuntime::new(
        config.mcp.max_concurrent_calls,
        config.mcp.tool_timeout_seconds,
        config.http_tools.max_concurrent_calls,
        config.http_tools.tool_timeout_seconds,
    ));
    tracing::info!(
        mcp_max_concurrent = config.mcp.max_concurrent_calls,
        http_max_concurrent = config.http_tools.max_concurrent_calls,
        "tool runtime ready"
    );

    let state = AppState { config: config.clone(), upstream, cache, ledger, conversations, api_keys, tool_runtime };

    let app = api::router(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await.with_context(|| format!("binding to {addr}"))?;
    tracing::info!(addr = %addr, "council gateway listening");

    axum::serve(listener, app).await.context("axum server error")?;
    Ok(())
}

/// A single static key, read from `SA_STATIC_API_KEY`/`SA_STATIC_ACCOUNT_ROOT_ID`,
/// mapped to itself as owner — sufficient for the out-of-scope auth seam
/// (spec §1: only `resolve(key) -> (owner_id, account_root_id, monthly_cap)`
/// matters here).
fn load_api_key_resolver() -> InMemoryApiKeyResolver {
    let mut resolver = InMemoryApiKeyResolver::new();
    if let Ok(key) = std::env::var("SA_STATIC_API_KEY") {
        if !key.is_empty() {
            let account_root_id = std::env::var("SA_STATIC_ACCOUNT_ROOT_ID").unwrap_or_else(|_| "default".to_string());
            resolver = resolver.with_key(key, "default", account_root_id, None);
        }
    }
    resolver
}
