//! Shared application state handed to every route handler, plus the
//! `ApiKeyResolver` seam. Spec §1 scopes API-key auth/rate-limit/account
//! wiring out — only `resolve(key) -> (owner_id, account_root_id,
//! monthly_cap)` matters to the engines — so this is a minimal in-memory
//! resolver, not a key-management system.

use sa_cache::CacheStore;
use sa_domain::config::Config;
use sa_ledger::Ledger;
use sa_orchestrator::{InMemoryConversationStore, ToolRuntime};
use sa_providers::UpstreamClient;
use std::collections::HashMap;
use std::sync::Arc;

/// What `council.ask`/`council.pipeline` need to know about the caller.
#[derive(Debug, Clone)]
pub struct ResolvedApiKey {
    pub owner_key_id: String,
    pub account_root_id: String,
    pub monthly_token_cap: Option<u64>,
}

pub trait ApiKeyResolver: Send + Sync {
    fn resolve(&self, api_key: &str) -> Option<ResolvedApiKey>;
}

/// Maps a raw key string to its resolved identity. A key absent from the
/// map, or present with `is_active: false`, resolves to `None` — the
/// caller turns that into `errors:["invalid_api_key"]`.
pub struct InMemoryApiKeyResolver {
    keys: HashMap<String, ResolvedApiKey>,
}

impl InMemoryApiKeyResolver {
    pub fn new() -> Self {
        Self { keys: HashMap::new() }
    }

    pub fn with_key(mut self, raw_key: impl Into<String>, owner_key_id: impl Into<String>, account_root_id: impl Into<String>, monthly_token_cap: Option<u64>) -> Self {
        self.keys.insert(raw_key.into(), ResolvedApiKey { owner_key_id: owner_key_id.into(), account_root_id: account_root_id.into(), monthly_token_cap });
        self
    }
}

impl Default for InMemoryApiKeyResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl ApiKeyResolver for InMemoryApiKeyResolver {
    fn resolve(&self, api_key: &str) -> Option<ResolvedApiKey> {
        self.keys.get(api_key).cloned()
    }
}

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub upstream: Arc<UpstreamClient>,
    pub cache: Arc<CacheStore>,
    pub ledger: Arc<Ledger>,
    pub conversations: Arc<InMemoryConversationStore>,
    pub api_keys: Arc<dyn ApiKeyResolver>,
    pub tool_runtime: Arc<ToolRuntime>,
}
