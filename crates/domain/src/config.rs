//! Environment-first configuration, matching the defaults enumerated in
//! spec §6 plus the per-mode/per-role overrides the original Python
//! `config.py` exposes.
//!
//! Loading never panics: every field falls back to a hardcoded default and
//! a malformed override is logged and ignored, mirroring the teacher's
//! `Config::load_or_default` style.

use serde::{Deserialize, Serialize};
use std::env;

fn env_str(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    match env_str(key) {
        Some(v) => v.parse().unwrap_or_else(|_| {
            tracing::warn!(key, value = %v, "invalid env override, using default");
            default
        }),
        None => default,
    }
}

fn env_bool(key: &str, default: bool) -> bool {
    match env_str(key) {
        Some(v) => v.eq_ignore_ascii_case("true"),
        None => default,
    }
}

fn env_csv(key: &str) -> Option<Vec<String>> {
    let raw = env_str(key)?;
    let items: Vec<String> = raw
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    if items.is_empty() {
        None
    } else {
        Some(items)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    pub api_key: Option<String>,
    pub api_url: String,
    pub max_concurrency: usize,
    pub max_retries: u32,
    pub retry_base_seconds: f64,
    pub timeout_seconds: f64,
    pub auth_cooldown_seconds: u64,
    pub timeout_seconds_fast: Option<f64>,
    pub timeout_seconds_balanced: Option<f64>,
    pub timeout_seconds_deep: Option<f64>,
}

impl UpstreamConfig {
    fn load() -> Self {
        Self {
            api_key: env_str("OPENROUTER_API_KEY"),
            api_url: env_str("OPENROUTER_API_URL")
                .unwrap_or_else(|| "https://openrouter.ai/api/v1/chat/completions".to_string()),
            max_concurrency: env_parse("OPENROUTER_MAX_CONCURRENCY", 6),
            max_retries: env_parse("OPENROUTER_MAX_RETRIES", 2),
            retry_base_seconds: env_parse("OPENROUTER_RETRY_BASE_SECONDS", 0.5),
            timeout_seconds: env_parse("OPENROUTER_TIMEOUT_SECONDS", 120.0),
            auth_cooldown_seconds: env_parse("OPENROUTER_AUTH_COOLDOWN_SECONDS", 60),
            timeout_seconds_fast: env_str("OPENROUTER_TIMEOUT_SECONDS_FAST").and_then(|v| v.parse().ok()),
            timeout_seconds_balanced: env_str("OPENROUTER_TIMEOUT_SECONDS_BALANCED")
                .and_then(|v| v.parse().ok()),
            timeout_seconds_deep: env_str("OPENROUTER_TIMEOUT_SECONDS_DEEP").and_then(|v| v.parse().ok()),
        }
    }

    pub fn timeout_for_mode(&self, mode: crate::tool_io::Mode) -> f64 {
        use crate::tool_io::Mode;
        let override_value = match mode {
            Mode::Fast => self.timeout_seconds_fast,
            Mode::Deep => self.timeout_seconds_deep,
            Mode::Balanced => self.timeout_seconds_balanced,
        };
        override_value.unwrap_or(self.timeout_seconds)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub enabled: bool,
    pub ttl_seconds: Option<u64>,
}

impl CacheConfig {
    fn load() -> Self {
        Self {
            enabled: env_bool("COUNCIL_CACHE_ENABLED", true),
            ttl_seconds: env_str("COUNCIL_CACHE_TTL_SECONDS").and_then(|v| v.parse().ok()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PricingEntry {
    pub prompt_per_1m: f64,
    pub completion_per_1m: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricingConfig {
    pub table: std::collections::HashMap<String, PricingEntry>,
    pub price_book_version: String,
}

impl PricingConfig {
    fn load() -> Self {
        let table = env_str("MODEL_PRICING_JSON")
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default();
        Self {
            table,
            price_book_version: env_str("PRICE_BOOK_VERSION").unwrap_or_else(|| "v1".to_string()),
        }
    }

    pub fn estimate_cost(&self, model: &str, prompt_tokens: u64, completion_tokens: u64) -> Option<f64> {
        let entry = self.table.get(model)?;
        Some(
            (prompt_tokens as f64 / 1_000_000.0) * entry.prompt_per_1m
                + (completion_tokens as f64 / 1_000_000.0) * entry.completion_per_1m,
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpConfig {
    pub max_concurrent_calls: usize,
    pub tool_timeout_seconds: f64,
    pub max_prompt_chars: usize,
    pub max_task_chars: usize,
    pub max_repo_files: usize,
    pub max_repo_total_chars: usize,
    pub max_path_chars: usize,
}

impl McpConfig {
    fn load() -> Self {
        Self {
            max_concurrent_calls: env_parse("MCP_MAX_CONCURRENT_CALLS", 4),
            tool_timeout_seconds: env_parse("MCP_TOOL_TIMEOUT_SECONDS", 300.0),
            max_prompt_chars: env_parse("MCP_MAX_PROMPT_CHARS", 20_000),
            max_task_chars: env_parse("MCP_MAX_TASK_CHARS", 20_000),
            max_repo_files: env_parse("MCP_MAX_REPO_FILES", 25),
            max_repo_total_chars: env_parse("MCP_MAX_REPO_TOTAL_CHARS", 200_000),
            max_path_chars: env_parse("MCP_MAX_PATH_CHARS", 300),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpToolsConfig {
    pub max_concurrent_calls: usize,
    pub tool_timeout_seconds: f64,
}

impl HttpToolsConfig {
    fn load() -> Self {
        Self {
            max_concurrent_calls: env_parse("HTTP_MAX_CONCURRENT_TOOL_CALLS", 16),
            tool_timeout_seconds: env_parse("HTTP_TOOL_TIMEOUT_SECONDS", 300.0),
        }
    }
}

/// `council_models`/`chairman_model`/per-mode overrides and pipeline role
/// overrides, matching `original_source/backend/src/config.py`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelsConfig {
    pub council_models: Vec<String>,
    pub chairman_model: String,
    pub title_model: String,

    pub models_fast: Option<Vec<String>>,
    pub models_balanced: Option<Vec<String>>,
    pub models_deep: Option<Vec<String>>,

    pub judges_fast: Option<Vec<String>>,
    pub judges_balanced: Option<Vec<String>>,
    pub judges_deep: Option<Vec<String>>,

    pub chair_fast: Option<String>,
    pub chair_balanced: Option<String>,
    pub chair_deep: Option<String>,

    pub leader_model: Option<String>,
    pub reviewer_model: Option<String>,
    pub security_model: Option<String>,
    pub test_writer_model: Option<String>,
    pub implementer_model: Option<String>,
    pub gate_model: Option<String>,
}

impl ModelsConfig {
    fn load() -> Self {
        Self {
            council_models: env_csv("COUNCIL_MODELS").unwrap_or_else(|| {
                vec![
                    "openai/gpt-5.1".to_string(),
                    "google/gemini-3-pro-preview".to_string(),
                    "anthropic/claude-sonnet-4.5".to_string(),
                    "x-ai/grok-4".to_string(),
                ]
            }),
            chairman_model: env_str("CHAIRMAN_MODEL")
                .unwrap_or_else(|| "google/gemini-3-pro-preview".to_string()),
            title_model: env_str("TITLE_MODEL").unwrap_or_else(|| "google/gemini-2.5-flash".to_string()),
            models_fast: env_csv("MCP_MODELS_FAST"),
            models_balanced: env_csv("MCP_MODELS_BALANCED"),
            models_deep: env_csv("MCP_MODELS_DEEP"),
            judges_fast: env_csv("MCP_JUDGES_FAST"),
            judges_balanced: env_csv("MCP_JUDGES_BALANCED"),
            judges_deep: env_csv("MCP_JUDGES_DEEP"),
            chair_fast: env_str("MCP_CHAIR_FAST"),
            chair_balanced: env_str("MCP_CHAIR_BALANCED"),
            chair_deep: env_str("MCP_CHAIR_DEEP"),
            leader_model: env_str("LEADER_MODEL"),
            reviewer_model: env_str("REVIEWER_MODEL"),
            security_model: env_str("SECURITY_MODEL"),
            test_writer_model: env_str("TEST_WRITER_MODEL"),
            implementer_model: env_str("IMPLEMENTER_MODEL"),
            gate_model: env_str("GATE_MODEL"),
        }
    }

    /// Mirrors `council.py`'s judge-model resolution: judges default to
    /// the council roster unless a mode-specific override is set.
    pub fn judge_models_for(&self, mode: crate::tool_io::Mode) -> Vec<String> {
        use crate::tool_io::Mode;
        let balanced = self.judges_balanced.clone().unwrap_or_else(|| self.council_models.clone());
        match mode {
            Mode::Fast => self.judges_fast.clone().unwrap_or_else(|| balanced.clone()),
            Mode::Deep => self.judges_deep.clone().unwrap_or(balanced),
            Mode::Balanced => balanced,
        }
    }

    pub fn council_models_for(&self, mode: crate::tool_io::Mode) -> Vec<String> {
        use crate::tool_io::Mode;
        let balanced = self.models_balanced.clone().unwrap_or_else(|| self.council_models.clone());
        match mode {
            Mode::Fast => self.models_fast.clone().unwrap_or_else(|| balanced.clone()),
            Mode::Deep => self.models_deep.clone().unwrap_or(balanced),
            Mode::Balanced => balanced,
        }
    }
}

/// The outer HTTP shell's bind address and auth toggle, matching the
/// teacher's `config.server` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub max_concurrent_requests: usize,
    pub api_token_env: String,
}

impl ServerConfig {
    fn load() -> Self {
        Self {
            host: env_str("SA_GATEWAY_HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
            port: env_parse("SA_GATEWAY_PORT", 8080),
            max_concurrent_requests: env_parse("SA_GATEWAY_MAX_CONCURRENT_REQUESTS", 64),
            api_token_env: env_str("SA_GATEWAY_API_TOKEN_ENV").unwrap_or_else(|| "SA_GATEWAY_API_TOKEN".to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub upstream: UpstreamConfig,
    pub cache: CacheConfig,
    pub pricing: PricingConfig,
    pub mcp: McpConfig,
    pub http_tools: HttpToolsConfig,
    pub models: ModelsConfig,
    pub server: ServerConfig,
}

impl Config {
    pub fn load_or_default() -> Self {
        Self {
            upstream: UpstreamConfig::load(),
            cache: CacheConfig::load(),
            pricing: PricingConfig::load(),
            mcp: McpConfig::load(),
            http_tools: HttpToolsConfig::load(),
            models: ModelsConfig::load(),
            server: ServerConfig::load(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upstream_config_has_spec_defaults_when_env_unset() {
        let cfg = UpstreamConfig::load();
        assert_eq!(cfg.max_concurrency, 6);
        assert_eq!(cfg.max_retries, 2);
        assert!((cfg.retry_base_seconds - 0.5).abs() < f64::EPSILON);
        assert_eq!(cfg.auth_cooldown_seconds, 60);
    }

    #[test]
    fn pricing_estimate_uses_per_million_rates() {
        let mut table = std::collections::HashMap::new();
        table.insert(
            "m1".to_string(),
            PricingEntry {
                prompt_per_1m: 5.0,
                completion_per_1m: 15.0,
            },
        );
        let cfg = PricingConfig {
            table,
            price_book_version: "v1".into(),
        };
        let cost = cfg.estimate_cost("m1", 1_000_000, 1_000_000).unwrap();
        assert!((cost - 20.0).abs() < 1e-9);
        assert!(cfg.estimate_cost("unknown", 1, 1).is_none());
    }
}
