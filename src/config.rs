//! Proxy configuration.
//!
//! Loaded once at startup from a JSON file; immutable for the process
//! lifetime. Every knob the request pipeline consumes lives here:
//! providers, routing aliases, cache, budget policies, session grouping,
//! audit policy, and attribution labels.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::models::{BudgetPolicy, CostLabel, ModelPricing};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("parse config: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Wire-level style of an upstream provider.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProviderDialect {
    #[default]
    OpenAi,
    Anthropic,
}

/// An upstream LLM endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub name: String,
    /// Base URL, e.g. `https://api.openai.com`.
    pub url: String,
    pub api_key: String,
    #[serde(default, rename = "type")]
    pub dialect: ProviderDialect,
}

/// Model routing and fallback chains.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RouterConfig {
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
}

/// Maps a client-facing model alias to an ordered list of targets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteConfig {
    pub model: String,
    pub targets: Vec<RouteTarget>,
}

/// A specific provider and model in a fallback chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteTarget {
    pub provider: String,
    /// Empty means "keep the requested model name".
    #[serde(default)]
    pub model: String,
}

/// Prompt cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub enabled: bool,
    #[serde(default = "default_cache_ttl_secs")]
    pub ttl_secs: u64,
}

fn default_cache_ttl_secs() -> u64 {
    3600
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_secs: default_cache_ttl_secs(),
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

/// Budget enforcement settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BudgetConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub policies: Vec<BudgetPolicy>,
}

/// Session auto-grouping settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Requests from the same key separated by more than this many seconds
    /// start a new auto-session.
    #[serde(default = "default_gap_timeout_secs")]
    pub gap_timeout_secs: u64,
}

fn default_gap_timeout_secs() -> u64 {
    1800
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            gap_timeout_secs: default_gap_timeout_secs(),
        }
    }
}

impl SessionConfig {
    pub fn gap_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.gap_timeout_secs as i64)
    }
}

/// Audit logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_audit_db_path")]
    pub db_path: String,
    #[serde(default = "default_retention_days")]
    pub retention_days: i64,
    #[serde(default)]
    pub redact_keys: bool,
    /// Which entry fields to persist: any of "prompts", "responses", "metadata".
    #[serde(default = "default_audit_include")]
    pub include: Vec<String>,
    /// Models whose requests are never audited.
    #[serde(default)]
    pub exclude_models: Vec<String>,
    /// Truncate persisted bodies to this many bytes; 0 disables truncation.
    #[serde(default)]
    pub max_body_size: usize,
}

fn default_audit_db_path() -> String {
    "pario_audit.db".into()
}

fn default_retention_days() -> i64 {
    30
}

fn default_audit_include() -> Vec<String> {
    vec!["prompts".into(), "responses".into(), "metadata".into()]
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            db_path: default_audit_db_path(),
            retention_days: default_retention_days(),
            redact_keys: false,
            include: default_audit_include(),
            exclude_models: Vec::new(),
            max_body_size: 0,
        }
    }
}

/// Attribution fallbacks and pricing for cost reports.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AttributionConfig {
    /// api-key -> labels, used when a request carries no attribution headers.
    #[serde(default)]
    pub key_labels: HashMap<String, CostLabel>,
    #[serde(default)]
    pub pricing: Vec<ModelPricing>,
}

/// Full proxy configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub listen: String,
    pub db_path: String,
    pub cache_db_path: String,
    pub providers: Vec<ProviderConfig>,
    pub router: RouterConfig,
    pub cache: CacheConfig,
    pub budget: BudgetConfig,
    pub session: SessionConfig,
    pub audit: AuditConfig,
    pub attribution: AttributionConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8080".into(),
            db_path: "pario.db".into(),
            cache_db_path: "pario_cache.db".into(),
            providers: Vec::new(),
            router: RouterConfig::default(),
            cache: CacheConfig::default(),
            budget: BudgetConfig::default(),
            session: SessionConfig::default(),
            audit: AuditConfig::default(),
            attribution: AttributionConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a JSON file, falling back to defaults for
    /// absent fields. Environment variables of the form `${VAR}` inside the
    /// file are expanded before parsing so credentials stay out of the file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let expanded = expand_env(&content);
        let config: Config = serde_json::from_str(&expanded)?;
        Ok(config)
    }
}

/// Replace `${VAR}` occurrences with the value of the environment variable,
/// leaving unknown variables untouched.
fn expand_env(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        match rest[start + 2..].find('}') {
            Some(end) => {
                let name = &rest[start + 2..start + 2 + end];
                match std::env::var(name) {
                    Ok(value) => out.push_str(&value),
                    Err(_) => {
                        out.push_str(&rest[start..start + end + 3]);
                    }
                }
                rest = &rest[start + end + 3..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = Config::default();
        assert_eq!(cfg.listen, "0.0.0.0:8080");
        assert!(cfg.cache.enabled);
        assert_eq!(cfg.cache.ttl_secs, 3600);
        assert_eq!(cfg.session.gap_timeout_secs, 1800);
        assert!(!cfg.budget.enabled);
        assert!(!cfg.audit.enabled);
    }

    #[test]
    fn parses_partial_config() {
        let cfg: Config = serde_json::from_str(
            r#"{
                "listen": "127.0.0.1:9000",
                "providers": [
                    {"name": "openai", "url": "https://api.openai.com", "api_key": "sk-1"},
                    {"name": "claude", "url": "https://api.anthropic.com", "api_key": "sk-2", "type": "anthropic"}
                ],
                "router": {"routes": [
                    {"model": "gpt-4", "targets": [
                        {"provider": "openai"},
                        {"provider": "claude", "model": "claude-sonnet-4-20250514"}
                    ]}
                ]}
            }"#,
        )
        .unwrap();
        assert_eq!(cfg.listen, "127.0.0.1:9000");
        assert_eq!(cfg.providers.len(), 2);
        assert_eq!(cfg.providers[1].dialect, ProviderDialect::Anthropic);
        assert_eq!(cfg.router.routes[0].targets[0].model, "");
        assert!(cfg.cache.enabled);
    }

    #[test]
    fn expands_environment_variables() {
        std::env::set_var("PARIO_TEST_KEY", "sk-secret");
        let expanded = expand_env(r#"{"api_key": "${PARIO_TEST_KEY}", "other": "${PARIO_UNSET_VAR}"}"#);
        assert!(expanded.contains("sk-secret"));
        assert!(expanded.contains("${PARIO_UNSET_VAR}"));
    }
}
