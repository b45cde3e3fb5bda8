#![forbid(unsafe_code)]
#![doc = r#"
Pario

Transparent reverse proxy between client applications and remote LLM APIs.
Pario authenticates the client, forwards the request upstream with the
operator's credentials, and on the way back records token usage, optionally
caches the response, attributes cost, and emits an audit entry. Per-key and
per-model token budgets are enforced before the upstream call.

Crate highlights
- Two wire dialects: OpenAI-style chat completions and Anthropic-style
  messages, with SSE streaming relay on both.
- Alias routing with ordered fallback chains across providers.
- Three separate SQLite stores: usage (with sessions), response cache, and
  audit log.

Modules
- `models`: wire and domain types for both dialects.
- `config`: JSON configuration with defaults.
- `usage`: usage records, sessions, summaries, cost reports.
- `cache`: exact-match prompt cache with TTL.
- `audit`: audit log with retention sweeping.
- `budget`: period-windowed token budget enforcement.
- `router`: alias-and-fallback resolution.
- `upstream`: one-shot buffered and streaming provider calls.
- `relay`: line-oriented SSE relay with usage accumulation.
- `server`: actix-web surface and the request pipeline.
- `util`: tracing setup, HTTP client, error envelope.
"#]

pub mod audit;
pub mod budget;
pub mod cache;
pub mod config;
pub mod models;
pub mod relay;
pub mod router;
pub mod server;
pub mod upstream;
pub mod usage;
pub mod util;

pub use crate::audit::{hash_api_key, AuditError, AuditLogger};
pub use crate::budget::{BudgetError, Enforcer};
pub use crate::cache::{hash_prompt, CacheError, CacheStore};
pub use crate::config::{Config, ConfigError, ProviderConfig, ProviderDialect};
pub use crate::models::{
    AuditEntry, AuditQueryOpts, BudgetPeriod, BudgetPolicy, BudgetStatus, CacheStats, ChatMessage,
    CostLabel, CostReport, Dialect, ModelPricing, Session, SessionRequest, Usage, UsageRecord,
    UsageSummary,
};
pub use crate::router::{Route, RouteError, Router};
pub use crate::server::{config_routes, run, AppState};
pub use crate::usage::{UsageError, UsageStore};
