//! End-to-end pipeline tests against a mock upstream.

use actix_web::{test, web, App};
use axum::body::Body;
use axum::extract::{Request, State};
use axum::response::Response;
use chrono::Utc;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;

use pario::config::{Config, ProviderConfig, ProviderDialect, RouteConfig, RouteTarget};
use pario::models::{BudgetPeriod, BudgetPolicy, UsageRecord};
use pario::server::{config_routes, AppState};
use pario::usage::UsageStore;

/// One request as the mock upstream saw it.
#[derive(Clone)]
struct Seen {
    path: String,
    headers: HashMap<String, String>,
    body: Value,
}

#[derive(Clone)]
struct UpstreamState {
    status: u16,
    content_type: String,
    body: String,
    seen: Arc<AsyncMutex<Vec<Seen>>>,
}

async fn handle(State(state): State<UpstreamState>, req: Request) -> Response {
    let (parts, body) = req.into_parts();
    let bytes = axum::body::to_bytes(body, usize::MAX).await.unwrap_or_default();
    let headers = parts
        .headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect();
    state.seen.lock().await.push(Seen {
        path: parts.uri.path().to_string(),
        headers,
        body: serde_json::from_slice(&bytes).unwrap_or(Value::Null),
    });

    Response::builder()
        .status(state.status)
        .header("content-type", state.content_type.as_str())
        .body(Body::from(state.body.clone()))
        .unwrap()
}

struct MockUpstream {
    base_url: String,
    seen: Arc<AsyncMutex<Vec<Seen>>>,
    join: JoinHandle<()>,
}

impl MockUpstream {
    async fn start(status: u16, response: Value) -> Self {
        Self::start_raw(status, "application/json", response.to_string()).await
    }

    async fn start_raw(status: u16, content_type: &str, body: String) -> Self {
        let seen = Arc::new(AsyncMutex::new(Vec::new()));
        let state = UpstreamState {
            status,
            content_type: content_type.to_string(),
            body,
            seen: seen.clone(),
        };

        let app = axum::Router::new().fallback(handle).with_state(state);
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind upstream");
        let addr = listener.local_addr().expect("local addr");
        let base_url = format!("http://{}", addr);

        let join = tokio::spawn(async move {
            axum::serve(listener, app).await.expect("upstream server error");
        });

        Self {
            base_url,
            seen,
            join,
        }
    }

    async fn requests(&self) -> Vec<Seen> {
        self.seen.lock().await.clone()
    }
}

impl Drop for MockUpstream {
    fn drop(&mut self) {
        self.join.abort();
    }
}

fn provider(name: &str, url: &str, dialect: ProviderDialect) -> ProviderConfig {
    ProviderConfig {
        name: name.into(),
        url: url.into(),
        api_key: format!("sk-{}", name),
        dialect,
    }
}

/// Fresh on-disk databases per test; the TempDir guard keeps them alive.
fn base_config(providers: Vec<ProviderConfig>) -> (Config, tempfile::TempDir) {
    let dir = tempfile::tempdir().expect("create temp dir");
    let mut config = Config::default();
    config.db_path = dir.path().join("usage.db").display().to_string();
    config.cache_db_path = dir.path().join("cache.db").display().to_string();
    config.audit.db_path = dir.path().join("audit.db").display().to_string();
    config.providers = providers;
    (config, dir)
}

fn openai_response() -> Value {
    json!({
        "id": "chatcmpl-123",
        "object": "chat.completion",
        "model": "gpt-4",
        "choices": [
            {"index": 0, "message": {"role": "assistant", "content": "Hello!"}, "finish_reason": "stop"}
        ],
        "usage": {"prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15}
    })
}

fn chat_body() -> String {
    json!({"model": "gpt-4", "messages": [{"role": "user", "content": "hi"}]}).to_string()
}

async fn records_for(store: &UsageStore, api_key: &str) -> Vec<UsageRecord> {
    store
        .query_by_key(api_key, Utc::now() - chrono::Duration::hours(1))
        .await
        .unwrap()
}

async fn wait_for_records(store: &UsageStore, api_key: &str) -> Vec<UsageRecord> {
    for _ in 0..100 {
        let records = records_for(store, api_key).await;
        if !records.is_empty() {
            return records;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    Vec::new()
}

macro_rules! init_app {
    ($config:expr) => {{
        let state = AppState::from_config($config).await.unwrap();
        let data = web::Data::new(state);
        let app =
            test::init_service(App::new().app_data(data.clone()).configure(config_routes)).await;
        (data, app)
    }};
}

#[actix_web::test]
async fn cache_hit_skips_the_second_upstream_call() {
    let upstream = MockUpstream::start(200, openai_response()).await;
    let (config, _dir) = base_config(vec![provider(
        "test",
        &upstream.base_url,
        ProviderDialect::OpenAi,
    )]);
    let (data, app) = init_app!(config);

    let req = test::TestRequest::post()
        .uri("/v1/chat/completions")
        .insert_header(("Authorization", "Bearer client-key"))
        .insert_header(("Content-Type", "application/json"))
        .set_payload(chat_body())
        .to_request();
    let resp = test::call_service(&app, req).await;

    assert_eq!(resp.status(), 200);
    assert_eq!(
        resp.headers().get("X-Pario-Cache").unwrap().to_str().unwrap(),
        "miss"
    );
    assert!(resp.headers().contains_key("X-Pario-Session"));
    let first_body = test::read_body(resp).await;

    let req = test::TestRequest::post()
        .uri("/v1/chat/completions")
        .insert_header(("Authorization", "Bearer client-key"))
        .set_payload(chat_body())
        .to_request();
    let resp = test::call_service(&app, req).await;

    assert_eq!(resp.status(), 200);
    assert_eq!(
        resp.headers().get("X-Pario-Cache").unwrap().to_str().unwrap(),
        "hit"
    );
    let second_body = test::read_body(resp).await;
    assert_eq!(first_body, second_body);

    assert_eq!(upstream.requests().await.len(), 1);

    // The cache hit charged nothing: still exactly one usage record.
    assert_eq!(records_for(&data.usage, "client-key").await.len(), 1);
}

#[actix_web::test]
async fn missing_api_key_returns_the_canonical_envelope() {
    let upstream = MockUpstream::start(200, openai_response()).await;
    let (config, _dir) = base_config(vec![provider(
        "test",
        &upstream.base_url,
        ProviderDialect::OpenAi,
    )]);
    let (_, app) = init_app!(config);

    let req = test::TestRequest::post()
        .uri("/v1/chat/completions")
        .set_payload(chat_body())
        .to_request();
    let resp = test::call_service(&app, req).await;

    assert_eq!(resp.status(), 401);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(
        body,
        json!({"error": {"message": "missing API key", "type": "pario_error", "code": 401}})
    );
    assert!(upstream.requests().await.is_empty());
}

#[actix_web::test]
async fn wrong_method_is_rejected() {
    let upstream = MockUpstream::start(200, openai_response()).await;
    let (config, _dir) = base_config(vec![provider(
        "test",
        &upstream.base_url,
        ProviderDialect::OpenAi,
    )]);
    let (_, app) = init_app!(config);

    let req = test::TestRequest::get()
        .uri("/v1/chat/completions")
        .insert_header(("Authorization", "Bearer client-key"))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 405);
}

#[actix_web::test]
async fn exceeded_budget_blocks_before_the_upstream_call() {
    let upstream = MockUpstream::start(200, openai_response()).await;
    let (mut config, _dir) = base_config(vec![provider(
        "test",
        &upstream.base_url,
        ProviderDialect::OpenAi,
    )]);
    config.budget.enabled = true;
    config.budget.policies = vec![BudgetPolicy {
        api_key: "*".into(),
        model: String::new(),
        max_tokens: 1000,
        period: BudgetPeriod::Daily,
    }];
    let (data, app) = init_app!(config);

    // Pre-seed today's usage past the limit.
    data.usage
        .record(&UsageRecord {
            id: 0,
            api_key: "client-key".into(),
            model: "gpt-4".into(),
            session_id: String::new(),
            prompt_tokens: 500,
            completion_tokens: 600,
            total_tokens: 1100,
            team: String::new(),
            project: String::new(),
            env: String::new(),
            created_at: Utc::now(),
        })
        .await
        .unwrap();

    let req = test::TestRequest::post()
        .uri("/v1/chat/completions")
        .insert_header(("Authorization", "Bearer client-key"))
        .set_payload(chat_body())
        .to_request();
    let resp = test::call_service(&app, req).await;

    assert_eq!(resp.status(), 429);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["error"]["message"], "token budget exceeded");
    assert!(upstream.requests().await.is_empty());
}

#[actix_web::test]
async fn a_5xx_upstream_falls_back_to_the_next_route() {
    let primary = MockUpstream::start(500, json!({"error": "boom"})).await;
    let fallback = MockUpstream::start(
        200,
        json!({
            "id": "chatcmpl-456",
            "model": "gpt-4o-mini",
            "choices": [],
            "usage": {"prompt_tokens": 5, "completion_tokens": 3, "total_tokens": 8}
        }),
    )
    .await;

    let (mut config, _dir) = base_config(vec![
        provider("primary", &primary.base_url, ProviderDialect::OpenAi),
        provider("fallback", &fallback.base_url, ProviderDialect::OpenAi),
    ]);
    config.router.routes = vec![RouteConfig {
        model: "gpt-4".into(),
        targets: vec![
            RouteTarget {
                provider: "primary".into(),
                model: String::new(),
            },
            RouteTarget {
                provider: "fallback".into(),
                model: "gpt-4o-mini".into(),
            },
        ],
    }];
    let (data, app) = init_app!(config);

    let req = test::TestRequest::post()
        .uri("/v1/chat/completions")
        .insert_header(("Authorization", "Bearer client-key"))
        .set_payload(chat_body())
        .to_request();
    let resp = test::call_service(&app, req).await;

    assert_eq!(resp.status(), 200);
    assert_eq!(primary.requests().await.len(), 1);

    let fallback_requests = fallback.requests().await;
    assert_eq!(fallback_requests.len(), 1);
    // The body sent to the fallback carries the rewritten model.
    assert_eq!(fallback_requests[0].body["model"], "gpt-4o-mini");
    // Other request fields survived the rewrite.
    assert_eq!(fallback_requests[0].body["messages"][0]["content"], "hi");

    // Usage is recorded under the model the provider echoed, not the alias.
    let records = records_for(&data.usage, "client-key").await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].model, "gpt-4o-mini");
    assert_eq!(records[0].total_tokens, 8);
}

#[actix_web::test]
async fn a_4xx_upstream_is_final() {
    let p1 = MockUpstream::start(400, json!({"error": "bad request"})).await;
    let p2 = MockUpstream::start(200, openai_response()).await;

    let (mut config, _dir) = base_config(vec![
        provider("p1", &p1.base_url, ProviderDialect::OpenAi),
        provider("p2", &p2.base_url, ProviderDialect::OpenAi),
    ]);
    config.router.routes = vec![RouteConfig {
        model: "gpt-4".into(),
        targets: vec![
            RouteTarget {
                provider: "p1".into(),
                model: String::new(),
            },
            RouteTarget {
                provider: "p2".into(),
                model: String::new(),
            },
        ],
    }];
    let (_, app) = init_app!(config);

    let req = test::TestRequest::post()
        .uri("/v1/chat/completions")
        .insert_header(("Authorization", "Bearer client-key"))
        .set_payload(chat_body())
        .to_request();
    let resp = test::call_service(&app, req).await;

    assert_eq!(resp.status(), 400);
    assert_eq!(p1.requests().await.len(), 1);
    assert!(p2.requests().await.is_empty());
}

#[actix_web::test]
async fn all_5xx_routes_relay_the_last_5xx() {
    let p1 = MockUpstream::start(500, json!({"error": "boom"})).await;
    let p2 = MockUpstream::start(503, json!({"error": "down"})).await;

    let (mut config, _dir) = base_config(vec![
        provider("p1", &p1.base_url, ProviderDialect::OpenAi),
        provider("p2", &p2.base_url, ProviderDialect::OpenAi),
    ]);
    config.router.routes = vec![RouteConfig {
        model: "gpt-4".into(),
        targets: vec![
            RouteTarget {
                provider: "p1".into(),
                model: String::new(),
            },
            RouteTarget {
                provider: "p2".into(),
                model: String::new(),
            },
        ],
    }];
    let (_, app) = init_app!(config);

    let req = test::TestRequest::post()
        .uri("/v1/chat/completions")
        .insert_header(("Authorization", "Bearer client-key"))
        .set_payload(chat_body())
        .to_request();
    let resp = test::call_service(&app, req).await;

    assert_eq!(resp.status(), 503);
    assert_eq!(
        resp.headers().get("X-Pario-Cache").unwrap().to_str().unwrap(),
        "miss"
    );
    assert_eq!(p1.requests().await.len(), 1);
    assert_eq!(p2.requests().await.len(), 1);
}

#[actix_web::test]
async fn anthropic_dialect_uses_its_own_credentials_and_usage_shape() {
    let upstream = MockUpstream::start(
        200,
        json!({
            "id": "msg_123",
            "model": "claude-sonnet-4-20250514",
            "content": [{"type": "text", "text": "Hello!"}],
            "usage": {"input_tokens": 12, "output_tokens": 8}
        }),
    )
    .await;
    let (config, _dir) = base_config(vec![provider(
        "claude",
        &upstream.base_url,
        ProviderDialect::Anthropic,
    )]);
    let (data, app) = init_app!(config);

    let body = json!({
        "model": "claude-sonnet-4-20250514",
        "max_tokens": 1024,
        "messages": [{"role": "user", "content": "hi"}]
    })
    .to_string();
    let req = test::TestRequest::post()
        .uri("/v1/messages")
        .insert_header(("x-api-key", "client-key"))
        .insert_header(("anthropic-version", "2023-06-01"))
        .set_payload(body)
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 200);

    let seen = upstream.requests().await;
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].path, "/v1/messages");
    assert_eq!(seen[0].headers.get("x-api-key").unwrap(), "sk-claude");
    assert_eq!(
        seen[0].headers.get("anthropic-version").unwrap(),
        "2023-06-01"
    );
    assert!(!seen[0].headers.contains_key("authorization"));
    assert_eq!(seen[0].body["model"], "claude-sonnet-4-20250514");

    let records = records_for(&data.usage, "client-key").await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].prompt_tokens, 12);
    assert_eq!(records[0].completion_tokens, 8);
    assert_eq!(records[0].total_tokens, 20);
}

#[actix_web::test]
async fn explicit_session_header_is_echoed_back() {
    let upstream = MockUpstream::start(200, openai_response()).await;
    let (config, _dir) = base_config(vec![provider(
        "test",
        &upstream.base_url,
        ProviderDialect::OpenAi,
    )]);
    let (_, app) = init_app!(config);

    let req = test::TestRequest::post()
        .uri("/v1/chat/completions")
        .insert_header(("Authorization", "Bearer client-key"))
        .insert_header(("X-Pario-Session", "my-session"))
        .set_payload(chat_body())
        .to_request();
    let resp = test::call_service(&app, req).await;

    assert_eq!(resp.status(), 200);
    assert_eq!(
        resp.headers().get("X-Pario-Session").unwrap().to_str().unwrap(),
        "my-session"
    );
}

#[actix_web::test]
async fn attribution_headers_land_on_the_usage_record() {
    let upstream = MockUpstream::start(200, openai_response()).await;
    let (config, _dir) = base_config(vec![provider(
        "test",
        &upstream.base_url,
        ProviderDialect::OpenAi,
    )]);
    let (data, app) = init_app!(config);

    let req = test::TestRequest::post()
        .uri("/v1/chat/completions")
        .insert_header(("Authorization", "Bearer client-key"))
        .insert_header(("X-Pario-Team", "ml"))
        .insert_header(("X-Pario-Project", "search"))
        .set_payload(chat_body())
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 200);

    let records = records_for(&data.usage, "client-key").await;
    assert_eq!(records[0].team, "ml");
    assert_eq!(records[0].project, "search");
    assert_eq!(records[0].env, "");
}

#[actix_web::test]
async fn streaming_relays_sse_bytes_and_records_usage_afterwards() {
    let sse_body = concat!(
        "data: {\"model\":\"gpt-4-0613\",\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n",
        "data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n\n",
        "data: {\"usage\":{\"prompt_tokens\":10,\"completion_tokens\":5,\"total_tokens\":15}}\n\n",
        "data: [DONE]\n\n",
    );
    let upstream = MockUpstream::start_raw(200, "text/event-stream", sse_body.to_string()).await;
    let (config, _dir) = base_config(vec![provider(
        "test",
        &upstream.base_url,
        ProviderDialect::OpenAi,
    )]);
    let (data, app) = init_app!(config);

    let body = json!({
        "model": "gpt-4",
        "stream": true,
        "messages": [{"role": "user", "content": "hi"}]
    })
    .to_string();
    let req = test::TestRequest::post()
        .uri("/v1/chat/completions")
        .insert_header(("Authorization", "Bearer client-key"))
        .set_payload(body)
        .to_request();
    let resp = test::call_service(&app, req).await;

    assert_eq!(resp.status(), 200);
    assert!(resp.headers().contains_key("X-Pario-Session"));
    let relayed = test::read_body(resp).await;
    assert_eq!(relayed.as_ref(), sse_body.as_bytes());

    // Usage lands on a detached task once the stream ends.
    let records = wait_for_records(&data.usage, "client-key").await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].model, "gpt-4-0613");
    assert_eq!(records[0].total_tokens, 15);
}

#[actix_web::test]
async fn audit_entry_is_written_off_the_response_path() {
    let upstream = MockUpstream::start(200, openai_response()).await;
    let (mut config, _dir) = base_config(vec![provider(
        "test",
        &upstream.base_url,
        ProviderDialect::OpenAi,
    )]);
    config.audit.enabled = true;
    let (data, app) = init_app!(config);

    let req = test::TestRequest::post()
        .uri("/v1/chat/completions")
        .insert_header(("Authorization", "Bearer client-key"))
        .insert_header(("X-Request-ID", "req-abc"))
        .set_payload(chat_body())
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 200);

    // The audit write runs detached; poll until it lands.
    let auditor = data.auditor.as_ref().unwrap();
    let mut entries = Vec::new();
    for _ in 0..100 {
        entries = auditor
            .query(&pario::models::AuditQueryOpts {
                request_id: Some("req-abc".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        if !entries.is_empty() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }

    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].model, "gpt-4");
    assert_eq!(entries[0].provider, "openai");
    assert_eq!(entries[0].status_code, 200);
    assert_eq!(entries[0].total_tokens, 15);
    assert_eq!(entries[0].api_key_prefix, "client-k");
    // The raw client key never lands in the audit store.
    assert!(!entries[0].request_headers.as_ref().unwrap().contains_key("authorization"));
}

#[actix_web::test]
async fn passthrough_forwards_raw_with_provider_credentials() {
    let upstream = MockUpstream::start(200, json!({"data": []})).await;
    let (config, _dir) = base_config(vec![provider(
        "test",
        &upstream.base_url,
        ProviderDialect::OpenAi,
    )]);
    let (data, app) = init_app!(config);

    let req = test::TestRequest::get()
        .uri("/v1/models")
        .insert_header(("Authorization", "Bearer client-key"))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 200);

    let seen = upstream.requests().await;
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].path, "/v1/models");
    assert_eq!(seen[0].headers.get("authorization").unwrap(), "Bearer sk-test");

    // No tracking on the passthrough path.
    assert!(records_for(&data.usage, "client-key").await.is_empty());
}

#[actix_web::test]
async fn passthrough_without_providers_is_unavailable() {
    let (config, _dir) = base_config(vec![]);
    let (_, app) = init_app!(config);

    let req = test::TestRequest::get().uri("/v1/models").to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 503);
}

#[actix_web::test]
async fn dialect_route_without_providers_is_a_bad_gateway() {
    let (config, _dir) = base_config(vec![]);
    let (_, app) = init_app!(config);

    let req = test::TestRequest::post()
        .uri("/v1/chat/completions")
        .insert_header(("Authorization", "Bearer client-key"))
        .set_payload(chat_body())
        .to_request();
    let resp = test::call_service(&app, req).await;

    assert_eq!(resp.status(), 502);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["error"]["message"], "no providers available");
}

#[actix_web::test]
async fn invalid_json_body_is_rejected() {
    let upstream = MockUpstream::start(200, openai_response()).await;
    let (config, _dir) = base_config(vec![provider(
        "test",
        &upstream.base_url,
        ProviderDialect::OpenAi,
    )]);
    let (_, app) = init_app!(config);

    let req = test::TestRequest::post()
        .uri("/v1/chat/completions")
        .insert_header(("Authorization", "Bearer client-key"))
        .set_payload("{not json")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 400);
}
