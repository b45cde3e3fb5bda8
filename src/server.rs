//! HTTP surface and request pipeline.
//!
//! One pipeline shape serves both wire dialects: authenticate, decode,
//! cache lookup, budget check, route resolution, the upstream fallback
//! loop, session resolution, usage accounting, cache store, audit
//! emission, response relay. Streaming requests branch into the SSE relay
//! after route resolution. Anything that is not a dialect path is
//! reverse-proxied raw to the first provider.

use actix_web::http::header::{HeaderName, HeaderValue};
use actix_web::http::{Method, StatusCode};
use actix_web::{web, App, HttpRequest, HttpResponse, HttpResponseBuilder, HttpServer};
use bytes::Bytes;
use chrono::Utc;
use futures_util::{StreamExt, TryStreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::warn;

use crate::audit::{hash_api_key, AuditLogger};
use crate::budget::{BudgetError, Enforcer};
use crate::cache::{hash_prompt, CacheStore};
use crate::config::Config;
use crate::models::{
    AnthropicRequest, AuditEntry, ChatCompletionRequest, ChatMessage, CostLabel, Dialect, Usage,
    UsageRecord,
};
use crate::relay::{SseRelay, StreamOutcome};
use crate::router::Router;
use crate::upstream::{self, UpstreamResponse};
use crate::usage::UsageStore;
use crate::util::{build_http_client, error_response};

/// Shared application state: configuration, the three stores, the router,
/// and the outbound HTTP client. Cache, budget, and audit are optional and
/// simply skipped when disabled.
pub struct AppState {
    pub http: reqwest::Client,
    pub config: Config,
    pub usage: UsageStore,
    pub cache: Option<CacheStore>,
    pub enforcer: Option<Arc<Enforcer>>,
    pub auditor: Option<Arc<AuditLogger>>,
    pub router: Router,
}

impl AppState {
    /// Wire up stores and the router from configuration. The usage, cache,
    /// and audit databases are three physically separate files.
    pub async fn from_config(config: Config) -> anyhow::Result<Self> {
        let usage = UsageStore::new(&format!("sqlite:{}", config.db_path)).await?;

        let cache = if config.cache.enabled {
            Some(CacheStore::new(&format!("sqlite:{}", config.cache_db_path), config.cache.ttl()).await?)
        } else {
            None
        };

        let enforcer = if config.budget.enabled {
            Some(Arc::new(Enforcer::new(
                config.budget.policies.clone(),
                usage.clone(),
            )))
        } else {
            None
        };

        let auditor = if config.audit.enabled {
            Some(Arc::new(
                AuditLogger::new(&format!("sqlite:{}", config.audit.db_path), config.audit.clone())
                    .await?,
            ))
        } else {
            None
        };

        let router = Router::new(config.providers.clone(), config.router.routes.clone());

        Ok(Self {
            http: build_http_client(),
            config,
            usage,
            cache,
            enforcer,
            auditor,
            router,
        })
    }
}

/// Mount the dialect routes and the passthrough fallback.
pub fn config_routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/v1/chat/completions", web::to(chat_completions))
        .route("/v1/messages", web::to(messages))
        .default_service(web::to(passthrough));
}

/// Run the proxy until shutdown, allowing in-flight handlers up to five
/// seconds to finish.
pub async fn run(state: AppState) -> std::io::Result<()> {
    let listen = state.config.listen.clone();
    let data = web::Data::new(state);

    tracing::info!("pario proxy listening on {}", listen);
    HttpServer::new(move || App::new().app_data(data.clone()).configure(config_routes))
        .bind(listen)?
        .shutdown_timeout(5)
        .run()
        .await
}

async fn chat_completions(
    state: web::Data<AppState>,
    req: HttpRequest,
    payload: web::Payload,
) -> HttpResponse {
    handle_dialect(&state, &req, payload, Dialect::OpenAi).await
}

async fn messages(
    state: web::Data<AppState>,
    req: HttpRequest,
    payload: web::Payload,
) -> HttpResponse {
    handle_dialect(&state, &req, payload, Dialect::Anthropic).await
}

/// The model, messages, and streaming flag a dialect request decodes to.
struct DecodedRequest {
    model: String,
    messages: Vec<ChatMessage>,
    stream: bool,
}

fn decode_request(dialect: Dialect, body: &[u8]) -> Result<DecodedRequest, serde_json::Error> {
    match dialect {
        Dialect::OpenAi => {
            let req: ChatCompletionRequest = serde_json::from_slice(body)?;
            Ok(DecodedRequest {
                model: req.model,
                messages: req.messages,
                stream: req.stream,
            })
        }
        Dialect::Anthropic => {
            let req: AnthropicRequest = serde_json::from_slice(body)?;
            Ok(DecodedRequest {
                model: req.model,
                messages: req.messages,
                stream: req.stream,
            })
        }
    }
}

async fn handle_dialect(
    state: &AppState,
    req: &HttpRequest,
    payload: web::Payload,
    dialect: Dialect,
) -> HttpResponse {
    if req.method() != Method::POST {
        return error_response(StatusCode::METHOD_NOT_ALLOWED, "method not allowed");
    }

    let client_key = extract_api_key(req);
    if client_key.is_empty() {
        return error_response(StatusCode::UNAUTHORIZED, "missing API key");
    }

    let body = match read_body(payload).await {
        Ok(body) => body,
        Err(_) => return error_response(StatusCode::BAD_REQUEST, "failed to read request body"),
    };

    let decoded = match decode_request(dialect, &body) {
        Ok(decoded) => decoded,
        Err(_) => return error_response(StatusCode::BAD_REQUEST, "invalid request body"),
    };

    // Cache lookup. A hit short-circuits everything: no budget charge, no
    // usage record, no audit entry.
    if !decoded.stream {
        if let Some(cache) = &state.cache {
            let hash = hash_prompt(&decoded.model, &decoded.messages);
            if let Some(cached) = cache.get(&hash, &decoded.model).await {
                return HttpResponse::Ok()
                    .content_type("application/json")
                    .insert_header(("X-Pario-Cache", "hit"))
                    .body(cached);
            }
        }
    }

    // Budget check against the requested model name, which for aliases may
    // differ from the model usage is later recorded under.
    if let Some(enforcer) = &state.enforcer {
        match enforcer.check(&client_key, &decoded.model).await {
            Ok(()) => {}
            Err(BudgetError::Exceeded) => {
                return error_response(StatusCode::TOO_MANY_REQUESTS, "token budget exceeded");
            }
            Err(BudgetError::Storage(e)) => {
                warn!("budget check error: {}", e);
                return error_response(StatusCode::INTERNAL_SERVER_ERROR, "budget check failed");
            }
        }
    }

    let routes = match state.router.resolve(&decoded.model) {
        Ok(routes) => routes,
        Err(e) => {
            warn!("route resolution failed: {}", e);
            return error_response(StatusCode::BAD_GATEWAY, "no providers available");
        }
    };

    let req_start = Instant::now();

    if decoded.stream {
        return handle_streaming(state, req, &client_key, body, &routes, dialect, req_start).await;
    }

    // Upstream fallback loop: transport errors and 5xx advance to the next
    // route (the last 5xx is retained); anything below 500 is final.
    let anthropic_version = header_value(req, "anthropic-version");
    let mut result: Option<UpstreamResponse> = None;
    for route in &routes {
        let req_body = rewrite_model(&body, &route.model);
        let headers =
            credential_headers(dialect, &route.provider.api_key, anthropic_version.as_deref());
        match upstream::send_buffered(
            &state.http,
            &route.provider.url,
            dialect.path(),
            &headers,
            req_body,
        )
        .await
        {
            Err(e) => {
                warn!("upstream {} failed: {}, trying next", route.provider.name, e);
            }
            Ok(res) if res.status.as_u16() >= 500 => {
                warn!(
                    "upstream {} returned {}, trying next",
                    route.provider.name, res.status
                );
                result = Some(res);
            }
            Ok(res) => {
                result = Some(res);
                break;
            }
        }
    }

    let Some(result) = result else {
        return error_response(StatusCode::BAD_GATEWAY, "all upstream providers failed");
    };

    let session_id = resolve_session(state, req, &client_key).await;

    // Usage accounting and cache store, on success only. The record uses
    // the model echoed by the provider; the cache key keeps the requested
    // model so hits survive routing changes.
    let mut usage: Option<Usage> = None;
    if result.status == reqwest::StatusCode::OK {
        if let Some((echoed_model, parsed)) = dialect.extract_usage(&result.body) {
            usage = Some(parsed);
            let labels = resolve_labels(&state.config, req, &client_key);
            let record = UsageRecord {
                id: 0,
                api_key: client_key.clone(),
                model: echoed_model,
                session_id: session_id.clone(),
                prompt_tokens: parsed.prompt_tokens,
                completion_tokens: parsed.completion_tokens,
                total_tokens: parsed.total_tokens,
                team: labels.team,
                project: labels.project,
                env: labels.env,
                created_at: Utc::now(),
            };
            if let Err(e) = state.usage.record(&record).await {
                warn!("usage record error: {}", e);
            }

            if let Some(cache) = &state.cache {
                let hash = hash_prompt(&decoded.model, &decoded.messages);
                if let Err(e) = cache.put(&hash, &decoded.model, &result.body).await {
                    warn!("cache put error: {}", e);
                }
            }
        }
    }

    // Audit emission happens on a detached task; the response never waits
    // on audit persistence.
    if let Some(auditor) = &state.auditor {
        let (api_key_hash, api_key_prefix) = hash_api_key(&client_key);
        let usage = usage.unwrap_or_default();
        let entry = AuditEntry {
            request_id: header_value(req, "X-Request-ID").unwrap_or_default(),
            api_key_hash,
            api_key_prefix,
            model: decoded.model.clone(),
            session_id: session_id.clone(),
            provider: dialect.provider_tag().to_string(),
            request_body: String::from_utf8_lossy(&body).into_owned(),
            response_body: String::from_utf8_lossy(&result.body).into_owned(),
            request_headers: Some(collect_headers(req)),
            status_code: result.status.as_u16() as i64,
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            total_tokens: usage.total_tokens,
            latency_ms: req_start.elapsed().as_millis() as i64,
            created_at: Some(Utc::now()),
        };
        let auditor = auditor.clone();
        tokio::spawn(async move {
            if let Err(e) = auditor.log(entry).await {
                warn!("audit log error: {}", e);
            }
        });
    }

    // Relay the upstream response, including a retained 5xx. The cache
    // header reads "miss" on this path even for upstream errors.
    let status = StatusCode::from_u16(result.status.as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut builder = HttpResponse::build(status);
    copy_upstream_headers(&mut builder, &result.headers);
    if !session_id.is_empty() {
        builder.insert_header(("X-Pario-Session", session_id));
    }
    builder.insert_header(("X-Pario-Cache", "miss"));
    builder.body(result.body)
}

#[allow(clippy::too_many_arguments)]
async fn handle_streaming(
    state: &AppState,
    req: &HttpRequest,
    client_key: &str,
    body: Bytes,
    routes: &[crate::router::Route],
    dialect: Dialect,
    req_start: Instant,
) -> HttpResponse {
    let anthropic_version = header_value(req, "anthropic-version");

    let mut accepted: Option<reqwest::Response> = None;
    for route in routes {
        let req_body = rewrite_model(&body, &route.model);
        let headers =
            credential_headers(dialect, &route.provider.api_key, anthropic_version.as_deref());
        match upstream::send_streaming(
            &state.http,
            &route.provider.url,
            dialect.path(),
            &headers,
            req_body,
        )
        .await
        {
            Err(e) => {
                warn!("upstream {} failed: {}, trying next", route.provider.name, e);
            }
            Ok(res) if res.status().as_u16() >= 500 => {
                warn!(
                    "upstream {} returned {}, trying next",
                    route.provider.name,
                    res.status()
                );
                drop(res);
            }
            Ok(res) => {
                accepted = Some(res);
                break;
            }
        }
    }

    let Some(upstream_resp) = accepted else {
        return error_response(StatusCode::BAD_GATEWAY, "all upstream providers failed");
    };

    let session_id = resolve_session(state, req, client_key).await;
    let labels = resolve_labels(&state.config, req, client_key);
    let upstream_status = upstream_resp.status();

    let status =
        StatusCode::from_u16(upstream_status.as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut builder = HttpResponse::build(status);
    copy_upstream_headers(&mut builder, upstream_resp.headers());
    if !session_id.is_empty() {
        builder.insert_header(("X-Pario-Session", session_id.clone()));
    }

    // Everything the end-of-stream task needs, captured up front so the
    // detached task keeps no reference to the inbound request.
    let usage_store = state.usage.clone();
    let auditor = state.auditor.clone();
    let client_key = client_key.to_string();
    let provider_tag = dialect.provider_tag().to_string();
    let request_id = header_value(req, "X-Request-ID").unwrap_or_default();
    let request_headers = collect_headers(req);
    let mut request_body = String::from_utf8_lossy(&body).into_owned();
    if request_body.len() > 8192 {
        let mut end = 8192;
        while !request_body.is_char_boundary(end) {
            end -= 1;
        }
        request_body.truncate(end);
    }

    let finalize = Box::new(move |outcome: StreamOutcome| {
        tokio::spawn(async move {
            if let Some(usage) = outcome.accounting.usage {
                let record = UsageRecord {
                    id: 0,
                    api_key: client_key.clone(),
                    model: outcome.accounting.model.clone(),
                    session_id: session_id.clone(),
                    prompt_tokens: usage.prompt_tokens,
                    completion_tokens: usage.completion_tokens,
                    total_tokens: usage.total_tokens,
                    team: labels.team,
                    project: labels.project,
                    env: labels.env,
                    created_at: Utc::now(),
                };
                if let Err(e) = usage_store.record(&record).await {
                    warn!("usage record error: {}", e);
                }
            }

            if let Some(auditor) = auditor {
                let (api_key_hash, api_key_prefix) = hash_api_key(&client_key);
                let usage = outcome.accounting.usage.unwrap_or_default();
                let entry = AuditEntry {
                    request_id,
                    api_key_hash,
                    api_key_prefix,
                    model: outcome.accounting.model,
                    session_id,
                    provider: provider_tag,
                    request_body,
                    response_body: outcome.response_body,
                    request_headers: Some(request_headers),
                    status_code: upstream_status.as_u16() as i64,
                    prompt_tokens: usage.prompt_tokens,
                    completion_tokens: usage.completion_tokens,
                    total_tokens: usage.total_tokens,
                    latency_ms: req_start.elapsed().as_millis() as i64,
                    created_at: Some(Utc::now()),
                };
                if let Err(e) = auditor.log(entry).await {
                    warn!("audit log error: {}", e);
                }
            }
        });
    });

    let byte_stream = upstream_resp
        .bytes_stream()
        .map_err(|e| std::io::Error::other(e.to_string()))
        .boxed();

    builder.streaming(SseRelay::new(byte_stream, dialect, finalize))
}

/// Raw reverse proxy for non-dialect paths: forward to the first provider
/// with its credential header overwritten. No tracking, caching, budget,
/// audit, or session logic applies here.
async fn passthrough(
    state: web::Data<AppState>,
    req: HttpRequest,
    payload: web::Payload,
) -> HttpResponse {
    let Some(provider) = state.config.providers.first() else {
        return error_response(StatusCode::SERVICE_UNAVAILABLE, "no providers configured");
    };
    if reqwest::Url::parse(&provider.url).is_err() {
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, "invalid provider URL");
    }

    let body = match read_body(payload).await {
        Ok(body) => body,
        Err(_) => return error_response(StatusCode::BAD_REQUEST, "failed to read request body"),
    };

    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let url = format!("{}{}", provider.url.trim_end_matches('/'), path_and_query);
    let method = reqwest::Method::from_bytes(req.method().as_str().as_bytes())
        .unwrap_or(reqwest::Method::GET);

    let mut outbound = state.http.request(method, &url);
    for (name, value) in req.headers() {
        let name = name.as_str();
        if matches!(
            name,
            "host" | "connection" | "content-length" | "authorization" | "x-api-key"
        ) {
            continue;
        }
        if let Ok(value) = value.to_str() {
            outbound = outbound.header(name, value);
        }
    }
    outbound = outbound.header("authorization", format!("Bearer {}", provider.api_key));

    match outbound.body(body).send().await {
        Ok(up) => {
            let status = StatusCode::from_u16(up.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
            let mut builder = HttpResponse::build(status);
            copy_upstream_headers(&mut builder, up.headers());
            let stream = up
                .bytes_stream()
                .map_err(|e| std::io::Error::other(e.to_string()))
                .boxed();
            builder.streaming(stream)
        }
        Err(e) => error_response(StatusCode::BAD_GATEWAY, &format!("upstream error: {}", e)),
    }
}

async fn read_body(mut payload: web::Payload) -> Result<Bytes, actix_web::error::PayloadError> {
    let mut body = web::BytesMut::new();
    while let Some(chunk) = payload.next().await {
        body.extend_from_slice(&chunk?);
    }
    Ok(body.freeze())
}

/// Client identity comes from `Authorization: Bearer …` or `x-api-key`.
fn extract_api_key(req: &HttpRequest) -> String {
    if let Some(auth) = header_value(req, "Authorization") {
        if let Some(token) = auth.strip_prefix("Bearer ") {
            return token.to_string();
        }
    }
    header_value(req, "x-api-key").unwrap_or_default()
}

fn header_value(req: &HttpRequest, name: &str) -> Option<String> {
    req.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
        .filter(|v| !v.is_empty())
}

/// Replace the top-level `model` field of a JSON object body, leaving all
/// other fields untouched. Bodies that do not parse as objects pass through
/// unchanged.
fn rewrite_model(body: &[u8], model: &str) -> Bytes {
    let Ok(mut value) = serde_json::from_slice::<serde_json::Value>(body) else {
        return Bytes::copy_from_slice(body);
    };
    let Some(obj) = value.as_object_mut() else {
        return Bytes::copy_from_slice(body);
    };
    obj.insert(
        "model".to_string(),
        serde_json::Value::String(model.to_string()),
    );
    match serde_json::to_vec(&value) {
        Ok(rewritten) => Bytes::from(rewritten),
        Err(_) => Bytes::copy_from_slice(body),
    }
}

/// Credential headers for one upstream attempt, per dialect.
fn credential_headers(
    dialect: Dialect,
    provider_key: &str,
    anthropic_version: Option<&str>,
) -> HashMap<String, String> {
    let mut headers = HashMap::new();
    match dialect {
        Dialect::OpenAi => {
            headers.insert("Authorization".to_string(), format!("Bearer {}", provider_key));
        }
        Dialect::Anthropic => {
            headers.insert("x-api-key".to_string(), provider_key.to_string());
            if let Some(version) = anthropic_version {
                headers.insert("anthropic-version".to_string(), version.to_string());
            }
        }
    }
    headers
}

/// Attribution precedence: any non-empty `X-Pario-*` header wins; the
/// configured `key_labels` apply only when all three headers are empty.
fn resolve_labels(config: &Config, req: &HttpRequest, client_key: &str) -> CostLabel {
    let team = header_value(req, "X-Pario-Team").unwrap_or_default();
    let project = header_value(req, "X-Pario-Project").unwrap_or_default();
    let env = header_value(req, "X-Pario-Env").unwrap_or_default();

    if team.is_empty() && project.is_empty() && env.is_empty() {
        if let Some(labels) = config.attribution.key_labels.get(client_key) {
            return labels.clone();
        }
    }
    CostLabel { team, project, env }
}

async fn resolve_session(state: &AppState, req: &HttpRequest, client_key: &str) -> String {
    let explicit = header_value(req, "X-Pario-Session").unwrap_or_default();
    match state
        .usage
        .resolve_session(client_key, &explicit, state.config.session.gap_timeout())
        .await
    {
        Ok(session_id) => session_id,
        Err(e) => {
            warn!("session resolve error: {}", e);
            String::new()
        }
    }
}

/// Inbound headers captured for audit metadata; client credentials are
/// never persisted.
fn collect_headers(req: &HttpRequest) -> HashMap<String, String> {
    req.headers()
        .iter()
        .filter(|(name, _)| {
            let name = name.as_str();
            name != "authorization" && name != "x-api-key"
        })
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect()
}

/// Copy upstream response headers onto the client response. Hop-by-hop
/// headers are recomputed by the server and skipped here.
fn copy_upstream_headers(builder: &mut HttpResponseBuilder, headers: &reqwest::header::HeaderMap) {
    for (name, value) in headers {
        let name_str = name.as_str();
        if matches!(name_str, "connection" | "transfer-encoding" | "content-length") {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name_str.as_bytes()),
            HeaderValue::from_bytes(value.as_bytes()),
        ) {
            builder.append_header((name, value));
        }
    }
}
