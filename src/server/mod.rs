//! HTTP ingress for the pipeline.
//!
//! Public routes: the AI execute/tools surface, the selector search with
//! its TTL cache, read-only asset lookups, health, and metrics. The
//! `/internal/secrets/*` routes require the pre-shared service token and
//! must additionally be blocked at the ingress gateway; plaintext
//! passwords never leave this process either way. Every response carries
//! the request's trace id in both body and header.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::TcpListener;

use crate::assets::{AssetFacade, AssetFilters};
use crate::cache::{CacheKey, SelectorCache};
use crate::catalog::{Platform, SqliteToolIndex};
use crate::config::CoreConfig;
use crate::embedding::EmbeddingService;
use crate::error::{Error, Result};
use crate::metrics::CoreMetrics;
use crate::orchestrator::{Orchestrator, PipelineRequest};
use crate::trace::{TraceId, TRACE_HEADER};

/// Pre-shared internal service token header.
pub const INTERNAL_KEY_HEADER: &str = "x-internal-key";

/// Shared state behind every route.
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub index: Arc<SqliteToolIndex>,
    pub embeddings: Arc<EmbeddingService>,
    pub assets: Arc<dyn AssetFacade>,
    pub broker: Arc<crate::secrets::SecretsBroker>,
    pub cache: Arc<SelectorCache>,
    pub config: CoreConfig,
    pub metrics: Arc<CoreMetrics>,
}

/// Build the ingress router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ai/execute", post(ai_execute))
        .route("/ai/tools/execute", post(tools_execute))
        .route("/ai/tools/list", get(tools_list))
        .route("/api/selector/search", get(selector_search))
        .route("/assets/count", get(assets_count))
        .route("/assets/search", get(assets_search))
        .route("/assets/connection-profile", get(assets_connection_profile))
        .route("/health", get(health))
        .route("/metrics", get(metrics_text))
        .route("/internal/secrets/credential-upsert", post(secrets_upsert))
        .route("/internal/secrets/credential-lookup", post(secrets_lookup))
        .route("/internal/secrets/credential-delete", post(secrets_delete))
        .with_state(state)
}

/// Serve the router until the listener closes.
pub async fn serve(listener: TcpListener, state: Arc<AppState>) -> Result<()> {
    axum::serve(listener, build_router(state))
        .await
        .map_err(|e| Error::Internal(format!("server error: {e}")))
}

fn trace_from(headers: &HeaderMap, body_trace: Option<&str>) -> TraceId {
    let header = headers
        .get(TRACE_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.trim().is_empty());
    TraceId::from_header(header.or(body_trace))
}

fn json_response(status: StatusCode, trace: &TraceId, body: Value) -> Response {
    (
        status,
        [(TRACE_HEADER, trace.as_str().to_string())],
        Json(body),
    )
        .into_response()
}

fn error_response(trace: &TraceId, error: &Error, duration_ms: u64) -> Response {
    let status = StatusCode::from_u16(error.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    if status.is_server_error() {
        tracing::error!(trace_id = %trace, code = error.code(), error = %error, "request failed");
    } else {
        tracing::warn!(trace_id = %trace, code = error.code(), error = %error, "request rejected");
    }

    let mut error_body = json!({
        "code": error.code(),
        "message": error.to_string(),
    });
    if let Error::MissingInputs { descriptors, .. } = error {
        error_body["parameters"] = serde_json::to_value(descriptors).unwrap_or(Value::Null);
    }
    json_response(
        status,
        trace,
        json!({
            "success": false,
            "error": error_body,
            "trace_id": trace.as_str(),
            "duration_ms": duration_ms,
        }),
    )
}

// ==================== AI surface ====================

#[derive(Debug, Deserialize)]
struct AiExecuteBody {
    #[serde(default)]
    input: String,
    #[serde(default)]
    tool: Option<String>,
    #[serde(default)]
    trace_id: Option<String>,
}

async fn ai_execute(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<AiExecuteBody>,
) -> Response {
    let started = Instant::now();
    let trace = trace_from(&headers, body.trace_id.as_deref());

    let mut request = PipelineRequest::new(body.input, trace.clone());
    if let Some(tool) = body.tool {
        request = request.with_tool(tool);
    }

    match state.orchestrator.handle(request).await {
        Ok(outcome) => {
            let mut payload = json!({
                "success": true,
                "output": outcome.response_text,
                "trace_id": trace.as_str(),
                "duration_ms": outcome.duration_ms,
                "tool": outcome.tool,
                "response_type": outcome.response_type,
            });
            if let Some(selection) = &outcome.selection {
                if !selection.additional_inputs_needed.is_empty() {
                    payload["additional_inputs_needed"] =
                        serde_json::to_value(&selection.additional_inputs_needed)
                            .unwrap_or(Value::Null);
                }
            }
            json_response(StatusCode::OK, &trace, payload)
        }
        Err(e) => {
            state.metrics.record_ai_error(e.code(), "pipeline");
            error_response(&trace, &e, started.elapsed().as_millis() as u64)
        }
    }
}

#[derive(Debug, Deserialize)]
struct ToolExecuteBody {
    name: String,
    #[serde(default)]
    params: Value,
    #[serde(default)]
    trace_id: Option<String>,
}

async fn tools_execute(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<ToolExecuteBody>,
) -> Response {
    let started = Instant::now();
    let trace = trace_from(&headers, body.trace_id.as_deref());
    let params = if body.params.is_null() {
        json!({})
    } else {
        body.params
    };

    match state
        .orchestrator
        .execute_tool(&body.name, params, &trace)
        .await
    {
        Ok(output) => json_response(
            StatusCode::OK,
            &trace,
            json!({
                "success": true,
                "tool": body.name,
                "output": output,
                "trace_id": trace.as_str(),
                "duration_ms": started.elapsed().as_millis() as u64,
                "exit_code": 0,
            }),
        ),
        Err(e) => error_response(&trace, &e, started.elapsed().as_millis() as u64),
    }
}

async fn tools_list(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let trace = trace_from(&headers, None);

    let platform = match params.get("platform").filter(|p| !p.is_empty()) {
        Some(raw) => match Platform::parse(raw) {
            Some(p) => Some(p),
            None => {
                return error_response(
                    &trace,
                    &Error::validation(format!("unknown platform {raw}")),
                    0,
                )
            }
        },
        None => None,
    };
    let tag_filters: Vec<String> = params
        .get("tags")
        .into_iter()
        .chain(params.get("category"))
        .flat_map(|t| t.split(','))
        .map(|t| t.trim().to_lowercase())
        .filter(|t| !t.is_empty())
        .collect();

    match state.index.list_entries(platform) {
        Ok(entries) => {
            let tools: Vec<Value> = entries
                .iter()
                .filter(|e| {
                    tag_filters.is_empty()
                        || tag_filters.iter().all(|f| {
                            e.tags.iter().any(|t| t.to_lowercase() == *f)
                        })
                })
                .map(|e| serde_json::to_value(e.minimal_row()).unwrap_or(Value::Null))
                .collect();
            json_response(
                StatusCode::OK,
                &trace,
                json!({"tools": tools, "count": tools.len(), "trace_id": trace.as_str()}),
            )
        }
        Err(e) => error_response(&trace, &e, 0),
    }
}

// ==================== Selector search ====================

async fn selector_search(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let started = Instant::now();
    let trace = trace_from(&headers, None);

    let query = params.get("query").map(String::as_str).unwrap_or("").trim();
    if query.is_empty() {
        return error_response(&trace, &Error::validation("query must not be empty"), 0);
    }
    let k: usize = match params.get("k").map(String::as_str) {
        None => 5,
        Some(raw) => match raw.parse() {
            Ok(k) => k,
            Err(_) => return error_response(&trace, &Error::validation("k must be an integer"), 0),
        },
    };
    if k == 0 || k > 10 {
        return error_response(&trace, &Error::validation("k must be in 1..=10"), 0);
    }
    let platform_names: Vec<String> = params
        .get("platform")
        .map(|p| {
            p.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default();
    if platform_names.len() > 5 {
        return error_response(&trace, &Error::validation("at most 5 platforms"), 0);
    }
    let mut platforms: Vec<Platform> = Vec::new();
    for name in &platform_names {
        match Platform::parse(name) {
            Some(p) => platforms.push(p),
            None => {
                return error_response(
                    &trace,
                    &Error::validation(format!("unknown platform {name}")),
                    0,
                )
            }
        }
    }

    let key = CacheKey::generate(query, &platform_names, k);
    if let Some(cached) = state.cache.get(&key).await {
        let stats = state.cache.stats().await;
        state
            .metrics
            .set_cache_state(stats.entries as i64, state.cache.ttl_seconds());
        state
            .metrics
            .record_selector_request("success", "cache", started.elapsed());
        return json_response(
            StatusCode::OK,
            &trace,
            json!({
                "candidates": cached,
                "from_cache": true,
                "duration_ms": started.elapsed().as_millis() as u64,
                "trace_id": trace.as_str(),
            }),
        );
    }

    // Degraded mode serves warm keys only; cold keys are asked to retry.
    if state.config.selector_degraded_enable {
        state
            .metrics
            .record_selector_request("degraded", "cache", started.elapsed());
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            [
                (TRACE_HEADER, trace.as_str().to_string()),
                ("Retry-After", "30".to_string()),
            ],
            Json(json!({
                "success": false,
                "error": {"code": "degraded", "message": "selector degraded, cold key"},
                "trace_id": trace.as_str(),
            })),
        )
            .into_response();
    }

    let candidates = match run_search(&state, query, &platforms, k).await {
        Ok(candidates) => candidates,
        Err(e) => {
            state.metrics.inc_selector_db_error();
            return error_response(&trace, &e, started.elapsed().as_millis() as u64);
        }
    };
    state.cache.put(key, candidates.clone()).await;

    let stats = state.cache.stats().await;
    state
        .metrics
        .set_cache_state(stats.entries as i64, state.cache.ttl_seconds());
    state
        .metrics
        .record_selector_request("success", "search", started.elapsed());

    json_response(
        StatusCode::OK,
        &trace,
        json!({
            "candidates": candidates,
            "from_cache": false,
            "duration_ms": started.elapsed().as_millis() as u64,
            "trace_id": trace.as_str(),
        }),
    )
}

/// Vector+lexical union over the requested platforms, best score per tool.
async fn run_search(
    state: &AppState,
    query: &str,
    platforms: &[Platform],
    k: usize,
) -> Result<Value> {
    let query_vec = match state.embeddings.embed_query(query).await {
        Ok(v) => Some(v),
        Err(e) => {
            tracing::warn!(error = %e, "query embedding failed, lexical only");
            None
        }
    };

    let scopes: Vec<Option<Platform>> = if platforms.is_empty() {
        vec![None]
    } else {
        platforms.iter().copied().map(Some).collect()
    };

    let mut best: HashMap<String, (Value, f32)> = HashMap::new();
    for scope in scopes {
        if let Some(v) = &query_vec {
            for hit in state.index.vector_search(v, scope, k * 4)? {
                merge_hit(&mut best, &hit.entry, hit.similarity);
            }
        }
        let lexical = state.index.lexical_search(query, scope, k * 4)?;
        let max_lex = lexical.first().map(|h| h.similarity).unwrap_or(1.0).max(1.0);
        for hit in lexical {
            merge_hit(&mut best, &hit.entry, hit.similarity / max_lex);
        }
    }

    let mut ranked: Vec<(Value, f32)> = best.into_values().collect();
    ranked.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0["id"].as_str().cmp(&b.0["id"].as_str()))
    });
    ranked.truncate(k);

    Ok(Value::Array(
        ranked
            .into_iter()
            .map(|(mut row, score)| {
                row["score"] = json!(score);
                row
            })
            .collect(),
    ))
}

fn merge_hit(
    best: &mut HashMap<String, (Value, f32)>,
    entry: &crate::catalog::ToolIndexEntry,
    score: f32,
) {
    let score = score.clamp(0.0, 1.0);
    let row = serde_json::to_value(entry.minimal_row()).unwrap_or(Value::Null);
    best.entry(entry.id.clone())
        .and_modify(|(_, s)| *s = s.max(score))
        .or_insert((row, score));
}

// ==================== Assets ====================

fn filters_from(params: &HashMap<String, String>) -> AssetFilters {
    AssetFilters {
        os: params.get("os").cloned(),
        hostname: params.get("hostname").cloned(),
        ip: params.get("ip").cloned(),
        status: params.get("status").cloned(),
        environment: params.get("environment").cloned(),
        tag: params.get("tag").cloned(),
    }
}

async fn assets_count(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let trace = trace_from(&headers, None);
    match state.assets.count_assets(&filters_from(&params)).await {
        Ok(count) => json_response(
            StatusCode::OK,
            &trace,
            json!({"count": count, "trace_id": trace.as_str()}),
        ),
        Err(e) => error_response(&trace, &e, 0),
    }
}

async fn assets_search(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let trace = trace_from(&headers, None);
    let limit = params
        .get("limit")
        .and_then(|l| l.parse().ok())
        .unwrap_or(50);
    match state.assets.search_assets(&filters_from(&params), limit).await {
        Ok(assets) => {
            let count = assets.len();
            json_response(
                StatusCode::OK,
                &trace,
                json!({"assets": assets, "count": count, "trace_id": trace.as_str()}),
            )
        }
        Err(e) => error_response(&trace, &e, 0),
    }
}

async fn assets_connection_profile(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let trace = trace_from(&headers, None);
    let Some(host) = params.get("host").filter(|h| !h.trim().is_empty()) else {
        return error_response(&trace, &Error::validation("host is required"), 0);
    };
    match state.assets.connection_profile(host).await {
        Ok(profile) => {
            let mut body = serde_json::to_value(profile).unwrap_or(Value::Null);
            body["trace_id"] = json!(trace.as_str());
            json_response(StatusCode::OK, &trace, body)
        }
        Err(e) => error_response(&trace, &e, 0),
    }
}

// ==================== Operational ====================

async fn health(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let trace = trace_from(&headers, None);
    let index_status = match state.index.catalog_size() {
        Ok(size) => json!({"status": "ok", "catalog_size": size}),
        Err(e) => json!({"status": "error", "message": e.to_string()}),
    };
    json_response(
        StatusCode::OK,
        &trace,
        json!({
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION"),
            "bypass_llm": state.config.bypass_llm,
            "dependencies": {"tool_index": index_status},
            "trace_id": trace.as_str(),
        }),
    )
}

async fn metrics_text(State(state): State<Arc<AppState>>) -> Response {
    let stats = state.cache.stats().await;
    state
        .metrics
        .set_cache_state(stats.entries as i64, state.cache.ttl_seconds());
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
        .into_response()
}

// ==================== Internal secrets ====================

fn check_internal_key(state: &AppState, headers: &HeaderMap) -> Result<()> {
    let provided = headers
        .get(INTERNAL_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if provided.is_empty() || provided != state.config.internal_key {
        return Err(Error::Unauthorized(
            "missing or invalid internal key".to_string(),
        ));
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
struct CredentialUpsertBody {
    host: String,
    purpose: String,
    username: String,
    password: String,
    #[serde(default)]
    domain: Option<String>,
}

async fn secrets_upsert(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<CredentialUpsertBody>,
) -> Response {
    let trace = trace_from(&headers, None);
    if let Err(e) = check_internal_key(&state, &headers) {
        return error_response(&trace, &e, 0);
    }
    match state.broker.upsert_credential(
        "internal-api",
        &body.host,
        &body.purpose,
        &body.username,
        &body.password,
        body.domain.as_deref(),
    ) {
        Ok(()) => json_response(
            StatusCode::OK,
            &trace,
            json!({"success": true, "trace_id": trace.as_str()}),
        ),
        Err(e) => error_response(&trace, &e, 0),
    }
}

#[derive(Debug, Deserialize)]
struct CredentialRefBody {
    host: String,
    purpose: String,
}

async fn secrets_lookup(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<CredentialRefBody>,
) -> Response {
    let trace = trace_from(&headers, None);
    if let Err(e) = check_internal_key(&state, &headers) {
        return error_response(&trace, &e, 0);
    }
    match state
        .broker
        .lookup_credential("internal-api", &body.host, &body.purpose)
    {
        // The plaintext stays in-process: HTTP callers get existence and
        // identity only.
        Ok(credential) => json_response(
            StatusCode::OK,
            &trace,
            json!({
                "found": true,
                "username": credential.username,
                "domain": credential.domain,
                "trace_id": trace.as_str(),
            }),
        ),
        Err(e) => error_response(&trace, &e, 0),
    }
}

async fn secrets_delete(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<CredentialRefBody>,
) -> Response {
    let trace = trace_from(&headers, None);
    if let Err(e) = check_internal_key(&state, &headers) {
        return error_response(&trace, &e, 0);
    }
    match state
        .broker
        .delete_credential("internal-api", &body.host, &body.purpose)
    {
        Ok(()) => json_response(
            StatusCode::OK,
            &trace,
            json!({"success": true, "trace_id": trace.as_str()}),
        ),
        Err(e) => error_response(&trace, &e, 0),
    }
}
