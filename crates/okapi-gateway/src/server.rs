//! HTTP surface: the `/_/` management API and the catch-all proxy.
//!
//! Management lives under `/_/proxy` (modules, tenants, enablement,
//! interface queries), `/_/discovery` (deployment addresses), and
//! `/_/version`.  Everything else falls through to the proxy, which
//! resolves a pipeline for the tenant named in `X-Okapi-Tenant` and
//! executes it.  `/_/invoke/tenant/{id}/...` does the same with the
//! tenant taken from the path instead of the header.

use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path, Query, Request, State};
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, delete, get, post};
use axum::Router;
use okapi_kernel::{
    GatewayError, GatewayResult, HttpMethod, InterfaceType, ModuleDescriptor, ProxyContext,
    ProxyRequest, ProxyResponse, TenantDescriptor, headers,
};
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::info;
use uuid::Uuid;

use crate::backend::DeploymentDescriptor;
use crate::error::{ApiError, ApiResult};
use crate::pipeline::{PipelineBuilder, PipelineExecutor};
use crate::state::AppState;

/// Proxied request bodies are buffered; larger payloads are rejected.
const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

// ─────────────────────────────────────────────────────────────────────────────
// Router / serve
// ─────────────────────────────────────────────────────────────────────────────

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/_/version", get(version))
        .route("/_/proxy/modules", post(create_module).get(list_modules))
        .route(
            "/_/proxy/modules/{id}",
            get(get_module).delete(delete_module),
        )
        .route("/_/proxy/tenants", post(create_tenant).get(list_tenants))
        .route(
            "/_/proxy/tenants/{id}",
            get(get_tenant).put(update_tenant).delete(delete_tenant),
        )
        .route(
            "/_/proxy/tenants/{id}/modules",
            get(list_tenant_modules).post(enable_module),
        )
        .route(
            "/_/proxy/tenants/{id}/modules/{module_id}",
            post(upgrade_module).delete(disable_module),
        )
        .route(
            "/_/proxy/tenants/{id}/interfaces",
            get(list_tenant_interfaces),
        )
        .route(
            "/_/proxy/tenants/{id}/interfaces/{interface_id}",
            get(list_interface_providers),
        )
        .route(
            "/_/discovery/modules",
            post(create_deployment).get(list_deployments),
        )
        .route("/_/discovery/modules/{id}", delete(delete_deployment))
        .route("/_/invoke/tenant/{tenant_id}/{*rest}", any(invoke_tenant))
        .fallback(proxy)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind and serve until the process is stopped.
pub async fn serve(state: Arc<AppState>) -> GatewayResult<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], state.config.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| GatewayError::Internal(format!("bind {addr}: {e}")))?;
    info!(%addr, "gateway listening");
    axum::serve(listener, router(state))
        .await
        .map_err(|e| GatewayError::Internal(format!("server: {e}")))
}

async fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

// ─────────────────────────────────────────────────────────────────────────────
// /_/proxy/modules
// ─────────────────────────────────────────────────────────────────────────────

async fn create_module(State(state): State<Arc<AppState>>, body: Bytes) -> ApiResult<Response> {
    let raw = std::str::from_utf8(&body)
        .map_err(|_| GatewayError::Validation("module descriptor is not UTF-8".to_string()))?;
    let md: ModuleDescriptor = serde_json::from_str(raw).map_err(|e| {
        GatewayError::Validation(format!("malformed module descriptor: {e}"))
    })?;
    let id = md.id.clone();

    let mut reg = state.registry.write().await;
    reg.register(md, raw.to_string())?;
    // Echo whatever is stored: the original registration on an idempotent
    // re-POST, the new body otherwise.
    let stored = reg
        .get(&id)
        .map(|s| s.raw.clone())
        .ok_or_else(|| GatewayError::Internal(format!("module '{id}' vanished")))?;
    Ok((
        StatusCode::CREATED,
        [
            (header::LOCATION, format!("/_/proxy/modules/{id}")),
            (header::CONTENT_TYPE, "application/json".to_string()),
        ],
        stored,
    )
        .into_response())
}

async fn list_modules(State(state): State<Arc<AppState>>) -> ApiResult<Json<Vec<Value>>> {
    let reg = state.registry.read().await;
    let mut out = Vec::new();
    for md in reg.list() {
        if let Some(stored) = reg.get(&md.id) {
            let v: Value = serde_json::from_str(&stored.raw).map_err(|e| {
                GatewayError::Internal(format!("stored module '{}' unreadable: {e}", md.id))
            })?;
            out.push(v);
        }
    }
    Ok(Json(out))
}

async fn get_module(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    let reg = state.registry.read().await;
    let stored = reg
        .get(&id)
        .ok_or_else(|| GatewayError::NotFound(format!("module '{id}'")))?;
    Ok((
        [(header::CONTENT_TYPE, "application/json")],
        stored.raw.clone(),
    )
        .into_response())
}

async fn delete_module(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    if let Some(tenant) = state.tenants.module_in_use(&id).await {
        return Err(GatewayError::Conflict(format!(
            "module '{id}' is enabled for tenant '{tenant}'"
        ))
        .into());
    }
    state.registry.write().await.unregister(&id)?;
    Ok(StatusCode::NO_CONTENT)
}

// ─────────────────────────────────────────────────────────────────────────────
// /_/proxy/tenants
// ─────────────────────────────────────────────────────────────────────────────

async fn create_tenant(
    State(state): State<Arc<AppState>>,
    Json(td): Json<TenantDescriptor>,
) -> ApiResult<Response> {
    let id = td.id.clone();
    state.tenants.insert(td.clone())?;
    Ok((
        StatusCode::CREATED,
        [(header::LOCATION, format!("/_/proxy/tenants/{id}"))],
        Json(td),
    )
        .into_response())
}

async fn list_tenants(State(state): State<Arc<AppState>>) -> Json<Vec<TenantDescriptor>> {
    Json(state.tenants.list())
}

async fn get_tenant(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<TenantDescriptor>> {
    Ok(Json(state.tenants.get(&id)?.descriptor.clone()))
}

async fn update_tenant(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(td): Json<TenantDescriptor>,
) -> ApiResult<Json<TenantDescriptor>> {
    if td.id != id {
        return Err(GatewayError::Validation(format!(
            "tenant id '{}' does not match path '{id}'",
            td.id
        ))
        .into());
    }
    state.tenants.update(td.clone()).await?;
    Ok(Json(td))
}

async fn delete_tenant(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    state.tenants.delete(&id)?;
    Ok(StatusCode::NO_CONTENT)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tenant enablement
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct TenantModule {
    id: String,
}

async fn list_tenant_modules(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let tenant = state.tenants.get(&id)?;
    let enabled = tenant.enabled().await;
    Ok(Json(json!(
        enabled.iter().map(|m| json!({ "id": m })).collect::<Vec<_>>()
    )))
}

/// Enable/disable/upgrade call into backends (`_tenant`,
/// `_tenantPermissions`), so they work on a registry snapshot — holding
/// the read guard across those awaits would stall module registration,
/// and with a write-preferring lock, all proxy traffic behind it.
async fn registry_snapshot(state: &AppState) -> crate::registry::ModuleRegistry {
    state.registry.read().await.clone()
}

async fn enable_module(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(tm): Json<TenantModule>,
) -> ApiResult<Response> {
    let reg = registry_snapshot(&state).await;
    state
        .tenants
        .enable(&id, &tm.id, &reg, &state.discovery, state.invoker.as_ref())
        .await?;
    Ok((StatusCode::CREATED, Json(json!({ "id": tm.id }))).into_response())
}

async fn disable_module(
    State(state): State<Arc<AppState>>,
    Path((id, module_id)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    let reg = registry_snapshot(&state).await;
    state
        .tenants
        .disable(&id, &module_id, &reg, &state.discovery, state.invoker.as_ref())
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `POST .../modules/{old}` with `{"id": "<new>"}` upgrades old → new
/// atomically, keeping the module's position in the enablement order.
async fn upgrade_module(
    State(state): State<Arc<AppState>>,
    Path((id, module_id)): Path<(String, String)>,
    Json(tm): Json<TenantModule>,
) -> ApiResult<Response> {
    let reg = registry_snapshot(&state).await;
    state
        .tenants
        .upgrade(&id, &module_id, &tm.id, &reg, &state.discovery, state.invoker.as_ref())
        .await?;
    Ok((StatusCode::CREATED, Json(json!({ "id": tm.id }))).into_response())
}

// ─────────────────────────────────────────────────────────────────────────────
// Interface queries
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct InterfaceQuery {
    full: Option<bool>,
    #[serde(rename = "type")]
    interface_type: Option<String>,
}

fn parse_type(s: Option<&str>) -> ApiResult<Option<InterfaceType>> {
    match s {
        None => Ok(None),
        Some("proxy") => Ok(Some(InterfaceType::Proxy)),
        Some("system") => Ok(Some(InterfaceType::System)),
        Some("multiple") => Ok(Some(InterfaceType::Multiple)),
        Some(other) => {
            Err(GatewayError::Validation(format!("unknown interface type '{other}'")).into())
        }
    }
}

async fn list_tenant_interfaces(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(q): Query<InterfaceQuery>,
) -> ApiResult<Json<Value>> {
    let type_filter = parse_type(q.interface_type.as_deref())?;
    let tenant = state.tenants.get(&id)?;
    let enabled = tenant.enabled().await;
    let reg = state.registry.read().await;
    let interfaces = reg.interfaces_of(&enabled, type_filter);
    let out = if q.full.unwrap_or(false) {
        json!(interfaces)
    } else {
        json!(
            interfaces
                .iter()
                .map(|i| json!({ "id": i.id, "version": i.version }))
                .collect::<Vec<_>>()
        )
    };
    Ok(Json(out))
}

async fn list_interface_providers(
    State(state): State<Arc<AppState>>,
    Path((id, interface_id)): Path<(String, String)>,
    Query(q): Query<InterfaceQuery>,
) -> ApiResult<Json<Value>> {
    let type_filter = parse_type(q.interface_type.as_deref())?;
    let tenant = state.tenants.get(&id)?;
    let enabled = tenant.enabled().await;
    let reg = state.registry.read().await;
    let providers = reg.providers_of(&enabled, &interface_id, type_filter);
    Ok(Json(json!(
        providers
            .iter()
            .map(|md| json!({ "id": md.id }))
            .collect::<Vec<_>>()
    )))
}

// ─────────────────────────────────────────────────────────────────────────────
// /_/discovery/modules
// ─────────────────────────────────────────────────────────────────────────────

async fn create_deployment(
    State(state): State<Arc<AppState>>,
    Json(dd): Json<DeploymentDescriptor>,
) -> ApiResult<Response> {
    state.discovery.register(dd.clone())?;
    Ok((StatusCode::CREATED, Json(dd)).into_response())
}

async fn list_deployments(State(state): State<Arc<AppState>>) -> Json<Vec<DeploymentDescriptor>> {
    Json(state.discovery.list())
}

async fn delete_deployment(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    state.discovery.unregister(&id)?;
    Ok(StatusCode::NO_CONTENT)
}

// ─────────────────────────────────────────────────────────────────────────────
// Proxy
// ─────────────────────────────────────────────────────────────────────────────

async fn proxy(State(state): State<Arc<AppState>>, req: Request) -> Response {
    do_proxy(state, req, None).await
}

async fn invoke_tenant(
    State(state): State<Arc<AppState>>,
    Path((tenant_id, rest)): Path<(String, String)>,
    req: Request,
) -> Response {
    let query = req
        .uri()
        .query()
        .map(|q| format!("?{q}"))
        .unwrap_or_default();
    let path = format!("/{rest}{query}");
    do_proxy_with(state, req, Some(tenant_id), Some(path)).await
}

async fn do_proxy(state: Arc<AppState>, req: Request, tenant_override: Option<String>) -> Response {
    do_proxy_with(state, req, tenant_override, None).await
}

async fn do_proxy_with(
    state: Arc<AppState>,
    req: Request,
    tenant_override: Option<String>,
    path_override: Option<String>,
) -> Response {
    let mut trace: Vec<String> = Vec::new();
    let result = run_proxy(&state, req, tenant_override, path_override, &mut trace).await;
    let mut response = match result {
        Ok(pr) => {
            let mut builder = Response::builder().status(pr.status);
            for (k, v) in &pr.headers {
                if matches!(k.as_str(), "content-length" | "transfer-encoding" | "connection") {
                    continue;
                }
                builder = builder.header(k.as_str(), v.as_str());
            }
            builder
                .body(axum::body::Body::from(pr.body))
                .unwrap_or_else(|_| {
                    ApiError(GatewayError::Internal("response assembly failed".to_string()))
                        .into_response()
                })
        }
        Err(e) => ApiError(e).into_response(),
    };
    for entry in &trace {
        if let Ok(v) = HeaderValue::from_str(entry) {
            response.headers_mut().append(headers::TRACE, v);
        }
    }
    response
}

/// Resolve and execute a pipeline for one proxied request.  The trace is
/// written through `trace` so it survives errors.
async fn run_proxy(
    state: &AppState,
    req: Request,
    tenant_override: Option<String>,
    path_override: Option<String>,
    trace: &mut Vec<String>,
) -> GatewayResult<ProxyResponse> {
    let (parts, body) = req.into_parts();
    let body = axum::body::to_bytes(body, MAX_BODY_BYTES)
        .await
        .map_err(|e| GatewayError::Validation(format!("reading request body: {e}")))?;

    let mut header_map: HashMap<String, String> = HashMap::new();
    for (k, v) in &parts.headers {
        if let Ok(v) = v.to_str() {
            header_map.insert(k.as_str().to_lowercase(), v.to_string());
        }
    }

    let tenant_id = match tenant_override {
        Some(t) => t,
        None => header_map.get(headers::TENANT).cloned().ok_or_else(|| {
            GatewayError::Validation("missing X-Okapi-Tenant header".to_string())
        })?,
    };
    let tenant = state.tenants.get(&tenant_id)?;
    let enabled = tenant.enabled().await;

    let method = HttpMethod::from_str_ci(parts.method.as_str()).ok_or_else(|| {
        GatewayError::Validation(format!("unsupported method '{}'", parts.method))
    })?;
    let path = path_override.unwrap_or_else(|| {
        parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| parts.uri.path().to_string())
    });
    let selector = header_map.get(headers::MODULE_ID).cloned();

    let request = ProxyRequest {
        id: Uuid::new_v4().to_string(),
        tenant: tenant_id,
        method,
        path,
        headers: header_map,
        body: body.to_vec(),
    };
    let mut ctx = ProxyContext::new(request);

    // Pipeline construction holds the registry read lock; execution does not.
    let pipeline = {
        let reg = state.registry.read().await;
        PipelineBuilder::new(&reg)
            .with_redirect_limit(state.config.redirect_limit)
            .build(
                &enabled,
                ctx.request.method.as_str(),
                ctx.request.route_path(),
                selector.as_deref(),
            )?
    };

    let executor = PipelineExecutor::new(
        &state.discovery,
        state.invoker.as_ref(),
        state.config.executor_config(),
    );
    let result = executor.execute(&pipeline, &mut ctx).await;
    *trace = ctx.trace;
    result
}
