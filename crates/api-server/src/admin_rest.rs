//! Tenant admin endpoints: config/rules documents, cache invalidation,
//! the admin audit log and the live recommendation config.

use crate::error::ApiError;
use crate::extract::{ApiJson, ApiQuery, ReqContext};
use crate::state::AppState;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, HeaderValue};
use axum::response::{IntoResponse, Response};
use axum::Json;
use recsys_core::types::{AuditQuery, TenantDocument};
use recsys_core::{ConfigSnapshot, RecommendationConfig};
use recsys_management::{AuditLog, CacheInvalidateRequest, CacheInvalidateResult};
use serde::Deserialize;
use std::time::Duration;
use tracing::info;

fn if_match(headers: &HeaderMap) -> Option<&str> {
    headers.get(header::IF_MATCH).and_then(|v| v.to_str().ok())
}

fn with_etag(doc: TenantDocument) -> Response {
    let mut response = Json(&doc).into_response();
    if let Ok(value) = HeaderValue::from_str(&doc.version) {
        response.headers_mut().insert(header::ETAG, value);
    }
    response
}

/// GET /v1/admin/tenants/:tenant_id/config
pub async fn get_tenant_config(
    State(state): State<AppState>,
    Path(tenant): Path<String>,
    rc: ReqContext,
) -> Result<Response, ApiError> {
    let rc = rc.for_tenant(&tenant);
    let doc = state
        .admin
        .get_tenant_config(&rc.ctx, rc.tenant())
        .await
        .map_err(rc.fail())?;
    Ok(with_etag(doc))
}

/// PUT /v1/admin/tenants/:tenant_id/config
pub async fn put_tenant_config(
    State(state): State<AppState>,
    Path(tenant): Path<String>,
    headers: HeaderMap,
    rc: ReqContext,
    ApiJson(document): ApiJson<serde_json::Value>,
) -> Result<Response, ApiError> {
    let rc = rc.for_tenant(&tenant);
    let doc = state
        .admin
        .update_tenant_config(&rc.ctx, rc.tenant(), document, if_match(&headers), &rc.actor)
        .await
        .map_err(rc.fail())?;
    Ok(with_etag(doc))
}

/// GET /v1/admin/tenants/:tenant_id/rules
pub async fn get_tenant_rules(
    State(state): State<AppState>,
    Path(tenant): Path<String>,
    rc: ReqContext,
) -> Result<Response, ApiError> {
    let rc = rc.for_tenant(&tenant);
    let doc = state
        .admin
        .get_tenant_rules(&rc.ctx, rc.tenant())
        .await
        .map_err(rc.fail())?;
    Ok(with_etag(doc))
}

/// PUT /v1/admin/tenants/:tenant_id/rules
pub async fn put_tenant_rules(
    State(state): State<AppState>,
    Path(tenant): Path<String>,
    headers: HeaderMap,
    rc: ReqContext,
    ApiJson(document): ApiJson<serde_json::Value>,
) -> Result<Response, ApiError> {
    let rc = rc.for_tenant(&tenant);
    let doc = state
        .admin
        .update_tenant_rules(&rc.ctx, rc.tenant(), document, if_match(&headers), &rc.actor)
        .await
        .map_err(rc.fail())?;
    Ok(with_etag(doc))
}

/// POST /v1/admin/tenants/:tenant_id/cache/invalidate
pub async fn invalidate_cache(
    State(state): State<AppState>,
    Path(tenant): Path<String>,
    rc: ReqContext,
    ApiJson(body): ApiJson<CacheInvalidateRequest>,
) -> Result<Json<CacheInvalidateResult>, ApiError> {
    let rc = rc.for_tenant(&tenant);
    let result = state
        .admin
        .invalidate_cache(&rc.ctx, rc.tenant(), &body, &rc.actor)
        .await
        .map_err(rc.fail())?;
    Ok(Json(result))
}

/// GET /v1/admin/tenants/:tenant_id/audit
pub async fn list_audit_log(
    State(state): State<AppState>,
    Path(tenant): Path<String>,
    rc: ReqContext,
    ApiQuery(query): ApiQuery<AuditQuery>,
) -> Result<Json<AuditLog>, ApiError> {
    let rc = rc.for_tenant(&tenant);
    let log = state
        .admin
        .list_audit_log(&rc.ctx, rc.tenant(), query)
        .await
        .map_err(rc.fail())?;
    Ok(Json(log))
}

// ─── Recommendation config ──────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct PublishConfigBody {
    /// Snapshot version the edit was based on.
    pub version: u64,
    pub config: RecommendationConfig,
    #[serde(default)]
    pub notes: String,
}

/// GET /v1/admin/recommendation-config
pub async fn get_recommendation_config(State(state): State<AppState>) -> Json<ConfigSnapshot> {
    Json(state.config.load().as_ref().clone())
}

/// PUT /v1/admin/recommendation-config
pub async fn put_recommendation_config(
    State(state): State<AppState>,
    rc: ReqContext,
    ApiJson(body): ApiJson<PublishConfigBody>,
) -> Result<Json<ConfigSnapshot>, ApiError> {
    let updated_by = if rc.actor.subject.is_empty() {
        "admin".to_string()
    } else {
        rc.actor.subject.clone()
    };
    let snapshot = state
        .config
        .publish(body.version, body.config, updated_by, "admin_api", body.notes)
        .map_err(rc.fail())?;
    state.recommend.coverage().reconfigure(
        Duration::from_secs(snapshot.config.coverage_cache_ttl_secs),
        snapshot.config.coverage_long_tail_hint_threshold,
    );
    info!(version = snapshot.version, request_id = %rc.ctx.request_id, "Recommendation config replaced");
    Ok(Json(snapshot.as_ref().clone()))
}
