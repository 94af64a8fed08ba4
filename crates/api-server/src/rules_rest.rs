//! Merchandising rules and manual overrides.

use crate::error::ApiError;
use crate::extract::{ApiJson, ApiQuery, ReqContext};
use crate::state::AppState;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::Utc;
use recsys_core::types::{ManualOverride, OverrideStatus, Rule};
use recsys_core::RecsysError;
use recsys_management::{CreateOverrideRequest, DryRunRequest, DryRunResponse, RuleInput, RuleListQuery};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

fn parse_id(rc: &ReqContext, raw: &str, what: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw.trim())
        .map_err(|_| rc.fail()(RecsysError::invalid(format!("{what} must be a UUID"))))
}

/// POST /v1/admin/rules
pub async fn create_rule(
    State(state): State<AppState>,
    rc: ReqContext,
    ApiJson(body): ApiJson<RuleInput>,
) -> Result<(StatusCode, Json<Rule>), ApiError> {
    let rule = state
        .rules
        .create(&rc.ctx, rc.tenant(), body, &rc.actor, Utc::now())
        .await
        .map_err(rc.fail())?;
    Ok((StatusCode::CREATED, Json(rule)))
}

#[derive(Debug, Serialize)]
pub struct RuleList {
    pub rules: Vec<Rule>,
}

/// GET /v1/admin/rules
pub async fn list_rules(
    State(state): State<AppState>,
    rc: ReqContext,
    ApiQuery(query): ApiQuery<RuleListQuery>,
) -> Result<Json<RuleList>, ApiError> {
    let rules = state
        .rules
        .list(&rc.ctx, rc.tenant(), query)
        .await
        .map_err(rc.fail())?;
    Ok(Json(RuleList { rules }))
}

/// GET /v1/admin/rules/:rule_id
pub async fn get_rule(
    State(state): State<AppState>,
    Path(rule_id): Path<String>,
    rc: ReqContext,
) -> Result<Json<Rule>, ApiError> {
    let id = parse_id(&rc, &rule_id, "rule_id")?;
    let rule = state
        .rules
        .get(&rc.ctx, rc.tenant(), id)
        .await
        .map_err(rc.fail())?;
    Ok(Json(rule))
}

/// PUT /v1/admin/rules/:rule_id
pub async fn update_rule(
    State(state): State<AppState>,
    Path(rule_id): Path<String>,
    rc: ReqContext,
    ApiJson(body): ApiJson<RuleInput>,
) -> Result<Json<Rule>, ApiError> {
    let id = parse_id(&rc, &rule_id, "rule_id")?;
    let rule = state
        .rules
        .update(&rc.ctx, rc.tenant(), id, body, &rc.actor, Utc::now())
        .await
        .map_err(rc.fail())?;
    Ok(Json(rule))
}

/// POST /v1/admin/rules/dry-run
pub async fn dry_run(
    State(state): State<AppState>,
    rc: ReqContext,
    ApiJson(body): ApiJson<DryRunRequest>,
) -> Result<Json<DryRunResponse>, ApiError> {
    let result = state
        .rules
        .dry_run(&rc.ctx, rc.tenant(), body)
        .await
        .map_err(rc.fail())?;
    Ok(Json(result))
}

// ─── Manual overrides ───────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct OverrideListQuery {
    pub namespace: Option<String>,
    pub status: Option<OverrideStatus>,
}

#[derive(Debug, Serialize)]
pub struct OverrideList {
    pub overrides: Vec<ManualOverride>,
}

/// POST /v1/admin/manual_overrides
pub async fn create_override(
    State(state): State<AppState>,
    rc: ReqContext,
    ApiJson(body): ApiJson<CreateOverrideRequest>,
) -> Result<(StatusCode, Json<ManualOverride>), ApiError> {
    let ov = state
        .overrides
        .create(&rc.ctx, rc.tenant(), body, &rc.actor, Utc::now())
        .await
        .map_err(rc.fail())?;
    Ok((StatusCode::CREATED, Json(ov)))
}

/// GET /v1/admin/manual_overrides
pub async fn list_overrides(
    State(state): State<AppState>,
    rc: ReqContext,
    ApiQuery(query): ApiQuery<OverrideListQuery>,
) -> Result<Json<OverrideList>, ApiError> {
    let overrides = state
        .overrides
        .list(&rc.ctx, rc.tenant(), query.namespace.as_deref(), query.status)
        .await
        .map_err(rc.fail())?;
    Ok(Json(OverrideList { overrides }))
}

/// POST /v1/admin/manual_overrides/:override_id/cancel
pub async fn cancel_override(
    State(state): State<AppState>,
    Path(override_id): Path<String>,
    rc: ReqContext,
) -> Result<Json<ManualOverride>, ApiError> {
    let id = parse_id(&rc, &override_id, "override_id")?;
    let ov = state
        .overrides
        .cancel(&rc.ctx, rc.tenant(), id, &rc.actor, Utc::now())
        .await
        .map_err(rc.fail())?;
    Ok(Json(ov))
}
