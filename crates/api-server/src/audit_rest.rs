//! Decision trace retrieval.

use crate::error::ApiError;
use crate::extract::{ApiJson, ApiQuery, ReqContext};
use crate::state::AppState;
use axum::extract::{Path, State};
use axum::Json;
use recsys_core::trace::{DecisionTrace, TraceQuery};
use recsys_core::RecsysError;
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Serialize)]
pub struct TraceList {
    pub limit: usize,
    pub decisions: Vec<DecisionTrace>,
}

async fn search(state: &AppState, rc: &ReqContext, mut query: TraceQuery) -> Result<TraceList, ApiError> {
    if let (Some(since), Some(until)) = (query.since, query.until) {
        if until < since {
            return Err(rc.fail()(RecsysError::invalid("until must not precede since")));
        }
    }
    let limit = query.effective_limit();
    query.limit = Some(limit);
    let tenant = rc.tenant();
    rc.ctx
        .run(state.store.resolve_tenant(tenant))
        .await
        .map_err(rc.fail())?;
    let decisions = rc
        .ctx
        .run(state.store.list_decision_traces(tenant, &query))
        .await
        .map_err(rc.fail())?;
    Ok(TraceList { limit, decisions })
}

/// GET /v1/audit/decisions
pub async fn list_decisions(
    State(state): State<AppState>,
    rc: ReqContext,
    ApiQuery(query): ApiQuery<TraceQuery>,
) -> Result<Json<TraceList>, ApiError> {
    // request_id filtering is only offered through search.
    let query = TraceQuery {
        request_id: None,
        ..query
    };
    Ok(Json(search(&state, &rc, query).await?))
}

/// POST /v1/audit/search
pub async fn search_decisions(
    State(state): State<AppState>,
    rc: ReqContext,
    ApiJson(query): ApiJson<TraceQuery>,
) -> Result<Json<TraceList>, ApiError> {
    Ok(Json(search(&state, &rc, query).await?))
}

/// GET /v1/audit/decisions/:decision_id
pub async fn get_decision(
    State(state): State<AppState>,
    Path(decision_id): Path<String>,
    rc: ReqContext,
) -> Result<Json<DecisionTrace>, ApiError> {
    let id = Uuid::parse_str(decision_id.trim())
        .map_err(|_| rc.fail()(RecsysError::invalid("decision_id must be a UUID")))?;
    let trace = rc
        .ctx
        .run(state.store.get_decision_trace(rc.tenant(), id))
        .await
        .map_err(rc.fail())?
        .ok_or_else(|| rc.fail()(RecsysError::not_found(format!("decision {id} not found"))))?;
    Ok(Json(trace))
}
