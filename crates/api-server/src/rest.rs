//! Serving endpoints and health checks.

use crate::error::ApiError;
use crate::extract::{ApiJson, ReqContext};
use crate::state::AppState;
use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use recsys_core::request::{RecommendRequest, SimilarRequest};
use recsys_personalization::{
    BanditRecommendRequest, RecommendResponse, SimilarResponse, ValidateResponse,
};
use serde::Serialize;

/// POST /v1/recommend
pub async fn recommend(
    State(state): State<AppState>,
    rc: ReqContext,
    ApiJson(body): ApiJson<RecommendRequest>,
) -> Result<Json<RecommendResponse>, ApiError> {
    let response = state.recommend.recommend(&rc.ctx, &body).await.map_err(rc.fail())?;
    Ok(Json(response))
}

/// POST /v1/recommend/validate
pub async fn validate(
    State(state): State<AppState>,
    rc: ReqContext,
    ApiJson(body): ApiJson<RecommendRequest>,
) -> Result<Json<ValidateResponse>, ApiError> {
    let response = state.recommend.validate(&rc.ctx, &body).await.map_err(rc.fail())?;
    Ok(Json(response))
}

/// POST /v1/bandit/recommendations
pub async fn bandit_recommendations(
    State(state): State<AppState>,
    rc: ReqContext,
    ApiJson(body): ApiJson<BanditRecommendRequest>,
) -> Result<Json<RecommendResponse>, ApiError> {
    let response = state
        .recommend
        .bandit_recommend(&rc.ctx, &body)
        .await
        .map_err(rc.fail())?;
    Ok(Json(response))
}

/// POST /v1/similar
pub async fn similar(
    State(state): State<AppState>,
    rc: ReqContext,
    ApiJson(body): ApiJson<SimilarRequest>,
) -> Result<Json<SimilarResponse>, ApiError> {
    let response = state.recommend.similar(&rc.ctx, &body).await.map_err(rc.fail())?;
    Ok(Json(response))
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub namespace: String,
    pub config_version: u64,
    pub uptime_secs: u64,
}

/// GET /health
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        namespace: state.namespace.clone(),
        config_version: state.config.load().version,
        uptime_secs: state.start_time.elapsed().as_secs(),
    })
}

/// GET /ready
/// Ready once the default tenant resolves.
pub async fn readiness(State(state): State<AppState>) -> StatusCode {
    match state.store.resolve_tenant(state.default_tenant).await {
        Ok(()) => StatusCode::OK,
        Err(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

/// GET /live
pub async fn liveness() -> StatusCode {
    StatusCode::OK
}
