//! Bandit policy administration, decisions and rewards.

use crate::error::ApiError;
use crate::extract::{ApiJson, ApiQuery, ReqContext};
use crate::state::AppState;
use axum::extract::{Path, State};
use axum::Json;
use recsys_core::types::PolicyConfig;
use recsys_core::RecsysError;
use recsys_rl_engine::{bucket_key, DecideInput, Decision, RewardInput};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::info;

pub const UPSERT_POLICIES_OP: &str = "policies:upsert";

#[derive(Debug, Deserialize)]
pub struct UpsertPoliciesBody {
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub policies: Vec<PolicyConfig>,
}

#[derive(Debug, Serialize)]
pub struct UpsertPoliciesResponse {
    pub namespace: String,
    pub upserted: usize,
}

#[derive(Debug, Default, Deserialize)]
pub struct PolicyListQuery {
    pub namespace: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct PolicyList {
    pub namespace: String,
    pub policies: Vec<PolicyConfig>,
}

#[derive(Debug, Deserialize)]
pub struct DecideBody {
    pub surface: String,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub context: HashMap<String, String>,
    #[serde(default)]
    pub candidate_policy_ids: Vec<String>,
    #[serde(default)]
    pub seed: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct RewardBody {
    #[serde(flatten)]
    pub reward: RewardInput,
    #[serde(default)]
    pub namespace: Option<String>,
    /// Used to derive the bucket when `bucket_key` is absent.
    #[serde(default)]
    pub context: HashMap<String, String>,
}

#[derive(Debug, Serialize)]
pub struct RewardResponse {
    pub applied: bool,
    pub policy_id: String,
    pub bucket_key: String,
}

fn namespace(state: &AppState, requested: Option<&str>) -> String {
    requested
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or(&state.namespace)
        .to_string()
}

/// POST /v1/bandit/policies:upsert
pub async fn bandit_op(
    State(state): State<AppState>,
    Path(op): Path<String>,
    rc: ReqContext,
    ApiJson(body): ApiJson<UpsertPoliciesBody>,
) -> Result<Json<UpsertPoliciesResponse>, ApiError> {
    if op != UPSERT_POLICIES_OP {
        return Err(rc.fail()(RecsysError::not_found(format!("unknown bandit operation {op:?}"))));
    }
    let ns = namespace(&state, body.namespace.as_deref());
    if body.policies.is_empty() {
        return Err(rc.fail()(RecsysError::invalid("policies must not be empty")));
    }
    if body.policies.iter().any(|p| p.policy_id.trim().is_empty()) {
        return Err(rc.fail()(RecsysError::unprocessable("policy_id is required")));
    }
    for policy in &body.policies {
        policy.knobs.validate().map_err(|e| {
            rc.fail()(RecsysError::invalid(format!(
                "policy {}: {}",
                policy.policy_id,
                e.public_detail()
            )))
        })?;
    }
    let tenant = rc.tenant();
    rc.ctx
        .run(state.store.resolve_tenant(tenant))
        .await
        .map_err(rc.fail())?;
    rc.ctx
        .run(state.store.upsert_policies(tenant, &ns, &body.policies))
        .await
        .map_err(rc.fail())?;
    info!(%tenant, namespace = %ns, count = body.policies.len(), "Bandit policies upserted");
    Ok(Json(UpsertPoliciesResponse {
        namespace: ns,
        upserted: body.policies.len(),
    }))
}

/// GET /v1/bandit/policies
pub async fn list_policies(
    State(state): State<AppState>,
    rc: ReqContext,
    ApiQuery(query): ApiQuery<PolicyListQuery>,
) -> Result<Json<PolicyList>, ApiError> {
    let ns = namespace(&state, query.namespace.as_deref());
    let tenant = rc.tenant();
    rc.ctx
        .run(state.store.resolve_tenant(tenant))
        .await
        .map_err(rc.fail())?;
    let policies = rc
        .ctx
        .run(state.store.list_all_policies(tenant, &ns))
        .await
        .map_err(rc.fail())?;
    Ok(Json(PolicyList {
        namespace: ns,
        policies,
    }))
}

/// POST /v1/bandit/decide
pub async fn decide(
    State(state): State<AppState>,
    rc: ReqContext,
    ApiJson(body): ApiJson<DecideBody>,
) -> Result<Json<Decision>, ApiError> {
    let ns = namespace(&state, body.namespace.as_deref());
    let tenant = rc.tenant();
    rc.ctx
        .run(state.store.resolve_tenant(tenant))
        .await
        .map_err(rc.fail())?;
    let bucket = bucket_key(&body.context);
    let decision = state
        .bandit
        .decide(
            &rc.ctx,
            tenant,
            &ns,
            &DecideInput {
                surface: &body.surface,
                bucket_key: &bucket,
                candidate_policy_ids: &body.candidate_policy_ids,
                experiment: None,
                seed: body.seed,
            },
        )
        .await
        .map_err(rc.fail())?;
    Ok(Json(decision))
}

/// POST /v1/bandit/reward
pub async fn reward(
    State(state): State<AppState>,
    rc: ReqContext,
    ApiJson(mut body): ApiJson<RewardBody>,
) -> Result<Json<RewardResponse>, ApiError> {
    let ns = namespace(&state, body.namespace.as_deref());
    let tenant = rc.tenant();
    rc.ctx
        .run(state.store.resolve_tenant(tenant))
        .await
        .map_err(rc.fail())?;
    if body.reward.bucket_key.trim().is_empty() {
        body.reward.bucket_key = bucket_key(&body.context);
    }
    let applied = state
        .bandit
        .reward(&rc.ctx, tenant, &ns, &body.reward)
        .await
        .map_err(rc.fail())?;
    Ok(Json(RewardResponse {
        applied,
        policy_id: body.reward.policy_id,
        bucket_key: body.reward.bucket_key,
    }))
}
