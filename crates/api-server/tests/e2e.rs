#![allow(clippy::unwrap_used)]

use axum::body::{to_bytes, Body};
use axum::http::{header, HeaderMap, Method, Request, StatusCode};
use axum::Router;
use chrono::Utc;
use recsys_api::{parse_tenant, router, AppState};
use recsys_core::config::AppConfig;
use recsys_core::request::{ExperimentRef, UserRef};
use recsys_core::types::{Event, Item};
use recsys_rl_engine::{DeterministicAssigner, ExperimentAssigner};
use recsys_store::MemoryStore;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

async fn app_with(store: Arc<MemoryStore>) -> Router {
    let state = AppState::build(&AppConfig::default(), store).await.unwrap();
    router(state, 1 << 20)
}

async fn demo_app() -> Router {
    let store = Arc::new(MemoryStore::new());
    store.seed_demo(parse_tenant("demo"), "default");
    app_with(store).await
}

async fn call(
    app: &Router,
    method: Method,
    uri: &str,
    body: Option<Value>,
    headers: &[(&str, &str)],
) -> (StatusCode, HeaderMap, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    let body = match body {
        Some(v) => {
            builder = builder.header(header::CONTENT_TYPE, "application/json");
            Body::from(serde_json::to_vec(&v).unwrap())
        }
        None => Body::empty(),
    };
    let response = app.clone().oneshot(builder.body(body).unwrap()).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, headers, value)
}

fn ids(items: &Value) -> Vec<String> {
    items
        .as_array()
        .unwrap()
        .iter()
        .map(|i| i["item_id"].as_str().unwrap().to_string())
        .collect()
}

// ─── Serving ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_recommend_applies_defaults() {
    let app = demo_app().await;
    let (status, _, body) = call(
        &app,
        Method::POST,
        "/v1/recommend",
        Some(json!({"surface": "home", "user": {"user_id": "u_1"}})),
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["meta"]["segment"], "default");
    assert_eq!(body["meta"]["k"], 20);
    let warnings = body["warnings"].as_array().unwrap();
    assert!(warnings.iter().any(|w| w["code"] == "DEFAULT_APPLIED"));
    assert!(body["items"].as_array().unwrap().len() <= 20);
}

#[tokio::test]
async fn test_recommend_requires_identity() {
    let app = demo_app().await;
    let (status, headers, body) = call(
        &app,
        Method::POST,
        "/v1/recommend",
        Some(json!({"surface": "home"})),
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["code"], "RECSYS_UNPROCESSABLE_ENTITY");
    assert_eq!(body["detail"], "user_id or anonymous_id or session_id is required");
    assert_eq!(
        headers.get(header::CONTENT_TYPE).unwrap(),
        "application/problem+json"
    );
}

#[tokio::test]
async fn test_recommend_rejects_bad_timestamp() {
    let app = demo_app().await;
    let (status, _, body) = call(
        &app,
        Method::POST,
        "/v1/recommend",
        Some(json!({
            "surface": "home",
            "user": {"user_id": "u_1"},
            "context": {"now": "not-a-time"}
        })),
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "RECSYS_INVALID_REQUEST");
    assert_eq!(body["detail"], "context.now must be RFC3339");
}

#[tokio::test]
async fn test_request_id_is_echoed() {
    let app = demo_app().await;
    let (status, headers, body) = call(
        &app,
        Method::POST,
        "/v1/recommend",
        Some(json!({"surface": "home", "user": {"user_id": "user_01"}})),
        &[("x-request-id", "req-echo-1")],
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers.get("x-request-id").unwrap(), "req-echo-1");
    assert_eq!(body["meta"]["request_id"], "req-echo-1");
}

#[tokio::test]
async fn test_pin_and_block_interaction() {
    let store = Arc::new(MemoryStore::new());
    let tenant = parse_tenant("pin-block");
    store.add_tenant(tenant);
    store.upsert_items(
        tenant,
        "default",
        vec![Item::new("X", &[]), Item::new("Y", &[]), Item::new("Z", &[])],
    );
    let now = Utc::now();
    let events = ["X", "X", "X", "Y", "Y", "Z"]
        .iter()
        .enumerate()
        .map(|(i, item)| Event {
            user_id: format!("shopper_{i}"),
            item_id: item.to_string(),
            event_type: "view".into(),
            ts: now,
        })
        .collect();
    store.record_events(tenant, "default", events);
    let app = app_with(store).await;
    let tenant_header = [("x-tenant-id", "pin-block")];

    let (status, _, _) = call(
        &app,
        Method::POST,
        "/v1/admin/rules",
        Some(json!({
            "surface": "home",
            "name": "block-x",
            "action": "BLOCK",
            "target_type": "ITEM",
            "item_ids": ["X"],
            "priority": 10
        })),
        &tenant_header,
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let (status, _, _) = call(
        &app,
        Method::POST,
        "/v1/admin/rules",
        Some(json!({
            "surface": "home",
            "name": "pin-xy",
            "action": "PIN",
            "target_type": "ITEM",
            "item_ids": ["X", "Y"],
            "priority": 5
        })),
        &tenant_header,
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, _, body) = call(
        &app,
        Method::POST,
        "/v1/recommend",
        Some(json!({
            "surface": "home",
            "k": 3,
            "user": {"user_id": "u_1"},
            "candidates": {"include_ids": ["X", "Y", "Z"]},
            "options": {"include_trace": true}
        })),
        &tenant_header,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(ids(&body["items"]), vec!["Y", "Z"]);
    assert_eq!(body["trace"]["final_items"][0]["item_id"], "Y");
}

#[tokio::test]
async fn test_scheduled_block_follows_request_clock() {
    let store = Arc::new(MemoryStore::new());
    let tenant = parse_tenant("scheduled");
    store.add_tenant(tenant);
    store.upsert_items(tenant, "default", vec![Item::new("X", &[]), Item::new("Y", &[])]);
    let now = Utc::now();
    let events = ["X", "X", "Y"]
        .iter()
        .enumerate()
        .map(|(i, item)| Event {
            user_id: format!("shopper_{i}"),
            item_id: item.to_string(),
            event_type: "view".into(),
            ts: now,
        })
        .collect();
    store.record_events(tenant, "default", events);
    let app = app_with(store).await;
    let tenant_header = [("x-tenant-id", "scheduled")];

    let (status, _, _) = call(
        &app,
        Method::POST,
        "/v1/admin/rules",
        Some(json!({
            "surface": "home",
            "name": "block-x-later",
            "action": "BLOCK",
            "target_type": "ITEM",
            "item_ids": ["X"],
            "valid_from": (now + chrono::Duration::days(1)).to_rfc3339(),
            "valid_until": (now + chrono::Duration::days(3)).to_rfc3339()
        })),
        &tenant_header,
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let recommend = |at: chrono::DateTime<Utc>| {
        json!({
            "surface": "home",
            "k": 2,
            "user": {"user_id": "u_1"},
            "candidates": {"include_ids": ["X", "Y"]},
            "context": {"now": at.to_rfc3339()}
        })
    };
    let (status, _, body) = call(&app, Method::POST, "/v1/recommend", Some(recommend(now)), &tenant_header).await;
    assert_eq!(status, StatusCode::OK);
    assert!(ids(&body["items"]).contains(&"X".to_string()));

    let later = now + chrono::Duration::days(2);
    let (status, _, body) = call(&app, Method::POST, "/v1/recommend", Some(recommend(later)), &tenant_header).await;
    assert_eq!(status, StatusCode::OK);
    assert!(!ids(&body["items"]).contains(&"X".to_string()));
}

#[tokio::test]
async fn test_exposure_log_flushed_on_shutdown() {
    let dir = std::env::temp_dir().join(format!("recsys-e2e-{}", uuid::Uuid::new_v4()));
    let path = dir.join("exposure.jsonl");
    let mut cfg = AppConfig::default();
    cfg.exposure.enabled = true;
    cfg.exposure.path = path.display().to_string();

    let store = Arc::new(MemoryStore::new());
    store.seed_demo(parse_tenant("demo"), "default");
    let state = AppState::build(&cfg, store).await.unwrap();
    let exposure = state.exposure.clone().unwrap();
    let app = router(state, 1 << 20);

    let (status, _, _) = call(
        &app,
        Method::POST,
        "/v1/recommend",
        Some(json!({"surface": "home", "user": {"user_id": "user_01"}})),
        &[("x-request-id", "req-exposed")],
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    exposure.shutdown().await;

    let body = tokio::fs::read_to_string(&path).await.unwrap();
    assert_eq!(body.lines().count(), 1);
    assert!(body.contains("req-exposed"));
    assert!(!body.contains("user_01"));
    let _ = tokio::fs::remove_dir_all(&dir).await;
}

// ─── Tenant admin ───────────────────────────────────────────────────────────

#[tokio::test]
async fn test_tenant_config_if_match() {
    let app = demo_app().await;
    let uri = "/v1/admin/tenants/demo/config";

    let (status, headers, body) = call(&app, Method::GET, uri, None, &[]).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["version"], "v1");
    assert_eq!(headers.get(header::ETAG).unwrap(), "v1");

    let (status, _, body) = call(
        &app,
        Method::PUT,
        uri,
        Some(json!({"weights": {"pop": 0.7}})),
        &[("if-match", "v0")],
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "RECSYS_VERSION_MISMATCH");

    let (status, headers, body) = call(
        &app,
        Method::PUT,
        uri,
        Some(json!({"weights": {"pop": 0.7}})),
        &[("if-match", "v1"), ("x-actor", "ops@example.com")],
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["version"], "v2");
    assert_ne!(body["version"], "v1");
    assert_eq!(headers.get(header::ETAG).unwrap(), "v2");

    let (status, _, log) = call(&app, Method::GET, "/v1/admin/tenants/demo/audit", None, &[]).await;
    assert_eq!(status, StatusCode::OK);
    let events = log["events"].as_array().unwrap();
    assert!(events.iter().any(|e| e["action"] == "tenant_config.update"));
}

#[tokio::test]
async fn test_tenant_config_requires_if_match() {
    let app = demo_app().await;
    let (status, _, body) = call(
        &app,
        Method::PUT,
        "/v1/admin/tenants/demo/rules",
        Some(json!({})),
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "RECSYS_INVALID_REQUEST");
}

#[tokio::test]
async fn test_cache_invalidate() {
    let app = demo_app().await;
    let uri = "/v1/admin/tenants/demo/cache/invalidate";

    let (status, _, body) = call(
        &app,
        Method::POST,
        uri,
        Some(json!({"targets": ["config", "rules", "popularity"], "surface": "home"})),
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "applied");
    assert_eq!(body["targets"].as_array().unwrap().len(), 3);

    let (status, _, body) = call(
        &app,
        Method::POST,
        uri,
        Some(json!({"targets": ["everything"]})),
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["code"], "RECSYS_UNPROCESSABLE_ENTITY");
}

#[tokio::test]
async fn test_unknown_tenant_is_not_found() {
    let app = demo_app().await;
    let (status, _, body) = call(
        &app,
        Method::GET,
        "/v1/admin/tenants/nobody/config",
        None,
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "RECSYS_TENANT_NOT_FOUND");
}

#[tokio::test]
async fn test_recommendation_config_publish() {
    let app = demo_app().await;
    let (status, _, current) = call(&app, Method::GET, "/v1/admin/recommendation-config", None, &[]).await;
    assert_eq!(status, StatusCode::OK);
    let version = current["version"].as_u64().unwrap();

    let body = json!({
        "version": version,
        "config": current["config"].clone(),
        "notes": "no-op republish"
    });
    let (status, _, published) = call(
        &app,
        Method::PUT,
        "/v1/admin/recommendation-config",
        Some(body.clone()),
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(published["version"].as_u64().unwrap(), version + 1);

    // The same base version is now stale.
    let (status, _, _) = call(&app, Method::PUT, "/v1/admin/recommendation-config", Some(body), &[]).await;
    assert_eq!(status, StatusCode::CONFLICT);
}

// ─── Merchandising ──────────────────────────────────────────────────────────

#[tokio::test]
async fn test_manual_override_lifecycle() {
    let app = demo_app().await;
    let expires = (Utc::now() + chrono::Duration::hours(2)).to_rfc3339();
    let (status, _, created) = call(
        &app,
        Method::POST,
        "/v1/admin/manual_overrides",
        Some(json!({
            "surface": "home",
            "item_id": "item_007",
            "action": "suppress",
            "expires_at": expires
        })),
        &[("x-actor", "merch@example.com")],
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["status"], "active");
    let override_id = created["override_id"].as_str().unwrap().to_string();

    let (status, _, body) = call(
        &app,
        Method::POST,
        "/v1/recommend",
        Some(json!({"surface": "home", "k": 40, "user": {"user_id": "user_01"}})),
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(!ids(&body["items"]).contains(&"item_007".to_string()));

    let (status, _, cancelled) = call(
        &app,
        Method::POST,
        &format!("/v1/admin/manual_overrides/{override_id}/cancel"),
        None,
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(cancelled["status"], "cancelled");

    let (status, _, list) = call(
        &app,
        Method::GET,
        "/v1/admin/manual_overrides?status=active",
        None,
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(list["overrides"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_rule_id_must_be_uuid() {
    let app = demo_app().await;
    let (status, _, body) = call(&app, Method::GET, "/v1/admin/rules/not-a-uuid", None, &[]).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "RECSYS_INVALID_REQUEST");
}

// ─── Bandit ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_bandit_upsert_decide_reward() {
    let app = demo_app().await;
    let (status, _, body) = call(
        &app,
        Method::POST,
        "/v1/bandit/policies:upsert",
        Some(json!({"policies": [{"policy_id": "fresh", "name": "fresh"}]})),
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["upserted"], 1);

    let (status, _, body) = call(&app, Method::GET, "/v1/bandit/policies", None, &[]).await;
    assert_eq!(status, StatusCode::OK);
    let policies: Vec<&str> = body["policies"]
        .as_array()
        .unwrap()
        .iter()
        .map(|p| p["policy_id"].as_str().unwrap())
        .collect();
    assert!(policies.contains(&"fresh"));

    let context = json!({"device": "mobile"});
    let (status, _, decision) = call(
        &app,
        Method::POST,
        "/v1/bandit/decide",
        Some(json!({"surface": "home", "context": context, "seed": 7})),
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(decision["bucket_key"], "ctx:device=mobile");
    let policy_id = decision["policy_id"].as_str().unwrap().to_string();

    let reward = json!({
        "policy_id": policy_id,
        "surface": "home",
        "reward": true,
        "context": context
    });
    let headers = [("x-request-id", "reward-1")];
    let (status, _, first) = call(&app, Method::POST, "/v1/bandit/reward", Some(reward.clone()), &headers).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(first["applied"], true);
    assert_eq!(first["bucket_key"], "ctx:device=mobile");

    let (status, _, second) = call(&app, Method::POST, "/v1/bandit/reward", Some(reward), &headers).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(second["applied"], false);
}

#[tokio::test]
async fn test_out_of_range_knobs_rejected() {
    let app = demo_app().await;
    let (status, _, body) = call(
        &app,
        Method::POST,
        "/v1/bandit/policies:upsert",
        Some(json!({"policies": [{"policy_id": "wide", "co_vis_window_days": 1e12}]})),
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["detail"].as_str().unwrap().contains("co_vis_window_days"));

    let (_, _, current) = call(&app, Method::GET, "/v1/admin/recommendation-config", None, &[]).await;
    let mut config = current["config"].clone();
    config["co_vis_window_days"] = json!(1e12);
    let (status, _, _) = call(
        &app,
        Method::PUT,
        "/v1/admin/recommendation-config",
        Some(json!({"version": current["version"], "config": config})),
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _, _) = call(
        &app,
        Method::POST,
        "/v1/recommend",
        Some(json!({"surface": "home", "user": {"user_id": "user_01"}})),
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_bandit_unknown_op() {
    let app = demo_app().await;
    let (status, _, _) = call(&app, Method::POST, "/v1/bandit/policies:delete", Some(json!({})), &[]).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[test]
fn test_assignment_is_deterministic() {
    let assigner = DeterministicAssigner::new(vec!["A".into(), "B".into()], "salt");
    let user = UserRef {
        user_id: "user-123".into(),
        ..Default::default()
    };
    let first = assigner.assign(None, &user).unwrap();
    for _ in 0..10 {
        assert_eq!(assigner.assign(None, &user).unwrap(), first);
    }

    let forced = ExperimentRef {
        id: "exp".into(),
        variant: "B".into(),
    };
    assert_eq!(assigner.assign(Some(&forced), &user).unwrap().variant, "B");
}

// ─── Decision audit ─────────────────────────────────────────────────────────

#[tokio::test]
async fn test_decision_traces_are_queryable() {
    let app = demo_app().await;
    let (status, _, _) = call(
        &app,
        Method::POST,
        "/v1/recommend",
        Some(json!({"surface": "home", "user": {"user_id": "user_04"}})),
        &[("x-request-id", "audited-1")],
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let mut found = Value::Null;
    for _ in 0..50 {
        let (status, _, body) = call(
            &app,
            Method::POST,
            "/v1/audit/search",
            Some(json!({"request_id": "audited-1"})),
            &[],
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        if let Some(first) = body["decisions"].as_array().and_then(|d| d.first()) {
            found = first.clone();
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(found["surface"], "home");
    assert!(!found["user_hash"].as_str().unwrap().is_empty());

    let id = found["decision_id"].as_str().unwrap();
    let (status, _, one) = call(&app, Method::GET, &format!("/v1/audit/decisions/{id}"), None, &[]).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(one["decision_id"], id);

    let (status, _, _) = call(
        &app,
        Method::GET,
        "/v1/audit/decisions?since=2030-01-02T00:00:00Z&until=2030-01-01T00:00:00Z",
        None,
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_health_endpoints() {
    let app = demo_app().await;
    let (status, _, body) = call(&app, Method::GET, "/health", None, &[]).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["namespace"], "default");
    let (status, _, _) = call(&app, Method::GET, "/ready", None, &[]).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _, _) = call(&app, Method::GET, "/live", None, &[]).await;
    assert_eq!(status, StatusCode::OK);
}
