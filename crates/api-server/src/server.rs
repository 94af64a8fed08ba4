//! HTTP server: routes, middleware and the Prometheus exporter.

use crate::state::AppState;
use crate::{admin_rest, audit_rest, bandit_rest, rest, rules_rest};
use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use recsys_core::config::AppConfig;
use std::future::Future;
use std::net::SocketAddr;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

/// Every public route with its middleware stack.
pub fn router(state: AppState, max_body_bytes: usize) -> Router {
    Router::new()
        // Serving
        .route("/v1/recommend", post(rest::recommend))
        .route("/v1/recommend/validate", post(rest::validate))
        .route("/v1/similar", post(rest::similar))
        // Bandit
        .route("/v1/bandit/policies", get(bandit_rest::list_policies))
        .route("/v1/bandit/decide", post(bandit_rest::decide))
        .route("/v1/bandit/reward", post(bandit_rest::reward))
        .route("/v1/bandit/recommendations", post(rest::bandit_recommendations))
        .route("/v1/bandit/:op", post(bandit_rest::bandit_op))
        // Tenant admin
        .route(
            "/v1/admin/tenants/:tenant_id/config",
            get(admin_rest::get_tenant_config).put(admin_rest::put_tenant_config),
        )
        .route(
            "/v1/admin/tenants/:tenant_id/rules",
            get(admin_rest::get_tenant_rules).put(admin_rest::put_tenant_rules),
        )
        .route(
            "/v1/admin/tenants/:tenant_id/cache/invalidate",
            post(admin_rest::invalidate_cache),
        )
        .route("/v1/admin/tenants/:tenant_id/audit", get(admin_rest::list_audit_log))
        .route(
            "/v1/admin/recommendation-config",
            get(admin_rest::get_recommendation_config).put(admin_rest::put_recommendation_config),
        )
        // Merchandising
        .route(
            "/v1/admin/rules",
            get(rules_rest::list_rules).post(rules_rest::create_rule),
        )
        .route("/v1/admin/rules/dry-run", post(rules_rest::dry_run))
        .route(
            "/v1/admin/rules/:rule_id",
            get(rules_rest::get_rule).put(rules_rest::update_rule),
        )
        .route(
            "/v1/admin/manual_overrides",
            get(rules_rest::list_overrides).post(rules_rest::create_override),
        )
        .route(
            "/v1/admin/manual_overrides/:override_id/cancel",
            post(rules_rest::cancel_override),
        )
        // Decision audit
        .route("/v1/audit/decisions", get(audit_rest::list_decisions))
        .route("/v1/audit/decisions/:decision_id", get(audit_rest::get_decision))
        .route("/v1/audit/search", post(audit_rest::search_decisions))
        // Operational endpoints
        .route("/health", get(rest::health_check))
        .route("/ready", get(rest::readiness))
        .route("/live", get(rest::liveness))
        // Middleware
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(TraceLayer::new_for_http())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .with_state(state)
}

pub struct ApiServer {
    config: AppConfig,
    state: AppState,
}

impl ApiServer {
    pub fn new(config: AppConfig, state: AppState) -> Self {
        Self { config, state }
    }

    /// Serve HTTP until `shutdown` resolves.
    pub async fn start_http(&self, shutdown: impl Future<Output = ()> + Send + 'static) -> anyhow::Result<()> {
        let app = router(self.state.clone(), self.config.api.max_body_bytes);
        let addr = SocketAddr::new(self.config.api.host.parse()?, self.config.api.http_port);

        info!(addr = %addr, "Starting HTTP server");

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await?;
        Ok(())
    }

    /// Install the Prometheus recorder and its scrape listener.
    pub fn start_metrics(&self) -> anyhow::Result<()> {
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(SocketAddr::new(
                self.config.api.host.parse()?,
                self.config.metrics.port,
            ))
            .install()?;

        info!(port = self.config.metrics.port, "Metrics exporter started");
        Ok(())
    }
}
