//! Request extractors: correlation id, tenant, actor and JSON bodies with
//! problem-shaped rejections.

use crate::error::ApiError;
use crate::state::AppState;
use axum::async_trait;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{FromRequest, FromRequestParts, Query, Request};
use axum::http::request::Parts;
use axum::http::HeaderMap;
use axum::Json;
use recsys_core::types::Actor;
use recsys_core::{RecsysError, RequestCtx};
use serde::de::DeserializeOwned;
use uuid::Uuid;

pub const REQUEST_ID_HEADER: &str = "x-request-id";
pub const TENANT_HEADER: &str = "x-tenant-id";
pub const ACTOR_HEADER: &str = "x-actor";
pub const ACTOR_TYPE_HEADER: &str = "x-actor-type";

/// UUIDs are taken as-is. Any other identifier maps to a stable UUIDv5 in
/// the OID namespace.
pub fn parse_tenant(raw: &str) -> Uuid {
    let raw = raw.trim();
    Uuid::parse_str(raw).unwrap_or_else(|_| Uuid::new_v5(&Uuid::NAMESPACE_OID, raw.as_bytes()))
}

fn header<'h>(headers: &'h HeaderMap, name: &str) -> Option<&'h str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

pub fn request_id(headers: &HeaderMap) -> String {
    header(headers, REQUEST_ID_HEADER)
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

/// Per-request context for handlers.
pub struct ReqContext {
    pub ctx: RequestCtx,
    pub actor: Actor,
}

impl ReqContext {
    /// Bind errors to this request for problem rendering.
    pub fn fail(&self) -> impl Fn(RecsysError) -> ApiError + '_ {
        move |e| ApiError::new(e, self.ctx.request_id.clone())
    }

    /// Same context, scoped to an explicit tenant from the path.
    pub fn for_tenant(mut self, raw: &str) -> Self {
        self.ctx.tenant_id = parse_tenant(raw);
        self
    }

    pub fn tenant(&self) -> Uuid {
        self.ctx.tenant_id
    }
}

#[async_trait]
impl FromRequestParts<AppState> for ReqContext {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let request_id = request_id(&parts.headers);
        let tenant = header(&parts.headers, TENANT_HEADER)
            .map(parse_tenant)
            .unwrap_or(state.default_tenant);
        let subject = header(&parts.headers, ACTOR_HEADER).unwrap_or_default().to_string();
        let actor_type = header(&parts.headers, ACTOR_TYPE_HEADER)
            .map(str::to_string)
            .unwrap_or_else(|| if subject.is_empty() { "anonymous" } else { "user" }.to_string());
        Ok(Self {
            ctx: RequestCtx::new(request_id, tenant).with_timeout(state.request_timeout),
            actor: Actor { subject, actor_type },
        })
    }
}

/// `Json<T>` whose rejections render as `400` problems.
pub struct ApiJson<T>(pub T);

#[async_trait]
impl<T, S> FromRequest<S> for ApiJson<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let request_id = request_id(req.headers());
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(Self(value)),
            Err(rejection) => Err(ApiError::new(json_error(&rejection), request_id)),
        }
    }
}

fn json_error(rejection: &JsonRejection) -> RecsysError {
    RecsysError::invalid(format!("invalid request body: {}", rejection.body_text()))
}

/// `Query<T>` whose rejections render as `400` problems.
pub struct ApiQuery<T>(pub T);

#[async_trait]
impl<T, S> FromRequestParts<S> for ApiQuery<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        match Query::<T>::from_request_parts(parts, state).await {
            Ok(Query(value)) => Ok(Self(value)),
            Err(rejection) => Err(ApiError::new(query_error(&rejection), request_id(&parts.headers))),
        }
    }
}

fn query_error(rejection: &QueryRejection) -> RecsysError {
    RecsysError::invalid(format!("invalid query string: {}", rejection.body_text()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tenant() {
        let id = Uuid::from_u128(7);
        assert_eq!(parse_tenant(&id.to_string()), id);
        assert_eq!(parse_tenant("demo"), parse_tenant(" demo "));
        assert_eq!(parse_tenant("demo"), Uuid::new_v5(&Uuid::NAMESPACE_OID, b"demo"));
        assert_ne!(parse_tenant("demo"), parse_tenant("other"));
    }

    #[test]
    fn test_request_id_generated_when_missing() {
        let mut headers = HeaderMap::new();
        assert!(Uuid::parse_str(&request_id(&headers)).is_ok());
        headers.insert(REQUEST_ID_HEADER, "abc".parse().unwrap());
        assert_eq!(request_id(&headers), "abc");
    }
}
