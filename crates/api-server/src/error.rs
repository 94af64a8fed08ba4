//! RFC 7807 problem responses.

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use recsys_core::{ErrorKind, RecsysError};
use serde::Serialize;
use tracing::{error, warn};

pub const PROBLEM_CONTENT_TYPE: &str = "application/problem+json";

#[derive(Debug, Serialize)]
pub struct Problem {
    #[serde(rename = "type")]
    pub type_: String,
    pub title: String,
    pub status: u16,
    pub detail: String,
    pub code: String,
    pub instance: String,
    pub request_id: String,
}

/// A domain error bound to the request it failed.
#[derive(Debug)]
pub struct ApiError {
    pub error: RecsysError,
    pub request_id: String,
}

impl ApiError {
    pub fn new(error: RecsysError, request_id: impl Into<String>) -> Self {
        Self {
            error,
            request_id: request_id.into(),
        }
    }

    pub fn problem(&self) -> Problem {
        let status = self.status();
        Problem {
            type_: "about:blank".to_string(),
            title: status.canonical_reason().unwrap_or("Error").to_string(),
            status: self.error.status(),
            detail: self.error.public_detail(),
            code: self.error.code().to_string(),
            instance: format!("urn:request:{}", self.request_id),
            request_id: self.request_id.clone(),
        }
    }

    fn status(&self) -> StatusCode {
        StatusCode::from_u16(self.error.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let code = self.error.code();
        if self.error.kind() == ErrorKind::Internal {
            error!(request_id = %self.request_id, code, error = %self.error, "Request failed");
        } else {
            warn!(request_id = %self.request_id, code, error = %self.error, "Request rejected");
        }
        metrics::counter!("recsys.api.errors", "code" => code).increment(1);

        let mut response = (self.status(), Json(self.problem())).into_response();
        response.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static(PROBLEM_CONTENT_TYPE),
        );
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_problem_shape() {
        let err = ApiError::new(
            RecsysError::VersionMismatch {
                expected: "v0".into(),
                current: "v1".into(),
            },
            "req-1",
        );
        let p = err.problem();
        assert_eq!(p.status, 409);
        assert_eq!(p.code, "RECSYS_VERSION_MISMATCH");
        assert_eq!(p.title, "Conflict");
        assert_eq!(p.request_id, "req-1");

        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            PROBLEM_CONTENT_TYPE
        );
    }

    #[test]
    fn test_internal_detail_hidden() {
        let p = ApiError::new(RecsysError::Store("pool exhausted".into()), "r").problem();
        assert_eq!(p.status, 500);
        assert_eq!(p.detail, "internal error");
    }

    #[test]
    fn test_cancelled_uses_499() {
        let response = ApiError::new(RecsysError::Cancelled, "r").into_response();
        assert_eq!(response.status().as_u16(), 499);
    }
}
