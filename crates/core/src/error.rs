use thiserror::Error;

pub type RecsysResult<T> = Result<T, RecsysError>;

/// Coarse error classes used for status mapping and degradation decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Invalid,
    Unprocessable,
    NotFound,
    Conflict,
    Unauthorized,
    Forbidden,
    Cancelled,
    Internal,
}

#[derive(Error, Debug)]
pub enum RecsysError {
    #[error("{0}")]
    Invalid(String),

    #[error("{0}")]
    Unprocessable(String),

    #[error("{0}")]
    NotFound(String),

    #[error("tenant not found: {0}")]
    TenantNotFound(String),

    #[error("version mismatch: if-match {expected:?} does not match current {current:?}")]
    VersionMismatch { expected: String, current: String },

    #[error("{0}")]
    Conflict(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("{0}")]
    Forbidden(String),

    #[error("request cancelled")]
    Cancelled,

    #[error("store error: {0}")]
    Store(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl RecsysError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::Invalid(msg.into())
    }

    pub fn unprocessable(msg: impl Into<String>) -> Self {
        Self::Unprocessable(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Invalid(_) => ErrorKind::Invalid,
            Self::Unprocessable(_) => ErrorKind::Unprocessable,
            Self::NotFound(_) | Self::TenantNotFound(_) => ErrorKind::NotFound,
            Self::VersionMismatch { .. } | Self::Conflict(_) => ErrorKind::Conflict,
            Self::Unauthorized => ErrorKind::Unauthorized,
            Self::Forbidden(_) => ErrorKind::Forbidden,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Store(_) | Self::Serialization(_) | Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// HTTP status for the problem response. Cancellation uses the
    /// non-standard 499 "client closed request".
    pub fn status(&self) -> u16 {
        match self.kind() {
            ErrorKind::Invalid => 400,
            ErrorKind::Unauthorized => 401,
            ErrorKind::Forbidden => 403,
            ErrorKind::NotFound => 404,
            ErrorKind::Conflict => 409,
            ErrorKind::Unprocessable => 422,
            ErrorKind::Cancelled => 499,
            ErrorKind::Internal => 500,
        }
    }

    /// Stable machine code carried in problem payloads.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Invalid(_) => "RECSYS_INVALID_REQUEST",
            Self::Unprocessable(_) => "RECSYS_UNPROCESSABLE_ENTITY",
            Self::NotFound(_) => "RECSYS_NOT_FOUND",
            Self::TenantNotFound(_) => "RECSYS_TENANT_NOT_FOUND",
            Self::VersionMismatch { .. } => "RECSYS_VERSION_MISMATCH",
            Self::Conflict(_) => "RECSYS_CONFLICT",
            Self::Unauthorized => "RECSYS_UNAUTHORIZED",
            Self::Forbidden(_) => "RECSYS_FORBIDDEN",
            Self::Cancelled => "RECSYS_CANCELLED",
            Self::Store(_) | Self::Serialization(_) | Self::Internal(_) => "RECSYS_INTERNAL",
        }
    }

    /// Detail safe to show to clients. Internal failures are not echoed.
    pub fn public_detail(&self) -> String {
        match self.kind() {
            ErrorKind::Internal => "internal error".to_string(),
            _ => self.to_string(),
        }
    }
}

impl From<anyhow::Error> for RecsysError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(format!("{err:#}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_and_code_mapping() {
        let cases = [
            (RecsysError::invalid("x"), 400, "RECSYS_INVALID_REQUEST"),
            (RecsysError::unprocessable("x"), 422, "RECSYS_UNPROCESSABLE_ENTITY"),
            (RecsysError::not_found("x"), 404, "RECSYS_NOT_FOUND"),
            (RecsysError::TenantNotFound("t".into()), 404, "RECSYS_TENANT_NOT_FOUND"),
            (
                RecsysError::VersionMismatch {
                    expected: "v0".into(),
                    current: "v1".into(),
                },
                409,
                "RECSYS_VERSION_MISMATCH",
            ),
            (RecsysError::Cancelled, 499, "RECSYS_CANCELLED"),
            (RecsysError::Store("boom".into()), 500, "RECSYS_INTERNAL"),
        ];
        for (err, status, code) in cases {
            assert_eq!(err.status(), status);
            assert_eq!(err.code(), code);
        }
    }

    #[test]
    fn test_internal_detail_is_hidden() {
        let err = RecsysError::Store("connection refused to 10.0.0.3".into());
        assert_eq!(err.public_detail(), "internal error");
        let err = RecsysError::invalid("context.now must be RFC3339");
        assert_eq!(err.public_detail(), "context.now must be RFC3339");
    }
}
