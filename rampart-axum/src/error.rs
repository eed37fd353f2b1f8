use axum::{
    Json,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use rampart::{
    Error,
    error::{RateLimitError, TwoFactorError},
};
use serde_json::json;
use thiserror::Error;

/// An error as the client gets to see it.
///
/// Conversions from [`rampart::Error`] keep only what is safe to reveal: a
/// rate limit says when to retry but not which rule refused, a bad code does
/// not say which factor was wrong, and storage or key problems become a bare
/// internal error.
#[derive(Debug, Error)]
pub enum HttpError {
    #[error("{0}")]
    BadRequest(String),

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Invalid verification code")]
    InvalidCode,

    #[error("Invalid or expired CSRF token")]
    CsrfRejected,

    #[error("{0}")]
    Conflict(String),

    #[error("{message}")]
    RateLimited { retry_after_ms: u64, message: String },

    #[error("Internal server error")]
    InternalError,
}

impl From<Error> for HttpError {
    fn from(err: Error) -> Self {
        match &err {
            Error::Validation(_) => HttpError::BadRequest(err.public_message()),
            Error::RateLimit(RateLimitError::Exceeded { retry_after_ms }) => {
                HttpError::RateLimited {
                    retry_after_ms: *retry_after_ms,
                    message: err.public_message(),
                }
            }
            Error::TwoFactor(TwoFactorError::AlreadyEnrolled) => {
                HttpError::Conflict(err.public_message())
            }
            Error::TwoFactor(_) => HttpError::InvalidCode,
            Error::Csrf(_) => HttpError::CsrfRejected,
            other => {
                tracing::error!(error = %other, "Request failed");
                HttpError::InternalError
            }
        }
    }
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        let status = match self {
            HttpError::BadRequest(_) => StatusCode::BAD_REQUEST,
            HttpError::Unauthorized | HttpError::InvalidCode => StatusCode::UNAUTHORIZED,
            HttpError::CsrfRejected => StatusCode::FORBIDDEN,
            HttpError::Conflict(_) => StatusCode::CONFLICT,
            HttpError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            HttpError::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = Json(json!({
            "error": self.to_string(),
            "code": status.as_u16()
        }));

        let mut response = (status, body).into_response();
        if let HttpError::RateLimited { retry_after_ms, .. } = self {
            let secs = retry_after_ms.div_ceil(1000).max(1);
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}

pub type Result<T> = std::result::Result<T, HttpError>;

#[cfg(test)]
mod tests {
    use super::*;
    use rampart::error::{CsrfError, StorageError};

    #[test]
    fn test_internal_detail_is_hidden() {
        let err = HttpError::from(Error::Storage(StorageError::Database(
            "table attempt_records is locked".to_string(),
        )));
        assert_eq!(err.to_string(), "Internal server error");

        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_rate_limit_sets_retry_after() {
        let err = HttpError::from(Error::RateLimit(RateLimitError::Exceeded {
            retry_after_ms: 1_500,
        }));
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "2");
    }

    #[test]
    fn test_csrf_reasons_collapse() {
        for reason in [
            CsrfError::TokenExpired,
            CsrfError::TokenMismatch,
            CsrfError::MissingToken,
        ] {
            let err = HttpError::from(Error::Csrf(reason));
            assert!(matches!(err, HttpError::CsrfRejected));
        }
    }

    #[test]
    fn test_second_factor_errors_do_not_name_the_factor() {
        let err = HttpError::from(Error::TwoFactor(TwoFactorError::NotEnrolled));
        assert_eq!(err.to_string(), "Invalid verification code");
    }
}
