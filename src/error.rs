use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

pub type ChatResult<T> = Result<T, ChatError>;

/// Domain error taxonomy surfaced by every core operation.
///
/// `NotFound` deliberately covers both "does not exist" and "exists but the
/// caller is not authorized": lookups fold the membership/authorship
/// predicate into the query, so the distinction never materializes.
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("{field}: {reason}")]
    Validation {
        field: &'static str,
        reason: &'static str,
    },
    #[error("not found")]
    NotFound,
    #[error("{0}")]
    InvalidOperation(&'static str),
    #[error("unauthorized")]
    Unauthorized,
    #[error("rate limited")]
    RateLimited,
    #[error(transparent)]
    Storage(#[from] rusqlite::Error),
    #[error("connection pool: {0}")]
    Pool(#[from] r2d2::Error),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ChatError {
    pub fn validation(field: &'static str, reason: &'static str) -> Self {
        Self::Validation { field, reason }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    field: Option<&'static str>,
}

fn body(error: &str, field: Option<&'static str>) -> ErrorBody {
    ErrorBody {
        error: error.into(),
        field,
    }
}

impl IntoResponse for ChatError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            ChatError::Validation { field, reason } => {
                (StatusCode::UNPROCESSABLE_ENTITY, body(reason, Some(field)))
            }
            ChatError::NotFound => (StatusCode::NOT_FOUND, body("not_found", None)),
            ChatError::InvalidOperation(reason) => {
                (StatusCode::UNPROCESSABLE_ENTITY, body(reason, None))
            }
            ChatError::Unauthorized => (StatusCode::UNAUTHORIZED, body("unauthorized", None)),
            ChatError::RateLimited => (StatusCode::TOO_MANY_REQUESTS, body("rate_limited", None)),
            ChatError::Storage(e) => {
                tracing::error!(error = %e, "storage failure");
                (StatusCode::INTERNAL_SERVER_ERROR, body("internal", None))
            }
            ChatError::Pool(e) => {
                tracing::error!(error = %e, "connection pool failure");
                (StatusCode::INTERNAL_SERVER_ERROR, body("internal", None))
            }
            ChatError::Internal(e) => {
                tracing::error!(error = %e, "internal failure");
                (StatusCode::INTERNAL_SERVER_ERROR, body("internal", None))
            }
        };
        (status, Json(body)).into_response()
    }
}
