use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::error;

use concierge_common::error::CommonError;
use concierge_common::openai::OpenAiClientError;

/// Failures that stop the service from starting.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error(transparent)]
    Common(#[from] CommonError),

    #[error("config error: {0}")]
    Config(String),

    #[error("dataset error in {file}: {message}")]
    Dataset { file: String, message: String },

    #[error("llm client error: {0}")]
    Llm(#[from] OpenAiClientError),
}

/// Request-level failures, mapped onto HTTP status codes.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("quota of {limit} requests exhausted until {reset_at}")]
    QuotaExceeded {
        limit: u32,
        reset_at: DateTime<Utc>,
        retry_after_secs: i64,
        headers: HeaderMap,
    },

    #[error("internal error: {0}")]
    Internal(String),
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody {
    error: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    limit: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    remaining: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reset_at: Option<String>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Validation(message) => (
                StatusCode::BAD_REQUEST,
                Json(ErrorBody {
                    error: "validation_error",
                    message,
                    limit: None,
                    remaining: None,
                    reset_at: None,
                }),
            )
                .into_response(),
            ApiError::QuotaExceeded {
                limit,
                reset_at,
                retry_after_secs,
                headers,
            } => (
                StatusCode::TOO_MANY_REQUESTS,
                headers,
                Json(ErrorBody {
                    error: "rate_limit_exceeded",
                    message: wait_message(retry_after_secs),
                    limit: Some(limit),
                    remaining: Some(0),
                    reset_at: Some(reset_at.to_rfc3339()),
                }),
            )
                .into_response(),
            ApiError::Internal(detail) => {
                error!(detail = %detail, "request failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(ErrorBody {
                        error: "internal_error",
                        message: "Serverda xatolik yuz berdi. Iltimos, keyinroq qayta urinib ko'ring."
                            .to_string(),
                        limit: None,
                        remaining: None,
                        reset_at: None,
                    }),
                )
                    .into_response()
            }
        }
    }
}

/// Human-readable wait hint, e.g. "... 3 soat 12 daqiqadan so'ng ...".
pub fn wait_message(retry_after_secs: i64) -> String {
    let total_minutes = (retry_after_secs.max(0) + 59) / 60;
    let hours = total_minutes / 60;
    let minutes = total_minutes % 60;
    let wait = match (hours, minutes) {
        (0, m) => format!("{m} daqiqa"),
        (h, 0) => format!("{h} soat"),
        (h, m) => format!("{h} soat {m} daqiqa"),
    };
    format!("So'rovlar limiti tugadi. Iltimos, {wait}dan so'ng qayta urinib ko'ring.")
}
