/// HTTP surface of the concierge.
///
/// Routes:
/// - `POST /classify` (alias `POST /chat`): full cascade, reply shaped by the decision
/// - `POST /navigate`: navigation only, never answers from the FAQ
/// - `POST /talk`: straight to conversational reply generation
/// - `GET /rate-limit`: caller's quota status, not counted against the quota
/// - `GET /health`: liveness
use std::any::Any;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{ConnectInfo, State};
use axum::http::{Extensions, HeaderMap, HeaderValue};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;
use tracing::debug;

use crate::error::ApiError;
use crate::model::ClassificationDecision;
use crate::pipeline::{ClassificationPipeline, NAVIGATION_CASCADE};
use crate::rate_limit::{client_identifier, RateDecision, RateLimiter};
use crate::responder::{fallback_message, reply_or_fallback, Responder};

pub const MAX_QUERY_CHARS: usize = 500;

const LIMIT_HEADER: &str = "x-ratelimit-limit";
const REMAINING_HEADER: &str = "x-ratelimit-remaining";
const RESET_HEADER: &str = "x-ratelimit-reset";

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<ClassificationPipeline>,
    pub responder: Arc<dyn Responder>,
    pub limiter: RateLimiter,
    pub trust_forwarded_for: bool,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/classify", post(classify))
        .route("/chat", post(classify))
        .route("/navigate", post(navigate))
        .route("/talk", post(talk))
        .route("/rate-limit", get(rate_limit_status))
        .route("/health", get(health))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CatchPanicLayer::custom(panic_response))
}

/// A handler that panics still answers with the generic 500 body.
fn panic_response(panic: Box<dyn Any + Send + 'static>) -> Response {
    let detail = panic
        .downcast_ref::<String>()
        .cloned()
        .or_else(|| panic.downcast_ref::<&str>().map(|s| s.to_string()))
        .unwrap_or_else(|| "unknown panic payload".to_string());
    ApiError::Internal(format!("handler panicked: {detail}")).into_response()
}

#[derive(Debug, Deserialize)]
pub struct QueryRequest {
    #[serde(default)]
    pub query: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitInfo {
    pub remaining: u32,
    pub limit: u32,
    pub reset_at: Option<String>,
}

impl From<&RateDecision> for RateLimitInfo {
    fn from(d: &RateDecision) -> Self {
        Self {
            remaining: d.remaining,
            limit: d.limit,
            reset_at: d.reset_at_utc().map(|t| t.to_rfc3339()),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct FaqPayload {
    pub id: String,
    pub question: String,
    pub category: String,
}

#[derive(Debug, Serialize)]
pub struct NavigationPayload {
    pub url: String,
    pub intent: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplyResponse {
    pub message: String,
    #[serde(rename = "type")]
    pub kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub faq: Option<FaqPayload>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub navigation: Option<NavigationPayload>,
    pub rate_limit: RateLimitInfo,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn classify(
    State(state): State<AppState>,
    headers: HeaderMap,
    extensions: Extensions,
    body: Result<Json<QueryRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let query = validate_query(body)?;
    let quota = state.gate(&headers, &extensions).await?;

    let classification = state.pipeline.classify(&query).await;
    debug!(stage = ?classification.decided_by, "classification finished");
    let message = reply_or_fallback(state.responder.as_ref(), &query, &classification.decision).await;

    let (kind, faq, navigation) = match classification.decision {
        ClassificationDecision::Faq { entry, score } => {
            debug!(faq = %entry.id, score, "answering from faq");
            (
                "FAQ",
                Some(FaqPayload {
                    id: entry.id,
                    question: entry.question,
                    category: entry.category,
                }),
                None,
            )
        }
        ClassificationDecision::Navigation { url, intent, source } => {
            debug!(url = %url, ?source, "redirecting");
            ("NAVIGATION", None, Some(NavigationPayload { url, intent }))
        }
        ClassificationDecision::NotFound => ("CHAT", None, None),
    };

    Ok(reply(
        &quota,
        ReplyResponse {
            message,
            kind,
            faq,
            navigation,
            rate_limit: RateLimitInfo::from(&quota),
        },
    ))
}

async fn navigate(
    State(state): State<AppState>,
    headers: HeaderMap,
    extensions: Extensions,
    body: Result<Json<QueryRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let query = validate_query(body)?;
    let quota = state.gate(&headers, &extensions).await?;

    let classification = state.pipeline.run(NAVIGATION_CASCADE, &query).await;
    let response = match &classification.decision {
        ClassificationDecision::Navigation { url, intent, .. } => ReplyResponse {
            message: fallback_message(&classification.decision),
            kind: "NAVIGATE",
            faq: None,
            navigation: Some(NavigationPayload {
                url: url.clone(),
                intent: intent.clone(),
            }),
            rate_limit: RateLimitInfo::from(&quota),
        },
        _ => ReplyResponse {
            message: "Kechirasiz, so'rovingizga mos sahifa topilmadi.".to_string(),
            kind: "NOT_FOUND",
            faq: None,
            navigation: None,
            rate_limit: RateLimitInfo::from(&quota),
        },
    };
    Ok(reply(&quota, response))
}

async fn talk(
    State(state): State<AppState>,
    headers: HeaderMap,
    extensions: Extensions,
    body: Result<Json<QueryRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let query = validate_query(body)?;
    let quota = state.gate(&headers, &extensions).await?;

    let message = reply_or_fallback(
        state.responder.as_ref(),
        &query,
        &ClassificationDecision::NotFound,
    )
    .await;
    Ok(reply(
        &quota,
        ReplyResponse {
            message,
            kind: "CHAT",
            faq: None,
            navigation: None,
            rate_limit: RateLimitInfo::from(&quota),
        },
    ))
}

async fn rate_limit_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    extensions: Extensions,
) -> Response {
    let id = state.identify(&headers, &extensions);
    let status = state.limiter.status(&id).await;
    (rate_limit_headers(&status), Json(RateLimitInfo::from(&status))).into_response()
}

impl AppState {
    fn identify(&self, headers: &HeaderMap, extensions: &Extensions) -> String {
        let forwarded = self
            .trust_forwarded_for
            .then(|| {
                headers
                    .get("x-forwarded-for")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.split(',').next())
                    .map(|v| v.trim().to_string())
                    .filter(|v| !v.is_empty())
            })
            .flatten();
        let addr = forwarded
            .or_else(|| {
                extensions
                    .get::<ConnectInfo<SocketAddr>>()
                    .map(|ConnectInfo(peer)| peer.ip().to_string())
            })
            .unwrap_or_else(|| "unknown".to_string());
        let user_agent = headers.get("user-agent").and_then(|v| v.to_str().ok());
        client_identifier(&addr, user_agent)
    }

    /// Count the request against the caller's quota, refusing it once the quota is spent.
    async fn gate(&self, headers: &HeaderMap, extensions: &Extensions) -> Result<RateDecision, ApiError> {
        let id = self.identify(headers, extensions);
        let decision = self.limiter.check_and_record(&id).await;
        if decision.allowed {
            return Ok(decision);
        }

        let reset_at = decision.reset_at_utc().unwrap_or_else(Utc::now);
        Err(ApiError::QuotaExceeded {
            limit: decision.limit,
            reset_at,
            retry_after_secs: (reset_at - Utc::now()).num_seconds(),
            headers: rate_limit_headers(&decision),
        })
    }
}

fn validate_query(body: Result<Json<QueryRequest>, JsonRejection>) -> Result<String, ApiError> {
    let Json(request) = body.map_err(|_| {
        ApiError::Validation("So'rov noto'g'ri formatda. JSON {\"query\": \"...\"} yuboring.".to_string())
    })?;
    let query = request.query.unwrap_or_default();
    let query = query.trim();
    if query.is_empty() {
        return Err(ApiError::Validation("Savol matni bo'sh bo'lmasligi kerak.".to_string()));
    }
    if query.chars().count() > MAX_QUERY_CHARS {
        return Err(ApiError::Validation(format!(
            "Savol {MAX_QUERY_CHARS} belgidan oshmasligi kerak."
        )));
    }
    Ok(query.to_string())
}

fn rate_limit_headers(decision: &RateDecision) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(LIMIT_HEADER, HeaderValue::from(decision.limit));
    headers.insert(REMAINING_HEADER, HeaderValue::from(decision.remaining));
    if let Some(reset) = decision
        .reset_at_utc()
        .and_then(|t| HeaderValue::from_str(&t.to_rfc3339()).ok())
    {
        headers.insert(RESET_HEADER, reset);
    }
    headers
}

fn reply(quota: &RateDecision, body: ReplyResponse) -> Response {
    (rate_limit_headers(quota), Json(body)).into_response()
}
