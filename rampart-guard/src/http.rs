//! HTTP boundary: error mapping, rate-limit headers and middleware.
//!
//! Responses use the `{ "success": ..., ... }` envelope the mobile clients
//! already parse.

use axum::{
    extract::{Request, State},
    http::{header::HeaderName, HeaderMap, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use rampart_core::{DependencyError, RampartError, RateDecision, RouteClass};
use serde::Serialize;
use serde_json::Value;

use crate::brake::OverloadBrake;
use crate::pipeline::{Guard, GuardResponse};
use crate::rate_limit::{retry_after_secs, FixedWindowLimiter};

pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");
pub const RETRY_AFTER: HeaderName = HeaderName::from_static("retry-after");

/// Who is calling, as resolved by the (external) auth layer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientIdentity(pub String);

/// JSON error body.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub success: bool,
    pub code: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

/// HTTP status for an error kind.
pub fn status_code(error: &RampartError) -> StatusCode {
    match error {
        RampartError::Validation(_) => StatusCode::BAD_REQUEST,
        RampartError::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
        RampartError::CircuitOpen { .. } => StatusCode::SERVICE_UNAVAILABLE,
        RampartError::Dependency(DependencyError::Timeout { .. }) => StatusCode::GATEWAY_TIMEOUT,
        RampartError::Dependency(_) => StatusCode::BAD_GATEWAY,
        RampartError::Store(_) | RampartError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// `RampartError` as an HTTP response.
#[derive(Debug)]
pub struct GuardError(pub RampartError);

impl From<RampartError> for GuardError {
    fn from(e: RampartError) -> Self {
        Self(e)
    }
}

impl IntoResponse for GuardError {
    fn into_response(self) -> Response {
        let error = self.0;
        let status = status_code(&error);
        let retry_after = error.retry_after().map(retry_after_secs);

        if status.is_server_error() {
            tracing::error!(code = error.code(), error = %error, "Request failed");
        }

        let body = ErrorBody {
            success: false,
            code: error.code(),
            message: error.to_string(),
            retry_after,
        };
        let mut response = (status, Json(body)).into_response();
        if let Some(secs) = retry_after {
            response
                .headers_mut()
                .insert(RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}

/// Set `X-RateLimit-*` headers from an admission decision.
pub fn apply_rate_headers(headers: &mut HeaderMap, decision: &RateDecision) {
    headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(decision.limit));
    headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(decision.remaining));
    headers.insert(
        X_RATELIMIT_RESET,
        HeaderValue::from(decision.reset_at.timestamp().max(0)),
    );
}

#[derive(Serialize)]
struct SuccessBody {
    success: bool,
    data: Value,
    cached: bool,
}

impl IntoResponse for GuardResponse {
    fn into_response(self) -> Response {
        let mut response = Json(SuccessBody {
            success: true,
            data: self.payload,
            cached: self.cache_hit,
        })
        .into_response();
        apply_rate_headers(response.headers_mut(), &self.rate);
        response
    }
}

/// State for [`rate_limit_middleware`].
#[derive(Clone)]
pub struct RateLimitState {
    limiter: FixedWindowLimiter,
    brake: Option<OverloadBrake>,
}

impl RateLimitState {
    pub fn new(limiter: FixedWindowLimiter, brake: Option<OverloadBrake>) -> Self {
        Self { limiter, brake }
    }

    /// Share the guard's limiter and brake.
    ///
    /// Handlers behind this middleware must call [`Guard::handle_admitted`]
    /// with the [`RateDecision`] from the request extensions, not
    /// [`Guard::handle`], or each request is counted twice.
    pub fn from_guard(guard: &Guard) -> Self {
        Self::new(guard.limiter().clone(), guard.brake().cloned())
    }
}

/// Rate limiting middleware.
///
/// Reads [`ClientIdentity`] and [`RouteClass`] from request extensions
/// (inserted by earlier layers); requests without an identity share the
/// `anonymous` bucket and unclassified routes count as `general`.
/// Rejections are 429 with `Retry-After`; admitted responses carry the
/// `X-RateLimit-*` headers. The [`RateDecision`] is inserted into the request
/// extensions for [`Guard::handle_admitted`].
pub async fn rate_limit_middleware(
    State(state): State<RateLimitState>,
    mut request: Request,
    next: Next,
) -> Result<Response, GuardError> {
    let identity = request
        .extensions()
        .get::<ClientIdentity>()
        .map(|id| id.0.clone())
        .unwrap_or_else(|| "anonymous".to_string());
    let route_class = request
        .extensions()
        .get::<RouteClass>()
        .copied()
        .unwrap_or(RouteClass::General);

    if let Some(brake) = &state.brake {
        brake.check().await?;
    }
    let decision = state.limiter.check(&identity, route_class).await?;
    request.extensions_mut().insert(decision.clone());

    let mut response = next.run(request).await;
    apply_rate_headers(response.headers_mut(), &decision);
    Ok(response)
}
