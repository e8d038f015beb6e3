use std::time::Duration;

use axum::Json;
use axum::http::header::RETRY_AFTER;
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use assistants_client::{AssistantsError, ErrorKind};

use crate::orchestrator::TurnError;

const MAX_DETAIL_CHARS: usize = 300;
const UPSTREAM_UNAVAILABLE_DETAIL: &str =
    "The analysis service is temporarily unavailable. Try again shortly.";

pub type ApiErrorTuple = (StatusCode, Json<ApiErrorResponse>);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorKind {
    RateLimited,
    UpstreamFailed,
    Timeout,
    InvalidRequest,
    NotProvisioned,
    NotFound,
}

impl ApiErrorKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::RateLimited => "rate_limited",
            Self::UpstreamFailed => "upstream_failed",
            Self::Timeout => "timeout",
            Self::InvalidRequest => "invalid_request",
            Self::NotProvisioned => "not_provisioned",
            Self::NotFound => "not_found",
        }
    }

    pub const fn default_status(self) -> StatusCode {
        match self {
            Self::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            Self::UpstreamFailed => StatusCode::BAD_GATEWAY,
            Self::Timeout => StatusCode::GATEWAY_TIMEOUT,
            Self::InvalidRequest => StatusCode::BAD_REQUEST,
            Self::NotProvisioned => StatusCode::SERVICE_UNAVAILABLE,
            Self::NotFound => StatusCode::NOT_FOUND,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiErrorResponse {
    pub kind: &'static str,
    pub detail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
}

/// An error response plus the `Retry-After` hint, when one applies.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    body: ApiErrorResponse,
    retry_after: Option<Duration>,
}

impl ApiError {
    pub fn new(kind: ApiErrorKind, detail: impl Into<String>) -> Self {
        Self::with_status(kind.default_status(), kind, detail)
    }

    pub fn with_status(status: StatusCode, kind: ApiErrorKind, detail: impl Into<String>) -> Self {
        Self {
            status,
            body: ApiErrorResponse {
                kind: kind.as_str(),
                detail: truncate_detail(&detail.into()),
                thread_id: None,
            },
            retry_after: None,
        }
    }

    #[must_use]
    pub fn with_thread(mut self, thread_id: Option<&str>) -> Self {
        self.body.thread_id = thread_id.map(str::to_string);
        self
    }

    #[must_use]
    pub fn with_retry_after(mut self, retry_after: Option<Duration>) -> Self {
        self.retry_after = retry_after;
        self
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn into_tuple(self) -> ApiErrorTuple {
        (self.status, Json(self.body))
    }
}

impl From<TurnError> for ApiError {
    fn from(error: TurnError) -> Self {
        let thread_id = error.thread_id().map(str::to_string);
        let api_error = match &error {
            TurnError::InvalidRequest(detail) => {
                Self::new(ApiErrorKind::InvalidRequest, detail.clone())
            }
            TurnError::NotProvisioned => Self::new(
                ApiErrorKind::NotProvisioned,
                "The assistant is not ready yet. Try again shortly.",
            ),
            TurnError::RateLimited { retry_after, .. } => Self::new(
                ApiErrorKind::RateLimited,
                "The analysis service is busy. Wait a moment and try again.",
            )
            .with_retry_after(*retry_after),
            TurnError::UpstreamUnavailable { .. } => {
                Self::new(ApiErrorKind::UpstreamFailed, UPSTREAM_UNAVAILABLE_DETAIL)
            }
            TurnError::UpstreamRejected { detail, .. } => {
                Self::new(ApiErrorKind::UpstreamFailed, rejected_detail(detail))
            }
            TurnError::RunFailed { status, reason, .. } => Self::new(
                ApiErrorKind::UpstreamFailed,
                format!("The analysis run ended with status {status}: {reason}"),
            ),
            TurnError::Timeout { .. } => Self::new(
                ApiErrorKind::Timeout,
                "The analysis is taking longer than expected. Retry on the same thread.",
            ),
        };
        api_error.with_thread(thread_id.as_deref())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let retry_after = self.retry_after;
        let mut response = self.into_tuple().into_response();
        if let Some(retry_after) = retry_after {
            let seconds = retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0);
            if let Ok(value) = HeaderValue::from_str(&seconds.max(1).to_string()) {
                response.headers_mut().insert(RETRY_AFTER, value);
            }
        }
        response
    }
}

pub fn invalid_request(detail: impl Into<String>) -> ApiError {
    ApiError::new(ApiErrorKind::InvalidRequest, detail)
}

pub fn not_found(detail: impl Into<String>) -> ApiError {
    ApiError::new(ApiErrorKind::NotFound, detail)
}

/// User-facing detail for a failed upstream call. Only the upstream's own message is passed on.
pub fn upstream_failure(error: &AssistantsError) -> ApiError {
    match error.kind() {
        ErrorKind::Transient => {
            ApiError::new(ApiErrorKind::UpstreamFailed, UPSTREAM_UNAVAILABLE_DETAIL)
        }
        ErrorKind::RateLimited | ErrorKind::NotFound | ErrorKind::Permanent => ApiError::new(
            ApiErrorKind::UpstreamFailed,
            rejected_detail(&error.upstream_message()),
        ),
    }
}

fn rejected_detail(message: &str) -> String {
    let message = message.trim();
    if message.is_empty() {
        "The analysis service rejected the request.".to_string()
    } else {
        format!("The analysis service rejected the request: {message}")
    }
}

/// Caps user-visible detail so upstream bodies never flow back verbatim.
fn truncate_detail(detail: &str) -> String {
    let detail = detail.trim();
    if detail.chars().count() <= MAX_DETAIL_CHARS {
        return detail.to_string();
    }
    let mut truncated: String = detail.chars().take(MAX_DETAIL_CHARS).collect();
    truncated.push('…');
    truncated
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApiErrorMatrixEntry {
    pub kind: &'static str,
    pub status: u16,
    pub meaning: &'static str,
}

const API_ERROR_MATRIX: [ApiErrorMatrixEntry; 6] = [
    ApiErrorMatrixEntry {
        kind: "rate_limited",
        status: 429,
        meaning: "upstream rate limit persisted through every retry",
    },
    ApiErrorMatrixEntry {
        kind: "upstream_failed",
        status: 502,
        meaning: "upstream rejected, failed or was unreachable",
    },
    ApiErrorMatrixEntry {
        kind: "timeout",
        status: 504,
        meaning: "run did not finish inside the poll budget",
    },
    ApiErrorMatrixEntry {
        kind: "invalid_request",
        status: 400,
        meaning: "request body or parameters failed validation",
    },
    ApiErrorMatrixEntry {
        kind: "not_provisioned",
        status: 503,
        meaning: "no assistant id is cached yet",
    },
    ApiErrorMatrixEntry {
        kind: "not_found",
        status: 404,
        meaning: "requested file does not exist upstream",
    },
];

pub fn api_error_matrix() -> &'static [ApiErrorMatrixEntry] {
    &API_ERROR_MATRIX
}
