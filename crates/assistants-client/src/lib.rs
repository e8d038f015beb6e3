//! HTTP client for the Assistants API surface the relay drives: assistants, threads, runs,
//! messages, uploaded files and code-interpreter container files.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt, TryStreamExt};
use reqwest::StatusCode;
use reqwest::header::{CONTENT_TYPE, HeaderMap};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

mod retry;
pub mod types;

pub use retry::{
    DEFAULT_RATE_LIMIT_BASE_DELAY_MS, DEFAULT_RATE_LIMIT_MAX_DELAY_MS,
    DEFAULT_RATE_LIMIT_MAX_RETRIES, DEFAULT_RATE_LIMIT_MULTIPLIER, RetryPolicy,
};
pub use types::*;

use crate::types::ApiErrorEnvelope;

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_TIMEOUT_MS: u64 = 60_000;
pub const DEFAULT_REQUEST_ATTEMPTS: usize = 3;
pub const DEFAULT_RETRY_BACKOFF_MS: u64 = 250;

const ASSISTANTS_BETA_HEADER: &str = "OpenAI-Beta";
const ASSISTANTS_BETA_VALUE: &str = "assistants=v2";
const ORGANIZATION_HEADER: &str = "OpenAI-Organization";
const REQUEST_ID_HEADER: &str = "x-request-id";
const RETRY_AFTER_MS_HEADER: &str = "retry-after-ms";
const RETRY_AFTER_HEADER: &str = "retry-after";
const INSUFFICIENT_QUOTA_CODE: &str = "insufficient_quota";
const ERROR_BODY_PREVIEW_CHARS: usize = 500;

pub type ByteStream = BoxStream<'static, Result<Bytes, AssistantsError>>;

#[derive(Debug, Clone)]
pub struct AssistantsClientConfig {
    pub base_url: String,
    pub api_key: String,
    pub organization: Option<String>,
    pub timeout_ms: u64,
    pub request_attempts: usize,
    pub retry_backoff_ms: u64,
}

impl AssistantsClientConfig {
    #[must_use]
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            organization: None,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            request_attempts: DEFAULT_REQUEST_ATTEMPTS,
            retry_backoff_ms: DEFAULT_RETRY_BACKOFF_MS,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AssistantsClient {
    base_url: String,
    api_key: String,
    organization: Option<String>,
    timeout: Duration,
    request_attempts: usize,
    retry_backoff: Duration,
    http: reqwest::Client,
}

/// Coarse classification every upstream failure falls into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    RateLimited,
    NotFound,
    Transient,
    Permanent,
}

#[derive(Debug, Error)]
pub enum AssistantsError {
    #[error("assistants_client_base_url_missing")]
    BaseUrlMissing,
    #[error("assistants_client_api_key_missing")]
    ApiKeyMissing,
    #[error("assistants_client_invalid_path")]
    InvalidPath,
    #[error("assistants_client_invalid_input:{message}")]
    InvalidInput { message: String },
    #[error("upstream_rate_limited:{message}")]
    RateLimited {
        message: String,
        retry_after: Option<Duration>,
    },
    #[error("upstream_not_found:{message}")]
    NotFound { message: String },
    #[error("upstream_unavailable_{status}:{message}")]
    Unavailable { status: StatusCode, message: String },
    #[error("upstream_request_failed:{message}")]
    Request { message: String },
    #[error("upstream_http_{status}:{message}")]
    Rejected { status: StatusCode, message: String },
    #[error("upstream_read_failed:{message}")]
    Read { message: String },
    #[error("upstream_json_decode_failed:{message}")]
    Decode { message: String },
}

impl AssistantsError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::RateLimited { .. } => ErrorKind::RateLimited,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Unavailable { .. } | Self::Request { .. } | Self::Read { .. } => {
                ErrorKind::Transient
            }
            Self::BaseUrlMissing
            | Self::ApiKeyMissing
            | Self::InvalidPath
            | Self::InvalidInput { .. }
            | Self::Rejected { .. }
            | Self::Decode { .. } => ErrorKind::Permanent,
        }
    }

    pub fn is_rate_limited(&self) -> bool {
        self.kind() == ErrorKind::RateLimited
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Upstream-provided message without the classification prefix.
    pub fn upstream_message(&self) -> String {
        match self {
            Self::InvalidInput { message }
            | Self::RateLimited { message, .. }
            | Self::NotFound { message }
            | Self::Unavailable { message, .. }
            | Self::Request { message }
            | Self::Rejected { message, .. }
            | Self::Read { message }
            | Self::Decode { message } => message.clone(),
            Self::BaseUrlMissing | Self::ApiKeyMissing | Self::InvalidPath => self.to_string(),
        }
    }
}

/// A streamed file body plus whatever the upstream reported about it.
pub struct ContentStream {
    pub content_type: Option<String>,
    pub content_length: Option<u64>,
    pub body: ByteStream,
}

impl fmt::Debug for ContentStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContentStream")
            .field("content_type", &self.content_type)
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

/// Upstream operations the relay depends on. [`AssistantsClient`] is the HTTP implementation;
/// tests substitute scripted doubles.
#[async_trait]
pub trait AssistantsApi: Send + Sync {
    async fn create_assistant(
        &self,
        request: &CreateAssistantRequest,
    ) -> Result<Assistant, AssistantsError>;

    async fn retrieve_assistant(&self, assistant_id: &str) -> Result<Assistant, AssistantsError>;

    async fn create_thread(&self) -> Result<Thread, AssistantsError>;

    async fn create_message(
        &self,
        thread_id: &str,
        request: &CreateMessageRequest,
    ) -> Result<ThreadMessage, AssistantsError>;

    async fn create_run(
        &self,
        thread_id: &str,
        request: &CreateRunRequest,
    ) -> Result<Run, AssistantsError>;

    async fn retrieve_run(&self, thread_id: &str, run_id: &str) -> Result<Run, AssistantsError>;

    async fn list_messages(
        &self,
        thread_id: &str,
        query: &ListMessagesQuery,
    ) -> Result<MessageList, AssistantsError>;

    async fn upload_file(&self, filename: &str, content: Bytes)
    -> Result<FileObject, AssistantsError>;

    async fn retrieve_file(&self, file_id: &str) -> Result<FileObject, AssistantsError>;

    async fn file_content(&self, file_id: &str) -> Result<ContentStream, AssistantsError>;

    async fn retrieve_container_file(
        &self,
        container_id: &str,
        file_id: &str,
    ) -> Result<ContainerFile, AssistantsError>;

    async fn container_file_content(
        &self,
        container_id: &str,
        file_id: &str,
    ) -> Result<ContentStream, AssistantsError>;
}

impl AssistantsClient {
    pub fn new(config: AssistantsClientConfig) -> Result<Self, AssistantsError> {
        let base_url = normalize_base_url(&config.base_url)?;
        let api_key = non_empty_string(config.api_key).ok_or(AssistantsError::ApiKeyMissing)?;
        Ok(Self {
            base_url,
            api_key,
            organization: config.organization.and_then(non_empty_string),
            timeout: Duration::from_millis(config.timeout_ms.max(250)),
            request_attempts: config.request_attempts.max(1),
            retry_backoff: Duration::from_millis(config.retry_backoff_ms),
            http: reqwest::Client::new(),
        })
    }

    #[must_use]
    pub fn endpoint(&self, path: &str) -> Option<String> {
        let trimmed = path.trim();
        if trimmed.is_empty() {
            return None;
        }
        if trimmed.starts_with('/') {
            Some(format!("{}{}", self.base_url, trimmed))
        } else {
            Some(format!("{}/{}", self.base_url, trimmed))
        }
    }

    #[must_use]
    pub fn assistants_path() -> &'static str {
        "/assistants"
    }

    #[must_use]
    pub fn assistant_path(assistant_id: &str) -> String {
        format!("/assistants/{}", assistant_id.trim())
    }

    #[must_use]
    pub fn threads_path() -> &'static str {
        "/threads"
    }

    #[must_use]
    pub fn thread_messages_path(thread_id: &str) -> String {
        format!("/threads/{}/messages", thread_id.trim())
    }

    #[must_use]
    pub fn thread_messages_query_path(thread_id: &str, query: &ListMessagesQuery) -> String {
        let mut path = format!(
            "/threads/{}/messages?order={}&limit={}",
            thread_id.trim(),
            query.order.as_str(),
            query.limit.clamp(1, DEFAULT_MESSAGE_PAGE_LIMIT)
        );
        if let Some(run_id) = query.run_id.as_deref() {
            path.push_str("&run_id=");
            path.push_str(run_id.trim());
        }
        if let Some(after) = query.after.as_deref() {
            path.push_str("&after=");
            path.push_str(after.trim());
        }
        path
    }

    #[must_use]
    pub fn thread_runs_path(thread_id: &str) -> String {
        format!("/threads/{}/runs", thread_id.trim())
    }

    #[must_use]
    pub fn thread_run_path(thread_id: &str, run_id: &str) -> String {
        format!("/threads/{}/runs/{}", thread_id.trim(), run_id.trim())
    }

    #[must_use]
    pub fn files_path() -> &'static str {
        "/files"
    }

    #[must_use]
    pub fn file_path(file_id: &str) -> String {
        format!("/files/{}", file_id.trim())
    }

    #[must_use]
    pub fn file_content_path(file_id: &str) -> String {
        format!("/files/{}/content", file_id.trim())
    }

    #[must_use]
    pub fn container_file_path(container_id: &str, file_id: &str) -> String {
        format!(
            "/containers/{}/files/{}",
            container_id.trim(),
            file_id.trim()
        )
    }

    #[must_use]
    pub fn container_file_content_path(container_id: &str, file_id: &str) -> String {
        format!(
            "/containers/{}/files/{}/content",
            container_id.trim(),
            file_id.trim()
        )
    }

    pub async fn get_json<T>(&self, operation: &'static str, path: &str) -> Result<T, AssistantsError>
    where
        T: for<'de> serde::Deserialize<'de>,
    {
        let response = self
            .send_with_retries(operation, path, |http, url| http.get(url))
            .await?;
        decode_json_response(response).await
    }

    pub async fn post_json<Req, Res>(
        &self,
        operation: &'static str,
        path: &str,
        payload: &Req,
    ) -> Result<Res, AssistantsError>
    where
        Req: Serialize + Sync + ?Sized,
        Res: for<'de> serde::Deserialize<'de>,
    {
        let response = self
            .send_with_retries(operation, path, |http, url| http.post(url).json(payload))
            .await?;
        decode_json_response(response).await
    }

    async fn get_stream(
        &self,
        operation: &'static str,
        path: &str,
    ) -> Result<ContentStream, AssistantsError> {
        let response = self
            .send_with_retries(operation, path, |http, url| http.get(url))
            .await?;
        let status = response.status();
        if !status.is_success() {
            let headers = response.headers().clone();
            let bytes = response
                .bytes()
                .await
                .map_err(|error| AssistantsError::Read {
                    message: error.to_string(),
                })?;
            return Err(format_http_error(status, &headers, &bytes));
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| non_empty_string(value.to_string()));
        let content_length = response.content_length();
        let body = response
            .bytes_stream()
            .map_err(|error| AssistantsError::Read {
                message: error.to_string(),
            })
            .boxed();

        Ok(ContentStream {
            content_type,
            content_length,
            body,
        })
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let request = request
            .bearer_auth(&self.api_key)
            .header(ASSISTANTS_BETA_HEADER, ASSISTANTS_BETA_VALUE)
            .header(REQUEST_ID_HEADER, format!("req_{}", Uuid::new_v4().simple()))
            .timeout(self.timeout);
        match self.organization.as_deref() {
            Some(organization) => request.header(ORGANIZATION_HEADER, organization),
            None => request,
        }
    }

    /// Sends the request built by `build`, re-sending on transport failures and transient
    /// statuses until `request_attempts` is spent. Any other response is returned as-is.
    async fn send_with_retries<F>(
        &self,
        operation: &'static str,
        path: &str,
        build: F,
    ) -> Result<reqwest::Response, AssistantsError>
    where
        F: Fn(&reqwest::Client, &str) -> reqwest::RequestBuilder + Send + Sync,
    {
        let url = self.endpoint(path).ok_or(AssistantsError::InvalidPath)?;
        let mut last_error: Option<AssistantsError> = None;

        for attempt in 0..self.request_attempts {
            if attempt > 0 {
                let factor = 1_u32 << (attempt - 1).min(16);
                tokio::time::sleep(self.retry_backoff.saturating_mul(factor)).await;
            }

            let request = self.authorize(build(&self.http, url.as_str()));
            tracing::debug!(
                target: "assistants_client",
                operation,
                attempt = attempt + 1,
                "sending upstream request",
            );

            match request.send().await {
                Ok(response)
                    if is_transient_status(response.status())
                        && attempt + 1 < self.request_attempts =>
                {
                    let status = response.status();
                    let headers = response.headers().clone();
                    let body = response.bytes().await.unwrap_or_default();
                    tracing::warn!(
                        target: "assistants_client",
                        operation,
                        attempt = attempt + 1,
                        status = status.as_u16(),
                        "transient upstream status; re-sending",
                    );
                    last_error = Some(format_http_error(status, &headers, &body));
                }
                Ok(response) => return Ok(response),
                Err(error) => {
                    tracing::warn!(
                        target: "assistants_client",
                        operation,
                        attempt = attempt + 1,
                        timeout = error.is_timeout(),
                        error = %error,
                        "upstream request failed",
                    );
                    last_error = Some(AssistantsError::Request {
                        message: error.to_string(),
                    });
                }
            }
        }

        Err(last_error.unwrap_or_else(|| AssistantsError::Request {
            message: "unknown".to_string(),
        }))
    }
}

#[async_trait]
impl AssistantsApi for AssistantsClient {
    async fn create_assistant(
        &self,
        request: &CreateAssistantRequest,
    ) -> Result<Assistant, AssistantsError> {
        self.post_json("create_assistant", Self::assistants_path(), request)
            .await
    }

    async fn retrieve_assistant(&self, assistant_id: &str) -> Result<Assistant, AssistantsError> {
        let assistant_id = path_id(assistant_id)?;
        self.get_json(
            "retrieve_assistant",
            Self::assistant_path(assistant_id).as_str(),
        )
        .await
    }

    async fn create_thread(&self) -> Result<Thread, AssistantsError> {
        self.post_json(
            "create_thread",
            Self::threads_path(),
            &serde_json::json!({}),
        )
        .await
    }

    async fn create_message(
        &self,
        thread_id: &str,
        request: &CreateMessageRequest,
    ) -> Result<ThreadMessage, AssistantsError> {
        let thread_id = path_id(thread_id)?;
        self.post_json(
            "create_message",
            Self::thread_messages_path(thread_id).as_str(),
            request,
        )
        .await
    }

    async fn create_run(
        &self,
        thread_id: &str,
        request: &CreateRunRequest,
    ) -> Result<Run, AssistantsError> {
        let thread_id = path_id(thread_id)?;
        self.post_json(
            "create_run",
            Self::thread_runs_path(thread_id).as_str(),
            request,
        )
        .await
    }

    async fn retrieve_run(&self, thread_id: &str, run_id: &str) -> Result<Run, AssistantsError> {
        let thread_id = path_id(thread_id)?;
        let run_id = path_id(run_id)?;
        self.get_json(
            "retrieve_run",
            Self::thread_run_path(thread_id, run_id).as_str(),
        )
        .await
    }

    async fn list_messages(
        &self,
        thread_id: &str,
        query: &ListMessagesQuery,
    ) -> Result<MessageList, AssistantsError> {
        let thread_id = path_id(thread_id)?;
        if let Some(run_id) = query.run_id.as_deref() {
            path_id(run_id)?;
        }
        if let Some(after) = query.after.as_deref() {
            path_id(after)?;
        }
        self.get_json(
            "list_messages",
            Self::thread_messages_query_path(thread_id, query).as_str(),
        )
        .await
    }

    async fn upload_file(
        &self,
        filename: &str,
        content: Bytes,
    ) -> Result<FileObject, AssistantsError> {
        let filename = non_empty_string(filename.to_string()).ok_or_else(|| {
            AssistantsError::InvalidInput {
                message: "filename is required".to_string(),
            }
        })?;
        let response = self
            .send_with_retries("upload_file", Self::files_path(), |http, url| {
                let part = reqwest::multipart::Part::stream_with_length(
                    content.clone(),
                    content.len() as u64,
                )
                .file_name(filename.clone());
                let form = reqwest::multipart::Form::new()
                    .text("purpose", ASSISTANTS_FILE_PURPOSE)
                    .part("file", part);
                http.post(url).multipart(form)
            })
            .await?;
        decode_json_response(response).await
    }

    async fn retrieve_file(&self, file_id: &str) -> Result<FileObject, AssistantsError> {
        let file_id = path_id(file_id)?;
        self.get_json("retrieve_file", Self::file_path(file_id).as_str())
            .await
    }

    async fn file_content(&self, file_id: &str) -> Result<ContentStream, AssistantsError> {
        let file_id = path_id(file_id)?;
        self.get_stream("file_content", Self::file_content_path(file_id).as_str())
            .await
    }

    async fn retrieve_container_file(
        &self,
        container_id: &str,
        file_id: &str,
    ) -> Result<ContainerFile, AssistantsError> {
        let container_id = path_id(container_id)?;
        let file_id = path_id(file_id)?;
        self.get_json(
            "retrieve_container_file",
            Self::container_file_path(container_id, file_id).as_str(),
        )
        .await
    }

    async fn container_file_content(
        &self,
        container_id: &str,
        file_id: &str,
    ) -> Result<ContentStream, AssistantsError> {
        let container_id = path_id(container_id)?;
        let file_id = path_id(file_id)?;
        self.get_stream(
            "container_file_content",
            Self::container_file_content_path(container_id, file_id).as_str(),
        )
        .await
    }
}

/// Maps an unsuccessful upstream response onto the error taxonomy.
pub fn format_http_error(status: StatusCode, headers: &HeaderMap, body: &[u8]) -> AssistantsError {
    let (message, code) = match serde_json::from_slice::<ApiErrorEnvelope>(body) {
        Ok(envelope) => (
            non_empty_string(envelope.error.message),
            envelope.error.code,
        ),
        Err(_) => (None, None),
    };
    let message = message
        .or_else(|| non_empty_string(body_preview(body)))
        .unwrap_or_else(|| "<empty>".to_string());

    match status.as_u16() {
        429 if code.as_deref() == Some(INSUFFICIENT_QUOTA_CODE) => {
            AssistantsError::Rejected { status, message }
        }
        429 => AssistantsError::RateLimited {
            retry_after: retry_after_from_headers(headers).or_else(|| parse_retry_hint(&message)),
            message,
        },
        404 => AssistantsError::NotFound { message },
        _ if is_transient_status(status) => AssistantsError::Unavailable { status, message },
        _ => AssistantsError::Rejected { status, message },
    }
}

/// Extracts a wait hint such as "Please try again in 20ms" or "try again in 1.5s".
pub fn parse_retry_hint(message: &str) -> Option<Duration> {
    const MARKER: &str = "try again in ";
    let lowered = message.to_ascii_lowercase();
    let start = lowered.find(MARKER)? + MARKER.len();
    let rest = &lowered[start..];
    let number_len = rest
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(rest.len());
    let value = rest[..number_len].parse::<f64>().ok()?;
    let unit = &rest[number_len..];
    let seconds = if unit.starts_with("ms") {
        value / 1_000.0
    } else if unit.starts_with('s') {
        value
    } else {
        return None;
    };
    Duration::try_from_secs_f64(seconds).ok()
}

fn retry_after_from_headers(headers: &HeaderMap) -> Option<Duration> {
    let header_value = |name: &str| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
    };

    if let Some(millis) = header_value(RETRY_AFTER_MS_HEADER).and_then(|v| v.parse::<f64>().ok())
    {
        return Duration::try_from_secs_f64(millis / 1_000.0).ok();
    }
    header_value(RETRY_AFTER_HEADER)
        .and_then(|value| value.parse::<u64>().ok())
        .map(Duration::from_secs)
}

fn is_transient_status(status: StatusCode) -> bool {
    status == StatusCode::REQUEST_TIMEOUT || status.is_server_error()
}

/// Accepts the opaque identifiers the upstream issues and rejects anything that would change the
/// request path.
fn path_id(value: &str) -> Result<&str, AssistantsError> {
    let trimmed = value.trim();
    let valid = !trimmed.is_empty()
        && trimmed
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid && trimmed != "." && trimmed != ".." {
        Ok(trimmed)
    } else {
        Err(AssistantsError::InvalidPath)
    }
}

fn normalize_base_url(base_url: &str) -> Result<String, AssistantsError> {
    let trimmed = base_url.trim();
    if trimmed.is_empty() {
        return Err(AssistantsError::BaseUrlMissing);
    }
    Ok(trimmed.trim_end_matches('/').to_string())
}

async fn decode_json_response<T>(response: reqwest::Response) -> Result<T, AssistantsError>
where
    T: for<'de> serde::Deserialize<'de>,
{
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = response
        .bytes()
        .await
        .map_err(|error| AssistantsError::Read {
            message: error.to_string(),
        })?;

    if !status.is_success() {
        return Err(format_http_error(status, &headers, &bytes));
    }

    serde_json::from_slice::<T>(&bytes).map_err(|error| AssistantsError::Decode {
        message: error.to_string(),
    })
}

fn body_preview(body: &[u8]) -> String {
    String::from_utf8_lossy(body)
        .chars()
        .take(ERROR_BODY_PREVIEW_CHARS)
        .collect()
}

fn non_empty_string(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}
