use std::sync::Arc;
use std::time::{Duration, SystemTime};

use assistants_client::{AssistantsApi, AssistantsError, ContentStream, ErrorKind, RetryPolicy};
use axum::body::{Body, Bytes};
use axum::extract::rejection::{BytesRejection, JsonRejection};
use axum::extract::{DefaultBodyLimit, Path, Query, State};
use axum::http::header::{
    CACHE_CONTROL, CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE, HeaderValue,
};
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower::ServiceBuilder;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::api_envelope::{
    ApiError, ApiErrorKind, invalid_request, not_found, upstream_failure,
};
use crate::config::Config;
use crate::config_store::ConfigStore;
use crate::normalizer::{NormalizedMessage, NormalizedResult};
use crate::orchestrator::{ConversationOrchestrator, TurnError, TurnRequest};
use crate::provisioner::{AssistantProvisioner, ProvisionError, Provisioned};
use crate::token_estimate::{ContentClass, estimate_file_tokens};

const SERVICE_NAME: &str = "interpreter-relay";
const LOG_TARGET: &str = "interpreter_relay::server";
const FILE_CACHE_CONTROL: &str = "public, max-age=3600";
const FALLBACK_CONTENT_TYPE: &str = "application/octet-stream";
const REQUEST_TIMEOUT_MARGIN: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct AppState {
    config: Arc<Config>,
    api: Arc<dyn AssistantsApi>,
    store: Arc<dyn ConfigStore>,
    provisioner: Arc<AssistantProvisioner>,
    orchestrator: Arc<ConversationOrchestrator>,
    retry: RetryPolicy,
    started_at: SystemTime,
}

impl AppState {
    pub fn new(config: Config, api: Arc<dyn AssistantsApi>, store: Arc<dyn ConfigStore>) -> Self {
        let retry = config.retry_policy();
        let provisioner = AssistantProvisioner::new(
            api.clone(),
            store.clone(),
            config.assistant_spec(),
            retry.clone(),
        );
        let orchestrator =
            ConversationOrchestrator::new(api.clone(), retry.clone(), config.poll_policy());
        Self {
            config: Arc::new(config),
            api,
            store,
            provisioner: Arc::new(provisioner),
            orchestrator: Arc::new(orchestrator),
            retry,
            started_at: SystemTime::now(),
        }
    }

    pub fn provisioner(&self) -> &AssistantProvisioner {
        &self.provisioner
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    version: &'static str,
    uptime_seconds: u64,
    config_store: &'static str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ReadinessResponse {
    status: &'static str,
    provisioned: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ThreadCreatedResponse {
    thread_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ThreadHistoryResponse {
    thread_id: String,
    messages: Vec<NormalizedMessage>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct UploadedFileResponse {
    file_id: String,
    filename: String,
    size_bytes: u64,
    estimated_tokens: u64,
    /// False only when the text was run through the tokenizer.
    tokens_estimated: bool,
    content_class: ContentClass,
}

#[derive(Debug, Deserialize)]
struct UploadQuery {
    #[serde(default)]
    filename: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileQuery {
    #[serde(default)]
    container_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ReprovisionRequest {
    #[serde(default)]
    force: bool,
}

pub fn build_router(state: AppState) -> Router {
    let cors = cors_layer(&state.config.cors_allowed_origins);
    let request_timeout =
        Duration::from_millis(state.config.poll_timeout_ms) + REQUEST_TIMEOUT_MARGIN;
    let max_upload_bytes = state.config.max_upload_bytes;

    // `/turn` enforces its own poll budget and must answer with the thread id, so it sits outside
    // the blanket timeout.
    let bounded = Router::new()
        .route("/healthz", get(health))
        .route("/readyz", get(readiness))
        .route("/threads", post(create_thread))
        .route("/threads/:thread_id/messages", get(thread_messages))
        .route(
            "/files",
            post(upload_file).layer(DefaultBodyLimit::max(max_upload_bytes)),
        )
        .route("/files/:file_id", get(download_file))
        .route("/admin/assistant/reprovision", post(reprovision))
        .layer(TimeoutLayer::new(request_timeout));

    Router::new()
        .route("/turn", post(turn))
        .merge(bounded)
        .with_state(state)
        .layer(cors)
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
                .layer(PropagateRequestIdLayer::x_request_id())
                .layer(TraceLayer::new_for_http()),
        )
}

fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any);
    if allowed_origins.is_empty() || allowed_origins.iter().any(|origin| origin == "*") {
        return layer.allow_origin(Any);
    }
    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(target: LOG_TARGET, origin = %origin, "ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    layer.allow_origin(AllowOrigin::list(origins))
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let uptime_seconds = state
        .started_at
        .elapsed()
        .map_or(0, |duration| duration.as_secs());

    Json(HealthResponse {
        status: "ok",
        service: SERVICE_NAME,
        version: env!("CARGO_PKG_VERSION"),
        uptime_seconds,
        config_store: state.store.backend(),
    })
}

async fn readiness(State(state): State<AppState>) -> impl IntoResponse {
    if state.provisioner.current().await.is_some() {
        return (
            StatusCode::OK,
            Json(ReadinessResponse {
                status: "ready",
                provisioned: true,
            }),
        );
    }

    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(ReadinessResponse {
            status: "not_ready",
            provisioned: false,
        }),
    )
}

async fn turn(
    State(state): State<AppState>,
    payload: Result<Json<TurnRequest>, JsonRejection>,
) -> Result<Json<NormalizedResult>, ApiError> {
    let Json(request) = payload.map_err(|rejection| invalid_request(rejection.body_text()))?;
    let assistant_id = state
        .provisioner
        .current()
        .await
        .ok_or(TurnError::NotProvisioned)?;

    let result = state.orchestrator.run_turn(&assistant_id, request).await?;
    Ok(Json(result))
}

async fn create_thread(
    State(state): State<AppState>,
) -> Result<(StatusCode, Json<ThreadCreatedResponse>), ApiError> {
    let thread_id = state.orchestrator.create_thread().await?;
    Ok((StatusCode::CREATED, Json(ThreadCreatedResponse { thread_id })))
}

async fn thread_messages(
    State(state): State<AppState>,
    Path(thread_id): Path<String>,
) -> Result<Json<ThreadHistoryResponse>, ApiError> {
    let messages = state.orchestrator.thread_history(&thread_id).await?;
    Ok(Json(ThreadHistoryResponse {
        thread_id,
        messages,
    }))
}

async fn upload_file(
    State(state): State<AppState>,
    Query(query): Query<UploadQuery>,
    body: Result<Bytes, BytesRejection>,
) -> Result<Json<UploadedFileResponse>, ApiError> {
    let content = body.map_err(|rejection| {
        ApiError::with_status(
            rejection.status(),
            ApiErrorKind::InvalidRequest,
            rejection.body_text(),
        )
    })?;
    let filename = query
        .filename
        .as_deref()
        .and_then(upload_file_name)
        .ok_or_else(|| invalid_request("filename query parameter is required"))?;
    if content.is_empty() {
        return Err(invalid_request("uploaded file is empty"));
    }

    let estimate = estimate_file_tokens(&filename, &content);
    let api = state.api.as_ref();
    let name = filename.as_str();
    let uploaded = state
        .retry
        .run("upload_file", move || api.upload_file(name, content.clone()))
        .await
        .map_err(upstream_error)?;

    tracing::info!(
        target: LOG_TARGET,
        file_id = %uploaded.id,
        filename = %filename,
        size_bytes = estimate.size_bytes,
        estimated_tokens = estimate.tokens,
        "file uploaded",
    );
    Ok(Json(UploadedFileResponse {
        file_id: uploaded.id,
        filename,
        size_bytes: estimate.size_bytes,
        estimated_tokens: estimate.tokens,
        tokens_estimated: estimate.estimated,
        content_class: estimate.class,
    }))
}

async fn download_file(
    State(state): State<AppState>,
    Path(file_id): Path<String>,
    Query(query): Query<FileQuery>,
) -> Result<Response, ApiError> {
    let api = state.api.as_ref();
    let file_id = file_id.trim();
    let container_id = query
        .container_id
        .as_deref()
        .map(str::trim)
        .filter(|container_id| !container_id.is_empty());

    let (filename, content) = match container_id {
        Some(container_id) => {
            let metadata = state
                .retry
                .run("retrieve_container_file", move || {
                    api.retrieve_container_file(container_id, file_id)
                })
                .await
                .map_err(upstream_error)?;
            let content = state
                .retry
                .run("container_file_content", move || {
                    api.container_file_content(container_id, file_id)
                })
                .await
                .map_err(upstream_error)?;
            (metadata.filename().map(str::to_string), content)
        }
        None => {
            let metadata = state
                .retry
                .run("retrieve_file", move || api.retrieve_file(file_id))
                .await
                .map_err(upstream_error)?;
            let content = state
                .retry
                .run("file_content", move || api.file_content(file_id))
                .await
                .map_err(upstream_error)?;
            let filename = metadata.filename.trim();
            ((!filename.is_empty()).then(|| filename.to_string()), content)
        }
    };

    let filename = filename.unwrap_or_else(|| file_id.to_string());
    tracing::debug!(
        target: LOG_TARGET,
        file_id,
        container_id = container_id.unwrap_or("<none>"),
        filename = %filename,
        "streaming file",
    );
    Ok(file_response(&filename, content))
}

fn file_response(filename: &str, content: ContentStream) -> Response {
    let content_type = mime_guess::from_path(filename)
        .first()
        .map(|mime| mime.essence_str().to_string())
        .or(content.content_type)
        .unwrap_or_else(|| FALLBACK_CONTENT_TYPE.to_string());

    let mut response = Body::from_stream(content.body).into_response();
    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&content_type) {
        headers.insert(CONTENT_TYPE, value);
    }
    if let Ok(value) = HeaderValue::from_str(&content_disposition(filename)) {
        headers.insert(CONTENT_DISPOSITION, value);
    }
    if let Some(length) = content.content_length {
        headers.insert(CONTENT_LENGTH, HeaderValue::from(length));
    }
    headers.insert(CACHE_CONTROL, HeaderValue::from_static(FILE_CACHE_CONTROL));
    response
}

async fn reprovision(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<Provisioned>, ApiError> {
    let request = if body.iter().all(u8::is_ascii_whitespace) {
        ReprovisionRequest::default()
    } else {
        serde_json::from_slice::<ReprovisionRequest>(&body)
            .map_err(|error| invalid_request(format!("invalid reprovision body: {error}")))?
    };

    let result = if request.force {
        state.provisioner.recreate().await
    } else {
        state.provisioner.provision().await
    };
    let provisioned = result.map_err(|error| {
        tracing::error!(target: LOG_TARGET, error = %error, "re-provisioning failed");
        provision_error(&error)
    })?;
    tracing::info!(
        target: LOG_TARGET,
        assistant_id = %provisioned.assistant_id,
        outcome = ?provisioned.outcome,
        force = request.force,
        "assistant re-provisioned",
    );
    Ok(Json(provisioned))
}

fn provision_error(error: &ProvisionError) -> ApiError {
    match error {
        ProvisionError::Create(source) if source.is_rate_limited() => ApiError::new(
            ApiErrorKind::RateLimited,
            "The analysis service is busy. Wait a moment and try again.",
        )
        .with_retry_after(source.retry_after()),
        ProvisionError::Store(_) => ApiError::with_status(
            StatusCode::INTERNAL_SERVER_ERROR,
            ApiErrorKind::UpstreamFailed,
            "config store is unavailable",
        ),
        ProvisionError::Create(source) => upstream_failure(source),
        ProvisionError::EmptyId => ApiError::new(ApiErrorKind::UpstreamFailed, error.to_string()),
    }
}

fn upstream_error(error: AssistantsError) -> ApiError {
    match error.kind() {
        ErrorKind::NotFound => not_found("file not found"),
        ErrorKind::RateLimited => ApiError::new(
            ApiErrorKind::RateLimited,
            "The analysis service is busy. Wait a moment and try again.",
        )
        .with_retry_after(error.retry_after()),
        ErrorKind::Permanent
            if matches!(
                error,
                AssistantsError::InvalidPath | AssistantsError::InvalidInput { .. }
            ) =>
        {
            invalid_request(error.upstream_message())
        }
        ErrorKind::Transient | ErrorKind::Permanent => {
            tracing::warn!(target: LOG_TARGET, error = %error, "upstream file call failed");
            upstream_failure(&error)
        }
    }
}

/// Last path segment of a client-supplied name, or `None` when nothing usable remains.
fn upload_file_name(raw: &str) -> Option<String> {
    raw.rsplit(['/', '\\'])
        .next()
        .map(str::trim)
        .filter(|name| !name.is_empty() && *name != "." && *name != "..")
        .map(str::to_string)
}

fn content_disposition(filename: &str) -> String {
    let sanitized: String = filename
        .chars()
        .map(|character| match character {
            '"' | '\\' => '_',
            character if character.is_control() => '_',
            character => character,
        })
        .collect();
    format!("inline; filename=\"{sanitized}\"")
}

#[cfg(test)]
mod tests;
