//! Drives one conversational turn against the upstream: ensure a thread, post the user message,
//! start a run bound to the provisioned assistant, poll it to a terminal state and normalize the
//! messages that run produced.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use assistants_client::{
    AssistantsApi, AssistantsError, CreateMessageRequest, CreateRunRequest, ErrorKind,
    ListMessagesQuery, RetryPolicy, Run, RunStatus, ThreadMessage,
};
use serde::Deserialize;
use tokio::time::Instant;

use crate::normalizer::{self, NormalizedMessage, NormalizedResult};

const LOG_TARGET: &str = "interpreter_relay::orchestrator";

pub const DEFAULT_POLL_INTERVAL_MS: u64 = 500;
pub const DEFAULT_POLL_TIMEOUT_MS: u64 = 120_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    /// Total time a turn may spend waiting on a run. The remote run is left alone when exceeded.
    pub max_wait: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            max_wait: Duration::from_millis(DEFAULT_POLL_TIMEOUT_MS),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnRequest {
    pub message: String,
    #[serde(default)]
    pub thread_id: Option<String>,
    #[serde(default)]
    pub file_ids: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum TurnError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("no assistant has been provisioned")]
    NotProvisioned,
    #[error("upstream rate limited after {retries} retries")]
    RateLimited {
        thread_id: Option<String>,
        retries: u32,
        retry_after: Option<Duration>,
    },
    #[error("upstream unavailable: {detail}")]
    UpstreamUnavailable {
        thread_id: Option<String>,
        detail: String,
    },
    #[error("upstream rejected the request: {detail}")]
    UpstreamRejected {
        thread_id: Option<String>,
        detail: String,
    },
    #[error("run {run_id} ended with status {status}: {reason}")]
    RunFailed {
        thread_id: String,
        run_id: String,
        status: RunStatus,
        reason: String,
    },
    #[error("run {run_id} still pending after {}ms", .waited.as_millis())]
    Timeout {
        thread_id: String,
        run_id: String,
        waited: Duration,
    },
}

impl TurnError {
    /// Thread the caller can retry on, when one was established before the failure.
    pub fn thread_id(&self) -> Option<&str> {
        match self {
            Self::InvalidRequest(_) | Self::NotProvisioned => None,
            Self::RateLimited { thread_id, .. }
            | Self::UpstreamUnavailable { thread_id, .. }
            | Self::UpstreamRejected { thread_id, .. } => thread_id.as_deref(),
            Self::RunFailed { thread_id, .. } | Self::Timeout { thread_id, .. } => {
                Some(thread_id.as_str())
            }
        }
    }
}

pub struct ConversationOrchestrator {
    api: Arc<dyn AssistantsApi>,
    retry: RetryPolicy,
    poll: PollPolicy,
}

impl ConversationOrchestrator {
    pub fn new(api: Arc<dyn AssistantsApi>, retry: RetryPolicy, poll: PollPolicy) -> Self {
        Self { api, retry, poll }
    }

    pub async fn run_turn(
        &self,
        assistant_id: &str,
        request: TurnRequest,
    ) -> Result<NormalizedResult, TurnError> {
        let message = request.message.trim();
        if message.is_empty() {
            return Err(TurnError::InvalidRequest(
                "message must not be empty".to_string(),
            ));
        }
        let file_ids = unique_file_ids(&request.file_ids);

        let thread_id = match request
            .thread_id
            .as_deref()
            .map(str::trim)
            .filter(|thread_id| !thread_id.is_empty())
        {
            Some(thread_id) => thread_id.to_string(),
            None => self.create_thread().await?,
        };
        let api = self.api.as_ref();
        let thread = thread_id.as_str();

        let create_message = &CreateMessageRequest::user(message, &file_ids);
        self.call(Some(thread), "create_message", move || {
            api.create_message(thread, create_message)
        })
        .await?;

        let create_run = &CreateRunRequest::with_code_interpreter(assistant_id);
        let run = self
            .call(Some(thread), "create_run", move || {
                api.create_run(thread, create_run)
            })
            .await?;
        tracing::info!(
            target: LOG_TARGET,
            thread_id = %thread,
            run_id = %run.id,
            assistant_id,
            attachments = file_ids.len(),
            "run started",
        );

        let run = self.wait_for_run(thread, run).await?;
        let messages = self
            .list_all(thread, ListMessagesQuery::for_run(run.id.as_str()))
            .await?;
        let result = normalizer::normalize_run_output(thread, &messages);
        tracing::info!(
            target: LOG_TARGET,
            thread_id = %thread,
            run_id = %run.id,
            messages = messages.len(),
            files = result.files.len(),
            "turn completed",
        );
        Ok(result)
    }

    pub async fn create_thread(&self) -> Result<String, TurnError> {
        let api = self.api.as_ref();
        let thread = self
            .call(None, "create_thread", move || api.create_thread())
            .await?;
        let thread_id = thread.id.trim().to_string();
        if thread_id.is_empty() {
            return Err(TurnError::UpstreamRejected {
                thread_id: None,
                detail: "upstream returned a thread without an id".to_string(),
            });
        }
        tracing::debug!(target: LOG_TARGET, thread_id = %thread_id, "thread created");
        Ok(thread_id)
    }

    /// Every message on a thread, oldest first.
    pub async fn thread_history(
        &self,
        thread_id: &str,
    ) -> Result<Vec<NormalizedMessage>, TurnError> {
        let thread_id = thread_id.trim();
        if thread_id.is_empty() {
            return Err(TurnError::InvalidRequest(
                "thread id must not be empty".to_string(),
            ));
        }
        let messages = self.list_all(thread_id, ListMessagesQuery::default()).await?;
        Ok(normalizer::normalize_history(&messages))
    }

    async fn wait_for_run(&self, thread_id: &str, mut run: Run) -> Result<Run, TurnError> {
        let api = self.api.as_ref();
        let started = Instant::now();
        loop {
            match run.status {
                RunStatus::Completed => return Ok(run),
                RunStatus::Failed
                | RunStatus::Cancelled
                | RunStatus::Expired
                | RunStatus::Incomplete => {
                    let reason = run.failure_reason();
                    tracing::warn!(
                        target: LOG_TARGET,
                        thread_id,
                        run_id = %run.id,
                        status = %run.status,
                        reason = %reason,
                        "run did not complete",
                    );
                    return Err(TurnError::RunFailed {
                        thread_id: thread_id.to_string(),
                        run_id: run.id,
                        status: run.status,
                        reason,
                    });
                }
                RunStatus::RequiresAction => {
                    tracing::warn!(
                        target: LOG_TARGET,
                        thread_id,
                        run_id = %run.id,
                        "run requested tool outputs; no custom tools are registered",
                    );
                    return Err(TurnError::RunFailed {
                        thread_id: thread_id.to_string(),
                        run_id: run.id,
                        status: run.status,
                        reason: "run requires tool outputs, which this relay does not provide"
                            .to_string(),
                    });
                }
                RunStatus::Queued | RunStatus::InProgress | RunStatus::Cancelling => {}
            }

            let waited = started.elapsed();
            if waited >= self.poll.max_wait {
                return Err(poll_timeout(thread_id, run, waited));
            }
            let remaining = self.poll.max_wait - waited;

            let run_id = run.id.as_str();
            let poll = async {
                tokio::time::sleep(self.poll.interval.min(remaining)).await;
                self.call(Some(thread_id), "retrieve_run", move || {
                    api.retrieve_run(thread_id, run_id)
                })
                .await
            };
            let polled = tokio::time::timeout(remaining, poll).await;
            let next = match polled {
                Ok(next) => next?,
                Err(_) => return Err(poll_timeout(thread_id, run, started.elapsed())),
            };
            if next.status != run.status {
                tracing::debug!(
                    target: LOG_TARGET,
                    thread_id,
                    run_id = %next.id,
                    from = %run.status,
                    to = %next.status,
                    "run status changed",
                );
            }
            run = next;
        }
    }

    async fn list_all(
        &self,
        thread_id: &str,
        mut query: ListMessagesQuery,
    ) -> Result<Vec<ThreadMessage>, TurnError> {
        let api = self.api.as_ref();
        let mut messages = Vec::new();
        loop {
            let page_query = &query;
            let page = self
                .call(Some(thread_id), "list_messages", move || {
                    api.list_messages(thread_id, page_query)
                })
                .await?;
            let cursor = page
                .last_id
                .clone()
                .or_else(|| page.data.last().map(|message| message.id.clone()));
            let has_more = page.has_more;
            messages.extend(page.data);

            match cursor {
                Some(after) if has_more && query.after.as_deref() != Some(after.as_str()) => {
                    query.after = Some(after);
                }
                _ => break,
            }
        }
        Ok(messages)
    }

    async fn call<T, F, Fut>(
        &self,
        thread_id: Option<&str>,
        operation: &'static str,
        call: F,
    ) -> Result<T, TurnError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, AssistantsError>>,
    {
        self.retry.run(operation, call).await.map_err(|error| {
            tracing::warn!(
                target: LOG_TARGET,
                operation,
                thread_id = thread_id.unwrap_or("<none>"),
                error = %error,
                "upstream call failed",
            );
            self.turn_error(thread_id, error)
        })
    }

    fn turn_error(&self, thread_id: Option<&str>, error: AssistantsError) -> TurnError {
        let thread_id = thread_id.map(str::to_string);
        match error {
            AssistantsError::InvalidPath | AssistantsError::InvalidInput { .. } => {
                TurnError::InvalidRequest(error.upstream_message())
            }
            AssistantsError::NotFound { message } => TurnError::UpstreamRejected {
                detail: match thread_id.as_deref() {
                    Some(thread_id) => format!("thread {thread_id} is not usable: {message}"),
                    None => message,
                },
                thread_id,
            },
            error => match error.kind() {
                ErrorKind::RateLimited => TurnError::RateLimited {
                    thread_id,
                    retries: self.retry.max_retries,
                    retry_after: error.retry_after(),
                },
                ErrorKind::Transient => TurnError::UpstreamUnavailable {
                    thread_id,
                    detail: error.upstream_message(),
                },
                ErrorKind::NotFound | ErrorKind::Permanent => TurnError::UpstreamRejected {
                    thread_id,
                    detail: error.upstream_message(),
                },
            },
        }
    }
}

fn poll_timeout(thread_id: &str, run: Run, waited: Duration) -> TurnError {
    tracing::warn!(
        target: LOG_TARGET,
        thread_id,
        run_id = %run.id,
        status = %run.status,
        waited_ms = waited.as_millis() as u64,
        "poll budget exhausted; leaving run in place",
    );
    TurnError::Timeout {
        thread_id: thread_id.to_string(),
        run_id: run.id,
        waited,
    }
}

/// Trimmed, non-empty ids in first-seen order without repeats.
fn unique_file_ids(file_ids: &[String]) -> Vec<String> {
    let mut unique: Vec<String> = Vec::with_capacity(file_ids.len());
    for file_id in file_ids.iter().map(|file_id| file_id.trim()) {
        if !file_id.is_empty() && !unique.iter().any(|seen| seen == file_id) {
            unique.push(file_id.to_string());
        }
    }
    unique
}
