//! Scripted in-memory upstream used by unit and router tests.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use assistants_client::{
    Assistant, AssistantsApi, AssistantsError, ContainerFile, ContentStream,
    CreateAssistantRequest, CreateMessageRequest, CreateRunRequest, FileObject,
    ListMessagesQuery, MessageList, RetryPolicy, Run, RunStatus, Thread, ThreadMessage, ToolSpec,
};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use axum::http::StatusCode;
use serde_json::{Value, json};

pub(crate) fn test_retry_policy() -> RetryPolicy {
    RetryPolicy {
        base_delay: Duration::from_millis(1),
        multiplier: 2.0,
        max_retries: 3,
        max_delay: Duration::from_millis(5),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StubFailure {
    RateLimited,
    Unavailable,
    Rejected,
}

impl StubFailure {
    fn into_error(self, operation: &str) -> AssistantsError {
        match self {
            Self::RateLimited => AssistantsError::RateLimited {
                message: format!("Rate limit reached during {operation}"),
                retry_after: None,
            },
            Self::Unavailable => AssistantsError::Unavailable {
                status: StatusCode::SERVICE_UNAVAILABLE,
                message: "The server is overloaded".to_string(),
            },
            Self::Rejected => AssistantsError::Rejected {
                status: StatusCode::BAD_REQUEST,
                message: format!("Invalid request for {operation}"),
            },
        }
    }
}

#[derive(Default)]
struct StubState {
    next_id: usize,
    assistants: Vec<Assistant>,
    created_assistants: Vec<CreateAssistantRequest>,
    threads: Vec<String>,
    posted: Vec<(String, CreateMessageRequest)>,
    run_statuses: VecDeque<RunStatus>,
    run_error: Option<(String, String)>,
    replies: Vec<Value>,
    page_size: Option<u32>,
    poll_delay: Option<Duration>,
    failures: HashMap<&'static str, VecDeque<StubFailure>>,
    calls: HashMap<&'static str, usize>,
    files: HashMap<String, (String, Bytes)>,
    container_files: HashMap<(String, String), (String, Bytes)>,
}

impl StubState {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}_{:04}", self.next_id)
    }
}

#[derive(Default)]
pub(crate) struct StubApi {
    state: Mutex<StubState>,
}

impl StubApi {
    pub(crate) fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn state(&self) -> MutexGuard<'_, StubState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn add_assistant(&self, assistant_id: &str) {
        self.state().assistants.push(stub_assistant(assistant_id, "gpt-4.1"));
    }

    pub(crate) fn add_thread(&self, thread_id: &str) {
        self.state().threads.push(thread_id.to_string());
    }

    /// Statuses returned by successive run polls; the last one repeats.
    pub(crate) fn set_run_statuses(&self, statuses: &[RunStatus]) {
        self.state().run_statuses = statuses.iter().copied().collect();
    }

    pub(crate) fn set_run_error(&self, code: &str, message: &str) {
        self.state().run_error = Some((code.to_string(), message.to_string()));
    }

    /// Appends one assistant message (a content-block array) to every run's output.
    pub(crate) fn add_reply(&self, content: Value) {
        self.state().replies.push(content);
    }

    pub(crate) fn add_text_reply(&self, text: &str) {
        self.add_reply(json!([{ "type": "text", "text": { "value": text, "annotations": [] } }]));
    }

    pub(crate) fn set_page_size(&self, page_size: u32) {
        self.state().page_size = Some(page_size);
    }

    /// Makes every run poll stall for `delay` before answering.
    pub(crate) fn set_poll_delay(&self, delay: Duration) {
        self.state().poll_delay = Some(delay);
    }

    pub(crate) fn fail(&self, operation: &'static str, failure: StubFailure, times: usize) {
        let mut state = self.state();
        let queue = state.failures.entry(operation).or_default();
        for _ in 0..times {
            queue.push_back(failure);
        }
    }

    pub(crate) fn add_file(&self, file_id: &str, filename: &str, content: &'static [u8]) {
        self.state().files.insert(
            file_id.to_string(),
            (filename.to_string(), Bytes::from_static(content)),
        );
    }

    pub(crate) fn add_container_file(
        &self,
        container_id: &str,
        file_id: &str,
        path: &str,
        content: &'static [u8],
    ) {
        self.state().container_files.insert(
            (container_id.to_string(), file_id.to_string()),
            (path.to_string(), Bytes::from_static(content)),
        );
    }

    pub(crate) fn calls(&self, operation: &str) -> usize {
        self.state().calls.get(operation).copied().unwrap_or(0)
    }

    pub(crate) fn created_assistants(&self) -> Vec<CreateAssistantRequest> {
        self.state().created_assistants.clone()
    }

    pub(crate) fn posted_messages(&self) -> Vec<(String, CreateMessageRequest)> {
        self.state().posted.clone()
    }

    pub(crate) fn uploaded(&self, file_id: &str) -> Option<(String, Bytes)> {
        self.state().files.get(file_id).cloned()
    }

    fn enter(&self, operation: &'static str) -> Result<MutexGuard<'_, StubState>, AssistantsError> {
        let mut state = self.state();
        *state.calls.entry(operation).or_default() += 1;
        if let Some(failure) = state
            .failures
            .get_mut(operation)
            .and_then(VecDeque::pop_front)
        {
            return Err(failure.into_error(operation));
        }
        Ok(state)
    }
}

fn stub_assistant(assistant_id: &str, model: &str) -> Assistant {
    Assistant {
        id: assistant_id.to_string(),
        name: Some("Code Interpreter Explorer".to_string()),
        model: model.to_string(),
        instructions: None,
        tools: vec![ToolSpec::code_interpreter()],
        created_at: 1,
    }
}

fn decode<T: serde::de::DeserializeOwned>(value: Value) -> Result<T, AssistantsError> {
    serde_json::from_value(value).map_err(|error| AssistantsError::Decode {
        message: error.to_string(),
    })
}

fn ensure_thread(state: &StubState, thread_id: &str) -> Result<(), AssistantsError> {
    if state.threads.iter().any(|known| known == thread_id) {
        Ok(())
    } else {
        Err(AssistantsError::NotFound {
            message: format!("No thread found with id '{thread_id}'."),
        })
    }
}

fn single_chunk(content: Bytes, content_type: &str) -> ContentStream {
    ContentStream {
        content_type: Some(content_type.to_string()),
        content_length: Some(content.len() as u64),
        body: futures::stream::iter(vec![Ok(content)]).boxed(),
    }
}

#[async_trait]
impl AssistantsApi for StubApi {
    async fn create_assistant(
        &self,
        request: &CreateAssistantRequest,
    ) -> Result<Assistant, AssistantsError> {
        let mut state = self.enter("create_assistant")?;
        let assistant_id = state.next_id("asst");
        let assistant = stub_assistant(&assistant_id, &request.model);
        state.created_assistants.push(request.clone());
        state.assistants.push(assistant.clone());
        Ok(assistant)
    }

    async fn retrieve_assistant(&self, assistant_id: &str) -> Result<Assistant, AssistantsError> {
        let state = self.enter("retrieve_assistant")?;
        state
            .assistants
            .iter()
            .find(|assistant| assistant.id == assistant_id)
            .cloned()
            .ok_or_else(|| AssistantsError::NotFound {
                message: format!("No assistant found with id '{assistant_id}'."),
            })
    }

    async fn create_thread(&self) -> Result<Thread, AssistantsError> {
        let mut state = self.enter("create_thread")?;
        let thread_id = state.next_id("thread");
        state.threads.push(thread_id.clone());
        decode(json!({ "id": thread_id, "created_at": 1 }))
    }

    async fn create_message(
        &self,
        thread_id: &str,
        request: &CreateMessageRequest,
    ) -> Result<ThreadMessage, AssistantsError> {
        let mut state = self.enter("create_message")?;
        ensure_thread(&state, thread_id)?;
        let message_id = state.next_id("msg");
        state.posted.push((thread_id.to_string(), request.clone()));
        decode(json!({
            "id": message_id,
            "thread_id": thread_id,
            "role": "user",
            "content": [{ "type": "text", "text": { "value": request.content, "annotations": [] } }],
        }))
    }

    async fn create_run(
        &self,
        thread_id: &str,
        request: &CreateRunRequest,
    ) -> Result<Run, AssistantsError> {
        let mut state = self.enter("create_run")?;
        ensure_thread(&state, thread_id)?;
        let run_id = state.next_id("run");
        decode(json!({
            "id": run_id,
            "thread_id": thread_id,
            "assistant_id": request.assistant_id,
            "status": "queued",
        }))
    }

    async fn retrieve_run(&self, thread_id: &str, run_id: &str) -> Result<Run, AssistantsError> {
        let delay = self.state().poll_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.enter("retrieve_run")?;
        ensure_thread(&state, thread_id)?;
        let next = if state.run_statuses.len() > 1 {
            state.run_statuses.pop_front()
        } else {
            state.run_statuses.front().copied()
        };
        let status = next.unwrap_or(RunStatus::Completed);
        let last_error = match (&state.run_error, status) {
            (Some((code, message)), RunStatus::Failed) => {
                json!({ "code": code, "message": message })
            }
            _ => Value::Null,
        };
        decode(json!({
            "id": run_id,
            "thread_id": thread_id,
            "status": status.as_str(),
            "last_error": last_error,
        }))
    }

    async fn list_messages(
        &self,
        thread_id: &str,
        query: &ListMessagesQuery,
    ) -> Result<MessageList, AssistantsError> {
        let state = self.enter("list_messages")?;
        ensure_thread(&state, thread_id)?;

        let mut all: Vec<Value> = Vec::new();
        if query.run_id.is_none() {
            for (index, (_, posted)) in state
                .posted
                .iter()
                .filter(|(posted_thread, _)| posted_thread == thread_id)
                .enumerate()
            {
                all.push(json!({
                    "id": format!("msg_user_{index}"),
                    "thread_id": thread_id,
                    "role": "user",
                    "created_at": index,
                    "content": [{ "type": "text", "text": { "value": posted.content, "annotations": [] } }],
                }));
            }
        }
        for (index, content) in state.replies.iter().enumerate() {
            all.push(json!({
                "id": format!("msg_reply_{index}"),
                "thread_id": thread_id,
                "role": "assistant",
                "run_id": query.run_id,
                "created_at": 100 + index,
                "content": content,
            }));
        }

        let start = match query.after.as_deref() {
            Some(after) => all
                .iter()
                .position(|message| message["id"] == after)
                .map_or(all.len(), |position| position + 1),
            None => 0,
        };
        let page_size = state.page_size.unwrap_or(query.limit) as usize;
        let page: Vec<Value> = all.iter().skip(start).take(page_size).cloned().collect();
        let has_more = start + page.len() < all.len();
        let last_id = page.last().map(|message| message["id"].clone());

        decode(json!({
            "data": page,
            "has_more": has_more,
            "last_id": last_id,
        }))
    }

    async fn upload_file(
        &self,
        filename: &str,
        content: Bytes,
    ) -> Result<FileObject, AssistantsError> {
        let mut state = self.enter("upload_file")?;
        let file_id = state.next_id("file");
        let size = content.len() as u64;
        state
            .files
            .insert(file_id.clone(), (filename.to_string(), content));
        Ok(FileObject {
            id: file_id,
            bytes: size,
            filename: filename.to_string(),
            purpose: "assistants".to_string(),
            created_at: 1,
        })
    }

    async fn retrieve_file(&self, file_id: &str) -> Result<FileObject, AssistantsError> {
        let state = self.enter("retrieve_file")?;
        let (filename, content) =
            state
                .files
                .get(file_id)
                .ok_or_else(|| AssistantsError::NotFound {
                    message: format!("No such File object: {file_id}"),
                })?;
        Ok(FileObject {
            id: file_id.to_string(),
            bytes: content.len() as u64,
            filename: filename.clone(),
            purpose: "assistants_output".to_string(),
            created_at: 1,
        })
    }

    async fn file_content(&self, file_id: &str) -> Result<ContentStream, AssistantsError> {
        let state = self.enter("file_content")?;
        let (_, content) = state
            .files
            .get(file_id)
            .ok_or_else(|| AssistantsError::NotFound {
                message: format!("No such File object: {file_id}"),
            })?;
        Ok(single_chunk(content.clone(), "application/octet-stream"))
    }

    async fn retrieve_container_file(
        &self,
        container_id: &str,
        file_id: &str,
    ) -> Result<ContainerFile, AssistantsError> {
        let state = self.enter("retrieve_container_file")?;
        let (path, content) = state
            .container_files
            .get(&(container_id.to_string(), file_id.to_string()))
            .ok_or_else(|| AssistantsError::NotFound {
                message: "Container file not found".to_string(),
            })?;
        Ok(ContainerFile {
            id: file_id.to_string(),
            container_id: container_id.to_string(),
            path: path.clone(),
            bytes: Some(content.len() as u64),
        })
    }

    async fn container_file_content(
        &self,
        container_id: &str,
        file_id: &str,
    ) -> Result<ContentStream, AssistantsError> {
        let state = self.enter("container_file_content")?;
        let (_, content) = state
            .container_files
            .get(&(container_id.to_string(), file_id.to_string()))
            .ok_or_else(|| AssistantsError::NotFound {
                message: "Container file not found".to_string(),
            })?;
        Ok(single_chunk(content.clone(), "application/octet-stream"))
    }
}
