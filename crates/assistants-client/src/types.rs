use std::fmt;

use serde::{Deserialize, Serialize};

pub const CODE_INTERPRETER_TOOL: &str = "code_interpreter";
pub const ASSISTANTS_FILE_PURPOSE: &str = "assistants";
pub const DEFAULT_MESSAGE_PAGE_LIMIT: u32 = 100;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolSpec {
    #[serde(rename = "type")]
    pub kind: String,
}

impl ToolSpec {
    #[must_use]
    pub fn code_interpreter() -> Self {
        Self {
            kind: CODE_INTERPRETER_TOOL.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateAssistantRequest {
    pub name: String,
    pub instructions: String,
    pub model: String,
    pub tools: Vec<ToolSpec>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Assistant {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub instructions: Option<String>,
    #[serde(default)]
    pub tools: Vec<ToolSpec>,
    #[serde(default)]
    pub created_at: i64,
}

impl Assistant {
    #[must_use]
    pub fn has_tool(&self, kind: &str) -> bool {
        self.tools.iter().any(|tool| tool.kind == kind)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Thread {
    pub id: String,
    #[serde(default)]
    pub created_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize)]
pub struct MessageAttachment {
    pub file_id: String,
    pub tools: Vec<ToolSpec>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateMessageRequest {
    pub role: MessageRole,
    pub content: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<MessageAttachment>,
}

impl CreateMessageRequest {
    /// User message whose attached files are mounted into the code-interpreter sandbox.
    #[must_use]
    pub fn user(content: impl Into<String>, file_ids: &[String]) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
            attachments: file_ids
                .iter()
                .map(|file_id| MessageAttachment {
                    file_id: file_id.clone(),
                    tools: vec![ToolSpec::code_interpreter()],
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ThreadMessage {
    pub id: String,
    #[serde(default)]
    pub thread_id: String,
    pub role: MessageRole,
    #[serde(default)]
    pub content: Vec<MessageContent>,
    #[serde(default)]
    pub run_id: Option<String>,
    #[serde(default)]
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageContent {
    Text { text: TextContent },
    ImageFile { image_file: ImageFileRef },
    Refusal { refusal: String },
    #[serde(other)]
    Unsupported,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TextContent {
    pub value: String,
    #[serde(default)]
    pub annotations: Vec<Annotation>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ImageFileRef {
    pub file_id: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Annotation {
    FileCitation {
        #[serde(default)]
        text: String,
        file_citation: FileCitationRef,
    },
    FilePath {
        #[serde(default)]
        text: String,
        file_path: FilePathRef,
    },
    ContainerFileCitation {
        #[serde(default)]
        text: String,
        container_id: String,
        file_id: String,
        #[serde(default)]
        filename: Option<String>,
    },
    #[serde(other)]
    Unsupported,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FileCitationRef {
    pub file_id: String,
    #[serde(default)]
    pub filename: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FilePathRef {
    pub file_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateRunRequest {
    pub assistant_id: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolSpec>,
}

impl CreateRunRequest {
    #[must_use]
    pub fn with_code_interpreter(assistant_id: impl Into<String>) -> Self {
        Self {
            assistant_id: assistant_id.into(),
            tools: vec![ToolSpec::code_interpreter()],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    InProgress,
    RequiresAction,
    Cancelling,
    Cancelled,
    Failed,
    Completed,
    Incomplete,
    Expired,
}

impl RunStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::InProgress => "in_progress",
            Self::RequiresAction => "requires_action",
            Self::Cancelling => "cancelling",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
            Self::Completed => "completed",
            Self::Incomplete => "incomplete",
            Self::Expired => "expired",
        }
    }

    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Cancelled | Self::Failed | Self::Completed | Self::Incomplete | Self::Expired
        )
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Run {
    pub id: String,
    #[serde(default)]
    pub thread_id: String,
    pub status: RunStatus,
    #[serde(default)]
    pub assistant_id: Option<String>,
    #[serde(default)]
    pub created_at: i64,
    #[serde(default)]
    pub last_error: Option<RunLastError>,
    #[serde(default)]
    pub incomplete_details: Option<IncompleteDetails>,
}

impl Run {
    /// Reason reported by the upstream for a run that did not complete.
    #[must_use]
    pub fn failure_reason(&self) -> String {
        if let Some(error) = self.last_error.as_ref() {
            return match error.code.as_deref() {
                Some(code) if !code.is_empty() => format!("{code}: {}", error.message),
                _ => error.message.clone(),
            };
        }
        if let Some(reason) = self
            .incomplete_details
            .as_ref()
            .and_then(|details| details.reason.clone())
        {
            return reason;
        }
        format!("run ended with status {}", self.status)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RunLastError {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IncompleteDetails {
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListOrder {
    Asc,
    Desc,
}

impl ListOrder {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Asc => "asc",
            Self::Desc => "desc",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ListMessagesQuery {
    pub run_id: Option<String>,
    pub order: ListOrder,
    pub limit: u32,
    pub after: Option<String>,
}

impl Default for ListMessagesQuery {
    fn default() -> Self {
        Self {
            run_id: None,
            order: ListOrder::Asc,
            limit: DEFAULT_MESSAGE_PAGE_LIMIT,
            after: None,
        }
    }
}

impl ListMessagesQuery {
    #[must_use]
    pub fn for_run(run_id: impl Into<String>) -> Self {
        Self {
            run_id: Some(run_id.into()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MessageList {
    #[serde(default)]
    pub data: Vec<ThreadMessage>,
    #[serde(default)]
    pub has_more: bool,
    #[serde(default)]
    pub last_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FileObject {
    pub id: String,
    #[serde(default)]
    pub bytes: u64,
    #[serde(default)]
    pub filename: String,
    #[serde(default)]
    pub purpose: String,
    #[serde(default)]
    pub created_at: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContainerFile {
    pub id: String,
    #[serde(default)]
    pub container_id: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub bytes: Option<u64>,
}

impl ContainerFile {
    #[must_use]
    pub fn filename(&self) -> Option<&str> {
        self.path
            .rsplit('/')
            .next()
            .map(str::trim)
            .filter(|name| !name.is_empty())
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct ApiErrorEnvelope {
    pub error: ApiErrorBody,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ApiErrorBody {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub code: Option<String>,
}
