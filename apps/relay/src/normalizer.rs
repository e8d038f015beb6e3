//! Flattens upstream message content into the relay's response shape.

use assistants_client::{Annotation, MessageContent, MessageRole, TextContent, ThreadMessage};
use serde::Serialize;

const IMAGE_EXTENSIONS: [&str; 7] = ["png", "jpg", "jpeg", "gif", "svg", "webp", "bmp"];
const SANDBOX_PREFIX: &str = "sandbox:";
const MESSAGE_SEPARATOR: &str = "\n\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FileKind {
    Image,
    File,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedFile {
    pub file_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    pub kind: FileKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedResult {
    pub thread_id: String,
    pub message: String,
    pub files: Vec<NormalizedFile>,
    pub annotations_consumed: bool,
}

/// One entry of a rendered thread history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedMessage {
    pub id: String,
    pub role: MessageRole,
    pub message: String,
    pub files: Vec<NormalizedFile>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    pub created_at: i64,
}

/// Builds the turn result from the messages a run produced. Only assistant-authored messages
/// contribute; their text is joined with a blank line in the order given.
pub fn normalize_run_output(thread_id: &str, messages: &[ThreadMessage]) -> NormalizedResult {
    let mut files = FileCollector::default();
    let mut annotations_consumed = false;
    let mut parts = Vec::new();

    for message in messages
        .iter()
        .filter(|message| message.role == MessageRole::Assistant)
    {
        let rendered = render_content(&message.content, &mut files);
        annotations_consumed |= rendered.annotations_consumed;
        if !rendered.text.is_empty() {
            parts.push(rendered.text);
        }
    }

    NormalizedResult {
        thread_id: thread_id.to_string(),
        message: parts.join(MESSAGE_SEPARATOR),
        files: files.into_files(),
        annotations_consumed,
    }
}

pub fn normalize_history(messages: &[ThreadMessage]) -> Vec<NormalizedMessage> {
    messages
        .iter()
        .map(|message| {
            let mut files = FileCollector::default();
            let rendered = render_content(&message.content, &mut files);
            NormalizedMessage {
                id: message.id.clone(),
                role: message.role,
                message: rendered.text,
                files: files.into_files(),
                run_id: message.run_id.clone(),
                created_at: message.created_at,
            }
        })
        .collect()
}

struct RenderedContent {
    text: String,
    annotations_consumed: bool,
}

fn render_content(blocks: &[MessageContent], files: &mut FileCollector) -> RenderedContent {
    let mut text = String::new();
    let mut annotations_consumed = false;

    for block in blocks {
        match block {
            MessageContent::Text { text: content } => {
                let (value, consumed) = render_text(content, files);
                annotations_consumed |= consumed;
                text.push_str(&value);
            }
            MessageContent::ImageFile { image_file } => files.add(NormalizedFile {
                file_id: image_file.file_id.clone(),
                container_id: None,
                display_name: None,
                kind: FileKind::Image,
            }),
            MessageContent::Refusal { refusal } => text.push_str(refusal),
            MessageContent::Unsupported => {}
        }
    }

    RenderedContent {
        text: text.trim().to_string(),
        annotations_consumed,
    }
}

fn render_text(content: &TextContent, files: &mut FileCollector) -> (String, bool) {
    let mut value = content.value.clone();
    let mut consumed = false;

    for annotation in &content.annotations {
        let (marker, file) = match annotation {
            Annotation::FileCitation {
                text,
                file_citation,
            } => (
                text,
                cited_file(
                    &file_citation.file_id,
                    None,
                    file_citation.filename.as_deref(),
                    text,
                ),
            ),
            Annotation::FilePath { text, file_path } => {
                (text, cited_file(&file_path.file_id, None, None, text))
            }
            Annotation::ContainerFileCitation {
                text,
                container_id,
                file_id,
                filename,
            } => (
                text,
                cited_file(file_id, Some(container_id), filename.as_deref(), text),
            ),
            Annotation::Unsupported => continue,
        };

        consumed = true;
        if !marker.is_empty() {
            value = value.replace(marker.as_str(), "");
        }
        files.add(file);
    }

    (value, consumed)
}

fn cited_file(
    file_id: &str,
    container_id: Option<&str>,
    filename: Option<&str>,
    marker: &str,
) -> NormalizedFile {
    let display_name = filename
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .or_else(|| sandbox_file_name(marker));
    let kind = if display_name.as_deref().is_some_and(has_image_extension)
        || has_image_extension(file_id)
    {
        FileKind::Image
    } else {
        FileKind::File
    };
    NormalizedFile {
        file_id: file_id.to_string(),
        container_id: container_id
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_string),
        display_name,
        kind,
    }
}

/// `sandbox:/mnt/data/chart.png` → `chart.png`
fn sandbox_file_name(marker: &str) -> Option<String> {
    let path = marker.trim().strip_prefix(SANDBOX_PREFIX)?;
    path.rsplit('/')
        .next()
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
}

pub fn has_image_extension(name: &str) -> bool {
    name.rsplit_once('.').is_some_and(|(_, extension)| {
        IMAGE_EXTENSIONS
            .iter()
            .any(|candidate| extension.eq_ignore_ascii_case(candidate))
    })
}

/// Files in first-seen order, unique by id.
#[derive(Default)]
struct FileCollector {
    files: Vec<NormalizedFile>,
}

impl FileCollector {
    fn add(&mut self, file: NormalizedFile) {
        if let Some(existing) = self
            .files
            .iter_mut()
            .find(|existing| existing.file_id == file.file_id)
        {
            if existing.container_id.is_none() {
                existing.container_id = file.container_id;
            }
            if existing.display_name.is_none() {
                existing.display_name = file.display_name;
            }
            if file.kind == FileKind::Image {
                existing.kind = FileKind::Image;
            }
            return;
        }
        self.files.push(file);
    }

    fn into_files(self) -> Vec<NormalizedFile> {
        self.files
    }
}
