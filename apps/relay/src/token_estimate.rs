use std::sync::OnceLock;

use serde::Serialize;
use tiktoken_rs::CoreBPE;

const LOG_TARGET: &str = "interpreter_relay::token_estimate";
const TEXT_EXTENSIONS: [&str; 6] = ["csv", "txt", "json", "md", "py", "js"];
const CHARS_PER_TOKEN: usize = 4;
const TOKENS_PER_KIB: f64 = 250.0;

static TOKENIZER: OnceLock<Option<CoreBPE>> = OnceLock::new();

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentClass {
    Text,
    Binary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenEstimate {
    pub tokens: u64,
    pub size_bytes: u64,
    /// False only when the text was run through the tokenizer.
    pub estimated: bool,
    pub class: ContentClass,
}

/// Counts UTF-8 text uploads with the `o200k_base` encoding. Falls back to one token per four
/// characters when the tokenizer is unavailable, and to 250 tokens per KiB for everything else.
pub fn estimate_file_tokens(filename: &str, content: &[u8]) -> TokenEstimate {
    let size_bytes = content.len() as u64;
    if is_text_file(filename) {
        if let Ok(text) = std::str::from_utf8(content) {
            let (tokens, estimated) = match tokenizer() {
                Some(bpe) => (bpe.encode_ordinary(text).len() as u64, false),
                None => ((text.chars().count() / CHARS_PER_TOKEN) as u64, true),
            };
            return TokenEstimate {
                tokens,
                size_bytes,
                estimated,
                class: ContentClass::Text,
            };
        }
    }

    let size_kib = content.len() as f64 / 1024.0;
    TokenEstimate {
        tokens: (size_kib * TOKENS_PER_KIB) as u64,
        size_bytes,
        estimated: true,
        class: ContentClass::Binary,
    }
}

fn tokenizer() -> Option<&'static CoreBPE> {
    TOKENIZER
        .get_or_init(|| match tiktoken_rs::o200k_base() {
            Ok(bpe) => Some(bpe),
            Err(error) => {
                tracing::warn!(
                    target: LOG_TARGET,
                    error = %error,
                    "tokenizer unavailable; using character heuristic",
                );
                None
            }
        })
        .as_ref()
}

fn is_text_file(filename: &str) -> bool {
    filename
        .rsplit_once('.')
        .is_some_and(|(_, extension)| TEXT_EXTENSIONS.contains(&extension))
}
