//! Line-oriented request/response protocol spoken over the terminal.
//!
//! The child prints a fixed ready-prompt whenever it can accept a line. After
//! a line is submitted it echoes it on the prompt line, prints the result, and
//! prints a fresh prompt:
//!
//! ```text
//! lona> (+ 1 2)
//! 3
//! lona>
//! ```
//!
//! Readiness is "cleaned output ends with the prompt"; the response is every
//! line that is not a prompt line. The prompt that opens the echo line belongs
//! to the previous read, so the response text starts with the bare echo.

use crate::sanitize::clean_bytes;

/// Raw bytes before the prompt inspected by the readiness check. Wide enough
/// for any control sequences wrapped around the prompt.
const READY_WINDOW: usize = 256;

/// Prompt detection and response extraction for one prompt marker.
#[derive(Debug, Clone)]
pub struct PromptMatcher {
    /// Prompt as printed, e.g. `"lona> "`.
    prompt: String,
    /// Prompt without trailing whitespace, e.g. `"lona>"`.
    bare: String,
}

impl PromptMatcher {
    pub fn new(prompt: impl Into<String>) -> Self {
        let prompt = prompt.into();
        let bare = prompt.trim().to_string();
        Self { prompt, bare }
    }

    /// Whether the accumulated raw output ends with the prompt. Only the tail
    /// is cleaned, so the cost does not grow with a long boot log.
    pub fn is_ready(&self, raw: &[u8]) -> bool {
        if raw.is_empty() {
            return false;
        }
        let start = raw.len().saturating_sub(self.prompt.len() + READY_WINDOW);
        clean_bytes(&raw[start..]).ends_with(&self.prompt)
    }

    /// If the accumulated raw output ends with the prompt, return the cleaned
    /// text. `None` means the child is not ready yet.
    pub fn take_ready(&self, raw: &[u8]) -> Option<String> {
        if !self.is_ready(raw) {
            return None;
        }
        let cleaned = clean_bytes(raw);
        cleaned.ends_with(&self.prompt).then_some(cleaned)
    }

    /// Whether a cleaned line is a prompt line: exactly the prompt, or the
    /// prompt followed by echoed input.
    pub fn is_prompt_line(&self, line: &str) -> bool {
        let stripped = line.trim();
        stripped == self.bare || stripped.starts_with(&self.prompt)
    }

    /// Extract the response from the cleaned output of one request: drop
    /// prompt lines (including the echo line, once the consumed prompt is put
    /// back in front of it), join the rest, and trim surrounding whitespace.
    pub fn extract_response(&self, cleaned: &str) -> String {
        format!("{}{}", self.prompt, cleaned)
            .split('\n')
            .filter(|line| !self.is_prompt_line(line))
            .collect::<Vec<_>>()
            .join("\n")
            .trim()
            .to_string()
    }

    /// Bytes to write for one request line.
    pub fn encode_request(input: &str) -> Vec<u8> {
        let mut data = Vec::with_capacity(input.len() + 1);
        data.extend_from_slice(input.trim_end_matches(['\r', '\n']).as_bytes());
        data.push(b'\n');
        data
    }
}
