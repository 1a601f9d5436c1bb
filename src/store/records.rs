//! Conversation record parsing.
//!
//! Each session file is line-delimited JSON written by the external agent.
//! The shapes here mirror that on-disk format: a `type` tag, a nested
//! `message` with `role` and `content`, and content that is either a bare
//! string or a list of typed blocks. Unknown fields are ignored; unknown
//! block types are preserved as [`ContentBlock::Other`] so a newer agent
//! version does not break parsing.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;

/// Kind tag of a record line.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    User,
    Assistant,
    System,
}

/// One line of a session file.
#[derive(Clone, Debug, Deserialize)]
pub struct Record {
    #[serde(rename = "type")]
    pub kind: RecordKind,
    #[serde(default)]
    pub message: Option<RecordMessage>,
    #[serde(rename = "isMeta", default)]
    pub is_meta: bool,
    #[serde(rename = "toolUseResult", default)]
    pub tool_use_result: Option<Value>,
    #[serde(default)]
    pub slug: Option<String>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct RecordMessage {
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub content: RecordContent,
}

/// Message content: a plain string or a block list.
#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
pub enum RecordContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl Default for RecordContent {
    fn default() -> Self {
        Self::Blocks(Vec::new())
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        is_error: Option<bool>,
    },
    Image {},
    #[serde(other)]
    Other,
}

impl Record {
    /// Parse a single line, returning `None` for blank or malformed input.
    pub fn parse_line(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        match serde_json::from_str::<Record>(line) {
            Ok(record) => Some(record),
            Err(err) => {
                tracing::debug!(error = %err, "skipping malformed record line");
                None
            }
        }
    }

    /// Concatenated text of all `text` blocks (or the bare string content).
    pub fn text(&self) -> Option<String> {
        let message = self.message.as_ref()?;
        match &message.content {
            RecordContent::Text(s) => {
                if s.is_empty() {
                    None
                } else {
                    Some(s.clone())
                }
            }
            RecordContent::Blocks(blocks) => {
                let mut out = String::new();
                for block in blocks {
                    if let ContentBlock::Text { text } = block {
                        if !out.is_empty() {
                            out.push('\n');
                        }
                        out.push_str(text);
                    }
                }
                if out.is_empty() {
                    None
                } else {
                    Some(out)
                }
            }
        }
    }

    /// True for a user entry that carries actual typed text: not meta, not a
    /// tool_result wrapper, not empty.
    pub fn is_real_user_text(&self) -> bool {
        if self.kind != RecordKind::User || self.is_meta || self.tool_use_result.is_some() {
            return false;
        }
        if self.has_tool_result_block() {
            return false;
        }
        self.text().is_some_and(|t| !t.trim().is_empty())
    }

    pub fn has_tool_use_block(&self) -> bool {
        self.blocks()
            .iter()
            .any(|b| matches!(b, ContentBlock::ToolUse { .. }))
    }

    pub fn has_tool_result_block(&self) -> bool {
        self.blocks()
            .iter()
            .any(|b| matches!(b, ContentBlock::ToolResult { .. }))
    }

    pub fn blocks(&self) -> &[ContentBlock] {
        match self.message.as_ref().map(|m| &m.content) {
            Some(RecordContent::Blocks(blocks)) => blocks,
            _ => &[],
        }
    }
}

/// Parse a complete file body, skipping malformed lines.
pub fn parse_records(body: &str) -> Vec<Record> {
    body.lines().filter_map(Record::parse_line).collect()
}

/// Squash a text into a one-line preview of at most `max` characters.
pub fn one_line_preview(text: &str, max: usize) -> String {
    let line = text
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("");
    let mut preview: String = line.chars().take(max).collect();
    if line.chars().count() > max {
        preview.push('…');
    }
    preview
}
