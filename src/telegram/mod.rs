//! Chat transport.
//!
//! The orchestrator, watcher, and scanner talk to Telegram through the
//! [`ChatTransport`] trait; only the operations the core consumes are
//! modelled. [`api::TelegramApi`] is the thin Bot API implementation; tests
//! substitute a recording mock.

pub mod api;
pub mod format;

use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use api::TelegramApi;
pub use format::{truncate_message, MAX_MESSAGE_LEN};

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error {code}: {description}")]
    Api { code: i64, description: String },

    #[error("another poller is consuming updates")]
    Conflict,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Transient errors are retried with back-off and otherwise swallowed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Http(err) => err.is_timeout() || err.is_connect() || err.is_request(),
            Self::Api { code, .. } => *code >= 500,
            Self::Conflict => false,
            Self::Io(_) => false,
        }
    }

    /// A 400 on a markdown-formatted body; retried once as plain text.
    pub fn is_parse_rejection(&self) -> bool {
        matches!(self, Self::Api { code: 400, .. })
    }
}

pub type TransportResult<T> = std::result::Result<T, TransportError>;

pub type ChatId = i64;
pub type MessageId = i64;

// ============================================================================
// Incoming updates
// ============================================================================

#[derive(Clone, Debug, Deserialize)]
pub struct UserRef {
    pub id: i64,
    #[serde(default)]
    pub username: Option<String>,
}

/// An incoming chat message, reduced to the fields the core reads.
#[derive(Clone, Debug)]
pub struct IncomingMessage {
    pub chat_id: ChatId,
    pub message_id: MessageId,
    pub from: UserRef,
    pub text: Option<String>,
    pub photo_file_id: Option<String>,
    pub voice_file_id: Option<String>,
    pub caption: Option<String>,
}

/// An inline-keyboard button press.
#[derive(Clone, Debug)]
pub struct CallbackQuery {
    pub id: String,
    pub chat_id: ChatId,
    pub message_id: MessageId,
    pub from: UserRef,
    pub data: String,
}

#[derive(Clone, Debug)]
pub enum UpdateKind {
    Message(IncomingMessage),
    Callback(CallbackQuery),
}

#[derive(Clone, Debug)]
pub struct Update {
    pub id: i64,
    pub kind: UpdateKind,
}

// ============================================================================
// Outgoing messages
// ============================================================================

#[derive(Clone, Debug, Default, Serialize)]
pub struct InlineKeyboard {
    pub rows: Vec<Vec<InlineButton>>,
}

#[derive(Clone, Debug, Serialize)]
pub struct InlineButton {
    pub text: String,
    pub callback_data: String,
}

impl InlineKeyboard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn row(mut self, buttons: Vec<InlineButton>) -> Self {
        self.rows.push(buttons);
        self
    }

    pub fn button(text: impl Into<String>, data: impl Into<String>) -> InlineButton {
        InlineButton {
            text: text.into(),
            callback_data: data.into(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct OutgoingMessage {
    pub chat_id: ChatId,
    pub text: String,
    pub reply_to: Option<MessageId>,
    pub keyboard: Option<InlineKeyboard>,
    /// Render as Markdown, falling back to plain text on rejection.
    pub markdown: bool,
}

impl OutgoingMessage {
    pub fn text(chat_id: ChatId, text: impl Into<String>) -> Self {
        Self {
            chat_id,
            text: text.into(),
            reply_to: None,
            keyboard: None,
            markdown: false,
        }
    }

    pub fn markdown(chat_id: ChatId, text: impl Into<String>) -> Self {
        Self {
            markdown: true,
            ..Self::text(chat_id, text)
        }
    }

    pub fn reply_to(mut self, message_id: Option<MessageId>) -> Self {
        self.reply_to = message_id;
        self
    }

    pub fn keyboard(mut self, keyboard: InlineKeyboard) -> Self {
        self.keyboard = Some(keyboard);
        self
    }
}

#[derive(Clone, Copy, Debug)]
pub enum ChatAction {
    Typing,
    UploadPhoto,
}

#[derive(Clone, Debug, Serialize)]
pub struct BotCommand {
    pub command: String,
    pub description: String,
}

// ============================================================================
// Transport trait
// ============================================================================

/// The chat operations the core consumes. Long-poll fetch returns the next
/// batch of updates after `offset`; all send/edit operations are
/// fire-and-confirm.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn get_updates(&self, offset: i64, timeout_secs: u64) -> TransportResult<Vec<Update>>;

    async fn send_message(&self, message: OutgoingMessage) -> TransportResult<MessageId>;

    async fn edit_message(
        &self,
        chat_id: ChatId,
        message_id: MessageId,
        text: &str,
        keyboard: Option<InlineKeyboard>,
    ) -> TransportResult<()>;

    async fn delete_message(&self, chat_id: ChatId, message_id: MessageId) -> TransportResult<()>;

    async fn answer_callback(&self, callback_id: &str, text: Option<&str>) -> TransportResult<()>;

    async fn send_chat_action(&self, chat_id: ChatId, action: ChatAction) -> TransportResult<()>;

    async fn set_my_commands(&self, commands: &[BotCommand]) -> TransportResult<()>;

    async fn delete_webhook(&self) -> TransportResult<()>;

    async fn download_file(&self, file_id: &str, dest: &Path) -> TransportResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        let server = TransportError::Api {
            code: 502,
            description: "bad gateway".into(),
        };
        assert!(server.is_transient());

        let bad_request = TransportError::Api {
            code: 400,
            description: "can't parse entities".into(),
        };
        assert!(!bad_request.is_transient());
        assert!(bad_request.is_parse_rejection());

        assert!(!TransportError::Conflict.is_transient());
    }

    #[test]
    fn test_keyboard_builder() {
        let kb = InlineKeyboard::new()
            .row(vec![
                InlineKeyboard::button("Allow", "perm:1:allow"),
                InlineKeyboard::button("Deny", "perm:1:deny"),
            ])
            .row(vec![InlineKeyboard::button("Yolo", "perm:1:yolo")]);
        assert_eq!(kb.rows.len(), 2);
        assert_eq!(kb.rows[0][1].callback_data, "perm:1:deny");
    }
}
