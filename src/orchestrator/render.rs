//! Streaming render state: the coalesced tool message.
//!
//! All tool invocations of a turn render into *one* chat message that grows
//! by edits. In yolo-like modes each block is shown as it arrives; in
//! interactive mode blocks stay hidden until the permission arbiter reveals
//! them just before its dialog. Reveals race new-block arrivals, so every
//! mutation runs under a per-session edit lock that also covers the chat
//! call.

use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::state::SessionFlags;
use crate::store::SessionId;
use crate::telegram::{format::tool_line, ChatId, ChatTransport, MessageId, OutgoingMessage};

struct ToolLine {
    correlation_id: String,
    text: String,
    revealed: bool,
}

#[derive(Default)]
struct ToolMessageState {
    chat_id: ChatId,
    message_id: Option<MessageId>,
    lines: Vec<ToolLine>,
    status_lines: Vec<String>,
    /// Reveals that arrived before their block (the arbiter races the
    /// stream); honored as soon as the block is added.
    early_reveals: std::collections::HashSet<String>,
}

impl ToolMessageState {
    fn body(&self) -> String {
        let mut parts: Vec<&str> = self
            .lines
            .iter()
            .filter(|line| line.revealed)
            .map(|line| line.text.as_str())
            .collect();
        parts.extend(self.status_lines.iter().map(String::as_str));
        parts.join("\n")
    }
}

/// Per-session coalesced tool messages.
pub struct ToolMessages {
    chat: Arc<dyn ChatTransport>,
    flags: Arc<SessionFlags>,
    inner: DashMap<SessionId, Arc<Mutex<ToolMessageState>>>,
}

impl ToolMessages {
    pub fn new(chat: Arc<dyn ChatTransport>, flags: Arc<SessionFlags>) -> Self {
        Self {
            chat,
            flags,
            inner: DashMap::new(),
        }
    }

    fn state(&self, session: SessionId) -> Arc<Mutex<ToolMessageState>> {
        self.inner
            .entry(session)
            .or_insert_with(|| Arc::new(Mutex::new(ToolMessageState::default())))
            .clone()
    }

    /// Record a new tool_use block. `visible` is true in yolo-like modes;
    /// hidden blocks wait for [`reveal`].
    ///
    /// [`reveal`]: Self::reveal
    pub async fn add_block(
        &self,
        session: SessionId,
        chat_id: ChatId,
        correlation_id: &str,
        name: &str,
        input: &Value,
        visible: bool,
    ) {
        let state = self.state(session);
        let mut state = state.lock().await;
        state.chat_id = chat_id;
        let visible = visible || state.early_reveals.remove(correlation_id);
        state.lines.push(ToolLine {
            correlation_id: correlation_id.to_string(),
            text: tool_line(name, input),
            revealed: visible,
        });
        if visible {
            self.flush(session, &mut state).await;
        }
    }

    /// Whether a block with this correlation id has been recorded yet.
    pub async fn has_block(&self, session: SessionId, correlation_id: &str) -> bool {
        let state = self.state(session);
        let state = state.lock().await;
        state
            .lines
            .iter()
            .any(|line| line.correlation_id == correlation_id)
    }

    /// Reveal a hidden block just before its permission dialog. A reveal
    /// for a block the stream has not delivered yet is remembered.
    pub async fn reveal(&self, session: SessionId, correlation_id: &str) {
        let state = self.state(session);
        let mut state = state.lock().await;
        let mut changed = false;
        let mut found = false;
        for line in &mut state.lines {
            if line.correlation_id == correlation_id {
                found = true;
                if !line.revealed {
                    line.revealed = true;
                    changed = true;
                }
            }
        }
        if !found {
            state.early_reveals.insert(correlation_id.to_string());
        }
        if changed {
            self.flush(session, &mut state).await;
        }
    }

    /// Append a resolution status line ("✓ Allowed Bash", …).
    pub async fn append_status(&self, session: SessionId, status: &str) {
        let state = self.state(session);
        let mut state = state.lock().await;
        state.status_lines.push(status.to_string());
        self.flush(session, &mut state).await;
    }

    /// The chat message id currently carrying this session's tool lines.
    pub async fn message_id(&self, session: SessionId) -> Option<MessageId> {
        let state = self.state(session);
        let state = state.lock().await;
        state.message_id
    }

    /// Forget the turn's tracker (on `Result`).
    pub fn reset(&self, session: SessionId) {
        self.inner.remove(&session);
    }

    async fn flush(&self, session: SessionId, state: &mut ToolMessageState) {
        if self.flags.is_silenced(session) {
            return;
        }
        let body = state.body();
        if body.is_empty() {
            return;
        }
        match state.message_id {
            Some(message_id) => {
                if let Err(err) = self
                    .chat
                    .edit_message(state.chat_id, message_id, &body, None)
                    .await
                {
                    tracing::debug!(error = %err, "tool message edit failed");
                }
            }
            None => {
                match self
                    .chat
                    .send_message(OutgoingMessage::text(state.chat_id, body))
                    .await
                {
                    Ok(message_id) => state.message_id = Some(message_id),
                    Err(err) => {
                        tracing::debug!(error = %err, "tool message send failed");
                    }
                }
            }
        }
    }
}
