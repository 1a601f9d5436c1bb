//! Test doubles: a recording chat transport and a scripted Agent backend.
//!
//! Integration suites drive the orchestrator end-to-end with these, so they
//! live in the library rather than under `tests/`. Nothing here runs in the
//! daemon.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::sync::Mutex as AsyncMutex;

use crate::agent::{
    AgentBackend, AgentEvent, AgentHandle, AgentResult, AssistantBlock,
    PermissionVerdict, SpawnSpec, ToolGate, ToolUseRequest,
};
use crate::telegram::{
    BotCommand, CallbackQuery, ChatAction, ChatId, ChatTransport, IncomingMessage, InlineKeyboard,
    MessageId, OutgoingMessage, TransportResult, Update, UpdateKind, UserRef,
};

// ============================================================================
// MockChat
// ============================================================================

#[derive(Clone, Debug)]
pub struct SentMessage {
    pub chat_id: ChatId,
    pub message_id: MessageId,
    pub text: String,
    pub reply_to: Option<MessageId>,
    pub keyboard: Option<InlineKeyboard>,
}

#[derive(Clone, Debug)]
pub struct EditedMessage {
    pub chat_id: ChatId,
    pub message_id: MessageId,
    pub text: String,
}

/// Records every outgoing operation; feeds injected updates to the poll
/// loop.
pub struct MockChat {
    next_message_id: AtomicI64,
    next_update_id: AtomicI64,
    pub sent: Mutex<Vec<SentMessage>>,
    pub edits: Mutex<Vec<EditedMessage>>,
    pub deleted: Mutex<Vec<(ChatId, MessageId)>>,
    pub actions: Mutex<Vec<ChatId>>,
    updates: Mutex<VecDeque<Update>>,
}

impl MockChat {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self {
            next_message_id: AtomicI64::new(1000),
            next_update_id: AtomicI64::new(1),
            sent: Mutex::new(Vec::new()),
            edits: Mutex::new(Vec::new()),
            deleted: Mutex::new(Vec::new()),
            actions: Mutex::new(Vec::new()),
            updates: Mutex::new(VecDeque::new()),
        }
    }

    pub fn push_text(&self, chat_id: ChatId, from_id: i64, text: &str) {
        let id = self.next_update_id.fetch_add(1, Ordering::SeqCst);
        self.updates.lock().unwrap().push_back(Update {
            id,
            kind: UpdateKind::Message(IncomingMessage {
                chat_id,
                message_id: id + 5000,
                from: UserRef {
                    id: from_id,
                    username: None,
                },
                text: Some(text.to_string()),
                photo_file_id: None,
                voice_file_id: None,
                caption: None,
            }),
        });
    }

    pub fn push_callback(&self, chat_id: ChatId, from_id: i64, message_id: MessageId, data: &str) {
        let id = self.next_update_id.fetch_add(1, Ordering::SeqCst);
        self.updates.lock().unwrap().push_back(Update {
            id,
            kind: UpdateKind::Callback(CallbackQuery {
                id: format!("cb-{id}"),
                chat_id,
                message_id,
                from: UserRef {
                    id: from_id,
                    username: None,
                },
                data: data.to_string(),
            }),
        });
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    pub fn sent_messages(&self) -> Vec<SentMessage> {
        self.sent.lock().unwrap().clone()
    }

    pub fn edited_messages(&self) -> Vec<EditedMessage> {
        self.edits.lock().unwrap().clone()
    }

    pub fn deleted_messages(&self) -> Vec<(ChatId, MessageId)> {
        self.deleted.lock().unwrap().clone()
    }

    /// Most recent body shown for a message, following edits.
    pub fn current_text(&self, message_id: MessageId) -> Option<String> {
        if let Some(edit) = self
            .edits
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|e| e.message_id == message_id)
        {
            return Some(edit.text.clone());
        }
        self.sent
            .lock()
            .unwrap()
            .iter()
            .find(|s| s.message_id == message_id)
            .map(|s| s.text.clone())
    }

    pub fn last_text_of(&self, chat_id: ChatId) -> Option<String> {
        let sent = self.sent.lock().unwrap();
        let message_id = sent.iter().rev().find(|s| s.chat_id == chat_id)?.message_id;
        drop(sent);
        self.current_text(message_id)
    }

    /// First sent message whose keyboard carries a callback with this
    /// prefix.
    pub fn find_dialog(&self, prefix: &str) -> Option<SentMessage> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .find(|s| {
                s.keyboard.as_ref().is_some_and(|kb| {
                    kb.rows
                        .iter()
                        .flatten()
                        .any(|b| b.callback_data.starts_with(prefix))
                })
            })
            .cloned()
    }
}

#[async_trait]
impl ChatTransport for MockChat {
    async fn get_updates(&self, _offset: i64, _timeout_secs: u64) -> TransportResult<Vec<Update>> {
        let batch: Vec<Update> = self.updates.lock().unwrap().drain(..).collect();
        if batch.is_empty() {
            // Simulate an empty long-poll window without spinning.
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        Ok(batch)
    }

    async fn send_message(&self, message: OutgoingMessage) -> TransportResult<MessageId> {
        let id = self.next_message_id.fetch_add(1, Ordering::SeqCst);
        self.sent.lock().unwrap().push(SentMessage {
            chat_id: message.chat_id,
            message_id: id,
            text: message.text,
            reply_to: message.reply_to,
            keyboard: message.keyboard,
        });
        Ok(id)
    }

    async fn edit_message(
        &self,
        chat_id: ChatId,
        message_id: MessageId,
        text: &str,
        _keyboard: Option<InlineKeyboard>,
    ) -> TransportResult<()> {
        self.edits.lock().unwrap().push(EditedMessage {
            chat_id,
            message_id,
            text: text.to_string(),
        });
        Ok(())
    }

    async fn delete_message(&self, chat_id: ChatId, message_id: MessageId) -> TransportResult<()> {
        self.deleted.lock().unwrap().push((chat_id, message_id));
        Ok(())
    }

    async fn answer_callback(&self, _callback_id: &str, _text: Option<&str>) -> TransportResult<()> {
        Ok(())
    }

    async fn send_chat_action(&self, chat_id: ChatId, _action: ChatAction) -> TransportResult<()> {
        self.actions.lock().unwrap().push(chat_id);
        Ok(())
    }

    async fn set_my_commands(&self, _commands: &[BotCommand]) -> TransportResult<()> {
        Ok(())
    }

    async fn delete_webhook(&self) -> TransportResult<()> {
        Ok(())
    }

    async fn download_file(&self, _file_id: &str, dest: &Path) -> TransportResult<()> {
        tokio::fs::write(dest, b"mock-bytes").await?;
        Ok(())
    }
}

// ============================================================================
// Scripted agent
// ============================================================================

/// One step of a scripted turn.
#[derive(Clone, Debug)]
pub enum ScriptStep {
    /// Assistant text block.
    Text(String),
    /// Assistant tool_use block; the gate is consulted before continuing.
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    TaskStarted(String),
    /// Sleep to simulate a slow agent.
    Delay(std::time::Duration),
    /// Terminate the turn successfully.
    Finish,
    /// Terminate the turn with an error.
    Fail(String),
}

/// Scripted turn sequences shared by every handle the backend spawns, so a
/// recreated channel keeps consuming where the previous one stopped.
pub struct MockAgentBackend {
    turns: Arc<Mutex<VecDeque<Vec<ScriptStep>>>>,
    pub spawns: Arc<Mutex<Vec<SpawnSpec>>>,
    pub verdicts: Arc<Mutex<Vec<(String, bool)>>>,
}

impl MockAgentBackend {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self {
            turns: Arc::new(Mutex::new(VecDeque::new())),
            spawns: Arc::new(Mutex::new(Vec::new())),
            verdicts: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn script_turn(&self, steps: Vec<ScriptStep>) {
        self.turns.lock().unwrap().push_back(steps);
    }

    /// A plain text-answer turn.
    pub fn script_text(&self, text: &str) {
        self.script_turn(vec![ScriptStep::Text(text.into()), ScriptStep::Finish]);
    }

    pub fn spawn_count(&self) -> usize {
        self.spawns.lock().unwrap().len()
    }

    pub fn resume_flags(&self) -> Vec<bool> {
        self.spawns.lock().unwrap().iter().map(|s| s.resume).collect()
    }

    /// (tool name, allowed) pairs in gate-consultation order.
    pub fn gate_log(&self) -> Vec<(String, bool)> {
        self.verdicts.lock().unwrap().clone()
    }
}

#[async_trait]
impl AgentBackend for MockAgentBackend {
    async fn spawn(
        &self,
        spec: SpawnSpec,
        gate: Arc<dyn ToolGate>,
    ) -> AgentResult<Arc<dyn AgentHandle>> {
        self.spawns.lock().unwrap().push(spec.clone());
        Ok(Arc::new(MockAgentHandle {
            spec,
            gate,
            turns: self.turns.clone(),
            verdicts: self.verdicts.clone(),
            events: AsyncMutex::new(None),
            interrupted: Arc::new(AtomicBool::new(false)),
        }))
    }
}

struct MockAgentHandle {
    spec: SpawnSpec,
    gate: Arc<dyn ToolGate>,
    turns: Arc<Mutex<VecDeque<Vec<ScriptStep>>>>,
    verdicts: Arc<Mutex<Vec<(String, bool)>>>,
    events: AsyncMutex<Option<mpsc::Receiver<AgentEvent>>>,
    interrupted: Arc<AtomicBool>,
}

#[async_trait]
impl AgentHandle for MockAgentHandle {
    async fn send_input(&self, _text: String) -> AgentResult<()> {
        let steps = self
            .turns
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| vec![ScriptStep::Finish]);

        let (tx, rx) = mpsc::channel(64);
        *self.events.lock().await = Some(rx);

        let session_id = self.spec.session_id;
        let gate = self.gate.clone();
        let verdicts = self.verdicts.clone();
        let interrupted = self.interrupted.clone();
        interrupted.store(false, Ordering::SeqCst);

        tokio::spawn(async move {
            let _ = tx.send(AgentEvent::SystemInit { session_id }).await;
            for step in steps {
                if interrupted.load(Ordering::SeqCst) {
                    let _ = tx
                        .send(AgentEvent::Result {
                            is_error: true,
                            errors: vec!["interrupted".into()],
                        })
                        .await;
                    return;
                }
                match step {
                    ScriptStep::Text(text) => {
                        let _ = tx
                            .send(AgentEvent::Assistant {
                                blocks: vec![AssistantBlock::Text(text)],
                            })
                            .await;
                    }
                    ScriptStep::ToolUse { id, name, input } => {
                        let _ = tx
                            .send(AgentEvent::Assistant {
                                blocks: vec![AssistantBlock::ToolUse {
                                    id: id.clone(),
                                    name: name.clone(),
                                    input: input.clone(),
                                }],
                            })
                            .await;
                        let verdict = gate
                            .check(ToolUseRequest {
                                session_id,
                                correlation_id: id,
                                tool_name: name.clone(),
                                input,
                                reason: None,
                            })
                            .await;
                        let allowed = matches!(verdict, PermissionVerdict::Allow { .. });
                        verdicts.lock().unwrap().push((name, allowed));
                    }
                    ScriptStep::TaskStarted(description) => {
                        let _ = tx.send(AgentEvent::TaskStarted { description }).await;
                    }
                    ScriptStep::Delay(duration) => {
                        tokio::time::sleep(duration).await;
                    }
                    ScriptStep::Finish => {
                        let _ = tx
                            .send(AgentEvent::Result {
                                is_error: false,
                                errors: vec![],
                            })
                            .await;
                        return;
                    }
                    ScriptStep::Fail(message) => {
                        let _ = tx
                            .send(AgentEvent::Result {
                                is_error: true,
                                errors: vec![message],
                            })
                            .await;
                        return;
                    }
                }
            }
            let _ = tx
                .send(AgentEvent::Result {
                    is_error: false,
                    errors: vec![],
                })
                .await;
        });

        Ok(())
    }

    async fn next_event(&self) -> Option<AgentEvent> {
        let mut events = self.events.lock().await;
        match events.as_mut() {
            Some(rx) => rx.recv().await,
            None => None,
        }
    }

    async fn interrupt(&self) -> AgentResult<()> {
        self.interrupted.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> AgentResult<()> {
        Ok(())
    }
}

// Gate that always allows; used where the gate is irrelevant.
pub struct AllowAllGate;

#[async_trait]
impl ToolGate for AllowAllGate {
    async fn check(&self, _request: ToolUseRequest) -> PermissionVerdict {
        PermissionVerdict::allow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[tokio::test]
    async fn test_scripted_turn_flow() {
        let backend = MockAgentBackend::new();
        backend.script_turn(vec![
            ScriptStep::Text("hi".into()),
            ScriptStep::ToolUse {
                id: "tu_1".into(),
                name: "Bash".into(),
                input: serde_json::json!({"command": "ls"}),
            },
            ScriptStep::Finish,
        ]);

        let handle = backend
            .spawn(
                SpawnSpec {
                    session_id: crate::store::SessionId::new(),
                    cwd: PathBuf::from("/tmp"),
                    model: None,
                    resume: false,
                },
                Arc::new(AllowAllGate),
            )
            .await
            .unwrap();

        handle.send_input("go".into()).await.unwrap();

        let mut kinds = Vec::new();
        while let Some(event) = handle.next_event().await {
            let done = event.is_result();
            kinds.push(event);
            if done {
                break;
            }
        }
        assert_eq!(kinds.len(), 4); // init, text, tool_use, result
        assert_eq!(backend.gate_log(), vec![("Bash".to_string(), true)]);
    }

    #[tokio::test]
    async fn test_mock_chat_records() {
        let chat = MockChat::new();
        let id = chat
            .send_message(OutgoingMessage::text(7, "hello"))
            .await
            .unwrap();
        chat.edit_message(7, id, "edited", None).await.unwrap();
        assert_eq!(chat.current_text(id).as_deref(), Some("edited"));
    }
}
