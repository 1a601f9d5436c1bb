//! Turn execution.
//!
//! One turn: resolve the session, acquire (or queue on) its channel,
//! stream events, render them, then run the post-stream bookkeeping that
//! keeps the watcher from re-emitting what was just rendered. Queued turns
//! drain strictly in order on the same task.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use super::{Orchestrator, QueuedTurn};
use crate::agent::{AgentChannel, AgentEvent, AssistantBlock, SpawnSpec, ToolGate};
use crate::permissions::DialogAnswer;
use crate::store::SessionId;
use crate::telegram::{ChatAction, ChatId, OutgoingMessage};

/// Tools that never render a tool-description line.
const SILENT_TOOLS: &[&str] = &["TodoWrite", "TaskCreate", "TaskUpdate", "AskUserQuestion"];

/// Grace period after a turn before the active-query marker clears and an
/// inactive channel closes; covers the Agent's trailing disk writes.
const TURN_SETTLE: Duration = Duration::from_secs(2);

const TYPING_INTERVAL: Duration = Duration::from_secs(4);

impl Orchestrator {
    /// Entry point for a user prompt (text, image caption, takeover
    /// resubmission, cancel cleanup).
    pub(crate) async fn submit_prompt(&self, chat_id: ChatId, turn: QueuedTurn) {
        let (session, cwd) = self.resolve_session().await;

        if !cwd.is_dir() {
            self.notify(
                chat_id,
                &format!("⚠️ Working directory {} does not exist.", cwd.display()),
            )
            .await;
            return;
        }

        if let Some(reply_to) = turn.reply_to {
            self.reply_targets.insert(session, reply_to);
        }

        let busy = self
            .channels
            .get(session)
            .is_some_and(|channel| channel.is_busy());
        if busy {
            // A text while a question dialog is open answers the question
            // instead of becoming a turn.
            if let Some(dialog) = self.arbiter.pending().open_question(session) {
                self.arbiter
                    .pending()
                    .resolve(dialog, DialogAnswer::Text(turn.prompt));
                return;
            }

            if self.queues.enqueue(session, turn).is_err() {
                self.notify(chat_id, "⚠️ Turn queue is full, message dropped.")
                    .await;
                return;
            }
            // Unblock the stream so the queue can drain.
            if self.arbiter.pending().any_open(session) {
                self.arbiter.deny_all(session);
            }
            return;
        }

        self.run_session(chat_id, session, cwd, turn).await;
    }

    /// Drain a session's queue if its channel is idle (used after switches).
    pub(crate) async fn drain_if_idle(&self, chat_id: ChatId, session: SessionId) {
        let busy = self
            .channels
            .get(session)
            .is_some_and(|channel| channel.is_busy());
        if busy {
            return;
        }
        if let Some(turn) = self.queues.pop(session) {
            let Some(cwd) = self.registry.active_cwd().await else {
                return;
            };
            self.run_session(chat_id, session, cwd, turn).await;
        }
    }

    /// Active session id and working directory, creating a fresh session on
    /// first contact.
    async fn resolve_session(&self) -> (SessionId, PathBuf) {
        let session = match self.registry.active_session().await {
            Some(session) => session,
            None => {
                let session = SessionId::new();
                if let Err(err) = self.registry.set_active_session(session).await {
                    tracing::warn!(error = %err, "session save failed");
                }
                session
            }
        };

        let cwd = match self.registry.active_cwd().await {
            Some(cwd) => cwd,
            None => {
                let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
                if let Err(err) = self.registry.set_active_cwd(&cwd).await {
                    tracing::warn!(error = %err, "cwd save failed");
                }
                cwd
            }
        };

        (session, cwd)
    }

    /// Execute a turn, then drain this session's queue in order.
    async fn run_session(&self, chat_id: ChatId, session: SessionId, cwd: PathBuf, first: QueuedTurn) {
        let mut turn = first;
        loop {
            self.execute_turn(chat_id, session, &cwd, &turn).await;

            for file in &turn.temp_files {
                let _ = tokio::fs::remove_file(file).await;
            }

            if let Some(next) = self.queues.pop(session) {
                turn = next;
                continue;
            }
            break;
        }

        // A background session with nothing left to do releases its Agent
        // after the settle grace.
        if self.registry.active_session().await != Some(session) {
            let channels = self.channels.clone();
            let queues_empty = self.queues.is_empty(session);
            if queues_empty {
                tokio::spawn(async move {
                    tokio::time::sleep(TURN_SETTLE).await;
                    if let Some(channel) = channels.get(session) {
                        if !channel.is_busy() {
                            channel.close().await;
                            channels.remove(session);
                        }
                    }
                });
            }
        }
    }

    async fn execute_turn(&self, chat_id: ChatId, session: SessionId, cwd: &Path, turn: &QueuedTurn) {
        self.flags.clear_denied(session);
        self.flags.begin_query(session);

        let path = self.store.session_path_for_cwd(cwd, session);
        let file_size = self.store.file_size(&path).await;

        let channel = match self.ensure_channel(chat_id, session, cwd, file_size).await {
            Some(channel) => channel,
            None => {
                self.settle_query(session);
                return;
            }
        };

        // Typing indicator, paused while a permission dialog is visible.
        let (stop_typing, typing_stopped) = watch::channel(false);
        if self.renderable(session, turn) {
            let chat = self.chat.clone();
            let arbiter = self.arbiter.clone();
            let mut stopped = typing_stopped;
            tokio::spawn(async move {
                loop {
                    if *stopped.borrow() {
                        break;
                    }
                    if !arbiter.dialog_active() {
                        let _ = chat.send_chat_action(chat_id, ChatAction::Typing).await;
                    }
                    tokio::select! {
                        _ = stopped.changed() => break,
                        _ = tokio::time::sleep(TYPING_INTERVAL) => {}
                    }
                }
            });
        }

        let mut stream = match channel.begin_turn(turn.prompt.clone()).await {
            Ok(stream) => stream,
            Err(err) => {
                let _ = stop_typing.send(true);
                self.notify(chat_id, &format!("⚠️ Agent unavailable: {err}")).await;
                self.settle_query(session);
                return;
            }
        };

        let mut text_buffer: Vec<String> = Vec::new();
        let mut turn_error: Option<String> = None;

        while let Some(event) = stream.next_event().await {
            match event {
                AgentEvent::SystemInit { session_id } => {
                    tracing::debug!(session = %session_id, "turn started");
                }
                AgentEvent::Assistant { blocks } => {
                    for block in blocks {
                        match block {
                            AssistantBlock::Text(text) => text_buffer.push(text),
                            AssistantBlock::ToolUse { id, name, input } => {
                                if SILENT_TOOLS.contains(&name.as_str()) {
                                    continue;
                                }
                                let visible = self.arbiter.is_preapproved(session, &name);
                                if !visible {
                                    // A dialog will follow; give the user
                                    // the assistant's context first.
                                    self.flush_text(chat_id, session, turn, &mut text_buffer)
                                        .await;
                                }
                                self.tool_messages
                                    .add_block(session, chat_id, &id, &name, &input, visible)
                                    .await;
                            }
                        }
                    }
                }
                AgentEvent::TaskStarted { description } => {
                    if self.renderable(session, turn) {
                        self.notify(chat_id, &format!("🚀 Task started: {description}"))
                            .await;
                    }
                }
                AgentEvent::TaskNotification { status, summary } => {
                    if self.renderable(session, turn) {
                        self.notify(chat_id, &format!("📦 {status}: {summary}")).await;
                    }
                }
                AgentEvent::Result { is_error, errors } => {
                    self.tool_messages.reset(session);
                    if is_error && !channel.was_interrupted() {
                        turn_error = Some(if errors.is_empty() {
                            "agent reported an error".to_string()
                        } else {
                            errors.join("\n")
                        });
                    }
                    break;
                }
            }
        }

        drop(stream);
        let _ = stop_typing.send(true);

        if self.renderable(session, turn) {
            if let Some(error) = turn_error {
                self.notify(chat_id, &format!("⚠️ {error}")).await;
            }
            if !text_buffer.is_empty() {
                let reply_to = self.reply_targets.get(&session).map(|entry| *entry);
                let body = text_buffer.join("\n\n");
                let message = OutgoingMessage::markdown(chat_id, body).reply_to(reply_to);
                if let Err(err) = self.chat.send_message(message).await {
                    tracing::warn!(error = %err, "final text send failed");
                }
            }
        }

        // Self-write bookkeeping: anything the turn appended to disk was
        // already rendered live; the watcher must not tail it again.
        let end_size = self.store.file_size(&path).await;
        channel.record_self_size(end_size);
        self.watcher.skip_to_end(session);
        self.settle_query(session);
    }

    /// Reuse the session's channel, recreating it when stale, or spawn a
    /// fresh one (resuming if the record file already has content).
    async fn ensure_channel(
        &self,
        chat_id: ChatId,
        session: SessionId,
        cwd: &Path,
        file_size: u64,
    ) -> Option<Arc<AgentChannel>> {
        let mut existing = self.channels.get(session);
        if let Some(ref channel) = existing {
            if channel.check_stale(file_size) && !channel.is_busy() {
                tracing::debug!(session = %session, "channel stale, recreating");
                channel.close().await;
                self.channels.remove(session);
                existing = None;
            }
        }
        if let Some(channel) = existing {
            return Some(channel);
        }

        let gate: Arc<dyn ToolGate> = self.arbiter.clone();
        let mut spec = SpawnSpec {
            session_id: session,
            cwd: cwd.to_path_buf(),
            model: self.registry.model().await,
            resume: file_size > 0,
        };

        let handle = match self.backend.spawn(spec.clone(), gate.clone()).await {
            Ok(handle) => handle,
            Err(err) if spec.resume => {
                // A corrupted record file can break resume; retry once as a
                // fresh session rather than locking the user out.
                tracing::warn!(error = %err, "resume failed, retrying fresh");
                spec.resume = false;
                match self.backend.spawn(spec, gate).await {
                    Ok(handle) => handle,
                    Err(err) => {
                        tracing::error!(error = %err, "agent spawn failed");
                        self.notify(chat_id, &format!("⚠️ Failed to start the agent: {err}"))
                            .await;
                        return None;
                    }
                }
            }
            Err(err) => {
                tracing::error!(error = %err, "agent spawn failed");
                self.notify(chat_id, &format!("⚠️ Failed to start the agent: {err}"))
                    .await;
                return None;
            }
        };

        let channel = Arc::new(AgentChannel::new(
            session,
            cwd.to_path_buf(),
            handle,
            file_size,
        ));
        self.channels.insert(session, channel.clone());
        Some(channel)
    }

    fn renderable(&self, session: SessionId, turn: &QueuedTurn) -> bool {
        !turn.quiet && !self.flags.is_silenced(session)
    }

    async fn flush_text(
        &self,
        chat_id: ChatId,
        session: SessionId,
        turn: &QueuedTurn,
        buffer: &mut Vec<String>,
    ) {
        if buffer.is_empty() || !self.renderable(session, turn) {
            return;
        }
        let body = buffer.join("\n\n");
        buffer.clear();
        if let Err(err) = self
            .chat
            .send_message(OutgoingMessage::markdown(chat_id, body))
            .await
        {
            tracing::warn!(error = %err, "text flush failed");
        }
    }

    /// Clear the active-query marker after the settle grace (trailing disk
    /// writes belong to this turn, not a third party).
    fn settle_query(&self, session: SessionId) {
        let flags = self.flags.clone();
        tokio::spawn(async move {
            tokio::time::sleep(TURN_SETTLE).await;
            flags.end_query(session);
        });
    }
}
