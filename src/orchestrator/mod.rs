//! Per-update dispatch.
//!
//! The orchestrator classifies every incoming chat update, routes commands
//! and inline-keyboard callbacks, and drives turn execution (see `turn`).
//! It owns the per-session registries — channels, policy flags, turn queues,
//! reply targets — and implements the takeover handoff the scanner invokes.

mod commands;
pub mod queue;
pub mod render;
mod turn;

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::agent::AgentBackend;
use crate::config::Config;
use crate::permissions::{
    parse_ask_action, parse_perm_action, PendingInteractions, PermissionArbiter, SettingsRules,
};
use crate::registry::SessionRegistry;
use crate::scanner::TakeoverHandler;
use crate::state::{ChannelMap, SessionFlags};
use crate::store::{last_user_input, ConversationStore, SessionId};
use crate::telegram::{
    CallbackQuery, ChatId, ChatTransport, IncomingMessage, MessageId, OutgoingMessage, Update,
    UpdateKind,
};
use crate::watcher::WatcherHandle;

pub use queue::{QueuedTurn, TurnQueues};
pub use render::ToolMessages;

pub struct Orchestrator {
    chat: Arc<dyn ChatTransport>,
    store: ConversationStore,
    registry: Arc<SessionRegistry>,
    backend: Arc<dyn AgentBackend>,
    channels: Arc<ChannelMap>,
    flags: Arc<SessionFlags>,
    queues: TurnQueues,
    arbiter: Arc<PermissionArbiter>,
    tool_messages: Arc<ToolMessages>,
    reply_targets: DashMap<SessionId, MessageId>,
    watcher: WatcherHandle,
}

impl Orchestrator {
    pub fn new(
        config: Config,
        chat: Arc<dyn ChatTransport>,
        store: ConversationStore,
        registry: Arc<SessionRegistry>,
        backend: Arc<dyn AgentBackend>,
        watcher: WatcherHandle,
    ) -> Arc<Self> {
        let flags = SessionFlags::new();
        let channels = ChannelMap::new();
        let pending = Arc::new(PendingInteractions::new());
        let tool_messages = Arc::new(ToolMessages::new(chat.clone(), flags.clone()));
        let rules = SettingsRules::default_user(&store.claude_dir());
        let arbiter = Arc::new(PermissionArbiter::new(
            chat.clone(),
            flags.clone(),
            pending,
            rules,
            tool_messages.clone(),
            registry.clone(),
            config.yolo,
        ));

        Arc::new(Self {
            chat,
            store,
            registry,
            backend,
            channels,
            flags,
            queues: TurnQueues::new(),
            arbiter,
            tool_messages,
            reply_targets: DashMap::new(),
            watcher,
        })
    }

    // Shared-state accessors for the watcher and scanner tasks.

    pub fn flags(&self) -> Arc<SessionFlags> {
        self.flags.clone()
    }

    pub fn channels(&self) -> Arc<ChannelMap> {
        self.channels.clone()
    }

    pub fn arbiter(&self) -> Arc<PermissionArbiter> {
        self.arbiter.clone()
    }

    // ------------------------------------------------------------------
    // Update entry point
    // ------------------------------------------------------------------

    pub async fn handle_update(&self, update: Update) {
        match update.kind {
            UpdateKind::Message(message) => self.handle_message(message).await,
            UpdateKind::Callback(callback) => self.handle_callback(callback).await,
        }
    }

    async fn handle_message(&self, message: IncomingMessage) {
        let chat_id = message.chat_id;
        if let Err(err) = self.registry.set_chat_id(chat_id).await {
            tracing::warn!(error = %err, "chat id save failed");
        }

        if message.voice_file_id.is_some() {
            self.notify(
                chat_id,
                "🎙 Voice input needs the transcription model, which is not installed.",
            )
            .await;
            return;
        }

        if let Some(ref file_id) = message.photo_file_id {
            self.handle_photo(chat_id, &message, &file_id).await;
            return;
        }

        let Some(text) = message.text.clone() else {
            return;
        };

        if text.starts_with('/') {
            self.handle_command(chat_id, &text).await;
            return;
        }

        self.submit_prompt(
            chat_id,
            QueuedTurn::prompt(text).reply_to(Some(message.message_id)),
        )
        .await;
    }

    async fn handle_photo(&self, chat_id: ChatId, message: &IncomingMessage, file_id: &str) {
        let dest = std::env::temp_dir().join(format!("remotecode-{}.jpg", uuid::Uuid::new_v4()));
        if let Err(err) = self.chat.download_file(file_id, &dest).await {
            tracing::warn!(error = %err, "photo download failed");
            self.notify(chat_id, "⚠️ Could not download the image.").await;
            return;
        }

        let caption = message.caption.clone().unwrap_or_default();
        let prompt = if caption.is_empty() {
            format!("The user sent an image, saved at {}.", dest.display())
        } else {
            format!(
                "{caption}\n\n(The user attached an image, saved at {}.)",
                dest.display()
            )
        };

        let mut turn = QueuedTurn::prompt(prompt).reply_to(Some(message.message_id));
        turn.temp_files.push(dest);
        self.submit_prompt(chat_id, turn).await;
    }

    async fn handle_callback(&self, callback: CallbackQuery) {
        if let Err(err) = self.chat.answer_callback(&callback.id, None).await {
            tracing::debug!(error = %err, "answer_callback failed");
        }

        let Some((prefix, rest)) = callback.data.split_once(':') else {
            return;
        };
        let chat_id = callback.chat_id;

        match prefix {
            "sess" => {
                if let Some(session) = SessionId::parse(rest) {
                    self.switch_to(chat_id, session).await;
                }
            }
            "proj" => self.show_project_sessions(chat_id, rest).await,
            "newsess" => self.new_session_in_project(chat_id, rest).await,
            "sessdel" => {
                if let Some(session) = SessionId::parse(rest) {
                    self.delete_session(chat_id, session).await;
                }
            }
            "ask" => {
                if let Some((dialog, action)) = rest.split_once(':') {
                    if let (Ok(dialog), Some(answer)) =
                        (dialog.parse::<u64>(), parse_ask_action(action))
                    {
                        self.arbiter.pending().resolve(dialog, answer);
                    }
                }
            }
            "perm" => {
                if let Some((dialog, action)) = rest.split_once(':') {
                    if let (Ok(dialog), Some(answer)) =
                        (dialog.parse::<u64>(), parse_perm_action(action))
                    {
                        self.arbiter.pending().resolve(dialog, answer);
                    }
                }
            }
            "model" => {
                let model = rest.to_string();
                if let Err(err) = self.registry.set_model(&model).await {
                    tracing::warn!(error = %err, "model save failed");
                }
                self.notify(chat_id, &format!("🧠 Model set to {model}")).await;
            }
            // takeover:/dismiss: are routed by the daemon to the scanner
            // and watcher before the orchestrator sees them.
            other => {
                tracing::debug!(prefix = other, "unhandled callback prefix");
            }
        }
    }

    // ------------------------------------------------------------------
    // Session switching
    // ------------------------------------------------------------------

    /// Switch the active selection, applying the stop-old semantics: a busy
    /// outgoing session keeps streaming in the background, silent and
    /// auto-allowed, with its dialogs cancelled.
    pub async fn switch_to(&self, chat_id: ChatId, session: SessionId) {
        let previous = self.registry.active_session().await;
        if previous == Some(session) {
            self.notify(chat_id, "Already on that session.").await;
            return;
        }

        if let Some(previous) = previous {
            let busy = self
                .channels
                .get(previous)
                .is_some_and(|channel| channel.is_busy());
            if busy {
                self.flags.set_suppressed(previous, true);
                self.flags.set_yolo(previous, true);
            } else {
                self.flags.clear_session(previous);
            }
            self.arbiter.deny_all(previous);
        }

        self.flags.set_suppressed(session, false);

        let cwd = match self.store.session_info(session).await {
            Some(info) => crate::store::decode_project_dir(&info.encoded_project),
            None => self
                .registry
                .active_cwd()
                .await
                .unwrap_or_else(|| std::path::PathBuf::from(".")),
        };
        if let Err(err) = self.registry.set_active_session(session).await {
            tracing::warn!(error = %err, "session save failed");
        }
        if let Err(err) = self.registry.set_active_cwd(&cwd).await {
            tracing::warn!(error = %err, "cwd save failed");
        }

        let preview = match self.store.session_info(session).await {
            Some(info) => self
                .store
                .first_user_preview(&info.path)
                .await
                .unwrap_or_default(),
            None => String::new(),
        };
        let label = if preview.is_empty() {
            format!("🔀 Switched to session {}", session.short())
        } else {
            format!("🔀 Switched to session {} — {preview}", session.short())
        };
        self.notify(chat_id, &label).await;

        // The incoming session's queue drains naturally once its channel is
        // free.
        self.drain_if_idle(chat_id, session).await;
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    pub(crate) async fn notify(&self, chat_id: ChatId, text: &str) {
        if let Err(err) = self
            .chat
            .send_message(OutgoingMessage::text(chat_id, text))
            .await
        {
            tracing::warn!(error = %err, "notify failed");
        }
    }
}

#[async_trait]
impl TakeoverHandler for Orchestrator {
    async fn take_over(&self, session: SessionId) {
        // The host-side context must be pulled in on the next spawn.
        self.channels.mark_stale(session);
        self.watcher.mark_continuing(session);

        let Some(chat_id) = self.registry.chat_id().await else {
            return;
        };

        self.switch_to(chat_id, session).await;

        let Some(info) = self.store.session_info(session).await else {
            self.notify(chat_id, "⚠️ Session file not found.").await;
            return;
        };
        let Ok(Some(prompt)) = last_user_input(&info.path).await else {
            self.notify(chat_id, "⚠️ No prompt found to resume.").await;
            return;
        };

        // Resubmitting the host's last prompt replays the still-pending
        // tool uses through the interactive permission flow.
        self.submit_prompt(chat_id, QueuedTurn::prompt(prompt)).await;
    }
}
