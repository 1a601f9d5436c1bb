//! Tool-permission arbitration.
//!
//! The Agent calls back into [`PermissionArbiter::check`] for every tool
//! invocation. The policy cascade runs in order, first match wins:
//! suppression, the deny-all latch, agent-asked questions, yolo (session or
//! daemon), the per-session allow-list, static settings rules, and finally
//! the interactive dialog. Interactive dialogs serialize on a global gate so
//! at most one is visible per chat, while remaining individually
//! cancellable.

pub mod pending;
pub mod rules;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::agent::{PermissionVerdict, ToolGate, ToolUseRequest};
use crate::orchestrator::render::ToolMessages;
use crate::registry::SessionRegistry;
use crate::state::SessionFlags;
use crate::store::SessionId;
use crate::telegram::{ChatTransport, InlineKeyboard, OutgoingMessage};

pub use pending::{DialogAnswer, DialogKind, DialogMessage, PendingInteractions};
pub use rules::{shell_command_word, SettingsRules, StaticDecision};

const DIALOG_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// The synthetic tool the Agent uses to ask the user a question.
pub const ASK_USER_QUESTION: &str = "AskUserQuestion";

pub struct PermissionArbiter {
    chat: Arc<dyn ChatTransport>,
    flags: Arc<SessionFlags>,
    pending: Arc<PendingInteractions>,
    rules: SettingsRules,
    tool_messages: Arc<ToolMessages>,
    registry: Arc<SessionRegistry>,
    daemon_yolo: bool,
    dialog_timeout: Duration,
    /// Dialogs currently holding (or queued on) the gate; the typing
    /// indicator pauses while non-zero.
    gate_depth: AtomicUsize,
    dialog_gate: Mutex<()>,
}

impl PermissionArbiter {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        chat: Arc<dyn ChatTransport>,
        flags: Arc<SessionFlags>,
        pending: Arc<PendingInteractions>,
        rules: SettingsRules,
        tool_messages: Arc<ToolMessages>,
        registry: Arc<SessionRegistry>,
        daemon_yolo: bool,
    ) -> Self {
        Self {
            chat,
            flags,
            pending,
            rules,
            tool_messages,
            registry,
            daemon_yolo,
            dialog_timeout: DIALOG_TIMEOUT,
            gate_depth: AtomicUsize::new(0),
            dialog_gate: Mutex::new(()),
        }
    }

    /// Shrink the dialog timeout (tests).
    pub fn with_dialog_timeout(mut self, timeout: Duration) -> Self {
        self.dialog_timeout = timeout;
        self
    }

    /// A dialog is visible or queued; the typing indicator should pause.
    pub fn dialog_active(&self) -> bool {
        self.gate_depth.load(Ordering::SeqCst) > 0
    }

    pub fn pending(&self) -> &Arc<PendingInteractions> {
        &self.pending
    }

    /// Cancel every open dialog for a session and latch further callbacks
    /// to deny until the next turn starts.
    pub fn deny_all(&self, session: SessionId) -> Vec<DialogMessage> {
        self.flags.set_denied(session);
        self.pending.deny_all(session)
    }

    fn session_yolo(&self, session: SessionId) -> bool {
        self.daemon_yolo || self.flags.is_yolo(session)
    }

    /// Tool blocks are shown immediately when no dialog could follow.
    pub fn is_preapproved(&self, session: SessionId, tool_name: &str) -> bool {
        self.session_yolo(session) || self.flags.is_tool_allowed(session, tool_name)
    }

    // ------------------------------------------------------------------
    // Interactive dialog
    // ------------------------------------------------------------------

    async fn interactive(&self, request: &ToolUseRequest) -> PermissionVerdict {
        self.gate_depth.fetch_add(1, Ordering::SeqCst);
        let verdict = self.interactive_inner(request).await;
        self.gate_depth.fetch_sub(1, Ordering::SeqCst);
        verdict
    }

    async fn interactive_inner(&self, request: &ToolUseRequest) -> PermissionVerdict {
        let _gate = self.dialog_gate.lock().await;

        // A concurrent dialog may have flipped these while we queued.
        if self.session_yolo(request.session_id)
            || self
                .flags
                .is_tool_allowed(request.session_id, &request.tool_name)
        {
            return PermissionVerdict::allow();
        }
        if self.flags.is_denied(request.session_id) {
            return PermissionVerdict::deny("denied by user");
        }

        let Some(chat_id) = self.registry.chat_id().await else {
            tracing::warn!(tool = %request.tool_name, "no chat bound, denying tool use");
            return PermissionVerdict::deny("no chat available to ask");
        };

        // Surface the tool line before asking about it. The stream task
        // delivers the block concurrently with this callback, so give it a
        // moment to land (and flush the buffered assistant text) before the
        // dialog goes out.
        let block_wait = tokio::time::timeout(Duration::from_secs(2), async {
            while !self
                .tool_messages
                .has_block(request.session_id, &request.correlation_id)
                .await
            {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        if block_wait.is_err() {
            tracing::debug!(tool = %request.tool_name, "tool block never rendered");
        }
        self.tool_messages
            .reveal(request.session_id, &request.correlation_id)
            .await;

        let (dialog_id, rx) =
            self.pending
                .register(request.session_id, DialogKind::Permission, chat_id);

        let mut body = format!("🔐 Permission required: {}", request.tool_name);
        if let Some(detail) = primary_detail(&request.input) {
            body.push('\n');
            body.push_str(&detail);
        }
        if let Some(ref reason) = request.reason {
            body.push('\n');
            body.push_str(reason);
        }

        let keyboard = InlineKeyboard::new()
            .row(vec![
                InlineKeyboard::button("✅ Allow", format!("perm:{dialog_id}:allow")),
                InlineKeyboard::button("❌ Deny", format!("perm:{dialog_id}:deny")),
            ])
            .row(vec![
                InlineKeyboard::button(
                    format!("✅ Allow {} for session", request.tool_name),
                    format!("perm:{dialog_id}:tool"),
                ),
                InlineKeyboard::button("⚡ Yolo for session", format!("perm:{dialog_id}:yolo")),
            ]);

        let message_id = match self
            .chat
            .send_message(OutgoingMessage::text(chat_id, body).keyboard(keyboard))
            .await
        {
            Ok(id) => {
                self.pending.attach_message(dialog_id, id);
                Some(id)
            }
            Err(err) => {
                tracing::warn!(error = %err, "permission dialog send failed");
                None
            }
        };

        let answer = match tokio::time::timeout(self.dialog_timeout, rx).await {
            Ok(Ok(answer)) => answer,
            Ok(Err(_)) => DialogAnswer::Cancelled,
            Err(_) => {
                self.pending.discard(dialog_id);
                if let Some(message_id) = message_id {
                    let _ = self
                        .chat
                        .edit_message(chat_id, message_id, "⏱ Timed out", None)
                        .await;
                }
                return PermissionVerdict::deny("permission dialog timed out");
            }
        };

        let session = request.session_id;
        let tool = &request.tool_name;
        match answer {
            DialogAnswer::Allow => {
                self.finish_dialog(chat_id, message_id).await;
                self.append_status(session, &format!("✓ Allowed {tool}")).await;
                PermissionVerdict::allow()
            }
            DialogAnswer::AllowToolForSession => {
                self.flags.allow_tool(session, tool);
                self.finish_dialog(chat_id, message_id).await;
                self.append_status(session, &format!("✓ Allowed {tool} for session"))
                    .await;
                PermissionVerdict::allow()
            }
            DialogAnswer::YoloForSession => {
                self.flags.set_yolo(session, true);
                self.finish_dialog(chat_id, message_id).await;
                self.append_status(session, "⚡ Yolo enabled for session").await;
                PermissionVerdict::allow()
            }
            DialogAnswer::Deny => {
                self.finish_dialog(chat_id, message_id).await;
                self.append_status(session, &format!("✗ Denied {tool}")).await;
                PermissionVerdict::deny("denied by user")
            }
            DialogAnswer::Cancelled => {
                if let Some(message_id) = message_id {
                    let _ = self
                        .chat
                        .edit_message(chat_id, message_id, "Cancelled", None)
                        .await;
                }
                PermissionVerdict::deny("cancelled")
            }
            // Question answers cannot arrive on a permission dialog.
            _ => PermissionVerdict::deny("unexpected answer"),
        }
    }

    async fn finish_dialog(&self, chat_id: i64, message_id: Option<i64>) {
        if let Some(message_id) = message_id {
            if let Err(err) = self.chat.delete_message(chat_id, message_id).await {
                tracing::debug!(error = %err, "dialog delete failed");
            }
        }
    }

    async fn append_status(&self, session: SessionId, status: &str) {
        self.tool_messages.append_status(session, status).await;
    }

    // ------------------------------------------------------------------
    // AskUserQuestion
    // ------------------------------------------------------------------

    async fn ask_user(&self, request: &ToolUseRequest) -> PermissionVerdict {
        let Some(question) = AskQuestion::parse(&request.input) else {
            // Malformed question input: let it through untouched.
            return PermissionVerdict::allow();
        };

        let Some(chat_id) = self.registry.chat_id().await else {
            return PermissionVerdict::allow();
        };

        let (dialog_id, rx) =
            self.pending
                .register(request.session_id, DialogKind::Question, chat_id);

        let mut keyboard = InlineKeyboard::new();
        for (index, option) in question.options.iter().enumerate() {
            keyboard = keyboard.row(vec![InlineKeyboard::button(
                option.clone(),
                format!("ask:{dialog_id}:{index}"),
            )]);
        }
        keyboard = keyboard.row(vec![InlineKeyboard::button(
            "Skip answer",
            format!("ask:{dialog_id}:skip"),
        )]);

        let body = format!("❓ {}", question.question);
        let message_id = match self
            .chat
            .send_message(OutgoingMessage::text(chat_id, body).keyboard(keyboard))
            .await
        {
            Ok(id) => {
                self.pending.attach_message(dialog_id, id);
                Some(id)
            }
            Err(err) => {
                tracing::warn!(error = %err, "question send failed");
                None
            }
        };

        let answer = match tokio::time::timeout(self.dialog_timeout, rx).await {
            Ok(Ok(answer)) => answer,
            Ok(Err(_)) => DialogAnswer::Cancelled,
            Err(_) => {
                self.pending.discard(dialog_id);
                if let Some(message_id) = message_id {
                    let _ = self
                        .chat
                        .edit_message(chat_id, message_id, "⏱ Timed out", None)
                        .await;
                }
                return PermissionVerdict::deny("question timed out");
            }
        };

        let chosen = match answer {
            DialogAnswer::Option(index) => question.options.get(index).cloned(),
            DialogAnswer::Text(text) => Some(text),
            DialogAnswer::Skip => None,
            DialogAnswer::Cancelled => {
                if let Some(message_id) = message_id {
                    let _ = self
                        .chat
                        .edit_message(chat_id, message_id, "Skipped", None)
                        .await;
                }
                return PermissionVerdict::deny("cancelled");
            }
            _ => None,
        };

        if let Some(message_id) = message_id {
            let summary = match &chosen {
                Some(label) => format!("❓ {}\n→ {label}", question.question),
                None => format!("❓ {}\n→ (skipped)", question.question),
            };
            let _ = self
                .chat
                .edit_message(chat_id, message_id, &summary, None)
                .await;
        }

        match chosen {
            Some(label) => {
                let mut updated = request.input.clone();
                if let Some(map) = updated.as_object_mut() {
                    map.insert("answer".to_string(), Value::String(label));
                }
                PermissionVerdict::Allow {
                    updated_input: Some(updated),
                }
            }
            None => PermissionVerdict::allow(),
        }
    }
}

#[async_trait]
impl ToolGate for PermissionArbiter {
    async fn check(&self, request: ToolUseRequest) -> PermissionVerdict {
        let session = request.session_id;

        // 1. Background sessions run silent and unimpeded.
        if self.flags.is_suppressed(session) {
            return PermissionVerdict::allow();
        }

        // 2. Deny-all latched for the rest of the stream.
        if self.flags.is_denied(session) {
            return PermissionVerdict::deny("cancelled by user");
        }

        // 3. Agent-asked question.
        if request.tool_name == ASK_USER_QUESTION {
            return self.ask_user(&request).await;
        }

        // 4. Yolo, session or daemon wide.
        if self.session_yolo(session) {
            return PermissionVerdict::allow();
        }

        // 5. Per-session allow-list.
        if self.flags.is_tool_allowed(session, &request.tool_name) {
            return PermissionVerdict::allow();
        }

        // 6. Static settings rules.
        let cwd = self
            .registry
            .active_cwd()
            .await
            .unwrap_or_else(|| std::path::PathBuf::from("."));
        match self.rules.check(&cwd, &request.tool_name, &request.input) {
            StaticDecision::Allow => return PermissionVerdict::allow(),
            StaticDecision::Deny => {
                return PermissionVerdict::deny(format!(
                    "{} denied by settings",
                    request.tool_name
                ))
            }
            StaticDecision::NoMatch => {}
        }

        // 7. Interactive dialog, serialized per chat.
        self.interactive(&request).await
    }
}

fn primary_detail(input: &Value) -> Option<String> {
    input
        .get("command")
        .or_else(|| input.get("file_path"))
        .or_else(|| input.get("path"))
        .or_else(|| input.get("url"))
        .and_then(Value::as_str)
        .map(|detail| {
            let mut snippet: String = detail.chars().take(200).collect();
            if detail.chars().count() > 200 {
                snippet.push('…');
            }
            snippet
        })
}

/// Parse a permission-dialog callback action (`allow`, `deny`, `tool`,
/// `yolo`).
pub fn parse_perm_action(action: &str) -> Option<DialogAnswer> {
    match action {
        "allow" => Some(DialogAnswer::Allow),
        "deny" => Some(DialogAnswer::Deny),
        "tool" => Some(DialogAnswer::AllowToolForSession),
        "yolo" => Some(DialogAnswer::YoloForSession),
        _ => None,
    }
}

/// Parse an ask-dialog callback action (an option index or `skip`).
pub fn parse_ask_action(action: &str) -> Option<DialogAnswer> {
    if action == "skip" {
        return Some(DialogAnswer::Skip);
    }
    action.parse::<usize>().ok().map(DialogAnswer::Option)
}

struct AskQuestion {
    question: String,
    options: Vec<String>,
}

impl AskQuestion {
    /// Accepts `{question, options}` directly or the first entry of a
    /// `questions` array; options may be strings or `{label}` objects.
    fn parse(input: &Value) -> Option<Self> {
        let source = if input.get("question").is_some() {
            input
        } else {
            input.get("questions")?.as_array()?.first()?
        };

        let question = source.get("question")?.as_str()?.to_string();
        let options = source
            .get("options")?
            .as_array()?
            .iter()
            .filter_map(|option| {
                option
                    .as_str()
                    .map(String::from)
                    .or_else(|| option.get("label")?.as_str().map(String::from))
            })
            .collect::<Vec<_>>();

        if options.is_empty() {
            return None;
        }
        Some(Self { question, options })
    }
}
