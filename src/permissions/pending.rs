//! Pending interaction bookkeeping.
//!
//! Every open dialog — tool permission or agent-asked question — is one
//! entry: an id baked into the button callback data, the session it belongs
//! to, the chat message showing it, and a oneshot resolver. Resolution
//! arrives by id from a button press, by text (answering a question), or in
//! bulk from `deny_all`.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::sync::oneshot;

use crate::store::SessionId;
use crate::telegram::{ChatId, MessageId};

/// How a dialog was resolved.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DialogAnswer {
    Allow,
    Deny,
    AllowToolForSession,
    YoloForSession,
    /// Question option by index.
    Option(usize),
    /// Question answered by a plain text message.
    Text(String),
    /// "Skip answer" on a question.
    Skip,
    /// Deny-all / cancel broadcast.
    Cancelled,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DialogKind {
    Permission,
    Question,
}

struct PendingDialog {
    session_id: SessionId,
    kind: DialogKind,
    chat_id: ChatId,
    message_id: Option<MessageId>,
    tx: oneshot::Sender<DialogAnswer>,
}

/// Location of a resolved dialog's chat message, for edits after the fact.
#[derive(Clone, Copy, Debug)]
pub struct DialogMessage {
    pub chat_id: ChatId,
    pub message_id: Option<MessageId>,
    pub kind: DialogKind,
}

#[derive(Default)]
pub struct PendingInteractions {
    next_id: AtomicU64,
    inner: DashMap<u64, PendingDialog>,
}

impl PendingInteractions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a dialog before its chat message exists; the id goes into
    /// the callback payload, the message id is attached after sending.
    pub fn register(
        &self,
        session_id: SessionId,
        kind: DialogKind,
        chat_id: ChatId,
    ) -> (u64, oneshot::Receiver<DialogAnswer>) {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.inner.insert(
            id,
            PendingDialog {
                session_id,
                kind,
                chat_id,
                message_id: None,
                tx,
            },
        );
        (id, rx)
    }

    pub fn attach_message(&self, id: u64, message_id: MessageId) {
        if let Some(mut entry) = self.inner.get_mut(&id) {
            entry.message_id = Some(message_id);
        }
    }

    /// Resolve one dialog by id. Returns `false` for unknown (already
    /// resolved) ids.
    pub fn resolve(&self, id: u64, answer: DialogAnswer) -> bool {
        match self.inner.remove(&id) {
            Some((_, dialog)) => {
                let _ = dialog.tx.send(answer);
                true
            }
            None => false,
        }
    }

    /// Drop a dialog without resolving (the waiting side timed out).
    pub fn discard(&self, id: u64) {
        self.inner.remove(&id);
    }

    /// Resolve every open dialog for a session as cancelled, returning the
    /// message locations so callers can annotate them.
    pub fn deny_all(&self, session_id: SessionId) -> Vec<DialogMessage> {
        let ids: Vec<u64> = self
            .inner
            .iter()
            .filter(|entry| entry.session_id == session_id)
            .map(|entry| *entry.key())
            .collect();

        let mut messages = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some((_, dialog)) = self.inner.remove(&id) {
                messages.push(DialogMessage {
                    chat_id: dialog.chat_id,
                    message_id: dialog.message_id,
                    kind: dialog.kind,
                });
                let _ = dialog.tx.send(DialogAnswer::Cancelled);
            }
        }
        messages
    }

    /// Open question dialog for a session, if any: a plain text message
    /// from the user is its answer.
    pub fn open_question(&self, session_id: SessionId) -> Option<u64> {
        self.inner
            .iter()
            .find(|entry| entry.session_id == session_id && entry.kind == DialogKind::Question)
            .map(|entry| *entry.key())
    }

    /// Any dialog open for this session (used to trigger deny-all before
    /// queueing).
    pub fn any_open(&self, session_id: SessionId) -> bool {
        self.inner.iter().any(|entry| entry.session_id == session_id)
    }

    /// Any dialog open in this chat (dialog-exclusion accounting).
    pub fn any_open_in_chat(&self, chat_id: ChatId) -> bool {
        self.inner.iter().any(|entry| entry.chat_id == chat_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_register_resolve_round_trip() {
        let pending = PendingInteractions::new();
        let session = SessionId::new();
        let (id, rx) = pending.register(session, DialogKind::Permission, 1);
        pending.attach_message(id, 99);

        assert!(pending.any_open(session));
        assert!(pending.resolve(id, DialogAnswer::Allow));
        assert_eq!(rx.await.unwrap(), DialogAnswer::Allow);
        assert!(!pending.any_open(session));
        assert!(!pending.resolve(id, DialogAnswer::Deny));
    }

    #[tokio::test]
    async fn test_deny_all_scoped_to_session() {
        let pending = PendingInteractions::new();
        let a = SessionId::new();
        let b = SessionId::new();
        let (id_a, rx_a) = pending.register(a, DialogKind::Permission, 1);
        pending.attach_message(id_a, 10);
        let (_id_b, mut rx_b) = pending.register(b, DialogKind::Permission, 1);

        let resolved = pending.deny_all(a);
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].message_id, Some(10));
        assert_eq!(rx_a.await.unwrap(), DialogAnswer::Cancelled);
        assert!(rx_b.try_recv().is_err());
        assert!(pending.any_open(b));
    }

    #[tokio::test]
    async fn test_open_question_lookup() {
        let pending = PendingInteractions::new();
        let session = SessionId::new();
        assert!(pending.open_question(session).is_none());

        let (_perm, _rx1) = pending.register(session, DialogKind::Permission, 1);
        assert!(pending.open_question(session).is_none());

        let (ask, _rx2) = pending.register(session, DialogKind::Question, 1);
        assert_eq!(pending.open_question(session), Some(ask));
    }
}
