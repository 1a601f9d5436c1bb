//! Per-session turn queue.
//!
//! Turns that arrive while a session is streaming wait here, strictly in
//! arrival order. The queue is bounded; overflow is reported to the user
//! rather than silently dropped.

use std::collections::VecDeque;
use std::path::PathBuf;

use dashmap::DashMap;

use crate::store::SessionId;
use crate::telegram::MessageId;

const MAX_QUEUED_TURNS: usize = 64;

/// One pending turn: the prompt plus how to render its response.
#[derive(Clone, Debug)]
pub struct QueuedTurn {
    pub prompt: String,
    pub reply_to: Option<MessageId>,
    /// Originated from a voice message (responses get a voice-note hint).
    pub voice: bool,
    /// Suppress the turn's own chat output (takeover resubmission, cleanup
    /// prompts).
    pub quiet: bool,
    /// Downloaded attachments to delete once the turn completes.
    pub temp_files: Vec<PathBuf>,
}

impl QueuedTurn {
    pub fn prompt(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            reply_to: None,
            voice: false,
            quiet: false,
            temp_files: Vec::new(),
        }
    }

    pub fn reply_to(mut self, message_id: Option<MessageId>) -> Self {
        self.reply_to = message_id;
        self
    }

    pub fn quiet(mut self) -> Self {
        self.quiet = true;
        self
    }
}

#[derive(Debug, thiserror::Error)]
#[error("turn queue full")]
pub struct QueueFull;

/// All per-session turn queues.
#[derive(Default)]
pub struct TurnQueues {
    inner: DashMap<SessionId, VecDeque<QueuedTurn>>,
}

impl TurnQueues {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&self, session: SessionId, turn: QueuedTurn) -> Result<(), QueueFull> {
        let mut queue = self.inner.entry(session).or_default();
        if queue.len() >= MAX_QUEUED_TURNS {
            return Err(QueueFull);
        }
        queue.push_back(turn);
        Ok(())
    }

    pub fn pop(&self, session: SessionId) -> Option<QueuedTurn> {
        self.inner.get_mut(&session)?.pop_front()
    }

    pub fn clear(&self, session: SessionId) -> usize {
        match self.inner.get_mut(&session) {
            Some(mut queue) => {
                let count = queue.len();
                queue.clear();
                count
            }
            None => 0,
        }
    }

    pub fn is_empty(&self, session: SessionId) -> bool {
        self.inner
            .get(&session)
            .map(|queue| queue.is_empty())
            .unwrap_or(true)
    }

    pub fn len(&self, session: SessionId) -> usize {
        self.inner.get(&session).map(|queue| queue.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_order() {
        let queues = TurnQueues::new();
        let session = SessionId::new();
        queues.enqueue(session, QueuedTurn::prompt("a")).unwrap();
        queues.enqueue(session, QueuedTurn::prompt("b")).unwrap();

        assert_eq!(queues.pop(session).unwrap().prompt, "a");
        assert_eq!(queues.pop(session).unwrap().prompt, "b");
        assert!(queues.pop(session).is_none());
    }

    #[test]
    fn test_bounded() {
        let queues = TurnQueues::new();
        let session = SessionId::new();
        for i in 0..MAX_QUEUED_TURNS {
            queues
                .enqueue(session, QueuedTurn::prompt(format!("{i}")))
                .unwrap();
        }
        assert!(queues.enqueue(session, QueuedTurn::prompt("over")).is_err());
    }

    #[test]
    fn test_clear_reports_count() {
        let queues = TurnQueues::new();
        let session = SessionId::new();
        queues.enqueue(session, QueuedTurn::prompt("a")).unwrap();
        queues.enqueue(session, QueuedTurn::prompt("b")).unwrap();
        assert_eq!(queues.clear(session), 2);
        assert!(queues.is_empty(session));
    }

    #[test]
    fn test_queues_independent_per_session() {
        let queues = TurnQueues::new();
        let a = SessionId::new();
        let b = SessionId::new();
        queues.enqueue(a, QueuedTurn::prompt("for a")).unwrap();
        assert!(queues.is_empty(b));
        assert_eq!(queues.len(a), 1);
    }
}
