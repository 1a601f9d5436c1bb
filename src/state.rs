//! Shared per-session state.
//!
//! These maps are touched from the orchestrator, the permission arbiter, the
//! watcher, and the scanner, so they live behind `DashMap`s keyed by session
//! id rather than one global lock — unrelated sessions never contend.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::{DashMap, DashSet};

use crate::agent::AgentChannel;
use crate::store::SessionId;

/// Per-session policy and lifecycle flags.
#[derive(Default)]
pub struct SessionFlags {
    /// Auto-allow every tool for these sessions.
    yolo: DashSet<SessionId>,
    /// Tools allowed for the session without a dialog.
    allowed_tools: DashMap<SessionId, HashSet<String>>,
    /// Channel output must not be rendered to chat, and tool callbacks
    /// auto-allow (background session after a switch).
    suppressed: DashSet<SessionId>,
    /// Render-only mute: output is swallowed but policy is untouched
    /// (briefly set around /cancel so the deny latch still applies).
    muted: DashSet<SessionId>,
    /// Deny-all fired mid-turn: later callbacks deny without UI until the
    /// next turn starts.
    denied: DashSet<SessionId>,
    /// Sessions with an orchestrator turn in flight ("active query").
    /// Counted: the post-turn clear is deferred and must not erase the
    /// marker of a drain turn that started meanwhile.
    active_queries: DashMap<SessionId, usize>,
}

impl SessionFlags {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    // ------------------------------------------------------------------
    // Yolo
    // ------------------------------------------------------------------

    pub fn set_yolo(&self, session: SessionId, on: bool) {
        if on {
            self.yolo.insert(session);
        } else {
            self.yolo.remove(&session);
        }
    }

    pub fn is_yolo(&self, session: SessionId) -> bool {
        self.yolo.contains(&session)
    }

    // ------------------------------------------------------------------
    // Allow-list
    // ------------------------------------------------------------------

    pub fn allow_tool(&self, session: SessionId, tool: &str) {
        self.allowed_tools
            .entry(session)
            .or_default()
            .insert(tool.to_string());
    }

    pub fn is_tool_allowed(&self, session: SessionId, tool: &str) -> bool {
        self.allowed_tools
            .get(&session)
            .is_some_and(|set| set.contains(tool))
    }

    // ------------------------------------------------------------------
    // Suppression
    // ------------------------------------------------------------------

    pub fn set_suppressed(&self, session: SessionId, on: bool) {
        if on {
            self.suppressed.insert(session);
        } else {
            self.suppressed.remove(&session);
        }
    }

    pub fn is_suppressed(&self, session: SessionId) -> bool {
        self.suppressed.contains(&session)
    }

    pub fn set_muted(&self, session: SessionId, on: bool) {
        if on {
            self.muted.insert(session);
        } else {
            self.muted.remove(&session);
        }
    }

    pub fn is_muted(&self, session: SessionId) -> bool {
        self.muted.contains(&session)
    }

    /// Output of this session should not reach the chat right now.
    pub fn is_silenced(&self, session: SessionId) -> bool {
        self.is_suppressed(session) || self.is_muted(session)
    }

    // ------------------------------------------------------------------
    // Deny-all latch
    // ------------------------------------------------------------------

    pub fn set_denied(&self, session: SessionId) {
        self.denied.insert(session);
    }

    /// Cleared at the start of every turn.
    pub fn clear_denied(&self, session: SessionId) {
        self.denied.remove(&session);
    }

    pub fn is_denied(&self, session: SessionId) -> bool {
        self.denied.contains(&session)
    }

    // ------------------------------------------------------------------
    // Active-query marker
    // ------------------------------------------------------------------

    pub fn begin_query(&self, session: SessionId) {
        *self.active_queries.entry(session).or_insert(0) += 1;
    }

    pub fn end_query(&self, session: SessionId) {
        let drained = match self.active_queries.get_mut(&session) {
            Some(mut count) => {
                *count = count.saturating_sub(1);
                *count == 0
            }
            None => false,
        };
        if drained {
            self.active_queries.remove_if(&session, |_, count| *count == 0);
        }
    }

    pub fn has_active_query(&self, session: SessionId) -> bool {
        self.active_queries
            .get(&session)
            .is_some_and(|count| *count > 0)
    }

    /// Reset session-local policy on an idle switch-away.
    pub fn clear_session(&self, session: SessionId) {
        self.yolo.remove(&session);
        self.allowed_tools.remove(&session);
        self.suppressed.remove(&session);
        self.muted.remove(&session);
        self.denied.remove(&session);
    }
}

/// Live Agent channels, one per session.
#[derive(Default)]
pub struct ChannelMap {
    inner: DashMap<SessionId, Arc<AgentChannel>>,
}

impl ChannelMap {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn get(&self, session: SessionId) -> Option<Arc<AgentChannel>> {
        self.inner.get(&session).map(|entry| entry.clone())
    }

    pub fn insert(&self, session: SessionId, channel: Arc<AgentChannel>) {
        self.inner.insert(session, channel);
    }

    pub fn remove(&self, session: SessionId) -> Option<Arc<AgentChannel>> {
        self.inner.remove(&session).map(|(_, channel)| channel)
    }

    pub fn mark_stale(&self, session: SessionId) {
        if let Some(channel) = self.get(session) {
            channel.mark_stale();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_are_per_session() {
        let flags = SessionFlags::default();
        let a = SessionId::new();
        let b = SessionId::new();

        flags.set_yolo(a, true);
        flags.allow_tool(b, "Bash");

        assert!(flags.is_yolo(a));
        assert!(!flags.is_yolo(b));
        assert!(flags.is_tool_allowed(b, "Bash"));
        assert!(!flags.is_tool_allowed(a, "Bash"));
    }

    #[test]
    fn test_clear_session_resets_policy() {
        let flags = SessionFlags::default();
        let a = SessionId::new();
        flags.set_yolo(a, true);
        flags.allow_tool(a, "Edit");
        flags.set_suppressed(a, true);
        flags.set_denied(a);

        flags.clear_session(a);
        assert!(!flags.is_yolo(a));
        assert!(!flags.is_tool_allowed(a, "Edit"));
        assert!(!flags.is_suppressed(a));
        assert!(!flags.is_denied(a));
    }

    #[test]
    fn test_active_query_marker() {
        let flags = SessionFlags::default();
        let a = SessionId::new();
        assert!(!flags.has_active_query(a));
        flags.begin_query(a);
        assert!(flags.has_active_query(a));
        flags.end_query(a);
        assert!(!flags.has_active_query(a));
    }
}
