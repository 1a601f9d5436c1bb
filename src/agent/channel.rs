//! Per-session Agent channel.
//!
//! The channel owns one running Agent and serializes turns on it: at most
//! one [`TurnStream`] exists at a time, enforced by a single-slot lock held
//! for the whole read loop. Interrupts bypass the lock — they only write a
//! control message — so a streaming turn can be stopped from outside.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, MutexGuard};

use super::{AgentEvent, AgentHandle, AgentResult};
use crate::store::SessionId;

pub struct AgentChannel {
    session_id: SessionId,
    cwd: PathBuf,
    handle: Arc<dyn AgentHandle>,
    turn_lock: Mutex<()>,
    /// Record-file size as of the last completed own turn.
    last_self_size: AtomicU64,
    stale: AtomicBool,
    interrupted: AtomicBool,
}

impl AgentChannel {
    pub fn new(
        session_id: SessionId,
        cwd: PathBuf,
        handle: Arc<dyn AgentHandle>,
        initial_file_size: u64,
    ) -> Self {
        Self {
            session_id,
            cwd,
            handle,
            turn_lock: Mutex::new(()),
            last_self_size: AtomicU64::new(initial_file_size),
            stale: AtomicBool::new(false),
            interrupted: AtomicBool::new(false),
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn cwd(&self) -> &PathBuf {
        &self.cwd
    }

    /// A turn is currently streaming.
    pub fn is_busy(&self) -> bool {
        self.turn_lock.try_lock().is_err()
    }

    /// Acquire the turn lock, push the prompt, and hand back the stream.
    /// Waits if another turn is draining (queued-turn path); callers that
    /// must not wait check [`is_busy`] first.
    ///
    /// [`is_busy`]: Self::is_busy
    pub async fn begin_turn(&self, prompt: String) -> AgentResult<TurnStream<'_>> {
        let guard = self.turn_lock.lock().await;
        self.interrupted.store(false, Ordering::SeqCst);
        self.handle.send_input(prompt).await?;
        Ok(TurnStream {
            channel: self,
            _guard: guard,
        })
    }

    // ------------------------------------------------------------------
    // Staleness
    // ------------------------------------------------------------------

    /// Compare the current record-file size against the last self-write.
    /// Differing non-zero sizes mean a third party appended; the channel
    /// must be recreated with resume before the next turn.
    pub fn check_stale(&self, current_size: u64) -> bool {
        let last = self.last_self_size.load(Ordering::SeqCst);
        if last != 0 && current_size != 0 && current_size != last {
            self.stale.store(true, Ordering::SeqCst);
        }
        self.is_stale()
    }

    pub fn mark_stale(&self) {
        self.stale.store(true, Ordering::SeqCst);
    }

    pub fn is_stale(&self) -> bool {
        self.stale.load(Ordering::SeqCst)
    }

    /// Record the file size at end-of-own-turn.
    pub fn record_self_size(&self, size: u64) {
        self.last_self_size.store(size, Ordering::SeqCst);
    }

    pub fn last_self_size(&self) -> u64 {
        self.last_self_size.load(Ordering::SeqCst)
    }

    // ------------------------------------------------------------------
    // Interrupt / close
    // ------------------------------------------------------------------

    /// Stop the current turn. The stream still terminates with a `Result`
    /// whose error path is silenced by the interrupted flag.
    pub async fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
        if let Err(err) = self.handle.interrupt().await {
            tracing::debug!(session = %self.session_id, error = %err, "interrupt send failed");
        }
    }

    pub fn was_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    /// End the input queue and wait for the Agent to exit.
    pub async fn close(&self) {
        if let Err(err) = self.handle.close().await {
            tracing::debug!(session = %self.session_id, error = %err, "close failed");
        }
    }
}

impl std::fmt::Debug for AgentChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentChannel")
            .field("session_id", &self.session_id)
            .field("stale", &self.is_stale())
            .field("busy", &self.is_busy())
            .finish_non_exhaustive()
    }
}

/// Exclusive event stream for one turn; holds the turn lock until dropped.
pub struct TurnStream<'a> {
    channel: &'a AgentChannel,
    _guard: MutexGuard<'a, ()>,
}

impl TurnStream<'_> {
    /// Next event, or `None` if the Agent died mid-turn.
    pub async fn next_event(&mut self) -> Option<AgentEvent> {
        self.channel.handle.next_event().await
    }

    pub fn channel(&self) -> &AgentChannel {
        self.channel
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{AgentError, AgentHandle};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Mutex as AsyncMutex;

    /// Minimal scripted handle: one Result event per input.
    struct ScriptedHandle {
        events: AsyncMutex<tokio::sync::mpsc::Receiver<AgentEvent>>,
        tx: tokio::sync::mpsc::Sender<AgentEvent>,
        interrupts: AtomicUsize,
    }

    impl ScriptedHandle {
        fn new() -> Self {
            let (tx, rx) = tokio::sync::mpsc::channel(8);
            Self {
                events: AsyncMutex::new(rx),
                tx,
                interrupts: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl AgentHandle for ScriptedHandle {
        async fn send_input(&self, _text: String) -> AgentResult<()> {
            self.tx
                .send(AgentEvent::Result {
                    is_error: false,
                    errors: vec![],
                })
                .await
                .map_err(|_| AgentError::Closed)
        }

        async fn next_event(&self) -> Option<AgentEvent> {
            self.events.lock().await.recv().await
        }

        async fn interrupt(&self) -> AgentResult<()> {
            self.interrupts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn close(&self) -> AgentResult<()> {
            Ok(())
        }
    }

    fn channel() -> AgentChannel {
        AgentChannel::new(
            SessionId::new(),
            PathBuf::from("/tmp"),
            Arc::new(ScriptedHandle::new()),
            0,
        )
    }

    #[tokio::test]
    async fn test_turn_lock_serializes() {
        let channel = channel();
        let stream = channel.begin_turn("one".into()).await.unwrap();
        assert!(channel.is_busy());
        drop(stream);
        assert!(!channel.is_busy());
    }

    #[tokio::test]
    async fn test_turn_yields_result() {
        let channel = channel();
        let mut stream = channel.begin_turn("go".into()).await.unwrap();
        let event = stream.next_event().await.unwrap();
        assert!(event.is_result());
    }

    #[tokio::test]
    async fn test_staleness_needs_both_sizes_nonzero() {
        let channel = channel();
        assert!(!channel.check_stale(100)); // last is 0: fresh session
        channel.record_self_size(100);
        assert!(!channel.check_stale(100)); // unchanged
        assert!(channel.check_stale(250)); // third-party append
        assert!(channel.is_stale());
    }

    #[tokio::test]
    async fn test_interrupt_sets_flag_without_lock() {
        let channel = channel();
        let _stream = channel.begin_turn("go".into()).await.unwrap();
        // Interrupt while the turn lock is held.
        channel.interrupt().await;
        assert!(channel.was_interrupted());
    }

    #[tokio::test]
    async fn test_begin_turn_clears_interrupted() {
        let channel = channel();
        channel.interrupt().await;
        assert!(channel.was_interrupted());
        let _stream = channel.begin_turn("next".into()).await.unwrap();
        assert!(!channel.was_interrupted());
    }
}
