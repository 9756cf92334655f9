//! Delayed dispatch with per-key dedup.
//!
//! A scheduled action sleeps off the pipeline task and re-enters the
//! queue as an ordinary action when its delay elapses, unless cancelled
//! or replaced first. Keys carry a generation so a stale timer that
//! loses a cancel/reschedule race can never fire: the firing task must
//! *claim* its map entry (matching generation) before dispatching.
//!
//! Nothing here survives a restart; pending timers die with the process.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::action::Action;
use crate::chat::ChatId;
use crate::pipeline::Ingress;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Short delay before the "customer left" notice goes out.
    CustomerLeft,
    /// Longer delay before a disconnected chat closes itself.
    Autoclose,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TimerKey {
    pub chat_id: ChatId,
    pub kind: TimerKind,
}

impl TimerKey {
    pub fn customer_left(chat_id: &ChatId) -> Self {
        Self {
            chat_id: chat_id.clone(),
            kind: TimerKind::CustomerLeft,
        }
    }

    pub fn autoclose(chat_id: &ChatId) -> Self {
        Self {
            chat_id: chat_id.clone(),
            kind: TimerKind::Autoclose,
        }
    }
}

struct TimerEntry {
    generation: u64,
    // None only during the window between reserving the slot and the
    // spawn returning its handle.
    handle: Option<JoinHandle<()>>,
}

#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    ingress: Ingress,
    timers: DashMap<TimerKey, TimerEntry>,
    generation: AtomicU64,
}

impl Scheduler {
    pub fn new(ingress: Ingress) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                ingress,
                timers: DashMap::new(),
                generation: AtomicU64::new(0),
            }),
        }
    }

    /// Schedule `action` to fire after `delay`, replacing any timer
    /// already pending under the same key.
    pub fn schedule(&self, key: TimerKey, delay: Duration, action: Action) {
        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed);

        // Reserve the slot before spawning so even a zero-delay fire
        // finds an entry to claim.
        if let Some(old) = self.inner.timers.insert(
            key.clone(),
            TimerEntry {
                generation,
                handle: None,
            },
        ) {
            if let Some(handle) = old.handle {
                handle.abort();
            }
        }

        let inner = self.inner.clone();
        let task_key = key.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let claimed = inner
                .timers
                .remove_if(&task_key, |_, entry| entry.generation == generation)
                .is_some();
            if claimed {
                debug!(chat_id = %task_key.chat_id, kind = ?task_key.kind, "timer fired");
                inner.ingress.dispatch(action);
            }
        });

        if let Some(mut entry) = self.inner.timers.get_mut(&key) {
            if entry.generation == generation {
                entry.handle = Some(handle);
            } else {
                // Someone re-scheduled while we were spawning; our timer
                // is already obsolete.
                handle.abort();
            }
        }
    }

    /// Remove a pending timer. Returns false when nothing was pending
    /// (never scheduled, already fired, or already cancelled).
    pub fn cancel(&self, key: &TimerKey) -> bool {
        match self.inner.timers.remove(key) {
            Some((_, entry)) => {
                if let Some(handle) = entry.handle {
                    handle.abort();
                }
                debug!(chat_id = %key.chat_id, kind = ?key.kind, "timer cancelled");
                true
            }
            None => false,
        }
    }

    /// Drop every timer for a chat.
    pub fn cancel_chat(&self, chat_id: &ChatId) {
        self.cancel(&TimerKey::customer_left(chat_id));
        self.cancel(&TimerKey::autoclose(chat_id));
    }

    pub fn pending(&self) -> usize {
        self.inner.timers.len()
    }
}
