//! The single-writer pipeline.
//!
//! All state changes flow through one task that owns the store's write
//! side. Each queued action runs through the interceptor chain:
//!
//! ```text
//!   before*  ->  apply  ->  after*
//! ```
//!
//! Interceptors may rewrite the action (`before`), cancel it outright,
//! queue follow-up actions, or spawn asynchronous attempts whose result
//! re-enters the queue as a fresh action. Follow-ups of one action are
//! drained to completion before the next externally queued action runs,
//! so every cascade observes a consistent store.
//!
//! A panicking interceptor is logged and skipped; a panicking transition
//! rolls the store back to its pre-action snapshot. Neither stops the
//! pipeline.

use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use smallvec::SmallVec;
use tokio::sync::{mpsc, Notify, RwLock};
use tracing::{debug, error};

use crate::action::Action;
use crate::store::Store;
use crate::transition;

// =============================================================================
// Inflight accounting
// =============================================================================

/// Counts work the pipeline has accepted but not finished: queued
/// actions, their cascades, and spawned attempts. Tests (and graceful
/// shutdown) wait on this to reach zero instead of sleeping.
#[derive(Debug, Default)]
pub struct Inflight {
    active: AtomicUsize,
    notify: Notify,
}

impl Inflight {
    pub fn begin(&self) {
        self.active.fetch_add(1, Ordering::AcqRel);
    }

    pub fn end(&self) {
        if self.active.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.notify.notify_waiters();
        }
    }

    pub fn is_idle(&self) -> bool {
        self.active.load(Ordering::Acquire) == 0
    }

    /// Wait until nothing is queued, cascading, or spawned.
    pub async fn wait_idle(&self) {
        loop {
            // Register before checking so a decrement between the check
            // and the await cannot be missed (Notify is edge-triggered).
            let notified = self.notify.notified();
            if self.is_idle() {
                return;
            }
            notified.await;
        }
    }
}

// =============================================================================
// Ingress
// =============================================================================

/// Clonable sender side of the pipeline queue. Every accepted action
/// increments the inflight count; the pipeline decrements after the
/// action's cascade has drained.
#[derive(Clone)]
pub struct Ingress {
    tx: mpsc::UnboundedSender<Action>,
    inflight: Arc<Inflight>,
}

impl Ingress {
    /// Queue an action. Returns false when the pipeline has stopped.
    pub fn dispatch(&self, action: Action) -> bool {
        self.inflight.begin();
        if self.tx.send(action).is_err() {
            self.inflight.end();
            return false;
        }
        true
    }

    pub fn inflight(&self) -> Arc<Inflight> {
        self.inflight.clone()
    }
}

// =============================================================================
// Interceptor contract
// =============================================================================

/// Per-action context handed to each interceptor.
pub struct InterceptCtx {
    ingress: Ingress,
    // Almost every cascade queues zero or one follow-up, so the list
    // lives inline.
    follow_ups: SmallVec<[Action; 2]>,
    cancelled: Option<String>,
}

impl InterceptCtx {
    fn new(ingress: Ingress) -> Self {
        Self {
            ingress,
            follow_ups: SmallVec::new(),
            cancelled: None,
        }
    }

    /// Queue an action onto the current cascade. It runs after this
    /// action's interceptors finish and before the next external action.
    pub fn follow_up(&mut self, action: Action) {
        self.follow_ups.push(action);
    }

    /// Drop the current action: remaining `before` interceptors, the
    /// transition, and every `after` are skipped. Follow-ups already
    /// queued still run.
    pub fn cancel(&mut self, reason: impl Into<String>) {
        if self.cancelled.is_none() {
            self.cancelled = Some(reason.into());
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.is_some()
    }

    #[cfg(test)]
    pub(crate) fn test_only(ingress: Ingress) -> Self {
        Self::new(ingress)
    }

    #[cfg(test)]
    pub(crate) fn queued(&self) -> &[Action] {
        &self.follow_ups
    }

    #[cfg(test)]
    pub(crate) fn cancel_reason(&self) -> Option<&str> {
        self.cancelled.as_deref()
    }

    /// Run asynchronous work off the pipeline task. The result, if any,
    /// re-enters the queue as a fresh action. The attempt is tracked by
    /// the inflight count from this call until its action (or `None`)
    /// has been handed back.
    pub fn spawn_attempt<F>(&self, attempt: F)
    where
        F: std::future::Future<Output = Option<Action>> + Send + 'static,
    {
        let ingress = self.ingress.clone();
        ingress.inflight.begin();
        tokio::spawn(async move {
            match AssertUnwindSafe(attempt).catch_unwind().await {
                Ok(Some(action)) => {
                    ingress.dispatch(action);
                }
                Ok(None) => {}
                Err(panic_info) => {
                    error!(panic = %panic_message(&panic_info), "spawned attempt panicked");
                }
            }
            ingress.inflight.end();
        });
    }
}

/// A stage in the pipeline. Implementations hold their own state; the
/// pipeline serializes all calls, so no further synchronization is
/// needed.
#[async_trait]
pub trait Interceptor: Send {
    fn name(&self) -> &'static str;

    /// Runs before the transition. May rewrite the action in place,
    /// cancel it, or queue follow-ups.
    async fn before(&mut self, store: &Store, action: &mut Action, ctx: &mut InterceptCtx) {
        let _ = (store, action, ctx);
    }

    /// Runs after the transition with both the prior and current store.
    /// `changed` reports whether the transition mutated anything.
    async fn after(
        &mut self,
        prev: &Store,
        store: &Store,
        action: &Action,
        changed: bool,
        ctx: &mut InterceptCtx,
    ) {
        let _ = (prev, store, action, changed, ctx);
    }
}

// =============================================================================
// Pipeline task
// =============================================================================

pub struct Pipeline {
    store: Arc<RwLock<Store>>,
    interceptors: Vec<Box<dyn Interceptor>>,
    rx: mpsc::UnboundedReceiver<Action>,
    ingress: Ingress,
}

impl Pipeline {
    pub fn new(
        store: Arc<RwLock<Store>>,
        interceptors: Vec<Box<dyn Interceptor>>,
    ) -> (Self, Ingress) {
        Self::build(store, |_| interceptors)
    }

    /// Like [`Pipeline::new`], but hands the ingress to the interceptor
    /// builder first. Interceptors that schedule timers need a sender
    /// before the pipeline exists.
    pub fn build(
        store: Arc<RwLock<Store>>,
        interceptors: impl FnOnce(&Ingress) -> Vec<Box<dyn Interceptor>>,
    ) -> (Self, Ingress) {
        let (tx, rx) = mpsc::unbounded_channel();
        let ingress = Ingress {
            tx,
            inflight: Arc::new(Inflight::default()),
        };
        let pipeline = Self {
            store,
            interceptors: interceptors(&ingress),
            rx,
            ingress: ingress.clone(),
        };
        (pipeline, ingress)
    }

    /// Drive the queue until every sender is gone.
    pub async fn run(mut self) {
        while let Some(action) = self.rx.recv().await {
            self.process(action).await;
            self.ingress.inflight.end();
        }
        debug!("pipeline stopped");
    }

    async fn process(&mut self, external: Action) {
        let mut cascade = VecDeque::new();
        cascade.push_back(external);

        while let Some(mut action) = cascade.pop_front() {
            let mut ctx = InterceptCtx::new(self.ingress.clone());
            let mut store = self.store.write().await;

            for interceptor in self.interceptors.iter_mut() {
                let name = interceptor.name();
                let outcome = AssertUnwindSafe(interceptor.before(&store, &mut action, &mut ctx))
                    .catch_unwind()
                    .await;
                if let Err(panic_info) = outcome {
                    error!(
                        interceptor = name,
                        action = action.name(),
                        panic = %panic_message(&panic_info),
                        "interceptor panicked before apply"
                    );
                }
                if ctx.is_cancelled() {
                    break;
                }
            }

            let cancelled = ctx.cancelled.take();
            if let Some(reason) = cancelled {
                debug!(action = action.name(), reason, "action cancelled");
            } else {
                let prev = store.clone();
                let applied = std::panic::catch_unwind(AssertUnwindSafe(|| {
                    transition::apply(&mut store, &action, Utc::now())
                }));
                match applied {
                    Ok(changed) => {
                        for interceptor in self.interceptors.iter_mut() {
                            let name = interceptor.name();
                            let outcome = AssertUnwindSafe(interceptor.after(
                                &prev, &store, &action, changed, &mut ctx,
                            ))
                            .catch_unwind()
                            .await;
                            if let Err(panic_info) = outcome {
                                error!(
                                    interceptor = name,
                                    action = action.name(),
                                    panic = %panic_message(&panic_info),
                                    "interceptor panicked after apply"
                                );
                            }
                        }
                    }
                    Err(panic_info) => {
                        error!(
                            action = action.name(),
                            panic = %panic_message(&panic_info),
                            "transition panicked, state rolled back"
                        );
                        *store = prev;
                    }
                }
            }

            drop(store);
            cascade.extend(ctx.follow_ups);
        }
    }
}

fn panic_message(panic_info: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic_info.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic_info.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
