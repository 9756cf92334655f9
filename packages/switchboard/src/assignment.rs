//! Assignment: turning queued chats into attempts and attempts into
//! outcomes.
//!
//! The sweep runs after any action that could have freed or added
//! capacity. It dispatches at most one attempt, and never while another
//! attempt is in flight; the next sweep is re-triggered by whatever
//! state change the attempt produces. Attempt outcomes re-enter the
//! pipeline as `SetChatOperator` / `SetChatMissed`, where stale ones are
//! dropped by the transition preconditions.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::action::{Action, MissReason};
use crate::chat::ChatId;
use crate::operator::OperatorId;
use crate::pipeline::{InterceptCtx, Interceptor};
use crate::selectors;
use crate::store::Store;
use crate::transport::{RoomId, Transport};

pub struct AssignmentInterceptor {
    transport: Arc<dyn Transport>,
    join_timeout: Duration,
}

impl AssignmentInterceptor {
    pub fn new(transport: Arc<dyn Transport>, join_timeout: Duration) -> Self {
        Self {
            transport,
            join_timeout,
        }
    }

    /// Actions after which capacity may have appeared. Misses are
    /// deliberately absent: a miss frees nothing, and sweeping on it
    /// would retry the same chat in a tight loop.
    fn sweep_trigger(action: &Action) -> bool {
        matches!(
            action,
            Action::SyncLoads { .. }
                | Action::SetOperatorStatus { .. }
                | Action::SetOperatorCapacity { .. }
                | Action::SetOperatorRequestingChat { .. }
                | Action::OperatorReady { .. }
                | Action::SetChatsRecovered { .. }
                | Action::SetAcceptsCustomers { .. }
                | Action::CustomerMessage { .. }
                | Action::CustomerJoin { .. }
        )
    }

    fn maybe_sweep(&self, store: &Store, ctx: &mut InterceptCtx) {
        if !store.accepts_customers {
            return;
        }
        if selectors::assignment_in_flight(store) {
            return;
        }
        if let Some(chat) = selectors::next_assignable(store) {
            debug!(chat_id = %chat.id, "sweep dispatching assignment");
            ctx.follow_up(Action::AssignChat {
                chat_id: chat.id.clone(),
            });
        }
    }

    fn attempt(&self, store: &Store, chat_id: &ChatId, ctx: &mut InterceptCtx) {
        let Some(chat) = store.chat(chat_id) else { return };
        let found = selectors::candidates(store, &chat.session.locale, &chat.session.groups);
        let Some(top) = found.first() else {
            ctx.follow_up(Action::SetChatMissed {
                chat_id: chat_id.clone(),
                reason: MissReason::NoOperators,
            });
            return;
        };

        info!(chat_id = %chat_id, operator_id = %top.id, "assignment attempt");
        let operator = top.to_ref();
        let connections = top.connection_list();
        let room = RoomId::chat(chat_id);
        let transport = self.transport.clone();
        let join_timeout = self.join_timeout;
        let chat_id = chat_id.clone();
        ctx.spawn_attempt(async move {
            let joined =
                tokio::time::timeout(join_timeout, transport.join_room(&connections, &room))
                    .await;
            match joined {
                Ok(Ok(())) => Some(Action::SetChatOperator { chat_id, operator }),
                Ok(Err(error)) => {
                    warn!(
                        chat_id = %chat_id,
                        operator_id = %operator.id,
                        %error,
                        "assignment join failed"
                    );
                    Some(Action::SetChatMissed {
                        chat_id,
                        reason: MissReason::JoinTimeout {
                            operator: operator.id,
                        },
                    })
                }
                Err(_) => {
                    warn!(
                        chat_id = %chat_id,
                        operator_id = %operator.id,
                        "assignment join timed out"
                    );
                    Some(Action::SetChatMissed {
                        chat_id,
                        reason: MissReason::JoinTimeout {
                            operator: operator.id,
                        },
                    })
                }
            }
        });
    }

    /// Transfers skip the ranking entirely; the only requirement is a
    /// resolvable, online target.
    fn transfer(
        &self,
        store: &Store,
        chat_id: &ChatId,
        target: &OperatorId,
        ctx: &mut InterceptCtx,
    ) {
        let online = match store.operator(target) {
            Some(op) => op.online,
            None => false,
        };
        if !online {
            ctx.follow_up(Action::SetChatMissed {
                chat_id: chat_id.clone(),
                reason: MissReason::TransferTargetUnknown {
                    target: target.clone(),
                },
            });
            return;
        }

        let op = store
            .operator(target)
            .map(|op| (op.to_ref(), op.connection_list()));
        let Some((operator, connections)) = op else { return };

        info!(chat_id = %chat_id, target = %target, "transfer attempt");
        let room = RoomId::chat(chat_id);
        let transport = self.transport.clone();
        let join_timeout = self.join_timeout;
        let chat_id = chat_id.clone();
        let target = target.clone();
        ctx.spawn_attempt(async move {
            let joined =
                tokio::time::timeout(join_timeout, transport.join_room(&connections, &room))
                    .await;
            match joined {
                Ok(Ok(())) => Some(Action::SetChatOperator { chat_id, operator }),
                Ok(Err(error)) => {
                    warn!(chat_id = %chat_id, target = %target, %error, "transfer join failed");
                    Some(Action::SetChatMissed {
                        chat_id,
                        reason: MissReason::TransferTimeout { target },
                    })
                }
                Err(_) => {
                    warn!(chat_id = %chat_id, target = %target, "transfer join timed out");
                    Some(Action::SetChatMissed {
                        chat_id,
                        reason: MissReason::TransferTimeout { target },
                    })
                }
            }
        });
    }
}

#[async_trait]
impl Interceptor for AssignmentInterceptor {
    fn name(&self) -> &'static str {
        "assignment"
    }

    async fn after(
        &mut self,
        _prev: &Store,
        store: &Store,
        action: &Action,
        changed: bool,
        ctx: &mut InterceptCtx,
    ) {
        if !changed {
            return;
        }
        match action {
            Action::AssignChat { chat_id } => self.attempt(store, chat_id, ctx),
            Action::OperatorChatTransfer { chat_id, to, .. } => {
                self.transfer(store, chat_id, to, ctx)
            }
            _ if Self::sweep_trigger(action) => self.maybe_sweep(store, ctx),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::{ChatSession, Locale};
    use crate::config::EngineConfig;
    use crate::operator::{ConnectionId, MembershipSeed, OperatorProfile};
    use crate::pipeline::Pipeline;
    use crate::testing::RecordingTransport;
    use crate::transition;
    use chrono::{Duration as ChronoDuration, Utc};
    use std::collections::BTreeMap;
    use tokio::sync::RwLock;

    struct Fixture {
        transport: Arc<RecordingTransport>,
        interceptor: AssignmentInterceptor,
        store: Store,
        ctx: InterceptCtx,
    }

    fn fixture() -> Fixture {
        let transport = Arc::new(RecordingTransport::new());
        let store = Store::new(&EngineConfig::default());
        let lock = Arc::new(RwLock::new(store.clone()));
        let (_pipeline, ingress) = Pipeline::new(lock, vec![]);
        Fixture {
            transport: transport.clone(),
            interceptor: AssignmentInterceptor::new(transport, Duration::from_secs(1)),
            store,
            ctx: InterceptCtx::test_only(ingress),
        }
    }

    fn session(locale: &str) -> ChatSession {
        ChatSession {
            customer_id: "cust".into(),
            display_name: "Visitor".into(),
            email: None,
            locale: Locale::from(locale),
            groups: vec![],
        }
    }

    fn profile(id: &str, locale: &str, capacity: u32) -> OperatorProfile {
        let mut memberships = BTreeMap::new();
        memberships.insert(
            Locale::from(locale),
            MembershipSeed {
                capacity,
                active: true,
            },
        );
        OperatorProfile {
            id: OperatorId::from(id),
            name: id.to_string(),
            memberships,
            groups: vec![],
        }
    }

    fn insert_chat(store: &mut Store, id: &str, locale: &str, at_offset_secs: i64) {
        let now = Utc::now() + ChronoDuration::seconds(at_offset_secs);
        transition::apply(
            store,
            &Action::CustomerMessage {
                chat_id: ChatId::from(id),
                session: session(locale),
                body: "hi".into(),
            },
            now,
        );
    }

    fn bring_online(store: &mut Store, id: &str, locale: &str, capacity: u32) {
        transition::apply(
            store,
            &Action::OperatorReady {
                profile: profile(id, locale, capacity),
                connection: ConnectionId::from(format!("conn-{id}").as_str()),
            },
            Utc::now(),
        );
    }

    async fn run_after(fx: &mut Fixture, action: Action) {
        let prev = fx.store.clone();
        let changed = transition::apply(&mut fx.store, &action, Utc::now());
        fx.interceptor
            .after(&prev, &fx.store, &action, changed, &mut fx.ctx)
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_candidates_queue_a_miss() {
        let mut fx = fixture();
        insert_chat(&mut fx.store, "c1", "en", 0);
        run_after(&mut fx, Action::AssignChat {
            chat_id: ChatId::from("c1"),
        })
        .await;

        assert_eq!(
            fx.ctx.queued(),
            &[Action::SetChatMissed {
                chat_id: ChatId::from("c1"),
                reason: MissReason::NoOperators,
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_joins_the_top_candidate() {
        let mut fx = fixture();
        bring_online(&mut fx.store, "op-1", "en", 3);
        insert_chat(&mut fx.store, "c1", "en", 0);
        run_after(&mut fx, Action::AssignChat {
            chat_id: ChatId::from("c1"),
        })
        .await;

        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
        assert!(fx.transport.in_room(
            &ConnectionId::from("conn-op-1"),
            &RoomId::chat(&ChatId::from("c1"))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_dispatches_oldest_chat_first() {
        let mut fx = fixture();
        bring_online(&mut fx.store, "op-1", "en", 3);
        insert_chat(&mut fx.store, "newer", "en", 10);
        insert_chat(&mut fx.store, "older", "en", -10);

        fx.interceptor.maybe_sweep(&fx.store, &mut fx.ctx);
        assert_eq!(
            fx.ctx.queued(),
            &[Action::AssignChat {
                chat_id: ChatId::from("older"),
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_noop_while_attempt_in_flight() {
        let mut fx = fixture();
        bring_online(&mut fx.store, "op-1", "en", 3);
        insert_chat(&mut fx.store, "c1", "en", 0);
        insert_chat(&mut fx.store, "c2", "en", 1);
        transition::apply(
            &mut fx.store,
            &Action::AssignChat {
                chat_id: ChatId::from("c1"),
            },
            Utc::now(),
        );

        fx.interceptor.maybe_sweep(&fx.store, &mut fx.ctx);
        assert!(fx.ctx.queued().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_noop_when_not_accepting_customers() {
        let mut fx = fixture();
        bring_online(&mut fx.store, "op-1", "en", 3);
        insert_chat(&mut fx.store, "c1", "en", 0);
        fx.store.accepts_customers = false;

        fx.interceptor.maybe_sweep(&fx.store, &mut fx.ctx);
        assert!(fx.ctx.queued().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_skips_scopes_without_capacity() {
        let mut fx = fixture();
        bring_online(&mut fx.store, "op-1", "en", 3);
        // Oldest chat wants a locale nobody serves; the next one is
        // servable and wins the sweep.
        insert_chat(&mut fx.store, "stuck", "fr", -10);
        insert_chat(&mut fx.store, "ready", "en", 0);

        fx.interceptor.maybe_sweep(&fx.store, &mut fx.ctx);
        assert_eq!(
            fx.ctx.queued(),
            &[Action::AssignChat {
                chat_id: ChatId::from("ready"),
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_unchanged_trigger_does_not_sweep() {
        let mut fx = fixture();
        bring_online(&mut fx.store, "op-1", "en", 3);
        insert_chat(&mut fx.store, "c1", "en", 0);

        // Status already Available, so the transition reports no change.
        run_after(&mut fx, Action::SetOperatorStatus {
            operator_id: OperatorId::from("op-1"),
            status: crate::operator::OperatorStatus::Available,
        })
        .await;
        assert!(fx.ctx.queued().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_transfer_to_unknown_target_misses() {
        let mut fx = fixture();
        bring_online(&mut fx.store, "op-1", "en", 3);
        insert_chat(&mut fx.store, "c1", "en", 0);
        transition::apply(
            &mut fx.store,
            &Action::AssignChat {
                chat_id: ChatId::from("c1"),
            },
            Utc::now(),
        );
        let operator = fx.store.operator(&OperatorId::from("op-1")).unwrap().to_ref();
        transition::apply(
            &mut fx.store,
            &Action::SetChatOperator {
                chat_id: ChatId::from("c1"),
                operator,
            },
            Utc::now(),
        );

        run_after(&mut fx, Action::OperatorChatTransfer {
            chat_id: ChatId::from("c1"),
            from: OperatorId::from("op-1"),
            to: OperatorId::from("ghost"),
        })
        .await;

        assert_eq!(
            fx.ctx.queued(),
            &[Action::SetChatMissed {
                chat_id: ChatId::from("c1"),
                reason: MissReason::TransferTargetUnknown {
                    target: OperatorId::from("ghost"),
                },
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_transfer_joins_target_connections() {
        let mut fx = fixture();
        bring_online(&mut fx.store, "op-1", "en", 3);
        bring_online(&mut fx.store, "op-2", "en", 3);
        insert_chat(&mut fx.store, "c1", "en", 0);
        transition::apply(
            &mut fx.store,
            &Action::AssignChat {
                chat_id: ChatId::from("c1"),
            },
            Utc::now(),
        );
        let operator = fx.store.operator(&OperatorId::from("op-1")).unwrap().to_ref();
        transition::apply(
            &mut fx.store,
            &Action::SetChatOperator {
                chat_id: ChatId::from("c1"),
                operator,
            },
            Utc::now(),
        );

        run_after(&mut fx, Action::OperatorChatTransfer {
            chat_id: ChatId::from("c1"),
            from: OperatorId::from("op-1"),
            to: OperatorId::from("op-2"),
        })
        .await;

        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
        assert!(fx.transport.in_room(
            &ConnectionId::from("conn-op-2"),
            &RoomId::chat(&ChatId::from("c1"))
        ));
        assert!(fx.ctx.queued().is_empty());
    }
}
