//! Load accounting.
//!
//! After every state change, re-derive per-locale loads from the open
//! chat set and, when the stored numbers disagree, queue a `SyncLoads`
//! to overwrite them. The recomputation is a full fold rather than an
//! incremental update, so membership edits can never leave a counter
//! drifting. `SyncLoads` itself is exempt, otherwise applying the sync
//! would queue another one forever.

use async_trait::async_trait;
use tracing::debug;

use crate::action::Action;
use crate::pipeline::{InterceptCtx, Interceptor};
use crate::selectors;
use crate::store::Store;

pub struct LoadsInterceptor;

#[async_trait]
impl Interceptor for LoadsInterceptor {
    fn name(&self) -> &'static str {
        "loads"
    }

    async fn after(
        &mut self,
        _prev: &Store,
        store: &Store,
        action: &Action,
        changed: bool,
        ctx: &mut InterceptCtx,
    ) {
        if matches!(action, Action::SyncLoads { .. }) || !changed {
            return;
        }
        let derived = selectors::derived_loads(store);
        if derived != selectors::stored_loads(store) {
            debug!(action = action.name(), "loads drifted, queueing sync");
            ctx.follow_up(Action::SyncLoads { loads: derived });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::{ChatId, ChatSession, Locale};
    use crate::config::EngineConfig;
    use crate::operator::{ConnectionId, MembershipSeed, OperatorId, OperatorProfile};
    use crate::pipeline::{InterceptCtx, Pipeline};
    use crate::transition;
    use chrono::Utc;
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use tokio::sync::RwLock;

    fn ctx() -> InterceptCtx {
        let store = Arc::new(RwLock::new(Store::new(&EngineConfig::default())));
        let (_pipeline, ingress) = Pipeline::new(store, vec![]);
        InterceptCtx::test_only(ingress)
    }

    fn seeded_store() -> Store {
        let mut store = Store::new(&EngineConfig::default());
        let mut memberships = BTreeMap::new();
        memberships.insert(
            Locale::from("en"),
            MembershipSeed {
                capacity: 3,
                active: true,
            },
        );
        transition::apply(
            &mut store,
            &Action::OperatorReady {
                profile: OperatorProfile {
                    id: OperatorId::from("op-1"),
                    name: "op-1".into(),
                    memberships,
                    groups: vec![],
                },
                connection: ConnectionId::from("conn-1"),
            },
            Utc::now(),
        );
        transition::apply(
            &mut store,
            &Action::CustomerMessage {
                chat_id: ChatId::from("c1"),
                session: ChatSession {
                    customer_id: "cust".into(),
                    display_name: "Visitor".into(),
                    email: None,
                    locale: Locale::from("en"),
                    groups: vec![],
                },
                body: "hi".into(),
            },
            Utc::now(),
        );
        store
    }

    #[tokio::test]
    async fn test_membership_change_queues_sync() {
        let mut store = seeded_store();
        let prev = store.clone();
        let join = Action::OperatorChatJoin {
            chat_id: ChatId::from("c1"),
            operator_id: OperatorId::from("op-1"),
        };
        let changed = transition::apply(&mut store, &join, Utc::now());
        assert!(changed);

        let mut ctx = ctx();
        LoadsInterceptor
            .after(&prev, &store, &join, changed, &mut ctx)
            .await;

        match ctx.queued() {
            [Action::SyncLoads { loads }] => {
                assert_eq!(loads[&Locale::from("en")][&OperatorId::from("op-1")], 1);
            }
            other => panic!("expected one SyncLoads, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_sync_loads_does_not_requeue_itself() {
        let mut store = seeded_store();
        store
            .chat_mut(&ChatId::from("c1"))
            .unwrap()
            .members
            .insert(OperatorId::from("op-1"));

        let loads = selectors::derived_loads(&store);
        let prev = store.clone();
        let sync = Action::SyncLoads { loads };
        let changed = transition::apply(&mut store, &sync, Utc::now());
        assert!(changed);

        let mut ctx = ctx();
        LoadsInterceptor
            .after(&prev, &store, &sync, changed, &mut ctx)
            .await;
        assert!(ctx.queued().is_empty());
    }

    #[tokio::test]
    async fn test_no_sync_when_loads_already_match() {
        let mut store = seeded_store();
        let prev = store.clone();
        // Typing changes nothing; even if it did, loads are in agreement.
        let typing = Action::CustomerTyping {
            chat_id: ChatId::from("c1"),
            typing: true,
        };
        let changed = transition::apply(&mut store, &typing, Utc::now());

        let mut ctx = ctx();
        LoadsInterceptor
            .after(&prev, &store, &typing, changed, &mut ctx)
            .await;
        assert!(ctx.queued().is_empty());
    }
}
