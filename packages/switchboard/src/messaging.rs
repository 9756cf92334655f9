//! Message traffic and synthesized notices.
//!
//! Relays conversational messages into chat rooms, keeps the short-term
//! history cache for backfills, and writes the system notices that mark
//! assignments, transfers, misses, closes, and customer departures.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, warn};

use crate::action::Action;
use crate::chat::{Audience, ChatId, ChatMessage, ChatStatus, MessageAuthor};
use crate::chat_log::ChatLog;
use crate::operator::OperatorId;
use crate::pipeline::{InterceptCtx, Interceptor};
use crate::store::Store;
use crate::transport::{events, RoomId, Transport};

pub struct MessagingInterceptor {
    transport: Arc<dyn Transport>,
    log: ChatLog,
    // Transfers in flight, so the completing assignment can name both
    // ends in its notice.
    pending_transfers: HashMap<ChatId, (OperatorId, OperatorId)>,
}

impl MessagingInterceptor {
    pub fn new(transport: Arc<dyn Transport>, log_capacity: usize) -> Self {
        Self {
            transport,
            log: ChatLog::new(log_capacity),
            pending_transfers: HashMap::new(),
        }
    }

    fn emit_json(&self, room: &RoomId, event: &str, payload: &impl Serialize) {
        match serde_json::to_value(payload) {
            Ok(value) => self.transport.emit(room, event, value),
            Err(error) => warn!(%error, event, "payload serialization failed"),
        }
    }

    fn operator_name(store: &Store, id: &OperatorId) -> String {
        store
            .operator(id)
            .map(|op| op.name.clone())
            .unwrap_or_else(|| id.to_string())
    }

    fn relay(&mut self, chat_id: &ChatId, author: MessageAuthor, body: &str) {
        let message = ChatMessage::new(chat_id.clone(), author, body);
        self.log.push_shared(message.clone());
        self.emit_json(&RoomId::chat(chat_id), events::CHAT_MESSAGE, &message);
    }

    fn backfill_operator(&self, store: &Store, chat_id: &ChatId, operator_id: &OperatorId) {
        let Some(op) = store.operator(operator_id) else {
            return;
        };
        let messages = self.log.history(chat_id, Audience::Operator);
        if messages.is_empty() {
            return;
        }
        let payload = json!({
            "chatId": chat_id,
            "audience": Audience::Operator,
            "messages": messages,
        });
        for connection in op.connection_list() {
            self.transport.emit(
                &RoomId::connection(&connection),
                events::CHAT_HISTORY,
                payload.clone(),
            );
        }
    }
}

#[async_trait]
impl Interceptor for MessagingInterceptor {
    fn name(&self) -> &'static str {
        "messaging"
    }

    async fn after(
        &mut self,
        prev: &Store,
        store: &Store,
        action: &Action,
        changed: bool,
        _ctx: &mut InterceptCtx,
    ) {
        // Attempt outcomes settle any recorded transfer even when the
        // transition rejected them as stale, and chat teardown clears it
        // outright. A surviving entry would mislabel the chat's next
        // assignment notice.
        let transferred = match action {
            Action::SetChatOperator { chat_id, .. } | Action::SetChatMissed { chat_id, .. } => {
                self.pending_transfers.remove(chat_id)
            }
            Action::OperatorChatClose { chat_id, .. }
            | Action::AutocloseChat { chat_id }
            | Action::RemoveChat { chat_id } => {
                self.pending_transfers.remove(chat_id);
                None
            }
            _ => None,
        };

        match action {
            Action::CustomerMessage {
                chat_id,
                session,
                body,
            } => {
                self.relay(
                    chat_id,
                    MessageAuthor::Customer {
                        name: session.display_name.clone(),
                    },
                    body,
                );
            }
            Action::OperatorMessage {
                chat_id,
                operator,
                body,
            } => {
                if store.chat(chat_id).is_none() {
                    debug!(chat_id = %chat_id, "operator message for unknown chat");
                    return;
                }
                self.relay(
                    chat_id,
                    MessageAuthor::Operator {
                        id: operator.id.clone(),
                        name: operator.name.clone(),
                    },
                    body,
                );
            }
            Action::AgentMessage {
                chat_id,
                agent_id,
                body,
            } => {
                if store.chat(chat_id).is_none() {
                    debug!(chat_id = %chat_id, "agent message for unknown chat");
                    return;
                }
                self.relay(
                    chat_id,
                    MessageAuthor::Agent {
                        id: agent_id.clone(),
                    },
                    body,
                );
            }
            Action::CustomerTyping { chat_id, typing } => {
                self.emit_json(
                    &RoomId::chat(chat_id),
                    events::CHAT_TYPING,
                    &json!({ "chatId": chat_id, "kind": "customer", "typing": typing }),
                );
            }
            Action::OperatorTyping {
                chat_id,
                operator_id,
                typing,
            } => {
                self.emit_json(
                    &RoomId::chat(chat_id),
                    events::CHAT_TYPING,
                    &json!({
                        "chatId": chat_id,
                        "kind": "operator",
                        "operatorId": operator_id,
                        "typing": typing,
                    }),
                );
            }
            Action::CustomerJoin { chat_id, .. } => {
                // A (re)joining customer gets their side of the history.
                let messages = self.log.history(chat_id, Audience::Customer);
                if !messages.is_empty() {
                    self.emit_json(
                        &RoomId::chat(chat_id),
                        events::CHAT_HISTORY,
                        &json!({
                            "chatId": chat_id,
                            "audience": Audience::Customer,
                            "messages": messages,
                        }),
                    );
                }
            }
            Action::NotifyCustomerLeft { chat_id } => {
                let Some(chat) = store.chat(chat_id) else { return };
                if chat.status != ChatStatus::CustomerDisconnect {
                    return;
                }
                let message = ChatMessage::system(
                    chat_id.clone(),
                    "The customer appears to have left the chat",
                );
                self.log.push(Audience::Operator, message.clone());
                self.emit_json(
                    &RoomId::chat(chat_id),
                    events::CHAT_CUSTOMER_LEFT,
                    &json!({ "chatId": chat_id, "message": message }),
                );
            }
            Action::OperatorChatTransfer { chat_id, from, to } if changed => {
                self.pending_transfers
                    .insert(chat_id.clone(), (from.clone(), to.clone()));
            }
            Action::SetChatOperator { chat_id, operator } if changed => {
                let Some(chat) = store.chat(chat_id) else { return };
                let notice = match transferred {
                    Some((from, to)) => format!(
                        "Chat transferred from {} to {}",
                        Self::operator_name(store, &from),
                        Self::operator_name(store, &to),
                    ),
                    None => format!("{} joined the chat", operator.name),
                };
                let message = ChatMessage::system(chat_id.clone(), notice);
                self.log.push_shared(message.clone());
                self.emit_json(&RoomId::chat(chat_id), events::CHAT_MESSAGE, &message);
                self.emit_json(
                    &RoomId::chat(chat_id),
                    events::CHAT_OPENED,
                    &json!({ "chat": chat }),
                );
                self.backfill_operator(store, chat_id, &operator.id);
            }
            Action::SetChatMissed { chat_id, reason } if changed => {
                // A chat that was already missed once does not repeat the
                // notice on every failed retry.
                let missed_before = prev
                    .chat(chat_id)
                    .map(|c| c.assigning_from == Some(ChatStatus::Missed))
                    .unwrap_or(false);
                if missed_before {
                    return;
                }
                let message =
                    ChatMessage::system(chat_id.clone(), format!("Chat missed: {reason}"));
                self.log.push(Audience::Operator, message.clone());
                self.emit_json(
                    &RoomId::operators(),
                    events::CHAT_MISSED,
                    &json!({
                        "chatId": chat_id,
                        "reason": reason,
                        "message": message,
                    }),
                );
            }
            Action::OperatorChatJoin {
                chat_id,
                operator_id,
            } if changed => {
                let Some(op) = store.operator(operator_id) else {
                    return;
                };
                self.emit_json(
                    &RoomId::chat(chat_id),
                    events::CHAT_OPERATOR_JOINED,
                    &json!({ "chatId": chat_id, "operator": op.to_ref() }),
                );
                self.backfill_operator(store, chat_id, operator_id);
            }
            Action::OperatorChatLeave {
                chat_id,
                operator_id,
            } if changed => {
                self.emit_json(
                    &RoomId::chat(chat_id),
                    events::CHAT_OPERATOR_LEFT,
                    &json!({ "chatId": chat_id, "operatorId": operator_id }),
                );
            }
            Action::OperatorChatClose { chat_id, .. } | Action::AutocloseChat { chat_id }
                if changed =>
            {
                self.emit_json(
                    &RoomId::chat(chat_id),
                    events::CHAT_CLOSED,
                    &json!({ "chatId": chat_id }),
                );
                self.log.evict(chat_id);
            }
            Action::RemoveChat { chat_id } if changed => {
                self.log.evict(chat_id);
            }
            Action::SetChatsRecovered { chat_ids, .. } if changed => {
                for chat_id in chat_ids {
                    let was_abandoned = prev
                        .chat(chat_id)
                        .map(|c| c.status == ChatStatus::Abandoned)
                        .unwrap_or(false);
                    let now_assigned = store
                        .chat(chat_id)
                        .map(|c| c.status == ChatStatus::Assigned)
                        .unwrap_or(false);
                    if was_abandoned && now_assigned {
                        if let Some(chat) = store.chat(chat_id) {
                            self.emit_json(
                                &RoomId::chat(chat_id),
                                events::CHAT_OPENED,
                                &json!({ "chat": chat }),
                            );
                        }
                    }
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::MissReason;
    use crate::chat::{ChatSession, Locale};
    use crate::config::EngineConfig;
    use crate::operator::{ConnectionId, MembershipSeed, OperatorProfile, OperatorRef};
    use crate::pipeline::Pipeline;
    use crate::testing::RecordingTransport;
    use crate::transition;
    use chrono::Utc;
    use std::collections::BTreeMap;
    use tokio::sync::RwLock;

    struct Fixture {
        transport: Arc<RecordingTransport>,
        interceptor: MessagingInterceptor,
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
            interceptor: MessagingInterceptor::new(transport, 50),
            store,
            ctx: InterceptCtx::test_only(ingress),
        }
    }

    impl Fixture {
        /// Apply the transition and run messaging's before/after phases.
        async fn run(&mut self, mut action: Action) {
            self.interceptor
                .before(&self.store, &mut action, &mut self.ctx)
                .await;
            let prev = self.store.clone();
            let changed = transition::apply(&mut self.store, &action, Utc::now());
            self.interceptor
                .after(&prev, &self.store, &action, changed, &mut self.ctx)
                .await;
        }
    }

    fn session() -> ChatSession {
        ChatSession {
            customer_id: "cust".into(),
            display_name: "Ada".into(),
            email: None,
            locale: Locale::from("en"),
            groups: vec![],
        }
    }

    fn profile(id: &str) -> OperatorProfile {
        let mut memberships = BTreeMap::new();
        memberships.insert(
            Locale::from("en"),
            MembershipSeed {
                capacity: 3,
                active: true,
            },
        );
        OperatorProfile {
            id: OperatorId::from(id),
            name: format!("Operator {id}"),
            memberships,
            groups: vec![],
        }
    }

    fn customer_message(chat: &str, body: &str) -> Action {
        Action::CustomerMessage {
            chat_id: ChatId::from(chat),
            session: session(),
            body: body.into(),
        }
    }

    fn op_ref(id: &str) -> OperatorRef {
        OperatorRef {
            id: OperatorId::from(id),
            name: format!("Operator {id}"),
        }
    }

    #[tokio::test]
    async fn test_customer_message_is_logged_and_relayed() {
        let mut fx = fixture();
        fx.run(customer_message("c1", "hello there")).await;

        let emits = fx.transport.emits_named(events::CHAT_MESSAGE);
        assert_eq!(emits.len(), 1);
        assert_eq!(emits[0].room, RoomId::chat(&ChatId::from("c1")));
        assert_eq!(emits[0].payload["body"], "hello there");
        assert_eq!(emits[0].payload["author"]["kind"], "customer");
        assert_eq!(emits[0].payload["author"]["name"], "Ada");

        let history = fx
            .interceptor
            .log
            .history(&ChatId::from("c1"), Audience::Customer);
        assert_eq!(history.len(), 1);
    }

    #[tokio::test]
    async fn test_assignment_emits_notice_opened_and_backfill() {
        let mut fx = fixture();
        fx.run(Action::OperatorReady {
            profile: profile("op-1"),
            connection: ConnectionId::from("conn-1"),
        })
        .await;
        fx.run(customer_message("c1", "help me")).await;
        fx.run(Action::AssignChat {
            chat_id: ChatId::from("c1"),
        })
        .await;
        fx.transport.clear_emits();

        fx.run(Action::SetChatOperator {
            chat_id: ChatId::from("c1"),
            operator: op_ref("op-1"),
        })
        .await;

        let notices = fx.transport.emits_named(events::CHAT_MESSAGE);
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].payload["author"]["kind"], "system");
        assert_eq!(notices[0].payload["body"], "Operator op-1 joined the chat");

        let opened = fx.transport.emits_named(events::CHAT_OPENED);
        assert_eq!(opened.len(), 1);
        assert_eq!(opened[0].payload["chat"]["status"], "ASSIGNED");

        // The assigned operator's connection gets the operator history.
        let history = fx.transport.emits_named(events::CHAT_HISTORY);
        assert_eq!(history.len(), 1);
        assert_eq!(
            history[0].room,
            RoomId::connection(&ConnectionId::from("conn-1"))
        );
        assert_eq!(history[0].payload["audience"], "operator");
        assert_eq!(history[0].payload["messages"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_miss_notice_goes_to_operators_room_once() {
        let mut fx = fixture();
        fx.run(customer_message("c1", "anyone?")).await;
        fx.run(Action::AssignChat {
            chat_id: ChatId::from("c1"),
        })
        .await;
        fx.run(Action::SetChatMissed {
            chat_id: ChatId::from("c1"),
            reason: MissReason::NoOperators,
        })
        .await;

        let missed = fx.transport.emits_named(events::CHAT_MISSED);
        assert_eq!(missed.len(), 1);
        assert_eq!(missed[0].room, RoomId::operators());
        assert_eq!(missed[0].payload["reason"]["kind"], "noOperators");

        // Retry missing again stays quiet.
        fx.run(Action::AssignChat {
            chat_id: ChatId::from("c1"),
        })
        .await;
        fx.run(Action::SetChatMissed {
            chat_id: ChatId::from("c1"),
            reason: MissReason::NoOperators,
        })
        .await;
        assert_eq!(fx.transport.emits_named(events::CHAT_MISSED).len(), 1);
    }

    #[tokio::test]
    async fn test_transfer_completion_names_both_operators() {
        let mut fx = fixture();
        fx.run(Action::OperatorReady {
            profile: profile("op-1"),
            connection: ConnectionId::from("conn-1"),
        })
        .await;
        fx.run(Action::OperatorReady {
            profile: profile("op-2"),
            connection: ConnectionId::from("conn-2"),
        })
        .await;
        fx.run(customer_message("c1", "hi")).await;
        fx.run(Action::AssignChat {
            chat_id: ChatId::from("c1"),
        })
        .await;
        fx.run(Action::SetChatOperator {
            chat_id: ChatId::from("c1"),
            operator: op_ref("op-1"),
        })
        .await;
        fx.transport.clear_emits();

        fx.run(Action::OperatorChatTransfer {
            chat_id: ChatId::from("c1"),
            from: OperatorId::from("op-1"),
            to: OperatorId::from("op-2"),
        })
        .await;
        fx.run(Action::SetChatOperator {
            chat_id: ChatId::from("c1"),
            operator: op_ref("op-2"),
        })
        .await;

        let notices = fx.transport.emits_named(events::CHAT_MESSAGE);
        assert_eq!(notices.len(), 1);
        assert_eq!(
            notices[0].payload["body"],
            "Chat transferred from Operator op-1 to Operator op-2"
        );
    }

    #[tokio::test]
    async fn test_stale_transfer_does_not_label_the_next_assignment() {
        let mut fx = fixture();
        fx.run(Action::OperatorReady {
            profile: profile("op-1"),
            connection: ConnectionId::from("conn-1"),
        })
        .await;
        fx.run(Action::OperatorReady {
            profile: profile("op-2"),
            connection: ConnectionId::from("conn-2"),
        })
        .await;
        fx.run(customer_message("c1", "hi")).await;
        fx.run(Action::AssignChat {
            chat_id: ChatId::from("c1"),
        })
        .await;
        fx.run(Action::SetChatOperator {
            chat_id: ChatId::from("c1"),
            operator: op_ref("op-1"),
        })
        .await;

        // Transfer in flight, but the chat closes before the target's
        // join resolves; the late outcome is rejected as stale.
        fx.run(Action::OperatorChatTransfer {
            chat_id: ChatId::from("c1"),
            from: OperatorId::from("op-1"),
            to: OperatorId::from("op-2"),
        })
        .await;
        fx.run(Action::OperatorChatClose {
            chat_id: ChatId::from("c1"),
            operator_id: OperatorId::from("op-1"),
        })
        .await;
        fx.run(Action::SetChatOperator {
            chat_id: ChatId::from("c1"),
            operator: op_ref("op-2"),
        })
        .await;

        // Reopened and freshly assigned: the notice names the join, not
        // the dead transfer.
        fx.run(customer_message("c1", "back again")).await;
        fx.run(Action::AssignChat {
            chat_id: ChatId::from("c1"),
        })
        .await;
        fx.transport.clear_emits();
        fx.run(Action::SetChatOperator {
            chat_id: ChatId::from("c1"),
            operator: op_ref("op-1"),
        })
        .await;

        let notices = fx.transport.emits_named(events::CHAT_MESSAGE);
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].payload["body"], "Operator op-1 joined the chat");
    }

    #[tokio::test]
    async fn test_interrupted_transfer_settles_on_its_stale_outcome() {
        let mut fx = fixture();
        fx.run(Action::OperatorReady {
            profile: profile("op-1"),
            connection: ConnectionId::from("conn-1"),
        })
        .await;
        fx.run(Action::OperatorReady {
            profile: profile("op-2"),
            connection: ConnectionId::from("conn-2"),
        })
        .await;
        fx.run(customer_message("c1", "hi")).await;
        fx.run(Action::AssignChat {
            chat_id: ChatId::from("c1"),
        })
        .await;
        fx.run(Action::SetChatOperator {
            chat_id: ChatId::from("c1"),
            operator: op_ref("op-1"),
        })
        .await;

        // The customer drops mid-transfer, so the outcome finds the chat
        // disconnected and bounces off the precondition.
        fx.run(Action::OperatorChatTransfer {
            chat_id: ChatId::from("c1"),
            from: OperatorId::from("op-1"),
            to: OperatorId::from("op-2"),
        })
        .await;
        fx.run(Action::CustomerDisconnect {
            chat_id: ChatId::from("c1"),
        })
        .await;
        fx.run(Action::SetChatOperator {
            chat_id: ChatId::from("c1"),
            operator: op_ref("op-2"),
        })
        .await;

        // Rejoin requeues the interrupted chat; its fresh assignment is
        // an ordinary join, not a transfer.
        fx.run(Action::CustomerJoin {
            chat_id: ChatId::from("c1"),
            session: session(),
        })
        .await;
        fx.run(Action::AssignChat {
            chat_id: ChatId::from("c1"),
        })
        .await;
        fx.transport.clear_emits();
        fx.run(Action::SetChatOperator {
            chat_id: ChatId::from("c1"),
            operator: op_ref("op-1"),
        })
        .await;

        let notices = fx.transport.emits_named(events::CHAT_MESSAGE);
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].payload["body"], "Operator op-1 joined the chat");
    }

    #[tokio::test]
    async fn test_close_emits_and_evicts_history() {
        let mut fx = fixture();
        fx.run(customer_message("c1", "hi")).await;
        fx.run(Action::OperatorChatClose {
            chat_id: ChatId::from("c1"),
            operator_id: OperatorId::from("op-1"),
        })
        .await;

        assert_eq!(fx.transport.emits_named(events::CHAT_CLOSED).len(), 1);
        assert!(fx
            .interceptor
            .log
            .history(&ChatId::from("c1"), Audience::Customer)
            .is_empty());
    }

    #[tokio::test]
    async fn test_customer_left_notice_only_while_disconnected() {
        let mut fx = fixture();
        fx.run(customer_message("c1", "hi")).await;

        // Customer present: a raced notice does nothing.
        fx.run(Action::NotifyCustomerLeft {
            chat_id: ChatId::from("c1"),
        })
        .await;
        assert!(fx.transport.emits_named(events::CHAT_CUSTOMER_LEFT).is_empty());

        fx.run(Action::CustomerDisconnect {
            chat_id: ChatId::from("c1"),
        })
        .await;
        fx.run(Action::NotifyCustomerLeft {
            chat_id: ChatId::from("c1"),
        })
        .await;
        let left = fx.transport.emits_named(events::CHAT_CUSTOMER_LEFT);
        assert_eq!(left.len(), 1);
        assert_eq!(
            left[0].payload["message"]["body"],
            "The customer appears to have left the chat"
        );
    }

    #[tokio::test]
    async fn test_rejoining_customer_gets_history_backfill() {
        let mut fx = fixture();
        fx.run(customer_message("c1", "first")).await;
        fx.run(customer_message("c1", "second")).await;
        fx.transport.clear_emits();

        fx.run(Action::CustomerJoin {
            chat_id: ChatId::from("c1"),
            session: session(),
        })
        .await;

        let history = fx.transport.emits_named(events::CHAT_HISTORY);
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].payload["audience"], "customer");
        assert_eq!(history[0].payload["messages"].as_array().unwrap().len(), 2);
    }
}
