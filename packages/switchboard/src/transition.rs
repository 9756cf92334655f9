//! The transition function: the only place the store mutates.
//!
//! `apply` is an exhaustive match over [`Action`] delegating to small
//! `handle_*` helpers. It is synchronous and pure with respect to I/O;
//! interceptors observe the store before and after and produce every
//! outbound effect. The returned flag reports whether the store changed,
//! which drives load recomputation and broadcast versioning downstream.

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::action::Action;
use crate::chat::{Chat, ChatId, ChatSession, ChatStatus};
use crate::operator::{ConnectionId, OperatorId, OperatorProfile, OperatorRef};
use crate::store::Store;

/// Apply one action to the store. Returns true when state changed.
pub fn apply(store: &mut Store, action: &Action, now: DateTime<Utc>) -> bool {
    match action {
        Action::CustomerMessage {
            chat_id, session, ..
        } => handle_customer_message(store, chat_id, session, now),
        Action::CustomerTyping { .. } => false,
        Action::CustomerJoin { chat_id, session } => {
            handle_customer_join(store, chat_id, session)
        }
        Action::CustomerDisconnect { chat_id } => handle_customer_disconnect(store, chat_id),
        Action::OperatorMessage { .. } | Action::OperatorTyping { .. } => false,
        Action::OperatorChatJoin {
            chat_id,
            operator_id,
        } => match store.chat_mut(chat_id) {
            Some(chat) => chat.members.insert(operator_id.clone()),
            None => false,
        },
        Action::OperatorChatLeave {
            chat_id,
            operator_id,
        } => match store.chat_mut(chat_id) {
            Some(chat) => chat.members.remove(operator_id),
            None => false,
        },
        Action::OperatorChatClose { chat_id, .. } => handle_close(store, chat_id),
        Action::OperatorChatTransfer { chat_id, to, .. } => {
            handle_transfer(store, chat_id, to)
        }
        Action::OperatorReady {
            profile,
            connection,
        } => handle_operator_ready(store, profile, connection),
        Action::OperatorOffline {
            operator_id,
            connection,
        } => handle_operator_offline(store, operator_id, connection),
        Action::SetOperatorStatus {
            operator_id,
            status,
        } => match store.operator_mut(operator_id) {
            Some(op) if op.status != *status => {
                op.status = *status;
                true
            }
            Some(_) => false,
            None => {
                warn!(operator_id = %operator_id, "status change for unknown operator");
                false
            }
        },
        Action::SetOperatorCapacity {
            operator_id,
            locale,
            capacity,
        } => handle_set_capacity(store, operator_id, locale, *capacity),
        Action::SetOperatorRequestingChat {
            operator_id,
            requesting,
        } => match store.operator_mut(operator_id) {
            Some(op) if op.requesting_chat != *requesting => {
                op.requesting_chat = *requesting;
                true
            }
            _ => false,
        },
        Action::SetAcceptsCustomers { accepts } => {
            if store.accepts_customers != *accepts {
                store.accepts_customers = *accepts;
                true
            } else {
                false
            }
        }
        Action::AgentMessage { .. } => false,
        Action::AssignChat { chat_id } => handle_assign_chat(store, chat_id),
        Action::SetChatOperator { chat_id, operator } => {
            handle_set_chat_operator(store, chat_id, operator)
        }
        Action::SetChatMissed { chat_id, .. } => handle_set_chat_missed(store, chat_id),
        Action::SetChatsRecovered {
            operator_id,
            chat_ids,
        } => handle_chats_recovered(store, operator_id, chat_ids),
        Action::SyncLoads { loads } => handle_sync_loads(store, loads),
        Action::NotifyCustomerLeft { .. } => false,
        Action::AutocloseChat { chat_id } => handle_autoclose(store, chat_id),
        Action::RemoveChat { chat_id } => store.chats.remove(chat_id).is_some(),
    }
}

// =============================================================================
// Customer lifecycle
// =============================================================================

fn handle_customer_message(
    store: &mut Store,
    chat_id: &ChatId,
    session: &ChatSession,
    now: DateTime<Utc>,
) -> bool {
    if let Some(chat) = store.chat_mut(chat_id) {
        match chat.status {
            // A message on a new or closed chat (re-)enters the queue,
            // re-recording the session's locale and groups. The queue
            // timestamp is stamped at most once, so a reopened chat keeps
            // its original position.
            ChatStatus::New | ChatStatus::Closed => {
                chat.status = ChatStatus::Pending;
                chat.session = session.clone();
                chat.operator = None;
                chat.disconnected_from = None;
                chat.assigning_from = None;
                if chat.assigned_at.is_none() {
                    chat.assigned_at = Some(now);
                }
                true
            }
            // Messages on an open chat are pure traffic.
            _ => false,
        }
    } else {
        let seq = store.next_chat_seq();
        let mut chat = Chat::new(chat_id.clone(), session.clone(), seq);
        chat.status = ChatStatus::Pending;
        chat.assigned_at = Some(now);
        store.chats.insert(chat_id.clone(), chat);
        true
    }
}

fn handle_customer_join(store: &mut Store, chat_id: &ChatId, session: &ChatSession) -> bool {
    if let Some(chat) = store.chat_mut(chat_id) {
        if chat.status == ChatStatus::CustomerDisconnect {
            // Restore the pre-disconnect status. An interrupted attempt
            // cannot resume, so it re-queues instead.
            let restored = match chat.disconnected_from {
                Some(ChatStatus::Assigning) => ChatStatus::Pending,
                Some(status) => status,
                None => {
                    if chat.operator.is_some() {
                        ChatStatus::Assigned
                    } else {
                        ChatStatus::Pending
                    }
                }
            };
            chat.status = restored;
            chat.disconnected_from = None;
            true
        } else {
            false
        }
    } else {
        // Opening the widget creates the chat before any message exists.
        let seq = store.next_chat_seq();
        store
            .chats
            .insert(chat_id.clone(), Chat::new(chat_id.clone(), session.clone(), seq));
        true
    }
}

fn handle_customer_disconnect(store: &mut Store, chat_id: &ChatId) -> bool {
    match store.chat_mut(chat_id) {
        Some(chat)
            if !matches!(
                chat.status,
                ChatStatus::New | ChatStatus::Closed | ChatStatus::CustomerDisconnect
            ) =>
        {
            chat.disconnected_from = Some(chat.status);
            chat.status = ChatStatus::CustomerDisconnect;
            true
        }
        _ => false,
    }
}

fn handle_close(store: &mut Store, chat_id: &ChatId) -> bool {
    match store.chat_mut(chat_id) {
        Some(chat) if chat.status != ChatStatus::Closed => {
            chat.status = ChatStatus::Closed;
            chat.disconnected_from = None;
            chat.assigning_from = None;
            true
        }
        _ => false,
    }
}

fn handle_autoclose(store: &mut Store, chat_id: &ChatId) -> bool {
    match store.chat_mut(chat_id) {
        // The customer must still be gone. A cancelled timer should never
        // reach this point, but a raced one lands here harmlessly.
        Some(chat) if chat.status == ChatStatus::CustomerDisconnect => {
            chat.status = ChatStatus::Closed;
            chat.disconnected_from = None;
            true
        }
        _ => false,
    }
}

// =============================================================================
// Assignment lifecycle
// =============================================================================

fn handle_assign_chat(store: &mut Store, chat_id: &ChatId) -> bool {
    match store.chat_mut(chat_id) {
        Some(chat) if chat.status.is_assignable() => {
            chat.assigning_from = Some(chat.status);
            chat.status = ChatStatus::Assigning;
            true
        }
        Some(chat) => {
            debug!(chat_id = %chat_id, status = %chat.status, "assignment request ignored");
            false
        }
        None => false,
    }
}

fn handle_set_chat_operator(store: &mut Store, chat_id: &ChatId, operator: &OperatorRef) -> bool {
    match store.chat_mut(chat_id) {
        Some(chat) if chat.status == ChatStatus::Assigning => {
            chat.status = ChatStatus::Assigned;
            chat.operator = Some(operator.clone());
            chat.members.insert(operator.id.clone());
            chat.assigning_from = None;
            true
        }
        // Duplicate delivery of the same outcome re-asserts membership and
        // nothing else.
        Some(chat)
            if chat.status == ChatStatus::Assigned
                && chat.operator_id() == Some(&operator.id) =>
        {
            chat.members.insert(operator.id.clone())
        }
        Some(chat) => {
            debug!(
                chat_id = %chat_id,
                status = %chat.status,
                operator_id = %operator.id,
                "stale assignment outcome ignored"
            );
            false
        }
        None => false,
    }
}

fn handle_set_chat_missed(store: &mut Store, chat_id: &ChatId) -> bool {
    match store.chat_mut(chat_id) {
        Some(chat) if chat.status == ChatStatus::Assigning => {
            chat.status = ChatStatus::Missed;
            chat.assigning_from = None;
            true
        }
        Some(chat) => {
            debug!(chat_id = %chat_id, status = %chat.status, "stale miss outcome ignored");
            false
        }
        None => false,
    }
}

fn handle_transfer(store: &mut Store, chat_id: &ChatId, to: &OperatorId) -> bool {
    let target_known = store.operators.contains_key(to);
    match store.chat_mut(chat_id) {
        // The chat passes through Assigning even for an unknown target,
        // so the failure path shares the attempt machinery. A transfer
        // raced against an attempt already in flight is a no-op; the
        // outcome of that attempt settles the chat first.
        Some(chat)
            if chat.status != ChatStatus::Closed && chat.status != ChatStatus::Assigning =>
        {
            chat.assigning_from = Some(chat.status);
            chat.status = ChatStatus::Assigning;
            if !target_known {
                debug!(chat_id = %chat_id, target = %to, "transfer target unknown");
            }
            true
        }
        _ => false,
    }
}

fn handle_chats_recovered(
    store: &mut Store,
    operator_id: &OperatorId,
    chat_ids: &[ChatId],
) -> bool {
    let mut changed = false;
    for chat_id in chat_ids {
        if let Some(chat) = store.chat_mut(chat_id) {
            if chat.status == ChatStatus::Abandoned && chat.operator_id() == Some(operator_id) {
                chat.status = ChatStatus::Assigned;
                chat.members.insert(operator_id.clone());
                changed = true;
            }
        }
    }
    changed
}

// =============================================================================
// Operator lifecycle
// =============================================================================

fn handle_operator_ready(
    store: &mut Store,
    profile: &OperatorProfile,
    connection: &ConnectionId,
) -> bool {
    if let Some(op) = store.operator_mut(&profile.id) {
        op.name = profile.name.clone();
        // Capacity and active flags follow the profile wholesale; loads
        // survive for locales that persist (they are re-derived anyway).
        let old = std::mem::take(&mut op.memberships);
        for (locale, seed) in &profile.memberships {
            let mut membership = crate::operator::LocaleMembership::new(seed.capacity);
            membership.active = seed.active;
            if let Some(previous) = old.get(locale) {
                membership.load = previous.load;
            }
            op.memberships.insert(locale.clone(), membership);
        }
        op.connections.insert(connection.clone());
        op.online = true;
    } else {
        let seq = store.next_operator_seq();
        let mut op = crate::operator::Operator::from_profile(profile, seq);
        op.connections.insert(connection.clone());
        op.online = true;
        store.operators.insert(profile.id.clone(), op);
    }
    store.join_groups(&profile.id, &profile.groups);
    true
}

fn handle_operator_offline(
    store: &mut Store,
    operator_id: &OperatorId,
    connection: &ConnectionId,
) -> bool {
    let (removed, went_offline) = match store.operator_mut(operator_id) {
        Some(op) => {
            let removed = op.connections.remove(connection);
            if op.connections.is_empty() && op.online {
                op.online = false;
                // A pull request is connection-bound intent.
                op.requesting_chat = false;
                (removed, true)
            } else {
                (removed, false)
            }
        }
        None => {
            warn!(operator_id = %operator_id, "offline event for unknown operator");
            return false;
        }
    };

    if went_offline {
        // Every chat this operator was serving waits for recovery. Closed
        // chats and other statuses are untouched.
        for chat in store.chats.values_mut() {
            if chat.status == ChatStatus::Assigned && chat.operator_id() == Some(operator_id) {
                chat.status = ChatStatus::Abandoned;
            }
        }
    }
    // A duplicate offline for a connection already gone is a no-op.
    removed || went_offline
}

fn handle_set_capacity(
    store: &mut Store,
    operator_id: &OperatorId,
    locale: &crate::chat::Locale,
    capacity: u32,
) -> bool {
    match store.operator_mut(operator_id) {
        Some(op) => match op.memberships.get_mut(locale) {
            Some(membership) if membership.capacity != capacity => {
                membership.capacity = capacity;
                true
            }
            Some(_) => false,
            None => {
                op.memberships.insert(
                    locale.clone(),
                    crate::operator::LocaleMembership::new(capacity),
                );
                true
            }
        },
        None => {
            warn!(operator_id = %operator_id, "capacity change for unknown operator");
            false
        }
    }
}

fn handle_sync_loads(
    store: &mut Store,
    loads: &std::collections::BTreeMap<
        crate::chat::Locale,
        std::collections::BTreeMap<OperatorId, u32>,
    >,
) -> bool {
    let mut changed = false;
    for op in store.operators.values_mut() {
        for (locale, membership) in op.memberships.iter_mut() {
            let fresh = loads
                .get(locale)
                .and_then(|per_op| per_op.get(&op.id))
                .copied()
                .unwrap_or(0);
            if membership.load != fresh {
                membership.load = fresh;
                changed = true;
            }
        }
    }
    changed
}
