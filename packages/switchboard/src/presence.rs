//! Presence: who is actually in which room, and what happens when a
//! customer or operator drops off.
//!
//! Owns the disconnect timers (customer-left notice, autoclose) and the
//! operator recovery path. Runs early in the chain so a disconnect that
//! raced a reconnect is cancelled before anything downstream reacts.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::action::Action;
use crate::chat::{ChatId, ChatStatus};
use crate::config::EngineConfig;
use crate::operator::ConnectionId;
use crate::pipeline::{InterceptCtx, Interceptor};
use crate::scheduler::{Scheduler, TimerKey};
use crate::store::Store;
use crate::transport::{RoomId, Transport};

pub struct PresenceInterceptor {
    transport: Arc<dyn Transport>,
    scheduler: Scheduler,
    customer_left_delay: Duration,
    autoclose_delay: Duration,
}

impl PresenceInterceptor {
    pub fn new(transport: Arc<dyn Transport>, scheduler: Scheduler, config: &EngineConfig) -> Self {
        Self {
            transport,
            scheduler,
            customer_left_delay: config.customer_left_delay,
            autoclose_delay: config.autoclose_delay,
        }
    }

    fn is_operator_connection(store: &Store, connection: &ConnectionId) -> bool {
        store
            .operators
            .values()
            .any(|op| op.connections.contains(connection))
    }
}

#[async_trait]
impl Interceptor for PresenceInterceptor {
    fn name(&self) -> &'static str {
        "presence"
    }

    async fn before(&mut self, store: &Store, action: &mut Action, ctx: &mut InterceptCtx) {
        let Action::CustomerDisconnect { chat_id } = action else {
            return;
        };
        let Some(chat) = store.chat(chat_id) else { return };
        if matches!(
            chat.status,
            ChatStatus::New | ChatStatus::Closed | ChatStatus::CustomerDisconnect
        ) {
            return;
        }

        // The disconnect event raced the customer's reconnect: if any
        // non-operator connection is in the room, the customer is back
        // and the disconnect means nothing.
        match self.transport.room_members(&RoomId::chat(chat_id)).await {
            Ok(members) => {
                let customer_present = members
                    .iter()
                    .any(|conn| !Self::is_operator_connection(store, conn));
                if customer_present {
                    ctx.cancel("customer still in chat room");
                }
            }
            Err(error) => {
                // Degrades to an empty room: the disconnect proceeds, and a
                // customer who is actually present restores the chat with
                // their next join or message.
                warn!(chat_id = %chat_id, %error, "room membership check failed");
            }
        }
    }

    async fn after(
        &mut self,
        _prev: &Store,
        store: &Store,
        action: &Action,
        changed: bool,
        ctx: &mut InterceptCtx,
    ) {
        match action {
            Action::CustomerDisconnect { chat_id } if changed => {
                self.scheduler.schedule(
                    TimerKey::customer_left(chat_id),
                    self.customer_left_delay,
                    Action::NotifyCustomerLeft {
                        chat_id: chat_id.clone(),
                    },
                );
                self.scheduler.schedule(
                    TimerKey::autoclose(chat_id),
                    self.autoclose_delay,
                    Action::AutocloseChat {
                        chat_id: chat_id.clone(),
                    },
                );
            }
            // Any rejoin kills both timers, whether or not state changed.
            Action::CustomerJoin { chat_id, .. } => {
                self.scheduler.cancel_chat(chat_id);
            }
            Action::OperatorChatClose { chat_id, .. }
            | Action::AutocloseChat { chat_id }
            | Action::RemoveChat { chat_id }
                if changed =>
            {
                self.scheduler.cancel_chat(chat_id);
            }
            Action::OperatorChatJoin {
                chat_id,
                operator_id,
            } if changed => {
                let Some(op) = store.operator(operator_id) else {
                    return;
                };
                let connections = op.connection_list();
                let room = RoomId::chat(chat_id);
                let transport = self.transport.clone();
                let chat_id = chat_id.clone();
                ctx.spawn_attempt(async move {
                    if let Err(error) = transport.join_room(&connections, &room).await {
                        warn!(chat_id = %chat_id, %error, "chat room join failed");
                    }
                    None
                });
            }
            Action::OperatorChatLeave {
                chat_id,
                operator_id,
            } if changed => {
                let Some(op) = store.operator(operator_id) else {
                    return;
                };
                let connections = op.connection_list();
                let room = RoomId::chat(chat_id);
                let transport = self.transport.clone();
                let chat_id = chat_id.clone();
                ctx.spawn_attempt(async move {
                    if let Err(error) = transport.leave_room(&connections, &room).await {
                        warn!(chat_id = %chat_id, %error, "chat room leave failed");
                    }
                    None
                });
            }
            Action::OperatorReady {
                profile,
                connection,
            } if changed => {
                let transport = self.transport.clone();
                let conn = connection.clone();
                ctx.spawn_attempt(async move {
                    if let Err(error) = transport.join_room(&[conn], &RoomId::operators()).await {
                        warn!(%error, "operators room join failed");
                    }
                    None
                });

                let Some(op) = store.operator(&profile.id) else {
                    return;
                };
                let operator_id = profile.id.clone();
                let connections = op.connection_list();

                let abandoned: Vec<ChatId> = store
                    .chats
                    .values()
                    .filter(|c| {
                        c.status == ChatStatus::Abandoned
                            && c.operator_id() == Some(&operator_id)
                    })
                    .map(|c| c.id.clone())
                    .collect();

                // A reconnecting tab also needs to re-enter the rooms of
                // chats the operator is still a member of.
                let rejoin: Vec<ChatId> = store
                    .chats
                    .values()
                    .filter(|c| {
                        c.is_open()
                            && c.status != ChatStatus::Abandoned
                            && c.members.contains(&operator_id)
                    })
                    .map(|c| c.id.clone())
                    .collect();

                if abandoned.is_empty() && rejoin.is_empty() {
                    return;
                }
                if !abandoned.is_empty() {
                    info!(
                        operator_id = %operator_id,
                        chats = abandoned.len(),
                        "recovering abandoned chats"
                    );
                }

                let transport = self.transport.clone();
                let new_connection = connection.clone();
                ctx.spawn_attempt(async move {
                    for chat_id in &rejoin {
                        if let Err(error) = transport
                            .join_room(std::slice::from_ref(&new_connection), &RoomId::chat(chat_id))
                            .await
                        {
                            warn!(chat_id = %chat_id, %error, "room rejoin failed");
                        }
                    }
                    for chat_id in &abandoned {
                        if let Err(error) =
                            transport.join_room(&connections, &RoomId::chat(chat_id)).await
                        {
                            warn!(chat_id = %chat_id, %error, "recovery room join failed");
                        }
                    }
                    if abandoned.is_empty() {
                        None
                    } else {
                        Some(Action::SetChatsRecovered {
                            operator_id,
                            chat_ids: abandoned,
                        })
                    }
                });
            }
            _ => {}
        }
    }
}
