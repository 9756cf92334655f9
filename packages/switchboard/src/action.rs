//! Actions: the closed set of inputs the pipeline applies to the store.
//!
//! Everything that happens (customer traffic, operator commands, timer
//! firings, attempt outcomes) is expressed as one of these variants.
//! Asynchronous work never mutates state directly; it re-enters the
//! pipeline as a new action (attempt outcomes, deferred notices), which is
//! what keeps the store single-writer.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::chat::{ChatId, ChatSession, Locale};
use crate::operator::{ConnectionId, OperatorId, OperatorProfile, OperatorRef, OperatorStatus};

/// Why a chat ended up `Missed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum MissReason {
    /// The candidate set was empty at attempt time.
    NoOperators,
    /// The chosen operator's room join did not confirm in time.
    JoinTimeout { operator: OperatorId },
    /// A transfer named an operator the store does not know.
    TransferTargetUnknown { target: OperatorId },
    /// The transfer target's room join did not confirm in time.
    TransferTimeout { target: OperatorId },
}

impl fmt::Display for MissReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MissReason::NoOperators => write!(f, "no operators available"),
            MissReason::JoinTimeout { operator } => {
                write!(f, "operator {operator} did not join in time")
            }
            MissReason::TransferTargetUnknown { target } => {
                write!(f, "transfer target {target} is unknown")
            }
            MissReason::TransferTimeout { target } => {
                write!(f, "transfer target {target} did not join in time")
            }
        }
    }
}

/// Every input the pipeline accepts, external and internal.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    // -------------------------------------------------------------------------
    // Customer traffic (from the transport shim)
    // -------------------------------------------------------------------------
    /// A customer message. Creates the chat if needed; on a new or closed
    /// chat this (re-)enters the pending queue and records the session's
    /// locale and groups.
    CustomerMessage {
        chat_id: ChatId,
        session: ChatSession,
        body: String,
    },
    /// Typing indicator; forwarded, never stored.
    CustomerTyping { chat_id: ChatId, typing: bool },
    /// Customer (re)joined the chat room. Creates the chat as `New` when
    /// unknown, cancels pending disconnect timers, restores the
    /// pre-disconnect status.
    CustomerJoin {
        chat_id: ChatId,
        session: ChatSession,
    },
    /// The customer's last connection dropped.
    CustomerDisconnect { chat_id: ChatId },

    // -------------------------------------------------------------------------
    // Operator traffic
    // -------------------------------------------------------------------------
    OperatorMessage {
        chat_id: ChatId,
        operator: OperatorRef,
        body: String,
    },
    OperatorTyping {
        chat_id: ChatId,
        operator_id: OperatorId,
        typing: bool,
    },
    /// Operator opened a chat; joins their connections to the room and
    /// adds them to the chat's members.
    OperatorChatJoin {
        chat_id: ChatId,
        operator_id: OperatorId,
    },
    /// Operator left a chat's room; membership bookkeeping only.
    OperatorChatLeave {
        chat_id: ChatId,
        operator_id: OperatorId,
    },
    /// Operator closed the chat.
    OperatorChatClose {
        chat_id: ChatId,
        operator_id: OperatorId,
    },
    /// Hand the chat to a named operator, bypassing ranking.
    OperatorChatTransfer {
        chat_id: ChatId,
        from: OperatorId,
        to: OperatorId,
    },
    /// A new operator connection was established and authenticated.
    OperatorReady {
        profile: OperatorProfile,
        connection: ConnectionId,
    },
    /// An operator connection dropped. When it was the last one, the
    /// operator goes offline and their assigned chats are abandoned.
    OperatorOffline {
        operator_id: OperatorId,
        connection: ConnectionId,
    },
    SetOperatorStatus {
        operator_id: OperatorId,
        status: OperatorStatus,
    },
    SetOperatorCapacity {
        operator_id: OperatorId,
        locale: Locale,
        capacity: u32,
    },
    /// The pull flag: the operator explicitly asks for (or stops asking
    /// for) the next chat.
    SetOperatorRequestingChat {
        operator_id: OperatorId,
        requesting: bool,
    },
    /// Gate for the assignment sweep; queued chats wait while off.
    SetAcceptsCustomers { accepts: bool },

    // -------------------------------------------------------------------------
    // Agent traffic
    // -------------------------------------------------------------------------
    /// Message from the automated agent channel.
    AgentMessage {
        chat_id: ChatId,
        agent_id: String,
        body: String,
    },

    // -------------------------------------------------------------------------
    // Internal: produced by the engine itself
    // -------------------------------------------------------------------------
    /// Sweep decision: begin an assignment attempt for this chat.
    AssignChat { chat_id: ChatId },
    /// Attempt outcome: the operator's room join confirmed. Ignored when
    /// the chat is no longer `Assigning` (stale attempt), except as an
    /// idempotent re-assertion of the same operator.
    SetChatOperator {
        chat_id: ChatId,
        operator: OperatorRef,
    },
    /// Attempt outcome: nobody took the chat. Ignored unless the chat is
    /// still `Assigning`.
    SetChatMissed {
        chat_id: ChatId,
        reason: MissReason,
    },
    /// Recovery outcome: hand these abandoned chats back to the operator.
    SetChatsRecovered {
        operator_id: OperatorId,
        chat_ids: Vec<ChatId>,
    },
    /// Overwrite derived per-locale loads with a fresh recomputation.
    SyncLoads {
        loads: BTreeMap<Locale, BTreeMap<OperatorId, u32>>,
    },
    /// Deferred notice that the customer left; fires unless cancelled by a
    /// rejoin.
    NotifyCustomerLeft { chat_id: ChatId },
    /// Deferred close of a disconnected chat; fires unless cancelled by a
    /// rejoin.
    AutocloseChat { chat_id: ChatId },
    /// Drop the chat record entirely. The only way a chat leaves the map.
    RemoveChat { chat_id: ChatId },
}

impl Action {
    /// Stable name for logging and tracing spans.
    pub fn name(&self) -> &'static str {
        match self {
            Action::CustomerMessage { .. } => "customer_message",
            Action::CustomerTyping { .. } => "customer_typing",
            Action::CustomerJoin { .. } => "customer_join",
            Action::CustomerDisconnect { .. } => "customer_disconnect",
            Action::OperatorMessage { .. } => "operator_message",
            Action::OperatorTyping { .. } => "operator_typing",
            Action::OperatorChatJoin { .. } => "operator_chat_join",
            Action::OperatorChatLeave { .. } => "operator_chat_leave",
            Action::OperatorChatClose { .. } => "operator_chat_close",
            Action::OperatorChatTransfer { .. } => "operator_chat_transfer",
            Action::OperatorReady { .. } => "operator_ready",
            Action::OperatorOffline { .. } => "operator_offline",
            Action::SetOperatorStatus { .. } => "set_operator_status",
            Action::SetOperatorCapacity { .. } => "set_operator_capacity",
            Action::SetOperatorRequestingChat { .. } => "set_operator_requesting_chat",
            Action::SetAcceptsCustomers { .. } => "set_accepts_customers",
            Action::AgentMessage { .. } => "agent_message",
            Action::AssignChat { .. } => "assign_chat",
            Action::SetChatOperator { .. } => "set_chat_operator",
            Action::SetChatMissed { .. } => "set_chat_missed",
            Action::SetChatsRecovered { .. } => "set_chats_recovered",
            Action::SyncLoads { .. } => "sync_loads",
            Action::NotifyCustomerLeft { .. } => "notify_customer_left",
            Action::AutocloseChat { .. } => "autoclose_chat",
            Action::RemoveChat { .. } => "remove_chat",
        }
    }

    /// The chat this action concerns, when it concerns exactly one.
    pub fn chat_id(&self) -> Option<&ChatId> {
        match self {
            Action::CustomerMessage { chat_id, .. }
            | Action::CustomerTyping { chat_id, .. }
            | Action::CustomerJoin { chat_id, .. }
            | Action::CustomerDisconnect { chat_id }
            | Action::OperatorMessage { chat_id, .. }
            | Action::OperatorTyping { chat_id, .. }
            | Action::OperatorChatJoin { chat_id, .. }
            | Action::OperatorChatLeave { chat_id, .. }
            | Action::OperatorChatClose { chat_id, .. }
            | Action::OperatorChatTransfer { chat_id, .. }
            | Action::AgentMessage { chat_id, .. }
            | Action::AssignChat { chat_id }
            | Action::SetChatOperator { chat_id, .. }
            | Action::SetChatMissed { chat_id, .. }
            | Action::NotifyCustomerLeft { chat_id }
            | Action::AutocloseChat { chat_id }
            | Action::RemoveChat { chat_id } => Some(chat_id),
            _ => None,
        }
    }
}
