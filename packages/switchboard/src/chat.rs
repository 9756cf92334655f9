//! Chat records: the conversation lifecycle, the customer session attached
//! to it, and the messages exchanged inside it.
//!
//! A chat is created implicitly, when a customer joins or sends a first
//! message, and is removed only by an explicit
//! removal action. Closing a chat is an ordinary status, not removal: the
//! record stays queryable and a later customer message re-enters the
//! pending queue.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::group::GroupId;
use crate::operator::{OperatorId, OperatorRef};

/// Identifier for one support conversation.
///
/// Chat ids are minted by the transport shim (session ids, widget ids);
/// the engine treats them as opaque strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChatId(String);

impl ChatId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChatId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ChatId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// A language/region scope. Operator capacity is tracked per locale and
/// chats are only served by operators with an active membership in their
/// locale.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Locale(String);

impl Locale {
    pub fn new(locale: impl Into<String>) -> Self {
        Self(locale.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Locale {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Locale {
    fn from(locale: &str) -> Self {
        Self(locale.to_string())
    }
}

// =============================================================================
// Lifecycle
// =============================================================================

/// Chat lifecycle status.
///
/// ```text
/// NEW ──► PENDING ──► ASSIGNING ──► ASSIGNED ◄──► ABANDONED
///            ▲            │            │
///            │            ▼            ▼
///            └───────── MISSED   CUSTOMER_DISCONNECT ──► CLOSED
/// ```
///
/// Every non-closed status can reach `Closed` (operator close, autoclose);
/// a customer message on a closed chat re-enters `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChatStatus {
    /// Customer opened the widget but has not sent anything yet.
    New,
    /// Waiting in the queue for an operator.
    Pending,
    /// An assignment or transfer attempt is in flight for this chat.
    Assigning,
    /// An operator is serving the chat.
    Assigned,
    /// No operator could be reached; retried by later sweeps.
    Missed,
    /// The customer's last connection dropped; autoclose is pending.
    CustomerDisconnect,
    /// The assigned operator has no live connections; awaiting recovery.
    Abandoned,
    /// Ended. Still queryable, excluded from broadcast and load accounting.
    Closed,
}

impl ChatStatus {
    /// Closed chats drop out of load accounting and broadcast snapshots.
    pub fn is_open(&self) -> bool {
        !matches!(self, ChatStatus::Closed)
    }

    /// Statuses the assignment sweep considers.
    pub fn is_assignable(&self) -> bool {
        matches!(self, ChatStatus::Pending | ChatStatus::Missed)
    }
}

impl fmt::Display for ChatStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChatStatus::New => "NEW",
            ChatStatus::Pending => "PENDING",
            ChatStatus::Assigning => "ASSIGNING",
            ChatStatus::Assigned => "ASSIGNED",
            ChatStatus::Missed => "MISSED",
            ChatStatus::CustomerDisconnect => "CUSTOMER_DISCONNECT",
            ChatStatus::Abandoned => "ABANDONED",
            ChatStatus::Closed => "CLOSED",
        };
        f.write_str(s)
    }
}

/// Customer identity and routing scope, captured when the chat enters the
/// pending queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSession {
    /// Opaque customer id from the transport shim.
    pub customer_id: String,
    /// Display name shown to operators.
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    /// Requested locale; normalized to a supported one before insertion.
    pub locale: Locale,
    /// Requested groups; normalized (unknown dropped, empty defaulted)
    /// before insertion.
    pub groups: Vec<GroupId>,
}

/// One support conversation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Chat {
    pub id: ChatId,
    pub status: ChatStatus,
    pub session: ChatSession,
    /// The operator serving this chat; kept through `Abandoned` so recovery
    /// can hand the chat back.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operator: Option<OperatorRef>,
    /// Stamped on first pending insertion, never overwritten: a reopened
    /// chat keeps its original place in the queue.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assigned_at: Option<DateTime<Utc>>,
    /// Operator ids currently in the chat room. Independent of assignment:
    /// several operators can observe one chat.
    pub members: BTreeSet<OperatorId>,
    /// Status held before the customer disconnected; restored on rejoin.
    #[serde(skip)]
    pub disconnected_from: Option<ChatStatus>,
    /// Status held before the current assignment attempt began. Miss
    /// notifications are suppressed when this was already `Missed`.
    #[serde(skip)]
    pub assigning_from: Option<ChatStatus>,
    /// Insertion tiebreaker for chats with identical `assigned_at`.
    #[serde(skip)]
    pub seq: u64,
}

impl Chat {
    pub fn new(id: ChatId, session: ChatSession, seq: u64) -> Self {
        Self {
            id,
            status: ChatStatus::New,
            session,
            operator: None,
            assigned_at: None,
            members: BTreeSet::new(),
            disconnected_from: None,
            assigning_from: None,
            seq,
        }
    }

    /// The operator id serving this chat, if any.
    pub fn operator_id(&self) -> Option<&OperatorId> {
        self.operator.as_ref().map(|op| &op.id)
    }

    pub fn is_open(&self) -> bool {
        self.status.is_open()
    }
}

// =============================================================================
// Messages
// =============================================================================

/// Who produced a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum MessageAuthor {
    Customer { name: String },
    Operator { id: OperatorId, name: String },
    Agent { id: String },
    /// Synthesized notices: joins, leaves, transfers, misses.
    System,
}

/// Which side of the conversation a cached message is replayed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Audience {
    Customer,
    Operator,
}

/// A single chat message, conversational or synthesized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: Uuid,
    pub chat_id: ChatId,
    pub author: MessageAuthor,
    pub body: String,
    pub at: DateTime<Utc>,
}

impl ChatMessage {
    pub fn new(chat_id: ChatId, author: MessageAuthor, body: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            chat_id,
            author,
            body: body.into(),
            at: Utc::now(),
        }
    }

    /// A system notice, operator-audience by convention.
    pub fn system(chat_id: ChatId, body: impl Into<String>) -> Self {
        Self::new(chat_id, MessageAuthor::System, body)
    }
}
