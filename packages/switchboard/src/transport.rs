//! Room and event plumbing.
//!
//! The engine never talks to sockets directly. It addresses *rooms* and
//! asks a [`Transport`] to move connections in and out of them and to
//! emit named events. Production wires this to the realtime layer; tests
//! use the recording transport from [`crate::testing`].

use async_trait::async_trait;
use serde_json::Value;
use std::fmt;

use crate::chat::ChatId;
use crate::operator::ConnectionId;

/// Event names on the wire.
pub mod events {
    pub const CHAT_MESSAGE: &str = "chat:message";
    pub const CHAT_TYPING: &str = "chat:typing";
    pub const CHAT_OPENED: &str = "chat:opened";
    pub const CHAT_CLOSED: &str = "chat:closed";
    pub const CHAT_MISSED: &str = "chat:missed";
    pub const CHAT_CUSTOMER_LEFT: &str = "chat:customer_left";
    pub const CHAT_HISTORY: &str = "chat:history";
    pub const CHAT_OPERATOR_JOINED: &str = "chat:operator_joined";
    pub const CHAT_OPERATOR_LEFT: &str = "chat:operator_left";
    pub const STATE_PATCH: &str = "state:patch";
    pub const STATE_FULL: &str = "state:full";
}

/// An addressable room on the realtime layer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RoomId(String);

impl RoomId {
    /// The per-chat room holding the customer and any observing operators.
    pub fn chat(chat_id: &ChatId) -> Self {
        Self(format!("chat:{chat_id}"))
    }

    /// The shared room every operator console sits in.
    pub fn operators() -> Self {
        Self("operators".to_string())
    }

    /// A single connection's private room.
    pub fn connection(connection: &ConnectionId) -> Self {
        Self(format!("connection:{connection}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The outbound seam between the engine and the realtime layer.
///
/// `emit` is fire-and-forget; delivery failures are the transport's
/// problem. Room membership changes are awaited because assignment
/// treats "the operator's connections joined the chat room" as the
/// success condition of an attempt.
///
/// `room_members` is awaited on the pipeline task while it holds the
/// store's write lock, so implementations must not call back into
/// [`EngineHandle::with_store`] (or otherwise wait on the pipeline)
/// from inside it; doing so deadlocks.
///
/// [`EngineHandle::with_store`]: crate::EngineHandle::with_store
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn join_room(&self, connections: &[ConnectionId], room: &RoomId) -> anyhow::Result<()>;

    async fn leave_room(&self, connections: &[ConnectionId], room: &RoomId)
        -> anyhow::Result<()>;

    fn emit(&self, room: &RoomId, event: &str, payload: Value);

    /// Current connections in a room, used to detect whether a customer
    /// raced back before a disconnect was processed.
    async fn room_members(&self, room: &RoomId) -> anyhow::Result<Vec<ConnectionId>>;
}
