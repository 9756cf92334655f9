//! # Switchboard
//!
//! An in-memory routing and assignment engine for live chat support:
//! customers queue up, ranked operators are offered chats, timers drive
//! disconnect handling and autoclose, and operator consoles follow the
//! whole picture through versioned state patches.
//!
//! ## Core Concepts
//!
//! Switchboard separates **inputs** from **effects**:
//! - [`Action`] = every input (customer traffic, operator commands, timer
//!   firings, attempt outcomes)
//! - The transition = the only code that mutates the [`Store`]
//! - Interceptors = everything around it (scope normalization, timers,
//!   wire events, assignment attempts, load reconciliation, broadcast)
//!
//! The key principle: **one writer, one cascade at a time**. Asynchronous
//! work never touches the store directly; its outcome re-enters the queue
//! as a fresh action, and stale outcomes are ignored by the transition's
//! preconditions.
//!
//! ## Architecture
//!
//! ```text
//! Transport shim (host's socket edge)      Scheduler (timers)
//!     │                                        │
//!     ▼ dispatch()                             ▼ dispatch()
//! Ingress queue ────► Pipeline task (owns the store's write side)
//!                         │
//!                         │ per action, then its follow-ups:
//!                         │
//!                         ├─► before:  Scope ► Presence ► Messaging ► …
//!                         ├─► transition::apply     (the only mutation)
//!                         └─► after:   … ► Assignment ► Loads ► Broadcast
//!                                            │
//!                                            └─► spawn_attempt()
//!                                                  room join + timeout,
//!                                                  outcome re-enters the
//!                                                  queue as an action
//! ```
//!
//! ## Key Invariants
//!
//! 1. **Single writer** - One task owns the store; interceptors and the
//!    transition run on it, serialized.
//! 2. **Actions are the closed input set** - Nothing mutates state except
//!    `transition::apply` on an [`Action`].
//! 3. **Cascades drain first** - Follow-ups of an action run before the
//!    next external action, so every cascade sees a consistent store.
//! 4. **Attempts are fenced** - Assignment and transfer outcomes apply
//!    only while the chat is still `Assigning`; anything later is stale
//!    and ignored.
//! 5. **At most one attempt in flight** - The sweep stops after offering
//!    one chat; the next sweep starts when that attempt resolves.
//! 6. **Patches are versioned** - Console state flows as minimal diffs
//!    with a `version`/`nextVersion` pair; a gap means resync via the
//!    full snapshot.
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use switchboard::{Action, ChatId, ChatSession, Engine, EngineConfig, Locale};
//!
//! // The host brings the socket layer: anything that can join rooms and
//! // emit events implements `Transport`.
//! let transport = Arc::new(MySocketAdapter::new());
//! let handle = Engine::start(EngineConfig::default(), transport);
//!
//! // Customer traffic flows in as actions...
//! handle.dispatch(Action::CustomerMessage {
//!     chat_id: ChatId::from("chat-1"),
//!     session: ChatSession {
//!         customer_id: "cust-77".into(),
//!         display_name: "Sam".into(),
//!         email: None,
//!         locale: Locale::from("en"),
//!         groups: vec![],
//!     },
//!     body: "hi, my order never arrived".into(),
//! })?;
//!
//! // ...and hosts read through the handle. Consoles follow the
//! // `state:patch` events the engine emits on the operators room.
//! let queued = handle.with_store(|store| store.chats.len()).await;
//! ```
//!
//! ## What This Is Not
//!
//! Switchboard is **not**:
//! - A socket server (the host owns connections and rooms)
//! - A persistence layer (state is in-memory; a restart starts empty)
//! - A ticketing system (closed chats are evicted, not archived)
//!
//! Switchboard **is**:
//! > The decision core: who waits, who answers, and what every console
//! > gets told about it.

// State and inputs
mod action;
mod chat;
mod chat_log;
mod config;
mod group;
mod operator;
mod store;
mod transition;

// Candidate selection and ranking
pub mod selectors;

// Pipeline machinery
mod pipeline;
mod scheduler;

// Interceptors, in chain order
mod scope;
mod presence;
mod messaging;
mod assignment;
mod loads;
mod broadcast;

// Host-facing surfaces
mod engine;
mod error;
mod remote;
mod transport;

// Testing utilities (feature-gated)
#[cfg(any(test, feature = "testing"))]
pub mod testing;



// Re-export the input set
pub use action::{Action, MissReason};

// Re-export chat state types
pub use chat::{Audience, Chat, ChatId, ChatMessage, ChatSession, ChatStatus, Locale, MessageAuthor};

// Re-export operator state types
pub use operator::{
    ConnectionId, LocaleMembership, MembershipSeed, Operator, OperatorId, OperatorProfile,
    OperatorRef, OperatorStatus,
};

// Re-export grouping types
pub use group::{Group, GroupId, GroupSeed, DEFAULT_GROUP};

// Re-export the store (read model)
pub use store::{LocaleSettings, Store};

// Re-export configuration
pub use config::EngineConfig;

// Re-export the transport contract
pub use transport::{events, RoomId, Transport};

// Re-export the remote-command gate
pub use remote::{RemoteError, RemoteRequest};

// Re-export error types
pub use error::EngineError;

// Re-export engine types (primary entry point)
pub use engine::{Engine, EngineHandle};

// Re-export commonly used external types
pub use async_trait::async_trait;
