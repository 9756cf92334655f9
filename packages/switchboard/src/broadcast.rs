//! Versioned state broadcast.
//!
//! Runs last, so it always observes the fully settled store for one
//! action. Operator consoles mirror a filtered snapshot (open chats,
//! operators, the accepting flag); each change goes out as a merge
//! patch with a version pair so a console can detect gaps and request
//! the full state again. A value of `null` in a patch deletes the key.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing::warn;

use crate::action::Action;
use crate::chat::ChatStatus;
use crate::pipeline::{InterceptCtx, Interceptor};
use crate::store::Store;
use crate::transport::{events, RoomId, Transport};

pub struct BroadcastInterceptor {
    transport: Arc<dyn Transport>,
    version: u64,
    last: Option<Value>,
}

impl BroadcastInterceptor {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            version: 0,
            last: None,
        }
    }

    fn snapshot(store: &Store) -> Value {
        let mut chats = Map::new();
        for (id, chat) in &store.chats {
            if chat.status == ChatStatus::Closed {
                continue;
            }
            chats.insert(id.to_string(), to_value_or_null(chat));
        }
        let mut operators = Map::new();
        for (id, op) in &store.operators {
            operators.insert(id.to_string(), to_value_or_null(op));
        }
        json!({
            "chats": chats,
            "operators": operators,
            "acceptsCustomers": store.accepts_customers,
        })
    }
}

fn to_value_or_null(value: &impl Serialize) -> Value {
    serde_json::to_value(value).unwrap_or_else(|error| {
        warn!(%error, "snapshot serialization failed");
        Value::Null
    })
}

/// Minimal merge patch turning `old` into `new`: changed and added keys
/// carry their new value (recursing into objects), removed keys carry
/// null. Anything that is not an object on both sides is replaced
/// wholesale.
fn diff(old: &Value, new: &Value) -> Value {
    match (old, new) {
        (Value::Object(old_map), Value::Object(new_map)) => {
            let mut patch = Map::new();
            for (key, new_value) in new_map {
                match old_map.get(key) {
                    Some(old_value) if old_value == new_value => {}
                    Some(old_value) => {
                        patch.insert(key.clone(), diff(old_value, new_value));
                    }
                    None => {
                        patch.insert(key.clone(), new_value.clone());
                    }
                }
            }
            for key in old_map.keys() {
                if !new_map.contains_key(key) {
                    patch.insert(key.clone(), Value::Null);
                }
            }
            Value::Object(patch)
        }
        _ => new.clone(),
    }
}

#[async_trait]
impl Interceptor for BroadcastInterceptor {
    fn name(&self) -> &'static str {
        "broadcast"
    }

    async fn after(
        &mut self,
        prev: &Store,
        store: &Store,
        action: &Action,
        changed: bool,
        _ctx: &mut InterceptCtx,
    ) {
        if changed {
            let next = Self::snapshot(store);
            let base = self
                .last
                .take()
                .unwrap_or_else(|| Self::snapshot(prev));
            if next != base {
                let patch = diff(&base, &next);
                let version = self.version;
                self.version += 1;
                self.transport.emit(
                    &RoomId::operators(),
                    events::STATE_PATCH,
                    json!({
                        "version": version,
                        "nextVersion": self.version,
                        "patch": patch,
                    }),
                );
            }
            self.last = Some(next);
        }

        // A console that just connected starts from the full state; any
        // patch for this same action has already gone out above.
        if let Action::OperatorReady { connection, .. } = action {
            let full = match &self.last {
                Some(value) => value.clone(),
                None => Self::snapshot(store),
            };
            self.transport.emit(
                &RoomId::connection(connection),
                events::STATE_FULL,
                json!({
                    "version": self.version,
                    "fullState": full,
                }),
            );
        }
    }
}
