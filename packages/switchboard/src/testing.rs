//! Test utilities.
//!
//! # RecordingTransport
//!
//! An in-memory [`Transport`] that records every emit and tracks room
//! membership in plain maps. Failure modes are switchable per test:
//!
//! ```ignore
//! let transport = RecordingTransport::new();
//! transport.set_fail_joins(true);       // join_room returns Err
//! transport.set_join_delay(Duration::from_secs(10)); // slower than the timeout
//! ```
//!
//! # Deterministic time
//!
//! Tests run under `#[tokio::test(start_paused = true)]`. [`advance`]
//! moves the clock and then yields a few times so timer tasks that woke
//! up get to run before the test continues asserting.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::operator::ConnectionId;
use crate::transport::{RoomId, Transport};

#[derive(Debug, Clone, PartialEq)]
pub struct EmitRecord {
    pub room: RoomId,
    pub event: String,
    pub payload: Value,
}

#[derive(Debug, Default)]
pub struct RecordingTransport {
    emits: Mutex<Vec<EmitRecord>>,
    rooms: Mutex<HashMap<RoomId, BTreeSet<ConnectionId>>>,
    fail_joins: AtomicBool,
    fail_members: AtomicBool,
    join_delay: Mutex<Option<Duration>>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `join_room` fail.
    pub fn set_fail_joins(&self, fail: bool) {
        self.fail_joins.store(fail, Ordering::SeqCst);
    }

    /// Delay every subsequent `join_room` by `delay` before it succeeds.
    pub fn set_join_delay(&self, delay: Option<Duration>) {
        *self.join_delay.lock().unwrap() = delay;
    }

    /// Make every subsequent `room_members` query fail.
    pub fn set_fail_members(&self, fail: bool) {
        self.fail_members.store(fail, Ordering::SeqCst);
    }

    /// Place connections in a room directly, bypassing `join_room`. Used
    /// to simulate a customer who is already (or back) in the room.
    pub fn seed_room(&self, room: RoomId, connections: &[ConnectionId]) {
        self.rooms
            .lock()
            .unwrap()
            .entry(room)
            .or_default()
            .extend(connections.iter().cloned());
    }

    pub fn emits(&self) -> Vec<EmitRecord> {
        self.emits.lock().unwrap().clone()
    }

    /// Payloads of every emit with the given event name, in order.
    pub fn emits_named(&self, event: &str) -> Vec<EmitRecord> {
        self.emits()
            .into_iter()
            .filter(|e| e.event == event)
            .collect()
    }

    pub fn clear_emits(&self) {
        self.emits.lock().unwrap().clear();
    }

    pub fn members(&self, room: &RoomId) -> Vec<ConnectionId> {
        self.rooms
            .lock()
            .unwrap()
            .get(room)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn in_room(&self, connection: &ConnectionId, room: &RoomId) -> bool {
        self.members(room).contains(connection)
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn join_room(&self, connections: &[ConnectionId], room: &RoomId) -> anyhow::Result<()> {
        let delay = *self.join_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_joins.load(Ordering::SeqCst) {
            anyhow::bail!("join refused by test transport");
        }
        self.rooms
            .lock()
            .unwrap()
            .entry(room.clone())
            .or_default()
            .extend(connections.iter().cloned());
        Ok(())
    }

    async fn leave_room(
        &self,
        connections: &[ConnectionId],
        room: &RoomId,
    ) -> anyhow::Result<()> {
        let mut rooms = self.rooms.lock().unwrap();
        if let Some(set) = rooms.get_mut(room) {
            for connection in connections {
                set.remove(connection);
            }
        }
        Ok(())
    }

    fn emit(&self, room: &RoomId, event: &str, payload: Value) {
        self.emits.lock().unwrap().push(EmitRecord {
            room: room.clone(),
            event: event.to_string(),
            payload,
        });
    }

    async fn room_members(&self, room: &RoomId) -> anyhow::Result<Vec<ConnectionId>> {
        if self.fail_members.load(Ordering::SeqCst) {
            anyhow::bail!("membership query refused by test transport");
        }
        Ok(self.members(room))
    }
}

/// Advance paused tokio time and let woken timer tasks run.
pub async fn advance(duration: Duration) {
    tokio::time::advance(duration).await;
    for _ in 0..8 {
        tokio::task::yield_now().await;
    }
}
