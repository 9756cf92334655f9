//! Short-term message history, kept so a reconnecting party or a newly
//! joining operator can be backfilled without a database round trip.
//!
//! Each chat carries two bounded rings, one per audience, because some
//! synthesized notices (misses, transfers) are operator-facing and must
//! not leak into the customer's backfill. Rings are evicted when a chat
//! closes or is removed.

use std::collections::{HashMap, VecDeque};

use crate::chat::{Audience, ChatId, ChatMessage};

#[derive(Debug, Default)]
struct ChatRings {
    customer: VecDeque<ChatMessage>,
    operator: VecDeque<ChatMessage>,
}

#[derive(Debug)]
pub struct ChatLog {
    capacity: usize,
    rings: HashMap<ChatId, ChatRings>,
}

impl ChatLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            rings: HashMap::new(),
        }
    }

    /// Record a message for one audience, dropping the oldest entry once
    /// the ring is full. Zero capacity disables history entirely.
    pub fn push(&mut self, audience: Audience, message: ChatMessage) {
        if self.capacity == 0 {
            return;
        }
        let rings = self.rings.entry(message.chat_id.clone()).or_default();
        let ring = match audience {
            Audience::Customer => &mut rings.customer,
            Audience::Operator => &mut rings.operator,
        };
        if ring.len() >= self.capacity {
            ring.pop_front();
        }
        ring.push_back(message);
    }

    /// Record a message visible to both sides.
    pub fn push_shared(&mut self, message: ChatMessage) {
        self.push(Audience::Customer, message.clone());
        self.push(Audience::Operator, message);
    }

    /// The backfill for one audience, oldest first.
    pub fn history(&self, chat_id: &ChatId, audience: Audience) -> Vec<ChatMessage> {
        self.rings
            .get(chat_id)
            .map(|rings| {
                let ring = match audience {
                    Audience::Customer => &rings.customer,
                    Audience::Operator => &rings.operator,
                };
                ring.iter().cloned().collect()
            })
            .unwrap_or_default()
    }

    pub fn evict(&mut self, chat_id: &ChatId) {
        self.rings.remove(chat_id);
    }

    #[cfg(test)]
    fn len(&self, chat_id: &ChatId, audience: Audience) -> usize {
        self.history(chat_id, audience).len()
    }
}
