//! Operator identities: availability status, per-locale capacity, live
//! connections, and the pull flag used to request work explicitly.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::chat::Locale;
use crate::group::GroupId;

/// Identifier for a human operator. Minted by the authentication shim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperatorId(String);

impl OperatorId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OperatorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for OperatorId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Identifier for one live transport connection (one tab, one socket).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(String);

impl ConnectionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConnectionId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Operator availability tier. `Reserve` operators are backup capacity:
/// they rank below available operators and carry sticky-assignment
/// behavior so idle reserves stay dormant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OperatorStatus {
    Available,
    Reserve,
    Unavailable,
}

impl OperatorStatus {
    /// Whether this status can receive assignments at all.
    pub fn is_assignable(&self) -> bool {
        matches!(self, OperatorStatus::Available | OperatorStatus::Reserve)
    }
}

impl fmt::Display for OperatorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OperatorStatus::Available => "available",
            OperatorStatus::Reserve => "reserve",
            OperatorStatus::Unavailable => "unavailable",
        };
        f.write_str(s)
    }
}

/// Per-locale capacity record. `load` is derived, never authoritative:
/// it is recomputed from the open chat set and overwritten wholesale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocaleMembership {
    pub capacity: u32,
    pub load: u32,
    pub active: bool,
}

impl LocaleMembership {
    pub fn new(capacity: u32) -> Self {
        Self {
            capacity,
            load: 0,
            active: true,
        }
    }

    /// Remaining slots in this locale, saturating at zero.
    pub fn total_available(&self) -> u32 {
        self.capacity.saturating_sub(self.load)
    }

    /// Fraction of capacity still free. Zero-capacity memberships report
    /// 0.0 rather than dividing by zero (they can still be picked via the
    /// pull flag).
    pub fn percent_available(&self) -> f64 {
        if self.capacity == 0 {
            0.0
        } else {
            f64::from(self.total_available()) / f64::from(self.capacity)
        }
    }
}

/// Minimal operator identity carried inside chat records and messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperatorRef {
    pub id: OperatorId,
    pub name: String,
}

/// Identity payload delivered when an operator connection is established:
/// who they are, which locales they serve, which groups they belong to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperatorProfile {
    pub id: OperatorId,
    pub name: String,
    /// Locale -> configured capacity and active flag. Loads are always
    /// derived engine-side regardless of what the shim sends.
    pub memberships: BTreeMap<Locale, MembershipSeed>,
    /// Group ids this operator serves. Unknown ids are dropped with a
    /// warning; the default group is always added.
    #[serde(default)]
    pub groups: Vec<GroupId>,
}

/// Capacity settings for one locale inside an [`OperatorProfile`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MembershipSeed {
    pub capacity: u32,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

/// One operator as tracked by the store.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Operator {
    pub id: OperatorId,
    pub name: String,
    /// True while at least one connection is live.
    pub online: bool,
    pub status: OperatorStatus,
    /// Pull flag: the operator explicitly asked for the next chat. Ranks
    /// above every balancing rule and is cleared when the operator goes
    /// fully offline.
    pub requesting_chat: bool,
    /// Live connection ids; room joins target these.
    #[serde(skip)]
    pub connections: BTreeSet<ConnectionId>,
    pub memberships: BTreeMap<Locale, LocaleMembership>,
    /// Registration tiebreaker: ranking ties fall back to first-seen order.
    #[serde(skip)]
    pub seq: u64,
}

impl Operator {
    pub fn from_profile(profile: &OperatorProfile, seq: u64) -> Self {
        let memberships = profile
            .memberships
            .iter()
            .map(|(locale, seed)| {
                (
                    locale.clone(),
                    LocaleMembership {
                        capacity: seed.capacity,
                        load: 0,
                        active: seed.active,
                    },
                )
            })
            .collect();
        Self {
            id: profile.id.clone(),
            name: profile.name.clone(),
            online: false,
            status: OperatorStatus::Available,
            requesting_chat: false,
            connections: BTreeSet::new(),
            memberships,
            seq,
        }
    }

    pub fn to_ref(&self) -> OperatorRef {
        OperatorRef {
            id: self.id.clone(),
            name: self.name.clone(),
        }
    }

    pub fn membership(&self, locale: &Locale) -> Option<&LocaleMembership> {
        self.memberships.get(locale)
    }

    /// Current load in one locale; absent membership counts as zero.
    pub fn load(&self, locale: &Locale) -> u32 {
        self.membership(locale).map(|m| m.load).unwrap_or(0)
    }

    pub fn connection_list(&self) -> Vec<ConnectionId> {
        self.connections.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn membership(capacity: u32, load: u32) -> LocaleMembership {
        LocaleMembership {
            capacity,
            load,
            active: true,
        }
    }

    #[test]
    fn test_percent_available() {
        assert_eq!(membership(4, 1).percent_available(), 0.75);
        assert_eq!(membership(4, 4).percent_available(), 0.0);
        // Over-capacity load saturates instead of going negative.
        assert_eq!(membership(2, 3).total_available(), 0);
        // Zero capacity never divides by zero.
        assert_eq!(membership(0, 0).percent_available(), 0.0);
    }

    #[test]
    fn test_from_profile_resets_load() {
        let mut memberships = BTreeMap::new();
        memberships.insert(
            Locale::from("en"),
            MembershipSeed {
                capacity: 3,
                active: true,
            },
        );
        let profile = OperatorProfile {
            id: OperatorId::from("op-1"),
            name: "Ripley".into(),
            memberships,
            groups: vec![],
        };

        let op = Operator::from_profile(&profile, 0);
        assert!(!op.online);
        assert_eq!(op.status, OperatorStatus::Available);
        assert_eq!(op.load(&Locale::from("en")), 0);
        assert_eq!(op.load(&Locale::from("fr")), 0);
    }

    #[test]
    fn test_operator_serializes_without_connections() {
        let op = Operator::from_profile(
            &OperatorProfile {
                id: OperatorId::from("op-1"),
                name: "Ripley".into(),
                memberships: BTreeMap::new(),
                groups: vec![],
            },
            3,
        );
        let v = serde_json::to_value(&op).unwrap();
        assert!(v.get("connections").is_none());
        assert!(v.get("seq").is_none());
        assert_eq!(v["requestingChat"], serde_json::json!(false));
    }
}
