//! Operator groups. Groups narrow or partition the operator pool: chats
//! tagged with an exclusive group may only be served by its members, while
//! the reserved default group catches everything untagged.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::operator::OperatorId;

/// Name of the reserved group every chat and operator implicitly belongs
/// to. It always exists and cannot be deleted.
pub const DEFAULT_GROUP: &str = "default";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupId(String);

impl GroupId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn default_group() -> Self {
        Self(DEFAULT_GROUP.to_string())
    }

    pub fn is_default(&self) -> bool {
        self.0 == DEFAULT_GROUP
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for GroupId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// A named subset of the operator pool.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Group {
    pub id: GroupId,
    pub name: String,
    /// Exclusive groups restrict eligibility: a chat tagged with one is
    /// served only by its members, overriding the default group.
    pub exclusive: bool,
    pub members: BTreeSet<OperatorId>,
}

impl Group {
    pub fn new(id: GroupId, name: impl Into<String>, exclusive: bool) -> Self {
        Self {
            id,
            name: name.into(),
            exclusive,
            members: BTreeSet::new(),
        }
    }

    /// The reserved catch-all group.
    pub fn default_group() -> Self {
        Self::new(GroupId::default_group(), "Default", false)
    }
}

/// Group settings supplied through engine configuration. Memberships are
/// filled in as operators come online.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupSeed {
    pub id: GroupId,
    pub name: String,
    #[serde(default)]
    pub exclusive: bool,
}
