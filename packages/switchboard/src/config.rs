//! Engine configuration. Plain data with sensible defaults; host
//! applications embed it in their own config layer.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::chat::Locale;
use crate::group::GroupSeed;

/// Tunables for one engine instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    /// Bound on room-join confirmation for assignment and transfer
    /// attempts; expiry resolves the attempt to its failure branch.
    #[serde(with = "duration_millis")]
    pub join_timeout: Duration,
    /// Delay before the "customer left" notice after a customer
    /// disconnect.
    #[serde(with = "duration_millis")]
    pub customer_left_delay: Duration,
    /// Delay before a disconnected customer's chat autocloses.
    #[serde(with = "duration_millis")]
    pub autoclose_delay: Duration,
    /// Messages retained per chat and audience in the history ring.
    pub log_capacity: usize,
    pub default_locale: Locale,
    /// Supported locales; the default locale is always included.
    pub supported_locales: Vec<Locale>,
    /// Groups available for tagging chats; the default group is always
    /// added.
    pub groups: Vec<GroupSeed>,
    /// Whether the engine starts out accepting new customers.
    pub accept_customers: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            join_timeout: Duration::from_secs(1),
            customer_left_delay: Duration::from_secs(45),
            autoclose_delay: Duration::from_secs(180),
            log_capacity: 50,
            default_locale: Locale::from("en"),
            supported_locales: vec![Locale::from("en")],
            groups: Vec::new(),
            accept_customers: true,
        }
    }
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
