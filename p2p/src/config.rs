use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::envelope::MAX_TEXT_CHARS;
use crate::fanout::HISTORY_CAPACITY;

/// Tunables for a mesh session. Durations are whole seconds on the wire.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    pub history_capacity: usize,
    pub max_text_chars: usize,
    pub startup_timeout_secs: u64,
    pub keepalive_interval_secs: u64,
    pub discovery_interval_secs: u64,
    pub roster_gossip_interval_secs: u64,
    pub reconnect_delay_secs: u64,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            history_capacity: HISTORY_CAPACITY,
            max_text_chars: MAX_TEXT_CHARS,
            startup_timeout_secs: 12,
            keepalive_interval_secs: 30,
            discovery_interval_secs: 15,
            roster_gossip_interval_secs: 20,
            reconnect_delay_secs: 2,
        }
    }
}

impl MeshConfig {
    /// Defaults overridden by `MESH_*` environment variables. Unparseable
    /// values are ignored with a warning.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        let read = |key: &str, slot: &mut u64| {
            if let Some(raw) = lookup(key) {
                match raw.trim().parse() {
                    Ok(value) => *slot = value,
                    Err(_) => tracing::warn!(%key, value = %raw, "ignoring invalid mesh setting"),
                }
            }
        };

        let mut capacity = config.history_capacity as u64;
        let mut max_text = config.max_text_chars as u64;
        read("MESH_HISTORY_CAPACITY", &mut capacity);
        read("MESH_MAX_TEXT_CHARS", &mut max_text);
        read("MESH_STARTUP_TIMEOUT_SECS", &mut config.startup_timeout_secs);
        read("MESH_KEEPALIVE_SECS", &mut config.keepalive_interval_secs);
        read("MESH_DISCOVERY_SECS", &mut config.discovery_interval_secs);
        read("MESH_ROSTER_GOSSIP_SECS", &mut config.roster_gossip_interval_secs);
        read("MESH_RECONNECT_DELAY_SECS", &mut config.reconnect_delay_secs);
        config.history_capacity = capacity.max(1) as usize;
        config.max_text_chars = (max_text as usize).clamp(1, MAX_TEXT_CHARS);
        config
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    pub fn keepalive_interval(&self) -> Duration {
        secs_at_least_one(self.keepalive_interval_secs)
    }

    pub fn discovery_interval(&self) -> Duration {
        secs_at_least_one(self.discovery_interval_secs)
    }

    pub fn roster_gossip_interval(&self) -> Duration {
        secs_at_least_one(self.roster_gossip_interval_secs)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }
}

// tokio intervals panic on a zero period.
fn secs_at_least_one(secs: u64) -> Duration {
    Duration::from_secs(secs.max(1))
}
