//! Keystone configuration
//!
//! All tunable parameters in one place. Loaded from TOML at startup,
//! falls back to defaults if no config file exists.

use crate::event::Topic;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KeystoneConfig {
    /// Persisted state location.
    pub store: StoreConfig,
    /// Event bus delivery policy.
    pub bus: BusConfig,
    /// Build scheduling, retry and rollback.
    pub orchestrator: OrchestratorConfig,
    /// Fact signing and expiry.
    pub certifier: CertifierConfig,
    /// Guardrail evaluation and safety limits.
    pub autonomy: AutonomyConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub data_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Events retained per topic for replay.
    pub replay_window: usize,
    /// Handler timeout for topics without an override.
    pub default_timeout_ms: u64,
    /// Redeliveries of an advisory event before it is dead-lettered.
    pub advisory_max_retries: u32,
    /// Base backoff between advisory redeliveries.
    pub advisory_backoff_ms: u64,
    /// Dead letters kept for inspection.
    pub dead_letter_capacity: usize,
    /// Per-topic overrides keyed by topic name (e.g. `fault`).
    pub topics: BTreeMap<String, TopicConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TopicConfig {
    /// Critical topics surface delivery failures to the publisher.
    pub critical: bool,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Retries after the first failed attempt.
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub max_concurrent_builds: usize,
    /// Wall-clock budget from failure detection to snapshot swap.
    pub rollback_budget_ms: u64,
    pub build_timeout_ms: u64,
    /// How long a succeeded build may wait for its fact before it counts as failed.
    pub certification_timeout_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CertifierConfig {
    /// Base64 HMAC key. Falls back to `KEYSTONE_SIGNING_KEY`, then a generated key file.
    pub signing_key: Option<String>,
    /// When set, facts carry `expires_at = issued_at + ttl`.
    pub fact_ttl_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutonomyConfig {
    /// Recent facts kept per node for condition evaluation.
    pub fact_window: usize,
    pub max_actions_per_hour: usize,
    /// Minimum gap between two non-escalate actions on the same node.
    pub cooldown_secs: u64,
    /// Consecutive rejected facts on a node after which only escalation is allowed.
    pub fail_streak_trip: u32,
}

// ============================================================
// Defaults
// ============================================================

impl Default for StoreConfig {
    fn default() -> Self {
        let data_dir = dirs::home_dir()
            .map(|h| h.join(".keystone"))
            .unwrap_or_else(|| PathBuf::from(".keystone"));
        Self { data_dir }
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            replay_window: 1024,
            default_timeout_ms: 2_000,
            advisory_max_retries: 3,
            advisory_backoff_ms: 50,
            dead_letter_capacity: 256,
            topics: BTreeMap::new(),
        }
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            backoff_base_ms: 100,
            backoff_max_ms: 5_000,
            max_concurrent_builds: 8,
            rollback_budget_ms: 1_200,
            build_timeout_ms: 60_000,
            certification_timeout_ms: 30_000,
        }
    }
}

impl Default for AutonomyConfig {
    fn default() -> Self {
        Self {
            fact_window: 16,
            max_actions_per_hour: 60,
            cooldown_secs: 0,
            fail_streak_trip: 5,
        }
    }
}

// ============================================================
// Loading
// ============================================================

impl KeystoneConfig {
    /// Load config from a TOML file, falling back to defaults.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => {
                    tracing::info!("Loaded config from {}", path.display());
                    config
                }
                Err(e) => {
                    tracing::warn!("Failed to parse {}: {} — using defaults", path.display(), e);
                    Self::default()
                }
            },
            Err(_) => {
                tracing::info!("No config at {} — using defaults", path.display());
                Self::default()
            }
        }
    }

    /// Write the current config as TOML (for generating a default config file).
    pub fn to_toml(&self) -> String {
        toml::to_string_pretty(self).unwrap_or_default()
    }
}

impl BusConfig {
    /// Effective delivery settings for a topic.
    pub fn topic(&self, topic: Topic) -> TopicConfig {
        if let Some(over) = self.topics.get(topic.as_str()) {
            return TopicConfig {
                critical: over.critical,
                timeout_ms: Some(over.timeout_ms.unwrap_or(self.default_timeout_ms)),
            };
        }
        TopicConfig {
            critical: !matches!(topic, Topic::Fault),
            timeout_ms: Some(self.default_timeout_ms),
        }
    }
}

impl OrchestratorConfig {
    /// Exponential backoff before retry number `attempt` (1-based), capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        Duration::from_millis(
            self.backoff_base_ms
                .saturating_mul(factor)
                .min(self.backoff_max_ms),
        )
    }

    pub fn rollback_budget(&self) -> Duration {
        Duration::from_millis(self.rollback_budget_ms)
    }

    pub fn build_timeout(&self) -> Duration {
        Duration::from_millis(self.build_timeout_ms)
    }

    pub fn certification_timeout(&self) -> Duration {
        Duration::from_millis(self.certification_timeout_ms)
    }
}
