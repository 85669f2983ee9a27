//! Node and client configuration.
//!
//! Both structs deserialize with every field optional; durations are given
//! in milliseconds.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("election_timeout_min ({min:?}) exceeds election_timeout_max ({max:?})")]
    ElectionTimeoutRange { min: Duration, max: Duration },

    #[error("heartbeat_interval ({heartbeat:?}) must be below election_timeout_min ({election_min:?})")]
    HeartbeatTooSlow { heartbeat: Duration, election_min: Duration },

    #[error("{0} must be non-zero")]
    Zero(&'static str),

    #[error("lease_ratio must be in (0, 1), got {0}")]
    LeaseRatio(f64),

    #[error("min_session_timeout ({min:?}) exceeds max_session_timeout ({max:?})")]
    SessionTimeoutRange { min: Duration, max: Duration },

    #[error("keep_alive_interval ({interval:?}) must be below session_timeout ({timeout:?})")]
    KeepAliveTooSlow { interval: Duration, timeout: Duration },
}

/// How LINEARIZABLE queries confirm leadership.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadMode {
    /// Record the commit index and wait for a majority heartbeat round.
    ReadIndex,
    /// Append a query marker and serve when it is applied.
    LogMarker,
}

// =============================================================================
// NODE
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Minimum election timeout (randomized between min and max).
    #[serde(with = "duration_ms")]
    pub election_timeout_min: Duration,
    #[serde(with = "duration_ms")]
    pub election_timeout_max: Duration,
    /// Heartbeat interval (must be << election timeout).
    #[serde(with = "duration_ms")]
    pub heartbeat_interval: Duration,
    pub max_entries_per_append: usize,
    /// How long a pending client request may wait before failing.
    #[serde(with = "duration_ms")]
    pub request_timeout: Duration,
    /// Requested session timeouts are clamped into this range.
    #[serde(with = "duration_ms")]
    pub min_session_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub max_session_timeout: Duration,
    /// Fraction of `election_timeout_min` a leader lease lasts.
    pub lease_ratio: f64,
    /// Applied entries beyond the snapshot before the next one. 0 disables.
    pub snapshot_threshold: u64,
    pub read_mode: ReadMode,
    /// Seed for election jitter. Random when absent.
    pub election_seed: Option<u64>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            election_timeout_min: Duration::from_millis(150),
            election_timeout_max: Duration::from_millis(300),
            heartbeat_interval: Duration::from_millis(50),
            max_entries_per_append: 64,
            request_timeout: Duration::from_millis(2_000),
            min_session_timeout: Duration::from_millis(200),
            max_session_timeout: Duration::from_secs(600),
            lease_ratio: 0.8,
            snapshot_threshold: 1_000,
            read_mode: ReadMode::ReadIndex,
            election_seed: None,
        }
    }
}

impl NodeConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.election_timeout_min > self.election_timeout_max {
            return Err(ConfigError::ElectionTimeoutRange {
                min: self.election_timeout_min,
                max: self.election_timeout_max,
            });
        }
        if self.heartbeat_interval >= self.election_timeout_min {
            return Err(ConfigError::HeartbeatTooSlow {
                heartbeat: self.heartbeat_interval,
                election_min: self.election_timeout_min,
            });
        }
        if self.heartbeat_interval.is_zero() {
            return Err(ConfigError::Zero("heartbeat_interval"));
        }
        if self.max_entries_per_append == 0 {
            return Err(ConfigError::Zero("max_entries_per_append"));
        }
        if !(self.lease_ratio > 0.0 && self.lease_ratio < 1.0) {
            return Err(ConfigError::LeaseRatio(self.lease_ratio));
        }
        if self.min_session_timeout > self.max_session_timeout {
            return Err(ConfigError::SessionTimeoutRange {
                min: self.min_session_timeout,
                max: self.max_session_timeout,
            });
        }
        Ok(())
    }

    /// Returns a randomized election timeout.
    pub fn random_election_timeout<R: Rng>(&self, rng: &mut R) -> Duration {
        let min = self.election_timeout_min.as_millis() as u64;
        let max = self.election_timeout_max.as_millis() as u64;
        Duration::from_millis(rng.gen_range(min..=max))
    }

    /// How long a majority-acknowledged heartbeat round keeps reads local.
    pub fn lease_duration(&self) -> Duration {
        self.election_timeout_min.mul_f64(self.lease_ratio)
    }

    pub fn clamp_session_timeout(&self, requested: Duration) -> Duration {
        requested.clamp(self.min_session_timeout, self.max_session_timeout)
    }
}

// =============================================================================
// CLIENT
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Per-attempt wait before the client tries another member.
    #[serde(with = "duration_ms")]
    pub request_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub keep_alive_interval: Duration,
    /// Requested session timeout; the cluster may clamp it.
    #[serde(with = "duration_ms")]
    pub session_timeout: Duration,
    pub max_attempts: u32,
    /// Backoff after a redirect is `base_backoff * 2^min(attempt, 5)`.
    #[serde(with = "duration_ms")]
    pub base_backoff: Duration,
    /// Send CAUSAL and SEQUENTIAL queries to any member instead of the leader.
    pub read_from_followers: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            request_timeout: Duration::from_millis(1_000),
            keep_alive_interval: Duration::from_millis(250),
            session_timeout: Duration::from_secs(5),
            max_attempts: 10,
            base_backoff: Duration::from_millis(10),
            read_from_followers: false,
        }
    }
}

impl ClientConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::Zero("max_attempts"));
        }
        if self.request_timeout.is_zero() {
            return Err(ConfigError::Zero("request_timeout"));
        }
        if self.keep_alive_interval >= self.session_timeout {
            return Err(ConfigError::KeepAliveTooSlow {
                interval: self.keep_alive_interval,
                timeout: self.session_timeout,
            });
        }
        Ok(())
    }

    pub fn backoff(&self, attempt: u32) -> Duration {
        self.base_backoff * 2u32.pow(attempt.min(5))
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
