use serde::{Deserialize, Serialize};

/// Configuration for repository index tracking
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoIndexConfig {
    /// Interval between status polls while a remote index builds, in milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Maximum number of polls before giving up on a build
    #[serde(default = "default_poll_attempt_cap")]
    pub poll_attempt_cap: u32,

    /// Interval between diff refreshes, in milliseconds
    #[serde(default = "default_diff_refresh_interval_ms")]
    pub diff_refresh_interval_ms: u64,

    /// Capacity of the event broadcast channel
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

fn default_poll_interval_ms() -> u64 {
    3_000
}

fn default_poll_attempt_cap() -> u32 {
    120
}

fn default_diff_refresh_interval_ms() -> u64 {
    120_000
}

fn default_event_capacity() -> usize {
    64
}

impl Default for RepoIndexConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            poll_attempt_cap: default_poll_attempt_cap(),
            diff_refresh_interval_ms: default_diff_refresh_interval_ms(),
            event_capacity: default_event_capacity(),
        }
    }
}

impl RepoIndexConfig {
    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.poll_interval_ms == 0 {
            return Err("poll_interval_ms must be > 0".to_string());
        }

        if self.poll_attempt_cap == 0 {
            return Err("poll_attempt_cap must be > 0".to_string());
        }

        if self.diff_refresh_interval_ms == 0 {
            return Err("diff_refresh_interval_ms must be > 0".to_string());
        }

        if self.event_capacity == 0 {
            return Err("event_capacity must be > 0".to_string());
        }

        Ok(())
    }
}
