//! Dispatcher and bridge settings.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// What a synchronous decision dispatch does when a listener suspends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncSuspendPolicy {
    /// Block the calling thread until the walk resolves, up to `sync_timeout_ms`.
    Block,
    /// Treat the suspension as a programming error.
    Reject,
}

impl Default for SyncSuspendPolicy {
    fn default() -> Self {
        Self::Block
    }
}

fn default_sync_timeout_ms() -> u64 {
    50 // one tick at 20 ticks per second
}

fn default_slow_listener_threshold_ms() -> u64 {
    250
}

fn default_max_queued_retriggers() -> usize {
    8
}

/// Settings shared by the dispatcher and every continuation bridge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Behaviour when a synchronous decision dispatch suspends
    #[serde(default)]
    pub sync_suspend: SyncSuspendPolicy,
    /// Maximum time a synchronous decision dispatch may block, in milliseconds
    #[serde(default = "default_sync_timeout_ms")]
    pub sync_timeout_ms: u64,
    /// Listeners running longer than this are logged, in milliseconds
    #[serde(default = "default_slow_listener_threshold_ms")]
    pub slow_listener_threshold_ms: u64,
    /// Upper bound on retriggers queued behind one pending subject
    #[serde(default = "default_max_queued_retriggers")]
    pub max_queued_retriggers: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            sync_suspend: SyncSuspendPolicy::default(),
            sync_timeout_ms: default_sync_timeout_ms(),
            slow_listener_threshold_ms: default_slow_listener_threshold_ms(),
            max_queued_retriggers: default_max_queued_retriggers(),
        }
    }
}

impl BridgeConfig {
    pub fn sync_timeout(&self) -> Duration {
        Duration::from_millis(self.sync_timeout_ms)
    }

    pub fn slow_listener_threshold(&self) -> Duration {
        Duration::from_millis(self.slow_listener_threshold_ms)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.sync_suspend == SyncSuspendPolicy::Block && self.sync_timeout_ms == 0 {
            return Err("bridge.sync_timeout_ms must be greater than 0 when sync_suspend = \"block\"".to_string());
        }
        if self.slow_listener_threshold_ms == 0 {
            return Err("bridge.slow_listener_threshold_ms must be greater than 0".to_string());
        }
        Ok(())
    }
}
