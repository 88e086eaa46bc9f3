//! Configuration management for the hook host.
//!
//! Settings are loaded from a TOML file. A missing file is replaced with the
//! defaults so a fresh checkout runs without any setup.

use hook_bridge::BridgeConfig;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::info;

fn default_tick_interval() -> u64 {
    50 // 20 ticks per second
}

fn default_worker_threads() -> usize {
    num_cpus::get()
}

fn default_stats_interval_secs() -> u64 {
    10
}

fn default_shutdown_grace_ms() -> u64 {
    1_000
}

fn default_subjects() -> usize {
    4
}

fn default_inventory_size() -> usize {
    9
}

fn default_permission_latency_ms() -> u64 {
    120
}

fn default_move_cooldown_ms() -> u64 {
    200
}

fn default_locked_slots() -> Vec<usize> {
    vec![8]
}

fn default_banned_names() -> Vec<String> {
    vec!["griefer".to_string()]
}

fn default_armor_percent() -> u32 {
    25
}

fn default_disconnect_every_ticks() -> u64 {
    60
}

/// Application configuration loaded from TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Engine loop and worker pool settings
    #[serde(default)]
    pub engine: EngineSettings,
    /// Dispatcher and continuation bridge settings
    #[serde(default)]
    pub bridge: BridgeConfig,
    /// Logging configuration settings
    #[serde(default)]
    pub logging: LoggingSettings,
    /// Simulated activity driven through the adapters
    #[serde(default)]
    pub harness: HarnessSettings,
}

/// Engine thread and secondary scheduler settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSettings {
    /// Engine tick interval in milliseconds
    #[serde(default = "default_tick_interval")]
    pub tick_interval_ms: u64,
    /// Worker threads for async listeners
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,
    /// Stop after this many ticks (0 runs until a shutdown signal)
    #[serde(default)]
    pub max_ticks: u64,
    /// Seconds between periodic statistics reports
    #[serde(default = "default_stats_interval_secs")]
    pub stats_interval_secs: u64,
    /// How long the engine keeps draining continuations after shutdown starts
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval(),
            worker_threads: default_worker_threads(),
            max_ticks: 0,
            stats_interval_secs: default_stats_interval_secs(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
        }
    }
}

/// Logging system configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Log level filter (trace, debug, info, warn, error)
    pub level: String,
    /// Whether to output logs in JSON format
    pub json_format: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
        }
    }
}

/// The scripted players and the listeners' knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarnessSettings {
    /// Number of simulated players
    #[serde(default = "default_subjects")]
    pub subjects: usize,
    /// Inventory slots per player
    #[serde(default = "default_inventory_size")]
    pub inventory_size: usize,
    /// Simulated latency of the permission and whitelist lookups
    #[serde(default = "default_permission_latency_ms")]
    pub permission_latency_ms: u64,
    /// Minimum time between two item moves by the same player
    #[serde(default = "default_move_cooldown_ms")]
    pub move_cooldown_ms: u64,
    /// Slots nobody may move items into
    #[serde(default = "default_locked_slots")]
    pub locked_slots: Vec<usize>,
    /// Player names refused at handshake
    #[serde(default = "default_banned_names")]
    pub banned_names: Vec<String>,
    /// Percentage of incoming damage absorbed by armor
    #[serde(default = "default_armor_percent")]
    pub armor_percent: u32,
    /// Disconnect a player every N ticks (0 disables)
    #[serde(default = "default_disconnect_every_ticks")]
    pub disconnect_every_ticks: u64,
}

impl Default for HarnessSettings {
    fn default() -> Self {
        Self {
            subjects: default_subjects(),
            inventory_size: default_inventory_size(),
            permission_latency_ms: default_permission_latency_ms(),
            move_cooldown_ms: default_move_cooldown_ms(),
            locked_slots: default_locked_slots(),
            banned_names: default_banned_names(),
            armor_percent: default_armor_percent(),
            disconnect_every_ticks: default_disconnect_every_ticks(),
        }
    }
}

impl AppConfig {
    /// Loads configuration from a TOML file.
    ///
    /// If the file doesn't exist, writes the default configuration to it and
    /// returns the defaults.
    pub async fn load_from_file(path: &PathBuf) -> Result<Self, Box<dyn std::error::Error>> {
        if path.exists() {
            let content = tokio::fs::read_to_string(path).await?;
            let config: AppConfig = toml::from_str(&content)?;
            Ok(config)
        } else {
            let default_config = AppConfig::default();
            let toml_content = toml::to_string_pretty(&default_config)?;
            tokio::fs::write(path, toml_content).await?;
            info!("Created default configuration file: {}", path.display());
            Ok(default_config)
        }
    }

    /// Validates the configuration settings.
    pub fn validate(&self) -> Result<(), String> {
        if self.engine.tick_interval_ms == 0 {
            return Err("engine.tick_interval_ms must be greater than 0".to_string());
        }
        if self.engine.worker_threads == 0 {
            return Err("engine.worker_threads must be greater than 0".to_string());
        }

        self.bridge.validate()?;

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(format!(
                "Invalid log level: {}. Must be one of: {valid_levels:?}",
                &self.logging.level
            ));
        }

        if self.harness.subjects == 0 {
            return Err("harness.subjects must be greater than 0".to_string());
        }
        if self.harness.inventory_size < 2 {
            return Err("harness.inventory_size must be at least 2".to_string());
        }
        if let Some(slot) = self
            .harness
            .locked_slots
            .iter()
            .find(|slot| **slot >= self.harness.inventory_size)
        {
            return Err(format!(
                "harness.locked_slots contains {slot}, outside an inventory of {} slots",
                self.harness.inventory_size
            ));
        }
        if self.harness.armor_percent > 100 {
            return Err("harness.armor_percent must be between 0 and 100".to_string());
        }

        Ok(())
    }
}
