//! Application lifecycle: startup, the engine tick loop and shutdown.
//!
//! The thread that builds the [`Application`] becomes the engine thread. It
//! runs the tick loop, answers every interception point and drains the
//! engine queue once per tick. Async listeners run on a separate
//! multi-threaded tokio runtime owned by the application.

use crate::adapters::EngineHooks;
use crate::cli::CliArgs;
use crate::config::AppConfig;
use crate::listeners::register_listeners;
use crate::logging::display_banner;
use crate::scenario::Scenario;
use crate::signals::cancel_on_signal;
use crate::world::World;
use hook_bridge::{engine_channel, BridgeStatsSnapshot, Dispatcher, EngineQueue, LifetimeToken, RegistryBuilder};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Summary of one run, logged as JSON on shutdown.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub ticks: u64,
    pub players_online: usize,
    pub entities: usize,
    pub world_mutations: u64,
    pub bridge: BridgeStatsSnapshot,
}

/// The hook host application.
pub struct Application {
    config: AppConfig,
    runtime: tokio::runtime::Runtime,
    root: LifetimeToken,
    queue: EngineQueue,
    hooks: EngineHooks,
    scenario: Scenario,
}

impl Application {
    /// Applies CLI overrides, validates the result and wires the bridge.
    ///
    /// The calling thread becomes the engine thread; [`run`](Self::run) must
    /// be called on it.
    pub fn new(args: CliArgs, mut config: AppConfig) -> Result<Self, Box<dyn std::error::Error>> {
        if let Some(log_level) = args.log_level {
            config.logging.level = log_level;
        }
        if args.json_logs {
            config.logging.json_format = true;
        }
        if let Some(ticks) = args.ticks {
            config.engine.max_ticks = ticks;
        }

        if let Err(e) = config.validate() {
            return Err(format!("Configuration validation failed: {e}").into());
        } else {
            info!("✅ Configuration loaded and validated successfully");
        }

        display_banner();

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(config.engine.worker_threads)
            .thread_name("hook-worker")
            .enable_all()
            .build()?;

        let (engine, queue) = engine_channel();
        let world = World::new();
        let root = LifetimeToken::new();

        let mut builder = RegistryBuilder::new();
        let cooldown = register_listeners(&mut builder, &config.harness, &world, &engine);
        let dispatcher = Arc::new(Dispatcher::new(
            builder.build(),
            runtime.handle().clone(),
            config.bridge.clone(),
        ));

        let hooks = EngineHooks::new(
            world,
            root.clone(),
            dispatcher,
            engine,
            cooldown,
            config.harness.inventory_size,
        );
        let scenario = Scenario::new(config.harness.clone());

        Ok(Self {
            config,
            runtime,
            root,
            queue,
            hooks,
            scenario,
        })
    }

    /// Cancelling this token stops the tick loop and starts shutdown.
    pub fn shutdown_token(&self) -> LifetimeToken {
        self.root.clone()
    }

    /// Runs the tick loop until a shutdown signal or the tick limit, then
    /// drains outstanding continuations and stops the runtime.
    pub fn run(mut self) -> Result<RunReport, Box<dyn std::error::Error>> {
        info!("🌟 Starting hook host");
        self.log_configuration_summary();

        cancel_on_signal(self.runtime.handle(), self.root.clone());

        let tick_interval = Duration::from_millis(self.config.engine.tick_interval_ms);
        let stats_interval = Duration::from_secs(self.config.engine.stats_interval_secs.max(1));
        let max_ticks = self.config.engine.max_ticks;

        info!("✅ Hook host is now running");
        info!("🛑 Press Ctrl+C to gracefully shutdown");

        let mut tick = 0u64;
        let mut last_report = Instant::now();
        let mut last_dispatched = 0u64;
        while !self.root.is_cancelled() {
            let started = Instant::now();

            self.scenario.step(&self.hooks, tick);
            self.queue.run_pending();
            tick += 1;

            if max_ticks > 0 && tick >= max_ticks {
                info!("🏁 Reached the configured limit of {} ticks", max_ticks);
                break;
            }

            if last_report.elapsed() >= stats_interval {
                let stats = self.hooks.dispatcher().stats().snapshot();
                info!(
                    "📊 Bridge Health - {} dispatches this period | {} suspended | {} replayed | {} dropped | {} outstanding | {} players",
                    stats.dispatched - last_dispatched,
                    stats.suspended,
                    stats.continuations_replayed,
                    stats.continuations_dropped,
                    stats.outstanding_continuations(),
                    self.hooks.world().player_count()
                );
                last_dispatched = stats.dispatched;
                last_report = Instant::now();
            }

            if let Some(rest) = tick_interval.checked_sub(started.elapsed()) {
                std::thread::sleep(rest);
            }
        }

        info!("🛑 Shutting down after {} ticks...", tick);
        self.root.cancel();
        self.drain_continuations();

        let report = RunReport {
            ticks: tick,
            players_online: self.hooks.world().player_count(),
            entities: self.hooks.world().entity_count(),
            world_mutations: self.hooks.world().mutations(),
            bridge: self.hooks.dispatcher().stats().snapshot(),
        };
        log_final_statistics(&report)?;

        self.runtime.shutdown_timeout(Duration::from_secs(1));
        info!("✅ Hook host shutdown complete");
        Ok(report)
    }

    /// Keeps draining the engine queue until every continuation has been
    /// consumed or the grace period runs out.
    fn drain_continuations(&mut self) {
        info!("⏳ Draining outstanding continuations...");
        let deadline = Instant::now() + Duration::from_millis(self.config.engine.shutdown_grace_ms);
        loop {
            self.queue.run_pending();
            let outstanding = self.hooks.dispatcher().stats().snapshot().outstanding_continuations();
            if outstanding == 0 {
                info!("✅ All continuations settled");
                return;
            }
            if Instant::now() >= deadline {
                warn!(
                    "⏰ Grace period elapsed with {} continuations outstanding",
                    outstanding
                );
                return;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    fn log_configuration_summary(&self) {
        info!("📋 Configuration Summary:");
        info!(
            "  ⏱️ Tick interval: {}ms | Tick limit: {}",
            self.config.engine.tick_interval_ms,
            match self.config.engine.max_ticks {
                0 => "none".to_string(),
                n => n.to_string(),
            }
        );
        info!("  🧵 Worker threads: {}", self.config.engine.worker_threads);
        info!(
            "  🌉 Sync suspend: {:?} ({}ms) | Slow listener threshold: {}ms",
            self.config.bridge.sync_suspend,
            self.config.bridge.sync_timeout_ms,
            self.config.bridge.slow_listener_threshold_ms
        );
        info!(
            "  🎮 Players: {} | Permission latency: {}ms | Locked slots: {:?}",
            self.config.harness.subjects,
            self.config.harness.permission_latency_ms,
            self.config.harness.locked_slots
        );
        info!("  📝 Log level: {}", self.config.logging.level);
    }
}

fn log_final_statistics(report: &RunReport) -> Result<(), serde_json::Error> {
    info!("📈 Final Statistics:");
    info!("  - Ticks run: {}", report.ticks);
    info!("  - Envelopes dispatched: {}", report.bridge.dispatched);
    info!(
        "  - Decisions inline / suspended: {} / {}",
        report.bridge.inline_resolved, report.bridge.suspended
    );
    info!(
        "  - Continuations replayed / dropped: {} / {}",
        report.bridge.continuations_replayed, report.bridge.continuations_dropped
    );
    info!(
        "  - Listener faults: {} | Replay faults: {}",
        report.bridge.listener_faults, report.bridge.replay_faults
    );
    info!("{}", serde_json::to_string(report)?);
    Ok(())
}
