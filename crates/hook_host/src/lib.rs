//! # Hook Host
//!
//! A reference engine host for the hook bridge. It simulates a small game
//! world driven from a single engine thread, wraps the world's operations in
//! interception points and registers a mix of synchronous and async
//! listeners, so every path through the bridge runs continuously: inline
//! decisions, suspended decisions replayed later, retriggers suppressed by the
//! pending guard and continuations dropped when a player disconnects.
//!
//! ## Quick Start
//!
//! ```bash
//! # Run with default configuration
//! hook_host
//!
//! # Specify custom configuration
//! hook_host --config staging.toml
//!
//! # Run a fixed number of ticks with debug output
//! hook_host --ticks 400 --log-level debug
//!
//! # JSON logging
//! hook_host --json-logs
//! ```
//!
//! ## Configuration
//!
//! Settings are read from a TOML file (default: `hook_host.toml`). If the
//! file doesn't exist, a default configuration is written to it.
//!
//! ## Signal Handling
//!
//! SIGINT and SIGTERM cancel the root lifetime token. The tick loop stops,
//! outstanding continuations are drained for a grace period and the final
//! statistics are logged.

pub mod adapters;
pub mod app;
pub mod cli;
pub mod config;
pub mod events;
pub mod listeners;
pub mod logging;
pub mod scenario;
pub mod signals;
pub mod world;

use app::Application;
use cli::CliArgs;
use config::AppConfig;
use tracing::{error, warn};

pub use app::RunReport;
pub use config::{EngineSettings, HarnessSettings, LoggingSettings};

/// Entry point for the hook host binary.
///
/// 1. Parses command-line arguments
/// 2. Loads the configuration file
/// 3. Initializes logging
/// 4. Builds the application on the calling thread and runs it there
pub fn init() -> Result<(), Box<dyn std::error::Error>> {
    let args = CliArgs::parse();

    // Config loading is async; the engine thread itself never joins a runtime.
    let bootstrap = tokio::runtime::Builder::new_current_thread().enable_all().build()?;
    let loaded = bootstrap.block_on(AppConfig::load_from_file(&args.config_path));
    drop(bootstrap);

    let config = match &loaded {
        Ok(config) => config.clone(),
        Err(_) => AppConfig::default(),
    };

    let mut logging = config.logging.clone();
    if let Some(level) = &args.log_level {
        logging.level = level.clone();
    }
    if let Err(e) = logging::setup_logging(&logging, args.json_logs) {
        eprintln!("❌ Failed to setup logging: {e}");
        std::process::exit(1);
    }

    if let Err(e) = &loaded {
        warn!(
            "⚠️ Could not load {} ({}); using defaults",
            args.config_path.display(),
            e
        );
    }

    match Application::new(args, config) {
        Ok(app) => {
            if let Err(e) = app.run() {
                error!("❌ Application error: {:?}", e);
                std::process::exit(1);
            }
        }
        Err(e) => {
            error!("❌ Failed to start application: {e:?}");
            std::process::exit(1);
        }
    }

    Ok(())
}
