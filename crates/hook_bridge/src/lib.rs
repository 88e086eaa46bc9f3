//! # Hook Bridge
//!
//! Event dispatch and continuation bridge for engine interception points.
//!
//! An engine that calls into a plugin synchronously can only accept an
//! immediate allow/deny answer. Listener logic (permission checks, cooldown
//! lookups, database round-trips) may need to suspend before it knows the
//! answer. This crate reconciles the two.
//!
//! ## Key Features
//!
//! - **Typed envelopes**: every event kind declares its own outcome shape;
//!   the dispatcher only reads the shared [`Verdict`]
//! - **Frozen registry**: listeners registered once at startup, resolved by
//!   type without locking
//! - **Inline fast path**: a dispatch in which no listener suspends resolves
//!   on the calling thread and creates no continuation
//! - **Deny now, replay later**: suspended decisions deny the original
//!   operation and replay it on the engine thread once listeners allow it
//! - **Guards**: replays are never re-intercepted; kinds that can be
//!   retriggered admit one outstanding decision per subject
//! - **Lifetime tokens**: a departed subject cancels its outstanding work at
//!   the next checkpoint
//!
//! ## Architecture
//!
//! - [`RegistryBuilder`] / [`ListenerRegistry`]: listener storage
//! - [`Dispatcher`]: walks one envelope through its listeners
//! - [`ContinuationBridge`]: the engine-facing decision entry point
//! - [`EngineHandle`] / [`EngineQueue`]: the "resume only on the engine thread" boundary
//!
//! ## Usage
//!
//! ```rust,no_run
//! use hook_bridge::*;
//! use std::sync::Arc;
//!
//! #[derive(Debug)]
//! struct Door;
//! impl EventKind for Door {
//!     const NAME: &'static str = "world:door_opened";
//!     type Outcome = Verdict;
//! }
//!
//! let runtime = tokio::runtime::Runtime::new().unwrap();
//! let (engine, mut queue) = engine_channel();
//!
//! let mut builder = RegistryBuilder::new();
//! builder.on_sync::<Door, _>("locked-doors", Priority::HIGH, |envelope| {
//!     envelope.cancel();
//!     Ok(())
//! });
//! let dispatcher = Arc::new(Dispatcher::new(builder.build(), runtime.handle().clone(), BridgeConfig::default()));
//! let doors = ContinuationBridge::<Door>::new(dispatcher, engine);
//!
//! let subject = SubjectId::new();
//! let allowed = doors.intercept(
//!     || Envelope::new(subject, Door, Verdict::default(), LifetimeToken::new()),
//!     replay_fn::<Door, _>(|_| Ok(())),
//! );
//! assert!(!allowed);
//!
//! // Once per engine tick:
//! queue.run_pending();
//! ```

pub mod bridge;
pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod event;
pub mod guard;
pub mod lifetime;
pub mod registry;
pub mod stats;

#[cfg(test)]
mod tests;

pub use bridge::{replay_fn, ContinuationBridge, FnReplay, Replay};
pub use config::{BridgeConfig, SyncSuspendPolicy};
pub use dispatcher::{DispatchMode, Dispatched, Dispatcher, Resolution};
pub use engine::{engine_channel, EngineHandle, EngineQueue, EngineTask};
pub use error::{BridgeError, ListenerError, ReplayError};
pub use event::{CancelPolicy, Envelope, EventId, EventKind, Outcome, SubjectId, Verdict};
pub use guard::{
    Admission, Consumer, FlagGuard, GuardScope, OrderSlot, PendingSet, PendingTicket, ReplayOrder, Retrigger,
    RetriggerPolicy,
};
pub use lifetime::{LifetimeToken, SessionTokens};
pub use registry::{GuardShape, Handler, KindPolicy, Listener, ListenerRegistry, Priority, Registration, RegistryBuilder};
pub use stats::{BridgeStats, BridgeStatsSnapshot};

pub use async_trait::async_trait;
