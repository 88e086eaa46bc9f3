//! # Dispatcher
//!
//! Drives one envelope through the listeners registered for its kind.
//!
//! Every walk is a single future. The dispatcher polls it once on the calling
//! thread: if no listener suspends, the walk completes right there and the
//! caller gets its answer inline. What happens when a listener does suspend
//! depends on the entry point:
//!
//! | Entry point | Mode | On suspension |
//! |-------------|------|---------------|
//! | [`Dispatcher::fire`] | fire-and-forget | remainder spawned on the runtime |
//! | [`Dispatcher::decide`] | decision, no async | blocks or errors, per [`SyncSuspendPolicy`] |
//! | [`Dispatcher::resolve`] | decision, async | the caller awaits |
//!
//! The continuation bridge is the only engine-thread caller of the async
//! decision mode; it uses the same inline poll.

use crate::config::{BridgeConfig, SyncSuspendPolicy};
use crate::error::{panic_message, BridgeError};
use crate::event::{CancelPolicy, Envelope, EventKind, Outcome};
use crate::registry::{Handler, ListenerRegistry};
use crate::stats::{bump, BridgeStats};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::{mpsc, Arc};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tracing::{debug, error, info, warn};

/// How the caller consumes a dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    /// Informational event; the caller does not wait.
    FireAndForget,
    /// The caller needs an allow/deny answer.
    DecisionRequired { allow_async: bool },
}

/// How a walk ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Every applicable listener ran.
    Completed,
    /// A listener finalized the outcome, or cancelled a terminal envelope.
    ShortCircuited,
    /// The envelope's lifetime ended before the walk finished.
    Abandoned,
}

/// The read-only result of dispatching one envelope.
#[derive(Debug)]
pub struct Dispatched<E: EventKind> {
    envelope: Envelope<E>,
    allowed: bool,
    resolution: Resolution,
    suspended: bool,
}

impl<E: EventKind> Dispatched<E> {
    fn new(envelope: Envelope<E>, resolution: Resolution) -> Self {
        let allowed = !envelope.is_cancelled();
        Self {
            envelope,
            allowed,
            resolution,
            suspended: false,
        }
    }

    pub(crate) fn mark_suspended(mut self) -> Self {
        self.suspended = true;
        self
    }

    /// `!cancelled`, as of the moment the walk ended.
    #[inline]
    pub fn allowed(&self) -> bool {
        self.allowed
    }

    /// The final envelope.
    #[inline]
    pub fn envelope(&self) -> &Envelope<E> {
        &self.envelope
    }

    #[inline]
    pub fn outcome(&self) -> &E::Outcome {
        self.envelope.outcome()
    }

    #[inline]
    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    /// True if at least one listener suspended before the walk resolved.
    #[inline]
    pub fn was_suspended(&self) -> bool {
        self.suspended
    }
}

/// Walks envelopes through a frozen [`ListenerRegistry`].
pub struct Dispatcher {
    registry: Arc<ListenerRegistry>,
    runtime: Handle,
    config: BridgeConfig,
    stats: Arc<BridgeStats>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("registry", &self.registry)
            .field("config", &self.config)
            .finish()
    }
}

impl Dispatcher {
    /// Creates a dispatcher whose suspended walks run on `runtime`.
    pub fn new(registry: ListenerRegistry, runtime: Handle, config: BridgeConfig) -> Self {
        info!(
            "🚀 Dispatcher ready: {} listeners across {} event kinds (sync suspend: {:?})",
            registry.total_listeners(),
            registry.kind_names().len(),
            config.sync_suspend
        );
        Self {
            registry: Arc::new(registry),
            runtime,
            config,
            stats: Arc::new(BridgeStats::default()),
        }
    }

    pub fn registry(&self) -> &ListenerRegistry {
        &self.registry
    }

    pub fn runtime(&self) -> &Handle {
        &self.runtime
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Counters shared with every bridge built on this dispatcher.
    pub fn stats(&self) -> &Arc<BridgeStats> {
        &self.stats
    }

    /// Synchronous entry point for adapters.
    ///
    /// Returns the `allowed` answer. Fire-and-forget always answers `true`.
    /// `DecisionRequired { allow_async: true }` may suspend and therefore
    /// fails with [`BridgeError::ContinuationRequired`]; use the continuation
    /// bridge for it.
    pub fn dispatch<E: EventKind>(&self, envelope: Envelope<E>, mode: DispatchMode) -> Result<bool, BridgeError> {
        match mode {
            DispatchMode::FireAndForget => {
                self.fire(envelope);
                Ok(true)
            }
            DispatchMode::DecisionRequired { allow_async: false } => {
                self.decide(envelope).map(|dispatched| dispatched.allowed())
            }
            DispatchMode::DecisionRequired { allow_async: true } => Err(BridgeError::ContinuationRequired {
                event: envelope.id().to_string(),
            }),
        }
    }

    /// Dispatches an informational envelope.
    ///
    /// Listeners start on the calling thread; anything left after the first
    /// suspension finishes on the runtime. Faults are logged, never returned.
    pub fn fire<E: EventKind>(&self, envelope: Envelope<E>) {
        bump(&self.stats.fired);
        let id = envelope.id();
        let mut walk = self.walk(envelope);
        if self.poll_inline(walk.as_mut()).is_pending() {
            debug!("📤 {} suspended; finishing in the background", id);
            drop(self.runtime.spawn(walk));
        }
    }

    /// Dispatches an envelope whose caller needs the answer now and cannot
    /// accept a continuation.
    pub fn decide<E: EventKind>(&self, envelope: Envelope<E>) -> Result<Dispatched<E>, BridgeError> {
        let id = envelope.id();
        let mut walk = self.walk(envelope);
        if let Poll::Ready(dispatched) = self.poll_inline(walk.as_mut()) {
            bump(&self.stats.inline_resolved);
            return Ok(dispatched);
        }

        bump(&self.stats.suspended);
        match self.config.sync_suspend {
            SyncSuspendPolicy::Reject => {
                error!(
                    event = %id,
                    "❌ A listener suspended during a synchronous decision dispatch"
                );
                Err(BridgeError::UnexpectedSuspension { event: id.to_string() })
            }
            SyncSuspendPolicy::Block => {
                let timeout = self.config.sync_timeout();
                let (tx, rx) = mpsc::sync_channel(1);
                drop(self.runtime.spawn(async move {
                    let _ = tx.send(walk.await);
                }));
                rx.recv_timeout(timeout)
                    .map(Dispatched::mark_suspended)
                    .map_err(|_| {
                        warn!(
                            event = %id,
                            "⏰ Synchronous decision dispatch did not resolve within {:?}",
                            timeout
                        );
                        BridgeError::SyncDispatchTimedOut {
                            event: id.to_string(),
                            timeout_ms: self.config.sync_timeout_ms,
                        }
                    })
            }
        }
    }

    /// Dispatches an envelope and waits for the decision, suspending as
    /// needed. For async callers that are not the engine thread.
    pub async fn resolve<E: EventKind>(&self, envelope: Envelope<E>) -> Dispatched<E> {
        self.walk(envelope).await
    }

    /// Builds the walk future for `envelope`. Nothing runs until it is polled.
    pub(crate) fn walk<E: EventKind>(&self, envelope: Envelope<E>) -> BoxFuture<'static, Dispatched<E>> {
        bump(&self.stats.dispatched);
        run_listeners(
            self.registry.clone(),
            self.stats.clone(),
            self.config.slow_listener_threshold(),
            envelope,
        )
        .boxed()
    }

    /// Polls `future` once on the calling thread, inside the runtime's
    /// context so listeners can create timers and spawn tasks.
    pub(crate) fn poll_inline<F>(&self, future: Pin<&mut F>) -> Poll<F::Output>
    where
        F: Future + ?Sized,
    {
        let _context = self.runtime.enter();
        let waker = futures::task::noop_waker();
        let mut cx = Context::from_waker(&waker);
        future.poll(&mut cx)
    }
}

async fn run_listeners<E: EventKind>(
    registry: Arc<ListenerRegistry>,
    stats: Arc<BridgeStats>,
    slow_threshold: Duration,
    mut envelope: Envelope<E>,
) -> Dispatched<E> {
    let mut resolution = Resolution::Completed;

    for registration in registry.resolve::<E>() {
        // Lifetime checkpoint: the only place a walk notices a departed subject.
        if envelope.lifetime().is_cancelled() {
            debug!(
                event = %envelope.id(),
                subject = %envelope.subject(),
                "🔌 Lifetime ended before listener '{}'; abandoning walk",
                registration.name()
            );
            if envelope.cancellable() {
                envelope.force_cancelled(true);
            }
            resolution = Resolution::Abandoned;
            break;
        }

        if registration.ignore_cancelled() && envelope.is_cancelled() {
            continue;
        }

        let snapshot = envelope.outcome().clone();
        let started = Instant::now();
        let result = match registration.handler() {
            Handler::Sync(handler) => catch_unwind(AssertUnwindSafe(|| (**handler)(&mut envelope))),
            Handler::Async(listener) => AssertUnwindSafe(listener.handle(&mut envelope)).catch_unwind().await,
        };

        let elapsed = started.elapsed();
        if elapsed > slow_threshold {
            bump(&stats.slow_listeners);
            warn!(
                event = %envelope.id(),
                listener = registration.name(),
                "🐌 Listener took {:?} (threshold {:?})",
                elapsed,
                slow_threshold
            );
        }

        let fault = match result {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e.to_string()),
            Err(payload) => Some(format!("panicked: {}", panic_message(payload))),
        };
        if let Some(fault) = fault {
            bump(&stats.listener_faults);
            warn!(
                event = %envelope.id(),
                subject = %envelope.subject(),
                listener = registration.name(),
                "⚠️ Listener fault, discarding its changes: {}",
                fault
            );
            envelope.replace_outcome(snapshot);
            continue;
        }

        if !envelope.cancellable() && envelope.is_cancelled() {
            warn!(
                event = %envelope.id(),
                listener = registration.name(),
                "⚠️ Listener cancelled a non-cancellable event; reverting"
            );
            envelope.force_cancelled(false);
        }

        if envelope.outcome().is_final() {
            resolution = Resolution::ShortCircuited;
            break;
        }
        if envelope.is_cancelled() && envelope.cancel_policy() == CancelPolicy::Terminal {
            debug!(
                event = %envelope.id(),
                "🛑 Cancelled by '{}'; skipping lower priorities",
                registration.name()
            );
            resolution = Resolution::ShortCircuited;
            break;
        }
    }

    Dispatched::new(envelope, resolution)
}
