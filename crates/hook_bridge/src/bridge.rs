//! # Continuation Bridge
//!
//! The engine asks "may this happen?" and needs the answer before the call
//! returns. When every listener answers without suspending, the bridge hands
//! that answer straight back. When one suspends, the bridge denies the
//! operation now and replays it later:
//!
//! 1. The walk is polled once inline. If it resolves, its `allowed` is
//!    returned and the replay is dropped unused.
//! 2. Otherwise the caller gets `false` and the rest of the walk runs on the
//!    runtime, tied to the envelope's lifetime token.
//! 3. The resolved walk is posted back to the engine thread as a
//!    continuation. The continuation is dropped if the subject is gone, if
//!    the envelope ended cancelled, or if the replay cannot re-resolve live
//!    state. Otherwise the replay runs with the kind's flag guard held, so
//!    the operation's own interception point lets it through.
//!
//! Kinds declared with [`GuardShape::Pending`] additionally admit at most one
//! outstanding decision per subject.
//!
//! Continuation records for one subject are consumed in call order. A record
//! whose walk finishes early waits on the engine thread for the records ahead
//! of it, and an inline "allowed" answer given while earlier records are still
//! outstanding is turned into a record of its own.

use crate::dispatcher::{Dispatched, Dispatcher};
use crate::engine::EngineHandle;
use crate::error::{panic_message, ReplayError};
use crate::event::{Envelope, EventKind};
use crate::guard::{Admission, FlagGuard, OrderSlot, PendingSet, PendingTicket, ReplayOrder, Retrigger, RetriggerPolicy};
use crate::lifetime::LifetimeToken;
use crate::registry::GuardShape;
use crate::stats::{bump, BridgeStats};
use futures::future::BoxFuture;
use std::fmt;
use std::marker::PhantomData;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::task::Poll;
use tracing::{debug, error, info, trace, warn};

/// The original mutating operation, captured for a later replay.
///
/// Replays run on the engine thread. Between capture and replay the world
/// may have moved on, so a replay first re-resolves whatever live state it
/// needs; returning `None` drops the continuation silently.
pub trait Replay<E: EventKind>: Send + 'static {
    /// Live state the replay acts on, looked up again at replay time.
    type Live;

    fn revalidate(&mut self, dispatched: &Dispatched<E>) -> Option<Self::Live>;

    fn apply(self, dispatched: &Dispatched<E>, live: Self::Live) -> Result<(), ReplayError>;
}

/// A replay with nothing to re-resolve.
pub struct FnReplay<E, F> {
    apply: F,
    _kind: PhantomData<fn(E)>,
}

/// Wraps a closure as a [`Replay`] whose live state is always valid.
pub fn replay_fn<E, F>(apply: F) -> FnReplay<E, F>
where
    E: EventKind,
    F: FnOnce(&Dispatched<E>) -> Result<(), ReplayError> + Send + 'static,
{
    FnReplay {
        apply,
        _kind: PhantomData,
    }
}

impl<E, F> Replay<E> for FnReplay<E, F>
where
    E: EventKind,
    F: FnOnce(&Dispatched<E>) -> Result<(), ReplayError> + Send + 'static,
{
    type Live = ();

    fn revalidate(&mut self, _dispatched: &Dispatched<E>) -> Option<()> {
        Some(())
    }

    fn apply(self, dispatched: &Dispatched<E>, _live: ()) -> Result<(), ReplayError> {
        (self.apply)(dispatched)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    /// An engine call site waiting for the answer.
    Caller,
    /// A queued retrigger; nobody is waiting, so an inline "allowed" replays.
    Retrigger,
}

/// Deny-now, replay-later wrapper around the [`Dispatcher`] for one event kind.
///
/// Cloning is cheap; clones share the guard and the pending set.
pub struct ContinuationBridge<E: EventKind> {
    dispatcher: Arc<Dispatcher>,
    engine: EngineHandle,
    flag: FlagGuard,
    pending: Option<(PendingSet, RetriggerPolicy)>,
    order: ReplayOrder,
    stats: Arc<BridgeStats>,
    _kind: PhantomData<fn(E)>,
}

impl<E: EventKind> Clone for ContinuationBridge<E> {
    fn clone(&self) -> Self {
        Self {
            dispatcher: self.dispatcher.clone(),
            engine: self.engine.clone(),
            flag: self.flag.clone(),
            pending: self.pending.clone(),
            order: self.order.clone(),
            stats: self.stats.clone(),
            _kind: PhantomData,
        }
    }
}

impl<E: EventKind> fmt::Debug for ContinuationBridge<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContinuationBridge")
            .field("kind", &E::NAME)
            .field("flag", &self.flag)
            .field("pending", &self.pending)
            .field("order", &self.order)
            .finish()
    }
}

impl<E: EventKind> ContinuationBridge<E> {
    /// Creates the bridge for kind `E`, using the guard policy declared in the
    /// dispatcher's registry.
    pub fn new(dispatcher: Arc<Dispatcher>, engine: EngineHandle) -> Self {
        let policy = dispatcher.registry().policy::<E>();
        let pending = match policy.guard {
            GuardShape::Flag => None,
            GuardShape::Pending(retrigger) => Some((
                PendingSet::new(E::NAME, dispatcher.config().max_queued_retriggers),
                retrigger,
            )),
        };
        info!("🌉 Continuation bridge ready for {} ({:?})", E::NAME, policy.guard);

        let stats = dispatcher.stats().clone();
        Self {
            dispatcher,
            engine,
            flag: FlagGuard::new(E::NAME),
            pending,
            order: ReplayOrder::new(E::NAME),
            stats,
            _kind: PhantomData,
        }
    }

    /// The guard held while a replay for this kind runs.
    pub fn flag_guard(&self) -> &FlagGuard {
        &self.flag
    }

    /// The pending set, for kinds declared with a pending guard.
    pub fn pending(&self) -> Option<&PendingSet> {
        self.pending.as_ref().map(|(set, _)| set)
    }

    /// Continuation records still waiting to be consumed, per subject.
    pub fn replay_order(&self) -> &ReplayOrder {
        &self.order
    }

    /// Prefix-hook entry point.
    ///
    /// While a replay of this kind is running the call passes through
    /// (`true`) without building or dispatching an envelope. Otherwise the
    /// envelope is built and handed to [`dispatch_with_continuation`].
    ///
    /// [`dispatch_with_continuation`]: Self::dispatch_with_continuation
    pub fn intercept<B, R>(&self, build: B, replay: R) -> bool
    where
        B: FnOnce() -> Envelope<E>,
        R: Replay<E>,
    {
        if self.flag.is_held() {
            trace!("↩️ {} replay in progress; passing through", E::NAME);
            return true;
        }
        self.dispatch_with_continuation(build(), replay)
    }

    /// Returns the decision for the synchronous caller.
    ///
    /// `true` only when the walk resolved inline, allowed the operation and
    /// no earlier record for the subject is outstanding; the caller then
    /// proceeds and `replay` is dropped. `false` means deny now: either the
    /// decision was negative, or `replay` will run on the engine thread after
    /// the subject's earlier records if the decision turns out positive.
    pub fn dispatch_with_continuation<R: Replay<E>>(&self, envelope: Envelope<E>, replay: R) -> bool {
        self.submit(envelope, replay, Origin::Caller)
    }

    fn submit<R: Replay<E>>(&self, envelope: Envelope<E>, replay: R, origin: Origin) -> bool {
        let (envelope, replay, ticket) = match self.admit(envelope, replay) {
            Some(admitted) => admitted,
            None => return false,
        };

        let id = envelope.id();
        let subject = envelope.subject();
        let lifetime = envelope.lifetime().clone();
        let mut walk = self.dispatcher.walk(envelope);
        match self.dispatcher.poll_inline(walk.as_mut()) {
            Poll::Ready(dispatched) => {
                bump(&self.stats.inline_resolved);
                if let Some(ticket) = ticket {
                    self.release(&ticket);
                }
                let waiting = self.order.is_waiting(subject);
                match origin {
                    Origin::Caller if !waiting => dispatched.allowed(),
                    Origin::Caller if !dispatched.allowed() => false,
                    _ => {
                        // Consumed as a record, in the subject's call order.
                        bump(&self.stats.continuations_created);
                        if waiting {
                            debug!("📬 {} resolved inline behind earlier records for {}; deferred", id, subject);
                        }
                        let slot = self.order.reserve(subject);
                        self.settle(slot, dispatched, replay, None);
                        false
                    }
                }
            }
            Poll::Pending => {
                bump(&self.stats.suspended);
                bump(&self.stats.continuations_created);
                debug!("⏳ {} suspended; denying now, continuation scheduled", id);
                let slot = self.order.reserve(subject);
                self.spawn_continuation(walk, lifetime, replay, ticket, slot);
                false
            }
        }
    }

    /// Applies the pending guard, if this kind has one. `None` means the
    /// trigger was suppressed or queued and the caller must deny.
    fn admit<R: Replay<E>>(
        &self,
        envelope: Envelope<E>,
        replay: R,
    ) -> Option<(Envelope<E>, R, Option<PendingTicket>)> {
        let Some((set, policy)) = &self.pending else {
            return Some((envelope, replay, None));
        };

        let subject = envelope.subject();
        let bridge = self.clone();
        let admission = set.admit(subject, *policy, (envelope, replay), move |(envelope, replay)| -> Retrigger {
            Box::new(move || {
                bridge.submit(envelope, replay, Origin::Retrigger);
            })
        });

        match admission {
            Admission::Admitted(ticket, (envelope, replay)) => Some((envelope, replay, Some(ticket))),
            Admission::Queued => {
                bump(&self.stats.retriggers_queued);
                debug!("📥 {} already pending for {}; retrigger queued", E::NAME, subject);
                None
            }
            Admission::Suppressed | Admission::QueueFull => {
                bump(&self.stats.retriggers_suppressed);
                debug!("🚫 {} already pending for {}; retrigger denied", E::NAME, subject);
                None
            }
        }
    }

    /// Releases a pending ticket and schedules whatever queued behind it.
    fn release(&self, ticket: &PendingTicket) {
        let Some(queued) = ticket.release() else {
            return;
        };
        for retrigger in queued {
            if let Err(e) = self.engine.post(retrigger) {
                warn!("⚠️ Dropping queued {} retrigger: {}", E::NAME, e);
            }
        }
    }

    fn spawn_continuation<R: Replay<E>>(
        &self,
        mut walk: BoxFuture<'static, Dispatched<E>>,
        lifetime: LifetimeToken,
        replay: R,
        ticket: Option<PendingTicket>,
        slot: OrderSlot,
    ) {
        let bridge = self.clone();
        drop(self.dispatcher.runtime().spawn(async move {
            let finished = tokio::select! {
                dispatched = &mut walk => Some(dispatched),
                _ = lifetime.cancelled() => None,
            };

            let dispatched = match finished {
                Some(dispatched) => dispatched,
                None => {
                    // The subject is gone: free its pending slot now, but let
                    // the running listener finish rather than cut it short.
                    if let Some(ticket) = ticket.clone() {
                        let subject = ticket.subject();
                        let post = bridge.engine.post(move || {
                            if ticket.release().is_some() {
                                debug!("🔌 {} pending entry for {} released on lifetime end", E::NAME, subject);
                            }
                        });
                        if let Err(e) = post {
                            warn!("⚠️ Could not release {} pending entry: {}", E::NAME, e);
                        }
                    }
                    walk.await
                }
            };

            let consumer = bridge.clone();
            let posted = bridge
                .engine
                .post(move || consumer.settle(slot, dispatched.mark_suspended(), replay, ticket));
            if let Err(e) = posted {
                bump(&bridge.stats.continuations_dropped);
                warn!("⚠️ {} continuation dropped: {}", E::NAME, e);
            }
        }));
    }

    /// Completes a record's place in its subject's lane and consumes every
    /// record that is now first in line.
    fn settle<R: Replay<E>>(&self, slot: OrderSlot, dispatched: Dispatched<E>, replay: R, ticket: Option<PendingTicket>) {
        let subject = slot.subject();
        let consumer = self.clone();
        let runnable = self
            .order
            .complete(slot, Box::new(move || consumer.consume(dispatched, replay, ticket)));
        if runnable.is_empty() {
            trace!("📬 {} record for {} waits behind earlier records", E::NAME, subject);
        }
        for consume in runnable {
            consume();
        }
    }

    /// Consumes a continuation record on the engine thread.
    fn consume<R: Replay<E>>(&self, dispatched: Dispatched<E>, replay: R, ticket: Option<PendingTicket>) {
        if !self.engine.is_engine_thread() {
            warn!("⚠️ {} continuation consumed off the engine thread", E::NAME);
        }

        let envelope = dispatched.envelope();
        if envelope.lifetime().is_cancelled() {
            bump(&self.stats.continuations_dropped);
            debug!("🔌 {} dropped: subject {} is gone", envelope.id(), envelope.subject());
        } else if !dispatched.allowed() {
            bump(&self.stats.continuations_dropped);
            debug!("🚫 {} dropped: cancelled by listeners", envelope.id());
        } else {
            self.run_replay(&dispatched, replay);
        }

        if let Some(ticket) = ticket {
            self.release(&ticket);
        }
    }

    fn run_replay<R: Replay<E>>(&self, dispatched: &Dispatched<E>, mut replay: R) {
        let id = dispatched.envelope().id();
        let subject = dispatched.envelope().subject();

        let live = match catch_unwind(AssertUnwindSafe(|| replay.revalidate(dispatched))) {
            Ok(Some(live)) => live,
            Ok(None) => {
                bump(&self.stats.continuations_dropped);
                debug!("🧭 {} dropped: live state for {} no longer matches", id, subject);
                return;
            }
            Err(payload) => {
                bump(&self.stats.continuations_dropped);
                bump(&self.stats.replay_faults);
                error!(event = %id, subject = %subject, "❌ Replay revalidation panicked: {}", panic_message(payload));
                return;
            }
        };

        let _scope = match self.flag.enter() {
            Ok(scope) => scope,
            Err(e) => {
                bump(&self.stats.continuations_dropped);
                bump(&self.stats.guard_violations);
                error!(event = %id, subject = %subject, "❌ {}; replay skipped", e);
                return;
            }
        };

        bump(&self.stats.continuations_replayed);
        match catch_unwind(AssertUnwindSafe(move || replay.apply(dispatched, live))) {
            Ok(Ok(())) => debug!("✅ {} replayed for {}", id, subject),
            Ok(Err(e)) => {
                bump(&self.stats.replay_faults);
                error!(event = %id, subject = %subject, "❌ Replay failed: {}", e);
            }
            Err(payload) => {
                bump(&self.stats.replay_faults);
                error!(event = %id, subject = %subject, "❌ Replay panicked: {}", panic_message(payload));
            }
        }
    }
}
