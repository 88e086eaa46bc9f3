use super::*;
use futures::FutureExt;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use tokio::runtime::{Builder, Handle, Runtime};

// ---------------------------------------------------------------------------
// Event kinds
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct MoveItem {
    from_slot: u32,
}

#[derive(Debug, Clone, Default)]
struct MoveOutcome {
    verdict: Verdict,
    to_slot: u32,
}

impl Outcome for MoveOutcome {
    fn verdict(&self) -> &Verdict {
        &self.verdict
    }

    fn verdict_mut(&mut self) -> &mut Verdict {
        &mut self.verdict
    }
}

impl EventKind for MoveItem {
    const NAME: &'static str = "test:move_item";
    type Outcome = MoveOutcome;
}

#[derive(Debug)]
struct Handshake {
    attempt: u32,
}

impl EventKind for Handshake {
    const NAME: &'static str = "test:handshake";
    type Outcome = Verdict;
}

#[derive(Debug)]
struct Destroyed;

impl EventKind for Destroyed {
    const NAME: &'static str = "test:destroyed";
    type Outcome = Verdict;
}

#[derive(Debug)]
struct Strike;

impl EventKind for Strike {
    const NAME: &'static str = "test:strike";
    const CANCEL_POLICY: CancelPolicy = CancelPolicy::Terminal;
    type Outcome = Verdict;
}

fn move_envelope(lifetime: LifetimeToken) -> Envelope<MoveItem> {
    Envelope::new(SubjectId::new(), MoveItem { from_slot: 1 }, MoveOutcome::default(), lifetime)
}

fn handshake(subject: SubjectId, attempt: u32, lifetime: LifetimeToken) -> Envelope<Handshake> {
    Envelope::new(subject, Handshake { attempt }, Verdict::default(), lifetime)
}

// ---------------------------------------------------------------------------
// Listeners
// ---------------------------------------------------------------------------

/// Sleeps, then allows or cancels.
struct Delayed {
    delay: Duration,
    cancel: bool,
    calls: Arc<AtomicUsize>,
}

impl Delayed {
    fn new(delay_ms: u64, cancel: bool) -> (Self, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let listener = Self {
            delay: Duration::from_millis(delay_ms),
            cancel,
            calls: calls.clone(),
        };
        (listener, calls)
    }
}

#[async_trait]
impl<E: EventKind> Listener<E> for Delayed {
    async fn handle(&self, envelope: &mut Envelope<E>) -> Result<(), ListenerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        envelope.set_cancelled(self.cancel);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Engine-thread harness
// ---------------------------------------------------------------------------

/// The test thread plays the engine thread.
struct Harness {
    runtime: Runtime,
    dispatcher: Arc<Dispatcher>,
    engine: EngineHandle,
    queue: EngineQueue,
}

fn harness(builder: RegistryBuilder, config: BridgeConfig) -> Harness {
    let runtime = Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .unwrap();
    let (engine, queue) = engine_channel();
    let dispatcher = Arc::new(Dispatcher::new(builder.build(), runtime.handle().clone(), config));
    Harness {
        runtime,
        dispatcher,
        engine,
        queue,
    }
}

impl Harness {
    fn bridge<E: EventKind>(&self) -> ContinuationBridge<E> {
        ContinuationBridge::new(self.dispatcher.clone(), self.engine.clone())
    }

    /// Drains the engine queue until `done` holds or `timeout` passes.
    fn pump_until(&mut self, timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            self.queue.run_pending();
            if done() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(1));
        }
    }

    /// Keeps draining for `duration`, for asserting that nothing else happens.
    fn pump_for(&mut self, duration: Duration) {
        self.pump_until(duration, || false);
    }

    fn stats(&self) -> BridgeStatsSnapshot {
        self.dispatcher.stats().snapshot()
    }
}

fn counting_replay<E: EventKind>(counter: &Arc<AtomicUsize>) -> FnReplay<E, impl FnOnce(&Dispatched<E>) -> Result<(), ReplayError> + Send + 'static> {
    let counter = counter.clone();
    replay_fn::<E, _>(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    })
}

// ---------------------------------------------------------------------------
// Continuation bridge
// ---------------------------------------------------------------------------

#[test]
fn test_suspended_allow_replays_exactly_once() {
    let (listener, calls) = Delayed::new(50, false);
    let mut builder = RegistryBuilder::new();
    builder.on_async::<MoveItem, _>("permissions", Priority::NORMAL, listener);
    let mut h = harness(builder, BridgeConfig::default());
    let bridge = h.bridge::<MoveItem>();

    let mutations = Arc::new(AtomicUsize::new(0));
    let allowed = bridge.dispatch_with_continuation(move_envelope(LifetimeToken::new()), counting_replay(&mutations));

    assert!(!allowed, "a suspended decision must deny the original call");
    assert_eq!(mutations.load(Ordering::SeqCst), 0);

    assert!(h.pump_until(Duration::from_secs(2), || mutations.load(Ordering::SeqCst) == 1));
    h.pump_for(Duration::from_millis(100));

    assert_eq!(mutations.load(Ordering::SeqCst), 1);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let stats = h.stats();
    assert_eq!(stats.continuations_created, 1);
    assert_eq!(stats.continuations_replayed, 1);
    assert_eq!(stats.outstanding_continuations(), 0);
    assert!(!bridge.flag_guard().is_held());
}

#[test]
fn test_lifetime_end_drops_continuation_and_pending_entry() {
    let (listener, calls) = Delayed::new(50, false);
    let mut builder = RegistryBuilder::new();
    builder
        .on_async::<Handshake, _>("whitelist", Priority::NORMAL, listener)
        .policy::<Handshake>(KindPolicy {
            guard: GuardShape::Pending(RetriggerPolicy::Suppress),
        });
    let mut h = harness(builder, BridgeConfig::default());
    let bridge = h.bridge::<Handshake>();

    let lifetime = LifetimeToken::new();
    let disconnect = lifetime.clone();
    h.runtime.spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        disconnect.cancel();
    });

    let subject = SubjectId::new();
    let mutations = Arc::new(AtomicUsize::new(0));
    assert!(!bridge.dispatch_with_continuation(handshake(subject, 1, lifetime), counting_replay(&mutations)));
    assert!(bridge.pending().unwrap().is_pending(subject));

    let dispatcher = h.dispatcher.clone();
    assert!(h.pump_until(Duration::from_secs(2), || dispatcher.stats().snapshot().continuations_dropped == 1));
    h.pump_for(Duration::from_millis(50));

    assert_eq!(mutations.load(Ordering::SeqCst), 0);
    assert_eq!(calls.load(Ordering::SeqCst), 1, "a running listener is never cut short");
    assert!(bridge.pending().unwrap().is_empty());
    assert_eq!(h.stats().continuations_dropped, 1);
}

#[test]
fn test_suspended_cancel_never_mutates() {
    let (listener, _) = Delayed::new(10, true);
    let mut builder = RegistryBuilder::new();
    builder.on_async::<MoveItem, _>("permissions", Priority::NORMAL, listener);
    let mut h = harness(builder, BridgeConfig::default());
    let bridge = h.bridge::<MoveItem>();

    let mutations = Arc::new(AtomicUsize::new(0));
    assert!(!bridge.dispatch_with_continuation(move_envelope(LifetimeToken::new()), counting_replay(&mutations)));

    let dispatcher = h.dispatcher.clone();
    assert!(h.pump_until(Duration::from_secs(2), || dispatcher.stats().snapshot().continuations_dropped == 1));
    assert_eq!(mutations.load(Ordering::SeqCst), 0);
}

#[test]
fn test_inline_fast_path_creates_no_continuation() {
    let mut builder = RegistryBuilder::new();
    builder.on_sync::<MoveItem, _>("redirect", Priority::NORMAL, |envelope| {
        let from = envelope.event().from_slot;
        envelope.outcome_mut().to_slot = from + 6;
        Ok(())
    });
    let mut h = harness(builder, BridgeConfig::default());
    let bridge = h.bridge::<MoveItem>();

    let mutations = Arc::new(AtomicUsize::new(0));
    assert!(bridge.dispatch_with_continuation(move_envelope(LifetimeToken::new()), counting_replay(&mutations)));

    assert_eq!(h.queue.run_pending(), 0);
    assert_eq!(mutations.load(Ordering::SeqCst), 0, "the caller proceeds inline; the replay is dropped");
    let stats = h.stats();
    assert_eq!(stats.inline_resolved, 1);
    assert_eq!(stats.continuations_created, 0);
}

#[test]
fn test_inline_and_suspended_paths_agree() {
    let mut inline = RegistryBuilder::new();
    inline
        .on_sync::<MoveItem, _>("deny", Priority::HIGH, |envelope| {
            envelope.cancel();
            Ok(())
        })
        .on_sync::<MoveItem, _>("override", Priority::LOW, |envelope| {
            envelope.set_cancelled(false);
            envelope.outcome_mut().to_slot = 9;
            Ok(())
        });

    let mut suspended = RegistryBuilder::new();
    suspended
        .on_async_fn::<MoveItem, _>("deny", Priority::HIGH, |envelope| {
            async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                envelope.cancel();
                Ok(())
            }
            .boxed()
        })
        .on_async_fn::<MoveItem, _>("override", Priority::LOW, |envelope| {
            async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                envelope.set_cancelled(false);
                envelope.outcome_mut().to_slot = 9;
                Ok(())
            }
            .boxed()
        });

    let config = BridgeConfig {
        sync_timeout_ms: 1_000,
        ..BridgeConfig::default()
    };
    let inline = harness(inline, config.clone());
    let suspended = harness(suspended, config);

    let a = inline.dispatcher.decide(move_envelope(LifetimeToken::new())).unwrap();
    let b = suspended.dispatcher.decide(move_envelope(LifetimeToken::new())).unwrap();

    assert!(!a.was_suspended());
    assert!(b.was_suspended());
    assert_eq!(a.allowed(), b.allowed());
    assert_eq!(a.outcome().to_slot, b.outcome().to_slot);
    assert!(a.allowed());
}

#[test]
fn test_replay_is_not_reintercepted() {
    let (listener, calls) = Delayed::new(10, false);
    let mut builder = RegistryBuilder::new();
    builder.on_async::<MoveItem, _>("permissions", Priority::NORMAL, listener);
    let mut h = harness(builder, BridgeConfig::default());
    let bridge = h.bridge::<MoveItem>();

    let built = Arc::new(AtomicUsize::new(0));
    let passed_through = Arc::new(AtomicUsize::new(0));

    let inner = bridge.clone();
    let (built_in_replay, passed_in_replay) = (built.clone(), passed_through.clone());
    let replay = replay_fn::<MoveItem, _>(move |_| {
        // The original operation hits its own interception point again.
        let allowed = inner.intercept(
            || {
                built_in_replay.fetch_add(1, Ordering::SeqCst);
                move_envelope(LifetimeToken::new())
            },
            replay_fn::<MoveItem, _>(|_| Ok(())),
        );
        if allowed {
            passed_in_replay.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    });

    assert!(!bridge.dispatch_with_continuation(move_envelope(LifetimeToken::new()), replay));
    assert!(h.pump_until(Duration::from_secs(2), || passed_through.load(Ordering::SeqCst) == 1));
    h.pump_for(Duration::from_millis(50));

    assert_eq!(calls.load(Ordering::SeqCst), 1, "the replay must not dispatch again");
    assert_eq!(built.load(Ordering::SeqCst), 0);
    assert_eq!(h.stats().dispatched, 1);
}

#[test]
fn test_replay_fault_is_swallowed() {
    let (listener, _) = Delayed::new(5, false);
    let mut builder = RegistryBuilder::new();
    builder.on_async::<MoveItem, _>("permissions", Priority::NORMAL, listener);
    let mut h = harness(builder, BridgeConfig::default());
    let bridge = h.bridge::<MoveItem>();

    bridge.dispatch_with_continuation(
        move_envelope(LifetimeToken::new()),
        replay_fn::<MoveItem, _>(|_| Err(ReplayError::Failed("slot vanished".to_string()))),
    );
    bridge.dispatch_with_continuation(
        move_envelope(LifetimeToken::new()),
        replay_fn::<MoveItem, _>(|_| panic!("replay exploded")),
    );

    let dispatcher = h.dispatcher.clone();
    assert!(h.pump_until(Duration::from_secs(2), || dispatcher.stats().snapshot().replay_faults == 2));
    assert!(!bridge.flag_guard().is_held());
    assert_eq!(h.stats().continuations_replayed, 2);
}

/// Re-resolves the item's current slot instead of trusting the captured one.
struct MoveReplay {
    current_slot: Arc<AtomicU32>,
    applied_at: Arc<Mutex<Vec<u32>>>,
}

impl Replay<MoveItem> for MoveReplay {
    type Live = u32;

    fn revalidate(&mut self, _dispatched: &Dispatched<MoveItem>) -> Option<u32> {
        // Slot 0 means the item is gone.
        let slot = self.current_slot.load(Ordering::SeqCst);
        (slot != 0).then_some(slot)
    }

    fn apply(self, _dispatched: &Dispatched<MoveItem>, slot: u32) -> Result<(), ReplayError> {
        self.applied_at.lock().unwrap().push(slot);
        Ok(())
    }
}

#[test]
fn test_replay_acts_on_re_resolved_state() {
    let (listener, _) = Delayed::new(20, false);
    let mut builder = RegistryBuilder::new();
    builder.on_async::<MoveItem, _>("permissions", Priority::NORMAL, listener);
    let mut h = harness(builder, BridgeConfig::default());
    let bridge = h.bridge::<MoveItem>();

    let current_slot = Arc::new(AtomicU32::new(1));
    let applied_at = Arc::new(Mutex::new(Vec::new()));
    let replay = MoveReplay {
        current_slot: current_slot.clone(),
        applied_at: applied_at.clone(),
    };

    assert!(!bridge.dispatch_with_continuation(move_envelope(LifetimeToken::new()), replay));
    // Moved by unrelated means while the decision was outstanding.
    current_slot.store(4, Ordering::SeqCst);

    assert!(h.pump_until(Duration::from_secs(2), || !applied_at.lock().unwrap().is_empty()));
    assert_eq!(*applied_at.lock().unwrap(), vec![4]);
}

#[test]
fn test_stale_state_drops_silently() {
    let (listener, _) = Delayed::new(20, false);
    let mut builder = RegistryBuilder::new();
    builder.on_async::<MoveItem, _>("permissions", Priority::NORMAL, listener);
    let mut h = harness(builder, BridgeConfig::default());
    let bridge = h.bridge::<MoveItem>();

    let current_slot = Arc::new(AtomicU32::new(1));
    let applied_at = Arc::new(Mutex::new(Vec::new()));
    let replay = MoveReplay {
        current_slot: current_slot.clone(),
        applied_at: applied_at.clone(),
    };

    assert!(!bridge.dispatch_with_continuation(move_envelope(LifetimeToken::new()), replay));
    current_slot.store(0, Ordering::SeqCst);

    let dispatcher = h.dispatcher.clone();
    assert!(h.pump_until(Duration::from_secs(2), || dispatcher.stats().snapshot().continuations_dropped == 1));
    assert!(applied_at.lock().unwrap().is_empty());
    assert_eq!(h.stats().replay_faults, 0);
}

#[test]
fn test_pending_suppress_denies_second_trigger() {
    let (listener, calls) = Delayed::new(30, false);
    let mut builder = RegistryBuilder::new();
    builder
        .on_async::<Handshake, _>("whitelist", Priority::NORMAL, listener)
        .policy::<Handshake>(KindPolicy {
            guard: GuardShape::Pending(RetriggerPolicy::Suppress),
        });
    let mut h = harness(builder, BridgeConfig::default());
    let bridge = h.bridge::<Handshake>();

    let subject = SubjectId::new();
    let lifetime = LifetimeToken::new();
    let mutations = Arc::new(AtomicUsize::new(0));

    assert!(!bridge.dispatch_with_continuation(handshake(subject, 1, lifetime.clone()), counting_replay(&mutations)));
    assert!(!bridge.dispatch_with_continuation(handshake(subject, 2, lifetime.clone()), counting_replay(&mutations)));
    assert_eq!(h.stats().retriggers_suppressed, 1);

    assert!(h.pump_until(Duration::from_secs(2), || mutations.load(Ordering::SeqCst) == 1));
    h.pump_for(Duration::from_millis(80));

    assert_eq!(mutations.load(Ordering::SeqCst), 1);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(bridge.pending().unwrap().is_empty());
}

#[test]
fn test_pending_queue_resubmits_after_first_resolves() {
    let (listener, calls) = Delayed::new(20, false);
    let mut builder = RegistryBuilder::new();
    builder
        .on_async::<Handshake, _>("whitelist", Priority::NORMAL, listener)
        .policy::<Handshake>(KindPolicy {
            guard: GuardShape::Pending(RetriggerPolicy::Queue),
        });
    let mut h = harness(builder, BridgeConfig::default());
    let bridge = h.bridge::<Handshake>();

    let subject = SubjectId::new();
    let lifetime = LifetimeToken::new();
    let order = Arc::new(Mutex::new(Vec::new()));

    for attempt in 1..=2 {
        let order = order.clone();
        let replay = replay_fn::<Handshake, _>(move |dispatched| {
            order.lock().unwrap().push(dispatched.envelope().event().attempt);
            Ok(())
        });
        assert!(!bridge.dispatch_with_continuation(handshake(subject, attempt, lifetime.clone()), replay));
    }
    assert_eq!(h.stats().retriggers_queued, 1);

    assert!(h.pump_until(Duration::from_secs(2), || order.lock().unwrap().len() == 2));
    assert_eq!(*order.lock().unwrap(), vec![1, 2]);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert!(bridge.pending().unwrap().is_empty());
}

/// Replays record the slot they were submitted for.
fn recording_replay(from_slot: u32, order: &Arc<Mutex<Vec<u32>>>) -> impl Replay<MoveItem> {
    let order = order.clone();
    replay_fn::<MoveItem, _>(move |_| {
        order.lock().unwrap().push(from_slot);
        Ok(())
    })
}

fn move_from(subject: SubjectId, from_slot: u32, lifetime: LifetimeToken) -> Envelope<MoveItem> {
    Envelope::new(subject, MoveItem { from_slot }, MoveOutcome::default(), lifetime)
}

#[test]
fn test_replays_follow_call_order_when_first_walk_is_slower() {
    let mut builder = RegistryBuilder::new();
    builder.on_async_fn::<MoveItem, _>("permissions", Priority::NORMAL, |envelope| {
        async move {
            let delay = if envelope.event().from_slot == 1 { 150 } else { 5 };
            tokio::time::sleep(Duration::from_millis(delay)).await;
            Ok(())
        }
        .boxed()
    });
    let mut h = harness(builder, BridgeConfig::default());
    let bridge = h.bridge::<MoveItem>();

    let subject = SubjectId::new();
    let lifetime = LifetimeToken::new();
    let order = Arc::new(Mutex::new(Vec::new()));

    assert!(!bridge.dispatch_with_continuation(move_from(subject, 1, lifetime.clone()), recording_replay(1, &order)));
    assert!(!bridge.dispatch_with_continuation(move_from(subject, 2, lifetime.clone()), recording_replay(2, &order)));

    // The second walk resolves first and waits for the first record.
    thread::sleep(Duration::from_millis(30));
    h.queue.run_pending();
    assert!(order.lock().unwrap().is_empty());
    assert!(bridge.replay_order().is_waiting(subject));

    assert!(h.pump_until(Duration::from_secs(2), || order.lock().unwrap().len() == 2));
    assert_eq!(*order.lock().unwrap(), vec![1, 2]);
    assert!(bridge.replay_order().is_empty());
    assert_eq!(h.stats().outstanding_continuations(), 0);
}

#[test]
fn test_inline_allow_waits_behind_outstanding_record() {
    let mut builder = RegistryBuilder::new();
    builder.on_async_fn::<MoveItem, _>("permissions", Priority::NORMAL, |envelope| {
        async move {
            if envelope.event().from_slot == 1 {
                tokio::time::sleep(Duration::from_millis(40)).await;
            }
            Ok(())
        }
        .boxed()
    });
    let mut h = harness(builder, BridgeConfig::default());
    let bridge = h.bridge::<MoveItem>();

    let subject = SubjectId::new();
    let lifetime = LifetimeToken::new();
    let order = Arc::new(Mutex::new(Vec::new()));

    assert!(!bridge.dispatch_with_continuation(move_from(subject, 1, lifetime.clone()), recording_replay(1, &order)));
    assert!(
        !bridge.dispatch_with_continuation(move_from(subject, 2, lifetime.clone()), recording_replay(2, &order)),
        "an inline allow must not overtake the outstanding record"
    );
    assert!(order.lock().unwrap().is_empty());

    assert!(h.pump_until(Duration::from_secs(2), || order.lock().unwrap().len() == 2));
    assert_eq!(*order.lock().unwrap(), vec![1, 2]);
    let stats = h.stats();
    assert_eq!(stats.continuations_created, 2);
    assert_eq!(stats.inline_resolved, 1);

    // Nothing outstanding any more: the fast path answers directly again.
    assert!(bridge.dispatch_with_continuation(move_from(subject, 3, lifetime), recording_replay(3, &order)));
    assert_eq!(order.lock().unwrap().len(), 2);
}

#[test]
fn test_other_subjects_are_not_held_back() {
    let mut builder = RegistryBuilder::new();
    builder.on_async_fn::<MoveItem, _>("permissions", Priority::NORMAL, |envelope| {
        async move {
            let delay = if envelope.event().from_slot == 1 { 300 } else { 5 };
            tokio::time::sleep(Duration::from_millis(delay)).await;
            Ok(())
        }
        .boxed()
    });
    let mut h = harness(builder, BridgeConfig::default());
    let bridge = h.bridge::<MoveItem>();

    let lifetime = LifetimeToken::new();
    let order = Arc::new(Mutex::new(Vec::new()));
    bridge.dispatch_with_continuation(move_from(SubjectId::new(), 1, lifetime.clone()), recording_replay(1, &order));
    bridge.dispatch_with_continuation(move_from(SubjectId::new(), 2, lifetime), recording_replay(2, &order));

    assert!(h.pump_until(Duration::from_secs(2), || !order.lock().unwrap().is_empty()));
    assert_eq!(*order.lock().unwrap(), vec![2]);
    assert!(h.pump_until(Duration::from_secs(2), || order.lock().unwrap().len() == 2));
}

#[test]
fn test_outstanding_count_is_exact_with_inline_retrigger() {
    let mut builder = RegistryBuilder::new();
    builder
        .on_async::<MoveItem, _>("permissions", Priority::NORMAL, Delayed::new(400, false).0)
        .on_async_fn::<Handshake, _>("whitelist", Priority::NORMAL, |envelope| {
            async move {
                // Only the first attempt needs a remote lookup.
                if envelope.event().attempt == 1 {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
                Ok(())
            }
            .boxed()
        })
        .policy::<Handshake>(KindPolicy {
            guard: GuardShape::Pending(RetriggerPolicy::Queue),
        });
    let mut h = harness(builder, BridgeConfig::default());
    let moves = h.bridge::<MoveItem>();
    let handshakes = h.bridge::<Handshake>();

    let moved = Arc::new(AtomicUsize::new(0));
    let joined = Arc::new(AtomicUsize::new(0));
    let subject = SubjectId::new();
    let lifetime = LifetimeToken::new();

    assert!(!moves.dispatch_with_continuation(move_envelope(lifetime.clone()), counting_replay(&moved)));
    assert!(!handshakes.dispatch_with_continuation(handshake(subject, 1, lifetime.clone()), counting_replay(&joined)));
    assert!(!handshakes.dispatch_with_continuation(handshake(subject, 2, lifetime), counting_replay(&joined)));

    assert!(h.pump_until(Duration::from_secs(2), || joined.load(Ordering::SeqCst) == 2));
    let stats = h.stats();
    assert_eq!(stats.continuations_created, 3);
    assert_eq!(stats.outstanding_continuations(), 1, "the move is still in flight");
    assert_eq!(moved.load(Ordering::SeqCst), 0);

    assert!(h.pump_until(Duration::from_secs(2), || moved.load(Ordering::SeqCst) == 1));
    assert_eq!(h.stats().outstanding_continuations(), 0);
}

// ---------------------------------------------------------------------------
// Dispatcher modes
// ---------------------------------------------------------------------------

#[test_log::test]
fn test_fire_and_forget_survives_faulting_listener() {
    let ran = Arc::new(Mutex::new(Vec::new()));
    let (first, third) = (ran.clone(), ran.clone());

    let mut builder = RegistryBuilder::new();
    builder
        .on_sync::<Destroyed, _>("first", Priority::HIGH, move |_| {
            first.lock().unwrap().push("first");
            Ok(())
        })
        .on_sync::<Destroyed, _>("faulty", Priority::NORMAL, |_| {
            Err(ListenerError::Failed("database offline".to_string()))
        })
        .on_sync::<Destroyed, _>("third", Priority::LOW, move |_| {
            third.lock().unwrap().push("third");
            Ok(())
        });
    let h = harness(builder, BridgeConfig::default());

    let envelope = Envelope::informational(SubjectId::new(), Destroyed, Verdict::default(), LifetimeToken::new());
    let result = h.dispatcher.dispatch(envelope, DispatchMode::FireAndForget);

    assert!(matches!(result, Ok(true)));
    assert_eq!(*ran.lock().unwrap(), vec!["first", "third"]);
    assert_eq!(h.stats().listener_faults, 1);
    assert_eq!(h.stats().fired, 1);
}

#[test]
fn test_fire_and_forget_finishes_suspended_listeners_in_background() {
    let done = Arc::new(AtomicUsize::new(0));
    let counter = done.clone();

    let mut builder = RegistryBuilder::new();
    builder
        .on_async_fn::<Destroyed, _>("panicky", Priority::HIGH, |_| {
            async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                panic!("listener exploded");
            }
            .boxed()
        })
        .on_async::<Destroyed, _>("audit", Priority::LOW, {
            let (listener, _) = Delayed::new(5, false);
            listener
        })
        .on_sync::<Destroyed, _>("count", Priority::LOWEST, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
    let h = harness(builder, BridgeConfig::default());

    h.dispatcher
        .fire(Envelope::informational(SubjectId::new(), Destroyed, Verdict::default(), LifetimeToken::new()));
    assert_eq!(done.load(Ordering::SeqCst), 0);

    let deadline = Instant::now() + Duration::from_secs(2);
    while done.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(done.load(Ordering::SeqCst), 1);
    assert_eq!(h.stats().listener_faults, 1);
}

#[test]
fn test_decide_rejects_suspension_when_configured() {
    let (listener, _) = Delayed::new(5, false);
    let mut builder = RegistryBuilder::new();
    builder.on_async::<Strike, _>("armor", Priority::NORMAL, listener);
    let h = harness(
        builder,
        BridgeConfig {
            sync_suspend: SyncSuspendPolicy::Reject,
            ..BridgeConfig::default()
        },
    );

    let envelope = Envelope::new(SubjectId::new(), Strike, Verdict::default(), LifetimeToken::new());
    let result = h.dispatcher.dispatch(envelope, DispatchMode::DecisionRequired { allow_async: false });
    assert!(matches!(result, Err(BridgeError::UnexpectedSuspension { .. })));
}

#[test]
fn test_decide_blocks_until_resolved() {
    let (listener, _) = Delayed::new(10, true);
    let mut builder = RegistryBuilder::new();
    builder.on_async::<Strike, _>("armor", Priority::NORMAL, listener);
    let h = harness(
        builder,
        BridgeConfig {
            sync_timeout_ms: 1_000,
            ..BridgeConfig::default()
        },
    );

    let envelope = Envelope::new(SubjectId::new(), Strike, Verdict::default(), LifetimeToken::new());
    let dispatched = h.dispatcher.decide(envelope).unwrap();
    assert!(dispatched.was_suspended());
    assert!(!dispatched.allowed());
    assert_eq!(h.stats().suspended, 1);
}

#[test]
fn test_decide_times_out() {
    let (listener, _) = Delayed::new(500, false);
    let mut builder = RegistryBuilder::new();
    builder.on_async::<Strike, _>("armor", Priority::NORMAL, listener);
    let h = harness(
        builder,
        BridgeConfig {
            sync_timeout_ms: 20,
            ..BridgeConfig::default()
        },
    );

    let envelope = Envelope::new(SubjectId::new(), Strike, Verdict::default(), LifetimeToken::new());
    let result = h.dispatcher.decide(envelope);
    assert!(matches!(result, Err(BridgeError::SyncDispatchTimedOut { timeout_ms: 20, .. })));
}

#[test]
fn test_sync_entry_point_refuses_async_decisions() {
    let h = harness(RegistryBuilder::new(), BridgeConfig::default());
    let envelope = Envelope::new(SubjectId::new(), Strike, Verdict::default(), LifetimeToken::new());
    let result = h.dispatcher.dispatch(envelope, DispatchMode::DecisionRequired { allow_async: true });
    assert!(matches!(result, Err(BridgeError::ContinuationRequired { .. })));
}

// ---------------------------------------------------------------------------
// Walk semantics
// ---------------------------------------------------------------------------

fn dispatcher(builder: RegistryBuilder) -> Dispatcher {
    Dispatcher::new(builder.build(), Handle::current(), BridgeConfig::default())
}

#[tokio::test]
async fn test_allowed_matches_final_outcome() {
    let mut builder = RegistryBuilder::new();
    builder
        .on_sync::<MoveItem, _>("deny", Priority::HIGH, |envelope| {
            envelope.cancel();
            Ok(())
        })
        .on_sync::<MoveItem, _>("override", Priority::LOW, |envelope| {
            envelope.set_cancelled(false);
            Ok(())
        });
    let dispatched = dispatcher(builder).resolve(move_envelope(LifetimeToken::new())).await;

    assert_eq!(dispatched.allowed(), !dispatched.outcome().is_cancelled());
    assert!(dispatched.allowed());
    assert_eq!(dispatched.resolution(), Resolution::Completed);
}

#[tokio::test]
async fn test_terminal_cancel_skips_lower_priorities() {
    let low_ran = Arc::new(AtomicUsize::new(0));
    let counter = low_ran.clone();

    let mut builder = RegistryBuilder::new();
    builder
        .on_sync::<Strike, _>("deny", Priority::HIGH, |envelope| {
            envelope.cancel();
            Ok(())
        })
        .on_sync::<Strike, _>("override", Priority::LOW, move |envelope| {
            counter.fetch_add(1, Ordering::SeqCst);
            envelope.set_cancelled(false);
            Ok(())
        });
    let envelope = Envelope::new(SubjectId::new(), Strike, Verdict::default(), LifetimeToken::new());
    let dispatched = dispatcher(builder).resolve(envelope).await;

    assert!(!dispatched.allowed());
    assert_eq!(dispatched.resolution(), Resolution::ShortCircuited);
    assert_eq!(low_ran.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_final_outcome_stops_walk() {
    let mut builder = RegistryBuilder::new();
    builder
        .on_sync::<MoveItem, _>("lock", Priority::HIGH, |envelope| {
            envelope.outcome_mut().to_slot = 3;
            envelope.finalize();
            Ok(())
        })
        .on_sync::<MoveItem, _>("late", Priority::LOW, |envelope| {
            envelope.outcome_mut().to_slot = 99;
            Ok(())
        });
    let dispatched = dispatcher(builder).resolve(move_envelope(LifetimeToken::new())).await;

    assert_eq!(dispatched.outcome().to_slot, 3);
    assert_eq!(dispatched.resolution(), Resolution::ShortCircuited);
}

#[tokio::test]
async fn test_faulting_listener_changes_are_rolled_back() {
    let mut builder = RegistryBuilder::new();
    builder
        .on_sync::<MoveItem, _>("half-done", Priority::HIGH, |envelope| {
            envelope.outcome_mut().to_slot = 5;
            envelope.cancel();
            Err(ListenerError::Other(anyhow::anyhow!("lost connection mid-update")))
        })
        .on_async_fn::<MoveItem, _>("panicky", Priority::NORMAL, |envelope| {
            async move {
                envelope.outcome_mut().to_slot = 6;
                panic!("listener exploded");
            }
            .boxed()
        });
    let d = dispatcher(builder);
    let dispatched = d.resolve(move_envelope(LifetimeToken::new())).await;

    assert!(dispatched.allowed());
    assert_eq!(dispatched.outcome().to_slot, 0);
    assert_eq!(d.stats().snapshot().listener_faults, 2);
}

#[tokio::test]
async fn test_non_cancellable_cancel_is_reverted() {
    let mut builder = RegistryBuilder::new();
    builder.on_sync::<Destroyed, _>("sneaky", Priority::NORMAL, |envelope| {
        envelope.outcome_mut().verdict_mut().cancelled = true;
        Ok(())
    });
    let envelope = Envelope::informational(SubjectId::new(), Destroyed, Verdict::default(), LifetimeToken::new());
    let dispatched = dispatcher(builder).resolve(envelope).await;

    assert!(dispatched.allowed());
    assert!(!dispatched.outcome().is_cancelled());
}

#[tokio::test]
async fn test_lifetime_checkpoint_abandons_walk() {
    let later_ran = Arc::new(AtomicUsize::new(0));
    let counter = later_ran.clone();

    let mut builder = RegistryBuilder::new();
    builder
        .on_sync::<MoveItem, _>("disconnect", Priority::HIGH, |envelope| {
            envelope.lifetime().cancel();
            Ok(())
        })
        .on_sync::<MoveItem, _>("later", Priority::LOW, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
    let dispatched = dispatcher(builder).resolve(move_envelope(LifetimeToken::new())).await;

    assert_eq!(dispatched.resolution(), Resolution::Abandoned);
    assert!(!dispatched.allowed());
    assert_eq!(later_ran.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_ignore_cancelled_listener_is_skipped() {
    let audited = Arc::new(AtomicUsize::new(0));
    let counter = audited.clone();

    let mut builder = RegistryBuilder::new();
    builder
        .on_sync::<MoveItem, _>("deny", Priority::HIGH, |envelope| {
            envelope.cancel();
            Ok(())
        })
        .on_sync::<MoveItem, _>("audit", Priority::LOWEST, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .ignoring_cancelled::<MoveItem>("audit");
    let dispatched = dispatcher(builder).resolve(move_envelope(LifetimeToken::new())).await;

    assert!(!dispatched.allowed());
    assert_eq!(audited.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_child_deadline_cancels_outstanding_walk() {
    let (listener, _) = Delayed::new(30, false);
    let later_ran = Arc::new(AtomicUsize::new(0));
    let counter = later_ran.clone();

    let mut builder = RegistryBuilder::new();
    builder
        .on_async::<MoveItem, _>("slow", Priority::HIGH, listener)
        .on_sync::<MoveItem, _>("later", Priority::LOW, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

    let session = LifetimeToken::new();
    let per_dispatch = session.child_with_deadline(&Handle::current(), Duration::from_millis(5));
    let dispatched = dispatcher(builder).resolve(move_envelope(per_dispatch)).await;

    assert_eq!(dispatched.resolution(), Resolution::Abandoned);
    assert_eq!(later_ran.load(Ordering::SeqCst), 0);
    assert!(!session.is_cancelled());
}
