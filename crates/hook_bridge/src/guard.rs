//! Reentrancy and pending guards.
//!
//! Two guard shapes keep a replayed operation from being mistaken for a fresh
//! trigger:
//!
//! * [`FlagGuard`] is held while a continuation replays the original
//!   operation. The interception point checks it first and lets the call
//!   through untouched while it is held.
//! * [`PendingSet`] tracks subjects whose decision is still outstanding, for
//!   kinds where the remote side may legally trigger again before the first
//!   decision resolves (handshake retries and the like).
//!
//! [`ReplayOrder`] sits behind both: continuation records for one subject are
//! consumed in the order their calls occurred, whichever walk finishes first.

use crate::error::BridgeError;
use crate::event::SubjectId;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// Scoped "replay in progress" marker for one event kind.
#[derive(Debug, Clone)]
pub struct FlagGuard {
    kind: &'static str,
    held: Arc<AtomicBool>,
}

impl FlagGuard {
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            held: Arc::new(AtomicBool::new(false)),
        }
    }

    /// True while a replay for this kind is running.
    #[inline]
    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::Acquire)
    }

    /// Acquires the guard for the duration of the returned scope.
    ///
    /// Fails with [`BridgeError::GuardViolation`] if the guard is already
    /// held; proceeding would recurse into the replay.
    pub fn enter(&self) -> Result<GuardScope, BridgeError> {
        self.held
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| BridgeError::GuardViolation { kind: self.kind })?;
        Ok(GuardScope {
            held: self.held.clone(),
        })
    }
}

/// Releases its [`FlagGuard`] when dropped, including during unwinding.
#[derive(Debug)]
pub struct GuardScope {
    held: Arc<AtomicBool>,
}

impl Drop for GuardScope {
    fn drop(&mut self) {
        self.held.store(false, Ordering::Release);
    }
}

/// What to do with a second trigger for a subject whose decision is pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetriggerPolicy {
    /// Deny the second trigger outright.
    Suppress,
    /// Hold the second trigger and resubmit it once the first resolves.
    Queue,
}

/// A deferred trigger, resubmitted on the engine thread.
pub type Retrigger = Box<dyn FnOnce() + Send + 'static>;

struct PendingEntry {
    generation: u64,
    // Mutex only to make the entry Sync; it is accessed through `&mut`.
    queued: Mutex<VecDeque<Retrigger>>,
}

/// Result of asking the pending set to admit a trigger.
///
/// `T` is the trigger's payload. It is handed back only on admission; a
/// queued payload now lives in the set and a denied one is dropped.
pub enum Admission<T> {
    /// First trigger for the subject; the ticket must be released exactly once.
    Admitted(PendingTicket, T),
    /// A decision is already pending; this trigger is denied.
    Suppressed,
    /// A decision is already pending; this trigger was queued behind it.
    Queued,
    /// A decision is already pending and the queue is full; this trigger is denied.
    QueueFull,
}

impl<T> fmt::Debug for Admission<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Admission::Admitted(ticket, _) => f.debug_tuple("Admitted").field(ticket).finish(),
            Admission::Suppressed => f.write_str("Suppressed"),
            Admission::Queued => f.write_str("Queued"),
            Admission::QueueFull => f.write_str("QueueFull"),
        }
    }
}

/// Subjects with an outstanding decision for one event kind.
#[derive(Clone)]
pub struct PendingSet {
    kind: &'static str,
    entries: Arc<DashMap<SubjectId, PendingEntry>>,
    next_generation: Arc<AtomicU64>,
    max_queued: usize,
}

impl fmt::Debug for PendingSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingSet")
            .field("kind", &self.kind)
            .field("pending", &self.entries.len())
            .field("max_queued", &self.max_queued)
            .finish()
    }
}

impl PendingSet {
    pub fn new(kind: &'static str, max_queued: usize) -> Self {
        Self {
            kind,
            entries: Arc::new(DashMap::new()),
            next_generation: Arc::new(AtomicU64::new(1)),
            max_queued,
        }
    }

    /// Admits a trigger for `subject`, or applies `policy` if one is already
    /// pending. Under [`RetriggerPolicy::Queue`] the payload is turned into a
    /// [`Retrigger`] with `defer` and parked until the pending decision is
    /// released.
    pub fn admit<T, F>(&self, subject: SubjectId, policy: RetriggerPolicy, payload: T, defer: F) -> Admission<T>
    where
        F: FnOnce(T) -> Retrigger,
    {
        match self.entries.entry(subject) {
            Entry::Occupied(mut occupied) => match policy {
                RetriggerPolicy::Suppress => Admission::Suppressed,
                RetriggerPolicy::Queue => {
                    let queued = occupied
                        .get_mut()
                        .queued
                        .get_mut()
                        .unwrap_or_else(PoisonError::into_inner);
                    if queued.len() >= self.max_queued {
                        Admission::QueueFull
                    } else {
                        queued.push_back(defer(payload));
                        Admission::Queued
                    }
                }
            },
            Entry::Vacant(vacant) => {
                let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
                vacant.insert(PendingEntry {
                    generation,
                    queued: Mutex::new(VecDeque::new()),
                });
                let ticket = PendingTicket {
                    set: self.clone(),
                    subject,
                    generation,
                };
                Admission::Admitted(ticket, payload)
            }
        }
    }

    pub fn kind(&self) -> &'static str {
        self.kind
    }

    #[inline]
    pub fn is_pending(&self, subject: SubjectId) -> bool {
        self.entries.contains_key(&subject)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Proof that a subject was admitted to a [`PendingSet`].
///
/// Clones share the same entry; whichever clone releases first removes it and
/// later releases are no-ops. A newer admission for the same subject is never
/// touched by a stale ticket.
#[derive(Clone)]
pub struct PendingTicket {
    set: PendingSet,
    subject: SubjectId,
    generation: u64,
}

impl fmt::Debug for PendingTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingTicket")
            .field("kind", &self.set.kind)
            .field("subject", &self.subject)
            .field("generation", &self.generation)
            .finish()
    }
}

impl PendingTicket {
    pub fn subject(&self) -> SubjectId {
        self.subject
    }

    /// Removes the entry and hands back any queued retriggers, in arrival
    /// order. Returns `None` if the entry was already released.
    pub fn release(&self) -> Option<VecDeque<Retrigger>> {
        self.set
            .entries
            .remove_if(&self.subject, |_, entry| entry.generation == self.generation)
            .map(|(_, entry)| entry.queued.into_inner().unwrap_or_else(PoisonError::into_inner))
    }
}

/// A continuation record's consumer, run on the engine thread.
pub type Consumer = Box<dyn FnOnce() + Send + 'static>;

#[derive(Default)]
struct Lane {
    next: u64,
    head: u64,
    // Mutex only to make the lane Sync; it is accessed through `&mut`.
    ready: Mutex<BTreeMap<u64, Consumer>>,
}

/// Per-subject FIFO of continuation records for one event kind.
///
/// A record reserves its place when its call is denied and completes when its
/// walk resolves. Completed records are handed out only once every earlier
/// record for the same subject has been handed out.
#[derive(Clone)]
pub struct ReplayOrder {
    kind: &'static str,
    lanes: Arc<DashMap<SubjectId, Lane>>,
}

impl fmt::Debug for ReplayOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplayOrder")
            .field("kind", &self.kind)
            .field("subjects", &self.lanes.len())
            .finish()
    }
}

/// A reserved place in a subject's [`ReplayOrder`] lane.
#[derive(Debug)]
#[must_use = "a reserved slot blocks later records until it is completed"]
pub struct OrderSlot {
    subject: SubjectId,
    seq: u64,
}

impl OrderSlot {
    pub fn subject(&self) -> SubjectId {
        self.subject
    }
}

impl ReplayOrder {
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            lanes: Arc::new(DashMap::new()),
        }
    }

    /// Takes the next place in `subject`'s lane.
    pub fn reserve(&self, subject: SubjectId) -> OrderSlot {
        let mut lane = self.lanes.entry(subject).or_default();
        let seq = lane.next;
        lane.next += 1;
        OrderSlot { subject, seq }
    }

    /// True while `subject` has records that were reserved but not handed out.
    #[inline]
    pub fn is_waiting(&self, subject: SubjectId) -> bool {
        self.lanes.contains_key(&subject)
    }

    /// Number of subjects with records in flight.
    pub fn len(&self) -> usize {
        self.lanes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lanes.is_empty()
    }

    /// Completes `slot` with its consumer and returns every consumer now at
    /// the head of the lane, oldest first.
    ///
    /// The caller runs them after this returns; consumers may reserve again.
    pub fn complete(&self, slot: OrderSlot, consumer: Consumer) -> Vec<Consumer> {
        let Entry::Occupied(mut occupied) = self.lanes.entry(slot.subject) else {
            // Lane already gone: nothing can be ahead of this record.
            return vec![consumer];
        };

        let lane = occupied.get_mut();
        let head = lane.head;
        let ready = lane.ready.get_mut().unwrap_or_else(PoisonError::into_inner);
        ready.insert(slot.seq, consumer);

        let mut runnable = Vec::new();
        let mut next_head = head;
        while let Some(consumer) = ready.remove(&next_head) {
            runnable.push(consumer);
            next_head += 1;
        }
        let drained = ready.is_empty();
        lane.head = next_head;

        if drained && lane.head == lane.next {
            occupied.remove();
        }
        runnable
    }
}
