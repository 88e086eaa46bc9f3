//! # Event Envelopes and Outcomes
//!
//! An [`Envelope`] describes one intercepted occurrence: an immutable identity
//! (event id, subject, the event's parameters) plus the mutable [`Outcome`]
//! listeners are allowed to change.
//!
//! ## Event Kinds
//!
//! Every kind of occurrence is a type implementing [`EventKind`]. The kind
//! names its outcome shape, so the dispatcher stays generic over outcomes and
//! never inspects fields it does not know about. The only fields the
//! dispatcher reads are the ones in [`Verdict`].
//!
//! ```rust
//! use hook_bridge::{CancelPolicy, EventKind, Outcome, Verdict};
//!
//! #[derive(Debug)]
//! struct ItemMoved {
//!     from_slot: u32,
//! }
//!
//! #[derive(Debug, Clone, Default)]
//! struct ItemMovedOutcome {
//!     verdict: Verdict,
//!     to_slot: u32,
//! }
//!
//! impl Outcome for ItemMovedOutcome {
//!     fn verdict(&self) -> &Verdict { &self.verdict }
//!     fn verdict_mut(&mut self) -> &mut Verdict { &mut self.verdict }
//! }
//!
//! impl EventKind for ItemMoved {
//!     const NAME: &'static str = "inventory:item_moved";
//!     const CANCEL_POLICY: CancelPolicy = CancelPolicy::Terminal;
//!     type Outcome = ItemMovedOutcome;
//! }
//! ```

use crate::lifetime::LifetimeToken;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Opaque reference to the actor or object an event concerns.
///
/// Envelopes hold the id, never the subject itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubjectId(pub Uuid);

impl SubjectId {
    /// Creates a new random subject id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SubjectId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of one envelope: its kind plus a unique instance id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventId {
    kind: &'static str,
    instance: Uuid,
}

impl EventId {
    fn new(kind: &'static str) -> Self {
        Self {
            kind,
            instance: Uuid::new_v4(),
        }
    }

    /// The event kind name, as declared by [`EventKind::NAME`].
    pub fn kind(&self) -> &'static str {
        self.kind
    }

    pub fn instance(&self) -> Uuid {
        self.instance
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.kind, self.instance)
    }
}

/// What happens to lower-priority listeners once an envelope is cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CancelPolicy {
    /// Remaining listeners still run and may un-cancel.
    Continue,
    /// Cancellation ends the walk.
    Terminal,
}

/// The decision fields shared by every outcome shape.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    /// The original operation must not happen.
    pub cancelled: bool,
    /// A listener locked the decision; the walk ends after it.
    pub is_final: bool,
}

/// Mutable record of everything a listener may legally change for one kind.
///
/// Outcomes are cloned before each listener runs so a faulting listener's
/// changes can be discarded.
pub trait Outcome: Clone + Send + Sync + fmt::Debug + 'static {
    fn verdict(&self) -> &Verdict;

    fn verdict_mut(&mut self) -> &mut Verdict;

    #[inline]
    fn is_cancelled(&self) -> bool {
        self.verdict().cancelled
    }

    #[inline]
    fn is_final(&self) -> bool {
        self.verdict().is_final
    }
}

/// Kinds whose only outcome is the decision itself can use [`Verdict`] directly.
impl Outcome for Verdict {
    fn verdict(&self) -> &Verdict {
        self
    }

    fn verdict_mut(&mut self) -> &mut Verdict {
        self
    }
}

/// A kind of intercepted occurrence.
///
/// The implementing type carries the event's immutable parameters.
pub trait EventKind: Send + Sync + fmt::Debug + 'static {
    /// Stable name used for logging and diagnostics.
    const NAME: &'static str;

    /// Default cancellation policy for envelopes of this kind.
    const CANCEL_POLICY: CancelPolicy = CancelPolicy::Continue;

    /// Mutable outcome shape for this kind.
    type Outcome: Outcome;
}

/// One occurrence submitted to the dispatcher.
///
/// An envelope is dispatched exactly once: dispatching consumes it and hands
/// back a read-only [`Dispatched`](crate::Dispatched).
#[derive(Debug)]
pub struct Envelope<E: EventKind> {
    id: EventId,
    subject: SubjectId,
    event: E,
    outcome: E::Outcome,
    cancellable: bool,
    cancel_policy: CancelPolicy,
    lifetime: LifetimeToken,
}

impl<E: EventKind> Envelope<E> {
    /// Creates a cancellable envelope.
    pub fn new(subject: SubjectId, event: E, outcome: E::Outcome, lifetime: LifetimeToken) -> Self {
        Self {
            id: EventId::new(E::NAME),
            subject,
            event,
            outcome,
            cancellable: true,
            cancel_policy: E::CANCEL_POLICY,
            lifetime,
        }
    }

    /// Creates an informational envelope that listeners cannot cancel.
    pub fn informational(
        subject: SubjectId,
        event: E,
        outcome: E::Outcome,
        lifetime: LifetimeToken,
    ) -> Self {
        Self {
            cancellable: false,
            ..Self::new(subject, event, outcome, lifetime)
        }
    }

    /// Overrides the kind's default cancellation policy for this envelope.
    pub fn with_cancel_policy(mut self, policy: CancelPolicy) -> Self {
        self.cancel_policy = policy;
        self
    }

    #[inline]
    pub fn id(&self) -> EventId {
        self.id
    }

    #[inline]
    pub fn subject(&self) -> SubjectId {
        self.subject
    }

    /// The event's immutable parameters.
    #[inline]
    pub fn event(&self) -> &E {
        &self.event
    }

    #[inline]
    pub fn outcome(&self) -> &E::Outcome {
        &self.outcome
    }

    /// Mutable access to the outcome. Only reachable while the dispatcher
    /// holds the envelope.
    #[inline]
    pub fn outcome_mut(&mut self) -> &mut E::Outcome {
        &mut self.outcome
    }

    #[inline]
    pub fn cancellable(&self) -> bool {
        self.cancellable
    }

    #[inline]
    pub fn cancel_policy(&self) -> CancelPolicy {
        self.cancel_policy
    }

    #[inline]
    pub fn lifetime(&self) -> &LifetimeToken {
        &self.lifetime
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.outcome.is_cancelled()
    }

    /// Sets the cancelled flag. Returns false, leaving the flag untouched,
    /// if the envelope is not cancellable.
    pub fn set_cancelled(&mut self, cancelled: bool) -> bool {
        if !self.cancellable {
            return false;
        }
        self.outcome.verdict_mut().cancelled = cancelled;
        true
    }

    /// Vetoes the original operation.
    pub fn cancel(&mut self) -> bool {
        self.set_cancelled(true)
    }

    /// Locks the current decision; no further listener runs.
    pub fn finalize(&mut self) {
        self.outcome.verdict_mut().is_final = true;
    }

    pub(crate) fn replace_outcome(&mut self, outcome: E::Outcome) {
        self.outcome = outcome;
    }

    pub(crate) fn force_cancelled(&mut self, cancelled: bool) {
        self.outcome.verdict_mut().cancelled = cancelled;
    }
}
