//! Listener registration and type-indexed resolution.
//!
//! Listeners are registered once at startup through a [`RegistryBuilder`] and
//! frozen into a [`ListenerRegistry`]. The frozen registry is immutable, so
//! the dispatcher reads it from any thread without locking.

use crate::error::ListenerError;
use crate::event::{Envelope, EventKind};
use crate::guard::RetriggerPolicy;
use async_trait::async_trait;
use compact_str::CompactString;
use futures::future::BoxFuture;
use smallvec::SmallVec;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::info;

/// Listener ordering. Higher priorities run first; equal priorities run in
/// registration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Priority(pub i32);

impl Priority {
    pub const LOWEST: Priority = Priority(-200);
    pub const LOW: Priority = Priority(-100);
    pub const NORMAL: Priority = Priority(0);
    pub const HIGH: Priority = Priority(100);
    pub const HIGHEST: Priority = Priority(200);
}

impl Default for Priority {
    fn default() -> Self {
        Self::NORMAL
    }
}

/// A listener that may suspend (permission checks, cooldown lookups,
/// database round-trips).
///
/// Anything that touches engine state must be marshalled back through
/// [`EngineHandle::call`](crate::EngineHandle::call).
#[async_trait]
pub trait Listener<E: EventKind>: Send + Sync + 'static {
    async fn handle(&self, envelope: &mut Envelope<E>) -> Result<(), ListenerError>;
}

/// Signature of a listener that must complete without suspending.
pub type SyncHandlerFn<E> = dyn Fn(&mut Envelope<E>) -> Result<(), ListenerError> + Send + Sync;

/// The two handler capabilities. The dispatcher awaits both uniformly.
pub enum Handler<E: EventKind> {
    Sync(Arc<SyncHandlerFn<E>>),
    Async(Arc<dyn Listener<E>>),
}

impl<E: EventKind> Clone for Handler<E> {
    fn clone(&self) -> Self {
        match self {
            Handler::Sync(f) => Handler::Sync(f.clone()),
            Handler::Async(l) => Handler::Async(l.clone()),
        }
    }
}

impl<E: EventKind> fmt::Debug for Handler<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Handler::Sync(_) => f.write_str("Handler::Sync"),
            Handler::Async(_) => f.write_str("Handler::Async"),
        }
    }
}

/// Adapts an async closure into a [`Listener`].
struct FnListener<E, F> {
    handler: F,
    _phantom: PhantomData<fn(E)>,
}

#[async_trait]
impl<E, F> Listener<E> for FnListener<E, F>
where
    E: EventKind,
    F: for<'a> Fn(&'a mut Envelope<E>) -> BoxFuture<'a, Result<(), ListenerError>> + Send + Sync + 'static,
{
    async fn handle(&self, envelope: &mut Envelope<E>) -> Result<(), ListenerError> {
        (self.handler)(envelope).await
    }
}

/// One registered listener.
#[derive(Debug)]
pub struct Registration<E: EventKind> {
    name: CompactString,
    priority: Priority,
    ignore_cancelled: bool,
    handler: Handler<E>,
}

impl<E: EventKind> Registration<E> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    /// Skip this listener when the envelope is already cancelled.
    pub fn ignore_cancelled(&self) -> bool {
        self.ignore_cancelled
    }

    pub fn handler(&self) -> &Handler<E> {
        &self.handler
    }
}

/// Which guard protects an event kind against re-entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardShape {
    /// A scoped flag held while the original operation is replayed.
    Flag,
    /// A keyed set of subjects with an outstanding decision. A second trigger
    /// for the same subject is handled according to the retrigger policy.
    Pending(RetriggerPolicy),
}

/// Per-kind settings declared at registration time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KindPolicy {
    pub guard: GuardShape,
}

impl Default for KindPolicy {
    fn default() -> Self {
        Self {
            guard: GuardShape::Flag,
        }
    }
}

struct KindEntry<E: EventKind> {
    policy: KindPolicy,
    listeners: SmallVec<[Registration<E>; 4]>,
}

impl<E: EventKind> Default for KindEntry<E> {
    fn default() -> Self {
        Self {
            policy: KindPolicy::default(),
            listeners: SmallVec::new(),
        }
    }
}

/// Collects listener registrations at startup.
#[derive(Default)]
pub struct RegistryBuilder {
    kinds: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
    names: HashMap<TypeId, &'static str>,
    total_listeners: usize,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// The entry for kind `E`. Entries are keyed by their own `TypeId`, so
    /// the downcast only fails if that keying is broken.
    fn entry<E: EventKind>(&mut self) -> Option<&mut KindEntry<E>> {
        self.names.insert(TypeId::of::<E>(), E::NAME);
        self.kinds
            .entry(TypeId::of::<E>())
            .or_insert_with(|| Box::new(KindEntry::<E>::default()))
            .downcast_mut::<KindEntry<E>>()
    }

    fn insert<E: EventKind>(&mut self, registration: Registration<E>) -> &mut Self {
        let Some(entry) = self.entry::<E>() else {
            return self;
        };
        let listeners = &mut entry.listeners;
        // Keep the list sorted: after every listener of equal or higher priority.
        let position = listeners
            .iter()
            .position(|existing| existing.priority < registration.priority)
            .unwrap_or(listeners.len());
        info!(
            "📝 Registered listener '{}' for {} at priority {}",
            registration.name, E::NAME, registration.priority.0
        );
        listeners.insert(position, registration);
        self.total_listeners += 1;
        self
    }

    /// Registers a listener that completes without suspending.
    pub fn on_sync<E, F>(&mut self, name: &str, priority: Priority, handler: F) -> &mut Self
    where
        E: EventKind,
        F: Fn(&mut Envelope<E>) -> Result<(), ListenerError> + Send + Sync + 'static,
    {
        self.insert(Registration {
            name: CompactString::new(name),
            priority,
            ignore_cancelled: false,
            handler: Handler::Sync(Arc::new(handler)),
        })
    }

    /// Registers a listener that may suspend.
    pub fn on_async<E, L>(&mut self, name: &str, priority: Priority, listener: L) -> &mut Self
    where
        E: EventKind,
        L: Listener<E>,
    {
        self.insert(Registration {
            name: CompactString::new(name),
            priority,
            ignore_cancelled: false,
            handler: Handler::Async(Arc::new(listener)),
        })
    }

    /// Registers an async closure as a listener.
    ///
    /// ```rust,no_run
    /// use futures::FutureExt;
    /// use hook_bridge::{Priority, RegistryBuilder, Verdict, EventKind};
    ///
    /// #[derive(Debug)]
    /// struct Join;
    /// impl EventKind for Join {
    ///     const NAME: &'static str = "session:join";
    ///     type Outcome = Verdict;
    /// }
    ///
    /// let mut builder = RegistryBuilder::new();
    /// builder.on_async_fn::<Join, _>("whitelist", Priority::HIGH, |envelope| {
    ///     async move {
    ///         tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    ///         envelope.cancel();
    ///         Ok(())
    ///     }
    ///     .boxed()
    /// });
    /// ```
    pub fn on_async_fn<E, F>(&mut self, name: &str, priority: Priority, handler: F) -> &mut Self
    where
        E: EventKind,
        F: for<'a> Fn(&'a mut Envelope<E>) -> BoxFuture<'a, Result<(), ListenerError>> + Send + Sync + 'static,
    {
        self.on_async(
            name,
            priority,
            FnListener {
                handler,
                _phantom: PhantomData,
            },
        )
    }

    /// Marks the listeners of kind `E` registered under `name` as skipped
    /// for envelopes that are already cancelled.
    pub fn ignoring_cancelled<E: EventKind>(&mut self, name: &str) -> &mut Self {
        if let Some(entry) = self.entry::<E>() {
            for registration in entry.listeners.iter_mut().filter(|r| r.name == name) {
                registration.ignore_cancelled = true;
            }
        }
        self
    }

    /// Declares the guard policy for kind `E`.
    pub fn policy<E: EventKind>(&mut self, policy: KindPolicy) -> &mut Self {
        if let Some(entry) = self.entry::<E>() {
            entry.policy = policy;
        }
        self
    }

    /// Freezes the registrations.
    pub fn build(self) -> ListenerRegistry {
        info!(
            "🔒 Listener registry frozen: {} listeners across {} event kinds",
            self.total_listeners,
            self.kinds.len()
        );
        ListenerRegistry {
            kinds: self.kinds,
            names: self.names,
            total_listeners: self.total_listeners,
        }
    }
}

/// Immutable, type-indexed store of listeners.
pub struct ListenerRegistry {
    kinds: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
    names: HashMap<TypeId, &'static str>,
    total_listeners: usize,
}

impl fmt::Debug for ListenerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerRegistry")
            .field("kinds", &self.kind_names())
            .field("total_listeners", &self.total_listeners)
            .finish()
    }
}

impl ListenerRegistry {
    /// An empty registry.
    pub fn empty() -> Self {
        RegistryBuilder::new().build()
    }

    fn entry<E: EventKind>(&self) -> Option<&KindEntry<E>> {
        self.kinds
            .get(&TypeId::of::<E>())
            .and_then(|entry| entry.downcast_ref::<KindEntry<E>>())
    }

    /// Listeners for kind `E`, in walk order.
    pub fn resolve<E: EventKind>(&self) -> &[Registration<E>] {
        self.entry::<E>()
            .map(|entry| entry.listeners.as_slice())
            .unwrap_or(&[])
    }

    /// The declared policy for kind `E`, or the default (flag guard).
    pub fn policy<E: EventKind>(&self) -> KindPolicy {
        self.entry::<E>().map(|entry| entry.policy).unwrap_or_default()
    }

    pub fn total_listeners(&self) -> usize {
        self.total_listeners
    }

    /// Names of all kinds with registrations or policies.
    pub fn kind_names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.names.values().copied().collect();
        names.sort_unstable();
        names
    }
}
