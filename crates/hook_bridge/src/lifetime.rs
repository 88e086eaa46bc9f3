//! Composable cancellation signals bound to a subject's lifetime.
//!
//! A [`LifetimeToken`] is cancelled when the thing it is bound to goes away:
//! the process (shutdown), a subject's session (disconnect, destruction) or a
//! single dispatch (deadline). Tokens form a tree; cancelling a token cancels
//! every token derived from it, never its parent.
//!
//! The dispatcher never polls a "still connected" flag. It checks the token at
//! well defined checkpoints: before each listener starts and when a
//! continuation is consumed.

use crate::event::SubjectId;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::debug;

/// Cancellation signal tied to the lifetime of a process, session or dispatch.
#[derive(Debug, Clone, Default)]
pub struct LifetimeToken {
    inner: Arc<TokenInner>,
}

#[derive(Debug, Default)]
struct TokenInner {
    cancelled: AtomicBool,
    notify: Notify,
    children: Mutex<Vec<Weak<TokenInner>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl TokenInner {
    fn cancel(&self) {
        // The flag must be set before the children are taken so that a
        // concurrent `child()` either sees the flag or lands in the list.
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        self.notify.notify_waiters();

        let children = std::mem::take(&mut *lock(&self.children));
        for child in children {
            if let Some(child) = child.upgrade() {
                child.cancel();
            }
        }
    }
}

impl LifetimeToken {
    /// Creates a new root token that is not cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true once the token (or any of its ancestors) has been cancelled.
    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Cancels this token and every token derived from it.
    pub fn cancel(&self) {
        self.inner.cancel();
    }

    /// Derives a child token. The child is cancelled together with this token
    /// but can also be cancelled on its own.
    pub fn child(&self) -> Self {
        let child = Arc::new(TokenInner::default());
        {
            let mut children = lock(&self.inner.children);
            if self.is_cancelled() {
                child.cancelled.store(true, Ordering::Release);
            } else {
                children.retain(|weak| weak.strong_count() > 0);
                children.push(Arc::downgrade(&child));
            }
        }
        Self { inner: child }
    }

    /// Derives a child token that additionally cancels itself after `deadline`.
    ///
    /// The timer runs on `runtime`; it stops early if the child is cancelled
    /// by other means.
    pub fn child_with_deadline(&self, runtime: &tokio::runtime::Handle, deadline: Duration) -> Self {
        let child = self.child();
        let timer = child.clone();
        runtime.spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(deadline) => {
                    debug!("⏰ Lifetime deadline of {:?} reached", deadline);
                    timer.cancel();
                }
                _ = timer.cancelled() => {}
            }
        });
        child
    }

    /// Resolves once the token is cancelled.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// Per-subject session tokens derived from a common parent.
///
/// Adapters call [`SessionTokens::begin`] when a subject appears and
/// [`SessionTokens::end`] when it disconnects or is destroyed. Every envelope
/// concerning that subject carries the session token (or a child of it).
#[derive(Debug)]
pub struct SessionTokens {
    parent: LifetimeToken,
    sessions: DashMap<SubjectId, LifetimeToken>,
}

impl SessionTokens {
    /// Creates an empty session table whose tokens derive from `parent`.
    pub fn new(parent: LifetimeToken) -> Self {
        Self {
            parent,
            sessions: DashMap::new(),
        }
    }

    /// Starts (or restarts) the session for `subject` and returns its token.
    ///
    /// Restarting cancels the previous session's token first.
    pub fn begin(&self, subject: SubjectId) -> LifetimeToken {
        let token = self.parent.child();
        if let Some(previous) = self.sessions.insert(subject, token.clone()) {
            previous.cancel();
        }
        token
    }

    /// Returns the live token for `subject`, if it has a session.
    pub fn get(&self, subject: SubjectId) -> Option<LifetimeToken> {
        self.sessions.get(&subject).map(|entry| entry.value().clone())
    }

    /// Ends the session for `subject`, cancelling its token.
    ///
    /// Returns false if the subject had no session.
    pub fn end(&self, subject: SubjectId) -> bool {
        match self.sessions.remove(&subject) {
            Some((_, token)) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
