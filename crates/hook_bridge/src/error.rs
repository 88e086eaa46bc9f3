//! Error types for the hook bridge.
//!
//! Only [`BridgeError`] ever reaches an adapter, and only from the synchronous
//! decision entry points. Listener and replay faults are logged and absorbed
//! by the dispatcher and the continuation boundary respectively.

/// Errors surfaced to adapters by the dispatcher and the bridge.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// A synchronous decision dispatch suspended while the configured policy
    /// forbids blocking the engine thread.
    #[error("Dispatch of {event} suspended in a synchronous decision context")]
    UnexpectedSuspension { event: String },

    /// A synchronous decision dispatch blocked longer than allowed.
    #[error("Dispatch of {event} did not resolve within {timeout_ms}ms")]
    SyncDispatchTimedOut { event: String, timeout_ms: u64 },

    /// `allow_async = true` was requested from a synchronous entry point.
    #[error("Dispatch of {event} may suspend and must go through the continuation bridge")]
    ContinuationRequired { event: String },

    /// A replay tried to enter a guard that is already held.
    #[error("Guard for {kind} is already held")]
    GuardViolation { kind: &'static str },

    /// The engine thread dropped its queue.
    #[error("Engine queue is closed")]
    EngineQueueClosed,

    /// A task posted to the engine thread was dropped before it produced a result.
    #[error("Engine task was dropped before completion")]
    EngineTaskDropped,
}

/// Faults raised by a listener while handling an envelope.
///
/// A faulting listener has "no opinion": its changes to the outcome are
/// rolled back and the walk continues with the next listener.
#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    /// The listener refused to handle the envelope.
    #[error("Listener rejected the event: {0}")]
    Rejected(String),

    /// The listener failed while handling the envelope.
    #[error("Listener failed: {0}")]
    Failed(String),

    /// Any other error bubbled up from listener code.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Faults raised while replaying the original operation from a continuation.
#[derive(Debug, thiserror::Error)]
pub enum ReplayError {
    #[error("Replay failed: {0}")]
    Failed(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Converts a caught panic payload into a readable message.
pub(crate) fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panicked with unknown payload".to_string()
    }
}
