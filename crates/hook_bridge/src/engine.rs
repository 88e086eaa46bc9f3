//! Engine-thread marshalling.
//!
//! The engine drives every interception point from one thread and never
//! blocks on I/O. Work produced elsewhere (a resolved continuation, an async
//! listener that needs to read engine state) is posted to an [`EngineQueue`]
//! and executed when the engine thread drains it, typically once per tick.

use crate::error::{panic_message, BridgeError};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::thread::{self, ThreadId};
use tokio::sync::{mpsc, oneshot};
use tracing::{error, warn};

/// A unit of work that must run on the engine thread.
pub type EngineTask = Box<dyn FnOnce() + Send + 'static>;

/// Creates a queue bound to the calling thread, which becomes the engine
/// thread, plus a cloneable handle for posting to it.
pub fn engine_channel() -> (EngineHandle, EngineQueue) {
    let (sender, receiver) = mpsc::unbounded_channel();
    let thread = thread::current().id();
    (
        EngineHandle { sender, thread },
        EngineQueue { receiver, thread },
    )
}

/// Posts work onto the engine thread from anywhere.
#[derive(Debug, Clone)]
pub struct EngineHandle {
    sender: mpsc::UnboundedSender<EngineTask>,
    thread: ThreadId,
}

impl EngineHandle {
    /// True when called from the engine thread.
    #[inline]
    pub fn is_engine_thread(&self) -> bool {
        thread::current().id() == self.thread
    }

    /// Queues `task` for the engine thread's next drain.
    pub fn post<F>(&self, task: F) -> Result<(), BridgeError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.sender
            .send(Box::new(task))
            .map_err(|_| BridgeError::EngineQueueClosed)
    }

    /// Runs `f` on the engine thread and waits for its result.
    ///
    /// Async listeners use this to read or touch engine state. Do not call it
    /// from a listener of a synchronous decision dispatch: the engine thread
    /// is blocked on that dispatch and cannot drain its queue.
    pub async fn call<T, F>(&self, f: F) -> Result<T, BridgeError>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.post(move || {
            let _ = tx.send(f());
        })?;
        rx.await.map_err(|_| BridgeError::EngineTaskDropped)
    }
}

/// The engine thread's end of the channel.
#[derive(Debug)]
pub struct EngineQueue {
    receiver: mpsc::UnboundedReceiver<EngineTask>,
    thread: ThreadId,
}

impl EngineQueue {
    /// Runs every task queued so far and returns how many ran.
    ///
    /// Tasks posted while draining run in the same call. A panicking task is
    /// logged and does not stop the drain.
    pub fn run_pending(&mut self) -> usize {
        if thread::current().id() != self.thread {
            warn!("⚠️ Engine queue drained off the engine thread");
        }

        let mut ran = 0;
        while let Ok(task) = self.receiver.try_recv() {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(task)) {
                error!("❌ Engine task panicked: {}", panic_message(payload));
            }
            ran += 1;
        }
        ran
    }
}
