//! Lifecycle events carried on the daemon's queue.
//!
//! The queue is a bounded multi-producer, single-consumer FIFO: the runtime
//! watcher, the reconcile timer and the shutdown handler all produce; only
//! the [`System`](crate::system::System) loop consumes. Events for the same
//! container id are processed in the order the watcher emitted them.

use tokio::sync::mpsc;

/// A message on the event queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A container started; fetch its metadata and publish its records.
    Started { id: String },
    /// A stop was requested; remember the intent, mutate nothing yet.
    Stopped { id: String },
    /// A container's main process exited.
    Died { id: String, exit_code: i64 },
    /// A container was deleted from the runtime.
    Removed { id: String },
    /// Run a full reconciliation pass against every backend.
    ReconcileAll,
    /// Withdraw every tracked record and the shared discovery records.
    SuppressAll,
    /// Leave the event loop.
    Terminate,
}

impl Event {
    /// Metrics label for this event.
    pub fn kind(&self) -> &'static str {
        match self {
            Event::Started { .. } => "started",
            Event::Stopped { .. } => "stopped",
            Event::Died { .. } => "died",
            Event::Removed { .. } => "removed",
            Event::ReconcileAll => "reconcile_all",
            Event::SuppressAll => "suppress_all",
            Event::Terminate => "terminate",
        }
    }
}

pub type EventSender = mpsc::Sender<Event>;
pub type EventReceiver = mpsc::Receiver<Event>;

/// Create the bounded event queue.
pub fn queue(depth: usize) -> (EventSender, EventReceiver) {
    mpsc::channel(depth.max(1))
}
