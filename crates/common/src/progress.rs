//! Progress reporting
//!
//! The pipeline pushes point-in-time status to a [`ProgressObserver`] after
//! every unit. Observers must not block and must tolerate lost or stale
//! events; nothing they do feeds back into the pipeline.
//!
//! [`ChannelObserver`] forwards events over an unbounded channel so an
//! observer running on its own thread can drain them at its own pace.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Which half of the transfer an event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Downloading,
    Uploading,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Downloading => write!(f, "Downloading"),
            Phase::Uploading => write!(f, "Uploading"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressEvent {
    pub item: String,
    pub phase: Phase,
    pub completed: u64,
    pub total: u64,
}

impl fmt::Display for ProgressEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}/{}] {} {}",
            self.completed, self.total, self.phase, self.item
        )
    }
}

pub trait ProgressObserver: Send + Sync {
    fn on_progress(&self, event: ProgressEvent);
}

/// Observer for runs nobody is watching.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl ProgressObserver for NoopObserver {
    fn on_progress(&self, _event: ProgressEvent) {}
}

/// Sending half of a progress channel.
#[derive(Debug, Clone)]
pub struct ChannelObserver {
    tx: flume::Sender<ProgressEvent>,
}

/// Receiving half, meant for a dedicated observer thread.
#[derive(Debug)]
pub struct ProgressReceiver {
    rx: flume::Receiver<ProgressEvent>,
}

impl ChannelObserver {
    /// Create an observer and the receiver its events arrive on.
    pub fn new() -> (Self, ProgressReceiver) {
        let (tx, rx) = flume::unbounded();
        (Self { tx }, ProgressReceiver { rx })
    }
}

impl ProgressObserver for ChannelObserver {
    fn on_progress(&self, event: ProgressEvent) {
        // A gone receiver just means nobody is watching anymore.
        let _ = self.tx.send(event);
    }
}

impl ProgressReceiver {
    /// Block until the next event; `None` once every sender is dropped.
    pub fn recv(&self) -> Option<ProgressEvent> {
        self.rx.recv().ok()
    }

    /// Drain whatever is queued right now, keeping only the newest event.
    pub fn latest(&self) -> Option<ProgressEvent> {
        self.rx.try_iter().last()
    }
}

/// Cooperative cancellation shared between the pipeline and its host.
///
/// The pipeline checks it between units only, so a unit is never left half
/// done relative to the ledger.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
