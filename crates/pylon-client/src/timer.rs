//! Wires [`pylon_core::connection::ConnectionAction::StartTimer`] /
//! `CancelTimer` actions to real `tokio` sleep tasks.
//!
//! The connection state machine only ever *asks* for a timer to be
//! (re)started or cancelled; something outside the pure state machine has
//! to actually run the clock. One task per [`TimerKind`], restarted on
//! every `StartTimer` and aborted on `CancelTimer`; firing sends the kind
//! back through an `mpsc` channel the connection's event loop selects on
//! alongside incoming bytes.

use std::{collections::HashMap, time::Duration};

use pylon_core::connection::TimerKind;
use tokio::{sync::mpsc, task::JoinHandle};

/// Live set of per-kind timer tasks for one connection.
pub struct TimerSet {
    tx: mpsc::UnboundedSender<TimerKind>,
    handles: HashMap<TimerKind, JoinHandle<()>>,
}

impl TimerSet {
    /// Create an empty timer set; fired timers are sent on `tx`.
    #[must_use]
    pub fn new(tx: mpsc::UnboundedSender<TimerKind>) -> Self {
        Self { tx, handles: HashMap::new() }
    }

    /// (Re)start `timer`, cancelling any previous task for the same kind.
    pub fn start(&mut self, timer: TimerKind, duration: Duration) {
        self.cancel(timer);
        let tx = self.tx.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            let _ = tx.send(timer);
        });
        self.handles.insert(timer, handle);
    }

    /// Cancel `timer`'s task, if one is running.
    pub fn cancel(&mut self, timer: TimerKind) {
        if let Some(handle) = self.handles.remove(&timer) {
            handle.abort();
        }
    }

    /// Abort every running timer task, e.g. once the connection finishes.
    pub fn cancel_all(&mut self) {
        for (_, handle) in self.handles.drain() {
            handle.abort();
        }
    }
}

impl Drop for TimerSet {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
