//! Observable state snapshots for invariant checking.
//!
//! Snapshots capture the observable state of the system at a point in time.
//! Invariants operate on snapshots rather than live state to ensure
//! consistent, atomic checks.

use std::collections::BTreeSet;

/// Snapshot of the entire system state: one entry per live connection, plus
/// the adapter names currently registered.
#[derive(Debug, Clone, Default)]
pub struct SystemSnapshot {
    /// Per-connection state snapshots.
    pub connections: Vec<ConnectionSnapshot>,
    /// Names of adapters registered with the server at snapshot time.
    pub adapter_names: BTreeSet<String>,
    /// Connection ids observed, in allocation order, across the run so far
    /// (for monotonicity checks — not just the currently-live set).
    pub connection_id_history: Vec<u64>,
}

impl SystemSnapshot {
    /// Create an empty snapshot (no connections, no adapters).
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Add a connection snapshot.
    pub fn add_connection(&mut self, connection: ConnectionSnapshot) {
        self.connection_id_history.push(connection.connection_id);
        self.connections.push(connection);
    }

    /// Record a registered adapter name.
    pub fn add_adapter(&mut self, name: impl Into<String>) {
        self.adapter_names.insert(name.into());
    }
}

/// Snapshot of one connection's request-correlation bookkeeping.
#[derive(Debug, Clone, Default)]
pub struct ConnectionSnapshot {
    /// Arena handle for the connection.
    pub connection_id: u64,
    /// Name of the adapter this connection dispatches against.
    pub adapter: String,
    /// Two-way requests sent on this connection so far.
    pub requests_sent: u64,
    /// Replies received on this connection so far.
    pub replies_received: u64,
    /// Cancellations (local failures that retire an outstanding request
    /// without a reply) observed on this connection so far.
    pub cancellations_received: u64,
    /// Request ids currently awaiting a reply.
    pub outstanding_request_ids: BTreeSet<i32>,
}

impl ConnectionSnapshot {
    /// Start a snapshot for `connection_id` on `adapter`, with no activity
    /// recorded yet.
    #[must_use]
    pub fn new(connection_id: u64, adapter: impl Into<String>) -> Self {
        Self { connection_id, adapter: adapter.into(), ..Default::default() }
    }

    /// Record a two-way request sent with `request_id`.
    #[must_use]
    pub fn with_request_sent(mut self, request_id: i32) -> Self {
        self.requests_sent += 1;
        self.outstanding_request_ids.insert(request_id);
        self
    }

    /// Record a reply received for `request_id`.
    #[must_use]
    pub fn with_reply_received(mut self, request_id: i32) -> Self {
        self.replies_received += 1;
        self.outstanding_request_ids.remove(&request_id);
        self
    }

    /// Record a cancellation (local failure) for `request_id`.
    #[must_use]
    pub fn with_cancellation(mut self, request_id: i32) -> Self {
        self.cancellations_received += 1;
        self.outstanding_request_ids.remove(&request_id);
        self
    }
}
