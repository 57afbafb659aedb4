//! Standard invariant checks.
//!
//! These invariants capture behavioral properties that must always hold.
//! They verify WHAT must be true, not specific test scenarios.

use super::{Invariant, InvariantResult, SystemSnapshot, Violation};

/// A connection's outstanding-request count must equal requests sent minus
/// replies and cancellations received; retired requests can never exceed
/// requests sent.
pub struct OutstandingRequestBalance;

impl Invariant for OutstandingRequestBalance {
    fn name(&self) -> &'static str {
        "outstanding_request_balance"
    }

    fn check(&self, state: &SystemSnapshot) -> InvariantResult {
        for conn in &state.connections {
            let retired = conn.replies_received + conn.cancellations_received;
            if retired > conn.requests_sent {
                return Err(Violation {
                    invariant: self.name(),
                    message: format!(
                        "connection {}: {retired} requests retired but only {} were sent",
                        conn.connection_id, conn.requests_sent
                    ),
                });
            }

            let expected = conn.requests_sent - retired;
            let actual = conn.outstanding_request_ids.len() as u64;
            if actual != expected {
                return Err(Violation {
                    invariant: self.name(),
                    message: format!(
                        "connection {}: outstanding map has {actual} entries, expected {expected} \
                         ({} sent - {retired} retired)",
                        conn.connection_id, conn.requests_sent
                    ),
                });
            }
        }
        Ok(())
    }
}

/// Every connection must dispatch against an adapter that is actually
/// registered; a connection cannot outlive the adapter it was bound to.
pub struct ConnectionAdapterRegistered;

impl Invariant for ConnectionAdapterRegistered {
    fn name(&self) -> &'static str {
        "connection_adapter_registered"
    }

    fn check(&self, state: &SystemSnapshot) -> InvariantResult {
        for conn in &state.connections {
            if !state.adapter_names.contains(&conn.adapter) {
                return Err(Violation {
                    invariant: self.name(),
                    message: format!(
                        "connection {} references unregistered adapter '{}'",
                        conn.connection_id, conn.adapter
                    ),
                });
            }
        }
        Ok(())
    }
}

/// Connection ids are allocated from a single monotonically increasing
/// counter; the allocation history must never decrease or repeat.
pub struct ConnectionIdAllocationMonotonic;

impl Invariant for ConnectionIdAllocationMonotonic {
    fn name(&self) -> &'static str {
        "connection_id_allocation_monotonic"
    }

    fn check(&self, state: &SystemSnapshot) -> InvariantResult {
        for window in state.connection_id_history.windows(2) {
            let [previous, next] = window else { continue };
            if next <= previous {
                return Err(Violation {
                    invariant: self.name(),
                    message: format!(
                        "connection id {next} allocated after {previous}, but ids must strictly increase"
                    ),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invariants::ConnectionSnapshot;

    #[test]
    fn balance_holds_with_no_activity() {
        let mut state = SystemSnapshot::empty();
        state.add_adapter("echo");
        state.add_connection(ConnectionSnapshot::new(1, "echo"));

        assert!(OutstandingRequestBalance.check(&state).is_ok());
    }

    #[test]
    fn balance_detects_lost_reply_accounting() {
        let mut state = SystemSnapshot::empty();
        state.add_adapter("echo");
        let mut conn = ConnectionSnapshot::new(1, "echo").with_request_sent(1).with_request_sent(2);
        conn.replies_received += 1;
        state.add_connection(conn);

        let result = OutstandingRequestBalance.check(&state);
        assert!(result.is_err());
        assert!(result.unwrap_err().message.contains("outstanding map"));
    }

    #[test]
    fn balance_detects_over_retirement() {
        let mut state = SystemSnapshot::empty();
        state.add_adapter("echo");
        let mut conn = ConnectionSnapshot::new(1, "echo").with_request_sent(1);
        conn.cancellations_received += 1;
        conn.replies_received += 1;
        state.add_connection(conn);

        let result = OutstandingRequestBalance.check(&state);
        assert!(result.is_err());
        assert!(result.unwrap_err().message.contains("retired"));
    }

    #[test]
    fn adapter_registration_passes_when_registered() {
        let mut state = SystemSnapshot::empty();
        state.add_adapter("echo");
        state.add_connection(ConnectionSnapshot::new(1, "echo"));

        assert!(ConnectionAdapterRegistered.check(&state).is_ok());
    }

    #[test]
    fn adapter_registration_detects_dangling_reference() {
        let mut state = SystemSnapshot::empty();
        state.add_connection(ConnectionSnapshot::new(1, "missing"));

        let result = ConnectionAdapterRegistered.check(&state);
        assert!(result.is_err());
        assert!(result.unwrap_err().message.contains("missing"));
    }

    #[test]
    fn connection_id_monotonicity_passes_when_increasing() {
        let mut state = SystemSnapshot::empty();
        state.connection_id_history = vec![1, 2, 3, 4];

        assert!(ConnectionIdAllocationMonotonic.check(&state).is_ok());
    }

    #[test]
    fn connection_id_monotonicity_detects_reuse() {
        let mut state = SystemSnapshot::empty();
        state.connection_id_history = vec![1, 2, 2, 4];

        let result = ConnectionIdAllocationMonotonic.check(&state);
        assert!(result.is_err());
    }
}
