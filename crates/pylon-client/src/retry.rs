//! Retry policy: whether and when to retry a failed invocation.
//!
//! Pure and stateless aside from the configured interval list — the
//! per-invocation attempt counter lives with the caller (see
//! [`crate::proxy::Proxy::invoke`]), not here, so the same policy can be
//! shared across every proxy a communicator creates.

use std::time::Duration;

use pylon_core::PylonError;

/// `RetryIntervals`: an ordered list of delays to wait before each
/// successive retry. The attempt counter indexes this list; running past
/// the end surfaces the error to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    intervals: Vec<Duration>,
}

impl Default for RetryPolicy {
    /// `0, 10, 100` ms.
    fn default() -> Self {
        Self { intervals: vec![Duration::ZERO, Duration::from_millis(10), Duration::from_millis(100)] }
    }
}

/// What [`RetryPolicy::decide`] says to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Wait `Duration`, then try again.
    Retry(Duration),
    /// Stop; surface the error to the caller.
    Raise,
}

impl RetryPolicy {
    /// Build a policy from an explicit interval list (`RetryIntervals`).
    #[must_use]
    pub fn new(intervals: Vec<Duration>) -> Self {
        Self { intervals }
    }

    /// The configured interval list.
    #[must_use]
    pub fn intervals(&self) -> &[Duration] {
        &self.intervals
    }

    /// Decide whether `error` should be retried for the `attempt`th time
    /// (`0`-based: this is the number of retries already performed, not
    /// counting the initial attempt).
    ///
    /// Retry eligibility is classified as follows:
    /// - `InvocationTimeout` and `CommunicatorDestroyed` are never retried.
    /// - A connection-creation failure that happened before the request was
    ///   ever written to the wire may be retried regardless of idempotency
    ///   — nothing observable happened on the peer, so replaying it is safe
    ///   even for a non-idempotent operation.
    /// - Idempotent requests may additionally be retried on
    ///   `ConnectionLost`, `CloseConnection`, and a connect-level
    ///   `ConnectTimeout` even after the request was written — the
    ///   defining property of idempotent is that replaying a possibly
    ///   already-executed call is still safe.
    #[must_use]
    pub fn decide(&self, error: &PylonError, idempotent: bool, already_sent: bool, attempt: usize) -> RetryDecision {
        if !error.is_retryable_kind() {
            return RetryDecision::Raise;
        }

        let connection_creation_failure = matches!(
            error,
            PylonError::ConnectFailed(_)
                | PylonError::ConnectionRefused
                | PylonError::DnsError(_)
                | PylonError::SocketError(_)
        );
        let idempotent_recoverable =
            idempotent && matches!(error, PylonError::ConnectionLost(_) | PylonError::CloseConnection | PylonError::ConnectTimeout(_));

        let retryable = (connection_creation_failure && !already_sent) || idempotent_recoverable;
        if !retryable {
            return RetryDecision::Raise;
        }

        self.intervals.get(attempt).copied().map_or(RetryDecision::Raise, RetryDecision::Retry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_idempotent_retries_unsent_connect_failure() {
        let policy = RetryPolicy::default();
        let decision = policy.decide(&PylonError::ConnectFailed("refused".into()), false, false, 0);
        assert_eq!(decision, RetryDecision::Retry(Duration::ZERO));
    }

    #[test]
    fn non_idempotent_never_retries_once_sent() {
        let policy = RetryPolicy::default();
        let decision = policy.decide(&PylonError::ConnectionLost("eof".into()), false, true, 0);
        assert_eq!(decision, RetryDecision::Raise);
    }

    #[test]
    fn idempotent_retries_connection_lost_after_send() {
        let policy = RetryPolicy::new(vec![Duration::ZERO, Duration::from_millis(50), Duration::from_millis(200)]);
        assert_eq!(
            policy.decide(&PylonError::ConnectionLost("eof".into()), true, true, 0),
            RetryDecision::Retry(Duration::ZERO)
        );
        assert_eq!(
            policy.decide(&PylonError::ConnectionLost("eof".into()), true, true, 1),
            RetryDecision::Retry(Duration::from_millis(50))
        );
        assert_eq!(
            policy.decide(&PylonError::ConnectionLost("eof".into()), true, true, 2),
            RetryDecision::Retry(Duration::from_millis(200))
        );
        assert_eq!(policy.decide(&PylonError::ConnectionLost("eof".into()), true, true, 3), RetryDecision::Raise);
    }

    #[test]
    fn invocation_timeout_is_never_retried() {
        let policy = RetryPolicy::default();
        let decision =
            policy.decide(&PylonError::InvocationTimeout(Duration::from_secs(1)), true, true, 0);
        assert_eq!(decision, RetryDecision::Raise);
    }

    #[test]
    fn communicator_destroyed_is_never_retried() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.decide(&PylonError::CommunicatorDestroyed, true, false, 0), RetryDecision::Raise);
    }

    #[test]
    fn object_not_exist_is_never_retried() {
        let policy = RetryPolicy::default();
        let err = PylonError::ObjectNotExist {
            category: String::new(),
            name: "x".into(),
            facet: None,
            operation: "op".into(),
        };
        assert_eq!(policy.decide(&err, true, true, 0), RetryDecision::Raise);
    }
}
