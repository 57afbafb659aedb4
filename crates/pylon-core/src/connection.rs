//! Connection state machine.
//!
//! Mirrors a peer's connection lifecycle, request-id correlation, and the
//! batch-request stream. Uses the action pattern: methods take time as input
//! and return actions for the driver to execute. This keeps the state
//! machine pure (no I/O) and makes testing straightforward.
//!
//! # State Machine
//!
//! ```text
//! NotInitialized -> NotValidated -> Active <-> Holding -> Closing -> ClosingPending -> Closed -> Finished
//! ```
//!
//! `Active` and `Holding` are the only states requests are ever sent from;
//! `Holding` means the adapter side has stopped dispatching but the
//! connection itself is still open and can still receive replies.

use std::{
    collections::HashMap,
    ops::Sub,
    time::{Duration, Instant},
};

use pylon_proto::{decode_identity_triple, Body, Compression, Identity, Message, MessageType, ReplyBody, ReplyStatus, RequestBody};

use crate::error::PylonError;

/// Decode the `(identity, facet, operation)` triple carried by a
/// `*NotExist` reply's payload. A malformed payload (from a
/// protocol-incompatible peer) degrades to empty fields rather than
/// failing the whole reply — the caller still learns the request was
/// rejected, just without the extra diagnostic detail.
fn decode_identity_triple_lossy(payload: &bytes::Bytes) -> (Identity, Option<String>, String) {
    decode_identity_triple(payload)
        .unwrap_or_else(|_| (Identity { category: String::new(), name: String::new() }, None, String::new()))
}

/// Time allowed to complete connection validation before it is abandoned.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Time allowed for the peer to acknowledge a graceful close.
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(10);

/// Time allowed without any activity before the connection is considered idle.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Time allowed with no outstanding requests before the connection may be
/// reclaimed by the owning adapter/communicator.
pub const DEFAULT_INACTIVITY_TIMEOUT: Duration = Duration::from_secs(300);

/// Soft limit (in encoded bytes) before a queued batch is auto-flushed.
pub const DEFAULT_BATCH_AUTO_FLUSH_SIZE: usize = 1024 * 1024;

/// The four timers a connection drives, per the timeout taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Bounds `NotValidated`.
    Connect,
    /// Bounds `Closing` / `ClosingPending`.
    Close,
    /// Bounds time since the last byte was read from the peer.
    Idle,
    /// Bounds time since the last outstanding request completed.
    Inactivity,
}

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No transport activity has happened yet.
    NotInitialized,
    /// Transport is open; waiting for `ValidateConnection`.
    NotValidated,
    /// Fully established and dispatching.
    Active,
    /// Established but not currently dispatching new requests.
    Holding,
    /// Local or peer-initiated graceful close in progress, own side draining.
    Closing,
    /// Close acknowledged by the local side, waiting for the peer's own close.
    ClosingPending,
    /// Transport has been told to shut down.
    Closed,
    /// Transport teardown observed; no further actions will ever be produced.
    Finished,
}

/// Actions returned by the connection state machine for a driver to execute.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionAction {
    /// Send this message to the peer.
    SendMessage(Message),
    /// (Re)start the named timer for the given duration.
    StartTimer {
        /// Which timer to (re)start.
        timer: TimerKind,
        /// Duration until it fires.
        duration: Duration,
    },
    /// Cancel the named timer; it is no longer relevant.
    CancelTimer(TimerKind),
    /// Deliver a completed invocation's outcome to its waiting caller.
    CompleteRequest {
        /// The request id this completion corresponds to.
        request_id: i32,
        /// `Ok` payload bytes on success, `Err` on any dispatch/local failure.
        result: Result<bytes::Bytes, PylonError>,
    },
    /// Close the transport with this reason.
    Close {
        /// Reason for closing the connection.
        reason: String,
    },
    /// The connection is fully torn down; no further events will be delivered.
    Finish,
}

/// Connection configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Timeout for completing connection validation.
    pub connect_timeout: Duration,
    /// Timeout for completing a graceful close.
    pub close_timeout: Duration,
    /// Idle timeout before the connection is closed.
    pub idle_timeout: Duration,
    /// Inactivity timeout before the connection may be reclaimed.
    pub inactivity_timeout: Duration,
    /// Soft byte limit before a queued batch is auto-flushed.
    pub batch_auto_flush_size: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            inactivity_timeout: DEFAULT_INACTIVITY_TIMEOUT,
            batch_auto_flush_size: DEFAULT_BATCH_AUTO_FLUSH_SIZE,
        }
    }
}

#[derive(Debug, Clone)]
struct OutstandingRequest {
    sent: bool,
    cancelled: bool,
}

/// Connection state machine.
///
/// Pure: no I/O, no `Environment` storage. Time is passed as a parameter to
/// every method that needs it. Generic over `Instant` to support both real
/// and virtual time for deterministic testing.
#[derive(Debug, Clone)]
pub struct Connection<I = Instant>
where
    I: Copy + Ord + Send + Sync + Sub<Output = Duration>,
{
    state: ConnectionState,
    config: ConnectionConfig,
    last_activity: I,
    /// Next request id to hand out to a two-way request. Wraps `i32::MAX -> 1`;
    /// `0` is reserved for one-way/datagram requests and never allocated here.
    next_request_id: i32,
    outstanding: HashMap<i32, OutstandingRequest>,
    batch_queue: Vec<RequestBody>,
    batch_size: usize,
    close_reason: Option<String>,
}

impl<I> Connection<I>
where
    I: Copy + Ord + Send + Sync + Sub<Output = Duration>,
{
    /// Create a new connection in [`ConnectionState::NotInitialized`].
    #[must_use]
    pub fn new(now: I, config: ConnectionConfig) -> Self {
        Self {
            state: ConnectionState::NotInitialized,
            config,
            last_activity: now,
            next_request_id: 1,
            outstanding: HashMap::new(),
            batch_queue: Vec::new(),
            batch_size: 0,
            close_reason: None,
        }
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Number of requests still awaiting a reply.
    #[must_use]
    pub fn outstanding_count(&self) -> usize {
        self.outstanding.len()
    }

    /// Whether this connection can currently accept a new outgoing request.
    #[must_use]
    pub fn can_send(&self) -> bool {
        matches!(self.state, ConnectionState::Active | ConnectionState::Holding)
    }

    /// Transport has become available; begin validation.
    ///
    /// # Errors
    ///
    /// Returns [`PylonError::ProtocolError`] if called outside `NotInitialized`.
    pub fn initialize(&mut self, now: I) -> Result<Vec<ConnectionAction>, PylonError> {
        self.expect_state(ConnectionState::NotInitialized, "initialize")?;
        self.state = ConnectionState::NotValidated;
        self.last_activity = now;
        Ok(vec![ConnectionAction::StartTimer {
            timer: TimerKind::Connect,
            duration: self.config.connect_timeout,
        }])
    }

    /// The peer's (or our own outgoing) `ValidateConnection` message has been
    /// exchanged; the connection becomes active.
    ///
    /// # Errors
    ///
    /// Returns [`PylonError::ProtocolError`] if called outside `NotValidated`.
    pub fn validate(&mut self, now: I) -> Result<Vec<ConnectionAction>, PylonError> {
        self.expect_state(ConnectionState::NotValidated, "validate")?;
        self.state = ConnectionState::Active;
        self.last_activity = now;
        Ok(vec![
            ConnectionAction::CancelTimer(TimerKind::Connect),
            ConnectionAction::StartTimer { timer: TimerKind::Idle, duration: self.config.idle_timeout },
        ])
    }

    /// Stop dispatching new requests without closing the transport.
    pub fn hold(&mut self) {
        if self.state == ConnectionState::Active {
            self.state = ConnectionState::Holding;
        }
    }

    /// Resume dispatching requests after [`Self::hold`].
    pub fn activate(&mut self) {
        if self.state == ConnectionState::Holding {
            self.state = ConnectionState::Active;
        }
    }

    /// Allocate the next two-way request id, wrapping past `i32::MAX` back to `1`.
    fn allocate_request_id(&mut self) -> i32 {
        let id = self.next_request_id;
        self.next_request_id = if id == i32::MAX { 1 } else { id + 1 };
        id
    }

    /// Send a request. `twoway` requests are assigned a nonzero request id
    /// and tracked in the outstanding-request map; one-way requests are
    /// assigned request id `0` and fire-and-forget.
    ///
    /// # Errors
    ///
    /// Returns [`PylonError::ConnectionLost`] if the connection cannot
    /// currently send (not `Active`/`Holding`).
    pub fn send_request(
        &mut self,
        mut request: RequestBody,
        twoway: bool,
        now: I,
    ) -> Result<(i32, Vec<ConnectionAction>), PylonError> {
        if !self.can_send() {
            return Err(PylonError::ConnectionLost(format!("cannot send request in state {:?}", self.state)));
        }

        let request_id = if twoway { self.allocate_request_id() } else { 0 };
        request.request_id = request_id;

        if twoway {
            self.outstanding.insert(request_id, OutstandingRequest { sent: true, cancelled: false });
        }

        self.last_activity = now;
        let message = Message::new(Body::Request(request));
        Ok((request_id, vec![ConnectionAction::SendMessage(message)]))
    }

    /// Cancel an outstanding two-way request. If the reply has not yet
    /// arrived it is marked cancelled and discarded on arrival; if it was
    /// never tracked (already completed or unknown) this is a no-op.
    pub fn cancel_request(&mut self, request_id: i32) {
        if let Some(outstanding) = self.outstanding.get_mut(&request_id) {
            outstanding.cancelled = true;
        }
    }

    /// Queue a request onto the batch stream instead of sending it
    /// immediately. Auto-flushes (returning a `SendMessage` action) if the
    /// queue's encoded size crosses the configured soft limit.
    #[must_use]
    pub fn prepare_batch_request(&mut self, request: RequestBody) -> Vec<ConnectionAction> {
        self.batch_size += request.params.len() + request.operation.len() + 32;
        self.batch_queue.push(request);

        if self.batch_size >= self.config.batch_auto_flush_size {
            self.finish_batch_request()
        } else {
            Vec::new()
        }
    }

    /// Flush the queued batch as a single `BatchRequest` message.
    #[must_use]
    pub fn finish_batch_request(&mut self) -> Vec<ConnectionAction> {
        if self.batch_queue.is_empty() {
            return Vec::new();
        }
        let requests = std::mem::take(&mut self.batch_queue);
        self.batch_size = 0;
        let message = Message::new(Body::BatchRequest(requests));
        vec![ConnectionAction::SendMessage(message)]
    }

    /// Discard the queued batch without sending it.
    pub fn abort_batch_request(&mut self) {
        self.batch_queue.clear();
        self.batch_size = 0;
    }

    /// Number of requests currently queued on the batch stream.
    #[must_use]
    pub fn batch_len(&self) -> usize {
        self.batch_queue.len()
    }

    /// Begin a graceful close. Sends `CloseConnection` if no requests are
    /// outstanding, otherwise waits for them to drain before the driver calls
    /// this again (idempotent once already closing).
    #[must_use]
    pub fn begin_close(&mut self, reason: impl Into<String>, now: I) -> Vec<ConnectionAction> {
        if matches!(self.state, ConnectionState::Closing | ConnectionState::ClosingPending | ConnectionState::Closed | ConnectionState::Finished) {
            return Vec::new();
        }

        self.close_reason = Some(reason.into());
        self.state = ConnectionState::Closing;
        self.last_activity = now;

        let mut actions = vec![ConnectionAction::StartTimer {
            timer: TimerKind::Close,
            duration: self.config.close_timeout,
        }];

        if self.outstanding.is_empty() {
            actions.push(ConnectionAction::SendMessage(Message::new(Body::CloseConnection)));
            self.state = ConnectionState::ClosingPending;
        }

        actions
    }

    /// The transport has reported that it has finished closing.
    #[must_use]
    pub fn finish(&mut self) -> Vec<ConnectionAction> {
        if self.state == ConnectionState::Finished {
            return Vec::new();
        }
        self.state = ConnectionState::Finished;
        vec![ConnectionAction::CancelTimer(TimerKind::Idle), ConnectionAction::Finish]
    }

    /// Process an incoming message and update state accordingly.
    ///
    /// # Errors
    ///
    /// Returns [`PylonError::ProtocolError`] if the message type is not
    /// valid for the current state.
    pub fn handle_message(&mut self, message: Message, now: I) -> Result<Vec<ConnectionAction>, PylonError> {
        self.last_activity = now;
        let msg_type = message.message_type();

        match (&self.state, message.body()) {
            (ConnectionState::NotValidated, Body::ValidateConnection) => self.validate(now),

            (ConnectionState::Active | ConnectionState::Holding, Body::Reply(reply)) => {
                let mut actions = self.complete_reply(reply.clone());
                actions.push(self.restart_idle_timer());
                Ok(actions)
            },

            (ConnectionState::Active, Body::Request(_) | Body::BatchRequest(_)) => {
                // Dispatch is handled by the owning adapter; the connection
                // layer only validates that it is legal to receive one here.
                Ok(vec![self.restart_idle_timer()])
            },

            (ConnectionState::Active | ConnectionState::Holding, Body::ValidateConnection) => {
                // A bare `ValidateConnection` after the handshake is a
                // heartbeat: it carries no state transition of its own, only
                // proof of life that keeps this side's idle timer from
                // expiring.
                Ok(vec![self.restart_idle_timer()])
            },

            (_, Body::CloseConnection) => Ok(self.handle_peer_close(now)),

            (state, _) => Err(PylonError::ProtocolError(format!(
                "unexpected message {:?} in state {:?}",
                msg_type, state
            ))),
        }
    }

    fn complete_reply(&mut self, reply: ReplyBody) -> Vec<ConnectionAction> {
        let Some(outstanding) = self.outstanding.remove(&reply.request_id) else {
            // Unknown reply request-id: logged and dropped by the driver,
            // never silently ignored at this layer.
            return vec![ConnectionAction::CompleteRequest {
                request_id: reply.request_id,
                result: Err(PylonError::ProtocolError(format!(
                    "reply for unknown request id {}",
                    reply.request_id
                ))),
            }];
        };

        if outstanding.cancelled {
            return self.maybe_finish_closing();
        }

        let result = match reply.status {
            ReplyStatus::Ok => Ok(reply.payload),
            ReplyStatus::UserException => Err(PylonError::UnknownUserException(
                "user exception payload requires application-level decoding".into(),
            )),
            ReplyStatus::ObjectNotExist => {
                let (identity, facet, operation) = decode_identity_triple_lossy(&reply.payload);
                Err(PylonError::ObjectNotExist {
                    category: identity.category,
                    name: identity.name,
                    facet,
                    operation,
                })
            },
            ReplyStatus::FacetNotExist => {
                let (identity, facet, operation) = decode_identity_triple_lossy(&reply.payload);
                Err(PylonError::FacetNotExist {
                    category: identity.category,
                    name: identity.name,
                    facet,
                    operation,
                })
            },
            ReplyStatus::OperationNotExist => {
                let (identity, _facet, operation) = decode_identity_triple_lossy(&reply.payload);
                Err(PylonError::OperationNotExist { category: identity.category, name: identity.name, operation })
            },
            ReplyStatus::UnknownLocal => Err(PylonError::UnknownLocalException(String::new())),
            ReplyStatus::UnknownUser => Err(PylonError::UnknownUserException(String::new())),
            ReplyStatus::Unknown => Err(PylonError::UnknownException(String::new())),
        };

        let mut actions = vec![ConnectionAction::CompleteRequest { request_id: reply.request_id, result }];
        actions.extend(self.maybe_finish_closing());
        actions
    }

    fn handle_peer_close(&mut self, now: I) -> Vec<ConnectionAction> {
        self.last_activity = now;
        match self.state {
            ConnectionState::ClosingPending => {
                self.state = ConnectionState::Closed;
                vec![ConnectionAction::CancelTimer(TimerKind::Close), ConnectionAction::Close {
                    reason: self.close_reason.clone().unwrap_or_else(|| "closed".to_string()),
                }]
            },
            ConnectionState::Closing => {
                // Peer closed first; we have no outstanding requests left to
                // drain from our own side either.
                self.state = ConnectionState::Closed;
                vec![ConnectionAction::CancelTimer(TimerKind::Close), ConnectionAction::Close {
                    reason: "peer closed".to_string(),
                }]
            },
            _ => {
                self.state = ConnectionState::Closed;
                vec![ConnectionAction::Close { reason: "peer closed".to_string() }]
            },
        }
    }

    fn maybe_finish_closing(&mut self) -> Vec<ConnectionAction> {
        if self.state == ConnectionState::Closing && self.outstanding.is_empty() {
            self.state = ConnectionState::ClosingPending;
            return vec![ConnectionAction::SendMessage(Message::new(Body::CloseConnection))];
        }
        Vec::new()
    }

    /// (Re)start the idle timer for a full `idle_timeout` from now, as an
    /// action rather than a direct timer manipulation — every byte read off
    /// the wire pushes the deadline back out.
    #[must_use]
    fn restart_idle_timer(&self) -> ConnectionAction {
        ConnectionAction::StartTimer { timer: TimerKind::Idle, duration: self.config.idle_timeout }
    }

    /// Periodic maintenance: fires the timer whose deadline has elapsed, if any.
    ///
    /// Firing a timer is not itself activity, so this never touches
    /// `last_activity`; the `Idle` timer in particular is gated on how much
    /// time has actually elapsed since the last read, since a timer can fire
    /// for a connection that kept being restarted underneath it.
    #[must_use]
    pub fn on_timer_fired(&mut self, timer: TimerKind, now: I) -> Vec<ConnectionAction> {
        match timer {
            TimerKind::Connect if self.state == ConnectionState::NotValidated => {
                self.state = ConnectionState::Closed;
                vec![ConnectionAction::Close {
                    reason: format!("connect timeout after {:?}", self.config.connect_timeout),
                }]
            },
            TimerKind::Close
                if matches!(self.state, ConnectionState::Closing | ConnectionState::ClosingPending) =>
            {
                self.state = ConnectionState::Closed;
                vec![ConnectionAction::Close {
                    reason: format!("close timeout after {:?}", self.config.close_timeout),
                }]
            },
            TimerKind::Idle if matches!(self.state, ConnectionState::Active | ConnectionState::Holding) => {
                let elapsed = now - self.last_activity;
                if elapsed >= self.config.idle_timeout {
                    self.state = ConnectionState::Closed;
                    vec![ConnectionAction::Close {
                        reason: format!("idle timeout after {:?}", self.config.idle_timeout),
                    }]
                } else {
                    vec![ConnectionAction::StartTimer {
                        timer: TimerKind::Idle,
                        duration: self.config.idle_timeout - elapsed,
                    }]
                }
            },
            TimerKind::Inactivity if self.outstanding.is_empty() => {
                vec![ConnectionAction::Close { reason: "inactivity timeout".to_string() }]
            },
            _ => Vec::new(),
        }
    }

    fn expect_state(&self, expected: ConnectionState, operation: &str) -> Result<(), PylonError> {
        if self.state != expected {
            return Err(PylonError::ProtocolError(format!(
                "cannot {operation} from state {:?}, expected {:?}",
                self.state, expected
            )));
        }
        Ok(())
    }
}
