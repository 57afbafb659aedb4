//! Server-side driver: turns transport events into
//! [`pylon_core::connection::Connection`] transitions and C7/C8 dispatch
//! requests.
//!
//! Pure aside from handing out connection handles: it owns no socket and
//! spawns no task. `pylon-runtime` owns the transceivers, feeds this driver
//! events off them, and executes the actions it returns — including
//! actually invoking [`crate::dispatch::DispatchEngine`] for `Dispatch`
//! actions and feeding the result back in as a `DispatchCompleted` event.

use std::{collections::HashMap, ops::Sub, sync::Arc, time::Duration};

use pylon_core::{
    connection::{Connection, ConnectionAction, ConnectionConfig, ConnectionState, TimerKind},
    error::PylonError,
};
use pylon_proto::{Body, Message, ReplyBody, RequestBody};

use crate::adapter::{Current, ObjectAdapter};

/// Log severity carried by [`ServerAction::Log`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// Fine-grained per-message tracing.
    Trace,
    /// Developer diagnostics.
    Debug,
    /// Routine operational events.
    Info,
    /// Recoverable anomalies.
    Warn,
    /// Failures that end a connection or a dispatch.
    Error,
}

/// Events the transport/glue layer feeds into the driver.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    /// A new transport-level connection was accepted on `adapter`'s
    /// listener.
    ConnectionAccepted {
        /// Arena handle for the new connection.
        connection_id: u64,
        /// Name of the adapter whose listener accepted it.
        adapter: String,
    },
    /// A complete message was read off the wire for `connection_id`.
    MessageReceived {
        /// Connection the message arrived on.
        connection_id: u64,
        /// The decoded message.
        message: Message,
    },
    /// The transport reported this connection closed.
    ConnectionClosed {
        /// Connection that closed.
        connection_id: u64,
        /// Reason, for logging.
        reason: String,
    },
    /// A previously started timer fired.
    TimerFired {
        /// Connection the timer belongs to.
        connection_id: u64,
        /// Which timer fired.
        timer: TimerKind,
    },
    /// A previously emitted [`ServerAction::Dispatch`] completed.
    DispatchCompleted {
        /// Connection the original request arrived on.
        connection_id: u64,
        /// The reply to send, or `None` if the request was one-way.
        reply: Option<ReplyBody>,
    },
}

/// Actions the driver returns for the glue layer to execute.
#[derive(Debug, Clone)]
pub enum ServerAction {
    /// Write this message to the connection.
    SendMessage {
        /// Target connection.
        connection_id: u64,
        /// Message to send.
        message: Message,
    },
    /// (Re)start a timer for this connection.
    StartTimer {
        /// Target connection.
        connection_id: u64,
        /// Which timer.
        timer: TimerKind,
        /// Duration until it fires.
        duration: Duration,
    },
    /// Cancel a timer for this connection.
    CancelTimer {
        /// Target connection.
        connection_id: u64,
        /// Which timer.
        timer: TimerKind,
    },
    /// Invoke the dispatch engine for one request; the result should be fed
    /// back in as [`ServerEvent::DispatchCompleted`].
    Dispatch {
        /// Connection the request arrived on.
        connection_id: u64,
        /// Name of the adapter to dispatch against.
        adapter: String,
        /// Per-invocation context.
        current: Current,
        /// Opaque encapsulated parameter bytes.
        params: bytes::Bytes,
    },
    /// A two-way request this connection sent (acting as a caller) got its
    /// reply, or failed locally.
    RequestCompleted {
        /// Connection the original request was sent on.
        connection_id: u64,
        /// Correlation id.
        request_id: i32,
        /// Outcome.
        result: Result<bytes::Bytes, PylonError>,
    },
    /// Close the transport.
    CloseConnection {
        /// Target connection.
        connection_id: u64,
        /// Reason, for logging.
        reason: String,
    },
    /// The connection is fully torn down; release its resources.
    Finish {
        /// Target connection.
        connection_id: u64,
    },
    /// Emit a log line.
    Log {
        /// Severity.
        level: LogLevel,
        /// Message text.
        message: String,
    },
}

/// Driver configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Connection state machine configuration applied to every accepted
    /// connection.
    pub connection: ConnectionConfig,
    /// Maximum number of simultaneously open connections; further accepts
    /// are refused until one closes.
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { connection: ConnectionConfig::default(), max_connections: 4096 }
    }
}

struct ConnectionEntry<I>
where
    I: Copy + Ord + Send + Sync + Sub<Output = Duration>,
{
    connection: Connection<I>,
    adapter: String,
}

/// Server-side driver: one per communicator, owning every accepted
/// connection's state machine and the set of registered object adapters.
pub struct ServerDriver<I = std::time::Instant>
where
    I: Copy + Ord + Send + Sync + Sub<Output = Duration>,
{
    config: ServerConfig,
    connections: HashMap<u64, ConnectionEntry<I>>,
    adapters: HashMap<String, Arc<ObjectAdapter>>,
}

impl<I> ServerDriver<I>
where
    I: Copy + Ord + Send + Sync + Sub<Output = Duration>,
{
    /// Create an empty driver.
    #[must_use]
    pub fn new(config: ServerConfig) -> Self {
        Self { config, connections: HashMap::new(), adapters: HashMap::new() }
    }

    /// Register an object adapter. Requests on connections accepted under
    /// its name dispatch against it.
    pub fn register_adapter(&mut self, adapter: Arc<ObjectAdapter>) {
        self.adapters.insert(adapter.name().to_string(), adapter);
    }

    /// Look up a registered adapter by name.
    #[must_use]
    pub fn adapter(&self, name: &str) -> Option<&Arc<ObjectAdapter>> {
        self.adapters.get(name)
    }

    /// Current number of open (not yet finished) connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Feed one event through the driver, returning the actions it produces.
    ///
    /// # Errors
    ///
    /// Returns [`PylonError::ProtocolError`] if a message arrives that is
    /// illegal for the connection's current state.
    pub fn handle_event(&mut self, event: ServerEvent, now: I) -> Result<Vec<ServerAction>, PylonError> {
        match event {
            ServerEvent::ConnectionAccepted { connection_id, adapter } => {
                self.on_connection_accepted(connection_id, adapter, now)
            },
            ServerEvent::MessageReceived { connection_id, message } => {
                self.on_message_received(connection_id, message, now)
            },
            ServerEvent::ConnectionClosed { connection_id, reason } => {
                Ok(self.on_connection_closed(connection_id, &reason))
            },
            ServerEvent::TimerFired { connection_id, timer } => Ok(self.on_timer_fired(connection_id, timer, now)),
            ServerEvent::DispatchCompleted { connection_id, reply } => {
                Ok(on_dispatch_completed(connection_id, reply))
            },
        }
    }

    fn on_connection_accepted(
        &mut self,
        connection_id: u64,
        adapter: String,
        now: I,
    ) -> Result<Vec<ServerAction>, PylonError> {
        if self.connections.len() >= self.config.max_connections {
            return Ok(vec![ServerAction::CloseConnection {
                connection_id,
                reason: "max connections reached".to_string(),
            }]);
        }

        let mut connection = Connection::new(now, self.config.connection.clone());
        let actions = connection.initialize(now)?;
        self.connections.insert(connection_id, ConnectionEntry { connection, adapter });
        Ok(translate(connection_id, actions))
    }

    fn on_message_received(
        &mut self,
        connection_id: u64,
        message: Message,
        now: I,
    ) -> Result<Vec<ServerAction>, PylonError> {
        let Some(entry) = self.connections.get_mut(&connection_id) else {
            return Ok(vec![ServerAction::Log {
                level: LogLevel::Warn,
                message: format!("message for unknown connection {connection_id}"),
            }]);
        };

        let mut requests: Vec<RequestBody> = match message.body() {
            Body::Request(r) => vec![r.clone()],
            Body::BatchRequest(reqs) => reqs.clone(),
            _ => Vec::new(),
        };
        let was_active = entry.connection.state() == ConnectionState::Active;

        let actions = entry.connection.handle_message(message, now)?;
        let mut out = translate(connection_id, actions);

        if was_active {
            let adapter_name = entry.adapter.clone();
            for request in requests.drain(..) {
                out.extend(self.dispatch_or_reject(connection_id, &adapter_name, &request));
            }
        }

        Ok(out)
    }

    fn dispatch_or_reject(&self, connection_id: u64, adapter_name: &str, request: &RequestBody) -> Vec<ServerAction> {
        let current = Current {
            adapter: adapter_name.to_string(),
            connection_id,
            identity: request.identity.clone(),
            facet: request.facet.clone(),
            operation: request.operation.clone(),
            mode: request.mode,
            context: request.context.clone(),
            request_id: request.request_id,
        };

        let adapter_active = self.adapters.get(adapter_name).is_some_and(|a| a.can_dispatch());
        if !adapter_active {
            if request.request_id == 0 {
                return Vec::new();
            }
            let err = crate::error::AdapterError::NotActive(adapter_name.to_string());
            let reply = crate::dispatch::reply_for_not_exist(request.request_id, err);
            return vec![ServerAction::SendMessage { connection_id, message: Message::new(Body::Reply(reply)) }];
        }

        vec![ServerAction::Dispatch {
            connection_id,
            adapter: adapter_name.to_string(),
            current,
            params: request.params.clone(),
        }]
    }

    fn on_connection_closed(&mut self, connection_id: u64, reason: &str) -> Vec<ServerAction> {
        let Some(mut entry) = self.connections.remove(&connection_id) else {
            return Vec::new();
        };
        let mut actions = translate(connection_id, entry.connection.finish());
        actions.push(ServerAction::Log {
            level: LogLevel::Info,
            message: format!("connection {connection_id} closed: {reason}"),
        });
        actions
    }

    fn on_timer_fired(&mut self, connection_id: u64, timer: TimerKind, now: I) -> Vec<ServerAction> {
        let Some(entry) = self.connections.get_mut(&connection_id) else {
            return Vec::new();
        };
        translate(connection_id, entry.connection.on_timer_fired(timer, now))
    }
}

fn on_dispatch_completed(connection_id: u64, reply: Option<ReplyBody>) -> Vec<ServerAction> {
    match reply {
        Some(reply) => vec![ServerAction::SendMessage { connection_id, message: Message::new(Body::Reply(reply)) }],
        None => Vec::new(),
    }
}

fn translate(connection_id: u64, actions: Vec<ConnectionAction>) -> Vec<ServerAction> {
    actions
        .into_iter()
        .map(|action| match action {
            ConnectionAction::SendMessage(message) => ServerAction::SendMessage { connection_id, message },
            ConnectionAction::StartTimer { timer, duration } => {
                ServerAction::StartTimer { connection_id, timer, duration }
            },
            ConnectionAction::CancelTimer(timer) => ServerAction::CancelTimer { connection_id, timer },
            ConnectionAction::CompleteRequest { request_id, result } => {
                ServerAction::RequestCompleted { connection_id, request_id, result }
            },
            ConnectionAction::Close { reason } => ServerAction::CloseConnection { connection_id, reason },
            ConnectionAction::Finish => ServerAction::Finish { connection_id },
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use pylon_core::Endpoint;
    use pylon_proto::{Identity, InvocationMode};

    use super::*;
    use crate::adapter::{DispatchResult, Servant};

    struct EchoServant;

    impl Servant for EchoServant {
        fn dispatch(&self, _current: Current, params: bytes::Bytes) -> crate::adapter::DispatchFuture {
            Box::pin(async move { Ok(DispatchResult::Ok(params)) })
        }
    }

    fn sample_request(request_id: i32) -> RequestBody {
        RequestBody {
            request_id,
            identity: Identity { category: String::new(), name: "hello".into() },
            facet: None,
            operation: "echo".into(),
            mode: InvocationMode::Normal,
            context: Vec::new(),
            params: bytes::Bytes::from_static(b"hi"),
        }
    }

    fn driver_with_active_connection() -> (ServerDriver<Instant>, u64) {
        let mut driver = ServerDriver::<Instant>::new(ServerConfig::default());
        let adapter = Arc::new(ObjectAdapter::new("Test", Vec::<Endpoint>::new()));
        adapter.activate();
        adapter
            .add_servant(Identity { category: String::new(), name: "hello".into() }, None, Arc::new(EchoServant))
            .unwrap();
        driver.register_adapter(adapter);

        let now = Instant::now();
        driver
            .handle_event(ServerEvent::ConnectionAccepted { connection_id: 1, adapter: "Test".into() }, now)
            .unwrap();
        driver
            .handle_event(
                ServerEvent::MessageReceived { connection_id: 1, message: Message::new(Body::ValidateConnection) },
                now,
            )
            .unwrap();
        (driver, 1)
    }

    #[test]
    fn accepted_connection_starts_connect_timer() {
        let mut driver = ServerDriver::<Instant>::new(ServerConfig::default());
        let now = Instant::now();
        let actions = driver
            .handle_event(ServerEvent::ConnectionAccepted { connection_id: 1, adapter: "Test".into() }, now)
            .unwrap();
        assert!(actions.iter().any(|a| matches!(a, ServerAction::StartTimer { timer: TimerKind::Connect, .. })));
        assert_eq!(driver.connection_count(), 1);
    }

    #[test]
    fn request_on_active_connection_emits_dispatch() {
        let (mut driver, connection_id) = driver_with_active_connection();
        let now = Instant::now();
        let actions = driver
            .handle_event(
                ServerEvent::MessageReceived {
                    connection_id,
                    message: Message::new(Body::Request(sample_request(7))),
                },
                now,
            )
            .unwrap();
        assert!(actions.iter().any(|a| matches!(a, ServerAction::Dispatch { .. })));
    }

    #[test]
    fn dispatch_completed_sends_reply() {
        let reply = ReplyBody {
            request_id: 7,
            status: pylon_proto::ReplyStatus::Ok,
            payload: bytes::Bytes::from_static(b"hi"),
        };
        let actions = on_dispatch_completed(1, Some(reply));
        assert!(matches!(actions.as_slice(), [ServerAction::SendMessage { .. }]));
    }

    #[test]
    fn dispatch_on_inactive_adapter_replies_unknown_local() {
        let mut driver = ServerDriver::<Instant>::new(ServerConfig::default());
        let adapter = Arc::new(ObjectAdapter::new("Test", Vec::<Endpoint>::new()));
        // Never activated.
        driver.register_adapter(adapter);

        let now = Instant::now();
        driver
            .handle_event(ServerEvent::ConnectionAccepted { connection_id: 1, adapter: "Test".into() }, now)
            .unwrap();
        driver
            .handle_event(
                ServerEvent::MessageReceived { connection_id: 1, message: Message::new(Body::ValidateConnection) },
                now,
            )
            .unwrap();

        let actions = driver
            .handle_event(
                ServerEvent::MessageReceived {
                    connection_id: 1,
                    message: Message::new(Body::Request(sample_request(7))),
                },
                now,
            )
            .unwrap();
        assert!(actions.iter().any(|a| matches!(a, ServerAction::SendMessage { .. })));
    }

    #[test]
    fn connection_closed_removes_entry() {
        let (mut driver, connection_id) = driver_with_active_connection();
        driver
            .handle_event(ServerEvent::ConnectionClosed { connection_id, reason: "peer gone".into() }, Instant::now())
            .unwrap();
        assert_eq!(driver.connection_count(), 0);
    }
}
