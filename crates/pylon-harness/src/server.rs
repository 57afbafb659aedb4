//! Simulation server wrapper for testing with turmoil.
//!
//! `SimServer` is a turmoil-native sibling of `pylon_server::Server`: same
//! driver, same [`ObjectAdapter`]/[`DispatchEngine`] dispatch path, same
//! timer-wiring shape (`StartTimer` spawns a sleeping task that feeds
//! `TimerFired` back through the driver), but over [`SimTransceiver`]
//! instead of a real TCP socket. The driver's own clock is
//! `tokio::time::Instant`, which turmoil virtualizes inside `sim.host()`;
//! `SimEnv` is the matching seeded clock/RNG for client-side code under
//! test, not something `SimServer` itself needs to hold.
//!
//! ## Architecture
//!
//! ```text
//! SimServer
//!   ├─ ServerDriver<tokio::time::Instant>  (sans-IO core, pylon-server)
//!   ├─ turmoil::net::TcpListener
//!   └─ connections: HashMap<u64, SimConnectionState>
//! ```

use std::{collections::HashMap, sync::Arc};

use bytes::BytesMut;
use pylon_core::{connection::TimerKind, PylonError};
use pylon_proto::{Message, MessageHeader};
use pylon_server::{
    adapter::{Current, ObjectAdapter},
    dispatch::DispatchEngine,
    LogLevel, ServerAction, ServerConfig, ServerDriver, ServerEvent, DEFAULT_MESSAGE_SIZE_MAX,
};
use tokio::{
    sync::Mutex,
    task::JoinHandle,
};
use turmoil::net::{TcpListener, TcpStream};

use crate::transceiver::SimTransceiver;

struct ConnectionHandle {
    transceiver: Mutex<SimTransceiver>,
}

#[derive(Clone)]
struct Shared {
    driver: Arc<Mutex<ServerDriver<tokio::time::Instant>>>,
    adapters: Arc<HashMap<String, Arc<ObjectAdapter>>>,
    connections: Arc<Mutex<HashMap<u64, Arc<ConnectionHandle>>>>,
    timers: Arc<Mutex<HashMap<(u64, TimerKind), JoinHandle<()>>>>,
}

/// Simulation server: binds a turmoil `TcpListener` and drives
/// `pylon_server`'s dispatch path against it, deterministically.
///
/// Designed for test-driven usage: tests call [`Self::accept_connection`]
/// and [`Self::process_next_message`] explicitly rather than the server
/// running an autonomous accept loop, so scenario tests can interleave
/// assertions between each step.
pub struct SimServer {
    shared: Shared,
    listener: TcpListener,
    next_connection_id: u64,
    message_size_max: usize,
}

impl SimServer {
    /// Bind a simulation server with the default driver configuration.
    pub async fn bind(address: &str) -> std::io::Result<Self> {
        Self::bind_with_config(address, ServerConfig::default()).await
    }

    /// Bind a simulation server with a custom driver configuration.
    pub async fn bind_with_config(address: &str, config: ServerConfig) -> std::io::Result<Self> {
        let listener = TcpListener::bind(address).await?;
        Ok(Self {
            shared: Shared {
                driver: Arc::new(Mutex::new(ServerDriver::new(config))),
                adapters: Arc::new(HashMap::new()),
                connections: Arc::new(Mutex::new(HashMap::new())),
                timers: Arc::new(Mutex::new(HashMap::new())),
            },
            listener,
            next_connection_id: 1,
            message_size_max: DEFAULT_MESSAGE_SIZE_MAX,
        })
    }

    /// Register and activate an object adapter that incoming connections
    /// dispatch against.
    pub async fn add_adapter(&mut self, adapter: Arc<ObjectAdapter>) {
        adapter.activate();
        self.shared.driver.lock().await.register_adapter(adapter.clone());
        let mut adapters = (*self.shared.adapters).clone();
        adapters.insert(adapter.name().to_string(), adapter);
        self.shared.adapters = Arc::new(adapters);
    }

    /// Accept one connection and drive its `ConnectionAccepted` event
    /// through to completion, returning the new connection's id.
    pub async fn accept_connection(&mut self, adapter_name: impl Into<String>) -> std::io::Result<u64> {
        let (stream, _peer) = self.listener.accept().await?;
        Ok(self.register_stream(stream, adapter_name.into()).await)
    }

    async fn register_stream(&mut self, stream: TcpStream, adapter_name: String) -> u64 {
        let connection_id = self.next_connection_id;
        self.next_connection_id += 1;

        let handle = Arc::new(ConnectionHandle { transceiver: Mutex::new(SimTransceiver::new(stream)) });
        self.shared.connections.lock().await.insert(connection_id, handle);

        let now = tokio::time::Instant::now();
        #[allow(clippy::expect_used)]
        let actions = self
            .shared
            .driver
            .lock()
            .await
            .handle_event(ServerEvent::ConnectionAccepted { connection_id, adapter: adapter_name }, now)
            .expect("accepting a fresh connection id never fails");
        execute_actions(&self.shared, actions).await;
        connection_id
    }

    /// Read one complete message off `connection_id` and drive it through
    /// the driver, running any resulting dispatch inline.
    pub async fn process_next_message(&mut self, connection_id: u64) -> Result<(), PylonError> {
        let handle = self
            .shared
            .connections
            .lock()
            .await
            .get(&connection_id)
            .cloned()
            .ok_or_else(|| PylonError::MarshalError("unknown connection".into()))?;

        let mut header_buf = [0u8; MessageHeader::SIZE];
        {
            let mut transceiver = handle.transceiver.lock().await;
            read_exact(&mut transceiver, &mut header_buf).await?;
        }
        let declared =
            MessageHeader::from_bytes(&header_buf, self.message_size_max).map_err(PylonError::from)?.size() as usize;

        let mut full = BytesMut::with_capacity(declared);
        full.extend_from_slice(&header_buf);
        full.resize(declared, 0);
        {
            let mut transceiver = handle.transceiver.lock().await;
            read_exact(&mut transceiver, &mut full[MessageHeader::SIZE..]).await?;
        }

        let message = Message::decode(&full, self.message_size_max).map_err(PylonError::from)?;
        let now = tokio::time::Instant::now();
        let actions = {
            let mut driver = self.shared.driver.lock().await;
            driver.handle_event(ServerEvent::MessageReceived { connection_id, message }, now)?
        };
        execute_actions(&self.shared, actions).await;
        Ok(())
    }

    /// Mark `connection_id` closed from the transport side (e.g. the peer
    /// dropped the socket), driving the resulting actions.
    pub async fn close_connection(&mut self, connection_id: u64, reason: impl Into<String>) {
        self.shared.connections.lock().await.remove(&connection_id);
        let now = tokio::time::Instant::now();
        let actions = {
            let mut driver = self.shared.driver.lock().await;
            driver.handle_event(ServerEvent::ConnectionClosed { connection_id, reason: reason.into() }, now)
        };
        if let Ok(actions) = actions {
            execute_actions(&self.shared, actions).await;
        }
    }

    /// Number of connections the driver currently tracks.
    pub async fn connection_count(&self) -> usize {
        self.shared.connections.lock().await.len()
    }
}

async fn read_exact(transceiver: &mut SimTransceiver, buf: &mut [u8]) -> Result<(), PylonError> {
    use pylon_server::transceiver::Transceiver;
    transceiver.read_exact(buf).await.map_err(|e| PylonError::MarshalError(e.to_string()))
}

async fn execute_actions(shared: &Shared, actions: Vec<ServerAction>) {
    use pylon_server::transceiver::Transceiver;

    for action in actions {
        match action {
            ServerAction::SendMessage { connection_id, message } => {
                let Some(handle) = shared.connections.lock().await.get(&connection_id).cloned() else { continue };
                let Ok(bytes) = message.encode() else { continue };
                let _ = handle.transceiver.lock().await.write_all(&bytes).await;
            },
            ServerAction::Dispatch { connection_id, adapter, current, params } => {
                dispatch_inline(shared, connection_id, &adapter, current, params).await;
            },
            ServerAction::CloseConnection { connection_id, reason } => {
                tracing::debug!(connection_id, %reason, "sim: closing connection");
                if let Some(handle) = shared.connections.lock().await.get(&connection_id) {
                    handle.transceiver.lock().await.close().await;
                }
            },
            ServerAction::StartTimer { connection_id, timer, duration } => {
                start_timer(shared, connection_id, timer, duration).await;
            },
            ServerAction::CancelTimer { connection_id, timer } => {
                if let Some(handle) = shared.timers.lock().await.remove(&(connection_id, timer)) {
                    handle.abort();
                }
            },
            ServerAction::Finish { connection_id } => {
                shared.connections.lock().await.remove(&connection_id);
            },
            ServerAction::Log { level, message } => log_at(level, &message),
            ServerAction::RequestCompleted { .. } => {},
        }
    }
}

async fn dispatch_inline(shared: &Shared, connection_id: u64, adapter_name: &str, current: Current, params: bytes::Bytes) {
    use pylon_server::transceiver::Transceiver;

    let Some(adapter) = shared.adapters.get(adapter_name) else { return };
    let reply = DispatchEngine::dispatch(adapter, current, params).await;
    let now = tokio::time::Instant::now();
    let actions = {
        let mut driver = shared.driver.lock().await;
        driver.handle_event(ServerEvent::DispatchCompleted { connection_id, reply }, now)
    };
    if let Ok(actions) = actions {
        for action in actions {
            if let ServerAction::SendMessage { connection_id, message } = action {
                let Some(handle) = shared.connections.lock().await.get(&connection_id).cloned() else { continue };
                let Ok(bytes) = message.encode() else { continue };
                let _ = handle.transceiver.lock().await.write_all(&bytes).await;
            }
        }
    }
}

async fn start_timer(shared: &Shared, connection_id: u64, timer: TimerKind, duration: std::time::Duration) {
    let task_shared = shared.clone();
    let handle = tokio::spawn(async move {
        tokio::time::sleep(duration).await;
        task_shared.timers.lock().await.remove(&(connection_id, timer));

        let now = tokio::time::Instant::now();
        let actions = {
            let mut driver = task_shared.driver.lock().await;
            driver.handle_event(ServerEvent::TimerFired { connection_id, timer }, now)
        };
        if let Ok(actions) = actions {
            execute_actions(&task_shared, actions).await;
        }
    });
    if let Some(previous) = shared.timers.lock().await.insert((connection_id, timer), handle) {
        previous.abort();
    }
}

fn log_at(level: LogLevel, message: &str) {
    match level {
        LogLevel::Trace => tracing::trace!("{message}"),
        LogLevel::Debug => tracing::debug!("{message}"),
        LogLevel::Info => tracing::info!("{message}"),
        LogLevel::Warn => tracing::warn!("{message}"),
        LogLevel::Error => tracing::error!("{message}"),
    }
}
