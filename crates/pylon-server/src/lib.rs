//! Production server-side runtime: object adapter, dispatch engine, and a
//! TCP transceiver/reactor wired around [`pylon_core::connection::Connection`].
//!
//! # Architecture
//!
//! This crate is the server-side half of the driver pattern: [`driver`]
//! holds the pure, action-based [`ServerDriver`] (no I/O, deterministically
//! testable), while [`Server`] wraps it with real [`tokio`] sockets and a
//! [`reactor::ThreadPool`] bounding concurrent dispatch. `pylon-runtime`'s
//! `Communicator` owns one `Server` (or more, for multiple adapters) and is
//! the thing application code actually talks to.
//!
//! # Components
//!
//! - [`ServerDriver`]: action-based orchestrator (pure logic, no I/O)
//! - [`adapter::ObjectAdapter`]: servant table, facet/locator lookup, lifecycle
//! - [`dispatch::DispatchEngine`]: resolves a servant and runs one invocation
//! - [`reactor::ThreadPool`]: bounds concurrent dispatch, one token per connection
//! - [`transceiver::TcpTransceiver`]: the bundled TCP transport
//! - [`Server`]: production runtime that accepts connections and executes `ServerAction`s

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod adapter;
pub mod dispatch;
mod driver;
mod error;
pub mod reactor;
pub mod system_env;
pub mod transceiver;

use std::{collections::HashMap, net::SocketAddr, sync::Arc, time::{Duration, Instant}};

use bytes::BytesMut;
pub use driver::{LogLevel, ServerAction, ServerConfig, ServerDriver, ServerEvent};
pub use error::{AdapterError, DispatchError, ServerError, TransceiverError};
use pylon_core::{connection::TimerKind, PylonError};
use pylon_proto::{Message, MessageHeader};
use reactor::{HandlerToken, ThreadPool, ThreadPoolConfig};
pub use system_env::SystemEnv;
use tokio::{net::TcpListener, sync::Mutex, task::JoinHandle};
use transceiver::{IdleTimeoutTransceiver, TcpTransceiver, Transceiver};

use crate::{adapter::ObjectAdapter, dispatch::DispatchEngine};

/// Maximum accepted message size, guarding against a malicious or
/// miscompiled peer claiming an enormous frame.
pub const DEFAULT_MESSAGE_SIZE_MAX: usize = 16 * 1024 * 1024;

/// Production server runtime configuration.
#[derive(Debug, Clone)]
pub struct ServerRuntimeConfig {
    /// Driver configuration (connection timeouts, connection cap).
    pub driver: ServerConfig,
    /// Thread pool / reactor configuration.
    pub thread_pool: ThreadPoolConfig,
    /// Maximum accepted message size in bytes.
    pub message_size_max: usize,
}

impl Default for ServerRuntimeConfig {
    fn default() -> Self {
        Self {
            driver: ServerConfig::default(),
            thread_pool: ThreadPoolConfig::default(),
            message_size_max: DEFAULT_MESSAGE_SIZE_MAX,
        }
    }
}

struct ConnectionHandle {
    transceiver: Mutex<IdleTimeoutTransceiver<TcpTransceiver>>,
    token: HandlerToken,
}

/// State shared between the accept loops, dispatch tasks, and timer
/// callbacks — everything [`execute_actions`] needs that isn't tied to a
/// single `&self` borrow, so it can be cloned into a freshly spawned task
/// and keep feeding [`ServerAction`]s back through the driver on its own.
#[derive(Clone)]
struct Shared {
    driver: Arc<Mutex<ServerDriver<Instant>>>,
    adapters: Arc<HashMap<String, Arc<ObjectAdapter>>>,
    pool: Arc<ThreadPool>,
    connections: Arc<Mutex<HashMap<u64, Arc<ConnectionHandle>>>>,
    timers: Arc<Mutex<HashMap<(u64, TimerKind), JoinHandle<()>>>>,
    idle_timeout: Duration,
}

/// Production server: owns one [`ServerDriver`], a set of registered
/// [`ObjectAdapter`]s with bound TCP listeners, and a [`ThreadPool`]
/// bounding concurrent dispatch.
pub struct Server {
    shared: Shared,
    listeners: HashMap<String, SocketAddr>,
    config: ServerRuntimeConfig,
    next_connection_id: std::sync::atomic::AtomicU64,
}

impl Server {
    /// Create a server with no adapters yet registered.
    #[must_use]
    pub fn new(config: ServerRuntimeConfig) -> Self {
        let pool = Arc::new(ThreadPool::new(config.thread_pool.clone()));
        let driver = Arc::new(Mutex::new(ServerDriver::new(config.driver.clone())));
        let idle_timeout = config.driver.connection.idle_timeout;
        Self {
            shared: Shared {
                driver,
                adapters: Arc::new(HashMap::new()),
                pool,
                connections: Arc::new(Mutex::new(HashMap::new())),
                timers: Arc::new(Mutex::new(HashMap::new())),
                idle_timeout,
            },
            listeners: HashMap::new(),
            config,
            next_connection_id: std::sync::atomic::AtomicU64::new(1),
        }
    }

    /// Bind and register an object adapter, listening on `addr`.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Io`] if the bind fails.
    pub async fn add_adapter(&mut self, adapter: Arc<ObjectAdapter>, addr: SocketAddr) -> Result<(), ServerError> {
        adapter.activate();
        self.shared.driver.lock().await.register_adapter(adapter.clone());
        let mut adapters = (*self.shared.adapters).clone();
        adapters.insert(adapter.name().to_string(), adapter.clone());
        self.shared.adapters = Arc::new(adapters);
        self.listeners.insert(adapter.name().to_string(), addr);
        Ok(())
    }

    /// Run the server, accepting connections on every registered adapter's
    /// listener and dispatching requests against it, until an accept loop
    /// errors out.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Io`] if binding any adapter's listener fails.
    pub async fn run(self) -> Result<(), ServerError> {
        let mut listeners = Vec::new();
        for (name, addr) in &self.listeners {
            let listener = TcpListener::bind(*addr).await?;
            tracing::info!(adapter = %name, addr = %listener.local_addr()?, "adapter listening");
            listeners.push((name.clone(), listener));
        }

        let shared = self.shared;
        let message_size_max = self.config.message_size_max;
        let next_connection_id = Arc::new(self.next_connection_id);
        let mut tasks = Vec::new();
        for (adapter_name, listener) in listeners {
            let shared = shared.clone();
            let next_connection_id = next_connection_id.clone();
            tasks.push(tokio::spawn(async move {
                loop {
                    match listener.accept().await {
                        Ok((stream, peer)) => {
                            let shared = shared.clone();
                            let adapter_name = adapter_name.clone();
                            let connection_id =
                                next_connection_id.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                            tokio::spawn(async move {
                                if let Err(err) =
                                    handle_connection(shared, connection_id, stream, adapter_name, message_size_max)
                                        .await
                                {
                                    tracing::debug!(%peer, %err, "connection ended");
                                }
                            });
                        },
                        Err(err) => tracing::warn!(%err, "accept failed"),
                    }
                }
            }));
        }

        for task in tasks {
            let _ = task.await;
        }
        Ok(())
    }
}

async fn handle_connection(
    shared: Shared,
    connection_id: u64,
    stream: tokio::net::TcpStream,
    adapter_name: String,
    message_size_max: usize,
) -> Result<(), ServerError> {
    let transceiver = IdleTimeoutTransceiver::new(TcpTransceiver::new(stream), shared.idle_timeout);
    let handle = Arc::new(ConnectionHandle { transceiver: Mutex::new(transceiver), token: HandlerToken::new() });
    shared.connections.lock().await.insert(connection_id, handle.clone());

    let now = Instant::now();
    let actions = {
        let mut driver = shared.driver.lock().await;
        driver.handle_event(ServerEvent::ConnectionAccepted { connection_id, adapter: adapter_name }, now)?
    };
    execute_actions(&shared, actions).await?;

    let result = tokio::select! {
        result = read_loop(&shared, connection_id, &handle, message_size_max) => result,
        () = heartbeat_loop(&handle) => Ok(()),
    };

    shared.connections.lock().await.remove(&connection_id);
    cancel_all_timers(&shared, connection_id).await;
    let now = Instant::now();
    let actions = {
        let mut driver = shared.driver.lock().await;
        driver.handle_event(ServerEvent::ConnectionClosed { connection_id, reason: "read loop ended".into() }, now)?
    };
    execute_actions(&shared, actions).await?;

    result
}

async fn read_loop(
    shared: &Shared,
    connection_id: u64,
    handle: &Arc<ConnectionHandle>,
    message_size_max: usize,
) -> Result<(), ServerError> {
    loop {
        let mut header_buf = [0u8; MessageHeader::SIZE];
        handle.transceiver.lock().await.read_exact(&mut header_buf).await?;
        let declared =
            MessageHeader::from_bytes(&header_buf, message_size_max).map_err(PylonError::from)?.size() as usize;

        let mut full = BytesMut::with_capacity(declared);
        full.extend_from_slice(&header_buf);
        full.resize(declared, 0);
        handle.transceiver.lock().await.read_exact(&mut full[MessageHeader::SIZE..]).await?;

        let message = Message::decode(&full, message_size_max).map_err(PylonError::from)?;
        let now = Instant::now();
        let actions = {
            let mut driver = shared.driver.lock().await;
            driver.handle_event(ServerEvent::MessageReceived { connection_id, message }, now)?
        };
        execute_actions(shared, actions).await?;
    }
}

/// Write a `ValidateConnection` heartbeat at half the idle timeout, for as
/// long as writes keep succeeding. Raced against [`read_loop`] in
/// [`handle_connection`] so a dead heartbeat write ends the connection the
/// same way a dead read does; never returns on its own otherwise.
async fn heartbeat_loop(handle: &Arc<ConnectionHandle>) {
    let interval = handle.transceiver.lock().await.heartbeat_interval();
    loop {
        tokio::time::sleep(interval).await;
        if handle.transceiver.lock().await.write_heartbeat().await.is_err() {
            return;
        }
    }
}

/// Run one batch of [`ServerAction`]s against shared server state.
///
/// `StartTimer` spawns a sleeping task that, once it fires, feeds
/// `ServerEvent::TimerFired` back through the driver and recursively
/// executes whatever actions that produces — this is how
/// connect/close/idle/inactivity timeouts actually run in production,
/// rather than as no-op drops.
async fn execute_actions(shared: &Shared, actions: Vec<ServerAction>) -> Result<(), ServerError> {
    for action in actions {
        match action {
            ServerAction::SendMessage { connection_id, message } => {
                send(shared, connection_id, &message).await;
            },
            ServerAction::Dispatch { connection_id, adapter, current, params } => {
                spawn_dispatch(shared, connection_id, &adapter, current, params);
            },
            ServerAction::CloseConnection { connection_id, reason } => {
                tracing::info!(connection_id, %reason, "closing connection");
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
                cancel_all_timers(shared, connection_id).await;
                shared.connections.lock().await.remove(&connection_id);
            },
            ServerAction::Log { level, message } => log_at(level, &message),
            ServerAction::RequestCompleted { .. } => {},
        }
    }
    Ok(())
}

async fn start_timer(shared: &Shared, connection_id: u64, timer: TimerKind, duration: std::time::Duration) {
    let task_shared = shared.clone();
    let handle = tokio::spawn(async move {
        tokio::time::sleep(duration).await;
        task_shared.timers.lock().await.remove(&(connection_id, timer));

        let now = Instant::now();
        let actions = {
            let mut driver = task_shared.driver.lock().await;
            driver.handle_event(ServerEvent::TimerFired { connection_id, timer }, now)
        };
        if let Ok(actions) = actions {
            let _ = execute_actions(&task_shared, actions).await;
        }
    });
    if let Some(previous) = shared.timers.lock().await.insert((connection_id, timer), handle) {
        previous.abort();
    }
}

async fn cancel_all_timers(shared: &Shared, connection_id: u64) {
    let mut timers = shared.timers.lock().await;
    let keys: Vec<_> = timers.keys().filter(|(id, _)| *id == connection_id).copied().collect();
    for key in keys {
        if let Some(handle) = timers.remove(&key) {
            handle.abort();
        }
    }
}

async fn send(shared: &Shared, connection_id: u64, message: &Message) {
    let Some(handle) = shared.connections.lock().await.get(&connection_id).cloned() else { return };
    let Ok(bytes) = message.encode() else { return };
    if let Err(err) = handle.transceiver.lock().await.write_all(&bytes).await {
        tracing::warn!(connection_id, %err, "send failed");
    }
}

fn spawn_dispatch(shared: &Shared, connection_id: u64, adapter_name: &str, current: adapter::Current, params: bytes::Bytes) {
    let Some(adapter) = shared.adapters.get(adapter_name) else { return };
    let adapter = adapter.clone();
    let shared = shared.clone();
    tokio::spawn(async move {
        let token =
            shared.connections.lock().await.get(&connection_id).map(|h| h.token.clone()).unwrap_or_default();
        let reply = shared.pool.dispatch(&token, || DispatchEngine::dispatch(&adapter, current, params)).await;
        let now = Instant::now();
        let actions = {
            let mut driver = shared.driver.lock().await;
            driver.handle_event(ServerEvent::DispatchCompleted { connection_id, reply }, now)
        };
        if let Ok(actions) = actions {
            let _ = execute_actions(&shared, actions).await;
        }
    });
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

