//! Communicator: the root container. Owns the property set, the
//! logger, the set of object adapters, and the server runtime they share;
//! creates proxies from stringified references.
//!
//! One driver, one transport, one environment: adapters are registered
//! against one shared [`pylon_server::Server`] before
//! [`Communicator::activate`] starts it, so the transport and driver are
//! fully wired before the server ever accepts a connection. Client-side
//! proxies created through [`Communicator::string_to_proxy`] share the
//! communicator's [`crate::properties::Properties`]-derived connection
//! config and retry policy rather than each hand-rolling their own.

#![allow(clippy::expect_used, reason = "lock poisoning should surface as a panic, not a recoverable error")]

use std::{collections::HashMap, net::SocketAddr, str::FromStr, sync::Arc, time::Duration};

use pylon_client::{ConnectionProvider, Proxy, RetryPolicy, TcpConnectionProvider};
use pylon_core::{connection::ConnectionConfig, endpoint::EndpointSelectionPolicy, reference::Reference, Endpoint};
use pylon_server::{adapter::ObjectAdapter, Server, ServerRuntimeConfig};
use tokio::{sync::Mutex as AsyncMutex, task::JoinHandle};

use crate::{
    error::CommunicatorError,
    logger::{Logger, TracingLogger},
    properties::Properties,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CommunicatorState {
    Initialized,
    Active,
    ShuttingDown,
    Destroyed,
}

/// Root runtime container: the thing application code creates once and
/// passes around.
pub struct Communicator {
    properties: Box<dyn Properties>,
    logger: Arc<dyn Logger>,
    connection_config: ConnectionConfig,
    retry_policy: RetryPolicy,
    endpoint_selection: EndpointSelectionPolicy,
    accept_class_cycles: bool,
    state: std::sync::Mutex<CommunicatorState>,
    server: AsyncMutex<Option<Server>>,
    adapters: std::sync::Mutex<HashMap<String, Arc<ObjectAdapter>>>,
    run_handle: AsyncMutex<Option<JoinHandle<Result<(), pylon_server::ServerError>>>>,
}

impl Communicator {
    /// Build a communicator from `properties`, using the default
    /// `tracing`-backed logger.
    #[must_use]
    pub fn new(properties: Box<dyn Properties>) -> Arc<Self> {
        Self::with_logger(properties, Arc::new(TracingLogger::new()))
    }

    /// Build a communicator from `properties` and an explicit logger,
    /// e.g. one installed through the [`Logger`] hook.
    #[must_use]
    pub fn with_logger(properties: Box<dyn Properties>, logger: Arc<dyn Logger>) -> Arc<Self> {
        let connection_config = connection_config_from_properties(properties.as_ref());
        let retry_policy = retry_policy_from_properties(properties.as_ref());
        let runtime_config = server_runtime_config_from_properties(properties.as_ref(), &connection_config);
        let endpoint_selection = properties
            .get("Default.EndpointSelection")
            .and_then(|v| v.parse().ok())
            .unwrap_or_default();
        let accept_class_cycles = properties
            .get("AcceptClassCycles")
            .is_some_and(|v| v == "1" || v.eq_ignore_ascii_case("true"));

        Arc::new(Self {
            properties,
            logger,
            connection_config,
            retry_policy,
            endpoint_selection,
            accept_class_cycles,
            state: std::sync::Mutex::new(CommunicatorState::Initialized),
            server: AsyncMutex::new(Some(Server::new(runtime_config))),
            adapters: std::sync::Mutex::new(HashMap::new()),
            run_handle: AsyncMutex::new(None),
        })
    }

    /// The communicator's property set.
    #[must_use]
    pub fn properties(&self) -> &dyn Properties {
        self.properties.as_ref()
    }

    /// The communicator's logger.
    #[must_use]
    pub fn logger(&self) -> Arc<dyn Logger> {
        self.logger.clone()
    }

    /// Whether this communicator's `AcceptClassCycles` property permits a
    /// cyclic object graph to be read back, rather than reporting a
    /// [`pylon_core::PylonError::MarshalError`] the moment a reference
    /// cycle is seen. Application code decoding a value graph with
    /// [`pylon_core::value::ValueReader`] should pass this through rather
    /// than hand-rolling its own default, so the property actually governs
    /// every decode this communicator's servants perform.
    #[must_use]
    pub fn accept_class_cycles(&self) -> bool {
        self.accept_class_cycles
    }

    /// Create and register an object adapter listening on `addr`. Adapters
    /// may be registered any time before [`Self::destroy`]; they only
    /// start accepting connections once [`Self::activate`] runs.
    ///
    /// # Errors
    ///
    /// Returns [`CommunicatorError::AdapterAlreadyRegistered`] if `name` is
    /// taken, [`CommunicatorError::Destroyed`] if the communicator has
    /// already been destroyed, or [`CommunicatorError::Server`] if adding
    /// the adapter to the server runtime fails.
    pub async fn create_object_adapter(
        &self,
        name: impl Into<String>,
        addr: SocketAddr,
    ) -> Result<Arc<ObjectAdapter>, CommunicatorError> {
        let name = name.into();
        if *self.state.lock().expect("communicator state lock poisoned") == CommunicatorState::Destroyed {
            return Err(CommunicatorError::Destroyed);
        }
        if self.adapters.lock().expect("adapter table lock poisoned").contains_key(&name) {
            return Err(CommunicatorError::AdapterAlreadyRegistered(name));
        }

        let endpoints = vec![Endpoint::Tcp { host: addr.ip().to_string(), port: addr.port(), timeout_ms: 0 }];
        let adapter = Arc::new(ObjectAdapter::new(name.clone(), endpoints));

        {
            let mut guard = self.server.lock().await;
            let server = guard.as_mut().ok_or(CommunicatorError::Destroyed)?;
            server.add_adapter(adapter.clone(), addr).await?;
        }

        self.adapters.lock().expect("adapter table lock poisoned").insert(name, adapter.clone());
        Ok(adapter)
    }

    /// Start accepting connections on every adapter registered so far.
    /// Idempotent: calling this again once already active is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`CommunicatorError::Destroyed`] if the communicator has
    /// already been shut down or destroyed.
    pub async fn activate(self: &Arc<Self>) -> Result<(), CommunicatorError> {
        {
            let state = self.state.lock().expect("communicator state lock poisoned");
            match *state {
                CommunicatorState::Active => return Ok(()),
                CommunicatorState::ShuttingDown | CommunicatorState::Destroyed => {
                    return Err(CommunicatorError::Destroyed);
                },
                CommunicatorState::Initialized => {},
            }
        }

        let server = self.server.lock().await.take().ok_or(CommunicatorError::Destroyed)?;
        let handle = tokio::spawn(server.run());
        *self.run_handle.lock().await = Some(handle);
        *self.state.lock().expect("communicator state lock poisoned") = CommunicatorState::Active;
        Ok(())
    }

    /// Deactivate every registered adapter: new dispatches are refused,
    /// in-flight ones finish. Idempotent.
    pub fn shutdown(&self) {
        let mut state = self.state.lock().expect("communicator state lock poisoned");
        if matches!(*state, CommunicatorState::ShuttingDown | CommunicatorState::Destroyed) {
            return;
        }
        *state = CommunicatorState::ShuttingDown;
        drop(state);

        for adapter in self.adapters.lock().expect("adapter table lock poisoned").values() {
            adapter.deactivate();
        }
    }

    /// Block until the server's accept loop has ended (normally only after
    /// [`Self::destroy`] aborts it, since the accept loop otherwise runs
    /// forever). A communicator that was never [`Self::activate`]d returns
    /// immediately.
    ///
    /// # Errors
    ///
    /// Returns [`CommunicatorError::Server`] if the accept loop itself
    /// ended with an error.
    pub async fn wait_for_shutdown(&self) -> Result<(), CommunicatorError> {
        let handle = self.run_handle.lock().await.take();
        let Some(handle) = handle else { return Ok(()) };
        match handle.await {
            Ok(result) => Ok(result?),
            Err(_join_err) => Ok(()),
        }
    }

    /// Close connections and release resources. Idempotent; safe to call
    /// without having activated the communicator.
    pub async fn destroy(&self) {
        self.shutdown();

        if let Some(handle) = self.run_handle.lock().await.take() {
            handle.abort();
            let _ = handle.await;
        }

        for adapter in self.adapters.lock().expect("adapter table lock poisoned").values() {
            adapter.finish_deactivate();
            adapter.destroy();
        }

        *self.state.lock().expect("communicator state lock poisoned") = CommunicatorState::Destroyed;
    }

    /// Parse a stringified reference and build a proxy for it, sharing this
    /// communicator's connection config and retry policy.
    ///
    /// # Errors
    ///
    /// Returns [`CommunicatorError::InvalidReference`] if `s` doesn't parse,
    /// or [`CommunicatorError::Destroyed`] if the communicator has already
    /// been destroyed.
    pub fn string_to_proxy(&self, s: &str) -> Result<Proxy<TcpConnectionProvider>, CommunicatorError> {
        if *self.state.lock().expect("communicator state lock poisoned") == CommunicatorState::Destroyed {
            return Err(CommunicatorError::Destroyed);
        }
        let mut reference = Reference::from_str(s)?;
        reference.endpoint_selection = self.endpoint_selection;
        let provider = Arc::new(TcpConnectionProvider::new(self.connection_config.clone()));
        Ok(Proxy::with_provider(reference, provider, self.retry_policy.clone()))
    }

    /// Render a proxy back to its stringified form. Inverse of
    /// [`Self::string_to_proxy`]; round-trips for every reference.
    #[must_use]
    pub fn proxy_to_string<P: ConnectionProvider>(&self, proxy: &Proxy<P>) -> String {
        proxy.reference().to_string()
    }
}

fn connection_config_from_properties(props: &dyn Properties) -> ConnectionConfig {
    let mut config = ConnectionConfig::default();
    if let Some(ms) = props.get("Connection.IdleTimeout").and_then(|v| v.parse().ok()) {
        config.idle_timeout = Duration::from_millis(ms);
    }
    if let Some(ms) = props.get("Connection.InactivityTimeout").and_then(|v| v.parse().ok()) {
        config.inactivity_timeout = Duration::from_millis(ms);
    }
    config
}

fn retry_policy_from_properties(props: &dyn Properties) -> RetryPolicy {
    let Some(raw) = props.get("RetryIntervals") else { return RetryPolicy::default() };
    let intervals: Vec<Duration> =
        raw.split(',').filter_map(|s| s.trim().parse::<u64>().ok()).map(Duration::from_millis).collect();
    if intervals.is_empty() { RetryPolicy::default() } else { RetryPolicy::new(intervals) }
}

fn thread_pool_config_from_properties(props: &dyn Properties, prefix: &str) -> pylon_server::reactor::ThreadPoolConfig {
    let mut config = pylon_server::reactor::ThreadPoolConfig::default();
    if let Some(n) = props.get(&format!("{prefix}.Size")).and_then(|v| v.parse().ok()) {
        config.size = n;
    }
    if let Some(n) = props.get(&format!("{prefix}.SizeMax")).and_then(|v| v.parse().ok()) {
        config.size_max = n;
    }
    if let Some(v) = props.get(&format!("{prefix}.Serialize")) {
        config.serialize = v == "1" || v.eq_ignore_ascii_case("true");
    }
    config
}

fn server_runtime_config_from_properties(
    props: &dyn Properties,
    connection_config: &ConnectionConfig,
) -> ServerRuntimeConfig {
    let message_size_max = props
        .get("MessageSizeMax")
        .and_then(|v| v.parse::<usize>().ok())
        .map_or(pylon_server::DEFAULT_MESSAGE_SIZE_MAX, |kb| kb * 1024);
    let max_connections =
        props.get("Server.MaxConnections").and_then(|v| v.parse().ok()).unwrap_or(4096);

    ServerRuntimeConfig {
        driver: pylon_server::ServerConfig { connection: connection_config.clone(), max_connections },
        thread_pool: thread_pool_config_from_properties(props, "ThreadPool.Server"),
        message_size_max,
    }
}

#[cfg(test)]
mod tests {
    use std::net::TcpListener as StdTcpListener;

    use super::*;
    use crate::properties::MapProperties;

    fn free_port() -> SocketAddr {
        let listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        addr
    }

    #[test]
    fn connection_config_reads_idle_and_inactivity_timeouts() {
        let mut props = MapProperties::new();
        props.set("Connection.IdleTimeout", "5000");
        props.set("Connection.InactivityTimeout", "9000");
        let config = connection_config_from_properties(&props);
        assert_eq!(config.idle_timeout, Duration::from_millis(5000));
        assert_eq!(config.inactivity_timeout, Duration::from_millis(9000));
    }

    #[test]
    fn accept_class_cycles_defaults_to_false_and_honors_the_property() {
        let communicator = Communicator::new(Box::new(MapProperties::new()));
        assert!(!communicator.accept_class_cycles());

        let mut props = MapProperties::new();
        props.set("AcceptClassCycles", "1");
        let communicator = Communicator::new(Box::new(props));
        assert!(communicator.accept_class_cycles());
    }

    #[test]
    fn retry_policy_parses_comma_separated_ms() {
        let mut props = MapProperties::new();
        props.set("RetryIntervals", "0, 25, 250");
        let policy = retry_policy_from_properties(&props);
        assert_eq!(
            policy.intervals(),
            &[Duration::ZERO, Duration::from_millis(25), Duration::from_millis(250)]
        );
    }

    #[tokio::test]
    async fn string_to_proxy_applies_configured_endpoint_selection() {
        let mut props = MapProperties::new();
        props.set("Default.EndpointSelection", "Ordered");
        let communicator = Communicator::new(Box::new(props));
        let proxy = communicator.string_to_proxy("hello:tcp -h 127.0.0.1 -p 4061").unwrap();
        assert_eq!(proxy.reference().endpoint_selection, EndpointSelectionPolicy::Ordered);
    }

    #[tokio::test]
    async fn string_to_proxy_then_proxy_to_string_round_trips() {
        let communicator = Communicator::new(Box::new(MapProperties::new()));
        let proxy = communicator.string_to_proxy("hello:tcp -h 127.0.0.1 -p 4061").unwrap();
        let rendered = communicator.proxy_to_string(&proxy);
        let reparsed = communicator.string_to_proxy(&rendered).unwrap();
        assert_eq!(proxy.reference(), reparsed.reference());
    }

    #[tokio::test]
    async fn create_adapter_twice_under_same_name_fails() {
        let communicator = Communicator::new(Box::new(MapProperties::new()));
        let addr = free_port();
        communicator.create_object_adapter("Test", addr).await.unwrap();
        let err = communicator.create_object_adapter("Test", free_port()).await.unwrap_err();
        assert!(matches!(err, CommunicatorError::AdapterAlreadyRegistered(_)));
    }

    #[tokio::test]
    async fn destroy_is_idempotent_without_activate() {
        let communicator = Communicator::new(Box::new(MapProperties::new()));
        communicator.destroy().await;
        communicator.destroy().await;
        let err = communicator.string_to_proxy("hello:tcp -h 127.0.0.1 -p 4061").unwrap_err();
        assert!(matches!(err, CommunicatorError::Destroyed));
    }

    #[tokio::test]
    async fn activate_then_destroy_stops_accept_loop() {
        let communicator = Communicator::new(Box::new(MapProperties::new()));
        let addr = free_port();
        communicator.create_object_adapter("Test", addr).await.unwrap();
        communicator.activate().await.unwrap();
        assert!(matches!(communicator.activate().await, Ok(())));

        communicator.destroy().await;
        communicator.wait_for_shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn destroy_drives_every_adapter_to_destroyed() {
        let communicator = Communicator::new(Box::new(MapProperties::new()));
        let adapter = communicator.create_object_adapter("Test", free_port()).await.unwrap();
        communicator.destroy().await;
        assert_eq!(adapter.state(), pylon_server::adapter::AdapterState::Destroyed);
        assert!(!adapter.can_dispatch());
    }
}
