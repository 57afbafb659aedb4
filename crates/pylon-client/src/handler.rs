//! Request-handler cache: turns a reference's endpoint list into a live
//! [`ClientConnection`], establishing it lazily and sharing it across every
//! invocation that reuses the same cached handler.
//!
//! A lock-guarded slot plus a narrower lock serializing the slow path:
//! concurrent callers that find the slot empty queue behind `connect_lock`
//! rather than racing to dial the same peer twice; whichever one wins the
//! lock populates the slot for everyone still waiting.

use std::sync::Arc;

use async_trait::async_trait;
use pylon_core::{connection::ConnectionConfig, endpoint::Endpoint};
use tokio::sync::Mutex;

use crate::{connection::ClientConnection, error::ClientError};

/// Establishes a [`ClientConnection`] to one of a reference's endpoints.
/// Exists as a trait so tests (and `pylon-harness`'s simulation driver) can
/// substitute a provider that dials through a virtualized network instead
/// of real TCP sockets.
#[async_trait]
pub trait ConnectionProvider: Send + Sync {
    /// Connect to the first reachable endpoint in `endpoints`, in order.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::NoEndpoints`] if `endpoints` is empty, or the
    /// last endpoint's connect failure otherwise.
    async fn connect(&self, endpoints: &[Endpoint]) -> Result<Arc<ClientConnection>, ClientError>;
}

/// Dials real TCP sockets, trying each endpoint in order until one succeeds.
pub struct TcpConnectionProvider {
    config: ConnectionConfig,
}

impl TcpConnectionProvider {
    /// Build a provider that establishes connections with `config`.
    #[must_use]
    pub fn new(config: ConnectionConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl ConnectionProvider for TcpConnectionProvider {
    async fn connect(&self, endpoints: &[Endpoint]) -> Result<Arc<ClientConnection>, ClientError> {
        if endpoints.is_empty() {
            return Err(ClientError::NoEndpoints);
        }

        let mut last_err = None;
        for endpoint in endpoints {
            let Endpoint::Tcp { host, port, timeout_ms } = endpoint;
            let addr = match resolve(host, *port).await {
                Ok(addr) => addr,
                Err(err) => {
                    last_err = Some(err);
                    continue;
                },
            };
            let mut config = self.config.clone();
            if *timeout_ms > 0 {
                config.connect_timeout = std::time::Duration::from_millis(u64::from(*timeout_ms));
            }
            match ClientConnection::connect(addr, config).await {
                Ok(conn) => return Ok(conn),
                Err(err) => last_err = Some(err),
            }
        }

        Err(last_err.unwrap_or(ClientError::NoEndpoints))
    }
}

async fn resolve(host: &str, port: u16) -> Result<std::net::SocketAddr, ClientError> {
    tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| ClientError::Core(pylon_core::error::PylonError::DnsError(e.to_string())))?
        .next()
        .ok_or_else(|| ClientError::Core(pylon_core::error::PylonError::DnsError(format!("no address for {host}"))))
}

/// Per-proxy cache turning a reference's endpoint list into a shared,
/// lazily-established connection.
pub struct RequestHandlerCache<P: ConnectionProvider> {
    provider: Arc<P>,
    cached: Mutex<Option<Arc<ClientConnection>>>,
    connect_lock: Mutex<()>,
}

impl<P: ConnectionProvider> RequestHandlerCache<P> {
    /// Build an empty cache backed by `provider`.
    #[must_use]
    pub fn new(provider: Arc<P>) -> Self {
        Self { provider, cached: Mutex::new(None), connect_lock: Mutex::new(()) }
    }

    /// Return the cached handler if it's still alive, otherwise establish a
    /// new one against `endpoints` and cache it.
    ///
    /// Concurrent calls that both observe an empty cache serialize on the
    /// connect path rather than dialing twice; if the first connect fails,
    /// the next waiter retries independently rather than inheriting the
    /// same failure, since nothing observable changed on the peer to make
    /// a second attempt any less likely to succeed.
    ///
    /// # Errors
    ///
    /// Returns whatever [`ConnectionProvider::connect`] returns.
    pub async fn get_request_handler(&self, endpoints: &[Endpoint]) -> Result<Arc<ClientConnection>, ClientError> {
        if let Some(handler) = self.cached.lock().await.clone() {
            if handler.is_alive() {
                return Ok(handler);
            }
        }

        let _guard = self.connect_lock.lock().await;

        if let Some(handler) = self.cached.lock().await.clone() {
            if handler.is_alive() {
                return Ok(handler);
            }
        }

        let handler = self.provider.connect(endpoints).await?;
        *self.cached.lock().await = Some(handler.clone());
        Ok(handler)
    }

    /// Drop the cached handler if it is (by pointer identity) `handler`.
    /// A no-op if the cache has already moved on to a different connection
    /// (e.g. a concurrent reconnect already replaced it).
    pub async fn clear_cached_request_handler(&self, handler: &Arc<ClientConnection>) {
        let mut cached = self.cached.lock().await;
        if let Some(current) = cached.as_ref() {
            if Arc::ptr_eq(current, handler) {
                *cached = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use pylon_server::{adapter::ObjectAdapter, Server, ServerRuntimeConfig};

    use super::*;

    struct CountingProvider {
        inner: TcpConnectionProvider,
        attempts: AtomicUsize,
    }

    #[async_trait]
    impl ConnectionProvider for CountingProvider {
        async fn connect(&self, endpoints: &[Endpoint]) -> Result<Arc<ClientConnection>, ClientError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            self.inner.connect(endpoints).await
        }
    }

    async fn running_server() -> (std::net::SocketAddr, tokio::task::JoinHandle<()>) {
        let addr: std::net::SocketAddr = "127.0.0.1:0".parse().unwrap();
        let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
        let bound = listener.local_addr().unwrap();
        drop(listener);

        let mut server = Server::new(ServerRuntimeConfig::default());
        let adapter = Arc::new(ObjectAdapter::new("Test", Vec::new()));
        server.add_adapter(adapter, bound).await.unwrap();
        let handle = tokio::spawn(async move {
            let _ = server.run().await;
        });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        (bound, handle)
    }

    #[tokio::test]
    async fn reuses_cached_handler_without_reconnecting() {
        let (addr, _server) = running_server().await;
        let endpoints =
            vec![Endpoint::Tcp { host: addr.ip().to_string(), port: addr.port(), timeout_ms: 0 }];
        let provider =
            Arc::new(CountingProvider { inner: TcpConnectionProvider::new(ConnectionConfig::default()), attempts: AtomicUsize::new(0) });
        let cache = RequestHandlerCache::new(provider.clone());

        let first = cache.get_request_handler(&endpoints).await.unwrap();
        let second = cache.get_request_handler(&endpoints).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(provider.attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn clear_drops_only_matching_handler() {
        let (addr, _server) = running_server().await;
        let endpoints =
            vec![Endpoint::Tcp { host: addr.ip().to_string(), port: addr.port(), timeout_ms: 0 }];
        let provider = Arc::new(TcpConnectionProvider::new(ConnectionConfig::default()));
        let cache = RequestHandlerCache::new(provider);

        let first = cache.get_request_handler(&endpoints).await.unwrap();
        cache.clear_cached_request_handler(&first).await;

        let second = cache.get_request_handler(&endpoints).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
    }
}
