//! Proxy (client-side handle): a [`Reference`] plus the machinery
//! (`handler` cache, retry policy) that turns an `invoke` call into bytes on
//! the wire and a decoded reply.
//!
//! Proxies are cheap value types: derivations (`with_context`,
//! `with_facet`, …) copy the [`Reference`] and start a fresh,
//! non-shared [`RequestHandlerCache`] — two proxies never contend over the
//! same cached connection slot even if they happen to address the same
//! peer, matching the "derivations share nothing mutable" rule.
//!
//! Whether a given operation is idempotent is ordinarily carried on the
//! IDL-generated stub method; without codegen, callers pass it explicitly
//! to [`Proxy::invoke`].

use std::sync::Arc;

use bytes::Bytes;
use pylon_core::{
    connection::ConnectionConfig,
    endpoint::{Endpoint, EndpointSelectionPolicy},
    error::PylonError,
    reference::{Locatable, Reference},
};
use pylon_proto::{Identity, InvocationMode, RequestBody};
use rand::seq::SliceRandom;

use crate::{
    error::{ClientError, Result},
    handler::{ConnectionProvider, RequestHandlerCache, TcpConnectionProvider},
    retry::{RetryDecision, RetryPolicy},
};

/// Client-side handle for one remote object. Wraps a [`Reference`] with the
/// connection-establishment and retry machinery needed to actually invoke
/// an operation on it.
pub struct Proxy<P: ConnectionProvider = TcpConnectionProvider> {
    reference: Reference,
    handler: RequestHandlerCache<P>,
    retry: RetryPolicy,
}

impl Proxy<TcpConnectionProvider> {
    /// Build a proxy dialing real TCP endpoints, using `config` for every
    /// connection it establishes and the default retry policy.
    #[must_use]
    pub fn new(reference: Reference, config: ConnectionConfig) -> Self {
        Self::with_provider(reference, Arc::new(TcpConnectionProvider::new(config)), RetryPolicy::default())
    }
}

impl<P: ConnectionProvider> Proxy<P> {
    /// Build a proxy with an explicit connection provider and retry policy,
    /// e.g. a simulation harness's virtualized dialer.
    #[must_use]
    pub fn with_provider(reference: Reference, provider: Arc<P>, retry: RetryPolicy) -> Self {
        Self { reference, handler: RequestHandlerCache::new(provider), retry }
    }

    /// The reference this proxy addresses.
    #[must_use]
    pub fn reference(&self) -> &Reference {
        &self.reference
    }

    /// Return a new proxy addressing the same identity through `facet`,
    /// with its own unshared connection cache.
    #[must_use]
    pub fn with_facet(&self, facet: impl Into<String>, provider: Arc<P>) -> Self {
        Self::with_provider(self.reference.with_facet(facet), provider, self.retry.clone())
    }

    /// Return a new proxy with `context` merged into every request it sends.
    #[must_use]
    pub fn with_context(&self, context: Vec<(String, String)>, provider: Arc<P>) -> Self {
        let mut reference = self.reference.clone();
        reference.context = context;
        Self::with_provider(reference, provider, self.retry.clone())
    }

    /// Invoke `operation` with `params`, retrying per [`RetryPolicy`] on
    /// transient failures until the budget is exhausted or a
    /// non-retryable/non-idempotent-after-send error is hit.
    ///
    /// `idempotent` must match the operation's IDL-declared idempotency;
    /// marking a mutating operation idempotent here would let the retry
    /// policy replay it after the peer has already executed it once.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::NoEndpoints`] if the reference resolves to no
    /// endpoints, or the terminal [`PylonError`] once retries are exhausted.
    pub async fn invoke(&self, operation: &str, params: Bytes, idempotent: bool) -> Result<Bytes> {
        let mut endpoints = match &self.reference.location {
            Locatable::Fixed(endpoints) => endpoints.clone(),
            Locatable::AdapterId(_) => {
                // Indirect references require a locator to resolve the
                // adapter id to endpoints; no locator is wired up yet.
                return Err(ClientError::NoEndpoints);
            },
        };
        if endpoints.is_empty() {
            return Err(ClientError::NoEndpoints);
        }
        if self.reference.endpoint_selection == EndpointSelectionPolicy::Random {
            endpoints.shuffle(&mut rand::thread_rng());
        }

        let twoway = self.reference.mode.expects_reply();

        let mut attempt = 0usize;
        loop {
            let mut already_sent = false;
            let outcome =
                self.try_once(&endpoints, operation, params.clone(), twoway, idempotent, &mut already_sent).await;

            let err = match outcome {
                Ok(bytes) => return Ok(bytes),
                Err(err) => err,
            };

            match self.retry.decide(&err, idempotent, already_sent, attempt) {
                RetryDecision::Retry(delay) => {
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    attempt += 1;
                },
                RetryDecision::Raise => return Err(err.into()),
            }
        }
    }

    async fn try_once(
        &self,
        endpoints: &[Endpoint],
        operation: &str,
        params: Bytes,
        twoway: bool,
        idempotent: bool,
        already_sent: &mut bool,
    ) -> std::result::Result<Bytes, PylonError> {
        let handler = self.handler.get_request_handler(endpoints).await.map_err(to_pylon_error)?;

        let request = RequestBody {
            request_id: 0,
            identity: Identity {
                category: self.reference.identity.category.clone(),
                name: self.reference.identity.name.clone(),
            },
            facet: self.reference.facet.clone(),
            operation: operation.to_string(),
            mode: if idempotent { InvocationMode::Idempotent } else { InvocationMode::Normal },
            context: self.reference.context.clone(),
            params,
        };

        *already_sent = true;
        let result = handler.invoke(request, twoway).await;
        if result.is_err() {
            self.handler.clear_cached_request_handler(&handler).await;
        }
        result
    }
}

fn to_pylon_error(err: ClientError) -> PylonError {
    match err {
        ClientError::Core(e) => e,
        ClientError::NoEndpoints => PylonError::ConnectFailed("no reachable endpoints".into()),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use pylon_core::endpoint::Endpoint;
    use pylon_proto::Identity;
    use pylon_server::{adapter::ObjectAdapter, Server, ServerRuntimeConfig};

    use super::*;

    struct EchoServant;

    impl pylon_server::adapter::Servant for EchoServant {
        fn dispatch(
            &self,
            _current: pylon_server::adapter::Current,
            params: Bytes,
        ) -> pylon_server::adapter::DispatchFuture {
            Box::pin(async move { Ok(pylon_server::adapter::DispatchResult::Ok(params)) })
        }
    }

    async fn running_echo_server() -> std::net::SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mut server = Server::new(ServerRuntimeConfig::default());
        let adapter = Arc::new(ObjectAdapter::new("Test", Vec::new()));
        adapter.activate();
        adapter
            .add_servant(Identity { category: String::new(), name: "hello".into() }, None, Arc::new(EchoServant))
            .unwrap();
        server.add_adapter(adapter, addr).await.unwrap();
        tokio::spawn(async move {
            let _ = server.run().await;
        });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        addr
    }

    #[tokio::test]
    async fn invoke_echoes_params_back() {
        let addr = running_echo_server().await;
        let reference = Reference::new(
            Identity { category: String::new(), name: "hello".into() },
            vec![Endpoint::Tcp { host: addr.ip().to_string(), port: addr.port(), timeout_ms: 0 }],
        );
        let proxy = Proxy::new(reference, ConnectionConfig::default());

        let reply = proxy.invoke("echo", Bytes::from_static(b"ping"), false).await.unwrap();
        assert_eq!(reply, Bytes::from_static(b"ping"));
    }

    #[tokio::test]
    async fn invoke_against_missing_identity_surfaces_object_not_exist() {
        let addr = running_echo_server().await;
        let reference = Reference::new(
            Identity { category: String::new(), name: "missing".into() },
            vec![Endpoint::Tcp { host: addr.ip().to_string(), port: addr.port(), timeout_ms: 0 }],
        );
        let proxy = Proxy::new(reference, ConnectionConfig::default());

        let err = proxy.invoke("echo", Bytes::new(), false).await.unwrap_err();
        assert!(matches!(err, ClientError::Core(PylonError::ObjectNotExist { .. })));
    }

    #[tokio::test]
    async fn invoke_with_no_endpoints_fails_fast() {
        let reference =
            Reference::new(Identity { category: String::new(), name: "hello".into() }, Vec::new());
        let proxy = Proxy::new(reference, ConnectionConfig::default());

        let err = proxy.invoke("echo", Bytes::new(), false).await.unwrap_err();
        assert!(matches!(err, ClientError::NoEndpoints));
    }

    struct RecordingProvider {
        inner: TcpConnectionProvider,
        seen: std::sync::Mutex<Vec<Vec<Endpoint>>>,
    }

    #[async_trait::async_trait]
    impl ConnectionProvider for RecordingProvider {
        async fn connect(&self, endpoints: &[Endpoint]) -> Result<Arc<crate::connection::ClientConnection>> {
            self.seen.lock().unwrap().push(endpoints.to_vec());
            self.inner.connect(endpoints).await
        }
    }

    #[tokio::test]
    async fn ordered_selection_preserves_endpoint_order() {
        let addr = running_echo_server().await;
        let endpoints = vec![
            Endpoint::Tcp { host: "127.0.0.1".into(), port: 1, timeout_ms: 0 },
            Endpoint::Tcp { host: addr.ip().to_string(), port: addr.port(), timeout_ms: 0 },
        ];
        let mut reference =
            Reference::new(Identity { category: String::new(), name: "hello".into() }, endpoints.clone());
        reference.endpoint_selection = pylon_core::endpoint::EndpointSelectionPolicy::Ordered;

        let provider = Arc::new(RecordingProvider {
            inner: TcpConnectionProvider::new(ConnectionConfig::default()),
            seen: std::sync::Mutex::new(Vec::new()),
        });
        let proxy = Proxy::with_provider(reference, provider.clone(), RetryPolicy::default());

        proxy.invoke("echo", Bytes::from_static(b"hi"), false).await.unwrap();
        assert_eq!(provider.seen.lock().unwrap()[0], endpoints);
    }
}
