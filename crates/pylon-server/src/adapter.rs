//! Object adapter (C7): servant table, facet/locator lookup, and the
//! adapter lifecycle (`Uninitialized -> Active <-> Held -> Deactivating ->
//! Deactivated -> Destroyed`).
//!
//! Grounded in `registry.rs`'s bidirectional-map idiom (single-owner
//! collections behind one lock, not one lock per entry) generalized from
//! session/room bookkeeping to identity/facet servant lookup.

#![allow(clippy::expect_used, reason = "lock poisoning should surface as a panic, not a recoverable error")]

use std::{
    any::Any,
    collections::HashMap,
    sync::{Arc, RwLock},
};

use bytes::Bytes;
use pylon_proto::{Identity, InvocationMode};

use crate::error::AdapterError;

/// Per-invocation context handed to a servant's `dispatch`.
#[derive(Debug, Clone)]
pub struct Current {
    /// Name of the adapter the request arrived through.
    pub adapter: String,
    /// Arena handle of the connection the request arrived on.
    pub connection_id: u64,
    /// Target identity.
    pub identity: Identity,
    /// Requested facet, if any.
    pub facet: Option<String>,
    /// Operation name.
    pub operation: String,
    /// Invocation mode.
    pub mode: InvocationMode,
    /// Request context.
    pub context: Vec<(String, String)>,
    /// `0` for one-way requests; nonzero correlation id otherwise.
    pub request_id: i32,
}

impl Current {
    /// Whether a reply is expected for this invocation.
    #[must_use]
    pub fn is_twoway(&self) -> bool {
        self.request_id != 0
    }
}

/// Outcome of a servant's `dispatch`.
#[derive(Debug, Clone)]
pub enum DispatchResult {
    /// Dispatch succeeded; payload is the encapsulated return values.
    Ok(Bytes),
    /// The servant raised a declared user exception; payload is its
    /// encapsulated, sliced encoding.
    UserException(Bytes),
}

/// A future-returning dispatch, allowing async-method-dispatch (AMD) style
/// servants that complete a reply later rather than inline.
pub type DispatchFuture =
    std::pin::Pin<Box<dyn std::future::Future<Output = Result<DispatchResult, DispatchError>> + Send>>;

pub use crate::error::DispatchError;

/// A servant: the application-provided implementation behind one or more
/// registered identities.
pub trait Servant: Send + Sync {
    /// Type ids this servant implements, most-derived first. Used to answer
    /// `ice_isA`-style queries; not consulted for ordinary dispatch.
    fn type_ids(&self) -> &[&str] {
        &[]
    }

    /// Invoke `current.operation`. Implementations that don't recognize the
    /// operation should return `Err(DispatchError::OperationNotExist { .. })`.
    fn dispatch(&self, current: Current, params: Bytes) -> DispatchFuture;
}

/// Opaque cookie a [`ServantLocator`] attaches to a located servant, handed
/// back to `finished` once dispatch completes.
pub type LocatorCookie = Arc<dyn Any + Send + Sync>;

/// Resolves servants on demand instead of requiring each identity be
/// registered up front (the default-servant / evictor pattern).
pub trait ServantLocator: Send + Sync {
    /// Produce a servant for `current`, or `Ok(None)` to report
    /// object-not-exist. `finished` is always called afterwards, even if
    /// dispatch itself fails.
    fn locate(&self, current: &Current) -> Result<(Option<Arc<dyn Servant>>, LocatorCookie), AdapterError>;

    /// Called once dispatch completes, regardless of outcome.
    fn finished(&self, current: &Current, servant: &Arc<dyn Servant>, cookie: LocatorCookie);
}

/// Servant table plus category-keyed locators, shared by every connection
/// an adapter accepts.
#[derive(Default)]
pub struct ServantManager {
    servants: RwLock<HashMap<(Identity, Option<String>), Arc<dyn Servant>>>,
    locators: RwLock<HashMap<String, Arc<dyn ServantLocator>>>,
}

impl ServantManager {
    /// Create an empty manager.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a servant under `identity`/`facet`.
    ///
    /// # Errors
    ///
    /// Returns [`AdapterError::AlreadyRegistered`] if the pair is already taken.
    pub fn add(
        &self,
        identity: Identity,
        facet: Option<String>,
        servant: Arc<dyn Servant>,
    ) -> Result<(), AdapterError> {
        let mut servants = self.servants.write().expect("servant table lock poisoned");
        let key = (identity, facet);
        if servants.contains_key(&key) {
            return Err(AdapterError::AlreadyRegistered(format!("{}/{:?}", key.0.name, key.1)));
        }
        servants.insert(key, servant);
        Ok(())
    }

    /// Unregister a servant, returning it if it was present.
    pub fn remove(&self, identity: &Identity, facet: &Option<String>) -> Option<Arc<dyn Servant>> {
        self.servants.write().expect("servant table lock poisoned").remove(&(identity.clone(), facet.clone()))
    }

    /// Register a locator for `category` (empty string is the default
    /// locator, consulted when no category-specific one matches).
    pub fn add_locator(&self, category: impl Into<String>, locator: Arc<dyn ServantLocator>) {
        self.locators.write().expect("locator table lock poisoned").insert(category.into(), locator);
    }

    /// Unregister the locator for `category`.
    pub fn remove_locator(&self, category: &str) -> Option<Arc<dyn ServantLocator>> {
        self.locators.write().expect("locator table lock poisoned").remove(category)
    }

    /// Whether any facet is registered for `identity`, used to distinguish
    /// object-not-exist from facet-not-exist on a failed lookup.
    fn has_any_facet(&self, identity: &Identity) -> bool {
        self.servants.read().expect("servant table lock poisoned").keys().any(|(id, _)| id == identity)
    }

    fn locator_for(&self, category: &str) -> Option<Arc<dyn ServantLocator>> {
        let locators = self.locators.read().expect("locator table lock poisoned");
        locators.get(category).or_else(|| locators.get("")).cloned()
    }

    /// Resolve a servant for `current`, in lookup order: exact
    /// `(identity, facet)` registration, then the category locator, then
    /// the default (`""`) locator.
    ///
    /// # Errors
    ///
    /// Returns [`AdapterError::ObjectNotExist`] if nothing resolves, or
    /// [`AdapterError::FacetNotExist`] if the identity is known under a
    /// different facet.
    pub fn resolve(
        &self,
        current: &Current,
    ) -> Result<(Arc<dyn Servant>, Option<(Arc<dyn ServantLocator>, LocatorCookie)>), AdapterError> {
        let key = (current.identity.clone(), current.facet.clone());
        if let Some(servant) = self.servants.read().expect("servant table lock poisoned").get(&key) {
            return Ok((servant.clone(), None));
        }

        if let Some(locator) = self.locator_for(&current.identity.category) {
            let (found, cookie) = locator.locate(current)?;
            if let Some(servant) = found {
                return Ok((servant, Some((locator, cookie))));
            }
        }

        if self.has_any_facet(&current.identity) {
            Err(AdapterError::FacetNotExist {
                category: current.identity.category.clone(),
                name: current.identity.name.clone(),
                facet: current.facet.clone(),
                operation: current.operation.clone(),
            })
        } else {
            Err(AdapterError::ObjectNotExist {
                category: current.identity.category.clone(),
                name: current.identity.name.clone(),
                facet: current.facet.clone(),
                operation: current.operation.clone(),
            })
        }
    }
}

/// Object adapter lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterState {
    /// Created but not yet activated; cannot accept connections.
    Uninitialized,
    /// Accepting connections and dispatching requests.
    Active,
    /// Accepting connections, but new dispatches are refused.
    Held,
    /// No longer accepting requests; existing ones are draining.
    Deactivating,
    /// Fully shut down.
    Deactivated,
    /// Permanently removed from its communicator. Terminal: an adapter
    /// never leaves this state.
    Destroyed,
}

/// One object adapter: a name, a set of listening endpoints, and the
/// servant table requests on those endpoints dispatch against.
pub struct ObjectAdapter {
    name: String,
    endpoints: Vec<pylon_core::Endpoint>,
    state: RwLock<AdapterState>,
    servants: Arc<ServantManager>,
}

impl ObjectAdapter {
    /// Create an adapter in [`AdapterState::Uninitialized`].
    #[must_use]
    pub fn new(name: impl Into<String>, endpoints: Vec<pylon_core::Endpoint>) -> Self {
        Self {
            name: name.into(),
            endpoints,
            state: RwLock::new(AdapterState::Uninitialized),
            servants: Arc::new(ServantManager::new()),
        }
    }

    /// Adapter name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Configured listening endpoints.
    #[must_use]
    pub fn endpoints(&self) -> &[pylon_core::Endpoint] {
        &self.endpoints
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> AdapterState {
        *self.state.read().expect("adapter state lock poisoned")
    }

    /// Begin accepting connections and dispatching.
    pub fn activate(&self) {
        let mut state = self.state.write().expect("adapter state lock poisoned");
        if matches!(*state, AdapterState::Uninitialized | AdapterState::Held) {
            *state = AdapterState::Active;
        }
    }

    /// Stop dispatching new requests without tearing down listeners.
    pub fn hold(&self) {
        let mut state = self.state.write().expect("adapter state lock poisoned");
        if *state == AdapterState::Active {
            *state = AdapterState::Held;
        }
    }

    /// Begin shutdown: no further requests will be dispatched.
    pub fn deactivate(&self) {
        let mut state = self.state.write().expect("adapter state lock poisoned");
        if !matches!(*state, AdapterState::Deactivating | AdapterState::Deactivated | AdapterState::Destroyed) {
            *state = AdapterState::Deactivating;
        }
    }

    /// Mark shutdown complete, once all in-flight dispatches have drained.
    pub fn finish_deactivate(&self) {
        *self.state.write().expect("adapter state lock poisoned") = AdapterState::Deactivated;
    }

    /// Permanently remove this adapter from service. Unlike
    /// [`Self::deactivate`]/[`Self::finish_deactivate`], this is a one-way
    /// door: once `Destroyed`, an adapter never dispatches again, even if
    /// some other handle to it calls [`Self::activate`]. Called by
    /// `Communicator::destroy` for every adapter it holds.
    pub fn destroy(&self) {
        *self.state.write().expect("adapter state lock poisoned") = AdapterState::Destroyed;
    }

    /// Whether this adapter currently accepts new dispatches.
    #[must_use]
    pub fn can_dispatch(&self) -> bool {
        self.state() == AdapterState::Active
    }

    /// Register a servant.
    ///
    /// # Errors
    ///
    /// See [`ServantManager::add`].
    pub fn add_servant(
        &self,
        identity: Identity,
        facet: Option<String>,
        servant: Arc<dyn Servant>,
    ) -> Result<(), AdapterError> {
        self.servants.add(identity, facet, servant)
    }

    /// Borrow the servant manager, e.g. to register a locator.
    #[must_use]
    pub fn servant_manager(&self) -> &Arc<ServantManager> {
        &self.servants
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoServant;

    impl Servant for EchoServant {
        fn dispatch(&self, _current: Current, params: Bytes) -> DispatchFuture {
            Box::pin(async move { Ok(DispatchResult::Ok(params)) })
        }
    }

    fn ident(name: &str) -> Identity {
        Identity { category: String::new(), name: name.into() }
    }

    fn current(identity: Identity, facet: Option<String>, operation: &str) -> Current {
        Current {
            adapter: "TestAdapter".into(),
            connection_id: 1,
            identity,
            facet,
            operation: operation.into(),
            mode: InvocationMode::Normal,
            context: Vec::new(),
            request_id: 7,
        }
    }

    #[test]
    fn exact_registration_resolves() {
        let manager = ServantManager::new();
        manager.add(ident("hello"), None, Arc::new(EchoServant)).unwrap();
        let (_, locator) = manager.resolve(&current(ident("hello"), None, "echo")).unwrap();
        assert!(locator.is_none());
    }

    #[test]
    fn unknown_identity_is_object_not_exist() {
        let manager = ServantManager::new();
        let err = manager.resolve(&current(ident("missing"), None, "echo")).unwrap_err();
        assert!(matches!(err, AdapterError::ObjectNotExist { .. }));
    }

    #[test]
    fn known_identity_wrong_facet_is_facet_not_exist() {
        let manager = ServantManager::new();
        manager.add(ident("hello"), Some("config".into()), Arc::new(EchoServant)).unwrap();
        let err = manager.resolve(&current(ident("hello"), Some("other".into()), "echo")).unwrap_err();
        assert!(matches!(err, AdapterError::FacetNotExist { .. }));
    }

    #[test]
    fn duplicate_registration_errors() {
        let manager = ServantManager::new();
        manager.add(ident("hello"), None, Arc::new(EchoServant)).unwrap();
        let err = manager.add(ident("hello"), None, Arc::new(EchoServant)).unwrap_err();
        assert!(matches!(err, AdapterError::AlreadyRegistered(_)));
    }

    struct AlwaysLocator(Arc<dyn Servant>);

    impl ServantLocator for AlwaysLocator {
        fn locate(&self, _current: &Current) -> Result<(Option<Arc<dyn Servant>>, LocatorCookie), AdapterError> {
            Ok((Some(self.0.clone()), Arc::new(())))
        }

        fn finished(&self, _current: &Current, _servant: &Arc<dyn Servant>, _cookie: LocatorCookie) {}
    }

    #[test]
    fn default_locator_resolves_unregistered_identity() {
        let manager = ServantManager::new();
        manager.add_locator("", Arc::new(AlwaysLocator(Arc::new(EchoServant))));
        let (_, locator) = manager.resolve(&current(ident("anything"), None, "echo")).unwrap();
        assert!(locator.is_some());
    }

    #[test]
    fn adapter_lifecycle_gates_dispatch() {
        let adapter = ObjectAdapter::new("Test", Vec::new());
        assert!(!adapter.can_dispatch());
        adapter.activate();
        assert!(adapter.can_dispatch());
        adapter.hold();
        assert!(!adapter.can_dispatch());
        adapter.activate();
        adapter.deactivate();
        assert!(!adapter.can_dispatch());
    }

    #[test]
    fn destroyed_adapter_never_dispatches_again() {
        let adapter = ObjectAdapter::new("Test", Vec::new());
        adapter.activate();
        adapter.deactivate();
        adapter.finish_deactivate();
        adapter.destroy();
        assert_eq!(adapter.state(), AdapterState::Destroyed);
        assert!(!adapter.can_dispatch());

        adapter.activate();
        assert_eq!(adapter.state(), AdapterState::Destroyed);
        assert!(!adapter.can_dispatch());
    }
}
