//! Error taxonomy for the dispatch path: transceiver, object adapter, and
//! dispatch engine each get their own narrow `thiserror` enum, converging on
//! [`pylon_core::PylonError`] at the point a reply status or a connection
//! action needs a single flat kind. Narrower enums here (vs. the core
//! crate's one flat enum) because these are driver-internal failure modes a
//! caller never sees directly — only their `PylonError` projection crosses
//! the connection boundary.

use std::time::Duration;

use pylon_core::PylonError;
use thiserror::Error;

/// Failures from a [`crate::transceiver::Transceiver`] implementation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransceiverError {
    /// Underlying I/O failed.
    #[error("i/o error: {0}")]
    Io(String),
    /// The initial connect attempt failed.
    #[error("connect failed: {0}")]
    ConnectFailed(String),
    /// No bytes read within the idle deadline.
    #[error("idle for {0:?}")]
    Idle(Duration),
    /// The transceiver was already closed.
    #[error("transceiver closed")]
    Closed,
}

impl From<TransceiverError> for PylonError {
    fn from(err: TransceiverError) -> Self {
        match err {
            TransceiverError::Io(msg) => Self::SocketError(msg),
            TransceiverError::ConnectFailed(msg) => Self::ConnectFailed(msg),
            TransceiverError::Idle(d) => Self::ConnectionIdle(d),
            TransceiverError::Closed => Self::ConnectionLost("transceiver closed".into()),
        }
    }
}

/// Failures raised while resolving a servant for an incoming request.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdapterError {
    /// The adapter has been deactivated or destroyed.
    #[error("object adapter {0} is not active")]
    NotActive(String),
    /// No servant or locator could produce one for this identity.
    #[error("object not exist: {category}/{name} facet={facet:?} op={operation}")]
    ObjectNotExist {
        /// Identity category.
        category: String,
        /// Identity name.
        name: String,
        /// Requested facet, if any.
        facet: Option<String>,
        /// Requested operation.
        operation: String,
    },
    /// The identity exists under a different facet than the one requested.
    #[error("facet not exist: {category}/{name} facet={facet:?} op={operation}")]
    FacetNotExist {
        /// Identity category.
        category: String,
        /// Identity name.
        name: String,
        /// Requested facet.
        facet: Option<String>,
        /// Requested operation.
        operation: String,
    },
    /// An identity is already registered for this adapter/facet pair.
    #[error("servant already registered: {0}")]
    AlreadyRegistered(String),
}

impl From<AdapterError> for PylonError {
    fn from(err: AdapterError) -> Self {
        match err {
            AdapterError::NotActive(_) => Self::ObjectAdapterDeactivated,
            AdapterError::ObjectNotExist { category, name, facet, operation } => {
                Self::ObjectNotExist { category, name, facet, operation }
            },
            AdapterError::FacetNotExist { category, name, facet, operation } => {
                Self::FacetNotExist { category, name, facet, operation }
            },
            AdapterError::AlreadyRegistered(what) => Self::AlreadyRegistered(what),
        }
    }
}

/// Failures raised while invoking a resolved servant.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    /// The servant has no such operation.
    #[error("operation not exist: {category}/{name} op={operation}")]
    OperationNotExist {
        /// Identity category.
        category: String,
        /// Identity name.
        name: String,
        /// Requested operation.
        operation: String,
    },
    /// The servant raised a user exception this side cannot decode.
    #[error("unknown user exception: {0}")]
    UnknownUserException(String),
    /// The servant panicked or raised an error with no closer mapping.
    #[error("unknown local exception: {0}")]
    UnknownLocalException(String),
}

impl From<DispatchError> for PylonError {
    fn from(err: DispatchError) -> Self {
        match err {
            DispatchError::OperationNotExist { category, name, operation } => {
                Self::OperationNotExist { category, name, operation }
            },
            DispatchError::UnknownUserException(msg) => Self::UnknownUserException(msg),
            DispatchError::UnknownLocalException(msg) => Self::UnknownLocalException(msg),
        }
    }
}

/// Aggregate error for the production server wrapper: binding listeners,
/// accepting connections, and running the dispatch loop.
#[derive(Error, Debug)]
pub enum ServerError {
    /// Bad configuration (bind address, adapter name clash, …).
    #[error("configuration error: {0}")]
    Config(String),
    /// A transceiver-level failure.
    #[error(transparent)]
    Transceiver(#[from] TransceiverError),
    /// An object-adapter-level failure.
    #[error(transparent)]
    Adapter(#[from] AdapterError),
    /// A dispatch-level failure.
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    /// A core protocol/connection failure.
    #[error(transparent)]
    Core(#[from] PylonError),
    /// An OS-level I/O failure (bind, accept).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adapter_error_maps_to_core_object_not_exist() {
        let err = AdapterError::ObjectNotExist {
            category: String::new(),
            name: "hello".into(),
            facet: None,
            operation: "echo".into(),
        };
        assert!(matches!(PylonError::from(err), PylonError::ObjectNotExist { .. }));
    }

    #[test]
    fn transceiver_idle_maps_to_connection_idle() {
        let err = TransceiverError::Idle(Duration::from_secs(5));
        assert!(matches!(PylonError::from(err), PylonError::ConnectionIdle(d) if d == Duration::from_secs(5)));
    }
}
