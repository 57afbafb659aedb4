//! The core error taxonomy for the runtime's error-handling design.
//!
//! One flat enum rather than a tree of per-subsystem errors: a caller
//! awaiting an invocation's future needs to match on exactly these kinds
//! regardless of which layer raised them, and the propagation policy
//! (`is_transient`, retryability) is defined over the whole set at once.

use std::io;

use pylon_proto::ProtoError;
use thiserror::Error;

/// Every distinct error kind the runtime can surface.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PylonError {
    // --- Transport ---
    /// The initial connection attempt failed.
    #[error("connect failed: {0}")]
    ConnectFailed(String),
    /// An established connection was lost.
    #[error("connection lost: {0}")]
    ConnectionLost(String),
    /// The peer actively refused the connection.
    #[error("connection refused")]
    ConnectionRefused,
    /// A generic socket-level failure.
    #[error("socket error: {0}")]
    SocketError(String),
    /// Name resolution failed.
    #[error("dns error: {0}")]
    DnsError(String),
    /// A file operation (certificate, config) failed.
    #[error("file error: {0}")]
    FileError(String),

    // --- Timeout ---
    /// Connect timeout elapsed before `NotValidated -> Active`.
    #[error("connect timeout after {0:?}")]
    ConnectTimeout(std::time::Duration),
    /// Close timeout elapsed before the peer's close-connection frame arrived.
    #[error("close timeout after {0:?}")]
    CloseTimeout(std::time::Duration),
    /// An invocation's own timeout elapsed.
    #[error("invocation timeout after {0:?}")]
    InvocationTimeout(std::time::Duration),
    /// No bytes read from the peer for the configured idle timeout.
    #[error("connection idle for {0:?}")]
    ConnectionIdle(std::time::Duration),

    // --- Protocol ---
    /// A decode/encode failure in the wire codec or value serializer.
    #[error("marshal error: {0}")]
    MarshalError(String),
    /// A protocol-level violation (bad state transition, bad message type).
    #[error("protocol error: {0}")]
    ProtocolError(String),
    /// Peer requested a graceful close.
    #[error("close connection")]
    CloseConnection,
    /// A datagram exceeded the transport's size limit.
    #[error("datagram limit exceeded: {size} > {max}")]
    DatagramLimit {
        /// Attempted datagram size.
        size: usize,
        /// Transport's maximum datagram size.
        max: usize,
    },

    // --- Dispatch ---
    /// No servant registered for the requested identity.
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
    /// Identity exists but not the requested facet.
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
    /// Servant exists but not the requested operation.
    #[error("operation not exist: {category}/{name} op={operation}")]
    OperationNotExist {
        /// Identity category.
        category: String,
        /// Identity name.
        name: String,
        /// Requested operation.
        operation: String,
    },
    /// Dispatch raised a local error with no closer mapping.
    #[error("unknown local exception: {0}")]
    UnknownLocalException(String),
    /// Dispatch raised a user exception this side doesn't know the type-id of.
    #[error("unknown user exception: {0}")]
    UnknownUserException(String),
    /// Dispatch failed for an entirely unclassified reason.
    #[error("unknown exception: {0}")]
    UnknownException(String),

    // --- Lifecycle ---
    /// The owning communicator has been destroyed.
    #[error("communicator destroyed")]
    CommunicatorDestroyed,
    /// The target object adapter has been deactivated.
    #[error("object adapter deactivated")]
    ObjectAdapterDeactivated,
    /// The invocation was cancelled by the caller.
    #[error("invocation canceled")]
    InvocationCanceled,

    // --- Config ---
    /// Communicator/adapter initialization failed.
    #[error("initialization error: {0}")]
    InitializationError(String),
    /// Attempted to register something already registered.
    #[error("already registered: {0}")]
    AlreadyRegistered(String),
    /// Attempted to unregister or look up something never registered.
    #[error("not registered: {0}")]
    NotRegistered(String),
    /// A stringified reference or property value failed to parse.
    #[error("parse error: {0}")]
    ParseError(String),
    /// The requested feature is not supported by this build.
    #[error("feature not supported: {0}")]
    FeatureNotSupported(String),
}

impl PylonError {
    /// Whether the propagation policy recovers this error locally
    /// (via the retry policy) before surfacing it to the caller.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::ConnectFailed(_)
                | Self::ConnectionLost(_)
                | Self::ConnectionRefused
                | Self::CloseConnection
                | Self::ConnectTimeout(_)
        )
    }

    /// Whether this error kind is ever retried automatically, independent
    /// of idempotency — `InvocationTimeout` and `CommunicatorDestroyed`
    /// are never retried automatically.
    #[must_use]
    pub fn is_retryable_kind(&self) -> bool {
        !matches!(self, Self::InvocationTimeout(_) | Self::CommunicatorDestroyed)
    }
}

impl From<ProtoError> for PylonError {
    fn from(err: ProtoError) -> Self {
        Self::MarshalError(err.to_string())
    }
}

impl From<io::Error> for PylonError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::TimedOut => Self::ConnectTimeout(std::time::Duration::ZERO),
            io::ErrorKind::ConnectionRefused => Self::ConnectionRefused,
            io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted | io::ErrorKind::BrokenPipe => {
                Self::ConnectionLost(err.to_string())
            },
            _ => Self::SocketError(err.to_string()),
        }
    }
}

impl From<PylonError> for io::Error {
    fn from(err: PylonError) -> Self {
        let kind = match &err {
            PylonError::ConnectTimeout(_)
            | PylonError::CloseTimeout(_)
            | PylonError::InvocationTimeout(_)
            | PylonError::ConnectionIdle(_) => io::ErrorKind::TimedOut,
            PylonError::ConnectionRefused => io::ErrorKind::ConnectionRefused,
            PylonError::ConnectionLost(_) => io::ErrorKind::ConnectionReset,
            PylonError::MarshalError(_) | PylonError::ProtocolError(_) => io::ErrorKind::InvalidData,
            _ => io::ErrorKind::Other,
        };
        Self::new(kind, err.to_string())
    }
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, PylonError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_and_connect_timeout_are_transient() {
        assert!(PylonError::ConnectionLost("x".into()).is_transient());
        assert!(PylonError::ConnectFailed("x".into()).is_transient());
        assert!(PylonError::ConnectTimeout(std::time::Duration::from_secs(1)).is_transient());
    }

    #[test]
    fn dispatch_errors_are_not_transient() {
        assert!(
            !PylonError::ObjectNotExist {
                category: String::new(),
                name: "missing".into(),
                facet: None,
                operation: "echo".into(),
            }
            .is_transient()
        );
    }

    #[test]
    fn invocation_timeout_and_communicator_destroyed_never_retry() {
        assert!(!PylonError::InvocationTimeout(std::time::Duration::from_secs(1)).is_retryable_kind());
        assert!(!PylonError::CommunicatorDestroyed.is_retryable_kind());
        assert!(PylonError::ConnectionLost("x".into()).is_retryable_kind());
    }
}
