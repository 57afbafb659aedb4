//! Errors raised by the communicator itself, as opposed to the client or
//! server runtimes it wires together.

use pylon_core::PylonError;
use thiserror::Error;

/// Failures raised by [`crate::communicator::Communicator`] lifecycle and
/// proxy-factory methods.
#[derive(Error, Debug)]
pub enum CommunicatorError {
    /// A stringified reference could not be parsed.
    #[error("invalid reference: {0}")]
    InvalidReference(#[from] PylonError),
    /// An object adapter name is already registered.
    #[error("adapter already registered: {0}")]
    AdapterAlreadyRegistered(String),
    /// No adapter is registered under this name.
    #[error("no such adapter: {0}")]
    NoSuchAdapter(String),
    /// The communicator has already been destroyed.
    #[error("communicator destroyed")]
    Destroyed,
    /// Binding or running a server-side adapter failed.
    #[error(transparent)]
    Server(#[from] pylon_server::ServerError),
    /// A plugin factory was requested under a name nothing registered.
    #[error("no plugin factory registered for {0}")]
    PluginNotFound(String),
}

impl CommunicatorError {
    /// Whether retrying the operation that produced this error might help,
    /// as opposed to a configuration mistake the caller must fix.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Server(pylon_server::ServerError::Io(_)))
    }
}
