//! Client-facing error type: every [`PylonError`] a proxy can surface,
//! plus the one failure mode that's specific to the retry loop itself.

use pylon_core::PylonError;
use thiserror::Error;

/// Errors a [`crate::proxy::Proxy`] invocation can return.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// Any error kind from the shared taxonomy, surfaced as-is.
    #[error(transparent)]
    Core(#[from] PylonError),
    /// A reference with no usable location (empty fixed endpoint list, or
    /// an indirect `@adapterId` reference with no locator configured).
    #[error("reference has no reachable endpoints")]
    NoEndpoints,
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, ClientError>;
