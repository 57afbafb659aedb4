//! Core data model and runtime state machines for the Pylon RPC protocol.
//!
//! Nothing in this crate performs I/O. Each piece of mutable state —
//! [`connection::Connection`], the value serializer in [`value`] — follows
//! the action pattern: callers feed in events (and, where relevant, the
//! current time) and get back a list of actions for a driver crate
//! (`pylon-server`, `pylon-client`, `pylon-runtime`) to execute. This keeps
//! protocol logic deterministic and directly testable, and lets the same
//! logic run against a real clock or a simulated one via [`env::Environment`].

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod connection;
pub mod endpoint;
pub mod env;
pub mod error;
pub mod reference;
pub mod value;

pub use connection::{Connection, ConnectionAction, ConnectionConfig, ConnectionState, TimerKind};
pub use endpoint::{Endpoint, EndpointSelectionPolicy};
pub use env::Environment;
pub use error::{PylonError, Result};
pub use reference::{DeliveryMode, Locatable, Reference};
pub use value::{
    SliceData, SlicingMode, UnknownSlicedValue, UserException, Value, ValueFactory, ValueFactoryManager,
    ValueReader, ValueWriter,
};
