//! Deterministic simulation harness for testing the protocol runtime.
//!
//! Turmoil-based implementations of the [`pylon_core::Environment`] and
//! [`pylon_server::transceiver::Transceiver`] traits, plus a turmoil-native
//! sibling of [`pylon_server::Server`], for deterministic, reproducible
//! testing under controlled network conditions (latency, partitions,
//! message loss).
//!
//! # Invariant Testing
//!
//! The `invariants` module provides behavioral testing through invariant
//! checks. Invariants verify WHAT must be true across all execution paths,
//! not specific scenarios. Use [`InvariantRegistry::standard()`] for the
//! common connection/dispatch invariants.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod env;
pub mod invariants;
pub mod server;
pub mod transceiver;

pub use env::SimEnv;
pub use invariants::{
    ConnectionAdapterRegistered, ConnectionIdAllocationMonotonic, ConnectionSnapshot, Invariant,
    InvariantRegistry, InvariantResult, OutstandingRequestBalance, SystemSnapshot, Violation,
};
pub use server::SimServer;
pub use transceiver::SimTransceiver;
