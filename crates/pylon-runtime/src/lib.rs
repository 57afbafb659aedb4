//! Communicator runtime (C9): the root container applications talk to,
//! wiring `pylon-client` and `pylon-server` together behind one property
//! set, one logger, and the `initialize -> active -> shutdown ->
//! waitForShutdown -> destroy` lifecycle.
//!
//! # Components
//!
//! - [`communicator::Communicator`]: root container; creates adapters and proxies
//! - [`properties::Properties`]: key/value configuration, default `HashMap`-backed
//! - [`logger::Logger`]: diagnostic output hook, default `tracing`-backed
//! - [`plugin`]: the one sanctioned process-wide singleton (plugin factories)

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod communicator;
pub mod error;
pub mod logger;
pub mod plugin;
pub mod properties;

pub use communicator::Communicator;
pub use error::CommunicatorError;
pub use logger::{Logger, TracingLogger};
pub use properties::{MapProperties, Properties, PropertiesError};
