//! Client-side runtime: proxies, the request-handler cache, and the retry
//! policy that turns a [`pylon_core::reference::Reference`] into a live
//! connection and back into decoded reply bytes.
//!
//! # Components
//!
//! - [`proxy::Proxy`]: client-side handle — reference + handler cache + retry policy
//! - [`handler::RequestHandlerCache`]: lazily establishes and shares one connection per proxy
//! - [`connection::ClientConnection`]: one dialed socket driving `pylon_core::connection::Connection`
//! - [`retry::RetryPolicy`]: retry-eligibility and backoff schedule
//! - [`timer::TimerSet`]: wires connection timer actions to real `tokio` tasks

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod connection;
pub mod error;
pub mod handler;
pub mod proxy;
pub mod retry;
mod timer;
mod transceiver;

pub use connection::ClientConnection;
pub use error::{ClientError, Result};
pub use handler::{ConnectionProvider, RequestHandlerCache, TcpConnectionProvider};
pub use proxy::Proxy;
pub use retry::{RetryDecision, RetryPolicy};
