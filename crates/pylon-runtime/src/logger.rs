//! `Logger` hook: the narrow interface application code can swap out,
//! defaulting to a `tracing`-backed implementation.
//!
//! Method set (`print`, `trace`, `warning`, `error`, a prefix-scoped clone)
//! follows the classic CORBA/ICE-style logger contract; the default
//! implementation is built on `tracing_subscriber::{EnvFilter, fmt}`.

use std::sync::Arc;

/// Destination for diagnostic output. Implementations must not block the
/// calling worker thread for long; the default implementation hands off to
/// `tracing`, whose subscriber is responsible for buffering/formatting.
pub trait Logger: Send + Sync {
    /// Unstructured informational message with no category.
    fn print(&self, message: &str);
    /// Categorized trace message (e.g. `"Protocol"`, `"Network"`).
    fn trace(&self, category: &str, message: &str);
    /// Warning: unexpected but recoverable.
    fn warning(&self, message: &str);
    /// Error: an operation failed.
    fn error(&self, message: &str);
    /// Return a logger that prefixes every message with `prefix`, sharing
    /// the same underlying destination.
    fn clone_with_prefix(&self, prefix: &str) -> Arc<dyn Logger>;
}

/// Default [`Logger`] emitting through `tracing`.
#[derive(Clone, Default)]
pub struct TracingLogger {
    prefix: Option<String>,
}

impl TracingLogger {
    /// Build a logger with no prefix.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn format(&self, message: &str) -> String {
        match &self.prefix {
            Some(prefix) => format!("{prefix}: {message}"),
            None => message.to_string(),
        }
    }
}

impl Logger for TracingLogger {
    fn print(&self, message: &str) {
        tracing::info!("{}", self.format(message));
    }

    fn trace(&self, category: &str, message: &str) {
        tracing::debug!(category, "{}", self.format(message));
    }

    fn warning(&self, message: &str) {
        tracing::warn!("{}", self.format(message));
    }

    fn error(&self, message: &str) {
        tracing::error!("{}", self.format(message));
    }

    fn clone_with_prefix(&self, prefix: &str) -> Arc<dyn Logger> {
        let combined = match &self.prefix {
            Some(existing) => format!("{existing}.{prefix}"),
            None => prefix.to_string(),
        };
        Arc::new(Self { prefix: Some(combined) })
    }
}

/// Install a default `tracing-subscriber` registry reading `RUST_LOG`
/// (falling back to `default_filter`).
pub fn init_tracing(default_filter: &str) {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let _ = tracing_subscriber::registry().with(tracing_subscriber::fmt::layer()).with(filter).try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clone_with_prefix_nests_dotted_prefixes() {
        let root = TracingLogger::new();
        assert_eq!(root.format("hi"), "hi");

        let child = TracingLogger { prefix: Some("Comm".into()) };
        assert_eq!(child.format("msg"), "Comm: msg");

        let grandchild = TracingLogger { prefix: Some("Comm.Adapter".into()) };
        assert_eq!(grandchild.format("msg"), "Comm.Adapter: msg");
    }

    #[test]
    fn default_has_no_prefix() {
        let logger = TracingLogger::default();
        logger.print("ready");
        logger.warning("careful");
        logger.error("boom");
        logger.trace("Protocol", "frame sent");
    }
}
