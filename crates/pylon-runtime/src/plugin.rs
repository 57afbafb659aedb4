//! Plugin factory registry: the one sanctioned process-wide singleton.
//!
//! Plugin factories resolve from a once-initialized, process-wide registry,
//! realized here as a `OnceLock<Mutex<HashMap<...>>>` rather than a
//! `Connection` or `ObjectAdapter` singleton, which stay communicator-owned.

#![allow(clippy::expect_used, reason = "lock poisoning should surface as a panic, not a recoverable error")]

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, OnceLock},
};

use crate::communicator::Communicator;

/// A plugin factory: given a live communicator and the arguments configured
/// for it, produce the plugin. Plugins are opaque to the communicator once
/// created; it only holds them alive until `destroy`.
pub trait PluginFactory: Send + Sync {
    /// Construct the plugin.
    fn create(&self, communicator: &Communicator, args: &[String]) -> Arc<dyn std::any::Any + Send + Sync>;
}

fn registry() -> &'static Mutex<HashMap<String, Arc<dyn PluginFactory>>> {
    static REGISTRY: OnceLock<Mutex<HashMap<String, Arc<dyn PluginFactory>>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Register `factory` under `name`, replacing any previous registration.
/// Process-wide: every communicator in the process shares this table, the
/// one exception to the "no static singletons" rule.
pub fn register_plugin_factory(name: impl Into<String>, factory: Arc<dyn PluginFactory>) {
    registry().lock().expect("plugin registry lock poisoned").insert(name.into(), factory);
}

/// Look up the factory registered under `name`.
#[must_use]
pub fn lookup_plugin_factory(name: &str) -> Option<Arc<dyn PluginFactory>> {
    registry().lock().expect("plugin registry lock poisoned").get(name).cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopFactory;

    impl PluginFactory for NoopFactory {
        fn create(&self, _communicator: &Communicator, _args: &[String]) -> Arc<dyn std::any::Any + Send + Sync> {
            Arc::new(())
        }
    }

    #[test]
    fn register_then_lookup_finds_factory() {
        register_plugin_factory("test-noop-plugin", Arc::new(NoopFactory));
        assert!(lookup_plugin_factory("test-noop-plugin").is_some());
    }

    #[test]
    fn lookup_of_unregistered_name_is_none() {
        assert!(lookup_plugin_factory("test-definitely-not-registered").is_none());
    }
}
