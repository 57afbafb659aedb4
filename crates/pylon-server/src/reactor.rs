//! Reactor / thread pool (C4): bounds how much dispatch work runs
//! concurrently and hands each registered handler (connection) a token that
//! guarantees at most one worker is ever running its events at a time.
//!
//! `tokio`'s multi-threaded runtime already is the thread pool; what this
//! module adds on top is the *consumed-token* idiom — a
//! `tokio::sync::Mutex` per handler, acquired before running any of that
//! handler's work and released (dropped) when the work completes — so two
//! tasks can never concurrently process the same connection's events
//! without a global per-connection lock being held the whole time. A
//! `Semaphore` separately bounds total concurrent dispatches across all
//! handlers to `size_max`, and an optional `serialize` mode funnels every
//! dispatch through one additional lock for callers that need strict
//! cross-handler ordering.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use tokio::sync::{Mutex, Notify, OwnedSemaphorePermit, Semaphore};

/// Thread pool sizing and ordering configuration.
#[derive(Debug, Clone)]
pub struct ThreadPoolConfig {
    /// Soft minimum worker count (informational; `tokio` manages actual OS
    /// threads).
    pub size: usize,
    /// Hard cap on concurrently running dispatches.
    pub size_max: usize,
    /// Funnel every dispatch through one additional shared lock, so no two
    /// handlers' work ever interleaves.
    pub serialize: bool,
}

impl Default for ThreadPoolConfig {
    fn default() -> Self {
        Self { size: 1, size_max: 16, serialize: false }
    }
}

/// Per-handler consumed-token: acquired before running that handler's
/// dispatch, released when it completes. Guarantees exclusive access
/// without requiring the handler itself to be `Sync`-safe under
/// concurrent use.
#[derive(Clone, Default)]
pub struct HandlerToken(Arc<Mutex<()>>);

impl HandlerToken {
    /// Create a fresh, unheld token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

/// Bounds concurrent dispatch work and enforces per-handler exclusivity.
pub struct ThreadPool {
    config: ThreadPoolConfig,
    semaphore: Arc<Semaphore>,
    serialize_lock: Option<Arc<Mutex<()>>>,
    in_flight: Arc<AtomicUsize>,
    drained: Arc<Notify>,
}

impl ThreadPool {
    /// Build a pool per `config`.
    #[must_use]
    pub fn new(config: ThreadPoolConfig) -> Self {
        let serialize_lock = config.serialize.then(|| Arc::new(Mutex::new(())));
        Self {
            semaphore: Arc::new(Semaphore::new(config.size_max.max(1))),
            serialize_lock,
            config,
            in_flight: Arc::new(AtomicUsize::new(0)),
            drained: Arc::new(Notify::new()),
        }
    }

    /// Configured hard cap on concurrent dispatches.
    #[must_use]
    pub fn size_max(&self) -> usize {
        self.config.size_max
    }

    /// Number of dispatches currently running.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Run `f` under `token`'s exclusive lock and the pool's concurrency
    /// bound, awaiting whatever future it produces. Cancel-safe: if the
    /// returned future is dropped before completion, the semaphore permit
    /// and any held locks are released as part of the drop.
    pub async fn dispatch<F, Fut, T>(&self, token: &HandlerToken, f: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = T>,
    {
        #[allow(clippy::expect_used)]
        let _permit: OwnedSemaphorePermit =
            self.semaphore.clone().acquire_owned().await.expect("semaphore never closed");
        let _handler_guard = token.0.clone().lock_owned().await;
        let _serialize_guard = match &self.serialize_lock {
            Some(lock) => Some(lock.clone().lock_owned().await),
            None => None,
        };

        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let result = f().await;
        if self.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.drained.notify_waiters();
        }
        result
    }

    /// Wait until no dispatch is in flight. Used by graceful shutdown
    /// (adapter deactivation, connection draining) to know when it's safe
    /// to proceed.
    pub async fn wait_drained(&self) {
        loop {
            if self.in_flight() == 0 {
                return;
            }
            self.drained.notified().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn dispatch_runs_and_returns_result() {
        let pool = ThreadPool::new(ThreadPoolConfig::default());
        let token = HandlerToken::new();
        let result = pool.dispatch(&token, || async { 42 }).await;
        assert_eq!(result, 42);
        assert_eq!(pool.in_flight(), 0);
    }

    #[tokio::test]
    async fn same_handler_token_serializes_concurrent_dispatches() {
        let pool = Arc::new(ThreadPool::new(ThreadPoolConfig::default()));
        let token = HandlerToken::new();
        let order = Arc::new(tokio::sync::Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for i in 0..4 {
            let pool = pool.clone();
            let token = token.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                pool.dispatch(&token, || async move {
                    order.lock().await.push((i, "start"));
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    order.lock().await.push((i, "end"));
                })
                .await;
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let log = order.lock().await;
        // Every (i, "start") must be immediately followed by (i, "end"):
        // no two handlers' work interleaved.
        for pair in log.chunks(2) {
            assert_eq!(pair[0].0, pair[1].0);
            assert_eq!(pair[0].1, "start");
            assert_eq!(pair[1].1, "end");
        }
    }

    #[tokio::test]
    async fn size_max_bounds_concurrency() {
        let pool = Arc::new(ThreadPool::new(ThreadPoolConfig { size: 1, size_max: 2, serialize: false }));
        let concurrent = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..6 {
            let pool = pool.clone();
            let concurrent = concurrent.clone();
            let max_seen = max_seen.clone();
            let token = HandlerToken::new();
            handles.push(tokio::spawn(async move {
                pool.dispatch(&token, || async move {
                    let now = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                    max_seen.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    concurrent.fetch_sub(1, Ordering::SeqCst);
                })
                .await;
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        assert!(max_seen.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn wait_drained_returns_once_idle() {
        let pool = Arc::new(ThreadPool::new(ThreadPoolConfig::default()));
        let token = HandlerToken::new();
        pool.dispatch(&token, || async {}).await;
        tokio::time::timeout(Duration::from_millis(100), pool.wait_drained()).await.unwrap();
    }
}
