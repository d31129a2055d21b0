//! Typed, optionally self-refreshing key/value cache.
//!
//! A [`Cache`] holds the last good value per key and repopulates itself from
//! a [`RefreshSource`]. One refresh pass looks up every key concurrently and
//! applies each result as it arrives; a lookup that yields nothing leaves the
//! previous value in place, so a failing producer never erases good data.
//!
//! When auto-refresh is enabled, [`Cache::start`] spawns a single background
//! loop owned by the cache. The loop sleeps for the refresh interval, runs a
//! pass, and repeats. [`Cache::stop`] stops new passes from starting and waits
//! for the loop to exit; a pass already in flight always runs to completion.
//! Dropping the cache also ends the loop.
//!
//! Freshness is bounded by cadence, not by per-entry TTL: once started, a
//! value is never older than one refresh interval plus the duration of one
//! in-flight pass (as long as its producer keeps answering).

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

/// Supplies the key set and per-key values for a cache refresh.
#[async_trait]
pub trait RefreshSource<K, V>: Send + Sync {
    /// Keys to look up on each refresh pass.
    fn keys(&self) -> Vec<K>;

    /// Produce the current value for `key`, or `None` if it is unavailable.
    async fn value(&self, key: &K) -> Option<V>;
}

/// Cache behavior.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Short name used in log fields.
    pub name: &'static str,
    /// Run the background refresh loop after `start`.
    pub auto_refresh: bool,
    /// Delay between refresh passes.
    pub refresh_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            name: "cache",
            auto_refresh: true,
            refresh_interval: Duration::from_millis(50),
        }
    }
}

/// A typed cache backed by a [`RefreshSource`].
pub struct Cache<K, V> {
    inner: Arc<Inner<K, V>>,
    task: Mutex<Option<RefreshTask>>,
}

struct Inner<K, V> {
    config: CacheConfig,
    source: Arc<dyn RefreshSource<K, V>>,
    storage: RwLock<HashMap<K, V>>,
    refreshes: AtomicU64,
}

struct RefreshTask {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl<K, V> Cache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + std::fmt::Debug + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Create an empty cache. Nothing is fetched until `start` or `refresh`.
    pub fn new(config: CacheConfig, source: Arc<dyn RefreshSource<K, V>>) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                source,
                storage: RwLock::new(HashMap::new()),
                refreshes: AtomicU64::new(0),
            }),
            task: Mutex::new(None),
        }
    }

    /// Last good value for `key`.
    pub async fn get(&self, key: &K) -> Option<V> {
        self.inner.storage.read().await.get(key).cloned()
    }

    /// Store a value. `None` is ignored and keeps whatever was there.
    pub async fn put(&self, key: K, value: Option<V>) {
        self.inner.put(key, value).await;
    }

    /// Run one refresh pass over every key.
    pub async fn refresh(&self) {
        self.inner.refresh().await;
    }

    /// Re-fetch a single key outside the regular cadence.
    pub async fn refresh_key(&self, key: &K) {
        let value = self.inner.source.value(key).await;
        self.inner.put(key.clone(), value).await;
    }

    /// Populate the cache, then start the background loop if auto-refresh is
    /// enabled. Calling `start` again refreshes but never spawns a second loop.
    pub async fn start(&self) {
        self.inner.refresh().await;

        if !self.inner.config.auto_refresh {
            return;
        }

        let mut task = self.task.lock().await;
        if task.is_some() {
            debug!(cache = self.inner.config.name, "Refresh loop already running");
            return;
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move { inner.run(shutdown_rx).await });

        info!(
            cache = self.inner.config.name,
            interval_ms = self.inner.config.refresh_interval.as_millis() as u64,
            "Started refresh loop"
        );
        *task = Some(RefreshTask {
            shutdown: shutdown_tx,
            handle,
        });
    }

    /// Stop the background loop and wait for it to exit. No-op when not started.
    pub async fn stop(&self) {
        let Some(task) = self.task.lock().await.take() else {
            return;
        };

        let _ = task.shutdown.send(true);
        if let Err(e) = task.handle.await {
            warn!(cache = self.inner.config.name, error = %e, "Refresh loop ended abnormally");
        }
        info!(cache = self.inner.config.name, "Stopped refresh loop");
    }

    /// Whether the background loop is running.
    pub async fn is_running(&self) -> bool {
        self.task.lock().await.is_some()
    }

    /// Number of completed refresh passes.
    pub fn refresh_count(&self) -> u64 {
        self.inner.refreshes.load(Ordering::SeqCst)
    }
}

impl<K, V> Inner<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + std::fmt::Debug + 'static,
    V: Clone + Send + Sync + 'static,
{
    async fn put(&self, key: K, value: Option<V>) {
        let Some(value) = value else {
            return;
        };
        self.storage.write().await.insert(key, value);
    }

    async fn refresh(&self) {
        let keys = self.source.keys();
        let mut lookups = JoinSet::new();

        for key in keys {
            let source = Arc::clone(&self.source);
            lookups.spawn(async move {
                let value = source.value(&key).await;
                (key, value)
            });
        }

        let mut missing = 0usize;
        while let Some(joined) = lookups.join_next().await {
            match joined {
                Ok((key, Some(value))) => {
                    self.storage.write().await.insert(key, value);
                }
                Ok((key, None)) => {
                    missing += 1;
                    debug!(cache = self.config.name, key = ?key, "No value, keeping previous");
                }
                Err(e) => {
                    missing += 1;
                    warn!(cache = self.config.name, error = %e, "Refresh lookup task failed");
                }
            }
        }

        self.refreshes.fetch_add(1, Ordering::SeqCst);
        if missing > 0 {
            debug!(cache = self.config.name, missing, "Refresh pass incomplete");
        }
    }

    async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.refresh_interval) => {
                    self.refresh().await;
                }
                changed = shutdown.changed() => {
                    // A dropped sender means the owning cache is gone.
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!(cache = self.config.name, "Refresh loop exiting");
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;

    use tokio::sync::Barrier;

    use super::*;

    /// Source answering from a per-key script; an exhausted script repeats
    /// its last answer.
    struct ScriptedSource {
        keys: Vec<String>,
        script: StdMutex<HashMap<String, VecDeque<Option<u32>>>>,
        calls: AtomicU64,
    }

    impl ScriptedSource {
        fn new(entries: &[(&str, &[Option<u32>])]) -> Arc<Self> {
            let keys = entries.iter().map(|(k, _)| k.to_string()).collect();
            let script = entries
                .iter()
                .map(|(k, values)| (k.to_string(), values.iter().copied().collect()))
                .collect();
            Arc::new(Self {
                keys,
                script: StdMutex::new(script),
                calls: AtomicU64::new(0),
            })
        }
    }

    #[async_trait]
    impl RefreshSource<String, u32> for ScriptedSource {
        fn keys(&self) -> Vec<String> {
            self.keys.clone()
        }

        async fn value(&self, key: &String) -> Option<u32> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut script = self.script.lock().unwrap();
            let queue = script.get_mut(key)?;
            if queue.len() > 1 {
                queue.pop_front().flatten()
            } else {
                queue.front().copied().flatten()
            }
        }
    }

    fn manual_config() -> CacheConfig {
        CacheConfig {
            name: "test",
            auto_refresh: false,
            refresh_interval: Duration::from_millis(100),
        }
    }

    fn auto_config() -> CacheConfig {
        CacheConfig {
            auto_refresh: true,
            ..manual_config()
        }
    }

    fn key(k: &str) -> String {
        k.to_string()
    }

    #[tokio::test]
    async fn test_absent_value_keeps_last_good() {
        let source = ScriptedSource::new(&[("a", &[Some(1), None, None])]);
        let cache = Cache::<String, u32>::new(manual_config(), source);

        cache.refresh().await;
        assert_eq!(cache.get(&key("a")).await, Some(1));

        cache.refresh().await;
        cache.refresh().await;
        assert_eq!(cache.get(&key("a")).await, Some(1));
        assert_eq!(cache.refresh_count(), 3);
    }

    #[tokio::test]
    async fn test_key_never_produced_stays_absent() {
        let source = ScriptedSource::new(&[("a", &[Some(7)]), ("b", &[None])]);
        let cache = Cache::<String, u32>::new(manual_config(), source);

        cache.refresh().await;
        assert_eq!(cache.get(&key("a")).await, Some(7));
        assert_eq!(cache.get(&key("b")).await, None);
    }

    #[tokio::test]
    async fn test_refresh_replaces_with_newer_value() {
        let source = ScriptedSource::new(&[("a", &[Some(1), Some(2)])]);
        let cache = Cache::<String, u32>::new(manual_config(), source);

        cache.refresh().await;
        cache.refresh().await;
        assert_eq!(cache.get(&key("a")).await, Some(2));
    }

    #[tokio::test]
    async fn test_put_ignores_none() {
        let source = ScriptedSource::new(&[]);
        let cache = Cache::<String, u32>::new(manual_config(), source);

        cache.put(key("a"), Some(5)).await;
        cache.put(key("a"), None).await;
        assert_eq!(cache.get(&key("a")).await, Some(5));
    }

    #[tokio::test]
    async fn test_refresh_key_only_touches_one_key() {
        let source = ScriptedSource::new(&[("a", &[Some(1)]), ("b", &[Some(2)])]);
        let cache = Cache::<String, u32>::new(manual_config(), source.clone());

        cache.refresh_key(&key("b")).await;
        assert_eq!(cache.get(&key("a")).await, None);
        assert_eq!(cache.get(&key("b")).await, Some(2));
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.refresh_count(), 0);
    }

    struct BarrierSource {
        keys: Vec<String>,
        barrier: Barrier,
    }

    #[async_trait]
    impl RefreshSource<String, u32> for BarrierSource {
        fn keys(&self) -> Vec<String> {
            self.keys.clone()
        }

        async fn value(&self, _key: &String) -> Option<u32> {
            // Only completes once every key's lookup is in flight.
            self.barrier.wait().await;
            Some(1)
        }
    }

    #[tokio::test]
    async fn test_lookups_run_concurrently() {
        let keys: Vec<String> = (0..4).map(|i| format!("node-{i}")).collect();
        let source = Arc::new(BarrierSource {
            barrier: Barrier::new(keys.len()),
            keys: keys.clone(),
        });
        let cache = Cache::<String, u32>::new(manual_config(), source);

        tokio::time::timeout(Duration::from_secs(5), cache.refresh())
            .await
            .expect("sequential lookups would deadlock on the barrier");

        for k in &keys {
            assert_eq!(cache.get(k).await, Some(1));
        }
    }

    #[tokio::test]
    async fn test_stop_without_start_is_noop() {
        let source = ScriptedSource::new(&[("a", &[Some(1)])]);
        let cache = Cache::<String, u32>::new(auto_config(), source);

        tokio::time::timeout(Duration::from_secs(1), cache.stop())
            .await
            .expect("stop must not block when never started");
        assert!(!cache.is_running().await);
        assert_eq!(cache.refresh_count(), 0);
    }

    #[tokio::test]
    async fn test_start_without_auto_refresh_populates_once() {
        let source = ScriptedSource::new(&[("a", &[Some(1)])]);
        let cache = Cache::<String, u32>::new(manual_config(), source);

        cache.start().await;
        assert_eq!(cache.get(&key("a")).await, Some(1));
        assert!(!cache.is_running().await);
        assert_eq!(cache.refresh_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_twice_runs_single_loop() {
        let source = ScriptedSource::new(&[("a", &[Some(1)])]);
        let cache = Cache::<String, u32>::new(auto_config(), source);

        cache.start().await;
        cache.start().await;
        assert!(cache.is_running().await);
        let after_start = cache.refresh_count();
        assert_eq!(after_start, 2);

        tokio::time::sleep(Duration::from_millis(350)).await;

        // One loop ticks at 100, 200, 300 ms; a second loop would double it.
        assert_eq!(cache.refresh_count() - after_start, 3);
        cache.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_halts_refreshes() {
        let source = ScriptedSource::new(&[("a", &[Some(1)])]);
        let cache = Cache::<String, u32>::new(auto_config(), source);

        cache.start().await;
        tokio::time::sleep(Duration::from_millis(250)).await;
        cache.stop().await;
        assert!(!cache.is_running().await);

        let stopped_at = cache.refresh_count();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(cache.refresh_count(), stopped_at);

        // Idempotent.
        cache.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_loop_picks_up_new_values() {
        let source = ScriptedSource::new(&[("a", &[Some(1), Some(2), Some(3)])]);
        let cache = Cache::<String, u32>::new(auto_config(), source);

        cache.start().await;
        assert_eq!(cache.get(&key("a")).await, Some(1));

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(cache.get(&key("a")).await, Some(3));
        cache.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_after_stop() {
        let source = ScriptedSource::new(&[("a", &[Some(1)])]);
        let cache = Cache::<String, u32>::new(auto_config(), source);

        cache.start().await;
        cache.stop().await;
        cache.start().await;
        assert!(cache.is_running().await);
        cache.stop().await;
    }
}
