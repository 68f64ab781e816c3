//! Request deduplication and TTL caching primitives
//!
//! Three pieces the rest of the gateway composes:
//!
//! - [`LockMap`]: per-key async mutexes guaranteeing at-most-one concurrent
//!   producer for a cache key, render target, or extraction operation.
//! - [`TtlCache`] / [`CacheBackend`]: bounded key→bytes store with per-entry
//!   deadlines; the in-process backend is the default, the durable KV can
//!   stand in where cross-process sharing matters.
//! - [`Memoize`]: singleflight TTL memoization. Concurrent callers with
//!   identical arguments coalesce onto one in-flight computation; successful
//!   results are cached for the TTL; negative results are not cached; a
//!   failing cache backend is non-fatal and the wrapped operation still runs.

use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use xxhash_rust::xxh32::xxh32;

use crate::error::ApiResult;

/// Default capacity for in-process TTL caches
const TTL_CACHE_ENTRIES: usize = 4096;

/// Stable non-cryptographic fingerprint of a deterministic serialization of
/// `args`. Filenames and cache keys derive from this, so it must not change
/// across processes.
pub fn fingerprint(args: &impl Serialize) -> String {
    let encoded = serde_json::to_vec(args).unwrap_or_default();
    format!("{:08x}", xxh32(&encoded, 0))
}

/// Fingerprint of a raw string seed
pub fn fingerprint_str(seed: &str) -> String {
    format!("{:08x}", xxh32(seed.as_bytes(), 0))
}

// ---------------------------------------------------------------------------
// LockMap
// ---------------------------------------------------------------------------

/// Map of named async mutexes. Lock entries are created on first use and
/// kept for the process lifetime, matching the per-key producer guarantee.
#[derive(Debug, Clone, Default)]
pub struct LockMap {
    inner: Arc<DashMap<String, Arc<AsyncMutex<()>>>>,
}

impl LockMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the named lock; the guard releases on every exit path.
    pub async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        let entry = self
            .inner
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone();
        entry.lock_owned().await
    }

    /// Non-blocking probe, used by tests and admin introspection
    pub fn is_locked(&self, key: &str) -> bool {
        self.inner
            .get(key)
            .map(|m| m.try_lock().is_err())
            .unwrap_or(false)
    }
}

// ---------------------------------------------------------------------------
// TTL cache backend
// ---------------------------------------------------------------------------

/// Byte-oriented cache with per-entry TTL
pub trait CacheBackend: Send + Sync + 'static {
    fn get(&self, key: &str) -> impl Future<Output = anyhow::Result<Option<Vec<u8>>>> + Send;
    fn set(
        &self,
        key: &str,
        value: &[u8],
        ttl: Duration,
    ) -> impl Future<Output = anyhow::Result<()>> + Send;
}

/// Bounded in-process TTL cache (LRU eviction, lazy expiry)
#[derive(Debug, Clone)]
pub struct TtlCache {
    entries: Arc<Mutex<LruCache<String, (Instant, Vec<u8>)>>>,
}

impl Default for TtlCache {
    fn default() -> Self {
        Self::with_capacity(TTL_CACHE_ENTRIES)
    }
}

impl TtlCache {
    pub fn with_capacity(cap: usize) -> Self {
        let cap = NonZeroUsize::new(cap.max(1)).expect("nonzero capacity");
        Self {
            entries: Arc::new(Mutex::new(LruCache::new(cap))),
        }
    }

    pub fn get_sync(&self, key: &str) -> Option<Vec<u8>> {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some((deadline, _)) if *deadline <= Instant::now() => {
                entries.pop(key);
                None
            }
            Some((_, value)) => Some(value.clone()),
            None => None,
        }
    }

    pub fn set_sync(&self, key: &str, value: &[u8], ttl: Duration) {
        self.entries
            .lock()
            .put(key.to_string(), (Instant::now() + ttl, value.to_vec()));
    }
}

impl CacheBackend for TtlCache {
    async fn get(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
        Ok(self.get_sync(key))
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> anyhow::Result<()> {
        self.set_sync(key, value, ttl);
        Ok(())
    }
}

impl CacheBackend for crate::kv::KvStore {
    async fn get(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
        self.get_string(key).await
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> anyhow::Result<()> {
        self.set_ex(key, value, ttl).await
    }
}

// ---------------------------------------------------------------------------
// Memoize
// ---------------------------------------------------------------------------

/// Singleflight TTL memoization over a [`CacheBackend`].
///
/// The final cache key is `<operation>:<fingerprint(args)>`. Holding the
/// per-key lock across the re-check and the computation is what collapses
/// concurrent identical callers onto a single producer.
#[derive(Debug, Clone)]
pub struct Memoize<B: CacheBackend> {
    backend: B,
    locks: LockMap,
}

impl<B: CacheBackend> Memoize<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            locks: LockMap::new(),
        }
    }

    /// Run `produce` at most once per TTL window for a given
    /// `(operation, args)` pair. `Ok(None)` and errors pass through
    /// uncached.
    pub async fn get_or_compute<T, F, Fut>(
        &self,
        operation: &str,
        args: &impl Serialize,
        ttl: Duration,
        produce: F,
    ) -> ApiResult<Option<T>>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = ApiResult<Option<T>>>,
    {
        let key = format!("{operation}:{}", fingerprint(args));

        if let Some(hit) = self.lookup(&key).await {
            return Ok(Some(hit));
        }

        let _guard = self.locks.lock(&key).await;

        // A coalesced caller may have populated the cache while we waited.
        if let Some(hit) = self.lookup(&key).await {
            return Ok(Some(hit));
        }

        let result = produce().await?;
        if let Some(ref value) = result {
            match serde_json::to_vec(value) {
                Ok(encoded) => {
                    if let Err(e) = self.backend.set(&key, &encoded, ttl).await {
                        tracing::warn!("cache set failed for {key}: {e:#}");
                    }
                }
                Err(e) => tracing::warn!("cache encode failed for {key}: {e}"),
            }
        }
        Ok(result)
    }

    async fn lookup<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = match self.backend.get(key).await {
            Ok(raw) => raw?,
            Err(e) => {
                // Cache failures must never block the wrapped operation.
                tracing::warn!("cache get failed for {key}: {e:#}");
                return None;
            }
        };
        serde_json::from_slice(&raw).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn lock_probe_reflects_holder() {
        let locks = LockMap::new();
        assert!(!locks.is_locked("render_x"));
        let guard = locks.lock("render_x").await;
        assert!(locks.is_locked("render_x"));
        drop(guard);
        assert!(!locks.is_locked("render_x"));
    }

    #[tokio::test]
    async fn ttl_cache_expires() {
        let cache = TtlCache::with_capacity(8);
        cache.set_sync("k", b"v", Duration::from_millis(10));
        assert_eq!(cache.get_sync("k"), Some(b"v".to_vec()));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(cache.get_sync("k"), None);
    }

    #[tokio::test]
    async fn memoize_coalesces_and_caches() {
        let memo = Arc::new(Memoize::new(TtlCache::default()));
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..10 {
            let memo = memo.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                memo.get_or_compute("op", &("a", 1), Duration::from_secs(60), || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    Ok(Some(42u32))
                })
                .await
                .unwrap()
            }));
        }
        for h in handles {
            assert_eq!(h.await.unwrap(), Some(42));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn memoize_skips_negative_results() {
        let memo = Memoize::new(TtlCache::default());
        let calls = AtomicUsize::new(0);

        for _ in 0..2 {
            let got: Option<u32> = memo
                .get_or_compute("neg", &"x", Duration::from_secs(60), || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(None)
                })
                .await
                .unwrap();
            assert_eq!(got, None);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn fingerprint_is_stable() {
        assert_eq!(fingerprint(&("u", 3)), fingerprint(&("u", 3)));
        assert_ne!(fingerprint(&("u", 3)), fingerprint(&("u", 4)));
    }
}
