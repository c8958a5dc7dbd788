//! API key resolution with a short-TTL cache.
//!
//! Secrets are hashed on entry and only the hash is used as a cache key.
//! Concurrent misses for one key share a single control-plane lookup through
//! a per-key `OnceCell`. Lookups that fail or time out resolve to "not found"
//! (fail closed) and are cached for the shorter negative TTL.
//!
//! Invalidation bumps a generation counter; a lookup that started under an
//! older generation still answers its waiters but never writes the cache.
//!
//! The in-flight cell is removed once the lookup completes, or when its last
//! waiter is cancelled before it does.

use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::domain::config::KeyStoreConfig;
use crate::domain::types::{KeyHash, ProjectId, ResolvedKey};
use crate::ports::IdentitySource;

type Lookup = Option<ResolvedKey>;

/// Removes an in-flight cell when its waiter finishes or is dropped
struct InflightGuard<'a> {
    inflight: &'a DashMap<KeyHash, Arc<OnceCell<Lookup>>>,
    hash: KeyHash,
    cell: Arc<OnceCell<Lookup>>,
}

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        // map + this guard; anything more is another waiter still driving it
        self.inflight.remove_if(&self.hash, |_, current| {
            Arc::ptr_eq(current, &self.cell)
                && (current.initialized() || Arc::strong_count(current) <= 2)
        });
    }
}

struct CacheEntry {
    resolved: Lookup,
    expires_at: Instant,
}

/// Counters exposed on the metrics endpoint
#[derive(Debug, Clone, Default, Serialize)]
pub struct KeyStoreStats {
    pub cached_entries: usize,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub lookups: u64,
    pub lookup_failures: u64,
    pub generation: u64,
}

/// Cached key resolution
pub struct KeyStore {
    source: Arc<dyn IdentitySource>,
    config: KeyStoreConfig,
    cache: DashMap<KeyHash, CacheEntry>,
    inflight: DashMap<KeyHash, Arc<OnceCell<Lookup>>>,
    generation: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    lookups: AtomicU64,
    lookup_failures: AtomicU64,
}

impl KeyStore {
    pub fn new(source: Arc<dyn IdentitySource>, config: KeyStoreConfig) -> Self {
        Self {
            source,
            config,
            cache: DashMap::new(),
            inflight: DashMap::new(),
            generation: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            lookups: AtomicU64::new(0),
            lookup_failures: AtomicU64::new(0),
        }
    }

    /// Resolve a presented secret to its project, or `None`.
    pub async fn resolve(&self, secret: &str) -> Option<ResolvedKey> {
        if secret.is_empty() {
            return None;
        }
        let hash = KeyHash::of(secret);

        if let Some(entry) = self.cache.get(&hash) {
            if entry.expires_at > Instant::now() {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return entry.resolved.clone();
            }
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        let guard = InflightGuard {
            inflight: &self.inflight,
            hash,
            cell: Arc::clone(
                self.inflight
                    .entry(hash)
                    .or_insert_with(|| Arc::new(OnceCell::new()))
                    .value(),
            ),
        };

        let resolved = guard
            .cell
            .get_or_init(|| self.lookup(secret, hash))
            .await
            .clone();
        resolved
    }

    async fn lookup(&self, secret: &str, hash: KeyHash) -> Lookup {
        let generation = self.generation.load(Ordering::Acquire);
        self.lookups.fetch_add(1, Ordering::Relaxed);

        let result =
            tokio::time::timeout(self.config.lookup_timeout, self.source.validate(secret)).await;

        let (resolved, ttl) = match result {
            Ok(Ok(Some(v))) if v.active => (
                Some(ResolvedKey {
                    project_id: v.project_id,
                    upstream_base_url: v.upstream_base_url,
                }),
                self.config.cache_ttl,
            ),
            Ok(Ok(_)) => {
                debug!(key = %hash.short(), "Key unknown or inactive");
                (None, self.config.negative_ttl)
            }
            Ok(Err(e)) => {
                self.lookup_failures.fetch_add(1, Ordering::Relaxed);
                warn!(key = %hash.short(), error = %e, "Key lookup failed, failing closed");
                (None, self.config.negative_ttl)
            }
            Err(_) => {
                self.lookup_failures.fetch_add(1, Ordering::Relaxed);
                warn!(
                    key = %hash.short(),
                    timeout_ms = self.config.lookup_timeout.as_millis() as u64,
                    "Key lookup timed out, failing closed"
                );
                (None, self.config.negative_ttl)
            }
        };

        if self.generation.load(Ordering::Acquire) == generation {
            self.cache.insert(
                hash,
                CacheEntry {
                    resolved: resolved.clone(),
                    expires_at: Instant::now() + ttl,
                },
            );
        } else {
            debug!(key = %hash.short(), "Discarding lookup from an older generation");
        }
        resolved
    }

    /// Forget every cached key of a project and all negative entries.
    pub fn invalidate_project(&self, project_id: &ProjectId) -> usize {
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.inflight.clear();
        let before = self.cache.len();
        self.cache.retain(|_, entry| {
            entry
                .resolved
                .as_ref()
                .is_some_and(|r| &r.project_id != project_id)
        });
        let removed = before.saturating_sub(self.cache.len());
        info!(project_id = %project_id, removed, "Invalidated cached keys");
        removed
    }

    pub fn invalidate_all(&self) -> usize {
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.inflight.clear();
        let removed = self.cache.len();
        self.cache.clear();
        info!(removed, "Invalidated entire key cache");
        removed
    }

    /// Drop expired entries (called periodically)
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.cache.len();
        self.cache.retain(|_, entry| entry.expires_at > now);
        before.saturating_sub(self.cache.len())
    }

    pub fn stats(&self) -> KeyStoreStats {
        KeyStoreStats {
            cached_entries: self.cache.len(),
            cache_hits: self.hits.load(Ordering::Relaxed),
            cache_misses: self.misses.load(Ordering::Relaxed),
            lookups: self.lookups.load(Ordering::Relaxed),
            lookup_failures: self.lookup_failures.load(Ordering::Relaxed),
            generation: self.generation.load(Ordering::Relaxed),
        }
    }

    #[cfg(test)]
    fn inflight_count(&self) -> usize {
        self.inflight.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::error::IdentityError;
    use crate::ports::KeyValidation;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[derive(Default)]
    struct StubSource {
        keys: Mutex<HashMap<String, KeyValidation>>,
        calls: AtomicUsize,
        delay: Mutex<Duration>,
        failing: std::sync::atomic::AtomicBool,
    }

    impl StubSource {
        fn with_key(secret: &str, project: &str) -> Arc<Self> {
            let source = Arc::new(Self::default());
            source.set(secret, project, true);
            source
        }

        fn set(&self, secret: &str, project: &str, active: bool) {
            self.keys.lock().insert(
                secret.to_string(),
                KeyValidation {
                    project_id: ProjectId::new(project),
                    upstream_base_url: "http://upstream.local".into(),
                    active,
                },
            );
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl IdentitySource for StubSource {
        async fn validate(&self, secret: &str) -> Result<Option<KeyValidation>, IdentityError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let delay = *self.delay.lock();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if self.failing.load(Ordering::SeqCst) {
                return Err(IdentityError::Unreachable("connection refused".into()));
            }
            Ok(self.keys.lock().get(secret).cloned())
        }
    }

    fn store(source: Arc<StubSource>) -> KeyStore {
        KeyStore::new(source, KeyStoreConfig::default())
    }

    #[tokio::test]
    async fn test_resolve_and_cache_hit() {
        let source = StubSource::with_key("sk_live_a", "p1");
        let ks = store(source.clone());

        let first = ks.resolve("sk_live_a").await.unwrap();
        assert_eq!(first.project_id, ProjectId::new("p1"));
        let second = ks.resolve("sk_live_a").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(source.calls(), 1);
        assert_eq!(ks.stats().cache_hits, 1);
    }

    #[tokio::test]
    async fn test_unknown_and_inactive_keys() {
        let source = StubSource::with_key("sk_live_a", "p1");
        source.set("sk_live_old", "p1", false);
        let ks = store(source.clone());

        assert!(ks.resolve("sk_live_nope").await.is_none());
        assert!(ks.resolve("sk_live_old").await.is_none());
        assert!(ks.resolve("").await.is_none());
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_misses_coalesce() {
        let source = StubSource::with_key("sk_live_a", "p1");
        *source.delay.lock() = Duration::from_millis(100);
        let ks = Arc::new(store(source.clone()));

        let mut handles = Vec::new();
        for _ in 0..50 {
            let ks = Arc::clone(&ks);
            handles.push(tokio::spawn(async move { ks.resolve("sk_live_a").await }));
        }
        for h in handles {
            assert!(h.await.unwrap().is_some());
        }
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test]
    async fn test_fails_closed_when_source_unreachable() {
        let source = StubSource::with_key("sk_live_a", "p1");
        source.failing.store(true, Ordering::SeqCst);
        let ks = store(source.clone());

        assert!(ks.resolve("sk_live_a").await.is_none());
        assert_eq!(ks.stats().lookup_failures, 1);

        // negative entry served from cache
        assert!(ks.resolve("sk_live_a").await.is_none());
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lookup_timeout_fails_closed() {
        let source = StubSource::with_key("sk_live_a", "p1");
        *source.delay.lock() = Duration::from_secs(30);
        let ks = store(source);
        assert!(ks.resolve("sk_live_a").await.is_none());
        assert_eq!(ks.stats().lookup_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_entries_expire_after_ttl() {
        let source = StubSource::with_key("sk_live_a", "p1");
        let ks = store(source.clone());

        ks.resolve("sk_live_a").await;
        tokio::time::advance(Duration::from_secs(30)).await;
        ks.resolve("sk_live_a").await;
        assert_eq!(source.calls(), 1);

        tokio::time::advance(Duration::from_secs(16)).await;
        ks.resolve("sk_live_a").await;
        assert_eq!(source.calls(), 2);

        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(ks.purge_expired(), 1);
    }

    #[tokio::test]
    async fn test_regeneration_takes_effect_on_invalidate() {
        let source = StubSource::with_key("sk_live_old", "p1");
        let ks = store(source.clone());
        assert!(ks.resolve("sk_live_old").await.is_some());

        // control plane swaps the secret, then notifies the gateway
        source.keys.lock().remove("sk_live_old");
        source.set("sk_live_new", "p1", true);
        ks.invalidate_project(&ProjectId::new("p1"));

        assert!(ks.resolve("sk_live_old").await.is_none());
        assert!(ks.resolve("sk_live_new").await.is_some());
    }

    #[tokio::test]
    async fn test_invalidate_project_keeps_other_projects() {
        let source = StubSource::with_key("sk_a", "p1");
        source.set("sk_b", "p2", true);
        let ks = store(source.clone());
        ks.resolve("sk_a").await;
        ks.resolve("sk_b").await;
        ks.resolve("sk_missing").await;

        assert_eq!(ks.invalidate_project(&ProjectId::new("p1")), 2);
        assert_eq!(ks.stats().cached_entries, 1);
        ks.resolve("sk_b").await;
        assert_eq!(source.calls(), 3);

        assert_eq!(ks.invalidate_all(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_lookup_releases_inflight_cell() {
        let source = StubSource::with_key("sk_live_a", "p1");
        *source.delay.lock() = Duration::from_secs(2);
        let ks = store(source.clone());

        // caller gives up while the control plane is still answering
        let abandoned =
            tokio::time::timeout(Duration::from_millis(100), ks.resolve("sk_live_a")).await;
        assert!(abandoned.is_err());
        assert_eq!(ks.inflight_count(), 0);

        *source.delay.lock() = Duration::ZERO;
        assert!(ks.resolve("sk_live_a").await.is_some());
        assert_eq!(ks.inflight_count(), 0);
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancelled_waiter_leaves_shared_lookup_running() {
        let source = StubSource::with_key("sk_live_a", "p1");
        *source.delay.lock() = Duration::from_millis(200);
        let ks = Arc::new(store(source.clone()));

        let patient = {
            let ks = Arc::clone(&ks);
            tokio::spawn(async move { ks.resolve("sk_live_a").await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let impatient =
            tokio::time::timeout(Duration::from_millis(20), ks.resolve("sk_live_a")).await;
        assert!(impatient.is_err());

        assert!(patient.await.unwrap().is_some());
        assert_eq!(source.calls(), 1);
        assert_eq!(ks.inflight_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stale_lookup_is_not_cached() {
        let source = StubSource::with_key("sk_live_a", "p1");
        *source.delay.lock() = Duration::from_millis(200);
        let ks = Arc::new(store(source.clone()));

        let pending = {
            let ks = Arc::clone(&ks);
            tokio::spawn(async move { ks.resolve("sk_live_a").await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        ks.invalidate_all();

        // the in-flight request still completes
        assert!(pending.await.unwrap().is_some());
        assert_eq!(ks.stats().cached_entries, 0);

        *source.delay.lock() = Duration::ZERO;
        ks.resolve("sk_live_a").await;
        assert_eq!(source.calls(), 2);
    }
}
