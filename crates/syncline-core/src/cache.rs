//! In-memory TTL cache with explicit staleness.
//!
//! `get` never returns an entry past `expires_at`. Reading an expired or
//! aging entry is only possible through [`Cache::get_or_stale`].

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio::time::MissedTickBehavior;
use tokio_util::task::AbortOnDropHandle;

use crate::clock::{duration_ms, Clock};
use crate::error::Result;
use crate::models::{entity_cache_key, list_cache_prefix};
use crate::store::{LocalStore, StoreEvent};

/// How usable a cached value is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// Younger than the staleness threshold
    Fresh,
    /// Past the threshold but not expired; serve and refresh
    Stale,
    /// Past `expires_at`; only usable as a degraded fallback
    Expired,
}

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    created_at: i64,
    expires_at: i64,
}

struct Inner<V> {
    entries: Mutex<HashMap<String, CacheEntry<V>>>,
    /// Keys with a refresh in flight, flagged once invalidated meanwhile
    refreshing: Mutex<HashMap<String, bool>>,
    clock: Arc<dyn Clock>,
    default_ttl: Duration,
    stale_fraction: f64,
}

/// Shared TTL cache. Cloning is cheap and clones share entries.
pub struct Cache<V> {
    inner: Arc<Inner<V>>,
}

impl<V> Clone for Cache<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V: Clone + Send + Sync + 'static> Cache<V> {
    /// `stale_fraction` is the share of an entry's TTL after which it counts
    /// as stale (typically 0.5).
    pub fn new(clock: Arc<dyn Clock>, default_ttl: Duration, stale_fraction: f64) -> Self {
        Self {
            inner: Arc::new(Inner {
                entries: Mutex::new(HashMap::new()),
                refreshing: Mutex::new(HashMap::new()),
                clock,
                default_ttl,
                stale_fraction: stale_fraction.clamp(f64::EPSILON, 1.0),
            }),
        }
    }

    pub fn default_ttl(&self) -> Duration {
        self.inner.default_ttl
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, CacheEntry<V>>> {
        // A panic mid-update leaves at worst a stale entry behind
        self.inner
            .entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn refreshing(&self) -> MutexGuard<'_, HashMap<String, bool>> {
        self.inner
            .refreshing
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn freshness(&self, entry: &CacheEntry<V>, now: i64) -> Freshness {
        if now > entry.expires_at {
            return Freshness::Expired;
        }
        let ttl = Duration::from_millis(
            u64::try_from(entry.expires_at - entry.created_at).unwrap_or_default(),
        );
        let threshold = duration_ms(ttl.mul_f64(self.inner.stale_fraction));
        if now - entry.created_at >= threshold {
            Freshness::Stale
        } else {
            Freshness::Fresh
        }
    }

    /// Get a live value; expired entries are treated as misses.
    pub fn get(&self, key: &str) -> Option<V> {
        let now = self.inner.clock.now_ms();
        let mut entries = self.entries();
        match entries.get(key) {
            Some(entry) if now <= entry.expires_at => Some(entry.value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    /// Get a value regardless of age, together with its freshness.
    pub fn get_or_stale(&self, key: &str) -> Option<(V, Freshness)> {
        let now = self.inner.clock.now_ms();
        let entries = self.entries();
        entries
            .get(key)
            .map(|entry| (entry.value.clone(), self.freshness(entry, now)))
    }

    /// Store `value` for `ttl`.
    pub fn set(&self, key: impl Into<String>, value: V, ttl: Duration) {
        let now = self.inner.clock.now_ms();
        let entry = CacheEntry {
            value,
            created_at: now,
            expires_at: now.saturating_add(duration_ms(ttl)),
        };
        self.entries().insert(key.into(), entry);
    }

    /// Store `value` with the default TTL.
    pub fn insert(&self, key: impl Into<String>, value: V) {
        self.set(key, value, self.inner.default_ttl);
    }

    // Must not hold the entries lock: refresh completion locks
    // `refreshing` before `entries`.
    fn cancel_refreshes(&self, matches: impl Fn(&str) -> bool) {
        for (key, invalidated) in self.refreshing().iter_mut() {
            if matches(key) {
                *invalidated = true;
            }
        }
    }

    pub fn invalidate(&self, key: &str) -> bool {
        self.cancel_refreshes(|k| k == key);
        self.entries().remove(key).is_some()
    }

    /// Drop every key starting with `prefix`.
    pub fn invalidate_prefix(&self, prefix: &str) -> usize {
        self.cancel_refreshes(|k| k.starts_with(prefix));
        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|key, _| !key.starts_with(prefix));
        before - entries.len()
    }

    /// Whether `key` is missing, expired, or older than `threshold`.
    pub fn is_stale(&self, key: &str, threshold: Duration) -> bool {
        let now = self.inner.clock.now_ms();
        self.entries().get(key).is_none_or(|entry| {
            now > entry.expires_at || now - entry.created_at >= duration_ms(threshold)
        })
    }

    /// Serve a live hit and, if it is stale, refresh it in the background.
    ///
    /// At most one refresh per key runs at a time. A failed refresh keeps
    /// the old entry, and a refresh whose key was invalidated while it ran
    /// is discarded.
    pub fn get_with_refresh<F, Fut>(&self, key: &str, refresh: F) -> Option<V>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<V>> + Send + 'static,
    {
        let (value, freshness) = self.get_or_stale(key)?;
        if freshness == Freshness::Expired {
            return None;
        }

        if freshness == Freshness::Stale && self.claim_refresh(key) {
            let cache = self.clone();
            let key = key.to_string();
            tokio::spawn(async move {
                let result = refresh().await;
                let mut refreshing = cache.refreshing();
                let invalidated = refreshing.remove(&key).unwrap_or(true);
                match result {
                    Ok(fresh) if !invalidated => cache.insert(key, fresh),
                    Ok(_) => tracing::debug!(key = %key, "Dropping refresh of invalidated key"),
                    Err(e) => tracing::warn!(key = %key, "Background cache refresh failed: {e}"),
                }
            });
        }

        Some(value)
    }

    fn claim_refresh(&self, key: &str) -> bool {
        match self.refreshing().entry(key.to_string()) {
            Entry::Vacant(slot) => {
                slot.insert(false);
                true
            }
            Entry::Occupied(_) => false,
        }
    }

    /// Remove expired entries.
    pub fn sweep_expired(&self) -> usize {
        let now = self.inner.clock.now_ms();
        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|_, entry| now <= entry.expires_at);
        let removed = before - entries.len();
        if removed > 0 {
            tracing::debug!("Swept {removed} expired cache entries");
        }
        removed
    }

    /// Periodically sweep expired entries until the guard is dropped.
    pub fn spawn_sweeper(&self, every: Duration) -> AbortOnDropHandle<()> {
        let cache = self.clone();
        AbortOnDropHandle::new(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                cache.sweep_expired();
            }
        }))
    }

    /// Invalidate entity and list keys whenever `store` commits a change.
    pub fn attach(&self, store: &LocalStore) -> AbortOnDropHandle<()> {
        let cache = self.clone();
        let mut events = store.subscribe();
        AbortOnDropHandle::new(tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(
                        StoreEvent::Upserted { collection, id }
                        | StoreEvent::Deleted { collection, id },
                    ) => {
                        cache.invalidate(&entity_cache_key(collection, &id));
                        cache.invalidate_prefix(&list_cache_prefix(collection));
                    }
                    Ok(StoreEvent::Reset) => cache.clear(),
                    Err(RecvError::Lagged(missed)) => {
                        tracing::debug!("Cache missed {missed} store events, flushing");
                        cache.clear();
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }))
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    pub fn clear(&self) {
        self.cancel_refreshes(|_| true);
        self.entries().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::Error;
    use crate::models::{Collection, Entity, Payload};
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn cache() -> (Cache<String>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(0));
        let cache = Cache::new(clock.clone(), Duration::from_secs(10), 0.5);
        (cache, clock)
    }

    #[test]
    fn get_respects_ttl_boundary() {
        let (cache, clock) = cache();
        cache.set("k", "v".to_string(), Duration::from_millis(100));

        clock.set(100);
        assert_eq!(cache.get("k").as_deref(), Some("v"));
        clock.set(101);
        assert_eq!(cache.get("k"), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn stale_reads_are_explicit() {
        let (cache, clock) = cache();
        cache.set("k", "v".to_string(), Duration::from_millis(100));

        assert_eq!(cache.get_or_stale("k").unwrap().1, Freshness::Fresh);
        clock.set(60);
        assert_eq!(cache.get_or_stale("k").unwrap().1, Freshness::Stale);
        clock.set(200);
        assert_eq!(
            cache.get_or_stale("k"),
            Some(("v".to_string(), Freshness::Expired))
        );
        assert_eq!(cache.get("k"), None);
    }

    #[test]
    fn is_stale_uses_threshold() {
        let (cache, clock) = cache();
        assert!(cache.is_stale("missing", Duration::from_secs(1)));

        cache.insert("k", "v".to_string());
        assert!(!cache.is_stale("k", Duration::from_secs(1)));
        clock.advance(Duration::from_secs(1));
        assert!(cache.is_stale("k", Duration::from_secs(1)));
    }

    #[test]
    fn invalidate_prefix_only_touches_matching_keys() {
        let (cache, _) = cache();
        cache.insert("notes:list", "a".to_string());
        cache.insert("notes:list:pinned", "b".to_string());
        cache.insert("notes:n1", "c".to_string());

        assert_eq!(cache.invalidate_prefix("notes:list"), 2);
        assert!(cache.invalidate("notes:n1"));
        assert!(!cache.invalidate("notes:n1"));
        assert!(cache.is_empty());
    }

    #[test]
    fn sweep_removes_only_expired() {
        let (cache, clock) = cache();
        cache.set("short", "a".to_string(), Duration::from_millis(10));
        cache.set("long", "b".to_string(), Duration::from_secs(60));

        clock.set(11);
        assert_eq!(cache.sweep_expired(), 1);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_runs_periodically() {
        let (cache, clock) = cache();
        cache.set("k", "v".to_string(), Duration::from_millis(10));
        let _sweeper = cache.spawn_sweeper(Duration::from_secs(1));

        clock.set(20);
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn stale_hit_triggers_single_background_refresh() {
        let (cache, clock) = cache();
        cache.insert("k", "old".to_string());
        clock.set(6_000);

        let calls = Arc::new(AtomicUsize::new(0));
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let first_calls = calls.clone();
        let served = cache.get_with_refresh("k", move || async move {
            first_calls.fetch_add(1, Ordering::SeqCst);
            let _ = release_rx.await;
            Ok("new".to_string())
        });
        assert_eq!(served.as_deref(), Some("old"));

        // Suppressed while the first refresh is still running
        let second_calls = calls.clone();
        let served = cache.get_with_refresh("k", move || async move {
            second_calls.fetch_add(1, Ordering::SeqCst);
            Ok("other".to_string())
        });
        assert_eq!(served.as_deref(), Some("old"));

        release_tx.send(()).unwrap();
        for _ in 0..50 {
            if cache.get("k").as_deref() == Some("new") {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(cache.get("k").as_deref(), Some("new"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn refresh_finishing_after_invalidate_is_discarded() {
        let (cache, clock) = cache();
        cache.insert("k", "old".to_string());
        clock.set(6_000);

        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let (done_tx, done_rx) = tokio::sync::oneshot::channel::<()>();
        cache.get_with_refresh("k", move || async move {
            let _ = release_rx.await;
            let _ = done_tx.send(());
            Ok("pre-invalidation".to_string())
        });
        tokio::task::yield_now().await;

        assert!(cache.invalidate("k"));
        release_tx.send(()).unwrap();
        done_rx.await.unwrap();
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(cache.get("k"), None);

        // The key can be refreshed again once the discarded run is gone
        cache.insert("k", "newer".to_string());
        clock.set(12_000);
        cache.get_with_refresh("k", || async { Ok("fresh".to_string()) });
        for _ in 0..50 {
            if cache.get("k").as_deref() == Some("fresh") {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(cache.get("k").as_deref(), Some("fresh"));
    }

    #[tokio::test]
    async fn failed_refresh_keeps_old_value() {
        let (cache, clock) = cache();
        cache.insert("k", "old".to_string());
        clock.set(6_000);

        cache.get_with_refresh("k", || async { Err(Error::NotFound("k".into())) });
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(
            cache.get_or_stale("k"),
            Some(("old".to_string(), Freshness::Stale))
        );
    }

    #[tokio::test]
    async fn attached_cache_invalidates_on_store_events() {
        let clock = Arc::new(ManualClock::new(1_000));
        let store = LocalStore::open_in_memory(clock.clone()).unwrap();
        let cache: Cache<String> = Cache::new(clock, Duration::from_secs(60), 0.5);
        let _attached = cache.attach(&store);

        cache.insert("notes:n1", "cached".to_string());
        cache.insert("notes:list", "cached".to_string());
        cache.insert("reminders:r1", "cached".to_string());

        store
            .put(&Entity::new(Collection::Notes, "n1", Payload::new(), 5))
            .unwrap();
        for _ in 0..50 {
            if cache.len() == 1 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(cache.len(), 1);
        assert!(cache.get("reminders:r1").is_some());
    }
}
