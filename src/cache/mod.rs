//! TTL request cache with per-key singleflight and an optional durable mirror.
//!
//! Stores typed `Arc<V>` values. A miss spawns exactly one producer task per
//! key; every concurrent caller for that key awaits the same shared result,
//! success or failure. Successful values are mirrored (best effort) so a fresh
//! process can start warm.

pub mod debounce;
pub mod errors;
pub mod mirror;

pub use debounce::Debouncer;
pub use errors::{CacheError, MirrorError};
pub use mirror::{FileMirror, MemoryMirror, MirrorEnvelope, MirrorStore};

use crate::utils::fmt_duration;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Timing knobs for a [`RequestCache`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheSettings {
    /// How long an entry stays valid after it was stored.
    pub ttl: Duration,
    /// How long a caller waits on someone else's in-flight fetch.
    pub wait_timeout: Duration,
    /// Quiet period used by [`RequestCache::debounced_invalidate_default`].
    pub debounce_delay: Duration,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(5 * 60),
            wait_timeout: Duration::from_secs(10),
            debounce_delay: Duration::from_millis(300),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FetchOptions {
    /// Skip memory and mirror lookups and fetch again.
    pub force: bool,
}

impl FetchOptions {
    pub fn forced() -> Self {
        Self { force: true }
    }
}

/// Where a fetched value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Memory,
    Mirror,
    /// This call ran the producer.
    Producer,
    /// This call joined a producer started by another caller.
    Joined,
}

#[derive(Debug)]
pub struct Fetched<V> {
    pub value: Arc<V>,
    pub origin: Origin,
}

struct CacheEntry<V> {
    stored_at: Instant,
    value: Arc<V>,
}

impl<V> CacheEntry<V> {
    fn fresh(value: Arc<V>) -> Self {
        Self {
            stored_at: Instant::now(),
            value,
        }
    }

    fn is_valid(&self, ttl: Duration) -> bool {
        self.stored_at.elapsed() < ttl
    }
}

type SharedFetch<V> = Shared<BoxFuture<'static, Result<Arc<V>, CacheError>>>;

struct InFlight<V> {
    id: u64,
    fetch: SharedFetch<V>,
}

struct CacheInner<V> {
    settings: CacheSettings,
    /// key → (stored_at, value)
    entries: DashMap<String, CacheEntry<V>>,
    /// key → the one producer currently running for it
    inflight: DashMap<String, InFlight<V>>,
    mirror: Option<Arc<dyn MirrorStore>>,
    /// key → when it was last invalidated. Mirror envelopes stamped at or
    /// before this are stale.
    invalidated: DashMap<String, DateTime<Utc>>,
    /// `invalidate_all` time in microseconds since the epoch.
    cleared_at: AtomicI64,
    debouncer: Debouncer,
    shutdown: CancellationToken,
    closed: AtomicBool,
    next_fetch_id: AtomicU64,
}

/// Shared request cache. Clone-cheap (all state behind one `Arc`).
pub struct RequestCache<V> {
    inner: Arc<CacheInner<V>>,
}

impl<V> Clone for RequestCache<V> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<V> RequestCache<V>
where
    V: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn new(settings: CacheSettings) -> Self {
        Self::build(settings, None)
    }

    pub fn with_mirror(settings: CacheSettings, mirror: Arc<dyn MirrorStore>) -> Self {
        Self::build(settings, Some(mirror))
    }

    fn build(settings: CacheSettings, mirror: Option<Arc<dyn MirrorStore>>) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                settings,
                entries: DashMap::new(),
                inflight: DashMap::new(),
                mirror,
                invalidated: DashMap::new(),
                cleared_at: AtomicI64::new(i64::MIN),
                debouncer: Debouncer::new(),
                shutdown: CancellationToken::new(),
                closed: AtomicBool::new(false),
                next_fetch_id: AtomicU64::new(0),
            }),
        }
    }

    pub fn settings(&self) -> CacheSettings {
        self.inner.settings
    }

    /// Return the freshest value for `key`, running `producer` at most once
    /// across all concurrent callers when nothing valid is available.
    pub async fn fetch<F, Fut, E>(
        &self,
        key: &str,
        producer: F,
        options: FetchOptions,
    ) -> Result<Fetched<V>, CacheError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
        E: Into<anyhow::Error> + Send + 'static,
    {
        if key.is_empty() {
            return Err(CacheError::EmptyKey);
        }
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(CacheError::ShutDown);
        }

        if !options.force {
            if let Some(value) = self.peek(key) {
                trace!(key, "cache hit");
                return Ok(Fetched {
                    value,
                    origin: Origin::Memory,
                });
            }
            if let Some(value) = self.load_from_mirror(key).await {
                return Ok(Fetched {
                    value,
                    origin: Origin::Mirror,
                });
            }
        }

        let (fetch, origin) = match self.inner.inflight.entry(key.to_owned()) {
            Entry::Occupied(running) => (running.get().fetch.clone(), Origin::Joined),
            Entry::Vacant(slot) => {
                let id = self.inner.next_fetch_id.fetch_add(1, Ordering::Relaxed);
                let fetch = self.spawn_producer(key.to_owned(), id, producer);
                slot.insert(InFlight {
                    id,
                    fetch: fetch.clone(),
                });
                (fetch, Origin::Producer)
            }
        };

        let value = match origin {
            Origin::Joined => {
                debug!(key, "joining in-flight fetch");
                let waited = self.inner.settings.wait_timeout;
                tokio::time::timeout(waited, fetch)
                    .await
                    .map_err(|_| CacheError::WaitTimedOut {
                        key: key.to_owned(),
                        waited,
                    })??
            }
            _ => fetch.await?,
        };

        Ok(Fetched { value, origin })
    }

    /// Spawn the producer as its own task so it outlives a dropped caller.
    fn spawn_producer<F, Fut, E>(&self, key: String, id: u64, producer: F) -> SharedFetch<V>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
        E: Into<anyhow::Error> + Send + 'static,
    {
        let inner = self.inner.clone();
        let task_key = key.clone();
        debug!(key = %key, "cache miss, starting producer");

        let handle = tokio::spawn(async move {
            let key = task_key;
            let start = Instant::now();
            let result = tokio::select! {
                _ = inner.shutdown.cancelled() => Err(CacheError::Cancelled { key: key.clone() }),
                produced = producer() => produced.map_err(|e| CacheError::Producer {
                    key: key.clone(),
                    cause: Arc::new(e.into()),
                }),
            };

            let result = result.map(Arc::new);
            let stored_at = finish_fetch(&inner, &key, id, result.as_ref().ok());

            match &result {
                Ok(value) => {
                    debug!(
                        key = %key,
                        stored = stored_at.is_some(),
                        elapsed = fmt_duration(start.elapsed()),
                        "producer finished"
                    );
                    if let Some(stored_at) = stored_at {
                        mirror_in_background(&inner, &key, value, stored_at);
                    }
                }
                Err(e) => debug!(key = %key, error = %e, "producer failed"),
            }
            result
        });

        async move {
            match handle.await {
                Ok(result) => result,
                Err(e) if e.is_cancelled() => Err(CacheError::Cancelled { key }),
                Err(_) => Err(CacheError::ProducerPanicked { key }),
            }
        }
        .boxed()
        .shared()
    }

    /// Try to adopt a fresh mirrored entry into memory.
    async fn load_from_mirror(&self, key: &str) -> Option<Arc<V>> {
        let mirror = self.inner.mirror.as_ref()?;
        let envelope = match mirror.get(key).await {
            Ok(Some(envelope)) => envelope,
            Ok(None) => return None,
            Err(e) => {
                debug!(key, error = %e, "mirror read failed, treating as miss");
                return None;
            }
        };

        if !envelope.is_fresh_at(self.inner.settings.ttl, Utc::now()) {
            debug!(key, stored_at = %envelope.timestamp, "mirror entry expired");
            return None;
        }
        if self.invalidated_since(key, envelope.timestamp) {
            debug!(key, stored_at = %envelope.timestamp, "mirror entry predates invalidation");
            return None;
        }

        let value: V = match serde_json::from_value(envelope.data) {
            Ok(value) => value,
            Err(e) => {
                debug!(key, error = %e, "mirror entry does not match value type");
                return None;
            }
        };

        let value = Arc::new(value);
        self.inner
            .entries
            .insert(key.to_owned(), CacheEntry::fresh(value.clone()));
        debug!(key, "cache warmed from mirror");
        Some(value)
    }

    fn invalidated_since(&self, key: &str, stamped: DateTime<Utc>) -> bool {
        if stamped.timestamp_micros() <= self.inner.cleared_at.load(Ordering::Acquire) {
            return true;
        }
        self.inner
            .invalidated
            .get(key)
            .is_some_and(|at| stamped <= *at)
    }

    /// Fresh value for `key` without running anything. Evicts an expired entry.
    pub fn peek(&self, key: &str) -> Option<Arc<V>> {
        let ttl = self.inner.settings.ttl;
        if let Some(entry) = self.inner.entries.get(key) {
            if entry.is_valid(ttl) {
                return Some(entry.value.clone());
            }
        }
        if self
            .inner
            .entries
            .remove_if(key, |_, e| !e.is_valid(ttl))
            .is_some()
        {
            trace!(key, "expired entry evicted");
        }
        None
    }

    pub fn is_in_flight(&self, key: &str) -> bool {
        self.inner.inflight.contains_key(key)
    }

    /// Number of stored entries, including expired ones not yet evicted.
    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    /// Drop the entry for `key`. A producer still running for the key answers
    /// its callers but its result is not stored. Mirrored copies written
    /// before now are ignored from here on and removed in the background.
    pub fn invalidate(&self, key: &str) {
        self.inner.invalidated.insert(key.to_owned(), Utc::now());
        let detached = self.inner.inflight.remove(key).is_some();
        let removed = self.inner.entries.remove(key).is_some();
        // Stamp again so a store that finished while we were removing is covered.
        self.inner.invalidated.insert(key.to_owned(), Utc::now());
        debug!(key, removed, detached, "cache key invalidated");
        self.remove_mirrored(key);
    }

    fn remove_mirrored(&self, key: &str) {
        let Some(mirror) = self.inner.mirror.clone() else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let key = key.to_owned();
        runtime.spawn(async move {
            if let Err(e) = mirror.remove(&key).await {
                warn!(key = %key, error = %e, "mirror removal failed");
            }
        });
    }

    /// Drop every entry. Mirrored copies written before now are ignored.
    pub fn invalidate_all(&self) {
        self.inner
            .cleared_at
            .store(Utc::now().timestamp_micros(), Ordering::Release);
        self.inner.debouncer.cancel_all();
        self.inner.inflight.clear();
        self.inner.entries.clear();
        debug!("cache cleared");
    }

    /// Invalidate `key` once `delay` has passed without another call for it.
    pub fn debounced_invalidate(&self, key: &str, delay: Duration) {
        let cache = self.clone();
        let owned = key.to_owned();
        self.inner
            .debouncer
            .schedule(key, delay, move || cache.invalidate(&owned));
    }

    pub fn debounced_invalidate_default(&self, key: &str) {
        self.debounced_invalidate(key, self.inner.settings.debounce_delay);
    }

    /// Cancel running producers and pending invalidations, then wait for the
    /// producer tasks to settle. Later fetches fail with `CacheError::ShutDown`.
    pub async fn shutdown(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.debouncer.cancel_all();
        self.inner.shutdown.cancel();

        let running: Vec<SharedFetch<V>> = self
            .inner
            .inflight
            .iter()
            .map(|f| f.fetch.clone())
            .collect();
        let count = running.len();
        futures::future::join_all(running).await;
        debug!(cancelled = count, "cache shut down");
    }
}

/// Store a successful result and release the in-flight slot, both under the
/// slot's lock so a concurrent `invalidate` either sees the slot (and wins) or
/// runs after the store (and removes it). Returns when the value was stored,
/// or `None` if it was not.
fn finish_fetch<V>(
    inner: &CacheInner<V>,
    key: &str,
    id: u64,
    value: Option<&Arc<V>>,
) -> Option<DateTime<Utc>> {
    match inner.inflight.entry(key.to_owned()) {
        Entry::Occupied(slot) if slot.get().id == id => {
            let stored_at = value.map(|value| {
                inner
                    .entries
                    .insert(key.to_owned(), CacheEntry::fresh(value.clone()));
                Utc::now()
            });
            slot.remove();
            stored_at
        }
        // Invalidated while running; a newer fetch may own the slot now.
        _ => None,
    }
}

/// Mirror a stored value off the fetch path. `stored_at` is taken when the
/// value entered memory; the write is skipped once the entry has moved on.
fn mirror_in_background<V>(
    inner: &Arc<CacheInner<V>>,
    key: &str,
    value: &Arc<V>,
    stored_at: DateTime<Utc>,
) where
    V: Serialize + Send + Sync + 'static,
{
    let Some(mirror) = inner.mirror.clone() else {
        return;
    };
    let data = match serde_json::to_value(value) {
        Ok(data) => data,
        Err(e) => {
            warn!(key, error = %e, "value not serializable, skipping mirror write");
            return;
        }
    };
    let inner = inner.clone();
    let value = value.clone();
    let key = key.to_owned();
    tokio::spawn(async move {
        let current = inner
            .entries
            .get(&key)
            .is_some_and(|entry| Arc::ptr_eq(&entry.value, &value));
        if !current {
            trace!(key = %key, "entry replaced before mirroring, skipping write");
            return;
        }
        let envelope = MirrorEnvelope {
            timestamp: stored_at,
            data,
        };
        if let Err(e) = mirror.put(&key, &envelope).await {
            warn!(key = %key, error = %e, "mirror write failed");
        }
    });
}
