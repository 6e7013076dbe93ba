//! Computation Cache
//!
//! Process-local, TTL and capacity bounded cache of serialized analysis payloads
//! with single-flight deduplication.
//!
//! - Entries live in an `IndexMap` ordered by recency: a hit moves the entry to
//!   the back, eviction takes from the front.
//! - Expired entries are treated as absent on lookup and removed by a periodic sweep.
//! - Concurrent misses on one fingerprint share a single computation. The first
//!   caller (the leader) spawns it; everybody else waits on a `watch` channel,
//!   bounded by the computation timeout. The computation runs detached, so a
//!   caller going away or timing out never cancels it.
//! - Failures reach every waiter and are never stored.
//!
//! The cache is never authoritative. Dropping it loses nothing the result store
//! cannot rebuild.

pub mod fingerprint;

pub use fingerprint::{CanonicalParams, Fingerprint};

use crate::config::CacheConfig;
use crate::error::AnalysisError;
use crate::models::CacheStats;
use indexmap::IndexMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Serialized payload, shared between the cache and every caller it is handed to.
pub type Payload = Arc<str>;

type Outcome = Result<Payload, AnalysisError>;

struct CacheEntry {
    payload: Payload,
    created_at: Instant,
    last_access: Instant,
    hit_count: u64,
}

impl CacheEntry {
    fn new(payload: Payload) -> Self {
        let now = Instant::now();
        Self {
            payload,
            created_at: now,
            last_access: now,
            hit_count: 0,
        }
    }

    fn is_expired(&self, ttl: Duration, now: Instant) -> bool {
        now.duration_since(self.created_at) >= ttl
    }

    fn touch(&mut self, now: Instant) {
        self.last_access = now;
        self.hit_count = self.hit_count.saturating_add(1);
    }
}

struct Inner {
    entries: Mutex<IndexMap<Fingerprint, CacheEntry>>,
    in_flight: Mutex<HashMap<Fingerprint, watch::Receiver<Option<Outcome>>>>,
    max_size: usize,
    ttl: Duration,
    compute_timeout: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl Inner {
    /// Insert a finished payload, evicting least-recently-used entries past capacity.
    fn store(&self, fingerprint: Fingerprint, payload: Payload) {
        let mut entries = self.entries.lock();
        entries.shift_remove(&fingerprint);
        entries.insert(fingerprint, CacheEntry::new(payload));

        while entries.len() > self.max_size {
            let Some(victim) = lru_index(&entries) else {
                break;
            };
            if let Some((evicted, _)) = entries.shift_remove_index(victim) {
                debug!(fingerprint = evicted.short(), "Evicted cache entry (capacity)");
            }
        }
    }
}

/// Front of the recency order. Among entries last touched at the same instant,
/// the one created first.
fn lru_index(entries: &IndexMap<Fingerprint, CacheEntry>) -> Option<usize> {
    let (_, front) = entries.get_index(0)?;
    let mut best = 0;
    let mut best_created = front.created_at;
    for (idx, (_, entry)) in entries.iter().enumerate().skip(1) {
        if entry.last_access != front.last_access {
            break;
        }
        if entry.created_at < best_created {
            best = idx;
            best_created = entry.created_at;
        }
    }
    Some(best)
}

/// Clears the in-flight slot when the computation task ends, including by panic.
struct InFlightGuard {
    inner: Arc<Inner>,
    fingerprint: Fingerprint,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.inner.in_flight.lock().remove(&self.fingerprint);
    }
}

enum Role {
    Leader(watch::Sender<Option<Outcome>>),
    Follower(watch::Receiver<Option<Outcome>>),
}

#[derive(Clone)]
pub struct ComputationCache {
    inner: Arc<Inner>,
}

impl ComputationCache {
    pub fn new(config: &CacheConfig) -> Self {
        Self::with_limits(config.max_size, config.ttl(), config.computation_timeout())
    }

    pub fn with_limits(max_size: usize, ttl: Duration, compute_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                entries: Mutex::new(IndexMap::new()),
                in_flight: Mutex::new(HashMap::new()),
                max_size: max_size.max(1),
                ttl,
                compute_timeout,
                hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
            }),
        }
    }

    /// Return the cached payload for `fingerprint`, or compute it exactly once
    /// across all concurrent callers.
    ///
    /// The boolean is `true` only when the payload came straight out of the cache.
    /// `compute` is only called by the leader; its future runs as a detached task.
    pub async fn get_or_compute<F, Fut>(
        &self,
        fingerprint: &Fingerprint,
        compute: F,
    ) -> Result<(Payload, bool), AnalysisError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<String, AnalysisError>> + Send + 'static,
    {
        let role = {
            let mut entries = self.inner.entries.lock();
            let now = Instant::now();

            if let Some(mut entry) = entries.shift_remove(fingerprint) {
                if entry.is_expired(self.inner.ttl, now) {
                    debug!(fingerprint = fingerprint.short(), "Cache entry expired");
                } else {
                    entry.touch(now);
                    let payload = entry.payload.clone();
                    entries.insert(fingerprint.clone(), entry);
                    self.inner.hits.fetch_add(1, Ordering::Relaxed);
                    return Ok((payload, true));
                }
            }

            self.inner.misses.fetch_add(1, Ordering::Relaxed);

            let mut in_flight = self.inner.in_flight.lock();
            match in_flight.get(fingerprint) {
                Some(rx) => Role::Follower(rx.clone()),
                None => {
                    let (tx, rx) = watch::channel(None);
                    in_flight.insert(fingerprint.clone(), rx);
                    Role::Leader(tx)
                }
            }
        };

        match role {
            Role::Leader(tx) => {
                let rx = tx.subscribe();
                self.spawn_computation(fingerprint.clone(), tx, compute());
                wait_outcome(rx).await.map(|payload| (payload, false))
            }
            Role::Follower(rx) => {
                debug!(
                    fingerprint = fingerprint.short(),
                    "Waiting on in-flight computation"
                );
                match tokio::time::timeout(self.inner.compute_timeout, wait_outcome(rx)).await {
                    Ok(outcome) => outcome.map(|payload| (payload, false)),
                    Err(_) => {
                        warn!(
                            fingerprint = fingerprint.short(),
                            waited_secs = self.inner.compute_timeout.as_secs_f64(),
                            "Gave up waiting on in-flight computation"
                        );
                        Err(AnalysisError::ComputationTimeout {
                            fingerprint: fingerprint.to_string(),
                            waited: self.inner.compute_timeout,
                        })
                    }
                }
            }
        }
    }

    fn spawn_computation<Fut>(
        &self,
        fingerprint: Fingerprint,
        tx: watch::Sender<Option<Outcome>>,
        computation: Fut,
    ) where
        Fut: Future<Output = Result<String, AnalysisError>> + Send + 'static,
    {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let guard = InFlightGuard {
                inner: inner.clone(),
                fingerprint: fingerprint.clone(),
            };
            let outcome: Outcome = computation.await.map(Payload::from);

            match &outcome {
                // Stored before the in-flight slot clears, so no caller sees neither.
                Ok(payload) => inner.store(fingerprint.clone(), payload.clone()),
                Err(e) => debug!(
                    fingerprint = fingerprint.short(),
                    error = %e,
                    "Computation failed, not caching"
                ),
            }
            drop(guard);
            let _ = tx.send(Some(outcome));
        });
    }

    /// Drop one entry. Returns whether it was present.
    pub fn invalidate(&self, fingerprint: &Fingerprint) -> bool {
        self.inner.entries.lock().shift_remove(fingerprint).is_some()
    }

    /// Times the live entry for `fingerprint` has been served from cache.
    pub fn entry_hits(&self, fingerprint: &Fingerprint) -> Option<u64> {
        self.inner.entries.lock().get(fingerprint).map(|entry| entry.hit_count)
    }

    /// Drop every entry. Counters are kept.
    pub fn clear(&self) -> usize {
        let mut entries = self.inner.entries.lock();
        let removed = entries.len();
        entries.clear();
        info!("Cleared {} cache entries", removed);
        removed
    }

    /// Remove every expired entry.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let ttl = self.inner.ttl;
        let mut entries = self.inner.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(ttl, now));
        before - entries.len()
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.inner.hits.load(Ordering::Relaxed);
        let misses = self.inner.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;
        CacheStats {
            cache_size: self.inner.entries.lock().len(),
            max_size: self.inner.max_size,
            hit_count: hits,
            miss_count: misses,
            hit_rate: if lookups == 0 {
                0.0
            } else {
                hits as f64 / lookups as f64
            },
            ttl_seconds: self.inner.ttl.as_secs(),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Periodically purge expired entries. Stops once the cache is dropped.
    pub fn spawn_sweeper(&self, every: Duration) -> JoinHandle<()> {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let cache = ComputationCache { inner };
                let purged = cache.purge_expired();
                if purged > 0 {
                    debug!("Cache sweep removed {} expired entries", purged);
                }
            }
        })
    }

    #[cfg(test)]
    pub(crate) fn insert_raw(&self, fingerprint: Fingerprint, payload: &str) {
        self.inner.store(fingerprint, Payload::from(payload));
    }
}

async fn wait_outcome(mut rx: watch::Receiver<Option<Outcome>>) -> Outcome {
    let received = rx.wait_for(|v| v.is_some()).await.map(|v| (*v).clone());
    match received {
        Ok(Some(outcome)) => outcome,
        Ok(None) | Err(_) => Err(AnalysisError::ComputationError(
            "computation ended without producing a result".to_string(),
        )),
    }
}

// =============================================================================
// TESTS
// =============================================================================
