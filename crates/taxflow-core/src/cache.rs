//! Single-value cache shared by every external-data adapter.
//!
//! Entries are *fresh* until `ttl`, *stale* until `max_age`, then expired.
//! `get_or_fetch` serves fresh values directly, serves stale values while a
//! background refresh runs, and blocks only when nothing usable is cached.
//! Concurrent callers share one upstream fetch.

use crate::error::UpstreamError;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

type SharedFetch<T> = Shared<BoxFuture<'static, Result<T, UpstreamError>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    Fresh,
    Stale,
    Expired,
    Empty,
}

struct Entry<T> {
    value: T,
    stored_at: Instant,
}

struct Slot<T> {
    entry: Option<Entry<T>>,
    inflight: Option<SharedFetch<T>>,
}

pub struct CachedFetch<T> {
    name: String,
    ttl: Duration,
    max_age: Duration,
    slot: Arc<Mutex<Slot<T>>>,
}

impl<T> Clone for CachedFetch<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            ttl: self.ttl,
            max_age: self.max_age,
            slot: Arc::clone(&self.slot),
        }
    }
}

fn lock<T>(m: &Mutex<Slot<T>>) -> MutexGuard<'_, Slot<T>> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl<T> CachedFetch<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// `max_age` below `ttl` is raised to `ttl`.
    pub fn new(name: impl Into<String>, ttl: Duration, max_age: Duration) -> Self {
        Self {
            name: name.into(),
            ttl,
            max_age: max_age.max(ttl),
            slot: Arc::new(Mutex::new(Slot {
                entry: None,
                inflight: None,
            })),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn classify(&self, entry: Option<&Entry<T>>) -> Freshness {
        match entry {
            None => Freshness::Empty,
            Some(e) => {
                let age = e.stored_at.elapsed();
                if age < self.ttl {
                    Freshness::Fresh
                } else if age < self.max_age {
                    Freshness::Stale
                } else {
                    Freshness::Expired
                }
            }
        }
    }

    pub fn freshness(&self) -> Freshness {
        let slot = lock(&self.slot);
        self.classify(slot.entry.as_ref())
    }

    /// Value only if still inside its TTL.
    pub fn get(&self) -> Option<T> {
        let slot = lock(&self.slot);
        match self.classify(slot.entry.as_ref()) {
            Freshness::Fresh => slot.entry.as_ref().map(|e| e.value.clone()),
            _ => None,
        }
    }

    /// Value if fresh or stale, `None` once past the hard expiry.
    pub fn get_stale(&self) -> Option<T> {
        let slot = lock(&self.slot);
        match self.classify(slot.entry.as_ref()) {
            Freshness::Fresh | Freshness::Stale => slot.entry.as_ref().map(|e| e.value.clone()),
            _ => None,
        }
    }

    pub fn set(&self, value: T) {
        let mut slot = lock(&self.slot);
        slot.entry = Some(Entry {
            value,
            stored_at: Instant::now(),
        });
    }

    /// `true` when there is no value inside its TTL.
    pub fn is_stale(&self) -> bool {
        !matches!(self.freshness(), Freshness::Fresh)
    }

    pub fn invalidate(&self) {
        lock(&self.slot).entry = None;
    }

    pub fn age(&self) -> Option<Duration> {
        lock(&self.slot)
            .entry
            .as_ref()
            .map(|e| e.stored_at.elapsed())
    }

    pub fn is_fetching(&self) -> bool {
        lock(&self.slot).inflight.is_some()
    }

    /// Return a usable value, fetching through `fetch` when needed.
    ///
    /// `fetch` is invoked at most once per call and only when no fetch for
    /// this cache is already in flight.
    pub async fn get_or_fetch<F, Fut>(&self, fetch: F) -> Result<T, UpstreamError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, UpstreamError>> + Send + 'static,
    {
        let waiter = {
            let mut slot = lock(&self.slot);
            match self.classify(slot.entry.as_ref()) {
                Freshness::Fresh => {
                    if let Some(e) = slot.entry.as_ref() {
                        return Ok(e.value.clone());
                    }
                    None
                }
                Freshness::Stale => {
                    if slot.inflight.is_none() {
                        tracing::debug!(cache = %self.name, "serving stale value, refreshing in background");
                        let shared = self.start_fetch(&mut slot, fetch());
                        tokio::spawn(shared);
                    }
                    if let Some(e) = slot.entry.as_ref() {
                        return Ok(e.value.clone());
                    }
                    None
                }
                Freshness::Expired | Freshness::Empty => match slot.inflight.clone() {
                    Some(shared) => Some(shared),
                    None => {
                        let shared = self.start_fetch(&mut slot, fetch());
                        tokio::spawn(shared.clone());
                        Some(shared)
                    }
                },
            }
        };

        let Some(shared) = waiter else {
            return Err(UpstreamError::Unavailable(format!(
                "cache '{}' lost its entry",
                self.name
            )));
        };

        match shared.await {
            Ok(v) => Ok(v),
            Err(e) => {
                if let Some(v) = self.get_stale() {
                    tracing::warn!(cache = %self.name, error = %e, "fetch failed, serving cached value");
                    Ok(v)
                } else {
                    Err(e)
                }
            }
        }
    }

    /// Install an in-flight fetch that stores its result and clears itself.
    fn start_fetch<Fut>(&self, slot: &mut Slot<T>, fut: Fut) -> SharedFetch<T>
    where
        Fut: Future<Output = Result<T, UpstreamError>> + Send + 'static,
    {
        let cell = Arc::clone(&self.slot);
        let name = self.name.clone();
        let shared = async move {
            let result = fut.await;
            let mut slot = lock(&cell);
            match &result {
                Ok(v) => {
                    slot.entry = Some(Entry {
                        value: v.clone(),
                        stored_at: Instant::now(),
                    });
                }
                Err(e) => tracing::debug!(cache = %name, error = %e, "fetch failed"),
            }
            slot.inflight = None;
            result
        }
        .boxed()
        .shared();
        slot.inflight = Some(shared.clone());
        shared
    }
}
