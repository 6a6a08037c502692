use crate::breaker::CircuitBreaker;
use crate::cache::CachedFetch;
use crate::config::CacheConfig;
use crate::error::UpstreamError;
use crate::types::Holder;
use crate::upstream::HolderSource;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Current holder set, refreshed wholesale from the upstream indexer.
///
/// Reads go through a [`CachedFetch`], so the scheduler and any status reader
/// share one upstream request and a rate-limited indexer degrades to the
/// last good snapshot instead of failing the caller.
pub struct HolderDirectory {
    source: Arc<dyn HolderSource>,
    breaker: Arc<CircuitBreaker>,
    cache: CachedFetch<Arc<Vec<Holder>>>,
    timeout: Duration,
}

impl HolderDirectory {
    pub fn new(
        source: Arc<dyn HolderSource>,
        breaker: Arc<CircuitBreaker>,
        cache: &CacheConfig,
        timeout: Duration,
    ) -> Self {
        Self {
            source,
            breaker,
            cache: CachedFetch::new(
                "holders",
                Duration::from_secs(cache.holders_ttl_secs),
                Duration::from_secs(cache.holders_max_age_secs),
            ),
            timeout,
        }
    }

    pub async fn holders(&self) -> Result<Arc<Vec<Holder>>, UpstreamError> {
        let source = Arc::clone(&self.source);
        let breaker = Arc::clone(&self.breaker);
        let timeout = self.timeout;
        self.cache
            .get_or_fetch(move || async move {
                let raw = breaker.call(timeout, source.fetch_holders()).await?;
                let holders = normalize(raw);
                tracing::debug!(count = holders.len(), "holder directory refreshed");
                Ok(Arc::new(holders))
            })
            .await
    }

    /// Last snapshot inside its hard expiry, without touching the upstream.
    pub fn cached(&self) -> Option<Arc<Vec<Holder>>> {
        self.cache.get_stale()
    }

    pub fn cache(&self) -> &CachedFetch<Arc<Vec<Holder>>> {
        &self.cache
    }
}

/// Merge duplicate addresses (one owner, several token accounts), drop empty
/// balances and order by address.
fn normalize(raw: Vec<Holder>) -> Vec<Holder> {
    let mut merged: BTreeMap<String, Holder> = BTreeMap::new();
    for h in raw {
        if h.raw_balance == 0 {
            continue;
        }
        merged
            .entry(h.address.clone())
            .and_modify(|existing| {
                existing.raw_balance = existing.raw_balance.saturating_add(h.raw_balance)
            })
            .or_insert(h);
    }
    merged.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::memory::MemoryUpstream;

    fn directory(up: Arc<MemoryUpstream>) -> HolderDirectory {
        let breaker = Arc::new(CircuitBreaker::new(
            "rpc",
            2,
            Duration::from_secs(60),
            Duration::from_secs(60),
        ));
        HolderDirectory::new(up, breaker, &CacheConfig::default(), Duration::from_secs(5))
    }

    #[test]
    fn normalize_merges_duplicates_and_drops_zero() {
        let out = normalize(vec![
            Holder::new("B", 5, 6),
            Holder::new("A", 1, 6),
            Holder::new("B", 7, 6),
            Holder::new("C", 0, 6),
        ]);
        assert_eq!(out, vec![Holder::new("A", 1, 6), Holder::new("B", 12, 6)]);
    }

    #[tokio::test(start_paused = true)]
    async fn second_read_is_served_from_cache() {
        let up = Arc::new(MemoryUpstream::new().with_holders(vec![Holder::new("A", 10, 0)]));
        let dir = directory(up.clone());
        assert_eq!(dir.holders().await.unwrap().len(), 1);
        assert_eq!(dir.holders().await.unwrap().len(), 1);
        assert_eq!(up.holder_fetches(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_refresh_falls_back_to_cache() {
        let up = Arc::new(MemoryUpstream::new().with_holders(vec![Holder::new("A", 10, 0)]));
        let dir = directory(up.clone());
        dir.holders().await.unwrap();

        // Push the entry past TTL but inside max age, then break the upstream.
        tokio::time::advance(Duration::from_secs(CacheConfig::default().holders_ttl_secs + 1))
            .await;
        up.fail_holders(Some(UpstreamError::RateLimited("429".into())));
        let holders = dir.holders().await.unwrap();
        assert_eq!(holders[0].address, "A");
    }

    #[tokio::test(start_paused = true)]
    async fn empty_cache_and_failing_upstream_is_an_error() {
        let up = Arc::new(MemoryUpstream::new());
        up.fail_holders(Some(UpstreamError::RateLimited("429".into())));
        let dir = directory(up);
        let err = dir.holders().await.unwrap_err();
        assert!(err.is_transient());
    }
}
