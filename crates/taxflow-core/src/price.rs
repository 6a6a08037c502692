use crate::breaker::CircuitBreaker;
use crate::cache::CachedFetch;
use crate::config::CacheConfig;
use crate::error::UpstreamError;
use crate::upstream::PriceSource;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// One price reading, used unchanged for every comparison within a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceSnapshot {
    /// USD per whole project token.
    pub usd: f64,
    pub observed_at: DateTime<Utc>,
}

impl PriceSnapshot {
    pub fn new(usd: f64) -> Self {
        Self {
            usd,
            observed_at: Utc::now(),
        }
    }

    /// USD value of `raw` units at this price.
    pub fn value_of(&self, raw: crate::types::Amount, decimals: u8) -> f64 {
        crate::types::to_ui(raw, decimals) * self.usd
    }
}

pub struct PriceOracle {
    source: Arc<dyn PriceSource>,
    breaker: Arc<CircuitBreaker>,
    cache: CachedFetch<PriceSnapshot>,
    timeout: Duration,
}

impl PriceOracle {
    pub fn new(
        source: Arc<dyn PriceSource>,
        breaker: Arc<CircuitBreaker>,
        cache: &CacheConfig,
        timeout: Duration,
    ) -> Self {
        Self {
            source,
            breaker,
            cache: CachedFetch::new(
                "price",
                Duration::from_secs(cache.price_ttl_secs),
                Duration::from_secs(cache.price_max_age_secs),
            ),
            timeout,
        }
    }

    /// Take the snapshot a cycle will use for all of its comparisons.
    pub async fn snapshot(&self) -> Result<PriceSnapshot, UpstreamError> {
        let source = Arc::clone(&self.source);
        let breaker = Arc::clone(&self.breaker);
        let timeout = self.timeout;
        self.cache
            .get_or_fetch(move || async move {
                let usd = breaker.call(timeout, source.fetch_price()).await?;
                tracing::debug!(usd, "price refreshed");
                Ok(PriceSnapshot::new(usd))
            })
            .await
    }

    pub fn cached(&self) -> Option<PriceSnapshot> {
        self.cache.get_stale()
    }

    pub fn cache(&self) -> &CachedFetch<PriceSnapshot> {
        &self.cache
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::memory::MemoryUpstream;

    fn oracle(up: Arc<MemoryUpstream>, threshold: u32) -> PriceOracle {
        let breaker = Arc::new(CircuitBreaker::new(
            "price",
            threshold,
            Duration::from_secs(60),
            Duration::from_secs(300),
        ));
        PriceOracle::new(up, breaker, &CacheConfig::default(), Duration::from_secs(5))
    }

    #[test]
    fn value_of_uses_decimals() {
        let p = PriceSnapshot::new(2.0);
        assert!((p.value_of(1_500_000, 6) - 3.0).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_snapshots_share_one_fetch() {
        let up = Arc::new(MemoryUpstream::new().with_price(0.5));
        up.set_latency(Duration::from_millis(200));
        let oracle = Arc::new(oracle(up.clone(), 5));

        let a = tokio::spawn({
            let o = oracle.clone();
            async move { o.snapshot().await }
        });
        let b = tokio::spawn({
            let o = oracle.clone();
            async move { o.snapshot().await }
        });
        assert_eq!(a.await.unwrap().unwrap().usd, 0.5);
        assert_eq!(b.await.unwrap().unwrap().usd, 0.5);
        assert_eq!(up.price_fetches(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn open_breaker_fails_fast_without_calling_upstream() {
        let up = Arc::new(MemoryUpstream::new());
        up.fail_price(Some(UpstreamError::RateLimited("429".into())));
        let oracle = oracle(up.clone(), 1);

        assert!(oracle.snapshot().await.is_err());
        assert_eq!(up.price_fetches(), 1);

        let err = oracle.snapshot().await.unwrap_err();
        assert!(matches!(err, UpstreamError::CircuitOpen(_)));
        assert_eq!(up.price_fetches(), 1);
    }
}
