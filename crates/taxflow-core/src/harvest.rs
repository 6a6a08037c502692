//! Tax harvest policy and batch execution.
//!
//! [`HarvestPolicy::plan`] is a pure decision over the withheld amount and one
//! price snapshot. [`execute`] runs the resulting batches strictly one after
//! another, sleeping between them, and never rolls back a batch that already
//! converted.

use crate::breaker::CircuitBreaker;
use crate::config::{Config, ThresholdMode};
use crate::error::{Result, TaxflowError};
use crate::price::PriceSnapshot;
use crate::types::Amount;
use crate::upstream::Swapper;
use serde::{Deserialize, Serialize};
use std::time::Duration;

// ---------------------------------------------------------------------------
// Decision
// ---------------------------------------------------------------------------

/// One swap to perform. `delay_before` is zero for the first batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HarvestBatch {
    pub index: usize,
    #[serde(with = "crate::types::amount_str")]
    pub amount: Amount,
    #[serde(with = "duration_secs")]
    pub delay_before: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub enum HarvestDecision {
    /// Below the minimum; the withheld tax carries forward untouched.
    RollOver { reason: String },
    Single(HarvestBatch),
    Batched(Vec<HarvestBatch>),
}

impl HarvestDecision {
    pub fn batches(&self) -> &[HarvestBatch] {
        match self {
            Self::RollOver { .. } => &[],
            Self::Single(b) => std::slice::from_ref(b),
            Self::Batched(bs) => bs,
        }
    }

    pub fn total(&self) -> Amount {
        self.batches().iter().map(|b| b.amount).sum()
    }
}

#[derive(Debug, Clone)]
pub struct HarvestPolicy {
    pub mode: ThresholdMode,
    pub min_raw: Amount,
    pub max_raw: Amount,
    pub min_usd: f64,
    pub max_usd: f64,
    pub batch_count: u32,
    pub batch_delay: Duration,
    pub token_decimals: u8,
}

impl HarvestPolicy {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            mode: cfg.harvest.threshold_mode,
            min_raw: cfg.min_harvest_raw(),
            max_raw: cfg.max_harvest_raw(),
            min_usd: cfg.harvest.min_usd,
            max_usd: cfg.harvest.max_usd,
            batch_count: cfg.harvest.batch_count.max(1),
            batch_delay: cfg.batch_delay(),
            token_decimals: cfg.token.decimals,
        }
    }

    /// Decide what to do with `accumulated` raw units of withheld tax.
    ///
    /// Both comparisons of one decision use the configured mode: token mode
    /// never looks at the price, USD mode never looks at the token caps.
    pub fn plan(&self, accumulated: Amount, price: &PriceSnapshot) -> HarvestDecision {
        if accumulated == 0 {
            return HarvestDecision::RollOver {
                reason: "no withheld tax".to_string(),
            };
        }

        let over_cap = match self.mode {
            ThresholdMode::Token => {
                if accumulated < self.min_raw {
                    return HarvestDecision::RollOver {
                        reason: format!("{accumulated} below token minimum {}", self.min_raw),
                    };
                }
                accumulated > self.max_raw
            }
            ThresholdMode::Usd => {
                let value = price.value_of(accumulated, self.token_decimals);
                if value < self.min_usd {
                    return HarvestDecision::RollOver {
                        reason: format!("${value:.2} below USD minimum ${:.2}", self.min_usd),
                    };
                }
                value > self.max_usd
            }
        };

        if over_cap && self.batch_count > 1 {
            HarvestDecision::Batched(split(accumulated, self.batch_count, self.batch_delay))
        } else {
            HarvestDecision::Single(HarvestBatch {
                index: 0,
                amount: accumulated,
                delay_before: Duration::ZERO,
            })
        }
    }
}

/// Equal shares with the integer remainder on the last batch, so the batches
/// always sum to `amount`.
fn split(amount: Amount, count: u32, delay: Duration) -> Vec<HarvestBatch> {
    let n = count as Amount;
    let share = amount / n;
    let remainder = amount % n;
    (0..count as usize)
        .map(|index| HarvestBatch {
            index,
            amount: if index + 1 == count as usize {
                share + remainder
            } else {
                share
            },
            delay_before: if index == 0 { Duration::ZERO } else { delay },
        })
        .filter(|b| b.amount > 0)
        .collect()
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchOutcome {
    pub index: usize,
    #[serde(with = "crate::types::amount_str")]
    pub amount_in: Amount,
    #[serde(with = "crate::types::amount_str")]
    pub amount_out: Amount,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl BatchOutcome {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Default)]
pub struct HarvestExecution {
    pub outcomes: Vec<BatchOutcome>,
    /// Tax actually converted.
    pub converted_in: Amount,
    /// Settlement asset received.
    pub amount_out: Amount,
    /// Set when a later batch failed after at least one succeeded.
    pub partial: Option<TaxflowError>,
}

impl HarvestExecution {
    pub fn action_ids(&self) -> Vec<String> {
        self.outcomes
            .iter()
            .filter_map(|o| o.action_id.clone())
            .collect()
    }
}

/// Swap each batch in order. Batches after a failure are not attempted; their
/// tax stays withheld for the next cycle.
///
/// Progress is written into `exec` batch by batch, so a caller still sees
/// what was converted if this future errors, panics or is dropped. Fails
/// only when the first batch fails, i.e. nothing was converted.
pub async fn execute(
    swapper: &dyn Swapper,
    breaker: &CircuitBreaker,
    timeout: Duration,
    batches: &[HarvestBatch],
    key_prefix: &str,
    exec: &mut HarvestExecution,
) -> Result<()> {
    let total = batches.len();

    for batch in batches {
        if !batch.delay_before.is_zero() {
            tracing::debug!(
                batch = batch.index,
                delay_secs = batch.delay_before.as_secs(),
                "waiting before next harvest batch"
            );
            tokio::time::sleep(batch.delay_before).await;
        }

        let key = format!("{key_prefix}:swap:{}", batch.index);
        match breaker.call(timeout, swapper.swap(batch.amount, &key)).await {
            Ok(receipt) => {
                tracing::info!(
                    batch = batch.index,
                    amount_in = %batch.amount,
                    amount_out = %receipt.amount_out,
                    action_id = %receipt.action_id,
                    "harvest batch converted"
                );
                exec.converted_in += batch.amount;
                exec.amount_out += receipt.amount_out;
                exec.outcomes.push(BatchOutcome {
                    index: batch.index,
                    amount_in: batch.amount,
                    amount_out: receipt.amount_out,
                    action_id: Some(receipt.action_id),
                    error: None,
                });
            }
            Err(e) => {
                exec.outcomes.push(BatchOutcome {
                    index: batch.index,
                    amount_in: batch.amount,
                    amount_out: 0,
                    action_id: None,
                    error: Some(e.to_string()),
                });
                let completed = exec.outcomes.iter().filter(|o| o.succeeded()).count();
                if completed == 0 {
                    return Err(TaxflowError::Upstream(e));
                }
                tracing::warn!(
                    completed,
                    total,
                    converted = %exec.converted_in,
                    error = %e,
                    "harvest stopped partway; proceeding with converted amount"
                );
                exec.partial = Some(TaxflowError::PartialBatchFailure {
                    completed,
                    total,
                    reason: e.to_string(),
                });
                break;
            }
        }
    }
    Ok(())
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::UpstreamError;
    use crate::upstream::memory::MemoryUpstream;

    fn token_policy(min: Amount, max: Amount, batches: u32) -> HarvestPolicy {
        HarvestPolicy {
            mode: ThresholdMode::Token,
            min_raw: min,
            max_raw: max,
            min_usd: 0.0,
            max_usd: 0.0,
            batch_count: batches,
            batch_delay: Duration::from_secs(10),
            token_decimals: 0,
        }
    }

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new("rpc", 5, Duration::from_secs(60), Duration::from_secs(60))
    }

    #[test]
    fn below_minimum_rolls_over() {
        let d = token_policy(5, 100, 4).plan(4, &PriceSnapshot::new(1.0));
        assert!(matches!(d, HarvestDecision::RollOver { .. }));
        assert!(d.batches().is_empty());
    }

    #[test]
    fn within_cap_is_single_batch() {
        let d = token_policy(5, 100, 4).plan(100, &PriceSnapshot::new(1.0));
        match d {
            HarvestDecision::Single(b) => assert_eq!(b.amount, 100),
            other => panic!("expected Single, got {other:?}"),
        }
    }

    #[test]
    fn over_cap_splits_into_equal_batches() {
        let d = token_policy(5_000, 12_000, 4).plan(50_000, &PriceSnapshot::new(1.0));
        let batches = d.batches();
        assert_eq!(batches.len(), 4);
        assert!(batches.iter().all(|b| b.amount == 12_500));
        assert_eq!(batches[0].delay_before, Duration::ZERO);
        assert!(batches[1..]
            .iter()
            .all(|b| b.delay_before == Duration::from_secs(10)));
        assert_eq!(d.total(), 50_000);
    }

    #[test]
    fn remainder_lands_on_last_batch() {
        let d = token_policy(1, 10, 4).plan(103, &PriceSnapshot::new(1.0));
        let amounts: Vec<Amount> = d.batches().iter().map(|b| b.amount).collect();
        assert_eq!(amounts, vec![25, 25, 25, 28]);
    }

    #[test]
    fn usd_mode_compares_value_not_count() {
        let policy = HarvestPolicy {
            mode: ThresholdMode::Usd,
            min_raw: 1_000_000,
            max_raw: 1_000_000,
            min_usd: 5.0,
            max_usd: 50.0,
            batch_count: 2,
            batch_delay: Duration::from_secs(20),
            token_decimals: 0,
        };
        // 10 tokens is far under the token minimum but worth $10.
        let d = policy.plan(10, &PriceSnapshot::new(1.0));
        assert!(matches!(d, HarvestDecision::Single(_)));
        // Same count at a lower price rolls over.
        let d = policy.plan(10, &PriceSnapshot::new(0.1));
        assert!(matches!(d, HarvestDecision::RollOver { .. }));
        // Worth $100, over the USD cap.
        let d = policy.plan(100, &PriceSnapshot::new(1.0));
        assert_eq!(d.batches().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn batches_run_sequentially_with_delay() {
        let up = MemoryUpstream::new().with_tax(50_000);
        let plan = token_policy(5_000, 12_000, 4).plan(50_000, &PriceSnapshot::new(1.0));

        let started = tokio::time::Instant::now();
        let mut exec = HarvestExecution::default();
        execute(&up, &breaker(), Duration::from_secs(5), plan.batches(), "e:1", &mut exec)
            .await
            .unwrap();

        assert_eq!(started.elapsed(), Duration::from_secs(30));
        assert_eq!(exec.converted_in, 50_000);
        assert!(exec.partial.is_none());
        let keys: Vec<String> = up.swaps().into_iter().map(|s| s.key).collect();
        assert_eq!(keys, vec!["e:1:swap:0", "e:1:swap:1", "e:1:swap:2", "e:1:swap:3"]);
        assert_eq!(up.tax(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn later_batch_failure_keeps_converted_part() {
        let up = MemoryUpstream::new().with_tax(40_000);
        up.fail_swaps_from(2, UpstreamError::Unavailable("dex down".into()));
        let plan = token_policy(1, 10_000, 4).plan(40_000, &PriceSnapshot::new(1.0));

        let mut exec = HarvestExecution::default();
        execute(&up, &breaker(), Duration::from_secs(5), plan.batches(), "k", &mut exec)
            .await
            .unwrap();

        assert_eq!(exec.converted_in, 20_000);
        assert_eq!(exec.outcomes.len(), 3);
        assert!(matches!(
            exec.partial,
            Some(TaxflowError::PartialBatchFailure {
                completed: 2,
                total: 4,
                ..
            })
        ));
        // Unconverted tax is still withheld for the next cycle.
        assert_eq!(up.tax(), 20_000);
        assert_eq!(exec.action_ids().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn first_batch_failure_is_an_error() {
        let up = MemoryUpstream::new().with_tax(100);
        up.fail_swaps_from(0, UpstreamError::Timeout(10));
        let plan = token_policy(1, 1_000, 1).plan(100, &PriceSnapshot::new(1.0));
        let mut exec = HarvestExecution::default();
        let err = execute(&up, &breaker(), Duration::from_secs(5), plan.batches(), "k", &mut exec)
            .await
            .unwrap_err();
        assert!(matches!(err, TaxflowError::Upstream(UpstreamError::Timeout(_))));
        assert_eq!(exec.outcomes.len(), 1);
        assert_eq!(exec.amount_out, 0);
        assert_eq!(up.tax(), 100);
    }
}
