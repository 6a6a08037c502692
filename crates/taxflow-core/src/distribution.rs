//! Distribution executor.
//!
//! Turns a cycle's rewards into transfers. Every transfer is journaled as
//! `Dispatched` before it is sent and resolved right after, so a crash in
//! between leaves a record that startup recovery can hold for reconciliation.
//! Failures are isolated per holder and never abort the pass.

use crate::breaker::CircuitBreaker;
use crate::clock::CyclePosition;
use crate::config::Config;
use crate::error::{Result, TaxflowError, UpstreamError};
use crate::store::{PendingPayout, SettlementRecord, StateStore};
use crate::types::{Amount, Payout};
use crate::upstream::Settlement;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DistributionReport {
    pub sent: usize,
    pub failed: usize,
    pub dropped: usize,
    /// Holders whose reward was parked below the payout minimum.
    pub parked: usize,
    /// Pending payouts skipped because they await reconciliation.
    pub held: usize,
    /// Payouts left queued because this slot's key was already used.
    pub deferred: usize,
    #[serde(with = "crate::types::amount_str")]
    pub distributed: Amount,
    #[serde(with = "crate::types::amount_str")]
    pub accumulated: Amount,
    pub transfer_actions: Vec<String>,
}

pub struct Distributor {
    settlement: Arc<dyn Settlement>,
    breaker: Arc<CircuitBreaker>,
    store: Arc<StateStore>,
    min_payout: Amount,
    max_retries: u32,
    timeout: Duration,
}

impl Distributor {
    pub fn new(
        settlement: Arc<dyn Settlement>,
        breaker: Arc<CircuitBreaker>,
        store: Arc<StateStore>,
        min_payout: Amount,
        max_retries: u32,
        timeout: Duration,
    ) -> Self {
        Self {
            settlement,
            breaker,
            store,
            min_payout,
            max_retries: max_retries.max(1),
            timeout,
        }
    }

    pub fn from_config(
        cfg: &Config,
        settlement: Arc<dyn Settlement>,
        breaker: Arc<CircuitBreaker>,
        store: Arc<StateStore>,
    ) -> Self {
        Self::new(
            settlement,
            breaker,
            store,
            cfg.min_payout_raw(),
            cfg.distribution.max_retries,
            cfg.schedule.call_timeout(),
        )
    }

    /// Fold `rewards` into the queue and pay out everything that is due:
    /// this cycle's rewards plus payouts that failed on earlier cycles.
    ///
    /// Staging is durable before the first transfer, so an error or crash
    /// while paying leaves every reward queued.
    pub async fn distribute(
        &self,
        pos: &CyclePosition,
        rewards: &[Payout],
        now: DateTime<Utc>,
    ) -> Result<DistributionReport> {
        let staged = self.store.stage_rewards(rewards, self.min_payout, now)?;
        let mut report = DistributionReport {
            parked: staged.parked,
            accumulated: staged.accumulated,
            ..Default::default()
        };

        for payout in self.store.pending()? {
            if let Some(key) = &payout.held_by {
                tracing::debug!(holder = %payout.holder, key = %key, "payout held for reconciliation");
                report.held += 1;
                continue;
            }
            self.pay(pos, payout, now, &mut report).await?;
        }

        tracing::info!(
            epoch = %pos.epoch,
            cycle = pos.cycle,
            sent = report.sent,
            failed = report.failed,
            dropped = report.dropped,
            parked = report.parked,
            deferred = report.deferred,
            distributed = %report.distributed,
            "distribution pass complete"
        );
        Ok(report)
    }

    async fn pay(
        &self,
        pos: &CyclePosition,
        mut payout: PendingPayout,
        now: DateTime<Utc>,
        report: &mut DistributionReport,
    ) -> Result<()> {
        let carried = self.store.accumulated(&payout.holder)?;
        let total = payout.amount.saturating_add(carried);
        let record =
            SettlementRecord::dispatched(pos.epoch, pos.cycle, &payout.holder, total, carried, now);
        let key = record.key.clone();

        match self.store.dispatch(&payout, &record) {
            Ok(()) => {}
            // This slot already settled the holder once. The queued amount
            // stays put and goes out under next cycle's key.
            Err(e @ TaxflowError::SettlementState { .. }) => {
                tracing::warn!(
                    holder = %payout.holder,
                    amount = %payout.amount,
                    key = %key,
                    error = %e,
                    "payout deferred to next cycle"
                );
                report.deferred += 1;
                return Ok(());
            }
            Err(e) => return Err(e),
        }

        let sent = self
            .breaker
            .call(self.timeout, self.settlement.transfer(&payout.holder, total, &key))
            .await;

        match sent {
            Ok(action_id) => {
                self.store.confirm(&key, &action_id, now)?;
                tracing::info!(
                    holder = %payout.holder,
                    amount = %total,
                    key = %key,
                    action_id = %action_id,
                    "payout sent"
                );
                report.sent += 1;
                report.distributed = report.distributed.saturating_add(total);
                report.transfer_actions.push(action_id);
            }
            // Not the holder's fault and no transfer was attempted: keep the
            // payout queued without spending a retry.
            Err(e @ (UpstreamError::InsufficientFunds(_) | UpstreamError::CircuitOpen(_))) => {
                let err = match e {
                    UpstreamError::InsufficientFunds(detail) => TaxflowError::InsufficientFunds {
                        holder: payout.holder.clone(),
                        detail,
                    },
                    other => TaxflowError::Upstream(other),
                };
                tracing::warn!(holder = %payout.holder, key = %key, error = %err, "payout deferred");
                payout.last_error = Some(err.to_string());
                self.store.fail(&key, &err.to_string(), &payout, false, now)?;
                report.failed += 1;
            }
            Err(e) => {
                payout.retry_count += 1;
                payout.last_error = Some(e.to_string());
                let drop = payout.retry_count >= self.max_retries;
                self.store.fail(&key, &e.to_string(), &payout, drop, now)?;
                if drop {
                    tracing::error!(
                        holder = %payout.holder,
                        amount = %payout.amount,
                        retries = payout.retry_count,
                        error = %e,
                        "payout dropped after exhausting retries"
                    );
                    report.dropped += 1;
                } else {
                    tracing::warn!(
                        holder = %payout.holder,
                        retry = payout.retry_count,
                        max = self.max_retries,
                        error = %e,
                        "payout failed; will retry next cycle"
                    );
                    report.failed += 1;
                }
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::EpochClock;
    use crate::store::SettlementStatus;
    use crate::upstream::memory::MemoryUpstream;
    use chrono::{Duration as CDur, TimeZone};
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        up: Arc<MemoryUpstream>,
        store: Arc<StateStore>,
        dist: Distributor,
    }

    fn fixture(min_payout: Amount, max_retries: u32) -> Fixture {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(StateStore::open(&dir.path().join("state.db")).unwrap());
        let up = Arc::new(MemoryUpstream::new());
        let breaker = Arc::new(CircuitBreaker::new(
            "rpc",
            100,
            Duration::from_secs(60),
            Duration::from_secs(60),
        ));
        let dist = Distributor::new(
            up.clone(),
            breaker,
            store.clone(),
            min_payout,
            max_retries,
            Duration::from_secs(5),
        );
        Fixture {
            _dir: dir,
            up,
            store,
            dist,
        }
    }

    fn slot(n: i64) -> (CyclePosition, DateTime<Utc>) {
        let at = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap() + CDur::minutes(5 * n);
        (EpochClock::default().position(at), at)
    }

    fn payout(holder: &str, amount: Amount) -> Payout {
        Payout {
            holder: holder.to_string(),
            amount,
        }
    }

    #[tokio::test]
    async fn pays_each_reward_with_idempotency_key() {
        let f = fixture(1, 3);
        let (pos, now) = slot(0);
        let report = f
            .dist
            .distribute(&pos, &[payout("A", 10), payout("B", 30)], now)
            .await
            .unwrap();
        assert_eq!(report.sent, 2);
        assert_eq!(report.distributed, 40);
        let transfers = f.up.transfers();
        assert_eq!(transfers[0].key, format!("{}:{}:A", pos.epoch, pos.cycle));
        assert_eq!(transfers[1].amount, 30);
        assert!(f.store.pending().unwrap().is_empty());
        assert_eq!(f.store.last_paid("A").unwrap(), Some(now));
    }

    #[tokio::test]
    async fn small_reward_accumulates_until_threshold() {
        let f = fixture(100, 3);
        let (pos, now) = slot(0);
        let report = f.dist.distribute(&pos, &[payout("A", 40)], now).await.unwrap();
        assert_eq!(report.sent, 0);
        assert_eq!(report.accumulated, 40);
        assert_eq!(f.store.accumulated("A").unwrap(), 40);
        assert!(f.up.transfers().is_empty());

        let (pos, now) = slot(1);
        f.dist.distribute(&pos, &[payout("A", 50)], now).await.unwrap();
        assert_eq!(f.store.accumulated("A").unwrap(), 90);
        assert!(f.up.transfers().is_empty());

        // 90 carried + 10 new reaches the minimum: one transfer of the total.
        let (pos, now) = slot(2);
        let report = f.dist.distribute(&pos, &[payout("A", 10)], now).await.unwrap();
        assert_eq!(report.sent, 1);
        assert_eq!(f.up.transfers()[0].amount, 100);
        assert_eq!(f.store.accumulated("A").unwrap(), 0);
    }

    #[tokio::test]
    async fn failed_payout_retries_then_drops_after_max() {
        let f = fixture(1, 3);
        f.up.fail_transfers_to("A", UpstreamError::Rejected("bad account".into()));

        let (pos, now) = slot(0);
        let report = f.dist.distribute(&pos, &[payout("A", 10), payout("B", 5)], now).await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.sent, 1, "one holder's failure must not block others");
        assert_eq!(f.store.pending_for("A").unwrap().unwrap().retry_count, 1);

        let (pos, now) = slot(1);
        f.dist.distribute(&pos, &[], now).await.unwrap();
        assert_eq!(f.store.pending_for("A").unwrap().unwrap().retry_count, 2);

        let (pos, now) = slot(2);
        let report = f.dist.distribute(&pos, &[], now).await.unwrap();
        assert_eq!(report.dropped, 1);
        assert!(f.store.pending_for("A").unwrap().is_none());
        let dropped = f.store.dropped(10).unwrap();
        assert_eq!(dropped[0].holder, "A");
        assert_eq!(dropped[0].amount, 10);

        // Nothing left to retry.
        let (pos, now) = slot(3);
        let report = f.dist.distribute(&pos, &[], now).await.unwrap();
        assert_eq!(report, DistributionReport::default());
    }

    #[tokio::test]
    async fn insufficient_funds_keeps_retry_budget() {
        let f = fixture(1, 1);
        f.up.fail_transfers_to("A", UpstreamError::InsufficientFunds("payer empty".into()));
        let (pos, now) = slot(0);
        f.dist.distribute(&pos, &[payout("A", 10)], now).await.unwrap();

        let pending = f.store.pending_for("A").unwrap().unwrap();
        assert_eq!(pending.retry_count, 0);
        assert!(pending.last_error.unwrap().contains("insufficient funds"));

        f.up.clear_transfer_failures("A");
        let (pos, now) = slot(1);
        let report = f.dist.distribute(&pos, &[], now).await.unwrap();
        assert_eq!(report.sent, 1);
        assert_eq!(f.up.transfers()[0].amount, 10);
    }

    #[tokio::test]
    async fn new_reward_merges_into_queued_payout() {
        let f = fixture(1, 5);
        f.up.fail_transfers_to("A", UpstreamError::Unavailable("503".into()));
        let (pos, now) = slot(0);
        f.dist.distribute(&pos, &[payout("A", 10)], now).await.unwrap();

        f.up.clear_transfer_failures("A");
        let (pos, now) = slot(1);
        f.dist.distribute(&pos, &[payout("A", 7)], now).await.unwrap();
        let transfers = f.up.transfers();
        assert_eq!(transfers.len(), 1);
        assert_eq!(transfers[0].amount, 17);
    }

    #[tokio::test]
    async fn held_payout_is_not_sent() {
        let f = fixture(1, 3);
        let (pos, now) = slot(0);
        let mut held = PendingPayout::new("A", 10, now);
        held.held_by = Some("2026-03-01:1:A".to_string());
        f.store.upsert_pending(&held).unwrap();

        let report = f.dist.distribute(&pos, &[payout("A", 4)], now).await.unwrap();
        assert_eq!(report.held, 1);
        assert_eq!(report.parked, 1);
        assert!(f.up.transfers().is_empty());
        assert_eq!(f.store.accumulated("A").unwrap(), 4);
        assert_eq!(f.store.pending_for("A").unwrap().unwrap().amount, 10);
    }

    #[tokio::test]
    async fn second_pass_in_same_slot_defers_instead_of_losing_reward() {
        let f = fixture(1, 3);
        let (pos, now) = slot(0);
        f.dist.distribute(&pos, &[payout("A", 10)], now).await.unwrap();

        let report = f.dist.distribute(&pos, &[payout("A", 7)], now).await.unwrap();
        assert_eq!(report.deferred, 1);
        assert_eq!(report.sent, 0);
        assert_eq!(f.up.transfers().len(), 1);
        let queued = f.store.pending_for("A").unwrap().unwrap();
        assert_eq!(queued.amount, 7);
        assert_eq!(queued.retry_count, 0);

        let (pos, now) = slot(1);
        let report = f.dist.distribute(&pos, &[], now).await.unwrap();
        assert_eq!(report.sent, 1);
        assert_eq!(f.up.transfers()[1].amount, 7);
        assert!(f.store.pending().unwrap().is_empty());
    }

    #[tokio::test]
    async fn settlement_is_journaled() {
        let f = fixture(1, 3);
        f.up.fail_transfers_to("B", UpstreamError::Rejected("no".into()));
        let (pos, now) = slot(0);
        f.dist
            .distribute(&pos, &[payout("A", 1), payout("B", 1)], now)
            .await
            .unwrap();
        let a = f.store.settlement(&SettlementRecord::key_for(pos.epoch, pos.cycle, "A")).unwrap();
        let b = f.store.settlement(&SettlementRecord::key_for(pos.epoch, pos.cycle, "B")).unwrap();
        assert_eq!(a.unwrap().status, SettlementStatus::Confirmed);
        assert_eq!(b.unwrap().status, SettlementStatus::Failed);
    }
}
