//! Cycle/epoch scheduler.
//!
//! One `Scheduler` owns everything a cycle touches: the holder and price
//! caches, both circuit breakers, the state store and the policies. A tick
//! runs harvest → rewards → distribution → record for the current slot, at
//! most once per slot and never concurrently with another tick.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use futures::FutureExt;
use serde::Serialize;
use tracing::Instrument;

use crate::breaker::{BreakerState, CircuitBreaker};
use crate::clock::{CyclePosition, EpochClock};
use crate::config::Config;
use crate::cycle::{CycleResult, CycleState, CycleSummary};
use crate::distribution::Distributor;
use crate::eligibility::{classify, summarize, EligibilityRules};
use crate::error::{Result, TaxflowError};
use crate::harvest::{self, HarvestDecision, HarvestExecution, HarvestPolicy};
use crate::holders::HolderDirectory;
use crate::price::PriceOracle;
use crate::reward::compute_rewards;
use crate::store::{SchedulerState, StateStore};
use crate::types::{mul_div, Amount};
use crate::upstream::{Swapper, TaxVault, Upstreams};

/// Wait past each slot boundary before ticking, so a timer that fires a
/// little early still lands inside the new slot.
const SLOT_GRACE: Duration = Duration::from_secs(1);

/// Margin past the instant a too-soon tick was told to come back.
const RETRY_GRACE: Duration = Duration::from_millis(50);

const BPS_DENOMINATOR: u128 = 10_000;

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SkipReason {
    /// Another tick holds the running flag.
    AlreadyRunning,
    /// The last recorded run is less than one slot or one interval ago.
    TooSoon { next_at: DateTime<Utc> },
}

#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    Skipped(SkipReason),
    Completed(CycleResult),
}

impl TickOutcome {
    pub fn result(&self) -> Option<&CycleResult> {
        match self {
            Self::Completed(r) => Some(r),
            Self::Skipped(_) => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BreakerStatus {
    pub name: String,
    pub state: BreakerState,
}

/// Point-in-time view for status readers.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub now: DateTime<Utc>,
    pub epoch: NaiveDate,
    pub cycle: u32,
    pub cycles_per_epoch: u32,
    pub interval_secs: u64,
    pub is_running: bool,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub next_run_at: DateTime<Utc>,
    pub last_result: Option<CycleSummary>,
    pub cycles_recorded: u64,
    pub pending_count: usize,
    #[serde(with = "crate::types::amount_str")]
    pub pending_amount: Amount,
    pub held_count: usize,
    #[serde(with = "crate::types::amount_str")]
    pub accumulated_amount: Amount,
    #[serde(with = "crate::types::amount_str")]
    pub carried_proceeds: Amount,
    pub unreconciled: usize,
    pub breakers: Vec<BreakerStatus>,
    pub cached_holders: Option<usize>,
    pub cached_price_usd: Option<f64>,
}

// ---------------------------------------------------------------------------
// Running flag
// ---------------------------------------------------------------------------

/// Holds the running flag for one tick; clears it on drop, including when
/// the tick unwinds or its future is dropped.
struct RunGuard<'a>(&'a AtomicBool);

impl<'a> RunGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

pub struct Scheduler {
    clock: EpochClock,
    store: Arc<StateStore>,
    holders: HolderDirectory,
    prices: PriceOracle,
    vault: Arc<dyn TaxVault>,
    swapper: Arc<dyn Swapper>,
    distributor: Distributor,
    policy: HarvestPolicy,
    rules: EligibilityRules,
    holder_share_bps: u16,
    rpc: Arc<CircuitBreaker>,
    price_breaker: Arc<CircuitBreaker>,
    timeout: Duration,
    running: AtomicBool,
}

impl Scheduler {
    /// Wire a scheduler. Fails on any `Error`-level config finding; this is
    /// the only place configuration errors surface.
    pub fn new(config: &Config, store: Arc<StateStore>, upstreams: Upstreams) -> Result<Self> {
        config.ensure_valid()?;
        let timeout = config.schedule.call_timeout();
        let rpc = Arc::new(CircuitBreaker::from_config("rpc", &config.breaker));
        let price_breaker = Arc::new(CircuitBreaker::from_config("price", &config.breaker));

        Ok(Self {
            clock: EpochClock::new(config.schedule.interval_secs, config.schedule.cycles_per_epoch),
            holders: HolderDirectory::new(upstreams.holders, rpc.clone(), &config.cache, timeout),
            prices: PriceOracle::new(upstreams.price, price_breaker.clone(), &config.cache, timeout),
            vault: upstreams.vault,
            swapper: upstreams.swapper,
            distributor: Distributor::from_config(
                config,
                upstreams.settlement,
                rpc.clone(),
                store.clone(),
            ),
            policy: HarvestPolicy::from_config(config),
            rules: EligibilityRules::from_config(&config.distribution),
            holder_share_bps: config.distribution.holder_share_bps,
            store,
            rpc,
            price_breaker,
            timeout,
            running: AtomicBool::new(false),
        })
    }

    /// Open the store next to `config_path` and talk to the configured HTTP
    /// endpoints.
    pub fn from_config(config: &Config, config_path: &Path) -> Result<Self> {
        let store = Arc::new(StateStore::open(&config.store_path(config_path))?);
        Self::new(config, store, Upstreams::from_config(&config.upstream))
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    pub fn clock(&self) -> &EpochClock {
        &self.clock
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn position(&self) -> CyclePosition {
        self.clock.position(Utc::now())
    }

    /// Hold settlements left in flight by a previous process. Call once at
    /// startup, before the first tick.
    pub fn recover(&self) -> Result<u32> {
        let n = self.store.startup_recovery()?;
        if n > 0 {
            tracing::warn!(
                count = n,
                "settlements need reconciliation (taxflow payouts unreconciled)"
            );
        }
        Ok(n)
    }

    pub async fn tick(&self) -> Result<TickOutcome> {
        self.tick_at(Utc::now()).await
    }

    /// Run the cycle for the slot containing `now`, unless a tick is already
    /// running or the last recorded run is too recent.
    pub async fn tick_at(&self, now: DateTime<Utc>) -> Result<TickOutcome> {
        let Some(_guard) = RunGuard::acquire(&self.running) else {
            tracing::info!("tick skipped: a cycle is already running");
            return Ok(TickOutcome::Skipped(SkipReason::AlreadyRunning));
        };

        let pos = self.clock.position(now);
        let mut state = self.store.scheduler_state()?;
        if let Some(next_at) = self.earliest_next_run(&state) {
            if now < next_at {
                tracing::debug!(%pos, %next_at, "tick skipped: last run too recent");
                return Ok(TickOutcome::Skipped(SkipReason::TooSoon { next_at }));
            }
        }

        tracing::info!(epoch = %pos.epoch, cycle = pos.cycle, "cycle started");
        let span = tracing::info_span!("cycle", epoch = %pos.epoch, cycle = pos.cycle);
        let started = tokio::time::Instant::now();
        // Both are filled as the cycle goes, and survive an error or a panic.
        let mut result = CycleResult::begin(&pos, now);
        let mut progress = HarvestExecution::default();
        let outcome = AssertUnwindSafe(
            self.execute(&pos, now, &mut result, &mut progress)
                .instrument(span),
        )
        .catch_unwind()
        .await;
        let finished_at =
            now + chrono::Duration::from_std(started.elapsed()).unwrap_or_else(|_| chrono::Duration::zero());

        result.harvested = progress.converted_in;
        result.swapped_out = progress.amount_out;
        result.batches = progress.outcomes;

        let result = match outcome {
            Ok(Ok(cycle_state)) => result.finish(cycle_state, finished_at),
            Ok(Err(e)) => {
                tracing::error!(epoch = %pos.epoch, cycle = pos.cycle, error = %e, "cycle failed");
                self.carry_unstaged(&result);
                result.fail(e, finished_at)
            }
            Err(panic) => {
                let e = TaxflowError::Panicked(panic_message(panic.as_ref()));
                tracing::error!(epoch = %pos.epoch, cycle = pos.cycle, error = %e, "cycle failed");
                self.carry_unstaged(&result);
                result.fail(e, finished_at)
            }
        };

        state.last_attempt_at = Some(finished_at);
        state.last_state = Some(result.state);
        state.cycles_recorded += 1;
        if result.state.consumes_slot() {
            state.last_run_at = Some(finished_at);
            state.last_slot_at = Some(pos.slot_start);
            state.last_run_started_at = Some(now);
        }
        self.store.commit_cycle(&result, &state)?;

        tracing::info!(
            epoch = %pos.epoch,
            cycle = pos.cycle,
            state = %result.state,
            harvested = %result.harvested,
            distributed = %result.distributed,
            "cycle recorded"
        );
        Ok(TickOutcome::Completed(result))
    }

    /// The slot after the last run's, and at least one interval after that
    /// run started. `None` before the first run.
    fn earliest_next_run(&self, state: &SchedulerState) -> Option<DateTime<Utc>> {
        let interval = self.clock.interval();
        let by_slot = state.last_slot_at.map(|t| t + interval);
        let by_start = state.last_run_started_at.map(|t| t + interval);
        by_slot.max(by_start)
    }

    fn holder_share(&self, proceeds: Amount) -> Amount {
        mul_div(proceeds, self.holder_share_bps as u128, BPS_DENOMINATOR)
    }

    /// A failed cycle that converted tax but never got as far as carrying
    /// the proceeds leaves them to the next distribution.
    fn carry_unstaged(&self, result: &CycleResult) {
        if result.swapped_out == 0 || result.distributable > 0 {
            return;
        }
        let share = self.holder_share(result.swapped_out);
        match self.store.add_carried_proceeds(share) {
            Ok(total) => tracing::warn!(
                amount = %share,
                carried = %total,
                "undistributed proceeds carried to the next cycle"
            ),
            Err(e) => tracing::error!(
                amount = %share,
                error = %e,
                "undistributed proceeds could not be carried"
            ),
        }
    }

    async fn execute(
        &self,
        pos: &CyclePosition,
        now: DateTime<Utc>,
        result: &mut CycleResult,
        progress: &mut HarvestExecution,
    ) -> Result<CycleState> {
        // One holder list and one price for every comparison in this cycle.
        let holders = self.holders.holders().await?;
        let price = self.prices.snapshot().await?;
        result.price_usd = Some(price.usd);

        let classified = classify(&holders, &price, &self.rules);
        let summary = summarize(&classified);
        result.eligibility = Some(summary);
        if summary.eligible == 0 {
            tracing::info!(holders = holders.len(), "rolling over: no eligible holders");
            result.note = Some(TaxflowError::NoEligibleHolders.to_string());
            return Ok(CycleState::RolledOver);
        }

        let tax = self
            .rpc
            .call(self.timeout, self.vault.accumulated_tax())
            .await?;
        result.tax_observed = tax;

        let decision = self.policy.plan(tax, &price);
        if let HarvestDecision::RollOver { reason } = &decision {
            tracing::info!(tax = %tax, reason = %reason, "rolling over");
            result.note = Some(reason.clone());
            return Ok(CycleState::RolledOver);
        }

        let key_prefix = format!("{}:{}", pos.epoch, pos.cycle);
        harvest::execute(
            self.swapper.as_ref(),
            &self.rpc,
            self.timeout,
            decision.batches(),
            &key_prefix,
            progress,
        )
        .await?;
        if let Some(partial) = &progress.partial {
            result.note = Some(partial.to_string());
        }

        // From here the proceeds are owed to holders; persist them first.
        let share = self.holder_share(progress.amount_out);
        let distributable = self.store.add_carried_proceeds(share)?;
        result.distributable = distributable;
        result.carried_in = distributable.saturating_sub(share);

        let plan = compute_rewards(&classified, distributable);
        tracing::debug!(
            payouts = plan.payouts.len(),
            total = %plan.total,
            dust = %plan.dust,
            carried_in = %result.carried_in,
            "rewards computed"
        );

        let report = self.distributor.distribute(pos, &plan.payouts, now).await?;
        result.distributed = report.distributed;
        result.accumulated = report.accumulated;
        result.transfer_actions = report.transfer_actions;
        result.payouts_sent = report.sent;
        result.payouts_failed = report.failed + report.deferred;
        result.payouts_dropped = report.dropped;
        Ok(CycleState::Distributed)
    }

    /// Tick at every slot boundary until `shutdown` resolves. A cycle in
    /// progress always finishes before shutdown is observed.
    ///
    /// When a tick is refused as too soon, the next one is timed for the
    /// moment the spacing allows rather than the next boundary.
    pub async fn run_forever<F>(&self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        tracing::info!(
            interval_secs = self.clock.interval_std().as_secs(),
            cycles_per_epoch = self.clock.cycles_per_epoch(),
            "scheduler started"
        );
        loop {
            let outcome = self.tick_logged().await;
            let now = Utc::now();
            let wait = match outcome {
                Some(TickOutcome::Skipped(SkipReason::TooSoon { next_at })) if next_at > now => {
                    (next_at - now).to_std().unwrap_or(Duration::ZERO) + RETRY_GRACE
                }
                _ => self.clock.until_next_slot(now) + SLOT_GRACE,
            };
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("scheduler stopping");
                    break;
                }
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    async fn tick_logged(&self) -> Option<TickOutcome> {
        match self.tick().await {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                tracing::error!(error = %e, "tick could not be recorded");
                None
            }
        }
    }

    pub fn status(&self) -> Result<StatusSnapshot> {
        self.status_at(Utc::now())
    }

    pub fn status_at(&self, now: DateTime<Utc>) -> Result<StatusSnapshot> {
        let pos = self.clock.position(now);
        let state = self.store.scheduler_state()?;
        let totals = self.store.totals()?;
        let last_result = self.store.last_cycle()?.map(|r| r.summary());
        let next_slot = self.clock.next_slot(now);

        Ok(StatusSnapshot {
            now,
            epoch: pos.epoch,
            cycle: pos.cycle,
            cycles_per_epoch: self.clock.cycles_per_epoch(),
            interval_secs: self.clock.interval_std().as_secs(),
            is_running: self.is_running(),
            last_run_at: state.last_run_at,
            last_attempt_at: state.last_attempt_at,
            next_run_at: self
                .earliest_next_run(&state)
                .map_or(next_slot, |t| t.max(next_slot)),
            last_result,
            cycles_recorded: state.cycles_recorded,
            pending_count: totals.pending_count,
            pending_amount: totals.pending_amount,
            held_count: totals.held_count,
            accumulated_amount: totals.accumulated_amount,
            carried_proceeds: totals.carried_proceeds,
            unreconciled: totals.unreconciled,
            breakers: [&self.rpc, &self.price_breaker]
                .into_iter()
                .map(|b| BreakerStatus {
                    name: b.name().to_string(),
                    state: b.state(),
                })
                .collect(),
            cached_holders: self.holders.cached().map(|h| h.len()),
            cached_price_usd: self.prices.cached().map(|p| p.usd),
        })
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
