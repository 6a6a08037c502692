//! Cycle outcome records.
//!
//! A `CycleResult` is written once when a cycle reaches a terminal state and
//! is never modified afterwards.

use crate::clock::CyclePosition;
use crate::eligibility::EligibilitySummary;
use crate::harvest::BatchOutcome;
use crate::types::Amount;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// CycleState
// ---------------------------------------------------------------------------

/// Terminal state of one cycle.
///
/// Transitions: `Idle → Running → Distributed | RolledOver | Failed → Idle`.
/// Only the terminal states are ever recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CycleState {
    Distributed,
    RolledOver,
    Failed,
}

impl CycleState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Distributed => "DISTRIBUTED",
            Self::RolledOver => "ROLLED_OVER",
            Self::Failed => "FAILED",
        }
    }

    /// Whether this outcome consumes the slot. Failed cycles are retried on
    /// the next tick.
    pub fn consumes_slot(self) -> bool {
        !matches!(self, Self::Failed)
    }
}

impl fmt::Display for CycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// CycleResult
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleResult {
    pub id: Uuid,
    pub epoch: NaiveDate,
    pub cycle: u32,
    pub slot_start: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub state: CycleState,
    /// Withheld tax observed before harvesting.
    #[serde(with = "crate::types::amount_str")]
    pub tax_observed: Amount,
    /// Tax actually converted this cycle.
    #[serde(with = "crate::types::amount_str")]
    pub harvested: Amount,
    /// Settlement asset received from the swaps.
    #[serde(with = "crate::types::amount_str")]
    pub swapped_out: Amount,
    /// Holder share of this cycle's proceeds plus anything carried in.
    #[serde(with = "crate::types::amount_str")]
    pub distributable: Amount,
    /// Proceeds an earlier failed cycle converted but never distributed.
    #[serde(default, with = "crate::types::amount_str")]
    pub carried_in: Amount,
    /// Settlement asset confirmed transferred, including retried payouts.
    #[serde(with = "crate::types::amount_str")]
    pub distributed: Amount,
    /// Rewards parked in holder accumulators below the payout minimum.
    #[serde(with = "crate::types::amount_str")]
    pub accumulated: Amount,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price_usd: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eligibility: Option<EligibilitySummary>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub batches: Vec<BatchOutcome>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub transfer_actions: Vec<String>,
    #[serde(default)]
    pub payouts_sent: usize,
    #[serde(default)]
    pub payouts_failed: usize,
    #[serde(default)]
    pub payouts_dropped: usize,
    /// Why a cycle rolled over, or which harvest batch stopped early.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CycleResult {
    /// Empty result for `pos`; the scheduler fills in amounts as the cycle
    /// progresses and sets the terminal state last.
    pub fn begin(pos: &CyclePosition, started_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            epoch: pos.epoch,
            cycle: pos.cycle,
            slot_start: pos.slot_start,
            started_at,
            finished_at: started_at,
            state: CycleState::Failed,
            tax_observed: 0,
            harvested: 0,
            swapped_out: 0,
            distributable: 0,
            carried_in: 0,
            distributed: 0,
            accumulated: 0,
            price_usd: None,
            eligibility: None,
            batches: Vec::new(),
            transfer_actions: Vec::new(),
            payouts_sent: 0,
            payouts_failed: 0,
            payouts_dropped: 0,
            note: None,
            error: None,
        }
    }

    pub fn finish(mut self, state: CycleState, at: DateTime<Utc>) -> Self {
        self.state = state;
        self.finished_at = at;
        self
    }

    pub fn fail(mut self, error: impl fmt::Display, at: DateTime<Utc>) -> Self {
        self.error = Some(error.to_string());
        self.finish(CycleState::Failed, at)
    }

    pub fn swap_actions(&self) -> Vec<&str> {
        self.batches
            .iter()
            .filter_map(|b| b.action_id.as_deref())
            .collect()
    }

    pub fn summary(&self) -> CycleSummary {
        CycleSummary {
            epoch: self.epoch,
            cycle: self.cycle,
            state: self.state,
            finished_at: self.finished_at,
            harvested: self.harvested,
            distributed: self.distributed,
            payouts_sent: self.payouts_sent,
            payouts_failed: self.payouts_failed,
            note: self.note.clone().or_else(|| self.error.clone()),
        }
    }
}

/// Compact view of a `CycleResult` for status output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleSummary {
    pub epoch: NaiveDate,
    pub cycle: u32,
    pub state: CycleState,
    pub finished_at: DateTime<Utc>,
    #[serde(with = "crate::types::amount_str")]
    pub harvested: Amount,
    #[serde(with = "crate::types::amount_str")]
    pub distributed: Amount,
    pub payouts_sent: usize,
    pub payouts_failed: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}
