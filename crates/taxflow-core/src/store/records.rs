//! Records persisted by [`StateStore`](super::StateStore).

use crate::cycle::CycleState;
use crate::types::Amount;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// SchedulerState
// ---------------------------------------------------------------------------

/// What the scheduler needs to resume exactly where it stopped.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchedulerState {
    /// Finish time of the last cycle that consumed its slot.
    #[serde(default)]
    pub last_run_at: Option<DateTime<Utc>>,
    /// Slot start of that cycle.
    #[serde(default)]
    pub last_slot_at: Option<DateTime<Utc>>,
    /// Start time of that cycle. The next run waits for both the following
    /// slot and one full interval after this instant.
    #[serde(default)]
    pub last_run_started_at: Option<DateTime<Utc>>,
    /// Last attempt of any outcome, including failures.
    #[serde(default)]
    pub last_attempt_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_state: Option<CycleState>,
    #[serde(default)]
    pub cycles_recorded: u64,
}

// ---------------------------------------------------------------------------
// PendingPayout
// ---------------------------------------------------------------------------

/// A reward owed to one holder that has not been confirmed paid.
///
/// The retry counter lives here and nowhere else.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingPayout {
    pub holder: String,
    /// Owed amount, excluding anything parked in the holder's accumulator.
    #[serde(with = "crate::types::amount_str")]
    pub amount: Amount,
    pub queued_at: DateTime<Utc>,
    #[serde(default)]
    pub retry_count: u32,
    /// Set while an unreconciled settlement may already have paid this
    /// entry; held payouts are never sent automatically.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub held_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl PendingPayout {
    pub fn new(holder: impl Into<String>, amount: Amount, queued_at: DateTime<Utc>) -> Self {
        Self {
            holder: holder.into(),
            amount,
            queued_at,
            retry_count: 0,
            held_by: None,
            last_error: None,
        }
    }

    pub fn is_held(&self) -> bool {
        self.held_by.is_some()
    }
}

// ---------------------------------------------------------------------------
// SettlementRecord
// ---------------------------------------------------------------------------

/// Lifecycle of one transfer attempt.
///
/// Transitions: `Dispatched → Confirmed | Failed`, and after a restart
/// `Dispatched → Unreconciled → Confirmed | Failed` via operator
/// reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettlementStatus {
    /// Written before the transfer is sent.
    Dispatched,
    Confirmed,
    Failed,
    /// Found `Dispatched` on startup: the process died with the transfer in
    /// flight, so whether it landed is unknown.
    Unreconciled,
}

impl SettlementStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Dispatched => "dispatched",
            Self::Confirmed => "confirmed",
            Self::Failed => "failed",
            Self::Unreconciled => "unreconciled",
        }
    }
}

impl fmt::Display for SettlementStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One settlement action, keyed by `"{epoch}:{cycle}:{holder}"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementRecord {
    pub key: String,
    pub epoch: NaiveDate,
    pub cycle: u32,
    pub holder: String,
    /// Total sent: queued amount plus accumulator at dispatch time.
    #[serde(with = "crate::types::amount_str")]
    pub amount: Amount,
    /// Part of `amount` taken from the holder's accumulator.
    #[serde(default, with = "crate::types::amount_str")]
    pub from_accumulator: Amount,
    pub status: SettlementStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub reconciled: bool,
    pub dispatched_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SettlementRecord {
    pub fn key_for(epoch: NaiveDate, cycle: u32, holder: &str) -> String {
        format!("{epoch}:{cycle}:{holder}")
    }

    pub fn dispatched(
        epoch: NaiveDate,
        cycle: u32,
        holder: &str,
        amount: Amount,
        from_accumulator: Amount,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            key: Self::key_for(epoch, cycle, holder),
            epoch,
            cycle,
            holder: holder.to_string(),
            amount,
            from_accumulator,
            status: SettlementStatus::Dispatched,
            action_id: None,
            error: None,
            reconciled: false,
            dispatched_at: at,
            updated_at: at,
        }
    }
}

/// Operator decision for an `Unreconciled` settlement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    /// The transfer landed on the ledger: settle the payout.
    Paid,
    /// The transfer never landed: release the payout for the next pass.
    Retry,
}

// ---------------------------------------------------------------------------
// DroppedPayout
// ---------------------------------------------------------------------------

/// Audit entry for a payout removed from the queue after exhausting retries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DroppedPayout {
    pub holder: String,
    #[serde(with = "crate::types::amount_str")]
    pub amount: Amount,
    pub retry_count: u32,
    pub queued_at: DateTime<Utc>,
    pub dropped_at: DateTime<Utc>,
    pub last_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl DroppedPayout {
    pub fn from_pending(p: &PendingPayout, last_key: &str, at: DateTime<Utc>) -> Self {
        Self {
            holder: p.holder.clone(),
            amount: p.amount,
            retry_count: p.retry_count,
            queued_at: p.queued_at,
            dropped_at: at,
            last_key: last_key.to_string(),
            last_error: p.last_error.clone(),
        }
    }
}
