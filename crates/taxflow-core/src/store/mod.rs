//! Durable scheduler and payout state.
//!
//! Provides the persisted records (`PendingPayout`, `SettlementRecord`,
//! `DroppedPayout`, `SchedulerState`) and `StateStore`, the redb file that
//! holds them together with the append-only cycle history.

pub mod db;
pub mod records;

pub use db::{StagedRewards, StateStore, StoreTotals};
pub use records::{
    DroppedPayout, PendingPayout, Resolution, SchedulerState, SettlementRecord, SettlementStatus,
};
