//! redb-backed state store.
//!
//! # Table design
//!
//! Every table maps `&[u8]` keys to `&[u8]` values. Values are JSON except in
//! `accumulated` and the `carry` entry in `meta`, which hold a 16-byte
//! big-endian `u128`.
//!
//! ```text
//! meta         "scheduler"                          -> SchedulerState
//! meta         "carry"                              -> u128
//! pending      holder address                       -> PendingPayout
//! accumulated  holder address                       -> u128
//! last_paid    holder address                       -> DateTime<Utc>
//! cycles       [ finished_ms: u64 BE | uuid: 16 ]   -> CycleResult
//! settlements  "{epoch}:{cycle}:{holder}"            -> SettlementRecord
//! dropped      [ dropped_ms: u64 BE | uuid: 16 ]    -> DroppedPayout
//! ```
//!
//! The time-prefixed keys make byte order equal time order, so history reads
//! are a reverse range scan with no sorting. Each public mutating method is a
//! single write transaction.

use std::fmt;
use std::path::Path;

use chrono::{DateTime, Utc};
use redb::{Database, ReadTransaction, ReadableTable, Table, TableDefinition, WriteTransaction};
use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

use crate::cycle::CycleResult;
use crate::error::{Result, TaxflowError};
use crate::types::{Amount, Payout};

use super::records::{
    DroppedPayout, PendingPayout, Resolution, SchedulerState, SettlementRecord, SettlementStatus,
};

// ---------------------------------------------------------------------------
// Table definitions
// ---------------------------------------------------------------------------

type Bytes = &'static [u8];

const META: TableDefinition<Bytes, Bytes> = TableDefinition::new("meta");
const PENDING: TableDefinition<Bytes, Bytes> = TableDefinition::new("pending");
const ACCUMULATED: TableDefinition<Bytes, Bytes> = TableDefinition::new("accumulated");
const LAST_PAID: TableDefinition<Bytes, Bytes> = TableDefinition::new("last_paid");
const CYCLES: TableDefinition<Bytes, Bytes> = TableDefinition::new("cycles");
const SETTLEMENTS: TableDefinition<Bytes, Bytes> = TableDefinition::new("settlements");
const DROPPED: TableDefinition<Bytes, Bytes> = TableDefinition::new("dropped");

const SCHEDULER_KEY: &[u8] = b"scheduler";
const CARRY_KEY: &str = "carry";

// ---------------------------------------------------------------------------
// Encoding helpers
// ---------------------------------------------------------------------------

fn store_err(e: impl fmt::Display) -> TaxflowError {
    TaxflowError::Store(e.to_string())
}

fn time_key(ts: DateTime<Utc>, id: Uuid) -> [u8; 24] {
    let mut key = [0u8; 24];
    let ms = ts.timestamp_millis().max(0) as u64;
    key[..8].copy_from_slice(&ms.to_be_bytes());
    key[8..].copy_from_slice(id.as_bytes());
    key
}

fn get_json<T: DeserializeOwned>(
    table: &impl ReadableTable<Bytes, Bytes>,
    key: &[u8],
) -> Result<Option<T>> {
    match table.get(key).map_err(store_err)? {
        Some(v) => Ok(Some(serde_json::from_slice(v.value()).map_err(store_err)?)),
        None => Ok(None),
    }
}

fn put_json<T: Serialize>(table: &mut Table<'_, Bytes, Bytes>, key: &[u8], value: &T) -> Result<()> {
    let bytes = serde_json::to_vec(value)?;
    table.insert(key, bytes.as_slice()).map_err(store_err)?;
    Ok(())
}

fn scan_json<T: DeserializeOwned>(table: &impl ReadableTable<Bytes, Bytes>) -> Result<Vec<T>> {
    let mut out = Vec::new();
    for entry in table.iter().map_err(store_err)? {
        let (_, v) = entry.map_err(store_err)?;
        out.push(serde_json::from_slice(v.value()).map_err(store_err)?);
    }
    Ok(out)
}

/// Newest first, at most `limit` entries.
fn scan_json_rev<T: DeserializeOwned>(
    table: &impl ReadableTable<Bytes, Bytes>,
    limit: usize,
) -> Result<Vec<T>> {
    let mut out = Vec::new();
    for entry in table.iter().map_err(store_err)?.rev().take(limit) {
        let (_, v) = entry.map_err(store_err)?;
        out.push(serde_json::from_slice(v.value()).map_err(store_err)?);
    }
    Ok(out)
}

fn decode_amount(bytes: &[u8]) -> Result<Amount> {
    let arr: [u8; 16] = bytes
        .try_into()
        .map_err(|_| TaxflowError::Store(format!("corrupt amount ({} bytes)", bytes.len())))?;
    Ok(u128::from_be_bytes(arr))
}

fn get_amount(table: &impl ReadableTable<Bytes, Bytes>, holder: &str) -> Result<Amount> {
    match table.get(holder.as_bytes()).map_err(store_err)? {
        Some(v) => decode_amount(v.value()),
        None => Ok(0),
    }
}

/// Zero removes the entry.
fn put_amount(table: &mut Table<'_, Bytes, Bytes>, holder: &str, amount: Amount) -> Result<()> {
    if amount == 0 {
        table.remove(holder.as_bytes()).map_err(store_err)?;
    } else {
        let bytes = amount.to_be_bytes();
        table
            .insert(holder.as_bytes(), bytes.as_slice())
            .map_err(store_err)?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// StoreTotals
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreTotals {
    pub pending_count: usize,
    #[serde(with = "crate::types::amount_str")]
    pub pending_amount: Amount,
    pub held_count: usize,
    pub accumulated_holders: usize,
    #[serde(with = "crate::types::amount_str")]
    pub accumulated_amount: Amount,
    pub unreconciled: usize,
    #[serde(with = "crate::types::amount_str")]
    pub carried_proceeds: Amount,
}

/// What [`StateStore::stage_rewards`] did with rewards that were not queued.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StagedRewards {
    pub queued: usize,
    pub parked: usize,
    pub accumulated: Amount,
}

// ---------------------------------------------------------------------------
// StateStore
// ---------------------------------------------------------------------------

pub struct StateStore {
    db: Database,
}

impl StateStore {
    /// Open or create the database at `path`, creating every table so later
    /// read transactions never see a missing one.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(dir) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }
        let db = Database::create(path).map_err(store_err)?;
        let wt = db.begin_write().map_err(store_err)?;
        for def in [META, PENDING, ACCUMULATED, LAST_PAID, CYCLES, SETTLEMENTS, DROPPED] {
            wt.open_table(def).map_err(store_err)?;
        }
        wt.commit().map_err(store_err)?;
        Ok(Self { db })
    }

    fn read<R>(&self, f: impl FnOnce(&ReadTransaction) -> Result<R>) -> Result<R> {
        let rt = self.db.begin_read().map_err(store_err)?;
        f(&rt)
    }

    /// Run `f` in one write transaction. An error from `f` aborts it.
    fn write<R>(&self, f: impl FnOnce(&WriteTransaction) -> Result<R>) -> Result<R> {
        let wt = self.db.begin_write().map_err(store_err)?;
        let out = f(&wt)?;
        wt.commit().map_err(store_err)?;
        Ok(out)
    }

    // -----------------------------------------------------------------------
    // Scheduler state and cycle history
    // -----------------------------------------------------------------------

    pub fn scheduler_state(&self) -> Result<SchedulerState> {
        self.read(|rt| {
            let table = rt.open_table(META).map_err(store_err)?;
            Ok(get_json::<SchedulerState>(&table, SCHEDULER_KEY)?.unwrap_or_default())
        })
    }

    pub fn save_scheduler_state(&self, state: &SchedulerState) -> Result<()> {
        self.write(|wt| {
            let mut table = wt.open_table(META).map_err(store_err)?;
            put_json(&mut table, SCHEDULER_KEY, state)
        })
    }

    /// Append `result` to history and store `state`, atomically.
    pub fn commit_cycle(&self, result: &CycleResult, state: &SchedulerState) -> Result<()> {
        let key = time_key(result.finished_at, result.id);
        self.write(|wt| {
            let mut cycles = wt.open_table(CYCLES).map_err(store_err)?;
            put_json(&mut cycles, key.as_slice(), result)?;
            let mut meta = wt.open_table(META).map_err(store_err)?;
            put_json(&mut meta, SCHEDULER_KEY, state)
        })
    }

    /// Most recent cycles, newest first.
    pub fn recent_cycles(&self, limit: usize) -> Result<Vec<CycleResult>> {
        self.read(|rt| {
            let table = rt.open_table(CYCLES).map_err(store_err)?;
            scan_json_rev(&table, limit)
        })
    }

    pub fn last_cycle(&self) -> Result<Option<CycleResult>> {
        Ok(self.recent_cycles(1)?.into_iter().next())
    }

    // -----------------------------------------------------------------------
    // Pending queue and accumulators
    // -----------------------------------------------------------------------

    /// Pending payouts ordered by holder address.
    pub fn pending(&self) -> Result<Vec<PendingPayout>> {
        self.read(|rt| {
            let table = rt.open_table(PENDING).map_err(store_err)?;
            scan_json(&table)
        })
    }

    pub fn pending_for(&self, holder: &str) -> Result<Option<PendingPayout>> {
        self.read(|rt| {
            let table = rt.open_table(PENDING).map_err(store_err)?;
            get_json(&table, holder.as_bytes())
        })
    }

    pub fn upsert_pending(&self, payout: &PendingPayout) -> Result<()> {
        self.write(|wt| {
            let mut table = wt.open_table(PENDING).map_err(store_err)?;
            put_json(&mut table, payout.holder.as_bytes(), payout)
        })
    }

    pub fn accumulated(&self, holder: &str) -> Result<Amount> {
        self.read(|rt| {
            let table = rt.open_table(ACCUMULATED).map_err(store_err)?;
            get_amount(&table, holder)
        })
    }

    /// Every non-zero accumulator, ordered by holder address.
    pub fn accumulated_all(&self) -> Result<Vec<(String, Amount)>> {
        self.read(|rt| {
            let table = rt.open_table(ACCUMULATED).map_err(store_err)?;
            let mut out = Vec::new();
            for entry in table.iter().map_err(store_err)? {
                let (k, v) = entry.map_err(store_err)?;
                let holder = String::from_utf8_lossy(k.value()).into_owned();
                out.push((holder, decode_amount(v.value())?));
            }
            Ok(out)
        })
    }

    /// Add `amount` to the holder's accumulator and return the new total.
    pub fn add_accumulated(&self, holder: &str, amount: Amount) -> Result<Amount> {
        self.write(|wt| {
            let mut table = wt.open_table(ACCUMULATED).map_err(store_err)?;
            let total = get_amount(&table, holder)?.saturating_add(amount);
            put_amount(&mut table, holder, total)?;
            Ok(total)
        })
    }

    /// Fold a cycle's rewards into the queue, in one transaction that also
    /// clears the carried proceeds they were computed from.
    ///
    /// A reward joins the holder's queued payout when there is one. When that
    /// payout is held for reconciliation, or when the reward plus the
    /// holder's accumulator stays under `min_payout`, it is parked in the
    /// accumulator instead.
    pub fn stage_rewards(
        &self,
        rewards: &[Payout],
        min_payout: Amount,
        now: DateTime<Utc>,
    ) -> Result<StagedRewards> {
        self.write(|wt| {
            let mut pending = wt.open_table(PENDING).map_err(store_err)?;
            let mut acc = wt.open_table(ACCUMULATED).map_err(store_err)?;
            let mut staged = StagedRewards::default();

            for reward in rewards {
                let key = reward.holder.as_bytes();
                let carried = get_amount(&acc, &reward.holder)?;
                let park = match get_json::<PendingPayout>(&pending, key)? {
                    // A held entry may already be paid; never grow it.
                    Some(p) if p.is_held() => true,
                    Some(mut p) => {
                        p.amount = p.amount.saturating_add(reward.amount);
                        put_json(&mut pending, key, &p)?;
                        false
                    }
                    None if reward.amount.saturating_add(carried) < min_payout => true,
                    None => {
                        let p = PendingPayout::new(&reward.holder, reward.amount, now);
                        put_json(&mut pending, key, &p)?;
                        false
                    }
                };
                if park {
                    let total = carried.saturating_add(reward.amount);
                    put_amount(&mut acc, &reward.holder, total)?;
                    tracing::debug!(
                        holder = %reward.holder,
                        amount = %reward.amount,
                        accumulated = %total,
                        "reward parked in accumulator"
                    );
                    staged.parked += 1;
                    staged.accumulated = staged.accumulated.saturating_add(reward.amount);
                } else {
                    staged.queued += 1;
                }
            }

            let mut meta = wt.open_table(META).map_err(store_err)?;
            put_amount(&mut meta, CARRY_KEY, 0)?;
            Ok(staged)
        })
    }

    // -----------------------------------------------------------------------
    // Carried proceeds
    // -----------------------------------------------------------------------

    /// Holder share of swap proceeds converted by a cycle that never staged
    /// them as rewards. Added to the next distributable amount.
    pub fn carried_proceeds(&self) -> Result<Amount> {
        self.read(|rt| {
            let table = rt.open_table(META).map_err(store_err)?;
            get_amount(&table, CARRY_KEY)
        })
    }

    /// Add to the carried proceeds and return the new total.
    pub fn add_carried_proceeds(&self, amount: Amount) -> Result<Amount> {
        self.write(|wt| {
            let mut table = wt.open_table(META).map_err(store_err)?;
            let total = get_amount(&table, CARRY_KEY)?.saturating_add(amount);
            put_amount(&mut table, CARRY_KEY, total)?;
            Ok(total)
        })
    }

    pub fn last_paid(&self, holder: &str) -> Result<Option<DateTime<Utc>>> {
        self.read(|rt| {
            let table = rt.open_table(LAST_PAID).map_err(store_err)?;
            get_json(&table, holder.as_bytes())
        })
    }

    // -----------------------------------------------------------------------
    // Settlement journal
    // -----------------------------------------------------------------------

    /// Persist intent before a transfer is sent: the pending entry and a
    /// `Dispatched` record, in one transaction.
    ///
    /// Refuses to reuse a key whose earlier attempt did not fail, so one
    /// `(epoch, cycle, holder)` can never be paid twice by this process.
    pub fn dispatch(&self, payout: &PendingPayout, record: &SettlementRecord) -> Result<()> {
        self.write(|wt| {
            let mut settlements = wt.open_table(SETTLEMENTS).map_err(store_err)?;
            if let Some(existing) =
                get_json::<SettlementRecord>(&settlements, record.key.as_bytes())?
            {
                if existing.status != SettlementStatus::Failed {
                    return Err(TaxflowError::SettlementState {
                        key: record.key.clone(),
                        status: existing.status.to_string(),
                        expected: SettlementStatus::Failed.to_string(),
                    });
                }
            }
            put_json(&mut settlements, record.key.as_bytes(), record)?;
            let mut pending = wt.open_table(PENDING).map_err(store_err)?;
            put_json(&mut pending, payout.holder.as_bytes(), payout)
        })
    }

    /// Transfer landed: mark the record confirmed, clear the holder's queue
    /// entry and the accumulator share it carried, stamp `last_paid`.
    pub fn confirm(&self, key: &str, action_id: &str, at: DateTime<Utc>) -> Result<SettlementRecord> {
        self.write(|wt| {
            let mut settlements = wt.open_table(SETTLEMENTS).map_err(store_err)?;
            let mut record = expect_record(&settlements, key, SettlementStatus::Dispatched)?;
            record.status = SettlementStatus::Confirmed;
            record.action_id = Some(action_id.to_string());
            record.updated_at = at;
            put_json(&mut settlements, key.as_bytes(), &record)?;
            settle_holder(wt, &record, at)?;
            Ok(record)
        })
    }

    /// Transfer failed. `payout` is the queue entry after the failure; with
    /// `drop` set it is moved to the audit table instead of requeued.
    pub fn fail(
        &self,
        key: &str,
        error: &str,
        payout: &PendingPayout,
        drop: bool,
        at: DateTime<Utc>,
    ) -> Result<()> {
        self.write(|wt| {
            let mut settlements = wt.open_table(SETTLEMENTS).map_err(store_err)?;
            let mut record = expect_record(&settlements, key, SettlementStatus::Dispatched)?;
            record.status = SettlementStatus::Failed;
            record.error = Some(error.to_string());
            record.updated_at = at;
            put_json(&mut settlements, key.as_bytes(), &record)?;

            let mut pending = wt.open_table(PENDING).map_err(store_err)?;
            if drop {
                pending.remove(payout.holder.as_bytes()).map_err(store_err)?;
                let mut dropped = wt.open_table(DROPPED).map_err(store_err)?;
                let entry = DroppedPayout::from_pending(payout, key, at);
                put_json(&mut dropped, time_key(at, Uuid::new_v4()).as_slice(), &entry)?;
            } else {
                put_json(&mut pending, payout.holder.as_bytes(), payout)?;
            }
            Ok(())
        })
    }

    pub fn settlement(&self, key: &str) -> Result<Option<SettlementRecord>> {
        self.read(|rt| {
            let table = rt.open_table(SETTLEMENTS).map_err(store_err)?;
            get_json(&table, key.as_bytes())
        })
    }

    pub fn settlements_with(&self, status: SettlementStatus) -> Result<Vec<SettlementRecord>> {
        self.read(|rt| {
            let table = rt.open_table(SETTLEMENTS).map_err(store_err)?;
            let all: Vec<SettlementRecord> = scan_json(&table)?;
            Ok(all.into_iter().filter(|r| r.status == status).collect())
        })
    }

    pub fn unreconciled(&self) -> Result<Vec<SettlementRecord>> {
        self.settlements_with(SettlementStatus::Unreconciled)
    }

    /// Dropped payouts, newest first.
    pub fn dropped(&self, limit: usize) -> Result<Vec<DroppedPayout>> {
        self.read(|rt| {
            let table = rt.open_table(DROPPED).map_err(store_err)?;
            scan_json_rev(&table, limit)
        })
    }

    // -----------------------------------------------------------------------
    // Recovery
    // -----------------------------------------------------------------------

    /// On startup, turn every `Dispatched` record into `Unreconciled` and hold
    /// its pending payout so it is not sent again until an operator decides.
    ///
    /// Returns the number of records recovered.
    pub fn startup_recovery(&self) -> Result<u32> {
        let now = Utc::now();
        self.write(|wt| {
            let mut settlements = wt.open_table(SETTLEMENTS).map_err(store_err)?;
            let in_flight: Vec<SettlementRecord> = scan_json::<SettlementRecord>(&settlements)?
                .into_iter()
                .filter(|r| r.status == SettlementStatus::Dispatched)
                .collect();

            let mut pending = wt.open_table(PENDING).map_err(store_err)?;
            for mut record in in_flight.iter().cloned() {
                tracing::warn!(
                    key = %record.key,
                    holder = %record.holder,
                    amount = %record.amount,
                    "settlement was in flight at shutdown; holding for reconciliation"
                );
                record.status = SettlementStatus::Unreconciled;
                record.updated_at = now;
                put_json(&mut settlements, record.key.as_bytes(), &record)?;

                if let Some(mut payout) =
                    get_json::<PendingPayout>(&pending, record.holder.as_bytes())?
                {
                    payout.held_by = Some(record.key.clone());
                    put_json(&mut pending, record.holder.as_bytes(), &payout)?;
                }
            }
            Ok(in_flight.len() as u32)
        })
    }

    /// Resolve an `Unreconciled` settlement after checking the ledger.
    pub fn reconcile(&self, key: &str, resolution: Resolution) -> Result<SettlementRecord> {
        let now = Utc::now();
        self.write(|wt| {
            let mut settlements = wt.open_table(SETTLEMENTS).map_err(store_err)?;
            let mut record = expect_record(&settlements, key, SettlementStatus::Unreconciled)?;
            record.reconciled = true;
            record.updated_at = now;
            match resolution {
                Resolution::Paid => {
                    record.status = SettlementStatus::Confirmed;
                    put_json(&mut settlements, key.as_bytes(), &record)?;
                    settle_holder(wt, &record, now)?;
                }
                Resolution::Retry => {
                    record.status = SettlementStatus::Failed;
                    record.error = Some("reconciled: transfer did not land".to_string());
                    put_json(&mut settlements, key.as_bytes(), &record)?;
                    let mut pending = wt.open_table(PENDING).map_err(store_err)?;
                    if let Some(mut payout) =
                        get_json::<PendingPayout>(&pending, record.holder.as_bytes())?
                    {
                        if payout.held_by.as_deref() == Some(key) {
                            payout.held_by = None;
                            put_json(&mut pending, record.holder.as_bytes(), &payout)?;
                        }
                    }
                }
            }
            tracing::info!(key, ?resolution, "settlement reconciled");
            Ok(record)
        })
    }

    // -----------------------------------------------------------------------
    // Totals
    // -----------------------------------------------------------------------

    pub fn totals(&self) -> Result<StoreTotals> {
        let pending = self.pending()?;
        let accumulated = self.accumulated_all()?;
        Ok(StoreTotals {
            pending_count: pending.len(),
            pending_amount: pending
                .iter()
                .fold(0u128, |acc, p| acc.saturating_add(p.amount)),
            held_count: pending.iter().filter(|p| p.is_held()).count(),
            accumulated_holders: accumulated.len(),
            accumulated_amount: accumulated
                .iter()
                .fold(0u128, |acc, (_, a)| acc.saturating_add(*a)),
            unreconciled: self.unreconciled()?.len(),
            carried_proceeds: self.carried_proceeds()?,
        })
    }
}

fn expect_record(
    table: &impl ReadableTable<Bytes, Bytes>,
    key: &str,
    expected: SettlementStatus,
) -> Result<SettlementRecord> {
    let record: SettlementRecord = get_json(table, key.as_bytes())?
        .ok_or_else(|| TaxflowError::SettlementNotFound(key.to_string()))?;
    if record.status != expected {
        return Err(TaxflowError::SettlementState {
            key: key.to_string(),
            status: record.status.to_string(),
            expected: expected.to_string(),
        });
    }
    Ok(record)
}

/// Clear what a confirmed settlement paid for.
fn settle_holder(wt: &WriteTransaction, record: &SettlementRecord, at: DateTime<Utc>) -> Result<()> {
    let mut pending = wt.open_table(PENDING).map_err(store_err)?;
    pending.remove(record.holder.as_bytes()).map_err(store_err)?;

    let mut acc = wt.open_table(ACCUMULATED).map_err(store_err)?;
    let left = get_amount(&acc, &record.holder)?.saturating_sub(record.from_accumulator);
    put_amount(&mut acc, &record.holder, left)?;

    let mut last_paid = wt.open_table(LAST_PAID).map_err(store_err)?;
    put_json(&mut last_paid, record.holder.as_bytes(), &at)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::EpochClock;
    use crate::cycle::CycleState;
    use chrono::{Duration as CDur, NaiveDate, TimeZone};
    use tempfile::TempDir;

    fn open_tmp() -> (TempDir, StateStore) {
        let dir = TempDir::new().unwrap();
        let store = StateStore::open(&dir.path().join("state.db")).unwrap();
        (dir, store)
    }

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, 1).unwrap()
    }

    fn dispatch(store: &StateStore, holder: &str, amount: Amount, from_acc: Amount) -> String {
        let now = Utc::now();
        let payout = PendingPayout::new(holder, amount - from_acc, now);
        let record = SettlementRecord::dispatched(day(), 7, holder, amount, from_acc, now);
        store.dispatch(&payout, &record).unwrap();
        record.key
    }

    #[test]
    fn empty_store_has_default_state() {
        let (_dir, store) = open_tmp();
        assert_eq!(store.scheduler_state().unwrap(), SchedulerState::default());
        assert!(store.pending().unwrap().is_empty());
        assert!(store.last_cycle().unwrap().is_none());
        assert_eq!(store.totals().unwrap(), StoreTotals::default());
    }

    #[test]
    fn cycle_history_is_newest_first() {
        let (_dir, store) = open_tmp();
        let clock = EpochClock::default();
        let t0 = Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap();
        for i in 0..3 {
            let at = t0 + CDur::minutes(5 * i);
            let result =
                CycleResult::begin(&clock.position(at), at).finish(CycleState::RolledOver, at);
            store
                .commit_cycle(&result, &SchedulerState::default())
                .unwrap();
        }
        let recent = store.recent_cycles(2).unwrap();
        assert_eq!(recent.len(), 2);
        assert!(recent[0].finished_at > recent[1].finished_at);
        assert_eq!(recent[0].cycle, 111);
    }

    #[test]
    fn state_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.db");
        let at = Utc::now();
        {
            let store = StateStore::open(&path).unwrap();
            store
                .save_scheduler_state(&SchedulerState {
                    last_run_at: Some(at),
                    cycles_recorded: 4,
                    ..Default::default()
                })
                .unwrap();
            store.add_accumulated("A", 30).unwrap();
            store.upsert_pending(&PendingPayout::new("B", 9, at)).unwrap();
        }
        let store = StateStore::open(&path).unwrap();
        assert_eq!(store.scheduler_state().unwrap().cycles_recorded, 4);
        assert_eq!(store.accumulated("A").unwrap(), 30);
        assert_eq!(store.pending_for("B").unwrap().unwrap().amount, 9);
    }

    #[test]
    fn accumulator_adds_and_reports() {
        let (_dir, store) = open_tmp();
        assert_eq!(store.add_accumulated("A", 3).unwrap(), 3);
        assert_eq!(store.add_accumulated("A", 4).unwrap(), 7);
        assert_eq!(store.accumulated_all().unwrap(), vec![("A".to_string(), 7)]);
    }

    fn reward(holder: &str, amount: Amount) -> Payout {
        Payout {
            holder: holder.to_string(),
            amount,
        }
    }

    #[test]
    fn staging_queues_merges_and_parks() {
        let (_dir, store) = open_tmp();
        let now = Utc::now();
        store.upsert_pending(&PendingPayout::new("A", 10, now)).unwrap();
        let mut held = PendingPayout::new("H", 50, now);
        held.held_by = Some("2026-03-01:1:H".to_string());
        store.upsert_pending(&held).unwrap();

        let staged = store
            .stage_rewards(
                &[reward("A", 7), reward("B", 20), reward("C", 3), reward("H", 9)],
                5,
                now,
            )
            .unwrap();
        assert_eq!(staged.queued, 2);
        assert_eq!(staged.parked, 2);
        assert_eq!(staged.accumulated, 12);
        assert_eq!(store.pending_for("A").unwrap().unwrap().amount, 17);
        assert_eq!(store.pending_for("B").unwrap().unwrap().amount, 20);
        assert!(store.pending_for("C").unwrap().is_none());
        assert_eq!(store.accumulated("C").unwrap(), 3);
        assert_eq!(store.pending_for("H").unwrap().unwrap().amount, 50);
        assert_eq!(store.accumulated("H").unwrap(), 9);
    }

    #[test]
    fn staging_consumes_carried_proceeds() {
        let (_dir, store) = open_tmp();
        assert_eq!(store.add_carried_proceeds(40).unwrap(), 40);
        assert_eq!(store.add_carried_proceeds(2).unwrap(), 42);
        assert_eq!(store.totals().unwrap().carried_proceeds, 42);

        store.stage_rewards(&[reward("A", 42)], 1, Utc::now()).unwrap();
        assert_eq!(store.carried_proceeds().unwrap(), 0);
        assert_eq!(store.pending_for("A").unwrap().unwrap().amount, 42);
    }

    #[test]
    fn confirm_clears_queue_and_accumulator_share() {
        let (_dir, store) = open_tmp();
        store.add_accumulated("A", 5).unwrap();
        let key = dispatch(&store, "A", 25, 5);
        assert_eq!(store.settlement(&key).unwrap().unwrap().status, SettlementStatus::Dispatched);

        let at = Utc::now();
        let record = store.confirm(&key, "tx-1", at).unwrap();
        assert_eq!(record.status, SettlementStatus::Confirmed);
        assert!(store.pending_for("A").unwrap().is_none());
        assert_eq!(store.accumulated("A").unwrap(), 0);
        assert_eq!(store.last_paid("A").unwrap(), Some(at));
    }

    #[test]
    fn failure_requeues_or_drops() {
        let (_dir, store) = open_tmp();
        let key = dispatch(&store, "A", 10, 0);
        let mut payout = store.pending_for("A").unwrap().unwrap();
        payout.retry_count = 1;
        store.fail(&key, "boom", &payout, false, Utc::now()).unwrap();
        assert_eq!(store.pending_for("A").unwrap().unwrap().retry_count, 1);

        let key = format!("{}:{}:A", day(), 8);
        let record = SettlementRecord::dispatched(day(), 8, "A", 10, 0, Utc::now());
        store.dispatch(&payout, &record).unwrap();
        payout.retry_count = 3;
        store.fail(&key, "boom", &payout, true, Utc::now()).unwrap();
        assert!(store.pending_for("A").unwrap().is_none());
        let dropped = store.dropped(10).unwrap();
        assert_eq!(dropped.len(), 1);
        assert_eq!(dropped[0].retry_count, 3);
        assert_eq!(dropped[0].last_key, key);
    }

    #[test]
    fn confirmed_key_cannot_be_dispatched_again() {
        let (_dir, store) = open_tmp();
        let key = dispatch(&store, "A", 10, 0);
        store.confirm(&key, "tx", Utc::now()).unwrap();
        let record = SettlementRecord::dispatched(day(), 7, "A", 10, 0, Utc::now());
        let err = store
            .dispatch(&PendingPayout::new("A", 10, Utc::now()), &record)
            .unwrap_err();
        assert!(matches!(err, TaxflowError::SettlementState { .. }));
    }

    #[test]
    fn startup_recovery_holds_in_flight_payouts() {
        let (_dir, store) = open_tmp();
        let key = dispatch(&store, "A", 10, 0);
        let done = dispatch(&store, "B", 10, 0);
        store.confirm(&done, "tx", Utc::now()).unwrap();

        assert_eq!(store.startup_recovery().unwrap(), 1);
        let record = store.settlement(&key).unwrap().unwrap();
        assert_eq!(record.status, SettlementStatus::Unreconciled);
        assert_eq!(store.pending_for("A").unwrap().unwrap().held_by.as_deref(), Some(key.as_str()));
        assert_eq!(store.totals().unwrap().unreconciled, 1);
        assert_eq!(store.startup_recovery().unwrap(), 0);
    }

    #[test]
    fn reconcile_paid_settles_holder() {
        let (_dir, store) = open_tmp();
        let key = dispatch(&store, "A", 10, 0);
        store.startup_recovery().unwrap();
        let record = store.reconcile(&key, Resolution::Paid).unwrap();
        assert_eq!(record.status, SettlementStatus::Confirmed);
        assert!(record.reconciled);
        assert!(store.pending_for("A").unwrap().is_none());
        assert!(store.last_paid("A").unwrap().is_some());
    }

    #[test]
    fn reconcile_retry_releases_hold() {
        let (_dir, store) = open_tmp();
        let key = dispatch(&store, "A", 10, 0);
        store.startup_recovery().unwrap();
        store.reconcile(&key, Resolution::Retry).unwrap();
        let payout = store.pending_for("A").unwrap().unwrap();
        assert!(!payout.is_held());
        assert_eq!(payout.amount, 10);
        assert_eq!(payout.retry_count, 0);
    }

    #[test]
    fn reconcile_rejects_unknown_and_settled_keys() {
        let (_dir, store) = open_tmp();
        assert!(matches!(
            store.reconcile("nope", Resolution::Paid).unwrap_err(),
            TaxflowError::SettlementNotFound(_)
        ));
        let key = dispatch(&store, "A", 10, 0);
        store.confirm(&key, "tx", Utc::now()).unwrap();
        assert!(matches!(
            store.reconcile(&key, Resolution::Retry).unwrap_err(),
            TaxflowError::SettlementState { .. }
        ));
    }
}
