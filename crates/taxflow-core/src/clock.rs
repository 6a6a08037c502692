//! Epoch / cycle arithmetic.
//!
//! An epoch is one UTC calendar day. A cycle is a fixed-length slot inside
//! that day, numbered from 1. Both are derived from wall-clock time and never
//! stored as counters, so a restarted process lands on the same position.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

pub const DEFAULT_INTERVAL_SECS: u64 = 300;
pub const DEFAULT_CYCLES_PER_EPOCH: u32 = 288;

const SECS_PER_DAY: i64 = 86_400;

/// Where a given instant falls on the schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CyclePosition {
    pub epoch: NaiveDate,
    /// 1-based, `1..=cycles_per_epoch`.
    pub cycle: u32,
    /// Start of the slot this instant falls in.
    pub slot_start: DateTime<Utc>,
}

impl fmt::Display for CyclePosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.epoch, self.cycle)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EpochClock {
    interval_secs: u64,
    cycles_per_epoch: u32,
}

impl Default for EpochClock {
    fn default() -> Self {
        Self::new(DEFAULT_INTERVAL_SECS, DEFAULT_CYCLES_PER_EPOCH)
    }
}

impl EpochClock {
    /// `interval_secs` is clamped to at least one second and
    /// `cycles_per_epoch` to at least one cycle.
    pub fn new(interval_secs: u64, cycles_per_epoch: u32) -> Self {
        Self {
            interval_secs: interval_secs.max(1),
            cycles_per_epoch: cycles_per_epoch.max(1),
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::seconds(self.interval_secs as i64)
    }

    pub fn interval_std(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.interval_secs)
    }

    pub fn cycles_per_epoch(&self) -> u32 {
        self.cycles_per_epoch
    }

    pub fn position(&self, now: DateTime<Utc>) -> CyclePosition {
        let epoch = now.date_naive();
        let secs_into_day = now.timestamp().rem_euclid(SECS_PER_DAY);
        let slot_index = secs_into_day / self.interval_secs as i64;
        let cycle = ((slot_index as u64) + 1).min(self.cycles_per_epoch as u64) as u32;

        // Slots past the last cycle of the day (interval * cycles < 24h)
        // all collapse onto the final cycle's slot.
        let effective_index = (cycle - 1) as i64;
        let day_start = now.timestamp() - secs_into_day;
        let slot_secs = day_start + effective_index * self.interval_secs as i64;
        let slot_start = DateTime::<Utc>::from_timestamp(slot_secs, 0).unwrap_or(now);

        CyclePosition {
            epoch,
            cycle,
            slot_start,
        }
    }

    /// Start of the next slot strictly after `now`.
    pub fn next_slot(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let pos = self.position(now);
        let candidate = pos.slot_start + self.interval();
        if pos.cycle >= self.cycles_per_epoch || candidate.date_naive() != pos.epoch {
            let next_day = pos.epoch.succ_opt().unwrap_or(pos.epoch);
            next_day
                .and_hms_opt(0, 0, 0)
                .map(|dt| dt.and_utc())
                .unwrap_or(candidate)
        } else {
            candidate
        }
    }

    /// Time until the next slot boundary, for aligning the tick timer.
    pub fn until_next_slot(&self, now: DateTime<Utc>) -> std::time::Duration {
        (self.next_slot(now) - now)
            .to_std()
            .unwrap_or(std::time::Duration::ZERO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 14, h, m, s).unwrap()
    }

    #[test]
    fn midnight_is_cycle_one() {
        let clock = EpochClock::default();
        let pos = clock.position(at(0, 0, 0));
        assert_eq!(pos.cycle, 1);
        assert_eq!(pos.epoch, NaiveDate::from_ymd_opt(2026, 3, 14).unwrap());
        assert_eq!(pos.slot_start, at(0, 0, 0));
    }

    #[test]
    fn last_slot_of_day_is_cycle_288() {
        let clock = EpochClock::default();
        let pos = clock.position(at(23, 59, 59));
        assert_eq!(pos.cycle, 288);
        assert_eq!(pos.slot_start, at(23, 55, 0));
    }

    #[test]
    fn cycle_increments_every_interval() {
        let clock = EpochClock::default();
        assert_eq!(clock.position(at(0, 4, 59)).cycle, 1);
        assert_eq!(clock.position(at(0, 5, 0)).cycle, 2);
        assert_eq!(clock.position(at(12, 0, 0)).cycle, 145);
    }

    #[test]
    fn new_epoch_resets_cycle() {
        let clock = EpochClock::default();
        let before = clock.position(at(23, 59, 0));
        let after = clock.position(at(23, 59, 0) + Duration::minutes(2));
        assert_eq!(before.cycle, 288);
        assert_eq!(after.cycle, 1);
        assert_ne!(before.epoch, after.epoch);
    }

    #[test]
    fn cycle_is_clamped_when_slots_do_not_fill_the_day() {
        let clock = EpochClock::new(300, 10);
        assert_eq!(clock.position(at(6, 0, 0)).cycle, 10);
        assert_eq!(clock.position(at(6, 0, 0)).slot_start, at(0, 45, 0));
    }

    #[test]
    fn next_slot_rolls_to_next_day() {
        let clock = EpochClock::default();
        assert_eq!(clock.next_slot(at(10, 2, 30)), at(10, 5, 0));
        let next = clock.next_slot(at(23, 57, 0));
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 3, 15, 0, 0, 0).unwrap());
    }

    #[test]
    fn until_next_slot_is_positive() {
        let clock = EpochClock::default();
        let d = clock.until_next_slot(at(10, 4, 0));
        assert_eq!(d, std::time::Duration::from_secs(60));
    }
}
