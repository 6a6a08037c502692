use crate::output::{fmt_amount, fmt_time, print_json, print_table, Column};
use anyhow::Context;
use clap::Subcommand;
use std::path::Path;
use taxflow_core::store::Resolution;

// ---------------------------------------------------------------------------
// Subcommand types
// ---------------------------------------------------------------------------

#[derive(Subcommand)]
pub enum PayoutsSubcommand {
    /// Payouts queued for the next distributing cycle
    Pending,

    /// Payouts removed after exhausting their retries
    Dropped {
        #[arg(long, default_value = "50")]
        limit: usize,
    },

    /// Transfers left in flight by a crashed process
    Unreconciled,

    /// Resolve an unreconciled transfer after checking the ledger
    Reconcile {
        /// Settlement key, `{epoch}:{cycle}:{holder}`
        key: String,
        /// The transfer landed: mark the payout settled
        #[arg(long, conflicts_with = "retry", required_unless_present = "retry")]
        paid: bool,
        /// The transfer never landed: release the payout for the next cycle
        #[arg(long)]
        retry: bool,
    },
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

pub fn run(path: &Path, subcmd: PayoutsSubcommand, json: bool) -> anyhow::Result<()> {
    let store = super::open_store(path)?;
    match subcmd {
        PayoutsSubcommand::Pending => {
            let pending = store.pending()?;
            if json {
                return print_json(&pending);
            }
            if pending.is_empty() {
                println!("No pending payouts.");
                return Ok(());
            }
            let rows = pending
                .iter()
                .map(|p| {
                    vec![
                        p.holder.clone(),
                        fmt_amount(p.amount),
                        p.retry_count.to_string(),
                        fmt_time(Some(p.queued_at)),
                        p.held_by.clone().unwrap_or_else(|| "-".to_string()),
                        p.last_error.clone().unwrap_or_default(),
                    ]
                })
                .collect();
            print_table(
                &[
                    Column::text("HOLDER"),
                    Column::num("AMOUNT"),
                    Column::num("RETRIES"),
                    Column::text("QUEUED"),
                    Column::text("HELD BY"),
                    Column::text("LAST ERROR"),
                ],
                rows,
            );
        }
        PayoutsSubcommand::Dropped { limit } => {
            let dropped = store.dropped(limit)?;
            if json {
                return print_json(&dropped);
            }
            if dropped.is_empty() {
                println!("No dropped payouts.");
                return Ok(());
            }
            let rows = dropped
                .iter()
                .map(|d| {
                    vec![
                        d.holder.clone(),
                        fmt_amount(d.amount),
                        d.retry_count.to_string(),
                        fmt_time(Some(d.dropped_at)),
                        d.last_error.clone().unwrap_or_default(),
                    ]
                })
                .collect();
            print_table(
                &[
                    Column::text("HOLDER"),
                    Column::num("AMOUNT"),
                    Column::num("RETRIES"),
                    Column::text("DROPPED"),
                    Column::text("LAST ERROR"),
                ],
                rows,
            );
        }
        PayoutsSubcommand::Unreconciled => {
            let records = store.unreconciled()?;
            if json {
                return print_json(&records);
            }
            if records.is_empty() {
                println!("Nothing to reconcile.");
                return Ok(());
            }
            let rows = records
                .iter()
                .map(|r| {
                    vec![
                        r.key.clone(),
                        fmt_amount(r.amount),
                        fmt_time(Some(r.dispatched_at)),
                    ]
                })
                .collect();
            print_table(
                &[
                    Column::text("KEY"),
                    Column::num("AMOUNT"),
                    Column::text("DISPATCHED"),
                ],
                rows,
            );
            println!();
            println!("Check each transfer on the ledger, then run");
            println!("  taxflow payouts reconcile <KEY> --paid | --retry");
        }
        PayoutsSubcommand::Reconcile { key, paid, retry } => {
            let resolution = match (paid, retry) {
                (true, _) => Resolution::Paid,
                _ => Resolution::Retry,
            };
            let record = store
                .reconcile(&key, resolution)
                .with_context(|| format!("failed to reconcile '{key}'"))?;
            if json {
                return print_json(&record);
            }
            println!("{} -> {}", record.key, record.status);
        }
    }
    Ok(())
}
