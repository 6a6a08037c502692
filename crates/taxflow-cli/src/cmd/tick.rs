use crate::output::{fmt_amount, fmt_time, print_json};
use anyhow::Context;
use std::path::Path;
use taxflow_core::scheduler::{SkipReason, TickOutcome};

pub fn run(path: &Path, json: bool) -> anyhow::Result<()> {
    let scheduler = super::scheduler(path)?;
    scheduler.recover().context("startup recovery failed")?;

    let rt = tokio::runtime::Runtime::new()?;
    let outcome = rt.block_on(scheduler.tick())?;

    match outcome {
        TickOutcome::Skipped(reason) => {
            if json {
                print_json(&serde_json::json!({ "skipped": reason }))?;
            } else {
                match reason {
                    SkipReason::AlreadyRunning => println!("Skipped: a cycle is already running"),
                    SkipReason::TooSoon { next_at } => {
                        println!(
                            "Skipped: last run too recent; next run at {}",
                            fmt_time(Some(next_at))
                        )
                    }
                }
            }
        }
        TickOutcome::Completed(result) => {
            if json {
                print_json(&result)?;
            } else {
                println!(
                    "{} cycle {} -> {}",
                    result.epoch, result.cycle, result.state
                );
                println!("  tax observed: {}", fmt_amount(result.tax_observed));
                println!("  harvested:    {}", fmt_amount(result.harvested));
                if result.carried_in > 0 {
                    println!("  carried in:   {}", fmt_amount(result.carried_in));
                }
                println!("  distributed:  {}", fmt_amount(result.distributed));
                println!(
                    "  payouts:      {} sent, {} failed, {} dropped",
                    result.payouts_sent, result.payouts_failed, result.payouts_dropped
                );
                if let Some(note) = &result.note {
                    println!("  note:         {note}");
                }
                if let Some(err) = &result.error {
                    println!("  error:        {err}");
                }
            }
        }
    }
    Ok(())
}
