use crate::output::{fmt_amount, fmt_time, print_json};
use std::path::Path;

pub fn run(path: &Path, json: bool) -> anyhow::Result<()> {
    let scheduler = super::scheduler(path)?;
    let status = scheduler.status()?;

    if json {
        return print_json(&status);
    }

    println!(
        "Epoch {}  cycle {}/{}  (every {}s)",
        status.epoch, status.cycle, status.cycles_per_epoch, status.interval_secs
    );
    println!("Last run:      {}", fmt_time(status.last_run_at));
    println!("Last attempt:  {}", fmt_time(status.last_attempt_at));
    println!("Next run:      {}", fmt_time(Some(status.next_run_at)));
    match &status.last_result {
        Some(last) => println!(
            "Last result:   {} (cycle {}, harvested {}, distributed {})",
            last.state,
            last.cycle,
            fmt_amount(last.harvested),
            fmt_amount(last.distributed)
        ),
        None => println!("Last result:   -"),
    }
    println!("Cycles:        {}", status.cycles_recorded);
    println!(
        "Pending:       {} payouts, {} total ({} held)",
        status.pending_count,
        fmt_amount(status.pending_amount),
        status.held_count
    );
    println!("Accumulated:   {}", fmt_amount(status.accumulated_amount));
    if status.carried_proceeds > 0 {
        println!("Carried:       {}", fmt_amount(status.carried_proceeds));
    }
    if status.unreconciled > 0 {
        println!(
            "Unreconciled:  {} (see `taxflow payouts unreconciled`)",
            status.unreconciled
        );
    }
    for b in &status.breakers {
        println!("Breaker {:6} {:?}", b.name, b.state);
    }
    Ok(())
}
