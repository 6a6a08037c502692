use crate::output::{fmt_amount, print_json, print_table, Column};
use std::path::Path;

pub fn run(path: &Path, limit: usize, json: bool) -> anyhow::Result<()> {
    let store = super::open_store(path)?;
    let cycles = store.recent_cycles(limit)?;

    if json {
        return print_json(&cycles);
    }
    if cycles.is_empty() {
        println!("No cycles recorded.");
        return Ok(());
    }

    let rows = cycles
        .iter()
        .map(|c| {
            vec![
                c.epoch.to_string(),
                c.cycle.to_string(),
                c.state.to_string(),
                fmt_amount(c.harvested),
                fmt_amount(c.distributed),
                format!("{}/{}", c.payouts_sent, c.payouts_failed),
                c.note.clone().or_else(|| c.error.clone()).unwrap_or_default(),
            ]
        })
        .collect();
    print_table(
        &[
            Column::text("EPOCH"),
            Column::num("CYCLE"),
            Column::text("STATE"),
            Column::num("HARVESTED"),
            Column::num("DISTRIBUTED"),
            Column::num("SENT/FAILED"),
            Column::text("NOTE"),
        ],
        rows,
    );
    Ok(())
}
