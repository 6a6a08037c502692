use chrono::{DateTime, Utc};
use serde::Serialize;

/// Free-text cells (errors, notes) are cut to this many characters.
const MAX_TEXT: usize = 60;

pub fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    println!("{}", json);
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Align {
    Left,
    Right,
}

#[derive(Debug, Clone, Copy)]
pub struct Column {
    pub title: &'static str,
    pub align: Align,
}

impl Column {
    pub const fn text(title: &'static str) -> Self {
        Self {
            title,
            align: Align::Left,
        }
    }

    /// Amounts and counts line up on their last digit.
    pub const fn num(title: &'static str) -> Self {
        Self {
            title,
            align: Align::Right,
        }
    }
}

pub fn print_table(columns: &[Column], rows: Vec<Vec<String>>) {
    print!("{}", render_table(columns, &rows));
}

fn render_table(columns: &[Column], rows: &[Vec<String>]) -> String {
    let rows: Vec<Vec<String>> = rows
        .iter()
        .map(|row| row.iter().map(|c| clip(c, MAX_TEXT)).collect())
        .collect();

    let mut widths: Vec<usize> = columns.iter().map(|c| c.title.chars().count()).collect();
    for row in &rows {
        for (w, cell) in widths.iter_mut().zip(row) {
            *w = (*w).max(cell.chars().count());
        }
    }

    let line = |cells: Vec<(&str, Align)>| -> String {
        let last = cells.len().saturating_sub(1);
        let parts: Vec<String> = cells
            .into_iter()
            .zip(&widths)
            .enumerate()
            .map(|(i, ((cell, align), &w))| match align {
                Align::Right => format!("{cell:>w$}"),
                // No trailing padding on the last column.
                Align::Left if i == last => cell.to_string(),
                Align::Left => format!("{cell:<w$}"),
            })
            .collect();
        format!("{}\n", parts.join("  "))
    };

    let mut out = line(columns.iter().map(|c| (c.title, c.align)).collect());
    let sep: Vec<String> = widths.iter().map(|&w| "-".repeat(w)).collect();
    out.push_str(&sep.join("  "));
    out.push('\n');
    for row in &rows {
        out.push_str(&line(
            row.iter()
                .map(String::as_str)
                .zip(columns.iter().map(|c| c.align))
                .collect(),
        ));
    }
    out
}

fn clip(cell: &str, max: usize) -> String {
    if cell.chars().count() <= max {
        return cell.to_string();
    }
    let mut cut: String = cell.chars().take(max.saturating_sub(3)).collect();
    cut.push_str("...");
    cut
}

/// Raw amount with `,` between thousands, e.g. `1,250,000`.
pub fn fmt_amount(amount: u128) -> String {
    let digits = amount.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}

pub fn fmt_time(t: Option<DateTime<Utc>>) -> String {
    t.map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn amounts_are_grouped_by_thousands() {
        assert_eq!(fmt_amount(0), "0");
        assert_eq!(fmt_amount(999), "999");
        assert_eq!(fmt_amount(1_000), "1,000");
        assert_eq!(fmt_amount(12_500_000), "12,500,000");
    }

    #[test]
    fn numeric_columns_are_right_aligned() {
        let table = render_table(
            &[Column::text("HOLDER"), Column::num("AMOUNT"), Column::text("NOTE")],
            &[
                vec!["alice".into(), fmt_amount(5), "ok".into()],
                vec!["bob".into(), fmt_amount(1_250_000), String::new()],
            ],
        );
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines[0], "HOLDER     AMOUNT  NOTE");
        assert_eq!(lines[1], "------  ---------  ----");
        assert_eq!(lines[2], "alice           5  ok");
        assert_eq!(lines[3], "bob     1,250,000  ");
    }

    #[test]
    fn long_text_is_clipped() {
        let long = "x".repeat(200);
        let table = render_table(&[Column::text("ERROR")], &[vec![long]]);
        let row = table.lines().nth(2).unwrap();
        assert_eq!(row.chars().count(), MAX_TEXT);
        assert!(row.ends_with("..."));
    }
}
