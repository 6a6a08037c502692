use crate::config::DistributionConfig;
use crate::price::PriceSnapshot;
use crate::types::{EligibilityStatus, EligibleHolder, Holder};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

#[derive(Debug, Clone, Default)]
pub struct EligibilityRules {
    pub min_holding_usd: f64,
    pub blacklist: HashSet<String>,
}

impl EligibilityRules {
    pub fn from_config(cfg: &DistributionConfig) -> Self {
        Self {
            min_holding_usd: cfg.min_holding_usd,
            blacklist: cfg.blacklist.iter().cloned().collect(),
        }
    }

    pub fn status_of(&self, holder: &Holder, usd_value: f64) -> EligibilityStatus {
        if self.blacklist.contains(&holder.address) {
            EligibilityStatus::Blacklisted
        } else if usd_value >= self.min_holding_usd {
            EligibilityStatus::Eligible
        } else {
            EligibilityStatus::Excluded
        }
    }
}

/// Classify every holder against one price snapshot. Output is ordered by
/// address, so the same inputs always give the same list.
pub fn classify(
    holders: &[Holder],
    price: &PriceSnapshot,
    rules: &EligibilityRules,
) -> Vec<EligibleHolder> {
    let mut out: Vec<EligibleHolder> = holders
        .iter()
        .map(|h| {
            let usd_value = price.value_of(h.raw_balance, h.decimals);
            EligibleHolder {
                holder: h.clone(),
                usd_value,
                status: rules.status_of(h, usd_value),
            }
        })
        .collect();
    out.sort_by(|a, b| a.holder.address.cmp(&b.holder.address));
    out
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EligibilitySummary {
    pub eligible: usize,
    pub excluded: usize,
    pub blacklisted: usize,
}

pub fn summarize(classified: &[EligibleHolder]) -> EligibilitySummary {
    let mut s = EligibilitySummary::default();
    for h in classified {
        match h.status {
            EligibilityStatus::Eligible => s.eligible += 1,
            EligibilityStatus::Excluded => s.excluded += 1,
            EligibilityStatus::Blacklisted => s.blacklisted += 1,
        }
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rules(min: f64, deny: &[&str]) -> EligibilityRules {
        EligibilityRules {
            min_holding_usd: min,
            blacklist: deny.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn blacklist_wins_over_value() {
        let holders = vec![Holder::new("pool", 1_000_000, 0)];
        let out = classify(&holders, &PriceSnapshot::new(1.0), &rules(1.0, &["pool"]));
        assert_eq!(out[0].status, EligibilityStatus::Blacklisted);
    }

    #[test]
    fn threshold_is_inclusive() {
        let holders = vec![Holder::new("A", 10, 0), Holder::new("B", 9, 0)];
        let out = classify(&holders, &PriceSnapshot::new(1.0), &rules(10.0, &[]));
        assert_eq!(out[0].status, EligibilityStatus::Eligible);
        assert_eq!(out[1].status, EligibilityStatus::Excluded);
        assert_eq!(out[0].usd_value, 10.0);
    }

    #[test]
    fn output_sorted_and_idempotent() {
        let holders = vec![
            Holder::new("C", 50, 0),
            Holder::new("A", 50, 0),
            Holder::new("B", 1, 0),
        ];
        let price = PriceSnapshot::new(1.0);
        let r = rules(5.0, &[]);
        let first = classify(&holders, &price, &r);
        let second = classify(&holders, &price, &r);
        assert_eq!(first, second);
        let order: Vec<&str> = first.iter().map(|h| h.holder.address.as_str()).collect();
        assert_eq!(order, vec!["A", "B", "C"]);
        assert_eq!(
            summarize(&first),
            EligibilitySummary {
                eligible: 2,
                excluded: 1,
                blacklisted: 0
            }
        );
    }
}
