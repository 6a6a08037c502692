//! Pro-rata reward computation.
//!
//! Pure and deterministic: holders are ordered by address before anything is
//! computed, balances are summed in integer arithmetic and every share is
//! rounded down, so `sum(rewards) <= distributable` always holds. The
//! rounding remainder stays with the payer and is reported as dust.

use crate::types::{mul_div, Amount, EligibleHolder, Payout};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RewardPlan {
    pub payouts: Vec<Payout>,
    #[serde(with = "crate::types::amount_str")]
    pub total: Amount,
    #[serde(with = "crate::types::amount_str")]
    pub dust: Amount,
}

/// Split `distributable` across the eligible holders in proportion to their
/// raw balances. Non-eligible entries are ignored; zero rewards are omitted.
pub fn compute_rewards(holders: &[EligibleHolder], distributable: Amount) -> RewardPlan {
    let mut eligible: Vec<&EligibleHolder> = holders.iter().filter(|h| h.is_eligible()).collect();
    eligible.sort_by(|a, b| a.holder.address.cmp(&b.holder.address));

    let shift = balance_shift(&eligible);
    let total_balance = eligible
        .iter()
        .fold(0u128, |acc, h| acc + (h.holder.raw_balance >> shift));

    if total_balance == 0 || distributable == 0 {
        return RewardPlan {
            payouts: Vec::new(),
            total: 0,
            dust: distributable,
        };
    }

    let payouts: Vec<Payout> = eligible
        .iter()
        .filter_map(|h| {
            let amount = mul_div(distributable, h.holder.raw_balance >> shift, total_balance);
            (amount > 0).then(|| Payout {
                holder: h.holder.address.clone(),
                amount,
            })
        })
        .collect();

    let total = payouts.iter().map(|p| p.amount).sum::<Amount>();
    RewardPlan {
        payouts,
        total,
        dust: distributable.saturating_sub(total),
    }
}

/// Smallest right shift that lets the eligible balances sum without
/// overflow. Zero for any realistic supply.
fn balance_shift(eligible: &[&EligibleHolder]) -> u32 {
    (0..u128::BITS)
        .find(|&shift| {
            eligible
                .iter()
                .try_fold(0u128, |acc, h| acc.checked_add(h.holder.raw_balance >> shift))
                .is_some()
        })
        .unwrap_or(u128::BITS - 1)
}
