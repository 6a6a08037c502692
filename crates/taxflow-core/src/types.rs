use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// Amounts
// ---------------------------------------------------------------------------

/// Raw integer amount of a token or of the settlement asset.
pub type Amount = u128;

/// Serde helpers that encode `u128` as a decimal string.
///
/// JSON numbers lose precision above 2^53 in most consumers, and serde_json
/// rejects u128 values that do not fit in u64 unless `arbitrary_precision`
/// is enabled.
pub mod amount_str {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &u128, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&v.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<u128, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Str(String),
            Num(u64),
        }
        match Repr::deserialize(d)? {
            Repr::Str(s) => s.trim().parse().map_err(serde::de::Error::custom),
            Repr::Num(n) => Ok(n as u128),
        }
    }
}

/// `a * b / c` rounded down, exact for all inputs.
///
/// The product is formed as a 256-bit value from 64-bit limbs and divided by
/// shift-subtract long division, so no intermediate overflows. Saturates at
/// `u128::MAX` when the quotient does not fit; returns 0 when `c == 0`.
pub fn mul_div(a: u128, b: u128, c: u128) -> u128 {
    if c == 0 {
        return 0;
    }
    if let Some(n) = a.checked_mul(b) {
        return n / c;
    }
    let (hi, lo) = mul_wide(a, b);
    if hi >= c {
        return u128::MAX;
    }
    let mut rem = hi;
    let mut quot = 0u128;
    for i in (0..128).rev() {
        let carry = rem >> 127;
        rem = (rem << 1) | ((lo >> i) & 1);
        if carry == 1 || rem >= c {
            rem = rem.wrapping_sub(c);
            quot |= 1u128 << i;
        }
    }
    quot
}

fn mul_wide(a: u128, b: u128) -> (u128, u128) {
    const MASK: u128 = u64::MAX as u128;
    let (a1, a0) = (a >> 64, a & MASK);
    let (b1, b0) = (b >> 64, b & MASK);
    let p00 = a0 * b0;
    let p01 = a0 * b1;
    let p10 = a1 * b0;
    let p11 = a1 * b1;
    let mid = (p00 >> 64) + (p01 & MASK) + (p10 & MASK);
    let lo = (p00 & MASK) | (mid << 64);
    let hi = p11 + (p01 >> 64) + (p10 >> 64) + (mid >> 64);
    (hi, lo)
}

/// Convert a whole-unit decimal quantity into raw units.
pub fn to_raw(ui_amount: f64, decimals: u8) -> Amount {
    if !ui_amount.is_finite() || ui_amount <= 0.0 {
        return 0;
    }
    let scaled = ui_amount * 10f64.powi(decimals as i32);
    if scaled >= u128::MAX as f64 {
        u128::MAX
    } else {
        scaled.round() as u128
    }
}

/// Convert raw units into a whole-unit decimal quantity (display/valuation only).
pub fn to_ui(raw: Amount, decimals: u8) -> f64 {
    raw as f64 / 10f64.powi(decimals as i32)
}

// ---------------------------------------------------------------------------
// Holder
// ---------------------------------------------------------------------------

/// A token holder as reported by the holder directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Holder {
    pub address: String,
    #[serde(rename = "amount", alias = "raw_balance", with = "amount_str")]
    pub raw_balance: Amount,
    pub decimals: u8,
}

impl Holder {
    pub fn new(address: impl Into<String>, raw_balance: Amount, decimals: u8) -> Self {
        Self {
            address: address.into(),
            raw_balance,
            decimals,
        }
    }

    pub fn ui_balance(&self) -> f64 {
        to_ui(self.raw_balance, self.decimals)
    }
}

// ---------------------------------------------------------------------------
// Eligibility
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EligibilityStatus {
    Eligible,
    Excluded,
    Blacklisted,
}

impl EligibilityStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            EligibilityStatus::Eligible => "eligible",
            EligibilityStatus::Excluded => "excluded",
            EligibilityStatus::Blacklisted => "blacklisted",
        }
    }
}

impl fmt::Display for EligibilityStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A holder annotated with its USD value and eligibility for this cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EligibleHolder {
    pub holder: Holder,
    pub usd_value: f64,
    pub status: EligibilityStatus,
}

impl EligibleHolder {
    pub fn is_eligible(&self) -> bool {
        self.status == EligibilityStatus::Eligible
    }
}

// ---------------------------------------------------------------------------
// Payout
// ---------------------------------------------------------------------------

/// One holder's share of a cycle's distributable amount.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payout {
    pub holder: String,
    #[serde(with = "amount_str")]
    pub amount: Amount,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mul_div_exact_path() {
        assert_eq!(mul_div(40, 100, 400), 10);
        assert_eq!(mul_div(40, 300, 400), 30);
        assert_eq!(mul_div(7, 1, 3), 2);
    }

    #[test]
    fn mul_div_zero_divisor_is_zero() {
        assert_eq!(mul_div(10, 10, 0), 0);
    }

    #[test]
    fn mul_div_wide_product_is_exact() {
        let a = u128::MAX / 2;
        let b = 3 * (1u128 << 100);
        let c = 4 * (1u128 << 100);
        // a * 3 / 4, computed without the wide path
        let exact = a / 4 * 3 + (a % 4) * 3 / 4;
        assert_eq!(mul_div(a, b, c), exact);
    }

    #[test]
    fn mul_div_saturates_when_quotient_overflows() {
        assert_eq!(mul_div(u128::MAX, u128::MAX, 2), u128::MAX);
        assert_eq!(mul_div(u128::MAX, u128::MAX, u128::MAX), u128::MAX);
    }

    #[test]
    fn to_raw_scales_by_decimals() {
        assert_eq!(to_raw(5.0, 0), 5);
        assert_eq!(to_raw(1.5, 6), 1_500_000);
        assert_eq!(to_raw(-1.0, 6), 0);
        assert_eq!(to_raw(f64::NAN, 6), 0);
    }

    #[test]
    fn holder_amount_accepts_string_or_number() {
        let h: Holder =
            serde_json::from_str(r#"{"address":"A","amount":"340282366920938463463","decimals":6}"#)
                .unwrap();
        assert_eq!(h.raw_balance, 340282366920938463463);
        let h: Holder =
            serde_json::from_str(r#"{"address":"B","amount":100,"decimals":0}"#).unwrap();
        assert_eq!(h.raw_balance, 100);
    }
}
