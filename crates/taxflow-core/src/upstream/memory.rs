//! In-process upstream with scriptable failures.
//!
//! Implements every upstream trait over shared mutable state so scheduler,
//! server and CLI tests can drive full cycles without a network. Swaps
//! deduct from the withheld tax exactly like a real collect-and-swap.

use super::{HolderSource, PriceSource, Settlement, SwapReceipt, Swapper, TaxVault, UpstreamResult};
use crate::error::UpstreamError;
use crate::types::{mul_div, Amount, Holder};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwapCall {
    pub amount_in: Amount,
    pub key: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferCall {
    pub to: String,
    pub amount: Amount,
    pub key: String,
}

#[derive(Debug)]
struct State {
    holders: Vec<Holder>,
    price: f64,
    tax: Amount,
    rate: (u128, u128),
    latency: Duration,
    holders_error: Option<UpstreamError>,
    price_error: Option<UpstreamError>,
    tax_error: Option<UpstreamError>,
    /// Swap calls with index >= .0 fail with .1.
    swap_failure: Option<(usize, UpstreamError)>,
    transfer_failures: HashMap<String, UpstreamError>,
    swaps: Vec<SwapCall>,
    transfers: Vec<TransferCall>,
    holder_fetches: usize,
    price_fetches: usize,
    next_id: u64,
}

#[derive(Debug)]
pub struct MemoryUpstream {
    state: Mutex<State>,
}

impl Default for MemoryUpstream {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryUpstream {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                holders: Vec::new(),
                price: 1.0,
                tax: 0,
                rate: (1, 1),
                latency: Duration::ZERO,
                holders_error: None,
                price_error: None,
                tax_error: None,
                swap_failure: None,
                transfer_failures: HashMap::new(),
                swaps: Vec::new(),
                transfers: Vec::new(),
                holder_fetches: 0,
                price_fetches: 0,
                next_id: 1,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn with_holders(self, holders: Vec<Holder>) -> Self {
        self.set_holders(holders);
        self
    }

    pub fn with_price(self, price: f64) -> Self {
        self.set_price(price);
        self
    }

    pub fn with_tax(self, tax: Amount) -> Self {
        self.set_tax(tax);
        self
    }

    pub fn set_holders(&self, holders: Vec<Holder>) {
        self.lock().holders = holders;
    }

    pub fn set_price(&self, price: f64) {
        self.lock().price = price;
    }

    pub fn set_tax(&self, tax: Amount) {
        self.lock().tax = tax;
    }

    pub fn add_tax(&self, amount: Amount) {
        let mut s = self.lock();
        s.tax = s.tax.saturating_add(amount);
    }

    pub fn tax(&self) -> Amount {
        self.lock().tax
    }

    /// Swap output is `amount_in * num / den`.
    pub fn set_swap_rate(&self, num: u128, den: u128) {
        self.lock().rate = (num, den.max(1));
    }

    /// Delay applied to every call.
    pub fn set_latency(&self, latency: Duration) {
        self.lock().latency = latency;
    }

    pub fn fail_holders(&self, err: Option<UpstreamError>) {
        self.lock().holders_error = err;
    }

    pub fn fail_price(&self, err: Option<UpstreamError>) {
        self.lock().price_error = err;
    }

    pub fn fail_tax(&self, err: Option<UpstreamError>) {
        self.lock().tax_error = err;
    }

    /// Make every swap from the `from_call`-th (0-based, counted over the
    /// lifetime of this upstream) fail with `err`.
    pub fn fail_swaps_from(&self, from_call: usize, err: UpstreamError) {
        self.lock().swap_failure = Some((from_call, err));
    }

    pub fn clear_swap_failures(&self) {
        self.lock().swap_failure = None;
    }

    pub fn fail_transfers_to(&self, holder: &str, err: UpstreamError) {
        self.lock().transfer_failures.insert(holder.to_string(), err);
    }

    pub fn clear_transfer_failures(&self, holder: &str) {
        self.lock().transfer_failures.remove(holder);
    }

    pub fn swaps(&self) -> Vec<SwapCall> {
        self.lock().swaps.clone()
    }

    /// Successful transfers only.
    pub fn transfers(&self) -> Vec<TransferCall> {
        self.lock().transfers.clone()
    }

    pub fn holder_fetches(&self) -> usize {
        self.lock().holder_fetches
    }

    pub fn price_fetches(&self) -> usize {
        self.lock().price_fetches
    }

    async fn delay(&self) {
        let latency = self.lock().latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }

    fn next_id(&self, prefix: &str) -> String {
        let mut s = self.lock();
        let id = s.next_id;
        s.next_id += 1;
        format!("{prefix}-{id}")
    }
}

#[async_trait]
impl HolderSource for MemoryUpstream {
    async fn fetch_holders(&self) -> UpstreamResult<Vec<Holder>> {
        self.delay().await;
        let mut s = self.lock();
        s.holder_fetches += 1;
        match &s.holders_error {
            Some(e) => Err(e.clone()),
            None => Ok(s.holders.clone()),
        }
    }
}

#[async_trait]
impl PriceSource for MemoryUpstream {
    async fn fetch_price(&self) -> UpstreamResult<f64> {
        self.delay().await;
        let mut s = self.lock();
        s.price_fetches += 1;
        match &s.price_error {
            Some(e) => Err(e.clone()),
            None => Ok(s.price),
        }
    }
}

#[async_trait]
impl TaxVault for MemoryUpstream {
    async fn accumulated_tax(&self) -> UpstreamResult<Amount> {
        self.delay().await;
        let s = self.lock();
        match &s.tax_error {
            Some(e) => Err(e.clone()),
            None => Ok(s.tax),
        }
    }
}

#[async_trait]
impl Swapper for MemoryUpstream {
    async fn swap(&self, amount_in: Amount, key: &str) -> UpstreamResult<SwapReceipt> {
        self.delay().await;
        {
            let mut s = self.lock();
            let index = s.swaps.len();
            s.swaps.push(SwapCall {
                amount_in,
                key: key.to_string(),
            });
            if let Some((from, err)) = &s.swap_failure {
                if index >= *from {
                    return Err(err.clone());
                }
            }
            if amount_in > s.tax {
                return Err(UpstreamError::Rejected(format!(
                    "swap of {amount_in} exceeds withheld tax {}",
                    s.tax
                )));
            }
            s.tax -= amount_in;
        }
        let (num, den) = self.lock().rate;
        Ok(SwapReceipt {
            amount_out: mul_div(amount_in, num, den),
            action_id: self.next_id("swap"),
        })
    }
}

#[async_trait]
impl Settlement for MemoryUpstream {
    async fn transfer(&self, to: &str, amount: Amount, key: &str) -> UpstreamResult<String> {
        self.delay().await;
        {
            let mut s = self.lock();
            if let Some(err) = s.transfer_failures.get(to) {
                return Err(err.clone());
            }
            s.transfers.push(TransferCall {
                to: to.to_string(),
                amount,
                key: key.to_string(),
            });
        }
        Ok(self.next_id("tx"))
    }
}
