//! Interfaces to the external collaborators the core drives.
//!
//! The core decides *when* and *how much* to swap or transfer; constructing
//! and signing the underlying transactions belongs to whatever implements
//! these traits. `http` talks to a JSON gateway, `memory` is an in-process
//! implementation used by tests and dry runs.

pub mod http;
pub mod memory;

use crate::config::UpstreamConfig;
use crate::error::UpstreamError;
use crate::types::{Amount, Holder};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub type UpstreamResult<T> = std::result::Result<T, UpstreamError>;

#[async_trait]
pub trait HolderSource: Send + Sync {
    async fn fetch_holders(&self) -> UpstreamResult<Vec<Holder>>;
}

#[async_trait]
pub trait PriceSource: Send + Sync {
    /// USD value of one whole project token.
    async fn fetch_price(&self) -> UpstreamResult<f64>;
}

#[async_trait]
pub trait TaxVault: Send + Sync {
    /// Raw amount of project token currently withheld as tax.
    async fn accumulated_tax(&self) -> UpstreamResult<Amount>;
}

/// Result of converting one harvest batch into the settlement asset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwapReceipt {
    #[serde(with = "crate::types::amount_str")]
    pub amount_out: Amount,
    pub action_id: String,
}

#[async_trait]
pub trait Swapper: Send + Sync {
    /// Collect `amount_in` of withheld tax and convert it. `key` identifies
    /// the batch so the executor can deduplicate resubmissions.
    async fn swap(&self, amount_in: Amount, key: &str) -> UpstreamResult<SwapReceipt>;
}

#[async_trait]
pub trait Settlement: Send + Sync {
    /// Transfer `amount` of the settlement asset to `to`. Returns the
    /// action id (e.g. transaction signature).
    async fn transfer(&self, to: &str, amount: Amount, key: &str) -> UpstreamResult<String>;
}

// ---------------------------------------------------------------------------
// Upstreams
// ---------------------------------------------------------------------------

/// The full set of collaborators one scheduler drives.
#[derive(Clone)]
pub struct Upstreams {
    pub holders: Arc<dyn HolderSource>,
    pub price: Arc<dyn PriceSource>,
    pub vault: Arc<dyn TaxVault>,
    pub swapper: Arc<dyn Swapper>,
    pub settlement: Arc<dyn Settlement>,
}

impl Upstreams {
    /// Gateway for holders, tax, swaps and transfers; separate price endpoint.
    pub fn from_config(cfg: &UpstreamConfig) -> Self {
        let gateway = Arc::new(http::GatewayClient::from_config(cfg));
        Self {
            holders: gateway.clone(),
            price: Arc::new(http::HttpPriceSource::from_config(cfg)),
            vault: gateway.clone(),
            swapper: gateway.clone(),
            settlement: gateway,
        }
    }

    pub fn memory(up: Arc<memory::MemoryUpstream>) -> Self {
        Self {
            holders: up.clone(),
            price: up.clone(),
            vault: up.clone(),
            swapper: up.clone(),
            settlement: up,
        }
    }
}
