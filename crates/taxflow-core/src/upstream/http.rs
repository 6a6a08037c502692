//! JSON-over-HTTP adapters.
//!
//! `GatewayClient` speaks to a single gateway that fronts the chain indexer
//! and the signing service:
//!
//! ```text
//! GET  /holders   -> [{address, amount, decimals}] | {holders: [...]}
//! GET  /tax       -> {accumulated}
//! POST /swap      {amount_in, idempotency_key} -> {amount_out, action_id}
//! POST /transfer  {to, amount, idempotency_key} -> {action_id}
//! ```
//!
//! Amounts travel as decimal strings. HTTP 429 maps to `RateLimited`, 402 or
//! an `insufficient_funds` error code to `InsufficientFunds`, 5xx to
//! `Unavailable`, anything else non-2xx to `Rejected`.

use super::{HolderSource, PriceSource, Settlement, SwapReceipt, Swapper, TaxVault, UpstreamResult};
use crate::config::UpstreamConfig;
use crate::error::UpstreamError;
use crate::types::{amount_str, Amount, Holder};
use async_trait::async_trait;
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
#[serde(untagged)]
enum HoldersBody {
    List(Vec<Holder>),
    Wrapped { holders: Vec<Holder> },
}

#[derive(Deserialize)]
struct TaxBody {
    #[serde(with = "amount_str")]
    accumulated: Amount,
}

#[derive(Serialize)]
struct SwapRequest<'a> {
    #[serde(with = "amount_str")]
    amount_in: Amount,
    idempotency_key: &'a str,
}

#[derive(Serialize)]
struct TransferRequest<'a> {
    to: &'a str,
    #[serde(with = "amount_str")]
    amount: Amount,
    idempotency_key: &'a str,
}

#[derive(Deserialize)]
struct TransferBody {
    action_id: String,
}

#[derive(Deserialize, Default)]
struct ErrorBody {
    #[serde(default)]
    code: Option<String>,
    #[serde(default, alias = "message")]
    error: Option<String>,
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

fn map_transport(e: reqwest::Error) -> UpstreamError {
    if e.is_timeout() {
        UpstreamError::Timeout(0)
    } else if e.is_decode() {
        UpstreamError::Decode(e.to_string())
    } else {
        UpstreamError::Unavailable(e.to_string())
    }
}

async fn map_status(resp: Response) -> UpstreamError {
    let status = resp.status();
    let text = resp.text().await.unwrap_or_default();
    let body: ErrorBody = serde_json::from_str(&text).unwrap_or_default();
    let detail = body
        .error
        .clone()
        .unwrap_or_else(|| format!("HTTP {status}"));

    if status == StatusCode::TOO_MANY_REQUESTS {
        return UpstreamError::RateLimited(detail);
    }
    if status == StatusCode::PAYMENT_REQUIRED
        || body.code.as_deref() == Some("insufficient_funds")
    {
        return UpstreamError::InsufficientFunds(detail);
    }
    if status.is_server_error() {
        UpstreamError::Unavailable(detail)
    } else {
        UpstreamError::Rejected(detail)
    }
}

async fn send_json<T: DeserializeOwned>(req: RequestBuilder) -> UpstreamResult<T> {
    let resp = req.send().await.map_err(map_transport)?;
    if !resp.status().is_success() {
        return Err(map_status(resp).await);
    }
    resp.json::<T>()
        .await
        .map_err(|e| UpstreamError::Decode(e.to_string()))
}

// ---------------------------------------------------------------------------
// GatewayClient
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct GatewayClient {
    http: reqwest::Client,
    base: String,
    token: Option<String>,
}

impl GatewayClient {
    pub fn new(base: impl Into<String>, token: Option<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base: base.into().trim_end_matches('/').to_string(),
            token,
        }
    }

    /// Build from config, reading the bearer token from `api_key_env` if set.
    pub fn from_config(cfg: &UpstreamConfig) -> Self {
        let token = cfg
            .api_key_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok())
            .filter(|t| !t.is_empty());
        Self::new(cfg.gateway_url.clone(), token)
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base, path.trim_start_matches('/'))
    }

    fn authed(&self, req: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(t) => req.bearer_auth(t),
            None => req,
        }
    }
}

#[async_trait]
impl HolderSource for GatewayClient {
    async fn fetch_holders(&self) -> UpstreamResult<Vec<Holder>> {
        let req = self.authed(self.http.get(self.url("holders")));
        let body: HoldersBody = send_json(req).await?;
        Ok(match body {
            HoldersBody::List(h) => h,
            HoldersBody::Wrapped { holders } => holders,
        })
    }
}

#[async_trait]
impl TaxVault for GatewayClient {
    async fn accumulated_tax(&self) -> UpstreamResult<Amount> {
        let req = self.authed(self.http.get(self.url("tax")));
        let body: TaxBody = send_json(req).await?;
        Ok(body.accumulated)
    }
}

#[async_trait]
impl Swapper for GatewayClient {
    async fn swap(&self, amount_in: Amount, key: &str) -> UpstreamResult<SwapReceipt> {
        let req = self.authed(self.http.post(self.url("swap")).json(&SwapRequest {
            amount_in,
            idempotency_key: key,
        }));
        send_json(req).await
    }
}

#[async_trait]
impl Settlement for GatewayClient {
    async fn transfer(&self, to: &str, amount: Amount, key: &str) -> UpstreamResult<String> {
        let req = self.authed(self.http.post(self.url("transfer")).json(&TransferRequest {
            to,
            amount,
            idempotency_key: key,
        }));
        let body: TransferBody = send_json(req).await?;
        Ok(body.action_id)
    }
}

// ---------------------------------------------------------------------------
// HttpPriceSource
// ---------------------------------------------------------------------------

/// Reads a USD price from any JSON endpoint via a JSON pointer.
///
/// The value may be a number or a numeric string.
#[derive(Debug, Clone)]
pub struct HttpPriceSource {
    http: reqwest::Client,
    url: String,
    pointer: String,
}

impl HttpPriceSource {
    pub fn new(url: impl Into<String>, pointer: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            url: url.into(),
            pointer: pointer.into(),
        }
    }

    pub fn from_config(cfg: &UpstreamConfig) -> Self {
        Self::new(cfg.price_url.clone(), cfg.price_pointer.clone())
    }
}

#[async_trait]
impl PriceSource for HttpPriceSource {
    async fn fetch_price(&self) -> UpstreamResult<f64> {
        let body: serde_json::Value = send_json(self.http.get(&self.url)).await?;
        let node = body.pointer(&self.pointer).ok_or_else(|| {
            UpstreamError::Decode(format!("price response has no '{}'", self.pointer))
        })?;
        let price = match node {
            serde_json::Value::Number(n) => n.as_f64(),
            serde_json::Value::String(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        }
        .ok_or_else(|| UpstreamError::Decode(format!("'{}' is not numeric: {node}", self.pointer)))?;

        if !price.is_finite() || price < 0.0 {
            return Err(UpstreamError::Decode(format!("invalid price {price}")));
        }
        Ok(price)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
