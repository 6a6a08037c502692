use thiserror::Error;

/// Failure reported by an external collaborator (indexer, price feed, signer).
///
/// `Clone` so a single failed fetch can be handed to every caller that was
/// waiting on the same in-flight request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UpstreamError {
    #[error("upstream rate limited: {0}")]
    RateLimited(String),

    #[error("upstream call timed out after {0}ms")]
    Timeout(u64),

    #[error("circuit open for '{0}': failing fast")]
    CircuitOpen(String),

    #[error("insufficient funds: {0}")]
    InsufficientFunds(String),

    #[error("upstream rejected request: {0}")]
    Rejected(String),

    #[error("upstream unavailable: {0}")]
    Unavailable(String),

    #[error("failed to decode upstream response: {0}")]
    Decode(String),
}

impl UpstreamError {
    /// Transient failures are expected to clear on their own and never abort
    /// the process; callers fall back to cached data or retry next cycle.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::RateLimited(_) | Self::Timeout(_) | Self::CircuitOpen(_) | Self::Unavailable(_)
        )
    }

    /// Failures that count toward opening the circuit breaker.
    pub fn trips_breaker(&self) -> bool {
        matches!(self, Self::RateLimited(_) | Self::Timeout(_))
    }
}

#[derive(Debug, Error)]
pub enum TaxflowError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("config file not found: {0} (run 'taxflow init')")]
    ConfigNotFound(String),

    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    #[error("insufficient funds to pay {holder}: {detail}")]
    InsufficientFunds { holder: String, detail: String },

    #[error("harvest stopped after batch {completed}/{total}: {reason}")]
    PartialBatchFailure {
        completed: usize,
        total: usize,
        reason: String,
    },

    #[error("no eligible holders")]
    NoEligibleHolders,

    #[error("settlement record not found: {0}")]
    SettlementNotFound(String),

    #[error("settlement '{key}' is {status}, expected {expected}")]
    SettlementState {
        key: String,
        status: String,
        expected: String,
    },

    #[error("state store error: {0}")]
    Store(String),

    #[error("cycle panicked: {0}")]
    Panicked(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, TaxflowError>;
