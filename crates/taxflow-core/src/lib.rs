pub mod breaker;
pub mod cache;
pub mod clock;
pub mod config;
pub mod cycle;
pub mod distribution;
pub mod eligibility;
pub mod error;
pub mod harvest;
pub mod holders;
pub mod price;
pub mod reward;
pub mod scheduler;
pub mod store;
pub mod types;
pub mod upstream;

pub use error::{Result, TaxflowError, UpstreamError};
