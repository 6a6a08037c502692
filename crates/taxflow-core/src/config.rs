use crate::error::{Result, TaxflowError};
use crate::types::{to_raw, Amount};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::NamedTempFile;

pub const CONFIG_FILE: &str = "taxflow.yaml";

// ---------------------------------------------------------------------------
// ConfigWarning / WarnLevel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigWarning {
    pub level: WarnLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarnLevel {
    Warning,
    Error,
}

// ---------------------------------------------------------------------------
// AssetConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetConfig {
    pub symbol: String,
    #[serde(default)]
    pub mint: Option<String>,
    pub decimals: u8,
}

fn default_token() -> AssetConfig {
    AssetConfig {
        symbol: "TAX".to_string(),
        mint: None,
        decimals: 6,
    }
}

fn default_settlement() -> AssetConfig {
    AssetConfig {
        symbol: "SOL".to_string(),
        mint: None,
        decimals: 9,
    }
}

// ---------------------------------------------------------------------------
// ScheduleConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_cycles_per_epoch")]
    pub cycles_per_epoch: u32,
    /// Timeout applied to every external call.
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
}

fn default_interval_secs() -> u64 {
    crate::clock::DEFAULT_INTERVAL_SECS
}

fn default_cycles_per_epoch() -> u32 {
    crate::clock::DEFAULT_CYCLES_PER_EPOCH
}

fn default_call_timeout_ms() -> u64 {
    15_000
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            cycles_per_epoch: default_cycles_per_epoch(),
            call_timeout_ms: default_call_timeout_ms(),
        }
    }
}

impl ScheduleConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

// ---------------------------------------------------------------------------
// HarvestConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThresholdMode {
    /// Compare accumulated tax by token count.
    Token,
    /// Compare accumulated tax by its USD value at the cycle's price snapshot.
    Usd,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarvestConfig {
    #[serde(default = "default_threshold_mode")]
    pub threshold_mode: ThresholdMode,
    /// Whole tokens.
    #[serde(default = "default_min_tokens")]
    pub min_tokens: f64,
    /// Whole tokens; harvests above this are split into batches.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: f64,
    #[serde(default = "default_min_usd")]
    pub min_usd: f64,
    #[serde(default = "default_max_usd")]
    pub max_usd: f64,
    #[serde(default = "default_batch_count")]
    pub batch_count: u32,
    #[serde(default = "default_batch_delay_token_secs")]
    pub batch_delay_token_secs: u64,
    #[serde(default = "default_batch_delay_usd_secs")]
    pub batch_delay_usd_secs: u64,
}

fn default_threshold_mode() -> ThresholdMode {
    ThresholdMode::Token
}

fn default_min_tokens() -> f64 {
    5_000.0
}

fn default_max_tokens() -> f64 {
    500_000.0
}

fn default_min_usd() -> f64 {
    5.0
}

fn default_max_usd() -> f64 {
    1_000.0
}

fn default_batch_count() -> u32 {
    4
}

fn default_batch_delay_token_secs() -> u64 {
    10
}

fn default_batch_delay_usd_secs() -> u64 {
    20
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            threshold_mode: default_threshold_mode(),
            min_tokens: default_min_tokens(),
            max_tokens: default_max_tokens(),
            min_usd: default_min_usd(),
            max_usd: default_max_usd(),
            batch_count: default_batch_count(),
            batch_delay_token_secs: default_batch_delay_token_secs(),
            batch_delay_usd_secs: default_batch_delay_usd_secs(),
        }
    }
}

// ---------------------------------------------------------------------------
// DistributionConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributionConfig {
    #[serde(default = "default_min_holding_usd")]
    pub min_holding_usd: f64,
    /// Whole settlement-asset units.
    #[serde(default = "default_min_payout")]
    pub min_payout: f64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Share of each swap's output distributed to holders, in basis points.
    #[serde(default = "default_holder_share_bps")]
    pub holder_share_bps: u16,
    #[serde(default)]
    pub blacklist: Vec<String>,
}

fn default_min_holding_usd() -> f64 {
    10.0
}

fn default_min_payout() -> f64 {
    0.001
}

fn default_max_retries() -> u32 {
    3
}

fn default_holder_share_bps() -> u16 {
    10_000
}

impl Default for DistributionConfig {
    fn default() -> Self {
        Self {
            min_holding_usd: default_min_holding_usd(),
            min_payout: default_min_payout(),
            max_retries: default_max_retries(),
            holder_share_bps: default_holder_share_bps(),
            blacklist: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// CacheConfig / BreakerConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_holders_ttl")]
    pub holders_ttl_secs: u64,
    #[serde(default = "default_holders_max_age")]
    pub holders_max_age_secs: u64,
    #[serde(default = "default_price_ttl")]
    pub price_ttl_secs: u64,
    #[serde(default = "default_price_max_age")]
    pub price_max_age_secs: u64,
}

fn default_holders_ttl() -> u64 {
    120
}

fn default_holders_max_age() -> u64 {
    1_800
}

fn default_price_ttl() -> u64 {
    60
}

fn default_price_max_age() -> u64 {
    600
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            holders_ttl_secs: default_holders_ttl(),
            holders_max_age_secs: default_holders_max_age(),
            price_ttl_secs: default_price_ttl(),
            price_max_age_secs: default_price_max_age(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_window_secs() -> u64 {
    60
}

fn default_cooldown_secs() -> u64 {
    120
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            window_secs: default_window_secs(),
            cooldown_secs: default_cooldown_secs(),
        }
    }
}

// ---------------------------------------------------------------------------
// UpstreamConfig / StoreConfig / ServerConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Base URL of the indexer/signer gateway (holders, tax, swap, transfer).
    pub gateway_url: String,
    /// Price endpoint; any JSON response, read through `price_pointer`.
    pub price_url: String,
    #[serde(default = "default_price_pointer")]
    pub price_pointer: String,
    /// Name of the env var holding the gateway bearer token, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
}

fn default_price_pointer() -> String {
    "/price".to_string()
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            gateway_url: "http://127.0.0.1:8899".to_string(),
            price_url: "http://127.0.0.1:8899/price".to_string(),
            price_pointer: default_price_pointer(),
            api_key_env: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

fn default_store_path() -> PathBuf {
    PathBuf::from("taxflow.db")
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Status API port; omitted means no API is served.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

// ---------------------------------------------------------------------------
// Config (top-level)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default = "default_token")]
    pub token: AssetConfig,
    #[serde(default = "default_settlement")]
    pub settlement: AssetConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub harvest: HarvestConfig,
    #[serde(default)]
    pub distribution: DistributionConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub breaker: BreakerConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

fn default_version() -> u32 {
    1
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: default_version(),
            token: default_token(),
            settlement: default_settlement(),
            schedule: ScheduleConfig::default(),
            harvest: HarvestConfig::default(),
            distribution: DistributionConfig::default(),
            cache: CacheConfig::default(),
            breaker: BreakerConfig::default(),
            upstream: UpstreamConfig::default(),
            store: StoreConfig::default(),
            server: ServerConfig::default(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(TaxflowError::ConfigNotFound(path.display().to_string()));
        }
        let data = std::fs::read_to_string(path)?;
        let cfg: Config = serde_yaml::from_str(&data)?;
        Ok(cfg)
    }

    /// Load and reject any config with `Error`-level findings.
    pub fn load_valid(path: &Path) -> Result<Self> {
        let cfg = Self::load(path)?;
        cfg.ensure_valid()?;
        Ok(cfg)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let data = serde_yaml::to_string(self)?;
        write_atomically(path, data.as_bytes())
    }

    /// Store path, resolved against the directory holding the config file.
    pub fn store_path(&self, config_path: &Path) -> PathBuf {
        if self.store.path.is_absolute() {
            return self.store.path.clone();
        }
        config_path
            .parent()
            .unwrap_or(Path::new("."))
            .join(&self.store.path)
    }

    pub fn min_harvest_raw(&self) -> Amount {
        to_raw(self.harvest.min_tokens, self.token.decimals)
    }

    pub fn max_harvest_raw(&self) -> Amount {
        to_raw(self.harvest.max_tokens, self.token.decimals)
    }

    pub fn min_payout_raw(&self) -> Amount {
        to_raw(self.distribution.min_payout, self.settlement.decimals)
    }

    pub fn batch_delay(&self) -> Duration {
        match self.harvest.threshold_mode {
            ThresholdMode::Token => Duration::from_secs(self.harvest.batch_delay_token_secs),
            ThresholdMode::Usd => Duration::from_secs(self.harvest.batch_delay_usd_secs),
        }
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();
        let mut error = |message: String| {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message,
            })
        };

        if self.schedule.interval_secs == 0 {
            error("schedule.interval_secs must be greater than 0".to_string());
        }
        if self.schedule.cycles_per_epoch == 0 {
            error("schedule.cycles_per_epoch must be greater than 0".to_string());
        }
        if self.schedule.call_timeout_ms == 0 {
            error("schedule.call_timeout_ms must be greater than 0".to_string());
        }

        let h = &self.harvest;
        for (name, v) in [
            ("min_tokens", h.min_tokens),
            ("max_tokens", h.max_tokens),
            ("min_usd", h.min_usd),
            ("max_usd", h.max_usd),
        ] {
            if !v.is_finite() || v < 0.0 {
                error(format!("harvest.{name} must be a non-negative number"));
            }
        }
        if h.max_tokens < h.min_tokens {
            error(format!(
                "harvest.max_tokens ({}) is below harvest.min_tokens ({})",
                h.max_tokens, h.min_tokens
            ));
        }
        if h.max_usd < h.min_usd {
            error(format!(
                "harvest.max_usd ({}) is below harvest.min_usd ({})",
                h.max_usd, h.min_usd
            ));
        }
        if h.batch_count == 0 {
            error("harvest.batch_count must be at least 1".to_string());
        }

        let d = &self.distribution;
        if !d.min_holding_usd.is_finite() || d.min_holding_usd < 0.0 {
            error("distribution.min_holding_usd must be a non-negative number".to_string());
        }
        if !d.min_payout.is_finite() || d.min_payout < 0.0 {
            error("distribution.min_payout must be a non-negative number".to_string());
        }
        if d.holder_share_bps == 0 || d.holder_share_bps > 10_000 {
            error(format!(
                "distribution.holder_share_bps={} must be within 1..=10000",
                d.holder_share_bps
            ));
        }

        if self.cache.holders_max_age_secs < self.cache.holders_ttl_secs {
            error("cache.holders_max_age_secs must be >= cache.holders_ttl_secs".to_string());
        }
        if self.cache.price_max_age_secs < self.cache.price_ttl_secs {
            error("cache.price_max_age_secs must be >= cache.price_ttl_secs".to_string());
        }
        if self.breaker.failure_threshold == 0 {
            error("breaker.failure_threshold must be at least 1".to_string());
        }

        if self.upstream.gateway_url.trim().is_empty() {
            error("upstream.gateway_url is empty".to_string());
        }
        if !self.upstream.price_pointer.is_empty() && !self.upstream.price_pointer.starts_with('/')
        {
            error(format!(
                "upstream.price_pointer '{}' must be a JSON pointer starting with '/'",
                self.upstream.price_pointer
            ));
        }

        if d.max_retries > 10 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: format!(
                    "distribution.max_retries={} (>10 is unusual)",
                    d.max_retries
                ),
            });
        }
        if h.batch_count > 1
            && self.batch_delay().as_secs() * (h.batch_count as u64 - 1)
                >= self.schedule.interval_secs
        {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: format!(
                    "{} batches with a {}s delay exceed the {}s cycle interval",
                    h.batch_count,
                    self.batch_delay().as_secs(),
                    self.schedule.interval_secs
                ),
            });
        }
        let mut seen = std::collections::HashSet::new();
        for addr in &d.blacklist {
            if !seen.insert(addr.as_str()) {
                warnings.push(ConfigWarning {
                    level: WarnLevel::Warning,
                    message: format!("distribution.blacklist lists '{addr}' more than once"),
                });
            }
        }

        warnings
    }

    pub fn ensure_valid(&self) -> Result<()> {
        let errors: Vec<String> = self
            .validate()
            .into_iter()
            .filter(|w| w.level == WarnLevel::Error)
            .map(|w| w.message)
            .collect();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(TaxflowError::Configuration(errors.join("; ")))
        }
    }
}

/// Write through a tempfile in the target directory so a crash never leaves a
/// half-written config behind.
fn write_atomically(path: &Path, data: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)?;
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(data)?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn default_config_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        Config::default().save(&path).unwrap();
        let parsed = Config::load(&path).unwrap();
        assert_eq!(parsed.schedule.interval_secs, 300);
        assert_eq!(parsed.schedule.cycles_per_epoch, 288);
        assert_eq!(parsed.harvest.batch_count, 4);
    }

    #[test]
    fn minimal_yaml_fills_defaults() {
        let yaml = "upstream:\n  gateway_url: http://gw\n  price_url: http://px\n";
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.upstream.price_pointer, "/price");
        assert_eq!(cfg.distribution.max_retries, 3);
        assert_eq!(cfg.harvest.threshold_mode, ThresholdMode::Token);
        assert!(cfg.server.port.is_none());
    }

    #[test]
    fn load_missing_file_is_config_not_found() {
        let dir = TempDir::new().unwrap();
        let err = Config::load(&dir.path().join("nope.yaml")).unwrap_err();
        assert!(matches!(err, TaxflowError::ConfigNotFound(_)));
    }

    #[test]
    fn default_config_is_valid() {
        let cfg = Config::default();
        assert!(cfg.validate().is_empty(), "{:?}", cfg.validate());
        cfg.ensure_valid().unwrap();
    }

    #[test]
    fn inverted_thresholds_are_fatal() {
        let mut cfg = Config::default();
        cfg.harvest.min_tokens = 100.0;
        cfg.harvest.max_tokens = 10.0;
        let err = cfg.ensure_valid().unwrap_err();
        match err {
            TaxflowError::Configuration(msg) => assert!(msg.contains("max_tokens")),
            other => panic!("expected Configuration, got {other:?}"),
        }
    }

    #[test]
    fn zero_batch_count_is_fatal() {
        let mut cfg = Config::default();
        cfg.harvest.batch_count = 0;
        assert!(cfg.ensure_valid().is_err());
    }

    #[test]
    fn excessive_retries_only_warns() {
        let mut cfg = Config::default();
        cfg.distribution.max_retries = 25;
        let warnings = cfg.validate();
        assert!(warnings
            .iter()
            .any(|w| w.level == WarnLevel::Warning && w.message.contains(">10 is unusual")));
        cfg.ensure_valid().unwrap();
    }

    #[test]
    fn batch_delay_follows_threshold_mode() {
        let mut cfg = Config::default();
        cfg.harvest.batch_delay_token_secs = 7;
        cfg.harvest.batch_delay_usd_secs = 11;
        assert_eq!(cfg.batch_delay(), Duration::from_secs(7));
        cfg.harvest.threshold_mode = ThresholdMode::Usd;
        assert_eq!(cfg.batch_delay(), Duration::from_secs(11));
    }

    #[test]
    fn raw_thresholds_use_asset_decimals() {
        let mut cfg = Config::default();
        cfg.token.decimals = 2;
        cfg.harvest.min_tokens = 5.0;
        cfg.settlement.decimals = 9;
        cfg.distribution.min_payout = 0.5;
        assert_eq!(cfg.min_harvest_raw(), 500);
        assert_eq!(cfg.min_payout_raw(), 500_000_000);
    }

    #[test]
    fn store_path_is_relative_to_config() {
        let cfg = Config::default();
        let p = cfg.store_path(Path::new("/srv/taxflow/taxflow.yaml"));
        assert_eq!(p, PathBuf::from("/srv/taxflow/taxflow.db"));
    }
}
