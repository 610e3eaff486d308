//! Configuration for compute-broker.

use crate::types::amount;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Broker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Root directory for persisted broker state (nonce counter).
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Transaction submission and gas escalation.
    #[serde(default)]
    pub gas: GasConfig,

    /// Fee accounting and top-up thresholds.
    #[serde(default)]
    pub fees: FeeConfig,

    /// Nonce allocation lock.
    #[serde(default)]
    pub nonce: NonceConfig,

    /// Cache lifetimes.
    #[serde(default)]
    pub cache: CacheConfig,

    /// Provider attestation.
    #[serde(default)]
    pub attestation: AttestationConfig,

    /// HTTP client settings.
    #[serde(default)]
    pub http: HttpConfig,

    /// Log level.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Transaction submission configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GasConfig {
    /// Starting gas price. When unset, the chain's suggestion is used.
    #[serde(default, with = "amount::option")]
    pub gas_price: Option<u128>,

    /// Ceiling for gas-price escalation. When unset, only `max_attempts` bounds retries.
    #[serde(default, with = "amount::option")]
    pub max_gas_price: Option<u128>,

    /// Escalation step in percent of the previous price (110 = +10%).
    #[serde(default = "default_step_percent")]
    pub step_percent: u32,

    /// Maximum number of submission attempts for one logical action.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Confirmation timeout per attempt, in seconds.
    #[serde(default = "default_tx_timeout")]
    pub tx_timeout_secs: u64,

    /// Pending-vs-confirmed nonce gap above which a timed-out transaction is
    /// considered stuck and the next attempt reuses the confirmed nonce.
    #[serde(default = "default_max_nonce_gap")]
    pub max_nonce_gap: u64,
}

impl GasConfig {
    /// Confirmation timeout per attempt.
    #[must_use]
    pub fn tx_timeout(&self) -> Duration {
        Duration::from_secs(self.tx_timeout_secs)
    }
}

impl Default for GasConfig {
    fn default() -> Self {
        Self {
            gas_price: None,
            max_gas_price: None,
            step_percent: default_step_percent(),
            max_attempts: default_max_attempts(),
            tx_timeout_secs: default_tx_timeout(),
            max_nonce_gap: default_max_nonce_gap(),
        }
    }
}

const fn default_step_percent() -> u32 {
    110
}

const fn default_max_attempts() -> u32 {
    10
}

const fn default_tx_timeout() -> u64 {
    300
}

const fn default_max_nonce_gap() -> u64 {
    5
}

/// Fee accounting configuration.
///
/// All thresholds are multiples of a provider's `input_price + output_price`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeeConfig {
    /// Unchecked spend after which the account is re-read.
    #[serde(default = "default_check_multiplier", with = "amount")]
    pub check_multiplier: u128,

    /// Available balance below which a top-up is triggered.
    #[serde(default = "default_trigger_multiplier", with = "amount")]
    pub trigger_multiplier: u128,

    /// Available balance a top-up restores.
    #[serde(default = "default_target_multiplier", with = "amount")]
    pub target_multiplier: u128,
}

impl Default for FeeConfig {
    fn default() -> Self {
        Self {
            check_multiplier: default_check_multiplier(),
            trigger_multiplier: default_trigger_multiplier(),
            target_multiplier: default_target_multiplier(),
        }
    }
}

const fn default_check_multiplier() -> u128 {
    100_000
}

const fn default_trigger_multiplier() -> u128 {
    500_000
}

const fn default_target_multiplier() -> u128 {
    1_000_000
}

/// Nonce lock configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NonceConfig {
    /// Lock expiry in milliseconds; a crashed holder frees the lock after this.
    #[serde(default = "default_lock_ttl_ms")]
    pub lock_ttl_ms: u64,

    /// Poll interval while the lock is held by someone else, in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Number of polls before giving up with a busy error.
    #[serde(default = "default_lock_retries")]
    pub lock_retries: u32,
}

impl Default for NonceConfig {
    fn default() -> Self {
        Self {
            lock_ttl_ms: default_lock_ttl_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            lock_retries: default_lock_retries(),
        }
    }
}

const fn default_lock_ttl_ms() -> u64 {
    5_000
}

const fn default_poll_interval_ms() -> u64 {
    10
}

const fn default_lock_retries() -> u32 {
    500
}

/// Cache lifetimes, in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Lifetime of fee counters and cached service info.
    #[serde(default = "default_fee_ttl")]
    pub fee_ttl_secs: u64,

    /// Lifetime of the opened settlement key.
    #[serde(default = "default_key_ttl")]
    pub settlement_key_ttl_secs: u64,

    /// Lifetime of attested provider signing addresses.
    #[serde(default = "default_key_ttl")]
    pub signing_address_ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            fee_ttl_secs: default_fee_ttl(),
            settlement_key_ttl_secs: default_key_ttl(),
            signing_address_ttl_secs: default_key_ttl(),
        }
    }
}

const fn default_fee_ttl() -> u64 {
    3_600
}

const fn default_key_ttl() -> u64 {
    86_400
}

/// Provider attestation configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttestationConfig {
    /// URL of the attestation-verification service quotes are posted to.
    #[serde(default)]
    pub verifier_url: Option<String>,

    /// Require a successful GPU attestation check when a provider ships a GPU payload.
    #[serde(default = "default_true")]
    pub require_gpu_attestation: bool,

    /// Routing flag sent in the `VLLM-Proxy` header.
    #[serde(default = "default_true")]
    pub vllm_proxy: bool,
}

impl Default for AttestationConfig {
    fn default() -> Self {
        Self {
            verifier_url: None,
            require_gpu_attestation: true,
            vllm_proxy: true,
        }
    }
}

const fn default_true() -> bool {
    true
}

/// HTTP client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Request timeout in seconds.
    #[serde(default = "default_http_timeout")]
    pub timeout_secs: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_http_timeout(),
        }
    }
}

const fn default_http_timeout() -> u64 {
    30
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            gas: GasConfig::default(),
            fees: FeeConfig::default(),
            nonce: NonceConfig::default(),
            cache: CacheConfig::default(),
            attestation: AttestationConfig::default(),
            http: HttpConfig::default(),
            log_level: default_log_level(),
        }
    }
}

impl BrokerConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| crate::Error::Config(e.to_string()))
    }

    /// Save configuration to a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn to_file(&self, path: &std::path::Path) -> crate::Result<()> {
        let content =
            toml::to_string_pretty(self).map_err(|e| crate::Error::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Check internal consistency.
    ///
    /// # Errors
    ///
    /// Returns a configuration error describing the first violated rule.
    pub fn validate(&self) -> crate::Result<()> {
        if self.gas.step_percent <= 100 {
            return Err(crate::Error::Config(format!(
                "gas.step_percent must be above 100, got {}",
                self.gas.step_percent
            )));
        }
        if self.gas.max_attempts == 0 {
            return Err(crate::Error::Config(
                "gas.max_attempts must be at least 1".to_string(),
            ));
        }
        if let (Some(start), Some(max)) = (self.gas.gas_price, self.gas.max_gas_price) {
            if start > max {
                return Err(crate::Error::Config(format!(
                    "gas.gas_price {start} exceeds gas.max_gas_price {max}"
                )));
            }
        }
        let fees = &self.fees;
        if !(fees.check_multiplier > 0
            && fees.trigger_multiplier > 0
            && fees.trigger_multiplier <= fees.target_multiplier)
        {
            return Err(crate::Error::Config(format!(
                "fee thresholds must satisfy 0 < check, 0 < trigger <= target (got {} / {} / {})",
                fees.check_multiplier, fees.trigger_multiplier, fees.target_multiplier
            )));
        }
        if self.nonce.lock_retries == 0 {
            return Err(crate::Error::Config(
                "nonce.lock_retries must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_data_dir() -> PathBuf {
    directories::ProjectDirs::from("", "", "compute-broker").map_or_else(
        || PathBuf::from(".compute-broker"),
        |dirs| dirs.data_dir().to_path_buf(),
    )
}

fn default_log_level() -> String {
    "info".to_string()
}
