//! Core data model shared by every broker component.
//!
//! Amounts (balances, prices, fees) are `u128` in the smallest unit. In JSON
//! and TOML they are carried as decimal strings, see [`amount`].

use crate::error::{Error, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Length of an EVM address in bytes.
pub const ADDRESS_LEN: usize = 20;

/// Serialized length of a [`Request`]: 8 (nonce) + 16 (fee) + 20 + 20.
pub const REQUEST_LEN: usize = 60;

/// A 20-byte EVM address (a u160 value, stored big-endian as usual).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Address(pub [u8; ADDRESS_LEN]);

impl Address {
    /// The zero address.
    pub const ZERO: Self = Self([0u8; ADDRESS_LEN]);

    /// Create an address from raw big-endian bytes.
    #[must_use]
    pub const fn new(bytes: [u8; ADDRESS_LEN]) -> Self {
        Self(bytes)
    }

    /// Raw big-endian bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; ADDRESS_LEN] {
        &self.0
    }

    /// The u160 value in little-endian byte order.
    #[must_use]
    pub fn to_le_bytes(&self) -> [u8; ADDRESS_LEN] {
        let mut out = self.0;
        out.reverse();
        out
    }

    /// Build an address from its little-endian u160 encoding.
    #[must_use]
    pub fn from_le_bytes(mut bytes: [u8; ADDRESS_LEN]) -> Self {
        bytes.reverse();
        Self(bytes)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({self})")
    }
}

impl FromStr for Address {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        crate::wallet::parse_address(s)
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Decimal-string serde for `u128` amounts.
pub mod amount {
    use serde::{Deserialize, Deserializer, Serializer};

    /// Serialize a `u128` as a decimal string.
    ///
    /// # Errors
    ///
    /// Returns the serializer's error.
    #[allow(clippy::trivially_copy_pass_by_ref)]
    pub fn serialize<S: Serializer>(value: &u128, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    /// Deserialize a `u128` from a decimal string.
    ///
    /// # Errors
    ///
    /// Returns an error if the string is not a valid decimal `u128`.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u128, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }

    /// Same as the parent module for `Option<u128>`.
    pub mod option {
        use serde::{Deserialize, Deserializer, Serializer};

        /// Serialize an optional `u128` as an optional decimal string.
        ///
        /// # Errors
        ///
        /// Returns the serializer's error.
        #[allow(clippy::ref_option)]
        pub fn serialize<S: Serializer>(
            value: &Option<u128>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match value {
                Some(v) => serializer.serialize_some(&v.to_string()),
                None => serializer.serialize_none(),
            }
        }

        /// Deserialize an optional decimal string into an optional `u128`.
        ///
        /// # Errors
        ///
        /// Returns an error if the string is not a valid decimal `u128`.
        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<u128>, D::Error> {
            Option::<String>::deserialize(deserializer)?
                .map(|s| s.parse().map_err(serde::de::Error::custom))
                .transpose()
        }
    }
}

/// Kind of service a sub-account pays for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServiceType {
    /// Per-request inference.
    Inference,
    /// Per-job fine-tuning.
    FineTuning,
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inference => f.write_str("inference"),
            Self::FineTuning => f.write_str("fine-tuning"),
        }
    }
}

/// A fee-carrying settlement request, signed by the user's settlement key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Request {
    /// Per-user strictly increasing nonce.
    pub nonce: u64,
    /// Total fee claimed by this request.
    pub fee: u128,
    /// User settlement address.
    pub user: Address,
    /// Provider address.
    pub provider: Address,
}

impl Request {
    /// Serialize to the fixed 60-byte little-endian-per-field layout.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; REQUEST_LEN] {
        let mut out = [0u8; REQUEST_LEN];
        out[0..8].copy_from_slice(&self.nonce.to_le_bytes());
        out[8..24].copy_from_slice(&self.fee.to_le_bytes());
        out[24..44].copy_from_slice(&self.user.to_le_bytes());
        out[44..60].copy_from_slice(&self.provider.to_le_bytes());
        out
    }

    /// Parse the fixed 60-byte layout.
    ///
    /// # Errors
    ///
    /// Returns a precondition error if `bytes` is not exactly 60 bytes long.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != REQUEST_LEN {
            return Err(Error::Precondition(format!(
                "invalid request length: expected {REQUEST_LEN} bytes, got {}",
                bytes.len()
            )));
        }

        let mut nonce = [0u8; 8];
        nonce.copy_from_slice(&bytes[0..8]);
        let mut fee = [0u8; 16];
        fee.copy_from_slice(&bytes[8..24]);
        let mut user = [0u8; ADDRESS_LEN];
        user.copy_from_slice(&bytes[24..44]);
        let mut provider = [0u8; ADDRESS_LEN];
        provider.copy_from_slice(&bytes[44..60]);

        Ok(Self {
            nonce: u64::from_le_bytes(nonce),
            fee: u128::from_le_bytes(fee),
            user: Address::from_le_bytes(user),
            provider: Address::from_le_bytes(provider),
        })
    }
}

/// A provider-produced artifact referenced on-chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deliverable {
    /// Root hash of the content in the storage network.
    #[serde(with = "hex_bytes32")]
    pub model_root_hash: [u8; 32],
    /// AEAD session key sealed to the user's public key.
    #[serde(with = "hex_vec")]
    pub encrypted_secret: Vec<u8>,
    /// Set once by the client after the content was fetched.
    pub acknowledged: bool,
}

/// Per (user, provider, service) sub-account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    /// Owning user.
    pub user: Address,
    /// Provider this account pays.
    pub provider: Address,
    /// Funds locked in this account.
    #[serde(with = "amount")]
    pub balance: u128,
    /// Part of `balance` already requested back; not usable for settlement.
    #[serde(with = "amount")]
    pub pending_refund: u128,
    /// Highest settled request nonce.
    pub nonce: u64,
    /// User settlement verifying key (Ed25519).
    #[serde(with = "hex_bytes32")]
    pub signer_pub_key: [u8; 32],
    /// Acknowledged provider signing address, if any.
    pub provider_signer: Option<Address>,
    /// Sealed settlement private key.
    #[serde(with = "hex_vec")]
    pub additional_info: Vec<u8>,
    /// Fine-tuning deliverables, oldest first.
    #[serde(default)]
    pub deliverables: Vec<Deliverable>,
}

impl Account {
    /// Funds usable for settlement (`balance - pending_refund`).
    #[must_use]
    pub fn available(&self) -> u128 {
        self.balance.saturating_sub(self.pending_refund)
    }
}

/// The user's top-level on-chain balance record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ledger {
    /// Owning user.
    pub user: Address,
    /// Total funds owned in the ledger and its sub-accounts.
    #[serde(with = "amount")]
    pub total_balance: u128,
    /// Funds still in the ledger, free to transfer.
    #[serde(with = "amount")]
    pub available_balance: u128,
    /// User settlement verifying key registered with the ledger.
    #[serde(with = "hex_bytes32")]
    pub settlement_pub_key: [u8; 32],
    /// Sealed settlement private key.
    #[serde(with = "hex_vec")]
    pub additional_info: Vec<u8>,
    /// Providers with an inference sub-account.
    pub inference_providers: Vec<Address>,
    /// Providers with a fine-tuning sub-account.
    pub fine_tuning_providers: Vec<Address>,
}

impl Ledger {
    /// Providers holding a sub-account of the given service type.
    #[must_use]
    pub fn providers(&self, service_type: ServiceType) -> &[Address] {
        match service_type {
            ServiceType::Inference => &self.inference_providers,
            ServiceType::FineTuning => &self.fine_tuning_providers,
        }
    }
}

/// A provider's on-chain service registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    /// Provider address.
    pub provider: Address,
    /// Service kind.
    pub service_type: ServiceType,
    /// Base URL of the provider endpoint.
    pub url: String,
    /// Model served or trained.
    pub model: String,
    /// Price per input byte.
    #[serde(with = "amount")]
    pub input_price: u128,
    /// Price per output byte.
    #[serde(with = "amount")]
    pub output_price: u128,
    /// Attestation scheme advertised by the provider (e.g. "TeeML").
    pub verifiability: String,
}

impl Service {
    /// Sum of input and output price, the unit of all top-up thresholds.
    #[must_use]
    pub fn price_sum(&self) -> u128 {
        self.input_price.saturating_add(self.output_price)
    }
}

mod hex_vec {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s.trim_start_matches("0x")).map_err(serde::de::Error::custom)
    }
}

mod hex_bytes32 {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<[u8; 32], D::Error> {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(s.trim_start_matches("0x")).map_err(serde::de::Error::custom)?;
        bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("expected 32 bytes"))
    }
}
