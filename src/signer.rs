//! Billing headers for inference requests.
//!
//! Each request carries a signed [`Request`] record claiming
//! `input_fee + output_fee_so_far`, with a fresh nonce, plus a correlation
//! hash the provider uses to match the request to its settlement.

use crate::chain::SignedRequest;
use crate::crypto::{request_hash, SettlementKey, SIGNATURE_LEN};
use crate::error::{Error, Result};
use crate::fee::compute_fee;
use crate::ledger::LedgerTransferCoordinator;
use crate::nonce::NonceAllocator;
use crate::types::{Address, Request, Service, ServiceType};
use crate::wallet::Wallet;
use parking_lot::Mutex;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// User address header.
pub const HEADER_ADDRESS: &str = "Address";
/// Total fee header.
pub const HEADER_FEE: &str = "Fee";
/// Input fee header.
pub const HEADER_INPUT_FEE: &str = "Input-Fee";
/// Nonce header.
pub const HEADER_NONCE: &str = "Nonce";
/// Correlation hash header.
pub const HEADER_REQUEST_HASH: &str = "Request-Hash";
/// Settlement signature header.
pub const HEADER_SIGNATURE: &str = "Signature";
/// Proxy routing header.
pub const HEADER_VLLM_PROXY: &str = "VLLM-Proxy";

/// The billing header set attached to one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BillingHeaders {
    /// Provider the request is addressed to (not sent as a header).
    pub provider: Address,
    /// Paying user.
    pub address: Address,
    /// Total fee claimed.
    pub fee: u128,
    /// Input part of the fee.
    pub input_fee: u128,
    /// Request nonce.
    pub nonce: u64,
    /// SHA-256 over `nonce || user || provider`.
    pub request_hash: [u8; 32],
    /// Settlement signature over the 60-byte record.
    pub signature: [u8; SIGNATURE_LEN],
    /// Proxy routing flag.
    pub vllm_proxy: bool,
}

impl BillingHeaders {
    /// The signed record.
    #[must_use]
    pub fn request(&self) -> Request {
        Request {
            nonce: self.nonce,
            fee: self.fee,
            user: self.address,
            provider: self.provider,
        }
    }

    /// The record with its signature, as submitted for settlement.
    #[must_use]
    pub fn signed_request(&self) -> SignedRequest {
        SignedRequest {
            request: self.request(),
            signature: self.signature,
        }
    }

    /// Header name/value pairs.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the signature cannot be encoded.
    pub fn pairs(&self) -> Result<Vec<(&'static str, String)>> {
        let signature = serde_json::to_string(&self.signature.to_vec())
            .map_err(|e| Error::Serialization(format!("Failed to encode signature: {e}")))?;
        Ok(vec![
            (HEADER_ADDRESS, self.address.to_string()),
            (HEADER_FEE, self.fee.to_string()),
            (HEADER_INPUT_FEE, self.input_fee.to_string()),
            (HEADER_NONCE, self.nonce.to_string()),
            (
                HEADER_REQUEST_HASH,
                format!("0x{}", hex::encode(self.request_hash)),
            ),
            (HEADER_SIGNATURE, signature),
            (HEADER_VLLM_PROXY, self.vllm_proxy.to_string()),
        ])
    }

    /// Headers ready to attach to an HTTP request.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if a value is not a valid header.
    pub fn to_header_map(&self) -> Result<HeaderMap> {
        let mut map = HeaderMap::new();
        for (name, value) in self.pairs()? {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| Error::Serialization(format!("invalid header name {name}: {e}")))?;
            let value = HeaderValue::from_str(&value)
                .map_err(|e| Error::Serialization(format!("invalid header value: {e}")))?;
            map.insert(name, value);
        }
        Ok(map)
    }
}

struct CachedKey {
    key: SettlementKey,
    expires_at: Instant,
}

/// Builds signed billing headers for inference requests.
pub struct RequestSigner {
    ledger: Arc<LedgerTransferCoordinator>,
    nonces: NonceAllocator,
    wallet: Arc<Wallet>,
    key: Mutex<Option<CachedKey>>,
    key_ttl: Duration,
    vllm_proxy: bool,
}

impl RequestSigner {
    /// Create a signer.
    #[must_use]
    pub fn new(
        ledger: Arc<LedgerTransferCoordinator>,
        nonces: NonceAllocator,
        wallet: Arc<Wallet>,
        key_ttl: Duration,
        vllm_proxy: bool,
    ) -> Self {
        Self {
            ledger,
            nonces,
            wallet,
            key: Mutex::new(None),
            key_ttl,
            vllm_proxy,
        }
    }

    /// Build the billing headers for sending `content` to `service`.
    ///
    /// Consumes a nonce even if the request is never sent.
    ///
    /// # Errors
    ///
    /// - [`Error::Precondition`] if there is no sub-account or its provider
    ///   signer is not acknowledged;
    /// - [`Error::Verification`] if the sealed settlement key does not match
    ///   the registered public key;
    /// - [`Error::Busy`] if no nonce could be allocated.
    pub async fn build_headers(
        &self,
        service: &Service,
        content: &str,
        output_fee: u128,
    ) -> Result<BillingHeaders> {
        let key = self.settlement_key(service.provider).await?;
        let nonce = self.nonces.next_nonce().await?;

        let input_fee = compute_fee(content, service.input_price);
        let request = Request {
            nonce,
            fee: input_fee.saturating_add(output_fee),
            user: self.wallet.address(),
            provider: service.provider,
        };
        trace!(
            "Signing request nonce {nonce} fee {} for {}",
            request.fee,
            service.provider
        );

        Ok(BillingHeaders {
            provider: service.provider,
            address: request.user,
            fee: request.fee,
            input_fee,
            nonce,
            request_hash: request_hash(&request),
            signature: key.sign_request(&request),
            vllm_proxy: self.vllm_proxy,
        })
    }

    /// Drop the cached settlement key.
    pub fn forget_key(&self) {
        *self.key.lock() = None;
    }

    async fn settlement_key(&self, provider: Address) -> Result<SettlementKey> {
        let cached = self
            .key
            .lock()
            .as_ref()
            .filter(|cached| cached.expires_at > Instant::now())
            .map(|cached| cached.key.clone());
        if let Some(key) = cached {
            return Ok(key);
        }

        let account = self
            .ledger
            .get_account(provider, ServiceType::Inference)
            .await?
            .ok_or_else(|| {
                Error::Precondition(format!(
                    "No inference sub-account with {provider}; transfer funds to the provider first"
                ))
            })?;
        if account.provider_signer.is_none() {
            return Err(Error::Precondition(format!(
                "Provider {provider} signer is not acknowledged; acknowledge it first"
            )));
        }

        let sealed = if account.additional_info.is_empty() {
            self.ledger.get_ledger().await?.additional_info
        } else {
            account.additional_info
        };
        let key = SettlementKey::open(&sealed, &self.wallet.sealing_secret())?;
        if key.public_key() != account.signer_pub_key {
            return Err(Error::Verification(
                "settlement key does not match the registered public key".to_string(),
            ));
        }

        debug!("Opened settlement key for {}", self.wallet.address());
        *self.key.lock() = Some(CachedKey {
            key: key.clone(),
            expires_at: Instant::now() + self.key_ttl,
        });
        Ok(key)
    }
}
