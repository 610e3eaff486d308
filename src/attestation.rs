//! Provider signer attestation and acknowledgement.
//!
//! Before a user pays a provider or trusts its output, the provider's signing
//! address must be attested (its TEE quote verified, plus GPU evidence when
//! the provider ships any) and recorded on-chain in the user's sub-account.
//!
//! # States
//!
//! | State | Meaning |
//! |-------|---------|
//! | `Unacknowledged` | No on-chain signer recorded |
//! | `Verifying` | Quote verification or acknowledgement in flight |
//! | `Acknowledged` | Signer recorded on-chain and cached |

use crate::cache::Cache;
use crate::chain::ContractCall;
use crate::config::AttestationConfig;
use crate::error::{Error, Result};
use crate::ledger::LedgerTransferCoordinator;
use crate::provider::{ProviderClient, QuoteVerifier, ServiceRegistry};
use crate::types::Address;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Acknowledgement state of one provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttestationState {
    /// No signer acknowledged.
    Unacknowledged,
    /// Verification or acknowledgement in progress.
    Verifying,
    /// Signer acknowledged on-chain.
    Acknowledged,
}

impl AttestationState {
    /// Human-readable description of the state.
    #[must_use]
    pub const fn description(&self) -> &'static str {
        match self {
            Self::Unacknowledged => "signer not acknowledged",
            Self::Verifying => "verifying provider attestation",
            Self::Acknowledged => "signer acknowledged",
        }
    }
}

impl fmt::Display for AttestationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// Verifies providers and acknowledges their signers.
pub struct ProviderAttestor {
    ledger: Arc<LedgerTransferCoordinator>,
    services: Arc<ServiceRegistry>,
    client: Arc<dyn ProviderClient>,
    verifier: Option<Arc<dyn QuoteVerifier>>,
    cache: Arc<dyn Cache>,
    states: Mutex<HashMap<Address, AttestationState>>,
    config: AttestationConfig,
    ttl: Duration,
}

impl ProviderAttestor {
    /// Create an attestor.
    ///
    /// Without a `verifier`, previously acknowledged signers are still
    /// honoured but no new provider can be acknowledged.
    #[must_use]
    pub fn new(
        ledger: Arc<LedgerTransferCoordinator>,
        services: Arc<ServiceRegistry>,
        client: Arc<dyn ProviderClient>,
        verifier: Option<Arc<dyn QuoteVerifier>>,
        cache: Arc<dyn Cache>,
        config: AttestationConfig,
        ttl: Duration,
    ) -> Self {
        Self {
            ledger,
            services,
            client,
            verifier,
            cache,
            states: Mutex::new(HashMap::new()),
            config,
            ttl,
        }
    }

    /// Current state of `provider` in this broker.
    #[must_use]
    pub fn state(&self, provider: Address) -> AttestationState {
        self.states
            .lock()
            .get(&provider)
            .copied()
            .unwrap_or(AttestationState::Unacknowledged)
    }

    fn set_state(&self, provider: Address, state: AttestationState) {
        debug!("Provider {provider}: {state}");
        self.states.lock().insert(provider, state);
    }

    fn key(&self, provider: Address) -> String {
        format!(
            "signing-address:{}:{provider}",
            self.services.service_type()
        )
    }

    async fn cached_signer(&self, provider: Address) -> Result<Option<Address>> {
        match self.cache.get(&self.key(provider)).await? {
            Some(raw) => raw
                .parse::<Address>()
                .map(Some)
                .map_err(|e| Error::Cache(format!("Corrupt signing address for {provider}: {e}"))),
            None => Ok(None),
        }
    }

    async fn remember_signer(&self, provider: Address, signer: Address) -> Result<()> {
        self.cache
            .set(&self.key(provider), &signer.to_string(), Some(self.ttl))
            .await
    }

    /// Fetch the provider's signing address.
    ///
    /// Returns `(verified, address)`. With `verify == false` a cached
    /// address (only attested addresses are cached) is returned as verified;
    /// otherwise the quote is fetched and, if `verify` is set, checked.
    ///
    /// # Errors
    ///
    /// Fails if the provider or the verification service is unreachable, or
    /// verification is requested without a configured verifier.
    pub async fn get_signing_address(
        &self,
        provider: Address,
        verify: bool,
    ) -> Result<(bool, Address)> {
        if !verify {
            if let Some(signer) = self.cached_signer(provider).await? {
                return Ok((true, signer));
            }
        }

        let service = self.services.get(provider).await?;
        let quote = self.client.quote(&service).await?;
        if !verify {
            return Ok((false, quote.signing_address));
        }

        let verifier = self.verifier.as_ref().ok_or_else(|| {
            Error::Config("attestation.verifier_url is not configured".to_string())
        })?;
        if !verifier.verify(&quote).await? {
            warn!("Quote from {provider} failed verification");
            return Ok((false, quote.signing_address));
        }

        if let Some(payload) = &quote.gpu_payload {
            if self.config.require_gpu_attestation
                && !self.client.verify_gpu(&service, payload).await?
            {
                warn!("GPU attestation from {provider} failed verification");
                return Ok((false, quote.signing_address));
            }
        }

        info!(
            "Verified {provider} signing address {}",
            quote.signing_address
        );
        self.remember_signer(provider, quote.signing_address).await?;
        Ok((true, quote.signing_address))
    }

    /// Verify `provider` and record its signer in the user's sub-account.
    ///
    /// Idempotent: no transaction is sent when the on-chain signer already
    /// matches. A missing sub-account is created with a zero transfer.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Verification`] when the attestation is rejected, or
    /// the underlying error when the quote or the transaction fails.
    pub async fn acknowledge(&self, provider: Address) -> Result<Address> {
        self.set_state(provider, AttestationState::Verifying);
        match self.acknowledge_inner(provider).await {
            Ok(signer) => {
                self.set_state(provider, AttestationState::Acknowledged);
                Ok(signer)
            }
            Err(e) => {
                self.set_state(provider, AttestationState::Unacknowledged);
                Err(e)
            }
        }
    }

    async fn acknowledge_inner(&self, provider: Address) -> Result<Address> {
        let service_type = self.services.service_type();
        let (verified, signer) = self.get_signing_address(provider, true).await?;
        if !verified {
            return Err(Error::Verification(format!(
                "attestation of provider {provider} was rejected"
            )));
        }

        let account = match self.ledger.get_account(provider, service_type).await? {
            Some(account) => account,
            None => {
                info!("No {service_type} sub-account with {provider}; creating one");
                self.ledger.transfer(provider, service_type, 0).await?;
                self.ledger
                    .get_account(provider, service_type)
                    .await?
                    .ok_or_else(|| {
                        Error::Transaction(format!(
                            "sub-account with {provider} missing after creation"
                        ))
                    })?
            }
        };

        if account.provider_signer == Some(signer) {
            info!("Signer {signer} of {provider} already acknowledged");
            return Ok(signer);
        }

        self.ledger
            .submit(&ContractCall::AcknowledgeProviderSigner {
                provider,
                service_type,
                signer,
            })
            .await?;
        info!("Acknowledged signer {signer} of {provider}");
        Ok(signer)
    }

    /// The acknowledged signer of `provider`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Precondition`] if no signer is acknowledged on-chain.
    pub async fn ensure_acknowledged(&self, provider: Address) -> Result<Address> {
        if self.state(provider) == AttestationState::Acknowledged {
            if let Some(signer) = self.cached_signer(provider).await? {
                return Ok(signer);
            }
        }

        let service_type = self.services.service_type();
        let signer = self
            .ledger
            .get_account(provider, service_type)
            .await?
            .and_then(|account| account.provider_signer)
            .ok_or_else(|| {
                Error::Precondition(format!(
                    "Provider {provider} signer is not acknowledged; acknowledge it first"
                ))
            })?;

        self.remember_signer(provider, signer).await?;
        self.set_state(provider, AttestationState::Acknowledged);
        Ok(signer)
    }
}
