//! Broker facade wiring every component together.
//!
//! A [`BrokerContext`] owns the configuration and both caches. A
//! [`BrokerBuilder`] turns a context, a chain handle and the user's wallet into
//! a [`Broker`] with one sub-broker per service type:
//!
//! - [`InferenceBroker`]: billing headers, output-fee accounting and response
//!   verification for per-request inference;
//! - [`FineTuningBroker`]: signer acknowledgement and deliverable retrieval
//!   for fine-tuning jobs.

use crate::attestation::ProviderAttestor;
use crate::cache::{Cache, FileCache, MemoryCache};
use crate::chain::LedgerChain;
use crate::config::BrokerConfig;
use crate::deliverable::{DeliverableRetriever, CHUNK_LEN};
use crate::error::{Error, Result};
use crate::fee::FeeAccountant;
use crate::ledger::LedgerTransferCoordinator;
use crate::nonce::NonceAllocator;
use crate::provider::{
    ContentFetcher, HttpProviderClient, HttpQuoteVerifier, ProviderClient, QuoteVerifier,
    ServiceRegistry,
};
use crate::signer::{BillingHeaders, RequestSigner};
use crate::types::{Address, Service, ServiceType};
use crate::verifier::ResponseVerifier;
use crate::wallet::Wallet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Directory under `data_dir` holding the persistent cache.
pub const CACHE_DIR: &str = "cache";

/// Configuration plus the persistent and ephemeral caches of one broker.
#[derive(Clone)]
pub struct BrokerContext {
    config: BrokerConfig,
    persistent: Arc<dyn Cache>,
    ephemeral: Arc<dyn Cache>,
}

impl BrokerContext {
    /// Validate `config` and open the file-backed cache under its data directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the cache
    /// directory cannot be created.
    pub async fn init(config: BrokerConfig) -> Result<Self> {
        config.validate()?;
        let persistent = FileCache::open(config.data_dir.join(CACHE_DIR)).await?;
        info!("Broker state in {}", persistent.root().display());
        Ok(Self {
            config,
            persistent: Arc::new(persistent),
            ephemeral: Arc::new(MemoryCache::new()),
        })
    }

    /// A context whose persistent cache lives only in memory.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn in_memory(config: BrokerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            persistent: Arc::new(MemoryCache::new()),
            ephemeral: Arc::new(MemoryCache::new()),
        })
    }

    /// The configuration.
    #[must_use]
    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Cache for state that must survive restarts.
    #[must_use]
    pub fn persistent_cache(&self) -> &Arc<dyn Cache> {
        &self.persistent
    }

    /// Cache for advisory state.
    #[must_use]
    pub fn ephemeral_cache(&self) -> &Arc<dyn Cache> {
        &self.ephemeral
    }

    /// Drop all advisory state. The persistent nonce counter is kept.
    ///
    /// # Errors
    ///
    /// Returns a cache error if the ephemeral cache cannot be cleared.
    pub async fn teardown(&self) -> Result<()> {
        debug!("Clearing ephemeral broker state");
        self.ephemeral.clear().await
    }

    fn fee_ttl(&self) -> Duration {
        Duration::from_secs(self.config.cache.fee_ttl_secs)
    }
}

/// Builder for a [`Broker`].
pub struct BrokerBuilder {
    context: BrokerContext,
    chain: Option<Arc<dyn LedgerChain>>,
    client: Option<Arc<dyn ProviderClient>>,
    verifier: Option<Arc<dyn QuoteVerifier>>,
    fetcher: Option<Arc<dyn ContentFetcher>>,
    chunk_len: usize,
}

impl BrokerBuilder {
    /// Start building a broker over `context`.
    #[must_use]
    pub fn new(context: BrokerContext) -> Self {
        Self {
            context,
            chain: None,
            client: None,
            verifier: None,
            fetcher: None,
            chunk_len: CHUNK_LEN,
        }
    }

    /// Chain handle sending as the user's wallet (required).
    #[must_use]
    pub fn with_chain(mut self, chain: Arc<dyn LedgerChain>) -> Self {
        self.chain = Some(chain);
        self
    }

    /// Provider client. Defaults to [`HttpProviderClient`].
    #[must_use]
    pub fn with_provider_client(mut self, client: Arc<dyn ProviderClient>) -> Self {
        self.client = Some(client);
        self
    }

    /// Quote verifier. Defaults to [`HttpQuoteVerifier`] when
    /// `attestation.verifier_url` is configured.
    #[must_use]
    pub fn with_quote_verifier(mut self, verifier: Arc<dyn QuoteVerifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    /// Storage-network fetcher used to download deliverables.
    #[must_use]
    pub fn with_content_fetcher(mut self, fetcher: Arc<dyn ContentFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    /// Ciphertext chunk length of fine-tuning deliverables.
    #[must_use]
    pub fn with_chunk_len(mut self, chunk_len: usize) -> Self {
        self.chunk_len = chunk_len;
        self
    }

    /// Build the broker for `wallet`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if no chain was given, the chain
    /// handle does not send as `wallet`, or an HTTP client cannot be built.
    pub fn build(self, wallet: Wallet) -> Result<Broker> {
        let chain = self
            .chain
            .ok_or_else(|| Error::Config("a chain handle is required".to_string()))?;
        if chain.sender() != wallet.address() {
            return Err(Error::Config(format!(
                "chain handle sends as {} but the wallet is {}",
                chain.sender(),
                wallet.address()
            )));
        }

        let context = self.context;
        let config = context.config().clone();
        let wallet = Arc::new(wallet);
        let client: Arc<dyn ProviderClient> = match self.client {
            Some(client) => client,
            None => Arc::new(HttpProviderClient::new(&config.http)?),
        };
        let verifier: Option<Arc<dyn QuoteVerifier>> =
            match (self.verifier, &config.attestation.verifier_url) {
                (Some(verifier), _) => Some(verifier),
                (None, Some(url)) => {
                    Some(Arc::new(HttpQuoteVerifier::new(url.clone(), &config.http)?))
                }
                (None, None) => None,
            };

        let ledger = Arc::new(LedgerTransferCoordinator::new(
            chain.clone(),
            wallet.clone(),
            config.gas.clone(),
        ));
        let signing_ttl = Duration::from_secs(config.cache.signing_address_ttl_secs);
        let attestor = |services: &Arc<ServiceRegistry>| {
            Arc::new(ProviderAttestor::new(
                ledger.clone(),
                services.clone(),
                client.clone(),
                verifier.clone(),
                context.ephemeral_cache().clone(),
                config.attestation.clone(),
                signing_ttl,
            ))
        };

        let registry = |service_type| {
            Arc::new(ServiceRegistry::new(
                chain.clone(),
                context.ephemeral_cache().clone(),
                service_type,
                context.fee_ttl(),
            ))
        };
        let inference_services = registry(ServiceType::Inference);
        let fine_tuning_services = registry(ServiceType::FineTuning);

        let inference_attestor = attestor(&inference_services);
        let inference = InferenceBroker {
            fees: FeeAccountant::new(
                ledger.clone(),
                inference_services.clone(),
                context.ephemeral_cache().clone(),
                config.fees.clone(),
                context.fee_ttl(),
            ),
            signer: RequestSigner::new(
                ledger.clone(),
                NonceAllocator::new(
                    context.persistent_cache().clone(),
                    wallet.address(),
                    config.nonce.clone(),
                ),
                wallet.clone(),
                Duration::from_secs(config.cache.settlement_key_ttl_secs),
                config.attestation.vllm_proxy,
            ),
            verifier: ResponseVerifier::new(
                inference_services.clone(),
                client.clone(),
                inference_attestor.clone(),
            ),
            services: inference_services,
            attestor: inference_attestor,
        };

        let fine_tuning_attestor = attestor(&fine_tuning_services);
        let fine_tuning = FineTuningBroker {
            retriever: DeliverableRetriever::new(
                ledger.clone(),
                fine_tuning_attestor.clone(),
                self.fetcher,
                wallet.clone(),
            )
            .with_chunk_len(self.chunk_len),
            services: fine_tuning_services,
            attestor: fine_tuning_attestor,
        };

        info!("Broker ready for {}", wallet.address());
        Ok(Broker {
            context,
            ledger,
            inference,
            fine_tuning,
        })
    }
}

/// A user's broker.
pub struct Broker {
    context: BrokerContext,
    ledger: Arc<LedgerTransferCoordinator>,
    inference: InferenceBroker,
    fine_tuning: FineTuningBroker,
}

impl Broker {
    /// Ledger and sub-account fund movement.
    #[must_use]
    pub fn ledger(&self) -> &LedgerTransferCoordinator {
        &self.ledger
    }

    /// Inference operations.
    #[must_use]
    pub fn inference(&self) -> &InferenceBroker {
        &self.inference
    }

    /// Fine-tuning operations.
    #[must_use]
    pub fn fine_tuning(&self) -> &FineTuningBroker {
        &self.fine_tuning
    }

    /// The broker's context.
    #[must_use]
    pub fn context(&self) -> &BrokerContext {
        &self.context
    }

    /// Drop advisory state and the cached settlement key.
    ///
    /// # Errors
    ///
    /// Returns a cache error if the ephemeral cache cannot be cleared.
    pub async fn teardown(&self) -> Result<()> {
        self.inference.signer.forget_key();
        self.context.teardown().await
    }
}

/// Per-request inference billing.
pub struct InferenceBroker {
    services: Arc<ServiceRegistry>,
    fees: FeeAccountant,
    signer: RequestSigner,
    attestor: Arc<ProviderAttestor>,
    verifier: ResponseVerifier,
}

impl InferenceBroker {
    /// Verify `provider` and acknowledge its signer on-chain.
    ///
    /// # Errors
    ///
    /// See [`ProviderAttestor::acknowledge`].
    pub async fn acknowledge_provider_signer(&self, provider: Address) -> Result<Address> {
        self.attestor.acknowledge(provider).await
    }

    /// The provider's registered inference service.
    ///
    /// # Errors
    ///
    /// Returns a precondition error if the provider is not registered.
    pub async fn get_service(&self, provider: Address) -> Result<Service> {
        self.services.get(provider).await
    }

    /// Billing headers for sending `content` to `provider`.
    ///
    /// Tops up the sub-account when needed and carries the output fee of
    /// earlier responses.
    ///
    /// # Errors
    ///
    /// Fails if the provider signer is not acknowledged, the top-up fails or
    /// no nonce could be allocated.
    pub async fn get_request_headers(
        &self,
        provider: Address,
        content: &str,
    ) -> Result<BillingHeaders> {
        self.attestor.ensure_acknowledged(provider).await?;
        self.fees.maybe_top_up(provider, content).await?;
        let output_fee = self.fees.pending_output_fee(provider).await?;
        let service = self.services.get(provider).await?;
        let headers = self
            .signer
            .build_headers(&service, content, output_fee)
            .await?;
        self.fees.clear_pending_output_fee(provider).await?;
        debug!(
            "Headers for {provider}: nonce {} fee {}",
            headers.nonce, headers.fee
        );
        Ok(headers)
    }

    /// Account for a received response and, given its id, verify that the
    /// provider signed `content`.
    ///
    /// Returns `None` when no verification was requested.
    ///
    /// # Errors
    ///
    /// Fails if the output fee cannot be recorded or the provider is
    /// unreachable during verification.
    pub async fn process_response(
        &self,
        provider: Address,
        content: &str,
        response_id: Option<&str>,
    ) -> Result<Option<bool>> {
        self.fees.record_output_fee(provider, content).await?;
        match response_id {
            Some(id) => self.verifier.verify(provider, content, id).await.map(Some),
            None => Ok(None),
        }
    }

    /// The fee accountant.
    #[must_use]
    pub fn fees(&self) -> &FeeAccountant {
        &self.fees
    }

    /// The provider attestor.
    #[must_use]
    pub fn attestor(&self) -> &ProviderAttestor {
        &self.attestor
    }
}

/// Fine-tuning deliverable handling.
pub struct FineTuningBroker {
    services: Arc<ServiceRegistry>,
    attestor: Arc<ProviderAttestor>,
    retriever: DeliverableRetriever,
}

impl FineTuningBroker {
    /// Verify `provider` and acknowledge its signer on-chain.
    ///
    /// # Errors
    ///
    /// See [`ProviderAttestor::acknowledge`].
    pub async fn acknowledge_provider_signer(&self, provider: Address) -> Result<Address> {
        self.attestor.acknowledge(provider).await
    }

    /// The provider's registered fine-tuning service.
    ///
    /// # Errors
    ///
    /// Returns a precondition error if the provider is not registered.
    pub async fn get_service(&self, provider: Address) -> Result<Service> {
        self.services.get(provider).await
    }

    /// Download and acknowledge the latest deliverable of `provider`.
    ///
    /// # Errors
    ///
    /// See [`DeliverableRetriever::acknowledge_deliverable`].
    pub async fn acknowledge_deliverable(
        &self,
        provider: Address,
        download_path: &Path,
    ) -> Result<()> {
        self.retriever
            .acknowledge_deliverable(provider, download_path)
            .await
    }

    /// Decrypt the latest deliverable of `provider`.
    ///
    /// # Errors
    ///
    /// See [`DeliverableRetriever::decrypt`].
    pub async fn decrypt_model(
        &self,
        provider: Address,
        encrypted_path: &Path,
        decrypted_path: &Path,
    ) -> Result<()> {
        self.retriever
            .decrypt(provider, encrypted_path, decrypted_path)
            .await
    }

    /// The provider attestor.
    #[must_use]
    pub fn attestor(&self) -> &ProviderAttestor {
        &self.attestor
    }
}
