//! Test harness wiring a broker to the in-memory chain and stub providers.

#![allow(clippy::expect_used)]

use async_trait::async_trait;
use compute_broker::chain::{LedgerChain, MemoryChain};
use compute_broker::error::Result;
use compute_broker::provider::{
    ContentFetcher, ProviderClient, ProviderQuote, QuoteVerifier, ResponseSignature,
};
use compute_broker::{
    Address, Broker, BrokerBuilder, BrokerConfig, BrokerContext, Service, ServiceType, Wallet,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

/// Address of the marketplace provider used by every scenario.
pub const PROVIDER: Address = Address::new([0x5e; 20]);

/// Provider endpoints backed by the provider's signing wallet.
pub struct StubProvider {
    signing_key: Wallet,
    signatures: Mutex<HashMap<String, ResponseSignature>>,
}

impl StubProvider {
    /// Sign `text` as the response with `id`.
    pub fn sign_response(&self, id: &str, text: &str) {
        let signature = self.signing_key.sign_message(text.as_bytes());
        self.signatures.lock().insert(
            id.to_string(),
            ResponseSignature {
                text: text.to_string(),
                signature: format!("0x{}", hex::encode(signature)),
            },
        );
    }
}

#[async_trait]
impl ProviderClient for StubProvider {
    async fn quote(&self, _service: &Service) -> Result<ProviderQuote> {
        Ok(ProviderQuote {
            quote: "c0ffee".to_string(),
            signing_address: self.signing_key.address(),
            gpu_payload: Some(serde_json::json!({"nonce": "1"})),
        })
    }

    async fn response_signature(
        &self,
        _service: &Service,
        response_id: &str,
    ) -> Result<Option<ResponseSignature>> {
        Ok(self.signatures.lock().get(response_id).cloned())
    }

    async fn verify_gpu(&self, _service: &Service, _payload: &serde_json::Value) -> Result<bool> {
        Ok(true)
    }
}

struct AcceptAll;

#[async_trait]
impl QuoteVerifier for AcceptAll {
    async fn verify(&self, _quote: &ProviderQuote) -> Result<bool> {
        Ok(true)
    }
}

/// Storage network stand-in serving content by root hash.
#[derive(Default)]
pub struct StubFetcher {
    content: Mutex<HashMap<[u8; 32], Vec<u8>>>,
}

impl StubFetcher {
    /// Publish `content` under `root_hash`.
    pub fn publish(&self, root_hash: [u8; 32], content: Vec<u8>) {
        self.content.lock().insert(root_hash, content);
    }
}

#[async_trait]
impl ContentFetcher for StubFetcher {
    async fn fetch(&self, root_hash: &[u8; 32], destination: &Path) -> Result<()> {
        let content = self.content.lock().get(root_hash).cloned().ok_or_else(|| {
            compute_broker::Error::Provider(format!("no content for 0x{}", hex::encode(root_hash)))
        })?;
        tokio::fs::write(destination, content).await?;
        Ok(())
    }
}

/// A broker with its chain, provider and storage stand-ins.
pub struct TestHarness {
    /// The user's chain handle.
    pub chain: MemoryChain,
    /// The user's wallet address.
    pub user: Address,
    /// The user's wallet public key, for sealing deliverable secrets.
    pub user_public_key: secp256k1::PublicKey,
    /// The provider's signing wallet.
    pub provider_key: Wallet,
    /// Provider endpoints.
    pub provider: Arc<StubProvider>,
    /// Storage network.
    pub fetcher: Arc<StubFetcher>,
    /// The broker under test.
    pub broker: Broker,
    /// Scratch directory holding broker state and files.
    pub dir: TempDir,
}

impl TestHarness {
    /// Default test configuration: unit prices with thresholds 20 / 100 / 200.
    pub fn config() -> BrokerConfig {
        let mut config = BrokerConfig::default();
        config.fees.check_multiplier = 10;
        config.fees.trigger_multiplier = 50;
        config.fees.target_multiplier = 100;
        config.gas.gas_price = Some(1_000);
        config
    }

    /// Set up a harness with [`TestHarness::config`].
    pub async fn setup() -> Self {
        Self::setup_with(Self::config(), 8).await
    }

    /// Set up a harness with `config` and a deliverable chunk length.
    pub async fn setup_with(mut config: BrokerConfig, chunk_len: usize) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        config.data_dir = dir.path().join("state");

        let wallet = Wallet::generate();
        let user = wallet.address();
        let user_public_key = *wallet.public_key();
        let provider_key = Wallet::generate();

        let chain = MemoryChain::new(user);
        for service_type in [ServiceType::Inference, ServiceType::FineTuning] {
            chain.register_service(Service {
                provider: PROVIDER,
                service_type,
                url: "http://provider.test".to_string(),
                model: "llama-3-8b".to_string(),
                input_price: 1,
                output_price: 1,
                verifiability: "TeeML".to_string(),
            });
        }

        let provider = Arc::new(StubProvider {
            signing_key: provider_key.clone(),
            signatures: Mutex::new(HashMap::new()),
        });
        let fetcher = Arc::new(StubFetcher::default());

        let context = BrokerContext::init(config).await.expect("context");
        let broker = BrokerBuilder::new(context)
            .with_chain(Arc::new(chain.clone()))
            .with_provider_client(provider.clone())
            .with_quote_verifier(Arc::new(AcceptAll))
            .with_content_fetcher(fetcher.clone())
            .with_chunk_len(chunk_len)
            .build(wallet)
            .expect("broker");

        Self {
            chain,
            user,
            user_public_key,
            provider_key,
            provider,
            fetcher,
            broker,
            dir,
        }
    }

    /// The chain as seen by the provider.
    pub fn provider_chain(&self) -> MemoryChain {
        self.chain.connect(PROVIDER)
    }

    /// Current inference sub-account with the provider.
    pub async fn inference_account(&self) -> compute_broker::Account {
        self.chain
            .get_account(self.user, PROVIDER, ServiceType::Inference)
            .await
            .expect("read account")
            .expect("account exists")
    }

    /// Drop advisory state.
    pub async fn teardown(&self) {
        self.broker.teardown().await.expect("teardown");
    }
}
