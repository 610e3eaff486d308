//! Fine-tuning deliverables.
//!
//! A provider publishes each fine-tuned model as a content root hash in the
//! user's sub-account. The user downloads the content and acknowledges it
//! on-chain; only then does the provider reveal the session key, sealed to
//! the user's wallet key, so the encrypted model can be opened.

pub mod format;

pub use format::{decrypt_file, seal, CHUNK_LEN};

use crate::attestation::ProviderAttestor;
use crate::chain::ContractCall;
use crate::crypto::ecies;
use crate::error::{Error, Result};
use crate::ledger::LedgerTransferCoordinator;
use crate::provider::ContentFetcher;
use crate::types::{Account, Address, Deliverable, ServiceType};
use crate::wallet::Wallet;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Acknowledges and decrypts fine-tuning deliverables.
pub struct DeliverableRetriever {
    ledger: Arc<LedgerTransferCoordinator>,
    attestor: Arc<ProviderAttestor>,
    fetcher: Option<Arc<dyn ContentFetcher>>,
    wallet: Arc<Wallet>,
    chunk_len: usize,
}

impl DeliverableRetriever {
    /// Create a retriever. Without a `fetcher` deliverables can be decrypted
    /// but not acknowledged.
    #[must_use]
    pub fn new(
        ledger: Arc<LedgerTransferCoordinator>,
        attestor: Arc<ProviderAttestor>,
        fetcher: Option<Arc<dyn ContentFetcher>>,
        wallet: Arc<Wallet>,
    ) -> Self {
        Self {
            ledger,
            attestor,
            fetcher,
            wallet,
            chunk_len: CHUNK_LEN,
        }
    }

    /// Override the chunk length of the deliverable format.
    #[must_use]
    pub fn with_chunk_len(mut self, chunk_len: usize) -> Self {
        self.chunk_len = chunk_len;
        self
    }

    async fn latest(&self, provider: Address) -> Result<(Account, usize)> {
        let account = self
            .ledger
            .get_account(provider, ServiceType::FineTuning)
            .await?
            .ok_or_else(|| {
                Error::Precondition(format!("No fine-tuning sub-account with {provider}"))
            })?;
        if account.deliverables.is_empty() {
            return Err(Error::Precondition(format!(
                "Provider {provider} has not published a deliverable yet"
            )));
        }
        let index = account.deliverables.len() - 1;
        Ok((account, index))
    }

    /// Download the latest deliverable of `provider` to `download_path` and
    /// acknowledge it on-chain.
    ///
    /// Does nothing if the deliverable is already acknowledged.
    ///
    /// # Errors
    ///
    /// Returns a precondition error if there is no deliverable, a config
    /// error if no content fetcher is configured, or the fetch or
    /// transaction error.
    pub async fn acknowledge_deliverable(
        &self,
        provider: Address,
        download_path: &Path,
    ) -> Result<()> {
        let (account, index) = self.latest(provider).await?;
        let deliverable = &account.deliverables[index];
        if deliverable.acknowledged {
            info!("Deliverable {index} of {provider} already acknowledged");
            return Ok(());
        }

        let fetcher = self.fetcher.as_ref().ok_or_else(|| {
            Error::Config("no content fetcher configured for deliverable downloads".to_string())
        })?;
        info!(
            "Downloading deliverable {index} of {provider} (root 0x{})",
            hex::encode(deliverable.model_root_hash)
        );
        fetcher
            .fetch(&deliverable.model_root_hash, download_path)
            .await?;

        self.ledger
            .submit(&ContractCall::AcknowledgeDeliverable { provider, index })
            .await?;
        info!("Acknowledged deliverable {index} of {provider}");
        Ok(())
    }

    /// Decrypt the latest deliverable of `provider`.
    ///
    /// # Errors
    ///
    /// - [`Error::Precondition`] if the deliverable is not acknowledged or
    ///   its secret is not revealed yet, or the provider signer is not
    ///   acknowledged;
    /// - [`Error::Verification`] if the file fails any integrity check.
    pub async fn decrypt(
        &self,
        provider: Address,
        encrypted_path: &Path,
        decrypted_path: &Path,
    ) -> Result<()> {
        let signer = self.attestor.ensure_acknowledged(provider).await?;
        let (account, index) = self.latest(provider).await?;
        let key = self.session_key(provider, &account.deliverables[index])?;

        format::decrypt_file(encrypted_path, decrypted_path, &key, signer, self.chunk_len).await?;
        info!(
            "Decrypted deliverable {index} of {provider} to {}",
            decrypted_path.display()
        );
        Ok(())
    }

    fn session_key(
        &self,
        provider: Address,
        deliverable: &Deliverable,
    ) -> Result<[u8; format::KEY_SIZE]> {
        if !deliverable.acknowledged {
            return Err(Error::Precondition(format!(
                "Deliverable of {provider} is not acknowledged; acknowledge it first"
            )));
        }
        if deliverable.encrypted_secret.is_empty() {
            return Err(Error::Precondition(format!(
                "Provider {provider} has not revealed the deliverable secret yet"
            )));
        }
        let secret = ecies::open(self.wallet.secret_key(), &deliverable.encrypted_secret)?;
        secret.try_into().map_err(|secret: Vec<u8>| {
            Error::Crypto(format!(
                "session key must be {} bytes, got {}",
                format::KEY_SIZE,
                secret.len()
            ))
        })
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use crate::cache::{Cache, MemoryCache};
    use crate::chain::memory::MemoryChain;
    use crate::chain::LedgerChain;
    use crate::config::{AttestationConfig, GasConfig};
    use crate::provider::{ProviderClient, ProviderQuote, ResponseSignature, ServiceRegistry};
    use crate::types::Service;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    const PROVIDER: Address = Address::new([0x44; 20]);
    const ROOT: [u8; 32] = [0xab; 32];
    const CHUNK: usize = 8;

    struct NoQuotes;

    #[async_trait]
    impl ProviderClient for NoQuotes {
        async fn quote(&self, _service: &Service) -> Result<ProviderQuote> {
            Err(Error::Provider("not used".to_string()))
        }

        async fn response_signature(
            &self,
            _service: &Service,
            _response_id: &str,
        ) -> Result<Option<ResponseSignature>> {
            Ok(None)
        }

        async fn verify_gpu(
            &self,
            _service: &Service,
            _payload: &serde_json::Value,
        ) -> Result<bool> {
            Ok(false)
        }
    }

    #[derive(Default)]
    struct RecordingFetcher(AtomicUsize);

    #[async_trait]
    impl ContentFetcher for RecordingFetcher {
        async fn fetch(&self, root_hash: &[u8; 32], destination: &Path) -> Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            tokio::fs::write(destination, root_hash).await?;
            Ok(())
        }
    }

    struct Fixture {
        chain: MemoryChain,
        user: Arc<Wallet>,
        provider_key: Wallet,
        fetcher: Arc<RecordingFetcher>,
        retriever: DeliverableRetriever,
    }

    async fn fixture(with_fetcher: bool) -> Fixture {
        let user = Arc::new(Wallet::generate());
        let provider_key = Wallet::generate();
        let chain = MemoryChain::new(user.address());
        let dyn_chain: Arc<dyn LedgerChain> = Arc::new(chain.clone());
        let ledger = Arc::new(LedgerTransferCoordinator::new(
            dyn_chain.clone(),
            user.clone(),
            GasConfig::default(),
        ));
        ledger.add_ledger(1_000).await.expect("ledger");
        ledger
            .transfer(PROVIDER, ServiceType::FineTuning, 100)
            .await
            .expect("transfer");
        ledger
            .submit(&ContractCall::AcknowledgeProviderSigner {
                provider: PROVIDER,
                service_type: ServiceType::FineTuning,
                signer: provider_key.address(),
            })
            .await
            .expect("acknowledge signer");

        let cache: Arc<dyn Cache> = Arc::new(MemoryCache::new());
        let ttl = Duration::from_secs(60);
        let services = Arc::new(ServiceRegistry::new(
            dyn_chain,
            cache.clone(),
            ServiceType::FineTuning,
            ttl,
        ));
        let attestor = Arc::new(ProviderAttestor::new(
            ledger.clone(),
            services,
            Arc::new(NoQuotes),
            None,
            cache,
            AttestationConfig::default(),
            ttl,
        ));
        let fetcher = Arc::new(RecordingFetcher::default());
        let dyn_fetcher: Option<Arc<dyn ContentFetcher>> = if with_fetcher {
            Some(fetcher.clone())
        } else {
            None
        };
        let retriever = DeliverableRetriever::new(ledger, attestor, dyn_fetcher, user.clone())
            .with_chunk_len(CHUNK);
        Fixture {
            chain,
            user,
            provider_key,
            fetcher,
            retriever,
        }
    }

    #[tokio::test]
    async fn test_acknowledge_then_decrypt() {
        let fixture = fixture(true).await;
        let dir = tempfile::tempdir().expect("tempdir");
        let download = dir.path().join("model.enc");
        let encrypted = dir.path().join("model.sealed");
        let decrypted = dir.path().join("model.bin");

        let index = fixture
            .chain
            .push_deliverable(fixture.user.address(), PROVIDER, ROOT)
            .expect("publish");

        let err = fixture
            .retriever
            .decrypt(PROVIDER, &encrypted, &decrypted)
            .await
            .expect_err("not acknowledged");
        assert!(err.is_precondition());

        fixture
            .retriever
            .acknowledge_deliverable(PROVIDER, &download)
            .await
            .expect("acknowledge");
        assert_eq!(tokio::fs::read(&download).await.expect("download"), ROOT);
        assert_eq!(fixture.chain.count_calls("acknowledgeDeliverable"), 1);

        fixture
            .retriever
            .acknowledge_deliverable(PROVIDER, &download)
            .await
            .expect("second acknowledge");
        assert_eq!(fixture.chain.count_calls("acknowledgeDeliverable"), 1);
        assert_eq!(fixture.fetcher.0.load(Ordering::SeqCst), 1);

        let err = fixture
            .retriever
            .decrypt(PROVIDER, &encrypted, &decrypted)
            .await
            .expect_err("secret not revealed");
        assert!(err.is_precondition());

        let key = [0x5a; format::KEY_SIZE];
        let plaintext: Vec<u8> = (0u8..20).collect();
        let sealed = seal(
            &plaintext,
            &key,
            [0u8; format::IV_SIZE],
            fixture.provider_key.secret_key(),
            CHUNK,
        )
        .expect("seal");
        tokio::fs::write(&encrypted, sealed).await.expect("write");
        let secret = ecies::seal(fixture.user.public_key(), &key).expect("seal key");
        fixture
            .chain
            .reveal_deliverable_secret(fixture.user.address(), PROVIDER, index, secret)
            .expect("reveal");

        fixture
            .retriever
            .decrypt(PROVIDER, &encrypted, &decrypted)
            .await
            .expect("decrypt");
        assert_eq!(tokio::fs::read(&decrypted).await.expect("read"), plaintext);
    }

    #[tokio::test]
    async fn test_acknowledge_without_fetcher_is_config_error() {
        let fixture = fixture(false).await;
        fixture
            .chain
            .push_deliverable(fixture.user.address(), PROVIDER, ROOT)
            .expect("publish");
        let dir = tempfile::tempdir().expect("tempdir");
        let err = fixture
            .retriever
            .acknowledge_deliverable(PROVIDER, &dir.path().join("model"))
            .await
            .expect_err("no fetcher");
        assert!(matches!(err, Error::Config(_)));
        assert_eq!(fixture.chain.count_calls("acknowledgeDeliverable"), 0);
    }

    #[tokio::test]
    async fn test_missing_deliverable_is_precondition() {
        let fixture = fixture(true).await;
        let dir = tempfile::tempdir().expect("tempdir");
        let err = fixture
            .retriever
            .acknowledge_deliverable(PROVIDER, &dir.path().join("model"))
            .await
            .expect_err("nothing published");
        assert!(err.is_precondition());
        assert_eq!(fixture.fetcher.0.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_wrong_session_key_length_is_rejected() {
        let fixture = fixture(true).await;
        let dir = tempfile::tempdir().expect("tempdir");
        let index = fixture
            .chain
            .push_deliverable(fixture.user.address(), PROVIDER, ROOT)
            .expect("publish");
        fixture
            .retriever
            .acknowledge_deliverable(PROVIDER, &dir.path().join("model"))
            .await
            .expect("acknowledge");
        let secret = ecies::seal(fixture.user.public_key(), &[1u8; 16]).expect("seal key");
        fixture
            .chain
            .reveal_deliverable_secret(fixture.user.address(), PROVIDER, index, secret)
            .expect("reveal");

        let err = fixture
            .retriever
            .decrypt(PROVIDER, &dir.path().join("in"), &dir.path().join("out"))
            .await
            .expect_err("short key");
        assert!(matches!(err, Error::Crypto(_)));
    }
}
