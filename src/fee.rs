//! Per-request fee accounting and the sub-account top-up loop.
//!
//! Spend since the last account check is tracked per provider in the
//! ephemeral cache. Once it passes the check threshold the sub-account is
//! re-read from chain, and topped up to the target when its usable balance
//! fell under the trigger. All thresholds scale with the provider's
//! `input_price + output_price`.

use crate::cache::Cache;
use crate::config::FeeConfig;
use crate::error::{Error, Result};
use crate::ledger::LedgerTransferCoordinator;
use crate::provider::ServiceRegistry;
use crate::types::{Address, Service};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Fee for `content` at `price` per unit.
///
/// The unit is the content byte length.
#[must_use]
pub fn compute_fee(content: &str, price: u128) -> u128 {
    u128::try_from(content.len())
        .unwrap_or(u128::MAX)
        .saturating_mul(price)
}

/// Top-up thresholds for one provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Thresholds {
    /// Unchecked spend after which the account is re-read.
    pub check: u128,
    /// Usable balance below which a top-up happens.
    pub trigger: u128,
    /// Usable balance a top-up restores.
    pub target: u128,
}

impl Thresholds {
    /// Scale the configured multipliers by a service's price sum.
    #[must_use]
    pub fn for_service(config: &FeeConfig, service: &Service) -> Self {
        let unit = service.price_sum();
        Self {
            check: config.check_multiplier.saturating_mul(unit),
            trigger: config.trigger_multiplier.saturating_mul(unit),
            target: config.target_multiplier.saturating_mul(unit),
        }
    }
}

/// Tracks spend and keeps provider sub-accounts funded.
pub struct FeeAccountant {
    ledger: Arc<LedgerTransferCoordinator>,
    services: Arc<ServiceRegistry>,
    cache: Arc<dyn Cache>,
    config: FeeConfig,
    ttl: Duration,
}

impl FeeAccountant {
    /// Create an accountant over the ephemeral `cache`.
    #[must_use]
    pub fn new(
        ledger: Arc<LedgerTransferCoordinator>,
        services: Arc<ServiceRegistry>,
        cache: Arc<dyn Cache>,
        config: FeeConfig,
        ttl: Duration,
    ) -> Self {
        Self {
            ledger,
            services,
            cache,
            config,
            ttl,
        }
    }

    fn counter_key(&self, provider: Address) -> String {
        format!("fee:{}:{provider}", self.services.service_type())
    }

    fn output_key(&self, provider: Address) -> String {
        format!("output-fee:{}:{provider}", self.services.service_type())
    }

    async fn read_amount(&self, key: &str) -> Result<Option<u128>> {
        self.cache
            .get(key)
            .await?
            .map(|raw| {
                raw.parse::<u128>()
                    .map_err(|e| Error::Cache(format!("Corrupt fee entry {key}: {e}")))
            })
            .transpose()
    }

    async fn add_amount(&self, key: &str, amount: u128) -> Result<u128> {
        let total = self
            .read_amount(key)
            .await?
            .unwrap_or(0)
            .saturating_add(amount);
        self.cache
            .set(key, &total.to_string(), Some(self.ttl))
            .await?;
        Ok(total)
    }

    /// Running spend with `provider` since the last check, if it was ever checked.
    ///
    /// # Errors
    ///
    /// Returns a cache error if the counter is unreadable.
    pub async fn unchecked_spend(&self, provider: Address) -> Result<Option<u128>> {
        self.read_amount(&self.counter_key(provider)).await
    }

    /// Returns true if the sub-account with `provider` should be re-read.
    ///
    /// # Errors
    ///
    /// Fails if the service lookup or the cache read fails.
    pub async fn should_check_account(&self, provider: Address) -> Result<bool> {
        let service = self.services.get(provider).await?;
        let thresholds = Thresholds::for_service(&self.config, &service);
        Ok(match self.unchecked_spend(provider).await? {
            None => true,
            Some(spent) => spent > thresholds.check,
        })
    }

    /// Account for the input fee of `content` and top up the sub-account if needed.
    ///
    /// The first call for a provider checks the account before the request.
    ///
    /// # Errors
    ///
    /// Fails if the account cannot be read, the ledger cannot cover the
    /// top-up, or the transfer fails.
    pub async fn maybe_top_up(&self, provider: Address, content: &str) -> Result<()> {
        let service = self.services.get(provider).await?;
        let thresholds = Thresholds::for_service(&self.config, &service);

        if self.unchecked_spend(provider).await?.is_none() {
            debug!("First request to {provider}; checking account eagerly");
            self.check_account(&service, thresholds).await?;
        }

        let fee = compute_fee(content, service.input_price);
        let spent = self.add_amount(&self.counter_key(provider), fee).await?;
        if spent > thresholds.check {
            debug!(
                "Unchecked spend {spent} with {provider} passed {}; re-reading account",
                thresholds.check
            );
            self.check_account(&service, thresholds).await?;
        }
        Ok(())
    }

    async fn check_account(&self, service: &Service, thresholds: Thresholds) -> Result<()> {
        let provider = service.provider;
        let service_type = self.services.service_type();
        let (available, pending_refund) = self
            .ledger
            .get_account(provider, service_type)
            .await?
            .map_or((0, 0), |account| (account.available(), account.pending_refund));

        if available < thresholds.trigger {
            let amount = thresholds.target - available;
            // The transfer cancels pending refunds before drawing on the ledger.
            let from_ledger = amount - pending_refund.min(amount);
            let ledger = self.ledger.get_ledger().await?;
            if ledger.available_balance < from_ledger {
                return Err(Error::Precondition(format!(
                    "Ledger balance {} cannot cover {from_ledger} of a top-up of {amount} \
                     for {provider}; deposit more funds",
                    ledger.available_balance
                )));
            }
            info!(
                "Sub-account with {provider} at {available} (below {}); topping up by {amount}",
                thresholds.trigger
            );
            self.ledger.transfer(provider, service_type, amount).await?;
        }

        self.cache
            .set(&self.counter_key(provider), "0", Some(self.ttl))
            .await
    }

    /// Account for the output fee of a received `response`.
    ///
    /// The fee is added to the running spend and carried by the next request.
    /// Returns the fee.
    ///
    /// # Errors
    ///
    /// Fails if the service lookup or the cache update fails.
    pub async fn record_output_fee(&self, provider: Address, response: &str) -> Result<u128> {
        let service = self.services.get(provider).await?;
        let fee = compute_fee(response, service.output_price);
        self.add_amount(&self.counter_key(provider), fee).await?;
        let pending = self.add_amount(&self.output_key(provider), fee).await?;
        debug!("Recorded output fee {fee} for {provider} (pending {pending})");
        Ok(fee)
    }

    /// Output fee not yet carried by a request.
    ///
    /// # Errors
    ///
    /// Returns a cache error if the entry is unreadable.
    pub async fn pending_output_fee(&self, provider: Address) -> Result<u128> {
        Ok(self
            .read_amount(&self.output_key(provider))
            .await?
            .unwrap_or(0))
    }

    /// Forget the pending output fee once a request carried it.
    ///
    /// # Errors
    ///
    /// Returns a cache error if the entry cannot be removed.
    pub async fn clear_pending_output_fee(&self, provider: Address) -> Result<()> {
        self.cache.delete(&self.output_key(provider)).await
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::chain::memory::MemoryChain;
    use crate::chain::{ContractCall, LedgerChain, SignedRequest, TxOptions};
    use crate::config::GasConfig;
    use crate::crypto::SettlementKey;
    use crate::types::{Request, ServiceType};
    use crate::wallet::Wallet;
    use proptest::prelude::*;

    const PROVIDER: Address = Address::new([0x22; 20]);

    struct Fixture {
        chain: MemoryChain,
        wallet: Arc<Wallet>,
        fees: FeeAccountant,
    }

    // Prices 1 + 1 with multipliers 10 / 50 / 100 give thresholds 20 / 100 / 200.
    async fn fixture(ledger_balance: u128) -> Fixture {
        let wallet = Arc::new(Wallet::generate());
        let chain = MemoryChain::new(wallet.address());
        chain.register_service(Service {
            provider: PROVIDER,
            service_type: ServiceType::Inference,
            url: "http://provider.test".to_string(),
            model: "llama".to_string(),
            input_price: 1,
            output_price: 1,
            verifiability: "TeeML".to_string(),
        });
        let dyn_chain: Arc<dyn LedgerChain> = Arc::new(chain.clone());
        let ledger = Arc::new(LedgerTransferCoordinator::new(
            dyn_chain.clone(),
            wallet.clone(),
            GasConfig::default(),
        ));
        ledger.add_ledger(ledger_balance).await.expect("ledger");

        let cache: Arc<dyn Cache> = Arc::new(MemoryCache::new());
        let ttl = Duration::from_secs(60);
        let services = Arc::new(ServiceRegistry::new(
            dyn_chain,
            cache.clone(),
            ServiceType::Inference,
            ttl,
        ));
        let config = FeeConfig {
            check_multiplier: 10,
            trigger_multiplier: 50,
            target_multiplier: 100,
        };
        let fees = FeeAccountant::new(ledger, services, cache, config, ttl);
        Fixture {
            chain,
            wallet,
            fees,
        }
    }

    async fn settle(fixture: &Fixture, nonce: u64, fee: u128) {
        let ledger = fixture
            .chain
            .get_ledger(fixture.wallet.address())
            .await
            .expect("read")
            .expect("ledger");
        let key = SettlementKey::open(&ledger.additional_info, &fixture.wallet.sealing_secret())
            .expect("key");
        let request = Request {
            nonce,
            fee,
            user: fixture.wallet.address(),
            provider: PROVIDER,
        };
        fixture
            .chain
            .connect(PROVIDER)
            .submit(
                &ContractCall::SettleFees {
                    user: fixture.wallet.address(),
                    service_type: ServiceType::Inference,
                    requests: vec![SignedRequest {
                        signature: key.sign_request(&request),
                        request,
                    }],
                },
                &TxOptions {
                    gas_price: 1,
                    nonce: None,
                },
            )
            .await
            .expect("settle");
    }

    async fn available(fixture: &Fixture) -> u128 {
        fixture
            .chain
            .get_account(fixture.wallet.address(), PROVIDER, ServiceType::Inference)
            .await
            .expect("read")
            .map_or(0, |account| account.available())
    }

    #[test]
    fn test_fee_is_length_times_price() {
        assert_eq!(compute_fee("", 7), 0);
        assert_eq!(compute_fee("hello", 3), 15);
    }

    #[tokio::test]
    async fn test_first_request_funds_new_account() {
        let fixture = fixture(10_000).await;
        assert!(fixture.fees.should_check_account(PROVIDER).await.expect("check"));

        fixture.fees.maybe_top_up(PROVIDER, "hello").await.expect("top up");
        assert_eq!(fixture.chain.count_calls("transferFund"), 1);
        assert_eq!(available(&fixture).await, 200);
        assert_eq!(
            fixture.fees.unchecked_spend(PROVIDER).await.expect("spend"),
            Some(5)
        );
        assert!(!fixture.fees.should_check_account(PROVIDER).await.expect("check"));
    }

    #[tokio::test]
    async fn test_recheck_without_transfer_when_funded() {
        let fixture = fixture(10_000).await;
        for _ in 0..5 {
            fixture.fees.maybe_top_up(PROVIDER, "hello").await.expect("request");
        }
        // 5 x 5 = 25 passed the check threshold on the last request.
        assert_eq!(
            fixture.fees.unchecked_spend(PROVIDER).await.expect("spend"),
            Some(0)
        );
        assert_eq!(fixture.chain.count_calls("transferFund"), 1);
    }

    #[tokio::test]
    async fn test_top_up_cancels_pending_refund_before_ledger() {
        let fixture = fixture(250).await;
        fixture.fees.maybe_top_up(PROVIDER, "hello").await.expect("first");
        fixture
            .chain
            .submit(
                &ContractCall::RetrieveFund {
                    providers: vec![PROVIDER],
                    service_type: ServiceType::Inference,
                },
                &TxOptions {
                    gas_price: 1,
                    nonce: None,
                },
            )
            .await
            .expect("request refund");
        assert_eq!(available(&fixture).await, 0);

        // 50 left on the ledger, but the whole top-up comes from the refund.
        fixture
            .fees
            .maybe_top_up(PROVIDER, "a request of 21 chars")
            .await
            .expect("re-check");
        assert_eq!(fixture.chain.count_calls("transferFund"), 2);
        assert_eq!(available(&fixture).await, 200);
    }

    #[tokio::test]
    async fn test_exactly_one_top_up_restores_target() {
        let fixture = fixture(10_000).await;
        fixture.fees.maybe_top_up(PROVIDER, "hello").await.expect("first");
        settle(&fixture, 40, 150).await;
        assert_eq!(available(&fixture).await, 50);

        for _ in 0..6 {
            fixture.fees.maybe_top_up(PROVIDER, "hello").await.expect("request");
        }
        assert_eq!(fixture.chain.count_calls("transferFund"), 2);
        assert_eq!(available(&fixture).await, 200);
    }

    #[tokio::test]
    async fn test_output_fee_is_pending_until_cleared() {
        let fixture = fixture(10_000).await;
        fixture.fees.maybe_top_up(PROVIDER, "hi").await.expect("request");
        assert_eq!(
            fixture
                .fees
                .record_output_fee(PROVIDER, "response")
                .await
                .expect("record"),
            8
        );
        fixture.fees.record_output_fee(PROVIDER, "ok").await.expect("record");
        assert_eq!(fixture.fees.pending_output_fee(PROVIDER).await.expect("pending"), 10);
        assert_eq!(
            fixture.fees.unchecked_spend(PROVIDER).await.expect("spend"),
            Some(12)
        );

        fixture
            .fees
            .clear_pending_output_fee(PROVIDER)
            .await
            .expect("clear");
        assert_eq!(fixture.fees.pending_output_fee(PROVIDER).await.expect("pending"), 0);
    }

    #[tokio::test]
    async fn test_underfunded_ledger_is_precondition() {
        let fixture = fixture(100).await;
        let err = fixture
            .fees
            .maybe_top_up(PROVIDER, "hello")
            .await
            .expect_err("ledger too small");
        assert!(err.is_precondition());
        assert_eq!(fixture.chain.count_calls("transferFund"), 0);
    }

    proptest! {
        #[test]
        fn prop_fee_is_linear(a in ".{0,64}", b in ".{0,64}", price in 0u128..1_000_000) {
            let joined = format!("{a}{b}");
            prop_assert_eq!(
                compute_fee(&joined, price),
                compute_fee(&a, price) + compute_fee(&b, price)
            );
        }
    }
}
