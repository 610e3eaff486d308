//! Ledger and sub-account fund movement.
//!
//! Every state-changing call goes through [`LedgerTransferCoordinator::submit`],
//! which owns the resubmission policy:
//!
//! 1. start at the configured gas price, or the chain's suggestion;
//! 2. submit and race the confirmation against `gas.tx_timeout`;
//! 3. on timeout, if the pending nonce is more than `gas.max_nonce_gap` ahead
//!    of the confirmed one, the next attempt reuses the confirmed nonce;
//! 4. retryable failures and timeouts raise the gas price by
//!    `gas.step_percent`, capped at `gas.max_gas_price`;
//! 5. reverts and unclassified errors end the action immediately.

use crate::chain::{revert, BlockTag, ChainError, ContractCall, LedgerChain, Receipt, TxOptions};
use crate::config::GasConfig;
use crate::crypto::SettlementKey;
use crate::error::{Error, Result};
use crate::types::{Account, Address, Ledger, ServiceType};
use crate::wallet::Wallet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Next gas price in an escalation sequence.
///
/// Strictly greater than `current` unless `max` caps it, never above `max`.
#[must_use]
pub fn next_gas_price(current: u128, step_percent: u32, max: Option<u128>) -> u128 {
    let stepped = current.saturating_mul(u128::from(step_percent)) / 100;
    let next = stepped.max(current.saturating_add(1));
    max.map_or(next, |max| next.min(max))
}

/// Moves funds between the user's ledger and provider sub-accounts.
pub struct LedgerTransferCoordinator {
    chain: Arc<dyn LedgerChain>,
    wallet: Arc<Wallet>,
    gas: GasConfig,
}

impl LedgerTransferCoordinator {
    /// Create a coordinator submitting through `chain` on behalf of `wallet`.
    #[must_use]
    pub fn new(chain: Arc<dyn LedgerChain>, wallet: Arc<Wallet>, gas: GasConfig) -> Self {
        Self { chain, wallet, gas }
    }

    /// The paying user.
    #[must_use]
    pub fn user(&self) -> Address {
        self.wallet.address()
    }

    /// The underlying chain adapter.
    #[must_use]
    pub fn chain(&self) -> &Arc<dyn LedgerChain> {
        &self.chain
    }

    /// Create the user's ledger with an initial balance.
    ///
    /// Generates a fresh settlement key and registers its public half together
    /// with the private half sealed under the wallet.
    ///
    /// # Errors
    ///
    /// Fails if the ledger already exists or the transaction fails.
    pub async fn add_ledger(&self, balance: u128) -> Result<Receipt> {
        let key = SettlementKey::generate();
        let additional_info = key.seal(&self.wallet.sealing_secret())?;
        info!("Creating ledger for {} with balance {balance}", self.user());
        self.submit(&ContractCall::AddLedger {
            balance,
            settlement_pub_key: key.public_key(),
            additional_info,
        })
        .await
    }

    /// Add funds to the ledger.
    ///
    /// # Errors
    ///
    /// Fails if the ledger does not exist or the transaction fails.
    pub async fn deposit_fund(&self, amount: u128) -> Result<Receipt> {
        info!("Depositing {amount} into ledger of {}", self.user());
        self.submit(&ContractCall::DepositFund { amount }).await
    }

    /// Withdraw available funds from the ledger.
    ///
    /// # Errors
    ///
    /// Fails if the ledger balance is insufficient or the transaction fails.
    pub async fn refund(&self, amount: u128) -> Result<Receipt> {
        info!("Refunding {amount} from ledger of {}", self.user());
        self.submit(&ContractCall::Refund { amount }).await
    }

    /// Delete the ledger.
    ///
    /// # Errors
    ///
    /// Fails if sub-accounts still hold funds or the transaction fails.
    pub async fn delete_ledger(&self) -> Result<Receipt> {
        info!("Deleting ledger of {}", self.user());
        self.submit(&ContractCall::DeleteLedger).await
    }

    /// Read the user's ledger.
    ///
    /// # Errors
    ///
    /// Returns a precondition error if the ledger does not exist.
    pub async fn get_ledger(&self) -> Result<Ledger> {
        let user = self.user();
        self.chain.get_ledger(user).await?.ok_or_else(|| {
            Error::Precondition(revert::describe(&ChainError::reverted(
                "LedgerNotExists",
                &[user],
            )))
        })
    }

    /// Read the user's sub-account with `provider`, if any.
    ///
    /// # Errors
    ///
    /// Returns a chain error if the read fails.
    pub async fn get_account(
        &self,
        provider: Address,
        service_type: ServiceType,
    ) -> Result<Option<Account>> {
        Ok(self
            .chain
            .get_account(self.user(), provider, service_type)
            .await?)
    }

    /// Move `amount` from the ledger into the sub-account with `provider`.
    ///
    /// Creates the sub-account if it does not exist yet.
    ///
    /// # Errors
    ///
    /// Fails if the ledger balance is insufficient or the transaction fails.
    pub async fn transfer(
        &self,
        provider: Address,
        service_type: ServiceType,
        amount: u128,
    ) -> Result<Receipt> {
        info!("Transferring {amount} to {service_type} account with {provider}");
        self.submit(&ContractCall::TransferFund {
            provider,
            service_type,
            amount,
        })
        .await
    }

    /// Request refunds of all sub-accounts of `service_type`.
    ///
    /// Returns `None` when there is nothing to retrieve.
    ///
    /// # Errors
    ///
    /// Fails if the ledger does not exist or the transaction fails.
    pub async fn retrieve_all(&self, service_type: ServiceType) -> Result<Option<Receipt>> {
        let ledger = self.get_ledger().await?;
        let providers = ledger.providers(service_type).to_vec();
        if providers.is_empty() {
            debug!("No {service_type} sub-accounts to retrieve from");
            return Ok(None);
        }
        info!(
            "Retrieving funds from {} {service_type} sub-accounts",
            providers.len()
        );
        self.submit(&ContractCall::RetrieveFund {
            providers,
            service_type,
        })
        .await
        .map(Some)
    }

    /// Submit a call with gas-price escalation until it confirms.
    ///
    /// # Errors
    ///
    /// - [`Error::Transaction`] for reverts (decoded when known) and
    ///   non-retryable failures;
    /// - [`Error::GasCapReached`] when retryable failures persist at the gas
    ///   ceiling or the attempt budget is used up;
    /// - [`Error::Chain`] if gas price or nonce reads fail.
    pub async fn submit(&self, call: &ContractCall) -> Result<Receipt> {
        let mut gas_price = match self.gas.gas_price {
            Some(price) => price,
            None => self.chain.suggested_gas_price().await?,
        };
        if let Some(max) = self.gas.max_gas_price {
            gas_price = gas_price.min(max);
        }

        let mut nonce = None;
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            let options = TxOptions { gas_price, nonce };
            debug!(
                "Submitting {} (attempt {attempts}, gas price {gas_price}, nonce {nonce:?})",
                call.name()
            );

            let error = match self.attempt(call, &options).await {
                Ok(receipt) => {
                    info!(
                        "{} confirmed as {} in block {}",
                        call.name(),
                        receipt.tx_hash,
                        receipt.block_number
                    );
                    return Ok(receipt);
                }
                Err(error) => error,
            };

            match &error {
                ChainError::Timeout(_) => {
                    nonce = self.stuck_nonce().await?;
                }
                ChainError::Retryable { .. } => {}
                ChainError::Reverted { .. } | ChainError::Rpc(_) => {
                    warn!("{} failed: {error}", call.name());
                    return Err(Error::Transaction(revert::describe(&error)));
                }
            }

            let at_cap = self.gas.max_gas_price.is_some_and(|max| gas_price >= max);
            if at_cap || attempts >= self.gas.max_attempts {
                warn!(
                    "{} gave up at gas price {gas_price} after {attempts} attempts",
                    call.name()
                );
                return Err(Error::GasCapReached {
                    gas_price,
                    attempts,
                    last_error: error.to_string(),
                });
            }

            let next = next_gas_price(gas_price, self.gas.step_percent, self.gas.max_gas_price);
            warn!(
                "{} attempt {attempts} failed ({error}); raising gas price {gas_price} -> {next}",
                call.name()
            );
            gas_price = next;
        }
    }

    async fn attempt(
        &self,
        call: &ContractCall,
        options: &TxOptions,
    ) -> std::result::Result<Receipt, ChainError> {
        let tx_hash = self.chain.submit(call, options).await?;
        match tokio::time::timeout(self.gas.tx_timeout(), self.chain.wait_for_receipt(&tx_hash))
            .await
        {
            Ok(receipt) => receipt,
            Err(_) => Err(ChainError::Timeout(tx_hash.to_string())),
        }
    }

    async fn stuck_nonce(&self) -> Result<Option<u64>> {
        let pending = self.chain.transaction_count(BlockTag::Pending).await?;
        let latest = self.chain.transaction_count(BlockTag::Latest).await?;
        if pending.saturating_sub(latest) > self.gas.max_nonce_gap {
            warn!(
                "Pending nonce {pending} is {} ahead of confirmed {latest}; replacing from {latest}",
                pending - latest
            );
            Ok(Some(latest))
        } else {
            Ok(None)
        }
    }
}
