//! In-process development chain.
//!
//! [`MemoryChain`] implements the ledger and serving contract rules on
//! mutex-guarded maps. Several handles can share one state through
//! [`MemoryChain::connect`], each sending as a different account, which is
//! how a user broker and a simulated provider settle against each other.
//!
//! Failure injection: outcomes pushed with [`MemoryChain::push_outcome`] are
//! consumed one per submission, before the contract rules run.

use super::{
    BlockTag, ChainError, ChainResult, ContractCall, LedgerChain, Receipt, SignedRequest, TxHash,
    TxOptions,
};
use crate::crypto::verify_request;
use crate::types::{Account, Address, Deliverable, Ledger, Service, ServiceType};
use async_trait::async_trait;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, trace};

/// Default gas price suggested by the development chain.
pub const DEFAULT_GAS_PRICE: u128 = 1_000_000_000;

/// Injected outcome of one submission.
#[derive(Debug, Clone)]
pub enum ScriptedOutcome {
    /// Reject the submission with this error.
    Fail(ChainError),
    /// Accept the submission but never confirm it.
    Stall,
}

/// One recorded submission.
#[derive(Debug, Clone)]
pub struct Submission {
    /// Sending account.
    pub sender: Address,
    /// The submitted call.
    pub call: ContractCall,
    /// Attempt parameters.
    pub options: TxOptions,
}

type AccountKey = (Address, Address, ServiceType);

#[derive(Debug)]
struct State {
    ledgers: HashMap<Address, Ledger>,
    accounts: HashMap<AccountKey, Account>,
    services: HashMap<(Address, ServiceType), Service>,
    confirmed: HashMap<Address, u64>,
    stalled: HashMap<Address, u64>,
    receipts: HashMap<TxHash, Receipt>,
    script: VecDeque<ScriptedOutcome>,
    submissions: Vec<Submission>,
    gas_price: u128,
    block_number: u64,
    tx_counter: u64,
}

impl Default for State {
    fn default() -> Self {
        Self {
            ledgers: HashMap::new(),
            accounts: HashMap::new(),
            services: HashMap::new(),
            confirmed: HashMap::new(),
            stalled: HashMap::new(),
            receipts: HashMap::new(),
            script: VecDeque::new(),
            submissions: Vec::new(),
            gas_price: DEFAULT_GAS_PRICE,
            block_number: 0,
            tx_counter: 0,
        }
    }
}

/// Handle to a shared in-memory chain, sending as one account.
#[derive(Debug, Clone)]
pub struct MemoryChain {
    state: Arc<Mutex<State>>,
    sender: Address,
}

impl MemoryChain {
    /// Create an empty chain with a handle sending as `sender`.
    #[must_use]
    pub fn new(sender: Address) -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            sender,
        }
    }

    /// Another handle on the same chain, sending as `sender`.
    #[must_use]
    pub fn connect(&self, sender: Address) -> Self {
        Self {
            state: Arc::clone(&self.state),
            sender,
        }
    }

    /// Register (or replace) a provider's service.
    pub fn register_service(&self, service: Service) {
        debug!(
            "Registering {} service for {}",
            service.service_type, service.provider
        );
        self.state
            .lock()
            .services
            .insert((service.provider, service.service_type), service);
    }

    /// Append a fine-tuning deliverable to a user's sub-account with `provider`.
    ///
    /// Returns the index of the new deliverable.
    ///
    /// # Errors
    ///
    /// Reverts with `AccountNotExists` if there is no fine-tuning sub-account.
    pub fn push_deliverable(
        &self,
        user: Address,
        provider: Address,
        model_root_hash: [u8; 32],
    ) -> ChainResult<usize> {
        let mut state = self.state.lock();
        let account = state
            .accounts
            .get_mut(&(user, provider, ServiceType::FineTuning))
            .ok_or_else(|| account_missing(user, provider))?;
        account.deliverables.push(Deliverable {
            model_root_hash,
            encrypted_secret: Vec::new(),
            acknowledged: false,
        });
        Ok(account.deliverables.len() - 1)
    }

    /// Publish the sealed session key of an acknowledged deliverable.
    ///
    /// # Errors
    ///
    /// Reverts if the deliverable does not exist or is not acknowledged yet.
    pub fn reveal_deliverable_secret(
        &self,
        user: Address,
        provider: Address,
        index: usize,
        encrypted_secret: Vec<u8>,
    ) -> ChainResult<()> {
        let mut state = self.state.lock();
        let account = state
            .accounts
            .get_mut(&(user, provider, ServiceType::FineTuning))
            .ok_or_else(|| account_missing(user, provider))?;
        let deliverable = account
            .deliverables
            .get_mut(index)
            .ok_or_else(|| deliverable_missing(provider, index))?;
        if !deliverable.acknowledged {
            return Err(ChainError::reverted(
                "DeliverableNotAcknowledged",
                &[provider.to_string(), index.to_string()],
            ));
        }
        deliverable.encrypted_secret = encrypted_secret;
        Ok(())
    }

    /// Complete every pending refund of `user`'s sub-accounts of `service_type`.
    ///
    /// Refunded funds return to the ledger's available balance.
    pub fn process_refunds(&self, user: Address, service_type: ServiceType) {
        let mut state = self.state.lock();
        let State {
            ledgers, accounts, ..
        } = &mut *state;
        let mut refunded = 0u128;
        for ((owner, _, kind), account) in accounts.iter_mut() {
            if *owner == user && *kind == service_type && account.pending_refund > 0 {
                account.balance = account.balance.saturating_sub(account.pending_refund);
                refunded = refunded.saturating_add(account.pending_refund);
                account.pending_refund = 0;
            }
        }
        if let Some(ledger) = ledgers.get_mut(&user) {
            ledger.available_balance = ledger.available_balance.saturating_add(refunded);
        }
        debug!("Processed refunds of {refunded} for {user}");
    }

    /// Queue an injected outcome for the next submission.
    pub fn push_outcome(&self, outcome: ScriptedOutcome) {
        self.state.lock().script.push_back(outcome);
    }

    /// Set the gas price the chain suggests.
    pub fn set_gas_price(&self, gas_price: u128) {
        self.state.lock().gas_price = gas_price;
    }

    /// Pretend `gap` transactions of this handle's sender are stuck in the mempool.
    ///
    /// Cleared by the next submission that reuses the confirmed nonce.
    pub fn set_nonce_gap(&self, gap: u64) {
        self.state.lock().stalled.insert(self.sender, gap);
    }

    /// Every submission seen so far, in order.
    #[must_use]
    pub fn submissions(&self) -> Vec<Submission> {
        self.state.lock().submissions.clone()
    }

    /// Number of submissions of the named contract function.
    #[must_use]
    pub fn count_calls(&self, name: &str) -> usize {
        self.state
            .lock()
            .submissions
            .iter()
            .filter(|s| s.call.name() == name)
            .count()
    }
}

#[async_trait]
impl LedgerChain for MemoryChain {
    fn sender(&self) -> Address {
        self.sender
    }

    async fn get_ledger(&self, user: Address) -> ChainResult<Option<Ledger>> {
        Ok(self.state.lock().ledgers.get(&user).cloned())
    }

    async fn get_account(
        &self,
        user: Address,
        provider: Address,
        service_type: ServiceType,
    ) -> ChainResult<Option<Account>> {
        Ok(self
            .state
            .lock()
            .accounts
            .get(&(user, provider, service_type))
            .cloned())
    }

    async fn get_service(
        &self,
        provider: Address,
        service_type: ServiceType,
    ) -> ChainResult<Option<Service>> {
        Ok(self
            .state
            .lock()
            .services
            .get(&(provider, service_type))
            .cloned())
    }

    async fn submit(&self, call: &ContractCall, options: &TxOptions) -> ChainResult<TxHash> {
        let mut state = self.state.lock();
        state.submissions.push(Submission {
            sender: self.sender,
            call: call.clone(),
            options: *options,
        });

        let confirmed = state.confirmed.get(&self.sender).copied().unwrap_or(0);
        if options.nonce == Some(confirmed) {
            state.stalled.remove(&self.sender);
        }

        state.tx_counter += 1;
        let tx_hash = tx_hash(self.sender, state.tx_counter);

        match state.script.pop_front() {
            Some(ScriptedOutcome::Fail(err)) => {
                trace!("Injected failure for {}: {err}", call.name());
                return Err(err);
            }
            Some(ScriptedOutcome::Stall) => {
                trace!("Stalling {} as {tx_hash}", call.name());
                *state.stalled.entry(self.sender).or_insert(0) += 1;
                return Ok(tx_hash);
            }
            None => {}
        }

        state.apply(self.sender, call)?;
        state.confirmed.insert(self.sender, confirmed + 1);
        state.block_number += 1;
        let receipt = Receipt {
            tx_hash,
            block_number: state.block_number,
        };
        state.receipts.insert(tx_hash, receipt);
        trace!(
            "Confirmed {} as {tx_hash} in block {}",
            call.name(),
            receipt.block_number
        );
        Ok(tx_hash)
    }

    async fn wait_for_receipt(&self, tx_hash: &TxHash) -> ChainResult<Receipt> {
        let receipt = self.state.lock().receipts.get(tx_hash).copied();
        match receipt {
            Some(receipt) => Ok(receipt),
            None => std::future::pending().await,
        }
    }

    async fn suggested_gas_price(&self) -> ChainResult<u128> {
        Ok(self.state.lock().gas_price)
    }

    async fn transaction_count(&self, tag: BlockTag) -> ChainResult<u64> {
        let state = self.state.lock();
        let confirmed = state.confirmed.get(&self.sender).copied().unwrap_or(0);
        Ok(match tag {
            BlockTag::Latest => confirmed,
            BlockTag::Pending => {
                confirmed + state.stalled.get(&self.sender).copied().unwrap_or(0)
            }
        })
    }
}

impl State {
    fn apply(&mut self, sender: Address, call: &ContractCall) -> ChainResult<()> {
        match call {
            ContractCall::AddLedger {
                balance,
                settlement_pub_key,
                additional_info,
            } => {
                if self.ledgers.contains_key(&sender) {
                    return Err(ChainError::reverted("LedgerExists", &[sender]));
                }
                self.ledgers.insert(
                    sender,
                    Ledger {
                        user: sender,
                        total_balance: *balance,
                        available_balance: *balance,
                        settlement_pub_key: *settlement_pub_key,
                        additional_info: additional_info.clone(),
                        inference_providers: Vec::new(),
                        fine_tuning_providers: Vec::new(),
                    },
                );
            }
            ContractCall::DepositFund { amount } => {
                let ledger = self.ledger_mut(sender)?;
                ledger.total_balance = ledger.total_balance.saturating_add(*amount);
                ledger.available_balance = ledger.available_balance.saturating_add(*amount);
            }
            ContractCall::Refund { amount } => {
                let ledger = self.ledger_mut(sender)?;
                if ledger.available_balance < *amount {
                    return Err(ChainError::reverted("InsufficientBalance", &[sender]));
                }
                ledger.total_balance -= amount;
                ledger.available_balance -= amount;
            }
            ContractCall::DeleteLedger => {
                self.ledger_mut(sender)?;
                if self
                    .accounts
                    .iter()
                    .any(|((user, _, _), account)| *user == sender && account.balance > 0)
                {
                    return Err(ChainError::reverted("LedgerNotEmpty", &[sender]));
                }
                self.ledgers.remove(&sender);
                self.accounts.retain(|(user, _, _), _| *user != sender);
            }
            ContractCall::TransferFund {
                provider,
                service_type,
                amount,
            } => self.transfer(sender, *provider, *service_type, *amount)?,
            ContractCall::RetrieveFund {
                providers,
                service_type,
            } => {
                self.ledger_mut(sender)?;
                for provider in providers {
                    if !self.accounts.contains_key(&(sender, *provider, *service_type)) {
                        return Err(account_missing(sender, *provider));
                    }
                }
                for provider in providers {
                    let key = (sender, *provider, *service_type);
                    if let Some(account) = self.accounts.get_mut(&key) {
                        account.pending_refund = account.balance;
                    }
                }
            }
            ContractCall::AcknowledgeProviderSigner {
                provider,
                service_type,
                signer,
            } => {
                let account = self
                    .accounts
                    .get_mut(&(sender, *provider, *service_type))
                    .ok_or_else(|| account_missing(sender, *provider))?;
                account.provider_signer = Some(*signer);
            }
            ContractCall::AcknowledgeDeliverable { provider, index } => {
                let account = self
                    .accounts
                    .get_mut(&(sender, *provider, ServiceType::FineTuning))
                    .ok_or_else(|| account_missing(sender, *provider))?;
                let deliverable = account
                    .deliverables
                    .get_mut(*index)
                    .ok_or_else(|| deliverable_missing(*provider, *index))?;
                if deliverable.acknowledged {
                    return Err(ChainError::reverted(
                        "DeliverableAlreadyAcknowledged",
                        &[provider.to_string(), index.to_string()],
                    ));
                }
                deliverable.acknowledged = true;
            }
            ContractCall::SettleFees {
                user,
                service_type,
                requests,
            } => self.settle(sender, *user, *service_type, requests)?,
        }
        Ok(())
    }

    fn ledger_mut(&mut self, user: Address) -> ChainResult<&mut Ledger> {
        self.ledgers
            .get_mut(&user)
            .ok_or_else(|| ChainError::reverted("LedgerNotExists", &[user]))
    }

    fn transfer(
        &mut self,
        user: Address,
        provider: Address,
        service_type: ServiceType,
        amount: u128,
    ) -> ChainResult<()> {
        let ledger = self
            .ledgers
            .get_mut(&user)
            .ok_or_else(|| ChainError::reverted("LedgerNotExists", &[user]))?;

        let pending = self
            .accounts
            .get(&(user, provider, service_type))
            .map_or(0, |account| account.pending_refund);
        // Pending refunds are cancelled before new funds leave the ledger.
        let cancelled = pending.min(amount);
        let from_ledger = amount - cancelled;
        if ledger.available_balance < from_ledger {
            return Err(ChainError::reverted("InsufficientBalance", &[user]));
        }
        ledger.available_balance -= from_ledger;

        let providers = match service_type {
            ServiceType::Inference => &mut ledger.inference_providers,
            ServiceType::FineTuning => &mut ledger.fine_tuning_providers,
        };
        if !providers.contains(&provider) {
            providers.push(provider);
        }

        let account = self
            .accounts
            .entry((user, provider, service_type))
            .or_insert_with(|| Account {
                user,
                provider,
                balance: 0,
                pending_refund: 0,
                nonce: 0,
                signer_pub_key: ledger.settlement_pub_key,
                provider_signer: None,
                additional_info: ledger.additional_info.clone(),
                deliverables: Vec::new(),
            });
        account.pending_refund -= cancelled;
        account.balance = account.balance.saturating_add(from_ledger);
        Ok(())
    }

    fn settle(
        &mut self,
        provider: Address,
        user: Address,
        service_type: ServiceType,
        requests: &[SignedRequest],
    ) -> ChainResult<()> {
        let account = self
            .accounts
            .get(&(user, provider, service_type))
            .ok_or_else(|| account_missing(user, provider))?;

        let mut last = account.nonce;
        let mut total = 0u128;
        for signed in requests {
            let request = &signed.request;
            if request.user != user || request.provider != provider {
                return Err(ChainError::reverted(
                    "InvalidRequest",
                    &[request.user, request.provider],
                ));
            }
            if request.nonce <= last {
                return Err(ChainError::reverted(
                    "InvalidNonce",
                    &[request.nonce, last],
                ));
            }
            if !verify_request(request, &signed.signature, &account.signer_pub_key) {
                return Err(ChainError::reverted("InvalidSignature", &[request.nonce]));
            }
            last = request.nonce;
            total = total.saturating_add(request.fee);
        }
        if total > account.available() {
            return Err(ChainError::reverted("InsufficientBalance", &[user]));
        }

        if let Some(account) = self.accounts.get_mut(&(user, provider, service_type)) {
            account.balance -= total;
            account.nonce = last;
        }
        if let Some(ledger) = self.ledgers.get_mut(&user) {
            ledger.total_balance = ledger.total_balance.saturating_sub(total);
        }
        debug!("Settled {} requests for {total} from {user}", requests.len());
        Ok(())
    }
}

fn account_missing(user: Address, provider: Address) -> ChainError {
    ChainError::reverted("AccountNotExists", &[user, provider])
}

fn deliverable_missing(provider: Address, index: usize) -> ChainError {
    ChainError::reverted("DeliverableNotExists", &[provider.to_string(), index.to_string()])
}

fn tx_hash(sender: Address, counter: u64) -> TxHash {
    let mut hasher = Sha256::new();
    hasher.update(sender.as_bytes());
    hasher.update(counter.to_le_bytes());
    TxHash(hasher.finalize().into())
}
