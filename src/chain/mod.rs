//! Typed access to the settlement contracts.
//!
//! The broker never talks to a node directly. Everything on-chain goes through
//! the [`LedgerChain`] trait: typed reads of ledgers, sub-accounts and service
//! registrations, and submission of [`ContractCall`]s. Adapters classify node
//! failures into [`ChainError`] so the submission loop only has to match on a
//! closed set of outcomes.
//!
//! [`memory::MemoryChain`] is a complete in-process implementation of the
//! contract rules, used as the local development chain and in tests.

mod error;
pub mod memory;
pub mod revert;

pub use error::{ChainError, RetryableKind};
pub use memory::MemoryChain;

use crate::crypto::SIGNATURE_LEN;
use crate::types::{Account, Address, Ledger, Request, Service, ServiceType};
use async_trait::async_trait;
use std::fmt;

/// Result type for chain adapter calls.
pub type ChainResult<T> = std::result::Result<T, ChainError>;

/// Hash of a submitted transaction.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TxHash(pub [u8; 32]);

impl fmt::Display for TxHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for TxHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TxHash({self})")
    }
}

/// Block tag for transaction-count queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockTag {
    /// Confirmed state.
    Latest,
    /// Confirmed state plus the mempool.
    Pending,
}

/// Per-attempt transaction parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxOptions {
    /// Gas price for this attempt.
    pub gas_price: u128,
    /// Explicit sender nonce; `None` lets the adapter pick the next one.
    pub nonce: Option<u64>,
}

/// Confirmation of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Receipt {
    /// Hash of the confirmed transaction.
    pub tx_hash: TxHash,
    /// Block the transaction was included in.
    pub block_number: u64,
}

/// A signed request submitted for settlement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedRequest {
    /// The request record.
    pub request: Request,
    /// Settlement signature over the 60-byte record.
    pub signature: [u8; SIGNATURE_LEN],
}

/// State-changing contract calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContractCall {
    /// Create the caller's ledger.
    AddLedger {
        /// Initial balance.
        balance: u128,
        /// Settlement verifying key.
        settlement_pub_key: [u8; 32],
        /// Sealed settlement private key.
        additional_info: Vec<u8>,
    },
    /// Add funds to the caller's ledger.
    DepositFund {
        /// Amount to add.
        amount: u128,
    },
    /// Withdraw available funds from the caller's ledger.
    Refund {
        /// Amount to withdraw.
        amount: u128,
    },
    /// Delete the caller's ledger.
    DeleteLedger,
    /// Move funds from the ledger into a provider sub-account.
    TransferFund {
        /// Target provider.
        provider: Address,
        /// Sub-account service type.
        service_type: ServiceType,
        /// Amount to move.
        amount: u128,
    },
    /// Request refunds of all available sub-account funds.
    RetrieveFund {
        /// Providers to retrieve from.
        providers: Vec<Address>,
        /// Sub-account service type.
        service_type: ServiceType,
    },
    /// Record the provider's attested signing address.
    AcknowledgeProviderSigner {
        /// Provider.
        provider: Address,
        /// Sub-account service type.
        service_type: ServiceType,
        /// Attested signing address.
        signer: Address,
    },
    /// Confirm receipt of a fine-tuning deliverable.
    AcknowledgeDeliverable {
        /// Provider.
        provider: Address,
        /// Deliverable index in the sub-account.
        index: usize,
    },
    /// Provider-side settlement of signed requests.
    SettleFees {
        /// Paying user.
        user: Address,
        /// Sub-account service type.
        service_type: ServiceType,
        /// Signed requests, in nonce order.
        requests: Vec<SignedRequest>,
    },
}

impl ContractCall {
    /// Contract function name, for logs.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::AddLedger { .. } => "addLedger",
            Self::DepositFund { .. } => "depositFund",
            Self::Refund { .. } => "refund",
            Self::DeleteLedger => "deleteLedger",
            Self::TransferFund { .. } => "transferFund",
            Self::RetrieveFund { .. } => "retrieveFund",
            Self::AcknowledgeProviderSigner { .. } => "acknowledgeProviderSigner",
            Self::AcknowledgeDeliverable { .. } => "acknowledgeDeliverable",
            Self::SettleFees { .. } => "settleFees",
        }
    }
}

/// Typed RPC surface of the ledger and serving contracts.
///
/// An adapter is bound to one sending account (the wallet it signs with).
#[async_trait]
pub trait LedgerChain: Send + Sync {
    /// Address transactions are sent from.
    fn sender(&self) -> Address;

    /// Read a user's ledger.
    async fn get_ledger(&self, user: Address) -> ChainResult<Option<Ledger>>;

    /// Read a user's sub-account with a provider.
    async fn get_account(
        &self,
        user: Address,
        provider: Address,
        service_type: ServiceType,
    ) -> ChainResult<Option<Account>>;

    /// Read a provider's service registration.
    async fn get_service(
        &self,
        provider: Address,
        service_type: ServiceType,
    ) -> ChainResult<Option<Service>>;

    /// Submit a call. Reverts detected at submission are returned here.
    async fn submit(&self, call: &ContractCall, options: &TxOptions) -> ChainResult<TxHash>;

    /// Wait until a submitted transaction is confirmed.
    async fn wait_for_receipt(&self, tx_hash: &TxHash) -> ChainResult<Receipt>;

    /// Gas price suggested by the node.
    async fn suggested_gas_price(&self) -> ChainResult<u128>;

    /// Sender transaction count at `tag`.
    async fn transaction_count(&self, tag: BlockTag) -> ChainResult<u64>;
}
