//! # compute-broker
//!
//! Client-side broker for a pay-per-use decentralized compute marketplace.
//!
//! The user pays providers per inference request or per fine-tuning job
//! without a trusted intermediary:
//! - every request carries a signed, fee-carrying billing record with a
//!   strictly increasing nonce;
//! - provider sub-accounts are topped up from the user's on-chain ledger as
//!   spend accumulates, with gas-price escalation on congested submissions;
//! - provider signing keys are attested once and acknowledged on-chain, and
//!   responses and deliverables are checked against the acknowledged signer.
//!
//! ## Architecture
//!
//! Components depend only on the [`chain::LedgerChain`] trait for on-chain
//! state, the [`cache::Cache`] trait for local state and the
//! [`provider`] traits for provider endpoints. [`broker::BrokerBuilder`]
//! wires them into a [`broker::Broker`].
//!
//! ## Example
//!
//! ```rust,no_run
//! use compute_broker::chain::MemoryChain;
//! use compute_broker::{BrokerBuilder, BrokerConfig, BrokerContext, Wallet};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let wallet = Wallet::generate();
//!     let chain = MemoryChain::new(wallet.address());
//!     let context = BrokerContext::init(BrokerConfig::default()).await?;
//!     let broker = BrokerBuilder::new(context)
//!         .with_chain(Arc::new(chain))
//!         .build(wallet)?;
//!     broker.ledger().add_ledger(1_000_000).await?;
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod attestation;
pub mod broker;
pub mod cache;
pub mod chain;
pub mod config;
pub mod crypto;
pub mod deliverable;
pub mod error;
pub mod fee;
pub mod ledger;
pub mod nonce;
pub mod provider;
pub mod signer;
pub mod types;
pub mod verifier;
pub mod wallet;

pub use attestation::{AttestationState, ProviderAttestor};
pub use broker::{Broker, BrokerBuilder, BrokerContext, FineTuningBroker, InferenceBroker};
pub use config::BrokerConfig;
pub use deliverable::DeliverableRetriever;
pub use error::{Error, Result};
pub use fee::FeeAccountant;
pub use ledger::LedgerTransferCoordinator;
pub use nonce::NonceAllocator;
pub use signer::{BillingHeaders, RequestSigner};
pub use types::{Account, Address, Deliverable, Ledger, Request, Service, ServiceType};
pub use verifier::ResponseVerifier;
pub use wallet::Wallet;
