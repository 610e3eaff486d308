//! E2E tests for compute-broker.
//!
//! Each test drives a full [`compute_broker::Broker`] against the in-memory
//! development chain and stub provider endpoints.
//!
//! ## Architecture
//!
//! ```text
//! TestHarness
//!     ├── MemoryChain (ledger, sub-accounts, services)
//!     ├── StubProvider (quotes, response signatures, GPU check)
//!     ├── StubFetcher (storage network)
//!     └── Broker (file-backed context in a temp dir)
//! ```

mod harness;

#[cfg(test)]
mod fine_tuning;
#[cfg(test)]
mod inference;
#[cfg(test)]
mod ledger;

pub use harness::{TestHarness, PROVIDER};
