//! Cryptographic building blocks.
//!
//! - [`settlement`]: Ed25519 request signatures and the sealed settlement key
//! - [`ecdsa`]: recoverable secp256k1 signatures (provider responses, tag chains)
//! - [`ecies`]: session keys sealed to the user's wallet key

pub mod ecdsa;
pub mod ecies;
pub mod settlement;

pub use ecdsa::{hash_message, recover_address, sign_message, RECOVERABLE_SIGNATURE_LEN};
pub use settlement::{request_hash, verify_request, SettlementKey, SIGNATURE_LEN};
