//! Recoverable secp256k1 signatures over EIP-191 personal messages.
//!
//! Providers sign responses and deliverable tag chains with their attested
//! signing key; the client only ever needs to recover the signer's address
//! and compare it with the attested one.

use crate::error::{Error, Result};
use crate::types::{Address, ADDRESS_LEN};
use secp256k1::ecdsa::{RecoverableSignature, RecoveryId};
use secp256k1::{Message, PublicKey, Secp256k1, SecretKey};
use sha3::{Digest, Keccak256};

/// Length of a recoverable signature: `r || s || v`.
pub const RECOVERABLE_SIGNATURE_LEN: usize = 65;

/// Keccak-256 of `data`.
#[must_use]
pub fn keccak256(data: &[u8]) -> [u8; 32] {
    Keccak256::digest(data).into()
}

/// EIP-191 personal-message hash: `keccak256("\x19Ethereum Signed Message:\n" || len || msg)`.
#[must_use]
pub fn hash_message(message: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(b"\x19Ethereum Signed Message:\n");
    hasher.update(message.len().to_string().as_bytes());
    hasher.update(message);
    hasher.finalize().into()
}

/// Derive the EVM address of a secp256k1 public key.
#[must_use]
pub fn address_from_public_key(public_key: &PublicKey) -> Address {
    let uncompressed = public_key.serialize_uncompressed();
    let hash = keccak256(&uncompressed[1..]);
    let mut bytes = [0u8; ADDRESS_LEN];
    bytes.copy_from_slice(&hash[32 - ADDRESS_LEN..]);
    Address::new(bytes)
}

/// Sign `message` as an EIP-191 personal message.
#[must_use]
pub fn sign_message(secret_key: &SecretKey, message: &[u8]) -> [u8; RECOVERABLE_SIGNATURE_LEN] {
    let secp = Secp256k1::signing_only();
    let digest = Message::from_digest(hash_message(message));
    let (recovery_id, compact) = secp
        .sign_ecdsa_recoverable(&digest, secret_key)
        .serialize_compact();

    let mut out = [0u8; RECOVERABLE_SIGNATURE_LEN];
    out[..64].copy_from_slice(&compact);
    // Recovery ids are 0..=3, so the narrowing is lossless.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    {
        out[64] = 27 + recovery_id.to_i32() as u8;
    }
    out
}

/// Recover the address that signed `message` as an EIP-191 personal message.
///
/// Accepts `v` as either `0/1` or `27/28`.
///
/// # Errors
///
/// Returns a crypto error if the signature is malformed or recovery fails.
pub fn recover_address(message: &[u8], signature: &[u8]) -> Result<Address> {
    if signature.len() != RECOVERABLE_SIGNATURE_LEN {
        return Err(Error::Crypto(format!(
            "invalid signature length: expected {RECOVERABLE_SIGNATURE_LEN}, got {}",
            signature.len()
        )));
    }

    let v = signature[64];
    let recovery = match v {
        0 | 1 => i32::from(v),
        27 | 28 => i32::from(v - 27),
        other => {
            return Err(Error::Crypto(format!("invalid recovery id: {other}")));
        }
    };
    let recovery_id = RecoveryId::from_i32(recovery)
        .map_err(|e| Error::Crypto(format!("invalid recovery id: {e}")))?;
    let signature = RecoverableSignature::from_compact(&signature[..64], recovery_id)
        .map_err(|e| Error::Crypto(format!("malformed signature: {e}")))?;

    let secp = Secp256k1::verification_only();
    let digest = Message::from_digest(hash_message(message));
    let public_key = secp
        .recover_ecdsa(&digest, &signature)
        .map_err(|e| Error::Crypto(format!("signature recovery failed: {e}")))?;

    Ok(address_from_public_key(&public_key))
}

/// Parse a hex (optionally `0x`-prefixed) recoverable signature.
///
/// # Errors
///
/// Returns a crypto error if the string is not hex.
pub fn parse_signature_hex(signature: &str) -> Result<Vec<u8>> {
    hex::decode(signature.trim().trim_start_matches("0x"))
        .map_err(|e| Error::Crypto(format!("signature is not hex: {e}")))
}
