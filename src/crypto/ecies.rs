//! ECIES over secp256k1 for deliverable session keys.
//!
//! A provider seals the AEAD session key of a deliverable to the user's
//! wallet public key. Sealed layout:
//!
//! ```text
//! [65-byte ephemeral public key][12-byte nonce][ciphertext || 16-byte tag]
//! ```
//!
//! The AES-256-GCM key is `HKDF-SHA256(ikm = ephemeral || shared_x)`.

use crate::error::{Error, Result};
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use hkdf::Hkdf;
use secp256k1::{ecdh, PublicKey, Secp256k1, SecretKey};
use sha2::Sha256;

const EPHEMERAL_LEN: usize = 65;
const NONCE_SIZE: usize = 12;
const TAG_SIZE: usize = 16;
const ECIES_INFO: &[u8] = b"compute-broker/deliverable-secret/v1";

fn derive_cipher(ephemeral: &[u8; EPHEMERAL_LEN], shared_x: &[u8]) -> Result<Aes256Gcm> {
    let mut ikm = Vec::with_capacity(EPHEMERAL_LEN + shared_x.len());
    ikm.extend_from_slice(ephemeral);
    ikm.extend_from_slice(shared_x);

    let mut key = [0u8; 32];
    Hkdf::<Sha256>::new(None, &ikm)
        .expand(ECIES_INFO, &mut key)
        .map_err(|e| Error::Crypto(format!("HKDF expansion failed: {e}")))?;
    Aes256Gcm::new_from_slice(&key).map_err(|e| Error::Crypto(format!("invalid key: {e}")))
}

/// Seal `secret` to `recipient`.
///
/// # Errors
///
/// Returns a crypto error if encryption fails.
pub fn seal(recipient: &PublicKey, secret: &[u8]) -> Result<Vec<u8>> {
    let secp = Secp256k1::new();
    let (ephemeral_secret, ephemeral_public) = secp.generate_keypair(&mut rand::thread_rng());
    let ephemeral = ephemeral_public.serialize_uncompressed();
    let shared = ecdh::shared_secret_point(recipient, &ephemeral_secret);

    let cipher = derive_cipher(&ephemeral, &shared[..32])?;
    let nonce: [u8; NONCE_SIZE] = rand::random();
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), secret)
        .map_err(|e| Error::Crypto(format!("ECIES encryption failed: {e}")))?;

    let mut out = Vec::with_capacity(EPHEMERAL_LEN + NONCE_SIZE + ciphertext.len());
    out.extend_from_slice(&ephemeral);
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Open a sealed secret with the recipient's secret key.
///
/// # Errors
///
/// Returns a crypto error if the data is truncated, the ephemeral key is
/// invalid, or authentication fails.
pub fn open(secret_key: &SecretKey, sealed: &[u8]) -> Result<Vec<u8>> {
    if sealed.len() < EPHEMERAL_LEN + NONCE_SIZE + TAG_SIZE {
        return Err(Error::Crypto(format!(
            "sealed secret too short: {} bytes",
            sealed.len()
        )));
    }

    let (ephemeral, rest) = sealed.split_at(EPHEMERAL_LEN);
    let (nonce, ciphertext) = rest.split_at(NONCE_SIZE);

    let ephemeral_public = PublicKey::from_slice(ephemeral)
        .map_err(|e| Error::Crypto(format!("invalid ephemeral key: {e}")))?;
    let shared = ecdh::shared_secret_point(&ephemeral_public, secret_key);

    let mut ephemeral_bytes = [0u8; EPHEMERAL_LEN];
    ephemeral_bytes.copy_from_slice(ephemeral);
    let cipher = derive_cipher(&ephemeral_bytes, &shared[..32])?;

    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|e| Error::Crypto(format!("ECIES decryption failed: {e}")))
}
