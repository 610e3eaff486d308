//! Settlement request signing.
//!
//! Every request carries a 64-byte Ed25519 signature over its 60-byte
//! [`Request`] record, made with the user's settlement key. The settlement
//! private key lives on-chain in sealed form (`additional_info`), encrypted
//! under a key derived from the user's wallet secret.

use crate::error::{Error, Result};
use crate::types::Request;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use hkdf::Hkdf;
use sha2::{Digest, Sha256};

/// Length of a packed settlement signature.
pub const SIGNATURE_LEN: usize = 64;

/// Nonce size used when sealing the settlement key.
const SEAL_NONCE_SIZE: usize = 12;

/// HKDF info string for the sealing key.
const SEAL_INFO: &[u8] = b"compute-broker/settlement-key/v1";

/// The user's settlement key pair.
#[derive(Clone)]
pub struct SettlementKey {
    signing: SigningKey,
}

impl std::fmt::Debug for SettlementKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SettlementKey")
            .field("public", &hex::encode(self.public_key()))
            .finish_non_exhaustive()
    }
}

impl SettlementKey {
    /// Generate a fresh settlement key.
    #[must_use]
    pub fn generate() -> Self {
        let seed: [u8; 32] = rand::random();
        Self::from_seed(&seed)
    }

    /// Rebuild a key from its 32-byte seed.
    #[must_use]
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self {
            signing: SigningKey::from_bytes(seed),
        }
    }

    /// The 32-byte verifying key registered on-chain.
    #[must_use]
    pub fn public_key(&self) -> [u8; 32] {
        self.signing.verifying_key().to_bytes()
    }

    /// Sign a request record.
    #[must_use]
    pub fn sign_request(&self, request: &Request) -> [u8; SIGNATURE_LEN] {
        self.sign(&request.to_bytes())
    }

    /// Sign arbitrary bytes.
    #[must_use]
    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_LEN] {
        self.signing.sign(message).to_bytes()
    }

    /// Seal the private seed under a key derived from `wallet_secret`.
    ///
    /// Output layout: `[12-byte nonce][ciphertext || tag]`.
    ///
    /// # Errors
    ///
    /// Returns a crypto error if encryption fails.
    pub fn seal(&self, wallet_secret: &[u8]) -> Result<Vec<u8>> {
        let cipher = sealing_cipher(wallet_secret)?;
        let nonce_bytes: [u8; SEAL_NONCE_SIZE] = rand::random();
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), self.signing.to_bytes().as_slice())
            .map_err(|e| Error::Crypto(format!("failed to seal settlement key: {e}")))?;

        let mut out = Vec::with_capacity(SEAL_NONCE_SIZE + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Open a sealed settlement key.
    ///
    /// # Errors
    ///
    /// Returns a crypto error if the data is truncated, the wallet secret is
    /// wrong, or the plaintext is not a 32-byte seed.
    pub fn open(sealed: &[u8], wallet_secret: &[u8]) -> Result<Self> {
        if sealed.len() <= SEAL_NONCE_SIZE {
            return Err(Error::Crypto(format!(
                "sealed settlement key too short: {} bytes",
                sealed.len()
            )));
        }
        let (nonce, ciphertext) = sealed.split_at(SEAL_NONCE_SIZE);
        let cipher = sealing_cipher(wallet_secret)?;
        let seed = cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|e| Error::Crypto(format!("failed to open settlement key: {e}")))?;
        let seed: [u8; 32] = seed
            .try_into()
            .map_err(|_| Error::Crypto("settlement key seed must be 32 bytes".to_string()))?;
        Ok(Self::from_seed(&seed))
    }
}

fn sealing_cipher(wallet_secret: &[u8]) -> Result<Aes256Gcm> {
    let hkdf = Hkdf::<Sha256>::new(None, wallet_secret);
    let mut key = [0u8; 32];
    hkdf.expand(SEAL_INFO, &mut key)
        .map_err(|e| Error::Crypto(format!("HKDF expansion failed: {e}")))?;
    Aes256Gcm::new_from_slice(&key).map_err(|e| Error::Crypto(format!("invalid key: {e}")))
}

/// Verify a settlement signature over raw bytes.
#[must_use]
pub fn verify(message: &[u8], signature: &[u8], public_key: &[u8; 32]) -> bool {
    let Ok(signature) = <[u8; SIGNATURE_LEN]>::try_from(signature) else {
        return false;
    };
    let Ok(key) = VerifyingKey::from_bytes(public_key) else {
        return false;
    };
    key.verify(message, &Signature::from_bytes(&signature)).is_ok()
}

/// Verify a settlement signature over a request record.
#[must_use]
pub fn verify_request(request: &Request, signature: &[u8], public_key: &[u8; 32]) -> bool {
    verify(&request.to_bytes(), signature, public_key)
}

/// Correlation hash the provider uses to locate a request:
/// `sha256(nonce_le || user_le || provider_le)`.
#[must_use]
pub fn request_hash(request: &Request) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(request.nonce.to_le_bytes());
    hasher.update(request.user.to_le_bytes());
    hasher.update(request.provider.to_le_bytes());
    hasher.finalize().into()
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use crate::types::Address;
    use proptest::prelude::*;

    fn request(nonce: u64, fee: u128) -> Request {
        Request {
            nonce,
            fee,
            user: Address::new([0xAA; 20]),
            provider: Address::new([0xBB; 20]),
        }
    }

    #[test]
    fn test_sign_verify_request() {
        let key = SettlementKey::generate();
        let req = request(40, 1000);
        let sig = key.sign_request(&req);
        assert!(verify_request(&req, &sig, &key.public_key()));
    }

    #[test]
    fn test_wrong_key_rejected() {
        let key = SettlementKey::generate();
        let other = SettlementKey::generate();
        let req = request(40, 1000);
        let sig = key.sign_request(&req);
        assert!(!verify_request(&req, &sig, &other.public_key()));
    }

    #[test]
    fn test_signature_is_deterministic() {
        let key = SettlementKey::from_seed(&[4u8; 32]);
        let req = request(80, 5);
        assert_eq!(key.sign_request(&req), key.sign_request(&req));
    }

    #[test]
    fn test_seal_open() {
        let key = SettlementKey::generate();
        let sealed = key.seal(b"wallet secret").expect("seal");
        let opened = SettlementKey::open(&sealed, b"wallet secret").expect("open");
        assert_eq!(opened.public_key(), key.public_key());
    }

    #[test]
    fn test_open_with_wrong_secret_fails() {
        let key = SettlementKey::generate();
        let sealed = key.seal(b"wallet secret").expect("seal");
        assert!(SettlementKey::open(&sealed, b"other secret").is_err());
        assert!(SettlementKey::open(&sealed[..8], b"wallet secret").is_err());
    }

    #[test]
    fn test_request_hash_ignores_fee() {
        assert_eq!(request_hash(&request(1, 10)), request_hash(&request(1, 99)));
        assert_ne!(request_hash(&request(1, 10)), request_hash(&request(2, 10)));
    }

    proptest! {
        #[test]
        fn prop_single_byte_tamper_fails(
            message in proptest::collection::vec(any::<u8>(), 1..256),
            seed in any::<[u8; 32]>(),
            index in any::<prop::sample::Index>(),
            flip in 1u8..=255,
            tamper_signature in any::<bool>(),
        ) {
            let key = SettlementKey::from_seed(&seed);
            let mut sig = key.sign(&message);
            prop_assert!(verify(&message, &sig, &key.public_key()));

            let mut msg = message.clone();
            if tamper_signature {
                let i = index.index(SIGNATURE_LEN);
                sig[i] ^= flip;
            } else {
                let i = index.index(msg.len());
                msg[i] ^= flip;
            }
            prop_assert!(!verify(&msg, &sig, &key.public_key()));
        }
    }
}
