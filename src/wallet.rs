//! EVM wallet management for the paying user.
//!
//! Handles parsing and validation of EVM addresses and holds the user's
//! secp256k1 wallet key, from which the settlement-key sealing secret is
//! derived and to which providers seal deliverable secrets.

use crate::crypto::ecdsa::{address_from_public_key, sign_message, RECOVERABLE_SIGNATURE_LEN};
use crate::error::{Error, Result};
use crate::types::{Address, ADDRESS_LEN};
use secp256k1::{PublicKey, Secp256k1, SecretKey};

/// The user's wallet.
#[derive(Clone)]
pub struct Wallet {
    secret: SecretKey,
    public: PublicKey,
    address: Address,
}

impl std::fmt::Debug for Wallet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Wallet")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

impl Wallet {
    /// Create a wallet from a secret key.
    #[must_use]
    pub fn new(secret: SecretKey) -> Self {
        let public = secret.public_key(&Secp256k1::signing_only());
        let address = address_from_public_key(&public);
        Self {
            secret,
            public,
            address,
        }
    }

    /// Generate a random wallet.
    #[must_use]
    pub fn generate() -> Self {
        let secp = Secp256k1::new();
        let (secret, _) = secp.generate_keypair(&mut rand::thread_rng());
        Self::new(secret)
    }

    /// Parse a hex private key (e.g. "0x...").
    ///
    /// # Errors
    ///
    /// Returns an error if the key is not 32 hex-encoded bytes or is out of range.
    pub fn from_hex(private_key: &str) -> Result<Self> {
        let bytes = hex::decode(private_key.trim().trim_start_matches("0x"))
            .map_err(|e| Error::Config(format!("invalid private key hex: {e}")))?;
        let secret = SecretKey::from_slice(&bytes)
            .map_err(|e| Error::Config(format!("invalid private key: {e}")))?;
        Ok(Self::new(secret))
    }

    /// The wallet's EVM address.
    #[must_use]
    pub fn address(&self) -> Address {
        self.address
    }

    /// The wallet's public key.
    #[must_use]
    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    /// The wallet's secret key.
    #[must_use]
    pub fn secret_key(&self) -> &SecretKey {
        &self.secret
    }

    /// Secret material used to seal the settlement key.
    #[must_use]
    pub fn sealing_secret(&self) -> [u8; 32] {
        self.secret.secret_bytes()
    }

    /// Sign an EIP-191 personal message.
    #[must_use]
    pub fn sign_message(&self, message: &[u8]) -> [u8; RECOVERABLE_SIGNATURE_LEN] {
        sign_message(&self.secret, message)
    }
}

/// Parse an EVM address string into an [`Address`].
///
/// # Arguments
///
/// * `address` - EVM address string (e.g., "0x1234...")
///
/// # Errors
///
/// Returns an error if the address format is invalid.
pub fn parse_address(address: &str) -> Result<Address> {
    // Validate format: should start with 0x and be 42 characters total (0x + 40 hex chars)
    if !address.starts_with("0x") && !address.starts_with("0X") {
        return Err(Error::Config(format!(
            "Invalid address format: must start with '0x', got: {address}"
        )));
    }

    if address.len() != 2 + 2 * ADDRESS_LEN {
        return Err(Error::Config(format!(
            "Invalid address length: expected 42 characters, got {}",
            address.len()
        )));
    }

    let hex_part = &address[2..];
    if !hex_part.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(Error::Config(format!(
            "Invalid address: contains non-hex characters: {address}"
        )));
    }

    let bytes =
        hex::decode(hex_part).map_err(|e| Error::Config(format!("Failed to decode address: {e}")))?;

    let mut address_bytes = [0u8; ADDRESS_LEN];
    address_bytes.copy_from_slice(&bytes);

    Ok(Address::new(address_bytes))
}

/// Validate that an EVM address is properly formatted.
#[must_use]
pub fn is_valid_address(address: &str) -> bool {
    parse_address(address).is_ok()
}
