//! Response signature verification.
//!
//! A provider signs each response with its attested signing key. The verifier
//! fetches `{text, signature}` for a response id, checks that the signed text
//! covers the content actually delivered, recovers the signer from the EIP-191
//! hash of the text and compares it to the acknowledged signer.

use crate::attestation::ProviderAttestor;
use crate::crypto::ecdsa::parse_signature_hex;
use crate::crypto::recover_address;
use crate::error::Result;
use crate::provider::{ProviderClient, ServiceRegistry};
use crate::types::Address;
use std::sync::Arc;
use tracing::{debug, warn};

/// Checks that responses come from the acknowledged provider signer.
pub struct ResponseVerifier {
    services: Arc<ServiceRegistry>,
    client: Arc<dyn ProviderClient>,
    attestor: Arc<ProviderAttestor>,
}

impl ResponseVerifier {
    /// Create a verifier.
    #[must_use]
    pub fn new(
        services: Arc<ServiceRegistry>,
        client: Arc<dyn ProviderClient>,
        attestor: Arc<ProviderAttestor>,
    ) -> Self {
        Self {
            services,
            client,
            attestor,
        }
    }

    /// Verify that `content` is the response `response_id` signed by `provider`.
    ///
    /// Returns `Ok(false)` when the provider has no signature for the
    /// response, the signed text does not contain `content`, or the signature
    /// does not recover to the acknowledged signer.
    ///
    /// # Errors
    ///
    /// Fails if the provider is unreachable or its signer is not acknowledged.
    pub async fn verify(
        &self,
        provider: Address,
        content: &str,
        response_id: &str,
    ) -> Result<bool> {
        let signer = self.attestor.ensure_acknowledged(provider).await?;
        let service = self.services.get(provider).await?;

        let Some(signed) = self.client.response_signature(&service, response_id).await? else {
            warn!("Provider {provider} has no signature for response {response_id}");
            return Ok(false);
        };
        if !signed.text.contains(content) {
            warn!("Signed text of response {response_id} does not cover the delivered content");
            return Ok(false);
        }

        let recovered = parse_signature_hex(&signed.signature)
            .and_then(|signature| recover_address(signed.text.as_bytes(), &signature));
        match recovered {
            Ok(address) if address == signer => {
                debug!("Response {response_id} signed by {signer}");
                Ok(true)
            }
            Ok(address) => {
                warn!("Response {response_id} signed by {address}, expected {signer}");
                Ok(false)
            }
            Err(e) => {
                warn!("Malformed signature for response {response_id}: {e}");
                Ok(false)
            }
        }
    }
}
