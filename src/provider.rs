//! Provider-facing capabilities.
//!
//! - [`ServiceRegistry`]: cached reads of on-chain service registrations
//! - [`ProviderClient`]: the provider's HTTP endpoints (quote, response
//!   signatures, GPU attestation)
//! - [`QuoteVerifier`]: external verification of attestation quotes
//! - [`ContentFetcher`]: download of deliverables from the storage network

use crate::cache::Cache;
use crate::chain::LedgerChain;
use crate::config::HttpConfig;
use crate::error::{Error, Result};
use crate::types::{Address, Service, ServiceType};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

/// Attestation quote published by a provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderQuote {
    /// Hex-encoded TEE quote.
    pub quote: String,
    /// Signing address bound into the quote.
    pub signing_address: Address,
    /// GPU attestation evidence, when the provider runs on a confidential GPU.
    #[serde(default, rename = "nvidia_payload", skip_serializing_if = "Option::is_none")]
    pub gpu_payload: Option<serde_json::Value>,
}

/// A provider's signature over one response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseSignature {
    /// The signed response text.
    pub text: String,
    /// Hex-encoded 65-byte recoverable signature.
    pub signature: String,
}

/// The provider's HTTP surface.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    /// Fetch the provider's attestation quote.
    async fn quote(&self, service: &Service) -> Result<ProviderQuote>;

    /// Fetch the signature for a response. `None` when the provider has none.
    async fn response_signature(
        &self,
        service: &Service,
        response_id: &str,
    ) -> Result<Option<ResponseSignature>>;

    /// Ask the provider-hosted GPU verifier to check `payload`.
    async fn verify_gpu(&self, service: &Service, payload: &serde_json::Value) -> Result<bool>;
}

/// Verifies attestation quotes.
#[async_trait]
pub trait QuoteVerifier: Send + Sync {
    /// Returns true if the quote is authentic.
    async fn verify(&self, quote: &ProviderQuote) -> Result<bool>;
}

/// Fetches content from the storage network by root hash.
#[async_trait]
pub trait ContentFetcher: Send + Sync {
    /// Download the content with `root_hash` to `destination`.
    async fn fetch(&self, root_hash: &[u8; 32], destination: &Path) -> Result<()>;
}

fn http_client(config: &HttpConfig) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(concat!("compute-broker/", env!("CARGO_PKG_VERSION")))
        .timeout(Duration::from_secs(config.timeout_secs))
        .build()
        .map_err(|e| Error::Config(format!("Failed to create HTTP client: {e}")))
}

fn endpoint(service: &Service, path: &str) -> String {
    format!("{}{path}", service.url.trim_end_matches('/'))
}

/// [`ProviderClient`] over HTTP.
#[derive(Debug, Clone)]
pub struct HttpProviderClient {
    client: reqwest::Client,
}

impl HttpProviderClient {
    /// Create a client with the configured timeout.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the HTTP client cannot be built.
    pub fn new(config: &HttpConfig) -> Result<Self> {
        Ok(Self {
            client: http_client(config)?,
        })
    }
}

#[derive(Debug, Deserialize)]
struct SignatureBody {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    signature: Option<String>,
}

#[derive(Debug, Deserialize)]
struct VerdictBody {
    #[serde(default, alias = "valid")]
    verified: bool,
}

#[async_trait]
impl ProviderClient for HttpProviderClient {
    async fn quote(&self, service: &Service) -> Result<ProviderQuote> {
        let url = endpoint(service, "/v1/quote");
        debug!("Fetching quote from {url}");
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::Provider(format!("quote request to {url} failed: {e}")))?;
        if !response.status().is_success() {
            return Err(Error::Provider(format!(
                "quote endpoint {url} returned status: {}",
                response.status()
            )));
        }
        response
            .json()
            .await
            .map_err(|e| Error::Provider(format!("Failed to parse quote: {e}")))
    }

    async fn response_signature(
        &self,
        service: &Service,
        response_id: &str,
    ) -> Result<Option<ResponseSignature>> {
        let url = endpoint(service, &format!("/v1/signature/{response_id}"));
        trace!("Fetching response signature from {url}");
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::Provider(format!("signature request to {url} failed: {e}")))?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(Error::Provider(format!(
                "signature endpoint {url} returned status: {}",
                response.status()
            )));
        }
        let body: SignatureBody = response
            .json()
            .await
            .map_err(|e| Error::Provider(format!("Failed to parse signature: {e}")))?;
        Ok(match (body.text, body.signature) {
            (Some(text), Some(signature)) if !signature.is_empty() => {
                Some(ResponseSignature { text, signature })
            }
            _ => None,
        })
    }

    async fn verify_gpu(&self, service: &Service, payload: &serde_json::Value) -> Result<bool> {
        let url = endpoint(service, "/v1/gpu/verify");
        debug!("Verifying GPU attestation at {url}");
        let response = self
            .client
            .post(&url)
            .json(payload)
            .send()
            .await
            .map_err(|e| Error::Provider(format!("GPU verification request failed: {e}")))?;
        if !response.status().is_success() {
            return Ok(false);
        }
        let verdict: VerdictBody = response
            .json()
            .await
            .map_err(|e| Error::Provider(format!("Failed to parse GPU verdict: {e}")))?;
        Ok(verdict.verified)
    }
}

/// [`QuoteVerifier`] backed by a remote attestation-verification service.
#[derive(Debug, Clone)]
pub struct HttpQuoteVerifier {
    client: reqwest::Client,
    url: String,
}

impl HttpQuoteVerifier {
    /// Create a verifier posting quotes to `url`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the HTTP client cannot be built.
    pub fn new(url: impl Into<String>, config: &HttpConfig) -> Result<Self> {
        Ok(Self {
            client: http_client(config)?,
            url: url.into(),
        })
    }
}

#[async_trait]
impl QuoteVerifier for HttpQuoteVerifier {
    async fn verify(&self, quote: &ProviderQuote) -> Result<bool> {
        let response = self
            .client
            .post(&self.url)
            .json(&serde_json::json!({ "quote": quote.quote }))
            .send()
            .await
            .map_err(|e| Error::Provider(format!("quote verification request failed: {e}")))?;
        if !response.status().is_success() {
            return Err(Error::Provider(format!(
                "quote verifier returned status: {}",
                response.status()
            )));
        }
        let verdict: VerdictBody = response
            .json()
            .await
            .map_err(|e| Error::Provider(format!("Failed to parse quote verdict: {e}")))?;
        Ok(verdict.verified)
    }
}

/// Cached reads of provider service registrations.
pub struct ServiceRegistry {
    chain: Arc<dyn LedgerChain>,
    cache: Arc<dyn Cache>,
    service_type: ServiceType,
    ttl: Duration,
}

impl ServiceRegistry {
    /// Create a registry for one service type.
    #[must_use]
    pub fn new(
        chain: Arc<dyn LedgerChain>,
        cache: Arc<dyn Cache>,
        service_type: ServiceType,
        ttl: Duration,
    ) -> Self {
        Self {
            chain,
            cache,
            service_type,
            ttl,
        }
    }

    /// Service type this registry serves.
    #[must_use]
    pub fn service_type(&self) -> ServiceType {
        self.service_type
    }

    fn key(&self, provider: Address) -> String {
        format!("service:{}:{provider}", self.service_type)
    }

    /// Look up a provider's service.
    ///
    /// # Errors
    ///
    /// Returns a precondition error if the provider has no registration.
    pub async fn get(&self, provider: Address) -> Result<Service> {
        let key = self.key(provider);
        if let Some(raw) = self.cache.get(&key).await? {
            match serde_json::from_str(&raw) {
                Ok(service) => return Ok(service),
                Err(e) => debug!("Discarding unreadable cached service {key}: {e}"),
            }
        }

        let service = self
            .chain
            .get_service(provider, self.service_type)
            .await?
            .ok_or_else(|| {
                Error::Precondition(format!(
                    "Provider {provider} has no registered {} service",
                    self.service_type
                ))
            })?;
        let raw = serde_json::to_string(&service)
            .map_err(|e| Error::Serialization(format!("Failed to encode service: {e}")))?;
        self.cache.set(&key, &raw, Some(self.ttl)).await?;
        Ok(service)
    }

    /// Drop the cached registration of `provider`.
    ///
    /// # Errors
    ///
    /// Returns a cache error if the entry cannot be removed.
    pub async fn invalidate(&self, provider: Address) -> Result<()> {
        self.cache.delete(&self.key(provider)).await
    }
}
