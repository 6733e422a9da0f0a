// src/validator/source.rs

use super::model::{JsonWebKeySet, OidcDiscoveryDocument};
use crate::config::KeySourceConfig;
use crate::error::{AuthError, ConfigError};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, CACHE_CONTROL};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::{debug, instrument};
use url::Url;

/// A key set as delivered by the provider, before it is turned into usable keys.
#[derive(Debug, Clone)]
pub struct FetchedKeySet {
    pub jwks: JsonWebKeySet,
    /// The `max-age` advertised by the JWKS response, if any.
    pub max_age: Option<Duration>,
}

/// Where the key store gets its key material from.
///
/// The production implementation is [`HttpKeySource`]. Every failure must be
/// reported as [`AuthError::KeyStoreUnavailable`].
#[async_trait]
pub trait KeySource: Send + Sync {
    async fn fetch_key_set(&self) -> Result<FetchedKeySet, AuthError>;
}

/// Fetches the discovery document and then the JWKS over HTTP.
pub struct HttpKeySource {
    http_client: reqwest::Client,
    discovery_url: Url,
    jwks_uri_override: Option<Url>,
}

impl HttpKeySource {
    /// Builds a source whose every request is bounded by `config.fetch_timeout`.
    pub fn new(config: &KeySourceConfig) -> Result<Self, ConfigError> {
        let http_client = reqwest::Client::builder()
            .timeout(config.fetch_timeout)
            .connect_timeout(config.fetch_timeout)
            .user_agent(concat!("oidc-gate/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            http_client,
            discovery_url: config.discovery_url.clone(),
            jwks_uri_override: config.jwks_uri.clone(),
        })
    }

    /// Determines the JWKS URI, either from config override or OIDC discovery.
    async fn get_jwks_uri(&self) -> Result<Url, AuthError> {
        if let Some(uri) = self.jwks_uri_override.clone() {
            debug!("Using JWKS URI from config override: {}", uri);
            return Ok(uri);
        }

        debug!("Performing OIDC discovery at: {}", self.discovery_url);
        let (discovery_doc, _) = self
            .get_json::<OidcDiscoveryDocument>(self.discovery_url.clone(), "discovery document")
            .await?;

        let jwks_uri = discovery_doc.jwks_uri.ok_or_else(|| {
            AuthError::KeyStoreUnavailable("jwks_uri not found in discovery document".to_string())
        })?;
        Url::parse(&jwks_uri).map_err(|e| {
            AuthError::KeyStoreUnavailable(format!("invalid jwks_uri '{}': {}", jwks_uri, e))
        })
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        url: Url,
        what: &str,
    ) -> Result<(T, Option<Duration>), AuthError> {
        let unavailable = |e: reqwest::Error| {
            AuthError::KeyStoreUnavailable(format!("failed to fetch {}: {}", what, e))
        };

        let response = self
            .http_client
            .get(url)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(unavailable)?
            .error_for_status()
            .map_err(unavailable)?;

        let max_age = parse_cache_control(response.headers());
        let body = response.json::<T>().await.map_err(|e| {
            AuthError::KeyStoreUnavailable(format!("invalid {}: {}", what, e))
        })?;
        Ok((body, max_age))
    }
}

#[async_trait]
impl KeySource for HttpKeySource {
    #[instrument(skip(self), err)]
    async fn fetch_key_set(&self) -> Result<FetchedKeySet, AuthError> {
        let jwks_uri = self.get_jwks_uri().await?;
        debug!("Fetching JWKS from: {}", jwks_uri);
        let (jwks, max_age) = self.get_json::<JsonWebKeySet>(jwks_uri, "JWKS").await?;
        Ok(FetchedKeySet { jwks, max_age })
    }
}

/// Parses the `Cache-Control` header to determine the TTL.
pub(crate) fn parse_cache_control(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(CACHE_CONTROL)?
        .to_str()
        .ok()?
        .split(',')
        .find_map(|part| {
            part.trim()
                .strip_prefix("max-age=")?
                .parse::<u64>()
                .ok()
                .map(Duration::from_secs)
        })
}
