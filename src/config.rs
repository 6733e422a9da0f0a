// src/config.rs

use crate::error::ConfigError;
use jsonwebtoken::Algorithm;
use serde::Deserialize;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use url::Url;

/// Default upper bound for one key refresh (discovery plus JWKS fetch).
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Default minimum interval between refreshes triggered by an unknown `kid`.
pub const DEFAULT_MISS_REFRESH_COOLDOWN: Duration = Duration::from_secs(10);

/// Contains the validation settings for a bearer token.
///
/// This struct is used to configure the specific checks that will be performed
/// on the token's claims, such as allowed algorithms and clock skew tolerance.
#[derive(Clone, Debug)]
pub struct ValidationDetails {
    /// The signing algorithms that are permitted for the token.
    /// Tokens signed with any other algorithm will be rejected.
    pub algorithms: Vec<Algorithm>,
    /// The tolerance for clock skew when validating time-based claims like `exp`.
    /// Defaults to zero.
    pub leeway: Duration,
    /// Whether to reject tokens whose `nbf` lies in the future.
    pub validate_nbf: bool,
}

impl Default for ValidationDetails {
    fn default() -> Self {
        Self {
            // Default to RS256, the most common algorithm for OIDC.
            algorithms: vec![Algorithm::RS256],
            leeway: Duration::ZERO,
            validate_nbf: true,
        }
    }
}

/// Defines where signing keys come from and how long they are trusted.
#[derive(Clone, Debug)]
pub struct KeySourceConfig {
    /// The provider's OpenID Connect discovery document URL.
    pub discovery_url: Url,
    /// Optional override for the JWKS endpoint URL. When set, discovery is skipped.
    pub jwks_uri: Option<Url>,
    /// How long a fetched key set is considered fresh. `None` keeps it for the
    /// lifetime of the process unless explicitly invalidated.
    pub cache_ttl: Option<Duration>,
    /// Upper bound for a whole refresh, both network round-trips included.
    pub fetch_timeout: Duration,
    /// Minimum time between lookup-triggered fetches, whether the last one
    /// succeeded or failed.
    pub miss_refresh_cooldown: Duration,
}

/// The main configuration for the authentication gate.
///
/// This struct holds all necessary information to connect to the OIDC provider
/// and validate tokens. It should be constructed using the `ConfigBuilder`.
#[derive(Clone, Debug)]
pub struct Config {
    /// The expected value of the `iss` claim.
    pub issuer: String,
    /// The expected value of the `aud` claim.
    pub audience: String,
    /// The specific validation parameters to apply to the token.
    pub validation: ValidationDetails,
    /// The source for obtaining token verification keys.
    pub key_source: KeySourceConfig,
}

/// A builder for creating a `Config` instance.
///
/// This builder provides a fluent API to ensure that the configuration is
/// constructed correctly and with all required fields.
#[derive(Default)]
pub struct ConfigBuilder {
    issuer: Option<String>,
    audience: Option<String>,
    discovery_url: Option<Url>,
    jwks_uri: Option<Url>,
    cache_ttl: Option<Duration>,
    fetch_timeout: Option<Duration>,
    miss_refresh_cooldown: Option<Duration>,
    validation: ValidationDetails,
}

impl ConfigBuilder {
    /// Creates a new `ConfigBuilder`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the expected issuer. This is a required field.
    ///
    /// When no discovery URL is set and the issuer is a URL, discovery falls back
    /// to `{issuer}/.well-known/openid-configuration`.
    pub fn issuer(mut self, issuer: impl Into<String>) -> Self {
        self.issuer = Some(issuer.into());
        self
    }

    /// Sets the expected audience, usually the API's client id. This is a required field.
    pub fn audience(mut self, audience: impl Into<String>) -> Self {
        self.audience = Some(audience.into());
        self
    }

    /// Sets the provider's discovery document URL.
    pub fn discovery_url(mut self, url: &str) -> Result<Self, ConfigError> {
        let parsed_url = Url::parse(url).map_err(|e| ConfigError::InvalidUrl(e.to_string()))?;
        self.discovery_url = Some(parsed_url);
        Ok(self)
    }

    /// Sets an explicit JWKS URI, bypassing OIDC discovery. This is optional.
    pub fn jwks_uri(mut self, url: &str) -> Result<Self, ConfigError> {
        let parsed_url = Url::parse(url).map_err(|e| ConfigError::InvalidUrl(e.to_string()))?;
        self.jwks_uri = Some(parsed_url);
        Ok(self)
    }

    /// Sets how long a fetched key set stays fresh. This is optional.
    pub fn cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = Some(ttl);
        self
    }

    /// Sets the upper bound for one key refresh. Defaults to 10 seconds.
    pub fn fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = Some(timeout);
        self
    }

    /// Sets the minimum interval between fetches caused by lookups (unknown key
    /// ids or a failed provider).
    /// Defaults to 10 seconds.
    pub fn miss_refresh_cooldown(mut self, cooldown: Duration) -> Self {
        self.miss_refresh_cooldown = Some(cooldown);
        self
    }

    /// Sets the allowed signing algorithms.
    /// Defaults to `[Algorithm::RS256]` if not set.
    pub fn algorithms(mut self, algorithms: Vec<Algorithm>) -> Self {
        self.validation.algorithms = algorithms;
        self
    }

    /// Sets the clock skew tolerance. Defaults to zero.
    pub fn leeway(mut self, leeway: Duration) -> Self {
        self.validation.leeway = leeway;
        self
    }

    /// Enables or disables `nbf` validation. Enabled by default.
    pub fn validate_nbf(mut self, validate: bool) -> Self {
        self.validation.validate_nbf = validate;
        self
    }

    /// Consumes the builder and returns a `Config` object.
    ///
    /// # Errors
    ///
    /// Returns an error if required fields (`issuer`, `audience`) are missing, if
    /// no discovery URL can be determined, or if the algorithm list is empty or
    /// contains a symmetric algorithm.
    pub fn build(self) -> Result<Config, ConfigError> {
        let issuer = self
            .issuer
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ConfigError::MissingConfiguration("issuer".to_string()))?;
        let audience = self
            .audience
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ConfigError::MissingConfiguration("audience".to_string()))?;

        let discovery_url = match self.discovery_url {
            Some(url) => url,
            None => issuer_discovery_url(&issuer)
                .ok_or_else(|| ConfigError::MissingConfiguration("discovery_url".to_string()))?,
        };

        if self.validation.algorithms.is_empty() {
            return Err(ConfigError::InvalidConfiguration(
                "at least one signing algorithm must be allowed".to_string(),
            ));
        }
        if let Some(alg) = self
            .validation
            .algorithms
            .iter()
            .find(|alg| matches!(alg, Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512))
        {
            return Err(ConfigError::InvalidConfiguration(format!(
                "symmetric algorithm {:?} cannot be verified against a JWKS",
                alg
            )));
        }

        let fetch_timeout = self.fetch_timeout.unwrap_or(DEFAULT_FETCH_TIMEOUT);
        if fetch_timeout.is_zero() {
            return Err(ConfigError::InvalidConfiguration(
                "fetch_timeout must be greater than zero".to_string(),
            ));
        }
        if self.cache_ttl.is_some_and(|ttl| ttl.is_zero()) {
            return Err(ConfigError::InvalidConfiguration(
                "cache_ttl must be greater than zero".to_string(),
            ));
        }

        Ok(Config {
            issuer,
            audience,
            validation: self.validation,
            key_source: KeySourceConfig {
                discovery_url,
                jwks_uri: self.jwks_uri,
                cache_ttl: self.cache_ttl,
                fetch_timeout,
                miss_refresh_cooldown: self
                    .miss_refresh_cooldown
                    .unwrap_or(DEFAULT_MISS_REFRESH_COOLDOWN),
            },
        })
    }
}

fn issuer_discovery_url(issuer: &str) -> Option<Url> {
    let base = Url::parse(&format!("{}/", issuer.trim_end_matches('/'))).ok()?;
    base.join(".well-known/openid-configuration").ok()
}

fn default_listen_addr() -> String {
    "127.0.0.1:8000".to_string()
}

fn default_allowed_origins() -> Vec<String> {
    vec!["http://localhost:5173".to_string()]
}

/// The on-disk configuration for the `oidc-gate` binary.
///
/// ```yaml
/// listen_addr: "0.0.0.0:8000"
/// allowed_origins: ["http://localhost:5173"]
/// discovery_url: "https://idp.example.com/.well-known/openid-configuration"
/// issuer: "https://idp.example.com/"
/// audience: "api-client"
/// ```
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default = "default_allowed_origins")]
    pub allowed_origins: Vec<String>,
    pub discovery_url: Option<String>,
    pub jwks_uri: Option<String>,
    pub issuer: String,
    pub audience: String,
    pub algorithms: Option<Vec<String>>,
    pub leeway_seconds: Option<u64>,
    pub cache_ttl_seconds: Option<u64>,
    pub fetch_timeout_seconds: Option<u64>,
    pub miss_refresh_cooldown_seconds: Option<u64>,
    pub validate_nbf: Option<bool>,
}

impl FileConfig {
    /// Parses a YAML document.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Reads and parses a YAML file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let yaml = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&yaml)
    }

    /// Converts the file representation into a validated [`Config`].
    pub fn to_config(&self) -> Result<Config, ConfigError> {
        let mut builder = ConfigBuilder::new()
            .issuer(self.issuer.clone())
            .audience(self.audience.clone());

        if let Some(url) = &self.discovery_url {
            builder = builder.discovery_url(url)?;
        }
        if let Some(url) = &self.jwks_uri {
            builder = builder.jwks_uri(url)?;
        }
        if let Some(algs) = &self.algorithms {
            let algorithms = algs
                .iter()
                .map(|s| {
                    Algorithm::from_str(s).map_err(|_| {
                        ConfigError::InvalidConfiguration(format!("unknown algorithm: {}", s))
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;
            builder = builder.algorithms(algorithms);
        }
        if let Some(secs) = self.leeway_seconds {
            builder = builder.leeway(Duration::from_secs(secs));
        }
        if let Some(secs) = self.cache_ttl_seconds {
            builder = builder.cache_ttl(Duration::from_secs(secs));
        }
        if let Some(secs) = self.fetch_timeout_seconds {
            builder = builder.fetch_timeout(Duration::from_secs(secs));
        }
        if let Some(secs) = self.miss_refresh_cooldown_seconds {
            builder = builder.miss_refresh_cooldown(Duration::from_secs(secs));
        }
        if let Some(validate) = self.validate_nbf {
            builder = builder.validate_nbf(validate);
        }
        builder.build()
    }
}
