// src/error.rs

use jsonwebtoken::errors::ErrorKind;
use thiserror::Error;

/// The outcome of a failed token verification.
///
/// The `Display` text carries enough detail for server-side logging. Callers
/// that answer an HTTP client should use [`AuthError::category`] instead, which
/// never reveals anything about the identity provider.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuthError {
    /// The token is not a well-formed JWT, or its header lacks a `kid`.
    #[error("Malformed token: {0}")]
    MalformedToken(String),

    /// No key with the token's `kid` exists in the provider's key set.
    #[error("Key not found for kid: {0}")]
    UnknownSigningKey(String),

    /// The signature does not verify, or the algorithm is not allowed for the key.
    #[error("Signature invalid: {0}")]
    SignatureInvalid(String),

    /// A standard claim failed validation. The payload names the claim.
    #[error("Claim invalid: {0}")]
    ClaimInvalid(String),

    /// The identity provider could not be reached or returned unusable data.
    #[error("Key store unavailable: {0}")]
    KeyStoreUnavailable(String),

    /// An unexpected fault that fits none of the categories above.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl AuthError {
    /// A generic, caller-safe description of the failure.
    pub fn category(&self) -> &'static str {
        match self {
            AuthError::MalformedToken(_) => "Invalid token",
            AuthError::UnknownSigningKey(_) => "Signing key not found for this token",
            AuthError::SignatureInvalid(_) => "Invalid token signature",
            AuthError::ClaimInvalid(_) => "Invalid or expired token",
            AuthError::KeyStoreUnavailable(_) => "Unable to retrieve signing keys",
            AuthError::Internal(_) => "Internal error",
        }
    }

    /// The HTTP status this failure maps to.
    ///
    /// Client-caused failures are 401; dependency and internal failures are 500.
    pub fn status_code(&self) -> u16 {
        match self {
            AuthError::MalformedToken(_)
            | AuthError::UnknownSigningKey(_)
            | AuthError::SignatureInvalid(_)
            | AuthError::ClaimInvalid(_) => 401,
            AuthError::KeyStoreUnavailable(_) | AuthError::Internal(_) => 500,
        }
    }

    /// Whether the failure was caused by the presented token rather than by the backend.
    pub fn is_client_error(&self) -> bool {
        self.status_code() == 401
    }
}

impl From<jsonwebtoken::errors::Error> for AuthError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        match err.kind() {
            ErrorKind::InvalidSignature | ErrorKind::InvalidAlgorithm | ErrorKind::Crypto(_) => {
                AuthError::SignatureInvalid(err.to_string())
            }
            ErrorKind::ExpiredSignature => AuthError::ClaimInvalid("expiry".to_string()),
            ErrorKind::ImmatureSignature => AuthError::ClaimInvalid("not_before".to_string()),
            ErrorKind::InvalidAudience => AuthError::ClaimInvalid("audience".to_string()),
            ErrorKind::InvalidIssuer => AuthError::ClaimInvalid("issuer".to_string()),
            ErrorKind::MissingRequiredClaim(claim) => {
                AuthError::ClaimInvalid(claim_reason(claim).to_string())
            }
            ErrorKind::InvalidToken
            | ErrorKind::Base64(_)
            | ErrorKind::Json(_)
            | ErrorKind::Utf8(_)
            | ErrorKind::MissingAlgorithm => AuthError::MalformedToken(err.to_string()),
            ErrorKind::InvalidRsaKey(_) | ErrorKind::InvalidEcdsaKey | ErrorKind::InvalidKeyFormat => {
                AuthError::SignatureInvalid(format!("unusable verification key: {}", err))
            }
            _ => AuthError::Internal(err.to_string()),
        }
    }
}

/// Maps a registered claim name to the reason reported in `ClaimInvalid`.
fn claim_reason(claim: &str) -> &str {
    match claim {
        "exp" => "expiry",
        "aud" => "audience",
        "iss" => "issuer",
        "nbf" => "not_before",
        other => other,
    }
}

/// Errors raised while building a [`crate::config::Config`].
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A provided URL could not be parsed.
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// A required configuration field is missing.
    #[error("A required configuration field is missing: {0}")]
    MissingConfiguration(String),

    /// A configuration value is invalid.
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// The YAML configuration file could not be parsed.
    #[error("Failed to parse configuration file: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// The configuration file could not be read.
    #[error("Failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),

    /// The HTTP client for the identity provider could not be built.
    #[error("Failed to build HTTP client: {0}")]
    HttpClient(#[from] reqwest::Error),
}
