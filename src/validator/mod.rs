// src/validator/mod.rs

pub mod client;
pub mod model;
pub mod source;

use crate::config::ValidationDetails;
use crate::error::AuthError;
use client::KeyStore;
use jsonwebtoken::{decode, decode_header, Validation};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, instrument};

/// Tokens longer than this are rejected before any parsing.
pub const MAX_TOKEN_SIZE: usize = 8 * 1024;

/// The claims of a successfully validated token.
///
/// Holds every claim the token carried, registered or not, exactly as issued.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Claims(Map<String, Value>);

impl Claims {
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    pub fn subject(&self) -> Option<&str> {
        self.get("sub").and_then(Value::as_str)
    }

    pub fn issuer(&self) -> Option<&str> {
        self.get("iss").and_then(Value::as_str)
    }

    /// The `aud` claim, whether issued as a single string or an array.
    pub fn audience(&self) -> Vec<&str> {
        match self.get("aud") {
            Some(Value::String(aud)) => vec![aud.as_str()],
            Some(Value::Array(auds)) => auds.iter().filter_map(Value::as_str).collect(),
            _ => Vec::new(),
        }
    }

    /// The `exp` claim as seconds since the Unix epoch.
    pub fn expiry(&self) -> Option<i64> {
        self.get("exp").and_then(Value::as_i64)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_inner(self) -> Map<String, Value> {
        self.0
    }
}

/// The bearer token validator.
///
/// This struct should be created once and reused for all validation requests.
/// It resolves keys through the [`KeyStore`] and performs every check a token
/// must pass before its claims are trusted.
#[derive(Clone)]
pub struct Validator {
    key_store: KeyStore,
    details: ValidationDetails,
}

impl Validator {
    /// Creates a new `Validator` over the given key store.
    pub fn new(key_store: KeyStore, details: ValidationDetails) -> Self {
        Self { key_store, details }
    }

    pub fn key_store(&self) -> &KeyStore {
        &self.key_store
    }

    /// Validates a bearer token.
    ///
    /// 1. Parses the header without verifying anything; it must carry a `kid`.
    /// 2. Resolves the signing key for that `kid`.
    /// 3. Checks the header algorithm against the allow-list and the key, then
    ///    verifies the signature.
    /// 4. Validates `exp`, `aud` and `iss` (and `nbf` when enabled).
    ///
    /// Expiry is inclusive at second granularity: a token is rejected once
    /// `exp < now - leeway`, so one whose `exp` is the current second still passes.
    ///
    /// No step is retried; a failure is final for this token.
    #[instrument(skip(self, raw_token), err)]
    pub async fn validate(
        &self,
        raw_token: &str,
        expected_audience: &str,
        expected_issuer: &str,
    ) -> Result<Claims, AuthError> {
        if raw_token.len() > MAX_TOKEN_SIZE {
            return Err(AuthError::MalformedToken(format!(
                "token exceeds {} bytes",
                MAX_TOKEN_SIZE
            )));
        }

        // 1. Decode header to get kid and alg without validation.
        let header = decode_header(raw_token)
            .map_err(|e| AuthError::MalformedToken(format!("unreadable header: {}", e)))?;
        let kid = header
            .kid
            .filter(|kid| !kid.is_empty())
            .ok_or_else(|| AuthError::MalformedToken("header has no 'kid'".to_string()))?;

        // 2. Resolve the signing key.
        let key = self.key_store.get_signing_key(&kid).await?;

        // 3. Only algorithms on the allow-list that fit the key are considered.
        if !self.details.algorithms.contains(&header.alg) {
            return Err(AuthError::SignatureInvalid(format!(
                "algorithm {:?} is not allowed",
                header.alg
            )));
        }
        if !key.supports(header.alg) {
            return Err(AuthError::SignatureInvalid(format!(
                "key '{}' cannot verify {:?} signatures",
                kid, header.alg
            )));
        }

        // 4. Construct validation options.
        let mut validation = Validation::new(header.alg);
        validation.leeway = self.details.leeway.as_secs();
        validation.validate_exp = true;
        validation.validate_nbf = self.details.validate_nbf;
        validation.set_issuer(&[expected_issuer]);
        validation.set_audience(&[expected_audience]);
        validation.set_required_spec_claims(&["exp", "iss", "aud"]);

        // 5. Verify the signature, then the claims.
        let token_data = decode::<Map<String, Value>>(raw_token, key.decoding_key(), &validation)?;

        debug!(kid = %kid, sub = ?token_data.claims.get("sub"), "Token validated successfully");
        Ok(Claims(token_data.claims))
    }
}
