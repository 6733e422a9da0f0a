//! Key fixtures, token builders and an in-memory key source for unit tests.

use crate::config::KeySourceConfig;
use crate::error::AuthError;
use crate::validator::model::JsonWebKeySet;
use crate::validator::source::{FetchedKeySet, KeySource};
use async_trait::async_trait;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::traits::PublicKeyParts;
use rsa::RsaPrivateKey;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use url::Url;

pub const RSA_PRIMARY: &str = include_str!("../tests/fixtures/rsa_primary.pem");
pub const RSA_ROGUE: &str = include_str!("../tests/fixtures/rsa_rogue.pem");
pub const EC_PRIMARY: &str = include_str!("../tests/fixtures/ec_primary.pem");
pub const EC_PRIMARY_X: &str = "nnMr96KWPQtc2Jyz7f9W8-n9FAEUtVChWGvorzrglg0";
pub const EC_PRIMARY_Y: &str = "BY0u93RSgHi0Ud-RDrAVKlhFA_gNmPgc3pfX4KjuF5s";

pub const ISSUER: &str = "https://idp/";
pub const AUDIENCE: &str = "api-client";

/// The public JWK for an RSA private key in PKCS#1 PEM form.
pub fn rsa_jwk(kid: &str, private_pem: &str) -> Value {
    let private_key = RsaPrivateKey::from_pkcs1_pem(private_pem).unwrap();
    let public_key = private_key.to_public_key();
    json!({
        "kty": "RSA",
        "kid": kid,
        "use": "sig",
        "n": base64_url::encode(&public_key.n().to_bytes_be()),
        "e": base64_url::encode(&public_key.e().to_bytes_be()),
    })
}

/// The public JWK for [`EC_PRIMARY`].
pub fn ec_jwk(kid: &str) -> Value {
    json!({
        "kty": "EC",
        "kid": kid,
        "use": "sig",
        "crv": "P-256",
        "x": EC_PRIMARY_X,
        "y": EC_PRIMARY_Y,
    })
}

pub fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Claims that pass validation for [`ISSUER`] and [`AUDIENCE`].
pub fn valid_claims() -> Value {
    json!({
        "sub": "user-1",
        "aud": AUDIENCE,
        "iss": ISSUER,
        "exp": now() + 3600,
        "iat": now(),
        "name": "Test User",
    })
}

pub fn sign_rs256(private_pem: &str, kid: Option<&str>, claims: &Value) -> String {
    sign(Algorithm::RS256, private_pem, kid, claims)
}

pub fn sign(alg: Algorithm, private_pem: &str, kid: Option<&str>, claims: &Value) -> String {
    let key = match alg {
        Algorithm::ES256 | Algorithm::ES384 => EncodingKey::from_ec_pem(private_pem.as_bytes()),
        _ => EncodingKey::from_rsa_pem(private_pem.as_bytes()),
    }
    .unwrap();
    let mut header = Header::new(alg);
    header.kid = kid.map(str::to_string);
    encode(&header, claims, &key).unwrap()
}

pub fn key_source_config() -> KeySourceConfig {
    KeySourceConfig {
        discovery_url: Url::parse("http://idp.test/.well-known/openid-configuration").unwrap(),
        jwks_uri: None,
        cache_ttl: None,
        fetch_timeout: Duration::from_secs(2),
        miss_refresh_cooldown: Duration::from_secs(60),
    }
}

struct FakeState {
    jwks: Value,
    failing: bool,
    delay: Duration,
    max_age: Option<Duration>,
}

/// An in-memory identity provider that counts how often it is asked for keys.
pub struct FakeKeySource {
    state: Mutex<FakeState>,
    calls: AtomicUsize,
}

impl FakeKeySource {
    pub fn new(jwks: Value) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(FakeState {
                jwks,
                failing: false,
                delay: Duration::ZERO,
                max_age: None,
            }),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn set_jwks(&self, jwks: Value) {
        self.state.lock().unwrap().jwks = jwks;
    }

    pub fn set_failing(&self, failing: bool) {
        self.state.lock().unwrap().failing = failing;
    }

    pub fn set_delay(&self, delay: Duration) {
        self.state.lock().unwrap().delay = delay;
    }

    pub fn set_max_age(&self, max_age: Option<Duration>) {
        self.state.lock().unwrap().max_age = max_age;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl KeySource for FakeKeySource {
    async fn fetch_key_set(&self) -> Result<FetchedKeySet, AuthError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let (jwks, failing, delay, max_age) = {
            let state = self.state.lock().unwrap();
            (state.jwks.clone(), state.failing, state.delay, state.max_age)
        };

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if failing {
            return Err(AuthError::KeyStoreUnavailable("provider is down".to_string()));
        }
        let jwks: JsonWebKeySet = serde_json::from_value(jwks)
            .map_err(|e| AuthError::KeyStoreUnavailable(e.to_string()))?;
        Ok(FetchedKeySet { jwks, max_age })
    }
}
