#![allow(dead_code)]

use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use oidc_gate::prelude::*;
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::traits::PublicKeyParts;
use rsa::RsaPrivateKey;
use serde_json::{json, Value};
use std::time::Duration;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub const RSA_PRIMARY: &str = include_str!("../fixtures/rsa_primary.pem");
pub const RSA_ROGUE: &str = include_str!("../fixtures/rsa_rogue.pem");

pub const ISSUER: &str = "https://idp/";
pub const AUDIENCE: &str = "api-client";
pub const DISCOVERY_PATH: &str = "/.well-known/openid-configuration";
pub const JWKS_PATH: &str = "/keys";

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

pub fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

pub fn valid_claims() -> Value {
    json!({
        "sub": "user-1",
        "aud": AUDIENCE,
        "iss": ISSUER,
        "exp": now() + 3600,
    })
}

pub fn sign_rs256(private_pem: &str, kid: &str, claims: &Value) -> String {
    let key = EncodingKey::from_rsa_pem(private_pem.as_bytes()).unwrap();
    let mut header = Header::new(Algorithm::RS256);
    header.kid = Some(kid.to_string());
    encode(&header, claims, &key).unwrap()
}

/// Serves a discovery document pointing at the server's own JWKS path.
pub async fn mount_discovery(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path(DISCOVERY_PATH))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "jwks_uri": format!("{}{}", server.uri(), JWKS_PATH) })),
        )
        .mount(server)
        .await;
}

pub async fn mount_jwks(server: &MockServer, jwks: Value) {
    Mock::given(method("GET"))
        .and(path(JWKS_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(jwks))
        .mount(server)
        .await;
}

/// A provider serving discovery plus a key set containing `k1`.
pub async fn provider() -> MockServer {
    let server = MockServer::start().await;
    mount_discovery(&server).await;
    mount_jwks(&server, json!({ "keys": [rsa_jwk("k1", RSA_PRIMARY)] })).await;
    server
}

pub fn config_builder(server: &MockServer) -> ConfigBuilder {
    ConfigBuilder::new()
        .issuer(ISSUER)
        .audience(AUDIENCE)
        .discovery_url(&format!("{}{}", server.uri(), DISCOVERY_PATH))
        .unwrap()
        .fetch_timeout(Duration::from_secs(2))
}

pub fn gate(server: &MockServer) -> AuthGate {
    AuthGate::new(config_builder(server).build().unwrap()).unwrap()
}
