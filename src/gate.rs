// src/gate.rs

use crate::config::Config;
use crate::error::{AuthError, ConfigError};
use crate::validator::client::KeyStore;
use crate::validator::source::KeySource;
use crate::validator::{Claims, Validator};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

/// The single entry point a request-handling layer calls to authenticate a request.
///
/// Cheap to clone and safe to share across any number of concurrent requests.
/// Dropping the last clone stops the background key refresh, if one was started.
#[derive(Clone)]
pub struct AuthGate {
    inner: Arc<GateInner>,
}

struct GateInner {
    validator: Validator,
    audience: String,
    issuer: String,
    refresh_task: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for GateInner {
    fn drop(&mut self) {
        if let Ok(mut task) = self.refresh_task.lock() {
            if let Some(handle) = task.take() {
                handle.abort();
            }
        }
    }
}

impl AuthGate {
    /// Creates a gate that fetches keys from the configured provider over HTTP.
    pub fn new(config: Config) -> Result<Self, ConfigError> {
        let key_store = KeyStore::new(&config.key_source)?;
        Ok(Self::from_key_store(config, key_store))
    }

    /// Creates a gate whose keys come from the given source.
    pub fn with_key_source(config: Config, source: Arc<dyn KeySource>) -> Self {
        let key_store = KeyStore::with_source(source, &config.key_source);
        Self::from_key_store(config, key_store)
    }

    fn from_key_store(config: Config, key_store: KeyStore) -> Self {
        Self {
            inner: Arc::new(GateInner {
                validator: Validator::new(key_store, config.validation),
                audience: config.audience,
                issuer: config.issuer,
                refresh_task: Mutex::new(None),
            }),
        }
    }

    /// Verifies a raw bearer token against the configured audience and issuer.
    #[instrument(skip_all)]
    pub async fn verify_token(&self, raw_token: &str) -> Result<Claims, AuthError> {
        let result = self
            .inner
            .validator
            .validate(raw_token, &self.inner.audience, &self.inner.issuer)
            .await;

        match &result {
            Ok(claims) => debug!(sub = ?claims.subject(), "Bearer token accepted"),
            Err(err) if err.is_client_error() => debug!(error = %err, "Bearer token rejected"),
            Err(err) => error!(error = %err, "Bearer token could not be verified"),
        }
        result
    }

    /// Fetches the provider's keys ahead of the first request.
    pub async fn warm_up(&self) -> Result<usize, AuthError> {
        let count = self.key_store().refresh().await?;
        info!(key_count = count, "Signing keys loaded");
        Ok(count)
    }

    /// Forces a key refresh. On failure the cached keys stay in use.
    pub async fn refresh_keys(&self) -> Result<usize, AuthError> {
        self.key_store().refresh().await
    }

    /// Marks the cached keys stale so the next verification refreshes them.
    pub async fn invalidate_keys(&self) {
        self.key_store().invalidate().await;
    }

    /// Starts refreshing keys in the background before they expire.
    ///
    /// Returns `false` when no cache TTL is configured, when no tokio runtime is
    /// running, or when the task is already running.
    pub fn start_background_refresh(&self) -> bool {
        if tokio::runtime::Handle::try_current().is_err() {
            warn!("No tokio runtime; background key refresh not started");
            return false;
        }
        let Ok(mut task) = self.inner.refresh_task.lock() else {
            return false;
        };
        if task.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return false;
        }
        *task = self.key_store().spawn_refresh_task();
        task.is_some()
    }

    pub fn audience(&self) -> &str {
        &self.inner.audience
    }

    pub fn issuer(&self) -> &str {
        &self.inner.issuer
    }

    fn key_store(&self) -> &KeyStore {
        self.inner.validator.key_store()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigBuilder;
    use crate::test_support::*;
    use serde_json::json;
    use std::time::Duration;

    fn config() -> Config {
        ConfigBuilder::new()
            .issuer(ISSUER)
            .audience(AUDIENCE)
            .discovery_url("http://idp.test/.well-known/openid-configuration")
            .unwrap()
            .build()
            .unwrap()
    }

    fn gate() -> (AuthGate, Arc<FakeKeySource>) {
        let source = FakeKeySource::new(json!({ "keys": [rsa_jwk("k1", RSA_PRIMARY)] }));
        (AuthGate::with_key_source(config(), source.clone()), source)
    }

    #[tokio::test]
    async fn verify_token_uses_configured_expectations() {
        let (gate, _) = gate();
        let token = sign_rs256(RSA_PRIMARY, Some("k1"), &valid_claims());
        let claims = gate.verify_token(&token).await.unwrap();
        assert_eq!(claims.issuer(), Some(ISSUER));
        assert_eq!(gate.audience(), AUDIENCE);

        let mut foreign = valid_claims();
        foreign["aud"] = json!("another-api");
        let token = sign_rs256(RSA_PRIMARY, Some("k1"), &foreign);
        assert_eq!(
            gate.verify_token(&token).await.unwrap_err(),
            AuthError::ClaimInvalid("audience".to_string())
        );
    }

    #[tokio::test]
    async fn warm_up_prefetches_keys() {
        let (gate, source) = gate();
        assert_eq!(gate.warm_up().await.unwrap(), 1);

        let token = sign_rs256(RSA_PRIMARY, Some("k1"), &valid_claims());
        gate.verify_token(&token).await.unwrap();
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test]
    async fn invalidation_triggers_refetch() {
        let (gate, source) = gate();
        let token = sign_rs256(RSA_PRIMARY, Some("k1"), &valid_claims());
        gate.verify_token(&token).await.unwrap();

        gate.invalidate_keys().await;
        gate.verify_token(&token).await.unwrap();
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test]
    async fn outage_after_warm_up_keeps_serving_cached_keys() {
        let (gate, source) = gate();
        gate.warm_up().await.unwrap();
        source.set_failing(true);

        assert!(matches!(gate.refresh_keys().await, Err(AuthError::KeyStoreUnavailable(_))));
        gate.invalidate_keys().await;

        let token = sign_rs256(RSA_PRIMARY, Some("k1"), &valid_claims());
        assert!(gate.verify_token(&token).await.is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_verifications_survive_concurrent_refreshes() {
        let (gate, source) = gate();
        source.set_delay(Duration::from_millis(5));
        let token = Arc::new(sign_rs256(RSA_PRIMARY, Some("k1"), &valid_claims()));

        let refresher = {
            let gate = gate.clone();
            tokio::spawn(async move {
                for _ in 0..20 {
                    gate.refresh_keys().await.unwrap();
                }
            })
        };
        let verifications: Vec<_> = (0..64)
            .map(|_| {
                let gate = gate.clone();
                let token = token.clone();
                tokio::spawn(async move { gate.verify_token(&token).await })
            })
            .collect();

        for verification in verifications {
            let claims = verification.await.unwrap().unwrap();
            assert_eq!(claims.subject(), Some("user-1"));
        }
        refresher.await.unwrap();
    }

    #[tokio::test]
    async fn background_refresh_needs_ttl_and_stops_on_drop() {
        let (gate, _) = gate();
        assert!(!gate.start_background_refresh());

        let mut with_ttl = config();
        with_ttl.key_source.cache_ttl = Some(Duration::from_secs(3600));
        let source = FakeKeySource::new(json!({ "keys": [rsa_jwk("k1", RSA_PRIMARY)] }));
        let gate = AuthGate::with_key_source(with_ttl, source.clone());
        assert!(gate.start_background_refresh());
        assert!(!gate.start_background_refresh());

        for _ in 0..50 {
            if source.calls() > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(source.calls(), 1);
        drop(gate);
    }
}
