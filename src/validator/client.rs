// src/validator/client.rs

use super::model::JsonWebKey;
use super::source::{FetchedKeySet, HttpKeySource, KeySource};
use crate::config::KeySourceConfig;
use crate::error::{AuthError, ConfigError};
use jsonwebtoken::{Algorithm, DecodingKey};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

/// The shortest lifetime a provider's `max-age` can give a snapshot.
///
/// A `max-age` of zero would otherwise make every lookup refetch the key set.
/// A configured TTL below this floor is respected as the floor instead.
pub const MIN_PROVIDER_MAX_AGE: Duration = Duration::from_secs(30);

/// The shortest pause between two background refreshes.
const MIN_REFRESH_INTERVAL: Duration = Duration::from_secs(1);

/// The public-key families a signing key can belong to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyFamily {
    Rsa,
    Ec,
}

/// A verification key taken from the provider's JWKS.
#[derive(Clone)]
pub struct SigningKey {
    pub kid: String,
    pub kty: String,
    pub key_use: Option<String>,
    /// The algorithm the provider pinned this key to, if any.
    pub alg: Option<Algorithm>,
    pub family: KeyFamily,
    /// The EC curve name; `None` for RSA keys.
    pub crv: Option<String>,
    decoding_key: DecodingKey,
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningKey")
            .field("kid", &self.kid)
            .field("kty", &self.kty)
            .field("key_use", &self.key_use)
            .field("alg", &self.alg)
            .field("family", &self.family)
            .field("crv", &self.crv)
            .finish_non_exhaustive()
    }
}

impl SigningKey {
    /// Builds a signing key from a JWK, rejecting anything that cannot verify signatures.
    pub fn from_jwk(jwk: &JsonWebKey) -> Result<Self, String> {
        let kid = jwk.kid.clone().ok_or("key has no 'kid'")?;

        if let Some(purpose) = jwk.use_purpose.as_deref() {
            if purpose != "sig" {
                return Err(format!("key use is '{}', not 'sig'", purpose));
            }
        }

        let alg = jwk
            .alg
            .as_deref()
            .map(|a| Algorithm::from_str(a).map_err(|_| format!("unsupported key algorithm '{}'", a)))
            .transpose()?;

        let (family, decoding_key) = match jwk.kty.as_str() {
            "RSA" => {
                let n = jwk.n.as_deref().ok_or("RSA key missing 'n' component")?;
                let e = jwk.e.as_deref().ok_or("RSA key missing 'e' component")?;
                let key = DecodingKey::from_rsa_components(n, e).map_err(|e| e.to_string())?;
                (KeyFamily::Rsa, key)
            }
            "EC" => {
                match jwk.crv.as_deref() {
                    Some("P-256") | Some("P-384") => {}
                    other => return Err(format!("unsupported EC curve {:?}", other)),
                }
                let x = jwk.x.as_deref().ok_or("EC key missing 'x' coordinate")?;
                let y = jwk.y.as_deref().ok_or("EC key missing 'y' coordinate")?;
                let key = DecodingKey::from_ec_components(x, y).map_err(|e| e.to_string())?;
                (KeyFamily::Ec, key)
            }
            other => return Err(format!("unsupported key type '{}'", other)),
        };

        Ok(Self {
            kid,
            kty: jwk.kty.clone(),
            key_use: jwk.use_purpose.clone(),
            alg,
            family,
            crv: jwk.crv.clone().filter(|_| family == KeyFamily::Ec),
            decoding_key,
        })
    }

    /// Whether a token signed with `alg` may be verified with this key.
    pub fn supports(&self, alg: Algorithm) -> bool {
        if self.alg.is_some_and(|pinned| pinned != alg) {
            return false;
        }
        match self.family {
            KeyFamily::Rsa => matches!(
                alg,
                Algorithm::RS256
                    | Algorithm::RS384
                    | Algorithm::RS512
                    | Algorithm::PS256
                    | Algorithm::PS384
                    | Algorithm::PS512
            ),
            KeyFamily::Ec => match alg {
                Algorithm::ES256 => self.crv.as_deref() == Some("P-256"),
                Algorithm::ES384 => self.crv.as_deref() == Some("P-384"),
                _ => false,
            },
        }
    }

    pub fn decoding_key(&self) -> &DecodingKey {
        &self.decoding_key
    }
}

/// An immutable view of one successfully fetched key set.
#[derive(Debug)]
pub struct KeySnapshot {
    keys: HashMap<String, Arc<SigningKey>>,
    fetched_at: Instant,
    expires_at: Option<Instant>,
}

impl KeySnapshot {
    fn from_fetched(fetched: FetchedKeySet, cache_ttl: Option<Duration>) -> Self {
        let fetched_at = Instant::now();
        // A configured TTL can be overridden by the provider's max-age; without a
        // TTL the snapshot lives until it is invalidated.
        let ttl = cache_ttl.map(|ttl| match fetched.max_age {
            Some(max_age) => max_age.max(MIN_PROVIDER_MAX_AGE.min(ttl)),
            None => ttl,
        });

        let mut keys: HashMap<String, Arc<SigningKey>> = HashMap::new();
        for jwk in &fetched.jwks.keys {
            match SigningKey::from_jwk(jwk) {
                Ok(key) => {
                    if keys.contains_key(&key.kid) {
                        warn!(kid = %key.kid, "Duplicate kid in JWKS; keeping the first key");
                        continue;
                    }
                    keys.insert(key.kid.clone(), Arc::new(key));
                }
                Err(reason) => {
                    warn!(kid = ?jwk.kid, kty = %jwk.kty, %reason, "Skipping unusable JWK");
                }
            }
        }

        Self {
            keys,
            fetched_at,
            expires_at: ttl.map(|ttl| fetched_at + ttl),
        }
    }

    pub fn get(&self, kid: &str) -> Option<Arc<SigningKey>> {
        self.keys.get(kid).cloned()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn key_ids(&self) -> impl Iterator<Item = &str> {
        self.keys.keys().map(String::as_str)
    }

    /// How long this snapshot is fresh for, measured from its fetch.
    pub fn ttl(&self) -> Option<Duration> {
        self.expires_at.map(|at| at.duration_since(self.fetched_at))
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

struct CacheState {
    snapshot: Option<Arc<KeySnapshot>>,
    /// Set by `invalidate`; the snapshot is still served if the next refresh fails.
    stale: bool,
    /// Number of completed fetch attempts, successful or not.
    attempts: u64,
    /// The error of the most recent attempt, if it failed.
    last_failure: Option<AuthError>,
    /// When the most recent attempt completed. Cleared by `invalidate`.
    last_attempt_at: Option<Instant>,
}

struct Observed {
    snapshot: Option<Arc<KeySnapshot>>,
    fresh: bool,
    attempts: u64,
    /// A fetch was attempted within the cooldown.
    cooling_down: bool,
    last_failure: Option<AuthError>,
}

/// Fetches and caches the provider's signing keys.
///
/// Lookups read the current snapshot concurrently. A refresh replaces the whole
/// snapshot under a single write, and concurrent refreshes are collapsed into one
/// fetch: whoever waits on an in-flight refresh reuses its outcome.
#[derive(Clone)]
pub struct KeyStore {
    // The store is internally ref-counted to allow for cheap cloning.
    inner: Arc<Inner>,
}

struct Inner {
    source: Arc<dyn KeySource>,
    cache_ttl: Option<Duration>,
    fetch_timeout: Duration,
    miss_refresh_cooldown: Duration,
    state: RwLock<CacheState>,
    refresh_lock: Mutex<()>,
}

impl KeyStore {
    /// Creates a store that talks to the provider over HTTP.
    pub fn new(config: &KeySourceConfig) -> Result<Self, ConfigError> {
        let source = HttpKeySource::new(config)?;
        Ok(Self::with_source(Arc::new(source), config))
    }

    /// Creates a store backed by an arbitrary key source.
    pub fn with_source(source: Arc<dyn KeySource>, config: &KeySourceConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                source,
                cache_ttl: config.cache_ttl,
                fetch_timeout: config.fetch_timeout,
                miss_refresh_cooldown: config.miss_refresh_cooldown,
                state: RwLock::new(CacheState {
                    snapshot: None,
                    stale: false,
                    attempts: 0,
                    last_failure: None,
                    last_attempt_at: None,
                }),
                refresh_lock: Mutex::new(()),
            }),
        }
    }

    /// Retrieves the signing key for the given Key ID (`kid`).
    ///
    /// A fresh cached snapshot answers directly. A missing, expired or invalidated
    /// snapshot is refreshed first. An unknown `kid` triggers one refresh to pick
    /// up rotated keys. If a refresh fails, keys from the previous snapshot are
    /// still served.
    ///
    /// Lookups start at most one fetch per cooldown, whatever its outcome. Inside
    /// the cooldown an unknown `kid` is `UnknownSigningKey`, and after a failed
    /// fetch cached keys are served as they are and a cold store repeats the error.
    /// Explicit `refresh` and `invalidate` are not throttled.
    #[instrument(skip(self), err)]
    pub async fn get_signing_key(&self, kid: &str) -> Result<Arc<SigningKey>, AuthError> {
        let observed = self.observe().await;
        let recently_failed = observed.cooling_down && observed.last_failure.is_some();

        match &observed.snapshot {
            Some(snapshot) => match snapshot.get(kid) {
                Some(key) if observed.fresh => {
                    debug!(kid = %kid, "JWK cache hit");
                    return Ok(key);
                }
                Some(key) if recently_failed => {
                    debug!(kid = %kid, "JWKS refresh failed recently; serving cached key");
                    return Ok(key);
                }
                None if observed.cooling_down => {
                    debug!(kid = %kid, "Key not found in recently fetched JWKS");
                    return Err(AuthError::UnknownSigningKey(kid.to_string()));
                }
                _ => {}
            },
            None if recently_failed => {
                if let Some(err) = &observed.last_failure {
                    debug!(kid = %kid, "JWKS refresh failed recently; not retrying yet");
                    return Err(err.clone());
                }
            }
            None => {}
        }

        debug!(kid = %kid, "JWK cache miss or stale key set; refreshing");
        match self.refresh_after(observed.attempts).await {
            Ok(snapshot) => snapshot.get(kid).ok_or_else(|| {
                warn!(kid = %kid, "Key not found in JWKS after refresh");
                AuthError::UnknownSigningKey(kid.to_string())
            }),
            Err(err) => {
                if let Some(key) = observed.snapshot.as_ref().and_then(|s| s.get(kid)) {
                    warn!(kid = %kid, error = %err, "JWKS refresh failed; serving previously cached key");
                    return Ok(key);
                }
                Err(err)
            }
        }
    }

    /// Forces a refresh of the key set and returns the number of usable keys.
    ///
    /// A refresh already in flight is joined rather than repeated. On failure the
    /// previous snapshot stays in place.
    #[instrument(skip(self), err)]
    pub async fn refresh(&self) -> Result<usize, AuthError> {
        let attempts = self.observe().await.attempts;
        let snapshot = self.refresh_after(attempts).await?;
        Ok(snapshot.len())
    }

    /// Marks the current snapshot stale so the next lookup refreshes it.
    pub async fn invalidate(&self) {
        let mut state = self.inner.state.write().await;
        state.stale = true;
        state.last_attempt_at = None;
        debug!("JWKS cache invalidated");
    }

    /// The snapshot currently in use, if any fetch has succeeded.
    pub async fn snapshot(&self) -> Option<Arc<KeySnapshot>> {
        self.inner.state.read().await.snapshot.clone()
    }

    /// Spawns a task that refreshes the key set before it expires.
    ///
    /// Only meaningful when a cache TTL is configured; returns `None` otherwise.
    /// The task runs until its handle is aborted.
    pub fn spawn_refresh_task(&self) -> Option<JoinHandle<()>> {
        let default_ttl = self.inner.cache_ttl?;
        let store = self.clone();
        Some(tokio::spawn(async move {
            store.key_refresh_loop(default_ttl).await;
        }))
    }

    /// The main loop for the background key refresh task.
    async fn key_refresh_loop(&self, default_ttl: Duration) {
        let base_retry_delay = Duration::from_secs(5);
        let max_retry_delay = Duration::from_secs(300); // 5 minutes
        let mut current_retry_delay = base_retry_delay;

        loop {
            let ttl = match self.refresh().await {
                Ok(_) => {
                    // On success, reset the retry delay for the next potential failure.
                    current_retry_delay = base_retry_delay;
                    self.snapshot()
                        .await
                        .and_then(|s| s.ttl())
                        .unwrap_or(default_ttl)
                }
                Err(e) => {
                    error!("Failed to refresh JWKS in background: {}. Retrying in {:?}.", e, current_retry_delay);
                    tokio::time::sleep(current_retry_delay).await;
                    current_retry_delay = (current_retry_delay * 2).min(max_retry_delay);
                    continue;
                }
            };

            // Refresh at 80% of the TTL's lifetime.
            let refresh_interval =
                Duration::from_secs_f64(ttl.as_secs_f64() * 0.8).max(MIN_REFRESH_INTERVAL);
            debug!("JWKS background refresh scheduled in {:?}", refresh_interval);
            tokio::time::sleep(refresh_interval).await;
        }
    }

    async fn observe(&self) -> Observed {
        let state = self.inner.state.read().await;
        let fresh = !state.stale
            && state
                .snapshot
                .as_ref()
                .is_some_and(|s| !s.is_expired(Instant::now()));
        let cooling_down = state
            .last_attempt_at
            .is_some_and(|at| at.elapsed() < self.inner.miss_refresh_cooldown);
        Observed {
            snapshot: state.snapshot.clone(),
            fresh,
            attempts: state.attempts,
            cooling_down,
            last_failure: state.last_failure.clone(),
        }
    }

    /// Refreshes unless another fetch attempt completed since `seen_attempts`,
    /// in which case that attempt's outcome is returned.
    async fn refresh_after(&self, seen_attempts: u64) -> Result<Arc<KeySnapshot>, AuthError> {
        let _guard = self.inner.refresh_lock.lock().await;

        {
            let state = self.inner.state.read().await;
            if state.attempts != seen_attempts {
                debug!("Joining the outcome of a concurrent JWKS refresh");
                if let Some(err) = &state.last_failure {
                    return Err(err.clone());
                }
                if let Some(snapshot) = &state.snapshot {
                    return Ok(snapshot.clone());
                }
            }
        }

        self.fetch_and_store().await
    }

    /// Fetches the JWKS from the provider and swaps it in. Must hold `refresh_lock`.
    async fn fetch_and_store(&self) -> Result<Arc<KeySnapshot>, AuthError> {
        let timeout = self.inner.fetch_timeout;
        let outcome = match tokio::time::timeout(timeout, self.inner.source.fetch_key_set()).await {
            Ok(Ok(fetched)) => Ok(fetched),
            Ok(Err(AuthError::KeyStoreUnavailable(reason))) => {
                Err(AuthError::KeyStoreUnavailable(reason))
            }
            Ok(Err(other)) => Err(AuthError::KeyStoreUnavailable(other.to_string())),
            Err(_) => Err(AuthError::KeyStoreUnavailable(format!(
                "key refresh timed out after {:?}",
                timeout
            ))),
        };

        let mut state = self.inner.state.write().await;
        state.attempts += 1;
        state.last_attempt_at = Some(Instant::now());
        match outcome {
            Ok(fetched) => {
                let snapshot = Arc::new(KeySnapshot::from_fetched(fetched, self.inner.cache_ttl));
                info!(
                    key_count = snapshot.len(),
                    ttl = ?snapshot.ttl(),
                    "JWKS cache refreshed"
                );
                state.snapshot = Some(snapshot.clone());
                state.stale = false;
                state.last_failure = None;
                Ok(snapshot)
            }
            Err(err) => {
                error!(error = %err, cached = state.snapshot.is_some(), "JWKS refresh failed");
                state.last_failure = Some(err.clone());
                Err(err)
            }
        }
    }
}
