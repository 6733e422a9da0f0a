// src/lib.rs

pub mod config;
pub mod error;
pub mod gate;
#[cfg(feature = "server")]
pub mod http;
pub mod validator;

#[cfg(test)]
pub(crate) mod test_support;

/// The public prelude for the `oidc-gate` crate.
///
/// This module re-exports the most commonly used types for convenience.
pub mod prelude {
    pub use crate::config::{Config, ConfigBuilder, FileConfig};
    pub use crate::error::{AuthError, ConfigError};
    pub use crate::gate::AuthGate;
    pub use crate::validator::client::{KeyStore, SigningKey};
    pub use crate::validator::source::{FetchedKeySet, HttpKeySource, KeySource};
    pub use crate::validator::{Claims, Validator};
    pub use jsonwebtoken::Algorithm;
}
