//! # Store Drivers
//!
//! Uniform capability set over every secret backend. Each driver knows how
//! to initialize itself, read, write, list and delete secrets, and describe
//! itself without leaking credentials.
//!
//! Two behaviors are required of every destination driver:
//!
//! 1. **Idempotent writes** — when the backend supports read-back, a write
//!    whose payload is JSON-equal to the existing value is skipped.
//! 2. **Path-conflict reconciliation** — on backends where `/foo` and `foo`
//!    name distinct secrets, creating one deletes the alternate form.

use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;

pub mod aws_sm;
pub mod doppler;
pub mod http;
pub mod s3;
pub mod vault;

pub use aws_sm::AwsSecretsStore;
pub use doppler::DopplerStore;
pub use http::HttpStore;
pub use s3::S3MergeStore;
pub use vault::VaultStore;

/// Identity tag for a store driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DriverName {
    Vault,
    Aws,
    S3,
    Doppler,
    Http,
}

impl std::fmt::Display for DriverName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            DriverName::Vault => "vault",
            DriverName::Aws => "aws",
            DriverName::S3 => "s3",
            DriverName::Doppler => "doppler",
            DriverName::Http => "http",
        };
        f.write_str(name)
    }
}

/// Errors surfaced by store drivers.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Missing or inconsistent driver configuration; fatal at init.
    #[error("configuration error: {0}")]
    Configuration(String),
    /// The requested secret does not exist.
    #[error("secret not found: {0}")]
    NotFound(String),
    /// The remote store rejected or failed the request.
    #[error("store request failed: {0}")]
    Remote(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// The driver does not support the requested operation.
    #[error("unsupported operation: {0}")]
    Unsupported(String),
}

/// Secret-name case transform. Platforms whose convention is
/// UPPER_SNAKE_CASE default to `Upper`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NameTransform {
    Upper,
    Lower,
    #[default]
    None,
}

impl NameTransform {
    /// Parses a transform string, falling back to `default` for anything
    /// unrecognized (including the empty string).
    pub fn parse_or(s: &str, default: NameTransform) -> Self {
        match s.to_lowercase().as_str() {
            "upper" => NameTransform::Upper,
            "lower" => NameTransform::Lower,
            "none" => NameTransform::None,
            _ => default,
        }
    }

    pub fn apply(&self, name: &str) -> String {
        match self {
            NameTransform::Upper => name.to_uppercase(),
            NameTransform::Lower => name.to_lowercase(),
            NameTransform::None => name.to_string(),
        }
    }
}

/// The alternate path form of a secret name: `/foo` for `foo` and vice
/// versa. Used by drivers that reconcile path conflicts.
pub fn alternate_path_form(name: &str) -> String {
    match name.strip_prefix('/') {
        Some(stripped) => stripped.to_string(),
        None => format!("/{name}"),
    }
}

/// Capability set every backend implements.
#[async_trait]
pub trait StoreDriver: Send + Sync {
    /// Validates configuration and establishes session state. Configuration
    /// problems surface as [`StoreError::Configuration`].
    async fn init(&mut self) -> Result<(), StoreError>;

    fn driver(&self) -> DriverName;

    /// Canonical identifier for logging.
    fn get_path(&self) -> String;

    /// Non-sensitive description of the driver configuration. Secret
    /// material (tokens, keys) is stripped.
    fn meta(&self) -> Map<String, Value>;

    /// Reads a single secret's raw value.
    async fn get_secret(&self, name: &str) -> Result<Vec<u8>, StoreError>;

    /// Creates or updates a secret. Returns the remote response body when
    /// the backend produces one, `None` when the write was elided.
    async fn write_secret(
        &self,
        path: &str,
        payload: &[u8],
    ) -> Result<Option<Vec<u8>>, StoreError>;

    /// Idempotent removal. An empty name deletes every secret in scope,
    /// which full-replace destinations use before re-writing.
    async fn delete_secret(&self, name: &str) -> Result<(), StoreError>;

    /// Enumerates current secret names in scope. Entries scheduled for
    /// deletion are excluded.
    async fn list_secrets(&self, path: &str) -> Result<Vec<String>, StoreError>;

    /// Releases any session state.
    async fn close(&mut self) -> Result<(), StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_transform_parse_and_apply() {
        assert_eq!(NameTransform::parse_or("upper", NameTransform::None), NameTransform::Upper);
        assert_eq!(NameTransform::parse_or("LOWER", NameTransform::None), NameTransform::Lower);
        assert_eq!(NameTransform::parse_or("none", NameTransform::Upper), NameTransform::None);
        // unknown and empty fall back to the platform default
        assert_eq!(NameTransform::parse_or("", NameTransform::Upper), NameTransform::Upper);
        assert_eq!(NameTransform::parse_or("bogus", NameTransform::Lower), NameTransform::Lower);

        assert_eq!(NameTransform::Upper.apply("db_password"), "DB_PASSWORD");
        assert_eq!(NameTransform::Lower.apply("DB_PASSWORD"), "db_password");
        assert_eq!(NameTransform::None.apply("Db_Password"), "Db_Password");
    }

    #[test]
    fn alternate_path_forms() {
        assert_eq!(alternate_path_form("prod/db"), "/prod/db");
        assert_eq!(alternate_path_form("/prod/db"), "prod/db");
    }
}
