//! # Vault Store
//!
//! HashiCorp Vault KV v2 driver. Serves as secret source, destination and
//! the canonical merge store. Paths are `<mount>/<rest>` strings; the first
//! segment selects the KV mount.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};
use vaultrs::client::{Client as _, VaultClient, VaultClientSettingsBuilder};
use vaultrs::error::ClientError;
use vaultrs::kv2;

use crate::merge::{compare_secrets_json, deep_merge};
use crate::store::{DriverName, StoreDriver, StoreError};

/// AppRole credentials for Vault login.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct VaultAppRole {
    pub mount: String,
    pub role_id: String,
    pub secret_id: String,
}

/// Kubernetes service-account login.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct VaultKubernetes {
    pub role: String,
    pub mount_path: String,
}

/// Vault KV v2 store configuration and client.
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct VaultStore {
    pub address: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    /// Scope path, `<mount>[/<prefix>]`. May carry a trailing `(.*)`
    /// capture when used inside a sync spec.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub path: String,
    /// When true, destination writes deep-merge into the existing value
    /// instead of replacing it.
    pub merge: bool,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approle: Option<VaultAppRole>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kubernetes: Option<VaultKubernetes>,

    #[serde(skip)]
    pub(crate) client: Option<Arc<VaultClient>>,
}

impl std::fmt::Debug for VaultStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VaultStore")
            .field("address", &self.address)
            .field("namespace", &self.namespace)
            .field("path", &self.path)
            .field("merge", &self.merge)
            .finish_non_exhaustive()
    }
}

/// Splits a `<mount>/<rest>` path into its mount and relative parts.
pub fn split_mount_path(path: &str) -> (&str, &str) {
    let trimmed = path.trim_matches('/');
    match trimmed.split_once('/') {
        Some((mount, rest)) => (mount, rest),
        None => (trimmed, ""),
    }
}

impl VaultStore {
    /// Adopts unset connection and auth fields from a defaults document.
    pub fn set_defaults(&mut self, defaults: &VaultStore) {
        if self.address.is_empty() {
            self.address = defaults.address.clone();
        }
        if self.namespace.is_empty() {
            self.namespace = defaults.namespace.clone();
        }
        if self.token.is_empty() {
            self.token = defaults.token.clone();
        }
        if self.approle.is_none() {
            self.approle = defaults.approle.clone();
        }
        if self.kubernetes.is_none() {
            self.kubernetes = defaults.kubernetes.clone();
        }
    }

    fn client(&self) -> Result<&Arc<VaultClient>, StoreError> {
        self.client
            .as_ref()
            .ok_or_else(|| StoreError::Configuration("vault client not initialized".to_string()))
    }

    async fn login(&self, client: &VaultClient) -> Result<Option<String>, StoreError> {
        if let Some(approle) = &self.approle {
            let mount = if approle.mount.is_empty() {
                "approle"
            } else {
                &approle.mount
            };
            let auth = vaultrs::auth::approle::login(
                client,
                mount,
                &approle.role_id,
                &approle.secret_id,
            )
            .await
            .map_err(map_client_error)?;
            return Ok(Some(auth.client_token));
        }

        if let Some(kubernetes) = &self.kubernetes {
            let mount = if kubernetes.mount_path.is_empty() {
                "kubernetes"
            } else {
                &kubernetes.mount_path
            };
            let jwt = std::fs::read_to_string(
                "/var/run/secrets/kubernetes.io/serviceaccount/token",
            )
            .map_err(|e| {
                StoreError::Configuration(format!("failed to read service account token: {e}"))
            })?;
            let auth =
                vaultrs::auth::kubernetes::login(client, mount, &kubernetes.role, jwt.trim())
                    .await
                    .map_err(map_client_error)?;
            return Ok(Some(auth.client_token));
        }

        Ok(None)
    }
}

fn map_client_error(err: ClientError) -> StoreError {
    match err {
        ClientError::APIError { code: 404, .. } => StoreError::NotFound("vault".to_string()),
        ClientError::APIError { code, .. } => {
            // response bodies may contain secret material; log status only
            debug!(status = code, "vault API error");
            StoreError::Remote(format!("vault API error: status={code}"))
        }
        other => StoreError::Remote(format!("vault request failed: {other}")),
    }
}

#[async_trait]
impl StoreDriver for VaultStore {
    async fn init(&mut self) -> Result<(), StoreError> {
        if self.address.is_empty() {
            return Err(StoreError::Configuration(
                "vault address is required".to_string(),
            ));
        }

        let mut settings = VaultClientSettingsBuilder::default();
        settings.address(&self.address);
        settings.timeout(Some(Duration::from_secs(30)));
        if !self.namespace.is_empty() {
            settings.namespace(Some(self.namespace.clone()));
        }
        let settings = settings
            .build()
            .map_err(|e| StoreError::Configuration(format!("invalid vault settings: {e}")))?;

        let mut client = VaultClient::new(settings)
            .map_err(|e| StoreError::Configuration(format!("failed to create vault client: {e}")))?;

        if !self.token.is_empty() {
            client.set_token(&self.token);
        }
        if let Some(token) = self.login(&client).await? {
            client.set_token(&token);
        }

        self.client = Some(Arc::new(client));
        Ok(())
    }

    fn driver(&self) -> DriverName {
        DriverName::Vault
    }

    fn get_path(&self) -> String {
        self.path.clone()
    }

    fn meta(&self) -> Map<String, Value> {
        let mut md = match serde_json::to_value(self) {
            Ok(Value::Object(m)) => m,
            _ => Map::new(),
        };
        md.remove("token");
        if let Some(Value::Object(approle)) = md.get_mut("approle") {
            approle.remove("secretId");
        }
        md
    }

    async fn get_secret(&self, name: &str) -> Result<Vec<u8>, StoreError> {
        let client = self.client()?;
        let (mount, rest) = split_mount_path(name);
        let data: Map<String, Value> = kv2::read(client.as_ref(), mount, rest)
            .await
            .map_err(map_client_error)?;
        Ok(serde_json::to_vec(&Value::Object(data))?)
    }

    async fn write_secret(
        &self,
        path: &str,
        payload: &[u8],
    ) -> Result<Option<Vec<u8>>, StoreError> {
        let client = self.client()?;
        let (mount, rest) = split_mount_path(path);

        let desired: Map<String, Value> = serde_json::from_slice(payload)?;

        let existing: Option<Map<String, Value>> =
            match kv2::read(client.as_ref(), mount, rest).await {
                Ok(data) => Some(data),
                Err(ClientError::APIError { code: 404, .. }) => None,
                Err(e) => return Err(map_client_error(e)),
            };

        let final_value = if self.merge {
            let base = existing.clone().unwrap_or_default();
            deep_merge(base, &desired)
        } else {
            desired
        };

        if let Some(existing) = &existing {
            let existing_bytes = serde_json::to_vec(&Value::Object(existing.clone()))?;
            let final_bytes = serde_json::to_vec(&Value::Object(final_value.clone()))?;
            if compare_secrets_json(&existing_bytes, &final_bytes) {
                debug!(path, "vault secret unchanged, skipping write");
                return Ok(None);
            }
        }

        kv2::set(client.as_ref(), mount, rest, &final_value)
            .await
            .map_err(map_client_error)?;
        Ok(None)
    }

    async fn delete_secret(&self, name: &str) -> Result<(), StoreError> {
        let client = self.client()?;

        if name.is_empty() {
            // delete everything in scope
            let scope = self.path.trim_end_matches("/(.*)").to_string();
            let secrets = self.list_secrets(&scope).await?;
            for secret in secrets {
                let full = format!("{scope}/{secret}");
                let (mount, rest) = split_mount_path(&full);
                if let Err(e) = kv2::delete_metadata(client.as_ref(), mount, rest).await {
                    warn!(secret = %full, error = %e, "failed to delete vault secret");
                }
            }
            return Ok(());
        }

        let (mount, rest) = split_mount_path(name);
        match kv2::delete_metadata(client.as_ref(), mount, rest).await {
            Ok(()) => Ok(()),
            // already gone is fine; deletion is idempotent
            Err(ClientError::APIError { code: 404, .. }) => Ok(()),
            Err(e) => Err(map_client_error(e)),
        }
    }

    async fn list_secrets(&self, path: &str) -> Result<Vec<String>, StoreError> {
        let client = self.client()?;
        let (mount, rest) = split_mount_path(path);

        let mut results = Vec::new();
        let mut pending = vec![rest.to_string()];

        while let Some(prefix) = pending.pop() {
            let keys = match kv2::list(client.as_ref(), mount, &prefix).await {
                Ok(keys) => keys,
                Err(ClientError::APIError { code: 404, .. }) => continue,
                Err(e) => return Err(map_client_error(e)),
            };
            for key in keys {
                let joined = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{}/{}", prefix.trim_end_matches('/'), key)
                };
                if key.ends_with('/') {
                    pending.push(joined.trim_end_matches('/').to_string());
                } else {
                    let relative = joined
                        .strip_prefix(rest)
                        .unwrap_or(&joined)
                        .trim_start_matches('/')
                        .to_string();
                    results.push(relative);
                }
            }
        }

        results.sort();
        Ok(results)
    }

    async fn close(&mut self) -> Result<(), StoreError> {
        self.client = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_paths() {
        assert_eq!(split_mount_path("analytics/creds/db"), ("analytics", "creds/db"));
        assert_eq!(split_mount_path("analytics"), ("analytics", ""));
        assert_eq!(split_mount_path("/merged/Stg"), ("merged", "Stg"));
    }

    #[test]
    fn set_defaults_fills_missing_fields() {
        let defaults = VaultStore {
            address: "https://vault.example.com".to_string(),
            namespace: "eng".to_string(),
            token: "root-token".to_string(),
            ..Default::default()
        };

        let mut store = VaultStore {
            path: "analytics/(.*)".to_string(),
            ..Default::default()
        };
        store.set_defaults(&defaults);

        assert_eq!(store.address, "https://vault.example.com");
        assert_eq!(store.namespace, "eng");
        assert_eq!(store.token, "root-token");
        // existing fields are kept
        assert_eq!(store.path, "analytics/(.*)");

        let mut store = VaultStore {
            address: "https://other.example.com".to_string(),
            ..Default::default()
        };
        store.set_defaults(&defaults);
        assert_eq!(store.address, "https://other.example.com");
    }

    #[test]
    fn meta_strips_credentials() {
        let store = VaultStore {
            address: "https://vault.example.com".to_string(),
            token: "s.supersecret".to_string(),
            approle: Some(VaultAppRole {
                mount: "approle".to_string(),
                role_id: "role".to_string(),
                secret_id: "shhh".to_string(),
            }),
            ..Default::default()
        };

        let md = store.meta();
        assert!(!md.contains_key("token"));
        let approle = md["approle"].as_object().unwrap();
        assert!(!approle.contains_key("secretId"));
        assert_eq!(md["address"], "https://vault.example.com");
    }
}
