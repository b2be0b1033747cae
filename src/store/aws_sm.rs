//! # AWS Secrets Manager Store
//!
//! Destination driver for AWS Secrets Manager. Supports cross-account
//! writes through an assumed role, idempotent updates and path-conflict
//! reconciliation (`/foo` vs `foo` name duplicates).

use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region, SdkConfig};
use aws_sdk_secretsmanager::Client as SecretsManagerClient;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::aws::context::redact_arn;
use crate::merge::compare_secrets_json;
use crate::observability::metrics;
use crate::store::{alternate_path_form, DriverName, NameTransform, StoreDriver, StoreError};

/// AWS Secrets Manager store configuration and client.
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AwsSecretsStore {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub account_id: String,
    pub region: String,
    /// Destination secret name, usually a `$1` template resolved by the
    /// sync job before the driver sees it.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub name: String,
    /// Role to assume for cross-account writes. Empty means ambient
    /// credentials.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub role_arn: String,
    /// Name prefix scoping list and delete-all operations.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub prefix: String,
    /// Case transform applied to secret names (`upper`, `lower`, `none`).
    #[serde(skip_serializing_if = "String::is_empty")]
    pub name_transform: String,
    /// Skip secrets whose stored value is empty when listing.
    pub skip_empty_values: bool,

    #[serde(skip)]
    pub(crate) sdk_config: Option<SdkConfig>,
    #[serde(skip)]
    pub(crate) client: Option<SecretsManagerClient>,
}

impl std::fmt::Debug for AwsSecretsStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AwsSecretsStore")
            .field("account_id", &self.account_id)
            .field("region", &self.region)
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

impl AwsSecretsStore {
    /// Adopts unset fields from a defaults document.
    pub fn set_defaults(&mut self, defaults: &AwsSecretsStore) {
        if self.region.is_empty() {
            self.region = defaults.region.clone();
        }
        if self.role_arn.is_empty() {
            self.role_arn = defaults.role_arn.clone();
        }
        if self.name_transform.is_empty() {
            self.name_transform = defaults.name_transform.clone();
        }
        if !self.skip_empty_values {
            self.skip_empty_values = defaults.skip_empty_values;
        }
    }

    /// Installs a pre-bound session, e.g. one vended by the execution
    /// context for this target's role. `init` will not reload credentials.
    pub fn with_sdk_config(&mut self, config: SdkConfig) {
        self.sdk_config = Some(config);
    }

    fn client(&self) -> Result<&SecretsManagerClient, StoreError> {
        self.client.as_ref().ok_or_else(|| {
            StoreError::Configuration("aws secrets manager client not initialized".to_string())
        })
    }

    fn transform(&self) -> NameTransform {
        NameTransform::parse_or(&self.name_transform, NameTransform::None)
    }

    fn full_name(&self, name: &str) -> String {
        let transformed = self.transform().apply(name);
        if self.prefix.is_empty() {
            transformed
        } else {
            format!("{}{transformed}", self.prefix)
        }
    }

    async fn secret_exists(&self, name: &str) -> Result<bool, StoreError> {
        let client = self.client()?;
        match client.describe_secret().secret_id(name).send().await {
            Ok(_) => Ok(true),
            Err(e) => {
                let service_err = e.into_service_error();
                if service_err.is_resource_not_found_exception() {
                    Ok(false)
                } else {
                    Err(StoreError::Remote(format!(
                        "failed to describe secret: {service_err}"
                    )))
                }
            }
        }
    }

    async fn read_value(&self, name: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let client = self.client()?;
        match client.get_secret_value().secret_id(name).send().await {
            Ok(output) => {
                if let Some(s) = output.secret_string() {
                    Ok(Some(s.as_bytes().to_vec()))
                } else if let Some(blob) = output.secret_binary() {
                    Ok(Some(blob.as_ref().to_vec()))
                } else {
                    Ok(None)
                }
            }
            Err(e) => {
                let service_err = e.into_service_error();
                if service_err.is_resource_not_found_exception() {
                    Ok(None)
                } else {
                    Err(StoreError::Remote(format!(
                        "failed to get secret value: {service_err}"
                    )))
                }
            }
        }
    }

    async fn delete_by_exact_name(&self, name: &str) -> Result<(), StoreError> {
        let client = self.client()?;
        match client
            .delete_secret()
            .secret_id(name)
            .force_delete_without_recovery(true)
            .send()
            .await
        {
            Ok(_) => Ok(()),
            Err(e) => {
                let service_err = e.into_service_error();
                if service_err.is_resource_not_found_exception() {
                    Ok(())
                } else {
                    Err(StoreError::Remote(format!(
                        "failed to delete secret: {service_err}"
                    )))
                }
            }
        }
    }

    /// Deletes the alternate path form of `name` if it exists, so `/foo`
    /// and `foo` never coexist after a write.
    async fn reconcile_path_conflict(&self, name: &str) -> Result<(), StoreError> {
        let alternate = alternate_path_form(name);
        if self.secret_exists(&alternate).await? {
            info!(
                secret = name,
                alternate = %alternate,
                "deleting alternate-form secret to resolve path conflict"
            );
            self.delete_by_exact_name(&alternate).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl StoreDriver for AwsSecretsStore {
    async fn init(&mut self) -> Result<(), StoreError> {
        if self.region.is_empty() {
            return Err(StoreError::Configuration("aws region is required".to_string()));
        }

        let sdk_config = match self.sdk_config.clone() {
            Some(config) => config,
            None => {
                let base = aws_config::defaults(BehaviorVersion::latest())
                    .region(Region::new(self.region.clone()))
                    .load()
                    .await;
                if self.role_arn.is_empty() {
                    base
                } else {
                    let provider =
                        aws_config::sts::AssumeRoleProvider::builder(self.role_arn.clone())
                            .session_name("secret-sync-pipeline")
                            .configure(&base)
                            .build()
                            .await;
                    aws_config::defaults(BehaviorVersion::latest())
                        .region(Region::new(self.region.clone()))
                        .credentials_provider(provider)
                        .load()
                        .await
                }
            }
        };

        self.client = Some(SecretsManagerClient::new(&sdk_config));
        self.sdk_config = Some(sdk_config);
        Ok(())
    }

    fn driver(&self) -> DriverName {
        DriverName::Aws
    }

    fn get_path(&self) -> String {
        format!("aws:{}:{}", self.account_id, self.region)
    }

    fn meta(&self) -> Map<String, Value> {
        let mut md = match serde_json::to_value(self) {
            Ok(Value::Object(m)) => m,
            _ => Map::new(),
        };
        // only the identity type of the role is safe to describe
        if let Some(Value::String(arn)) = md.get("roleArn") {
            let redacted = redact_arn(arn);
            md.insert("roleArn".to_string(), Value::String(redacted));
        }
        md
    }

    async fn get_secret(&self, name: &str) -> Result<Vec<u8>, StoreError> {
        let full_name = self.full_name(name);
        self.read_value(&full_name)
            .await?
            .ok_or_else(|| StoreError::NotFound(full_name))
    }

    async fn write_secret(
        &self,
        path: &str,
        payload: &[u8],
    ) -> Result<Option<Vec<u8>>, StoreError> {
        let start = std::time::Instant::now();
        let name = self.full_name(path);
        let secret_string = String::from_utf8_lossy(payload).to_string();

        if !self.secret_exists(&name).await? {
            info!(secret = %name, "creating AWS secret");
            let client = self.client()?;
            client
                .create_secret()
                .name(name.as_str())
                .secret_string(secret_string.as_str())
                .send()
                .await
                .map_err(|e| {
                    StoreError::Remote(format!(
                        "failed to create secret: {}",
                        e.into_service_error()
                    ))
                })?;
            self.reconcile_path_conflict(&name).await?;
            metrics::record_store_operation("aws", "create", start.elapsed().as_secs_f64());
            return Ok(None);
        }

        if let Some(current) = self.read_value(&name).await? {
            if compare_secrets_json(&current, payload) {
                debug!(secret = %name, "AWS secret unchanged, skipping update");
                metrics::record_store_operation("aws", "no_change", start.elapsed().as_secs_f64());
                return Ok(None);
            }
        }

        info!(secret = %name, "updating AWS secret");
        let client = self.client()?;
        client
            .put_secret_value()
            .secret_id(name.as_str())
            .secret_string(secret_string.as_str())
            .send()
            .await
            .map_err(|e| {
                StoreError::Remote(format!(
                    "failed to update secret: {}",
                    e.into_service_error()
                ))
            })?;
        metrics::record_store_operation("aws", "update", start.elapsed().as_secs_f64());
        Ok(None)
    }

    async fn delete_secret(&self, name: &str) -> Result<(), StoreError> {
        if name.is_empty() {
            // full-replace destinations clear their scope before re-writing
            let names = self.list_secrets("").await?;
            for secret in names {
                let full = self.full_name(&secret);
                if let Err(e) = self.delete_by_exact_name(&full).await {
                    warn!(secret = %full, error = %e, "failed to delete secret");
                }
            }
            return Ok(());
        }

        info!(secret = name, "deleting AWS secret");
        self.delete_by_exact_name(&self.full_name(name)).await
    }

    async fn list_secrets(&self, path: &str) -> Result<Vec<String>, StoreError> {
        let client = self.client()?;
        let scope: &str = if path.is_empty() { &self.prefix } else { path };

        let mut names = Vec::new();
        let mut pages = client.list_secrets().into_paginator().send();
        while let Some(page) = pages.next().await {
            let page = page.map_err(|e| {
                StoreError::Remote(format!("failed to list secrets: {e}"))
            })?;
            for entry in page.secret_list() {
                // entries scheduled for deletion are not current state
                if entry.deleted_date().is_some() {
                    continue;
                }
                let Some(name) = entry.name() else { continue };
                if !scope.is_empty() && !name.starts_with(scope) {
                    continue;
                }
                names.push(name.to_string());
            }
        }

        if self.skip_empty_values {
            let mut non_empty = Vec::with_capacity(names.len());
            for name in names {
                match self.read_value(&name).await? {
                    Some(value) if !value.is_empty() && value != b"{}" => non_empty.push(name),
                    _ => debug!(secret = %name, "skipping empty secret"),
                }
            }
            names = non_empty;
        }

        // strip the configured prefix so callers see scope-relative names
        let stripped: Vec<String> = names
            .into_iter()
            .map(|n| {
                n.strip_prefix(self.prefix.as_str())
                    .map(|s| s.to_string())
                    .unwrap_or(n)
            })
            .collect();
        Ok(stripped)
    }

    async fn close(&mut self) -> Result<(), StoreError> {
        self.client = None;
        self.sdk_config = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_name_applies_prefix_and_transform() {
        let store = AwsSecretsStore {
            prefix: "platform/".to_string(),
            name_transform: "lower".to_string(),
            ..Default::default()
        };
        assert_eq!(store.full_name("DB_Creds"), "platform/db_creds");

        let plain = AwsSecretsStore::default();
        assert_eq!(plain.full_name("db"), "db");
    }

    #[test]
    fn set_defaults_adopts_region_and_role() {
        let defaults = AwsSecretsStore {
            region: "us-east-1".to_string(),
            role_arn: "arn:aws:iam::123456789012:role/Default".to_string(),
            ..Default::default()
        };

        let mut store = AwsSecretsStore::default();
        store.set_defaults(&defaults);
        assert_eq!(store.region, "us-east-1");
        assert_eq!(store.role_arn, defaults.role_arn);

        let mut store = AwsSecretsStore {
            region: "eu-west-1".to_string(),
            ..Default::default()
        };
        store.set_defaults(&defaults);
        assert_eq!(store.region, "eu-west-1");
    }

    #[test]
    fn meta_redacts_role_arn() {
        let store = AwsSecretsStore {
            region: "us-east-1".to_string(),
            role_arn: "arn:aws:iam::123456789012:role/VerySensitiveName".to_string(),
            ..Default::default()
        };
        let md = store.meta();
        assert_eq!(md["roleArn"], "role");
    }
}
