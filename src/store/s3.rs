//! # S3 Merge Store
//!
//! S3-backed intermediate storage for merged secrets. Each secret lands at
//! `[<prefix>/]<targetName>/<secretName>.json` with JSON content type and
//! server-side encryption (the configured KMS key, or AES256 without one).

use aws_config::{BehaviorVersion, Region};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::ServerSideEncryption;
use aws_sdk_s3::Client as S3Client;
use serde_json::{Map, Value};
use tracing::debug;

use crate::config::MergeStoreS3;
use crate::store::StoreError;

/// S3-backed merge store client.
#[derive(Clone)]
pub struct S3MergeStore {
    pub bucket: String,
    pub prefix: String,
    pub kms_key_id: String,
    pub region: String,

    client: S3Client,
}

impl std::fmt::Debug for S3MergeStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3MergeStore")
            .field("bucket", &self.bucket)
            .field("prefix", &self.prefix)
            .field("region", &self.region)
            .finish_non_exhaustive()
    }
}

fn normalize_prefix(prefix: &str) -> String {
    if prefix.is_empty() || prefix.ends_with('/') {
        prefix.to_string()
    } else {
        format!("{prefix}/")
    }
}

impl S3MergeStore {
    /// Creates the store using the ambient credential chain.
    pub async fn new(cfg: &MergeStoreS3, region: &str) -> Result<Self, StoreError> {
        if cfg.bucket.is_empty() {
            return Err(StoreError::Configuration(
                "merge store bucket is required".to_string(),
            ));
        }

        let sdk_config = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(region.to_string()))
            .load()
            .await;

        Ok(Self {
            bucket: cfg.bucket.clone(),
            prefix: cfg.prefix.clone(),
            kms_key_id: cfg.kms_key_id.clone(),
            region: region.to_string(),
            client: S3Client::new(&sdk_config),
        })
    }

    /// Full S3 key for a target/secret pair.
    fn key_path(&self, target_name: &str, secret_name: &str) -> String {
        format!(
            "{}{target_name}/{secret_name}.json",
            normalize_prefix(&self.prefix)
        )
    }

    /// Writes a merged secret payload for a target.
    pub async fn write_secret(
        &self,
        target_name: &str,
        secret_name: &str,
        data: &Map<String, Value>,
    ) -> Result<(), StoreError> {
        let key = self.key_path(target_name, secret_name);
        debug!(bucket = %self.bucket, key = %key, "writing secret to S3 merge store");

        let body = serde_json::to_vec(&Value::Object(data.clone()))?;

        let mut request = self
            .client
            .put_object()
            .bucket(self.bucket.as_str())
            .key(key.as_str())
            .body(ByteStream::from(body))
            .content_type("application/json");

        if self.kms_key_id.is_empty() {
            request = request.server_side_encryption(ServerSideEncryption::Aes256);
        } else {
            request = request
                .server_side_encryption(ServerSideEncryption::AwsKms)
                .ssekms_key_id(self.kms_key_id.as_str());
        }

        request
            .send()
            .await
            .map_err(|e| StoreError::Remote(format!("failed to put object: {e}")))?;
        Ok(())
    }

    /// Reads a merged secret payload back.
    pub async fn read_secret(
        &self,
        target_name: &str,
        secret_name: &str,
    ) -> Result<Map<String, Value>, StoreError> {
        let key = self.key_path(target_name, secret_name);

        let output = self
            .client
            .get_object()
            .bucket(self.bucket.as_str())
            .key(key.as_str())
            .send()
            .await
            .map_err(|e| {
                let service_err = e.into_service_error();
                if service_err.is_no_such_key() {
                    StoreError::NotFound(key.clone())
                } else {
                    StoreError::Remote(format!("failed to get object: {service_err}"))
                }
            })?;

        let body = output
            .body
            .collect()
            .await
            .map_err(|e| StoreError::Remote(format!("failed to read body: {e}")))?
            .into_bytes();

        let data: Map<String, Value> = serde_json::from_slice(&body)?;
        Ok(data)
    }

    /// Lists the secret names stored for a target.
    pub async fn list_secrets(&self, target_name: &str) -> Result<Vec<String>, StoreError> {
        let target_prefix = format!("{}{target_name}/", normalize_prefix(&self.prefix));

        let mut secrets = Vec::new();
        let mut pages = self
            .client
            .list_objects_v2()
            .bucket(self.bucket.as_str())
            .prefix(target_prefix.as_str())
            .into_paginator()
            .send();

        while let Some(page) = pages.next().await {
            let page =
                page.map_err(|e| StoreError::Remote(format!("failed to list objects: {e}")))?;
            for object in page.contents() {
                let Some(key) = object.key() else { continue };
                let name = key
                    .strip_prefix(target_prefix.as_str())
                    .unwrap_or(key)
                    .trim_end_matches(".json");
                if !name.is_empty() && !name.contains('/') {
                    secrets.push(name.to_string());
                }
            }
        }

        secrets.sort();
        Ok(secrets)
    }

    /// Removes a merged secret.
    pub async fn delete_secret(
        &self,
        target_name: &str,
        secret_name: &str,
    ) -> Result<(), StoreError> {
        let key = self.key_path(target_name, secret_name);
        debug!(bucket = %self.bucket, key = %key, "deleting secret from S3 merge store");

        self.client
            .delete_object()
            .bucket(self.bucket.as_str())
            .key(key.as_str())
            .send()
            .await
            .map_err(|e| StoreError::Remote(format!("failed to delete object: {e}")))?;
        Ok(())
    }

    /// Canonical merge-path URI for a target, used in logs and results.
    pub fn get_merge_path(&self, target_name: &str) -> String {
        format!(
            "s3://{}/{}{target_name}",
            self.bucket,
            normalize_prefix(&self.prefix)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_normalization() {
        assert_eq!(normalize_prefix(""), "");
        assert_eq!(normalize_prefix("secrets"), "secrets/");
        assert_eq!(normalize_prefix("secrets/"), "secrets/");
    }

    #[test]
    fn key_paths_and_merge_paths() {
        // pure path logic; no client needed
        let prefix = normalize_prefix("platform");
        assert_eq!(
            format!("{prefix}{}/{}.json", "Stg", "db"),
            "platform/Stg/db.json"
        );

        let no_prefix = normalize_prefix("");
        assert_eq!(format!("{no_prefix}{}/{}.json", "Stg", "db"), "Stg/db.json");
    }
}
