//! # Doppler Store
//!
//! Destination driver for the Doppler secrets platform. Writes are bulk
//! (one API call for the whole payload); names follow Doppler's
//! UPPER_SNAKE_CASE convention unless configured otherwise.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use crate::store::{DriverName, NameTransform, StoreDriver, StoreError};

const DEFAULT_BASE_URL: &str = "https://api.doppler.com/v3";

/// Doppler store configuration and client.
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DopplerStore {
    /// Doppler project name.
    pub project: String,
    /// Doppler config/environment name.
    pub config: String,
    /// Service token for authentication.
    pub token: String,
    /// API endpoint override, for testing.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub base_url: String,
    /// Merge with existing secrets instead of replacing them.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub merge: Option<bool>,
    /// Secret-name transform (`upper`, `lower`, `none`). Defaults to
    /// `upper`, Doppler's convention.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub name_transform: String,

    #[serde(skip)]
    http_client: Option<reqwest::Client>,
}

impl std::fmt::Debug for DopplerStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DopplerStore")
            .field("project", &self.project)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl DopplerStore {
    /// Adopts unset fields from a defaults document.
    pub fn set_defaults(&mut self, defaults: &DopplerStore) {
        if self.project.is_empty() {
            self.project = defaults.project.clone();
        }
        if self.config.is_empty() {
            self.config = defaults.config.clone();
        }
        if self.token.is_empty() {
            self.token = defaults.token.clone();
        }
        if self.base_url.is_empty() {
            self.base_url = defaults.base_url.clone();
        }
        if self.name_transform.is_empty() {
            self.name_transform = defaults.name_transform.clone();
        }
        if self.merge.is_none() {
            self.merge = defaults.merge;
        }
    }

    fn validate(&self) -> Result<(), StoreError> {
        if self.project.is_empty() {
            return Err(StoreError::Configuration("project is required".to_string()));
        }
        if self.config.is_empty() {
            return Err(StoreError::Configuration("config is required".to_string()));
        }
        if self.token.is_empty() {
            return Err(StoreError::Configuration("token is required".to_string()));
        }
        Ok(())
    }

    fn transform_name(&self, name: &str) -> String {
        NameTransform::parse_or(&self.name_transform, NameTransform::Upper).apply(name)
    }

    fn http_client(&self) -> Result<&reqwest::Client, StoreError> {
        self.http_client
            .as_ref()
            .ok_or_else(|| StoreError::Configuration("doppler client not initialized".to_string()))
    }

    async fn do_request(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, &str)],
        body: Option<Value>,
    ) -> Result<Vec<u8>, StoreError> {
        let client = self.http_client()?;
        let url = format!("{}{path}", self.base_url);

        let mut request = client
            .request(method, &url)
            .bearer_auth(&self.token)
            .header("Accept", "application/json");
        if !query.is_empty() {
            request = request.query(query);
        }
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| StoreError::Remote(format!("request failed: {e}")))?;

        let status = response.status();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| StoreError::Remote(format!("failed to read response: {e}")))?;

        if status.as_u16() >= 400 {
            // response bodies may contain sensitive detail; log status only
            debug!(status = status.as_u16(), "doppler API error");
            if status.as_u16() == 404 {
                return Err(StoreError::NotFound("doppler".to_string()));
            }
            return Err(StoreError::Remote(format!(
                "API error: status={}",
                status.as_u16()
            )));
        }

        Ok(bytes.to_vec())
    }

    async fn delete_single_raw(&self, name: &str) -> Result<(), StoreError> {
        self.do_request(
            Method::DELETE,
            "/configs/config/secret",
            &[],
            Some(json!({
                "project": self.project,
                "config": self.config,
                "name": name,
            })),
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl StoreDriver for DopplerStore {
    async fn init(&mut self) -> Result<(), StoreError> {
        self.validate()?;
        if self.base_url.is_empty() {
            self.base_url = DEFAULT_BASE_URL.to_string();
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| StoreError::Configuration(format!("failed to build client: {e}")))?;
        self.http_client = Some(client);
        Ok(())
    }

    fn driver(&self) -> DriverName {
        DriverName::Doppler
    }

    fn get_path(&self) -> String {
        format!("{}/{}", self.project, self.config)
    }

    fn meta(&self) -> Map<String, Value> {
        let mut md = match serde_json::to_value(self) {
            Ok(Value::Object(m)) => m,
            _ => Map::new(),
        };
        md.remove("token");
        md
    }

    async fn get_secret(&self, name: &str) -> Result<Vec<u8>, StoreError> {
        let transformed = self.transform_name(name);
        let body = self
            .do_request(
                Method::GET,
                "/configs/config/secret",
                &[
                    ("project", self.project.as_str()),
                    ("config", self.config.as_str()),
                    ("name", transformed.as_str()),
                ],
                None,
            )
            .await?;

        #[derive(Deserialize)]
        struct SecretValue {
            raw: String,
        }
        #[derive(Deserialize)]
        struct SecretResponse {
            value: SecretValue,
        }

        let parsed: SecretResponse = serde_json::from_slice(&body)?;
        Ok(parsed.value.raw.into_bytes())
    }

    async fn write_secret(
        &self,
        path: &str,
        payload: &[u8],
    ) -> Result<Option<Vec<u8>>, StoreError> {
        let secrets: Map<String, Value> = serde_json::from_slice(payload)?;

        // flatten to Doppler's string-valued format
        let mut doppler_secrets = Map::new();
        for (key, value) in &secrets {
            match value {
                Value::Null => {
                    debug!(secret = key, "skipping empty secret");
                }
                Value::String(s) if s.is_empty() => {
                    debug!(secret = key, "skipping empty secret");
                }
                Value::String(s) => {
                    doppler_secrets
                        .insert(self.transform_name(key), Value::String(s.clone()));
                }
                Value::Object(_) | Value::Array(_) => {
                    // complex values are JSON encoded
                    doppler_secrets.insert(
                        self.transform_name(key),
                        Value::String(serde_json::to_string(value)?),
                    );
                }
                other => {
                    doppler_secrets
                        .insert(self.transform_name(key), Value::String(other.to_string()));
                }
            }
        }

        if doppler_secrets.is_empty() {
            debug!(path, "no secrets to write");
            return Ok(None);
        }

        let merge = self.merge.unwrap_or(false);
        let api_path = if merge {
            "/configs/config/secrets?merge=true"
        } else {
            "/configs/config/secrets"
        };

        let count = doppler_secrets.len();
        self.do_request(
            Method::POST,
            api_path,
            &[],
            Some(json!({
                "project": self.project,
                "config": self.config,
                "secrets": doppler_secrets,
            })),
        )
        .await?;

        info!(
            count,
            project = %self.project,
            config = %self.config,
            "wrote secrets to Doppler"
        );
        Ok(None)
    }

    async fn delete_secret(&self, name: &str) -> Result<(), StoreError> {
        if name.is_empty() {
            // full replace: remove every secret in the config. Names from
            // list_secrets are already in Doppler form, no re-transform.
            let secrets = self.list_secrets("").await?;
            for secret_name in secrets {
                if let Err(e) = self.delete_single_raw(&secret_name).await {
                    warn!(secret = %secret_name, error = %e, "failed to delete secret");
                }
            }
            return Ok(());
        }

        self.delete_single_raw(&self.transform_name(name)).await
    }

    async fn list_secrets(&self, _path: &str) -> Result<Vec<String>, StoreError> {
        let body = self
            .do_request(
                Method::GET,
                "/configs/config/secrets",
                &[
                    ("project", self.project.as_str()),
                    ("config", self.config.as_str()),
                ],
                None,
            )
            .await?;

        #[derive(Deserialize)]
        struct SecretsResponse {
            secrets: Map<String, Value>,
        }

        let parsed: SecretsResponse = serde_json::from_slice(&body)?;
        Ok(parsed.secrets.keys().cloned().collect())
    }

    async fn close(&mut self) -> Result<(), StoreError> {
        self.http_client = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_requires_project_config_token() {
        let mut store = DopplerStore::default();
        assert!(store.validate().is_err());
        store.project = "backend".to_string();
        assert!(store.validate().is_err());
        store.config = "prd".to_string();
        assert!(store.validate().is_err());
        store.token = "dp.st.xxx".to_string();
        assert!(store.validate().is_ok());
    }

    #[test]
    fn names_default_to_upper_snake() {
        let store = DopplerStore::default();
        assert_eq!(store.transform_name("db_password"), "DB_PASSWORD");

        let lower = DopplerStore {
            name_transform: "lower".to_string(),
            ..Default::default()
        };
        assert_eq!(lower.transform_name("DB_PASSWORD"), "db_password");

        let none = DopplerStore {
            name_transform: "none".to_string(),
            ..Default::default()
        };
        assert_eq!(none.transform_name("Db_Password"), "Db_Password");
    }

    #[test]
    fn meta_strips_token() {
        let store = DopplerStore {
            project: "backend".to_string(),
            config: "prd".to_string(),
            token: "dp.st.secret".to_string(),
            ..Default::default()
        };
        let md = store.meta();
        assert!(!md.contains_key("token"));
        assert_eq!(md["project"], "backend");
    }

    #[test]
    fn set_defaults_prefers_existing() {
        let defaults = DopplerStore {
            project: "backend".to_string(),
            config: "prd".to_string(),
            token: "default-token".to_string(),
            merge: Some(true),
            ..Default::default()
        };

        let mut store = DopplerStore {
            config: "stg".to_string(),
            ..Default::default()
        };
        store.set_defaults(&defaults);
        assert_eq!(store.project, "backend");
        assert_eq!(store.config, "stg");
        assert_eq!(store.token, "default-token");
        assert_eq!(store.merge, Some(true));
    }
}
