//! # HTTP Store
//!
//! Generic HTTP sink for secret payloads. Each write posts the JSON payload
//! to `<endpoint>/<path>`; reads and listing depend on the remote contract
//! and are unsupported by default.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::store::{DriverName, StoreDriver, StoreError};

/// Generic HTTP sink configuration and client.
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct HttpStore {
    /// Base URL for the sink.
    pub endpoint: String,
    /// HTTP method for writes; POST when unset.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub method: String,
    /// Additional request headers.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    /// Bearer token for authentication.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub token: String,

    #[serde(skip)]
    http_client: Option<reqwest::Client>,
}

impl std::fmt::Debug for HttpStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpStore")
            .field("endpoint", &self.endpoint)
            .field("method", &self.method)
            .finish_non_exhaustive()
    }
}

impl HttpStore {
    /// Adopts unset fields from a defaults document.
    pub fn set_defaults(&mut self, defaults: &HttpStore) {
        if self.endpoint.is_empty() {
            self.endpoint = defaults.endpoint.clone();
        }
        if self.method.is_empty() {
            self.method = defaults.method.clone();
        }
        if self.token.is_empty() {
            self.token = defaults.token.clone();
        }
        for (key, value) in &defaults.headers {
            self.headers
                .entry(key.clone())
                .or_insert_with(|| value.clone());
        }
    }

    fn write_method(&self) -> Method {
        match self.method.to_uppercase().as_str() {
            "PUT" => Method::PUT,
            "PATCH" => Method::PATCH,
            _ => Method::POST,
        }
    }
}

#[async_trait]
impl StoreDriver for HttpStore {
    async fn init(&mut self) -> Result<(), StoreError> {
        if self.endpoint.is_empty() {
            return Err(StoreError::Configuration("endpoint is required".to_string()));
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| StoreError::Configuration(format!("failed to build client: {e}")))?;
        self.http_client = Some(client);
        Ok(())
    }

    fn driver(&self) -> DriverName {
        DriverName::Http
    }

    fn get_path(&self) -> String {
        self.endpoint.clone()
    }

    fn meta(&self) -> Map<String, Value> {
        let mut md = match serde_json::to_value(self) {
            Ok(Value::Object(m)) => m,
            _ => Map::new(),
        };
        md.remove("token");
        // header values routinely carry credentials
        md.remove("headers");
        md
    }

    async fn get_secret(&self, _name: &str) -> Result<Vec<u8>, StoreError> {
        Err(StoreError::Unsupported(
            "http sink does not support reads".to_string(),
        ))
    }

    async fn write_secret(
        &self,
        path: &str,
        payload: &[u8],
    ) -> Result<Option<Vec<u8>>, StoreError> {
        let client = self.http_client.as_ref().ok_or_else(|| {
            StoreError::Configuration("http client not initialized".to_string())
        })?;

        let url = format!(
            "{}/{}",
            self.endpoint.trim_end_matches('/'),
            path.trim_start_matches('/')
        );
        let body: Value = serde_json::from_slice(payload)?;

        let mut request = client.request(self.write_method(), &url).json(&body);
        if !self.token.is_empty() {
            request = request.bearer_auth(&self.token);
        }
        for (key, value) in &self.headers {
            request = request.header(key, value);
        }

        let response = request
            .send()
            .await
            .map_err(|e| StoreError::Remote(format!("request failed: {e}")))?;

        let status = response.status();
        if status.as_u16() >= 400 {
            debug!(status = status.as_u16(), "http sink error");
            return Err(StoreError::Remote(format!(
                "API error: status={}",
                status.as_u16()
            )));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| StoreError::Remote(format!("failed to read response: {e}")))?;
        Ok(Some(bytes.to_vec()))
    }

    async fn delete_secret(&self, name: &str) -> Result<(), StoreError> {
        if name.is_empty() {
            // nothing to enumerate on a write-only sink
            return Ok(());
        }
        let client = self.http_client.as_ref().ok_or_else(|| {
            StoreError::Configuration("http client not initialized".to_string())
        })?;

        let url = format!(
            "{}/{}",
            self.endpoint.trim_end_matches('/'),
            name.trim_start_matches('/')
        );
        let mut request = client.request(Method::DELETE, &url);
        if !self.token.is_empty() {
            request = request.bearer_auth(&self.token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| StoreError::Remote(format!("request failed: {e}")))?;
        let status = response.status();
        // 404 is fine; deletion is idempotent
        if status.as_u16() >= 400 && status.as_u16() != 404 {
            return Err(StoreError::Remote(format!(
                "API error: status={}",
                status.as_u16()
            )));
        }
        Ok(())
    }

    async fn list_secrets(&self, _path: &str) -> Result<Vec<String>, StoreError> {
        Err(StoreError::Unsupported(
            "http sink does not support listing".to_string(),
        ))
    }

    async fn close(&mut self) -> Result<(), StoreError> {
        self.http_client = None;
        Ok(())
    }
}
