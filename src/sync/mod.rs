//! # Sync Registry
//!
//! Process-wide registry of declarative sync specs, keyed
//! `<namespace>/<name>`, plus the worker pool that executes triggered jobs.
//! Triggering a spec enqueues a job carrying a completion channel; the
//! trigger resolves when the job finishes, so callers never poll or sleep.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tracing::{debug, info};

use crate::diff::SecretChange;
use crate::observability::metrics;
use crate::store::{AwsSecretsStore, DopplerStore, HttpStore, StoreError, VaultStore};

pub mod file_backend;
pub mod job;

/// Queue depth for triggered jobs. Back-pressure beyond this comes from the
/// phase semaphores, so the queue never grows unbounded.
const JOB_QUEUE_DEPTH: usize = 64;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("sync config not found: {0}")]
    ConfigNotFound(String),
    #[error("invalid sync config: {0}")]
    InvalidConfig(String),
    #[error("sync queue is not running")]
    QueueClosed,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("sync job failed: {0}")]
    Job(String),
}

/// Lifecycle status of a sync spec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Pending,
    Running,
    Success,
    Failed,
    Suspended,
    DryRun,
}

impl std::fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SyncStatus::Pending => "pending",
            SyncStatus::Running => "running",
            SyncStatus::Success => "success",
            SyncStatus::Failed => "failed",
            SyncStatus::Suspended => "suspended",
            SyncStatus::DryRun => "dryrun",
        };
        f.write_str(s)
    }
}

/// One destination slot in a sync spec. Exactly one driver is set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StoreConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vault: Option<VaultStore>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aws: Option<AwsSecretsStore>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub doppler: Option<DopplerStore>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http: Option<HttpStore>,
}

/// Global driver defaults adopted by specs that leave fields unset.
#[derive(Debug, Clone, Default)]
pub struct StoreDefaults {
    pub vault: Option<VaultStore>,
    pub aws: Option<AwsSecretsStore>,
    pub doppler: Option<DopplerStore>,
    pub http: Option<HttpStore>,
}

/// Path filters applied to source secret paths. Regexes; excludes win.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Filters {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub include: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub exclude: Vec<String>,
}

/// Name transforms applied between source and destination.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Transforms {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub prefix: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub suffix: String,
}

/// A declarative sync spec: one source, one or more destinations.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SyncSpec {
    pub name: String,
    pub namespace: String,
    /// Skip all writes but still emit events.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suspend: Option<bool>,
    /// Compute everything, write nothing.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dry_run: Option<bool>,
    /// Delete destination secrets with no source counterpart.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sync_delete: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<VaultStore>,
    pub dest: Vec<StoreConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filters: Option<Filters>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transforms: Option<Transforms>,
}

impl SyncSpec {
    pub fn internal_name(&self) -> String {
        internal_name(&self.namespace, &self.name)
    }

    fn validate(&self) -> Result<(), SyncError> {
        if self.name.is_empty() {
            return Err(SyncError::InvalidConfig("name is required".to_string()));
        }
        if self.source.is_none() {
            return Err(SyncError::InvalidConfig("source is required".to_string()));
        }
        if self.dest.is_empty() {
            return Err(SyncError::InvalidConfig(
                "at least one dest is required".to_string(),
            ));
        }
        Ok(())
    }
}

/// Registry key for a spec.
pub fn internal_name(namespace: &str, name: &str) -> String {
    format!("{namespace}/{name}")
}

/// Outcome of one executed sync job.
#[derive(Debug, Clone, Default)]
pub struct JobOutcome {
    pub secrets_processed: usize,
    pub changes: Vec<SecretChange>,
}

/// A triggered job: the spec plus its completion channel.
pub struct SyncJob {
    pub spec: SyncSpec,
    pub done: oneshot::Sender<Result<JobOutcome, SyncError>>,
}

/// Process-wide sync registry and job queue.
pub struct SyncRegistry {
    configs: RwLock<HashMap<String, SyncSpec>>,
    statuses: RwLock<HashMap<String, SyncStatus>>,
    defaults: RwLock<StoreDefaults>,
    queue: Mutex<Option<mpsc::Sender<SyncJob>>>,
}

impl SyncRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            configs: RwLock::new(HashMap::new()),
            statuses: RwLock::new(HashMap::new()),
            defaults: RwLock::new(StoreDefaults::default()),
            queue: Mutex::new(None),
        })
    }

    /// Installs global driver defaults used by every subsequent job.
    pub async fn set_store_defaults(&self, defaults: StoreDefaults) {
        *self.defaults.write().await = defaults;
    }

    pub async fn store_defaults(&self) -> StoreDefaults {
        self.defaults.read().await.clone()
    }

    /// Starts the worker pool consuming triggered jobs. Idempotent.
    pub async fn start(self: &Arc<Self>, worker_pool_size: usize) {
        let mut queue = self.queue.lock().await;
        if queue.is_some() {
            return;
        }

        metrics::register();
        let (tx, rx) = mpsc::channel::<SyncJob>(JOB_QUEUE_DEPTH);
        let rx = Arc::new(Mutex::new(rx));

        let workers = worker_pool_size.max(1);
        info!(workers, "starting sync event processor");
        for worker_id in 0..workers {
            let registry = Arc::clone(self);
            let rx = Arc::clone(&rx);
            tokio::spawn(async move {
                loop {
                    let job = {
                        let mut rx = rx.lock().await;
                        rx.recv().await
                    };
                    let Some(job) = job else {
                        debug!(worker_id, "sync queue closed, worker exiting");
                        break;
                    };
                    let outcome = job::run_job(&registry, job.spec).await;
                    // receiver may have gone away on cancellation
                    let _ = job.done.send(outcome);
                }
            });
        }

        *queue = Some(tx);
    }

    /// Registers (or replaces) a sync spec.
    pub async fn add_sync_config(&self, spec: SyncSpec) -> Result<(), SyncError> {
        spec.validate()?;
        let key = spec.internal_name();
        debug!(config = %key, "registering sync config");
        self.configs.write().await.insert(key.clone(), spec);
        self.statuses.write().await.insert(key, SyncStatus::Pending);
        Ok(())
    }

    /// Looks up a spec by its `<namespace>/<name>` key.
    pub async fn get_sync_config_by_name(&self, key: &str) -> Result<SyncSpec, SyncError> {
        self.configs
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| SyncError::ConfigNotFound(key.to_string()))
    }

    /// All registered specs.
    pub async fn configs(&self) -> Vec<SyncSpec> {
        self.configs.read().await.values().cloned().collect()
    }

    pub async fn set_sync_status(&self, namespace: &str, name: &str, status: SyncStatus) {
        let key = internal_name(namespace, name);
        self.statuses.write().await.insert(key, status);
    }

    pub async fn get_sync_status(&self, namespace: &str, name: &str) -> Option<SyncStatus> {
        self.statuses
            .read()
            .await
            .get(&internal_name(namespace, name))
            .copied()
    }

    /// Emits a sync event. Events land in the structured log; notification
    /// transports plug in here.
    pub async fn write_event(
        &self,
        namespace: &str,
        name: &str,
        event_type: &str,
        reason: &str,
        message: &str,
    ) {
        info!(
            namespace,
            name,
            event_type,
            reason,
            message,
            "sync event"
        );
    }

    /// Triggers the named spec and waits for the job to complete.
    pub async fn trigger(&self, namespace: &str, name: &str) -> Result<JobOutcome, SyncError> {
        let spec = self
            .get_sync_config_by_name(&internal_name(namespace, name))
            .await?;
        self.trigger_spec(spec).await
    }

    /// Triggers a spec directly and waits for the job to complete.
    pub async fn trigger_spec(&self, spec: SyncSpec) -> Result<JobOutcome, SyncError> {
        let tx = {
            let queue = self.queue.lock().await;
            queue.clone().ok_or(SyncError::QueueClosed)?
        };

        let (done_tx, done_rx) = oneshot::channel();
        tx.send(SyncJob {
            spec,
            done: done_tx,
        })
        .await
        .map_err(|_| SyncError::QueueClosed)?;

        done_rx.await.map_err(|_| SyncError::QueueClosed)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_spec(namespace: &str, name: &str) -> SyncSpec {
        SyncSpec {
            name: name.to_string(),
            namespace: namespace.to_string(),
            source: Some(VaultStore {
                address: "https://vault.example.com".to_string(),
                path: "analytics/(.*)".to_string(),
                ..Default::default()
            }),
            dest: vec![StoreConfig {
                aws: Some(AwsSecretsStore {
                    region: "us-east-1".to_string(),
                    name: "$1".to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    #[test]
    fn internal_names() {
        assert_eq!(internal_name("pipeline", "sync-Stg"), "pipeline/sync-Stg");
    }

    #[tokio::test]
    async fn add_and_get_configs() {
        let registry = SyncRegistry::new();
        registry
            .add_sync_config(minimal_spec("pipeline", "sync-Stg"))
            .await
            .unwrap();

        let spec = registry
            .get_sync_config_by_name("pipeline/sync-Stg")
            .await
            .unwrap();
        assert_eq!(spec.name, "sync-Stg");
        assert_eq!(
            registry.get_sync_status("pipeline", "sync-Stg").await,
            Some(SyncStatus::Pending)
        );

        let err = registry
            .get_sync_config_by_name("pipeline/missing")
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::ConfigNotFound(_)));
    }

    #[tokio::test]
    async fn invalid_specs_are_rejected() {
        let registry = SyncRegistry::new();

        let mut spec = minimal_spec("pipeline", "bad");
        spec.source = None;
        assert!(matches!(
            registry.add_sync_config(spec).await.unwrap_err(),
            SyncError::InvalidConfig(_)
        ));

        let mut spec = minimal_spec("pipeline", "bad");
        spec.dest.clear();
        assert!(matches!(
            registry.add_sync_config(spec).await.unwrap_err(),
            SyncError::InvalidConfig(_)
        ));
    }

    #[tokio::test]
    async fn trigger_without_processor_fails() {
        let registry = SyncRegistry::new();
        registry
            .add_sync_config(minimal_spec("pipeline", "sync-Stg"))
            .await
            .unwrap();
        let err = registry.trigger("pipeline", "sync-Stg").await.unwrap_err();
        assert!(matches!(err, SyncError::QueueClosed));
    }

    #[tokio::test]
    async fn status_transitions() {
        let registry = SyncRegistry::new();
        registry
            .add_sync_config(minimal_spec("pipeline", "sync-Stg"))
            .await
            .unwrap();
        registry
            .set_sync_status("pipeline", "sync-Stg", SyncStatus::Success)
            .await;
        assert_eq!(
            registry.get_sync_status("pipeline", "sync-Stg").await,
            Some(SyncStatus::Success)
        );
    }
}
