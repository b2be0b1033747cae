//! # File Backend
//!
//! Loads declarative sync specs from a directory of YAML files and keeps
//! the registry in sync with it. Files may hold multiple documents, either
//! bare specs or `kind: SecretSync` manifests. With watching enabled the
//! backend re-loads and re-triggers specs as files change.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use notify::{RecursiveMode, Watcher};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::sync::{SyncRegistry, SyncSpec};

/// File-system backend for sync specs.
pub struct FileBackend {
    pub config_dir: PathBuf,
    pub watch: bool,
}

/// Kubernetes-style wrapper accepted alongside bare specs.
#[derive(Deserialize)]
struct Manifest {
    #[serde(default)]
    kind: String,
    #[serde(default)]
    metadata: ManifestMeta,
    spec: Option<SyncSpec>,
}

#[derive(Deserialize, Default)]
struct ManifestMeta {
    #[serde(default)]
    name: String,
    #[serde(default)]
    namespace: String,
}

impl FileBackend {
    pub fn new(config_dir: impl Into<PathBuf>, watch: bool) -> Self {
        Self {
            config_dir: config_dir.into(),
            watch,
        }
    }

    /// Loads all specs, optionally starts the watcher, and optionally
    /// triggers an initial sync for everything loaded.
    pub async fn start(
        &self,
        registry: &Arc<SyncRegistry>,
        trigger_initial: bool,
    ) -> Result<()> {
        info!(config_dir = %self.config_dir.display(), "starting file backend");

        if !self.config_dir.exists() {
            debug!(config_dir = %self.config_dir.display(), "config directory does not exist, creating");
            std::fs::create_dir_all(&self.config_dir)
                .context("failed to create config directory")?;
        }

        let loaded = self.load_configs(registry).await?;

        if trigger_initial {
            trigger_specs(registry, &loaded).await;
        }

        if self.watch {
            if let Err(e) = self.start_watcher(registry) {
                warn!(error = %e, "failed to start file watcher, continuing without watch");
            }
        }

        info!(specs = loaded.len(), "file backend started");
        Ok(())
    }

    /// Loads every YAML file in the config directory. Unparseable files are
    /// skipped with a warning.
    async fn load_configs(&self, registry: &Arc<SyncRegistry>) -> Result<Vec<String>> {
        let mut loaded = Vec::new();

        let entries = std::fs::read_dir(&self.config_dir)
            .with_context(|| format!("failed to read {}", self.config_dir.display()))?;
        let mut paths: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                matches!(
                    p.extension().and_then(|e| e.to_str()),
                    Some("yaml") | Some("yml")
                )
            })
            .collect();
        paths.sort();

        debug!(file_count = paths.len(), "found config files");

        for path in paths {
            match load_config_file(&path, registry).await {
                Ok(mut names) => loaded.append(&mut names),
                Err(e) => {
                    warn!(file = %path.display(), error = %e, "failed to load config file");
                }
            }
        }

        Ok(loaded)
    }

    fn start_watcher(&self, registry: &Arc<SyncRegistry>) -> Result<()> {
        let (tx, mut rx) = tokio::sync::mpsc::channel::<PathBuf>(16);

        let mut watcher =
            notify::recommended_watcher(move |event: notify::Result<notify::Event>| {
                let Ok(event) = event else { return };
                if !matches!(
                    event.kind,
                    notify::EventKind::Create(_) | notify::EventKind::Modify(_)
                ) {
                    return;
                }
                for path in event.paths {
                    if matches!(
                        path.extension().and_then(|e| e.to_str()),
                        Some("yaml") | Some("yml")
                    ) {
                        let _ = tx.blocking_send(path);
                    }
                }
            })?;
        watcher.watch(&self.config_dir, RecursiveMode::NonRecursive)?;
        info!(config_dir = %self.config_dir.display(), "started file watcher");

        let registry = Arc::clone(registry);
        tokio::spawn(async move {
            // watcher lives as long as this task
            let _watcher = watcher;
            while let Some(path) = rx.recv().await {
                // let the writer finish before re-reading
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                debug!(file = %path.display(), "handling file event");
                match load_config_file(&path, &registry).await {
                    Ok(names) => trigger_specs(&registry, &names).await,
                    Err(e) => {
                        warn!(file = %path.display(), error = %e, "failed to reload config")
                    }
                }
            }
        });

        Ok(())
    }
}

/// Loads one YAML file, which may hold several documents. Returns the
/// internal names of the specs registered from it.
async fn load_config_file(path: &Path, registry: &Arc<SyncRegistry>) -> Result<Vec<String>> {
    debug!(file = %path.display(), "loading config file");
    let data = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;

    let mut names = Vec::new();
    for document in data.split("\n---") {
        let document = document.trim_start_matches("---").trim();
        if document.is_empty() {
            continue;
        }

        let mut spec = parse_spec_document(document)
            .with_context(|| format!("failed to parse document in {}", path.display()))?;

        if spec.name.is_empty() {
            spec.name = path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or("unnamed")
                .to_string();
        }
        if spec.namespace.is_empty() {
            spec.namespace = "default".to_string();
        }

        debug!(name = %spec.name, namespace = %spec.namespace, "loaded sync config");
        let key = spec.internal_name();
        match registry.add_sync_config(spec).await {
            Ok(()) => names.push(key),
            Err(e) => warn!(config = %key, error = %e, "failed to add sync config"),
        }
    }

    Ok(names)
}

/// Parses a single YAML document as a manifest or a bare spec.
fn parse_spec_document(document: &str) -> Result<SyncSpec> {
    if let Ok(manifest) = serde_yaml::from_str::<Manifest>(document) {
        if manifest.kind == "SecretSync" {
            let mut spec = manifest
                .spec
                .context("SecretSync manifest has no spec")?;
            if spec.name.is_empty() {
                spec.name = manifest.metadata.name;
            }
            if spec.namespace.is_empty() {
                spec.namespace = manifest.metadata.namespace;
            }
            return Ok(spec);
        }
    }

    serde_yaml::from_str::<SyncSpec>(document).context("not a sync spec")
}

async fn trigger_specs(registry: &Arc<SyncRegistry>, names: &[String]) {
    for name in names {
        match registry.get_sync_config_by_name(name).await {
            Ok(spec) => {
                if let Err(e) = registry.trigger_spec(spec).await {
                    warn!(config = %name, error = %e, "failed to trigger sync");
                }
            }
            Err(e) => warn!(config = %name, error = %e, "config disappeared before trigger"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn loads_bare_and_manifest_documents() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("merge-analytics.yaml"),
            r#"
namespace: pipeline
source:
  address: https://vault.example.com
  path: analytics/(.*)
dest:
  - vault:
      address: https://vault.example.com
      path: merged/Stg/$1
      merge: true
---
kind: SecretSync
metadata:
  name: sync-Stg
  namespace: pipeline
spec:
  source:
    address: https://vault.example.com
    path: merged/Stg/(.*)
  dest:
    - aws:
        region: us-east-1
        name: "$1"
"#,
        )
        .unwrap();

        let registry = SyncRegistry::new();
        let backend = FileBackend::new(dir.path(), false);
        backend.start(&registry, false).await.unwrap();

        // first document takes its name from the file stem
        let from_stem = registry
            .get_sync_config_by_name("pipeline/merge-analytics")
            .await
            .unwrap();
        assert!(from_stem.dest[0].vault.as_ref().unwrap().merge);

        let manifest = registry
            .get_sync_config_by_name("pipeline/sync-Stg")
            .await
            .unwrap();
        assert_eq!(
            manifest.dest[0].aws.as_ref().unwrap().region,
            "us-east-1"
        );
    }

    #[tokio::test]
    async fn skips_unparseable_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("broken.yaml"), ":::: not yaml ::::").unwrap();
        std::fs::write(dir.path().join("ignored.txt"), "not a config").unwrap();

        let registry = SyncRegistry::new();
        let backend = FileBackend::new(dir.path(), false);
        backend.start(&registry, false).await.unwrap();
        assert!(registry.configs().await.is_empty());
    }

    #[tokio::test]
    async fn creates_missing_config_dir() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("syncs");
        let registry = SyncRegistry::new();
        let backend = FileBackend::new(&nested, false);
        backend.start(&registry, false).await.unwrap();
        assert!(nested.exists());
    }
}
