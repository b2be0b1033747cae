//! # Sync Job Execution
//!
//! Runs one triggered sync spec: enumerate the source, filter, transform,
//! classify changes, and write through each destination's idempotency gate.
//! Merge-sink destinations deep-merge instead of replacing. The job reports
//! per-secret change records so the pipeline can assemble its diff.

use std::sync::Arc;
use std::time::Instant;

use regex::Regex;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::diff::{diff_secrets, SecretChange};
use crate::merge::deep_merge_json;
use crate::observability::metrics;
use crate::store::{StoreDriver, StoreError};
use crate::sync::{JobOutcome, StoreConfig, SyncError, SyncRegistry, SyncSpec, SyncStatus};

/// A destination prepared for writing: the live driver, the name template
/// and whether it merges instead of replacing.
struct PreparedDest {
    driver: Box<dyn StoreDriver>,
    template: String,
    merge_sink: bool,
}

/// Splits a source path into its listable scope and its match pattern.
/// `analytics/(.*)` lists under `analytics` and captures the secret name;
/// a path without a capture gets an implicit `/(.*)` appended.
pub(crate) fn source_scope_and_pattern(path: &str) -> Result<(String, Regex), SyncError> {
    let raw = path.trim_matches('/');
    let pattern_str = if raw.contains('(') {
        raw.to_string()
    } else {
        format!("{raw}/(.*)")
    };

    let scope = pattern_str
        .split_once('(')
        .map(|(head, _)| head.trim_end_matches('/'))
        .unwrap_or(raw)
        .to_string();

    let pattern = Regex::new(&format!("^{pattern_str}$"))
        .map_err(|e| SyncError::InvalidConfig(format!("invalid source path pattern: {e}")))?;
    Ok((scope, pattern))
}

/// Applies the spec's include/exclude filters to a source path. Excludes
/// win over includes; no include list means everything is included.
pub(crate) fn should_filter(spec: &SyncSpec, source_path: &str) -> Result<bool, SyncError> {
    let Some(filters) = &spec.filters else {
        return Ok(false);
    };

    for exclude in &filters.exclude {
        let re = Regex::new(exclude)
            .map_err(|e| SyncError::InvalidConfig(format!("invalid exclude filter: {e}")))?;
        if re.is_match(source_path) {
            return Ok(true);
        }
    }

    if !filters.include.is_empty() {
        for include in &filters.include {
            let re = Regex::new(include)
                .map_err(|e| SyncError::InvalidConfig(format!("invalid include filter: {e}")))?;
            if re.is_match(source_path) {
                return Ok(false);
            }
        }
        return Ok(true);
    }

    Ok(false)
}

/// Resolves the destination secret name from the source path, the capture
/// pattern, the destination template and the spec's transforms.
pub(crate) fn compute_dest_name(
    spec: &SyncSpec,
    pattern: &Regex,
    source_path: &str,
    template: &str,
) -> String {
    let name = pattern.replace(source_path, template).into_owned();
    match &spec.transforms {
        Some(t) => format!("{}{name}{}", t.prefix, t.suffix),
        None => name,
    }
}

/// Classifies one secret against its destination state. Produces exactly
/// one change record.
pub(crate) fn change_for_secret(
    dest_name: &str,
    existing: Option<&[u8]>,
    desired: &[u8],
) -> SecretChange {
    let parse = |bytes: &[u8]| -> Value {
        serde_json::from_slice(bytes)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(bytes).into_owned()))
    };

    let mut current_map = Map::new();
    if let Some(existing) = existing {
        current_map.insert(dest_name.to_string(), parse(existing));
    }
    let mut desired_map = Map::new();
    desired_map.insert(dest_name.to_string(), parse(desired));

    diff_secrets(&current_map, &desired_map)
        .into_iter()
        .next()
        .expect("diff of a singleton map yields one change")
}

async fn prepare_dest(
    registry: &SyncRegistry,
    dest: &StoreConfig,
) -> Result<Option<PreparedDest>, SyncError> {
    let defaults = registry.store_defaults().await;

    if let Some(vault) = &dest.vault {
        let mut driver = vault.clone();
        if let Some(d) = &defaults.vault {
            driver.set_defaults(d);
        }
        let template = driver.path.clone();
        let merge_sink = driver.merge;
        driver.init().await?;
        return Ok(Some(PreparedDest {
            driver: Box::new(driver),
            template,
            merge_sink,
        }));
    }

    if let Some(aws) = &dest.aws {
        let mut driver = aws.clone();
        if let Some(d) = &defaults.aws {
            driver.set_defaults(d);
        }
        let template = if driver.name.is_empty() {
            "$1".to_string()
        } else {
            driver.name.clone()
        };
        driver.init().await?;
        return Ok(Some(PreparedDest {
            driver: Box::new(driver),
            template,
            merge_sink: false,
        }));
    }

    if let Some(doppler) = &dest.doppler {
        let mut driver = doppler.clone();
        if let Some(d) = &defaults.doppler {
            driver.set_defaults(d);
        }
        driver.init().await?;
        return Ok(Some(PreparedDest {
            driver: Box::new(driver),
            template: "$1".to_string(),
            merge_sink: false,
        }));
    }

    if let Some(http) = &dest.http {
        let mut driver = http.clone();
        if let Some(d) = &defaults.http {
            driver.set_defaults(d);
        }
        driver.init().await?;
        return Ok(Some(PreparedDest {
            driver: Box::new(driver),
            template: "$1".to_string(),
            merge_sink: false,
        }));
    }

    Ok(None)
}

/// Executes one sync job to completion.
pub async fn run_job(registry: &Arc<SyncRegistry>, spec: SyncSpec) -> Result<JobOutcome, SyncError> {
    let start = Instant::now();
    let (namespace, name) = (spec.namespace.clone(), spec.name.clone());

    if spec.suspend.unwrap_or(false) {
        info!(namespace = %namespace, name = %name, "sync suspended");
        registry
            .set_sync_status(&namespace, &name, SyncStatus::Suspended)
            .await;
        registry
            .write_event(&namespace, &name, "Normal", "suspended", "sync suspended")
            .await;
        return Ok(JobOutcome::default());
    }

    registry
        .set_sync_status(&namespace, &name, SyncStatus::Running)
        .await;

    let result = execute(registry, &spec).await;
    let elapsed = start.elapsed().as_secs_f64();
    let dry_run = spec.dry_run.unwrap_or(false);

    match &result {
        Ok(outcome) => {
            let status = if dry_run {
                SyncStatus::DryRun
            } else {
                SyncStatus::Success
            };
            registry.set_sync_status(&namespace, &name, status).await;
            registry
                .write_event(
                    &namespace,
                    &name,
                    "Normal",
                    &status.to_string(),
                    &format!("synced {} secrets", outcome.secrets_processed),
                )
                .await;
            metrics::observe_job(&namespace, &name, &status.to_string(), elapsed);
            metrics::add_secrets_processed(outcome.secrets_processed as u64);
        }
        Err(e) => {
            registry
                .set_sync_status(&namespace, &name, SyncStatus::Failed)
                .await;
            registry
                .write_event(
                    &namespace,
                    &name,
                    "Warning",
                    "failed",
                    &format!("error syncing: {e}"),
                )
                .await;
            metrics::observe_job(&namespace, &name, "failed", elapsed);
            metrics::observe_job_error(&namespace, &name);
        }
    }

    result
}

async fn execute(registry: &Arc<SyncRegistry>, spec: &SyncSpec) -> Result<JobOutcome, SyncError> {
    let dry_run = spec.dry_run.unwrap_or(false);
    let defaults = registry.store_defaults().await;

    let mut source = spec
        .source
        .clone()
        .ok_or_else(|| SyncError::InvalidConfig("source is required".to_string()))?;
    if let Some(d) = &defaults.vault {
        source.set_defaults(d);
    }
    source.init().await?;

    let (scope, pattern) = source_scope_and_pattern(&source.path)?;

    let mut dests = Vec::new();
    for dest in &spec.dest {
        match prepare_dest(registry, dest).await? {
            Some(prepared) => dests.push(prepared),
            None => {
                return Err(SyncError::InvalidConfig(
                    "dest entry has no driver configured".to_string(),
                ))
            }
        }
    }

    let names = source.list_secrets(&scope).await?;
    debug!(scope = %scope, count = names.len(), "enumerated source secrets");

    let mut outcome = JobOutcome::default();
    let mut errors: Vec<String> = Vec::new();

    for secret_name in &names {
        let source_path = format!("{scope}/{secret_name}");

        if should_filter(spec, &source_path)? {
            debug!(path = %source_path, "filtering secret");
            continue;
        }

        let payload = match source.get_secret(&source_path).await {
            Ok(payload) => payload,
            Err(e) => {
                warn!(path = %source_path, error = %e, "failed to read source secret");
                errors.push(format!("{source_path}: {e}"));
                continue;
            }
        };

        if payload.is_empty() || payload == b"{}" {
            debug!(path = %source_path, "skipping empty secret");
            continue;
        }

        for dest in &mut dests {
            let dest_name = compute_dest_name(spec, &pattern, &source_path, &dest.template);

            let existing = match dest.driver.get_secret(&dest_name).await {
                Ok(existing) => Some(existing),
                Err(StoreError::NotFound(_)) => None,
                // write-only sinks have no read-back
                Err(StoreError::Unsupported(_)) => None,
                Err(e) => {
                    warn!(path = %dest_name, error = %e, "failed to read destination secret");
                    errors.push(format!("{dest_name}: {e}"));
                    continue;
                }
            };

            let desired = if dest.merge_sink {
                match deep_merge_json(existing.as_deref().unwrap_or_default(), &payload) {
                    Ok(merged) => merged,
                    Err(e) => {
                        errors.push(format!("{dest_name}: merge failed: {e}"));
                        continue;
                    }
                }
            } else {
                payload.clone()
            };

            outcome
                .changes
                .push(change_for_secret(&dest_name, existing.as_deref(), &desired));

            if dry_run {
                debug!(
                    path = %dest_name,
                    driver = %dest.driver.driver(),
                    "dry run: skipping write"
                );
                continue;
            }

            if let Err(e) = dest.driver.write_secret(&dest_name, &payload).await {
                warn!(path = %dest_name, error = %e, "failed to write destination secret");
                errors.push(format!("{dest_name}: {e}"));
            }
        }

        outcome.secrets_processed += 1;
    }

    // orphan deletion: destination secrets with no source counterpart
    if spec.sync_delete.unwrap_or(false) {
        for dest in &mut dests {
            let desired_names: std::collections::HashSet<String> = names
                .iter()
                .map(|n| {
                    compute_dest_name(spec, &pattern, &format!("{scope}/{n}"), &dest.template)
                })
                .collect();

            let current = match dest.driver.list_secrets("").await {
                Ok(current) => current,
                Err(StoreError::Unsupported(_)) => continue,
                Err(e) => {
                    warn!(driver = %dest.driver.driver(), error = %e, "failed to list destination");
                    errors.push(format!("list {}: {e}", dest.driver.get_path()));
                    continue;
                }
            };

            for orphan in current {
                if desired_names.contains(&orphan) {
                    continue;
                }
                outcome.changes.push(SecretChange {
                    path: orphan.clone(),
                    change_type: crate::diff::ChangeType::Removed,
                    target: None,
                    keys_added: Vec::new(),
                    keys_removed: Vec::new(),
                    keys_modified: Vec::new(),
                    current_keys: Vec::new(),
                    desired_keys: Vec::new(),
                });
                if dry_run {
                    continue;
                }
                if let Err(e) = dest.driver.delete_secret(&orphan).await {
                    warn!(path = %orphan, error = %e, "failed to delete orphaned secret");
                    errors.push(format!("{orphan}: {e}"));
                }
            }
        }
    }

    for dest in &mut dests {
        let _ = dest.driver.close().await;
    }
    source.close().await?;

    if !errors.is_empty() {
        return Err(SyncError::Job(errors.join("; ")));
    }

    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::ChangeType;
    use crate::sync::{Filters, Transforms};

    #[test]
    fn scope_and_pattern_from_paths() {
        let (scope, pattern) = source_scope_and_pattern("analytics/(.*)").unwrap();
        assert_eq!(scope, "analytics");
        let caps = pattern.captures("analytics/creds/db").unwrap();
        assert_eq!(&caps[1], "creds/db");

        // paths without a capture get an implicit one
        let (scope, pattern) = source_scope_and_pattern("merged/Stg").unwrap();
        assert_eq!(scope, "merged/Stg");
        assert!(pattern.is_match("merged/Stg/db"));
    }

    #[test]
    fn dest_name_resolution() {
        let spec = SyncSpec::default();
        let (_, pattern) = source_scope_and_pattern("analytics/(.*)").unwrap();

        assert_eq!(
            compute_dest_name(&spec, &pattern, "analytics/creds/db", "merged/Stg/$1"),
            "merged/Stg/creds/db"
        );
        assert_eq!(
            compute_dest_name(&spec, &pattern, "analytics/creds/db", "$1"),
            "creds/db"
        );

        let spec = SyncSpec {
            transforms: Some(Transforms {
                prefix: "platform/".to_string(),
                suffix: String::new(),
            }),
            ..Default::default()
        };
        assert_eq!(
            compute_dest_name(&spec, &pattern, "analytics/db", "$1"),
            "platform/db"
        );
    }

    #[test]
    fn filters_exclude_wins() {
        let spec = SyncSpec {
            filters: Some(Filters {
                include: vec!["^analytics/.*".to_string()],
                exclude: vec![".*internal.*".to_string()],
            }),
            ..Default::default()
        };

        assert!(!should_filter(&spec, "analytics/db").unwrap());
        assert!(should_filter(&spec, "analytics/internal/key").unwrap());
        assert!(should_filter(&spec, "other/db").unwrap());

        // no filters: nothing filtered
        assert!(!should_filter(&SyncSpec::default(), "anything").unwrap());
    }

    #[test]
    fn change_classification() {
        let added = change_for_secret("db", None, br#"{"user":"a"}"#);
        assert_eq!(added.change_type, ChangeType::Added);

        let unchanged = change_for_secret("db", Some(br#"{"n":1}"#), br#"{"n":1.0}"#);
        assert_eq!(unchanged.change_type, ChangeType::Unchanged);

        let modified =
            change_for_secret("db", Some(br#"{"user":"a"}"#), br#"{"user":"b","port":1}"#);
        assert_eq!(modified.change_type, ChangeType::Modified);
        assert_eq!(modified.keys_added, vec!["port"]);
        assert_eq!(modified.keys_modified, vec!["user"]);
    }
}
