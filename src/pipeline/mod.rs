//! # Pipeline Orchestrator
//!
//! Two-phase secrets synchronization:
//!
//! 1. **Merge** — aggregate each target's imports into the merge store,
//!    walking dependency levels in order so inherited targets see their
//!    parents' merged output.
//! 2. **Sync** — push each target's merged secrets to its destination
//!    account, fully parallel across targets.
//!
//! Parallelism within a phase is bounded by a semaphore; a group barrier
//! separates dependency levels. Results accumulate under a mutex and feed
//! the diff engine for dry-run and CI verification.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use futures::future::join_all;
use serde::Serialize;
use tokio::sync::{watch, Mutex, Semaphore};
use tracing::{debug, info, warn};

use crate::aws::context::ExecutionContext;
use crate::aws::discovery::expand_dynamic_targets;
use crate::config::{Config, Target};
use crate::diff::{format_diff, OutputFormat, PipelineDiff, SecretChange, TargetDiff};
use crate::graph::Graph;
use crate::merge::deep_merge;
use crate::store::{AwsSecretsStore, S3MergeStore, StoreDriver, VaultStore};
use crate::sync::{StoreConfig, StoreDefaults, SyncRegistry, SyncSpec};

/// What the pipeline should do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Operation {
    /// Sources → merge store only.
    Merge,
    /// Merge store → destinations only.
    Sync,
    /// Merge then sync, in dependency order.
    #[default]
    Pipeline,
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Operation::Merge => f.write_str("merge"),
            Operation::Sync => f.write_str("sync"),
            Operation::Pipeline => f.write_str("pipeline"),
        }
    }
}

/// Execution options for a pipeline run.
#[derive(Debug, Clone, Default)]
pub struct Options {
    pub operation: Operation,
    /// Targets to process; empty means all.
    pub targets: Vec<String>,
    pub dry_run: bool,
    pub continue_on_error: bool,
    /// Max concurrent operations per phase; 0 takes the config value.
    pub parallelism: usize,
    /// Collect a change set even when not in dry-run mode.
    pub compute_diff: bool,
    /// Cancellation signal; once true, no new tasks are scheduled.
    pub shutdown: Option<watch::Receiver<bool>>,
}

/// Outcome of one target × phase execution.
#[derive(Debug, Clone, Serialize)]
pub struct TargetResult {
    pub target: String,
    pub phase: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration: Duration,
    pub details: ResultDetails,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ResultDetails {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub source_paths: Vec<String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub destination_path: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub role_arn: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub failed_imports: Vec<String>,
    pub secrets_processed: usize,
}

/// The pipeline orchestrator.
pub struct Pipeline {
    config: Config,
    graph: Graph,
    aws_ctx: Option<Arc<ExecutionContext>>,
    s3_store: Option<S3MergeStore>,
    registry: Arc<SyncRegistry>,
    config_path: Option<String>,

    initialized: Mutex<bool>,
    /// Guards `run` against re-entrant execution.
    run_lock: Mutex<()>,
    results: std::sync::Mutex<Vec<TargetResult>>,
    diff: std::sync::Mutex<Option<PipelineDiff>>,
}

impl Pipeline {
    /// Creates a pipeline from a validated configuration. No cloud context;
    /// dynamic targets stay unexpanded.
    pub fn new(config: Config) -> Result<Self> {
        config.validate().context("invalid configuration")?;
        let graph = Graph::build(&config).context("failed to build dependency graph")?;
        Ok(Self {
            config,
            graph,
            aws_ctx: None,
            s3_store: None,
            registry: SyncRegistry::new(),
            config_path: None,
            initialized: Mutex::new(false),
            run_lock: Mutex::new(()),
            results: std::sync::Mutex::new(Vec::new()),
            diff: std::sync::Mutex::new(None),
        })
    }

    /// Creates a pipeline with an AWS execution context, expanding dynamic
    /// targets before the graph is built. Context failures downgrade to a
    /// warning so vault-only configs keep working.
    pub async fn new_with_context(mut config: Config) -> Result<Self> {
        config.validate().context("invalid configuration")?;

        let aws_ctx = match ExecutionContext::new(&config.aws).await {
            Ok(ctx) => Some(Arc::new(ctx)),
            Err(e) => {
                warn!(error = %e, "failed to create AWS execution context, continuing without it");
                None
            }
        };

        if let Some(ctx) = &aws_ctx {
            if !config.dynamic_targets.is_empty() {
                if let Err(e) = expand_dynamic_targets(&mut config, ctx).await {
                    warn!(error = %e, "failed to expand dynamic targets");
                }
            }
        }

        let graph = Graph::build(&config).context("failed to build dependency graph")?;

        let s3_store = match &config.merge_store.s3 {
            Some(s3_cfg) => Some(
                S3MergeStore::new(s3_cfg, &config.aws.region)
                    .await
                    .context("failed to create S3 merge store")?,
            ),
            None => None,
        };

        Ok(Self {
            config,
            graph,
            aws_ctx,
            s3_store,
            registry: SyncRegistry::new(),
            config_path: None,
            initialized: Mutex::new(false),
            run_lock: Mutex::new(()),
            results: std::sync::Mutex::new(Vec::new()),
            diff: std::sync::Mutex::new(None),
        })
    }

    /// Creates a pipeline from a configuration file.
    pub fn from_file(path: &str) -> Result<Self> {
        let config = Config::load(path).context("failed to load config")?;
        let mut pipeline = Self::new(config)?;
        pipeline.config_path = Some(path.to_string());
        Ok(pipeline)
    }

    /// Creates a pipeline from a configuration file with dynamic target
    /// discovery enabled.
    pub async fn from_file_with_context(path: &str) -> Result<Self> {
        let config = Config::load(path).context("failed to load config")?;
        let mut pipeline = Self::new_with_context(config).await?;
        pipeline.config_path = Some(path.to_string());
        Ok(pipeline)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    /// Results from the last run.
    pub fn results(&self) -> Vec<TargetResult> {
        self.results.lock().expect("results mutex poisoned").clone()
    }

    /// Change set from the last run, when one was computed.
    pub fn diff(&self) -> Option<PipelineDiff> {
        self.diff.lock().expect("diff mutex poisoned").clone()
    }

    pub fn format_diff(&self, format: OutputFormat) -> String {
        match self.diff() {
            Some(diff) => format_diff(&diff, format),
            None => String::new(),
        }
    }

    /// CI exit code: 2 on run failures, otherwise the diff's zero-sum code.
    pub fn exit_code(&self) -> i32 {
        if self.results().iter().any(|r| !r.success) {
            return 2;
        }
        match self.diff() {
            Some(diff) => diff.exit_code(),
            None => 0,
        }
    }

    /// Starts the sync infrastructure and installs store defaults.
    async fn initialize(&self) -> Result<()> {
        let mut initialized = self.initialized.lock().await;
        if *initialized {
            return Ok(());
        }
        debug!("initializing pipeline infrastructure");

        self.registry
            .set_store_defaults(StoreDefaults {
                vault: Some(VaultStore {
                    address: self.config.vault.address.clone(),
                    namespace: self.config.vault.namespace.clone(),
                    token: self
                        .config
                        .vault
                        .auth
                        .token
                        .as_ref()
                        .map(|t| t.token.clone())
                        .unwrap_or_default(),
                    approle: self.config.vault.auth.approle.as_ref().map(|a| {
                        crate::store::vault::VaultAppRole {
                            mount: a.mount.clone(),
                            role_id: a.role_id.clone(),
                            secret_id: a.secret_id.clone(),
                        }
                    }),
                    kubernetes: self.config.vault.auth.kubernetes.as_ref().map(|k| {
                        crate::store::vault::VaultKubernetes {
                            role: k.role.clone(),
                            mount_path: k.mount_path.clone(),
                        }
                    }),
                    ..Default::default()
                }),
                aws: Some(AwsSecretsStore {
                    region: self.config.aws.region.clone(),
                    ..Default::default()
                }),
                ..Default::default()
            })
            .await;

        self.registry.start(self.config.pipeline.merge.parallel).await;

        *initialized = true;
        info!("pipeline infrastructure initialized");
        Ok(())
    }

    /// Targets to process: everything in topological order, or the request
    /// closed over its target dependencies.
    fn resolve_targets(&self, requested: &[String]) -> Vec<String> {
        if requested.is_empty() {
            self.graph.topological_order()
        } else {
            self.graph.include_dependencies(requested)
        }
    }

    /// Executes the pipeline. Re-entrant calls serialize on an internal
    /// lock.
    pub async fn run(&self, mut opts: Options) -> Result<Vec<TargetResult>> {
        let _guard = self.run_lock.lock().await;

        self.initialize().await?;
        self.results.lock().expect("results mutex poisoned").clear();
        *self.diff.lock().expect("diff mutex poisoned") = None;

        let targets = self.resolve_targets(&opts.targets);
        info!(targets = ?targets, operation = %opts.operation, dry_run = opts.dry_run, "starting pipeline execution");

        if opts.parallelism == 0 {
            opts.parallelism = self.config.pipeline.merge.parallel.max(1);
        }

        let collect_diff = opts.compute_diff || opts.dry_run;
        let mut diffs: Vec<TargetDiff> = Vec::new();
        let mut all_results = Vec::new();
        let mut phase_error: Option<anyhow::Error> = None;

        if matches!(opts.operation, Operation::Merge | Operation::Pipeline) {
            info!("phase 1: merge");
            let (results, target_changes, err) = self.execute_merge_phase(&targets, &opts).await;
            all_results.extend(results);
            absorb_changes(&mut diffs, target_changes);
            if let Some(err) = err {
                if !opts.continue_on_error {
                    self.finish_run(&all_results, collect_diff, diffs, opts.dry_run);
                    return Err(err.context("merge phase failed"));
                }
                phase_error = Some(err);
            }
        }

        if matches!(opts.operation, Operation::Sync | Operation::Pipeline) {
            info!("phase 2: sync");
            let sync_parallel = self.config.pipeline.sync.parallel.max(1);
            let (results, target_changes, err) = self
                .execute_sync_phase(&targets, &opts, sync_parallel)
                .await;
            all_results.extend(results);
            absorb_changes(&mut diffs, target_changes);
            if let Some(err) = err {
                if !opts.continue_on_error {
                    self.finish_run(&all_results, collect_diff, diffs, opts.dry_run);
                    return Err(err.context("sync phase failed"));
                }
                phase_error = Some(err);
            }
        }

        self.finish_run(&all_results, collect_diff, diffs, opts.dry_run);

        match phase_error {
            Some(err) => Err(err),
            None => Ok(all_results),
        }
    }

    fn finish_run(
        &self,
        results: &[TargetResult],
        collect_diff: bool,
        diffs: Vec<TargetDiff>,
        dry_run: bool,
    ) {
        *self.results.lock().expect("results mutex poisoned") = results.to_vec();
        if collect_diff {
            let mut pipeline_diff = PipelineDiff {
                dry_run,
                config_path: self.config_path.clone(),
                ..Default::default()
            };
            for td in diffs {
                pipeline_diff.add_target_diff(td);
            }
            *self.diff.lock().expect("diff mutex poisoned") = Some(pipeline_diff);
        }
    }

    /// Merge phase: walk levels in ascending order, each level's targets in
    /// parallel under the merge semaphore, with a barrier between levels.
    async fn execute_merge_phase(
        &self,
        targets: &[String],
        opts: &Options,
    ) -> (
        Vec<TargetResult>,
        Vec<(String, Vec<SecretChange>)>,
        Option<anyhow::Error>,
    ) {
        let mut results = Vec::new();
        let mut changes = Vec::new();
        let mut last_err: Option<anyhow::Error> = None;

        let semaphore = Arc::new(Semaphore::new(opts.parallelism.max(1)));

        for (level_idx, level) in self.graph.group_by_level().iter().enumerate() {
            let level_targets: Vec<String> = level
                .iter()
                .filter(|t| targets.contains(t))
                .cloned()
                .collect();
            if level_targets.is_empty() {
                continue;
            }
            debug!(level = level_idx, targets = ?level_targets, "processing merge level");

            let mut futures = Vec::new();
            for target_name in level_targets {
                if is_cancelled(&opts.shutdown) {
                    results.push(cancelled_result(&target_name, "merge"));
                    last_err = Some(anyhow!("operation cancelled"));
                    continue;
                }
                let semaphore = Arc::clone(&semaphore);
                let shutdown = opts.shutdown.clone();
                let dry_run = opts.dry_run;
                futures.push(async move {
                    let _permit = semaphore.acquire().await;
                    if is_cancelled(&shutdown) {
                        return (cancelled_result(&target_name, "merge"), None);
                    }
                    self.merge_target(&target_name, dry_run).await
                });
            }

            // barrier: the whole level finishes before the next one starts
            for (result, target_changes) in join_all(futures).await {
                if !result.success {
                    last_err = Some(anyhow!(result
                        .error
                        .clone()
                        .unwrap_or_else(|| "merge failed".to_string())));
                }
                if let Some(target_changes) = target_changes {
                    changes.push(target_changes);
                }
                results.push(result);
            }
            if last_err.is_some() && !opts.continue_on_error {
                return (results, changes, last_err);
            }
        }

        (results, changes, last_err)
    }

    /// Sync phase: every target in parallel under the sync semaphore.
    /// Inter-target order is irrelevant here, each target reads only its
    /// own merge-store path.
    async fn execute_sync_phase(
        &self,
        targets: &[String],
        opts: &Options,
        parallelism: usize,
    ) -> (
        Vec<TargetResult>,
        Vec<(String, Vec<SecretChange>)>,
        Option<anyhow::Error>,
    ) {
        let mut results = Vec::new();
        let mut changes = Vec::new();
        let mut last_err: Option<anyhow::Error> = None;

        let semaphore = Arc::new(Semaphore::new(parallelism.max(1)));
        let mut futures = Vec::new();

        for target_name in targets {
            if is_cancelled(&opts.shutdown) {
                results.push(cancelled_result(target_name, "sync"));
                last_err = Some(anyhow!("operation cancelled"));
                continue;
            }
            let semaphore = Arc::clone(&semaphore);
            let shutdown = opts.shutdown.clone();
            let target_name = target_name.clone();
            let dry_run = opts.dry_run;
            futures.push(async move {
                let _permit = semaphore.acquire().await;
                if is_cancelled(&shutdown) {
                    return (cancelled_result(&target_name, "sync"), None);
                }
                self.sync_target(&target_name, dry_run).await
            });
        }

        for (result, target_changes) in join_all(futures).await {
            if !result.success {
                last_err = Some(anyhow!(result
                    .error
                    .clone()
                    .unwrap_or_else(|| "sync failed".to_string())));
            }
            if let Some(target_changes) = target_changes {
                changes.push(target_changes);
            }
            results.push(result);
        }

        (results, changes, last_err)
    }

    /// Resolves the merge-store path for a target.
    fn merge_path(&self, target_name: &str) -> Result<String> {
        if let Some(vault) = &self.config.merge_store.vault {
            return Ok(format!("{}/{target_name}", vault.mount));
        }
        if let Some(s3) = &self.s3_store {
            return Ok(s3.get_merge_path(target_name));
        }
        bail!("no merge store configured")
    }

    /// Merges a single target's imports, in declaration order.
    async fn merge_target(
        &self,
        target_name: &str,
        dry_run: bool,
    ) -> (TargetResult, Option<(String, Vec<SecretChange>)>) {
        let start = Instant::now();
        let fail = |error: String, details: ResultDetails| TargetResult {
            target: target_name.to_string(),
            phase: "merge".to_string(),
            success: false,
            error: Some(error),
            duration: start.elapsed(),
            details,
        };

        let Some(target) = self.config.targets.get(target_name) else {
            return (fail("target not found".to_string(), Default::default()), None);
        };
        let merge_path = match self.merge_path(target_name) {
            Ok(path) => path,
            Err(e) => return (fail(e.to_string(), Default::default()), None),
        };
        info!(target = target_name, merge_path = %merge_path, "starting merge");

        let mut source_paths = Vec::new();
        let mut failed_imports = Vec::new();
        let mut last_err: Option<String> = None;
        let mut success_count = 0;
        let mut changes: Vec<SecretChange> = Vec::new();

        if self.config.merge_store.vault.is_some() {
            for import_name in &target.imports {
                let source_path = self.config.get_source_path(import_name);
                source_paths.push(source_path.clone());
                debug!(import = %import_name, source_path = %source_path, "processing import");

                let spec = self.create_merge_sync(
                    import_name,
                    target_name,
                    &source_path,
                    &merge_path,
                    dry_run,
                );

                if let Err(e) = self.registry.add_sync_config(spec.clone()).await {
                    warn!(import = %import_name, error = %e, "failed to add sync config");
                    failed_imports.push(import_name.clone());
                    last_err = Some(e.to_string());
                    continue;
                }

                match self.registry.trigger_spec(spec).await {
                    Ok(outcome) => {
                        success_count += outcome.secrets_processed;
                        changes.extend(outcome.changes);
                    }
                    Err(e) => {
                        warn!(import = %import_name, error = %e, "failed to trigger merge");
                        failed_imports.push(import_name.clone());
                        last_err = Some(e.to_string());
                    }
                }
            }
        } else if self.s3_store.is_some() {
            match self.merge_target_s3(target_name, target, dry_run).await {
                Ok((paths, processed, s3_changes)) => {
                    source_paths = paths;
                    success_count = processed;
                    changes = s3_changes;
                }
                Err(e) => {
                    last_err = Some(e.to_string());
                    failed_imports = target.imports.clone();
                }
            }
        }

        let success = last_err.is_none();
        info!(
            target = target_name,
            duration = ?start.elapsed(),
            success,
            failed_imports = ?failed_imports,
            "merge completed"
        );

        let result = TargetResult {
            target: target_name.to_string(),
            phase: "merge".to_string(),
            success,
            error: last_err,
            duration: start.elapsed(),
            details: ResultDetails {
                source_paths,
                destination_path: merge_path,
                role_arn: String::new(),
                failed_imports,
                secrets_processed: success_count,
            },
        };
        (result, Some((target_name.to_string(), changes)))
    }

    /// S3 merge path: read every import's secrets in declaration order,
    /// deep-merge per secret name, and materialize the merged payloads at
    /// the canonical `<target>/<secret>.json` keys.
    async fn merge_target_s3(
        &self,
        target_name: &str,
        target: &Target,
        dry_run: bool,
    ) -> Result<(Vec<String>, usize, Vec<SecretChange>)> {
        let s3 = self.s3_store.as_ref().expect("s3 merge store configured");

        let mut source_paths = Vec::new();
        let mut merged: std::collections::BTreeMap<String, serde_json::Map<String, serde_json::Value>> =
            Default::default();

        for import_name in &target.imports {
            let source_path = self.config.get_source_path(import_name);
            source_paths.push(source_path.clone());

            // inherited targets read from the merge store; sources from vault
            if self.config.targets.contains_key(import_name) {
                for secret_name in s3.list_secrets(import_name).await? {
                    let payload = s3.read_secret(import_name, &secret_name).await?;
                    let base = merged.remove(&secret_name).unwrap_or_default();
                    merged.insert(secret_name, deep_merge(base, &payload));
                }
                continue;
            }

            let mut source = VaultStore {
                address: self.config.vault.address.clone(),
                namespace: self.config.vault.namespace.clone(),
                path: source_path.clone(),
                ..Default::default()
            };
            let defaults = self.registry.store_defaults().await;
            if let Some(d) = &defaults.vault {
                source.set_defaults(d);
            }
            source.init().await?;

            for secret_name in source.list_secrets(&source_path).await? {
                let raw = source
                    .get_secret(&format!("{source_path}/{secret_name}"))
                    .await?;
                let payload: serde_json::Map<String, serde_json::Value> =
                    serde_json::from_slice(&raw)?;
                let base = merged.remove(&secret_name).unwrap_or_default();
                merged.insert(secret_name, deep_merge(base, &payload));
            }
        }

        let mut changes = Vec::new();
        let mut processed = 0;
        for (secret_name, payload) in &merged {
            let existing = match s3.read_secret(target_name, secret_name).await {
                Ok(existing) => Some(serde_json::to_vec(&serde_json::Value::Object(
                    existing,
                ))?),
                Err(crate::store::StoreError::NotFound(_)) => None,
                Err(e) => return Err(e.into()),
            };
            let desired = serde_json::to_vec(&serde_json::Value::Object(payload.clone()))?;
            changes.push(crate::sync::job::change_for_secret(
                secret_name,
                existing.as_deref(),
                &desired,
            ));

            if !dry_run {
                s3.write_secret(target_name, secret_name, payload).await?;
            }
            processed += 1;
        }

        Ok((source_paths, processed, changes))
    }

    /// Syncs a single target's merged secrets to its destination account.
    async fn sync_target(
        &self,
        target_name: &str,
        dry_run: bool,
    ) -> (TargetResult, Option<(String, Vec<SecretChange>)>) {
        let start = Instant::now();
        let fail = |error: String, details: ResultDetails| TargetResult {
            target: target_name.to_string(),
            phase: "sync".to_string(),
            success: false,
            error: Some(error),
            duration: start.elapsed(),
            details,
        };

        let Some(target) = self.config.targets.get(target_name) else {
            return (fail("target not found".to_string(), Default::default()), None);
        };

        let role_arn = self.resolve_role_arn(target);
        let source_path = match self.merge_path(target_name) {
            Ok(path) => path,
            Err(e) => return (fail(e.to_string(), Default::default()), None),
        };
        let region = if target.region.is_empty() {
            self.config.aws.region.clone()
        } else {
            target.region.clone()
        };

        info!(
            target = target_name,
            account_id = %target.account_id,
            source_path = %source_path,
            region = %region,
            "starting sync to AWS"
        );

        let details = ResultDetails {
            source_paths: vec![source_path.clone()],
            destination_path: format!("aws:{}", target.account_id),
            role_arn: role_arn.clone(),
            failed_imports: Vec::new(),
            secrets_processed: 0,
        };

        let outcome = if self.s3_store.is_some() {
            self.sync_target_from_s3(target_name, target, &role_arn, &region, dry_run)
                .await
        } else {
            let spec =
                self.create_aws_sync(target_name, target, &source_path, &role_arn, &region, dry_run);
            match self.registry.add_sync_config(spec.clone()).await {
                Ok(()) => self
                    .registry
                    .trigger_spec(spec)
                    .await
                    .map(|o| (o.secrets_processed, o.changes))
                    .map_err(|e| anyhow!(e)),
                Err(e) => Err(anyhow!("failed to add sync config: {e}")),
            }
        };

        match outcome {
            Ok((processed, changes)) => {
                info!(target = target_name, duration = ?start.elapsed(), "sync completed");
                let result = TargetResult {
                    target: target_name.to_string(),
                    phase: "sync".to_string(),
                    success: true,
                    error: None,
                    duration: start.elapsed(),
                    details: ResultDetails {
                        secrets_processed: processed,
                        ..details
                    },
                };
                (result, Some((target_name.to_string(), changes)))
            }
            Err(e) => (fail(e.to_string(), details), None),
        }
    }

    /// S3 merge store sync: read the materialized payloads and write them
    /// through the AWS driver directly.
    async fn sync_target_from_s3(
        &self,
        target_name: &str,
        target: &Target,
        role_arn: &str,
        region: &str,
        dry_run: bool,
    ) -> Result<(usize, Vec<SecretChange>)> {
        let s3 = self.s3_store.as_ref().expect("s3 merge store configured");

        let mut dest = AwsSecretsStore {
            account_id: target.account_id.clone(),
            region: region.to_string(),
            role_arn: role_arn.to_string(),
            prefix: target.secret_prefix.clone(),
            ..Default::default()
        };
        if let Some(ctx) = &self.aws_ctx {
            if !role_arn.is_empty() {
                dest.with_sdk_config(ctx.assume_role_arn(role_arn).await?);
            }
        }
        dest.init().await?;

        let mut changes = Vec::new();
        let mut processed = 0;
        let names = s3.list_secrets(target_name).await?;
        for secret_name in &names {
            let payload = s3.read_secret(target_name, secret_name).await?;
            let desired = serde_json::to_vec(&serde_json::Value::Object(payload))?;

            let existing = match dest.get_secret(secret_name).await {
                Ok(existing) => Some(existing),
                Err(crate::store::StoreError::NotFound(_)) => None,
                Err(e) => return Err(e.into()),
            };
            changes.push(crate::sync::job::change_for_secret(
                secret_name,
                existing.as_deref(),
                &desired,
            ));

            if !dry_run {
                dest.write_secret(secret_name, &desired).await?;
            }
            processed += 1;
        }

        if self.config.pipeline.sync.delete_orphans {
            let current = dest.list_secrets("").await?;
            for orphan in current {
                if names.contains(&orphan) {
                    continue;
                }
                changes.push(SecretChange {
                    path: orphan.clone(),
                    change_type: crate::diff::ChangeType::Removed,
                    target: None,
                    keys_added: Vec::new(),
                    keys_removed: Vec::new(),
                    keys_modified: Vec::new(),
                    current_keys: Vec::new(),
                    desired_keys: Vec::new(),
                });
                if !dry_run {
                    dest.delete_secret(&orphan).await?;
                }
            }
        }

        Ok((processed, changes))
    }

    /// Role ARN resolution ladder: the target's explicit role, then custom
    /// role pattern, then Control Tower execution role, then the
    /// organizational access role. With a live execution context the
    /// same-account case resolves to no role at all; without one the
    /// config applies the identical ladder.
    fn resolve_role_arn(&self, target: &Target) -> String {
        if !target.role_arn.is_empty() {
            return target.role_arn.clone();
        }
        if let Some(ctx) = &self.aws_ctx {
            return ctx.get_role_arn(&target.account_id).unwrap_or_default();
        }
        self.config.get_role_arn(&target.account_id)
    }

    /// Builds the merge-phase sync spec for one import.
    fn create_merge_sync(
        &self,
        import_name: &str,
        target_name: &str,
        source_path: &str,
        merge_path: &str,
        dry_run: bool,
    ) -> SyncSpec {
        SyncSpec {
            name: format!("merge-{import_name}-to-{target_name}"),
            namespace: "pipeline".to_string(),
            dry_run: Some(dry_run),
            sync_delete: Some(false),
            source: Some(VaultStore {
                address: self.config.vault.address.clone(),
                namespace: self.config.vault.namespace.clone(),
                path: format!("{source_path}/(.*)"),
                ..Default::default()
            }),
            dest: vec![StoreConfig {
                vault: Some(VaultStore {
                    address: self.config.vault.address.clone(),
                    namespace: self.config.vault.namespace.clone(),
                    path: format!("{merge_path}/$1"),
                    merge: true,
                    ..Default::default()
                }),
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    /// Builds the sync-phase spec for one target.
    fn create_aws_sync(
        &self,
        target_name: &str,
        target: &Target,
        source_path: &str,
        role_arn: &str,
        region: &str,
        dry_run: bool,
    ) -> SyncSpec {
        SyncSpec {
            name: format!("sync-{target_name}"),
            namespace: "pipeline".to_string(),
            dry_run: Some(dry_run),
            sync_delete: Some(self.config.pipeline.sync.delete_orphans),
            source: Some(VaultStore {
                address: self.config.vault.address.clone(),
                namespace: self.config.vault.namespace.clone(),
                path: format!("{source_path}/(.*)"),
                ..Default::default()
            }),
            dest: vec![StoreConfig {
                aws: Some(AwsSecretsStore {
                    account_id: target.account_id.clone(),
                    name: "$1".to_string(),
                    region: region.to_string(),
                    role_arn: role_arn.to_string(),
                    prefix: target.secret_prefix.clone(),
                    ..Default::default()
                }),
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    /// Materializes the sync specs a run would trigger, without executing
    /// them. Useful for GitOps flows. Vault merge store only; the S3 path
    /// performs its merge inline.
    pub fn generate_configs(&self, opts: &Options) -> Vec<SyncSpec> {
        let mut specs = Vec::new();

        if self.config.merge_store.vault.is_none() {
            warn!("generate_configs only supports the vault merge store; S3 merges run inline");
            return specs;
        }

        let targets = self.resolve_targets(&opts.targets);

        if matches!(opts.operation, Operation::Merge | Operation::Pipeline) {
            for target_name in &targets {
                let Some(target) = self.config.targets.get(target_name) else {
                    continue;
                };
                let merge_path = self
                    .merge_path(target_name)
                    .expect("vault merge store checked above");
                for import_name in &target.imports {
                    let source_path = self.config.get_source_path(import_name);
                    specs.push(self.create_merge_sync(
                        import_name,
                        target_name,
                        &source_path,
                        &merge_path,
                        opts.dry_run,
                    ));
                }
            }
        }

        if matches!(opts.operation, Operation::Sync | Operation::Pipeline) {
            for target_name in &targets {
                let Some(target) = self.config.targets.get(target_name) else {
                    continue;
                };
                let source_path = self
                    .merge_path(target_name)
                    .expect("vault merge store checked above");
                let role_arn = self.resolve_role_arn(target);
                let region = if target.region.is_empty() {
                    self.config.aws.region.clone()
                } else {
                    target.region.clone()
                };
                specs.push(self.create_aws_sync(
                    target_name,
                    target,
                    &source_path,
                    &role_arn,
                    &region,
                    opts.dry_run,
                ));
            }
        }

        specs
    }
}

fn is_cancelled(shutdown: &Option<watch::Receiver<bool>>) -> bool {
    shutdown.as_ref().is_some_and(|rx| *rx.borrow())
}

fn cancelled_result(target: &str, phase: &str) -> TargetResult {
    TargetResult {
        target: target.to_string(),
        phase: phase.to_string(),
        success: false,
        error: Some("operation cancelled".to_string()),
        duration: Duration::ZERO,
        details: Default::default(),
    }
}

fn absorb_changes(diffs: &mut Vec<TargetDiff>, new: Vec<(String, Vec<SecretChange>)>) {
    for (target, changes) in new {
        if let Some(existing) = diffs.iter_mut().find(|d| d.target == target) {
            let mut combined = existing.changes.clone();
            combined.extend(changes);
            *existing = TargetDiff::new(target, combined);
        } else {
            diffs.push(TargetDiff::new(target, changes));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::{ChangeType, SecretChange};

    fn chain_pipeline() -> Pipeline {
        let yaml = r#"
vault:
  address: https://vault.example.com
sources:
  analytics:
    vault:
      mount: analytics
  analytics-engineers:
    vault:
      mount: analytics-engineers
merge_store:
  vault:
    mount: merged
targets:
  Stg:
    account_id: "111111111111"
    imports: [analytics, analytics-engineers]
  Prod:
    account_id: "222222222222"
    imports: [Stg]
  Demo:
    account_id: "333333333333"
    imports: [Prod]
aws:
  control_tower:
    enabled: true
"#;
        Pipeline::new(Config::from_yaml(yaml).unwrap()).unwrap()
    }

    #[test]
    fn resolve_targets_defaults_to_topological_order() {
        let pipeline = chain_pipeline();
        assert_eq!(pipeline.resolve_targets(&[]), vec!["Stg", "Prod", "Demo"]);
        assert_eq!(
            pipeline.resolve_targets(&["Demo".to_string()]),
            vec!["Stg", "Prod", "Demo"]
        );
    }

    #[test]
    fn generated_merge_specs_follow_declaration_order() {
        let pipeline = chain_pipeline();
        let specs = pipeline.generate_configs(&Options {
            operation: Operation::Merge,
            targets: vec!["Stg".to_string()],
            ..Default::default()
        });

        let names: Vec<&str> = specs.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["merge-analytics-to-Stg", "merge-analytics-engineers-to-Stg"]
        );
        // source path carries the capture, dest the template
        let source = specs[0].source.as_ref().unwrap();
        assert_eq!(source.path, "analytics/(.*)");
        let dest = specs[0].dest[0].vault.as_ref().unwrap();
        assert_eq!(dest.path, "merged/Stg/$1");
        assert!(dest.merge);
    }

    #[test]
    fn generated_sync_specs_resolve_inherited_paths_and_roles() {
        let pipeline = chain_pipeline();
        let specs = pipeline.generate_configs(&Options {
            operation: Operation::Pipeline,
            ..Default::default()
        });

        // inherited target Prod reads Stg from the merge store
        let prod_merge = specs
            .iter()
            .find(|s| s.name == "merge-Stg-to-Prod")
            .unwrap();
        assert_eq!(
            prod_merge.source.as_ref().unwrap().path,
            "merged/Stg/(.*)"
        );

        let sync_stg = specs.iter().find(|s| s.name == "sync-Stg").unwrap();
        let aws = sync_stg.dest[0].aws.as_ref().unwrap();
        assert_eq!(aws.account_id, "111111111111");
        assert_eq!(
            aws.role_arn,
            "arn:aws:iam::111111111111:role/AWSControlTowerExecution"
        );
        assert_eq!(aws.region, "us-east-1");
        assert_eq!(sync_stg.source.as_ref().unwrap().path, "merged/Stg/(.*)");
    }

    #[test]
    fn role_resolution_without_context_follows_the_ladder() {
        // two targets share an account; only one declares a role
        let yaml = r#"
vault:
  address: https://vault.example.com
sources:
  analytics:
    vault:
      mount: analytics
merge_store:
  vault:
    mount: merged
targets:
  Special:
    account_id: "123456789012"
    imports: [analytics]
    role_arn: arn:aws:iam::123456789012:role/SpecialRole
  Plain:
    account_id: "123456789012"
    imports: [analytics]
"#;
        let pipeline = Pipeline::new(Config::from_yaml(yaml).unwrap()).unwrap();
        let specs = pipeline.generate_configs(&Options {
            operation: Operation::Sync,
            ..Default::default()
        });

        let role_of = |name: &str| {
            specs
                .iter()
                .find(|s| s.name == name)
                .unwrap()
                .dest[0]
                .aws
                .as_ref()
                .unwrap()
                .role_arn
                .clone()
        };

        // the explicit role applies only to the target that declares it
        assert_eq!(
            role_of("sync-Special"),
            "arn:aws:iam::123456789012:role/SpecialRole"
        );
        // no custom pattern, no control tower: organizational access role
        assert_eq!(
            role_of("sync-Plain"),
            "arn:aws:iam::123456789012:role/OrganizationAccountAccessRole"
        );

        // a custom pattern outranks control tower for undeclared targets
        let mut config = Config::from_yaml(yaml).unwrap();
        config.aws.execution_context.custom_role_pattern =
            "arn:aws:iam::{{.AccountID}}:role/SecretsHub".to_string();
        config.aws.control_tower.enabled = true;
        let pipeline = Pipeline::new(config).unwrap();
        let specs = pipeline.generate_configs(&Options {
            operation: Operation::Sync,
            ..Default::default()
        });
        let plain = specs.iter().find(|s| s.name == "sync-Plain").unwrap();
        assert_eq!(
            plain.dest[0].aws.as_ref().unwrap().role_arn,
            "arn:aws:iam::123456789012:role/SecretsHub"
        );
    }

    #[test]
    fn exit_code_prefers_run_failures() {
        let pipeline = chain_pipeline();
        assert_eq!(pipeline.exit_code(), 0);

        pipeline.finish_run(
            &[TargetResult {
                target: "Stg".to_string(),
                phase: "sync".to_string(),
                success: true,
                error: None,
                duration: Duration::ZERO,
                details: Default::default(),
            }],
            true,
            vec![TargetDiff::new(
                "Stg",
                vec![SecretChange {
                    path: "db".to_string(),
                    change_type: ChangeType::Added,
                    target: None,
                    keys_added: Vec::new(),
                    keys_removed: Vec::new(),
                    keys_modified: Vec::new(),
                    current_keys: Vec::new(),
                    desired_keys: Vec::new(),
                }],
            )],
            true,
        );
        // changes detected, no failures
        assert_eq!(pipeline.exit_code(), 1);

        pipeline.finish_run(
            &[TargetResult {
                target: "Stg".to_string(),
                phase: "sync".to_string(),
                success: false,
                error: Some("boom".to_string()),
                duration: Duration::ZERO,
                details: Default::default(),
            }],
            false,
            Vec::new(),
            false,
        );
        assert_eq!(pipeline.exit_code(), 2);
    }

    #[test]
    fn change_aggregation_merges_per_target() {
        let mut diffs = Vec::new();
        let change = |path: &str, kind: ChangeType| SecretChange {
            path: path.to_string(),
            change_type: kind,
            target: None,
            keys_added: Vec::new(),
            keys_removed: Vec::new(),
            keys_modified: Vec::new(),
            current_keys: Vec::new(),
            desired_keys: Vec::new(),
        };

        absorb_changes(
            &mut diffs,
            vec![("Stg".to_string(), vec![change("a", ChangeType::Added)])],
        );
        absorb_changes(
            &mut diffs,
            vec![("Stg".to_string(), vec![change("b", ChangeType::Unchanged)])],
        );

        assert_eq!(diffs.len(), 1);
        assert_eq!(diffs[0].changes.len(), 2);
        assert_eq!(diffs[0].summary.added, 1);
        assert_eq!(diffs[0].summary.unchanged, 1);
    }
}
