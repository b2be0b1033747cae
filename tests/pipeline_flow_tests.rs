//! # Pipeline Flow Tests
//!
//! End-to-end tests over the public API: configuration loading, graph
//! construction, sync-spec generation and diff reporting. Everything here
//! runs without network access.

use secret_sync_pipeline::config::{Config, ConfigError};
use secret_sync_pipeline::diff::{
    compute_summary, diff_secrets, format_diff, ChangeType, OutputFormat, PipelineDiff,
    SecretChange, TargetDiff,
};
use secret_sync_pipeline::graph::Graph;
use secret_sync_pipeline::merge::deep_merge;
use secret_sync_pipeline::pipeline::{Operation, Options, Pipeline};
use serde_json::json;

const CHAIN_CONFIG: &str = r#"
log:
  level: info

vault:
  address: https://vault.example.com
  namespace: eng/data-platform

aws:
  region: us-east-1
  control_tower:
    enabled: true
    execution_role:
      name: AWSControlTowerExecution

sources:
  analytics:
    vault:
      mount: analytics
  analytics-engineers:
    vault:
      mount: analytics-engineers

merge_store:
  vault:
    mount: merged-secrets

targets:
  Stg:
    account_id: "111111111111"
    imports:
      - analytics
      - analytics-engineers
  Prod:
    account_id: "222222222222"
    imports:
      - Stg
  Demo:
    account_id: "333333333333"
    imports:
      - Prod

pipeline:
  merge:
    parallel: 4
  sync:
    parallel: 4
"#;

#[test]
fn inheritance_chain_orders_and_levels() {
    let config = Config::from_yaml(CHAIN_CONFIG).unwrap();
    config.validate().unwrap();

    let graph = Graph::build(&config).unwrap();
    assert_eq!(graph.topological_order(), vec!["Stg", "Prod", "Demo"]);
    assert_eq!(
        graph.include_dependencies(&["Demo".to_string()]),
        vec!["Stg", "Prod", "Demo"]
    );

    let levels = graph.group_by_level();
    assert_eq!(levels[1], vec!["Stg"]);
    assert_eq!(levels[2], vec!["Prod"]);
    assert_eq!(levels[3], vec!["Demo"]);
}

#[test]
fn two_import_merge_produces_expected_payload() {
    let analytics = match json!({
        "DD": "dd_xxx",
        "common": {"region": "us-east-1"},
        "tags": ["analytics"],
    }) {
        serde_json::Value::Object(m) => m,
        _ => unreachable!(),
    };
    let engineers = match json!({
        "STRIPE": "sk_xxx",
        "common": {"env": "prod"},
        "tags": ["engineers"],
    }) {
        serde_json::Value::Object(m) => m,
        _ => unreachable!(),
    };

    let merged = deep_merge(analytics, &engineers);
    assert_eq!(
        serde_json::Value::Object(merged),
        json!({
            "DD": "dd_xxx",
            "STRIPE": "sk_xxx",
            "common": {"region": "us-east-1", "env": "prod"},
            "tags": ["analytics", "engineers"],
        })
    );
}

#[test]
fn shorthand_target_requires_account_id() {
    let yaml = r#"
vault:
  address: https://vault.example.com
merge_store:
  vault:
    mount: merged
targets:
  Serverless_Stg:
    account_id: "111111111111"
  Serverless_Prod: [Serverless_Stg]
"#;
    let config = Config::from_yaml(yaml).unwrap();
    assert_eq!(
        config.targets["Serverless_Prod"].imports,
        vec!["Serverless_Stg"]
    );
    assert!(config.targets["Serverless_Prod"].account_id.is_empty());

    let err = config.validate().unwrap_err();
    assert!(matches!(err, ConfigError::MissingAccountId { .. }));
}

#[test]
fn generated_specs_cover_merge_and_sync() {
    let config = Config::from_yaml(CHAIN_CONFIG).unwrap();
    let pipeline = Pipeline::new(config).unwrap();

    let specs = pipeline.generate_configs(&Options {
        operation: Operation::Pipeline,
        ..Default::default()
    });

    // one merge spec per import plus one sync spec per target
    let merge_count = specs.iter().filter(|s| s.name.starts_with("merge-")).count();
    let sync_count = specs.iter().filter(|s| s.name.starts_with("sync-")).count();
    assert_eq!(merge_count, 4);
    assert_eq!(sync_count, 3);

    // inherited imports read from the merge store
    let demo_merge = specs.iter().find(|s| s.name == "merge-Prod-to-Demo").unwrap();
    assert_eq!(
        demo_merge.source.as_ref().unwrap().path,
        "merged-secrets/Prod/(.*)"
    );
    assert_eq!(
        demo_merge.dest[0].vault.as_ref().unwrap().path,
        "merged-secrets/Demo/$1"
    );

    // sync specs carry the control-tower role
    let sync_demo = specs.iter().find(|s| s.name == "sync-Demo").unwrap();
    assert_eq!(
        sync_demo.dest[0].aws.as_ref().unwrap().role_arn,
        "arn:aws:iam::333333333333:role/AWSControlTowerExecution"
    );
    assert!(sync_demo.namespace == "pipeline");
}

#[test]
fn zero_sum_dry_run_reports_exit_code_zero() {
    // a dry run whose desired state matches the destination: every secret
    // classifies as unchanged and the compact output says so
    let current = match json!({
        "db": {"user": "svc", "password": "hunter2"},
        "stripe": {"key": "sk_xxx"},
    }) {
        serde_json::Value::Object(m) => m,
        _ => unreachable!(),
    };

    let changes = diff_secrets(&current, &current.clone());
    let summary = compute_summary(&changes);
    assert!(summary.is_zero_sum());

    let mut diff = PipelineDiff {
        dry_run: true,
        ..Default::default()
    };
    diff.add_target_diff(TargetDiff::new("Stg", changes));

    assert_eq!(diff.exit_code(), 0);
    assert_eq!(
        format_diff(&diff, OutputFormat::Compact),
        "ZERO-SUM: 2 secrets unchanged"
    );
}

#[test]
fn drifted_state_reports_changes_in_every_format() {
    let current = match json!({"db": {"user": "svc"}}) {
        serde_json::Value::Object(m) => m,
        _ => unreachable!(),
    };
    let desired = match json!({"db": {"user": "svc", "port": 5432}, "api": {"key": "k"}}) {
        serde_json::Value::Object(m) => m,
        _ => unreachable!(),
    };

    let changes = diff_secrets(&current, &desired);
    let mut diff = PipelineDiff::default();
    diff.add_target_diff(TargetDiff::new("Prod", changes));

    assert_eq!(diff.exit_code(), 1);
    assert_eq!(diff.summary.added, 1);
    assert_eq!(diff.summary.modified, 1);

    let compact = format_diff(&diff, OutputFormat::Compact);
    assert_eq!(compact, "CHANGES: +1 -0 ~1 =0 (total: 2)");

    let github = format_diff(&diff, OutputFormat::Github);
    assert!(github.contains("::set-output name=zero_sum::false"));
    assert!(github.contains("::group::Target: Prod (2 changes)"));

    let human = format_diff(&diff, OutputFormat::Human);
    assert!(human.contains("CHANGES DETECTED"));
    assert!(human.contains("~ db (modified)"));

    let json_out = format_diff(&diff, OutputFormat::Json);
    let parsed: PipelineDiff = serde_json::from_str(&json_out).unwrap();
    assert_eq!(parsed.summary.total, 2);
}

#[test]
fn diff_totality_over_random_shapes() {
    let current = match json!({
        "a": {"k": 1},
        "b": [1, 2, 3],
        "c": "scalar",
        "d": {"x": true},
    }) {
        serde_json::Value::Object(m) => m,
        _ => unreachable!(),
    };
    let desired = match json!({
        "a": {"k": 1},
        "b": [1, 2],
        "d": {"x": false},
        "e": null,
    }) {
        serde_json::Value::Object(m) => m,
        _ => unreachable!(),
    };

    let changes = diff_secrets(&current, &desired);
    let summary = compute_summary(&changes);

    // one record for every path in the union
    assert_eq!(summary.total, 5);
    assert_eq!(
        summary.added + summary.removed + summary.modified + summary.unchanged,
        summary.total
    );

    // every path appears exactly once
    let mut paths: Vec<&str> = changes.iter().map(|c| c.path.as_str()).collect();
    paths.dedup();
    assert_eq!(paths.len(), 5);
}

#[test]
fn removed_orphans_surface_in_target_diff() {
    let changes = vec![SecretChange {
        path: "stale/secret".to_string(),
        change_type: ChangeType::Removed,
        target: None,
        keys_added: Vec::new(),
        keys_removed: Vec::new(),
        keys_modified: Vec::new(),
        current_keys: vec!["key".to_string()],
        desired_keys: Vec::new(),
    }];
    let td = TargetDiff::new("Stg", changes);
    assert_eq!(td.summary.removed, 1);
    assert!(td.summary.has_changes());
}
