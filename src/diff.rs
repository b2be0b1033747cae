//! # Diff Engine
//!
//! Change detection and reporting for secrets synchronization. Powers
//! dry-run validation, zero-sum migration verification and CI/CD-friendly
//! output formats.

use std::collections::HashSet;
use std::fmt::Write as _;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::merge::deep_equal;

/// Kind of change detected for a single secret path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    Added,
    Removed,
    Modified,
    Unchanged,
}

/// A change to a single secret. Values are never recorded, only key names.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretChange {
    pub path: String,
    pub change_type: ChangeType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,

    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub keys_added: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub keys_removed: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub keys_modified: Vec<String>,

    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub current_keys: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub desired_keys: Vec<String>,
}

impl SecretChange {
    fn new(path: &str, change_type: ChangeType) -> Self {
        Self {
            path: path.to_string(),
            change_type,
            target: None,
            keys_added: Vec::new(),
            keys_removed: Vec::new(),
            keys_modified: Vec::new(),
            current_keys: Vec::new(),
            desired_keys: Vec::new(),
        }
    }
}

/// Tallies over a set of changes.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ChangeSummary {
    pub added: usize,
    pub removed: usize,
    pub modified: usize,
    pub unchanged: usize,
    pub total: usize,
}

impl ChangeSummary {
    /// True when added, removed and modified are all zero.
    pub fn is_zero_sum(&self) -> bool {
        self.added == 0 && self.removed == 0 && self.modified == 0
    }

    pub fn has_changes(&self) -> bool {
        !self.is_zero_sum()
    }

    fn absorb(&mut self, other: &ChangeSummary) {
        self.added += other.added;
        self.removed += other.removed;
        self.modified += other.modified;
        self.unchanged += other.unchanged;
        self.total += other.total;
    }
}

/// All changes for one target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetDiff {
    pub target: String,
    pub changes: Vec<SecretChange>,
    pub summary: ChangeSummary,
}

impl TargetDiff {
    pub fn new(target: impl Into<String>, changes: Vec<SecretChange>) -> Self {
        let summary = compute_summary(&changes);
        Self {
            target: target.into(),
            changes,
            summary,
        }
    }
}

/// The complete diff for a pipeline run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineDiff {
    pub targets: Vec<TargetDiff>,
    pub summary: ChangeSummary,
    pub dry_run: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_path: Option<String>,
}

impl PipelineDiff {
    pub fn is_zero_sum(&self) -> bool {
        self.summary.is_zero_sum()
    }

    /// Exit code for CI/CD: 0 when zero-sum, 1 when changes were detected.
    /// Run errors map to 2 and are set by the caller.
    pub fn exit_code(&self) -> i32 {
        if self.is_zero_sum() {
            0
        } else {
            1
        }
    }

    /// Appends a target diff and folds its summary into the pipeline total.
    pub fn add_target_diff(&mut self, td: TargetDiff) {
        self.summary.absorb(&td.summary);
        self.targets.push(td);
    }
}

/// Compares current and desired secret maps and returns one change record
/// per path, sorted by path.
pub fn diff_secrets(
    current: &serde_json::Map<String, Value>,
    desired: &serde_json::Map<String, Value>,
) -> Vec<SecretChange> {
    let mut changes = Vec::new();
    let mut seen: HashSet<&str> = HashSet::new();

    for (path, desired_val) in desired {
        seen.insert(path.as_str());
        match current.get(path) {
            None => {
                let mut change = SecretChange::new(path, ChangeType::Added);
                change.desired_keys = map_keys(desired_val);
                changes.push(change);
            }
            Some(current_val) if deep_equal(current_val, desired_val) => {
                let mut change = SecretChange::new(path, ChangeType::Unchanged);
                change.current_keys = map_keys(current_val);
                change.desired_keys = map_keys(desired_val);
                changes.push(change);
            }
            Some(current_val) => {
                let mut change = SecretChange::new(path, ChangeType::Modified);
                change.current_keys = map_keys(current_val);
                change.desired_keys = map_keys(desired_val);
                let (added, removed, modified) = diff_map_keys(current_val, desired_val);
                change.keys_added = added;
                change.keys_removed = removed;
                change.keys_modified = modified;
                changes.push(change);
            }
        }
    }

    for (path, current_val) in current {
        if !seen.contains(path.as_str()) {
            let mut change = SecretChange::new(path, ChangeType::Removed);
            change.current_keys = map_keys(current_val);
            changes.push(change);
        }
    }

    changes.sort_by(|a, b| a.path.cmp(&b.path));
    changes
}

/// Tallies changes into a summary.
pub fn compute_summary(changes: &[SecretChange]) -> ChangeSummary {
    let mut summary = ChangeSummary::default();
    for change in changes {
        match change.change_type {
            ChangeType::Added => summary.added += 1,
            ChangeType::Removed => summary.removed += 1,
            ChangeType::Modified => summary.modified += 1,
            ChangeType::Unchanged => summary.unchanged += 1,
        }
        summary.total += 1;
    }
    summary
}

fn map_keys(value: &Value) -> Vec<String> {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<String> = map.keys().cloned().collect();
            keys.sort();
            keys
        }
        _ => Vec::new(),
    }
}

/// Key-level diff of two secret values. When either side is not a map the
/// whole value counts as modified, marked with the `<value>` sentinel.
fn diff_map_keys(current: &Value, desired: &Value) -> (Vec<String>, Vec<String>, Vec<String>) {
    let (Value::Object(current_map), Value::Object(desired_map)) = (current, desired) else {
        return (Vec::new(), Vec::new(), vec!["<value>".to_string()]);
    };

    let mut added = Vec::new();
    let mut removed = Vec::new();
    let mut modified = Vec::new();

    for (key, desired_val) in desired_map {
        match current_map.get(key) {
            None => added.push(key.clone()),
            Some(current_val) if !deep_equal(current_val, desired_val) => {
                modified.push(key.clone())
            }
            Some(_) => {}
        }
    }
    for key in current_map.keys() {
        if !desired_map.contains_key(key) {
            removed.push(key.clone());
        }
    }

    added.sort();
    removed.sort();
    modified.sort();
    (added, removed, modified)
}

/// Output format for diff reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    #[default]
    Human,
    Json,
    /// GitHub Actions annotations and workflow outputs.
    Github,
    /// One-line summary.
    Compact,
}

impl OutputFormat {
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "json" => OutputFormat::Json,
            "github" => OutputFormat::Github,
            "compact" => OutputFormat::Compact,
            _ => OutputFormat::Human,
        }
    }
}

/// Formats a pipeline diff in the requested format.
pub fn format_diff(diff: &PipelineDiff, format: OutputFormat) -> String {
    match format {
        OutputFormat::Json => format_json(diff),
        OutputFormat::Github => format_github(diff),
        OutputFormat::Compact => format_compact(diff),
        OutputFormat::Human => format_human(diff),
    }
}

fn format_json(diff: &PipelineDiff) -> String {
    serde_json::to_string_pretty(diff)
        .unwrap_or_else(|e| format!(r#"{{"error": "{e}"}}"#))
}

fn format_human(diff: &PipelineDiff) -> String {
    let mut out = String::new();

    if diff.dry_run {
        out.push_str("=== DRY RUN - No changes will be applied ===\n\n");
    }

    out.push_str("Pipeline Diff Summary\n");
    out.push_str("=====================\n");
    let _ = writeln!(out, "  Added:     {}", diff.summary.added);
    let _ = writeln!(out, "  Removed:   {}", diff.summary.removed);
    let _ = writeln!(out, "  Modified:  {}", diff.summary.modified);
    let _ = writeln!(out, "  Unchanged: {}", diff.summary.unchanged);
    let _ = writeln!(out, "  Total:     {}", diff.summary.total);
    out.push('\n');

    if diff.is_zero_sum() {
        out.push_str("✅ ZERO-SUM: No changes detected\n");
        return out;
    }

    out.push_str("⚠️  CHANGES DETECTED\n\n");

    for td in &diff.targets {
        if !td.summary.has_changes() {
            continue;
        }
        let _ = writeln!(out, "Target: {}", td.target);
        out.push_str(&"-".repeat(40));
        out.push('\n');

        for change in &td.changes {
            match change.change_type {
                ChangeType::Unchanged => {}
                ChangeType::Added => {
                    let _ = writeln!(out, "  + {} (new secret)", change.path);
                    if !change.desired_keys.is_empty() {
                        let _ = writeln!(out, "    keys: {:?}", change.desired_keys);
                    }
                }
                ChangeType::Removed => {
                    let _ = writeln!(out, "  - {} (removed)", change.path);
                }
                ChangeType::Modified => {
                    let _ = writeln!(out, "  ~ {} (modified)", change.path);
                    if !change.keys_added.is_empty() {
                        let _ = writeln!(out, "    + keys: {:?}", change.keys_added);
                    }
                    if !change.keys_removed.is_empty() {
                        let _ = writeln!(out, "    - keys: {:?}", change.keys_removed);
                    }
                    if !change.keys_modified.is_empty() {
                        let _ = writeln!(out, "    ~ keys: {:?}", change.keys_modified);
                    }
                }
            }
        }
        out.push('\n');
    }

    out
}

// The exact "::set-output name=" / "::notice::" / "::warning::" literals are
// load-bearing for downstream workflow steps.
fn format_github(diff: &PipelineDiff) -> String {
    let mut out = String::new();
    let changed = diff.summary.added + diff.summary.removed + diff.summary.modified;

    let _ = writeln!(out, "::set-output name=changes::{changed}");
    let _ = writeln!(out, "::set-output name=added::{}", diff.summary.added);
    let _ = writeln!(out, "::set-output name=removed::{}", diff.summary.removed);
    let _ = writeln!(out, "::set-output name=modified::{}", diff.summary.modified);
    let _ = writeln!(out, "::set-output name=unchanged::{}", diff.summary.unchanged);
    let _ = writeln!(out, "::set-output name=zero_sum::{}", diff.is_zero_sum());

    if diff.is_zero_sum() {
        out.push_str("::notice::✅ Zero-sum: No changes detected\n");
    } else {
        let _ = writeln!(
            out,
            "::warning::⚠️ {changed} changes detected ({} added, {} removed, {} modified)",
            diff.summary.added, diff.summary.removed, diff.summary.modified
        );
    }

    for td in &diff.targets {
        if !td.summary.has_changes() {
            continue;
        }
        let target_changes = td.summary.added + td.summary.removed + td.summary.modified;
        let _ = writeln!(out, "::group::Target: {} ({target_changes} changes)", td.target);
        for change in &td.changes {
            match change.change_type {
                ChangeType::Added => {
                    let _ = writeln!(out, "::notice::+ {} (new secret)", change.path);
                }
                ChangeType::Removed => {
                    let _ = writeln!(out, "::warning::- {} (removed)", change.path);
                }
                ChangeType::Modified => {
                    let _ = writeln!(out, "::notice::~ {} (modified)", change.path);
                }
                ChangeType::Unchanged => {}
            }
        }
        out.push_str("::endgroup::\n");
    }

    out
}

fn format_compact(diff: &PipelineDiff) -> String {
    if diff.is_zero_sum() {
        format!("ZERO-SUM: {} secrets unchanged", diff.summary.unchanged)
    } else {
        format!(
            "CHANGES: +{} -{} ~{} ={} (total: {})",
            diff.summary.added,
            diff.summary.removed,
            diff.summary.modified,
            diff.summary.unchanged,
            diff.summary.total
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn map(v: Value) -> serde_json::Map<String, Value> {
        match v {
            Value::Object(m) => m,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn diff_classifies_all_paths_exactly_once() {
        let current = map(json!({
            "kept": {"a": 1},
            "changed": {"a": 1, "b": 2},
            "gone": {"x": true},
        }));
        let desired = map(json!({
            "kept": {"a": 1},
            "changed": {"a": 1, "b": 3, "c": 4},
            "new": {"y": false},
        }));

        let changes = diff_secrets(&current, &desired);
        let summary = compute_summary(&changes);

        // totality: one record per path in the union
        assert_eq!(summary.total, 4);
        assert_eq!(
            summary.added + summary.removed + summary.modified + summary.unchanged,
            summary.total
        );
        assert_eq!(summary.added, 1);
        assert_eq!(summary.removed, 1);
        assert_eq!(summary.modified, 1);
        assert_eq!(summary.unchanged, 1);

        // output is path-sorted
        let paths: Vec<&str> = changes.iter().map(|c| c.path.as_str()).collect();
        assert_eq!(paths, vec!["changed", "gone", "kept", "new"]);
    }

    #[test]
    fn modified_records_key_level_changes() {
        let current = map(json!({"db": {"user": "a", "old": 1, "pw": "x"}}));
        let desired = map(json!({"db": {"user": "a", "pw": "y", "port": 5432}}));

        let changes = diff_secrets(&current, &desired);
        let change = &changes[0];
        assert_eq!(change.change_type, ChangeType::Modified);
        assert_eq!(change.keys_added, vec!["port"]);
        assert_eq!(change.keys_removed, vec!["old"]);
        assert_eq!(change.keys_modified, vec!["pw"]);
    }

    #[test]
    fn non_map_modification_uses_sentinel() {
        let current = map(json!({"raw": "string-value"}));
        let desired = map(json!({"raw": "other-value"}));
        let changes = diff_secrets(&current, &desired);
        assert_eq!(changes[0].keys_modified, vec!["<value>"]);
    }

    #[test]
    fn numeric_width_does_not_count_as_change() {
        let current = map(json!({"svc": {"port": 8080}}));
        let desired = map(json!({"svc": {"port": 8080.0}}));
        let changes = diff_secrets(&current, &desired);
        assert_eq!(changes[0].change_type, ChangeType::Unchanged);
    }

    #[test]
    fn zero_sum_equivalence() {
        let mut summary = ChangeSummary {
            unchanged: 7,
            total: 7,
            ..Default::default()
        };
        assert!(summary.is_zero_sum());
        summary.modified = 1;
        assert!(!summary.is_zero_sum());
    }

    #[test]
    fn exit_codes_map_from_zero_sum() {
        let mut diff = PipelineDiff::default();
        diff.add_target_diff(TargetDiff::new(
            "Stg",
            vec![SecretChange::new("a", ChangeType::Unchanged)],
        ));
        assert_eq!(diff.exit_code(), 0);

        diff.add_target_diff(TargetDiff::new(
            "Prod",
            vec![SecretChange::new("b", ChangeType::Added)],
        ));
        assert_eq!(diff.exit_code(), 1);
    }

    #[test]
    fn compact_format_literals() {
        let mut diff = PipelineDiff::default();
        diff.add_target_diff(TargetDiff::new(
            "Stg",
            vec![
                SecretChange::new("a", ChangeType::Unchanged),
                SecretChange::new("b", ChangeType::Unchanged),
            ],
        ));
        assert_eq!(
            format_diff(&diff, OutputFormat::Compact),
            "ZERO-SUM: 2 secrets unchanged"
        );

        diff.add_target_diff(TargetDiff::new(
            "Prod",
            vec![
                SecretChange::new("c", ChangeType::Added),
                SecretChange::new("d", ChangeType::Removed),
                SecretChange::new("e", ChangeType::Modified),
            ],
        ));
        assert_eq!(
            format_diff(&diff, OutputFormat::Compact),
            "CHANGES: +1 -1 ~1 =2 (total: 5)"
        );
    }

    #[test]
    fn github_format_emits_workflow_outputs() {
        let mut diff = PipelineDiff::default();
        diff.add_target_diff(TargetDiff::new(
            "Stg",
            vec![SecretChange::new("db", ChangeType::Added)],
        ));

        let out = format_diff(&diff, OutputFormat::Github);
        assert!(out.contains("::set-output name=changes::1"));
        assert!(out.contains("::set-output name=added::1"));
        assert!(out.contains("::set-output name=zero_sum::false"));
        assert!(out.contains("::group::Target: Stg (1 changes)"));
        assert!(out.contains("::notice::+ db (new secret)"));
        assert!(out.contains("::endgroup::"));
    }

    #[test]
    fn json_format_round_trips() {
        let mut diff = PipelineDiff {
            dry_run: true,
            ..Default::default()
        };
        diff.add_target_diff(TargetDiff::new(
            "Stg",
            vec![SecretChange::new("db", ChangeType::Modified)],
        ));

        let out = format_diff(&diff, OutputFormat::Json);
        let parsed: PipelineDiff = serde_json::from_str(&out).unwrap();
        assert!(parsed.dry_run);
        assert_eq!(parsed.targets.len(), 1);
        assert_eq!(parsed.summary.modified, 1);
    }

    #[test]
    fn human_format_zero_sum_banner() {
        let diff = PipelineDiff::default();
        let out = format_diff(&diff, OutputFormat::Human);
        assert!(out.contains("ZERO-SUM: No changes detected"));
    }
}
