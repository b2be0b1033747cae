//! # Pipeline Configuration
//!
//! Declarative configuration model for the secrets pipeline: sources, the
//! merge store, static and dynamic targets, AWS execution settings and
//! pipeline tuning. One YAML document drives both the one-shot CLI and the
//! long-running operator.
//!
//! Targets support two YAML shapes at the same position:
//!
//! ```yaml
//! Serverless_Stg:
//!   account_id: "111111111111"
//!   imports: [analytics]        # explicit form
//!
//! Serverless_Prod:
//!   - Serverless_Stg            # shorthand: the list IS the imports
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;
use tracing::warn;

/// Maximum length for an expanded environment value. Longer values keep the
/// placeholder and log a warning.
const MAX_ENV_VALUE_LENGTH: usize = 10_000;

/// Errors raised while loading or validating configuration. All of these are
/// fatal at load time.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("vault.address is required")]
    MissingVaultAddress,
    #[error("merge_store must specify either vault or s3")]
    MissingMergeStore,
    #[error("merge_store.s3.bucket is required")]
    MergeStoreMissingBucket,
    #[error("at least one target or dynamic_target is required")]
    NoTargets,
    #[error("target {target:?}: account_id is required")]
    MissingAccountId { target: String },
    #[error("target {target:?}: invalid account_id format {account_id:?} (must be 12 digits)")]
    InvalidAccountId { target: String, account_id: String },
    #[error("target {target:?}: import {import:?} not found in sources or targets")]
    UnknownImport { target: String, import: String },
    #[error(
        "dynamic_target {target:?}: must specify identity_center, organizations, or accounts_list discovery"
    )]
    EmptyDiscovery { target: String },
}

/// The unified pipeline configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub log: LogConfig,
    pub vault: VaultConfig,
    pub aws: AwsConfig,
    pub sources: BTreeMap<String, Source>,
    pub merge_store: MergeStoreConfig,
    pub targets: BTreeMap<String, Target>,
    pub dynamic_targets: BTreeMap<String, DynamicTarget>,
    pub pipeline: PipelineSettings,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    pub format: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultConfig {
    pub address: String,
    pub namespace: String,
    pub auth: VaultAuthConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultAuthConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approle: Option<AppRoleAuth>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<TokenAuth>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kubernetes: Option<KubernetesAuth>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppRoleAuth {
    pub mount: String,
    pub role_id: String,
    pub secret_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenAuth {
    pub token: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KubernetesAuth {
    pub role: String,
    pub mount_path: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AwsConfig {
    pub region: String,
    pub execution_context: ExecutionContextConfig,
    pub control_tower: ControlTowerConfig,
    pub organizations: OrganizationsConfig,
    pub identity_center: IdentityCenterConfig,
}

/// Where the pipeline runs from, for cross-account posture validation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionContextType {
    /// Not configured; the execution context auto-detects its posture.
    #[default]
    #[serde(rename = "")]
    Unspecified,
    /// The AWS Organizations management account.
    ManagementAccount,
    /// A member account registered as delegated administrator.
    DelegatedAdmin,
    /// A custom secrets hub account with its own role pattern.
    HubAccount,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionContextConfig {
    #[serde(rename = "type")]
    pub context_type: ExecutionContextType,
    pub account_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delegation: Option<DelegationConfig>,
    pub custom_role_pattern: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DelegationConfig {
    pub services: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlTowerConfig {
    pub enabled: bool,
    pub execution_role: ExecutionRoleConfig,
    pub account_factory: AccountFactoryConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionRoleConfig {
    pub name: String,
    pub path: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AccountFactoryConfig {
    pub enabled: bool,
    pub on_account_creation: bool,
    pub aft_integration: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OrganizationsConfig {
    pub auto_discover: bool,
    pub root_id: String,
    pub ous: BTreeMap<String, OuConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OuConfig {
    pub id: String,
    pub accounts: Vec<String>,
    pub children: BTreeMap<String, OuConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityCenterConfig {
    pub enabled: bool,
    pub auto_discover: bool,
    pub instance_arn: String,
    pub identity_store_id: String,
}

/// A named, read-only producer of secrets.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Source {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vault: Option<VaultSource>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aws: Option<AwsSource>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultSource {
    pub address: String,
    pub namespace: String,
    pub mount: String,
    pub paths: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AwsSource {
    pub account_id: String,
    pub region: String,
    pub prefix: String,
    pub tags: BTreeMap<String, String>,
}

/// Intermediate storage for merged secrets, keyed per target.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeStoreConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vault: Option<MergeStoreVault>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub s3: Option<MergeStoreS3>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeStoreVault {
    pub mount: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeStoreS3 {
    pub bucket: String,
    pub prefix: String,
    pub kms_key_id: String,
}

/// A sync destination: an account plus the imports flowing into it.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Target {
    pub account_id: String,
    pub imports: Vec<String>,
    pub region: String,
    pub secret_prefix: String,
    pub role_arn: String,
}

impl<'de> Deserialize<'de> for Target {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize, Default)]
        #[serde(default, deny_unknown_fields)]
        struct Fields {
            account_id: String,
            imports: Vec<String>,
            region: String,
            secret_prefix: String,
            role_arn: String,
        }

        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            // bare list: the list IS the imports
            Shorthand(Vec<String>),
            Full(Fields),
        }

        match Repr::deserialize(deserializer)? {
            Repr::Shorthand(imports) => Ok(Target {
                imports,
                ..Target::default()
            }),
            Repr::Full(f) => Ok(Target {
                account_id: f.account_id,
                imports: f.imports,
                region: f.region,
                secret_prefix: f.secret_prefix,
                role_arn: f.role_arn,
            }),
        }
    }
}

/// A target template resolved at runtime via discovery.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DynamicTarget {
    pub discovery: DiscoveryConfig,
    pub imports: Vec<String>,
    pub exclude: Vec<String>,

    pub region: String,
    pub secret_prefix: String,
    /// Supports `{{.AccountID}}` template substitution.
    pub role_arn: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity_center: Option<IdentityCenterDiscovery>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub organizations: Option<OrganizationsDiscovery>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accounts_list: Option<AccountsListDiscovery>,
}

impl DiscoveryConfig {
    pub fn is_empty(&self) -> bool {
        self.identity_center.is_none()
            && self.organizations.is_none()
            && self.accounts_list.is_none()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityCenterDiscovery {
    pub group: String,
    pub permission_set: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OrganizationsDiscovery {
    pub ou: String,
    pub tags: BTreeMap<String, String>,
    /// Whether to traverse child OUs.
    pub recursive: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AccountsListDiscovery {
    /// e.g. `ssm:/platform/analytics-engineer-sandboxes`
    pub source: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    pub merge: MergeSettings,
    pub sync: SyncSettings,
    pub dry_run: bool,
    pub continue_on_error: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeSettings {
    pub parallel: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    pub parallel: usize,
    pub delete_orphans: bool,
}

impl Config {
    /// Loads configuration from a file, applies defaults and expands
    /// environment references in credential fields.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let data = std::fs::read_to_string(path)?;
        Self::from_yaml(&data)
    }

    /// Parses configuration from a YAML string.
    pub fn from_yaml(data: &str) -> Result<Self, ConfigError> {
        let mut cfg: Config = serde_yaml::from_str(data)?;
        cfg.apply_defaults();
        cfg.expand_env_vars();
        cfg.apply_env_overrides();
        Ok(cfg)
    }

    fn apply_defaults(&mut self) {
        if self.log.level.is_empty() {
            self.log.level = "info".to_string();
        }
        if self.log.format.is_empty() {
            self.log.format = "text".to_string();
        }
        if self.aws.region.is_empty() {
            self.aws.region = "us-east-1".to_string();
        }
        if self.aws.control_tower.execution_role.name.is_empty() {
            self.aws.control_tower.execution_role.name = "AWSControlTowerExecution".to_string();
        }
        if self.pipeline.merge.parallel == 0 {
            self.pipeline.merge.parallel = 4;
        }
        if self.pipeline.sync.parallel == 0 {
            self.pipeline.sync.parallel = 4;
        }
    }

    /// Expands `${NAME}` references in the designated credential fields.
    /// Values longer than the cap keep their placeholder.
    fn expand_env_vars(&mut self) {
        let pattern =
            Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("env pattern is valid");

        let expand = |s: &str| -> String {
            pattern
                .replace_all(s, |caps: &regex::Captures<'_>| {
                    let var_name = &caps[1];
                    match std::env::var(var_name) {
                        Ok(val) if !val.is_empty() => {
                            if val.len() > MAX_ENV_VALUE_LENGTH {
                                warn!(
                                    variable = var_name,
                                    "environment variable value exceeds maximum length, keeping placeholder"
                                );
                                caps[0].to_string()
                            } else {
                                val
                            }
                        }
                        _ => caps[0].to_string(),
                    }
                })
                .into_owned()
        };

        if let Some(approle) = &mut self.vault.auth.approle {
            approle.role_id = expand(&approle.role_id);
            approle.secret_id = expand(&approle.secret_id);
        }
        if let Some(token) = &mut self.vault.auth.token {
            token.token = expand(&token.token);
        }
    }

    /// Environment overrides for operational knobs.
    fn apply_env_overrides(&mut self) {
        if let Ok(level) = std::env::var("SSP_LOG_LEVEL") {
            if !level.is_empty() {
                self.log.level = level;
            }
        }
        if let Ok(region) = std::env::var("SSP_AWS_REGION") {
            if !region.is_empty() {
                self.aws.region = region;
            }
        }
    }

    /// Validates the configuration; each failure mode has its own error kind.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.vault.address.is_empty() {
            return Err(ConfigError::MissingVaultAddress);
        }

        if self.merge_store.vault.is_none() && self.merge_store.s3.is_none() {
            return Err(ConfigError::MissingMergeStore);
        }
        if let Some(s3) = &self.merge_store.s3 {
            if s3.bucket.is_empty() {
                return Err(ConfigError::MergeStoreMissingBucket);
            }
        }

        if self.targets.is_empty() && self.dynamic_targets.is_empty() {
            return Err(ConfigError::NoTargets);
        }

        for (name, target) in &self.targets {
            if target.account_id.is_empty() {
                return Err(ConfigError::MissingAccountId {
                    target: name.clone(),
                });
            }
            if !is_valid_aws_account_id(&target.account_id) {
                return Err(ConfigError::InvalidAccountId {
                    target: name.clone(),
                    account_id: target.account_id.clone(),
                });
            }
            for import in &target.imports {
                if !self.sources.contains_key(import) && !self.targets.contains_key(import) {
                    return Err(ConfigError::UnknownImport {
                        target: name.clone(),
                        import: import.clone(),
                    });
                }
            }
        }

        for (name, dt) in &self.dynamic_targets {
            if dt.discovery.is_empty() {
                return Err(ConfigError::EmptyDiscovery {
                    target: name.clone(),
                });
            }
        }

        Ok(())
    }

    /// Resolves the role ARN for a target account from configuration alone.
    /// Explicit per-target roles are the caller's concern; this ladder is
    /// custom role pattern, then Control Tower execution role, then the
    /// organizational access role every org-created account carries.
    pub fn get_role_arn(&self, account_id: &str) -> String {
        if !self.aws.execution_context.custom_role_pattern.is_empty() {
            return self
                .aws
                .execution_context
                .custom_role_pattern
                .replace("{{.AccountID}}", account_id);
        }

        if self.aws.control_tower.enabled {
            let role_name = if self.aws.control_tower.execution_role.name.is_empty() {
                "AWSControlTowerExecution"
            } else {
                &self.aws.control_tower.execution_role.name
            };
            let path = normalize_role_path(&self.aws.control_tower.execution_role.path);
            return format!("arn:aws:iam::{account_id}:role{path}{role_name}");
        }

        format!("arn:aws:iam::{account_id}:role/OrganizationAccountAccessRole")
    }

    /// True when the target imports from at least one other target.
    pub fn is_inherited_target(&self, target_name: &str) -> bool {
        self.targets.get(target_name).is_some_and(|t| {
            t.imports
                .iter()
                .any(|import| self.targets.contains_key(import))
        })
    }

    /// Resolves an import name to its canonical source path. Sources return
    /// their mount; inherited targets return their merge-store path.
    pub fn get_source_path(&self, import_name: &str) -> String {
        if let Some(src) = self.sources.get(import_name) {
            if let Some(vault) = &src.vault {
                return vault.mount.clone();
            }
        }

        if self.targets.contains_key(import_name) {
            if let Some(vault) = &self.merge_store.vault {
                return format!("{}/{import_name}", vault.mount);
            }
        }

        import_name.to_string()
    }

    /// Serializes the configuration to a file, owner-readable only.
    pub fn write(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let data = serde_yaml::to_string(self).map_err(ConfigError::Parse)?;
        std::fs::write(&path, data)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))?;
        }
        Ok(())
    }
}

/// A valid AWS account ID is exactly twelve decimal digits.
pub fn is_valid_aws_account_id(account_id: &str) -> bool {
    account_id.len() == 12 && account_id.bytes().all(|b| b.is_ascii_digit())
}

/// Forces an IAM role path into leading-and-trailing-slash form. An empty
/// path becomes `/`, `foo` becomes `/foo/`.
pub fn normalize_role_path(path: &str) -> String {
    if path.is_empty() {
        return "/".to_string();
    }
    let mut out = String::new();
    if !path.starts_with('/') {
        out.push('/');
    }
    out.push_str(path);
    if !out.ends_with('/') {
        out.push('/');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL_CONFIG: &str = r#"
log:
  level: debug
  format: json

vault:
  address: https://vault.example.com/
  namespace: eng/data-platform
  auth:
    approle:
      mount: approle
      role_id: ${SSP_TEST_ROLE_ID}
      secret_id: ${SSP_TEST_SECRET_ID}

aws:
  region: us-east-1
  execution_context:
    type: management_account
    account_id: "123456789012"
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
  Serverless_Stg:
    account_id: "111111111111"
    imports:
      - analytics
      - analytics-engineers
  Serverless_Prod:
    account_id: "222222222222"
    imports:
      - Serverless_Stg
  livequery_demos:
    account_id: "222222222222"
    imports:
      - Serverless_Prod

pipeline:
  merge:
    parallel: 4
  sync:
    parallel: 4
    delete_orphans: false
"#;

    fn base_config() -> Config {
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
  Stg:
    account_id: "111111111111"
    imports: [analytics]
"#;
        Config::from_yaml(yaml).unwrap()
    }

    #[test]
    fn load_full_config() {
        std::env::set_var("SSP_TEST_ROLE_ID", "test-role-id");
        std::env::set_var("SSP_TEST_SECRET_ID", "test-secret-id");

        let cfg = Config::from_yaml(FULL_CONFIG).unwrap();

        assert_eq!(cfg.log.level, "debug");
        assert_eq!(cfg.vault.address, "https://vault.example.com/");
        assert_eq!(cfg.vault.namespace, "eng/data-platform");

        let approle = cfg.vault.auth.approle.as_ref().unwrap();
        assert_eq!(approle.role_id, "test-role-id");
        assert_eq!(approle.secret_id, "test-secret-id");

        assert_eq!(cfg.aws.region, "us-east-1");
        assert_eq!(
            cfg.aws.execution_context.context_type,
            ExecutionContextType::ManagementAccount
        );
        assert!(cfg.aws.control_tower.enabled);

        assert_eq!(cfg.sources.len(), 2);
        assert_eq!(
            cfg.sources["analytics"].vault.as_ref().unwrap().mount,
            "analytics"
        );

        assert_eq!(cfg.targets.len(), 3);
        assert_eq!(cfg.targets["Serverless_Stg"].account_id, "111111111111");
        assert_eq!(
            cfg.targets["Serverless_Stg"].imports,
            vec!["analytics", "analytics-engineers"]
        );
        assert_eq!(cfg.targets["Serverless_Prod"].imports, vec!["Serverless_Stg"]);

        cfg.validate().unwrap();

        std::env::remove_var("SSP_TEST_ROLE_ID");
        std::env::remove_var("SSP_TEST_SECRET_ID");
    }

    #[test]
    fn shorthand_target_is_imports_only() {
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
        let cfg = Config::from_yaml(yaml).unwrap();
        let prod = &cfg.targets["Serverless_Prod"];
        assert_eq!(prod.imports, vec!["Serverless_Stg"]);
        assert!(prod.account_id.is_empty());
        assert!(prod.region.is_empty());
        assert!(prod.role_arn.is_empty());

        // shorthand targets still need an account_id to validate
        let err = cfg.validate().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::MissingAccountId { ref target } if target == "Serverless_Prod"
        ));
    }

    #[test]
    fn defaults_are_applied() {
        let cfg = Config::from_yaml("vault:\n  address: https://v\n").unwrap();
        assert_eq!(cfg.log.level, "info");
        assert_eq!(cfg.log.format, "text");
        assert_eq!(cfg.aws.region, "us-east-1");
        assert_eq!(
            cfg.aws.control_tower.execution_role.name,
            "AWSControlTowerExecution"
        );
        assert_eq!(cfg.pipeline.merge.parallel, 4);
        assert_eq!(cfg.pipeline.sync.parallel, 4);
    }

    #[test]
    fn oversized_env_value_keeps_placeholder() {
        std::env::set_var("SSP_TEST_HUGE", "x".repeat(MAX_ENV_VALUE_LENGTH + 1));
        let yaml = r#"
vault:
  address: https://v
  auth:
    token:
      token: ${SSP_TEST_HUGE}
"#;
        let cfg = Config::from_yaml(yaml).unwrap();
        assert_eq!(cfg.vault.auth.token.unwrap().token, "${SSP_TEST_HUGE}");
        std::env::remove_var("SSP_TEST_HUGE");
    }

    #[test]
    fn unset_env_value_keeps_placeholder() {
        let yaml = r#"
vault:
  address: https://v
  auth:
    token:
      token: ${SSP_TEST_DEFINITELY_UNSET}
"#;
        let cfg = Config::from_yaml(yaml).unwrap();
        assert_eq!(
            cfg.vault.auth.token.unwrap().token,
            "${SSP_TEST_DEFINITELY_UNSET}"
        );
    }

    #[test]
    fn validate_error_kinds() {
        let mut cfg = base_config();
        cfg.vault.address.clear();
        assert!(matches!(
            cfg.validate().unwrap_err(),
            ConfigError::MissingVaultAddress
        ));

        let mut cfg = base_config();
        cfg.merge_store = MergeStoreConfig::default();
        assert!(matches!(
            cfg.validate().unwrap_err(),
            ConfigError::MissingMergeStore
        ));

        let mut cfg = base_config();
        cfg.merge_store = MergeStoreConfig {
            vault: None,
            s3: Some(MergeStoreS3 {
                prefix: "secrets/".to_string(),
                ..Default::default()
            }),
        };
        assert!(matches!(
            cfg.validate().unwrap_err(),
            ConfigError::MergeStoreMissingBucket
        ));

        let mut cfg = base_config();
        cfg.targets.clear();
        assert!(matches!(cfg.validate().unwrap_err(), ConfigError::NoTargets));

        let mut cfg = base_config();
        cfg.targets.get_mut("Stg").unwrap().account_id = "invalid".to_string();
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("invalid account_id format"));

        let mut cfg = base_config();
        cfg.targets.get_mut("Stg").unwrap().imports = vec!["nonexistent".to_string()];
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains(r#"import "nonexistent" not found"#));
    }

    #[test]
    fn validate_dynamic_targets() {
        let mut cfg = base_config();
        cfg.targets.clear();
        cfg.dynamic_targets.insert(
            "sandboxes".to_string(),
            DynamicTarget {
                discovery: DiscoveryConfig {
                    accounts_list: Some(AccountsListDiscovery {
                        source: "ssm:/platform/sandboxes".to_string(),
                    }),
                    ..Default::default()
                },
                imports: vec!["analytics".to_string()],
                ..Default::default()
            },
        );
        cfg.validate().unwrap();

        cfg.dynamic_targets.get_mut("sandboxes").unwrap().discovery =
            DiscoveryConfig::default();
        assert!(matches!(
            cfg.validate().unwrap_err(),
            ConfigError::EmptyDiscovery { .. }
        ));
    }

    #[test]
    fn role_arn_precedence() {
        // custom role pattern wins over control tower
        let mut cfg = Config::default();
        cfg.aws.execution_context.custom_role_pattern =
            "arn:aws:iam::{{.AccountID}}:role/SecretsHub".to_string();
        cfg.aws.control_tower.enabled = true;
        cfg.aws.control_tower.execution_role.name = "AWSControlTowerExecution".to_string();
        assert_eq!(
            cfg.get_role_arn("123456789012"),
            "arn:aws:iam::123456789012:role/SecretsHub"
        );

        // control tower role
        cfg.aws.execution_context.custom_role_pattern.clear();
        assert_eq!(
            cfg.get_role_arn("123456789012"),
            "arn:aws:iam::123456789012:role/AWSControlTowerExecution"
        );

        // control tower role with path
        cfg.aws.control_tower.execution_role.name = "CustomRole".to_string();
        cfg.aws.control_tower.execution_role.path = "/secrets/".to_string();
        assert_eq!(
            cfg.get_role_arn("123456789012"),
            "arn:aws:iam::123456789012:role/secrets/CustomRole"
        );

        // neither configured: organizational access role
        let cfg = Config::default();
        assert_eq!(
            cfg.get_role_arn("123456789012"),
            "arn:aws:iam::123456789012:role/OrganizationAccountAccessRole"
        );
    }

    #[test]
    fn role_path_normalization() {
        assert_eq!(normalize_role_path(""), "/");
        assert_eq!(normalize_role_path("foo"), "/foo/");
        assert_eq!(normalize_role_path("/foo"), "/foo/");
        assert_eq!(normalize_role_path("foo/"), "/foo/");
        assert_eq!(normalize_role_path("/foo/"), "/foo/");
    }

    #[test]
    fn inherited_target_detection() {
        let yaml = r#"
vault:
  address: https://v
sources:
  analytics:
    vault:
      mount: analytics
merge_store:
  vault:
    mount: merged-secrets
targets:
  Stg:
    account_id: "111111111111"
    imports: [analytics]
  Prod:
    account_id: "222222222222"
    imports: [Stg]
"#;
        let cfg = Config::from_yaml(yaml).unwrap();
        assert!(!cfg.is_inherited_target("Stg"));
        assert!(cfg.is_inherited_target("Prod"));

        // source path resolution
        assert_eq!(cfg.get_source_path("analytics"), "analytics");
        assert_eq!(cfg.get_source_path("Stg"), "merged-secrets/Stg");
        assert_eq!(cfg.get_source_path("unknown"), "unknown");
    }

    #[test]
    fn account_id_validation() {
        assert!(is_valid_aws_account_id("123456789012"));
        assert!(is_valid_aws_account_id("000000000000"));
        assert!(!is_valid_aws_account_id("12345678901"));
        assert!(!is_valid_aws_account_id("1234567890123"));
        assert!(!is_valid_aws_account_id("12345678901a"));
        assert!(!is_valid_aws_account_id("123456789-12"));
        assert!(!is_valid_aws_account_id(""));
        assert!(!is_valid_aws_account_id("123456789 12"));
    }

    #[test]
    fn write_round_trips() {
        let cfg = base_config();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        cfg.write(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.vault.address, cfg.vault.address);
        assert_eq!(loaded.targets.len(), cfg.targets.len());
    }
}
