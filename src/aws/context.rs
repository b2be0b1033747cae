//! # Execution Context
//!
//! Discovers and classifies the AWS identity the pipeline runs as, and
//! vends per-target assume-role sessions.
//!
//! Two postures matter for cross-account secret writes:
//!
//! - **Management account** — implicit trust via the organization access
//!   role in every member account, full Organizations and Identity Center
//!   access, but not the recommended place to run workloads.
//! - **Delegated administrator** — a member account registered for specific
//!   service principals; needs its cross-account role deployed separately.
//!
//! Every cloud call a target needs goes through a session bound to that
//! target's resolved role. Nothing mutates process-global credentials.

use std::collections::HashMap;

use anyhow::{bail, Context, Result};
use aws_config::{BehaviorVersion, Region, SdkConfig};
use aws_sdk_organizations::Client as OrganizationsClient;
use aws_sdk_ssm::Client as SsmClient;
use aws_sdk_sts::Client as StsClient;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::aws::AccountInfo;
use crate::config::{normalize_role_path, AwsConfig, ExecutionContextType};

const ASSUME_ROLE_SESSION_NAME: &str = "secret-sync-pipeline";

/// STS caller identity.
#[derive(Debug, Clone, Default)]
pub struct CallerIdentity {
    pub account_id: String,
    pub arn: String,
    pub user_id: String,
}

/// Organization membership and delegation status.
#[derive(Debug, Clone, Default)]
pub struct OrganizationInfo {
    pub id: String,
    pub management_account_id: String,
    pub management_account_arn: String,
    pub is_management_account: bool,
    pub is_delegated_admin: bool,
    pub delegated_services: Vec<String>,
}

/// Reduces an ARN to its identity type (`role`, `user`, `assumed-role`) so
/// logs never carry role or user names.
pub fn redact_arn(arn: &str) -> String {
    let parts: Vec<&str> = arn.split(':').collect();
    if parts.len() < 6 {
        return "unknown".to_string();
    }
    let resource = parts[5];
    match resource.split_once('/') {
        Some((kind, _)) => kind.to_string(),
        None => resource.to_string(),
    }
}

/// AWS execution context: ambient identity plus per-target role sessions.
pub struct ExecutionContext {
    pub config: AwsConfig,
    pub base_config: SdkConfig,
    pub caller_identity: CallerIdentity,
    pub organization_info: Option<OrganizationInfo>,

    sts_client: StsClient,
    org_client: OrganizationsClient,
    /// Assume-role sessions cached per role ARN.
    assumed_configs: RwLock<HashMap<String, SdkConfig>>,
}

impl ExecutionContext {
    /// Creates and validates an execution context from ambient credentials
    /// (OIDC, instance identity, environment).
    pub async fn new(cfg: &AwsConfig) -> Result<Self> {
        let base_config = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(cfg.region.clone()))
            .load()
            .await;

        let sts_client = StsClient::new(&base_config);
        let org_client = OrganizationsClient::new(&base_config);

        let mut ec = Self {
            config: cfg.clone(),
            base_config,
            caller_identity: CallerIdentity::default(),
            organization_info: None,
            sts_client,
            org_client,
            assumed_configs: RwLock::new(HashMap::new()),
        };

        ec.discover_caller_identity()
            .await
            .context("failed to get caller identity")?;
        info!(
            account_id = %ec.caller_identity.account_id,
            identity_type = %redact_arn(&ec.caller_identity.arn),
            "AWS caller identity discovered"
        );

        // non-fatal: running without org access is a supported mode
        if let Err(e) = ec.discover_organization_context().await {
            warn!(error = %e, "could not discover organization context");
        }

        ec.validate_execution_context()?;
        Ok(ec)
    }

    async fn discover_caller_identity(&mut self) -> Result<()> {
        let output = self.sts_client.get_caller_identity().send().await?;
        self.caller_identity = CallerIdentity {
            account_id: output.account().unwrap_or_default().to_string(),
            arn: output.arn().unwrap_or_default().to_string(),
            user_id: output.user_id().unwrap_or_default().to_string(),
        };
        Ok(())
    }

    async fn discover_organization_context(&mut self) -> Result<()> {
        let output = self
            .org_client
            .describe_organization()
            .send()
            .await
            .context("failed to describe organization")?;

        let org = output
            .organization()
            .context("organization description is empty")?;

        let mut info = OrganizationInfo {
            id: org.id().unwrap_or_default().to_string(),
            management_account_id: org.master_account_id().unwrap_or_default().to_string(),
            management_account_arn: org.master_account_arn().unwrap_or_default().to_string(),
            ..Default::default()
        };
        info.is_management_account =
            self.caller_identity.account_id == info.management_account_id;

        debug!(
            org_id = %info.id,
            management_account_id = %info.management_account_id,
            is_management_account = info.is_management_account,
            "organization info discovered"
        );

        if !info.is_management_account {
            if let Err(e) = self.discover_delegated_services(&mut info).await {
                debug!(error = %e, "could not discover delegated services");
            }
        }

        self.organization_info = Some(info);
        Ok(())
    }

    async fn discover_delegated_services(&self, info: &mut OrganizationInfo) -> Result<()> {
        let mut pages = self
            .org_client
            .list_delegated_administrators()
            .into_paginator()
            .send();

        while let Some(page) = pages.next().await {
            let page = page?;
            for admin in page.delegated_administrators() {
                if admin.id() != Some(self.caller_identity.account_id.as_str()) {
                    continue;
                }
                info.is_delegated_admin = true;
                let services = self
                    .org_client
                    .list_delegated_services_for_account()
                    .account_id(self.caller_identity.account_id.clone())
                    .send()
                    .await;
                if let Ok(services) = services {
                    for svc in services.delegated_services() {
                        if let Some(principal) = svc.service_principal() {
                            info.delegated_services.push(principal.to_string());
                        }
                    }
                }
                return Ok(());
            }
        }
        Ok(())
    }

    /// Checks the discovered posture against `execution_context.type`.
    /// A management mismatch is fatal; a delegated-admin mismatch warns.
    fn validate_execution_context(&self) -> Result<()> {
        let configured_account = &self.config.execution_context.account_id;
        if !configured_account.is_empty()
            && configured_account != &self.caller_identity.account_id
        {
            bail!(
                "execution context mismatch: config specifies account {} but running as {}",
                configured_account,
                self.caller_identity.account_id
            );
        }

        match self.config.execution_context.context_type {
            ExecutionContextType::ManagementAccount => {
                if let Some(info) = &self.organization_info {
                    if !info.is_management_account {
                        bail!(
                            "execution context configured as management_account but running in member account {} (management is {})",
                            self.caller_identity.account_id,
                            info.management_account_id
                        );
                    }
                }
                info!("validated: running from management account");
            }
            ExecutionContextType::DelegatedAdmin => {
                if let Some(info) = &self.organization_info {
                    if info.is_management_account {
                        warn!("configured as delegated_admin but running from management account");
                    }
                    if !info.is_delegated_admin {
                        warn!("account may not be a delegated administrator - cross-account access may fail");
                    }
                    info!(
                        services = ?info.delegated_services,
                        "validated: running from delegated admin account"
                    );
                } else {
                    info!("validated: running as delegated admin (organization info unavailable)");
                }
            }
            ExecutionContextType::HubAccount => {
                info!("validated: running from hub account with custom role pattern");
            }
            ExecutionContextType::Unspecified => {
                if let Some(info) = &self.organization_info {
                    if info.is_management_account {
                        info!("auto-detected: running from management account");
                    } else if info.is_delegated_admin {
                        info!(
                            services = ?info.delegated_services,
                            "auto-detected: running from delegated admin account"
                        );
                    } else {
                        info!("auto-detected: running from member account (requires custom role)");
                    }
                }
            }
        }

        Ok(())
    }

    /// Resolves the role ARN for a target account. `None` means the target
    /// is this account and no role assumption is needed.
    pub fn get_role_arn(&self, account_id: &str) -> Option<String> {
        if account_id == self.caller_identity.account_id {
            return None;
        }

        if !self.config.execution_context.custom_role_pattern.is_empty() {
            return Some(
                self.config
                    .execution_context
                    .custom_role_pattern
                    .replace("{{.AccountID}}", account_id),
            );
        }

        if self.config.control_tower.enabled {
            let role_name = if self.config.control_tower.execution_role.name.is_empty() {
                "AWSControlTowerExecution"
            } else {
                &self.config.control_tower.execution_role.name
            };
            let path = normalize_role_path(&self.config.control_tower.execution_role.path);
            return Some(format!("arn:aws:iam::{account_id}:role{path}{role_name}"));
        }

        // the organization access role exists in every org-created account
        Some(format!(
            "arn:aws:iam::{account_id}:role/OrganizationAccountAccessRole"
        ))
    }

    /// Returns an SDK config bound to the target account's role, cached per
    /// role ARN. Same-account targets get the base config.
    pub async fn assume_role_config(&self, account_id: &str) -> Result<SdkConfig> {
        let Some(role_arn) = self.get_role_arn(account_id) else {
            return Ok(self.base_config.clone());
        };
        self.assume_role_arn(&role_arn).await
    }

    /// Returns an SDK config for an explicit role ARN, cached.
    pub async fn assume_role_arn(&self, role_arn: &str) -> Result<SdkConfig> {
        {
            let cache = self.assumed_configs.read().await;
            if let Some(config) = cache.get(role_arn) {
                return Ok(config.clone());
            }
        }

        debug!(
            identity_type = %redact_arn(role_arn),
            "assuming role for cross-account access"
        );

        let provider = aws_config::sts::AssumeRoleProvider::builder(role_arn)
            .session_name(ASSUME_ROLE_SESSION_NAME)
            .configure(&self.base_config)
            .build()
            .await;

        let config = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(self.config.region.clone()))
            .credentials_provider(provider)
            .load()
            .await;

        let mut cache = self.assumed_configs.write().await;
        cache.insert(role_arn.to_string(), config.clone());
        Ok(config)
    }

    /// True when this identity can administer Identity Center.
    pub fn can_access_identity_center(&self) -> bool {
        let Some(info) = &self.organization_info else {
            return false;
        };
        if info.is_management_account {
            return true;
        }
        info.is_delegated_admin
            && info.delegated_services.iter().any(|s| s.contains("sso"))
    }

    /// True when this identity can call the Organizations API.
    pub fn can_access_organizations(&self) -> bool {
        let Some(info) = &self.organization_info else {
            return false;
        };
        if info.is_management_account {
            return true;
        }
        info.is_delegated_admin
            && info
                .delegated_services
                .iter()
                .any(|s| s.contains("organizations"))
    }

    /// Fetches a decrypted SSM parameter value.
    pub async fn get_parameter(&self, name: &str) -> Result<String> {
        let client = SsmClient::new(&self.base_config);
        let output = client
            .get_parameter()
            .name(name)
            .with_decryption(true)
            .send()
            .await
            .with_context(|| format!("failed to get SSM parameter {name}"))?;
        let value = output
            .parameter()
            .and_then(|p| p.value())
            .with_context(|| format!("SSM parameter {name} has no value"))?;
        Ok(value.to_string())
    }

    /// Lists every account in the organization.
    pub async fn list_organization_accounts(&self) -> Result<Vec<AccountInfo>> {
        if !self.can_access_organizations() {
            bail!("no access to Organizations API from this execution context");
        }

        let mut accounts = Vec::new();
        let mut pages = self.org_client.list_accounts().into_paginator().send();
        while let Some(page) = pages.next().await {
            let page = page.context("failed to list accounts")?;
            for acct in page.accounts() {
                accounts.push(AccountInfo {
                    id: acct.id().unwrap_or_default().to_string(),
                    name: acct.name().unwrap_or_default().to_string(),
                    email: acct.email().unwrap_or_default().to_string(),
                    status: acct
                        .status()
                        .map(|s| s.as_str().to_string())
                        .unwrap_or_default(),
                    tags: Default::default(),
                });
            }
        }
        Ok(accounts)
    }

    /// Lists accounts whose direct parent is the given OU.
    pub async fn list_accounts_in_ou(&self, ou_id: &str) -> Result<Vec<AccountInfo>> {
        if !self.can_access_organizations() {
            bail!("no access to Organizations API from this execution context");
        }

        let mut accounts = Vec::new();
        let mut pages = self
            .org_client
            .list_accounts_for_parent()
            .parent_id(ou_id)
            .into_paginator()
            .send();
        while let Some(page) = pages.next().await {
            let page = page.with_context(|| format!("failed to list accounts in OU {ou_id}"))?;
            for acct in page.accounts() {
                accounts.push(AccountInfo {
                    id: acct.id().unwrap_or_default().to_string(),
                    name: acct.name().unwrap_or_default().to_string(),
                    email: acct.email().unwrap_or_default().to_string(),
                    status: acct
                        .status()
                        .map(|s| s.as_str().to_string())
                        .unwrap_or_default(),
                    tags: Default::default(),
                });
            }
        }
        Ok(accounts)
    }

    /// Lists child OU IDs for a parent OU.
    pub async fn list_child_ous(&self, parent_id: &str) -> Result<Vec<String>> {
        if !self.can_access_organizations() {
            bail!("no access to Organizations API from this execution context");
        }

        let mut child_ous = Vec::new();
        let mut pages = self
            .org_client
            .list_organizational_units_for_parent()
            .parent_id(parent_id)
            .into_paginator()
            .send();
        while let Some(page) = pages.next().await {
            let page =
                page.with_context(|| format!("failed to list child OUs for {parent_id}"))?;
            for ou in page.organizational_units() {
                if let Some(id) = ou.id() {
                    child_ous.push(id.to_string());
                }
            }
        }
        Ok(child_ous)
    }

    /// Fetches the organization tags attached to an account.
    pub async fn list_account_tags(
        &self,
        account_id: &str,
    ) -> Result<std::collections::BTreeMap<String, String>> {
        let mut tags = std::collections::BTreeMap::new();
        let mut pages = self
            .org_client
            .list_tags_for_resource()
            .resource_id(account_id)
            .into_paginator()
            .send();
        while let Some(page) = pages.next().await {
            let page =
                page.with_context(|| format!("failed to list tags for account {account_id}"))?;
            for tag in page.tags() {
                tags.insert(
                    tag.key().to_string(),
                    tag.value().to_string(),
                );
            }
        }
        Ok(tags)
    }

    /// Human-readable summary for the `context` subcommand.
    pub fn summary(&self) -> String {
        use std::fmt::Write as _;
        let mut out = String::from("AWS Execution Context:\n");
        let _ = writeln!(out, "  Account ID: {}", self.caller_identity.account_id);
        let _ = writeln!(out, "  ARN: {}", self.caller_identity.arn);

        if let Some(info) = &self.organization_info {
            let _ = writeln!(out, "  Organization ID: {}", info.id);
            let _ = writeln!(out, "  Management Account: {}", info.management_account_id);
            if info.is_management_account {
                out.push_str("  Role: Management Account ⚠️\n");
            } else if info.is_delegated_admin {
                out.push_str("  Role: Delegated Administrator ✓\n");
                let _ = writeln!(out, "  Delegated Services: {:?}", info.delegated_services);
            } else {
                out.push_str("  Role: Member Account\n");
            }
        }

        let _ = writeln!(out, "  Control Tower: {}", self.config.control_tower.enabled);
        if self.config.control_tower.enabled {
            let _ = writeln!(
                out,
                "  Execution Role: {}",
                self.config.control_tower.execution_role.name
            );
        }
        let _ = writeln!(
            out,
            "  Identity Center Access: {}",
            self.can_access_identity_center()
        );
        let _ = writeln!(
            out,
            "  Organizations Access: {}",
            self.can_access_organizations()
        );
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redact_arn_keeps_only_identity_type() {
        assert_eq!(
            redact_arn("arn:aws:iam::123456789012:role/SuperSecretRoleName"),
            "role"
        );
        assert_eq!(
            redact_arn("arn:aws:sts::123456789012:assumed-role/Role/session"),
            "assumed-role"
        );
        assert_eq!(redact_arn("arn:aws:iam::123456789012:user/alice"), "user");
        assert_eq!(redact_arn("arn:aws:iam::123456789012:root"), "root");
        assert_eq!(redact_arn("garbage"), "unknown");
    }
}
