//! # Dynamic Target Discovery
//!
//! Expands dynamic-target specifications into concrete targets using
//! Identity Center, Organizations and external account lists. Discovery
//! failures are warnings: the dynamic target is skipped and the pipeline
//! continues with whatever it could resolve.

use std::collections::BTreeMap;

use anyhow::{bail, Context, Result};
use aws_sdk_identitystore::Client as IdentityStoreClient;
use aws_sdk_ssoadmin::Client as SsoAdminClient;
use tracing::{debug, info, warn};

use crate::aws::context::ExecutionContext;
use crate::aws::AccountInfo;
use crate::config::{
    AccountsListDiscovery, Config, DynamicTarget, IdentityCenterDiscovery,
    OrganizationsDiscovery, Target,
};

/// Discovers accounts for dynamic targets.
pub struct DiscoveryService<'a> {
    ctx: &'a ExecutionContext,
    config: &'a Config,
}

impl<'a> DiscoveryService<'a> {
    pub fn new(ctx: &'a ExecutionContext, config: &'a Config) -> Self {
        Self { ctx, config }
    }

    /// Resolves every dynamic target into zero or more concrete targets.
    pub async fn discover_targets(&self) -> Result<BTreeMap<String, Target>> {
        info!("starting dynamic target discovery");
        let mut discovered = BTreeMap::new();

        for (dynamic_name, dynamic_target) in &self.config.dynamic_targets {
            let mut accounts: Vec<AccountInfo> = Vec::new();

            if let Some(ic) = &dynamic_target.discovery.identity_center {
                match self.discover_from_identity_center(ic).await {
                    Ok(found) => accounts.extend(found),
                    Err(e) => {
                        warn!(
                            dynamic_target = %dynamic_name,
                            error = %e,
                            "failed to discover from Identity Center"
                        );
                        continue;
                    }
                }
            }

            if let Some(org) = &dynamic_target.discovery.organizations {
                match self.discover_from_organizations(org).await {
                    Ok(found) => accounts.extend(found),
                    Err(e) => {
                        warn!(
                            dynamic_target = %dynamic_name,
                            error = %e,
                            "failed to discover from Organizations"
                        );
                        continue;
                    }
                }
            }

            if let Some(list) = &dynamic_target.discovery.accounts_list {
                match self.discover_from_accounts_list(list).await {
                    Ok(found) => accounts.extend(found),
                    Err(e) => {
                        warn!(
                            dynamic_target = %dynamic_name,
                            error = %e,
                            "failed to discover from accounts list"
                        );
                        continue;
                    }
                }
            }

            let mut accounts = deduplicate_accounts(accounts);

            // cross-reference the org account list for names/emails
            if accounts.iter().any(|a| a.name.is_empty())
                && self.ctx.can_access_organizations()
            {
                if let Ok(all) = self.ctx.list_organization_accounts().await {
                    let by_id: BTreeMap<&str, &AccountInfo> =
                        all.iter().map(|a| (a.id.as_str(), a)).collect();
                    for account in &mut accounts {
                        if let Some(enriched) = by_id.get(account.id.as_str()) {
                            *account = (*enriched).clone();
                        }
                    }
                }
            }

            accounts_into_targets(
                dynamic_target,
                accounts,
                &self.config.aws.region,
                &mut discovered,
            );
        }

        info!(count = discovered.len(), "dynamic target discovery completed");
        Ok(discovered)
    }

    async fn discover_from_identity_center(
        &self,
        cfg: &IdentityCenterDiscovery,
    ) -> Result<Vec<AccountInfo>> {
        if !self.ctx.can_access_identity_center() {
            bail!("no access to Identity Center from this execution context");
        }

        let sso_client = SsoAdminClient::new(&self.ctx.base_config);
        let id_store_client = IdentityStoreClient::new(&self.ctx.base_config);

        let instances = sso_client
            .list_instances()
            .send()
            .await
            .context("failed to list SSO instances")?;
        let instance = instances
            .instances()
            .first()
            .context("no SSO instances found")?;
        let identity_store_id = instance.identity_store_id().unwrap_or_default().to_string();
        let instance_arn = instance.instance_arn().unwrap_or_default().to_string();

        let mut accounts = Vec::new();

        if !cfg.group.is_empty() {
            let group_id = self
                .find_group_by_name(&id_store_client, &identity_store_id, &cfg.group)
                .await
                .with_context(|| format!("failed to find group {:?}", cfg.group))?;
            accounts.extend(
                self.accounts_for_group(&sso_client, &instance_arn, &group_id)
                    .await?,
            );
        }

        if !cfg.permission_set.is_empty() {
            accounts.extend(
                self.accounts_with_permission_set(&sso_client, &instance_arn, &cfg.permission_set)
                    .await?,
            );
        }

        let accounts = deduplicate_accounts(accounts);
        debug!(count = accounts.len(), "discovered accounts from Identity Center");
        Ok(accounts)
    }

    async fn find_group_by_name(
        &self,
        client: &IdentityStoreClient,
        store_id: &str,
        group_name: &str,
    ) -> Result<String> {
        let mut pages = client
            .list_groups()
            .identity_store_id(store_id)
            .into_paginator()
            .send();
        while let Some(page) = pages.next().await {
            let page = page?;
            for group in page.groups() {
                if group.display_name() == Some(group_name) {
                    return Ok(group.group_id().to_string());
                }
            }
        }
        bail!("group not found: {group_name}")
    }

    /// Collects the unique account IDs assigned to a group across every
    /// permission set in the instance.
    async fn accounts_for_group(
        &self,
        client: &SsoAdminClient,
        instance_arn: &str,
        group_id: &str,
    ) -> Result<Vec<AccountInfo>> {
        let mut accounts = Vec::new();
        let mut seen = std::collections::HashSet::new();

        let mut ps_pages = client
            .list_permission_sets()
            .instance_arn(instance_arn)
            .into_paginator()
            .send();
        while let Some(page) = ps_pages.next().await {
            let page = page?;
            for ps_arn in page.permission_sets() {
                let provisioned = client
                    .list_accounts_for_provisioned_permission_set()
                    .instance_arn(instance_arn)
                    .permission_set_arn(ps_arn.clone())
                    .into_paginator()
                    .send();
                let mut account_pages = provisioned;
                while let Some(accounts_page) = account_pages.next().await {
                    // individual permission sets may be unreadable; skip them
                    let Ok(accounts_page) = accounts_page else {
                        continue;
                    };
                    for account_id in accounts_page.account_ids() {
                        let mut assignments = client
                            .list_account_assignments()
                            .instance_arn(instance_arn)
                            .account_id(account_id.clone())
                            .permission_set_arn(ps_arn.clone())
                            .into_paginator()
                            .send();
                        while let Some(assignment_page) = assignments.next().await {
                            let Ok(assignment_page) = assignment_page else {
                                continue;
                            };
                            for assignment in assignment_page.account_assignments() {
                                if assignment.principal_id() == Some(group_id)
                                    && seen.insert(account_id.to_string())
                                {
                                    accounts.push(AccountInfo {
                                        id: account_id.to_string(),
                                        ..Default::default()
                                    });
                                }
                            }
                        }
                    }
                }
            }
        }

        Ok(accounts)
    }

    /// Resolves a permission set by name, then lists the accounts it is
    /// provisioned in.
    async fn accounts_with_permission_set(
        &self,
        client: &SsoAdminClient,
        instance_arn: &str,
        permission_set_name: &str,
    ) -> Result<Vec<AccountInfo>> {
        let mut permission_set_arn = None;

        let mut ps_pages = client
            .list_permission_sets()
            .instance_arn(instance_arn)
            .into_paginator()
            .send();
        'outer: while let Some(page) = ps_pages.next().await {
            let page = page?;
            for ps_arn in page.permission_sets() {
                let details = client
                    .describe_permission_set()
                    .instance_arn(instance_arn)
                    .permission_set_arn(ps_arn.clone())
                    .send()
                    .await;
                let Ok(details) = details else { continue };
                if details
                    .permission_set()
                    .and_then(|ps| ps.name())
                    == Some(permission_set_name)
                {
                    permission_set_arn = Some(ps_arn.to_string());
                    break 'outer;
                }
            }
        }

        let Some(permission_set_arn) = permission_set_arn else {
            bail!("permission set not found: {permission_set_name}");
        };

        let mut accounts = Vec::new();
        let mut pages = client
            .list_accounts_for_provisioned_permission_set()
            .instance_arn(instance_arn)
            .permission_set_arn(permission_set_arn)
            .into_paginator()
            .send();
        while let Some(page) = pages.next().await {
            let page = page?;
            for account_id in page.account_ids() {
                accounts.push(AccountInfo {
                    id: account_id.to_string(),
                    ..Default::default()
                });
            }
        }
        Ok(accounts)
    }

    async fn discover_from_organizations(
        &self,
        cfg: &OrganizationsDiscovery,
    ) -> Result<Vec<AccountInfo>> {
        if !self.ctx.can_access_organizations() {
            bail!("no access to Organizations API from this execution context");
        }

        let mut accounts = Vec::new();

        if !cfg.ou.is_empty() {
            if cfg.recursive {
                accounts.extend(self.list_accounts_in_ou_recursive(&cfg.ou).await?);
            } else {
                accounts.extend(self.ctx.list_accounts_in_ou(&cfg.ou).await?);
            }
        }

        // no OU but tags: filter the whole organization
        if cfg.ou.is_empty() && !cfg.tags.is_empty() {
            accounts.extend(self.ctx.list_organization_accounts().await?);
        }

        if !cfg.tags.is_empty() {
            for account in &mut accounts {
                if account.tags.is_empty() {
                    match self.ctx.list_account_tags(&account.id).await {
                        Ok(tags) => account.tags = tags,
                        Err(e) => {
                            debug!(account_id = %account.id, error = %e, "could not list account tags")
                        }
                    }
                }
            }
            accounts = filter_accounts_by_tags(accounts, &cfg.tags);
        }

        debug!(count = accounts.len(), "discovered accounts from Organizations");
        Ok(accounts)
    }

    /// Depth-first walk of an OU subtree. The root OU must be listable;
    /// enumeration errors on child OUs are logged and skipped.
    async fn list_accounts_in_ou_recursive(&self, ou_id: &str) -> Result<Vec<AccountInfo>> {
        let mut accounts = self
            .ctx
            .list_accounts_in_ou(ou_id)
            .await
            .with_context(|| format!("failed to list accounts in OU {ou_id}"))?;

        let mut pending = match self.ctx.list_child_ous(ou_id).await {
            Ok(children) => children,
            Err(e) => {
                debug!(ou = ou_id, error = %e, "could not list child OUs");
                return Ok(accounts);
            }
        };

        while let Some(child_ou) = pending.pop() {
            match self.ctx.list_accounts_in_ou(&child_ou).await {
                Ok(child_accounts) => accounts.extend(child_accounts),
                Err(e) => {
                    debug!(child_ou = %child_ou, error = %e, "error listing accounts in child OU");
                    continue;
                }
            }
            match self.ctx.list_child_ous(&child_ou).await {
                Ok(grandchildren) => pending.extend(grandchildren),
                Err(e) => {
                    debug!(child_ou = %child_ou, error = %e, "could not list child OUs");
                }
            }
        }

        Ok(accounts)
    }

    async fn discover_from_accounts_list(
        &self,
        cfg: &AccountsListDiscovery,
    ) -> Result<Vec<AccountInfo>> {
        if let Some(param_name) = cfg.source.strip_prefix("ssm:") {
            let value = self.ctx.get_parameter(param_name).await?;
            let value = value.trim();
            if value.is_empty() {
                bail!("SSM parameter {param_name} is empty");
            }
            return Ok(parse_accounts_value(value));
        }
        bail!("unsupported accounts list source: {} (supported: ssm:)", cfg.source)
    }
}

/// Parses an external accounts-list value. Accepted formats, in order:
/// a JSON array of `{id, name}` objects, a JSON array of ID strings, a
/// comma-separated ID list. Empty entries are dropped.
pub fn parse_accounts_value(value: &str) -> Vec<AccountInfo> {
    if value.starts_with('[') {
        #[derive(serde::Deserialize)]
        struct Entry {
            #[serde(default)]
            id: String,
            #[serde(default)]
            name: String,
        }

        if let Ok(entries) = serde_json::from_str::<Vec<Entry>>(value) {
            if !entries.is_empty() && !entries[0].id.is_empty() {
                return entries
                    .into_iter()
                    .filter(|e| !e.id.is_empty())
                    .map(|e| AccountInfo {
                        id: e.id,
                        name: e.name,
                        ..Default::default()
                    })
                    .collect();
            }
        }

        if let Ok(ids) = serde_json::from_str::<Vec<String>>(value) {
            return ids
                .into_iter()
                .map(|id| id.trim().to_string())
                .filter(|id| !id.is_empty())
                .map(|id| AccountInfo {
                    id,
                    ..Default::default()
                })
                .collect();
        }
    }

    value
        .split(',')
        .map(|part| part.trim().to_string())
        .filter(|id| !id.is_empty())
        .map(|id| AccountInfo {
            id,
            ..Default::default()
        })
        .collect()
}

/// Converts discovered accounts into concrete targets: excluded accounts
/// are dropped, names are sanitized with an `account_<id>` fallback and a
/// `_<first6OfAccountId>` collision suffix, the region defaults from the
/// top-level AWS config, and `{{.AccountID}}` templates expand in the role
/// ARN. Entries already in `discovered` keep their names.
pub(crate) fn accounts_into_targets(
    dynamic_target: &DynamicTarget,
    accounts: Vec<AccountInfo>,
    default_region: &str,
    discovered: &mut BTreeMap<String, Target>,
) {
    for account in accounts {
        if is_excluded(&account.id, &dynamic_target.exclude) {
            debug!(account_id = %account.id, "account excluded");
            continue;
        }

        let mut target_name = sanitize_target_name(&account.name);
        if target_name.is_empty() {
            target_name = format!("account_{}", account.id);
        }
        if discovered.contains_key(&target_name) {
            let suffix: String = account.id.chars().take(6).collect();
            target_name = format!("{target_name}_{suffix}");
        }

        let region = if dynamic_target.region.is_empty() {
            default_region.to_string()
        } else {
            dynamic_target.region.clone()
        };

        let role_arn = if dynamic_target.role_arn.is_empty() {
            String::new()
        } else {
            dynamic_target
                .role_arn
                .replace("{{.AccountID}}", &account.id)
        };

        debug!(
            target_name = %target_name,
            account_id = %account.id,
            region = %region,
            "discovered target"
        );

        discovered.insert(
            target_name,
            Target {
                account_id: account.id,
                imports: dynamic_target.imports.clone(),
                region,
                secret_prefix: dynamic_target.secret_prefix.clone(),
                role_arn,
            },
        );
    }
}

fn is_excluded(account_id: &str, exclude: &[String]) -> bool {
    exclude.iter().any(|e| e == account_id)
}

/// Sanitizes an account name into a target name: spaces and dashes become
/// underscores, anything outside `[A-Za-z0-9_]` is dropped.
pub fn sanitize_target_name(name: &str) -> String {
    name.chars()
        .map(|c| if c == ' ' || c == '-' { '_' } else { c })
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_')
        .collect()
}

fn deduplicate_accounts(accounts: Vec<AccountInfo>) -> Vec<AccountInfo> {
    let mut seen = std::collections::HashSet::new();
    accounts
        .into_iter()
        .filter(|a| seen.insert(a.id.clone()))
        .collect()
}

fn filter_accounts_by_tags(
    accounts: Vec<AccountInfo>,
    required: &BTreeMap<String, String>,
) -> Vec<AccountInfo> {
    accounts
        .into_iter()
        .filter(|account| {
            !account.tags.is_empty()
                && required
                    .iter()
                    .all(|(k, v)| account.tags.get(k) == Some(v))
        })
        .collect()
}

/// Expands dynamic targets in place, merging the discovered targets with
/// the static map. A static target of the same name is preserved.
pub async fn expand_dynamic_targets(cfg: &mut Config, ctx: &ExecutionContext) -> Result<()> {
    if cfg.dynamic_targets.is_empty() {
        return Ok(());
    }

    info!("expanding dynamic targets");
    let discovered = DiscoveryService::new(ctx, cfg)
        .discover_targets()
        .await
        .context("failed to discover dynamic targets")?;

    for (name, target) in discovered {
        if cfg.targets.contains_key(&name) {
            warn!(target = %name, "dynamic target name conflicts with static target, skipping");
            continue;
        }
        cfg.targets.insert(name, target);
    }

    info!(total_targets = cfg.targets.len(), "dynamic targets expanded");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_json_object_array() {
        let accounts = parse_accounts_value(
            r#"[{"id": "111111111111", "name": "Sandbox One"}, {"id": "222222222222"}]"#,
        );
        assert_eq!(accounts.len(), 2);
        assert_eq!(accounts[0].id, "111111111111");
        assert_eq!(accounts[0].name, "Sandbox One");
        assert_eq!(accounts[1].id, "222222222222");
    }

    #[test]
    fn parse_json_string_array() {
        let accounts = parse_accounts_value(r#"["111111111111","222222222222"]"#);
        assert_eq!(accounts.len(), 2);
        assert_eq!(accounts[0].id, "111111111111");
        assert_eq!(accounts[1].id, "222222222222");
    }

    #[test]
    fn parse_comma_separated_list() {
        let accounts = parse_accounts_value("111111111111, 222222222222,,333333333333");
        assert_eq!(accounts.len(), 3);
        assert_eq!(accounts[2].id, "333333333333");
    }

    #[test]
    fn sanitize_names() {
        assert_eq!(sanitize_target_name("Analytics Sandbox-01"), "Analytics_Sandbox_01");
        assert_eq!(sanitize_target_name("weird!@#name"), "weirdname");
        assert_eq!(sanitize_target_name("日本語"), "");
    }

    #[test]
    fn accounts_list_expansion_honors_exclusions() {
        // parameter value ["111111111111","222222222222"] expands into two
        // targets; an exclusion entry reduces that to one
        let accounts = parse_accounts_value(r#"["111111111111","222222222222"]"#);
        assert_eq!(accounts.len(), 2);

        let dynamic = DynamicTarget {
            imports: vec!["analytics".to_string()],
            role_arn: "arn:aws:iam::{{.AccountID}}:role/Sandbox".to_string(),
            ..Default::default()
        };

        let mut discovered = BTreeMap::new();
        accounts_into_targets(&dynamic, accounts.clone(), "us-east-1", &mut discovered);
        assert_eq!(discovered.len(), 2);
        let target = &discovered["account_111111111111"];
        assert_eq!(target.account_id, "111111111111");
        assert_eq!(target.imports, vec!["analytics"]);
        assert_eq!(target.region, "us-east-1");
        assert_eq!(
            target.role_arn,
            "arn:aws:iam::111111111111:role/Sandbox"
        );

        let excluded = DynamicTarget {
            exclude: vec!["222222222222".to_string()],
            ..dynamic
        };
        let mut discovered = BTreeMap::new();
        accounts_into_targets(&excluded, accounts, "us-east-1", &mut discovered);
        assert_eq!(discovered.len(), 1);
        assert!(discovered.contains_key("account_111111111111"));
    }

    #[test]
    fn name_collisions_get_account_suffix() {
        let accounts = vec![
            AccountInfo {
                id: "111111111111".to_string(),
                name: "Sandbox".to_string(),
                ..Default::default()
            },
            AccountInfo {
                id: "222222222222".to_string(),
                name: "Sandbox".to_string(),
                ..Default::default()
            },
        ];

        let mut discovered = BTreeMap::new();
        accounts_into_targets(&DynamicTarget::default(), accounts, "us-east-1", &mut discovered);
        assert_eq!(discovered.len(), 2);
        assert!(discovered.contains_key("Sandbox"));
        assert!(discovered.contains_key("Sandbox_222222"));
    }

    #[test]
    fn dedupe_preserves_first() {
        let accounts = vec![
            AccountInfo {
                id: "1".to_string(),
                name: "first".to_string(),
                ..Default::default()
            },
            AccountInfo {
                id: "1".to_string(),
                name: "second".to_string(),
                ..Default::default()
            },
            AccountInfo {
                id: "2".to_string(),
                ..Default::default()
            },
        ];
        let deduped = deduplicate_accounts(accounts);
        assert_eq!(deduped.len(), 2);
        assert_eq!(deduped[0].name, "first");
    }

    #[test]
    fn tag_filter_is_a_conjunction() {
        let mut tags = BTreeMap::new();
        tags.insert("env".to_string(), "sandbox".to_string());
        tags.insert("team".to_string(), "analytics".to_string());

        let accounts = vec![
            AccountInfo {
                id: "1".to_string(),
                tags: tags.clone(),
                ..Default::default()
            },
            AccountInfo {
                id: "2".to_string(),
                tags: {
                    let mut t = BTreeMap::new();
                    t.insert("env".to_string(), "sandbox".to_string());
                    t
                },
                ..Default::default()
            },
            AccountInfo {
                id: "3".to_string(),
                ..Default::default()
            },
        ];

        let filtered = filter_accounts_by_tags(accounts, &tags);
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].id, "1");
    }
}
