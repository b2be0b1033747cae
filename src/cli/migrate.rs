//! `migrate` subcommand: convert a terraform-secretsmanager
//! targets/secrets/accounts triple into a pipeline configuration.

use std::collections::BTreeMap;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::config::{
    Config, ControlTowerConfig, ExecutionRoleConfig, MergeStoreConfig, MergeStoreVault, Source,
    Target, VaultConfig, VaultSource,
};

pub struct MigrateArgs {
    pub from: String,
    pub targets: Option<String>,
    pub secrets: Option<String>,
    pub accounts: Option<String>,
    pub output: String,
    pub vault_addr: Option<String>,
    pub vault_merge_mount: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct TerraformTarget {
    name: String,
    imports: Vec<String>,
    secrets: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct TerraformSecret {
    name: String,
    vault_path: String,
    vault_mount: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct TerraformAccount {
    name: String,
    account_id: String,
    region: String,
    role_arn: String,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct TerraformTargetsFile {
    targets: Vec<TerraformTarget>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct TerraformSecretsFile {
    secrets: Vec<TerraformSecret>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct TerraformAccountsFile {
    accounts: Vec<TerraformAccount>,
}

pub fn run(args: MigrateArgs) -> Result<()> {
    match args.from.as_str() {
        "terraform-secretsmanager" => migrate_terraform_secretsmanager(args),
        other => bail!("unsupported migration source: {other}"),
    }
}

fn migrate_terraform_secretsmanager(args: MigrateArgs) -> Result<()> {
    let targets_file = args
        .targets
        .as_deref()
        .context("--targets is required for terraform-secretsmanager migration")?;
    let secrets_file = args
        .secrets
        .as_deref()
        .context("--secrets is required for terraform-secretsmanager migration")?;
    let accounts_file = args
        .accounts
        .as_deref()
        .context("--accounts is required for terraform-secretsmanager migration")?;

    let targets = load_terraform_targets(targets_file).context("failed to load targets")?;
    let secrets = load_terraform_secrets(secrets_file).context("failed to load secrets")?;
    let accounts = load_terraform_accounts(accounts_file).context("failed to load accounts")?;

    let account_map: BTreeMap<&str, &TerraformAccount> = accounts
        .accounts
        .iter()
        .map(|a| (a.name.as_str(), a))
        .collect();

    let mut config = Config {
        vault: VaultConfig {
            address: resolve_vault_addr(args.vault_addr.as_deref()),
            ..Default::default()
        },
        merge_store: MergeStoreConfig {
            vault: Some(MergeStoreVault {
                mount: args.vault_merge_mount.clone(),
            }),
            ..Default::default()
        },
        ..Default::default()
    };
    config.aws.region = "us-east-1".to_string();
    config.aws.control_tower = ControlTowerConfig {
        enabled: true,
        execution_role: ExecutionRoleConfig {
            name: "AWSControlTowerExecution".to_string(),
            ..Default::default()
        },
        ..Default::default()
    };

    for secret in &secrets.secrets {
        let mount = if secret.vault_mount.is_empty() {
            "secret".to_string()
        } else {
            secret.vault_mount.clone()
        };
        config.sources.insert(
            sanitize_source_name(&secret.name),
            Source {
                vault: Some(VaultSource {
                    mount,
                    paths: vec![secret.vault_path.clone()],
                    ..Default::default()
                }),
                ..Default::default()
            },
        );
    }

    for target in &targets.targets {
        let Some(account) = account_map.get(target.name.as_str()) else {
            eprintln!("Warning: no account found for target {:?}, skipping", target.name);
            continue;
        };

        let mut imports: Vec<String> = target
            .secrets
            .iter()
            .map(|s| sanitize_source_name(s))
            .collect();
        imports.extend(target.imports.iter().cloned());

        config.targets.insert(
            target.name.clone(),
            Target {
                account_id: account.account_id.clone(),
                region: account.region.clone(),
                role_arn: account.role_arn.clone(),
                imports,
                ..Default::default()
            },
        );
    }

    let data = serde_yaml::to_string(&config).context("failed to marshal config")?;
    let header = "\
# Pipeline configuration migrated from terraform-aws-secretsmanager
# Generated by: sspctl migrate --from terraform-secretsmanager
#
# Review and adjust as needed:
# - Verify Vault address and authentication
# - Check source paths and mounts
# - Validate target account IDs and regions
# - Add any missing transforms or filters

";
    std::fs::write(&args.output, format!("{header}{data}"))
        .context("failed to write output")?;

    println!("✅ Migration complete!");
    println!("   Output: {}", args.output);
    println!("   Sources: {}", config.sources.len());
    println!("   Targets: {}", config.targets.len());
    println!();
    println!("Next steps:");
    println!("   1. Review the generated config: {}", args.output);
    println!("   2. Add Vault authentication (token, approle, etc.)");
    println!("   3. Validate: sspctl validate --config {}", args.output);
    println!("   4. Dry run: sspctl pipeline --config {} --dry-run", args.output);

    Ok(())
}

fn load_terraform_targets(path: &str) -> Result<TerraformTargetsFile> {
    let data = std::fs::read_to_string(path)?;
    if let Ok(file) = serde_yaml::from_str::<TerraformTargetsFile>(&data) {
        if !file.targets.is_empty() {
            return Ok(file);
        }
    }
    // alternative shape: a bare list at the root
    let targets: Vec<TerraformTarget> =
        serde_yaml::from_str(&data).context("failed to parse targets")?;
    Ok(TerraformTargetsFile { targets })
}

fn load_terraform_secrets(path: &str) -> Result<TerraformSecretsFile> {
    let data = std::fs::read_to_string(path)?;
    if let Ok(file) = serde_yaml::from_str::<TerraformSecretsFile>(&data) {
        if !file.secrets.is_empty() {
            return Ok(file);
        }
    }
    let secrets: Vec<TerraformSecret> =
        serde_yaml::from_str(&data).context("failed to parse secrets")?;
    Ok(TerraformSecretsFile { secrets })
}

fn load_terraform_accounts(path: &str) -> Result<TerraformAccountsFile> {
    let data = std::fs::read_to_string(path)?;
    if let Ok(file) = serde_yaml::from_str::<TerraformAccountsFile>(&data) {
        if !file.accounts.is_empty() {
            return Ok(file);
        }
    }
    // map of name -> account
    if let Ok(map) = serde_yaml::from_str::<BTreeMap<String, TerraformAccount>>(&data) {
        let accounts = map
            .into_iter()
            .map(|(name, mut account)| {
                account.name = name;
                account
            })
            .collect();
        return Ok(TerraformAccountsFile { accounts });
    }
    let accounts: Vec<TerraformAccount> =
        serde_yaml::from_str(&data).context("failed to parse accounts")?;
    Ok(TerraformAccountsFile { accounts })
}

fn resolve_vault_addr(flag: Option<&str>) -> String {
    if let Some(addr) = flag {
        if !addr.is_empty() {
            return addr.to_string();
        }
    }
    if let Ok(addr) = std::env::var("VAULT_ADDR") {
        if !addr.is_empty() {
            return addr;
        }
    }
    "https://vault.example.com".to_string()
}

fn sanitize_source_name(name: &str) -> String {
    let name = name.to_lowercase().replace(['/', '-'], "_");
    // drop a file extension if one is present
    match name.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem.to_string(),
        _ => name,
    }
}
