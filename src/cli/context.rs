//! `context` subcommand: show the AWS execution context and posture
//! recommendations.

use anyhow::{Context, Result};

use crate::aws::context::ExecutionContext;
use crate::config::{AwsConfig, Config};

pub async fn run(config_path: &str) -> Result<()> {
    // a config file is optional here; fall back to sensible defaults
    let aws_config: AwsConfig = if std::path::Path::new(config_path).exists() {
        let config = Config::load(config_path)
            .with_context(|| format!("failed to load config file '{config_path}'"))?;
        config.aws
    } else {
        let mut aws = AwsConfig {
            region: "us-east-1".to_string(),
            ..Default::default()
        };
        aws.control_tower.enabled = true;
        aws.control_tower.execution_role.name = "AWSControlTowerExecution".to_string();
        aws
    };

    let ctx = ExecutionContext::new(&aws_config)
        .await
        .context("failed to create AWS execution context")?;

    println!("{}", "=".repeat(60));
    println!("AWS Execution Context");
    println!("{}", "=".repeat(60));
    println!();
    print!("{}", ctx.summary());

    println!();
    println!("{}", "-".repeat(60));
    println!("Recommendations:");
    println!();

    match &ctx.organization_info {
        Some(info) if info.is_management_account => {
            println!("⚠️  Running from MANAGEMENT ACCOUNT");
            println!("   This is not recommended for production workloads.");
            println!("   Consider setting up a delegated administrator account.");
            println!();
            println!("   To delegate SSO administration:");
            println!("   aws organizations register-delegated-administrator \\");
            println!("     --account-id <ADMIN_ACCOUNT_ID> \\");
            println!("     --service-principal sso.amazonaws.com");
        }
        Some(info) if info.is_delegated_admin => {
            println!("✅ Running from DELEGATED ADMINISTRATOR account");
            println!("   This is the recommended configuration.");
            if !ctx.can_access_identity_center() {
                println!();
                println!("⚠️  No Identity Center delegation detected.");
                println!("   Dynamic target discovery may not work.");
            }
        }
        _ => {
            println!("ℹ️  Running from MEMBER ACCOUNT");
            println!("   Ensure cross-account roles are deployed to target accounts.");
            println!("   Control Tower execution role or custom role required.");
        }
    }

    println!();
    println!("{}", "-".repeat(60));
    println!("Cross-Account Role Pattern:");
    println!();
    let example_account = "123456789012";
    let role_arn = ctx
        .get_role_arn(example_account)
        .unwrap_or_else(|| "(none - same account)".to_string());
    println!("   Example: {role_arn}");
    println!();
    println!("   This role will be assumed in each target account.");
    println!("   Ensure the role exists and trusts this account.");

    Ok(())
}
