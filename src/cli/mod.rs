//! # sspctl CLI
//!
//! Command-line interface for the secrets synchronization pipeline.
//!
//! ## Usage
//!
//! ```bash
//! # Run the full pipeline (merge + sync)
//! sspctl pipeline --config config.yaml
//!
//! # Dry run with CI exit codes (0 = zero-sum, 1 = changes, 2 = errors)
//! sspctl pipeline --config config.yaml --dry-run --exit-code
//!
//! # GitHub Actions compatible output
//! sspctl pipeline --config config.yaml --dry-run --output github
//!
//! # Validate the configuration and dependency graph
//! sspctl validate --config config.yaml
//!
//! # Show the dependency graph
//! sspctl graph --config config.yaml --format dot
//!
//! # Show the AWS execution context and posture recommendations
//! sspctl context
//!
//! # Migrate a terraform-secretsmanager setup
//! sspctl migrate --from terraform-secretsmanager \
//!     --targets targets.yaml --secrets secrets.yaml --accounts accounts.yaml
//!
//! # Run the long-lived operator over a directory of sync specs
//! sspctl operator --config-dir /config/syncs --watch
//! ```

use anyhow::Result;
use clap::{Parser, Subcommand};

mod context;
mod graph;
mod migrate;
mod operator;
mod pipeline;
mod validate;

/// Secrets synchronization pipeline CLI.
#[derive(Parser)]
#[command(name = "sspctl")]
#[command(
    about = "Multi-store secrets synchronization pipeline",
    version,
    long_version = concat!(
        env!("CARGO_PKG_VERSION"),
        " (",
        env!("BUILD_GIT_HASH"),
        ", ",
        env!("BUILD_DATETIME"),
        ")"
    )
)]
struct Cli {
    /// Path to the pipeline configuration file
    #[arg(short, long, global = true, default_value = "config.yaml")]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full secrets pipeline (merge → sync)
    Pipeline {
        /// Comma-separated list of targets (default: all)
        #[arg(long)]
        targets: Option<String>,

        /// Only run the merge phase
        #[arg(long, conflicts_with = "sync_only")]
        merge_only: bool,

        /// Only run the sync phase
        #[arg(long)]
        sync_only: bool,

        /// Dry run mode (no changes)
        #[arg(long)]
        dry_run: bool,

        /// Enable dynamic target discovery from AWS Organizations/Identity Center
        #[arg(long)]
        discover: bool,

        /// Output format: human, json, github, compact
        #[arg(short, long, default_value = "human")]
        output: String,

        /// Compute and show the diff even when not in dry-run mode
        #[arg(long)]
        diff: bool,

        /// Use exit codes: 0=no changes, 1=changes, 2=errors (for CI/CD)
        #[arg(long)]
        exit_code: bool,
    },
    /// Validate the configuration and build the dependency graph
    Validate {
        /// Also probe the AWS execution context
        #[arg(long)]
        probe: bool,
    },
    /// Display the target dependency graph
    Graph {
        /// Output format (text, dot)
        #[arg(long, default_value = "text")]
        format: String,
    },
    /// Show the AWS execution context and posture recommendations
    Context,
    /// Migrate configuration from other secret management tools
    Migrate {
        /// Source format to migrate from (terraform-secretsmanager)
        #[arg(long)]
        from: String,

        /// Path to the targets configuration file
        #[arg(long)]
        targets: Option<String>,

        /// Path to the secrets configuration file
        #[arg(long)]
        secrets: Option<String>,

        /// Path to the accounts configuration file
        #[arg(long)]
        accounts: Option<String>,

        /// Output file path
        #[arg(long, default_value = "pipeline-config.yaml")]
        output: String,

        /// Vault address (or set VAULT_ADDR)
        #[arg(long)]
        vault_addr: Option<String>,

        /// Vault mount for merged secrets
        #[arg(long, default_value = "secret/merged")]
        vault_merge_mount: String,
    },
    /// Run the long-lived operator over file-system sync specs
    Operator {
        /// Directory holding declarative sync spec YAML files
        #[arg(long, default_value = "/config/syncs")]
        config_dir: String,

        /// Watch the directory and re-trigger on changes
        #[arg(long)]
        watch: bool,

        /// Trigger an initial sync for every loaded spec
        #[arg(long)]
        trigger_initial: bool,

        /// Worker pool size
        #[arg(long, default_value_t = 4)]
        workers: usize,
    },
}

/// Parses arguments and dispatches to the subcommand handlers.
pub async fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Pipeline {
            targets,
            merge_only,
            sync_only,
            dry_run,
            discover,
            output,
            diff,
            exit_code,
        } => {
            pipeline::run(pipeline::PipelineArgs {
                config: cli.config,
                targets,
                merge_only,
                sync_only,
                dry_run,
                discover,
                output,
                diff,
                exit_code,
            })
            .await
        }
        Commands::Validate { probe } => validate::run(&cli.config, probe).await,
        Commands::Graph { format } => graph::run(&cli.config, &format),
        Commands::Context => context::run(&cli.config).await,
        Commands::Migrate {
            from,
            targets,
            secrets,
            accounts,
            output,
            vault_addr,
            vault_merge_mount,
        } => migrate::run(migrate::MigrateArgs {
            from,
            targets,
            secrets,
            accounts,
            output,
            vault_addr,
            vault_merge_mount,
        }),
        Commands::Operator {
            config_dir,
            watch,
            trigger_initial,
            workers,
        } => operator::run(&config_dir, watch, trigger_initial, workers).await,
    }
}
