//! `pipeline` subcommand: run merge + sync with diff reporting.

use anyhow::{bail, Result};
use tracing::{info, warn};

use crate::diff::OutputFormat;
use crate::observability;
use crate::pipeline::{Operation, Options, Pipeline, TargetResult};

pub struct PipelineArgs {
    pub config: String,
    pub targets: Option<String>,
    pub merge_only: bool,
    pub sync_only: bool,
    pub dry_run: bool,
    pub discover: bool,
    pub output: String,
    pub diff: bool,
    pub exit_code: bool,
}

pub async fn run(args: PipelineArgs) -> Result<()> {
    let config = crate::config::Config::load(&args.config)?;
    observability::init_logging(&config.log)?;

    let pipeline = if args.discover {
        info!("dynamic target discovery enabled");
        Pipeline::from_file_with_context(&args.config).await?
    } else {
        Pipeline::from_file(&args.config)?
    };

    // ctrl-c stops scheduling new targets
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("received shutdown signal");
            let _ = shutdown_tx.send(true);
        }
    });

    let target_list: Vec<String> = args
        .targets
        .as_deref()
        .unwrap_or_default()
        .split(',')
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .collect();

    let operation = if args.merge_only {
        Operation::Merge
    } else if args.sync_only {
        Operation::Sync
    } else {
        Operation::Pipeline
    };

    let format = OutputFormat::parse(&args.output);
    let opts = Options {
        operation,
        targets: target_list.clone(),
        dry_run: args.dry_run,
        continue_on_error: true,
        parallelism: 0,
        compute_diff: args.diff || args.dry_run,
        shutdown: Some(shutdown_rx),
    };

    info!(
        config = %args.config,
        targets = ?target_list,
        operation = %operation,
        dry_run = args.dry_run,
        "starting pipeline"
    );

    let run_result = pipeline.run(opts).await;

    if pipeline.diff().is_some() {
        let diff_output = pipeline.format_diff(format);
        if !diff_output.is_empty() {
            println!("{diff_output}");
        }
    } else {
        print_results(&pipeline.results());
    }

    if args.exit_code {
        // run errors map to 2; otherwise the diff decides 0 or 1
        if let Err(e) = &run_result {
            eprintln!("Error: {e:#}");
            std::process::exit(2);
        }
        let code = pipeline.exit_code();
        if code != 0 {
            std::process::exit(code);
        }
        return Ok(());
    }

    let results = match run_result {
        Ok(results) => results,
        Err(e) => return Err(e),
    };
    if results.iter().any(|r| !r.success) {
        bail!("pipeline completed with errors");
    }

    info!("pipeline completed successfully");
    Ok(())
}

fn print_results(results: &[TargetResult]) {
    println!("\n{}", "=".repeat(60));
    println!("Pipeline Results");
    println!("{}", "=".repeat(60));

    let mut merge_results: Vec<&TargetResult> =
        results.iter().filter(|r| r.phase == "merge").collect();
    let mut sync_results: Vec<&TargetResult> =
        results.iter().filter(|r| r.phase == "sync").collect();
    merge_results.sort_by(|a, b| a.target.cmp(&b.target));
    sync_results.sort_by(|a, b| a.target.cmp(&b.target));

    if !merge_results.is_empty() {
        println!("\nMerge Phase:");
        for result in &merge_results {
            let status = if result.success { "✅" } else { "❌" };
            println!(
                "  {status} {} ({:.2}s)",
                result.target,
                result.duration.as_secs_f64()
            );
            if let Some(error) = &result.error {
                println!("      Error: {error}");
            }
        }
    }

    if !sync_results.is_empty() {
        println!("\nSync Phase:");
        for result in &sync_results {
            let status = if result.success { "✅" } else { "❌" };
            println!(
                "  {status} {} ({:.2}s)",
                result.target,
                result.duration.as_secs_f64()
            );
            if let Some(error) = &result.error {
                println!("      Error: {error}");
            }
        }
    }

    let success_count = results.iter().filter(|r| r.success).count();
    println!("\nTotal: {success_count}/{} succeeded", results.len());
    println!("{}", "=".repeat(60));
}
