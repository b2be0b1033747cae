//! `validate` subcommand: parse, validate, build the graph, optionally
//! probe the cloud identity.

use anyhow::{Context, Result};

use crate::aws::context::ExecutionContext;
use crate::config::Config;
use crate::graph::Graph;
use crate::observability;

pub async fn run(config_path: &str, probe: bool) -> Result<()> {
    let config = Config::load(config_path)
        .with_context(|| format!("failed to load config file '{config_path}'"))?;
    observability::init_logging(&config.log)?;

    config.validate().context("configuration is invalid")?;
    let graph = Graph::build(&config).context("failed to build dependency graph")?;

    println!("✅ Configuration is valid");
    println!("   Sources: {}", config.sources.len());
    println!("   Targets: {}", config.targets.len());
    if !config.dynamic_targets.is_empty() {
        println!("   Dynamic targets: {}", config.dynamic_targets.len());
    }
    println!("   Execution order: {:?}", graph.topological_order());

    if probe {
        println!();
        println!("Probing AWS execution context...");
        let ctx = ExecutionContext::new(&config.aws)
            .await
            .context("failed to create AWS execution context")?;
        print!("{}", ctx.summary());
    }

    Ok(())
}
