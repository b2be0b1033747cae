//! `graph` subcommand: render the dependency graph as text or DOT.

use anyhow::{Context, Result};

use crate::config::Config;
use crate::graph::{Graph, NodeKind};

pub fn run(config_path: &str, format: &str) -> Result<()> {
    let config = Config::load(config_path).context("failed to load config")?;
    let graph = Graph::build(&config).context("failed to build graph")?;

    match format {
        "dot" => print_dot_graph(&config, &graph),
        _ => print_text_graph(&config, &graph),
    }
    Ok(())
}

fn print_text_graph(config: &Config, graph: &Graph) {
    println!("Secrets Pipeline Dependency Graph");
    println!("{}", "=".repeat(50));

    println!("\n📦 Sources:");
    for (name, source) in &config.sources {
        if let Some(vault) = &source.vault {
            println!("   {name} (vault: {})", vault.mount);
        } else if let Some(aws) = &source.aws {
            println!("   {name} (aws: {})", aws.account_id);
        }
    }

    println!("\n🎯 Targets (by dependency level):");
    for (level_idx, level) in graph.group_by_level().iter().enumerate() {
        if level.is_empty() {
            continue;
        }
        println!("\n   Level {level_idx}:");
        for name in level {
            let Some(target) = config.targets.get(name) else {
                continue;
            };

            let mut sources = Vec::new();
            let mut inherited = Vec::new();
            for import in &target.imports {
                if config.targets.contains_key(import) {
                    inherited.push(import.as_str());
                } else {
                    sources.push(import.as_str());
                }
            }

            println!("   ├── {name} (account: {})", target.account_id);
            if !sources.is_empty() {
                println!("   │   └── sources: {sources:?}");
            }
            if !inherited.is_empty() {
                println!("   │   └── inherits: {inherited:?}");
            }
        }
    }

    println!("\n📋 Execution Order:");
    for (i, name) in graph.topological_order().iter().enumerate() {
        println!("   {}. {name}", i + 1);
    }

    println!("\n🔗 Inheritance Flow:");
    let mut roots: Vec<&String> = config
        .targets
        .keys()
        .filter(|name| !config.is_inherited_target(name))
        .collect();
    roots.sort();
    for root in roots {
        print_inheritance_tree(config, graph, root, "   ", true);
    }
}

fn print_inheritance_tree(
    config: &Config,
    graph: &Graph,
    name: &str,
    prefix: &str,
    is_last: bool,
) {
    let connector = if is_last { "└──" } else { "├──" };
    let account = config
        .targets
        .get(name)
        .map(|t| t.account_id.as_str())
        .unwrap_or("?");
    println!("{prefix}{connector} {name} (→ {account})");

    let mut children: Vec<String> = graph
        .nodes
        .get(name)
        .map(|node| node.depended_by.clone())
        .unwrap_or_default();
    children.sort();

    let child_prefix = if is_last {
        format!("{prefix}    ")
    } else {
        format!("{prefix}│   ")
    };
    let count = children.len();
    for (i, child) in children.iter().enumerate() {
        print_inheritance_tree(config, graph, child, &child_prefix, i == count - 1);
    }
}

fn print_dot_graph(config: &Config, graph: &Graph) {
    println!("digraph secrets_pipeline {{");
    println!("  rankdir=LR;");
    println!("  node [shape=box];");
    println!();

    println!("  subgraph cluster_sources {{");
    println!("    label=\"Sources\";");
    println!("    style=dashed;");
    println!("    color=blue;");
    for name in config.sources.keys() {
        println!("    \"{name}\" [shape=cylinder, color=blue];");
    }
    println!("  }}");
    println!();

    println!("  subgraph cluster_targets {{");
    println!("    label=\"Targets\";");
    println!("    style=dashed;");
    println!("    color=green;");
    for (name, target) in &config.targets {
        println!(
            "    \"{name}\" [label=\"{name}\\n{}\", color=green];",
            target.account_id
        );
    }
    println!("  }}");
    println!();

    println!("  // Dependencies");
    for (name, target) in &config.targets {
        for import in &target.imports {
            let style = if graph
                .nodes
                .get(import)
                .is_some_and(|n| n.kind == NodeKind::Target)
            {
                "bold" // inheritance edge
            } else {
                "solid"
            };
            println!("  \"{import}\" -> \"{name}\" [style={style}];");
        }
    }

    println!("}}");
}
