//! # Dependency Graph
//!
//! Builds and orders the import graph over sources and targets.
//!
//! Sources are leaves at level 0. A target's level is one more than the
//! deepest of its imports, so walking levels in ascending order guarantees
//! every dependency is materialized before its dependents run.

use std::collections::HashMap;

use thiserror::Error;

use crate::config::Config;

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("target {target:?} imports unknown source/target {import:?}")]
    UnknownImport { target: String, import: String },
    #[error("circular dependency detected involving {0:?}")]
    CircularDependency(String),
}

/// Node kind in the dependency graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Source,
    Target,
}

/// A node in the dependency graph. Edges are name references into the
/// owning graph's node map, not pointers.
#[derive(Debug, Clone)]
pub struct Node {
    pub name: String,
    pub kind: NodeKind,
    /// Dependency depth; 0 for sources and targets with no imports.
    pub level: usize,
    /// Names this node depends on.
    pub deps: Vec<String>,
    /// Names that depend on this node.
    pub depended_by: Vec<String>,
}

/// Dependency graph over the configured sources and targets.
#[derive(Debug, Default)]
pub struct Graph {
    pub nodes: HashMap<String, Node>,
}

impl Graph {
    /// Builds the graph from a validated configuration.
    pub fn build(cfg: &Config) -> Result<Self, GraphError> {
        let mut graph = Graph::default();

        for name in cfg.sources.keys() {
            graph.nodes.insert(
                name.clone(),
                Node {
                    name: name.clone(),
                    kind: NodeKind::Source,
                    level: 0,
                    deps: Vec::new(),
                    depended_by: Vec::new(),
                },
            );
        }

        for name in cfg.targets.keys() {
            graph.nodes.insert(
                name.clone(),
                Node {
                    name: name.clone(),
                    kind: NodeKind::Target,
                    level: 0,
                    deps: Vec::new(),
                    depended_by: Vec::new(),
                },
            );
        }

        for (name, target) in &cfg.targets {
            for import in &target.imports {
                if !graph.nodes.contains_key(import) {
                    return Err(GraphError::UnknownImport {
                        target: name.clone(),
                        import: import.clone(),
                    });
                }
                if let Some(node) = graph.nodes.get_mut(name) {
                    node.deps.push(import.clone());
                }
                if let Some(dep) = graph.nodes.get_mut(import) {
                    dep.depended_by.push(name.clone());
                }
            }
        }

        graph.calculate_levels()?;
        Ok(graph)
    }

    /// Computes node levels via memoized DFS. Re-entering a node that is
    /// still on the stack means the import relation has a cycle.
    fn calculate_levels(&mut self) -> Result<(), GraphError> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            InStack,
            Done,
        }

        fn visit(
            name: &str,
            nodes: &HashMap<String, Node>,
            marks: &mut HashMap<String, Mark>,
            levels: &mut HashMap<String, usize>,
        ) -> Result<usize, GraphError> {
            match marks.get(name) {
                Some(Mark::InStack) => {
                    return Err(GraphError::CircularDependency(name.to_string()))
                }
                Some(Mark::Done) => return Ok(levels[name]),
                None => {}
            }

            let node = &nodes[name];
            if node.kind == NodeKind::Source {
                marks.insert(name.to_string(), Mark::Done);
                levels.insert(name.to_string(), 0);
                return Ok(0);
            }

            marks.insert(name.to_string(), Mark::InStack);
            let mut level = 0;
            for dep in &node.deps {
                level = level.max(visit(dep, nodes, marks, levels)? + 1);
            }
            marks.insert(name.to_string(), Mark::Done);
            levels.insert(name.to_string(), level);
            Ok(level)
        }

        let mut marks = HashMap::new();
        let mut levels = HashMap::new();
        let names: Vec<String> = self.nodes.keys().cloned().collect();
        for name in &names {
            visit(name, &self.nodes, &mut marks, &mut levels)?;
        }
        for (name, level) in levels {
            if let Some(node) = self.nodes.get_mut(&name) {
                node.level = level;
            }
        }
        Ok(())
    }

    /// Target names in dependency order: by level, then by name.
    pub fn topological_order(&self) -> Vec<String> {
        let mut targets: Vec<&Node> = self
            .nodes
            .values()
            .filter(|n| n.kind == NodeKind::Target)
            .collect();
        targets.sort_by(|a, b| a.level.cmp(&b.level).then_with(|| a.name.cmp(&b.name)));
        targets.into_iter().map(|n| n.name.clone()).collect()
    }

    /// Target names grouped by level; each group sorted by name.
    pub fn group_by_level(&self) -> Vec<Vec<String>> {
        let max_level = self
            .nodes
            .values()
            .filter(|n| n.kind == NodeKind::Target)
            .map(|n| n.level)
            .max()
            .unwrap_or(0);

        let mut levels = vec![Vec::new(); max_level + 1];
        for node in self.nodes.values() {
            if node.kind == NodeKind::Target {
                levels[node.level].push(node.name.clone());
            }
        }
        for level in &mut levels {
            level.sort();
        }
        levels
    }

    /// Expands the requested targets to include every target-typed
    /// dependency, sorted like `topological_order`. Sources are never
    /// emitted. Unknown names pass through so the caller can report them.
    pub fn include_dependencies(&self, requested: &[String]) -> Vec<String> {
        fn add(name: &str, graph: &Graph, included: &mut Vec<String>) {
            if included.iter().any(|n| n == name) {
                return;
            }
            included.push(name.to_string());
            if let Some(node) = graph.nodes.get(name) {
                for dep in &node.deps {
                    if graph
                        .nodes
                        .get(dep)
                        .is_some_and(|d| d.kind == NodeKind::Target)
                    {
                        add(dep, graph, included);
                    }
                }
            }
        }

        let mut included = Vec::new();
        for name in requested {
            add(name, self, &mut included);
        }
        included.sort_by(|a, b| {
            let la = self.nodes.get(a).map(|n| n.level).unwrap_or(0);
            let lb = self.nodes.get(b).map(|n| n.level).unwrap_or(0);
            la.cmp(&lb).then_with(|| a.cmp(b))
        });
        included
    }

    /// Plain-text rendering used by logs and the `graph` subcommand.
    pub fn render_text(&self) -> String {
        let mut out = String::from("Dependency Graph:\n");
        for (i, level) in self.group_by_level().iter().enumerate() {
            out.push_str(&format!("  Level {i}: {level:?}\n"));
        }
        out.push_str("\nInheritance:\n");
        for name in self.topological_order() {
            let node = &self.nodes[&name];
            let target_deps: Vec<&String> = node
                .deps
                .iter()
                .filter(|d| {
                    self.nodes
                        .get(*d)
                        .is_some_and(|n| n.kind == NodeKind::Target)
                })
                .collect();
            if !target_deps.is_empty() {
                out.push_str(&format!("  {name} <- {target_deps:?}\n"));
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn config_with_chain() -> Config {
        // Stg imports both sources; Prod inherits Stg; Demo inherits Prod.
        let yaml = r#"
vault:
  address: https://vault.example.com
sources:
  analytics:
    vault:
      mount: analytics
  analytics-engineers:
    vault:
      mount: analytics-engineers
merge_store:
  vault:
    mount: merged
targets:
  Stg:
    account_id: "111111111111"
    imports: [analytics, analytics-engineers]
  Prod:
    account_id: "222222222222"
    imports: [Stg]
  Demo:
    account_id: "333333333333"
    imports: [Prod]
"#;
        Config::from_yaml(yaml).unwrap()
    }

    #[test]
    fn levels_follow_inheritance_chain() {
        let graph = Graph::build(&config_with_chain()).unwrap();
        assert_eq!(graph.nodes["analytics"].level, 0);
        assert_eq!(graph.nodes["Stg"].level, 1);
        assert_eq!(graph.nodes["Prod"].level, 2);
        assert_eq!(graph.nodes["Demo"].level, 3);
    }

    #[test]
    fn topological_order_is_base_first() {
        let graph = Graph::build(&config_with_chain()).unwrap();
        assert_eq!(graph.topological_order(), vec!["Stg", "Prod", "Demo"]);
    }

    #[test]
    fn include_dependencies_pulls_in_chain() {
        let graph = Graph::build(&config_with_chain()).unwrap();
        let expanded = graph.include_dependencies(&["Demo".to_string()]);
        assert_eq!(expanded, vec!["Stg", "Prod", "Demo"]);
        // idempotent
        assert_eq!(graph.include_dependencies(&expanded), expanded);
    }

    #[test]
    fn group_by_level_sorts_within_levels() {
        let graph = Graph::build(&config_with_chain()).unwrap();
        let levels = graph.group_by_level();
        assert_eq!(levels[1], vec!["Stg"]);
        assert_eq!(levels[2], vec!["Prod"]);
        assert_eq!(levels[3], vec!["Demo"]);
    }

    #[test]
    fn cycle_is_rejected() {
        let yaml = r#"
vault:
  address: https://vault.example.com
merge_store:
  vault:
    mount: merged
targets:
  A:
    account_id: "111111111111"
    imports: [B]
  B:
    account_id: "222222222222"
    imports: [C]
  C:
    account_id: "333333333333"
    imports: [A]
"#;
        let cfg = Config::from_yaml(yaml).unwrap();
        let err = Graph::build(&cfg).unwrap_err();
        assert!(err.to_string().contains("circular dependency"));
    }

    #[test]
    fn unknown_import_is_rejected() {
        let yaml = r#"
vault:
  address: https://vault.example.com
merge_store:
  vault:
    mount: merged
targets:
  A:
    account_id: "111111111111"
    imports: [missing]
"#;
        let cfg = Config::from_yaml(yaml).unwrap();
        let err = Graph::build(&cfg).unwrap_err();
        assert!(matches!(err, GraphError::UnknownImport { .. }));
    }

    #[test]
    fn edge_indices_respect_topology() {
        let graph = Graph::build(&config_with_chain()).unwrap();
        let order = graph.topological_order();
        let index = |n: &str| order.iter().position(|x| x == n).unwrap();
        for node in graph.nodes.values().filter(|n| n.kind == NodeKind::Target) {
            for dep in &node.deps {
                if graph.nodes[dep].kind == NodeKind::Target {
                    assert!(index(dep) < index(&node.name));
                }
            }
        }
    }
}
