//! Node dependency graph

use crate::error::{KeelError, Result};
use crate::registry::NodeRegistry;
use std::collections::{HashMap, HashSet};

/// Which nodes must be ready before a node may start
///
/// Built from the registry: the primary depends on nothing, secondary
/// masters depend on the primary, workers depend on every master.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    /// Nodes in declaration order
    nodes: Vec<String>,
    deps: HashMap<String, Vec<String>>,
    /// Topological order
    order: Vec<String>,
}

impl DependencyGraph {
    pub fn from_registry(registry: &NodeRegistry) -> Result<Self> {
        let primary = registry.primary()?.id.clone();
        let masters: Vec<String> = registry.masters().iter().map(|n| n.id.clone()).collect();

        let edges = registry
            .all()
            .iter()
            .map(|node| {
                let deps = if node.is_primary() {
                    Vec::new()
                } else if node.is_master() {
                    vec![primary.clone()]
                } else {
                    masters.clone()
                };
                (node.id.clone(), deps)
            })
            .collect();

        Self::from_edges(edges)
    }

    /// Build from explicit `(node, dependencies)` pairs
    pub fn from_edges(edges: Vec<(String, Vec<String>)>) -> Result<Self> {
        let nodes: Vec<String> = edges.iter().map(|(id, _)| id.clone()).collect();
        let deps: HashMap<String, Vec<String>> = edges.into_iter().collect();

        for (id, node_deps) in &deps {
            for dep in node_deps {
                if !deps.contains_key(dep) {
                    return Err(KeelError::InvalidConfig(format!(
                        "{} depends on unknown node {}",
                        id, dep
                    )));
                }
            }
        }

        let mut graph = Self {
            nodes,
            deps,
            order: Vec::new(),
        };

        let mut visited = HashSet::new();
        let mut visiting = HashSet::new();
        let mut order = Vec::new();
        for id in &graph.nodes {
            graph.topological_sort(id, &mut visited, &mut visiting, &mut order)?;
        }
        graph.order = order;

        Ok(graph)
    }

    fn topological_sort(
        &self,
        node: &str,
        visited: &mut HashSet<String>,
        visiting: &mut HashSet<String>,
        order: &mut Vec<String>,
    ) -> Result<()> {
        if visited.contains(node) {
            return Ok(());
        }

        if visiting.contains(node) {
            return Err(KeelError::InvalidConfig(format!(
                "Circular dependency detected for node: {}",
                node
            )));
        }

        visiting.insert(node.to_string());

        for dep in self.dependencies(node) {
            self.topological_sort(dep, visited, visiting, order)?;
        }

        visiting.remove(node);
        visited.insert(node.to_string());
        order.push(node.to_string());

        Ok(())
    }

    /// Direct dependencies of a node
    pub fn dependencies(&self, node: &str) -> &[String] {
        self.deps.get(node).map(|d| d.as_slice()).unwrap_or(&[])
    }

    /// Nodes, dependencies before dependents
    pub fn order(&self) -> &[String] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Every node that directly or transitively depends on `node`
    pub fn dependents(&self, node: &str) -> Vec<String> {
        let mut found: HashSet<&str> = HashSet::new();
        let mut frontier = vec![node];

        while let Some(current) = frontier.pop() {
            for (id, deps) in &self.deps {
                if deps.iter().any(|d| d == current) && found.insert(id.as_str()) {
                    frontier.push(id.as_str());
                }
            }
        }

        self.order
            .iter()
            .filter(|id| found.contains(id.as_str()))
            .cloned()
            .collect()
    }

    /// Groups of nodes that may run concurrently, in dispatch order
    pub fn tiers(&self) -> Vec<Vec<String>> {
        let mut depth: HashMap<&str, usize> = HashMap::new();
        for id in &self.order {
            let d = self
                .dependencies(id)
                .iter()
                .filter_map(|dep| depth.get(dep.as_str()))
                .map(|d| d + 1)
                .max()
                .unwrap_or(0);
            depth.insert(id.as_str(), d);
        }

        let levels = depth.values().copied().max().map(|m| m + 1).unwrap_or(0);
        let mut tiers = vec![Vec::new(); levels];
        for id in &self.nodes {
            tiers[depth[id.as_str()]].push(id.clone());
        }
        tiers
    }
}
