// src/recipe/graph.rs

//! Dependency graph over the fleet
//!
//! Directed graph used for build ordering. Topological sort is Kahn's
//! algorithm; when it cannot complete, the offending cycle is enumerated via
//! DFS so the error names its members instead of just "cycle detected".

use crate::error::{Error, Result};
use std::collections::{HashMap, HashSet, VecDeque};

/// A directed dependency graph keyed by package name
#[derive(Debug, Default)]
pub struct DependencyGraph {
    /// name -> set of names it depends on
    edges: HashMap<String, HashSet<String>>,
    /// name -> set of names depending on it
    reverse_edges: HashMap<String, HashSet<String>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a package with its dependencies. Re-adding merges edges.
    pub fn add_package(&mut self, name: &str, dependencies: &[String]) {
        self.edges.entry(name.to_string()).or_default();
        self.reverse_edges.entry(name.to_string()).or_default();

        for dep in dependencies {
            self.edges.entry(dep.clone()).or_default();
            self.reverse_edges.entry(dep.clone()).or_default();

            self.edges
                .get_mut(name)
                .expect("node inserted above")
                .insert(dep.clone());
            self.reverse_edges
                .get_mut(dep)
                .expect("node inserted above")
                .insert(name.to_string());
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.edges.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    /// Direct dependencies of one package.
    pub fn dependencies(&self, name: &str) -> Option<&HashSet<String>> {
        self.edges.get(name)
    }

    /// Packages that directly depend on `name`.
    pub fn dependents(&self, name: &str) -> Option<&HashSet<String>> {
        self.reverse_edges.get(name)
    }

    /// All packages `name` transitively depends on (excluding itself).
    pub fn transitive_dependencies(&self, name: &str) -> HashSet<String> {
        self.walk(name, &self.edges)
    }

    /// All packages transitively depending on `name` (excluding itself).
    pub fn transitive_dependents(&self, name: &str) -> HashSet<String> {
        self.walk(name, &self.reverse_edges)
    }

    fn walk(&self, start: &str, edges: &HashMap<String, HashSet<String>>) -> HashSet<String> {
        let mut seen = HashSet::new();
        let mut queue: VecDeque<String> = edges
            .get(start)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default();

        while let Some(node) = queue.pop_front() {
            if seen.insert(node.clone()) {
                if let Some(next) = edges.get(&node) {
                    for n in next {
                        if !seen.contains(n) {
                            queue.push_back(n.clone());
                        }
                    }
                }
            }
        }

        seen
    }

    /// Topological sort: every dependency precedes its dependents. Ties are
    /// broken alphabetically so the ordering is deterministic. A cycle fails
    /// the whole call with the detected cycle as the reason.
    pub fn topological_sort(&self) -> Result<Vec<String>> {
        let mut in_degrees: HashMap<&str, usize> = self
            .edges
            .iter()
            .map(|(name, deps)| (name.as_str(), deps.len()))
            .collect();

        let mut ready: Vec<&str> = in_degrees
            .iter()
            .filter(|&(_, deg)| *deg == 0)
            .map(|(name, _)| *name)
            .collect();
        ready.sort_unstable();
        let mut queue: VecDeque<&str> = ready.into();

        let mut order = Vec::with_capacity(self.edges.len());

        while let Some(node) = queue.pop_front() {
            order.push(node.to_string());

            if let Some(dependents) = self.reverse_edges.get(node) {
                let mut newly_ready = Vec::new();
                for dependent in dependents {
                    if let Some(deg) = in_degrees.get_mut(dependent.as_str()) {
                        *deg = deg.saturating_sub(1);
                        if *deg == 0 {
                            newly_ready.push(dependent.as_str());
                        }
                    }
                }
                newly_ready.sort_unstable();
                queue.extend(newly_ready);
            }
        }

        if order.len() != self.edges.len() {
            return Err(Error::CycleDetected(self.find_cycle()));
        }

        Ok(order)
    }

    /// Locate one cycle for error reporting. Only called when the sort has
    /// already proven a cycle exists.
    fn find_cycle(&self) -> Vec<String> {
        let mut visited = HashSet::new();
        let mut stack = HashSet::new();
        let mut path = Vec::new();

        let mut starts: Vec<&String> = self.edges.keys().collect();
        starts.sort_unstable();

        for start in starts {
            if !visited.contains(start.as_str()) {
                if let Some(cycle) =
                    self.cycle_dfs(start, &mut visited, &mut stack, &mut path)
                {
                    return cycle;
                }
            }
        }

        Vec::new()
    }

    fn cycle_dfs(
        &self,
        node: &str,
        visited: &mut HashSet<String>,
        stack: &mut HashSet<String>,
        path: &mut Vec<String>,
    ) -> Option<Vec<String>> {
        visited.insert(node.to_string());
        stack.insert(node.to_string());
        path.push(node.to_string());

        if let Some(deps) = self.edges.get(node) {
            let mut deps: Vec<&String> = deps.iter().collect();
            deps.sort_unstable();

            for dep in deps {
                if stack.contains(dep.as_str()) {
                    let start = path
                        .iter()
                        .position(|x| x == dep)
                        .expect("member of the recursion stack is on the path");
                    let mut cycle: Vec<String> = path[start..].to_vec();
                    cycle.push(dep.clone());
                    return Some(cycle);
                }
                if !visited.contains(dep.as_str()) {
                    if let Some(cycle) = self.cycle_dfs(dep, visited, stack, path) {
                        return Some(cycle);
                    }
                }
            }
        }

        path.pop();
        stack.remove(node);
        None
    }
}
