// src/recipe/store.rs

//! Recipe store: loads and indexes the fleet

use super::format::Recipe;
use super::graph::DependencyGraph;
use super::parser::parse_recipe_file;
use crate::error::{Error, Result};
use std::collections::HashMap;
use std::path::Path;
use tracing::debug;

/// All recipes known to a run, indexed by name
#[derive(Debug, Default)]
pub struct RecipeStore {
    recipes: HashMap<String, Recipe>,
}

impl RecipeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load every `*.yml` / `*.yaml` file directly under `dir`.
    pub fn load_dir(dir: &Path) -> Result<Self> {
        let mut store = Self::new();

        let entries = std::fs::read_dir(dir)
            .map_err(|e| Error::IoError(format!("read recipe dir {}: {e}", dir.display())))?;

        let mut paths: Vec<_> = entries
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| {
                matches!(
                    p.extension().and_then(|e| e.to_str()),
                    Some("yml") | Some("yaml")
                )
            })
            .collect();
        paths.sort();

        for path in paths {
            for recipe in parse_recipe_file(&path)? {
                store.register(recipe)?;
            }
        }

        debug!(count = store.recipes.len(), dir = %dir.display(), "loaded fleet");
        Ok(store)
    }

    /// Register one recipe. `name` must be unique across the fleet.
    pub fn register(&mut self, recipe: Recipe) -> Result<()> {
        if let Some(existing) = self.recipes.get(&recipe.name) {
            return Err(Error::SchemaError(format!(
                "duplicate recipe '{}' (versions {} and {})",
                recipe.name, existing.version, recipe.version
            )));
        }
        self.recipes.insert(recipe.name.clone(), recipe);
        Ok(())
    }

    pub fn find(&self, name: &str) -> Result<&Recipe> {
        self.recipes
            .get(name)
            .ok_or_else(|| Error::RecipeNotFound(name.to_string()))
    }

    pub fn all(&self) -> Vec<&Recipe> {
        let mut all: Vec<&Recipe> = self.recipes.values().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    pub fn len(&self) -> usize {
        self.recipes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.recipes.is_empty()
    }

    /// Build the dependency graph over the whole fleet, verifying that every
    /// `depends` entry resolves.
    pub fn graph(&self) -> Result<DependencyGraph> {
        let mut graph = DependencyGraph::new();
        for recipe in self.recipes.values() {
            for dep in &recipe.depends {
                if !self.recipes.contains_key(dep) {
                    return Err(Error::RecipeNotFound(format!(
                        "{dep} (required by {})",
                        recipe.name
                    )));
                }
            }
            graph.add_package(&recipe.name, &recipe.depends);
        }
        Ok(graph)
    }

    /// Topological build order over `subset` plus its transitive
    /// dependencies. An empty subset means the whole fleet.
    pub fn topological(&self, subset: &[String]) -> Result<Vec<&Recipe>> {
        let graph = self.graph()?;

        let wanted: std::collections::HashSet<String> = if subset.is_empty() {
            self.recipes.keys().cloned().collect()
        } else {
            let mut wanted = std::collections::HashSet::new();
            for name in subset {
                // Unknown target fails the call before anything is started
                self.find(name)?;
                wanted.insert(name.clone());
                wanted.extend(graph.transitive_dependencies(name));
            }
            wanted
        };

        let order = graph.topological_sort()?;
        order
            .into_iter()
            .filter(|name| wanted.contains(name))
            .map(|name| self.find(&name))
            .collect()
    }
}
