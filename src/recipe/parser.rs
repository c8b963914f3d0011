// src/recipe/parser.rs

//! Recipe file loading and validation

use super::format::Recipe;
use crate::error::{Error, Result};
use serde_yaml::Value;
use std::fs;
use std::path::Path;

/// Parse a recipe document: either a single mapping or a sequence of them.
pub fn parse_recipes(contents: &str) -> Result<Vec<Recipe>> {
    let value: Value = serde_yaml::from_str(contents)?;

    let recipes = match value {
        Value::Sequence(items) => items
            .into_iter()
            .map(|item| serde_yaml::from_value(item).map_err(Error::from))
            .collect::<Result<Vec<Recipe>>>()?,
        Value::Mapping(_) => vec![serde_yaml::from_value(value)?],
        Value::Null => Vec::new(),
        other => {
            return Err(Error::SchemaError(format!(
                "recipe document must be a mapping or sequence, got {}",
                type_name(&other)
            )))
        }
    };

    for recipe in &recipes {
        validate(recipe)?;
    }

    Ok(recipes)
}

/// Parse one recipe file.
pub fn parse_recipe_file(path: &Path) -> Result<Vec<Recipe>> {
    let contents = fs::read_to_string(path)
        .map_err(|e| Error::IoError(format!("read {}: {e}", path.display())))?;

    parse_recipes(&contents)
        .map_err(|e| Error::SchemaError(format!("{}: {e}", path.display())))
}

fn validate(recipe: &Recipe) -> Result<()> {
    if recipe.name.is_empty() {
        return Err(Error::SchemaError("recipe with empty name".to_string()));
    }
    if recipe.name.contains('/') || recipe.name.contains("..") {
        return Err(Error::SchemaError(format!(
            "recipe name '{}' must not contain path separators",
            recipe.name
        )));
    }
    if recipe.version.is_empty() {
        return Err(Error::SchemaError(format!(
            "recipe '{}' has an empty version",
            recipe.name
        )));
    }
    for dep in &recipe.depends {
        if dep == &recipe.name {
            return Err(Error::CycleDetected(vec![
                recipe.name.clone(),
                recipe.name.clone(),
            ]));
        }
    }
    for env in &recipe.environment {
        if !env.contains('=') {
            return Err(Error::SchemaError(format!(
                "recipe '{}': environment entry '{env}' is not KEY=VALUE",
                recipe.name
            )));
        }
    }
    Ok(())
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Sequence(_) => "sequence",
        Value::Mapping(_) => "mapping",
        Value::Tagged(_) => "tagged value",
    }
}
