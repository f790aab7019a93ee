//! Variables visible to templates

use serde::{Deserialize, Serialize};
use slimstate_core::TargetConfig;
use std::collections::HashMap;

/// Template context shared by every node in one invocation
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RenderContext {
    /// Project variables for `var()`
    pub vars: HashMap<String, serde_json::Value>,

    /// The active target, exposed as `target`
    pub target: TargetContext,
}

/// `target.*` values
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetContext {
    pub name: String,
    pub schema: String,
    pub database: String,
    #[serde(rename = "type")]
    pub target_type: String,
}

impl Default for TargetContext {
    fn default() -> Self {
        Self::from(&TargetConfig::default())
    }
}

impl From<&TargetConfig> for TargetContext {
    fn from(target: &TargetConfig) -> Self {
        Self {
            name: target.name.clone(),
            schema: target.schema.clone(),
            database: target.database.clone(),
            target_type: "postgres".to_string(),
        }
    }
}

impl RenderContext {
    /// Context for a target with no project variables
    pub fn for_target(target: &TargetConfig) -> Self {
        Self {
            vars: HashMap::new(),
            target: TargetContext::from(target),
        }
    }

    /// Add a project variable
    pub fn add_var(&mut self, key: impl Into<String>, value: serde_json::Value) -> &mut Self {
        self.vars.insert(key.into(), value);
        self
    }
}

/// Builder for RenderContext
pub struct RenderContextBuilder {
    context: RenderContext,
}

impl RenderContextBuilder {
    pub fn new(target: &TargetConfig) -> Self {
        Self {
            context: RenderContext::for_target(target),
        }
    }

    pub fn var(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.context.add_var(key, value);
        self
    }

    pub fn target_type(mut self, target_type: impl Into<String>) -> Self {
        self.context.target.target_type = target_type.into();
        self
    }

    pub fn build(self) -> RenderContext {
        self.context
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_context_mirrors_profile() {
        let context = RenderContextBuilder::new(&TargetConfig::new("otherschema", "dbt", "other"))
            .var("start_date", serde_json::json!("2024-01-01"))
            .build();

        assert_eq!(context.target.name, "otherschema");
        assert_eq!(context.target.schema, "other");
        assert_eq!(context.target.database, "dbt");
        assert_eq!(context.vars["start_date"], serde_json::json!("2024-01-01"));
    }
}
