//! Action contract and the registry mapping step types to actions.

use crate::properties::{Properties, PropertySchema};
use crate::scope::Scope;
use crate::step::{Step, StepList};
use crate::step_runner::{StepNumberFn, StepRunner};
use crate::value::Value;
use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// A leaf operation invoked by the step runner.
///
/// Actions are built from their evaluated properties, run once, and
/// return an arbitrary result value.
#[async_trait]
pub trait Action: Send + Sync {
    async fn run(&self, ctx: &ActionContext<'_>) -> Result<Value>;
}

/// What an action sees while it runs.
pub struct ActionContext<'a> {
    pub runner: &'a StepRunner,
    pub scope: &'a Scope,
    pub step: &'a Step,
    pub step_number: &'a str,
}

impl ActionContext<'_> {
    /// Run a nested step list. A failure of the nested list becomes the
    /// error of this action.
    pub async fn run_steps(&self, steps: &StepList, numbering: &StepNumberFn<'_>) -> Result<Vec<Value>> {
        Ok(self.runner.run_nested(steps, self.scope, numbering).await?)
    }
}

pub type ActionConstructor =
    Arc<dyn Fn(Properties) -> Result<Box<dyn Action>> + Send + Sync>;

/// How to build an action and how its properties are evaluated.
#[derive(Clone)]
pub struct ActionDescriptor {
    pub constructor: ActionConstructor,
    pub schema: PropertySchema,
}

impl ActionDescriptor {
    pub fn new<F>(constructor: F) -> Self
    where
        F: Fn(Properties) -> Result<Box<dyn Action>> + Send + Sync + 'static,
    {
        Self {
            constructor: Arc::new(constructor),
            schema: PropertySchema::default(),
        }
    }

    pub fn with_schema(mut self, schema: PropertySchema) -> Self {
        self.schema = schema;
        self
    }

    pub fn instantiate(&self, properties: Properties) -> Result<Box<dyn Action>> {
        (self.constructor)(properties)
    }
}

impl fmt::Debug for ActionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionDescriptor")
            .field("schema", &self.schema)
            .finish_non_exhaustive()
    }
}

/// Maps alias strings to action descriptors. Several aliases may share
/// one descriptor.
#[derive(Debug, Clone, Default)]
pub struct ActionRegistry {
    actions: HashMap<String, Arc<ActionDescriptor>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the control-flow and basic actions.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        crate::actions::register_builtins(&mut registry);
        registry
    }

    /// Register `descriptor` under every alias, replacing earlier
    /// registrations of the same aliases.
    pub fn register(&mut self, aliases: &[&str], descriptor: ActionDescriptor) -> &mut Self {
        let descriptor = Arc::new(descriptor);
        for alias in aliases {
            self.actions.insert(alias.to_string(), Arc::clone(&descriptor));
        }
        self
    }

    pub fn get(&self, alias: &str) -> Option<Arc<ActionDescriptor>> {
        self.actions.get(alias).cloned()
    }

    pub fn contains(&self, alias: &str) -> bool {
        self.actions.contains_key(alias)
    }

    pub fn all(&self) -> &HashMap<String, Arc<ActionDescriptor>> {
        &self.actions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Constant(Value);

    #[async_trait]
    impl Action for Constant {
        async fn run(&self, _ctx: &ActionContext<'_>) -> Result<Value> {
            Ok(self.0.clone())
        }
    }

    #[test]
    fn test_aliases_share_one_descriptor() {
        let mut registry = ActionRegistry::new();
        registry.register(
            &["constant", "const"],
            ActionDescriptor::new(|_| Ok(Box::new(Constant(Value::Null))))
                .with_schema(PropertySchema::new().binding("value")),
        );

        let a = registry.get("constant").unwrap();
        let b = registry.get("const").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.schema.binding_property(), Some("value"));
        assert!(registry.get("missing").is_none());
        assert_eq!(registry.all().len(), 2);
    }

    #[test]
    fn test_builtins_cover_control_flow() {
        let registry = ActionRegistry::with_builtins();
        for alias in [
            "if",
            "for-each-item",
            "for-each-property",
            "for-each-element",
            "run-steps",
            "pipe",
            "all",
            "or",
            "set-variable",
            "echo",
            "check",
        ] {
            assert!(registry.contains(alias), "missing builtin '{alias}'");
        }
    }
}
