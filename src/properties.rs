//! Property evaluation: turns a step's raw property tree into the
//! values handed to its action.
//!
//! Strings are interpolated, arrays and objects are walked, and every
//! object entry passes through a fixed chain of stages that react to
//! key markers:
//!
//! | marker | stage |
//! |---|---|
//! | `(key)`, `^key`, `<key>` | run the value as steps, keep the result |
//! | `$key` | evaluate the value as a raw expression |
//! | `~key` | keep the value untouched |
//! | `steps` | keep nested steps unevaluated |
//!
//! A stage may restart the chain, so markers stack: `($key)` runs
//! steps, then evaluates their result as an expression.

use crate::error::PropertyError;
use crate::expression::{replace_variables, Trail};
use crate::scope::Scope;
use crate::step::StepList;
use crate::step_runner::StepRunner;
use crate::value::{Value, Variables};
use anyhow::Result;
use futures::future::{BoxFuture, FutureExt};
use std::collections::HashMap;
use tracing::debug;

/// Per-property evaluation flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PropertyMeta {
    /// Hand the raw value to the action.
    pub skip: bool,
    /// Interpolate without re-evaluating the results.
    pub non_recursive: bool,
    /// Target of the single-key shorthand form.
    pub binding: bool,
}

/// Declared evaluation behaviour of an action's properties.
#[derive(Debug, Clone, Default)]
pub struct PropertySchema {
    properties: HashMap<String, PropertyMeta>,
}

impl PropertySchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn skip(mut self, key: &str) -> Self {
        self.properties.entry(key.to_string()).or_default().skip = true;
        self
    }

    pub fn non_recursive(mut self, key: &str) -> Self {
        self.properties.entry(key.to_string()).or_default().non_recursive = true;
        self
    }

    pub fn binding(mut self, key: &str) -> Self {
        self.properties.entry(key.to_string()).or_default().binding = true;
        self
    }

    pub fn meta(&self, key: &str) -> PropertyMeta {
        self.properties.get(key).copied().unwrap_or_default()
    }

    pub fn binding_property(&self) -> Option<&str> {
        self.properties
            .iter()
            .find(|(_, meta)| meta.binding)
            .map(|(key, _)| key.as_str())
    }
}

/// Evaluated properties, consumed by action constructors.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Properties(Variables);

impl Properties {
    pub fn from_value(value: Value) -> Result<Self, PropertyError> {
        match value.resolved() {
            Value::Object(map) => Ok(Self(map)),
            Value::Null => Ok(Self::default()),
            other => Err(PropertyError::NotAnObject(other.to_string())),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn take(&mut self, key: &str) -> Option<Value> {
        self.0.shift_remove(key)
    }

    pub fn require(&mut self, key: &str) -> Result<Value, PropertyError> {
        self.take(key)
            .ok_or_else(|| PropertyError::Missing(key.to_string()))
    }

    pub fn require_string(&mut self, key: &str) -> Result<String, PropertyError> {
        match self.require(key)? {
            Value::String(s) => Ok(s),
            _ => Err(PropertyError::WrongType {
                key: key.to_string(),
                expected: "a string",
            }),
        }
    }

    pub fn optional_string(&mut self, key: &str) -> Result<Option<String>, PropertyError> {
        match self.take(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) => Ok(Some(s)),
            Some(_) => Err(PropertyError::WrongType {
                key: key.to_string(),
                expected: "a string",
            }),
        }
    }

    pub fn into_inner(self) -> Variables {
        self.0
    }
}

/// The evaluation unit passed through the stage chain.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyValue {
    pub key: String,
    pub value: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    RunAsSteps,
    ScriptTag,
    NoEvaluate,
    StepsPassthrough,
    Default,
}

/// Stages in descending priority.
const CHAIN: [Stage; 5] = [
    Stage::RunAsSteps,
    Stage::ScriptTag,
    Stage::NoEvaluate,
    Stage::StepsPassthrough,
    Stage::Default,
];

enum Flow {
    /// Hand the unit to the next stage.
    Next(KeyValue),
    /// Start over at the first stage.
    Restart(KeyValue),
    Done(KeyValue),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Collect {
    Last,
    All,
}

fn run_as_steps_marker(key: &str) -> Option<(&str, Collect)> {
    if key.len() > 2 && key.starts_with('(') && key.ends_with(')') {
        return Some((&key[1..key.len() - 1], Collect::Last));
    }
    if let Some(rest) = key.strip_prefix('^').filter(|r| !r.is_empty()) {
        return Some((rest, Collect::Last));
    }
    if let Some(rest) = key.strip_prefix('<').filter(|r| !r.is_empty()) {
        return Some((rest.strip_suffix('>').unwrap_or(rest), Collect::All));
    }
    None
}

fn strip_marker(key: &str, marker: char) -> Option<&str> {
    key.strip_prefix(marker).filter(|rest| !rest.is_empty())
}

/// Evaluates property trees against one scope. Run-as-steps markers
/// execute through `runner`.
#[derive(Clone, Copy)]
pub struct PropertyEvaluator<'a> {
    runner: &'a StepRunner,
    scope: &'a Scope,
}

impl<'a> PropertyEvaluator<'a> {
    pub fn new(runner: &'a StepRunner, scope: &'a Scope) -> Self {
        Self { runner, scope }
    }

    pub fn scope(&self) -> &'a Scope {
        self.scope
    }

    /// Evaluate `value`, dispatching on its shape. `schema` applies to
    /// the keys of a top-level object only.
    pub async fn evaluate(
        &self,
        value: Value,
        schema: Option<&PropertySchema>,
        recursive: bool,
    ) -> Result<Value> {
        self.evaluate_traced(value, schema, recursive, Trail::default())
            .await
    }

    pub(crate) fn evaluate_traced<'s>(
        &'s self,
        value: Value,
        schema: Option<&'s PropertySchema>,
        recursive: bool,
        trail: Trail,
    ) -> BoxFuture<'s, Result<Value>> {
        async move {
            match value {
                Value::String(text) => replace_variables(&text, self, recursive, &trail).await,
                Value::Array { items, variables } => {
                    let mut evaluated = Vec::with_capacity(items.len());
                    for item in items {
                        evaluated.push(
                            self.evaluate_traced(item, None, recursive, trail.clone())
                                .await?,
                        );
                    }
                    Ok(Value::Array {
                        items: evaluated,
                        variables,
                    })
                }
                Value::Object(map) => {
                    let mut evaluated = Variables::with_capacity(map.len());
                    for (key, value) in map {
                        let meta = schema.map(|s| s.meta(&key)).unwrap_or_default();
                        if meta.skip {
                            evaluated.insert(key, value);
                        } else if meta.non_recursive {
                            let value = self
                                .evaluate_traced(value, None, false, trail.clone())
                                .await?;
                            evaluated.insert(key, value);
                        } else {
                            let unit = self
                                .run_chain(KeyValue { key, value }, recursive, &trail)
                                .await?;
                            evaluated.insert(unit.key, unit.value);
                        }
                    }
                    Ok(Value::Object(evaluated))
                }
                other => Ok(other),
            }
        }
        .boxed()
    }

    async fn run_chain(&self, mut unit: KeyValue, recursive: bool, trail: &Trail) -> Result<KeyValue> {
        let mut index = 0;
        while let Some(stage) = CHAIN.get(index) {
            match self.apply(*stage, unit, recursive, trail).await? {
                Flow::Next(next) => {
                    unit = next;
                    index += 1;
                }
                Flow::Restart(next) => {
                    unit = next;
                    index = 0;
                }
                Flow::Done(done) => return Ok(done),
            }
        }
        Ok(unit)
    }

    async fn apply(&self, stage: Stage, unit: KeyValue, recursive: bool, trail: &Trail) -> Result<Flow> {
        match stage {
            Stage::RunAsSteps => {
                let Some((key, collect)) = run_as_steps_marker(&unit.key) else {
                    return Ok(Flow::Next(unit));
                };
                let key = key.to_string();
                let value = self.run_as_steps(&key, unit.value, collect).await?;
                Ok(Flow::Restart(KeyValue { key, value }))
            }
            Stage::ScriptTag => {
                let Some(key) = strip_marker(&unit.key, '$') else {
                    return Ok(Flow::Next(unit));
                };
                let value = match unit.value {
                    Value::String(code) => self.scope.evaluate(&code)?,
                    other => other,
                };
                Ok(Flow::Restart(KeyValue {
                    key: key.to_string(),
                    value,
                }))
            }
            Stage::NoEvaluate => match strip_marker(&unit.key, '~') {
                Some(key) => Ok(Flow::Done(KeyValue {
                    key: key.to_string(),
                    value: unit.value,
                })),
                None => Ok(Flow::Next(unit)),
            },
            Stage::StepsPassthrough => {
                if unit.key != "steps" {
                    return Ok(Flow::Next(unit));
                }
                let value = match unit.value {
                    text @ Value::String(_) => {
                        self.evaluate_traced(text, None, false, trail.clone())
                            .await?
                    }
                    other => other,
                };
                Ok(Flow::Done(KeyValue {
                    key: unit.key,
                    value,
                }))
            }
            Stage::Default => {
                let value = self
                    .evaluate_traced(unit.value, None, recursive, trail.clone())
                    .await?;
                Ok(Flow::Done(KeyValue {
                    key: unit.key,
                    value,
                }))
            }
        }
    }

    async fn run_as_steps(&self, key: &str, value: Value, collect: Collect) -> Result<Value> {
        let steps = StepList::one_or_many(value);
        let base = self.scope.step_number().unwrap_or_default();
        debug!("Running {} step(s) for property '{key}' at {base}", steps.len());

        let numbering = |i: usize| format!("{base}-{key}-{i}");
        let mut results = self.runner.run_nested(&steps, self.scope, &numbering).await?;

        Ok(match collect {
            Collect::Last => results.pop().unwrap_or_default(),
            Collect::All => Value::array(results),
        })
    }
}
