//! Steps and step lists as authored in test files.

use crate::value::{Value, Variables};
use anyhow::{anyhow, bail, Result};

/// One declarative instruction: an action type plus its property bag.
#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    pub step_type: String,
    pub name: Option<String>,
    pub values: Value,
    pub disabled: bool,
    pub run_on_failure: bool,
    pub ignore_error: bool,
    pub condition: Option<String>,
}

const STEP_KEYS: [&str; 7] = [
    "type",
    "name",
    "values",
    "disabled",
    "runOnFailure",
    "ignoreError",
    "condition",
];

/// Keys that may accompany a shorthand step without being taken as
/// its type.
pub const STEP_META_KEYS: [&str; 5] = ["name", "disabled", "runOnFailure", "ignoreError", "condition"];

impl Step {
    pub fn new(step_type: impl Into<String>, values: Value) -> Self {
        Self {
            step_type: step_type.into(),
            name: None,
            values,
            disabled: false,
            run_on_failure: false,
            ignore_error: false,
            condition: None,
        }
    }

    /// Name for diagnostics: the authored name, or the type.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.step_type)
    }

    /// Parse the full step form
    /// `{ type, name?, values?, disabled?, runOnFailure?, ignoreError?, condition? }`.
    pub fn from_value(value: Value) -> Result<Self> {
        let Value::Object(mut map) = value.resolved() else {
            bail!("a step must be an object");
        };

        if let Some(unexpected) = map.keys().find(|k| !STEP_KEYS.contains(&k.as_str())) {
            bail!("unexpected key '{unexpected}' in step");
        }

        let step_type = match map.shift_remove("type") {
            Some(Value::String(t)) if !t.is_empty() => t,
            Some(_) => bail!("step 'type' must be a non-empty string"),
            None => bail!("step has no 'type'"),
        };

        let values = match map.shift_remove("values") {
            None | Some(Value::Null) => Value::Object(Variables::new()),
            Some(values @ Value::Object(_)) => values,
            Some(_) => bail!("values of step '{step_type}' must be an object"),
        };

        let condition = match map.shift_remove("condition") {
            None | Some(Value::Null) => None,
            Some(Value::String(code)) => Some(code),
            Some(Value::Bool(b)) => Some(b.to_string()),
            Some(_) => bail!("condition of step '{step_type}' must be an expression string"),
        };

        Ok(Self {
            name: map.shift_remove("name").map(|n| n.to_string()),
            disabled: flag(&mut map, "disabled")?,
            run_on_failure: flag(&mut map, "runOnFailure")?,
            ignore_error: flag(&mut map, "ignoreError")?,
            step_type,
            values,
            condition,
        })
    }
}

impl Step {
    /// Best-effort description of a raw step that could not be parsed,
    /// so callbacks can still report it.
    pub fn placeholder(raw: &Value) -> Self {
        let raw = raw.clone().resolved();
        let mut step = Step::new("unknown", Value::Null);
        match &raw {
            Value::String(step_type) => step.step_type = step_type.clone(),
            Value::Object(map) => {
                let step_type = match map.get("type") {
                    Some(Value::String(t)) => Some(t.clone()),
                    _ => map
                        .keys()
                        .find(|k| !STEP_META_KEYS.contains(&k.as_str()) && k.as_str() != "type")
                        .cloned(),
                };
                if let Some(step_type) = step_type {
                    step.step_type = step_type;
                }
                step.name = map.get("name").map(|n| n.to_string());
                step.disabled = matches!(map.get("disabled"), Some(Value::Bool(true)));
            }
            _ => {}
        }
        step
    }
}

fn flag(map: &mut Variables, key: &str) -> Result<bool> {
    match map.shift_remove(key) {
        None | Some(Value::Null) => Ok(false),
        Some(Value::Bool(b)) => Ok(b),
        Some(other) => Err(anyhow!("'{key}' must be a boolean, got {other}")),
    }
}

/// Ordered raw steps plus optional base variables merged into the
/// scope before each step runs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepList {
    pub steps: Vec<Value>,
    pub variables: Option<Variables>,
}

impl StepList {
    pub fn new(steps: Vec<Value>) -> Self {
        Self {
            steps,
            variables: None,
        }
    }

    pub fn with_variables(mut self, variables: Variables) -> Self {
        self.variables = Some(variables);
        self
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Accept an array (keeping its base variables) or the object form
    /// `{ variables?, steps }`.
    pub fn from_value(value: Value) -> Result<Self> {
        match value.resolved() {
            Value::Array { items, variables } => Ok(Self {
                steps: items,
                variables,
            }),
            Value::Object(mut map) if map.contains_key("steps") => {
                let variables = match map.shift_remove("variables") {
                    None | Some(Value::Null) => None,
                    Some(Value::Object(vars)) => Some(vars),
                    Some(_) => bail!("step list 'variables' must be an object"),
                };
                let steps = match map.shift_remove("steps") {
                    Some(Value::Array { items, .. }) => items,
                    _ => bail!("step list 'steps' must be an array"),
                };
                Ok(Self { steps, variables })
            }
            Value::Null => Ok(Self::default()),
            other => bail!("expected a list of steps, got {other}"),
        }
    }

    /// Like [`StepList::from_value`], but any value that is not a list
    /// is taken as a single step.
    pub fn one_or_many(value: Value) -> Self {
        match value.resolved() {
            Value::Array { items, variables } => Self {
                steps: items,
                variables,
            },
            single => Self::new(vec![single]),
        }
    }

    /// The list as a tagged array value.
    pub fn into_value(self) -> Value {
        Value::Array {
            items: self.steps,
            variables: self.variables,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_full_step() {
        let step = Step::from_value(Value::from(json!({
            "type": "set-variable",
            "name": "remember",
            "values": {"variable": "x", "value": 5},
            "ignoreError": true,
            "condition": "x > 1"
        })))
        .unwrap();

        assert_eq!(step.step_type, "set-variable");
        assert_eq!(step.display_name(), "remember");
        assert!(step.ignore_error);
        assert!(!step.run_on_failure);
        assert_eq!(step.condition.as_deref(), Some("x > 1"));
        assert_eq!(step.values, Value::from(json!({"variable": "x", "value": 5})));
    }

    #[test]
    fn test_defaults() {
        let step = Step::from_value(Value::from(json!({"type": "log"}))).unwrap();
        assert_eq!(step.values, Value::Object(Variables::new()));
        assert_eq!(step.display_name(), "log");
        assert!(!step.disabled);
    }

    #[test]
    fn test_rejects_malformed_steps() {
        assert!(Step::from_value(Value::from("log")).is_err());
        assert!(Step::from_value(Value::from(json!({"name": "x"}))).is_err());
        assert!(Step::from_value(Value::from(json!({"type": "log", "valeus": {}}))).is_err());
        assert!(Step::from_value(Value::from(json!({"type": "log", "disabled": "yes"}))).is_err());
    }

    #[test]
    fn test_placeholder_describes_unparsable_steps() {
        let step = Step::placeholder(&Value::from(json!({"echo": 1, "fail": 2, "name": "bad"})));
        assert_eq!(step.step_type, "echo");
        assert_eq!(step.display_name(), "bad");
        assert!(!step.disabled);

        let step = Step::placeholder(&Value::from(json!({"type": 3, "disabled": true})));
        assert_eq!(step.step_type, "unknown");
        assert!(step.disabled);

        assert_eq!(Step::placeholder(&Value::from("log")).step_type, "log");
    }

    #[test]
    fn test_step_list_object_form_carries_variables() {
        let list = StepList::from_value(Value::from(json!({
            "variables": {"a": 1},
            "steps": [{"type": "log"}]
        })))
        .unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list.variables.unwrap().get("a"), Some(&Value::from(1i64)));
    }

    #[test]
    fn test_step_list_round_trips_through_tagged_array() {
        let mut vars = Variables::new();
        vars.insert("a".into(), Value::from(true));
        let list = StepList::new(vec![Value::from(json!({"type": "log"}))]).with_variables(vars);
        let back = StepList::from_value(list.clone().into_value()).unwrap();
        assert_eq!(back, list);
    }

    #[test]
    fn test_one_or_many() {
        assert_eq!(StepList::one_or_many(Value::from(json!({"log": "hi"}))).len(), 1);
        assert_eq!(StepList::one_or_many(Value::from(json!([{}, {}]))).len(), 2);
        assert!(StepList::from_value(Value::from(42i64)).is_err());
    }
}
