//! Built-in step callbacks.

use crate::model::{StepRecord, StepState};
use crate::registry::ActionRegistry;
use crate::step::{Step, STEP_META_KEYS};
use crate::step_runner::{StepCallback, StepStatus};
use crate::value::{Value, Variables};
use anyhow::{bail, Result};
use dashmap::DashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// Expands shorthand steps into the full form.
///
/// * `"log"` becomes `{type: log}`.
/// * `{echo: "hi"}` becomes `{type: echo, values: {value: "hi"}}` when
///   `echo` declares `value` as its binding property.
/// * `{set-variable: {variable: x, value: 1}}` spreads the object into
///   `values` for actions without a binding property.
///
/// Step meta keys (`name`, `disabled`, ...) may sit next to the
/// shorthand key. Steps that already have a `type` pass through.
pub struct ShortcutExpander {
    registry: Arc<ActionRegistry>,
}

impl ShortcutExpander {
    pub fn new(registry: Arc<ActionRegistry>) -> Self {
        Self { registry }
    }

    fn expand(&self, map: Variables) -> Result<Variables> {
        let candidates: Vec<&String> = map
            .keys()
            .filter(|k| !STEP_META_KEYS.contains(&k.as_str()))
            .collect();
        let step_type = match candidates.as_slice() {
            [single] => (*single).clone(),
            [] => bail!("step has no type"),
            many => bail!(
                "ambiguous step, expected one action key but found {}",
                many.iter().map(|k| k.as_str()).collect::<Vec<_>>().join(", ")
            ),
        };

        let mut expanded = Variables::with_capacity(map.len() + 1);
        let mut values = Value::Null;
        for (key, value) in map {
            if key == step_type {
                values = value;
            } else {
                expanded.insert(key, value);
            }
        }

        let values = match self.registry.get(&step_type) {
            Some(descriptor) => match (descriptor.schema.binding_property(), values.resolved()) {
                (Some(binding), value) => {
                    let mut bound = Variables::new();
                    bound.insert(binding.to_string(), value);
                    Value::Object(bound)
                }
                (None, Value::Null) => Value::Object(Variables::new()),
                (None, object @ Value::Object(_)) => object,
                (None, other) => {
                    bail!("step '{step_type}' takes an object of properties, got {other}")
                }
            },
            // Unregistered: keep an object as is and drop anything else, the
            // type lookup reports the step.
            None => match values.resolved() {
                object @ Value::Object(_) => object,
                _ => Value::Object(Variables::new()),
            },
        };

        expanded.insert("type".to_string(), Value::String(step_type));
        expanded.insert("values".to_string(), values);
        Ok(expanded)
    }
}

impl StepCallback for ShortcutExpander {
    fn before_step(&self, step: Value, _step_number: &str) -> Result<Value> {
        match step.resolved() {
            Value::String(step_type) => {
                let mut map = Variables::new();
                map.insert("type".to_string(), Value::String(step_type));
                Ok(Value::Object(map))
            }
            Value::Object(map) if !map.contains_key("type") => Ok(Value::Object(self.expand(map)?)),
            other => Ok(other),
        }
    }
}

/// Records the outcome and duration of every step it sees.
#[derive(Default)]
pub struct StepRecorder {
    started: DashMap<String, Instant>,
    records: Mutex<Vec<StepRecord>>,
}

impl StepRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the records collected so far.
    pub fn records(&self) -> Vec<StepRecord> {
        self.records
            .lock()
            .map(|records| records.clone())
            .unwrap_or_default()
    }

    /// Drain the collected records.
    pub fn take(&self) -> Vec<StepRecord> {
        self.started.clear();
        self.records
            .lock()
            .map(|mut records| std::mem::take(&mut *records))
            .unwrap_or_default()
    }
}

impl StepCallback for StepRecorder {
    fn before_step(&self, step: Value, step_number: &str) -> Result<Value> {
        self.started.insert(step_number.to_string(), Instant::now());
        Ok(step)
    }

    fn after_step(&self, step: &Step, step_number: &str, status: &StepStatus) {
        let duration_ms = self
            .started
            .remove(step_number)
            .map(|(_, start)| start.elapsed().as_millis() as u64)
            .unwrap_or_default();
        let (state, error, skip_reason) = match status {
            StepStatus::Passed(_) => (StepState::Passed, None, None),
            StepStatus::Skipped(reason) => (StepState::Skipped, None, Some(reason.to_string())),
            StepStatus::Failed { error, ignored } => (
                if *ignored { StepState::Ignored } else { StepState::Failed },
                Some(format!("{error:#}")),
                None,
            ),
        };
        let record = StepRecord {
            step_number: step_number.to_string(),
            name: step.display_name().to_string(),
            step_type: step.step_type.clone(),
            state,
            error,
            skip_reason,
            duration_ms,
        };
        if let Ok(mut records) = self.records.lock() {
            records.push(record);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step_runner::SkipReason;
    use anyhow::anyhow;
    use serde_json::json;

    fn expander() -> ShortcutExpander {
        ShortcutExpander::new(Arc::new(ActionRegistry::with_builtins()))
    }

    fn expand(step: serde_json::Value) -> Result<Value> {
        expander().before_step(Value::from(step), "1")
    }

    #[test]
    fn test_binding_shorthand() {
        assert_eq!(
            expand(json!({"echo": "hi", "name": "greet"})).unwrap(),
            Value::from(json!({"name": "greet", "type": "echo", "values": {"value": "hi"}}))
        );
    }

    #[test]
    fn test_spread_shorthand() {
        assert_eq!(
            expand(json!({"set-variable": {"variable": "x", "value": 1}})).unwrap(),
            Value::from(json!({"type": "set-variable", "values": {"variable": "x", "value": 1}}))
        );
        assert!(expand(json!({"set-variable": 3})).is_err());
    }

    #[test]
    fn test_unregistered_shorthand_is_left_to_the_lookup() {
        assert_eq!(
            expand(json!({"not-registered": "x", "disabled": true})).unwrap(),
            Value::from(json!({"disabled": true, "type": "not-registered", "values": {}}))
        );
        assert_eq!(
            expand(json!({"not-registered": {"a": 1}})).unwrap(),
            Value::from(json!({"type": "not-registered", "values": {"a": 1}}))
        );
    }

    #[test]
    fn test_bare_string_is_a_type() {
        assert_eq!(expand(json!("log")).unwrap(), Value::from(json!({"type": "log"})));
    }

    #[test]
    fn test_full_form_and_ambiguity() {
        let full = json!({"type": "echo", "values": {"value": 1}});
        assert_eq!(expand(full.clone()).unwrap(), Value::from(full));
        assert!(expand(json!({"echo": 1, "log": "x"})).is_err());
        assert!(expand(json!({"name": "only meta"})).is_err());
    }

    #[test]
    fn test_recorder_states() {
        let recorder = StepRecorder::new();
        let step = Step::new("echo", Value::Null);

        recorder.before_step(Value::Null, "1").unwrap();
        recorder.after_step(&step, "1", &StepStatus::Passed(Value::Null));
        recorder.after_step(&step, "2", &StepStatus::Skipped(SkipReason::Disabled));
        recorder.after_step(
            &step,
            "3",
            &StepStatus::Failed {
                error: anyhow!("boom"),
                ignored: true,
            },
        );

        let records = recorder.take();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].state, StepState::Passed);
        assert_eq!(records[1].skip_reason.as_deref(), Some("disabled"));
        assert_eq!(records[2].state, StepState::Ignored);
        assert_eq!(records[2].error.as_deref(), Some("boom"));
        assert!(recorder.records().is_empty());
    }
}
