//! The step runner: executes a step list against a scope.
//!
//! Per step the runner merges the list's base variables, records the
//! step number, runs the pre-step callbacks, then decides between
//! skipping (disabled, prior failure, false condition) and executing.
//! Execution evaluates the step's properties, builds the action and
//! runs it. Post-step callbacks see every outcome.
//!
//! Failures do not stop the loop: later steps marked `runOnFailure`
//! still run, and the collected errors are raised once the list is
//! done. An unknown type or an unparsable step stops the list at once,
//! raised together with the failures collected before it. Control-flow actions call back into the runner with a derived
//! step numbering, which is how nested step trees execute.

use crate::callbacks::ShortcutExpander;
use crate::error::RunError;
use crate::properties::{Properties, PropertyEvaluator};
use crate::registry::{ActionContext, ActionDescriptor, ActionRegistry};
use crate::scope::{Scope, STEP_NUMBER_VARIABLE};
use crate::step::{Step, StepList};
use crate::value::Value;
use anyhow::{anyhow, Context, Result};
use futures::future::{BoxFuture, FutureExt};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Maps the index of a step within its list to its step number.
pub type StepNumberFn<'a> = dyn Fn(usize) -> String + Send + Sync + 'a;

/// Numbering of a test's top-level steps: `1`, `2`, ...
pub fn top_level_number(index: usize) -> String {
    (index + 1).to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Disabled,
    PriorFailure,
    Condition,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SkipReason::Disabled => "disabled",
            SkipReason::PriorFailure => "a previous step failed",
            SkipReason::Condition => "condition is false",
        })
    }
}

/// Outcome of one step, as reported to post-step callbacks.
#[derive(Debug)]
pub enum StepStatus {
    Passed(Value),
    Skipped(SkipReason),
    Failed {
        error: anyhow::Error,
        /// The step set `ignoreError`.
        ignored: bool,
    },
}

impl StepStatus {
    pub fn is_success(&self) -> bool {
        !matches!(self, StepStatus::Failed { .. })
    }

    pub fn error(&self) -> Option<&anyhow::Error> {
        match self {
            StepStatus::Failed { error, .. } => Some(error),
            _ => None,
        }
    }
}

/// Hooks run around every step, in registration order.
pub trait StepCallback: Send + Sync {
    /// May rewrite the raw step before it is parsed. An error is fatal
    /// for the list.
    fn before_step(&self, step: Value, _step_number: &str) -> Result<Value> {
        Ok(step)
    }

    fn after_step(&self, _step: &Step, _step_number: &str, _status: &StepStatus) {}
}

/// Executes step lists. One runner can serve many runs; all run state
/// lives in the [`Scope`] passed to each call.
pub struct StepRunner {
    registry: Arc<ActionRegistry>,
    callbacks: Vec<Arc<dyn StepCallback>>,
}

impl StepRunner {
    /// Create a runner resolving step types through `registry`.
    /// Shorthand steps are expanded before any other callback runs.
    pub fn new(registry: Arc<ActionRegistry>) -> Self {
        let expander: Arc<dyn StepCallback> = Arc::new(ShortcutExpander::new(Arc::clone(&registry)));
        Self {
            registry,
            callbacks: vec![expander],
        }
    }

    pub fn with_callback(mut self, callback: Arc<dyn StepCallback>) -> Self {
        self.callbacks.push(callback);
        self
    }

    pub fn registry(&self) -> &ActionRegistry {
        &self.registry
    }

    /// Run `steps` in order and return the results of the executed
    /// steps, or every collected failure once the list is done.
    pub fn run_test_steps<'a>(
        &'a self,
        steps: &'a StepList,
        scope: &'a Scope,
        numbering: &'a StepNumberFn<'a>,
    ) -> BoxFuture<'a, Result<Vec<Value>, RunError>> {
        async move {
            let mut results = Vec::new();
            let mut errors = Vec::new();
            let mut failed = false;

            for (index, raw) in steps.steps.iter().enumerate() {
                if let Some(variables) = &steps.variables {
                    scope.extend(variables);
                }
                let step_number = numbering(index);
                scope.put(STEP_NUMBER_VARIABLE, step_number.as_str());

                let step = match self.prepare(raw.clone(), &step_number) {
                    Ok(step) => step,
                    Err(invalid) => {
                        let step = Step::placeholder(raw);
                        if step.disabled {
                            debug!(step = %step_number, "Skipping disabled step: {}", step.display_name());
                            self.notify(&step, &step_number, &StepStatus::Skipped(SkipReason::Disabled));
                            continue;
                        }
                        errors.push(self.abort(&step, &step_number, invalid));
                        return Err(RunError::collect(errors));
                    }
                };

                let status = match self.execute(&step, &step_number, scope, failed).await {
                    Ok(status) => status,
                    Err(fatal) => {
                        errors.push(self.abort(&step, &step_number, fatal));
                        return Err(RunError::collect(errors));
                    }
                };
                self.notify(&step, &step_number, &status);

                match status {
                    StepStatus::Passed(value) => results.push(value),
                    StepStatus::Skipped(_) => {}
                    StepStatus::Failed { ignored: true, .. } => {}
                    StepStatus::Failed { error, ignored: false } => {
                        failed = true;
                        errors.push(RunError::StepFailed {
                            step_number,
                            name: step.display_name().to_string(),
                            source: error,
                        });
                    }
                }
            }

            if failed {
                Err(RunError::collect(errors))
            } else {
                Ok(results)
            }
        }
        .boxed()
    }

    /// Run a list nested inside the current step. The current step
    /// number is restored afterwards.
    pub async fn run_nested(
        &self,
        steps: &StepList,
        scope: &Scope,
        numbering: &StepNumberFn<'_>,
    ) -> Result<Vec<Value>, RunError> {
        let current = scope.get(STEP_NUMBER_VARIABLE);
        let result = self.run_test_steps(steps, scope, numbering).await;
        if let Some(step_number) = current {
            scope.put(STEP_NUMBER_VARIABLE, step_number);
        }
        result
    }

    fn prepare(&self, raw: Value, step_number: &str) -> Result<Step, RunError> {
        let mut raw = raw;
        for callback in &self.callbacks {
            raw = callback
                .before_step(raw, step_number)
                .map_err(|source| RunError::InvalidStep {
                    step_number: step_number.to_string(),
                    source,
                })?;
        }
        Step::from_value(raw).map_err(|source| RunError::InvalidStep {
            step_number: step_number.to_string(),
            source,
        })
    }

    fn notify(&self, step: &Step, step_number: &str, status: &StepStatus) {
        for callback in &self.callbacks {
            callback.after_step(step, step_number, status);
        }
    }

    /// Report a fatal error to the callbacks and hand it back for the
    /// list's error collection.
    fn abort(&self, step: &Step, step_number: &str, fatal: RunError) -> RunError {
        error!(step = %step_number, "{fatal}");
        let status = StepStatus::Failed {
            error: anyhow!("{fatal}"),
            ignored: false,
        };
        self.notify(step, step_number, &status);
        fatal
    }

    async fn execute(
        &self,
        step: &Step,
        step_number: &str,
        scope: &Scope,
        list_failed: bool,
    ) -> Result<StepStatus, RunError> {
        if step.disabled {
            debug!(step = %step_number, "Skipping disabled step: {}", step.display_name());
            return Ok(StepStatus::Skipped(SkipReason::Disabled));
        }
        if list_failed && !step.run_on_failure {
            debug!(step = %step_number, "Skipping step after failure: {}", step.display_name());
            return Ok(StepStatus::Skipped(SkipReason::PriorFailure));
        }

        let descriptor = self
            .registry
            .get(&step.step_type)
            .ok_or_else(|| RunError::UnknownStepType {
                step_type: step.step_type.clone(),
                step_number: step_number.to_string(),
            })?;

        info!(step = %step_number, "Running step: {} ({})", step.display_name(), step.step_type);

        Ok(match self.invoke(step, step_number, scope, &descriptor).await {
            Ok(Some(value)) => {
                debug!(step = %step_number, "Step result: {value}");
                StepStatus::Passed(value)
            }
            Ok(None) => {
                debug!(step = %step_number, "Condition is false, skipping: {}", step.display_name());
                StepStatus::Skipped(SkipReason::Condition)
            }
            Err(err) => {
                if step.ignore_error {
                    warn!(step = %step_number, "Ignoring failure of {}: {err:#}", step.display_name());
                } else {
                    error!(step = %step_number, "Step {} failed: {err:#}", step.display_name());
                }
                StepStatus::Failed {
                    error: err,
                    ignored: step.ignore_error,
                }
            }
        })
    }

    /// Evaluate the condition and properties, then run the action.
    /// `None` means the condition skipped the step.
    async fn invoke(
        &self,
        step: &Step,
        step_number: &str,
        scope: &Scope,
        descriptor: &ActionDescriptor,
    ) -> Result<Option<Value>> {
        if let Some(condition) = &step.condition {
            let verdict = scope
                .evaluate(condition)
                .with_context(|| format!("Failed to evaluate condition '{condition}'"))?;
            if !verdict.is_truthy() {
                return Ok(None);
            }
        }

        let values = PropertyEvaluator::new(self, scope)
            .evaluate(step.values.clone(), Some(&descriptor.schema), true)
            .await
            .context("Failed to evaluate properties")?;
        let action = descriptor.instantiate(Properties::from_value(values)?)?;

        let ctx = ActionContext {
            runner: self,
            scope,
            step,
            step_number,
        };
        Ok(Some(action.run(&ctx).await?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Action;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;

    /// Records the evaluated properties of every `check` step.
    #[derive(Default)]
    struct Checks(Mutex<Vec<Value>>);

    struct Check {
        properties: Value,
        checks: Arc<Checks>,
    }

    #[async_trait]
    impl Action for Check {
        async fn run(&self, _ctx: &ActionContext<'_>) -> Result<Value> {
            self.checks.0.lock().unwrap().push(self.properties.clone());
            Ok(self.properties.clone())
        }
    }

    /// Records step numbers seen by post-step callbacks.
    #[derive(Default)]
    struct Numbers(Mutex<Vec<(String, String, bool)>>);

    impl StepCallback for Numbers {
        fn after_step(&self, step: &Step, step_number: &str, status: &StepStatus) {
            self.0.lock().unwrap().push((
                step.step_type.clone(),
                step_number.to_string(),
                status.is_success(),
            ));
        }
    }

    fn runner_with_checks() -> (StepRunner, Arc<Checks>) {
        let checks = Arc::new(Checks::default());
        let mut registry = ActionRegistry::with_builtins();
        let sink = Arc::clone(&checks);
        registry.register(
            &["check"],
            ActionDescriptor::new(move |props| {
                Ok(Box::new(Check {
                    properties: Value::Object(props.into_inner()),
                    checks: Arc::clone(&sink),
                }))
            }),
        );
        (StepRunner::new(Arc::new(registry)), checks)
    }

    fn list(steps: serde_json::Value) -> StepList {
        StepList::from_value(Value::from(steps)).unwrap()
    }

    fn index_number(i: usize) -> String {
        i.to_string()
    }

    #[tokio::test]
    async fn test_scope_mutation_is_visible_to_later_steps() {
        let (runner, checks) = runner_with_checks();
        let steps = list(json!([
            {"type": "set-variable", "values": {"variable": "x", "value": 5}},
            {"type": "check", "values": {"v": "$(x*2)"}}
        ]));

        runner.run_test_steps(&steps, &Scope::new(), &index_number).await.unwrap();

        let seen = checks.0.lock().unwrap();
        assert_eq!(seen[0], Value::from(json!({"v": 10})));
    }

    #[tokio::test]
    async fn test_results_are_returned_in_order() {
        let (runner, _) = runner_with_checks();
        let steps = list(json!([{"echo": "a"}, {"echo": 2}, {"echo": [true]}]));
        let results = runner
            .run_test_steps(&steps, &Scope::new(), &index_number)
            .await
            .unwrap();
        assert_eq!(results, vec![Value::from("a"), Value::from(2i64), Value::from(json!([true]))]);
    }

    #[tokio::test]
    async fn test_ignored_failure_does_not_fail_the_list() {
        let (runner, _) = runner_with_checks();
        let steps = list(json!([
            {"type": "fail", "values": {"message": "soft"}, "ignoreError": true},
            {"echo": "after"}
        ]));
        let results = runner
            .run_test_steps(&steps, &Scope::new(), &index_number)
            .await
            .unwrap();
        assert_eq!(results, vec![Value::from("after")]);
    }

    #[tokio::test]
    async fn test_failure_skips_siblings_unless_run_on_failure() {
        let (runner, checks) = runner_with_checks();
        let steps = list(json!([
            {"type": "fail", "values": {"message": "hard"}},
            {"type": "check", "values": {"skipped": true}},
            {"type": "check", "values": {"cleanup": true}, "runOnFailure": true}
        ]));

        let err = runner
            .run_test_steps(&steps, &Scope::new(), &index_number)
            .await
            .unwrap_err();

        assert!(matches!(err, RunError::StepFailed { ref step_number, .. } if step_number == "0"));
        assert!(err.to_string().contains("hard"));
        let seen = checks.0.lock().unwrap();
        assert_eq!(*seen, vec![Value::from(json!({"cleanup": true}))]);
    }

    #[tokio::test]
    async fn test_all_failures_are_raised_together() {
        let (runner, _) = runner_with_checks();
        let steps = list(json!([
            {"fail": "first"},
            {"type": "fail", "values": {"message": "second"}, "runOnFailure": true}
        ]));
        let err = runner
            .run_test_steps(&steps, &Scope::new(), &index_number)
            .await
            .unwrap_err();
        let messages = err.messages();
        assert_eq!(messages.len(), 2);
        assert!(messages[0].contains("first"));
        assert!(messages[1].contains("second"));
    }

    #[tokio::test]
    async fn test_unknown_type_is_fatal() {
        let (runner, checks) = runner_with_checks();
        let steps = list(json!([
            {"type": "no-such-action"},
            {"type": "check", "values": {}, "runOnFailure": true}
        ]));
        let err = runner
            .run_test_steps(&steps, &Scope::new(), &index_number)
            .await
            .unwrap_err();
        assert!(matches!(err, RunError::UnknownStepType { ref step_type, .. } if step_type == "no-such-action"));
        assert!(err.is_fatal());
        assert!(checks.0.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_disabled_and_conditional_steps_are_skipped() {
        let (runner, _) = runner_with_checks();
        let scope = Scope::new();
        scope.put("flag", false);
        let steps = list(json!([
            {"type": "no-such-action", "disabled": true},
            {"type": "echo", "values": {"value": "no"}, "condition": "flag"},
            {"type": "echo", "values": {"value": "yes"}, "condition": "!flag"}
        ]));
        let results = runner.run_test_steps(&steps, &scope, &index_number).await.unwrap();
        assert_eq!(results, vec![Value::from("yes")]);
    }

    #[tokio::test]
    async fn test_condition_errors_are_step_failures() {
        let (runner, _) = runner_with_checks();
        let steps = list(json!([{"type": "echo", "values": {"value": 1}, "condition": "undefined_name > 1"}]));
        let err = runner
            .run_test_steps(&steps, &Scope::new(), &index_number)
            .await
            .unwrap_err();
        assert!(matches!(err, RunError::StepFailed { .. }));
    }

    #[tokio::test]
    async fn test_missing_required_property_fails_the_step() {
        let (runner, _) = runner_with_checks();
        let steps = list(json!([{"type": "set-variable", "values": {"value": 1}}]));
        let err = runner
            .run_test_steps(&steps, &Scope::new(), &index_number)
            .await
            .unwrap_err();
        assert!(format!("{:#}", anyhow::Error::from(err)).contains("Missing required property 'variable'"));
    }

    #[tokio::test]
    async fn test_base_variables_persist_after_the_list() {
        let (runner, _) = runner_with_checks();
        let scope = Scope::new();
        let steps = list(json!({
            "variables": {"base": "merged"},
            "steps": [{"echo": "$(base)"}]
        }));
        let results = runner.run_test_steps(&steps, &scope, &index_number).await.unwrap();
        assert_eq!(results, vec![Value::from("merged")]);
        assert_eq!(scope.get("base"), Some(Value::from("merged")));
    }

    #[tokio::test]
    async fn test_nested_step_numbers_derive_from_parent() {
        let numbers = Arc::new(Numbers::default());
        let runner = StepRunner::new(Arc::new(ActionRegistry::with_builtins()))
            .with_callback(numbers.clone());
        let scope = Scope::new();
        let steps = list(json!([
            {"echo": "first"},
            {"type": "if", "values": {"condition": true, "then": [{"echo": "$(STEP_NUMBER)"}]}}
        ]));

        runner.run_test_steps(&steps, &scope, &index_number).await.unwrap();

        let seen = numbers.0.lock().unwrap();
        assert_eq!(
            *seen,
            vec![
                ("echo".to_string(), "0".to_string(), true),
                ("echo".to_string(), "1-then-0".to_string(), true),
                ("if".to_string(), "1".to_string(), true),
            ]
        );
        assert_eq!(scope.step_number().as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn test_nested_failure_fails_the_parent_step() {
        let (runner, _) = runner_with_checks();
        let steps = list(json!([
            {"type": "run-steps", "values": {"steps": [{"fail": "deep"}]}}
        ]));
        let err = runner
            .run_test_steps(&steps, &Scope::new(), &index_number)
            .await
            .unwrap_err();
        let RunError::StepFailed { step_number, source, .. } = err else {
            panic!("expected a step failure");
        };
        assert_eq!(step_number, "0");
        assert!(format!("{source:#}").contains("deep"));
    }

    #[tokio::test]
    async fn test_invalid_step_is_fatal() {
        let (runner, _) = runner_with_checks();
        let steps = list(json!([{"echo": "a", "fail": "b"}]));
        let err = runner
            .run_test_steps(&steps, &Scope::new(), &index_number)
            .await
            .unwrap_err();
        assert!(matches!(err, RunError::InvalidStep { .. }));
    }

    #[tokio::test]
    async fn test_fatal_error_keeps_earlier_failures() {
        let (runner, _) = runner_with_checks();
        let steps = list(json!([
            {"fail": "first failure"},
            {"type": "no-such-action", "runOnFailure": true}
        ]));
        let err = runner
            .run_test_steps(&steps, &Scope::new(), &index_number)
            .await
            .unwrap_err();

        assert!(err.is_fatal());
        let messages = err.messages();
        assert_eq!(messages.len(), 2, "{messages:?}");
        assert!(messages[0].contains("first failure"));
        assert_eq!(messages[1], "Unknown step type 'no-such-action' at step 1");
    }

    #[tokio::test]
    async fn test_invalid_step_keeps_earlier_failures() {
        let (runner, _) = runner_with_checks();
        let steps = list(json!([
            {"fail": "first failure"},
            {"echo": "a", "fail": "b"}
        ]));
        let err = runner
            .run_test_steps(&steps, &Scope::new(), &index_number)
            .await
            .unwrap_err();

        let RunError::Multiple(errors) = err else {
            panic!("expected both failures");
        };
        assert!(matches!(errors[0], RunError::StepFailed { .. }));
        assert!(matches!(errors[1], RunError::InvalidStep { ref step_number, .. } if step_number == "1"));
    }

    #[tokio::test]
    async fn test_disabled_shorthand_of_unregistered_type_is_skipped() {
        let numbers = Arc::new(Numbers::default());
        let runner = StepRunner::new(Arc::new(ActionRegistry::with_builtins()))
            .with_callback(numbers.clone());
        let steps = list(json!([
            {"not-registered": "x", "disabled": true},
            {"echo": "ok"}
        ]));

        let results = runner
            .run_test_steps(&steps, &Scope::new(), &index_number)
            .await
            .unwrap();

        assert_eq!(results, vec![Value::from("ok")]);
        assert_eq!(numbers.0.lock().unwrap()[0], ("not-registered".to_string(), "0".to_string(), true));
    }

    #[tokio::test]
    async fn test_disabled_invalid_step_is_skipped() {
        let (runner, _) = runner_with_checks();
        let steps = list(json!([
            {"set-variable": 3, "disabled": true},
            {"echo": "ok"}
        ]));
        let results = runner
            .run_test_steps(&steps, &Scope::new(), &index_number)
            .await
            .unwrap();
        assert_eq!(results, vec![Value::from("ok")]);
    }

    #[tokio::test]
    async fn test_unregistered_shorthand_is_an_unknown_type() {
        let (runner, _) = runner_with_checks();
        let steps = list(json!([{"not-registered": "x"}]));
        let err = runner
            .run_test_steps(&steps, &Scope::new(), &index_number)
            .await
            .unwrap_err();
        assert!(matches!(err, RunError::UnknownStepType { ref step_type, .. } if step_type == "not-registered"));
    }

    #[tokio::test]
    async fn test_invalid_step_reaches_post_step_callbacks() {
        let numbers = Arc::new(Numbers::default());
        let runner = StepRunner::new(Arc::new(ActionRegistry::with_builtins()))
            .with_callback(numbers.clone());
        let steps = list(json!([{"echo": "a", "fail": "b", "name": "clash"}]));

        let err = runner
            .run_test_steps(&steps, &Scope::new(), &index_number)
            .await
            .unwrap_err();

        assert!(matches!(err, RunError::InvalidStep { .. }));
        assert_eq!(*numbers.0.lock().unwrap(), vec![("echo".to_string(), "0".to_string(), false)]);
    }

    #[tokio::test]
    async fn test_base_variables_are_merged_before_every_step() {
        let (runner, _) = runner_with_checks();
        let scope = Scope::new();
        let steps = list(json!({
            "variables": {"x": "base"},
            "steps": [
                {"type": "set-variable", "values": {"variable": "x", "value": "changed"}},
                {"echo": "$(x)"}
            ]
        }));

        let results = runner.run_test_steps(&steps, &scope, &index_number).await.unwrap();

        assert_eq!(results.last(), Some(&Value::from("base")));
        assert_eq!(scope.get("x"), Some(Value::from("base")));
    }
}
