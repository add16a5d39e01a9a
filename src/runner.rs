//! Test execution logic

use crate::callbacks::StepRecorder;
use crate::model::{TestDefinition, TestResult};
use crate::registry::ActionRegistry;
use crate::scope::Scope;
use crate::step::StepList;
use crate::step_runner::{top_level_number, StepRunner};
use crate::value::{Value, Variables};
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, instrument};

/// Test runner trait
#[async_trait]
pub trait TestRunner: Send + Sync {
    /// Execute a test
    async fn run(&self, test: &TestDefinition) -> Result<TestResult>;
}

/// Runs each test in a fresh scope with its own step runner.
#[derive(Debug)]
pub struct DefaultTestRunner {
    registry: Arc<ActionRegistry>,
    seed_environment: bool,
    overrides: Variables,
}

impl DefaultTestRunner {
    /// Runner over the built-in actions.
    pub fn new() -> Self {
        Self::with_registry(Arc::new(ActionRegistry::with_builtins()))
    }

    pub fn with_registry(registry: Arc<ActionRegistry>) -> Self {
        Self {
            registry,
            seed_environment: true,
            overrides: Variables::new(),
        }
    }

    /// Whether process environment variables are copied into every
    /// scope.
    pub fn seed_environment(mut self, enabled: bool) -> Self {
        self.seed_environment = enabled;
        self
    }

    /// Variables applied after the test's own, so they win.
    pub fn with_variables(mut self, variables: Variables) -> Self {
        self.overrides.extend(variables);
        self
    }

    /// Scope for one run of `test`: environment, agent facts, the
    /// test's variables, then overrides.
    pub fn build_scope(&self, test: &TestDefinition) -> Scope {
        let scope = Scope::new();
        if self.seed_environment {
            scope.seed_environment();
        }
        scope.seed_agent_facts();
        for (name, value) in &test.variables {
            scope.put(name, Value::from(value.clone()));
        }
        scope.extend(&self.overrides);
        scope
    }

    /// Run `test` against an existing scope.
    pub async fn run_in(&self, test: &TestDefinition, scope: &Scope) -> TestResult {
        let start_time = Instant::now();
        let recorder = Arc::new(StepRecorder::new());
        let runner = StepRunner::new(Arc::clone(&self.registry)).with_callback(recorder.clone());
        let steps = StepList::new(test.steps.iter().cloned().map(Value::from).collect());

        let errors = match runner.run_test_steps(&steps, scope, &top_level_number).await {
            Ok(_) => Vec::new(),
            Err(err) => {
                error!("Test '{}' failed: {err}", test.name);
                err.messages()
            }
        };

        TestResult {
            name: test.name.clone(),
            success: errors.is_empty(),
            errors,
            steps: recorder.take(),
            duration_ms: start_time.elapsed().as_millis() as u64,
        }
    }
}

impl Default for DefaultTestRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TestRunner for DefaultTestRunner {
    #[instrument(skip(self, test), fields(name = %test.name))]
    async fn run(&self, test: &TestDefinition) -> Result<TestResult> {
        info!("Starting test: {} ({} steps)", test.name, test.steps.len());

        let scope = self.build_scope(test);
        let result = self.run_in(test, &scope).await;

        info!(
            "Test finished: {} ({} ms) - Success: {}",
            test.name, result.duration_ms, result.success
        );
        Ok(result)
    }
}
