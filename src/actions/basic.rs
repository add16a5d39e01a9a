//! Leaf actions for working with variables and authoring checks.

use crate::properties::{Properties, PropertySchema};
use crate::registry::{Action, ActionContext, ActionDescriptor, ActionRegistry};
use crate::value::Value;
use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

pub(super) fn register(registry: &mut ActionRegistry) {
    registry
        .register(
            &["set-variable"],
            ActionDescriptor::new(|props| Ok(Box::new(SetVariable::new(props)?))),
        )
        .register(
            &["get-variable"],
            ActionDescriptor::new(|props| Ok(Box::new(GetVariable::new(props)?)))
                .with_schema(PropertySchema::new().binding("variable")),
        )
        .register(
            &["echo"],
            ActionDescriptor::new(|mut props| Ok(Box::new(Echo(props.take("value").unwrap_or_default()))))
                .with_schema(PropertySchema::new().binding("value")),
        )
        .register(
            &["assert", "check"],
            ActionDescriptor::new(|props| Ok(Box::new(Assert::new(props)?)))
                .with_schema(PropertySchema::new().binding("value")),
        )
        .register(
            &["fail"],
            ActionDescriptor::new(|mut props| Ok(Box::new(Fail(props.take("message").unwrap_or_default()))))
                .with_schema(PropertySchema::new().binding("message")),
        )
        .register(
            &["log"],
            ActionDescriptor::new(|props| Ok(Box::new(Log::new(props)?)))
                .with_schema(PropertySchema::new().binding("message")),
        )
        .register(
            &["sleep", "wait"],
            ActionDescriptor::new(|props| Ok(Box::new(Sleep::new(props)?)))
                .with_schema(PropertySchema::new().binding("ms")),
        );
}

struct SetVariable {
    variable: String,
    value: Value,
}

impl SetVariable {
    fn new(mut props: Properties) -> Result<Self> {
        Ok(Self {
            variable: props.require_string("variable")?,
            value: props.take("value").unwrap_or_default(),
        })
    }
}

#[async_trait]
impl Action for SetVariable {
    async fn run(&self, ctx: &ActionContext<'_>) -> Result<Value> {
        debug!("Setting variable {} = {}", self.variable, self.value);
        ctx.scope.put(&self.variable, self.value.clone());
        Ok(self.value.clone())
    }
}

struct GetVariable {
    variable: String,
}

impl GetVariable {
    fn new(mut props: Properties) -> Result<Self> {
        Ok(Self {
            variable: props.require_string("variable")?,
        })
    }
}

#[async_trait]
impl Action for GetVariable {
    async fn run(&self, ctx: &ActionContext<'_>) -> Result<Value> {
        ctx.scope.lookup(&self.variable)
    }
}

struct Echo(Value);

#[async_trait]
impl Action for Echo {
    async fn run(&self, _ctx: &ActionContext<'_>) -> Result<Value> {
        Ok(self.0.clone())
    }
}

/// Passes when `value` is truthy, or equals `equals` when given.
struct Assert {
    value: Value,
    equals: Option<Value>,
    message: Option<String>,
}

impl Assert {
    fn new(mut props: Properties) -> Result<Self> {
        Ok(Self {
            value: props.require("value")?,
            equals: props.take("equals"),
            message: props.optional_string("message")?,
        })
    }

    fn holds(&self) -> bool {
        match &self.equals {
            Some(expected) => same(&self.value, expected),
            None => self.value.is_truthy(),
        }
    }
}

/// Equality on the JSON form, so `2` and `2.0` compare equal.
fn same(a: &Value, b: &Value) -> bool {
    match (a.to_json(), b.to_json()) {
        (serde_json::Value::Number(x), serde_json::Value::Number(y)) => x.as_f64() == y.as_f64(),
        (x, y) => x == y,
    }
}

#[async_trait]
impl Action for Assert {
    async fn run(&self, _ctx: &ActionContext<'_>) -> Result<Value> {
        if self.holds() {
            return Ok(self.value.clone());
        }
        Err(match (&self.message, &self.equals) {
            (Some(message), _) => anyhow!("{message}"),
            (None, Some(expected)) => anyhow!("Assertion failed: expected {expected}, got {}", self.value),
            (None, None) => anyhow!("Assertion failed: {} is not truthy", self.value),
        })
    }
}

struct Fail(Value);

#[async_trait]
impl Action for Fail {
    async fn run(&self, _ctx: &ActionContext<'_>) -> Result<Value> {
        match &self.0 {
            Value::Null => bail!("Step failed"),
            message => bail!("{message}"),
        }
    }
}

struct Log {
    message: Value,
    level: tracing::Level,
}

impl Log {
    fn new(mut props: Properties) -> Result<Self> {
        let level = match props.optional_string("level")? {
            None => tracing::Level::INFO,
            Some(level) => level
                .parse()
                .map_err(|_| anyhow!("Unknown log level '{level}'"))?,
        };
        Ok(Self {
            message: props.take("message").unwrap_or_default(),
            level,
        })
    }
}

#[async_trait]
impl Action for Log {
    async fn run(&self, ctx: &ActionContext<'_>) -> Result<Value> {
        let step = ctx.step_number;
        let message = &self.message;
        match self.level {
            tracing::Level::ERROR => error!(step, "{message}"),
            tracing::Level::WARN => warn!(step, "{message}"),
            tracing::Level::INFO => info!(step, "{message}"),
            tracing::Level::DEBUG => debug!(step, "{message}"),
            _ => trace!(step, "{message}"),
        }
        Ok(self.message.clone())
    }
}

struct Sleep {
    duration: Duration,
}

impl Sleep {
    fn new(mut props: Properties) -> Result<Self> {
        let ms = match props.require("ms")? {
            Value::Number(n) => n
                .as_u64()
                .ok_or_else(|| anyhow!("'ms' must be a non-negative integer, got {n}"))?,
            Value::String(s) => s
                .trim()
                .parse()
                .map_err(|_| anyhow!("'ms' must be a non-negative integer, got '{s}'"))?,
            other => bail!("'ms' must be a non-negative integer, got {other}"),
        };
        Ok(Self {
            duration: Duration::from_millis(ms),
        })
    }
}

#[async_trait]
impl Action for Sleep {
    async fn run(&self, _ctx: &ActionContext<'_>) -> Result<Value> {
        tokio::time::sleep(self.duration).await;
        Ok(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use crate::registry::ActionRegistry;
    use crate::scope::Scope;
    use crate::step::StepList;
    use crate::step_runner::StepRunner;
    use crate::value::Value;
    use serde_json::json;
    use std::sync::Arc;

    async fn run(steps: serde_json::Value, scope: &Scope) -> anyhow::Result<Vec<Value>> {
        let runner = StepRunner::new(Arc::new(ActionRegistry::with_builtins()));
        let steps = StepList::from_value(Value::from(steps))?;
        Ok(runner
            .run_test_steps(&steps, scope, &|i: usize| (i + 1).to_string())
            .await?)
    }

    #[tokio::test]
    async fn test_set_and_get_variable() {
        let scope = Scope::new();
        let results = run(
            json!([
                {"set-variable": {"variable": "user", "value": {"name": "ada"}}},
                {"get-variable": "user.name"},
                {"get-variable": "user"}
            ]),
            &scope,
        )
        .await
        .unwrap();
        assert_eq!(results[1], Value::from("ada"));
        assert_eq!(results[2], Value::from(json!({"name": "ada"})));
        assert_eq!(scope.get("user"), Some(Value::from(json!({"name": "ada"}))));
    }

    #[tokio::test]
    async fn test_assert_passes_and_fails() {
        let scope = Scope::new();
        scope.put("x", 5i64);
        run(
            json!([
                {"assert": "$(x * 2 == 10)"},
                {"type": "check", "values": {"value": "$(x * 2)", "equals": 10}},
                {"type": "check", "values": {"value": 2.0, "equals": 2}}
            ]),
            &scope,
        )
        .await
        .unwrap();

        let err = run(json!([{"type": "check", "values": {"value": "$(x)", "equals": 6}}]), &scope)
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("expected 6, got 5"));

        let err = run(json!([{"type": "assert", "values": {"value": false, "message": "custom"}}]), &scope)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("custom"));
    }

    #[tokio::test]
    async fn test_fail_message() {
        let err = run(json!([{"fail": "broken $(1 + 1)"}, "fail"]), &Scope::new())
            .await
            .unwrap_err();
        let text = err.to_string();
        assert!(text.contains("broken 2"), "{text}");
    }

    #[tokio::test]
    async fn test_log_and_sleep() {
        let results = run(
            json!([
                {"log": "hello"},
                {"type": "log", "values": {"message": "quiet", "level": "debug"}},
                {"sleep": 1},
                {"wait": "1"}
            ]),
            &Scope::new(),
        )
        .await
        .unwrap();
        assert_eq!(results, vec![Value::from("hello"), Value::from("quiet"), Value::Null, Value::Null]);
    }

    #[tokio::test]
    async fn test_log_rejects_unknown_level() {
        let err = run(
            json!([{"type": "log", "values": {"message": "x", "level": "loud"}}]),
            &Scope::new(),
        )
        .await
        .unwrap_err();
        assert!(format!("{err:#}").contains("Unknown log level 'loud'"));
    }
}
