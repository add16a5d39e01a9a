//! Control-flow actions: `if`, the `for-each-*` loops, `run-steps`,
//! `pipe`, `all` and `or`.

use crate::properties::{Properties, PropertySchema};
use crate::registry::{Action, ActionContext, ActionDescriptor, ActionRegistry};
use crate::step::StepList;
use crate::value::Value;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tracing::debug;

pub(super) fn register(registry: &mut ActionRegistry) {
    registry
        .register(
            &["if"],
            ActionDescriptor::new(|props| Ok(Box::new(If::new(props)?)))
                .with_schema(PropertySchema::new().skip("then").skip("else")),
        )
        .register(
            &["for-each-item", "for-each"],
            ActionDescriptor::new(|props| Ok(Box::new(ForEach::new(LoopKind::Item, props)?))),
        )
        .register(
            &["for-each-property"],
            ActionDescriptor::new(|props| Ok(Box::new(ForEach::new(LoopKind::Property, props)?))),
        )
        .register(
            &["for-each-element"],
            ActionDescriptor::new(|props| Ok(Box::new(ForEach::new(LoopKind::Element, props)?))),
        )
        .register(
            &["run-steps"],
            ActionDescriptor::new(|props| Ok(Box::new(RunSteps::new(props)?)))
                .with_schema(PropertySchema::new().binding("steps")),
        )
        .register(
            &["pipe"],
            ActionDescriptor::new(|props| Ok(Box::new(Pipe::new(props)?)))
                .with_schema(PropertySchema::new().binding("steps")),
        )
        .register(
            &["all"],
            ActionDescriptor::new(|props| Ok(Box::new(Junction::new(Junction::ALL, props)?)))
                .with_schema(PropertySchema::new().binding("steps")),
        )
        .register(
            &["or"],
            ActionDescriptor::new(|props| Ok(Box::new(Junction::new(Junction::ANY, props)?)))
                .with_schema(PropertySchema::new().binding("steps")),
        );
}

fn steps_property(props: &mut Properties, key: &str) -> Result<StepList> {
    let raw = props.take(key).unwrap_or_default();
    StepList::from_value(raw).with_context(|| format!("Invalid '{key}' property"))
}

/// Runs step `index` of `steps` alone, numbered `<base>.<index>`, and
/// returns its result. A skipped step yields `None`.
async fn run_single(
    ctx: &ActionContext<'_>,
    steps: &StepList,
    index: usize,
) -> Result<Option<Value>> {
    let single = StepList {
        steps: vec![steps.steps[index].clone()],
        variables: steps.variables.clone(),
    };
    let base = ctx.step_number;
    let numbering = |_: usize| format!("{base}.{index}");
    Ok(ctx.run_steps(&single, &numbering).await?.pop())
}

/// `if`: runs `then` when `condition` is truthy, `else` otherwise.
///
/// A condition still holding a string after property evaluation is
/// evaluated as an expression, so `condition: "x > 1"` works without
/// a `$( )` marker.
struct If {
    condition: Value,
    then: StepList,
    otherwise: StepList,
}

impl If {
    fn new(mut props: Properties) -> Result<Self> {
        Ok(Self {
            condition: props.require("condition")?,
            then: steps_property(&mut props, "then")?,
            otherwise: steps_property(&mut props, "else")?,
        })
    }
}

#[async_trait]
impl Action for If {
    async fn run(&self, ctx: &ActionContext<'_>) -> Result<Value> {
        let verdict = match &self.condition {
            Value::String(code) if code.trim().is_empty() => false,
            Value::String(code) => ctx
                .scope
                .evaluate(code)
                .with_context(|| format!("Failed to evaluate condition '{code}'"))?
                .is_truthy(),
            other => other.is_truthy(),
        };

        let base = ctx.step_number;
        let (branch, steps) = if verdict {
            ("then", &self.then)
        } else {
            ("else", &self.otherwise)
        };
        debug!("Condition is {verdict}, running {} '{branch}' step(s)", steps.len());

        let numbering = |i: usize| format!("{base}-{branch}-{i}");
        Ok(Value::array(ctx.run_steps(steps, &numbering).await?))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopKind {
    Item,
    Property,
    Element,
}

impl LoopKind {
    fn source(self) -> &'static str {
        match self {
            LoopKind::Item => "items",
            LoopKind::Property => "object",
            LoopKind::Element => "elements",
        }
    }

    /// Scope variables set before each iteration.
    fn variables(self) -> (&'static str, &'static str) {
        match self {
            LoopKind::Item => ("ITEM", "INDEX"),
            LoopKind::Property => ("NAME", "VALUE"),
            LoopKind::Element => ("ELEMENT", "ELEMENT_INDEX"),
        }
    }
}

/// The `for-each-*` loops: run `steps` once per entry of the source
/// collection. Returns one result array per iteration.
struct ForEach {
    kind: LoopKind,
    entries: Vec<(Value, Value)>,
    steps: StepList,
}

impl ForEach {
    fn new(kind: LoopKind, mut props: Properties) -> Result<Self> {
        let source = kind.source();
        let entries = match (kind, props.require(source)?.resolved()) {
            (LoopKind::Property, Value::Object(map)) => map
                .into_iter()
                .map(|(name, value)| (Value::String(name), value))
                .collect(),
            (LoopKind::Property, Value::Null) => Vec::new(),
            (LoopKind::Property, other) => bail!("'{source}' must be an object, got {other}"),
            (_, Value::Array { items, .. }) => items
                .into_iter()
                .enumerate()
                .map(|(index, item)| (item, Value::from(index)))
                .collect(),
            (_, Value::Null) => Vec::new(),
            (_, other) => bail!("'{source}' must be an array, got {other}"),
        };
        Ok(Self {
            kind,
            entries,
            steps: steps_property(&mut props, "steps")?,
        })
    }
}

#[async_trait]
impl Action for ForEach {
    async fn run(&self, ctx: &ActionContext<'_>) -> Result<Value> {
        let (first, second) = self.kind.variables();
        let base = ctx.step_number;
        let mut iterations = Vec::with_capacity(self.entries.len());

        for (iteration, (a, b)) in self.entries.iter().enumerate() {
            ctx.scope.put(first, a.clone());
            ctx.scope.put(second, b.clone());
            let numbering = |i: usize| format!("{base}-{iteration}.{i}");
            let results = ctx
                .run_steps(&self.steps, &numbering)
                .await
                .with_context(|| format!("Iteration {iteration} failed"))?;
            iterations.push(Value::array(results));
        }

        Ok(Value::array(iterations))
    }
}

/// `run-steps`: runs a nested list, optionally with extra base
/// variables.
struct RunSteps {
    steps: StepList,
}

impl RunSteps {
    fn new(mut props: Properties) -> Result<Self> {
        let mut steps = steps_property(&mut props, "steps")?;
        match props.take("variables").map(Value::resolved) {
            None | Some(Value::Null) => {}
            Some(Value::Object(extra)) => {
                let mut merged = steps.variables.take().unwrap_or_default();
                merged.extend(extra);
                steps.variables = Some(merged);
            }
            Some(other) => bail!("'variables' must be an object, got {other}"),
        }
        Ok(Self { steps })
    }
}

#[async_trait]
impl Action for RunSteps {
    async fn run(&self, ctx: &ActionContext<'_>) -> Result<Value> {
        let base = ctx.step_number;
        let numbering = |i: usize| format!("{base}.{i}");
        Ok(Value::array(ctx.run_steps(&self.steps, &numbering).await?))
    }
}

/// `pipe`: feeds each step's result to the next through a scope
/// variable (`PIPE` unless `variable` names another). Returns the last
/// result.
struct Pipe {
    steps: StepList,
    variable: String,
    input: Value,
}

impl Pipe {
    fn new(mut props: Properties) -> Result<Self> {
        Ok(Self {
            steps: steps_property(&mut props, "steps")?,
            variable: props
                .optional_string("variable")?
                .unwrap_or_else(|| "PIPE".to_string()),
            input: props.take("input").unwrap_or_default(),
        })
    }
}

#[async_trait]
impl Action for Pipe {
    async fn run(&self, ctx: &ActionContext<'_>) -> Result<Value> {
        let mut current = self.input.clone();
        for index in 0..self.steps.len() {
            ctx.scope.put(&self.variable, current.clone());
            if let Some(result) = run_single(ctx, &self.steps, index).await? {
                current = result;
            }
        }
        Ok(current)
    }
}

/// `all` and `or`: run steps one at a time until the outcome is known
/// from the truthiness of their results. Skipped steps do not count.
struct Junction {
    /// Result value that decides the junction early.
    deciding: bool,
    steps: StepList,
}

impl Junction {
    const ALL: bool = false;
    const ANY: bool = true;

    fn new(deciding: bool, mut props: Properties) -> Result<Self> {
        Ok(Self {
            deciding,
            steps: steps_property(&mut props, "steps")?,
        })
    }
}

#[async_trait]
impl Action for Junction {
    async fn run(&self, ctx: &ActionContext<'_>) -> Result<Value> {
        for index in 0..self.steps.len() {
            let Some(result) = run_single(ctx, &self.steps, index).await? else {
                debug!("Step {index} was skipped, not counted");
                continue;
            };
            if result.is_truthy() == self.deciding {
                debug!("Step {index} decided the junction");
                return Ok(Value::Bool(self.deciding));
            }
        }
        Ok(Value::Bool(!self.deciding))
    }
}
