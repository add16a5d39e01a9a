//! CEL-based expression evaluation and `$(...)` marker
//! interpolation.
//!
//! `evaluate` runs a raw expression with every context variable
//! bound as an identifier. `replace_variables` scans text for
//! `$(...)` markers, evaluates them together and substitutes the
//! results back in textual order.

use crate::properties::PropertyEvaluator;
use crate::value::{Value, Variables};
use anyhow::{anyhow, Result};
use cel::{Context, Program};
use futures::future::try_join_all;
use regex::Regex;
use std::ops::Range;
use std::sync::{Arc, LazyLock};
use tracing::{debug, warn};

/// Matches `$( ... )` with up to two levels of nested parentheses
/// inside the expression.
static MARKER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\(((?:[^()]|\((?:[^()]|\([^()]*\))*\))*)\)")
        .expect("failed to compile marker regex")
});

/// Evaluate a CEL expression against a variable context.
///
/// Only variables the expression references are bound, so lazy values
/// stay unresolved unless used. Any compile or execution error is
/// returned to the caller as is.
pub fn evaluate(code: &str, context: &Variables) -> Result<Value> {
    let program = compile(code)?;
    let references = program.references();
    let context = build_context(
        context
            .iter()
            .filter(|(key, _)| references.has_variable(key.as_str())),
    )?;
    let result = program
        .execute(&context)
        .map_err(|e| anyhow!("CEL execution error in '{code}': {e}"))?;

    Ok(Value::from(cel_to_json(&result)?))
}

/// A `$(...)` occurrence: the byte range of the whole marker and the
/// expression text inside it.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Marker {
    pub range: Range<usize>,
    pub code: String,
}

pub(crate) fn find_markers(text: &str) -> Vec<Marker> {
    MARKER_RE
        .captures_iter(text)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            Some(Marker {
                range: whole.range(),
                code: caps.get(1)?.as_str().to_string(),
            })
        })
        .collect()
}

/// Expression texts of the markers currently being expanded. A result
/// produced by an expression already on the trail is not expanded
/// again.
#[derive(Debug, Clone, Default)]
pub(crate) struct Trail(Arc<Vec<String>>);

impl Trail {
    fn contains(&self, code: &str) -> bool {
        self.0.iter().any(|c| c == code)
    }

    fn with(&self, code: &str) -> Trail {
        let mut codes = self.0.as_ref().clone();
        codes.push(code.to_string());
        Trail(Arc::new(codes))
    }
}

/// Interpolate every `$(...)` marker in `text`.
///
/// All markers are evaluated concurrently and substituted back in
/// match order. When `text` is exactly one marker, the evaluated value
/// is returned as is instead of its string form. With `recursive`, each
/// result is passed through property evaluation again.
pub(crate) async fn replace_variables(
    text: &str,
    properties: &PropertyEvaluator<'_>,
    recursive: bool,
    trail: &Trail,
) -> Result<Value> {
    let markers = find_markers(text);
    if markers.is_empty() {
        return Ok(Value::String(text.to_string()));
    }

    let evaluations = markers.iter().map(|marker| {
        let code = marker.code.as_str();
        async move {
            let value = properties.scope().evaluate(code)?;
            if !recursive {
                return Ok(value);
            }
            if trail.contains(code) {
                warn!("Expression '{code}' expands to itself, stopping recursion");
                return Ok(value);
            }
            properties
                .evaluate_traced(value, None, true, trail.with(code))
                .await
        }
    });
    let values: Vec<Value> = try_join_all(evaluations).await?;

    if markers.len() == 1 && markers[0].range == (0..text.len()) {
        return Ok(values.into_iter().next().unwrap_or_default());
    }

    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    for (marker, value) in markers.iter().zip(&values) {
        out.push_str(&text[last..marker.range.start]);
        out.push_str(&value.to_string());
        last = marker.range.end;
    }
    out.push_str(&text[last..]);

    Ok(Value::String(out))
}

/// Rewrite function aliases test authors commonly use.
///
/// - `len(x)` → `size(x)`
/// - `type(x)` → `type_of(x)` (avoid CEL keyword clash)
fn preprocess_expr(expr: &str) -> String {
    static LEN_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"\blen\(").expect("failed to compile len regex"));

    static TYPE_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"\btype\(").expect("failed to compile type regex"));

    let result = LEN_RE.replace_all(expr, "size(").into_owned();
    TYPE_RE.replace_all(&result, "type_of(").into_owned()
}

fn compile(expr: &str) -> Result<Program> {
    let processed = preprocess_expr(expr);
    debug!("Compiling CEL expression: {processed}");
    Program::compile(&processed)
        .map_err(|e| anyhow!("CEL compile error for '{processed}': {e}"))
}

fn build_context<'a, 'v>(vars: impl IntoIterator<Item = (&'v String, &'v Value)>) -> Result<Context<'a>> {
    let mut context = Context::default();

    for (key, value) in vars {
        context
            .add_variable(key.as_str(), value)
            .map_err(|e| anyhow!("Failed to add variable '{key}' to CEL context: {e}"))?;
    }

    register_custom_functions(&mut context);

    Ok(context)
}

fn register_custom_functions(context: &mut Context<'_>) {
    // compare(a, b) - deep equality check returning bool
    context.add_function("compare", |a: cel::Value, b: cel::Value| -> bool { a == b });

    // type_of(x) - returns type name as string
    context.add_function("type_of", |v: cel::Value| -> Arc<String> {
        let t = match v {
            cel::Value::Int(_) => "int",
            cel::Value::UInt(_) => "uint",
            cel::Value::Float(_) => "double",
            cel::Value::String(_) => "string",
            cel::Value::Bool(_) => "bool",
            cel::Value::List(_) => "list",
            cel::Value::Map(_) => "map",
            cel::Value::Null => "null",
            cel::Value::Bytes(_) => "bytes",
            _ => "unknown",
        };
        Arc::new(t.to_string())
    });

    // urlencode(str) - URL-encode a string
    context.add_function("urlencode", |s: Arc<String>| -> Arc<String> {
        Arc::new(url::form_urlencoded::byte_serialize(s.as_bytes()).collect::<String>())
    });
}

fn cel_to_json(value: &cel::Value) -> Result<serde_json::Value> {
    value
        .json()
        .map_err(|e| anyhow!("Failed to convert CEL value to JSON: {e}"))
}
