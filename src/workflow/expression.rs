//! Condition and Call Expressions
//!
//! `pre_condition`, `condition` and `decision[].condition` are JEXL
//! expressions evaluated with `jexl-eval`:
//!
//! - Params and exports are context properties (`target == 'skip'`)
//! - Built-in functions are transforms (`'{{output}}/subs.txt'|file_length > 0`)
//! - `number` converts text for numeric comparisons (`count|number > 9`)
//!
//! `{{name}}` and `[[name]]` tokens are never spliced into the expression
//! text. Each one is rewritten to a generated context property bound to
//! its value, so quotes or operators inside a value stay data.
//!
//! `function` fields keep the `name(arg, ...)` call form; the arguments
//! are JEXL expressions evaluated the same way.

use std::sync::Mutex;
use std::io;
use std::path::Path;

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde_json::{Map, Number, Value};

use super::params::ExecutionContext;
use super::template::{expand_all, has_placeholders, LoopScope};
use crate::error::{Result, WorkflowError};
use crate::execution::functions::{self, Builtin};

/// String literals and the two placeholder forms, in one pass so a
/// placeholder inside a literal is seen together with its quotes.
static BINDABLE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?s)'(?:[^'\\]|\\.)*'|"(?:[^"\\]|\\.)*"|\{\{\s*([A-Za-z_][A-Za-z0-9_.\-]*)\s*\}\}|\[\[([A-Za-z_][A-Za-z0-9_]*)\]\]"#,
    )
    .unwrap()
});

static CALL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^\s*([A-Za-z_][A-Za-z0-9_]*)\s*\((.*)\)\s*$").unwrap());

const BOUND_PREFIX: &str = "__osmflow_bound_";

/// A value is truthy unless it is empty, `false` or `0`.
pub fn is_truthy(value: &str) -> bool {
    let value = value.trim();
    !(value.is_empty() || value == "false" || value == "0")
}

fn value_to_bool(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
        Value::String(s) => is_truthy(s),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

/// Text form of an evaluated value. Whole numbers print without a
/// fractional part.
pub fn value_to_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Number(n) => match n.as_f64() {
            Some(f) if f.fract() == 0.0 && f.abs() < 1e15 => format!("{}", f as i64),
            _ => n.to_string(),
        },
        other => other.to_string(),
    }
}

/// JEXL numbers are floats; integers are stored the same way so that
/// equality with literals holds.
fn float(n: f64) -> Option<Value> {
    Number::from_f64(n).map(Value::Number)
}

/// Built-in results typed for comparisons: counts are numbers and
/// checks are booleans.
fn typed_result(builtin: Builtin, output: String) -> Value {
    match builtin {
        Builtin::FileExists | Builtin::RemoveFile => Value::Bool(output == "true"),
        Builtin::FileLength | Builtin::Length => {
            match output.parse::<f64>().ok().and_then(float) {
                Some(number) => number,
                None => Value::String(output),
            }
        }
        _ => Value::String(output),
    }
}

fn to_number(value: &Value) -> std::result::Result<Value, String> {
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        other => value_to_text(other).trim().parse::<f64>().ok(),
    };
    parsed
        .and_then(float)
        .ok_or_else(|| format!("'{}' is not a number", value_to_text(value)))
}

fn unescape(literal: &str) -> String {
    let mut out = String::with_capacity(literal.len());
    let mut chars = literal.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(next) = chars.next() {
                out.push(next);
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// One token found while binding an expression.
enum Bindable<'t> {
    /// A whole string literal that contains placeholders (body unescaped)
    Literal(String),
    Global(&'t str),
    Loop(&'t str),
}

/// Rewrites every placeholder (and every literal containing one) to a
/// generated property, returning the new text and the bound values.
fn bind(
    source: &str,
    mut resolve: impl FnMut(Bindable<'_>, &str) -> Result<Value>,
) -> Result<(String, Vec<(String, Value)>)> {
    let mut text = String::with_capacity(source.len());
    let mut bound = Vec::new();
    let mut last = 0;

    for caps in BINDABLE.captures_iter(source) {
        let whole = match caps.get(0) {
            Some(m) => m,
            None => continue,
        };
        let Some(token) = classify(&caps) else { continue };

        let value = resolve(token, whole.as_str())?;
        let key = format!("{}{}", BOUND_PREFIX, bound.len());
        text.push_str(&source[last..whole.start()]);
        text.push(' ');
        text.push_str(&key);
        text.push(' ');
        bound.push((key, value));
        last = whole.end();
    }

    text.push_str(&source[last..]);
    Ok((text, bound))
}

fn classify<'t>(caps: &Captures<'t>) -> Option<Bindable<'t>> {
    if let Some(name) = caps.get(1) {
        return Some(Bindable::Global(name.as_str()));
    }
    if let Some(name) = caps.get(2) {
        return Some(Bindable::Loop(name.as_str()));
    }
    let literal = caps.get(0)?.as_str();
    let body = &literal[1..literal.len() - 1];
    has_placeholders(body).then(|| Bindable::Literal(unescape(body)))
}

/// Checks that `source` parses as a condition, without evaluating it.
///
/// Placeholders are bound to null and the expression sits behind a
/// short-circuited `false &&`, so only syntax errors are reported.
pub fn check(source: &str) -> std::result::Result<(), String> {
    let (text, bound) = bind(source, |_, _| Ok(Value::Null)).map_err(|e| e.to_string())?;
    let mut context = Map::new();
    context.extend(bound);

    let mut engine = jexl_eval::Evaluator::new().with_transform("number", |_: &[Value]| Ok(Value::Null));
    for builtin in Builtin::ALL {
        engine = engine.with_transform(builtin.name(), |_: &[Value]| Ok(Value::Null));
    }

    let guarded = format!("false && ({})", text);
    engine
        .eval_in_context(&guarded, &Value::Object(context))
        .map(|_| ())
        .map_err(|e| e.to_string())
}

/// Checks the `name(args...)` form of a function field and that `name`
/// is a built-in.
pub fn check_call(source: &str) -> std::result::Result<(), String> {
    let caps = CALL
        .captures(source)
        .ok_or_else(|| "not a function call".to_string())?;
    let name = caps.get(1).map_or("", |m| m.as_str());
    if Builtin::from_name(name).is_none() {
        return Err(format!("unknown function '{}'", name));
    }
    let args = caps.get(2).map_or("", |m| m.as_str());
    if args.trim().is_empty() {
        return Ok(());
    }
    check(&format!("[{}]", args))
}

/// Evaluates expressions against a context on behalf of one node.
pub struct Evaluator<'a> {
    context: &'a ExecutionContext,
    node: &'a str,
    working_dir: Option<&'a Path>,
    loop_scope: Option<&'a LoopScope>,
}

impl<'a> Evaluator<'a> {
    pub fn new(context: &'a ExecutionContext, node: &'a str) -> Self {
        Self {
            context,
            node,
            working_dir: None,
            loop_scope: None,
        }
    }

    pub fn with_working_dir(mut self, working_dir: Option<&'a Path>) -> Self {
        self.working_dir = working_dir;
        self
    }

    /// Binds `[[name]]` tokens from a foreach iteration.
    pub fn with_loop_scope(mut self, scope: Option<&'a LoopScope>) -> Self {
        self.loop_scope = scope;
        self
    }

    fn unbound(&self, token: &str) -> WorkflowError {
        WorkflowError::UnboundPlaceholder {
            node: self.node.to_string(),
            token: token.to_string(),
        }
    }

    fn resolve(&self, token: Bindable<'_>, raw: &str) -> Result<Value> {
        let value = match token {
            Bindable::Literal(body) => expand_all(&body, self.context, self.loop_scope, self.node)?,
            Bindable::Global(name) => self
                .context
                .get(name)
                .ok_or_else(|| self.unbound(raw))?
                .to_string(),
            Bindable::Loop(name) => self
                .loop_scope
                .and_then(|scope| scope.get(name))
                .ok_or_else(|| self.unbound(raw))?
                .to_string(),
        };
        Ok(Value::String(value))
    }

    /// Params and exports as one JSON object, plus the bound tokens.
    fn context_object(&self, bound: Vec<(String, Value)>) -> Value {
        let mut object: Map<String, Value> = self
            .context
            .flatten()
            .into_iter()
            .map(|(name, value)| (name, Value::String(value)))
            .collect();
        object.extend(bound);
        Value::Object(object)
    }

    /// The JEXL evaluator with every built-in registered as a transform.
    /// A failing built-in leaves its message in `failure`.
    fn engine<'e>(&'e self, failure: &'e Mutex<Option<String>>) -> jexl_eval::Evaluator<'e> {
        let working_dir = self.working_dir;
        let mut engine = jexl_eval::Evaluator::new().with_transform("number", move |args: &[Value]| {
            to_number(args.first().unwrap_or(&Value::Null)).map_err(|message| {
                failure.lock().unwrap().get_or_insert(message.clone());
                io::Error::other(message).into()
            })
        });

        for builtin in Builtin::ALL {
            engine = engine.with_transform(builtin.name(), move |args: &[Value]| {
                let args: Vec<String> = args.iter().map(value_to_text).collect();
                functions::call(builtin.name(), &args, working_dir)
                    .map(|output| typed_result(builtin, output))
                    .map_err(|message| {
                        failure.lock().unwrap().get_or_insert(message.clone());
                        io::Error::other(message).into()
                    })
            });
        }
        engine
    }

    /// Binds placeholders and evaluates `source`.
    ///
    /// Unbound placeholders are `UnboundPlaceholder`, failing built-ins
    /// are `RunnerFailure` and anything JEXL rejects is a schema error.
    /// Properties missing from the context evaluate to null.
    pub fn eval(&self, source: &str) -> Result<Value> {
        let (text, bound) = bind(source, |token, raw| self.resolve(token, raw))?;
        let context = self.context_object(bound);

        let failure = Mutex::new(None);
        let result = self
            .engine(&failure)
            .eval_in_context(&text, &context)
            .map_err(|e| e.to_string());

        result.map_err(|message| match failure.into_inner().unwrap() {
            Some(cause) => WorkflowError::runner(self.node, cause),
            None => WorkflowError::schema(
                Some(self.node),
                format!("cannot evaluate '{}': {}", source, message),
            ),
        })
    }

    /// Evaluates `source` as a boolean condition.
    pub fn condition(&self, source: &str) -> Result<bool> {
        Ok(value_to_bool(&self.eval(source)?))
    }

    /// Evaluates a `name(args...)` call, as used by `function` steps.
    pub fn call(&self, source: &str) -> Result<String> {
        let caps = CALL.captures(source).ok_or_else(|| {
            WorkflowError::schema(Some(self.node), format!("'{}' is not a function call", source))
        })?;
        let name = caps.get(1).map_or("", |m| m.as_str());
        let args = caps.get(2).map_or("", |m| m.as_str());

        let values = if args.trim().is_empty() {
            Vec::new()
        } else {
            match self.eval(&format!("[{}]", args))? {
                Value::Array(items) => items.iter().map(value_to_text).collect(),
                other => vec![value_to_text(&other)],
            }
        };

        functions::call(name, &values, self.working_dir)
            .map_err(|message| WorkflowError::runner(self.node, message))
    }
}
