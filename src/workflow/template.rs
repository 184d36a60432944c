//! Placeholder Expansion
//!
//! Two token forms are recognised:
//!
//! - `[[name]]` — loop-local variables, only inside `foreach` bodies
//! - `{{name}}` — parameters and exports from the execution context
//!
//! [`render_step`] applies both passes to a copy of a step, loop
//! variables first, so a step is fully resolved before it is dispatched.
//! Nested steps (foreach body, parallel children) are left as-is and
//! rendered when they are dispatched themselves.

use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use regex::{Captures, Regex};

use super::model::StepSpec;
use super::params::ExecutionContext;
use crate::error::{Result, WorkflowError};

static GLOBAL_TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_.\-]*)\s*\}\}").unwrap());

static LOOP_TOKEN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\[\[([A-Za-z_][A-Za-z0-9_]*)\]\]").unwrap());

/// Loop variables bound for one foreach iteration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoopScope {
    vars: BTreeMap<String, String>,
}

impl LoopScope {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of this scope with one more variable bound.
    pub fn with(&self, name: impl Into<String>, value: impl Into<String>) -> Self {
        let mut vars = self.vars.clone();
        vars.insert(name.into(), value.into());
        Self { vars }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }
}

/// Replaces every match of `pattern`, failing on the first name that
/// `lookup` cannot bind. Substituted values are not rescanned.
fn substitute<'a>(
    pattern: &Regex,
    text: &str,
    node: &str,
    lookup: impl Fn(&str) -> Option<&'a str>,
) -> Result<String> {
    let mut result = String::with_capacity(text.len());
    let mut last = 0;

    for caps in pattern.captures_iter(text) {
        let whole = caps.get(0).map_or(0..0, |m| m.range());
        let name = token_name(&caps);
        let value = lookup(name).ok_or_else(|| WorkflowError::UnboundPlaceholder {
            node: node.to_string(),
            token: text[whole.clone()].to_string(),
        })?;
        result.push_str(&text[last..whole.start]);
        result.push_str(value);
        last = whole.end;
    }

    result.push_str(&text[last..]);
    Ok(result)
}

fn token_name<'t>(caps: &Captures<'t>) -> &'t str {
    caps.get(1).map_or("", |m| m.as_str())
}

/// Expands `{{name}}` placeholders from the context.
pub fn expand(text: &str, context: &ExecutionContext, node: &str) -> Result<String> {
    substitute(&GLOBAL_TOKEN, text, node, |name| context.get(name))
}

/// Expands `[[name]]` loop variables. Without a scope any loop token is
/// unbound.
pub fn expand_loop(text: &str, scope: Option<&LoopScope>, node: &str) -> Result<String> {
    substitute(&LOOP_TOKEN, text, node, |name| scope.and_then(|s| s.get(name)))
}

/// Runs both passes on one string: loop variables, then globals.
pub fn expand_all(
    text: &str,
    context: &ExecutionContext,
    scope: Option<&LoopScope>,
    node: &str,
) -> Result<String> {
    let local = expand_loop(text, scope, node)?;
    expand(&local, context, node)
}

/// True if the text contains any `{{...}}` or `[[...]]` token.
pub fn has_placeholders(text: &str) -> bool {
    GLOBAL_TOKEN.is_match(text) || LOOP_TOKEN.is_match(text)
}

/// Produces a fully resolved copy of a step's own fields.
///
/// Conditions (`pre_condition`, `decision`) and function calls are left
/// as written: the expression evaluator binds their placeholders as
/// values instead of rewriting the text.
pub fn render_step(
    step: &StepSpec,
    context: &ExecutionContext,
    scope: Option<&LoopScope>,
) -> Result<StepSpec> {
    let node = step.name.as_str();
    let render = |text: &str| expand_all(text, context, scope, node);
    let render_opt = |text: &Option<String>| text.as_deref().map(render).transpose();
    let render_vec = |items: &[String]| items.iter().map(|t| render(t.as_str())).collect::<Result<Vec<_>>>();

    let mut rendered = step.clone();
    rendered.log = render_opt(&step.log)?;
    rendered.command = render_opt(&step.command)?;
    rendered.commands = render_vec(&step.commands)?;
    rendered.parallel_commands = render_vec(&step.parallel_commands)?;
    rendered.input = render_opt(&step.input)?;
    rendered.threads = render_opt(&step.threads)?;
    rendered.timeout = render_opt(&step.timeout)?;

    if let Some(config) = &step.step_runner_config {
        let mut config = config.clone();
        config.image = render_opt(&config.image)?;
        config.workdir = render_opt(&config.workdir)?;
        config.volumes = render_vec(&config.volumes)?;
        for value in config.env.values_mut() {
            *value = render(value.as_str())?;
        }
        rendered.step_runner_config = Some(config);
    }

    for source in rendered.exports.values_mut() {
        *source = render(source.as_str())?;
    }

    Ok(rendered)
}
