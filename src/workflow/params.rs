//! Parameter Resolution
//!
//! Binds declared parameters to concrete values and holds the values a
//! run accumulates: the [`ExecutionContext`].

use std::collections::BTreeMap;

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use super::model::WorkflowDocument;
use super::template::expand;
use crate::error::{Result, WorkflowError};

/// Parameter and export values visible to placeholder expansion.
///
/// The engine is the only writer. Nodes see a frozen clone taken at the
/// start of their batch and hand back a delta of new exports.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct ExecutionContext {
    params: BTreeMap<String, String>,
    exports: BTreeMap<String, String>,
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a context holding only the given params.
    pub fn from_params(params: BTreeMap<String, String>) -> Self {
        Self {
            params,
            exports: BTreeMap::new(),
        }
    }

    /// Looks up a name, preferring exports over params.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.exports
            .get(name)
            .or_else(|| self.params.get(name))
            .map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn params(&self) -> &BTreeMap<String, String> {
        &self.params
    }

    pub fn exports(&self) -> &BTreeMap<String, String> {
        &self.exports
    }

    pub fn set_param(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.params.insert(name.into(), value.into());
    }

    /// Adds one export. Exports are single-assignment: a second write to
    /// the same name is ignored and reported as `false`.
    pub fn insert_export(&mut self, name: &str, value: &str) -> bool {
        if let Some(existing) = self.exports.get(name) {
            if existing != value {
                warn!(
                    "Export '{}' already bound to '{}'; ignoring new value '{}'",
                    name, existing, value
                );
            }
            return false;
        }
        self.exports.insert(name.to_string(), value.to_string());
        true
    }

    /// Folds a completed node's exports into the context.
    pub fn fold(&mut self, node: &str, delta: &BTreeMap<String, String>) {
        for (name, value) in delta {
            if self.insert_export(name, value) {
                debug!("'{}' exported {}={}", node, name, value);
            }
        }
    }

    /// Flattens params and exports into one map, exports winning.
    pub fn flatten(&self) -> BTreeMap<String, String> {
        let mut merged = self.params.clone();
        merged.extend(self.exports.iter().map(|(k, v)| (k.clone(), v.clone())));
        merged
    }
}

/// Resolves a document's parameters into a fresh context.
///
/// For each declared parameter, in order: a supplied value wins, then
/// the default (ignored for required parameters), otherwise a required
/// parameter fails with `MissingRequiredParam`. Defaults may refer to
/// earlier parameters with `{{name}}`. Supplied values that the document
/// does not declare are kept as overrides.
///
/// # Example
///
/// ```
/// use std::collections::BTreeMap;
/// use osmflow::workflow::{resolve, ParamSpec, StepSpec, WorkflowDocument};
///
/// let doc = WorkflowDocument::module("scan")
///     .with_param(ParamSpec::required("target"))
///     .with_param(ParamSpec::optional("output", "/tmp/{{target}}"))
///     .with_step(StepSpec::bash("run", "echo {{output}}"));
///
/// let supplied = BTreeMap::from([("target".to_string(), "example.com".to_string())]);
/// let context = resolve(&doc, &supplied).unwrap();
/// assert_eq!(context.get("output"), Some("/tmp/example.com"));
/// ```
pub fn resolve(
    document: &WorkflowDocument,
    supplied: &BTreeMap<String, String>,
) -> Result<ExecutionContext> {
    let mut context = ExecutionContext::new();

    for (name, value) in supplied {
        if !document.params.iter().any(|p| &p.name == name) {
            debug!("Keeping undeclared parameter override '{}'", name);
            context.set_param(name, value);
        }
    }

    for param in &document.params {
        if let Some(value) = supplied.get(&param.name) {
            context.set_param(&param.name, value);
            continue;
        }

        if param.required {
            return Err(WorkflowError::MissingRequiredParam(param.name.clone()));
        }

        if let Some(default) = &param.default {
            let value = expand(default, &context, &format!("params.{}", param.name))?;
            context.set_param(&param.name, value);
        }
    }

    debug!("Resolved {} parameters", context.params().len());
    Ok(context)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::model::{ParamSpec, StepSpec};

    fn supplied(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn doc() -> WorkflowDocument {
        WorkflowDocument::module("m")
            .with_param(ParamSpec::required("target"))
            .with_param(ParamSpec::optional("threads", "4"))
            .with_step(StepSpec::bash("a", "echo"))
    }

    #[test]
    fn test_supplied_value_wins() {
        let context = resolve(&doc(), &supplied(&[("target", "a.com"), ("threads", "8")])).unwrap();
        assert_eq!(context.get("target"), Some("a.com"));
        assert_eq!(context.get("threads"), Some("8"));
    }

    #[test]
    fn test_default_used() {
        let context = resolve(&doc(), &supplied(&[("target", "a.com")])).unwrap();
        assert_eq!(context.get("threads"), Some("4"));
    }

    #[test]
    fn test_missing_required_param() {
        let err = resolve(&doc(), &BTreeMap::new()).unwrap_err();
        match err {
            WorkflowError::MissingRequiredParam(name) => assert_eq!(name, "target"),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_required_ignores_default() {
        let mut param = ParamSpec::required("target");
        param.default = Some("fallback".to_string());
        let doc = WorkflowDocument::module("m")
            .with_param(param)
            .with_step(StepSpec::bash("a", "echo"));
        assert!(matches!(
            resolve(&doc, &BTreeMap::new()),
            Err(WorkflowError::MissingRequiredParam(_))
        ));
    }

    #[test]
    fn test_optional_without_default_is_unset() {
        let doc = WorkflowDocument::module("m")
            .with_param(ParamSpec {
                name: "proxy".to_string(),
                required: false,
                default: None,
            })
            .with_step(StepSpec::bash("a", "echo"));
        let context = resolve(&doc, &BTreeMap::new()).unwrap();
        assert!(!context.contains("proxy"));
    }

    #[test]
    fn test_default_refers_to_earlier_param() {
        let doc = doc().with_param(ParamSpec::optional("output", "{{target}}-out"));
        let context = resolve(&doc, &supplied(&[("target", "a.com")])).unwrap();
        assert_eq!(context.get("output"), Some("a.com-out"));
    }

    #[test]
    fn test_default_with_unbound_placeholder() {
        let doc = doc().with_param(ParamSpec::optional("output", "{{workspace}}/x"));
        let err = resolve(&doc, &supplied(&[("target", "a.com")])).unwrap_err();
        assert!(matches!(err, WorkflowError::UnboundPlaceholder { .. }));
    }

    #[test]
    fn test_undeclared_override_kept() {
        let context = resolve(&doc(), &supplied(&[("target", "a.com"), ("extra", "1")])).unwrap();
        assert_eq!(context.get("extra"), Some("1"));
    }

    #[test]
    fn test_exports_are_single_assignment() {
        let mut context = ExecutionContext::new();
        assert!(context.insert_export("subs", "a.txt"));
        assert!(!context.insert_export("subs", "b.txt"));
        assert_eq!(context.get("subs"), Some("a.txt"));
    }

    #[test]
    fn test_exports_shadow_params() {
        let mut context = ExecutionContext::from_params(supplied(&[("x", "param")]));
        context.fold("node", &supplied(&[("x", "export")]));
        assert_eq!(context.get("x"), Some("export"));
        assert_eq!(context.flatten()["x"], "export");
        assert_eq!(context.params()["x"], "param");
    }
}
