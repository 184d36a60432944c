//! Workflow Data Model
//!
//! Core data structures for `module` and `flow` documents.
//!
//! # Example YAML Format
//!
//! ```yaml
//! name: subdomain-enum
//! kind: module
//! params:
//!   - name: target
//!     required: true
//!   - name: threads
//!     default: 4
//! steps:
//!   - name: prepare
//!     type: function
//!     function: create_folder("{{output}}")
//!
//!   - name: enumerate
//!     type: bash
//!     command: subfinder -d {{target}} -o {{output}}/subs.txt
//!     timeout: 600
//!     exports:
//!       subdomains: "{{output}}/subs.txt"
//!     decision:
//!       - condition: subdomains|file_length == 0
//!         next: _end
//! ```

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Decision target that terminates the remaining sequence.
pub const END_TARGET: &str = "_end";

/// Top-level document kind.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DocumentKind {
    /// A linear/branching sequence of steps
    Module,
    /// A DAG of modules
    Flow,
}

impl std::fmt::Display for DocumentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Module => write!(f, "module"),
            Self::Flow => write!(f, "flow"),
        }
    }
}

/// A loaded workflow document. Treated as read-only once loaded.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct WorkflowDocument {
    pub name: String,

    pub kind: DocumentKind,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default)]
    pub params: Vec<ParamSpec>,

    /// Steps, for `module` documents
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub steps: Vec<StepSpec>,

    /// Module references, for `flow` documents
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub modules: Vec<ModuleRef>,

    /// File the document was read from, when loaded from disk
    #[serde(skip)]
    pub source_path: Option<PathBuf>,
}

/// A declared parameter.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ParamSpec {
    pub name: String,

    #[serde(default)]
    pub required: bool,

    #[serde(default, deserialize_with = "scalar_string", skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
}

/// Step type tag.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum StepType {
    Bash,
    RemoteBash,
    Function,
    Foreach,
    ParallelSteps,
}

impl std::fmt::Display for StepType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Bash => "bash",
            Self::RemoteBash => "remote-bash",
            Self::Function => "function",
            Self::Foreach => "foreach",
            Self::ParallelSteps => "parallel-steps",
        };
        write!(f, "{}", name)
    }
}

/// Execution environment for command steps.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StepRunner {
    #[serde(alias = "host")]
    Local,
    Docker,
}

/// Container settings for `step_runner: docker`.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct RunnerConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    #[serde(default, deserialize_with = "scalar_map", skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workdir: Option<String>,
}

/// A conditional branch overriding the default next node.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DecisionRule {
    pub condition: String,
    pub next: String,
}

impl DecisionRule {
    pub fn new(condition: impl Into<String>, next: impl Into<String>) -> Self {
        Self {
            condition: condition.into(),
            next: next.into(),
        }
    }

    /// True when the rule ends the sequence.
    pub fn is_terminal(&self) -> bool {
        self.next == END_TARGET
    }
}

/// Action kinds usable in `on_error` / `on_success`.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    Log,
    Continue,
    Abort,
    Notify,
    Export,
}

/// One hook action. A bare string (`- continue`) is accepted as shorthand.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(from = "HookActionRepr")]
pub struct HookAction {
    pub action: ActionKind,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

impl HookAction {
    pub fn new(action: ActionKind) -> Self {
        Self {
            action,
            message: None,
            name: None,
            value: None,
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum HookActionRepr {
    Bare(ActionKind),
    Full {
        action: ActionKind,
        #[serde(default)]
        message: Option<String>,
        #[serde(default)]
        name: Option<String>,
        #[serde(default, deserialize_with = "scalar_string")]
        value: Option<String>,
    },
}

impl From<HookActionRepr> for HookAction {
    fn from(repr: HookActionRepr) -> Self {
        match repr {
            HookActionRepr::Bare(action) => HookAction::new(action),
            HookActionRepr::Full {
                action,
                message,
                name,
                value,
            } => HookAction {
                action,
                message,
                name,
                value,
            },
        }
    }
}

/// One unit of work inside a module.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StepSpec {
    /// Unique name within the document
    pub name: String,

    #[serde(rename = "type")]
    pub step_type: StepType,

    /// Message logged before the step runs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub commands: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub functions: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parallel_commands: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parallel_functions: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parallel_steps: Vec<StepSpec>,

    /// Item source for `foreach`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<String>,

    /// Loop variable name for `foreach`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variable: Option<String>,

    /// Concurrency cap, number or template
    #[serde(default, deserialize_with = "scalar_string", skip_serializing_if = "Option::is_none")]
    pub threads: Option<String>,

    /// Body of a `foreach`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<Box<StepSpec>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_runner: Option<StepRunner>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_runner_config: Option<RunnerConfig>,

    /// Seconds, number or template
    #[serde(default, deserialize_with = "scalar_string", skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,

    #[serde(default, deserialize_with = "scalar_map", skip_serializing_if = "BTreeMap::is_empty")]
    pub exports: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub decision: Vec<DecisionRule>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre_condition: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub on_error: Vec<HookAction>,
}

impl StepSpec {
    /// Creates a step with no work attached.
    ///
    /// # Example
    ///
    /// ```
    /// use osmflow::workflow::{StepSpec, StepType};
    ///
    /// let step = StepSpec::new("probe", StepType::Bash)
    ///     .with_command("httpx -l {{subdomains}}")
    ///     .with_export("alive", "stdout");
    /// assert_eq!(step.exports["alive"], "stdout");
    /// ```
    pub fn new(name: impl Into<String>, step_type: StepType) -> Self {
        Self {
            name: name.into().trim().to_string(),
            step_type,
            log: None,
            command: None,
            commands: Vec::new(),
            function: None,
            functions: Vec::new(),
            parallel_commands: Vec::new(),
            parallel_functions: Vec::new(),
            parallel_steps: Vec::new(),
            input: None,
            variable: None,
            threads: None,
            step: None,
            step_runner: None,
            step_runner_config: None,
            timeout: None,
            exports: BTreeMap::new(),
            decision: Vec::new(),
            pre_condition: None,
            on_error: Vec::new(),
        }
    }

    /// Shorthand for a `bash` step with a single command.
    pub fn bash(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self::new(name, StepType::Bash).with_command(command)
    }

    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = Some(command.into());
        self
    }

    pub fn with_commands(mut self, commands: Vec<String>) -> Self {
        self.commands = commands;
        self
    }

    pub fn with_function(mut self, call: impl Into<String>) -> Self {
        self.function = Some(call.into());
        self
    }

    pub fn with_export(mut self, name: impl Into<String>, source: impl Into<String>) -> Self {
        self.exports.insert(name.into(), source.into());
        self
    }

    pub fn with_decision(mut self, condition: impl Into<String>, next: impl Into<String>) -> Self {
        self.decision.push(DecisionRule::new(condition, next));
        self
    }

    pub fn with_pre_condition(mut self, condition: impl Into<String>) -> Self {
        self.pre_condition = Some(condition.into());
        self
    }

    pub fn with_timeout(mut self, seconds: u64) -> Self {
        self.timeout = Some(seconds.to_string());
        self
    }

    pub fn with_on_error(mut self, action: ActionKind) -> Self {
        self.on_error.push(HookAction::new(action));
        self
    }

    /// Builds a `foreach` step over a newline-delimited file.
    pub fn foreach(
        name: impl Into<String>,
        input: impl Into<String>,
        variable: impl Into<String>,
        body: StepSpec,
    ) -> Self {
        let mut step = Self::new(name, StepType::Foreach);
        step.input = Some(input.into());
        step.variable = Some(variable.into());
        step.step = Some(Box::new(body));
        step
    }

    pub fn with_threads(mut self, threads: impl Into<String>) -> Self {
        self.threads = Some(threads.into());
        self
    }

    /// Nested step definitions (foreach body and parallel children).
    pub fn nested_steps(&self) -> Vec<&StepSpec> {
        let mut nested: Vec<&StepSpec> = self.parallel_steps.iter().collect();
        if let Some(body) = &self.step {
            nested.push(body);
        }
        nested
    }
}

/// A module referenced from a flow.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ModuleRef {
    pub name: String,

    /// Module document path, relative to the flow file
    pub path: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,

    #[serde(default, deserialize_with = "scalar_map", skip_serializing_if = "BTreeMap::is_empty")]
    pub params: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub on_success: Vec<HookAction>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub on_error: Vec<HookAction>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub decision: Vec<DecisionRule>,
}

impl ModuleRef {
    pub fn new(name: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            name: name.into().trim().to_string(),
            path: path.into(),
            depends_on: Vec::new(),
            params: BTreeMap::new(),
            condition: None,
            on_success: Vec::new(),
            on_error: Vec::new(),
            decision: Vec::new(),
        }
    }

    pub fn depends_on(mut self, module: impl Into<String>) -> Self {
        self.depends_on.push(module.into());
        self
    }

    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }

    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }
}

impl WorkflowDocument {
    /// Creates an empty `module` document.
    pub fn module(name: impl Into<String>) -> Self {
        Self::empty(name, DocumentKind::Module)
    }

    /// Creates an empty `flow` document.
    pub fn flow(name: impl Into<String>) -> Self {
        Self::empty(name, DocumentKind::Flow)
    }

    fn empty(name: impl Into<String>, kind: DocumentKind) -> Self {
        Self {
            name: name.into(),
            kind,
            description: None,
            params: Vec::new(),
            steps: Vec::new(),
            modules: Vec::new(),
            source_path: None,
        }
    }

    pub fn with_param(mut self, param: ParamSpec) -> Self {
        self.params.push(param);
        self
    }

    pub fn with_step(mut self, step: StepSpec) -> Self {
        self.steps.push(step);
        self
    }

    pub fn with_module(mut self, module: ModuleRef) -> Self {
        self.modules.push(module);
        self
    }

    pub fn get_step(&self, name: &str) -> Option<&StepSpec> {
        self.steps.iter().find(|s| s.name == name)
    }

    pub fn get_module(&self, name: &str) -> Option<&ModuleRef> {
        self.modules.iter().find(|m| m.name == name)
    }

    /// Node names in declaration order, whatever the kind.
    pub fn node_names(&self) -> Vec<&str> {
        match self.kind {
            DocumentKind::Module => self.steps.iter().map(|s| s.name.as_str()).collect(),
            DocumentKind::Flow => self.modules.iter().map(|m| m.name.as_str()).collect(),
        }
    }

    /// Number of top-level nodes.
    pub fn len(&self) -> usize {
        match self.kind {
            DocumentKind::Module => self.steps.len(),
            DocumentKind::Flow => self.modules.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ParamSpec {
    pub fn required(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            required: true,
            default: None,
        }
    }

    pub fn optional(name: impl Into<String>, default: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            required: false,
            default: Some(default.into()),
        }
    }
}

/// Converts a YAML scalar into its string form.
fn scalar_to_string<E: de::Error>(val: Value) -> Result<Option<String>, E> {
    match val {
        Value::Null => Ok(None),
        Value::String(s) => Ok(Some(s)),
        Value::Number(n) => Ok(Some(n.to_string())),
        Value::Bool(b) => Ok(Some(b.to_string())),
        _ => Err(E::custom("expected a string, number or boolean")),
    }
}

/// Deserializes an optional scalar (string, number, bool) as a string.
fn scalar_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let val = Value::deserialize(deserializer)?;
    scalar_to_string(val)
}

/// Deserializes a mapping of scalars into a string map.
fn scalar_map<'de, D>(deserializer: D) -> Result<BTreeMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    let val = Value::deserialize(deserializer)?;
    match val {
        Value::Null => Ok(BTreeMap::new()),
        Value::Object(map) => map
            .into_iter()
            .map(|(k, v)| Ok((k, scalar_to_string::<D::Error>(v)?.unwrap_or_default())))
            .collect(),
        _ => Err(de::Error::custom("expected a mapping of scalar values")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_builder() {
        let step = StepSpec::bash("scan", "nmap {{target}}")
            .with_export("report", "stdout")
            .with_decision("report == ''", END_TARGET)
            .with_timeout(30);

        assert_eq!(step.name, "scan");
        assert_eq!(step.step_type, StepType::Bash);
        assert_eq!(step.command.as_deref(), Some("nmap {{target}}"));
        assert_eq!(step.timeout.as_deref(), Some("30"));
        assert!(step.decision[0].is_terminal());
    }

    #[test]
    fn test_step_type_parsing() {
        let step: StepSpec = serde_yaml::from_str(
            "name: r\ntype: remote-bash\ncommand: id\nstep_runner: docker\nstep_runner_config:\n  image: alpine\n",
        )
        .unwrap();
        assert_eq!(step.step_type, StepType::RemoteBash);
        assert_eq!(step.step_runner, Some(StepRunner::Docker));
        assert_eq!(step.step_runner_config.unwrap().image.as_deref(), Some("alpine"));
    }

    #[test]
    fn test_numeric_scalars_become_strings() {
        let step: StepSpec = serde_yaml::from_str(
            "name: loop\ntype: foreach\ninput: items.txt\nvariable: item\nthreads: 2\ntimeout: 60\nstep:\n  name: body\n  type: bash\n  command: echo [[item]]\n",
        )
        .unwrap();
        assert_eq!(step.threads.as_deref(), Some("2"));
        assert_eq!(step.timeout.as_deref(), Some("60"));
        assert_eq!(step.step.as_ref().unwrap().name, "body");
    }

    #[test]
    fn test_param_default_scalar() {
        let param: ParamSpec = serde_yaml::from_str("name: threads\ndefault: 10\n").unwrap();
        assert!(!param.required);
        assert_eq!(param.default.as_deref(), Some("10"));

        let flag: ParamSpec = serde_yaml::from_str("name: skip\ndefault: false\n").unwrap();
        assert_eq!(flag.default.as_deref(), Some("false"));
    }

    #[test]
    fn test_hook_action_shorthand() {
        let actions: Vec<HookAction> = serde_yaml::from_str(
            "- continue\n- action: log\n  message: scan failed\n- action: export\n  name: failed\n  value: true\n",
        )
        .unwrap();

        assert_eq!(actions[0].action, ActionKind::Continue);
        assert_eq!(actions[1].message.as_deref(), Some("scan failed"));
        assert_eq!(actions[2].name.as_deref(), Some("failed"));
        assert_eq!(actions[2].value.as_deref(), Some("true"));
    }

    #[test]
    fn test_module_ref_params_scalars() {
        let module: ModuleRef = serde_yaml::from_str(
            "name: portscan\npath: modules/portscan.yaml\ndepends_on: [subdomain]\nparams:\n  ports: 1000\n  verbose: true\n",
        )
        .unwrap();
        assert_eq!(module.params["ports"], "1000");
        assert_eq!(module.params["verbose"], "true");
        assert_eq!(module.depends_on, vec!["subdomain"]);
    }

    #[test]
    fn test_document_lookup_and_names() {
        let doc = WorkflowDocument::module("m")
            .with_step(StepSpec::bash("a", "echo a"))
            .with_step(StepSpec::bash("b", "echo b"));

        assert_eq!(doc.node_names(), vec!["a", "b"]);
        assert!(doc.get_step("b").is_some());
        assert!(doc.get_step("c").is_none());
        assert_eq!(doc.len(), 2);

        let flow = WorkflowDocument::flow("f");
        assert!(flow.is_empty());
    }

    #[test]
    fn test_nested_steps() {
        let body = StepSpec::bash("body", "echo [[x]]");
        let step = StepSpec::foreach("loop", "in.txt", "x", body);
        assert_eq!(step.nested_steps().len(), 1);
    }
}
