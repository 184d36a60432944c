//! Workflow Execution Engine
//!
//! The core engine that runs a document from start to finish:
//! - Parameter resolution and graph building, before anything executes
//! - Batch scheduling through the planner
//! - Parallel module execution within a flow batch
//! - Export folding in declaration order after every batch
//! - `on_error` / `on_success` hooks
//! - Pause/resume via file-based signaling
//!
//! The engine is the only writer of the execution context. Nodes of a
//! batch borrow it immutably and hand back their exports.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use log::{debug, error, info, warn};

use crate::environment::DOCKER_PATH;
use crate::error::{Result, WorkflowError};
use crate::monitoring::{EventType, ExecutionTimeline};
use crate::workflow::graph::build;
use crate::workflow::model::{ActionKind, DocumentKind, HookAction, WorkflowDocument};
use crate::workflow::params::{resolve, ExecutionContext};
use crate::workflow::parser::load_workflow;
use crate::workflow::planner::{plan, ExecutionBatch, ExecutionPlanner};
use crate::workflow::report::{NodeRecord, NodeStatus, RunReport};
use crate::workflow::template::{expand, has_placeholders};

use super::pool::run_bounded;
use super::step::{execute_step, StepScope};

/// Interval for checking the pause flag file.
const PAUSE_CHECK_INTERVAL: Duration = Duration::from_millis(500);

/// What a node left behind, whether it succeeded or not.
struct NodeResult {
    name: String,
    result: Result<BTreeMap<String, String>>,
    /// Records of a child module run by a flow
    children: Vec<NodeRecord>,
}

/// How the `on_error` actions of a failed node resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FailurePolicy {
    Recover,
    Abort,
}

/// Workflow execution engine.
///
/// # Example
///
/// ```rust,no_run
/// use std::collections::BTreeMap;
/// use osmflow::execution::Engine;
/// use osmflow::workflow::load_workflow;
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let document = load_workflow("flows/recon.yaml")?;
///     let mut engine = Engine::new(document);
///     engine.set_max_parallel(4);
///     engine.set_working_dir("/data/recon");
///
///     let params = BTreeMap::from([("target".to_string(), "example.com".to_string())]);
///     let report = engine.run(&params)?;
///     println!("succeeded: {}", report.succeeded);
///     Ok(())
/// }
/// ```
pub struct Engine {
    document: WorkflowDocument,
    max_parallel: usize,
    dry_run: bool,
    pause_flag_path: Option<PathBuf>,
    working_dir: Option<PathBuf>,
    docker_binary: PathBuf,
}

impl Engine {
    /// Creates a new execution engine for a document.
    pub fn new(document: WorkflowDocument) -> Self {
        Self {
            document,
            max_parallel: num_cpus::get(),
            dry_run: false,
            pause_flag_path: None,
            working_dir: None,
            docker_binary: DOCKER_PATH.clone(),
        }
    }

    pub fn document(&self) -> &WorkflowDocument {
        &self.document
    }

    /// Sets the worker pool size for flow batches and parallel steps.
    pub fn set_max_parallel(&mut self, max: usize) {
        self.max_parallel = max.max(1);
    }

    /// Enables or disables dry run mode.
    pub fn set_dry_run(&mut self, dry_run: bool) {
        self.dry_run = dry_run;
    }

    /// Sets the path for pause/resume signaling.
    pub fn set_pause_flag_path(&mut self, path: impl Into<PathBuf>) {
        self.pause_flag_path = Some(path.into());
    }

    /// Sets the working directory for step execution.
    pub fn set_working_dir(&mut self, dir: impl Into<PathBuf>) {
        self.working_dir = Some(dir.into());
    }

    /// Sets the container binary used by `remote-bash` steps.
    pub fn set_docker_binary(&mut self, binary: impl Into<PathBuf>) {
        self.docker_binary = binary.into();
    }

    /// Resolves parameters and builds the planner. Every error here is
    /// raised before any node runs.
    fn prepare(&self, supplied: &BTreeMap<String, String>) -> Result<(ExecutionContext, ExecutionPlanner)> {
        let context = resolve(&self.document, supplied)?;
        let graph = build(&self.document)?;
        if self.document.kind == DocumentKind::Flow {
            self.check_modules()?;
        }
        let mut planner = plan(graph);
        planner.set_working_dir(self.working_dir.clone());
        Ok((context, planner))
    }

    /// Loads and builds every flow module whose path has no placeholders,
    /// returning the module's own error. Templated paths are only known
    /// once their batch runs.
    fn check_modules(&self) -> Result<()> {
        for module in &self.document.modules {
            if has_placeholders(&module.path) {
                debug!("Module '{}' path '{}' is resolved at run time", module.name, module.path);
                continue;
            }
            let document = load_module(&module.name, &self.module_path(&module.path))?;
            build(&document)?;
        }
        Ok(())
    }

    /// Plans the whole run without executing anything, treating every
    /// node as successful.
    pub fn plan(&self, supplied: &BTreeMap<String, String>) -> Result<Vec<ExecutionBatch>> {
        let (context, planner) = self.prepare(supplied)?;
        planner.dry_run_batches(&context)
    }

    /// Executes the document.
    ///
    /// # Returns
    ///
    /// * `Err` - parameters, graph or references are invalid; nothing ran
    /// * `Ok(report)` - the run happened; `report.succeeded` is false if a
    ///   node failed without recovering, and `report.error` says why
    pub fn run(&self, supplied: &BTreeMap<String, String>) -> Result<RunReport> {
        let (mut context, mut planner) = self.prepare(supplied)?;
        let mut report = RunReport::new(&self.document.name, self.document.kind);

        info!(
            "Starting {} '{}' (max parallel: {}, dry run: {})",
            self.document.kind, self.document.name, self.max_parallel, self.dry_run
        );

        if self.dry_run {
            return self.preview(context, planner, report);
        }

        let timeline = Mutex::new(ExecutionTimeline::new());
        let mut abort: Option<WorkflowError> = None;

        loop {
            if let Some(pause_path) = &self.pause_flag_path {
                self.check_pause_flag(pause_path);
            }

            let batch = match planner.next_batch(&context) {
                Ok(Some(batch)) => batch,
                Ok(None) => break,
                Err(e) => {
                    error!("Planning failed: {}", e);
                    abort = Some(e);
                    break;
                }
            };

            for name in &batch.skipped {
                info!("Skipped '{}'", name);
                mark(&timeline, name, EventType::Skipped, batch.index);
                report.push(NodeRecord::skipped(name));
            }

            if batch.nodes.is_empty() {
                continue;
            }

            info!("Batch {}: {}", batch.index, batch.nodes.join(", "));

            // Nodes borrow the context for the whole batch; it is only
            // written once every node has finished.
            let snapshot = &context;
            let results = run_bounded(batch.nodes.clone(), self.max_parallel, |_, name| {
                mark(&timeline, &name, EventType::Started, batch.index);
                let node = self.execute_node(&name, snapshot);
                let event = if node.result.is_ok() {
                    EventType::Succeeded
                } else {
                    EventType::Failed
                };
                mark(&timeline, &name, event, batch.index);
                node
            });

            for node in results {
                let duration = timeline.lock().ok().and_then(|t| t.duration_of(&node.name));
                let NodeResult { name, result, children } = node;

                let record = match result {
                    Ok(exports) => {
                        info!("'{}' completed successfully", name);
                        context.fold(&name, &exports);
                        self.run_success_hooks(&name, &mut context);
                        planner.record(&name, NodeStatus::Success);
                        NodeRecord::success(&name, exports)
                    }
                    Err(e) => {
                        error!("'{}' failed: {}", name, e);
                        let record = NodeRecord::failed(&name, &e);
                        planner.record(&name, NodeStatus::Failed);
                        match self.run_error_hooks(&name, &mut context) {
                            FailurePolicy::Recover => warn!("'{}' failure recovered by on_error", name),
                            FailurePolicy::Abort => {
                                planner.halt();
                                if abort.is_none() {
                                    abort = Some(e);
                                }
                            }
                        }
                        record
                    }
                };

                let record = match duration {
                    Some(ms) => record.with_duration(ms),
                    None => record,
                };
                report.push(record.with_children(children));
            }

            if abort.is_some() {
                break;
            }
        }

        if let Ok(timeline) = timeline.lock() {
            debug!("{}", timeline.gantt_chart());
        }

        match &abort {
            Some(e) => error!("'{}' aborted: {}", self.document.name, e),
            None => info!("'{}' completed successfully", self.document.name),
        }

        report.finish(context, abort.as_ref());
        Ok(report)
    }

    /// Walks the plan without executing, printing what would run.
    fn preview(
        &self,
        context: ExecutionContext,
        planner: ExecutionPlanner,
        mut report: RunReport,
    ) -> Result<RunReport> {
        for batch in planner.dry_run_batches(&context)? {
            for name in &batch.skipped {
                println!("[DRY RUN] Skip: {}", name);
                report.push(NodeRecord::skipped(name));
            }
            for name in &batch.nodes {
                println!();
                println!("[DRY RUN] Batch {}: {}", batch.index, name);
                self.describe_node(name);
                report.push(NodeRecord::success(name, BTreeMap::new()));
            }
        }

        report.finish(context, None);
        Ok(report)
    }

    fn describe_node(&self, name: &str) {
        match self.document.kind {
            DocumentKind::Module => {
                if let Some(step) = self.document.get_step(name) {
                    println!("  Type: {}", step.step_type);
                    let commands = step.command.iter().chain(&step.commands).chain(&step.parallel_commands);
                    for command in commands {
                        println!("  Command: {}", command);
                    }
                    let calls = step.function.iter().chain(&step.functions).chain(&step.parallel_functions);
                    for call in calls {
                        println!("  Function: {}", call);
                    }
                    if let Some(input) = &step.input {
                        println!("  Input: {}", input);
                    }
                }
            }
            DocumentKind::Flow => {
                if let Some(module) = self.document.get_module(name) {
                    println!("  Path: {}", module.path);
                    if !module.params.is_empty() {
                        println!("  Params: {:?}", module.params);
                    }
                }
            }
        }
    }

    fn execute_node(&self, name: &str, context: &ExecutionContext) -> NodeResult {
        let (result, children) = match self.document.kind {
            DocumentKind::Module => (self.execute_module_step(name, context), Vec::new()),
            DocumentKind::Flow => self.execute_flow_module(name, context),
        };
        NodeResult {
            name: name.to_string(),
            result,
            children,
        }
    }

    fn execute_module_step(&self, name: &str, context: &ExecutionContext) -> Result<BTreeMap<String, String>> {
        let step = self
            .document
            .get_step(name)
            .ok_or_else(|| WorkflowError::runner(name, "step is not declared"))?;

        let scope = StepScope::new(context, &self.docker_binary)
            .with_working_dir(self.working_dir.as_deref())
            .with_max_parallel(self.max_parallel);
        Ok(execute_step(step, &scope)?.exports)
    }

    /// Runs a flow module as a child engine and propagates its exports.
    fn execute_flow_module(
        &self,
        name: &str,
        context: &ExecutionContext,
    ) -> (Result<BTreeMap<String, String>>, Vec<NodeRecord>) {
        let child = match self.child_engine(name, context) {
            Ok(child) => child,
            Err(e) => return (Err(e), Vec::new()),
        };
        let (engine, supplied) = child;

        match engine.run(&supplied) {
            Ok(report) if report.succeeded => (Ok(report.context.exports().clone()), report.nodes),
            Ok(report) => {
                let message = report.error.clone().unwrap_or_else(|| "module failed".to_string());
                (
                    Err(WorkflowError::runner(name, format!("module '{}': {}", report.workflow, message))),
                    report.nodes,
                )
            }
            Err(e) => (Err(WorkflowError::runner(name, e.to_string())), Vec::new()),
        }
    }

    /// Loads a flow module's document and the parameters it receives:
    /// the flow's context overlaid with the module's own `params`.
    fn child_engine(&self, name: &str, context: &ExecutionContext) -> Result<(Engine, BTreeMap<String, String>)> {
        let module = self
            .document
            .get_module(name)
            .ok_or_else(|| WorkflowError::runner(name, "module is not declared"))?;

        let path = self.module_path(&expand(&module.path, context, name)?);
        info!("Loading module '{}' from {}", name, path.display());

        let document = load_module(name, &path)?;

        let mut supplied = context.flatten();
        for (key, value) in &module.params {
            supplied.insert(key.clone(), expand(value, context, name)?);
        }

        let mut engine = Engine::new(document);
        engine.max_parallel = self.max_parallel;
        engine.working_dir = self.working_dir.clone();
        engine.pause_flag_path = self.pause_flag_path.clone();
        engine.docker_binary = self.docker_binary.clone();
        Ok((engine, supplied))
    }

    /// Module paths are relative to the flow file, then the working dir.
    fn module_path(&self, path: &str) -> PathBuf {
        let path = PathBuf::from(path);
        if path.is_absolute() {
            return path;
        }
        let base = self
            .document
            .source_path
            .as_deref()
            .and_then(Path::parent)
            .or(self.working_dir.as_deref());
        match base {
            Some(dir) => dir.join(path),
            None => path,
        }
    }

    fn on_error_actions(&self, name: &str) -> &[HookAction] {
        let actions = match self.document.kind {
            DocumentKind::Module => self.document.get_step(name).map(|s| s.on_error.as_slice()),
            DocumentKind::Flow => self.document.get_module(name).map(|m| m.on_error.as_slice()),
        };
        actions.unwrap_or(&[])
    }

    /// Runs `on_error` in order. `log` and `continue` recover the node;
    /// `abort`, or no recovering action at all, aborts the run.
    fn run_error_hooks(&self, name: &str, context: &mut ExecutionContext) -> FailurePolicy {
        let actions = self.on_error_actions(name);
        let mut policy = FailurePolicy::Abort;

        for action in actions {
            run_hook(name, action, context);
            match action.action {
                ActionKind::Abort => return FailurePolicy::Abort,
                ActionKind::Log | ActionKind::Continue => policy = FailurePolicy::Recover,
                ActionKind::Notify | ActionKind::Export => {}
            }
        }

        policy
    }

    /// Runs a flow module's `on_success` actions.
    fn run_success_hooks(&self, name: &str, context: &mut ExecutionContext) {
        if self.document.kind != DocumentKind::Flow {
            return;
        }
        if let Some(module) = self.document.get_module(name) {
            for action in &module.on_success {
                run_hook(name, action, context);
            }
        }
    }

    /// Checks if pause flag exists and waits for it to be removed.
    fn check_pause_flag(&self, pause_flag_path: &Path) {
        if pause_flag_path.exists() {
            info!("Execution paused - waiting for resume signal");

            while pause_flag_path.exists() {
                thread::sleep(PAUSE_CHECK_INTERVAL);
            }

            info!("Resumed");
        }
    }
}

/// Loads the document behind a flow module; it must be a `module`.
fn load_module(name: &str, path: &Path) -> Result<WorkflowDocument> {
    let document = load_workflow(path)?;
    if document.kind != DocumentKind::Module {
        return Err(WorkflowError::schema(
            Some(name),
            format!("{} is a {}, expected a module", path.display(), document.kind),
        ));
    }
    Ok(document)
}

fn mark(timeline: &Mutex<ExecutionTimeline>, node: &str, event: EventType, batch: usize) {
    if let Ok(mut timeline) = timeline.lock() {
        timeline.add_event(node, event, batch);
    }
}

/// Runs one hook action. Problems are logged, never raised.
fn run_hook(node: &str, action: &HookAction, context: &mut ExecutionContext) {
    let render = |text: &str, context: &ExecutionContext| match expand(text, context, node) {
        Ok(rendered) => rendered,
        Err(e) => {
            warn!("'{}': hook text not rendered: {}", node, e);
            text.to_string()
        }
    };

    match action.action {
        ActionKind::Log | ActionKind::Notify => {
            if let Some(message) = &action.message {
                let message = render(message, &*context);
                if action.action == ActionKind::Notify {
                    warn!("[{}] notify: {}", node, message);
                } else {
                    info!("[{}] {}", node, message);
                }
            }
        }
        ActionKind::Export => match (&action.name, &action.value) {
            (Some(key), Some(value)) => {
                let value = render(value, &*context);
                context.insert_export(key, &value);
            }
            _ => warn!("'{}': export hook needs 'name' and 'value'", node),
        },
        ActionKind::Continue | ActionKind::Abort => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::load;
    use std::fs;
    use tempfile::tempdir;

    const DECISION_MODULE: &str = r#"
name: test-decision
kind: module
params:
  - name: target
    required: true
steps:
  - name: check-condition
    type: bash
    command: echo {{target}} > check.txt
    decision:
      - condition: "target == 'skip'"
        next: _end
      - condition: "target == 'jump'"
        next: final-step
  - name: middle-step
    type: bash
    command: touch middle.txt
  - name: final-step
    type: bash
    command: touch final.txt
"#;

    fn params(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn engine_in(document: &str, dir: &Path) -> Engine {
        let mut engine = Engine::new(load(document).unwrap());
        engine.set_working_dir(dir);
        engine.set_max_parallel(4);
        engine
    }

    #[test]
    fn test_engine_configuration() {
        let mut engine = Engine::new(load(DECISION_MODULE).unwrap());
        assert_eq!(engine.max_parallel, num_cpus::get().max(1));
        assert!(!engine.dry_run);

        engine.set_max_parallel(0);
        engine.set_dry_run(true);
        engine.set_pause_flag_path("/tmp/pause.flag");
        engine.set_docker_binary("/usr/bin/podman");

        assert_eq!(engine.max_parallel, 1);
        assert!(engine.dry_run);
        assert_eq!(engine.pause_flag_path, Some(PathBuf::from("/tmp/pause.flag")));
        assert_eq!(engine.docker_binary, PathBuf::from("/usr/bin/podman"));
    }

    #[test]
    fn test_decision_end_stops_module() {
        let dir = tempdir().unwrap();
        let report = engine_in(DECISION_MODULE, dir.path())
            .run(&params(&[("target", "skip")]))
            .unwrap();

        assert!(report.succeeded);
        assert_eq!(report.node_names(), vec!["check-condition"]);
        assert!(dir.path().join("check.txt").exists());
        assert!(!dir.path().join("middle.txt").exists());
        assert!(!dir.path().join("final.txt").exists());
    }

    #[test]
    fn test_decision_jump_skips_middle() {
        let dir = tempdir().unwrap();
        let report = engine_in(DECISION_MODULE, dir.path())
            .run(&params(&[("target", "jump")]))
            .unwrap();

        assert_eq!(report.node_names(), vec!["check-condition", "final-step"]);
        assert!(!dir.path().join("middle.txt").exists());
        assert!(dir.path().join("final.txt").exists());
    }

    #[test]
    fn test_default_sequence() {
        let dir = tempdir().unwrap();
        let report = engine_in(DECISION_MODULE, dir.path())
            .run(&params(&[("target", "example.com")]))
            .unwrap();
        assert_eq!(report.node_names(), vec!["check-condition", "middle-step", "final-step"]);
        assert!(report.nodes.iter().all(|n| n.duration_ms.is_some()));
    }

    #[test]
    fn test_missing_required_param_runs_nothing() {
        let dir = tempdir().unwrap();
        let err = engine_in(DECISION_MODULE, dir.path()).run(&BTreeMap::new()).unwrap_err();
        assert!(matches!(err, WorkflowError::MissingRequiredParam(ref name) if name == "target"));
        assert!(!dir.path().join("check.txt").exists());
    }

    #[test]
    fn test_foreach_with_threads() {
        let dir = tempdir().unwrap();
        let document = r#"
name: test-loop
kind: module
steps:
  - name: seed
    type: bash
    command: printf 'a\nb\nc\nd\ne\n' > items.txt
    exports:
      items: items.txt
  - name: loop
    type: foreach
    input: "{{items}}"
    variable: item
    threads: 2
    step:
      name: touch-item
      type: bash
      command: touch done-[[item]]
"#;
        let report = engine_in(document, dir.path()).run(&BTreeMap::new()).unwrap();

        assert!(report.succeeded, "{:?}", report.error);
        for item in ["a", "b", "c", "d", "e"] {
            assert!(dir.path().join(format!("done-{}", item)).exists());
        }
        assert_eq!(report.context.get("items"), Some("items.txt"));
    }

    #[test]
    fn test_exports_flow_between_steps() {
        let dir = tempdir().unwrap();
        let document = r#"
name: chain
kind: module
steps:
  - name: produce
    type: bash
    command: echo first-value
    exports:
      value: stdout
  - name: consume
    type: bash
    command: echo {{value}} > consumed.txt
"#;
        let report = engine_in(document, dir.path()).run(&BTreeMap::new()).unwrap();
        assert!(report.succeeded);
        let consumed = fs::read_to_string(dir.path().join("consumed.txt")).unwrap();
        assert_eq!(consumed.trim(), "first-value");
        assert_eq!(report.node("produce").unwrap().exports["value"], "first-value");
    }

    #[test]
    fn test_failure_without_policy_aborts() {
        let dir = tempdir().unwrap();
        let document = r#"
name: failing
kind: module
steps:
  - name: broken
    type: bash
    command: exit 7
  - name: after
    type: bash
    command: touch after.txt
"#;
        let report = engine_in(document, dir.path()).run(&BTreeMap::new()).unwrap();
        assert!(!report.succeeded);
        assert!(report.error.as_deref().unwrap().contains("exit status 7"));
        assert_eq!(report.node("broken").unwrap().status, NodeStatus::Failed);
        assert!(report.node("after").is_none());
        assert!(!dir.path().join("after.txt").exists());
    }

    #[test]
    fn test_on_error_continue_recovers() {
        let dir = tempdir().unwrap();
        let document = r#"
name: recovering
kind: module
steps:
  - name: broken
    type: bash
    command: exit 7
    on_error:
      - action: log
        message: "broken step for {{target}}"
      - action: export
        name: broken_failed
        value: "true"
      - continue
  - name: after
    type: bash
    command: touch after.txt
params:
  - name: target
    default: example.com
"#;
        let report = engine_in(document, dir.path()).run(&BTreeMap::new()).unwrap();
        assert!(report.succeeded);
        assert_eq!(report.node("broken").unwrap().status, NodeStatus::Failed);
        assert_eq!(report.context.get("broken_failed"), Some("true"));
        assert!(dir.path().join("after.txt").exists());
    }

    #[test]
    fn test_on_error_abort_wins() {
        let dir = tempdir().unwrap();
        let document = r#"
name: aborting
kind: module
steps:
  - name: broken
    type: bash
    command: exit 1
    on_error: [log, abort]
  - name: after
    type: bash
    command: touch after.txt
"#;
        let report = engine_in(document, dir.path()).run(&BTreeMap::new()).unwrap();
        assert!(!report.succeeded);
        assert!(!dir.path().join("after.txt").exists());
    }

    #[test]
    fn test_pre_condition_skip_recorded() {
        let dir = tempdir().unwrap();
        let document = r#"
name: gated
kind: module
params:
  - name: mode
    default: quick
steps:
  - name: deep
    type: bash
    command: touch deep.txt
    pre_condition: "mode == 'full'"
  - name: always
    type: bash
    command: touch always.txt
"#;
        let report = engine_in(document, dir.path()).run(&BTreeMap::new()).unwrap();
        assert_eq!(report.node("deep").unwrap().status, NodeStatus::Skipped);
        assert_eq!(report.node("always").unwrap().status, NodeStatus::Success);
        assert!(!dir.path().join("deep.txt").exists());
    }

    fn write(dir: &Path, name: &str, content: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, content).unwrap();
        path
    }

    fn recon_flow(dir: &Path) -> PathBuf {
        write(
            dir,
            "subdomain.yaml",
            r#"
name: subdomain
kind: module
params:
  - name: target
    required: true
steps:
  - name: enumerate
    type: bash
    command: "printf 'a.{{target}}\nb.{{target}}\n' > subs.txt"
    exports:
      subdomains: subs.txt
"#,
        );
        write(
            dir,
            "vulnscan.yaml",
            r#"
name: vulnscan
kind: module
steps:
  - name: scan
    type: bash
    command: cp {{subdomains}} vulns.txt
"#,
        );
        write(
            dir,
            "report.yaml",
            r#"
name: report
kind: module
params:
  - name: title
    required: true
steps:
  - name: summarize
    type: bash
    command: "echo {{title}} $(wc -l < {{subdomains}}) > report.txt"
"#,
        );
        write(
            dir,
            "recon.yaml",
            r#"
name: recon
kind: flow
params:
  - name: target
    required: true
  - name: skip_vuln_scan
    default: "false"
modules:
  - name: subdomain-module
    path: subdomain.yaml
  - name: vulnscan-module
    path: vulnscan.yaml
    depends_on: [subdomain-module]
    condition: "skip_vuln_scan != 'true'"
  - name: report-module
    path: report.yaml
    depends_on: [vulnscan-module]
    params:
      title: "Recon {{target}}"
    on_success:
      - action: export
        name: report_done
        value: "yes"
"#,
        )
    }

    fn flow_engine(flow_path: &Path, work: &Path) -> Engine {
        let mut engine = Engine::new(load_workflow(flow_path).unwrap());
        engine.set_working_dir(work);
        engine.set_max_parallel(2);
        engine
    }

    #[test]
    fn test_flow_condition_skips_module() {
        let defs = tempdir().unwrap();
        let work = tempdir().unwrap();
        let flow = recon_flow(defs.path());

        let report = flow_engine(&flow, work.path())
            .run(&params(&[("target", "example.com"), ("skip_vuln_scan", "true")]))
            .unwrap();

        assert!(report.succeeded, "{:?}", report.error);
        assert_eq!(
            report.node_names(),
            vec!["subdomain-module", "vulnscan-module", "report-module"]
        );
        assert_eq!(report.node("vulnscan-module").unwrap().status, NodeStatus::Skipped);
        assert!(!work.path().join("vulns.txt").exists());

        let summary = fs::read_to_string(work.path().join("report.txt")).unwrap();
        assert_eq!(summary.trim(), "Recon example.com 2");
        assert_eq!(report.context.get("subdomains"), Some("subs.txt"));
        assert_eq!(report.context.get("report_done"), Some("yes"));

        let subdomain = report.node("subdomain-module").unwrap();
        assert_eq!(subdomain.children[0].name, "enumerate");
    }

    #[test]
    fn test_flow_runs_all_modules() {
        let defs = tempdir().unwrap();
        let work = tempdir().unwrap();
        let flow = recon_flow(defs.path());

        let report = flow_engine(&flow, work.path())
            .run(&params(&[("target", "example.com")]))
            .unwrap();

        assert!(report.succeeded, "{:?}", report.error);
        assert_eq!(report.count(NodeStatus::Success), 3);
        assert!(work.path().join("vulns.txt").exists());
    }

    #[test]
    fn test_flow_child_failure_aborts() {
        let defs = tempdir().unwrap();
        let work = tempdir().unwrap();
        let flow = recon_flow(defs.path());
        fs::write(
            defs.path().join("vulnscan.yaml"),
            "name: vulnscan\nkind: module\nsteps:\n  - name: scan\n    type: bash\n    command: exit 9\n",
        )
        .unwrap();

        let report = flow_engine(&flow, work.path())
            .run(&params(&[("target", "example.com")]))
            .unwrap();

        assert!(!report.succeeded);
        assert!(report.error.as_deref().unwrap().contains("vulnscan-module"));
        assert!(report.node("report-module").is_none());
        assert_eq!(report.node("vulnscan-module").unwrap().children.len(), 1);
    }

    #[test]
    fn test_flow_cycle_is_rejected_before_running() {
        let flow = load(
            r#"
name: cyclic
kind: flow
modules:
  - name: a
    path: a.yaml
    depends_on: [c]
  - name: b
    path: b.yaml
    depends_on: [a]
  - name: c
    path: c.yaml
    depends_on: [b]
"#,
        )
        .unwrap();
        let err = Engine::new(flow).run(&BTreeMap::new()).unwrap_err();
        assert!(matches!(err, WorkflowError::CyclicDependency { .. }));
    }

    #[test]
    fn test_broken_flow_module_fails_before_running() {
        let defs = tempdir().unwrap();
        let work = tempdir().unwrap();
        write(
            defs.path(),
            "a.yaml",
            "name: a\nkind: module\nsteps:\n  - name: touch\n    type: bash\n    command: touch a.txt\n",
        );
        write(
            defs.path(),
            "b.yaml",
            r#"
name: b
kind: module
steps:
  - name: route
    type: bash
    command: echo b
    decision:
      - condition: "true"
        next: nowhere
"#,
        );
        let flow = write(
            defs.path(),
            "flow.yaml",
            "name: f\nkind: flow\nmodules:\n  - name: a\n    path: a.yaml\n  - name: b\n    path: b.yaml\n    depends_on: [a]\n",
        );

        let err = flow_engine(&flow, work.path()).run(&BTreeMap::new()).unwrap_err();
        match err {
            WorkflowError::UnknownStepTarget { step, target } => {
                assert_eq!(step, "route");
                assert_eq!(target, "nowhere");
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(!work.path().join("a.txt").exists());
    }

    #[test]
    fn test_missing_flow_module_fails_before_running() {
        let defs = tempdir().unwrap();
        let work = tempdir().unwrap();
        write(
            defs.path(),
            "a.yaml",
            "name: a\nkind: module\nsteps:\n  - name: touch\n    type: bash\n    command: touch a.txt\n",
        );
        let flow = write(
            defs.path(),
            "flow.yaml",
            "name: f\nkind: flow\nmodules:\n  - name: a\n    path: a.yaml\n  - name: b\n    path: missing.yaml\n    depends_on: [a]\n",
        );

        let mut engine = flow_engine(&flow, work.path());
        assert!(engine.run(&BTreeMap::new()).is_err());
        engine.set_dry_run(true);
        assert!(engine.run(&BTreeMap::new()).is_err());
        assert!(!work.path().join("a.txt").exists());
    }

    #[test]
    fn test_plan_is_deterministic() {
        let defs = tempdir().unwrap();
        let flow = recon_flow(defs.path());
        let engine = Engine::new(load_workflow(&flow).unwrap());
        let supplied = params(&[("target", "example.com"), ("skip_vuln_scan", "true")]);

        let first = engine.plan(&supplied).unwrap();
        for _ in 0..5 {
            assert_eq!(engine.plan(&supplied).unwrap(), first);
        }
        assert_eq!(first.len(), 2);
        assert_eq!(first[1].skipped, vec!["vulnscan-module"]);
        assert_eq!(first[1].nodes, vec!["report-module"]);
    }

    #[test]
    fn test_dry_run_executes_nothing() {
        let dir = tempdir().unwrap();
        let mut engine = engine_in(DECISION_MODULE, dir.path());
        engine.set_dry_run(true);

        let report = engine.run(&params(&[("target", "skip")])).unwrap();
        assert!(report.succeeded);
        assert!(!dir.path().join("check.txt").exists());
        assert_eq!(report.node_names(), vec!["check-condition"]);
    }

    #[test]
    fn test_pause_flag_check() {
        let dir = tempdir().unwrap();
        let engine = engine_in(DECISION_MODULE, dir.path());
        let pause_path = dir.path().join("pause.flag");

        fs::write(&pause_path, "paused").unwrap();
        let remover = {
            let pause_path = pause_path.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(100));
                fs::remove_file(pause_path).unwrap();
            })
        };

        engine.check_pause_flag(&pause_path);
        assert!(!pause_path.exists());
        remover.join().unwrap();
    }
}
