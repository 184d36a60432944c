//! Individual Step Execution
//!
//! Handles the execution of a single step including:
//! - Placeholder rendering (loop variables, then parameters and exports)
//! - Choosing the action the step describes
//! - Local `bash -c` or `docker run` for commands
//! - Built-in function calls
//! - Bounded fan-out for parallel and foreach steps
//! - Timeouts and export capture
//!
//! The step sees a frozen context and never writes to it. New exports
//! travel back to the engine in [`StepOutcome`].

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, error, info, warn};

use super::pool::run_bounded;
use super::process::{self, parse_timeout, Deadline};
use crate::environment::docker;
use crate::error::{Result, WorkflowError};
use crate::workflow::expression::Evaluator;
use crate::workflow::model::{ActionKind, RunnerConfig, StepRunner, StepSpec, StepType};
use crate::workflow::params::ExecutionContext;
use crate::workflow::template::{render_step, LoopScope};

/// Export sources that capture the step's output instead of a literal.
const OUTPUT_SOURCES: &[&str] = &["stdout", "output"];

/// What a rendered step asks for. Exactly one per step.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Command(String),
    Commands(Vec<String>),
    ParallelCommands(Vec<String>),
    Function(String),
    Functions(Vec<String>),
    ParallelFunctions(Vec<String>),
    ParallelSteps(Vec<StepSpec>),
    Foreach {
        input: String,
        variable: String,
        threads: usize,
        body: StepSpec,
    },
}

impl Action {
    /// Picks the action of a rendered step. For command and function
    /// steps the single form wins over the list form, which wins over
    /// the parallel form.
    pub fn from_step(step: &StepSpec) -> Result<Self> {
        let fail = |message: &str| WorkflowError::schema(Some(&step.name), message);
        let single = |value: &Option<String>| value.clone().filter(|v| !v.trim().is_empty());

        match step.step_type {
            StepType::Bash | StepType::RemoteBash => {
                if let Some(command) = single(&step.command) {
                    Ok(Self::Command(command))
                } else if !step.commands.is_empty() {
                    Ok(Self::Commands(step.commands.clone()))
                } else if !step.parallel_commands.is_empty() {
                    Ok(Self::ParallelCommands(step.parallel_commands.clone()))
                } else {
                    Err(fail("nothing to run"))
                }
            }
            StepType::Function => {
                if let Some(call) = single(&step.function) {
                    Ok(Self::Function(call))
                } else if !step.functions.is_empty() {
                    Ok(Self::Functions(step.functions.clone()))
                } else if !step.parallel_functions.is_empty() {
                    Ok(Self::ParallelFunctions(step.parallel_functions.clone()))
                } else {
                    Err(fail("nothing to call"))
                }
            }
            StepType::ParallelSteps => Ok(Self::ParallelSteps(step.parallel_steps.clone())),
            StepType::Foreach => {
                let input = single(&step.input).ok_or_else(|| fail("foreach needs 'input'"))?;
                let variable = single(&step.variable).ok_or_else(|| fail("foreach needs 'variable'"))?;
                let body = step
                    .step
                    .as_deref()
                    .cloned()
                    .ok_or_else(|| fail("foreach needs a nested 'step'"))?;
                let threads = match single(&step.threads) {
                    Some(value) => value
                        .trim()
                        .parse::<usize>()
                        .ok()
                        .filter(|&n| n > 0)
                        .ok_or_else(|| fail(&format!("invalid threads '{}'", value)))?,
                    None => 1,
                };
                Ok(Self::Foreach {
                    input,
                    variable,
                    threads,
                    body,
                })
            }
        }
    }
}

/// Where command actions run.
#[derive(Debug, Clone, PartialEq)]
enum Runner {
    Local,
    Docker { image: String, config: RunnerConfig },
}

impl Runner {
    fn for_step(step: &StepSpec) -> Result<Self> {
        if step.step_type != StepType::RemoteBash {
            return Ok(Self::Local);
        }
        if step.step_runner != Some(StepRunner::Docker) {
            return Err(WorkflowError::schema(Some(&step.name), "remote-bash needs 'step_runner: docker'"));
        }
        let config = step.step_runner_config.clone().unwrap_or_default();
        let image = config
            .image
            .clone()
            .filter(|i| !i.trim().is_empty())
            .ok_or_else(|| WorkflowError::schema(Some(&step.name), "remote-bash needs an image"))?;
        Ok(Self::Docker { image, config })
    }
}

/// Everything a step may read while it runs.
#[derive(Debug, Clone)]
pub struct StepScope<'a> {
    /// Frozen context of the current batch
    pub context: &'a ExecutionContext,
    /// Loop variables, inside a foreach body
    pub loop_scope: Option<&'a LoopScope>,
    pub working_dir: Option<&'a Path>,
    pub docker_binary: &'a Path,
    /// Deadline inherited from an enclosing step
    pub deadline: Option<Deadline>,
    /// Cap for parallel fan-out
    pub max_parallel: usize,
}

impl<'a> StepScope<'a> {
    pub fn new(context: &'a ExecutionContext, docker_binary: &'a Path) -> Self {
        Self {
            context,
            loop_scope: None,
            working_dir: None,
            docker_binary,
            deadline: None,
            max_parallel: num_cpus::get(),
        }
    }

    pub fn with_working_dir(mut self, dir: Option<&'a Path>) -> Self {
        self.working_dir = dir;
        self
    }

    pub fn with_max_parallel(mut self, max: usize) -> Self {
        self.max_parallel = max.max(1);
        self
    }

    fn evaluator<'s>(&'s self, node: &'s str) -> Evaluator<'s> {
        Evaluator::new(self.context, node)
            .with_working_dir(self.working_dir)
            .with_loop_scope(self.loop_scope)
    }
}

/// Output and new exports of a successful step.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepOutcome {
    /// Trimmed output, in declaration (or item) order
    pub output: String,
    pub exports: BTreeMap<String, String>,
}

impl StepOutcome {
    fn merge(&mut self, other: StepOutcome) {
        for (name, value) in other.exports {
            self.exports.entry(name).or_insert(value);
        }
    }
}

/// Executes a top-level step. Its `pre_condition` has already been
/// checked by the planner.
pub fn execute_step(step: &StepSpec, scope: &StepScope) -> Result<StepOutcome> {
    let rendered = render_step(step, scope.context, scope.loop_scope)?;

    if let Some(message) = &rendered.log {
        info!("[{}] {}", rendered.name, message);
    }

    let own_deadline = match rendered.timeout.as_deref() {
        Some(value) => {
            let seconds = parse_timeout(value).ok_or_else(|| {
                WorkflowError::schema(Some(&rendered.name), format!("invalid timeout '{}'", value))
            })?;
            Some(Deadline::after(seconds))
        }
        None => None,
    };
    let deadline = match own_deadline {
        Some(own) => Some(own.tighter(scope.deadline)),
        None => scope.deadline,
    };
    let scope = StepScope {
        deadline,
        ..scope.clone()
    };

    debug!("Executing {} step '{}'", rendered.step_type, rendered.name);
    let action = Action::from_step(&rendered)?;

    let mut outcome = match dispatch(&rendered, action, &scope) {
        Ok(outcome) => outcome,
        Err(e) => {
            return Err(match deadline {
                Some(d) if d.expired() && !matches!(e, WorkflowError::Timeout { .. }) => WorkflowError::Timeout {
                    node: rendered.name.clone(),
                    seconds: d.seconds(),
                },
                _ => e,
            });
        }
    };

    for (name, source) in &rendered.exports {
        let value = if OUTPUT_SOURCES.contains(&source.as_str()) {
            outcome.output.trim().to_string()
        } else {
            source.clone()
        };
        // The step's own exports win over those bubbled up from children.
        outcome.exports.insert(name.clone(), value);
    }

    Ok(outcome)
}

/// Executes a nested step (foreach body, parallel child), honouring its
/// `pre_condition`. A skipped nested step succeeds with no output.
fn execute_nested(step: &StepSpec, scope: &StepScope) -> Result<StepOutcome> {
    if let Some(condition) = &step.pre_condition {
        let holds = scope.evaluator(&step.name).condition(condition)?;
        if !holds {
            debug!("Skipping nested step '{}': pre_condition false", step.name);
            return Ok(StepOutcome::default());
        }
    }
    execute_step(step, scope)
}

fn dispatch(step: &StepSpec, action: Action, scope: &StepScope) -> Result<StepOutcome> {
    let node = step.name.as_str();

    match action {
        Action::Command(command) => Ok(StepOutcome {
            output: run_command(step, &command, scope)?,
            ..StepOutcome::default()
        }),
        Action::Commands(commands) => run_sequential(step, &commands, scope),
        Action::ParallelCommands(commands) => {
            let results = run_bounded(commands, scope.max_parallel, |_, command| {
                run_command(step, &command, scope)
            });
            collect_outputs(node, results)
        }
        Action::Function(call) => Ok(StepOutcome {
            output: scope.evaluator(node).call(&call)?,
            ..StepOutcome::default()
        }),
        Action::Functions(calls) => {
            let evaluator = scope.evaluator(node);
            let outputs = calls
                .iter()
                .map(|call| evaluator.call(call))
                .collect::<Result<Vec<_>>>()?;
            Ok(StepOutcome {
                output: join_outputs(outputs),
                ..StepOutcome::default()
            })
        }
        Action::ParallelFunctions(calls) => {
            let results = run_bounded(calls, scope.max_parallel, |_, call| {
                scope.evaluator(node).call(&call)
            });
            collect_outputs(node, results)
        }
        Action::ParallelSteps(children) => {
            let results = run_bounded(children, scope.max_parallel, |_, child| {
                execute_nested(&child, scope)
            });
            collect_outcomes(node, results)
        }
        Action::Foreach {
            input,
            variable,
            threads,
            body,
        } => run_foreach(node, &input, &variable, threads, &body, scope),
    }
}

fn run_command(step: &StepSpec, command: &str, scope: &StepScope) -> Result<String> {
    let (cmd, container) = match Runner::for_step(step)? {
        Runner::Local => (process::bash_command(command, scope.working_dir), None),
        Runner::Docker { image, config } => {
            let name = docker::container_name(&step.name);
            let cmd = docker::command(scope.docker_binary, &config, &name, &image, command, scope.working_dir);
            (cmd, Some(name))
        }
    };

    let result = process::run(cmd, &step.name, scope.deadline);
    if let (Err(e), Some(name)) = (&result, &container) {
        warn!("Step '{}' failed ({}); removing container {}", step.name, e, name);
        docker::remove_container(scope.docker_binary, name, scope.working_dir);
    }
    let output = result?;
    if !output.stderr.trim().is_empty() {
        debug!("[{}] stderr:\n{}", step.name, output.stderr.trim_end());
    }
    Ok(output.stdout.trim_end().to_string())
}

/// Runs commands in order. The first failure stops the rest unless the
/// step's `on_error` includes `continue`.
fn run_sequential(step: &StepSpec, commands: &[String], scope: &StepScope) -> Result<StepOutcome> {
    let keep_going = step.on_error.iter().any(|a| a.action == ActionKind::Continue);
    let mut outputs = Vec::with_capacity(commands.len());
    let mut failures = Vec::new();

    for command in commands {
        match run_command(step, command, scope) {
            Ok(output) => outputs.push(output),
            Err(e) if keep_going => {
                error!("Step '{}' command failed, continuing: {}", step.name, e);
                failures.push(e);
            }
            Err(e) => return Err(e),
        }
    }

    match failures.len() {
        0 => Ok(StepOutcome {
            output: join_outputs(outputs),
            ..StepOutcome::default()
        }),
        1 => Err(failures.remove(0)),
        _ => Err(WorkflowError::AggregateFailure {
            node: step.name.clone(),
            total: commands.len(),
            failures,
        }),
    }
}

fn run_foreach(
    node: &str,
    input: &str,
    variable: &str,
    threads: usize,
    body: &StepSpec,
    scope: &StepScope,
) -> Result<StepOutcome> {
    let path = match scope.working_dir {
        Some(dir) if Path::new(input).is_relative() => dir.join(input),
        _ => PathBuf::from(input),
    };
    let content = fs::read_to_string(&path)
        .map_err(|e| WorkflowError::runner(node, format!("cannot read input '{}': {}", path.display(), e)))?;
    let items: Vec<String> = content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect();

    info!("[{}] {} items, {} at a time", node, items.len(), threads);

    let results = run_bounded(items, threads, |index, item| {
        debug!("[{}] item {}: {}", node, index + 1, item);
        let loop_scope = match scope.loop_scope {
            Some(outer) => outer.with(variable, item),
            None => LoopScope::new().with(variable, item),
        };
        let item_scope = StepScope {
            loop_scope: Some(&loop_scope),
            ..scope.clone()
        };
        execute_nested(body, &item_scope)
    });

    collect_outcomes(node, results)
}

fn join_outputs(outputs: Vec<String>) -> String {
    outputs
        .into_iter()
        .filter(|o| !o.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

fn collect_outputs(node: &str, results: Vec<Result<String>>) -> Result<StepOutcome> {
    let results = results
        .into_iter()
        .map(|r| {
            r.map(|output| StepOutcome {
                output,
                ..StepOutcome::default()
            })
        })
        .collect();
    collect_outcomes(node, results)
}

/// All-or-nothing: any failed branch fails the step, with every cause.
fn collect_outcomes(node: &str, results: Vec<Result<StepOutcome>>) -> Result<StepOutcome> {
    let total = results.len();
    let mut combined = StepOutcome::default();
    let mut outputs = Vec::with_capacity(total);
    let mut failures = Vec::new();

    for result in results {
        match result {
            Ok(outcome) => {
                outputs.push(outcome.output.clone());
                combined.merge(outcome);
            }
            Err(e) => failures.push(e),
        }
    }

    if !failures.is_empty() {
        error!("[{}] {} of {} branches failed", node, failures.len(), total);
        return Err(WorkflowError::AggregateFailure {
            node: node.to_string(),
            total,
            failures,
        });
    }

    combined.output = join_outputs(outputs);
    Ok(combined)
}
