//! Workflow Definition Module
//!
//! Everything that happens before a command runs: loading `module` and
//! `flow` documents, resolving parameters, templating, building the
//! dependency graph and planning batches.
//!
//! # Structure
//!
//! - [`model`]: Document data structures (WorkflowDocument, StepSpec, ModuleRef)
//! - [`parser`]: YAML parsing and loading
//! - [`validator`]: Per-node validation rules
//! - [`params`]: Parameter resolution and the execution context
//! - [`template`]: `{{name}}` and `[[name]]` expansion
//! - [`expression`]: Conditions and function calls
//! - [`graph`]: Dependency graph and cycle detection
//! - [`planner`]: Batch planning, decisions and conditions
//! - [`report`]: Per-node results of a run

pub mod expression;
pub mod graph;
pub mod model;
pub mod params;
pub mod parser;
pub mod planner;
pub mod report;
pub mod template;
pub mod validator;

pub use graph::{build, WorkflowGraph};
pub use model::{
    ActionKind, DecisionRule, DocumentKind, HookAction, ModuleRef, ParamSpec, RunnerConfig,
    StepRunner, StepSpec, StepType, WorkflowDocument,
};
pub use params::{resolve, ExecutionContext};
pub use parser::{lint_workflow, load, load_workflow};
pub use planner::{plan, ExecutionBatch, ExecutionPlanner};
pub use report::{NodeRecord, NodeStatus, RunReport};
