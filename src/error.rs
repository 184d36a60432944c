//! Error Types
//!
//! A single error enum covers every failure a run can produce, from
//! parsing a document to a branch of a foreach loop exiting non-zero.
//!
//! Load and graph errors are raised before anything executes. Runtime
//! errors (`Timeout`, `RunnerFailure`, `AggregateFailure`) are local to
//! the node that produced them until the engine decides whether the
//! node's `on_error` actions recover it.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Position of a problem inside a source document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    pub path: Option<PathBuf>,
    pub line: Option<usize>,
    pub column: Option<usize>,
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.path {
            Some(path) => write!(f, "{}", path.display())?,
            None => write!(f, "<input>")?,
        }
        if let Some(line) = self.line {
            write!(f, ":{}", line)?;
            if let Some(column) = self.column {
                write!(f, ":{}", column)?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("malformed document at {location}: {message}")]
    MalformedDocument { location: Location, message: String },

    #[error("schema violation{}: {message}", describe_origin(.node, .source_path))]
    SchemaViolation {
        node: Option<String>,
        source_path: Option<PathBuf>,
        message: String,
    },

    #[error("missing required parameter '{0}'")]
    MissingRequiredParam(String),

    #[error("'{node}': unbound placeholder '{token}'")]
    UnboundPlaceholder { node: String, token: String },

    #[error("cyclic dependency: {}", .cycle.join(" -> "))]
    CyclicDependency { cycle: Vec<String> },

    #[error("module '{module}' depends on unknown module '{dependency}'")]
    UnknownDependency { module: String, dependency: String },

    #[error("'{step}' routes to unknown target '{target}'")]
    UnknownStepTarget { step: String, target: String },

    #[error("'{node}' timed out after {seconds}s")]
    Timeout { node: String, seconds: u64 },

    #[error("'{node}' failed: {message}")]
    RunnerFailure { node: String, message: String },

    #[error(
        "'{node}': {} of {total} branches failed: {}",
        .failures.len(),
        join_causes(.failures)
    )]
    AggregateFailure {
        node: String,
        total: usize,
        failures: Vec<WorkflowError>,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl WorkflowError {
    pub(crate) fn schema(node: Option<&str>, message: impl Into<String>) -> Self {
        Self::SchemaViolation {
            node: node.map(str::to_string),
            source_path: None,
            message: message.into(),
        }
    }

    pub(crate) fn runner(node: &str, message: impl Into<String>) -> Self {
        Self::RunnerFailure {
            node: node.to_string(),
            message: message.into(),
        }
    }

    /// Name of the step or module the error originated from, if any.
    pub fn node(&self) -> Option<&str> {
        match self {
            Self::SchemaViolation { node, .. } => node.as_deref(),
            Self::UnboundPlaceholder { node, .. }
            | Self::Timeout { node, .. }
            | Self::RunnerFailure { node, .. }
            | Self::AggregateFailure { node, .. } => Some(node),
            Self::UnknownDependency { module, .. } => Some(module),
            Self::UnknownStepTarget { step, .. } => Some(step),
            _ => None,
        }
    }

    /// Attaches the document path to a schema violation that lacks one.
    pub(crate) fn with_source(self, path: Option<&PathBuf>) -> Self {
        match self {
            Self::SchemaViolation {
                node,
                source_path: None,
                message,
            } => Self::SchemaViolation {
                node,
                source_path: path.cloned(),
                message,
            },
            Self::MalformedDocument { mut location, message } => {
                if location.path.is_none() {
                    location.path = path.cloned();
                }
                Self::MalformedDocument { location, message }
            }
            other => other,
        }
    }

    /// True for errors raised before any node executes.
    pub fn is_fatal_before_run(&self) -> bool {
        matches!(
            self,
            Self::MalformedDocument { .. }
                | Self::SchemaViolation { .. }
                | Self::MissingRequiredParam(_)
                | Self::CyclicDependency { .. }
                | Self::UnknownDependency { .. }
                | Self::UnknownStepTarget { .. }
        )
    }
}

fn describe_origin(node: &Option<String>, path: &Option<PathBuf>) -> String {
    match (node, path) {
        (Some(node), Some(path)) => format!(" in '{}' ({})", node, path.display()),
        (Some(node), None) => format!(" in '{}'", node),
        (None, Some(path)) => format!(" ({})", path.display()),
        (None, None) => String::new(),
    }
}

fn join_causes(failures: &[WorkflowError]) -> String {
    failures
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

pub type Result<T> = std::result::Result<T, WorkflowError>;
