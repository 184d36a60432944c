//! Run Report
//!
//! The record a run leaves behind: the final context and one entry per
//! executed or skipped node, in the order they were recorded.
//!
//! Reports are written as pretty JSON so they can be diffed between runs
//! or fed to other tooling.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use log::info;
use serde::{Deserialize, Serialize};

use super::model::DocumentKind;
use super::params::ExecutionContext;
use crate::error::{Result, WorkflowError};

/// Terminal status of a node.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Success,
    /// Failed; a recorded failure that did not abort the run was
    /// recovered by `on_error`
    Failed,
    Skipped,
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Failed => write!(f, "failed"),
            Self::Skipped => write!(f, "skipped"),
        }
    }
}

/// Result of one node.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct NodeRecord {
    pub name: String,

    pub status: NodeStatus,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub exports: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u128>,

    /// Nodes of a child module run by a flow
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<NodeRecord>,
}

impl NodeRecord {
    pub fn success(name: impl Into<String>, exports: BTreeMap<String, String>) -> Self {
        Self {
            name: name.into(),
            status: NodeStatus::Success,
            exports,
            error: None,
            duration_ms: None,
            children: Vec::new(),
        }
    }

    pub fn failed(name: impl Into<String>, error: &WorkflowError) -> Self {
        Self {
            name: name.into(),
            status: NodeStatus::Failed,
            exports: BTreeMap::new(),
            error: Some(error.to_string()),
            duration_ms: None,
            children: Vec::new(),
        }
    }

    pub fn skipped(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: NodeStatus::Skipped,
            exports: BTreeMap::new(),
            error: None,
            duration_ms: None,
            children: Vec::new(),
        }
    }

    pub fn with_duration(mut self, duration_ms: u128) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    pub fn with_children(mut self, children: Vec<NodeRecord>) -> Self {
        self.children = children;
        self
    }
}

/// Outcome of a whole run.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RunReport {
    pub workflow: String,

    pub kind: DocumentKind,

    pub succeeded: bool,

    /// The error that aborted the run, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    pub started_at: DateTime<Utc>,

    pub finished_at: DateTime<Utc>,

    pub context: ExecutionContext,

    pub nodes: Vec<NodeRecord>,
}

impl RunReport {
    /// Starts an empty report for a run beginning now.
    pub fn new(workflow: &str, kind: DocumentKind) -> Self {
        let now = Utc::now();
        Self {
            workflow: workflow.to_string(),
            kind,
            succeeded: true,
            error: None,
            started_at: now,
            finished_at: now,
            context: ExecutionContext::new(),
            nodes: Vec::new(),
        }
    }

    pub fn push(&mut self, record: NodeRecord) {
        self.nodes.push(record);
    }

    /// Closes the report with the final context and abort error, if any.
    pub fn finish(&mut self, context: ExecutionContext, error: Option<&WorkflowError>) {
        self.context = context;
        self.succeeded = error.is_none();
        self.error = error.map(|e| e.to_string());
        self.finished_at = Utc::now();
    }

    /// Last record for a node name.
    pub fn node(&self, name: &str) -> Option<&NodeRecord> {
        self.nodes.iter().rev().find(|n| n.name == name)
    }

    /// Names of the recorded nodes, in order.
    pub fn node_names(&self) -> Vec<&str> {
        self.nodes.iter().map(|n| n.name.as_str()).collect()
    }

    /// Count of records with the given status.
    pub fn count(&self, status: NodeStatus) -> usize {
        self.nodes.iter().filter(|n| n.status == status).count()
    }

    pub fn duration_ms(&self) -> i64 {
        (self.finished_at - self.started_at).num_milliseconds()
    }

    /// Writes the report as pretty JSON.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let json = serde_json::to_string_pretty(self)
            .map_err(|e| WorkflowError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))?;
        fs::write(path, json)?;

        info!("Saved run report to {}", path.display());
        Ok(())
    }

    /// Reads a report written by [`RunReport::save`].
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        serde_json::from_str(&content)
            .map_err(|e| WorkflowError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_report_finish_success() {
        let mut report = RunReport::new("scan", DocumentKind::Module);
        report.push(NodeRecord::success("a", BTreeMap::new()));
        report.push(NodeRecord::skipped("b"));
        report.finish(ExecutionContext::new(), None);

        assert!(report.succeeded);
        assert!(report.error.is_none());
        assert_eq!(report.node_names(), vec!["a", "b"]);
        assert_eq!(report.count(NodeStatus::Skipped), 1);
        assert!(report.duration_ms() >= 0);
    }

    #[test]
    fn test_report_finish_with_error() {
        let mut report = RunReport::new("scan", DocumentKind::Module);
        let err = WorkflowError::runner("a", "exit status 2");
        report.push(NodeRecord::failed("a", &err));
        report.finish(ExecutionContext::new(), Some(&err));

        assert!(!report.succeeded);
        assert!(report.error.as_deref().unwrap().contains("exit status 2"));
        assert_eq!(report.node("a").unwrap().status, NodeStatus::Failed);
    }

    #[test]
    fn test_save_and_load() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("reports/run.json");

        let mut context = ExecutionContext::new();
        context.insert_export("subs", "/tmp/subs.txt");

        let mut report = RunReport::new("recon", DocumentKind::Flow);
        report.push(
            NodeRecord::success("enum", BTreeMap::from([("subs".to_string(), "/tmp/subs.txt".to_string())]))
                .with_duration(12)
                .with_children(vec![NodeRecord::success("step", BTreeMap::new())]),
        );
        report.finish(context.clone(), None);
        report.save(&path).unwrap();

        let json = fs::read_to_string(&path).unwrap();
        assert!(json.contains("\"status\": \"success\""));
        assert!(json.contains("\"kind\": \"flow\""));

        let loaded = RunReport::load(&path).unwrap();
        assert_eq!(loaded.workflow, "recon");
        assert_eq!(loaded.context, context);
        assert_eq!(loaded.nodes, report.nodes);
    }

    #[test]
    fn test_skipped_record_omits_empty_fields() {
        let json = serde_json::to_string(&NodeRecord::skipped("b")).unwrap();
        assert_eq!(json, r#"{"name":"b","status":"skipped"}"#);
    }
}
