//! Execution Planner
//!
//! Hands out batches of nodes to run, one batch at a time:
//! - `flow`: every module whose dependencies are done, in declaration order
//! - `module`: one step at a time, following defaults and decisions
//!
//! The planner never runs anything. The engine executes each batch,
//! folds exports into the context, calls [`ExecutionPlanner::record`] for
//! every node and then asks for the next batch. Conditions are evaluated
//! against the context passed to [`ExecutionPlanner::next_batch`], so
//! they always see the exports of every earlier batch.

use std::path::PathBuf;

use log::{debug, info, warn};

use super::expression::Evaluator;
use super::graph::{Target, WorkflowGraph};
use super::model::DocumentKind;
use super::params::ExecutionContext;
use super::report::NodeStatus;
use crate::error::{Result, WorkflowError};

/// Upper bound on step transitions in a module run. Decision rules may
/// jump backwards, so a module can loop.
pub const MAX_MODULE_TRANSITIONS: usize = 1000;

/// Nodes to run together, plus the nodes the planner skipped on the way.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionBatch {
    /// Position of the batch in the run, starting at 1
    pub index: usize,
    /// Names to execute, in declaration order
    pub nodes: Vec<String>,
    /// Names skipped since the previous batch, in the order they were decided
    pub skipped: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum NodeState {
    Pending,
    Scheduled,
    Done(NodeStatus),
}

/// Lazy batch source over a [`WorkflowGraph`]. Not resumable.
pub struct ExecutionPlanner {
    graph: WorkflowGraph,
    /// State per node index
    states: Vec<NodeState>,
    /// Nodes finished since the last batch, awaiting decision evaluation
    finished: Vec<usize>,
    /// Next step to consider (module only)
    cursor: Option<usize>,
    /// Step transitions so far (module only)
    transitions: usize,
    batches: usize,
    halted: bool,
    /// Treat evaluation errors as "condition holds, no decision matches"
    lenient: bool,
    working_dir: Option<PathBuf>,
}

/// Creates a planner positioned at the start of the graph.
pub fn plan(graph: WorkflowGraph) -> ExecutionPlanner {
    ExecutionPlanner::new(graph)
}

impl ExecutionPlanner {
    pub fn new(graph: WorkflowGraph) -> Self {
        let cursor = match graph.kind() {
            DocumentKind::Module if !graph.is_empty() => Some(0),
            _ => None,
        };
        info!("Creating {} planner over {} nodes", graph.kind(), graph.len());

        Self {
            states: vec![NodeState::Pending; graph.len()],
            graph,
            finished: Vec::new(),
            cursor,
            transitions: 0,
            batches: 0,
            halted: false,
            lenient: false,
            working_dir: None,
        }
    }

    /// Directory that relative paths in condition function calls resolve against.
    pub fn set_working_dir(&mut self, dir: Option<PathBuf>) {
        self.working_dir = dir;
    }

    pub fn graph(&self) -> &WorkflowGraph {
        &self.graph
    }

    /// Stops all further scheduling.
    pub fn halt(&mut self) {
        if !self.halted {
            debug!("Planner halted after {} batches", self.batches);
        }
        self.halted = true;
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    /// Records the terminal status of a node from the last batch.
    ///
    /// `Failed` means the failure was recovered; an unrecovered failure
    /// is followed by [`ExecutionPlanner::halt`].
    pub fn record(&mut self, name: &str, status: NodeStatus) {
        let Some(index) = self.graph.index_of(name) else {
            warn!("Ignoring status for unknown node '{}'", name);
            return;
        };
        self.states[index] = NodeState::Done(status);
        if status != NodeStatus::Skipped {
            self.finished.push(index);
        }
    }

    /// Status recorded for a node, if it has finished.
    pub fn status(&self, name: &str) -> Option<NodeStatus> {
        match self.graph.index_of(name).map(|i| self.states[i]) {
            Some(NodeState::Done(status)) => Some(status),
            _ => None,
        }
    }

    /// Number of batches handed out so far.
    pub fn batches(&self) -> usize {
        self.batches
    }

    /// Produces the next batch, or `None` when the run is over.
    pub fn next_batch(&mut self, context: &ExecutionContext) -> Result<Option<ExecutionBatch>> {
        if self.halted {
            return Ok(None);
        }
        match self.graph.kind() {
            DocumentKind::Module => self.next_module_batch(context),
            DocumentKind::Flow => self.next_flow_batch(context),
        }
    }

    /// Drives the planner to completion treating every node as a success
    /// with no exports. Evaluation errors are tolerated: conditions hold
    /// and decisions do not match.
    pub fn dry_run_batches(mut self, context: &ExecutionContext) -> Result<Vec<ExecutionBatch>> {
        self.lenient = true;
        let mut batches = Vec::new();
        while let Some(batch) = self.next_batch(context)? {
            for name in &batch.nodes {
                self.record(name, NodeStatus::Success);
            }
            batches.push(batch);
        }
        Ok(batches)
    }

    fn check(&self, context: &ExecutionContext, node: &str, condition: &str, fallback: bool) -> Result<bool> {
        let evaluator = Evaluator::new(context, node).with_working_dir(self.working_dir.as_deref());
        match evaluator.condition(condition) {
            Ok(value) => Ok(value),
            Err(e) if self.lenient => {
                debug!("'{}': cannot evaluate '{}' ({}), assuming {}", node, condition, e, fallback);
                Ok(fallback)
            }
            Err(e) => Err(e),
        }
    }

    /// First decision rule of `index` that matches, if any.
    fn decide(&self, context: &ExecutionContext, index: usize) -> Result<Option<Target>> {
        let node = self.graph.node(index);
        for branch in &node.branches {
            if self.check(context, &node.name, &branch.condition, false)? {
                debug!("'{}': decision '{}' matched", node.name, branch.condition);
                return Ok(Some(branch.target));
            }
        }
        Ok(None)
    }

    fn should_run(&self, context: &ExecutionContext, index: usize) -> Result<bool> {
        let node = self.graph.node(index);
        match &node.condition {
            Some(condition) => self.check(context, &node.name, condition, true),
            None => Ok(true),
        }
    }

    fn emit(&mut self, nodes: Vec<usize>, skipped: Vec<usize>) -> Option<ExecutionBatch> {
        if nodes.is_empty() && skipped.is_empty() {
            return None;
        }
        for &i in &nodes {
            self.states[i] = NodeState::Scheduled;
        }
        self.batches += 1;
        let name = |i: &usize| self.graph.node(*i).name.clone();
        let batch = ExecutionBatch {
            index: self.batches,
            nodes: nodes.iter().map(name).collect(),
            skipped: skipped.iter().map(name).collect(),
        };
        debug!("Batch {}: run {:?}, skipped {:?}", batch.index, batch.nodes, batch.skipped);
        Some(batch)
    }

    fn next_module_batch(&mut self, context: &ExecutionContext) -> Result<Option<ExecutionBatch>> {
        if let Some(last) = self.finished.pop() {
            self.finished.clear();
            self.cursor = match self.decide(context, last)? {
                Some(Target::End) => {
                    info!("'{}' routed to end", self.graph.node(last).name);
                    self.halted = true;
                    None
                }
                Some(Target::Node(next)) => Some(next),
                None => self.graph.default_next(last),
            };
        }

        let mut skipped = Vec::new();
        while let Some(current) = self.cursor {
            self.transitions += 1;
            if self.transitions > MAX_MODULE_TRANSITIONS {
                return Err(WorkflowError::schema(
                    Some(&self.graph.node(current).name),
                    format!("more than {} step transitions; decision loop?", MAX_MODULE_TRANSITIONS),
                ));
            }

            if self.should_run(context, current)? {
                self.cursor = None;
                return Ok(self.emit(vec![current], skipped));
            }

            debug!("Skipping step '{}': pre_condition false", self.graph.node(current).name);
            self.states[current] = NodeState::Done(NodeStatus::Skipped);
            skipped.push(current);
            self.cursor = self.graph.default_next(current);
        }

        Ok(self.emit(Vec::new(), skipped))
    }

    fn next_flow_batch(&mut self, context: &ExecutionContext) -> Result<Option<ExecutionBatch>> {
        let mut skipped = Vec::new();

        let mut finished = std::mem::take(&mut self.finished);
        finished.sort_unstable();
        for index in finished {
            match self.decide(context, index)? {
                Some(Target::End) => {
                    info!("'{}' routed to end", self.graph.node(index).name);
                    self.halted = true;
                    return Ok(self.emit(Vec::new(), skipped));
                }
                Some(Target::Node(target)) => {
                    let keep = self.graph.reachable_from(target);
                    for i in 0..self.states.len() {
                        if self.states[i] == NodeState::Pending && !keep.contains(&i) {
                            debug!(
                                "Skipping module '{}': '{}' routed to '{}'",
                                self.graph.node(i).name,
                                self.graph.node(index).name,
                                self.graph.node(target).name
                            );
                            self.states[i] = NodeState::Done(NodeStatus::Skipped);
                            skipped.push(i);
                        }
                    }
                }
                None => {}
            }
        }

        let mut nodes = Vec::new();
        loop {
            let ready: Vec<usize> = (0..self.states.len())
                .filter(|&i| self.states[i] == NodeState::Pending && !nodes.contains(&i))
                .filter(|&i| {
                    self.graph
                        .node(i)
                        .dependencies
                        .iter()
                        .all(|&d| matches!(self.states[d], NodeState::Done(_)))
                })
                .collect();

            let mut newly_skipped = false;
            for i in ready {
                if self.should_run(context, i)? {
                    nodes.push(i);
                } else {
                    debug!("Skipping module '{}': condition false", self.graph.node(i).name);
                    self.states[i] = NodeState::Done(NodeStatus::Skipped);
                    skipped.push(i);
                    newly_skipped = true;
                }
            }

            // Dependents of a skipped module may have become ready.
            if !newly_skipped {
                break;
            }
        }

        nodes.sort_unstable();
        Ok(self.emit(nodes, skipped))
    }
}
