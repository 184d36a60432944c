//! Dependency Graph
//!
//! Turns a validated document into an indexed graph the planner can walk:
//! - `module`: each step's default successor is the next declared step;
//!   decision rules add conditional edges
//! - `flow`: `depends_on` edges between modules, checked for unknown
//!   names and cycles
//!
//! Nodes keep their declaration index, which is also the tie-break order
//! for everything downstream.

use std::collections::{HashMap, HashSet, VecDeque};

use log::debug;

use super::model::{DecisionRule, DocumentKind, WorkflowDocument, END_TARGET};
use crate::error::{Result, WorkflowError};

/// Where a decision rule sends execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    End,
    Node(usize),
}

/// A decision rule with its target resolved to an index.
#[derive(Debug, Clone, PartialEq)]
pub struct Branch {
    pub condition: String,
    pub target: Target,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GraphNode {
    pub name: String,
    /// `pre_condition` for steps, `condition` for modules
    pub condition: Option<String>,
    pub branches: Vec<Branch>,
    /// Indices this node waits for (flow only)
    pub dependencies: Vec<usize>,
    /// Indices waiting for this node (flow only)
    pub dependents: Vec<usize>,
}

#[derive(Debug, Clone)]
pub struct WorkflowGraph {
    kind: DocumentKind,
    nodes: Vec<GraphNode>,
    index: HashMap<String, usize>,
}

impl WorkflowGraph {
    pub fn kind(&self) -> DocumentKind {
        self.kind
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, index: usize) -> &GraphNode {
        &self.nodes[index]
    }

    pub fn nodes(&self) -> &[GraphNode] {
        &self.nodes
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    /// Default successor of a step; `None` past the last step or in a flow.
    pub fn default_next(&self, index: usize) -> Option<usize> {
        match self.kind {
            DocumentKind::Module if index + 1 < self.nodes.len() => Some(index + 1),
            _ => None,
        }
    }

    /// Every node reachable from `start` along dependency edges,
    /// `start` included.
    pub fn reachable_from(&self, start: usize) -> HashSet<usize> {
        let mut seen = HashSet::from([start]);
        let mut queue = VecDeque::from([start]);
        while let Some(current) = queue.pop_front() {
            for &next in &self.nodes[current].dependents {
                if seen.insert(next) {
                    queue.push_back(next);
                }
            }
        }
        seen
    }

    /// Kahn ordering of a flow, ties broken by declaration index.
    /// For a module this is declaration order.
    pub fn topological_order(&self) -> Vec<usize> {
        let mut in_degree: Vec<usize> = self.nodes.iter().map(|n| n.dependencies.len()).collect();
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut ready: Vec<usize> = (0..self.nodes.len()).filter(|&i| in_degree[i] == 0).collect();

        while !ready.is_empty() {
            ready.sort_unstable();
            let current = ready.remove(0);
            order.push(current);
            for &dependent in &self.nodes[current].dependents {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    ready.push(dependent);
                }
            }
        }

        order
    }
}

/// Builds the graph for a document.
pub fn build(document: &WorkflowDocument) -> Result<WorkflowGraph> {
    let names = document.node_names();
    let index: HashMap<String, usize> = names
        .iter()
        .enumerate()
        .map(|(i, name)| (name.to_string(), i))
        .collect();

    let resolve_branches = |node: &str, rules: &[DecisionRule]| -> Result<Vec<Branch>> {
        rules
            .iter()
            .map(|rule| {
                let target = if rule.next == END_TARGET {
                    Target::End
                } else {
                    let i = index.get(&rule.next).ok_or_else(|| WorkflowError::UnknownStepTarget {
                        step: node.to_string(),
                        target: rule.next.clone(),
                    })?;
                    Target::Node(*i)
                };
                Ok(Branch {
                    condition: rule.condition.clone(),
                    target,
                })
            })
            .collect()
    };

    let mut nodes = Vec::with_capacity(names.len());

    match document.kind {
        DocumentKind::Module => {
            for step in &document.steps {
                nodes.push(GraphNode {
                    name: step.name.clone(),
                    condition: step.pre_condition.clone(),
                    branches: resolve_branches(&step.name, &step.decision)?,
                    dependencies: Vec::new(),
                    dependents: Vec::new(),
                });
            }
        }
        DocumentKind::Flow => {
            for module in &document.modules {
                let mut dependencies = Vec::new();
                for dependency in &module.depends_on {
                    let i = index.get(dependency).ok_or_else(|| WorkflowError::UnknownDependency {
                        module: module.name.clone(),
                        dependency: dependency.clone(),
                    })?;
                    if !dependencies.contains(i) {
                        dependencies.push(*i);
                    }
                }
                nodes.push(GraphNode {
                    name: module.name.clone(),
                    condition: module.condition.clone(),
                    branches: resolve_branches(&module.name, &module.decision)?,
                    dependencies,
                    dependents: Vec::new(),
                });
            }

            for i in 0..nodes.len() {
                for dependency in nodes[i].dependencies.clone() {
                    nodes[dependency].dependents.push(i);
                }
            }

            if let Some(cycle) = find_cycle(&nodes) {
                return Err(WorkflowError::CyclicDependency { cycle });
            }
        }
    }

    debug!("Built {} graph '{}' with {} nodes", document.kind, document.name, nodes.len());

    Ok(WorkflowGraph {
        kind: document.kind,
        nodes,
        index,
    })
}

#[derive(Clone, Copy, PartialEq)]
enum Mark {
    Unvisited,
    InProgress,
    Done,
}

/// Depth-first search over dependency edges. Returns the first cycle
/// found as a name path that starts and ends on the same node.
fn find_cycle(nodes: &[GraphNode]) -> Option<Vec<String>> {
    fn visit(
        current: usize,
        nodes: &[GraphNode],
        marks: &mut [Mark],
        stack: &mut Vec<usize>,
    ) -> Option<Vec<String>> {
        marks[current] = Mark::InProgress;
        stack.push(current);

        for &next in &nodes[current].dependencies {
            match marks[next] {
                Mark::InProgress => {
                    let start = stack.iter().position(|&i| i == next).unwrap_or(0);
                    let mut cycle: Vec<String> =
                        stack[start..].iter().map(|&i| nodes[i].name.clone()).collect();
                    cycle.push(nodes[next].name.clone());
                    return Some(cycle);
                }
                Mark::Unvisited => {
                    if let Some(cycle) = visit(next, nodes, marks, stack) {
                        return Some(cycle);
                    }
                }
                Mark::Done => {}
            }
        }

        stack.pop();
        marks[current] = Mark::Done;
        None
    }

    let mut marks = vec![Mark::Unvisited; nodes.len()];
    let mut stack = Vec::new();
    for i in 0..nodes.len() {
        if marks[i] == Mark::Unvisited {
            if let Some(cycle) = visit(i, nodes, &mut marks, &mut stack) {
                return Some(cycle);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::model::{ModuleRef, StepSpec};

    fn flow(modules: Vec<ModuleRef>) -> WorkflowDocument {
        modules
            .into_iter()
            .fold(WorkflowDocument::flow("f"), |doc, m| doc.with_module(m))
    }

    #[test]
    fn test_module_default_edges() {
        let doc = WorkflowDocument::module("m")
            .with_step(StepSpec::bash("a", "echo a"))
            .with_step(StepSpec::bash("b", "echo b"));
        let graph = build(&doc).unwrap();

        assert_eq!(graph.kind(), DocumentKind::Module);
        assert_eq!(graph.default_next(0), Some(1));
        assert_eq!(graph.default_next(1), None);
    }

    #[test]
    fn test_module_decision_targets() {
        let doc = WorkflowDocument::module("m")
            .with_step(
                StepSpec::bash("a", "echo a")
                    .with_decision("x == '1'", "c")
                    .with_decision("x == '2'", END_TARGET),
            )
            .with_step(StepSpec::bash("b", "echo b"))
            .with_step(StepSpec::bash("c", "echo c"));
        let graph = build(&doc).unwrap();

        let branches = &graph.node(0).branches;
        assert_eq!(branches[0].target, Target::Node(2));
        assert_eq!(branches[1].target, Target::End);
    }

    #[test]
    fn test_unknown_step_target() {
        let doc = WorkflowDocument::module("m")
            .with_step(StepSpec::bash("a", "echo a").with_decision("true", "ghost"));
        match build(&doc).unwrap_err() {
            WorkflowError::UnknownStepTarget { step, target } => {
                assert_eq!(step, "a");
                assert_eq!(target, "ghost");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_dependency() {
        let doc = flow(vec![ModuleRef::new("a", "a.yaml").depends_on("missing")]);
        assert!(matches!(
            build(&doc),
            Err(WorkflowError::UnknownDependency { .. })
        ));
    }

    #[test]
    fn test_cycle_detected_with_path() {
        let doc = flow(vec![
            ModuleRef::new("a", "a.yaml").depends_on("c"),
            ModuleRef::new("b", "b.yaml").depends_on("a"),
            ModuleRef::new("c", "c.yaml").depends_on("b"),
        ]);
        match build(&doc).unwrap_err() {
            WorkflowError::CyclicDependency { cycle } => {
                assert_eq!(cycle, vec!["a", "c", "b", "a"]);
                assert_eq!(cycle.first(), cycle.last());
                for name in ["a", "b", "c"] {
                    assert!(cycle.iter().any(|n| n == name));
                }
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_two_node_cycle() {
        let doc = flow(vec![
            ModuleRef::new("a", "a.yaml").depends_on("b"),
            ModuleRef::new("b", "b.yaml").depends_on("a"),
        ]);
        let err = build(&doc).unwrap_err();
        assert!(err.to_string().starts_with("cyclic dependency"));
    }

    #[test]
    fn test_topological_order_and_reachability() {
        let doc = flow(vec![
            ModuleRef::new("report", "r.yaml").depends_on("scan").depends_on("probe"),
            ModuleRef::new("enum", "e.yaml"),
            ModuleRef::new("scan", "s.yaml").depends_on("enum"),
            ModuleRef::new("probe", "p.yaml").depends_on("enum"),
        ]);
        let graph = build(&doc).unwrap();
        let names: Vec<&str> = graph
            .topological_order()
            .into_iter()
            .map(|i| graph.node(i).name.as_str())
            .collect();
        assert_eq!(names, vec!["enum", "scan", "probe", "report"]);

        let scan = graph.index_of("scan").unwrap();
        let reachable = graph.reachable_from(scan);
        assert!(reachable.contains(&graph.index_of("report").unwrap()));
        assert!(!reachable.contains(&graph.index_of("probe").unwrap()));
    }

    #[test]
    fn test_flow_decision_to_end() {
        let mut module = ModuleRef::new("a", "a.yaml");
        module.decision.push(DecisionRule::new("true", END_TARGET));
        let graph = build(&flow(vec![module])).unwrap();
        assert_eq!(graph.node(0).branches[0].target, Target::End);
    }
}
