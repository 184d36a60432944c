//! Execution Timeline
//!
//! Records when each node starts and how it ends, grouped by batch, for
//! node durations in the run report and the chart printed by the CLI.

use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Type of timeline event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Started,
    Succeeded,
    Failed,
    /// Decided by the planner; the node never started
    Skipped,
}

impl EventType {
    fn is_terminal(self) -> bool {
        !matches!(self, Self::Started)
    }
}

/// A single event in the execution timeline.
#[derive(Debug, Clone)]
pub struct TimelineEvent {
    pub node: String,
    pub event_type: EventType,
    /// Batch the node belonged to
    pub batch: usize,
    pub timestamp: Instant,
}

/// Tracks the execution timeline of a run.
#[derive(Debug, Clone)]
pub struct ExecutionTimeline {
    events: Vec<TimelineEvent>,
    start_time: Instant,
}

impl ExecutionTimeline {
    /// Creates a new timeline starting now.
    pub fn new() -> Self {
        Self {
            events: Vec::new(),
            start_time: Instant::now(),
        }
    }

    /// Records an event for a node.
    pub fn add_event(&mut self, node: &str, event_type: EventType, batch: usize) {
        self.events.push(TimelineEvent {
            node: node.to_string(),
            event_type,
            batch,
            timestamp: Instant::now(),
        });
    }

    pub fn events(&self) -> &[TimelineEvent] {
        &self.events
    }

    /// Time since the timeline was created.
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Duration of the most recent run of a node, once it has ended.
    pub fn duration_of(&self, node: &str) -> Option<u128> {
        let mut ended = None;
        for event in self.events.iter().rev().filter(|e| e.node == node) {
            match event.event_type {
                EventType::Started => {
                    return ended.map(|end: Instant| end.duration_since(event.timestamp).as_millis());
                }
                EventType::Skipped => return None,
                _ if ended.is_none() => ended = Some(event.timestamp),
                _ => {}
            }
        }
        None
    }

    /// Count of terminal events of each type.
    pub fn count(&self, event_type: EventType) -> usize {
        self.events.iter().filter(|e| e.event_type == event_type).count()
    }

    /// Generates an ASCII chart of node runs, one line per run, with
    /// skipped nodes listed by name.
    pub fn gantt_chart(&self) -> String {
        let mut output = String::from("\nExecution Timeline:\n\n");

        let total_time = self.start_time.elapsed().as_millis();
        if total_time == 0 {
            return output;
        }

        // Scale to 50 characters width
        let scale = 50.0 / total_time as f64;

        let mut open: HashMap<&str, u128> = HashMap::new();
        let mut runs: Vec<(&str, usize, u128, u128, EventType)> = Vec::new();
        let mut skipped: Vec<&str> = Vec::new();

        for event in &self.events {
            let elapsed = event.timestamp.duration_since(self.start_time).as_millis();
            match event.event_type {
                EventType::Started => {
                    open.insert(event.node.as_str(), elapsed);
                }
                EventType::Skipped => skipped.push(event.node.as_str()),
                kind if kind.is_terminal() => {
                    if let Some(start) = open.remove(event.node.as_str()) {
                        runs.push((event.node.as_str(), event.batch, start, elapsed, kind));
                    }
                }
                _ => {}
            }
        }

        runs.sort_by_key(|(_, batch, start, _, _)| (*batch, *start));

        for (node, batch, start, end, kind) in runs {
            let start_pos = (start as f64 * scale) as usize;
            let width = ((end.saturating_sub(start)) as f64 * scale).max(1.0) as usize;
            let mark = if kind == EventType::Failed { "x" } else { "#" };

            output.push_str(&format!(
                "{:>3} {} |{}{}| ({} ms)\n",
                batch,
                truncate(node, 16),
                " ".repeat(start_pos),
                mark.repeat(width),
                end.saturating_sub(start)
            ));
        }

        if !skipped.is_empty() {
            output.push_str(&format!("\nSkipped: {}\n", skipped.join(", ")));
        }

        output.push_str(&format!("\nTotal: {} ms\n", total_time));
        output
    }
}

impl Default for ExecutionTimeline {
    fn default() -> Self {
        Self::new()
    }
}

/// Pads or cuts a name to exactly `width` characters.
fn truncate(s: &str, width: usize) -> String {
    if s.chars().count() <= width {
        format!("{:width$}", s, width = width)
    } else {
        let cut: String = s.chars().take(width.saturating_sub(3)).collect();
        format!("{}...", cut)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_duration_of_completed_node() {
        let mut timeline = ExecutionTimeline::new();
        timeline.add_event("enum", EventType::Started, 1);
        thread::sleep(Duration::from_millis(30));
        timeline.add_event("enum", EventType::Succeeded, 1);

        assert!(timeline.duration_of("enum").unwrap() >= 30);
        assert_eq!(timeline.duration_of("other"), None);
    }

    #[test]
    fn test_duration_uses_latest_run() {
        let mut timeline = ExecutionTimeline::new();
        timeline.add_event("again", EventType::Started, 1);
        thread::sleep(Duration::from_millis(40));
        timeline.add_event("again", EventType::Succeeded, 1);
        timeline.add_event("again", EventType::Started, 2);
        timeline.add_event("again", EventType::Failed, 2);

        assert!(timeline.duration_of("again").unwrap() < 40);
    }

    #[test]
    fn test_started_only_has_no_duration() {
        let mut timeline = ExecutionTimeline::new();
        timeline.add_event("running", EventType::Started, 1);
        assert_eq!(timeline.duration_of("running"), None);
    }

    #[test]
    fn test_skipped_has_no_duration() {
        let mut timeline = ExecutionTimeline::new();
        timeline.add_event("vulnscan", EventType::Skipped, 3);
        assert_eq!(timeline.duration_of("vulnscan"), None);
        assert_eq!(timeline.count(EventType::Skipped), 1);
    }

    #[test]
    fn test_gantt_chart() {
        let mut timeline = ExecutionTimeline::new();
        timeline.add_event("subdomain-module", EventType::Started, 1);
        thread::sleep(Duration::from_millis(20));
        timeline.add_event("subdomain-module", EventType::Succeeded, 1);
        timeline.add_event("probe", EventType::Started, 2);
        thread::sleep(Duration::from_millis(20));
        timeline.add_event("probe", EventType::Failed, 2);
        timeline.add_event("report", EventType::Skipped, 3);

        let chart = timeline.gantt_chart();
        assert!(chart.contains("subdomain-module"));
        assert!(chart.contains("probe"));
        assert!(chart.contains("Skipped: report"));
        assert!(chart.contains("Total:"));
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("abc", 5), "abc  ");
        assert_eq!(truncate("abcdefghij", 6), "abc...");
        assert_eq!(truncate("ééééééé", 5), "éé...");
    }
}
