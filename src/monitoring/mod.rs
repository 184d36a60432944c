//! Monitoring Module
//!
//! Execution timeline recorded during runs.
//!
//! # Components
//!
//! - [`ExecutionTimeline`]: Node start/end timing for durations and charts

pub mod timeline;

pub use timeline::{EventType, ExecutionTimeline, TimelineEvent};
