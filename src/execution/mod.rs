//! Workflow Execution Module
//!
//! Runs planned batches: the engine drives the planner, steps dispatch
//! to local shells, containers or built-in functions, and a bounded
//! pool runs whatever may run side by side.
//!
//! # Architecture
//!
//! - [`engine`]: Main execution engine orchestrating workflow runs
//! - [`step`]: Step dispatch by action form and runner
//! - [`functions`]: Built-in utility functions
//! - [`process`]: Child processes with deadlines
//! - [`pool`]: Bounded worker pool

pub mod engine;
pub mod functions;
pub mod pool;
pub mod process;
pub mod step;

pub use engine::Engine;
pub use step::{execute_step, Action, StepOutcome, StepScope};
