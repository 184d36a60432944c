//! Osmflow - Scanning Workflow Engine
//!
//! Loads declarative `module` and `flow` documents, resolves their
//! parameters, plans execution in dependency-ordered batches and
//! dispatches each step to a local shell, a container or a built-in
//! function.
//!
//! # Architecture
//!
//! The library is organized into five modules:
//!
//! - [`workflow`]: Documents, parameters, templating, graph and planner
//! - [`execution`]: Engine, step dispatch and the bounded worker pool
//! - [`environment`]: Container runner integration
//! - [`monitoring`]: Execution timeline
//! - [`error`]: The error type shared by every stage
//!
//! # Example
//!
//! ```rust,no_run
//! use std::collections::BTreeMap;
//! use osmflow::execution::Engine;
//! use osmflow::load_workflow;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Load a flow from YAML
//!     let document = load_workflow("flows/recon.yaml")?;
//!
//!     // Create execution engine
//!     let mut engine = Engine::new(document);
//!     engine.set_max_parallel(4);
//!     engine.set_working_dir("/data/recon");
//!
//!     // Execute the flow
//!     let params = BTreeMap::from([("target".to_string(), "example.com".to_string())]);
//!     let report = engine.run(&params)?;
//!     assert!(report.succeeded);
//!     Ok(())
//! }
//! ```

pub mod environment;
pub mod error;
pub mod execution;
pub mod monitoring;
pub mod workflow;

// Re-export commonly used types
pub use error::{Result, WorkflowError};
pub use execution::engine::Engine;
pub use workflow::model::{DocumentKind, ModuleRef, StepSpec, WorkflowDocument};
pub use workflow::parser::load_workflow;
pub use workflow::report::RunReport;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "Osmflow";
