//! Environment Management Module
//!
//! Handles the container runtime used by `remote-bash` steps.

pub mod docker;

pub use docker::{DOCKER_BIN_ENV, DOCKER_PATH};
