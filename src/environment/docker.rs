//! Docker Step Runner
//!
//! Builds the `docker run` invocation for `remote-bash` steps. Every
//! container gets a generated name so it can be removed when the step
//! times out or fails; killing the client alone leaves it running.
//!
//! # Binary Resolution
//!
//! The container binary is resolved in the following order:
//! 1. `Engine::set_docker_binary`
//! 2. The `OSMFLOW_DOCKER_BIN` environment variable
//! 3. `docker` on the system PATH

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicUsize, Ordering};

use log::{debug, info, warn};
use once_cell::sync::Lazy;

use crate::workflow::RunnerConfig;

/// Environment variable overriding the container binary.
pub const DOCKER_BIN_ENV: &str = "OSMFLOW_DOCKER_BIN";

/// Lazily-resolved default container binary.
pub static DOCKER_PATH: Lazy<PathBuf> = Lazy::new(|| match std::env::var_os(DOCKER_BIN_ENV) {
    Some(path) if !path.is_empty() => {
        let path = PathBuf::from(path);
        info!("Using container binary from {}: {}", DOCKER_BIN_ENV, path.display());
        path
    }
    _ => PathBuf::from("docker"),
});

static NEXT_CONTAINER: AtomicUsize = AtomicUsize::new(0);

/// A container name unique to this process: `osmflow-<node>-<pid>-<n>`.
///
/// Characters docker rejects in names are replaced with `-`.
pub fn container_name(node: &str) -> String {
    let node: String = node
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') { c } else { '-' })
        .collect();
    format!(
        "osmflow-{}-{}-{}",
        node,
        std::process::id(),
        NEXT_CONTAINER.fetch_add(1, Ordering::Relaxed)
    )
}

/// Arguments passed after the binary for one container command.
///
/// Produces `run --rm --name NAME [-e K=V]... [-v VOL]... [-w DIR] IMAGE sh -c CMD`.
pub fn run_args(config: &RunnerConfig, name: &str, image: &str, command: &str) -> Vec<String> {
    let mut args = vec![
        "run".to_string(),
        "--rm".to_string(),
        "--name".to_string(),
        name.to_string(),
    ];

    for (key, value) in &config.env {
        args.push("-e".to_string());
        args.push(format!("{}={}", key, value));
    }

    for volume in &config.volumes {
        args.push("-v".to_string());
        args.push(volume.clone());
    }

    if let Some(workdir) = config.workdir.as_deref().filter(|w| !w.is_empty()) {
        args.push("-w".to_string());
        args.push(workdir.to_string());
    }

    args.push(image.to_string());
    args.push("sh".to_string());
    args.push("-c".to_string());
    args.push(command.to_string());
    args
}

/// Builds the container command, not yet spawned.
pub fn command(
    binary: &Path,
    config: &RunnerConfig,
    name: &str,
    image: &str,
    shell_command: &str,
    working_dir: Option<&Path>,
) -> Command {
    let args = run_args(config, name, image, shell_command);
    debug!("Container command: {} {}", binary.display(), args.join(" "));

    let mut cmd = Command::new(binary);
    cmd.args(args);
    if let Some(dir) = working_dir {
        cmd.current_dir(dir);
    }
    cmd
}

/// Force-removes a container, stopping it first if it still runs.
///
/// A container that is already gone is not an error.
pub fn remove_container(binary: &Path, name: &str, working_dir: Option<&Path>) {
    let mut cmd = Command::new(binary);
    cmd.args(["rm", "-f", name])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    if let Some(dir) = working_dir {
        cmd.current_dir(dir);
    }

    match cmd.status() {
        Ok(status) if status.success() => debug!("Removed container {}", name),
        Ok(status) => debug!("Removing container {} exited with {}", name, status),
        Err(e) => warn!("Cannot remove container {}: {}", name, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_run_args_full_config() {
        let config = RunnerConfig {
            image: Some("projectdiscovery/nuclei:latest".to_string()),
            env: BTreeMap::from([
                ("A".to_string(), "1".to_string()),
                ("TARGET".to_string(), "example.com".to_string()),
            ]),
            volumes: vec!["/tmp/out:/out".to_string()],
            workdir: Some("/out".to_string()),
        };

        let args = run_args(&config, "osmflow-scan-1", "projectdiscovery/nuclei:latest", "nuclei -u $TARGET");
        assert_eq!(
            args,
            vec![
                "run",
                "--rm",
                "--name",
                "osmflow-scan-1",
                "-e",
                "A=1",
                "-e",
                "TARGET=example.com",
                "-v",
                "/tmp/out:/out",
                "-w",
                "/out",
                "projectdiscovery/nuclei:latest",
                "sh",
                "-c",
                "nuclei -u $TARGET",
            ]
        );
    }

    #[test]
    fn test_run_args_minimal() {
        let args = run_args(&RunnerConfig::default(), "c", "alpine:3", "id");
        assert_eq!(args, vec!["run", "--rm", "--name", "c", "alpine:3", "sh", "-c", "id"]);
    }

    #[test]
    fn test_command_program() {
        let cmd = command(Path::new("/usr/bin/podman"), &RunnerConfig::default(), "c", "alpine", "id", None);
        assert_eq!(cmd.get_program(), "/usr/bin/podman");
        assert_eq!(cmd.get_args().count(), 8);
    }

    #[test]
    fn test_container_names_are_unique_and_valid() {
        let first = container_name("http scan/1");
        let second = container_name("http scan/1");
        assert_ne!(first, second);
        assert!(first.starts_with(&format!("osmflow-http-scan-1-{}-", std::process::id())));
        assert!(first
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-')));
    }

    #[test]
    fn test_remove_container_invokes_rm() {
        let dir = tempfile::tempdir().unwrap();
        // `sh rm -f NAME` runs the `rm` script from the working directory.
        std::fs::write(dir.path().join("rm"), "echo \"rm $*\" > calls.log\n").unwrap();

        remove_container(Path::new("sh"), "osmflow-x-1", Some(dir.path()));
        let calls = std::fs::read_to_string(dir.path().join("calls.log")).unwrap();
        assert_eq!(calls.trim(), "rm -f osmflow-x-1");
    }
}
