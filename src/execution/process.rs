//! Child Process Execution
//!
//! Spawns a prepared command with piped output, waits for it under an
//! optional deadline (`wait-timeout`) and kills its process group when
//! the deadline passes or the command returns.

use std::io::Read;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, warn};
use wait_timeout::ChildExt;

use crate::error::{Result, WorkflowError};

/// Point in time by which a step and all its branches must finish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    at: Instant,
    seconds: u64,
}

impl Deadline {
    pub fn after(seconds: u64) -> Self {
        Self {
            at: Instant::now() + Duration::from_secs(seconds),
            seconds,
        }
    }

    /// The configured budget, for error reporting.
    pub fn seconds(&self) -> u64 {
        self.seconds
    }

    pub fn expired(&self) -> bool {
        Instant::now() >= self.at
    }

    pub fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }

    /// The earlier of this deadline and an optional outer one.
    pub fn tighter(self, outer: Option<Deadline>) -> Deadline {
        match outer {
            Some(outer) if outer.at < self.at => outer,
            _ => self,
        }
    }
}

/// Captured result of a finished child.
#[derive(Debug)]
pub struct ProcessOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

/// Parses a timeout value: plain seconds or a number with an `s`, `m`
/// or `h` suffix.
pub fn parse_timeout(value: &str) -> Option<u64> {
    let value = value.trim();
    let (digits, multiplier) = match value.char_indices().last() {
        Some((i, 's')) => (&value[..i], 1),
        Some((i, 'm')) => (&value[..i], 60),
        Some((i, 'h')) => (&value[..i], 3600),
        _ => (value, 1),
    };
    digits.trim().parse::<u64>().ok().map(|n| n * multiplier)
}

/// Runs a shell command locally with `bash -c`.
pub fn bash_command(shell_command: &str, working_dir: Option<&std::path::Path>) -> Command {
    let mut cmd = Command::new("bash");
    cmd.arg("-c").arg(shell_command);
    if let Some(dir) = working_dir {
        cmd.current_dir(dir);
        debug!("Executing in directory: {}", dir.display());
    }
    cmd
}

fn spawn_reader<R: Read + Send + 'static>(source: Option<R>) -> Receiver<String> {
    let (tx, rx) = channel();
    match source {
        Some(mut stream) => {
            thread::spawn(move || {
                let mut buf = Vec::new();
                if let Err(e) = stream.read_to_end(&mut buf) {
                    warn!("Failed to read child output: {}", e);
                }
                let _ = tx.send(String::from_utf8_lossy(&buf).into_owned());
            });
        }
        None => {
            let _ = tx.send(String::new());
        }
    }
    rx
}

fn timeout(node: &str, deadline: Deadline) -> WorkflowError {
    WorkflowError::Timeout {
        node: node.to_string(),
        seconds: deadline.seconds(),
    }
}

/// Waits for a reader to hit end of file. A process outside the group
/// can keep the pipe open, so the wait is bounded by the deadline.
fn collect(reader: &Receiver<String>, node: &str, deadline: Option<Deadline>) -> Result<String> {
    let Some(deadline) = deadline else {
        return Ok(reader.recv().unwrap_or_default());
    };
    match reader.recv_timeout(deadline.remaining()) {
        Ok(text) => Ok(text),
        Err(RecvTimeoutError::Disconnected) => Ok(String::new()),
        Err(RecvTimeoutError::Timeout) => {
            warn!("'{}': output still open after its {}s timeout", node, deadline.seconds());
            Err(timeout(node, deadline))
        }
    }
}

/// Kills every process left in the group led by `pid`.
fn kill_group(pid: u32) {
    #[cfg(unix)]
    {
        let group = format!("-{}", pid);
        let _ = Command::new("kill")
            .args(["-KILL", "--", group.as_str()])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
    }
    #[cfg(not(unix))]
    let _ = pid;
}

/// Kills the child, the process group it leads, and reaps it.
fn kill_tree(child: &mut Child) {
    kill_group(child.id());
    if let Err(e) = child.kill() {
        debug!("Kill of pid {} failed: {}", child.id(), e);
    }
    let _ = child.wait();
}

/// Spawns `cmd` and waits for it to exit.
///
/// Returns `Timeout` if the deadline passes first, `RunnerFailure` if the
/// command cannot be spawned or exits non-zero. Whatever the outcome,
/// processes left in the child's group are killed before returning.
pub fn run(mut cmd: Command, node: &str, deadline: Option<Deadline>) -> Result<ProcessOutput> {
    if let Some(deadline) = deadline.filter(|d| d.expired()) {
        return Err(timeout(node, deadline));
    }

    cmd.stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::piped());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    let mut child = cmd
        .spawn()
        .map_err(|e| WorkflowError::runner(node, format!("cannot spawn {:?}: {}", cmd.get_program(), e)))?;

    let stdout = spawn_reader(child.stdout.take());
    let stderr = spawn_reader(child.stderr.take());

    let waited = match deadline {
        Some(deadline) => child.wait_timeout(deadline.remaining()),
        None => child.wait().map(Some),
    };

    let status = match (waited, deadline) {
        (Ok(Some(status)), _) => status,
        (Ok(None), Some(deadline)) => {
            warn!("'{}' exceeded its {}s timeout; killing pid {}", node, deadline.seconds(), child.id());
            kill_tree(&mut child);
            return Err(timeout(node, deadline));
        }
        (Ok(None), None) => {
            kill_tree(&mut child);
            return Err(WorkflowError::runner(node, "wait returned without a status"));
        }
        (Err(e), _) => {
            kill_tree(&mut child);
            return Err(WorkflowError::runner(node, format!("wait failed: {}", e)));
        }
    };

    // Background jobs of the command share its group and pipes.
    kill_group(child.id());

    let output = ProcessOutput {
        status,
        stdout: collect(&stdout, node, deadline)?,
        stderr: collect(&stderr, node, deadline)?,
    };

    if output.status.success() {
        return Ok(output);
    }

    let detail = output
        .stderr
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .map(|l| format!(": {}", l.trim()))
        .unwrap_or_default();
    let code = match output.status.code() {
        Some(code) => format!("exit status {}", code),
        None => "terminated by signal".to_string(),
    };
    Err(WorkflowError::runner(node, format!("{}{}", code, detail)))
}
