//! External command execution.
//!
//! Provisioning shells out to host tooling (`ip`, `virsh`, `qemu-img`,
//! `cloud-localds`, `virt-install`). Every invocation goes through [`run`] so
//! failures carry the attempted command line and its captured output.
//!
//! No timeout is imposed: a slow tool blocks its caller until it exits.

use std::process::{ExitStatus, Stdio};

use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, error};

/// Errors from running an external command.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` exited with {status}: {output}")]
    Failed {
        command: String,
        status: ExitStatus,
        output: String,
    },
}

impl CommandError {
    /// The command line that was attempted.
    pub fn command(&self) -> &str {
        match self {
            CommandError::Spawn { command, .. } | CommandError::Failed { command, .. } => command,
        }
    }

    /// Captured stderr (or stdout when stderr was empty) of a failed command.
    pub fn output(&self) -> Option<&str> {
        match self {
            CommandError::Failed { output, .. } => Some(output),
            CommandError::Spawn { .. } => None,
        }
    }
}

/// Render a command line for logs and errors.
pub fn command_line<S: AsRef<str>>(program: &str, args: &[S]) -> String {
    let mut line = program.to_string();
    for arg in args {
        line.push(' ');
        line.push_str(arg.as_ref());
    }
    line
}

/// Run a command to completion and return its stdout.
///
/// A non-zero exit status is an error carrying the command line and output.
pub async fn run<S: AsRef<str>>(program: &str, args: &[S]) -> Result<String, CommandError> {
    let line = command_line(program, args);
    debug!(command = %line, "Running command");

    let output = Command::new(program)
        .args(args.iter().map(AsRef::as_ref))
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|source| CommandError::Spawn {
            command: line.clone(),
            source,
        })?;

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let captured = if stderr.trim().is_empty() {
            stdout.trim().to_string()
        } else {
            stderr.trim().to_string()
        };
        error!(
            command = %line,
            status = %output.status,
            output = %captured,
            "Command failed"
        );
        return Err(CommandError::Failed {
            command: line,
            status: output.status,
            output: captured,
        });
    }

    Ok(stdout)
}

/// Run a command whose failure is acceptable (cleanup of possibly-absent
/// resources). Returns whether it succeeded.
pub async fn run_best_effort<S: AsRef<str>>(program: &str, args: &[S]) -> bool {
    let line = command_line(program, args);
    match Command::new(program)
        .args(args.iter().map(AsRef::as_ref))
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
    {
        Ok(status) => {
            debug!(command = %line, status = %status, "Best-effort command finished");
            status.success()
        }
        Err(e) => {
            debug!(command = %line, error = %e, "Best-effort command could not start");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_line() {
        assert_eq!(
            command_line("ip", &["link", "del", "vbr3"]),
            "ip link del vbr3"
        );
        assert_eq!(command_line::<&str>("true", &[]), "true");
    }

    #[tokio::test]
    async fn test_run_captures_stdout() {
        let out = run("sh", &["-c", "echo hello"]).await.unwrap();
        assert_eq!(out.trim(), "hello");
    }

    #[tokio::test]
    async fn test_run_failure_carries_command_and_output() {
        let err = run("sh", &["-c", "echo boom >&2; exit 3"]).await.unwrap_err();
        assert_eq!(err.command(), "sh -c echo boom >&2; exit 3");
        assert_eq!(err.output(), Some("boom"));
    }

    #[tokio::test]
    async fn test_run_missing_program() {
        let err = run::<&str>("/nonexistent/vmfleet-tool", &[]).await.unwrap_err();
        assert!(matches!(err, CommandError::Spawn { .. }));
    }

    #[tokio::test]
    async fn test_best_effort() {
        assert!(run_best_effort::<&str>("true", &[]).await);
        assert!(!run_best_effort::<&str>("false", &[]).await);
    }
}
