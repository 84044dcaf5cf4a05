//! External command execution
//!
//! [`CommandRunner`] is how the image locator reaches the release server
//! (`ssh` listings, `scp` copies). [`ProcessRunner`] spawns real processes;
//! tests use [`crate::testing::ScriptedRunner`].

use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::error::{DeviceError, Result};

/// Executes a program and returns its standard output
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, program: &str, args: &[String]) -> Result<String>;
}

/// Runner that spawns child processes
///
/// With a password set, every command runs under `sshpass -e` and the
/// password is handed over in the `SSHPASS` environment variable, so it never
/// shows up in the process list.
#[derive(Debug, Clone, Default)]
pub struct ProcessRunner {
    password: Option<String>,
}

impl ProcessRunner {
    pub fn new(password: Option<String>) -> Self {
        Self { password }
    }

    fn command(&self, program: &str, args: &[String]) -> Command {
        match &self.password {
            Some(password) => {
                let mut command = Command::new("sshpass");
                command
                    .arg("-e")
                    .arg(program)
                    .args(args)
                    .env("SSHPASS", password);
                command
            }
            None => {
                let mut command = Command::new(program);
                command.args(args);
                command
            }
        }
    }
}

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, program: &str, args: &[String]) -> Result<String> {
        debug!("Running {} {}", program, args.join(" "));
        let output = self
            .command(program, args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| DeviceError::Command(format!("failed to execute {}: {}", program, e)))?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).to_string())
        } else {
            Err(DeviceError::Command(format!(
                "{} exited with {}: {}",
                program,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_password_wraps_with_sshpass() {
        let runner = ProcessRunner::new(Some("pw".into()));
        let command = runner.command("scp", &["a".to_string(), "b".to_string()]);
        let std = command.as_std();
        assert_eq!(std.get_program(), "sshpass");
        let args: Vec<_> = std.get_args().collect();
        assert_eq!(args, ["-e", "scp", "a", "b"]);
    }

    #[test]
    fn test_no_password_runs_directly() {
        let runner = ProcessRunner::default();
        let command = runner.command("ssh", &["host".to_string()]);
        assert_eq!(command.as_std().get_program(), "ssh");
    }

    #[tokio::test]
    async fn test_failing_command_is_an_error() {
        let runner = ProcessRunner::default();
        let err = runner.run("false", &[]).await.unwrap_err();
        assert!(matches!(err, DeviceError::Command(_)));
    }
}
