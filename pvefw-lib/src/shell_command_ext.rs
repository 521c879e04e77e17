use thiserror::Error;

use std::io::{self, Write};
use std::process::{Command, Output, Stdio};

#[derive(Debug, Error)]
pub enum Error {
    #[error("Command execution failed")]
    CommandFailed,
    #[error("IO error: {0}")]
    IO(#[from] io::Error),
}

/// log errors and warnings or suppress them
#[derive(Clone, Copy, Debug)]
pub enum Logs {
    Print,
    Suppress,
}

pub trait ShellCommandExt {
    fn run(&mut self, logs: Logs) -> Result<(), Error>;
    fn run_stdout(&mut self, logs: Logs) -> Result<String, Error>;
    fn run_stdin(&mut self, input: &str, logs: Logs) -> Result<(), Error>;
    fn run_success(&mut self) -> Result<bool, Error>;
}

impl ShellCommandExt for Command {
    /// Run the command and print stderr with a warning on success.
    /// Unconditionally captures stdout and stderr regardless of command settings.
    fn run(&mut self, logs: Logs) -> Result<(), Error> {
        let output = self.output()?;
        let stderr_empty = output.stderr.is_empty();
        match (stderr_empty, output.status) {
            (true, status) if status.success() => Ok(()),
            (false, status) if status.success() => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                if matches!(logs, Logs::Print) {
                    tracing::warn!(cmd = ?self, %stderr, "Non empty stderr on successful command");
                }
                Ok(())
            }
            (_, status) => {
                let stdout = String::from_utf8_lossy(&output.stdout);
                let stderr = String::from_utf8_lossy(&output.stderr);
                if matches!(logs, Logs::Print) {
                    tracing::error!(cmd = ?self, status_code = ?status.code(), %stdout, %stderr, "Error executing command");
                }
                Err(Error::CommandFailed)
            }
        }
    }

    fn run_stdout(&mut self, logs: Logs) -> Result<String, Error> {
        let output = self.output()?;
        let cmd_debug = format!("{:?}", self);
        stdout_from_output(cmd_debug, output, logs)
    }

    /// Run the command with `input` piped to its stdin.
    fn run_stdin(&mut self, input: &str, logs: Logs) -> Result<(), Error> {
        let mut child = self
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(input.as_bytes())?;
        }
        let output = child.wait_with_output()?;
        match (output.stderr.is_empty(), output.status) {
            (true, status) if status.success() => Ok(()),
            (false, status) if status.success() => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                if matches!(logs, Logs::Print) {
                    tracing::warn!(cmd = ?self, %stderr, "Non empty stderr on successful command");
                }
                Ok(())
            }
            (_, status) => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                if matches!(logs, Logs::Print) {
                    tracing::error!(cmd = ?self, status_code = ?status.code(), %stderr, "Error executing command");
                }
                Err(Error::CommandFailed)
            }
        }
    }

    /// Run the command for its exit status alone, output suppressed.
    fn run_success(&mut self) -> Result<bool, Error> {
        let output = self.stdout(Stdio::null()).stderr(Stdio::null()).output()?;
        Ok(output.status.success())
    }
}

pub fn stdout_from_output(cmd: String, output: Output, logs: Logs) -> Result<String, Error> {
    let stderr_empty = output.stderr.is_empty();
    let stdout = String::from_utf8_lossy(&output.stdout);
    match (stderr_empty, output.status) {
        (true, status) if status.success() => Ok(stdout.to_string()),
        (false, status) if status.success() => {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if matches!(logs, Logs::Print) {
                tracing::warn!(cmd, %stderr, "Non empty stderr on successful command");
            }
            Ok(stdout.to_string())
        }
        (_, status) => {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if matches!(logs, Logs::Print) {
                tracing::error!(cmd, status_code = ?status.code(), %stdout, %stderr, "Error executing command");
            }
            Err(Error::CommandFailed)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_stdout_captures_command_output() -> anyhow::Result<()> {
        let out = Command::new("echo").arg("hello").run_stdout(Logs::Suppress)?;
        assert_eq!(out.trim(), "hello");
        Ok(())
    }

    #[test]
    fn failing_commands_report_command_failed() {
        let res = Command::new("false").run(Logs::Suppress);
        assert!(matches!(res, Err(Error::CommandFailed)));
    }

    #[test]
    fn run_success_reports_the_exit_status() -> anyhow::Result<()> {
        assert!(Command::new("true").run_success()?);
        assert!(!Command::new("false").run_success()?);
        Ok(())
    }

    #[test]
    fn run_stdin_pipes_input_through() -> anyhow::Result<()> {
        Command::new("grep").arg("needle").run_stdin("hay\nneedle\n", Logs::Suppress)?;
        assert!(matches!(
            Command::new("grep").arg("needle").run_stdin("hay\n", Logs::Suppress),
            Err(Error::CommandFailed)
        ));
        Ok(())
    }
}
