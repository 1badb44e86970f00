//! External command execution.
//!
//! Everything the provisioner asks of the host (the hypervisor CLI, `tar`)
//! goes through [`CommandRunner`] as an opaque argument vector. The process
//! runner is used in production; [`MockRunner`] records invocations and
//! replays scripted output for tests.

use std::collections::VecDeque;
use std::fmt;
use std::process::Stdio;
use std::sync::Mutex;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, trace};

/// Errors from running an external command.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{command} failed ({status}): {stderr}")]
    Failure {
        command: String,
        status: String,
        stderr: String,
    },
}

/// Captured result of a finished process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, `None` if the process was killed by a signal.
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// A successful run with the given stdout.
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            status: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// A failed run with the given exit code and stderr.
    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            status: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    /// Turn a non-zero exit into [`CommandError::Failure`].
    pub fn ensure_success(self, program: &str, args: &[String]) -> Result<Self, CommandError> {
        if self.success() {
            return Ok(self);
        }
        Err(CommandError::Failure {
            command: render(program, args),
            status: match self.status {
                Some(code) => format!("exit status {code}"),
                None => "terminated by signal".to_string(),
            },
            stderr: self.stderr.trim().to_string(),
        })
    }
}

/// Render an argument vector for logs and error messages.
pub fn render(program: &str, args: &[String]) -> String {
    let mut line = program.to_string();
    for arg in args {
        line.push(' ');
        line.push_str(arg);
    }
    line
}

/// Executes argument vectors.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `program` with `args` to completion and capture its output.
    ///
    /// Only a failure to launch is an error here; the exit status is left
    /// for the caller to judge.
    async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput, CommandError>;
}

/// Runs commands as child processes.
#[derive(Debug, Clone, Default)]
pub struct ProcessRunner;

impl ProcessRunner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput, CommandError> {
        debug!(command = %render(program, args), "Running command");

        let output = tokio::process::Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| CommandError::Spawn {
                program: program.to_string(),
                source,
            })?;

        let output = CommandOutput {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };

        trace!(
            program = %program,
            status = ?output.status,
            stdout_len = output.stdout.len(),
            stderr_len = output.stderr.len(),
            "Command finished"
        );

        Ok(output)
    }
}

/// One recorded call to [`MockRunner`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&render(&self.program, &self.args))
    }
}

type Handler = Box<dyn Fn(&str, &[String]) -> CommandOutput + Send + Sync>;

/// Recording runner for tests and development.
///
/// Answers from the scripted queue first, then from the handler (if any),
/// and otherwise reports success with empty output.
#[derive(Default)]
pub struct MockRunner {
    calls: Mutex<Vec<Invocation>>,
    script: Mutex<VecDeque<CommandOutput>>,
    handler: Option<Handler>,
}

impl MockRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer every unscripted call through `handler`.
    pub fn with_handler<F>(handler: F) -> Self
    where
        F: Fn(&str, &[String]) -> CommandOutput + Send + Sync + 'static,
    {
        Self {
            handler: Some(Box::new(handler)),
            ..Self::default()
        }
    }

    /// Queue the output of the next call.
    pub fn push(&self, output: CommandOutput) -> &Self {
        self.script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(output);
        self
    }

    /// All calls made so far, in order.
    pub fn calls(&self) -> Vec<Invocation> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Calls rendered as command lines.
    pub fn command_lines(&self) -> Vec<String> {
        self.calls().iter().map(ToString::to_string).collect()
    }
}

#[async_trait]
impl CommandRunner for MockRunner {
    async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput, CommandError> {
        debug!(command = %render(program, args), "[MOCK] Running command");

        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Invocation {
                program: program.to_string(),
                args: args.to_vec(),
            });

        let scripted = self
            .script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();

        Ok(match (scripted, &self.handler) {
            (Some(output), _) => output,
            (None, Some(handler)) => handler(program, args),
            (None, None) => CommandOutput::ok(""),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_ensure_success_wraps_failures() {
        let err = CommandOutput::failed(2, "boom\n")
            .ensure_success("tar", &args(&["-x", "-f", "a.tar"]))
            .unwrap_err();

        let message = err.to_string();
        assert!(message.contains("tar -x -f a.tar"));
        assert!(message.contains("exit status 2"));
        assert!(message.contains("boom"));
    }

    #[tokio::test]
    async fn test_mock_runner_replays_script_then_defaults() {
        let runner = MockRunner::new();
        runner.push(CommandOutput::ok("first"));

        let first = runner.run("echo", &args(&["a"])).await.unwrap();
        let second = runner.run("echo", &args(&["b"])).await.unwrap();

        assert_eq!(first.stdout, "first");
        assert!(second.success());
        assert_eq!(second.stdout, "");
        assert_eq!(runner.command_lines(), vec!["echo a", "echo b"]);
    }

    #[tokio::test]
    async fn test_mock_runner_handler() {
        let runner = MockRunner::with_handler(|program, _| CommandOutput::ok(program.to_uppercase()));
        let output = runner.run("tar", &[]).await.unwrap();
        assert_eq!(output.stdout, "TAR");
    }

    #[tokio::test]
    async fn test_process_runner_reports_missing_program() {
        let runner = ProcessRunner::new();
        let err = runner
            .run("definitely-not-a-real-program-vmprov", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::Spawn { .. }));
    }
}
