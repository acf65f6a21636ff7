//! Centralized command execution with consistent error handling.
//!
//! Every external collaborator (tar, dd, mke2fs, mount, chroot, the package
//! helpers, the placement tool) runs through [`Cmd`], so stderr is always
//! captured and a non-zero exit becomes [`BuildError::ExternalTool`].

use anyhow::{Context, Result};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};

use crate::error::BuildError;

/// Result of a command execution.
#[derive(Debug, Clone)]
pub struct CommandResult {
    /// Exit status of the command.
    pub status: ExitStatus,
    /// Captured stdout as a string.
    pub stdout: String,
    /// Captured stderr as a string.
    pub stderr: String,
}

impl CommandResult {
    /// Returns true if the command exited successfully.
    pub fn success(&self) -> bool {
        self.status.success()
    }

    /// Get the exit code, or -1 if terminated by signal.
    pub fn code(&self) -> i32 {
        self.status.code().unwrap_or(-1)
    }

    /// Get stdout, trimmed of whitespace.
    pub fn stdout_trimmed(&self) -> &str {
        self.stdout.trim()
    }

    /// Get stderr, trimmed of whitespace.
    pub fn stderr_trimmed(&self) -> &str {
        self.stderr.trim()
    }
}

/// Builder for configuring command execution.
pub struct Cmd {
    program: String,
    args: Vec<String>,
    current_dir: Option<PathBuf>,
    envs: Vec<(String, String)>,
    input: Option<String>,
    /// Failure is logged instead of returned.
    advisory: bool,
    /// Custom error message prefix.
    error_prefix: Option<String>,
}

impl Cmd {
    /// Create a new command builder.
    pub fn new(program: impl AsRef<str>) -> Self {
        Self {
            program: program.as_ref().to_string(),
            args: Vec::new(),
            current_dir: None,
            envs: Vec::new(),
            input: None,
            advisory: false,
            error_prefix: None,
        }
    }

    /// Add a single argument.
    pub fn arg(mut self, arg: impl AsRef<str>) -> Self {
        self.args.push(arg.as_ref().to_string());
        self
    }

    /// Add multiple arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for arg in args {
            self.args.push(arg.as_ref().to_string());
        }
        self
    }

    /// Add a path as an argument.
    pub fn arg_path(mut self, path: &Path) -> Self {
        self.args.push(path.to_string_lossy().into_owned());
        self
    }

    /// Set the working directory.
    pub fn dir(mut self, dir: &Path) -> Self {
        self.current_dir = Some(dir.to_path_buf());
        self
    }

    /// Set an environment variable for the child only.
    pub fn env(mut self, key: impl AsRef<str>, value: impl AsRef<str>) -> Self {
        self.envs
            .push((key.as_ref().to_string(), value.as_ref().to_string()));
        self
    }

    /// Feed `input` to the child's stdin.
    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.input = Some(input.into());
        self
    }

    /// Log a non-zero exit as a warning and carry on.
    pub fn advisory(mut self) -> Self {
        self.advisory = true;
        self
    }

    /// Set a custom error message prefix.
    pub fn error_msg(mut self, msg: impl AsRef<str>) -> Self {
        self.error_prefix = Some(msg.as_ref().to_string());
        self
    }

    /// Program and arguments as one line, for logs.
    pub fn describe(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        if let Some(ref dir) = self.current_dir {
            cmd.current_dir(dir);
        }
        for (key, value) in &self.envs {
            cmd.env(key, value);
        }
        cmd
    }

    fn failure(&self, code: i32, stderr: &str) -> BuildError {
        BuildError::ExternalTool {
            program: self.program.clone(),
            message: self
                .error_prefix
                .clone()
                .unwrap_or_else(|| format!("'{}' failed", self.program)),
            code,
            stderr: stderr.to_string(),
        }
    }

    /// Run the command and capture output.
    pub fn run(self) -> Result<CommandResult> {
        tracing::debug!("exec: {}", self.describe());
        let mut cmd = self.command();
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.stdin(if self.input.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });

        let mut child = cmd
            .spawn()
            .with_context(|| format!("Failed to execute '{}'. Is it installed?", self.program))?;

        if let Some(ref input) = self.input {
            if let Some(mut pipe) = child.stdin.take() {
                pipe.write_all(input.as_bytes())
                    .with_context(|| format!("Failed to write stdin of '{}'", self.program))?;
            }
        }

        let output = child
            .wait_with_output()
            .with_context(|| format!("Failed to wait for '{}'", self.program))?;

        let result = CommandResult {
            status: output.status,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };

        if !result.success() {
            let err = self.failure(result.code(), &result.stderr);
            if self.advisory {
                tracing::warn!("{} (ignored)", err);
            } else {
                return Err(err.into());
            }
        }

        Ok(result)
    }

    /// Run the command with inherited stdio.
    ///
    /// Output goes directly to the terminal. Used for package installation and
    /// user scripts, where progress matters more than capture.
    pub fn run_interactive(self) -> Result<ExitStatus> {
        tracing::debug!("exec (interactive): {}", self.describe());
        let mut cmd = self.command();
        cmd.stdin(Stdio::inherit());
        cmd.stdout(Stdio::inherit());
        cmd.stderr(Stdio::inherit());

        let status = cmd
            .status()
            .with_context(|| format!("Failed to execute '{}'. Is it installed?", self.program))?;

        if !status.success() {
            let err = self.failure(status.code().unwrap_or(-1), "");
            if self.advisory {
                tracing::warn!("{} (ignored)", err);
            } else {
                return Err(err.into());
            }
        }

        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_success() {
        let result = Cmd::new("echo").arg("hello").run().unwrap();
        assert!(result.success());
        assert_eq!(result.stdout_trimmed(), "hello");
    }

    #[test]
    fn test_failure_is_external_tool_error() {
        let err = Cmd::new("ls").arg("/nonexistent_path_12345").run().unwrap_err();
        match err.downcast_ref::<BuildError>() {
            Some(BuildError::ExternalTool { program, stderr, .. }) => {
                assert_eq!(program, "ls");
                assert!(!stderr.is_empty());
            }
            other => panic!("unexpected error class: {:?}", other),
        }
    }

    #[test]
    fn test_advisory_failure_returns_result() {
        let result = Cmd::new("false").advisory().run().unwrap();
        assert!(!result.success());
        assert_eq!(result.code(), 1);
    }

    #[test]
    fn test_stdin_is_fed() {
        let result = Cmd::new("cat").stdin("user:secret\n").run().unwrap();
        assert_eq!(result.stdout, "user:secret\n");
    }

    #[test]
    fn test_env_is_scoped_to_child() {
        let result = Cmd::new("sh")
            .args(["-c", "echo $LAYERFS_PROCESS_TEST"])
            .env("LAYERFS_PROCESS_TEST", "scoped")
            .run()
            .unwrap();
        assert_eq!(result.stdout_trimmed(), "scoped");
    }

    #[test]
    fn test_custom_error_message() {
        let err = Cmd::new("false")
            .error_msg("mke2fs step failed")
            .run()
            .unwrap_err();
        assert!(err.to_string().contains("mke2fs step failed"));
    }

    #[test]
    fn test_run_in_directory() {
        let result = Cmd::new("pwd").dir(Path::new("/tmp")).run().unwrap();
        assert!(result.stdout_trimmed().contains("tmp"));
    }

    #[test]
    fn test_describe() {
        let cmd = Cmd::new("tar").args(["-C", "/t", "-xf"]).arg_path(Path::new("/b.tar"));
        assert_eq!(cmd.describe(), "tar -C /t -xf /b.tar");
    }
}
