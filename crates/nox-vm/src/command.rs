//! Running host tools (`virsh`, `qemu-img`, ...) with a deadline.

use crate::error::{Result, VmError};
use std::ffi::OsStr;
use std::time::Duration;
use tokio::process::Command;

/// A host tool invocation bound to a timeout.
#[derive(Debug, Clone)]
pub struct Tool {
    program: String,
    prefix: Vec<String>,
    timeout: Duration,
}

impl Tool {
    /// Create a tool runner.
    ///
    /// `prefix` arguments are inserted before every call, e.g. `["-c",
    /// "qemu:///system"]` for virsh.
    pub fn new(program: impl Into<String>, prefix: Vec<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            prefix,
            timeout,
        }
    }

    /// Program name.
    pub fn program(&self) -> &str {
        &self.program
    }

    /// Run the tool and return its stdout.
    ///
    /// # Errors
    /// `VmError::Timeout` when the deadline passes (the child is killed),
    /// `VmError::Command` on a non-zero exit.
    pub async fn run<I, S>(&self, args: I) -> Result<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.prefix).args(args).kill_on_drop(true);
        tracing::trace!(command = ?cmd, "Running host tool");

        let output = match tokio::time::timeout(self.timeout, cmd.output()).await {
            Ok(result) => result?,
            Err(_) => {
                tracing::warn!(program = %self.program, timeout = ?self.timeout, "Host tool timed out");
                return Err(VmError::Timeout(self.timeout));
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            tracing::debug!(program = %self.program, status = %output.status, stderr = %stderr, "Host tool failed");
            return Err(VmError::Command {
                program: self.program.clone(),
                status: output.status.to_string(),
                stderr,
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_captures_stdout() {
        let tool = Tool::new("echo", vec!["-n".into()], Duration::from_secs(5));
        let out = tool.run(["hello"]).await.unwrap();
        assert_eq!(out, "hello");
    }

    #[tokio::test]
    async fn test_run_nonzero_exit() {
        let tool = Tool::new("sh", vec!["-c".into()], Duration::from_secs(5));
        let err = tool.run(["echo boom >&2; exit 3"]).await.unwrap_err();
        match err {
            VmError::Command { stderr, .. } => assert_eq!(stderr, "boom"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_run_timeout() {
        let tool = Tool::new("sleep", vec![], Duration::from_millis(50));
        let err = tool.run(["5"]).await.unwrap_err();
        assert!(err.is_transient());
    }
}
